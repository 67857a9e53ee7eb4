//! The tokenizer/compiler itself: a hand-written left-to-right pass that
//! alternates key and value positions, building a SQL fragment and its bind
//! list directly (`SPEC_FULL.md` §4.5.3). This mirrors the reference
//! implementation's single pass exactly, including the lowercasing rewrite,
//! rather than building an intermediate tree first — the grammar has no
//! nested predicate structure beyond the boolean keywords themselves, which
//! are passed through as literal SQL text the same way `(`, `and`, `or`,
//! `not` are valid in both the query language and the generated SQL.

use regex::Regex;
use std::sync::OnceLock;

use crate::error::Pebkac;

use super::{Bind, CompiledQuery};

const KEYWORDS: &[(&str, bool)] = &[
    ("(", true),
    (")", true),
    ("and ", true),
    ("or ", true),
    ("not ", true),
    ("==", false),
    ("=", false),
    ("!=", false),
    (">", false),
    (">=", false),
    ("<", false),
    ("<=", false),
    ("like ", false),
];

fn tag_key_pattern() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^\.?[a-z_-]+$").unwrap())
}

fn lowercase_rewrite_pattern() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r" (mt\.v) ([=<!>]+) \? \) $").unwrap())
}

fn has_alpha(s: &str) -> bool {
    s.chars().any(|c| c.is_alphabetic())
}

struct Compiler<'a> {
    rest: &'a str,
    q: String,
    binds: Vec<Bind>,
    have_up: bool,
    have_mt: bool,
}

/// Compiles a query string into a [`CompiledQuery`]. Returns
/// `Pebkac(400, ...)` for an unknown key; other malformed input (e.g. a
/// non-numeric `size` value) returns `Pebkac(500, ...)`, matching the
/// reference implementation's "any uncaught exception during compilation
/// becomes a 500" behavior.
pub fn compile(input: &str) -> Result<CompiledQuery, Pebkac> {
    let mut c = Compiler { rest: input, q: String::new(), binds: Vec::new(), have_up: false, have_mt: false };
    c.run()?;
    Ok(CompiledQuery { sql: c.q, binds: c.binds, have_up: c.have_up, have_mt: c.have_mt })
}

enum PendingValue {
    Plain,
    Size,
    Date,
}

impl<'a> Compiler<'a> {
    fn run(&mut self) -> Result<(), Pebkac> {
        let mut is_key = true;
        let mut pending: PendingValue = PendingValue::Plain;
        let mut field_end = String::new();

        loop {
            self.rest = self.rest.trim();
            if self.rest.is_empty() {
                break;
            }

            if let Some((kw, kw_is_key)) = KEYWORDS.iter().find(|(kw, _)| self.rest.starts_with(kw)) {
                is_key = *kw_is_key;
                self.rest = &self.rest[kw.len()..];
                self.q.push_str(kw);
                continue;
            }

            let value = self.take_token()?;

            if is_key {
                is_key = false;
                let (field_sql, next_pending, next_field_end) = self.compile_key(&value)?;
                self.q.push_str(&field_sql);
                self.q.push(' ');
                pending = next_pending;
                field_end = next_field_end;
                continue;
            }

            self.compile_value(&value, &pending)?;
            is_key = true;

            if !field_end.is_empty() {
                self.q.push_str(&field_end);
                field_end.clear();
            }

            self.apply_lowercase_rewrite();
        }

        Ok(())
    }

    fn take_token(&mut self) -> Result<String, Pebkac> {
        if let Some(after_quote) = self.rest.strip_prefix('"') {
            let mut parts = after_quote.splitn(2, '"');
            let mut v = parts.next().unwrap_or("").to_string();
            let mut remaining =
                parts.next().ok_or_else(|| Pebkac::bad_request("unterminated quoted value"))?;
            while v.ends_with('\\') {
                let mut parts2 = remaining.splitn(2, '"');
                let v2 = parts2.next().unwrap_or("");
                let after =
                    parts2.next().ok_or_else(|| Pebkac::bad_request("unterminated quoted value"))?;
                v.pop();
                v.push('"');
                v.push_str(v2);
                remaining = after;
            }
            self.rest = remaining.trim_start();
            Ok(v)
        } else {
            match self.rest.find(char::is_whitespace) {
                Some(i) => {
                    let v = self.rest[..i].replace("\\\"", "\"");
                    self.rest = self.rest[i..].trim_start();
                    Ok(v)
                }
                None => {
                    let v = self.rest.replace("\\\"", "\"");
                    self.rest = "";
                    Ok(v)
                }
            }
        }
    }

    fn compile_key(&mut self, key: &str) -> Result<(String, PendingValue, String), Pebkac> {
        match key {
            "size" => {
                self.have_up = true;
                Ok(("up.sz".to_string(), PendingValue::Size, String::new()))
            }
            "date" => {
                self.have_up = true;
                Ok(("up.mt".to_string(), PendingValue::Date, String::new()))
            }
            "path" => {
                self.have_up = true;
                self.binds.push(Bind::VolumeSentinel);
                Ok(("trim(?||up.rd,'/')".to_string(), PendingValue::Plain, String::new()))
            }
            "name" => {
                self.have_up = true;
                Ok(("up.fn".to_string(), PendingValue::Plain, String::new()))
            }
            "tags" => {
                self.have_mt = true;
                Ok((
                    "exists(select 1 from mt where mt.w = mtw and mt.v".to_string(),
                    PendingValue::Plain,
                    ") ".to_string(),
                ))
            }
            k if tag_key_pattern().is_match(k) => {
                self.have_mt = true;
                Ok((
                    format!("exists(select 1 from mt where mt.w = mtw and +mt.k = '{k}' and mt.v"),
                    PendingValue::Plain,
                    ") ".to_string(),
                ))
            }
            other => Err(Pebkac::bad_request(format!("invalid key [{other}]"))),
        }
    }

    fn compile_value(&mut self, raw: &str, pending: &PendingValue) -> Result<(), Pebkac> {
        let mut head = "";
        let mut tail = "";

        let bind = match pending {
            PendingValue::Date => {
                let collapsed = collapse_date_punctuation(raw);
                match parse_date(&collapsed) {
                    Some(epoch) => Bind::Int(epoch),
                    None => Bind::Str(collapsed),
                }
            }
            PendingValue::Size => {
                let mib: f64 = raw
                    .parse()
                    .map_err(|_| Pebkac::internal(format!("invalid size value: {raw:?}")))?;
                Bind::Int((mib * 1024.0 * 1024.0) as i64)
            }
            PendingValue::Plain => {
                let mut v = raw;
                if let Some(stripped) = v.strip_prefix('*') {
                    head = "'%'||";
                    v = stripped;
                }
                if let Some(stripped) = v.strip_suffix('*') {
                    tail = "||'%'";
                    v = stripped;
                }
                Bind::Str(v.to_string())
            }
        };

        self.q.push_str(&format!(" {head}?{tail} "));
        self.binds.push(bind);
        Ok(())
    }

    /// Post-hoc rewrite: for a tag-value comparison (`mt.v OP ?`) whose raw
    /// value contains an alphabetic character, fold case on both sides;
    /// `=`/`==` becomes `LIKE` to keep wildcard composition meaningful.
    /// Only triggers when the tail matches exactly (no wildcard wrapping,
    /// `SPEC_FULL.md` §9 open question: middle `*` is preserved literally
    /// and never reaches this rewrite either, since it still binds as a
    /// single plain `?` slot here).
    fn apply_lowercase_rewrite(&mut self) {
        let Some(m) = lowercase_rewrite_pattern().find(&self.q.clone()) else { return };
        let caps = lowercase_rewrite_pattern().captures(&self.q).unwrap();
        let field = caps.get(1).unwrap().as_str().to_string();
        let op = caps.get(2).unwrap().as_str().to_string();

        let Some(Bind::Str(raw_value)) = self.binds.last() else { return };
        if !has_alpha(raw_value) {
            return;
        }

        let lowered = raw_value.to_lowercase();
        *self.binds.last_mut().unwrap() = Bind::Str(lowered);

        self.q.truncate(m.start());
        if op == "=" || op == "==" {
            self.q.push_str(&format!(" {field} like ? ) "));
        } else {
            self.q.push_str(&format!(" lower({field}) {op} ? ) "));
        }
    }
}

fn collapse_date_punctuation(v: &str) -> String {
    static RE: OnceLock<Regex> = OnceLock::new();
    let re = RE.get_or_init(|| Regex::new(r"[tzTZ, ]+").unwrap());
    re.replace_all(v, " ").trim().to_string()
}

fn parse_date(v: &str) -> Option<i64> {
    use chrono::{NaiveDate, NaiveDateTime};

    let formats = ["%Y-%m-%d %H:%M:%S", "%Y-%m-%d %H:%M", "%Y-%m-%d %H", "%Y-%m-%d"];

    for fmt in formats {
        if let Ok(dt) = NaiveDateTime::parse_from_str(v, fmt) {
            return Some(dt.and_utc().timestamp());
        }
        if let Ok(d) = NaiveDate::parse_from_str(v, fmt) {
            return Some(d.and_hms_opt(0, 0, 0)?.and_utc().timestamp());
        }
    }

    // `%Y-%m` and `%Y` have no day field, which `NaiveDate::parse_from_str`
    // requires; parse the numeric parts directly and default the missing
    // month/day to 1, the way `time.strptime` leaves them.
    if let Ok(dt) = NaiveDate::parse_from_str(&format!("{v}-01"), "%Y-%m-%d") {
        return Some(dt.and_hms_opt(0, 0, 0)?.and_utc().timestamp());
    }
    if let Ok(y) = v.parse::<i32>() {
        let d = NaiveDate::from_ymd_opt(y, 1, 1)?;
        return Some(d.and_hms_opt(0, 0, 0)?.and_utc().timestamp());
    }

    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_key_is_a_client_error() {
        let err = compile("bogus = 1").unwrap_err();
        assert_eq!(err.code, 400);
    }

    #[test]
    fn name_wildcard_wraps_bound_value() {
        let c = compile("name = *foo*").unwrap();
        assert!(c.sql.contains("'%'||?||'%'"));
        assert_eq!(c.binds, vec![Bind::Str("foo".to_string())]);
    }

    #[test]
    fn tag_scoped_case_fold_rewrites_equality_to_like() {
        let c = compile(r#"artist = "The Beatles""#).unwrap();
        assert!(c.sql.contains("lower(mt.v)") == false); // '=' path uses bare 'like', not lower()
        assert!(c.sql.contains("mt.v like ?"));
        assert_eq!(c.binds, vec![Bind::Str("the beatles".to_string())]);
        assert!(c.have_mt);
    }

    #[test]
    fn tag_scoped_ordering_operator_lowercases_field_and_value() {
        let c = compile(r#"artist > "The Beatles""#).unwrap();
        assert!(c.sql.contains("lower(mt.v) > ?"));
        assert_eq!(c.binds, vec![Bind::Str("the beatles".to_string())]);
    }

    #[test]
    fn numeric_tag_value_is_not_case_folded() {
        let c = compile("track = 5").unwrap();
        assert_eq!(c.binds, vec![Bind::Str("5".to_string())]);
        assert!(c.sql.contains("mt.v = ?") || c.sql.contains("mt.v =?"));
    }

    #[test]
    fn date_range_compiles_to_epoch_comparison() {
        let c = compile(r#"date >= "2024-01""#).unwrap();
        assert!(c.have_up);
        assert_eq!(c.binds.len(), 1);
        assert!(matches!(c.binds[0], Bind::Int(_)));
    }

    #[test]
    fn bare_year_compiles_to_jan_1_epoch() {
        let c = compile(r#"date >= "2024""#).unwrap();
        assert_eq!(c.binds, vec![Bind::Int(parse_date("2024-01-01").unwrap())]);
    }

    #[test]
    fn size_is_converted_from_mib() {
        let c = compile("size > 2").unwrap();
        assert_eq!(c.binds, vec![Bind::Int(2 * 1024 * 1024)]);
    }

    #[test]
    fn path_key_binds_the_volume_sentinel() {
        let c = compile(r#"path = "foo""#).unwrap();
        assert_eq!(c.binds[0], Bind::VolumeSentinel);
        assert_eq!(c.binds[1], Bind::Str("foo".to_string()));
    }

    #[test]
    fn boolean_keywords_pass_through_as_sql() {
        let c = compile(r#"name = "a" and not ( name = "b" )"#).unwrap();
        assert!(c.sql.contains(" and "));
        assert!(c.sql.contains("not ("));
    }
}
