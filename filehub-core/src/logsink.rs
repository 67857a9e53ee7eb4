//! Serialized, timestamped log sink with day-banner rotation and an
//! ANSI-stripped file sink (`SPEC_FULL.md` §4.1).
//!
//! All writes go through one [`parking_lot::Mutex`], so interleaving of
//! lines from concurrent producers is well-defined: a line is either fully
//! written or not written at all, never interleaved with another producer's
//! line.

use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::path::PathBuf;

use chrono::{DateTime, Datelike, TimeZone, Utc};
use parking_lot::Mutex;

/// Color/ANSI hint for a log line. `Ansi` carries a raw escape prefix that is
/// emitted to stdout and stripped before the file sink; `Palette` indexes a
/// caller-defined palette (interpretation is the caller's responsibility,
/// `LogSink` only threads the index through); `None` emits no color.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Color {
    None,
    Palette(u8),
    Ansi(&'static str),
}

const ANSI_RESET: &str = "\x1b[0m";

fn strip_ansi(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    let mut chars = s.chars().peekable();
    while let Some(c) = chars.next() {
        if c == '\x1b' {
            // ESC [ ... final-byte (0x40..=0x7E); consume through the final byte.
            if chars.peek() == Some(&'[') {
                chars.next();
                for c2 in chars.by_ref() {
                    if ('\x40'..='\x7e').contains(&c2) {
                        break;
                    }
                }
            }
            continue;
        }
        out.push(c);
    }
    out
}

fn next_midnight_after(t: DateTime<Utc>) -> DateTime<Utc> {
    let d = t.date_naive().succ_opt().expect("date arithmetic in range");
    Utc.from_utc_datetime(&d.and_hms_opt(0, 0, 0).expect("midnight is valid"))
}

struct RotatingFile {
    /// Name template, e.g. `cpp-%Y-%m%d-%H%M%S.txt`; `None` if file logging
    /// is disabled entirely.
    template: Option<String>,
    rendered_name: String,
    file: Option<File>,
    dir: PathBuf,
}

impl RotatingFile {
    fn new(dir: PathBuf, template: Option<String>) -> Self {
        RotatingFile { template, rendered_name: String::new(), file: None, dir }
    }

    fn has_date_tokens(tpl: &str) -> bool {
        ["%Y", "%m", "%d", "%H", "%M", "%S"].iter().any(|t| tpl.contains(t))
    }

    /// Ensures the backing file matches what `now` would render from the
    /// template, rotating (closing the old file, opening a new one, with a
    /// `.N` collision counter) if the rendered name changed.
    fn ensure_current(&mut self, now: DateTime<Utc>) -> io::Result<()> {
        let Some(tpl) = self.template.clone() else {
            return Ok(());
        };
        let rendered = now.format(&tpl).to_string();
        if self.file.is_some() && rendered == self.rendered_name {
            return Ok(());
        }
        let base = self.dir.join(&rendered);
        let path = if !Self::has_date_tokens(&tpl) {
            base
        } else {
            self.pick_unique_path(&base)?
        };
        let f = OpenOptions::new().create(true).append(true).open(&path)?;
        self.file = Some(f);
        self.rendered_name = rendered;
        Ok(())
    }

    fn pick_unique_path(&self, base: &PathBuf) -> io::Result<PathBuf> {
        if !base.exists() {
            return Ok(base.clone());
        }
        for n in 1u32.. {
            let candidate = base.with_file_name(format!(
                "{}.{}",
                base.file_name().and_then(|s| s.to_str()).unwrap_or("log"),
                n
            ));
            if !candidate.exists() {
                return Ok(candidate);
            }
        }
        unreachable!("u32 collision space exhausted")
    }

    fn write_line(&mut self, now: DateTime<Utc>, line: &str) -> io::Result<()> {
        if self.template.is_none() {
            return Ok(());
        }
        self.ensure_current(now)?;
        if let Some(f) = self.file.as_mut() {
            writeln!(f, "{}", strip_ansi(line))?;
            f.flush()?;
        }
        Ok(())
    }
}

struct State {
    next_day: DateTime<Utc>,
    file: RotatingFile,
}

/// The process-wide log sink. `enabled = false` means *disabled mode*:
/// writes only reach the file sink, never stdout (used for e.g. daemonized
/// or `--quiet` runs).
pub struct LogSink {
    enabled: bool,
    state: Mutex<State>,
}

impl LogSink {
    pub fn new(enabled: bool, log_dir: PathBuf, file_template: Option<String>) -> Self {
        let now = Utc::now();
        LogSink {
            enabled,
            state: Mutex::new(State {
                next_day: next_midnight_after(now),
                file: RotatingFile::new(log_dir, file_template),
            }),
        }
    }

    /// Emits one log line. Never panics or aborts the caller; write errors
    /// other than a broken pipe on stdout are returned so the caller can
    /// decide whether to escalate (`SPEC_FULL.md` §7: only non-EPIPE stdout
    /// errors propagate).
    pub fn log(&self, source: &str, message: &str, color: Color) -> io::Result<()> {
        let mut st = self.state.lock();
        let now = Utc::now();

        if now >= st.next_day {
            let banner = format!("{}", now.format("@ %Y-%m-%d"));
            self.emit(&mut st, now, "sys", &banner, Color::None)?;
            st.next_day = next_midnight_after(now);
        }

        self.emit(&mut st, now, source, message, color)
    }

    fn emit(
        &self,
        st: &mut State,
        now: DateTime<Utc>,
        source: &str,
        message: &str,
        color: Color,
    ) -> io::Result<()> {
        let ts = now.format("%Y-%m-%d %H:%M:%S%.3f");
        let plain = format!("{ts} {source:<24} {message}");

        st.file.write_line(now, &plain)?;

        if !self.enabled {
            return Ok(());
        }

        let colored = match color {
            Color::None => plain.clone(),
            Color::Palette(idx) => format!("\x1b[{}m{plain}{ANSI_RESET}", 30 + (idx % 8)),
            Color::Ansi(prefix) => format!("{prefix}{plain}{ANSI_RESET}"),
        };

        self.write_stdout(&colored)
    }

    fn write_stdout(&self, line: &str) -> io::Result<()> {
        let stdout = io::stdout();
        let mut lock = stdout.lock();
        match writeln!(lock, "{line}") {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::BrokenPipe => Ok(()),
            Err(_) => {
                // Degrade: re-encode lossily as UTF-8 (line is already valid
                // UTF-8 in Rust, so this step is a no-op in practice but kept
                // to preserve the documented fallback chain), then as ASCII.
                let utf8_lossy = String::from_utf8_lossy(line.as_bytes()).into_owned();
                match writeln!(lock, "{utf8_lossy}") {
                    Ok(()) => Ok(()),
                    Err(e) if e.kind() == io::ErrorKind::BrokenPipe => Ok(()),
                    Err(_) => {
                        let ascii: String = line
                            .chars()
                            .map(|c| if c.is_ascii() { c } else { '?' })
                            .collect();
                        match writeln!(lock, "{ascii}") {
                            Ok(()) => Ok(()),
                            Err(e) if e.kind() == io::ErrorKind::BrokenPipe => Ok(()),
                            Err(e) => Err(e),
                        }
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strips_ansi_escapes() {
        assert_eq!(strip_ansi("\x1b[31mred\x1b[0m"), "red");
        assert_eq!(strip_ansi("plain"), "plain");
    }

    #[test]
    fn next_midnight_is_strictly_after() {
        let now = Utc.with_ymd_and_hms(2026, 7, 28, 23, 59, 59).unwrap();
        let next = next_midnight_after(now);
        assert!(next > now);
        assert_eq!(next.hour(), 0);
        assert_eq!(next.minute(), 0);
    }

    use chrono::Timelike;

    #[test]
    fn rotation_template_without_date_tokens_is_stable() {
        let dir = tempfile::tempdir().unwrap();
        let mut rf = RotatingFile::new(dir.path().to_path_buf(), Some("fixed.log".into()));
        let t0 = Utc::now();
        rf.ensure_current(t0).unwrap();
        let name0 = rf.rendered_name.clone();
        rf.ensure_current(t0 + chrono::Duration::days(1)).unwrap();
        assert_eq!(name0, rf.rendered_name);
    }

    #[test]
    fn log_writes_to_file_sink_when_disabled() {
        let dir = tempfile::tempdir().unwrap();
        let sink = LogSink::new(false, dir.path().to_path_buf(), Some("test.log".into()));
        sink.log("u2idx", "hello", Color::None).unwrap();
        let contents = std::fs::read_to_string(dir.path().join("test.log")).unwrap();
        assert!(contents.contains("hello"));
    }
}
