//! Configuration snapshot normalization (`SPEC_FULL.md` §6.1). This is the
//! first thing `SvcHub`'s constructor does, and it runs exactly once over an
//! otherwise-immutable parsed configuration.

use std::collections::BTreeSet;

use crate::error::ConfigError;

/// The options a caller (CLI parsing, file loading — both out of scope for
/// this crate) hands to `SvcHub`, before any of the normalization rules in
/// this module have run.
#[derive(Debug, Clone, Default)]
pub struct RawConfig {
    pub zm_on: String,
    pub zm_off: String,
    pub zs_on: String,
    pub zs_off: String,
    pub acao: String,
    pub acam: String,
    pub rp_loc: String,
    pub th_covers: String,

    /// Worker thread/process count (`-j`).
    pub j: usize,
    pub th_poke: u64,
    pub th_maxage: u64,
    pub ac_maxage: u64,

    pub use_fpool: bool,
    pub no_fpool: bool,

    /// `-s` occurrence count (0-3+); `-s`, `-ss`, `-sss` are modeled as
    /// repeated occurrences of one flag, matching `clap`'s
    /// `ArgAction::Count`.
    pub safe_mode: u8,

    pub s: bool,
    pub ss: bool,
    pub dotpart: bool,
    pub no_thumb: bool,
    pub no_mtag_ff: bool,
    pub no_robots: bool,
    pub force_js: bool,
    pub unpost: u32,
    pub no_del: bool,
    pub no_mv: bool,
    pub hardlink: bool,
    pub vague_403: bool,
    pub ban_404: Option<String>,
    pub nih: bool,
    pub no_dav: bool,
    pub no_logues: bool,
    pub no_readme: bool,
    pub log_template: Option<String>,
    pub ls: Option<String>,

    /// Protocols this process is serving (`http`, `webdav`, `ftp`, `smb`,
    /// ...), used to assemble the service-announce string.
    pub enabled_protocols: Vec<String>,
}

/// `rp_loc` normalized into its three derived forms.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RpLoc {
    pub r: String,
    pub sr: String,
    pub rs: String,
    pub srs: String,
}

/// The config snapshot after normalization. Immutable for the lifetime of
/// the hub; a `reload()` re-runs `normalize` from scratch and swaps it.
#[derive(Debug, Clone)]
pub struct NormalizedConfig {
    pub zm_on: Vec<String>,
    pub zm_off: Vec<String>,
    pub zs_on: Vec<String>,
    pub zs_off: Vec<String>,
    pub acao: BTreeSet<String>,
    pub acam: BTreeSet<String>,
    pub rp_loc: RpLoc,
    pub th_covers: BTreeSet<String>,
    pub th_poke: u64,
    pub zms: String,
    pub raw: RawConfig,
}

fn split_list(s: &str) -> Vec<String> {
    s.split(',').map(str::trim).filter(|x| !x.is_empty()).map(str::to_string).collect()
}

/// Expands a leading `~` to the user's home directory, the way path-like
/// single-value options are expanded (§6.1, first bullet).
pub fn expand_home(path: &str) -> String {
    if let Some(rest) = path.strip_prefix('~') {
        let home = std::env::var("HOME")
            .or_else(|_| std::env::var("USERPROFILE"))
            .unwrap_or_default();
        format!("{home}{rest}")
    } else {
        path.to_string()
    }
}

fn validate_rp_loc(value: &str) -> Result<RpLoc, ConfigError> {
    if value.contains("//") || value.contains(':') {
        return Err(ConfigError::InvalidPath { option: "rp_loc", value: value.to_string() });
    }
    let r = value.trim_matches('/').to_string();
    Ok(RpLoc { sr: format!("/{r}"), rs: format!("{r}/"), srs: format!("/{r}/"), r })
}

/// `-s` level: dotfiles partial, thumbnails off, ffmpeg metadata tagging
/// off, robots.txt disabled, force client-side JS.
fn apply_s(cfg: &mut RawConfig) {
    cfg.dotpart = true;
    cfg.no_thumb = true;
    cfg.no_mtag_ff = true;
    cfg.no_robots = true;
    cfg.force_js = true;
}

/// `-ss` level: cascades `-s`, plus disables unpost/delete/move, forces
/// hardlinking and vague 403s, and a default 404-ban policy.
fn apply_ss(cfg: &mut RawConfig) {
    cfg.s = true;
    cfg.unpost = 0;
    cfg.no_del = true;
    cfg.no_mv = true;
    cfg.hardlink = true;
    cfg.vague_403 = true;
    if cfg.ban_404.is_none() {
        cfg.ban_404 = Some("50,60,1440".to_string());
    }
    cfg.nih = true;
    apply_s(cfg);
}

/// `-sss` level: cascades `-ss`, disables WebDAV/logues/readme rendering,
/// and picks compressed-by-default log naming.
fn apply_sss(cfg: &mut RawConfig) {
    cfg.ss = true;
    cfg.no_dav = true;
    cfg.no_logues = true;
    cfg.no_readme = true;
    if cfg.log_template.is_none() {
        cfg.log_template = Some("cpp-%Y-%m%d-%H%M%S.txt.xz".to_string());
    }
    if cfg.ls.is_none() {
        cfg.ls = Some("**,*,ln,p,r".to_string());
    }
    apply_ss(cfg);
}

fn apply_safe_mode_escalation(cfg: &mut RawConfig) {
    match cfg.safe_mode {
        0 => {}
        1 => apply_s(cfg),
        2 => apply_ss(cfg),
        _ => apply_sss(cfg),
    }
}

/// Normalizes a raw configuration snapshot per `SPEC_FULL.md` §6.1. This is
/// the first step of `SvcHub`'s constructor and the first step of `reload()`
/// (re-run over whatever the config source currently returns).
pub fn normalize(mut cfg: RawConfig) -> Result<NormalizedConfig, ConfigError> {
    apply_safe_mode_escalation(&mut cfg);

    if cfg.j != 1 {
        cfg.no_fpool = true;
        if cfg.use_fpool {
            tracing::warn!("use_fpool ignored: forced off because j != 1");
            cfg.use_fpool = false;
        }
    }

    let zm_on = split_list(&cfg.zm_on);
    let zm_off = split_list(&cfg.zm_off);
    let zs_on = split_list(&cfg.zs_on);
    let zs_off = split_list(&cfg.zs_off);

    let acao: BTreeSet<String> = split_list(&cfg.acao).into_iter().map(|s| s.to_lowercase()).collect();
    let acam: BTreeSet<String> = split_list(&cfg.acam).into_iter().collect();

    let rp_loc = validate_rp_loc(&cfg.rp_loc)?;
    let th_covers: BTreeSet<String> = split_list(&cfg.th_covers).into_iter().collect();

    let th_poke = cfg.th_poke.min(cfg.th_maxage).min(cfg.ac_maxage);

    let zms = cfg.enabled_protocols.join(",");

    Ok(NormalizedConfig { zm_on, zm_off, zs_on, zs_off, acao, acam, rp_loc, th_covers, th_poke, zms, raw: cfg })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base() -> RawConfig {
        RawConfig { j: 1, th_poke: 100, th_maxage: 100, ac_maxage: 100, rp_loc: "r".into(), ..Default::default() }
    }

    #[test]
    fn sss_cascades_through_ss_and_s() {
        let mut cfg = base();
        cfg.safe_mode = 3;
        let n = normalize(cfg).unwrap();
        assert!(n.raw.ss);
        assert!(n.raw.s);
        assert!(n.raw.no_dav);
        assert!(n.raw.hardlink);
        assert!(n.raw.no_thumb);
        assert_eq!(n.raw.ban_404.as_deref(), Some("50,60,1440"));
        assert_eq!(n.raw.log_template.as_deref(), Some("cpp-%Y-%m%d-%H%M%S.txt.xz"));
    }

    #[test]
    fn ss_does_not_disable_webdav() {
        let mut cfg = base();
        cfg.safe_mode = 2;
        let n = normalize(cfg).unwrap();
        assert!(n.raw.s);
        assert!(!n.raw.no_dav);
    }

    #[test]
    fn rp_loc_rejects_double_slash_and_colon() {
        let mut cfg = base();
        cfg.rp_loc = "a//b".into();
        assert!(normalize(cfg).is_err());

        let mut cfg = base();
        cfg.rp_loc = "c:d".into();
        assert!(normalize(cfg).is_err());
    }

    #[test]
    fn rp_loc_derives_four_forms() {
        let mut cfg = base();
        cfg.rp_loc = "shares".into();
        let n = normalize(cfg).unwrap();
        assert_eq!(
            n.rp_loc,
            RpLoc { r: "shares".into(), sr: "/shares".into(), rs: "shares/".into(), srs: "/shares/".into() }
        );
    }

    #[test]
    fn acao_is_lowercased_and_deduplicated() {
        let mut cfg = base();
        cfg.acao = "Foo, foo, BAR".into();
        let n = normalize(cfg).unwrap();
        assert_eq!(n.acao.len(), 2);
        assert!(n.acao.contains("foo"));
        assert!(n.acao.contains("bar"));
    }

    #[test]
    fn j_not_one_forces_no_fpool() {
        let mut cfg = base();
        cfg.j = 4;
        cfg.use_fpool = true;
        let n = normalize(cfg).unwrap();
        assert!(n.raw.no_fpool);
        assert!(!n.raw.use_fpool);
    }

    #[test]
    fn th_poke_is_clamped_to_the_minimum() {
        let mut cfg = base();
        cfg.th_poke = 500;
        cfg.th_maxage = 200;
        cfg.ac_maxage = 50;
        let n = normalize(cfg).unwrap();
        assert_eq!(n.th_poke, 50);
    }
}
