//! Command-line/environment/file configuration composition (`SPEC_FULL.md`
//! §10.3): `clap` parses flags and env fallbacks, `dotenvy` loads `.env`
//! before that, and an optional TOML file fills in whatever neither named,
//! mirroring the teacher's `ConfigLoader::load()` (env > file > default) with
//! a CLI layer added on top (CLI > env > file > default).

use std::path::PathBuf;

use clap::{ArgAction, Parser};
use filehub_core::config::RawConfig;
use filehub_core::error::ConfigError;
use serde::Deserialize;

/// Raw CLI surface. Every field mirrors a [`RawConfig`] field one-to-one;
/// `None`/absent-flag values fall through to the file layer, then the
/// built-in default, per `compose`.
#[derive(Parser, Debug)]
#[command(name = "filehubd", version, about = "multi-protocol file server")]
pub struct Args {
    /// Path to an optional TOML config file overlay.
    #[arg(long, env = "FILEHUB_CONFIG")]
    pub config: Option<PathBuf>,

    #[arg(long, env = "FILEHUB_ZM_ON")]
    pub zm_on: Option<String>,
    #[arg(long, env = "FILEHUB_ZM_OFF")]
    pub zm_off: Option<String>,
    #[arg(long, env = "FILEHUB_ZS_ON")]
    pub zs_on: Option<String>,
    #[arg(long, env = "FILEHUB_ZS_OFF")]
    pub zs_off: Option<String>,
    #[arg(long, env = "FILEHUB_ACAO")]
    pub acao: Option<String>,
    #[arg(long, env = "FILEHUB_ACAM")]
    pub acam: Option<String>,
    #[arg(long, env = "FILEHUB_RP_LOC")]
    pub rp_loc: Option<String>,
    #[arg(long, env = "FILEHUB_TH_COVERS")]
    pub th_covers: Option<String>,

    /// Worker thread/process count.
    #[arg(short = 'j', long, env = "FILEHUB_J")]
    pub j: Option<usize>,
    #[arg(long, env = "FILEHUB_TH_POKE")]
    pub th_poke: Option<u64>,
    #[arg(long, env = "FILEHUB_TH_MAXAGE")]
    pub th_maxage: Option<u64>,
    #[arg(long, env = "FILEHUB_AC_MAXAGE")]
    pub ac_maxage: Option<u64>,

    #[arg(long, env = "FILEHUB_USE_FPOOL")]
    pub use_fpool: bool,
    #[arg(long, env = "FILEHUB_NO_FPOOL")]
    pub no_fpool: bool,

    /// `-s`/`-ss`/`-sss`: repeat for increasing severity.
    #[arg(short = 's', action = ArgAction::Count)]
    pub safe_mode: u8,

    #[arg(long, env = "FILEHUB_DOTPART")]
    pub dotpart: bool,
    #[arg(long, env = "FILEHUB_NO_THUMB")]
    pub no_thumb: bool,
    #[arg(long, env = "FILEHUB_NO_MTAG_FF")]
    pub no_mtag_ff: bool,
    #[arg(long, env = "FILEHUB_NO_ROBOTS")]
    pub no_robots: bool,
    #[arg(long, env = "FILEHUB_FORCE_JS")]
    pub force_js: bool,
    #[arg(long, env = "FILEHUB_UNPOST")]
    pub unpost: Option<u32>,
    #[arg(long, env = "FILEHUB_NO_DEL")]
    pub no_del: bool,
    #[arg(long, env = "FILEHUB_NO_MV")]
    pub no_mv: bool,
    #[arg(long, env = "FILEHUB_HARDLINK")]
    pub hardlink: bool,
    #[arg(long, env = "FILEHUB_VAGUE_403")]
    pub vague_403: bool,
    #[arg(long, env = "FILEHUB_BAN_404")]
    pub ban_404: Option<String>,
    #[arg(long, env = "FILEHUB_NIH")]
    pub nih: bool,
    #[arg(long, env = "FILEHUB_NO_DAV")]
    pub no_dav: bool,
    #[arg(long, env = "FILEHUB_NO_LOGUES")]
    pub no_logues: bool,
    #[arg(long, env = "FILEHUB_NO_README")]
    pub no_readme: bool,
    #[arg(long, env = "FILEHUB_LOG_TEMPLATE")]
    pub log_template: Option<String>,
    #[arg(long, env = "FILEHUB_LS")]
    pub ls: Option<String>,

    /// Comma-separated list of protocols this process serves.
    #[arg(long, env = "FILEHUB_PROTOCOLS", value_delimiter = ',')]
    pub enabled_protocols: Vec<String>,

    /// Directory holding log files.
    #[arg(long, env = "FILEHUB_LOG_DIR", default_value = ".")]
    pub log_dir: PathBuf,

    /// Hostname/IP this process announces itself as, for zero-conf.
    #[arg(long, env = "FILEHUB_HOST", default_value = "0.0.0.0")]
    pub host: String,
    #[arg(long, env = "FILEHUB_PORT", default_value_t = 3923)]
    pub port: u16,

    /// Treat a failed worker-up barrier as non-fatal (1s barrier instead of
    /// 5s, and doesn't set a non-zero retcode on timeout).
    #[arg(long, env = "FILEHUB_IGNORE_BIND_ERRORS")]
    pub ignore_bind_errors: bool,
}

/// Mirrors the subset of [`RawConfig`] and process-level fields a TOML file
/// may override. Every field optional; absent fields don't shadow the
/// environment layer.
#[derive(Debug, Default, Deserialize)]
pub struct FileConfig {
    pub zm_on: Option<String>,
    pub zm_off: Option<String>,
    pub zs_on: Option<String>,
    pub zs_off: Option<String>,
    pub acao: Option<String>,
    pub acam: Option<String>,
    pub rp_loc: Option<String>,
    pub th_covers: Option<String>,
    pub j: Option<usize>,
    pub th_poke: Option<u64>,
    pub th_maxage: Option<u64>,
    pub ac_maxage: Option<u64>,
    pub log_template: Option<String>,
    pub ls: Option<String>,
    pub ban_404: Option<String>,
    pub enabled_protocols: Option<Vec<String>>,
}

/// Loads `.env` (if present, tolerating a missing file the way the teacher's
/// `ConfigLoader::load()` does) before any argument parsing happens.
pub fn load_dotenv() {
    match dotenvy::dotenv() {
        Ok(_) => {}
        Err(dotenvy::Error::Io(_)) => {}
        Err(e) => tracing::warn!(error = %e, "failed to parse .env file"),
    }
}

fn load_file_config(path: &std::path::Path) -> Result<FileConfig, ConfigError> {
    let text = std::fs::read_to_string(path)
        .map_err(|source| ConfigError::Io { path: path.display().to_string(), source })?;
    toml::from_str(&text).map_err(|source| ConfigError::Parse { path: path.display().to_string(), source })
}

/// Merges CLI > environment (already folded into `args` by clap's `env`
/// attribute) > file > built-in default, per `SPEC_FULL.md` §10.3.
pub fn compose(args: Args) -> Result<RawConfig, ConfigError> {
    let file = match args.config.as_deref() {
        Some(path) => load_file_config(path)?,
        None => FileConfig::default(),
    };

    let default = RawConfig { j: 1, th_poke: 60, th_maxage: 86400, ac_maxage: 86400, ..Default::default() };

    Ok(RawConfig {
        zm_on: args.zm_on.or(file.zm_on).unwrap_or(default.zm_on),
        zm_off: args.zm_off.or(file.zm_off).unwrap_or(default.zm_off),
        zs_on: args.zs_on.or(file.zs_on).unwrap_or(default.zs_on),
        zs_off: args.zs_off.or(file.zs_off).unwrap_or(default.zs_off),
        acao: args.acao.or(file.acao).unwrap_or(default.acao),
        acam: args.acam.or(file.acam).unwrap_or(default.acam),
        rp_loc: args.rp_loc.or(file.rp_loc).unwrap_or(default.rp_loc),
        th_covers: args.th_covers.or(file.th_covers).unwrap_or(default.th_covers),
        j: args.j.or(file.j).unwrap_or(default.j),
        th_poke: args.th_poke.or(file.th_poke).unwrap_or(default.th_poke),
        th_maxage: args.th_maxage.or(file.th_maxage).unwrap_or(default.th_maxage),
        ac_maxage: args.ac_maxage.or(file.ac_maxage).unwrap_or(default.ac_maxage),
        use_fpool: args.use_fpool,
        no_fpool: args.no_fpool,
        safe_mode: args.safe_mode,
        s: false,
        ss: false,
        dotpart: args.dotpart,
        no_thumb: args.no_thumb,
        no_mtag_ff: args.no_mtag_ff,
        no_robots: args.no_robots,
        force_js: args.force_js,
        unpost: args.unpost.unwrap_or(0),
        no_del: args.no_del,
        no_mv: args.no_mv,
        hardlink: args.hardlink,
        vague_403: args.vague_403,
        ban_404: args.ban_404.or(file.ban_404),
        nih: args.nih,
        no_dav: args.no_dav,
        no_logues: args.no_logues,
        no_readme: args.no_readme,
        log_template: args.log_template.or(file.log_template),
        ls: args.ls.or(file.ls),
        enabled_protocols: if args.enabled_protocols.is_empty() {
            file.enabled_protocols.unwrap_or_default()
        } else {
            args.enabled_protocols
        },
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_args() -> Args {
        Args {
            config: None,
            zm_on: None,
            zm_off: None,
            zs_on: None,
            zs_off: None,
            acao: None,
            acam: None,
            rp_loc: None,
            th_covers: None,
            j: None,
            th_poke: None,
            th_maxage: None,
            ac_maxage: None,
            use_fpool: false,
            no_fpool: false,
            safe_mode: 0,
            dotpart: false,
            no_thumb: false,
            no_mtag_ff: false,
            no_robots: false,
            force_js: false,
            unpost: None,
            no_del: false,
            no_mv: false,
            hardlink: false,
            vague_403: false,
            ban_404: None,
            nih: false,
            no_dav: false,
            no_logues: false,
            no_readme: false,
            log_template: None,
            ls: None,
            enabled_protocols: vec![],
            log_dir: PathBuf::from("."),
            host: "0.0.0.0".into(),
            port: 3923,
            ignore_bind_errors: false,
        }
    }

    #[test]
    fn compose_falls_back_to_built_in_defaults() {
        let raw = compose(base_args()).unwrap();
        assert_eq!(raw.j, 1);
        assert_eq!(raw.th_poke, 60);
        assert_eq!(raw.rp_loc, "");
    }

    #[test]
    fn compose_prefers_cli_over_default() {
        let mut args = base_args();
        args.j = Some(4);
        args.rp_loc = Some("shares".into());
        let raw = compose(args).unwrap();
        assert_eq!(raw.j, 4);
        assert_eq!(raw.rp_loc, "shares");
    }

    #[test]
    fn compose_reads_a_file_overlay() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("filehub.toml");
        std::fs::write(&path, "j = 3\nrp_loc = \"vol\"\n").unwrap();
        let mut args = base_args();
        args.config = Some(path);
        let raw = compose(args).unwrap();
        assert_eq!(raw.j, 3);
        assert_eq!(raw.rp_loc, "vol");
    }

    #[test]
    fn cli_wins_over_file_overlay() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("filehub.toml");
        std::fs::write(&path, "j = 3\n").unwrap();
        let mut args = base_args();
        args.config = Some(path);
        args.j = Some(9);
        let raw = compose(args).unwrap();
        assert_eq!(raw.j, 9);
    }
}
