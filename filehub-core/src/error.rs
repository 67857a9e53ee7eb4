//! Error taxonomy for the core: [`ConfigError`] fails fast before any service
//! starts, [`Pebkac`] is the user-facing carrier returned by the search
//! engine, and the other variants describe how the rest of the failure modes
//! are meant to propagate (see `SPEC_FULL.md` §7).

use std::fmt;

/// Configuration failures. These terminate the process before any component
/// is constructed; there is no partial-startup state to unwind.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config file {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: toml::de::Error,
    },

    /// `rp_loc` (or any other bare-path option) contained `//` or `:`.
    #[error("invalid path option {option}: {value:?} must not contain '//' or ':'")]
    InvalidPath { option: &'static str, value: String },

    #[error("{0}")]
    Validation(String),
}

/// The user-facing error carrier, named for the Python original's acronym
/// (Problem Exists Between Keyboard And Chair) and kept under that name
/// because protocol adapters outside this crate match on it by status code,
/// not by a renamed type.
#[derive(Debug, Clone)]
pub struct Pebkac {
    pub code: u16,
    pub msg: String,
}

impl Pebkac {
    pub fn new(code: u16, msg: impl Into<String>) -> Self {
        Pebkac { code, msg: msg.into() }
    }

    pub fn bad_request(msg: impl Into<String>) -> Self {
        Pebkac::new(400, msg)
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        Pebkac::new(500, msg)
    }
}

impl fmt::Display for Pebkac {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.code, self.msg)
    }
}

impl std::error::Error for Pebkac {}

impl From<rusqlite::Error> for Pebkac {
    fn from(e: rusqlite::Error) -> Self {
        Pebkac::internal(format!("{e:?}"))
    }
}

/// Result alias used throughout the catalog/query modules.
pub type PebkacResult<T> = Result<T, Pebkac>;

/// Zero-conf start failures are logged and never fatal; this type exists so
/// call sites can still express "this specific attempt failed" without
/// resorting to a bare string.
#[derive(Debug, thiserror::Error)]
#[error("zeroconf start failed: {0}")]
pub struct ZeroconfStartFail(pub String);

/// Raised internally when the multi-process broker probe fails for any
/// reason; callers catch this and fall back to the thread backend.
#[derive(Debug, thiserror::Error)]
#[error("broker backend unavailable: {0}")]
pub struct BrokerUnavailable(pub String);
