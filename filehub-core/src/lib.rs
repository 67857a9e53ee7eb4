//! Core coordination and indexing subsystem for a multi-protocol file
//! server: the lifecycle supervisor (`svchub`) and the upload search engine
//! (`catalog::U2Idx`), plus the collaborators they compose (`broker`,
//! `logsink`, `zeroconf`, `auth_registry`, `config`).
//!
//! Protocol adapters, thumbnail rendering, and filesystem scanning are
//! external collaborators reached only through the narrow traits defined
//! here (`auth_registry`, `svchub::{Indexer, ThumbSrv, SmbAdapter,
//! TcpListener}`).

pub mod auth_registry;
pub mod broker;
pub mod catalog;
pub mod config;
pub mod error;
pub mod logsink;
pub mod svchub;
pub mod zeroconf;

pub use error::{BrokerUnavailable, ConfigError, Pebkac, PebkacResult, ZeroconfStartFail};
