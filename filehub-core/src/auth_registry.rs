//! Snapshot of mounted volumes: virtual path → physical path plus per-volume
//! flags (`SPEC_FULL.md` §2, "interface only" — the actual access-control
//! policy this snapshot feeds is out of scope).

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::RwLock;

use crate::error::ConfigError;

/// Per-volume flags relevant to query execution. Other flags (permissions,
/// upload policy, ...) belong to the out-of-scope access-control layer and
/// are carried opaquely in `extra`.
#[derive(Debug, Clone, Default)]
pub struct VolumeFlags {
    /// Length of the per-file access-key suffix to append to search
    /// results, or `None` if the volume doesn't require one.
    pub fk: Option<u32>,
    pub dotsrch: bool,
    pub extra: HashMap<String, String>,
}

#[derive(Debug, Clone)]
pub struct Volume {
    pub vtop: String,
    pub ptop: String,
    pub flags: VolumeFlags,
    /// Directory holding this volume's `up2k.db` catalog, if indexing is
    /// enabled for it.
    pub histpath: Option<PathBuf>,
}

/// Reloadable snapshot of the volume table. `U2Idx` only ever reads it.
pub trait AuthRegistry: Send + Sync {
    fn volumes(&self) -> Vec<Volume>;
    fn histpath(&self, ptop: &str) -> Option<PathBuf>;
    /// Re-derives the snapshot from whatever backing configuration produced
    /// it. Called under `SvcHub`'s indexer mutex during `reload()`.
    fn reload(&self) -> Result<(), ConfigError>;
}

/// Minimal in-memory registry: a fixed volume table supplied at
/// construction, swappable wholesale on `reload`.
pub struct StaticAuthRegistry {
    volumes: RwLock<Vec<Volume>>,
    source: RwLock<Box<dyn Fn() -> Vec<Volume> + Send + Sync>>,
}

impl StaticAuthRegistry {
    pub fn new(volumes: Vec<Volume>) -> Self {
        let initial = volumes.clone();
        StaticAuthRegistry {
            volumes: RwLock::new(volumes),
            source: RwLock::new(Box::new(move || initial.clone())),
        }
    }

    /// Registers the closure `reload()` re-invokes to recompute the volume
    /// table (e.g. re-reading the normalized config snapshot).
    pub fn set_source(&self, f: impl Fn() -> Vec<Volume> + Send + Sync + 'static) {
        *self.source.write().expect("source lock poisoned") = Box::new(f);
    }
}

impl AuthRegistry for StaticAuthRegistry {
    fn volumes(&self) -> Vec<Volume> {
        self.volumes.read().expect("volumes lock poisoned").clone()
    }

    fn histpath(&self, ptop: &str) -> Option<PathBuf> {
        self.volumes
            .read()
            .expect("volumes lock poisoned")
            .iter()
            .find(|v| v.ptop == ptop)
            .and_then(|v| v.histpath.clone())
    }

    fn reload(&self) -> Result<(), ConfigError> {
        let fresh = (self.source.read().expect("source lock poisoned"))();
        *self.volumes.write().expect("volumes lock poisoned") = fresh;
        Ok(())
    }
}

pub fn history_db_path(histpath: &Path) -> PathBuf {
    histpath.join("up2k.db")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn histpath_looks_up_by_physical_root() {
        let reg = StaticAuthRegistry::new(vec![Volume {
            vtop: "".into(),
            ptop: "/srv/vol".into(),
            flags: VolumeFlags::default(),
            histpath: Some(PathBuf::from("/srv/.hist/vol")),
        }]);
        assert_eq!(reg.histpath("/srv/vol"), Some(PathBuf::from("/srv/.hist/vol")));
        assert_eq!(reg.histpath("/nope"), None);
    }

    #[test]
    fn reload_swaps_the_whole_table() {
        let reg = StaticAuthRegistry::new(vec![]);
        reg.set_source(|| {
            vec![Volume {
                vtop: "x".into(),
                ptop: "/p".into(),
                flags: VolumeFlags::default(),
                histpath: None,
            }]
        });
        reg.reload().unwrap();
        assert_eq!(reg.volumes().len(), 1);
    }
}
