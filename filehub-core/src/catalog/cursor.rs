//! Per-volume catalog cursor management (`SPEC_FULL.md` §4.5.1).
//!
//! Cursors are opened on first use and cached for process lifetime; a single
//! [`parking_lot::Mutex`] wraps each connection because at most one
//! `run_query` may use a given cursor concurrently (sqlite-style
//! constraint, §5, §9 design note).

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::Mutex;
use rusqlite::{Connection, OpenFlags};

use crate::auth_registry::{history_db_path, AuthRegistry};

pub type SharedConn = Arc<Mutex<Connection>>;

/// Lazily-populated, process-lifetime cache of per-volume catalog
/// connections, keyed by physical root path (`ptop`).
pub struct CursorCache {
    cache: Mutex<HashMap<String, SharedConn>>,
}

impl Default for CursorCache {
    fn default() -> Self {
        Self::new()
    }
}

impl CursorCache {
    pub fn new() -> Self {
        CursorCache { cache: Mutex::new(HashMap::new()) }
    }

    /// Returns a cursor for `ptop`'s catalog, opening and caching it on
    /// first use. Returns `None` (and logs) if there is no history path for
    /// this volume, no `up2k.db` yet, or the connection fails to open.
    pub fn get_cursor(&self, ptop: &str, auth: &dyn AuthRegistry) -> Option<SharedConn> {
        if let Some(conn) = self.cache.lock().get(ptop) {
            return Some(conn.clone());
        }

        let Some(histpath) = auth.histpath(ptop) else {
            tracing::warn!(ptop, "no histpath for volume");
            return None;
        };

        let db_path = history_db_path(&histpath);
        if !db_path.exists() {
            return None;
        }

        let conn = match open_cursor(&db_path) {
            Ok(c) => c,
            Err(e) => {
                tracing::warn!(ptop, error = %e, "could not open catalog");
                return None;
            }
        };

        let shared = Arc::new(Mutex::new(conn));
        self.cache.lock().insert(ptop.to_string(), shared.clone());
        Some(shared)
    }

    /// Drops all cached cursors, closing their connections. Called during
    /// shutdown and at the start of `reload()` — no cursor survives a
    /// reload, they're reopened lazily.
    pub fn clear(&self) {
        self.cache.lock().clear();
    }
}

#[cfg(windows)]
fn wal_sidecar_missing(db_path: &Path) -> bool {
    let mut wal = db_path.as_os_str().to_owned();
    wal.push("-wal");
    !Path::new(&wal).exists()
}

#[cfg(windows)]
fn try_read_only_nolock(db_path: &Path) -> Option<Connection> {
    let uri = format!("file:{}?mode=ro&nolock=1", db_path.display());
    let conn = Connection::open_with_flags(
        &uri,
        OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_URI | OpenFlags::SQLITE_OPEN_NO_MUTEX,
    )
    .ok()?;
    // Probe: a normal open that's silently racing the writer can still
    // succeed here but fail on first real query, so force one now.
    conn.query_row("pragma table_info(\"up\")", [], |_| Ok(())).ok();
    Some(conn)
}

/// Opens the catalog at `db_path`. On Windows, attempts a read-only,
/// no-lock open first when the `-wal` sidecar is absent (a normal open would
/// steal the write lock from an in-progress writer); falls back to a normal
/// read/write open if that probe fails. On other platforms, opens
/// read/write directly — POSIX advisory locking doesn't have this failure
/// mode.
fn open_cursor(db_path: &Path) -> rusqlite::Result<Connection> {
    #[cfg(windows)]
    {
        if wal_sidecar_missing(db_path) {
            if let Some(conn) = try_read_only_nolock(db_path) {
                return Ok(conn);
            }
        }
    }
    Connection::open(db_path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth_registry::{StaticAuthRegistry, Volume, VolumeFlags};

    fn make_catalog(dir: &Path) -> PathBuf {
        let db_path = dir.join("up2k.db");
        let conn = Connection::open(&db_path).unwrap();
        conn.execute_batch(
            "create table up (w text, mt int, sz int, rd text, fn text, ip text, at int);
             create table mt (w text, k text, v text);",
        )
        .unwrap();
        db_path
    }

    #[test]
    fn missing_db_returns_none() {
        let dir = tempfile::tempdir().unwrap();
        let reg = StaticAuthRegistry::new(vec![Volume {
            vtop: "".into(),
            ptop: "/p".into(),
            flags: VolumeFlags::default(),
            histpath: Some(dir.path().to_path_buf()),
        }]);
        let cache = CursorCache::new();
        assert!(cache.get_cursor("/p", &reg).is_none());
    }

    #[test]
    fn opens_and_caches_existing_db() {
        let dir = tempfile::tempdir().unwrap();
        make_catalog(dir.path());
        let reg = StaticAuthRegistry::new(vec![Volume {
            vtop: "".into(),
            ptop: "/p".into(),
            flags: VolumeFlags::default(),
            histpath: Some(dir.path().to_path_buf()),
        }]);
        let cache = CursorCache::new();
        let c1 = cache.get_cursor("/p", &reg).expect("first open");
        let c2 = cache.get_cursor("/p", &reg).expect("cached hit");
        assert!(Arc::ptr_eq(&c1, &c2));
    }

    #[test]
    fn clear_forces_a_fresh_open() {
        let dir = tempfile::tempdir().unwrap();
        make_catalog(dir.path());
        let reg = StaticAuthRegistry::new(vec![Volume {
            vtop: "".into(),
            ptop: "/p".into(),
            flags: VolumeFlags::default(),
            histpath: Some(dir.path().to_path_buf()),
        }]);
        let cache = CursorCache::new();
        let c1 = cache.get_cursor("/p", &reg).unwrap();
        cache.clear();
        let c2 = cache.get_cursor("/p", &reg).unwrap();
        assert!(!Arc::ptr_eq(&c1, &c2));
    }
}
