//! The search engine itself: ties cursor management (`cursor`), content
//! fingerprints (`wark`), packed-filename decoding (`packed`), and the
//! query compiler (`query`) into `U2Idx::search`/`U2Idx::fsearch`
//! (`SPEC_FULL.md` §4.5.2-§4.5.5, the hardest part of the crate).

pub mod cursor;
pub mod packed;
pub mod query;
pub mod wark;

use std::collections::{BTreeMap, HashSet};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use rusqlite::types::Value as SqlValue;
use rusqlite::InterruptHandle;

use crate::auth_registry::{AuthRegistry, Volume};
use crate::error::PebkacResult;

use cursor::CursorCache;
use query::{compile, Bind, CompiledQuery};
use wark::{gen_filekey, wark_from_hashlist};

/// One row-like input to `fsearch`: the size and ordered per-chunk hash list
/// an uploader reported for a file (`SPEC_FULL.md` §4.5.2).
#[derive(Debug, Clone)]
pub struct FSearchBody {
    pub size: u64,
    pub hash: Vec<String>,
}

/// One search result row, after dedupe/tag-fetch (`SPEC_FULL.md` §4.5.4).
#[derive(Debug, Clone, PartialEq)]
pub struct SearchHit {
    pub rp: String,
    pub ts: i64,
    pub sz: i64,
    pub tags: BTreeMap<String, String>,
}

/// `fsearch`/`search`'s return value: the deduplicated, `rp`-sorted hits,
/// the union of tag keys seen across them, and whether `lim` truncated the
/// set (`SPEC_FULL.md` §4.5.4, §8 testable properties).
#[derive(Debug, Clone, PartialEq, Default)]
pub struct SearchResult {
    pub hits: Vec<SearchHit>,
    pub tag_keys: Vec<String>,
    pub truncated: bool,
}

/// `FSearch`'s limit is fixed, effectively unbounded for that entry point
/// (`SPEC_FULL.md` §4.5.2).
const FSEARCH_LIMIT: i64 = 99999;

/// The search engine. One instance per process, shared across callers; the
/// per-volume cursor cache and the single "active query" slot are its only
/// mutable state.
pub struct U2Idx {
    auth: Arc<dyn AuthRegistry>,
    cursors: CursorCache,
    salt: String,
    fk_salt: String,
    srch_hits_cap: i64,
    /// Identifier of the in-flight query, if any (`SPEC_FULL.md` §4.5.5:
    /// only one query per `U2Idx` is active at a time; reentrant callers
    /// must serialize themselves, this type does not enforce it).
    active_id: Arc<Mutex<Option<String>>>,
    /// Interrupt handle for whichever volume's connection the active query
    /// is currently executing against. Swapped as execution moves between
    /// volumes; the watchdog reads whatever is here right now.
    active_interrupt: Arc<Mutex<Option<InterruptHandle>>>,
}

impl U2Idx {
    pub fn new(auth: Arc<dyn AuthRegistry>, salt: impl Into<String>, fk_salt: impl Into<String>, srch_hits_cap: i64) -> Self {
        U2Idx {
            auth,
            cursors: CursorCache::new(),
            salt: salt.into(),
            fk_salt: fk_salt.into(),
            srch_hits_cap,
            active_id: Arc::new(Mutex::new(None)),
            active_interrupt: Arc::new(Mutex::new(None)),
        }
    }

    /// No cursor survives a `reload()` or shutdown; they are reopened
    /// lazily on next use (`SPEC_FULL.md` §3 lifecycle, §4.5 design notes).
    pub fn drop_cursors(&self) {
        self.cursors.clear();
    }

    /// Search by up2k hashlist: `wark = H(salt, size, hashlist)`, matched
    /// against `substr(w,1,16)` (covering prefix) and the full `w`
    /// (`SPEC_FULL.md` §4.5.2).
    pub fn fsearch(&self, vols: &[Volume], body: &FSearchBody, timeout_secs: u64) -> PebkacResult<SearchResult> {
        let wark = wark_from_hashlist(&self.salt, body.size, &body.hash);
        let prefix: String = wark.chars().take(16).collect();
        let compiled = CompiledQuery {
            sql: "substr(w,1,16) = ? and w = ?".to_string(),
            binds: vec![Bind::Str(prefix), Bind::Str(wark)],
            have_up: true,
            have_mt: false,
        };
        self.run_query(vols, compiled, FSEARCH_LIMIT, timeout_secs)
    }

    /// Search by the infix query language (`SPEC_FULL.md` §4.5.3-§4.5.4).
    pub fn search(&self, vols: &[Volume], query_str: &str, lim: i64, timeout_secs: u64) -> PebkacResult<SearchResult> {
        let compiled = compile::compile(query_str)?;
        self.run_query(vols, compiled, lim, timeout_secs)
    }

    fn run_query(&self, vols: &[Volume], compiled: CompiledQuery, lim: i64, timeout_secs: u64) -> PebkacResult<SearchResult> {
        let query_id = next_query_id();
        *self.active_id.lock().expect("active_id mutex poisoned") = Some(query_id.clone());

        let done = Arc::new(AtomicBool::new(false));
        let watchdog = spawn_watchdog(
            query_id.clone(),
            self.active_id.clone(),
            self.active_interrupt.clone(),
            done.clone(),
            timeout_secs,
        );

        let result = self.execute(vols, &compiled, lim.min(self.srch_hits_cap));

        done.store(true, Ordering::SeqCst);
        *self.active_id.lock().expect("active_id mutex poisoned") = None;
        *self.active_interrupt.lock().expect("active_interrupt mutex poisoned") = None;
        let _ = watchdog.join();

        result
    }

    fn execute(&self, vols: &[Volume], compiled: &CompiledQuery, lim_cap: i64) -> PebkacResult<SearchResult> {
        let enumerate_all = compiled.sql.is_empty() && compiled.binds.is_empty();
        let sql = if enumerate_all {
            "select * from up".to_string()
        } else if compiled.have_mt {
            format!("select up.*, substr(up.w,1,16) mtw from up where {}", compiled.sql)
        } else {
            format!("select up.* from up where {}", compiled.sql)
        };

        let mut lim = lim_cap;
        let mut hits: Vec<SearchHit> = Vec::new();
        let mut seen_rps: HashSet<String> = HashSet::new();
        let mut tag_keys: Vec<String> = Vec::new();
        let mut tag_keys_seen: HashSet<String> = HashSet::new();
        let mut truncated = false;

        'vols: for vol in vols {
            let Some(conn) = self.cursors.get_cursor(&vol.ptop, self.auth.as_ref()) else { continue };
            let guard = conn.lock();

            *self.active_interrupt.lock().expect("active_interrupt mutex poisoned") =
                Some(guard.get_interrupt_handle());

            let mut stmt = guard.prepare(&sql)?;
            let params = bind_values(&compiled.binds, &vol.vtop);
            let mut rows = stmt.query(rusqlite::params_from_iter(params))?;

            let mut vol_hits: Vec<(String, SearchHit)> = Vec::new();

            while let Some(row) = rows.next()? {
                let w: String = row.get(0)?;
                let ts: i64 = row.get(1)?;
                let sz: i64 = row.get(2)?;
                let rd: String = row.get(3)?;
                let fn_raw: String = row.get(4)?;

                let (rd, fn_) = packed::decode_rd_fn(&rd, &fn_raw);
                let rp = join_rp(&vol.vtop, &rd, &fn_);

                if !vol.flags.dotsrch && format!("/{rp}").contains("/.") {
                    continue;
                }
                if seen_rps.contains(&rp) {
                    continue;
                }

                let suf = match vol.flags.fk.filter(|&n| n > 0) {
                    Some(fk_len) => match filekey_suffix(&self.fk_salt, &vol.ptop, &rd, &fn_, sz, fk_len) {
                        Some(s) => s,
                        None => continue,
                    },
                    None => String::new(),
                };

                lim -= 1;
                if lim < 0 {
                    truncated = true;
                    break;
                }

                seen_rps.insert(rp.clone());
                let w16: String = w.chars().take(16).collect();
                vol_hits.push((w16, SearchHit { rp: format!("{rp}{suf}"), ts, sz, tags: BTreeMap::new() }));
            }

            for (w16, mut hit) in vol_hits {
                let mut tag_stmt = guard.prepare("select k, v from mt where w = ? and +k != 'x'")?;
                let mut tag_rows = tag_stmt.query([w16.as_str()])?;
                while let Some(trow) = tag_rows.next()? {
                    let k: String = trow.get(0)?;
                    let v: String = trow.get(1)?;
                    if tag_keys_seen.insert(k.clone()) {
                        tag_keys.push(k.clone());
                    }
                    hit.tags.insert(k, v);
                }
                hits.push(hit);
            }

            if truncated {
                break 'vols;
            }
        }

        hits.sort_by(|a, b| a.rp.cmp(&b.rp));
        Ok(SearchResult { hits, tag_keys, truncated })
    }
}

fn bind_values(binds: &[Bind], vtop: &str) -> Vec<SqlValue> {
    binds
        .iter()
        .map(|b| match b {
            Bind::Str(s) => SqlValue::Text(s.clone()),
            Bind::Int(i) => SqlValue::Integer(*i),
            Bind::VolumeSentinel => SqlValue::Text(format!("{vtop}/")),
        })
        .collect()
}

fn join_rp(vtop: &str, rd: &str, fn_: &str) -> String {
    [vtop, rd, fn_].into_iter().filter(|s| !s.is_empty()).collect::<Vec<_>>().join("/")
}

#[cfg(unix)]
fn inode_or_zero(meta: &std::fs::Metadata) -> u64 {
    use std::os::unix::fs::MetadataExt;
    meta.ino()
}

#[cfg(not(unix))]
fn inode_or_zero(_meta: &std::fs::Metadata) -> u64 {
    0
}

/// `filekey(salt, absPath, size, inodeOrZeroOnWindows)[:fk]` (`SPEC_FULL.md`
/// §4.5.4, GLOSSARY). Returns `None` if the file can no longer be stat'd,
/// in which case the caller skips the whole row, matching the reference
/// implementation's behavior of dropping rows it can no longer verify on
/// disk.
fn filekey_suffix(fk_salt: &str, ptop: &str, rd: &str, fn_: &str, sz: i64, fk_len: u32) -> Option<String> {
    let path = Path::new(ptop).join(rd).join(fn_);
    let ap = std::fs::canonicalize(&path).ok()?;
    let meta = std::fs::metadata(&ap).ok()?;
    let inode = inode_or_zero(&meta);
    let key = gen_filekey(fk_salt, &ap.to_string_lossy(), sz as u64, inode);
    let take = (fk_len as usize).min(key.len());
    Some(format!("?k={}", &key[..take]))
}

fn next_query_id() -> String {
    let now = SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default();
    format!("{}.{:06}_{:?}", now.as_secs(), now.subsec_micros(), std::thread::current().id())
}

/// Sleeps one second at a time for up to `timeout_secs`, bailing out early
/// if `done` is set. If the timeout elapses first and the watched query is
/// still the active one, interrupts whatever connection is currently
/// executing it (`SPEC_FULL.md` §4.5.5).
fn spawn_watchdog(
    query_id: String,
    active_id: Arc<Mutex<Option<String>>>,
    active_interrupt: Arc<Mutex<Option<InterruptHandle>>>,
    done: Arc<AtomicBool>,
    timeout_secs: u64,
) -> std::thread::JoinHandle<()> {
    std::thread::Builder::new()
        .name("u2idx-watchdog".into())
        .spawn(move || {
            for _ in 0..timeout_secs.max(1) {
                std::thread::sleep(Duration::from_secs(1));
                if done.load(Ordering::SeqCst) {
                    return;
                }
            }
            if done.load(Ordering::SeqCst) {
                return;
            }
            let still_active = active_id.lock().expect("active_id mutex poisoned").as_deref() == Some(query_id.as_str());
            if still_active {
                if let Some(h) = active_interrupt.lock().expect("active_interrupt mutex poisoned").as_ref() {
                    h.interrupt();
                }
            }
        })
        .expect("spawn u2idx watchdog thread")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth_registry::{StaticAuthRegistry, VolumeFlags};
    use rusqlite::Connection;
    use std::path::PathBuf;

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

    fn insert_up(conn: &Connection, w: &str, mt: i64, sz: i64, rd: &str, fn_: &str) {
        conn.execute(
            "insert into up (w, mt, sz, rd, fn, ip, at) values (?1, ?2, ?3, ?4, ?5, '', ?2)",
            rusqlite::params![w, mt, sz, rd, fn_],
        )
        .unwrap();
    }

    fn insert_tag(conn: &Connection, w: &str, k: &str, v: &str) {
        conn.execute("insert into mt (w, k, v) values (?1, ?2, ?3)", rusqlite::params![w, k, v]).unwrap();
    }

    fn one_volume_idx(dir: &Path, vtop: &str, flags: VolumeFlags) -> (U2Idx, Vec<Volume>) {
        let reg = Arc::new(StaticAuthRegistry::new(vec![Volume {
            vtop: vtop.to_string(),
            ptop: dir.to_string_lossy().to_string(),
            flags,
            histpath: Some(dir.to_path_buf()),
        }]));
        let vols = reg.volumes();
        (U2Idx::new(reg, "salt", "fk-salt", 99999), vols)
    }

    #[test]
    fn hash_search_hit() {
        let dir = tempfile::tempdir().unwrap();
        make_catalog(dir.path());
        let conn = Connection::open(dir.path().join("up2k.db")).unwrap();
        let wark = wark_from_hashlist("salt", 10, &["h1".to_string()]);
        insert_up(&conn, &wark, 1700000000, 10, "", "x.bin");
        drop(conn);

        let (idx, vols) = one_volume_idx(dir.path(), "", VolumeFlags::default());
        let result = idx.fsearch(&vols, &FSearchBody { size: 10, hash: vec!["h1".to_string()] }, 5).unwrap();
        assert_eq!(result.hits.len(), 1);
        assert_eq!(result.hits[0].rp, "x.bin");
        assert_eq!(result.hits[0].sz, 10);
        assert_eq!(result.hits[0].ts, 1700000000);
        assert!(!result.truncated);
    }

    #[test]
    fn name_wildcard_matches_substring() {
        let dir = tempfile::tempdir().unwrap();
        make_catalog(dir.path());
        let conn = Connection::open(dir.path().join("up2k.db")).unwrap();
        insert_up(&conn, "w1", 1, 1, "", "foobar.txt");
        insert_up(&conn, "w2", 1, 1, "", "baz.txt");
        drop(conn);

        let (idx, vols) = one_volume_idx(dir.path(), "", VolumeFlags::default());
        let result = idx.search(&vols, "name = *foo*", 100, 5).unwrap();
        assert_eq!(result.hits.len(), 1);
        assert_eq!(result.hits[0].rp, "foobar.txt");
    }

    #[test]
    fn tag_scoped_case_fold_matches_regardless_of_case() {
        let dir = tempfile::tempdir().unwrap();
        make_catalog(dir.path());
        let conn = Connection::open(dir.path().join("up2k.db")).unwrap();
        insert_up(&conn, "w1", 1, 1, "", "song.flac");
        insert_tag(&conn, "w1", "artist", "the beatles");
        drop(conn);

        let (idx, vols) = one_volume_idx(dir.path(), "", VolumeFlags::default());
        let result = idx.search(&vols, r#"artist = "The Beatles""#, 100, 5).unwrap();
        assert_eq!(result.hits.len(), 1);
        assert_eq!(result.hits[0].tags.get("artist"), Some(&"the beatles".to_string()));
    }

    #[test]
    fn dotfile_policy_hides_dotted_components_unless_dotsrch() {
        let dir = tempfile::tempdir().unwrap();
        make_catalog(dir.path());
        let conn = Connection::open(dir.path().join("up2k.db")).unwrap();
        insert_up(&conn, "w1", 1, 1, ".hidden", "a");
        drop(conn);

        let (idx, vols) = one_volume_idx(dir.path(), "", VolumeFlags::default());
        let result = idx.search(&vols, "", 100, 5).unwrap();
        assert_eq!(result.hits.len(), 0);

        let (idx, vols) = one_volume_idx(dir.path(), "", VolumeFlags { dotsrch: true, ..Default::default() });
        let result = idx.search(&vols, "", 100, 5).unwrap();
        assert_eq!(result.hits.len(), 1);
    }

    #[test]
    fn dedupe_sort_and_hidden_tags() {
        let dir = tempfile::tempdir().unwrap();
        make_catalog(dir.path());
        let conn = Connection::open(dir.path().join("up2k.db")).unwrap();
        insert_up(&conn, "w1", 1, 1, "", "b.txt");
        insert_up(&conn, "w2", 1, 1, "", "a.txt");
        insert_tag(&conn, "w2", "x", "hidden");
        insert_tag(&conn, "w2", "x-internal", "not hidden, only the exact key 'x' is reserved");
        insert_tag(&conn, "w2", "genre", "rock");
        drop(conn);

        let (idx, vols) = one_volume_idx(dir.path(), "", VolumeFlags::default());
        let result = idx.search(&vols, "", 100, 5).unwrap();
        let rps: Vec<&str> = result.hits.iter().map(|h| h.rp.as_str()).collect();
        assert_eq!(rps, vec!["a.txt", "b.txt"]);
        assert!(!result.hits[0].tags.contains_key("x"));
        assert!(result.hits[0].tags.contains_key("x-internal"));
        assert_eq!(result.hits[0].tags.get("genre"), Some(&"rock".to_string()));
        assert!(result.tag_keys.contains(&"genre".to_string()));
        assert!(result.tag_keys.contains(&"x-internal".to_string()));
        assert!(!result.tag_keys.contains(&"x".to_string()));
    }

    #[test]
    fn limit_truncation_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        make_catalog(dir.path());
        let conn = Connection::open(dir.path().join("up2k.db")).unwrap();
        for i in 0..5 {
            insert_up(&conn, &format!("w{i}"), 1, 1, "", &format!("f{i}.txt"));
        }
        drop(conn);

        let (idx, vols) = one_volume_idx(dir.path(), "", VolumeFlags::default());
        let result = idx.search(&vols, "", 3, 5).unwrap();
        assert_eq!(result.hits.len(), 3);
        assert!(result.truncated);
    }

    #[test]
    fn cancellation_interrupts_a_slow_query_before_its_natural_completion() {
        let dir = tempfile::tempdir().unwrap();
        let db_path = make_catalog(dir.path());

        // `U2Idx::run_query` always goes through `cursor::CursorCache`, which
        // doesn't expose a way to register a custom function on the cursor it
        // opens. Exercise the watchdog directly against a raw connection
        // instead, running the same slow-query-via-custom-function shape
        // `run_query` would hand it, to verify the interrupt mechanism it
        // relies on actually cuts a long-running statement short.
        let conn = Arc::new(parking_lot::Mutex::new(Connection::open(&db_path).unwrap()));
        conn.lock()
            .create_scalar_function(
                "slow_step",
                1,
                rusqlite::functions::FunctionFlags::SQLITE_UTF8,
                |_ctx| {
                    std::thread::sleep(Duration::from_millis(150));
                    Ok(1i64)
                },
            )
            .unwrap();

        let active_id = Arc::new(Mutex::new(Some("q1".to_string())));
        let active_interrupt = Arc::new(Mutex::new(Some(conn.lock().get_interrupt_handle())));
        let done = Arc::new(AtomicBool::new(false));
        let watchdog = spawn_watchdog("q1".to_string(), active_id.clone(), active_interrupt, done.clone(), 1);

        let start = std::time::Instant::now();
        let guard = conn.lock();
        let outcome = guard.query_row(
            "with recursive cnt(x) as (select 1 union all select x+1 from cnt where x < 200)
             select sum(slow_step(x)) from cnt",
            [],
            |row| row.get::<_, i64>(0),
        );
        drop(guard);
        done.store(true, Ordering::SeqCst);
        let _ = watchdog.join();

        assert!(outcome.is_err(), "expected the watchdog to interrupt the slow query");
        assert!(start.elapsed() < Duration::from_secs(4), "interrupt should cut a 30s query far short");
    }
}
