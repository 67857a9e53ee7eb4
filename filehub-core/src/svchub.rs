//! Lifecycle supervisor (`SPEC_FULL.md` §4.4): composes every other
//! collaborator, normalizes config, and owns signal-driven shutdown/reload
//! ordering plus the worker-up barrier.
//!
//! The out-of-scope collaborators (HTTP listener, thumbnailer, SMB/FTP
//! adapters, the indexer that actually walks the filesystem) are represented
//! here only by the narrow trait each one implements; `SvcHub` never
//! constructs their internals, only starts and stops them in the documented
//! order.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

use crate::auth_registry::AuthRegistry;
use crate::broker::{Broker, HandlerRegistry};
use crate::catalog::U2Idx;
use crate::config::{self, NormalizedConfig, RawConfig};
use crate::error::ConfigError;
use crate::logsink::{Color, LogSink};
use crate::zeroconf::{AnnounceConfig, ZeroconfMgr};

/// The collaborator that walks volumes and populates their catalogs. Owned
/// opaquely by `SvcHub`; the actual scanning logic is out of scope (§1).
pub trait Indexer: Send + Sync {
    fn reload(&self) -> Result<(), ConfigError>;
    fn shutdown(&self);
}

/// A thumbnail-rendering collaborator. `shutdown` blocks until its workers
/// have drained or `deadline` passes, returning whether it finished cleanly.
pub trait ThumbSrv: Send + Sync {
    fn shutdown(&self, deadline: Instant) -> bool;
}

/// An SMB (or FTP) protocol adapter thread/pool.
pub trait SmbAdapter: Send + Sync {
    fn shutdown(&self);
}

/// The HTTP(S) listener. `start` is assumed to have already bound its
/// sockets by the time `SvcHub` reaches the worker-up barrier.
pub trait TcpListener: Send + Sync {
    fn shutdown(&self);
}

/// Optional out-of-scope collaborators and the pieces `SvcHub` needs to
/// construct the in-scope ones, bundled so the constructor doesn't grow an
/// unbounded parameter list.
pub struct Collaborators {
    pub auth: Arc<dyn AuthRegistry>,
    pub indexer: Option<Arc<dyn Indexer>>,
    pub thumbsrv: Option<Arc<dyn ThumbSrv>>,
    pub smb: Option<Arc<dyn SmbAdapter>>,
    pub tcp: Option<Arc<dyn TcpListener>>,
    pub handlers: HandlerRegistry,
    pub announce: AnnounceConfig,
    pub log_dir: std::path::PathBuf,
    pub wark_salt: String,
    pub fk_salt: String,
    pub srch_hits_cap: i64,
}

/// Counts per-source-IP policy violations (the out-of-scope access-control
/// layer consumes this; `SvcHub` only owns the counters, per §4.4 step 2).
#[derive(Default)]
pub struct BanCounters {
    counts: Mutex<std::collections::HashMap<std::net::IpAddr, u32>>,
}

impl BanCounters {
    pub fn record(&self, ip: std::net::IpAddr) -> u32 {
        let mut counts = self.counts.lock().expect("ban counters mutex poisoned");
        let n = counts.entry(ip).or_insert(0);
        *n += 1;
        *n
    }

    pub fn count(&self, ip: std::net::IpAddr) -> u32 {
        self.counts.lock().expect("ban counters mutex poisoned").get(&ip).copied().unwrap_or(0)
    }
}

/// Counts consecutive termination signals received while a shutdown is
/// already underway, escalating to a forced kill on the fourth. Split out
/// of `SvcHub` itself so it can be exercised without constructing the whole
/// hub, and so tests can substitute the kill action.
pub struct SignalEscalation {
    stopping: AtomicBool,
    extra: AtomicU32,
    kill: Box<dyn Fn() + Send + Sync>,
}

impl SignalEscalation {
    pub fn new() -> Self {
        SignalEscalation::with_kill(Box::new(force_kill_process))
    }

    pub fn with_kill(kill: Box<dyn Fn() + Send + Sync>) -> Self {
        SignalEscalation { stopping: AtomicBool::new(false), extra: AtomicU32::new(0), kill }
    }

    pub fn begin_stopping(&self) {
        self.stopping.store(true, Ordering::SeqCst);
    }

    /// Returns `true` if this call represented an ordinary "please stop"
    /// request (stopping hadn't started yet); `false` if it was one of the
    /// 3 swallowed grace signals or the kill-triggering 4th.
    pub fn on_term_signal(&self) -> bool {
        if !self.stopping.load(Ordering::SeqCst) {
            return true;
        }
        let n = self.extra.fetch_add(1, Ordering::SeqCst) + 1;
        if n > 3 {
            (self.kill)();
        }
        false
    }
}

impl Default for SignalEscalation {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(unix)]
fn force_kill_process() {
    unsafe {
        libc::kill(libc::getpid(), libc::SIGKILL);
    }
}

#[cfg(not(unix))]
fn force_kill_process() {
    std::process::exit(137);
}

#[derive(Default)]
struct Lifecycle {
    stop_req: bool,
    stopping: bool,
    stopped: bool,
    reload_req: bool,
}

/// The lifecycle supervisor itself.
pub struct SvcHub {
    pub config: NormalizedConfig,
    pub log: Arc<LogSink>,
    pub auth: Arc<dyn AuthRegistry>,
    pub u2idx: Arc<U2Idx>,
    pub broker: Box<dyn Broker>,
    pub zeroconf: Arc<ZeroconfMgr>,
    pub ban_counters: BanCounters,

    indexer: Option<Arc<dyn Indexer>>,
    thumbsrv: Option<Arc<dyn ThumbSrv>>,
    smb: Option<Arc<dyn SmbAdapter>>,
    tcp: Option<Arc<dyn TcpListener>>,
    announce: AnnounceConfig,

    lifecycle: Mutex<Lifecycle>,
    stop_cond: Condvar,
    escalation: SignalEscalation,
    reloading: AtomicBool,
    indexer_mutex: Mutex<()>,

    worker_up_count: AtomicU32,
    worker_up_cond: Condvar,
    worker_up_mutex: Mutex<()>,

    retcode: Mutex<i32>,
    last_stack_dump: Mutex<Option<Instant>>,
}

/// Minimum gap between `dump_stacks()` runs (`SPEC_FULL.md` §10.5).
const STACK_DUMP_COOLDOWN: Duration = Duration::from_secs(300);

/// Bounded wait for the thumbnailer to drain during shutdown (§4.4 step 6).
const THUMB_SHUTDOWN_DEADLINE: Duration = Duration::from_secs(10);
const THUMB_WAITING_NOTICE_AFTER: Duration = Duration::from_millis(150);

/// Hard-kill backstop for the SMB adapter during shutdown (§4.4 step 7).
const SMB_HARD_KILL_AFTER: Duration = Duration::from_secs(1);

impl SvcHub {
    /// Runs the construction sequence documented in §4.4 steps 1-6: steps 2
    /// (ip-hash seed / ban counters) and 4 (mutually-exclusive-flag
    /// validation) have no state worth returning beyond `BanCounters`
    /// itself and the warnings logged inline; steps 1, 3, 5, 6 are visible
    /// below in order.
    pub fn new(raw: RawConfig, collab: Collaborators) -> Result<Self, ConfigError> {
        // Step 1 + 3: normalize (includes safe-mode escalation, §6.1).
        let normalized = config::normalize(raw)?;

        // Step 4: warn on conflicting flags beyond what normalize() already
        // forces (e.g. no_fpool). zm_on/zm_off naming the same protocol is
        // not fatal, just contradictory, so it only warns.
        for name in normalized.zm_on.iter() {
            if normalized.zm_off.contains(name) {
                tracing::warn!(protocol = %name, "zm_on and zm_off both name the same protocol; zm_off wins");
            }
        }

        let log = Arc::new(LogSink::new(true, collab.log_dir, normalized.raw.log_template.clone()));

        // Step 5: AuthRegistry is supplied by the caller; U2Idx is
        // constructed here since it has no existence outside this crate.
        let u2idx = Arc::new(U2Idx::new(
            collab.auth.clone(),
            collab.wark_salt,
            collab.fk_salt,
            collab.srch_hits_cap,
        ));

        // Step 6: backend selection (thread vs. multi-process), memoized
        // probe inside `broker::select`.
        let num_workers = normalized.raw.j.max(1);
        let broker = crate::broker::select(num_workers, collab.handlers);

        tune_rlimits(num_workers);

        Ok(SvcHub {
            config: normalized,
            log,
            auth: collab.auth,
            u2idx,
            broker,
            zeroconf: Arc::new(ZeroconfMgr::new()),
            ban_counters: BanCounters::default(),
            indexer: collab.indexer,
            thumbsrv: collab.thumbsrv,
            smb: collab.smb,
            tcp: collab.tcp,
            announce: collab.announce,
            lifecycle: Mutex::new(Lifecycle::default()),
            stop_cond: Condvar::new(),
            escalation: SignalEscalation::new(),
            reloading: AtomicBool::new(false),
            indexer_mutex: Mutex::new(()),
            worker_up_count: AtomicU32::new(0),
            worker_up_cond: Condvar::new(),
            worker_up_mutex: Mutex::new(()),
            retcode: Mutex::new(0),
            last_stack_dump: Mutex::new(None),
        })
    }

    // ---- signal handling -------------------------------------------------

    /// Call from the process's termination-signal handling path (SIGINT,
    /// SIGTERM, ...). Ordinary signals set `stop_req` and wake the stop
    /// condition; signals received after shutdown has begun are counted,
    /// and the fourth forces an immediate kill (§4.4, §8).
    pub fn on_term_signal(&self) {
        let was_pre_shutdown = {
            let st = self.lifecycle.lock().expect("lifecycle mutex poisoned");
            !st.stopping
        };
        if self.escalation.on_term_signal() && was_pre_shutdown {
            let mut st = self.lifecycle.lock().expect("lifecycle mutex poisoned");
            st.stop_req = true;
            self.stop_cond.notify_all();
        }
    }

    /// Call from the process's reload-signal handling path.
    pub fn on_reload_signal(&self) {
        let mut st = self.lifecycle.lock().expect("lifecycle mutex poisoned");
        st.reload_req = true;
        self.stop_cond.notify_all();
    }

    /// Blocks the calling thread (the main run loop) until either a stop or
    /// reload has been requested, or `timeout` elapses.
    pub fn wait_for_signal(&self, timeout: Duration) {
        let st = self.lifecycle.lock().expect("lifecycle mutex poisoned");
        let _ = self
            .stop_cond
            .wait_timeout_while(st, timeout, |s| !s.stop_req && !s.reload_req)
            .expect("lifecycle mutex poisoned");
    }

    pub fn stop_requested(&self) -> bool {
        self.lifecycle.lock().expect("lifecycle mutex poisoned").stop_req
    }

    pub fn take_reload_request(&self) -> bool {
        let mut st = self.lifecycle.lock().expect("lifecycle mutex poisoned");
        std::mem::replace(&mut st.reload_req, false)
    }

    // ---- worker-up barrier -------------------------------------------------

    /// Called by each protocol worker once it is ready to accept requests.
    pub fn worker_up(&self) {
        self.worker_up_count.fetch_add(1, Ordering::SeqCst);
        let _guard = self.worker_up_mutex.lock().expect("worker-up mutex poisoned");
        self.worker_up_cond.notify_all();
    }

    /// Waits for `target` workers to report up, for at most `ignore_bind_errors
    /// ? 1s : 5s` (§4.4). Returns whether the target was reached; logs and
    /// flips the accumulated return code to 1 on failure unless bind errors
    /// are being ignored, matching the documented fatal case.
    pub fn await_workers_up(&self, target: u32, ignore_bind_errors: bool) -> bool {
        let timeout = if ignore_bind_errors { Duration::from_secs(1) } else { Duration::from_secs(5) };
        let deadline = Instant::now() + timeout;

        loop {
            if self.worker_up_count.load(Ordering::SeqCst) >= target {
                self.log.log("sys", "workers OK", Color::None).ok();
                return true;
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                break;
            }
            let guard = self.worker_up_mutex.lock().expect("worker-up mutex poisoned");
            let _ = self.worker_up_cond.wait_timeout(guard, remaining);
        }

        let up = self.worker_up_count.load(Ordering::SeqCst);
        if !ignore_bind_errors {
            self.log.log("sys", &format!("{up}/{target} workers came up, giving up"), Color::None).ok();
            *self.retcode.lock().expect("retcode mutex poisoned") = 1;
        }
        false
    }

    // ---- reload -------------------------------------------------------

    /// Re-normalizes nothing itself (the config snapshot is immutable for
    /// the hub's lifetime; callers that need config changes picked up
    /// reconstruct `SvcHub`) but reloads the auth registry, the indexer,
    /// and broadcasts a reload to the broker, all under the indexer mutex,
    /// and drops every cached U2Idx cursor (§4.4 Reload, §8 reload
    /// atomicity).
    pub fn reload(&self) -> Result<(), ConfigError> {
        if self.reloading.swap(true, Ordering::SeqCst) {
            return Err(ConfigError::Validation("reload already in progress".to_string()));
        }
        let result = self.do_reload();
        self.reloading.store(false, Ordering::SeqCst);
        result
    }

    fn do_reload(&self) -> Result<(), ConfigError> {
        let _guard = self.indexer_mutex.lock().expect("indexer mutex poisoned");
        self.auth.reload()?;
        self.u2idx.drop_cursors();
        if let Some(indexer) = &self.indexer {
            indexer.reload()?;
        }
        self.broker.reload();
        Ok(())
    }

    // ---- shutdown -------------------------------------------------------

    /// Idempotent; the first caller runs the documented shutdown sequence
    /// to completion, every other concurrent/later caller just waits for it
    /// and observes the same return code (§4.4 Shutdown ordering).
    pub fn shutdown(&self) -> i32 {
        {
            let mut st = self.lifecycle.lock().expect("lifecycle mutex poisoned");
            if st.stopping {
                let st = self
                    .stop_cond
                    .wait_while(st, |s| !s.stopped)
                    .expect("lifecycle mutex poisoned");
                drop(st);
                return *self.retcode.lock().expect("retcode mutex poisoned");
            }
            st.stopping = true;
            self.escalation.begin_stopping();
        }

        self.run_shutdown_sequence();

        let mut st = self.lifecycle.lock().expect("lifecycle mutex poisoned");
        st.stopped = true;
        self.stop_cond.notify_all();
        drop(st);

        *self.retcode.lock().expect("retcode mutex poisoned")
    }

    fn run_shutdown_sequence(&self) {
        // 1. Announce, and tell an init system watching sd_notify.
        self.log.log("sys", "shutting down", Color::None).ok();
        sd_notify("STOPPING=1");

        // 2. Stop zero-conf responders asynchronously, shared deadline.
        let deadline_grace = Duration::from_millis(500);
        let zc = self.zeroconf.clone();
        let mdns_done = {
            let zc = zc.clone();
            std::thread::spawn(move || zc.stop_mdns(deadline_grace))
        };
        let ssdp_done = std::thread::spawn(move || zc.stop_ssdp(deadline_grace));
        let _ = mdns_done.join();
        let _ = ssdp_done.join();

        // 3. Broker.
        self.broker.shutdown();

        // 4. TCP listener.
        if let Some(tcp) = &self.tcp {
            tcp.shutdown();
        }

        // 5. Indexer.
        if let Some(indexer) = &self.indexer {
            indexer.shutdown();
        }

        // 6. Thumbnailer, bounded wait with a "waiting" notice.
        if let Some(thumb) = &self.thumbsrv {
            let deadline = Instant::now() + THUMB_SHUTDOWN_DEADLINE;
            let notice_at = Instant::now() + THUMB_WAITING_NOTICE_AFTER;
            let log = self.log.clone();
            let thumb = thumb.clone();
            let handle = std::thread::spawn(move || thumb.shutdown(deadline));
            loop {
                if handle.is_finished() {
                    let _ = handle.join();
                    break;
                }
                if Instant::now() >= notice_at {
                    log.log("sys", "waiting for thumbnailer to finish", Color::None).ok();
                }
                if Instant::now() >= deadline {
                    break;
                }
                std::thread::sleep(Duration::from_millis(20));
            }
        }

        // 7. SMB, with a parallel hard-kill timer as insurance.
        if let Some(smb) = &self.smb {
            let smb = smb.clone();
            let done = Arc::new(AtomicBool::new(false));
            let done2 = done.clone();
            let handle = std::thread::spawn(move || {
                smb.shutdown();
                done2.store(true, Ordering::SeqCst);
            });
            let deadline = Instant::now() + SMB_HARD_KILL_AFTER;
            while Instant::now() < deadline && !done.load(Ordering::SeqCst) {
                std::thread::sleep(Duration::from_millis(10));
            }
            let _ = handle.join();
        }

        // 8. Log sink closes implicitly when the last Arc<LogSink> drops;
        // the process exits with the accumulated retcode via the caller.
    }

    pub fn retcode(&self) -> i32 {
        *self.retcode.lock().expect("retcode mutex poisoned")
    }

    // ---- diagnostics ----------------------------------------------------

    /// Best-effort thread-backtrace dump, rate-limited to once per 300 s
    /// (`SPEC_FULL.md` §10.5). Stable Rust has no supported way to capture
    /// another thread's backtrace without unsafe platform-specific signal
    /// plumbing, so this captures the calling thread's own backtrace (the
    /// common case: an operator-triggered diagnostic endpoint calling in
    /// from its own request-handling thread) and simply names every other
    /// tracked thread so an operator knows what else was alive.
    pub fn dump_stacks(&self, other_threads: &[&str]) -> Option<String> {
        let mut last = self.last_stack_dump.lock().expect("stack dump mutex poisoned");
        if let Some(prev) = *last {
            if prev.elapsed() < STACK_DUMP_COOLDOWN {
                return None;
            }
        }
        *last = Some(Instant::now());
        drop(last);

        let bt = std::backtrace::Backtrace::force_capture();
        let mut out = format!("-- stack dump ({}) --\n{bt}\n", std::thread::current().name().unwrap_or("?"));
        for name in other_threads {
            out.push_str(&format!("(thread {name}: backtrace unavailable, alive)\n"));
        }
        self.log.log("sys", "dumped thread stacks", Color::None).ok();
        Some(out)
    }
}

/// Raises `RLIMIT_NOFILE` toward `num_workers * 4`, never past the hard
/// limit, logging rather than failing if the kernel refuses (§10.5).
#[cfg(unix)]
fn tune_rlimits(num_workers: usize) {
    let target = (num_workers as u64) * 4;
    unsafe {
        let mut lim = libc::rlimit { rlim_cur: 0, rlim_max: 0 };
        if libc::getrlimit(libc::RLIMIT_NOFILE, &mut lim) != 0 {
            tracing::warn!("getrlimit(RLIMIT_NOFILE) failed");
            return;
        }
        let want = target.max(lim.rlim_cur).min(lim.rlim_max);
        if want > lim.rlim_cur {
            let new_lim = libc::rlimit { rlim_cur: want, rlim_max: lim.rlim_max };
            if libc::setrlimit(libc::RLIMIT_NOFILE, &new_lim) != 0 {
                tracing::warn!(target = want, "setrlimit(RLIMIT_NOFILE) refused, continuing with current limit");
            }
        }
    }
}

#[cfg(not(unix))]
fn tune_rlimits(_num_workers: usize) {}

/// Sends a systemd-style notification datagram if `NOTIFY_SOCKET` is set
/// (`SPEC_FULL.md` §6.4, §10.5). No-ops silently on any failure: an absent
/// or misconfigured notification socket must never affect the service
/// itself.
#[cfg(unix)]
pub fn sd_notify(state: &str) {
    let Ok(path) = std::env::var("NOTIFY_SOCKET") else { return };
    if path.is_empty() {
        return;
    }
    if let Ok(sock) = connect_notify_socket(&path) {
        let _ = sock.send(state.as_bytes());
    }
}

#[cfg(not(unix))]
pub fn sd_notify(_state: &str) {}

#[cfg(target_os = "linux")]
fn connect_notify_socket(path: &str) -> std::io::Result<std::os::unix::net::UnixDatagram> {
    use std::os::linux::net::SocketAddrExt;
    use std::os::unix::net::{SocketAddr, UnixDatagram};

    let sock = UnixDatagram::unbound()?;
    let addr = match path.strip_prefix('@') {
        Some(name) => SocketAddr::from_abstract_name(name.as_bytes())?,
        None => SocketAddr::from_pathname(path)?,
    };
    sock.connect_addr(&addr)?;
    Ok(sock)
}

#[cfg(all(unix, not(target_os = "linux")))]
fn connect_notify_socket(path: &str) -> std::io::Result<std::os::unix::net::UnixDatagram> {
    let sock = std::os::unix::net::UnixDatagram::unbound()?;
    sock.connect(path)?;
    Ok(sock)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn signal_escalation_swallows_exactly_three_then_kills() {
        let kills = Arc::new(AtomicUsize::new(0));
        let kills2 = kills.clone();
        let esc = SignalEscalation::with_kill(Box::new(move || {
            kills2.fetch_add(1, Ordering::SeqCst);
        }));
        esc.begin_stopping();

        assert!(!esc.on_term_signal());
        assert!(!esc.on_term_signal());
        assert!(!esc.on_term_signal());
        assert_eq!(kills.load(Ordering::SeqCst), 0, "first three signals after stopping must be swallowed");

        assert!(!esc.on_term_signal());
        assert_eq!(kills.load(Ordering::SeqCst), 1, "the fourth signal must force a kill");
    }

    #[test]
    fn signal_before_stopping_is_an_ordinary_stop_request() {
        let esc = SignalEscalation::with_kill(Box::new(|| panic!("must not kill before stopping")));
        assert!(esc.on_term_signal(), "signal before stopping begins is an ordinary stop request");
    }

    #[test]
    fn ban_counters_increment_per_ip() {
        let counters = BanCounters::default();
        let ip: std::net::IpAddr = "127.0.0.1".parse().unwrap();
        assert_eq!(counters.record(ip), 1);
        assert_eq!(counters.record(ip), 2);
        assert_eq!(counters.count(ip), 2);
    }

    #[test]
    fn sd_notify_is_a_silent_noop_without_notify_socket() {
        // SAFETY: test-only removal of an env var this test doesn't rely
        // on being absent elsewhere; no other test in this crate reads it.
        unsafe {
            std::env::remove_var("NOTIFY_SOCKET");
        }
        sd_notify("READY=1");
    }
}
