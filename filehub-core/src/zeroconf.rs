//! Zero-configuration network service discovery: mDNS and SSDP responders,
//! restartable behind a monotonic generation counter (`SPEC_FULL.md` §4.3).
//!
//! Failures here are never fatal to `SvcHub` — every fallible step logs and
//! continues.

use std::net::UdpSocket;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use mdns_sd::{ServiceDaemon, ServiceInfo};

use crate::error::ZeroconfStartFail;

const SSDP_MULTICAST_ADDR: &str = "239.255.255.250:1900";

/// Static facts about the service being announced. Supplied by the caller
/// (the out-of-scope HTTP layer knows its own port and hostname).
#[derive(Debug, Clone)]
pub struct AnnounceConfig {
    pub service_name: String,
    pub host: String,
    pub port: u16,
}

struct MdnsHandle {
    daemon: ServiceDaemon,
    generation: u64,
}

struct SsdpHandle {
    stop: Arc<AtomicBool>,
    join: Option<std::thread::JoinHandle<()>>,
    generation: u64,
}

/// Starts/stops mDNS and SSDP responders on demand. Each restart bumps
/// `generation`; stale responders tag their background work with the
/// generation they were started under and stop reacting once a newer
/// generation exists, so late callbacks from a stopped instance are inert
/// rather than racing the new one.
pub struct ZeroconfMgr {
    generation: AtomicU64,
    mdns: Mutex<Option<MdnsHandle>>,
    ssdp: Mutex<Option<SsdpHandle>>,
}

impl Default for ZeroconfMgr {
    fn default() -> Self {
        Self::new()
    }
}

impl ZeroconfMgr {
    pub fn new() -> Self {
        ZeroconfMgr { generation: AtomicU64::new(0), mdns: Mutex::new(None), ssdp: Mutex::new(None) }
    }

    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::SeqCst)
    }

    /// Stops any existing mDNS responder (best-effort) and starts a fresh
    /// one under a new generation.
    pub fn start_mdns(&self, cfg: &AnnounceConfig) -> Result<(), ZeroconfStartFail> {
        self.stop_mdns(Duration::from_millis(500));
        let gen = self.generation.fetch_add(1, Ordering::SeqCst) + 1;

        let daemon = ServiceDaemon::new()
            .map_err(|e| ZeroconfStartFail(format!("mdns daemon init: {e}")))?;

        let ty = "_http._tcp.local.";
        let info = ServiceInfo::new(
            ty,
            &cfg.service_name,
            &format!("{}.local.", cfg.service_name),
            cfg.host.as_str(),
            cfg.port,
            None,
        )
        .map_err(|e| ZeroconfStartFail(format!("mdns service info: {e}")))?;

        daemon
            .register(info)
            .map_err(|e| ZeroconfStartFail(format!("mdns register: {e}")))?;

        *self.mdns.lock().expect("mdns mutex poisoned") = Some(MdnsHandle { daemon, generation: gen });
        Ok(())
    }

    /// Issues an asynchronous stop and waits up to `grace` for it to settle.
    /// Returns whether it settled in time; either way, the slot is cleared
    /// so a subsequent `start_mdns` never races the old daemon.
    pub fn stop_mdns(&self, grace: Duration) -> bool {
        let handle = self.mdns.lock().expect("mdns mutex poisoned").take();
        let Some(handle) = handle else { return true };
        let deadline = Instant::now() + grace;
        match handle.daemon.shutdown() {
            Ok(recv) => {
                let remaining = deadline.saturating_duration_since(Instant::now());
                recv.recv_timeout(remaining).is_ok()
            }
            Err(_) => false,
        }
    }

    /// Stops any existing SSDP responder (best-effort) and starts a fresh
    /// one under a new generation, listening for `M-SEARCH` requests on the
    /// standard SSDP multicast group and replying with a minimal
    /// `NOTIFY`/`200 OK` announcing `cfg.service_name`.
    pub fn start_ssdp(&self, cfg: &AnnounceConfig) -> Result<(), ZeroconfStartFail> {
        self.stop_ssdp(Duration::from_millis(500));
        let gen = self.generation.fetch_add(1, Ordering::SeqCst) + 1;

        let socket = UdpSocket::bind("0.0.0.0:1900")
            .map_err(|e| ZeroconfStartFail(format!("ssdp bind: {e}")))?;
        socket
            .set_read_timeout(Some(Duration::from_millis(250)))
            .map_err(|e| ZeroconfStartFail(format!("ssdp set_read_timeout: {e}")))?;

        let stop = Arc::new(AtomicBool::new(false));
        let stop2 = stop.clone();
        let announce = format!("{}:{}", cfg.host, cfg.port);
        let name = cfg.service_name.clone();

        let join = std::thread::Builder::new()
            .name("ssdp-responder".into())
            .spawn(move || ssdp_loop(socket, stop2, gen, &name, &announce))
            .map_err(|e| ZeroconfStartFail(format!("ssdp thread spawn: {e}")))?;

        *self.ssdp.lock().expect("ssdp mutex poisoned") =
            Some(SsdpHandle { stop, join: Some(join), generation: gen });
        Ok(())
    }

    pub fn stop_ssdp(&self, grace: Duration) -> bool {
        let handle = self.ssdp.lock().expect("ssdp mutex poisoned").take();
        let Some(mut handle) = handle else { return true };
        handle.stop.store(true, Ordering::SeqCst);
        let Some(join) = handle.join.take() else { return true };
        let done = Arc::new(AtomicBool::new(false));
        let done2 = done.clone();
        let waiter = std::thread::spawn(move || {
            let _ = join.join();
            done2.store(true, Ordering::SeqCst);
        });
        let deadline = Instant::now() + grace;
        while Instant::now() < deadline {
            if done.load(Ordering::SeqCst) {
                let _ = waiter.join();
                return true;
            }
            std::thread::sleep(Duration::from_millis(10));
        }
        false
    }
}

fn ssdp_loop(socket: UdpSocket, stop: Arc<AtomicBool>, generation: u64, name: &str, announce: &str) {
    let mut buf = [0u8; 1024];
    while !stop.load(Ordering::SeqCst) {
        match socket.recv_from(&mut buf) {
            Ok((n, src)) => {
                if stop.load(Ordering::SeqCst) {
                    break;
                }
                let text = String::from_utf8_lossy(&buf[..n]);
                if text.starts_with("M-SEARCH") {
                    let reply = format!(
                        "HTTP/1.1 200 OK\r\nCACHE-CONTROL: max-age=1800\r\nLOCATION: http://{announce}/\r\nSERVER: filehub/{generation}\r\nST: upnp:rootdevice\r\nUSN: uuid:{name}::upnp:rootdevice\r\n\r\n"
                    );
                    let _ = socket.send_to(reply.as_bytes(), src);
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock || e.kind() == std::io::ErrorKind::TimedOut => {
                continue;
            }
            Err(_) => break,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generation_advances_on_each_start_attempt() {
        let mgr = ZeroconfMgr::new();
        assert_eq!(mgr.generation(), 0);
        // Without a real network stack in CI this may fail to bind/register;
        // either way the generation bump happens before the fallible step,
        // so failures here don't contaminate the invariant under test.
        let cfg = AnnounceConfig { service_name: "test".into(), host: "127.0.0.1".into(), port: 0 };
        let _ = mgr.start_ssdp(&cfg);
        assert!(mgr.generation() >= 1);
    }

    #[test]
    fn stop_without_start_is_a_no_op() {
        let mgr = ZeroconfMgr::new();
        assert!(mgr.stop_mdns(Duration::from_millis(10)));
        assert!(mgr.stop_ssdp(Duration::from_millis(10)));
    }
}
