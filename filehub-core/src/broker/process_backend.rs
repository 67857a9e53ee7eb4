//! Multi-process [`Broker`] backend. Each worker is a child process (a
//! re-exec of the current binary, mirroring the reference implementation's
//! `spawn` start method, which re-imports the module and resolves the
//! target by name rather than pickling a closure) talking newline-delimited
//! JSON over piped stdin/stdout.

use std::collections::HashMap;
use std::io::{BufRead, BufReader, Write};
use std::process::{Child, ChildStdin, Command, Stdio};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::Sender;
use std::thread::JoinHandle;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use super::{Broker, HandlerRegistry, ReplyHandle};

/// Environment variable a worker child looks for, set to its 0-based index.
/// The binary's `main` must check for this before normal startup and, if
/// present, call [`run_worker_loop`] instead.
pub const WORKER_ENV_VAR: &str = "FILEHUB_BROKER_WORKER";

#[derive(Serialize, Deserialize)]
enum WireMsg {
    Say { dest: String, args: Vec<String> },
    Ask { id: u64, dest: String, args: Vec<String> },
    Reload { id: u64 },
    Shutdown,
}

#[derive(Serialize, Deserialize)]
enum WireReply {
    Ack { id: u64, reply: Option<String> },
    ReloadAck { id: u64 },
}

/// Runs in a worker child process: reads [`WireMsg`] lines from stdin,
/// dispatches through `registry`, writes [`WireReply`] lines to stdout for
/// `Ask`/`Reload`. Returns when the parent sends `Shutdown` or closes stdin.
pub fn run_worker_loop(registry: &HandlerRegistry) {
    let stdin = std::io::stdin();
    let mut stdout = std::io::stdout();
    for line in stdin.lock().lines() {
        let Ok(line) = line else { break };
        if line.is_empty() {
            continue;
        }
        let Ok(msg) = serde_json::from_str::<WireMsg>(&line) else { continue };
        match msg {
            WireMsg::Say { dest, args } => {
                let _ = registry.dispatch(&dest, &args);
            }
            WireMsg::Ask { id, dest, args } => {
                let reply = registry.dispatch(&dest, &args);
                let _ = writeln!(
                    stdout,
                    "{}",
                    serde_json::to_string(&WireReply::Ack { id, reply }).unwrap()
                );
                let _ = stdout.flush();
            }
            WireMsg::Reload { id } => {
                let _ = writeln!(
                    stdout,
                    "{}",
                    serde_json::to_string(&WireReply::ReloadAck { id }).unwrap()
                );
                let _ = stdout.flush();
            }
            WireMsg::Shutdown => break,
        }
    }
}

struct ChildHandle {
    child: Mutex<Child>,
    stdin: Mutex<ChildStdin>,
    reader_join: Mutex<Option<JoinHandle<()>>>,
}

pub struct ProcessBroker {
    children: Vec<ChildHandle>,
    pending: std::sync::Arc<Mutex<HashMap<u64, Sender<Option<String>>>>>,
    next_id: AtomicU64,
    next_child: std::sync::atomic::AtomicUsize,
}

impl ProcessBroker {
    /// Spawns `num_workers` children re-executing the current binary with
    /// [`WORKER_ENV_VAR`] set. `registry` only needs to be known by name on
    /// the child side (the binary's `main` builds the same registry before
    /// checking `WORKER_ENV_VAR`); the parent never sends handler code over
    /// the wire, only `(dest, args)`.
    pub fn spawn(num_workers: usize, _registry: HandlerRegistry) -> Self {
        let num_workers = num_workers.max(1);
        let pending: std::sync::Arc<Mutex<HashMap<u64, Sender<Option<String>>>>> =
            Default::default();

        let children = (0..num_workers)
            .map(|idx| {
                let exe = std::env::current_exe().expect("current_exe for broker worker");
                let mut child = Command::new(exe)
                    .env(WORKER_ENV_VAR, idx.to_string())
                    .stdin(Stdio::piped())
                    .stdout(Stdio::piped())
                    .stderr(Stdio::null())
                    .spawn()
                    .expect("spawn broker worker process");

                let stdin = child.stdin.take().expect("piped stdin");
                let stdout = child.stdout.take().expect("piped stdout");

                let pending = pending.clone();
                let reader_join = std::thread::Builder::new()
                    .name(format!("broker-proc-reader-{idx}"))
                    .spawn(move || {
                        for line in BufReader::new(stdout).lines() {
                            let Ok(line) = line else { break };
                            let Ok(reply) = serde_json::from_str::<WireReply>(&line) else {
                                continue;
                            };
                            let (id, payload) = match reply {
                                WireReply::Ack { id, reply } => (id, reply),
                                WireReply::ReloadAck { id } => (id, None),
                            };
                            if let Some(tx) = pending.lock().remove(&id) {
                                let _ = tx.send(payload);
                            }
                        }
                    })
                    .expect("spawn broker reader thread");

                ChildHandle {
                    child: Mutex::new(child),
                    stdin: Mutex::new(stdin),
                    reader_join: Mutex::new(Some(reader_join)),
                }
            })
            .collect();

        ProcessBroker {
            children,
            pending,
            next_id: AtomicU64::new(0),
            next_child: std::sync::atomic::AtomicUsize::new(0),
        }
    }

    fn pick(&self) -> &ChildHandle {
        let i = self.next_child.fetch_add(1, Ordering::Relaxed) % self.children.len();
        &self.children[i]
    }

    fn send(&self, child: &ChildHandle, msg: &WireMsg) {
        let line = serde_json::to_string(msg).expect("serialize broker message");
        let mut stdin = child.stdin.lock();
        let _ = writeln!(stdin, "{line}");
        let _ = stdin.flush();
    }
}

impl Broker for ProcessBroker {
    fn say(&self, dest: &str, args: Vec<String>) {
        self.send(self.pick(), &WireMsg::Say { dest: dest.to_string(), args });
    }

    fn ask(&self, dest: &str, args: Vec<String>) -> ReplyHandle {
        let (tx, rx) = std::sync::mpsc::channel();
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.pending.lock().insert(id, tx);
        self.send(self.pick(), &WireMsg::Ask { id, dest: dest.to_string(), args });
        ReplyHandle(rx)
    }

    fn shutdown(&self) {
        for c in &self.children {
            self.send(c, &WireMsg::Shutdown);
        }
        for c in &self.children {
            let _ = c.child.lock().wait();
            if let Some(j) = c.reader_join.lock().take() {
                let _ = j.join();
            }
        }
    }

    fn reload(&self) {
        let (tx, rx) = std::sync::mpsc::channel();
        let ids: Vec<u64> = self
            .children
            .iter()
            .map(|c| {
                let id = self.next_id.fetch_add(1, Ordering::Relaxed);
                self.pending.lock().insert(id, tx.clone());
                self.send(c, &WireMsg::Reload { id });
                id
            })
            .collect();
        drop(tx);
        for _ in &ids {
            let _ = rx.recv();
        }
    }

    fn num_workers(&self) -> usize {
        self.children.len()
    }
}

impl Drop for ProcessBroker {
    fn drop(&mut self) {
        for c in &self.children {
            self.send(c, &WireMsg::Shutdown);
            let _ = c.child.lock().wait();
        }
    }
}
