//! Work dispatch to N workers, threads or separate processes, behind one
//! interface (`SPEC_FULL.md` §4.2). Thread and process backends are picked
//! once at startup by [`select`] and are otherwise indistinguishable to
//! `SvcHub`.

pub mod probe;
pub mod process_backend;
pub mod thread_backend;

use std::collections::HashMap;
use std::sync::mpsc;

/// A handler reachable by destination name. Registered identically in the
/// parent and, for the process backend, re-looked-up by name in each spawned
/// child (mirroring the reference implementation's `spawn` start method,
/// which re-imports the module and resolves the target callable by
/// reference rather than pickling a closure).
pub type HandlerFn = fn(&str, &[String]) -> Option<String>;

/// Maps a destination name to its handler. Shared, read-only after
/// construction; both broker backends consult the same table.
#[derive(Clone, Default)]
pub struct HandlerRegistry(HashMap<&'static str, HandlerFn>);

impl HandlerRegistry {
    pub fn new() -> Self {
        HandlerRegistry(HashMap::new())
    }

    pub fn register(&mut self, dest: &'static str, f: HandlerFn) {
        self.0.insert(dest, f);
    }

    pub fn dispatch(&self, dest: &str, args: &[String]) -> Option<String> {
        self.0.get(dest).and_then(|f| f(dest, args))
    }
}

/// A pending reply to an [`Broker::ask`] call. `get()` blocks the calling
/// thread until the worker replies (or the broker shuts down, in which case
/// it returns `None`).
pub struct ReplyHandle(mpsc::Receiver<Option<String>>);

impl ReplyHandle {
    pub fn get(self) -> Option<String> {
        self.0.recv().ok().flatten()
    }
}

/// Narrow interface shared by the thread and process backends.
pub trait Broker: Send + Sync {
    /// Fire-and-forget dispatch to one of `num_workers` execution contexts.
    /// Selection is round-robin, which is fair over time.
    fn say(&self, dest: &str, args: Vec<String>);

    /// Dispatch and return a handle for the single reply.
    fn ask(&self, dest: &str, args: Vec<String>) -> ReplyHandle;

    /// Stop accepting work, drain in-flight jobs, join all workers. Blocks
    /// until every worker has exited.
    fn shutdown(&self);

    /// Broadcast a reload signal to all workers and wait for every
    /// acknowledgement.
    fn reload(&self);

    fn num_workers(&self) -> usize;
}

/// Chooses a backend per the selection rule in `SPEC_FULL.md` §4.2: use the
/// multi-process backend only if the platform supports it (probed once,
/// memoized) *and* `num_workers > 1`; otherwise threads.
pub fn select(num_workers: usize, registry: HandlerRegistry) -> Box<dyn Broker> {
    if num_workers > 1 {
        match probe::probe_multiprocess_support() {
            Ok(()) => {
                return Box::new(process_backend::ProcessBroker::spawn(num_workers, registry));
            }
            Err(e) => {
                tracing::warn!(reason = %e, "multi-process broker unavailable, falling back to threads");
            }
        }
    }
    Box::new(thread_backend::ThreadBroker::spawn(num_workers, registry))
}
