//! Thread-backed [`Broker`](super::Broker). Each worker is a dedicated OS
//! thread with its own job queue, the way the reference job-queue pattern in
//! this codebase (a channel-fed run loop per worker) is structured, just
//! with `std::thread` standing in for the async task since the broker's own
//! concurrency model is "parallel OS threads" (`SPEC_FULL.md` §5), not an
//! async executor.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::mpsc::{self, Sender};
use std::thread::JoinHandle;

use parking_lot::Mutex;

use super::{Broker, HandlerRegistry, ReplyHandle};

enum Job {
    Say { dest: String, args: Vec<String> },
    Ask { dest: String, args: Vec<String>, reply: Sender<Option<String>> },
    Reload { ack: Sender<()> },
    Shutdown,
}

struct WorkerHandle {
    tx: Sender<Job>,
    join: Mutex<Option<JoinHandle<()>>>,
}

pub struct ThreadBroker {
    workers: Vec<WorkerHandle>,
    next: AtomicUsize,
}

impl ThreadBroker {
    pub fn spawn(num_workers: usize, registry: HandlerRegistry) -> Self {
        let num_workers = num_workers.max(1);
        let workers = (0..num_workers)
            .map(|idx| {
                let (tx, rx) = mpsc::channel::<Job>();
                let registry = registry.clone();
                let join = std::thread::Builder::new()
                    .name(format!("broker-worker-{idx}"))
                    .spawn(move || worker_loop(rx, &registry))
                    .expect("spawn broker worker thread");
                WorkerHandle { tx, join: Mutex::new(Some(join)) }
            })
            .collect();
        ThreadBroker { workers, next: AtomicUsize::new(0) }
    }

    fn pick(&self) -> &WorkerHandle {
        let i = self.next.fetch_add(1, Ordering::Relaxed) % self.workers.len();
        &self.workers[i]
    }
}

fn worker_loop(rx: std::sync::mpsc::Receiver<Job>, registry: &HandlerRegistry) {
    while let Ok(job) = rx.recv() {
        match job {
            Job::Say { dest, args } => {
                let _ = registry.dispatch(&dest, &args);
            }
            Job::Ask { dest, args, reply } => {
                let result = registry.dispatch(&dest, &args);
                let _ = reply.send(result);
            }
            Job::Reload { ack } => {
                let _ = ack.send(());
            }
            Job::Shutdown => break,
        }
    }
}

impl Broker for ThreadBroker {
    fn say(&self, dest: &str, args: Vec<String>) {
        let _ = self.pick().tx.send(Job::Say { dest: dest.to_string(), args });
    }

    fn ask(&self, dest: &str, args: Vec<String>) -> ReplyHandle {
        let (tx, rx) = mpsc::channel();
        let _ = self.pick().tx.send(Job::Ask { dest: dest.to_string(), args, reply: tx });
        ReplyHandle(rx)
    }

    fn shutdown(&self) {
        for w in &self.workers {
            let _ = w.tx.send(Job::Shutdown);
        }
        for w in &self.workers {
            if let Some(j) = w.join.lock().take() {
                let _ = j.join();
            }
        }
    }

    fn reload(&self) {
        let (acks_tx, acks_rx) = mpsc::channel::<()>();
        for w in &self.workers {
            let _ = w.tx.send(Job::Reload { ack: acks_tx.clone() });
        }
        drop(acks_tx);
        for _ in 0..self.workers.len() {
            let _ = acks_rx.recv();
        }
    }

    fn num_workers(&self) -> usize {
        self.workers.len()
    }
}

impl Drop for ThreadBroker {
    fn drop(&mut self) {
        for w in &self.workers {
            let _ = w.tx.send(Job::Shutdown);
            if let Some(j) = w.join.lock().take() {
                let _ = j.join();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn echo(_dest: &str, args: &[String]) -> Option<String> {
        args.first().cloned()
    }

    #[test]
    fn ask_round_trips_through_a_worker() {
        let mut reg = HandlerRegistry::new();
        reg.register("echo", echo);
        let broker = ThreadBroker::spawn(2, reg);
        let handle = broker.ask("echo", vec!["hi".into()]);
        assert_eq!(handle.get(), Some("hi".into()));
    }

    #[test]
    fn say_is_fire_and_forget_and_does_not_block() {
        let reg = HandlerRegistry::new();
        let broker = ThreadBroker::spawn(3, reg);
        broker.say("nobody-home", vec![]);
        assert_eq!(broker.num_workers(), 3);
    }

    #[test]
    fn reload_waits_for_every_worker_ack() {
        let reg = HandlerRegistry::new();
        let broker = ThreadBroker::spawn(4, reg);
        broker.reload();
    }
}
