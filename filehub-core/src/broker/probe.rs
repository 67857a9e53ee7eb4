//! Multi-process backend availability probe (`SPEC_FULL.md` §4.2, §9 open
//! question on idempotency).
//!
//! The reference implementation mutates global interpreter state
//! (`multiprocessing.set_start_method("spawn", True)`) as a side effect of
//! probing, every time it probes. Repeated `reload()` cycles must not repeat
//! that mutation, so the probe result here is memoized after the first call.

use std::io::{Read, Write};
use std::process::{Command, Stdio};
use std::sync::OnceLock;

use crate::error::BrokerUnavailable;

static PROBE_RESULT: OnceLock<Result<(), String>> = OnceLock::new();

/// Environment variable a re-exec'd probe child looks for. Set by the
/// parent, read by [`run_probe_echo_if_requested`], which the binary's
/// `main` must call before doing anything else.
pub const PROBE_ENV_VAR: &str = "FILEHUB_BROKER_PROBE";

/// Confirms the platform can support the multi-process backend:
/// 1. more than one CPU is available,
/// 2. a small value round-trips through a real child process via a piped
///    channel,
/// 3. the spawn used no inherited descriptors beyond that channel (achieved
///    by redirecting stderr to `/dev/null`-equivalent and leaving stdin/out
///    as the only piped descriptors).
///
/// Idempotent: only the first call actually spawns a probe child; later
/// calls return the memoized result.
pub fn probe_multiprocess_support() -> Result<(), BrokerUnavailable> {
    PROBE_RESULT
        .get_or_init(run_probe)
        .clone()
        .map_err(BrokerUnavailable)
}

fn run_probe() -> Result<(), String> {
    if num_cpus::get() <= 1 {
        return Err("fewer than 2 CPUs available".to_string());
    }

    let exe = std::env::current_exe().map_err(|e| format!("current_exe: {e}"))?;
    let mut child = Command::new(exe)
        .env(PROBE_ENV_VAR, "1")
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .spawn()
        .map_err(|e| format!("spawn probe child: {e}"))?;

    let token = "filehub-broker-probe\n";
    child
        .stdin
        .take()
        .ok_or("no stdin pipe")?
        .write_all(token.as_bytes())
        .map_err(|e| format!("write to probe child: {e}"))?;

    let mut out = String::new();
    child
        .stdout
        .take()
        .ok_or("no stdout pipe")?
        .read_to_string(&mut out)
        .map_err(|e| format!("read from probe child: {e}"))?;

    let _ = child.wait();

    if out.trim_end() == token.trim_end() {
        Ok(())
    } else {
        Err(format!("probe child echoed {out:?}, expected {token:?}"))
    }
}

/// Call first thing in `main`. If the process was re-exec'd as a probe
/// child, echoes one line from stdin back to stdout and returns `true` (the
/// caller should exit immediately with code 0). Otherwise returns `false`
/// and the caller proceeds with normal startup.
pub fn run_probe_echo_if_requested() -> bool {
    if std::env::var_os(PROBE_ENV_VAR).is_none() {
        return false;
    }
    let mut line = String::new();
    if std::io::stdin().read_line(&mut line).is_ok() {
        print!("{line}");
        let _ = std::io::stdout().flush();
    }
    true
}
