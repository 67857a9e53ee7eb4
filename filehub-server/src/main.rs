//! Binary entry point: wires `filehub-core`'s collaborators into a running
//! process. Everything domain-specific (HTTP/WebDAV/FTP/SMB framing,
//! filesystem scanning, access-control policy) lives outside this crate;
//! this file's job is startup ordering, signal plumbing, and shutdown.

mod cli;

use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use filehub_core::auth_registry::StaticAuthRegistry;
use filehub_core::broker::{self, HandlerRegistry};
use filehub_core::svchub::{self, Collaborators, SvcHub};
use filehub_core::zeroconf::AnnounceConfig;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

/// Destination name workers answer on; used by the worker-up barrier's
/// readiness probe and nothing else, since real protocol adapters are out
/// of scope here.
fn handle_ping(_dest: &str, args: &[String]) -> Option<String> {
    Some(args.join(","))
}

fn build_handler_registry() -> HandlerRegistry {
    let mut registry = HandlerRegistry::new();
    registry.register("ping", handle_ping);
    registry
}

fn main() -> ExitCode {
    // Re-exec'd as a probe/worker child: handle that before touching tokio,
    // tracing, or any other ambient state (`broker::probe`, `
    // broker::process_backend` both document this ordering requirement).
    if broker::probe::run_probe_echo_if_requested() {
        return ExitCode::SUCCESS;
    }

    let registry = build_handler_registry();
    if std::env::var_os(broker::process_backend::WORKER_ENV_VAR).is_some() {
        broker::process_backend::run_worker_loop(&registry);
        return ExitCode::SUCCESS;
    }

    let rt = match tokio::runtime::Runtime::new() {
        Ok(rt) => rt,
        Err(e) => {
            eprintln!("failed to start async runtime: {e}");
            return ExitCode::FAILURE;
        }
    };
    rt.block_on(async_main(registry))
}

async fn async_main(registry: HandlerRegistry) -> ExitCode {
    match run(registry).await {
        Ok(retcode) => ExitCode::from(retcode.clamp(0, 255) as u8),
        Err(e) => {
            tracing::error!(error = format!("{e:#}"), "fatal startup error");
            ExitCode::FAILURE
        }
    }
}

/// The fallible part of startup, kept in its own function so the narrow
/// `ConfigError`/`io::Error` types the rest of the crate raises can be
/// bubbled with `?` and given a bit of `anyhow::Context` at this one
/// boundary, rather than matched and logged by hand at every call site.
async fn run(registry: HandlerRegistry) -> anyhow::Result<i32> {
    cli::load_dotenv();
    let args = cli::Args::parse();
    let ignore_bind_errors = args.ignore_bind_errors;
    let log_dir = args.log_dir.clone();
    let announce =
        AnnounceConfig { service_name: "filehub".to_string(), host: args.host.clone(), port: args.port };

    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let raw = cli::compose(args).context("composing CLI/env/file configuration")?;

    let collab = Collaborators {
        auth: Arc::new(StaticAuthRegistry::new(Vec::new())),
        indexer: None,
        thumbsrv: None,
        smb: None,
        tcp: None,
        handlers: registry,
        announce,
        log_dir,
        wark_salt: random_salt(),
        fk_salt: random_salt(),
        srch_hits_cap: 1000,
    };

    let hub = Arc::new(SvcHub::new(raw, collab).context("constructing service hub")?);

    spawn_signal_listeners(hub.clone());

    let target_workers = hub.broker.num_workers() as u32;
    if hub.await_workers_up(target_workers, ignore_bind_errors) {
        svchub::sd_notify("READY=1");
    }

    let retcode = tokio::task::spawn_blocking(move || run_lifecycle_loop(hub))
        .await
        .unwrap_or(1);

    Ok(retcode)
}

/// Blocks on `SvcHub`'s condition-variable-driven stop/reload loop until a
/// stop is requested, then runs shutdown and returns the process retcode.
/// Runs on a blocking thread since the underlying wait is a plain
/// `std::sync::Condvar`, not an async notifier.
fn run_lifecycle_loop(hub: Arc<SvcHub>) -> i32 {
    loop {
        hub.wait_for_signal(Duration::from_secs(1));
        if hub.take_reload_request() {
            if let Err(e) = hub.reload() {
                tracing::warn!(error = %e, "reload failed");
            }
            continue;
        }
        if hub.stop_requested() {
            return hub.shutdown();
        }
    }
}

#[cfg(unix)]
fn spawn_signal_listeners(hub: Arc<SvcHub>) {
    use tokio::signal::unix::{SignalKind, signal};

    let mut term = match signal(SignalKind::terminate()) {
        Ok(s) => s,
        Err(e) => {
            tracing::warn!(error = %e, "failed to install SIGTERM handler");
            return;
        }
    };
    let mut int = match signal(SignalKind::interrupt()) {
        Ok(s) => s,
        Err(e) => {
            tracing::warn!(error = %e, "failed to install SIGINT handler");
            return;
        }
    };
    let mut hup = match signal(SignalKind::hangup()) {
        Ok(s) => s,
        Err(e) => {
            tracing::warn!(error = %e, "failed to install SIGHUP handler");
            return;
        }
    };

    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = term.recv() => hub.on_term_signal(),
                _ = int.recv() => hub.on_term_signal(),
                _ = hup.recv() => hub.on_reload_signal(),
            }
        }
    });
}

#[cfg(not(unix))]
fn spawn_signal_listeners(hub: Arc<SvcHub>) {
    tokio::spawn(async move {
        loop {
            if tokio::signal::ctrl_c().await.is_ok() {
                hub.on_term_signal();
            }
        }
    });
}

/// A process-unique, unpredictable-enough salt for `wark`/`fk` derivation.
/// Not a cryptographic key; only needs to differ per process start.
fn random_salt() -> String {
    use base64::Engine;
    use sha2::{Digest, Sha256};

    let mut hasher = Sha256::new();
    hasher.update(std::process::id().to_le_bytes());
    let nanos = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos();
    hasher.update(nanos.to_le_bytes());
    base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(hasher.finalize())
}
