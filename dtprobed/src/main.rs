//! `dtprobed`: the USDT/DOF registration daemon (spec.md §1-§9).
//!
//! Wires together configuration, logging, the DOF stash, the sandboxed
//! parser harness, and the control-socket protocol engine, then runs them
//! on a **current-thread** Tokio runtime — built explicitly rather than via
//! `#[tokio::main]` (which the teacher's `cognitod::main` uses and which
//! defaults to the multi-thread scheduler) so the single-threaded invariant
//! of spec.md §5 is enforced by construction, not convention.

mod config;
mod error;
mod logging;
mod metrics;
mod procmap;
mod protocol;
mod sandbox;
mod stash;

use clap::Parser;
use config::Config;
use metrics::Metrics;
use protocol::ProtocolEngine;
use sandbox::ParserSandbox;
use stash::StashHandle;
use std::rc::Rc;
use tokio::signal::unix::{signal, SignalKind};

/// Exit codes per spec.md §6: 0 success, 1 fatal configuration error, 2
/// restartable failure (parser child unspawnable even once at startup).
const EXIT_SUCCESS: i32 = 0;
const EXIT_FATAL_CONFIG: i32 = 1;
const EXIT_RESTARTABLE_FAILURE: i32 = 2;

#[derive(Parser, Debug)]
#[command(name = "dtprobed")]
#[command(about = "USDT/DOF registration daemon")]
struct Args {
    /// Foreground: do not daemonise.
    #[arg(short = 'F')]
    foreground: bool,
    /// Debug output.
    #[arg(short = 'd')]
    debug: bool,
    /// Character-device (socket) name.
    #[arg(short = 'n', value_name = "NAME")]
    device_name: Option<String>,
    /// Parser reply timeout, in seconds.
    #[arg(short = 't', value_name = "SECS")]
    parser_timeout_secs: Option<u64>,
    /// State directory (test-only; not documented in usage).
    #[arg(short = 's', value_name = "DIR")]
    state_dir: Option<std::path::PathBuf>,
}

fn main() {
    let args = Args::parse();
    let mut config = Config::load();
    if args.foreground {
        config.foreground = true;
    }
    if args.debug {
        config.debug = true;
    }
    if let Some(name) = args.device_name {
        config.device_name = name;
    }
    if let Some(secs) = args.parser_timeout_secs {
        config.parser_timeout_secs = secs;
    }
    if let Some(dir) = args.state_dir {
        config.state_dir = dir;
    }

    logging::init(config.foreground, config.debug);
    ignore_sigpipe();

    let runtime = match tokio::runtime::Builder::new_current_thread().enable_all().build() {
        Ok(rt) => rt,
        Err(e) => {
            log::error!("failed to build current-thread runtime: {e}");
            std::process::exit(EXIT_FATAL_CONFIG);
        }
    };

    let code = runtime.block_on(run(config));
    std::process::exit(code);
}

async fn run(config: Config) -> i32 {
    let stash = match StashHandle::open(&config.state_dir) {
        Ok(s) => s,
        Err(e) => {
            log::error!("failed to open DOF stash at {}: {e}", config.state_dir.display());
            return EXIT_FATAL_CONFIG;
        }
    };

    let child_path = sandbox::default_child_path();
    let mut sandbox = ParserSandbox::new(child_path, config.parser_timeout_secs);
    // Spawn-and-probe once at startup: a parser that cannot be launched even
    // once is a restartable-failure condition (spec.md §6), not a fatal one.
    if let Err(e) = sandbox.parse(&[0u8; 64], &[]).await {
        log::error!("parser child could not be started: {e}");
        return EXIT_RESTARTABLE_FAILURE;
    }

    let testing = std::env::var_os("_DTRACE_TESTING").is_some();
    if testing {
        log::info!("_DTRACE_TESTING set: shortened sweep interval and SIGUSR2 force-reparse enabled");
    }

    let metrics = Rc::new(Metrics::new());
    let engine = ProtocolEngine::new(&config, stash, sandbox, Rc::clone(&metrics));

    let rebuilt = engine.reparse(false).await;
    if rebuilt > 0 {
        log::info!("startup reparse rebuilt {rebuilt} stale parsed subtree(s)");
    }

    spawn_metrics_rollup(Rc::clone(&metrics));
    if testing {
        spawn_reparse_on_sigusr2(Rc::clone(&engine));
    }

    notify_systemd_ready();

    // `device_name` (default "dtrace/helper") mirrors the original CUSE device
    // name and may embed a `/`; only its final component names the socket
    // file, matching the documented default path `<state_dir>/helper.sock`.
    let socket_name = std::path::Path::new(&config.device_name)
        .file_name()
        .unwrap_or_else(|| std::ffi::OsStr::new("helper"));
    let socket_path = config.state_dir.join(socket_name).with_extension("sock");
    let shutdown = wait_for_shutdown_signal();

    match engine.serve(&socket_path, shutdown).await {
        Ok(()) => EXIT_SUCCESS,
        Err(e) => {
            log::error!("protocol engine exited with error: {e}");
            EXIT_FATAL_CONFIG
        }
    }
}

fn spawn_metrics_rollup(metrics: Rc<Metrics>) {
    tokio::task::spawn_local(async move {
        let mut interval = tokio::time::interval(std::time::Duration::from_secs(10));
        loop {
            interval.tick().await;
            metrics.log_rollup();
        }
    });
}

/// Only spawned under `_DTRACE_TESTING` (spec.md §6): forces a full reparse
/// of every stashed registration, regardless of its on-disk version, on
/// each `SIGUSR2`.
fn spawn_reparse_on_sigusr2(engine: Rc<ProtocolEngine>) {
    tokio::task::spawn_local(async move {
        let Ok(mut sigusr2) = signal(SignalKind::user_defined2()) else {
            return;
        };
        loop {
            sigusr2.recv().await;
            log::info!("SIGUSR2 received: forcing full reparse");
            let rebuilt = engine.reparse(true).await;
            log::info!("forced reparse rebuilt {rebuilt} subtree(s)");
        }
    });
}

/// Ignores `SIGPIPE` process-wide so a write to a closed parser-child pipe
/// (see `sandbox::spawn_child`) surfaces as an `EPIPE` I/O error instead of
/// killing the daemon outright.
fn ignore_sigpipe() {
    unsafe {
        let _ = nix::sys::signal::signal(nix::sys::signal::Signal::SIGPIPE, nix::sys::signal::SigHandler::SigIgn);
    }
}

async fn wait_for_shutdown_signal() {
    let mut sigterm = match signal(SignalKind::terminate()) {
        Ok(s) => s,
        Err(_) => {
            let _ = tokio::signal::ctrl_c().await;
            return;
        }
    };
    tokio::select! {
        _ = sigterm.recv() => log::info!("SIGTERM received"),
        _ = tokio::signal::ctrl_c() => log::info!("ctrl-c received"),
    }
}

/// Minimal `sd_notify`-equivalent: writes `READY=1\n` to `$NOTIFY_SOCKET` as
/// a single Unix datagram if the variable is set; otherwise does nothing,
/// matching the original's "if available... otherwise nothing is done".
fn notify_systemd_ready() {
    let Some(path) = std::env::var_os("NOTIFY_SOCKET") else {
        return;
    };
    let socket = match std::os::unix::net::UnixDatagram::unbound() {
        Ok(s) => s,
        Err(e) => {
            log::warn!("failed to create notify socket: {e}");
            return;
        }
    };
    if let Err(e) = socket.send_to(b"READY=1\n", &path) {
        log::warn!("failed to send systemd readiness notification: {e}");
    }
}
