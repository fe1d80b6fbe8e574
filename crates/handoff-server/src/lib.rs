//! The `handoff-server` daemon: parses the environment named in spec.md §6,
//! opens the hint repository, connects the bus, and runs the dispatcher
//! event loop until a shutdown signal arrives. Ambient-stack wiring per
//! `SPEC_FULL.md` §1 -- not itself a named spec.md component.

mod metrics_server;

use anyhow::Context;
use clap::Parser;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

/// Command-line/environment configuration, mirroring spec.md §6's
/// `NODE_NAME`/`STATE_DIR`/`LOG_DIR`/`BUS_URL` plus the tunables spec.md
/// leaves as defaults (`SPEC_FULL.md` §1.3), in the same `clap::Parser` +
/// `env` style `crates/agent/src/main.rs` and
/// `crates/oidc-discovery-server/src/lib.rs` use for their own daemons.
#[derive(Parser, Debug)]
#[clap(author, version, about = "Hinted-handoff daemon", long_about = None)]
pub struct Args {
    /// Symbolic identity of this peer.
    #[clap(long = "node-name", env = "NODE_NAME")]
    pub node_name: String,

    /// Directory under which the durable hint repository is opened
    /// (`$STATE_DIR/handoff`).
    #[clap(long = "state-dir", env = "STATE_DIR")]
    pub state_dir: PathBuf,

    /// Optional directory for a rolling log file; stderr is always used in
    /// addition.
    #[clap(long = "log-dir", env = "LOG_DIR")]
    pub log_dir: Option<PathBuf>,

    /// `host:port` of the bus this node connects to.
    #[clap(long = "bus-url", env = "BUS_URL")]
    pub bus_url: String,

    /// Optional `host:port` to serve a Prometheus `/metrics` endpoint on. No
    /// exporter is installed if unset.
    #[clap(long = "metrics-addr", env = "METRICS_ADDR")]
    pub metrics_addr: Option<SocketAddr>,

    /// Maximum concurrently in-flight `ArchiveSegment` sends per peer.
    #[clap(long, env = "MAX_IN_FLIGHT", default_value_t = 4)]
    pub max_in_flight: usize,

    /// Seconds to wait for an `ArchiveSegmentReply` before treating the send
    /// as transient.
    #[clap(long, env = "ACK_TIMEOUT_SECS", default_value_t = 30)]
    pub ack_timeout_secs: u64,

    /// Seconds of silence from a peer before it is presumed `Down`.
    #[clap(long, env = "DEAD_AFTER_SECS", default_value_t = 120)]
    pub dead_after_secs: u64,

    /// Upper bound on the dispatcher's periodic tick, in seconds.
    #[clap(long, env = "TICK_INTERVAL_SECS", default_value_t = 5)]
    pub tick_interval_secs: u64,

    /// Base delay of the forwarder's exponential backoff, in seconds.
    #[clap(long, env = "BACKOFF_BASE_SECS", default_value_t = 10)]
    pub backoff_base_secs: u64,

    /// Cap on the forwarder's exponential backoff, in seconds.
    #[clap(long, env = "BACKOFF_CAP_SECS", default_value_t = 600)]
    pub backoff_cap_secs: u64,

    /// Full-jitter fraction applied to backoff delays, e.g. `0.25` for ±25%.
    #[clap(long, env = "BACKOFF_JITTER", default_value_t = 0.25)]
    pub backoff_jitter: f32,

    /// Seconds the `Draining` state continues forwarding after a shutdown
    /// signal before the process stops.
    #[clap(long, env = "DRAIN_GRACE_SECS", default_value_t = 30)]
    pub drain_grace_secs: u64,

    /// `routing_header` value identifying a data-writer peer in
    /// `ProcessStatus` broadcasts.
    #[clap(long = "data-writer-role", env = "DATA_WRITER_ROLE", default_value = "data_writer")]
    pub data_writer_role: String,
}

impl Args {
    fn config(&self) -> handoff::Config {
        handoff::Config {
            max_in_flight: self.max_in_flight,
            ack_timeout: Duration::from_secs(self.ack_timeout_secs),
            dead_after: Duration::from_secs(self.dead_after_secs),
            tick_interval: Duration::from_secs(self.tick_interval_secs),
            backoff_base: Duration::from_secs(self.backoff_base_secs),
            backoff_cap: Duration::from_secs(self.backoff_cap_secs),
            backoff_jitter: self.backoff_jitter,
            data_writer_role: self.data_writer_role.clone(),
            drain_grace: Duration::from_secs(self.drain_grace_secs),
        }
    }
}

/// Maps onto spec.md §6's admin exit codes: `1` configuration error, `2`
/// persistent-store failure at startup, `3` bus connect failure at startup.
/// Any other runtime failure exits `1` -- spec.md names no distinct code for
/// it, and a generic failure is the conservative default.
#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error("configuration error: {0}")]
    Config(#[source] anyhow::Error),
    #[error("persistent store failure: {0}")]
    Store(#[source] anyhow::Error),
    #[error("bus connect failure: {0}")]
    Bus(#[source] anyhow::Error),
    #[error("{0}")]
    Runtime(#[source] anyhow::Error),
}

impl ServerError {
    pub fn exit_code(&self) -> u8 {
        match self {
            ServerError::Config(_) => 1,
            ServerError::Store(_) => 2,
            ServerError::Bus(_) => 3,
            ServerError::Runtime(_) => 1,
        }
    }
}

/// Installs a `tracing_subscriber::FmtSubscriber` from `RUST_LOG`, honoring
/// `NO_COLOR`, the same baseline every daemon in the teacher's workspace
/// starts from (`crates/agent/src/main.rs`,
/// `crates/oidc-discovery-server/src/main.rs`). When `log_dir` is set, logs
/// are additionally written to a daily-rolling file there; the returned
/// guard must be held for the process lifetime or buffered lines are lost.
pub fn init_tracing(log_dir: Option<&std::path::Path>) -> Option<tracing_appender::non_blocking::WorkerGuard> {
    let no_color = matches!(std::env::var("NO_COLOR"), Ok(v) if v == "1");

    match log_dir {
        Some(dir) => {
            let file_appender = tracing_appender::rolling::daily(dir, "handoff-server.log");
            let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);
            let subscriber = tracing_subscriber::FmtSubscriber::builder()
                .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
                .with_ansi(false)
                .with_writer(non_blocking)
                .finish();
            tracing::subscriber::set_global_default(subscriber)
                .expect("setting tracing default failed");
            Some(guard)
        }
        None => {
            let subscriber = tracing_subscriber::FmtSubscriber::builder()
                .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
                .with_ansi(!no_color)
                .finish();
            tracing::subscriber::set_global_default(subscriber)
                .expect("setting tracing default failed");
            None
        }
    }
}

/// Runs the daemon to completion: opens the repository, connects the bus,
/// optionally serves `/metrics`, and drives the dispatcher until
/// `shutdown_signal` resolves.
pub async fn run(args: Args) -> Result<(), ServerError> {
    tracing::info!(node_name = %args.node_name, state_dir = ?args.state_dir, bus_url = %args.bus_url, "handoff-server starting");

    if args.backoff_base_secs == 0 || args.backoff_base_secs > args.backoff_cap_secs {
        return Err(ServerError::Config(anyhow::anyhow!(
            "--backoff-base-secs must be positive and must not exceed --backoff-cap-secs"
        )));
    }
    if !(0.0..=1.0).contains(&args.backoff_jitter) {
        return Err(ServerError::Config(anyhow::anyhow!(
            "--backoff-jitter must be between 0.0 and 1.0"
        )));
    }

    let repo_path = args.state_dir.join("handoff");
    let repo = handoff_store::HintRepository::open(&repo_path)
        .with_context(|| format!("opening hint repository at {}", repo_path.display()))
        .map_err(ServerError::Store)?;

    let bus = handoff::TcpBus::connect(&args.bus_url)
        .await
        .with_context(|| format!("connecting to bus at {}", args.bus_url))
        .map_err(ServerError::Bus)?;

    if let Some(addr) = args.metrics_addr {
        tokio::spawn(async move {
            if let Err(err) = metrics_server::serve(addr).await {
                tracing::error!(?err, "metrics server exited");
            }
        });
    }

    let config = args.config();
    let dispatcher = handoff::Dispatcher::new(bus, repo, config, args.node_name.clone());

    dispatcher
        .run(shutdown_signal())
        .await
        .map_err(|err| ServerError::Runtime(err.into()))?;

    tracing::info!("handoff-server stopped cleanly");
    Ok(())
}

/// Resolves on the first of SIGINT/ctrl-c or SIGTERM, matching the
/// shutdown-signal pattern `cmd/flow-worker/main.rs` and
/// `cmd/derive-worker/main.rs` use for their own daemons.
async fn shutdown_signal() {
    #[cfg(unix)]
    {
        let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler");
        tokio::select! {
            _ = tokio::signal::ctrl_c() => tracing::info!("received ctrl-c"),
            _ = sigterm.recv() => tracing::info!("received SIGTERM"),
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}
