//! Sluice Controller binary.
//!
//! `run` reconciles change events read from a file or stdin against the data
//! plane. `wait-drain` blocks shutdown until the data plane stops accepting
//! new connections. `serve` runs a stand-in data plane admin server.

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::{Args, Parser, Subcommand};
use sluice_admin::{AdminServer, AdminState};
use sluice_controller::{
    drain, intake, logging, ControllerConfig, DrainConfig, DynamicUpdatePusher, Reconciler,
    ReloadController, SnapshotPublisher, StatusEndpoint,
};
use sluice_core::DesiredState;
use tokio::io::AsyncRead;
use tracing::info;

/// Control/data-plane bridge for a reverse proxy.
#[derive(Debug, Parser)]
#[command(name = "sluice-controller", version)]
struct Cli {
    /// Configuration file; defaults apply when omitted.
    #[arg(long, short, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Reconcile change events against the data plane.
    Run {
        /// Newline-delimited JSON change events; `-` reads stdin.
        #[arg(long, default_value = "-")]
        events: String,
    },
    /// Wait until the data plane stops receiving new connections.
    WaitDrain(WaitDrainArgs),
    /// Serve the control channel and status surface on the control endpoint.
    Serve,
}

#[derive(Debug, Args)]
struct WaitDrainArgs {
    /// Status surface as `host:port/path`.
    #[arg(long)]
    status_endpoint: Option<String>,
    /// Give up after this many milliseconds.
    #[arg(long)]
    max_wait_ms: Option<u64>,
    /// Poll period in milliseconds.
    #[arg(long)]
    poll_interval_ms: Option<u64>,
    /// New connections per poll still considered drained.
    #[arg(long)]
    requests_threshold: Option<u64>,
    /// Bound on one status request in milliseconds.
    #[arg(long)]
    client_timeout_ms: Option<u64>,
    /// Consecutive failed polls before giving up.
    #[arg(long)]
    retries: Option<u32>,
}

#[tokio::main]
async fn main() -> anyhow::Result<ExitCode> {
    let cli = Cli::parse();
    let config = match &cli.config {
        Some(path) => ControllerConfig::load(path)
            .with_context(|| format!("loading {}", path.display()))?,
        None => ControllerConfig::default(),
    };
    logging::init(&config.log);

    match cli.command {
        Command::Run { events } => {
            run(&config, &events).await?;
            Ok(ExitCode::SUCCESS)
        }
        Command::WaitDrain(args) => wait_drain(config, args).await,
        Command::Serve => {
            serve(&config).await?;
            Ok(ExitCode::SUCCESS)
        }
    }
}

async fn run(config: &ControllerConfig, events: &str) -> anyhow::Result<()> {
    let pusher = DynamicUpdatePusher::new(&config.control);
    let reloader = ReloadController::new(&config.reload);
    let (publisher, receiver) = SnapshotPublisher::new();
    let reconciler = tokio::spawn(Reconciler::new(pusher, reloader).run(receiver));

    let input: Box<dyn AsyncRead + Unpin + Send> = if events == "-" {
        Box::new(tokio::io::stdin())
    } else {
        Box::new(
            tokio::fs::File::open(events)
                .await
                .with_context(|| format!("opening {events}"))?,
        )
    };

    info!(control = %config.control.endpoint, "controller started");
    let mut state = DesiredState::new();
    tokio::select! {
        result = intake::run(input, &mut state, &publisher) => {
            result.context("reading change events")?;
        }
        _ = tokio::signal::ctrl_c() => info!("interrupted"),
    }

    drop(publisher);
    reconciler.await.context("reconciler task failed")?;
    Ok(())
}

async fn serve(config: &ControllerConfig) -> anyhow::Result<()> {
    let table = Arc::new(config.balancer.routing_table());
    let state = Arc::new(AdminState::new(table));
    let server = AdminServer::bind(config.control.endpoint, state)
        .await
        .with_context(|| format!("binding {}", config.control.endpoint))?;

    tokio::select! {
        result = server.serve() => result.context("admin server failed")?,
        _ = tokio::signal::ctrl_c() => info!("interrupted"),
    }
    Ok(())
}

async fn wait_drain(mut config: ControllerConfig, args: WaitDrainArgs) -> anyhow::Result<ExitCode> {
    let settings = &mut config.drain;
    if let Some(endpoint) = args.status_endpoint {
        settings.status_endpoint = endpoint;
    }
    if let Some(ms) = args.max_wait_ms {
        settings.max_wait_ms = ms;
    }
    if let Some(ms) = args.poll_interval_ms {
        settings.poll_interval_ms = ms.max(1);
    }
    if let Some(threshold) = args.requests_threshold {
        settings.threshold = threshold;
    }
    if let Some(ms) = args.client_timeout_ms {
        settings.client_timeout_ms = ms;
    }
    if let Some(retries) = args.retries {
        settings.max_retries = retries;
    }

    let endpoint = StatusEndpoint::parse(
        &settings.status_endpoint,
        Duration::from_millis(settings.client_timeout_ms),
    )?;
    let outcome = drain::run(DrainConfig::from(&*settings), endpoint).await;
    Ok(ExitCode::from(outcome.exit_code()))
}
