//! Melissa Server - aggregator process started by the launcher
//!
//! Binary: melissa-server

use anyhow::Context;
use clap::Parser;
use melissa_core::{ControlEndpoint, DEFAULT_DATA_PORT, ServerOptions, data_plane};
use melissa_server::{Aggregator, AggregatorConfig, DataListener, LoggingSink};
use std::path::PathBuf;
use tokio::net::TcpListener;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Scheduler variables holding the current job id, first match wins
const JOB_ID_VARIABLES: [&str; 3] = ["MELISSA_JOB_ID", "SLURM_JOB_ID", "OAR_JOB_ID"];

/// Melissa Server - ensemble aggregator
#[derive(Parser)]
#[command(name = "melissa-server")]
#[command(about = "Aggregates simulation data and reports progress to the launcher", long_about = None)]
struct Cli {
    /// Launcher control-plane address (host:port)
    #[arg(long, env = "MELISSA_LAUNCHER")]
    launcher: String,

    /// Serialized aggregation options
    #[arg(long, env = "MELISSA_SERVER_OPTIONS", conflicts_with = "options_file")]
    options: Option<String>,

    /// Read the aggregation options from a file instead
    #[arg(long)]
    options_file: Option<PathBuf>,

    /// Data-plane bind address, the launcher exports its port to simulations
    #[arg(long, default_value_t = format!("0.0.0.0:{}", DEFAULT_DATA_PORT))]
    bind: String,

    /// Job id the server ran under at study start
    #[arg(long)]
    first_job_id: Option<String>,

    /// Restore the checkpoint written under the first job id
    #[arg(long)]
    restart: bool,

    /// Rank of this aggregator process
    #[arg(long, default_value_t = 0)]
    rank: i32,
}

fn current_job_id() -> Option<String> {
    JOB_ID_VARIABLES
        .iter()
        .find_map(|name| std::env::var(name).ok().filter(|v| !v.is_empty()))
}

fn hostname() -> String {
    match nix::unistd::gethostname() {
        Ok(name) => name.to_string_lossy().into_owned(),
        Err(error) => {
            warn!(error = ?error, "Failed to retrieve hostname, using localhost");
            "localhost".to_string()
        }
    }
}

fn default_filter(verbosity: u32) -> &'static str {
    match verbosity {
        0 => "error",
        1 => "warn",
        2 => "info",
        _ => "debug",
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let raw = match (&cli.options, &cli.options_file) {
        (Some(options), _) => options.clone(),
        (None, Some(path)) => std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read options from {}", path.display()))?,
        (None, None) => anyhow::bail!("Either --options or --options-file is required"),
    };
    let options = ServerOptions::from_options_string(&raw).context("Malformed server options")?;

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| default_filter(options.verbosity).into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let first_job_id = cli
        .first_job_id
        .clone()
        .or_else(current_job_id)
        .context("No job id: pass --first-job-id or run under a scheduler")?;
    let node_name = hostname();

    info!("========================================");
    info!("Melissa Server starting");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));
    info!("First job id: {}", first_job_id);
    info!("Node: {}", node_name);
    info!("Restart: {}", cli.restart);
    info!("========================================");

    let listener = TcpListener::bind(&cli.bind)
        .await
        .with_context(|| format!("Failed to bind data plane on {}", cli.bind))?;
    let data_addr = listener.local_addr()?;
    let data_endpoint = format!("{}:{}", node_name, data_addr.port());

    let (sender, receiver) = data_plane(options.high_water_mark);

    let mut config = AggregatorConfig::new(options, first_job_id, node_name);
    config.restart = cli.restart;
    config.rank = cli.rank;
    config.data_endpoints = vec![data_endpoint];

    let aggregator = Aggregator::new(config, LoggingSink::default()).await?;
    let data_task = DataListener::new(listener, aggregator.connection_info(), sender.clone()).spawn();

    let control = ControlEndpoint::connect(&cli.launcher)
        .await
        .with_context(|| format!("Failed to reach launcher at {}", cli.launcher))?;

    let report = aggregator.run(&control, receiver).await?;
    data_task.abort();

    info!(
        finished = report.finished,
        expected = report.expected,
        checkpoints = report.checkpoints,
        dropped_messages = sender.dropped(),
        "Melissa Server exiting"
    );
    if !report.stopped {
        anyhow::bail!("Launcher disconnected before STOP");
    }
    Ok(())
}
