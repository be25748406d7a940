//! Melissa Launcher - study orchestrator
//!
//! ## Usage
//!
//! ```bash
//! # Local test run
//! melissa-launcher local study.json ./heat
//!
//! # Slurm, 4 ranks per simulation, extra sbatch options per job kind
//! melissa-launcher slurm study.json ./heat \
//!     --simulation-ranks 4 \
//!     --server-sched-args="--time=04:00:00 --partition=long" \
//!     --group-sched-args="--time=00:30:00"
//! ```
//!
//! Every configuration problem is reported on its own line before anything
//! is submitted; any problem makes the launcher exit non-zero.

use anyhow::Context;
use clap::Parser;
use melissa_core::ControlEndpoint;
use melissa_launcher::config::{parse_scheduler_args, resolve_executable};
use melissa_launcher::{
    ExecutableSpec, LauncherError, SchedulerHooks, SchedulerKind, Study, StudyConfig, create_scheduler, preflight,
};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

const LOG_FILE: &str = "melissa_launcher.log";
const REPORT_FILE: &str = "study_report.json";

/// Melissa Launcher - fault-tolerant ensemble orchestration
#[derive(Parser)]
#[command(name = "melissa-launcher")]
#[command(about = "Runs a simulation ensemble on a batch scheduler", long_about = None)]
struct Cli {
    /// Batch back-end
    #[arg(value_enum)]
    scheduler: SchedulerKind,

    /// Study configuration (JSON with STUDY_OPTIONS and MELISSA_STATS)
    config: PathBuf,

    /// Simulation executable
    executable: PathBuf,

    /// Aggregator executable
    #[arg(long, default_value = "melissa-server")]
    server_executable: PathBuf,

    /// MPI ranks of the aggregator
    #[arg(long, default_value_t = 1)]
    server_ranks: u32,

    /// MPI ranks of each simulation
    #[arg(long, default_value_t = 1)]
    simulation_ranks: u32,

    /// Nodes requested for the aggregator job
    #[arg(long)]
    server_nodes: Option<u32>,

    /// Nodes requested for each group job
    #[arg(long)]
    group_nodes: Option<u32>,

    /// Raw scheduler arguments for the aggregator job
    #[arg(long, default_value = "", allow_hyphen_values = true)]
    server_sched_args: String,

    /// Raw scheduler arguments for each group job
    #[arg(long, default_value = "", allow_hyphen_values = true)]
    group_sched_args: String,

    /// Control-plane bind address
    #[arg(long, default_value = "0.0.0.0:0")]
    bind: String,

    /// Host advertised to the aggregator (defaults to this host's name)
    #[arg(long)]
    advertise: Option<String>,

    /// Directory for the study log, job outputs and the final report
    #[arg(long, default_value = ".")]
    output_dir: PathBuf,
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

/// Scheduler arguments requesting `nodes` nodes
fn node_request(kind: SchedulerKind, nodes: Option<u32>) -> Vec<String> {
    match (kind, nodes) {
        (_, None) => Vec::new(),
        (SchedulerKind::Slurm, Some(n)) => vec![format!("--nodes={}", n)],
        (SchedulerKind::Oar, Some(n)) => vec!["-l".to_string(), format!("nodes={}", n)],
        (SchedulerKind::Local, Some(_)) => {
            warn!("Node requests are ignored by the local scheduler");
            Vec::new()
        }
    }
}

fn executable_spec(program: &Path, ranks: u32, mut scheduler_args: Vec<String>, nodes: Vec<String>) -> ExecutableSpec {
    let resolved = resolve_executable(program)
        .and_then(|p| std::fs::canonicalize(&p).ok())
        .unwrap_or_else(|| program.to_path_buf());
    scheduler_args.extend(nodes);
    ExecutableSpec {
        program: resolved.display().to_string(),
        ranks,
        scheduler_args,
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let config = StudyConfig::load(&cli.config)
        .with_context(|| format!("Failed to load study configuration {}", cli.config.display()))?;

    std::fs::create_dir_all(&cli.output_dir)
        .with_context(|| format!("Failed to create {}", cli.output_dir.display()))?;
    let (log_writer, _log_guard) = tracing_appender::non_blocking(tracing_appender::rolling::never(&cli.output_dir, LOG_FILE));

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| default_filter(config.study_options.verbosity).into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(tracing_subscriber::fmt::layer().with_ansi(false).with_writer(log_writer))
        .init();

    let violations = config.validate()
        + preflight(
            &[cli.executable.as_path(), cli.server_executable.as_path()],
            &[cli.server_sched_args.as_str(), cli.group_sched_args.as_str()],
        );
    if violations > 0 {
        error!("{} configuration error(s), nothing was submitted", violations);
        return Err(LauncherError::Config { count: violations }.into());
    }

    let server_args = parse_scheduler_args(&cli.server_sched_args).map_err(anyhow::Error::msg)?;
    let group_args = parse_scheduler_args(&cli.group_sched_args).map_err(anyhow::Error::msg)?;

    let listener = TcpListener::bind(&cli.bind)
        .await
        .with_context(|| format!("Failed to bind control plane on {}", cli.bind))?;
    let port = listener.local_addr()?.port();
    let host = cli.advertise.clone().unwrap_or_else(hostname);
    let launcher_address = format!("{}:{}", host, port);

    let hooks = SchedulerHooks::new(
        create_scheduler(cli.scheduler),
        executable_spec(
            &cli.server_executable,
            cli.server_ranks,
            server_args,
            node_request(cli.scheduler, cli.server_nodes),
        ),
        executable_spec(
            &cli.executable,
            cli.simulation_ranks,
            group_args,
            node_request(cli.scheduler, cli.group_nodes),
        ),
        launcher_address.clone(),
    )
    .with_data_port(config.study_options.data_port)
    .with_output_dir(Some(cli.output_dir.clone()));

    let study = Study::new(config, Arc::new(hooks), ControlEndpoint::listen(listener));

    info!("========================================");
    info!("Melissa Launcher starting");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));
    info!("Scheduler: {}", cli.scheduler);
    info!("Control plane: {}", launcher_address);
    info!("Output: {}", cli.output_dir.display());
    info!("========================================");

    let report = study.run().await?;

    let report_path = cli.output_dir.join(REPORT_FILE);
    match serde_json::to_string_pretty(&report) {
        Ok(json) => {
            if let Err(e) = std::fs::write(&report_path, json) {
                warn!(error = %e, path = %report_path.display(), "Failed to write study report");
            }
        }
        Err(e) => warn!(error = %e, "Failed to serialize study report"),
    }

    let dropped = report.dropped_groups();
    if dropped.is_empty() {
        info!(groups = report.groups.len(), "Study complete");
    } else {
        warn!(dropped = ?dropped, "Study complete with permanently dropped groups");
    }
    Ok(())
}
