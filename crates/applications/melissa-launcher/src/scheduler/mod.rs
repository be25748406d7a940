//! Batch scheduler adapters
//!
//! Every back-end is normalized into one [`Job`] with a small [`JobState`]
//! set. Adapters translate back-end status text through a lookup table; a
//! status missing from the table is [`LauncherError::UnknownSchedulerState`],
//! never a silent default. A job the back-end no longer lists is
//! `Terminated`.
//!
//! One [`SubmitRequest`] may carry several commands. They are packaged as a
//! single schedulable unit so the simulations of a Sobol' group share one
//! allocation.

pub mod local;
pub mod oar;
pub mod slurm;

pub use local::LocalScheduler;
pub use oar::OarScheduler;
pub use slurm::SlurmScheduler;

use crate::error::{LauncherError, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use melissa_core::{JobId, JobState};
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command as AsyncCommand;
use tracing::debug;

/// Upper bound for one batch-system command
pub const DEFAULT_COMMAND_TIMEOUT: Duration = Duration::from_secs(60);

/// One program inside a submission
#[derive(Debug, Clone, PartialEq)]
pub struct CommandSpec {
    pub program: String,
    pub args: Vec<String>,
    /// MPI-like ranks for this program
    pub ranks: u32,
}

impl CommandSpec {
    pub fn new(program: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
            ranks: 1,
        }
    }

    pub fn with_ranks(mut self, ranks: u32) -> Self {
        self.ranks = ranks.max(1);
        self
    }

    /// `program args...` quoted for a POSIX shell
    pub fn shell_line(&self) -> String {
        std::iter::once(self.program.as_str())
            .chain(self.args.iter().map(String::as_str))
            .map(shell_quote)
            .collect::<Vec<_>>()
            .join(" ")
    }
}

/// Everything a back-end needs to submit one unit of work
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SubmitRequest {
    pub name: String,
    pub commands: Vec<CommandSpec>,
    pub environment: Vec<(String, String)>,
    /// Raw extra arguments for the submission command
    pub options: Vec<String>,
    /// Directory for job output files
    pub output_dir: Option<PathBuf>,
}

impl SubmitRequest {
    pub fn new(name: impl Into<String>, commands: Vec<CommandSpec>) -> Self {
        Self {
            name: name.into(),
            commands,
            ..Default::default()
        }
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.environment.push((key.into(), value.into()));
        self
    }

    pub fn with_options(mut self, options: Vec<String>) -> Self {
        self.options = options;
        self
    }

    pub fn with_output_dir(mut self, dir: Option<PathBuf>) -> Self {
        self.output_dir = dir;
        self
    }

    pub fn is_heterogeneous(&self) -> bool {
        self.commands.len() > 1
    }
}

/// A submitted unit of work as seen by the scheduler
#[derive(Debug, Clone, PartialEq)]
pub struct Job {
    pub id: JobId,
    pub state: JobState,
    pub submit_time: DateTime<Utc>,
    /// Known once the job runs
    pub node_name: Option<String>,
}

impl Job {
    pub fn new(id: JobId, state: JobState) -> Self {
        Self {
            id,
            state,
            submit_time: Utc::now(),
            node_name: None,
        }
    }
}

/// Job control for one batch back-end
#[async_trait]
pub trait Scheduler: Send + Sync {
    /// Back-end name used in logs and errors
    fn name(&self) -> &'static str;

    /// Submit `request` as one job.
    ///
    /// A submission rejected by the back-end yields a job in
    /// `JobState::Error`; `Err` means the back-end could not be reached.
    async fn submit(&self, request: &SubmitRequest) -> Result<Job>;

    /// Request cancellation without waiting for confirmation
    async fn cancel(&self, jobs: &[JobId]) -> Result<()>;

    /// Refresh `state` (and `node_name` when known) of every job in place
    async fn update_status(&self, jobs: &mut [Job]) -> Result<()>;
}

/// Supported back-ends
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum SchedulerKind {
    /// Child processes on this machine
    Local,
    Slurm,
    Oar,
}

impl std::fmt::Display for SchedulerKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SchedulerKind::Local => write!(f, "local"),
            SchedulerKind::Slurm => write!(f, "slurm"),
            SchedulerKind::Oar => write!(f, "oar"),
        }
    }
}

/// Factory function to create a scheduler adapter from its kind
pub fn create_scheduler(kind: SchedulerKind) -> Box<dyn Scheduler> {
    match kind {
        SchedulerKind::Local => Box::new(LocalScheduler::new()),
        SchedulerKind::Slurm => Box::new(SlurmScheduler::new()),
        SchedulerKind::Oar => Box::new(OarScheduler::new()),
    }
}

/// Captured output of a batch-system command
#[derive(Debug, Clone)]
pub struct CommandOutput {
    /// `None` when terminated by a signal
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.exit_code == Some(0)
    }
}

/// Run a batch-system command to completion under a timeout
pub async fn run_command(program: &str, args: &[String], timeout: Duration) -> Result<CommandOutput> {
    debug!(program = %program, args = ?args, "Running scheduler command");

    let mut command = AsyncCommand::new(program);
    command
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let output = tokio::time::timeout(timeout, command.output())
        .await
        .map_err(|_| LauncherError::Timeout(timeout))?
        .map_err(|e| LauncherError::scheduler(format!("Failed to run {}: {}", program, e)))?;

    Ok(CommandOutput {
        exit_code: output.status.code(),
        stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
        stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
    })
}

/// Quote `s` for a POSIX shell when needed
pub fn shell_quote(s: &str) -> String {
    let safe = !s.is_empty()
        && s.chars()
            .all(|c| c.is_ascii_alphanumeric() || "-_./=:,+@%".contains(c));
    if safe {
        s.to_string()
    } else {
        format!("'{}'", s.replace('\'', r"'\''"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shell_quote() {
        assert_eq!(shell_quote("simu"), "simu");
        assert_eq!(shell_quote("--x=0.5"), "--x=0.5");
        assert_eq!(shell_quote("a b"), "'a b'");
        assert_eq!(shell_quote("it's"), r"'it'\''s'");
        assert_eq!(shell_quote(""), "''");
    }

    #[test]
    fn test_shell_line() {
        let command = CommandSpec::new("./heat", vec!["0.1".into(), "two words".into()]);
        assert_eq!(command.shell_line(), "./heat 0.1 'two words'");
    }

    #[test]
    fn test_factory_names() {
        assert_eq!(create_scheduler(SchedulerKind::Local).name(), "local");
        assert_eq!(create_scheduler(SchedulerKind::Slurm).name(), "slurm");
        assert_eq!(create_scheduler(SchedulerKind::Oar).name(), "oar");
    }

    #[tokio::test]
    async fn test_run_command_captures_output() {
        let output = run_command("sh", &["-c".into(), "echo out; echo err >&2; exit 3".into()], DEFAULT_COMMAND_TIMEOUT)
            .await
            .unwrap();
        assert_eq!(output.exit_code, Some(3));
        assert_eq!(output.stdout.trim(), "out");
        assert_eq!(output.stderr.trim(), "err");
        assert!(!output.success());
    }

    #[tokio::test]
    async fn test_run_command_timeout() {
        let result = run_command("sleep", &["5".into()], Duration::from_millis(50)).await;
        assert!(matches!(result, Err(LauncherError::Timeout(_))));
    }
}
