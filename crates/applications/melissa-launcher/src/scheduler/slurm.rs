//! Slurm back-end
//!
//! - submit: `sbatch --parsable --job-name=<name> [options] --wrap "<srun line>"`
//! - status: `squeue --noheader --format=%i|%T|%N --jobs=<ids>`
//! - cancel: `scancel <ids>`
//!
//! Several commands become one heterogeneous step,
//! `srun --ntasks=1 a : --ntasks=1 b`, so they share one allocation.

use super::{DEFAULT_COMMAND_TIMEOUT, Job, Scheduler, SubmitRequest, run_command};
use crate::error::{LauncherError, Result};
use async_trait::async_trait;
use melissa_core::{JobId, JobState};
use std::collections::HashMap;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Slurm job state names mapped onto the normalized set
const STATE_TABLE: &[(&str, JobState)] = &[
    ("PENDING", JobState::Waiting),
    ("CONFIGURING", JobState::Waiting),
    ("REQUEUED", JobState::Waiting),
    ("REQUEUE_HOLD", JobState::Waiting),
    ("REQUEUE_FED", JobState::Waiting),
    ("RESV_DEL_HOLD", JobState::Waiting),
    ("SUSPENDED", JobState::Waiting),
    ("STOPPED", JobState::Waiting),
    ("RUNNING", JobState::Running),
    ("COMPLETING", JobState::Running),
    ("SIGNALING", JobState::Running),
    ("STAGE_OUT", JobState::Running),
    ("RESIZING", JobState::Running),
    ("COMPLETED", JobState::Terminated),
    ("CANCELLED", JobState::Failed),
    ("FAILED", JobState::Failed),
    ("TIMEOUT", JobState::Failed),
    ("NODE_FAIL", JobState::Failed),
    ("OUT_OF_MEMORY", JobState::Failed),
    ("BOOT_FAIL", JobState::Failed),
    ("DEADLINE", JobState::Failed),
    ("PREEMPTED", JobState::Failed),
    ("REVOKED", JobState::Failed),
    ("SPECIAL_EXIT", JobState::Failed),
];

pub fn parse_state(state: &str) -> Result<JobState> {
    // squeue may append a reason, e.g. "CANCELLED by 1000"
    let name = state.split_whitespace().next().unwrap_or_default();
    STATE_TABLE
        .iter()
        .find(|(known, _)| *known == name)
        .map(|(_, state)| *state)
        .ok_or_else(|| LauncherError::unknown_state("slurm", state))
}

/// `sbatch --parsable` prints `<id>` or `<id>;<cluster>`
pub fn parse_submit_output(stdout: &str) -> Option<JobId> {
    let line = stdout.lines().map(str::trim).find(|l| !l.is_empty())?;
    let id = line.split(';').next()?.trim();
    (!id.is_empty() && id.chars().all(|c| c.is_ascii_digit() || c == '_')).then(|| JobId::new(id))
}

/// Parse `%i|%T|%N` lines into job id → (state, node list)
pub fn parse_squeue(stdout: &str) -> Result<HashMap<JobId, (JobState, Option<String>)>> {
    let mut states = HashMap::new();
    for line in stdout.lines().map(str::trim).filter(|l| !l.is_empty()) {
        let mut parts = line.splitn(3, '|');
        let (Some(id), Some(state)) = (parts.next(), parts.next()) else {
            warn!(line = %line, "Malformed squeue line");
            continue;
        };
        let node = parts
            .next()
            .map(str::trim)
            .filter(|n| !n.is_empty() && *n != "(null)")
            .map(str::to_string);
        states.insert(JobId::new(id.trim()), (parse_state(state.trim())?, node));
    }
    Ok(states)
}

pub struct SlurmScheduler {
    timeout: Duration,
}

impl SlurmScheduler {
    pub fn new() -> Self {
        Self {
            timeout: DEFAULT_COMMAND_TIMEOUT,
        }
    }

    /// Arguments passed to sbatch for `request`
    pub fn sbatch_args(request: &SubmitRequest) -> Vec<String> {
        let mut args = vec!["--parsable".to_string(), format!("--job-name={}", request.name)];
        if let Some(dir) = &request.output_dir {
            args.push(format!("--output={}/{}.%j.log", dir.display(), request.name));
        }
        if !request.environment.is_empty() {
            let exports: Vec<String> = request
                .environment
                .iter()
                .map(|(k, v)| format!("{}={}", k, v))
                .collect();
            args.push(format!("--export=ALL,{}", exports.join(",")));
        }
        args.extend(request.options.iter().cloned());

        let components: Vec<String> = request
            .commands
            .iter()
            .map(|c| format!("--ntasks={} {}", c.ranks, c.shell_line()))
            .collect();
        args.push("--wrap".to_string());
        args.push(format!("srun {}", components.join(" : ")));
        args
    }
}

impl Default for SlurmScheduler {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Scheduler for SlurmScheduler {
    fn name(&self) -> &'static str {
        "slurm"
    }

    async fn submit(&self, request: &SubmitRequest) -> Result<Job> {
        let output = run_command("sbatch", &Self::sbatch_args(request), self.timeout).await?;

        match parse_submit_output(&output.stdout).filter(|_| output.success()) {
            Some(id) => {
                info!(job_id = %id, name = %request.name, "Slurm job submitted");
                Ok(Job::new(id, JobState::Waiting))
            }
            None => {
                warn!(
                    name = %request.name,
                    exit_code = ?output.exit_code,
                    stderr = %output.stderr.trim(),
                    "sbatch rejected the job"
                );
                Ok(Job::new(JobId::new(format!("rejected-{}", request.name)), JobState::Error))
            }
        }
    }

    async fn cancel(&self, jobs: &[JobId]) -> Result<()> {
        if jobs.is_empty() {
            return Ok(());
        }
        let args: Vec<String> = jobs.iter().map(|id| id.to_string()).collect();
        let output = run_command("scancel", &args, self.timeout).await?;
        if !output.success() {
            debug!(stderr = %output.stderr.trim(), "scancel reported an error");
        }
        Ok(())
    }

    async fn update_status(&self, jobs: &mut [Job]) -> Result<()> {
        let ids: Vec<String> = jobs
            .iter()
            .filter(|j| j.state != JobState::Error)
            .map(|j| j.id.to_string())
            .collect();
        if ids.is_empty() {
            return Ok(());
        }

        let args = vec![
            "--noheader".to_string(),
            "--format=%i|%T|%N".to_string(),
            format!("--jobs={}", ids.join(",")),
        ];
        let output = run_command("squeue", &args, self.timeout).await?;

        let states = if output.success() {
            parse_squeue(&output.stdout)?
        } else if output.stderr.contains("Invalid job id") {
            // none of the jobs is listed anymore
            HashMap::new()
        } else {
            return Err(LauncherError::scheduler(format!(
                "squeue failed: {}",
                output.stderr.trim()
            )));
        };

        for job in jobs.iter_mut().filter(|j| j.state != JobState::Error) {
            match states.get(&job.id) {
                Some((state, node)) => {
                    job.state = *state;
                    if node.is_some() {
                        job.node_name = node.clone();
                    }
                }
                None => job.state = JobState::Terminated,
            }
        }
        Ok(())
    }
}
