//! OAR back-end
//!
//! - submit: `oarsub --name=<name> [options] "<script>"`, id read from `OAR_JOB_ID=`
//! - status: `oarstat -s -j <id> -j <id>...`, lines `<id>: <State>`
//! - cancel: `oardel <ids>`
//!
//! Several commands run inside one allocation as background processes
//! followed by `wait`.

use super::{DEFAULT_COMMAND_TIMEOUT, Job, Scheduler, SubmitRequest, run_command, shell_quote};
use crate::error::{LauncherError, Result};
use async_trait::async_trait;
use melissa_core::{JobId, JobState};
use std::collections::HashMap;
use std::time::Duration;
use tracing::{debug, info, warn};

const STATE_TABLE: &[(&str, JobState)] = &[
    ("Waiting", JobState::Waiting),
    ("Hold", JobState::Waiting),
    ("toLaunch", JobState::Waiting),
    ("toAckReservation", JobState::Waiting),
    ("Launching", JobState::Waiting),
    ("Running", JobState::Running),
    ("Suspended", JobState::Running),
    ("Resuming", JobState::Running),
    ("Finishing", JobState::Running),
    ("Terminated", JobState::Terminated),
    ("toError", JobState::Failed),
    ("Error", JobState::Failed),
];

pub fn parse_state(state: &str) -> Result<JobState> {
    STATE_TABLE
        .iter()
        .find(|(known, _)| *known == state)
        .map(|(_, state)| *state)
        .ok_or_else(|| LauncherError::unknown_state("oar", state))
}

/// Find `OAR_JOB_ID=<id>` in oarsub output
pub fn parse_submit_output(stdout: &str) -> Option<JobId> {
    stdout
        .lines()
        .find_map(|line| line.trim().strip_prefix("OAR_JOB_ID="))
        .map(str::trim)
        .filter(|id| !id.is_empty())
        .map(JobId::new)
}

/// Parse `oarstat -s` lines (`<id>: <State>`)
pub fn parse_oarstat(stdout: &str) -> Result<HashMap<JobId, JobState>> {
    let mut states = HashMap::new();
    for line in stdout.lines().map(str::trim).filter(|l| !l.is_empty()) {
        let Some((id, state)) = line.split_once(':') else {
            warn!(line = %line, "Malformed oarstat line");
            continue;
        };
        states.insert(JobId::new(id.trim()), parse_state(state.trim())?);
    }
    Ok(states)
}

pub struct OarScheduler {
    timeout: Duration,
}

impl OarScheduler {
    pub fn new() -> Self {
        Self {
            timeout: DEFAULT_COMMAND_TIMEOUT,
        }
    }

    /// Shell script run inside the allocation
    pub fn script(request: &SubmitRequest) -> String {
        let mut parts: Vec<String> = request
            .environment
            .iter()
            .map(|(k, v)| format!("export {}={};", k, shell_quote(v)))
            .collect();

        let lines: Vec<String> = request
            .commands
            .iter()
            .map(|c| {
                if c.ranks > 1 {
                    format!("mpirun -np {} {}", c.ranks, c.shell_line())
                } else {
                    c.shell_line()
                }
            })
            .collect();

        if request.is_heterogeneous() {
            for line in lines {
                parts.push(format!("{} &", line));
            }
            parts.push("wait".to_string());
        } else {
            parts.extend(lines);
        }
        parts.join(" ")
    }

    pub fn oarsub_args(request: &SubmitRequest) -> Vec<String> {
        let mut args = vec![format!("--name={}", request.name)];
        if let Some(dir) = &request.output_dir {
            args.push(format!("--stdout={}/{}.%jobid%.log", dir.display(), request.name));
            args.push(format!("--stderr={}/{}.%jobid%.log", dir.display(), request.name));
        }
        args.extend(request.options.iter().cloned());
        args.push(Self::script(request));
        args
    }
}

impl Default for OarScheduler {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Scheduler for OarScheduler {
    fn name(&self) -> &'static str {
        "oar"
    }

    async fn submit(&self, request: &SubmitRequest) -> Result<Job> {
        let output = run_command("oarsub", &Self::oarsub_args(request), self.timeout).await?;

        match parse_submit_output(&output.stdout).filter(|_| output.success()) {
            Some(id) => {
                info!(job_id = %id, name = %request.name, "OAR job submitted");
                Ok(Job::new(id, JobState::Waiting))
            }
            None => {
                warn!(
                    name = %request.name,
                    exit_code = ?output.exit_code,
                    stderr = %output.stderr.trim(),
                    "oarsub rejected the job"
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
        let output = run_command("oardel", &args, self.timeout).await?;
        if !output.success() {
            debug!(stderr = %output.stderr.trim(), "oardel reported an error");
        }
        Ok(())
    }

    async fn update_status(&self, jobs: &mut [Job]) -> Result<()> {
        let mut args = vec!["-s".to_string()];
        for job in jobs.iter().filter(|j| j.state != JobState::Error) {
            args.push("-j".to_string());
            args.push(job.id.to_string());
        }
        if args.len() == 1 {
            return Ok(());
        }

        let output = run_command("oarstat", &args, self.timeout).await?;
        if !output.success() {
            return Err(LauncherError::scheduler(format!(
                "oarstat failed: {}",
                output.stderr.trim()
            )));
        }
        let states = parse_oarstat(&output.stdout)?;

        for job in jobs.iter_mut().filter(|j| j.state != JobState::Error) {
            job.state = states.get(&job.id).copied().unwrap_or(JobState::Terminated);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler::CommandSpec;

    #[test]
    fn test_parse_state() {
        assert_eq!(parse_state("Waiting").unwrap(), JobState::Waiting);
        assert_eq!(parse_state("Running").unwrap(), JobState::Running);
        assert_eq!(parse_state("Terminated").unwrap(), JobState::Terminated);
        assert_eq!(parse_state("Error").unwrap(), JobState::Failed);
        assert!(parse_state("running").is_err());
    }

    #[test]
    fn test_parse_submit_output() {
        let stdout = "[ADMISSION RULE] Set default walltime to 7200.\nOAR_JOB_ID=4242\n";
        assert_eq!(parse_submit_output(stdout), Some(JobId::new("4242")));
        assert_eq!(parse_submit_output("# Error: walltime too big"), None);
    }

    #[test]
    fn test_parse_oarstat() {
        let states = parse_oarstat("4242: Running\n4243: Waiting\n").unwrap();
        assert_eq!(states[&JobId::new("4242")], JobState::Running);
        assert_eq!(states[&JobId::new("4243")], JobState::Waiting);
        assert!(parse_oarstat("4244: Exploded").is_err());
    }

    #[test]
    fn test_heterogeneous_script() {
        let request = SubmitRequest::new(
            "melissa-group-1",
            vec![
                CommandSpec::new("./heat", vec!["4".into()]),
                CommandSpec::new("./heat", vec!["5".into()]).with_ranks(4),
            ],
        )
        .env("MELISSA_LAUNCHER", "front:5555");

        assert_eq!(
            OarScheduler::script(&request),
            "export MELISSA_LAUNCHER=front:5555; ./heat 4 & mpirun -np 4 ./heat 5 & wait"
        );
    }

    #[test]
    fn test_single_command_script() {
        let request = SubmitRequest::new("melissa-server", vec![CommandSpec::new("melissa-server", vec![])]);
        let args = OarScheduler::oarsub_args(&request);
        assert_eq!(args, vec!["--name=melissa-server", "melissa-server"]);
    }
}
