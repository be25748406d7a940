//! Local back-end: jobs are child processes of the launcher
//!
//! A job is `Running` while any of its processes is alive, `Terminated`
//! once all exited with status 0 and `Failed` otherwise. Each process sees
//! its job id in `MELISSA_JOB_ID`. A job's processes are forgotten once
//! its final state has been reported; later polls of that id report
//! `Terminated`.

use super::{CommandSpec, Job, Scheduler, SubmitRequest};
use crate::error::Result;
use async_trait::async_trait;
use melissa_core::{JobId, JobState};
use std::collections::HashMap;
use std::fs::File;
use std::process::Stdio;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::process::{Child, Command as AsyncCommand};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

pub struct LocalScheduler {
    next_id: AtomicU64,
    jobs: Mutex<HashMap<JobId, Vec<Child>>>,
}

impl LocalScheduler {
    pub fn new() -> Self {
        Self {
            next_id: AtomicU64::new(1),
            jobs: Mutex::new(HashMap::new()),
        }
    }

    fn command(spec: &CommandSpec) -> AsyncCommand {
        if spec.ranks > 1 {
            let mut command = AsyncCommand::new("mpirun");
            command
                .arg("-n")
                .arg(spec.ranks.to_string())
                .arg(&spec.program)
                .args(&spec.args);
            command
        } else {
            let mut command = AsyncCommand::new(&spec.program);
            command.args(&spec.args);
            command
        }
    }

    fn spawn_all(request: &SubmitRequest, id: &JobId) -> std::io::Result<Vec<Child>> {
        let log = match &request.output_dir {
            Some(dir) => {
                std::fs::create_dir_all(dir)?;
                Some(File::create(dir.join(format!("{}.{}.log", request.name, id)))?)
            }
            None => None,
        };

        let mut children = Vec::with_capacity(request.commands.len());
        for spec in &request.commands {
            let mut command = Self::command(spec);
            command
                .envs(request.environment.iter().map(|(k, v)| (k.as_str(), v.as_str())))
                .env("MELISSA_JOB_ID", id.as_str())
                .stdin(Stdio::null())
                .kill_on_drop(true);
            match &log {
                Some(file) => {
                    command.stdout(file.try_clone()?).stderr(file.try_clone()?);
                }
                None => {
                    command.stdout(Stdio::null()).stderr(Stdio::null());
                }
            }

            match command.spawn() {
                Ok(child) => children.push(child),
                Err(e) => {
                    for child in &mut children {
                        let _ = child.start_kill();
                    }
                    return Err(e);
                }
            }
        }
        Ok(children)
    }
}

impl Default for LocalScheduler {
    fn default() -> Self {
        Self::new()
    }
}

/// State of a job from the exit status of its processes (`None` = alive)
fn aggregate_state(exits: &[Option<bool>]) -> JobState {
    if exits.iter().any(Option::is_none) {
        JobState::Running
    } else if exits.iter().all(|exit| *exit == Some(true)) {
        JobState::Terminated
    } else {
        JobState::Failed
    }
}

#[async_trait]
impl Scheduler for LocalScheduler {
    fn name(&self) -> &'static str {
        "local"
    }

    async fn submit(&self, request: &SubmitRequest) -> Result<Job> {
        let id = JobId::new(self.next_id.fetch_add(1, Ordering::Relaxed).to_string());

        let mut job = Job::new(id.clone(), JobState::Running);
        job.node_name = Some("localhost".to_string());

        match Self::spawn_all(request, &id) {
            Ok(children) => {
                info!(
                    job_id = %id,
                    name = %request.name,
                    processes = children.len(),
                    "Local job started"
                );
                self.jobs.lock().await.insert(id, children);
            }
            Err(e) => {
                warn!(job_id = %id, name = %request.name, error = %e, "Local job failed to start");
                job.state = JobState::Error;
            }
        }
        Ok(job)
    }

    async fn cancel(&self, jobs: &[JobId]) -> Result<()> {
        let mut running = self.jobs.lock().await;
        for id in jobs {
            if let Some(children) = running.get_mut(id) {
                debug!(job_id = %id, "Killing local job");
                for child in children.iter_mut() {
                    if let Err(e) = child.start_kill() {
                        debug!(job_id = %id, error = %e, "Kill failed, process already gone");
                    }
                }
            }
        }
        Ok(())
    }

    async fn update_status(&self, jobs: &mut [Job]) -> Result<()> {
        let mut running = self.jobs.lock().await;
        for job in jobs.iter_mut() {
            if job.state == JobState::Error {
                continue;
            }
            let Some(children) = running.get_mut(&job.id) else {
                job.state = JobState::Terminated;
                continue;
            };
            let mut exits = Vec::with_capacity(children.len());
            for child in children.iter_mut() {
                exits.push(match child.try_wait() {
                    Ok(Some(status)) => Some(status.success()),
                    Ok(None) => None,
                    Err(e) => {
                        warn!(job_id = %job.id, error = %e, "Failed to poll local process");
                        Some(false)
                    }
                });
            }
            job.state = aggregate_state(&exits);
            if job.state.is_final() {
                debug!(job_id = %job.id, state = ?job.state, "Local job reaped");
                running.remove(&job.id);
            }
        }
        Ok(())
    }
}
