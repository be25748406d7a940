//! Fault detection and recovery
//!
//! Each cycle reconciles the two views kept by every record:
//!
//! ```text
//! job_status (scheduler)   status (aggregator)          fault
//! ----------------------   -------------------          -----
//! final                    below FINISHED               crashed
//! not final                RUNNING past the timeout     hung
//! any                      TIMEOUT                      timed out
//! ```
//!
//! A faulty group is restarted until it has used its [`CRASH_THRESHOLD`]
//! restarts; the next fault drops it for good and the aggregator is told to
//! stop waiting for its simulations.
//!
//! A server fault starts the reboot sequence:
//!
//! ```text
//! cancel active groups ──► relaunch server (restart, first job id)
//!        ──► wait for SERVER ──► resubmit the cancelled groups
//! ```
//!
//! Only one reboot sequence runs at a time.

use crate::error::{LauncherError, Result};
use crate::hooks::{GroupLaunch, ServerLaunch, StudyHooks};
use crate::job::{CRASH_THRESHOLD, GroupRecord, Registry, ServerRecord};
use melissa_core::{ControlEndpoint, GroupId, JobId, JobState, Message, ProcessStatus, SimulationId};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, Notify};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

/// Interval between "still waiting" reports while the server is queued
const SERVER_WAIT_REPORT_INTERVAL: Duration = Duration::from_secs(60);

/// Why a group needs attention
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GroupFault {
    /// The job ended before the aggregator saw every simulation finish
    Crashed(JobState),
    /// The aggregator has seen the group running for longer than the timeout
    Hung(Duration),
    /// The aggregator stopped hearing from one of the simulations
    TimedOut,
}

impl fmt::Display for GroupFault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GroupFault::Crashed(state) => write!(f, "job ended as {:?}", state),
            GroupFault::Hung(elapsed) => write!(f, "running for {:.0}s", elapsed.as_secs_f64()),
            GroupFault::TimedOut => write!(f, "aggregator timeout"),
        }
    }
}

/// Outcome of reconciling one group
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GroupAction {
    Keep,
    Restart(GroupFault),
    Drop(GroupFault),
}

/// Reconcile the scheduler and aggregator views of `group`
pub fn assess_group(group: &GroupRecord, now: Instant, simulation_timeout: Duration) -> GroupAction {
    if !group.is_active() || group.job.is_none() {
        return GroupAction::Keep;
    }

    let fault = if group.status == ProcessStatus::Timeout {
        Some(GroupFault::TimedOut)
    } else if group.job_status.is_final() {
        Some(GroupFault::Crashed(group.job_status))
    } else if group.status == ProcessStatus::Running {
        group
            .start_time
            .map(|start| now.saturating_duration_since(start))
            .filter(|elapsed| *elapsed > simulation_timeout)
            .map(GroupFault::Hung)
    } else {
        None
    };

    match fault {
        None => GroupAction::Keep,
        Some(fault) if group.nb_restarts >= CRASH_THRESHOLD => GroupAction::Drop(fault),
        Some(fault) => GroupAction::Restart(fault),
    }
}

/// Why the server needs a reboot
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerFault {
    JobEnded(JobState),
    /// No control-plane message within the server timeout
    Silent,
}

impl fmt::Display for ServerFault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ServerFault::JobEnded(state) => write!(f, "job ended as {:?}", state),
            ServerFault::Silent => write!(f, "no message within the server timeout"),
        }
    }
}

/// A queued (WAITING) server is not a fault; neither is one that sent DONE
pub fn assess_server(server: &ServerRecord) -> Option<ServerFault> {
    if server.job.is_none() || server.is_finished() {
        return None;
    }
    if server.job_status.is_final() {
        Some(ServerFault::JobEnded(server.job_status))
    } else if server.status == ProcessStatus::Timeout {
        Some(ServerFault::Silent)
    } else {
        None
    }
}

/// Timing knobs of the detector
#[derive(Debug, Clone, Copy)]
pub struct FaultPolicy {
    pub simulation_timeout: Duration,
    /// Re-check period while waiting for the server
    pub poll_interval: Duration,
}

/// What one cycle did
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CycleOutcome {
    pub restarted: usize,
    pub dropped: usize,
    pub rebooted: bool,
}

/// Applies the restart policy and owns every (re)submission
pub struct FaultDetector {
    registry: Arc<Registry>,
    hooks: Arc<dyn StudyHooks>,
    control: Arc<ControlEndpoint>,
    policy: FaultPolicy,
    /// Notified by the message loop on SERVER
    server_ready: Arc<Notify>,
    reboot_lock: Mutex<()>,
}

impl FaultDetector {
    pub fn new(
        registry: Arc<Registry>,
        hooks: Arc<dyn StudyHooks>,
        control: Arc<ControlEndpoint>,
        policy: FaultPolicy,
    ) -> Self {
        Self {
            registry,
            hooks,
            control,
            policy,
            server_ready: Arc::new(Notify::new()),
            reboot_lock: Mutex::new(()),
        }
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    pub fn server_ready(&self) -> Arc<Notify> {
        self.server_ready.clone()
    }

    /// Submit the server and wait until it sent SERVER. Returns its node.
    pub async fn start_server(&self) -> Result<String> {
        self.launch_server(false).await?;
        self.wait_for_server().await
    }

    async fn launch_server(&self, restart: bool) -> Result<()> {
        let launch = {
            let mut server = self.registry.server().lock().await;
            server.begin_launch();
            ServerLaunch {
                options_string: server.options_string.clone(),
                first_job_id: if restart { server.first_job_id.clone() } else { None },
                restart,
            }
        };

        let resumed = if restart {
            match self.hooks.restart_server(&launch).await {
                Ok(job) => job,
                Err(e) => {
                    warn!(error = %e, "restart_server hook failed, relaunching");
                    None
                }
            }
        } else {
            None
        };
        let job = match resumed {
            Some(job) => job,
            None => self
                .hooks
                .launch_server(&launch)
                .await
                .map_err(|e| LauncherError::hook("launch_server", e))?,
        };

        info!(job_id = %job.id, restart, "Server submitted");
        self.registry.server().lock().await.mark_launched(job);
        Ok(())
    }

    /// Wait for the SERVER handshake.
    ///
    /// A server job that ends first is relaunched; a submission the
    /// scheduler rejected outright is fatal.
    pub async fn wait_for_server(&self) -> Result<String> {
        let started = Instant::now();
        let mut last_report = started;

        loop {
            let notified = self.server_ready.notified();
            let (ready, ended) = {
                let server = self.registry.server().lock().await;
                let ready = matches!(server.status, ProcessStatus::Running | ProcessStatus::Finished)
                    .then(|| server.node_name.clone().unwrap_or_default());
                (ready, server.job_status.is_final().then_some(server.job_status))
            };

            if let Some(node) = ready {
                info!(
                    node = %node,
                    waited_secs = started.elapsed().as_secs_f64(),
                    "Server is ready"
                );
                return Ok(node);
            }

            match ended {
                Some(JobState::Error) => {
                    return Err(LauncherError::study("the scheduler rejected the server job"));
                }
                Some(state) => {
                    warn!(state = ?state, "Server job ended before it was ready, relaunching");
                    self.launch_server(true).await?;
                    self.registry.server().lock().await.reboots += 1;
                    continue;
                }
                None => {}
            }

            if last_report.elapsed() >= SERVER_WAIT_REPORT_INTERVAL {
                info!(
                    waited_secs = started.elapsed().as_secs_f64(),
                    "Still waiting for the server"
                );
                last_report = Instant::now();
            }
            let _ = tokio::time::timeout(self.policy.poll_interval, notified).await;
        }
    }

    fn group(&self, id: GroupId) -> Result<&Arc<Mutex<GroupRecord>>> {
        self.registry
            .group(id)
            .ok_or_else(|| LauncherError::study(format!("unknown group {}", id)))
    }

    async fn group_launch(&self, id: GroupId) -> Result<GroupLaunch> {
        let server_node = self.registry.server().lock().await.node_name.clone();
        let mut group = self.group(id)?.lock().await;
        group.begin_launch();
        Ok(GroupLaunch::from_record(&group, server_node))
    }

    /// Submit group `id` without touching its restart budget
    pub async fn submit_group(&self, id: GroupId) -> Result<()> {
        let launch = self.group_launch(id).await?;
        let job = self
            .hooks
            .launch_group(&launch)
            .await
            .map_err(|e| LauncherError::hook("launch_group", e))?;

        debug!(group = %id, job_id = %job.id, "Group submitted");
        self.group(id)?.lock().await.mark_launched(job);
        Ok(())
    }

    /// Request cancellation. Transient scheduler failures are only logged.
    pub async fn cancel(&self, jobs: &[JobId]) -> Result<()> {
        if jobs.is_empty() {
            return Ok(());
        }
        match self.hooks.cancel_job(jobs).await {
            Ok(()) => {
                debug!(jobs = ?jobs, "Cancellation requested");
                Ok(())
            }
            Err(e) => {
                let e = LauncherError::from_hook("cancel_job", e);
                if e.is_fatal() {
                    return Err(e);
                }
                warn!(error = %e, jobs = ?jobs, "Cancellation failed, the next poll will tell");
                Ok(())
            }
        }
    }

    /// Reconcile the server and every group once
    pub async fn cycle(&self) -> Result<CycleOutcome> {
        let mut outcome = CycleOutcome::default();

        let server_fault = assess_server(&*self.registry.server().lock().await);
        if let Some(fault) = server_fault {
            self.reboot_server(fault).await?;
            outcome.rebooted = true;
        }

        let now = Instant::now();
        for group in self.registry.groups() {
            let (id, action) = {
                let group = group.lock().await;
                (group.id, assess_group(&group, now, self.policy.simulation_timeout))
            };
            match action {
                GroupAction::Keep => {}
                GroupAction::Restart(fault) => {
                    self.restart_group(id, fault).await?;
                    outcome.restarted += 1;
                }
                GroupAction::Drop(fault) => {
                    self.drop_group(id, fault).await?;
                    outcome.dropped += 1;
                }
            }
        }
        Ok(outcome)
    }

    async fn restart_group(&self, id: GroupId, fault: GroupFault) -> Result<()> {
        let (live_job, nb_restarts) = {
            let mut group = self.group(id)?.lock().await;
            group.nb_restarts += 1;
            let live = group.job_id().filter(|_| !group.job_status.is_final()).cloned();
            (live, group.nb_restarts)
        };
        warn!(
            group = %id,
            fault = %fault,
            restart = nb_restarts,
            max_restarts = CRASH_THRESHOLD,
            "Restarting group"
        );

        if let Some(job) = live_job {
            self.cancel(&[job]).await?;
        }

        let launch = self.group_launch(id).await?;
        let resumed = match self.hooks.restart_group(&launch).await {
            Ok(job) => job,
            Err(e) => {
                warn!(group = %id, error = %e, "restart_group hook failed, relaunching");
                None
            }
        };
        let job = match resumed {
            Some(job) => job,
            None => self
                .hooks
                .launch_group(&launch)
                .await
                .map_err(|e| LauncherError::hook("launch_group", e))?,
        };

        self.group(id)?.lock().await.mark_launched(job);
        Ok(())
    }

    async fn drop_group(&self, id: GroupId, fault: GroupFault) -> Result<()> {
        let (simulations, job_id, live) = {
            let mut group = self.group(id)?.lock().await;
            group.dropped = true;
            (
                group.simulations.clone(),
                group.job_id().cloned(),
                !group.job_status.is_final(),
            )
        };
        error!(
            group = %id,
            fault = %fault,
            restarts = CRASH_THRESHOLD,
            "Group exceeded its crash budget and is permanently dropped"
        );

        let job_id = job_id.unwrap_or_else(|| JobId::new("none"));
        if live {
            self.cancel(std::slice::from_ref(&job_id)).await?;
        }
        self.send_drops(simulations, &job_id).await
    }

    async fn send_drops(&self, simulations: Vec<SimulationId>, job_id: &JobId) -> Result<()> {
        for simulation_id in simulations {
            self.control
                .send(Message::Drop {
                    simulation_id,
                    job_id: job_id.clone(),
                })
                .await?;
        }
        Ok(())
    }

    async fn reboot_server(&self, fault: ServerFault) -> Result<()> {
        let _reboot = self.reboot_lock.lock().await;

        let server_job = {
            let server = self.registry.server().lock().await;
            if assess_server(&server).is_none() {
                return Ok(());
            }
            server.job_id().filter(|_| !server.job_status.is_final()).cloned()
        };
        warn!(fault = %fault, "Server fault, starting reboot sequence");

        let mut to_cancel: Vec<JobId> = server_job.into_iter().collect();
        let mut suspended = Vec::new();
        let mut dropped = Vec::new();
        for group in self.registry.groups() {
            let mut group = group.lock().await;
            if group.dropped {
                let job_id = group.job_id().cloned().unwrap_or_else(|| JobId::new("none"));
                dropped.push((group.simulations.clone(), job_id));
                continue;
            }
            if !group.is_active() || group.job.is_none() {
                continue;
            }
            if !group.job_status.is_final() {
                to_cancel.extend(group.job_id().cloned());
            }
            group.mark_suspended();
            suspended.push(group.id);
        }
        self.cancel(&to_cancel).await?;

        self.launch_server(true).await?;
        let reboots = {
            let mut server = self.registry.server().lock().await;
            server.reboots += 1;
            server.reboots
        };
        let node = self.wait_for_server().await?;

        // the restored checkpoint may predate some drops
        let replayed = dropped.len();
        for (simulations, job_id) in dropped {
            self.send_drops(simulations, &job_id).await?;
        }
        for id in &suspended {
            self.submit_group(*id).await?;
        }
        info!(
            reboots,
            node = %node,
            resubmitted = suspended.len(),
            replayed_drops = replayed,
            "Server reboot complete"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler::Job;
    use async_trait::async_trait;
    use melissa_core::{CouplingMode, SimulationId};
    use std::sync::Mutex as StdMutex;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[derive(Default)]
    struct Recorder {
        counter: AtomicU32,
        servers: StdMutex<Vec<ServerLaunch>>,
        groups: StdMutex<Vec<GroupId>>,
        cancelled: StdMutex<Vec<JobId>>,
    }

    #[async_trait]
    impl StudyHooks for Recorder {
        async fn launch_server(&self, server: &ServerLaunch) -> anyhow::Result<Job> {
            let n = self.counter.fetch_add(1, Ordering::SeqCst) + 1;
            self.servers.lock().unwrap().push(server.clone());
            Ok(Job::new(JobId::new(format!("server-{n}")), JobState::Running))
        }

        async fn launch_group(&self, group: &GroupLaunch) -> anyhow::Result<Job> {
            let n = self.counter.fetch_add(1, Ordering::SeqCst) + 1;
            self.groups.lock().unwrap().push(group.group);
            Ok(Job::new(JobId::new(format!("group-{}-{n}", group.group)), JobState::Running))
        }

        async fn check_server_job(&self, _job: &mut Job) -> anyhow::Result<()> {
            Ok(())
        }

        async fn check_group_job(&self, _job: &mut Job) -> anyhow::Result<()> {
            Ok(())
        }

        async fn cancel_job(&self, jobs: &[JobId]) -> anyhow::Result<()> {
            self.cancelled.lock().unwrap().extend_from_slice(jobs);
            Ok(())
        }
    }

    fn detector(nb_groups: u32, simulation_timeout: Duration) -> (FaultDetector, Arc<Recorder>, ControlEndpoint) {
        let groups = (0..nb_groups)
            .map(|g| GroupRecord::independent(GroupId(g), vec![0.5], CouplingMode::None))
            .collect();
        let registry = Arc::new(Registry::new(ServerRecord::new("{}".into()), groups, false, 1));
        let recorder = Arc::new(Recorder::default());
        let (launcher, server) = ControlEndpoint::pair();
        let detector = FaultDetector::new(
            registry,
            recorder.clone(),
            Arc::new(launcher),
            FaultPolicy {
                simulation_timeout,
                poll_interval: Duration::from_millis(5),
            },
        );
        (detector, recorder, server)
    }

    /// Stands in for the message loop: acknowledges every launched server
    fn spawn_ready_marker(registry: Arc<Registry>, ready: Arc<Notify>) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                {
                    let mut server = registry.server().lock().await;
                    if server.status == ProcessStatus::Pending && server.job.is_some() {
                        server.mark_ready("node1".into());
                        ready.notify_waiters();
                    }
                }
                tokio::time::sleep(Duration::from_millis(2)).await;
            }
        })
    }

    fn launched(id: &str) -> GroupRecord {
        let mut group = GroupRecord::independent(GroupId(0), vec![0.5], CouplingMode::None);
        group.begin_launch();
        group.mark_launched(Job::new(JobId::new(id), JobState::Running));
        group
    }

    #[test]
    fn test_assess_group_rules() {
        let timeout = Duration::from_secs(10);
        let now = Instant::now();

        let group = launched("1");
        assert_eq!(assess_group(&group, now, timeout), GroupAction::Keep);

        let mut crashed = launched("1");
        crashed.status = ProcessStatus::Running;
        crashed.job_status = JobState::Terminated;
        assert_eq!(
            assess_group(&crashed, now, timeout),
            GroupAction::Restart(GroupFault::Crashed(JobState::Terminated))
        );

        let mut hung = launched("1");
        hung.status = ProcessStatus::Running;
        let later = now + Duration::from_secs(11);
        assert!(matches!(
            assess_group(&hung, later, timeout),
            GroupAction::Restart(GroupFault::Hung(_))
        ));

        let mut queued = launched("1");
        queued.job_status = JobState::Waiting;
        assert_eq!(assess_group(&queued, later, timeout), GroupAction::Keep);

        let mut silent = launched("1");
        silent.mark_timeout();
        silent.nb_restarts = CRASH_THRESHOLD;
        assert_eq!(
            assess_group(&silent, now, timeout),
            GroupAction::Drop(GroupFault::TimedOut)
        );

        let mut finished = launched("1");
        finished.record_simulation_status(SimulationId(0), ProcessStatus::Finished);
        finished.job_status = JobState::Terminated;
        assert_eq!(assess_group(&finished, later, timeout), GroupAction::Keep);
    }

    #[test]
    fn test_assess_server_rules() {
        let mut server = ServerRecord::new(String::new());
        assert_eq!(assess_server(&server), None);

        server.begin_launch();
        server.mark_launched(Job::new(JobId::new("7"), JobState::Waiting));
        assert_eq!(assess_server(&server), None);

        server.job_status = JobState::Failed;
        assert_eq!(assess_server(&server), Some(ServerFault::JobEnded(JobState::Failed)));

        server.job_status = JobState::Running;
        server.status = ProcessStatus::Timeout;
        assert_eq!(assess_server(&server), Some(ServerFault::Silent));

        server.status = ProcessStatus::Finished;
        server.job_status = JobState::Terminated;
        assert_eq!(assess_server(&server), None);
    }

    #[tokio::test]
    async fn test_crash_budget_then_drop() {
        let (detector, recorder, aggregator) = detector(1, Duration::from_secs(60));
        detector.submit_group(GroupId(0)).await.unwrap();
        let group = detector.registry().group(GroupId(0)).unwrap().clone();

        for round in 1..=CRASH_THRESHOLD {
            group.lock().await.job_status = JobState::Failed;
            let outcome = detector.cycle().await.unwrap();
            assert_eq!(outcome.restarted, 1);
            assert_eq!(group.lock().await.nb_restarts, round);
        }

        group.lock().await.job_status = JobState::Failed;
        let outcome = detector.cycle().await.unwrap();
        assert_eq!(outcome.dropped, 1);

        let group = group.lock().await;
        assert!(group.dropped);
        assert_eq!(group.nb_restarts, CRASH_THRESHOLD);
        assert_eq!(recorder.groups.lock().unwrap().len(), 4);

        let message = aggregator.recv_timeout(Duration::from_secs(1)).await.unwrap();
        assert!(matches!(
            message,
            Some(Message::Drop { simulation_id: SimulationId(0), .. })
        ));

        // dropped groups are never looked at again
        drop(group);
        assert_eq!(detector.cycle().await.unwrap(), CycleOutcome::default());
        assert!(detector.registry().all_converged().await);
    }

    #[tokio::test]
    async fn test_hung_group_is_cancelled_before_restart() {
        let (detector, recorder, _aggregator) = detector(1, Duration::from_millis(20));
        detector.submit_group(GroupId(0)).await.unwrap();
        detector.registry().group(GroupId(0)).unwrap().lock().await.status = ProcessStatus::Running;
        tokio::time::sleep(Duration::from_millis(40)).await;

        let outcome = detector.cycle().await.unwrap();
        assert_eq!(outcome.restarted, 1);
        assert_eq!(*recorder.cancelled.lock().unwrap(), vec![JobId::new("group-0-1")]);

        let group = detector.registry().group(GroupId(0)).unwrap().lock().await;
        assert_eq!(group.job_id(), Some(&JobId::new("group-0-2")));
        assert_eq!(group.status, ProcessStatus::Pending);
    }

    #[tokio::test]
    async fn test_server_reboot_resubmits_active_groups() {
        let (detector, recorder, _aggregator) = detector(2, Duration::from_secs(60));
        let marker = spawn_ready_marker(detector.registry().clone(), detector.server_ready());

        let node = detector.start_server().await.unwrap();
        assert_eq!(node, "node1");
        detector.submit_group(GroupId(0)).await.unwrap();
        detector.submit_group(GroupId(1)).await.unwrap();
        detector
            .registry()
            .group(GroupId(1))
            .unwrap()
            .lock()
            .await
            .record_simulation_status(SimulationId(1), ProcessStatus::Finished);

        detector.registry().server().lock().await.job_status = JobState::Failed;
        let outcome = detector.cycle().await.unwrap();
        assert!(outcome.rebooted);
        marker.abort();

        let servers = recorder.servers.lock().unwrap().clone();
        assert_eq!(servers.len(), 2);
        assert!(servers[1].restart);
        assert_eq!(servers[1].first_job_id, Some(JobId::new("server-1")));

        // only the active group was cancelled and resubmitted
        assert_eq!(*recorder.cancelled.lock().unwrap(), vec![JobId::new("group-0-2")]);
        assert_eq!(
            *recorder.groups.lock().unwrap(),
            vec![GroupId(0), GroupId(1), GroupId(0)]
        );

        let server = detector.registry().server().lock().await;
        assert_eq!(server.reboots, 1);
        assert_eq!(server.first_job_id, Some(JobId::new("server-1")));
        assert_eq!(server.status, ProcessStatus::Running);

        let group = detector.registry().group(GroupId(0)).unwrap().lock().await;
        assert_eq!(group.nb_restarts, 0);
        assert_eq!(group.job_id(), Some(&JobId::new("group-0-5")));
    }

    #[tokio::test]
    async fn test_server_reboot_replays_drops() {
        let (detector, recorder, aggregator) = detector(2, Duration::from_secs(60));
        let marker = spawn_ready_marker(detector.registry().clone(), detector.server_ready());

        detector.start_server().await.unwrap();
        detector.submit_group(GroupId(0)).await.unwrap();
        detector.submit_group(GroupId(1)).await.unwrap();
        {
            let mut group = detector.registry().group(GroupId(1)).unwrap().lock().await;
            group.dropped = true;
            group.job_status = JobState::Failed;
        }

        detector.registry().server().lock().await.job_status = JobState::Failed;
        assert!(detector.cycle().await.unwrap().rebooted);
        marker.abort();

        let mut drops = Vec::new();
        while let Some(message) = aggregator.recv_timeout(Duration::from_millis(100)).await.unwrap() {
            if let Message::Drop { simulation_id, job_id } = message {
                drops.push((simulation_id, job_id));
            }
        }
        assert_eq!(drops, vec![(SimulationId(1), JobId::new("group-1-3"))]);

        // the dropped group stays dropped, only group 0 is resubmitted
        assert_eq!(
            *recorder.groups.lock().unwrap(),
            vec![GroupId(0), GroupId(1), GroupId(0)]
        );
    }
}
