//! Study engine
//!
//! One [`Study`] drives one ensemble from sampling to STOP:
//!
//! ```text
//!                 ┌──────────────── Registry ────────────────┐
//!                 │  ServerRecord      GroupRecord x N       │
//!                 │  (one lock each)                         │
//!                 └───▲────────────────▲────────────────▲────┘
//!                     │                │                │
//!   state-poll loop ──┘  message loop ─┘  main sequence ┘
//!   check_*_job          SERVER, JOB-REQUEST,   submit, FaultDetector::cycle,
//!   every poll_interval  SIMU-STATUS, TIMEOUT,  STOP, stop
//!                        DONE; HELLO pings
//! ```
//!
//! Both watchdogs are spawned tasks. They stop on a shared `watch` signal
//! and report fatal errors to the main sequence over an `mpsc` channel.

use crate::config::StudyConfig;
use crate::error::{LauncherError, Result};
use crate::fault::{CycleOutcome, FaultDetector, FaultPolicy};
use crate::hooks::{GroupLaunch, StudyHooks};
use crate::job::{GroupRecord, Registry, ServerRecord};
use crate::sampling::uniform_parameter_set;
use melissa_core::{
    ControlEndpoint, GroupId, JobId, Message, ProcessStatus, ProtocolError, SimulationId,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Notify, mpsc, watch};
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

/// Final state of one group
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GroupReport {
    pub id: GroupId,
    pub simulations: Vec<SimulationId>,
    pub status: ProcessStatus,
    pub nb_restarts: u32,
    pub dropped: bool,
}

/// Outcome of [`Study::run`]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StudyReport {
    pub study_id: String,
    pub groups: Vec<GroupReport>,
    pub server_reboots: u32,
    pub stop_sent: bool,
    pub elapsed_secs: f64,
}

impl StudyReport {
    async fn collect(study_id: &str, registry: &Registry, stop_sent: bool, elapsed: Duration) -> Self {
        let mut groups = Vec::with_capacity(registry.groups().len());
        for group in registry.groups() {
            let group = group.lock().await;
            groups.push(GroupReport {
                id: group.id,
                simulations: group.simulations.clone(),
                status: group.status,
                nb_restarts: group.nb_restarts,
                dropped: group.dropped,
            });
        }
        Self {
            study_id: study_id.to_string(),
            groups,
            server_reboots: registry.server().lock().await.reboots,
            stop_sent,
            elapsed_secs: elapsed.as_secs_f64(),
        }
    }

    pub fn dropped_groups(&self) -> Vec<GroupId> {
        self.groups.iter().filter(|g| g.dropped).map(|g| g.id).collect()
    }

    pub fn finished_groups(&self) -> usize {
        self.groups
            .iter()
            .filter(|g| !g.dropped && g.status == ProcessStatus::Finished)
            .count()
    }

    pub fn group(&self, id: GroupId) -> Option<&GroupReport> {
        self.groups.iter().find(|g| g.id == id)
    }

    fn log(&self) {
        info!(
            study_id = %self.study_id,
            finished = self.finished_groups(),
            dropped = self.dropped_groups().len(),
            groups = self.groups.len(),
            server_reboots = self.server_reboots,
            elapsed_secs = self.elapsed_secs,
            "Study summary"
        );
        for group in self.groups.iter().filter(|g| g.dropped) {
            error!(
                "Group {} was permanently dropped after {} restarts (simulations {:?})",
                group.id, group.nb_restarts, group.simulations
            );
        }
    }
}

/// Orchestrates one study
pub struct Study {
    config: StudyConfig,
    hooks: Arc<dyn StudyHooks>,
    control: Arc<ControlEndpoint>,
    study_id: String,
}

impl Study {
    pub fn new(config: StudyConfig, hooks: Arc<dyn StudyHooks>, control: ControlEndpoint) -> Self {
        Self {
            config,
            hooks,
            control: Arc::new(control),
            study_id: uuid::Uuid::new_v4().to_string(),
        }
    }

    pub fn with_study_id(mut self, study_id: impl Into<String>) -> Self {
        self.study_id = study_id.into();
        self
    }

    pub fn study_id(&self) -> &str {
        &self.study_id
    }

    /// Run the study to completion.
    ///
    /// Jobs are cancelled and the watchdogs joined on every exit path. An
    /// error is returned only for fatal failures (mandatory hooks, unknown
    /// scheduler states, a dead control plane).
    pub async fn run(self) -> Result<StudyReport> {
        let started = Instant::now();
        let options = &self.config.study_options;

        info!("========================================");
        info!("Melissa study {}", self.study_id);
        info!("========================================");
        info!("  Groups: {}", options.sampling_size);
        info!("  Simulations: {}", self.config.expected_simulations());
        info!("  Parameters: {}", options.nb_parameters);
        info!("  Sobol': {}", self.config.is_sobol());
        info!("  Coupling: {}", options.coupling);
        info!("  Fields: {:?}", options.field_names);
        info!("========================================");

        if let Err(e) = self.hooks.create_study().await {
            warn!(error = %e, "create_study hook failed");
        }

        let registry = Arc::new(self.build_registry().await?);
        for group in registry.groups() {
            let launch = GroupLaunch::from_record(&*group.lock().await, None);
            if let Err(e) = self.hooks.create_group(&launch).await {
                warn!(group = %launch.group, error = %e, "create_group hook failed");
            }
        }

        let detector = FaultDetector::new(
            registry.clone(),
            self.hooks.clone(),
            self.control.clone(),
            FaultPolicy {
                simulation_timeout: self.config.simulation_timeout(),
                poll_interval: self.config.poll_interval(),
            },
        );

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (fatal_tx, mut fatal_rx) = mpsc::channel::<LauncherError>(4);

        let poller = tokio::spawn(state_poll_loop(
            registry.clone(),
            self.hooks.clone(),
            self.config.poll_interval(),
            shutdown_rx.clone(),
            fatal_tx,
        ));
        let listener = tokio::spawn(
            MessageLoop {
                registry: registry.clone(),
                control: self.control.clone(),
                server_ready: detector.server_ready(),
                ping_interval: self.config.ping_interval(),
                server_timeout: self.config.server_timeout(),
            }
            .run(shutdown_rx),
        );

        let outcome = tokio::select! {
            result = self.drive(&detector) => result,
            Some(e) = fatal_rx.recv() => Err(e),
        };
        if let Err(e) = &outcome {
            error!(error = %e, "Study aborted");
        }
        let stop_sent = outcome.is_ok();

        self.stop(&detector, stop_sent).await;

        let _ = shutdown_tx.send(true);
        for handle in [poller, listener] {
            if let Err(e) = handle.await {
                warn!(error = %e, "Watchdog task ended abnormally");
            }
        }

        if let Err(e) = self.hooks.finalize().await {
            warn!(error = %e, "finalize hook failed");
        }

        let report = StudyReport::collect(&self.study_id, &registry, stop_sent, started.elapsed()).await;
        report.log();
        outcome.map(|_| report)
    }

    async fn build_registry(&self) -> Result<Registry> {
        let options = &self.config.study_options;
        let sobol = self.config.is_sobol();

        let nb_groups = u32::try_from(options.sampling_size)
            .map_err(|_| LauncherError::study(format!("sampling_size {} exceeds u32", options.sampling_size)))?;
        let mut groups = Vec::with_capacity(options.sampling_size);
        for g in 0..nb_groups {
            let id = GroupId(g);
            let group = if sobol {
                let a = self.draw_parameter_set().await;
                let b = self.draw_parameter_set().await;
                GroupRecord::sobol(id, &a, &b, options.coupling)
                    .ok_or_else(|| LauncherError::study(format!("simulation ids of group {id} overflow u32")))?
            } else {
                GroupRecord::independent(id, self.draw_parameter_set().await, options.coupling)
            };
            groups.push(group);
        }

        let options_string = self.config.server_options().to_options_string()?;
        Ok(Registry::new(
            ServerRecord::new(options_string),
            groups,
            sobol,
            options.nb_parameters,
        ))
    }

    /// User draw when available and well-formed, uniform otherwise
    async fn draw_parameter_set(&self) -> Vec<f64> {
        let nb_parameters = self.config.study_options.nb_parameters;
        match self.hooks.draw_parameter_set(nb_parameters).await {
            Ok(Some(set)) if set.len() == nb_parameters as usize => return set,
            Ok(Some(set)) => warn!(
                expected = nb_parameters,
                got = set.len(),
                "draw_parameter_set returned a vector of the wrong size, sampling uniformly"
            ),
            Ok(None) => {}
            Err(e) => warn!(error = %e, "draw_parameter_set hook failed, sampling uniformly"),
        }
        uniform_parameter_set(&mut rand::thread_rng(), nb_parameters)
    }

    /// Main sequence. Returns once STOP has been sent.
    async fn drive(&self, detector: &FaultDetector) -> Result<()> {
        let registry = detector.registry();

        detector.start_server().await?;

        for group in registry.groups() {
            let id = group.lock().await.id;
            self.wait_for_scheduler_capacity().await;
            detector.submit_group(id).await?;
        }
        info!(groups = registry.groups().len(), "All groups submitted");

        let mut ticker = tokio::time::interval(self.config.cycle_interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;

            let outcome = detector.cycle().await?;
            if outcome != CycleOutcome::default() {
                debug!(
                    restarted = outcome.restarted,
                    dropped = outcome.dropped,
                    rebooted = outcome.rebooted,
                    "Fault detector cycle"
                );
            }

            let server_finished = registry.server().lock().await.is_finished();
            if server_finished && registry.all_converged().await {
                break;
            }
        }

        info!("Every group converged, sending STOP");
        self.control.send(Message::Stop).await?;
        Ok(())
    }

    async fn wait_for_scheduler_capacity(&self) {
        loop {
            match self.hooks.check_scheduler_load().await {
                Ok(true) => return,
                Ok(false) => debug!("Scheduler is busy, holding submissions"),
                Err(e) => {
                    warn!(error = %e, "check_scheduler_load hook failed, submitting anyway");
                    return;
                }
            }
            tokio::time::sleep(self.config.poll_interval()).await;
        }
    }

    /// Cancel what is still alive and run postprocessing. Never fails.
    async fn stop(&self, detector: &FaultDetector, stop_sent: bool) {
        let registry = detector.registry();

        let mut live = Vec::new();
        for group in registry.groups() {
            let group = group.lock().await;
            if !group.job_status.is_final() {
                live.extend(group.job_id().cloned());
            }
        }
        if !live.is_empty() {
            info!(count = live.len(), "Cancelling live group jobs");
            if let Err(e) = detector.cancel(&live).await {
                warn!(error = %e, "Failed to cancel group jobs");
            }
        }

        if stop_sent {
            // give the aggregator time to write its last checkpoint
            let poll_interval = self.config.poll_interval();
            let exited = tokio::time::timeout(self.config.server_timeout(), async {
                while !registry.server().lock().await.job_status.is_final() {
                    tokio::time::sleep(poll_interval).await;
                }
            })
            .await;
            if exited.is_err() {
                warn!("Server still running after STOP");
            }
        }

        let server_job: Option<JobId> = {
            let server = registry.server().lock().await;
            server.job_id().filter(|_| !server.job_status.is_final()).cloned()
        };
        if let Some(job) = server_job {
            info!(job_id = %job, "Cancelling server job");
            if let Err(e) = detector.cancel(&[job]).await {
                warn!(error = %e, "Failed to cancel the server job");
            }
        }

        if let Err(e) = self.hooks.postprocessing().await {
            warn!(error = %e, "postprocessing hook failed");
        }
    }
}

/// Refresh `job_status` of the server and every active group once.
///
/// Transient query failures leave the previous state in place.
pub async fn poll_jobs(registry: &Registry, hooks: &dyn StudyHooks) -> Result<()> {
    let server_job = {
        let server = registry.server().lock().await;
        server.job.clone().filter(|_| !server.job_status.is_final())
    };
    if let Some(mut job) = server_job {
        match hooks.check_server_job(&mut job).await {
            Ok(()) => {
                let mut server = registry.server().lock().await;
                if server.job_id() == Some(&job.id) {
                    if server.job_status != job.state {
                        info!(job_id = %job.id, from = ?server.job_status, to = ?job.state, "Server job state changed");
                    }
                    server.job_status = job.state;
                    server.job = Some(job);
                }
            }
            Err(e) => keep_if_transient("check_server_job", e)?,
        }
    }

    let mut jobs = Vec::new();
    for group in registry.groups() {
        let group = group.lock().await;
        if group.is_active() && !group.job_status.is_final() {
            if let Some(job) = &group.job {
                jobs.push((group.id, job.clone()));
            }
        }
    }

    let results = futures::future::join_all(jobs.into_iter().map(|(id, mut job)| async move {
        let result = hooks.check_group_job(&mut job).await;
        (id, job, result)
    }))
    .await;

    for (id, job, result) in results {
        if let Err(e) = result {
            keep_if_transient("check_group_job", e)?;
            continue;
        }
        let Some(group) = registry.group(id) else {
            continue;
        };
        let mut group = group.lock().await;
        // the group may have been resubmitted while the query ran
        if group.job_id() != Some(&job.id) {
            continue;
        }
        if group.job_status != job.state {
            debug!(group = %id, job_id = %job.id, from = ?group.job_status, to = ?job.state, "Group job state changed");
        }
        group.job_status = job.state;
        group.job = Some(job);
    }
    Ok(())
}

fn keep_if_transient(hook: &'static str, e: anyhow::Error) -> Result<()> {
    let e = LauncherError::from_hook(hook, e);
    if e.is_fatal() {
        return Err(e);
    }
    warn!(hook, error = %e, "Job status query failed, keeping the previous state");
    Ok(())
}

async fn state_poll_loop(
    registry: Arc<Registry>,
    hooks: Arc<dyn StudyHooks>,
    interval: Duration,
    mut shutdown: watch::Receiver<bool>,
    fatal: mpsc::Sender<LauncherError>,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            _ = ticker.tick() => {
                if let Err(e) = poll_jobs(&registry, hooks.as_ref()).await {
                    error!(error = %e, "State poll failed");
                    let _ = fatal.send(e).await;
                    break;
                }
            }
        }
    }
    debug!("State-poll loop stopped");
}

/// Receives aggregator messages and pings it
struct MessageLoop {
    registry: Arc<Registry>,
    control: Arc<ControlEndpoint>,
    server_ready: Arc<Notify>,
    ping_interval: Duration,
    server_timeout: Duration,
}

impl MessageLoop {
    async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let mut last_ping = Instant::now();

        loop {
            let received = tokio::select! {
                _ = shutdown.changed() => break,
                received = self.control.recv_timeout(self.ping_interval) => received,
            };
            match received {
                Ok(Some(message)) => self.handle(message).await,
                Ok(None) => {}
                Err(ProtocolError::Closed) => {
                    debug!("Control plane closed");
                    break;
                }
                Err(e) => warn!(error = %e, "Control-plane receive failed"),
            }

            if last_ping.elapsed() >= self.ping_interval {
                self.ping().await;
                last_ping = Instant::now();
            }
        }
        debug!("Message loop stopped");
    }

    async fn handle(&self, message: Message) {
        {
            let mut server = self.registry.server().lock().await;
            server.last_message = Instant::now();
            if server.status == ProcessStatus::Timeout {
                info!("Server is responsive again");
                server.status = ProcessStatus::Running;
            }
        }

        match message {
            Message::Server { rank, node_name } => {
                info!(rank, node = %node_name, "Server connected");
                self.registry.server().lock().await.mark_ready(node_name);
                self.server_ready.notify_waiters();
            }
            Message::JobRequest { simulation_id } => self.answer_job_request(simulation_id).await,
            Message::SimuStatus { simulation_id, status } => {
                let Some(group) = self.registry.group_of(simulation_id) else {
                    warn!(simulation_id = %simulation_id, "Status for an unknown simulation");
                    return;
                };
                let mut group = group.lock().await;
                let before = group.status;
                group.record_simulation_status(simulation_id, status);
                if group.status == ProcessStatus::Finished && before != ProcessStatus::Finished {
                    info!(group = %group.id, restarts = group.nb_restarts, "Group finished");
                }
            }
            Message::Timeout { simulation_id } => {
                warn!(simulation_id = %simulation_id, "Aggregator reports a silent simulation");
                if let Some(group) = self.registry.group_of(simulation_id) {
                    group.lock().await.mark_timeout();
                }
            }
            Message::Done { finished } => {
                info!(finished, "Server reports every expected simulation finished");
                self.registry.server().lock().await.status = ProcessStatus::Finished;
            }
            Message::Alive => {}
            other => debug!(kind = other.kind(), "Ignoring unexpected control message"),
        }
    }

    async fn answer_job_request(&self, simulation_id: SimulationId) {
        let Some(group) = self.registry.group_of(simulation_id) else {
            warn!(simulation_id = %simulation_id, "Job request for an unknown simulation");
            return;
        };
        let reply = {
            let group = group.lock().await;
            group.parameters_of(simulation_id).map(|parameters| Message::Job {
                simulation_id,
                job_id: group.job_id().cloned().unwrap_or_else(|| JobId::new("none")),
                parameters: parameters.to_vec(),
            })
        };
        let Some(reply) = reply else {
            warn!(simulation_id = %simulation_id, "No parameters for requested simulation");
            return;
        };
        if let Err(e) = self.control.send(reply).await {
            warn!(error = %e, "Failed to answer job request");
        }
    }

    /// HELLO while the server runs; declare it TIMEOUT once silent too long
    async fn ping(&self) {
        {
            let mut server = self.registry.server().lock().await;
            if server.status != ProcessStatus::Running {
                return;
            }
            let silent = server.last_message.elapsed();
            if silent > self.server_timeout {
                warn!(silent_secs = silent.as_secs_f64(), "Server timed out");
                server.status = ProcessStatus::Timeout;
                return;
            }
        }
        if let Err(e) = self.control.send(Message::Hello).await {
            warn!(error = %e, "Failed to ping the server");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler::Job;
    use async_trait::async_trait;
    use melissa_core::{CouplingMode, JobState};

    struct Flaky;

    #[async_trait]
    impl StudyHooks for Flaky {
        async fn launch_server(&self, _server: &crate::hooks::ServerLaunch) -> anyhow::Result<Job> {
            anyhow::bail!("unused")
        }

        async fn launch_group(&self, _group: &GroupLaunch) -> anyhow::Result<Job> {
            anyhow::bail!("unused")
        }

        async fn check_server_job(&self, job: &mut Job) -> anyhow::Result<()> {
            job.state = JobState::Running;
            Ok(())
        }

        async fn check_group_job(&self, job: &mut Job) -> anyhow::Result<()> {
            match job.id.as_str() {
                "flaky" => Err(LauncherError::scheduler("squeue: socket timed out").into()),
                "weird" => Err(LauncherError::unknown_state("slurm", "WEIRD").into()),
                _ => {
                    job.state = JobState::Terminated;
                    Ok(())
                }
            }
        }

        async fn cancel_job(&self, _jobs: &[JobId]) -> anyhow::Result<()> {
            Ok(())
        }
    }

    fn registry(job_ids: &[&str]) -> Registry {
        let groups = job_ids
            .iter()
            .enumerate()
            .map(|(g, id)| {
                let mut group = GroupRecord::independent(GroupId(g as u32), vec![0.5], CouplingMode::None);
                group.begin_launch();
                group.mark_launched(Job::new(JobId::new(*id), JobState::Waiting));
                group
            })
            .collect();
        let mut server = ServerRecord::new(String::new());
        server.mark_launched(Job::new(JobId::new("server"), JobState::Waiting));
        Registry::new(server, groups, false, 1)
    }

    #[tokio::test]
    async fn test_poll_updates_states_and_tolerates_transient_errors() {
        let registry = registry(&["ok", "flaky"]);
        tokio_test::assert_ok!(poll_jobs(&registry, &Flaky).await);

        assert_eq!(registry.server().lock().await.job_status, JobState::Running);
        assert_eq!(
            registry.group(GroupId(0)).unwrap().lock().await.job_status,
            JobState::Terminated
        );
        assert_eq!(
            registry.group(GroupId(1)).unwrap().lock().await.job_status,
            JobState::Waiting
        );
    }

    #[tokio::test]
    async fn test_poll_unknown_state_is_fatal() {
        let registry = registry(&["ok", "weird"]);
        let result = poll_jobs(&registry, &Flaky).await;
        assert!(matches!(result, Err(LauncherError::UnknownSchedulerState { .. })));
    }

    #[tokio::test]
    async fn test_message_loop_answers_job_requests() {
        let registry = Arc::new(registry(&["job-0", "job-1"]));
        let (launcher, aggregator) = ControlEndpoint::pair();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let ready = Arc::new(Notify::new());
        let notified = ready.notified();

        let handle = tokio::spawn(
            MessageLoop {
                registry: registry.clone(),
                control: Arc::new(launcher),
                server_ready: ready.clone(),
                ping_interval: Duration::from_secs(60),
                server_timeout: Duration::from_secs(60),
            }
            .run(shutdown_rx),
        );

        aggregator
            .send(Message::Server { rank: 0, node_name: "node3".into() })
            .await
            .unwrap();
        tokio::time::timeout(Duration::from_secs(5), notified).await.unwrap();

        aggregator
            .send(Message::JobRequest { simulation_id: SimulationId(1) })
            .await
            .unwrap();
        let reply = aggregator.recv_timeout(Duration::from_secs(5)).await.unwrap();
        assert_eq!(
            reply,
            Some(Message::Job {
                simulation_id: SimulationId(1),
                job_id: JobId::new("job-1"),
                parameters: vec![0.5],
            })
        );

        aggregator
            .send(Message::SimuStatus {
                simulation_id: SimulationId(0),
                status: ProcessStatus::Finished,
            })
            .await
            .unwrap();
        aggregator.send(Message::Done { finished: 1 }).await.unwrap();

        tokio::time::timeout(Duration::from_secs(5), async {
            while !registry.server().lock().await.is_finished() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
        assert_eq!(
            registry.group(GroupId(0)).unwrap().lock().await.status,
            ProcessStatus::Finished
        );
        assert_eq!(registry.server().lock().await.node_name.as_deref(), Some("node3"));

        shutdown_tx.send(true).unwrap();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_silent_server_declared_timeout() {
        let registry = Arc::new(registry(&["job-0"]));
        registry.server().lock().await.mark_ready("node3".into());
        let (launcher, _aggregator) = ControlEndpoint::pair();
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);

        let handle = tokio::spawn(
            MessageLoop {
                registry: registry.clone(),
                control: Arc::new(launcher),
                server_ready: Arc::new(Notify::new()),
                ping_interval: Duration::from_millis(10),
                server_timeout: Duration::from_millis(30),
            }
            .run(shutdown_rx),
        );

        tokio::time::timeout(Duration::from_secs(5), async {
            while registry.server().lock().await.status != ProcessStatus::Timeout {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
        handle.abort();
    }
}
