//! Server and group records
//!
//! Every record keeps two independent views of its job:
//!
//! - `job_status`: what the batch scheduler reports ([`JobState`])
//! - `status`: what the aggregator reports over the control plane
//!   ([`ProcessStatus`])
//!
//! They disagree transiently (a job is RUNNING before its simulation
//! connects, or TERMINATED after a crash the aggregator never saw). The
//! fault detector reconciles them; records only store them.
//!
//! Records live in a [`Registry`] and each sits behind its own lock, so
//! handling one group never blocks progress reporting for another.

use crate::sampling::{group_of, simulation_ids, sobol_parameter_sets};
use crate::scheduler::Job;
use melissa_core::{CouplingMode, GroupId, JobId, JobState, ProcessStatus, SimulationId};
use std::collections::BTreeSet;
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio::time::Instant;

/// Restarts allowed before a group is dropped for good
pub const CRASH_THRESHOLD: u32 = 3;

/// The aggregator job
#[derive(Debug, Clone)]
pub struct ServerRecord {
    pub job: Option<Job>,
    /// Id of the very first server job; keys the aggregator checkpoint
    pub first_job_id: Option<JobId>,
    pub job_status: JobState,
    pub status: ProcessStatus,
    pub node_name: Option<String>,
    /// Serialized aggregation options handed to every incarnation
    pub options_string: String,
    /// Last control-plane message from the aggregator
    pub last_message: Instant,
    pub reboots: u32,
}

impl ServerRecord {
    pub fn new(options_string: String) -> Self {
        Self {
            job: None,
            first_job_id: None,
            job_status: JobState::Waiting,
            status: ProcessStatus::NotSubmitted,
            node_name: None,
            options_string,
            last_message: Instant::now(),
            reboots: 0,
        }
    }

    pub fn job_id(&self) -> Option<&JobId> {
        self.job.as_ref().map(|j| &j.id)
    }

    /// Reset the aggregator view before a (re)submission.
    ///
    /// Called before the launch hook so a SERVER message that races the
    /// hook's return is not overwritten.
    pub fn begin_launch(&mut self) {
        self.status = ProcessStatus::Pending;
        self.node_name = None;
        self.last_message = Instant::now();
    }

    /// Record a submitted job. The first job id is kept forever.
    pub fn mark_launched(&mut self, job: Job) {
        if self.first_job_id.is_none() {
            self.first_job_id = Some(job.id.clone());
        }
        self.job_status = job.state;
        self.job = Some(job);
    }

    /// SERVER message received: the aggregator accepts connections
    pub fn mark_ready(&mut self, node_name: String) {
        self.status = ProcessStatus::Running;
        self.node_name = Some(node_name);
        self.last_message = Instant::now();
    }

    pub fn is_finished(&self) -> bool {
        self.status == ProcessStatus::Finished
    }
}

/// One ensemble member: one scheduler submission, one or more simulations
#[derive(Debug, Clone)]
pub struct GroupRecord {
    pub id: GroupId,
    pub simulations: Vec<SimulationId>,
    /// Parallel to `simulations`
    pub parameters: Vec<Vec<f64>>,
    pub coupling: CouplingMode,
    pub job: Option<Job>,
    pub job_status: JobState,
    pub status: ProcessStatus,
    pub nb_restarts: u32,
    pub start_time: Option<Instant>,
    /// Permanently excluded from the study
    pub dropped: bool,
    /// Simulations the aggregator reported FINISHED; kept across restarts
    pub finished: BTreeSet<SimulationId>,
}

impl GroupRecord {
    fn new(id: GroupId, simulations: Vec<SimulationId>, parameters: Vec<Vec<f64>>, coupling: CouplingMode) -> Self {
        Self {
            id,
            simulations,
            parameters,
            coupling,
            job: None,
            job_status: JobState::Waiting,
            status: ProcessStatus::NotSubmitted,
            nb_restarts: 0,
            start_time: None,
            dropped: false,
            finished: BTreeSet::new(),
        }
    }

    /// Group wrapping exactly one simulation
    pub fn independent(id: GroupId, parameters: Vec<f64>, coupling: CouplingMode) -> Self {
        Self::new(id, vec![SimulationId(id.0)], vec![parameters], coupling)
    }

    /// Sobol' group built from base vectors A and B, `None` when its ids overflow
    pub fn sobol(id: GroupId, a: &[f64], b: &[f64], coupling: CouplingMode) -> Option<Self> {
        let nb_parameters = u32::try_from(a.len()).ok()?;
        Some(Self::new(
            id,
            simulation_ids(id, true, nb_parameters)?,
            sobol_parameter_sets(a, b),
            coupling,
        ))
    }

    pub fn is_sobol(&self) -> bool {
        self.simulations.len() > 1
    }

    pub fn job_id(&self) -> Option<&JobId> {
        self.job.as_ref().map(|j| &j.id)
    }

    /// Still counted by the study: not finished, not dropped
    pub fn is_active(&self) -> bool {
        !self.dropped && self.status != ProcessStatus::Finished
    }

    /// Finished or dropped
    pub fn is_converged(&self) -> bool {
        !self.is_active()
    }

    pub fn parameters_of(&self, simulation: SimulationId) -> Option<&[f64]> {
        let index = self.simulations.iter().position(|s| *s == simulation)?;
        self.parameters.get(index).map(Vec::as_slice)
    }

    /// Reset the aggregator view and the hang clock before a (re)submission
    pub fn begin_launch(&mut self) {
        self.status = ProcessStatus::Pending;
        self.start_time = Some(Instant::now());
    }

    /// Record a submitted job; `status` is left to the aggregator
    pub fn mark_launched(&mut self, job: Job) {
        self.job_status = job.state;
        self.job = Some(job);
    }

    /// Forget the job after a cancellation that will be resubmitted
    pub fn mark_suspended(&mut self) {
        self.job = None;
        self.job_status = JobState::Waiting;
        self.status = ProcessStatus::NotSubmitted;
        self.start_time = None;
    }

    /// Apply a SIMU-STATUS for one of this group's simulations.
    ///
    /// The group is FINISHED once every simulation reported FINISHED.
    pub fn record_simulation_status(&mut self, simulation: SimulationId, status: ProcessStatus) {
        if self.dropped || !self.simulations.contains(&simulation) {
            return;
        }
        match status {
            ProcessStatus::Finished => {
                self.finished.insert(simulation);
                if self.finished.len() == self.simulations.len() {
                    self.status = ProcessStatus::Finished;
                } else if self.status < ProcessStatus::Running {
                    self.status = ProcessStatus::Running;
                }
            }
            ProcessStatus::Running => {
                if self.status < ProcessStatus::Running {
                    self.status = ProcessStatus::Running;
                }
            }
            ProcessStatus::Timeout => self.mark_timeout(),
            ProcessStatus::NotSubmitted | ProcessStatus::Pending => {}
        }
    }

    /// The aggregator stopped hearing from one of the simulations
    pub fn mark_timeout(&mut self) {
        if self.status != ProcessStatus::Finished {
            self.status = ProcessStatus::Timeout;
        }
    }
}

/// Arena of per-entity locked records addressed by stable ids
pub struct Registry {
    server: Arc<Mutex<ServerRecord>>,
    groups: Vec<Arc<Mutex<GroupRecord>>>,
    sobol: bool,
    nb_parameters: u32,
}

impl Registry {
    /// `groups` must be ordered by id, starting at 0
    pub fn new(server: ServerRecord, groups: Vec<GroupRecord>, sobol: bool, nb_parameters: u32) -> Self {
        Self {
            server: Arc::new(Mutex::new(server)),
            groups: groups.into_iter().map(|g| Arc::new(Mutex::new(g))).collect(),
            sobol,
            nb_parameters,
        }
    }

    pub fn server(&self) -> &Arc<Mutex<ServerRecord>> {
        &self.server
    }

    pub fn groups(&self) -> &[Arc<Mutex<GroupRecord>>] {
        &self.groups
    }

    pub fn group(&self, id: GroupId) -> Option<&Arc<Mutex<GroupRecord>>> {
        self.groups.get(id.0 as usize)
    }

    /// Group owning simulation `id`
    pub fn group_of(&self, id: SimulationId) -> Option<&Arc<Mutex<GroupRecord>>> {
        self.group(group_of(id, self.sobol, self.nb_parameters))
    }

    /// Groups neither finished nor dropped
    pub async fn active_groups(&self) -> Vec<GroupId> {
        let mut active = Vec::new();
        for group in &self.groups {
            let group = group.lock().await;
            if group.is_active() {
                active.push(group.id);
            }
        }
        active
    }

    pub async fn all_converged(&self) -> bool {
        for group in &self.groups {
            if group.lock().await.is_active() {
                return false;
            }
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn job(id: &str) -> Job {
        Job::new(JobId::new(id), JobState::Waiting)
    }

    #[test]
    fn test_server_keeps_first_job_id() {
        let mut server = ServerRecord::new("{}".into());
        server.begin_launch();
        server.mark_launched(job("100"));
        server.mark_ready("node7".into());
        server.begin_launch();
        server.mark_launched(job("230"));
        assert_eq!(server.first_job_id, Some(JobId::new("100")));
        assert_eq!(server.job_id(), Some(&JobId::new("230")));
        assert_eq!(server.status, ProcessStatus::Pending);
        assert_eq!(server.node_name, None);

        server.mark_ready("node8".into());
        assert_eq!(server.status, ProcessStatus::Running);
    }

    #[test]
    fn test_sobol_group_layout() {
        let group = GroupRecord::sobol(GroupId(2), &[0.1, 0.2], &[0.8, 0.9], CouplingMode::Mpi).unwrap();
        assert!(group.is_sobol());
        assert_eq!(
            group.simulations,
            vec![SimulationId(8), SimulationId(9), SimulationId(10), SimulationId(11)]
        );
        assert_eq!(group.parameters_of(SimulationId(10)), Some(&[0.8, 0.2][..]));
        assert_eq!(group.parameters_of(SimulationId(12)), None);
    }

    #[test]
    fn test_group_finishes_when_all_simulations_finish() {
        let mut group = GroupRecord::sobol(GroupId(0), &[0.1, 0.2], &[0.8, 0.9], CouplingMode::None).unwrap();
        group.begin_launch();
        group.mark_launched(job("5"));
        for id in 0..3 {
            group.record_simulation_status(SimulationId(id), ProcessStatus::Finished);
        }
        assert_eq!(group.status, ProcessStatus::Running);
        assert!(group.is_active());

        group.record_simulation_status(SimulationId(3), ProcessStatus::Finished);
        assert_eq!(group.status, ProcessStatus::Finished);
        assert!(group.is_converged());

        // late timeout after finish is ignored
        group.mark_timeout();
        assert_eq!(group.status, ProcessStatus::Finished);
    }

    #[test]
    fn test_status_reported_before_launch_returns_is_kept() {
        let mut group = GroupRecord::independent(GroupId(4), vec![0.5], CouplingMode::None);
        group.begin_launch();
        group.record_simulation_status(SimulationId(4), ProcessStatus::Finished);
        group.mark_launched(job("9"));
        assert_eq!(group.status, ProcessStatus::Finished);
        assert_eq!(group.job_id(), Some(&JobId::new("9")));

        group.mark_suspended();
        assert_eq!(group.status, ProcessStatus::NotSubmitted);
        assert!(group.job.is_none());
        assert!(group.finished.contains(&SimulationId(4)));
    }

    #[test]
    fn test_foreign_simulation_ignored() {
        let mut group = GroupRecord::independent(GroupId(1), vec![0.5], CouplingMode::None);
        group.record_simulation_status(SimulationId(2), ProcessStatus::Finished);
        assert_eq!(group.status, ProcessStatus::NotSubmitted);
    }

    #[tokio::test]
    async fn test_registry_lookup() {
        let groups = (0..3)
            .map(|g| GroupRecord::sobol(GroupId(g), &[0.0; 3], &[1.0; 3], CouplingMode::None).unwrap())
            .collect();
        let registry = Registry::new(ServerRecord::new(String::new()), groups, true, 3);

        let owner = registry.group_of(SimulationId(7)).unwrap();
        assert_eq!(owner.lock().await.id, GroupId(1));
        assert!(registry.group_of(SimulationId(15)).is_none());
        assert_eq!(registry.active_groups().await.len(), 3);

        registry.group(GroupId(0)).unwrap().lock().await.dropped = true;
        assert_eq!(registry.active_groups().await, vec![GroupId(1), GroupId(2)]);
        assert!(!registry.all_converged().await);
    }
}
