//! Simulation table: the aggregator's view of the whole ensemble
//!
//! The table decides three things for every incoming data message:
//! - is this the first contact with the simulation (metadata pull needed)
//! - is this timestep new or a duplicate
//! - did this message finish the simulation
//!
//! Dropped simulation ids are excluded from completion accounting, which
//! lowers the number of simulations the study waits for.

use crate::simulation::{Receipt, Simulation, SimulationStatus};
use chrono::{DateTime, Utc};
use melissa_core::{DataMessage, JobId, SimulationId};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;
use tracing::{debug, warn};

/// Outcome of ingesting one data message
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IngestOutcome {
    /// `None` when the simulation was dropped and the message ignored
    pub receipt: Option<Receipt>,
    /// First message ever seen for this simulation id
    pub first_contact: bool,
    /// This message completed the simulation
    pub newly_finished: bool,
}

/// Serializable form of the table, written by checkpoints
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TableSnapshot {
    pub field_names: Vec<String>,
    pub nb_time_steps: usize,
    pub expected: usize,
    pub simulations: Vec<Simulation>,
    pub dropped: Vec<SimulationId>,
}

/// All simulations known to the aggregator, keyed by simulation id
#[derive(Debug, Clone, PartialEq)]
pub struct SimulationTable {
    field_names: Vec<String>,
    nb_time_steps: usize,
    expected: usize,
    simulations: BTreeMap<SimulationId, Simulation>,
    dropped: BTreeSet<SimulationId>,
    /// Silent simulations already reported, cleared on new data
    reported_silent: BTreeSet<SimulationId>,
}

impl SimulationTable {
    pub fn new(field_names: Vec<String>, nb_time_steps: usize, expected: usize) -> Self {
        Self {
            field_names,
            nb_time_steps,
            expected,
            simulations: BTreeMap::new(),
            dropped: BTreeSet::new(),
            reported_silent: BTreeSet::new(),
        }
    }

    pub fn ingest(&mut self, message: &DataMessage, now: DateTime<Utc>) -> IngestOutcome {
        let id = message.simulation_id;
        if self.dropped.contains(&id) {
            debug!(simulation_id = %id, "Ignoring data from dropped simulation");
            return IngestOutcome {
                receipt: None,
                first_contact: false,
                newly_finished: false,
            };
        }

        let first_contact = !self.simulations.contains_key(&id);
        let simulation = self
            .simulations
            .entry(id)
            .or_insert_with(|| Simulation::new(id, &self.field_names, self.nb_time_steps, now));

        let was_finished = simulation.is_finished();
        let receipt = simulation.record(&message.field, message.timestep, now);
        self.reported_silent.remove(&id);

        match receipt {
            Receipt::UnknownField => warn!(
                simulation_id = %id,
                field = %message.field,
                "Data for undeclared field"
            ),
            Receipt::OutOfRange => warn!(
                simulation_id = %id,
                timestep = message.timestep,
                nb_time_steps = self.nb_time_steps,
                "Timestep out of range"
            ),
            Receipt::Duplicate => debug!(
                simulation_id = %id,
                field = %message.field,
                timestep = message.timestep,
                "Duplicate timestep discarded"
            ),
            Receipt::Accepted => {}
        }

        IngestOutcome {
            receipt: Some(receipt),
            first_contact,
            newly_finished: !was_finished && simulation.is_finished(),
        }
    }

    /// Store the launch parameters learned from a JOB message
    pub fn set_parameters(&mut self, id: SimulationId, job_id: JobId, parameters: Vec<f64>, now: DateTime<Utc>) {
        let simulation = self
            .simulations
            .entry(id)
            .or_insert_with(|| Simulation::new(id, &self.field_names, self.nb_time_steps, now));
        simulation.parameters = Some(parameters);
        simulation.job_id = Some(job_id);
    }

    /// Permanently exclude a simulation. Returns `false` if already dropped.
    pub fn drop_simulation(&mut self, id: SimulationId) -> bool {
        if !self.dropped.insert(id) {
            return false;
        }
        self.simulations.remove(&id);
        self.reported_silent.remove(&id);
        true
    }

    /// Simulations the study still waits for
    pub fn expected(&self) -> usize {
        self.expected.saturating_sub(self.dropped.len())
    }

    pub fn finished_count(&self) -> usize {
        self.simulations.values().filter(|s| s.is_finished()).count()
    }

    pub fn is_complete(&self) -> bool {
        self.finished_count() >= self.expected()
    }

    /// Running simulations silent for longer than `timeout`.
    ///
    /// Each silent simulation is reported once until it sends data again.
    pub fn take_silent(&mut self, now: DateTime<Utc>, timeout: Duration) -> Vec<SimulationId> {
        let Ok(timeout) = chrono::Duration::from_std(timeout) else {
            return Vec::new();
        };
        let silent: Vec<SimulationId> = self
            .simulations
            .values()
            .filter(|s| s.status != SimulationStatus::Finished)
            .filter(|s| now - s.last_message > timeout)
            .map(|s| s.id)
            .filter(|id| !self.reported_silent.contains(id))
            .collect();
        self.reported_silent.extend(silent.iter().copied());
        silent
    }

    pub fn get(&self, id: SimulationId) -> Option<&Simulation> {
        self.simulations.get(&id)
    }

    pub fn is_dropped(&self, id: SimulationId) -> bool {
        self.dropped.contains(&id)
    }

    pub fn len(&self) -> usize {
        self.simulations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.simulations.is_empty()
    }

    pub fn snapshot(&self) -> TableSnapshot {
        TableSnapshot {
            field_names: self.field_names.clone(),
            nb_time_steps: self.nb_time_steps,
            expected: self.expected,
            simulations: self.simulations.values().cloned().collect(),
            dropped: self.dropped.iter().copied().collect(),
        }
    }

    pub fn from_snapshot(snapshot: TableSnapshot) -> Self {
        Self {
            field_names: snapshot.field_names,
            nb_time_steps: snapshot.nb_time_steps,
            expected: snapshot.expected,
            simulations: snapshot
                .simulations
                .into_iter()
                .map(|s| (s.id, s))
                .collect(),
            dropped: snapshot.dropped.into_iter().collect(),
            reported_silent: BTreeSet::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table(expected: usize) -> SimulationTable {
        SimulationTable::new(vec!["u".into()], 2, expected)
    }

    fn data(id: u32, timestep: u32) -> DataMessage {
        DataMessage::new(SimulationId(id), "u", timestep, vec![0.0; 4])
    }

    #[test]
    fn test_first_contact_reported_once() {
        let now = Utc::now();
        let mut table = table(1);

        let outcome = table.ingest(&data(0, 0), now);
        assert!(outcome.first_contact);
        assert_eq!(outcome.receipt, Some(Receipt::Accepted));

        let outcome = table.ingest(&data(0, 1), now);
        assert!(!outcome.first_contact);
        assert!(outcome.newly_finished);
        assert!(table.is_complete());
    }

    #[test]
    fn test_duplicate_after_finish_is_idempotent() {
        let now = Utc::now();
        let mut table = table(2);
        table.ingest(&data(0, 0), now);
        table.ingest(&data(0, 1), now);

        let outcome = table.ingest(&data(0, 1), now);
        assert_eq!(outcome.receipt, Some(Receipt::Duplicate));
        assert!(!outcome.newly_finished);
        assert_eq!(table.finished_count(), 1);
        assert!(!table.is_complete());
    }

    #[test]
    fn test_drop_reduces_expected() {
        let now = Utc::now();
        let mut table = table(2);
        table.ingest(&data(0, 0), now);
        table.ingest(&data(0, 1), now);
        table.ingest(&data(1, 0), now);

        assert!(table.drop_simulation(SimulationId(1)));
        assert!(!table.drop_simulation(SimulationId(1)));
        assert_eq!(table.expected(), 1);
        assert!(table.is_complete());

        let outcome = table.ingest(&data(1, 1), now);
        assert_eq!(outcome.receipt, None);
        assert!(table.get(SimulationId(1)).is_none());
    }

    #[test]
    fn test_silent_simulation_reported_once() {
        let start = Utc::now();
        let mut table = table(2);
        table.ingest(&data(0, 0), start);
        table.ingest(&data(1, 0), start);
        table.ingest(&data(1, 1), start);

        let later = start + chrono::Duration::seconds(10);
        let silent = table.take_silent(later, Duration::from_secs(5));
        // simulation 1 finished, only 0 is silent
        assert_eq!(silent, vec![SimulationId(0)]);
        assert!(table.take_silent(later, Duration::from_secs(5)).is_empty());

        table.ingest(&data(0, 0), later);
        let much_later = later + chrono::Duration::seconds(10);
        assert_eq!(
            table.take_silent(much_later, Duration::from_secs(5)),
            vec![SimulationId(0)]
        );
    }

    #[test]
    fn test_set_parameters_before_data() {
        let now = Utc::now();
        let mut table = table(1);
        table.set_parameters(SimulationId(4), JobId::new("77"), vec![0.5, 0.1], now);

        let simulation = table.get(SimulationId(4)).unwrap();
        assert_eq!(simulation.parameters, Some(vec![0.5, 0.1]));
        assert_eq!(simulation.job_id, Some(JobId::new("77")));
        assert!(!table.ingest(&data(4, 0), now).first_contact);
    }

    #[test]
    fn test_snapshot_restores_contents() {
        let now = Utc::now();
        let mut table = table(3);
        table.ingest(&data(0, 0), now);
        table.ingest(&data(2, 1), now);
        table.drop_simulation(SimulationId(1));

        let restored = SimulationTable::from_snapshot(table.snapshot());
        assert_eq!(restored, table);
    }
}
