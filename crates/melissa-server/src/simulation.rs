//! Per-simulation bookkeeping on the aggregator side
//!
//! Every simulation keeps one [`TimestepMask`] per declared field. A bit is
//! set the first time a timestep arrives; a second arrival for the same bit is
//! a duplicate and is discarded. The simulation is finished exactly when every
//! mask is full.

use chrono::{DateTime, Utc};
use melissa_core::{JobId, SimulationId};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Fixed-length bitmap of received timesteps
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimestepMask {
    words: Vec<u64>,
    len: usize,
    count: usize,
}

impl TimestepMask {
    pub fn new(len: usize) -> Self {
        Self {
            words: vec![0; len.div_ceil(64)],
            len,
            count: 0,
        }
    }

    /// Set bit `timestep`. Returns `Some(true)` if it was newly set,
    /// `Some(false)` if already set, `None` if out of range.
    pub fn set(&mut self, timestep: usize) -> Option<bool> {
        if timestep >= self.len {
            return None;
        }
        let (word, bit) = (timestep / 64, timestep % 64);
        let mask = 1u64 << bit;
        if self.words[word] & mask != 0 {
            return Some(false);
        }
        self.words[word] |= mask;
        self.count += 1;
        Some(true)
    }

    pub fn is_set(&self, timestep: usize) -> bool {
        timestep < self.len && self.words[timestep / 64] & (1u64 << (timestep % 64)) != 0
    }

    pub fn count(&self) -> usize {
        self.count
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn is_full(&self) -> bool {
        self.count == self.len
    }
}

/// Aggregator-side lifecycle of a simulation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SimulationStatus {
    /// Known, no accepted data yet
    Connected,
    Running,
    Finished,
}

/// What happened to one incoming timestep
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Receipt {
    Accepted,
    Duplicate,
    UnknownField,
    OutOfRange,
}

/// One simulation as seen by the aggregator
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Simulation {
    pub id: SimulationId,
    /// Launch parameters, filled by the metadata pull
    pub parameters: Option<Vec<f64>>,
    /// Scheduler job that last ran this simulation
    pub job_id: Option<JobId>,
    pub status: SimulationStatus,
    pub timesteps: BTreeMap<String, TimestepMask>,
    pub last_message: DateTime<Utc>,
}

impl Simulation {
    pub fn new(id: SimulationId, fields: &[String], nb_time_steps: usize, now: DateTime<Utc>) -> Self {
        Self {
            id,
            parameters: None,
            job_id: None,
            status: SimulationStatus::Connected,
            timesteps: fields
                .iter()
                .map(|field| (field.clone(), TimestepMask::new(nb_time_steps)))
                .collect(),
            last_message: now,
        }
    }

    /// Record one timestep of `field`
    pub fn record(&mut self, field: &str, timestep: u32, now: DateTime<Utc>) -> Receipt {
        self.last_message = now;

        let Some(mask) = self.timesteps.get_mut(field) else {
            return Receipt::UnknownField;
        };
        match mask.set(timestep as usize) {
            None => Receipt::OutOfRange,
            Some(false) => Receipt::Duplicate,
            Some(true) => {
                if self.is_complete() {
                    self.status = SimulationStatus::Finished;
                } else if self.status == SimulationStatus::Connected {
                    self.status = SimulationStatus::Running;
                }
                Receipt::Accepted
            }
        }
    }

    /// Every field has every timestep
    pub fn is_complete(&self) -> bool {
        !self.timesteps.is_empty() && self.timesteps.values().all(TimestepMask::is_full)
    }

    pub fn is_finished(&self) -> bool {
        self.status == SimulationStatus::Finished
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fields(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_mask_set_and_duplicate() {
        let mut mask = TimestepMask::new(70);
        assert_eq!(mask.set(0), Some(true));
        assert_eq!(mask.set(69), Some(true));
        assert_eq!(mask.set(69), Some(false));
        assert_eq!(mask.set(70), None);
        assert_eq!(mask.count(), 2);
        assert!(mask.is_set(69));
        assert!(!mask.is_set(68));
    }

    #[test]
    fn test_finished_iff_all_bits_set() {
        let now = Utc::now();
        let mut simulation = Simulation::new(SimulationId(0), &fields(&["u", "v"]), 2, now);

        assert_eq!(simulation.record("u", 0, now), Receipt::Accepted);
        assert_eq!(simulation.status, SimulationStatus::Running);
        assert_eq!(simulation.record("u", 1, now), Receipt::Accepted);
        assert_eq!(simulation.record("v", 0, now), Receipt::Accepted);
        assert!(!simulation.is_finished());
        assert_eq!(simulation.record("v", 1, now), Receipt::Accepted);
        assert!(simulation.is_finished());
    }

    #[test]
    fn test_duplicate_does_not_change_status() {
        let now = Utc::now();
        let mut simulation = Simulation::new(SimulationId(0), &fields(&["u"]), 2, now);
        simulation.record("u", 0, now);

        assert_eq!(simulation.record("u", 0, now), Receipt::Duplicate);
        assert!(!simulation.is_finished());

        simulation.record("u", 1, now);
        assert_eq!(simulation.record("u", 1, now), Receipt::Duplicate);
        assert!(simulation.is_finished());
    }

    #[test]
    fn test_missing_timestep_never_finishes() {
        let now = Utc::now();
        let mut simulation = Simulation::new(SimulationId(3), &fields(&["u"]), 3, now);
        for _ in 0..5 {
            simulation.record("u", 0, now);
            simulation.record("u", 2, now);
        }
        assert!(!simulation.is_finished());
        assert_eq!(simulation.timesteps["u"].count(), 2);
    }

    #[test]
    fn test_unknown_field_and_range() {
        let now = Utc::now();
        let mut simulation = Simulation::new(SimulationId(0), &fields(&["u"]), 1, now);
        assert_eq!(simulation.record("w", 0, now), Receipt::UnknownField);
        assert_eq!(simulation.record("u", 5, now), Receipt::OutOfRange);
        assert_eq!(simulation.status, SimulationStatus::Connected);
    }
}
