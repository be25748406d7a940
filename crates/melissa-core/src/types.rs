//! Core types shared across Melissa components

use serde::{Deserialize, Serialize};

use crate::error::ProtocolError;

/// Aggregator-visible identifier of one simulation (stable across reboots)
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SimulationId(pub u32);

impl std::fmt::Display for SimulationId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Ordinal of a group inside a study
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct GroupId(pub u32);

impl std::fmt::Display for GroupId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Scheduler-assigned job identifier.
///
/// Opaque and unstable: a reboot or resubmission gets a new one.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct JobId(pub String);

impl JobId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for JobId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Job state as reported by a batch back-end
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum JobState {
    /// Queued, not yet allocated
    Waiting,
    /// Allocated and executing
    Running,
    /// Exited normally, or no longer listed by the back-end
    Terminated,
    /// Exited abnormally (non-zero exit, node failure, walltime)
    Failed,
    /// Submission itself failed, the job never ran
    Error,
}

impl JobState {
    /// Whether the back-end will never run this job again
    pub fn is_final(&self) -> bool {
        matches!(self, Self::Terminated | Self::Failed | Self::Error)
    }
}

/// Lifecycle status of a server or group.
///
/// Codes match the values exchanged in SIMU-STATUS messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ProcessStatus {
    NotSubmitted,
    Pending,
    Running,
    Finished,
    Timeout,
}

impl ProcessStatus {
    pub fn code(&self) -> i32 {
        match self {
            Self::NotSubmitted => -1,
            Self::Pending => 0,
            Self::Running => 1,
            Self::Finished => 2,
            Self::Timeout => 4,
        }
    }

    pub fn from_code(code: i32) -> Result<Self, ProtocolError> {
        match code {
            -1 => Ok(Self::NotSubmitted),
            0 => Ok(Self::Pending),
            1 => Ok(Self::Running),
            2 => Ok(Self::Finished),
            4 => Ok(Self::Timeout),
            other => Err(ProtocolError::UnknownStatus(other)),
        }
    }
}

/// How simulations of one group talk to each other
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CouplingMode {
    /// Independent processes
    #[default]
    None,
    /// One MPI world for the whole group
    Mpi,
    /// User-provided transport, rendezvous through a shared file
    Custom,
}

impl std::fmt::Display for CouplingMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CouplingMode::None => write!(f, "none"),
            CouplingMode::Mpi => write!(f, "mpi"),
            CouplingMode::Custom => write!(f, "custom"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_process_status_codes() {
        for status in [
            ProcessStatus::NotSubmitted,
            ProcessStatus::Pending,
            ProcessStatus::Running,
            ProcessStatus::Finished,
            ProcessStatus::Timeout,
        ] {
            assert_eq!(ProcessStatus::from_code(status.code()).unwrap(), status);
        }
        assert!(ProcessStatus::from_code(3).is_err());
    }

    #[test]
    fn test_job_state_is_final() {
        assert!(!JobState::Waiting.is_final());
        assert!(!JobState::Running.is_final());
        assert!(JobState::Terminated.is_final());
        assert!(JobState::Failed.is_final());
        assert!(JobState::Error.is_final());
    }

    #[test]
    fn test_coupling_mode_display() {
        assert_eq!(CouplingMode::Mpi.to_string(), "mpi");
        assert_eq!(CouplingMode::default(), CouplingMode::None);
    }

    #[test]
    fn test_status_ordering() {
        assert!(ProcessStatus::Running < ProcessStatus::Finished);
        assert!(ProcessStatus::Pending < ProcessStatus::Running);
    }
}
