//! # Melissa Launcher
//!
//! Fault-tolerant orchestration of simulation ensembles on batch schedulers.
//!
//! ## Architecture
//!
//! ```text
//! Launcher (this crate)                  Aggregator (melissa-server)
//! ├── Study engine ── control plane ───► SERVER / JOB / DROP / STOP ...
//! ├── Fault detector                     ▲
//! ├── Scheduler adapters                 │ data plane
//! └── Hooks ──► batch system ──► simulation groups ──┘
//! ```
//!
//! The launcher never sees simulation data. It submits the aggregator and
//! the simulation groups, watches both through the scheduler and through the
//! aggregator's control messages, and repairs what breaks:
//!
//! 1. **Crash**: the scheduler says a group ended before the aggregator saw
//!    it finish; the group is cancelled and resubmitted
//! 2. **Hang / timeout**: a group runs for too long or goes silent; same
//! 3. **Crash budget**: after 3 restarts a group is dropped and the
//!    aggregator stops waiting for it
//! 4. **Server loss**: active groups are cancelled, the aggregator reboots
//!    from the checkpoint keyed by the first job id, groups are resubmitted
//!
//! See [`study`] and [`fault`] for details.

#![warn(clippy::all)]

pub mod config;
pub mod error;
pub mod fault;
pub mod hooks;
pub mod job;
pub mod sampling;
pub mod scheduler;
pub mod study;

pub use config::{StudyConfig, StudyOptions, preflight};
pub use error::{LauncherError, Result};
pub use fault::{FaultDetector, FaultPolicy, GroupAction, GroupFault, ServerFault};
pub use hooks::{
    ExecutableSpec, FunctionHooks, GroupLaunch, SchedulerHooks, ServerLaunch, StudyHooks, UserFunctions,
};
pub use job::{CRASH_THRESHOLD, GroupRecord, Registry, ServerRecord};
pub use scheduler::{Job, Scheduler, SchedulerKind, SubmitRequest, create_scheduler};
pub use study::{GroupReport, Study, StudyReport};
