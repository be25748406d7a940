//! Melissa Server - aggregator-side bookkeeping
//!
//! Tracks which timesteps every simulation delivered, reports lifecycle
//! changes to the launcher and survives reboots through checkpoints keyed by
//! the first job id of the study. The statistics themselves are computed
//! behind [`StatisticsSink`].
//!
//! ## Modules
//!
//! - [`simulation`]: per-simulation record and timestep bitmaps
//! - [`table`]: the simulation table (ingest, drops, completion, timeouts)
//! - [`checkpoint`]: checkpoint store
//! - [`aggregator`]: control/data run loop
//! - [`listener`]: TCP data-plane listener

pub mod aggregator;
pub mod checkpoint;
pub mod error;
pub mod listener;
pub mod simulation;
pub mod table;

pub use aggregator::{Aggregator, AggregatorConfig, AggregatorReport, LoggingSink, StatisticsSink};
pub use checkpoint::{CheckpointStore, should_checkpoint};
pub use error::{Result, ServerError};
pub use listener::DataListener;
pub use simulation::{Receipt, Simulation, SimulationStatus, TimestepMask};
pub use table::{IngestOutcome, SimulationTable, TableSnapshot};
