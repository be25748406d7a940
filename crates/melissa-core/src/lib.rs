//! Melissa Core - Shared types and wire protocol
//!
//! This crate defines the abstractions used on both sides of a study:
//! - melissa-launcher (orchestrator binary)
//! - melissa-server (aggregator bookkeeping)
//!
//! Key types:
//! - Identifiers and lifecycle states (scheduler view and protocol view)
//! - Control-plane `Message` and data-plane `DataMessage` codecs
//! - Control-plane endpoints and the bounded data-plane queue

pub mod error;
pub mod message;
pub mod options;
pub mod transport;
pub mod types;

pub use error::*;
pub use message::*;
pub use options::*;
pub use transport::*;
pub use types::*;
