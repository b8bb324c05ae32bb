//! Simulation harnesses for nbdcast.
//!
//! Each harness drives an export with generated writes while a consumer
//! decodes the live stream. A run passes when the decoded notifications
//! match the writes in completion order and replaying them rebuilds the
//! image held in the backing file.

pub mod backend;
pub mod concurrent;

pub use backend::{BackendAction, BackendHarness, BackendStats, ImageOracle, StreamReplay};
pub use concurrent::{ConcurrentHarness, ConcurrentStats};

/// Why a simulation run failed.
#[derive(Debug)]
pub enum SimulationError {
    /// The export, its stream or its backing file disagreed with the oracle.
    Mismatch { context: String },
    /// An operation failed that the run expected to succeed.
    Unexpected(String),
}

impl std::fmt::Display for SimulationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Mismatch { context } => write!(f, "stream replay diverged: {context}"),
            Self::Unexpected(msg) => write!(f, "simulation aborted: {msg}"),
        }
    }
}

impl std::error::Error for SimulationError {}
