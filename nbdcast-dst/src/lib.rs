//! Deterministic simulation testing for nbdcast.
//!
//! Kept out of the main crate so the fault-free oracles and harnesses are
//! never compiled into production builds.
//!
//! ## Running
//!
//! ```bash
//! # PR-level quick runs
//! cargo test -p nbdcast-dst simulation
//!
//! # Long runs, reproducible with DST_SEED
//! DST_SEED=42 cargo test -p nbdcast-dst simulation -- --ignored
//! ```

pub mod harness;
pub mod simulation;

pub use harness::{
    BackendAction, BackendHarness, BackendStats, ConcurrentHarness, ConcurrentStats, ImageOracle,
    SimulationError, StreamReplay,
};
pub use simulation::{build_runtime, get_seed, run_backend_simulation, run_concurrent_simulation};
