//! Runners that build an export, stream it and replay the stream.

use crate::harness::{BackendHarness, ConcurrentHarness, SimulationError};

/// Build a single-threaded tokio runtime for simulation.
///
/// Operation sequences come from the harness seed; task interleaving
/// follows the current-thread scheduler.
pub fn build_runtime() -> tokio::runtime::Runtime {
    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .expect("failed to build runtime")
}

/// Run a single-writer simulation with the given seed and number of operations.
pub async fn run_backend_simulation(
    seed: u64,
    size_bytes: u64,
    operations: u64,
) -> Result<(), SimulationError> {
    eprintln!(
        "Backend simulation: seed={}, size={}, ops={}",
        seed, size_bytes, operations
    );

    let mut harness = BackendHarness::new(seed, size_bytes);
    harness
        .init()
        .await
        .map_err(|e| SimulationError::Unexpected(e.to_string()))?;
    harness.run(operations).await?;
    let replay = harness.finish().await?;

    eprintln!(
        "Backend simulation complete: {:?}, notifications={}",
        harness.stats(),
        replay.notifications.len()
    );
    Ok(())
}

/// Run `writers` concurrent writers against one export.
pub async fn run_concurrent_simulation(
    seed: u64,
    writers: usize,
    writes_per_writer: usize,
) -> Result<(), SimulationError> {
    eprintln!(
        "Concurrent simulation: seed={}, writers={}, writes={}",
        seed, writers, writes_per_writer
    );

    let mut harness = ConcurrentHarness::new(seed, writers, writes_per_writer);
    harness.run().await?;

    eprintln!("Concurrent simulation complete: {:?}", harness.stats());
    Ok(())
}

/// Seed for a run: `DST_SEED` when it parses, otherwise fresh entropy.
///
/// Print it from long runs so a failing stream replay can be reproduced.
pub fn get_seed() -> u64 {
    match std::env::var("DST_SEED").map(|raw| raw.trim().parse::<u64>()) {
        Ok(Ok(seed)) => seed,
        _ => rand::random(),
    }
}
