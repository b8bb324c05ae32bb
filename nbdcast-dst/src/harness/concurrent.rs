//! Concurrent writer harness.
//!
//! Several tasks write to disjoint regions of one export at once. The
//! stream must carry every write whole, keep each writer's own order, and
//! replay to the stored image.

use std::sync::Arc;

use bytes::Bytes;
use nbdcast::relay::wire::StreamDecoder;
use nbdcast::{Backend, Config, ExportRegistry, WriteNotification};
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};
use tempfile::TempDir;
use tokio::io::{AsyncReadExt, duplex};

use super::SimulationError;
use super::backend::{ImageOracle, find_diff};

const EXPORT_NAME: &str = "dst-concurrent";

/// Bytes owned by each writer.
const REGION_BYTES: u64 = 4096;

/// Simulation statistics.
#[derive(Debug, Default, Clone)]
pub struct ConcurrentStats {
    pub writers: usize,
    pub notifications: usize,
}

/// Harness running `writers` concurrent writers.
pub struct ConcurrentHarness {
    seed: u64,
    writers: usize,
    writes_per_writer: usize,
    stats: ConcurrentStats,
}

impl ConcurrentHarness {
    pub fn new(seed: u64, writers: usize, writes_per_writer: usize) -> Self {
        Self {
            seed,
            writers,
            writes_per_writer,
            stats: ConcurrentStats::default(),
        }
    }

    fn size_bytes(&self) -> u64 {
        REGION_BYTES * self.writers as u64
    }

    /// Run all writers to completion, close the export and verify the stream.
    pub async fn run(&mut self) -> Result<(), SimulationError> {
        let dir = TempDir::new().map_err(|e| SimulationError::Unexpected(e.to_string()))?;
        let mut config = Config::default();
        config.export.size_bytes = self.size_bytes();
        config.export.dir = Some(dir.path().to_path_buf());

        let registry = ExportRegistry::new();
        let backend = registry
            .create(EXPORT_NAME, &config)
            .map_err(|e| SimulationError::Unexpected(e.to_string()))?;

        let (mut client, mut server) = duplex(16 * 1024);
        let streamer = tokio::spawn({
            let registry = registry.clone();
            async move { registry.stream_to(EXPORT_NAME, &mut server).await }
        });
        let reader = tokio::spawn(async move {
            let mut stream = Vec::new();
            client.read_to_end(&mut stream).await.map(|_| stream)
        });

        let mut tasks = Vec::with_capacity(self.writers);
        for writer in 0..self.writers {
            let backend = Arc::clone(&backend);
            let mut rng = SmallRng::seed_from_u64(self.seed.wrapping_add(writer as u64));
            let writes = self.writes_per_writer;
            tasks.push(tokio::spawn(async move {
                let base = writer as u64 * REGION_BYTES;
                let mut issued = Vec::with_capacity(writes);
                for _ in 0..writes {
                    let length = rng.random_range(1..=REGION_BYTES / 4);
                    let offset = base + rng.random_range(0..=REGION_BYTES - length);
                    let data: Bytes = (0..length).map(|_| rng.random::<u8>()).collect();
                    backend
                        .write_at(offset, data.clone(), rng.random_bool(0.1))
                        .await
                        .map_err(|e| SimulationError::Unexpected(e.to_string()))?;
                    issued.push(WriteNotification::new(offset, data));
                    tokio::task::yield_now().await;
                }
                Ok::<_, SimulationError>(issued)
            }));
        }

        let mut issued = Vec::with_capacity(self.writers);
        for task in tasks {
            issued.push(
                task.await
                    .map_err(|e| SimulationError::Unexpected(e.to_string()))??,
            );
        }

        let stored = backend
            .read_at(0, self.size_bytes() as usize)
            .await
            .map_err(|e| SimulationError::Unexpected(e.to_string()))?;
        backend
            .close()
            .await
            .map_err(|e| SimulationError::Unexpected(e.to_string()))?;

        streamer
            .await
            .map_err(|e| SimulationError::Unexpected(e.to_string()))?
            .map_err(|e| SimulationError::Unexpected(e.to_string()))?;
        let stream = reader
            .await
            .map_err(|e| SimulationError::Unexpected(e.to_string()))?
            .map_err(|e| SimulationError::Unexpected(e.to_string()))?;

        let mut decoder = StreamDecoder::new();
        decoder.extend(&stream);
        let mut per_writer = vec![Vec::new(); self.writers];
        let mut replay = ImageOracle::new(self.size_bytes());
        while let Some(notification) = decoder
            .next_notification()
            .map_err(|e| SimulationError::Unexpected(e.to_string()))?
        {
            let writer = (notification.offset / REGION_BYTES) as usize;
            let end = notification.offset + notification.length();
            if writer >= self.writers || end > (writer as u64 + 1) * REGION_BYTES {
                return Err(SimulationError::Mismatch {
                    context: format!(
                        "notification at {} len {} crosses a writer region",
                        notification.offset,
                        notification.length()
                    ),
                });
            }
            replay.write(notification.offset, &notification.payload);
            per_writer[writer].push(notification);
            self.stats.notifications += 1;
        }

        for (writer, (seen, sent)) in per_writer.iter().zip(&issued).enumerate() {
            if seen != sent {
                return Err(SimulationError::Mismatch {
                    context: format!(
                        "writer {}: sent {} writes, stream carried {} (or out of order)",
                        writer,
                        sent.len(),
                        seen.len()
                    ),
                });
            }
        }
        if replay.as_bytes() != stored.as_ref() {
            return Err(SimulationError::Mismatch {
                context: format!(
                    "replayed image differs at byte {}",
                    find_diff(&stored, replay.as_bytes())
                ),
            });
        }

        self.stats.writers = self.writers;
        Ok(())
    }

    pub fn stats(&self) -> &ConcurrentStats {
        &self.stats
    }
}
