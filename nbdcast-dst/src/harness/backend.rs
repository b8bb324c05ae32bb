//! Backend-level simulation harness.
//!
//! Drives a registered export with random operations while a consumer
//! drains its relay stream through the wire format, then checks that the
//! stream replays to exactly the stored image.

use std::path::PathBuf;
use std::sync::Arc;

use bytes::Bytes;
use nbdcast::relay::wire::StreamDecoder;
use nbdcast::{Backend, BlockBackend, Config, ExportRegistry, FileStore, WriteNotification};
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};
use tempfile::TempDir;
use tokio::io::{AsyncReadExt, duplex};
use tokio::task::JoinHandle;

use super::SimulationError;

const EXPORT_NAME: &str = "dst";

/// Largest write or read issued by the harness.
const IO_LENGTH_MAX: u64 = 32 * 1024;

/// Capacity of the in-memory pipe between relay and decoder.
const PIPE_CAPACITY_BYTES: usize = 64 * 1024;

/// Actions that can be performed in simulation.
#[derive(Debug, Clone)]
pub enum BackendAction {
    Read { offset: u64, length: usize },
    Write { offset: u64, data: Vec<u8>, fua: bool },
    Trim { offset: u64, length: u64 },
    Flush,
}

/// In-memory image of the device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageOracle {
    bytes: Vec<u8>,
}

impl ImageOracle {
    pub fn new(size_bytes: u64) -> Self {
        Self {
            bytes: vec![0u8; size_bytes as usize],
        }
    }

    pub fn read(&self, offset: u64, length: usize) -> &[u8] {
        let start = offset as usize;
        &self.bytes[start..start + length]
    }

    pub fn write(&mut self, offset: u64, data: &[u8]) {
        let start = offset as usize;
        self.bytes[start..start + data.len()].copy_from_slice(data);
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }
}

/// What the consumer observed on the stream.
#[derive(Debug)]
pub struct StreamReplay {
    pub size_bytes: Option<u64>,
    pub notifications: Vec<WriteNotification>,
    pub image: ImageOracle,
}

/// Simulation statistics.
#[derive(Debug, Default, Clone)]
pub struct BackendStats {
    pub operations: u64,
    pub reads: u64,
    pub writes: u64,
    pub fua_writes: u64,
    pub trims: u64,
    pub flushes: u64,
}

/// Backend simulation harness.
pub struct BackendHarness {
    rng: SmallRng,
    size_bytes: u64,
    registry: ExportRegistry,
    backend: Option<Arc<BlockBackend>>,
    oracle: ImageOracle,
    /// Writes in the order they completed.
    expected: Vec<WriteNotification>,
    consumer: Option<JoinHandle<Result<StreamReplay, SimulationError>>>,
    stats: BackendStats,
    dir: TempDir,
}

impl BackendHarness {
    pub fn new(seed: u64, size_bytes: u64) -> Self {
        Self {
            rng: SmallRng::seed_from_u64(seed),
            size_bytes,
            registry: ExportRegistry::new(),
            backend: None,
            oracle: ImageOracle::new(size_bytes),
            expected: Vec::new(),
            consumer: None,
            stats: BackendStats::default(),
            dir: TempDir::new().expect("failed to create temp dir"),
        }
    }

    /// Create the export and attach the stream consumer.
    pub async fn init(&mut self) -> Result<(), nbdcast::Error> {
        let mut config = Config::default();
        config.export.size_bytes = self.size_bytes;
        config.export.dir = Some(self.dir.path().to_path_buf());

        let backend = self.registry.create(EXPORT_NAME, &config)?;
        let (mut client, mut server) = duplex(PIPE_CAPACITY_BYTES);

        let registry = self.registry.clone();
        let streamer =
            tokio::spawn(async move { registry.stream_to(EXPORT_NAME, &mut server).await });

        let size_bytes = self.size_bytes;
        let consumer = tokio::spawn(async move {
            let mut decoder = StreamDecoder::new();
            let mut replay = StreamReplay {
                size_bytes: None,
                notifications: Vec::new(),
                image: ImageOracle::new(size_bytes),
            };
            let mut chunk = vec![0u8; PIPE_CAPACITY_BYTES];

            loop {
                let n = client
                    .read(&mut chunk)
                    .await
                    .map_err(|e| SimulationError::Unexpected(e.to_string()))?;
                if n == 0 {
                    break;
                }
                decoder.extend(&chunk[..n]);
                while let Some(notification) = decoder
                    .next_notification()
                    .map_err(|e| SimulationError::Unexpected(e.to_string()))?
                {
                    replay.image.write(notification.offset, &notification.payload);
                    replay.notifications.push(notification);
                }
            }

            if decoder.remaining() != 0 {
                return Err(SimulationError::Mismatch {
                    context: format!("{} trailing bytes in stream", decoder.remaining()),
                });
            }
            replay.size_bytes = decoder.size_bytes();

            let forwarded = streamer
                .await
                .map_err(|e| SimulationError::Unexpected(e.to_string()))?
                .map_err(|e| SimulationError::Unexpected(e.to_string()))?;
            if forwarded != replay.notifications.len() as u64 {
                return Err(SimulationError::Mismatch {
                    context: format!(
                        "streamer forwarded {} notifications, consumer decoded {}",
                        forwarded,
                        replay.notifications.len()
                    ),
                });
            }
            Ok(replay)
        });

        self.backend = Some(backend);
        self.consumer = Some(consumer);
        Ok(())
    }

    fn backend(&self) -> &Arc<BlockBackend> {
        self.backend.as_ref().expect("not initialized")
    }

    /// Run the simulation for a given number of operations.
    pub async fn run(&mut self, operations: u64) -> Result<(), SimulationError> {
        for _ in 0..operations {
            let action = self.sample_action();
            self.execute(action).await?;
            self.stats.operations += 1;
            self.validate_invariants()?;
        }
        Ok(())
    }

    fn validate_invariants(&self) -> Result<(), SimulationError> {
        let geometry = self.backend().geometry();
        if geometry != nbdcast::Geometry::new(self.size_bytes) {
            return Err(SimulationError::Mismatch {
                context: format!("geometry changed: {:?}", geometry),
            });
        }
        Ok(())
    }

    fn sample_range(&mut self) -> (u64, u64) {
        let max_len = IO_LENGTH_MAX.min(self.size_bytes);
        let length = self.rng.random_range(1..=max_len);
        let offset = self.rng.random_range(0..=self.size_bytes - length);
        (offset, length)
    }

    fn sample_action(&mut self) -> BackendAction {
        let choice = self.rng.random_range(0..100);
        match choice {
            0..40 => {
                let (offset, length) = self.sample_range();
                BackendAction::Read {
                    offset,
                    length: length as usize,
                }
            }
            40..80 => {
                let (offset, length) = self.sample_range();
                let data: Vec<u8> = (0..length).map(|_| self.rng.random()).collect();
                BackendAction::Write {
                    offset,
                    data,
                    fua: self.rng.random_bool(0.2),
                }
            }
            80..90 => {
                let (offset, length) = self.sample_range();
                BackendAction::Trim { offset, length }
            }
            _ => BackendAction::Flush,
        }
    }

    /// Execute a single action.
    pub async fn execute(&mut self, action: BackendAction) -> Result<(), SimulationError> {
        match action {
            BackendAction::Read { offset, length } => {
                self.stats.reads += 1;
                let actual = self
                    .backend()
                    .read_at(offset, length)
                    .await
                    .map_err(|e| SimulationError::Unexpected(e.to_string()))?;
                let expected = self.oracle.read(offset, length);
                if actual.as_ref() != expected {
                    return Err(SimulationError::Mismatch {
                        context: format!(
                            "read(offset={}, len={}): first diff at byte {}",
                            offset,
                            length,
                            find_diff(expected, &actual)
                        ),
                    });
                }
            }
            BackendAction::Write { offset, data, fua } => {
                self.stats.writes += 1;
                if fua {
                    self.stats.fua_writes += 1;
                }
                let data = Bytes::from(data);
                let written = self
                    .backend()
                    .write_at(offset, data.clone(), fua)
                    .await
                    .map_err(|e| SimulationError::Unexpected(e.to_string()))?;
                if written != data.len() {
                    return Err(SimulationError::Mismatch {
                        context: format!("write wrote {} of {} bytes", written, data.len()),
                    });
                }
                self.oracle.write(offset, &data);
                self.expected.push(WriteNotification::new(offset, data));
            }
            BackendAction::Trim { offset, length } => {
                self.stats.trims += 1;
                // Trim is a no-op: the oracle is left untouched
                let trimmed = self
                    .backend()
                    .trim_at(offset, length)
                    .await
                    .map_err(|e| SimulationError::Unexpected(e.to_string()))?;
                if trimmed != length {
                    return Err(SimulationError::Mismatch {
                        context: format!("trim reported {} of {} bytes", trimmed, length),
                    });
                }
            }
            BackendAction::Flush => {
                self.stats.flushes += 1;
                self.backend()
                    .flush()
                    .await
                    .map_err(|e| SimulationError::Unexpected(e.to_string()))?;
            }
        }
        Ok(())
    }

    /// Flush, verify the image survives a reopen, close the export and
    /// check the replayed stream against the oracle.
    pub async fn finish(&mut self) -> Result<StreamReplay, SimulationError> {
        let backend = self.backend.take().expect("not initialized");
        let path = backing_file(self.dir.path())?;

        backend
            .flush()
            .await
            .map_err(|e| SimulationError::Unexpected(e.to_string()))?;
        self.validate_reopened_image(&path).await?;

        backend
            .close()
            .await
            .map_err(|e| SimulationError::Unexpected(e.to_string()))?;

        let replay = self
            .consumer
            .take()
            .expect("not initialized")
            .await
            .map_err(|e| SimulationError::Unexpected(e.to_string()))??;

        if replay.size_bytes != Some(self.size_bytes) {
            return Err(SimulationError::Mismatch {
                context: format!("stream header: {:?}", replay.size_bytes),
            });
        }
        if replay.notifications != self.expected {
            return Err(SimulationError::Mismatch {
                context: format!(
                    "stream order: expected {} notifications, got {}; first diff at {}",
                    self.expected.len(),
                    replay.notifications.len(),
                    first_notification_diff(&self.expected, &replay.notifications)
                ),
            });
        }
        if replay.image != self.oracle {
            return Err(SimulationError::Mismatch {
                context: format!(
                    "replayed image differs at byte {}",
                    find_diff(self.oracle.as_bytes(), replay.image.as_bytes())
                ),
            });
        }
        if path.exists() {
            return Err(SimulationError::Mismatch {
                context: format!("backing file {} not removed", path.display()),
            });
        }
        if !self.registry.is_empty() {
            return Err(SimulationError::Mismatch {
                context: format!("exports left registered: {:?}", self.registry.names()),
            });
        }

        Ok(replay)
    }

    async fn validate_reopened_image(&self, path: &std::path::Path) -> Result<(), SimulationError> {
        use nbdcast::BackingStore;

        let reopened =
            FileStore::open(path).map_err(|e| SimulationError::Unexpected(e.to_string()))?;
        let image = reopened
            .read_at(0, self.size_bytes as usize)
            .await
            .map_err(|e| SimulationError::Unexpected(e.to_string()))?;
        if image.as_ref() != self.oracle.as_bytes() {
            return Err(SimulationError::Mismatch {
                context: format!(
                    "reopened image differs at byte {}",
                    find_diff(self.oracle.as_bytes(), &image)
                ),
            });
        }
        Ok(())
    }

    pub fn stats(&self) -> &BackendStats {
        &self.stats
    }
}

fn backing_file(dir: &std::path::Path) -> Result<PathBuf, SimulationError> {
    let mut entries = std::fs::read_dir(dir)
        .map_err(|e| SimulationError::Unexpected(e.to_string()))?
        .map(|entry| entry.map(|e| e.path()))
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| SimulationError::Unexpected(e.to_string()))?;
    match entries.len() {
        1 => Ok(entries.remove(0)),
        n => Err(SimulationError::Unexpected(format!(
            "expected one backing file, found {}",
            n
        ))),
    }
}

pub(crate) fn find_diff(expected: &[u8], actual: &[u8]) -> usize {
    for (i, (e, a)) in expected.iter().zip(actual.iter()).enumerate() {
        if e != a {
            return i;
        }
    }
    expected.len().min(actual.len())
}

fn first_notification_diff(expected: &[WriteNotification], actual: &[WriteNotification]) -> usize {
    expected
        .iter()
        .zip(actual)
        .position(|(e, a)| e != a)
        .unwrap_or(expected.len().min(actual.len()))
}
