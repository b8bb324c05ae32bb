//! Fixed-size, randomly addressable backing storage for an export.
//!
//! The store performs no locking of its own. Concurrent writes to
//! non-overlapping ranges are safe; overlapping writes race.

mod file_store;

use async_trait::async_trait;
use bytes::Bytes;

use crate::error::StoreError;

pub use file_store::FileStore;

/// Positioned I/O over a byte region whose size is fixed at creation.
#[async_trait]
pub trait BackingStore: Send + Sync {
    /// Total size in bytes.
    fn size_bytes(&self) -> u64;

    /// Read exactly `length` bytes starting at `offset`.
    async fn read_at(&self, offset: u64, length: usize) -> Result<Bytes, StoreError>;

    /// Write all of `data` at `offset`, returning the number of bytes written.
    async fn write_at(&self, offset: u64, data: Bytes) -> Result<usize, StoreError>;

    /// Flush written data to the medium.
    ///
    /// Failures are reported as [`StoreError::Sync`].
    async fn sync(&self) -> Result<(), StoreError>;

    /// Delete the underlying storage and release the handle.
    fn remove(&self) -> Result<(), StoreError>;
}
