//! Block device backends called by the protocol layer.
//!
//! [`Backend`] is the capability set a protocol server drives for one
//! export. [`BlockBackend`] implements it over a [`BackingStore`] and
//! republishes every write on a stream relay.
//!
//! # Cancellation
//!
//! Every operation is an ordinary future. Dropping it (directly, from a
//! `tokio::select!`, or through `tokio::time::timeout`) cancels the
//! operation. Only `write_at` and `close` can wait on the relay consumer;
//! a cancelled wait is never delivered later.
//!
//! [`BackingStore`]: crate::store::BackingStore

mod block_backend;

use async_trait::async_trait;
use bytes::Bytes;

use crate::error::Result;
use crate::types::Geometry;

pub use block_backend::BlockBackend;

/// Capability set of an exported block device.
#[async_trait]
pub trait Backend: Send + Sync {
    /// Read `length` bytes at `offset`.
    async fn read_at(&self, offset: u64, length: usize) -> Result<Bytes>;

    /// Write `data` at `offset`, returning the number of bytes written.
    ///
    /// With `fua` set the data is on stable storage when this returns.
    async fn write_at(&self, offset: u64, data: Bytes, fua: bool) -> Result<usize>;

    /// Discard a byte range, returning the length trimmed.
    async fn trim_at(&self, offset: u64, length: u64) -> Result<u64>;

    /// Flush completed writes to stable storage.
    async fn flush(&self) -> Result<()>;

    /// End the device session. Terminal.
    async fn close(&self) -> Result<()>;

    /// Device size and block size constraints.
    fn geometry(&self) -> Geometry;

    /// Whether per-write force-unit-access is honoured.
    fn has_fua(&self) -> bool;

    /// Whether `flush` is supported.
    fn has_flush(&self) -> bool;
}
