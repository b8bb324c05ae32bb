//! Error types for nbdcast.

use std::io;
use thiserror::Error;

use crate::types::MAX_BLOCK_SIZE;

pub type Result<T> = std::result::Result<T, Error>;

/// Top-level error type.
#[derive(Debug, Error)]
pub enum Error {
    #[error("backing store error: {0}")]
    Store(#[from] StoreError),

    #[error("stream relay error: {0}")]
    Relay(#[from] RelayError),

    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("export {export} is closed")]
    Closed { export: String },

    #[error("export already active: {name}")]
    ExportExists { name: String },

    #[error("unknown export: {name}")]
    UnknownExport { name: String },

    #[error("io error: {0}")]
    Io(#[from] io::Error),
}

impl Error {
    /// Returns true if the error reports a failed sync-to-medium rather than
    /// a failed read or write.
    pub fn is_durability_failure(&self) -> bool {
        matches!(self, Self::Store(StoreError::Sync(_)))
    }
}

/// Backing store errors.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("failed to allocate backing store: {0}")]
    Allocate(io::Error),

    #[error("io error: {0}")]
    Io(#[from] io::Error),

    #[error("sync to medium failed: {0}")]
    Sync(io::Error),

    #[error(
        "access out of bounds: offset {offset} + length {length} exceeds device size {device_size}"
    )]
    OutOfBounds {
        offset: u64,
        length: u64,
        device_size: u64,
    },

    #[error("request of {length} bytes exceeds maximum block size {max_block_size}")]
    TooLarge { length: u64, max_block_size: u64 },

    #[error("backing store has been released")]
    Released,
}

impl StoreError {
    pub(crate) fn check_range(
        offset: u64,
        length: u64,
        device_size: u64,
    ) -> std::result::Result<(), Self> {
        match offset.checked_add(length) {
            Some(end) if end <= device_size => Ok(()),
            _ => Err(Self::OutOfBounds {
                offset,
                length,
                device_size,
            }),
        }
    }

    /// Rejects a single request larger than the advertised maximum block
    /// size. The stream carries each write whole, so consumers size their
    /// buffers by this limit.
    pub(crate) fn check_block_size(length: u64) -> std::result::Result<(), Self> {
        if length > MAX_BLOCK_SIZE {
            return Err(Self::TooLarge {
                length,
                max_block_size: MAX_BLOCK_SIZE,
            });
        }
        Ok(())
    }
}

/// Stream relay errors.
///
/// These mean the consumer did not take a published event. They never
/// describe the state of the backing store.
#[derive(Debug, Error)]
pub enum RelayError {
    #[error("consumer did not accept event within {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },

    #[error("consumer disconnected")]
    Disconnected,

    #[error("a consumer is already attached")]
    ConsumerAttached,
}

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    ReadError(io::Error),

    #[error("failed to parse config: {0}")]
    ParseError(String),

    #[error("invalid configuration: {field}: {reason}")]
    InvalidValue {
        field: &'static str,
        reason: &'static str,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display() {
        let err = StoreError::OutOfBounds {
            offset: 100,
            length: 8,
            device_size: 50,
        };
        assert!(err.to_string().contains("100"));
    }

    #[test]
    fn check_range_rejects_overflow() {
        assert!(StoreError::check_range(0, 100, 100).is_ok());
        assert!(StoreError::check_range(99, 1, 100).is_ok());
        assert!(StoreError::check_range(100, 0, 100).is_ok());
        assert!(StoreError::check_range(99, 2, 100).is_err());
        assert!(StoreError::check_range(u64::MAX, 1, 100).is_err());
    }

    #[test]
    fn check_block_size_caps_single_request() {
        assert!(StoreError::check_block_size(MAX_BLOCK_SIZE).is_ok());
        assert!(matches!(
            StoreError::check_block_size(MAX_BLOCK_SIZE + 1),
            Err(StoreError::TooLarge { .. })
        ));
    }

    #[test]
    fn sync_failure_is_distinct_from_write_failure() {
        let sync: Error = StoreError::Sync(io::Error::other("disk gone")).into();
        let write: Error = StoreError::Io(io::Error::other("disk gone")).into();
        assert!(sync.is_durability_failure());
        assert!(!write.is_durability_failure());
    }
}
