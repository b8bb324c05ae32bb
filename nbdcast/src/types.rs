//! Core types for nbdcast.

/// Minimum block size advertised to the protocol layer (1 byte).
pub const MIN_BLOCK_SIZE: u64 = 1;

/// Preferred block size advertised to the protocol layer (32 KiB).
pub const PREFERRED_BLOCK_SIZE: u64 = 32 * 1024;

/// Maximum block size advertised to the protocol layer (128 MiB).
pub const MAX_BLOCK_SIZE: u64 = 128 * 1024 * 1024;

/// Export size used when none is configured.
pub const DEFAULT_EXPORT_SIZE_BYTES: u64 = 3_290_431_488;

const _: () = {
    assert!(MIN_BLOCK_SIZE <= PREFERRED_BLOCK_SIZE);
    assert!(PREFERRED_BLOCK_SIZE <= MAX_BLOCK_SIZE);
    assert!(PREFERRED_BLOCK_SIZE.is_power_of_two());
};

/// Device geometry reported to the protocol layer.
///
/// Block sizes are fixed constants; only the total size depends on the
/// export.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Geometry {
    pub size_bytes: u64,
    pub min_block_size: u64,
    pub preferred_block_size: u64,
    pub max_block_size: u64,
}

impl Geometry {
    #[inline]
    pub fn new(size_bytes: u64) -> Self {
        Self {
            size_bytes,
            min_block_size: MIN_BLOCK_SIZE,
            preferred_block_size: PREFERRED_BLOCK_SIZE,
            max_block_size: MAX_BLOCK_SIZE,
        }
    }
}
