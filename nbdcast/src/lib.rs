//! nbdcast: block backend that persists writes and streams them live.
//!
//! Sits behind a network block device server. Every write is stored in a
//! sparse backing file and republished, in order, to exactly one stream
//! consumer. Publishing waits for the consumer, so a slow consumer slows
//! writes to its export.
//!
//! # Library Usage
//!
//! ```ignore
//! use bytes::Bytes;
//! use nbdcast::{Backend, Config, ExportRegistry};
//! use tokio::net::TcpStream;
//!
//! let registry = ExportRegistry::new();
//! let backend = registry.create("name1", &Config::default())?;
//!
//! // Streaming side: header, then one (offset, length, payload) per write
//! let mut socket = TcpStream::connect("127.0.0.1:9000").await?;
//! tokio::spawn({
//!     let registry = registry.clone();
//!     async move { registry.stream_to("name1", &mut socket).await }
//! });
//!
//! // Protocol side
//! backend.write_at(10, Bytes::from_static(&[1, 2, 3]), false).await?;
//! backend.close().await?;
//! ```

pub mod backend;
pub mod config;
pub mod error;
pub mod registry;
pub mod relay;
pub mod store;
pub mod types;

pub use backend::{Backend, BlockBackend};
pub use config::{Config, ExportConfig, RelayConfig};
pub use error::{ConfigError, Error, RelayError, Result, StoreError};
pub use registry::ExportRegistry;
pub use relay::{RelayEvent, RelayReceiver, RelaySender, WriteNotification, pump};
pub use store::{BackingStore, FileStore};
pub use types::{
    DEFAULT_EXPORT_SIZE_BYTES, Geometry, MAX_BLOCK_SIZE, MIN_BLOCK_SIZE, PREFERRED_BLOCK_SIZE,
};
