//! BlockBackend: persists writes and republishes them on the stream relay.

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, OnceLock};

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use super::Backend;
use crate::config::{Config, RelayConfig};
use crate::error::{Error, RelayError, Result, StoreError};
use crate::registry::Registration;
use crate::relay::{self, RelayEvent, RelayReceiver, RelaySender, WriteNotification};
use crate::store::{BackingStore, FileStore};
use crate::types::Geometry;

const ACTIVE: u8 = 0;
const CLOSING: u8 = 1;
const CLOSED: u8 = 2;

/// Backend for one export.
///
/// Owns its backing store exclusively. The relay receiver is handed to at
/// most one consumer through [`subscribe`](Self::subscribe).
pub struct BlockBackend {
    name: String,
    store: Arc<dyn BackingStore>,
    size_bytes: u64,
    relay: RelaySender,
    /// Held until a consumer attaches.
    receiver: Mutex<Option<RelayReceiver>>,
    state: AtomicU8,
    registration: OnceLock<Registration>,
}

impl BlockBackend {
    /// Allocate a temporary file store sized by `config.export` and wrap it.
    pub fn create(name: impl Into<String>, config: &Config) -> Result<Self> {
        config.validate()?;
        let store = FileStore::temp_in(config.export.dir(), config.export.size_bytes)?;
        Ok(Self::with_store(name, Arc::new(store), &config.relay))
    }

    /// Wrap an existing store.
    pub fn with_store(
        name: impl Into<String>,
        store: Arc<dyn BackingStore>,
        relay_config: &RelayConfig,
    ) -> Self {
        let name = name.into();
        let size_bytes = store.size_bytes();
        let (relay, receiver) = relay::channel(relay_config.send_timeout());

        info!(
            export = %name,
            size_bytes,
            send_timeout_ms = ?relay_config.send_timeout_ms,
            "export created"
        );

        Self {
            name,
            store,
            size_bytes,
            relay,
            receiver: Mutex::new(Some(receiver)),
            state: AtomicU8::new(ACTIVE),
            registration: OnceLock::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn size_bytes(&self) -> u64 {
        self.size_bytes
    }

    /// Returns true once `close` has started.
    pub fn is_closed(&self) -> bool {
        self.state.load(Ordering::Acquire) != ACTIVE
    }

    /// Attach the single stream consumer.
    ///
    /// Until a consumer attaches, writes wait on the relay.
    pub fn subscribe(&self) -> Result<RelayReceiver> {
        self.ensure_active()?;
        self.receiver
            .lock()
            .take()
            .ok_or_else(|| RelayError::ConsumerAttached.into())
    }

    pub(crate) fn set_registration(&self, registration: Registration) {
        if self.registration.set(registration).is_err() {
            warn!(export = %self.name, "export registered twice");
        }
    }

    fn ensure_active(&self) -> Result<()> {
        if self.is_closed() {
            return Err(Error::Closed {
                export: self.name.clone(),
            });
        }
        Ok(())
    }

    async fn sync(&self) -> Result<()> {
        self.store.sync().await.map_err(durability_failure)?;
        Ok(())
    }

    /// Delete storage, drop the registry entry and finish the transition to
    /// closed.
    fn release(&self) -> Result<()> {
        self.receiver.lock().take();
        if let Some(registration) = self.registration.get() {
            registration.release(self);
        }
        let removed = self.store.remove();
        self.state.store(CLOSED, Ordering::Release);
        removed.map_err(Error::from)
    }
}

/// Sync failures are reported as durability failures, never as plain I/O.
fn durability_failure(err: StoreError) -> StoreError {
    match err {
        StoreError::Io(e) => StoreError::Sync(e),
        other => other,
    }
}

/// Releases the backend if `close` is cancelled while waiting on the relay.
struct CloseGuard<'a> {
    backend: &'a BlockBackend,
    armed: bool,
}

impl Drop for CloseGuard<'_> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        warn!(export = %self.backend.name, "close cancelled before end marker was taken");
        if let Err(e) = self.backend.release() {
            warn!(export = %self.backend.name, error = %e, "failed to release export");
        }
    }
}

#[async_trait]
impl Backend for BlockBackend {
    async fn read_at(&self, offset: u64, length: usize) -> Result<Bytes> {
        self.ensure_active()?;
        Ok(self.store.read_at(offset, length).await?)
    }

    async fn write_at(&self, offset: u64, data: Bytes, fua: bool) -> Result<usize> {
        self.ensure_active()?;
        StoreError::check_range(offset, data.len() as u64, self.size_bytes)?;
        StoreError::check_block_size(data.len() as u64)?;

        // Publish before persisting: the stream sees a write no later than
        // it becomes durable.
        self.relay
            .publish(RelayEvent::Write(WriteNotification::new(
                offset,
                data.clone(),
            )))
            .await?;
        debug!(export = %self.name, offset, length = data.len(), fua, "write published");

        let written = self.store.write_at(offset, data).await?;
        if fua {
            self.sync().await?;
        }
        Ok(written)
    }

    async fn trim_at(&self, _offset: u64, length: u64) -> Result<u64> {
        self.ensure_active()?;
        Ok(length)
    }

    async fn flush(&self) -> Result<()> {
        self.ensure_active()?;
        self.sync().await
    }

    async fn close(&self) -> Result<()> {
        if self
            .state
            .compare_exchange(ACTIVE, CLOSING, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(Error::Closed {
                export: self.name.clone(),
            });
        }

        let mut guard = CloseGuard {
            backend: self,
            armed: true,
        };
        let signalled = self.relay.publish(RelayEvent::End).await;
        guard.armed = false;

        let released = self.release();
        info!(
            export = %self.name,
            end_signalled = signalled.is_ok(),
            "export closed"
        );
        signalled?;
        released
    }

    fn geometry(&self) -> Geometry {
        Geometry::new(self.size_bytes)
    }

    fn has_fua(&self) -> bool {
        true
    }

    fn has_flush(&self) -> bool {
        true
    }
}
