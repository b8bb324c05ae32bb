//! Export registry: maps export names to live backends.
//!
//! The protocol side creates exports through the registry; the streaming
//! side looks them up by name to attach its consumer. Entries are removed
//! when their backend closes, so a name can be reused for a new session.

use std::collections::HashMap;
use std::collections::hash_map::Entry;
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tokio::io::AsyncWrite;
use tracing::{debug, info};

use crate::backend::BlockBackend;
use crate::config::Config;
use crate::error::{Error, Result};
use crate::relay::{self, RelayReceiver};

type Exports = Mutex<HashMap<String, Arc<BlockBackend>>>;

/// Registry of active exports, keyed by name.
///
/// Cheap to clone; clones share the same table.
#[derive(Clone, Default)]
pub struct ExportRegistry {
    exports: Arc<Exports>,
}

/// Link from a backend back to the registry it is listed in.
///
/// Weak so that entries do not keep the table alive.
pub(crate) struct Registration {
    exports: Weak<Exports>,
}

impl Registration {
    /// Remove `backend`'s entry if it still refers to this instance.
    pub(crate) fn release(&self, backend: &BlockBackend) {
        let Some(exports) = self.exports.upgrade() else {
            return;
        };

        let removed = {
            let mut exports = exports.lock();
            match exports.get(backend.name()) {
                Some(entry) if std::ptr::eq(Arc::as_ptr(entry), backend) => {
                    exports.remove(backend.name())
                }
                _ => None,
            }
        };

        if removed.is_some() {
            debug!(export = %backend.name(), "export unregistered");
        }
    }
}

impl ExportRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a file-backed export and register it under `name`.
    ///
    /// Fails with [`Error::ExportExists`] while another export with the same
    /// name is active.
    pub fn create(&self, name: impl Into<String>, config: &Config) -> Result<Arc<BlockBackend>> {
        let name = name.into();
        if self.exports.lock().contains_key(&name) {
            return Err(Error::ExportExists { name });
        }

        let backend = Arc::new(BlockBackend::create(name, config)?);
        self.register(Arc::clone(&backend))?;
        Ok(backend)
    }

    /// Register an already constructed backend under its own name.
    pub fn register(&self, backend: Arc<BlockBackend>) -> Result<()> {
        let mut exports = self.exports.lock();
        match exports.entry(backend.name().to_string()) {
            Entry::Occupied(entry) => Err(Error::ExportExists {
                name: entry.key().clone(),
            }),
            Entry::Vacant(entry) => {
                backend.set_registration(Registration {
                    exports: Arc::downgrade(&self.exports),
                });
                info!(export = %backend.name(), "export registered");
                entry.insert(backend);
                Ok(())
            }
        }
    }

    /// Look up an active export.
    pub fn lookup(&self, name: &str) -> Option<Arc<BlockBackend>> {
        self.exports.lock().get(name).cloned()
    }

    /// Attach the stream consumer of an active export.
    pub fn subscribe(&self, name: &str) -> Result<RelayReceiver> {
        self.lookup(name)
            .ok_or_else(|| Error::UnknownExport {
                name: name.to_string(),
            })?
            .subscribe()
    }

    /// Stream an export's writes to `writer` until its session ends.
    ///
    /// Writes the size header, then every write notification, and returns
    /// the number of notifications forwarded.
    pub async fn stream_to<W>(&self, name: &str, writer: &mut W) -> Result<u64>
    where
        W: AsyncWrite + Unpin,
    {
        let backend = self.lookup(name).ok_or_else(|| Error::UnknownExport {
            name: name.to_string(),
        })?;
        let receiver = backend.subscribe()?;
        let size_bytes = backend.size_bytes();
        // Do not hold the backend while streaming; close must be able to
        // drop the last reference.
        drop(backend);

        Ok(relay::pump(receiver, size_bytes, writer).await?)
    }

    /// Names of all active exports, sorted.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<_> = self.exports.lock().keys().cloned().collect();
        names.sort_unstable();
        names
    }

    pub fn len(&self) -> usize {
        self.exports.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.exports.lock().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::Backend;
    use crate::relay::wire::StreamDecoder;
    use crate::relay::{RelayEvent, WriteNotification};
    use bytes::Bytes;
    use tempfile::TempDir;
    use tokio::io::{AsyncReadExt, duplex};

    fn config(dir: &TempDir) -> Config {
        let mut config = Config::default();
        config.export.size_bytes = 100;
        config.export.dir = Some(dir.path().to_path_buf());
        config
    }

    #[tokio::test]
    async fn create_registers_export() {
        let dir = TempDir::new().unwrap();
        let registry = ExportRegistry::new();
        assert!(registry.is_empty());

        let backend = registry.create("name1", &config(&dir)).unwrap();
        let found = registry.lookup("name1").unwrap();
        assert!(Arc::ptr_eq(&backend, &found));
        assert_eq!(registry.names(), vec!["name1".to_string()]);
        assert!(registry.lookup("name2").is_none());
    }

    #[tokio::test]
    async fn duplicate_active_name_is_rejected() {
        let dir = TempDir::new().unwrap();
        let registry = ExportRegistry::new();

        let first = registry.create("name1", &config(&dir)).unwrap();
        let result = registry.create("name1", &config(&dir));
        assert!(matches!(result, Err(Error::ExportExists { .. })));

        // The rejected export left no backing file behind
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 1);
        assert!(Arc::ptr_eq(&first, &registry.lookup("name1").unwrap()));
    }

    #[tokio::test]
    async fn exports_are_independent() {
        let dir = TempDir::new().unwrap();
        let registry = ExportRegistry::new();

        let a = registry.create("a", &config(&dir)).unwrap();
        let b = registry.create("b", &config(&dir)).unwrap();
        let mut rx_a = registry.subscribe("a").unwrap();
        let mut rx_b = registry.subscribe("b").unwrap();

        let write_a = tokio::spawn({
            let a = Arc::clone(&a);
            async move { a.write_at(0, Bytes::from_static(b"aa"), false).await }
        });
        let write_b = tokio::spawn({
            let b = Arc::clone(&b);
            async move { b.write_at(0, Bytes::from_static(b"bb"), false).await }
        });

        assert_eq!(
            rx_b.recv().await,
            Some(RelayEvent::Write(WriteNotification::new(
                0,
                Bytes::from_static(b"bb")
            )))
        );
        assert_eq!(
            rx_a.recv().await,
            Some(RelayEvent::Write(WriteNotification::new(
                0,
                Bytes::from_static(b"aa")
            )))
        );
        write_a.await.unwrap().unwrap();
        write_b.await.unwrap().unwrap();

        assert_eq!(&a.read_at(0, 2).await.unwrap()[..], b"aa");
        assert_eq!(&b.read_at(0, 2).await.unwrap()[..], b"bb");
    }

    #[tokio::test]
    async fn close_unregisters_and_frees_name() {
        let dir = TempDir::new().unwrap();
        let mut config = config(&dir);
        config.relay.send_timeout_ms = Some(20);
        let registry = ExportRegistry::new();

        let backend = registry.create("name1", &config).unwrap();
        // No consumer: the end marker times out but the export still goes away
        assert!(backend.close().await.is_err());
        assert!(registry.lookup("name1").is_none());
        assert!(registry.is_empty());

        let reopened = registry.create("name1", &config).unwrap();
        assert!(!Arc::ptr_eq(&backend, &reopened));
        assert_eq!(registry.len(), 1);
    }

    #[tokio::test]
    async fn unregistered_close_leaves_entry_alone() {
        let dir = TempDir::new().unwrap();
        let mut config = config(&dir);
        config.relay.send_timeout_ms = Some(20);
        let registry = ExportRegistry::new();

        let current = registry.create("name1", &config).unwrap();
        let detached = BlockBackend::create("name1", &config).unwrap();

        assert!(detached.close().await.is_err());
        assert!(Arc::ptr_eq(&current, &registry.lookup("name1").unwrap()));
    }

    #[tokio::test]
    async fn backend_outlives_registry() {
        let dir = TempDir::new().unwrap();
        let registry = ExportRegistry::new();
        let backend = registry.create("name1", &config(&dir)).unwrap();
        let rx = registry.subscribe("name1").unwrap();
        drop(registry);

        drop(rx);
        // Closing after the registry is gone must not panic
        assert!(matches!(
            backend.close().await,
            Err(Error::Relay(crate::error::RelayError::Disconnected))
        ));
    }

    #[tokio::test]
    async fn subscribe_unknown_export() {
        let registry = ExportRegistry::new();
        assert!(matches!(
            registry.subscribe("missing"),
            Err(Error::UnknownExport { .. })
        ));

        let mut sink = Vec::new();
        assert!(matches!(
            registry.stream_to("missing", &mut sink).await,
            Err(Error::UnknownExport { .. })
        ));
    }

    #[tokio::test]
    async fn stream_to_forwards_session() {
        let dir = TempDir::new().unwrap();
        let registry = ExportRegistry::new();
        let backend = registry.create("name1", &config(&dir)).unwrap();

        let (mut client, mut server) = duplex(4096);
        let streamer = tokio::spawn({
            let registry = registry.clone();
            async move { registry.stream_to("name1", &mut server).await }
        });

        // Writes wait on the relay until the streamer attaches
        backend
            .write_at(10, Bytes::from_static(&[1, 2, 3]), false)
            .await
            .unwrap();
        backend
            .write_at(50, Bytes::from_static(b"hello"), true)
            .await
            .unwrap();
        backend.close().await.unwrap();

        assert_eq!(streamer.await.unwrap().unwrap(), 2);

        let mut stream = Vec::new();
        client.read_to_end(&mut stream).await.unwrap();
        let mut decoder = StreamDecoder::new();
        decoder.extend(&stream);
        assert_eq!(
            decoder.next_notification().unwrap(),
            Some(WriteNotification::new(10, Bytes::from_static(&[1, 2, 3])))
        );
        assert_eq!(decoder.size_bytes(), Some(100));
        assert_eq!(
            decoder.next_notification().unwrap(),
            Some(WriteNotification::new(50, Bytes::from_static(b"hello")))
        );
        assert!(decoder.next_notification().unwrap().is_none());
        assert!(registry.is_empty());
    }
}
