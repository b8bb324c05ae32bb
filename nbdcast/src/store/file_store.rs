//! FileStore: a backing store on a sparse local file.

use std::fs::{File, OpenOptions};
use std::io;
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use tempfile::TempPath;
use tracing::{debug, info};

use super::BackingStore;
use crate::error::StoreError;

const FILE_PREFIX: &str = "nbdcast-";

pub struct FileStore {
    /// `None` once the store has been removed.
    file: Mutex<Option<Arc<File>>>,
    /// Set for stores created by `temp_in`; deleting it removes the file.
    temp_path: Mutex<Option<TempPath>>,
    path: PathBuf,
    size_bytes: u64,
}

impl FileStore {
    /// Create a uniquely named file in `dir` and extend it to `size_bytes`.
    ///
    /// The file is sparse, so allocation is cheap regardless of size. It is
    /// deleted by [`BackingStore::remove`] or when the store is dropped.
    pub fn temp_in(dir: impl AsRef<Path>, size_bytes: u64) -> Result<Self, StoreError> {
        let (file, temp_path) = tempfile::Builder::new()
            .prefix(FILE_PREFIX)
            .tempfile_in(dir)
            .map_err(StoreError::Allocate)?
            .into_parts();
        file.set_len(size_bytes).map_err(StoreError::Allocate)?;

        let path = temp_path.to_path_buf();
        info!(path = %path.display(), size_bytes, "backing store allocated");

        Ok(Self {
            file: Mutex::new(Some(Arc::new(file))),
            temp_path: Mutex::new(Some(temp_path)),
            path,
            size_bytes,
        })
    }

    /// Open an existing file. Its current length becomes the store size.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let path = path.into();
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(&path)
            .map_err(StoreError::Allocate)?;
        let size_bytes = file.metadata().map_err(StoreError::Allocate)?.len();

        Ok(Self {
            file: Mutex::new(Some(Arc::new(file))),
            temp_path: Mutex::new(None),
            path,
            size_bytes,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn handle(&self) -> Result<Arc<File>, StoreError> {
        self.file.lock().clone().ok_or(StoreError::Released)
    }

    /// Run a positioned operation on the blocking pool.
    async fn with_file<T, F>(&self, op: F) -> Result<T, StoreError>
    where
        F: FnOnce(&File) -> Result<T, StoreError> + Send + 'static,
        T: Send + 'static,
    {
        let file = self.handle()?;
        tokio::task::spawn_blocking(move || op(&file))
            .await
            .map_err(|e| StoreError::Io(io::Error::other(e)))?
    }
}

#[async_trait]
impl BackingStore for FileStore {
    fn size_bytes(&self) -> u64 {
        self.size_bytes
    }

    async fn read_at(&self, offset: u64, length: usize) -> Result<Bytes, StoreError> {
        StoreError::check_range(offset, length as u64, self.size_bytes)?;
        self.with_file(move |file| {
            let mut buf = vec![0u8; length];
            file.read_exact_at(&mut buf, offset)?;
            Ok(Bytes::from(buf))
        })
        .await
    }

    async fn write_at(&self, offset: u64, data: Bytes) -> Result<usize, StoreError> {
        StoreError::check_range(offset, data.len() as u64, self.size_bytes)?;
        self.with_file(move |file| {
            file.write_all_at(&data, offset)?;
            Ok(data.len())
        })
        .await
    }

    async fn sync(&self) -> Result<(), StoreError> {
        self.with_file(|file| file.sync_all().map_err(StoreError::Sync))
            .await?;
        debug!(path = %self.path.display(), "backing store synced");
        Ok(())
    }

    fn remove(&self) -> Result<(), StoreError> {
        // Dropping our handle; in-flight blocking ops keep their own clone.
        if self.file.lock().take().is_none() {
            return Err(StoreError::Released);
        }

        match self.temp_path.lock().take() {
            Some(temp_path) => temp_path.close()?,
            None => std::fs::remove_file(&self.path)?,
        }
        info!(path = %self.path.display(), "backing store removed");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn temp_store_is_preallocated() {
        let dir = TempDir::new().unwrap();
        let store = FileStore::temp_in(dir.path(), 4096).unwrap();

        assert_eq!(store.size_bytes(), 4096);
        assert!(store.path().starts_with(dir.path()));
        assert_eq!(std::fs::metadata(store.path()).unwrap().len(), 4096);

        // Unwritten ranges read as zeros
        let data = store.read_at(1000, 16).await.unwrap();
        assert_eq!(&data[..], &[0u8; 16]);
    }

    #[tokio::test]
    async fn write_is_visible_to_read() {
        let dir = TempDir::new().unwrap();
        let store = FileStore::temp_in(dir.path(), 100).unwrap();

        let n = store
            .write_at(10, Bytes::from_static(&[1, 2, 3]))
            .await
            .unwrap();
        assert_eq!(n, 3);

        let data = store.read_at(9, 5).await.unwrap();
        assert_eq!(&data[..], &[0, 1, 2, 3, 0]);
    }

    #[tokio::test]
    async fn out_of_bounds_access_is_rejected() {
        let dir = TempDir::new().unwrap();
        let store = FileStore::temp_in(dir.path(), 100).unwrap();

        let result = store.write_at(98, Bytes::from_static(&[1, 2, 3])).await;
        assert!(matches!(result, Err(StoreError::OutOfBounds { .. })));

        let result = store.read_at(100, 1).await;
        assert!(matches!(result, Err(StoreError::OutOfBounds { .. })));

        // Nothing was written past the end
        assert_eq!(std::fs::metadata(store.path()).unwrap().len(), 100);
    }

    #[tokio::test]
    async fn synced_data_survives_reopen() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("disk");
        std::fs::File::create(&path).unwrap().set_len(64).unwrap();

        {
            let store = FileStore::open(&path).unwrap();
            store
                .write_at(8, Bytes::from_static(b"durable"))
                .await
                .unwrap();
            store.sync().await.unwrap();
        }

        let reopened = FileStore::open(&path).unwrap();
        assert_eq!(reopened.size_bytes(), 64);
        let data = reopened.read_at(8, 7).await.unwrap();
        assert_eq!(&data[..], b"durable");
    }

    #[tokio::test]
    async fn remove_deletes_file_and_releases_handle() {
        let dir = TempDir::new().unwrap();
        let store = FileStore::temp_in(dir.path(), 100).unwrap();
        let path = store.path().to_path_buf();

        store.remove().unwrap();
        assert!(!path.exists());

        assert!(matches!(
            store.read_at(0, 1).await,
            Err(StoreError::Released)
        ));
        assert!(matches!(store.sync().await, Err(StoreError::Released)));
        assert!(matches!(store.remove(), Err(StoreError::Released)));
    }

    #[tokio::test]
    async fn remove_deletes_opened_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("disk");
        std::fs::File::create(&path).unwrap().set_len(16).unwrap();

        let store = FileStore::open(&path).unwrap();
        store.remove().unwrap();
        assert!(!path.exists());
    }

    #[test]
    fn temp_store_dropped_without_remove_is_deleted() {
        let dir = TempDir::new().unwrap();
        let store = FileStore::temp_in(dir.path(), 16).unwrap();
        let path = store.path().to_path_buf();
        drop(store);
        assert!(!path.exists());
    }

    #[test]
    fn allocation_failure() {
        let result = FileStore::temp_in("/nonexistent/nbdcast", 16);
        assert!(matches!(result, Err(StoreError::Allocate(_))));

        let result = FileStore::open("/nonexistent/nbdcast/disk");
        assert!(matches!(result, Err(StoreError::Allocate(_))));
    }
}
