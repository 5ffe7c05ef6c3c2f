use std::io::ErrorKind;
use std::num::NonZeroUsize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Result, ensure};
use async_trait::async_trait;
use lru::LruCache;
use parking_lot::Mutex;
use tokio::fs as async_fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, trace, warn};

mod layout;
mod maintenance;
mod record;

pub use maintenance::SweepStats;

use super::backend::{BackendError, CacheBackend, FlushScope};
use super::lock::PathLockManager;
use crate::task::PeriodicTask;
use crate::util::unix_now;
use layout::{TEMP_PREFIX, lock_key, relative_entry_path};
use record::StoredRecord;

pub const MIN_SWEEP_INTERVAL: Duration = Duration::from_secs(2);

#[derive(Debug, Clone)]
pub struct LocalStoreOptions {
    pub dir: PathBuf,
    /// Capacity of the in-memory overlay; `None` keeps everything on disk.
    pub memory_entries: Option<NonZeroUsize>,
    pub sweep_interval: Duration,
}

/// Sharded on-disk cache store with an optional in-memory overlay.
#[derive(Debug, Clone)]
pub struct LocalStore {
    state: Arc<StoreState>,
}

#[derive(Debug)]
struct StoreState {
    root: PathBuf,
    locks: PathLockManager,
    overlay: Option<Mutex<LruCache<PathBuf, StoredRecord>>>,
    sweeper: Mutex<Option<PeriodicTask>>,
}

impl LocalStore {
    pub async fn open(options: LocalStoreOptions) -> Result<Self> {
        ensure!(
            options.sweep_interval >= MIN_SWEEP_INTERVAL,
            "cache sweep interval must be at least {}s",
            MIN_SWEEP_INTERVAL.as_secs()
        );
        let (root, stale) = layout::prepare_version_dir(&options.dir).await?;
        layout::spawn_stale_dir_cleanup(stale);
        let removed = layout::remove_temp_files(&root).await?;
        if removed > 0 {
            debug!(removed, "removed leftover cache temp files");
        }

        let state = Arc::new(StoreState {
            root,
            locks: PathLockManager::new(),
            overlay: options
                .memory_entries
                .map(|capacity| Mutex::new(LruCache::new(capacity))),
            sweeper: Mutex::new(None),
        });
        let sweeper = maintenance::spawn_sweeper(Arc::downgrade(&state), options.sweep_interval);
        *state.sweeper.lock() = Some(sweeper);
        Ok(Self { state })
    }

    /// Active version directory holding the shard tree.
    pub fn dir(&self) -> &Path {
        &self.state.root
    }

    pub async fn sweep_expired(&self) -> Result<SweepStats> {
        self.state.sweep_expired().await
    }

    /// Stops the background sweeper, waiting for a running pass to finish.
    pub async fn shutdown(&self) {
        let sweeper = self.state.sweeper.lock().take();
        if let Some(sweeper) = sweeper {
            sweeper.shutdown().await;
        }
    }

    #[cfg(test)]
    fn entry_path(&self, key: &str) -> PathBuf {
        self.state.root.join(relative_entry_path(key))
    }

    #[cfg(test)]
    fn locks(&self) -> &PathLockManager {
        &self.state.locks
    }
}

#[async_trait]
impl CacheBackend for LocalStore {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, BackendError> {
        self.state.get(key).await
    }

    async fn set(
        &self,
        key: &str,
        value: &[u8],
        ttl: Duration,
        _validator: Option<&str>,
    ) -> Result<(), BackendError> {
        self.state.set(key, value, ttl).await
    }

    async fn delete(&self, key: &str) -> Result<(), BackendError> {
        self.state.delete(key).await
    }

    async fn delete_all(&self, scope: FlushScope) -> Result<(), BackendError> {
        let removed = self.state.delete_all(scope).await?;
        debug!(scope = %scope, removed, "local cache flushed");
        Ok(())
    }

    async fn check_health(&self, _force_refresh: bool) -> bool {
        async_fs::metadata(&self.state.root)
            .await
            .map(|meta| meta.is_dir())
            .unwrap_or(false)
    }
}

impl StoreState {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, BackendError> {
        let relative = relative_entry_path(key);
        let path = self.root.join(&relative);
        let _guard = self.locks.shared(&lock_key(&relative)).await;
        let now = unix_now();

        if let Some(record) = self.overlay_get(&path) {
            if record.key != key {
                return Ok(None);
            }
            if !record.is_expired(now) {
                return Ok(Some(record.value));
            }
            trace!(key, "cache entry expired in memory");
            self.overlay_remove(&path);
            discard_entry_file(&path).await;
            return Ok(None);
        }

        let bytes = match async_fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(err.into()),
        };
        let record = match StoredRecord::decode(&bytes) {
            Ok(record) => record,
            Err(err) => {
                warn!(error = %err, path = %path.display(), "discarding unreadable cache record");
                discard_entry_file(&path).await;
                return Ok(None);
            }
        };
        if record.key != key {
            debug!(key, stored_key = %record.key, "cache path shared by another key");
            return Ok(None);
        }
        if record.is_expired(now) {
            trace!(key, "cache entry expired");
            discard_entry_file(&path).await;
            return Ok(None);
        }

        if let Some(overlay) = &self.overlay {
            overlay.lock().put(path, record.clone());
        }
        Ok(Some(record.value))
    }

    async fn set(&self, key: &str, value: &[u8], ttl: Duration) -> Result<(), BackendError> {
        let relative = relative_entry_path(key);
        let path = self.root.join(&relative);
        let record = StoredRecord::new(key, value, ttl, unix_now());
        let data = record.encode()?;

        let _guard = self.locks.exclusive(&lock_key(&relative)).await;
        if let Some(parent) = path.parent() {
            async_fs::create_dir_all(parent)
                .await
                .map_err(|source| write_failed(&path, source))?;
        }
        self.write_atomically(&path, &data).await?;
        if let Some(overlay) = &self.overlay {
            overlay.lock().put(path, record);
        }
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), BackendError> {
        let relative = relative_entry_path(key);
        let path = self.root.join(&relative);
        let _guard = self.locks.exclusive(&lock_key(&relative)).await;
        self.overlay_remove(&path);
        match async_fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err.into()),
        }
    }

    async fn write_atomically(&self, path: &Path, data: &[u8]) -> Result<(), BackendError> {
        let temp = self
            .root
            .join(format!("{TEMP_PREFIX}{}", uuid::Uuid::new_v4()));
        if let Err(source) = write_file(&temp, data).await {
            async_fs::remove_file(&temp).await.ok();
            return Err(write_failed(path, source));
        }
        if let Err(source) = async_fs::rename(&temp, path).await {
            async_fs::remove_file(&temp).await.ok();
            return Err(write_failed(path, source));
        }
        Ok(())
    }

    fn overlay_get(&self, path: &Path) -> Option<StoredRecord> {
        self.overlay.as_ref()?.lock().get(path).cloned()
    }

    fn overlay_remove(&self, path: &Path) {
        if let Some(overlay) = &self.overlay {
            overlay.lock().pop(path);
        }
    }
}

async fn write_file(path: &Path, data: &[u8]) -> std::io::Result<()> {
    let mut options = async_fs::OpenOptions::new();
    options.create(true).truncate(true).write(true);
    #[cfg(unix)]
    {
        options.mode(0o600);
    }
    let mut file = options.open(path).await?;
    file.write_all(data).await?;
    file.flush().await?;
    Ok(())
}

async fn discard_entry_file(path: &Path) {
    match async_fs::remove_file(path).await {
        Ok(()) => {}
        Err(err) if err.kind() == ErrorKind::NotFound => {}
        Err(err) => warn!(error = %err, path = %path.display(), "failed to remove cache file"),
    }
}

fn write_failed(path: &Path, source: std::io::Error) -> BackendError {
    BackendError::WriteFailed {
        path: path.display().to_string(),
        source,
    }
}
