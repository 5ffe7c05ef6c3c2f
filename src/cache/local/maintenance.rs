use std::io::ErrorKind;
use std::ops::ControlFlow;
use std::path::{Path, PathBuf};
use std::sync::Weak;
use std::time::Duration;

use anyhow::Result;
use tokio::fs as async_fs;
use tracing::{debug, warn};

use super::StoreState;
use super::layout::{SHARD_DEPTH, is_shard_dir_name, lock_key};
use super::record::StoredRecord;
use crate::cache::backend::{BackendError, FlushScope};
use crate::task::PeriodicTask;
use crate::util::unix_now;

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SweepStats {
    pub inspected: usize,
    pub removed: usize,
    pub bytes_reclaimed: u64,
}

/// Paths of every leaf at entry depth below `root`, relative to it. Only
/// descends through shard directories, so temp files and anything outside
/// the shard tree are never returned.
async fn collect_entry_files(root: &Path) -> std::io::Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    let mut pending = vec![(PathBuf::new(), 0usize)];
    while let Some((relative, depth)) = pending.pop() {
        let mut entries = match async_fs::read_dir(root.join(&relative)).await {
            Ok(entries) => entries,
            Err(err) if err.kind() == ErrorKind::NotFound => continue,
            Err(err) => return Err(err),
        };
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name();
            let file_type = entry.file_type().await?;
            if depth < SHARD_DEPTH {
                if file_type.is_dir() && name.to_str().is_some_and(is_shard_dir_name) {
                    pending.push((relative.join(&name), depth + 1));
                }
            } else if !file_type.is_symlink() {
                files.push(relative.join(&name));
            }
        }
    }
    Ok(files)
}

impl StoreState {
    pub(super) async fn sweep_expired(&self) -> Result<SweepStats> {
        let mut stats = SweepStats::default();
        let now = unix_now();
        for relative in collect_entry_files(&self.root).await? {
            let path = self.root.join(&relative);
            let _guard = self.locks.exclusive(&lock_key(&relative)).await;
            stats.inspected += 1;
            let data = match async_fs::read(&path).await {
                Ok(data) => data,
                Err(err) if err.kind() == ErrorKind::NotFound => continue,
                Err(err) => {
                    warn!(error = %err, path = %path.display(), "failed to read cache file during sweep");
                    continue;
                }
            };
            let Ok(record) = StoredRecord::decode(&data) else {
                continue;
            };
            if !record.is_expired(now) {
                continue;
            }
            match async_fs::remove_file(&path).await {
                Ok(()) => {}
                Err(err) if err.kind() == ErrorKind::NotFound => continue,
                Err(err) => {
                    warn!(error = %err, path = %path.display(), "failed to remove expired cache file");
                    continue;
                }
            }
            self.overlay_remove(&path);
            stats.removed += 1;
            stats.bytes_reclaimed += data.len() as u64;
        }
        Ok(stats)
    }

    /// Removes every entry in `scope`. A file that cannot be removed does not
    /// stop the flush; the first such error is returned once the rest of the
    /// scope, overlay included, has been cleared.
    pub(super) async fn delete_all(&self, scope: FlushScope) -> Result<usize, BackendError> {
        let files = if scope.includes_files() {
            self.remove_entry_files().await
        } else {
            Ok(0)
        };
        if scope.includes_memory()
            && let Some(overlay) = &self.overlay
        {
            overlay.lock().clear();
        }
        files
    }

    async fn remove_entry_files(&self) -> Result<usize, BackendError> {
        let mut removed = 0;
        let mut first_error = None;
        for relative in collect_entry_files(&self.root).await? {
            let path = self.root.join(&relative);
            let _guard = self.locks.exclusive(&lock_key(&relative)).await;
            match async_fs::remove_file(&path).await {
                Ok(()) => removed += 1,
                Err(err) if err.kind() == ErrorKind::NotFound => {}
                Err(err) => {
                    warn!(error = %err, path = %path.display(), "failed to remove cache file during flush");
                    first_error.get_or_insert(err);
                }
            }
        }
        match first_error {
            Some(err) => Err(err.into()),
            None => Ok(removed),
        }
    }
}

/// Runs [`StoreState::sweep_expired`] every `interval` until the store is
/// dropped or shut down.
pub(super) fn spawn_sweeper(state: Weak<StoreState>, interval: Duration) -> PeriodicTask {
    PeriodicTask::spawn("cache-sweeper", interval, move || {
        let state = state.clone();
        async move {
            let Some(state) = state.upgrade() else {
                return ControlFlow::Break(());
            };
            match state.sweep_expired().await {
                Ok(stats) => {
                    crate::metrics::record_cache_sweep_run();
                    crate::metrics::record_cache_sweep_removed(
                        stats.removed as u64,
                        stats.bytes_reclaimed,
                    );
                    if stats.removed > 0 {
                        debug!(
                            inspected = stats.inspected,
                            removed = stats.removed,
                            "swept expired cache entries"
                        );
                    }
                }
                Err(err) => warn!(error = %err, "cache sweep failed"),
            }
            ControlFlow::Continue(())
        }
    })
}
