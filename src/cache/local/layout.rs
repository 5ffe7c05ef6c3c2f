use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tokio::fs as async_fs;
use tracing::warn;

const LAYOUT_VERSION: u32 = 1;
const VERSION_PREFIX: &str = "v";
const TOMBSTONE_PREFIX: &str = "tombstone-";
pub(super) const TEMP_PREFIX: &str = "tmp_";

/// Number of directory levels between the version root and an entry file.
pub(super) const SHARD_DEPTH: usize = 4;
const MAX_LEAF_LEN: usize = 200;
const LEAF_HASH_LEN: usize = 16;

fn shard_hash(key: &str) -> blake3::Hash {
    blake3::hash(key.as_bytes())
}

/// Location of `key` below the version root: four single-byte hex
/// directories followed by the sanitized key.
pub(super) fn relative_entry_path(key: &str) -> PathBuf {
    let hash = shard_hash(key);
    let mut path = PathBuf::new();
    for byte in &hash.as_bytes()[..SHARD_DEPTH] {
        path.push(format!("{byte:02x}"));
    }
    path.push(leaf_name(key, &hash));
    path
}

fn leaf_name(key: &str, hash: &blake3::Hash) -> String {
    let mut leaf: String = key
        .chars()
        .map(|c| match c {
            '/' | '\\' => '-',
            ':' | '\0' => '_',
            other => other,
        })
        .collect();
    if leaf.is_empty() || leaf == "." || leaf == ".." {
        leaf.insert(0, '_');
    }
    if leaf.len() > MAX_LEAF_LEN {
        let mut cut = MAX_LEAF_LEN - LEAF_HASH_LEN - 1;
        while !leaf.is_char_boundary(cut) {
            cut -= 1;
        }
        leaf.truncate(cut);
        leaf.push('~');
        leaf.push_str(&hash.to_hex()[..LEAF_HASH_LEN]);
    }
    leaf
}

/// Lock-table key for an entry file. Both foreground operations and
/// maintenance walks derive it from the path relative to the version root.
pub(super) fn lock_key(relative: &Path) -> String {
    relative.to_string_lossy().into_owned()
}

pub(super) fn is_shard_dir_name(name: &str) -> bool {
    name.len() == 2 && name.bytes().all(|b| b.is_ascii_hexdigit())
}

pub(super) fn version_dir(root: &Path) -> PathBuf {
    root.join(format!("{VERSION_PREFIX}{LAYOUT_VERSION}"))
}

fn parse_version(name: &str) -> Option<u32> {
    let version = name.strip_prefix(VERSION_PREFIX)?;
    if version.is_empty() || !version.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    version.parse().ok()
}

fn tombstone_name(version_name: &str) -> String {
    format!("{TOMBSTONE_PREFIX}{version_name}-{}", uuid::Uuid::new_v4())
}

/// Creates the active version directory under `root` and renames directories
/// of other layout versions out of the way. Returns the active directory and
/// the tombstoned directories that still need removing.
pub(super) async fn prepare_version_dir(root: &Path) -> Result<(PathBuf, Vec<PathBuf>)> {
    let active = version_dir(root);
    async_fs::create_dir_all(&active)
        .await
        .with_context(|| format!("failed to create cache dir {}", active.display()))?;
    let active_name = format!("{VERSION_PREFIX}{LAYOUT_VERSION}");

    let mut stale = Vec::new();
    let mut entries = async_fs::read_dir(root)
        .await
        .with_context(|| format!("failed to read cache root {}", root.display()))?;
    while let Some(entry) = entries.next_entry().await? {
        if !entry.file_type().await?.is_dir() {
            continue;
        }
        let name = entry.file_name();
        let name = name.to_string_lossy();
        if name == active_name {
            continue;
        }
        if name.starts_with(TOMBSTONE_PREFIX) {
            stale.push(entry.path());
            continue;
        }
        if parse_version(&name).is_some() {
            let tombstone = root.join(tombstone_name(&name));
            if let Err(err) = async_fs::rename(entry.path(), &tombstone).await {
                warn!(
                    error = %err,
                    path = %entry.path().display(),
                    "failed to tombstone old cache dir"
                );
                continue;
            }
            stale.push(tombstone);
        }
    }
    Ok((active, stale))
}

pub(super) fn spawn_stale_dir_cleanup(dirs: Vec<PathBuf>) {
    for dir in dirs {
        tokio::spawn(async move {
            match async_fs::remove_dir_all(&dir).await {
                Ok(()) => crate::metrics::record_cache_cleanup_dir(),
                Err(err) if err.kind() == ErrorKind::NotFound => {}
                Err(err) => warn!(
                    error = %err,
                    path = %dir.display(),
                    "failed to remove old cache dir"
                ),
            }
        });
    }
}

/// Removes temp files left behind by writes that never reached their rename.
pub(super) async fn remove_temp_files(dir: &Path) -> Result<usize> {
    let mut removed = 0;
    let mut entries = match async_fs::read_dir(dir).await {
        Ok(entries) => entries,
        Err(err) if err.kind() == ErrorKind::NotFound => return Ok(0),
        Err(err) => return Err(err.into()),
    };
    while let Some(entry) = entries.next_entry().await? {
        let is_temp = entry
            .file_name()
            .to_str()
            .is_some_and(|name| name.starts_with(TEMP_PREFIX));
        if is_temp && entry.file_type().await?.is_file() {
            async_fs::remove_file(entry.path()).await.ok();
            removed += 1;
        }
    }
    Ok(removed)
}
