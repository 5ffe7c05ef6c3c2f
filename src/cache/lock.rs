use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::{OwnedRwLockReadGuard, OwnedRwLockWriteGuard, RwLock};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockMode {
    Shared,
    Exclusive,
}

#[derive(Debug)]
struct LockRecord {
    refcount: usize,
    lock: Arc<RwLock<()>>,
}

#[derive(Debug, Default)]
struct LockTable {
    records: Mutex<HashMap<String, LockRecord>>,
}

impl LockTable {
    fn retain(&self, key: &str) -> Arc<RwLock<()>> {
        let mut records = self.records.lock();
        let record = records
            .entry(key.to_string())
            .or_insert_with(|| LockRecord {
                refcount: 0,
                lock: Arc::new(RwLock::new(())),
            });
        record.refcount += 1;
        record.lock.clone()
    }

    fn release(&self, key: &str) {
        let mut records = self.records.lock();
        let Some(record) = records.get_mut(key) else {
            return;
        };
        record.refcount = record.refcount.saturating_sub(1);
        if record.refcount == 0 {
            records.remove(key);
        }
    }
}

/// Per-key reader/writer locks that exist only while someone holds or waits
/// on them.
#[derive(Debug, Clone, Default)]
pub struct PathLockManager {
    table: Arc<LockTable>,
}

impl PathLockManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Waits until `key` can be held in `mode`. Interest in the key is
    /// registered before waiting, so a cancelled acquire still releases its
    /// registry slot.
    pub async fn acquire(&self, key: &str, mode: LockMode) -> PathLockGuard {
        let lock = self.table.retain(key);
        let retained = Retained {
            table: self.table.clone(),
            key: key.to_string(),
        };
        let held = match mode {
            LockMode::Shared => HeldLock::Shared(lock.read_owned().await),
            LockMode::Exclusive => HeldLock::Exclusive(lock.write_owned().await),
        };
        PathLockGuard {
            _held: held,
            _retained: retained,
        }
    }

    pub async fn shared(&self, key: &str) -> PathLockGuard {
        self.acquire(key, LockMode::Shared).await
    }

    pub async fn exclusive(&self, key: &str) -> PathLockGuard {
        self.acquire(key, LockMode::Exclusive).await
    }

    /// Number of keys currently held or awaited.
    pub fn active_keys(&self) -> usize {
        self.table.records.lock().len()
    }
}

#[derive(Debug)]
enum HeldLock {
    Shared(#[allow(dead_code)] OwnedRwLockReadGuard<()>),
    Exclusive(#[allow(dead_code)] OwnedRwLockWriteGuard<()>),
}

#[derive(Debug)]
struct Retained {
    table: Arc<LockTable>,
    key: String,
}

impl Drop for Retained {
    fn drop(&mut self) {
        self.table.release(&self.key);
    }
}

/// Held lock on one key. The lock is released before the registry slot.
#[derive(Debug)]
pub struct PathLockGuard {
    _held: HeldLock,
    _retained: Retained,
}
