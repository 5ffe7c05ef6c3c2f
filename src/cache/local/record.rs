use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::util::base64_bytes;

/// On-disk form of one local cache entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub(super) struct StoredRecord {
    /// Full key, kept so two keys sharing a file path can be told apart.
    pub key: String,
    #[serde(with = "base64_bytes")]
    pub value: Vec<u8>,
    pub created: u64,
    pub expiry: u64,
    pub last_accessed: u64,
}

impl StoredRecord {
    pub fn new(key: &str, value: &[u8], ttl: Duration, now: u64) -> Self {
        Self {
            key: key.to_string(),
            value: value.to_vec(),
            created: now,
            expiry: now.saturating_add(ttl.as_secs()),
            last_accessed: now,
        }
    }

    pub fn is_expired(&self, now: u64) -> bool {
        self.expiry <= now
    }

    pub fn encode(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(bytes)
    }
}
