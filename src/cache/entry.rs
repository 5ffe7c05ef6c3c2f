use std::time::Duration;

use http::header::{CONTENT_LENGTH, ETAG};
use http::{HeaderMap, HeaderName, HeaderValue, StatusCode};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::util::base64_bytes;

/// Headers that describe one particular delivery and are never replayed.
const UNSTORED_HEADERS: &[&str] = &[
    "age",
    "cache-status",
    "x-cache-key",
    "connection",
    "keep-alive",
    "proxy-connection",
    "transfer-encoding",
    "upgrade",
    "trailer",
    "te",
];

const VALIDATOR_HASH_LEN: usize = 32;

#[derive(Debug, Error)]
pub enum EntryError {
    #[error("failed to decode cache entry: {0}")]
    Decode(#[from] serde_json::Error),
    #[error("cached status {0} is not a success status")]
    StatusOutOfRange(u16),
    #[error("cached body is {actual} bytes but content-length says {declared}")]
    BodyLengthMismatch { declared: u64, actual: usize },
}

/// Captured response as stored in a backend.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheEntry {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    #[serde(with = "base64_bytes")]
    pub body: Vec<u8>,
    pub created: u64,
    pub expiry: u64,
    #[serde(default)]
    pub etag: Option<String>,
}

impl CacheEntry {
    pub fn capture(
        status: StatusCode,
        headers: &HeaderMap,
        body: &[u8],
        created: u64,
        ttl: Duration,
    ) -> Self {
        Self {
            status: status.as_u16(),
            headers: stored_headers(headers),
            body: body.to_vec(),
            created,
            expiry: created.saturating_add(ttl.as_secs()),
            etag: Some(derive_validator(headers, body)),
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    /// Decodes a stored entry and rejects ones that could not have been
    /// written by a successful capture.
    pub fn decode(bytes: &[u8]) -> Result<Self, EntryError> {
        let entry: Self = serde_json::from_slice(bytes)?;
        entry.validate()?;
        Ok(entry)
    }

    pub fn validate(&self) -> Result<(), EntryError> {
        if !(200..=299).contains(&self.status) {
            return Err(EntryError::StatusOutOfRange(self.status));
        }
        if let Some(declared) = self.declared_length()
            && declared != self.body.len() as u64
        {
            return Err(EntryError::BodyLengthMismatch {
                declared,
                actual: self.body.len(),
            });
        }
        Ok(())
    }

    fn declared_length(&self) -> Option<u64> {
        self.headers
            .iter()
            .find(|(name, _)| name.eq_ignore_ascii_case(CONTENT_LENGTH.as_str()))
            .and_then(|(_, value)| value.trim().parse().ok())
    }

    pub fn status_code(&self) -> StatusCode {
        StatusCode::from_u16(self.status).unwrap_or(StatusCode::OK)
    }

    pub fn header_map(&self) -> HeaderMap {
        to_headermap(&self.headers)
    }

    pub fn remaining_ttl(&self, now: u64) -> u64 {
        self.expiry.saturating_sub(now)
    }

    pub fn age(&self, now: u64) -> u64 {
        now.saturating_sub(self.created)
    }

    /// True when any entity tag in an `If-None-Match` value names this entry.
    pub fn matches_validator(&self, if_none_match: &str) -> bool {
        let Some(etag) = self.etag.as_deref() else {
            return false;
        };
        if_none_match.split(',').map(str::trim).any(|candidate| {
            candidate == "*" || weak_compare(candidate, etag)
        })
    }
}

fn weak_compare(a: &str, b: &str) -> bool {
    a.trim_start_matches("W/") == b.trim_start_matches("W/")
}

/// The origin's own `ETag` when it sent one, otherwise a quoted hash of the
/// body.
pub fn derive_validator(headers: &HeaderMap, body: &[u8]) -> String {
    if let Some(etag) = headers.get(ETAG).and_then(|v| v.to_str().ok())
        && !etag.trim().is_empty()
    {
        return etag.trim().to_string();
    }
    let hash = blake3::hash(body).to_hex();
    format!("\"{}\"", &hash[..VALIDATOR_HASH_LEN])
}

fn stored_headers(headers: &HeaderMap) -> Vec<(String, String)> {
    headers
        .iter()
        .filter(|(name, _)| !UNSTORED_HEADERS.contains(&name.as_str()))
        .filter_map(|(name, value)| {
            value
                .to_str()
                .ok()
                .map(|value| (name.as_str().to_string(), value.to_string()))
        })
        .collect()
}

fn to_headermap(items: &[(String, String)]) -> HeaderMap {
    let mut map = HeaderMap::new();
    for (name, value) in items {
        if let (Ok(name), Ok(value)) = (
            HeaderName::try_from(name.as_str()),
            HeaderValue::from_str(value),
        ) {
            map.append(name, value);
        }
    }
    map
}
