use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use http::StatusCode;
use thiserror::Error;

use super::local::LocalStore;
use super::remote::RemoteStore;

#[derive(Debug, Error)]
pub enum BackendError {
    #[error("cache backend unavailable: {0}")]
    Unavailable(String),
    #[error("failed to write cache entry {path}: {source}")]
    WriteFailed {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("cache i/o error: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to encode cache record: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("cache service responded with {0}")]
    UnexpectedStatus(StatusCode),
    #[error("cache service request failed: {0}")]
    Request(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendErrorKind {
    /// The backend cannot be reached; requests should stop using it until a
    /// health check says otherwise.
    Unavailable,
    Other,
}

pub fn classify_backend_error(err: &BackendError) -> BackendErrorKind {
    match err {
        BackendError::Unavailable(_) => BackendErrorKind::Unavailable,
        _ => BackendErrorKind::Other,
    }
}

/// What a bulk flush removes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushScope {
    All,
    File,
    Memory,
}

impl FlushScope {
    pub fn as_str(self) -> &'static str {
        match self {
            FlushScope::All => "all",
            FlushScope::File => "file",
            FlushScope::Memory => "memory",
        }
    }

    pub fn includes_files(self) -> bool {
        matches!(self, FlushScope::All | FlushScope::File)
    }

    pub fn includes_memory(self) -> bool {
        matches!(self, FlushScope::All | FlushScope::Memory)
    }
}

impl fmt::Display for FlushScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Capabilities every cache backend offers to the request path.
#[async_trait]
pub trait CacheBackend: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, BackendError>;

    /// Stores `value` under `key` for `ttl`. `validator` is the entity tag the
    /// caller will hand out for this entry; backends may record it.
    async fn set(
        &self,
        key: &str,
        value: &[u8],
        ttl: Duration,
        validator: Option<&str>,
    ) -> Result<(), BackendError>;

    async fn delete(&self, key: &str) -> Result<(), BackendError>;

    async fn delete_all(&self, scope: FlushScope) -> Result<(), BackendError>;

    /// Reports health, probing the backend when `force_refresh` is set and
    /// otherwise returning the last known state.
    async fn check_health(&self, force_refresh: bool) -> bool;
}

#[derive(Debug, Clone)]
pub enum Backend {
    Local(LocalStore),
    Remote(RemoteStore),
}

impl Backend {
    pub fn kind(&self) -> &'static str {
        match self {
            Backend::Local(_) => "local",
            Backend::Remote(_) => "remote",
        }
    }

    fn as_dyn(&self) -> &dyn CacheBackend {
        match self {
            Backend::Local(store) => store,
            Backend::Remote(store) => store,
        }
    }
}

#[async_trait]
impl CacheBackend for Backend {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, BackendError> {
        self.as_dyn().get(key).await
    }

    async fn set(
        &self,
        key: &str,
        value: &[u8],
        ttl: Duration,
        validator: Option<&str>,
    ) -> Result<(), BackendError> {
        self.as_dyn().set(key, value, ttl, validator).await
    }

    async fn delete(&self, key: &str) -> Result<(), BackendError> {
        self.as_dyn().delete(key).await
    }

    async fn delete_all(&self, scope: FlushScope) -> Result<(), BackendError> {
        self.as_dyn().delete_all(scope).await
    }

    async fn check_health(&self, force_refresh: bool) -> bool {
        self.as_dyn().check_health(force_refresh).await
    }
}
