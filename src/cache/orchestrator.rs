use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};

use anyhow::{Result, ensure};
use bytes::Bytes;
use http::header::{AGE, ETAG, HOST, IF_NONE_MATCH};
use http::{HeaderMap, HeaderName, HeaderValue, Method, Request, Response, StatusCode};
use serde::Deserialize;
use tracing::{debug, trace, warn};

use super::admission::{Exchange, StorePlan, plan_store};
use super::backend::{BackendErrorKind, FlushScope, classify_backend_error};
use super::entry::CacheEntry;
use super::key::{CacheKey, KeyDeriver, KeyOptions};
use super::registry::{BackendRegistry, BackendSlot};
use crate::logging::AccessLogBuilder;
use crate::origin::Origin;
use crate::util::{unix_now, unix_seconds};

pub static CACHE_STATUS: HeaderName = HeaderName::from_static("cache-status");
pub static CACHE_KEY: HeaderName = HeaderName::from_static("x-cache-key");
pub const MIN_MAX_TTL: Duration = Duration::from_secs(2);
const NO_CACHE: &str = "no-cache";

/// What a flush request removes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FlushTarget {
    /// Only the entry the request's key addresses.
    Key,
    All,
    File,
    Memory,
}

impl FlushTarget {
    pub fn as_str(self) -> &'static str {
        match self {
            FlushTarget::Key => "key",
            FlushTarget::All => "all",
            FlushTarget::File => "file",
            FlushTarget::Memory => "memory",
        }
    }

    fn scope(self) -> Option<FlushScope> {
        match self {
            FlushTarget::Key => None,
            FlushTarget::All => Some(FlushScope::All),
            FlushTarget::File => Some(FlushScope::File),
            FlushTarget::Memory => Some(FlushScope::Memory),
        }
    }
}

#[derive(Debug, Clone)]
pub struct CacheOptions {
    /// Upper bound on how long any entry is kept.
    pub max_ttl: Duration,
    /// Adds `Cache-Status` and `Age` to responses.
    pub add_status_header: bool,
    /// A `DELETE` carrying this header flushes the cache.
    pub flush_header: HeaderName,
    pub flush_target: FlushTarget,
    pub flush_status: StatusCode,
    /// Presence of any of these request headers sends the request straight
    /// to the origin.
    pub bypass_headers: Vec<HeaderName>,
    /// Request header whose value `no-cache` also bypasses the cache.
    pub no_cache_header: HeaderName,
    /// Request header that disables conditional (`304`) answers.
    pub skip_validator_header: HeaderName,
    pub key: KeyOptions,
}

impl Default for CacheOptions {
    fn default() -> Self {
        Self {
            max_ttl: Duration::from_secs(300),
            add_status_header: true,
            flush_header: HeaderName::from_static("x-cache-flush"),
            flush_target: FlushTarget::Key,
            flush_status: StatusCode::NO_CONTENT,
            bypass_headers: Vec::new(),
            no_cache_header: HeaderName::from_static("x-cache-control"),
            skip_validator_header: HeaderName::from_static("x-skip-etag"),
            key: KeyOptions::default(),
        }
    }
}

impl CacheOptions {
    pub fn validate(&self) -> Result<()> {
        ensure!(
            self.max_ttl >= MIN_MAX_TTL,
            "cache max ttl must be at least {}s",
            MIN_MAX_TTL.as_secs()
        );
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LookupOutcome {
    Flush,
    Bypass,
    Unavailable,
    Hit,
    NotModified,
    Miss,
    Error,
}

impl LookupOutcome {
    pub fn as_str(self) -> &'static str {
        match self {
            LookupOutcome::Flush => "flush",
            LookupOutcome::Bypass => "bypass",
            LookupOutcome::Unavailable => "unavailable",
            LookupOutcome::Hit => "hit",
            LookupOutcome::NotModified => "not-modified",
            LookupOutcome::Miss => "miss",
            LookupOutcome::Error => "error",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreOutcome {
    Stored,
    Skipped,
    Failed,
    Bypassed,
}

impl StoreOutcome {
    pub fn as_str(self) -> &'static str {
        match self {
            StoreOutcome::Stored => "stored",
            StoreOutcome::Skipped => "skipped",
            StoreOutcome::Failed => "failed",
            StoreOutcome::Bypassed => "bypassed",
        }
    }
}

struct Outcome {
    response: Response<Bytes>,
    lookup: LookupOutcome,
    store: StoreOutcome,
    backend: Option<&'static str>,
    detail: Option<String>,
}

impl Outcome {
    fn passed(response: Response<Bytes>, lookup: LookupOutcome) -> Self {
        Self {
            response,
            lookup,
            store: StoreOutcome::Bypassed,
            backend: None,
            detail: None,
        }
    }
}

/// Answers requests from the active cache backend, falling back to the
/// origin and storing what it returns when the response allows it.
pub struct ResponseCache {
    options: Arc<CacheOptions>,
    keys: KeyDeriver,
    backends: Arc<BackendRegistry>,
    origin: Arc<dyn Origin>,
}

impl ResponseCache {
    pub fn new(
        options: CacheOptions,
        backends: Arc<BackendRegistry>,
        origin: Arc<dyn Origin>,
    ) -> Result<Self> {
        options.validate()?;
        Ok(Self {
            keys: KeyDeriver::new(options.key.clone()),
            options: Arc::new(options),
            backends,
            origin,
        })
    }

    pub fn backends(&self) -> &Arc<BackendRegistry> {
        &self.backends
    }

    pub async fn handle(&self, request: Request<Bytes>) -> Response<Bytes> {
        let started = Instant::now();
        let key = self
            .keys
            .derive(request.method(), request.uri(), request.headers());
        let host = request
            .headers()
            .get(HOST)
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default()
            .to_string();
        let log = AccessLogBuilder::new()
            .method(request.method().as_str())
            .host(host)
            .path(request.uri().path())
            .key(key.as_str());

        let outcome = self.dispatch(&key, request).await;

        crate::metrics::record_cache_lookup(outcome.lookup.as_str());
        let mut log = log
            .status(outcome.response.status())
            .cache_lookup(outcome.lookup.as_str())
            .cache_store(outcome.store.as_str())
            .bytes_out(outcome.response.body().len() as u64)
            .elapsed(started.elapsed());
        if let Some(backend) = outcome.backend {
            log = log.backend(backend);
        }
        if let Some(detail) = outcome.detail {
            log = log.error_detail(detail);
        }
        log.log();
        outcome.response
    }

    async fn dispatch(&self, key: &CacheKey, request: Request<Bytes>) -> Outcome {
        if request.method() == Method::DELETE {
            return self.flush(key, request.headers()).await;
        }
        if self.is_bypass(request.headers()) {
            let response = self.origin.handle(request).await;
            return Outcome::passed(response, LookupOutcome::Bypass);
        }
        let Some(slot) = self.backends.active() else {
            let response = self.origin.handle(request).await;
            return Outcome::passed(response, LookupOutcome::Unavailable);
        };

        let validator = self.request_validator(request.headers());
        let mut lookup = LookupOutcome::Miss;
        let mut detail = None;
        match slot.backend().get(key.as_str()).await {
            Ok(Some(bytes)) => match CacheEntry::decode(&bytes) {
                Ok(entry) if entry.remaining_ttl(unix_now()) == 0 => {
                    debug!(key = %key, "cached entry already expired");
                    if let Err(err) = slot.backend().delete(key.as_str()).await {
                        debug!(key = %key, error = %err, "failed to delete expired cache entry");
                    }
                }
                Ok(entry) => {
                    let (response, lookup) = self.replay(key, entry, validator.as_deref());
                    return Outcome {
                        response,
                        lookup,
                        store: StoreOutcome::Bypassed,
                        backend: Some(slot.kind()),
                        detail: None,
                    };
                }
                Err(err) => {
                    warn!(key = %key, error = %err, "discarding invalid cache entry");
                    lookup = LookupOutcome::Error;
                    detail = Some(err.to_string());
                    if let Err(err) = slot.backend().delete(key.as_str()).await {
                        debug!(key = %key, error = %err, "failed to delete invalid cache entry");
                    }
                }
            },
            Ok(None) => {}
            Err(err) => match classify_backend_error(&err) {
                BackendErrorKind::Unavailable => {
                    warn!(role = slot.role(), error = %err, "cache backend unreachable; passing through");
                    self.backends.mark_unavailable(slot);
                    let response = self.origin.handle(request).await;
                    return Outcome {
                        backend: Some(slot.kind()),
                        detail: Some(err.to_string()),
                        ..Outcome::passed(response, LookupOutcome::Unavailable)
                    };
                }
                BackendErrorKind::Other => {
                    warn!(key = %key, error = %err, "cache lookup failed");
                    detail = Some(err.to_string());
                }
            },
        }

        self.miss(key, request, slot, lookup, detail).await
    }

    fn is_bypass(&self, headers: &HeaderMap) -> bool {
        let no_cache = headers
            .get(&self.options.no_cache_header)
            .and_then(|v| v.to_str().ok())
            .is_some_and(|v| v.trim().eq_ignore_ascii_case(NO_CACHE));
        no_cache
            || self
                .options
                .bypass_headers
                .iter()
                .any(|name| headers.contains_key(name))
    }

    fn request_validator(&self, headers: &HeaderMap) -> Option<String> {
        if headers.contains_key(&self.options.skip_validator_header) {
            return None;
        }
        let values: Vec<&str> = headers
            .get_all(IF_NONE_MATCH)
            .iter()
            .filter_map(|v| v.to_str().ok())
            .collect();
        if values.is_empty() {
            None
        } else {
            Some(values.join(","))
        }
    }

    fn replay(
        &self,
        key: &CacheKey,
        entry: CacheEntry,
        validator: Option<&str>,
    ) -> (Response<Bytes>, LookupOutcome) {
        let etag = entry
            .etag
            .as_deref()
            .and_then(|etag| HeaderValue::from_str(etag).ok());

        if let Some(validator) = validator
            && entry.matches_validator(validator)
        {
            trace!(key = %key, "cache validator matched");
            let mut response = Response::new(Bytes::new());
            *response.status_mut() = StatusCode::NOT_MODIFIED;
            self.insert_key_header(response.headers_mut(), key);
            if let Some(etag) = etag {
                response.headers_mut().insert(ETAG, etag);
            }
            return (response, LookupOutcome::NotModified);
        }

        let now = unix_now();
        let status = entry.status_code();
        let mut headers = entry.header_map();
        self.insert_key_header(&mut headers, key);
        if self.options.add_status_header {
            let hit = format!("hit; ttl={}", entry.remaining_ttl(now));
            if let Ok(value) = HeaderValue::from_str(&hit) {
                headers.insert(CACHE_STATUS.clone(), value);
            }
            headers.insert(AGE, HeaderValue::from(entry.age(now)));
        }
        if let Some(etag) = etag {
            headers.insert(ETAG, etag);
        }

        let mut response = Response::new(Bytes::from(entry.body));
        *response.status_mut() = status;
        *response.headers_mut() = headers;
        (response, LookupOutcome::Hit)
    }

    fn insert_key_header(&self, headers: &mut HeaderMap, key: &CacheKey) {
        if let Ok(value) = HeaderValue::from_str(&key.encoded()) {
            headers.insert(CACHE_KEY.clone(), value);
        }
    }

    async fn miss(
        &self,
        key: &CacheKey,
        request: Request<Bytes>,
        slot: &BackendSlot,
        lookup: LookupOutcome,
        detail: Option<String>,
    ) -> Outcome {
        let method = request.method().clone();
        let request_headers = request.headers().clone();
        let mut response = self.origin.handle(request).await;
        if self.options.add_status_header {
            response
                .headers_mut()
                .insert(CACHE_STATUS.clone(), HeaderValue::from_static(lookup.as_str()));
        }

        let now = SystemTime::now();
        let plan = plan_store(
            &Exchange {
                method: &method,
                request_headers: &request_headers,
                status: response.status(),
                response_headers: response.headers(),
                body_len: response.body().len(),
            },
            self.options.max_ttl,
            now,
        );
        let (store, store_error) = match plan {
            StorePlan::Skip(reason) => {
                debug!(key = %key, reason = reason.as_str(), "response not cached");
                (StoreOutcome::Skipped, None)
            }
            StorePlan::Store { ttl } => {
                match self
                    .store(key, &mut response, slot, ttl, unix_seconds(now))
                    .await
                {
                    Ok(()) => (StoreOutcome::Stored, None),
                    Err(err) => (StoreOutcome::Failed, Some(err)),
                }
            }
        };

        Outcome {
            response,
            lookup,
            store,
            backend: Some(slot.kind()),
            detail: store_error.or(detail),
        }
    }

    async fn store(
        &self,
        key: &CacheKey,
        response: &mut Response<Bytes>,
        slot: &BackendSlot,
        ttl: Duration,
        created: u64,
    ) -> Result<(), String> {
        let entry = CacheEntry::capture(
            response.status(),
            response.headers(),
            response.body(),
            created,
            ttl,
        );
        let encoded = match entry.encode() {
            Ok(encoded) => encoded,
            Err(err) => {
                crate::metrics::record_cache_store_error();
                warn!(key = %key, error = %err, "failed to encode cache entry");
                return Err(err.to_string());
            }
        };

        let validator = entry.etag.as_deref();
        match slot
            .backend()
            .set(key.as_str(), &encoded, ttl, validator)
            .await
        {
            Ok(()) => {
                crate::metrics::record_cache_store();
                trace!(key = %key, ttl_secs = ttl.as_secs(), "response cached");
                if !response.headers().contains_key(ETAG)
                    && let Some(value) = validator.and_then(|v| HeaderValue::from_str(v).ok())
                {
                    response.headers_mut().insert(ETAG, value);
                }
                Ok(())
            }
            Err(err) => {
                crate::metrics::record_cache_store_error();
                if classify_backend_error(&err) == BackendErrorKind::Unavailable {
                    self.backends.mark_unavailable(slot);
                }
                warn!(key = %key, error = %err, "failed to store cache entry");
                Err(err.to_string())
            }
        }
    }

    async fn flush(&self, key: &CacheKey, headers: &HeaderMap) -> Outcome {
        let requested = headers
            .get(&self.options.flush_header)
            .is_some_and(|value| !value.is_empty());
        let mut backend = None;
        let mut detail = None;
        if requested && let Some(slot) = self.backends.active() {
            backend = Some(slot.kind());
            let target = self.options.flush_target;
            let result = match target.scope() {
                None => slot.backend().delete(key.as_str()).await,
                Some(scope) => slot.backend().delete_all(scope).await,
            };
            match result {
                Ok(()) => {
                    crate::metrics::record_cache_flush(target.as_str());
                    debug!(key = %key, target = target.as_str(), "cache flushed");
                }
                Err(err) => {
                    if classify_backend_error(&err) == BackendErrorKind::Unavailable {
                        self.backends.mark_unavailable(slot);
                    }
                    warn!(key = %key, target = target.as_str(), error = %err, "cache flush failed");
                    detail = Some(err.to_string());
                }
            }
        }

        let mut response = Response::new(Bytes::new());
        *response.status_mut() = self.options.flush_status;
        Outcome {
            response,
            lookup: LookupOutcome::Flush,
            store: StoreOutcome::Bypassed,
            backend,
            detail,
        }
    }
}
