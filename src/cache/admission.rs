use std::time::{Duration, SystemTime};

use http::header::CONTENT_LENGTH;
use http::{HeaderMap, Method, StatusCode};

use super::cache_control::{NotCacheableReason, evaluate};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreSkipReason {
    EmptyBody,
    Status,
    BodyLengthMismatch,
    NotCacheable(NotCacheableReason),
    NoFreshness,
    Expired,
}

impl StoreSkipReason {
    pub fn as_str(self) -> &'static str {
        match self {
            StoreSkipReason::EmptyBody => "empty-body",
            StoreSkipReason::Status => "status",
            StoreSkipReason::BodyLengthMismatch => "body-length-mismatch",
            StoreSkipReason::NotCacheable(reason) => reason.as_str(),
            StoreSkipReason::NoFreshness => "no-freshness",
            StoreSkipReason::Expired => "expired",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorePlan {
    Skip(StoreSkipReason),
    Store { ttl: Duration },
}

/// Everything needed to decide whether an origin response is stored.
#[derive(Debug)]
pub struct Exchange<'a> {
    pub method: &'a Method,
    pub request_headers: &'a HeaderMap,
    pub status: StatusCode,
    pub response_headers: &'a HeaderMap,
    pub body_len: usize,
}

/// Decides whether to store a response and for how long. The lifetime is the
/// response's own freshness capped at `max_ttl`, in whole seconds.
pub fn plan_store(exchange: &Exchange<'_>, max_ttl: Duration, now: SystemTime) -> StorePlan {
    if exchange.body_len == 0 {
        return StorePlan::Skip(StoreSkipReason::EmptyBody);
    }
    if !exchange.status.is_success() {
        return StorePlan::Skip(StoreSkipReason::Status);
    }
    if let Some(declared) = declared_length(exchange.response_headers)
        && declared != exchange.body_len as u64
    {
        return StorePlan::Skip(StoreSkipReason::BodyLengthMismatch);
    }

    let cacheability = evaluate(
        exchange.method,
        exchange.request_headers,
        exchange.status,
        exchange.response_headers,
        now,
    );
    if let Some(reason) = cacheability.reasons.first() {
        return StorePlan::Skip(StoreSkipReason::NotCacheable(*reason));
    }
    let Some(expires_at) = cacheability.expires_at else {
        return StorePlan::Skip(StoreSkipReason::NoFreshness);
    };

    let remaining = expires_at.duration_since(now).unwrap_or(Duration::ZERO);
    let ttl = Duration::from_secs(remaining.min(max_ttl).as_secs());
    if ttl.is_zero() {
        return StorePlan::Skip(StoreSkipReason::Expired);
    }
    StorePlan::Store { ttl }
}

fn declared_length(headers: &HeaderMap) -> Option<u64> {
    headers
        .get(CONTENT_LENGTH)?
        .to_str()
        .ok()?
        .trim()
        .parse()
        .ok()
}
