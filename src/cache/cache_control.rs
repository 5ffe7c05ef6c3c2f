use std::time::{Duration, SystemTime};

use http::header::{AUTHORIZATION, CACHE_CONTROL, DATE, EXPIRES, LAST_MODIFIED, PRAGMA, VARY};
use http::{HeaderMap, Method, StatusCode};

/// Fraction of the Last-Modified age used as heuristic freshness.
const HEURISTIC_DIVISOR: u32 = 10;

#[derive(Debug, Clone, Default)]
pub struct CacheControl {
    pub public: bool,
    pub private: bool,
    pub no_cache: bool,
    pub no_store: bool,
    pub max_age: Option<Duration>,
    pub s_maxage: Option<Duration>,
    pub must_revalidate: bool,
}

pub fn parse_cache_control(headers: &HeaderMap) -> CacheControl {
    let mut cc = CacheControl::default();

    for value in headers.get_all(CACHE_CONTROL) {
        if let Ok(s) = value.to_str() {
            for part in s.split(',') {
                let part = part.trim();
                let (name, argument) = match part.split_once('=') {
                    Some((name, argument)) => (name.trim(), Some(argument.trim().trim_matches('"'))),
                    None => (part, None),
                };
                if name.eq_ignore_ascii_case("public") {
                    cc.public = true;
                } else if name.eq_ignore_ascii_case("private") {
                    cc.private = true;
                } else if name.eq_ignore_ascii_case("no-cache") {
                    cc.no_cache = true;
                } else if name.eq_ignore_ascii_case("no-store") {
                    cc.no_store = true;
                } else if name.eq_ignore_ascii_case("must-revalidate")
                    || name.eq_ignore_ascii_case("proxy-revalidate")
                {
                    cc.must_revalidate = true;
                } else if name.eq_ignore_ascii_case("max-age") {
                    if let Some(secs) = argument.and_then(|a| a.parse::<u64>().ok()) {
                        cc.max_age = Some(Duration::from_secs(secs));
                    }
                } else if name.eq_ignore_ascii_case("s-maxage")
                    && let Some(secs) = argument.and_then(|a| a.parse::<u64>().ok())
                {
                    cc.s_maxage = Some(Duration::from_secs(secs));
                }
            }
        }
    }
    cc
}

/// Why a response may not be stored by a shared cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NotCacheableReason {
    RequestMethod,
    RequestNoStore,
    RequestAuthorization,
    ResponseNoStore,
    ResponseNoCache,
    ResponsePrivate,
    ResponseVaryAll,
    ResponseStatus,
}

impl NotCacheableReason {
    pub fn as_str(self) -> &'static str {
        match self {
            NotCacheableReason::RequestMethod => "request-method",
            NotCacheableReason::RequestNoStore => "request-no-store",
            NotCacheableReason::RequestAuthorization => "request-authorization",
            NotCacheableReason::ResponseNoStore => "response-no-store",
            NotCacheableReason::ResponseNoCache => "response-no-cache",
            NotCacheableReason::ResponsePrivate => "response-private",
            NotCacheableReason::ResponseVaryAll => "response-vary-all",
            NotCacheableReason::ResponseStatus => "response-status",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Cacheability {
    pub reasons: Vec<NotCacheableReason>,
    /// Absolute freshness deadline, when the response carries one.
    pub expires_at: Option<SystemTime>,
}

/// Shared-cache storability and freshness for one exchange.
pub fn evaluate(
    method: &Method,
    request_headers: &HeaderMap,
    status: StatusCode,
    response_headers: &HeaderMap,
    now: SystemTime,
) -> Cacheability {
    let request_cc = parse_cache_control(request_headers);
    let response_cc = parse_cache_control(response_headers);
    let mut reasons = Vec::new();

    if method != Method::GET && method != Method::HEAD {
        reasons.push(NotCacheableReason::RequestMethod);
    }
    if request_cc.no_store {
        reasons.push(NotCacheableReason::RequestNoStore);
    }
    if request_headers.contains_key(AUTHORIZATION)
        && !(response_cc.public || response_cc.must_revalidate || response_cc.s_maxage.is_some())
    {
        reasons.push(NotCacheableReason::RequestAuthorization);
    }
    if response_cc.no_store {
        reasons.push(NotCacheableReason::ResponseNoStore);
    }
    if response_cc.no_cache || pragma_no_cache(response_headers) {
        reasons.push(NotCacheableReason::ResponseNoCache);
    }
    if response_cc.private {
        reasons.push(NotCacheableReason::ResponsePrivate);
    }
    if vary_all(response_headers) {
        reasons.push(NotCacheableReason::ResponseVaryAll);
    }

    let explicit = explicit_lifetime(&response_cc, response_headers, now);
    if explicit.is_none() && !cacheable_by_default(status) {
        reasons.push(NotCacheableReason::ResponseStatus);
    }

    let lifetime = explicit.or_else(|| heuristic_lifetime(response_headers, now));
    Cacheability {
        reasons,
        expires_at: lifetime.map(|lifetime| now + lifetime),
    }
}

/// Status codes a shared cache may store without explicit freshness.
fn cacheable_by_default(status: StatusCode) -> bool {
    matches!(
        status.as_u16(),
        200 | 203 | 204 | 206 | 300 | 301 | 308 | 404 | 405 | 410 | 414 | 501
    )
}

fn explicit_lifetime(cc: &CacheControl, headers: &HeaderMap, now: SystemTime) -> Option<Duration> {
    if let Some(s_maxage) = cc.s_maxage {
        return Some(s_maxage);
    }
    if let Some(max_age) = cc.max_age {
        return Some(max_age);
    }
    let expires = headers.get(EXPIRES)?.to_str().ok()?;
    // An unparseable Expires means "already expired".
    let Ok(expires) = httpdate::parse_http_date(expires) else {
        return Some(Duration::ZERO);
    };
    let origin_now = header_date(headers, DATE).unwrap_or(now);
    Some(expires.duration_since(origin_now).unwrap_or(Duration::ZERO))
}

fn heuristic_lifetime(headers: &HeaderMap, now: SystemTime) -> Option<Duration> {
    let last_modified = header_date(headers, LAST_MODIFIED)?;
    let origin_now = header_date(headers, DATE).unwrap_or(now);
    let age = origin_now.duration_since(last_modified).ok()?;
    Some(age / HEURISTIC_DIVISOR)
}

fn header_date(headers: &HeaderMap, name: http::HeaderName) -> Option<SystemTime> {
    let value = headers.get(name)?.to_str().ok()?;
    httpdate::parse_http_date(value).ok()
}

fn pragma_no_cache(headers: &HeaderMap) -> bool {
    !headers.contains_key(CACHE_CONTROL)
        && headers
            .get_all(PRAGMA)
            .iter()
            .filter_map(|v| v.to_str().ok())
            .any(|v| v.split(',').any(|d| d.trim().eq_ignore_ascii_case("no-cache")))
}

fn vary_all(headers: &HeaderMap) -> bool {
    headers
        .get_all(VARY)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .any(|v| v.split(',').any(|field| field.trim() == "*"))
}
