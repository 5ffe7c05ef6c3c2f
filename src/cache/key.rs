use std::fmt;

use base64::Engine;
use base64::engine::general_purpose::{STANDARD, URL_SAFE};
use http::header::{ACCEPT, HOST};
use http::{HeaderMap, HeaderName, Method, Uri};

const SEPARATOR: &str = "-";

/// Which request attributes feed into the cache key.
#[derive(Debug, Clone, Default)]
pub struct KeyOptions {
    pub disable_method: bool,
    pub disable_host: bool,
    pub include_query: bool,
    /// Headers whose values become part of the key, in this order.
    pub headers: Vec<HeaderName>,
    /// Media types checked against `Accept`; the first configured one the
    /// client accepts is added to the key.
    pub next_gen_formats: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey(String);

impl CacheKey {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Path-like URL-safe base64 form used in the `X-Cache-Key` response
    /// header.
    pub fn encoded(&self) -> String {
        format!("/{}", URL_SAFE.encode(self.0.as_bytes()))
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone)]
pub struct KeyDeriver {
    options: KeyOptions,
}

impl KeyDeriver {
    pub fn new(mut options: KeyOptions) -> Self {
        for format in &mut options.next_gen_formats {
            *format = format.trim().to_ascii_lowercase();
        }
        options.next_gen_formats.retain(|format| !format.is_empty());
        Self { options }
    }

    pub fn derive(&self, method: &Method, uri: &Uri, headers: &HeaderMap) -> CacheKey {
        let mut segments: Vec<String> = Vec::with_capacity(5);
        if !self.options.disable_method {
            // Flush requests address the entry their GET stored.
            let method = if method == Method::DELETE {
                Method::GET
            } else {
                method.clone()
            };
            segments.push(method.as_str().to_string());
        }
        if !self.options.disable_host {
            segments.push(request_host(uri, headers));
        }
        segments.push(self.path_segment(uri));

        let header_values = self.header_values(headers);
        if !header_values.is_empty() {
            segments.push(STANDARD.encode(header_values.as_bytes()));
        }
        if let Some(format) = self.accepted_format(headers) {
            segments.push(format.replace(' ', ""));
        }

        let joined = segments.join(SEPARATOR);
        CacheKey(joined.trim_start_matches(SEPARATOR).to_string())
    }

    fn path_segment(&self, uri: &Uri) -> String {
        let path = uri.path().split('#').next().unwrap_or_default();
        match uri.query() {
            Some(query) if self.options.include_query => format!("{path}?{query}"),
            _ => path.to_string(),
        }
    }

    fn header_values(&self, headers: &HeaderMap) -> String {
        let mut combined = String::new();
        for name in &self.options.headers {
            if let Some(value) = headers.get(name).and_then(|v| v.to_str().ok()) {
                combined.extend(value.chars().filter(|c| *c != ' '));
            }
        }
        combined
    }

    fn accepted_format(&self, headers: &HeaderMap) -> Option<&str> {
        if self.options.next_gen_formats.is_empty() {
            return None;
        }
        let accept = headers.get(ACCEPT)?.to_str().ok()?;
        let accepted: Vec<&str> = accept
            .split(',')
            .map(|item| item.split(';').next().unwrap_or_default().trim())
            .filter(|item| !item.is_empty())
            .collect();
        self.options
            .next_gen_formats
            .iter()
            .find(|format| accepted.iter().any(|item| item.eq_ignore_ascii_case(format)))
            .map(String::as_str)
    }
}

fn request_host(uri: &Uri, headers: &HeaderMap) -> String {
    headers
        .get(HOST)
        .and_then(|value| value.to_str().ok())
        .map(str::to_string)
        .or_else(|| uri.authority().map(|authority| authority.as_str().to_string()))
        .unwrap_or_default()
}
