use std::time::Duration;

use anyhow::{Result, anyhow};
use http::StatusCode;
use time::OffsetDateTime;
use tracing_subscriber::{EnvFilter, fmt};

use crate::cli::LogFormat;

const DEFAULT_FILTER: &str = "info";
const DEBUG_FILTER: &str = "info,respcache=debug";

/// Installs the global subscriber. `RUST_LOG` wins over `debug` when set.
pub fn init_logger(format: LogFormat, debug: bool) -> Result<()> {
    let fallback = if debug { DEBUG_FILTER } else { DEFAULT_FILTER };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(fallback));

    match format {
        LogFormat::Json => fmt::fmt()
            .with_env_filter(filter)
            .json()
            .with_current_span(false)
            .with_span_list(false)
            .with_thread_ids(false)
            .with_thread_names(false)
            .try_init()
            .map_err(|err| anyhow!(err))?,
        LogFormat::Text => fmt::fmt()
            .with_env_filter(filter)
            .with_target(false)
            .compact()
            .try_init()
            .map_err(|err| anyhow!(err))?,
    }

    Ok(())
}

#[derive(Debug, Clone)]
pub struct AccessLogEvent {
    pub method: String,
    pub host: String,
    pub path: String,
    pub key: Option<String>,
    pub cache_lookup: Option<String>,
    pub cache_store: Option<String>,
    pub backend: Option<String>,
    pub status: u16,
    pub bytes_out: u64,
    pub elapsed_ms: u128,
    pub error_detail: Option<String>,
}

#[derive(Debug)]
pub struct AccessLogBuilder {
    event: AccessLogEvent,
}

impl Default for AccessLogBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl AccessLogBuilder {
    pub fn new() -> Self {
        Self {
            event: AccessLogEvent {
                method: String::new(),
                host: String::new(),
                path: String::new(),
                key: None,
                cache_lookup: None,
                cache_store: None,
                backend: None,
                status: 0,
                bytes_out: 0,
                elapsed_ms: 0,
                error_detail: None,
            },
        }
    }

    pub fn method(mut self, method: impl Into<String>) -> Self {
        self.event.method = method.into();
        self
    }

    pub fn host(mut self, host: impl Into<String>) -> Self {
        self.event.host = host.into();
        self
    }

    pub fn path(mut self, path: impl Into<String>) -> Self {
        self.event.path = path.into();
        self
    }

    pub fn key(mut self, key: impl Into<String>) -> Self {
        self.event.key = Some(key.into());
        self
    }

    pub fn cache_lookup(mut self, value: impl Into<String>) -> Self {
        self.event.cache_lookup = Some(value.into());
        self
    }

    pub fn cache_store(mut self, value: impl Into<String>) -> Self {
        self.event.cache_store = Some(value.into());
        self
    }

    pub fn backend(mut self, backend: impl Into<String>) -> Self {
        self.event.backend = Some(backend.into());
        self
    }

    pub fn status(mut self, status: StatusCode) -> Self {
        self.event.status = status.as_u16();
        self
    }

    pub fn bytes_out(mut self, bytes: u64) -> Self {
        self.event.bytes_out = bytes;
        self
    }

    pub fn elapsed(mut self, elapsed: Duration) -> Self {
        self.event.elapsed_ms = elapsed.as_millis();
        self
    }

    pub fn error_detail(mut self, detail: impl Into<String>) -> Self {
        self.event.error_detail = Some(detail.into());
        self
    }

    pub fn build(self) -> AccessLogEvent {
        self.event
    }

    pub fn log(self) {
        log_access(self.build());
    }
}

pub fn log_access(event: AccessLogEvent) {
    let AccessLogEvent {
        method,
        host,
        path,
        key,
        cache_lookup,
        cache_store,
        backend,
        status,
        bytes_out,
        elapsed_ms,
        error_detail,
    } = event;

    let now = OffsetDateTime::now_utc();
    let (year, month, day) = now.to_calendar_date();
    let (hour, minute, second) = now.to_hms();
    let millisecond = now.millisecond();
    let month_number: u8 = month.into();
    let ts = format!(
        "{year:04}-{month:02}-{day:02}T{hour:02}:{minute:02}:{second:02}.{millisecond:03}Z",
        month = month_number
    );

    tracing::info!(
        target: "access_log",
        ts,
        method,
        host,
        path,
        key = key.as_deref(),
        cache_lookup = cache_lookup.as_deref(),
        cache_store = cache_store.as_deref(),
        backend = backend.as_deref(),
        status,
        bytes_out,
        elapsed_ms,
        error_detail = error_detail.as_deref()
    );

    crate::metrics::record_request(
        &method,
        cache_lookup.as_deref(),
        StatusCode::from_u16(status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR),
        Duration::from_millis(elapsed_ms as u64),
    );
}
