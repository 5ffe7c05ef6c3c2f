use std::net::SocketAddr;
use std::num::NonZeroUsize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, bail, ensure};
use config::{Config, ConfigError, Environment, File};
use http::{HeaderName, StatusCode};
use serde::Deserialize;

use crate::cache::key::KeyOptions;
use crate::cache::local::MIN_SWEEP_INTERVAL;
use crate::cache::orchestrator::{CacheOptions, FlushTarget, MIN_MAX_TTL};
use crate::cli::{Cli, LogFormat};

fn default_log_format() -> LogFormat {
    LogFormat::Json
}

fn default_cache_max_ttl() -> u64 {
    300
}

fn default_cache_sweeper_interval() -> u64 {
    300
}

fn default_cache_memory_entries() -> usize {
    10_000
}

fn default_true() -> bool {
    true
}

fn default_cache_flush_header() -> String {
    "X-Cache-Flush".to_string()
}

fn default_cache_flush_target() -> FlushTarget {
    FlushTarget::Key
}

fn default_cache_flush_status() -> u16 {
    204
}

fn default_cache_no_cache_header() -> String {
    "X-Cache-Control".to_string()
}

fn default_cache_skip_validator_header() -> String {
    "X-Skip-Etag".to_string()
}

fn default_health_check_interval() -> u64 {
    300
}

fn default_upstream_timeout() -> u64 {
    60
}

fn default_max_body_size() -> usize {
    64 * 1024 * 1024
}

#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    pub listen: SocketAddr,
    pub upstream: String,
    #[serde(default = "default_upstream_timeout")]
    pub upstream_timeout: u64,
    #[serde(default = "default_log_format")]
    pub log: LogFormat,
    #[serde(default)]
    pub debug: bool,
    #[serde(default)]
    pub metrics_listen: Option<SocketAddr>,
    pub cache_dir: PathBuf,
    #[serde(default = "default_cache_max_ttl")]
    pub cache_max_ttl: u64,
    #[serde(default = "default_cache_sweeper_interval")]
    pub cache_sweeper_interval: u64,
    #[serde(default)]
    pub cache_memory: bool,
    #[serde(default = "default_cache_memory_entries")]
    pub cache_memory_entries: usize,
    #[serde(default = "default_true")]
    pub cache_add_status_header: bool,
    #[serde(default = "default_cache_flush_header")]
    pub cache_flush_header: String,
    #[serde(default = "default_cache_flush_target")]
    pub cache_flush_target: FlushTarget,
    #[serde(default = "default_cache_flush_status")]
    pub cache_flush_status: u16,
    #[serde(default)]
    pub cache_next_gen_formats: Vec<String>,
    #[serde(default)]
    pub cache_key_headers: Vec<String>,
    #[serde(default)]
    pub cache_bypass_headers: Vec<String>,
    #[serde(default = "default_cache_no_cache_header")]
    pub cache_no_cache_header: String,
    #[serde(default = "default_cache_skip_validator_header")]
    pub cache_skip_validator_header: String,
    #[serde(default)]
    pub cache_key_disable_host: bool,
    #[serde(default)]
    pub cache_key_disable_method: bool,
    #[serde(default)]
    pub cache_key_include_query: bool,
    #[serde(default)]
    pub remote_cache_url: Option<String>,
    #[serde(default = "default_health_check_interval")]
    pub health_check_interval: u64,
    #[serde(default = "default_max_body_size")]
    pub max_body_size: usize,
}

impl Settings {
    pub fn load(cli: &Cli) -> Result<Self> {
        let config_path = resolve_config_path(cli)?;
        let cfg = Config::builder()
            .add_source(File::from(config_path.clone()).required(true))
            .add_source(
                Environment::with_prefix("RESPCACHE")
                    .separator("__")
                    .list_separator(",")
                    .with_list_parse_key("cache_next_gen_formats")
                    .with_list_parse_key("cache_key_headers")
                    .with_list_parse_key("cache_bypass_headers")
                    .try_parsing(true),
            )
            .build()
            .map_err(to_anyhow)?;
        let mut settings: Settings = cfg.try_deserialize().map_err(to_anyhow)?;
        settings.debug |= cli.debug;
        settings.apply_base_dir(&config_path);
        settings.validate()?;
        Ok(settings)
    }

    pub fn cache_max_ttl(&self) -> Duration {
        Duration::from_secs(self.cache_max_ttl)
    }

    pub fn cache_sweeper_interval(&self) -> Duration {
        Duration::from_secs(self.cache_sweeper_interval)
    }

    pub fn health_check_interval(&self) -> Duration {
        Duration::from_secs(self.health_check_interval)
    }

    pub fn upstream_timeout(&self) -> Duration {
        Duration::from_secs(self.upstream_timeout)
    }

    /// Overlay capacity, or `None` when the overlay is disabled.
    pub fn cache_memory_capacity(&self) -> Option<NonZeroUsize> {
        if self.cache_memory {
            NonZeroUsize::new(self.cache_memory_entries)
        } else {
            None
        }
    }

    pub fn cache_options(&self) -> Result<CacheOptions> {
        Ok(CacheOptions {
            max_ttl: self.cache_max_ttl(),
            add_status_header: self.cache_add_status_header,
            flush_header: header_name("cache_flush_header", &self.cache_flush_header)?,
            flush_target: self.cache_flush_target,
            flush_status: StatusCode::from_u16(self.cache_flush_status).with_context(|| {
                format!("cache_flush_status {} is not a valid status", self.cache_flush_status)
            })?,
            bypass_headers: header_names("cache_bypass_headers", &self.cache_bypass_headers)?,
            no_cache_header: header_name("cache_no_cache_header", &self.cache_no_cache_header)?,
            skip_validator_header: header_name(
                "cache_skip_validator_header",
                &self.cache_skip_validator_header,
            )?,
            key: KeyOptions {
                disable_method: self.cache_key_disable_method,
                disable_host: self.cache_key_disable_host,
                include_query: self.cache_key_include_query,
                headers: header_names("cache_key_headers", &self.cache_key_headers)?,
                next_gen_formats: self.cache_next_gen_formats.clone(),
            },
        })
    }

    fn apply_base_dir(&mut self, config_path: &Path) {
        let base_dir = config_path
            .parent()
            .filter(|dir| !dir.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."));
        self.cache_dir = absolutize(&self.cache_dir, base_dir);
    }

    pub fn validate(&self) -> Result<()> {
        ensure!(
            self.cache_max_ttl >= MIN_MAX_TTL.as_secs(),
            "cache_max_ttl must be at least {} seconds (got {})",
            MIN_MAX_TTL.as_secs(),
            self.cache_max_ttl
        );
        ensure!(
            self.cache_sweeper_interval >= MIN_SWEEP_INTERVAL.as_secs(),
            "cache_sweeper_interval must be at least {} seconds (got {})",
            MIN_SWEEP_INTERVAL.as_secs(),
            self.cache_sweeper_interval
        );
        if self.cache_memory {
            ensure!(
                self.cache_memory_entries > 0,
                "cache_memory_entries must be greater than 0 when cache_memory is enabled"
            );
        }
        ensure!(
            self.health_check_interval > 0,
            "health_check_interval must be greater than 0 seconds (got {})",
            self.health_check_interval
        );
        ensure!(
            self.upstream_timeout > 0,
            "upstream_timeout must be greater than 0 seconds (got {})",
            self.upstream_timeout
        );
        ensure!(
            self.max_body_size > 0,
            "max_body_size must be greater than 0 (got {})",
            self.max_body_size
        );
        ensure!(!self.upstream.trim().is_empty(), "upstream must not be empty");
        if let Some(url) = &self.remote_cache_url {
            ensure!(!url.trim().is_empty(), "remote_cache_url must not be empty when set");
        }
        self.cache_options()?.validate()
    }
}

fn header_name(field: &str, value: &str) -> Result<HeaderName> {
    HeaderName::from_bytes(value.trim().as_bytes())
        .with_context(|| format!("{field}: '{value}' is not a valid header name"))
}

fn header_names(field: &str, values: &[String]) -> Result<Vec<HeaderName>> {
    values.iter().map(|value| header_name(field, value)).collect()
}

fn to_anyhow(err: ConfigError) -> anyhow::Error {
    anyhow::anyhow!(err)
}

impl Cli {
    pub fn config_path(&self) -> Option<&Path> {
        self.config.as_deref()
    }
}

fn resolve_config_path(cli: &Cli) -> Result<PathBuf> {
    if let Some(path) = cli.config_path() {
        return Ok(path.to_path_buf());
    }

    for candidate in default_config_candidates() {
        if candidate.exists() {
            return Ok(candidate);
        }
    }

    bail!(
        "no configuration file provided via --config and none found in default locations: {}",
        default_config_candidates()
            .iter()
            .map(|p| p.display().to_string())
            .collect::<Vec<_>>()
            .join(", ")
    );
}

fn default_config_candidates() -> [PathBuf; 2] {
    [
        PathBuf::from("/etc/respcache/respcache.toml"),
        PathBuf::from("respcache.toml"),
    ]
}

fn absolutize(path: &Path, base: &Path) -> PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        base.join(path)
    }
}

#[cfg(test)]
mod tests {
    use std::fs;

    use tempfile::TempDir;

    use super::*;

    fn write_config(dir: &TempDir, body: &str) -> PathBuf {
        let path = dir.path().join("respcache.toml");
        fs::write(&path, body).unwrap();
        path
    }

    fn cli(path: PathBuf) -> Cli {
        Cli {
            config: Some(path),
            debug: false,
        }
    }

    const MINIMAL: &str = r#"
listen = "127.0.0.1:8080"
upstream = "http://127.0.0.1:9000"
cache_dir = "cache"
"#;

    #[test]
    fn defaults_apply_when_fields_are_omitted() {
        let dir = TempDir::new().unwrap();
        let settings = Settings::load(&cli(write_config(&dir, MINIMAL))).unwrap();
        assert_eq!(settings.cache_max_ttl, 300);
        assert_eq!(settings.cache_sweeper_interval, 300);
        assert!(!settings.cache_memory);
        assert!(settings.cache_memory_capacity().is_none());
        assert!(settings.cache_add_status_header);
        assert_eq!(settings.cache_dir, dir.path().join("cache"));

        let options = settings.cache_options().unwrap();
        assert_eq!(options.flush_header.as_str(), "x-cache-flush");
        assert_eq!(options.flush_target, FlushTarget::Key);
        assert_eq!(options.flush_status, StatusCode::NO_CONTENT);
        assert_eq!(options.no_cache_header.as_str(), "x-cache-control");
        assert_eq!(options.skip_validator_header.as_str(), "x-skip-etag");
    }

    #[test]
    fn parses_lists_and_flush_target() {
        let dir = TempDir::new().unwrap();
        let body = format!(
            "{MINIMAL}cache_memory = true\ncache_flush_target = \"all\"\ncache_key_headers = [\"X-Tenant\"]\ncache_next_gen_formats = [\"image/avif\"]\n"
        );
        let settings = Settings::load(&cli(write_config(&dir, &body))).unwrap();
        assert_eq!(settings.cache_memory_capacity(), NonZeroUsize::new(10_000));
        let options = settings.cache_options().unwrap();
        assert_eq!(options.flush_target, FlushTarget::All);
        assert_eq!(options.key.headers, vec![HeaderName::from_static("x-tenant")]);
        assert_eq!(options.key.next_gen_formats, vec!["image/avif".to_string()]);
    }

    #[test]
    fn rejects_short_intervals() {
        let dir = TempDir::new().unwrap();
        let body = format!("{MINIMAL}cache_max_ttl = 1\n");
        let err = Settings::load(&cli(write_config(&dir, &body))).unwrap_err();
        assert!(err.to_string().contains("cache_max_ttl"), "{err}");

        let body = format!("{MINIMAL}cache_sweeper_interval = 1\n");
        let err = Settings::load(&cli(write_config(&dir, &body))).unwrap_err();
        assert!(err.to_string().contains("cache_sweeper_interval"), "{err}");

        let body = format!("{MINIMAL}health_check_interval = 0\n");
        assert!(Settings::load(&cli(write_config(&dir, &body))).is_err());
    }

    #[test]
    fn rejects_invalid_header_names_and_status() {
        let dir = TempDir::new().unwrap();
        let body = format!("{MINIMAL}cache_flush_header = \"bad header\"\n");
        let err = Settings::load(&cli(write_config(&dir, &body))).unwrap_err();
        assert!(err.to_string().contains("cache_flush_header"), "{err}");

        let body = format!("{MINIMAL}cache_flush_status = 42\n");
        assert!(Settings::load(&cli(write_config(&dir, &body))).is_err());
    }

    #[test]
    fn missing_required_fields_fail() {
        let dir = TempDir::new().unwrap();
        let body = "listen = \"127.0.0.1:8080\"\n";
        assert!(Settings::load(&cli(write_config(&dir, body))).is_err());
    }

    #[test]
    fn cli_debug_flag_enables_debug() {
        let dir = TempDir::new().unwrap();
        let path = write_config(&dir, MINIMAL);
        let settings = Settings::load(&Cli {
            config: Some(path),
            debug: true,
        })
        .unwrap();
        assert!(settings.debug);
    }
}
