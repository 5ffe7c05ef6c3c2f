use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::URL_SAFE;
use http::StatusCode;
use reqwest::{Client, Url};
use tracing::{debug, trace};

use super::backend::{BackendError, CacheBackend, FlushScope};

pub const TTL_HEADER: &str = "x-ttl";
pub const VALIDATOR_HEADER: &str = "x-etag";
const PING_PATH: &str = "ping";
const CONNECT_TIMEOUT: Duration = Duration::from_secs(2);
const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Cache backend served by a remote HTTP cache service.
///
/// Entries live at `<base>/<base64url(key)>`; `GET` reads, `PUT` writes with
/// the lifetime in `X-TTL` seconds and the validator in `X-Etag`, `DELETE`
/// removes. Bulk flushes are `DELETE <base>/<scope>` and the health probe is
/// `GET <base>/ping` with `Host: ping`.
#[derive(Debug, Clone)]
pub struct RemoteStore {
    client: Client,
    base: Url,
    healthy: Arc<AtomicBool>,
}

impl RemoteStore {
    pub fn new(base: &str) -> Result<Self> {
        let normalized = format!("{}/", base.trim_end_matches('/'));
        let base = Url::parse(&normalized)
            .with_context(|| format!("invalid remote cache url '{base}'"))?;
        let client = Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .timeout(REQUEST_TIMEOUT)
            .build()
            .context("failed to build remote cache client")?;
        Ok(Self {
            client,
            base,
            healthy: Arc::new(AtomicBool::new(true)),
        })
    }

    fn url(&self, path: &str) -> Result<Url, BackendError> {
        self.base
            .join(path)
            .map_err(|err| BackendError::Request(format!("invalid cache url for '{path}': {err}")))
    }

    fn entry_url(&self, key: &str) -> Result<Url, BackendError> {
        self.url(&encode_key(key))
    }
}

pub fn encode_key(key: &str) -> String {
    URL_SAFE.encode(key.as_bytes())
}

fn request_error(err: reqwest::Error) -> BackendError {
    if err.is_connect() {
        BackendError::Unavailable(err.to_string())
    } else {
        BackendError::Request(err.to_string())
    }
}

fn expect_success(status: StatusCode) -> Result<(), BackendError> {
    if status.is_success() {
        Ok(())
    } else {
        Err(BackendError::UnexpectedStatus(status))
    }
}

#[async_trait]
impl CacheBackend for RemoteStore {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, BackendError> {
        let response = self
            .client
            .get(self.entry_url(key)?)
            .send()
            .await
            .map_err(request_error)?;
        if response.status() != StatusCode::OK {
            trace!(key, status = %response.status(), "remote cache miss");
            return Ok(None);
        }
        let body = response.bytes().await.map_err(request_error)?;
        Ok(Some(body.to_vec()))
    }

    async fn set(
        &self,
        key: &str,
        value: &[u8],
        ttl: Duration,
        validator: Option<&str>,
    ) -> Result<(), BackendError> {
        let mut request = self
            .client
            .put(self.entry_url(key)?)
            .header(TTL_HEADER, ttl.as_secs().to_string())
            .body(value.to_vec());
        if let Some(validator) = validator {
            request = request.header(VALIDATOR_HEADER, validator);
        }
        let response = request.send().await.map_err(request_error)?;
        expect_success(response.status())
    }

    async fn delete(&self, key: &str) -> Result<(), BackendError> {
        let response = self
            .client
            .delete(self.entry_url(key)?)
            .send()
            .await
            .map_err(request_error)?;
        match response.status() {
            StatusCode::NOT_FOUND => Ok(()),
            status => expect_success(status),
        }
    }

    async fn delete_all(&self, scope: FlushScope) -> Result<(), BackendError> {
        let response = self
            .client
            .delete(self.url(scope.as_str())?)
            .send()
            .await
            .map_err(request_error)?;
        expect_success(response.status())
    }

    async fn check_health(&self, force_refresh: bool) -> bool {
        if !force_refresh {
            return self.healthy.load(Ordering::Relaxed);
        }
        let healthy = match self.url(PING_PATH) {
            Ok(url) => match self
                .client
                .get(url)
                .header(http::header::HOST, PING_PATH)
                .send()
                .await
            {
                Ok(response) => response.status().is_success(),
                Err(err) => {
                    debug!(error = %err, "remote cache health probe failed");
                    false
                }
            },
            Err(_) => false,
        };
        self.healthy.store(healthy, Ordering::Relaxed);
        healthy
    }
}

#[cfg(test)]
mod tests {
    use std::net::SocketAddr;

    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    use super::*;

    #[test]
    fn keys_use_url_safe_base64() {
        assert_eq!(encode_key("GET-x-/a?"), "R0VULXgtL2E_");
    }

    #[test]
    fn base_url_gains_trailing_slash() {
        let store = RemoteStore::new("http://cache.local:8080/api").unwrap();
        assert_eq!(
            store.entry_url("k").unwrap().as_str(),
            "http://cache.local:8080/api/aw=="
        );
        assert_eq!(
            store.url("all").unwrap().as_str(),
            "http://cache.local:8080/api/all"
        );
    }

    #[test]
    fn rejects_invalid_base() {
        assert!(RemoteStore::new("not a url").is_err());
    }

    async fn closed_port() -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);
        addr
    }

    #[tokio::test]
    async fn refused_connection_is_unavailable() {
        let addr = closed_port().await;
        let store = RemoteStore::new(&format!("http://{addr}/")).unwrap();
        let err = store.get("k").await.unwrap_err();
        assert!(matches!(err, BackendError::Unavailable(_)), "{err:?}");
        assert!(!store.check_health(true).await);
        assert!(!store.check_health(false).await);
    }

    /// Serves one canned response per connection and returns the raw requests.
    async fn canned_server(
        responses: Vec<&'static str>,
    ) -> (SocketAddr, tokio::task::JoinHandle<Vec<String>>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let handle = tokio::spawn(async move {
            let mut seen = Vec::new();
            for response in responses {
                let (mut stream, _) = listener.accept().await.unwrap();
                let mut buf = vec![0u8; 8192];
                let mut request = Vec::new();
                loop {
                    let n = stream.read(&mut buf).await.unwrap();
                    request.extend_from_slice(&buf[..n]);
                    if n == 0 || header_complete(&request) {
                        break;
                    }
                }
                seen.push(String::from_utf8_lossy(&request).into_owned());
                stream.write_all(response.as_bytes()).await.unwrap();
                stream.shutdown().await.ok();
            }
            seen
        });
        (addr, handle)
    }

    fn header_complete(request: &[u8]) -> bool {
        let Some(end) = request.windows(4).position(|w| w == b"\r\n\r\n") else {
            return false;
        };
        let head = String::from_utf8_lossy(&request[..end]).to_ascii_lowercase();
        let length = head
            .lines()
            .find_map(|line| line.strip_prefix("content-length:"))
            .and_then(|v| v.trim().parse::<usize>().ok())
            .unwrap_or(0);
        request.len() >= end + 4 + length
    }

    #[tokio::test]
    async fn set_sends_ttl_and_validator() {
        let (addr, server) =
            canned_server(vec!["HTTP/1.1 201 Created\r\ncontent-length: 0\r\nconnection: close\r\n\r\n"])
                .await;
        let store = RemoteStore::new(&format!("http://{addr}")).unwrap();
        store
            .set("k", b"payload", Duration::from_secs(42), Some("\"abc\""))
            .await
            .unwrap();
        let requests = server.await.unwrap();
        let request = requests[0].to_ascii_lowercase();
        assert!(request.starts_with("put /aw== http/1.1"), "{request}");
        assert!(request.contains("x-ttl: 42"));
        assert!(request.contains("x-etag: \"abc\""));
        assert!(request.ends_with("payload"));
    }

    #[tokio::test]
    async fn get_maps_status_to_presence() {
        let (addr, server) = canned_server(vec![
            "HTTP/1.1 200 OK\r\ncontent-length: 5\r\nconnection: close\r\n\r\nhello",
            "HTTP/1.1 404 Not Found\r\ncontent-length: 0\r\nconnection: close\r\n\r\n",
        ])
        .await;
        let store = RemoteStore::new(&format!("http://{addr}")).unwrap();
        assert_eq!(store.get("k").await.unwrap(), Some(b"hello".to_vec()));
        assert_eq!(store.get("k").await.unwrap(), None);
        server.await.unwrap();
    }

    #[tokio::test]
    async fn health_probe_hits_ping() {
        let (addr, server) = canned_server(vec![
            "HTTP/1.1 200 OK\r\ncontent-length: 4\r\nconnection: close\r\n\r\npong",
        ])
        .await;
        let store = RemoteStore::new(&format!("http://{addr}")).unwrap();
        assert!(store.check_health(true).await);
        let requests = server.await.unwrap();
        let request = requests[0].to_ascii_lowercase();
        assert!(request.starts_with("get /ping http/1.1"));
        assert!(request.contains("host: ping"));
    }

    #[tokio::test]
    async fn flush_reports_error_status() {
        let (addr, server) = canned_server(vec![
            "HTTP/1.1 500 Internal Server Error\r\ncontent-length: 0\r\nconnection: close\r\n\r\n",
        ])
        .await;
        let store = RemoteStore::new(&format!("http://{addr}")).unwrap();
        let err = store.delete_all(FlushScope::All).await.unwrap_err();
        assert!(matches!(
            err,
            BackendError::UnexpectedStatus(StatusCode::INTERNAL_SERVER_ERROR)
        ));
        let requests = server.await.unwrap();
        assert!(requests[0].starts_with("DELETE /all HTTP/1.1"));
    }
}
