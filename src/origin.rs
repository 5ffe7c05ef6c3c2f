use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use bytes::Bytes;
use http::header::{CONTENT_LENGTH, HOST};
use http::{HeaderMap, HeaderName, Request, Response, StatusCode};
use reqwest::{Client, Url};
use tracing::warn;

/// Produces the response for a request the cache does not answer itself.
#[async_trait]
pub trait Origin: Send + Sync {
    async fn handle(&self, request: Request<Bytes>) -> Response<Bytes>;
}

const HOP_BY_HOP: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "proxy-connection",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

/// Removes hop-by-hop headers, including any named by `Connection`.
pub fn strip_hop_by_hop(headers: &mut HeaderMap) {
    let listed: Vec<HeaderName> = headers
        .get_all(http::header::CONNECTION)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(','))
        .filter_map(|token| HeaderName::from_bytes(token.trim().as_bytes()).ok())
        .collect();
    for name in listed {
        headers.remove(name);
    }
    for name in HOP_BY_HOP {
        headers.remove(*name);
    }
}

/// Forwards requests to a fixed upstream base URL.
#[derive(Debug, Clone)]
pub struct UpstreamOrigin {
    client: Client,
    base: String,
}

impl UpstreamOrigin {
    pub fn new(base: &str, timeout: Duration) -> Result<Self> {
        let base = base.trim_end_matches('/').to_string();
        Url::parse(&base).with_context(|| format!("invalid upstream url '{base}'"))?;
        let client = Client::builder()
            .timeout(timeout)
            .redirect(reqwest::redirect::Policy::none())
            .build()
            .context("failed to build upstream client")?;
        Ok(Self { client, base })
    }

    async fn forward(&self, request: Request<Bytes>) -> Result<Response<Bytes>> {
        let (parts, body) = request.into_parts();
        let path = parts
            .uri
            .path_and_query()
            .map(|pq| pq.as_str())
            .unwrap_or("/");
        let url = Url::parse(&format!("{}{path}", self.base))
            .with_context(|| format!("invalid upstream path '{path}'"))?;

        let mut headers = parts.headers;
        strip_hop_by_hop(&mut headers);
        headers.remove(HOST);
        headers.remove(CONTENT_LENGTH);

        let upstream = self
            .client
            .request(parts.method, url)
            .headers(headers)
            .body(body)
            .send()
            .await
            .context("upstream request failed")?;

        let status = upstream.status();
        let mut headers = upstream.headers().clone();
        strip_hop_by_hop(&mut headers);
        let body = upstream
            .bytes()
            .await
            .context("failed to read upstream body")?;

        let mut response = Response::new(body);
        *response.status_mut() = status;
        *response.headers_mut() = headers;
        Ok(response)
    }
}

#[async_trait]
impl Origin for UpstreamOrigin {
    async fn handle(&self, request: Request<Bytes>) -> Response<Bytes> {
        match self.forward(request).await {
            Ok(response) => response,
            Err(err) => {
                warn!(error = ?err, upstream = %self.base, "upstream request failed");
                let mut response = Response::new(Bytes::from_static(b"upstream unavailable\n"));
                *response.status_mut() = StatusCode::BAD_GATEWAY;
                response
            }
        }
    }
}
