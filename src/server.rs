use std::future::Future;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::{
    Router,
    body::{Body, to_bytes},
    extract::{Request, State},
    http::StatusCode,
    response::{IntoResponse, Response},
};
use tokio::net::TcpListener;
use tracing::{debug, info};

use crate::cache::ResponseCache;

#[derive(Clone)]
struct ServerState {
    cache: Arc<ResponseCache>,
    max_body_size: usize,
}

/// Router that sends every request through the response cache.
pub fn router(cache: Arc<ResponseCache>, max_body_size: usize) -> Router {
    Router::new().fallback(handle).with_state(ServerState {
        cache,
        max_body_size,
    })
}

async fn handle(State(state): State<ServerState>, request: Request) -> Response {
    let (parts, body) = request.into_parts();
    let body = match to_bytes(body, state.max_body_size).await {
        Ok(body) => body,
        Err(err) => {
            debug!(error = %err, limit = state.max_body_size, "rejecting request body");
            return (StatusCode::PAYLOAD_TOO_LARGE, "request body too large\n").into_response();
        }
    };
    let response = state
        .cache
        .handle(http::Request::from_parts(parts, body))
        .await;
    response.map(Body::from)
}

/// Serves `cache` on `listener` until `shutdown` resolves.
pub async fn serve<F>(
    listener: TcpListener,
    cache: Arc<ResponseCache>,
    max_body_size: usize,
    shutdown: F,
) -> Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    if let Ok(addr) = listener.local_addr() {
        info!(address = %addr, "cache listener started");
    }
    axum::serve(listener, router(cache, max_body_size))
        .with_graceful_shutdown(shutdown)
        .await
        .context("cache listener failed")
}
