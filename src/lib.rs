pub mod cache;
pub mod cli;
pub mod logging;
pub mod metrics;
pub mod origin;
pub mod server;
pub mod settings;
pub mod task;
pub mod util;

use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::net::TcpListener;
use tracing::{info, warn};

use crate::{
    cache::{
        Backend, BackendRegistry, LocalStore, LocalStoreOptions, RemoteStore, ResponseCache,
        spawn_health_monitor,
    },
    origin::UpstreamOrigin,
    settings::Settings,
};

pub async fn run(settings: Settings) -> Result<()> {
    let settings = Arc::new(settings);
    if let Some(addr) = settings.metrics_listen {
        tokio::spawn(async move {
            tracing::info!(address = %addr, "metrics endpoint starting");
            if let Err(err) = crate::metrics::serve(addr, "/metrics").await {
                tracing::error!(error = %err, "metrics endpoint failed");
            }
        });
    }

    let local = LocalStore::open(LocalStoreOptions {
        dir: settings.cache_dir.clone(),
        memory_entries: settings.cache_memory_capacity(),
        sweep_interval: settings.cache_sweeper_interval(),
    })
    .await?;

    let registry = match &settings.remote_cache_url {
        Some(url) => {
            let remote = RemoteStore::new(url)?;
            BackendRegistry::new(Backend::Remote(remote)).with_backup(Backend::Local(local.clone()))
        }
        None => BackendRegistry::new(Backend::Local(local.clone())),
    };
    let registry = Arc::new(registry);
    registry.refresh_health().await;
    if registry.active().is_none() {
        warn!("no cache backend is available; requests will pass through to the upstream");
    }
    let health = spawn_health_monitor(Arc::downgrade(&registry), settings.health_check_interval());

    let origin = Arc::new(UpstreamOrigin::new(&settings.upstream, settings.upstream_timeout())?);
    let cache = Arc::new(ResponseCache::new(settings.cache_options()?, registry, origin)?);

    let listener = TcpListener::bind(settings.listen)
        .await
        .with_context(|| format!("failed to bind listener on {}", settings.listen))?;
    let result = server::serve(listener, cache, settings.max_body_size, shutdown_signal()).await;

    info!("shutting down");
    health.shutdown().await;
    local.shutdown().await;
    result
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        warn!(error = %err, "failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
}
