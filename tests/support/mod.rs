#![allow(dead_code)]

mod http_utils;
mod upstream;

pub use http_utils::*;
pub use upstream::TestUpstream;

use std::net::{Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tempfile::TempDir;
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

use respcache::cache::{
    Backend, BackendRegistry, CacheOptions, LocalStore, LocalStoreOptions, ResponseCache,
};
use respcache::origin::UpstreamOrigin;
use respcache::server;

pub const MAX_BODY_SIZE: usize = 1024 * 1024;

pub struct TestDirs {
    _temp: TempDir,
    pub cache_dir: PathBuf,
}

impl TestDirs {
    pub fn new() -> Result<Self> {
        let temp = TempDir::new()?;
        let cache_dir = temp.path().join("cache");
        Ok(Self {
            _temp: temp,
            cache_dir,
        })
    }
}

pub async fn open_local_store(dir: &Path) -> Result<LocalStore> {
    LocalStore::open(LocalStoreOptions {
        dir: dir.to_path_buf(),
        memory_entries: None,
        sweep_interval: Duration::from_secs(300),
    })
    .await
}

/// A cache listener bound to an ephemeral port in front of `upstream`.
pub struct TestServer {
    pub addr: SocketAddr,
    pub registry: Arc<BackendRegistry>,
    shutdown: Option<oneshot::Sender<()>>,
    handle: JoinHandle<Result<()>>,
}

impl TestServer {
    pub async fn start(
        options: CacheOptions,
        registry: BackendRegistry,
        upstream: &TestUpstream,
    ) -> Result<Self> {
        Self::start_with_limit(options, registry, upstream, MAX_BODY_SIZE).await
    }

    pub async fn start_with_limit(
        options: CacheOptions,
        registry: BackendRegistry,
        upstream: &TestUpstream,
        max_body_size: usize,
    ) -> Result<Self> {
        let registry = Arc::new(registry);
        registry.refresh_health().await;
        let origin = Arc::new(UpstreamOrigin::new(
            &upstream.base_url(),
            Duration::from_secs(5),
        )?);
        let cache = Arc::new(ResponseCache::new(options, registry.clone(), origin)?);
        let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).await?;
        let addr = listener.local_addr()?;
        let (tx, rx) = oneshot::channel();
        let handle = tokio::spawn(server::serve(listener, cache, max_body_size, async move {
            let _ = rx.await;
        }));
        Ok(Self {
            addr,
            registry,
            shutdown: Some(tx),
            handle,
        })
    }

    pub async fn local(
        options: CacheOptions,
        store: &LocalStore,
        upstream: &TestUpstream,
    ) -> Result<Self> {
        Self::start(
            options,
            BackendRegistry::new(Backend::Local(store.clone())),
            upstream,
        )
        .await
    }

    pub async fn stop(mut self) -> Result<()> {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        (&mut self.handle).await?
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
    }
}
