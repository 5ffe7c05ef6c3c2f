mod support;

use std::net::Ipv4Addr;
use std::time::Duration;

use anyhow::Result;
use tokio::net::TcpListener;

use respcache::cache::{
    Backend, BackendRegistry, CacheOptions, FlushTarget, LocalStore, LocalStoreOptions,
    RemoteStore,
};

use support::*;

const CACHEABLE: &str = "Cache-Control: max-age=60\r\nContent-Type: text/plain\r\n";

#[tokio::test]
async fn cacheable_response_is_served_from_disk() -> Result<()> {
    let dirs = TestDirs::new()?;
    let store = open_local_store(&dirs.cache_dir).await?;
    let upstream = TestUpstream::ok(CACHEABLE, "cached-response").await?;
    let server = TestServer::local(CacheOptions::default(), &store, &upstream).await?;

    let first = get(server.addr, "/page", &[]).await?;
    assert_eq!(first.status, 200);
    assert_eq!(first.body, "cached-response");
    assert_eq!(first.header("cache-status"), Some("miss"));
    assert!(first.header("etag").is_some());

    let second = get(server.addr, "/page", &[]).await?;
    assert_eq!(second.status, 200);
    assert_eq!(second.body, "cached-response");
    let status = second.header("cache-status").unwrap_or_default();
    assert!(status.starts_with("hit; ttl="), "unexpected cache-status {status}");
    assert!(second.header("x-cache-key").is_some_and(|key| key.starts_with('/')));
    assert_eq!(second.header("content-type"), Some("text/plain"));
    assert_eq!(upstream.requests(), 1);

    server.stop().await?;
    store.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn entries_survive_store_restart() -> Result<()> {
    let dirs = TestDirs::new()?;
    let upstream = TestUpstream::ok(CACHEABLE, "persisted").await?;

    let store = open_local_store(&dirs.cache_dir).await?;
    let server = TestServer::local(CacheOptions::default(), &store, &upstream).await?;
    get(server.addr, "/persist", &[]).await?;
    server.stop().await?;
    store.shutdown().await;
    drop(store);

    let store = open_local_store(&dirs.cache_dir).await?;
    let server = TestServer::local(CacheOptions::default(), &store, &upstream).await?;
    let response = get(server.addr, "/persist", &[]).await?;
    assert_eq!(response.body, "persisted");
    assert!(response.header("cache-status").is_some_and(|s| s.starts_with("hit")));
    assert_eq!(upstream.requests(), 1);

    server.stop().await?;
    store.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn ttl_is_capped_by_max_ttl() -> Result<()> {
    let dirs = TestDirs::new()?;
    let store = open_local_store(&dirs.cache_dir).await?;
    let upstream = TestUpstream::ok("Cache-Control: max-age=3600\r\n", "long-lived").await?;
    let options = CacheOptions {
        max_ttl: Duration::from_secs(30),
        ..CacheOptions::default()
    };
    let server = TestServer::local(options, &store, &upstream).await?;

    get(server.addr, "/capped", &[]).await?;
    let hit = get(server.addr, "/capped", &[]).await?;
    let ttl: u64 = hit
        .header("cache-status")
        .and_then(|status| status.strip_prefix("hit; ttl="))
        .and_then(|ttl| ttl.parse().ok())
        .unwrap_or(u64::MAX);
    assert!(ttl <= 30, "ttl {ttl} exceeds the configured maximum");

    server.stop().await?;
    store.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn uncacheable_responses_reach_upstream_every_time() -> Result<()> {
    let dirs = TestDirs::new()?;
    let store = open_local_store(&dirs.cache_dir).await?;
    let upstream = TestUpstream::ok("Cache-Control: no-store\r\n", "fresh").await?;
    let server = TestServer::local(CacheOptions::default(), &store, &upstream).await?;

    for _ in 0..2 {
        let response = get(server.addr, "/volatile", &[]).await?;
        assert_eq!(response.status, 200);
        assert_eq!(response.header("cache-status"), Some("miss"));
    }
    assert_eq!(upstream.requests(), 2);

    server.stop().await?;
    store.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn matching_validator_returns_not_modified() -> Result<()> {
    let dirs = TestDirs::new()?;
    let store = open_local_store(&dirs.cache_dir).await?;
    let upstream =
        TestUpstream::ok("Cache-Control: max-age=60\r\nETag: \"v1\"\r\n", "versioned").await?;
    let server = TestServer::local(CacheOptions::default(), &store, &upstream).await?;

    let first = get(server.addr, "/doc", &[]).await?;
    assert_eq!(first.header("etag"), Some("\"v1\""));

    let conditional = get(server.addr, "/doc", &[("If-None-Match", "\"v1\"")]).await?;
    assert_eq!(conditional.status, 304);
    assert!(conditional.body.is_empty());

    let skipped = get(
        server.addr,
        "/doc",
        &[("If-None-Match", "\"v1\""), ("X-Skip-Etag", "1")],
    )
    .await?;
    assert_eq!(skipped.status, 200);
    assert_eq!(skipped.body, "versioned");
    assert_eq!(upstream.requests(), 1);

    server.stop().await?;
    store.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn no_cache_header_bypasses_the_cache() -> Result<()> {
    let dirs = TestDirs::new()?;
    let store = open_local_store(&dirs.cache_dir).await?;
    let upstream = TestUpstream::ok(CACHEABLE, "direct").await?;
    let server = TestServer::local(CacheOptions::default(), &store, &upstream).await?;

    get(server.addr, "/bypass", &[]).await?;
    let bypassed = get(server.addr, "/bypass", &[("X-Cache-Control", "no-cache")]).await?;
    assert_eq!(bypassed.status, 200);
    assert!(bypassed.header("cache-status").is_none());
    assert_eq!(upstream.requests(), 2);

    server.stop().await?;
    store.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn flush_header_evicts_entry_without_contacting_upstream() -> Result<()> {
    let dirs = TestDirs::new()?;
    let store = open_local_store(&dirs.cache_dir).await?;
    let upstream = TestUpstream::ok(CACHEABLE, "flushable").await?;
    let server = TestServer::local(CacheOptions::default(), &store, &upstream).await?;

    get(server.addr, "/item", &[]).await?;
    let flush = send_request(server.addr, "DELETE", "/item", &[("X-Cache-Flush", "1")], "").await?;
    assert_eq!(flush.status, 204);
    assert_eq!(upstream.requests(), 1);

    let after = get(server.addr, "/item", &[]).await?;
    assert_eq!(after.header("cache-status"), Some("miss"));
    assert_eq!(upstream.requests(), 2);

    server.stop().await?;
    store.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn flush_all_clears_every_entry() -> Result<()> {
    let dirs = TestDirs::new()?;
    let store = open_local_store(&dirs.cache_dir).await?;
    let upstream = TestUpstream::ok(CACHEABLE, "bulk").await?;
    let options = CacheOptions {
        flush_target: FlushTarget::All,
        ..CacheOptions::default()
    };
    let server = TestServer::local(options, &store, &upstream).await?;

    get(server.addr, "/one", &[]).await?;
    get(server.addr, "/two", &[]).await?;
    let flush = send_request(server.addr, "DELETE", "/", &[("X-Cache-Flush", "1")], "").await?;
    assert_eq!(flush.status, 204);

    get(server.addr, "/one", &[]).await?;
    get(server.addr, "/two", &[]).await?;
    assert_eq!(upstream.requests(), 4);

    server.stop().await?;
    store.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn unreachable_remote_falls_back_to_local_store() -> Result<()> {
    let closed = TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).await?;
    let remote_url = format!("http://{}", closed.local_addr()?);
    drop(closed);

    let dirs = TestDirs::new()?;
    let store = LocalStore::open(LocalStoreOptions {
        dir: dirs.cache_dir.clone(),
        memory_entries: None,
        sweep_interval: Duration::from_secs(300),
    })
    .await?;
    let registry = BackendRegistry::new(Backend::Remote(RemoteStore::new(&remote_url)?))
        .with_backup(Backend::Local(store.clone()));
    let upstream = TestUpstream::ok(CACHEABLE, "fallback").await?;
    let server = TestServer::start(CacheOptions::default(), registry, &upstream).await?;

    let active = server.registry.active().map(|slot| slot.kind());
    assert_eq!(active, Some("local"));

    get(server.addr, "/fallback", &[]).await?;
    let hit = get(server.addr, "/fallback", &[]).await?;
    assert!(hit.header("cache-status").is_some_and(|s| s.starts_with("hit")));
    assert_eq!(upstream.requests(), 1);

    server.stop().await?;
    store.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn oversized_request_body_is_rejected() -> Result<()> {
    let dirs = TestDirs::new()?;
    let store = open_local_store(&dirs.cache_dir).await?;
    let upstream = TestUpstream::ok(CACHEABLE, "unused").await?;
    let registry = BackendRegistry::new(Backend::Local(store.clone()));
    let server =
        TestServer::start_with_limit(CacheOptions::default(), registry, &upstream, 16).await?;

    let body = "x".repeat(64);
    let response = send_request(server.addr, "POST", "/upload", &[], &body).await?;
    assert_eq!(response.status, 413);
    assert_eq!(upstream.requests(), 0);

    server.stop().await?;
    store.shutdown().await;
    Ok(())
}
