//! Shared helpers for integration tests.

#![allow(dead_code)]

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use till_sync_engine::{
    MemoryOrigin, PullOutcome, ReplicaStore, Result, SyncConfig, SyncEngine,
};

/// Config with an in-memory replica and a cadence slow enough that only the
/// eager pull runs during a test.
pub fn test_config() -> SyncConfig {
    SyncConfig::default()
        .with_database_url("sqlite::memory:")
        .with_reconcile_interval(Duration::from_secs(3600))
        .with_request_timeout(Duration::from_secs(2))
}

pub async fn engine(origin: Arc<MemoryOrigin>, online: bool) -> SyncEngine {
    engine_with(test_config(), origin, online).await
}

pub async fn engine_with(config: SyncConfig, origin: Arc<MemoryOrigin>, online: bool) -> SyncEngine {
    SyncEngine::builder(config)
        .origin(origin)
        .online(online)
        .build()
        .await
        .expect("engine should build")
}

/// Poll `check` until it holds or two seconds pass.
pub async fn eventually<F, Fut>(what: &str, mut check: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    for _ in 0..200 {
        if check().await {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("timed out waiting for {what}");
}

/// Pull a collection, waiting out any pull already in flight.
pub async fn pull(engine: &SyncEngine, collection: &str) -> Result<PullOutcome> {
    loop {
        match engine.populate(collection).await? {
            PullOutcome::Coalesced => tokio::time::sleep(Duration::from_millis(10)).await,
            merged => return Ok(merged),
        }
    }
}

pub async fn names(store: &ReplicaStore, collection: &str) -> Vec<String> {
    store
        .list(collection)
        .await
        .unwrap()
        .into_iter()
        .map(|r| r.payload["name"].as_str().unwrap_or_default().to_string())
        .collect()
}
