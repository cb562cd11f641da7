//! Pull reconciliation.
//!
//! The origin is authoritative, but the replica may hold writes the origin
//! has not seen yet. A pull therefore merges rather than overwrites.
//!
//! # Algorithm
//!
//! For every record in the origin's snapshot:
//!
//! 1. No local copy: insert it.
//! 2. Same payload and `updatedAt`: nothing to do, no change event.
//! 3. Local copy never acknowledged (no `updatedAt`): the remote copy wins.
//! 4. Remote copy lacks `updatedAt` but the local one has it: keep local.
//! 5. Otherwise the strictly newer `updatedAt` wins; ties keep local.
//!
//! Records absent from the snapshot are left alone. A pull never deletes.

use crate::{
    clock::Clock,
    error::Result,
    origin::Origin,
    record::{format_timestamp, parse_timestamp},
    store::ReplicaStore,
    CollectionName, Error, Record, Timestamp,
};
use dashmap::DashMap;
use serde::Serialize;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// How one remote record is merged.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum MergeDecision {
    /// No local copy
    Insert,
    /// Remote copy is newer
    Replace,
    /// Local copy is newer or the remote one is unversioned
    KeepLocal,
    /// Both copies are identical
    Unchanged,
}

/// Decide how to merge `remote` into the replica.
pub fn decide(local: Option<&Record>, remote: &Record) -> MergeDecision {
    let Some(local) = local else {
        return MergeDecision::Insert;
    };

    if local.payload == remote.payload && local.updated_at == remote.updated_at {
        return MergeDecision::Unchanged;
    }

    match (local.updated_at, remote.updated_at) {
        (None, _) => MergeDecision::Replace,
        (Some(_), None) => MergeDecision::KeepLocal,
        (Some(local_at), Some(remote_at)) if remote_at > local_at => MergeDecision::Replace,
        (Some(_), Some(_)) => MergeDecision::KeepLocal,
    }
}

/// Counts of merge decisions for one snapshot.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MergeReport {
    pub inserted: usize,
    pub replaced: usize,
    pub kept_local: usize,
    pub unchanged: usize,
    /// Remote records that could not be parsed
    pub skipped: usize,
}

impl MergeReport {
    fn count(&mut self, decision: MergeDecision) {
        match decision {
            MergeDecision::Insert => self.inserted += 1,
            MergeDecision::Replace => self.replaced += 1,
            MergeDecision::KeepLocal => self.kept_local += 1,
            MergeDecision::Unchanged => self.unchanged += 1,
        }
    }

    /// Records written to the replica.
    pub fn written(&self) -> usize {
        self.inserted + self.replaced
    }
}

/// Result of a pull request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PullOutcome {
    /// The snapshot was fetched and merged
    Merged(MergeReport),
    /// A pull of the same collection was already running
    Coalesced,
}

impl PullOutcome {
    pub fn report(&self) -> Option<&MergeReport> {
        match self {
            PullOutcome::Merged(report) => Some(report),
            PullOutcome::Coalesced => None,
        }
    }
}

/// Pulls snapshots from the origin and merges them into the replica.
pub struct Reconciler {
    store: Arc<ReplicaStore>,
    origin: Arc<dyn Origin>,
    clock: Arc<dyn Clock>,
    request_timeout: Duration,
    in_flight: DashMap<CollectionName, Arc<Mutex<()>>>,
}

impl Reconciler {
    pub fn new(
        store: Arc<ReplicaStore>,
        origin: Arc<dyn Origin>,
        clock: Arc<dyn Clock>,
        request_timeout: Duration,
    ) -> Self {
        Self {
            store,
            origin,
            clock,
            request_timeout,
            in_flight: DashMap::new(),
        }
    }

    /// Fetch one collection and merge it.
    ///
    /// A call made while the same collection is already being pulled returns
    /// [`PullOutcome::Coalesced`] at once.
    pub async fn reconcile_pull(&self, collection: &str) -> Result<PullOutcome> {
        let lock = self
            .in_flight
            .entry(collection.to_string())
            .or_default()
            .clone();
        let Ok(_pulling) = lock.try_lock_owned() else {
            debug!(collection, "pull already running, coalescing");
            return Ok(PullOutcome::Coalesced);
        };

        let snapshot = tokio::time::timeout(self.request_timeout, self.origin.fetch_all(collection))
            .await
            .map_err(|_| Error::timeout(&format!("pull of {collection}")))??;

        let report = self.merge_snapshot(collection, snapshot).await?;
        self.record_pull(collection).await?;

        if report.written() > 0 || report.skipped > 0 {
            info!(
                collection,
                inserted = report.inserted,
                replaced = report.replaced,
                kept_local = report.kept_local,
                skipped = report.skipped,
                "pull merged"
            );
        } else {
            debug!(collection, unchanged = report.unchanged, "pull found nothing new");
        }
        Ok(PullOutcome::Merged(report))
    }

    /// Pull several collections concurrently.
    ///
    /// Failures are logged and reported per collection; they never stop the
    /// other pulls.
    pub async fn reconcile_all(
        &self,
        collections: &[CollectionName],
    ) -> Vec<(CollectionName, Result<PullOutcome>)> {
        let pulls = collections.iter().map(|collection| async move {
            let outcome = self.reconcile_pull(collection).await;
            if let Err(e) = &outcome {
                warn!(collection = %collection, error = %e, "pull failed");
            }
            (collection.clone(), outcome)
        });
        futures::future::join_all(pulls).await
    }

    /// Merge an already fetched snapshot under the collection's write lock.
    pub async fn merge_snapshot(&self, collection: &str, snapshot: Vec<Value>) -> Result<MergeReport> {
        let mut writer = self.store.writer(collection).await;
        let mut report = MergeReport::default();

        for raw in snapshot {
            let remote = match Record::from_wire(collection, raw) {
                Ok(remote) => remote,
                Err(e) => {
                    warn!(collection, error = %e, "skipping malformed remote record");
                    report.skipped += 1;
                    continue;
                }
            };

            let local = writer.get(&remote.id).await?;
            let decision = decide(local.as_ref(), &remote);
            report.count(decision);

            match decision {
                MergeDecision::Insert => writer.put(remote).await?,
                // A pending local delete outlives the newer remote copy.
                MergeDecision::Replace => {
                    let deleted = local.is_some_and(|l| l.deleted);
                    writer.put(Record { deleted, ..remote }).await?
                }
                MergeDecision::KeepLocal | MergeDecision::Unchanged => {}
            }
        }

        Ok(report)
    }

    async fn record_pull(&self, collection: &str) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO sync_meta (collection, last_pulled_at) VALUES (?, ?)
            ON CONFLICT (collection) DO UPDATE SET last_pulled_at = excluded.last_pulled_at
            "#,
        )
        .bind(collection)
        .bind(format_timestamp(self.clock.now()))
        .execute(self.store.pool())
        .await?;
        Ok(())
    }

    /// When a collection was last pulled successfully.
    pub async fn last_pulled(&self, collection: &str) -> Result<Option<Timestamp>> {
        let raw: Option<String> =
            sqlx::query_scalar("SELECT last_pulled_at FROM sync_meta WHERE collection = ?")
                .bind(collection)
                .fetch_optional(self.store.pool())
                .await?;
        raw.as_deref()
            .map(parse_timestamp)
            .transpose()
            .map_err(|e| Error::Storage(e.to_string()))
    }

    /// The most recent successful pull of any collection.
    pub async fn last_pulled_any(&self) -> Result<Option<Timestamp>> {
        let raw: Vec<String> = sqlx::query_scalar("SELECT last_pulled_at FROM sync_meta")
            .fetch_all(self.store.pool())
            .await?;
        let mut latest = None;
        for value in raw {
            let ts = parse_timestamp(&value).map_err(|e| Error::Storage(e.to_string()))?;
            latest = latest.max(Some(ts));
        }
        Ok(latest)
    }
}
