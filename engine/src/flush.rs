//! Outbox delivery.
//!
//! The [`Flusher`] drains the outbox head first. A failed entry blocks
//! everything behind it until it succeeds or is parked.

use crate::{
    error::Result,
    operation::is_temporary_id,
    origin::{Origin, RequestContext},
    outbox::{Outbox, OutboxEntry},
    store::ReplicaStore,
    Error, Mutation, Record,
};
use std::future::Future;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// What a drain accomplished.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DrainReport {
    /// Entries acknowledged and removed
    pub delivered: usize,
    /// Entries parked during this drain
    pub parked: usize,
    /// Entries still in line afterwards
    pub remaining: usize,
    /// Why the drain stopped early
    pub blocked_by: Option<Error>,
}

impl DrainReport {
    pub fn is_complete(&self) -> bool {
        self.remaining == 0
    }
}

/// Delivers outbox entries to the origin.
pub struct Flusher {
    store: Arc<ReplicaStore>,
    outbox: Arc<Outbox>,
    origin: Arc<dyn Origin>,
    request_timeout: Duration,
    draining: Mutex<()>,
    signals: mpsc::Sender<()>,
    receiver: std::sync::Mutex<Option<mpsc::Receiver<()>>>,
}

impl Flusher {
    pub fn new(
        store: Arc<ReplicaStore>,
        outbox: Arc<Outbox>,
        origin: Arc<dyn Origin>,
        request_timeout: Duration,
    ) -> Self {
        // One slot: a signal sent while another is pending adds nothing.
        let (signals, receiver) = mpsc::channel(1);
        Self {
            store,
            outbox,
            origin,
            request_timeout,
            draining: Mutex::new(()),
            signals,
            receiver: std::sync::Mutex::new(Some(receiver)),
        }
    }

    /// Ask the worker for a drain. Never blocks.
    pub fn signal(&self) {
        let _ = self.signals.try_send(());
    }

    /// Spawn the worker that drains on every signal.
    ///
    /// Only the first call spawns anything. The worker exits once the
    /// flusher is dropped.
    pub fn spawn_worker(self: &Arc<Self>) -> Option<JoinHandle<()>> {
        let mut receiver = self
            .receiver
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()?;
        let flusher = Arc::downgrade(self);

        Some(tokio::spawn(async move {
            while receiver.recv().await.is_some() {
                let Some(flusher) = Weak::upgrade(&flusher) else {
                    break;
                };
                match flusher.drain().await {
                    Ok(report) if report.delivered > 0 || report.parked > 0 => {
                        info!(
                            delivered = report.delivered,
                            parked = report.parked,
                            remaining = report.remaining,
                            "outbox drained"
                        );
                    }
                    Ok(_) => {}
                    Err(e) => error!(error = %e, "outbox drain failed"),
                }
            }
            debug!("flush worker stopped");
        }))
    }

    /// Deliver entries in order until the outbox is empty or an entry fails.
    ///
    /// Concurrent drains run one after the other. Origin failures end the
    /// drain and are reported; local storage failures are returned.
    pub async fn drain(&self) -> Result<DrainReport> {
        let _draining = self.draining.lock().await;
        let mut report = DrainReport::default();

        while let Some(entry) = self.outbox.head().await? {
            if let Some(reason) = self.blocked_on_parked_create(&entry).await? {
                warn!(seq = entry.seq, entity = %entry.entity, %reason, "parking outbox entry");
                self.outbox.park(entry.seq, &reason).await?;
                report.parked += 1;
                continue;
            }

            match self.deliver(&entry).await {
                Ok(()) => {
                    self.outbox.remove(entry.seq).await?;
                    report.delivered += 1;
                    debug!(seq = entry.seq, entity = %entry.entity, "outbox entry delivered");
                }
                Err(e) if e.is_origin_failure() => {
                    let attempts = entry.attempts + 1;
                    let park = self.outbox.should_park(&e, attempts);
                    self.outbox.record_failure(entry.seq, &e, park).await?;

                    if park {
                        warn!(
                            seq = entry.seq,
                            entity = %entry.entity,
                            attempts,
                            error = %e,
                            "outbox entry stuck, parking it"
                        );
                        report.parked += 1;
                        continue;
                    }

                    warn!(
                        seq = entry.seq,
                        entity = %entry.entity,
                        attempts,
                        error = %e,
                        "outbox delivery failed"
                    );
                    report.blocked_by = Some(e);
                    break;
                }
                Err(e) => return Err(e),
            }
        }

        report.remaining = self.outbox.pending_count().await?;
        Ok(report)
    }

    /// An update or delete of a record whose create is parked cannot reach
    /// the origin under any id.
    async fn blocked_on_parked_create(&self, entry: &OutboxEntry) -> Result<Option<String>> {
        let id = entry.mutation.record_id();
        if matches!(entry.mutation, Mutation::Create { .. }) || !is_temporary_id(id) {
            return Ok(None);
        }
        Ok(self
            .outbox
            .create_for(&entry.entity, id)
            .await?
            .filter(|create| create.parked)
            .map(|create| format!("create #{} of {id} is parked", create.seq)))
    }

    async fn deliver(&self, entry: &OutboxEntry) -> Result<()> {
        let collection = entry.entity.as_str();
        let ctx = RequestContext::new(entry.actor.clone());

        match &entry.mutation {
            Mutation::Create { temp_id, payload } => {
                let ctx = ctx.with_idempotency_key(temp_id);
                let response = self
                    .timed("create", self.origin.create(collection, payload, &ctx))
                    .await?;
                let created = parse_ack(collection, response)?;
                self.ack_create(entry, temp_id, created).await
            }
            Mutation::Update { id, patch } => {
                let response = self
                    .timed("update", self.origin.update(collection, id, patch, &ctx))
                    .await?;
                let updated = parse_ack(collection, response)?;
                self.ack_update(entry, updated).await
            }
            Mutation::Delete { id } => {
                self.timed("delete", self.origin.delete(collection, id, &ctx))
                    .await?;
                self.store.delete(collection, id).await?;
                Ok(())
            }
        }
    }

    async fn timed<T>(&self, what: &str, call: impl Future<Output = Result<T>>) -> Result<T> {
        tokio::time::timeout(self.request_timeout, call)
            .await
            .map_err(|_| Error::timeout(what))?
    }

    async fn ack_create(&self, entry: &OutboxEntry, temp_id: &str, created: Record) -> Result<()> {
        let collection = entry.entity.as_str();
        let server_id = created.id.clone();
        let mut writer = self.store.writer(collection).await;
        let edited_later = self
            .outbox
            .has_pending_for(collection, temp_id, entry.seq)
            .await?;

        // Later entries will re-apply their changes; keep what the user sees.
        let record = match writer.get(temp_id).await? {
            Some(local) if edited_later => Record {
                id: server_id.clone(),
                updated_at: created.updated_at,
                ..local
            },
            _ => created,
        };

        writer.remap_id(temp_id, record).await?;
        let rewritten = self.outbox.retarget(collection, temp_id, &server_id).await?;
        info!(
            entity = collection,
            temp_id,
            id = %server_id,
            rewritten,
            "create acknowledged"
        );
        Ok(())
    }

    async fn ack_update(&self, entry: &OutboxEntry, updated: Record) -> Result<()> {
        let collection = entry.entity.as_str();
        let mut writer = self.store.writer(collection).await;
        let local = writer.get(&updated.id).await?;
        let edited_later = self
            .outbox
            .has_pending_for(collection, &updated.id, entry.seq)
            .await?;

        let record = match local {
            Some(local) if edited_later => Record {
                updated_at: updated.updated_at,
                ..local
            },
            Some(local) => Record {
                deleted: local.deleted,
                ..updated
            },
            None => updated,
        };
        writer.put(record).await
    }
}

fn parse_ack(collection: &str, response: serde_json::Value) -> Result<Record> {
    Record::from_wire(collection, response)
        .map_err(|e| Error::MalformedResponse(format!("acknowledgement for {collection}: {e}")))
}
