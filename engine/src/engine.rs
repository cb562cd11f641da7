//! The engine facade used by feature code.
//!
//! Every write lands in the replica first, then in the outbox, then (when
//! online with a session) goes out to the origin in the background. Reads
//! are always served locally.

use crate::{
    bus::{Bus, Selector, SubscriptionHandle, ViewState},
    clock::{Clock, SystemClock},
    config::SyncConfig,
    db,
    error::Result,
    flush::{DrainReport, Flusher},
    lifecycle::{LifecycleController, NetworkStatus, Session},
    origin::{HttpOrigin, Origin, RequestContext},
    outbox::{Outbox, OutboxEntry},
    reconcile::{PullOutcome, Reconciler},
    schema::{CollectionSchema, Schema},
    status::SyncStatus,
    store::ReplicaStore,
    CollectionName, Error, Mutation, OperationKind, Record,
};
use serde_json::Value;
use sqlx::SqlitePool;
use std::sync::{Arc, Mutex};
use tokio::task::JoinHandle;
use tracing::{info, warn};

/// Assembles a [`SyncEngine`].
pub struct EngineBuilder {
    config: SyncConfig,
    schema: Schema,
    origin: Option<Arc<dyn Origin>>,
    clock: Arc<dyn Clock>,
    pool: Option<SqlitePool>,
    online: bool,
}

impl EngineBuilder {
    /// Use a custom collection schema instead of the POS preset.
    pub fn schema(mut self, schema: Schema) -> Self {
        self.schema = schema;
        self
    }

    /// Talk to `origin` instead of the HTTP origin at the configured URL.
    pub fn origin(mut self, origin: Arc<dyn Origin>) -> Self {
        self.origin = Some(origin);
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Use an already migrated pool instead of opening the configured URL.
    pub fn pool(mut self, pool: SqlitePool) -> Self {
        self.pool = Some(pool);
        self
    }

    /// Initial connectivity. Defaults to online.
    pub fn online(mut self, online: bool) -> Self {
        self.online = online;
        self
    }

    /// Open the replica and start the background workers.
    ///
    /// Must be called inside a tokio runtime.
    pub async fn build(self) -> Result<SyncEngine> {
        self.config.validate()?;
        let pool = match self.pool {
            Some(pool) => pool,
            None => db::connect(&self.config.database_url).await?,
        };
        let origin: Arc<dyn Origin> = match self.origin {
            Some(origin) => origin,
            None => {
                let client = reqwest::Client::builder()
                    .timeout(self.config.request_timeout)
                    .build()?;
                Arc::new(HttpOrigin::with_client(client, &self.config.api_base_url)?)
            }
        };

        let store = Arc::new(ReplicaStore::new(pool.clone()));
        let outbox = Arc::new(Outbox::new(
            pool,
            self.clock.clone(),
            self.config.max_attempts,
        ));
        let reconciler = Arc::new(Reconciler::new(
            store.clone(),
            origin.clone(),
            self.clock.clone(),
            self.config.request_timeout,
        ));
        let flusher = Arc::new(Flusher::new(
            store.clone(),
            outbox.clone(),
            origin.clone(),
            self.config.request_timeout,
        ));
        let bus = Arc::new(Bus::new(store.clone()));
        let network = NetworkStatus::new(self.online);
        let lifecycle = LifecycleController::new(
            reconciler.clone(),
            flusher.clone(),
            origin.clone(),
            network.clone(),
            self.schema.collection_names(),
            self.config.reconcile_interval,
        );

        let mut tasks = vec![bus.spawn_dispatcher()];
        tasks.extend(flusher.spawn_worker());

        let pending = outbox.pending_count().await?;
        info!(
            collections = self.schema.collections.len(),
            pending,
            online = self.online,
            "sync engine ready"
        );

        Ok(SyncEngine {
            config: self.config,
            schema: Arc::new(self.schema),
            store,
            outbox,
            origin,
            reconciler,
            flusher,
            bus,
            lifecycle,
            network,
            tasks: Mutex::new(tasks),
        })
    }
}

/// Local-first access to the synced collections.
pub struct SyncEngine {
    config: SyncConfig,
    schema: Arc<Schema>,
    store: Arc<ReplicaStore>,
    outbox: Arc<Outbox>,
    origin: Arc<dyn Origin>,
    reconciler: Arc<Reconciler>,
    flusher: Arc<Flusher>,
    bus: Arc<Bus>,
    lifecycle: LifecycleController,
    network: NetworkStatus,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl SyncEngine {
    pub fn builder(config: SyncConfig) -> EngineBuilder {
        EngineBuilder {
            config,
            schema: Schema::pos(),
            origin: None,
            clock: Arc::new(SystemClock),
            pool: None,
            online: true,
        }
    }

    /// Open an engine against the HTTP origin and replica in `config`.
    pub async fn open(config: SyncConfig) -> Result<Self> {
        Self::builder(config).build().await
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub fn schema(&self) -> &Schema {
        &self.schema
    }

    pub fn store(&self) -> &Arc<ReplicaStore> {
        &self.store
    }

    pub fn outbox(&self) -> &Arc<Outbox> {
        &self.outbox
    }

    pub fn bus(&self) -> &Arc<Bus> {
        &self.bus
    }

    pub fn network(&self) -> &NetworkStatus {
        &self.network
    }

    fn collection(&self, name: &str) -> Result<&CollectionSchema> {
        self.schema.resolve(name)
    }

    // Reads

    /// An active record. A temporary id returned by [`create`](Self::create)
    /// still finds the record after the origin assigned its own id.
    pub async fn get(&self, collection: &str, id: &str) -> Result<Option<Record>> {
        let schema = self.collection(collection)?;
        let id = self.store.resolve_id(&schema.name, id).await?;
        self.store.get(&schema.name, &id).await
    }

    /// Every active record of a collection, ordered by id.
    pub async fn list(&self, collection: &str) -> Result<Vec<Record>> {
        let schema = self.collection(collection)?;
        self.store.list(&schema.name).await
    }

    // Writes

    /// Create a record.
    ///
    /// Collections marked online-only are created on the origin right away;
    /// everything else gets a temporary id and is queued.
    pub async fn create(&self, collection: &str, payload: Value) -> Result<Record> {
        let schema = self.collection(collection)?;
        if schema.online_only_create {
            return self.create_online(schema, payload).await;
        }

        let mutation = Mutation::create(payload);
        schema.validate_mutation(&mutation)?;
        let Mutation::Create { temp_id, payload } = &mutation else {
            return Err(Error::InvalidPayload("expected a create".into()));
        };
        let record = Record::new(temp_id.clone(), schema.name.clone(), payload.clone());

        self.store.put(record.clone()).await?;
        if let Err(e) = self.enqueue(&schema.name, &mutation).await {
            // Nothing queued, so nothing may be shown.
            self.store.delete(&schema.name, &record.id).await?;
            return Err(e);
        }
        self.request_flush().await;
        Ok(record)
    }

    /// Apply a partial update locally and queue it.
    pub async fn update(&self, collection: &str, id: &str, patch: Value) -> Result<Record> {
        let schema = self.collection(collection)?;
        let mut mutation = Mutation::update(id, patch);
        schema.validate_mutation(&mutation)?;

        let mut writer = self.store.writer(&schema.name).await;
        let resolved = writer.resolve_id(id).await?;
        mutation.retarget(id, &resolved);
        let id = resolved;
        let Mutation::Update { patch, .. } = &mutation else {
            return Err(Error::InvalidPayload("expected an update".into()));
        };
        let previous = writer
            .get(&id)
            .await?
            .filter(Record::is_active)
            .ok_or_else(|| not_found(&schema.name, &id))?;

        let mut record = previous.clone();
        record.apply_patch(patch);
        writer.put(record.clone()).await?;

        if let Err(e) = self.enqueue(&schema.name, &mutation).await {
            writer.put(previous).await?;
            return Err(e);
        }
        drop(writer);

        self.request_flush().await;
        Ok(record)
    }

    /// Hide a record and queue its delete.
    pub async fn delete(&self, collection: &str, id: &str) -> Result<()> {
        let schema = self.collection(collection)?;

        let mut writer = self.store.writer(&schema.name).await;
        let id = writer.resolve_id(id).await?;
        let mutation = Mutation::delete(&id);
        if !writer.tombstone(&id).await? {
            return Err(not_found(&schema.name, &id));
        }
        if let Err(e) = self.enqueue(&schema.name, &mutation).await {
            if let Some(record) = writer.get(&id).await? {
                writer.put(Record {
                    deleted: false,
                    ..record
                })
                .await?;
            }
            return Err(e);
        }
        drop(writer);

        self.request_flush().await;
        Ok(())
    }

    /// The loose entry point feature code uses: `entity` may be a
    /// collection name or its singular alias.
    ///
    /// Returns the record as it now stands locally, or `None` for deletes.
    pub async fn add_to_queue(
        &self,
        entity: &str,
        operation: OperationKind,
        payload: Value,
    ) -> Result<Option<Record>> {
        match Mutation::from_parts(operation, payload)? {
            Mutation::Create { payload, .. } => self.create(entity, payload).await.map(Some),
            Mutation::Update { id, patch } => self.update(entity, &id, patch).await.map(Some),
            Mutation::Delete { id } => self.delete(entity, &id).await.map(|_| None),
        }
    }

    /// Create a user on the origin.
    ///
    /// The origin mints the invitation token, so this cannot be queued and
    /// fails with [`Error::OnlineOnly`] while offline.
    pub async fn create_user(&self, payload: Value) -> Result<Record> {
        let schema = self.collection("users")?;
        self.create_online(schema, payload).await
    }

    async fn create_online(&self, schema: &CollectionSchema, payload: Value) -> Result<Record> {
        if !self.network.is_online() {
            return Err(Error::OnlineOnly(schema.name.clone()));
        }
        let payload = crate::record::strip_identity(payload);
        schema.validate_payload(&payload)?;

        let ctx = RequestContext::new(self.actor().await);
        let response = tokio::time::timeout(
            self.config.request_timeout,
            self.origin.create(&schema.name, &payload, &ctx),
        )
        .await
        .map_err(|_| Error::timeout(&format!("create in {}", schema.name)))??;

        let record = Record::from_wire(schema.name.clone(), response)
            .map_err(|e| Error::MalformedResponse(e.to_string()))?;
        self.store.put(record.clone()).await?;
        info!(collection = %schema.name, id = %record.id, "created online");
        Ok(record)
    }

    async fn enqueue(&self, collection: &str, mutation: &Mutation) -> Result<OutboxEntry> {
        let actor = self.actor().await;
        self.outbox
            .enqueue(collection, mutation, actor.as_deref())
            .await
    }

    async fn actor(&self) -> Option<String> {
        self.lifecycle.session().await.map(|s| s.user_id)
    }

    async fn request_flush(&self) {
        if self.network.is_online() && self.lifecycle.is_active().await {
            self.flusher.signal();
        }
    }

    // Sync

    /// Pull one collection now.
    pub async fn populate(&self, collection: &str) -> Result<PullOutcome> {
        let schema = self.collection(collection)?;
        self.reconciler.reconcile_pull(&schema.name).await
    }

    /// Pull every collection now.
    pub async fn populate_all(&self) -> Vec<(CollectionName, Result<PullOutcome>)> {
        self.reconciler
            .reconcile_all(&self.schema.collection_names())
            .await
    }

    /// Drain the outbox now, regardless of session and connectivity.
    pub async fn flush(&self) -> Result<DrainReport> {
        self.flusher.drain().await
    }

    /// Start syncing for `session`. Returns false if already started.
    pub async fn start(&self, session: Session) -> bool {
        self.lifecycle.start(session).await
    }

    /// Stop syncing. Returns false if not started.
    pub async fn stop(&self) -> bool {
        self.lifecycle.stop().await
    }

    /// Report connectivity. Returns whether it changed.
    pub fn set_online(&self, online: bool) -> bool {
        let changed = self.network.set_online(online);
        if changed {
            info!(online, "connectivity changed");
        }
        changed
    }

    pub fn is_online(&self) -> bool {
        self.network.is_online()
    }

    pub async fn status(&self) -> Result<SyncStatus> {
        Ok(SyncStatus {
            online: self.network.is_online(),
            session_active: self.lifecycle.is_active().await,
            pending: self.outbox.pending_count().await?,
            parked: self.outbox.parked_count().await?,
            last_pulled: self.reconciler.last_pulled_any().await?,
        })
    }

    // Outbox maintenance

    /// Entries waiting for delivery.
    pub async fn pending_entries(&self) -> Result<Vec<OutboxEntry>> {
        self.outbox.pending().await
    }

    /// Entries parked after repeated rejection.
    pub async fn stuck_entries(&self) -> Result<Vec<OutboxEntry>> {
        self.outbox.parked().await
    }

    /// Put parked entries back in line and try them again.
    pub async fn retry_parked(&self) -> Result<usize> {
        let count = self.outbox.retry_parked().await?;
        if count > 0 {
            info!(count, "retrying parked outbox entries");
            self.request_flush().await;
        }
        Ok(count)
    }

    /// Give up on an entry.
    ///
    /// The local effect is rolled back as far as the replica can tell:
    /// a discarded create removes its record and every entry queued behind
    /// it, a discarded delete shows the record again, and a discarded update
    /// lets the next pull restore the origin's copy.
    pub async fn discard(&self, seq: i64) -> Result<Option<OutboxEntry>> {
        let Some(entry) = self.outbox.discard(seq).await? else {
            return Ok(None);
        };
        let collection = entry.entity.as_str();
        let id = entry.mutation.record_id();
        let mut writer = self.store.writer(collection).await;

        match &entry.mutation {
            Mutation::Create { .. } => {
                for later in self.outbox.entries_for(collection, id, entry.seq).await? {
                    self.outbox.remove(later.seq).await?;
                }
                writer.delete(id).await?;
            }
            Mutation::Delete { .. } => {
                if let Some(record) = writer.get(id).await? {
                    writer.put(Record {
                        deleted: false,
                        ..record
                    })
                    .await?;
                }
            }
            Mutation::Update { .. } => {
                let still_queued = !self.outbox.entries_for(collection, id, 0).await?.is_empty();
                if let Some(record) = writer.get(id).await?.filter(|_| !still_queued) {
                    writer.put(Record {
                        updated_at: None,
                        ..record
                    })
                    .await?;
                }
            }
        }

        warn!(seq, entity = collection, id = %id, "outbox entry discarded");
        Ok(Some(entry))
    }

    // Subscriptions

    /// Watch a view. Collection aliases in the selector are resolved.
    pub async fn subscribe<F>(&self, selector: Selector, callback: F) -> Result<SubscriptionHandle>
    where
        F: Fn(&ViewState) + Send + Sync + 'static,
    {
        let selector = self.canonical(selector)?;
        Ok(self.bus.subscribe(selector, callback).await)
    }

    /// Watch the translation tree for `locale`.
    pub async fn subscribe_translations<F>(&self, locale: &str, callback: F) -> SubscriptionHandle
    where
        F: Fn(&ViewState) + Send + Sync + 'static,
    {
        let selector = Selector::translations(locale, self.config.default_locale.clone());
        self.bus.subscribe(selector, callback).await
    }

    pub fn unsubscribe(&self, handle: SubscriptionHandle) -> bool {
        self.bus.unsubscribe(handle)
    }

    pub async fn update_selector(
        &self,
        handle: SubscriptionHandle,
        selector: Selector,
    ) -> Result<bool> {
        let selector = self.canonical(selector)?;
        Ok(self.bus.update_selector(handle, selector).await)
    }

    pub async fn set_locale(&self, handle: SubscriptionHandle, locale: &str) -> bool {
        self.bus.set_locale(handle, locale).await
    }

    fn canonical(&self, selector: Selector) -> Result<Selector> {
        match selector {
            Selector::Records {
                collection,
                filter,
                sort_by,
            } => Ok(Selector::Records {
                collection: self.collection(&collection)?.name.clone(),
                filter,
                sort_by,
            }),
            translations => Ok(translations),
        }
    }

    /// Stop syncing and the background workers.
    pub async fn shutdown(&self) {
        self.lifecycle.stop().await;
        for task in self.tasks.lock().unwrap_or_else(|e| e.into_inner()).drain(..) {
            task.abort();
        }
        info!("sync engine shut down");
    }
}

impl Drop for SyncEngine {
    fn drop(&mut self) {
        for task in self.tasks.lock().unwrap_or_else(|e| e.into_inner()).drain(..) {
            task.abort();
        }
    }
}

fn not_found(collection: &str, id: &str) -> Error {
    Error::RecordNotFound {
        collection: collection.to_string(),
        id: id.to_string(),
    }
}
