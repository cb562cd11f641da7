//! Replica store - the local copy of every synced collection.
//!
//! Reads made by the rest of the application while offline are served from
//! here. Every successful write emits a [`ChangeEvent`] that the reactive
//! bus fans out to subscribers.

use crate::{
    error::Result,
    record::{format_timestamp, parse_timestamp},
    CollectionName, Error, Record, RecordId,
};
use dashmap::DashMap;
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};
use std::sync::Arc;
use tokio::sync::{broadcast, Mutex, OwnedMutexGuard};

/// Capacity of the change channel before slow receivers start lagging.
const CHANGE_CHANNEL_CAPACITY: usize = 1024;

/// What happened to a record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChangeKind {
    /// Inserted, replaced or tombstoned
    Upserted,
    /// Physically removed
    Deleted,
}

/// A committed change to the replica.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ChangeEvent {
    pub collection: CollectionName,
    pub id: RecordId,
    pub kind: ChangeKind,
}

/// A stored record row from the database.
#[derive(Debug)]
struct StoredRecord {
    collection: String,
    id: String,
    payload: String,
    updated_at: Option<String>,
    deleted: bool,
}

impl<'r> sqlx::FromRow<'r, SqliteRow> for StoredRecord {
    fn from_row(row: &'r SqliteRow) -> std::result::Result<Self, sqlx::Error> {
        Ok(StoredRecord {
            collection: row.try_get("collection")?,
            id: row.try_get("id")?,
            payload: row.try_get("payload")?,
            updated_at: row.try_get("updated_at")?,
            deleted: row.try_get("deleted")?,
        })
    }
}

impl StoredRecord {
    fn into_record(self) -> Result<Record> {
        let payload = serde_json::from_str(&self.payload).map_err(|e| {
            Error::Storage(format!(
                "corrupt payload for {}/{}: {e}",
                self.collection, self.id
            ))
        })?;
        let updated_at = self
            .updated_at
            .as_deref()
            .map(parse_timestamp)
            .transpose()
            .map_err(|e| Error::Storage(e.to_string()))?;

        Ok(Record {
            id: self.id,
            collection: self.collection,
            payload,
            updated_at,
            deleted: self.deleted,
        })
    }
}

/// The local datastore.
///
/// Reads are lock-free; writes to one collection are serialized through a
/// per-collection lock so a read-compare-write (a merge, an optimistic
/// update) sees no interleaved writer.
pub struct ReplicaStore {
    pool: SqlitePool,
    events: broadcast::Sender<ChangeEvent>,
    locks: DashMap<CollectionName, Arc<Mutex<()>>>,
}

impl ReplicaStore {
    /// Create a store over an already migrated pool.
    pub fn new(pool: SqlitePool) -> Self {
        let (events, _) = broadcast::channel(CHANGE_CHANNEL_CAPACITY);
        Self {
            pool,
            events,
            locks: DashMap::new(),
        }
    }

    /// The underlying pool.
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Receive every change committed from now on.
    pub fn subscribe_changes(&self) -> broadcast::Receiver<ChangeEvent> {
        self.events.subscribe()
    }

    /// Take the write lock of a collection.
    pub async fn writer(&self, collection: &str) -> CollectionWriter<'_> {
        let lock = self
            .locks
            .entry(collection.to_string())
            .or_default()
            .clone();
        CollectionWriter {
            store: self,
            collection: collection.to_string(),
            _guard: lock.lock_owned().await,
        }
    }

    /// Get an active record by collection and ID.
    pub async fn get(&self, collection: &str, id: &str) -> Result<Option<Record>> {
        Ok(self
            .get_including_deleted(collection, id)
            .await?
            .filter(|r| r.is_active()))
    }

    /// The id a record is stored under now. Temporary ids that were swapped
    /// on ack map to the origin id; anything else is returned as is.
    pub async fn resolve_id(&self, collection: &str, id: &str) -> Result<RecordId> {
        let server_id: Option<String> = sqlx::query_scalar(
            "SELECT server_id FROM id_aliases WHERE collection = ? AND temp_id = ?",
        )
        .bind(collection)
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(server_id.unwrap_or_else(|| id.to_string()))
    }

    /// Get a record including tombstoned ones.
    pub async fn get_including_deleted(
        &self,
        collection: &str,
        id: &str,
    ) -> Result<Option<Record>> {
        let row: Option<StoredRecord> = sqlx::query_as(
            r#"
            SELECT collection, id, payload, updated_at, deleted
            FROM records
            WHERE collection = ? AND id = ?
            "#,
        )
        .bind(collection)
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(StoredRecord::into_record).transpose()
    }

    /// All active records of a collection, ordered by id.
    pub async fn list(&self, collection: &str) -> Result<Vec<Record>> {
        let rows: Vec<StoredRecord> = sqlx::query_as(
            r#"
            SELECT collection, id, payload, updated_at, deleted
            FROM records
            WHERE collection = ? AND deleted = 0
            ORDER BY id
            "#,
        )
        .bind(collection)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(StoredRecord::into_record).collect()
    }

    /// Active records of a collection matching a predicate.
    pub async fn list_where<F>(&self, collection: &str, predicate: F) -> Result<Vec<Record>>
    where
        F: Fn(&Record) -> bool,
    {
        let mut records = self.list(collection).await?;
        records.retain(|r| predicate(r));
        Ok(records)
    }

    /// Count active records in a collection.
    pub async fn count(&self, collection: &str) -> Result<usize> {
        let count: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM records WHERE collection = ? AND deleted = 0")
                .bind(collection)
                .fetch_one(&self.pool)
                .await?;
        Ok(count as usize)
    }

    /// Insert or replace a record.
    pub async fn put(&self, record: Record) -> Result<()> {
        let collection = record.collection.clone();
        self.writer(&collection).await.put(record).await
    }

    /// Physically remove a record. Returns whether it existed.
    pub async fn delete(&self, collection: &str, id: &str) -> Result<bool> {
        self.writer(collection).await.delete(id).await
    }

    /// Hide a record until its delete is acknowledged. Returns whether an
    /// active record was tombstoned.
    pub async fn tombstone(&self, collection: &str, id: &str) -> Result<bool> {
        self.writer(collection).await.tombstone(id).await
    }

    /// Replace a record stored under a temporary id with the origin's copy.
    ///
    /// A tombstone on the temporary record carries over, since its delete is
    /// still queued behind the create.
    pub async fn remap_id(&self, collection: &str, temp_id: &str, record: Record) -> Result<()> {
        self.writer(collection)
            .await
            .remap_id(temp_id, record)
            .await
    }

    fn emit(&self, collection: &str, id: &str, kind: ChangeKind) {
        // No receivers is fine: nobody is watching yet.
        let _ = self.events.send(ChangeEvent {
            collection: collection.to_string(),
            id: id.to_string(),
            kind,
        });
    }

    async fn upsert_row(&self, record: &Record) -> Result<()> {
        let payload = serde_json::to_string(&record.payload)
            .map_err(|e| Error::Storage(format!("cannot encode payload: {e}")))?;

        sqlx::query(
            r#"
            INSERT INTO records (collection, id, payload, updated_at, deleted)
            VALUES (?, ?, ?, ?, ?)
            ON CONFLICT (collection, id) DO UPDATE SET
                payload = excluded.payload,
                updated_at = excluded.updated_at,
                deleted = excluded.deleted
            "#,
        )
        .bind(&record.collection)
        .bind(&record.id)
        .bind(payload)
        .bind(record.updated_at.map(format_timestamp))
        .bind(record.deleted)
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}

/// Exclusive write access to one collection.
///
/// Writes go through a writer so callers can read, decide and write without
/// another writer slipping in between.
pub struct CollectionWriter<'a> {
    store: &'a ReplicaStore,
    collection: CollectionName,
    _guard: OwnedMutexGuard<()>,
}

impl CollectionWriter<'_> {
    /// The collection this writer owns.
    pub fn collection(&self) -> &str {
        &self.collection
    }

    pub async fn resolve_id(&self, id: &str) -> Result<RecordId> {
        self.store.resolve_id(&self.collection, id).await
    }

    /// Read a record, tombstoned or not.
    pub async fn get(&self, id: &str) -> Result<Option<Record>> {
        self.store.get_including_deleted(&self.collection, id).await
    }

    /// Insert or replace a record.
    pub async fn put(&mut self, record: Record) -> Result<()> {
        if record.collection != self.collection {
            return Err(Error::InvalidPayload(format!(
                "record {} belongs to {}, not {}",
                record.id, record.collection, self.collection
            )));
        }
        self.store.upsert_row(&record).await?;
        self.store
            .emit(&self.collection, &record.id, ChangeKind::Upserted);
        Ok(())
    }

    /// Physically remove a record.
    pub async fn delete(&mut self, id: &str) -> Result<bool> {
        let result = sqlx::query("DELETE FROM records WHERE collection = ? AND id = ?")
            .bind(&self.collection)
            .bind(id)
            .execute(&self.store.pool)
            .await?;

        let existed = result.rows_affected() > 0;
        if existed {
            self.store.emit(&self.collection, id, ChangeKind::Deleted);
        }
        Ok(existed)
    }

    /// Tombstone an active record.
    pub async fn tombstone(&mut self, id: &str) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE records SET deleted = 1 WHERE collection = ? AND id = ? AND deleted = 0",
        )
        .bind(&self.collection)
        .bind(id)
        .execute(&self.store.pool)
        .await?;

        let changed = result.rows_affected() > 0;
        if changed {
            self.store.emit(&self.collection, id, ChangeKind::Upserted);
        }
        Ok(changed)
    }

    /// Swap a temporary-id record for the origin's copy in one transaction.
    pub async fn remap_id(&mut self, temp_id: &str, mut record: Record) -> Result<()> {
        let previous = self.get(temp_id).await?;
        if let Some(previous) = &previous {
            record.deleted = record.deleted || previous.deleted;
        }

        let payload = serde_json::to_string(&record.payload)
            .map_err(|e| Error::Storage(format!("cannot encode payload: {e}")))?;

        let mut tx = self.store.pool.begin().await?;
        sqlx::query("DELETE FROM records WHERE collection = ? AND id = ?")
            .bind(&self.collection)
            .bind(temp_id)
            .execute(&mut *tx)
            .await?;
        sqlx::query(
            r#"
            INSERT INTO records (collection, id, payload, updated_at, deleted)
            VALUES (?, ?, ?, ?, ?)
            ON CONFLICT (collection, id) DO UPDATE SET
                payload = excluded.payload,
                updated_at = excluded.updated_at,
                deleted = excluded.deleted
            "#,
        )
        .bind(&self.collection)
        .bind(&record.id)
        .bind(payload)
        .bind(record.updated_at.map(format_timestamp))
        .bind(record.deleted)
        .execute(&mut *tx)
        .await?;
        if temp_id != record.id {
            sqlx::query(
                r#"
                INSERT INTO id_aliases (collection, temp_id, server_id)
                VALUES (?, ?, ?)
                ON CONFLICT (collection, temp_id) DO UPDATE SET server_id = excluded.server_id
                "#,
            )
            .bind(&self.collection)
            .bind(temp_id)
            .bind(&record.id)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;

        if previous.is_some() && temp_id != record.id {
            self.store.emit(&self.collection, temp_id, ChangeKind::Deleted);
        }
        self.store
            .emit(&self.collection, &record.id, ChangeKind::Upserted);
        Ok(())
    }
}
