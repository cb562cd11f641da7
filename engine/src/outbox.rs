//! Durable queue of mutations awaiting acknowledgement by the origin.
//!
//! Entries are delivered strictly in `seq` order. An entry leaves the queue
//! only once the origin accepted it, or when an operator discards it.

use crate::{
    clock::Clock,
    error::Result,
    record::{format_timestamp, parse_timestamp},
    CollectionName, Error, Mutation, RecordId, Timestamp,
};
use serde::Serialize;
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};
use std::sync::Arc;

/// A queued mutation.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OutboxEntry {
    /// Delivery order
    pub seq: i64,
    /// Target collection
    pub entity: CollectionName,
    pub mutation: Mutation,
    /// User who made the change
    pub actor: Option<String>,
    pub enqueued_at: Timestamp,
    /// Failed delivery attempts so far
    pub attempts: u32,
    /// Taken out of the delivery line after repeated rejection
    pub parked: bool,
    pub last_error: Option<String>,
}

impl<'r> sqlx::FromRow<'r, SqliteRow> for OutboxEntry {
    fn from_row(row: &'r SqliteRow) -> std::result::Result<Self, sqlx::Error> {
        let mutation: String = row.try_get("mutation")?;
        let mutation = serde_json::from_str(&mutation).map_err(|e| sqlx::Error::ColumnDecode {
            index: "mutation".into(),
            source: Box::new(e),
        })?;
        let enqueued_at: String = row.try_get("enqueued_at")?;
        let enqueued_at =
            parse_timestamp(&enqueued_at).map_err(|e| sqlx::Error::ColumnDecode {
                index: "enqueued_at".into(),
                source: Box::new(e),
            })?;
        let attempts: i64 = row.try_get("attempts")?;

        Ok(OutboxEntry {
            seq: row.try_get("seq")?,
            entity: row.try_get("entity")?,
            mutation,
            actor: row.try_get("actor")?,
            enqueued_at,
            attempts: attempts.max(0) as u32,
            parked: row.try_get("parked")?,
            last_error: row.try_get("last_error")?,
        })
    }
}

const SELECT_ENTRY: &str = r#"
    SELECT seq, entity, mutation, actor, enqueued_at, attempts, parked, last_error
    FROM outbox
"#;

/// The outbox table.
pub struct Outbox {
    pool: SqlitePool,
    clock: Arc<dyn Clock>,
    max_attempts: u32,
}

impl Outbox {
    pub fn new(pool: SqlitePool, clock: Arc<dyn Clock>, max_attempts: u32) -> Self {
        Self {
            pool,
            clock,
            max_attempts: max_attempts.max(1),
        }
    }

    /// Rejections tolerated before an entry is parked.
    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Append a mutation. Never touches the network.
    pub async fn enqueue(
        &self,
        entity: &str,
        mutation: &Mutation,
        actor: Option<&str>,
    ) -> Result<OutboxEntry> {
        let encoded = encode(mutation)?;
        let enqueued_at = self.clock.now();

        let result = sqlx::query(
            r#"
            INSERT INTO outbox (entity, mutation, actor, enqueued_at)
            VALUES (?, ?, ?, ?)
            "#,
        )
        .bind(entity)
        .bind(encoded)
        .bind(actor)
        .bind(format_timestamp(enqueued_at))
        .execute(&self.pool)
        .await?;

        Ok(OutboxEntry {
            seq: result.last_insert_rowid(),
            entity: entity.to_string(),
            mutation: mutation.clone(),
            actor: actor.map(str::to_string),
            enqueued_at,
            attempts: 0,
            parked: false,
            last_error: None,
        })
    }

    /// The next entry to deliver.
    pub async fn head(&self) -> Result<Option<OutboxEntry>> {
        let entry = sqlx::query_as(&format!(
            "{SELECT_ENTRY} WHERE parked = 0 ORDER BY seq LIMIT 1"
        ))
        .fetch_optional(&self.pool)
        .await?;
        Ok(entry)
    }

    pub async fn get(&self, seq: i64) -> Result<Option<OutboxEntry>> {
        let entry = sqlx::query_as(&format!("{SELECT_ENTRY} WHERE seq = ?"))
            .bind(seq)
            .fetch_optional(&self.pool)
            .await?;
        Ok(entry)
    }

    /// Entries still in the delivery line, in order.
    pub async fn pending(&self) -> Result<Vec<OutboxEntry>> {
        let entries = sqlx::query_as(&format!("{SELECT_ENTRY} WHERE parked = 0 ORDER BY seq"))
            .fetch_all(&self.pool)
            .await?;
        Ok(entries)
    }

    /// Entries taken out of the delivery line.
    pub async fn parked(&self) -> Result<Vec<OutboxEntry>> {
        let entries = sqlx::query_as(&format!("{SELECT_ENTRY} WHERE parked = 1 ORDER BY seq"))
            .fetch_all(&self.pool)
            .await?;
        Ok(entries)
    }

    pub async fn pending_count(&self) -> Result<usize> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM outbox WHERE parked = 0")
            .fetch_one(&self.pool)
            .await?;
        Ok(count as usize)
    }

    pub async fn parked_count(&self) -> Result<usize> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM outbox WHERE parked = 1")
            .fetch_one(&self.pool)
            .await?;
        Ok(count as usize)
    }

    /// Drop an acknowledged entry.
    pub async fn remove(&self, seq: i64) -> Result<bool> {
        let result = sqlx::query("DELETE FROM outbox WHERE seq = ?")
            .bind(seq)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Record a failed delivery. Returns the attempt count after the failure.
    pub async fn record_failure(&self, seq: i64, error: &Error, park: bool) -> Result<u32> {
        let attempts: Option<i64> = sqlx::query_scalar(
            r#"
            UPDATE outbox
            SET attempts = attempts + 1, last_error = ?, parked = (parked OR ?)
            WHERE seq = ?
            RETURNING attempts
            "#,
        )
        .bind(error.to_string())
        .bind(park)
        .bind(seq)
        .fetch_optional(&self.pool)
        .await?;

        attempts
            .map(|a| a.max(0) as u32)
            .ok_or_else(|| Error::Storage(format!("outbox entry {seq} vanished")))
    }

    /// Park an entry without counting an attempt.
    pub async fn park(&self, seq: i64, reason: &str) -> Result<()> {
        sqlx::query("UPDATE outbox SET parked = 1, last_error = ? WHERE seq = ?")
            .bind(reason)
            .bind(seq)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Whether a rejection at `attempts` should take the entry out of line.
    pub fn should_park(&self, error: &Error, attempts: u32) -> bool {
        !error.is_retryable() && attempts >= self.max_attempts
    }

    /// Point every update and delete on `old_id` at `new_id`.
    ///
    /// Runs when a create is acknowledged, so later entries reach the
    /// record under its server id.
    pub async fn retarget(&self, entity: &str, old_id: &str, new_id: &str) -> Result<usize> {
        let entries: Vec<OutboxEntry> =
            sqlx::query_as(&format!("{SELECT_ENTRY} WHERE entity = ? ORDER BY seq"))
                .bind(entity)
                .fetch_all(&self.pool)
                .await?;

        let mut tx = self.pool.begin().await?;
        let mut rewritten = 0;
        for mut entry in entries {
            if entry.mutation.retarget(old_id, new_id) {
                sqlx::query("UPDATE outbox SET mutation = ? WHERE seq = ?")
                    .bind(encode(&entry.mutation)?)
                    .bind(entry.seq)
                    .execute(&mut *tx)
                    .await?;
                rewritten += 1;
            }
        }
        tx.commit().await?;

        Ok(rewritten)
    }

    /// Whether any entry after `after_seq` still targets a record.
    pub async fn has_pending_for(&self, entity: &str, id: &str, after_seq: i64) -> Result<bool> {
        Ok(!self.entries_for(entity, id, after_seq).await?.is_empty())
    }

    /// Entries after `after_seq` targeting a record, parked or not.
    pub async fn entries_for(
        &self,
        entity: &str,
        id: &str,
        after_seq: i64,
    ) -> Result<Vec<OutboxEntry>> {
        let entries: Vec<OutboxEntry> = sqlx::query_as(&format!(
            "{SELECT_ENTRY} WHERE entity = ? AND seq > ? ORDER BY seq"
        ))
        .bind(entity)
        .bind(after_seq)
        .fetch_all(&self.pool)
        .await?;

        Ok(entries
            .into_iter()
            .filter(|e| e.mutation.record_id() == id)
            .collect())
    }

    /// The queued create of a temporarily named record, if any.
    pub async fn create_for(&self, entity: &str, temp_id: &RecordId) -> Result<Option<OutboxEntry>> {
        Ok(self
            .entries_for(entity, temp_id, 0)
            .await?
            .into_iter()
            .find(|e| matches!(e.mutation, Mutation::Create { .. })))
    }

    /// Put parked entries back in line with a fresh attempt budget.
    pub async fn retry_parked(&self) -> Result<usize> {
        let result = sqlx::query(
            "UPDATE outbox SET parked = 0, attempts = 0 WHERE parked = 1",
        )
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() as usize)
    }

    /// Drop an entry without delivering it.
    pub async fn discard(&self, seq: i64) -> Result<Option<OutboxEntry>> {
        let entry = self.get(seq).await?;
        if entry.is_some() {
            self.remove(seq).await?;
        }
        Ok(entry)
    }
}

fn encode(mutation: &Mutation) -> Result<String> {
    serde_json::to_string(mutation)
        .map_err(|e| Error::Storage(format!("cannot encode mutation: {e}")))
}
