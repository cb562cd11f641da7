//! Database operations for the records table.

use chrono::{DateTime, SubsecRound, Utc};
use serde_json::Value;
use sqlx::{PgConnection, PgPool, Row};
use till_sync_engine::Record;
use uuid::Uuid;

const RECORD_COLUMNS: &str = "collection, id, payload, updated_at";

/// A stored record row from the database.
#[derive(Debug, Clone)]
pub struct StoredRecord {
    pub collection: String,
    pub id: String,
    pub payload: Value,
    pub updated_at: DateTime<Utc>,
}

impl<'r> sqlx::FromRow<'r, sqlx::postgres::PgRow> for StoredRecord {
    fn from_row(row: &'r sqlx::postgres::PgRow) -> Result<Self, sqlx::Error> {
        Ok(StoredRecord {
            collection: row.try_get("collection")?,
            id: row.try_get("id")?,
            payload: row.try_get("payload")?,
            updated_at: row.try_get("updated_at")?,
        })
    }
}

impl StoredRecord {
    /// Convert the row to an engine record.
    pub fn to_record(&self) -> Record {
        Record::new(self.id.clone(), self.collection.clone(), self.payload.clone())
            .with_updated_at(self.updated_at)
    }

    /// The record as clients receive it: flat, with `id` and `updatedAt`.
    pub fn to_wire(&self) -> Value {
        self.to_record().to_wire()
    }
}

/// Modification time for a write happening now.
///
/// Truncated to milliseconds so clients that keep millisecond precision
/// read back exactly what was stored.
pub fn write_time() -> DateTime<Utc> {
    Utc::now().trunc_subsecs(3)
}

/// A fresh server-assigned record id.
pub fn new_record_id() -> String {
    Uuid::new_v4().to_string()
}

/// All records in a collection, oldest first.
pub async fn list_records(pool: &PgPool, collection: &str) -> Result<Vec<StoredRecord>, sqlx::Error> {
    sqlx::query_as::<_, StoredRecord>(&format!(
        "SELECT {RECORD_COLUMNS} FROM records WHERE collection = $1 ORDER BY created_at, id"
    ))
    .bind(collection)
    .fetch_all(pool)
    .await
}

/// Get a record by collection and ID.
pub async fn get_record(
    pool: &PgPool,
    collection: &str,
    id: &str,
) -> Result<Option<StoredRecord>, sqlx::Error> {
    sqlx::query_as::<_, StoredRecord>(&format!(
        "SELECT {RECORD_COLUMNS} FROM records WHERE collection = $1 AND id = $2"
    ))
    .bind(collection)
    .bind(id)
    .fetch_optional(pool)
    .await
}

/// Result of an insert that may have been a redelivery.
#[derive(Debug)]
pub struct Inserted {
    pub record: StoredRecord,
    /// False when `client_ref` matched an earlier create
    pub created: bool,
}

/// Insert a record.
///
/// When `client_ref` is set and a record was already created with it, the
/// existing record is returned untouched.
pub async fn insert_record(
    conn: &mut PgConnection,
    collection: &str,
    payload: &Value,
    client_ref: Option<&str>,
    actor: Option<&str>,
) -> Result<Inserted, sqlx::Error> {
    let now = write_time();
    let inserted = sqlx::query_as::<_, StoredRecord>(&format!(
        r#"
        INSERT INTO records (collection, id, payload, client_ref, updated_by, created_at, updated_at)
        VALUES ($1, $2, $3, $4, $5, $6, $6)
        ON CONFLICT (collection, client_ref) DO NOTHING
        RETURNING {RECORD_COLUMNS}
        "#
    ))
    .bind(collection)
    .bind(new_record_id())
    .bind(payload)
    .bind(client_ref)
    .bind(actor)
    .bind(now)
    .fetch_optional(&mut *conn)
    .await?;

    if let Some(record) = inserted {
        return Ok(Inserted {
            record,
            created: true,
        });
    }

    let record = sqlx::query_as::<_, StoredRecord>(&format!(
        "SELECT {RECORD_COLUMNS} FROM records WHERE collection = $1 AND client_ref = $2"
    ))
    .bind(collection)
    .bind(client_ref)
    .fetch_one(&mut *conn)
    .await?;

    Ok(Inserted {
        record,
        created: false,
    })
}

/// Lock a record for a read-modify-write inside a transaction.
pub async fn lock_record(
    conn: &mut PgConnection,
    collection: &str,
    id: &str,
) -> Result<Option<StoredRecord>, sqlx::Error> {
    sqlx::query_as::<_, StoredRecord>(&format!(
        "SELECT {RECORD_COLUMNS} FROM records WHERE collection = $1 AND id = $2 FOR UPDATE"
    ))
    .bind(collection)
    .bind(id)
    .fetch_optional(conn)
    .await
}

/// Replace a record's payload and bump its modification time.
pub async fn replace_payload(
    conn: &mut PgConnection,
    collection: &str,
    id: &str,
    payload: &Value,
    actor: Option<&str>,
) -> Result<StoredRecord, sqlx::Error> {
    sqlx::query_as::<_, StoredRecord>(&format!(
        r#"
        UPDATE records
        SET payload = $3,
            updated_by = $4,
            updated_at = GREATEST($5, updated_at + INTERVAL '1 millisecond')
        WHERE collection = $1 AND id = $2
        RETURNING {RECORD_COLUMNS}
        "#
    ))
    .bind(collection)
    .bind(id)
    .bind(payload)
    .bind(actor)
    .bind(write_time())
    .fetch_one(conn)
    .await
}

/// Delete a record. Returns whether it existed.
pub async fn delete_record(pool: &PgPool, collection: &str, id: &str) -> Result<bool, sqlx::Error> {
    let result = sqlx::query("DELETE FROM records WHERE collection = $1 AND id = $2")
        .bind(collection)
        .bind(id)
        .execute(pool)
        .await?;
    Ok(result.rows_affected() > 0)
}
