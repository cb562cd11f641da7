//! Collection CRUD against PostgreSQL.
//!
//! Payloads are validated with the same [`Schema`] the till uses, so a
//! mutation the client accepted offline is accepted here too.

use crate::db;
use crate::error::{AppError, Result};
use serde_json::{json, Value};
use sqlx::PgPool;
use till_sync_engine::record::strip_identity;
use till_sync_engine::{CollectionSchema, Error as EngineError, RequestContext, Schema};

/// Resolve a path segment (`clients` or `client`) to its collection.
pub fn resolve_collection<'a>(schema: &'a Schema, name: &str) -> Result<&'a CollectionSchema> {
    Ok(schema.resolve(name)?)
}

/// Validate a create body and drop the fields the server owns.
pub fn prepare_create(collection: &CollectionSchema, payload: Value) -> Result<Value> {
    let payload = strip_identity(payload);
    collection.validate_payload(&payload)?;
    Ok(payload)
}

/// Full snapshot of a collection in wire shape.
pub async fn list_collection(pool: &PgPool, schema: &Schema, name: &str) -> Result<Vec<Value>> {
    let collection = resolve_collection(schema, name)?;
    let records = db::list_records(pool, &collection.name).await?;
    Ok(records.iter().map(db::StoredRecord::to_wire).collect())
}

/// One record in wire shape.
pub async fn fetch_record(pool: &PgPool, schema: &Schema, name: &str, id: &str) -> Result<Value> {
    let collection = resolve_collection(schema, name)?;
    let stored = db::get_record(pool, &collection.name, id)
        .await?
        .ok_or_else(|| EngineError::RecordNotFound {
            collection: collection.name.clone(),
            id: id.to_string(),
        })?;
    Ok(stored.to_wire())
}

/// Create a record.
///
/// A repeated `Idempotency-Key` returns the record made by the first
/// request. Collections flagged online-only also get an invitation token,
/// returned as `inviteToken`.
pub async fn create_record(
    pool: &PgPool,
    schema: &Schema,
    name: &str,
    payload: Value,
    ctx: &RequestContext,
) -> Result<Value> {
    let collection = resolve_collection(schema, name)?;
    let payload = prepare_create(collection, payload)?;

    let mut tx = pool.begin().await?;
    let inserted = db::insert_record(
        &mut tx,
        &collection.name,
        &payload,
        ctx.idempotency_key.as_deref(),
        ctx.actor.as_deref(),
    )
    .await?;

    let invite_token = if collection.online_only_create {
        Some(db::ensure_invitation(&mut tx, &inserted.record.id, ctx.actor.as_deref()).await?)
    } else {
        None
    };
    tx.commit().await?;

    if inserted.created {
        tracing::info!(
            collection = %collection.name,
            id = %inserted.record.id,
            actor = ?ctx.actor,
            "record created"
        );
    } else {
        tracing::debug!(
            collection = %collection.name,
            id = %inserted.record.id,
            "redelivered create"
        );
    }

    let mut wire = inserted.record.to_wire();
    if let (Some(token), Value::Object(fields)) = (invite_token, &mut wire) {
        fields.insert("inviteToken".into(), Value::String(token));
    }
    Ok(wire)
}

/// Apply a partial update; the merged record must still validate.
pub async fn update_record(
    pool: &PgPool,
    schema: &Schema,
    name: &str,
    id: &str,
    patch: Value,
    ctx: &RequestContext,
) -> Result<Value> {
    let collection = resolve_collection(schema, name)?;
    collection.validate_patch(&patch)?;

    let mut tx = pool.begin().await?;
    let stored = db::lock_record(&mut tx, &collection.name, id)
        .await?
        .ok_or_else(|| EngineError::RecordNotFound {
            collection: collection.name.clone(),
            id: id.to_string(),
        })?;

    let mut record = stored.to_record();
    record.apply_patch(&patch);
    collection.validate_payload(&record.payload)?;

    let updated =
        db::replace_payload(&mut tx, &collection.name, id, &record.payload, ctx.actor.as_deref())
            .await?;
    tx.commit().await?;

    tracing::info!(collection = %collection.name, %id, actor = ?ctx.actor, "record updated");
    Ok(updated.to_wire())
}

/// Delete a record.
pub async fn delete_record(pool: &PgPool, schema: &Schema, name: &str, id: &str) -> Result<Value> {
    let collection = resolve_collection(schema, name)?;
    if !db::delete_record(pool, &collection.name, id).await? {
        return Err(AppError::NotFound(format!("{}/{id}", collection.name)));
    }
    tracing::info!(collection = %collection.name, %id, "record deleted");
    Ok(json!({ "id": id }))
}
