//! Mutations queued for delivery to the origin.
//!
//! Local writes are applied to the replica immediately and expressed as a
//! [`Mutation`] for the outbox. Each variant carries exactly what its origin
//! call needs, so a queued entry can be replayed without consulting the
//! replica.

use crate::{error::Result, record::strip_identity, Error, RecordId};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Prefix of locally minted record ids.
pub const TEMP_ID_PREFIX: &str = "tmp-";

/// Mint an id for a record the origin has not seen yet.
pub fn new_temp_id() -> RecordId {
    format!("{TEMP_ID_PREFIX}{}", Uuid::new_v4())
}

/// Whether an id was minted locally and is still awaiting its server id.
pub fn is_temporary_id(id: &str) -> bool {
    id.starts_with(TEMP_ID_PREFIX)
}

/// The kind of a mutation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OperationKind {
    Create,
    Update,
    Delete,
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OperationKind::Create => write!(f, "create"),
            OperationKind::Update => write!(f, "update"),
            OperationKind::Delete => write!(f, "delete"),
        }
    }
}

impl FromStr for OperationKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "create" => Ok(OperationKind::Create),
            "update" => Ok(OperationKind::Update),
            "delete" => Ok(OperationKind::Delete),
            other => Err(Error::InvalidPayload(format!("unknown operation: {other}"))),
        }
    }
}

/// A pending change to one record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Mutation {
    /// Create a record; `temp_id` names it locally until the origin assigns
    /// the real id.
    Create {
        #[serde(rename = "tempId")]
        temp_id: RecordId,
        payload: Value,
    },
    /// Partial or full update of an existing record.
    Update { id: RecordId, patch: Value },
    /// Delete a record.
    Delete { id: RecordId },
}

impl Mutation {
    /// A create with a freshly minted temporary id.
    pub fn create(payload: Value) -> Self {
        Mutation::Create {
            temp_id: new_temp_id(),
            payload: strip_identity(payload),
        }
    }

    /// An update of `id`.
    pub fn update(id: impl Into<RecordId>, patch: Value) -> Self {
        Mutation::Update {
            id: id.into(),
            patch: strip_identity(patch),
        }
    }

    /// A delete of `id`.
    pub fn delete(id: impl Into<RecordId>) -> Self {
        Mutation::Delete { id: id.into() }
    }

    /// Build a mutation from the loose `(operation, payload)` pair that
    /// feature code hands to `add_to_queue`.
    ///
    /// Updates and deletes name their target with an `id` field; a delete
    /// may also pass the bare id as a JSON string.
    pub fn from_parts(kind: OperationKind, payload: Value) -> Result<Self> {
        match kind {
            OperationKind::Create => {
                if !payload.is_object() {
                    return Err(Error::InvalidPayload("payload must be an object".into()));
                }
                Ok(Mutation::create(payload))
            }
            OperationKind::Update => {
                let id = target_id(&payload)?;
                Ok(Mutation::update(id, payload))
            }
            OperationKind::Delete => {
                let id = match &payload {
                    Value::String(id) if !id.is_empty() => id.clone(),
                    _ => target_id(&payload)?,
                };
                Ok(Mutation::delete(id))
            }
        }
    }

    /// The kind of this mutation.
    pub fn kind(&self) -> OperationKind {
        match self {
            Mutation::Create { .. } => OperationKind::Create,
            Mutation::Update { .. } => OperationKind::Update,
            Mutation::Delete { .. } => OperationKind::Delete,
        }
    }

    /// The local id of the record this mutation targets.
    pub fn record_id(&self) -> &RecordId {
        match self {
            Mutation::Create { temp_id, .. } => temp_id,
            Mutation::Update { id, .. } => id,
            Mutation::Delete { id } => id,
        }
    }

    /// Point an update or delete at a new id.
    ///
    /// Returns whether anything changed. Creates keep their temporary id:
    /// it is only ever replaced by acknowledging the create itself.
    pub fn retarget(&mut self, from: &str, to: &str) -> bool {
        match self {
            Mutation::Update { id, .. } | Mutation::Delete { id } if id.as_str() == from => {
                *id = to.to_string();
                true
            }
            _ => false,
        }
    }
}

fn target_id(payload: &Value) -> Result<RecordId> {
    match payload.get("id") {
        Some(Value::String(id)) if !id.is_empty() => Ok(id.clone()),
        Some(Value::Number(n)) => Ok(n.to_string()),
        _ => Err(Error::MissingRequiredField("id".into())),
    }
}
