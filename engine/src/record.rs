//! Replica records.
//!
//! On the wire a record is a flat JSON object carrying `id`, `updatedAt` and
//! the entity fields. Locally the entity fields live in [`Record::payload`]
//! and the bookkeeping fields are lifted out.

use crate::{error::Result, CollectionName, Error, RecordId, Timestamp};
use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Fields owned by the sync layer rather than by the entity.
const IDENTITY_FIELDS: [&str; 3] = ["id", "_id", "updatedAt"];

/// A record in the replica store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Record {
    /// Identifier, stable across local and remote
    pub id: RecordId,
    /// Collection this record belongs to
    pub collection: CollectionName,
    /// Entity fields (always a JSON object)
    pub payload: Value,
    /// Origin-assigned modification time; `None` for records never
    /// acknowledged by the origin
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<Timestamp>,
    /// Local tombstone, set until the origin acknowledges the delete
    #[serde(default)]
    pub deleted: bool,
}

impl Record {
    /// Create a locally originated record.
    pub fn new(
        id: impl Into<RecordId>,
        collection: impl Into<CollectionName>,
        payload: Value,
    ) -> Self {
        Self {
            id: id.into(),
            collection: collection.into(),
            payload: strip_identity(payload),
            updated_at: None,
            deleted: false,
        }
    }

    /// Builder-style setter for `updated_at`.
    pub fn with_updated_at(mut self, updated_at: Timestamp) -> Self {
        self.updated_at = Some(updated_at);
        self
    }

    /// Parse a record as the origin sends it.
    pub fn from_wire(collection: impl Into<CollectionName>, value: Value) -> Result<Self> {
        let Value::Object(mut fields) = value else {
            return Err(Error::InvalidPayload("record must be a JSON object".into()));
        };

        let id = fields.remove("id");
        let legacy_id = fields.remove("_id");
        let id = match id.or(legacy_id) {
            Some(Value::String(s)) if !s.is_empty() => s,
            Some(Value::Number(n)) => n.to_string(),
            _ => return Err(Error::InvalidPayload("record is missing an id".into())),
        };

        let updated_at = match fields.remove("updatedAt") {
            None | Some(Value::Null) => None,
            Some(Value::String(s)) => Some(parse_timestamp(&s)?),
            Some(Value::Number(n)) => {
                let millis = n
                    .as_i64()
                    .ok_or_else(|| Error::InvalidPayload(format!("invalid updatedAt: {n}")))?;
                Some(DateTime::from_timestamp_millis(millis).ok_or_else(|| {
                    Error::InvalidPayload(format!("updatedAt out of range: {millis}"))
                })?)
            }
            Some(other) => {
                return Err(Error::InvalidPayload(format!(
                    "invalid updatedAt: {other}"
                )))
            }
        };

        Ok(Self {
            id,
            collection: collection.into(),
            payload: Value::Object(fields),
            updated_at,
            deleted: false,
        })
    }

    /// Render the record in wire shape.
    pub fn to_wire(&self) -> Value {
        let mut fields = match &self.payload {
            Value::Object(map) => map.clone(),
            _ => Map::new(),
        };
        fields.insert("id".into(), Value::String(self.id.clone()));
        if let Some(ts) = self.updated_at {
            fields.insert("updatedAt".into(), Value::String(format_timestamp(ts)));
        }
        Value::Object(fields)
    }

    /// Check if record is active (not tombstoned).
    pub fn is_active(&self) -> bool {
        !self.deleted
    }

    /// Look up an entity field.
    pub fn field(&self, name: &str) -> Option<&Value> {
        self.payload.get(name)
    }

    /// Shallow-merge a partial update into the payload.
    ///
    /// `updatedAt` is left alone: only the origin moves it.
    pub fn apply_patch(&mut self, patch: &Value) {
        let Value::Object(changes) = patch else {
            return;
        };
        if !self.payload.is_object() {
            self.payload = Value::Object(Map::new());
        }
        if let Value::Object(fields) = &mut self.payload {
            for (key, value) in changes {
                if IDENTITY_FIELDS.contains(&key.as_str()) {
                    continue;
                }
                fields.insert(key.clone(), value.clone());
            }
        }
    }
}

/// Drop sync-owned fields from an entity payload.
pub fn strip_identity(payload: Value) -> Value {
    match payload {
        Value::Object(mut fields) => {
            for key in IDENTITY_FIELDS {
                fields.remove(key);
            }
            Value::Object(fields)
        }
        other => other,
    }
}

/// Format a timestamp the way the wire and the local tables carry it.
///
/// Sub-second precision is kept so a stored value compares equal to the
/// value it was parsed from.
pub fn format_timestamp(ts: Timestamp) -> String {
    ts.to_rfc3339_opts(SecondsFormat::AutoSi, true)
}

/// Parse an RFC 3339 timestamp.
pub fn parse_timestamp(raw: &str) -> Result<Timestamp> {
    DateTime::parse_from_rfc3339(raw)
        .map(|ts| ts.with_timezone(&Utc))
        .map_err(|e| Error::InvalidPayload(format!("invalid timestamp '{raw}': {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use serde_json::json;

    #[test]
    fn create_local_record() {
        let record = Record::new("tmp-1", "clients", json!({"name": "Ana"}));

        assert_eq!(record.id, "tmp-1");
        assert_eq!(record.collection, "clients");
        assert_eq!(record.payload, json!({"name": "Ana"}));
        assert!(record.updated_at.is_none());
        assert!(record.is_active());
    }

    #[test]
    fn local_record_drops_identity_fields() {
        let record = Record::new(
            "tmp-1",
            "clients",
            json!({"id": "x", "updatedAt": "2024-01-01T00:00:00Z", "name": "Ana"}),
        );
        assert_eq!(record.payload, json!({"name": "Ana"}));
    }

    #[test]
    fn parse_wire_record() {
        let record = Record::from_wire(
            "clients",
            json!({"id": "c-101", "updatedAt": "2024-01-01T00:00:00Z", "name": "Ana"}),
        )
        .unwrap();

        assert_eq!(record.id, "c-101");
        assert_eq!(
            record.updated_at,
            Some(Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap())
        );
        assert_eq!(record.payload, json!({"name": "Ana"}));
    }

    #[test]
    fn parse_wire_record_with_legacy_id_and_millis() {
        let record = Record::from_wire(
            "taxes",
            json!({"_id": 7, "updatedAt": 1704067200000i64, "rate": 0.21}),
        )
        .unwrap();

        assert_eq!(record.id, "7");
        assert_eq!(
            record.updated_at,
            Some(Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap())
        );
        assert_eq!(record.payload, json!({"rate": 0.21}));
    }

    #[test]
    fn reject_malformed_wire_records() {
        assert!(matches!(
            Record::from_wire("clients", json!(["not", "an", "object"])),
            Err(Error::InvalidPayload(_))
        ));
        assert!(matches!(
            Record::from_wire("clients", json!({"name": "no id"})),
            Err(Error::InvalidPayload(_))
        ));
        assert!(matches!(
            Record::from_wire("clients", json!({"id": "c-1", "updatedAt": "yesterday"})),
            Err(Error::InvalidPayload(_))
        ));
        assert!(matches!(
            Record::from_wire("clients", json!({"id": "c-1", "updatedAt": true})),
            Err(Error::InvalidPayload(_))
        ));
    }

    #[test]
    fn wire_shape_is_flat() {
        let ts = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let record = Record::new("c-101", "clients", json!({"name": "Ana"})).with_updated_at(ts);

        assert_eq!(
            record.to_wire(),
            json!({"id": "c-101", "updatedAt": "2024-01-01T00:00:00Z", "name": "Ana"})
        );
    }

    #[test]
    fn timestamp_precision_survives_formatting() {
        let ts = parse_timestamp("2024-03-05T10:11:12.123456Z").unwrap();
        assert_eq!(parse_timestamp(&format_timestamp(ts)).unwrap(), ts);
    }

    #[test]
    fn apply_patch_merges_fields() {
        let ts = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let mut record =
            Record::new("p-1", "products", json!({"name": "Coffee", "price": 2.5})).with_updated_at(ts);

        record.apply_patch(&json!({"price": 3.0, "updatedAt": "2030-01-01T00:00:00Z", "id": "p-2"}));

        assert_eq!(record.id, "p-1");
        assert_eq!(record.payload, json!({"name": "Coffee", "price": 3.0}));
        assert_eq!(record.updated_at, Some(ts));
    }

    #[test]
    fn serialization_roundtrip() {
        let ts = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let record = Record::new("c-1", "clients", json!({"name": "Ana", "age": 30})).with_updated_at(ts);

        let json = serde_json::to_string(&record).unwrap();
        assert!(json.contains("updatedAt"));
        let parsed: Record = serde_json::from_str(&json).unwrap();

        assert_eq!(record, parsed);
    }
}
