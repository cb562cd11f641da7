//! Collection schemas and mutation validation.
//!
//! Every mutation is validated when it is enqueued, so an outbox entry is
//! always a well-formed request for its collection.

use crate::{error::Result, CollectionName, Error, Mutation};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Name of the translation table consumed by locale projections.
pub const TRANSLATIONS: &str = "translations";

/// Field types supported in schemas.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FieldType {
    String,
    Int,
    Float,
    Bool,
    /// RFC 3339 string or epoch milliseconds
    Timestamp,
    /// Arbitrary nested JSON
    Json,
}

impl FieldType {
    pub fn as_str(&self) -> &'static str {
        match self {
            FieldType::String => "String",
            FieldType::Int => "Int",
            FieldType::Float => "Float",
            FieldType::Bool => "Bool",
            FieldType::Timestamp => "Timestamp",
            FieldType::Json => "Json",
        }
    }
}

impl std::fmt::Display for FieldType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Definition of a field in a collection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FieldDef {
    /// Field name
    pub name: String,
    /// Field type
    pub field_type: FieldType,
    /// Whether this field is required
    pub required: bool,
}

impl FieldDef {
    /// Create a new required field definition.
    pub fn required(name: impl Into<String>, field_type: FieldType) -> Self {
        Self {
            name: name.into(),
            field_type,
            required: true,
        }
    }

    /// Create a new optional field definition.
    pub fn optional(name: impl Into<String>, field_type: FieldType) -> Self {
        Self {
            name: name.into(),
            field_type,
            required: false,
        }
    }

    /// Validate a JSON value against this field definition.
    pub fn validate(&self, value: Option<&serde_json::Value>) -> Result<()> {
        match value {
            None if self.required => Err(Error::MissingRequiredField(self.name.clone())),
            None => Ok(()),
            Some(serde_json::Value::Null) if self.required => {
                Err(Error::MissingRequiredField(self.name.clone()))
            }
            Some(serde_json::Value::Null) => Ok(()),
            Some(v) => self.validate_type(v),
        }
    }

    /// Validate a value that may be absent from a partial update.
    fn validate_present(&self, value: Option<&serde_json::Value>) -> Result<()> {
        match value {
            None => Ok(()),
            some => self.validate(some),
        }
    }

    fn validate_type(&self, value: &serde_json::Value) -> Result<()> {
        let valid = match self.field_type {
            FieldType::String => value.is_string(),
            FieldType::Int => value.is_i64() || value.is_u64(),
            FieldType::Float => value.is_f64() || value.is_i64() || value.is_u64(),
            FieldType::Bool => value.is_boolean(),
            FieldType::Timestamp => {
                value.is_u64()
                    || value.is_i64()
                    || value
                        .as_str()
                        .is_some_and(|s| chrono::DateTime::parse_from_rfc3339(s).is_ok())
            }
            FieldType::Json => true,
        };

        if valid {
            Ok(())
        } else {
            Err(Error::TypeMismatch {
                field: self.name.clone(),
                expected: self.field_type.to_string(),
                got: json_type_name(value).to_string(),
            })
        }
    }
}

fn json_type_name(value: &serde_json::Value) -> &'static str {
    match value {
        serde_json::Value::Null => "Null",
        serde_json::Value::Bool(_) => "Bool",
        serde_json::Value::Number(n) if n.is_i64() || n.is_u64() => "Int",
        serde_json::Value::Number(_) => "Float",
        serde_json::Value::String(_) => "String",
        serde_json::Value::Array(_) => "Array",
        serde_json::Value::Object(_) => "Object",
    }
}

/// Schema for a collection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CollectionSchema {
    /// Collection name, as used in origin paths
    pub name: CollectionName,
    /// Singular entity name accepted as an alias (`client` for `clients`)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub entity: Option<String>,
    /// Field definitions; an empty list accepts any object
    pub fields: Vec<FieldDef>,
    /// Creates need origin-side effects and cannot be queued
    #[serde(default)]
    pub online_only_create: bool,
}

impl CollectionSchema {
    /// Create a new collection schema.
    pub fn new(name: impl Into<CollectionName>, fields: Vec<FieldDef>) -> Self {
        Self {
            name: name.into(),
            entity: None,
            fields,
            online_only_create: false,
        }
    }

    /// Accept `entity` as an alias of this collection.
    pub fn with_entity(mut self, entity: impl Into<String>) -> Self {
        self.entity = Some(entity.into());
        self
    }

    /// Route creates through a synchronous origin call instead of the outbox.
    pub fn online_only_create(mut self) -> Self {
        self.online_only_create = true;
        self
    }

    /// Validate a full payload (creates).
    pub fn validate_payload(&self, payload: &serde_json::Value) -> Result<()> {
        let obj = payload
            .as_object()
            .ok_or_else(|| Error::InvalidPayload("payload must be an object".into()))?;

        for field in &self.fields {
            field.validate(obj.get(&field.name))?;
        }

        Ok(())
    }

    /// Validate a partial payload (updates): only fields present are checked,
    /// and a required field cannot be cleared.
    pub fn validate_patch(&self, patch: &serde_json::Value) -> Result<()> {
        let obj = patch
            .as_object()
            .ok_or_else(|| Error::InvalidPayload("patch must be an object".into()))?;

        for field in &self.fields {
            field.validate_present(obj.get(&field.name))?;
        }

        Ok(())
    }

    /// Validate a mutation against this collection.
    pub fn validate_mutation(&self, mutation: &Mutation) -> Result<()> {
        match mutation {
            Mutation::Create { payload, .. } => self.validate_payload(payload),
            Mutation::Update { patch, .. } => self.validate_patch(patch),
            Mutation::Delete { .. } => Ok(()),
        }
    }
}

/// Schema for every synced collection.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Schema {
    /// Collection schemas by name
    pub collections: HashMap<CollectionName, CollectionSchema>,
}

impl Schema {
    /// Create an empty schema.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a collection to the schema.
    pub fn add_collection(&mut self, collection: CollectionSchema) -> &mut Self {
        self.collections.insert(collection.name.clone(), collection);
        self
    }

    /// Builder-style method to add a collection.
    pub fn with_collection(mut self, collection: CollectionSchema) -> Self {
        self.add_collection(collection);
        self
    }

    /// Get a collection schema by exact name.
    pub fn get_collection(&self, name: &str) -> Option<&CollectionSchema> {
        self.collections.get(name)
    }

    /// Look a collection up by name or entity alias.
    pub fn resolve(&self, name: &str) -> Result<&CollectionSchema> {
        self.collections
            .get(name)
            .or_else(|| {
                self.collections
                    .values()
                    .find(|c| c.entity.as_deref() == Some(name))
            })
            .ok_or_else(|| Error::UnknownCollection(name.to_string()))
    }

    /// All collection names, sorted.
    pub fn collection_names(&self) -> Vec<CollectionName> {
        let mut names: Vec<_> = self.collections.keys().cloned().collect();
        names.sort();
        names
    }

    /// Validate a mutation for the named collection.
    pub fn validate_mutation(&self, collection: &str, mutation: &Mutation) -> Result<()> {
        self.resolve(collection)?.validate_mutation(mutation)
    }

    /// The back-office collections synced by the point-of-sale client.
    pub fn pos() -> Self {
        Schema::new()
            .with_collection(
                CollectionSchema::new(
                    "products",
                    vec![
                        FieldDef::required("name", FieldType::String),
                        FieldDef::required("price", FieldType::Float),
                        FieldDef::optional("sku", FieldType::String),
                        FieldDef::optional("stock", FieldType::Int),
                        FieldDef::optional("categoryId", FieldType::String),
                        FieldDef::optional("taxId", FieldType::String),
                        FieldDef::optional("active", FieldType::Bool),
                    ],
                )
                .with_entity("product"),
            )
            .with_collection(
                CollectionSchema::new(
                    "categories",
                    vec![FieldDef::required("name", FieldType::String)],
                )
                .with_entity("category"),
            )
            .with_collection(
                CollectionSchema::new(
                    "clients",
                    vec![
                        FieldDef::required("name", FieldType::String),
                        FieldDef::optional("email", FieldType::String),
                        FieldDef::optional("phone", FieldType::String),
                        FieldDef::optional("taxNumber", FieldType::String),
                        FieldDef::optional("address", FieldType::Json),
                    ],
                )
                .with_entity("client"),
            )
            .with_collection(
                CollectionSchema::new(
                    "sales",
                    vec![
                        FieldDef::required("items", FieldType::Json),
                        FieldDef::required("total", FieldType::Float),
                        FieldDef::optional("clientId", FieldType::String),
                        FieldDef::optional("userId", FieldType::String),
                        FieldDef::optional("paymentMethod", FieldType::String),
                        FieldDef::optional("status", FieldType::String),
                        FieldDef::optional("soldAt", FieldType::Timestamp),
                    ],
                )
                .with_entity("sale"),
            )
            .with_collection(
                CollectionSchema::new(
                    "taxes",
                    vec![
                        FieldDef::required("name", FieldType::String),
                        FieldDef::required("rate", FieldType::Float),
                    ],
                )
                .with_entity("tax"),
            )
            .with_collection(
                CollectionSchema::new(
                    "users",
                    vec![
                        FieldDef::required("name", FieldType::String),
                        FieldDef::required("email", FieldType::String),
                        FieldDef::optional("role", FieldType::String),
                        FieldDef::optional("active", FieldType::Bool),
                    ],
                )
                .with_entity("user")
                .online_only_create(),
            )
            .with_collection(
                CollectionSchema::new(
                    TRANSLATIONS,
                    vec![
                        FieldDef::required("key", FieldType::String),
                        FieldDef::required("values", FieldType::Json),
                    ],
                )
                .with_entity("translation"),
            )
    }
}
