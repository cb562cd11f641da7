//! Locale projection of the translation table.
//!
//! Each translation record carries a dotted `key` and a map of locale to
//! text. Projection turns the table into a nested tree for one locale:
//! `{"menu.file": {"en": "File"}}` becomes `{"menu": {"file": "File"}}`.

use crate::Record;
use serde::Deserialize;
use serde_json::{Map, Value};
use std::collections::BTreeMap;

/// One row of the translation table.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct TranslationEntry {
    pub key: String,
    #[serde(default)]
    pub values: BTreeMap<String, String>,
}

impl TranslationEntry {
    /// Read an entry from a replica record. Returns `None` for rows that are
    /// not translations.
    pub fn from_record(record: &Record) -> Option<Self> {
        serde_json::from_value(record.payload.clone()).ok()
    }

    /// Text for `locale`, falling back to `default_locale`, then to the key.
    pub fn resolve(&self, locale: &str, default_locale: &str) -> String {
        self.values
            .get(locale)
            .or_else(|| self.values.get(default_locale))
            .cloned()
            .unwrap_or_else(|| self.key.clone())
    }
}

/// Build the translation tree for `locale`.
///
/// Keys are applied in sorted order so the result does not depend on record
/// order. When a key is both a leaf and a prefix of other keys (`menu` and
/// `menu.file`), the branch wins.
pub fn project(records: &[Record], locale: &str, default_locale: &str) -> Value {
    let mut entries: Vec<TranslationEntry> = records
        .iter()
        .filter(|r| r.is_active())
        .filter_map(TranslationEntry::from_record)
        .collect();
    entries.sort_by(|a, b| a.key.cmp(&b.key));

    let mut root = Map::new();
    for entry in &entries {
        let path: Vec<&str> = entry.key.split('.').filter(|s| !s.is_empty()).collect();
        insert_path(&mut root, &path, entry.resolve(locale, default_locale));
    }

    Value::Object(root)
}

/// Place `text` at `path`. A leaf in the way of a branch is replaced; a
/// branch in the way of a leaf is kept.
fn insert_path(node: &mut Map<String, Value>, path: &[&str], text: String) {
    match path {
        [] => {}
        [leaf] => {
            if !node.get(*leaf).is_some_and(Value::is_object) {
                node.insert(leaf.to_string(), Value::String(text));
            }
        }
        [segment, rest @ ..] => {
            let child = node
                .entry(segment.to_string())
                .or_insert_with(|| Value::Object(Map::new()));
            if !child.is_object() {
                *child = Value::Object(Map::new());
            }
            if let Value::Object(map) = child {
                insert_path(map, rest, text);
            }
        }
    }
}

/// Look up a dotted key in a projected tree.
pub fn lookup<'a>(tree: &'a Value, key: &str) -> Option<&'a str> {
    key.split('.')
        .filter(|s| !s.is_empty())
        .try_fold(tree, |node, segment| node.get(segment))?
        .as_str()
}
