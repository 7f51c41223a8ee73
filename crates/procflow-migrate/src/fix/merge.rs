//! Declared per-field precedence for the MergeData strategy.
//!
//! Rules are configuration data keyed by entity kind and field name. Fields
//! without a rule take the source value. Fields that only the target holds
//! (operational attributes added after migration) are always preserved.

use std::collections::BTreeMap;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::core::{extension_field, EntityKind, Payload, Record};
use crate::error::{MigrateError, Result};

/// Which side wins for a field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Precedence {
    #[default]
    Source,
    Target,
}

/// Per-kind, per-field precedence table.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MergeRules(BTreeMap<EntityKind, BTreeMap<String, Precedence>>);

impl MergeRules {
    pub fn new(rules: BTreeMap<EntityKind, BTreeMap<String, Precedence>>) -> Self {
        Self(rules)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&EntityKind, &BTreeMap<String, Precedence>)> {
        self.0.iter()
    }

    /// Precedence for a field; extension attributes use `extensions.<key>`.
    pub fn precedence(&self, kind: EntityKind, field: &str) -> Precedence {
        self.0
            .get(&kind)
            .and_then(|fields| fields.get(field))
            .copied()
            .unwrap_or_default()
    }

    /// Merge a mapped source record into the current target record.
    pub fn merge(&self, source: &Record, target: &Record) -> Result<Record> {
        if source.payload.kind() != target.payload.kind() {
            return Err(MigrateError::mapping(
                &source.id,
                format!(
                    "cannot merge {} payload into {} payload",
                    source.payload.kind(),
                    target.payload.kind()
                ),
            ));
        }
        let kind = source.kind;

        let mut merged = match serde_json::to_value(&target.payload)? {
            Value::Object(map) => map,
            _ => return Err(MigrateError::mapping(&target.id, "target payload is not an object")),
        };
        if let Value::Object(fields) = serde_json::to_value(&source.payload)? {
            for (field, value) in fields {
                if field == "type" {
                    continue;
                }
                let keep_target = self.precedence(kind, &field) == Precedence::Target
                    && merged.get(&field).is_some_and(|v| !v.is_null());
                if !keep_target {
                    merged.insert(field, value);
                }
            }
        }
        let payload: Payload = serde_json::from_value(Value::Object(merged))?;

        let mut extensions = target.extensions.clone();
        for (key, value) in &source.extensions {
            let keep_target = self.precedence(kind, &extension_field(key)) == Precedence::Target
                && extensions.get(key).is_some_and(|v| !v.is_null());
            if !keep_target {
                extensions.insert(key.clone(), value.clone());
            }
        }

        let record = Record {
            id: source.id.clone(),
            kind,
            version: source.version.max(target.version),
            payload,
            extensions,
            ingested_at: None,
            checksum: None,
        };
        Ok(record.sealed(target.ingested_at.unwrap_or_else(Utc::now)))
    }
}
