//! Boundary validation and field mapping for records entering the core.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use crate::error::{MigrateError, Result};

use super::record::{extension_field, EntityKind, Record};

/// Rename of one extension attribute between the legacy and target schema.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldMapping {
    /// Attribute name in the legacy store.
    pub from: String,
    /// Attribute name in the target store.
    pub to: String,
}

/// Maps legacy records into their target representation.
#[derive(Debug, Clone, Default)]
pub struct RecordMapper {
    mappings: BTreeMap<EntityKind, Vec<FieldMapping>>,
}

impl RecordMapper {
    pub fn new(mappings: BTreeMap<EntityKind, Vec<FieldMapping>>) -> Self {
        Self { mappings }
    }

    /// Whether any field mapping is declared for the kind.
    pub fn has_mappings(&self, kind: EntityKind) -> bool {
        self.mappings.get(&kind).is_some_and(|m| !m.is_empty())
    }

    /// Field-map names touched by the kind's mappings (both sides).
    pub fn mapped_fields(&self, kind: EntityKind) -> BTreeSet<String> {
        self.mappings
            .get(&kind)
            .map(|mappings| {
                mappings
                    .iter()
                    .flat_map(|m| [extension_field(&m.from), extension_field(&m.to)])
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Validate a record at the boundary and apply the kind's field mappings.
    ///
    /// Rejects empty ids, records of another kind and payload variants that
    /// do not match the kind. The returned record has its seal cleared; the
    /// writer seals it again.
    pub fn map(&self, expected: EntityKind, record: &Record) -> Result<Record> {
        if record.id.trim().is_empty() {
            return Err(MigrateError::mapping("<empty>", "record id is empty"));
        }
        if record.kind != expected {
            return Err(MigrateError::mapping(
                &record.id,
                format!("expected kind '{}', found '{}'", expected, record.kind),
            ));
        }
        if record.payload.kind() != record.kind {
            return Err(MigrateError::mapping(
                &record.id,
                format!(
                    "payload variant '{}' does not match kind '{}'",
                    record.payload.kind(),
                    record.kind
                ),
            ));
        }

        let mut mapped = self.apply(record);
        if let Some(mappings) = self.mappings.get(&expected) {
            for m in mappings {
                if record.extensions.contains_key(&m.from) && record.extensions.contains_key(&m.to) {
                    return Err(MigrateError::mapping(
                        &record.id,
                        format!("field mapping {} -> {} collides with an existing attribute", m.from, m.to),
                    ));
                }
            }
        }
        mapped.checksum = None;
        Ok(mapped)
    }

    /// Apply the field mappings without validation.
    ///
    /// Used when comparing stores, where a malformed record is a finding
    /// rather than an error.
    pub fn apply(&self, record: &Record) -> Record {
        let mut mapped = record.clone();
        if let Some(mappings) = self.mappings.get(&record.kind) {
            for m in mappings {
                if mapped.extensions.contains_key(&m.to) {
                    continue;
                }
                if let Some(value) = mapped.extensions.remove(&m.from) {
                    mapped.extensions.insert(m.to.clone(), value);
                }
            }
        }
        mapped
    }
}
