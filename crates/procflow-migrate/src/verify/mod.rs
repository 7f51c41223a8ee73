//! Per-batch equivalence checking between source and target records.
//!
//! Checks run in a fixed order, cheapest first:
//!
//! 1. **Count**: record counts of the two sides
//! 2. **Ids**: identifier-set equality
//! 3. **Checksum**: canonical content checksum per record
//! 4. **Shape**: recursive JSON type signature of fields present on both sides
//! 5. **Superset**: every non-null source field exists on the target
//! 6. **References**: foreign ids resolve in the target (best effort)
//!
//! Data-quality findings are returned as violations. Only store failures
//! during the referential lookup surface as errors.

pub mod normalize;
pub mod types;

pub use types::{
    ChecksumMismatch, CountMismatch, ReferentialViolation, SchemaViolation, SchemaViolationKind,
    ValidationResult, ValidationSummary,
};

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use tracing::{debug, warn};

use crate::core::{EntityKind, Record, RecordMapper, TargetStoreGateway};
use crate::error::Result;
use normalize::{canonical_checksum, shape_conflict};

/// Validator comparing a source batch with what the target holds for it.
#[derive(Clone, Default)]
pub struct DataValidator {
    target: Option<Arc<dyn TargetStoreGateway>>,
    mapper: RecordMapper,
    volatile_fields: Vec<String>,
}

impl DataValidator {
    /// Create a validator without a gateway; references are checked only
    /// against the batch itself.
    pub fn new() -> Self {
        Self::default()
    }

    /// Resolve references outside the batch through the gateway.
    pub fn with_target(mut self, target: Arc<dyn TargetStoreGateway>) -> Self {
        self.target = Some(target);
        self
    }

    pub fn with_mapper(mut self, mapper: RecordMapper) -> Self {
        self.mapper = mapper;
        self
    }

    /// Additional fields excluded from checksum and superset checks.
    pub fn with_volatile_fields(mut self, fields: Vec<String>) -> Self {
        self.volatile_fields = fields;
        self
    }

    /// Validate a batch of source records against the target's copies.
    pub async fn validate_batch(
        &self,
        source_records: &[Record],
        target_records: &[Record],
    ) -> Result<ValidationResult> {
        let mut result = ValidationResult::default();

        if source_records.len() != target_records.len() {
            result.count_mismatch = Some(CountMismatch {
                source: source_records.len(),
                target: target_records.len(),
            });
        }

        let source_ids: BTreeSet<&str> = source_records.iter().map(|r| r.id.as_str()).collect();
        let target_by_id: HashMap<&str, &Record> =
            target_records.iter().map(|r| (r.id.as_str(), r)).collect();
        let target_ids: BTreeSet<&str> = target_by_id.keys().copied().collect();
        result.unmatched_ids = source_ids
            .symmetric_difference(&target_ids)
            .map(|id| id.to_string())
            .collect();

        let pairs: Vec<(Record, &Record)> = source_records
            .iter()
            .filter_map(|s| target_by_id.get(s.id.as_str()).map(|t| (self.mapper.apply(s), *t)))
            .collect();

        // Pairs of different kinds are reported once and excluded from the
        // content checks below.
        let mut comparable = Vec::with_capacity(pairs.len());
        for (source, target) in &pairs {
            if source.kind != target.kind || source.payload.kind() != target.payload.kind() {
                result.schema_violations.push(SchemaViolation {
                    record_id: source.id.clone(),
                    field: "type".into(),
                    kind: SchemaViolationKind::KindMismatch,
                    message: format!(
                        "source is {}/{}, target is {}/{}",
                        source.kind,
                        source.payload.kind(),
                        target.kind,
                        target.payload.kind()
                    ),
                });
            } else {
                comparable.push((source, *target));
            }
        }

        for (source, target) in &comparable {
            let source_checksum = canonical_checksum(source, &self.volatile_fields);
            let target_checksum = canonical_checksum(target, &self.volatile_fields);
            if source_checksum != target_checksum {
                result.checksum_mismatches.push(ChecksumMismatch {
                    record_id: source.id.clone(),
                    source_checksum,
                    target_checksum,
                });
            }
        }

        for (source, target) in &comparable {
            let target_fields = target.field_map();
            for (name, value) in source.field_map() {
                if let Some(other) = target_fields.get(&name) {
                    if let Some((path, left, right)) = shape_conflict(&name, &value, other) {
                        result.schema_violations.push(SchemaViolation {
                            record_id: source.id.clone(),
                            field: path,
                            kind: SchemaViolationKind::ShapeMismatch,
                            message: format!("source has {}, target has {}", left, right),
                        });
                    }
                }
            }
        }

        for (source, target) in &comparable {
            let target_fields = target.field_map();
            for name in source.field_map().keys() {
                if self.volatile_fields.contains(name) || target_fields.contains_key(name) {
                    continue;
                }
                result.schema_violations.push(SchemaViolation {
                    record_id: source.id.clone(),
                    field: name.clone(),
                    kind: SchemaViolationKind::MissingField,
                    message: format!("field '{}' is absent from the target record", name),
                });
            }
        }

        result.referential_violations = self.check_references(target_records).await?;

        let result = result.finish();
        if result.passed {
            debug!("Batch of {} records validated", source_records.len());
        } else {
            warn!(
                "Batch validation found {} violation(s) across {} records",
                result.violation_count(),
                source_records.len()
            );
        }
        Ok(result)
    }

    async fn check_references(&self, target_records: &[Record]) -> Result<Vec<ReferentialViolation>> {
        let in_batch: BTreeSet<(EntityKind, &str)> = target_records
            .iter()
            .map(|r| (r.kind, r.id.as_str()))
            .collect();
        let mut resolved: HashMap<(EntityKind, String), bool> = HashMap::new();
        let mut violations = Vec::new();

        for record in target_records {
            for reference in record.references() {
                if in_batch.contains(&(reference.kind, reference.id.as_str())) {
                    continue;
                }
                let Some(target) = &self.target else {
                    continue;
                };
                let key = (reference.kind, reference.id.clone());
                let exists = match resolved.get(&key) {
                    Some(exists) => *exists,
                    None => {
                        let exists = target.read_one(reference.kind, &reference.id).await?.is_some();
                        resolved.insert(key, exists);
                        exists
                    }
                };
                if !exists {
                    violations.push(ReferentialViolation {
                        record_id: record.id.clone(),
                        field: reference.field.to_string(),
                        referenced_kind: reference.kind,
                        referenced_id: reference.id,
                    });
                }
            }
        }
        Ok(violations)
    }
}
