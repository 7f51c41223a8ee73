//! Type definitions for per-batch validation.

use serde::{Deserialize, Serialize};

use crate::core::EntityKind;

/// Source and target record counts of a batch that disagree.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CountMismatch {
    pub source: usize,
    pub target: usize,
}

/// Content checksum disagreement for one record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChecksumMismatch {
    pub record_id: String,
    pub source_checksum: String,
    pub target_checksum: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SchemaViolationKind {
    /// Payload variant or kind differs from the source record.
    KindMismatch,
    /// A nested value has a different JSON type on the two sides.
    ShapeMismatch,
    /// A non-null source field is absent from the target record.
    MissingField,
}

/// Structural disagreement for one record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchemaViolation {
    pub record_id: String,
    pub field: String,
    pub kind: SchemaViolationKind,
    pub message: String,
}

/// A target record pointing at an id the target does not hold.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReferentialViolation {
    pub record_id: String,
    pub field: String,
    pub referenced_kind: EntityKind,
    pub referenced_id: String,
}

/// Outcome of validating one batch.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationResult {
    pub passed: bool,
    pub count_mismatch: Option<CountMismatch>,
    /// Ids present on only one side, sorted.
    pub unmatched_ids: Vec<String>,
    pub checksum_mismatches: Vec<ChecksumMismatch>,
    pub schema_violations: Vec<SchemaViolation>,
    pub referential_violations: Vec<ReferentialViolation>,
}

impl ValidationResult {
    /// Total number of violations of every kind.
    pub fn violation_count(&self) -> usize {
        usize::from(self.count_mismatch.is_some())
            + self.unmatched_ids.len()
            + self.checksum_mismatches.len()
            + self.schema_violations.len()
            + self.referential_violations.len()
    }

    pub(crate) fn finish(mut self) -> Self {
        self.passed = self.violation_count() == 0;
        self
    }
}

/// Validation totals folded into a migration result.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationSummary {
    pub batches_validated: usize,
    pub batches_failed: usize,
    pub count_mismatches: usize,
    pub unmatched_ids: usize,
    pub checksum_mismatches: usize,
    pub schema_violations: usize,
    pub referential_violations: usize,
}

impl ValidationSummary {
    pub fn add(&mut self, result: &ValidationResult) {
        self.batches_validated += 1;
        if !result.passed {
            self.batches_failed += 1;
        }
        self.count_mismatches += usize::from(result.count_mismatch.is_some());
        self.unmatched_ids += result.unmatched_ids.len();
        self.checksum_mismatches += result.checksum_mismatches.len();
        self.schema_violations += result.schema_violations.len();
        self.referential_violations += result.referential_violations.len();
    }

    /// Total violations across every validated batch.
    pub fn violations(&self) -> usize {
        self.count_mismatches
            + self.unmatched_ids
            + self.checksum_mismatches
            + self.schema_violations
            + self.referential_violations
    }
}
