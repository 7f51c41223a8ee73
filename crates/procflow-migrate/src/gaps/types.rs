//! Gap classification types.

use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::core::{Backend, EntityKind};
use crate::fix::FixStrategy;

/// Classification of an inconsistency between source and target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GapType {
    MissingRecord,
    OrphanedRecord,
    SchemaMismatch,
    DataCorruption,
    IntegrityViolation,
    IncompleteMigration,
    VersionConflict,
}

impl GapType {
    pub const ALL: [GapType; 7] = [
        GapType::MissingRecord,
        GapType::OrphanedRecord,
        GapType::SchemaMismatch,
        GapType::DataCorruption,
        GapType::IntegrityViolation,
        GapType::IncompleteMigration,
        GapType::VersionConflict,
    ];

    pub fn severity(&self) -> Severity {
        match self {
            GapType::MissingRecord => Severity::High,
            GapType::OrphanedRecord => Severity::Medium,
            GapType::SchemaMismatch => Severity::High,
            GapType::DataCorruption => Severity::Critical,
            GapType::IntegrityViolation => Severity::High,
            GapType::IncompleteMigration => Severity::Medium,
            GapType::VersionConflict => Severity::Critical,
        }
    }

    /// Auto-fixability before per-gap refinement (SchemaMismatch may still
    /// become fixable through declared field mappings).
    pub fn auto_fixable(&self) -> bool {
        matches!(
            self,
            GapType::MissingRecord
                | GapType::OrphanedRecord
                | GapType::DataCorruption
                | GapType::IncompleteMigration
        )
    }

    /// Strategy from the fixed classification table.
    pub fn default_strategy(&self) -> Option<FixStrategy> {
        match self {
            GapType::MissingRecord => Some(FixStrategy::CopyFromSource),
            GapType::OrphanedRecord => Some(FixStrategy::DeleteFromTarget),
            GapType::SchemaMismatch => Some(FixStrategy::UpdateTarget),
            GapType::DataCorruption => Some(FixStrategy::UpdateTarget),
            GapType::IntegrityViolation => None,
            GapType::IncompleteMigration => Some(FixStrategy::CopyFromSource),
            GapType::VersionConflict => Some(FixStrategy::Skip),
        }
    }

    /// Whether the table marks the gap type "confirm required".
    pub fn confirm_required(&self) -> bool {
        matches!(self, GapType::OrphanedRecord | GapType::DataCorruption)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            GapType::MissingRecord => "missing_record",
            GapType::OrphanedRecord => "orphaned_record",
            GapType::SchemaMismatch => "schema_mismatch",
            GapType::DataCorruption => "data_corruption",
            GapType::IntegrityViolation => "integrity_violation",
            GapType::IncompleteMigration => "incomplete_migration",
            GapType::VersionConflict => "version_conflict",
        }
    }
}

impl fmt::Display for GapType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Severity::Low => "low",
            Severity::Medium => "medium",
            Severity::High => "high",
            Severity::Critical => "critical",
        };
        f.write_str(s)
    }
}

/// When a scan runs relative to a migration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Scope {
    /// Before migrating; cached target id sets are reused.
    Pre,
    /// After migrating; cached target id sets are re-read.
    Post,
}

impl std::str::FromStr for Scope {
    type Err = crate::error::MigrateError;

    fn from_str(s: &str) -> crate::error::Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "pre" => Ok(Scope::Pre),
            "post" => Ok(Scope::Post),
            other => Err(crate::error::MigrateError::Config(format!(
                "Unknown scan scope: {}",
                other
            ))),
        }
    }
}

/// Evidence behind a gap.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GapDetails {
    pub message: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scope: Option<Scope>,

    /// Backends of the kind that do not hold the record.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub missing_backends: Vec<Backend>,

    /// Fields whose presence or type differs.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub differing_fields: Vec<String>,

    /// Field holding a dangling reference.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub referencing_field: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub referenced_kind: Option<EntityKind>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub referenced_id: Option<String>,

    /// Set when the dangling reference exists in the source and will be
    /// repaired by that record's MissingRecord fix.
    #[serde(default)]
    pub transitively_resolvable: bool,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resolved_by: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_version: Option<u64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_version: Option<u64>,
}

impl GapDetails {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            ..Default::default()
        }
    }
}

/// An observed inconsistency. Never mutated after detection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataGap {
    pub gap_id: String,
    pub gap_type: GapType,
    pub severity: Severity,
    pub entity_kind: EntityKind,
    pub source_ref: Option<String>,
    pub target_ref: Option<String>,
    pub auto_fixable: bool,
    pub detected_at: DateTime<Utc>,
    pub details: GapDetails,
}

impl DataGap {
    /// Build a gap with severity and auto-fixability from the classification table.
    pub fn new(
        gap_type: GapType,
        entity_kind: EntityKind,
        source_ref: Option<String>,
        target_ref: Option<String>,
        details: GapDetails,
    ) -> Self {
        Self {
            gap_id: Uuid::new_v4().to_string(),
            gap_type,
            severity: gap_type.severity(),
            entity_kind,
            source_ref,
            target_ref,
            auto_fixable: gap_type.auto_fixable(),
            detected_at: Utc::now(),
            details,
        }
    }

    /// Override auto-fixability at construction time.
    pub(crate) fn fixable(mut self, auto_fixable: bool) -> Self {
        self.auto_fixable = auto_fixable;
        self
    }

    /// Identifier of the record the gap is about.
    pub fn record_id(&self) -> &str {
        self.source_ref
            .as_deref()
            .or(self.target_ref.as_deref())
            .unwrap_or_default()
    }

    /// Processing order: severity descending, then kind, then identifier.
    pub fn processing_order(&self, other: &Self) -> Ordering {
        other
            .severity
            .cmp(&self.severity)
            .then(self.entity_kind.cmp(&other.entity_kind))
            .then_with(|| self.record_id().cmp(other.record_id()))
            .then(self.gap_type.cmp(&other.gap_type))
            .then_with(|| self.details.referenced_id.cmp(&other.details.referenced_id))
    }
}

/// Sort gaps into processing order.
pub fn sort_gaps(gaps: &mut [DataGap]) {
    gaps.sort_by(|a, b| a.processing_order(b));
}

/// Counts attached to a migration result for a scan.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GapSummary {
    pub total: usize,
    pub auto_fixable: usize,
    pub by_type: BTreeMap<GapType, usize>,
    pub by_severity: BTreeMap<Severity, usize>,
}

impl GapSummary {
    pub fn from_gaps(gaps: &[DataGap]) -> Self {
        let mut summary = GapSummary {
            total: gaps.len(),
            ..Default::default()
        };
        for gap in gaps {
            if gap.auto_fixable {
                summary.auto_fixable += 1;
            }
            *summary.by_type.entry(gap.gap_type).or_default() += 1;
            *summary.by_severity.entry(gap.severity).or_default() += 1;
        }
        summary
    }

    pub fn count(&self, gap_type: GapType) -> usize {
        self.by_type.get(&gap_type).copied().unwrap_or(0)
    }
}
