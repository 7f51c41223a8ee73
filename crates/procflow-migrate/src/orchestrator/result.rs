//! Migration run result.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::core::EntityKind;
use crate::error::{MigrateError, Result};
use crate::gaps::GapSummary;
use crate::verify::{ValidationResult, ValidationSummary};

/// Terminal status of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Success,
    PartialSuccess,
    Aborted,
    Failed,
    Cancelled,
}

impl RunStatus {
    /// Process exit code for automation.
    pub fn exit_code(&self) -> u8 {
        match self {
            RunStatus::Success | RunStatus::PartialSuccess => 0,
            RunStatus::Aborted | RunStatus::Failed => 1,
            RunStatus::Cancelled => 130,
        }
    }
}

/// Per-kind counters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct KindStats {
    pub total: usize,
    pub migrated: usize,
    pub failed: usize,
    pub batches: usize,
    pub failed_batches: usize,
}

/// An error recorded during the run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunError {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub entity_kind: Option<EntityKind>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub batch: Option<usize>,
    pub message: String,
    pub at: DateTime<Utc>,
}

/// Result of a migration run.
///
/// Created at run start, updated as batches complete and finalized once.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MigrationResult {
    /// Unique run identifier.
    pub run_id: String,

    /// Terminal status (provisional until finalized).
    pub status: RunStatus,

    /// Whether target writes were simulated.
    pub dry_run: bool,

    /// When the run started.
    pub started_at: DateTime<Utc>,

    /// When the run was finalized.
    pub completed_at: Option<DateTime<Utc>>,

    /// Total duration in seconds.
    pub duration_seconds: f64,

    /// Records the source holds for the configured kinds.
    pub total_records: usize,

    /// Records whose batch was attempted.
    pub records_processed: usize,

    /// Records written (or validated, for dry runs).
    pub migrated_records: usize,

    /// Records in failed batches.
    pub failed_records: usize,

    /// Records deleted again by rollback-on-abort.
    pub rolled_back_records: usize,

    pub batches_total: usize,
    pub batches_failed: usize,

    pub per_kind: BTreeMap<EntityKind, KindStats>,

    pub errors: Vec<RunError>,

    pub validation: ValidationSummary,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gaps_before: Option<GapSummary>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gaps_after: Option<GapSummary>,
}

impl MigrationResult {
    pub fn start(dry_run: bool) -> Self {
        Self {
            run_id: Uuid::new_v4().to_string(),
            status: RunStatus::Success,
            dry_run,
            started_at: Utc::now(),
            completed_at: None,
            duration_seconds: 0.0,
            total_records: 0,
            records_processed: 0,
            migrated_records: 0,
            failed_records: 0,
            rolled_back_records: 0,
            batches_total: 0,
            batches_failed: 0,
            per_kind: BTreeMap::new(),
            errors: Vec::new(),
            validation: ValidationSummary::default(),
            gaps_before: None,
            gaps_after: None,
        }
    }

    pub fn is_finalized(&self) -> bool {
        self.completed_at.is_some()
    }

    pub(crate) fn set_kind_total(&mut self, kind: EntityKind, total: usize) {
        self.per_kind.entry(kind).or_default().total = total;
        self.total_records = self.per_kind.values().map(|s| s.total).sum();
    }

    pub(crate) fn record_batch_success(&mut self, kind: EntityKind, records: usize) {
        let stats = self.per_kind.entry(kind).or_default();
        stats.batches += 1;
        stats.migrated += records;
        self.batches_total += 1;
        self.migrated_records += records;
        self.records_processed += records;
    }

    pub(crate) fn record_batch_failure(
        &mut self,
        kind: EntityKind,
        batch: usize,
        records: usize,
        error: &MigrateError,
    ) {
        let stats = self.per_kind.entry(kind).or_default();
        stats.batches += 1;
        stats.failed_batches += 1;
        stats.failed += records;
        self.batches_total += 1;
        self.batches_failed += 1;
        self.failed_records += records;
        self.records_processed += records;
        self.record_error(Some(kind), Some(batch), error);
    }

    pub(crate) fn record_error(&mut self, kind: Option<EntityKind>, batch: Option<usize>, error: &MigrateError) {
        self.errors.push(RunError {
            entity_kind: kind,
            batch,
            message: error.to_string(),
            at: Utc::now(),
        });
    }

    pub(crate) fn record_validation(&mut self, result: &ValidationResult) {
        self.validation.add(result);
    }

    /// Status implied by the counters when the run was neither cancelled,
    /// aborted nor stopped by a fatal error.
    fn derived_status(&self) -> RunStatus {
        if self.records_processed > 0 && self.failed_records == self.records_processed {
            RunStatus::Failed
        } else if self.failed_records > 0 || self.validation.violations() > 0 {
            RunStatus::PartialSuccess
        } else {
            RunStatus::Success
        }
    }

    /// Set the terminal status. Only the first call has any effect.
    pub(crate) fn finalize(&mut self, forced: Option<RunStatus>) {
        if self.is_finalized() {
            return;
        }
        let completed_at = Utc::now();
        self.status = forced.unwrap_or_else(|| self.derived_status());
        self.duration_seconds = (completed_at - self.started_at).num_milliseconds() as f64 / 1000.0;
        self.completed_at = Some(completed_at);
    }

    /// Process exit code for this result.
    pub fn exit_code(&self) -> u8 {
        self.status.exit_code()
    }

    /// Human-readable warnings for statuses that still exit 0.
    pub fn warnings(&self) -> Vec<String> {
        let mut warnings = Vec::new();
        if self.failed_records > 0 {
            warnings.push(format!(
                "{} record(s) in {} batch(es) failed",
                self.failed_records, self.batches_failed
            ));
        }
        if self.validation.violations() > 0 {
            warnings.push(format!(
                "{} validation violation(s) in {} batch(es)",
                self.validation.violations(),
                self.validation.batches_failed
            ));
        }
        if let Some(after) = &self.gaps_after {
            if after.total > 0 {
                warnings.push(format!(
                    "{} gap(s) remain after migration ({} auto-fixable)",
                    after.total, after.auto_fixable
                ));
            }
        }
        warnings
    }

    /// Serialize to JSON.
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }
}
