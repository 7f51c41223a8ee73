//! Repair plan, action and report types.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::core::{Backend, EntityKind, Record};
use crate::gaps::DataGap;

/// Declared remediation for a gap type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FixStrategy {
    CopyFromSource,
    DeleteFromTarget,
    UpdateTarget,
    MergeData,
    Skip,
}

impl fmt::Display for FixStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            FixStrategy::CopyFromSource => "copy_from_source",
            FixStrategy::DeleteFromTarget => "delete_from_target",
            FixStrategy::UpdateTarget => "update_target",
            FixStrategy::MergeData => "merge_data",
            FixStrategy::Skip => "skip",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FixStatus {
    Pending,
    InProgress,
    Success,
    Failed,
    Skipped,
    RolledBack,
}

/// Snapshot taken before an action mutates the target.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Backup {
    pub backup_id: String,
    pub gap_id: String,
    pub entity_kind: EntityKind,
    pub record_id: String,
    /// Target record before the action, if any backend held it.
    pub target_snapshot: Option<Record>,
    /// Backends that held the record before the action.
    pub target_presence: Vec<Backend>,
    /// Source record at backup time, if the source holds it.
    pub source_reference: Option<Record>,
    pub taken_at: DateTime<Utc>,
}

/// One remediation attempt for one gap.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FixAction {
    pub action_id: String,
    pub gap: DataGap,
    pub strategy: FixStrategy,
    pub status: FixStatus,
    pub requires_confirmation: bool,
    pub dry_run: bool,
    pub backup: Option<Backup>,
    pub error: Option<String>,
    /// Why an action was skipped, or other operator-facing context.
    pub note: Option<String>,
    /// Set when the target was restored from the backup after a failure.
    pub rolled_back: bool,
    pub executed_at: Option<DateTime<Utc>>,
}

impl FixAction {
    pub fn new(gap: DataGap, strategy: FixStrategy, requires_confirmation: bool) -> Self {
        Self {
            action_id: Uuid::new_v4().to_string(),
            gap,
            strategy,
            status: FixStatus::Pending,
            requires_confirmation,
            dry_run: false,
            backup: None,
            error: None,
            note: None,
            rolled_back: false,
            executed_at: None,
        }
    }

    pub fn record_id(&self) -> &str {
        self.gap.record_id()
    }

    pub(crate) fn skip(&mut self, note: impl Into<String>) {
        self.status = FixStatus::Skipped;
        self.note = Some(note.into());
        self.executed_at = Some(Utc::now());
    }
}

/// Ordered actions plus the gaps left for manual handling.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FixPlan {
    pub actions: Vec<FixAction>,
    /// Gaps that are not auto-fixable, unchanged.
    pub manual: Vec<DataGap>,
}

impl FixPlan {
    pub fn is_empty(&self) -> bool {
        self.actions.is_empty()
    }
}

/// Outcome of one `execute` call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FixReport {
    pub report_id: String,
    pub dry_run: bool,
    pub total_gaps: usize,
    pub auto_fixable: usize,
    pub fixed: usize,
    pub failed: usize,
    pub skipped: usize,
    pub rolled_back: usize,
    pub rollback_failures: usize,
    pub actions: Vec<FixAction>,
    pub manual_gaps: Vec<DataGap>,
    pub started_at: DateTime<Utc>,
    pub duration_seconds: f64,
}

impl FixReport {
    pub(crate) fn tally(&mut self) {
        self.fixed = self.count(FixStatus::Success);
        self.failed = self.count(FixStatus::Failed);
        self.skipped = self.count(FixStatus::Skipped);
        self.rolled_back = self
            .actions
            .iter()
            .filter(|a| a.rolled_back || a.status == FixStatus::RolledBack)
            .count();
    }

    pub fn count(&self, status: FixStatus) -> usize {
        self.actions.iter().filter(|a| a.status == status).count()
    }

    /// Multi-line human summary.
    pub fn summary(&self) -> String {
        let mode = if self.dry_run { " (dry run)" } else { "" };
        let mut out = format!(
            "Fix report {}{}\n  gaps: {} total, {} auto-fixable, {} manual\n  fixed: {}, failed: {}, skipped: {}, rolled back: {}\n",
            self.report_id,
            mode,
            self.total_gaps,
            self.auto_fixable,
            self.manual_gaps.len(),
            self.fixed,
            self.failed,
            self.skipped,
            self.rolled_back
        );
        for action in &self.actions {
            out.push_str(&format!(
                "  [{:?}] {} {} {} ({})",
                action.status,
                action.gap.gap_type,
                action.gap.entity_kind,
                action.record_id(),
                action.strategy
            ));
            if let Some(note) = action.error.as_ref().or(action.note.as_ref()) {
                out.push_str(&format!(": {}", note));
            }
            out.push('\n');
        }
        out
    }
}
