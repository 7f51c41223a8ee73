//! Configuration type definitions.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::core::{EntityKind, FieldMapping};
use crate::fix::{FixStrategy, MergeRules};
use crate::gaps::GapType;

/// Root configuration structure.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Legacy store snapshot.
    pub source: SourceConfig,

    /// Target store directory.
    pub target: TargetConfig,

    /// Migration run behavior.
    #[serde(default)]
    pub migration: MigrationConfig,

    /// Gap repair behavior.
    #[serde(default)]
    pub repair: RepairConfig,
}

/// Legacy store configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceConfig {
    /// JSON file holding the legacy records.
    pub path: PathBuf,
}

/// Target store configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TargetConfig {
    /// Directory holding one `<backend>.json` file per backend.
    pub path: PathBuf,
}

/// Input to a single migration run. Never mutated by the run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MigrationConfig {
    /// Identifier of the legacy store, recorded in logs and artifacts.
    #[serde(default = "default_source_ref")]
    pub source_ref: String,

    /// Kinds to migrate, processed in the listed order.
    #[serde(default = "default_entity_kinds")]
    pub entity_kinds: Vec<EntityKind>,

    /// Records per batch. Must be positive.
    #[serde(default = "default_batch_size")]
    pub batch_size: i64,

    /// Validate mappings only; never call the target store.
    #[serde(default)]
    pub dry_run: bool,

    /// Record failed batches and keep going instead of aborting.
    #[serde(default)]
    pub continue_on_error: bool,

    /// Revert every record written by the run when it aborts.
    #[serde(default)]
    pub rollback_on_abort: bool,

    /// Run the data validator after every written batch.
    #[serde(default = "default_true")]
    pub validate_batches: bool,

    /// Scan for gaps before the batch loop.
    #[serde(default)]
    pub detect_gaps_before: bool,

    /// Scan for gaps after the batch loop (skipped for dry runs).
    #[serde(default = "default_true")]
    pub detect_gaps_after: bool,

    /// Backoff for transient target errors.
    #[serde(default)]
    pub retry: RetryPolicy,

    /// Extra fields excluded from content checksums.
    #[serde(default)]
    pub volatile_fields: Vec<String>,
}

fn default_source_ref() -> String {
    "legacy".to_string()
}

fn default_entity_kinds() -> Vec<EntityKind> {
    EntityKind::ALL.to_vec()
}

fn default_batch_size() -> i64 {
    500
}

fn default_true() -> bool {
    true
}

impl Default for MigrationConfig {
    fn default() -> Self {
        Self {
            source_ref: default_source_ref(),
            entity_kinds: default_entity_kinds(),
            batch_size: default_batch_size(),
            dry_run: false,
            continue_on_error: false,
            rollback_on_abort: false,
            validate_batches: true,
            detect_gaps_before: false,
            detect_gaps_after: true,
            retry: RetryPolicy::default(),
            volatile_fields: Vec::new(),
        }
    }
}

impl MigrationConfig {
    /// Batch size as a chunk length. Only meaningful after validation.
    pub fn chunk_len(&self) -> usize {
        self.batch_size.max(1) as usize
    }
}

/// Bounded exponential backoff for transient target errors.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Maximum retries after the first attempt.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Delay before the first retry, in milliseconds.
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,

    /// Upper bound for any single delay, in milliseconds.
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
}

fn default_max_retries() -> u32 {
    3
}

fn default_base_delay_ms() -> u64 {
    100
}

fn default_max_delay_ms() -> u64 {
    5000
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
        }
    }
}

impl RetryPolicy {
    /// Policy that never retries.
    pub fn none() -> Self {
        Self {
            max_retries: 0,
            base_delay_ms: 0,
            max_delay_ms: 0,
        }
    }

    /// Delay before retry number `attempt` (1-based), doubling each time.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = 1u64 << attempt.saturating_sub(1).min(20);
        let ms = self.base_delay_ms.saturating_mul(factor).min(self.max_delay_ms);
        Duration::from_millis(ms)
    }
}

/// Repair configuration consumed by the auto-fix engine.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RepairConfig {
    /// Extension attribute renames per kind.
    #[serde(default)]
    pub field_mappings: BTreeMap<EntityKind, Vec<FieldMapping>>,

    /// Per-kind, per-field precedence for MergeData.
    #[serde(default)]
    pub merge_rules: MergeRules,

    /// Replacements for the default strategy of a gap type.
    #[serde(default)]
    pub strategy_overrides: BTreeMap<GapType, FixStrategy>,
}
