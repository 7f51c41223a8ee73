//! # procflow-migrate
//!
//! Migration and reconciliation engine for process-definition records.
//!
//! Records are moved from a legacy store into a target made of relational,
//! graph and vector backends. The library provides:
//!
//! - **Batched migration** with bounded retries, cooperative cancellation and
//!   optional rollback on abort
//! - **Per-batch validation** of counts, ids, content checksums, shapes and
//!   references
//! - **Gap detection** classifying every inconsistency between the two sides
//! - **Automatic repair** with confirmation gates, backups and rollback
//! - **Signed audit artifacts** for results, reports and gap lists
//!
//! ## Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use procflow_migrate::{Config, MemorySource, MemoryTarget, MigrationOrchestrator};
//!
//! #[tokio::main]
//! async fn main() -> procflow_migrate::Result<()> {
//!     let config = Config::load("config.yaml")?;
//!     let source = Arc::new(MemorySource::load(&config.source.path)?);
//!     let target = Arc::new(MemoryTarget::load_dir(&config.target.path)?);
//!     let orchestrator = MigrationOrchestrator::new(source, target.clone());
//!     let result = orchestrator.run(&config.migration).await?;
//!     println!("Migrated {} records", result.migrated_records);
//!     target.save_dir(&config.target.path)?;
//!     Ok(())
//! }
//! ```

pub mod audit;
pub mod config;
pub mod core;
pub mod error;
pub mod fix;
pub mod gaps;
pub mod orchestrator;
pub mod progress;
pub mod session;
pub mod verify;

// Re-exports for convenient access
pub use audit::{write_artifact, Artifact};
pub use config::{Config, MigrationConfig, RepairConfig, RetryPolicy, SourceConfig, TargetConfig};
pub use crate::core::{
    Backend, EntityKind, MemorySource, MemoryTarget, Payload, Record, RecordMapper, RecordSource,
    TargetStoreGateway,
};
pub use error::{MigrateError, Result};
pub use fix::{
    AutoApprove, AutoFixEngine, ConfirmPolicy, DenyAll, FixAction, FixPlan, FixReport, FixStatus,
    FixStrategy,
};
pub use gaps::{DataGap, GapDetector, GapSummary, GapType, Scope, Severity};
pub use orchestrator::{MigrationOrchestrator, MigrationResult, RunStatus};
pub use progress::{
    ChannelReporter, JsonLinesReporter, NoopReporter, ProgressEvent, ProgressReporter,
    TracingReporter,
};
pub use session::MigrationSession;
pub use verify::{DataValidator, ValidationResult, ValidationSummary};
