//! Migration orchestrator - main workflow coordinator.
//!
//! A run validates its configuration, then pages every configured entity kind
//! out of the source in batches. Each batch is mapped, sealed and written with
//! bounded retries, then optionally checked by the [`DataValidator`].
//! Cancellation is observed between batches only.

mod result;

pub use result::{KindStats, MigrationResult, RunError, RunStatus};

use std::sync::Arc;

use chrono::Utc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::{MigrationConfig, RetryPolicy};
use crate::core::{Backend, EntityKind, Record, RecordMapper, RecordSource, TargetStoreGateway};
use crate::error::{MigrateError, Result};
use crate::gaps::{GapDetector, GapSummary, Scope};
use crate::progress::{NoopReporter, ProgressReporter};
use crate::session::MigrationSession;
use crate::verify::DataValidator;

/// Why the batch loop stopped early.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Halt {
    Cancelled,
    Aborted,
    SourceFailed,
}

impl Halt {
    fn status(self) -> RunStatus {
        match self {
            Halt::Cancelled => RunStatus::Cancelled,
            Halt::Aborted => RunStatus::Aborted,
            Halt::SourceFailed => RunStatus::Failed,
        }
    }
}

/// Target state of a record before the run wrote it.
#[derive(Debug, Clone)]
struct PreImage {
    kind: EntityKind,
    id: String,
    record: Option<Record>,
    held_by: Vec<Backend>,
}

/// Migration orchestrator.
pub struct MigrationOrchestrator {
    source: Arc<dyn RecordSource>,
    target: Arc<dyn TargetStoreGateway>,
    session: Arc<MigrationSession>,
    reporter: Arc<dyn ProgressReporter>,
    cancel: CancellationToken,
    mapper: RecordMapper,
}

impl MigrationOrchestrator {
    /// Create a new orchestrator with a fresh session.
    pub fn new(source: Arc<dyn RecordSource>, target: Arc<dyn TargetStoreGateway>) -> Self {
        Self {
            source,
            target,
            session: Arc::new(MigrationSession::new()),
            reporter: Arc::new(NoopReporter),
            cancel: CancellationToken::new(),
            mapper: RecordMapper::default(),
        }
    }

    /// Share a session with a detector or fix engine.
    pub fn with_session(mut self, session: Arc<MigrationSession>) -> Self {
        self.session = session;
        self
    }

    pub fn with_reporter(mut self, reporter: Arc<dyn ProgressReporter>) -> Self {
        self.reporter = reporter;
        self
    }

    /// Token polled between batches.
    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn with_mapper(mut self, mapper: RecordMapper) -> Self {
        self.mapper = mapper;
        self
    }

    pub fn session(&self) -> Arc<MigrationSession> {
        Arc::clone(&self.session)
    }

    /// Run the migration.
    ///
    /// Only configuration errors are returned as `Err`; every other failure
    /// is reflected in the result's status and error list.
    pub async fn run(&self, config: &MigrationConfig) -> Result<MigrationResult> {
        if let Err(e) = config.validate() {
            self.reporter.on_error(&e);
            return Err(e);
        }

        let mut result = MigrationResult::start(config.dry_run);
        info!(
            "Starting migration run: {} ({} -> {}, source ref: {}, dry run: {})",
            result.run_id,
            self.source.name(),
            self.target.name(),
            config.source_ref,
            config.dry_run
        );

        let validator = DataValidator::new()
            .with_target(Arc::clone(&self.target))
            .with_mapper(self.mapper.clone())
            .with_volatile_fields(config.volatile_fields.clone());

        if config.detect_gaps_before {
            info!("Scanning for gaps before migration");
            let summary = self.scan_gaps(config, Scope::Pre, &mut result).await;
            result.gaps_before = summary;
        }

        // Phase 1: count
        for kind in &config.entity_kinds {
            match self.source.count(*kind).await {
                Ok(total) => result.set_kind_total(*kind, total),
                Err(e) => {
                    self.fatal(&mut result, Some(*kind), &e);
                    return Ok(self.complete(result, Some(Halt::SourceFailed)));
                }
            }
        }
        info!(
            "Found {} records across {} entity kinds",
            result.total_records,
            config.entity_kinds.len()
        );

        // Phase 2: transfer
        let mut written: Vec<PreImage> = Vec::new();
        let mut failing: Vec<PreImage> = Vec::new();
        let mut halt = None;
        let mut current = 0;

        'kinds: for kind in &config.entity_kinds {
            let kind = *kind;
            let records = match self.source.read_all(kind).await {
                Ok(records) => records,
                Err(e) => {
                    self.fatal(&mut result, Some(kind), &e);
                    halt = Some(Halt::SourceFailed);
                    break;
                }
            };
            result.set_kind_total(kind, records.len());

            for (index, chunk) in records.chunks(config.chunk_len()).enumerate() {
                let batch = index + 1;
                if self.cancel.is_cancelled() {
                    info!("Cancellation requested, stopping before {} batch {}", kind, batch);
                    halt = Some(Halt::Cancelled);
                    break 'kinds;
                }

                let mut journal = Vec::new();
                match self
                    .process_batch(kind, batch, chunk, config, &validator, &mut journal, &mut result)
                    .await
                {
                    Ok(()) => {
                        result.record_batch_success(kind, chunk.len());
                        written.extend(journal);
                    }
                    Err(e) => {
                        warn!("{} batch {}: failed - {}", kind, batch, e);
                        result.record_batch_failure(kind, batch, chunk.len(), &e);
                        self.reporter.on_error(&e);
                        if !config.continue_on_error {
                            failing.extend(journal);
                            halt = Some(Halt::Aborted);
                        }
                    }
                }

                current += chunk.len();
                self.reporter.on_progress(
                    current,
                    result.total_records,
                    &format!("{} batch {} ({} records)", kind, batch, chunk.len()),
                );

                if halt.is_some() {
                    info!("Aborting run after {} batch {}", kind, batch);
                    break 'kinds;
                }
            }
        }

        let rollback = match halt {
            Some(Halt::Aborted) | Some(Halt::Cancelled) => config.rollback_on_abort && !config.dry_run,
            _ => false,
        };
        if rollback {
            self.rollback(&written, &failing, &mut result).await;
        }

        // Phase 3: post-run scan
        let scan_after = config.detect_gaps_after
            && !config.dry_run
            && matches!(halt, None | Some(Halt::Aborted));
        if scan_after {
            info!("Scanning for gaps after migration");
            let summary = self.scan_gaps(config, Scope::Post, &mut result).await;
            result.gaps_after = summary;
        }

        Ok(self.complete(result, halt))
    }

    /// Map, seal, write and validate one batch.
    ///
    /// When rollback is enabled, the target state of every id is pushed to
    /// `journal` before the write. Validation infrastructure errors are
    /// recorded without failing the batch.
    #[allow(clippy::too_many_arguments)]
    async fn process_batch(
        &self,
        kind: EntityKind,
        batch: usize,
        chunk: &[Record],
        config: &MigrationConfig,
        validator: &DataValidator,
        journal: &mut Vec<PreImage>,
        result: &mut MigrationResult,
    ) -> Result<()> {
        let ingested_at = Utc::now();
        let prepared = chunk
            .iter()
            .map(|record| self.mapper.map(kind, record).map(|mapped| mapped.sealed(ingested_at)))
            .collect::<Result<Vec<_>>>()?;

        if config.dry_run {
            debug!("{} batch {}: {} records mapped (dry run)", kind, batch, prepared.len());
            return Ok(());
        }

        if config.rollback_on_abort {
            for record in &prepared {
                journal.push(self.capture(kind, &record.id).await?);
            }
        }
        self.write_with_retry(kind, batch, &prepared, &config.retry).await?;
        self.session.invalidate_target(kind);
        debug!("{} batch {}: wrote {} records", kind, batch, prepared.len());

        if config.validate_batches {
            let ids: Vec<String> = prepared.iter().map(|r| r.id.clone()).collect();
            let validated = match self.target.read_many(kind, &ids).await {
                Ok(stored) => validator.validate_batch(chunk, &stored).await,
                Err(e) => Err(e),
            };
            match validated {
                Ok(validation) => result.record_validation(&validation),
                Err(e) => {
                    warn!("{} batch {}: validation could not complete - {}", kind, batch, e);
                    result.record_error(Some(kind), Some(batch), &e);
                }
            }
        }
        Ok(())
    }

    /// Write a batch, retrying transient errors with exponential backoff.
    async fn write_with_retry(
        &self,
        kind: EntityKind,
        batch: usize,
        records: &[Record],
        policy: &RetryPolicy,
    ) -> Result<()> {
        let mut attempt = 0u32;
        loop {
            match self.target.write_batch(kind, records).await {
                Ok(()) => return Ok(()),
                Err(e) if e.is_transient() && attempt < policy.max_retries => {
                    attempt += 1;
                    let delay = policy.delay_for(attempt);
                    warn!(
                        "{} batch {}: transient error (attempt {}/{}), retrying in {:?} - {}",
                        kind, batch, attempt, policy.max_retries, delay, e
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn capture(&self, kind: EntityKind, id: &str) -> Result<PreImage> {
        Ok(PreImage {
            kind,
            id: id.to_string(),
            record: self.target.read_one(kind, id).await?,
            held_by: self.target.locate(kind, id).await?,
        })
    }

    /// Put one record back to its pre-image. Returns whether anything changed.
    async fn restore(&self, image: &PreImage) -> Result<bool> {
        let present = self.target.locate(image.kind, &image.id).await?;
        let current = self.target.read_one(image.kind, &image.id).await?;
        if present == image.held_by && current == image.record {
            return Ok(false);
        }
        for backend in present.iter().filter(|b| !image.held_by.contains(b)) {
            self.target.delete_from(*backend, image.kind, &image.id).await?;
        }
        if let Some(record) = &image.record {
            for backend in &image.held_by {
                self.target.upsert_into(*backend, record).await?;
            }
        }
        Ok(true)
    }

    /// Revert every write of this run, newest first.
    ///
    /// Records the run created are deleted; records it overwrote get their
    /// previous content back. The failing batch is reverted too, since a
    /// partial write may have reached some backends, but it is not counted as
    /// rolled back.
    async fn rollback(&self, written: &[PreImage], failing: &[PreImage], result: &mut MigrationResult) {
        info!("Rolling back {} records written by this run", written.len());
        for image in failing.iter().rev() {
            if let Err(e) = self.restore(image).await {
                warn!("Rollback of failed {} {}: {}", image.kind, image.id, e);
                result.record_error(Some(image.kind), None, &e);
            }
        }
        for image in written.iter().rev() {
            match self.restore(image).await {
                Ok(_) => result.rolled_back_records += 1,
                Err(e) => {
                    warn!("Rollback of {} {}: {}", image.kind, image.id, e);
                    result.record_error(Some(image.kind), None, &e);
                }
            }
        }
        self.session.invalidate_targets();
        info!("Rolled back {} records", result.rolled_back_records);
    }

    async fn scan_gaps(
        &self,
        config: &MigrationConfig,
        scope: Scope,
        result: &mut MigrationResult,
    ) -> Option<GapSummary> {
        let detector = GapDetector::new(
            Arc::clone(&self.source),
            Arc::clone(&self.target),
            Arc::clone(&self.session),
        )
        .with_mapper(self.mapper.clone());

        match detector.detect_all(&config.entity_kinds, scope).await {
            Ok(gaps) => {
                let summary = GapSummary::from_gaps(&gaps);
                info!(
                    "{:?} scan: {} gap(s), {} auto-fixable",
                    scope, summary.total, summary.auto_fixable
                );
                Some(summary)
            }
            Err(e) => {
                warn!("{:?} gap scan failed: {}", scope, e);
                result.record_error(None, None, &e);
                None
            }
        }
    }

    fn fatal(&self, result: &mut MigrationResult, kind: Option<EntityKind>, error: &MigrateError) {
        warn!("Fatal error: {}", error);
        result.record_error(kind, None, error);
        self.reporter.on_error(error);
    }

    fn complete(&self, mut result: MigrationResult, halt: Option<Halt>) -> MigrationResult {
        result.finalize(halt.map(Halt::status));
        info!(
            "Migration {:?}: {}/{} records migrated, {} failed, {} rolled back in {:.1}s",
            result.status,
            result.migrated_records,
            result.total_records,
            result.failed_records,
            result.rolled_back_records,
            result.duration_seconds
        );
        self.reporter.on_complete(&result);
        result
    }
}
