//! Planning and execution of reversible repairs for detected gaps.
//!
//! Every auto-fixable gap maps to exactly one declared [`FixStrategy`]. Each
//! action then passes through a fixed pipeline:
//!
//! 1. **Confirm**: actions marked `requires_confirmation` ask the [`ConfirmPolicy`]
//! 2. **Backup**: snapshot target presence, target record and source record
//! 3. **Dry run**: stop here and report success without touching the target
//! 4. **Re-check**: re-read the target so a fresher write is never clobbered
//! 5. **Dispatch**: run the strategy; on failure restore from the backup
//!
//! Failures are confined to their action; the rest of the plan continues.

mod backup;
mod confirm;
mod merge;
mod types;

pub use backup::{BackupStore, FileBackupStore, MemoryBackupStore};
pub use confirm::{AutoApprove, ConfirmPolicy, DenyAll};
pub use merge::{MergeRules, Precedence};
pub use types::{Backup, FixAction, FixPlan, FixReport, FixStatus, FixStrategy};

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::RepairConfig;
use crate::core::{Backend, EntityKind, Record, RecordMapper, RecordSource, TargetStoreGateway};
use crate::error::{MigrateError, Result};
use crate::gaps::{sort_gaps, DataGap, GapType};
use crate::session::MigrationSession;

/// Gap type to strategy mapping: the fixed defaults plus declared overrides.
#[derive(Debug, Clone, Default)]
pub struct StrategyTable {
    overrides: BTreeMap<GapType, FixStrategy>,
}

impl StrategyTable {
    pub fn new(overrides: BTreeMap<GapType, FixStrategy>) -> Self {
        Self { overrides }
    }

    pub fn strategy_for(&self, gap_type: GapType) -> Option<FixStrategy> {
        self.overrides
            .get(&gap_type)
            .copied()
            .or_else(|| gap_type.default_strategy())
    }

    /// Destructive strategies need confirmation, as do gap types the
    /// classification table marks "confirm required".
    pub fn requires_confirmation(gap_type: GapType, strategy: FixStrategy) -> bool {
        let destructive = match strategy {
            FixStrategy::DeleteFromTarget | FixStrategy::MergeData => true,
            FixStrategy::UpdateTarget => gap_type == GapType::DataCorruption,
            FixStrategy::CopyFromSource | FixStrategy::Skip => false,
        };
        destructive || gap_type.confirm_required()
    }
}

enum Outcome {
    Applied,
    AlreadyResolved(String),
}

/// Semi-automated repair engine.
///
/// The only component besides the orchestrator's batch writes that mutates
/// the target store, and every mutation it makes is preceded by a backup.
pub struct AutoFixEngine {
    source: Arc<dyn RecordSource>,
    target: Arc<dyn TargetStoreGateway>,
    session: Arc<MigrationSession>,
    mapper: RecordMapper,
    strategies: StrategyTable,
    merge_rules: MergeRules,
    backups: Arc<dyn BackupStore>,
}

impl AutoFixEngine {
    pub fn new(
        source: Arc<dyn RecordSource>,
        target: Arc<dyn TargetStoreGateway>,
        session: Arc<MigrationSession>,
    ) -> Self {
        Self {
            source,
            target,
            session,
            mapper: RecordMapper::default(),
            strategies: StrategyTable::default(),
            merge_rules: MergeRules::default(),
            backups: Arc::new(MemoryBackupStore::new()),
        }
    }

    /// Apply field mappings, merge rules and strategy overrides from config.
    pub fn with_repair_config(mut self, repair: &RepairConfig) -> Self {
        self.mapper = RecordMapper::new(repair.field_mappings.clone());
        self.merge_rules = repair.merge_rules.clone();
        self.strategies = StrategyTable::new(repair.strategy_overrides.clone());
        self
    }

    pub fn with_mapper(mut self, mapper: RecordMapper) -> Self {
        self.mapper = mapper;
        self
    }

    pub fn with_strategies(mut self, strategies: StrategyTable) -> Self {
        self.strategies = strategies;
        self
    }

    pub fn with_merge_rules(mut self, rules: MergeRules) -> Self {
        self.merge_rules = rules;
        self
    }

    pub fn with_backup_store(mut self, backups: Arc<dyn BackupStore>) -> Self {
        self.backups = backups;
        self
    }

    /// Map auto-fixable gaps to actions in processing order.
    ///
    /// Gaps that are not auto-fixable are returned unchanged in `manual`.
    pub fn plan(&self, gaps: &[DataGap]) -> FixPlan {
        let mut ordered = gaps.to_vec();
        sort_gaps(&mut ordered);

        let mut plan = FixPlan::default();
        for gap in ordered {
            if !gap.auto_fixable {
                plan.manual.push(gap);
                continue;
            }
            match self.strategies.strategy_for(gap.gap_type) {
                Some(strategy) => {
                    let confirm = StrategyTable::requires_confirmation(gap.gap_type, strategy);
                    plan.actions.push(FixAction::new(gap, strategy, confirm));
                }
                None => plan.manual.push(gap),
            }
        }

        info!(
            "Planned {} fix action(s), {} gap(s) left for manual handling",
            plan.actions.len(),
            plan.manual.len()
        );
        plan
    }

    /// Execute a plan. Never fails as a whole: every outcome lands on its action.
    pub async fn execute(&self, plan: FixPlan, confirm: &dyn ConfirmPolicy, dry_run: bool) -> FixReport {
        let started_at = Utc::now();
        let start = Instant::now();
        let FixPlan { mut actions, manual } = plan;
        actions.sort_by(|a, b| a.gap.processing_order(&b.gap));

        info!(
            "Executing fix plan: {} action(s){}",
            actions.len(),
            if dry_run { " (dry run)" } else { "" }
        );

        let mut seen = HashSet::new();
        let mut rollback_failures = 0;
        for action in actions.iter_mut() {
            action.dry_run = dry_run;
            if !seen.insert(action.gap.gap_id.clone()) {
                action.skip("duplicate of an earlier action for the same gap");
                continue;
            }
            if !self.session.try_begin(&action.gap.gap_id) {
                action.skip("gap is already being repaired in this session");
                continue;
            }
            if !self.process(action, confirm, dry_run).await {
                rollback_failures += 1;
            }
            self.session.finish(&action.gap.gap_id);
        }

        let mut report = FixReport {
            report_id: Uuid::new_v4().to_string(),
            dry_run,
            total_gaps: actions.len() + manual.len(),
            auto_fixable: actions.len(),
            fixed: 0,
            failed: 0,
            skipped: 0,
            rolled_back: 0,
            rollback_failures,
            actions,
            manual_gaps: manual,
            started_at,
            duration_seconds: start.elapsed().as_secs_f64(),
        };
        report.tally();

        info!(
            "Fix plan done: {} fixed, {} failed, {} skipped, {} rolled back",
            report.fixed, report.failed, report.skipped, report.rolled_back
        );
        report
    }

    /// Run one action through the pipeline. Returns false if an automatic
    /// rollback failed.
    async fn process(&self, action: &mut FixAction, confirm: &dyn ConfirmPolicy, dry_run: bool) -> bool {
        let kind = action.gap.entity_kind;

        if action.requires_confirmation && !confirm.confirm(action) {
            warn!(
                "Skipping {} for {} {}: not confirmed",
                action.strategy,
                kind,
                action.record_id()
            );
            action.skip("declined at confirmation");
            return true;
        }

        action.status = FixStatus::InProgress;
        action.executed_at = Some(Utc::now());

        if action.strategy == FixStrategy::Skip {
            action.status = FixStatus::Success;
            action.note = Some("strategy is skip, nothing to do".into());
            return true;
        }

        match self.create_backup(action, !dry_run).await {
            Ok(backup) => action.backup = Some(backup),
            Err(e) => {
                error!("Backup failed for gap {}: {}", action.gap.gap_id, e);
                action.status = FixStatus::Failed;
                action.error = Some(e.to_string());
                return true;
            }
        }

        if dry_run {
            action.status = FixStatus::Success;
            action.note = Some("dry run, no changes written".into());
            return true;
        }

        let outcome = self.apply(action).await;
        self.session.invalidate_target(kind);

        match outcome {
            Ok(Outcome::Applied) => {
                debug!("Applied {} to {} {}", action.strategy, kind, action.record_id());
                action.status = FixStatus::Success;
                true
            }
            Ok(Outcome::AlreadyResolved(note)) => {
                warn!("Skipping {} {}: {}", kind, action.record_id(), note);
                action.skip(note);
                true
            }
            Err(e) => {
                error!(
                    "{} failed for {} {}: {}",
                    action.strategy,
                    kind,
                    action.record_id(),
                    e
                );
                action.status = FixStatus::Failed;
                action.error = Some(e.to_string());
                match self.rollback_fix(action).await {
                    Ok(()) => true,
                    Err(rollback) => {
                        error!("Rollback failed for gap {}: {}", action.gap.gap_id, rollback);
                        action.error = Some(format!("{}; rollback failed: {}", e, rollback));
                        false
                    }
                }
            }
        }
    }

    async fn create_backup(&self, action: &FixAction, persist: bool) -> Result<Backup> {
        let kind = action.gap.entity_kind;
        let id = action.record_id().to_string();
        let snapshot_err =
            |e: MigrateError| MigrateError::Backup(format!("snapshot of {} {} failed: {}", kind, id, e));

        let target_snapshot = self.target.read_one(kind, &id).await.map_err(snapshot_err)?;
        let target_presence = self.target.locate(kind, &id).await.map_err(snapshot_err)?;
        let source_reference = self.source.read_one(kind, &id).await.map_err(snapshot_err)?;

        let backup = Backup {
            backup_id: Uuid::new_v4().to_string(),
            gap_id: action.gap.gap_id.clone(),
            entity_kind: kind,
            record_id: id,
            target_snapshot,
            target_presence,
            source_reference,
            taken_at: Utc::now(),
        };
        if persist {
            self.backups.put(&backup)?;
        }
        Ok(backup)
    }

    async fn apply(&self, action: &FixAction) -> Result<Outcome> {
        let kind = action.gap.entity_kind;
        let id = action.record_id();
        let gap_id = &action.gap.gap_id;

        match action.strategy {
            FixStrategy::CopyFromSource | FixStrategy::UpdateTarget => {
                let source = self.source_record(kind, id, gap_id).await?;
                let current = self.target.read_one(kind, id).await?;
                // A corrupted record's version is not trusted.
                let guard_version = action.gap.gap_type != GapType::DataCorruption;
                if let Some(current) = current.as_ref().filter(|_| guard_version) {
                    if current.version > source.version {
                        return Ok(Outcome::AlreadyResolved(format!(
                            "target holds a newer version ({} > {})",
                            current.version, source.version
                        )));
                    }
                }

                if action.gap.gap_type == GapType::IncompleteMigration {
                    let present = self.target.locate(kind, id).await?;
                    let missing: Vec<Backend> = self
                        .target
                        .backends(kind)
                        .into_iter()
                        .filter(|b| !present.contains(b))
                        .collect();
                    if missing.is_empty() {
                        return Ok(Outcome::AlreadyResolved(
                            "every backend already holds the record".into(),
                        ));
                    }
                    let record = self.prepare(kind, &source, current.as_ref())?;
                    for backend in missing {
                        self.target.upsert_into(backend, &record).await?;
                    }
                    return Ok(Outcome::Applied);
                }

                if action.gap.gap_type == GapType::MissingRecord && current.is_some() {
                    return Ok(Outcome::AlreadyResolved(
                        "record was migrated after the scan".into(),
                    ));
                }
                let record = self.prepare(kind, &source, current.as_ref())?;
                if current.as_ref() == Some(&record) {
                    return Ok(Outcome::AlreadyResolved(
                        "target already matches the source".into(),
                    ));
                }
                self.target.write_batch(kind, std::slice::from_ref(&record)).await?;
                Ok(Outcome::Applied)
            }
            FixStrategy::DeleteFromTarget => {
                if !self.target.delete_one(kind, id).await? {
                    debug!("{} {} already absent from the target", kind, id);
                }
                Ok(Outcome::Applied)
            }
            FixStrategy::MergeData => {
                let source = self.source_record(kind, id, gap_id).await?;
                let record = match self.target.read_one(kind, id).await? {
                    Some(current) => {
                        if current.version > source.version {
                            return Ok(Outcome::AlreadyResolved(format!(
                                "target holds a newer version ({} > {})",
                                current.version, source.version
                            )));
                        }
                        let mapped = self.mapper.map(kind, &source)?;
                        self.merge_rules.merge(&mapped, &current)?
                    }
                    None => self.prepare(kind, &source, None)?,
                };
                self.target.write_batch(kind, std::slice::from_ref(&record)).await?;
                Ok(Outcome::Applied)
            }
            FixStrategy::Skip => Ok(Outcome::Applied),
        }
    }

    async fn source_record(&self, kind: EntityKind, id: &str, gap_id: &str) -> Result<Record> {
        self.source
            .read_one(kind, id)
            .await?
            .ok_or_else(|| MigrateError::fix(gap_id, format!("{} {} no longer exists in the source", kind, id)))
    }

    /// Map and seal a source record, keeping the target's ingestion time.
    fn prepare(&self, kind: EntityKind, source: &Record, current: Option<&Record>) -> Result<Record> {
        let stamp = current.and_then(|c| c.ingested_at).unwrap_or_else(Utc::now);
        Ok(self.mapper.map(kind, source)?.sealed(stamp))
    }

    /// Put every backend back to the state captured in the backup.
    async fn restore(&self, backup: &Backup) -> Result<()> {
        let kind = backup.entity_kind;
        for backend in self.target.backends(kind) {
            if backup.target_presence.contains(&backend) {
                if let Some(snapshot) = &backup.target_snapshot {
                    self.target.upsert_into(backend, snapshot).await?;
                }
            } else {
                self.target.delete_from(backend, kind, &backup.record_id).await?;
            }
        }
        Ok(())
    }

    /// Restore the target from an action's backup.
    ///
    /// A Success action moves to RolledBack. A Failed action keeps its status
    /// and gets `rolled_back` set. Dry-run actions wrote nothing, so only their
    /// status changes.
    pub async fn rollback_fix(&self, action: &mut FixAction) -> Result<()> {
        let backup = action.backup.clone().ok_or_else(|| {
            MigrateError::fix(&action.gap.gap_id, "no backup recorded for this action")
        })?;

        match action.status {
            FixStatus::Success => {
                if !action.dry_run {
                    self.restore(&backup).await?;
                }
                action.status = FixStatus::RolledBack;
            }
            FixStatus::Failed => {
                self.restore(&backup).await?;
                action.rolled_back = true;
            }
            other => {
                return Err(MigrateError::fix(
                    &action.gap.gap_id,
                    format!("cannot roll back an action in status {:?}", other),
                ));
            }
        }
        self.session.invalidate_target(backup.entity_kind);
        info!(
            "Rolled back {} for {} {}",
            action.strategy, backup.entity_kind, backup.record_id
        );
        Ok(())
    }

    /// Roll back every successful action of a report, newest first.
    ///
    /// Returns the number of actions rolled back.
    pub async fn undo(&self, report: &mut FixReport) -> usize {
        let mut undone = 0;
        for action in report.actions.iter_mut().rev() {
            if action.status != FixStatus::Success || action.backup.is_none() {
                continue;
            }
            match self.rollback_fix(action).await {
                Ok(()) => undone += 1,
                Err(e) => {
                    warn!("Undo failed for gap {}: {}", action.gap.gap_id, e);
                    report.rollback_failures += 1;
                }
            }
        }
        report.tally();
        undone
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{MemorySource, MemoryTarget, Payload};
    use crate::gaps::{GapDetails, GapDetector, Scope};
    use serde_json::json;

    struct Fixture {
        source: Arc<MemorySource>,
        target: Arc<MemoryTarget>,
        session: Arc<MigrationSession>,
        backups: Arc<MemoryBackupStore>,
    }

    impl Fixture {
        fn new(source: Vec<Record>) -> Self {
            Self {
                source: Arc::new(MemorySource::new(source)),
                target: Arc::new(MemoryTarget::new()),
                session: Arc::new(MigrationSession::new()),
                backups: Arc::new(MemoryBackupStore::new()),
            }
        }

        fn engine(&self) -> AutoFixEngine {
            AutoFixEngine::new(self.source.clone(), self.target.clone(), self.session.clone())
                .with_backup_store(self.backups.clone())
        }

        async fn gaps(&self, kinds: &[EntityKind]) -> Vec<DataGap> {
            GapDetector::new(self.source.clone(), self.target.clone(), self.session.clone())
                .detect_all(kinds, Scope::Post)
                .await
                .unwrap()
        }
    }

    fn sealed(record: Record) -> Record {
        record.sealed(Utc::now())
    }

    fn corrupted(record: Record) -> Record {
        let mut record = sealed(record);
        if let Payload::Process(p) = &mut record.payload {
            p.name = format!("{} (garbled)", p.name);
        }
        record
    }

    fn gap(gap_type: GapType, id: &str) -> DataGap {
        DataGap::new(
            gap_type,
            EntityKind::Process,
            Some(id.into()),
            Some(id.into()),
            GapDetails::new("test"),
        )
    }

    #[test]
    fn test_plan_excludes_non_auto_fixable() {
        let fixture = Fixture::new(vec![]);
        let gaps = vec![
            gap(GapType::VersionConflict, "p-1"),
            gap(GapType::IntegrityViolation, "p-2"),
            gap(GapType::SchemaMismatch, "p-3"),
            gap(GapType::MissingRecord, "p-4"),
        ];
        let plan = fixture.engine().plan(&gaps);

        assert_eq!(plan.actions.len(), 1);
        assert_eq!(plan.actions[0].gap.gap_type, GapType::MissingRecord);
        assert_eq!(plan.manual.len(), 3);
        assert!(plan.actions.iter().all(|a| a.gap.auto_fixable));
        assert!(plan.actions.iter().all(|a| a.status == FixStatus::Pending));
    }

    #[test]
    fn test_plan_confirmation_defaults() {
        let fixture = Fixture::new(vec![]);
        let plan = fixture.engine().plan(&[
            gap(GapType::MissingRecord, "p-1"),
            gap(GapType::OrphanedRecord, "p-2"),
            gap(GapType::DataCorruption, "p-3"),
            gap(GapType::IncompleteMigration, "p-4"),
        ]);
        let confirm: BTreeMap<_, _> = plan
            .actions
            .iter()
            .map(|a| (a.gap.gap_type, (a.strategy, a.requires_confirmation)))
            .collect();

        assert_eq!(confirm[&GapType::MissingRecord], (FixStrategy::CopyFromSource, false));
        assert_eq!(confirm[&GapType::OrphanedRecord], (FixStrategy::DeleteFromTarget, true));
        assert_eq!(confirm[&GapType::DataCorruption], (FixStrategy::UpdateTarget, true));
        assert_eq!(confirm[&GapType::IncompleteMigration], (FixStrategy::CopyFromSource, false));
        // Critical first.
        assert_eq!(plan.actions[0].gap.gap_type, GapType::DataCorruption);
    }

    #[test]
    fn test_strategy_override() {
        let fixture = Fixture::new(vec![]);
        let mut overrides = BTreeMap::new();
        overrides.insert(GapType::DataCorruption, FixStrategy::MergeData);
        let plan = fixture
            .engine()
            .with_strategies(StrategyTable::new(overrides))
            .plan(&[gap(GapType::DataCorruption, "p-1")]);
        assert_eq!(plan.actions[0].strategy, FixStrategy::MergeData);
        assert!(plan.actions[0].requires_confirmation);
    }

    #[tokio::test]
    async fn test_copy_missing_record() {
        let fixture = Fixture::new(vec![Record::process("p-1", "Intake")]);
        let gaps = fixture.gaps(&[EntityKind::Process]).await;
        let engine = fixture.engine();

        let report = engine.execute(engine.plan(&gaps), &AutoApprove, false).await;

        assert_eq!(report.fixed, 1);
        assert_eq!(report.auto_fixable, 1);
        let action = &report.actions[0];
        assert_eq!(action.status, FixStatus::Success);
        assert!(action.backup.is_some());
        assert!(action.executed_at.is_some());
        assert_eq!(fixture.backups.len(), 1);

        let written = fixture.target.read_one(EntityKind::Process, "p-1").await.unwrap().unwrap();
        assert_eq!(written.consistency_error(), None);
        assert!(fixture.gaps(&[EntityKind::Process]).await.is_empty());
    }

    #[tokio::test]
    async fn test_declined_delete_leaves_record() {
        let fixture = Fixture::new(vec![]);
        fixture.target.seed(sealed(Record::process("p-9", "Orphan")));
        let gaps = fixture.gaps(&[EntityKind::Process]).await;
        let engine = fixture.engine();

        let deny = |_: &FixAction| false;
        let report = engine.execute(engine.plan(&gaps), &deny, false).await;

        assert_eq!(report.skipped, 1);
        assert_eq!(report.actions[0].status, FixStatus::Skipped);
        assert!(report.actions[0].backup.is_none());
        assert!(fixture.target.read_one(EntityKind::Process, "p-9").await.unwrap().is_some());
        assert_eq!(fixture.target.delete_calls(), 0);
        assert!(fixture.backups.is_empty());
    }

    #[tokio::test]
    async fn test_dry_run_touches_nothing() {
        let fixture = Fixture::new(vec![
            Record::process("p-1", "Missing"),
            Record::process("p-2", "Partial"),
            Record::process("p-3", "Corrupt"),
        ]);
        fixture
            .target
            .seed_into(Backend::Relational, sealed(Record::process("p-2", "Partial")));
        fixture.target.seed(corrupted(Record::process("p-3", "Corrupt")));
        fixture.target.seed(sealed(Record::process("p-9", "Orphan")));
        let before = fixture.target.snapshot();

        let gaps = fixture.gaps(&[EntityKind::Process]).await;
        let engine = fixture.engine();
        let report = engine.execute(engine.plan(&gaps), &AutoApprove, true).await;

        assert!(report.dry_run);
        assert_eq!(report.auto_fixable, 4);
        assert_eq!(report.fixed, report.auto_fixable);
        assert!(report.actions.iter().all(|a| a.backup.is_some()));
        assert_eq!(fixture.target.write_calls(), 0);
        assert_eq!(fixture.target.delete_calls(), 0);
        assert_eq!(fixture.target.snapshot(), before);
        assert!(fixture.backups.is_empty());
    }

    #[tokio::test]
    async fn test_failed_write_rolls_back_to_backup() {
        let fixture = Fixture::new(vec![
            Record::process("p-1", "Breaks"),
            Record::process("p-2", "Fine"),
        ]);
        fixture.target.fail_partially_for("p-1");
        let gaps = fixture.gaps(&[EntityKind::Process]).await;
        let engine = fixture.engine();

        let report = engine.execute(engine.plan(&gaps), &AutoApprove, false).await;

        assert_eq!(report.failed, 1);
        assert_eq!(report.fixed, 1);
        assert_eq!(report.rolled_back, 1);
        assert_eq!(report.rollback_failures, 0);

        let failed = report.actions.iter().find(|a| a.record_id() == "p-1").unwrap();
        assert_eq!(failed.status, FixStatus::Failed);
        assert!(failed.rolled_back);
        assert!(failed.error.is_some());

        let backup = failed.backup.as_ref().unwrap();
        let presence = fixture.target.locate(EntityKind::Process, "p-1").await.unwrap();
        assert_eq!(presence, backup.target_presence);
        assert_eq!(
            fixture.target.read_one(EntityKind::Process, "p-1").await.unwrap(),
            backup.target_snapshot
        );
        assert!(fixture.target.read_one(EntityKind::Process, "p-2").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_rollback_failure_is_reported_and_plan_continues() {
        let fixture = Fixture::new(vec![
            Record::process("p-1", "Corrupt"),
            Record::process("p-2", "Missing"),
        ]);
        fixture.target.seed(corrupted(Record::process("p-1", "Corrupt")));
        fixture.target.fail_writes_for("p-1");
        let gaps = fixture.gaps(&[EntityKind::Process]).await;
        let engine = fixture.engine();

        let report = engine.execute(engine.plan(&gaps), &AutoApprove, false).await;

        assert_eq!(report.rollback_failures, 1);
        let failed = report.actions.iter().find(|a| a.record_id() == "p-1").unwrap();
        assert_eq!(failed.status, FixStatus::Failed);
        assert!(!failed.rolled_back);
        assert!(failed.error.as_deref().unwrap().contains("rollback failed"));
        assert_eq!(report.fixed, 1);
    }

    #[tokio::test]
    async fn test_backup_failure_blocks_mutation() {
        let fixture = Fixture::new(vec![Record::process("p-1", "Intake")]);
        fixture.backups.set_failing(true);
        let gaps = fixture.gaps(&[EntityKind::Process]).await;
        let engine = fixture.engine();

        let report = engine.execute(engine.plan(&gaps), &AutoApprove, false).await;

        assert_eq!(report.failed, 1);
        assert!(report.actions[0].error.as_deref().unwrap().contains("Backup"));
        assert_eq!(fixture.target.write_calls(), 0);
    }

    #[tokio::test]
    async fn test_update_target_is_idempotent() {
        let fixture = Fixture::new(vec![Record::process("p-1", "Intake")]);
        fixture.target.seed(corrupted(Record::process("p-1", "Intake")));
        let gaps = fixture.gaps(&[EntityKind::Process]).await;
        assert_eq!(gaps[0].gap_type, GapType::DataCorruption);
        let engine = fixture.engine();

        let first = engine.execute(engine.plan(&gaps), &AutoApprove, false).await;
        assert_eq!(first.fixed, 1);
        let after_first = fixture.target.snapshot();

        let second = engine.execute(engine.plan(&gaps), &AutoApprove, false).await;
        assert_eq!(second.failed, 0);
        assert_eq!(fixture.target.snapshot(), after_first);
    }

    #[tokio::test]
    async fn test_copy_from_source_is_idempotent() {
        let fixture = Fixture::new(vec![Record::process("p-1", "Intake")]);
        let gaps = fixture.gaps(&[EntityKind::Process]).await;
        let engine = fixture.engine();

        engine.execute(engine.plan(&gaps), &AutoApprove, false).await;
        let after_first = fixture.target.snapshot();
        let second = engine.execute(engine.plan(&gaps), &AutoApprove, false).await;

        assert_eq!(second.skipped, 1);
        assert!(second.actions[0].note.as_deref().unwrap().contains("migrated after the scan"));
        assert_eq!(fixture.target.snapshot(), after_first);
    }

    #[tokio::test]
    async fn test_incomplete_migration_copies_missing_backends_only() {
        let fixture = Fixture::new(vec![Record::process("p-1", "Intake")]);
        fixture
            .target
            .seed_into(Backend::Relational, sealed(Record::process("p-1", "Intake")));
        let gaps = fixture.gaps(&[EntityKind::Process]).await;
        let engine = fixture.engine();

        let report = engine.execute(engine.plan(&gaps), &AutoApprove, false).await;

        assert_eq!(report.fixed, 1);
        assert_eq!(fixture.target.write_calls(), 2);
        assert_eq!(
            fixture.target.locate(EntityKind::Process, "p-1").await.unwrap(),
            vec![Backend::Relational, Backend::Graph, Backend::Vector]
        );
    }

    #[tokio::test]
    async fn test_newer_target_version_is_not_clobbered() {
        let fixture = Fixture::new(vec![Record::process("p-1", "Intake")]);
        let gaps = fixture.gaps(&[EntityKind::Process]).await;
        let fresher = sealed(Record::process("p-1", "Edited in new system").with_version(4));
        fixture.target.seed(fresher.clone());
        let engine = fixture.engine();

        let report = engine.execute(engine.plan(&gaps), &AutoApprove, false).await;

        assert_eq!(report.skipped, 1);
        assert!(report.actions[0].note.as_deref().unwrap().contains("newer version"));
        assert_eq!(
            fixture.target.read_one(EntityKind::Process, "p-1").await.unwrap(),
            Some(fresher)
        );
    }

    #[tokio::test]
    async fn test_corrupted_record_with_inflated_version_is_repaired() {
        let fixture = Fixture::new(vec![Record::process("p-1", "Intake")]);
        fixture
            .target
            .seed(corrupted(Record::process("p-1", "Intake").with_version(9_999)));
        let gaps = fixture.gaps(&[EntityKind::Process]).await;
        assert_eq!(gaps[0].gap_type, GapType::DataCorruption);
        let engine = fixture.engine();

        let report = engine.execute(engine.plan(&gaps), &AutoApprove, false).await;

        assert_eq!(report.fixed, 1);
        let repaired = fixture
            .target
            .read_one(EntityKind::Process, "p-1")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(repaired.version, 1);
        assert_eq!(repaired.consistency_error(), None);
    }

    #[tokio::test]
    async fn test_merge_preserves_declared_target_fields() {
        let source = Record::process("p-1", "Intake").with_extension("review_state", json!("draft"));
        let fixture = Fixture::new(vec![source]);
        fixture.target.seed(corrupted(
            Record::process("p-1", "Intake")
                .with_extension("review_state", json!("approved"))
                .with_extension("embedding_id", json!("vec-1")),
        ));

        let mut fields = BTreeMap::new();
        fields.insert("extensions.review_state".to_string(), Precedence::Target);
        let mut rules = BTreeMap::new();
        rules.insert(EntityKind::Process, fields);
        let mut overrides = BTreeMap::new();
        overrides.insert(GapType::DataCorruption, FixStrategy::MergeData);
        let engine = fixture
            .engine()
            .with_merge_rules(MergeRules::new(rules))
            .with_strategies(StrategyTable::new(overrides));

        let gaps = fixture.gaps(&[EntityKind::Process]).await;
        let report = engine.execute(engine.plan(&gaps), &AutoApprove, false).await;
        assert_eq!(report.fixed, 1);

        let merged = fixture.target.read_one(EntityKind::Process, "p-1").await.unwrap().unwrap();
        assert_eq!(merged.extensions["review_state"], json!("approved"));
        assert_eq!(merged.extensions["embedding_id"], json!("vec-1"));
        match merged.payload {
            Payload::Process(p) => assert_eq!(p.name, "Intake"),
            other => panic!("unexpected payload {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_delete_absent_record_is_success() {
        let fixture = Fixture::new(vec![]);
        fixture.target.seed(sealed(Record::process("p-9", "Orphan")));
        let gaps = fixture.gaps(&[EntityKind::Process]).await;
        fixture.target.delete_one(EntityKind::Process, "p-9").await.unwrap();
        let engine = fixture.engine();

        let report = engine.execute(engine.plan(&gaps), &AutoApprove, false).await;
        assert_eq!(report.fixed, 1);
    }

    #[tokio::test]
    async fn test_rollback_fix_and_undo() {
        let fixture = Fixture::new(vec![
            Record::process("p-1", "A"),
            Record::process("p-2", "B"),
        ]);
        fixture.target.seed(sealed(Record::process("p-9", "Orphan")));
        let before = fixture.target.snapshot();
        let gaps = fixture.gaps(&[EntityKind::Process]).await;
        let engine = fixture.engine();

        let mut report = engine.execute(engine.plan(&gaps), &AutoApprove, false).await;
        assert_eq!(report.fixed, 3);
        assert_ne!(fixture.target.snapshot(), before);

        let undone = engine.undo(&mut report).await;
        assert_eq!(undone, 3);
        assert_eq!(report.fixed, 0);
        assert_eq!(report.rolled_back, 3);
        assert!(report.actions.iter().all(|a| a.status == FixStatus::RolledBack));
        assert_eq!(fixture.target.snapshot(), before);
    }

    #[tokio::test]
    async fn test_rollback_fix_requires_backup() {
        let fixture = Fixture::new(vec![]);
        let engine = fixture.engine();
        let mut action = FixAction::new(gap(GapType::MissingRecord, "p-1"), FixStrategy::CopyFromSource, false);
        action.status = FixStatus::Success;
        assert!(engine.rollback_fix(&mut action).await.is_err());
    }

    #[tokio::test]
    async fn test_duplicate_and_in_flight_gaps_skipped() {
        let fixture = Fixture::new(vec![
            Record::process("p-1", "A"),
            Record::process("p-2", "B"),
        ]);
        let gaps = fixture.gaps(&[EntityKind::Process]).await;
        let engine = fixture.engine();

        let mut plan = engine.plan(&gaps);
        plan.actions.push(plan.actions[0].clone());
        fixture.session.try_begin(&plan.actions[1].gap.gap_id);

        let report = engine.execute(plan, &AutoApprove, false).await;
        assert_eq!(report.fixed, 1);
        assert_eq!(report.skipped, 2);
    }
}
