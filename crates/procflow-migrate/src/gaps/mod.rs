//! Gap detection between the legacy store and the target store.
//!
//! A scan proceeds in two passes per entity kind:
//!
//! - **Presence**: identifier-set difference between source and the union of
//!   the kind's backends, plus per-backend presence for partial migrations
//! - **Structure**: for ids on both sides, at most one of DataCorruption,
//!   VersionConflict or SchemaMismatch (first match wins)
//!
//! Every target record's references are then checked against the target id
//! sets of the referenced kinds. Scans are read-only; the only side effect is
//! the session's identifier-set cache.

mod types;

pub use types::{sort_gaps, DataGap, GapDetails, GapSummary, GapType, Scope, Severity};

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::core::{EntityKind, Record, RecordMapper, RecordSource, TargetStoreGateway};
use crate::error::Result;
use crate::session::MigrationSession;
use crate::verify::normalize::shape_conflict;

/// Scanner that classifies inconsistencies between source and target.
pub struct GapDetector {
    source: Arc<dyn RecordSource>,
    target: Arc<dyn TargetStoreGateway>,
    session: Arc<MigrationSession>,
    mapper: RecordMapper,
}

impl GapDetector {
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
        }
    }

    /// Field mappings used when comparing shapes.
    pub fn with_mapper(mut self, mapper: RecordMapper) -> Self {
        self.mapper = mapper;
        self
    }

    /// Scan several kinds and merge the results into one ordered list.
    pub async fn detect_all(&self, kinds: &[EntityKind], scope: Scope) -> Result<Vec<DataGap>> {
        if scope == Scope::Post {
            self.session.invalidate_targets();
        }
        let mut gaps = Vec::new();
        for kind in kinds {
            gaps.extend(self.scan_kind(*kind, scope).await?);
        }
        sort_gaps(&mut gaps);
        Ok(gaps)
    }

    /// Scan one kind. Output is ordered by severity, then kind, then id.
    pub async fn detect_gaps(&self, kind: EntityKind, scope: Scope) -> Result<Vec<DataGap>> {
        if scope == Scope::Post {
            self.session.invalidate_targets();
        }
        let mut gaps = self.scan_kind(kind, scope).await?;
        sort_gaps(&mut gaps);
        Ok(gaps)
    }

    async fn scan_kind(&self, kind: EntityKind, scope: Scope) -> Result<Vec<DataGap>> {
        debug!("Scanning {} ({:?})", kind, scope);

        let source_records: BTreeMap<String, Record> = self
            .source
            .read_all(kind)
            .await?
            .into_iter()
            .map(|r| (r.id.clone(), r))
            .collect();

        // Presence and content must come from the same read of the target.
        self.session.invalidate_target(kind);
        let backends = self.target.backends(kind);
        let mut per_backend = Vec::with_capacity(backends.len());
        for backend in &backends {
            per_backend.push((*backend, self.session.target_ids(self.target.as_ref(), *backend, kind).await?));
        }
        let target_ids: BTreeSet<String> = per_backend
            .iter()
            .flat_map(|(_, ids)| ids.iter().cloned())
            .collect();

        let target_records: BTreeMap<String, Record> = self
            .target
            .read_all(kind)
            .await?
            .into_iter()
            .map(|r| (r.id.clone(), r))
            .collect();

        let mut gaps = Vec::new();

        for (id, source_record) in &source_records {
            if !target_ids.contains(id) {
                gaps.push(DataGap::new(
                    GapType::MissingRecord,
                    kind,
                    Some(id.clone()),
                    None,
                    GapDetails {
                        scope: Some(scope),
                        source_version: Some(source_record.version),
                        ..GapDetails::new(format!("{} {} is missing from the target", kind, id))
                    },
                ));
            }
        }

        for id in &target_ids {
            let in_source = source_records.get(id);
            if in_source.is_none() {
                gaps.push(DataGap::new(
                    GapType::OrphanedRecord,
                    kind,
                    None,
                    Some(id.clone()),
                    GapDetails {
                        scope: Some(scope),
                        ..GapDetails::new(format!("{} {} exists only in the target", kind, id))
                    },
                ));
                continue;
            }

            let missing: Vec<_> = per_backend
                .iter()
                .filter(|(_, ids)| !ids.contains(id))
                .map(|(backend, _)| *backend)
                .collect();
            if !missing.is_empty() {
                let names: Vec<_> = missing.iter().map(|b| b.as_str()).collect();
                gaps.push(DataGap::new(
                    GapType::IncompleteMigration,
                    kind,
                    Some(id.clone()),
                    Some(id.clone()),
                    GapDetails {
                        scope: Some(scope),
                        missing_backends: missing,
                        ..GapDetails::new(format!(
                            "{} {} is missing from backend(s): {}",
                            kind,
                            id,
                            names.join(", ")
                        ))
                    },
                ));
            }
        }

        for (id, source_record) in &source_records {
            match target_records.get(id) {
                Some(target_record) => {
                    if let Some(gap) = self.structural_gap(kind, scope, source_record, target_record) {
                        gaps.push(gap);
                    }
                }
                None if target_ids.contains(id) => {
                    warn!("{} {} listed by a backend but not readable, skipping structural check", kind, id);
                }
                None => {}
            }
        }

        gaps.extend(self.integrity_gaps(kind, scope, target_records.values()).await?);

        let fixable = gaps.iter().filter(|g| g.auto_fixable).count();
        info!(
            "Gap scan for {}: {} gaps ({} auto-fixable), {} source / {} target records",
            kind,
            gaps.len(),
            fixable,
            source_records.len(),
            target_ids.len()
        );
        Ok(gaps)
    }

    /// First matching structural rule for an id present on both sides.
    fn structural_gap(
        &self,
        kind: EntityKind,
        scope: Scope,
        source: &Record,
        target: &Record,
    ) -> Option<DataGap> {
        let id = source.id.clone();
        let versions = |details: GapDetails| GapDetails {
            scope: Some(scope),
            source_version: Some(source.version),
            target_version: Some(target.version),
            ..details
        };

        if let Some(problem) = target.consistency_error() {
            return Some(DataGap::new(
                GapType::DataCorruption,
                kind,
                Some(id.clone()),
                Some(id),
                versions(GapDetails::new(problem)),
            ));
        }

        if target.version > source.version {
            return Some(DataGap::new(
                GapType::VersionConflict,
                kind,
                Some(id.clone()),
                Some(id),
                versions(GapDetails::new(format!(
                    "target version {} is newer than source version {}",
                    target.version, source.version
                ))),
            ));
        }

        let differing = self.schema_differences(source, target);
        if differing.is_empty() {
            return None;
        }
        let fixable = self.mapper.has_mappings(kind) && {
            let mapped = self.mapper.mapped_fields(kind);
            differing.iter().all(|f| mapped.contains(f))
        };
        let message = format!("fields differ in presence or type: {}", differing.join(", "));
        Some(
            DataGap::new(
                GapType::SchemaMismatch,
                kind,
                Some(id.clone()),
                Some(id),
                versions(GapDetails {
                    differing_fields: differing,
                    ..GapDetails::new(message)
                }),
            )
            .fixable(fixable),
        )
    }

    /// Fields that differ between the mapped source and the target record.
    ///
    /// Extension attributes must be present on both sides; payload fields and
    /// extensions present on both sides must have compatible shapes. Optional
    /// payload fields that are unset on one side are content, not schema.
    fn schema_differences(&self, source: &Record, target: &Record) -> Vec<String> {
        let mut differing = BTreeSet::new();
        if source.payload.kind() != target.payload.kind() {
            differing.insert("type".to_string());
        }

        let source_fields = self.mapper.apply(source).field_map();
        let target_fields = target.field_map();

        for name in source_fields.keys().chain(target_fields.keys()) {
            if !name.starts_with("extensions.") {
                continue;
            }
            if source_fields.contains_key(name) != target_fields.contains_key(name) {
                differing.insert(name.clone());
            }
        }
        for (name, value) in &source_fields {
            if let Some(other) = target_fields.get(name) {
                if shape_conflict(name, value, other).is_some() {
                    differing.insert(name.clone());
                }
            }
        }
        differing.into_iter().collect()
    }

    async fn integrity_gaps<'a>(
        &self,
        kind: EntityKind,
        scope: Scope,
        records: impl Iterator<Item = &'a Record>,
    ) -> Result<Vec<DataGap>> {
        let mut gaps = Vec::new();
        let mut target_sets: BTreeMap<EntityKind, BTreeSet<String>> = BTreeMap::new();
        let mut source_sets: BTreeMap<EntityKind, Arc<BTreeSet<String>>> = BTreeMap::new();

        for record in records {
            for reference in record.references() {
                if !target_sets.contains_key(&reference.kind) {
                    let union = self.session.target_union(self.target.as_ref(), reference.kind).await?;
                    target_sets.insert(reference.kind, union);
                }
                let present = target_sets
                    .get(&reference.kind)
                    .is_some_and(|ids| ids.contains(&reference.id));
                if present {
                    continue;
                }

                if !source_sets.contains_key(&reference.kind) {
                    let ids = self.session.source_ids(self.source.as_ref(), reference.kind).await?;
                    source_sets.insert(reference.kind, ids);
                }
                let in_source = source_sets
                    .get(&reference.kind)
                    .is_some_and(|ids| ids.contains(&reference.id));

                let mut details = GapDetails::new(format!(
                    "{} {} references {} {} via {}, which is absent from the target",
                    kind, record.id, reference.kind, reference.id, reference.field
                ));
                details.scope = Some(scope);
                details.referencing_field = Some(reference.field.to_string());
                details.referenced_kind = Some(reference.kind);
                details.referenced_id = Some(reference.id.clone());
                details.transitively_resolvable = in_source;
                if in_source {
                    details.resolved_by = Some(reference.id.clone());
                }
                gaps.push(DataGap::new(
                    GapType::IntegrityViolation,
                    kind,
                    None,
                    Some(record.id.clone()),
                    details,
                ));
            }
        }
        Ok(gaps)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{Backend, FieldMapping, MemorySource, MemoryTarget, Payload};
    use chrono::Utc;
    use serde_json::json;

    fn detector(source: &Arc<MemorySource>, target: &Arc<MemoryTarget>) -> GapDetector {
        GapDetector::new(source.clone(), target.clone(), Arc::new(MigrationSession::new()))
    }

    fn sealed(record: Record) -> Record {
        record.sealed(Utc::now())
    }

    fn count(gaps: &[DataGap], gap_type: GapType) -> usize {
        gaps.iter().filter(|g| g.gap_type == gap_type).count()
    }

    #[tokio::test]
    async fn test_missing_and_orphaned_records() {
        let source = Arc::new(MemorySource::new(
            (1..=5).map(|i| Record::process(format!("p-{}", i), "P")).collect(),
        ));
        let target = Arc::new(MemoryTarget::new());
        for i in 1..=3 {
            target.seed(sealed(Record::process(format!("p-{}", i), "P")));
        }
        target.seed(sealed(Record::process("p-99", "Extra")));

        let gaps = detector(&source, &target)
            .detect_gaps(EntityKind::Process, Scope::Pre)
            .await
            .unwrap();

        assert_eq!(count(&gaps, GapType::MissingRecord), 2);
        assert_eq!(count(&gaps, GapType::OrphanedRecord), 1);
        assert_eq!(gaps.len(), 3);
        let orphan = gaps.iter().find(|g| g.gap_type == GapType::OrphanedRecord).unwrap();
        assert_eq!(orphan.target_ref.as_deref(), Some("p-99"));
        assert_eq!(orphan.source_ref, None);
        assert!(orphan.auto_fixable);
    }

    #[tokio::test]
    async fn test_incomplete_migration_lists_missing_backends() {
        let source = Arc::new(MemorySource::new(vec![Record::process("p-1", "P")]));
        let target = Arc::new(MemoryTarget::new());
        target.seed_into(Backend::Relational, sealed(Record::process("p-1", "P")));

        let gaps = detector(&source, &target)
            .detect_gaps(EntityKind::Process, Scope::Pre)
            .await
            .unwrap();

        assert_eq!(gaps.len(), 1);
        assert_eq!(gaps[0].gap_type, GapType::IncompleteMigration);
        assert_eq!(
            gaps[0].details.missing_backends,
            vec![Backend::Graph, Backend::Vector]
        );
        assert!(gaps[0].auto_fixable);
    }

    #[tokio::test]
    async fn test_corruption_wins_over_version_conflict() {
        let source = Arc::new(MemorySource::new(vec![Record::process("p-1", "P")]));
        let target = Arc::new(MemoryTarget::new());
        let mut corrupted = sealed(Record::process("p-1", "P").with_version(5));
        if let Payload::Process(p) = &mut corrupted.payload {
            p.name = "garbled".into();
        }
        target.seed(corrupted);

        let gaps = detector(&source, &target)
            .detect_gaps(EntityKind::Process, Scope::Pre)
            .await
            .unwrap();
        assert_eq!(gaps.len(), 1);
        assert_eq!(gaps[0].gap_type, GapType::DataCorruption);
        assert_eq!(gaps[0].severity, Severity::Critical);
    }

    #[tokio::test]
    async fn test_non_ascii_checksum_is_corruption() {
        let source = Arc::new(MemorySource::new(vec![Record::process("p-1", "P")]));
        let target = Arc::new(MemoryTarget::new());
        let mut corrupted = sealed(Record::process("p-1", "P"));
        corrupted.checksum = Some(format!("a{}", "é".repeat(12)));
        target.seed(corrupted);

        let gaps = detector(&source, &target)
            .detect_gaps(EntityKind::Process, Scope::Pre)
            .await
            .unwrap();
        assert_eq!(gaps.len(), 1);
        assert_eq!(gaps[0].gap_type, GapType::DataCorruption);
    }

    #[tokio::test]
    async fn test_version_conflict_not_auto_fixable() {
        let source = Arc::new(MemorySource::new(vec![Record::process("p-1", "P").with_version(2)]));
        let target = Arc::new(MemoryTarget::new());
        target.seed(sealed(Record::process("p-1", "P edited").with_version(3)));

        let gaps = detector(&source, &target)
            .detect_gaps(EntityKind::Process, Scope::Pre)
            .await
            .unwrap();
        assert_eq!(gaps.len(), 1);
        assert_eq!(gaps[0].gap_type, GapType::VersionConflict);
        assert!(!gaps[0].auto_fixable);
        assert_eq!(gaps[0].details.target_version, Some(3));
    }

    #[tokio::test]
    async fn test_value_drift_is_not_a_gap() {
        let source = Arc::new(MemorySource::new(vec![Record::process("p-1", "Renamed")]));
        let target = Arc::new(MemoryTarget::new());
        target.seed(sealed(Record::process("p-1", "Original")));

        let gaps = detector(&source, &target)
            .detect_gaps(EntityKind::Process, Scope::Pre)
            .await
            .unwrap();
        assert!(gaps.is_empty());
    }

    #[tokio::test]
    async fn test_schema_mismatch_on_extension_type() {
        let source = Arc::new(MemorySource::new(vec![
            Record::process("p-1", "P").with_extension("sla", json!(3)),
        ]));
        let target = Arc::new(MemoryTarget::new());
        target.seed(sealed(Record::process("p-1", "P").with_extension("sla", json!("3 days"))));

        let gaps = detector(&source, &target)
            .detect_gaps(EntityKind::Process, Scope::Pre)
            .await
            .unwrap();
        assert_eq!(gaps.len(), 1);
        assert_eq!(gaps[0].gap_type, GapType::SchemaMismatch);
        assert_eq!(gaps[0].details.differing_fields, vec!["extensions.sla"]);
        assert!(!gaps[0].auto_fixable);
    }

    #[tokio::test]
    async fn test_schema_mismatch_resolved_by_field_mapping_is_fixable() {
        let source = Arc::new(MemorySource::new(vec![
            Record::process("p-1", "P").with_extension("dept", json!("claims")),
        ]));
        let target = Arc::new(MemoryTarget::new());
        // Written before the rename was declared.
        target.seed(sealed(Record::process("p-1", "P").with_extension("dept", json!("claims"))));

        let mut mappings = BTreeMap::new();
        mappings.insert(
            EntityKind::Process,
            vec![FieldMapping {
                from: "dept".into(),
                to: "department".into(),
            }],
        );
        let gaps = detector(&source, &target)
            .with_mapper(RecordMapper::new(mappings))
            .detect_gaps(EntityKind::Process, Scope::Pre)
            .await
            .unwrap();

        assert_eq!(gaps.len(), 1);
        assert_eq!(gaps[0].gap_type, GapType::SchemaMismatch);
        assert!(gaps[0].auto_fixable);
        assert_eq!(
            gaps[0].details.differing_fields,
            vec!["extensions.department", "extensions.dept"]
        );
    }

    #[tokio::test]
    async fn test_integrity_violation_transitively_resolvable() {
        let source = Arc::new(MemorySource::new(vec![
            Record::process("p-1", "P"),
            Record::element("e-1", "p-1", "task", "T"),
        ]));
        let target = Arc::new(MemoryTarget::new());
        target.seed(sealed(Record::element("e-1", "p-1", "task", "T")));

        let gaps = detector(&source, &target)
            .detect_all(&[EntityKind::Process, EntityKind::Element], Scope::Pre)
            .await
            .unwrap();

        let violation = gaps
            .iter()
            .find(|g| g.gap_type == GapType::IntegrityViolation)
            .unwrap();
        assert!(!violation.auto_fixable);
        assert!(violation.details.transitively_resolvable);
        assert_eq!(violation.details.resolved_by.as_deref(), Some("p-1"));
        assert_eq!(violation.target_ref.as_deref(), Some("e-1"));
        assert_eq!(count(&gaps, GapType::MissingRecord), 1);
    }

    #[tokio::test]
    async fn test_integrity_violation_unresolvable() {
        let source = Arc::new(MemorySource::new(vec![Record::element("e-1", "p-gone", "task", "T")]));
        let target = Arc::new(MemoryTarget::new());
        target.seed(sealed(Record::element("e-1", "p-gone", "task", "T")));

        let gaps = detector(&source, &target)
            .detect_gaps(EntityKind::Element, Scope::Pre)
            .await
            .unwrap();
        assert_eq!(gaps.len(), 1);
        assert!(!gaps[0].details.transitively_resolvable);
        assert_eq!(gaps[0].details.resolved_by, None);
    }

    #[tokio::test]
    async fn test_output_never_puts_lower_severity_first() {
        let source = Arc::new(MemorySource::new(vec![
            Record::process("p-1", "P"),
            Record::process("p-2", "P").with_version(1),
            Record::element("e-1", "p-1", "task", "T"),
        ]));
        let target = Arc::new(MemoryTarget::new());
        target.seed(sealed(Record::process("p-2", "P").with_version(4)));
        target.seed(sealed(Record::process("p-3", "Orphan")));
        target.seed_into(Backend::Graph, sealed(Record::element("e-1", "p-1", "task", "T")));

        let gaps = detector(&source, &target)
            .detect_all(&EntityKind::ALL, Scope::Pre)
            .await
            .unwrap();
        assert!(gaps.len() >= 4);
        for pair in gaps.windows(2) {
            assert!(pair[0].severity >= pair[1].severity);
        }
    }

    #[tokio::test]
    async fn test_rescan_sees_records_written_since_last_scan() {
        let source = Arc::new(MemorySource::new(vec![Record::process("p-1", "P")]));
        let target = Arc::new(MemoryTarget::new());
        let detector = detector(&source, &target);

        let before = detector.detect_gaps(EntityKind::Process, Scope::Pre).await.unwrap();
        assert_eq!(count(&before, GapType::MissingRecord), 1);

        target.seed(sealed(Record::process("p-1", "P")));
        let again = detector.detect_gaps(EntityKind::Process, Scope::Pre).await.unwrap();
        assert!(again.is_empty(), "unexpected gaps {:?}", again);

        target.delete_one(EntityKind::Process, "p-1").await.unwrap();
        let after = detector.detect_gaps(EntityKind::Process, Scope::Post).await.unwrap();
        assert_eq!(count(&after, GapType::MissingRecord), 1);
        assert!(after.iter().all(|g| g.details.scope == Some(Scope::Post)));
    }

    #[tokio::test]
    async fn test_scan_is_read_only() {
        let source = Arc::new(MemorySource::new(vec![Record::process("p-1", "P")]));
        let target = Arc::new(MemoryTarget::new());
        target.seed(sealed(Record::process("p-2", "P")));
        let before = target.snapshot();

        detector(&source, &target)
            .detect_all(&EntityKind::ALL, Scope::Post)
            .await
            .unwrap();
        assert_eq!(target.snapshot(), before);
        assert_eq!(target.write_calls(), 0);
        assert_eq!(target.delete_calls(), 0);
    }
}
