//! Scoped migration session shared by gap detection and repair.
//!
//! The session owns the identifier-set cache and the registry of gaps whose
//! repair is in flight. Two sessions never share state, so independent runs in
//! one process stay isolated and the cache lives exactly as long as the
//! session.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::{Arc, Mutex};

use tracing::debug;
use uuid::Uuid;

use crate::core::memory::lock;
use crate::core::{Backend, EntityKind, RecordSource, TargetStoreGateway};
use crate::error::Result;

/// Which side of the migration an identifier set was read from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Side {
    Source,
    Target(Backend),
}

type IdSet = Arc<BTreeSet<String>>;

/// Session context passed to [`GapDetector`](crate::gaps::GapDetector) and
/// [`AutoFixEngine`](crate::fix::AutoFixEngine).
#[derive(Debug)]
pub struct MigrationSession {
    id: String,
    id_cache: Mutex<HashMap<(Side, EntityKind), IdSet>>,
    in_flight: Mutex<HashSet<String>>,
}

impl Default for MigrationSession {
    fn default() -> Self {
        Self::new()
    }
}

impl MigrationSession {
    pub fn new() -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            id_cache: Mutex::new(HashMap::new()),
            in_flight: Mutex::new(HashSet::new()),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Source identifier set for a kind, read once per session.
    pub async fn source_ids(&self, source: &dyn RecordSource, kind: EntityKind) -> Result<IdSet> {
        let key = (Side::Source, kind);
        if let Some(ids) = self.cached(&key) {
            return Ok(ids);
        }
        let ids = Arc::new(source.ids(kind).await?);
        lock(&self.id_cache).insert(key, Arc::clone(&ids));
        Ok(ids)
    }

    /// Target identifier set of one backend, cached until invalidated.
    pub async fn target_ids(
        &self,
        target: &dyn TargetStoreGateway,
        backend: Backend,
        kind: EntityKind,
    ) -> Result<IdSet> {
        let key = (Side::Target(backend), kind);
        if let Some(ids) = self.cached(&key) {
            return Ok(ids);
        }
        let ids = Arc::new(target.ids_in(backend, kind).await?);
        lock(&self.id_cache).insert(key, Arc::clone(&ids));
        Ok(ids)
    }

    /// Union of the target identifier sets over every backend of the kind.
    pub async fn target_union(
        &self,
        target: &dyn TargetStoreGateway,
        kind: EntityKind,
    ) -> Result<BTreeSet<String>> {
        let mut union = BTreeSet::new();
        for backend in target.backends(kind) {
            union.extend(self.target_ids(target, backend, kind).await?.iter().cloned());
        }
        Ok(union)
    }

    fn cached(&self, key: &(Side, EntityKind)) -> Option<IdSet> {
        lock(&self.id_cache).get(key).cloned()
    }

    /// Drop the target-side entries of one kind.
    pub fn invalidate_target(&self, kind: EntityKind) {
        lock(&self.id_cache).retain(|(side, k), _| !(matches!(side, Side::Target(_)) && *k == kind));
        debug!("Session {}: invalidated target id cache for {}", self.id, kind);
    }

    /// Drop every target-side entry.
    pub fn invalidate_targets(&self) {
        lock(&self.id_cache).retain(|(side, _), _| !matches!(side, Side::Target(_)));
    }

    /// Number of cached identifier sets.
    pub fn cached_sets(&self) -> usize {
        lock(&self.id_cache).len()
    }

    /// Mark a gap as in flight. Returns false if it already was.
    pub fn try_begin(&self, gap_id: &str) -> bool {
        lock(&self.in_flight).insert(gap_id.to_string())
    }

    /// Release a gap previously marked in flight.
    pub fn finish(&self, gap_id: &str) {
        lock(&self.in_flight).remove(gap_id);
    }

    pub fn is_in_flight(&self, gap_id: &str) -> bool {
        lock(&self.in_flight).contains(gap_id)
    }
}
