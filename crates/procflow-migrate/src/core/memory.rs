//! In-memory collaborators with JSON snapshot persistence.
//!
//! [`MemorySource`] and [`MemoryTarget`] back the CLI (loaded from and saved
//! to snapshot files) and the engine's tests. The target carries
//! fault-injection hooks so retry, abort and rollback paths can be driven
//! deterministically.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use tracing::debug;

use crate::error::{MigrateError, Result};

use super::record::{Backend, EntityKind, Record};
use super::traits::{RecordSource, TargetStoreGateway};

pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Atomic write: write to temp file, then rename.
pub(crate) fn write_atomic(path: &Path, content: &str) -> Result<()> {
    let temp_path = path.with_extension("tmp");
    std::fs::write(&temp_path, content)?;
    std::fs::rename(&temp_path, path)?;
    Ok(())
}

/// Legacy store held in memory, grouped by kind in load order.
pub struct MemorySource {
    name: String,
    records: Mutex<BTreeMap<EntityKind, Vec<Record>>>,
    unreachable: AtomicBool,
    read_calls: AtomicUsize,
}

impl MemorySource {
    pub fn new(records: Vec<Record>) -> Self {
        let mut grouped: BTreeMap<EntityKind, Vec<Record>> = BTreeMap::new();
        for record in records {
            grouped.entry(record.kind).or_default().push(record);
        }
        Self {
            name: "memory-source".into(),
            records: Mutex::new(grouped),
            unreachable: AtomicBool::new(false),
            read_calls: AtomicUsize::new(0),
        }
    }

    /// Load a source snapshot: a JSON array of records.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            MigrateError::source(format!("Failed to read source snapshot {}: {}", path.display(), e))
        })?;
        let records: Vec<Record> = serde_json::from_str(&content).map_err(|e| {
            MigrateError::source(format!("Invalid source snapshot {}: {}", path.display(), e))
        })?;
        let mut source = Self::new(records);
        source.name = path.display().to_string();
        Ok(source)
    }

    /// Insert or replace a record, keeping its position when it already exists.
    pub fn upsert(&self, record: Record) {
        let mut records = lock(&self.records);
        let bucket = records.entry(record.kind).or_default();
        match bucket.iter_mut().find(|r| r.id == record.id) {
            Some(existing) => *existing = record,
            None => bucket.push(record),
        }
    }

    /// Make every read fail with a source error.
    pub fn set_unreachable(&self, unreachable: bool) {
        self.unreachable.store(unreachable, Ordering::SeqCst);
    }

    pub fn read_calls(&self) -> usize {
        self.read_calls.load(Ordering::SeqCst)
    }

    fn check_reachable(&self) -> Result<()> {
        self.read_calls.fetch_add(1, Ordering::SeqCst);
        if self.unreachable.load(Ordering::SeqCst) {
            return Err(MigrateError::source(format!("{} is unreachable", self.name)));
        }
        Ok(())
    }
}

#[async_trait]
impl RecordSource for MemorySource {
    async fn read_all(&self, kind: EntityKind) -> Result<Vec<Record>> {
        self.check_reachable()?;
        Ok(lock(&self.records).get(&kind).cloned().unwrap_or_default())
    }

    async fn read_one(&self, kind: EntityKind, id: &str) -> Result<Option<Record>> {
        self.check_reachable()?;
        Ok(lock(&self.records)
            .get(&kind)
            .and_then(|records| records.iter().find(|r| r.id == id).cloned()))
    }

    async fn count(&self, kind: EntityKind) -> Result<usize> {
        self.check_reachable()?;
        Ok(lock(&self.records).get(&kind).map_or(0, Vec::len))
    }

    fn name(&self) -> &str {
        &self.name
    }
}

type BackendStore = BTreeMap<(EntityKind, String), Record>;

#[derive(Default)]
struct Faults {
    /// Writes touching these ids fail permanently.
    permanent: HashSet<String>,
    /// Remaining transient failures per id.
    transient: HashMap<String, usize>,
    /// Writes of these ids land in the first backend, then fail.
    partial: HashSet<String>,
}

/// Multi-backend target store held in memory.
pub struct MemoryTarget {
    name: String,
    layout: BTreeMap<EntityKind, Vec<Backend>>,
    stores: Mutex<BTreeMap<Backend, BackendStore>>,
    faults: Mutex<Faults>,
    unreachable: AtomicBool,
    write_calls: AtomicUsize,
    delete_calls: AtomicUsize,
}

impl Default for MemoryTarget {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryTarget {
    /// Empty target with the default backend layout per kind.
    pub fn new() -> Self {
        let layout = EntityKind::ALL
            .iter()
            .map(|k| (*k, k.default_backends().to_vec()))
            .collect();
        let stores = Backend::ALL.iter().map(|b| (*b, BackendStore::new())).collect();
        Self {
            name: "memory-target".into(),
            layout,
            stores: Mutex::new(stores),
            faults: Mutex::new(Faults::default()),
            unreachable: AtomicBool::new(false),
            write_calls: AtomicUsize::new(0),
            delete_calls: AtomicUsize::new(0),
        }
    }

    /// Load a target directory holding `<backend>.json` files.
    ///
    /// Missing files are treated as empty backends.
    pub fn load_dir<P: AsRef<Path>>(dir: P) -> Result<Self> {
        let dir = dir.as_ref();
        let target = Self::new();
        {
            let mut stores = lock(&target.stores);
            for backend in Backend::ALL {
                let path = dir.join(format!("{}.json", backend));
                if !path.exists() {
                    continue;
                }
                let content = std::fs::read_to_string(&path)?;
                let records: Vec<Record> = serde_json::from_str(&content).map_err(|e| {
                    MigrateError::target(format!("Invalid target snapshot {}: {}", path.display(), e))
                })?;
                let store = stores.entry(backend).or_default();
                for record in records {
                    store.insert((record.kind, record.id.clone()), record);
                }
            }
        }
        let mut target = target;
        target.name = dir.display().to_string();
        Ok(target)
    }

    /// Persist every backend into `<backend>.json` files under `dir`.
    pub fn save_dir<P: AsRef<Path>>(&self, dir: P) -> Result<()> {
        let dir = dir.as_ref();
        std::fs::create_dir_all(dir)?;
        for (backend, records) in self.snapshot() {
            let content = serde_json::to_string_pretty(&records)?;
            write_atomic(&dir.join(format!("{}.json", backend)), &content)?;
        }
        debug!("Saved target snapshot to {}", dir.display());
        Ok(())
    }

    /// Seed a record into every backend of its kind, bypassing counters and faults.
    pub fn seed(&self, record: Record) {
        let backends = self.backends(record.kind);
        let mut stores = lock(&self.stores);
        for backend in backends {
            stores
                .entry(backend)
                .or_default()
                .insert((record.kind, record.id.clone()), record.clone());
        }
    }

    /// Seed a record into a single backend, bypassing counters and faults.
    pub fn seed_into(&self, backend: Backend, record: Record) {
        lock(&self.stores)
            .entry(backend)
            .or_default()
            .insert((record.kind, record.id.clone()), record);
    }

    /// Full contents per backend, ordered by kind then id.
    pub fn snapshot(&self) -> BTreeMap<Backend, Vec<Record>> {
        lock(&self.stores)
            .iter()
            .map(|(backend, store)| (*backend, store.values().cloned().collect()))
            .collect()
    }

    /// Record held by a specific backend.
    pub fn get_in(&self, backend: Backend, kind: EntityKind, id: &str) -> Option<Record> {
        lock(&self.stores)
            .get(&backend)
            .and_then(|store| store.get(&(kind, id.to_string())).cloned())
    }

    /// Writes touching `id` fail permanently.
    pub fn fail_writes_for(&self, id: impl Into<String>) {
        lock(&self.faults).permanent.insert(id.into());
    }

    /// The next `times` writes touching `id` fail with a transient error.
    pub fn fail_transiently_for(&self, id: impl Into<String>, times: usize) {
        lock(&self.faults).transient.insert(id.into(), times);
    }

    /// Writes of `id` reach the first backend only, then fail.
    pub fn fail_partially_for(&self, id: impl Into<String>) {
        lock(&self.faults).partial.insert(id.into());
    }

    pub fn clear_faults(&self) {
        *lock(&self.faults) = Faults::default();
    }

    /// Make every call fail with a non-transient target error.
    pub fn set_unreachable(&self, unreachable: bool) {
        self.unreachable.store(unreachable, Ordering::SeqCst);
    }

    /// Number of write calls (`write_batch` and `upsert_into`).
    pub fn write_calls(&self) -> usize {
        self.write_calls.load(Ordering::SeqCst)
    }

    /// Number of delete calls (`delete_one` and `delete_from`).
    pub fn delete_calls(&self) -> usize {
        self.delete_calls.load(Ordering::SeqCst)
    }

    fn check_reachable(&self) -> Result<()> {
        if self.unreachable.load(Ordering::SeqCst) {
            return Err(MigrateError::target(format!("{} is unreachable", self.name)));
        }
        Ok(())
    }

    /// Apply injected faults for a write of `records`.
    ///
    /// Returns the id that should be partially written before failing, if any.
    fn check_faults(&self, records: &[Record]) -> Result<Option<String>> {
        let mut faults = lock(&self.faults);
        for record in records {
            if faults.permanent.contains(&record.id) {
                return Err(MigrateError::target(format!(
                    "write rejected for record {}",
                    record.id
                )));
            }
        }
        for record in records {
            if let Some(remaining) = faults.transient.get_mut(&record.id) {
                if *remaining > 0 {
                    *remaining -= 1;
                    return Err(MigrateError::target_transient(format!(
                        "timeout writing record {}",
                        record.id
                    )));
                }
            }
        }
        Ok(records
            .iter()
            .find(|r| faults.partial.contains(&r.id))
            .map(|r| r.id.clone()))
    }
}

#[async_trait]
impl TargetStoreGateway for MemoryTarget {
    async fn write_batch(&self, kind: EntityKind, records: &[Record]) -> Result<()> {
        self.write_calls.fetch_add(1, Ordering::SeqCst);
        self.check_reachable()?;
        let partial = self.check_faults(records)?;

        let backends = self.backends(kind);
        let mut stores = lock(&self.stores);
        if let Some(id) = partial {
            if let (Some(first), Some(record)) = (backends.first(), records.iter().find(|r| r.id == id)) {
                stores
                    .entry(*first)
                    .or_default()
                    .insert((kind, record.id.clone()), record.clone());
            }
            return Err(MigrateError::target(format!(
                "write of record {} failed after reaching {} backend",
                id,
                backends.first().map_or("no", |b| b.as_str())
            )));
        }
        for backend in backends {
            let store = stores.entry(backend).or_default();
            for record in records {
                store.insert((kind, record.id.clone()), record.clone());
            }
        }
        Ok(())
    }

    async fn read_one(&self, kind: EntityKind, id: &str) -> Result<Option<Record>> {
        self.check_reachable()?;
        let key = (kind, id.to_string());
        let stores = lock(&self.stores);
        Ok(self
            .backends(kind)
            .iter()
            .find_map(|b| stores.get(b).and_then(|s| s.get(&key)).cloned()))
    }

    async fn read_all(&self, kind: EntityKind) -> Result<Vec<Record>> {
        self.check_reachable()?;
        let stores = lock(&self.stores);
        let mut merged: BTreeMap<String, Record> = BTreeMap::new();
        for backend in self.backends(kind) {
            if let Some(store) = stores.get(&backend) {
                for ((k, id), record) in store.iter() {
                    if *k == kind && !merged.contains_key(id) {
                        merged.insert(id.clone(), record.clone());
                    }
                }
            }
        }
        Ok(merged.into_values().collect())
    }

    async fn delete_one(&self, kind: EntityKind, id: &str) -> Result<bool> {
        self.delete_calls.fetch_add(1, Ordering::SeqCst);
        self.check_reachable()?;
        let key = (kind, id.to_string());
        let mut stores = lock(&self.stores);
        let mut removed = false;
        for backend in self.backends(kind) {
            if let Some(store) = stores.get_mut(&backend) {
                removed |= store.remove(&key).is_some();
            }
        }
        Ok(removed)
    }

    fn backends(&self, kind: EntityKind) -> Vec<Backend> {
        self.layout.get(&kind).cloned().unwrap_or_default()
    }

    async fn ids_in(&self, backend: Backend, kind: EntityKind) -> Result<BTreeSet<String>> {
        self.check_reachable()?;
        Ok(lock(&self.stores)
            .get(&backend)
            .map(|store| {
                store
                    .keys()
                    .filter(|(k, _)| *k == kind)
                    .map(|(_, id)| id.clone())
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn locate(&self, kind: EntityKind, id: &str) -> Result<Vec<Backend>> {
        self.check_reachable()?;
        let key = (kind, id.to_string());
        let stores = lock(&self.stores);
        Ok(self
            .backends(kind)
            .into_iter()
            .filter(|b| stores.get(b).is_some_and(|s| s.contains_key(&key)))
            .collect())
    }

    async fn upsert_into(&self, backend: Backend, record: &Record) -> Result<()> {
        self.write_calls.fetch_add(1, Ordering::SeqCst);
        self.check_reachable()?;
        if self.check_faults(std::slice::from_ref(record))?.is_some() {
            return Err(MigrateError::target(format!(
                "write of record {} into {} failed",
                record.id, backend
            )));
        }
        lock(&self.stores)
            .entry(backend)
            .or_default()
            .insert((record.kind, record.id.clone()), record.clone());
        Ok(())
    }

    async fn delete_from(&self, backend: Backend, kind: EntityKind, id: &str) -> Result<bool> {
        self.delete_calls.fetch_add(1, Ordering::SeqCst);
        self.check_reachable()?;
        Ok(lock(&self.stores)
            .get_mut(&backend)
            .is_some_and(|store| store.remove(&(kind, id.to_string())).is_some()))
    }

    fn name(&self) -> &str {
        &self.name
    }
}
