//! Backup persistence for repair actions.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use crate::audit::Artifact;
use crate::core::memory::lock;
use crate::error::{MigrateError, Result};

use super::types::Backup;

/// Durable store for pre-mutation snapshots.
pub trait BackupStore: Send + Sync {
    fn put(&self, backup: &Backup) -> Result<()>;

    fn get(&self, backup_id: &str) -> Result<Option<Backup>>;

    fn list(&self) -> Result<Vec<Backup>>;
}

/// Backups kept in memory for the lifetime of the engine.
#[derive(Default)]
pub struct MemoryBackupStore {
    backups: Mutex<Vec<Backup>>,
    failing: AtomicBool,
}

impl MemoryBackupStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every `put` fail.
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn len(&self) -> usize {
        lock(&self.backups).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl BackupStore for MemoryBackupStore {
    fn put(&self, backup: &Backup) -> Result<()> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(MigrateError::Backup(format!(
                "backup store rejected backup {}",
                backup.backup_id
            )));
        }
        lock(&self.backups).push(backup.clone());
        Ok(())
    }

    fn get(&self, backup_id: &str) -> Result<Option<Backup>> {
        Ok(lock(&self.backups)
            .iter()
            .find(|b| b.backup_id == backup_id)
            .cloned())
    }

    fn list(&self) -> Result<Vec<Backup>> {
        Ok(lock(&self.backups).clone())
    }
}

/// Backups written as signed artifacts, one file per backup.
pub struct FileBackupStore {
    dir: PathBuf,
    key: String,
}

impl FileBackupStore {
    /// Create the store; `key` signs every backup (the configuration hash).
    pub fn new<P: AsRef<Path>>(dir: P, key: impl Into<String>) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        std::fs::create_dir_all(&dir)
            .map_err(|e| MigrateError::Backup(format!("Failed to create {}: {}", dir.display(), e)))?;
        Ok(Self { dir, key: key.into() })
    }

    fn path_for(&self, backup_id: &str) -> PathBuf {
        self.dir.join(format!("backup-{}.json", backup_id))
    }
}

impl BackupStore for FileBackupStore {
    fn put(&self, backup: &Backup) -> Result<()> {
        let path = self.path_for(&backup.backup_id);
        Artifact::new("backup", backup.clone())
            .save(&path, &self.key)
            .map_err(|e| MigrateError::Backup(format!("Failed to write {}: {}", path.display(), e)))
    }

    fn get(&self, backup_id: &str) -> Result<Option<Backup>> {
        let path = self.path_for(backup_id);
        if !path.exists() {
            return Ok(None);
        }
        Ok(Some(Artifact::<Backup>::load(&path, &self.key)?.payload))
    }

    fn list(&self) -> Result<Vec<Backup>> {
        let mut backups = Vec::new();
        for entry in std::fs::read_dir(&self.dir)? {
            let path = entry?.path();
            let is_backup = path
                .file_name()
                .and_then(|n| n.to_str())
                .is_some_and(|n| n.starts_with("backup-") && n.ends_with(".json"));
            if is_backup {
                backups.push(Artifact::<Backup>::load(&path, &self.key)?.payload);
            }
        }
        backups.sort_by(|a, b| a.taken_at.cmp(&b.taken_at));
        Ok(backups)
    }
}
