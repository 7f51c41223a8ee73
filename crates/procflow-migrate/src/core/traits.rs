//! Collaborator traits for the migration engine.
//!
//! - [`RecordSource`]: restartable read access to the legacy store
//! - [`TargetStoreGateway`]: write/read/delete access to the polyglot store
//!
//! The gateway fans out internally to the concrete backends and is treated as
//! a black box: every call is best-effort across backends. The per-backend
//! methods exist so that gap detection can see partial migrations and repair
//! can copy into only the stores that are missing a record.

use std::collections::BTreeSet;

use async_trait::async_trait;

use crate::error::Result;

use super::record::{Backend, EntityKind, Record};

/// Read access to the legacy store.
///
/// `read_all` is restartable: calling it again yields the same records in the
/// same order, so runs and scans can iterate a kind as often as they need.
#[async_trait]
pub trait RecordSource: Send + Sync {
    /// All records of a kind, in the store's natural order.
    async fn read_all(&self, kind: EntityKind) -> Result<Vec<Record>>;

    /// A single record, or `None` when the id is unknown.
    async fn read_one(&self, kind: EntityKind, id: &str) -> Result<Option<Record>>;

    /// Number of records of a kind.
    async fn count(&self, kind: EntityKind) -> Result<usize> {
        Ok(self.read_all(kind).await?.len())
    }

    /// Identifier set of a kind.
    async fn ids(&self, kind: EntityKind) -> Result<BTreeSet<String>> {
        Ok(self
            .read_all(kind)
            .await?
            .into_iter()
            .map(|r| r.id)
            .collect())
    }

    /// Source name for logging.
    fn name(&self) -> &str;
}

/// Write, read and delete access to the multi-backend target store.
#[async_trait]
pub trait TargetStoreGateway: Send + Sync {
    /// Upsert a batch into every backend of the kind.
    async fn write_batch(&self, kind: EntityKind, records: &[Record]) -> Result<()>;

    /// Read a record from the first backend that holds it.
    async fn read_one(&self, kind: EntityKind, id: &str) -> Result<Option<Record>>;

    /// Read every record of a kind held by any backend.
    async fn read_all(&self, kind: EntityKind) -> Result<Vec<Record>>;

    /// Read several records; ids that are absent are omitted.
    async fn read_many(&self, kind: EntityKind, ids: &[String]) -> Result<Vec<Record>> {
        let mut records = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(record) = self.read_one(kind, id).await? {
                records.push(record);
            }
        }
        Ok(records)
    }

    /// Delete a record from every backend. Returns whether anything was removed.
    async fn delete_one(&self, kind: EntityKind, id: &str) -> Result<bool>;

    /// Backends that hold records of the kind.
    fn backends(&self, kind: EntityKind) -> Vec<Backend>;

    /// Identifier set of a kind in one backend.
    async fn ids_in(&self, backend: Backend, kind: EntityKind) -> Result<BTreeSet<String>>;

    /// Backends that currently hold the record.
    async fn locate(&self, kind: EntityKind, id: &str) -> Result<Vec<Backend>>;

    /// Upsert a record into a single backend.
    async fn upsert_into(&self, backend: Backend, record: &Record) -> Result<()>;

    /// Delete a record from a single backend. Returns whether it was present.
    async fn delete_from(&self, backend: Backend, kind: EntityKind, id: &str) -> Result<bool>;

    /// Gateway name for logging.
    fn name(&self) -> &str;
}
