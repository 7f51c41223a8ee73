//! Core record model and collaborator abstractions.
//!
//! - [`record`]: entity kinds, backends, payload schemas and the record envelope
//! - [`traits`]: source and target-store collaborator traits
//! - [`mapping`]: boundary validation and declared field renames
//! - [`memory`]: in-memory collaborators backed by JSON snapshots

pub mod mapping;
pub mod memory;
pub mod record;
pub mod traits;

pub use mapping::{FieldMapping, RecordMapper};
pub use memory::{MemorySource, MemoryTarget};
pub use record::{
    extension_field, Backend, Bounds, ConnectionDefinition, ElementDefinition, EntityKind,
    MetadataEntry, Payload, ProcessDefinition, Record, Reference,
};
pub use traits::{RecordSource, TargetStoreGateway};
