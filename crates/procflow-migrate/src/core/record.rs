//! Process-definition record model.
//!
//! Records are a tagged union over the known entity-kind schemas
//! ([`Payload`]) plus an explicit extension map that carries attributes the
//! core does not know about. Unknown attributes are never dropped: they travel
//! through migration and repair untouched unless a declared field mapping
//! renames them.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{MigrateError, Result};
use crate::verify::normalize;

/// Named category of record, migrated independently.
///
/// The declaration order is the processing order: processes first so that
/// elements, connections and metadata can reference them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    Process,
    Element,
    Connection,
    Metadata,
}

impl EntityKind {
    /// All entity kinds in processing order.
    pub const ALL: [EntityKind; 4] = [
        EntityKind::Process,
        EntityKind::Element,
        EntityKind::Connection,
        EntityKind::Metadata,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            EntityKind::Process => "process",
            EntityKind::Element => "element",
            EntityKind::Connection => "connection",
            EntityKind::Metadata => "metadata",
        }
    }

    /// Backing stores that hold records of this kind.
    pub fn default_backends(&self) -> &'static [Backend] {
        match self {
            EntityKind::Process => &[Backend::Relational, Backend::Graph, Backend::Vector],
            EntityKind::Element | EntityKind::Connection => &[Backend::Relational, Backend::Graph],
            EntityKind::Metadata => &[Backend::Relational, Backend::Vector],
        }
    }
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EntityKind {
    type Err = MigrateError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "process" => Ok(EntityKind::Process),
            "element" => Ok(EntityKind::Element),
            "connection" => Ok(EntityKind::Connection),
            "metadata" => Ok(EntityKind::Metadata),
            other => Err(MigrateError::Config(format!("Unknown entity kind: {}", other))),
        }
    }
}

/// Concrete backend behind the target store gateway.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Backend {
    Relational,
    Graph,
    Vector,
}

impl Backend {
    pub const ALL: [Backend; 3] = [Backend::Relational, Backend::Graph, Backend::Vector];

    pub fn as_str(&self) -> &'static str {
        match self {
            Backend::Relational => "relational",
            Backend::Graph => "graph",
            Backend::Vector => "vector",
        }
    }
}

impl fmt::Display for Backend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Top-level process definition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessDefinition {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub owner: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
}

/// Diagram placement of an element.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Bounds {
    pub x: f64,
    pub y: f64,
    pub width: f64,
    pub height: f64,
}

/// Task, event, gateway or lane inside a process.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ElementDefinition {
    pub process_id: String,
    pub element_type: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bounds: Option<Bounds>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub properties: BTreeMap<String, Value>,
}

/// Sequence flow between two elements.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConnectionDefinition {
    pub process_id: String,
    pub source_ref: String,
    pub target_ref: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub condition: Option<String>,
}

/// Free-form key/value attached to a process.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetadataEntry {
    pub process_id: String,
    pub key: String,
    pub value: Value,
}

/// Kind-specific record content.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Payload {
    Process(ProcessDefinition),
    Element(ElementDefinition),
    Connection(ConnectionDefinition),
    Metadata(MetadataEntry),
}

impl Payload {
    /// Entity kind implied by the payload variant.
    pub fn kind(&self) -> EntityKind {
        match self {
            Payload::Process(_) => EntityKind::Process,
            Payload::Element(_) => EntityKind::Element,
            Payload::Connection(_) => EntityKind::Connection,
            Payload::Metadata(_) => EntityKind::Metadata,
        }
    }
}

/// A foreign identifier held by a record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reference {
    /// Field holding the reference.
    pub field: &'static str,
    /// Kind of the referenced record.
    pub kind: EntityKind,
    /// Referenced identifier.
    pub id: String,
}

/// A single process-definition record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record {
    pub id: String,
    pub kind: EntityKind,
    /// Monotonic version marker; bumped by the legacy editor on every save.
    #[serde(default)]
    pub version: u64,
    pub payload: Payload,
    /// Attributes outside the known schema, carried forward verbatim.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub extensions: BTreeMap<String, Value>,
    /// Volatile: set by the writer, excluded from content checksums.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ingested_at: Option<DateTime<Utc>>,
    /// Content checksum sealed at write time.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub checksum: Option<String>,
}

impl Record {
    /// Create a record from its payload; the kind follows the payload variant.
    pub fn new(id: impl Into<String>, payload: Payload) -> Self {
        Self {
            id: id.into(),
            kind: payload.kind(),
            version: 1,
            payload,
            extensions: BTreeMap::new(),
            ingested_at: None,
            checksum: None,
        }
    }

    pub fn process(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self::new(
            id,
            Payload::Process(ProcessDefinition {
                name: name.into(),
                description: None,
                owner: None,
                status: None,
                tags: Vec::new(),
            }),
        )
    }

    pub fn element(
        id: impl Into<String>,
        process_id: impl Into<String>,
        element_type: impl Into<String>,
        name: impl Into<String>,
    ) -> Self {
        Self::new(
            id,
            Payload::Element(ElementDefinition {
                process_id: process_id.into(),
                element_type: element_type.into(),
                name: name.into(),
                bounds: None,
                properties: BTreeMap::new(),
            }),
        )
    }

    pub fn connection(
        id: impl Into<String>,
        process_id: impl Into<String>,
        source_ref: impl Into<String>,
        target_ref: impl Into<String>,
    ) -> Self {
        Self::new(
            id,
            Payload::Connection(ConnectionDefinition {
                process_id: process_id.into(),
                source_ref: source_ref.into(),
                target_ref: target_ref.into(),
                label: None,
                condition: None,
            }),
        )
    }

    pub fn metadata(
        id: impl Into<String>,
        process_id: impl Into<String>,
        key: impl Into<String>,
        value: Value,
    ) -> Self {
        Self::new(
            id,
            Payload::Metadata(MetadataEntry {
                process_id: process_id.into(),
                key: key.into(),
                value,
            }),
        )
    }

    pub fn with_version(mut self, version: u64) -> Self {
        self.version = version;
        self
    }

    pub fn with_extension(mut self, key: impl Into<String>, value: Value) -> Self {
        self.extensions.insert(key.into(), value);
        self
    }

    /// Foreign identifiers this record points at.
    pub fn references(&self) -> Vec<Reference> {
        match &self.payload {
            Payload::Process(_) => Vec::new(),
            Payload::Element(e) => vec![Reference {
                field: "process_id",
                kind: EntityKind::Process,
                id: e.process_id.clone(),
            }],
            Payload::Connection(c) => vec![
                Reference {
                    field: "process_id",
                    kind: EntityKind::Process,
                    id: c.process_id.clone(),
                },
                Reference {
                    field: "source_ref",
                    kind: EntityKind::Element,
                    id: c.source_ref.clone(),
                },
                Reference {
                    field: "target_ref",
                    kind: EntityKind::Element,
                    id: c.target_ref.clone(),
                },
            ],
            Payload::Metadata(m) => vec![Reference {
                field: "process_id",
                kind: EntityKind::Process,
                id: m.process_id.clone(),
            }],
        }
    }

    /// Checksum of the canonical content, ignoring the always-volatile fields.
    pub fn content_checksum(&self) -> String {
        normalize::canonical_checksum(self, &[])
    }

    /// Stamp the ingestion time and seal the content checksum.
    pub fn sealed(mut self, ingested_at: DateTime<Utc>) -> Self {
        self.ingested_at = Some(ingested_at);
        self.checksum = Some(self.content_checksum());
        self
    }

    /// Self-consistency check used to detect corrupted target payloads.
    pub fn consistency_error(&self) -> Option<String> {
        if self.id.trim().is_empty() {
            return Some("record id is empty".into());
        }
        if self.payload.kind() != self.kind {
            return Some(format!(
                "payload variant '{}' does not match kind '{}'",
                self.payload.kind(),
                self.kind
            ));
        }
        if let Some(sealed) = &self.checksum {
            let actual = self.content_checksum();
            if *sealed != actual {
                return Some(format!(
                    "sealed checksum {} does not match content checksum {}",
                    short(sealed),
                    short(&actual)
                ));
            }
        }
        None
    }

    /// Flat view of the non-null fields: payload fields by name, extension
    /// attributes as `extensions.<key>`.
    pub fn field_map(&self) -> BTreeMap<String, Value> {
        let mut fields = BTreeMap::new();
        if let Ok(Value::Object(map)) = serde_json::to_value(&self.payload) {
            for (key, value) in map {
                if key != "type" && !value.is_null() {
                    fields.insert(key, value);
                }
            }
        }
        for (key, value) in &self.extensions {
            if !value.is_null() {
                fields.insert(extension_field(key), value.clone());
            }
        }
        fields
    }
}

/// Field-map name of an extension attribute.
pub fn extension_field(key: &str) -> String {
    format!("extensions.{}", key)
}

/// First 12 characters of a checksum. Stored checksums are untrusted and may
/// hold non-ASCII text.
fn short(checksum: &str) -> &str {
    checksum
        .char_indices()
        .nth(12)
        .map_or(checksum, |(end, _)| &checksum[..end])
}
