//! Core data models for the incremental sync pipeline.
//!
//! These types describe what flows from a connector to a sink: addressable
//! [`ContentUnit`]s grouped into a [`ChangeSet`], the [`Delta`] a connector
//! returns for one instance, the sink-facing [`Document`] projection, and the
//! [`SyncWatermark`] that certifies how far an instance has been ingested.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Metadata key under which [`Document::from_unit`] records the SHA-256 of the text.
pub const CONTENT_HASH_KEY: &str = "content_hash";

/// Durable cursor marking everything up to and including this point as ingested.
///
/// Serialized as a tagged record (`{"kind": "commit", "value": "..."}`) so a
/// commit cursor can never be mistaken for a timestamp cursor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum SyncWatermark {
    /// Opaque commit identifier. Ordering is defined by the source's history graph.
    Commit(String),
    /// Microseconds since the Unix epoch. Strictly comparable.
    Timestamp(i64),
}

/// The variant a connector produces, used to reject cross-source confusion.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatermarkKind {
    Commit,
    Timestamp,
}

impl SyncWatermark {
    pub fn kind(&self) -> WatermarkKind {
        match self {
            SyncWatermark::Commit(_) => WatermarkKind::Commit,
            SyncWatermark::Timestamp(_) => WatermarkKind::Timestamp,
        }
    }

    /// Returns true when moving from `self` to `next` would move the cursor backwards.
    ///
    /// Only timestamps carry an order this system can check; commit ids are
    /// accepted as reported by the connector.
    pub fn regresses_to(&self, next: &SyncWatermark) -> bool {
        match (self, next) {
            (SyncWatermark::Timestamp(prev), SyncWatermark::Timestamp(next)) => next < prev,
            _ => false,
        }
    }
}

impl fmt::Display for SyncWatermark {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SyncWatermark::Commit(sha) => write!(f, "commit:{}", sha),
            SyncWatermark::Timestamp(micros) => {
                write!(f, "ts:{}.{:06}", micros.div_euclid(1_000_000), micros.rem_euclid(1_000_000))
            }
        }
    }
}

/// A scalar metadata value attached to a unit or document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MetadataValue {
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
}

impl From<&str> for MetadataValue {
    fn from(value: &str) -> Self {
        MetadataValue::Text(value.to_string())
    }
}

impl From<String> for MetadataValue {
    fn from(value: String) -> Self {
        MetadataValue::Text(value)
    }
}

impl From<i64> for MetadataValue {
    fn from(value: i64) -> Self {
        MetadataValue::Int(value)
    }
}

impl From<bool> for MetadataValue {
    fn from(value: bool) -> Self {
        MetadataValue::Bool(value)
    }
}

impl From<f64> for MetadataValue {
    fn from(value: f64) -> Self {
        MetadataValue::Float(value)
    }
}

pub type Metadata = BTreeMap<String, MetadataValue>;

/// Addressable identity of a content unit.
///
/// `source_type` names the kind of unit (`code`, `commit`, `merge_request`,
/// `message`), `instance` the source instance it belongs to (repository path,
/// channel name), and `natural_key` the unit within that instance.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct UnitKey {
    pub source_type: String,
    pub instance: String,
    pub natural_key: String,
}

impl UnitKey {
    pub fn new(
        source_type: impl Into<String>,
        instance: impl Into<String>,
        natural_key: impl Into<String>,
    ) -> Self {
        Self {
            source_type: source_type.into(),
            instance: instance.into(),
            natural_key: natural_key.into(),
        }
    }

    /// Deterministic document id derived only from the unit's identity.
    ///
    /// Components are joined with `:`; `%` and `:` inside a component are
    /// percent-escaped so distinct keys never collide.
    pub fn document_id(&self) -> String {
        format!(
            "{}:{}:{}",
            escape_component(&self.source_type),
            escape_component(&self.instance),
            escape_component(&self.natural_key)
        )
    }
}

fn escape_component(raw: &str) -> String {
    raw.replace('%', "%25").replace(':', "%3A")
}

/// Smallest addressable piece of source content eligible for indexing.
#[derive(Debug, Clone)]
pub struct ContentUnit {
    pub key: UnitKey,
    pub text: String,
    pub metadata: Metadata,
    /// Repository-relative path, for units that live at a path.
    pub path: Option<String>,
    /// Set by connectors for systemically uninteresting units (merge commits, bot messages).
    pub automated: bool,
}

impl ContentUnit {
    pub fn new(key: UnitKey, text: impl Into<String>) -> Self {
        Self {
            key,
            text: text.into(),
            metadata: Metadata::new(),
            path: None,
            automated: false,
        }
    }

    pub fn with_meta(mut self, key: &str, value: impl Into<MetadataValue>) -> Self {
        self.metadata.insert(key.to_string(), value.into());
        self
    }

    pub fn at_path(mut self, path: impl Into<String>) -> Self {
        self.path = Some(path.into());
        self
    }

    pub fn automated(mut self, automated: bool) -> Self {
        self.automated = automated;
        self
    }

    /// Payload length in characters, as used by the admission policy.
    pub fn text_len(&self) -> usize {
        self.text.chars().count()
    }
}

/// Sink-facing projection of a [`ContentUnit`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Document {
    pub id: String,
    pub text: String,
    pub metadata: Metadata,
}

impl Document {
    pub fn from_unit(unit: &ContentUnit) -> Self {
        let mut metadata = unit.metadata.clone();
        metadata.insert(
            CONTENT_HASH_KEY.to_string(),
            MetadataValue::Text(content_hash(&unit.text)),
        );
        Self {
            id: unit.key.document_id(),
            text: unit.text.clone(),
            metadata,
        }
    }
}

/// Hex SHA-256 of a document body.
pub fn content_hash(text: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(text.as_bytes());
    format!("{:x}", hasher.finalize())
}

/// Additions and removals for one source instance.
#[derive(Debug, Clone, Default)]
pub struct ChangeSet {
    pub added_or_modified: Vec<ContentUnit>,
    pub removed: BTreeSet<UnitKey>,
}

impl ChangeSet {
    pub fn is_empty(&self) -> bool {
        self.added_or_modified.is_empty() && self.removed.is_empty()
    }
}

/// What a connector returns from `fetch_delta`.
#[derive(Debug, Clone)]
pub struct Delta {
    pub changes: ChangeSet,
    /// Cursor certifying this delta. `None` when the fetch saw nothing to certify.
    pub new_watermark: Option<SyncWatermark>,
    /// The prior watermark could not be compared against current history, so
    /// `changes` lists everything currently present.
    pub rescan: bool,
    /// Parts of the instance the connector could not fetch this time. The
    /// delta is still applied; the engine reports these on the outcome.
    pub warnings: Vec<String>,
}

impl Delta {
    /// A full listing for an instance with no prior watermark.
    pub fn full(units: Vec<ContentUnit>, new_watermark: Option<SyncWatermark>) -> Self {
        Self {
            changes: ChangeSet {
                added_or_modified: units,
                removed: BTreeSet::new(),
            },
            new_watermark,
            rescan: false,
            warnings: Vec::new(),
        }
    }

    pub fn incremental(changes: ChangeSet, new_watermark: Option<SyncWatermark>) -> Self {
        Self {
            changes,
            new_watermark,
            rescan: false,
            warnings: Vec::new(),
        }
    }

    /// A full listing returned because the prior watermark no longer resolves.
    pub fn rescan(units: Vec<ContentUnit>, new_watermark: Option<SyncWatermark>) -> Self {
        Self {
            rescan: true,
            ..Self::full(units, new_watermark)
        }
    }

    pub fn with_warning(mut self, warning: impl Into<String>) -> Self {
        self.warnings.push(warning.into());
        self
    }
}
