//! Persisted per-instance sync state.
//!
//! [`SyncState`] is the durable record of watermarks, nested as
//! `source → collection → instance → SyncRunRecord`. A [`StateStore`] loads
//! and saves it; the engine is its only writer.
//!
//! Loading never fails: a missing or unreadable record degrades to an empty
//! state, which costs incrementality but never aborts a run.

pub mod memory;

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::StateError;
use crate::models::SyncWatermark;

/// Location of a connector's records inside [`SyncState`].
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct StateScope {
    /// Source family, e.g. `gitlab`.
    pub source: String,
    /// Collection within the family, e.g. `repos`.
    pub collection: String,
}

impl StateScope {
    pub fn new(source: impl Into<String>, collection: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            collection: collection.into(),
        }
    }
}

/// What was certified for one source instance by its last successful run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncRunRecord {
    pub watermark: SyncWatermark,
    pub last_run: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub indexed_units: Option<Vec<String>>,
}

/// All persisted records.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SyncState {
    sources: BTreeMap<String, BTreeMap<String, BTreeMap<String, SyncRunRecord>>>,
}

impl SyncState {
    pub fn get(&self, scope: &StateScope, instance: &str) -> Option<&SyncRunRecord> {
        self.sources
            .get(&scope.source)?
            .get(&scope.collection)?
            .get(instance)
    }

    pub fn put(&mut self, scope: &StateScope, instance: &str, record: SyncRunRecord) {
        self.sources
            .entry(scope.source.clone())
            .or_default()
            .entry(scope.collection.clone())
            .or_default()
            .insert(instance.to_string(), record);
    }

    pub fn remove(&mut self, scope: &StateScope, instance: &str) -> Option<SyncRunRecord> {
        self.sources
            .get_mut(&scope.source)?
            .get_mut(&scope.collection)?
            .remove(instance)
    }

    pub fn is_empty(&self) -> bool {
        self.records().next().is_none()
    }

    /// Every record as `(scope, instance, record)`, in key order.
    pub fn records(&self) -> impl Iterator<Item = (StateScope, &str, &SyncRunRecord)> + '_ {
        self.sources.iter().flat_map(|(source, collections)| {
            collections.iter().flat_map(move |(collection, instances)| {
                instances.iter().map(move |(instance, record)| {
                    (
                        StateScope::new(source.clone(), collection.clone()),
                        instance.as_str(),
                        record,
                    )
                })
            })
        })
    }
}

/// Durable storage for [`SyncState`].
pub trait StateStore: Send + Sync {
    /// Load the persisted state, or an empty one if absent or unreadable.
    fn load(&self) -> SyncState;

    /// Persist `state`. A failed save must leave the previous state intact.
    fn save(&self, state: &SyncState) -> Result<(), StateError>;

    /// Discard all records. Safe when nothing has been persisted.
    fn reset(&self) -> Result<(), StateError>;
}

/// Decode persisted JSON, reporting corruption instead of failing.
pub fn decode_state(raw: &str, location: &str) -> Result<SyncState, StateError> {
    serde_json::from_str(raw).map_err(|e| StateError::Corrupt {
        location: location.to_string(),
        message: e.to_string(),
    })
}
