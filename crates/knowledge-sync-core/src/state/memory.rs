//! In-memory [`StateStore`] for tests and embedding.
//!
//! Keeps the state as serialized JSON so every load/save goes through the
//! same encoding as the on-disk store, corruption handling included.

use std::sync::RwLock;

use tracing::warn;

use super::{decode_state, StateStore, SyncState};
use crate::error::StateError;

/// State store holding the serialized state in memory.
#[derive(Default)]
pub struct MemoryStateStore {
    raw: RwLock<Option<String>>,
}

impl MemoryStateStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start from an arbitrary persisted payload, e.g. a corrupted one.
    pub fn with_raw(raw: impl Into<String>) -> Self {
        Self {
            raw: RwLock::new(Some(raw.into())),
        }
    }

    /// The persisted payload, if anything has been saved.
    pub fn raw(&self) -> Option<String> {
        self.raw.read().unwrap().clone()
    }
}

impl StateStore for MemoryStateStore {
    fn load(&self) -> SyncState {
        let raw = self.raw.read().unwrap();
        match raw.as_deref() {
            None => SyncState::default(),
            Some(payload) => decode_state(payload, "memory").unwrap_or_else(|e| {
                warn!(error = %e, "discarding unreadable sync state");
                SyncState::default()
            }),
        }
    }

    fn save(&self, state: &SyncState) -> Result<(), StateError> {
        let encoded = serde_json::to_string_pretty(state)?;
        *self.raw.write().unwrap() = Some(encoded);
        Ok(())
    }

    fn reset(&self) -> Result<(), StateError> {
        *self.raw.write().unwrap() = None;
        Ok(())
    }
}
