//! In-memory [`DocumentSink`] implementation for testing.
//!
//! Uses a `HashMap` behind `std::sync::RwLock` for thread safety.

use std::collections::HashMap;
use std::sync::RwLock;

use async_trait::async_trait;

use super::DocumentSink;
use crate::error::SinkError;
use crate::models::Document;

/// In-memory sink keyed by document id.
pub struct MemorySink {
    docs: RwLock<HashMap<String, Document>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self {
            docs: RwLock::new(HashMap::new()),
        }
    }

    pub fn len(&self) -> usize {
        self.docs.read().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains(&self, id: &str) -> bool {
        self.docs.read().unwrap().contains_key(id)
    }

    /// Sorted ids of all stored documents.
    pub fn ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.docs.read().unwrap().keys().cloned().collect();
        ids.sort();
        ids
    }
}

impl Default for MemorySink {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl DocumentSink for MemorySink {
    async fn get(&self, id: &str) -> Result<Option<Document>, SinkError> {
        Ok(self.docs.read().unwrap().get(id).cloned())
    }

    async fn upsert(&self, doc: &Document) -> Result<(), SinkError> {
        self.docs
            .write()
            .unwrap()
            .insert(doc.id.clone(), doc.clone());
        Ok(())
    }

    async fn delete(&self, id: &str) -> Result<(), SinkError> {
        self.docs.write().unwrap().remove(id);
        Ok(())
    }
}
