//! Document sink abstraction.
//!
//! The [`DocumentSink`] trait is the engine's only view of the knowledge
//! store: an existence check, an idempotent upsert keyed by document id, and
//! a delete that tolerates absent ids. Every call is treated as having a real
//! cost; the engine avoids redundant ones.
//!
//! Implementations must be `Send + Sync` to work with async runtimes.

pub mod memory;

use async_trait::async_trait;

use crate::error::SinkError;
use crate::models::Document;

/// Idempotent document store keyed by a stable identifier.
///
/// | Method | Purpose |
/// |--------|---------|
/// | [`get`](DocumentSink::get) | Existence check, used for the idempotent skip |
/// | [`upsert`](DocumentSink::upsert) | Insert or replace; same id twice is one record |
/// | [`delete`](DocumentSink::delete) | Remove; absent id is success |
#[async_trait]
pub trait DocumentSink: Send + Sync {
    async fn get(&self, id: &str) -> Result<Option<Document>, SinkError>;

    async fn upsert(&self, doc: &Document) -> Result<(), SinkError>;

    async fn delete(&self, id: &str) -> Result<(), SinkError>;
}
