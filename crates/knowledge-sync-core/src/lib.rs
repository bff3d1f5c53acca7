//! # knowledge-sync core
//!
//! Runtime-free logic for incremental ingestion: data models, the admission
//! policy, the connector / sink / state-store traits with in-memory
//! implementations, and the [`engine::SyncEngine`] that ties them together.
//!
//! This crate contains no tokio, sqlx, HTTP, or filesystem I/O. Concrete
//! connectors and stores live in the `knowledge-sync` crate.

pub mod admission;
pub mod connector;
pub mod engine;
pub mod error;
pub mod models;
pub mod sink;
pub mod state;

pub use admission::{Admission, AdmissionPolicy, AdmissionRules};
pub use connector::{InstanceHandle, SourceConnector};
pub use engine::{InstanceCounts, InstanceOutcome, InstanceStatus, RunSummary, SyncEngine, SyncJob, SyncPhase};
pub use error::{ConnectorError, SinkError, SinkOp, StateError};
pub use models::{
    ChangeSet, ContentUnit, Delta, Document, MetadataValue, SyncWatermark, UnitKey, WatermarkKind,
};
pub use sink::DocumentSink;
pub use state::{StateScope, StateStore, SyncRunRecord, SyncState};
