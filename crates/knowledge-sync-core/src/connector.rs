//! Source connector capability.
//!
//! A [`SourceConnector`] maps human-given instance descriptors (a repository
//! path, a channel name) to handles, and reports what changed in an instance
//! since a watermark. Connectors never touch persisted state; the engine owns
//! it and hands them the prior watermark.

use async_trait::async_trait;

use crate::error::ConnectorError;
use crate::models::{Delta, SyncWatermark, WatermarkKind};
use crate::state::StateScope;

/// A resolved source instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstanceHandle {
    /// Canonical instance key, used in document ids and in persisted state.
    pub key: String,
    /// The platform's own identifier (project id, channel id).
    pub remote_id: String,
    pub web_url: Option<String>,
    /// Default ref to follow, for instances that have one.
    pub default_ref: Option<String>,
}

impl InstanceHandle {
    pub fn new(key: impl Into<String>, remote_id: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            remote_id: remote_id.into(),
            web_url: None,
            default_ref: None,
        }
    }
}

/// A data source that yields change sets since a watermark.
#[async_trait]
pub trait SourceConnector: Send + Sync {
    /// Where this connector's records live in persisted state.
    fn scope(&self) -> StateScope;

    /// The watermark variant this connector produces and accepts.
    fn watermark_kind(&self) -> WatermarkKind;

    /// Unit `source_type` whose natural keys are recorded in `indexed_units`.
    ///
    /// Connectors that return `Some` let the engine delete documents of units
    /// that vanished between runs when a rescan replaces the usual diff.
    fn tracked_source_type(&self) -> Option<&str> {
        None
    }

    /// Map a descriptor to an instance handle.
    async fn resolve_instance(&self, descriptor: &str) -> Result<InstanceHandle, ConnectorError>;

    /// Report changes since `watermark`, or everything present when it is `None`.
    async fn fetch_delta(
        &self,
        handle: &InstanceHandle,
        watermark: Option<&SyncWatermark>,
    ) -> Result<Delta, ConnectorError>;
}
