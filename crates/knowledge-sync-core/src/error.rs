//! Typed failures of the sync pipeline.
//!
//! Every per-instance and per-item failure is caught at its boundary by the
//! engine and folded into the run summary; none of these abort a run.

use std::fmt;
use std::path::PathBuf;

use thiserror::Error;

/// Failure of a [`SourceConnector`](crate::connector::SourceConnector) call.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConnectorError {
    /// The human-given descriptor does not map to an instance. Skip the instance.
    #[error("'{descriptor}' not found: {reason}")]
    NotFound { descriptor: String, reason: String },
    /// Network or API failure. The watermark stays where it was.
    #[error("fetch failed: {0}")]
    Transient(String),
}

impl ConnectorError {
    pub fn not_found(descriptor: &str, reason: impl Into<String>) -> Self {
        ConnectorError::NotFound {
            descriptor: descriptor.to_string(),
            reason: reason.into(),
        }
    }

    /// Wraps any displayable error, keeping the full `anyhow` context chain.
    pub fn transient(err: impl fmt::Display) -> Self {
        ConnectorError::Transient(format!("{:#}", err))
    }
}

/// Which sink call failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SinkOp {
    Get,
    Upsert,
    Delete,
}

impl fmt::Display for SinkOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let op = match self {
            SinkOp::Get => "get",
            SinkOp::Upsert => "upsert",
            SinkOp::Delete => "delete",
        };
        f.write_str(op)
    }
}

/// A single document operation against the sink failed.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("sink {op} failed for '{id}': {message}")]
pub struct SinkError {
    pub op: SinkOp,
    pub id: String,
    pub message: String,
}

impl SinkError {
    pub fn new(op: SinkOp, id: &str, err: impl fmt::Display) -> Self {
        Self {
            op,
            id: id.to_string(),
            message: format!("{:#}", err),
        }
    }
}

/// Failure to read or write persisted sync state.
#[derive(Debug, Error)]
pub enum StateError {
    #[error("state I/O failed at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to encode sync state: {0}")]
    Encode(#[from] serde_json::Error),
    /// Persisted state exists but cannot be decoded. Loading degrades to empty state.
    #[error("sync state at {location} is unreadable: {message}")]
    Corrupt { location: String, message: String },
}
