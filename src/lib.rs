//! # knowledge-sync
//!
//! Incremental synchronization of GitLab repositories and Slack channels
//! into a SQLite document store.
//!
//! The sync engine, data models, and the connector / sink / state-store
//! traits live in [`knowledge_sync_core`]. This crate provides the concrete
//! pieces and the `ksync` CLI.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────┐   ┌────────────┐   ┌──────────────┐
//! │ Connectors   │──▶│ SyncEngine │──▶│ SqliteSink   │
//! │ GitLab/Slack │   │ (core)     │   │ documents    │
//! └──────────────┘   └─────┬──────┘   └──────────────┘
//!                          │
//!                          ▼
//!                  ┌────────────────┐
//!                  │ JsonStateStore │
//!                  │ watermarks     │
//!                  └────────────────┘
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration and environment credentials |
//! | [`connector_gitlab`] | Repository connector (code, commits, merge requests) |
//! | [`connector_slack`] | Channel connector (messages) |
//! | [`sqlite_sink`] | SQLite document sink |
//! | [`state_file`] | JSON watermark store with atomic saves |
//! | [`ingest`] | Builds sync jobs and runs the engine |
//! | [`db`] | Database connection |
//! | [`migrate`] | Schema creation |

pub mod config;
pub mod connector_gitlab;
pub mod connector_slack;
pub mod db;
pub mod get;
pub mod ingest;
pub mod migrate;
pub mod sqlite_sink;
pub mod state_file;
pub mod status;
