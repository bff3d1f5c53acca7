//! JSON file [`StateStore`].
//!
//! The state lives in a single JSON document (by default
//! `.indexer-state.json` next to the database). Saves write a sibling temp
//! file, fsync it, and rename it over the target, so an interrupted save
//! leaves the previous file intact.

use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use knowledge_sync_core::state::decode_state;
use knowledge_sync_core::{StateError, StateStore, SyncState};
use tracing::warn;

pub struct JsonStateStore {
    path: PathBuf,
}

impl JsonStateStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn temp_path(&self) -> PathBuf {
        let mut name = self
            .path
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_default();
        name.push(".tmp");
        self.path.with_file_name(name)
    }

    fn io_error(&self, path: &Path, source: std::io::Error) -> StateError {
        StateError::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}

impl StateStore for JsonStateStore {
    fn load(&self) -> SyncState {
        let raw = match fs::read_to_string(&self.path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return SyncState::default(),
            Err(e) => {
                warn!(path = %self.path.display(), error = %e, "cannot read sync state; starting empty");
                return SyncState::default();
            }
        };
        if raw.trim().is_empty() {
            return SyncState::default();
        }
        decode_state(&raw, &self.path.display().to_string()).unwrap_or_else(|e| {
            warn!(error = %e, "discarding unreadable sync state");
            SyncState::default()
        })
    }

    fn save(&self, state: &SyncState) -> Result<(), StateError> {
        let encoded = serde_json::to_string_pretty(state)?;

        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(|e| self.io_error(parent, e))?;
        }

        let temp = self.temp_path();
        {
            let file = File::create(&temp).map_err(|e| self.io_error(&temp, e))?;
            let mut writer = BufWriter::new(file);
            writer
                .write_all(encoded.as_bytes())
                .and_then(|_| writer.flush())
                .and_then(|_| writer.get_ref().sync_all())
                .map_err(|e| self.io_error(&temp, e))?;
        }

        fs::rename(&temp, &self.path).map_err(|e| {
            let _ = fs::remove_file(&temp);
            self.io_error(&self.path, e)
        })
    }

    fn reset(&self) -> Result<(), StateError> {
        match fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(self.io_error(&self.path, e)),
        }
    }
}
