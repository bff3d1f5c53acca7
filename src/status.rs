use anyhow::Result;
use knowledge_sync_core::{StateStore, SyncRunRecord};

use crate::config::Config;
use crate::state_file::JsonStateStore;

/// Print every persisted watermark, one row per source instance.
pub fn show_status(config: &Config) -> Result<()> {
    let store = JsonStateStore::new(config.state_path());
    let state = store.load();

    if state.is_empty() {
        println!("no sync state recorded at {}", store.path().display());
        return Ok(());
    }

    println!(
        "{:<8} {:<10} {:<32} {:<28} {:<22} TRACKED",
        "SOURCE", "COLLECTION", "INSTANCE", "WATERMARK", "LAST RUN"
    );
    for (scope, instance, record) in state.records() {
        println!(
            "{:<8} {:<10} {:<32} {:<28} {:<22} {}",
            scope.source,
            scope.collection,
            instance,
            record.watermark.to_string(),
            record.last_run.format("%Y-%m-%d %H:%M:%S UTC").to_string(),
            tracked(record)
        );
    }
    Ok(())
}

fn tracked(record: &SyncRunRecord) -> String {
    match &record.indexed_units {
        Some(units) => units.len().to_string(),
        None => "-".to_string(),
    }
}
