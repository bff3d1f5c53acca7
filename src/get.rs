//! Document retrieval by collection and id.

use anyhow::{bail, Result};
use knowledge_sync_core::{Document, DocumentSink};

use crate::config::Config;
use crate::db;
use crate::sqlite_sink::SqliteSink;

pub async fn get_document(config: &Config, collection: &str, id: &str) -> Result<Document> {
    let pool = db::connect(config).await?;
    let sink = SqliteSink::new(pool.clone(), collection);
    let found = sink.get(id).await;
    pool.close().await;

    match found? {
        Some(doc) => Ok(doc),
        None => bail!("document not found: {} in {}", id, collection),
    }
}

/// CLI entry point: prints the document as JSON.
pub async fn run_get(config: &Config, collection: &str, id: &str) -> Result<()> {
    let doc = get_document(config, collection, id).await?;
    println!("{}", serde_json::to_string_pretty(&doc)?);
    Ok(())
}
