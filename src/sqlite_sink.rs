//! SQLite-backed [`DocumentSink`].
//!
//! Documents live in a single `documents` table keyed by
//! `(collection, id)`; each sink handle is bound to one collection.
//! Upserts use `ON CONFLICT DO UPDATE` so writing the same id twice leaves
//! one row.

use async_trait::async_trait;
use chrono::Utc;
use knowledge_sync_core::models::Metadata;
use knowledge_sync_core::{Document, DocumentSink, SinkError, SinkOp};
use sqlx::{Row, SqlitePool};

/// Document sink writing into one collection of the SQLite database.
#[derive(Clone)]
pub struct SqliteSink {
    pool: SqlitePool,
    collection: String,
}

impl SqliteSink {
    pub fn new(pool: SqlitePool, collection: impl Into<String>) -> Self {
        Self {
            pool,
            collection: collection.into(),
        }
    }

    pub fn collection(&self) -> &str {
        &self.collection
    }

    /// Number of documents in this sink's collection.
    pub async fn count(&self) -> anyhow::Result<i64> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM documents WHERE collection = ?")
            .bind(&self.collection)
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }
}

#[async_trait]
impl DocumentSink for SqliteSink {
    async fn get(&self, id: &str) -> Result<Option<Document>, SinkError> {
        let row = sqlx::query(
            "SELECT id, text, metadata_json FROM documents WHERE collection = ? AND id = ?",
        )
        .bind(&self.collection)
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| SinkError::new(SinkOp::Get, id, e))?;

        let Some(row) = row else {
            return Ok(None);
        };
        let metadata_json: String = row.get("metadata_json");
        let metadata: Metadata = serde_json::from_str(&metadata_json)
            .map_err(|e| SinkError::new(SinkOp::Get, id, e))?;

        Ok(Some(Document {
            id: row.get("id"),
            text: row.get("text"),
            metadata,
        }))
    }

    async fn upsert(&self, doc: &Document) -> Result<(), SinkError> {
        let metadata_json = serde_json::to_string(&doc.metadata)
            .map_err(|e| SinkError::new(SinkOp::Upsert, &doc.id, e))?;

        sqlx::query(
            r#"
            INSERT INTO documents (collection, id, text, metadata_json, indexed_at)
            VALUES (?, ?, ?, ?, ?)
            ON CONFLICT(collection, id) DO UPDATE SET
                text = excluded.text,
                metadata_json = excluded.metadata_json,
                indexed_at = excluded.indexed_at
            "#,
        )
        .bind(&self.collection)
        .bind(&doc.id)
        .bind(&doc.text)
        .bind(&metadata_json)
        .bind(Utc::now().timestamp())
        .execute(&self.pool)
        .await
        .map_err(|e| SinkError::new(SinkOp::Upsert, &doc.id, e))?;

        Ok(())
    }

    async fn delete(&self, id: &str) -> Result<(), SinkError> {
        sqlx::query("DELETE FROM documents WHERE collection = ? AND id = ?")
            .bind(&self.collection)
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(|e| SinkError::new(SinkOp::Delete, id, e))?;
        Ok(())
    }
}
