//! Postgres dedup ledger over the `processed_items` table.

use async_trait::async_trait;
use uuid::Uuid;

use crate::error::Result;
use crate::model::{ContentHash, ProcessedRecord};
use crate::store::DedupStore;

#[derive(sqlx::FromRow)]
struct ProcessedRow {
    item_id: String,
    content_hash: String,
    is_relevant: bool,
    analysis: serde_json::Value,
    model_used: String,
    processed_at: chrono::DateTime<chrono::Utc>,
}

impl From<ProcessedRow> for ProcessedRecord {
    fn from(row: ProcessedRow) -> Self {
        ProcessedRecord {
            item_id: row.item_id,
            content_hash: ContentHash(row.content_hash),
            processed_at: row.processed_at,
            is_relevant: row.is_relevant,
            analysis: row.analysis,
            model_used: row.model_used,
        }
    }
}

impl super::Db {
    /// Number of rows in the ledger.
    pub async fn processed_count(&self) -> Result<i64> {
        let (count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM processed_items")
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }
}

#[async_trait]
impl DedupStore for super::Db {
    async fn find(&self, item_id: &str) -> Result<Option<ProcessedRecord>> {
        let row: Option<ProcessedRow> = sqlx::query_as(
            "SELECT item_id, content_hash, is_relevant, analysis, model_used, processed_at
             FROM processed_items WHERE item_id = $1",
        )
        .bind(item_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(ProcessedRecord::from))
    }

    async fn upsert(
        &self,
        item_id: &str,
        content_hash: &ContentHash,
        is_relevant: bool,
        analysis: serde_json::Value,
        model_id: &str,
    ) -> Result<ProcessedRecord> {
        let row: ProcessedRow = sqlx::query_as(
            "INSERT INTO processed_items (id, item_id, content_hash, is_relevant, analysis, model_used, processed_at)
             VALUES ($1, $2, $3, $4, $5, $6, now())
             ON CONFLICT (item_id) DO UPDATE SET
                 content_hash = EXCLUDED.content_hash,
                 is_relevant = EXCLUDED.is_relevant,
                 analysis = EXCLUDED.analysis,
                 model_used = EXCLUDED.model_used,
                 processed_at = EXCLUDED.processed_at
             RETURNING item_id, content_hash, is_relevant, analysis, model_used, processed_at",
        )
        .bind(Uuid::new_v4())
        .bind(item_id)
        .bind(content_hash.as_str())
        .bind(is_relevant)
        .bind(&analysis)
        .bind(model_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(row.into())
    }
}
