//! Collaborator contracts: the dedup ledger and the source of work items.
//!
//! The Postgres-backed ledger lives in [`crate::db`]; this module holds the
//! traits plus the in-process and file-backed adapters.

use std::collections::HashMap;
use std::marker::PhantomData;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::Utc;
use serde::de::DeserializeOwned;
use tokio::sync::RwLock;

use crate::error::{Error, Result};
use crate::model::{ContentHash, ProcessedRecord, WorkItem};

/// Persisted outcomes keyed uniquely by item id. Upserts are last-write-wins.
#[async_trait]
pub trait DedupStore: Send + Sync {
    async fn find(&self, item_id: &str) -> Result<Option<ProcessedRecord>>;

    async fn upsert(
        &self,
        item_id: &str,
        content_hash: &ContentHash,
        is_relevant: bool,
        analysis: serde_json::Value,
        model_id: &str,
    ) -> Result<ProcessedRecord>;
}

/// Supplies candidate items for a user.
#[async_trait]
pub trait WorkSource<T: WorkItem>: Send + Sync {
    async fn unprocessed_items(&self, user_id: &str) -> Result<Vec<T>>;
}

// ---------------------------------------------------------------------------
// In-memory ledger
// ---------------------------------------------------------------------------

#[derive(Default)]
pub struct MemoryDedupStore {
    records: RwLock<HashMap<String, ProcessedRecord>>,
}

impl MemoryDedupStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.records.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.records.read().await.is_empty()
    }

    /// Copy of every record, sorted by item id.
    pub async fn snapshot(&self) -> Vec<ProcessedRecord> {
        let mut records: Vec<_> = self.records.read().await.values().cloned().collect();
        records.sort_by(|a, b| a.item_id.cmp(&b.item_id));
        records
    }
}

#[async_trait]
impl DedupStore for MemoryDedupStore {
    async fn find(&self, item_id: &str) -> Result<Option<ProcessedRecord>> {
        Ok(self.records.read().await.get(item_id).cloned())
    }

    async fn upsert(
        &self,
        item_id: &str,
        content_hash: &ContentHash,
        is_relevant: bool,
        analysis: serde_json::Value,
        model_id: &str,
    ) -> Result<ProcessedRecord> {
        let record = ProcessedRecord {
            item_id: item_id.to_string(),
            content_hash: content_hash.clone(),
            processed_at: Utc::now(),
            is_relevant,
            analysis,
            model_used: model_id.to_string(),
        };
        self.records
            .write()
            .await
            .insert(item_id.to_string(), record.clone());
        Ok(record)
    }
}

// ---------------------------------------------------------------------------
// File-backed work source
// ---------------------------------------------------------------------------

/// Reads a JSON array of items from disk on every call. The user id is not
/// used to filter; the file is assumed to belong to the caller.
pub struct JsonFileSource<T> {
    path: PathBuf,
    _item: PhantomData<fn() -> T>,
}

impl<T> JsonFileSource<T> {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            _item: PhantomData,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl<T> WorkSource<T> for JsonFileSource<T>
where
    T: WorkItem + DeserializeOwned,
{
    async fn unprocessed_items(&self, _user_id: &str) -> Result<Vec<T>> {
        let content = tokio::fs::read_to_string(&self.path).await?;
        serde_json::from_str(&content).map_err(|e| {
            Error::Config(format!("invalid work item file {}: {e}", self.path.display()))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::CalendarEvent;
    use serde_json::json;

    #[tokio::test]
    async fn upsert_is_last_write_wins() {
        let store = MemoryDedupStore::new();
        let h1 = ContentHash("aaa".to_string());
        let h2 = ContentHash("bbb".to_string());

        store
            .upsert("evt-1", &h1, true, json!({"category": "client"}), "m1")
            .await
            .unwrap();
        store
            .upsert("evt-1", &h2, false, json!({"category": "personal"}), "m2")
            .await
            .unwrap();

        assert_eq!(store.len().await, 1);
        let record = store.find("evt-1").await.unwrap().unwrap();
        assert_eq!(record.content_hash, h2);
        assert!(!record.is_relevant);
        assert_eq!(record.model_used, "m2");
        assert!(store.find("evt-2").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn json_file_source_reads_items() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("events.json");
        std::fs::write(
            &path,
            r#"[{"id":"e1","summary":"Lunch with Priya","start":"2026-03-02T12:00:00Z","end":"2026-03-02T13:00:00Z","attendees":["priya@example.com"]}]"#,
        )
        .unwrap();

        let source: JsonFileSource<CalendarEvent> = JsonFileSource::new(&path);
        let items = source.unprocessed_items("u1").await.unwrap();
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].item_id(), "e1");
        assert!(items[0].location.is_none());
    }

    #[tokio::test]
    async fn json_file_source_reports_bad_content() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("events.json");
        std::fs::write(&path, "{not json").unwrap();

        let source: JsonFileSource<CalendarEvent> = JsonFileSource::new(&path);
        assert!(matches!(
            source.unprocessed_items("u1").await,
            Err(Error::Config(_))
        ));
    }
}
