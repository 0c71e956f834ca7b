//! Mirrors flagged posts into the review queue collection.
use chrono::{SecondsFormat, Utc};
use serde_json::Value;
use std::sync::Arc;
use thiserror::Error;
use tracing::{info, instrument, warn};

use crate::config::QueuePolicy;
use crate::model::{
    Document, QueueEntry, FIELD_ORIGINAL_COLLECTION, FIELD_ORIGINAL_ID, FIELD_PROCESSED_AT,
};
use crate::store::{DocumentStore, StoreError};

#[derive(Debug, Error)]
pub enum QueueError {
    #[error(transparent)]
    Storage(#[from] StoreError),
    #[error("removed {removed} of {total} queue entries for {original_id}: {source}")]
    PartialRemoval {
        original_id: String,
        removed: usize,
        total: usize,
        #[source]
        source: StoreError,
    },
}

pub struct QueueSynchronizer {
    store: Arc<dyn DocumentStore>,
    queue_collection: String,
    source_collection: String,
    policy: QueuePolicy,
}

impl QueueSynchronizer {
    pub fn new(
        store: Arc<dyn DocumentStore>,
        queue_collection: impl Into<String>,
        source_collection: impl Into<String>,
        policy: QueuePolicy,
    ) -> Self {
        Self {
            store,
            queue_collection: queue_collection.into(),
            source_collection: source_collection.into(),
            policy,
        }
    }

    pub fn policy(&self) -> QueuePolicy {
        self.policy
    }

    /// Copy `record` into the queue, tagged with its origin. Returns the entry id.
    ///
    /// Under `Append` every call adds a row. Under `Upsert` the first existing
    /// row for `original_id` is overwritten and any further duplicates removed.
    #[instrument(skip_all, fields(original_id = %original_id))]
    pub async fn upsert(&self, record: &Document, original_id: &str) -> Result<String, QueueError> {
        let mut data = record.data.clone();
        data.insert(FIELD_ORIGINAL_ID.into(), Value::String(original_id.to_string()));
        data.insert(
            FIELD_ORIGINAL_COLLECTION.into(),
            Value::String(self.source_collection.clone()),
        );
        data.insert(
            FIELD_PROCESSED_AT.into(),
            Value::String(Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)),
        );

        if self.policy == QueuePolicy::Append {
            let id = self.store.create(&self.queue_collection, data).await?;
            info!(
                original_id,
                collection = %self.queue_collection,
                entry_id = %id,
                "copied toxic content to queue"
            );
            return Ok(id);
        }

        let existing = self.entries_for(original_id).await?;
        let Some((first, duplicates)) = existing.split_first() else {
            let id = self.store.create(&self.queue_collection, data).await?;
            info!(
                original_id,
                collection = %self.queue_collection,
                entry_id = %id,
                "copied toxic content to queue"
            );
            return Ok(id);
        };

        self.store
            .set(&self.queue_collection, &first.id, data)
            .await?;
        for dup in duplicates {
            self.store.delete(&self.queue_collection, &dup.id).await?;
        }
        info!(
            original_id,
            collection = %self.queue_collection,
            entry_id = %first.id,
            collapsed = duplicates.len(),
            "refreshed existing queue entry"
        );
        Ok(first.id.clone())
    }

    /// Delete every queue entry for `original_id`. Returns how many were removed.
    #[instrument(skip_all, fields(original_id = %original_id))]
    pub async fn remove_all(&self, original_id: &str) -> Result<usize, QueueError> {
        let matches = self.entries_for(original_id).await?;
        let total = matches.len();
        let mut removed = 0;
        for entry in &matches {
            match self.store.delete(&self.queue_collection, &entry.id).await {
                // Already gone counts as removed.
                Ok(_) => removed += 1,
                Err(source) => {
                    warn!(
                        original_id,
                        removed,
                        total,
                        entry_id = %entry.id,
                        "queue cleanup stopped partway"
                    );
                    return Err(QueueError::PartialRemoval {
                        original_id: original_id.to_string(),
                        removed,
                        total,
                        source,
                    });
                }
            }
        }
        if removed > 0 {
            info!(
                original_id,
                removed_count = removed,
                collection = %self.queue_collection,
                "removed entries from queue"
            );
        }
        Ok(removed)
    }

    /// Queue entries currently referencing `original_id`, oldest first.
    pub async fn entries(&self, original_id: &str) -> Result<Vec<QueueEntry>, QueueError> {
        Ok(self
            .entries_for(original_id)
            .await?
            .into_iter()
            .map(QueueEntry::from)
            .collect())
    }

    async fn entries_for(&self, original_id: &str) -> Result<Vec<Document>, StoreError> {
        self.store
            .query_by_field(
                &self.queue_collection,
                FIELD_ORIGINAL_ID,
                &Value::String(original_id.to_string()),
            )
            .await
    }
}
