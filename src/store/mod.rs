//! Storage capabilities.
//!
//! - `DocumentStore`: keyed JSON documents grouped by collection.
//! - `ChangeFeed`: durable before/after snapshots of writes to watched collections.
//!
//! The two are separate traits; a backend may implement both (see `sqlite`).

use async_trait::async_trait;
use serde_json::{Map, Value};
use std::time::Duration;
use thiserror::Error;

use crate::model::{ChangeEvent, Document};

pub mod sqlite;

pub use sqlite::SqliteStore;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("migration error: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),
    #[error("invalid document JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("document {collection}/{id} not found")]
    NotFound { collection: String, id: String },
}

#[async_trait]
pub trait DocumentStore: Send + Sync {
    async fn get(&self, collection: &str, id: &str) -> Result<Option<Document>, StoreError>;

    /// Insert under a freshly generated id and return it.
    async fn create(&self, collection: &str, data: Map<String, Value>)
        -> Result<String, StoreError>;

    /// Create or fully replace the document at `id`.
    async fn set(
        &self,
        collection: &str,
        id: &str,
        data: Map<String, Value>,
    ) -> Result<(), StoreError>;

    /// Merge `fields` into an existing document; other fields are untouched.
    async fn update(
        &self,
        collection: &str,
        id: &str,
        fields: Map<String, Value>,
    ) -> Result<(), StoreError>;

    /// Returns whether a document was removed.
    async fn delete(&self, collection: &str, id: &str) -> Result<bool, StoreError>;

    async fn query_by_field(
        &self,
        collection: &str,
        field: &str,
        value: &Value,
    ) -> Result<Vec<Document>, StoreError>;
}

/// One pending change handed to a consumer. `attempt` counts earlier failed deliveries.
#[derive(Debug, Clone, PartialEq)]
pub struct Delivery {
    pub id: i64,
    pub attempt: i32,
    pub event: ChangeEvent,
}

#[async_trait]
pub trait ChangeFeed: Send + Sync {
    /// Oldest change for `collection` whose due time has passed.
    ///
    /// A change is held back while an older change for the same document is still
    /// pending, so each document's changes are delivered in commit order.
    async fn next_due(&self, collection: &str) -> Result<Option<Delivery>, StoreError>;

    /// Mark a delivery handled; it will not be redelivered.
    async fn ack(&self, delivery_id: i64) -> Result<(), StoreError>;

    /// Schedule a failed delivery again after `delay`, bumping its attempt count.
    async fn retry_later(&self, delivery_id: i64, delay: Duration) -> Result<(), StoreError>;

    async fn pending(&self, collection: &str) -> Result<i64, StoreError>;
}
