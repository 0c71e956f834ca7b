#![allow(dead_code)]

use async_trait::async_trait;
use serde_json::{json, Map, Value};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;
use toxic_sync::config::QueuePolicy;
use toxic_sync::dispatcher::ChangeEventDispatcher;
use toxic_sync::model::Document;
use toxic_sync::notifier::{NotifyError, Notifier};
use toxic_sync::queue::QueueSynchronizer;
use toxic_sync::store::{sqlite, DocumentStore, SqliteStore, StoreError};

pub const POSTS: &str = "posts-iteration-1.0";
pub const QUEUE: &str = "toxic-queries-test";

pub async fn setup_store() -> SqliteStore {
    let pool = sqlite::memory_pool().await.unwrap();
    SqliteStore::new(pool).watch(POSTS)
}

pub fn obj(v: Value) -> Map<String, Value> {
    v.as_object().cloned().unwrap()
}

pub fn post(id: &str, v: Value) -> Document {
    Document::new(id, obj(v))
}

#[derive(Clone, Default)]
pub struct RecordingNotifier {
    responses: Arc<Mutex<VecDeque<Result<Value, NotifyError>>>>,
    calls: Arc<Mutex<Vec<Option<String>>>>,
}

impl RecordingNotifier {
    pub fn with_responses(responses: Vec<Result<Value, NotifyError>>) -> Self {
        Self {
            responses: Arc::new(Mutex::new(VecDeque::from(responses))),
            ..Default::default()
        }
    }

    pub async fn calls(&self) -> Vec<Option<String>> {
        self.calls.lock().await.clone()
    }
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn send(&self, correlation_id: Option<&str>) -> Result<Value, NotifyError> {
        self.calls
            .lock()
            .await
            .push(correlation_id.map(str::to_string));
        let mut guard = self.responses.lock().await;
        guard.pop_front().unwrap_or_else(|| Ok(json!({"ok": true})))
    }
}

pub fn unavailable() -> NotifyError {
    NotifyError::Status {
        status: 503,
        body: "unavailable".into(),
    }
}

pub fn dispatcher(
    store: Arc<dyn DocumentStore>,
    notifier: &RecordingNotifier,
    policy: QueuePolicy,
    cascade_delete: bool,
) -> ChangeEventDispatcher {
    let queue = QueueSynchronizer::new(store, QUEUE, POSTS, policy);
    ChangeEventDispatcher::new(queue, Arc::new(notifier.clone()), cascade_delete)
}

pub async fn queue_count(store: &dyn DocumentStore, original_id: &str) -> usize {
    store
        .query_by_field(QUEUE, "original_id", &json!(original_id))
        .await
        .unwrap()
        .len()
}

/// Delegates to SQLite but fails deletes after `allowed` have succeeded.
pub struct FlakyDeletes {
    pub inner: SqliteStore,
    pub allowed: usize,
    pub deleted: AtomicUsize,
}

impl FlakyDeletes {
    pub fn new(inner: SqliteStore, allowed: usize) -> Self {
        Self {
            inner,
            allowed,
            deleted: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl DocumentStore for FlakyDeletes {
    async fn get(&self, collection: &str, id: &str) -> Result<Option<Document>, StoreError> {
        self.inner.get(collection, id).await
    }

    async fn create(&self, collection: &str, data: Map<String, Value>) -> Result<String, StoreError> {
        self.inner.create(collection, data).await
    }

    async fn set(&self, collection: &str, id: &str, data: Map<String, Value>) -> Result<(), StoreError> {
        self.inner.set(collection, id, data).await
    }

    async fn update(
        &self,
        collection: &str,
        id: &str,
        fields: Map<String, Value>,
    ) -> Result<(), StoreError> {
        self.inner.update(collection, id, fields).await
    }

    async fn delete(&self, collection: &str, id: &str) -> Result<bool, StoreError> {
        if self.deleted.load(Ordering::SeqCst) >= self.allowed {
            return Err(StoreError::Database(sqlx::Error::PoolClosed));
        }
        self.deleted.fetch_add(1, Ordering::SeqCst);
        self.inner.delete(collection, id).await
    }

    async fn query_by_field(
        &self,
        collection: &str,
        field: &str,
        value: &Value,
    ) -> Result<Vec<Document>, StoreError> {
        self.inner.query_by_field(collection, field, value).await
    }
}
