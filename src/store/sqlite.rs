use async_trait::async_trait;
use serde_json::{Map, Value};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions, SqliteRow};
use sqlx::{Row, Sqlite, SqlitePool, Transaction};
use std::collections::HashSet;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, instrument};
use uuid::Uuid;

use super::{ChangeFeed, Delivery, DocumentStore, StoreError};
use crate::model::{ChangeEvent, Document};

pub type Pool = SqlitePool;

pub async fn init_pool(database_url: &str) -> Result<Pool, StoreError> {
    let normalized = prepare_sqlite_url(database_url);
    let options = SqliteConnectOptions::from_str(&normalized)?.create_if_missing(true);
    let pool = SqlitePoolOptions::new().connect_with(options).await?;
    // Enable WAL and stricter durability.
    sqlx::query("PRAGMA journal_mode=WAL;")
        .execute(&pool)
        .await?;
    sqlx::query("PRAGMA synchronous=FULL;")
        .execute(&pool)
        .await?;
    Ok(pool)
}

/// Single-connection in-memory pool, migrated. Used by tests and dry runs.
pub async fn memory_pool() -> Result<Pool, StoreError> {
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect("sqlite::memory:")
        .await?;
    run_migrations(&pool).await?;
    Ok(pool)
}

/// If using a file-backed SQLite URL, expand a leading `~/` and ensure the parent
/// directory exists. Leaves in-memory URLs untouched. Returns possibly-updated URL.
fn prepare_sqlite_url(url: &str) -> String {
    if !url.starts_with("sqlite:") || url.starts_with("sqlite::memory") {
        return url.to_string();
    }

    let rest = &url["sqlite:".len()..];
    let path_with_query = rest.strip_prefix("//").unwrap_or(rest);
    let (path_part, query_part) = match path_with_query.split_once('?') {
        Some((p, q)) => (p, Some(q)),
        None => (path_with_query, None),
    };
    if path_part.is_empty() {
        return url.to_string();
    }

    let expanded_path = match (path_part.strip_prefix("~/"), std::env::var("HOME")) {
        (Some(rest), Ok(home)) => format!("{}/{}", home.trim_end_matches('/'), rest),
        _ => path_part.to_string(),
    };

    if let Some(parent) = std::path::Path::new(&expanded_path).parent() {
        if !parent.as_os_str().is_empty() {
            let _ = std::fs::create_dir_all(parent);
        }
    }

    let mut rebuilt = String::from("sqlite://");
    rebuilt.push_str(&expanded_path);
    if let Some(q) = query_part {
        rebuilt.push('?');
        rebuilt.push_str(q);
    }
    rebuilt
}

pub async fn run_migrations(pool: &Pool) -> Result<(), StoreError> {
    sqlx::migrate!("./migrations")
        .run(pool)
        .await
        ?;
    Ok(())
}

/// SQLite-backed document store and change feed.
///
/// Every write to a watched collection appends a row to `change_events` in the
/// same transaction, so a change is never lost between commit and delivery.
#[derive(Debug, Clone)]
pub struct SqliteStore {
    pool: Pool,
    watched: Arc<HashSet<String>>,
}

impl SqliteStore {
    pub fn new(pool: Pool) -> Self {
        Self {
            pool,
            watched: Arc::new(HashSet::new()),
        }
    }

    /// Record change events for writes to `collection`.
    pub fn watch(mut self, collection: impl Into<String>) -> Self {
        Arc::make_mut(&mut self.watched).insert(collection.into());
        self
    }

    pub fn pool(&self) -> &Pool {
        &self.pool
    }

    fn is_watched(&self, collection: &str) -> bool {
        self.watched.contains(collection)
    }

    async fn load_tx(
        tx: &mut Transaction<'_, Sqlite>,
        collection: &str,
        id: &str,
    ) -> Result<Option<Document>, StoreError> {
        let data: Option<String> =
            sqlx::query_scalar("SELECT data FROM documents WHERE collection = ? AND id = ?")
                .bind(collection)
                .bind(id)
                .fetch_optional(&mut **tx)
                .await?;
        data.map(|raw| parse_document(id, &raw)).transpose()
    }

    async fn write_tx(
        tx: &mut Transaction<'_, Sqlite>,
        collection: &str,
        id: &str,
        data: &Map<String, Value>,
    ) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO documents (collection, id, data) VALUES (?, ?, ?) \
             ON CONFLICT(collection, id) DO UPDATE SET data = excluded.data, updated_at = CURRENT_TIMESTAMP",
        )
        .bind(collection)
        .bind(id)
        .bind(serde_json::to_string(data)?)
        .execute(&mut **tx)
        .await?;
        Ok(())
    }

    async fn record_change_tx(
        &self,
        tx: &mut Transaction<'_, Sqlite>,
        collection: &str,
        id: &str,
        before: Option<&Document>,
        after: Option<&Document>,
    ) -> Result<(), StoreError> {
        if !self.is_watched(collection) {
            return Ok(());
        }
        let encode = |doc: Option<&Document>| doc.map(|d| serde_json::to_string(&d.data)).transpose();
        sqlx::query(
            "INSERT INTO change_events (collection, document_id, before_data, after_data) VALUES (?, ?, ?, ?)",
        )
        .bind(collection)
        .bind(id)
        .bind(encode(before)?)
        .bind(encode(after)?)
        .execute(&mut **tx)
        .await?;
        debug!(collection, document_id = id, "recorded change event");
        Ok(())
    }
}

fn parse_document(id: &str, raw: &str) -> Result<Document, StoreError> {
    Ok(Document::new(id, serde_json::from_str(raw)?))
}

fn decode_delivery(row: SqliteRow) -> Result<Delivery, StoreError> {
    let document_id: String = row.get("document_id");
    let before_data: Option<String> = row.get("before_data");
    let after_data: Option<String> = row.get("after_data");
    let before = before_data
        .map(|raw| parse_document(&document_id, &raw))
        .transpose()?;
    let after = after_data
        .map(|raw| parse_document(&document_id, &raw))
        .transpose()?;
    Ok(Delivery {
        id: row.get("id"),
        attempt: row.get("attempt"),
        event: ChangeEvent {
            collection: row.get("collection"),
            document_id,
            before,
            after,
        },
    })
}

#[async_trait]
impl DocumentStore for SqliteStore {
    #[instrument(skip_all)]
    async fn get(&self, collection: &str, id: &str) -> Result<Option<Document>, StoreError> {
        let mut tx = self.pool.begin().await?;
        let doc = Self::load_tx(&mut tx, collection, id).await?;
        tx.commit().await?;
        Ok(doc)
    }

    #[instrument(skip_all)]
    async fn create(
        &self,
        collection: &str,
        data: Map<String, Value>,
    ) -> Result<String, StoreError> {
        let id = Uuid::new_v4().to_string();
        let mut tx = self.pool.begin().await?;
        Self::write_tx(&mut tx, collection, &id, &data).await?;
        let after = Document::new(id.clone(), data);
        self.record_change_tx(&mut tx, collection, &id, None, Some(&after))
            .await?;
        tx.commit().await?;
        Ok(id)
    }

    #[instrument(skip_all)]
    async fn set(
        &self,
        collection: &str,
        id: &str,
        data: Map<String, Value>,
    ) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await?;
        let before = Self::load_tx(&mut tx, collection, id).await?;
        Self::write_tx(&mut tx, collection, id, &data).await?;
        let after = Document::new(id, data);
        self.record_change_tx(&mut tx, collection, id, before.as_ref(), Some(&after))
            .await?;
        tx.commit().await?;
        Ok(())
    }

    #[instrument(skip_all)]
    async fn update(
        &self,
        collection: &str,
        id: &str,
        fields: Map<String, Value>,
    ) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await?;
        let Some(before) = Self::load_tx(&mut tx, collection, id).await? else {
            return Err(StoreError::NotFound {
                collection: collection.to_string(),
                id: id.to_string(),
            });
        };
        let mut merged = before.data.clone();
        merged.extend(fields);
        Self::write_tx(&mut tx, collection, id, &merged).await?;
        let after = Document::new(id, merged);
        self.record_change_tx(&mut tx, collection, id, Some(&before), Some(&after))
            .await?;
        tx.commit().await?;
        Ok(())
    }

    #[instrument(skip_all)]
    async fn delete(&self, collection: &str, id: &str) -> Result<bool, StoreError> {
        let mut tx = self.pool.begin().await?;
        let Some(before) = Self::load_tx(&mut tx, collection, id).await? else {
            return Ok(false);
        };
        sqlx::query("DELETE FROM documents WHERE collection = ? AND id = ?")
            .bind(collection)
            .bind(id)
            .execute(&mut *tx)
            .await?;
        self.record_change_tx(&mut tx, collection, id, Some(&before), None)
            .await?;
        tx.commit().await?;
        Ok(true)
    }

    #[instrument(skip_all)]
    async fn query_by_field(
        &self,
        collection: &str,
        field: &str,
        value: &Value,
    ) -> Result<Vec<Document>, StoreError> {
        // SQLite folds `true` and `1` together, so matches are re-checked in Rust.
        let path = format!("$.\"{}\"", field);
        let rows = if value.is_null() {
            sqlx::query(
                "SELECT id, data FROM documents WHERE collection = ? AND json_type(data, ?) = 'null' \
                 ORDER BY created_at ASC, rowid ASC",
            )
            .bind(collection)
            .bind(path)
            .fetch_all(&self.pool)
            .await?
        } else {
            sqlx::query(
                "SELECT id, data FROM documents WHERE collection = ? AND json_extract(data, ?) = json_extract(?, '$') \
                 ORDER BY created_at ASC, rowid ASC",
            )
            .bind(collection)
            .bind(path)
            .bind(value.to_string())
            .fetch_all(&self.pool)
            .await?
        };

        let mut docs = Vec::new();
        for row in rows {
            let id: String = row.get("id");
            let data: Map<String, Value> = serde_json::from_str(row.get::<&str, _>("data"))?;
            if data.get(field) == Some(value) {
                docs.push(Document::new(id, data));
            }
        }
        Ok(docs)
    }
}

#[async_trait]
impl ChangeFeed for SqliteStore {
    #[instrument(skip_all)]
    async fn next_due(&self, collection: &str) -> Result<Option<Delivery>, StoreError> {
        let row = sqlx::query(
            "SELECT c.id, c.collection, c.document_id, c.before_data, c.after_data, c.attempt FROM change_events c \
             WHERE c.collection = ? AND datetime(c.due_at) <= CURRENT_TIMESTAMP \
             AND NOT EXISTS ( \
                 SELECT 1 FROM change_events p \
                 WHERE p.collection = c.collection AND p.document_id = c.document_id AND p.id < c.id \
             ) \
             ORDER BY datetime(c.due_at) ASC, c.id ASC LIMIT 1",
        )
        .bind(collection)
        .fetch_optional(&self.pool)
        .await?;
        row.map(decode_delivery).transpose()
    }

    #[instrument(skip_all)]
    async fn ack(&self, delivery_id: i64) -> Result<(), StoreError> {
        sqlx::query("DELETE FROM change_events WHERE id = ?")
            .bind(delivery_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    #[instrument(skip_all)]
    async fn retry_later(&self, delivery_id: i64, delay: Duration) -> Result<(), StoreError> {
        let secs = delay.as_secs() as i64;
        sqlx::query(
            "UPDATE change_events SET attempt = attempt + 1, due_at = datetime('now', ? || ' seconds') WHERE id = ?",
        )
        .bind(secs)
        .bind(delivery_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    #[instrument(skip_all)]
    async fn pending(&self, collection: &str) -> Result<i64, StoreError> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM change_events WHERE collection = ?")
            .bind(collection)
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn obj(v: Value) -> Map<String, Value> {
        v.as_object().cloned().unwrap()
    }

    async fn setup_store() -> SqliteStore {
        let pool = memory_pool().await.unwrap();
        SqliteStore::new(pool).watch("posts")
    }

    #[test]
    fn prepare_url_passes_memory_through() {
        assert_eq!(prepare_sqlite_url("sqlite::memory:"), "sqlite::memory:");
        assert_eq!(prepare_sqlite_url("postgres://x"), "postgres://x");
    }

    #[test]
    fn prepare_url_normalizes_file_paths() {
        let td = tempfile::tempdir().unwrap();
        let path = td.path().join("nested").join("db.sqlite");
        let url = format!("sqlite:{}?mode=rwc", path.display());
        let out = prepare_sqlite_url(&url);
        assert_eq!(out, format!("sqlite://{}?mode=rwc", path.display()));
        assert!(path.parent().unwrap().exists());
    }

    #[tokio::test]
    async fn update_merges_fields_and_records_change() {
        let store = setup_store().await;
        store
            .set("posts", "p1", obj(json!({"flagged-as-toxic": true, "body": "hi"})))
            .await
            .unwrap();
        store
            .update("posts", "p1", obj(json!({"flagged-as-toxic": false, "is-toxic": true})))
            .await
            .unwrap();

        let doc = store.get("posts", "p1").await.unwrap().unwrap();
        assert_eq!(doc.get("body"), Some(&json!("hi")));
        assert_eq!(doc.get_bool("flagged-as-toxic"), Some(false));
        assert_eq!(doc.get_bool("is-toxic"), Some(true));

        assert_eq!(store.pending("posts").await.unwrap(), 2);
        let first = store.next_due("posts").await.unwrap().unwrap();
        assert!(first.event.before.is_none());
        assert_eq!(first.event.document_id, "p1");
        store.ack(first.id).await.unwrap();

        let second = store.next_due("posts").await.unwrap().unwrap();
        assert_eq!(
            second.event.before.as_ref().unwrap().get_bool("flagged-as-toxic"),
            Some(true)
        );
        assert_eq!(
            second.event.after.as_ref().unwrap().get_bool("flagged-as-toxic"),
            Some(false)
        );
    }

    #[tokio::test]
    async fn update_missing_document_is_not_found() {
        let store = setup_store().await;
        let err = store
            .update("posts", "ghost", obj(json!({"is-toxic": true})))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::NotFound { .. }));
        assert_eq!(store.pending("posts").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn unwatched_collections_emit_no_changes() {
        let store = setup_store().await;
        let id = store
            .create("queue", obj(json!({"original_id": "p1"})))
            .await
            .unwrap();
        assert!(store.get("queue", &id).await.unwrap().is_some());
        assert_eq!(store.pending("queue").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn delete_records_tombstone() {
        let store = setup_store().await;
        store.set("posts", "p1", obj(json!({"a": 1}))).await.unwrap();
        assert!(store.delete("posts", "p1").await.unwrap());
        assert!(!store.delete("posts", "p1").await.unwrap());

        let d1 = store.next_due("posts").await.unwrap().unwrap();
        store.ack(d1.id).await.unwrap();
        let d2 = store.next_due("posts").await.unwrap().unwrap();
        assert!(d2.event.is_deletion());
        assert_eq!(d2.event.before.unwrap().get("a"), Some(&json!(1)));
    }

    #[tokio::test]
    async fn query_by_field_matches_exact_values() {
        let store = setup_store().await;
        store.create("queue", obj(json!({"original_id": "p1"}))).await.unwrap();
        store.create("queue", obj(json!({"original_id": "p1"}))).await.unwrap();
        store.create("queue", obj(json!({"original_id": "p2"}))).await.unwrap();
        store.create("queue", obj(json!({"other": "p1"}))).await.unwrap();

        let hits = store
            .query_by_field("queue", "original_id", &json!("p1"))
            .await
            .unwrap();
        assert_eq!(hits.len(), 2);
        let none = store
            .query_by_field("queue", "original_id", &json!("p3"))
            .await
            .unwrap();
        assert!(none.is_empty());
    }

    #[tokio::test]
    async fn later_change_waits_for_pending_retry_of_same_document() {
        let store = setup_store().await;
        store.set("posts", "p1", obj(json!({"v": 1}))).await.unwrap();
        let first = store.next_due("posts").await.unwrap().unwrap();
        store.retry_later(first.id, Duration::from_secs(60)).await.unwrap();

        store.set("posts", "p1", obj(json!({"v": 2}))).await.unwrap();
        store.set("posts", "p2", obj(json!({"v": 1}))).await.unwrap();

        // p1's second change is held back; p2 is unaffected.
        let next = store.next_due("posts").await.unwrap().unwrap();
        assert_eq!(next.event.document_id, "p2");
        store.ack(next.id).await.unwrap();
        assert!(store.next_due("posts").await.unwrap().is_none());

        sqlx::query("UPDATE change_events SET due_at = datetime('now', '-1 seconds') WHERE id = ?")
            .bind(first.id)
            .execute(store.pool())
            .await
            .unwrap();
        let retried = store.next_due("posts").await.unwrap().unwrap();
        assert_eq!(retried.id, first.id);
        store.ack(retried.id).await.unwrap();

        let last = store.next_due("posts").await.unwrap().unwrap();
        assert_eq!(last.event.document_id, "p1");
        assert_eq!(last.event.after.unwrap().get("v"), Some(&json!(2)));
    }

    #[tokio::test]
    async fn query_by_field_filters_non_string_values() {
        let store = setup_store().await;
        store.create("queue", obj(json!({"n": 1}))).await.unwrap();
        store.create("queue", obj(json!({"n": true}))).await.unwrap();
        store.create("queue", obj(json!({"n": null}))).await.unwrap();
        store.create("queue", obj(json!({"m": 1}))).await.unwrap();

        let ones = store.query_by_field("queue", "n", &json!(1)).await.unwrap();
        assert_eq!(ones.len(), 1);
        assert_eq!(ones[0].get("n"), Some(&json!(1)));
        let trues = store.query_by_field("queue", "n", &json!(true)).await.unwrap();
        assert_eq!(trues.len(), 1);
        assert_eq!(trues[0].get("n"), Some(&json!(true)));
        let nulls = store.query_by_field("queue", "n", &Value::Null).await.unwrap();
        assert_eq!(nulls.len(), 1);
    }

    #[tokio::test]
    async fn retry_later_defers_and_counts_attempts() {
        let store = setup_store().await;
        store.set("posts", "p1", obj(json!({}))).await.unwrap();
        let d = store.next_due("posts").await.unwrap().unwrap();
        assert_eq!(d.attempt, 0);
        store.retry_later(d.id, Duration::from_secs(60)).await.unwrap();
        assert!(store.next_due("posts").await.unwrap().is_none());

        sqlx::query("UPDATE change_events SET due_at = datetime('now', '-1 seconds') WHERE id = ?")
            .bind(d.id)
            .execute(store.pool())
            .await
            .unwrap();
        let again = store.next_due("posts").await.unwrap().unwrap();
        assert_eq!(again.id, d.id);
        assert_eq!(again.attempt, 1);
    }
}
