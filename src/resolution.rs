use serde_json::{Map, Value};
use std::sync::Arc;
use thiserror::Error;
use tracing::{error, info, instrument};

use crate::model::{Action, FIELD_FLAGGED, FIELD_IS_TOXIC};
use crate::path::PathError;
use crate::store::{DocumentStore, StoreError};

#[derive(Debug, Error)]
pub enum ResolutionError {
    #[error(transparent)]
    InvalidPath(#[from] PathError),
    #[error("No document found with ID: {0}")]
    NotFound(String),
    #[error("Error updating document: {0}")]
    Storage(#[from] StoreError),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Resolution {
    pub id: String,
    pub action: Action,
    pub message: String,
}

/// Applies a reviewer's decision to a post.
pub struct ResolutionHandler {
    store: Arc<dyn DocumentStore>,
    collection: String,
    region: String,
}

impl ResolutionHandler {
    pub fn new(
        store: Arc<dyn DocumentStore>,
        collection: impl Into<String>,
        region: impl Into<String>,
    ) -> Self {
        Self {
            store,
            collection: collection.into(),
            region: region.into(),
        }
    }

    /// Clear the review flag and record the verdict. Reads then writes without a
    /// version check; concurrent resolutions of one post are last-write-wins.
    #[instrument(skip_all, fields(document_id = %id, action = action.as_str()))]
    pub async fn resolve(&self, id: &str, action: Action) -> Result<Resolution, ResolutionError> {
        let existing = self.store.get(&self.collection, id).await.map_err(|err| {
            error!(document_id = id, error = %err, "error loading document");
            err
        })?;
        if existing.is_none() {
            return Err(ResolutionError::NotFound(id.to_string()));
        }

        let mut fields = Map::new();
        fields.insert(FIELD_FLAGGED.into(), Value::Bool(false));
        fields.insert(FIELD_IS_TOXIC.into(), Value::Bool(action.is_toxic()));
        match self.store.update(&self.collection, id, fields).await {
            Ok(()) => {}
            // Deleted between the read and the write.
            Err(StoreError::NotFound { .. }) => return Err(ResolutionError::NotFound(id.to_string())),
            Err(err) => {
                error!(document_id = id, error = %err, "error updating document");
                return Err(err.into());
            }
        }

        info!(
            document_id = id,
            action = action.as_str(),
            region = %self.region,
            "toxic resolution processed"
        );
        Ok(Resolution {
            id: id.to_string(),
            action,
            message: format!("Document {} marked as {}", id, action.verdict()),
        })
    }
}
