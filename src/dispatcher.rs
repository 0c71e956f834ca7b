//! Turns one change event on the posts collection into queue and notification side effects.
use serde_json::Value;
use std::sync::Arc;
use thiserror::Error;
use tracing::{error, info, instrument};

use crate::evaluator;
use crate::model::{ChangeEvent, FIELD_POST_ID};
use crate::notifier::{NotifyError, Notifier};
use crate::queue::{QueueError, QueueSynchronizer};

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("queue sync failed: {0}")]
    Queue(#[from] QueueError),
    #[error("notification failed: {0}")]
    Network(#[from] NotifyError),
}

/// What a handled change did.
#[derive(Debug, Clone, PartialEq)]
pub enum SyncOutcome {
    /// Post is flagged: queue entry written and notification sent.
    Flagged {
        entry_id: String,
        notification: Value,
    },
    /// Post is not flagged: its queue entries were removed.
    Cleared { removed: usize },
    /// Post was deleted. `removed` is zero unless cascade deletion is enabled.
    Deleted { removed: usize },
}

pub struct ChangeEventDispatcher {
    queue: QueueSynchronizer,
    notifier: Arc<dyn Notifier>,
    cascade_delete: bool,
}

impl ChangeEventDispatcher {
    pub fn new(queue: QueueSynchronizer, notifier: Arc<dyn Notifier>, cascade_delete: bool) -> Self {
        Self {
            queue,
            notifier,
            cascade_delete,
        }
    }

    pub fn queue(&self) -> &QueueSynchronizer {
        &self.queue
    }

    #[instrument(skip_all, fields(document_id = %event.document_id))]
    pub async fn handle(&self, event: &ChangeEvent) -> Result<SyncOutcome, SyncError> {
        let id = event.document_id.as_str();

        let Some(after) = &event.after else {
            info!(document_id = id, "document deleted");
            if !self.cascade_delete {
                return Ok(SyncOutcome::Deleted { removed: 0 });
            }
            let removed = self.queue.remove_all(id).await.map_err(|err| {
                error!(document_id = id, error = %err, "error cleaning up queue after delete");
                err
            })?;
            return Ok(SyncOutcome::Deleted { removed });
        };

        if evaluator::evaluate(after) {
            let entry_id = self.queue.upsert(after, &after.id).await.map_err(|err| {
                error!(document_id = id, error = %err, "error processing toxic content");
                err
            })?;
            let notification = self
                .notifier
                .send(after.get_str(FIELD_POST_ID))
                .await
                .map_err(|err| {
                    error!(document_id = id, entry_id = %entry_id, error = %err, "error sending notification");
                    err
                })?;
            Ok(SyncOutcome::Flagged {
                entry_id,
                notification,
            })
        } else {
            let removed = self.queue.remove_all(&after.id).await.map_err(|err| {
                error!(document_id = id, error = %err, "error cleaning up queue");
                err
            })?;
            Ok(SyncOutcome::Cleared { removed })
        }
    }
}
