//! Delivers change events to the dispatcher at least once.
//!
//! A failed delivery is rescheduled with exponential backoff and redelivered
//! in full, so a notification or queue write may repeat across attempts.
use anyhow::Result;
use futures::stream::{self, BoxStream, StreamExt};
use std::time::Duration;
use tracing::{error, info, instrument, warn};

use crate::dispatcher::ChangeEventDispatcher;
use crate::store::{ChangeFeed, Delivery, StoreError};

/// Retry policy for failed deliveries.
#[derive(Debug, Clone, Copy)]
pub struct Redelivery {
    pub max_backoff_secs: u64,
    pub max_attempts: i32,
}

impl Redelivery {
    /// 5s * 2^attempt, capped at `max_backoff_secs` (0 disables the cap).
    pub fn delay(&self, attempt: i32) -> Duration {
        let secs = 5_u64 * (1_u64 << attempt.clamp(0, 10));
        let secs = if self.max_backoff_secs == 0 {
            secs
        } else {
            secs.min(self.max_backoff_secs)
        };
        Duration::from_secs(secs)
    }
}

/// Stream of due changes for `collection`, polling every `poll_interval` while idle.
///
/// The next item is fetched only when requested, so the consumer must ack or
/// reschedule a delivery before pulling the next one.
pub fn subscribe<'a>(
    feed: &'a dyn ChangeFeed,
    collection: &'a str,
    poll_interval: Duration,
) -> BoxStream<'a, Result<Delivery, StoreError>> {
    stream::unfold((), move |()| async move {
        loop {
            match feed.next_due(collection).await {
                Ok(Some(delivery)) => return Some((Ok(delivery), ())),
                Ok(None) => tokio::time::sleep(poll_interval).await,
                Err(err) => return Some((Err(err), ())),
            }
        }
    })
    .boxed()
}

/// Dispatch one delivery, then ack it or schedule a retry. Returns whether it was acked.
#[instrument(skip_all, fields(delivery_id = delivery.id, document_id = %delivery.event.document_id))]
pub async fn handle_delivery(
    feed: &dyn ChangeFeed,
    dispatcher: &ChangeEventDispatcher,
    delivery: &Delivery,
    policy: Redelivery,
) -> Result<bool> {
    let document_id = delivery.event.document_id.as_str();
    match dispatcher.handle(&delivery.event).await {
        Ok(outcome) => {
            feed.ack(delivery.id).await?;
            info!(id = delivery.id, document_id, ?outcome, "change event handled");
            Ok(true)
        }
        Err(err) => {
            let attempt = delivery.attempt + 1;
            if attempt >= policy.max_attempts {
                error!(
                    id = delivery.id,
                    document_id,
                    attempt,
                    error = %err,
                    "change event failed too many times; dropping"
                );
                feed.ack(delivery.id).await?;
                return Ok(false);
            }
            let delay = policy.delay(delivery.attempt);
            warn!(
                id = delivery.id,
                document_id,
                attempt,
                retry_in_secs = delay.as_secs(),
                error = %err,
                "change event failed; backoff"
            );
            feed.retry_later(delivery.id, delay).await?;
            Ok(false)
        }
    }
}

/// Handle the next due change, if any. Returns whether one was taken.
#[instrument(skip_all)]
pub async fn process_next_event(
    feed: &dyn ChangeFeed,
    dispatcher: &ChangeEventDispatcher,
    collection: &str,
    policy: Redelivery,
) -> Result<bool> {
    let Some(delivery) = feed.next_due(collection).await? else {
        return Ok(false);
    };
    handle_delivery(feed, dispatcher, &delivery, policy).await?;
    Ok(true)
}

/// Consume the feed for `collection` until the stream ends.
pub async fn run(
    feed: &dyn ChangeFeed,
    dispatcher: &ChangeEventDispatcher,
    collection: &str,
    poll_interval: Duration,
    policy: Redelivery,
) {
    info!(collection, "watching collection for changes");
    let mut deliveries = subscribe(feed, collection, poll_interval);
    while let Some(next) = deliveries.next().await {
        let result = match next {
            Ok(delivery) => handle_delivery(feed, dispatcher, &delivery, policy)
                .await
                .map(|_| ()),
            Err(err) => Err(err.into()),
        };
        if let Err(err) = result {
            error!(?err, collection, "change feed worker error");
            tokio::time::sleep(Duration::from_secs(1)).await;
        }
    }
}
