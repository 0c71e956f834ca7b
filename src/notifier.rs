use async_trait::async_trait;
use reqwest::{Client, Url};
use serde_json::{json, Value};
use std::fmt;
use thiserror::Error;
use tracing::{info, warn};

/// Header carrying the post's external correlation id.
pub const CORRELATION_HEADER: &str = "post-id";

#[derive(Debug, Error)]
pub enum NotifyError {
    #[error("notification request failed: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("notification endpoint returned {status}: {body}")]
    Status { status: u16, body: String },
}

/// Outbound signal sent when a post enters review.
#[async_trait]
pub trait Notifier: Send + Sync {
    /// Returns the endpoint's response body (JSON, or a JSON string when it is not JSON).
    async fn send(&self, correlation_id: Option<&str>) -> Result<Value, NotifyError>;
}

#[derive(Clone)]
pub struct HttpNotifier {
    http: Client,
    endpoint: Url,
    fail_on_error_status: bool,
}

impl fmt::Debug for HttpNotifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HttpNotifier")
            .field("endpoint", &self.endpoint)
            .field("fail_on_error_status", &self.fail_on_error_status)
            .finish_non_exhaustive()
    }
}

impl HttpNotifier {
    pub fn new(endpoint: Url, fail_on_error_status: bool) -> Result<Self, NotifyError> {
        let http = Client::builder()
            .user_agent(concat!("toxic-sync/", env!("CARGO_PKG_VERSION")))
            .no_proxy()
            .build()?;
        Ok(Self {
            http,
            endpoint,
            fail_on_error_status,
        })
    }

    pub fn build_request(&self, correlation_id: Option<&str>) -> Result<reqwest::Request, NotifyError> {
        let mut req = self.http.put(self.endpoint.clone()).json(&json!({}));
        if let Some(id) = correlation_id {
            req = req.header(CORRELATION_HEADER, id);
        }
        Ok(req.build()?)
    }
}

#[async_trait]
impl Notifier for HttpNotifier {
    async fn send(&self, correlation_id: Option<&str>) -> Result<Value, NotifyError> {
        if correlation_id.is_none() {
            warn!("post has no post-id; sending notification without correlation header");
        }
        let request = self.build_request(correlation_id)?;
        let res = self.http.execute(request).await?;

        let status = res.status();
        let body = res.text().await?;
        if !status.is_success() {
            if self.fail_on_error_status {
                return Err(NotifyError::Status {
                    status: status.as_u16(),
                    body,
                });
            }
            // Delivered but rejected upstream; only logged.
            warn!(status = status.as_u16(), correlation_id, "notification endpoint returned error status");
        }

        let payload = serde_json::from_str(&body).unwrap_or(Value::String(body));
        info!(status = status.as_u16(), correlation_id, "notification sent");
        Ok(payload)
    }
}
