//! Configuration loader and validator for the moderation sync service.
use serde::{Deserialize, Serialize};
use std::fs;
use std::net::SocketAddr;
use std::path::Path;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("YAML parse error: {0}")]
    Parse(#[from] serde_yaml::Error),
    #[error("Invalid configuration: {0}")]
    Invalid(&'static str),
}

/// Root configuration struct mirroring the YAML schema. Every key has a default.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct Config {
    pub app: App,
    pub collections: Collections,
    pub queue: Queue,
    pub notification: Notification,
}

/// Process-level settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct App {
    pub database_url: String,
    pub listen_addr: String,
    pub region: String,
    pub poll_interval_ms: u64,
    pub max_backoff_seconds: u64,
    /// Failed deliveries of one change before it is dropped.
    pub max_attempts: i32,
}

impl Default for App {
    fn default() -> Self {
        Self {
            database_url: "sqlite://./data/moderation.db".into(),
            listen_addr: "0.0.0.0:8080".into(),
            region: "us-central1".into(),
            poll_interval_ms: 500,
            max_backoff_seconds: 60,
            max_attempts: 10,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct Collections {
    pub posts: String,
    pub queue: String,
}

impl Default for Collections {
    fn default() -> Self {
        Self {
            posts: "posts-iteration-1.0".into(),
            queue: "toxic-queries-test".into(),
        }
    }
}

/// How flagged writes are mirrored into the review queue.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum QueuePolicy {
    /// One entry per flagged write, no deduplication.
    Append,
    /// At most one entry per `original_id`.
    #[default]
    Upsert,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct Queue {
    pub policy: QueuePolicy,
    /// Remove queue entries when their post is deleted.
    pub cascade_delete: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct Notification {
    pub url: String,
    /// Treat non-2xx responses as failures instead of logging them.
    pub fail_on_error_status: bool,
}

impl Default for Notification {
    fn default() -> Self {
        Self {
            url: "https://httpbin.org/put".into(),
            fail_on_error_status: false,
        }
    }
}

impl Config {
    /// Apply overrides from the process environment.
    pub fn apply_env(&mut self) {
        self.apply_overrides(|key| std::env::var(key).ok());
    }

    fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(v) = lookup("POSTS_COLLECTION") {
            self.collections.posts = v;
        }
        if let Some(v) = lookup("QUERIES_COLLECTION") {
            self.collections.queue = v;
        }
        if let Some(v) = lookup("ADMIN_UPDATE_URL") {
            self.notification.url = v;
        }
        if let Some(v) = lookup("FUNCTION_REGION") {
            self.app.region = v;
        }
        if let Some(v) = lookup("DATABASE_URL") {
            self.app.database_url = v;
        }
    }

    pub fn listen_addr(&self) -> Result<SocketAddr, ConfigError> {
        self.app
            .listen_addr
            .parse()
            .map_err(|_| ConfigError::Invalid("app.listen_addr must be host:port"))
    }
}

/// Load configuration from a YAML file, apply environment overrides and validate.
/// - If `path` is None, uses `config.yaml` in the current working directory.
/// - A missing file yields the defaults.
pub fn load(path: Option<&Path>) -> Result<Config, ConfigError> {
    let path = path.unwrap_or_else(|| Path::new("config.yaml"));
    let mut cfg = if path.exists() {
        let content = fs::read_to_string(path)?;
        serde_yaml::from_str(&content)?
    } else {
        Config::default()
    };
    cfg.apply_env();
    validate(&cfg)?;
    Ok(cfg)
}

/// Validate a configuration instance.
pub fn validate(cfg: &Config) -> Result<(), ConfigError> {
    if cfg.app.database_url.trim().is_empty() {
        return Err(ConfigError::Invalid("app.database_url must be non-empty"));
    }
    cfg.listen_addr()?;
    if cfg.app.poll_interval_ms == 0 {
        return Err(ConfigError::Invalid("app.poll_interval_ms must be > 0"));
    }
    if cfg.app.max_attempts <= 0 {
        return Err(ConfigError::Invalid("app.max_attempts must be > 0"));
    }

    if cfg.collections.posts.trim().is_empty() {
        return Err(ConfigError::Invalid("collections.posts must be non-empty"));
    }
    if cfg.collections.queue.trim().is_empty() {
        return Err(ConfigError::Invalid("collections.queue must be non-empty"));
    }
    if cfg.collections.posts == cfg.collections.queue {
        return Err(ConfigError::Invalid(
            "collections.posts and collections.queue must differ",
        ));
    }

    if reqwest::Url::parse(&cfg.notification.url).is_err() {
        return Err(ConfigError::Invalid("notification.url must be an absolute URL"));
    }

    Ok(())
}

/// Returns the documented example YAML.
pub fn example() -> &'static str {
    r#"app:
  database_url: "sqlite://./data/moderation.db"
  listen_addr: "0.0.0.0:8080"
  region: "us-central1"
  poll_interval_ms: 500
  max_backoff_seconds: 60
  max_attempts: 10

collections:
  posts: "posts-iteration-1.0"
  queue: "toxic-queries-test"

queue:
  # "upsert" keeps one entry per post; "append" adds one per flagged write.
  policy: upsert
  cascade_delete: false

notification:
  url: "https://httpbin.org/put"
  fail_on_error_status: false
"#
}
