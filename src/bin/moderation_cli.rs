use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand};
use serde_json::{Map, Value};
use std::path::PathBuf;
use std::sync::Arc;

use toxic_sync::config;
use toxic_sync::model::{PostRecord, FIELD_FLAGGED};
use toxic_sync::queue::QueueSynchronizer;
use toxic_sync::store::{sqlite, ChangeFeed, DocumentStore, SqliteStore};

#[derive(Debug, Parser)]
#[command(
    author,
    version,
    about = "Inspect and edit posts and the review queue in the moderation database"
)]
struct Args {
    /// Path to YAML config file
    #[arg(long, default_value = "config.yaml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Create or replace a post from a JSON object
    Put { id: String, json: String },
    /// Set flagged-as-toxic = true on a post
    Flag { id: String },
    /// Set flagged-as-toxic = false on a post
    Unflag { id: String },
    /// Delete a post
    Delete { id: String },
    /// Print a post
    Get { id: String },
    /// List review queue entries for a post
    Queue { id: String },
    /// Count change events not yet delivered
    Pending,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_target(false)
        .compact()
        .init();

    let args = Args::parse();
    let cfg = config::load(Some(&args.config))?;

    let pool = sqlite::init_pool(&cfg.app.database_url).await?;
    sqlite::run_migrations(&pool).await?;
    let store = SqliteStore::new(pool).watch(cfg.collections.posts.clone());
    let posts = cfg.collections.posts.as_str();

    match args.command {
        Command::Put { id, json } => {
            let value: Value = serde_json::from_str(&json).context("invalid JSON")?;
            let Value::Object(data) = value else {
                return Err(anyhow!("post must be a JSON object"));
            };
            store.set(posts, &id, data).await?;
            println!("stored {}/{}", posts, id);
        }
        Command::Flag { id } => set_flag(&store, posts, &id, true).await?,
        Command::Unflag { id } => set_flag(&store, posts, &id, false).await?,
        Command::Delete { id } => {
            if store.delete(posts, &id).await? {
                println!("deleted {}/{}", posts, id);
            } else {
                println!("no post {}/{}", posts, id);
            }
        }
        Command::Get { id } => match store.get(posts, &id).await? {
            Some(doc) => {
                let record = PostRecord::from(&doc);
                println!("{}", serde_json::to_string_pretty(&doc.data)?);
                println!("state: {:?}", record.state());
            }
            None => println!("no post {}/{}", posts, id),
        },
        Command::Queue { id } => {
            let queue = QueueSynchronizer::new(
                Arc::new(store.clone()),
                cfg.collections.queue.clone(),
                cfg.collections.posts.clone(),
                cfg.queue.policy,
            );
            let entries = queue.entries(&id).await?;
            println!("{} queue entries for {}", entries.len(), id);
            for entry in entries {
                let processed_at = entry
                    .processed_at
                    .map(|t| t.to_rfc3339())
                    .unwrap_or_else(|| "-".into());
                println!("  {}  processed_at={}", entry.id, processed_at);
            }
        }
        Command::Pending => {
            let pending = store.pending(posts).await?;
            println!("{} pending change events for {}", pending, posts);
        }
    }
    Ok(())
}

async fn set_flag(store: &SqliteStore, collection: &str, id: &str, flagged: bool) -> Result<()> {
    let mut fields = Map::new();
    fields.insert(FIELD_FLAGGED.into(), Value::Bool(flagged));
    store
        .update(collection, id, fields)
        .await
        .with_context(|| format!("failed to update {}/{}", collection, id))?;
    println!("{}/{} {} = {}", collection, id, FIELD_FLAGGED, flagged);
    Ok(())
}
