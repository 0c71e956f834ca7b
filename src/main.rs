use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

use toxic_sync::config;
use toxic_sync::dispatcher::ChangeEventDispatcher;
use toxic_sync::feed::{self, Redelivery};
use toxic_sync::notifier::HttpNotifier;
use toxic_sync::queue::QueueSynchronizer;
use toxic_sync::resolution::ResolutionHandler;
use toxic_sync::server::{self, AppState};
use toxic_sync::store::{sqlite, DocumentStore, SqliteStore};

#[derive(Debug, Parser)]
#[command(author, version, about)]
struct Args {
    /// Path to YAML config file
    #[arg(long, default_value = "config.yaml")]
    config: PathBuf,
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
    let listen_addr = cfg.listen_addr()?;

    let pool = sqlite::init_pool(&cfg.app.database_url).await?;
    sqlite::run_migrations(&pool).await?;
    let store = SqliteStore::new(pool).watch(cfg.collections.posts.clone());
    let documents: Arc<dyn DocumentStore> = Arc::new(store.clone());

    let endpoint = reqwest::Url::parse(&cfg.notification.url).context("notification.url")?;
    let notifier = HttpNotifier::new(endpoint, cfg.notification.fail_on_error_status)?;
    let queue = QueueSynchronizer::new(
        documents.clone(),
        cfg.collections.queue.clone(),
        cfg.collections.posts.clone(),
        cfg.queue.policy,
    );
    let dispatcher = ChangeEventDispatcher::new(queue, Arc::new(notifier), cfg.queue.cascade_delete);

    // One consumer; changes are handled one at a time.
    let worker_store = store.clone();
    let collection = cfg.collections.posts.clone();
    let poll_interval = Duration::from_millis(cfg.app.poll_interval_ms);
    let policy = Redelivery {
        max_backoff_secs: cfg.app.max_backoff_seconds,
        max_attempts: cfg.app.max_attempts,
    };
    tokio::spawn(async move {
        feed::run(&worker_store, &dispatcher, &collection, poll_interval, policy).await;
    });

    let resolutions = ResolutionHandler::new(
        documents,
        cfg.collections.posts.clone(),
        cfg.app.region.clone(),
    );
    let app = server::router(AppState {
        resolutions: Arc::new(resolutions),
    });

    let listener = tokio::net::TcpListener::bind(listen_addr)
        .await
        .with_context(|| format!("failed to bind {}", listen_addr))?;
    info!(
        %listen_addr,
        posts = %cfg.collections.posts,
        queue = %cfg.collections.queue,
        policy = ?cfg.queue.policy,
        region = %cfg.app.region,
        "starting moderation sync"
    );
    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            info!("shutting down");
        })
        .await?;

    Ok(())
}
