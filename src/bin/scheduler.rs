use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tracing::{error, info, level_filters::LevelFilter, trace};
use tracing_subscriber::{EnvFilter, filter, layer::SubscriberExt, util::SubscriberInitExt};
use uptime_engine::{
    config::{NotifierConfig, StorageConfig, read_config_file},
    engine::UptimeEngine,
    notifier::{LogNotifier, Notifier, WebhookNotifier},
    prober::HttpProber,
    storage::{MemoryStore, Stores},
    util,
};

#[derive(Debug, Clone, Parser)]
struct Args {
    /// Config file
    #[arg(short)]
    file: String,
}

fn init() {
    // RUST_LOG takes precedence over the built-in targets
    let env_filter = std::env::var("RUST_LOG")
        .ok()
        .and_then(|_| EnvFilter::try_from_default_env().ok());

    let targets = env_filter.is_none().then(|| {
        filter::Targets::new().with_targets(vec![
            ("uptime_engine", LevelFilter::DEBUG),
            ("uptime_scheduler", LevelFilter::TRACE),
        ])
    });

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(std::io::stderr)
                .compact()
                .with_ansi(false),
        )
        .with(env_filter)
        .with(targets)
        .init();
}

async fn open_stores(storage: &StorageConfig) -> anyhow::Result<Stores> {
    match storage {
        StorageConfig::None => {
            info!("using in-memory storage, nothing will be persisted");
            Ok(Stores::from_backend(Arc::new(MemoryStore::new())))
        }
        #[cfg(feature = "storage-sqlite")]
        StorageConfig::Sqlite { path } => {
            let store = uptime_engine::storage::sqlite::SqliteStore::new(path)
                .await
                .with_context(|| format!("failed to open database {}", path.display()))?;
            Ok(Stores::from_backend(Arc::new(store)))
        }
        #[cfg(not(feature = "storage-sqlite"))]
        StorageConfig::Sqlite { .. } => {
            anyhow::bail!("SQLite storage requested but the storage-sqlite feature is disabled")
        }
    }
}

fn build_notifier(config: &NotifierConfig) -> anyhow::Result<Arc<dyn Notifier>> {
    let timeout = config.webhook_timeout();

    if let Some(url) = util::get_webhook_url() {
        return Ok(Arc::new(WebhookNotifier::new(url, timeout)?));
    }

    let notifier: Arc<dyn Notifier> = match config {
        NotifierConfig::Log => Arc::new(LogNotifier),
        NotifierConfig::Webhook { url, .. } => Arc::new(WebhookNotifier::new(url.clone(), timeout)?),
    };
    Ok(notifier)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv::dotenv().ok();
    init();
    let args = Args::parse();
    trace!("started with args: {args:?}");

    // without plan limits the quota gate cannot work, so this is fatal
    let config = read_config_file(&args.file)
        .with_context(|| format!("could not load configuration from {}", args.file))?;

    let stores = open_stores(&config.storage).await?;
    let notifier = build_notifier(&config.notifier)?;
    let prober = Arc::new(HttpProber::new()?);

    let engine = UptimeEngine::start(&config, stores, prober, notifier);

    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("failed to listen for shutdown signal: {e}");
    }

    info!("shutting down");
    engine.shutdown().await;

    Ok(())
}
