use std::{path::PathBuf, time::Duration};

use anyhow::{Context, bail};
use clap::{Parser, ValueEnum};
use sqlx::PgPool;
use todo_elasticsearch::ElasticsearchIndex;
use todo_indexer::{ConsumerState, IndexApplier, Indexer, IndexerConfig};
use todo_postgres::OutboxBroker;
use todo_redis::RedisBroker;
use todo_sdk::{event::ALL_TOPICS, source::EventBroker};
use tracing::{error, info, warn};
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
enum Backend {
    Postgres,
    Redis,
}

/// Consumes task events and mirrors them into Elasticsearch.
#[derive(Debug, Parser)]
#[command(version, about)]
struct Args {
    /// Environment file loaded before the remaining flags are read.
    #[arg(long)]
    env: Option<PathBuf>,

    #[arg(long, env = "INDEXER_BACKEND", value_enum, default_value_t = Backend::Postgres)]
    backend: Backend,

    #[arg(long, env = "DATABASE_URL")]
    database_url: Option<String>,

    #[arg(long, env = "REDIS_URL")]
    redis_url: Option<String>,

    #[arg(long, env = "ELASTICSEARCH_URL", default_value = "http://localhost:9200")]
    elasticsearch_url: String,

    #[arg(long, env = "ELASTICSEARCH_INDEX", default_value = "tasks")]
    elasticsearch_index: String,

    /// Consumer group whose offset is committed (postgres backend).
    #[arg(long, env = "CONSUMER_GROUP", default_value = "elasticsearch-indexer")]
    consumer_group: String,

    #[arg(long, env = "TOPIC_PATTERN", default_value = ALL_TOPICS)]
    topic_pattern: String,

    #[arg(long, env = "POLL_INTERVAL_MS", default_value_t = 150)]
    poll_interval_ms: u64,

    #[arg(long, env = "SHUTDOWN_TIMEOUT_SECS", default_value_t = 10)]
    shutdown_timeout_secs: u64,
}

impl Args {
    fn indexer_config(&self) -> IndexerConfig {
        IndexerConfig::new()
            .topic_pattern(&self.topic_pattern)
            .poll_interval(Duration::from_millis(self.poll_interval_ms))
            .shutdown_timeout(Duration::from_secs(self.shutdown_timeout_secs))
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_env("LOG_LEVEL").unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let mut args = Args::parse();
    if let Some(path) = &args.env {
        dotenvy::from_path(path)
            .with_context(|| format!("failed to load env file {}", path.display()))?;
        args = Args::parse();
    }

    let index = ElasticsearchIndex::new(&args.elasticsearch_url, args.elasticsearch_index.as_str())
        .context("invalid elasticsearch url")?;
    let config = args.indexer_config();

    match args.backend {
        Backend::Postgres => {
            let Some(url) = &args.database_url else {
                bail!("DATABASE_URL is required for the postgres backend");
            };
            let pool = PgPool::connect(url)
                .await
                .context("failed to connect to postgres")?;
            todo_postgres::migrate(&pool)
                .await
                .context("failed to create outbox tables")?;

            let broker = OutboxBroker::new(pool, args.consumer_group.as_str());
            run(broker, index, config).await
        }
        Backend::Redis => {
            let Some(url) = &args.redis_url else {
                bail!("REDIS_URL is required for the redis backend");
            };
            let broker = RedisBroker::open(url).context("invalid redis url")?;

            run(broker, index, config).await
        }
    }
}

async fn run<B>(broker: B, index: ElasticsearchIndex, config: IndexerConfig) -> anyhow::Result<()>
where
    B: EventBroker,
{
    let shutdown_timeout = config.get_shutdown_timeout();
    let mut indexer = Indexer::new(broker, IndexApplier::new(index), config);
    indexer.start().await?;

    let mut state = indexer.state_changes();
    tokio::select! {
        signal = shutdown_signal() => {
            info!(signal, "received shutdown signal");
        }
        _ = state.wait_for(|state| *state == ConsumerState::Stopped) => {
            warn!("consumer stopped unexpectedly");
        }
    }

    match indexer.shutdown(shutdown_timeout).await {
        Ok(stats) => {
            info!(
                applied = stats.applied,
                ignored = stats.ignored,
                discarded = stats.discarded,
                failed = stats.failed,
                "indexer stopped"
            );
            Ok(())
        }
        Err(err) => {
            error!(error = %err, "indexer did not stop cleanly");
            Err(err.into())
        }
    }
}

#[cfg(unix)]
async fn shutdown_signal() -> &'static str {
    use tokio::signal::unix::{SignalKind, signal};

    let (Ok(mut terminate), Ok(mut quit)) = (
        signal(SignalKind::terminate()),
        signal(SignalKind::quit()),
    ) else {
        warn!("failed to install unix signal handlers, listening for ctrl-c only");
        let _ = tokio::signal::ctrl_c().await;
        return "SIGINT";
    };

    tokio::select! {
        _ = tokio::signal::ctrl_c() => "SIGINT",
        _ = terminate.recv() => "SIGTERM",
        _ = quit.recv() => "SIGQUIT",
    }
}

#[cfg(not(unix))]
async fn shutdown_signal() -> &'static str {
    let _ = tokio::signal::ctrl_c().await;
    "SIGINT"
}
