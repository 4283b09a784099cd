use std::sync::Arc;

use anyhow::Context;
use breakout_bot::broker::{Broker, FillMode, PaperBroker, RestBroker};
use breakout_bot::config::{BrokerKind, EngineConfig, FeedKind, StoreKind};
use breakout_bot::db::{InMemoryStore, PositionStore, PostgresStore};
use breakout_bot::engine::Engine;
use breakout_bot::feed::{FeedAdapter, JsonLinesSource, RedisSource, TickSource};
use clap::Parser;
use tokio::io::BufReader;
use tokio::time::Duration;
use tracing_subscriber::EnvFilter;

const FEED_BUFFER: usize = 4096;

#[derive(Parser, Debug)]
#[command(name = "breakout-bot", about = "Breakout detection and order execution engine")]
struct Args {
    /// Config file (TOML); env vars prefixed BREAKOUT__ override it
    #[arg(short, long, default_value = "breakout.toml", env = "BREAKOUT_CONFIG")]
    config: String,

    /// Emit logs as JSON lines
    #[arg(long)]
    log_json: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let args = Args::parse();
    setup_logging(args.log_json);

    let config = match EngineConfig::load(&args.config) {
        Ok(config) => config,
        Err(e) => {
            tracing::error!("Invalid configuration: {}", e);
            std::process::exit(2);
        }
    };

    tracing::info!(
        instruments = config.instruments.len(),
        store = ?config.store.kind,
        broker = ?config.broker.kind,
        feed = ?config.feed.kind,
        "Breakout bot starting"
    );

    let store = build_store(&config).await?;
    let broker = build_broker(&config)?;
    let feed = build_feed(&config).await?;

    let engine = Engine::new(config, store, broker);
    let shutdown = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("Failed to listen for ctrl-c: {}", e);
            std::future::pending::<()>().await;
        }
    };

    let report = engine.run(feed, shutdown).await?;

    for worker in &report.workers {
        tracing::info!(
            instrument = %worker.instrument,
            ticks = worker.ticks,
            dropped = worker.dropped_ticks,
            signals = worker.signals,
            errors = worker.errors,
            suspended = worker.suspended,
            "Worker summary"
        );
    }
    if !report.aborted.is_empty() {
        tracing::warn!("Workers aborted at shutdown: {:?}", report.aborted);
    }
    Ok(())
}

fn setup_logging(json: bool) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("breakout_bot=info"));

    if json {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .json()
            .init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}

async fn build_store(config: &EngineConfig) -> anyhow::Result<Arc<dyn PositionStore>> {
    match config.store.kind {
        StoreKind::Memory => {
            tracing::warn!("Using in-memory store; positions will not survive a restart");
            Ok(Arc::new(InMemoryStore::new()))
        }
        StoreKind::Postgres => {
            let url = config
                .store
                .database_url
                .as_deref()
                .context("store.database_url is required for postgres")?;
            let store = PostgresStore::connect(url, config.store.max_connections)
                .await
                .context("Failed to connect to Postgres")?;
            Ok(Arc::new(store))
        }
    }
}

fn build_broker(config: &EngineConfig) -> anyhow::Result<Arc<dyn Broker>> {
    match config.broker.kind {
        BrokerKind::Paper => Ok(Arc::new(PaperBroker::new(FillMode::Immediate))),
        BrokerKind::Rest => {
            let broker = RestBroker::new(&config.broker, config.execution.broker_timeout())?;
            Ok(Arc::new(broker))
        }
    }
}

async fn build_feed(config: &EngineConfig) -> anyhow::Result<FeedAdapter> {
    let source: Box<dyn TickSource> = match config.feed.kind {
        FeedKind::Redis => {
            let instruments = config.instruments.iter().map(|i| i.id.clone()).collect();
            let source = RedisSource::connect(
                &config.feed.redis_url,
                instruments,
                config.detector.lookback,
                Duration::from_millis(config.feed.poll_interval_ms),
            )
            .await
            .map_err(|e| anyhow::anyhow!("Failed to connect to Redis feed: {}", e))?;
            Box::new(source)
        }
        FeedKind::Stdin => Box::new(JsonLinesSource::new(
            "stdin",
            BufReader::new(tokio::io::stdin()),
        )),
    };

    Ok(FeedAdapter::spawn(
        vec![source],
        &config.instruments,
        FEED_BUFFER,
    ))
}
