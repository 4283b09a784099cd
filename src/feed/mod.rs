// Market feed adapters
pub mod channel;
pub mod redis;

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::DateTime;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Duration;

use crate::error::FeedError;
use crate::models::{Instrument, Tick};

pub use channel::{ChannelSource, JsonLinesSource};
pub use redis::RedisSource;

const SOURCE_ERROR_BACKOFF: Duration = Duration::from_secs(1);

/// Tick as delivered by an external source, before validation
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RawTick {
    #[serde(alias = "symbol")]
    pub instrument: String,
    #[serde(alias = "ts", alias = "timestamp")]
    pub timestamp_ms: i64,
    pub price: f64,
    #[serde(alias = "qty", alias = "size", default)]
    pub volume: f64,
}

/// One external source of raw ticks
#[async_trait]
pub trait TickSource: Send {
    /// Next raw tick; `Ok(None)` when the source is exhausted
    async fn next_raw(&mut self) -> crate::Result<Option<RawTick>>;

    fn name(&self) -> &str;
}

/// Canonical tick stream consumed by the engine
#[async_trait]
pub trait MarketFeed: Send {
    /// Next canonical tick; `None` once every source has ended
    async fn next_tick(&mut self) -> Option<Tick>;
}

/// Validate a raw tick and snap its price to the instrument's tick size
pub fn normalize(
    raw: RawTick,
    instruments: &HashMap<String, Instrument>,
) -> Result<Tick, FeedError> {
    let instrument = instruments
        .get(&raw.instrument)
        .ok_or_else(|| FeedError::UnknownInstrument(raw.instrument.clone()))?;

    if !raw.price.is_finite() || raw.price <= 0.0 {
        return Err(FeedError::InvalidPrice {
            instrument: raw.instrument,
            price: raw.price,
        });
    }
    if !raw.volume.is_finite() || raw.volume < 0.0 {
        return Err(FeedError::InvalidVolume {
            instrument: raw.instrument,
            volume: raw.volume,
        });
    }
    let timestamp = DateTime::from_timestamp_millis(raw.timestamp_ms)
        .ok_or(FeedError::InvalidTimestamp(raw.timestamp_ms))?;

    Ok(Tick {
        price: instrument.round_price(raw.price),
        instrument: raw.instrument,
        timestamp,
        volume: raw.volume,
    })
}

/// Merges any number of sources into one normalised tick stream
///
/// Each source runs in its own task. Invalid ticks are logged and dropped;
/// ordering across sources is not guaranteed, the detector drops stale ticks.
pub struct FeedAdapter {
    rx: mpsc::Receiver<Tick>,
    handles: Vec<JoinHandle<()>>,
}

impl FeedAdapter {
    pub fn spawn(
        sources: Vec<Box<dyn TickSource>>,
        instruments: &[Instrument],
        buffer: usize,
    ) -> Self {
        let (tx, rx) = mpsc::channel(buffer.max(1));
        let instruments: Arc<HashMap<String, Instrument>> = Arc::new(
            instruments
                .iter()
                .map(|i| (i.id.clone(), i.clone()))
                .collect(),
        );

        let handles = sources
            .into_iter()
            .map(|source| {
                let tx = tx.clone();
                let instruments = instruments.clone();
                tokio::spawn(pump_source(source, instruments, tx))
            })
            .collect();

        Self { rx, handles }
    }

    /// Stop every source task
    pub fn abort(&self) {
        for handle in &self.handles {
            handle.abort();
        }
    }
}

#[async_trait]
impl MarketFeed for FeedAdapter {
    async fn next_tick(&mut self) -> Option<Tick> {
        self.rx.recv().await
    }
}

impl Drop for FeedAdapter {
    fn drop(&mut self) {
        self.abort();
    }
}

async fn pump_source(
    mut source: Box<dyn TickSource>,
    instruments: Arc<HashMap<String, Instrument>>,
    tx: mpsc::Sender<Tick>,
) {
    tracing::info!(source = source.name(), "Feed source started");

    loop {
        match source.next_raw().await {
            Ok(Some(raw)) => match normalize(raw, &instruments) {
                Ok(tick) => {
                    if tx.send(tick).await.is_err() {
                        break; // Engine stopped listening
                    }
                }
                Err(e) => {
                    tracing::warn!(source = source.name(), "Dropping invalid tick: {}", e);
                }
            },
            Ok(None) => {
                tracing::info!(source = source.name(), "Feed source exhausted");
                break;
            }
            Err(e) => {
                tracing::error!(source = source.name(), "Feed source error: {}", e);
                tokio::time::sleep(SOURCE_ERROR_BACKOFF).await;
            }
        }
    }
}
