use std::collections::{HashMap, VecDeque};

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Client};
use serde::Deserialize;
use tokio::time::{timeout, Duration};

use super::{RawTick, TickSource};

const MAX_BATCH: isize = 1000;

/// Tick as stored by the market data collector
#[derive(Debug, Clone, Deserialize)]
struct StoredTick {
    price: f64,
    #[serde(default)]
    volume: f64,
    timestamp_ms: i64,
}

/// Polls per-instrument sorted sets written by an external collector
///
/// Key layout: `ticks:{instrument}`, member = JSON tick, score = timestamp in
/// milliseconds. The first read of a key replays only its newest `warmup`
/// members; after that only members newer than the last seen score are read,
/// at most `MAX_BATCH` per poll.
pub struct RedisSource {
    conn: ConnectionManager,
    instruments: Vec<String>,
    warmup: usize,
    last_scores: HashMap<String, i64>,
    pending: VecDeque<RawTick>,
    poll_interval: Duration,
}

impl RedisSource {
    pub async fn connect(
        redis_url: &str,
        instruments: Vec<String>,
        warmup: usize,
        poll_interval: Duration,
    ) -> crate::Result<Self> {
        let client = Client::open(redis_url)?;

        let conn = timeout(Duration::from_secs(5), ConnectionManager::new(client))
            .await
            .map_err(|_| "Redis connection timeout after 5 seconds")??;

        tracing::info!("Connected to Redis feed at {}", redis_url);

        Ok(Self {
            conn,
            instruments,
            warmup,
            last_scores: HashMap::new(),
            pending: VecDeque::new(),
            poll_interval,
        })
    }

    pub fn key(instrument: &str) -> String {
        format!("ticks:{}", instrument)
    }

    async fn poll_once(&mut self) -> crate::Result<()> {
        for instrument in &self.instruments {
            let key = Self::key(instrument);

            let cursor = self.last_scores.get(instrument).copied();
            let (members, skip): (Vec<(String, f64)>, usize) = match cursor {
                Some(score) => {
                    let min = format!("({}", score);
                    let members = self
                        .conn
                        .zrangebyscore_limit_withscores(&key, min, "+inf", 0, MAX_BATCH)
                        .await?;
                    (members, 0)
                }
                None => {
                    // Newest first; one member is enough to seed the cursor
                    let take = self.warmup.max(1);
                    let mut newest: Vec<(String, f64)> = self
                        .conn
                        .zrevrangebyscore_limit_withscores(&key, "+inf", "-inf", 0, take as isize)
                        .await?;
                    newest.reverse();
                    let skip = newest.len().saturating_sub(self.warmup);
                    if !newest.is_empty() {
                        tracing::info!(
                            instrument = %instrument,
                            warmup = newest.len() - skip,
                            "Redis feed warm-up"
                        );
                    }
                    (newest, skip)
                }
            };

            ingest(
                instrument,
                members,
                skip,
                &mut self.last_scores,
                &mut self.pending,
            );
        }
        Ok(())
    }
}

/// Queue members in score order, skipping the first `skip`
///
/// The cursor advances past every member read, malformed or skipped, so
/// nothing is read twice.
fn ingest(
    instrument: &str,
    members: Vec<(String, f64)>,
    skip: usize,
    last_scores: &mut HashMap<String, i64>,
    pending: &mut VecDeque<RawTick>,
) {
    for (i, (json, score)) in members.into_iter().enumerate() {
        last_scores.insert(instrument.to_string(), score as i64);
        if i < skip {
            continue;
        }
        let stored: StoredTick = match serde_json::from_str(&json) {
            Ok(t) => t,
            Err(e) => {
                tracing::warn!(instrument = %instrument, "Skipping malformed tick in Redis: {}", e);
                continue;
            }
        };
        pending.push_back(RawTick {
            instrument: instrument.to_string(),
            timestamp_ms: stored.timestamp_ms,
            price: stored.price,
            volume: stored.volume,
        });
    }
}

#[async_trait]
impl TickSource for RedisSource {
    async fn next_raw(&mut self) -> crate::Result<Option<RawTick>> {
        loop {
            if let Some(raw) = self.pending.pop_front() {
                return Ok(Some(raw));
            }
            self.poll_once().await?;
            if self.pending.is_empty() {
                tokio::time::sleep(self.poll_interval).await;
            }
        }
    }

    fn name(&self) -> &str {
        "redis"
    }
}
