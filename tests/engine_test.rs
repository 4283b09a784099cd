use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use breakout_bot::broker::{Broker, FillMode, OrderRequest, OrderSnapshot, PaperBroker};
use breakout_bot::config::DetectorConfig;
use breakout_bot::db::{InMemoryStore, PositionStore};
use breakout_bot::feed::{ChannelSource, FeedAdapter, RawTick, TickSource};
use breakout_bot::*;
use chrono::Utc;
use tokio::sync::{oneshot, watch};
use uuid::Uuid;

const BTC: &str = "BTC/USDT";
const ETH: &str = "ETH/USDT";

/// Recent enough that signals pass the age check
fn t0_ms() -> i64 {
    Utc::now().timestamp_millis() - 30_000
}

fn config() -> EngineConfig {
    EngineConfig {
        detector: DetectorConfig {
            lookback: 5,
            ..Default::default()
        },
        instruments: vec![
            Instrument {
                id: BTC.to_string(),
                tick_size: 0.01,
                min_order_size: 0.0001,
            },
            Instrument {
                id: ETH.to_string(),
                tick_size: 0.01,
                min_order_size: 0.001,
            },
        ],
        ..Default::default()
    }
}

fn raw(instrument: &str, at_ms: i64, price: f64, volume: f64) -> RawTick {
    RawTick {
        instrument: instrument.to_string(),
        timestamp_ms: at_ms,
        price,
        volume,
    }
}

#[tokio::test]
async fn test_breakout_entry_and_take_profit_exit() {
    let _ = tracing_subscriber::fmt::try_init();

    let config = config();
    let store = Arc::new(InMemoryStore::new());
    let broker = Arc::new(PaperBroker::new(FillMode::Immediate));

    let t0 = t0_ms();
    let (tx, source) = ChannelSource::new("test", 64);
    let feed = FeedAdapter::spawn(
        vec![Box::new(source) as Box<dyn TickSource>],
        &config.instruments,
        64,
    );

    for i in 0..5 {
        tx.send(raw(BTC, t0 + i * 1000, 50_000.0, 1.0)).await.unwrap();
        tx.send(raw(ETH, t0 + i * 1000, 3_000.0, 10.0)).await.unwrap();
    }
    // Breakout on volume, then a print through the first target (50500 * 1.05)
    tx.send(raw(BTC, t0 + 5000, 50_500.0, 10.0)).await.unwrap();
    tx.send(raw(ETH, t0 + 5000, 3_001.0, 10.0)).await.unwrap();
    tx.send(raw(BTC, t0 + 6000, 53_100.0, 1.0)).await.unwrap();
    // Unknown instruments are dropped by the adapter
    tx.send(raw("XRP/USDT", t0 + 6000, 0.5, 1.0)).await.unwrap();
    drop(tx);

    let engine = Engine::new(config, store.clone(), broker.clone());
    let report = engine
        .run(feed, std::future::pending::<()>())
        .await
        .unwrap();

    assert_eq!(report.ticks_routed, 13);
    assert_eq!(report.workers.len(), 2);
    assert!(report.aborted.is_empty());
    let btc_report = report.workers.iter().find(|w| w.instrument == BTC).unwrap();
    assert_eq!(btc_report.signals, 1);
    assert_eq!(btc_report.errors, 0);

    // First target sells 30% of 0.0019, rounded down to the lot size
    let position = store.get(BTC).await.unwrap();
    assert_eq!(position.state, PositionState::Open);
    assert_eq!(position.targets_hit, 1);
    assert!((position.quantity - 0.0014).abs() < 1e-9);

    let trades = store.closed_trades(BTC).await.unwrap();
    assert_eq!(trades.len(), 1);
    assert_eq!(trades[0].direction, Direction::Long);
    assert_eq!(trades[0].exit_reason, ExitReason::TakeProfit);
    assert!((trades[0].quantity - 0.0005).abs() < 1e-9);
    assert!(trades[0].realized_pnl > 0.0);

    assert!(store.get(ETH).await.unwrap().is_flat());
    assert!(store.order_history(ETH).await.unwrap().is_empty());
    assert_eq!(broker.orders().await.len(), 2);
}

#[tokio::test]
async fn test_shutdown_signal_stops_engine() {
    let config = config();
    let store = Arc::new(InMemoryStore::new());
    let broker = Arc::new(PaperBroker::default());

    // Sender stays alive: only the shutdown future can end the run
    let (_tx, source) = ChannelSource::new("idle", 8);
    let feed = FeedAdapter::spawn(
        vec![Box::new(source) as Box<dyn TickSource>],
        &config.instruments,
        8,
    );

    let engine = Engine::new(config, store, broker);
    let report = engine
        .run(feed, tokio::time::sleep(std::time::Duration::from_millis(50)))
        .await
        .unwrap();

    assert_eq!(report.ticks_routed, 0);
    assert_eq!(report.workers.len(), 2);
}

/// Paper broker whose submissions for one instrument wait on a gate
struct GatedBroker {
    inner: PaperBroker,
    gated_instrument: String,
    gate: watch::Receiver<bool>,
}

#[async_trait]
impl Broker for GatedBroker {
    async fn submit_order(
        &self,
        request: &OrderRequest,
    ) -> std::result::Result<OrderSnapshot, BrokerError> {
        if request.instrument == self.gated_instrument {
            let mut gate = self.gate.clone();
            let _ = gate.wait_for(|open| *open).await;
        }
        self.inner.submit_order(request).await
    }

    async fn cancel_order(
        &self,
        client_order_id: Uuid,
        instrument: &str,
    ) -> std::result::Result<(), BrokerError> {
        self.inner.cancel_order(client_order_id, instrument).await
    }

    async fn fetch_order_status(
        &self,
        client_order_id: Uuid,
        instrument: &str,
    ) -> std::result::Result<OrderSnapshot, BrokerError> {
        self.inner.fetch_order_status(client_order_id, instrument).await
    }

    async fn poll_events(&self) -> std::result::Result<Vec<BrokerEvent>, BrokerError> {
        self.inner.poll_events().await
    }

    fn name(&self) -> &str {
        "gated-paper"
    }
}

async fn wait_until_open(store: &InMemoryStore, instrument: &str) -> bool {
    tokio::time::timeout(Duration::from_secs(2), async {
        loop {
            if store.get(instrument).await.unwrap().state == PositionState::Open {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .is_ok()
}

#[tokio::test]
async fn test_hung_broker_call_does_not_stall_other_instruments() {
    let _ = tracing_subscriber::fmt::try_init();

    let mut config = config();
    config.execution.broker_timeout_ms = 30_000;
    config.execution.worker_tick_capacity = 8;

    let store = Arc::new(InMemoryStore::new());
    let (gate_tx, gate_rx) = watch::channel(false);
    let broker = Arc::new(GatedBroker {
        inner: PaperBroker::new(FillMode::Immediate),
        gated_instrument: BTC.to_string(),
        gate: gate_rx,
    });

    let t0 = t0_ms();
    let (tx, source) = ChannelSource::new("test", 512);
    let feed = FeedAdapter::spawn(
        vec![Box::new(source) as Box<dyn TickSource>],
        &config.instruments,
        512,
    );

    let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
    let engine = Engine::new(config, store.clone(), broker.clone());
    let run = engine.run(feed, async {
        let _ = shutdown_rx.await;
    });

    let drive = async {
        for i in 0..5 {
            tx.send(raw(BTC, t0 + i * 1000, 50_000.0, 1.0)).await.unwrap();
            tx.send(raw(ETH, t0 + i * 1000, 3_000.0, 10.0)).await.unwrap();
        }
        // BTC breaks out and its entry hangs at the broker; its lane backs up
        tx.send(raw(BTC, t0 + 5000, 50_500.0, 10.0)).await.unwrap();
        for i in 1..=200 {
            tx.send(raw(BTC, t0 + 5000 + i, 50_450.0, 1.0)).await.unwrap();
        }
        tx.send(raw(ETH, t0 + 5000, 3_100.0, 100.0)).await.unwrap();

        let eth_open = wait_until_open(&store, ETH).await;
        let only_eth_submitted = broker.inner.orders().await.iter().all(|o| o.instrument == ETH);

        gate_tx.send(true).unwrap();
        let btc_open = wait_until_open(&store, BTC).await;

        shutdown_tx.send(()).unwrap();
        (eth_open, only_eth_submitted, btc_open)
    };

    let (report, (eth_open, only_eth_submitted, btc_open)) = tokio::join!(run, drive);
    let report = report.unwrap();

    assert!(eth_open, "ETH entry stalled behind BTC");
    assert!(only_eth_submitted);
    assert!(btc_open);
    assert!(report.ticks_shed > 0);
    assert!(report.aborted.is_empty());
    assert_eq!(broker.inner.orders().await.len(), 2);
    let btc_report = report.workers.iter().find(|w| w.instrument == BTC).unwrap();
    assert_eq!(btc_report.signals, 1);
}
