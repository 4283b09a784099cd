// Engine: feed routing, worker lifecycle, broker event pump
pub mod worker;

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{Duration, Instant, MissedTickBehavior};

use crate::broker::Broker;
use crate::config::EngineConfig;
use crate::db::PositionStore;
use crate::error::ExecutionError;
use crate::execution::{OrderCoordinator, ReconcileOutcome};
use crate::feed::MarketFeed;
use crate::models::BrokerEvent;
use crate::risk::RiskLimits;
use crate::strategy::BreakoutDetector;

pub use worker::{
    inbox, Delivery, InstrumentWorker, WorkerHandle, WorkerInbox, WorkerMessage, WorkerReport,
};

type Routes = Arc<HashMap<String, WorkerHandle>>;

/// Summary of one engine run
#[derive(Debug, Clone, Default)]
pub struct EngineReport {
    pub recovered: Vec<(String, ReconcileOutcome)>,
    pub ticks_routed: u64,
    pub ticks_unrouted: u64,
    /// Dropped because the instrument's worker was behind
    pub ticks_shed: u64,
    pub workers: Vec<WorkerReport>,
    /// Workers that did not finish within the shutdown grace period
    pub aborted: Vec<String>,
}

/// Owns the wiring between feed, workers and broker
pub struct Engine {
    config: EngineConfig,
    coordinator: Arc<OrderCoordinator>,
}

impl Engine {
    pub fn new(
        config: EngineConfig,
        store: Arc<dyn PositionStore>,
        broker: Arc<dyn Broker>,
    ) -> Self {
        let coordinator = Arc::new(OrderCoordinator::new(
            store,
            broker,
            config.execution.clone(),
            RiskLimits::new(config.risk.clone()),
            &config.instruments,
        ));
        Self {
            config,
            coordinator,
        }
    }

    pub fn coordinator(&self) -> &Arc<OrderCoordinator> {
        &self.coordinator
    }

    /// Recover, then trade until the feed ends or `shutdown` resolves
    ///
    /// Only a store failure during recovery is fatal. On shutdown the
    /// broker is polled one last time and every worker reconciles before
    /// its inbox closes.
    pub async fn run<F, S>(self, mut feed: F, shutdown: S) -> Result<EngineReport, ExecutionError>
    where
        F: MarketFeed,
        S: Future<Output = ()> + Send,
    {
        let mut report = EngineReport {
            recovered: self.coordinator.recover().await?,
            ..Default::default()
        };

        let mut senders = HashMap::new();
        let mut workers = Vec::with_capacity(self.config.instruments.len());
        for instrument in &self.config.instruments {
            let (tx, rx) = inbox(self.config.execution.worker_tick_capacity);
            senders.insert(instrument.id.clone(), tx);
            let worker = InstrumentWorker::new(
                instrument.clone(),
                BreakoutDetector::new(self.config.detector.clone()),
                self.coordinator.clone(),
                rx,
            );
            workers.push((instrument.id.clone(), tokio::spawn(worker.run())));
        }
        let routes: Routes = Arc::new(senders);

        let (stop_tx, stop_rx) = watch::channel(false);
        let pump = tokio::spawn(pump_broker_events(
            self.coordinator.broker().clone(),
            routes.clone(),
            self.config.execution.event_poll_interval(),
            stop_rx.clone(),
        ));
        let ticker = tokio::spawn(reconcile_ticker(
            routes.clone(),
            self.config.execution.reconcile_interval(),
            stop_rx,
        ));

        tracing::info!(
            instruments = self.config.instruments.len(),
            broker = self.coordinator.broker().name(),
            "Engine running"
        );

        tokio::pin!(shutdown);
        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    tracing::info!("Shutdown requested");
                    break;
                }
                tick = feed.next_tick() => {
                    let Some(tick) = tick else {
                        tracing::info!("Market feed ended");
                        break;
                    };
                    match routes.get(&tick.instrument) {
                        Some(tx) => {
                            let instrument = tick.instrument.clone();
                            match tx.send_tick(tick) {
                                Delivery::Queued => report.ticks_routed += 1,
                                Delivery::Shed => {
                                    report.ticks_shed += 1;
                                    tracing::debug!(instrument = %instrument, "Worker behind, tick shed");
                                }
                                Delivery::Closed => {
                                    tracing::warn!(instrument = %instrument, "Worker gone, tick dropped");
                                }
                            }
                        }
                        None => {
                            report.ticks_unrouted += 1;
                            tracing::debug!(instrument = %tick.instrument, "Tick for unconfigured instrument");
                        }
                    }
                }
            }
        }

        let _ = stop_tx.send(true);
        for handle in [pump, ticker] {
            if let Err(e) = handle.await {
                tracing::error!("Background task failed: {}", e);
            }
        }

        // Last chance to apply anything the broker reported before stopping
        match self.coordinator.broker().poll_events().await {
            Ok(events) => route_events(&routes, events),
            Err(e) => tracing::warn!("Final broker event poll failed: {}", e),
        }
        for tx in routes.values() {
            tx.request_reconcile();
        }
        drop(routes);

        let deadline = Instant::now() + self.config.execution.shutdown_grace();
        for (instrument, handle) in workers {
            let (worker_report, aborted) = join_worker(handle, deadline).await;
            if let Some(worker_report) = worker_report {
                report.workers.push(worker_report);
            }
            if aborted {
                report.aborted.push(instrument);
            }
        }

        tracing::info!(
            ticks = report.ticks_routed,
            shed = report.ticks_shed,
            workers = report.workers.len(),
            aborted = report.aborted.len(),
            "Engine stopped"
        );
        Ok(report)
    }
}

async fn join_worker(
    mut handle: JoinHandle<WorkerReport>,
    deadline: Instant,
) -> (Option<WorkerReport>, bool) {
    match tokio::time::timeout_at(deadline, &mut handle).await {
        Ok(Ok(report)) => (Some(report), false),
        Ok(Err(e)) => {
            tracing::error!("Worker task failed: {}", e);
            (None, true)
        }
        Err(_) => {
            handle.abort();
            tracing::error!("Worker did not stop within the grace period; aborted");
            (None, true)
        }
    }
}

fn route_events(routes: &HashMap<String, WorkerHandle>, events: Vec<BrokerEvent>) {
    for event in events {
        match routes.get(&event.instrument) {
            Some(tx) => {
                if !tx.send_event(event) {
                    tracing::warn!("Worker inbox closed; broker event left for reconciliation");
                }
            }
            None => {
                tracing::warn!(
                    instrument = %event.instrument,
                    order_id = %event.order_id,
                    "Broker event for unconfigured instrument"
                );
            }
        }
    }
}

async fn pump_broker_events(
    broker: Arc<dyn Broker>,
    routes: Routes,
    every: Duration,
    mut stop: watch::Receiver<bool>,
) {
    let mut interval = tokio::time::interval(every);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = stop.changed() => break,
            _ = interval.tick() => {
                match broker.poll_events().await {
                    Ok(events) => route_events(&routes, events),
                    Err(e) => tracing::warn!(broker = broker.name(), "Broker event poll failed: {}", e),
                }
            }
        }
    }
}

async fn reconcile_ticker(routes: Routes, every: Duration, mut stop: watch::Receiver<bool>) {
    let mut interval = tokio::time::interval(every);
    interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
    interval.tick().await; // First tick is immediate; recovery just ran

    loop {
        tokio::select! {
            _ = stop.changed() => break,
            _ = interval.tick() => {
                for (instrument, tx) in routes.iter() {
                    if !tx.request_reconcile() {
                        tracing::warn!(instrument = %instrument, "Worker gone, skipping reconcile");
                    }
                }
            }
        }
    }
}
