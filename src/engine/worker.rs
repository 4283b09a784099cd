use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::time::{Duration, Instant};

use crate::error::ExecutionError;
use crate::execution::OrderCoordinator;
use crate::models::{BrokerEvent, Instrument, Position, Tick};
use crate::strategy::{BreakoutDetector, Detector};

const RESUME_CHECK_INTERVAL: Duration = Duration::from_secs(1);

/// Everything an instrument worker reacts to, in arrival order
#[derive(Debug, Clone)]
pub enum WorkerMessage {
    Tick(Tick),
    BrokerEvent(BrokerEvent),
    Reconcile,
}

/// What happened to a tick handed to a worker
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    Queued,
    /// Tick lane full; the worker is behind and the tick was dropped
    Shed,
    Closed,
}

/// Sending side of a worker's inbox
///
/// Ticks travel on a bounded lane and are shed when the worker falls behind,
/// so one slow instrument never blocks the router. Broker events and
/// reconcile requests travel on an unbounded lane and are never dropped; at
/// most one reconcile request is queued at a time.
#[derive(Debug, Clone)]
pub struct WorkerHandle {
    ticks: mpsc::Sender<Tick>,
    control: mpsc::UnboundedSender<WorkerMessage>,
    reconcile_queued: Arc<AtomicBool>,
}

impl WorkerHandle {
    pub fn send_tick(&self, tick: Tick) -> Delivery {
        match self.ticks.try_send(tick) {
            Ok(()) => Delivery::Queued,
            Err(TrySendError::Full(_)) => Delivery::Shed,
            Err(TrySendError::Closed(_)) => Delivery::Closed,
        }
    }

    /// False once the worker has stopped
    pub fn send_event(&self, event: BrokerEvent) -> bool {
        self.control.send(WorkerMessage::BrokerEvent(event)).is_ok()
    }

    /// Queue a reconcile unless one is already waiting; false once the worker has stopped
    pub fn request_reconcile(&self) -> bool {
        if self.reconcile_queued.swap(true, Ordering::AcqRel) {
            return !self.control.is_closed();
        }
        if self.control.send(WorkerMessage::Reconcile).is_err() {
            self.reconcile_queued.store(false, Ordering::Release);
            return false;
        }
        true
    }
}

/// Receiving side of a worker's inbox; control messages are served first
#[derive(Debug)]
pub struct WorkerInbox {
    ticks: mpsc::Receiver<Tick>,
    control: mpsc::UnboundedReceiver<WorkerMessage>,
    reconcile_queued: Arc<AtomicBool>,
    ticks_open: bool,
    control_open: bool,
}

impl WorkerInbox {
    /// Next message, or `None` once every handle is dropped and both lanes are drained
    pub async fn recv(&mut self) -> Option<WorkerMessage> {
        loop {
            tokio::select! {
                biased;
                message = self.control.recv(), if self.control_open => match message {
                    Some(WorkerMessage::Reconcile) => {
                        self.reconcile_queued.store(false, Ordering::Release);
                        return Some(WorkerMessage::Reconcile);
                    }
                    Some(message) => return Some(message),
                    None => self.control_open = false,
                },
                tick = self.ticks.recv(), if self.ticks_open => match tick {
                    Some(tick) => return Some(WorkerMessage::Tick(tick)),
                    None => self.ticks_open = false,
                },
                else => return None,
            }
        }
    }
}

/// Inbox for one worker with room for `tick_capacity` queued ticks
pub fn inbox(tick_capacity: usize) -> (WorkerHandle, WorkerInbox) {
    let (tick_tx, tick_rx) = mpsc::channel(tick_capacity.max(1));
    let (control_tx, control_rx) = mpsc::unbounded_channel();
    let reconcile_queued = Arc::new(AtomicBool::new(false));
    (
        WorkerHandle {
            ticks: tick_tx,
            control: control_tx,
            reconcile_queued: reconcile_queued.clone(),
        },
        WorkerInbox {
            ticks: tick_rx,
            control: control_rx,
            reconcile_queued,
            ticks_open: true,
            control_open: true,
        },
    )
}

/// Counters returned when a worker stops
#[derive(Debug, Clone, Default, PartialEq)]
pub struct WorkerReport {
    pub instrument: String,
    pub ticks: u64,
    pub dropped_ticks: u64,
    pub signals: u64,
    pub errors: u64,
    pub suspended: bool,
}

/// Sole owner of one instrument's detector state
///
/// Messages are handled one at a time, so a signal is never looked at until
/// the previous order's outcome is persisted. A store failure suspends
/// trading: signals are dropped, broker events are buffered, and the worker
/// pings the store until it answers again.
pub struct InstrumentWorker {
    instrument: Instrument,
    detector: BreakoutDetector,
    coordinator: Arc<OrderCoordinator>,
    inbox: WorkerInbox,
    position: Option<Position>,
    suspended: bool,
    last_check: Option<Instant>,
    buffered_events: VecDeque<BrokerEvent>,
    report: WorkerReport,
}

impl InstrumentWorker {
    pub fn new(
        instrument: Instrument,
        detector: BreakoutDetector,
        coordinator: Arc<OrderCoordinator>,
        inbox: WorkerInbox,
    ) -> Self {
        let report = WorkerReport {
            instrument: instrument.id.clone(),
            ..Default::default()
        };
        Self {
            instrument,
            detector,
            coordinator,
            inbox,
            position: None,
            suspended: false,
            last_check: None,
            buffered_events: VecDeque::new(),
            report,
        }
    }

    /// Process messages until every sender is gone
    pub async fn run(mut self) -> WorkerReport {
        tracing::info!(instrument = %self.instrument.id, "Worker started");
        self.refresh_position().await;

        while let Some(message) = self.inbox.recv().await {
            self.handle(message).await;
        }

        self.report.dropped_ticks = self
            .detector
            .state(&self.instrument.id)
            .map(|s| s.dropped_ticks())
            .unwrap_or(0);
        self.report.suspended = self.suspended;
        if !self.buffered_events.is_empty() {
            tracing::error!(
                instrument = %self.instrument.id,
                pending = self.buffered_events.len(),
                "Worker stopped with unapplied broker events; reconciliation will pick them up"
            );
        }
        tracing::info!(
            instrument = %self.instrument.id,
            ticks = self.report.ticks,
            signals = self.report.signals,
            errors = self.report.errors,
            "Worker stopped"
        );
        self.report
    }

    async fn handle(&mut self, message: WorkerMessage) {
        if self.suspended {
            self.try_resume(false).await;
        }

        match message {
            WorkerMessage::Tick(tick) => self.on_tick(tick).await,
            WorkerMessage::BrokerEvent(event) => {
                if self.suspended {
                    self.buffered_events.push_back(event);
                    return;
                }
                let result = self.coordinator.on_broker_event(&event).await;
                self.settle(result).await;
            }
            WorkerMessage::Reconcile => {
                if self.suspended {
                    self.try_resume(true).await;
                    return;
                }
                let result = self.coordinator.reconcile(&self.instrument.id).await;
                self.settle(result).await;
            }
        }
    }

    async fn on_tick(&mut self, tick: Tick) {
        self.report.ticks += 1;
        // Detector keeps evaluating while suspended so the window stays warm
        let signal = self.detector.evaluate(&self.instrument.id, &tick);

        if self.suspended {
            if let Some(signal) = signal {
                tracing::warn!(
                    instrument = %self.instrument.id,
                    direction = signal.direction.as_str(),
                    "Signal dropped: trading suspended until the store is reachable"
                );
            }
            return;
        }

        // Cached position pre-screens; the coordinator re-reads before acting
        let (trails, exits) = match &self.position {
            Some(position) => {
                let risk = self.coordinator.risk();
                (
                    risk.trail(&self.instrument, position, tick.price).is_some(),
                    risk.protective_exit(&self.instrument, position, tick.price).is_some(),
                )
            }
            None => (false, false),
        };
        if trails {
            let result = self.coordinator.raise_trailing_stop(&tick).await;
            self.settle(result).await;
        }
        if exits && !self.suspended {
            let result = self.coordinator.check_protective_exit(&tick).await;
            self.settle(result).await;
        }

        if let Some(signal) = signal {
            self.report.signals += 1;
            tracing::info!(
                instrument = %self.instrument.id,
                direction = signal.direction.as_str(),
                trigger = signal.trigger_price,
                strength = signal.strength,
                "Breakout signal"
            );
            let result = self.coordinator.on_signal(&signal).await;
            self.settle(result).await;
        }
    }

    /// Log the outcome of a coordinator call and refresh the cached position
    async fn settle<T: std::fmt::Debug>(&mut self, result: Result<T, ExecutionError>) {
        match result {
            Ok(outcome) => {
                tracing::debug!(instrument = %self.instrument.id, outcome = ?outcome, "Handled");
            }
            Err(e) if e.is_store_failure() => {
                self.report.errors += 1;
                self.suspend(&e);
                return;
            }
            Err(e) => {
                self.report.errors += 1;
                tracing::error!(instrument = %self.instrument.id, "Execution error: {}", e);
            }
        }
        self.refresh_position().await;
    }

    async fn refresh_position(&mut self) {
        match self.coordinator.store().get(&self.instrument.id).await {
            Ok(position) => self.position = Some(position),
            Err(e) => {
                self.position = None;
                self.suspend(&e);
            }
        }
    }

    fn suspend(&mut self, error: &dyn std::error::Error) {
        if !self.suspended {
            tracing::error!(
                instrument = %self.instrument.id,
                "Store failure, suspending trading: {}",
                error
            );
        }
        self.suspended = true;
        self.last_check = Some(Instant::now());
    }

    /// Ping the store; on success replay buffered events and reconcile
    async fn try_resume(&mut self, force: bool) {
        let due = self
            .last_check
            .map_or(true, |at| at.elapsed() >= RESUME_CHECK_INTERVAL);
        if !force && !due {
            return;
        }
        self.last_check = Some(Instant::now());

        if let Err(e) = self.coordinator.store().ping().await {
            tracing::debug!(instrument = %self.instrument.id, "Store still unavailable: {}", e);
            return;
        }

        tracing::info!(
            instrument = %self.instrument.id,
            buffered = self.buffered_events.len(),
            "Store reachable again, resuming trading"
        );
        self.suspended = false;

        while let Some(event) = self.buffered_events.pop_front() {
            if let Err(e) = self.coordinator.on_broker_event(&event).await {
                if e.is_store_failure() {
                    self.buffered_events.push_front(event);
                    self.suspend(&e);
                    return;
                }
                tracing::error!(instrument = %self.instrument.id, "Buffered event failed: {}", e);
            }
        }

        let result = self.coordinator.reconcile(&self.instrument.id).await;
        self.settle(result).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::{Broker, FillMode, PaperBroker};
    use crate::config::{DetectorConfig, ExecutionConfig, RiskConfig};
    use crate::db::{InMemoryStore, PositionStore};
    use crate::execution::SignalOutcome;
    use crate::models::{Direction, PositionState, Signal};
    use crate::risk::RiskLimits;
    use chrono::Utc;

    fn instrument() -> Instrument {
        Instrument {
            id: "DOGE/USDT".to_string(),
            tick_size: 0.0001,
            min_order_size: 1.0,
        }
    }

    #[tokio::test]
    async fn test_store_outage_buffers_events_until_resume() {
        let store = Arc::new(InMemoryStore::new());
        let broker = Arc::new(PaperBroker::new(FillMode::Manual));
        let coordinator = Arc::new(OrderCoordinator::new(
            store.clone(),
            broker.clone(),
            ExecutionConfig::default(),
            RiskLimits::new(RiskConfig::default()),
            &[instrument()],
        ));

        let signal = Signal {
            instrument: "DOGE/USDT".to_string(),
            direction: Direction::Long,
            trigger_price: 1.0,
            strength: 0.5,
            generated_at: Utc::now(),
        };
        let SignalOutcome::Submitted { order_id, .. } = coordinator.on_signal(&signal).await.unwrap()
        else {
            panic!("entry not submitted");
        };
        broker.fill(order_id, 100.0, 1.0).await.unwrap();
        let events = broker.poll_events().await.unwrap();

        store.set_available(false);
        let (tx, rx) = inbox(16);
        let worker = InstrumentWorker::new(
            instrument(),
            BreakoutDetector::new(DetectorConfig::default()),
            coordinator,
            rx,
        );
        let handle = tokio::spawn(worker.run());

        for event in events {
            assert!(tx.send_event(event));
        }
        // Current-thread runtime: let the worker drain its inbox while the store is down
        for _ in 0..5 {
            tokio::task::yield_now().await;
        }
        assert!(store.get("DOGE/USDT").await.is_err());

        store.set_available(true);
        assert!(tx.request_reconcile());
        drop(tx);
        let report = handle.await.unwrap();

        assert!(!report.suspended);
        let position = store.get("DOGE/USDT").await.unwrap();
        assert_eq!(position.state, PositionState::Open);
        assert_eq!(position.quantity, 100.0);
    }

    fn tick(second: i64) -> Tick {
        Tick {
            instrument: "DOGE/USDT".to_string(),
            timestamp: Utc::now() + chrono::Duration::seconds(second),
            price: 1.0,
            volume: 1.0,
        }
    }

    #[tokio::test]
    async fn test_full_tick_lane_sheds_instead_of_blocking() {
        let (tx, mut rx) = inbox(2);
        assert_eq!(tx.send_tick(tick(0)), Delivery::Queued);
        assert_eq!(tx.send_tick(tick(1)), Delivery::Queued);
        assert_eq!(tx.send_tick(tick(2)), Delivery::Shed);

        // Control lane is unbounded and served ahead of queued ticks
        assert!(tx.request_reconcile());
        assert!(matches!(rx.recv().await, Some(WorkerMessage::Reconcile)));
        assert!(matches!(rx.recv().await, Some(WorkerMessage::Tick(_))));

        drop(rx);
        assert_eq!(tx.send_tick(tick(3)), Delivery::Closed);
    }

    #[tokio::test]
    async fn test_reconcile_requests_coalesce() {
        let (tx, mut rx) = inbox(4);
        assert!(tx.request_reconcile());
        assert!(tx.request_reconcile());

        assert!(matches!(rx.recv().await, Some(WorkerMessage::Reconcile)));
        // Once consumed, the next request queues again
        assert!(tx.request_reconcile());
        drop(tx);
        assert!(matches!(rx.recv().await, Some(WorkerMessage::Reconcile)));
        assert!(rx.recv().await.is_none());
    }
}
