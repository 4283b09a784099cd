use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use tokio::sync::{Mutex, Semaphore};
use uuid::Uuid;

use super::lifecycle;
use super::retry::{call_with_retry, RetryError, RetryPolicy};
use crate::broker::{Broker, OrderRequest, OrderSnapshot};
use crate::config::ExecutionConfig;
use crate::db::PositionStore;
use crate::error::{BrokerError, ExecutionError, StoreError};
use crate::models::{
    BrokerEvent, BrokerEventKind, ClosedTrade, ExitReason, Instrument, Order, OrderPurpose,
    OrderStatus, Position, PositionState, Signal, Tick,
};
use crate::risk::{self, RiskLimits, RiskSnapshot, RiskTrip};

/// Why a signal produced no order
#[derive(Debug, Clone, PartialEq)]
pub enum DiscardReason {
    /// Entry or exit already in progress
    Busy(PositionState),
    /// Open in the same direction as the signal
    AlreadyPositioned,
    /// Previous broker outcome unknown; nothing moves until reconciled
    AwaitingReconciliation,
    /// Generated too long ago to act on, e.g. during a history warm-up
    Stale { age_secs: i64 },
    Risk(RiskTrip),
}

#[derive(Debug, Clone, PartialEq)]
pub enum SignalOutcome {
    Submitted { order_id: Uuid, purpose: OrderPurpose },
    Discarded(DiscardReason),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconcileOutcome {
    /// Nothing in flight, nothing to repair
    Clean,
    /// Local state now matches the broker
    Synced,
    /// Order was never seen by the broker and has been resubmitted
    Resubmitted,
    /// Order was never seen by the broker and has been written off
    Reverted,
    /// Broker could not be asked; position stays flagged
    Unresolved,
}

/// Turns signals into broker orders and broker events into position state
///
/// Stateless apart from shared handles: the per-instrument worker provides
/// sequencing, the store's compare-and-swap guards against anything else.
pub struct OrderCoordinator {
    store: Arc<dyn PositionStore>,
    broker: Arc<dyn Broker>,
    broker_permits: Arc<Semaphore>,
    /// Held from the risk gate's read until the entry is written
    entry_gate: Mutex<()>,
    retry: RetryPolicy,
    config: ExecutionConfig,
    risk: RiskLimits,
    instruments: HashMap<String, Instrument>,
}

impl OrderCoordinator {
    pub fn new(
        store: Arc<dyn PositionStore>,
        broker: Arc<dyn Broker>,
        config: ExecutionConfig,
        risk: RiskLimits,
        instruments: &[Instrument],
    ) -> Self {
        Self {
            broker_permits: Arc::new(Semaphore::new(config.max_concurrent_broker_calls.max(1))),
            entry_gate: Mutex::new(()),
            retry: RetryPolicy::from(&config),
            store,
            broker,
            config,
            risk,
            instruments: instruments
                .iter()
                .map(|i| (i.id.clone(), i.clone()))
                .collect(),
        }
    }

    pub fn store(&self) -> &Arc<dyn PositionStore> {
        &self.store
    }

    pub fn broker(&self) -> &Arc<dyn Broker> {
        &self.broker
    }

    pub fn risk(&self) -> &RiskLimits {
        &self.risk
    }

    fn instrument(&self, id: &str) -> Result<&Instrument, ExecutionError> {
        self.instruments
            .get(id)
            .ok_or_else(|| ExecutionError::UnknownInstrument(id.to_string()))
    }

    /// Handle a breakout signal
    ///
    /// Flat positions get an entry, open positions facing an opposite
    /// breakout get an exit; everything else is discarded.
    pub async fn on_signal(&self, signal: &Signal) -> Result<SignalOutcome, ExecutionError> {
        let instrument = self.instrument(&signal.instrument)?;

        let age = Utc::now() - signal.generated_at;
        if age > self.config.max_signal_age() {
            tracing::info!(
                instrument = %instrument.id,
                direction = signal.direction.as_str(),
                age_secs = age.num_seconds(),
                "Signal discarded: too old to act on"
            );
            return Ok(SignalOutcome::Discarded(DiscardReason::Stale {
                age_secs: age.num_seconds(),
            }));
        }

        let position = self.store.get(&instrument.id).await?;

        if let Some(reason) = busy_reason(&position) {
            tracing::info!(
                instrument = %instrument.id,
                direction = signal.direction.as_str(),
                reason = ?reason,
                "Signal discarded"
            );
            return Ok(SignalOutcome::Discarded(reason));
        }

        match position.state {
            PositionState::Flat => self.enter(instrument, signal).await,
            PositionState::Open if position.direction == Some(signal.direction.opposite()) => {
                let price = instrument.round_price(signal.trigger_price);
                self.exit(instrument, ExitReason::Signal, position.quantity, price)
                    .await
            }
            _ => {
                tracing::info!(
                    instrument = %instrument.id,
                    direction = signal.direction.as_str(),
                    "Signal discarded: already positioned in this direction"
                );
                Ok(SignalOutcome::Discarded(DiscardReason::AlreadyPositioned))
            }
        }
    }

    async fn enter(
        &self,
        instrument: &Instrument,
        signal: &Signal,
    ) -> Result<SignalOutcome, ExecutionError> {
        let price = instrument.round_price(signal.trigger_price);
        let direction = signal.direction;
        let order_type = self.config.order_type;

        // Workers run in parallel; counting and writing under one lock keeps
        // two instruments from both taking the last open slot
        let (written, quantity) = {
            let _gate = self.entry_gate.lock().await;
            let snapshot = RiskSnapshot {
                open_positions: self.store.count_open().await?,
                stop_losses_today: self
                    .store
                    .count_stop_losses_since(risk::utc_day_start(Utc::now()))
                    .await?,
            };
            let quantity = self
                .risk
                .check(&snapshot)
                .and_then(|_| self.risk.size(instrument, price));
            let quantity = match quantity {
                Ok(q) => q,
                Err(trip) => {
                    tracing::warn!(instrument = %instrument.id, "Entry blocked by risk gate: {}", trip);
                    return Ok(SignalOutcome::Discarded(DiscardReason::Risk(trip)));
                }
            };

            let written = self
                .update(&instrument.id, |current| {
                    lifecycle::begin_entry(current, direction, quantity, price, order_type, Utc::now())
                        .map(|next| (next, None))
                })
                .await?;
            (written, quantity)
        };

        let Some(position) = written else {
            // Lost a race with another writer; re-read decides nothing to do
            return Ok(SignalOutcome::Discarded(DiscardReason::Busy(
                PositionState::EntryPending,
            )));
        };
        let order = active_order(&position)?;

        tracing::info!(
            instrument = %instrument.id,
            order_id = %order.id,
            direction = direction.as_str(),
            quantity,
            price,
            strength = signal.strength,
            "Submitting entry order"
        );
        self.submit(instrument, order).await
    }

    async fn exit(
        &self,
        instrument: &Instrument,
        reason: ExitReason,
        quantity: f64,
        price: f64,
    ) -> Result<SignalOutcome, ExecutionError> {
        let order_type = self.config.order_type;
        let written = self
            .update(&instrument.id, |current| {
                lifecycle::begin_exit(current, reason, quantity, price, order_type, Utc::now())
                    .map(|next| (next, None))
            })
            .await?;

        let Some(position) = written else {
            return Ok(SignalOutcome::Discarded(DiscardReason::Busy(
                PositionState::ExitPending,
            )));
        };
        let order = active_order(&position)?;

        tracing::info!(
            instrument = %instrument.id,
            order_id = %order.id,
            reason = reason.as_str(),
            quantity = order.quantity,
            price,
            "Submitting exit order"
        );
        self.submit(instrument, order).await
    }

    /// Exit an open position whose stop, trailing stop or target was crossed
    ///
    /// Targets close part of the position; stops close all of it.
    pub async fn check_protective_exit(
        &self,
        tick: &Tick,
    ) -> Result<Option<SignalOutcome>, ExecutionError> {
        let instrument = self.instrument(&tick.instrument)?;
        let position = self.store.get(&instrument.id).await?;

        let Some(exit) = self.risk.protective_exit(instrument, &position, tick.price) else {
            return Ok(None);
        };
        tracing::info!(
            instrument = %instrument.id,
            price = tick.price,
            stop_loss = ?position.stop_loss,
            take_profit = ?position.take_profit,
            trailing_stop = ?position.trailing_stop,
            targets_hit = position.targets_hit,
            reason = exit.reason.as_str(),
            quantity = exit.quantity,
            "Protective exit triggered"
        );
        self.exit(instrument, exit.reason, exit.quantity, tick.price)
            .await
            .map(Some)
    }

    /// Tighten an armed trailing stop toward `tick`; returns the new level
    pub async fn raise_trailing_stop(&self, tick: &Tick) -> Result<Option<f64>, ExecutionError> {
        let instrument = self.instrument(&tick.instrument)?;
        let risk = &self.risk;
        let written = self
            .update(&instrument.id, |current| {
                risk.trail(instrument, current, tick.price).map(|level| {
                    let mut next = current.clone();
                    next.trailing_stop = Some(level);
                    (next, None)
                })
            })
            .await?;
        Ok(written.and_then(|p| p.trailing_stop))
    }

    /// Submit the order recorded in the position and settle the result
    async fn submit(
        &self,
        instrument: &Instrument,
        order: Order,
    ) -> Result<SignalOutcome, ExecutionError> {
        let request = OrderRequest::from(&order);
        let result = {
            let _permit = self.acquire_permit().await?;
            call_with_retry(&self.retry, "submit_order", &instrument.id, || {
                self.broker.submit_order(&request)
            })
            .await
        };

        let submitted = SignalOutcome::Submitted {
            order_id: order.id,
            purpose: order.purpose,
        };

        match result {
            Ok(snapshot) => {
                self.apply_snapshot(instrument, &snapshot).await?;
                Ok(submitted)
            }
            Err(RetryError::Broker(BrokerError::DuplicateOrder(msg)))
            | Err(RetryError::Broker(BrokerError::AlreadyFilled(msg))) => {
                tracing::info!(
                    instrument = %instrument.id,
                    order_id = %order.id,
                    "Broker already has this order ({}), treating as accepted",
                    msg
                );
                self.sync_order(instrument, &order).await?;
                Ok(submitted)
            }
            Err(RetryError::Broker(BrokerError::Rejected(reason))) => {
                tracing::warn!(
                    instrument = %instrument.id,
                    order_id = %order.id,
                    purpose = order.purpose.as_str(),
                    "Order rejected by broker: {}",
                    reason
                );
                self.fail(instrument, order.id, BrokerEventKind::Rejected {
                    reason: reason.clone(),
                })
                .await?;
                Err(ExecutionError::BrokerRejection {
                    instrument: instrument.id.clone(),
                    reason,
                })
            }
            Err(RetryError::Exhausted { attempts, last }) => {
                // Some attempt may still have landed; only the broker can say
                self.flag_reconcile(&instrument.id).await?;
                Err(ExecutionError::TransientNetwork {
                    attempts,
                    message: last,
                })
            }
            Err(RetryError::Broker(e)) => {
                tracing::warn!(
                    instrument = %instrument.id,
                    order_id = %order.id,
                    "Ambiguous submit outcome: {}",
                    e
                );
                self.flag_reconcile(&instrument.id).await?;
                self.sync_order(instrument, &order).await?;
                Ok(submitted)
            }
        }
    }

    /// Apply a fill / status event from the broker
    pub async fn on_broker_event(&self, event: &BrokerEvent) -> Result<(), ExecutionError> {
        let instrument = self.instrument(&event.instrument)?;
        let risk = &self.risk;
        let written = self
            .update(&instrument.id, |current| {
                lifecycle::apply_event(current, event, risk, instrument)
            })
            .await?;

        if written.is_none() {
            tracing::debug!(
                instrument = %instrument.id,
                order_id = %event.order_id,
                kind = ?event.kind,
                "Broker event ignored (stale or replayed)"
            );
        }
        Ok(())
    }

    async fn apply_snapshot(
        &self,
        instrument: &Instrument,
        snapshot: &OrderSnapshot,
    ) -> Result<(), ExecutionError> {
        for event in snapshot.to_events() {
            self.on_broker_event(&event).await?;
        }
        // Broker knows the order even if nothing changed locally
        let order_id = snapshot.client_order_id;
        self.update(&instrument.id, |current| {
            let matches = current.active_order.as_ref().map(|o| o.id) == Some(order_id);
            if !matches {
                return None;
            }
            lifecycle::set_reconcile_required(current, false).map(|next| (next, None))
        })
        .await?;
        Ok(())
    }

    async fn fail(
        &self,
        instrument: &Instrument,
        order_id: Uuid,
        kind: BrokerEventKind,
    ) -> Result<(), ExecutionError> {
        let risk = &self.risk;
        self.update(&instrument.id, |current| {
            lifecycle::fail_order(current, order_id, kind.clone(), risk, instrument, Utc::now())
        })
        .await?;
        Ok(())
    }

    async fn flag_reconcile(&self, instrument: &str) -> Result<(), ExecutionError> {
        self.update(instrument, |current| {
            lifecycle::set_reconcile_required(current, true).map(|next| (next, None))
        })
        .await?;
        tracing::warn!(instrument = %instrument, "Position flagged for reconciliation");
        Ok(())
    }

    /// Fetch the order's status from the broker and apply it
    async fn sync_order(
        &self,
        instrument: &Instrument,
        order: &Order,
    ) -> Result<OrderSnapshot, ExecutionError> {
        match self.fetch_status(instrument, order.id).await {
            Ok(snapshot) => {
                self.apply_snapshot(instrument, &snapshot).await?;
                Ok(snapshot)
            }
            Err(_) => {
                self.flag_reconcile(&instrument.id).await?;
                Err(ExecutionError::AmbiguousOutcome {
                    instrument: instrument.id.clone(),
                })
            }
        }
    }

    async fn fetch_status(
        &self,
        instrument: &Instrument,
        order_id: Uuid,
    ) -> Result<OrderSnapshot, RetryError> {
        let _permit = self.acquire_permit().await.map_err(|_| RetryError::Exhausted {
            attempts: 0,
            last: "broker permits closed".to_string(),
        })?;
        call_with_retry(&self.retry, "fetch_order_status", &instrument.id, || {
            self.broker.fetch_order_status(order_id, &instrument.id)
        })
        .await
    }

    /// Re-fetch broker state for the instrument's in-flight order and repair drift
    ///
    /// Also cancels orders that outlived `order_ttl_secs`, and either
    /// resubmits or writes off orders the broker has never seen.
    pub async fn reconcile(&self, instrument_id: &str) -> Result<ReconcileOutcome, ExecutionError> {
        let instrument = self.instrument(instrument_id)?;
        let position = self.store.get(instrument_id).await?;

        let Some(order) = position.open_order().cloned() else {
            return self.reconcile_without_order(instrument, &position).await;
        };

        let snapshot = match self.fetch_status(instrument, order.id).await {
            Ok(snapshot) => snapshot,
            Err(RetryError::Broker(BrokerError::NotFound(_))) => {
                return self.handle_unknown_order(instrument, &order).await;
            }
            Err(e) => {
                tracing::warn!(
                    instrument = %instrument_id,
                    order_id = %order.id,
                    "Reconciliation fetch failed: {}",
                    e
                );
                if !position.reconcile_required {
                    self.flag_reconcile(instrument_id).await?;
                }
                return Ok(ReconcileOutcome::Unresolved);
            }
        };

        if snapshot.status != order.status || snapshot.filled_quantity > order.filled_quantity {
            tracing::info!(
                instrument = %instrument_id,
                order_id = %order.id,
                local = order.status.as_str(),
                broker = snapshot.status.as_str(),
                "Reconciliation repaired order drift"
            );
        }
        self.apply_snapshot(instrument, &snapshot).await?;

        if !snapshot.status.is_terminal() && Utc::now() - order.created_at > self.config.order_ttl() {
            self.cancel_stale(instrument, &order).await?;
        }
        Ok(ReconcileOutcome::Synced)
    }

    async fn reconcile_without_order(
        &self,
        instrument: &Instrument,
        position: &Position,
    ) -> Result<ReconcileOutcome, ExecutionError> {
        if position.reconcile_required {
            self.update(&instrument.id, |current| {
                lifecycle::set_reconcile_required(current, false).map(|next| (next, None))
            })
            .await?;
            tracing::info!(instrument = %instrument.id, "Reconciliation flag cleared, no order in flight");
        }

        let repaired = self
            .update(&instrument.id, |current| {
                lifecycle::repair_orphaned_pending(current).map(|next| (next, None))
            })
            .await?;
        if let Some(p) = repaired {
            tracing::warn!(
                instrument = %instrument.id,
                to = p.state.as_str(),
                "Repaired pending position with no live order"
            );
            return Ok(ReconcileOutcome::Synced);
        }

        Ok(if position.reconcile_required {
            ReconcileOutcome::Synced
        } else {
            ReconcileOutcome::Clean
        })
    }

    /// Broker has no record of an order we wrote as submitted
    async fn handle_unknown_order(
        &self,
        instrument: &Instrument,
        order: &Order,
    ) -> Result<ReconcileOutcome, ExecutionError> {
        let within_ttl = Utc::now() - order.created_at <= self.config.order_ttl();

        if order.status == OrderStatus::Submitted && within_ttl {
            tracing::warn!(
                instrument = %instrument.id,
                order_id = %order.id,
                "Order unknown to broker, completing submission"
            );
            return match self.submit(instrument, order.clone()).await {
                Ok(_) => Ok(ReconcileOutcome::Resubmitted),
                Err(ExecutionError::BrokerRejection { .. }) => Ok(ReconcileOutcome::Reverted),
                Err(ExecutionError::TransientNetwork { .. })
                | Err(ExecutionError::AmbiguousOutcome { .. }) => Ok(ReconcileOutcome::Unresolved),
                Err(e) => Err(e),
            };
        }

        tracing::warn!(
            instrument = %instrument.id,
            order_id = %order.id,
            status = order.status.as_str(),
            "Order unknown to broker, writing it off"
        );
        self.fail(instrument, order.id, BrokerEventKind::Cancelled).await?;
        Ok(ReconcileOutcome::Reverted)
    }

    async fn cancel_stale(&self, instrument: &Instrument, order: &Order) -> Result<(), ExecutionError> {
        tracing::warn!(
            instrument = %instrument.id,
            order_id = %order.id,
            age_secs = (Utc::now() - order.created_at).num_seconds(),
            "Cancelling stale order"
        );

        let result = {
            let _permit = self.acquire_permit().await?;
            call_with_retry(&self.retry, "cancel_order", &instrument.id, || {
                self.broker.cancel_order(order.id, &instrument.id)
            })
            .await
        };

        match result {
            Ok(()) | Err(RetryError::Broker(BrokerError::AlreadyFilled(_))) => {
                self.sync_order(instrument, order).await?;
                Ok(())
            }
            Err(RetryError::Broker(BrokerError::NotFound(_))) => {
                self.fail(instrument, order.id, BrokerEventKind::Cancelled).await
            }
            Err(e) => {
                tracing::warn!(
                    instrument = %instrument.id,
                    order_id = %order.id,
                    "Stale order cancel failed: {}",
                    e
                );
                Ok(())
            }
        }
    }

    /// Startup recovery: reconcile every position left mid-flight
    ///
    /// Failures are contained per instrument and returned for logging.
    pub async fn recover(&self) -> Result<Vec<(String, ReconcileOutcome)>, ExecutionError> {
        let active = self.store.load_active().await?;
        tracing::info!("Recovering {} active positions", active.len());

        let mut outcomes = Vec::with_capacity(active.len());
        for position in active {
            if !self.instruments.contains_key(&position.instrument) {
                tracing::error!(
                    instrument = %position.instrument,
                    state = position.state.as_str(),
                    "Active position for an instrument that is no longer configured"
                );
                continue;
            }
            match self.reconcile(&position.instrument).await {
                Ok(outcome) => {
                    tracing::info!(
                        instrument = %position.instrument,
                        outcome = ?outcome,
                        "Recovered position"
                    );
                    outcomes.push((position.instrument, outcome));
                }
                Err(e) if e.is_store_failure() => return Err(e),
                Err(e) => {
                    tracing::error!(instrument = %position.instrument, "Recovery failed: {}", e);
                    outcomes.push((position.instrument, ReconcileOutcome::Unresolved));
                }
            }
        }
        Ok(outcomes)
    }

    async fn acquire_permit(&self) -> Result<tokio::sync::SemaphorePermit<'_>, ExecutionError> {
        self.broker_permits
            .acquire()
            .await
            .map_err(|_| ExecutionError::TransientNetwork {
                attempts: 0,
                message: "broker permits closed".to_string(),
            })
    }

    /// Read-decide-write with compare-and-swap, retried on conflict
    ///
    /// `decide` sees a fresh read on every attempt and returns `None` when
    /// there is nothing to write.
    async fn update<F>(
        &self,
        instrument: &str,
        mut decide: F,
    ) -> Result<Option<Position>, ExecutionError>
    where
        F: FnMut(&Position) -> Option<(Position, Option<ClosedTrade>)> + Send,
    {
        let mut attempt = 0;
        loop {
            attempt += 1;
            let current = self.store.get(instrument).await?;
            let Some((next, trade)) = decide(&current) else {
                return Ok(None);
            };

            match self
                .store
                .compare_and_swap(instrument, &current, next, trade.as_ref())
                .await
            {
                Ok(stored) => {
                    log_transition(&current, &stored, trade.as_ref());
                    return Ok(Some(stored));
                }
                Err(StoreError::Conflict(conflict)) if attempt < self.config.cas_max_attempts => {
                    tracing::warn!(
                        instrument = %instrument,
                        attempt,
                        "Version conflict ({}), retrying with fresh read",
                        conflict
                    );
                }
                Err(e) => {
                    tracing::error!(instrument = %instrument, "Failed to persist transition: {}", e);
                    return Err(e.into());
                }
            }
        }
    }
}

fn busy_reason(position: &Position) -> Option<DiscardReason> {
    if position.reconcile_required {
        return Some(DiscardReason::AwaitingReconciliation);
    }
    if position.open_order().is_some() {
        return Some(DiscardReason::Busy(position.state));
    }
    match position.state {
        PositionState::EntryPending | PositionState::ExitPending => {
            Some(DiscardReason::Busy(position.state))
        }
        _ => None,
    }
}

fn active_order(position: &Position) -> Result<Order, ExecutionError> {
    position.active_order.clone().ok_or_else(|| {
        ExecutionError::Store(StoreError::Corrupt {
            instrument: position.instrument.clone(),
            reason: "pending position written without an order".to_string(),
        })
    })
}

fn log_transition(before: &Position, after: &Position, trade: Option<&ClosedTrade>) {
    let order = after.active_order.as_ref();
    tracing::info!(
        instrument = %after.instrument,
        from = before.state.as_str(),
        to = after.state.as_str(),
        version = after.version,
        quantity = after.quantity,
        order_id = ?order.map(|o| o.id),
        order_status = ?order.map(|o| o.status.as_str()),
        reconcile_required = after.reconcile_required,
        "Position transition"
    );
    if let Some(trade) = trade {
        tracing::info!(
            instrument = %trade.instrument,
            direction = trade.direction.as_str(),
            quantity = trade.quantity,
            entry = trade.entry_price,
            exit = trade.exit_price,
            pnl = trade.realized_pnl,
            reason = trade.exit_reason.as_str(),
            "Trade closed"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::paper::{FillMode, PaperFault, PaperOp};
    use crate::broker::PaperBroker;
    use crate::config::RiskConfig;
    use crate::db::InMemoryStore;
    use crate::models::Direction;

    const INST: &str = "DOGE/USDT";

    fn instrument() -> Instrument {
        Instrument {
            id: INST.to_string(),
            tick_size: 0.0001,
            min_order_size: 1.0,
        }
    }

    fn setup(fill_mode: FillMode) -> (Arc<InMemoryStore>, Arc<PaperBroker>, OrderCoordinator) {
        let store = Arc::new(InMemoryStore::new());
        let broker = Arc::new(PaperBroker::new(fill_mode));
        let config = ExecutionConfig {
            initial_backoff_ms: 1,
            max_backoff_ms: 2,
            max_retries: 2,
            broker_timeout_ms: 500,
            ..Default::default()
        };
        let coordinator = OrderCoordinator::new(
            store.clone(),
            broker.clone(),
            config,
            RiskLimits::new(RiskConfig::default()),
            &[instrument()],
        );
        (store, broker, coordinator)
    }

    fn signal(direction: Direction, price: f64) -> Signal {
        Signal {
            instrument: INST.to_string(),
            direction,
            trigger_price: price,
            strength: 0.8,
            generated_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_signal_opens_position_with_immediate_fill() {
        let (store, _, coordinator) = setup(FillMode::Immediate);
        let outcome = coordinator.on_signal(&signal(Direction::Long, 1.0)).await.unwrap();
        assert!(matches!(outcome, SignalOutcome::Submitted { purpose: OrderPurpose::Entry, .. }));

        let position = store.get(INST).await.unwrap();
        assert_eq!(position.state, PositionState::Open);
        assert_eq!(position.quantity, 100.0);
        assert_eq!(position.direction, Some(Direction::Long));
    }

    #[tokio::test]
    async fn test_second_signal_discarded_while_pending() {
        let (_, broker, coordinator) = setup(FillMode::Manual);
        coordinator.on_signal(&signal(Direction::Long, 1.0)).await.unwrap();
        let outcome = coordinator.on_signal(&signal(Direction::Long, 1.0)).await.unwrap();

        assert!(matches!(outcome, SignalOutcome::Discarded(DiscardReason::Busy(_))));
        assert_eq!(broker.calls(PaperOp::Submit).await, 1);
    }

    #[tokio::test]
    async fn test_rejected_entry_returns_to_flat_without_retry() {
        let (store, broker, coordinator) = setup(FillMode::Manual);
        broker
            .inject(PaperOp::Submit, PaperFault::Reject("insufficient margin".into()))
            .await;

        let err = coordinator.on_signal(&signal(Direction::Long, 1.0)).await.unwrap_err();
        assert!(matches!(err, ExecutionError::BrokerRejection { .. }));

        let position = store.get(INST).await.unwrap();
        assert!(position.is_flat());
        assert_eq!(
            position.active_order.as_ref().unwrap().status,
            OrderStatus::Rejected
        );
        assert_eq!(broker.calls(PaperOp::Submit).await, 1);
    }

    #[tokio::test]
    async fn test_fill_replay_is_idempotent() {
        let (store, broker, coordinator) = setup(FillMode::Manual);
        coordinator.on_signal(&signal(Direction::Long, 1.0)).await.unwrap();
        let order_id = store.get(INST).await.unwrap().active_order.unwrap().id;

        broker.fill(order_id, 100.0, 1.0).await.unwrap();
        let events = broker.poll_events().await.unwrap();
        for event in &events {
            coordinator.on_broker_event(event).await.unwrap();
        }
        let once = store.get(INST).await.unwrap();

        for event in &events {
            coordinator.on_broker_event(event).await.unwrap();
        }
        let twice = store.get(INST).await.unwrap();

        assert_eq!(once, twice);
        assert_eq!(twice.state, PositionState::Open);
    }

    #[tokio::test]
    async fn test_opposite_signal_exits_and_archives_trade() {
        let (store, _, coordinator) = setup(FillMode::Immediate);
        coordinator.on_signal(&signal(Direction::Long, 1.0)).await.unwrap();
        let outcome = coordinator.on_signal(&signal(Direction::Short, 1.02)).await.unwrap();
        assert!(matches!(outcome, SignalOutcome::Submitted { purpose: OrderPurpose::Exit, .. }));

        assert!(store.get(INST).await.unwrap().is_flat());
        let trades = store.closed_trades(INST).await.unwrap();
        assert_eq!(trades.len(), 1);
        assert_eq!(trades[0].exit_reason, ExitReason::Signal);
        assert!((trades[0].realized_pnl - 2.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_same_direction_signal_discarded_when_open() {
        let (_, _, coordinator) = setup(FillMode::Immediate);
        coordinator.on_signal(&signal(Direction::Long, 1.0)).await.unwrap();
        let outcome = coordinator.on_signal(&signal(Direction::Long, 1.1)).await.unwrap();
        assert_eq!(outcome, SignalOutcome::Discarded(DiscardReason::AlreadyPositioned));
    }

    #[tokio::test]
    async fn test_ambiguous_submit_resolved_by_fetch() {
        let (store, broker, coordinator) = setup(FillMode::Manual);
        broker.inject(PaperOp::Submit, PaperFault::AcceptThenAmbiguous).await;

        let outcome = coordinator.on_signal(&signal(Direction::Long, 1.0)).await.unwrap();
        assert!(matches!(outcome, SignalOutcome::Submitted { .. }));

        let position = store.get(INST).await.unwrap();
        assert!(!position.reconcile_required);
        assert_eq!(
            position.active_order.unwrap().status,
            OrderStatus::Acknowledged
        );
        assert_eq!(broker.calls(PaperOp::Submit).await, 1);
    }

    #[tokio::test]
    async fn test_ambiguous_submit_unresolved_blocks_signals() {
        let (store, broker, coordinator) = setup(FillMode::Manual);
        broker.inject(PaperOp::Submit, PaperFault::AcceptThenAmbiguous).await;
        broker.inject(PaperOp::Fetch, PaperFault::DropThenAmbiguous).await;

        let err = coordinator.on_signal(&signal(Direction::Long, 1.0)).await.unwrap_err();
        assert!(matches!(err, ExecutionError::AmbiguousOutcome { .. }));
        assert!(store.get(INST).await.unwrap().reconcile_required);

        let outcome = coordinator.on_signal(&signal(Direction::Short, 0.9)).await.unwrap();
        assert_eq!(outcome, SignalOutcome::Discarded(DiscardReason::AwaitingReconciliation));

        assert_eq!(coordinator.reconcile(INST).await.unwrap(), ReconcileOutcome::Synced);
        assert!(!store.get(INST).await.unwrap().reconcile_required);
    }

    #[tokio::test]
    async fn test_exhausted_retries_flag_reconciliation() {
        let (store, broker, coordinator) = setup(FillMode::Manual);
        for _ in 0..3 {
            broker.inject(PaperOp::Submit, PaperFault::Transient).await;
        }

        let err = coordinator.on_signal(&signal(Direction::Long, 1.0)).await.unwrap_err();
        assert!(matches!(err, ExecutionError::TransientNetwork { attempts: 3, .. }));
        assert!(store.get(INST).await.unwrap().reconcile_required);

        // Broker never saw it: reconciliation completes the submission
        assert_eq!(coordinator.reconcile(INST).await.unwrap(), ReconcileOutcome::Resubmitted);
        let position = store.get(INST).await.unwrap();
        assert!(!position.reconcile_required);
        assert_eq!(position.state, PositionState::EntryPending);
        assert_eq!(broker.orders().await.len(), 1);
    }

    #[tokio::test]
    async fn test_stop_loss_exit() {
        let (store, _, coordinator) = setup(FillMode::Immediate);
        coordinator.on_signal(&signal(Direction::Long, 1.0)).await.unwrap();

        assert!(coordinator.check_protective_exit(&tick(0.99)).await.unwrap().is_none());
        assert!(coordinator.check_protective_exit(&tick(0.96)).await.unwrap().is_some());

        let trades = store.closed_trades(INST).await.unwrap();
        assert_eq!(trades[0].exit_reason, ExitReason::StopLoss);
        assert_eq!(store.count_stop_losses_since(risk::utc_day_start(Utc::now())).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_store_outage_surfaces_as_store_failure() {
        let (store, broker, coordinator) = setup(FillMode::Immediate);
        store.set_available(false);
        let err = coordinator.on_signal(&signal(Direction::Long, 1.0)).await.unwrap_err();
        assert!(err.is_store_failure());
        assert_eq!(broker.calls(PaperOp::Submit).await, 0);
    }

    fn tick(price: f64) -> Tick {
        Tick {
            instrument: INST.to_string(),
            timestamp: Utc::now(),
            price,
            volume: 1.0,
        }
    }

    #[tokio::test]
    async fn test_stale_signal_discarded() {
        let (_, broker, coordinator) = setup(FillMode::Immediate);
        let mut old = signal(Direction::Long, 1.0);
        old.generated_at = Utc::now() - chrono::Duration::days(14);

        let outcome = coordinator.on_signal(&old).await.unwrap();
        assert!(matches!(outcome, SignalOutcome::Discarded(DiscardReason::Stale { .. })));
        assert_eq!(broker.calls(PaperOp::Submit).await, 0);
    }

    #[tokio::test]
    async fn test_targets_scale_out_and_trailing_stop_closes_rest() {
        let (store, _, coordinator) = setup(FillMode::Immediate);
        coordinator.on_signal(&signal(Direction::Long, 1.0)).await.unwrap();

        // First target sells 30 of 100
        assert!(coordinator.check_protective_exit(&tick(1.06)).await.unwrap().is_some());
        let position = store.get(INST).await.unwrap();
        assert_eq!(position.state, PositionState::Open);
        assert!((position.quantity - 70.0).abs() < 1e-9);
        assert_eq!(position.targets_hit, 1);

        // Already taken: no repeat at the same level
        assert!(coordinator.check_protective_exit(&tick(1.07)).await.unwrap().is_none());

        // Second target sells 30 of the remaining 70 and arms the trailing stop
        assert!(coordinator.check_protective_exit(&tick(1.11)).await.unwrap().is_some());
        let position = store.get(INST).await.unwrap();
        assert!((position.quantity - 40.0).abs() < 1e-9);
        assert!((position.trailing_stop.unwrap() - 1.0767).abs() < 1e-9);

        let raised = coordinator.raise_trailing_stop(&tick(1.2)).await.unwrap();
        assert!((raised.unwrap() - 1.164).abs() < 1e-9);
        assert_eq!(coordinator.raise_trailing_stop(&tick(1.18)).await.unwrap(), None);

        let outcome = coordinator.check_protective_exit(&tick(1.16)).await.unwrap();
        assert!(outcome.is_some());
        assert!(store.get(INST).await.unwrap().is_flat());

        let trades = store.closed_trades(INST).await.unwrap();
        let reasons: Vec<_> = trades.iter().map(|t| t.exit_reason).collect();
        assert_eq!(
            reasons,
            vec![ExitReason::TakeProfit, ExitReason::TakeProfit, ExitReason::TrailingStop]
        );
        let sold: f64 = trades.iter().map(|t| t.quantity).sum();
        assert!((sold - 100.0).abs() < 1e-9);
    }

    /// Store whose open-position count takes a while to answer
    struct SlowCountStore(InMemoryStore);

    #[async_trait::async_trait]
    impl PositionStore for SlowCountStore {
        async fn get(&self, instrument: &str) -> Result<Position, StoreError> {
            self.0.get(instrument).await
        }

        async fn compare_and_swap(
            &self,
            instrument: &str,
            expected: &Position,
            new: Position,
            trade: Option<&ClosedTrade>,
        ) -> Result<Position, StoreError> {
            self.0.compare_and_swap(instrument, expected, new, trade).await
        }

        async fn load_active(&self) -> Result<Vec<Position>, StoreError> {
            self.0.load_active().await
        }

        async fn count_open(&self) -> Result<usize, StoreError> {
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
            self.0.count_open().await
        }

        async fn count_stop_losses_since(
            &self,
            since: chrono::DateTime<Utc>,
        ) -> Result<u32, StoreError> {
            self.0.count_stop_losses_since(since).await
        }

        async fn order_history(&self, instrument: &str) -> Result<Vec<Order>, StoreError> {
            self.0.order_history(instrument).await
        }

        async fn closed_trades(&self, instrument: &str) -> Result<Vec<ClosedTrade>, StoreError> {
            self.0.closed_trades(instrument).await
        }

        async fn ping(&self) -> Result<(), StoreError> {
            self.0.ping().await
        }
    }

    #[tokio::test]
    async fn test_last_open_slot_goes_to_one_instrument() {
        let store = Arc::new(SlowCountStore(InMemoryStore::new()));
        let other = Instrument {
            id: "PEPE/USDT".to_string(),
            ..instrument()
        };
        let coordinator = OrderCoordinator::new(
            store.clone(),
            Arc::new(PaperBroker::new(FillMode::Immediate)),
            ExecutionConfig::default(),
            RiskLimits::new(RiskConfig {
                max_open_positions: 1,
                ..Default::default()
            }),
            &[instrument(), other.clone()],
        );

        let mut second = signal(Direction::Long, 1.0);
        second.instrument = other.id.clone();
        let first = signal(Direction::Long, 1.0);
        let (a, b) = tokio::join!(
            coordinator.on_signal(&first),
            coordinator.on_signal(&second)
        );

        let outcomes = [a.unwrap(), b.unwrap()];
        let entered = outcomes
            .iter()
            .filter(|o| matches!(o, SignalOutcome::Submitted { .. }))
            .count();
        assert_eq!(entered, 1);
        assert!(outcomes.iter().any(|o| matches!(
            o,
            SignalOutcome::Discarded(DiscardReason::Risk(RiskTrip::MaxOpenPositions { .. }))
        )));
        assert_eq!(store.count_open().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_unknown_instrument() {
        let (_, _, coordinator) = setup(FillMode::Immediate);
        let mut s = signal(Direction::Long, 1.0);
        s.instrument = "BTC/USDT".to_string();
        assert!(matches!(
            coordinator.on_signal(&s).await,
            Err(ExecutionError::UnknownInstrument(_))
        ));
    }
}
