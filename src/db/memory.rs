use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;
use uuid::Uuid;

use super::PositionStore;
use crate::error::{ConflictError, StoreError};
use crate::models::{ClosedTrade, ExitReason, Order, Position};

#[derive(Default)]
struct MemoryState {
    positions: HashMap<String, Position>,
    orders: HashMap<Uuid, Order>,
    order_sequence: Vec<Uuid>,
    trades: Vec<ClosedTrade>,
}

/// Process-local store for paper trading and tests
///
/// Same compare-and-swap semantics as the Postgres store. Availability can be
/// toggled to exercise store-outage handling.
pub struct InMemoryStore {
    state: Mutex<MemoryState>,
    available: AtomicBool,
    writes: AtomicUsize,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(MemoryState::default()),
            available: AtomicBool::new(true),
            writes: AtomicUsize::new(0),
        }
    }

    /// Simulate the store going away (or coming back)
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    /// Successful compare-and-swap writes so far
    pub fn write_count(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }

    /// Seed a record directly, bypassing versioning (crash-recovery tests)
    pub async fn insert_raw(&self, position: Position) {
        let mut state = self.state.lock().await;
        if let Some(order) = &position.active_order {
            if !state.orders.contains_key(&order.id) {
                state.order_sequence.push(order.id);
            }
            state.orders.insert(order.id, order.clone());
        }
        state.positions.insert(position.instrument.clone(), position);
    }

    fn ensure_available(&self) -> Result<(), StoreError> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(StoreError::Unavailable("in-memory store marked unavailable".to_string()))
        }
    }
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl PositionStore for InMemoryStore {
    async fn get(&self, instrument: &str) -> Result<Position, StoreError> {
        self.ensure_available()?;
        let state = self.state.lock().await;
        Ok(state
            .positions
            .get(instrument)
            .cloned()
            .unwrap_or_else(|| Position::flat(instrument)))
    }

    async fn compare_and_swap(
        &self,
        instrument: &str,
        expected: &Position,
        mut new: Position,
        trade: Option<&ClosedTrade>,
    ) -> Result<Position, StoreError> {
        self.ensure_available()?;
        let mut state = self.state.lock().await;

        let found = state.positions.get(instrument).map(|p| p.version).unwrap_or(0);
        if found != expected.version {
            return Err(ConflictError {
                instrument: instrument.to_string(),
                expected: expected.version,
                found,
            }
            .into());
        }

        new.instrument = instrument.to_string();
        new.version = found + 1;
        new.updated_at = Utc::now();

        if let Some(order) = &new.active_order {
            if !state.orders.contains_key(&order.id) {
                state.order_sequence.push(order.id);
            }
            state.orders.insert(order.id, order.clone());
        }
        if let Some(trade) = trade {
            state.trades.push(trade.clone());
        }
        state.positions.insert(instrument.to_string(), new.clone());
        self.writes.fetch_add(1, Ordering::SeqCst);

        Ok(new)
    }

    async fn load_active(&self) -> Result<Vec<Position>, StoreError> {
        self.ensure_available()?;
        let state = self.state.lock().await;
        let mut active: Vec<Position> = state
            .positions
            .values()
            .filter(|p| !p.is_flat() || p.reconcile_required)
            .cloned()
            .collect();
        active.sort_by(|a, b| a.instrument.cmp(&b.instrument));
        Ok(active)
    }

    async fn count_open(&self) -> Result<usize, StoreError> {
        self.ensure_available()?;
        let state = self.state.lock().await;
        Ok(state.positions.values().filter(|p| !p.is_flat()).count())
    }

    async fn count_stop_losses_since(&self, since: DateTime<Utc>) -> Result<u32, StoreError> {
        self.ensure_available()?;
        let state = self.state.lock().await;
        let count = state
            .trades
            .iter()
            .filter(|t| t.exit_reason == ExitReason::StopLoss && t.closed_at >= since)
            .count();
        Ok(count as u32)
    }

    async fn order_history(&self, instrument: &str) -> Result<Vec<Order>, StoreError> {
        self.ensure_available()?;
        let state = self.state.lock().await;
        Ok(state
            .order_sequence
            .iter()
            .filter_map(|id| state.orders.get(id))
            .filter(|o| o.instrument == instrument)
            .cloned()
            .collect())
    }

    async fn closed_trades(&self, instrument: &str) -> Result<Vec<ClosedTrade>, StoreError> {
        self.ensure_available()?;
        let state = self.state.lock().await;
        Ok(state
            .trades
            .iter()
            .filter(|t| t.instrument == instrument)
            .cloned()
            .collect())
    }

    async fn ping(&self) -> Result<(), StoreError> {
        self.ensure_available()
    }
}
