// Position state store
pub mod memory;
pub mod postgres;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::StoreError;
use crate::models::{ClosedTrade, Order, Position};

pub use memory::InMemoryStore;
pub use postgres::PostgresStore;

/// Durable record of every instrument's position and in-flight order
///
/// All writes go through [`PositionStore::compare_and_swap`]. The position,
/// its active order and an optional closed trade are persisted in one atomic
/// write, so a crash can never leave them out of step.
#[async_trait]
pub trait PositionStore: Send + Sync {
    /// Current record, or a version-0 flat position if the instrument never traded
    async fn get(&self, instrument: &str) -> Result<Position, StoreError>;

    /// Persist `new` only if the stored version still equals `expected.version`
    ///
    /// Returns the record as stored, with its version bumped. A version
    /// mismatch is `StoreError::Conflict` and nothing is written.
    async fn compare_and_swap(
        &self,
        instrument: &str,
        expected: &Position,
        new: Position,
        trade: Option<&ClosedTrade>,
    ) -> Result<Position, StoreError>;

    /// Positions that are not flat or still need reconciliation
    async fn load_active(&self) -> Result<Vec<Position>, StoreError>;

    /// Number of non-flat positions across all instruments
    async fn count_open(&self) -> Result<usize, StoreError>;

    /// Stop-loss exits closed at or after `since`
    async fn count_stop_losses_since(&self, since: DateTime<Utc>) -> Result<u32, StoreError>;

    /// Every order ever written for an instrument, oldest first
    async fn order_history(&self, instrument: &str) -> Result<Vec<Order>, StoreError>;

    async fn closed_trades(&self, instrument: &str) -> Result<Vec<ClosedTrade>, StoreError>;

    /// Reachability check used to resume suspended workers
    async fn ping(&self) -> Result<(), StoreError>;
}
