// Order execution: lifecycle state machine, broker retries, coordination
pub mod coordinator;
pub mod lifecycle;
pub mod retry;

pub use coordinator::{DiscardReason, OrderCoordinator, ReconcileOutcome, SignalOutcome};
pub use retry::{call_with_retry, BackoffConfig, ExponentialBackoff, RetryError, RetryPolicy};
