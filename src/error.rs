use thiserror::Error;

/// Errors returned by a broker adapter
#[derive(Debug, Error, Clone, PartialEq)]
pub enum BrokerError {
    /// Request never produced an answer we can trust; safe to retry
    #[error("transient network error: {0}")]
    Transient(String),

    /// Broker refused the order; terminal for that order
    #[error("order rejected by broker: {0}")]
    Rejected(String),

    /// Broker already knows this client order id
    #[error("duplicate order: {0}")]
    DuplicateOrder(String),

    /// Broker reports the order is already filled
    #[error("order already filled: {0}")]
    AlreadyFilled(String),

    /// Outcome unknown (timeout after the request may have been accepted)
    #[error("ambiguous broker outcome: {0}")]
    Ambiguous(String),

    #[error("order not found at broker: {0}")]
    NotFound(String),
}

impl BrokerError {
    pub fn is_transient(&self) -> bool {
        matches!(self, BrokerError::Transient(_))
    }
}

/// Compare-and-swap mismatch: somebody else wrote first
#[derive(Debug, Error, Clone, PartialEq)]
#[error("version conflict on {instrument}: expected {expected}, found {found}")]
pub struct ConflictError {
    pub instrument: String,
    pub expected: i64,
    pub found: i64,
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error(transparent)]
    Conflict(#[from] ConflictError),

    /// Store unreachable or write failed; callers must not proceed on unpersisted state
    #[error("store unavailable: {0}")]
    Unavailable(String),

    #[error("corrupt record for {instrument}: {reason}")]
    Corrupt { instrument: String, reason: String },
}

impl From<sqlx::Error> for StoreError {
    fn from(e: sqlx::Error) -> Self {
        StoreError::Unavailable(e.to_string())
    }
}

/// Errors surfaced by the order execution coordinator
#[derive(Debug, Error)]
pub enum ExecutionError {
    #[error("transient network error after {attempts} attempts: {message}")]
    TransientNetwork { attempts: u32, message: String },

    #[error("broker rejected order for {instrument}: {reason}")]
    BrokerRejection { instrument: String, reason: String },

    #[error("ambiguous outcome for {instrument}; reconciliation required")]
    AmbiguousOutcome { instrument: String },

    #[error("unresolved state conflict on {0}")]
    Conflict(#[from] ConflictError),

    #[error("store failure: {0}")]
    Store(StoreError),

    #[error("unknown instrument {0}")]
    UnknownInstrument(String),
}

impl From<StoreError> for ExecutionError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::Conflict(c) => ExecutionError::Conflict(c),
            other => ExecutionError::Store(other),
        }
    }
}

impl ExecutionError {
    /// Store durability failures suspend the instrument's worker
    pub fn is_store_failure(&self) -> bool {
        matches!(self, ExecutionError::Store(_))
    }
}

/// Raw tick that cannot be turned into a canonical tick
#[derive(Debug, Error, Clone, PartialEq)]
pub enum FeedError {
    #[error("unknown instrument {0}")]
    UnknownInstrument(String),

    #[error("invalid price {price} for {instrument}")]
    InvalidPrice { instrument: String, price: f64 },

    #[error("invalid volume {volume} for {instrument}")]
    InvalidVolume { instrument: String, volume: f64 },

    #[error("invalid timestamp {0}")]
    InvalidTimestamp(i64),
}

/// Invalid or missing configuration; fatal at startup
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to load configuration: {0}")]
    Load(#[from] config::ConfigError),

    #[error("invalid configuration: {0}")]
    Invalid(String),
}
