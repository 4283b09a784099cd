use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Quantities closer than this are treated as equal
pub const QUANTITY_EPSILON: f64 = 1e-9;

/// Tradable instrument reference data, loaded once at startup
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Instrument {
    pub id: String,
    pub tick_size: f64,
    pub min_order_size: f64,
}

impl Instrument {
    /// Round a price to the nearest multiple of the tick size
    pub fn round_price(&self, price: f64) -> f64 {
        (price / self.tick_size).round() * self.tick_size
    }

    /// Round a quantity down to a whole number of minimum lots
    pub fn round_quantity_down(&self, quantity: f64) -> f64 {
        // Nudge before flooring so 0.3 / 0.1 doesn't become 2.999.. lots
        let lots = (quantity / self.min_order_size + QUANTITY_EPSILON).floor();
        lots * self.min_order_size
    }
}

/// Canonical market event produced by the feed adapter
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Tick {
    pub instrument: String,
    pub timestamp: DateTime<Utc>,
    pub price: f64,
    pub volume: f64,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    Long,
    Short,
}

impl Direction {
    pub fn opposite(self) -> Self {
        match self {
            Direction::Long => Direction::Short,
            Direction::Short => Direction::Long,
        }
    }

    /// Side of the order that opens a position in this direction
    pub fn entry_side(self) -> Side {
        match self {
            Direction::Long => Side::Buy,
            Direction::Short => Side::Sell,
        }
    }

    /// Side of the order that closes a position in this direction
    pub fn exit_side(self) -> Side {
        self.entry_side().opposite()
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Direction::Long => "long",
            Direction::Short => "short",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "long" => Some(Direction::Long),
            "short" => Some(Direction::Short),
            _ => None,
        }
    }
}

/// Breakout signal, consumed exactly once by the coordinator
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Signal {
    pub instrument: String,
    pub direction: Direction,
    pub trigger_price: f64,
    pub strength: f64,
    pub generated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Side {
    Buy,
    Sell,
}

impl Side {
    pub fn opposite(self) -> Self {
        match self {
            Side::Buy => Side::Sell,
            Side::Sell => Side::Buy,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Side::Buy => "buy",
            Side::Sell => "sell",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "buy" => Some(Side::Buy),
            "sell" => Some(Side::Sell),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum OrderType {
    #[default]
    Market,
    Limit,
}

impl OrderType {
    pub fn as_str(self) -> &'static str {
        match self {
            OrderType::Market => "market",
            OrderType::Limit => "limit",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "market" => Some(OrderType::Market),
            "limit" => Some(OrderType::Limit),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum OrderStatus {
    Submitted,
    Acknowledged,
    PartiallyFilled,
    Filled,
    Cancelled,
    Rejected,
}

impl OrderStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            OrderStatus::Filled | OrderStatus::Cancelled | OrderStatus::Rejected
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            OrderStatus::Submitted => "submitted",
            OrderStatus::Acknowledged => "acknowledged",
            OrderStatus::PartiallyFilled => "partially_filled",
            OrderStatus::Filled => "filled",
            OrderStatus::Cancelled => "cancelled",
            OrderStatus::Rejected => "rejected",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "submitted" => Some(OrderStatus::Submitted),
            "acknowledged" => Some(OrderStatus::Acknowledged),
            "partially_filled" => Some(OrderStatus::PartiallyFilled),
            "filled" => Some(OrderStatus::Filled),
            "cancelled" => Some(OrderStatus::Cancelled),
            "rejected" => Some(OrderStatus::Rejected),
            _ => None,
        }
    }
}

/// Whether an order opens or closes the position it belongs to
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum OrderPurpose {
    Entry,
    Exit,
}

impl OrderPurpose {
    pub fn as_str(self) -> &'static str {
        match self {
            OrderPurpose::Entry => "entry",
            OrderPurpose::Exit => "exit",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "entry" => Some(OrderPurpose::Entry),
            "exit" => Some(OrderPurpose::Exit),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ExitReason {
    Signal,   // Opposite-direction breakout
    StopLoss,
    TakeProfit,
    TrailingStop,
}

impl ExitReason {
    pub fn as_str(self) -> &'static str {
        match self {
            ExitReason::Signal => "signal",
            ExitReason::StopLoss => "stop_loss",
            ExitReason::TakeProfit => "take_profit",
            ExitReason::TrailingStop => "trailing_stop",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "signal" => Some(ExitReason::Signal),
            "stop_loss" => Some(ExitReason::StopLoss),
            "take_profit" => Some(ExitReason::TakeProfit),
            "trailing_stop" => Some(ExitReason::TrailingStop),
            _ => None,
        }
    }
}

/// Order as the engine tracks it
///
/// `id` is generated locally before submission and doubles as the broker's
/// client order id, so resubmits and status fetches are idempotent.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Order {
    pub id: Uuid,
    pub broker_order_id: Option<String>,
    pub instrument: String,
    pub side: Side,
    pub order_type: OrderType,
    pub quantity: f64,
    pub price: f64, // Limit price, or reference price for market orders
    pub status: OrderStatus,
    pub filled_quantity: f64,
    pub avg_fill_price: Option<f64>,
    pub purpose: OrderPurpose,
    pub exit_reason: Option<ExitReason>,
    pub reject_reason: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Order {
    pub fn new(
        instrument: &str,
        side: Side,
        order_type: OrderType,
        quantity: f64,
        price: f64,
        purpose: OrderPurpose,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            broker_order_id: None,
            instrument: instrument.to_string(),
            side,
            order_type,
            quantity,
            price,
            status: OrderStatus::Submitted,
            filled_quantity: 0.0,
            avg_fill_price: None,
            purpose,
            exit_reason: None,
            reject_reason: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    pub fn remaining_quantity(&self) -> f64 {
        (self.quantity - self.filled_quantity).max(0.0)
    }

    pub fn has_fill(&self) -> bool {
        self.filled_quantity > QUANTITY_EPSILON
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum PositionState {
    Flat,
    EntryPending,
    Open,
    ExitPending,
}

impl PositionState {
    pub fn as_str(self) -> &'static str {
        match self {
            PositionState::Flat => "flat",
            PositionState::EntryPending => "entry_pending",
            PositionState::Open => "open",
            PositionState::ExitPending => "exit_pending",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "flat" => Some(PositionState::Flat),
            "entry_pending" => Some(PositionState::EntryPending),
            "open" => Some(PositionState::Open),
            "exit_pending" => Some(PositionState::ExitPending),
            _ => None,
        }
    }
}

/// What the bot believes it owns for one instrument
///
/// The in-flight order lives inside the record so a position transition and
/// its order update are always written together. `version` is bumped by the
/// store on every successful compare-and-swap.
///
/// Profit is taken in stages: `take_profit` and `second_take_profit` each
/// close part of the position, counted in `targets_hit`. After the second
/// target the remainder rides a `trailing_stop` that only ever tightens.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Position {
    pub instrument: String,
    pub state: PositionState,
    pub direction: Option<Direction>,
    pub quantity: f64,
    pub avg_entry_price: Option<f64>,
    pub active_order: Option<Order>,
    pub stop_loss: Option<f64>,
    pub take_profit: Option<f64>,
    pub second_take_profit: Option<f64>,
    pub trailing_stop: Option<f64>,
    pub targets_hit: u8,
    pub opened_at: Option<DateTime<Utc>>,
    pub reconcile_required: bool,
    pub version: i64,
    pub updated_at: DateTime<Utc>,
}

impl Position {
    /// Flat position for an instrument that has never traded
    pub fn flat(instrument: &str) -> Self {
        Self {
            instrument: instrument.to_string(),
            state: PositionState::Flat,
            direction: None,
            quantity: 0.0,
            avg_entry_price: None,
            active_order: None,
            stop_loss: None,
            take_profit: None,
            second_take_profit: None,
            trailing_stop: None,
            targets_hit: 0,
            opened_at: None,
            reconcile_required: false,
            version: 0,
            updated_at: Utc::now(),
        }
    }

    pub fn is_flat(&self) -> bool {
        self.state == PositionState::Flat
    }

    /// In-flight order, if it has not reached a terminal status
    pub fn open_order(&self) -> Option<&Order> {
        self.active_order.as_ref().filter(|o| !o.is_terminal())
    }

    /// Reset to flat, keeping identity and version lineage
    pub fn reset_to_flat(&mut self) {
        self.state = PositionState::Flat;
        self.direction = None;
        self.quantity = 0.0;
        self.avg_entry_price = None;
        self.active_order = None;
        self.stop_loss = None;
        self.take_profit = None;
        self.second_take_profit = None;
        self.trailing_stop = None;
        self.targets_hit = 0;
        self.opened_at = None;
    }
}

/// Fill and status notifications coming back from the broker
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BrokerEvent {
    pub order_id: Uuid,
    pub broker_order_id: Option<String>,
    pub instrument: String,
    pub kind: BrokerEventKind,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BrokerEventKind {
    Acknowledged,
    /// Quantities are cumulative for the order, which makes replays harmless
    Fill {
        cumulative_quantity: f64,
        avg_price: f64,
    },
    Cancelled,
    Rejected {
        reason: String,
    },
}

/// Archived exit, written when an exit order finishes with something executed
///
/// A position closed in stages produces one record per exit order.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ClosedTrade {
    pub id: Uuid,
    pub instrument: String,
    pub direction: Direction,
    pub quantity: f64,
    pub entry_price: f64,
    pub exit_price: f64,
    pub realized_pnl: f64,
    pub exit_reason: ExitReason,
    pub opened_at: DateTime<Utc>,
    pub closed_at: DateTime<Utc>,
}

impl ClosedTrade {
    pub fn pnl(direction: Direction, quantity: f64, entry_price: f64, exit_price: f64) -> f64 {
        match direction {
            Direction::Long => (exit_price - entry_price) * quantity,
            Direction::Short => (entry_price - exit_price) * quantity,
        }
    }
}
