// Broker / exchange adapters
pub mod paper;
pub mod rest;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::BrokerError;
use crate::models::{BrokerEvent, BrokerEventKind, Order, OrderStatus, OrderType, Side};

pub use paper::{FillMode, PaperBroker, PaperFault, PaperOp};
pub use rest::RestBroker;

/// What goes over the wire when an order is placed
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct OrderRequest {
    pub client_order_id: Uuid,
    pub instrument: String,
    pub side: Side,
    pub order_type: OrderType,
    pub quantity: f64,
    pub price: f64,
}

impl From<&Order> for OrderRequest {
    fn from(order: &Order) -> Self {
        Self {
            client_order_id: order.id,
            instrument: order.instrument.clone(),
            side: order.side,
            order_type: order.order_type,
            quantity: order.quantity,
            price: order.price,
        }
    }
}

/// Broker's authoritative view of one order
///
/// Returned by `submit_order` (as the acknowledgment) and `fetch_order_status`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct OrderSnapshot {
    pub client_order_id: Uuid,
    pub broker_order_id: Option<String>,
    pub instrument: String,
    pub status: OrderStatus,
    #[serde(default)]
    pub filled_quantity: f64,
    pub avg_fill_price: Option<f64>,
    pub reason: Option<String>,
    pub updated_at: DateTime<Utc>,
}

impl OrderSnapshot {
    /// Replay this snapshot as the events that would have produced it
    ///
    /// Fills are cumulative, so applying these on top of state that already
    /// saw some of them is a no-op for the parts already applied.
    pub fn to_events(&self) -> Vec<BrokerEvent> {
        let event = |kind| BrokerEvent {
            order_id: self.client_order_id,
            broker_order_id: self.broker_order_id.clone(),
            instrument: self.instrument.clone(),
            kind,
            timestamp: self.updated_at,
        };

        let mut events = Vec::new();
        if self.status != OrderStatus::Submitted && self.status != OrderStatus::Rejected {
            events.push(event(BrokerEventKind::Acknowledged));
        }
        if self.filled_quantity > 0.0 {
            if let Some(avg_price) = self.avg_fill_price {
                events.push(event(BrokerEventKind::Fill {
                    cumulative_quantity: self.filled_quantity,
                    avg_price,
                }));
            }
        }
        match self.status {
            OrderStatus::Cancelled => events.push(event(BrokerEventKind::Cancelled)),
            OrderStatus::Rejected => events.push(event(BrokerEventKind::Rejected {
                reason: self
                    .reason
                    .clone()
                    .unwrap_or_else(|| "rejected".to_string()),
            })),
            _ => {}
        }
        events
    }
}

/// Capability interface to an exchange
///
/// Every call may fail transiently; callers wrap them in
/// [`crate::execution::retry::call_with_retry`]. The client order id is the
/// idempotency key for all of them.
#[async_trait]
pub trait Broker: Send + Sync {
    async fn submit_order(&self, request: &OrderRequest) -> Result<OrderSnapshot, BrokerError>;

    async fn cancel_order(&self, client_order_id: Uuid, instrument: &str)
        -> Result<(), BrokerError>;

    async fn fetch_order_status(
        &self,
        client_order_id: Uuid,
        instrument: &str,
    ) -> Result<OrderSnapshot, BrokerError>;

    /// Drain fill / status events published since the previous poll
    async fn poll_events(&self) -> Result<Vec<BrokerEvent>, BrokerError>;

    fn name(&self) -> &str;
}
