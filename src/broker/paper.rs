use std::collections::{HashMap, VecDeque};

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::Mutex;
use tokio::time::Duration;
use uuid::Uuid;

use super::{Broker, OrderRequest, OrderSnapshot};
use crate::error::BrokerError;
use crate::models::{BrokerEvent, BrokerEventKind, OrderStatus, QUANTITY_EPSILON};

/// How the simulated venue fills accepted orders
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FillMode {
    /// Fill the whole quantity at the request price on acceptance
    #[default]
    Immediate,
    /// Only acknowledge; fills are driven with [`PaperBroker::fill`]
    Manual,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PaperOp {
    Submit,
    Cancel,
    Fetch,
    Poll,
}

/// One-shot failure injected into the next matching call
#[derive(Debug, Clone, PartialEq)]
pub enum PaperFault {
    Transient,
    Reject(String),
    /// Order is accepted, but the caller only sees an ambiguous failure
    AcceptThenAmbiguous,
    /// Order is lost, and the caller sees an ambiguous failure
    DropThenAmbiguous,
    /// Respond normally after a delay (exercises caller timeouts)
    Delay(Duration),
}

#[derive(Default)]
struct PaperState {
    orders: HashMap<Uuid, OrderSnapshot>,
    quantities: HashMap<Uuid, f64>,
    events: VecDeque<BrokerEvent>,
    faults: VecDeque<(PaperOp, PaperFault)>,
    calls: HashMap<PaperOp, usize>,
    next_id: u64,
}

impl PaperState {
    fn take_fault(&mut self, op: PaperOp) -> Option<PaperFault> {
        *self.calls.entry(op).or_insert(0) += 1;
        let index = self.faults.iter().position(|(o, _)| *o == op)?;
        self.faults.remove(index).map(|(_, fault)| fault)
    }

    fn publish(&mut self, snapshot: &OrderSnapshot, kind: BrokerEventKind) {
        self.events.push_back(BrokerEvent {
            order_id: snapshot.client_order_id,
            broker_order_id: snapshot.broker_order_id.clone(),
            instrument: snapshot.instrument.clone(),
            kind,
            timestamp: Utc::now(),
        });
    }
}

/// In-memory simulated venue
///
/// Used for paper trading and as the broker double in tests. Orders are
/// deduplicated by client order id like a real exchange would.
pub struct PaperBroker {
    state: Mutex<PaperState>,
    fill_mode: FillMode,
}

impl PaperBroker {
    pub fn new(fill_mode: FillMode) -> Self {
        Self {
            state: Mutex::new(PaperState::default()),
            fill_mode,
        }
    }

    /// Queue a fault for the next call of `op`
    pub async fn inject(&self, op: PaperOp, fault: PaperFault) {
        self.state.lock().await.faults.push_back((op, fault));
    }

    /// Number of calls made for `op`, including failed ones
    pub async fn calls(&self, op: PaperOp) -> usize {
        self.state.lock().await.calls.get(&op).copied().unwrap_or(0)
    }

    pub async fn order(&self, client_order_id: Uuid) -> Option<OrderSnapshot> {
        self.state.lock().await.orders.get(&client_order_id).cloned()
    }

    pub async fn orders(&self) -> Vec<OrderSnapshot> {
        self.state.lock().await.orders.values().cloned().collect()
    }

    /// Execute `quantity` more of an order at `price`
    pub async fn fill(
        &self,
        client_order_id: Uuid,
        quantity: f64,
        price: f64,
    ) -> Result<(), BrokerError> {
        let mut state = self.state.lock().await;
        let order_quantity = state
            .quantities
            .get(&client_order_id)
            .copied()
            .unwrap_or(quantity);
        let snapshot = state
            .orders
            .get_mut(&client_order_id)
            .ok_or_else(|| BrokerError::NotFound(client_order_id.to_string()))?;
        if snapshot.status.is_terminal() {
            return Err(BrokerError::AlreadyFilled(client_order_id.to_string()));
        }

        let previous = snapshot.filled_quantity;
        let filled = (previous + quantity).min(order_quantity);
        let prev_avg = snapshot.avg_fill_price.unwrap_or(price);
        snapshot.avg_fill_price = Some((prev_avg * previous + price * (filled - previous)) / filled);
        snapshot.filled_quantity = filled;
        snapshot.status = if order_quantity - filled <= QUANTITY_EPSILON {
            OrderStatus::Filled
        } else {
            OrderStatus::PartiallyFilled
        };
        snapshot.updated_at = Utc::now();

        let snapshot = snapshot.clone();
        let avg_price = snapshot.avg_fill_price.unwrap_or(price);
        state.publish(
            &snapshot,
            BrokerEventKind::Fill {
                cumulative_quantity: filled,
                avg_price,
            },
        );
        Ok(())
    }

    /// Venue-side rejection of an acknowledged order
    pub async fn reject(&self, client_order_id: Uuid, reason: &str) -> Result<(), BrokerError> {
        let mut state = self.state.lock().await;
        let snapshot = state
            .orders
            .get_mut(&client_order_id)
            .ok_or_else(|| BrokerError::NotFound(client_order_id.to_string()))?;
        snapshot.status = OrderStatus::Rejected;
        snapshot.reason = Some(reason.to_string());
        snapshot.updated_at = Utc::now();
        let snapshot = snapshot.clone();
        state.publish(
            &snapshot,
            BrokerEventKind::Rejected {
                reason: reason.to_string(),
            },
        );
        Ok(())
    }

    fn accept(&self, state: &mut PaperState, request: &OrderRequest) -> OrderSnapshot {
        state.next_id += 1;
        let mut snapshot = OrderSnapshot {
            client_order_id: request.client_order_id,
            broker_order_id: Some(format!("PAPER-{}", state.next_id)),
            instrument: request.instrument.clone(),
            status: OrderStatus::Acknowledged,
            filled_quantity: 0.0,
            avg_fill_price: None,
            reason: None,
            updated_at: Utc::now(),
        };
        state.publish(&snapshot, BrokerEventKind::Acknowledged);

        if self.fill_mode == FillMode::Immediate {
            snapshot.status = OrderStatus::Filled;
            snapshot.filled_quantity = request.quantity;
            snapshot.avg_fill_price = Some(request.price);
            state.publish(
                &snapshot,
                BrokerEventKind::Fill {
                    cumulative_quantity: request.quantity,
                    avg_price: request.price,
                },
            );
        }

        state
            .quantities
            .insert(request.client_order_id, request.quantity);
        state
            .orders
            .insert(request.client_order_id, snapshot.clone());
        snapshot
    }
}

impl Default for PaperBroker {
    fn default() -> Self {
        Self::new(FillMode::Immediate)
    }
}

#[async_trait]
impl Broker for PaperBroker {
    async fn submit_order(&self, request: &OrderRequest) -> Result<OrderSnapshot, BrokerError> {
        let fault = self.state.lock().await.take_fault(PaperOp::Submit);
        if let Some(PaperFault::Delay(delay)) = fault {
            tokio::time::sleep(delay).await;
        }

        let mut state = self.state.lock().await;
        if state.orders.contains_key(&request.client_order_id) {
            return Err(BrokerError::DuplicateOrder(request.client_order_id.to_string()));
        }

        match fault {
            Some(PaperFault::Transient) => {
                Err(BrokerError::Transient("simulated connection reset".to_string()))
            }
            Some(PaperFault::Reject(reason)) => {
                state.next_id += 1;
                let snapshot = OrderSnapshot {
                    client_order_id: request.client_order_id,
                    broker_order_id: None,
                    instrument: request.instrument.clone(),
                    status: OrderStatus::Rejected,
                    filled_quantity: 0.0,
                    avg_fill_price: None,
                    reason: Some(reason.clone()),
                    updated_at: Utc::now(),
                };
                state.orders.insert(request.client_order_id, snapshot);
                Err(BrokerError::Rejected(reason))
            }
            Some(PaperFault::AcceptThenAmbiguous) => {
                self.accept(&mut state, request);
                Err(BrokerError::Ambiguous("simulated response loss".to_string()))
            }
            Some(PaperFault::DropThenAmbiguous) => {
                Err(BrokerError::Ambiguous("simulated request loss".to_string()))
            }
            Some(PaperFault::Delay(_)) | None => Ok(self.accept(&mut state, request)),
        }
    }

    async fn cancel_order(
        &self,
        client_order_id: Uuid,
        _instrument: &str,
    ) -> Result<(), BrokerError> {
        let mut state = self.state.lock().await;
        match state.take_fault(PaperOp::Cancel) {
            Some(PaperFault::Transient) => {
                return Err(BrokerError::Transient("simulated connection reset".to_string()))
            }
            Some(PaperFault::AcceptThenAmbiguous) | Some(PaperFault::DropThenAmbiguous) => {
                return Err(BrokerError::Ambiguous("simulated timeout".to_string()))
            }
            Some(PaperFault::Reject(reason)) => return Err(BrokerError::Rejected(reason)),
            _ => {}
        }

        let snapshot = state
            .orders
            .get_mut(&client_order_id)
            .ok_or_else(|| BrokerError::NotFound(client_order_id.to_string()))?;
        match snapshot.status {
            OrderStatus::Filled => Err(BrokerError::AlreadyFilled(client_order_id.to_string())),
            OrderStatus::Cancelled | OrderStatus::Rejected => Ok(()),
            _ => {
                snapshot.status = OrderStatus::Cancelled;
                snapshot.updated_at = Utc::now();
                let snapshot = snapshot.clone();
                state.publish(&snapshot, BrokerEventKind::Cancelled);
                Ok(())
            }
        }
    }

    async fn fetch_order_status(
        &self,
        client_order_id: Uuid,
        _instrument: &str,
    ) -> Result<OrderSnapshot, BrokerError> {
        let mut state = self.state.lock().await;
        match state.take_fault(PaperOp::Fetch) {
            Some(PaperFault::Transient) => {
                return Err(BrokerError::Transient("simulated connection reset".to_string()))
            }
            Some(PaperFault::AcceptThenAmbiguous) | Some(PaperFault::DropThenAmbiguous) => {
                return Err(BrokerError::Ambiguous("simulated timeout".to_string()))
            }
            _ => {}
        }
        state
            .orders
            .get(&client_order_id)
            .cloned()
            .ok_or_else(|| BrokerError::NotFound(client_order_id.to_string()))
    }

    async fn poll_events(&self) -> Result<Vec<BrokerEvent>, BrokerError> {
        let mut state = self.state.lock().await;
        if let Some(PaperFault::Transient) = state.take_fault(PaperOp::Poll) {
            return Err(BrokerError::Transient("simulated connection reset".to_string()));
        }
        Ok(state.events.drain(..).collect())
    }

    fn name(&self) -> &str {
        "paper"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{OrderType, Side};

    fn request(quantity: f64) -> OrderRequest {
        OrderRequest {
            client_order_id: Uuid::new_v4(),
            instrument: "DOGE/USDT".to_string(),
            side: Side::Buy,
            order_type: OrderType::Market,
            quantity,
            price: 0.15,
        }
    }

    #[tokio::test]
    async fn test_immediate_fill_publishes_ack_and_fill() {
        let broker = PaperBroker::new(FillMode::Immediate);
        let req = request(100.0);
        let snapshot = broker.submit_order(&req).await.unwrap();
        assert_eq!(snapshot.status, OrderStatus::Filled);

        let events = broker.poll_events().await.unwrap();
        assert_eq!(events.len(), 2);
        assert!(broker.poll_events().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_duplicate_client_id_detected() {
        let broker = PaperBroker::new(FillMode::Manual);
        let req = request(10.0);
        broker.submit_order(&req).await.unwrap();
        assert!(matches!(
            broker.submit_order(&req).await,
            Err(BrokerError::DuplicateOrder(_))
        ));
    }

    #[tokio::test]
    async fn test_partial_fills_accumulate() {
        let broker = PaperBroker::new(FillMode::Manual);
        let req = request(100.0);
        broker.submit_order(&req).await.unwrap();

        broker.fill(req.client_order_id, 40.0, 1.0).await.unwrap();
        broker.fill(req.client_order_id, 60.0, 2.0).await.unwrap();

        let snapshot = broker.order(req.client_order_id).await.unwrap();
        assert_eq!(snapshot.status, OrderStatus::Filled);
        assert!((snapshot.avg_fill_price.unwrap() - 1.6).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_accept_then_ambiguous_keeps_order() {
        let broker = PaperBroker::new(FillMode::Manual);
        broker
            .inject(PaperOp::Submit, PaperFault::AcceptThenAmbiguous)
            .await;
        let req = request(10.0);

        assert!(matches!(
            broker.submit_order(&req).await,
            Err(BrokerError::Ambiguous(_))
        ));
        let snapshot = broker
            .fetch_order_status(req.client_order_id, &req.instrument)
            .await
            .unwrap();
        assert_eq!(snapshot.status, OrderStatus::Acknowledged);
    }

    #[tokio::test]
    async fn test_cancel_filled_order_reports_already_filled() {
        let broker = PaperBroker::new(FillMode::Immediate);
        let req = request(10.0);
        broker.submit_order(&req).await.unwrap();
        assert!(matches!(
            broker.cancel_order(req.client_order_id, &req.instrument).await,
            Err(BrokerError::AlreadyFilled(_))
        ));
    }

    #[tokio::test]
    async fn test_fault_applies_once() {
        let broker = PaperBroker::new(FillMode::Manual);
        broker.inject(PaperOp::Submit, PaperFault::Transient).await;
        let req = request(10.0);
        assert!(broker.submit_order(&req).await.unwrap_err().is_transient());
        assert!(broker.submit_order(&req).await.is_ok());
        assert_eq!(broker.calls(PaperOp::Submit).await, 2);
    }
}
