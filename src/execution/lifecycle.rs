//! Pure position/order state machine
//!
//! Every function takes the current record and returns the record to write,
//! or `None` when nothing changes. Persistence and broker calls live in the
//! coordinator.

use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::models::{
    BrokerEvent, BrokerEventKind, ClosedTrade, Direction, ExitReason, Instrument, Order,
    OrderPurpose, OrderStatus, OrderType, Position, PositionState, QUANTITY_EPSILON,
};
use crate::risk::RiskLimits;

/// Flat -> EntryPending with a fresh entry order
pub fn begin_entry(
    current: &Position,
    direction: Direction,
    quantity: f64,
    price: f64,
    order_type: OrderType,
    now: DateTime<Utc>,
) -> Option<Position> {
    if !current.is_flat() || current.open_order().is_some() || current.reconcile_required {
        return None;
    }
    let mut next = current.clone();
    next.reset_to_flat();
    next.state = PositionState::EntryPending;
    next.direction = Some(direction);
    next.active_order = Some(Order::new(
        &current.instrument,
        direction.entry_side(),
        order_type,
        quantity,
        price,
        OrderPurpose::Entry,
        now,
    ));
    Some(next)
}

/// Open -> ExitPending with an order for `quantity`, capped at what is held
pub fn begin_exit(
    current: &Position,
    reason: ExitReason,
    quantity: f64,
    price: f64,
    order_type: OrderType,
    now: DateTime<Utc>,
) -> Option<Position> {
    if current.state != PositionState::Open
        || current.open_order().is_some()
        || current.reconcile_required
        || current.quantity <= QUANTITY_EPSILON
    {
        return None;
    }
    let direction = current.direction?;
    let quantity = quantity.min(current.quantity);
    if quantity <= QUANTITY_EPSILON {
        return None;
    }

    let mut order = Order::new(
        &current.instrument,
        direction.exit_side(),
        order_type,
        quantity,
        price,
        OrderPurpose::Exit,
        now,
    );
    order.exit_reason = Some(reason);

    let mut next = current.clone();
    next.state = PositionState::ExitPending;
    next.active_order = Some(order);
    Some(next)
}

/// Apply one broker event to the active order and derive the position state
///
/// Events for other orders, for terminal orders, and fills that do not
/// increase the cumulative quantity are ignored, which makes replays harmless.
/// Returns the closed trade when an exit order finishes with a fill.
pub fn apply_event(
    current: &Position,
    event: &BrokerEvent,
    risk: &RiskLimits,
    instrument: &Instrument,
) -> Option<(Position, Option<ClosedTrade>)> {
    let order = current.active_order.as_ref()?;
    if order.id != event.order_id || order.is_terminal() {
        return None;
    }

    let previously_filled = order.filled_quantity;
    let mut order = order.clone();
    if order.broker_order_id.is_none() {
        order.broker_order_id = event.broker_order_id.clone();
    }

    match &event.kind {
        BrokerEventKind::Acknowledged => {
            if order.status != OrderStatus::Submitted {
                return None;
            }
            order.status = OrderStatus::Acknowledged;
        }
        BrokerEventKind::Fill {
            cumulative_quantity,
            avg_price,
        } => {
            if *cumulative_quantity <= order.filled_quantity + QUANTITY_EPSILON {
                return None;
            }
            order.filled_quantity = cumulative_quantity.min(order.quantity);
            order.avg_fill_price = Some(*avg_price);
            order.status = if order.remaining_quantity() <= QUANTITY_EPSILON {
                OrderStatus::Filled
            } else {
                OrderStatus::PartiallyFilled
            };
        }
        BrokerEventKind::Cancelled => order.status = OrderStatus::Cancelled,
        BrokerEventKind::Rejected { reason } => {
            order.status = OrderStatus::Rejected;
            order.reject_reason = Some(reason.clone());
        }
    }
    order.updated_at = event.timestamp;

    let mut next = current.clone();
    // Any event for the order proves the broker knows about it
    next.reconcile_required = false;

    let trade = match order.purpose {
        OrderPurpose::Entry => {
            apply_entry(&mut next, &order, event.timestamp, risk, instrument);
            None
        }
        OrderPurpose::Exit => {
            let sold = order.filled_quantity - previously_filled;
            apply_exit(&mut next, &order, sold, event.timestamp, risk, instrument)
        }
    };
    next.active_order = Some(order);
    Some((next, trade))
}

fn apply_entry(
    next: &mut Position,
    order: &Order,
    at: DateTime<Utc>,
    risk: &RiskLimits,
    instrument: &Instrument,
) {
    if order.has_fill() {
        next.state = PositionState::Open;
        next.quantity = order.filled_quantity;
        next.avg_entry_price = order.avg_fill_price;
        next.opened_at.get_or_insert(at);
        if let (Some(direction), Some(entry)) = (next.direction, order.avg_fill_price) {
            let levels = risk.protective_levels(instrument, direction, entry);
            next.stop_loss = Some(levels.stop_loss);
            next.take_profit = Some(levels.take_profit);
            next.second_take_profit = levels.second_take_profit;
        }
    } else if order.is_terminal() {
        // Rejected or cancelled with nothing executed
        next.reset_to_flat();
    }
}

fn apply_exit(
    next: &mut Position,
    order: &Order,
    sold: f64,
    at: DateTime<Utc>,
    risk: &RiskLimits,
    instrument: &Instrument,
) -> Option<ClosedTrade> {
    next.quantity = (next.quantity - sold).max(0.0);
    if !order.is_terminal() {
        return None;
    }

    // Whatever executed is booked now, even if the order ended early
    let trade = if order.has_fill() {
        closed_trade(next, order, at)
    } else {
        None
    };

    if next.quantity <= QUANTITY_EPSILON {
        next.reset_to_flat();
        return trade;
    }

    next.state = PositionState::Open;
    if order.has_fill() && order.exit_reason == Some(ExitReason::TakeProfit) {
        next.targets_hit = next.targets_hit.saturating_add(1);
        if next.targets_hit >= 2 && next.trailing_stop.is_none() {
            if let (Some(direction), Some(price)) = (next.direction, order.avg_fill_price) {
                next.trailing_stop = Some(risk.trailing_level(instrument, direction, price));
            }
        }
    }
    trade
}

fn closed_trade(position: &Position, order: &Order, at: DateTime<Utc>) -> Option<ClosedTrade> {
    let direction = position.direction?;
    let entry_price = position.avg_entry_price?;
    let exit_price = order.avg_fill_price?;
    let quantity = order.filled_quantity;

    Some(ClosedTrade {
        id: Uuid::new_v4(),
        instrument: position.instrument.clone(),
        direction,
        quantity,
        entry_price,
        exit_price,
        realized_pnl: ClosedTrade::pnl(direction, quantity, entry_price, exit_price),
        exit_reason: order.exit_reason.unwrap_or(ExitReason::Signal),
        opened_at: position.opened_at.unwrap_or(order.created_at),
        closed_at: at,
    })
}

/// Terminal failure of the active order reported outside the event stream
pub fn fail_order(
    current: &Position,
    order_id: Uuid,
    kind: BrokerEventKind,
    risk: &RiskLimits,
    instrument: &Instrument,
    now: DateTime<Utc>,
) -> Option<(Position, Option<ClosedTrade>)> {
    let event = BrokerEvent {
        order_id,
        broker_order_id: None,
        instrument: current.instrument.clone(),
        kind,
        timestamp: now,
    };
    apply_event(current, &event, risk, instrument)
}

/// Flag or clear the "outcome unknown" marker
pub fn set_reconcile_required(current: &Position, required: bool) -> Option<Position> {
    if current.reconcile_required == required {
        return None;
    }
    let mut next = current.clone();
    next.reconcile_required = required;
    Some(next)
}

/// Repair a pending state whose order is gone or terminal
///
/// Cannot happen through the normal transitions; guards against records
/// edited by hand or written by an older build.
pub fn repair_orphaned_pending(current: &Position) -> Option<Position> {
    if current.open_order().is_some() || current.reconcile_required {
        return None;
    }
    let mut next = current.clone();
    match current.state {
        PositionState::EntryPending if current.quantity > QUANTITY_EPSILON => {
            next.state = PositionState::Open
        }
        PositionState::EntryPending => next.reset_to_flat(),
        PositionState::ExitPending => next.state = PositionState::Open,
        _ => return None,
    }
    Some(next)
}
