// Pre-trade risk gate and protective exit levels
use chrono::{DateTime, NaiveTime, Utc};
use thiserror::Error;

use crate::config::RiskConfig;
use crate::models::{Direction, ExitReason, Instrument, Position, PositionState, QUANTITY_EPSILON};

/// Portfolio-wide counts the gate is evaluated against
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RiskSnapshot {
    pub open_positions: usize, // Non-flat positions across all instruments
    pub stop_losses_today: u32,
}

/// Why an entry was refused
#[derive(Debug, Clone, PartialEq, Error)]
pub enum RiskTrip {
    #[error("max open positions reached ({open}/{limit})")]
    MaxOpenPositions { open: usize, limit: usize },

    #[error("daily stop-loss limit reached ({count}/{limit}), entries paused until UTC midnight")]
    DailyStopLosses { count: u32, limit: u32 },

    #[error("order size {quantity} below minimum {min}")]
    BelowMinimumSize { quantity: f64, min: f64 },
}

#[derive(Debug, Clone)]
pub struct RiskLimits {
    config: RiskConfig,
}

impl RiskLimits {
    pub fn new(config: RiskConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &RiskConfig {
        &self.config
    }

    pub fn check(&self, snapshot: &RiskSnapshot) -> Result<(), RiskTrip> {
        if snapshot.open_positions >= self.config.max_open_positions {
            return Err(RiskTrip::MaxOpenPositions {
                open: snapshot.open_positions,
                limit: self.config.max_open_positions,
            });
        }

        if self.config.max_daily_stop_losses > 0
            && snapshot.stop_losses_today >= self.config.max_daily_stop_losses
        {
            return Err(RiskTrip::DailyStopLosses {
                count: snapshot.stop_losses_today,
                limit: self.config.max_daily_stop_losses,
            });
        }

        Ok(())
    }

    /// Entry quantity for a fixed notional, rounded down to whole lots
    pub fn size(&self, instrument: &Instrument, price: f64) -> Result<f64, RiskTrip> {
        let raw = if price > 0.0 {
            self.config.position_notional / price
        } else {
            0.0
        };
        let quantity = instrument.round_quantity_down(raw);
        if quantity < instrument.min_order_size {
            return Err(RiskTrip::BelowMinimumSize {
                quantity: raw,
                min: instrument.min_order_size,
            });
        }
        Ok(quantity)
    }

    /// Stop-loss and profit targets for a fill at `entry_price`
    pub fn protective_levels(
        &self,
        instrument: &Instrument,
        direction: Direction,
        entry_price: f64,
    ) -> ProtectiveLevels {
        let level = |pct: f64, favourable: bool| {
            let up = favourable == (direction == Direction::Long);
            let price = if up {
                entry_price * (1.0 + pct)
            } else {
                entry_price * (1.0 - pct)
            };
            instrument.round_price(price)
        };
        ProtectiveLevels {
            stop_loss: level(self.config.stop_loss_pct, false),
            take_profit: level(self.config.take_profit_pct, true),
            second_take_profit: (self.config.first_target_fraction < 1.0)
                .then(|| level(self.config.second_take_profit_pct, true)),
        }
    }

    /// Protective exit triggered by `price`, if any
    ///
    /// Only open positions with no order in flight are eligible. Stops close
    /// everything. A target closes its share of what is held, or everything
    /// when either side of the split would be below the minimum order size.
    pub fn protective_exit(
        &self,
        instrument: &Instrument,
        position: &Position,
        price: f64,
    ) -> Option<ProtectiveExit> {
        if position.state != PositionState::Open || position.open_order().is_some() {
            return None;
        }
        let direction = position.direction?;
        let against = |level: f64| match direction {
            Direction::Long => price <= level,
            Direction::Short => price >= level,
        };
        let beyond = |level: f64| match direction {
            Direction::Long => price >= level,
            Direction::Short => price <= level,
        };

        if position.stop_loss.is_some_and(|l| against(l)) {
            return Some(ProtectiveExit::full(ExitReason::StopLoss, position));
        }
        if position.trailing_stop.is_some_and(|l| against(l)) {
            return Some(ProtectiveExit::full(ExitReason::TrailingStop, position));
        }

        let (target, fraction) = match position.targets_hit {
            0 => (position.take_profit, self.config.first_target_fraction),
            1 => (position.second_take_profit, self.config.second_target_fraction),
            _ => return None,
        };
        if !target.is_some_and(|l| beyond(l)) {
            return None;
        }
        Some(ProtectiveExit {
            reason: ExitReason::TakeProfit,
            quantity: target_quantity(instrument, position.quantity, fraction),
        })
    }

    /// Trailing stop level for a position last seen at `price`
    pub fn trailing_level(&self, instrument: &Instrument, direction: Direction, price: f64) -> f64 {
        let pct = self.config.trailing_stop_pct;
        instrument.round_price(match direction {
            Direction::Long => price * (1.0 - pct),
            Direction::Short => price * (1.0 + pct),
        })
    }

    /// Tightened trailing stop for `price`, if the stop is armed and would move
    pub fn trail(&self, instrument: &Instrument, position: &Position, price: f64) -> Option<f64> {
        if position.state != PositionState::Open {
            return None;
        }
        let current = position.trailing_stop?;
        let direction = position.direction?;
        let candidate = self.trailing_level(instrument, direction, price);
        let tighter = match direction {
            Direction::Long => candidate > current,
            Direction::Short => candidate < current,
        };
        tighter.then_some(candidate)
    }
}

/// Levels attached to a position when its entry fills
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ProtectiveLevels {
    pub stop_loss: f64,
    pub take_profit: f64,
    /// None when the first target closes the whole position
    pub second_take_profit: Option<f64>,
}

/// Exit called for by a protective level
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ProtectiveExit {
    pub reason: ExitReason,
    pub quantity: f64,
}

impl ProtectiveExit {
    fn full(reason: ExitReason, position: &Position) -> Self {
        Self {
            reason,
            quantity: position.quantity,
        }
    }
}

fn target_quantity(instrument: &Instrument, held: f64, fraction: f64) -> f64 {
    if fraction >= 1.0 {
        return held;
    }
    let part = instrument.round_quantity_down(held * fraction);
    let rest = held - part;
    if part < instrument.min_order_size || rest + QUANTITY_EPSILON < instrument.min_order_size {
        held
    } else {
        part
    }
}

/// Start of the UTC day containing `now`
pub fn utc_day_start(now: DateTime<Utc>) -> DateTime<Utc> {
    now.date_naive().and_time(NaiveTime::MIN).and_utc()
}
