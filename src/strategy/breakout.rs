use std::collections::HashMap;

use chrono::{DateTime, Utc};

use super::window::{Bar, RollingWindow};
use super::{strictly_above, strictly_below, Detector};
use crate::config::DetectorConfig;
use crate::models::{Direction, Signal, Tick};

/// Detector regime for one instrument
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Regime {
    Idle,     // Window not yet full
    Watching, // Window full, no level in reach
    Armed,    // Price is close to a breakout level
}

/// Per-instrument detector state, owned by that instrument's worker
#[derive(Debug, Clone)]
pub struct DetectorState {
    window: RollingWindow,
    regime: Regime,
    last_timestamp: Option<DateTime<Utc>>,
    last_signal_at: Option<DateTime<Utc>>,
    armed_since: Option<DateTime<Utc>>,
    dropped_ticks: u64,
}

impl DetectorState {
    fn new(lookback: usize) -> Self {
        Self {
            window: RollingWindow::new(lookback),
            regime: Regime::Idle,
            last_timestamp: None,
            last_signal_at: None,
            armed_since: None,
            dropped_ticks: 0,
        }
    }

    pub fn regime(&self) -> Regime {
        self.regime
    }

    pub fn window(&self) -> &RollingWindow {
        &self.window
    }

    pub fn last_signal_at(&self) -> Option<DateTime<Utc>> {
        self.last_signal_at
    }

    /// Ticks discarded for arriving out of timestamp order
    pub fn dropped_ticks(&self) -> u64 {
        self.dropped_ticks
    }
}

/// Range breakout detector with volume confirmation
///
/// A long breakout needs `price > rolling_high * (1 + threshold)` and a short
/// one `price < rolling_low * (1 - threshold)`; both also need
/// `volume > volume_multiple * rolling_avg_volume`. The rolling statistics
/// cover the `lookback` ticks before the one being evaluated. All comparisons
/// are strict beyond a relative epsilon, so prints exactly on a level never
/// trigger.
#[derive(Debug, Clone)]
pub struct BreakoutDetector {
    config: DetectorConfig,
    states: HashMap<String, DetectorState>,
}

/// Levels derived from the current window
struct Levels {
    high: f64,
    low: f64,
    long_trigger: f64,
    short_trigger: f64,
    avg_volume: f64,
}

impl BreakoutDetector {
    pub fn new(config: DetectorConfig) -> Self {
        Self {
            config,
            states: HashMap::new(),
        }
    }

    pub fn config(&self) -> &DetectorConfig {
        &self.config
    }

    pub fn state(&self, instrument_id: &str) -> Option<&DetectorState> {
        self.states.get(instrument_id)
    }

    fn levels(&self, window: &RollingWindow) -> Option<Levels> {
        let high = window.high()?;
        let low = window.low()?;
        let avg_volume = window.avg_volume()?;
        let threshold = self.config.breakout_threshold_pct;

        Some(Levels {
            high,
            low,
            long_trigger: high * (1.0 + threshold),
            short_trigger: low * (1.0 - threshold),
            avg_volume,
        })
    }

    fn breakout_direction(&self, levels: &Levels, tick: &Tick) -> Option<Direction> {
        let eps = self.config.epsilon;

        // Volume confirms the move; no volume history means no confirmation
        if levels.avg_volume <= 0.0 {
            return None;
        }
        let required_volume = levels.avg_volume * self.config.volume_multiple;
        if !strictly_above(tick.volume, required_volume, eps) {
            return None;
        }

        if strictly_above(tick.price, levels.long_trigger, eps) {
            Some(Direction::Long)
        } else if strictly_below(tick.price, levels.short_trigger, eps) {
            Some(Direction::Short)
        } else {
            None
        }
    }

    /// Price within `arm_distance_pct` of a trigger without crossing it
    fn is_approaching(&self, levels: &Levels, price: f64) -> bool {
        let arm = self.config.arm_distance_pct;
        let near_long = price >= levels.long_trigger * (1.0 - arm) && price <= levels.long_trigger;
        let near_short =
            price <= levels.short_trigger * (1.0 + arm) && price >= levels.short_trigger;
        near_long || near_short
    }

    /// Strength in [0, 1]: half price extension, half volume surge, each
    /// saturating at twice its threshold
    fn strength(&self, levels: &Levels, tick: &Tick, direction: Direction) -> f64 {
        let threshold = self.config.breakout_threshold_pct;
        let extension = match direction {
            Direction::Long => (tick.price - levels.high) / levels.high,
            Direction::Short => (levels.low - tick.price) / levels.low,
        };
        let price_score = (extension / (2.0 * threshold)).clamp(0.0, 1.0);
        let volume_ratio = tick.volume / levels.avg_volume;
        let volume_score = (volume_ratio / (2.0 * self.config.volume_multiple)).clamp(0.0, 1.0);

        0.5 * price_score + 0.5 * volume_score
    }
}

impl Detector for BreakoutDetector {
    fn evaluate(&mut self, instrument_id: &str, tick: &Tick) -> Option<Signal> {
        let lookback = self.config.lookback;
        let cooldown = self.config.cooldown();

        // Detach the state so the helpers can borrow self
        let mut state = self
            .states
            .remove(instrument_id)
            .unwrap_or_else(|| DetectorState::new(lookback));

        // Never rewind the window; equal timestamps are redeliveries
        if let Some(last) = state.last_timestamp {
            if tick.timestamp <= last {
                state.dropped_ticks += 1;
                tracing::debug!(
                    instrument = %instrument_id,
                    tick_ts = %tick.timestamp,
                    last_ts = %last,
                    "Dropping out-of-order tick"
                );
                self.states.insert(instrument_id.to_string(), state);
                return None;
            }
        }
        state.last_timestamp = Some(tick.timestamp);

        let mut signal = None;

        if state.regime == Regime::Idle {
            state.window.push(Bar::from(tick));
            if state.window.is_full() {
                state.regime = Regime::Watching;
                tracing::debug!(instrument = %instrument_id, "Detector window full, watching");
            }
            self.states.insert(instrument_id.to_string(), state);
            return None;
        }

        if let Some(levels) = self.levels(&state.window) {
            let in_cooldown = state
                .last_signal_at
                .map(|at| tick.timestamp < at + cooldown)
                .unwrap_or(false);

            match self.breakout_direction(&levels, tick) {
                Some(direction) if !in_cooldown => {
                    let strength = self.strength(&levels, tick, direction);
                    tracing::info!(
                        instrument = %instrument_id,
                        direction = direction.as_str(),
                        price = tick.price,
                        volume = tick.volume,
                        rolling_high = levels.high,
                        rolling_low = levels.low,
                        strength,
                        "Breakout detected"
                    );
                    signal = Some(Signal {
                        instrument: instrument_id.to_string(),
                        direction,
                        trigger_price: tick.price,
                        strength,
                        generated_at: tick.timestamp,
                    });
                    state.regime = Regime::Watching;
                    state.last_signal_at = Some(tick.timestamp);
                    state.armed_since = None;
                }
                Some(direction) => {
                    tracing::debug!(
                        instrument = %instrument_id,
                        direction = direction.as_str(),
                        "Breakout suppressed by cool-down"
                    );
                }
                None => match state.regime {
                    Regime::Armed => {
                        let expired = state
                            .armed_since
                            .map(|since| tick.timestamp >= since + cooldown)
                            .unwrap_or(true);
                        if expired {
                            state.regime = Regime::Watching;
                            state.armed_since = None;
                            tracing::debug!(instrument = %instrument_id, "Disarmed after cool-down");
                        }
                    }
                    Regime::Watching => {
                        if !in_cooldown && self.is_approaching(&levels, tick.price) {
                            state.regime = Regime::Armed;
                            state.armed_since = Some(tick.timestamp);
                            tracing::debug!(
                                instrument = %instrument_id,
                                price = tick.price,
                                "Armed near breakout level"
                            );
                        }
                    }
                    Regime::Idle => {}
                },
            }
        }

        state.window.push(Bar::from(tick));
        self.states.insert(instrument_id.to_string(), state);
        signal
    }

    fn name(&self) -> &str {
        "breakout"
    }

    fn warmup_ticks(&self) -> usize {
        self.config.lookback
    }
}
