// Signal generation
pub mod breakout;
pub mod window;

use crate::models::{Signal, Tick};

pub use breakout::{BreakoutDetector, DetectorState, Regime};
pub use window::{Bar, RollingWindow};

/// Stateful per-instrument signal detector
///
/// Evaluation is a non-blocking in-memory operation; state is mutated only
/// when a tick arrives.
pub trait Detector: Send {
    /// Feed one tick and return a signal if it completes a breakout
    fn evaluate(&mut self, instrument_id: &str, tick: &Tick) -> Option<Signal>;

    /// Detector name, for logs
    fn name(&self) -> &str;

    /// Ticks required before any signal can be produced
    fn warmup_ticks(&self) -> usize;
}

/// `value` is above `level` by more than the relative tolerance
pub(crate) fn strictly_above(value: f64, level: f64, epsilon: f64) -> bool {
    value > level + epsilon * level.abs().max(1.0)
}

/// `value` is below `level` by more than the relative tolerance
pub(crate) fn strictly_below(value: f64, level: f64, epsilon: f64) -> bool {
    value < level - epsilon * level.abs().max(1.0)
}
