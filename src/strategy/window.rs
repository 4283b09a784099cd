use std::collections::VecDeque;

use crate::models::Tick;

/// One window entry; a tick is a degenerate bar with high = low = close
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Bar {
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
}

impl From<&Tick> for Bar {
    fn from(tick: &Tick) -> Self {
        Self {
            high: tick.price,
            low: tick.price,
            close: tick.price,
            volume: tick.volume,
        }
    }
}

/// Fixed-length rolling window of recent bars
///
/// If the window is full, pushing drops the oldest bar.
#[derive(Debug, Clone)]
pub struct RollingWindow {
    bars: VecDeque<Bar>,
    capacity: usize,
}

impl RollingWindow {
    pub fn new(capacity: usize) -> Self {
        Self {
            bars: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    pub fn push(&mut self, bar: Bar) {
        self.bars.push_back(bar);
        while self.bars.len() > self.capacity {
            self.bars.pop_front();
        }
    }

    pub fn len(&self) -> usize {
        self.bars.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bars.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.bars.len() >= self.capacity
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn high(&self) -> Option<f64> {
        self.bars.iter().map(|b| b.high).reduce(f64::max)
    }

    pub fn low(&self) -> Option<f64> {
        self.bars.iter().map(|b| b.low).reduce(f64::min)
    }

    pub fn last_close(&self) -> Option<f64> {
        self.bars.back().map(|b| b.close)
    }

    pub fn avg_volume(&self) -> Option<f64> {
        if self.bars.is_empty() {
            return None;
        }
        let total: f64 = self.bars.iter().map(|b| b.volume).sum();
        Some(total / self.bars.len() as f64)
    }
}
