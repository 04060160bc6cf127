//! Rolling realized-volatility proxy over recent pool prices.
//!
//! One estimator per pool. The history is a bounded ring buffer: the oldest
//! sample is evicted once capacity is reached, and insertion order is the
//! sliding window used by both the volatility and the recent-spread reads.

use std::collections::VecDeque;

use crate::models::PricePoint;

pub const DEFAULT_CAPACITY: usize = 100;
pub const DEFAULT_PERIODS: usize = 10;

#[derive(Debug, Clone)]
pub struct VolatilityEstimator {
    history: VecDeque<PricePoint>,
    capacity: usize,
}

impl Default for VolatilityEstimator {
    fn default() -> Self {
        Self::new()
    }
}

impl VolatilityEstimator {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            history: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    pub fn record_price(&mut self, price: f64, tick: i32) {
        self.record(PricePoint::new(price, tick));
    }

    pub fn record(&mut self, point: PricePoint) {
        while self.history.len() >= self.capacity {
            self.history.pop_front();
        }
        self.history.push_back(point);
    }

    /// `100 × population stddev` of consecutive absolute relative price changes
    /// over the most recent `periods` samples. Zero until `periods` samples exist.
    pub fn volatility(&self, periods: usize) -> f64 {
        if periods < 2 || self.history.len() < periods {
            return 0.0;
        }

        let start = self.history.len() - periods;
        let window: Vec<f64> = self.history.range(start..).map(|p| p.price).collect();
        let changes: Vec<f64> = window
            .windows(2)
            .filter(|w| w[0] > 0.0)
            .map(|w| ((w[1] - w[0]) / w[0]).abs())
            .collect();

        if changes.is_empty() {
            return 0.0;
        }

        let n = changes.len() as f64;
        let mean = changes.iter().sum::<f64>() / n;
        let variance = changes.iter().map(|c| (c - mean).powi(2)).sum::<f64>() / n;

        variance.sqrt() * 100.0
    }

    /// High-low spread of the last `window` samples as a percent of `current_price`.
    ///
    /// `None` when fewer than `window` samples are held or the window low is not positive.
    pub fn recent_spread_percent(&self, window: usize, current_price: f64) -> Option<f64> {
        if window == 0 || self.history.len() < window || current_price <= 0.0 {
            return None;
        }

        let start = self.history.len() - window;
        let (low, high) = self
            .history
            .range(start..)
            .fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), p| {
                (lo.min(p.price), hi.max(p.price))
            });

        if low <= 0.0 {
            return None;
        }

        Some((high - low) / current_price * 100.0)
    }

    pub fn latest(&self) -> Option<&PricePoint> {
        self.history.back()
    }

    pub fn history(&self) -> impl Iterator<Item = &PricePoint> {
        self.history.iter()
    }

    pub fn len(&self) -> usize {
        self.history.len()
    }

    pub fn is_empty(&self) -> bool {
        self.history.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}
