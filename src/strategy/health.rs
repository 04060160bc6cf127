use chrono::Utc;

use crate::models::{HealthAnalysis, Position, PositionMetrics, RangeStatus, Urgency};

/// Below this utilization a range is considered too wide to earn fees.
pub const LOW_UTILIZATION: f64 = 0.3;
/// Volatility (percent) above which edge proximity is acted on pre-emptively.
pub const HIGH_VOLATILITY: f64 = 5.0;
pub const PREEMPTIVE_RATIO: f64 = 0.3;

/// Scores a position against the current pool tick and decides whether to rebalance.
#[derive(Debug, Clone)]
pub struct PositionHealthAnalyzer {
    rebalance_threshold: f64,
}

impl PositionHealthAnalyzer {
    pub fn new(rebalance_threshold: f64) -> Self {
        Self {
            rebalance_threshold,
        }
    }

    pub fn rebalance_threshold(&self) -> f64 {
        self.rebalance_threshold
    }

    pub fn analyze(&self, position: &Position, current_tick: i32, volatility: f64) -> HealthAnalysis {
        let status = range_status(position, current_tick, volatility);

        let (needs_rebalance, urgency, reason) = if !status.in_range {
            (true, Urgency::High, "out of range".to_string())
        } else if position.liquidity == 0 {
            (true, Urgency::High, "zero liquidity".to_string())
        } else if status.position_ratio < self.rebalance_threshold {
            (
                true,
                Urgency::Medium,
                format!("near edge (ratio {:.2})", status.position_ratio),
            )
        } else if status.range_utilization < LOW_UTILIZATION {
            (
                true,
                Urgency::Low,
                "low fee efficiency / range too wide".to_string(),
            )
        } else if status.volatility > HIGH_VOLATILITY && status.position_ratio < PREEMPTIVE_RATIO {
            (
                true,
                Urgency::Medium,
                format!("pre-emptive: high volatility ({:.2}%)", status.volatility),
            )
        } else {
            (false, Urgency::None, "healthy".to_string())
        };

        HealthAnalysis {
            token_id: position.token_id,
            needs_rebalance,
            urgency,
            reason,
            health_score: health_score(&status, position.liquidity),
            range_status: status,
            liquidity: position.liquidity,
            analyzed_at: Utc::now(),
        }
    }

    /// Fold one evaluation into the position's running metrics, crediting
    /// `elapsed_secs` of in-range time when the position is in range.
    pub fn record(&self, metrics: &mut PositionMetrics, analysis: &HealthAnalysis, elapsed_secs: u64) {
        metrics.last_health_score = analysis.health_score;
        metrics.last_check_time = analysis.analyzed_at;
        if analysis.range_status.in_range {
            metrics.in_range_secs += elapsed_secs;
        }
    }
}

pub fn range_status(position: &Position, current_tick: i32, volatility: f64) -> RangeStatus {
    let lower = position.tick_lower;
    let upper = position.tick_upper;
    let in_range = lower <= current_tick && current_tick <= upper;
    let total = (upper as i64 - lower as i64) as f64;

    let (position_ratio, range_utilization, tick_deviation) = if total <= 0.0 {
        (0.0, 0.0, 0.0)
    } else {
        let center = (lower as f64 + upper as f64) / 2.0;
        let deviation = (current_tick as f64 - center).abs() / (total / 2.0);
        if in_range {
            let from_lower = (current_tick - lower) as f64;
            let from_upper = (upper - current_tick) as f64;
            let ratio = (from_lower.min(from_upper) / total).clamp(0.0, 1.0);
            (ratio, (1.0 - 2.0 * ratio).clamp(0.0, 1.0), deviation)
        } else {
            (0.0, 0.0, deviation)
        }
    };

    RangeStatus {
        in_range,
        current_tick,
        tick_lower: lower,
        tick_upper: upper,
        position_ratio,
        range_utilization,
        tick_deviation,
        volatility: volatility.max(0.0),
    }
}

/// Composite 0–100 score; zero whenever the position earns nothing.
pub fn health_score(status: &RangeStatus, liquidity: u128) -> f64 {
    if !status.in_range || liquidity == 0 {
        return 0.0;
    }

    let volatility_penalty = (status.volatility - 3.0).max(0.0).min(10.0);
    let score = status.position_ratio * 100.0 + status.range_utilization * 20.0 - volatility_penalty;

    score.clamp(0.0, 100.0)
}
