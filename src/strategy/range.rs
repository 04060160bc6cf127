use tracing::debug;

use crate::config::{RangeConfig, RangeMethod};
use crate::error::TickMathError;
use crate::models::TickRange;
use crate::strategy::tick_math::{
    max_usable_tick, min_tick_width, price_to_tick, round_to_spacing, tick_to_price, Rounding,
    MIN_TICK,
};
use crate::strategy::volatility::VolatilityEstimator;

/// Samples used for the adaptive high-low spread.
pub const ADAPTIVE_WINDOW: usize = 5;

/// Upper bound of the additive volatility term, in percent.
pub const MAX_VOLATILITY_ADJUSTMENT: f64 = 5.0;

/// Derives range width and concrete tick bounds from price, volatility and policy.
#[derive(Debug, Clone)]
pub struct RangeCalculator {
    config: RangeConfig,
}

impl RangeCalculator {
    pub fn new(config: RangeConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &RangeConfig {
        &self.config
    }

    /// Range half-width in percent for the configured method.
    pub fn dynamic_range_percent(&self, current_price: f64, estimator: &VolatilityEstimator) -> f64 {
        let cfg = &self.config;
        let base = cfg.base_range_percent;

        if !current_price.is_finite() || current_price <= 0.0 {
            debug!("Invalid current price {}, using base range", current_price);
            return base;
        }
        if !cfg.dynamic_range {
            return base;
        }

        match cfg.method {
            RangeMethod::Fixed => base,
            RangeMethod::VolatilityBased => {
                let volatility = estimator.volatility(cfg.volatility_periods);
                self.clamp(base + self.volatility_adjustment(volatility))
            }
            RangeMethod::Adaptive => {
                let volatility = estimator.volatility(cfg.volatility_periods);
                let adaptive = match estimator.recent_spread_percent(ADAPTIVE_WINDOW, current_price)
                {
                    Some(spread) => base.max(spread + cfg.range_buffer_percent),
                    None => base,
                };
                self.clamp(adaptive + self.volatility_adjustment(volatility))
            }
        }
    }

    fn volatility_adjustment(&self, volatility: f64) -> f64 {
        if volatility > 0.0 {
            (volatility * self.config.volatility_multiplier).min(MAX_VOLATILITY_ADJUSTMENT)
        } else {
            0.0
        }
    }

    fn clamp(&self, percent: f64) -> f64 {
        percent
            .max(self.config.min_range_percent)
            .min(self.config.max_range_percent)
    }

    /// Width policy and tick bounds in one call.
    pub fn compute(
        &self,
        current_price: f64,
        estimator: &VolatilityEstimator,
        tick_spacing: i32,
    ) -> Result<(f64, TickRange), TickMathError> {
        let percent = self.dynamic_range_percent(current_price, estimator);
        let range = tick_range(current_price, percent, tick_spacing)?;
        Ok((percent, range))
    }
}

/// Concrete tick bounds around `current_price`, snapped to `tick_spacing`.
///
/// Rounding happens first. A range narrower than the tier minimum is
/// re-centred on the rounded current tick at exactly the minimum width
/// (one spacing either side; 30 ticks on the finest tier).
pub fn tick_range(
    current_price: f64,
    range_percent: f64,
    tick_spacing: i32,
) -> Result<TickRange, TickMathError> {
    if tick_spacing <= 0 {
        return Err(TickMathError::InvalidSpacing(tick_spacing));
    }
    if !range_percent.is_finite() || range_percent <= 0.0 {
        return Err(TickMathError::InvalidRangePercent(range_percent));
    }

    let center = price_to_tick(current_price)?;
    let factor = 1.0 + range_percent / 100.0;
    let raw_upper = price_to_tick(current_price * factor)?;
    let raw_lower = price_to_tick(current_price / factor)?;

    let mut upper = round_to_spacing(raw_upper, tick_spacing, Rounding::Up)?;
    let mut lower = round_to_spacing(raw_lower, tick_spacing, Rounding::Down)?;

    let min_width = min_tick_width(tick_spacing);
    if upper - lower < min_width {
        // half is a multiple of the spacing, so both bounds stay on the grid
        let anchor = round_to_spacing(center, tick_spacing, Rounding::Down)?;
        let half = min_width / 2;
        upper = anchor.saturating_add(half);
        lower = anchor.saturating_sub(half);
        debug!(
            "Range widened to minimum width {}: [{}, {}]",
            min_width, lower, upper
        );
    }

    let max_upper = max_usable_tick(tick_spacing);
    if upper > max_upper {
        upper = max_upper;
    }
    if lower < MIN_TICK || lower >= upper || upper - lower < min_width {
        return Err(TickMathError::RangeOutOfBounds { lower, upper });
    }

    Ok(TickRange::new(lower, upper))
}

/// Prices at the two bounds of `range`.
pub fn range_prices(range: &TickRange) -> (f64, f64) {
    (tick_to_price(range.lower), tick_to_price(range.upper))
}
