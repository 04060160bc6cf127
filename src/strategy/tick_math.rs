//! Price ↔ tick conversion and tick-spacing rounding.
//!
//! Prices here are raw pool prices (token1 per token0 in base units), which is
//! the unit ticks are defined over.

use crate::error::TickMathError;

pub const MIN_TICK: i32 = -887272;
pub const MAX_TICK: i32 = 887272;

/// Ticks are log-price steps of one basis point.
pub const TICK_BASE: f64 = 1.0001;

/// Direction used when snapping a tick onto the spacing grid.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rounding {
    /// Strictly above the input (upper bounds).
    Up,
    /// At or below the input (lower bounds).
    Down,
}

/// `floor(ln(price) / ln(1.0001))`.
///
/// The floor is corrected by one step when floating error lands it on the
/// wrong side of an exact tick price, so `price_to_tick(tick_to_price(t)) == t`.
pub fn price_to_tick(price: f64) -> Result<i32, TickMathError> {
    if !price.is_finite() || price <= 0.0 {
        return Err(TickMathError::InvalidPrice(price));
    }

    let mut tick = (price.ln() / TICK_BASE.ln()).floor() as i64;
    if tick_to_price_i64(tick + 1) <= price {
        tick += 1;
    } else if tick_to_price_i64(tick) > price {
        tick -= 1;
    }

    i32::try_from(tick).map_err(|_| TickMathError::InvalidPrice(price))
}

/// `1.0001^tick`.
pub fn tick_to_price(tick: i32) -> f64 {
    TICK_BASE.powi(tick)
}

fn tick_to_price_i64(tick: i64) -> f64 {
    match i32::try_from(tick) {
        Ok(t) => tick_to_price(t),
        Err(_) if tick > 0 => f64::INFINITY,
        Err(_) => 0.0,
    }
}

/// Snap `tick` onto a multiple of `spacing`.
///
/// `Up` always moves to the next multiple, even when `tick` already is one.
pub fn round_to_spacing(tick: i32, spacing: i32, direction: Rounding) -> Result<i32, TickMathError> {
    if spacing <= 0 {
        return Err(TickMathError::InvalidSpacing(spacing));
    }

    let tick = tick as i64;
    let spacing = spacing as i64;
    let rounded = match direction {
        Rounding::Down => tick.div_euclid(spacing) * spacing,
        Rounding::Up => (tick.div_euclid(spacing) + 1) * spacing,
    };

    // i64 arithmetic keeps the intermediate in range; bounds are enforced by callers
    Ok(rounded.clamp(i32::MIN as i64, i32::MAX as i64) as i32)
}

/// Minimum allowed `upper - lower` for a spacing tier.
pub fn min_tick_width(spacing: i32) -> i32 {
    if spacing == 1 {
        30
    } else {
        2 * spacing
    }
}

/// Largest multiple of `spacing` that is still `<= MAX_TICK`.
pub fn max_usable_tick(spacing: i32) -> i32 {
    (MAX_TICK / spacing) * spacing
}

/// Smallest multiple of `spacing` that is still `>= MIN_TICK`.
pub fn min_usable_tick(spacing: i32) -> i32 {
    (MIN_TICK / spacing) * spacing
}
