use tracing::debug;

use crate::models::{SwapDirection, SwapIntent};

/// Share of the computed deficit actually swapped. The under-shoot leaves room for
/// the slippage tolerance so the swap itself cannot overshoot the target.
pub const SWAP_FRACTION: f64 = 0.80;

/// Value-weight distance, in percentage points, worth flagging to an operator.
pub const IMBALANCE_HINT_PP: f64 = 20.0;

/// Computes the swap that moves two balances toward a target value ratio.
///
/// Balances are whole-token amounts; `price` is token1 per token0.
#[derive(Debug, Clone)]
pub struct PortfolioBalancer {
    target_ratio: f64,
    min_swap_value: f64,
}

impl PortfolioBalancer {
    pub fn new(target_ratio: f64, min_swap_value: f64) -> Self {
        Self {
            target_ratio,
            min_swap_value,
        }
    }

    pub fn target_ratio(&self) -> f64 {
        self.target_ratio
    }

    pub fn compute(&self, balance0: f64, balance1: f64, price: f64) -> Option<SwapIntent> {
        compute_rebalance_swap(balance0, balance1, price, self.target_ratio, self.min_swap_value)
    }
}

/// Portfolio value expressed in token1.
pub fn portfolio_value(balance0: f64, balance1: f64, price: f64) -> f64 {
    balance1 + balance0 * price
}

/// `None` when both differences are under `min_swap_value` or the inputs carry no value.
pub fn compute_rebalance_swap(
    balance0: f64,
    balance1: f64,
    price: f64,
    target_ratio: f64,
    min_swap_value: f64,
) -> Option<SwapIntent> {
    if !price.is_finite() || price <= 0.0 {
        return None;
    }

    let total_value = portfolio_value(balance0, balance1, price);
    if !total_value.is_finite() || total_value <= 0.0 {
        return None;
    }

    let target_amount1 = total_value * target_ratio;
    let target_amount0 = total_value * (1.0 - target_ratio) / price;
    let diff0 = target_amount0 - balance0;
    let diff1 = target_amount1 - balance1;

    debug!(
        "Balance targets: token0 {:.6} (diff {:.6}), token1 {:.6} (diff {:.6})",
        target_amount0, diff0, target_amount1, diff1
    );

    if diff0.abs() < min_swap_value && diff1.abs() < min_swap_value {
        return None;
    }

    let (direction, needed) = if diff0 > 0.0 {
        // short on token0, pay with the token1 surplus
        (SwapDirection::OneForZero, diff1.abs())
    } else {
        (SwapDirection::ZeroForOne, diff0.abs())
    };

    Some(SwapIntent {
        direction,
        amount_in: needed * SWAP_FRACTION,
        diff0,
        diff1,
    })
}

/// Value share of each token in percent, `(token0, token1)`.
pub fn value_distribution(balance0: f64, balance1: f64, price: f64) -> Option<(f64, f64)> {
    let total = portfolio_value(balance0, balance1, price);
    if !total.is_finite() || total <= 0.0 {
        return None;
    }
    let share0 = balance0 * price / total * 100.0;
    Some((share0, 100.0 - share0))
}
