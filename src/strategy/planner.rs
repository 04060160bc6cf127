use tracing::{debug, warn};

use crate::models::{HealthAnalysis, Position, RebalanceAction, RebalancePlan};
use crate::strategy::range::RangeCalculator;
use crate::strategy::volatility::VolatilityEstimator;

/// Turns a health verdict into close → balance → re-open steps.
#[derive(Debug, Clone)]
pub struct RebalancePlanner {
    range: RangeCalculator,
    target_ratio: f64,
}

impl RebalancePlanner {
    pub fn new(range: RangeCalculator, target_ratio: f64) -> Self {
        Self {
            range,
            target_ratio,
        }
    }

    pub fn range_calculator(&self) -> &RangeCalculator {
        &self.range
    }

    /// `None` when the analysis does not ask for a rebalance.
    ///
    /// `current_price` is the freshly re-read raw pool price. When it is missing or
    /// the new range cannot be computed, the plan stops before `CreatePosition` and
    /// `incomplete_reason` says why.
    pub fn plan(
        &self,
        position: &Position,
        analysis: &HealthAnalysis,
        current_price: Option<f64>,
        estimator: &VolatilityEstimator,
        tick_spacing: i32,
    ) -> Option<RebalancePlan> {
        if !analysis.needs_rebalance {
            return None;
        }

        let priority = analysis.urgency.priority();
        let mut plan = RebalancePlan::new(analysis);

        if position.liquidity > 0 {
            plan.actions.push(RebalanceAction::ClosePosition {
                token_id: position.token_id,
                liquidity: position.liquidity,
                priority,
            });
        }

        plan.actions.push(RebalanceAction::AutoBalance {
            target_ratio: self.target_ratio,
            priority,
        });

        let Some(price) = current_price else {
            warn!(token_id = %position.token_id, "No current price, plan stops before re-opening");
            plan.incomplete_reason = Some("current price unavailable".to_string());
            return Some(plan);
        };

        match self.range.compute(price, estimator, tick_spacing) {
            Ok((range_percent, range)) => {
                debug!(
                    token_id = %position.token_id,
                    "New range {:.2}% → ticks {}",
                    range_percent,
                    range
                );
                plan.actions.push(RebalanceAction::CreatePosition {
                    range,
                    range_percent,
                    priority,
                });
            }
            Err(e) => {
                warn!(token_id = %position.token_id, "Range computation failed: {}", e);
                plan.incomplete_reason = Some(e.to_string());
            }
        }

        Some(plan)
    }
}
