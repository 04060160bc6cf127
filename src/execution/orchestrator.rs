use alloy_primitives::{Address, TxHash};
use chrono::Utc;
use dashmap::DashMap;
use parking_lot::RwLock;
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::sync::{watch, Mutex};
use tracing::{debug, error, info, warn};

use crate::chain::{Asset, ChainClient, MintRequest, SwapRequest, TokenInfo, WalletClient};
use crate::config::{BotConfig, ExecutionConfig};
use crate::error::{ExecutionError, TickMathError};
use crate::execution::result::{ActionOutcome, PlanOutcome, MINT_ID_MISSING};
use crate::execution::retry::{
    RetryExecutor, RetryPolicy, COLLECT_CONFIRMATION_TIMEOUT,
    DECREASE_CONFIRMATION_TIMEOUT,
};
use crate::models::{
    HealthAnalysis, PlanStatus, PoolState, Position, PositionMetrics, PositionPerformance,
    Priority, RebalanceAction, RebalanceHistoryEntry, RebalancePlan, RebalanceStatistics,
    SwapDirection, TickRange, TokenId, Urgency, UrgencyDistribution,
};
use crate::strategy::balancer::{portfolio_value, PortfolioBalancer};
use crate::strategy::{
    PositionHealthAnalyzer, RangeCalculator, RebalancePlanner, VolatilityEstimator,
};

pub const HISTORY_CAPACITY: usize = 50;

/// The single token pair and pool a bot instance manages.
#[derive(Debug, Clone)]
pub struct PairContext {
    pub token0: TokenInfo,
    pub token1: TokenInfo,
    pub fee: u32,
    pub tick_spacing: i32,
    pub pool: Address,
}

impl PairContext {
    pub fn human_price(&self, pool: &PoolState) -> f64 {
        pool.human_price(self.token0.decimals, self.token1.decimals)
    }

    fn token(&self, address: Address) -> Option<&TokenInfo> {
        if address == self.token0.address {
            Some(&self.token0)
        } else if address == self.token1.address {
            Some(&self.token1)
        } else {
            None
        }
    }
}

/// Sequences rebalance plans through the retry protocol and owns per-position
/// metrics plus the rolling rebalance history.
///
/// All mutating work runs under one mutation gate, so at most one wallet-level
/// transaction is in flight at any time.
pub struct RebalanceOrchestrator<C, W> {
    chain: Arc<C>,
    wallet: Arc<W>,
    pair: PairContext,
    swap_router: Address,
    position_manager: Address,
    execution: ExecutionConfig,
    check_interval_secs: u64,
    analyzer: PositionHealthAnalyzer,
    planner: RebalancePlanner,
    mutation_gate: Mutex<()>,
    metrics: DashMap<TokenId, PositionMetrics>,
    last_analysis: DashMap<TokenId, HealthAnalysis>,
    history: RwLock<VecDeque<RebalanceHistoryEntry>>,
}

impl<C, W> RebalanceOrchestrator<C, W>
where
    C: ChainClient + 'static,
    W: WalletClient + 'static,
{
    pub fn new(chain: Arc<C>, wallet: Arc<W>, pair: PairContext, config: &BotConfig) -> Self {
        let range = RangeCalculator::new(config.range.clone());
        Self {
            chain,
            wallet,
            pair,
            swap_router: config.network.swap_router,
            position_manager: config.network.position_manager,
            execution: config.execution.clone(),
            check_interval_secs: config.check_interval_secs,
            analyzer: PositionHealthAnalyzer::new(config.rebalance_threshold),
            planner: RebalancePlanner::new(range, config.execution.target_ratio),
            mutation_gate: Mutex::new(()),
            metrics: DashMap::new(),
            last_analysis: DashMap::new(),
            history: RwLock::new(VecDeque::with_capacity(HISTORY_CAPACITY)),
        }
    }

    pub fn pair(&self) -> &PairContext {
        &self.pair
    }

    // ---- metrics & history -------------------------------------------------

    pub fn track(&self, token_id: TokenId) {
        self.metrics
            .entry(token_id)
            .or_insert_with(|| PositionMetrics::new(token_id));
    }

    pub fn untrack(&self, token_id: TokenId) {
        self.metrics.remove(&token_id);
        self.last_analysis.remove(&token_id);
    }

    pub fn restore_metrics(&self, metrics: PositionMetrics) {
        self.metrics.insert(metrics.token_id, metrics);
    }

    /// Load persisted history, oldest first, keeping the most recent entries.
    pub fn restore_history(&self, entries: Vec<RebalanceHistoryEntry>) {
        let mut history = self.history.write();
        history.clear();
        let skip = entries.len().saturating_sub(HISTORY_CAPACITY);
        history.extend(entries.into_iter().skip(skip));
    }

    pub fn metrics(&self, token_id: &TokenId) -> Option<PositionMetrics> {
        self.metrics.get(token_id).map(|m| m.clone())
    }

    pub fn metrics_snapshot(&self) -> Vec<PositionMetrics> {
        self.metrics.iter().map(|m| m.value().clone()).collect()
    }

    pub fn last_analysis(&self, token_id: &TokenId) -> Option<HealthAnalysis> {
        self.last_analysis.get(token_id).map(|a| a.clone())
    }

    pub fn history_snapshot(&self) -> Vec<RebalanceHistoryEntry> {
        self.history.read().iter().cloned().collect()
    }

    // ---- analysis & planning ----------------------------------------------

    /// Analyse a position and fold the result into its metrics. Credits one
    /// check interval of in-range time.
    pub fn evaluate(&self, position: &Position, pool: &PoolState, volatility: f64) -> HealthAnalysis {
        self.evaluate_crediting(position, pool, volatility, self.check_interval_secs)
    }

    /// First evaluation of a newly registered position; no time has passed yet.
    pub fn baseline(&self, position: &Position, pool: &PoolState, volatility: f64) -> HealthAnalysis {
        self.evaluate_crediting(position, pool, volatility, 0)
    }

    fn evaluate_crediting(
        &self,
        position: &Position,
        pool: &PoolState,
        volatility: f64,
        elapsed_secs: u64,
    ) -> HealthAnalysis {
        let analysis = self.analyzer.analyze(position, pool.tick, volatility);

        let mut metrics = self
            .metrics
            .entry(position.token_id)
            .or_insert_with(|| PositionMetrics::new(position.token_id));
        self.analyzer
            .record(metrics.value_mut(), &analysis, elapsed_secs);
        drop(metrics);

        self.last_analysis.insert(position.token_id, analysis.clone());
        analysis
    }

    /// New range for the current market, as a fresh position would get it.
    pub fn compute_new_range(
        &self,
        raw_price: f64,
        estimator: &VolatilityEstimator,
    ) -> Result<(f64, TickRange), TickMathError> {
        self.planner
            .range_calculator()
            .compute(raw_price, estimator, self.pair.tick_spacing)
    }

    /// Re-read the pool price, plan, and run the plan. `None` if no rebalance is needed.
    pub async fn rebalance(
        &self,
        position: &Position,
        analysis: &HealthAnalysis,
        estimator: &VolatilityEstimator,
        stop: &watch::Receiver<bool>,
    ) -> Option<PlanOutcome> {
        let current_price = match self.chain.pool_state(self.pair.pool).await {
            Ok(state) => Some(state.price),
            Err(e) => {
                warn!(token_id = %position.token_id, "Could not refresh pool price: {}", e);
                None
            }
        };

        let plan = self.planner.plan(
            position,
            analysis,
            current_price,
            estimator,
            self.pair.tick_spacing,
        )?;
        Some(self.execute_plan(plan, stop).await)
    }

    // ---- plan execution ----------------------------------------------------

    pub async fn execute_plan(&self, mut plan: RebalancePlan, stop: &watch::Receiver<bool>) -> PlanOutcome {
        plan.sort_by_priority();
        let total = plan.len();
        info!(
            plan_id = %plan.id,
            token_id = %plan.token_id,
            urgency = %plan.urgency,
            "📋 Executing rebalance plan with {} actions: {}",
            total,
            plan.reason
        );

        let mut outcomes: Vec<ActionOutcome> = Vec::with_capacity(total);
        let mut status = None;
        let mut new_token_id = None;

        for (i, action) in plan.actions.iter().enumerate() {
            if i > 0 && *stop.borrow() {
                warn!(
                    "🛑 Stop requested, leaving plan {} after {}/{} steps",
                    plan.id, i, total
                );
                status = Some(PlanStatus::Cancelled);
                break;
            }

            info!(
                "Step {}/{} (priority {}): {}",
                i + 1,
                total,
                action.priority().value(),
                action.kind()
            );

            let outcome = self.execute_action(action).await;
            if let Some(id) = outcome.minted_token_id {
                new_token_id = Some(id);
            }

            if outcome.success {
                debug!("Step {} ({}) done in {} attempts", i + 1, outcome.kind, outcome.attempts);
            } else if outcome.is_fatal() {
                error!(
                    "❌ High-priority step {} failed, aborting plan: {}",
                    outcome.kind,
                    outcome.detail.as_deref().unwrap_or("unknown error")
                );
            } else {
                warn!(
                    "⚠️ Step {} failed, continuing with remaining actions: {}",
                    outcome.kind,
                    outcome.detail.as_deref().unwrap_or("unknown error")
                );
            }

            let fatal = outcome.is_fatal();
            outcomes.push(outcome);
            if fatal {
                status = Some(PlanStatus::Aborted);
                break;
            }

            if i + 1 < total && !self.execution.settle_delay.is_zero() {
                info!("⏳ Waiting {:?} for confirmations to settle", self.execution.settle_delay);
                tokio::time::sleep(self.execution.settle_delay).await;
            }
        }

        let status = status.unwrap_or(if plan.is_complete() {
            PlanStatus::Completed
        } else {
            PlanStatus::Incomplete
        });

        let reason = match status {
            PlanStatus::Incomplete => plan.incomplete_reason.clone(),
            PlanStatus::Cancelled => Some("stop requested".to_string()),
            _ => outcomes
                .iter()
                .find(|o| !o.success)
                .and_then(|o| o.detail.clone()),
        };

        let outcome = PlanOutcome {
            plan_id: plan.id,
            token_id: plan.token_id,
            status,
            actions: outcomes,
            new_token_id,
            reason,
        };

        if outcome.is_success() {
            info!(plan_id = %plan.id, "✅ Rebalance plan completed");
        } else {
            warn!(
                plan_id = %plan.id,
                "Rebalance plan ended as {} ({} failed steps)",
                status.as_str(),
                outcome.failed_actions()
            );
        }

        self.record_outcome(&plan, &outcome);
        outcome
    }

    fn record_outcome(&self, plan: &RebalancePlan, outcome: &PlanOutcome) {
        if let Some(mut metrics) = self.metrics.get_mut(&plan.token_id) {
            metrics.total_rebalances += 1;
        }

        // The closed position's counters move to the one that replaced it
        if let Some(new_id) = outcome.new_token_id {
            if new_id != plan.token_id {
                if let Some((_, mut metrics)) = self.metrics.remove(&plan.token_id) {
                    metrics.token_id = new_id;
                    self.metrics.insert(new_id, metrics);
                } else {
                    self.track(new_id);
                }
                self.last_analysis.remove(&plan.token_id);
            }
        }

        let entry = RebalanceHistoryEntry {
            plan_id: plan.id,
            token_id: plan.token_id,
            timestamp: Utc::now(),
            reason: plan.reason.clone(),
            urgency: plan.urgency,
            health_score_before: plan.health_score_before,
            success: outcome.is_success(),
            actions_count: plan.len(),
            status: outcome.status,
            new_token_id: outcome.new_token_id,
        };

        let mut history = self.history.write();
        while history.len() >= HISTORY_CAPACITY {
            history.pop_front();
        }
        history.push_back(entry);
    }

    /// Run one step under the mutation gate.
    pub async fn execute_action(&self, action: &RebalanceAction) -> ActionOutcome {
        let _gate = self.mutation_gate.lock().await;
        let priority = action.priority();

        match action {
            RebalanceAction::ClosePosition {
                token_id,
                liquidity,
                ..
            } => self.close_position(*token_id, *liquidity, priority).await,
            RebalanceAction::AutoBalance { target_ratio, .. } => {
                self.auto_balance(*target_ratio, priority).await
            }
            RebalanceAction::SwapTokens {
                token_in,
                token_out,
                amount_in,
                ..
            } => {
                self.swap("swap_tokens", priority, *token_in, *token_out, *amount_in)
                    .await
            }
            RebalanceAction::CreatePosition { range, .. } => {
                self.create_position(*range, priority).await
            }
        }
    }

    /// Operator entry point: balance the wallet toward the configured ratio.
    pub async fn balance_portfolio(&self) -> ActionOutcome {
        self.execute_action(&RebalanceAction::AutoBalance {
            target_ratio: self.execution.target_ratio,
            priority: Priority::High,
        })
        .await
    }

    /// Operator entry point: open a position over `range` from wallet balances.
    pub async fn open_position(&self, range: TickRange, range_percent: f64) -> ActionOutcome {
        self.execute_action(&RebalanceAction::CreatePosition {
            range,
            range_percent,
            priority: Priority::High,
        })
        .await
    }

    // ---- individual actions (caller holds the gate) -------------------------

    async fn check_gas(&self) -> Result<f64, ExecutionError> {
        let gas = self.wallet.balance_of(Asset::Native).await?;
        if gas < self.execution.min_gas_balance {
            return Err(ExecutionError::InsufficientGas {
                available: gas,
                required: self.execution.min_gas_balance,
            });
        }
        Ok(gas)
    }

    async fn pair_balances(&self) -> Result<(f64, f64), ExecutionError> {
        let balance0 = self
            .wallet
            .balance_of(Asset::Token(self.pair.token0.address))
            .await?;
        let balance1 = self
            .wallet
            .balance_of(Asset::Token(self.pair.token1.address))
            .await?;
        Ok((balance0, balance1))
    }

    async fn close_position(&self, token_id: TokenId, liquidity: u128, priority: Priority) -> ActionOutcome {
        const KIND: &str = "close_position";

        if let Err(e) = self.check_gas().await {
            return ActionOutcome::failed(KIND, priority, 0, e.to_string());
        }

        let chain = &self.chain;
        let mut hashes: Vec<TxHash> = Vec::new();
        let mut attempts = 0;

        if liquidity > 0 {
            let executor = RetryExecutor::new(RetryPolicy::position_close(
                &self.execution,
                DECREASE_CONFIRMATION_TIMEOUT,
            ));
            let outcome = executor
                .execute("decrease liquidity", move |ctx| async move {
                    let tx = chain.send_decrease_liquidity(token_id, liquidity).await?;
                    chain.wait_for_confirmation(&tx, ctx.confirmation_timeout).await
                })
                .await;
            attempts += outcome.attempts();
            match outcome.into_result() {
                Ok(confirmation) => hashes.push(confirmation.hash),
                Err(e) => return ActionOutcome::failed(KIND, priority, attempts, e.to_string()),
            }
        }

        let executor = RetryExecutor::new(RetryPolicy::position_close(
            &self.execution,
            COLLECT_CONFIRMATION_TIMEOUT,
        ));
        let outcome = executor
            .execute("collect", move |ctx| async move {
                let tx = chain.send_collect(token_id).await?;
                chain.wait_for_confirmation(&tx, ctx.confirmation_timeout).await
            })
            .await;
        attempts += outcome.attempts();
        match outcome.into_result() {
            Ok(confirmation) => hashes.push(confirmation.hash),
            Err(e) => {
                return ActionOutcome::failed(KIND, priority, attempts, e.to_string())
                    .with_txs(hashes)
            }
        }

        info!(token_id = %token_id, "✅ Position closed and tokens collected");
        ActionOutcome::succeeded(KIND, priority, attempts).with_txs(hashes)
    }

    async fn auto_balance(&self, target_ratio: f64, priority: Priority) -> ActionOutcome {
        const KIND: &str = "auto_balance";

        if let Err(e) = self.check_gas().await {
            return ActionOutcome::failed(KIND, priority, 0, e.to_string());
        }

        let (balance0, balance1) = match self.pair_balances().await {
            Ok(balances) => balances,
            Err(e) => return ActionOutcome::failed(KIND, priority, 0, e.to_string()),
        };
        let price = match self.chain.pool_state(self.pair.pool).await {
            Ok(state) => self.pair.human_price(&state),
            Err(e) => return ActionOutcome::failed(KIND, priority, 0, e.to_string()),
        };

        if portfolio_value(balance0, balance1, price) <= 0.0 {
            return ActionOutcome::failed(KIND, priority, 0, "no token balances found");
        }

        info!(
            "⚖️ Balancing {:.6} {} / {:.6} {} at price {:.6}",
            balance0, self.pair.token0.symbol, balance1, self.pair.token1.symbol, price
        );

        let balancer = PortfolioBalancer::new(target_ratio, self.execution.min_swap_value);
        let Some(intent) = balancer.compute(balance0, balance1, price) else {
            info!("✅ Portfolio already balanced");
            return ActionOutcome::succeeded(KIND, priority, 0).with_detail("already balanced");
        };

        let (token_in, token_out) = match intent.direction {
            SwapDirection::ZeroForOne => (self.pair.token0.address, self.pair.token1.address),
            SwapDirection::OneForZero => (self.pair.token1.address, self.pair.token0.address),
        };
        self.swap(KIND, priority, token_in, token_out, intent.amount_in)
            .await
    }

    async fn swap(
        &self,
        kind: &'static str,
        priority: Priority,
        token_in: Address,
        token_out: Address,
        amount_in: f64,
    ) -> ActionOutcome {
        let (Some(info_in), Some(info_out)) = (self.pair.token(token_in), self.pair.token(token_out)) else {
            return ActionOutcome::failed(kind, priority, 0, "swap tokens are not the managed pair");
        };
        if token_in == token_out || !amount_in.is_finite() || amount_in <= 0.0 {
            return ActionOutcome::failed(
                kind,
                priority,
                0,
                ExecutionError::InvalidParams(format!("swap {} {}", amount_in, info_in.symbol))
                    .to_string(),
            );
        }

        if let Err(e) = self.check_gas().await {
            return ActionOutcome::failed(kind, priority, 0, e.to_string());
        }
        match self.wallet.balance_of(Asset::Token(token_in)).await {
            Ok(balance) if balance < amount_in => {
                let e = ExecutionError::InsufficientBalance {
                    token: info_in.symbol.clone(),
                    available: balance,
                    required: amount_in,
                };
                return ActionOutcome::failed(kind, priority, 0, e.to_string());
            }
            Ok(_) => {}
            Err(e) => return ActionOutcome::failed(kind, priority, 0, e.to_string()),
        }

        let price = match self.chain.pool_state(self.pair.pool).await {
            Ok(state) => self.pair.human_price(&state),
            Err(e) => return ActionOutcome::failed(kind, priority, 0, e.to_string()),
        };
        if !price.is_finite() || price <= 0.0 {
            return ActionOutcome::failed(kind, priority, 0, format!("invalid pool price {}", price));
        }
        let expected_out = if token_in == self.pair.token0.address {
            amount_in * price
        } else {
            amount_in / price
        };

        match self
            .wallet
            .ensure_approval(token_in, self.swap_router, amount_in * 2.0)
            .await
        {
            Ok(true) => {}
            Ok(false) => {
                return ActionOutcome::failed(kind, priority, 0, format!("{} approval not granted", info_in.symbol))
            }
            Err(e) => return ActionOutcome::failed(kind, priority, 0, e.to_string()),
        }

        info!(
            "🔄 Swapping {:.6} {} → {} (expected {:.6})",
            amount_in, info_in.symbol, info_out.symbol, expected_out
        );

        let chain = &self.chain;
        let fee = self.pair.fee;
        let executor = RetryExecutor::new(RetryPolicy::swap(&self.execution));
        let outcome = executor
            .execute("swap", move |ctx| async move {
                let request = SwapRequest {
                    token_in,
                    token_out,
                    fee,
                    amount_in,
                    min_amount_out: ctx.min_amount(expected_out),
                };
                let tx = chain.send_swap(&request).await?;
                chain.wait_for_confirmation(&tx, ctx.confirmation_timeout).await
            })
            .await;

        let attempts = outcome.attempts();
        match outcome.into_result() {
            Ok(confirmation) => {
                ActionOutcome::succeeded(kind, priority, attempts).with_txs(vec![confirmation.hash])
            }
            Err(e) => ActionOutcome::failed(kind, priority, attempts, e.to_string()),
        }
    }

    async fn create_position(&self, range: TickRange, priority: Priority) -> ActionOutcome {
        const KIND: &str = "create_position";

        if let Err(e) = self.check_gas().await {
            return ActionOutcome::failed(KIND, priority, 0, e.to_string());
        }
        let (balance0, balance1) = match self.pair_balances().await {
            Ok(balances) => balances,
            Err(e) => return ActionOutcome::failed(KIND, priority, 0, e.to_string()),
        };
        if balance0 <= 0.0 && balance1 <= 0.0 {
            let e = ExecutionError::InsufficientBalance {
                token: format!("{}/{}", self.pair.token0.symbol, self.pair.token1.symbol),
                available: 0.0,
                required: 0.0,
            };
            return ActionOutcome::failed(KIND, priority, 0, e.to_string());
        }

        let allocation = self.execution.position_allocation;
        let amount0 = balance0.max(0.0) * allocation;
        let amount1 = balance1.max(0.0) * allocation;

        for (token, amount) in [
            (&self.pair.token0, amount0),
            (&self.pair.token1, amount1),
        ] {
            if amount <= 0.0 {
                continue;
            }
            match self
                .wallet
                .ensure_approval(token.address, self.position_manager, amount * 2.0)
                .await
            {
                Ok(true) => {}
                Ok(false) => {
                    return ActionOutcome::failed(KIND, priority, 0, format!("{} approval not granted", token.symbol))
                }
                Err(e) => return ActionOutcome::failed(KIND, priority, 0, e.to_string()),
            }
        }

        info!(
            "🏗️ Minting position {} with {:.6} {} + {:.6} {}",
            range, amount0, self.pair.token0.symbol, amount1, self.pair.token1.symbol
        );

        let chain = &self.chain;
        let (token0, token1, fee) = (self.pair.token0.address, self.pair.token1.address, self.pair.fee);
        let executor = RetryExecutor::new(RetryPolicy::position_create(&self.execution));
        let outcome = executor
            .execute("mint", move |ctx| async move {
                let request = MintRequest {
                    token0,
                    token1,
                    fee,
                    tick_lower: range.lower,
                    tick_upper: range.upper,
                    amount0,
                    amount1,
                    amount0_min: ctx.min_amount(amount0),
                    amount1_min: ctx.min_amount(amount1),
                };
                let tx = chain.send_mint(&request).await?;
                chain.wait_for_confirmation(&tx, ctx.confirmation_timeout).await
            })
            .await;

        let attempts = outcome.attempts();
        match outcome.into_result() {
            Ok(confirmation) => match confirmation.minted_token_id {
                Some(id) => {
                    info!(token_id = %id, "🎉 New position minted over {}", range);
                    let mut result = ActionOutcome::succeeded(KIND, priority, attempts)
                        .with_txs(vec![confirmation.hash]);
                    result.minted_token_id = Some(id);
                    result
                }
                None => {
                    // The mint went through, so the tx hash is kept for the operator
                    error!(
                        tx = %confirmation.hash,
                        "Mint confirmed but no token id found in the receipt"
                    );
                    ActionOutcome::failed(KIND, priority, attempts, MINT_ID_MISSING)
                        .with_txs(vec![confirmation.hash])
                }
            },
            Err(e) => ActionOutcome::failed(KIND, priority, attempts, e.to_string()),
        }
    }

    // ---- reporting -----------------------------------------------------------

    pub fn statistics(&self, active_positions: usize) -> RebalanceStatistics {
        let history = self.history.read();
        let total = history.len();
        let successful = history.iter().filter(|e| e.success).count();

        let avg_secs_between = if total > 1 {
            let gaps: Vec<f64> = history
                .iter()
                .zip(history.iter().skip(1))
                .map(|(a, b)| (b.timestamp - a.timestamp).num_milliseconds() as f64 / 1000.0)
                .collect();
            gaps.iter().sum::<f64>() / gaps.len() as f64
        } else {
            0.0
        };

        let mut distribution = UrgencyDistribution::default();
        for entry in history.iter() {
            match entry.urgency {
                Urgency::High => distribution.high += 1,
                Urgency::Medium => distribution.medium += 1,
                Urgency::Low | Urgency::None => distribution.low += 1,
            }
        }

        let recent_start = total.saturating_sub(10);
        RebalanceStatistics {
            total_rebalances: total,
            successful_rebalances: successful,
            success_rate: if total > 0 {
                successful as f64 / total as f64
            } else {
                0.0
            },
            avg_secs_between_rebalances: avg_secs_between,
            urgency_distribution: distribution,
            recent_history: history.iter().skip(recent_start).cloned().collect(),
            active_positions,
        }
    }

    pub fn performance(&self, token_id: &TokenId) -> Option<PositionPerformance> {
        let metrics = self.metrics.get(token_id)?;
        let total_secs = (Utc::now() - metrics.added_at).num_milliseconds() as f64 / 1000.0;

        let (in_range_percentage, rebalances_per_hour) = if total_secs > 0.0 {
            (
                (metrics.in_range_secs as f64 / total_secs * 100.0).min(100.0),
                metrics.total_rebalances as f64 / (total_secs / 3600.0),
            )
        } else {
            (0.0, 0.0)
        };

        Some(PositionPerformance {
            token_id: *token_id,
            total_monitoring_secs: total_secs,
            in_range_secs: metrics.in_range_secs,
            in_range_percentage,
            total_rebalances: metrics.total_rebalances,
            last_health_score: metrics.last_health_score,
            rebalances_per_hour,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::fake::FakeChain;
    use crate::config::create_test_config;
    use alloy_primitives::U256;
    use chrono::Duration as ChronoDuration;

    type TestOrchestrator = RebalanceOrchestrator<FakeChain, FakeChain>;

    fn setup() -> (Arc<FakeChain>, TestOrchestrator) {
        let chain = Arc::new(FakeChain::new());
        let pair = PairContext {
            token0: TokenInfo {
                address: chain.token0,
                symbol: "TK0".to_string(),
                decimals: 18,
            },
            token1: TokenInfo {
                address: chain.token1,
                symbol: "TK1".to_string(),
                decimals: 18,
            },
            fee: 3000,
            tick_spacing: 60,
            pool: chain.pool,
        };
        let orchestrator =
            RebalanceOrchestrator::new(chain.clone(), chain.clone(), pair, &create_test_config());
        (chain, orchestrator)
    }

    fn no_stop() -> watch::Receiver<bool> {
        // Receivers keep the last value after the sender is gone
        watch::channel(false).1
    }

    fn plan_with(token_id: u64, urgency: Urgency, actions: Vec<RebalanceAction>) -> RebalancePlan {
        let mut plan = RebalancePlan {
            id: uuid::Uuid::new_v4(),
            token_id: U256::from(token_id),
            reason: "test".to_string(),
            urgency,
            health_score_before: 0.0,
            actions: Vec::new(),
            incomplete_reason: None,
            created_at: Utc::now(),
        };
        plan.actions = actions;
        plan
    }

    #[tokio::test]
    async fn test_out_of_range_position_is_fully_rebalanced() {
        let (chain, orchestrator) = setup();
        let position = chain.add_position(7, 600, 1200, 5_000);
        orchestrator.track(position.token_id);

        let pool = chain.pool_state(chain.pool).await.unwrap();
        let analysis = orchestrator.evaluate(&position, &pool, 0.0);
        assert_eq!(analysis.urgency, Urgency::High);

        let outcome = orchestrator
            .rebalance(&position, &analysis, &VolatilityEstimator::new(), &no_stop())
            .await
            .unwrap();

        assert_eq!(outcome.status, PlanStatus::Completed);
        assert!(outcome.is_success());
        let new_id = outcome.new_token_id.unwrap();
        assert_eq!(
            chain.state().calls,
            vec!["decrease_liquidity", "collect", "mint"]
        );

        // Metrics follow the replacement position
        assert!(orchestrator.metrics(&position.token_id).is_none());
        let moved = orchestrator.metrics(&new_id).unwrap();
        assert_eq!(moved.total_rebalances, 1);
        assert_eq!(moved.token_id, new_id);

        let history = orchestrator.history_snapshot();
        assert_eq!(history.len(), 1);
        assert!(history[0].success);
        assert_eq!(history[0].actions_count, 3);
        assert_eq!(history[0].new_token_id, Some(new_id));

        let minted = chain.state().positions.get(&new_id).cloned().unwrap();
        assert!(minted.tick_lower < pool.tick && pool.tick < minted.tick_upper);
        assert_eq!(minted.tick_lower % 60, 0);
    }

    #[tokio::test]
    async fn test_priority_one_failure_aborts_plan() {
        let (chain, orchestrator) = setup();
        let position = chain.add_position(7, 600, 1200, 5_000);
        chain.state().decrease_failures = 10;

        let pool = chain.pool_state(chain.pool).await.unwrap();
        let analysis = orchestrator.evaluate(&position, &pool, 0.0);
        let outcome = orchestrator
            .rebalance(&position, &analysis, &VolatilityEstimator::new(), &no_stop())
            .await
            .unwrap();

        assert_eq!(outcome.status, PlanStatus::Aborted);
        assert_eq!(outcome.actions.len(), 1);
        assert_eq!(outcome.actions[0].attempts, 3);
        assert!(!chain.state().calls.contains(&"mint"));

        let history = orchestrator.history_snapshot();
        assert_eq!(history.len(), 1);
        assert!(!history[0].success);
        assert_eq!(history[0].status, PlanStatus::Aborted);
    }

    #[tokio::test]
    async fn test_lower_priority_failure_continues() {
        let (chain, orchestrator) = setup();
        chain.set_balance(Asset::Token(chain.token1), 0.0);
        chain.state().fail_all_swaps = true;

        let plan = plan_with(
            7,
            Urgency::Medium,
            vec![
                RebalanceAction::AutoBalance {
                    target_ratio: 0.5,
                    priority: Priority::Medium,
                },
                RebalanceAction::CreatePosition {
                    range: TickRange::new(-600, 600),
                    range_percent: 5.0,
                    priority: Priority::Medium,
                },
            ],
        );
        let outcome = orchestrator.execute_plan(plan, &no_stop()).await;

        assert_eq!(outcome.status, PlanStatus::Completed);
        assert!(!outcome.is_success());
        assert_eq!(outcome.failed_actions(), 1);
        assert!(!outcome.actions[0].success);
        assert!(outcome.actions[1].success);
        assert!(chain.state().calls.contains(&"mint"));
    }

    #[tokio::test]
    async fn test_plan_without_create_is_incomplete() {
        let (_chain, orchestrator) = setup();
        let mut plan = plan_with(
            7,
            Urgency::High,
            vec![RebalanceAction::AutoBalance {
                target_ratio: 0.5,
                priority: Priority::High,
            }],
        );
        plan.incomplete_reason = Some("current price unavailable".to_string());

        let outcome = orchestrator.execute_plan(plan, &no_stop()).await;
        assert_eq!(outcome.status, PlanStatus::Incomplete);
        assert!(outcome.actions.iter().all(|a| a.success));
        assert_eq!(outcome.reason.as_deref(), Some("current price unavailable"));
        assert_eq!(
            orchestrator.history_snapshot()[0].status,
            PlanStatus::Incomplete
        );
    }

    #[tokio::test]
    async fn test_swap_retries_with_escalating_slippage() {
        let (chain, orchestrator) = setup();
        chain.set_balance(Asset::Token(chain.token1), 0.0);
        chain.state().swap_failures = 2;

        let outcome = orchestrator.balance_portfolio().await;
        assert!(outcome.success);
        assert_eq!(outcome.attempts, 3);

        let state = chain.state();
        assert_eq!(state.swaps.len(), 3);
        // 1000 token0 at price 1 → swap 0.8 × 500
        assert!((state.swaps[0].amount_in - 400.0).abs() < 1e-9);
        let mins: Vec<f64> = state.swaps.iter().map(|s| s.min_amount_out).collect();
        assert!((mins[0] - 400.0 * 0.96).abs() < 1e-9);
        assert!(mins.windows(2).all(|w| w[1] < w[0]));
        assert!(state
            .approvals
            .iter()
            .any(|(token, _, amount)| *token == chain.token0 && (*amount - 800.0).abs() < 1e-9));
    }

    #[tokio::test]
    async fn test_confirmation_timeout_counts_as_failed_attempt() {
        let (chain, orchestrator) = setup();
        chain.set_balance(Asset::Token(chain.token1), 0.0);
        chain.state().confirmation_timeouts = 1;

        let outcome = orchestrator.balance_portfolio().await;
        assert!(outcome.success);
        assert_eq!(outcome.attempts, 2);
    }

    #[tokio::test]
    async fn test_insufficient_gas_is_not_retried() {
        let (chain, orchestrator) = setup();
        chain.set_balance(Asset::Native, 0.001);
        chain.set_balance(Asset::Token(chain.token1), 0.0);

        let outcome = orchestrator.balance_portfolio().await;
        assert!(!outcome.success);
        assert_eq!(outcome.attempts, 0);
        assert!(outcome.detail.unwrap().contains("insufficient gas"));
        assert!(chain.state().swaps.is_empty());
    }

    #[tokio::test]
    async fn test_balanced_wallet_needs_no_swap() {
        let (chain, orchestrator) = setup();
        let outcome = orchestrator.balance_portfolio().await;
        assert!(outcome.success);
        assert_eq!(outcome.detail.as_deref(), Some("already balanced"));
        assert!(chain.state().swaps.is_empty());
    }

    #[tokio::test]
    async fn test_swap_rejects_insufficient_balance() {
        let (chain, orchestrator) = setup();
        let outcome = orchestrator
            .execute_action(&RebalanceAction::SwapTokens {
                token_in: chain.token0,
                token_out: chain.token1,
                amount_in: 5000.0,
                priority: Priority::Medium,
            })
            .await;
        assert!(!outcome.success);
        assert!(outcome.detail.unwrap().contains("insufficient TK0 balance"));
        assert!(chain.state().swaps.is_empty());
    }

    #[tokio::test]
    async fn test_mint_uses_allocation_and_slippage() {
        let (chain, orchestrator) = setup();
        let outcome = orchestrator
            .open_position(TickRange::new(-600, 600), 5.0)
            .await;
        assert!(outcome.success);
        assert!(outcome.minted_token_id.is_some());

        let state = chain.state();
        let mint = &state.mints[0];
        assert!((mint.amount0 - 800.0).abs() < 1e-9);
        assert!((mint.amount1 - 800.0).abs() < 1e-9);
        assert!((mint.amount0_min - 800.0 * 0.92).abs() < 1e-9);
        assert_eq!((mint.tick_lower, mint.tick_upper), (-600, 600));
    }

    #[tokio::test]
    async fn test_mint_failure_after_close_aborts_plan() {
        let (chain, orchestrator) = setup();
        let position = chain.add_position(7, 600, 1200, 5_000);
        orchestrator.track(position.token_id);
        chain.state().mint_failures = 10;

        let pool = chain.pool_state(chain.pool).await.unwrap();
        let analysis = orchestrator.evaluate(&position, &pool, 0.0);
        let outcome = orchestrator
            .rebalance(&position, &analysis, &VolatilityEstimator::new(), &no_stop())
            .await
            .unwrap();

        assert_eq!(outcome.status, PlanStatus::Aborted);
        assert_eq!(outcome.actions.len(), 3);
        assert!(outcome.actions[0].success);
        assert_eq!(outcome.actions[2].kind, "create_position");
        assert_eq!(outcome.actions[2].attempts, 3);
        assert!(outcome.new_token_id.is_none());
        assert!(outcome.unresolved_mint().is_none());
        assert_eq!(
            chain.state().calls,
            vec!["decrease_liquidity", "collect", "mint", "mint", "mint"]
        );

        let history = orchestrator.history_snapshot();
        assert_eq!(history.len(), 1);
        assert!(!history[0].success);
        assert_eq!(history[0].status, PlanStatus::Aborted);
        assert_eq!(orchestrator.metrics(&position.token_id).unwrap().total_rebalances, 1);
    }

    #[tokio::test]
    async fn test_mint_retries_widen_minimums() {
        let (chain, orchestrator) = setup();
        chain.state().mint_failures = 2;

        let outcome = orchestrator
            .open_position(TickRange::new(-600, 600), 5.0)
            .await;
        assert!(outcome.success);
        assert_eq!(outcome.attempts, 3);

        let state = chain.state();
        let mins: Vec<f64> = state.mints.iter().map(|m| m.amount0_min).collect();
        assert_eq!(mins.len(), 3);
        for (min, pct) in mins.iter().zip([0.92, 0.91, 0.90]) {
            assert!((min - 800.0 * pct).abs() < 1e-9);
        }
    }

    #[tokio::test]
    async fn test_mint_without_token_id_fails_step() {
        let (chain, orchestrator) = setup();
        let position = chain.add_position(7, 600, 1200, 5_000);
        orchestrator.track(position.token_id);
        chain.state().hide_minted_id = true;

        let pool = chain.pool_state(chain.pool).await.unwrap();
        let analysis = orchestrator.evaluate(&position, &pool, 0.0);
        let outcome = orchestrator
            .rebalance(&position, &analysis, &VolatilityEstimator::new(), &no_stop())
            .await
            .unwrap();

        assert_eq!(outcome.status, PlanStatus::Aborted);
        assert!(!outcome.is_success());
        assert!(outcome.new_token_id.is_none());
        assert_eq!(outcome.reason.as_deref(), Some(MINT_ID_MISSING));
        let create = outcome.actions.last().unwrap();
        assert!(!create.success);
        assert_eq!(create.tx_hashes.len(), 1);
        assert_eq!(outcome.unresolved_mint(), Some(create.tx_hashes[0]));

        // Only one mint went out and the metrics stay with the old id
        assert_eq!(chain.state().mints.len(), 1);
        assert!(orchestrator.metrics(&position.token_id).is_some());
        assert!(!orchestrator.history_snapshot()[0].success);
    }

    #[tokio::test]
    async fn test_denied_approval_fails_step() {
        let (chain, orchestrator) = setup();
        chain.set_balance(Asset::Token(chain.token1), 0.0);
        chain.state().approval_denied = true;

        let balanced = orchestrator.balance_portfolio().await;
        assert!(!balanced.success);
        assert_eq!(balanced.attempts, 0);
        assert!(balanced.detail.unwrap().contains("TK0 approval not granted"));

        let opened = orchestrator
            .open_position(TickRange::new(-600, 600), 5.0)
            .await;
        assert!(!opened.success);
        assert!(opened.detail.unwrap().contains("approval not granted"));

        let state = chain.state();
        assert!(state.swaps.is_empty());
        assert!(state.mints.is_empty());
        assert_eq!(state.approvals.len(), 2);
    }

    #[tokio::test]
    async fn test_price_reread_failure_leaves_plan_incomplete() {
        let (chain, orchestrator) = setup();
        let position = chain.add_position(7, 600, 1200, 5_000);
        let pool = chain.pool_state(chain.pool).await.unwrap();
        let analysis = orchestrator.evaluate(&position, &pool, 0.0);

        chain.state().pool_read_failures = 1;
        let outcome = orchestrator
            .rebalance(&position, &analysis, &VolatilityEstimator::new(), &no_stop())
            .await
            .unwrap();

        assert_eq!(outcome.status, PlanStatus::Incomplete);
        assert_eq!(outcome.actions.len(), 2);
        assert!(outcome.actions.iter().all(|a| a.success));
        assert_eq!(outcome.reason.as_deref(), Some("current price unavailable"));
        assert!(!chain.state().calls.contains(&"mint"));
    }

    #[tokio::test]
    async fn test_balance_fails_while_pool_is_down() {
        let (chain, orchestrator) = setup();
        chain.set_balance(Asset::Token(chain.token1), 0.0);
        chain.state().pool_unavailable = true;

        let outcome = orchestrator.balance_portfolio().await;
        assert!(!outcome.success);
        assert!(outcome.detail.unwrap().contains("pool unavailable"));
        assert!(chain.state().swaps.is_empty());
    }

    #[tokio::test]
    async fn test_close_collects_into_wallet() {
        let (chain, orchestrator) = setup();
        let position = chain.add_position(5, -600, 600, 2_000);
        {
            let mut state = chain.state();
            state.collect_proceeds = (25.0, 50.0);
            if let Some(p) = state.positions.get_mut(&position.token_id) {
                p.tokens_owed0 = 7;
                p.tokens_owed1 = 9;
            }
        }

        let outcome = orchestrator
            .execute_action(&RebalanceAction::ClosePosition {
                token_id: position.token_id,
                liquidity: position.liquidity,
                priority: Priority::High,
            })
            .await;
        assert!(outcome.success);
        assert_eq!(outcome.tx_hashes.len(), 2);

        assert!((chain.balance(Asset::Token(chain.token0)) - 1025.0).abs() < 1e-9);
        assert!((chain.balance(Asset::Token(chain.token1)) - 1050.0).abs() < 1e-9);
        let state = chain.state();
        assert_eq!(state.calls, vec!["decrease_liquidity", "collect"]);
        let closed = &state.positions[&position.token_id];
        assert_eq!(closed.liquidity, 0);
        assert_eq!((closed.tokens_owed0, closed.tokens_owed1), (0, 0));
    }

    #[tokio::test]
    async fn test_mutations_never_overlap() {
        let (chain, orchestrator) = setup();
        let swap = |token_in, token_out| RebalanceAction::SwapTokens {
            token_in,
            token_out,
            amount_in: 10.0,
            priority: Priority::Low,
        };
        let a = swap(chain.token0, chain.token1);
        let b = swap(chain.token1, chain.token0);

        let (first, second) = tokio::join!(
            orchestrator.execute_action(&a),
            orchestrator.execute_action(&b)
        );
        assert!(first.success && second.success);
        assert_eq!(chain.state().max_in_flight, 1);
    }

    #[tokio::test]
    async fn test_stop_flag_cancels_between_steps() {
        let (chain, orchestrator) = setup();
        let (tx, rx) = watch::channel(true);

        let plan = plan_with(
            7,
            Urgency::High,
            vec![
                RebalanceAction::AutoBalance {
                    target_ratio: 0.5,
                    priority: Priority::High,
                },
                RebalanceAction::CreatePosition {
                    range: TickRange::new(-600, 600),
                    range_percent: 5.0,
                    priority: Priority::High,
                },
            ],
        );
        let outcome = orchestrator.execute_plan(plan, &rx).await;
        drop(tx);

        assert_eq!(outcome.status, PlanStatus::Cancelled);
        assert_eq!(outcome.actions.len(), 1);
        assert!(chain.state().mints.is_empty());
    }

    #[tokio::test]
    async fn test_history_is_capped() {
        let (_chain, orchestrator) = setup();
        for _ in 0..(HISTORY_CAPACITY + 5) {
            let plan = plan_with(
                7,
                Urgency::Low,
                vec![RebalanceAction::AutoBalance {
                    target_ratio: 0.5,
                    priority: Priority::Low,
                }],
            );
            orchestrator.execute_plan(plan, &no_stop()).await;
        }
        assert_eq!(orchestrator.history_snapshot().len(), HISTORY_CAPACITY);
    }

    #[tokio::test]
    async fn test_statistics_from_history() {
        let (_chain, orchestrator) = setup();
        let start = Utc::now() - ChronoDuration::seconds(300);
        let entry = |offset: i64, urgency, success| RebalanceHistoryEntry {
            plan_id: uuid::Uuid::new_v4(),
            token_id: U256::from(1u64),
            timestamp: start + ChronoDuration::seconds(offset),
            reason: "r".to_string(),
            urgency,
            health_score_before: 0.0,
            success,
            actions_count: 3,
            status: PlanStatus::Completed,
            new_token_id: None,
        };
        orchestrator.restore_history(vec![
            entry(0, Urgency::High, true),
            entry(60, Urgency::Medium, false),
            entry(180, Urgency::High, true),
            entry(240, Urgency::Low, true),
        ]);

        let stats = orchestrator.statistics(2);
        assert_eq!(stats.total_rebalances, 4);
        assert_eq!(stats.successful_rebalances, 3);
        assert!((stats.success_rate - 0.75).abs() < 1e-12);
        assert!((stats.avg_secs_between_rebalances - 80.0).abs() < 1e-9);
        assert_eq!(
            stats.urgency_distribution,
            UrgencyDistribution {
                high: 2,
                medium: 1,
                low: 1
            }
        );
        assert_eq!(stats.recent_history.len(), 4);
        assert_eq!(stats.active_positions, 2);
    }

    #[tokio::test]
    async fn test_baseline_credits_no_in_range_time() {
        let (chain, orchestrator) = setup();
        let position = chain.add_position(9, -600, 600, 1_000);
        orchestrator.track(position.token_id);
        let pool = chain.pool_state(chain.pool).await.unwrap();

        let first = orchestrator.baseline(&position, &pool, 0.0);
        let metrics = orchestrator.metrics(&position.token_id).unwrap();
        assert_eq!(metrics.in_range_secs, 0);
        assert_eq!(metrics.last_health_score, first.health_score);
        assert_eq!(orchestrator.last_analysis(&position.token_id).unwrap(), first);

        orchestrator.evaluate(&position, &pool, 0.0);
        assert_eq!(orchestrator.metrics(&position.token_id).unwrap().in_range_secs, 30);
    }

    #[tokio::test]
    async fn test_evaluate_updates_metrics_and_last_analysis() {
        let (chain, orchestrator) = setup();
        let position = chain.add_position(9, -600, 600, 1_000);
        orchestrator.track(position.token_id);
        let pool = chain.pool_state(chain.pool).await.unwrap();

        orchestrator.evaluate(&position, &pool, 0.0);
        let analysis = orchestrator.evaluate(&position, &pool, 0.0);

        let metrics = orchestrator.metrics(&position.token_id).unwrap();
        assert_eq!(metrics.in_range_secs, 60);
        assert_eq!(metrics.last_health_score, analysis.health_score);
        assert_eq!(
            orchestrator.last_analysis(&position.token_id).unwrap(),
            analysis
        );

        orchestrator.untrack(position.token_id);
        assert!(orchestrator.metrics(&position.token_id).is_none());
        assert!(orchestrator.last_analysis(&position.token_id).is_none());
        assert!(orchestrator.performance(&position.token_id).is_none());
    }
}
