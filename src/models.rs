use alloy_primitives::{Address, U256};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// NonfungiblePositionManager NFT id.
pub type TokenId = U256;

/// One pool price observation.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PricePoint {
    pub price: f64,
    pub tick: i32,
    pub timestamp: DateTime<Utc>,
}

impl PricePoint {
    pub fn new(price: f64, tick: i32) -> Self {
        Self {
            price,
            tick,
            timestamp: Utc::now(),
        }
    }
}

/// On-chain position snapshot, fetched fresh for every analysis.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Position {
    pub token_id: TokenId,
    pub token0: Address,
    pub token1: Address,
    pub fee: u32,
    pub tick_lower: i32,
    pub tick_upper: i32,
    pub liquidity: u128,
    pub tokens_owed0: u128,
    pub tokens_owed1: u128,
}

impl Position {
    pub fn range(&self) -> TickRange {
        TickRange::new(self.tick_lower, self.tick_upper)
    }

    pub fn has_liquidity(&self) -> bool {
        self.liquidity > 0
    }
}

/// Pool `slot0` read.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PoolState {
    pub address: Address,
    pub sqrt_price_x96: U256,
    /// Raw token1-per-token0 price in base units, `(sqrtPriceX96 / 2^96)^2`.
    pub price: f64,
    pub tick: i32,
}

impl PoolState {
    pub fn from_slot0(address: Address, sqrt_price_x96: U256, tick: i32) -> Self {
        Self {
            address,
            sqrt_price_x96,
            price: price_from_sqrt_x96(sqrt_price_x96),
            tick,
        }
    }

    /// Price of one whole token0 in whole token1.
    pub fn human_price(&self, decimals0: u8, decimals1: u8) -> f64 {
        self.price * 10f64.powi(decimals0 as i32 - decimals1 as i32)
    }
}

pub fn price_from_sqrt_x96(sqrt_price_x96: U256) -> f64 {
    let sqrt = sqrt_price_x96.to_string().parse::<f64>().unwrap_or(0.0) / 2f64.powi(96);
    sqrt * sqrt
}

/// A concrete `[lower, upper]` tick pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TickRange {
    pub lower: i32,
    pub upper: i32,
}

impl TickRange {
    pub fn new(lower: i32, upper: i32) -> Self {
        Self { lower, upper }
    }

    pub fn width(&self) -> i32 {
        self.upper - self.lower
    }

    pub fn center(&self) -> i32 {
        self.lower + self.width() / 2
    }

    pub fn contains(&self, tick: i32) -> bool {
        self.lower <= tick && tick <= self.upper
    }
}

impl fmt::Display for TickRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {}]", self.lower, self.upper)
    }
}

/// Where the pool tick sits relative to a position's bounds. Derived, never stored.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RangeStatus {
    pub in_range: bool,
    pub current_tick: i32,
    pub tick_lower: i32,
    pub tick_upper: i32,
    pub position_ratio: f64,
    pub range_utilization: f64,
    pub tick_deviation: f64,
    pub volatility: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Urgency {
    High,
    Medium,
    Low,
    None,
}

impl Urgency {
    pub fn priority(&self) -> Priority {
        match self {
            Urgency::High => Priority::High,
            Urgency::Medium => Priority::Medium,
            Urgency::Low | Urgency::None => Priority::Low,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Urgency::High => "HIGH",
            Urgency::Medium => "MEDIUM",
            Urgency::Low => "LOW",
            Urgency::None => "NONE",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_uppercase().as_str() {
            "HIGH" => Some(Urgency::High),
            "MEDIUM" => Some(Urgency::Medium),
            "LOW" => Some(Urgency::Low),
            "NONE" => Some(Urgency::None),
            _ => None,
        }
    }
}

impl fmt::Display for Urgency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Execution priority of a plan step. Lower value runs first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Priority {
    High = 1,
    Medium = 2,
    Low = 3,
}

impl Priority {
    pub fn value(&self) -> u8 {
        *self as u8
    }
}

/// Latest health evaluation of one position.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthAnalysis {
    pub token_id: TokenId,
    pub needs_rebalance: bool,
    pub urgency: Urgency,
    pub reason: String,
    pub health_score: f64,
    pub range_status: RangeStatus,
    pub liquidity: u128,
    pub analyzed_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SwapDirection {
    /// token0 in, token1 out
    ZeroForOne,
    /// token1 in, token0 out
    OneForZero,
}

/// Result of the portfolio balancing computation. Amounts are in whole tokens.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SwapIntent {
    pub direction: SwapDirection,
    pub amount_in: f64,
    pub diff0: f64,
    pub diff1: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum RebalanceAction {
    ClosePosition {
        token_id: TokenId,
        liquidity: u128,
        priority: Priority,
    },
    AutoBalance {
        target_ratio: f64,
        priority: Priority,
    },
    SwapTokens {
        token_in: Address,
        token_out: Address,
        amount_in: f64,
        priority: Priority,
    },
    CreatePosition {
        range: TickRange,
        range_percent: f64,
        priority: Priority,
    },
}

impl RebalanceAction {
    pub fn priority(&self) -> Priority {
        match self {
            RebalanceAction::ClosePosition { priority, .. }
            | RebalanceAction::AutoBalance { priority, .. }
            | RebalanceAction::SwapTokens { priority, .. }
            | RebalanceAction::CreatePosition { priority, .. } => *priority,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            RebalanceAction::ClosePosition { .. } => "close_position",
            RebalanceAction::AutoBalance { .. } => "auto_balance",
            RebalanceAction::SwapTokens { .. } => "swap_tokens",
            RebalanceAction::CreatePosition { .. } => "create_position",
        }
    }

    pub fn is_mutating(&self) -> bool {
        !matches!(self, RebalanceAction::AutoBalance { .. })
    }
}

/// Ordered corrective actions for one rebalance decision. Consumed once.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RebalancePlan {
    pub id: Uuid,
    pub token_id: TokenId,
    pub reason: String,
    pub urgency: Urgency,
    pub health_score_before: f64,
    pub actions: Vec<RebalanceAction>,
    /// Set when range computation stopped the plan before `CreatePosition`.
    pub incomplete_reason: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl RebalancePlan {
    pub fn new(analysis: &HealthAnalysis) -> Self {
        Self {
            id: Uuid::new_v4(),
            token_id: analysis.token_id,
            reason: analysis.reason.clone(),
            urgency: analysis.urgency,
            health_score_before: analysis.health_score,
            actions: Vec::new(),
            incomplete_reason: None,
            created_at: Utc::now(),
        }
    }

    /// A plan is complete only when it ends by opening a new position.
    pub fn is_complete(&self) -> bool {
        matches!(
            self.actions.last(),
            Some(RebalanceAction::CreatePosition { .. })
        )
    }

    /// Stable sort, so equal priorities keep planning order.
    pub fn sort_by_priority(&mut self) {
        self.actions.sort_by_key(|a| a.priority());
    }

    pub fn len(&self) -> usize {
        self.actions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.actions.is_empty()
    }
}

/// Per-position counters, created on add and dropped on remove.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PositionMetrics {
    pub token_id: TokenId,
    pub last_health_score: f64,
    pub last_check_time: DateTime<Utc>,
    pub in_range_secs: u64,
    pub total_rebalances: u32,
    pub added_at: DateTime<Utc>,
}

impl PositionMetrics {
    pub fn new(token_id: TokenId) -> Self {
        let now = Utc::now();
        Self {
            token_id,
            last_health_score: 100.0,
            last_check_time: now,
            in_range_secs: 0,
            total_rebalances: 0,
            added_at: now,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlanStatus {
    Completed,
    Incomplete,
    Aborted,
    Cancelled,
}

impl PlanStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PlanStatus::Completed => "completed",
            PlanStatus::Incomplete => "incomplete",
            PlanStatus::Aborted => "aborted",
            PlanStatus::Cancelled => "cancelled",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "completed" => Some(PlanStatus::Completed),
            "incomplete" => Some(PlanStatus::Incomplete),
            "aborted" => Some(PlanStatus::Aborted),
            "cancelled" => Some(PlanStatus::Cancelled),
            _ => None,
        }
    }
}

/// Summary of one executed plan. Kept in a 50-entry rolling log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RebalanceHistoryEntry {
    pub plan_id: Uuid,
    pub token_id: TokenId,
    pub timestamp: DateTime<Utc>,
    pub reason: String,
    pub urgency: Urgency,
    pub health_score_before: f64,
    pub success: bool,
    pub actions_count: usize,
    pub status: PlanStatus,
    pub new_token_id: Option<TokenId>,
}

/// Operator-facing record of a position under monitoring.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MonitoredPosition {
    pub token_id: TokenId,
    pub token0_symbol: String,
    pub token1_symbol: String,
    pub added_at: DateTime<Utc>,
    pub last_check: Option<DateTime<Utc>>,
    pub last_rebalance: Option<DateTime<Utc>>,
    pub rebalance_count: u32,
}

impl MonitoredPosition {
    pub fn new(token_id: TokenId, token0_symbol: &str, token1_symbol: &str) -> Self {
        Self {
            token_id,
            token0_symbol: token0_symbol.to_string(),
            token1_symbol: token1_symbol.to_string(),
            added_at: Utc::now(),
            last_check: None,
            last_rebalance: None,
            rebalance_count: 0,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UrgencyDistribution {
    pub high: usize,
    pub medium: usize,
    pub low: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RebalanceStatistics {
    pub total_rebalances: usize,
    pub successful_rebalances: usize,
    pub success_rate: f64,
    pub avg_secs_between_rebalances: f64,
    pub urgency_distribution: UrgencyDistribution,
    pub recent_history: Vec<RebalanceHistoryEntry>,
    pub active_positions: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PositionPerformance {
    pub token_id: TokenId,
    pub total_monitoring_secs: f64,
    pub in_range_secs: u64,
    pub in_range_percentage: f64,
    pub total_rebalances: u32,
    pub last_health_score: f64,
    pub rebalances_per_hour: f64,
}
