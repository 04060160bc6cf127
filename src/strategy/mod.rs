//! Pure decision logic: tick math, volatility, range sizing, health scoring,
//! plan construction and portfolio balancing. Nothing in here touches the chain.

pub mod balancer;
pub mod health;
pub mod planner;
pub mod range;
pub mod tick_math;
pub mod volatility;

pub use balancer::PortfolioBalancer;
pub use health::PositionHealthAnalyzer;
pub use planner::RebalancePlanner;
pub use range::RangeCalculator;
pub use volatility::VolatilityEstimator;
