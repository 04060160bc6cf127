use alloy_primitives::Address;
use eyre::Result;
use std::fmt::Display;
use std::str::FromStr;
use std::time::Duration;
use tracing::warn;

use crate::networks::{self, NetworkConfig};

/// How the range width reacts to market conditions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RangeMethod {
    Fixed,
    VolatilityBased,
    Adaptive,
}

impl RangeMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            RangeMethod::Fixed => "fixed",
            RangeMethod::VolatilityBased => "volatility_based",
            RangeMethod::Adaptive => "adaptive",
        }
    }
}

impl FromStr for RangeMethod {
    type Err = eyre::Report;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "fixed" => Ok(RangeMethod::Fixed),
            "volatility_based" | "volatility" => Ok(RangeMethod::VolatilityBased),
            "adaptive" => Ok(RangeMethod::Adaptive),
            other => Err(eyre::eyre!(
                "unknown range method '{}' (expected fixed, volatility_based or adaptive)",
                other
            )),
        }
    }
}

impl Display for RangeMethod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Range width policy inputs.
#[derive(Debug, Clone, PartialEq)]
pub struct RangeConfig {
    pub base_range_percent: f64,
    pub min_range_percent: f64,
    pub max_range_percent: f64,
    pub dynamic_range: bool,
    pub method: RangeMethod,
    pub volatility_multiplier: f64,
    pub range_buffer_percent: f64,
    pub volatility_periods: usize,
}

impl Default for RangeConfig {
    fn default() -> Self {
        Self {
            base_range_percent: 5.0,
            min_range_percent: 1.0,
            max_range_percent: 20.0,
            dynamic_range: true,
            method: RangeMethod::Adaptive,
            volatility_multiplier: 1.5,
            range_buffer_percent: 10.0,
            volatility_periods: 10,
        }
    }
}

/// Slippage, retry and pacing knobs for mutating actions.
#[derive(Debug, Clone, PartialEq)]
pub struct ExecutionConfig {
    pub swap_base_slippage_pct: f64,
    pub swap_slippage_step_pct: f64,
    pub position_base_slippage_pct: f64,
    pub position_slippage_step_pct: f64,
    pub max_retries: u32,
    pub swap_retry_delay: Duration,
    pub swap_retry_increment: Duration,
    pub position_retry_delay: Duration,
    pub position_retry_increment: Duration,
    /// Pause between successive plan steps.
    pub settle_delay: Duration,
    /// Native balance below which no mutation is attempted.
    pub min_gas_balance: f64,
    pub target_ratio: f64,
    pub min_swap_value: f64,
    /// Share of each token balance committed to a new position.
    pub position_allocation: f64,
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            swap_base_slippage_pct: 4.0,
            swap_slippage_step_pct: 2.0,
            position_base_slippage_pct: 8.0,
            position_slippage_step_pct: 1.0,
            max_retries: 3,
            swap_retry_delay: Duration::from_secs(5),
            swap_retry_increment: Duration::from_secs(5),
            position_retry_delay: Duration::from_secs(10),
            position_retry_increment: Duration::from_secs(5),
            settle_delay: Duration::from_secs(20),
            min_gas_balance: 0.01,
            target_ratio: 0.5,
            min_swap_value: 0.01,
            position_allocation: 0.8,
        }
    }
}

// Configuration struct
#[derive(Debug, Clone)]
pub struct BotConfig {
    pub rpc_url: String,
    pub private_key: String,
    pub network: NetworkConfig,
    pub database_url: String,
    pub token0_address: Address,
    pub token1_address: Address,
    pub pool_fee: u32,
    pub tick_spacing: i32,
    pub rebalance_threshold: f64,
    pub check_interval_secs: u64,
    pub price_api_url: Option<String>,
    pub range: RangeConfig,
    pub execution: ExecutionConfig,
}

impl BotConfig {
    pub fn from_env() -> Result<Self> {
        dotenvy::dotenv().ok();

        let network_name = std::env::var("NETWORK").unwrap_or_else(|_| "celo".to_string());
        let network = networks::get(&network_name)
            .ok_or_else(|| eyre::eyre!("Unsupported NETWORK '{}'", network_name))?;

        let rpc_url = std::env::var("RPC_URL").unwrap_or_else(|_| network.rpc_url.to_string());

        let private_key = std::env::var("PRIVATE_KEY")
            .map_err(|_| eyre::eyre!("PRIVATE_KEY environment variable not set"))?;

        let token0_address = required_address("TOKEN0_ADDRESS")?;
        let token1_address = required_address("TOKEN1_ADDRESS")?;
        if token0_address == token1_address {
            return Err(eyre::eyre!("TOKEN0_ADDRESS and TOKEN1_ADDRESS must differ"));
        }
        // Pools order their tokens by address; keep the same orientation everywhere
        let (token0_address, token1_address) = if token0_address > token1_address {
            warn!("TOKEN0_ADDRESS sorts after TOKEN1_ADDRESS, swapping to pool order");
            (token1_address, token0_address)
        } else {
            (token0_address, token1_address)
        };

        let database_url = std::env::var("DATABASE_URL")
            .unwrap_or_else(|_| "sqlite:liquidity_bot.db".to_string());

        let pool_fee = env_or("POOL_FEE", 100u32);
        if !networks::is_valid_fee(pool_fee) {
            return Err(eyre::eyre!(
                "POOL_FEE {} is not a Uniswap V3 fee tier (100, 500, 3000, 10000)",
                pool_fee
            ));
        }
        let tick_spacing = env_or("TICK_SPACING", networks::tick_spacing_for_fee(pool_fee));

        let method = match std::env::var("RANGE_CALCULATION_METHOD") {
            Ok(raw) => match raw.parse::<RangeMethod>() {
                Ok(method) => method,
                Err(e) => {
                    warn!("{}. Using default adaptive.", e);
                    RangeMethod::Adaptive
                }
            },
            Err(_) => RangeMethod::Adaptive,
        };

        let defaults = RangeConfig::default();
        let range = RangeConfig {
            base_range_percent: env_or("PRICE_RANGE_PERCENT", defaults.base_range_percent),
            min_range_percent: env_or("MIN_PRICE_RANGE_PERCENT", defaults.min_range_percent),
            max_range_percent: env_or("MAX_PRICE_RANGE_PERCENT", defaults.max_range_percent),
            dynamic_range: env_or("DYNAMIC_RANGE", defaults.dynamic_range),
            method,
            volatility_multiplier: env_or("VOLATILITY_MULTIPLIER", defaults.volatility_multiplier),
            range_buffer_percent: env_or("RANGE_BUFFER_PERCENT", defaults.range_buffer_percent),
            volatility_periods: env_or("PRICE_CHECK_PERIODS", defaults.volatility_periods),
        };

        let defaults = ExecutionConfig::default();
        let execution = ExecutionConfig {
            swap_base_slippage_pct: env_or("BASE_SLIPPAGE_PERCENT", defaults.swap_base_slippage_pct),
            swap_slippage_step_pct: env_or(
                "SWAP_SLIPPAGE_STEP_PERCENT",
                defaults.swap_slippage_step_pct,
            ),
            position_base_slippage_pct: env_or(
                "POSITION_SLIPPAGE_PERCENT",
                defaults.position_base_slippage_pct,
            ),
            position_slippage_step_pct: env_or(
                "POSITION_SLIPPAGE_STEP_PERCENT",
                defaults.position_slippage_step_pct,
            ),
            max_retries: env_or("MAX_RETRIES", defaults.max_retries),
            settle_delay: Duration::from_secs(env_or("SETTLE_DELAY_SECS", 20u64)),
            min_gas_balance: env_or("MIN_GAS_BALANCE", defaults.min_gas_balance),
            target_ratio: env_or("TARGET_RATIO", defaults.target_ratio),
            min_swap_value: env_or("MIN_SWAP_VALUE", defaults.min_swap_value),
            position_allocation: env_or("POSITION_ALLOCATION", defaults.position_allocation),
            ..defaults
        };

        let mut config = Self {
            rpc_url,
            private_key,
            network,
            database_url,
            token0_address,
            token1_address,
            pool_fee,
            tick_spacing,
            rebalance_threshold: env_or("REBALANCE_THRESHOLD", 0.8),
            check_interval_secs: env_or("CHECK_INTERVAL_SECS", 30u64),
            price_api_url: std::env::var("PRICE_API_URL").ok(),
            range,
            execution,
        };
        config.validate_range_settings();

        Ok(config)
    }

    /// Repair inconsistent range settings in place instead of refusing to start.
    pub fn validate_range_settings(&mut self) {
        let range = &mut self.range;

        if range.base_range_percent <= 0.0 || !range.base_range_percent.is_finite() {
            warn!(
                "PRICE_RANGE_PERCENT {} is not positive. Using default 5%.",
                range.base_range_percent
            );
            range.base_range_percent = 5.0;
        }
        if range.min_range_percent >= range.base_range_percent {
            range.min_range_percent = range.base_range_percent * 0.5;
            warn!("Min range adjusted to {:.2}%", range.min_range_percent);
        }
        if range.max_range_percent <= range.base_range_percent {
            range.max_range_percent = range.base_range_percent * 3.0;
            warn!("Max range adjusted to {:.2}%", range.max_range_percent);
        }
        if range.volatility_periods < 2 {
            warn!("PRICE_CHECK_PERIODS must be at least 2. Using default 10.");
            range.volatility_periods = 10;
        }

        let clamped = self.rebalance_threshold.clamp(0.5, 0.95);
        if (clamped - self.rebalance_threshold).abs() > f64::EPSILON {
            warn!(
                "REBALANCE_THRESHOLD {} outside [0.5, 0.95], clamped to {}",
                self.rebalance_threshold, clamped
            );
            self.rebalance_threshold = clamped;
        }

        if self.check_interval_secs == 0 {
            warn!("CHECK_INTERVAL_SECS cannot be 0. Using default 30 seconds.");
            self.check_interval_secs = 30;
        }

        let exec = &mut self.execution;
        if !(0.0..1.0).contains(&exec.target_ratio) || exec.target_ratio == 0.0 {
            warn!("TARGET_RATIO {} must be in (0, 1). Using 0.5.", exec.target_ratio);
            exec.target_ratio = 0.5;
        }
        if exec.position_allocation <= 0.0 || exec.position_allocation > 1.0 {
            warn!(
                "POSITION_ALLOCATION {} must be in (0, 1]. Using 0.8.",
                exec.position_allocation
            );
            exec.position_allocation = 0.8;
        }
        if exec.max_retries == 0 {
            warn!("MAX_RETRIES cannot be 0. Using 1.");
            exec.max_retries = 1;
        }
    }

    pub fn check_interval(&self) -> Duration {
        Duration::from_secs(self.check_interval_secs)
    }

    /// Printable summary of the active range policy.
    pub fn range_summary(&self) -> String {
        let r = &self.range;
        format!(
            "Range method: {}\n\
             Base range: {:.2}%\n\
             Min/Max range: {:.2}% / {:.2}%\n\
             Dynamic range: {}\n\
             Volatility multiplier: {:.2}\n\
             Range buffer: {:.2}%\n\
             Volatility periods: {}\n\
             Rebalance threshold: {:.2}\n\
             Pool fee: {} (tick spacing {})",
            r.method,
            r.base_range_percent,
            r.min_range_percent,
            r.max_range_percent,
            r.dynamic_range,
            r.volatility_multiplier,
            r.range_buffer_percent,
            r.volatility_periods,
            self.rebalance_threshold,
            self.pool_fee,
            self.tick_spacing,
        )
    }
}

fn required_address(key: &str) -> Result<Address> {
    let raw = std::env::var(key)
        .map_err(|_| eyre::eyre!("{} environment variable not set", key))?;
    raw.parse::<Address>()
        .map_err(|e| eyre::eyre!("Invalid {} address '{}': {}", key, raw, e))
}

/// Parse an optional variable, warning and falling back on bad input.
fn env_or<T>(key: &str, default: T) -> T
where
    T: FromStr + Display,
    T::Err: Display,
{
    match std::env::var(key) {
        Ok(raw) => match raw.trim().parse::<T>() {
            Ok(value) => value,
            Err(e) => {
                warn!("Invalid {} '{}': {}. Using default {}.", key, raw, e, default);
                default
            }
        },
        Err(_) => default,
    }
}

#[cfg(test)]
pub(crate) fn create_test_config() -> BotConfig {
    BotConfig {
        rpc_url: "http://localhost:8545".to_string(),
        private_key: "0x0000000000000000000000000000000000000000000000000000000000000001"
            .to_string(),
        network: networks::celo(),
        database_url: "sqlite::memory:".to_string(),
        token0_address: Address::repeat_byte(0x11),
        token1_address: Address::repeat_byte(0x22),
        pool_fee: 3000,
        tick_spacing: 60,
        rebalance_threshold: 0.8,
        check_interval_secs: 30,
        price_api_url: None,
        range: RangeConfig::default(),
        execution: ExecutionConfig {
            swap_retry_delay: Duration::ZERO,
            swap_retry_increment: Duration::ZERO,
            position_retry_delay: Duration::ZERO,
            position_retry_increment: Duration::ZERO,
            settle_delay: Duration::ZERO,
            ..ExecutionConfig::default()
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_range_method_parsing() {
        assert_eq!("fixed".parse::<RangeMethod>().unwrap(), RangeMethod::Fixed);
        assert_eq!(
            "Volatility_Based".parse::<RangeMethod>().unwrap(),
            RangeMethod::VolatilityBased
        );
        assert_eq!("adaptive".parse::<RangeMethod>().unwrap(), RangeMethod::Adaptive);
        assert!("random".parse::<RangeMethod>().is_err());
    }

    #[test]
    fn test_validate_repairs_min_and_max() {
        let mut config = create_test_config();
        config.range.base_range_percent = 4.0;
        config.range.min_range_percent = 6.0;
        config.range.max_range_percent = 3.0;
        config.validate_range_settings();

        assert_eq!(config.range.min_range_percent, 2.0);
        assert_eq!(config.range.max_range_percent, 12.0);
    }

    #[test]
    fn test_validate_clamps_threshold_and_interval() {
        let mut config = create_test_config();
        config.rebalance_threshold = 0.99;
        config.check_interval_secs = 0;
        config.validate_range_settings();
        assert_eq!(config.rebalance_threshold, 0.95);
        assert_eq!(config.check_interval_secs, 30);

        config.rebalance_threshold = 0.1;
        config.validate_range_settings();
        assert_eq!(config.rebalance_threshold, 0.5);
    }

    #[test]
    fn test_validate_keeps_default_threshold() {
        let mut config = create_test_config();
        config.validate_range_settings();
        assert_eq!(config.rebalance_threshold, 0.8);
        assert_eq!(config.range, RangeConfig::default());
    }

    #[test]
    fn test_range_summary_mentions_method() {
        let config = create_test_config();
        let summary = config.range_summary();
        assert!(summary.contains("adaptive"));
        assert!(summary.contains("tick spacing 60"));
    }
}
