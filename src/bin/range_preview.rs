use clap::Parser;
use eyre::Result;
use liquidity_bot::config::{RangeConfig, RangeMethod};
use liquidity_bot::networks;
use liquidity_bot::strategy::range::range_prices;
use liquidity_bot::strategy::{RangeCalculator, VolatilityEstimator};
use tracing::{debug, info};
use tracing_subscriber::EnvFilter;

/// Offline range calculator: feed a price series, get the tick range a new
/// position would be opened with. Never touches the chain.
#[derive(Parser)]
#[command(name = "range-preview")]
#[command(about = "Preview the tick range for a price series", long_about = None)]
struct Cli {
    /// Prices in token1 per token0, oldest first; the last one is the current price
    #[arg(required = true, num_args = 1.., value_delimiter = ',')]
    prices: Vec<f64>,

    /// Pool fee tier in hundredths of a bip
    #[arg(long, default_value = "3000")]
    fee: u32,

    /// Tick spacing override (derived from the fee tier otherwise)
    #[arg(long)]
    tick_spacing: Option<i32>,

    /// fixed, volatility_based or adaptive
    #[arg(long, default_value = "adaptive")]
    method: RangeMethod,

    #[arg(long, default_value = "5.0")]
    base_range: f64,

    #[arg(long, default_value = "1.0")]
    min_range: f64,

    #[arg(long, default_value = "20.0")]
    max_range: f64,

    #[arg(long, default_value = "1.5")]
    volatility_multiplier: f64,

    /// Samples used for the volatility estimate
    #[arg(long, default_value = "10")]
    periods: usize,

    #[arg(long, default_value = "18")]
    decimals0: u8,

    #[arg(long, default_value = "18")]
    decimals1: u8,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    if !networks::is_valid_fee(cli.fee) {
        return Err(eyre::eyre!("Unsupported fee tier {}", cli.fee));
    }
    let spacing = cli
        .tick_spacing
        .unwrap_or_else(|| networks::tick_spacing_for_fee(cli.fee));

    let calculator = RangeCalculator::new(RangeConfig {
        base_range_percent: cli.base_range,
        min_range_percent: cli.min_range,
        max_range_percent: cli.max_range,
        method: cli.method,
        volatility_multiplier: cli.volatility_multiplier,
        volatility_periods: cli.periods,
        ..RangeConfig::default()
    });

    // Human prices to raw base-unit prices
    let scale = 10f64.powi(cli.decimals0 as i32 - cli.decimals1 as i32);
    let mut estimator = VolatilityEstimator::new();
    for price in &cli.prices {
        estimator.record_price(price / scale, 0);
    }
    let current = cli.prices.last().copied().unwrap_or_default();
    let volatility = estimator.volatility(cli.periods);
    debug!("{} samples, volatility {:.4}%", cli.prices.len(), volatility);

    let (range_percent, range) = calculator.compute(current / scale, &estimator, spacing)?;
    let (raw_lower, raw_upper) = range_prices(&range);

    info!("📐 Method {} (fee {}, tick spacing {})", cli.method, cli.fee, spacing);
    println!("Current price: {:.8}", current);
    println!("Volatility:    {:.4}%", volatility);
    println!("Range width:   ±{:.2}%", range_percent);
    println!("Ticks:         {} (width {})", range, range.width());
    println!(
        "Prices:        {:.8} to {:.8}",
        raw_lower * scale,
        raw_upper * scale
    );
    Ok(())
}
