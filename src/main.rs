use alloy_primitives::U256;
use alloy_signer_local::PrivateKeySigner;
use clap::{Parser, Subcommand};
use eyre::{Result, WrapErr};
use liquidity_bot::chain::UniswapV3Client;
use liquidity_bot::providers::create_http_provider;
use liquidity_bot::{database, BotConfig, LiquidityBot};
use std::sync::Arc;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "liquidity-bot")]
#[command(about = "Keep Uniswap V3 liquidity positions in range", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Monitor and rebalance positions until interrupted (default)
    Run,

    /// Show wallet balances and the health of monitored positions
    Status,

    /// Start monitoring an existing position
    Add {
        /// Position NFT id
        token_id: String,
    },

    /// Stop monitoring a position
    Remove {
        /// Position NFT id
        token_id: String,
    },

    /// Balance the wallet and open a new position around the current price
    Create,

    /// Swap wallet balances toward the target ratio
    Balance,

    /// Show range settings and the range a new position would get now
    Range,

    /// Show rebalance statistics
    Stats,

    /// Look up a USD quote from the external price API
    Quote {
        /// CoinGecko-style asset id, e.g. "celo"
        asset_id: String,
    },
}

fn parse_token_id(raw: &str) -> Result<U256> {
    U256::from_str_radix(raw.trim(), 10).wrap_err_with(|| format!("Invalid position id '{}'", raw))
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    let config = BotConfig::from_env()?;
    info!("Configuration loaded for network {}", config.network.name);

    let signer: PrivateKeySigner = config
        .private_key
        .parse()
        .wrap_err("PRIVATE_KEY is not a valid private key")?;
    info!("Signer created for {:#x}", signer.address());

    let provider = create_http_provider(&config.rpc_url)?;
    let client = Arc::new(UniswapV3Client::new(
        provider,
        signer,
        &config.rpc_url,
        config.network.clone(),
    )?);

    let db_pool = database::init_database(&config.database_url).await?;
    info!("Database initialized at {}", config.database_url);

    let bot = Arc::new(LiquidityBot::new(config, client.clone(), client, Some(db_pool)).await?);

    match cli.command.unwrap_or(Commands::Run) {
        Commands::Run => {
            if bot.monitored_positions().is_empty() {
                warn!("No positions are monitored yet. Use `add <id>` or `create` first.");
            }

            let shutdown = bot.clone();
            tokio::spawn(async move {
                match tokio::signal::ctrl_c().await {
                    Ok(()) => shutdown.stop(),
                    Err(e) => error!("Failed to listen for Ctrl-C: {}", e),
                }
            });

            bot.run().await?;
        }
        Commands::Status => {
            let report = bot.status_report().await?;
            println!("{}", report);
        }
        Commands::Add { token_id } => {
            let token_id = parse_token_id(&token_id)?;
            let analysis = bot.add_position(token_id).await?;
            println!(
                "Position {} added. Health {:.1} [{}]: {}",
                token_id, analysis.health_score, analysis.urgency, analysis.reason
            );
        }
        Commands::Remove { token_id } => {
            let token_id = parse_token_id(&token_id)?;
            if bot.remove_position(token_id) {
                println!("Position {} removed", token_id);
            } else {
                println!("Position {} was not monitored", token_id);
            }
        }
        Commands::Create => {
            let token_id = bot.create_initial_position().await?;
            println!("Created and monitoring position {}", token_id);
        }
        Commands::Balance => {
            let outcome = bot.balance_portfolio().await;
            if outcome.success {
                println!("Portfolio balanced ({} transactions)", outcome.tx_hashes.len());
            } else {
                println!(
                    "Balancing failed: {}",
                    outcome.detail.as_deref().unwrap_or("unknown error")
                );
            }
        }
        Commands::Range => {
            println!("{}", bot.config.range_summary());
            let preview = bot.range_preview().await?;
            println!(
                "Current price {:.8}, volatility {:.3}%\nNew range {} ({:.2}%): {:.8} to {:.8}",
                preview.price,
                preview.volatility,
                preview.range,
                preview.range_percent,
                preview.price_lower,
                preview.price_upper
            );
        }
        Commands::Stats => {
            let stats = bot.statistics();
            println!(
                "Rebalances: {} total, {} successful ({:.1}%)",
                stats.total_rebalances,
                stats.successful_rebalances,
                stats.success_rate * 100.0
            );
            println!(
                "Average interval: {:.0}s, urgency HIGH/MEDIUM/LOW: {}/{}/{}",
                stats.avg_secs_between_rebalances,
                stats.urgency_distribution.high,
                stats.urgency_distribution.medium,
                stats.urgency_distribution.low
            );
            println!("Active positions: {}", stats.active_positions);
            for entry in &stats.recent_history {
                println!(
                    "  {} #{} [{}] {} {}",
                    entry.timestamp.format("%Y-%m-%d %H:%M:%S"),
                    entry.token_id,
                    entry.urgency,
                    entry.status.as_str(),
                    entry.reason
                );
            }
        }
        Commands::Quote { asset_id } => match bot.external_quote(&asset_id).await? {
            Some(usd) => println!("{}: ${:.6}", asset_id, usd),
            None => println!("No USD quote for {}", asset_id),
        },
    }

    // One-shot commands queue their persistence as events
    bot.process_pending_events().await;
    Ok(())
}
