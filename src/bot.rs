use alloy_primitives::{Address, TxHash};
use chrono::Utc;
use dashmap::DashMap;
use eyre::{Result, WrapErr};
use parking_lot::Mutex as SyncMutex;
use std::fmt;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};

use crate::chain::{Asset, ChainClient, TokenInfo, WalletClient};
use crate::config::BotConfig;
use crate::database::{self, DatabasePool};
use crate::events::BotEvent;
use crate::execution::{ActionOutcome, PairContext, RebalanceOrchestrator, HISTORY_CAPACITY};
use crate::models::{
    HealthAnalysis, MonitoredPosition, PoolState, PositionPerformance, RebalanceStatistics,
    TickRange, TokenId,
};
use crate::monitoring::{
    AlertCallback, AlertKind, CachedPrice, MonitorStatus, PriceAlert, PriceChange, PriceMonitor,
    RangeAlertStatus,
};
use crate::strategy::balancer::{value_distribution, IMBALANCE_HINT_PP};
use crate::strategy::range::range_prices;
use crate::strategy::VolatilityEstimator;

/// Health and performance of one monitored position, for the status report.
#[derive(Debug, Clone)]
pub struct PositionReport {
    pub record: MonitoredPosition,
    pub analysis: Option<HealthAnalysis>,
    pub performance: Option<PositionPerformance>,
    pub range: Option<RangeAlertStatus>,
    /// Mint tx sent for this position whose new token id could not be read.
    pub stalled_mint: Option<TxHash>,
}

/// Window for the price move shown in the status report.
pub const PRICE_CHANGE_WINDOW_SECS: u64 = 3600;

#[derive(Debug, Clone)]
pub struct StatusReport {
    pub wallet: Address,
    pub native_symbol: &'static str,
    pub native_balance: f64,
    pub token0: TokenInfo,
    pub token1: TokenInfo,
    pub balance0: f64,
    pub balance1: f64,
    /// Whole token1 per whole token0.
    pub price: f64,
    pub price_change: Option<PriceChange>,
    /// Value share in percent, `(token0, token1)`.
    pub distribution: Option<(f64, f64)>,
    pub imbalanced: bool,
    pub positions: Vec<PositionReport>,
    pub statistics: RebalanceStatistics,
    pub monitor: MonitorStatus,
}

impl fmt::Display for StatusReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "💼 Wallet {:#x}", self.wallet)?;
        writeln!(f, "  {}: {:.6}", self.native_symbol, self.native_balance)?;
        writeln!(f, "  {}: {:.6}", self.token0.symbol, self.balance0)?;
        writeln!(f, "  {}: {:.6}", self.token1.symbol, self.balance1)?;
        writeln!(
            f,
            "📈 Price: {:.8} {} per {}",
            self.price, self.token1.symbol, self.token0.symbol
        )?;
        if let Some(change) = self.price_change.filter(|c| c.historical_price.is_some()) {
            writeln!(
                f,
                "  {:+.2}% over the last {}s",
                change.change_percent, change.window_secs
            )?;
        }
        if let Some((share0, share1)) = self.distribution {
            writeln!(
                f,
                "⚖️ Distribution: {:.1}% {} / {:.1}% {}",
                share0, self.token0.symbol, share1, self.token1.symbol
            )?;
            if self.imbalanced {
                writeln!(f, "  ⚠️ Portfolio is imbalanced, consider `balance`")?;
            }
        }

        writeln!(f, "📋 Monitored positions: {}", self.positions.len())?;
        for report in &self.positions {
            write!(f, "  #{}", report.record.token_id)?;
            match &report.analysis {
                Some(a) => write!(
                    f,
                    " health {:.1} [{}] {}",
                    a.health_score, a.urgency, a.reason
                )?,
                None => write!(f, " not analysed yet")?,
            }
            if let Some(range) = &report.range {
                write!(f, " {}", range.label)?;
            }
            if let Some(p) = &report.performance {
                write!(
                    f,
                    ", in range {:.1}%, {} rebalances",
                    p.in_range_percentage, p.total_rebalances
                )?;
            }
            writeln!(f)?;
            if let Some(tx) = report.stalled_mint {
                writeln!(f, "    ⚠️ mint {:#x} has no readable token id, rebalancing paused", tx)?;
            }
        }

        let stats = &self.statistics;
        writeln!(
            f,
            "🔁 Rebalances: {} ({} successful, {:.1}%)",
            stats.total_rebalances,
            stats.successful_rebalances,
            stats.success_rate * 100.0
        )?;
        write!(
            f,
            "🔔 Price monitor: {} active alerts, {} cached pools",
            self.monitor.active_alerts, self.monitor.cached_prices
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RangePreview {
    pub price: f64,
    pub volatility: f64,
    pub range_percent: f64,
    pub range: TickRange,
    pub price_lower: f64,
    pub price_upper: f64,
}

/// Monitors a set of positions on one pool and keeps them in range.
pub struct LiquidityBot<C, W> {
    pub config: BotConfig,
    chain: Arc<C>,
    wallet: Arc<W>,
    pair: PairContext,
    orchestrator: RebalanceOrchestrator<C, W>,
    price_monitor: PriceMonitor<C>,
    estimator: SyncMutex<VolatilityEstimator>,
    monitored: DashMap<TokenId, MonitoredPosition>,
    /// Positions whose last plan minted without a readable token id.
    stalled_mints: DashMap<TokenId, TxHash>,
    db_pool: Option<DatabasePool>,
    event_tx: mpsc::UnboundedSender<BotEvent>,
    event_rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<BotEvent>>,
    stop_tx: watch::Sender<bool>,
    stop_rx: watch::Receiver<bool>,
}

impl<C, W> LiquidityBot<C, W>
where
    C: ChainClient + 'static,
    W: WalletClient + 'static,
{
    pub async fn new(config: BotConfig, chain: Arc<C>, wallet: Arc<W>, db_pool: Option<DatabasePool>) -> Result<Self> {
        let token0 = wallet
            .token_info(config.token0_address)
            .await
            .wrap_err("Failed to read token0 metadata")?;
        let token1 = wallet
            .token_info(config.token1_address)
            .await
            .wrap_err("Failed to read token1 metadata")?;
        let pool = chain
            .pool_address(token0.address, token1.address, config.pool_fee)
            .await
            .wrap_err("Failed to find pool")?;
        info!(
            "✅ Using {}/{} pool {:#x} (fee {}, tick spacing {})",
            token0.symbol, token1.symbol, pool, config.pool_fee, config.tick_spacing
        );

        let pair = PairContext {
            token0,
            token1,
            fee: config.pool_fee,
            tick_spacing: config.tick_spacing,
            pool,
        };

        let orchestrator = RebalanceOrchestrator::new(chain.clone(), wallet.clone(), pair.clone(), &config);
        let price_monitor = PriceMonitor::new(
            chain.clone(),
            config.check_interval(),
            config.price_api_url.clone(),
        );

        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let (stop_tx, stop_rx) = watch::channel(false);

        let bot = Self {
            config,
            chain,
            wallet,
            pair,
            orchestrator,
            price_monitor,
            estimator: SyncMutex::new(VolatilityEstimator::new()),
            monitored: DashMap::new(),
            stalled_mints: DashMap::new(),
            db_pool,
            event_tx,
            event_rx: tokio::sync::Mutex::new(event_rx),
            stop_tx,
            stop_rx,
        };
        bot.restore_state().await?;
        Ok(bot)
    }

    async fn restore_state(&self) -> Result<()> {
        let Some(pool) = &self.db_pool else {
            return Ok(());
        };

        for record in database::load_monitored_positions(pool).await? {
            self.orchestrator.track(record.token_id);
            self.register_range_alert(record.token_id);
            self.monitored.insert(record.token_id, record);
        }
        for metrics in database::load_position_metrics(pool).await? {
            if self.monitored.contains_key(&metrics.token_id) {
                self.orchestrator.restore_metrics(metrics);
            }
        }
        let history = database::load_recent_history(pool, HISTORY_CAPACITY as i64).await?;
        self.orchestrator.restore_history(history);

        if !self.monitored.is_empty() {
            info!("📂 Restored {} monitored positions", self.monitored.len());
        }
        Ok(())
    }

    pub fn pair(&self) -> &PairContext {
        &self.pair
    }

    pub fn orchestrator(&self) -> &RebalanceOrchestrator<C, W> {
        &self.orchestrator
    }

    pub fn monitored_positions(&self) -> Vec<MonitoredPosition> {
        let mut records: Vec<MonitoredPosition> = self.monitored.iter().map(|r| r.value().clone()).collect();
        records.sort_by_key(|r| r.token_id);
        records
    }

    fn emit(&self, event: BotEvent) {
        if let Err(e) = self.event_tx.send(event) {
            warn!("Event channel closed: {}", e);
        }
    }

    fn emit_position_state(&self, token_id: TokenId) {
        if let Some(record) = self.monitored.get(&token_id).map(|r| r.clone()) {
            self.emit(BotEvent::MonitoredUpdated(record));
        }
        if let Some(metrics) = self.orchestrator.metrics(&token_id) {
            self.emit(BotEvent::MetricsUpdated(metrics));
        }
    }

    fn touch_monitored(&self, token_id: TokenId, update: impl FnOnce(&mut MonitoredPosition)) {
        if let Some(mut record) = self.monitored.get_mut(&token_id) {
            update(record.value_mut());
        }
    }

    fn pair_label(&self) -> String {
        format!("{}/{}", self.pair.token0.symbol, self.pair.token1.symbol)
    }

    fn register_range_alert(&self, token_id: TokenId) {
        self.price_monitor.remove_range_alerts(token_id);
        let event_tx = self.event_tx.clone();
        let callback: AlertCallback = Arc::new(move |alert: &PriceAlert, price: &CachedPrice| {
            if let AlertKind::RangeExit(token_id) = alert.kind {
                let _ = event_tx.send(BotEvent::RangeExitAlert {
                    pool: alert.pool,
                    token_id,
                    price: price.price,
                });
            }
        });
        self.price_monitor.add_alert(PriceAlert::new(
            self.pair.pool,
            &self.pair_label(),
            AlertKind::RangeExit(token_id),
            callback,
        ));
    }

    fn current_volatility(&self) -> f64 {
        self.estimator
            .lock()
            .volatility(self.config.range.volatility_periods)
    }

    fn record_price(&self, pool: &PoolState) -> f64 {
        let mut estimator = self.estimator.lock();
        estimator.record_price(pool.price, pool.tick);
        estimator.volatility(self.config.range.volatility_periods)
    }

    // ---- operator operations ----------------------------------------------

    /// Start monitoring an existing position and run a first health check.
    pub async fn add_position(&self, token_id: TokenId) -> Result<HealthAnalysis> {
        let position = self
            .chain
            .position(token_id)
            .await
            .wrap_err_with(|| format!("Position {} not found", token_id))?;

        if position.token0 != self.pair.token0.address
            || position.token1 != self.pair.token1.address
            || position.fee != self.pair.fee
        {
            return Err(eyre::eyre!(
                "Position {} is not a {} fee {} position",
                token_id,
                self.pair_label(),
                self.pair.fee
            ));
        }

        self.monitored.entry(token_id).or_insert_with(|| {
            MonitoredPosition::new(token_id, &self.pair.token0.symbol, &self.pair.token1.symbol)
        });
        self.orchestrator.track(token_id);
        self.register_range_alert(token_id);

        let pool = self.price_monitor.refresh(self.pair.pool).await?;
        let analysis = self
            .orchestrator
            .baseline(&position, &pool, self.current_volatility());
        self.touch_monitored(token_id, |r| r.last_check = Some(analysis.analyzed_at));
        self.emit_position_state(token_id);

        info!(
            token_id = %token_id,
            "✅ Position added: range {}, health {:.1} ({})",
            position.range(),
            analysis.health_score,
            analysis.reason
        );
        Ok(analysis)
    }

    pub fn remove_position(&self, token_id: TokenId) -> bool {
        let removed = self.monitored.remove(&token_id).is_some();
        self.stalled_mints.remove(&token_id);
        if removed {
            self.orchestrator.untrack(token_id);
            self.price_monitor.remove_range_alerts(token_id);
            self.emit(BotEvent::PositionRemoved(token_id));
            info!(token_id = %token_id, "Position removed from monitoring");
        } else {
            warn!(token_id = %token_id, "Position was not being monitored");
        }
        removed
    }

    pub async fn balance_portfolio(&self) -> ActionOutcome {
        self.orchestrator.balance_portfolio().await
    }

    /// Balance the wallet, open a position around the current price, and monitor it.
    pub async fn create_initial_position(&self) -> Result<TokenId> {
        let gas = self.wallet.balance_of(Asset::Native).await?;
        if gas < self.config.execution.min_gas_balance {
            return Err(eyre::eyre!(
                "Insufficient {} for gas: {:.6} < {:.6}",
                self.config.network.native_symbol,
                gas,
                self.config.execution.min_gas_balance
            ));
        }

        info!("🏗️ Creating initial position");
        let balanced = self.orchestrator.balance_portfolio().await;
        if !balanced.success {
            warn!(
                "⚠️ Balancing failed, creating position with current balances: {}",
                balanced.detail.as_deref().unwrap_or("unknown error")
            );
        } else if !balanced.tx_hashes.is_empty() && !self.config.execution.settle_delay.is_zero() {
            tokio::time::sleep(self.config.execution.settle_delay).await;
        }

        let pool = self.price_monitor.refresh(self.pair.pool).await?;
        self.record_price(&pool);
        let estimator = self.estimator.lock().clone();
        let (range_percent, range) = self.orchestrator.compute_new_range(pool.price, &estimator)?;
        info!("Target range {} ({:.2}%)", range, range_percent);

        let outcome = self.orchestrator.open_position(range, range_percent).await;
        if !outcome.success {
            return Err(eyre::eyre!(
                "Position creation failed: {}",
                outcome.detail.unwrap_or_else(|| "unknown error".to_string())
            ));
        }
        let token_id = outcome
            .minted_token_id
            .ok_or_else(|| eyre::eyre!("Position minted but token id not found in receipt"))?;

        self.add_position(token_id).await?;
        Ok(token_id)
    }

    pub fn statistics(&self) -> RebalanceStatistics {
        self.orchestrator.statistics(self.monitored.len())
    }

    pub async fn status_report(&self) -> Result<StatusReport> {
        let native_balance = self.wallet.balance_of(Asset::Native).await?;
        let balance0 = self
            .wallet
            .balance_of(Asset::Token(self.pair.token0.address))
            .await?;
        let balance1 = self
            .wallet
            .balance_of(Asset::Token(self.pair.token1.address))
            .await?;
        let pool = self.price_monitor.refresh(self.pair.pool).await?;
        let price = self.pair.human_price(&pool);
        let price_change = self
            .price_monitor
            .cached_change(&self.pair.pool, PRICE_CHANGE_WINDOW_SECS);

        let distribution = value_distribution(balance0, balance1, price);
        let target_share1 = self.config.execution.target_ratio * 100.0;
        let imbalanced = distribution
            .map(|(_, share1)| (share1 - target_share1).abs() > IMBALANCE_HINT_PP)
            .unwrap_or(false);

        let mut positions = Vec::with_capacity(self.monitored.len());
        for record in self.monitored_positions() {
            let token_id = record.token_id;
            let range = match self.price_monitor.check_position_range_status(token_id).await {
                Ok(status) => Some(status),
                Err(e) => {
                    warn!(token_id = %token_id, "Range status unavailable: {}", e);
                    None
                }
            };
            positions.push(PositionReport {
                analysis: self.orchestrator.last_analysis(&token_id),
                performance: self.orchestrator.performance(&token_id),
                range,
                stalled_mint: self.stalled_mints.get(&token_id).map(|tx| *tx),
                record,
            });
        }

        Ok(StatusReport {
            wallet: self.wallet.address(),
            native_symbol: self.config.network.native_symbol,
            native_balance,
            token0: self.pair.token0.clone(),
            token1: self.pair.token1.clone(),
            balance0,
            balance1,
            price,
            price_change,
            distribution,
            imbalanced,
            positions,
            statistics: self.statistics(),
            monitor: self.price_monitor.status(),
        })
    }

    /// USD quote from the external price API.
    pub async fn external_quote(&self, asset_id: &str) -> Result<Option<f64>> {
        self.price_monitor.external_price(asset_id).await
    }

    /// Range a new position would get right now.
    pub async fn range_preview(&self) -> Result<RangePreview> {
        let pool = self.price_monitor.refresh(self.pair.pool).await?;
        let volatility = self.record_price(&pool);
        let estimator = self.estimator.lock().clone();
        let (range_percent, range) = self.orchestrator.compute_new_range(pool.price, &estimator)?;

        let scale = 10f64.powi(self.pair.token0.decimals as i32 - self.pair.token1.decimals as i32);
        let (raw_lower, raw_upper) = range_prices(&range);
        Ok(RangePreview {
            price: self.pair.human_price(&pool),
            volatility,
            range_percent,
            range,
            price_lower: raw_lower * scale,
            price_upper: raw_upper * scale,
        })
    }

    pub fn stop(&self) {
        info!("🛑 Stop requested");
        self.stop_tx.send_replace(true);
    }

    pub fn is_stopped(&self) -> bool {
        *self.stop_rx.borrow()
    }

    // ---- monitoring ----------------------------------------------------------

    /// One pass over every monitored position. Returns how many were rebalanced.
    pub async fn monitor_cycle(&self) -> Result<usize> {
        let pool = match self.price_monitor.refresh(self.pair.pool).await {
            Ok(pool) => pool,
            Err(e) => match self.price_monitor.fresh(&self.pair.pool, self.config.check_interval()) {
                Some(cached) => {
                    warn!(
                        "Could not read pool state ({}), using price cached at {}",
                        e,
                        cached.updated_at.format("%H:%M:%S")
                    );
                    cached.pool_state()
                }
                None => {
                    warn!("Could not read pool state, skipping cycle: {}", e);
                    return Ok(0);
                }
            },
        };
        let volatility = self.record_price(&pool);
        debug!(
            "Pool price {:.8} (tick {}), volatility {:.3}%",
            self.pair.human_price(&pool),
            pool.tick,
            volatility
        );

        let mut token_ids: Vec<TokenId> = self.monitored.iter().map(|r| *r.key()).collect();
        token_ids.sort();

        let mut rebalanced = 0;
        for token_id in token_ids {
            if self.is_stopped() {
                break;
            }
            match self.check_position(token_id, &pool, volatility).await {
                Ok(true) => rebalanced += 1,
                Ok(false) => {}
                Err(e) => warn!(token_id = %token_id, "Position check failed: {}", e),
            }
        }
        Ok(rebalanced)
    }

    async fn check_position(&self, token_id: TokenId, pool: &PoolState, volatility: f64) -> Result<bool> {
        let position = self.chain.position(token_id).await?;
        let analysis = self.orchestrator.evaluate(&position, pool, volatility);
        self.touch_monitored(token_id, |r| r.last_check = Some(analysis.analyzed_at));
        debug!(
            token_id = %token_id,
            "Health {:.1} [{}] {}",
            analysis.health_score,
            analysis.urgency,
            analysis.reason
        );

        let mut current_id = token_id;
        let mut rebalanced = false;

        if let Some(tx) = self.stalled_mints.get(&token_id).map(|tx| *tx) {
            if analysis.needs_rebalance {
                error!(
                    token_id = %token_id,
                    "🚫 Not rebalancing: mint {:#x} confirmed without a readable token id, add the new position manually",
                    tx
                );
            }
        } else if analysis.needs_rebalance {
            info!(
                token_id = %token_id,
                urgency = %analysis.urgency,
                "⚠️ Rebalance needed: {}",
                analysis.reason
            );
            let estimator = self.estimator.lock().clone();
            if let Some(outcome) = self
                .orchestrator
                .rebalance(&position, &analysis, &estimator, &self.stop_rx)
                .await
            {
                rebalanced = true;
                self.touch_monitored(token_id, |r| {
                    r.last_rebalance = Some(Utc::now());
                    r.rebalance_count += 1;
                });
                if let Some(entry) = self.orchestrator.history_snapshot().pop() {
                    self.emit(BotEvent::RebalanceRecorded(entry));
                }
                if let Some(tx) = outcome.unresolved_mint() {
                    self.stalled_mints.insert(token_id, tx);
                }
                if let Some(new_id) = outcome.new_token_id.filter(|id| *id != token_id) {
                    self.replace_position(token_id, new_id);
                    current_id = new_id;
                }
            }
        }

        self.emit_position_state(current_id);
        Ok(rebalanced)
    }

    fn replace_position(&self, old: TokenId, new: TokenId) {
        if let Some((_, mut record)) = self.monitored.remove(&old) {
            record.token_id = new;
            self.monitored.insert(new, record);
        }
        self.price_monitor.remove_range_alerts(old);
        self.register_range_alert(new);
        self.emit(BotEvent::PositionReplaced { old, new });
        info!("🔁 Now monitoring position {} (replaces {})", new, old);
    }

    async fn handle_event(&self, event: BotEvent) {
        match event {
            BotEvent::RangeExitAlert { token_id, price, .. } => {
                info!(token_id = %token_id, "🚨 Position left its range at price {:.8}", price);
            }
            BotEvent::PositionReplaced { old, new } => {
                debug!("Position {} replaced by {}", old, new);
                if let Some(pool) = &self.db_pool {
                    if let Err(e) = database::remove_monitored_position(pool, old).await {
                        error!("Failed to remove replaced position {}: {}", old, e);
                    }
                }
            }
            event => {
                let Some(pool) = &self.db_pool else {
                    return;
                };
                let result = match &event {
                    BotEvent::MonitoredUpdated(record) => {
                        database::save_monitored_position(pool, record).await
                    }
                    BotEvent::MetricsUpdated(metrics) => {
                        database::save_position_metrics(pool, metrics).await
                    }
                    BotEvent::RebalanceRecorded(entry) => {
                        database::append_history_entry(pool, entry).await
                    }
                    BotEvent::PositionRemoved(token_id) => {
                        database::remove_monitored_position(pool, *token_id)
                            .await
                            .map(|_| ())
                    }
                    _ => Ok(()),
                };
                if let Err(e) = result {
                    error!("Failed to persist {:?}: {}", event, e);
                }
            }
        }
    }

    /// Handle every event already queued. Returns how many were processed.
    pub async fn process_pending_events(&self) -> usize {
        let mut event_rx = self.event_rx.lock().await;
        let mut processed = 0;
        while let Ok(event) = event_rx.try_recv() {
            self.handle_event(event).await;
            processed += 1;
        }
        processed
    }

    async fn run_event_processor(&self) -> Result<()> {
        info!("Starting event processor...");
        let mut stop = self.stop_rx.clone();

        {
            let mut event_rx = self.event_rx.lock().await;
            while !*stop.borrow() {
                tokio::select! {
                    event = event_rx.recv() => match event {
                        Some(event) => self.handle_event(event).await,
                        None => break,
                    },
                    _ = stop.changed() => {}
                }
            }
        }

        // Persist whatever the last cycle queued
        self.process_pending_events().await;
        Ok(())
    }

    async fn run_monitor_loop(&self) -> Result<()> {
        let interval = self.config.check_interval();
        let mut stop = self.stop_rx.clone();
        info!(
            "🔍 Monitoring {} positions every {:?}",
            self.monitored.len(),
            interval
        );

        while !*stop.borrow() {
            match self.monitor_cycle().await {
                Ok(0) => {}
                Ok(n) => info!("✅ Cycle finished, {} positions rebalanced", n),
                Err(e) => error!("Monitor cycle failed: {}", e),
            }

            tokio::select! {
                _ = tokio::time::sleep(interval) => {}
                _ = stop.changed() => {}
            }
        }
        info!("Monitor loop stopped");
        Ok(())
    }

    pub async fn run(&self) -> Result<()> {
        info!(
            "🚀 Starting liquidity bot on {} for {} (fee {})",
            self.config.network.name,
            self.pair_label(),
            self.pair.fee
        );

        tokio::try_join!(
            self.run_monitor_loop(),
            self.price_monitor.run(self.stop_rx.clone()),
            self.run_event_processor(),
        )?;

        info!("Bot stopped");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::fake::FakeChain;
    use crate::config::create_test_config;
    use crate::models::Urgency;
    use alloy_primitives::U256;
    use std::time::Duration;

    async fn bot_with_db() -> (Arc<FakeChain>, LiquidityBot<FakeChain, FakeChain>) {
        let chain = Arc::new(FakeChain::new());
        let db = database::init_database("sqlite::memory:").await.unwrap();
        let bot = LiquidityBot::new(create_test_config(), chain.clone(), chain.clone(), Some(db))
            .await
            .unwrap();
        (chain, bot)
    }

    #[tokio::test]
    async fn test_add_position_runs_initial_check() {
        let (chain, bot) = bot_with_db().await;
        chain.add_position(7, 600, 1200, 5_000);

        let analysis = bot.add_position(U256::from(7u64)).await.unwrap();
        assert!(analysis.needs_rebalance);
        assert_eq!(analysis.urgency, Urgency::High);

        let records = bot.monitored_positions();
        assert_eq!(records.len(), 1);
        assert!(records[0].last_check.is_some());
        assert_eq!(records[0].token0_symbol, "TK0");
        assert!(bot.orchestrator().metrics(&U256::from(7u64)).is_some());
    }

    #[tokio::test]
    async fn test_add_position_rejects_unknown_and_foreign() {
        let (chain, bot) = bot_with_db().await;
        assert!(bot.add_position(U256::from(404u64)).await.is_err());

        let mut foreign = chain.add_position(8, -600, 600, 1_000);
        foreign.token1 = Address::repeat_byte(0x33);
        chain.state().positions.insert(foreign.token_id, foreign);
        assert!(bot.add_position(U256::from(8u64)).await.is_err());
        assert!(bot.monitored_positions().is_empty());
    }

    #[tokio::test]
    async fn test_cycle_replaces_out_of_range_position() {
        let (chain, bot) = bot_with_db().await;
        chain.add_position(7, 600, 1200, 5_000);
        bot.add_position(U256::from(7u64)).await.unwrap();

        assert_eq!(bot.monitor_cycle().await.unwrap(), 1);

        let records = bot.monitored_positions();
        assert_eq!(records.len(), 1);
        let new_id = records[0].token_id;
        assert_ne!(new_id, U256::from(7u64));
        assert_eq!(records[0].rebalance_count, 1);
        assert!(records[0].last_rebalance.is_some());
        assert_eq!(bot.statistics().total_rebalances, 1);

        assert!(bot.process_pending_events().await > 0);
        let pool = bot.db_pool.as_ref().unwrap();
        let stored = database::load_monitored_positions(pool).await.unwrap();
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].token_id, new_id);
        assert_eq!(stored[0].rebalance_count, 1);
        let history = database::load_recent_history(pool, 50).await.unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].new_token_id, Some(new_id));
    }

    #[tokio::test]
    async fn test_healthy_position_is_left_alone() {
        let chain = Arc::new(FakeChain::new());
        let mut config = create_test_config();
        config.rebalance_threshold = 0.3;
        let bot = LiquidityBot::new(config, chain.clone(), chain.clone(), None)
            .await
            .unwrap();

        // tick 0 sits 30% into [-300, 700]
        chain.add_position(9, -300, 700, 10_000);
        let analysis = bot.add_position(U256::from(9u64)).await.unwrap();
        assert!(!analysis.needs_rebalance);

        assert_eq!(bot.monitor_cycle().await.unwrap(), 0);
        assert!(chain.state().calls.is_empty());
    }

    #[tokio::test]
    async fn test_mint_without_token_id_is_not_repeated() {
        let (chain, bot) = bot_with_db().await;
        chain.add_position(7, 600, 1200, 5_000);
        chain.state().hide_minted_id = true;
        bot.add_position(U256::from(7u64)).await.unwrap();

        assert_eq!(bot.monitor_cycle().await.unwrap(), 1);
        // The emptied position is HIGH urgency again, but no second mint is sent
        assert_eq!(bot.monitor_cycle().await.unwrap(), 0);
        assert_eq!(bot.monitor_cycle().await.unwrap(), 0);

        assert_eq!(chain.state().mints.len(), 1);
        let history = bot.orchestrator().history_snapshot();
        assert_eq!(history.len(), 1);
        assert!(!history[0].success);
        let records = bot.monitored_positions();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].token_id, U256::from(7u64));

        let report = bot.status_report().await.unwrap();
        assert!(report.positions[0].stalled_mint.is_some());
        assert!(report.to_string().contains("rebalancing paused"));

        assert!(bot.remove_position(U256::from(7u64)));
        assert!(bot.stalled_mints.is_empty());
    }

    #[tokio::test]
    async fn test_cycle_falls_back_to_fresh_cached_price() {
        let chain = Arc::new(FakeChain::new());
        let mut config = create_test_config();
        config.rebalance_threshold = 0.3;
        let bot = LiquidityBot::new(config, chain.clone(), chain.clone(), None)
            .await
            .unwrap();
        chain.add_position(9, -300, 700, 10_000);
        let id = U256::from(9u64);

        bot.add_position(id).await.unwrap();
        assert_eq!(bot.orchestrator().metrics(&id).unwrap().in_range_secs, 0);

        bot.monitor_cycle().await.unwrap();
        assert_eq!(bot.orchestrator().metrics(&id).unwrap().in_range_secs, 30);
        assert_eq!(bot.price_monitor.cached(&chain.pool).unwrap().sample_count(), 2);

        // Pool read fails; the cached read from this interval stands in
        chain.state().pool_unavailable = true;
        assert_eq!(bot.monitor_cycle().await.unwrap(), 0);
        assert_eq!(bot.orchestrator().metrics(&id).unwrap().in_range_secs, 60);
        assert!(chain.state().calls.is_empty());
    }

    #[tokio::test]
    async fn test_status_report_shows_range_labels() {
        let (chain, bot) = bot_with_db().await;
        chain.add_position(7, -1200, 1200, 5_000);
        bot.add_position(U256::from(7u64)).await.unwrap();

        let report = bot.status_report().await.unwrap();
        let range = report.positions[0].range.unwrap();
        assert_eq!(range.label, crate::monitoring::RangeLabel::Safe);
        assert!(report.to_string().contains("SAFE"));
        // add_position and status_report both read through the cache
        let change = report.price_change.unwrap();
        assert_eq!(change.current_price, 1.0);
    }

    #[tokio::test]
    async fn test_state_is_restored_from_database() {
        let chain = Arc::new(FakeChain::new());
        let db = database::init_database("sqlite::memory:").await.unwrap();
        {
            let bot = LiquidityBot::new(create_test_config(), chain.clone(), chain.clone(), Some(db.clone()))
                .await
                .unwrap();
            chain.add_position(7, -600, 600, 5_000);
            bot.add_position(U256::from(7u64)).await.unwrap();
            bot.process_pending_events().await;
        }

        let restored = LiquidityBot::new(create_test_config(), chain.clone(), chain.clone(), Some(db))
            .await
            .unwrap();
        assert_eq!(restored.monitored_positions().len(), 1);
        assert!(restored.orchestrator().metrics(&U256::from(7u64)).is_some());
    }

    #[tokio::test]
    async fn test_remove_position() {
        let (chain, bot) = bot_with_db().await;
        chain.add_position(7, -600, 600, 5_000);
        bot.add_position(U256::from(7u64)).await.unwrap();

        assert!(bot.remove_position(U256::from(7u64)));
        assert!(!bot.remove_position(U256::from(7u64)));
        assert!(bot.monitored_positions().is_empty());
        assert!(bot.orchestrator().metrics(&U256::from(7u64)).is_none());
    }

    #[tokio::test]
    async fn test_create_initial_position_registers_minted_id() {
        let (chain, bot) = bot_with_db().await;
        chain.set_balance(Asset::Token(chain.token1), 0.0);

        let token_id = bot.create_initial_position().await.unwrap();
        assert_eq!(bot.monitored_positions()[0].token_id, token_id);

        let calls = chain.state().calls.clone();
        assert_eq!(calls.first(), Some(&"swap"));
        assert_eq!(calls.last(), Some(&"mint"));
    }

    #[tokio::test]
    async fn test_create_initial_position_needs_gas() {
        let (chain, bot) = bot_with_db().await;
        chain.set_balance(Asset::Native, 0.0);
        assert!(bot.create_initial_position().await.is_err());
        assert!(chain.state().calls.is_empty());
    }

    #[tokio::test]
    async fn test_status_report_flags_imbalance() {
        let (chain, bot) = bot_with_db().await;
        chain.set_balance(Asset::Token(chain.token1), 100.0);

        let report = bot.status_report().await.unwrap();
        let (share0, _) = report.distribution.unwrap();
        assert!(share0 > 90.0);
        assert!(report.imbalanced);
        assert!(report.to_string().contains("imbalanced"));
    }

    #[tokio::test]
    async fn test_range_preview_contains_price() {
        let (_chain, bot) = bot_with_db().await;
        let preview = bot.range_preview().await.unwrap();
        assert!(preview.range.contains(0));
        assert!(preview.price_lower < preview.price && preview.price < preview.price_upper);
        assert_eq!(preview.range.lower % 60, 0);
    }

    #[tokio::test]
    async fn test_run_returns_after_stop() {
        let (chain, bot) = bot_with_db().await;
        chain.add_position(7, -600, 600, 5_000);
        bot.add_position(U256::from(7u64)).await.unwrap();

        let stopper = async {
            tokio::time::sleep(Duration::from_millis(50)).await;
            bot.stop();
        };
        let (result, _) = tokio::join!(bot.run(), stopper);
        assert!(result.is_ok());
        assert!(bot.is_stopped());
    }
}
