use alloy_primitives::{Address, U256};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use eyre::{Result, WrapErr};
use parking_lot::RwLock;
use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::chain::ChainClient;
use crate::error::ExecutionError;
use crate::models::{PoolState, TokenId, Urgency};
use crate::strategy::health::range_status;

/// Samples and cache entries older than this are dropped.
pub const CACHE_TTL_SECS: i64 = 3600;

const MAX_SAMPLES_PER_POOL: usize = 256;
const EXTERNAL_API_TIMEOUT: Duration = Duration::from_secs(10);
pub const DEFAULT_PRICE_API_URL: &str = "https://api.coingecko.com/api/v3/simple/price";

/// Latest pool read plus the samples seen within the cache lifetime.
#[derive(Debug, Clone, PartialEq)]
pub struct CachedPrice {
    pub pool: Address,
    /// Raw token1-per-token0 pool price.
    pub price: f64,
    pub sqrt_price_x96: U256,
    pub tick: i32,
    pub updated_at: DateTime<Utc>,
    samples: VecDeque<(DateTime<Utc>, f64)>,
}

impl CachedPrice {
    fn new(state: &PoolState, at: DateTime<Utc>) -> Self {
        let mut samples = VecDeque::with_capacity(16);
        samples.push_back((at, state.price));
        Self {
            pool: state.address,
            price: state.price,
            sqrt_price_x96: state.sqrt_price_x96,
            tick: state.tick,
            updated_at: at,
            samples,
        }
    }

    fn push(&mut self, state: &PoolState, at: DateTime<Utc>) {
        self.price = state.price;
        self.sqrt_price_x96 = state.sqrt_price_x96;
        self.tick = state.tick;
        self.updated_at = at;
        if self.samples.len() >= MAX_SAMPLES_PER_POOL {
            self.samples.pop_front();
        }
        self.samples.push_back((at, state.price));
    }

    /// The pool read this entry was last refreshed from.
    pub fn pool_state(&self) -> PoolState {
        PoolState {
            address: self.pool,
            sqrt_price_x96: self.sqrt_price_x96,
            price: self.price,
            tick: self.tick,
        }
    }

    fn change_over(&self, window_secs: u64) -> PriceChange {
        let window = ChronoDuration::seconds(window_secs as i64);
        let historical = self
            .sample_before(self.updated_at, window)
            .filter(|p| *p > 0.0);
        let change_percent = historical
            .map(|old| (self.price - old) / old * 100.0)
            .unwrap_or(0.0);

        PriceChange {
            current_price: self.price,
            historical_price: historical,
            change_percent,
            window_secs,
        }
    }

    /// Newest sample at least `window` old relative to `now`.
    fn sample_before(&self, now: DateTime<Utc>, window: ChronoDuration) -> Option<f64> {
        self.samples
            .iter()
            .rev()
            .find(|(at, _)| now - *at >= window)
            .map(|(_, price)| *price)
    }

    fn evict_older_than(&mut self, cutoff: DateTime<Utc>) {
        while matches!(self.samples.front(), Some((at, _)) if *at < cutoff) {
            self.samples.pop_front();
        }
    }

    pub fn sample_count(&self) -> usize {
        self.samples.len()
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum AlertKind {
    Above(f64),
    Below(f64),
    /// Fires while the position's range no longer contains the pool tick.
    RangeExit(TokenId),
}

pub type AlertCallback = Arc<dyn Fn(&PriceAlert, &CachedPrice) + Send + Sync>;

#[derive(Clone)]
pub struct PriceAlert {
    pub pool: Address,
    pub pair: String,
    pub kind: AlertKind,
    pub active: bool,
    callback: AlertCallback,
}

impl PriceAlert {
    pub fn new(pool: Address, pair: &str, kind: AlertKind, callback: AlertCallback) -> Self {
        Self {
            pool,
            pair: pair.to_string(),
            kind,
            active: true,
            callback,
        }
    }
}

impl fmt::Debug for PriceAlert {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PriceAlert")
            .field("pool", &self.pool)
            .field("pair", &self.pair)
            .field("kind", &self.kind)
            .field("active", &self.active)
            .finish()
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PriceChange {
    pub current_price: f64,
    pub historical_price: Option<f64>,
    pub change_percent: f64,
    pub window_secs: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RangeLabel {
    OutOfRange,
    ApproachingEdge,
    NearEdge,
    Safe,
}

impl RangeLabel {
    pub fn as_str(&self) -> &'static str {
        match self {
            RangeLabel::OutOfRange => "OUT_OF_RANGE",
            RangeLabel::ApproachingEdge => "APPROACHING_EDGE",
            RangeLabel::NearEdge => "NEAR_EDGE",
            RangeLabel::Safe => "SAFE",
        }
    }
}

impl fmt::Display for RangeLabel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RangeAlertStatus {
    pub token_id: TokenId,
    pub label: RangeLabel,
    pub urgency: Urgency,
    pub in_range: bool,
    pub position_ratio: f64,
}

/// Edge-proximity classification used by the monitor. Coarser than the health
/// analyzer: it only feeds alerts, never plans.
pub fn classify_range(in_range: bool, position_ratio: f64) -> (RangeLabel, Urgency) {
    if !in_range {
        (RangeLabel::OutOfRange, Urgency::High)
    } else if position_ratio < 0.1 {
        (RangeLabel::ApproachingEdge, Urgency::Medium)
    } else if position_ratio < 0.2 {
        (RangeLabel::NearEdge, Urgency::Low)
    } else {
        (RangeLabel::Safe, Urgency::None)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MonitorStatus {
    pub running: bool,
    pub check_interval_secs: u64,
    pub active_alerts: usize,
    pub total_alerts: usize,
    pub cached_prices: usize,
}

/// Read-only pool price watcher with threshold alerts.
///
/// The cache is shared, so the monitor loop and operator commands can read it
/// while the polling task fills it. Nothing here sends transactions.
pub struct PriceMonitor<C> {
    chain: Arc<C>,
    check_interval: Duration,
    cache: Arc<DashMap<Address, CachedPrice>>,
    alerts: RwLock<Vec<PriceAlert>>,
    running: AtomicBool,
    http: reqwest::Client,
    price_api_url: String,
}

impl<C> PriceMonitor<C>
where
    C: ChainClient + 'static,
{
    pub fn new(chain: Arc<C>, check_interval: Duration, price_api_url: Option<String>) -> Self {
        Self {
            chain,
            check_interval,
            cache: Arc::new(DashMap::new()),
            alerts: RwLock::new(Vec::new()),
            running: AtomicBool::new(false),
            http: reqwest::Client::new(),
            price_api_url: price_api_url.unwrap_or_else(|| DEFAULT_PRICE_API_URL.to_string()),
        }
    }

    pub fn cache(&self) -> Arc<DashMap<Address, CachedPrice>> {
        self.cache.clone()
    }

    pub fn cached(&self, pool: &Address) -> Option<CachedPrice> {
        self.cache.get(pool).map(|c| c.clone())
    }

    /// Cached entry refreshed within `max_age`.
    pub fn fresh(&self, pool: &Address, max_age: Duration) -> Option<CachedPrice> {
        let max_age = ChronoDuration::from_std(max_age).ok()?;
        let now = Utc::now();
        self.cached(pool).filter(|c| now - c.updated_at <= max_age)
    }

    pub fn add_alert(&self, alert: PriceAlert) {
        info!("🔔 Price alert added for {}: {:?}", alert.pair, alert.kind);
        self.alerts.write().push(alert);
    }

    /// Drop every alert registered for `pool`. Returns how many were removed.
    pub fn remove_alerts(&self, pool: Address) -> usize {
        let mut alerts = self.alerts.write();
        let before = alerts.len();
        alerts.retain(|a| a.pool != pool);
        before - alerts.len()
    }

    /// Drop range-exit alerts for one position.
    pub fn remove_range_alerts(&self, token_id: TokenId) -> usize {
        let mut alerts = self.alerts.write();
        let before = alerts.len();
        alerts.retain(|a| a.kind != AlertKind::RangeExit(token_id));
        before - alerts.len()
    }

    /// Read the pool and refresh its cache entry.
    pub async fn current_price(&self, pool: Address) -> Result<CachedPrice, ExecutionError> {
        let state = self.chain.pool_state(pool).await?;
        Ok(self.record(&state, Utc::now()))
    }

    /// Same read as `current_price`, returning the slot0 snapshot itself.
    pub async fn refresh(&self, pool: Address) -> Result<PoolState, ExecutionError> {
        let state = self.chain.pool_state(pool).await?;
        self.record(&state, Utc::now());
        Ok(state)
    }

    fn record(&self, state: &PoolState, at: DateTime<Utc>) -> CachedPrice {
        match self.cache.entry(state.address) {
            Entry::Occupied(mut occupied) => {
                occupied.get_mut().push(state, at);
                occupied.get().clone()
            }
            Entry::Vacant(vacant) => vacant
                .insert(CachedPrice::new(state, at))
                .value()
                .clone(),
        }
    }

    /// Change against the newest cached sample at least `window_secs` old. Zero
    /// change when no such sample exists yet.
    pub async fn price_change(&self, pool: Address, window_secs: u64) -> Result<PriceChange, ExecutionError> {
        let current = self.current_price(pool).await?;
        Ok(current.change_over(window_secs))
    }

    /// `price_change` against the cached entry, without reading the pool.
    pub fn cached_change(&self, pool: &Address, window_secs: u64) -> Option<PriceChange> {
        self.cached(pool).map(|c| c.change_over(window_secs))
    }

    pub async fn check_position_range_status(&self, token_id: TokenId) -> Result<RangeAlertStatus, ExecutionError> {
        let position = self.chain.position(token_id).await?;
        let pool = self
            .chain
            .pool_address(position.token0, position.token1, position.fee)
            .await?;
        let current = self.current_price(pool).await?;

        let status = range_status(&position, current.tick, 0.0);
        let (label, urgency) = classify_range(status.in_range, status.position_ratio);
        Ok(RangeAlertStatus {
            token_id,
            label,
            urgency,
            in_range: status.in_range,
            position_ratio: status.position_ratio,
        })
    }

    /// Evaluate every active alert once. Returns the number that fired.
    pub async fn check_alerts(&self) -> usize {
        let alerts: Vec<PriceAlert> = self
            .alerts
            .read()
            .iter()
            .filter(|a| a.active)
            .cloned()
            .collect();

        let mut fired = 0;
        for alert in alerts {
            let current = match self.current_price(alert.pool).await {
                Ok(current) => current,
                Err(e) => {
                    warn!("Error checking alert for {}: {}", alert.pair, e);
                    continue;
                }
            };

            let triggered = match alert.kind {
                AlertKind::Above(threshold) => current.price > threshold,
                AlertKind::Below(threshold) => current.price < threshold,
                AlertKind::RangeExit(token_id) => match self.chain.position(token_id).await {
                    Ok(position) => !range_status(&position, current.tick, 0.0).in_range,
                    Err(e) => {
                        warn!(token_id = %token_id, "Range-exit alert could not read position: {}", e);
                        false
                    }
                },
            };

            if triggered {
                debug!("Alert fired for {}: {:?} at {:.8}", alert.pair, alert.kind, current.price);
                (alert.callback)(&alert, &current);
                fired += 1;
            }
        }
        fired
    }

    /// Drop samples and pools not refreshed within the cache lifetime.
    pub fn evict_stale(&self, now: DateTime<Utc>) -> usize {
        let cutoff = now - ChronoDuration::seconds(CACHE_TTL_SECS);
        let before = self.cache.len();
        self.cache.retain(|_, cached| {
            cached.evict_older_than(cutoff);
            cached.updated_at >= cutoff
        });
        before - self.cache.len()
    }

    pub fn status(&self) -> MonitorStatus {
        let alerts = self.alerts.read();
        MonitorStatus {
            running: self.running.load(Ordering::Relaxed),
            check_interval_secs: self.check_interval.as_secs(),
            active_alerts: alerts.iter().filter(|a| a.active).count(),
            total_alerts: alerts.len(),
            cached_prices: self.cache.len(),
        }
    }

    /// Poll alerts every `check_interval` until the stop flag is raised.
    pub async fn run(&self, mut stop: watch::Receiver<bool>) -> Result<()> {
        if self.running.swap(true, Ordering::SeqCst) {
            warn!("Price monitoring already running");
            return Ok(());
        }
        info!("📈 Price monitoring started (every {:?})", self.check_interval);

        while !*stop.borrow() {
            let fired = self.check_alerts().await;
            if fired > 0 {
                info!("🔔 {} price alerts fired", fired);
            }
            let evicted = self.evict_stale(Utc::now());
            if evicted > 0 {
                debug!("Evicted {} stale price cache entries", evicted);
            }

            tokio::select! {
                _ = tokio::time::sleep(self.check_interval) => {}
                changed = stop.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }

        self.running.store(false, Ordering::SeqCst);
        info!("Price monitoring stopped");
        Ok(())
    }

    /// USD quote for a CoinGecko-style asset id, when the pool is unavailable.
    pub async fn external_price(&self, asset_id: &str) -> Result<Option<f64>> {
        let resp = self
            .http
            .get(&self.price_api_url)
            .query(&[("ids", asset_id), ("vs_currencies", "usd")])
            .timeout(EXTERNAL_API_TIMEOUT)
            .send()
            .await
            .wrap_err("price api http error")?;

        if !resp.status().is_success() {
            error!("Price API returned {}", resp.status());
            return Ok(None);
        }
        let body: serde_json::Value = resp.json().await.wrap_err("decode price api json")?;
        Ok(parse_usd_quote(&body, asset_id))
    }
}

pub fn parse_usd_quote(body: &serde_json::Value, asset_id: &str) -> Option<f64> {
    body.get(asset_id)?.get("usd")?.as_f64()
}
