use alloy_primitives::U256;
use eyre::Result;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions, SqliteRow};
use sqlx::{Pool, Row, Sqlite};
use std::str::FromStr;
use tracing::info;
use uuid::Uuid;

use crate::models::{
    MonitoredPosition, PlanStatus, PositionMetrics, RebalanceHistoryEntry, TokenId, Urgency,
};

pub type DatabasePool = Pool<Sqlite>;

pub const DEFAULT_HISTORY_LIMIT: i64 = 50;

/// Open (creating if needed) the SQLite database and its tables.
pub async fn init_database(database_url: &str) -> Result<DatabasePool> {
    if !database_url.starts_with("sqlite:") {
        return Err(eyre::eyre!("Unsupported database type in URL: {}", database_url));
    }

    info!("🗄️ Connecting to SQLite database...");
    let options = SqliteConnectOptions::from_str(database_url)?.create_if_missing(true);
    // Every connection to an in-memory database would see its own empty copy
    let max_connections = if database_url.contains(":memory:") { 1 } else { 5 };
    let pool = SqlitePoolOptions::new()
        .max_connections(max_connections)
        .connect_with(options)
        .await?;

    create_tables(&pool).await?;
    Ok(pool)
}

pub async fn create_tables(pool: &DatabasePool) -> Result<()> {
    info!("Creating SQLite tables...");

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS monitored_positions (
            token_id TEXT PRIMARY KEY,
            token0_symbol TEXT NOT NULL,
            token1_symbol TEXT NOT NULL,
            added_at DATETIME NOT NULL,
            last_check DATETIME,
            last_rebalance DATETIME,
            rebalance_count INTEGER NOT NULL DEFAULT 0
        );
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS position_metrics (
            token_id TEXT PRIMARY KEY,
            last_health_score REAL NOT NULL,
            last_check_time DATETIME NOT NULL,
            in_range_secs INTEGER NOT NULL DEFAULT 0,
            total_rebalances INTEGER NOT NULL DEFAULT 0,
            added_at DATETIME NOT NULL
        );
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS rebalance_history (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            plan_id TEXT NOT NULL,
            token_id TEXT NOT NULL,
            timestamp DATETIME NOT NULL,
            reason TEXT NOT NULL,
            urgency TEXT NOT NULL,
            health_score_before REAL NOT NULL,
            success BOOLEAN NOT NULL,
            actions_count INTEGER NOT NULL,
            status TEXT NOT NULL,
            new_token_id TEXT
        );
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query("CREATE INDEX IF NOT EXISTS idx_rebalance_history_timestamp ON rebalance_history(timestamp);")
        .execute(pool)
        .await?;

    info!("✅ Database tables created successfully");
    Ok(())
}

fn parse_token_id(raw: &str) -> Result<TokenId> {
    U256::from_str_radix(raw, 10).map_err(|e| eyre::eyre!("Invalid token id {:?} in database: {}", raw, e))
}

/// Insert or replace a monitored position record.
pub async fn save_monitored_position(pool: &DatabasePool, position: &MonitoredPosition) -> Result<()> {
    sqlx::query(
        r#"
        INSERT OR REPLACE INTO monitored_positions (
            token_id, token0_symbol, token1_symbol, added_at, last_check, last_rebalance, rebalance_count
        ) VALUES (?, ?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(position.token_id.to_string())
    .bind(&position.token0_symbol)
    .bind(&position.token1_symbol)
    .bind(position.added_at)
    .bind(position.last_check)
    .bind(position.last_rebalance)
    .bind(position.rebalance_count as i64)
    .execute(pool)
    .await?;
    Ok(())
}

/// Drops the position and its metrics. History rows are kept.
pub async fn remove_monitored_position(pool: &DatabasePool, token_id: TokenId) -> Result<bool> {
    let id = token_id.to_string();
    let removed = sqlx::query("DELETE FROM monitored_positions WHERE token_id = ?")
        .bind(&id)
        .execute(pool)
        .await?
        .rows_affected();
    sqlx::query("DELETE FROM position_metrics WHERE token_id = ?")
        .bind(&id)
        .execute(pool)
        .await?;
    Ok(removed > 0)
}

pub async fn load_monitored_positions(pool: &DatabasePool) -> Result<Vec<MonitoredPosition>> {
    let rows = sqlx::query("SELECT * FROM monitored_positions ORDER BY added_at ASC")
        .fetch_all(pool)
        .await?;

    let mut positions = Vec::with_capacity(rows.len());
    for row in rows {
        positions.push(MonitoredPosition {
            token_id: parse_token_id(&row.try_get::<String, _>("token_id")?)?,
            token0_symbol: row.try_get("token0_symbol")?,
            token1_symbol: row.try_get("token1_symbol")?,
            added_at: row.try_get("added_at")?,
            last_check: row.try_get("last_check")?,
            last_rebalance: row.try_get("last_rebalance")?,
            rebalance_count: row.try_get::<i64, _>("rebalance_count")?.max(0) as u32,
        });
    }
    Ok(positions)
}

pub async fn save_position_metrics(pool: &DatabasePool, metrics: &PositionMetrics) -> Result<()> {
    sqlx::query(
        r#"
        INSERT OR REPLACE INTO position_metrics (
            token_id, last_health_score, last_check_time, in_range_secs, total_rebalances, added_at
        ) VALUES (?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(metrics.token_id.to_string())
    .bind(metrics.last_health_score)
    .bind(metrics.last_check_time)
    .bind(metrics.in_range_secs as i64)
    .bind(metrics.total_rebalances as i64)
    .bind(metrics.added_at)
    .execute(pool)
    .await?;
    Ok(())
}

pub async fn load_position_metrics(pool: &DatabasePool) -> Result<Vec<PositionMetrics>> {
    let rows = sqlx::query("SELECT * FROM position_metrics")
        .fetch_all(pool)
        .await?;

    let mut metrics = Vec::with_capacity(rows.len());
    for row in rows {
        metrics.push(PositionMetrics {
            token_id: parse_token_id(&row.try_get::<String, _>("token_id")?)?,
            last_health_score: row.try_get("last_health_score")?,
            last_check_time: row.try_get("last_check_time")?,
            in_range_secs: row.try_get::<i64, _>("in_range_secs")?.max(0) as u64,
            total_rebalances: row.try_get::<i64, _>("total_rebalances")?.max(0) as u32,
            added_at: row.try_get("added_at")?,
        });
    }
    Ok(metrics)
}

pub async fn append_history_entry(pool: &DatabasePool, entry: &RebalanceHistoryEntry) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO rebalance_history (
            plan_id, token_id, timestamp, reason, urgency, health_score_before,
            success, actions_count, status, new_token_id
        ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(entry.plan_id.to_string())
    .bind(entry.token_id.to_string())
    .bind(entry.timestamp)
    .bind(&entry.reason)
    .bind(entry.urgency.as_str())
    .bind(entry.health_score_before)
    .bind(entry.success)
    .bind(entry.actions_count as i64)
    .bind(entry.status.as_str())
    .bind(entry.new_token_id.map(|id| id.to_string()))
    .execute(pool)
    .await?;
    Ok(())
}

fn history_from_row(row: &SqliteRow) -> Result<RebalanceHistoryEntry> {
    let urgency: String = row.try_get("urgency")?;
    let status: String = row.try_get("status")?;
    let new_token_id: Option<String> = row.try_get("new_token_id")?;

    Ok(RebalanceHistoryEntry {
        plan_id: Uuid::parse_str(&row.try_get::<String, _>("plan_id")?)?,
        token_id: parse_token_id(&row.try_get::<String, _>("token_id")?)?,
        timestamp: row.try_get("timestamp")?,
        reason: row.try_get("reason")?,
        urgency: Urgency::parse(&urgency).ok_or_else(|| eyre::eyre!("Unknown urgency {:?}", urgency))?,
        health_score_before: row.try_get("health_score_before")?,
        success: row.try_get("success")?,
        actions_count: row.try_get::<i64, _>("actions_count")?.max(0) as usize,
        status: PlanStatus::parse(&status).ok_or_else(|| eyre::eyre!("Unknown plan status {:?}", status))?,
        new_token_id: new_token_id.as_deref().map(parse_token_id).transpose()?,
    })
}

/// Most recent `limit` entries, oldest first.
pub async fn load_recent_history(pool: &DatabasePool, limit: i64) -> Result<Vec<RebalanceHistoryEntry>> {
    let rows = sqlx::query(
        r#"
        SELECT * FROM (
            SELECT * FROM rebalance_history ORDER BY id DESC LIMIT ?
        ) ORDER BY id ASC
        "#,
    )
    .bind(limit)
    .fetch_all(pool)
    .await?;

    rows.iter().map(history_from_row).collect()
}
