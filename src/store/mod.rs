//! Telemetry persistence.
//!
//! The store is an audit trail, never a decision input: the engine writes
//! executed trades, equity points, and position snapshots here, and all
//! sizing statistics stay in memory. Binding through strings keeps the
//! exact decimal representation in the database.

use anyhow::{Context, Result};
use chrono::Utc;
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use sqlx::{sqlite::SqlitePoolOptions, SqlitePool};

use crate::models::{Position, TradeRecord};

/// SQLite-backed telemetry store.
pub struct Database {
    pool: SqlitePool,
}

impl Database {
    /// Connect and migrate.
    pub async fn new(database_url: &str) -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect(database_url)
            .await
            .context("Failed to connect to database")?;

        let db = Self { pool };
        db.run_migrations().await?;

        Ok(db)
    }

    async fn run_migrations(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS trades (
                id TEXT PRIMARY KEY,
                symbol TEXT NOT NULL,
                side TEXT NOT NULL,
                quantity TEXT NOT NULL,
                price TEXT NOT NULL,
                realized_pnl TEXT NOT NULL,
                commission TEXT NOT NULL,
                strategy TEXT NOT NULL,
                executed_at TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS equity_curve (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                timestamp TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP,
                equity REAL NOT NULL,
                exposure REAL NOT NULL,
                daily_pnl REAL NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS position_snapshots (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                symbol TEXT NOT NULL,
                quantity TEXT NOT NULL,
                avg_entry_price TEXT NOT NULL,
                last_price TEXT NOT NULL,
                unrealized_pnl TEXT NOT NULL,
                snapped_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Record an executed trade.
    pub async fn save_trade(&self, trade: &TradeRecord) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO trades (id, symbol, side, quantity, price, realized_pnl, commission, strategy, executed_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(id) DO NOTHING
            "#,
        )
        .bind(&trade.id)
        .bind(&trade.symbol)
        .bind(trade.side.as_str())
        .bind(trade.quantity.to_string())
        .bind(trade.price.to_string())
        .bind(trade.realized_pnl.to_string())
        .bind(trade.commission.to_string())
        .bind(&trade.strategy)
        .bind(trade.timestamp.to_rfc3339())
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Append one equity curve point.
    pub async fn record_equity_point(
        &self,
        equity: Decimal,
        exposure: Decimal,
        daily_pnl: Decimal,
    ) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO equity_curve (timestamp, equity, exposure, daily_pnl)
            VALUES (?, ?, ?, ?)
            "#,
        )
        .bind(Utc::now().to_rfc3339())
        .bind(equity.to_f64().unwrap_or(0.0))
        .bind(exposure.to_f64().unwrap_or(0.0))
        .bind(daily_pnl.to_f64().unwrap_or(0.0))
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Snapshot an open position for the audit trail.
    pub async fn save_position_snapshot(&self, position: &Position) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO position_snapshots (symbol, quantity, avg_entry_price, last_price, unrealized_pnl)
            VALUES (?, ?, ?, ?, ?)
            "#,
        )
        .bind(&position.symbol)
        .bind(position.quantity.to_string())
        .bind(position.avg_entry_price.to_string())
        .bind(position.last_price.to_string())
        .bind(position.unrealized_pnl().to_string())
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    #[cfg(test)]
    pub(crate) fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}
