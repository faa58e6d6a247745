//! Persistence Layer
//!
//! SQLite storage for runs, candles, orders and positions, accessed through
//! async sqlx repositories.
//!
//! # Database Schema
//!
//! ## runs
//! - id, instrument, timeframe, mode
//! - status: "running", "stopped", "completed" or "error"
//! - started_at, stopped_at
//!
//! ## candles
//! - keyed by (instrument, timeframe, timestamp); upserts overwrite OHLCV
//!
//! ## orders
//! - one row per submitted intent, linked to the position it opened
//!
//! ## positions
//! - local mirror of broker positions; closed exactly once

pub mod models;
pub mod repository;

use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use sqlx::ConnectOptions;
use std::path::Path;
use std::str::FromStr;
use tracing::info;

/// Database connection pool
pub type DbPool = SqlitePool;

/// Database initialization error
#[derive(Debug, thiserror::Error)]
pub enum DatabaseError {
    #[error("Database connection error: {0}")]
    ConnectionError(#[from] sqlx::Error),

    #[error("Migration error: {0}")]
    MigrationError(String),

    #[error("Query error: {0}")]
    QueryError(String),

    #[error("Corrupt record: {0}")]
    DecodeError(String),
}

/// Initialize the database connection pool and run migrations.
///
/// In-memory databases get a single connection so every query sees the
/// same schema.
pub async fn init_database(database_url: &str) -> Result<DbPool, DatabaseError> {
    info!("Initializing database: {}", database_url);

    let in_memory = database_url.contains(":memory:");
    if let Some(db_path) = database_url.strip_prefix("sqlite://") {
        if let Some(parent) = Path::new(db_path).parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(|e| {
                    DatabaseError::ConnectionError(sqlx::Error::Configuration(Box::new(e)))
                })?;
            }
        }
    }

    let options = SqliteConnectOptions::from_str(database_url)?
        .create_if_missing(true)
        .log_statements(tracing::log::LevelFilter::Debug);

    let pool = SqlitePoolOptions::new()
        .max_connections(if in_memory { 1 } else { 5 })
        .connect_with(options)
        .await?;

    run_migrations(&pool).await?;

    info!("Database initialized");
    Ok(pool)
}

async fn run_migrations(pool: &DbPool) -> Result<(), DatabaseError> {
    info!("Running database migrations...");

    let statements: [(&str, &str); 7] = [
        (
            "runs",
            r#"
            CREATE TABLE IF NOT EXISTS runs (
                id TEXT PRIMARY KEY,
                instrument TEXT NOT NULL,
                timeframe TEXT NOT NULL,
                mode TEXT NOT NULL,
                status TEXT NOT NULL CHECK(status IN ('running', 'stopped', 'completed', 'error')),
                started_at DATETIME NOT NULL,
                stopped_at DATETIME
            )
            "#,
        ),
        (
            "candles",
            r#"
            CREATE TABLE IF NOT EXISTS candles (
                instrument TEXT NOT NULL,
                timeframe TEXT NOT NULL,
                timestamp DATETIME NOT NULL,
                open REAL NOT NULL,
                high REAL NOT NULL,
                low REAL NOT NULL,
                close REAL NOT NULL,
                volume REAL NOT NULL,
                updated_at DATETIME NOT NULL,
                PRIMARY KEY (instrument, timeframe, timestamp)
            )
            "#,
        ),
        (
            "orders",
            r#"
            CREATE TABLE IF NOT EXISTS orders (
                id TEXT PRIMARY KEY,
                run_id TEXT NOT NULL,
                position_id TEXT,
                broker TEXT NOT NULL,
                instrument TEXT NOT NULL,
                side TEXT NOT NULL CHECK(side IN ('long', 'short')),
                units INTEGER NOT NULL,
                price REAL NOT NULL,
                fill_price REAL,
                stop_loss REAL,
                take_profit REAL,
                reason_codes TEXT NOT NULL,
                risk_fraction REAL NOT NULL,
                submitted_at DATETIME NOT NULL,
                created_at DATETIME NOT NULL
            )
            "#,
        ),
        (
            "positions",
            r#"
            CREATE TABLE IF NOT EXISTS positions (
                id TEXT PRIMARY KEY,
                run_id TEXT NOT NULL,
                order_id TEXT NOT NULL,
                instrument TEXT NOT NULL,
                side TEXT NOT NULL CHECK(side IN ('long', 'short')),
                entry_price REAL NOT NULL,
                units INTEGER NOT NULL,
                stop_loss REAL,
                take_profit REAL,
                status TEXT NOT NULL CHECK(status IN ('open', 'closed')),
                exit_price REAL,
                exit_reason TEXT,
                opened_at DATETIME NOT NULL,
                closed_at DATETIME,
                realized_pnl REAL NOT NULL DEFAULT 0.0,
                unrealized_pnl REAL NOT NULL DEFAULT 0.0,
                risk_fraction REAL NOT NULL DEFAULT 0.0,
                updated_at DATETIME NOT NULL
            )
            "#,
        ),
        (
            "idx_positions_run",
            "CREATE INDEX IF NOT EXISTS idx_positions_run ON positions(run_id, status)",
        ),
        (
            "idx_orders_run",
            "CREATE INDEX IF NOT EXISTS idx_orders_run ON orders(run_id)",
        ),
        (
            "idx_runs_started",
            "CREATE INDEX IF NOT EXISTS idx_runs_started ON runs(started_at)",
        ),
    ];

    for (name, sql) in statements {
        sqlx::query(sql).execute(pool).await.map_err(|e| {
            DatabaseError::MigrationError(format!("Failed to create {}: {}", name, e))
        })?;
    }

    info!("Database migrations completed");
    Ok(())
}
