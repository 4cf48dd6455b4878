//! Persistence Layer
//!
//! SQLite storage for credentials, robot desired state, the order ledger,
//! raw exchange orders and trade fills, via sqlx.
//!
//! # Database Schema
//!
//! ## credentials
//! Key material (optionally `ENC:`-encrypted) plus an optional per-credential proxy.
//!
//! ## robots / robot_risk_params
//! Desired state polled by the supervisor, and one risk-parameter row per
//! (robot, market state).
//!
//! ## orders
//! The ledger. Unique on (platform, credential_id, exchange_order_id). A
//! partial unique index on (robot_id, position_side) WHERE status = 'OPEN'
//! keeps at most one open leg per robot side in the store itself.
//!
//! ## exchange_orders
//! Last known exchange view of every order, unique on
//! (platform, credential_id, exchange_order_id).
//!
//! ## trade_fills
//! Append-only fills, unique on (credential_id, platform, trade_id).

pub mod credential_repository;
pub mod exchange_order_repository;
pub mod models;
pub mod order_repository;
pub mod robot_repository;
pub mod trade_fill_repository;

use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
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

    #[error("Unique constraint violated: {0}")]
    UniqueViolation(String),

    #[error("Invalid stored data: {0}")]
    InvalidData(#[from] crate::domain::errors::ValidationError),
}

/// True when `error` is a uniqueness-constraint rejection
pub fn is_unique_violation(error: &sqlx::Error) -> bool {
    match error {
        sqlx::Error::Database(db) => db.is_unique_violation(),
        _ => false,
    }
}

/// Maps a write error, keeping unique violations distinguishable for upsert races
pub(crate) fn write_error(context: &str, error: sqlx::Error) -> DatabaseError {
    if is_unique_violation(&error) {
        DatabaseError::UniqueViolation(format!("{}: {}", context, error))
    } else {
        tracing::error!("{}: {}", context, error);
        DatabaseError::QueryError(format!("{}: {}", context, error))
    }
}

/// Initialize the database connection pool with default settings
pub async fn init_database(database_url: &str) -> Result<DbPool, DatabaseError> {
    init_database_with(&DatabaseConfig {
        url: database_url.to_string(),
        ..DatabaseConfig::default()
    })
    .await
}

/// Initialize the database connection pool
///
/// In-memory databases get a single pinned connection; every connection to
/// `sqlite::memory:` would otherwise see its own empty database.
pub async fn init_database_with(config: &DatabaseConfig) -> Result<DbPool, DatabaseError> {
    info!("Initializing database: {}", config.url);

    let in_memory = config.url.contains(":memory:");

    if let Some(db_path) = config.url.strip_prefix("sqlite://") {
        if !in_memory {
            if let Some(parent) = Path::new(db_path).parent() {
                if !parent.as_os_str().is_empty() {
                    std::fs::create_dir_all(parent).map_err(|e| {
                        DatabaseError::ConnectionError(sqlx::Error::Configuration(Box::new(e)))
                    })?;
                }
            }
        }
    }

    let options = SqliteConnectOptions::from_str(&config.url)?
        .create_if_missing(true)
        .foreign_keys(true);

    let pool_options = if in_memory {
        SqlitePoolOptions::new()
            .max_connections(1)
            .min_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
    } else {
        SqlitePoolOptions::new().max_connections(config.max_connections.max(1))
    };

    let pool = pool_options.connect_with(options).await?;

    run_migrations(&pool).await?;

    info!("Database initialized successfully");

    Ok(pool)
}

async fn execute_migration(pool: &DbPool, name: &str, statement: &str) -> Result<(), DatabaseError> {
    sqlx::query(statement)
        .execute(pool)
        .await
        .map_err(|e| DatabaseError::MigrationError(format!("Failed to create {}: {}", name, e)))?;
    Ok(())
}

/// Run database migrations
async fn run_migrations(pool: &DbPool) -> Result<(), DatabaseError> {
    info!("Running database migrations...");

    execute_migration(
        pool,
        "credentials table",
        r#"
        CREATE TABLE IF NOT EXISTS credentials (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            platform TEXT NOT NULL,
            api_key TEXT NOT NULL,
            secret_key TEXT NOT NULL,
            passphrase TEXT,
            proxy_type TEXT,
            proxy_host TEXT,
            proxy_port INTEGER,
            proxy_username TEXT,
            proxy_password TEXT,
            created_at DATETIME NOT NULL DEFAULT CURRENT_TIMESTAMP,
            updated_at DATETIME NOT NULL DEFAULT CURRENT_TIMESTAMP
        )
        "#,
    )
    .await?;

    execute_migration(
        pool,
        "robots table",
        r#"
        CREATE TABLE IF NOT EXISTS robots (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            name TEXT NOT NULL,
            credential_id INTEGER NOT NULL,
            platform TEXT NOT NULL,
            symbol TEXT NOT NULL,
            status INTEGER NOT NULL CHECK(status IN (1, 2, 3, 4)),
            leverage REAL NOT NULL DEFAULT 1.0,
            max_runtime_secs INTEGER,
            schedule_start DATETIME,
            schedule_stop DATETIME,
            start_time DATETIME,
            pause_time DATETIME,
            default_market_state TEXT NOT NULL DEFAULT 'trend',
            total_profit REAL NOT NULL DEFAULT 0.0,
            created_at DATETIME NOT NULL DEFAULT CURRENT_TIMESTAMP,
            updated_at DATETIME NOT NULL DEFAULT CURRENT_TIMESTAMP
        )
        "#,
    )
    .await?;

    execute_migration(
        pool,
        "robot_risk_params table",
        r#"
        CREATE TABLE IF NOT EXISTS robot_risk_params (
            robot_id INTEGER NOT NULL,
            market_state TEXT NOT NULL,
            window_secs INTEGER NOT NULL,
            threshold REAL NOT NULL,
            stop_loss_percent REAL NOT NULL,
            auto_start_retreat_percent REAL NOT NULL,
            profit_retreat_percent REAL NOT NULL,
            margin_percent REAL NOT NULL,
            PRIMARY KEY (robot_id, market_state),
            FOREIGN KEY (robot_id) REFERENCES robots(id) ON DELETE CASCADE
        )
        "#,
    )
    .await?;

    execute_migration(
        pool,
        "orders table",
        r#"
        CREATE TABLE IF NOT EXISTS orders (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            robot_id INTEGER NOT NULL,
            credential_id INTEGER NOT NULL,
            platform TEXT NOT NULL,
            symbol TEXT NOT NULL,
            exchange_order_id TEXT,
            client_order_id TEXT,
            side TEXT NOT NULL CHECK(side IN ('BUY', 'SELL')),
            position_side TEXT NOT NULL CHECK(position_side IN ('LONG', 'SHORT')),
            order_type TEXT NOT NULL DEFAULT 'MARKET',
            price REAL NOT NULL DEFAULT 0.0,
            quantity REAL NOT NULL DEFAULT 0.0,
            filled_quantity REAL NOT NULL DEFAULT 0.0,
            avg_price REAL NOT NULL DEFAULT 0.0,
            leverage REAL NOT NULL DEFAULT 1.0,
            margin REAL NOT NULL DEFAULT 0.0,
            status TEXT NOT NULL CHECK(status IN ('PENDING', 'OPEN', 'CLOSED', 'FAILED', 'CANCELED')),
            raw_status TEXT,
            is_open INTEGER NOT NULL DEFAULT 0,
            exchange_update_time_ms INTEGER,
            source TEXT NOT NULL,
            open_fee REAL,
            open_fee_currency TEXT,
            close_fee REAL,
            close_fee_currency TEXT,
            close_price REAL,
            close_order_id TEXT,
            realized_profit REAL,
            open_time DATETIME,
            close_time DATETIME,
            hold_duration_secs INTEGER,
            close_reason TEXT,
            mark_price REAL,
            unrealized_profit REAL,
            close_mark_price REAL,
            highest_profit REAL NOT NULL DEFAULT 0.0,
            stop_loss_percent REAL,
            auto_start_retreat_percent REAL,
            profit_retreat_percent REAL,
            margin_percent REAL,
            market_state TEXT,
            error_message TEXT,
            created_at DATETIME NOT NULL DEFAULT CURRENT_TIMESTAMP,
            updated_at DATETIME NOT NULL DEFAULT CURRENT_TIMESTAMP
        )
        "#,
    )
    .await?;

    execute_migration(
        pool,
        "exchange_orders table",
        r#"
        CREATE TABLE IF NOT EXISTS exchange_orders (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            platform TEXT NOT NULL,
            credential_id INTEGER NOT NULL,
            robot_id INTEGER,
            symbol TEXT NOT NULL,
            exchange_order_id TEXT NOT NULL,
            client_order_id TEXT,
            side TEXT NOT NULL,
            position_side TEXT,
            order_type TEXT NOT NULL,
            reduce_only INTEGER NOT NULL DEFAULT 0,
            price REAL NOT NULL DEFAULT 0.0,
            quantity REAL NOT NULL DEFAULT 0.0,
            filled_quantity REAL NOT NULL DEFAULT 0.0,
            avg_price REAL NOT NULL DEFAULT 0.0,
            raw_status TEXT NOT NULL,
            status TEXT NOT NULL,
            is_open INTEGER NOT NULL DEFAULT 0,
            create_time_ms INTEGER NOT NULL DEFAULT 0,
            update_time_ms INTEGER NOT NULL DEFAULT 0,
            updated_at DATETIME NOT NULL DEFAULT CURRENT_TIMESTAMP,
            UNIQUE (platform, credential_id, exchange_order_id)
        )
        "#,
    )
    .await?;

    execute_migration(
        pool,
        "trade_fills table",
        r#"
        CREATE TABLE IF NOT EXISTS trade_fills (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            credential_id INTEGER NOT NULL,
            platform TEXT NOT NULL,
            symbol TEXT NOT NULL,
            exchange_order_id TEXT NOT NULL,
            trade_id TEXT NOT NULL,
            side TEXT NOT NULL,
            position_side TEXT,
            price REAL NOT NULL,
            quantity REAL NOT NULL,
            realized_pnl REAL NOT NULL DEFAULT 0.0,
            fee REAL NOT NULL DEFAULT 0.0,
            fee_currency TEXT NOT NULL DEFAULT '',
            trade_time_ms INTEGER NOT NULL,
            robot_id INTEGER,
            order_ledger_id INTEGER,
            created_at DATETIME NOT NULL DEFAULT CURRENT_TIMESTAMP,
            updated_at DATETIME NOT NULL DEFAULT CURRENT_TIMESTAMP,
            UNIQUE (credential_id, platform, trade_id)
        )
        "#,
    )
    .await?;

    let indexes = [
        (
            "ux_orders_exchange",
            "CREATE UNIQUE INDEX IF NOT EXISTS ux_orders_exchange ON orders(platform, credential_id, exchange_order_id)",
        ),
        (
            "ux_orders_open_side",
            "CREATE UNIQUE INDEX IF NOT EXISTS ux_orders_open_side ON orders(robot_id, position_side) WHERE status = 'OPEN'",
        ),
        (
            "idx_orders_robot_status",
            "CREATE INDEX IF NOT EXISTS idx_orders_robot_status ON orders(robot_id, status)",
        ),
        (
            "idx_orders_client_id",
            "CREATE INDEX IF NOT EXISTS idx_orders_client_id ON orders(platform, credential_id, client_order_id)",
        ),
        (
            "idx_orders_close_order",
            "CREATE INDEX IF NOT EXISTS idx_orders_close_order ON orders(credential_id, close_order_id)",
        ),
        (
            "idx_exchange_orders_open",
            "CREATE INDEX IF NOT EXISTS idx_exchange_orders_open ON exchange_orders(platform, credential_id, symbol, is_open)",
        ),
        (
            "idx_trade_fills_order",
            "CREATE INDEX IF NOT EXISTS idx_trade_fills_order ON trade_fills(credential_id, exchange_order_id)",
        ),
        (
            "idx_robots_status",
            "CREATE INDEX IF NOT EXISTS idx_robots_status ON robots(status)",
        ),
    ];
    for (name, statement) in indexes {
        execute_migration(pool, name, statement).await?;
    }

    info!("Database migrations completed successfully");

    Ok(())
}

/// Database configuration
#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    /// Database URL (e.g., "sqlite://data/tradebot.db")
    pub url: String,

    /// Maximum number of connections in the pool
    pub max_connections: u32,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: "sqlite://data/tradebot.db".to_string(),
            max_connections: 5,
        }
    }
}

impl DatabaseConfig {
    /// Load from environment variables
    pub fn from_env() -> Self {
        let defaults = Self::default();

        let url = std::env::var("DATABASE_URL").unwrap_or(defaults.url);

        let max_connections = std::env::var("DATABASE_MAX_CONNECTIONS")
            .ok()
            .and_then(|s| s.parse().ok())
            .filter(|n| *n > 0)
            .unwrap_or(defaults.max_connections);

        Self {
            url,
            max_connections,
        }
    }
}
