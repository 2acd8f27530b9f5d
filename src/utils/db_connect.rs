// src/utils/db_connect.rs
use anyhow::{Context, Result};
use bb8::Pool;
use bb8_postgres::PostgresConnectionManager;
use log::info;
use std::time::Duration;
use tokio_postgres::{Config, NoTls};

use crate::utils::merge_config::MergeConfig;

pub type PgPool = Pool<PostgresConnectionManager<NoTls>>;

/// Reads environment variables and constructs a PostgreSQL config.
pub fn build_pg_config() -> Config {
    let mut config = Config::new();
    let host = std::env::var("POSTGRES_HOST").unwrap_or_else(|_| "127.0.0.1".to_string());
    let port_str = std::env::var("POSTGRES_PORT").unwrap_or_else(|_| "5432".to_string());
    let port = port_str.parse::<u16>().unwrap_or(5432);
    let dbname = std::env::var("POSTGRES_DB").unwrap_or_else(|_| "crm".to_string());
    let user = std::env::var("POSTGRES_USER").unwrap_or_else(|_| "postgres".to_string());
    let password = std::env::var("POSTGRES_PASSWORD").unwrap_or_default();

    info!(
        "DB Config: Host={}, Port={}, DB={}, User={}",
        host, port, dbname, user
    );
    config
        .host(&host)
        .port(port)
        .dbname(&dbname)
        .user(&user)
        .password(&password);
    config.application_name("crm_dedupe");
    config.connect_timeout(Duration::from_secs(10));
    config
}

/// (max size, min idle) for the pool; at least one connection, and never
/// more idle connections than the maximum.
pub fn pool_sizes(settings: &MergeConfig) -> (u32, u32) {
    let max_size = settings.db_pool_max_size.max(1);
    (max_size, settings.db_pool_min_idle.min(max_size))
}

/// Initializes the database connection pool, sized from `settings`.
pub async fn connect(settings: &MergeConfig) -> Result<PgPool> {
    let config = build_pg_config();
    let (max_size, min_idle) = pool_sizes(settings);
    info!(
        "Connecting to PostgreSQL database (pool max {}, min idle {})...",
        max_size, min_idle
    );
    let manager = PostgresConnectionManager::new(config, NoTls);

    let pool = Pool::builder()
        .max_size(max_size)
        .min_idle(Some(min_idle))
        .idle_timeout(Some(Duration::from_secs(180)))
        .connection_timeout(Duration::from_secs(15))
        .build(manager)
        .await
        .context("Failed to build database connection pool")?;

    // Test connection
    {
        let conn = pool
            .get()
            .await
            .context("Failed to get test connection from pool")?;
        conn.query_one("SELECT 1", &[])
            .await
            .context("Test query 'SELECT 1' failed")?;
    }
    info!("Database connection pool initialized successfully.");
    Ok(pool)
}

/// (total, idle, in use) connection counts.
pub fn get_pool_status(pool: &PgPool) -> (u32, u32, u32) {
    let state = pool.state();
    let in_use = state.connections.saturating_sub(state.idle_connections);
    (state.connections, state.idle_connections, in_use)
}
