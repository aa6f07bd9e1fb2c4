//! Database module

use std::time::Duration;

use anyhow::{Context, Result};
use sqlx::mysql::MySqlPoolOptions;
use sqlx::MySqlPool;

/// Create a database connection pool and verify connectivity.
///
/// Pool caps are process-wide: every worker in this process draws its
/// dictionary and import transactions from the same pool.
pub async fn create_pool(database_url: &str) -> Result<MySqlPool> {
    let pool = MySqlPoolOptions::new()
        .max_connections(25)
        .min_connections(5)
        .max_lifetime(Duration::from_secs(5 * 60))
        .connect(database_url)
        .await
        .context("failed to connect to MySQL")?;

    sqlx::query("SELECT 1")
        .execute(&pool)
        .await
        .context("database ping failed")?;

    Ok(pool)
}
