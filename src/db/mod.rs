//! Database connection pool, migrations, and health check.
//!
//! The pool backs the Postgres dedup ledger in [`processed`].

pub mod processed;

use crate::config::secrets::{ExposeSecret, SecretString};
use crate::error::{Error, Result};
use sqlx::PgPool;
use sqlx::postgres::PgPoolOptions;

/// Database handle. Owns the connection pool.
pub struct Db {
    pool: PgPool,
}

impl Db {
    /// Connect to Postgres and create a connection pool.
    pub async fn connect(url: &SecretString) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(10)
            .connect(url.expose_secret())
            .await?;
        Ok(Self { pool })
    }

    /// Run all pending migrations.
    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| Error::Other(format!("migration failed: {e}")))?;
        Ok(())
    }

    /// Simple health check: run a SELECT 1.
    pub async fn health_check(&self) -> Result<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }
}
