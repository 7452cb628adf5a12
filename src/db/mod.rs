//! Database connection pool, migrations, and health check.
//!
//! One Postgres pool backs both the job store and the broker: job rows in
//! `jobs`, the dispatch queue in pgmq, retry and dead-letter entries in
//! their own tables.

pub mod broker;
pub mod jobs;
pub mod pgmq;

use crate::error::Result;
use sqlx::PgPool;
use sqlx::postgres::PgPoolOptions;

/// Name of the pgmq queue used as the dispatch queue.
pub const MAIN_QUEUE: &str = "jobs";

/// Database handle. Owns the connection pool shared across all modules.
pub struct Db {
    pool: PgPool,
}

impl Db {
    /// Connect to Postgres and create a connection pool.
    pub async fn connect(url: &str) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(10)
            .connect(url)
            .await?;
        Ok(Self { pool })
    }

    /// Run all pending migrations.
    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        Ok(())
    }

    /// Migrate and make sure the dispatch queue exists.
    pub async fn prepare(&self) -> Result<()> {
        self.migrate().await?;
        self.create_queue(MAIN_QUEUE).await
    }

    /// Simple health check — run a SELECT 1.
    pub async fn health_check(&self) -> Result<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }

    /// Close the pool, waiting for checked-out connections to return.
    pub async fn close(&self) {
        self.pool.close().await;
    }

    pub(crate) fn pool(&self) -> &PgPool {
        &self.pool
    }
}
