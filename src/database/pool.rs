//! Database Connection Pool using sqlx

use anyhow::{Context, Result, anyhow};
use sqlx::postgres::{PgPool, PgPoolOptions};
use std::sync::Arc;
use tracing::info;

use crate::database::accounts::PgAccountRepository;
use crate::database::cursor::PgCursorRepository;

pub struct DatabasePool {
    pool: PgPool,
    accounts: Arc<PgAccountRepository>,
    cursor: Arc<PgCursorRepository>,
}

impl DatabasePool {
    pub async fn new(connection_string: &str, max_connections: u32) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections.max(1))
            .connect(connection_string)
            .await
            .context("Failed to connect to PostgreSQL")?;

        info!("Connected to PostgreSQL");

        Ok(Self {
            accounts: Arc::new(PgAccountRepository::new(pool.clone())),
            cursor: Arc::new(PgCursorRepository::new(pool.clone())),
            pool,
        })
    }

    pub async fn init_schema(&self) -> Result<()> {
        info!("Initializing database schema...");

        sqlx::query("CREATE SCHEMA IF NOT EXISTS spamgate")
            .execute(&self.pool)
            .await
            .context("Failed to create spamgate schema")?;

        self.accounts.init_schema().await.map_err(|e| anyhow!(e))?;
        self.cursor.init_schema().await.map_err(|e| anyhow!(e))?;

        info!("Database schema initialized");
        Ok(())
    }

    pub fn accounts(&self) -> Arc<PgAccountRepository> {
        self.accounts.clone()
    }

    pub fn cursor(&self) -> Arc<PgCursorRepository> {
        self.cursor.clone()
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}
