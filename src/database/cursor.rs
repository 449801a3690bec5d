//! Cursor Repository - durable scan position in `spamgate.scan_cursor`

use async_trait::async_trait;
use sqlx::Row;
use sqlx::postgres::PgPool;
use tracing::info;

use crate::scan::{CursorStore, StoreError};

pub struct PgCursorRepository {
    pool: PgPool,
}

impl PgCursorRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn init_schema(&self) -> Result<(), String> {
        // Single-row table
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS spamgate.scan_cursor (
                id SMALLINT PRIMARY KEY DEFAULT 1 CHECK (id = 1),
                last_checked_uid BIGINT NOT NULL,
                updated_at TIMESTAMP WITH TIME ZONE DEFAULT NOW()
            )
        "#,
        )
        .execute(&self.pool)
        .await
        .map_err(|e| format!("Failed to create scan_cursor table: {}", e))?;

        info!("Scan cursor table initialized");
        Ok(())
    }
}

#[async_trait]
impl CursorStore for PgCursorRepository {
    async fn load(&self) -> Result<Option<u64>, StoreError> {
        let row = sqlx::query("SELECT last_checked_uid FROM spamgate.scan_cursor WHERE id = 1")
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| StoreError::Backend(format!("Failed to load scan cursor: {}", e)))?;

        Ok(row.map(|row| {
            let uid: i64 = row.get("last_checked_uid");
            uid.max(0) as u64
        }))
    }

    async fn save(&self, cursor: u64) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO spamgate.scan_cursor (id, last_checked_uid, updated_at)
            VALUES (1, $1, NOW())
            ON CONFLICT (id) DO UPDATE SET
                last_checked_uid = EXCLUDED.last_checked_uid,
                updated_at = EXCLUDED.updated_at
        "#,
        )
        .bind(i64::try_from(cursor).unwrap_or(i64::MAX))
        .execute(&self.pool)
        .await
        .map_err(|e| StoreError::Backend(format!("Failed to save scan cursor: {}", e)))?;

        Ok(())
    }
}
