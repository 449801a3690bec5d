//! Account Repository - the host application's `users` table seen through `AccountStore`
//!
//! Expects `users(uid BIGINT, name TEXT, mail TEXT, status SMALLINT)` with status 1 for
//! active and 0 for blocked accounts. uid 0 (anonymous) and uid 1 (site owner) are never
//! scanned or counted. Last-seen IPs and scan protection live in the `spamgate` schema.

use async_trait::async_trait;
use sqlx::Row;
use sqlx::postgres::{PgPool, PgRow};
use tracing::{debug, info};

use crate::scan::{Account, AccountStore, StoreError};

/// Lowest uid the scanner ever touches
const FIRST_SCANNED_UID: i64 = 2;

pub struct PgAccountRepository {
    pool: PgPool,
}

impl PgAccountRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Create the side tables; the `users` table belongs to the host application
    pub async fn init_schema(&self) -> Result<(), String> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS spamgate.account_ips (
                uid BIGINT PRIMARY KEY,
                ip_address VARCHAR(45) NOT NULL,
                seen_at TIMESTAMP WITH TIME ZONE DEFAULT NOW()
            )
        "#,
        )
        .execute(&self.pool)
        .await
        .map_err(|e| format!("Failed to create account_ips table: {}", e))?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS spamgate.protected_accounts (
                uid BIGINT PRIMARY KEY,
                granted_at TIMESTAMP WITH TIME ZONE DEFAULT NOW()
            )
        "#,
        )
        .execute(&self.pool)
        .await
        .map_err(|e| format!("Failed to create protected_accounts table: {}", e))?;

        info!("Account tables initialized");
        Ok(())
    }

    async fn exists(&self, id: u64) -> Result<bool, StoreError> {
        let row = sqlx::query("SELECT EXISTS(SELECT 1 FROM users WHERE uid = $1) AS found")
            .bind(to_uid(id))
            .fetch_one(&self.pool)
            .await
            .map_err(|e| backend("Failed to look up account", e))?;
        Ok(row.get("found"))
    }

    async fn count_where(&self, sql: &str, id: u64) -> Result<u64, StoreError> {
        let row = sqlx::query(sql)
            .bind(to_uid(id))
            .bind(FIRST_SCANNED_UID)
            .fetch_one(&self.pool)
            .await
            .map_err(|e| backend("Failed to count accounts", e))?;
        let count: i64 = row.get("count");
        Ok(count.max(0) as u64)
    }
}

#[async_trait]
impl AccountStore for PgAccountRepository {
    async fn accounts_after(
        &self,
        cursor: u64,
        limit: usize,
        include_blocked: bool,
    ) -> Result<Vec<Account>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT u.uid, u.name, u.mail, u.status, ip.ip_address
            FROM users u
            LEFT JOIN spamgate.account_ips ip ON ip.uid = u.uid
            WHERE u.uid > $1 AND u.uid >= $2 AND ($3 OR u.status = 1)
            ORDER BY u.uid ASC
            LIMIT $4
        "#,
        )
        .bind(to_uid(cursor))
        .bind(FIRST_SCANNED_UID)
        .bind(include_blocked)
        .bind(i64::try_from(limit).unwrap_or(i64::MAX))
        .fetch_all(&self.pool)
        .await
        .map_err(|e| backend("Failed to list accounts", e))?;

        debug!(cursor, fetched = rows.len(), "Loaded scan candidates");
        Ok(rows.iter().map(account_from_row).collect())
    }

    async fn block(&self, id: u64) -> Result<(), StoreError> {
        let result = sqlx::query("UPDATE users SET status = 0 WHERE uid = $1")
            .bind(to_uid(id))
            .execute(&self.pool)
            .await
            .map_err(|e| backend("Failed to block account", e))?;

        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound(id));
        }
        Ok(())
    }

    async fn delete(&self, id: u64) -> Result<(), StoreError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| backend("Failed to start transaction", e))?;

        sqlx::query("DELETE FROM spamgate.account_ips WHERE uid = $1")
            .bind(to_uid(id))
            .execute(&mut *tx)
            .await
            .map_err(|e| backend("Failed to delete account IP", e))?;

        sqlx::query("DELETE FROM spamgate.protected_accounts WHERE uid = $1")
            .bind(to_uid(id))
            .execute(&mut *tx)
            .await
            .map_err(|e| backend("Failed to delete account protection", e))?;

        let result = sqlx::query("DELETE FROM users WHERE uid = $1")
            .bind(to_uid(id))
            .execute(&mut *tx)
            .await
            .map_err(|e| backend("Failed to delete account", e))?;

        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound(id));
        }

        tx.commit()
            .await
            .map_err(|e| backend("Failed to commit account deletion", e))?;
        Ok(())
    }

    async fn is_protected(&self, id: u64) -> Result<bool, StoreError> {
        if to_uid(id) < FIRST_SCANNED_UID {
            return Ok(true);
        }

        let row = sqlx::query(
            "SELECT EXISTS(SELECT 1 FROM spamgate.protected_accounts WHERE uid = $1) AS protected",
        )
        .bind(to_uid(id))
        .fetch_one(&self.pool)
        .await
        .map_err(|e| backend("Failed to check account protection", e))?;

        Ok(row.get("protected"))
    }

    async fn set_protected(&self, id: u64, protected: bool) -> Result<(), StoreError> {
        let sql = if protected {
            r#"
            INSERT INTO spamgate.protected_accounts (uid)
            SELECT uid FROM users WHERE uid = $1
            ON CONFLICT (uid) DO NOTHING
        "#
        } else {
            "DELETE FROM spamgate.protected_accounts WHERE uid = $1"
        };
        let result = sqlx::query(sql)
            .bind(to_uid(id))
            .execute(&self.pool)
            .await
            .map_err(|e| backend("Failed to update account protection", e))?;

        if result.rows_affected() == 0 && !self.exists(id).await? {
            return Err(StoreError::NotFound(id));
        }
        debug!(uid = id, protected, "Account protection updated");
        Ok(())
    }

    async fn record_ip(&self, id: u64, ip_address: &str) -> Result<(), StoreError> {
        let result = sqlx::query(
            r#"
            INSERT INTO spamgate.account_ips (uid, ip_address, seen_at)
            SELECT uid, $2, NOW() FROM users WHERE uid = $1
            ON CONFLICT (uid) DO UPDATE SET
                ip_address = EXCLUDED.ip_address,
                seen_at = EXCLUDED.seen_at
        "#,
        )
        .bind(to_uid(id))
        .bind(ip_address)
        .execute(&self.pool)
        .await
        .map_err(|e| backend("Failed to record account IP", e))?;

        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound(id));
        }
        Ok(())
    }

    async fn count_up_to(&self, id: u64) -> Result<u64, StoreError> {
        self.count_where(
            "SELECT COUNT(*) AS count FROM users WHERE uid <= $1 AND uid >= $2",
            id,
        )
        .await
    }

    async fn count_after(&self, id: u64) -> Result<u64, StoreError> {
        self.count_where(
            "SELECT COUNT(*) AS count FROM users WHERE uid > $1 AND uid >= $2",
            id,
        )
        .await
    }

    async fn last_at_or_before(&self, id: u64) -> Result<Option<Account>, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT u.uid, u.name, u.mail, u.status, ip.ip_address
            FROM users u
            LEFT JOIN spamgate.account_ips ip ON ip.uid = u.uid
            WHERE u.uid <= $1 AND u.uid >= 1
            ORDER BY u.uid DESC
            LIMIT 1
        "#,
        )
        .bind(to_uid(id))
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| backend("Failed to load last checked account", e))?;

        Ok(row.as_ref().map(account_from_row))
    }
}

fn account_from_row(row: &PgRow) -> Account {
    let uid: i64 = row.get("uid");
    let status: i16 = row.get("status");
    Account {
        id: uid.max(0) as u64,
        name: row.get("name"),
        email: row.get("mail"),
        last_ip: row.get("ip_address"),
        blocked: status == 0,
    }
}

fn to_uid(id: u64) -> i64 {
    i64::try_from(id).unwrap_or(i64::MAX)
}

fn backend(context: &str, err: sqlx::Error) -> StoreError {
    StoreError::Backend(format!("{}: {}", context, err))
}
