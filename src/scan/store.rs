//! Account and cursor storage used by the batch scanner

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::ops::Bound;
use thiserror::Error;
use tokio::sync::RwLock;

use crate::identity::IdentityTriple;

/// A stored user account as seen by the scanner
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Account {
    pub id: u64,
    pub name: String,
    pub email: Option<String>,
    /// Most recent address the account was seen from, if recorded
    pub last_ip: Option<String>,
    pub blocked: bool,
}

impl Account {
    pub fn identity(&self) -> IdentityTriple {
        IdentityTriple::new(
            self.email.as_deref(),
            Some(&self.name),
            self.last_ip.as_deref(),
        )
    }
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("account {0} not found")]
    NotFound(u64),

    #[error("storage backend error: {0}")]
    Backend(String),
}

#[async_trait]
pub trait AccountStore: Send + Sync {
    /// Up to `limit` accounts with id greater than `cursor`, ascending by id
    async fn accounts_after(
        &self,
        cursor: u64,
        limit: usize,
        include_blocked: bool,
    ) -> Result<Vec<Account>, StoreError>;

    async fn block(&self, id: u64) -> Result<(), StoreError>;

    async fn delete(&self, id: u64) -> Result<(), StoreError>;

    /// Accounts holding the "protected from spam scans" capability
    async fn is_protected(&self, id: u64) -> Result<bool, StoreError>;

    /// Grant or revoke protection from spam scans
    async fn set_protected(&self, id: u64, protected: bool) -> Result<(), StoreError>;

    /// Remember the address an account was last seen from, for later rescans
    async fn record_ip(&self, id: u64, ip: &str) -> Result<(), StoreError>;

    /// Accounts with id at or below `id`
    async fn count_up_to(&self, id: u64) -> Result<u64, StoreError>;

    /// Accounts with id above `id`
    async fn count_after(&self, id: u64) -> Result<u64, StoreError>;

    /// Highest-numbered account at or below `id`
    async fn last_at_or_before(&self, id: u64) -> Result<Option<Account>, StoreError>;
}

/// Durable position of the batch scan
#[async_trait]
pub trait CursorStore: Send + Sync {
    async fn load(&self) -> Result<Option<u64>, StoreError>;

    async fn save(&self, cursor: u64) -> Result<(), StoreError>;
}

/// Account store kept in memory, for tests and deployments without Postgres
#[derive(Debug, Default)]
pub struct InMemoryAccountStore {
    accounts: RwLock<BTreeMap<u64, Account>>,
    protected: RwLock<HashSet<u64>>,
}

impl InMemoryAccountStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn insert(&self, account: Account) {
        self.accounts.write().await.insert(account.id, account);
    }

    pub async fn protect(&self, id: u64) {
        self.protected.write().await.insert(id);
    }

    pub async fn get(&self, id: u64) -> Option<Account> {
        self.accounts.read().await.get(&id).cloned()
    }

    pub async fn len(&self) -> usize {
        self.accounts.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

#[async_trait]
impl AccountStore for InMemoryAccountStore {
    async fn accounts_after(
        &self,
        cursor: u64,
        limit: usize,
        include_blocked: bool,
    ) -> Result<Vec<Account>, StoreError> {
        let accounts = self.accounts.read().await;
        Ok(accounts
            .range((Bound::Excluded(cursor), Bound::Unbounded))
            .map(|(_, account)| account)
            .filter(|account| include_blocked || !account.blocked)
            .take(limit)
            .cloned()
            .collect())
    }

    async fn block(&self, id: u64) -> Result<(), StoreError> {
        let mut accounts = self.accounts.write().await;
        let account = accounts.get_mut(&id).ok_or(StoreError::NotFound(id))?;
        account.blocked = true;
        Ok(())
    }

    async fn delete(&self, id: u64) -> Result<(), StoreError> {
        self.accounts
            .write()
            .await
            .remove(&id)
            .map(|_| ())
            .ok_or(StoreError::NotFound(id))
    }

    async fn is_protected(&self, id: u64) -> Result<bool, StoreError> {
        Ok(self.protected.read().await.contains(&id))
    }

    async fn set_protected(&self, id: u64, protected: bool) -> Result<(), StoreError> {
        if !self.accounts.read().await.contains_key(&id) {
            return Err(StoreError::NotFound(id));
        }
        let mut set = self.protected.write().await;
        if protected {
            set.insert(id);
        } else {
            set.remove(&id);
        }
        Ok(())
    }

    async fn record_ip(&self, id: u64, ip: &str) -> Result<(), StoreError> {
        let mut accounts = self.accounts.write().await;
        let account = accounts.get_mut(&id).ok_or(StoreError::NotFound(id))?;
        account.last_ip = Some(ip.to_string());
        Ok(())
    }

    async fn count_up_to(&self, id: u64) -> Result<u64, StoreError> {
        Ok(self.accounts.read().await.range(..=id).count() as u64)
    }

    async fn count_after(&self, id: u64) -> Result<u64, StoreError> {
        Ok(self
            .accounts
            .read()
            .await
            .range((Bound::Excluded(id), Bound::Unbounded))
            .count() as u64)
    }

    async fn last_at_or_before(&self, id: u64) -> Result<Option<Account>, StoreError> {
        Ok(self
            .accounts
            .read()
            .await
            .range(..=id)
            .next_back()
            .map(|(_, account)| account.clone()))
    }
}

#[derive(Debug, Default)]
pub struct InMemoryCursorStore {
    cursor: RwLock<Option<u64>>,
}

impl InMemoryCursorStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn starting_at(cursor: u64) -> Self {
        Self {
            cursor: RwLock::new(Some(cursor)),
        }
    }
}

#[async_trait]
impl CursorStore for InMemoryCursorStore {
    async fn load(&self) -> Result<Option<u64>, StoreError> {
        Ok(*self.cursor.read().await)
    }

    async fn save(&self, cursor: u64) -> Result<(), StoreError> {
        *self.cursor.write().await = Some(cursor);
        Ok(())
    }
}
