//! Batch Scanner
//!
//! Re-examines existing accounts in ascending id order, a bounded number per run,
//! resuming from a persisted cursor.
//!
//! ```text
//!            run_once (candidates == quota)
//!          ┌────────────────────────────────┐
//!          ▼                                │
//!       ┌──────┐  run_once   ┌──────────┐   │
//!       │ Idle │────────────►│ Scanning │───┘
//!       └──────┘             └──────────┘
//!          ▲                      │ candidates < quota
//!          │ reset_cursor         ▼
//!          │               ┌───────────┐
//!          └───────────────│ Exhausted │◄── run_once with nothing new
//!                          └───────────┘
//! ```
//!
//! The cursor is saved after every account, whatever its outcome, so a crash
//! mid-run never re-examines an account and never skips an unexamined one.

use futures::StreamExt;
use futures::stream;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, warn};

use crate::config::{Settings, SettingsHandle};
use crate::gate::{GateDecisionEngine, Penalty, Verdict};
use crate::scan::store::{Account, AccountStore, CursorStore, StoreError};

/// What happens to an account found to belong to a spammer
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RemedialAction {
    /// Log only
    #[default]
    None,
    Block,
    Delete,
}

impl FromStr for RemedialAction {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "none" | "0" => Ok(RemedialAction::None),
            "block" | "1" => Ok(RemedialAction::Block),
            "delete" | "2" => Ok(RemedialAction::Delete),
            other => Err(format!("unknown action {other:?}, expected none, block or delete")),
        }
    }
}

impl fmt::Display for RemedialAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            RemedialAction::None => "none",
            RemedialAction::Block => "block",
            RemedialAction::Delete => "delete",
        })
    }
}

/// Treatment of an account whose lookup failed
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LookupFailurePolicy {
    /// Count the anomaly and move past the account
    #[default]
    SkipAndAdvance,
    /// End the run before the account so the next run retries it
    HaltAndRevisit,
}

impl FromStr for LookupFailurePolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "skip" | "skip_and_advance" => Ok(LookupFailurePolicy::SkipAndAdvance),
            "halt" | "halt_and_revisit" => Ok(LookupFailurePolicy::HaltAndRevisit),
            other => Err(format!("unknown failure policy {other:?}, expected skip or halt")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScanPolicy {
    /// Accounts per run, 0 = scanning disabled
    pub max_per_run: usize,
    pub include_blocked: bool,
    pub action: RemedialAction,
    pub failure_policy: LookupFailurePolicy,
    /// Lookups kept in flight ahead of the account being applied
    pub pipeline_width: usize,
    pub retry_backoff: Duration,
}

impl Default for ScanPolicy {
    fn default() -> Self {
        Self {
            max_per_run: 0,
            include_blocked: false,
            action: RemedialAction::None,
            failure_policy: LookupFailurePolicy::SkipAndAdvance,
            pipeline_width: 4,
            retry_backoff: Duration::from_millis(250),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScanState {
    #[default]
    Idle,
    Scanning,
    Exhausted,
}

/// Outcome of one run
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScanSummary {
    /// Accounts the cursor moved past, including skipped and protected ones
    pub checked: u64,
    pub flagged: u64,
    /// Lookup failures (scan anomalies)
    pub skipped: u64,
    /// Flagged but exempt from remedial action
    pub protected: u64,
    /// Accounts blocked or deleted
    pub actioned: u64,
    pub cursor_before: u64,
    pub cursor_after: u64,
    pub state: ScanState,
}

/// Progress report for operators
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScanStatus {
    pub cursor: u64,
    pub state: ScanState,
    pub accounts_checked: u64,
    pub accounts_remaining: u64,
    pub last_checked: Option<Account>,
}

#[derive(Debug, Error)]
pub enum ScanError {
    #[error("a scan run is already in progress")]
    AlreadyRunning,

    #[error(transparent)]
    Store(#[from] StoreError),
}

pub struct BatchScanner {
    engine: Arc<GateDecisionEngine>,
    accounts: Arc<dyn AccountStore>,
    cursors: Arc<dyn CursorStore>,
    settings: Arc<SettingsHandle>,
    run_lock: Mutex<()>,
    state: RwLock<ScanState>,
}

impl BatchScanner {
    pub fn new(
        engine: Arc<GateDecisionEngine>,
        accounts: Arc<dyn AccountStore>,
        cursors: Arc<dyn CursorStore>,
        settings: Arc<SettingsHandle>,
    ) -> Self {
        Self {
            engine,
            accounts,
            cursors,
            settings,
            run_lock: Mutex::new(()),
            state: RwLock::new(ScanState::Idle),
        }
    }

    pub async fn state(&self) -> ScanState {
        *self.state.read().await
    }

    /// Persisted cursor, or the configured starting point before the first save
    pub async fn cursor(&self) -> Result<u64, StoreError> {
        match self.cursors.load().await? {
            Some(cursor) => Ok(cursor),
            None => Ok(self.settings.current().config.scan.initial_cursor),
        }
    }

    /// Examine the next batch of accounts. Overlapping calls fail with `AlreadyRunning`.
    pub async fn run_once(&self) -> Result<ScanSummary, ScanError> {
        let _running = self
            .run_lock
            .try_lock()
            .map_err(|_| ScanError::AlreadyRunning)?;

        let snapshot = self.settings.current();
        let policy = &snapshot.settings.scan;
        let cursor = self.cursor().await?;

        let mut summary = ScanSummary {
            cursor_before: cursor,
            cursor_after: cursor,
            state: self.state().await,
            ..ScanSummary::default()
        };

        if policy.max_per_run == 0 {
            debug!("Account scanning disabled (quota is 0)");
            return Ok(summary);
        }

        let candidates = self
            .accounts
            .accounts_after(cursor, policy.max_per_run, policy.include_blocked)
            .await?;

        if candidates.is_empty() {
            debug!(cursor, "No accounts beyond cursor");
            summary.state = ScanState::Exhausted;
            *self.state.write().await = ScanState::Exhausted;
            return Ok(summary);
        }

        let exhausts = candidates.len() < policy.max_per_run;
        info!(
            cursor,
            candidates = candidates.len(),
            quota = policy.max_per_run,
            version = snapshot.version,
            "Starting account scan"
        );
        *self.state.write().await = ScanState::Scanning;

        let outcome = self.process(candidates, &snapshot.settings, &mut summary).await;

        let next_state = match &outcome {
            Ok(true) if exhausts => ScanState::Exhausted,
            _ => ScanState::Idle,
        };
        *self.state.write().await = next_state;
        summary.state = next_state;

        if let Err(err) = outcome {
            warn!(
                cursor = summary.cursor_after,
                error = %err,
                "Account scan aborted by storage failure"
            );
            return Err(err.into());
        }

        info!(
            checked = summary.checked,
            flagged = summary.flagged,
            skipped = summary.skipped,
            protected = summary.protected,
            actioned = summary.actioned,
            cursor = summary.cursor_after,
            state = ?summary.state,
            "Account scan finished"
        );
        Ok(summary)
    }

    /// Returns false when the run stopped early on a lookup failure
    async fn process(
        &self,
        candidates: Vec<Account>,
        settings: &Settings,
        summary: &mut ScanSummary,
    ) -> Result<bool, StoreError> {
        let engine = &self.engine;
        let policy = &settings.scan;
        let criteria = &settings.criteria;
        let whitelist = &settings.whitelist;

        let mut lookups = stream::iter(candidates.into_iter().map(|account| async move {
            let verdict = engine
                .assess(
                    &account.identity(),
                    criteria,
                    whitelist,
                    Penalty::Block,
                    policy.retry_backoff,
                )
                .await;
            (account, verdict)
        }))
        .buffered(policy.pipeline_width.max(1));

        while let Some((account, outcome)) = lookups.next().await {
            match outcome {
                Ok(verdict) if verdict.is_spam() => {
                    summary.flagged += 1;
                    self.remediate(&account, &verdict, policy.action, summary)
                        .await?;
                }
                Ok(_) => {}
                Err(err) => {
                    warn!(
                        account_id = account.id,
                        kind = %err.kind,
                        error = %err.message,
                        "Scan anomaly: reputation lookup failed"
                    );
                    summary.skipped += 1;
                    if policy.failure_policy == LookupFailurePolicy::HaltAndRevisit {
                        return Ok(false);
                    }
                }
            }

            self.cursors.save(account.id).await?;
            summary.checked += 1;
            summary.cursor_after = account.id;
        }

        Ok(true)
    }

    async fn remediate(
        &self,
        account: &Account,
        verdict: &Verdict,
        action: RemedialAction,
        summary: &mut ScanSummary,
    ) -> Result<(), StoreError> {
        if self.accounts.is_protected(account.id).await? {
            summary.protected += 1;
            info!(
                account_id = account.id,
                name = %account.name,
                triggers = ?verdict.triggers(),
                "Spammer account is protected from scans, no action taken"
            );
            return Ok(());
        }

        match action {
            RemedialAction::None => {
                info!(
                    account_id = account.id,
                    name = %account.name,
                    triggers = ?verdict.triggers(),
                    "Found spammer account"
                );
            }
            RemedialAction::Block if account.blocked => {
                debug!(account_id = account.id, "Spammer account already blocked");
            }
            RemedialAction::Block => {
                self.accounts.block(account.id).await?;
                summary.actioned += 1;
                warn!(account_id = account.id, name = %account.name, "Blocked spammer account");
            }
            RemedialAction::Delete => {
                self.accounts.delete(account.id).await?;
                summary.actioned += 1;
                warn!(account_id = account.id, name = %account.name, "Deleted spammer account");
            }
        }
        Ok(())
    }

    /// Move the cursor explicitly, e.g. to 0 to rescan everything. Returns the old cursor.
    pub async fn reset_cursor(&self, to: u64) -> Result<u64, ScanError> {
        let _running = self
            .run_lock
            .try_lock()
            .map_err(|_| ScanError::AlreadyRunning)?;

        let previous = self.cursor().await?;
        self.cursors.save(to).await?;
        *self.state.write().await = ScanState::Idle;

        info!(from = previous, to, "Scan cursor reset");
        Ok(previous)
    }

    pub async fn status(&self) -> Result<ScanStatus, StoreError> {
        let cursor = self.cursor().await?;
        let last_checked = if cursor > 0 {
            self.accounts.last_at_or_before(cursor).await?
        } else {
            None
        };

        Ok(ScanStatus {
            cursor,
            state: self.state().await,
            accounts_checked: if cursor > 0 {
                self.accounts.count_up_to(cursor).await?
            } else {
                0
            },
            accounts_remaining: self.accounts.count_after(cursor).await?,
            last_checked,
        })
    }
}
