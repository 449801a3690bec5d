//! Batch rescans of existing accounts
//!
//! `BatchScanner` walks accounts past a persisted cursor and applies the configured
//! remedial action to spammers; `PeriodicScan` drives it from a timer.

mod scanner;
mod schedule;
mod store;

pub use scanner::{
    BatchScanner, LookupFailurePolicy, RemedialAction, ScanError, ScanPolicy, ScanState,
    ScanStatus, ScanSummary,
};
pub use schedule::PeriodicScan;
pub use store::{
    Account, AccountStore, CursorStore, InMemoryAccountStore, InMemoryCursorStore, StoreError,
};
