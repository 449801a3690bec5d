//! SpamGate
//!
//! Reputation-based spam gating: refuses registrations from identities that an external
//! abuse-reporting service has seen too often, and rescans existing accounts in batches.
//!
//! ## Module Structure
//!
//! ```text
//! src/
//! ├── lib.rs         - Crate root with re-exports
//! ├── main.rs        - Server entrypoint
//! ├── config.rs      - Configuration loading, validation and hot replacement
//! ├── identity.rs    - Identity triples and normalization
//! ├── messages.rs    - Blocked message templates
//! ├── reload.rs      - Live configuration reload and rollback
//! ├── reputation/    - Remote lookups
//! │   ├── client.rs  - ReputationClient trait & lookup errors
//! │   ├── http.rs    - reqwest client for the Stop Forum Spam API
//! │   ├── limiter.rs - Per-endpoint call budget
//! │   ├── cache.rs   - TTL/LRU cache with in-flight coalescing
//! │   └── report.rs  - Per-field report counts
//! ├── gate/          - Registration gate
//! │   ├── criteria.rs - Thresholds, whitelists, verdicts
//! │   └── engine.rs   - GateDecisionEngine
//! ├── scan/          - Batch rescans of existing accounts
//! │   ├── scanner.rs  - BatchScanner state machine
//! │   ├── schedule.rs - PeriodicScan
//! │   └── store.rs    - AccountStore / CursorStore + in-memory stores
//! ├── api/           - HTTP API endpoints
//! │   ├── gate.rs       - /gate, /scan, /config and /accounts routes
//! │   └── middleware.rs - Admin auth, size limits, security headers
//! └── database/      - PostgreSQL persistence
//! ```

pub mod api;
pub mod config;
pub mod database;
pub mod gate;
pub mod identity;
pub mod messages;
pub mod reload;
pub mod reputation;
pub mod scan;

// Re-export main types for convenience
pub use config::{ConfigError, Settings, SettingsHandle, SpamGateConfig};
pub use database::DatabasePool;
pub use gate::{Criteria, GateDecisionEngine, GatePolicy, Verdict, Whitelist};
pub use identity::{Field, IdentityTriple};
pub use messages::BlockedMessages;
pub use reload::{ConfigReloader, ReloadError, ReloadOutcome};
pub use reputation::{
    HttpReputationClient, LookupError, LookupErrorKind, ReputationCache, ReputationClient,
    ReputationReport,
};
pub use scan::{
    AccountStore, BatchScanner, CursorStore, PeriodicScan, RemedialAction, ScanState,
    ScanSummary,
};
