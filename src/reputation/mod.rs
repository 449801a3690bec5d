//! Remote Reputation Lookups
//!
//! Counts how often an email, username or IP has been reported as abusive by an
//! external service, and keeps call volume to that service bounded.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────┐     ┌──────────────────┐     ┌──────────────────────┐
//! │ ReputationCache  │────►│ ReputationClient │◄────│ HttpReputationClient │
//! │ (TTL + LRU,      │     │ (trait)          │     │ (reqwest, semaphore, │
//! │  coalescing)     │     └──────────────────┘     │  CallLimiter)        │
//! └──────────────────┘                              └──────────────────────┘
//! ```
//!
//! Clients never retry; the gate decides whether a failure is worth a second attempt.

mod cache;
mod client;
mod http;
mod limiter;
mod report;

pub use cache::{CacheConfig, CacheStats, ReputationCache};
pub use client::{LookupError, LookupErrorKind, ReputationClient};
pub use http::{HttpClientConfig, HttpReputationClient, parse_lookup_response};
pub use limiter::CallLimiter;
pub use report::{ReputationReport, SpamReport};
