//! Registration Gate
//!
//! Decides whether an identity attempting to register may proceed.
//!
//! ```text
//! IdentityTriple ──► normalize ──► ReputationCache ──► evaluate ──► Verdict
//!                                    │ miss                 │
//!                                    ▼                      ▼ spam
//!                             ReputationClient       delay / log / report
//! ```

mod criteria;
mod engine;

pub use criteria::{Criteria, Penalty, Trigger, Verdict, Whitelist, evaluate, scored_fields};
pub use engine::{GateDecisionEngine, GatePolicy, MAX_DELAY};
