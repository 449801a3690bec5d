//! Reputation client contract and its failure taxonomy.
//!
//! Implementations perform exactly one outbound call per invocation and never retry;
//! retry policy belongs to the gate.

use async_trait::async_trait;
use serde::Serialize;
use std::fmt;
use thiserror::Error;

use crate::identity::IdentityTriple;
use crate::reputation::{ReputationReport, SpamReport};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum LookupErrorKind {
    /// No answer within the configured timeout
    Timeout,
    /// Connection, DNS or server-side failure
    Unreachable,
    /// Answer received but not usable
    InvalidResponse,
    /// Local call budget exhausted or the service throttled us
    RateLimited,
}

impl LookupErrorKind {
    /// Worth a single retry after a short backoff
    pub fn is_transient(&self) -> bool {
        matches!(self, LookupErrorKind::Timeout | LookupErrorKind::Unreachable)
    }
}

impl fmt::Display for LookupErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            LookupErrorKind::Timeout => "timeout",
            LookupErrorKind::Unreachable => "unreachable",
            LookupErrorKind::InvalidResponse => "invalid response",
            LookupErrorKind::RateLimited => "rate limited",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("reputation lookup failed ({kind}): {message}")]
pub struct LookupError {
    pub kind: LookupErrorKind,
    pub message: String,
}

impl LookupError {
    pub fn new(kind: LookupErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(LookupErrorKind::Timeout, message)
    }

    pub fn unreachable(message: impl Into<String>) -> Self {
        Self::new(LookupErrorKind::Unreachable, message)
    }

    pub fn invalid_response(message: impl Into<String>) -> Self {
        Self::new(LookupErrorKind::InvalidResponse, message)
    }

    pub fn rate_limited(message: impl Into<String>) -> Self {
        Self::new(LookupErrorKind::RateLimited, message)
    }

    pub fn is_transient(&self) -> bool {
        self.kind.is_transient()
    }
}

/// Remote reputation service
///
/// Implementations must be `Send + Sync`; one instance is shared by every concurrent
/// gate check and by the batch scanner.
#[async_trait]
pub trait ReputationClient: Send + Sync {
    /// Look up report counts for every present field of the triple
    async fn lookup(&self, identity: &IdentityTriple) -> Result<ReputationReport, LookupError>;

    /// Submit a confirmed spammer back to the service
    async fn report(&self, report: &SpamReport) -> Result<(), LookupError>;
}
