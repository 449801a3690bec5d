//! Reputation reports returned by the remote service and spam reports sent back to it.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::identity::{Field, IdentityTriple};

/// How many times each identity attribute has been reported as abusive
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReputationReport {
    pub email_reports: u32,
    pub username_reports: u32,
    pub ip_reports: u32,

    /// When the remote service produced this report
    pub fetched_at: DateTime<Utc>,
}

impl ReputationReport {
    pub fn new(email_reports: u32, username_reports: u32, ip_reports: u32) -> Self {
        Self {
            email_reports,
            username_reports,
            ip_reports,
            fetched_at: Utc::now(),
        }
    }

    /// Report for a triple nobody has ever reported
    pub fn clean() -> Self {
        Self::new(0, 0, 0)
    }

    pub fn count(&self, field: Field) -> u32 {
        match field {
            Field::Email => self.email_reports,
            Field::Username => self.username_reports,
            Field::Ip => self.ip_reports,
        }
    }

    pub fn total(&self) -> u64 {
        self.email_reports as u64 + self.username_reports as u64 + self.ip_reports as u64
    }
}

/// A confirmed spammer submitted back to the reputation service
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SpamReport {
    pub identity: IdentityTriple,

    /// Free-form evidence text shown to the service's moderators
    pub evidence: String,
}

impl SpamReport {
    pub fn new(identity: IdentityTriple, evidence: impl Into<String>) -> Self {
        Self {
            identity,
            evidence: evidence.into(),
        }
    }
}
