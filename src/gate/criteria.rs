//! Spam criteria, whitelists and verdicts
//!
//! A field is flagged when its report count reaches the configured threshold.
//! Threshold 0 switches the field off entirely; whitelisted values are never flagged.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::net::IpAddr;
use std::time::Duration;

use crate::config::ConfigError;
use crate::identity::{Field, IdentityTriple};
use crate::reputation::ReputationReport;

/// Per-field report thresholds, 0 = field not used as a criterion
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Criteria {
    pub email: u32,
    pub username: u32,
    pub ip: u32,
}

impl Criteria {
    pub fn new(email: u32, username: u32, ip: u32) -> Self {
        Self {
            email,
            username,
            ip,
        }
    }

    pub fn threshold(&self, field: Field) -> u32 {
        match field {
            Field::Email => self.email,
            Field::Username => self.username,
            Field::Ip => self.ip,
        }
    }

    pub fn is_enabled(&self, field: Field) -> bool {
        self.threshold(field) > 0
    }

    /// Inclusive: "reported N or more times"
    pub fn is_exceeded(&self, field: Field, reports: u32) -> bool {
        let threshold = self.threshold(field);
        threshold > 0 && reports >= threshold
    }
}

/// Values that are never treated as spam, normalized when loaded
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Whitelist {
    emails: HashSet<String>,
    usernames: HashSet<String>,
    ips: HashSet<String>,
}

impl Whitelist {
    /// Parse the three text blocks, one entry per line. Blank lines are ignored.
    pub fn parse(emails: &str, usernames: &str, ips: &str) -> Result<Self, ConfigError> {
        let mut whitelist = Self::default();

        for (line, entry) in entries(emails) {
            if !looks_like_email(entry) {
                return Err(ConfigError::InvalidWhitelistEntry {
                    list: Field::Email,
                    line,
                    entry: entry.to_string(),
                });
            }
            whitelist.emails.insert(entry.to_lowercase());
        }

        for (_, entry) in entries(usernames) {
            whitelist.usernames.insert(entry.to_lowercase());
        }

        for (line, entry) in entries(ips) {
            let addr: IpAddr = entry.parse().map_err(|_| ConfigError::InvalidWhitelistEntry {
                list: Field::Ip,
                line,
                entry: entry.to_string(),
            })?;
            whitelist.ips.insert(addr.to_string());
        }

        Ok(whitelist)
    }

    pub fn contains(&self, field: Field, value: &str) -> bool {
        match field {
            Field::Email => self.emails.contains(&value.trim().to_lowercase()),
            Field::Username => self.usernames.contains(&value.trim().to_lowercase()),
            Field::Ip => match value.trim().parse::<IpAddr>() {
                Ok(addr) => self.ips.contains(&addr.to_string()),
                Err(_) => false,
            },
        }
    }

    pub fn len(&self) -> usize {
        self.emails.len() + self.usernames.len() + self.ips.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn entries(block: &str) -> impl Iterator<Item = (usize, &str)> {
    block
        .lines()
        .enumerate()
        .map(|(idx, line)| (idx + 1, line.trim()))
        .filter(|(_, line)| !line.is_empty())
}

fn looks_like_email(entry: &str) -> bool {
    match entry.split_once('@') {
        Some((local, domain)) => {
            !local.is_empty()
                && !domain.is_empty()
                && !domain.contains('@')
                && !entry.chars().any(char::is_whitespace)
        }
        None => false,
    }
}

/// What a flagged attempt receives
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Penalty {
    Block,
    /// Hold the attempt for the duration before refusing it
    Delay(Duration),
}

/// A field that met its threshold
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Trigger {
    pub field: Field,
    pub reports: u32,
    pub threshold: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    Allowed,
    Blocked { triggers: Vec<Trigger> },
    Delayed { duration: Duration, triggers: Vec<Trigger> },
}

impl Verdict {
    pub fn is_allowed(&self) -> bool {
        matches!(self, Verdict::Allowed)
    }

    /// Blocked and Delayed both mean the identity was judged a spammer
    pub fn is_spam(&self) -> bool {
        !self.is_allowed()
    }

    pub fn triggers(&self) -> &[Trigger] {
        match self {
            Verdict::Allowed => &[],
            Verdict::Blocked { triggers } | Verdict::Delayed { triggers, .. } => triggers,
        }
    }

    /// First triggering field in evaluation order
    pub fn primary_field(&self) -> Option<Field> {
        self.triggers().first().map(|t| t.field)
    }

    pub fn label(&self) -> &'static str {
        match self {
            Verdict::Allowed => "allowed",
            Verdict::Blocked { .. } => "blocked",
            Verdict::Delayed { .. } => "delayed",
        }
    }
}

/// Fields worth asking the reputation service about: present, enabled and not whitelisted
pub fn scored_fields(
    identity: &IdentityTriple,
    criteria: &Criteria,
    whitelist: &Whitelist,
) -> Vec<Field> {
    identity
        .present_fields()
        .filter(|field| criteria.is_enabled(*field))
        .filter(|field| {
            identity
                .get(*field)
                .is_some_and(|value| !whitelist.contains(*field, value))
        })
        .collect()
}

/// Apply thresholds and whitelist to a report
pub fn evaluate(
    report: &ReputationReport,
    criteria: &Criteria,
    whitelist: &Whitelist,
    identity: &IdentityTriple,
    penalty: Penalty,
) -> Verdict {
    let triggers: Vec<Trigger> = scored_fields(identity, criteria, whitelist)
        .into_iter()
        .filter(|field| criteria.is_exceeded(*field, report.count(*field)))
        .map(|field| Trigger {
            field,
            reports: report.count(field),
            threshold: criteria.threshold(field),
        })
        .collect();

    if triggers.is_empty() {
        return Verdict::Allowed;
    }

    match penalty {
        Penalty::Block => Verdict::Blocked { triggers },
        Penalty::Delay(duration) => Verdict::Delayed { duration, triggers },
    }
}
