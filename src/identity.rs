//! Identity triples submitted at registration/login or read back from stored accounts.
//!
//! Every value is normalized on construction so that cache keys, whitelist
//! membership and remote queries all agree on one canonical form.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::IpAddr;

/// One of the three scored identity attributes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Field {
    Email,
    Username,
    Ip,
}

impl Field {
    /// Fixed evaluation order; also the priority used when picking a blocked message
    pub const ALL: [Field; 3] = [Field::Email, Field::Username, Field::Ip];

    pub fn as_str(&self) -> &'static str {
        match self {
            Field::Email => "email",
            Field::Username => "username",
            Field::Ip => "ip",
        }
    }
}

impl fmt::Display for Field {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Email, username and IP of a single attempt. Absent fields are never scored.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct IdentityTriple {
    pub email: Option<String>,
    pub username: Option<String>,
    pub ip_address: Option<String>,
}

impl IdentityTriple {
    pub fn new(
        email: Option<&str>,
        username: Option<&str>,
        ip_address: Option<&str>,
    ) -> Self {
        Self {
            email: email.and_then(normalize_email),
            username: username.and_then(normalize_username),
            ip_address: ip_address.and_then(normalize_ip),
        }
    }

    pub fn with_email(mut self, email: &str) -> Self {
        self.email = normalize_email(email);
        self
    }

    pub fn with_username(mut self, username: &str) -> Self {
        self.username = normalize_username(username);
        self
    }

    pub fn with_ip(mut self, ip_address: &str) -> Self {
        self.ip_address = normalize_ip(ip_address);
        self
    }

    /// Re-applies normalization, for triples built by hand or deserialized from a request
    pub fn normalized(&self) -> Self {
        Self::new(
            self.email.as_deref(),
            self.username.as_deref(),
            self.ip_address.as_deref(),
        )
    }

    pub fn get(&self, field: Field) -> Option<&str> {
        match field {
            Field::Email => self.email.as_deref(),
            Field::Username => self.username.as_deref(),
            Field::Ip => self.ip_address.as_deref(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.email.is_none() && self.username.is_none() && self.ip_address.is_none()
    }

    /// Fields that carry a value, in evaluation order
    pub fn present_fields(&self) -> impl Iterator<Item = Field> + '_ {
        Field::ALL.into_iter().filter(|f| self.get(*f).is_some())
    }

    /// Case-folded key used by the reputation cache
    pub fn cache_key(&self) -> String {
        format!(
            "{}\u{1f}{}\u{1f}{}",
            self.email.as_deref().unwrap_or_default(),
            self.username
                .as_deref()
                .map(str::to_lowercase)
                .unwrap_or_default(),
            self.ip_address.as_deref().unwrap_or_default(),
        )
    }
}

impl fmt::Display for IdentityTriple {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "email={} username={} ip={}",
            self.email.as_deref().unwrap_or("-"),
            self.username.as_deref().unwrap_or("-"),
            self.ip_address.as_deref().unwrap_or("-"),
        )
    }
}

pub fn normalize_email(raw: &str) -> Option<String> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return None;
    }
    Some(trimmed.to_lowercase())
}

/// Usernames keep their case for display and remote queries; comparisons fold case.
pub fn normalize_username(raw: &str) -> Option<String> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return None;
    }
    Some(trimmed.to_string())
}

pub fn normalize_ip(raw: &str) -> Option<String> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return None;
    }
    match trimmed.parse::<IpAddr>() {
        Ok(addr) => Some(addr.to_string()),
        Err(_) => Some(trimmed.to_lowercase()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_blank_fields_are_absent() {
        let triple = IdentityTriple::new(Some("  "), Some(""), None);
        assert!(triple.is_empty());
        assert_eq!(triple.present_fields().count(), 0);
    }

    #[test]
    fn test_normalization() {
        let triple = IdentityTriple::new(
            Some(" Spammer@Example.COM "),
            Some(" BadBot "),
            Some(" 2001:DB8:0:0::1 "),
        );
        assert_eq!(triple.email.as_deref(), Some("spammer@example.com"));
        assert_eq!(triple.username.as_deref(), Some("BadBot"));
        assert_eq!(triple.ip_address.as_deref(), Some("2001:db8::1"));
    }

    #[test]
    fn test_cache_key_folds_username_case() {
        let a = IdentityTriple::default().with_username("Alice");
        let b = IdentityTriple::default().with_username("alice");
        assert_eq!(a.cache_key(), b.cache_key());

        let c = IdentityTriple::default().with_email("alice");
        assert_ne!(a.cache_key(), c.cache_key());
    }

    #[test]
    fn test_present_fields_order() {
        let triple = IdentityTriple::default()
            .with_ip("10.0.0.1")
            .with_email("a@b.c");
        let fields: Vec<_> = triple.present_fields().collect();
        assert_eq!(fields, vec![Field::Email, Field::Ip]);
    }
}
