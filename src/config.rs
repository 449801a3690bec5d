use arc_swap::ArcSwap;
use serde::{Deserialize, Serialize};
use std::env;
use std::fmt::Display;
use std::str::FromStr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use thiserror::Error;
use tracing::{info, warn};

use crate::gate::{Criteria, GatePolicy, MAX_DELAY, Whitelist};
use crate::identity::Field;
use crate::messages::BlockedMessages;
use crate::reputation::{CacheConfig, HttpClientConfig};
use crate::scan::{LookupFailurePolicy, RemedialAction, ScanPolicy};

const ENV_PREFIX: &str = "SPAMGATE_";

pub const DEFAULT_BLOCKED_MESSAGE: &str =
    "Your email address or username or IP address is blacklisted.";

/// Rejected configuration; the previously valid one stays in effect
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("missing required setting {key}")]
    Missing { key: String },

    #[error("invalid value for {key}: {value:?} ({reason})")]
    InvalidValue {
        key: String,
        value: String,
        reason: String,
    },

    #[error("registration delay of {secs}s exceeds the {max}s ceiling")]
    DelayTooLong { secs: u64, max: u64 },

    #[error("malformed {list} whitelist entry on line {line}: {entry:?}")]
    InvalidWhitelistEntry {
        list: Field,
        line: usize,
        entry: String,
    },

    #[error("invalid {setting}: {reason}")]
    Invalid { setting: &'static str, reason: String },
}

/// Configuration for the spam gate service
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SpamGateConfig {
    /// HTTP surface
    pub server: ServerConfig,
    /// Reputation service connection
    pub remote: RemoteConfig,
    /// Per-field report thresholds
    pub criteria: Criteria,
    /// Values never treated as spam
    pub whitelist: WhitelistConfig,
    /// Live gate behaviour
    pub registration: RegistrationConfig,
    /// Batch rescans of existing accounts
    pub scan: ScanConfig,
    /// Lookup cache
    pub cache: CacheSettings,
    /// Text shown to refused registrants
    pub messages: MessagesConfig,
    pub logging: LoggingConfig,
    pub database: DatabaseConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    /// Required by the admin routes; they refuse every request when unset
    pub admin_api_key: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteConfig {
    pub service_url: String,
    /// Only needed to report spammers back
    pub api_key: Option<String>,
    pub timeout_secs: u64,
    pub require_https: bool,
    pub max_concurrent_requests: usize,
    /// Outbound calls per minute per endpoint, 0 = unlimited
    pub calls_per_minute: u32,
    /// Report refused registrations back to the service
    pub report_spam: bool,
}

/// Raw text blocks, one entry per line
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WhitelistConfig {
    pub emails: String,
    pub usernames: String,
    pub ips: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegistrationConfig {
    pub protect: bool,
    /// Tarpit for refused registrations, 0-30
    pub delay_secs: u64,
    pub retry_backoff_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScanConfig {
    /// Accounts examined per run, 0 disables scanning
    pub user_limit: usize,
    pub include_blocked: bool,
    pub action: RemedialAction,
    /// Seconds between scheduled runs
    pub interval_secs: u64,
    pub failure_policy: LookupFailurePolicy,
    /// Lookups in flight within one run
    pub pipeline_width: usize,
    /// Starting point when no cursor has been persisted yet
    pub initial_cursor: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheSettings {
    pub ttl_secs: u64,
    pub capacity: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessagesConfig {
    pub email: String,
    pub username: String,
    pub ip: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level (error, warn, info, debug, trace)
    pub level: String,
    /// Warn on every refused registration
    pub log_blocked: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DatabaseConfig {
    pub postgres_url: String,
    /// If false, uses the in-memory fallback
    pub postgres_enabled: bool,
    pub max_connections: u32,
}

impl Default for SpamGateConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig {
                host: "127.0.0.1".to_string(),
                port: 8780,
                admin_api_key: None,
            },
            remote: RemoteConfig {
                service_url: "https://api.stopforumspam.org".to_string(),
                api_key: None,
                timeout_secs: 5,
                require_https: true,
                max_concurrent_requests: 8,
                calls_per_minute: 0,
                report_spam: false,
            },
            criteria: Criteria::new(1, 0, 20),
            whitelist: WhitelistConfig::default(),
            registration: RegistrationConfig {
                protect: true,
                delay_secs: 0,
                retry_backoff_ms: 250,
            },
            scan: ScanConfig {
                user_limit: 0,
                include_blocked: false,
                action: RemedialAction::None,
                interval_secs: 3600,
                failure_policy: LookupFailurePolicy::SkipAndAdvance,
                pipeline_width: 4,
                initial_cursor: 0,
            },
            cache: CacheSettings {
                ttl_secs: 3600,
                capacity: 10_000,
            },
            messages: MessagesConfig {
                email: DEFAULT_BLOCKED_MESSAGE.to_string(),
                username: DEFAULT_BLOCKED_MESSAGE.to_string(),
                ip: DEFAULT_BLOCKED_MESSAGE.to_string(),
            },
            logging: LoggingConfig {
                level: "info".to_string(),
                log_blocked: true,
            },
            database: DatabaseConfig {
                postgres_url: "postgresql://localhost:5432/spamgate".to_string(),
                postgres_enabled: false,
                max_connections: 5,
            },
        }
    }
}

impl SpamGateConfig {
    /// Load configuration from `SPAMGATE_*` environment variables and validate it
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Same as `from_env` with an arbitrary variable source
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let vars = EnvSource {
            lookup: &lookup,
        };
        let mut config = Self::default();

        // Server
        vars.set_string("HOST", &mut config.server.host);
        vars.set_parsed("PORT", &mut config.server.port)?;
        config.server.admin_api_key = vars.get("ADMIN_API_KEY");

        // Reputation service
        vars.set_string("SERVICE_URL", &mut config.remote.service_url);
        config.remote.api_key = vars.get("API_KEY");
        vars.set_parsed("TIMEOUT_SECS", &mut config.remote.timeout_secs)?;
        vars.set_parsed("REQUIRE_HTTPS", &mut config.remote.require_https)?;
        vars.set_parsed(
            "MAX_CONCURRENT_REQUESTS",
            &mut config.remote.max_concurrent_requests,
        )?;
        vars.set_parsed("CALLS_PER_MINUTE", &mut config.remote.calls_per_minute)?;
        vars.set_parsed("REPORT_SPAM", &mut config.remote.report_spam)?;

        // Criteria
        vars.set_parsed("EMAIL_THRESHOLD", &mut config.criteria.email)?;
        vars.set_parsed("USERNAME_THRESHOLD", &mut config.criteria.username)?;
        vars.set_parsed("IP_THRESHOLD", &mut config.criteria.ip)?;

        // Whitelists, newline or comma separated
        vars.set_list("WHITELIST_EMAILS", &mut config.whitelist.emails);
        vars.set_list("WHITELIST_USERNAMES", &mut config.whitelist.usernames);
        vars.set_list("WHITELIST_IPS", &mut config.whitelist.ips);

        // Registration
        vars.set_parsed("PROTECT_REGISTRATION", &mut config.registration.protect)?;
        vars.set_parsed("BLACKLISTED_DELAY", &mut config.registration.delay_secs)?;
        vars.set_parsed("RETRY_BACKOFF_MS", &mut config.registration.retry_backoff_ms)?;

        // Scan
        vars.set_parsed("CRON_USER_LIMIT", &mut config.scan.user_limit)?;
        vars.set_parsed("CHECK_BLOCKED_ACCOUNTS", &mut config.scan.include_blocked)?;
        vars.set_parsed("SPAM_ACCOUNT_ACTION", &mut config.scan.action)?;
        vars.set_parsed("SCAN_INTERVAL_SECS", &mut config.scan.interval_secs)?;
        vars.set_parsed("SCAN_FAILURE_POLICY", &mut config.scan.failure_policy)?;
        vars.set_parsed("SCAN_PIPELINE_WIDTH", &mut config.scan.pipeline_width)?;
        vars.set_parsed("LAST_UID", &mut config.scan.initial_cursor)?;

        // Cache
        vars.set_parsed("CACHE_TTL_SECS", &mut config.cache.ttl_secs)?;
        vars.set_parsed("CACHE_CAPACITY", &mut config.cache.capacity)?;

        // Messages
        vars.set_string("BLOCKED_MESSAGE_EMAIL", &mut config.messages.email);
        vars.set_string("BLOCKED_MESSAGE_USERNAME", &mut config.messages.username);
        vars.set_string("BLOCKED_MESSAGE_IP", &mut config.messages.ip);

        // Logging
        vars.set_string("LOG_LEVEL", &mut config.logging.level);
        vars.set_parsed("LOG_BLOCKED_REGISTRATIONS", &mut config.logging.log_blocked)?;

        // Database
        vars.set_string("POSTGRES_URL", &mut config.database.postgres_url);
        vars.set_parsed("POSTGRES_ENABLED", &mut config.database.postgres_enabled)?;
        vars.set_parsed(
            "POSTGRES_MAX_CONNECTIONS",
            &mut config.database.max_connections,
        )?;

        config.validate()?;
        Ok(config)
    }

    /// Validate configuration for consistency
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.server.host.is_empty() {
            return Err(invalid("server host", "cannot be empty"));
        }

        if self.server.port == 0 {
            return Err(invalid("server port", "must be non-zero"));
        }

        if self.remote.service_url.is_empty() {
            return Err(ConfigError::Missing {
                key: format!("{ENV_PREFIX}SERVICE_URL"),
            });
        }

        if self.remote.require_https && !self.remote.service_url.starts_with("https://") {
            return Err(invalid(
                "service URL",
                format!(
                    "HTTPS is required but service URL is not HTTPS: {}",
                    self.remote.service_url
                ),
            ));
        }

        if self.remote.timeout_secs == 0 {
            return Err(invalid("remote timeout", "must be at least one second"));
        }

        if self.remote.max_concurrent_requests == 0 {
            return Err(invalid("max concurrent requests", "must be non-zero"));
        }

        if self.remote.report_spam
            && self.remote.api_key.as_deref().is_none_or(str::is_empty)
        {
            return Err(ConfigError::Missing {
                key: format!("{ENV_PREFIX}API_KEY"),
            });
        }

        if self.registration.delay_secs > MAX_DELAY.as_secs() {
            return Err(ConfigError::DelayTooLong {
                secs: self.registration.delay_secs,
                max: MAX_DELAY.as_secs(),
            });
        }

        if self.scan.user_limit > 0 && self.scan.interval_secs == 0 {
            return Err(invalid("scan interval", "must be non-zero while scanning is enabled"));
        }

        if self.scan.pipeline_width == 0 {
            return Err(invalid("scan pipeline width", "must be non-zero"));
        }

        if self.database.postgres_enabled && self.database.postgres_url.is_empty() {
            return Err(ConfigError::Missing {
                key: format!("{ENV_PREFIX}POSTGRES_URL"),
            });
        }

        if let Some(key) = self.server.admin_api_key.as_deref()
            && key.len() < 16
        {
            return Err(invalid(
                "admin API key",
                "too short (minimum 16 characters)",
            ));
        }

        // Catches malformed entries at load time
        Whitelist::parse(
            &self.whitelist.emails,
            &self.whitelist.usernames,
            &self.whitelist.ips,
        )?;

        Ok(())
    }
}

fn invalid(setting: &'static str, reason: impl Into<String>) -> ConfigError {
    ConfigError::Invalid {
        setting,
        reason: reason.into(),
    }
}

struct EnvSource<'a, F: Fn(&str) -> Option<String>> {
    lookup: &'a F,
}

impl<F: Fn(&str) -> Option<String>> EnvSource<'_, F> {
    fn get(&self, name: &str) -> Option<String> {
        (self.lookup)(&format!("{ENV_PREFIX}{name}")).filter(|value| !value.trim().is_empty())
    }

    fn set_string(&self, name: &str, target: &mut String) {
        if let Some(value) = self.get(name) {
            *target = value;
        }
    }

    fn set_list(&self, name: &str, target: &mut String) {
        if let Some(value) = self.get(name) {
            *target = value.replace(',', "\n");
        }
    }

    fn set_parsed<T>(&self, name: &str, target: &mut T) -> Result<(), ConfigError>
    where
        T: FromStr,
        T::Err: Display,
    {
        if let Some(value) = self.get(name) {
            *target = value
                .trim()
                .parse()
                .map_err(|e: T::Err| ConfigError::InvalidValue {
                    key: format!("{ENV_PREFIX}{name}"),
                    value: value.clone(),
                    reason: e.to_string(),
                })?;
        }
        Ok(())
    }
}

/// Immutable runtime objects derived from a validated configuration
#[derive(Debug, Clone)]
pub struct Settings {
    pub criteria: Criteria,
    pub whitelist: Whitelist,
    pub gate: GatePolicy,
    pub scan: ScanPolicy,
    pub messages: BlockedMessages,
    pub client: HttpClientConfig,
    pub cache: CacheConfig,
}

impl Settings {
    pub fn compile(config: &SpamGateConfig) -> Result<Self, ConfigError> {
        config.validate()?;

        let whitelist = Whitelist::parse(
            &config.whitelist.emails,
            &config.whitelist.usernames,
            &config.whitelist.ips,
        )?;
        let retry_backoff = Duration::from_millis(config.registration.retry_backoff_ms);

        Ok(Self {
            criteria: config.criteria,
            whitelist,
            gate: GatePolicy {
                protect_registration: config.registration.protect,
                delay: Duration::from_secs(config.registration.delay_secs),
                retry_backoff,
                log_blocked: config.logging.log_blocked,
                report_spam: config.remote.report_spam,
            },
            scan: ScanPolicy {
                max_per_run: config.scan.user_limit,
                include_blocked: config.scan.include_blocked,
                action: config.scan.action,
                failure_policy: config.scan.failure_policy,
                pipeline_width: config.scan.pipeline_width,
                retry_backoff,
            },
            messages: BlockedMessages::new(
                &config.messages.email,
                &config.messages.username,
                &config.messages.ip,
            ),
            client: HttpClientConfig {
                service_url: config.remote.service_url.clone(),
                api_key: config.remote.api_key.clone(),
                timeout: Duration::from_secs(config.remote.timeout_secs),
                require_https: config.remote.require_https,
                max_concurrent_requests: config.remote.max_concurrent_requests,
                calls_per_minute: config.remote.calls_per_minute,
                ..HttpClientConfig::default()
            },
            cache: CacheConfig {
                ttl: Duration::from_secs(config.cache.ttl_secs),
                capacity: config.cache.capacity,
            },
        })
    }
}

/// A configuration together with what it compiled to
#[derive(Debug)]
pub struct SettingsSnapshot {
    pub version: u64,
    pub config: SpamGateConfig,
    pub settings: Settings,
}

/// Versioned, swappable settings shared by the gate, the scanner and the API.
///
/// Readers take a cheap `Arc` of the current snapshot and keep it for the duration of
/// one request or scan run, so a concurrent `replace` never changes settings mid-way.
pub struct SettingsHandle {
    current: ArcSwap<SettingsSnapshot>,
    last_known_good: ArcSwap<SettingsSnapshot>,
    versions: AtomicU64,
}

impl SettingsHandle {
    pub fn load(config: SpamGateConfig) -> Result<Self, ConfigError> {
        let settings = Settings::compile(&config)?;
        let initial = Arc::new(SettingsSnapshot {
            version: 1,
            config,
            settings,
        });
        Ok(Self {
            current: ArcSwap::from(initial.clone()),
            last_known_good: ArcSwap::from(initial),
            versions: AtomicU64::new(1),
        })
    }

    pub fn current(&self) -> Arc<SettingsSnapshot> {
        self.current.load_full()
    }

    pub fn version(&self) -> u64 {
        self.current.load().version
    }

    /// Snapshot `rollback` would reinstate
    pub fn last_known_good(&self) -> Arc<SettingsSnapshot> {
        self.last_known_good.load_full()
    }

    /// Install a new configuration; an invalid one leaves the current snapshot untouched
    pub fn replace(&self, config: SpamGateConfig) -> Result<u64, ConfigError> {
        let settings = match Settings::compile(&config) {
            Ok(settings) => settings,
            Err(err) => {
                warn!(error = %err, version = self.version(), "Rejected configuration update");
                return Err(err);
            }
        };

        let version = self.versions.fetch_add(1, Ordering::SeqCst) + 1;
        let previous = self.current.swap(Arc::new(SettingsSnapshot {
            version,
            config,
            settings,
        }));
        self.last_known_good.store(previous);

        info!(version, "Configuration updated");
        Ok(version)
    }

    /// Reinstate the snapshot that was current before the last `replace`
    pub fn rollback(&self) -> u64 {
        let snapshot = self.last_known_good.load_full();
        let version = snapshot.version;
        self.current.store(snapshot);
        warn!(version, "Configuration rolled back");
        version
    }
}

/// Sanitize sensitive data for logging
pub fn sanitize_for_logging(data: &str) -> String {
    let chars: Vec<char> = data.chars().collect();
    if chars.len() <= 8 {
        return "***".to_string();
    }
    let head: String = chars[..4].iter().collect();
    let tail: String = chars[chars.len() - 4..].iter().collect();
    format!("{head}***{tail}")
}
