//! HTTP reputation client
//!
//! Speaks the Stop Forum Spam style API: a JSON lookup keyed by email, username and IP,
//! and a form submission endpoint for reporting confirmed spammers.

use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tracing::{debug, info, warn};
use url::Url;

use crate::identity::IdentityTriple;
use crate::reputation::{
    CallLimiter, LookupError, ReputationClient, ReputationReport, SpamReport,
};

const LOOKUP_ENDPOINT: &str = "lookup";
const REPORT_ENDPOINT: &str = "report";

/// Connection and budget settings for the reputation service
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpClientConfig {
    /// Base URL, lookups go to `{service_url}/api`, reports to `{service_url}/add.php`
    pub service_url: String,
    /// Required only for reporting spammers
    pub api_key: Option<String>,
    /// Per-request timeout
    pub timeout: Duration,
    /// Refuse plain HTTP service URLs
    pub require_https: bool,
    /// Maximum response size in bytes
    pub max_response_size: usize,
    /// Concurrent requests allowed against the service
    pub max_concurrent_requests: usize,
    /// Outbound calls per minute per endpoint, 0 = unlimited
    pub calls_per_minute: u32,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            service_url: "https://api.stopforumspam.org".to_string(),
            api_key: None,
            timeout: Duration::from_secs(5),
            require_https: true,
            max_response_size: 64 * 1024,
            max_concurrent_requests: 8,
            calls_per_minute: 0,
        }
    }
}

/// Reputation client backed by reqwest
pub struct HttpReputationClient {
    client: Client,
    lookup_url: Url,
    report_url: Url,
    config: HttpClientConfig,
    permits: Arc<Semaphore>,
    limiter: CallLimiter,
}

impl HttpReputationClient {
    pub fn new(config: HttpClientConfig) -> Result<Self> {
        let base = validate_service_url(&config.service_url, config.require_https)?;
        let lookup_url = base.join("api").context("Invalid lookup URL")?;
        let report_url = base.join("add.php").context("Invalid report URL")?;

        let mut client_builder = Client::builder()
            .timeout(config.timeout)
            .user_agent(concat!("spamgate/", env!("CARGO_PKG_VERSION")));

        if config.require_https {
            client_builder = client_builder.https_only(true);
            info!("HTTPS enforcement enabled for reputation service calls");
        }

        let client = client_builder
            .build()
            .context("Failed to create reputation HTTP client")?;

        Ok(Self {
            client,
            lookup_url,
            report_url,
            permits: Arc::new(Semaphore::new(config.max_concurrent_requests.max(1))),
            limiter: CallLimiter::new(config.calls_per_minute),
            config,
        })
    }

    pub fn config(&self) -> &HttpClientConfig {
        &self.config
    }

    fn acquire_budget(&self, endpoint: &'static str) -> Result<(), LookupError> {
        self.limiter.try_acquire(endpoint).map_err(|reset_after| {
            LookupError::rate_limited(format!(
                "{} budget of {}/min spent, resets in {}s",
                endpoint,
                self.config.calls_per_minute,
                reset_after.as_secs()
            ))
        })
    }

    async fn read_body(&self, mut response: reqwest::Response) -> Result<String, LookupError> {
        let status = response.status();
        if status == StatusCode::TOO_MANY_REQUESTS {
            return Err(LookupError::rate_limited("service answered 429"));
        }
        if status.is_server_error() {
            return Err(LookupError::unreachable(format!(
                "service answered {}",
                status.as_u16()
            )));
        }
        if !status.is_success() {
            return Err(LookupError::invalid_response(format!(
                "service answered {}: {}",
                status.as_u16(),
                status.canonical_reason().unwrap_or("Unknown")
            )));
        }

        let max = self.config.max_response_size;
        let declared = response.content_length().unwrap_or(0);
        if declared > max as u64 {
            return Err(LookupError::invalid_response(format!(
                "response too large: {} bytes (max: {})",
                declared, max
            )));
        }

        // Content-Length may be absent, so the cap is enforced while reading
        let mut body = Vec::with_capacity(declared as usize);
        while let Some(chunk) = response.chunk().await.map_err(classify_transport_error)? {
            if body.len() + chunk.len() > max {
                return Err(LookupError::invalid_response(format!(
                    "response body exceeds {} bytes",
                    max
                )));
            }
            body.extend_from_slice(&chunk);
        }

        String::from_utf8(body)
            .map_err(|e| LookupError::invalid_response(format!("response is not UTF-8: {}", e)))
    }
}

#[async_trait]
impl ReputationClient for HttpReputationClient {
    async fn lookup(&self, identity: &IdentityTriple) -> Result<ReputationReport, LookupError> {
        if identity.is_empty() {
            return Ok(ReputationReport::clean());
        }

        self.acquire_budget(LOOKUP_ENDPOINT)?;
        let _permit = self
            .permits
            .acquire()
            .await
            .map_err(|_| LookupError::unreachable("client is shutting down"))?;

        let mut query: Vec<(&str, &str)> = Vec::with_capacity(4);
        if let Some(email) = identity.email.as_deref() {
            query.push(("email", email));
        }
        if let Some(username) = identity.username.as_deref() {
            query.push(("username", username));
        }
        if let Some(ip) = identity.ip_address.as_deref() {
            query.push(("ip", ip));
        }
        query.push(("json", ""));

        debug!(identity = %identity, "Querying reputation service");

        let response = self
            .client
            .get(self.lookup_url.clone())
            .query(&query)
            .header("Accept", "application/json")
            .send()
            .await
            .map_err(classify_transport_error)?;

        let body = self.read_body(response).await?;
        parse_lookup_response(&body)
    }

    /// Fails with `Unreachable` when no API key is configured; the submission endpoint
    /// rejects anonymous reports.
    async fn report(&self, report: &SpamReport) -> Result<(), LookupError> {
        let api_key = match self.config.api_key.as_deref() {
            Some(key) if !key.is_empty() => key,
            _ => {
                return Err(LookupError::unreachable(
                    "reporting requires an API key",
                ));
            }
        };

        self.acquire_budget(REPORT_ENDPOINT)?;
        let _permit = self
            .permits
            .acquire()
            .await
            .map_err(|_| LookupError::unreachable("client is shutting down"))?;

        let identity = &report.identity;
        let form = [
            ("username", identity.username.as_deref().unwrap_or_default()),
            ("ip_addr", identity.ip_address.as_deref().unwrap_or_default()),
            ("email", identity.email.as_deref().unwrap_or_default()),
            ("api_key", api_key),
            ("evidence", report.evidence.as_str()),
        ];

        let response = self
            .client
            .post(self.report_url.clone())
            .form(&form)
            .send()
            .await
            .map_err(classify_transport_error)?;

        self.read_body(response).await?;
        info!(identity = %identity, "Reported spammer to reputation service");
        Ok(())
    }
}

fn validate_service_url(raw: &str, require_https: bool) -> Result<Url> {
    let mut url = Url::parse(raw).context("Invalid reputation service URL")?;

    if require_https && url.scheme() != "https" {
        return Err(anyhow::anyhow!(
            "HTTPS is required but reputation service URL uses {}: {}",
            url.scheme(),
            raw
        ));
    }

    if url.host_str().is_none() {
        return Err(anyhow::anyhow!(
            "Reputation service URL must have a host: {}",
            raw
        ));
    }

    if let Some(host) = url.host_str()
        && (host == "localhost" || host == "127.0.0.1")
    {
        warn!("Reputation service points at {} (test setups only)", host);
    }

    // Url::join replaces the last segment unless the path ends with a slash
    if !url.path().ends_with('/') {
        let path = format!("{}/", url.path());
        url.set_path(&path);
    }

    Ok(url)
}

fn classify_transport_error(err: reqwest::Error) -> LookupError {
    if err.is_timeout() {
        LookupError::timeout(err.to_string())
    } else if err.is_decode() || err.is_body() {
        LookupError::invalid_response(err.to_string())
    } else {
        LookupError::unreachable(err.to_string())
    }
}

#[derive(Debug, Deserialize)]
struct LookupResponse {
    #[serde(default)]
    success: u8,
    #[serde(default)]
    error: Option<String>,
    #[serde(default)]
    email: Option<FieldStats>,
    #[serde(default)]
    username: Option<FieldStats>,
    #[serde(default)]
    ip: Option<FieldStats>,
}

#[derive(Debug, Deserialize)]
struct FieldStats {
    #[serde(default)]
    frequency: u32,
}

/// Parse a lookup body; sections missing from a partial response count as zero reports.
pub fn parse_lookup_response(body: &str) -> Result<ReputationReport, LookupError> {
    let parsed: LookupResponse = serde_json::from_str(body)
        .map_err(|e| LookupError::invalid_response(format!("malformed payload: {}", e)))?;

    if parsed.success != 1 {
        return Err(LookupError::invalid_response(
            parsed
                .error
                .unwrap_or_else(|| "service reported failure".to_string()),
        ));
    }

    let frequency = |stats: Option<FieldStats>| stats.map(|s| s.frequency).unwrap_or(0);
    Ok(ReputationReport::new(
        frequency(parsed.email),
        frequency(parsed.username),
        frequency(parsed.ip),
    ))
}
