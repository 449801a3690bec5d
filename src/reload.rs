//! Live configuration reload
//!
//! Settings fall into two reload classes:
//! - boot-only: listen address, database, log level and scan interval, which are wired
//!   into tasks and sockets at startup and need a restart
//! - hot: everything else. A changed `remote` section rebuilds the reputation client
//!   before anything is committed, a changed `cache` section resizes the cache in place,
//!   and criteria, whitelists, policies and messages are picked up per request.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::config::{ConfigError, Settings, SettingsHandle, SpamGateConfig};
use crate::gate::GateDecisionEngine;
use crate::reputation::{HttpClientConfig, HttpReputationClient, ReputationClient};

/// Builds the reputation client for a remote configuration
pub type ClientFactory =
    Arc<dyn Fn(&HttpClientConfig) -> anyhow::Result<Arc<dyn ReputationClient>> + Send + Sync>;

#[derive(Debug, Error)]
pub enum ReloadError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("{section} settings only take effect after a restart")]
    BootOnly { section: &'static str },

    #[error("failed to build reputation client: {0}")]
    Client(String),
}

/// What a reload changed
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReloadOutcome {
    pub version: u64,
    pub client_rebuilt: bool,
    pub cache_reconfigured: bool,
}

pub struct ConfigReloader {
    settings: Arc<SettingsHandle>,
    engine: Arc<GateDecisionEngine>,
    build_client: ClientFactory,
    /// One reload at a time, so client and settings never come from different versions
    reloading: Mutex<()>,
}

impl ConfigReloader {
    pub fn new(
        settings: Arc<SettingsHandle>,
        engine: Arc<GateDecisionEngine>,
        build_client: ClientFactory,
    ) -> Self {
        Self {
            settings,
            engine,
            build_client,
            reloading: Mutex::new(()),
        }
    }

    /// Reloader that builds `HttpReputationClient`s
    pub fn http(settings: Arc<SettingsHandle>, engine: Arc<GateDecisionEngine>) -> Self {
        Self::new(
            settings,
            engine,
            Arc::new(|config: &HttpClientConfig| {
                let client: Arc<dyn ReputationClient> =
                    Arc::new(HttpReputationClient::new(config.clone())?);
                Ok(client)
            }),
        )
    }

    /// Validate and install a whole new configuration.
    ///
    /// Nothing changes unless every step succeeds: validation, the boot-only check and
    /// construction of a new client when the remote section changed.
    pub async fn apply(&self, config: SpamGateConfig) -> Result<ReloadOutcome, ReloadError> {
        let _reloading = self.reloading.lock().await;
        let current = self.settings.current();

        if let Some(section) = boot_only_change(&current.config, &config) {
            warn!(section, "Rejected configuration update touching boot-only settings");
            return Err(ReloadError::BootOnly { section });
        }

        let next = Settings::compile(&config)?;
        let client = self.client_for(&current.settings, &next)?;
        let version = self.settings.replace(config)?;

        Ok(self.activate(&current.settings, &next, client, version).await)
    }

    /// Reinstate the previous configuration, client and cache sizing included
    pub async fn rollback(&self) -> Result<ReloadOutcome, ReloadError> {
        let _reloading = self.reloading.lock().await;
        let current = self.settings.current();
        let target = self.settings.last_known_good();

        let client = self.client_for(&current.settings, &target.settings)?;
        let version = self.settings.rollback();

        Ok(self
            .activate(&current.settings, &target.settings, client, version)
            .await)
    }

    fn client_for(
        &self,
        current: &Settings,
        next: &Settings,
    ) -> Result<Option<Arc<dyn ReputationClient>>, ReloadError> {
        if current.client == next.client {
            return Ok(None);
        }
        (self.build_client)(&next.client)
            .map(Some)
            .map_err(|e| ReloadError::Client(format!("{:#}", e)))
    }

    async fn activate(
        &self,
        current: &Settings,
        next: &Settings,
        client: Option<Arc<dyn ReputationClient>>,
        version: u64,
    ) -> ReloadOutcome {
        let client_rebuilt = client.is_some();
        if let Some(client) = client {
            self.engine.swap_client(client);
        }

        let cache_reconfigured = current.cache != next.cache;
        if cache_reconfigured {
            self.engine.cache().reconfigure(next.cache.clone()).await;
        }

        info!(
            version,
            client_rebuilt, cache_reconfigured, "Configuration reload applied"
        );
        ReloadOutcome {
            version,
            client_rebuilt,
            cache_reconfigured,
        }
    }
}

/// First boot-only section that differs between the two configurations
fn boot_only_change(current: &SpamGateConfig, next: &SpamGateConfig) -> Option<&'static str> {
    if current.server.host != next.server.host || current.server.port != next.server.port {
        return Some("server");
    }
    if current.database != next.database {
        return Some("database");
    }
    if current.logging.level != next.logging.level {
        return Some("logging");
    }
    if current.scan.interval_secs != next.scan.interval_secs {
        return Some("scan interval");
    }
    None
}
