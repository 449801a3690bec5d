//! Gate and Scan API Endpoints
//!
//! `POST /gate/check` is called by the host application for every registration
//! attempt. The scan endpoints expose progress and operator controls; the config and
//! account endpoints are operator-only.

use axum::{
    Json, Router,
    extract::{ConnectInfo, Path, State},
    http::{HeaderMap, StatusCode},
    middleware,
    routing::{get, post, put},
};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::api::middleware::{admin_auth_middleware, get_client_ip};
use crate::config::{SettingsHandle, SpamGateConfig};
use crate::gate::{GateDecisionEngine, Trigger, Verdict};
use crate::identity::IdentityTriple;
use crate::reload::{ConfigReloader, ReloadOutcome};
use crate::scan::{AccountStore, BatchScanner, ScanError, ScanStatus, ScanSummary, StoreError};

/// API state for gate and scan endpoints
#[derive(Clone)]
pub struct GateApiState {
    pub engine: Arc<GateDecisionEngine>,
    pub scanner: Arc<BatchScanner>,
    pub settings: Arc<SettingsHandle>,
    pub reloader: Arc<ConfigReloader>,
    pub accounts: Arc<dyn AccountStore>,
    /// Cancelled on shutdown, cutting pending delays short
    pub shutdown: CancellationToken,
}

#[derive(Debug, Deserialize)]
pub struct CheckRequest {
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub username: Option<String>,
    /// Falls back to the forwarding headers, then the peer address
    #[serde(default)]
    pub ip_address: Option<String>,
    /// Existing account making the request; its address is recorded for rescans
    #[serde(default)]
    pub account_id: Option<u64>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct CheckResponse {
    pub verdict: String,
    pub allowed: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delay_secs: Option<u64>,
    pub triggers: Vec<Trigger>,
    /// Rendered blocked message for the first triggering field
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ScanStatusResponse {
    #[serde(flatten)]
    pub status: ScanStatus,
    pub summary: String,
}

#[derive(Debug, Deserialize)]
pub struct ResetCursorRequest {
    pub cursor: u64,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ResetCursorResponse {
    pub previous: u64,
    pub cursor: u64,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ProtectionRequest {
    pub protected: bool,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ProtectionResponse {
    pub id: u64,
    pub protected: bool,
}

// Endpoints

/// POST /gate/check - Decide on a registration attempt
pub async fn check_identity(
    State(state): State<GateApiState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    Json(payload): Json<CheckRequest>,
) -> Json<CheckResponse> {
    let ip_address = payload
        .ip_address
        .filter(|ip| !ip.trim().is_empty())
        .or_else(|| get_client_ip(&headers, Some(&addr)));

    let identity = IdentityTriple::new(
        payload.email.as_deref(),
        payload.username.as_deref(),
        ip_address.as_deref(),
    );

    let snapshot = state.settings.current();
    let settings = &snapshot.settings;
    let verdict = state
        .engine
        .check(
            &identity,
            &settings.criteria,
            &settings.whitelist,
            &settings.gate,
            &state.shutdown,
        )
        .await;

    if let (Some(id), Some(ip)) = (payload.account_id, identity.ip_address.as_deref()) {
        match state.accounts.record_ip(id, ip).await {
            Ok(()) => {}
            Err(StoreError::NotFound(_)) => debug!(account = id, "No account to record IP for"),
            Err(e) => warn!(account = id, error = %e, "Failed to record account IP"),
        }
    }

    let message = verdict
        .primary_field()
        .map(|field| settings.messages.render(field, &identity));

    Json(CheckResponse {
        verdict: verdict.label().to_string(),
        allowed: verdict.is_allowed(),
        delay_secs: match &verdict {
            Verdict::Delayed { duration, .. } => Some(duration.as_secs()),
            _ => None,
        },
        triggers: verdict.triggers().to_vec(),
        message,
    })
}

/// GET /scan/status - Scan progress
pub async fn scan_status(
    State(state): State<GateApiState>,
) -> Result<Json<ScanStatusResponse>, (StatusCode, String)> {
    let status = state.scanner.status().await.map_err(|e| {
        error!("Failed to read scan status: {}", e);
        (StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
    })?;

    let summary = format!(
        "Accounts checked: {}, Accounts remaining: {}",
        status.accounts_checked, status.accounts_remaining
    );
    Ok(Json(ScanStatusResponse { status, summary }))
}

/// POST /scan/run - Run one scan batch now (admin only)
pub async fn run_scan(
    State(state): State<GateApiState>,
) -> Result<Json<ScanSummary>, (StatusCode, String)> {
    state
        .scanner
        .run_once()
        .await
        .map(Json)
        .map_err(scan_error_response)
}

/// PUT /scan/cursor - Continue scanning after a different account id (admin only)
pub async fn reset_cursor(
    State(state): State<GateApiState>,
    Json(payload): Json<ResetCursorRequest>,
) -> Result<Json<ResetCursorResponse>, (StatusCode, String)> {
    let previous = state
        .scanner
        .reset_cursor(payload.cursor)
        .await
        .map_err(scan_error_response)?;

    Ok(Json(ResetCursorResponse {
        previous,
        cursor: payload.cursor,
    }))
}

/// PUT /config - Replace the running configuration (admin only)
pub async fn apply_config(
    State(state): State<GateApiState>,
    Json(config): Json<SpamGateConfig>,
) -> Result<Json<ReloadOutcome>, (StatusCode, String)> {
    state.reloader.apply(config).await.map(Json).map_err(|e| {
        warn!(error = %e, "Configuration update rejected");
        (StatusCode::UNPROCESSABLE_ENTITY, e.to_string())
    })
}

/// POST /config/rollback - Reinstate the previous configuration (admin only)
pub async fn rollback_config(
    State(state): State<GateApiState>,
) -> Result<Json<ReloadOutcome>, (StatusCode, String)> {
    state.reloader.rollback().await.map(Json).map_err(|e| {
        error!("Configuration rollback failed: {}", e);
        (StatusCode::UNPROCESSABLE_ENTITY, e.to_string())
    })
}

/// PUT /accounts/{id}/protection - Exempt an account from scan actions, or lift it (admin only)
pub async fn set_protection(
    State(state): State<GateApiState>,
    Path(id): Path<u64>,
    Json(payload): Json<ProtectionRequest>,
) -> Result<Json<ProtectionResponse>, (StatusCode, String)> {
    match state.accounts.set_protected(id, payload.protected).await {
        Ok(()) => {
            info!(account = id, protected = payload.protected, "Account protection changed");
            Ok(Json(ProtectionResponse {
                id,
                protected: payload.protected,
            }))
        }
        Err(e @ StoreError::NotFound(_)) => Err((StatusCode::NOT_FOUND, e.to_string())),
        Err(e) => {
            error!("Failed to change account protection: {}", e);
            Err((StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))
        }
    }
}

fn scan_error_response(err: ScanError) -> (StatusCode, String) {
    match err {
        ScanError::AlreadyRunning => (StatusCode::CONFLICT, err.to_string()),
        ScanError::Store(_) => {
            error!("Scan request failed: {}", err);
            (StatusCode::INTERNAL_SERVER_ERROR, err.to_string())
        }
    }
}

/// Create the gate and scan API router
pub fn create_gate_router(state: GateApiState) -> Router {
    let admin = Router::new()
        .route("/scan/run", post(run_scan))
        .route("/scan/cursor", put(reset_cursor))
        .route("/config", put(apply_config))
        .route("/config/rollback", post(rollback_config))
        .route("/accounts/{id}/protection", put(set_protection))
        .route_layer(middleware::from_fn_with_state(
            state.settings.clone(),
            admin_auth_middleware,
        ));

    Router::new()
        .route("/gate/check", post(check_identity))
        .route("/scan/status", get(scan_status))
        .merge(admin)
        .with_state(state)
}
