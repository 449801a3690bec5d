//! Security Middleware for the spam gate API
//!
//! Provides:
//! - Admin API key authentication
//! - Request size limits
//! - Security headers
//! - Client IP extraction behind reverse proxies

use axum::{
    extract::{Request, State},
    http::{HeaderMap, HeaderValue, StatusCode, header},
    middleware::Next,
    response::Response,
};
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use tracing::{debug, warn};

use crate::config::SettingsHandle;

/// Maximum accepted request body, gate checks are tiny
pub const MAX_REQUEST_SIZE: usize = 16 * 1024;

/// Extract client IP from request headers, falling back to the socket address
pub fn get_client_ip(headers: &HeaderMap, addr: Option<&SocketAddr>) -> Option<String> {
    // Check X-Forwarded-For header (from reverse proxy), first entry is the client
    if let Some(forwarded) = headers.get("x-forwarded-for")
        && let Ok(value) = forwarded.to_str()
        && let Some(ip) = value.split(',').next().and_then(parse_ip)
    {
        return Some(ip);
    }

    if let Some(real_ip) = headers.get("x-real-ip")
        && let Ok(value) = real_ip.to_str()
        && let Some(ip) = parse_ip(value)
    {
        return Some(ip);
    }

    addr.map(|a| a.ip().to_string())
}

fn parse_ip(raw: &str) -> Option<String> {
    raw.trim().parse::<IpAddr>().ok().map(|ip| ip.to_string())
}

fn presented_key(headers: &HeaderMap) -> Option<&str> {
    headers
        .get("x-api-key")
        .or_else(|| headers.get("authorization"))
        .and_then(|v| v.to_str().ok())
        .map(|s| s.trim_start_matches("Bearer ").trim())
}

/// Admin authentication middleware; the key is read per request so reloads apply
pub async fn admin_auth_middleware(
    State(settings): State<Arc<SettingsHandle>>,
    headers: HeaderMap,
    request: Request,
    next: Next,
) -> Result<Response, StatusCode> {
    let path = request.uri().path().to_string();
    let snapshot = settings.current();

    let Some(admin_key) = snapshot.config.server.admin_api_key.as_deref() else {
        warn!("Admin request to {} refused, no admin API key configured", path);
        return Err(StatusCode::FORBIDDEN);
    };

    match presented_key(&headers) {
        Some(key) if key == admin_key => {
            debug!("Admin key authenticated for path: {}", path);
            Ok(next.run(request).await)
        }
        Some(_) => {
            warn!("Invalid admin API key attempt for path: {}", path);
            Err(StatusCode::UNAUTHORIZED)
        }
        None => {
            warn!("Missing admin API key for path: {}", path);
            Err(StatusCode::UNAUTHORIZED)
        }
    }
}

/// Rejects requests that declare a body larger than [`MAX_REQUEST_SIZE`]
pub async fn body_size_middleware(request: Request, next: Next) -> Result<Response, StatusCode> {
    let declared = request
        .headers()
        .get(header::CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse::<usize>().ok());

    if let Some(length) = declared
        && length > MAX_REQUEST_SIZE
    {
        warn!(length, max = MAX_REQUEST_SIZE, "Rejected oversized request body");
        return Err(StatusCode::PAYLOAD_TOO_LARGE);
    }

    Ok(next.run(request).await)
}

/// Headers attached to every response. Nothing here is rendered in a browser and
/// verdicts depend on live reputation data, so nothing may be framed or cached.
const SECURITY_HEADERS: [(&str, &str); 6] = [
    ("x-frame-options", "DENY"),
    ("x-content-type-options", "nosniff"),
    ("strict-transport-security", "max-age=31536000; includeSubDomains"),
    ("content-security-policy", "default-src 'none'; frame-ancestors 'none'"),
    ("referrer-policy", "no-referrer"),
    ("cache-control", "no-store"),
];

pub async fn security_headers_middleware(request: Request, next: Next) -> Response {
    let mut response = next.run(request).await;
    let headers = response.headers_mut();

    for (name, value) in SECURITY_HEADERS {
        headers.insert(name, HeaderValue::from_static(value));
    }
    headers.remove(header::SERVER);

    response
}
