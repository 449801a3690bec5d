//! HTTP API endpoints for the spam gate
//!
//! Provides REST APIs for:
//! - Registration checks
//! - Scan status and operator controls
//! - Live config reload and account protection (admin)
//! - Security middleware (admin auth, size limits, headers)

pub mod gate;
pub mod middleware;

pub use gate::{CheckRequest, CheckResponse, GateApiState, create_gate_router};
pub use middleware::{
    admin_auth_middleware, body_size_middleware, get_client_ip, security_headers_middleware,
};
