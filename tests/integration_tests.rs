//! Integration tests for SpamGate
//!
//! These tests drive the gate, the batch scanner and the HTTP API end to end
//! against a scripted reputation service and the in-memory stores.

use async_trait::async_trait;
use spamgate::gate::Trigger;
use spamgate::identity::Field;
use spamgate::reputation::SpamReport;
use spamgate::scan::{Account, InMemoryAccountStore, InMemoryCursorStore, LookupFailurePolicy};
use spamgate::{
    AccountStore, BatchScanner, GateDecisionEngine, IdentityTriple, LookupError, ReputationCache,
    ReputationClient, ReputationReport, ScanState, SettingsHandle, SpamGateConfig, Verdict,
};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

// ============================================================================
// Test Helpers
// ============================================================================

/// Reputation service double with scripted answers
#[derive(Default)]
struct ScriptedClient {
    calls: AtomicUsize,
    latency: Duration,
    /// Returned for every lookup when set
    fixed: Option<ReputationReport>,
    spam_emails: HashSet<String>,
    failing: Mutex<HashMap<String, LookupError>>,
    queries: Mutex<Vec<IdentityTriple>>,
    reports: Mutex<Vec<SpamReport>>,
}

impl ScriptedClient {
    fn new() -> Self {
        Self::default()
    }

    fn answering(report: ReputationReport) -> Self {
        Self {
            fixed: Some(report),
            ..Self::default()
        }
    }

    fn with_spam(mut self, emails: &[&str]) -> Self {
        self.spam_emails = emails.iter().map(|e| e.to_string()).collect();
        self
    }

    fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    fn fail(&self, email: &str, error: LookupError) {
        self.failing
            .lock()
            .unwrap()
            .insert(email.to_string(), error);
    }

    fn heal(&self) {
        self.failing.lock().unwrap().clear();
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    fn last_query(&self) -> Option<IdentityTriple> {
        self.queries.lock().unwrap().last().cloned()
    }
}

#[async_trait]
impl ReputationClient for ScriptedClient {
    async fn lookup(&self, identity: &IdentityTriple) -> Result<ReputationReport, LookupError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.queries.lock().unwrap().push(identity.clone());

        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }

        if let Some(report) = &self.fixed {
            return Ok(report.clone());
        }

        let email = identity.email.clone().unwrap_or_default();
        if let Some(error) = self.failing.lock().unwrap().get(&email) {
            return Err(error.clone());
        }
        if self.spam_emails.contains(&email) {
            return Ok(ReputationReport::new(10, 0, 0));
        }
        Ok(ReputationReport::clean())
    }

    async fn report(&self, report: &SpamReport) -> Result<(), LookupError> {
        self.reports.lock().unwrap().push(report.clone());
        Ok(())
    }
}

/// Config with fast retries and scanning enabled
fn test_config() -> SpamGateConfig {
    let mut config = SpamGateConfig::default();
    config.registration.retry_backoff_ms = 0;
    config.scan.user_limit = 10;
    config
}

fn engine_for(client: Arc<ScriptedClient>) -> Arc<GateDecisionEngine> {
    Arc::new(GateDecisionEngine::new(
        client,
        Arc::new(ReputationCache::default()),
    ))
}

fn account(id: u64) -> Account {
    Account {
        id,
        name: format!("user{id}"),
        email: Some(format!("user{id}@example.org")),
        last_ip: None,
        blocked: false,
    }
}

async fn store_with(ids: &[u64]) -> Arc<InMemoryAccountStore> {
    let store = Arc::new(InMemoryAccountStore::new());
    for id in ids {
        store.insert(account(*id)).await;
    }
    store
}

fn scanner_for(
    client: Arc<ScriptedClient>,
    store: Arc<InMemoryAccountStore>,
    cursors: Arc<InMemoryCursorStore>,
    config: SpamGateConfig,
) -> BatchScanner {
    BatchScanner::new(
        engine_for(client),
        store,
        cursors,
        Arc::new(SettingsHandle::load(config).unwrap()),
    )
}

/// Run a live gate check with the handle's current settings
async fn gate_check(
    engine: &GateDecisionEngine,
    settings: &SettingsHandle,
    identity: &IdentityTriple,
) -> Verdict {
    let snapshot = settings.current();
    let s = &snapshot.settings;
    engine
        .check(
            identity,
            &s.criteria,
            &s.whitelist,
            &s.gate,
            &CancellationToken::new(),
        )
        .await
}

// ============================================================================
// Registration Gate Tests
// ============================================================================

mod registration_gate {
    use super::*;
    use spamgate::Criteria;

    #[tokio::test]
    async fn test_reported_email_is_blocked_and_clean_one_allowed() {
        let client = Arc::new(ScriptedClient::new().with_spam(&["bot@spam.example"]));
        let engine = engine_for(client.clone());
        let settings = SettingsHandle::load(test_config()).unwrap();

        let verdict = gate_check(
            &engine,
            &settings,
            &IdentityTriple::new(Some(" Bot@Spam.Example "), Some("bot"), None),
        )
        .await;
        assert_eq!(
            verdict,
            Verdict::Blocked {
                triggers: vec![Trigger {
                    field: Field::Email,
                    reports: 10,
                    threshold: 1,
                }]
            }
        );

        let verdict = gate_check(
            &engine,
            &settings,
            &IdentityTriple::new(Some("alice@example.org"), Some("alice"), None),
        )
        .await;
        assert!(verdict.is_allowed());
    }

    #[tokio::test]
    async fn test_only_ip_exceeds_mixed_thresholds() {
        // username threshold 0 never triggers, even with 100 reports
        let client = Arc::new(ScriptedClient::answering(ReputationReport::new(4, 100, 3)));
        let engine = engine_for(client.clone());
        let mut config = test_config();
        config.criteria = Criteria::new(5, 0, 3);
        let settings = SettingsHandle::load(config).unwrap();

        let verdict = gate_check(
            &engine,
            &settings,
            &IdentityTriple::new(Some("a@example.org"), Some("someone"), Some("198.51.100.4")),
        )
        .await;

        assert_eq!(
            verdict.triggers(),
            &[Trigger {
                field: Field::Ip,
                reports: 3,
                threshold: 3,
            }]
        );
        assert!(matches!(verdict, Verdict::Blocked { .. }));

        let query = client.last_query().unwrap();
        assert_eq!(query.username, None, "disabled field should not be queried");
        assert_eq!(query.email.as_deref(), Some("a@example.org"));
    }

    #[tokio::test]
    async fn test_empty_triple_is_allowed_without_lookup() {
        let client = Arc::new(ScriptedClient::answering(ReputationReport::new(99, 99, 99)));
        let engine = engine_for(client.clone());
        let settings = SettingsHandle::load(test_config()).unwrap();

        let verdict = gate_check(
            &engine,
            &settings,
            &IdentityTriple::new(Some("  "), None, Some("")),
        )
        .await;

        assert!(verdict.is_allowed());
        assert_eq!(client.calls(), 0);
    }

    #[tokio::test]
    async fn test_all_thresholds_zero_never_looks_up() {
        let client = Arc::new(ScriptedClient::answering(ReputationReport::new(99, 99, 99)));
        let engine = engine_for(client.clone());
        let mut config = test_config();
        config.criteria = Criteria::new(0, 0, 0);
        let settings = SettingsHandle::load(config).unwrap();

        let verdict = gate_check(
            &engine,
            &settings,
            &IdentityTriple::new(Some("x@example.org"), Some("x"), Some("192.0.2.1")),
        )
        .await;

        assert!(verdict.is_allowed());
        assert_eq!(client.calls(), 0);
    }

    #[tokio::test]
    async fn test_whitelisted_email_is_never_scored() {
        let client = Arc::new(ScriptedClient::answering(ReputationReport::new(50, 0, 0)));
        let engine = engine_for(client.clone());
        let mut config = test_config();
        config.whitelist.emails = "friend@example.org\nother@example.org".to_string();
        let settings = SettingsHandle::load(config).unwrap();

        let verdict = gate_check(
            &engine,
            &settings,
            &IdentityTriple::new(Some("Friend@Example.org"), None, Some("192.0.2.7")),
        )
        .await;

        assert!(verdict.is_allowed());
        let query = client.last_query().unwrap();
        assert_eq!(query.email, None);
        assert_eq!(query.ip_address.as_deref(), Some("192.0.2.7"));
    }

    #[tokio::test]
    async fn test_unreachable_service_fails_open_after_one_retry() {
        let client = Arc::new(ScriptedClient::new());
        client.fail(
            "victim@example.org",
            LookupError::unreachable("connection refused"),
        );
        let engine = engine_for(client.clone());
        let settings = SettingsHandle::load(test_config()).unwrap();

        let verdict = gate_check(
            &engine,
            &settings,
            &IdentityTriple::new(Some("victim@example.org"), None, None),
        )
        .await;

        assert!(verdict.is_allowed());
        assert_eq!(client.calls(), 2);
    }

    #[tokio::test]
    async fn test_concurrent_checks_share_one_lookup() {
        let client = Arc::new(
            ScriptedClient::new()
                .with_spam(&["bot@spam.example"])
                .with_latency(Duration::from_millis(50)),
        );
        let engine = engine_for(client.clone());
        let settings = SettingsHandle::load(test_config()).unwrap();
        let identity = IdentityTriple::new(Some("bot@spam.example"), None, None);

        let checks = (0..10).map(|_| gate_check(&engine, &settings, &identity));
        let verdicts = futures::future::join_all(checks).await;

        assert!(verdicts.iter().all(Verdict::is_spam));
        assert_eq!(client.calls(), 1);

        // Served from cache afterwards
        gate_check(&engine, &settings, &identity).await;
        assert_eq!(client.calls(), 1);
        assert_eq!(engine.cache().len().await, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_configured_delay_holds_the_attempt() {
        let client = Arc::new(ScriptedClient::new().with_spam(&["bot@spam.example"]));
        let engine = engine_for(client.clone());
        let mut config = test_config();
        config.registration.delay_secs = 5;
        let settings = SettingsHandle::load(config).unwrap();

        let started = tokio::time::Instant::now();
        let verdict = gate_check(
            &engine,
            &settings,
            &IdentityTriple::new(Some("bot@spam.example"), None, None),
        )
        .await;

        assert_eq!(verdict.label(), "delayed");
        assert!(started.elapsed() >= Duration::from_secs(5));
    }

    #[tokio::test]
    async fn test_flagged_identity_is_reported_when_enabled() {
        let client = Arc::new(ScriptedClient::new().with_spam(&["bot@spam.example"]));
        let engine = engine_for(client.clone());
        let mut config = test_config();
        config.remote.api_key = Some("sfs-key".to_string());
        config.remote.report_spam = true;
        let settings = SettingsHandle::load(config).unwrap();

        gate_check(
            &engine,
            &settings,
            &IdentityTriple::new(Some("bot@spam.example"), Some("bot"), None),
        )
        .await;

        let reports = client.reports.lock().unwrap();
        assert_eq!(reports.len(), 1);
        assert_eq!(reports[0].identity.email.as_deref(), Some("bot@spam.example"));
    }

    #[tokio::test]
    async fn test_replaced_settings_apply_to_next_check() {
        let client = Arc::new(ScriptedClient::new().with_spam(&["bot@spam.example"]));
        let engine = engine_for(client.clone());
        let settings = SettingsHandle::load(test_config()).unwrap();
        let identity = IdentityTriple::new(Some("bot@spam.example"), None, None);

        assert!(gate_check(&engine, &settings, &identity).await.is_spam());

        let mut relaxed = test_config();
        relaxed.registration.protect = false;
        settings.replace(relaxed).unwrap();
        assert!(gate_check(&engine, &settings, &identity).await.is_allowed());

        settings.rollback();
        assert!(gate_check(&engine, &settings, &identity).await.is_spam());
    }
}

// ============================================================================
// Batch Scanner Tests
// ============================================================================

mod batch_scanning {
    use super::*;
    use spamgate::RemedialAction;
    use spamgate::scan::ScanError;

    #[tokio::test]
    async fn test_overlapping_runs_and_resets_are_refused() {
        let client = Arc::new(ScriptedClient::new().with_latency(Duration::from_millis(200)));
        let store = store_with(&[5, 6, 7]).await;
        let scanner = Arc::new(scanner_for(
            client,
            store,
            Arc::new(InMemoryCursorStore::new()),
            test_config(),
        ));

        let first = tokio::spawn({
            let scanner = scanner.clone();
            async move { scanner.run_once().await }
        });
        while scanner.state().await != ScanState::Scanning {
            tokio::task::yield_now().await;
        }

        assert!(matches!(
            scanner.run_once().await,
            Err(ScanError::AlreadyRunning)
        ));
        assert!(matches!(
            scanner.reset_cursor(0).await,
            Err(ScanError::AlreadyRunning)
        ));

        let summary = first.await.unwrap().unwrap();
        assert_eq!(summary.checked, 3);
        assert_eq!(summary.cursor_after, 7);
        // The refused reset left the cursor where the run put it
        assert_eq!(scanner.cursor().await.unwrap(), 7);
    }

    #[tokio::test]
    async fn test_recorded_ip_is_scored_on_rescan() {
        let client = Arc::new(ScriptedClient::new());
        let store = store_with(&[5]).await;
        store.record_ip(5, "198.51.100.23").await.unwrap();
        let scanner = scanner_for(
            client.clone(),
            store,
            Arc::new(InMemoryCursorStore::new()),
            test_config(),
        );

        scanner.run_once().await.unwrap();
        let query = client.last_query().unwrap();
        assert_eq!(query.email.as_deref(), Some("user5@example.org"));
        assert_eq!(query.ip_address.as_deref(), Some("198.51.100.23"));
    }

    #[tokio::test]
    async fn test_cursor_ends_at_last_examined_id() {
        let client = Arc::new(ScriptedClient::new());
        let store = store_with(&[5, 6, 7, 9]).await;
        let scanner = scanner_for(
            client.clone(),
            store.clone(),
            Arc::new(InMemoryCursorStore::new()),
            test_config(),
        );

        let summary = scanner.run_once().await.unwrap();
        assert_eq!(summary.checked, 4);
        assert_eq!(summary.cursor_before, 0);
        assert_eq!(summary.cursor_after, 9);
        assert_eq!(summary.state, ScanState::Exhausted);

        // An id at or below the cursor is never picked up
        store.insert(account(8)).await;
        let summary = scanner.run_once().await.unwrap();
        assert_eq!(summary.checked, 0);
        assert_eq!(summary.cursor_after, 9);
        assert_eq!(scanner.state().await, ScanState::Exhausted);
        assert_eq!(client.calls(), 4);

        store.insert(account(12)).await;
        let summary = scanner.run_once().await.unwrap();
        assert_eq!(summary.checked, 1);
        assert_eq!(summary.cursor_after, 12);
    }

    #[tokio::test]
    async fn test_restart_resumes_from_persisted_cursor() {
        let client = Arc::new(ScriptedClient::new());
        let store = store_with(&[5, 6, 7, 9]).await;
        let cursors = Arc::new(InMemoryCursorStore::new());
        let mut config = test_config();
        config.scan.user_limit = 2;

        let first = scanner_for(client.clone(), store.clone(), cursors.clone(), config.clone());
        let summary = first.run_once().await.unwrap();
        assert_eq!(summary.cursor_after, 6);
        assert_eq!(summary.state, ScanState::Idle);
        drop(first);

        let second = scanner_for(client.clone(), store, cursors, config);
        let summary = second.run_once().await.unwrap();
        assert_eq!(summary.cursor_before, 6);
        assert_eq!(summary.cursor_after, 9);
        // A full batch does not prove exhaustion
        assert_eq!(summary.state, ScanState::Idle);

        let summary = second.run_once().await.unwrap();
        assert_eq!(summary.checked, 0);
        assert_eq!(summary.state, ScanState::Exhausted);
        assert_eq!(client.calls(), 4);
    }

    #[tokio::test]
    async fn test_failed_lookup_is_skipped_and_cursor_advances() {
        let client = Arc::new(ScriptedClient::new());
        client.fail(
            "user7@example.org",
            LookupError::invalid_response("garbled body"),
        );
        let store = store_with(&[5, 6, 7, 9]).await;
        let scanner = scanner_for(
            client.clone(),
            store,
            Arc::new(InMemoryCursorStore::new()),
            test_config(),
        );

        let summary = scanner.run_once().await.unwrap();
        assert_eq!(summary.checked, 4);
        assert_eq!(summary.skipped, 1);
        assert_eq!(summary.cursor_after, 9);
    }

    #[tokio::test]
    async fn test_unreachable_service_is_retried_then_skipped() {
        let client = Arc::new(ScriptedClient::new());
        client.fail("user6@example.org", LookupError::unreachable("dns failure"));
        let store = store_with(&[5, 6, 7]).await;
        let scanner = scanner_for(
            client.clone(),
            store,
            Arc::new(InMemoryCursorStore::new()),
            test_config(),
        );

        let summary = scanner.run_once().await.unwrap();
        assert_eq!(summary.skipped, 1);
        assert_eq!(summary.cursor_after, 7);
        assert_eq!(client.calls(), 4);
    }

    #[tokio::test]
    async fn test_halt_policy_revisits_failed_account() {
        let client = Arc::new(ScriptedClient::new());
        client.fail("user7@example.org", LookupError::timeout("no answer"));
        let store = store_with(&[5, 6, 7, 9]).await;
        let mut config = test_config();
        config.scan.failure_policy = LookupFailurePolicy::HaltAndRevisit;
        let scanner = scanner_for(
            client.clone(),
            store,
            Arc::new(InMemoryCursorStore::new()),
            config,
        );

        let summary = scanner.run_once().await.unwrap();
        assert_eq!(summary.checked, 2);
        assert_eq!(summary.skipped, 1);
        assert_eq!(summary.cursor_after, 6);
        assert_eq!(summary.state, ScanState::Idle);

        client.heal();
        let summary = scanner.run_once().await.unwrap();
        assert_eq!(summary.cursor_before, 6);
        assert_eq!(summary.checked, 2);
        assert_eq!(summary.cursor_after, 9);
    }

    #[tokio::test]
    async fn test_block_action_skips_whitelisted_spammer() {
        let client = Arc::new(
            ScriptedClient::new().with_spam(&["user5@example.org", "user6@example.org"]),
        );
        let store = store_with(&[5, 6, 7]).await;
        let mut config = test_config();
        config.scan.action = RemedialAction::Block;
        config.whitelist.emails = "user6@example.org".to_string();
        let scanner = scanner_for(
            client,
            store.clone(),
            Arc::new(InMemoryCursorStore::new()),
            config,
        );

        let summary = scanner.run_once().await.unwrap();
        assert_eq!(summary.flagged, 1);
        assert_eq!(summary.actioned, 1);
        assert!(store.get(5).await.unwrap().blocked);
        assert!(!store.get(6).await.unwrap().blocked);
        assert!(!store.get(7).await.unwrap().blocked);
    }

    #[tokio::test]
    async fn test_status_counts_and_reset() {
        let client = Arc::new(ScriptedClient::new());
        let store = store_with(&[5, 6, 7, 9]).await;
        let mut config = test_config();
        config.scan.user_limit = 3;
        let scanner = scanner_for(client, store, Arc::new(InMemoryCursorStore::new()), config);

        scanner.run_once().await.unwrap();
        let status = scanner.status().await.unwrap();
        assert_eq!(status.cursor, 7);
        assert_eq!(status.accounts_checked, 3);
        assert_eq!(status.accounts_remaining, 1);
        assert_eq!(status.last_checked.map(|a| a.id), Some(7));

        assert_eq!(scanner.reset_cursor(0).await.unwrap(), 7);
        let status = scanner.status().await.unwrap();
        assert_eq!(status.accounts_checked, 0);
        assert_eq!(status.accounts_remaining, 4);
        assert_eq!(status.state, ScanState::Idle);
    }
}

// ============================================================================
// API Endpoint Tests
// ============================================================================

mod api_endpoints {
    use super::*;
    use axum::Router;
    use axum::body::Body;
    use axum::extract::connect_info::MockConnectInfo;
    use axum::http::{Request, StatusCode};
    use serde_json::{Value, json};
    use spamgate::ConfigReloader;
    use spamgate::api::{GateApiState, create_gate_router};
    use std::net::SocketAddr;
    use tower::ServiceExt;

    const ADMIN_KEY: &str = "admin-key-0123456789";

    struct TestApp {
        router: Router,
        scanner: Arc<BatchScanner>,
        store: Arc<InMemoryAccountStore>,
    }

    fn test_app(
        client: Arc<ScriptedClient>,
        store: Arc<InMemoryAccountStore>,
        config: SpamGateConfig,
    ) -> TestApp {
        let settings = Arc::new(SettingsHandle::load(config).unwrap());
        let engine = engine_for(client);
        let scanner = Arc::new(BatchScanner::new(
            engine.clone(),
            store.clone(),
            Arc::new(InMemoryCursorStore::new()),
            settings.clone(),
        ));
        let reloader = Arc::new(ConfigReloader::http(settings.clone(), engine.clone()));

        let router = create_gate_router(GateApiState {
            engine,
            scanner: scanner.clone(),
            settings,
            reloader,
            accounts: store.clone(),
            shutdown: CancellationToken::new(),
        })
        .layer(MockConnectInfo(SocketAddr::from(([203, 0, 113, 9], 4000))));

        TestApp {
            router,
            scanner,
            store,
        }
    }

    fn app(client: Arc<ScriptedClient>, config: SpamGateConfig) -> Router {
        test_app(client, Arc::new(InMemoryAccountStore::new()), config).router
    }

    fn admin_config() -> SpamGateConfig {
        let mut config = test_config();
        config.server.admin_api_key = Some(ADMIN_KEY.to_string());
        config
    }

    fn admin_request(method: &str, uri: &str, body: Option<Value>) -> Request<Body> {
        let builder = Request::builder()
            .method(method)
            .uri(uri)
            .header("x-api-key", ADMIN_KEY);
        match body {
            Some(body) => builder
                .header("content-type", "application/json")
                .body(Body::from(body.to_string()))
                .unwrap(),
            None => builder.body(Body::empty()).unwrap(),
        }
    }

    fn post_json(uri: &str, body: Value) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(uri)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    async fn body_json(response: axum::response::Response) -> Value {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn test_check_blocked_identity_returns_message() {
        let client = Arc::new(ScriptedClient::new().with_spam(&["bot@spam.example"]));
        let app = app(client, test_config());

        let response = app
            .oneshot(post_json(
                "/gate/check",
                json!({ "email": "bot@spam.example", "username": "bot" }),
            ))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body["verdict"], "blocked");
        assert_eq!(body["allowed"], false);
        assert_eq!(body["triggers"][0]["field"], "email");
        assert_eq!(
            body["message"],
            "Your email address or username or IP address is blacklisted."
        );
    }

    #[tokio::test]
    async fn test_check_uses_peer_address_when_ip_absent() {
        let client = Arc::new(ScriptedClient::new());
        let app = app(client.clone(), test_config());

        let response = app
            .oneshot(post_json("/gate/check", json!({ "email": "a@example.org" })))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body["allowed"], true);
        assert!(body.get("message").is_none());
        assert_eq!(
            client.last_query().unwrap().ip_address.as_deref(),
            Some("203.0.113.9")
        );
    }

    #[tokio::test]
    async fn test_scan_status_summary() {
        let app = app(Arc::new(ScriptedClient::new()), test_config());

        let response = app
            .oneshot(
                Request::builder()
                    .uri("/scan/status")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body["summary"], "Accounts checked: 0, Accounts remaining: 0");
        assert_eq!(body["state"], "idle");
    }

    #[tokio::test]
    async fn test_admin_routes_disabled_without_key() {
        let app = app(Arc::new(ScriptedClient::new()), test_config());

        let response = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/scan/run")
                    .header("x-api-key", ADMIN_KEY)
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::FORBIDDEN);
    }

    #[tokio::test]
    async fn test_admin_routes_require_matching_key() {
        let mut config = test_config();
        config.server.admin_api_key = Some(ADMIN_KEY.to_string());
        let app = app(Arc::new(ScriptedClient::new()), config);

        let response = app
            .clone()
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/scan/run")
                    .header("x-api-key", "wrong-key-wrong-key")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

        let response = app
            .clone()
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/scan/run")
                    .header("authorization", format!("Bearer {ADMIN_KEY}"))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body["state"], "exhausted");

        let response = app
            .oneshot(
                Request::builder()
                    .method("PUT")
                    .uri("/scan/cursor")
                    .header("x-api-key", ADMIN_KEY)
                    .header("content-type", "application/json")
                    .body(Body::from(json!({ "cursor": 40 }).to_string()))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body["previous"], 0);
        assert_eq!(body["cursor"], 40);
    }

    #[tokio::test]
    async fn test_scan_run_conflicts_with_running_scan() {
        let client = Arc::new(ScriptedClient::new().with_latency(Duration::from_millis(200)));
        let app = test_app(client, store_with(&[5, 6, 7]).await, admin_config());

        let first = tokio::spawn({
            let scanner = app.scanner.clone();
            async move { scanner.run_once().await }
        });
        while app.scanner.state().await != ScanState::Scanning {
            tokio::task::yield_now().await;
        }

        let response = app
            .router
            .clone()
            .oneshot(admin_request("POST", "/scan/run", None))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::CONFLICT);

        let response = app
            .router
            .clone()
            .oneshot(admin_request("PUT", "/scan/cursor", Some(json!({ "cursor": 0 }))))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::CONFLICT);

        assert_eq!(first.await.unwrap().unwrap().cursor_after, 7);
    }

    #[tokio::test]
    async fn test_check_records_ip_for_known_account() {
        let client = Arc::new(ScriptedClient::new());
        let app = test_app(client, store_with(&[5]).await, test_config());

        let response = app
            .router
            .clone()
            .oneshot(post_json(
                "/gate/check",
                json!({
                    "email": "user5@example.org",
                    "ip_address": " 198.51.100.23 ",
                    "account_id": 5
                }),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            app.store.get(5).await.unwrap().last_ip.as_deref(),
            Some("198.51.100.23")
        );

        // Unknown accounts do not fail the check
        let response = app
            .router
            .oneshot(post_json(
                "/gate/check",
                json!({ "email": "new@example.org", "account_id": 99 }),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_json(response).await["allowed"], true);
    }

    #[tokio::test]
    async fn test_protection_route() {
        let app = test_app(
            Arc::new(ScriptedClient::new()),
            store_with(&[5]).await,
            admin_config(),
        );

        let response = app
            .router
            .clone()
            .oneshot(admin_request(
                "PUT",
                "/accounts/5/protection",
                Some(json!({ "protected": true })),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body, json!({ "id": 5, "protected": true }));
        assert!(app.store.is_protected(5).await.unwrap());

        let response = app
            .router
            .clone()
            .oneshot(admin_request(
                "PUT",
                "/accounts/99/protection",
                Some(json!({ "protected": true })),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);

        // Admin-only like the scan controls
        let response = app
            .router
            .oneshot(
                Request::builder()
                    .method("PUT")
                    .uri("/accounts/5/protection")
                    .header("content-type", "application/json")
                    .body(Body::from(json!({ "protected": false }).to_string()))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        assert!(app.store.is_protected(5).await.unwrap());
    }

    #[tokio::test]
    async fn test_config_reload_and_rollback_routes() {
        let client = Arc::new(ScriptedClient::new().with_spam(&["bot@spam.example"]));
        let app = app(client, admin_config());
        let check = json!({ "email": "bot@spam.example" });

        let mut relaxed = admin_config();
        relaxed.registration.protect = false;
        relaxed.cache.capacity = 10;
        let response = app
            .clone()
            .oneshot(admin_request(
                "PUT",
                "/config",
                Some(serde_json::to_value(&relaxed).unwrap()),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body["version"], 2);
        assert_eq!(body["client_rebuilt"], false);
        assert_eq!(body["cache_reconfigured"], true);

        let response = app
            .clone()
            .oneshot(post_json("/gate/check", check.clone()))
            .await
            .unwrap();
        assert_eq!(body_json(response).await["allowed"], true);

        let mut moved = admin_config();
        moved.server.port = 9000;
        let response = app
            .clone()
            .oneshot(admin_request(
                "PUT",
                "/config",
                Some(serde_json::to_value(&moved).unwrap()),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNPROCESSABLE_ENTITY);

        let response = app
            .clone()
            .oneshot(admin_request("POST", "/config/rollback", None))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_json(response).await["version"], 1);

        let response = app
            .oneshot(post_json("/gate/check", check))
            .await
            .unwrap();
        assert_eq!(body_json(response).await["allowed"], false);
    }
}
