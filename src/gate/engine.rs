//! Gate Decision Engine
//!
//! Runs one registration/login attempt through lookup, evaluation and penalty.
//! The live gate fails open: if the reputation service cannot answer, the attempt is
//! allowed. The batch scanner shares `assess`, which surfaces lookup failures instead.

use arc_swap::ArcSwap;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::gate::criteria::{self, Criteria, Penalty, Verdict, Whitelist};
use crate::identity::{Field, IdentityTriple};
use crate::reputation::{
    LookupError, ReputationCache, ReputationClient, ReputationReport, SpamReport,
};

/// Hard ceiling on the tarpit delay
pub const MAX_DELAY: Duration = Duration::from_secs(30);

/// How the live gate treats flagged attempts
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GatePolicy {
    /// When off, every attempt is allowed without a lookup
    pub protect_registration: bool,
    /// Tarpit before refusing a flagged attempt, zero = refuse immediately
    pub delay: Duration,
    /// Wait before the single retry of a transient lookup failure
    pub retry_backoff: Duration,
    /// Emit a warning for every refused attempt
    pub log_blocked: bool,
    /// Submit refused attempts back to the reputation service
    pub report_spam: bool,
}

impl Default for GatePolicy {
    fn default() -> Self {
        Self {
            protect_registration: true,
            delay: Duration::ZERO,
            retry_backoff: Duration::from_millis(250),
            log_blocked: true,
            report_spam: false,
        }
    }
}

impl GatePolicy {
    pub fn penalty(&self) -> Penalty {
        if self.delay.is_zero() {
            Penalty::Block
        } else {
            Penalty::Delay(self.delay.min(MAX_DELAY))
        }
    }
}

pub struct GateDecisionEngine {
    /// Swapped on reload; in-flight lookups finish on the client they started with
    client: ArcSwap<Arc<dyn ReputationClient>>,
    cache: Arc<ReputationCache>,
}

impl GateDecisionEngine {
    pub fn new(client: Arc<dyn ReputationClient>, cache: Arc<ReputationCache>) -> Self {
        Self {
            client: ArcSwap::from_pointee(client),
            cache,
        }
    }

    pub fn client(&self) -> Arc<dyn ReputationClient> {
        self.client.load_full().as_ref().clone()
    }

    pub fn swap_client(&self, client: Arc<dyn ReputationClient>) {
        self.client.store(Arc::new(client));
    }

    pub fn cache(&self) -> &Arc<ReputationCache> {
        &self.cache
    }

    /// Gate a live attempt. Never fails: lookup errors allow the attempt.
    ///
    /// A `Delayed` verdict holds the caller for its duration (at most [`MAX_DELAY`])
    /// unless `cancel` fires first.
    pub async fn check(
        &self,
        identity: &IdentityTriple,
        criteria: &Criteria,
        whitelist: &Whitelist,
        policy: &GatePolicy,
        cancel: &CancellationToken,
    ) -> Verdict {
        if !policy.protect_registration {
            return Verdict::Allowed;
        }

        let identity = identity.normalized();
        let verdict = match self
            .assess(&identity, criteria, whitelist, policy.penalty(), policy.retry_backoff)
            .await
        {
            Ok(verdict) => verdict,
            Err(err) => {
                warn!(
                    identity = %identity,
                    kind = %err.kind,
                    error = %err.message,
                    "Reputation lookup failed, allowing attempt"
                );
                return Verdict::Allowed;
            }
        };

        if verdict.is_allowed() {
            return verdict;
        }

        if policy.log_blocked {
            warn!(
                identity = %identity,
                verdict = verdict.label(),
                triggers = ?verdict.triggers(),
                "Refused attempt from reported spammer"
            );
        }

        if policy.report_spam {
            self.report_spam(&identity, &verdict).await;
        }

        if let Verdict::Delayed { duration, .. } = &verdict
            && !hold(*duration, cancel).await
        {
            debug!(identity = %identity, "Delay cut short by cancellation");
        }

        verdict
    }

    /// Look up and evaluate without delay and without failing open.
    pub async fn assess(
        &self,
        identity: &IdentityTriple,
        criteria: &Criteria,
        whitelist: &Whitelist,
        penalty: Penalty,
        retry_backoff: Duration,
    ) -> Result<Verdict, LookupError> {
        let identity = identity.normalized();
        let fields = criteria::scored_fields(&identity, criteria, whitelist);
        if fields.is_empty() {
            return Ok(Verdict::Allowed);
        }

        // Only ask about fields that can change the outcome
        let query = restrict(&identity, &fields);
        let report = self.lookup(&query, retry_backoff).await?;

        Ok(criteria::evaluate(
            &report, criteria, whitelist, &query, penalty,
        ))
    }

    /// Cached lookup with at most one retry of a transient failure
    pub async fn lookup(
        &self,
        identity: &IdentityTriple,
        retry_backoff: Duration,
    ) -> Result<ReputationReport, LookupError> {
        match self.fetch(identity).await {
            Err(err) if err.is_transient() => {
                debug!(
                    identity = %identity,
                    kind = %err.kind,
                    backoff_ms = retry_backoff.as_millis() as u64,
                    "Transient lookup failure, retrying once"
                );
                tokio::time::sleep(retry_backoff).await;
                self.fetch(identity).await
            }
            other => other,
        }
    }

    async fn fetch(&self, identity: &IdentityTriple) -> Result<ReputationReport, LookupError> {
        let client = self.client();
        self.cache
            .get_or_fetch(identity, || client.lookup(identity))
            .await
    }

    /// Best-effort submission; failures are logged and dropped
    pub async fn report_spam(&self, identity: &IdentityTriple, verdict: &Verdict) {
        let fields: Vec<&str> = verdict.triggers().iter().map(|t| t.field.as_str()).collect();
        let evidence = format!("Automatically flagged on {}", fields.join(", "));
        let report = SpamReport::new(identity.clone(), evidence);

        match self.client().report(&report).await {
            Ok(()) => info!(identity = %identity, "Spammer reported to reputation service"),
            Err(err) => warn!(
                identity = %identity,
                kind = %err.kind,
                error = %err.message,
                "Could not report spammer, ignoring"
            ),
        }
    }
}

/// Copy of the triple carrying only the given fields
fn restrict(identity: &IdentityTriple, fields: &[Field]) -> IdentityTriple {
    let keep = |field: Field| {
        if fields.contains(&field) {
            identity.get(field).map(str::to_string)
        } else {
            None
        }
    };
    IdentityTriple {
        email: keep(Field::Email),
        username: keep(Field::Username),
        ip_address: keep(Field::Ip),
    }
}

/// Sleep for `duration` (capped at [`MAX_DELAY`]); false if cancelled first
async fn hold(duration: Duration, cancel: &CancellationToken) -> bool {
    tokio::select! {
        _ = tokio::time::sleep(duration.min(MAX_DELAY)) => true,
        _ = cancel.cancelled() => false,
    }
}
