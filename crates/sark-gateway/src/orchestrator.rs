//! Authorization orchestrator.
//!
//! Request state machine: RECEIVED -> RATE_CHECKED -> {DENIED_RATE_LIMIT |
//! CACHE_LOOKUP} -> {CACHE_HIT -> DECIDED | CACHE_MISS -> EVALUATING ->
//! DECIDED} -> {ALLOWED -> DISPATCHING -> COMPLETED | DENIED -> COMPLETED}.
//! Every terminal state emits exactly one audit event. Evaluator failures
//! deny (fail-closed); a dispatch failure after an allow keeps the allow
//! outcome and reports the delivery failure separately.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;

use serde_json::Value;

use sark_core::cache::PolicyCache;
use sark_core::fingerprint::Fingerprint;
use sark_core::model::{
    AuthorizationRequest, GatewayResponse, PolicyDecision, PolicyInput, TrustLevel,
};
use sark_core::ratelimit::RateLimiter;
use sark_metrics::GatewayMetrics;
use sark_policy::PolicyEvaluator;

use crate::audit::{AuditGuard, AuditSink};
use crate::config::{FingerprintConfig, GatewayConfig};
use crate::dispatch::TransportDispatcher;
use crate::registry::StaticRegistry;
use crate::retry::RetryPolicy;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RequestState {
    Received,
    RateChecked,
    DeniedRateLimit,
    CacheLookup,
    CacheHit,
    CacheMiss,
    Evaluating,
    Decided,
    Allowed,
    Denied,
    Dispatching,
    Completed,
}

fn enter(state: RequestState, audit_id: &str) {
    tracing::debug!(?state, audit_id, "request state");
}

pub struct AuthorizationOrchestrator {
    limiter: Arc<RateLimiter>,
    cache: Arc<PolicyCache>,
    evaluator: Arc<dyn PolicyEvaluator>,
    dispatcher: Arc<TransportDispatcher>,
    audit: Arc<dyn AuditSink>,
    metrics: Arc<GatewayMetrics>,
    policy_query: String,
    fingerprint: FingerprintConfig,
    cross_environment_restriction: bool,
}

impl AuthorizationOrchestrator {
    /// Wire the engine from configuration. The evaluator is injected, owned
    /// here, and shared with nothing else.
    pub fn new(
        config: &GatewayConfig,
        evaluator: Arc<dyn PolicyEvaluator>,
        audit: Arc<dyn AuditSink>,
        metrics: Arc<GatewayMetrics>,
    ) -> Self {
        let registry = Arc::new(StaticRegistry::new(config.backends.clone()));
        let dispatcher = Arc::new(TransportDispatcher::new(
            registry,
            config.breaker.clone(),
            RetryPolicy::new(config.retry.clone()),
            metrics.clone(),
        ));
        Self {
            limiter: Arc::new(RateLimiter::new(config.rate_limit.clone())),
            cache: Arc::new(PolicyCache::new(config.cache.clone())),
            evaluator,
            dispatcher,
            audit,
            metrics,
            policy_query: config.policy_query.clone(),
            fingerprint: config.fingerprint.clone(),
            cross_environment_restriction: config.cross_environment_restriction,
        }
    }

    pub fn cache(&self) -> &Arc<PolicyCache> {
        &self.cache
    }

    pub fn limiter(&self) -> &Arc<RateLimiter> {
        &self.limiter
    }

    pub fn dispatcher(&self) -> &Arc<TransportDispatcher> {
        &self.dispatcher
    }

    pub fn metrics(&self) -> &Arc<GatewayMetrics> {
        &self.metrics
    }

    /// Start the cache's background expiry sweeper.
    pub fn spawn_cache_sweeper(&self) -> tokio::task::JoinHandle<()> {
        self.cache.spawn_sweeper()
    }

    /// The single entry point: admit, decide, dispatch, audit.
    pub async fn authorize_and_invoke(&self, request: AuthorizationRequest) -> GatewayResponse {
        let started = Instant::now();
        self.metrics.record_request();

        let mut audit = AuditGuard::new(self.audit.clone(), &request);
        let audit_id = audit.audit_id();
        enter(RequestState::Received, &audit_id);

        let admission = self.limiter.admit(
            &request.principal,
            &request.resource(),
            request.sensitivity,
            1,
        );
        enter(RequestState::RateChecked, &audit_id);
        if !admission.allowed {
            enter(RequestState::DeniedRateLimit, &audit_id);
            self.metrics.record_rate_limit_denial();
            self.metrics.record_outcome(false);
            let latency_ms = started.elapsed().as_millis() as u64;
            audit.complete_rate_limited(latency_ms);
            return GatewayResponse {
                allow: false,
                reason: "rate_limit_exceeded".to_string(),
                result: None,
                audit_id,
                cache_ttl: 0,
                retry_after_secs: admission.retry_after.map(|d| d.as_secs().max(1)),
                delivery_error: None,
            };
        }

        enter(RequestState::CacheLookup, &audit_id);
        let spec = self.fingerprint.spec_for(request.action.category());
        let key = Fingerprint::compute(&request, spec).hex;

        let (decision, cache_hit) = match self.cache.get(&key) {
            Some(cached) => {
                enter(RequestState::CacheHit, &audit_id);
                self.metrics.record_cache_hit();
                (cached, true)
            }
            None => {
                enter(RequestState::CacheMiss, &audit_id);
                self.metrics.record_cache_miss();
                enter(RequestState::Evaluating, &audit_id);
                let input = PolicyInput::from_request(&request).to_value();
                match self.evaluator.evaluate(&self.policy_query, &input) {
                    Ok(value) => {
                        let decision = self.decision_from_value(&request, &value);
                        self.cache
                            .set(key, decision.clone(), request.sensitivity, None);
                        (Arc::new(decision), false)
                    }
                    Err(err) => {
                        // Fail closed: evaluator trouble is a deny, and the
                        // reason stays generic.
                        tracing::warn!(error = %err, %audit_id, "policy evaluation failed, denying");
                        enter(RequestState::Denied, &audit_id);
                        self.metrics.record_evaluation_error();
                        self.metrics.record_outcome(false);
                        self.metrics.record_decision_latency(started.elapsed());
                        let latency_ms = started.elapsed().as_millis() as u64;
                        audit.complete_deny("evaluation_error", latency_ms);
                        return GatewayResponse {
                            allow: false,
                            reason: "evaluation_error".to_string(),
                            result: None,
                            audit_id,
                            cache_ttl: 0,
                            retry_after_secs: None,
                            delivery_error: None,
                        };
                    }
                }
            }
        };
        enter(RequestState::Decided, &audit_id);
        audit.set_cache_hit(cache_hit);
        self.metrics.record_decision_latency(started.elapsed());

        let decision = self.apply_restrictions(&request, decision);

        if !decision.is_allow() {
            enter(RequestState::Denied, &audit_id);
            self.metrics.record_outcome(false);
            let latency_ms = started.elapsed().as_millis() as u64;
            let response = GatewayResponse {
                allow: false,
                reason: decision.reason().to_string(),
                result: None,
                audit_id,
                cache_ttl: decision.cache_ttl_secs(),
                retry_after_secs: None,
                delivery_error: None,
            };
            audit.complete_deny(decision.reason(), latency_ms);
            return response;
        }

        enter(RequestState::Allowed, &audit_id);
        self.metrics.record_outcome(true);
        enter(RequestState::Dispatching, &audit_id);

        let dispatch = self
            .dispatcher
            .invoke(&request.server, &request.tool, &decision)
            .await;
        enter(RequestState::Completed, &audit_id);
        let latency_ms = started.elapsed().as_millis() as u64;

        match dispatch {
            Ok(result) => {
                audit.complete_allow(decision.reason(), true, None, latency_ms);
                GatewayResponse {
                    allow: true,
                    reason: decision.reason().to_string(),
                    result: Some(result),
                    audit_id,
                    cache_ttl: decision.cache_ttl_secs(),
                    retry_after_secs: None,
                    delivery_error: None,
                }
            }
            Err(err) => {
                // Authorization succeeded; delivery did not. Two facts, both
                // recorded.
                self.metrics.record_dispatch_failure();
                let token = err.client_reason();
                audit.complete_allow(decision.reason(), false, Some(token), latency_ms);
                GatewayResponse {
                    allow: true,
                    reason: decision.reason().to_string(),
                    result: None,
                    audit_id,
                    cache_ttl: decision.cache_ttl_secs(),
                    retry_after_secs: err.retry_after().map(|d| d.as_secs().max(1)),
                    delivery_error: Some(token.to_string()),
                }
            }
        }
    }

    fn decision_from_value(&self, request: &AuthorizationRequest, value: &Value) -> PolicyDecision {
        // Absent or non-boolean `allow` is a deny.
        let allow = value.get("allow").and_then(Value::as_bool).unwrap_or(false);
        let reason = value
            .get("reason")
            .and_then(Value::as_str)
            .unwrap_or(if allow { "policy allowed" } else { "policy denied" })
            .to_string();
        let ttl_secs = self.cache.ttl_for(request.sensitivity).as_secs();

        if allow {
            let filtered: BTreeMap<String, Value> = value
                .get("filtered_parameters")
                .and_then(Value::as_object)
                .map(|obj| obj.iter().map(|(k, v)| (k.clone(), v.clone())).collect())
                .unwrap_or_default();
            PolicyDecision::allow(reason, filtered, ttl_secs)
        } else {
            PolicyDecision::deny(reason, ttl_secs)
        }
    }

    /// Post-evaluation restriction: an untrusted principal targeting a
    /// different environment loses the allow. Produces a new decision
    /// value; the cached one is untouched.
    fn apply_restrictions(
        &self,
        request: &AuthorizationRequest,
        decision: Arc<PolicyDecision>,
    ) -> Arc<PolicyDecision> {
        if !self.cross_environment_restriction || !decision.is_allow() {
            return decision;
        }
        if request.principal.trust_level != TrustLevel::Untrusted {
            return decision;
        }
        let target = request
            .context
            .extra
            .get("target_environment")
            .and_then(Value::as_str);
        match target {
            Some(target) if request.context.environment.as_deref() != Some(target) => Arc::new(
                decision.restricted("untrusted principals cannot cross environments"),
            ),
            _ => decision,
        }
    }
}
