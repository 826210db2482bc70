//! End-to-end flow through the orchestrator with the built-in rule
//! evaluator: caching, fail-closed evaluation, rate limiting, restriction
//! post-processing and audit accounting.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::{json, Value};

use sark_core::model::{
    Action, AuthorizationRequest, Principal, RequestContext, Sensitivity, TrustLevel,
};
use sark_core::ratelimit::RateLimitConfig;
use sark_gateway::{AuditEvent, AuditSink, AuthorizationOrchestrator, GatewayConfig, NullAuditSink};
use sark_metrics::GatewayMetrics;
use sark_policy::{PolicyCompileError, PolicyEvalError, PolicyEvaluator, RuleEvaluator};

const GATEWAY_POLICY: &str = r#"
package: gateway
rules:
  allow:
    - name: admin-grant
      when:
        roles: [admin]
    - name: developer-grant
      when:
        roles: [developer]
  deny:
    - name: mfa-required
      when:
        min_sensitivity: high
        mfa_verified: false
      reason: "mfa required for high-sensitivity tools"
redact:
  - "secret*"
"#;

/// Wraps the rule evaluator to count `evaluate` invocations.
struct CountingEvaluator {
    inner: RuleEvaluator,
    calls: AtomicUsize,
}

impl CountingEvaluator {
    fn with_gateway_policy() -> Arc<Self> {
        let inner = RuleEvaluator::default();
        inner.load_policy("gateway", GATEWAY_POLICY).unwrap();
        Arc::new(Self {
            inner,
            calls: AtomicUsize::new(0),
        })
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl PolicyEvaluator for CountingEvaluator {
    fn load_policy(&self, name: &str, source: &str) -> Result<(), PolicyCompileError> {
        self.inner.load_policy(name, source)
    }

    fn evaluate(&self, query: &str, input: &Value) -> Result<Value, PolicyEvalError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.inner.evaluate(query, input)
    }

    fn has_policy(&self, name: &str) -> bool {
        self.inner.has_policy(name)
    }

    fn loaded_policies(&self) -> Vec<String> {
        self.inner.loaded_policies()
    }
}

/// Evaluator that always errors, for fail-closed checks.
struct BrokenEvaluator;

impl PolicyEvaluator for BrokenEvaluator {
    fn load_policy(&self, _name: &str, _source: &str) -> Result<(), PolicyCompileError> {
        Ok(())
    }

    fn evaluate(&self, _query: &str, _input: &Value) -> Result<Value, PolicyEvalError> {
        Err(PolicyEvalError::Internal {
            detail: "engine unavailable".to_string(),
        })
    }

    fn has_policy(&self, _name: &str) -> bool {
        true
    }

    fn loaded_policies(&self) -> Vec<String> {
        vec![]
    }
}

/// Evaluator that always allows, for restriction post-processing checks.
struct AlwaysAllow;

impl PolicyEvaluator for AlwaysAllow {
    fn load_policy(&self, _name: &str, _source: &str) -> Result<(), PolicyCompileError> {
        Ok(())
    }

    fn evaluate(&self, _query: &str, _input: &Value) -> Result<Value, PolicyEvalError> {
        Ok(json!({"allow": true, "reason": "open", "filtered_parameters": {}}))
    }

    fn has_policy(&self, _name: &str) -> bool {
        true
    }

    fn loaded_policies(&self) -> Vec<String> {
        vec![]
    }
}

struct CollectingSink(Mutex<Vec<AuditEvent>>);

impl AuditSink for CollectingSink {
    fn record(&self, event: &AuditEvent) {
        self.0.lock().unwrap().push(event.clone());
    }
}

fn orchestrator(
    evaluator: Arc<dyn PolicyEvaluator>,
    audit: Arc<dyn AuditSink>,
) -> AuthorizationOrchestrator {
    let config = GatewayConfig::default();
    AuthorizationOrchestrator::new(&config, evaluator, audit, Arc::new(GatewayMetrics::new()))
}

fn high_sensitivity_request(mfa: bool) -> AuthorizationRequest {
    AuthorizationRequest::new(
        Principal::new("u-1", "developer"),
        Action::ToolInvoke,
        "srv-a",
        "export_data",
    )
    .unwrap()
    .with_sensitivity(Sensitivity::High)
    .with_context(RequestContext::now().with_mfa_verified(mfa))
}

#[tokio::test]
async fn mfa_denial_is_cached_with_the_high_sensitivity_ttl() {
    let evaluator = CountingEvaluator::with_gateway_policy();
    let engine = orchestrator(evaluator.clone(), Arc::new(NullAuditSink));

    let first = engine
        .authorize_and_invoke(high_sensitivity_request(false))
        .await;
    assert!(!first.allow);
    assert!(first.reason.contains("mfa"));
    assert_eq!(first.cache_ttl, 120);
    assert_eq!(evaluator.calls(), 1);

    // Identical request inside the TTL is served from cache: the evaluator
    // is not consulted again.
    let second = engine
        .authorize_and_invoke(high_sensitivity_request(false))
        .await;
    assert!(!second.allow);
    assert!(second.reason.contains("mfa"));
    assert_eq!(evaluator.calls(), 1);

    let snap = engine.metrics().snapshot();
    assert_eq!(snap.cache_hits, 1);
    assert_eq!(snap.cache_misses, 1);
}

#[tokio::test]
async fn evaluator_failure_denies_with_a_generic_reason() {
    let engine = orchestrator(Arc::new(BrokenEvaluator), Arc::new(NullAuditSink));

    let response = engine
        .authorize_and_invoke(high_sensitivity_request(true))
        .await;
    assert!(!response.allow);
    assert_eq!(response.reason, "evaluation_error");
    assert!(!response.reason.contains("engine unavailable"));
    assert_eq!(engine.metrics().snapshot().evaluation_errors, 1);
}

#[tokio::test]
async fn rate_limited_request_gets_retry_guidance() {
    let mut config = GatewayConfig::default();
    config.rate_limit = RateLimitConfig {
        role_limits: std::collections::HashMap::from([("developer".to_string(), 3)]),
        ..RateLimitConfig::default()
    };
    let engine = AuthorizationOrchestrator::new(
        &config,
        CountingEvaluator::with_gateway_policy(),
        Arc::new(NullAuditSink),
        Arc::new(GatewayMetrics::new()),
    );

    for _ in 0..3 {
        let response = engine
            .authorize_and_invoke(high_sensitivity_request(false))
            .await;
        assert_ne!(response.reason, "rate_limit_exceeded");
    }

    let limited = engine
        .authorize_and_invoke(high_sensitivity_request(false))
        .await;
    assert!(!limited.allow);
    assert_eq!(limited.reason, "rate_limit_exceeded");
    let retry_after = limited.retry_after_secs.expect("retry guidance");
    assert!(retry_after <= 60);
    assert_eq!(engine.metrics().snapshot().rate_limit_denials, 1);
}

#[tokio::test]
async fn allowed_request_with_unknown_backend_keeps_the_allow_outcome() {
    let evaluator = CountingEvaluator::with_gateway_policy();
    let engine = orchestrator(evaluator, Arc::new(NullAuditSink));

    let mut params = BTreeMap::new();
    params.insert("query".to_string(), json!("select 1"));
    params.insert("secret_key".to_string(), json!("shh"));
    let request = AuthorizationRequest::new(
        Principal::new("u-1", "developer"),
        Action::ToolInvoke,
        "srv-a",
        "execute_query",
    )
    .unwrap()
    .with_sensitivity(Sensitivity::Medium)
    .with_parameters(params);

    let response = engine.authorize_and_invoke(request).await;
    // No backend named srv-a is registered, so delivery fails, but the
    // authorization outcome stands on its own.
    assert!(response.allow);
    assert!(response.result.is_none());
    assert_eq!(response.delivery_error.as_deref(), Some("invalid_request"));
    assert_eq!(engine.metrics().snapshot().dispatch_failures, 1);
}

#[tokio::test]
async fn untrusted_cross_environment_allow_is_restricted() {
    let engine = orchestrator(Arc::new(AlwaysAllow), Arc::new(NullAuditSink));

    let mut context = RequestContext::now().with_environment("production");
    context
        .extra
        .insert("target_environment".to_string(), json!("staging"));
    let request = AuthorizationRequest::new(
        Principal::new("agent-7", "developer").with_trust_level(TrustLevel::Untrusted),
        Action::ToolInvoke,
        "srv-a",
        "sync",
    )
    .unwrap()
    .with_context(context);

    let response = engine.authorize_and_invoke(request.clone()).await;
    assert!(!response.allow);
    assert!(response.reason.contains("environments"));

    // The cached base decision stayed an allow; the restriction is applied
    // per request on a fresh value.
    let again = engine.authorize_and_invoke(request).await;
    assert!(!again.allow);
    assert_eq!(engine.metrics().snapshot().cache_hits, 1);
}

#[tokio::test]
async fn same_environment_untrusted_principal_is_not_restricted() {
    let engine = orchestrator(Arc::new(AlwaysAllow), Arc::new(NullAuditSink));

    let mut context = RequestContext::now().with_environment("production");
    context
        .extra
        .insert("target_environment".to_string(), json!("production"));
    let request = AuthorizationRequest::new(
        Principal::new("agent-7", "developer").with_trust_level(TrustLevel::Untrusted),
        Action::ToolInvoke,
        "srv-a",
        "sync",
    )
    .unwrap()
    .with_context(context);

    let response = engine.authorize_and_invoke(request).await;
    assert!(response.allow);
}

#[tokio::test]
async fn every_request_emits_exactly_one_audit_event() {
    let sink = Arc::new(CollectingSink(Mutex::new(Vec::new())));
    let mut config = GatewayConfig::default();
    config.rate_limit = RateLimitConfig {
        role_limits: std::collections::HashMap::from([("developer".to_string(), 2)]),
        ..RateLimitConfig::default()
    };
    let engine = AuthorizationOrchestrator::new(
        &config,
        CountingEvaluator::with_gateway_policy(),
        sink.clone(),
        Arc::new(GatewayMetrics::new()),
    );

    // Deny (mfa), deny (cache hit), rate-limited.
    for _ in 0..3 {
        engine
            .authorize_and_invoke(high_sensitivity_request(false))
            .await;
    }

    let events = sink.0.lock().unwrap();
    assert_eq!(events.len(), 3);
    assert_eq!(events[0].decision, "deny");
    assert!(!events[0].cache_hit);
    assert_eq!(events[1].decision, "deny");
    assert!(events[1].cache_hit);
    assert_eq!(events[2].decision, "deny_rate_limit");

    let mut ids: Vec<&str> = events.iter().map(|e| e.audit_id.as_str()).collect();
    ids.dedup();
    assert_eq!(ids.len(), 3, "audit ids are unique per request");
}

#[tokio::test]
async fn cache_entries_expire_without_a_sweep() {
    let mut config = GatewayConfig::default();
    config
        .cache
        .sensitivity_ttl_secs
        .insert(Sensitivity::High, 1);
    let evaluator = CountingEvaluator::with_gateway_policy();
    let engine = AuthorizationOrchestrator::new(
        &config,
        evaluator.clone(),
        Arc::new(NullAuditSink),
        Arc::new(GatewayMetrics::new()),
    );

    engine
        .authorize_and_invoke(high_sensitivity_request(false))
        .await;
    assert_eq!(evaluator.calls(), 1);

    tokio::time::sleep(Duration::from_millis(1100)).await;

    engine
        .authorize_and_invoke(high_sensitivity_request(false))
        .await;
    assert_eq!(evaluator.calls(), 2, "expired entry forces re-evaluation");
}
