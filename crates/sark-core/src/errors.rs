//! Gateway error taxonomy.
//!
//! Callers never see raw source errors: `client_reason` maps every variant
//! to a fixed vocabulary, and retry guidance travels with the retryable
//! variants. Cache and rate-limiter internals do not produce errors at all;
//! they degrade to conservative outcomes inside their own modules.

use std::time::Duration;

/// Errors surfaced by the authorization/dispatch path.
#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    /// Admission denied by the rate limiter. Retryable after `retry_after`.
    #[error("rate limit exceeded, retry after {}s", .retry_after.as_secs())]
    RateLimitExceeded {
        retry_after: Duration,
        remaining: u64,
    },

    /// A policy failed the validation gate or did not compile. Fatal to that
    /// load only; the previously active version stays in force.
    #[error("policy '{name}' failed validation")]
    PolicyCompilation { name: String, issues: Vec<String> },

    /// The evaluator could not produce a decision. Always treated as deny.
    #[error("policy evaluation failed")]
    PolicyEvaluation { detail: String },

    /// The backend's circuit breaker is open; no I/O was attempted.
    #[error("backend '{backend}' unavailable, retry after {}s", .retry_after.as_secs())]
    CircuitOpen {
        backend: String,
        retry_after: Duration,
    },

    /// The per-call deadline or a per-attempt timeout expired after retries.
    #[error("backend '{backend}' timed out after {}ms", .timeout.as_millis())]
    TransportTimeout { backend: String, timeout: Duration },

    /// Connection-level failure talking to the backend, surfaced only after
    /// retry exhaustion.
    #[error("connection to backend '{backend}' failed")]
    TransportConnection { backend: String, detail: String },

    /// The backend answered with an application-level error. Passed through
    /// unchanged and never retried.
    #[error("backend '{backend}' returned an error")]
    BackendInvocation {
        backend: String,
        code: Option<i64>,
        message: String,
    },

    /// Request construction or configuration rejected before any decision.
    #[error("invalid request")]
    InvalidRequest { detail: String },
}

impl GatewayError {
    pub fn invalid_request(detail: impl Into<String>) -> Self {
        GatewayError::InvalidRequest {
            detail: detail.into(),
        }
    }

    pub fn evaluation(detail: impl Into<String>) -> Self {
        GatewayError::PolicyEvaluation {
            detail: detail.into(),
        }
    }

    /// Whether the dispatcher may retry the call internally.
    /// Authorization-category and application errors are never retried.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            GatewayError::TransportTimeout { .. } | GatewayError::TransportConnection { .. }
        )
    }

    /// Retry guidance for callers, where the outcome is retryable at all.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            GatewayError::RateLimitExceeded { retry_after, .. }
            | GatewayError::CircuitOpen { retry_after, .. } => Some(*retry_after),
            _ => None,
        }
    }

    /// Stable, sanitized reason token for responses and audit events. No
    /// exception text, no internal paths.
    pub fn client_reason(&self) -> &'static str {
        match self {
            GatewayError::RateLimitExceeded { .. } => "rate_limit_exceeded",
            GatewayError::PolicyCompilation { .. } => "policy_rejected",
            GatewayError::PolicyEvaluation { .. } => "evaluation_error",
            GatewayError::CircuitOpen { .. } => "backend_unavailable",
            GatewayError::TransportTimeout { .. } => "backend_timeout",
            GatewayError::TransportConnection { .. } => "backend_connection_error",
            GatewayError::BackendInvocation { .. } => "backend_error",
            GatewayError::InvalidRequest { .. } => "invalid_request",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_transport_errors_are_retryable() {
        let timeout = GatewayError::TransportTimeout {
            backend: "srv-a".into(),
            timeout: Duration::from_secs(30),
        };
        let conn = GatewayError::TransportConnection {
            backend: "srv-a".into(),
            detail: "reset".into(),
        };
        assert!(timeout.is_retryable());
        assert!(conn.is_retryable());
    }

    #[test]
    fn application_and_authorization_errors_are_not_retryable() {
        let invocation = GatewayError::BackendInvocation {
            backend: "srv-a".into(),
            code: Some(-32000),
            message: "bad input".into(),
        };
        let eval = GatewayError::evaluation("missing field");
        assert!(!invocation.is_retryable());
        assert!(!eval.is_retryable());
    }

    #[test]
    fn retry_after_travels_with_retryable_outcomes() {
        let limited = GatewayError::RateLimitExceeded {
            retry_after: Duration::from_secs(12),
            remaining: 0,
        };
        assert_eq!(limited.retry_after(), Some(Duration::from_secs(12)));
        assert_eq!(limited.client_reason(), "rate_limit_exceeded");

        let open = GatewayError::CircuitOpen {
            backend: "srv-a".into(),
            retry_after: Duration::from_secs(30),
        };
        assert_eq!(open.retry_after(), Some(Duration::from_secs(30)));
    }

    #[test]
    fn client_reason_never_leaks_detail() {
        let err = GatewayError::TransportConnection {
            backend: "srv-a".into(),
            detail: "/etc/sark/secret.sock: permission denied".into(),
        };
        assert_eq!(err.client_reason(), "backend_connection_error");
        assert!(!err.to_string().contains("secret.sock"));
    }
}
