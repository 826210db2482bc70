//! Transport dispatcher.
//!
//! One hard deadline per call, a circuit breaker per backend, and a retry
//! loop for transient failures in between. The dispatcher takes the policy
//! decision itself, never raw parameters, so redaction cannot be bypassed
//! by any call site.

use std::sync::Arc;

use dashmap::DashMap;

use sark_core::breaker::CircuitBreaker;
use sark_core::errors::GatewayError;
use sark_core::model::{PolicyDecision, ToolResult};
use sark_metrics::GatewayMetrics;

use crate::config::{BackendConfig, TransportKind};
use crate::registry::BackendRegistry;
use crate::retry::RetryPolicy;
use crate::transport::{HttpTransport, SseTransport, StdioTransport, Transport};

pub struct TransportDispatcher {
    registry: Arc<dyn BackendRegistry>,
    transports: DashMap<String, Arc<dyn Transport>>,
    breakers: DashMap<String, Arc<CircuitBreaker>>,
    default_breaker: sark_core::breaker::BreakerConfig,
    default_retry: RetryPolicy,
    metrics: Arc<GatewayMetrics>,
}

impl TransportDispatcher {
    pub fn new(
        registry: Arc<dyn BackendRegistry>,
        default_breaker: sark_core::breaker::BreakerConfig,
        default_retry: RetryPolicy,
        metrics: Arc<GatewayMetrics>,
    ) -> Self {
        Self {
            registry,
            transports: DashMap::new(),
            breakers: DashMap::new(),
            default_breaker,
            default_retry,
            metrics,
        }
    }

    /// Invoke `tool` on `backend` under the authorization `decision`. Only
    /// `decision.filtered_parameters()` ever reaches the wire.
    pub async fn invoke(
        &self,
        backend: &str,
        tool: &str,
        decision: &PolicyDecision,
    ) -> Result<ToolResult, GatewayError> {
        let config = self
            .registry
            .resolve(backend)
            .ok_or_else(|| GatewayError::invalid_request(format!("unknown backend '{backend}'")))?;

        let transport = self.transport_for(&config)?;
        let breaker = self.breaker_for(&config);
        let retry = config
            .retry
            .clone()
            .map(RetryPolicy::new)
            .unwrap_or_else(|| self.default_retry.clone());

        let outcome = tokio::time::timeout(
            config.call_timeout(),
            self.invoke_with_retry(&config, transport, &breaker, &retry, tool, decision),
        )
        .await;

        let result = match outcome {
            Ok(result) => result,
            Err(_) => Err(GatewayError::TransportTimeout {
                backend: backend.to_string(),
                timeout: config.call_timeout(),
            }),
        };

        self.metrics
            .set_breaker_state(backend, state_label(&breaker));
        result
    }

    async fn invoke_with_retry(
        &self,
        config: &BackendConfig,
        transport: Arc<dyn Transport>,
        breaker: &CircuitBreaker,
        retry: &RetryPolicy,
        tool: &str,
        decision: &PolicyDecision,
    ) -> Result<ToolResult, GatewayError> {
        let mut attempt = 0u32;
        loop {
            attempt += 1;

            // Breaker check before any I/O. If open, fail in microseconds.
            let guard = match breaker.acquire() {
                Ok(guard) => guard,
                Err(retry_after) => {
                    return Err(GatewayError::CircuitOpen {
                        backend: config.name.clone(),
                        retry_after,
                    });
                }
            };

            let attempt_result =
                tokio::time::timeout(config.attempt_timeout(), transport.invoke(tool, decision.filtered_parameters()))
                    .await;

            let error = match attempt_result {
                Ok(Ok(result)) => {
                    guard.success();
                    return Ok(result);
                }
                Ok(Err(err)) => {
                    // An application-level answer means the backend is up;
                    // only transport-class failures feed the breaker.
                    if err.is_retryable() {
                        guard.failure();
                    } else {
                        guard.success();
                    }
                    err
                }
                Err(_) => {
                    guard.failure();
                    GatewayError::TransportTimeout {
                        backend: config.name.clone(),
                        timeout: config.attempt_timeout(),
                    }
                }
            };

            if !retry.should_retry(&error, attempt) {
                return Err(error);
            }
            let delay = retry.delay(attempt);
            tracing::debug!(
                backend = %config.name,
                attempt,
                delay_ms = delay.as_millis() as u64,
                "transient failure, backing off"
            );
            tokio::time::sleep(delay).await;
        }
    }

    fn transport_for(&self, config: &BackendConfig) -> Result<Arc<dyn Transport>, GatewayError> {
        if let Some(existing) = self.transports.get(&config.name) {
            return Ok(existing.clone());
        }
        let transport: Arc<dyn Transport> = match config.transport {
            TransportKind::Http => Arc::new(HttpTransport::new(config)?),
            TransportKind::Sse => Arc::new(SseTransport::new(config)?),
            TransportKind::Stdio => Arc::new(StdioTransport::new(config)?),
        };
        self.transports
            .insert(config.name.clone(), transport.clone());
        Ok(transport)
    }

    fn breaker_for(&self, config: &BackendConfig) -> Arc<CircuitBreaker> {
        self.breakers
            .entry(config.name.clone())
            .or_insert_with(|| {
                let breaker_config = config
                    .breaker
                    .clone()
                    .unwrap_or_else(|| self.default_breaker.clone());
                Arc::new(CircuitBreaker::new(config.name.clone(), breaker_config))
            })
            .clone()
    }

    /// Breaker snapshots for the metrics surface.
    pub fn breaker_snapshots(&self) -> Vec<sark_core::breaker::BreakerSnapshot> {
        self.breakers
            .iter()
            .map(|entry| entry.value().snapshot())
            .collect()
    }

    /// Release every transport (connections, subprocesses).
    pub async fn shutdown(&self) {
        let transports: Vec<Arc<dyn Transport>> = self
            .transports
            .iter()
            .map(|entry| entry.value().clone())
            .collect();
        for transport in transports {
            transport.shutdown().await;
        }
        self.transports.clear();
    }
}

fn state_label(breaker: &CircuitBreaker) -> &'static str {
    match breaker.state() {
        sark_core::breaker::BreakerState::Closed => "closed",
        sark_core::breaker::BreakerState::Open => "open",
        sark_core::breaker::BreakerState::HalfOpen => "half_open",
    }
}
