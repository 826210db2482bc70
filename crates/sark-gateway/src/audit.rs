//! Audit events and sinks.
//!
//! Every request terminates in exactly one audit event; `AuditGuard` is the
//! RAII enforcement, emitting an error-decision event if it is dropped
//! without an explicit completion (panic, early return, cancellation).
//! Recording never blocks request completion: sinks are fire-and-forget,
//! and the tracing sink is the local fallback when no collector is wired.

use std::fs::OpenOptions;
use std::io::Write;
use std::path::Path;
use std::sync::{Arc, Mutex};

use serde::Serialize;

use sark_core::model::AuthorizationRequest;

#[derive(Debug, Clone, Serialize)]
pub struct AuditEvent {
    pub audit_id: String,
    /// RFC 3339 timestamp.
    pub timestamp: String,
    pub principal: String,
    pub role: String,
    pub action: String,
    pub server: String,
    pub tool: String,
    /// "allow" | "deny" | "deny_rate_limit" | "error"
    pub decision: String,
    pub reason: String,
    pub cache_hit: bool,
    /// Delivery outcome for allowed requests: "delivered" or
    /// "failed:<reason>". Independent of the authorization outcome.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub delivery: Option<String>,
    pub latency_ms: u64,
}

pub trait AuditSink: Send + Sync {
    fn record(&self, event: &AuditEvent);
}

/// NDJSON append sink.
pub struct FileAuditSink {
    file: Mutex<std::fs::File>,
}

impl FileAuditSink {
    pub fn new(path: &Path) -> std::io::Result<Self> {
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self {
            file: Mutex::new(file),
        })
    }
}

impl AuditSink for FileAuditSink {
    fn record(&self, event: &AuditEvent) {
        if let Ok(json) = serde_json::to_string(event) {
            if let Ok(mut f) = self.file.lock() {
                if writeln!(f, "{}", json).is_err() {
                    // Local fallback: the event still lands in the log.
                    tracing::warn!(audit_id = %event.audit_id, "audit sink write failed");
                    tracing::info!(event = %json, "audit event (fallback)");
                }
            }
        }
    }
}

/// Fallback sink: structured log via `tracing`.
pub struct TracingAuditSink;

impl AuditSink for TracingAuditSink {
    fn record(&self, event: &AuditEvent) {
        tracing::info!(
            audit_id = %event.audit_id,
            principal = %event.principal,
            action = %event.action,
            server = %event.server,
            tool = %event.tool,
            decision = %event.decision,
            reason = %event.reason,
            cache_hit = event.cache_hit,
            latency_ms = event.latency_ms,
            "audit event"
        );
    }
}

pub struct NullAuditSink;

impl AuditSink for NullAuditSink {
    fn record(&self, _event: &AuditEvent) {}
}

/// Guarantees exactly one audit event per request.
pub struct AuditGuard {
    sink: Arc<dyn AuditSink>,
    event: Option<AuditEvent>,
}

impl AuditGuard {
    pub fn new(sink: Arc<dyn AuditSink>, request: &AuthorizationRequest) -> Self {
        let event = AuditEvent {
            audit_id: uuid::Uuid::new_v4().to_string(),
            timestamp: chrono::Utc::now().to_rfc3339(),
            principal: request.principal.id.clone(),
            role: request.principal.role.clone(),
            action: request.action.to_string(),
            server: request.server.clone(),
            tool: request.tool.clone(),
            decision: "error".to_string(),
            reason: "request did not reach a terminal state".to_string(),
            cache_hit: false,
            delivery: None,
            latency_ms: 0,
        };
        Self {
            sink,
            event: Some(event),
        }
    }

    pub fn audit_id(&self) -> String {
        self.event
            .as_ref()
            .map(|e| e.audit_id.clone())
            .unwrap_or_default()
    }

    pub fn set_cache_hit(&mut self, cache_hit: bool) {
        if let Some(event) = &mut self.event {
            event.cache_hit = cache_hit;
        }
    }

    fn emit(&mut self, decision: &str, reason: &str, delivery: Option<String>, latency_ms: u64) {
        if let Some(mut event) = self.event.take() {
            event.decision = decision.to_string();
            event.reason = reason.to_string();
            event.delivery = delivery;
            event.latency_ms = latency_ms;
            self.sink.record(&event);
        }
    }

    pub fn complete_allow(mut self, reason: &str, delivered: bool, failure: Option<&str>, latency_ms: u64) {
        let delivery = if delivered {
            Some("delivered".to_string())
        } else {
            Some(format!("failed:{}", failure.unwrap_or("unknown")))
        };
        self.emit("allow", reason, delivery, latency_ms);
    }

    pub fn complete_deny(mut self, reason: &str, latency_ms: u64) {
        self.emit("deny", reason, None, latency_ms);
    }

    pub fn complete_rate_limited(mut self, latency_ms: u64) {
        self.emit("deny_rate_limit", "rate_limit_exceeded", None, latency_ms);
    }
}

impl Drop for AuditGuard {
    fn drop(&mut self) {
        // Safety net: no terminal state was reached, emit the error event.
        if self.event.is_some() {
            self.emit(
                "error",
                "audit guard dropped without explicit completion",
                None,
                0,
            );
        }
    }
}
