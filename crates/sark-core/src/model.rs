//! Request and decision model for the gateway.
//!
//! `AuthorizationRequest` is assembled once per call and never mutated.
//! `PolicyDecision` is an immutable value: post-processing (for example the
//! cross-environment restriction in the orchestrator) builds a new decision
//! instead of editing one in place.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::errors::GatewayError;

/// Trust classification of a principal, supplied by the upstream
/// authentication layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrustLevel {
    Untrusted,
    Standard,
    Trusted,
}

impl Default for TrustLevel {
    fn default() -> Self {
        TrustLevel::Standard
    }
}

/// Sensitivity classification on a resource/tool. Drives cache TTL, rate
/// limits and MFA requirements.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Sensitivity {
    Low,
    Medium,
    High,
    Critical,
}

impl Sensitivity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Sensitivity::Low => "low",
            Sensitivity::Medium => "medium",
            Sensitivity::High => "high",
            Sensitivity::Critical => "critical",
        }
    }
}

impl Default for Sensitivity {
    fn default() -> Self {
        Sensitivity::Medium
    }
}

impl fmt::Display for Sensitivity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Sensitivity {
    type Err = GatewayError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "low" => Ok(Sensitivity::Low),
            "medium" => Ok(Sensitivity::Medium),
            "high" => Ok(Sensitivity::High),
            "critical" => Ok(Sensitivity::Critical),
            other => Err(GatewayError::invalid_request(format!(
                "unknown sensitivity level: {other}"
            ))),
        }
    }
}

/// Actions the gateway knows how to authorize. Anything outside this set is
/// rejected at request construction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Action {
    ToolInvoke,
    ToolList,
    ResourceRead,
    ServerList,
    AgentMessage,
}

impl Action {
    pub fn as_str(&self) -> &'static str {
        match self {
            Action::ToolInvoke => "tool:invoke",
            Action::ToolList => "tool:list",
            Action::ResourceRead => "resource:read",
            Action::ServerList => "server:list",
            Action::AgentMessage => "agent:message",
        }
    }

    /// Category used to select policy input shape and fingerprint fields.
    pub fn category(&self) -> &'static str {
        match self {
            Action::ToolInvoke | Action::ToolList => "tool_invoke",
            Action::ResourceRead | Action::ServerList => "resource_read",
            Action::AgentMessage => "agent_message",
        }
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Action {
    type Err = GatewayError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "tool:invoke" => Ok(Action::ToolInvoke),
            "tool:list" => Ok(Action::ToolList),
            "resource:read" => Ok(Action::ResourceRead),
            "server:list" => Ok(Action::ServerList),
            "agent:message" => Ok(Action::AgentMessage),
            other => Err(GatewayError::invalid_request(format!(
                "unknown action: {other}"
            ))),
        }
    }
}

/// The caller on whose behalf a request runs. Identity is validated upstream;
/// the gateway only authorizes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Principal {
    pub id: String,
    pub role: String,
    #[serde(default)]
    pub teams: Vec<String>,
    #[serde(default)]
    pub trust_level: TrustLevel,
}

impl Principal {
    pub fn new(id: impl Into<String>, role: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            role: role.into(),
            teams: Vec::new(),
            trust_level: TrustLevel::Standard,
        }
    }

    pub fn with_trust_level(mut self, trust_level: TrustLevel) -> Self {
        self.trust_level = trust_level;
        self
    }

    pub fn with_teams(mut self, teams: Vec<String>) -> Self {
        self.teams = teams;
        self
    }
}

/// Per-request context. `extra` is the forward-compatibility escape hatch:
/// policies may read it, but only fields named in the fingerprint spec ever
/// become cache-key-significant.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RequestContext {
    pub timestamp: Option<DateTime<Utc>>,
    #[serde(default)]
    pub client_addr: Option<String>,
    #[serde(default)]
    pub user_agent: Option<String>,
    #[serde(default)]
    pub environment: Option<String>,
    #[serde(default)]
    pub mfa_verified: bool,
    #[serde(default)]
    pub extra: BTreeMap<String, Value>,
}

impl RequestContext {
    pub fn now() -> Self {
        Self {
            timestamp: Some(Utc::now()),
            ..Default::default()
        }
    }

    pub fn with_mfa_verified(mut self, verified: bool) -> Self {
        self.mfa_verified = verified;
        self
    }

    pub fn with_environment(mut self, environment: impl Into<String>) -> Self {
        self.environment = Some(environment.into());
        self
    }

    /// Look up a context field by name, covering both the structured fields
    /// and the escape-hatch map.
    pub fn field(&self, name: &str) -> Option<Value> {
        match name {
            "environment" => self.environment.clone().map(Value::String),
            "mfa_verified" => Some(Value::Bool(self.mfa_verified)),
            "client_addr" => self.client_addr.clone().map(Value::String),
            "user_agent" => self.user_agent.clone().map(Value::String),
            other => self.extra.get(other).cloned(),
        }
    }
}

/// A single tool-invocation authorization request. Built once, read
/// everywhere, discarded after the response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthorizationRequest {
    pub principal: Principal,
    pub action: Action,
    pub server: String,
    pub tool: String,
    #[serde(default)]
    pub sensitivity: Sensitivity,
    #[serde(default)]
    pub parameters: BTreeMap<String, Value>,
    #[serde(default)]
    pub context: RequestContext,
}

impl AuthorizationRequest {
    pub fn new(
        principal: Principal,
        action: Action,
        server: impl Into<String>,
        tool: impl Into<String>,
    ) -> Result<Self, GatewayError> {
        let server = server.into();
        let tool = tool.into();
        if principal.id.is_empty() {
            return Err(GatewayError::invalid_request("principal id is empty"));
        }
        if server.is_empty() {
            return Err(GatewayError::invalid_request("server name is empty"));
        }
        Ok(Self {
            principal,
            action,
            server,
            tool,
            sensitivity: Sensitivity::default(),
            parameters: BTreeMap::new(),
            context: RequestContext::now(),
        })
    }

    pub fn with_sensitivity(mut self, sensitivity: Sensitivity) -> Self {
        self.sensitivity = sensitivity;
        self
    }

    pub fn with_parameters(mut self, parameters: BTreeMap<String, Value>) -> Self {
        self.parameters = parameters;
        self
    }

    pub fn with_context(mut self, context: RequestContext) -> Self {
        self.context = context;
        self
    }

    /// Resource identifier used for rate limiting and backend resolution.
    pub fn resource(&self) -> String {
        if self.tool.is_empty() {
            self.server.clone()
        } else {
            format!("{}/{}", self.server, self.tool)
        }
    }
}

/// Structured evaluator input, tagged by action category. Policies receive
/// this serialized as JSON; the `extra` map carries anything the structured
/// shape does not name yet.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "category", rename_all = "snake_case")]
pub enum PolicyInput {
    ToolInvoke {
        principal: Principal,
        server: String,
        tool: String,
        sensitivity: Sensitivity,
        parameters: BTreeMap<String, Value>,
        mfa_verified: bool,
        environment: Option<String>,
        extra: BTreeMap<String, Value>,
    },
    ResourceRead {
        principal: Principal,
        server: String,
        resource: String,
        sensitivity: Sensitivity,
        environment: Option<String>,
        extra: BTreeMap<String, Value>,
    },
    AgentMessage {
        principal: Principal,
        target_agent: String,
        target_environment: Option<String>,
        capability: String,
        environment: Option<String>,
        extra: BTreeMap<String, Value>,
    },
}

impl PolicyInput {
    /// Build the evaluator input for a request. The mapping from action to
    /// input shape is fixed here so call sites cannot hand the evaluator a
    /// loosely-typed bag.
    pub fn from_request(request: &AuthorizationRequest) -> Self {
        let ctx = &request.context;
        match request.action.category() {
            "resource_read" => PolicyInput::ResourceRead {
                principal: request.principal.clone(),
                server: request.server.clone(),
                resource: request.resource(),
                sensitivity: request.sensitivity,
                environment: ctx.environment.clone(),
                extra: ctx.extra.clone(),
            },
            "agent_message" => PolicyInput::AgentMessage {
                principal: request.principal.clone(),
                target_agent: request.tool.clone(),
                target_environment: ctx
                    .extra
                    .get("target_environment")
                    .and_then(Value::as_str)
                    .map(ToString::to_string),
                capability: request
                    .parameters
                    .get("capability")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string(),
                environment: ctx.environment.clone(),
                extra: ctx.extra.clone(),
            },
            _ => PolicyInput::ToolInvoke {
                principal: request.principal.clone(),
                server: request.server.clone(),
                tool: request.tool.clone(),
                sensitivity: request.sensitivity,
                parameters: request.parameters.clone(),
                mfa_verified: ctx.mfa_verified,
                environment: ctx.environment.clone(),
                extra: ctx.extra.clone(),
            },
        }
    }

    pub fn to_value(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }
}

/// Outcome of policy evaluation. Immutable: every constructor and combinator
/// returns a fresh value, and cached decisions are replaced, never patched.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PolicyDecision {
    allow: bool,
    reason: String,
    #[serde(default)]
    filtered_parameters: BTreeMap<String, Value>,
    cache_ttl_secs: u64,
    audit_id: String,
}

impl PolicyDecision {
    pub fn allow(
        reason: impl Into<String>,
        filtered_parameters: BTreeMap<String, Value>,
        cache_ttl_secs: u64,
    ) -> Self {
        Self {
            allow: true,
            reason: reason.into(),
            filtered_parameters,
            cache_ttl_secs,
            audit_id: uuid::Uuid::new_v4().to_string(),
        }
    }

    pub fn deny(reason: impl Into<String>, cache_ttl_secs: u64) -> Self {
        Self {
            allow: false,
            reason: reason.into(),
            filtered_parameters: BTreeMap::new(),
            cache_ttl_secs,
            audit_id: uuid::Uuid::new_v4().to_string(),
        }
    }

    pub fn is_allow(&self) -> bool {
        self.allow
    }

    pub fn reason(&self) -> &str {
        &self.reason
    }

    pub fn filtered_parameters(&self) -> &BTreeMap<String, Value> {
        &self.filtered_parameters
    }

    pub fn cache_ttl_secs(&self) -> u64 {
        self.cache_ttl_secs
    }

    pub fn audit_id(&self) -> &str {
        &self.audit_id
    }

    /// Derive a restricted copy of this decision. Used by post-evaluation
    /// checks (for example cross-environment restriction): the original
    /// value, possibly cached, stays untouched.
    pub fn restricted(&self, reason: impl Into<String>) -> Self {
        Self {
            allow: false,
            reason: reason.into(),
            filtered_parameters: BTreeMap::new(),
            cache_ttl_secs: 0,
            audit_id: self.audit_id.clone(),
        }
    }
}

/// Result returned by a backend tool invocation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolResult {
    pub content: Value,
    #[serde(default)]
    pub is_error: bool,
}

impl ToolResult {
    pub fn ok(content: Value) -> Self {
        Self {
            content,
            is_error: false,
        }
    }
}

/// Response from `authorize_and_invoke`: always structured, never a raw
/// error. Authorization and delivery outcomes are independent facts, so an
/// allowed request with a failed dispatch reports `allow = true` plus
/// `delivery_error`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayResponse {
    pub allow: bool,
    pub reason: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<ToolResult>,
    pub audit_id: String,
    pub cache_ttl: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_after_secs: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub delivery_error: Option<String>,
}
