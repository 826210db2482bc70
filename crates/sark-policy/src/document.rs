//! Policy document model.
//!
//! Documents are declarative: structured conditions only, no embedded code,
//! no network or filesystem access. Evaluation is therefore deterministic
//! and side-effect-free by construction.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use sark_core::model::{Sensitivity, TrustLevel};

/// A named policy document as authored (YAML).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PolicyDocument {
    /// Query namespace, e.g. `gateway` answers `data.gateway.allow`.
    pub package: String,
    #[serde(default)]
    pub rules: RuleGroups,
    /// Glob patterns for parameter keys that must never reach a backend.
    #[serde(default)]
    pub redact: Vec<String>,
    /// Optional JSON Schemas keyed by tool name, enforced on parameters
    /// before any rule runs.
    #[serde(default)]
    pub parameter_schemas: BTreeMap<String, Value>,
}

impl PolicyDocument {
    pub fn from_yaml(source: &str) -> Result<Self, serde_yaml::Error> {
        serde_yaml::from_str(source)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RuleGroups {
    #[serde(default)]
    pub allow: Vec<Rule>,
    #[serde(default)]
    pub deny: Vec<Rule>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Rule {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub when: RuleCondition,
    #[serde(default)]
    pub reason: Option<String>,
}

impl Rule {
    pub fn display_name(&self) -> &str {
        self.name.as_deref().unwrap_or("unnamed")
    }
}

/// Conjunction of conditions; every populated field must hold for the rule
/// to match. An empty condition matches everything, which the validation
/// gate forbids for allow rules.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RuleCondition {
    #[serde(default)]
    pub roles: Vec<String>,
    #[serde(default)]
    pub teams: Vec<String>,
    #[serde(default)]
    pub trust_at_least: Option<TrustLevel>,
    #[serde(default)]
    pub min_sensitivity: Option<Sensitivity>,
    #[serde(default)]
    pub max_sensitivity: Option<Sensitivity>,
    #[serde(default)]
    pub mfa_verified: Option<bool>,
    #[serde(default)]
    pub environments: Vec<String>,
    /// Glob patterns over the tool name.
    #[serde(default)]
    pub tools: Vec<String>,
    /// Glob patterns over the server name.
    #[serde(default)]
    pub servers: Vec<String>,
    /// Exact-match constraints against the context escape-hatch map.
    #[serde(default)]
    pub extra_equals: BTreeMap<String, Value>,
}

impl RuleCondition {
    /// True when no constraint is populated at all.
    pub fn is_unconditional(&self) -> bool {
        self.roles.is_empty()
            && self.teams.is_empty()
            && self.trust_at_least.is_none()
            && self.min_sensitivity.is_none()
            && self.max_sensitivity.is_none()
            && self.mfa_verified.is_none()
            && self.environments.is_empty()
            && self.tools.is_empty()
            && self.servers.is_empty()
            && self.extra_equals.is_empty()
    }
}
