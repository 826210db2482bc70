//! The evaluator seam.
//!
//! The orchestrator owns a `PolicyEvaluator` instance injected at
//! construction; nothing in the engine reaches for global state. Any
//! implementation must be deterministic and side-effect-free for a given
//! loaded policy set and input, which is what makes decision caching sound.

use serde_json::Value;

use crate::validator::ValidationIssue;

/// A policy failed the gate or did not compile. Fatal to that load only.
#[derive(Debug, thiserror::Error)]
#[error("policy '{name}' failed to load")]
pub struct PolicyCompileError {
    pub name: String,
    pub issues: Vec<ValidationIssue>,
}

impl PolicyCompileError {
    pub fn issue_summaries(&self) -> Vec<String> {
        self.issues
            .iter()
            .map(|i| format!("{}: {}", i.code, i.message))
            .collect()
    }
}

/// Evaluation could not produce a decision. The orchestrator treats every
/// variant as deny (fail-closed).
#[derive(Debug, thiserror::Error)]
pub enum PolicyEvalError {
    #[error("no policy answers query '{query}'")]
    NoSuchPolicy { query: String },
    #[error("malformed evaluator input")]
    MalformedInput { detail: String },
    #[error("evaluator internal error")]
    Internal { detail: String },
}

/// Interface over a Rego/OPA-compatible decision engine.
pub trait PolicyEvaluator: Send + Sync {
    /// Validate, compile and activate `source` under `name`. On error the
    /// previously active version (if any) remains in force.
    fn load_policy(&self, name: &str, source: &str) -> Result<(), PolicyCompileError>;

    /// Evaluate `query` (e.g. `data.gateway.allow`) against `input`,
    /// returning the decision document.
    fn evaluate(&self, query: &str, input: &Value) -> Result<Value, PolicyEvalError>;

    fn has_policy(&self, name: &str) -> bool;

    fn loaded_policies(&self) -> Vec<String>;
}
