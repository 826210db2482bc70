//! Policy layer for the gateway authorization engine.
//!
//! A policy is a YAML document with `allow`/`deny` rule groups, redaction
//! patterns and optional per-tool parameter schemas. Documents pass a
//! validation gate before activation; the built-in `RuleEvaluator` evaluates
//! them deterministically, which is what makes decision caching sound.

pub mod document;
pub mod engine;
pub mod evaluator;
pub mod store;
pub mod validator;

pub use document::{PolicyDocument, Rule, RuleCondition, RuleGroups};
pub use engine::RuleEvaluator;
pub use evaluator::{PolicyCompileError, PolicyEvalError, PolicyEvaluator};
pub use store::PolicyStore;
pub use validator::{PolicyValidator, Severity, ValidationIssue, ValidationResult};
