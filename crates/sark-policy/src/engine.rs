//! Built-in rule evaluator.
//!
//! Evaluation order: parameter schemas, then deny rules, then allow rules,
//! then default deny. First match wins within a group. The decision document
//! mirrors the OPA result shape: `{allow, reason, filtered_parameters}`.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use globset::{Glob, GlobSet, GlobSetBuilder};
use serde_json::{json, Map, Value};

use sark_core::fingerprint::sha256_hex;
use sark_core::model::{Sensitivity, TrustLevel};

use crate::document::{PolicyDocument, Rule, RuleCondition};
use crate::evaluator::{PolicyCompileError, PolicyEvalError, PolicyEvaluator};
use crate::validator::{PolicyValidator, Severity, ValidationIssue};

struct CompiledRule {
    rule: Rule,
    tools: Option<GlobSet>,
    servers: Option<GlobSet>,
}

struct CompiledPolicy {
    package: String,
    allow: Vec<CompiledRule>,
    deny: Vec<CompiledRule>,
    redact: GlobSet,
    parameter_schemas: HashMap<String, Arc<jsonschema::Validator>>,
}

/// Deterministic evaluator over validated policy documents. Compiled
/// policies are cached by source hash so repeated loads of identical text
/// skip recompilation.
pub struct RuleEvaluator {
    validator: PolicyValidator,
    policies: RwLock<HashMap<String, Arc<CompiledPolicy>>>,
    compiled: moka::sync::Cache<String, Arc<CompiledPolicy>>,
}

impl Default for RuleEvaluator {
    fn default() -> Self {
        Self::new(PolicyValidator::default())
    }
}

impl RuleEvaluator {
    pub fn new(validator: PolicyValidator) -> Self {
        Self {
            validator,
            policies: RwLock::new(HashMap::new()),
            compiled: moka::sync::Cache::new(64),
        }
    }

    fn compile(name: &str, document: PolicyDocument) -> Result<CompiledPolicy, PolicyCompileError> {
        let mut issues = Vec::new();

        let allow = compile_rules(&document.rules.allow, &mut issues);
        let deny = compile_rules(&document.rules.deny, &mut issues);
        let redact = compile_globs(&document.redact, "redact", &mut issues);

        let mut parameter_schemas = HashMap::new();
        for (tool, schema) in &document.parameter_schemas {
            match jsonschema::validator_for(schema) {
                Ok(validator) => {
                    parameter_schemas.insert(tool.clone(), Arc::new(validator));
                }
                Err(err) => issues.push(ValidationIssue {
                    severity: Severity::Critical,
                    code: "SCHEMA_COMPILE",
                    message: format!("parameter schema for '{tool}' does not compile: {err}"),
                    suggestion: None,
                }),
            }
        }

        if issues.iter().any(|i| i.severity == Severity::Critical) {
            return Err(PolicyCompileError {
                name: name.to_string(),
                issues,
            });
        }

        Ok(CompiledPolicy {
            package: document.package.clone(),
            allow,
            deny,
            redact,
            parameter_schemas,
        })
    }

    fn find_package(&self, package: &str) -> Option<Arc<CompiledPolicy>> {
        let policies = self.policies.read().ok()?;
        policies
            .values()
            .find(|p| p.package == package)
            .cloned()
    }
}

impl PolicyEvaluator for RuleEvaluator {
    fn load_policy(&self, name: &str, source: &str) -> Result<(), PolicyCompileError> {
        let hash = sha256_hex(source);
        let compiled = match self.compiled.get(&hash) {
            Some(cached) => cached,
            None => {
                let (document, result) = self.validator.validate(name, source);
                if !result.valid {
                    return Err(PolicyCompileError {
                        name: name.to_string(),
                        issues: result.issues,
                    });
                }
                let document = document.ok_or_else(|| PolicyCompileError {
                    name: name.to_string(),
                    issues: result.issues.clone(),
                })?;
                let compiled = Arc::new(Self::compile(name, document)?);
                self.compiled.insert(hash, compiled.clone());
                compiled
            }
        };

        if let Ok(mut policies) = self.policies.write() {
            policies.insert(name.to_string(), compiled);
            tracing::info!(policy = name, "policy activated");
            Ok(())
        } else {
            Err(PolicyCompileError {
                name: name.to_string(),
                issues: vec![ValidationIssue {
                    severity: Severity::Critical,
                    code: "STORE_POISONED",
                    message: "policy store lock poisoned".to_string(),
                    suggestion: None,
                }],
            })
        }
    }

    fn evaluate(&self, query: &str, input: &Value) -> Result<Value, PolicyEvalError> {
        let (package, entrypoint) = parse_query(query)?;
        if entrypoint != "allow" {
            return Err(PolicyEvalError::NoSuchPolicy {
                query: query.to_string(),
            });
        }
        let policy = self
            .find_package(package)
            .ok_or_else(|| PolicyEvalError::NoSuchPolicy {
                query: query.to_string(),
            })?;

        let eval_input = EvalInput::parse(input)?;

        // Parameter schema gate runs before any rule.
        if let Some(validator) = policy.parameter_schemas.get(eval_input.tool) {
            let params = Value::Object(eval_input.parameters.clone());
            let violations: Vec<String> = validator
                .iter_errors(&params)
                .map(|e| format!("{}: {}", e.instance_path(), e))
                .collect();
            if !violations.is_empty() {
                return Ok(decision(
                    false,
                    format!("parameter schema violation: {}", violations.join("; ")),
                    Map::new(),
                ));
            }
        }

        for compiled in &policy.deny {
            if matches(compiled, &eval_input) {
                let reason = compiled.rule.reason.clone().unwrap_or_else(|| {
                    format!("denied by policy rule '{}'", compiled.rule.display_name())
                });
                return Ok(decision(false, reason, Map::new()));
            }
        }

        for compiled in &policy.allow {
            if matches(compiled, &eval_input) {
                let reason = compiled.rule.reason.clone().unwrap_or_else(|| {
                    format!("allowed by policy rule '{}'", compiled.rule.display_name())
                });
                let filtered = redact_parameters(&eval_input.parameters, &policy.redact);
                return Ok(decision(true, reason, filtered));
            }
        }

        Ok(decision(
            false,
            "no matching allow rule".to_string(),
            Map::new(),
        ))
    }

    fn has_policy(&self, name: &str) -> bool {
        self.policies
            .read()
            .map(|p| p.contains_key(name))
            .unwrap_or(false)
    }

    fn loaded_policies(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .policies
            .read()
            .map(|p| p.keys().cloned().collect())
            .unwrap_or_default();
        names.sort();
        names
    }
}

fn parse_query(query: &str) -> Result<(&str, &str), PolicyEvalError> {
    let rest = query.strip_prefix("data.").unwrap_or(query);
    rest.rsplit_once('.')
        .ok_or_else(|| PolicyEvalError::NoSuchPolicy {
            query: query.to_string(),
        })
}

fn decision(allow: bool, reason: String, filtered_parameters: Map<String, Value>) -> Value {
    json!({
        "allow": allow,
        "reason": reason,
        "filtered_parameters": Value::Object(filtered_parameters),
    })
}

fn compile_rules(rules: &[Rule], issues: &mut Vec<ValidationIssue>) -> Vec<CompiledRule> {
    rules
        .iter()
        .map(|rule| CompiledRule {
            rule: rule.clone(),
            tools: maybe_globs(&rule.when.tools, "tools", issues),
            servers: maybe_globs(&rule.when.servers, "servers", issues),
        })
        .collect()
}

fn maybe_globs(
    patterns: &[String],
    what: &str,
    issues: &mut Vec<ValidationIssue>,
) -> Option<GlobSet> {
    if patterns.is_empty() {
        None
    } else {
        Some(compile_globs(patterns, what, issues))
    }
}

fn compile_globs(patterns: &[String], what: &str, issues: &mut Vec<ValidationIssue>) -> GlobSet {
    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        match Glob::new(pattern) {
            Ok(glob) => {
                builder.add(glob);
            }
            Err(err) => issues.push(ValidationIssue {
                severity: Severity::Critical,
                code: "INVALID_GLOB",
                message: format!("invalid {what} pattern '{pattern}': {err}"),
                suggestion: None,
            }),
        }
    }
    builder.build().unwrap_or_else(|_| GlobSet::empty())
}

struct EvalInput<'a> {
    role: &'a str,
    teams: Vec<&'a str>,
    trust: TrustLevel,
    sensitivity: Sensitivity,
    mfa_verified: bool,
    environment: Option<&'a str>,
    tool: &'a str,
    server: &'a str,
    parameters: Map<String, Value>,
    extra: Option<&'a Map<String, Value>>,
}

impl<'a> EvalInput<'a> {
    fn parse(input: &'a Value) -> Result<Self, PolicyEvalError> {
        let principal = input
            .get("principal")
            .and_then(Value::as_object)
            .ok_or_else(|| PolicyEvalError::MalformedInput {
                detail: "input.principal missing".to_string(),
            })?;
        let role = principal
            .get("role")
            .and_then(Value::as_str)
            .ok_or_else(|| PolicyEvalError::MalformedInput {
                detail: "input.principal.role missing".to_string(),
            })?;
        let teams = principal
            .get("teams")
            .and_then(Value::as_array)
            .map(|a| a.iter().filter_map(Value::as_str).collect())
            .unwrap_or_default();
        let trust = principal
            .get("trust_level")
            .and_then(Value::as_str)
            .map(|s| match s {
                "untrusted" => TrustLevel::Untrusted,
                "trusted" => TrustLevel::Trusted,
                _ => TrustLevel::Standard,
            })
            .unwrap_or(TrustLevel::Standard);
        let sensitivity = input
            .get("sensitivity")
            .and_then(Value::as_str)
            .map(|s| {
                s.parse().map_err(|_| PolicyEvalError::MalformedInput {
                    detail: format!("unknown sensitivity '{s}'"),
                })
            })
            .transpose()?
            .unwrap_or_default();
        let parameters = input
            .get("parameters")
            .and_then(Value::as_object)
            .cloned()
            .unwrap_or_default();

        Ok(Self {
            role,
            teams,
            trust,
            sensitivity,
            mfa_verified: input
                .get("mfa_verified")
                .and_then(Value::as_bool)
                .unwrap_or(false),
            environment: input.get("environment").and_then(Value::as_str),
            tool: input.get("tool").and_then(Value::as_str).unwrap_or(""),
            server: input.get("server").and_then(Value::as_str).unwrap_or(""),
            parameters,
            extra: input.get("extra").and_then(Value::as_object),
        })
    }
}

fn matches(compiled: &CompiledRule, input: &EvalInput<'_>) -> bool {
    let when: &RuleCondition = &compiled.rule.when;

    if !when.roles.is_empty() && !when.roles.iter().any(|r| r == input.role) {
        return false;
    }
    if !when.teams.is_empty() && !when.teams.iter().any(|t| input.teams.contains(&t.as_str())) {
        return false;
    }
    if let Some(min_trust) = when.trust_at_least {
        if input.trust < min_trust {
            return false;
        }
    }
    if let Some(min) = when.min_sensitivity {
        if input.sensitivity < min {
            return false;
        }
    }
    if let Some(max) = when.max_sensitivity {
        if input.sensitivity > max {
            return false;
        }
    }
    if let Some(required) = when.mfa_verified {
        if input.mfa_verified != required {
            return false;
        }
    }
    if !when.environments.is_empty() {
        match input.environment {
            Some(env) if when.environments.iter().any(|e| e == env) => {}
            _ => return false,
        }
    }
    if let Some(tools) = &compiled.tools {
        if !tools.is_match(input.tool) {
            return false;
        }
    }
    if let Some(servers) = &compiled.servers {
        if !servers.is_match(input.server) {
            return false;
        }
    }
    if !when.extra_equals.is_empty() {
        let Some(extra) = input.extra else {
            return false;
        };
        for (key, expected) in &when.extra_equals {
            if extra.get(key) != Some(expected) {
                return false;
            }
        }
    }
    true
}

fn redact_parameters(parameters: &Map<String, Value>, redact: &GlobSet) -> Map<String, Value> {
    parameters
        .iter()
        .filter(|(key, _)| !redact.is_match(key.as_str()))
        .map(|(key, value)| (key.clone(), value.clone()))
        .collect()
}
