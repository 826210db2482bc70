//! Policy validation gate.
//!
//! Every load passes through here before activation: a syntactic parse
//! check, presence of the required `allow` and `deny` rule groups, and a
//! scan for forbidden constructs (unconditional allow rules, outbound
//! network calls, process execution, filesystem access, disallowed context
//! keys). A rejected policy never becomes active.

use regex::Regex;
use serde::Serialize;

use crate::document::PolicyDocument;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Info,
    Low,
    Medium,
    High,
    Critical,
}

#[derive(Debug, Clone, Serialize)]
pub struct ValidationIssue {
    pub severity: Severity,
    /// Stable issue code, e.g. `FORBIDDEN_HTTP_SEND`.
    pub code: &'static str,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub suggestion: Option<String>,
}

impl ValidationIssue {
    fn critical(code: &'static str, message: impl Into<String>) -> Self {
        Self {
            severity: Severity::Critical,
            code,
            message: message.into(),
            suggestion: None,
        }
    }

    fn high(code: &'static str, message: impl Into<String>) -> Self {
        Self {
            severity: Severity::High,
            code,
            message: message.into(),
            suggestion: None,
        }
    }

    fn with_suggestion(mut self, suggestion: impl Into<String>) -> Self {
        self.suggestion = Some(suggestion.into());
        self
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ValidationResult {
    pub valid: bool,
    pub policy_name: String,
    pub issues: Vec<ValidationIssue>,
}

impl ValidationResult {
    pub fn critical_issues(&self) -> impl Iterator<Item = &ValidationIssue> {
        self.issues
            .iter()
            .filter(|i| i.severity == Severity::Critical)
    }

    pub fn issue_summaries(&self) -> Vec<String> {
        self.issues
            .iter()
            .map(|i| format!("{}: {}", i.code, i.message))
            .collect()
    }
}

/// Text patterns that must never appear in policy source. Declarative
/// documents have no business naming I/O primitives; their presence means
/// someone is trying to smuggle behavior past the gate.
struct ForbiddenPattern {
    code: &'static str,
    pattern: &'static str,
    message: &'static str,
}

const FORBIDDEN_PATTERNS: &[ForbiddenPattern] = &[
    ForbiddenPattern {
        code: "FORBIDDEN_HTTP_SEND",
        pattern: r"http\.send|http_send|net\.lookup|fetch\s*\(",
        message: "policy source references outbound network calls",
    },
    ForbiddenPattern {
        code: "FORBIDDEN_EXEC",
        pattern: r"\bexec\b|\bsubprocess\b|\bspawn\b",
        message: "policy source references process execution",
    },
    ForbiddenPattern {
        code: "FORBIDDEN_FILE_ACCESS",
        pattern: r"file://|io\.open|\bfilesystem\b",
        message: "policy source references filesystem access",
    },
    ForbiddenPattern {
        code: "FORBIDDEN_EVAL",
        pattern: r"\beval\b|opa\.runtime",
        message: "policy source references dynamic evaluation",
    },
];

/// Context keys policies may not constrain on; these carry upstream
/// credentials that must stay opaque to policy authors.
const DISALLOWED_CONTEXT_KEYS: &[&str] = &["auth_token", "api_key", "session_secret"];

pub struct PolicyValidator {
    /// In strict mode, high-severity issues also reject the load.
    strict: bool,
}

impl Default for PolicyValidator {
    fn default() -> Self {
        Self { strict: true }
    }
}

impl PolicyValidator {
    pub fn new(strict: bool) -> Self {
        Self { strict }
    }

    /// Run the full gate over raw policy source. Returns the parsed document
    /// alongside the result so callers compile exactly what was vetted.
    pub fn validate(&self, name: &str, source: &str) -> (Option<PolicyDocument>, ValidationResult) {
        let mut issues = Vec::new();

        let document = match PolicyDocument::from_yaml(source) {
            Ok(doc) => Some(doc),
            Err(err) => {
                issues.push(ValidationIssue::critical(
                    "SYNTAX_ERROR",
                    format!("policy does not parse: {err}"),
                ));
                None
            }
        };

        if let Some(doc) = &document {
            issues.extend(self.check_required_rules(doc));
            issues.extend(self.check_unconditional_allow(doc));
            issues.extend(self.check_disallowed_context_keys(doc));
        }
        issues.extend(self.scan_forbidden_patterns(source));

        let rejecting = issues.iter().any(|i| {
            i.severity == Severity::Critical || (self.strict && i.severity == Severity::High)
        });

        let result = ValidationResult {
            valid: !rejecting,
            policy_name: name.to_string(),
            issues,
        };
        if !result.valid {
            tracing::warn!(
                policy = name,
                issues = result.issues.len(),
                "policy rejected by validation gate"
            );
        }
        (document, result)
    }

    fn check_required_rules(&self, doc: &PolicyDocument) -> Vec<ValidationIssue> {
        let mut issues = Vec::new();
        if doc.rules.allow.is_empty() {
            issues.push(
                ValidationIssue::critical(
                    "MISSING_REQUIRED_RULE",
                    "policy defines no allow rules",
                )
                .with_suggestion("add at least one allow rule with conditions"),
            );
        }
        if doc.rules.deny.is_empty() {
            issues.push(
                ValidationIssue::critical("MISSING_REQUIRED_RULE", "policy defines no deny rules")
                    .with_suggestion("add at least one deny rule, even a narrow one"),
            );
        }
        issues
    }

    fn check_unconditional_allow(&self, doc: &PolicyDocument) -> Vec<ValidationIssue> {
        doc.rules
            .allow
            .iter()
            .filter(|rule| rule.when.is_unconditional())
            .map(|rule| {
                ValidationIssue::critical(
                    "UNCONDITIONAL_ALLOW",
                    format!(
                        "allow rule '{}' has no conditions and would grant everything",
                        rule.display_name()
                    ),
                )
            })
            .collect()
    }

    fn check_disallowed_context_keys(&self, doc: &PolicyDocument) -> Vec<ValidationIssue> {
        let mut issues = Vec::new();
        for rule in doc.rules.allow.iter().chain(doc.rules.deny.iter()) {
            for key in rule.when.extra_equals.keys() {
                if DISALLOWED_CONTEXT_KEYS.contains(&key.as_str()) {
                    issues.push(ValidationIssue::high(
                        "DISALLOWED_CONTEXT_KEY",
                        format!(
                            "rule '{}' constrains on reserved context key '{}'",
                            rule.display_name(),
                            key
                        ),
                    ));
                }
            }
        }
        issues
    }

    fn scan_forbidden_patterns(&self, source: &str) -> Vec<ValidationIssue> {
        let mut issues = Vec::new();
        for forbidden in FORBIDDEN_PATTERNS {
            // Patterns are static and known-good; a compile failure here is
            // a programming error, surfaced as an internal issue.
            let Ok(re) = Regex::new(forbidden.pattern) else {
                issues.push(ValidationIssue::critical(
                    "VALIDATOR_INTERNAL",
                    "forbidden-pattern regex failed to compile",
                ));
                continue;
            };
            if re.is_match(source) {
                issues.push(ValidationIssue::critical(forbidden.code, forbidden.message));
            }
        }
        issues
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const VALID: &str = r#"
package: gateway
rules:
  allow:
    - when:
        roles: [developer]
        max_sensitivity: medium
  deny:
    - when:
        min_sensitivity: high
        mfa_verified: false
      reason: "mfa required"
"#;

    #[test]
    fn valid_policy_passes() {
        let validator = PolicyValidator::default();
        let (doc, result) = validator.validate("gateway", VALID);
        assert!(result.valid, "issues: {:?}", result.issues);
        assert!(doc.is_some());
    }

    #[test]
    fn syntax_error_is_critical() {
        let validator = PolicyValidator::default();
        let (doc, result) = validator.validate("bad", "rules: [not: {a map");
        assert!(!result.valid);
        assert!(doc.is_none());
        assert!(result.critical_issues().any(|i| i.code == "SYNTAX_ERROR"));
    }

    #[test]
    fn missing_deny_group_rejects() {
        let source = r#"
package: gateway
rules:
  allow:
    - when:
        roles: [admin]
"#;
        let (_, result) = PolicyValidator::default().validate("gateway", source);
        assert!(!result.valid);
        assert!(result
            .critical_issues()
            .any(|i| i.code == "MISSING_REQUIRED_RULE"));
    }

    #[test]
    fn unconditional_allow_rejects() {
        let source = r#"
package: gateway
rules:
  allow:
    - name: wide-open
      when: {}
  deny:
    - when:
        min_sensitivity: critical
"#;
        let (_, result) = PolicyValidator::default().validate("gateway", source);
        assert!(!result.valid);
        assert!(result
            .critical_issues()
            .any(|i| i.code == "UNCONDITIONAL_ALLOW"));
    }

    #[test]
    fn network_reference_rejects() {
        let source = format!("{VALID}\n# http.send is how we phone home\n");
        let (_, result) = PolicyValidator::default().validate("gateway", &source);
        assert!(!result.valid);
        assert!(result
            .critical_issues()
            .any(|i| i.code == "FORBIDDEN_HTTP_SEND"));
    }

    #[test]
    fn reserved_context_key_rejects_in_strict_mode() {
        let source = r#"
package: gateway
rules:
  allow:
    - when:
        roles: [admin]
        extra_equals:
          auth_token: "xyz"
  deny:
    - when:
        min_sensitivity: critical
"#;
        let (_, strict) = PolicyValidator::default().validate("gateway", source);
        assert!(!strict.valid);

        let (_, lenient) = PolicyValidator::new(false).validate("gateway", source);
        assert!(lenient.valid);
    }
}
