//! Decision fingerprints.
//!
//! A fingerprint is the cache key for a policy decision: a SHA-256 over the
//! semantically relevant fields of a request. Volatile fields (the exact
//! timestamp) never participate; which context fields do is configured per
//! action category, optionally including a coarse time-of-day bucket.

use chrono::Timelike;
use sha2::{Digest, Sha256};

use crate::model::AuthorizationRequest;

pub fn sha256_hex(s: &str) -> String {
    let mut h = Sha256::new();
    h.update(s.as_bytes());
    hex::encode(h.finalize())
}

/// Which parts of the request context are cache-key-significant for one
/// action category.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct FingerprintSpec {
    /// Context field names hashed into the key, in the order given.
    #[serde(default)]
    pub context_fields: Vec<String>,
    /// When set, the request timestamp is reduced to an `n`-hour bucket and
    /// hashed, so time-of-day policies stay cacheable without keying on the
    /// exact instant.
    #[serde(default)]
    pub time_bucket_hours: Option<u8>,
}

impl Default for FingerprintSpec {
    fn default() -> Self {
        Self {
            context_fields: vec!["environment".to_string(), "mfa_verified".to_string()],
            time_bucket_hours: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Fingerprint {
    pub hex: String,
    pub components: Vec<String>,
}

impl Fingerprint {
    /// Compute the fingerprint for a request under the given spec.
    pub fn compute(request: &AuthorizationRequest, spec: &FingerprintSpec) -> Self {
        let mut parts = Vec::new();

        parts.push(format!("principal={}", request.principal.id));
        parts.push(format!("role={}", request.principal.role));
        parts.push(format!("action={}", request.action));
        parts.push(format!("server={}", request.server));
        parts.push(format!("tool={}", request.tool));
        parts.push(format!("sensitivity={}", request.sensitivity));

        for field in &spec.context_fields {
            let value = request
                .context
                .field(field)
                .map(|v| v.to_string())
                .unwrap_or_default();
            parts.push(format!("ctx.{field}={value}"));
        }

        if let Some(hours) = spec.time_bucket_hours.filter(|h| *h > 0) {
            if let Some(ts) = request.context.timestamp {
                let bucket = ts.hour() / u32::from(hours);
                parts.push(format!("time_bucket={bucket}"));
            }
        }

        let raw = parts.join("\n");
        Fingerprint {
            hex: sha256_hex(&raw),
            components: parts,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Action, Principal, RequestContext};

    fn request(id: &str, mfa: bool) -> AuthorizationRequest {
        AuthorizationRequest::new(
            Principal::new(id, "developer"),
            Action::ToolInvoke,
            "srv-a",
            "query",
        )
        .unwrap()
        .with_context(RequestContext::now().with_mfa_verified(mfa))
    }

    #[test]
    fn identical_requests_share_a_fingerprint() {
        let spec = FingerprintSpec::default();
        let a = Fingerprint::compute(&request("u-1", true), &spec);
        let b = Fingerprint::compute(&request("u-1", true), &spec);
        assert_eq!(a.hex, b.hex);
    }

    #[test]
    fn significant_context_changes_the_key() {
        let spec = FingerprintSpec::default();
        let with_mfa = Fingerprint::compute(&request("u-1", true), &spec);
        let without = Fingerprint::compute(&request("u-1", false), &spec);
        assert_ne!(with_mfa.hex, without.hex);
    }

    #[test]
    fn exact_timestamp_is_never_significant() {
        let spec = FingerprintSpec {
            context_fields: vec![],
            time_bucket_hours: None,
        };
        let mut first = request("u-1", true);
        let mut second = request("u-1", true);
        first.context.timestamp = Some(chrono::Utc::now());
        second.context.timestamp = first
            .context
            .timestamp
            .map(|t| t + chrono::Duration::seconds(59));

        let a = Fingerprint::compute(&first, &spec);
        let b = Fingerprint::compute(&second, &spec);
        assert_eq!(a.hex, b.hex);
    }

    #[test]
    fn unlisted_context_fields_do_not_affect_the_key() {
        let spec = FingerprintSpec {
            context_fields: vec!["environment".to_string()],
            time_bucket_hours: None,
        };
        let mut a = request("u-1", true);
        let mut b = request("u-1", true);
        a.context.client_addr = Some("10.0.0.1".into());
        b.context.client_addr = Some("10.0.0.2".into());
        assert_eq!(
            Fingerprint::compute(&a, &spec).hex,
            Fingerprint::compute(&b, &spec).hex
        );
    }
}
