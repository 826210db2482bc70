//! Policy source integration.
//!
//! `PolicyStore` sits between an external policy source and the evaluator:
//! updates are applied through the evaluator's gate, version counters track
//! what is active, and a failed update leaves the previous version in force
//! while reporting the rejection to the caller.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use sark_core::errors::GatewayError;

use crate::evaluator::PolicyEvaluator;

#[derive(Debug, Clone)]
pub struct PolicyVersion {
    pub version: u64,
    pub source_hash: String,
}

pub struct PolicyStore {
    evaluator: Arc<dyn PolicyEvaluator>,
    versions: RwLock<HashMap<String, PolicyVersion>>,
}

impl PolicyStore {
    pub fn new(evaluator: Arc<dyn PolicyEvaluator>) -> Self {
        Self {
            evaluator,
            versions: RwLock::new(HashMap::new()),
        }
    }

    pub fn evaluator(&self) -> Arc<dyn PolicyEvaluator> {
        self.evaluator.clone()
    }

    /// Apply a policy update from the source. On rejection the active
    /// version is untouched and the error carries the gate's issue list.
    pub fn apply_update(&self, name: &str, source: &str) -> Result<PolicyVersion, GatewayError> {
        match self.evaluator.load_policy(name, source) {
            Ok(()) => {
                let hash = sark_core::fingerprint::sha256_hex(source);
                let mut versions = match self.versions.write() {
                    Ok(v) => v,
                    Err(poisoned) => poisoned.into_inner(),
                };
                let entry = versions
                    .entry(name.to_string())
                    .and_modify(|v| {
                        v.version += 1;
                        v.source_hash = hash.clone();
                    })
                    .or_insert(PolicyVersion {
                        version: 1,
                        source_hash: hash,
                    });
                tracing::info!(policy = name, version = entry.version, "policy updated");
                Ok(entry.clone())
            }
            Err(err) => {
                tracing::warn!(policy = name, "policy update rejected, prior version kept");
                Err(GatewayError::PolicyCompilation {
                    name: name.to_string(),
                    issues: err.issue_summaries(),
                })
            }
        }
    }

    pub fn active_version(&self, name: &str) -> Option<PolicyVersion> {
        self.versions.read().ok()?.get(name).cloned()
    }

    pub fn loaded_policies(&self) -> Vec<String> {
        self.evaluator.loaded_policies()
    }
}
