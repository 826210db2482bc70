//! Backend resolution.
//!
//! The registry maps a server name to its transport/connection config. The
//! in-memory implementation is fed from `GatewayConfig`; deployments with an
//! external catalog implement the trait themselves.

use std::collections::HashMap;

use crate::config::BackendConfig;

pub trait BackendRegistry: Send + Sync {
    fn resolve(&self, server: &str) -> Option<BackendConfig>;

    fn backend_names(&self) -> Vec<String>;
}

pub struct StaticRegistry {
    backends: HashMap<String, BackendConfig>,
}

impl StaticRegistry {
    pub fn new(backends: Vec<BackendConfig>) -> Self {
        Self {
            backends: backends
                .into_iter()
                .map(|b| (b.name.clone(), b))
                .collect(),
        }
    }
}

impl BackendRegistry for StaticRegistry {
    fn resolve(&self, server: &str) -> Option<BackendConfig> {
        self.backends.get(server).cloned()
    }

    fn backend_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.backends.keys().cloned().collect();
        names.sort();
        names
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolves_known_backends_only() {
        let registry = StaticRegistry::new(vec![BackendConfig::http("srv-a", "http://a")]);
        assert!(registry.resolve("srv-a").is_some());
        assert!(registry.resolve("srv-b").is_none());
        assert_eq!(registry.backend_names(), vec!["srv-a".to_string()]);
    }
}
