//! # Route Table
//!
//! Maps inbound path prefixes to logical service names using the `matchit`
//! radix tree. A prefix `P` is inserted twice, as `P` and `P/*rest`, so both
//! `/api/legal` and `/api/legal/anything/below` resolve to the same service.
//! A root prefix (`/`) acts as a catch-all consulted only when no other
//! prefix matches.
//!
//! matchit does not allow a catch-all to share a level with other segments,
//! so nested prefixes such as `/api` plus `/api/legal` are rejected at
//! construction time.

use matchit::{Match, Router as RadixRouter};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::core::error::{GatewayError, GatewayResult};
use crate::load_balancing::LoadBalancingStrategy;

fn default_strip_prefix() -> bool {
    true
}

/// A configured prefix and the service it forwards to
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RouteDefinition {
    pub prefix: String,
    pub service: String,
    /// Drop the matched prefix before forwarding
    #[serde(default = "default_strip_prefix")]
    pub strip_prefix: bool,
    /// Overrides the gateway-wide default strategy for this route
    #[serde(default)]
    pub strategy: Option<LoadBalancingStrategy>,
}

impl RouteDefinition {
    pub fn new(prefix: impl Into<String>, service: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
            service: service.into(),
            strip_prefix: true,
            strategy: None,
        }
    }

    pub fn keep_prefix(mut self) -> Self {
        self.strip_prefix = false;
        self
    }

    pub fn with_strategy(mut self, strategy: LoadBalancingStrategy) -> Self {
        self.strategy = Some(strategy);
        self
    }

    /// Leading slash, no trailing slash; the root prefix is `/`.
    fn normalized_prefix(&self) -> String {
        let trimmed = self.prefix.trim().trim_end_matches('/');
        if trimmed.is_empty() {
            "/".to_string()
        } else if trimmed.starts_with('/') {
            trimmed.to_string()
        } else {
            format!("/{}", trimmed)
        }
    }
}

/// Outcome of resolving an inbound path
#[derive(Debug, Clone, PartialEq)]
pub struct RouteMatch {
    pub service: String,
    /// Path to request on the selected instance
    pub forward_path: String,
    pub strategy: Option<LoadBalancingStrategy>,
}

#[derive(Debug)]
struct CompiledRoute {
    definition: RouteDefinition,
}

impl CompiledRoute {
    fn matched(&self, path: &str, rest: Option<&str>) -> RouteMatch {
        let forward_path = if self.definition.strip_prefix {
            match rest {
                Some(rest) if !rest.is_empty() => format!("/{}", rest),
                _ => "/".to_string(),
            }
        } else if path.is_empty() {
            "/".to_string()
        } else {
            path.to_string()
        };

        RouteMatch {
            service: self.definition.service.clone(),
            forward_path,
            strategy: self.definition.strategy,
        }
    }
}

/// Immutable prefix table built once from configuration
pub struct RouteTable {
    router: RadixRouter<Arc<CompiledRoute>>,
    root: Option<Arc<CompiledRoute>>,
    definitions: Vec<RouteDefinition>,
}

impl std::fmt::Debug for RouteTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RouteTable")
            .field("routes", &self.definitions)
            .finish()
    }
}

impl RouteTable {
    pub fn new(definitions: Vec<RouteDefinition>) -> GatewayResult<Self> {
        let mut router = RadixRouter::new();
        let mut root = None;

        for definition in &definitions {
            if definition.service.trim().is_empty() {
                return Err(GatewayError::config(format!(
                    "Route '{}' has an empty service name",
                    definition.prefix
                )));
            }

            let prefix = definition.normalized_prefix();
            if prefix.contains([':', '*', '{', '}']) {
                return Err(GatewayError::config(format!(
                    "Route prefix '{}' must be a literal path",
                    definition.prefix
                )));
            }

            let compiled = Arc::new(CompiledRoute {
                definition: definition.clone(),
            });

            if prefix == "/" {
                if root.is_some() {
                    return Err(GatewayError::config("Duplicate root route '/'"));
                }
                root = Some(compiled);
                continue;
            }

            for pattern in [prefix.clone(), format!("{}/*rest", prefix)] {
                router.insert(pattern.as_str(), compiled.clone()).map_err(|e| {
                    GatewayError::config(format!(
                        "Failed to add route '{}' -> '{}': {}",
                        prefix, definition.service, e
                    ))
                })?;
            }
        }

        Ok(Self {
            router,
            root,
            definitions,
        })
    }

    pub fn empty() -> Self {
        Self {
            router: RadixRouter::new(),
            root: None,
            definitions: Vec::new(),
        }
    }

    /// Resolve a request path (without query string) to a service.
    pub fn resolve(&self, path: &str) -> Option<RouteMatch> {
        if let Ok(Match { value, params }) = self.router.at(path) {
            return Some(value.matched(path, params.get("rest")));
        }
        // `/api/legal/` with an empty remainder
        let trimmed = path.trim_end_matches('/');
        if trimmed.len() != path.len() && !trimmed.is_empty() {
            if let Ok(Match { value, .. }) = self.router.at(trimmed) {
                return Some(value.matched(trimmed, None));
            }
        }

        let root = self.root.as_ref()?;
        let rest = path.trim_start_matches('/');
        Some(root.matched(path, Some(rest)))
    }

    pub fn routes(&self) -> &[RouteDefinition] {
        &self.definitions
    }

    /// Normalized prefixes, in configuration order
    pub fn prefixes(&self) -> Vec<String> {
        self.definitions.iter().map(|d| d.normalized_prefix()).collect()
    }

    pub fn is_empty(&self) -> bool {
        self.definitions.is_empty()
    }

    pub fn len(&self) -> usize {
        self.definitions.len()
    }
}

impl Default for RouteTable {
    fn default() -> Self {
        Self::empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table() -> RouteTable {
        RouteTable::new(vec![
            RouteDefinition::new("/api/legal", "legal-concept-service"),
            RouteDefinition::new("/api/billing/", "billing-service").keep_prefix(),
            RouteDefinition::new("/api/search", "search-service")
                .with_strategy(LoadBalancingStrategy::LeastConnections),
        ])
        .unwrap()
    }

    #[test]
    fn test_prefix_match_strips_prefix() {
        let table = table();
        let m = table.resolve("/api/legal/concepts/42").unwrap();
        assert_eq!(m.service, "legal-concept-service");
        assert_eq!(m.forward_path, "/concepts/42");

        let m = table.resolve("/api/legal").unwrap();
        assert_eq!(m.forward_path, "/");
        let m = table.resolve("/api/legal/").unwrap();
        assert_eq!(m.forward_path, "/");
    }

    #[test]
    fn test_keep_prefix_forwards_full_path() {
        let m = table().resolve("/api/billing/invoices").unwrap();
        assert_eq!(m.service, "billing-service");
        assert_eq!(m.forward_path, "/api/billing/invoices");
    }

    #[test]
    fn test_route_strategy_is_carried() {
        let m = table().resolve("/api/search/q").unwrap();
        assert_eq!(m.strategy, Some(LoadBalancingStrategy::LeastConnections));
    }

    #[test]
    fn test_unmatched_paths() {
        let table = table();
        assert!(table.resolve("/api/unknown").is_none());
        assert!(table.resolve("/api/legalese").is_none());
        assert!(table.resolve("/").is_none());
    }

    #[test]
    fn test_root_route_is_fallback() {
        let table = RouteTable::new(vec![
            RouteDefinition::new("/api/legal", "legal-concept-service"),
            RouteDefinition::new("/", "web-frontend"),
        ])
        .unwrap();
        assert_eq!(table.resolve("/api/legal/x").unwrap().service, "legal-concept-service");

        let m = table.resolve("/index.html").unwrap();
        assert_eq!(m.service, "web-frontend");
        assert_eq!(m.forward_path, "/index.html");
    }

    #[test]
    fn test_invalid_definitions_rejected() {
        assert!(RouteTable::new(vec![RouteDefinition::new("/api/:id", "svc")]).is_err());
        assert!(RouteTable::new(vec![RouteDefinition::new("/api", " ")]).is_err());
        assert!(RouteTable::new(vec![
            RouteDefinition::new("/api", "a"),
            RouteDefinition::new("/api", "b"),
        ])
        .is_err());
    }

    #[test]
    fn test_route_definition_deserializes_with_defaults() {
        let yaml = "prefix: /api/legal\nservice: legal-concept-service\n";
        let def: RouteDefinition = serde_yaml::from_str(yaml).unwrap();
        assert!(def.strip_prefix);
        assert!(def.strategy.is_none());
        assert_eq!(table().prefixes()[1], "/api/billing");
    }
}
