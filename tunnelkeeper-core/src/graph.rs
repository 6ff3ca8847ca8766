//! Proxy -> tunnel dependency tracking.
//!
//! The graph is advisory: it orders the initial batch of starts and tells the UI
//! which proxies are sitting on a tunnel that is down. It never blocks a start or
//! stop of an individual service.

use std::collections::{BTreeMap, BTreeSet};

use crate::model::{ClusterRole, ServiceConfig, ServiceLabel, ServiceTarget};

const NAME_SUFFIXES: [&str; 2] = ["-proxy", "-tunnel"];

/// Name a service shares with its counterparts, e.g. `metrics` for
/// `metrics-proxy` and `metrics-tunnel`.
fn stem(label: &str) -> &str {
    NAME_SUFFIXES
        .iter()
        .find_map(|suffix| label.strip_suffix(suffix))
        .unwrap_or(label)
}

#[derive(Clone, Debug, Default)]
pub struct DependencyGraph {
    requires: BTreeMap<ServiceLabel, BTreeSet<ServiceLabel>>,
    tunnels: BTreeSet<ServiceLabel>,
    proxies: BTreeSet<ServiceLabel>,
}

impl DependencyGraph {
    /// Derives prerequisites for every proxy.
    ///
    /// Explicit `depends_on` entries win. Otherwise a proxy requires the tunnels of
    /// the same cluster role whose label has the same stem.
    pub fn build(services: &[ServiceConfig]) -> Self {
        let tunnel_roles: BTreeMap<&str, ClusterRole> = services
            .iter()
            .filter(|s| !s.is_proxy())
            .map(|s| (s.label.as_str(), s.role))
            .collect();

        let mut graph = DependencyGraph {
            tunnels: tunnel_roles.keys().map(|l| l.to_string()).collect(),
            ..Self::default()
        };

        for svc in services {
            let ServiceTarget::Proxy { depends_on, .. } = &svc.target else {
                continue;
            };
            graph.proxies.insert(svc.label.clone());

            let required: BTreeSet<ServiceLabel> = if depends_on.is_empty() {
                tunnel_roles
                    .iter()
                    .filter(|(label, role)| {
                        **role == svc.role && stem(label) == stem(&svc.label)
                    })
                    .map(|(label, _)| label.to_string())
                    .collect()
            } else {
                depends_on
                    .iter()
                    .filter(|dep| tunnel_roles.contains_key(dep.as_str()))
                    .cloned()
                    .collect()
            };

            if !required.is_empty() {
                graph.requires.insert(svc.label.clone(), required);
            }
        }

        graph
    }

    pub fn requires(&self, label: &str) -> impl Iterator<Item = &ServiceLabel> {
        self.requires.get(label).into_iter().flatten()
    }

    /// Proxies that require `tunnel`.
    pub fn dependents(&self, tunnel: &str) -> Vec<&ServiceLabel> {
        self.requires
            .iter()
            .filter(|(_, deps)| deps.contains(tunnel))
            .map(|(proxy, _)| proxy)
            .collect()
    }

    /// Start order: every tunnel before any proxy that requires it.
    pub fn topo_order(&self) -> Vec<ServiceLabel> {
        fn visit(
            label: &str,
            graph: &DependencyGraph,
            visited: &mut BTreeSet<String>,
            result: &mut Vec<String>,
        ) {
            if !visited.insert(label.to_string()) {
                return;
            }
            for dep in graph.requires(label) {
                visit(dep, graph, visited, result);
            }
            result.push(label.to_string());
        }

        let mut result = Vec::new();
        let mut visited = BTreeSet::new();
        for label in self.tunnels.iter().chain(self.proxies.iter()) {
            visit(label, self, &mut visited, &mut result);
        }
        result
    }

    /// Required tunnels of `label` for which `is_running` is false.
    pub fn blocked_on<F>(&self, label: &str, is_running: F) -> Vec<ServiceLabel>
    where
        F: Fn(&str) -> bool,
    {
        self.requires(label)
            .filter(|dep| !is_running(dep))
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.tunnels.len() + self.proxies.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn tunnel(label: &str, role: ClusterRole) -> ServiceConfig {
        ServiceConfig {
            label: label.into(),
            role,
            target: ServiceTarget::Tunnel {
                context: "ctx".into(),
                namespace: "ns".into(),
                service: "svc".into(),
                local_port: 1,
                remote_port: 1,
            },
        }
    }

    fn proxy(label: &str, role: ClusterRole, depends_on: &[&str]) -> ServiceConfig {
        ServiceConfig {
            label: label.into(),
            role,
            target: ServiceTarget::Proxy {
                command: "proxy".into(),
                args: vec![],
                env: BTreeMap::new(),
                listen_port: None,
                depends_on: depends_on.iter().map(|s| s.to_string()).collect(),
            },
        }
    }

    #[test]
    fn test_naming_convention_matches_same_role() {
        let services = vec![
            tunnel("metrics-tunnel", ClusterRole::Primary),
            tunnel("edge-metrics-tunnel", ClusterRole::Secondary),
            proxy("metrics-proxy", ClusterRole::Primary, &[]),
            proxy("edge-metrics-proxy", ClusterRole::Secondary, &[]),
        ];
        let graph = DependencyGraph::build(&services);

        let deps: Vec<_> = graph.requires("metrics-proxy").collect();
        assert_eq!(deps, vec!["metrics-tunnel"]);
        let deps: Vec<_> = graph.requires("edge-metrics-proxy").collect();
        assert_eq!(deps, vec!["edge-metrics-tunnel"]);
    }

    #[test]
    fn test_role_mismatch_is_not_a_dependency() {
        let services = vec![
            tunnel("metrics-tunnel", ClusterRole::Secondary),
            proxy("metrics-proxy", ClusterRole::Primary, &[]),
        ];
        let graph = DependencyGraph::build(&services);
        assert_eq!(graph.requires("metrics-proxy").count(), 0);
    }

    #[test]
    fn test_explicit_dependencies_override_convention() {
        let services = vec![
            tunnel("metrics-tunnel", ClusterRole::Primary),
            tunnel("db", ClusterRole::Primary),
            proxy("metrics-proxy", ClusterRole::Primary, &["db", "missing"]),
        ];
        let graph = DependencyGraph::build(&services);
        let deps: Vec<_> = graph.requires("metrics-proxy").collect();
        assert_eq!(deps, vec!["db"]);
        assert_eq!(graph.dependents("db"), vec!["metrics-proxy"]);
        assert!(graph.dependents("metrics-tunnel").is_empty());
    }

    #[test]
    fn test_topo_order_puts_tunnels_before_dependents() {
        let services = vec![
            proxy("a-proxy", ClusterRole::Primary, &["z-tunnel"]),
            tunnel("z-tunnel", ClusterRole::Primary),
            proxy("standalone", ClusterRole::Primary, &[]),
        ];
        let graph = DependencyGraph::build(&services);
        let order = graph.topo_order();

        assert_eq!(order.len(), 3);
        let pos = |l: &str| order.iter().position(|s| s == l).unwrap();
        assert!(pos("z-tunnel") < pos("a-proxy"));
    }

    #[test]
    fn test_blocked_on_reports_non_running_tunnels() {
        let services = vec![
            tunnel("metrics-tunnel", ClusterRole::Primary),
            proxy("metrics-proxy", ClusterRole::Primary, &[]),
        ];
        let graph = DependencyGraph::build(&services);

        assert_eq!(
            graph.blocked_on("metrics-proxy", |_| false),
            vec!["metrics-tunnel".to_string()]
        );
        assert!(graph.blocked_on("metrics-proxy", |_| true).is_empty());
        assert!(graph.blocked_on("metrics-tunnel", |_| false).is_empty());
    }
}
