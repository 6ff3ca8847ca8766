use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

pub type ServiceLabel = String;

/// Joins a primary cluster name and a nested cluster name.
pub const CLUSTER_SEPARATOR: &str = "-";

/// Which tier of the two-tier cluster addressing scheme something belongs to.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ClusterRole {
    #[default]
    Primary,
    Secondary,
}

impl ClusterRole {
    pub fn label(&self) -> &'static str {
        match self {
            ClusterRole::Primary => "primary",
            ClusterRole::Secondary => "secondary",
        }
    }
}

impl fmt::Display for ClusterRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Qualifies a secondary cluster name with its primary.
///
/// A secondary that already carries the primary as a prefix is returned as-is, so
/// applying this twice gives the same result.
pub fn qualify_secondary(primary: &str, secondary: &str) -> String {
    let prefix = format!("{}{}", primary, CLUSTER_SEPARATOR);
    if secondary.starts_with(&prefix) {
        secondary.to_string()
    } else {
        format!("{}{}", prefix, secondary)
    }
}

/// The active (or requested) primary/secondary cluster pair.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ClusterPair {
    pub primary: String,
    pub secondary: Option<String>,
}

impl ClusterPair {
    pub fn new(primary: impl Into<String>, secondary: Option<String>) -> Self {
        let secondary = secondary
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty());
        Self {
            primary: primary.into().trim().to_string(),
            secondary,
        }
    }

    /// Fully qualified name of the secondary cluster, if one is configured.
    pub fn qualified_secondary(&self) -> Option<String> {
        self.secondary
            .as_deref()
            .map(|s| qualify_secondary(&self.primary, s))
    }

    /// Cluster name addressed by `role`, if that role is configured.
    pub fn cluster(&self, role: ClusterRole) -> Option<String> {
        match role {
            ClusterRole::Primary => Some(self.primary.clone()),
            ClusterRole::Secondary => self.qualified_secondary(),
        }
    }

    /// The cluster the dashboard switches its active context to.
    pub fn target_cluster(&self) -> String {
        self.qualified_secondary()
            .unwrap_or_else(|| self.primary.clone())
    }

    pub fn display(&self) -> String {
        match &self.secondary {
            Some(s) => format!("{} / {}", self.primary, s),
            None => self.primary.clone(),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ServiceKind {
    Tunnel,
    Proxy,
}

impl ServiceKind {
    pub fn label(&self) -> &'static str {
        match self {
            ServiceKind::Tunnel => "tunnel",
            ServiceKind::Proxy => "proxy",
        }
    }
}

/// What a supervised service actually runs.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ServiceTarget {
    /// Port-forward from a local port to a service inside a cluster context
    Tunnel {
        context: String,
        namespace: String,
        service: String,
        local_port: u16,
        remote_port: u16,
    },
    /// Local helper process exposing a capability on a local port
    Proxy {
        command: String,
        args: Vec<String>,
        env: BTreeMap<String, String>,
        listen_port: Option<u16>,
        depends_on: Vec<ServiceLabel>,
    },
}

/// Immutable description of one supervised service.
///
/// Replaced wholesale when the active cluster pair changes.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ServiceConfig {
    pub label: ServiceLabel,
    pub role: ClusterRole,
    pub target: ServiceTarget,
}

impl ServiceConfig {
    pub fn kind(&self) -> ServiceKind {
        match self.target {
            ServiceTarget::Tunnel { .. } => ServiceKind::Tunnel,
            ServiceTarget::Proxy { .. } => ServiceKind::Proxy,
        }
    }

    pub fn is_proxy(&self) -> bool {
        self.kind() == ServiceKind::Proxy
    }

    /// Local port the service exposes, if any.
    pub fn local_port(&self) -> Option<u16> {
        match &self.target {
            ServiceTarget::Tunnel { local_port, .. } => Some(*local_port),
            ServiceTarget::Proxy { listen_port, .. } => *listen_port,
        }
    }

    /// One-line human description used by the config overlay and `check`.
    pub fn describe(&self) -> String {
        match &self.target {
            ServiceTarget::Tunnel {
                context,
                namespace,
                service,
                local_port,
                remote_port,
            } => format!(
                "{}/{}/svc/{} {}:{}",
                context, namespace, service, local_port, remote_port
            ),
            ServiceTarget::Proxy {
                command,
                args,
                listen_port,
                ..
            } => {
                let port = listen_port.map(|p| format!(" :{}", p)).unwrap_or_default();
                if args.is_empty() {
                    format!("{}{}", command, port)
                } else {
                    format!("{} {}{}", command, args.join(" "), port)
                }
            }
        }
    }
}
