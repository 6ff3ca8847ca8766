use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::model::{ClusterPair, ClusterRole, ServiceConfig, ServiceLabel, ServiceTarget};

/// Replaced with the cluster name in the login command template.
pub const CLUSTER_PLACEHOLDER: &str = "{cluster}";
/// Replaced with the role's context name in proxy arguments.
pub const CONTEXT_PLACEHOLDER: &str = "{context}";

const CONFIG_ENV: &str = "TUNNELKEEPER_CONFIG";
const CONFIG_NAMES: [&str; 4] = [
    "tunnelkeeper.yaml",
    "tunnelkeeper.yml",
    ".tunnelkeeper.yaml",
    ".tunnelkeeper.yml",
];

/// Cluster addressing
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
pub struct ClusterSettings {
    /// Context name = prefix + cluster name
    #[serde(default)]
    pub context_prefix: String,

    /// Primary cluster to connect to at startup
    #[serde(default)]
    pub primary: Option<String>,

    /// Nested cluster within the primary
    #[serde(default)]
    pub secondary: Option<String>,
}

impl ClusterSettings {
    pub fn context_for(&self, cluster: &str) -> String {
        format!("{}{}", self.context_prefix, cluster)
    }

    /// Strips the context prefix, returning the cluster name a context addresses.
    pub fn cluster_for<'a>(&self, context: &'a str) -> Option<&'a str> {
        context
            .strip_prefix(self.context_prefix.as_str())
            .filter(|c| !c.is_empty())
    }

    pub fn initial_pair(&self) -> Option<ClusterPair> {
        self.primary
            .as_deref()
            .map(str::trim)
            .filter(|p| !p.is_empty())
            .map(|p| ClusterPair::new(p, self.secondary.clone()))
    }
}

/// External tools the collaborators shell out to
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct ToolSettings {
    /// Login command; `{cluster}` is replaced with the cluster name
    #[serde(default = "default_login")]
    pub login: Vec<String>,

    #[serde(default = "default_kubectl")]
    pub kubectl: String,
}

impl Default for ToolSettings {
    fn default() -> Self {
        Self {
            login: default_login(),
            kubectl: default_kubectl(),
        }
    }
}

fn default_login() -> Vec<String> {
    vec![
        "tsh".into(),
        "kube".into(),
        "login".into(),
        CLUSTER_PLACEHOLDER.into(),
    ]
}
fn default_kubectl() -> String {
    "kubectl".into()
}

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct Timings {
    #[serde(default = "default_health_interval")]
    pub health_interval_secs: u64,
    #[serde(default = "default_recovery_backoff")]
    pub recovery_backoff_ms: u64,
    #[serde(default = "default_login_timeout")]
    pub login_timeout_secs: u64,
    #[serde(default = "default_switch_timeout")]
    pub switch_timeout_secs: u64,
    #[serde(default = "default_health_timeout")]
    pub health_timeout_secs: u64,
    #[serde(default = "default_status_message")]
    pub status_message_secs: u64,
    #[serde(default = "default_shutdown_grace")]
    pub shutdown_grace_ms: u64,
}

impl Default for Timings {
    fn default() -> Self {
        Self {
            health_interval_secs: default_health_interval(),
            recovery_backoff_ms: default_recovery_backoff(),
            login_timeout_secs: default_login_timeout(),
            switch_timeout_secs: default_switch_timeout(),
            health_timeout_secs: default_health_timeout(),
            status_message_secs: default_status_message(),
            shutdown_grace_ms: default_shutdown_grace(),
        }
    }
}

impl Timings {
    pub fn health_interval(&self) -> Duration {
        Duration::from_secs(self.health_interval_secs)
    }
    pub fn recovery_backoff(&self) -> Duration {
        Duration::from_millis(self.recovery_backoff_ms)
    }
    pub fn login_timeout(&self) -> Duration {
        Duration::from_secs(self.login_timeout_secs)
    }
    pub fn switch_timeout(&self) -> Duration {
        Duration::from_secs(self.switch_timeout_secs)
    }
    pub fn health_timeout(&self) -> Duration {
        Duration::from_secs(self.health_timeout_secs)
    }
    pub fn status_message(&self) -> Duration {
        Duration::from_secs(self.status_message_secs)
    }
    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_ms)
    }
}

fn default_health_interval() -> u64 {
    30
}
fn default_recovery_backoff() -> u64 {
    3000
}
fn default_login_timeout() -> u64 {
    120
}
fn default_switch_timeout() -> u64 {
    15
}
fn default_health_timeout() -> u64 {
    10
}
fn default_status_message() -> u64 {
    5
}
fn default_shutdown_grace() -> u64 {
    1500
}

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct Limits {
    #[serde(default = "default_activity_log")]
    pub activity_log: usize,
    #[serde(default = "default_output_lines")]
    pub output_lines: usize,
    #[serde(default = "default_max_auto_restarts")]
    pub max_auto_restarts: u32,
}

impl Default for Limits {
    fn default() -> Self {
        Self {
            activity_log: default_activity_log(),
            output_lines: default_output_lines(),
            max_auto_restarts: default_max_auto_restarts(),
        }
    }
}

fn default_activity_log() -> usize {
    200
}
fn default_output_lines() -> usize {
    100
}
fn default_max_auto_restarts() -> u32 {
    1
}

/// Port-forward template, materialized per active cluster pair
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct TunnelTemplate {
    #[serde(default)]
    pub role: ClusterRole,
    pub namespace: String,
    pub service: String,
    pub local_port: u16,
    pub remote_port: u16,
}

/// Local proxy process template
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct ProxyTemplate {
    #[serde(default)]
    pub role: ClusterRole,

    /// Program and arguments; `{context}` is replaced with the role's context
    pub command: Vec<String>,

    #[serde(default)]
    pub env: BTreeMap<String, String>,

    #[serde(default)]
    pub listen_port: Option<u16>,

    /// Tunnels this proxy needs; inferred from labels when omitted
    #[serde(default)]
    pub depends_on: Vec<ServiceLabel>,
}

/// Root configuration file structure
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
pub struct DashboardConfig {
    #[serde(default = "default_version")]
    pub version: String,

    #[serde(default)]
    pub clusters: ClusterSettings,

    #[serde(default)]
    pub tools: ToolSettings,

    #[serde(default)]
    pub timings: Timings,

    #[serde(default)]
    pub limits: Limits,

    #[serde(default)]
    pub tunnels: BTreeMap<ServiceLabel, TunnelTemplate>,

    #[serde(default)]
    pub proxies: BTreeMap<ServiceLabel, ProxyTemplate>,
}

fn default_version() -> String {
    "1".into()
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("IO error reading {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("YAML parse error: {0}")]
    Yaml(#[from] serde_yaml::Error),
    #[error("proxy '{proxy}' depends on unknown tunnel '{dependency}'")]
    InvalidDependency { proxy: String, dependency: String },
    #[error("proxy '{proxy}' has no command specified")]
    MissingCommand { proxy: String },
    #[error("label '{label}' is used by both a tunnel and a proxy")]
    DuplicateLabel { label: String },
    #[error("local port {port} is claimed by both '{first}' and '{second}'")]
    PortConflict {
        port: u16,
        first: String,
        second: String,
    },
    #[error("login command template is empty")]
    EmptyLogin,
    #[error("no config file found, searched: {searched:?}")]
    NotFound { searched: Vec<PathBuf> },
}

impl DashboardConfig {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::parse(&content)
    }

    pub fn parse(content: &str) -> Result<Self, ConfigError> {
        let config: DashboardConfig = serde_yaml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Search for a config file: env var first, then the directory chain.
    pub fn discover(start_dir: &Path) -> Result<(PathBuf, Self), ConfigError> {
        let mut searched = Vec::new();

        if let Ok(env_path) = std::env::var(CONFIG_ENV) {
            let path = PathBuf::from(&env_path);
            if path.exists() {
                return Ok((path.clone(), Self::load(&path)?));
            }
            searched.push(path);
        }

        let mut dir = Some(start_dir);
        while let Some(current) = dir {
            for name in &CONFIG_NAMES {
                let path = current.join(name);
                if path.exists() {
                    return Ok((path.clone(), Self::load(&path)?));
                }
                searched.push(path);
            }
            dir = current.parent();
        }

        Err(ConfigError::NotFound { searched })
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.tools.login.is_empty() {
            return Err(ConfigError::EmptyLogin);
        }

        for (label, proxy) in &self.proxies {
            if self.tunnels.contains_key(label) {
                return Err(ConfigError::DuplicateLabel {
                    label: label.clone(),
                });
            }
            if proxy.command.is_empty() {
                return Err(ConfigError::MissingCommand {
                    proxy: label.clone(),
                });
            }
            for dep in &proxy.depends_on {
                if !self.tunnels.contains_key(dep) {
                    return Err(ConfigError::InvalidDependency {
                        proxy: label.clone(),
                        dependency: dep.clone(),
                    });
                }
            }
        }

        let mut ports: BTreeMap<u16, &str> = BTreeMap::new();
        let claims = self
            .tunnels
            .iter()
            .map(|(label, t)| (label, Some(t.local_port)))
            .chain(self.proxies.iter().map(|(label, p)| (label, p.listen_port)));
        for (label, port) in claims {
            let Some(port) = port else { continue };
            if let Some(first) = ports.insert(port, label.as_str()) {
                return Err(ConfigError::PortConflict {
                    port,
                    first: first.to_string(),
                    second: label.clone(),
                });
            }
        }

        Ok(())
    }

    pub fn context_for(&self, cluster: &str) -> String {
        self.clusters.context_for(cluster)
    }

    /// Materializes the service set for an active cluster pair.
    ///
    /// Secondary-role templates are skipped when the pair has no secondary.
    pub fn services_for(&self, pair: &ClusterPair) -> Vec<ServiceConfig> {
        let context_of = |role: ClusterRole| pair.cluster(role).map(|c| self.context_for(&c));

        let mut services = Vec::new();
        for (label, tunnel) in &self.tunnels {
            let Some(context) = context_of(tunnel.role) else {
                continue;
            };
            services.push(ServiceConfig {
                label: label.clone(),
                role: tunnel.role,
                target: ServiceTarget::Tunnel {
                    context,
                    namespace: tunnel.namespace.clone(),
                    service: tunnel.service.clone(),
                    local_port: tunnel.local_port,
                    remote_port: tunnel.remote_port,
                },
            });
        }

        for (label, proxy) in &self.proxies {
            let Some(context) = context_of(proxy.role) else {
                continue;
            };
            let mut argv = proxy
                .command
                .iter()
                .map(|part| part.replace(CONTEXT_PLACEHOLDER, &context));
            let Some(command) = argv.next() else { continue };
            services.push(ServiceConfig {
                label: label.clone(),
                role: proxy.role,
                target: ServiceTarget::Proxy {
                    command,
                    args: argv.collect(),
                    env: proxy.env.clone(),
                    listen_port: proxy.listen_port,
                    depends_on: proxy.depends_on.clone(),
                },
            });
        }

        services
    }

    /// Login argv for a cluster.
    pub fn login_command(&self, cluster: &str) -> Vec<String> {
        self.tools
            .login
            .iter()
            .map(|part| part.replace(CLUSTER_PLACEHOLDER, cluster))
            .collect()
    }

    pub fn labels(&self) -> BTreeSet<&str> {
        self.tunnels
            .keys()
            .chain(self.proxies.keys())
            .map(String::as_str)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
version: "1"
clusters:
  context_prefix: "teleport.example.com-"
  primary: alpha
tunnels:
  metrics-tunnel:
    namespace: monitoring
    service: prometheus
    local_port: 9090
    remote_port: 9090
  edge-metrics-tunnel:
    role: secondary
    namespace: monitoring
    service: prometheus
    local_port: 9091
    remote_port: 9090
proxies:
  metrics-proxy:
    command: ["promxy", "--context", "{context}"]
    listen_port: 8082
  edge-metrics-proxy:
    role: secondary
    command: ["promxy", "--context", "{context}"]
    listen_port: 8083
"#;

    #[test]
    fn test_parse_sample_config() {
        let config = DashboardConfig::parse(SAMPLE).unwrap();
        assert_eq!(config.tunnels.len(), 2);
        assert_eq!(config.proxies.len(), 2);
        assert_eq!(config.timings.health_interval_secs, 30);
        assert_eq!(config.limits.activity_log, 200);
        assert_eq!(config.limits.output_lines, 100);
        assert_eq!(
            config.clusters.initial_pair(),
            Some(ClusterPair::new("alpha", None))
        );
    }

    #[test]
    fn test_services_for_primary_only_skips_secondary_templates() {
        let config = DashboardConfig::parse(SAMPLE).unwrap();
        let services = config.services_for(&ClusterPair::new("alpha", None));
        let labels: Vec<_> = services.iter().map(|s| s.label.as_str()).collect();
        assert_eq!(labels, vec!["metrics-tunnel", "metrics-proxy"]);

        match &services[1].target {
            ServiceTarget::Proxy { command, args, .. } => {
                assert_eq!(command, "promxy");
                assert_eq!(args[1], "teleport.example.com-alpha");
            }
            other => panic!("expected proxy, got {:?}", other),
        }
    }

    #[test]
    fn test_services_for_secondary_use_qualified_context() {
        let config = DashboardConfig::parse(SAMPLE).unwrap();
        let services = config.services_for(&ClusterPair::new("alpha", Some("edge".into())));
        assert_eq!(services.len(), 4);

        let edge = services
            .iter()
            .find(|s| s.label == "edge-metrics-tunnel")
            .unwrap();
        match &edge.target {
            ServiceTarget::Tunnel { context, .. } => {
                assert_eq!(context, "teleport.example.com-alpha-edge");
            }
            other => panic!("expected tunnel, got {:?}", other),
        }
    }

    #[test]
    fn test_invalid_dependency() {
        let yaml = r#"
proxies:
  api-proxy:
    command: ["socat"]
    depends_on: [nonexistent]
"#;
        let result = DashboardConfig::parse(yaml);
        assert!(matches!(result, Err(ConfigError::InvalidDependency { .. })));
    }

    #[test]
    fn test_missing_command() {
        let yaml = r#"
proxies:
  api-proxy:
    command: []
"#;
        let result = DashboardConfig::parse(yaml);
        assert!(matches!(result, Err(ConfigError::MissingCommand { .. })));
    }

    #[test]
    fn test_port_conflict() {
        let yaml = r#"
tunnels:
  a:
    namespace: default
    service: a
    local_port: 8080
    remote_port: 80
proxies:
  b:
    command: ["socat"]
    listen_port: 8080
"#;
        let result = DashboardConfig::parse(yaml);
        assert!(matches!(
            result,
            Err(ConfigError::PortConflict { port: 8080, .. })
        ));
    }

    #[test]
    fn test_duplicate_label() {
        let yaml = r#"
tunnels:
  shared:
    namespace: default
    service: a
    local_port: 8080
    remote_port: 80
proxies:
  shared:
    command: ["socat"]
"#;
        let result = DashboardConfig::parse(yaml);
        assert!(matches!(result, Err(ConfigError::DuplicateLabel { .. })));
    }

    #[test]
    fn test_login_command_substitutes_cluster() {
        let config = DashboardConfig::default();
        assert_eq!(
            config.login_command("alpha-edge"),
            vec!["tsh", "kube", "login", "alpha-edge"]
        );
    }

    #[test]
    fn test_cluster_for_strips_prefix() {
        let settings = ClusterSettings {
            context_prefix: "tp-".into(),
            ..ClusterSettings::default()
        };
        assert_eq!(settings.cluster_for("tp-alpha"), Some("alpha"));
        assert_eq!(settings.cluster_for("other"), None);
        assert_eq!(settings.cluster_for("tp-"), None);
    }
}
