//! Cluster client backed by the login tool and `kubectl`.

use std::process::{Output, Stdio};

use async_trait::async_trait;
use serde::Deserialize;
use tokio::process::Command;
use tracing::debug;

use tunnelkeeper_core::cluster::{ClientError, ClusterCatalog, ClusterClient, LoginOutput, NodeCounts};
use tunnelkeeper_core::config::{ClusterSettings, DashboardConfig};

pub struct KubeClient {
    kubectl: String,
    config: DashboardConfig,
}

impl KubeClient {
    pub fn new(config: &DashboardConfig) -> Self {
        Self {
            kubectl: config.tools.kubectl.clone(),
            config: config.clone(),
        }
    }

    async fn kubectl(&self, args: &[&str]) -> Result<Output, ClientError> {
        run(&self.kubectl, args.iter().map(|a| a.to_string()).collect()).await
    }
}

/// Runs a program to completion; a non-zero exit is an error carrying stderr.
/// The child is killed if the future is dropped (e.g. on timeout).
async fn run(program: &str, args: Vec<String>) -> Result<Output, ClientError> {
    debug!(program, ?args, "running");
    let output = Command::new(program)
        .args(&args)
        .stdin(Stdio::null())
        .kill_on_drop(true)
        .output()
        .await
        .map_err(|source| ClientError::Spawn {
            program: program.to_string(),
            source,
        })?;

    if output.status.success() {
        Ok(output)
    } else {
        Err(ClientError::Failed {
            program: program.to_string(),
            code: output.status.code(),
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        })
    }
}

#[async_trait]
impl ClusterClient for KubeClient {
    async fn authenticate(&self, cluster: &str) -> Result<LoginOutput, ClientError> {
        let mut argv = self.config.login_command(cluster).into_iter();
        let Some(program) = argv.next() else {
            return Err(ClientError::Parse {
                program: "login".into(),
                reason: "empty login command".into(),
            });
        };
        let output = run(&program, argv.collect()).await?;
        Ok(LoginOutput {
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }

    async fn switch_context(&self, context: &str) -> Result<(), ClientError> {
        self.kubectl(&["config", "use-context", context]).await?;
        Ok(())
    }

    async fn active_context(&self) -> Result<String, ClientError> {
        let output = self.kubectl(&["config", "current-context"]).await?;
        let context = String::from_utf8_lossy(&output.stdout).trim().to_string();
        if context.is_empty() {
            return Err(ClientError::Parse {
                program: self.kubectl.clone(),
                reason: "no current context".into(),
            });
        }
        Ok(context)
    }

    async fn node_readiness(&self, context: &str) -> Result<NodeCounts, ClientError> {
        let output = self
            .kubectl(&["get", "nodes", "--context", context, "-o", "json"])
            .await?;
        parse_node_readiness(&output.stdout).map_err(|err| ClientError::Parse {
            program: self.kubectl.clone(),
            reason: err.to_string(),
        })
    }

    async fn list_clusters(&self) -> Result<ClusterCatalog, ClientError> {
        let output = self.kubectl(&["config", "get-contexts", "-o", "name"]).await?;
        let stdout = String::from_utf8_lossy(&output.stdout);
        Ok(catalog_from_contexts(&self.config.clusters, &stdout))
    }
}

#[derive(Deserialize)]
struct NodeList {
    #[serde(default)]
    items: Vec<Node>,
}

#[derive(Deserialize)]
struct Node {
    #[serde(default)]
    status: NodeStatus,
}

#[derive(Default, Deserialize)]
struct NodeStatus {
    #[serde(default)]
    conditions: Vec<NodeCondition>,
}

#[derive(Deserialize)]
struct NodeCondition {
    #[serde(rename = "type")]
    kind: String,
    status: String,
}

/// Counts nodes whose `Ready` condition is `True` in `kubectl get nodes -o json`.
fn parse_node_readiness(json: &[u8]) -> Result<NodeCounts, serde_json::Error> {
    let list: NodeList = serde_json::from_slice(json)?;
    let ready = list
        .items
        .iter()
        .filter(|node| {
            node.status
                .conditions
                .iter()
                .any(|c| c.kind == "Ready" && c.status == "True")
        })
        .count();
    Ok(NodeCounts {
        ready: ready as u32,
        total: list.items.len() as u32,
    })
}

/// Cluster names are the contexts carrying the configured prefix, prefix removed.
fn catalog_from_contexts(clusters: &ClusterSettings, contexts: &str) -> ClusterCatalog {
    ClusterCatalog::from_names(
        contexts
            .lines()
            .map(str::trim)
            .filter_map(|ctx| clusters.cluster_for(ctx)),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    const NODES: &str = r#"{
      "items": [
        {"status": {"conditions": [
          {"type": "MemoryPressure", "status": "False"},
          {"type": "Ready", "status": "True"}
        ]}},
        {"status": {"conditions": [{"type": "Ready", "status": "Unknown"}]}},
        {"status": {}}
      ]
    }"#;

    #[test]
    fn test_parse_node_readiness() {
        let counts = parse_node_readiness(NODES.as_bytes()).unwrap();
        assert_eq!(counts, NodeCounts { ready: 1, total: 3 });
    }

    #[test]
    fn test_parse_empty_node_list() {
        let counts = parse_node_readiness(br#"{"kind": "List"}"#).unwrap();
        assert_eq!(counts, NodeCounts::default());
        assert!(parse_node_readiness(b"not json").is_err());
    }

    #[test]
    fn test_catalog_only_uses_prefixed_contexts() {
        let clusters = ClusterSettings {
            context_prefix: "tp-".into(),
            ..Default::default()
        };
        let contexts = "tp-alpha\ntp-alpha-edge\nminikube\ntp-\n tp-beta \n";
        let catalog = catalog_from_contexts(&clusters, contexts);
        assert_eq!(catalog.primaries, vec!["alpha", "beta"]);
        assert_eq!(catalog.secondaries_of("alpha"), ["edge"]);
    }

    #[tokio::test]
    async fn test_missing_login_tool_is_spawn_error() {
        let mut config = DashboardConfig::default();
        config.tools.login = vec!["definitely-not-a-real-login-tk".into(), "{cluster}".into()];
        let err = KubeClient::new(&config).authenticate("alpha").await.unwrap_err();
        assert!(matches!(err, ClientError::Spawn { .. }), "{}", err);
    }
}
