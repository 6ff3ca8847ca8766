//! Fakes shared by the unit tests.

use std::collections::{BTreeMap, VecDeque};
use std::sync::Mutex;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::cluster::{ClientError, ClusterCatalog, ClusterClient, LoginOutput, NodeCounts};
use crate::config::DashboardConfig;
use crate::message::{Exit, Inbox, ProcessEventKind};
use crate::model::{ClusterRole, ServiceConfig, ServiceLabel, ServiceTarget};
use crate::supervisor::{LaunchError, Launched, Launcher};

pub const TEST_CONFIG: &str = r#"
clusters:
  context_prefix: "tp-"
timings:
  recovery_backoff_ms: 250
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
"#;

pub fn test_config() -> DashboardConfig {
    DashboardConfig::parse(TEST_CONFIG).unwrap()
}

pub fn tunnel_config(label: &str) -> ServiceConfig {
    ServiceConfig {
        label: label.into(),
        role: ClusterRole::Primary,
        target: ServiceTarget::Tunnel {
            context: "tp-alpha".into(),
            namespace: "default".into(),
            service: label.into(),
            local_port: 8080,
            remote_port: 80,
        },
    }
}

pub fn proxy_config(label: &str, depends_on: &[&str]) -> ServiceConfig {
    ServiceConfig {
        label: label.into(),
        role: ClusterRole::Primary,
        target: ServiceTarget::Proxy {
            command: "proxy".into(),
            args: vec![],
            env: BTreeMap::new(),
            listen_port: None,
            depends_on: depends_on.iter().map(|s| s.to_string()).collect(),
        },
    }
}

struct FakeLaunch {
    label: ServiceLabel,
    instance: u64,
    cancel: CancellationToken,
}

#[derive(Default)]
struct LaunchLog {
    launches: Vec<FakeLaunch>,
    overlaps: usize,
    fail_next: Option<String>,
}

/// Launcher that records every launch without starting a process.
#[derive(Default)]
pub struct FakeLauncher {
    log: Mutex<LaunchLog>,
}

impl FakeLauncher {
    pub fn token(&self, instance: u64) -> Option<CancellationToken> {
        let log = self.log.lock().unwrap();
        log.launches
            .iter()
            .find(|l| l.instance == instance)
            .map(|l| l.cancel.clone())
    }

    /// Launches that found an uncancelled token for the same label.
    pub fn overlaps(&self) -> usize {
        self.log.lock().unwrap().overlaps
    }

    pub fn fail_next(&self, message: &str) {
        self.log.lock().unwrap().fail_next = Some(message.to_string());
    }

    /// Labels in launch order.
    pub fn labels(&self) -> Vec<ServiceLabel> {
        let log = self.log.lock().unwrap();
        log.launches.iter().map(|l| l.label.clone()).collect()
    }

    pub fn launches_of(&self, label: &str) -> Vec<u64> {
        let log = self.log.lock().unwrap();
        log.launches
            .iter()
            .filter(|l| l.label == label)
            .map(|l| l.instance)
            .collect()
    }
}

impl Launcher for FakeLauncher {
    fn launch(
        &self,
        service: &ServiceConfig,
        instance: u64,
        cancel: CancellationToken,
        inbox: Inbox,
    ) -> Result<Launched, LaunchError> {
        let mut log = self.log.lock().unwrap();
        if let Some(message) = log.fail_next.take() {
            return Err(LaunchError::Spawn {
                label: service.label.clone(),
                source: std::io::Error::other(message),
            });
        }
        let overlapping = log
            .launches
            .iter()
            .filter(|l| l.label == service.label && !l.cancel.is_cancelled())
            .count();
        log.overlaps += overlapping;
        log.launches.push(FakeLaunch {
            label: service.label.clone(),
            instance,
            cancel: cancel.clone(),
        });

        // Acknowledge a stop the way a real launcher does, when there is a runtime to do it on.
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            let label = service.label.clone();
            let token = cancel.clone();
            handle.spawn(async move {
                token.cancelled().await;
                inbox.process(&label, instance, ProcessEventKind::Exited(Exit::stopped()));
            });
        }
        Ok(Launched {
            cancel,
            pid: 1000 + instance as u32,
        })
    }
}

/// Scripted cluster client. Every call is recorded as `"<op> <arg>"`.
#[derive(Default)]
pub struct FakeClient {
    calls: Mutex<Vec<String>>,
    login_failures: Mutex<VecDeque<String>>,
    active: Mutex<Option<String>>,
    nodes: NodeCounts,
}

impl FakeClient {
    pub fn with_nodes(ready: u32, total: u32) -> Self {
        Self {
            nodes: NodeCounts { ready, total },
            ..Self::default()
        }
    }

    pub fn fail_login(&self, message: &str) {
        self.login_failures
            .lock()
            .unwrap()
            .push_back(message.to_string());
    }

    pub fn set_active(&self, context: &str) {
        *self.active.lock().unwrap() = Some(context.to_string());
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    fn record(&self, call: String) {
        self.calls.lock().unwrap().push(call);
    }
}

#[async_trait]
impl ClusterClient for FakeClient {
    async fn authenticate(&self, cluster: &str) -> Result<LoginOutput, ClientError> {
        self.record(format!("login {}", cluster));
        match self.login_failures.lock().unwrap().pop_front() {
            Some(stderr) => Err(ClientError::Failed {
                program: "tsh".into(),
                code: Some(1),
                stderr,
            }),
            None => Ok(LoginOutput {
                stdout: format!("Logged into {}", cluster),
                stderr: String::new(),
            }),
        }
    }

    async fn switch_context(&self, context: &str) -> Result<(), ClientError> {
        self.record(format!("switch {}", context));
        *self.active.lock().unwrap() = Some(context.to_string());
        Ok(())
    }

    async fn active_context(&self) -> Result<String, ClientError> {
        self.record("current-context".into());
        self.active
            .lock()
            .unwrap()
            .clone()
            .ok_or_else(|| ClientError::Failed {
                program: "kubectl".into(),
                code: Some(1),
                stderr: "current-context is not set".into(),
            })
    }

    async fn node_readiness(&self, context: &str) -> Result<NodeCounts, ClientError> {
        self.record(format!("nodes {}", context));
        Ok(self.nodes)
    }

    async fn list_clusters(&self) -> Result<ClusterCatalog, ClientError> {
        self.record("list".into());
        Ok(ClusterCatalog::from_names(["alpha", "alpha-edge", "beta"]))
    }
}
