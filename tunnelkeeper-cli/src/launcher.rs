//! Subprocess launcher for tunnels (`kubectl port-forward`) and local proxies.
//!
//! Each launch gets its own process group so a stop takes down anything the
//! service forked. Output lines, readiness and the final exit are reported through
//! the inbox tagged with the launch instance.

use std::io::ErrorKind;
use std::process::Stdio;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::net::TcpStream;
use tokio::process::{Child, Command};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use tunnelkeeper_core::message::{Exit, Inbox, ProcessEventKind};
use tunnelkeeper_core::model::{ServiceConfig, ServiceTarget};
use tunnelkeeper_core::recovery::Fault;
use tunnelkeeper_core::state::OutputStream;
use tunnelkeeper_core::supervisor::{LaunchError, Launched, Launcher};

/// kubectl prints this once the local listener is up.
const FORWARDING_MARKER: &str = "Forwarding from";
const TERM_GRACE: Duration = Duration::from_millis(500);
const PROBE_INTERVAL: Duration = Duration::from_millis(500);
const PROBE_TIMEOUT: Duration = Duration::from_secs(2);
const OUTPUT_DRAIN: Duration = Duration::from_millis(500);

#[derive(Clone, Copy, Debug)]
enum Readiness {
    /// A stdout line containing the marker
    Marker(&'static str),
    /// The port accepts TCP connections
    Port(u16),
    Immediate,
}

pub struct ProcessLauncher {
    kubectl: String,
}

impl ProcessLauncher {
    pub fn new(kubectl: impl Into<String>) -> Self {
        Self {
            kubectl: kubectl.into(),
        }
    }

    fn command_for(&self, service: &ServiceConfig) -> Result<(Command, String, Readiness), LaunchError> {
        match &service.target {
            ServiceTarget::Tunnel {
                context,
                namespace,
                service: target,
                local_port,
                remote_port,
            } => {
                let mut cmd = Command::new(&self.kubectl);
                cmd.arg("port-forward")
                    .args(["--context", context.as_str(), "-n", namespace.as_str()])
                    .arg(format!("svc/{}", target))
                    .arg(format!("{}:{}", local_port, remote_port));
                Ok((cmd, self.kubectl.clone(), Readiness::Marker(FORWARDING_MARKER)))
            }
            ServiceTarget::Proxy {
                command,
                args,
                env,
                listen_port,
                ..
            } => {
                if command.trim().is_empty() {
                    return Err(LaunchError::EmptyCommand {
                        label: service.label.clone(),
                    });
                }
                let mut cmd = Command::new(command);
                cmd.args(args).envs(env);
                let readiness = listen_port.map_or(Readiness::Immediate, Readiness::Port);
                Ok((cmd, command.clone(), readiness))
            }
        }
    }
}

fn is_proxy(service: &ServiceConfig) -> bool {
    matches!(service.target, ServiceTarget::Proxy { .. })
}

impl Launcher for ProcessLauncher {
    fn launch(
        &self,
        service: &ServiceConfig,
        instance: u64,
        cancel: CancellationToken,
        inbox: Inbox,
    ) -> Result<Launched, LaunchError> {
        let (mut cmd, program, readiness) = self.command_for(service)?;
        let label = service.label.clone();

        cmd.stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        #[cfg(unix)]
        unsafe {
            cmd.pre_exec(|| {
                libc::setsid();
                Ok(())
            });
        }

        let mut child = match cmd.spawn() {
            Ok(child) => child,
            // A proxy binary can show up later (installs, PATH changes), so a
            // missing one ends the launch like any other fault and may recover.
            Err(source) if source.kind() == ErrorKind::NotFound && is_proxy(service) => {
                warn!(label = %label, instance, program = %program, "executable not found");
                inbox.process(
                    &label,
                    instance,
                    ProcessEventKind::Exited(Exit::faulted(
                        format!("failed to start {}", program),
                        Fault::ExecutableMissing,
                    )),
                );
                return Ok(Launched { cancel, pid: 0 });
            }
            Err(source) if source.kind() == ErrorKind::NotFound => {
                return Err(LaunchError::ExecutableMissing { label, program });
            }
            Err(source) => return Err(LaunchError::Spawn { label, source }),
        };
        let pid = child.id().unwrap_or(0);
        debug!(label = %label, instance, pid, program = %program, "spawned");

        let marker = match readiness {
            Readiness::Marker(marker) => Some(marker),
            _ => None,
        };
        let mut readers = Vec::new();
        if let Some(stdout) = child.stdout.take() {
            readers.push(spawn_reader(
                stdout,
                OutputStream::Stdout,
                marker,
                label.clone(),
                instance,
                inbox.clone(),
            ));
        }
        if let Some(stderr) = child.stderr.take() {
            readers.push(spawn_reader(
                stderr,
                OutputStream::Stderr,
                None,
                label.clone(),
                instance,
                inbox.clone(),
            ));
        }

        let probe = match readiness {
            Readiness::Port(port) => Some(spawn_probe(
                port,
                label.clone(),
                instance,
                cancel.clone(),
                inbox.clone(),
            )),
            Readiness::Immediate => {
                inbox.process(&label, instance, ProcessEventKind::Ready);
                None
            }
            Readiness::Marker(_) => None,
        };

        let token = cancel.clone();
        tokio::spawn(async move {
            let exited = tokio::select! {
                _ = token.cancelled() => None,
                status = child.wait() => Some(exit_from(status)),
            };
            let exit = match exited {
                Some(exit) => exit,
                None => {
                    terminate(&mut child, pid).await;
                    Exit::stopped()
                }
            };

            if let Some(probe) = probe {
                probe.abort();
            }
            // Exited must be the last event of this launch.
            for reader in readers {
                let abort = reader.abort_handle();
                if tokio::time::timeout(OUTPUT_DRAIN, reader).await.is_err() {
                    abort.abort();
                }
            }

            if exit.fault.is_some() {
                warn!(label = %label, instance, status = %exit.status_text, "service exited");
            }
            inbox.process(&label, instance, ProcessEventKind::Exited(exit));
        });

        Ok(Launched { cancel, pid })
    }
}

fn spawn_reader<R>(
    pipe: R,
    stream: OutputStream,
    marker: Option<&'static str>,
    label: String,
    instance: u64,
    inbox: Inbox,
) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut lines = BufReader::new(pipe).lines();
        let mut ready = false;
        while let Ok(Some(line)) = lines.next_line().await {
            let is_ready = !ready && marker.is_some_and(|m| line.contains(m));
            if !inbox.process(&label, instance, ProcessEventKind::Output { stream, text: line }) {
                break;
            }
            if is_ready {
                ready = true;
                inbox.process(&label, instance, ProcessEventKind::Ready);
            }
        }
    })
}

fn spawn_probe(
    port: u16,
    label: String,
    instance: u64,
    cancel: CancellationToken,
    inbox: Inbox,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let addr = format!("127.0.0.1:{}", port);
        inbox.process(
            &label,
            instance,
            ProcessEventKind::StatusText(format!("waiting for :{}", port)),
        );
        loop {
            if let Ok(Ok(_)) = tokio::time::timeout(PROBE_TIMEOUT, TcpStream::connect(&addr)).await {
                inbox.process(
                    &label,
                    instance,
                    ProcessEventKind::StatusText(format!("listening on :{}", port)),
                );
                inbox.process(&label, instance, ProcessEventKind::Ready);
                return;
            }
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = tokio::time::sleep(PROBE_INTERVAL) => {}
            }
        }
    })
}

fn exit_from(status: std::io::Result<std::process::ExitStatus>) -> Exit {
    match status {
        Ok(status) if status.success() => Exit {
            status_text: "exited".into(),
            fault: None,
        },
        Ok(status) => match status.code() {
            Some(code) => Exit::faulted(format!("exit status {}", code), Fault::ExitedNonZero(code)),
            None => Exit::faulted(
                "terminated by signal",
                Fault::Other("terminated by signal".into()),
            ),
        },
        Err(err) => {
            let text = err.to_string();
            Exit::faulted(text.clone(), Fault::classify(&text))
        }
    }
}

/// SIGTERM to the process group, then SIGKILL if it is still around after the grace.
#[cfg(unix)]
async fn terminate(child: &mut Child, pid: u32) {
    if pid == 0 {
        let _ = child.kill().await;
        return;
    }
    let pgid = pid as i32;
    unsafe {
        libc::killpg(pgid, libc::SIGTERM);
    }
    if tokio::time::timeout(TERM_GRACE, child.wait()).await.is_err() {
        unsafe {
            libc::killpg(pgid, libc::SIGKILL);
        }
        let _ = child.wait().await;
    }
}

#[cfg(not(unix))]
async fn terminate(child: &mut Child, _pid: u32) {
    let _ = child.kill().await;
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use std::sync::Arc;
    use tunnelkeeper_core::app::App;
    use tunnelkeeper_core::config::DashboardConfig;
    use tunnelkeeper_core::message::{DetectedContext, Message, Task};
    use tunnelkeeper_core::model::ClusterRole;
    use tunnelkeeper_core::state::ProcessStatus;

    fn shell_proxy(script: &str) -> ServiceConfig {
        ServiceConfig {
            label: "sh-proxy".into(),
            role: ClusterRole::Primary,
            target: ServiceTarget::Proxy {
                command: "sh".into(),
                args: vec!["-c".into(), script.into()],
                env: BTreeMap::new(),
                listen_port: None,
                depends_on: vec![],
            },
        }
    }

    async fn events_until_exit(
        rx: &mut tokio::sync::mpsc::UnboundedReceiver<Message>,
    ) -> (Vec<ProcessEventKind>, Exit) {
        let mut events = Vec::new();
        while let Some(Message::Process(event)) = rx.recv().await {
            match event.kind {
                ProcessEventKind::Exited(exit) => return (events, exit),
                other => events.push(other),
            }
        }
        panic!("inbox closed before exit");
    }

    #[tokio::test]
    async fn test_nonzero_exit_is_reported_last() {
        let (inbox, mut rx) = Inbox::channel();
        let launcher = ProcessLauncher::new("kubectl");
        let launched = launcher
            .launch(&shell_proxy("echo hello; exit 3"), 1, CancellationToken::new(), inbox)
            .unwrap();
        assert!(launched.pid > 0);

        let (events, exit) = events_until_exit(&mut rx).await;
        assert!(events.iter().any(|e| matches!(
            e,
            ProcessEventKind::Output { text, .. } if text == "hello"
        )));
        assert_eq!(exit.fault, Some(Fault::ExitedNonZero(3)));
    }

    #[tokio::test]
    async fn test_cancel_stops_process_group() {
        let (inbox, mut rx) = Inbox::channel();
        let launcher = ProcessLauncher::new("kubectl");
        let cancel = CancellationToken::new();
        launcher
            .launch(&shell_proxy("sleep 30"), 4, cancel.clone(), inbox)
            .unwrap();

        cancel.cancel();
        let (_, exit) = tokio::time::timeout(Duration::from_secs(5), events_until_exit(&mut rx))
            .await
            .unwrap();
        assert!(exit.fault.is_none());
        assert_eq!(exit.status_text, "stopped");
    }

    #[tokio::test]
    async fn test_missing_proxy_binary_reports_exit() {
        let (inbox, mut rx) = Inbox::channel();
        let mut service = shell_proxy("");
        if let ServiceTarget::Proxy { command, .. } = &mut service.target {
            *command = "definitely-not-a-real-binary-tk".into();
        }
        let launched = ProcessLauncher::new("kubectl")
            .launch(&service, 2, CancellationToken::new(), inbox)
            .unwrap();
        assert_eq!(launched.pid, 0);

        let (events, exit) = events_until_exit(&mut rx).await;
        assert!(events.is_empty());
        assert_eq!(exit.fault, Some(Fault::ExecutableMissing));
    }

    #[tokio::test]
    async fn test_missing_kubectl_is_setup_error() {
        let (inbox, _rx) = Inbox::channel();
        let service = ServiceConfig {
            label: "api-tunnel".into(),
            role: ClusterRole::Primary,
            target: ServiceTarget::Tunnel {
                context: "tp-alpha".into(),
                namespace: "default".into(),
                service: "api".into(),
                local_port: 18080,
                remote_port: 80,
            },
        };
        let err = ProcessLauncher::new("/nonexistent/kubectl")
            .launch(&service, 1, CancellationToken::new(), inbox)
            .unwrap_err();
        assert!(matches!(err, LaunchError::ExecutableMissing { .. }));
    }

    #[tokio::test]
    async fn test_missing_proxy_binary_schedules_recovery() {
        let config = DashboardConfig::parse(
            r#"
clusters:
  context_prefix: "tp-"
proxies:
  api-proxy:
    command: ["definitely-not-a-real-binary-tk"]
"#,
        )
        .unwrap();
        let (inbox, mut rx) = Inbox::channel();
        let launcher = Arc::new(ProcessLauncher::new("kubectl"));
        let mut app = App::new(config, launcher, inbox);
        app.boot(None);
        app.handle(Message::ActiveContext(Ok(DetectedContext {
            context: "tp-alpha".into(),
            catalog: None,
        })));

        let exit = match rx.recv().await {
            Some(message @ Message::Process(_)) => message,
            _ => panic!("expected a process event"),
        };
        let tasks = app.handle(exit);
        assert!(tasks.iter().any(|t| matches!(
            t,
            Task::Recover { label, .. } if label == "api-proxy"
        )));
        assert_eq!(
            app.process("api-proxy").unwrap().status(),
            ProcessStatus::Degraded
        );
    }
}
