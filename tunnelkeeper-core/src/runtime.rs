//! Event loop and background task execution.
//!
//! The loop owns the [`App`] and the receiving end of the inbox. Tasks returned by
//! handlers are spawned onto the tokio runtime; each one reports back with exactly
//! one message. Collaborator calls run under their configured timeout.

use std::future::Future;
use std::io;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::app::App;
use crate::cluster::{ClientError, ClusterClient};
use crate::config::Timings;
use crate::message::{DetectedContext, FlowEvent, FlowOutcome, HealthReport, Inbox, Message, Task};
use crate::snapshot::Snapshot;

const REDRAW_INTERVAL: Duration = Duration::from_millis(250);

/// Whatever presents snapshots to the operator.
pub trait Frontend {
    fn draw(&mut self, snapshot: &Snapshot) -> io::Result<()>;
}

/// Runs [`Task`]s off the event loop.
#[derive(Clone)]
pub struct TaskRunner {
    client: Arc<dyn ClusterClient>,
    inbox: Inbox,
    timings: Timings,
}

impl TaskRunner {
    pub fn new(client: Arc<dyn ClusterClient>, inbox: Inbox, timings: Timings) -> Self {
        Self {
            client,
            inbox,
            timings,
        }
    }

    pub fn spawn(&self, task: Task) -> JoinHandle<()> {
        let client = self.client.clone();
        let inbox = self.inbox.clone();
        let timings = self.timings.clone();
        tokio::spawn(async move {
            let message = execute(task, client.as_ref(), &timings).await;
            if !inbox.send(message) {
                debug!("inbox closed; dropping task result");
            }
        })
    }
}

async fn bounded<T, F>(limit: Duration, operation: &'static str, call: F) -> Result<T, String>
where
    F: Future<Output = Result<T, ClientError>>,
{
    match tokio::time::timeout(limit, call).await {
        Ok(result) => result.map_err(|e| e.to_string()),
        Err(_) => Err(ClientError::Timeout {
            operation,
            secs: limit.as_secs(),
        }
        .to_string()),
    }
}

async fn execute(task: Task, client: &dyn ClusterClient, timings: &Timings) -> Message {
    match task {
        Task::Authenticate {
            flow_id,
            role,
            cluster,
        } => {
            let result = bounded(
                timings.login_timeout(),
                "login",
                client.authenticate(&cluster),
            )
            .await;
            Message::Flow(FlowEvent {
                flow_id,
                outcome: FlowOutcome::Authenticated {
                    role,
                    cluster,
                    result,
                },
            })
        }
        Task::SwitchContext { flow_id, context } => {
            let result = bounded(
                timings.switch_timeout(),
                "context switch",
                client.switch_context(&context),
            )
            .await;
            Message::Flow(FlowEvent {
                flow_id,
                outcome: FlowOutcome::ContextSwitched { context, result },
            })
        }
        Task::QueryHealth {
            cluster,
            role,
            context,
        } => {
            let result = bounded(
                timings.health_timeout(),
                "node readiness",
                client.node_readiness(&context),
            )
            .await;
            Message::Health(HealthReport {
                cluster,
                role,
                result,
            })
        }
        Task::HealthTick { generation, after } => {
            tokio::time::sleep(after).await;
            Message::HealthTick { generation }
        }
        Task::Recover {
            label,
            instance,
            after,
        } => {
            tokio::time::sleep(after).await;
            Message::RecoveryDue { label, instance }
        }
        Task::DetectActiveContext => {
            let limit = timings.switch_timeout();
            let result = match bounded(limit, "current context", client.active_context()).await {
                Ok(context) => {
                    let catalog = match bounded(limit, "cluster list", client.list_clusters()).await {
                        Ok(catalog) => Some(catalog),
                        Err(err) => {
                            debug!(%err, "no cluster catalog at startup");
                            None
                        }
                    };
                    Ok(DetectedContext { context, catalog })
                }
                Err(err) => Err(err),
            };
            Message::ActiveContext(result)
        }
        Task::ListClusters => {
            let result = bounded(
                timings.switch_timeout(),
                "cluster list",
                client.list_clusters(),
            )
            .await;
            Message::ClustersListed(result)
        }
    }
}

/// Single-threaded dispatcher loop.
pub struct EventLoop {
    app: App,
    runner: TaskRunner,
    rx: mpsc::UnboundedReceiver<Message>,
    redraw: Duration,
}

impl EventLoop {
    pub fn new(app: App, runner: TaskRunner, rx: mpsc::UnboundedReceiver<Message>) -> Self {
        Self {
            app,
            runner,
            rx,
            redraw: REDRAW_INTERVAL,
        }
    }

    pub fn with_redraw(mut self, redraw: Duration) -> Self {
        self.redraw = redraw;
        self
    }

    /// Runs until the operator quits (or every sender is gone) and hands the final
    /// state back.
    pub async fn run<F: Frontend>(mut self, frontend: &mut F, boot: Vec<Task>) -> io::Result<App> {
        for task in boot {
            self.runner.spawn(task);
        }
        frontend.draw(&self.app.snapshot())?;

        let mut redraw = tokio::time::interval(self.redraw);
        redraw.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                message = self.rx.recv() => {
                    let Some(message) = message else {
                        info!("inbox closed");
                        break;
                    };
                    self.dispatch(message);
                    if self.app.is_quitting() {
                        break;
                    }
                }
                _ = redraw.tick() => {}
            }
            frontend.draw(&self.app.snapshot())?;
        }

        if self.app.is_quitting() {
            self.drain().await;
            frontend.draw(&self.app.snapshot())?;
        }
        Ok(self.app)
    }

    fn dispatch(&mut self, message: Message) {
        for task in self.app.handle(message) {
            self.runner.spawn(task);
        }
    }

    /// Applies exit events until every stopped launch has reported or the grace
    /// period runs out.
    async fn drain(&mut self) {
        let deadline = tokio::time::Instant::now() + self.app.config().timings.shutdown_grace();
        while self.app.awaiting_exits() > 0 {
            match tokio::time::timeout_at(deadline, self.rx.recv()).await {
                Ok(Some(message)) => self.dispatch(message),
                Ok(None) => break,
                Err(_) => {
                    warn!(pending = self.app.awaiting_exits(), "shutdown grace elapsed");
                    break;
                }
            }
        }
    }
}
