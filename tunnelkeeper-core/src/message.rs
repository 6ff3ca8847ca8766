//! Messages flowing into the event loop and the work it hands back out.

use std::time::Duration;

use tokio::sync::mpsc;

use crate::cluster::{ClusterCatalog, LoginOutput, NodeCounts};
use crate::model::{ClusterRole, ServiceLabel};
use crate::recovery::Fault;
use crate::state::OutputStream;

/// Terminal-independent key input.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Key {
    Char(char),
    Enter,
    Esc,
    Backspace,
    Tab,
    BackTab,
    Up,
    Down,
    /// Reserved quit combination, honored in every mode
    CtrlC,
}

/// How a supervised task ended.
#[derive(Clone, Debug)]
pub struct Exit {
    pub status_text: String,
    /// `None` for a clean exit or an acknowledged stop
    pub fault: Option<Fault>,
}

impl Exit {
    pub fn stopped() -> Self {
        Self {
            status_text: "stopped".into(),
            fault: None,
        }
    }

    pub fn faulted(status_text: impl Into<String>, fault: Fault) -> Self {
        Self {
            status_text: status_text.into(),
            fault: Some(fault),
        }
    }
}

#[derive(Clone, Debug)]
pub enum ProcessEventKind {
    Output { stream: OutputStream, text: String },
    /// Non-terminal progress text
    StatusText(String),
    /// The service is serving traffic
    Ready,
    /// Exactly one per launch, always the last event of that launch
    Exited(Exit),
}

/// Event from one launch of one service.
#[derive(Clone, Debug)]
pub struct ProcessEvent {
    pub label: ServiceLabel,
    pub instance: u64,
    pub kind: ProcessEventKind,
}

/// Readiness result tagged with the identity it was requested for.
#[derive(Clone, Debug)]
pub struct HealthReport {
    pub cluster: String,
    pub role: ClusterRole,
    pub result: Result<NodeCounts, String>,
}

#[derive(Clone, Debug)]
pub enum FlowOutcome {
    Authenticated {
        role: ClusterRole,
        cluster: String,
        result: Result<LoginOutput, String>,
    },
    ContextSwitched {
        context: String,
        result: Result<(), String>,
    },
}

#[derive(Clone, Debug)]
pub struct FlowEvent {
    pub flow_id: u64,
    pub outcome: FlowOutcome,
}

/// What startup detection found about the active context.
#[derive(Clone, Debug)]
pub struct DetectedContext {
    pub context: String,
    pub catalog: Option<ClusterCatalog>,
}

#[derive(Clone, Debug)]
pub enum Message {
    Key(Key),
    Resize { width: u16, height: u16 },
    Process(ProcessEvent),
    HealthTick { generation: u64 },
    Health(HealthReport),
    Flow(FlowEvent),
    ActiveContext(Result<DetectedContext, String>),
    ClustersListed(Result<ClusterCatalog, String>),
    RecoveryDue { label: ServiceLabel, instance: u64 },
}

impl Message {
    pub fn name(&self) -> &'static str {
        match self {
            Message::Key(_) => "key",
            Message::Resize { .. } => "resize",
            Message::Process(_) => "process",
            Message::HealthTick { .. } => "health-tick",
            Message::Health(_) => "health",
            Message::Flow(_) => "flow",
            Message::ActiveContext(_) => "active-context",
            Message::ClustersListed(_) => "clusters-listed",
            Message::RecoveryDue { .. } => "recovery-due",
        }
    }
}

/// Background work requested by a handler. The task runner executes each one
/// off the event loop and reports back through the inbox.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Task {
    Authenticate {
        flow_id: u64,
        role: ClusterRole,
        cluster: String,
    },
    SwitchContext {
        flow_id: u64,
        context: String,
    },
    QueryHealth {
        cluster: String,
        role: ClusterRole,
        context: String,
    },
    HealthTick {
        generation: u64,
        after: Duration,
    },
    Recover {
        label: ServiceLabel,
        instance: u64,
        after: Duration,
    },
    DetectActiveContext,
    ListClusters,
}

/// Sending half of the event loop's single shared inbox.
#[derive(Clone, Debug)]
pub struct Inbox {
    tx: mpsc::UnboundedSender<Message>,
}

impl Inbox {
    pub fn channel() -> (Inbox, mpsc::UnboundedReceiver<Message>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Inbox { tx }, rx)
    }

    /// Returns false once the event loop has gone away.
    pub fn send(&self, message: Message) -> bool {
        self.tx.send(message).is_ok()
    }

    pub fn process(&self, label: &str, instance: u64, kind: ProcessEventKind) -> bool {
        self.send(Message::Process(ProcessEvent {
            label: label.to_string(),
            instance,
            kind,
        }))
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}
