use std::collections::VecDeque;
use std::time::SystemTime;

use tokio_util::sync::CancellationToken;

use crate::model::{ServiceKind, ServiceLabel};

/// Ring buffer that keeps the most recent `cap` entries, oldest evicted first.
#[derive(Clone, Debug)]
pub struct BoundedLog<T> {
    cap: usize,
    entries: VecDeque<T>,
}

impl<T> BoundedLog<T> {
    pub fn new(cap: usize) -> Self {
        Self {
            cap,
            entries: VecDeque::with_capacity(cap.min(1024)),
        }
    }

    pub fn push(&mut self, entry: T) {
        if self.cap == 0 {
            return;
        }
        self.entries.push_back(entry);
        while self.entries.len() > self.cap {
            self.entries.pop_front();
        }
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn cap(&self) -> usize {
        self.cap
    }

    pub fn iter(&self) -> impl DoubleEndedIterator<Item = &T> {
        self.entries.iter()
    }

    /// The last `n` entries, oldest first.
    pub fn tail(&self, n: usize) -> impl Iterator<Item = &T> {
        self.entries.iter().skip(self.entries.len().saturating_sub(n))
    }
}

/// Which output stream a line came from
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OutputStream {
    Stdout,
    Stderr,
}

#[derive(Clone, Debug)]
pub struct OutputLine {
    pub at: SystemTime,
    pub stream: OutputStream,
    pub text: String,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum ActivityLevel {
    Info,
    Warn,
    Error,
}

/// One line of the operator-facing activity log.
#[derive(Clone, Debug)]
pub struct ActivityEntry {
    pub at: SystemTime,
    pub level: ActivityLevel,
    pub text: String,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ProcessStatus {
    AwaitingSetup,
    Initializing,
    Running,
    Degraded,
    Failed,
    Stopped,
}

impl ProcessStatus {
    /// Statuses during which a background task owns the service.
    pub fn is_live(&self) -> bool {
        matches!(self, ProcessStatus::Initializing | ProcessStatus::Running)
    }

    pub fn label(&self) -> &'static str {
        match self {
            ProcessStatus::AwaitingSetup => "awaiting setup",
            ProcessStatus::Initializing => "initializing",
            ProcessStatus::Running => "running",
            ProcessStatus::Degraded => "degraded",
            ProcessStatus::Failed => "failed",
            ProcessStatus::Stopped => "stopped",
        }
    }
}

/// Runtime record for one supervised service, owned by the event loop.
///
/// The cancel token is present exactly while the status is live
/// (`Initializing` or `Running`); every transition goes through the methods below
/// so the two never drift apart.
#[derive(Debug)]
pub struct ProcessState {
    pub label: ServiceLabel,
    pub kind: ServiceKind,
    status: ProcessStatus,
    pub pid: u32,
    pub last_error: Option<String>,
    /// Latest non-terminal status text reported by the background task
    pub status_text: Option<String>,
    pub output: BoundedLog<OutputLine>,
    cancel: Option<CancellationToken>,
    instance: u64,
    /// A launch whose exit event has not arrived yet
    awaiting_exit: bool,
    /// Automatic restarts used in the current lifecycle
    pub auto_restarts: u32,
    /// Instance a scheduled recovery is waiting to restart
    pub recovery_for: Option<u64>,
}

impl ProcessState {
    pub fn new(label: impl Into<ServiceLabel>, kind: ServiceKind, output_cap: usize) -> Self {
        Self {
            label: label.into(),
            kind,
            status: ProcessStatus::AwaitingSetup,
            pid: 0,
            last_error: None,
            status_text: None,
            output: BoundedLog::new(output_cap),
            cancel: None,
            instance: 0,
            awaiting_exit: false,
            auto_restarts: 0,
            recovery_for: None,
        }
    }

    pub fn status(&self) -> ProcessStatus {
        self.status
    }

    /// Launch number of the task currently (or last) owning this service.
    pub fn instance(&self) -> u64 {
        self.instance
    }

    pub fn has_live_task(&self) -> bool {
        self.cancel.is_some()
    }

    /// True from launch until the launch's exit event is applied, even after a stop.
    pub fn awaiting_exit(&self) -> bool {
        self.awaiting_exit
    }

    pub(crate) fn go_live(&mut self, cancel: CancellationToken, pid: u32, instance: u64) {
        self.cancel = Some(cancel);
        self.pid = pid;
        self.instance = instance;
        self.awaiting_exit = true;
        self.status = ProcessStatus::Initializing;
        self.status_text = None;
    }

    pub(crate) fn exit_observed(&mut self) {
        self.awaiting_exit = false;
    }

    /// Records a launch number without a live task (setup failures). No exit
    /// event will follow for it.
    pub(crate) fn set_instance(&mut self, instance: u64) {
        self.instance = instance;
        self.awaiting_exit = false;
    }

    /// Initializing -> Running. Returns false if the service is not initializing.
    pub(crate) fn mark_running(&mut self) -> bool {
        if self.status == ProcessStatus::Initializing && self.cancel.is_some() {
            self.status = ProcessStatus::Running;
            true
        } else {
            false
        }
    }

    /// Closes the cancel token if one is held. Closing twice is a no-op.
    pub(crate) fn close_token(&mut self) -> bool {
        match self.cancel.take() {
            Some(token) => {
                token.cancel();
                true
            }
            None => false,
        }
    }

    /// Moves to a non-live status, releasing the task's token.
    pub(crate) fn settle(&mut self, status: ProcessStatus) {
        debug_assert!(!status.is_live(), "settle() called with live status {:?}", status);
        self.close_token();
        self.status = status;
        self.pid = 0;
    }

    /// Clears per-lifecycle leftovers ahead of a fresh start.
    pub(crate) fn reset_for_start(&mut self) {
        self.last_error = None;
        self.status_text = None;
        self.output.clear();
    }
}

/// Node readiness snapshot for one cluster role.
#[derive(Clone, Debug, Default)]
pub struct ClusterHealth {
    pub cluster: Option<String>,
    pub ready_nodes: u32,
    pub total_nodes: u32,
    pub error: Option<String>,
    pub is_loading: bool,
    pub last_updated: Option<SystemTime>,
}

impl ClusterHealth {
    pub fn for_cluster(cluster: Option<String>) -> Self {
        Self {
            cluster,
            ..Self::default()
        }
    }

    pub fn is_healthy(&self) -> bool {
        self.error.is_none() && self.total_nodes > 0 && self.ready_nodes == self.total_nodes
    }
}

/// Top-level UI mode, orthogonal to per-service status.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum AppMode {
    #[default]
    Initializing,
    MainView,
    ConnectionInput,
    HelpOverlay,
    LogOverlay,
    ConfigOverlay,
    Quitting,
}
