//! Read-only views handed to the frontend.

use std::time::Instant;

use crate::flow::{ConnectionForm, FlowStep};
use crate::model::{ClusterPair, ClusterRole, ServiceKind, ServiceLabel};
use crate::state::{ActivityEntry, ActivityLevel, AppMode, ClusterHealth, OutputLine, ProcessStatus};

/// Short-lived status-bar message.
#[derive(Clone, Debug)]
pub struct StatusMessage {
    pub text: String,
    pub level: ActivityLevel,
    pub expires_at: Instant,
}

#[derive(Clone, Debug)]
pub struct ServiceView {
    pub label: ServiceLabel,
    pub kind: ServiceKind,
    pub role: ClusterRole,
    pub status: ProcessStatus,
    pub pid: u32,
    pub local_port: Option<u16>,
    pub description: String,
    pub last_error: Option<String>,
    pub status_text: Option<String>,
    pub auto_restarts: u32,
    /// Required tunnels that are not running
    pub blocked_on: Vec<ServiceLabel>,
    /// Recent output; only filled for the selected service
    pub output: Vec<OutputLine>,
}

#[derive(Clone, Debug)]
pub struct FlowView {
    pub target: ClusterPair,
    pub step: FlowStep,
    pub transcript: Vec<String>,
}

#[derive(Clone, Debug)]
pub struct Snapshot {
    pub mode: AppMode,
    pub active: Option<ClusterPair>,
    pub services: Vec<ServiceView>,
    pub selected: Option<usize>,
    pub primary: ClusterHealth,
    pub secondary: ClusterHealth,
    pub activity: Vec<ActivityEntry>,
    pub flow: Option<FlowView>,
    pub form: Option<ConnectionForm>,
    pub status_message: Option<StatusMessage>,
    pub config_lines: Vec<String>,
    pub terminal_size: (u16, u16),
    pub stale_discarded: u64,
}

impl Snapshot {
    pub fn selected_service(&self) -> Option<&ServiceView> {
        self.selected.and_then(|i| self.services.get(i))
    }

    pub fn running_count(&self) -> usize {
        self.services
            .iter()
            .filter(|s| s.status == ProcessStatus::Running)
            .count()
    }
}
