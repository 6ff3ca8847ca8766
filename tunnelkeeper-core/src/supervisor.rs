//! Start/stop/restart of supervised services.
//!
//! The supervisor only touches [`ProcessState`] records handed to it by the event
//! loop. Spawning is delegated to a [`Launcher`], which returns as soon as the
//! service is initiated and reports everything after that through the inbox.

use std::sync::Arc;

use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::message::Inbox;
use crate::model::ServiceConfig;
use crate::state::{ProcessState, ProcessStatus};

/// A live launch: the token that stops it and the OS pid (0 if none).
#[derive(Debug)]
pub struct Launched {
    pub cancel: CancellationToken,
    pub pid: u32,
}

/// Synchronous failure to initiate a service. Never retried.
#[derive(Debug, Error)]
pub enum LaunchError {
    #[error("empty command for {label}")]
    EmptyCommand { label: String },
    #[error("executable not found for {label}: {program}")]
    ExecutableMissing { label: String, program: String },
    #[error("failed to spawn {label}: {source}")]
    Spawn {
        label: String,
        #[source]
        source: std::io::Error,
    },
}

/// Spawns the background task for one launch of a service.
///
/// Implementations must return without waiting on the service's lifetime. The
/// spawned task owns the subprocess until the token is cancelled, the process
/// exits, or it hits an unrecoverable error, and in every case sends exactly one
/// [`ProcessEventKind::Exited`](crate::message::ProcessEventKind::Exited) tagged
/// with `instance` as its final event.
pub trait Launcher: Send + Sync {
    fn launch(
        &self,
        service: &ServiceConfig,
        instance: u64,
        cancel: CancellationToken,
        inbox: Inbox,
    ) -> Result<Launched, LaunchError>;
}

pub struct ProcessSupervisor {
    launcher: Arc<dyn Launcher>,
    inbox: Inbox,
    next_instance: u64,
}

impl ProcessSupervisor {
    pub fn new(launcher: Arc<dyn Launcher>, inbox: Inbox) -> Self {
        Self {
            launcher,
            inbox,
            next_instance: 1,
        }
    }

    /// Starts a launch of `service`, closing any launch still live in `state` first.
    ///
    /// On success the state is `Initializing` with a fresh token; on failure it is
    /// `Failed` with the setup error recorded.
    pub fn start(
        &mut self,
        service: &ServiceConfig,
        state: &mut ProcessState,
    ) -> Result<u32, LaunchError> {
        if state.close_token() {
            debug!(label = %service.label, "closed previous launch before start");
        }

        let instance = self.next_instance;
        self.next_instance += 1;

        let cancel = CancellationToken::new();
        match self
            .launcher
            .launch(service, instance, cancel.clone(), self.inbox.clone())
        {
            Ok(launched) => {
                info!(label = %service.label, instance, pid = launched.pid, "service launched");
                state.go_live(launched.cancel, launched.pid, instance);
                Ok(launched.pid)
            }
            Err(err) => {
                cancel.cancel();
                state.set_instance(instance);
                state.last_error = Some(err.to_string());
                state.settle(ProcessStatus::Failed);
                Err(err)
            }
        }
    }

    /// Stops the service. Safe to call any number of times.
    ///
    /// Returns whether a live launch was cancelled. The status is set to `Stopped`
    /// straight away; the task's own exit event has the final word.
    pub fn stop(&self, state: &mut ProcessState) -> bool {
        let had_task = state.has_live_task();
        if !had_task && state.status() == ProcessStatus::Stopped {
            return false;
        }
        state.recovery_for = None;
        state.settle(ProcessStatus::Stopped);
        if had_task {
            info!(label = %state.label, instance = state.instance(), "stop requested");
        } else {
            debug!(label = %state.label, "stop without a live task");
        }
        had_task
    }

    /// Stop followed by a start with a fresh token, error and output buffer.
    pub fn restart(
        &mut self,
        service: &ServiceConfig,
        state: &mut ProcessState,
    ) -> Result<u32, LaunchError> {
        self.stop(state);
        state.reset_for_start();
        self.start(service, state)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::ServiceKind;
    use crate::test_support::{FakeLauncher, proxy_config, tunnel_config};

    fn supervisor(launcher: &Arc<FakeLauncher>) -> ProcessSupervisor {
        let (inbox, _rx) = Inbox::channel();
        ProcessSupervisor::new(launcher.clone(), inbox)
    }

    #[test]
    fn test_start_issues_live_token() {
        let launcher = Arc::new(FakeLauncher::default());
        let mut sup = supervisor(&launcher);
        let cfg = tunnel_config("api-tunnel");
        let mut state = ProcessState::new("api-tunnel", ServiceKind::Tunnel, 10);

        let pid = sup.start(&cfg, &mut state).unwrap();
        assert!(pid > 0);
        assert_eq!(state.status(), ProcessStatus::Initializing);
        assert!(state.has_live_task());
        assert_eq!(state.instance(), 1);
    }

    #[test]
    fn test_stop_twice_is_idempotent() {
        let launcher = Arc::new(FakeLauncher::default());
        let mut sup = supervisor(&launcher);
        let cfg = tunnel_config("api-tunnel");
        let mut state = ProcessState::new("api-tunnel", ServiceKind::Tunnel, 10);
        sup.start(&cfg, &mut state).unwrap();

        assert!(sup.stop(&mut state));
        let after_first = (state.status(), state.pid, state.instance(), state.has_live_task());

        assert!(!sup.stop(&mut state));
        let after_second = (state.status(), state.pid, state.instance(), state.has_live_task());

        assert_eq!(after_first, after_second);
        assert_eq!(state.status(), ProcessStatus::Stopped);
        assert!(launcher.token(1).unwrap().is_cancelled());
    }

    #[test]
    fn test_stop_without_token_is_noop_success() {
        let launcher = Arc::new(FakeLauncher::default());
        let sup = supervisor(&launcher);
        let mut state = ProcessState::new("api-tunnel", ServiceKind::Tunnel, 10);
        assert!(!sup.stop(&mut state));
        assert_eq!(state.status(), ProcessStatus::Stopped);
        assert!(!sup.stop(&mut state));
    }

    #[test]
    fn test_restart_closes_old_token_before_issuing_new() {
        let launcher = Arc::new(FakeLauncher::default());
        let mut sup = supervisor(&launcher);
        let cfg = proxy_config("metrics-proxy", &[]);
        let mut state = ProcessState::new("metrics-proxy", ServiceKind::Proxy, 10);

        sup.start(&cfg, &mut state).unwrap();
        state.last_error = Some("boom".into());
        sup.restart(&cfg, &mut state).unwrap();

        assert_eq!(launcher.overlaps(), 0);
        assert!(launcher.token(1).unwrap().is_cancelled());
        assert!(!launcher.token(2).unwrap().is_cancelled());
        assert_eq!(state.instance(), 2);
        assert_eq!(state.status(), ProcessStatus::Initializing);
        assert!(state.last_error.is_none());
    }

    #[test]
    fn test_start_on_live_state_replaces_launch() {
        let launcher = Arc::new(FakeLauncher::default());
        let mut sup = supervisor(&launcher);
        let cfg = tunnel_config("api-tunnel");
        let mut state = ProcessState::new("api-tunnel", ServiceKind::Tunnel, 10);

        sup.start(&cfg, &mut state).unwrap();
        sup.start(&cfg, &mut state).unwrap();
        assert_eq!(launcher.overlaps(), 0);
        assert!(launcher.token(1).unwrap().is_cancelled());
    }

    #[test]
    fn test_setup_error_marks_failed_without_token() {
        let launcher = Arc::new(FakeLauncher::default());
        launcher.fail_next("boom");
        let mut sup = supervisor(&launcher);
        let cfg = proxy_config("metrics-proxy", &[]);
        let mut state = ProcessState::new("metrics-proxy", ServiceKind::Proxy, 10);

        let err = sup.start(&cfg, &mut state).unwrap_err();
        assert!(matches!(err, LaunchError::Spawn { .. }));
        assert_eq!(state.status(), ProcessStatus::Failed);
        assert!(!state.has_live_task());
        assert!(state.last_error.as_deref().unwrap().contains("boom"));
    }
}
