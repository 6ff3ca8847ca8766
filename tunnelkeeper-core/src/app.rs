//! The dispatcher.
//!
//! [`App`] owns every piece of mutable dashboard state. The event loop feeds it one
//! [`Message`] at a time; each handler updates state and returns the background
//! [`Task`]s to run next. Handlers never block and never fail: anything unexpected
//! is logged and dropped.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::{Instant, SystemTime};

use tracing::{debug, error, info, trace, warn};

use crate::cluster::ClusterCatalog;
use crate::config::DashboardConfig;
use crate::flow::{ConnectionFlowState, ConnectionForm, FlowStep};
use crate::graph::DependencyGraph;
use crate::health::HealthPoller;
use crate::message::{
    DetectedContext, Exit, FlowEvent, FlowOutcome, HealthReport, Inbox, Key, Message,
    ProcessEvent, ProcessEventKind, Task,
};
use crate::model::{ClusterPair, ClusterRole, ServiceConfig, ServiceKind, ServiceLabel};
use crate::recovery::recovery_wanted;
use crate::snapshot::{FlowView, ServiceView, Snapshot, StatusMessage};
use crate::state::{
    ActivityEntry, ActivityLevel, AppMode, BoundedLog, OutputLine, ProcessState, ProcessStatus,
};
use crate::supervisor::{Launcher, ProcessSupervisor};

pub struct App {
    config: DashboardConfig,
    supervisor: ProcessSupervisor,
    mode: AppMode,
    active: Option<ClusterPair>,
    services: BTreeMap<ServiceLabel, ServiceConfig>,
    processes: BTreeMap<ServiceLabel, ProcessState>,
    /// Display and start order
    order: Vec<ServiceLabel>,
    graph: DependencyGraph,
    health: HealthPoller,
    flow: Option<ConnectionFlowState>,
    next_flow_id: u64,
    form: ConnectionForm,
    catalog: Option<ClusterCatalog>,
    activity: BoundedLog<ActivityEntry>,
    status_message: Option<StatusMessage>,
    selected: usize,
    terminal_size: (u16, u16),
    stale_discarded: u64,
    /// Startup context detection is in flight
    detecting: bool,
    /// Exits still owed by launches that were replaced or dropped
    superseded: BTreeSet<(ServiceLabel, u64)>,
}

impl App {
    pub fn new(config: DashboardConfig, launcher: Arc<dyn Launcher>, inbox: Inbox) -> Self {
        let health = HealthPoller::new(config.timings.health_interval());
        let activity = BoundedLog::new(config.limits.activity_log);
        Self {
            config,
            supervisor: ProcessSupervisor::new(launcher, inbox),
            mode: AppMode::Initializing,
            active: None,
            services: BTreeMap::new(),
            processes: BTreeMap::new(),
            order: Vec::new(),
            graph: DependencyGraph::default(),
            health,
            flow: None,
            next_flow_id: 0,
            form: ConnectionForm::default(),
            catalog: None,
            activity,
            status_message: None,
            selected: 0,
            terminal_size: (0, 0),
            stale_discarded: 0,
            detecting: false,
            superseded: BTreeSet::new(),
        }
    }

    /// First tasks after startup: connect to `initial` when given, otherwise find
    /// out which context is already active.
    pub fn boot(&mut self, initial: Option<ClusterPair>) -> Vec<Task> {
        match initial {
            Some(pair) => self.submit_connection(pair),
            None => {
                self.log(ActivityLevel::Info, "detecting active context".into());
                self.detecting = true;
                vec![Task::DetectActiveContext]
            }
        }
    }

    pub fn mode(&self) -> AppMode {
        self.mode
    }

    pub fn is_quitting(&self) -> bool {
        self.mode == AppMode::Quitting
    }

    pub fn config(&self) -> &DashboardConfig {
        &self.config
    }

    pub fn process(&self, label: &str) -> Option<&ProcessState> {
        self.processes.get(label)
    }

    /// Launches whose exit event is still outstanding, superseded ones included.
    pub fn awaiting_exits(&self) -> usize {
        self.processes.values().filter(|s| s.awaiting_exit()).count() + self.superseded.len()
    }

    pub fn handle(&mut self, message: Message) -> Vec<Task> {
        trace!(message = message.name(), "dispatch");

        if self.mode == AppMode::Quitting {
            return match message {
                Message::Process(event) => self.on_process(event),
                Message::Key(_) | Message::Resize { .. } => Vec::new(),
                other => {
                    debug!(message = other.name(), "dropped while quitting");
                    Vec::new()
                }
            };
        }

        match message {
            Message::Key(key) => self.on_key(key),
            Message::Resize { width, height } => {
                self.terminal_size = (width, height);
                Vec::new()
            }
            Message::Process(event) => self.on_process(event),
            Message::HealthTick { generation } => self
                .health
                .on_tick(generation, self.active.as_ref(), &self.config.clusters)
                .unwrap_or_default(),
            Message::Health(report) => {
                self.on_health(report);
                Vec::new()
            }
            Message::Flow(event) => self.on_flow(event),
            Message::ActiveContext(result) => self.on_active_context(result),
            Message::ClustersListed(result) => {
                match result {
                    Ok(catalog) => {
                        debug!(primaries = catalog.primaries.len(), "cluster catalog loaded");
                        self.catalog = Some(catalog);
                    }
                    Err(err) => self.notify(
                        ActivityLevel::Warn,
                        format!("could not list clusters: {}", err),
                    ),
                }
                Vec::new()
            }
            Message::RecoveryDue { label, instance } => {
                self.on_recovery_due(&label, instance);
                Vec::new()
            }
        }
    }

    // ---- keys ----

    fn on_key(&mut self, key: Key) -> Vec<Task> {
        if key == Key::CtrlC {
            return self.begin_quit();
        }
        match self.mode {
            AppMode::Initializing | AppMode::MainView => self.main_key(key),
            AppMode::ConnectionInput => self.input_key(key),
            AppMode::HelpOverlay | AppMode::LogOverlay | AppMode::ConfigOverlay => {
                let own = match self.mode {
                    AppMode::HelpOverlay => '?',
                    AppMode::LogOverlay => 'l',
                    _ => 'g',
                };
                if matches!(key, Key::Esc | Key::Char('q')) || key == Key::Char(own) {
                    self.mode = AppMode::MainView;
                }
                Vec::new()
            }
            AppMode::Quitting => Vec::new(),
        }
    }

    fn main_key(&mut self, key: Key) -> Vec<Task> {
        match key {
            Key::Char('q') => return self.begin_quit(),
            Key::Char('c') => return self.open_connection_input(),
            Key::Char('?') => self.mode = AppMode::HelpOverlay,
            Key::Char('l') => self.mode = AppMode::LogOverlay,
            Key::Char('g') => self.mode = AppMode::ConfigOverlay,
            Key::Up | Key::Char('k') => self.selected = self.selected.saturating_sub(1),
            Key::Down | Key::Char('j') => {
                if self.selected + 1 < self.order.len() {
                    self.selected += 1;
                }
            }
            Key::Char('r') => {
                if let Some(label) = self.selected_label() {
                    self.restart_service(&label, true);
                }
            }
            Key::Char('s') => {
                if let Some(label) = self.selected_label() {
                    self.toggle_service(&label);
                }
            }
            _ => {}
        }
        Vec::new()
    }

    fn input_key(&mut self, key: Key) -> Vec<Task> {
        match key {
            Key::Esc => {
                self.mode = AppMode::MainView;
            }
            Key::Enter => match self.form.submit() {
                Ok(pair) => return self.submit_connection(pair),
                Err(err) => self.notify(ActivityLevel::Warn, err.to_string()),
            },
            Key::Tab => match &self.catalog {
                Some(catalog) => {
                    self.form.complete(catalog);
                }
                None => {
                    self.set_status(ActivityLevel::Info, "cluster list not loaded yet".into());
                    return vec![Task::ListClusters];
                }
            },
            Key::BackTab | Key::Up | Key::Down => self.form.toggle_focus(),
            Key::Backspace => self.form.backspace(),
            Key::Char(ch) => self.form.push(ch),
            Key::CtrlC => {}
        }
        Vec::new()
    }

    fn open_connection_input(&mut self) -> Vec<Task> {
        let current = self
            .flow
            .as_ref()
            .map(|f| &f.target)
            .or(self.active.as_ref());
        self.form = ConnectionForm::prefilled(current);
        self.mode = AppMode::ConnectionInput;
        vec![Task::ListClusters]
    }

    fn begin_quit(&mut self) -> Vec<Task> {
        if self.mode == AppMode::Quitting {
            return Vec::new();
        }
        let stopped = self.stop_all();
        self.health.pause();
        if let Some(flow) = self.flow.take() {
            info!(flow = flow.id, step = flow.step.label(), "abandoning connection flow");
        }
        self.mode = AppMode::Quitting;
        info!(stopped, "quitting");
        Vec::new()
    }

    fn selected_label(&self) -> Option<ServiceLabel> {
        self.order.get(self.selected).cloned()
    }

    // ---- services ----

    fn start_service(&mut self, label: &str) {
        let result = match (self.services.get(label), self.processes.get_mut(label)) {
            (Some(service), Some(state)) => self.supervisor.start(service, state),
            _ => return,
        };
        if let Err(err) = result {
            self.notify(ActivityLevel::Error, err.to_string());
        }
    }

    /// Restart through the supervisor. A manual restart begins a new lifecycle
    /// and so resets the automatic restart budget.
    fn restart_service(&mut self, label: &str, manual: bool) {
        let result = match (self.services.get(label), self.processes.get_mut(label)) {
            (Some(service), Some(state)) => {
                if manual {
                    state.auto_restarts = 0;
                }
                if state.awaiting_exit() {
                    self.superseded.insert((label.to_string(), state.instance()));
                }
                self.supervisor.restart(service, state)
            }
            _ => return,
        };
        match result {
            Ok(_) => self.log(ActivityLevel::Info, format!("restarting {}", label)),
            Err(err) => self.notify(ActivityLevel::Error, err.to_string()),
        }
    }

    fn toggle_service(&mut self, label: &str) {
        let Some(state) = self.processes.get_mut(label) else {
            return;
        };
        if state.status().is_live() || state.status() == ProcessStatus::Degraded {
            self.supervisor.stop(state);
            self.log(ActivityLevel::Info, format!("stopped {}", label));
        } else {
            self.restart_service(label, true);
        }
    }

    /// Best-effort stop of every service, dependents first. Returns how many live
    /// tasks were cancelled.
    fn stop_all(&mut self) -> usize {
        let mut stopped = 0;
        for label in self.order.iter().rev() {
            let Some(state) = self.processes.get_mut(label) else {
                continue;
            };
            if !state.has_live_task() && state.status() == ProcessStatus::Degraded {
                debug!(label = %label, "no live task to cancel");
            }
            if self.supervisor.stop(state) {
                stopped += 1;
            }
        }
        stopped
    }

    /// Replaces the service set for `pair`, starts everything in dependency order
    /// and restarts health polling.
    fn reinitialize(&mut self, pair: ClusterPair) -> Vec<Task> {
        self.stop_all();
        for (label, state) in &self.processes {
            if state.awaiting_exit() {
                self.superseded.insert((label.clone(), state.instance()));
            }
        }

        let services = self.config.services_for(&pair);
        self.graph = DependencyGraph::build(&services);
        self.order = self.graph.topo_order();
        let output_cap = self.config.limits.output_lines;
        self.processes = services
            .iter()
            .map(|s| {
                let state = ProcessState::new(s.label.clone(), s.kind(), output_cap);
                (s.label.clone(), state)
            })
            .collect();
        self.services = services.into_iter().map(|s| (s.label.clone(), s)).collect();
        self.selected = 0;
        self.active = Some(pair.clone());

        info!(cluster = %pair.display(), services = self.order.len(), "reinitializing");
        for label in self.order.clone() {
            self.start_service(&label);
        }

        self.mode = AppMode::MainView;
        self.health.restart(&pair, &self.config.clusters)
    }

    fn on_process(&mut self, event: ProcessEvent) -> Vec<Task> {
        if matches!(event.kind, ProcessEventKind::Exited(_))
            && self.superseded.remove(&(event.label.clone(), event.instance))
        {
            debug!(label = %event.label, instance = event.instance, "superseded launch exited");
            self.stale_discarded += 1;
            return Vec::new();
        }
        let Some(state) = self.processes.get_mut(&event.label) else {
            debug!(label = %event.label, "event for unknown service");
            self.stale_discarded += 1;
            return Vec::new();
        };
        if event.instance != state.instance() {
            debug!(
                label = %event.label,
                instance = event.instance,
                current = state.instance(),
                "dropping event from superseded launch"
            );
            self.stale_discarded += 1;
            return Vec::new();
        }

        match event.kind {
            ProcessEventKind::Output { stream, text } => {
                state.output.push(OutputLine {
                    at: SystemTime::now(),
                    stream,
                    text,
                });
            }
            ProcessEventKind::StatusText(text) => state.status_text = Some(text),
            ProcessEventKind::Ready => {
                if state.mark_running() {
                    info!(label = %event.label, "service running");
                }
            }
            ProcessEventKind::Exited(exit) => return self.on_exit(&event.label, event.instance, exit),
        }
        Vec::new()
    }

    fn on_exit(&mut self, label: &str, instance: u64, exit: Exit) -> Vec<Task> {
        let max = self.config.limits.max_auto_restarts;
        let backoff = self.config.timings.recovery_backoff();
        let Some(state) = self.processes.get_mut(label) else {
            return Vec::new();
        };
        state.exit_observed();

        let was_stopped = state.status() == ProcessStatus::Stopped;
        state.status_text = Some(exit.status_text.clone());
        let Some(fault) = exit.fault else {
            state.settle(ProcessStatus::Stopped);
            info!(label, "service exited");
            return Vec::new();
        };
        state.last_error = Some(fault.to_string());

        if was_stopped {
            debug!(label, %fault, "fault after stop request");
            return Vec::new();
        }

        let recover = state.kind == ServiceKind::Proxy
            && recovery_wanted(&exit.status_text, &fault)
            && state.auto_restarts < max;
        if recover {
            state.settle(ProcessStatus::Degraded);
            state.auto_restarts += 1;
            state.recovery_for = Some(instance);
            let attempt = state.auto_restarts;
            self.log(
                ActivityLevel::Warn,
                format!(
                    "{}: {}; restarting in {}ms ({}/{})",
                    label,
                    fault,
                    backoff.as_millis(),
                    attempt,
                    max
                ),
            );
            return vec![Task::Recover {
                label: label.to_string(),
                instance,
                after: backoff,
            }];
        }

        state.settle(ProcessStatus::Failed);
        let hint = match state.kind {
            ServiceKind::Tunnel => "; press r to restart",
            ServiceKind::Proxy => "",
        };
        self.notify(ActivityLevel::Error, format!("{} failed: {}{}", label, fault, hint));

        let dependents: Vec<String> = self
            .graph
            .dependents(label)
            .into_iter()
            .cloned()
            .collect();
        if !dependents.is_empty() {
            self.log(
                ActivityLevel::Warn,
                format!("{} now waiting on {}", dependents.join(", "), label),
            );
        }
        Vec::new()
    }

    fn on_recovery_due(&mut self, label: &str, instance: u64) {
        let due = self.processes.get(label).is_some_and(|state| {
            state.recovery_for == Some(instance) && state.status() == ProcessStatus::Degraded
        });
        if !due {
            debug!(label, instance, "recovery no longer wanted");
            self.stale_discarded += 1;
            return;
        }
        info!(label, instance, "automatic restart");
        self.restart_service(label, false);
    }

    // ---- health ----

    fn on_health(&mut self, report: HealthReport) {
        let had_error = self.health.get(report.role).error.is_some();
        let failure = report.result.as_ref().err().cloned();
        let (cluster, role) = (report.cluster.clone(), report.role);

        match self.health.apply(report, self.active.as_ref()) {
            Ok(()) => {
                if let (Some(err), false) = (failure, had_error) {
                    self.log(
                        ActivityLevel::Warn,
                        format!("health check for {} ({}) failed: {}", cluster, role, err),
                    );
                }
            }
            Err(stale) => {
                self.stale_discarded += 1;
                debug!(
                    reported = %stale.reported,
                    current = ?stale.current,
                    role = %role,
                    "discarding stale health report"
                );
            }
        }
    }

    // ---- connection flow ----

    /// Starts a new flow for `target`, superseding any flow in progress.
    fn submit_connection(&mut self, target: ClusterPair) -> Vec<Task> {
        let stopped = self.stop_all();
        debug!(stopped, "stopped services ahead of connection change");
        self.detecting = false;

        self.next_flow_id += 1;
        let id = self.next_flow_id;
        let primary = target.primary.clone();
        self.log(ActivityLevel::Info, format!("connecting to {}", target.display()));
        if let Some(old) = self.flow.replace(ConnectionFlowState::new(id, target)) {
            info!(old = old.id, new = id, "superseding connection flow");
        }
        self.mode = AppMode::MainView;

        vec![Task::Authenticate {
            flow_id: id,
            role: ClusterRole::Primary,
            cluster: primary,
        }]
    }

    fn on_flow(&mut self, event: FlowEvent) -> Vec<Task> {
        let mut flow = match self.flow.take() {
            Some(flow) if flow.id == event.flow_id => flow,
            other => {
                debug!(flow = event.flow_id, "dropping result of superseded flow");
                self.flow = other;
                self.stale_discarded += 1;
                return Vec::new();
            }
        };

        match event.outcome {
            FlowOutcome::Authenticated {
                role,
                cluster,
                result,
            } => {
                if flow.step != FlowStep::login_for(role) {
                    debug!(step = flow.step.label(), role = %role, "unexpected login result");
                    self.flow = Some(flow);
                    return Vec::new();
                }
                let output = match result {
                    Ok(output) => output,
                    Err(err) => return self.fail_flow(flow, err),
                };
                flow.record("login", &output.stdout);
                flow.record("login", &output.stderr);
                self.log(ActivityLevel::Info, format!("logged in to {}", cluster));

                let task = match (role, flow.target.qualified_secondary()) {
                    (ClusterRole::Primary, Some(secondary)) => {
                        flow.advance(FlowStep::AwaitingSecondaryLogin);
                        Task::Authenticate {
                            flow_id: flow.id,
                            role: ClusterRole::Secondary,
                            cluster: secondary,
                        }
                    }
                    _ => {
                        flow.advance(FlowStep::SwitchingContext);
                        Task::SwitchContext {
                            flow_id: flow.id,
                            context: self.config.context_for(&flow.target.target_cluster()),
                        }
                    }
                };
                self.flow = Some(flow);
                vec![task]
            }
            FlowOutcome::ContextSwitched { context, result } => {
                if flow.step != FlowStep::SwitchingContext {
                    debug!(step = flow.step.label(), "unexpected context switch result");
                    self.flow = Some(flow);
                    return Vec::new();
                }
                if let Err(err) = result {
                    return self.fail_flow(flow, err);
                }
                flow.advance(FlowStep::Reinitializing);
                self.log(ActivityLevel::Info, format!("switched to {}", context));
                let tasks = self.reinitialize(flow.target.clone());
                flow.advance(FlowStep::Done);
                debug!(flow = flow.id, transcript = ?flow.transcript, "connection flow done");
                self.set_status(
                    ActivityLevel::Info,
                    format!("connected to {}", flow.target.display()),
                );
                tasks
            }
        }
    }

    /// Aborts the flow. Nothing already done (a completed login) is undone.
    fn fail_flow(&mut self, mut flow: ConnectionFlowState, err: String) -> Vec<Task> {
        let step = flow.step;
        flow.record("error", &err);
        flow.advance(FlowStep::Failed);
        warn!(flow = flow.id, step = step.label(), transcript = ?flow.transcript, "connection flow failed");
        self.notify(ActivityLevel::Error, format!("{} failed: {}", step.label(), err));
        Vec::new()
    }

    fn on_active_context(&mut self, result: Result<DetectedContext, String>) -> Vec<Task> {
        if !std::mem::take(&mut self.detecting) {
            debug!("active context detected after a connection was requested; ignoring");
            self.stale_discarded += 1;
            return Vec::new();
        }
        // The operator may already be typing a pair; leave the form alone then.
        let in_form = self.mode == AppMode::ConnectionInput;

        let detected = match result {
            Ok(detected) => detected,
            Err(err) => {
                self.notify(
                    ActivityLevel::Warn,
                    format!("could not detect active context: {}", err),
                );
                return if in_form { Vec::new() } else { self.open_connection_input() };
            }
        };
        if let Some(catalog) = detected.catalog {
            self.catalog = Some(catalog);
        }

        let Some(cluster) = self.config.clusters.cluster_for(&detected.context) else {
            self.notify(
                ActivityLevel::Warn,
                format!("context {} does not match the configured prefix", detected.context),
            );
            return if in_form { Vec::new() } else { self.open_connection_input() };
        };
        let pair = match self.catalog.as_ref().and_then(|c| c.resolve(cluster)) {
            Some((primary, secondary)) => ClusterPair::new(primary, secondary),
            None => ClusterPair::new(cluster, None),
        };

        self.log(
            ActivityLevel::Info,
            format!("using active context {} ({})", detected.context, pair.display()),
        );
        let tasks = self.reinitialize(pair);
        if in_form {
            self.mode = AppMode::ConnectionInput;
        }
        tasks
    }

    // ---- reporting ----

    fn log(&mut self, level: ActivityLevel, text: String) {
        match level {
            ActivityLevel::Info => info!(activity = %text),
            ActivityLevel::Warn => warn!(activity = %text),
            ActivityLevel::Error => error!(activity = %text),
        }
        self.activity.push(ActivityEntry {
            at: SystemTime::now(),
            level,
            text,
        });
    }

    fn set_status(&mut self, level: ActivityLevel, text: String) {
        self.status_message = Some(StatusMessage {
            text,
            level,
            expires_at: Instant::now() + self.config.timings.status_message(),
        });
    }

    /// User-facing failure: a short-lived status message plus a permanent log line.
    fn notify(&mut self, level: ActivityLevel, text: String) {
        self.set_status(level, text.clone());
        self.log(level, text);
    }

    fn is_running(&self, label: &str) -> bool {
        self.processes
            .get(label)
            .is_some_and(|s| s.status() == ProcessStatus::Running)
    }

    pub fn snapshot(&self) -> Snapshot {
        let selected = self.order.get(self.selected);
        let services = self
            .order
            .iter()
            .filter_map(|label| {
                let service = self.services.get(label)?;
                let state = self.processes.get(label)?;
                let output = if Some(label) == selected {
                    state.output.iter().cloned().collect()
                } else {
                    Vec::new()
                };
                Some(ServiceView {
                    label: label.clone(),
                    kind: service.kind(),
                    role: service.role,
                    status: state.status(),
                    pid: state.pid,
                    local_port: service.local_port(),
                    description: service.describe(),
                    last_error: state.last_error.clone(),
                    status_text: state.status_text.clone(),
                    auto_restarts: state.auto_restarts,
                    blocked_on: self.graph.blocked_on(label, |dep| self.is_running(dep)),
                    output,
                })
            })
            .collect();

        let mut config_lines = vec![
            format!("context prefix: {:?}", self.config.clusters.context_prefix),
            format!("login: {}", self.config.tools.login.join(" ")),
            format!(
                "health every {}s, recovery backoff {}ms, max {} auto restart(s)",
                self.config.timings.health_interval_secs,
                self.config.timings.recovery_backoff_ms,
                self.config.limits.max_auto_restarts
            ),
        ];
        for label in &self.order {
            if let Some(service) = self.services.get(label) {
                config_lines.push(format!(
                    "{:<24} {:<6} {:<9} {}",
                    label,
                    service.kind().label(),
                    service.role.label(),
                    service.describe()
                ));
            }
        }

        Snapshot {
            mode: self.mode,
            active: self.active.clone(),
            services,
            selected: selected.map(|_| self.selected),
            primary: self.health.get(ClusterRole::Primary).clone(),
            secondary: self.health.get(ClusterRole::Secondary).clone(),
            activity: self.activity.iter().cloned().collect(),
            flow: self.flow.as_ref().map(|f| FlowView {
                target: f.target.clone(),
                step: f.step,
                transcript: f.transcript.clone(),
            }),
            form: (self.mode == AppMode::ConnectionInput).then(|| self.form.clone()),
            status_message: self
                .status_message
                .clone()
                .filter(|m| m.expires_at > Instant::now()),
            config_lines,
            terminal_size: self.terminal_size,
            stale_discarded: self.stale_discarded,
        }
    }
}
