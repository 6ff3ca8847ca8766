//! Dashboard rendering. Everything here draws from a [`Snapshot`]; no state is
//! kept between frames.

pub mod theme;

use std::time::SystemTime;

use ratatui::Frame;
use ratatui::layout::{Constraint, Direction, Layout, Rect};
use ratatui::text::{Line, Span};
use ratatui::widgets::{Block, Borders, Clear, List, ListItem, ListState, Paragraph, Wrap};

use tunnelkeeper_core::flow::InputField;
use tunnelkeeper_core::state::{ActivityLevel, AppMode, ClusterHealth, OutputStream};
use tunnelkeeper_core::snapshot::{ServiceView, Snapshot};

pub use theme::styles;

const ACTIVITY_HEIGHT: u16 = 7;

/// Format a SystemTime as HH:MM:SS (UTC)
fn format_timestamp(time: SystemTime) -> String {
    match time.duration_since(SystemTime::UNIX_EPOCH) {
        Ok(duration) => {
            let secs = duration.as_secs();
            let hours = (secs / 3600) % 24;
            let minutes = (secs / 60) % 60;
            let seconds = secs % 60;
            format!("{:02}:{:02}:{:02}", hours, minutes, seconds)
        }
        Err(_) => "??:??:??".to_string(),
    }
}

fn fit_title(s: &str, width: u16) -> String {
    // width includes borders
    let max = width.saturating_sub(4) as usize;
    if max == 0 {
        return "".into();
    }
    let chars: Vec<char> = s.chars().collect();
    if chars.len() <= max {
        return s.to_string();
    }
    if max <= 1 {
        return "…".into();
    }
    let mut out: String = chars.into_iter().take(max - 1).collect();
    out.push('…');
    out
}

fn centered(area: Rect, width: u16, height: u16) -> Rect {
    let width = width.min(area.width.saturating_sub(2)).max(1);
    let height = height.min(area.height.saturating_sub(2)).max(1);
    Rect {
        x: area.x + area.width.saturating_sub(width) / 2,
        y: area.y + area.height.saturating_sub(height) / 2,
        width,
        height,
    }
}

pub fn draw(f: &mut Frame, snapshot: &Snapshot) {
    let area = f.area();

    // [ top bar ]
    // [ services | output ]
    // [ activity ]
    // [ footer ]
    let outer = Layout::default()
        .direction(Direction::Vertical)
        .constraints([
            Constraint::Length(1),
            Constraint::Min(3),
            Constraint::Length(ACTIVITY_HEIGHT),
            Constraint::Length(1),
        ])
        .split(area);

    let main = Layout::default()
        .direction(Direction::Horizontal)
        .constraints([Constraint::Percentage(40), Constraint::Percentage(60)])
        .split(outer[1]);

    draw_top_bar(f, outer[0], snapshot);
    draw_services(f, main[0], snapshot);
    draw_output(f, main[1], snapshot);
    draw_activity(f, outer[2], snapshot);
    draw_footer(f, outer[3], snapshot);

    match snapshot.mode {
        AppMode::HelpOverlay => draw_help(f, area),
        AppMode::LogOverlay => draw_log_overlay(f, area, snapshot),
        AppMode::ConfigOverlay => draw_config_overlay(f, area, snapshot),
        AppMode::ConnectionInput => draw_connection_form(f, area, snapshot),
        _ => {}
    }
}

fn health_spans(role: &str, health: &ClusterHealth) -> Vec<Span<'static>> {
    let Some(cluster) = health.cluster.clone() else {
        return Vec::new();
    };
    let detail = if let Some(err) = &health.error {
        format!("unreachable ({})", err)
    } else if health.last_updated.is_none() {
        "checking…".to_string()
    } else {
        format!("{}/{} nodes ready", health.ready_nodes, health.total_nodes)
    };
    vec![
        Span::styled(format!("{} ", role), styles::text_muted()),
        Span::styled(cluster, styles::text()),
        Span::raw(" "),
        Span::styled(
            format!("{} {}", styles::health_icon(health), detail),
            styles::health(health),
        ),
        Span::raw("   "),
    ]
}

fn draw_top_bar(f: &mut Frame, area: Rect, snapshot: &Snapshot) {
    let mut spans = vec![Span::styled(" tunnelkeeper ", styles::accent_bold())];

    match &snapshot.active {
        Some(_) => {
            spans.extend(health_spans("primary", &snapshot.primary));
            spans.extend(health_spans("secondary", &snapshot.secondary));
            spans.push(Span::styled(
                format!(
                    "{}/{} running",
                    snapshot.running_count(),
                    snapshot.services.len()
                ),
                styles::text_dim(),
            ));
        }
        None => spans.push(Span::styled("no cluster selected", styles::text_muted())),
    }

    if let Some(flow) = &snapshot.flow {
        spans.push(Span::raw("   "));
        spans.push(Span::styled(
            format!("⟳ {}: {}", flow.target.display(), flow.step.label()),
            styles::warn(),
        ));
    }

    f.render_widget(Paragraph::new(Line::from(spans)), area);
}

fn service_item(service: &ServiceView) -> ListItem<'static> {
    let mut spans = vec![
        Span::styled(
            format!("{} ", styles::status_icon(service.status)),
            styles::status(service.status),
        ),
        Span::styled(format!("{:<18}", service.label), styles::text()),
        Span::styled(
            format!(" {:<12}", service.status.label()),
            styles::status(service.status),
        ),
    ];
    if let Some(port) = service.local_port {
        spans.push(Span::styled(format!(" :{}", port), styles::text_dim()));
    }
    if service.auto_restarts > 0 {
        spans.push(Span::styled(
            format!(" ↻{}", service.auto_restarts),
            styles::warn(),
        ));
    }
    if !service.blocked_on.is_empty() {
        spans.push(Span::styled(
            format!(" waits on {}", service.blocked_on.join(", ")),
            styles::warn(),
        ));
    }
    ListItem::new(Line::from(spans))
}

fn draw_services(f: &mut Frame, area: Rect, snapshot: &Snapshot) {
    let title = match &snapshot.active {
        Some(pair) => format!(" Services · {} ", pair.display()),
        None => " Services ".to_string(),
    };
    let block = Block::default()
        .title(fit_title(&title, area.width))
        .borders(Borders::ALL)
        .border_style(styles::border_focused());

    if snapshot.services.is_empty() {
        let text = match snapshot.mode {
            AppMode::Initializing => "detecting active cluster…",
            _ => "no services for this cluster pair",
        };
        f.render_widget(
            Paragraph::new(Line::from(Span::styled(text, styles::text_muted()))).block(block),
            area,
        );
        return;
    }

    let items: Vec<ListItem> = snapshot.services.iter().map(service_item).collect();
    let list = List::new(items)
        .block(block)
        .highlight_style(styles::selection())
        .highlight_symbol("▶ ");
    let mut state = ListState::default();
    state.select(snapshot.selected);
    f.render_stateful_widget(list, area, &mut state);
}

fn draw_output(f: &mut Frame, area: Rect, snapshot: &Snapshot) {
    let Some(service) = snapshot.selected_service() else {
        let block = Block::default()
            .title(" Output ")
            .borders(Borders::ALL)
            .border_style(styles::border_subtle());
        f.render_widget(block, area);
        return;
    };

    let title = format!(" {} · {} ", service.label, service.description);
    let block = Block::default()
        .title(fit_title(&title, area.width))
        .borders(Borders::ALL)
        .border_style(styles::border_subtle());

    let mut header = Vec::new();
    let pid = if service.pid > 0 {
        format!("pid {}", service.pid)
    } else {
        "not running".to_string()
    };
    let mut summary = vec![
        Span::styled(service.kind.label(), styles::text_dim()),
        Span::raw("  "),
        Span::styled(service.role.label(), styles::text_dim()),
        Span::raw("  "),
        Span::styled(pid, styles::text_dim()),
    ];
    if let Some(text) = &service.status_text {
        summary.push(Span::raw("  "));
        summary.push(Span::styled(text.clone(), styles::status(service.status)));
    }
    header.push(Line::from(summary));
    if let Some(err) = &service.last_error {
        header.push(Line::from(Span::styled(err.clone(), styles::error())));
    }

    let room = area.height.saturating_sub(2) as usize;
    let budget = room.saturating_sub(header.len());
    let skip = service.output.len().saturating_sub(budget);
    let mut lines = header;
    if service.output.is_empty() {
        lines.push(Line::from(Span::styled("no output yet", styles::text_muted())));
    }
    for line in service.output.iter().skip(skip) {
        let style = match line.stream {
            OutputStream::Stdout => styles::text(),
            OutputStream::Stderr => styles::warn(),
        };
        lines.push(Line::from(Span::styled(line.text.clone(), style)));
    }

    f.render_widget(Paragraph::new(lines).block(block), area);
}

fn activity_line(at: SystemTime, level: ActivityLevel, text: &str) -> Line<'static> {
    Line::from(vec![
        Span::styled(format!("{} ", format_timestamp(at)), styles::text_muted()),
        Span::styled(text.to_string(), styles::activity(level)),
    ])
}

fn draw_activity(f: &mut Frame, area: Rect, snapshot: &Snapshot) {
    let block = Block::default()
        .title(" Activity ")
        .borders(Borders::ALL)
        .border_style(styles::border_subtle());
    let room = area.height.saturating_sub(2) as usize;
    let skip = snapshot.activity.len().saturating_sub(room);
    let lines: Vec<Line> = snapshot
        .activity
        .iter()
        .skip(skip)
        .map(|e| activity_line(e.at, e.level, &e.text))
        .collect();
    f.render_widget(Paragraph::new(lines).block(block), area);
}

fn hint(key: &'static str, action: &'static str) -> [Span<'static>; 2] {
    [
        Span::styled(format!(" {} ", key), styles::key_hint()),
        Span::styled(format!("{} ", action), styles::text_dim()),
    ]
}

fn draw_footer(f: &mut Frame, area: Rect, snapshot: &Snapshot) {
    if snapshot.mode == AppMode::Quitting {
        let line = Line::from(Span::styled(" stopping services…", styles::warn()));
        f.render_widget(Paragraph::new(line), area);
        return;
    }
    if let Some(message) = &snapshot.status_message {
        let line = Line::from(Span::styled(
            format!(" {}", message.text),
            styles::activity(message.level),
        ));
        f.render_widget(Paragraph::new(line), area);
        return;
    }

    let hints: &[(&str, &str)] = match snapshot.mode {
        AppMode::ConnectionInput => &[
            ("Enter", "connect"),
            ("Tab", "complete"),
            ("↑↓", "field"),
            ("Esc", "cancel"),
        ],
        AppMode::HelpOverlay | AppMode::LogOverlay | AppMode::ConfigOverlay => {
            &[("Esc", "close")]
        }
        _ => &[
            ("↑↓", "select"),
            ("r", "restart"),
            ("s", "stop/start"),
            ("c", "connect"),
            ("l", "log"),
            ("g", "config"),
            ("?", "help"),
            ("q", "quit"),
        ],
    };
    let spans: Vec<Span> = hints
        .iter()
        .flat_map(|&(key, action)| hint(key, action))
        .collect();
    f.render_widget(Paragraph::new(Line::from(spans)), area);
}

fn overlay_block(title: &str) -> Block<'_> {
    Block::default()
        .borders(Borders::ALL)
        .border_style(styles::border_focused())
        .title(title)
}

fn draw_help(f: &mut Frame, area: Rect) {
    let rect = centered(area, 56, 20);
    f.render_widget(Clear, rect);

    let key_line = |key: &'static str, text: &'static str| {
        Line::from(vec![
            Span::styled(format!("  {:<8}", key), styles::key_hint()),
            Span::styled(text, styles::text()),
        ])
    };
    let lines = vec![
        Line::from(Span::styled("SERVICES", styles::section_header())),
        key_line("↑/k ↓/j", "Select service"),
        key_line("r", "Restart selected service"),
        key_line("s", "Stop or start selected service"),
        Line::from(""),
        Line::from(Span::styled("CLUSTERS", styles::section_header())),
        key_line("c", "Connect to another cluster pair"),
        key_line("Tab", "Complete cluster name"),
        Line::from(""),
        Line::from(Span::styled("VIEWS", styles::section_header())),
        key_line("l", "Activity log"),
        key_line("g", "Configuration"),
        key_line("?", "This help"),
        Line::from(""),
        key_line("q", "Quit (Ctrl+C works everywhere)"),
    ];

    let block = overlay_block(" Help - Press ? or Esc to close ");
    f.render_widget(Paragraph::new(lines).block(block), rect);
}

fn draw_log_overlay(f: &mut Frame, area: Rect, snapshot: &Snapshot) {
    let rect = centered(area, area.width * 9 / 10, area.height * 8 / 10);
    f.render_widget(Clear, rect);

    let room = rect.height.saturating_sub(2) as usize;
    let skip = snapshot.activity.len().saturating_sub(room);
    let mut lines: Vec<Line> = snapshot
        .activity
        .iter()
        .skip(skip)
        .map(|e| activity_line(e.at, e.level, &e.text))
        .collect();
    if lines.is_empty() {
        lines.push(Line::from(Span::styled("nothing logged yet", styles::text_muted())));
    }

    let title = format!(
        " Activity log · {} stale event(s) discarded ",
        snapshot.stale_discarded
    );
    f.render_widget(
        Paragraph::new(lines).block(overlay_block(&title)),
        rect,
    );
}

fn draw_config_overlay(f: &mut Frame, area: Rect, snapshot: &Snapshot) {
    let rect = centered(area, area.width * 9 / 10, area.height * 8 / 10);
    f.render_widget(Clear, rect);

    let lines: Vec<Line> = snapshot
        .config_lines
        .iter()
        .map(|l| Line::from(Span::styled(l.clone(), styles::text())))
        .collect();
    f.render_widget(
        Paragraph::new(lines)
            .wrap(Wrap { trim: false })
            .block(overlay_block(" Configuration ")),
        rect,
    );
}

fn draw_connection_form(f: &mut Frame, area: Rect, snapshot: &Snapshot) {
    let Some(form) = &snapshot.form else {
        return;
    };
    let rect = centered(area, 60, 7);
    f.render_widget(Clear, rect);

    let field = |label: &'static str, value: &str, focused: bool| {
        let marker = if focused { "▸ " } else { "  " };
        let style = if focused {
            styles::accent_bold()
        } else {
            styles::text_dim()
        };
        let cursor = if focused { "_" } else { "" };
        Line::from(vec![
            Span::styled(marker, styles::key_hint()),
            Span::styled(format!("{:<10}", label), style),
            Span::styled(format!("{}{}", value, cursor), styles::text()),
        ])
    };

    let lines = vec![
        field("primary", &form.primary, form.focus == InputField::Primary),
        field(
            "secondary",
            &form.secondary,
            form.focus == InputField::Secondary,
        ),
        Line::from(""),
        Line::from(Span::styled(
            "leave secondary empty to connect to the primary only",
            styles::text_muted(),
        )),
    ];

    f.render_widget(
        Paragraph::new(lines).block(overlay_block(" Connect ")),
        rect,
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use ratatui::Terminal;
    use ratatui::backend::TestBackend;
    use tunnelkeeper_core::flow::ConnectionForm;
    use tunnelkeeper_core::model::{ClusterPair, ClusterRole, ServiceKind};
    use tunnelkeeper_core::state::{ActivityEntry, ProcessStatus};

    fn snapshot(mode: AppMode) -> Snapshot {
        let pair = ClusterPair::new("alpha", Some("edge".into()));
        Snapshot {
            mode,
            active: Some(pair),
            services: vec![ServiceView {
                label: "api-tunnel".into(),
                kind: ServiceKind::Tunnel,
                role: ClusterRole::Primary,
                status: ProcessStatus::Running,
                pid: 42,
                local_port: Some(8080),
                description: "svc/api 8080:80".into(),
                last_error: None,
                status_text: None,
                auto_restarts: 0,
                blocked_on: vec![],
                output: vec![],
            }],
            selected: Some(0),
            primary: ClusterHealth {
                cluster: Some("alpha".into()),
                ready_nodes: 3,
                total_nodes: 3,
                last_updated: Some(SystemTime::now()),
                ..Default::default()
            },
            secondary: ClusterHealth::for_cluster(Some("alpha-edge".into())),
            activity: vec![ActivityEntry {
                at: SystemTime::now(),
                level: ActivityLevel::Info,
                text: "connected to alpha".into(),
            }],
            flow: None,
            form: None,
            status_message: None,
            config_lines: vec!["context prefix: \"tp-\"".into()],
            terminal_size: (100, 30),
            stale_discarded: 0,
        }
    }

    fn render(snapshot: &Snapshot) -> String {
        let mut terminal = Terminal::new(TestBackend::new(100, 30)).unwrap();
        terminal.draw(|f| draw(f, snapshot)).unwrap();
        let buffer = terminal.backend().buffer();
        let width = buffer.area.width as usize;
        let symbols: Vec<&str> = buffer.content().iter().map(|c| c.symbol()).collect();
        symbols
            .chunks(width)
            .map(|row| row.concat())
            .collect::<Vec<_>>()
            .join("\n")
    }

    #[test]
    fn test_main_view_shows_services_and_health() {
        let screen = render(&snapshot(AppMode::MainView));
        assert!(screen.contains("api-tunnel"));
        assert!(screen.contains("3/3 nodes ready"));
        assert!(screen.contains("connected to alpha"));
        assert!(screen.contains("restart"));
    }

    #[test]
    fn test_connection_form_overlay() {
        let mut snap = snapshot(AppMode::ConnectionInput);
        snap.form = Some(ConnectionForm::prefilled(Some(&ClusterPair::new(
            "beta", None,
        ))));
        let screen = render(&snap);
        assert!(screen.contains("Connect"));
        assert!(screen.contains("beta_"));
    }

    #[test]
    fn test_fit_title_truncates() {
        assert_eq!(fit_title("abcdef", 10), "abcdef");
        assert_eq!(fit_title("abcdefghijkl", 8), "abc…");
        assert_eq!(fit_title("abc", 3), "");
    }
}
