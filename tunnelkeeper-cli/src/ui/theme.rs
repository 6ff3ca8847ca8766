//! Color palette and style helpers for the dashboard.

use ratatui::style::{Color, Modifier, Style};

use tunnelkeeper_core::state::{ActivityLevel, ClusterHealth, ProcessStatus};

/// Color palette tokens
#[derive(Clone, Debug)]
pub struct Palette {
    /// Panel border color
    pub panel_border: Color,
    /// Primary text color
    pub text: Color,
    /// Dimmed text (secondary info)
    pub text_dim: Color,
    /// Muted text (tertiary info, disabled)
    pub text_muted: Color,
    /// Accent color (highlights, focus)
    pub accent: Color,
    /// Running, healthy
    pub success: Color,
    /// Initializing, degraded, loading
    pub warn: Color,
    /// Failed, unreachable
    pub error: Color,
    pub selection_bg: Color,
    pub selection_fg: Color,
    pub key_hint: Color,
}

impl Default for Palette {
    fn default() -> Self {
        Self::dark()
    }
}

impl Palette {
    pub fn dark() -> Self {
        Self {
            panel_border: Color::Rgb(60, 60, 60),
            text: Color::Rgb(212, 212, 212),
            text_dim: Color::Rgb(150, 150, 150),
            text_muted: Color::Rgb(100, 100, 100),
            accent: Color::Rgb(79, 193, 255),      // Light blue
            success: Color::Rgb(78, 201, 176),     // Teal green
            warn: Color::Rgb(220, 180, 100),       // Amber
            error: Color::Rgb(244, 135, 113),      // Coral red
            selection_bg: Color::Rgb(38, 79, 120), // Dark blue
            selection_fg: Color::White,
            key_hint: Color::Rgb(206, 145, 120), // Soft orange
        }
    }
}

#[derive(Clone, Debug, Default)]
pub struct Theme {
    pub palette: Palette,
}

impl Theme {
    pub fn status_style(&self, status: ProcessStatus) -> Style {
        let color = match status {
            ProcessStatus::Running => self.palette.success,
            ProcessStatus::Initializing | ProcessStatus::Degraded => self.palette.warn,
            ProcessStatus::Failed => self.palette.error,
            ProcessStatus::Stopped => self.palette.text_muted,
            ProcessStatus::AwaitingSetup => self.palette.text_dim,
        };
        Style::default().fg(color)
    }

    pub fn status_icon(&self, status: ProcessStatus) -> &'static str {
        match status {
            ProcessStatus::Running => "●",
            ProcessStatus::Initializing => "◐",
            ProcessStatus::Degraded => "⟲",
            ProcessStatus::Failed => "✗",
            ProcessStatus::Stopped => "○",
            ProcessStatus::AwaitingSetup => "…",
        }
    }

    pub fn health_style(&self, health: &ClusterHealth) -> Style {
        let color = if health.error.is_some() {
            self.palette.error
        } else if health.is_loading || health.last_updated.is_none() {
            self.palette.text_muted
        } else if health.is_healthy() {
            self.palette.success
        } else {
            self.palette.warn
        };
        Style::default().fg(color)
    }

    pub fn health_icon(&self, health: &ClusterHealth) -> &'static str {
        if health.error.is_some() {
            "!"
        } else if health.last_updated.is_none() {
            "?"
        } else if health.is_healthy() {
            "✓"
        } else {
            "~"
        }
    }

    pub fn activity_style(&self, level: ActivityLevel) -> Style {
        let color = match level {
            ActivityLevel::Info => self.palette.text_dim,
            ActivityLevel::Warn => self.palette.warn,
            ActivityLevel::Error => self.palette.error,
        };
        Style::default().fg(color)
    }

    pub fn key_hint_style(&self) -> Style {
        Style::default().fg(self.palette.key_hint)
    }

    pub fn subtle_border_style(&self) -> Style {
        Style::default().fg(self.palette.panel_border)
    }

    pub fn focused_border_style(&self) -> Style {
        Style::default().fg(self.palette.accent)
    }

    pub fn selection_style(&self) -> Style {
        Style::default()
            .bg(self.palette.selection_bg)
            .fg(self.palette.selection_fg)
            .add_modifier(Modifier::BOLD)
    }

    pub fn text_style(&self) -> Style {
        Style::default().fg(self.palette.text)
    }

    pub fn text_dim_style(&self) -> Style {
        Style::default().fg(self.palette.text_dim)
    }

    pub fn text_muted_style(&self) -> Style {
        Style::default().fg(self.palette.text_muted)
    }

    pub fn accent_bold_style(&self) -> Style {
        Style::default()
            .fg(self.palette.accent)
            .add_modifier(Modifier::BOLD)
    }

    pub fn warn_style(&self) -> Style {
        Style::default().fg(self.palette.warn)
    }

    pub fn error_style(&self) -> Style {
        Style::default().fg(self.palette.error)
    }

    pub fn section_header_style(&self) -> Style {
        Style::default()
            .fg(self.palette.accent)
            .add_modifier(Modifier::BOLD)
    }
}

static DEFAULT_THEME: std::sync::OnceLock<Theme> = std::sync::OnceLock::new();

pub fn theme() -> &'static Theme {
    DEFAULT_THEME.get_or_init(Theme::default)
}

/// Shorthands over the global theme
pub mod styles {
    use super::*;

    pub fn status(status: ProcessStatus) -> Style {
        theme().status_style(status)
    }

    pub fn status_icon(status: ProcessStatus) -> &'static str {
        theme().status_icon(status)
    }

    pub fn health(health: &ClusterHealth) -> Style {
        theme().health_style(health)
    }

    pub fn health_icon(health: &ClusterHealth) -> &'static str {
        theme().health_icon(health)
    }

    pub fn activity(level: ActivityLevel) -> Style {
        theme().activity_style(level)
    }

    pub fn key_hint() -> Style {
        theme().key_hint_style()
    }

    pub fn border_subtle() -> Style {
        theme().subtle_border_style()
    }

    pub fn border_focused() -> Style {
        theme().focused_border_style()
    }

    pub fn selection() -> Style {
        theme().selection_style()
    }

    pub fn text() -> Style {
        theme().text_style()
    }

    pub fn text_dim() -> Style {
        theme().text_dim_style()
    }

    pub fn text_muted() -> Style {
        theme().text_muted_style()
    }

    pub fn accent_bold() -> Style {
        theme().accent_bold_style()
    }

    pub fn warn() -> Style {
        theme().warn_style()
    }

    pub fn error() -> Style {
        theme().error_style()
    }

    pub fn section_header() -> Style {
        theme().section_header_style()
    }
}
