//! Terminal setup, the ratatui frontend and the key reader thread.

use std::io;
use std::thread;
use std::time::Duration;

use crossterm::event::{self, Event, KeyCode, KeyEvent, KeyEventKind, KeyModifiers};
use crossterm::execute;
use crossterm::terminal::{
    EnterAlternateScreen, LeaveAlternateScreen, disable_raw_mode, enable_raw_mode,
};
use ratatui::Terminal;
use ratatui::backend::CrosstermBackend;
use tracing::{debug, warn};

use tunnelkeeper_core::message::{Inbox, Key, Message};
use tunnelkeeper_core::runtime::Frontend;
use tunnelkeeper_core::snapshot::Snapshot;

use crate::ui;

const POLL_INTERVAL: Duration = Duration::from_millis(50);

pub type Tui = Terminal<CrosstermBackend<io::Stdout>>;

pub fn setup_terminal() -> io::Result<Tui> {
    enable_raw_mode()?;
    let mut stdout = io::stdout();
    execute!(stdout, EnterAlternateScreen)?;
    let backend = CrosstermBackend::new(stdout);
    Terminal::new(backend)
}

pub fn restore_terminal(terminal: &mut Tui) -> io::Result<()> {
    disable_raw_mode()?;
    execute!(terminal.backend_mut(), LeaveAlternateScreen)?;
    terminal.show_cursor()?;
    Ok(())
}

pub struct TerminalFrontend {
    terminal: Tui,
}

impl TerminalFrontend {
    pub fn new(terminal: Tui) -> Self {
        Self { terminal }
    }

    pub fn restore(mut self) -> io::Result<()> {
        restore_terminal(&mut self.terminal)
    }
}

impl Frontend for TerminalFrontend {
    fn draw(&mut self, snapshot: &Snapshot) -> io::Result<()> {
        self.terminal.draw(|f| ui::draw(f, snapshot))?;
        Ok(())
    }
}

/// Maps a crossterm key press onto the dashboard's key set.
pub fn map_key(key: KeyEvent) -> Option<Key> {
    if key.kind != KeyEventKind::Press {
        return None;
    }
    if key.modifiers.contains(KeyModifiers::CONTROL) {
        return match key.code {
            KeyCode::Char('c') => Some(Key::CtrlC),
            _ => None,
        };
    }
    match key.code {
        KeyCode::Char(c) => Some(Key::Char(c)),
        KeyCode::Enter => Some(Key::Enter),
        KeyCode::Esc => Some(Key::Esc),
        KeyCode::Backspace => Some(Key::Backspace),
        KeyCode::Tab => Some(Key::Tab),
        KeyCode::BackTab => Some(Key::BackTab),
        KeyCode::Up => Some(Key::Up),
        KeyCode::Down => Some(Key::Down),
        _ => None,
    }
}

/// Reads terminal events on a dedicated thread and forwards them to the inbox.
/// The thread ends once the inbox is closed.
pub fn spawn_input_reader(inbox: Inbox) -> thread::JoinHandle<()> {
    thread::spawn(move || {
        loop {
            if inbox.is_closed() {
                break;
            }
            match event::poll(POLL_INTERVAL) {
                Ok(false) => continue,
                Ok(true) => {}
                Err(err) => {
                    warn!(%err, "terminal poll failed");
                    break;
                }
            }
            let message = match event::read() {
                Ok(Event::Key(key)) => map_key(key).map(Message::Key),
                Ok(Event::Resize(width, height)) => Some(Message::Resize { width, height }),
                Ok(_) => None,
                Err(err) => {
                    warn!(%err, "terminal read failed");
                    break;
                }
            };
            if let Some(message) = message {
                if !inbox.send(message) {
                    break;
                }
            }
        }
        debug!("input reader stopped");
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn press(code: KeyCode, modifiers: KeyModifiers) -> KeyEvent {
        KeyEvent::new(code, modifiers)
    }

    #[test]
    fn test_ctrl_c_maps_to_quit_key() {
        assert_eq!(
            map_key(press(KeyCode::Char('c'), KeyModifiers::CONTROL)),
            Some(Key::CtrlC)
        );
        assert_eq!(
            map_key(press(KeyCode::Char('c'), KeyModifiers::NONE)),
            Some(Key::Char('c'))
        );
        assert_eq!(map_key(press(KeyCode::Char('x'), KeyModifiers::CONTROL)), None);
    }

    #[test]
    fn test_releases_and_unmapped_keys_are_ignored() {
        let mut release = press(KeyCode::Enter, KeyModifiers::NONE);
        release.kind = KeyEventKind::Release;
        assert_eq!(map_key(release), None);
        assert_eq!(map_key(press(KeyCode::F(5), KeyModifiers::NONE)), None);
        assert_eq!(
            map_key(press(KeyCode::BackTab, KeyModifiers::SHIFT)),
            Some(Key::BackTab)
        );
    }
}
