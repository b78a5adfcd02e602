//! Interactive front-end: draws a session in the local terminal and feeds it keystrokes.

pub mod inject;
pub mod render;

use crossterm::event::{
    self, DisableBracketedPaste, EnableBracketedPaste, Event, KeyCode, KeyEvent, KeyEventKind,
    KeyModifiers,
};
use crossterm::execute;
use crossterm::terminal::{
    EnterAlternateScreen, LeaveAlternateScreen, disable_raw_mode, enable_raw_mode,
};
use ratatui::Terminal;
use ratatui::backend::CrosstermBackend;
use std::io;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::session::{ConnectionState, SessionHandle};
use render::STATUS_ROWS;

const EVENT_POLL: Duration = Duration::from_millis(100);

#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("terminal setup failed: {0}")]
    Setup(io::Error),
    #[error("failed to draw: {0}")]
    Render(io::Error),
}

/// Raw mode, alternate screen and bracketed paste for as long as it lives.
struct TerminalGuard;

impl TerminalGuard {
    fn enter() -> Result<Self, ClientError> {
        enable_raw_mode().map_err(ClientError::Setup)?;
        // Constructed before the remaining setup so a failure below still restores raw mode.
        let guard = TerminalGuard;
        execute!(io::stdout(), EnterAlternateScreen, EnableBracketedPaste)
            .map_err(ClientError::Setup)?;
        Ok(guard)
    }
}

impl Drop for TerminalGuard {
    fn drop(&mut self) {
        let _ = execute!(io::stdout(), DisableBracketedPaste, LeaveAlternateScreen);
        let _ = disable_raw_mode();
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LocalAction {
    Quit,
    Scroll(i32),
}

/// Keys handled by the client itself instead of being sent to the shell.
pub fn local_binding(key: &KeyEvent, page: i32) -> Option<LocalAction> {
    if key.kind == KeyEventKind::Release {
        return None;
    }
    match key.code {
        KeyCode::Char(c)
            if key.modifiers.contains(KeyModifiers::CONTROL) && c.eq_ignore_ascii_case(&'q') =>
        {
            Some(LocalAction::Quit)
        }
        KeyCode::PageUp if key.modifiers.contains(KeyModifiers::SHIFT) => {
            Some(LocalAction::Scroll(page))
        }
        KeyCode::PageDown if key.modifiers.contains(KeyModifiers::SHIFT) => {
            Some(LocalAction::Scroll(-page))
        }
        _ => None,
    }
}

/// Grid size for a local terminal of `cols`×`rows`, leaving room for the status bar.
pub fn body_size(cols: u16, rows: u16) -> (u16, u16) {
    (cols.max(1), rows.saturating_sub(STATUS_ROWS).max(1))
}

/// Runs the interactive loop until the user quits or the session closes.
pub async fn run(handle: &SessionHandle) -> Result<(), ClientError> {
    let _guard = TerminalGuard::enter()?;
    let mut terminal =
        Terminal::new(CrosstermBackend::new(io::stdout())).map_err(ClientError::Setup)?;
    terminal.clear().map_err(ClientError::Setup)?;

    let size = terminal.size().map_err(ClientError::Setup)?;
    let (cols, mut rows) = body_size(size.width, size.height);
    handle.resize(cols, rows);

    let (event_tx, mut event_rx) = mpsc::unbounded_channel();
    let stop = Arc::new(AtomicBool::new(false));
    let reader_stop = Arc::clone(&stop);
    let reader = tokio::task::spawn_blocking(move || read_events(event_tx, reader_stop));

    let mut screen = handle.subscribe_screen();
    let mut state = handle.subscribe_state();
    let result = loop {
        let snapshot = screen.borrow_and_update().clone();
        let current = state.borrow_and_update().clone();
        if let Err(err) = terminal.draw(|frame| render::draw(frame, &snapshot, &current)) {
            break Err(ClientError::Render(err));
        }
        if current.connection == ConnectionState::Closed {
            break Ok(());
        }

        tokio::select! {
            event = event_rx.recv() => {
                let Some(event) = event else {
                    break Ok(());
                };
                match event {
                    Event::Key(key) => match local_binding(&key, i32::from(rows)) {
                        Some(LocalAction::Quit) => {
                            handle.dispose();
                            break Ok(());
                        }
                        Some(LocalAction::Scroll(delta)) => handle.scroll(delta),
                        None => handle.key(key),
                    },
                    Event::Paste(text) => handle.paste(text),
                    Event::Resize(width, height) => {
                        let (body_cols, body_rows) = body_size(width, height);
                        rows = body_rows;
                        handle.resize(body_cols, body_rows);
                    }
                    _ => {}
                }
            }
            changed = screen.changed() => {
                if changed.is_err() {
                    break Ok(());
                }
            }
            changed = state.changed() => {
                if changed.is_err() {
                    break Ok(());
                }
            }
        }
    };

    stop.store(true, Ordering::SeqCst);
    if let Err(err) = reader.await {
        warn!(target = "client", error = %err, "input reader ended abnormally");
    }
    let _ = terminal.show_cursor();
    result
}

fn read_events(events: mpsc::UnboundedSender<Event>, stop: Arc<AtomicBool>) {
    while !stop.load(Ordering::SeqCst) {
        match event::poll(EVENT_POLL) {
            Ok(true) => match event::read() {
                Ok(event) => {
                    if events.send(event).is_err() {
                        return;
                    }
                }
                Err(err) => {
                    debug!(target = "client", error = %err, "terminal read failed");
                    return;
                }
            },
            Ok(false) => {}
            Err(err) => {
                debug!(target = "client", error = %err, "terminal poll failed");
                return;
            }
        }
    }
}
