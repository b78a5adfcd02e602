//! Terminal surface: the grid model, its renderable state, and the translation between
//! user input and `input` frames.
//!
//! The surface does no network I/O. It reports keystrokes and viewport changes through the
//! `on_user_input` / `on_resize` observers and renders whatever text it is given.

mod grid;
pub mod keys;

use crossterm::event::KeyEvent;
use std::fmt;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, trace};

use grid::GridModel;
pub use grid::{CellColor, CellSnapshot, ScreenSnapshot};

pub const DEFAULT_SCROLLBACK: usize = 1000;
pub const DEFAULT_RESIZE_DEBOUNCE: Duration = Duration::from_millis(50);

const BRACKETED_PASTE_START: &str = "\x1b[200~";
const BRACKETED_PASTE_END: &str = "\x1b[201~";

/// Grid size in cells. Both dimensions are always at least one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Viewport {
    cols: u16,
    rows: u16,
}

impl Viewport {
    pub const DEFAULT: Viewport = Viewport { cols: 80, rows: 24 };

    pub fn new(cols: u16, rows: u16) -> Result<Self, SurfaceError> {
        Self::try_new(i64::from(cols), i64::from(rows))
    }

    /// Validates sizes coming from untyped sources (layout math, CLI, frames).
    pub fn try_new(cols: i64, rows: i64) -> Result<Self, SurfaceError> {
        let invalid = || SurfaceError::InvalidViewport { cols, rows };
        let cols_u16 = u16::try_from(cols).map_err(|_| invalid())?;
        let rows_u16 = u16::try_from(rows).map_err(|_| invalid())?;
        if cols_u16 == 0 || rows_u16 == 0 {
            return Err(invalid());
        }
        Ok(Self {
            cols: cols_u16,
            rows: rows_u16,
        })
    }

    pub fn cols(&self) -> u16 {
        self.cols
    }

    pub fn rows(&self) -> u16 {
        self.rows
    }
}

impl Default for Viewport {
    fn default() -> Self {
        Self::DEFAULT
    }
}

impl fmt::Display for Viewport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}", self.cols, self.rows)
    }
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum SurfaceError {
    #[error("invalid viewport {cols}x{rows}: both dimensions must be between 1 and 65535")]
    InvalidViewport { cols: i64, rows: i64 },
    #[error("terminal surface has been disposed")]
    Disposed,
}

#[derive(Debug, Clone, Copy)]
pub struct SurfaceOptions {
    pub scrollback: usize,
    pub resize_debounce: Duration,
}

impl Default for SurfaceOptions {
    fn default() -> Self {
        Self {
            scrollback: DEFAULT_SCROLLBACK,
            resize_debounce: DEFAULT_RESIZE_DEBOUNCE,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResizeOutcome {
    /// The size matches what observers last saw; nothing will be emitted.
    Unchanged,
    /// A resize event will be emitted by `flush_resize` once `deadline` passes.
    Scheduled { deadline: Instant },
}

type InputObserver = Box<dyn FnMut(String) + Send>;
type ResizeObserver = Box<dyn FnMut(Viewport) + Send>;

pub struct TerminalSurface {
    grid: Option<GridModel>,
    viewport: Viewport,
    options: SurfaceOptions,
    input_observer: Option<InputObserver>,
    resize_observer: Option<ResizeObserver>,
    last_emitted: Option<Viewport>,
    pending_resize: Option<Instant>,
}

impl TerminalSurface {
    pub fn new(viewport: Viewport, options: SurfaceOptions) -> Self {
        Self {
            grid: Some(GridModel::new(viewport, options.scrollback)),
            viewport,
            options,
            input_observer: None,
            resize_observer: None,
            last_emitted: None,
            pending_resize: None,
        }
    }

    pub fn viewport(&self) -> Viewport {
        self.viewport
    }

    pub fn is_disposed(&self) -> bool {
        self.grid.is_none()
    }

    /// Renders text, interpreting embedded control sequences.
    pub fn write(&mut self, text: &str) {
        match self.grid.as_mut() {
            Some(grid) => grid.advance(text.as_bytes()),
            None => trace!(target = "surface", bytes = text.len(), "write after dispose ignored"),
        }
    }

    pub fn on_user_input<F>(&mut self, observer: F)
    where
        F: FnMut(String) + Send + 'static,
    {
        if self.is_disposed() {
            return;
        }
        self.input_observer = Some(Box::new(observer));
    }

    pub fn on_resize<F>(&mut self, observer: F)
    where
        F: FnMut(Viewport) + Send + 'static,
    {
        if self.is_disposed() {
            return;
        }
        self.resize_observer = Some(Box::new(observer));
    }

    /// Forwards raw input verbatim.
    pub fn user_input(&mut self, data: &str) {
        if data.is_empty() {
            return;
        }
        let Some(grid) = self.grid.as_mut() else {
            return;
        };
        grid.scroll_to_bottom();
        if let Some(observer) = self.input_observer.as_mut() {
            observer(data.to_string());
        }
    }

    pub fn key(&mut self, key: &KeyEvent) {
        let Some(grid) = self.grid.as_ref() else {
            return;
        };
        if let Some(encoded) = keys::encode_key_event(key, grid.app_cursor()) {
            self.user_input(&encoded);
        }
    }

    /// Pasted text, wrapped in bracketed-paste markers when the program asked for them.
    pub fn paste(&mut self, text: &str) {
        let Some(grid) = self.grid.as_ref() else {
            return;
        };
        if grid.bracketed_paste() {
            let wrapped = format!("{BRACKETED_PASTE_START}{text}{BRACKETED_PASTE_END}");
            self.user_input(&wrapped);
        } else {
            self.user_input(text);
        }
    }

    /// Resizes the grid now and schedules a debounced resize event.
    pub fn resize(
        &mut self,
        cols: u16,
        rows: u16,
        now: Instant,
    ) -> Result<ResizeOutcome, SurfaceError> {
        let Some(grid) = self.grid.as_mut() else {
            return Err(SurfaceError::Disposed);
        };
        let viewport = Viewport::new(cols, rows)?;
        if viewport != self.viewport {
            grid.resize(viewport);
            self.viewport = viewport;
            debug!(target = "surface", %viewport, "grid resized");
        }
        if self.last_emitted == Some(viewport) {
            self.pending_resize = None;
            return Ok(ResizeOutcome::Unchanged);
        }
        let deadline = now + self.options.resize_debounce;
        self.pending_resize = Some(deadline);
        Ok(ResizeOutcome::Scheduled { deadline })
    }

    pub fn resize_deadline(&self) -> Option<Instant> {
        self.pending_resize
    }

    /// Emits the pending resize if its debounce window has elapsed.
    pub fn flush_resize(&mut self, now: Instant) -> Option<Viewport> {
        let deadline = self.pending_resize?;
        if now < deadline || self.is_disposed() {
            return None;
        }
        self.pending_resize = None;
        if self.last_emitted == Some(self.viewport) {
            return None;
        }
        Some(self.emit_viewport())
    }

    /// Emits the current viewport regardless of what was emitted before.
    pub fn sync_viewport(&mut self) -> Option<Viewport> {
        if self.is_disposed() {
            return None;
        }
        self.pending_resize = None;
        Some(self.emit_viewport())
    }

    fn emit_viewport(&mut self) -> Viewport {
        let viewport = self.viewport;
        self.last_emitted = Some(viewport);
        if let Some(observer) = self.resize_observer.as_mut() {
            observer(viewport);
        }
        viewport
    }

    /// Moves the view into scrollback; positive values go back in history.
    pub fn scroll(&mut self, delta: i32) {
        if let Some(grid) = self.grid.as_mut() {
            grid.scroll(delta);
        }
    }

    pub fn scroll_to_bottom(&mut self) {
        if let Some(grid) = self.grid.as_mut() {
            grid.scroll_to_bottom();
        }
    }

    /// Column the next write lands in; `None` once disposed.
    pub fn cursor_column(&self) -> Option<usize> {
        self.grid.as_ref().map(GridModel::cursor_column)
    }

    pub fn snapshot(&self) -> ScreenSnapshot {
        match self.grid.as_ref() {
            Some(grid) => grid.snapshot(self.viewport),
            None => ScreenSnapshot::empty(self.viewport),
        }
    }

    /// Releases the grid model and both observers. Safe to call more than once.
    pub fn dispose(&mut self) {
        if self.grid.take().is_none() {
            return;
        }
        self.input_observer = None;
        self.resize_observer = None;
        self.pending_resize = None;
        debug!(target = "surface", "disposed");
    }
}

impl Drop for TerminalSurface {
    fn drop(&mut self) {
        self.dispose();
    }
}
