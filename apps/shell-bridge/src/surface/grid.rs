use alacritty_terminal::{
    Term,
    event::{Event, EventListener},
    grid::{Dimensions, Scroll},
    index::{Column, Line, Point},
    term::{Config, TermMode, cell::Cell as AlacrittyCell, cell::Flags as CellFlags},
    vte::ansi::{Color as AnsiColor, CursorShape, NamedColor, Processor},
};

use super::Viewport;

struct TermDimensions {
    columns: usize,
    screen_lines: usize,
}

impl From<Viewport> for TermDimensions {
    fn from(viewport: Viewport) -> Self {
        Self {
            columns: usize::from(viewport.cols()),
            screen_lines: usize::from(viewport.rows()),
        }
    }
}

impl Dimensions for TermDimensions {
    fn total_lines(&self) -> usize {
        self.screen_lines
    }

    fn screen_lines(&self) -> usize {
        self.screen_lines
    }

    fn columns(&self) -> usize {
        self.columns
    }
}

#[derive(Clone, Copy, Default)]
struct EventProxy;

impl EventListener for EventProxy {
    fn send_event(&self, _event: Event) {}
}

/// Grid model behind the surface: an alacritty `Term` fed by a vte parser.
pub(crate) struct GridModel {
    term: Term<EventProxy>,
    parser: Processor,
}

unsafe impl Send for GridModel {}

impl GridModel {
    pub(crate) fn new(viewport: Viewport, scrollback: usize) -> Self {
        let config = Config {
            scrolling_history: scrollback,
            ..Config::default()
        };
        let dimensions = TermDimensions::from(viewport);
        Self {
            term: Term::new(config, &dimensions, EventProxy),
            parser: Processor::new(),
        }
    }

    pub(crate) fn advance(&mut self, bytes: &[u8]) {
        for byte in bytes {
            self.parser.advance(&mut self.term, *byte);
        }
    }

    pub(crate) fn resize(&mut self, viewport: Viewport) {
        self.term.resize(TermDimensions::from(viewport));
    }

    pub(crate) fn scroll(&mut self, delta: i32) {
        self.term.scroll_display(Scroll::Delta(delta));
    }

    pub(crate) fn scroll_to_bottom(&mut self) {
        self.term.scroll_display(Scroll::Bottom);
    }

    pub(crate) fn bracketed_paste(&self) -> bool {
        self.term.mode().contains(TermMode::BRACKETED_PASTE)
    }

    pub(crate) fn app_cursor(&self) -> bool {
        self.term.mode().contains(TermMode::APP_CURSOR)
    }

    /// Column of the write cursor, visible or not.
    pub(crate) fn cursor_column(&self) -> usize {
        self.term.grid().cursor.point.column.0
    }

    pub(crate) fn snapshot(&self, viewport: Viewport) -> ScreenSnapshot {
        let grid = self.term.grid();
        let columns = grid.columns();
        let screen_lines = grid.screen_lines();
        let display_offset = grid.display_offset();

        let mut rows = Vec::with_capacity(screen_lines);
        for row in 0..screen_lines {
            let line = Line(row as i32 - display_offset as i32);
            let cells = (0..columns)
                .map(|col| CellSnapshot::from(&grid[Point::new(line, Column(col))]))
                .collect();
            rows.push(cells);
        }

        let cursor = self.term.renderable_content().cursor;
        let cursor = if cursor.shape == CursorShape::Hidden {
            None
        } else {
            let row = cursor.point.line.0 + display_offset as i32;
            usize::try_from(row)
                .ok()
                .filter(|row| *row < screen_lines)
                .map(|row| (row, cursor.point.column.0))
        };

        ScreenSnapshot {
            viewport,
            rows,
            cursor,
            display_offset,
            history_size: grid.history_size(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CellColor {
    #[default]
    Default,
    Indexed(u8),
    Rgb(u8, u8, u8),
}

impl CellColor {
    pub const RED: CellColor = CellColor::Indexed(1);
    pub const GREEN: CellColor = CellColor::Indexed(2);
    pub const YELLOW: CellColor = CellColor::Indexed(3);
}

impl From<&AnsiColor> for CellColor {
    fn from(color: &AnsiColor) -> Self {
        match color {
            AnsiColor::Spec(rgb) => CellColor::Rgb(rgb.r, rgb.g, rgb.b),
            AnsiColor::Indexed(idx) => CellColor::Indexed(*idx),
            AnsiColor::Named(name) => match name {
                NamedColor::Foreground
                | NamedColor::BrightForeground
                | NamedColor::DimForeground
                | NamedColor::Background
                | NamedColor::Cursor => CellColor::Default,
                other => u8::try_from(*other as usize)
                    .map(CellColor::Indexed)
                    .unwrap_or(CellColor::Default),
            },
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CellSnapshot {
    pub ch: char,
    pub fg: CellColor,
    pub bg: CellColor,
    pub bold: bool,
    pub italic: bool,
    pub underline: bool,
    pub inverse: bool,
    pub dim: bool,
    /// Trailing half of a double-width glyph; renders as nothing.
    pub wide_spacer: bool,
}

impl Default for CellSnapshot {
    fn default() -> Self {
        Self {
            ch: ' ',
            fg: CellColor::Default,
            bg: CellColor::Default,
            bold: false,
            italic: false,
            underline: false,
            inverse: false,
            dim: false,
            wide_spacer: false,
        }
    }
}

impl From<&AlacrittyCell> for CellSnapshot {
    fn from(cell: &AlacrittyCell) -> Self {
        let flags = cell.flags;
        Self {
            ch: if flags.contains(CellFlags::HIDDEN) {
                ' '
            } else {
                cell.c
            },
            fg: CellColor::from(&cell.fg),
            bg: CellColor::from(&cell.bg),
            bold: flags.intersects(CellFlags::BOLD | CellFlags::DIM_BOLD | CellFlags::BOLD_ITALIC),
            italic: flags.intersects(CellFlags::ITALIC | CellFlags::BOLD_ITALIC),
            underline: flags.intersects(CellFlags::ALL_UNDERLINES),
            inverse: flags.contains(CellFlags::INVERSE),
            dim: flags.intersects(CellFlags::DIM | CellFlags::DIM_BOLD),
            wide_spacer: flags
                .intersects(CellFlags::WIDE_CHAR_SPACER | CellFlags::LEADING_WIDE_CHAR_SPACER),
        }
    }
}

/// What the surface currently shows, detached from the grid model.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ScreenSnapshot {
    pub viewport: Viewport,
    pub rows: Vec<Vec<CellSnapshot>>,
    /// `(row, col)` of a visible cursor.
    pub cursor: Option<(usize, usize)>,
    pub display_offset: usize,
    pub history_size: usize,
}

impl ScreenSnapshot {
    pub fn empty(viewport: Viewport) -> Self {
        Self {
            viewport,
            ..Self::default()
        }
    }

    pub fn cell(&self, row: usize, col: usize) -> Option<&CellSnapshot> {
        self.rows.get(row).and_then(|cells| cells.get(col))
    }

    pub fn row_text(&self, row: usize) -> Option<String> {
        self.rows.get(row).map(|cells| {
            let text: String = cells
                .iter()
                .filter(|cell| !cell.wide_spacer)
                .map(|cell| cell.ch)
                .collect();
            text.trim_end().to_string()
        })
    }

    /// Visible text, one line per row, trailing blank rows dropped.
    pub fn text(&self) -> String {
        let mut lines: Vec<String> = (0..self.rows.len())
            .filter_map(|row| self.row_text(row))
            .collect();
        while lines.last().is_some_and(|line| line.is_empty()) {
            lines.pop();
        }
        lines.join("\n")
    }

    /// Cell position where `needle` starts, searching row by row.
    pub fn find(&self, needle: &str) -> Option<(usize, usize)> {
        let needle: Vec<char> = needle.chars().collect();
        if needle.is_empty() {
            return None;
        }
        for (row, cells) in self.rows.iter().enumerate() {
            let visible: Vec<(usize, char)> = cells
                .iter()
                .enumerate()
                .filter(|(_, cell)| !cell.wide_spacer)
                .map(|(col, cell)| (col, cell.ch))
                .collect();
            if let Some(start) = visible.windows(needle.len()).position(|window| {
                window
                    .iter()
                    .map(|(_, ch)| *ch)
                    .eq(needle.iter().copied())
            }) {
                return Some((row, visible[start].0));
            }
        }
        None
    }
}
