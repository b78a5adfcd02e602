use ratatui::Frame;
use ratatui::layout::{Constraint, Direction, Layout, Rect};
use ratatui::style::{Color, Modifier, Style};
use ratatui::text::{Line, Span};
use ratatui::widgets::Paragraph;

use crate::session::{ConnectionState, SessionState};
use crate::surface::{CellColor, CellSnapshot, ScreenSnapshot};

/// Rows taken by the status bar under the terminal body.
pub const STATUS_ROWS: u16 = 1;

pub fn draw(frame: &mut Frame<'_>, screen: &ScreenSnapshot, state: &SessionState) {
    let chunks = Layout::default()
        .direction(Direction::Vertical)
        .constraints([Constraint::Min(1), Constraint::Length(STATUS_ROWS)])
        .split(frame.area());
    let body = chunks[0];

    let lines: Vec<Line<'static>> = screen
        .rows
        .iter()
        .take(usize::from(body.height))
        .map(|cells| row_line(cells))
        .collect();
    frame.render_widget(Paragraph::new(lines), body);

    if screen.display_offset == 0 {
        if let Some((row, col)) = screen.cursor {
            if let Some(position) = cursor_position(body, row, col) {
                frame.set_cursor_position(position);
            }
        }
    }

    frame.render_widget(status_line(screen, state), chunks[1]);
}

fn cursor_position(area: Rect, row: usize, col: usize) -> Option<(u16, u16)> {
    let row = u16::try_from(row).ok().filter(|row| *row < area.height)?;
    let col = u16::try_from(col).ok().filter(|col| *col < area.width)?;
    Some((area.x + col, area.y + row))
}

/// One terminal row, with neighbouring cells of the same style merged into a span.
fn row_line(cells: &[CellSnapshot]) -> Line<'static> {
    let mut spans = Vec::new();
    let mut run = String::new();
    let mut run_style: Option<Style> = None;
    for cell in cells.iter().filter(|cell| !cell.wide_spacer) {
        let style = cell_style(cell);
        if run_style.is_some_and(|current| current != style) {
            spans.push(Span::styled(std::mem::take(&mut run), run_style.unwrap_or_default()));
        }
        run_style = Some(style);
        run.push(cell.ch);
    }
    if !run.is_empty() {
        spans.push(Span::styled(run, run_style.unwrap_or_default()));
    }
    Line::from(spans)
}

fn cell_style(cell: &CellSnapshot) -> Style {
    let mut style = Style::default();
    if let Some(fg) = to_color(cell.fg) {
        style = style.fg(fg);
    }
    if let Some(bg) = to_color(cell.bg) {
        style = style.bg(bg);
    }
    let mut modifiers = Modifier::empty();
    if cell.bold {
        modifiers |= Modifier::BOLD;
    }
    if cell.italic {
        modifiers |= Modifier::ITALIC;
    }
    if cell.underline {
        modifiers |= Modifier::UNDERLINED;
    }
    if cell.inverse {
        modifiers |= Modifier::REVERSED;
    }
    if cell.dim {
        modifiers |= Modifier::DIM;
    }
    style.add_modifier(modifiers)
}

fn to_color(color: CellColor) -> Option<Color> {
    match color {
        CellColor::Default => None,
        CellColor::Indexed(idx) => Some(Color::Indexed(idx)),
        CellColor::Rgb(r, g, b) => Some(Color::Rgb(r, g, b)),
    }
}

fn state_style(state: ConnectionState) -> Style {
    let color = match state {
        ConnectionState::Open => Color::Green,
        ConnectionState::Connecting | ConnectionState::Reconnecting => Color::Yellow,
        ConnectionState::Idle | ConnectionState::Closed => Color::Red,
    };
    Style::default().fg(color).add_modifier(Modifier::BOLD)
}

fn status_line(screen: &ScreenSnapshot, state: &SessionState) -> Paragraph<'static> {
    let mut spans = vec![Span::styled(
        state.connection.as_str().to_string(),
        state_style(state.connection),
    )];
    if let Some(session_id) = &state.session_id {
        spans.push(Span::raw(format!(" • {session_id}")));
    }
    spans.push(Span::raw(format!(" • {}", state.viewport)));
    if state.reconnects > 0 {
        spans.push(Span::raw(format!(" • reconnects {}", state.reconnects)));
    }
    if screen.display_offset > 0 {
        spans.push(Span::styled(
            format!(" • scrollback -{}", screen.display_offset),
            Style::default().fg(Color::Yellow),
        ));
    }
    spans.push(Span::styled(
        "  Ctrl+Q quit",
        Style::default().add_modifier(Modifier::DIM),
    ));
    Paragraph::new(Line::from(spans))
}
