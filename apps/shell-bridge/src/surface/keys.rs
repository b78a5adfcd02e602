use crossterm::event::{KeyCode, KeyEvent, KeyEventKind, KeyModifiers};

/// Encodes a key press as the bytes a shell expects on its input stream.
///
/// `app_cursor` selects SS3 arrow sequences (DECCKM set by the running program).
/// Releases and keys with no terminal meaning yield `None`.
pub fn encode_key_event(key: &KeyEvent, app_cursor: bool) -> Option<String> {
    if key.kind == KeyEventKind::Release {
        return None;
    }
    let alt = key.modifiers.contains(KeyModifiers::ALT);
    let encoded = match key.code {
        KeyCode::Char(c) => {
            if key.modifiers.contains(KeyModifiers::CONTROL) {
                control_char(c)?.to_string()
            } else {
                c.to_string()
            }
        }
        // CR, like a hardware terminal; the PTY line discipline maps it to NL.
        KeyCode::Enter => "\r".to_string(),
        KeyCode::Tab => "\t".to_string(),
        KeyCode::BackTab => "\x1b[Z".to_string(),
        KeyCode::Backspace => "\x7f".to_string(),
        KeyCode::Esc => "\x1b".to_string(),
        KeyCode::Up => cursor_key('A', app_cursor),
        KeyCode::Down => cursor_key('B', app_cursor),
        KeyCode::Right => cursor_key('C', app_cursor),
        KeyCode::Left => cursor_key('D', app_cursor),
        KeyCode::Home => cursor_key('H', app_cursor),
        KeyCode::End => cursor_key('F', app_cursor),
        KeyCode::PageUp => "\x1b[5~".to_string(),
        KeyCode::PageDown => "\x1b[6~".to_string(),
        KeyCode::Delete => "\x1b[3~".to_string(),
        KeyCode::Insert => "\x1b[2~".to_string(),
        KeyCode::F(n) => function_key(n)?.to_string(),
        _ => return None,
    };
    if alt {
        Some(format!("\x1b{encoded}"))
    } else {
        Some(encoded)
    }
}

fn control_char(c: char) -> Option<char> {
    let lower = c.to_ascii_lowercase();
    match lower {
        'a'..='z' => Some(char::from(lower as u8 - b'a' + 1)),
        ' ' | '@' | '2' => Some('\0'),
        '[' | '3' => Some('\x1b'),
        '\\' | '4' => Some('\x1c'),
        ']' | '5' => Some('\x1d'),
        '^' | '6' => Some('\x1e'),
        '_' | '7' | '/' => Some('\x1f'),
        _ => None,
    }
}

fn cursor_key(code: char, app_cursor: bool) -> String {
    if app_cursor {
        format!("\x1bO{code}")
    } else {
        format!("\x1b[{code}")
    }
}

fn function_key(n: u8) -> Option<&'static str> {
    Some(match n {
        1 => "\x1bOP",
        2 => "\x1bOQ",
        3 => "\x1bOR",
        4 => "\x1bOS",
        5 => "\x1b[15~",
        6 => "\x1b[17~",
        7 => "\x1b[18~",
        8 => "\x1b[19~",
        9 => "\x1b[20~",
        10 => "\x1b[21~",
        11 => "\x1b[23~",
        12 => "\x1b[24~",
        _ => return None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crossterm::event::KeyEventState;

    fn press(code: KeyCode, modifiers: KeyModifiers) -> KeyEvent {
        KeyEvent::new(code, modifiers)
    }

    #[test_timeout::timeout]
    fn printable_and_control_characters() {
        assert_eq!(
            encode_key_event(&press(KeyCode::Char('a'), KeyModifiers::NONE), false).as_deref(),
            Some("a")
        );
        assert_eq!(
            encode_key_event(&press(KeyCode::Char('C'), KeyModifiers::CONTROL), false).as_deref(),
            Some("\x03")
        );
        assert_eq!(
            encode_key_event(&press(KeyCode::Char('x'), KeyModifiers::ALT), false).as_deref(),
            Some("\x1bx")
        );
        assert_eq!(
            encode_key_event(&press(KeyCode::Char('é'), KeyModifiers::NONE), false).as_deref(),
            Some("é")
        );
        assert_eq!(
            encode_key_event(&press(KeyCode::Enter, KeyModifiers::NONE), false).as_deref(),
            Some("\r")
        );
    }

    #[test_timeout::timeout]
    fn arrows_follow_cursor_key_mode() {
        let up = press(KeyCode::Up, KeyModifiers::NONE);
        assert_eq!(encode_key_event(&up, false).as_deref(), Some("\x1b[A"));
        assert_eq!(encode_key_event(&up, true).as_deref(), Some("\x1bOA"));
    }

    #[test_timeout::timeout]
    fn function_keys_and_unmapped_keys() {
        assert_eq!(
            encode_key_event(&press(KeyCode::F(5), KeyModifiers::NONE), false).as_deref(),
            Some("\x1b[15~")
        );
        assert_eq!(
            encode_key_event(&press(KeyCode::F(13), KeyModifiers::NONE), false),
            None
        );
        assert_eq!(
            encode_key_event(&press(KeyCode::CapsLock, KeyModifiers::NONE), false),
            None
        );
    }

    #[test_timeout::timeout]
    fn releases_are_ignored() {
        let release = KeyEvent {
            code: KeyCode::Char('a'),
            modifiers: KeyModifiers::NONE,
            kind: KeyEventKind::Release,
            state: KeyEventState::NONE,
        };
        assert_eq!(encode_key_event(&release, false), None);
    }
}
