//! JSON text frames exchanged between the terminal surface and the shell host.
//!
//! Every frame is a JSON object tagged by its `type` field:
//!
//! | type        | direction     | payload                    |
//! |-------------|---------------|----------------------------|
//! | `input`     | client → host | `{ data: string }`         |
//! | `resize`    | client → host | `{ cols: int, rows: int }` |
//! | `output`    | host → client | `{ data: string }`         |
//! | `error`     | host → client | `{ message: string }`      |
//! | `connected` | host → client | `{ sessionId?: string }`   |
//!
//! Decoding never panics: anything that is not a recognised frame comes back as a
//! [`DecodeError`] so callers can drop it and keep the session alive.

use serde_json::{Map, Value, json};
use std::fmt;

const FIELD_TYPE: &str = "type";
const FIELD_DATA: &str = "data";
const FIELD_MESSAGE: &str = "message";
const FIELD_COLS: &str = "cols";
const FIELD_ROWS: &str = "rows";
const FIELD_SESSION_ID: &str = "sessionId";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// Raw keystrokes or pasted text destined for the shell.
    Input { data: String },
    /// Raw shell output, ANSI sequences included.
    Output { data: String },
    /// New grid size of the client viewport.
    Resize { cols: u16, rows: u16 },
    /// Host-side failure that should be shown to the user.
    Error { message: String },
    /// Session established; the host may assign an identifier.
    Connected { session_id: Option<String> },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FrameKind {
    Input,
    Output,
    Resize,
    Error,
    Connected,
}

impl FrameKind {
    pub const ALL: [FrameKind; 5] = [
        FrameKind::Input,
        FrameKind::Output,
        FrameKind::Resize,
        FrameKind::Error,
        FrameKind::Connected,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            FrameKind::Input => "input",
            FrameKind::Output => "output",
            FrameKind::Resize => "resize",
            FrameKind::Error => "error",
            FrameKind::Connected => "connected",
        }
    }

    pub fn parse(tag: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|kind| kind.as_str() == tag)
    }
}

impl fmt::Display for FrameKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Frame {
    pub fn kind(&self) -> FrameKind {
        match self {
            Frame::Input { .. } => FrameKind::Input,
            Frame::Output { .. } => FrameKind::Output,
            Frame::Resize { .. } => FrameKind::Resize,
            Frame::Error { .. } => FrameKind::Error,
            Frame::Connected { .. } => FrameKind::Connected,
        }
    }

    pub fn input(data: impl Into<String>) -> Self {
        Frame::Input { data: data.into() }
    }

    pub fn output(data: impl Into<String>) -> Self {
        Frame::Output { data: data.into() }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Frame::Error {
            message: message.into(),
        }
    }
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum DecodeError {
    #[error("malformed frame: {0}")]
    Malformed(String),
    #[error("frame has no type field")]
    MissingType,
    #[error("unknown frame type: {0}")]
    UnknownType(String),
    #[error("invalid {kind} payload: {reason}")]
    InvalidPayload {
        kind: FrameKind,
        reason: &'static str,
    },
}

/// Serializes a frame to its wire text. Total for every variant.
pub fn encode(frame: &Frame) -> String {
    let value = match frame {
        Frame::Input { data } => json!({ FIELD_TYPE: "input", FIELD_DATA: data }),
        Frame::Output { data } => json!({ FIELD_TYPE: "output", FIELD_DATA: data }),
        Frame::Resize { cols, rows } => {
            json!({ FIELD_TYPE: "resize", FIELD_COLS: cols, FIELD_ROWS: rows })
        }
        Frame::Error { message } => json!({ FIELD_TYPE: "error", FIELD_MESSAGE: message }),
        Frame::Connected {
            session_id: Some(id),
        } => json!({ FIELD_TYPE: "connected", FIELD_SESSION_ID: id }),
        Frame::Connected { session_id: None } => json!({ FIELD_TYPE: "connected" }),
    };
    value.to_string()
}

/// Parses wire text back into a frame.
pub fn decode(raw: &str) -> Result<Frame, DecodeError> {
    let value: Value =
        serde_json::from_str(raw).map_err(|err| DecodeError::Malformed(err.to_string()))?;
    let Value::Object(object) = value else {
        return Err(DecodeError::Malformed("expected a JSON object".to_string()));
    };

    let kind = match object.get(FIELD_TYPE) {
        None | Some(Value::Null) => return Err(DecodeError::MissingType),
        Some(Value::String(tag)) => {
            FrameKind::parse(tag).ok_or_else(|| DecodeError::UnknownType(tag.clone()))?
        }
        Some(other) => return Err(DecodeError::UnknownType(other.to_string())),
    };

    match kind {
        FrameKind::Input => Ok(Frame::Input {
            data: string_field(&object, FIELD_DATA, kind)?,
        }),
        FrameKind::Output => Ok(Frame::Output {
            data: string_field(&object, FIELD_DATA, kind)?,
        }),
        FrameKind::Resize => Ok(Frame::Resize {
            cols: dimension(&object, FIELD_COLS)?,
            rows: dimension(&object, FIELD_ROWS)?,
        }),
        FrameKind::Error => {
            // Older hosts put the text under `data`.
            let message = match object.get(FIELD_MESSAGE) {
                Some(_) => string_field(&object, FIELD_MESSAGE, kind)?,
                None => string_field(&object, FIELD_DATA, kind)?,
            };
            Ok(Frame::Error { message })
        }
        FrameKind::Connected => {
            let session_id = match object.get(FIELD_SESSION_ID) {
                None | Some(Value::Null) => None,
                Some(Value::String(id)) => Some(id.clone()),
                Some(_) => {
                    return Err(DecodeError::InvalidPayload {
                        kind,
                        reason: "sessionId must be a string",
                    });
                }
            };
            Ok(Frame::Connected { session_id })
        }
    }
}

fn string_field(
    object: &Map<String, Value>,
    key: &str,
    kind: FrameKind,
) -> Result<String, DecodeError> {
    match object.get(key) {
        Some(Value::String(text)) => Ok(text.clone()),
        Some(_) => Err(DecodeError::InvalidPayload {
            kind,
            reason: "text field must be a string",
        }),
        None => Err(DecodeError::InvalidPayload {
            kind,
            reason: "missing text field",
        }),
    }
}

fn dimension(object: &Map<String, Value>, key: &str) -> Result<u16, DecodeError> {
    let invalid = |reason| DecodeError::InvalidPayload {
        kind: FrameKind::Resize,
        reason,
    };
    let Some(Value::Number(number)) = object.get(key) else {
        return Err(invalid("cols and rows must be numbers"));
    };
    // `as_u64` is None for negatives and for anything written with a fraction or exponent.
    let value = number
        .as_u64()
        .ok_or_else(|| invalid("cols and rows must be positive integers"))?;
    if value == 0 {
        return Err(invalid("cols and rows must be positive integers"));
    }
    u16::try_from(value).map_err(|_| invalid("cols and rows exceed 65535"))
}
