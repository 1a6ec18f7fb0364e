//! The single-byte-tagged application protocol carried inside WebSocket
//! binary frames.
//!
//! Kept deliberately separate from the WebSocket framing layer (`ws.rs`):
//! this module only knows about bytes in, bytes out.

use crate::error::ProtocolError;
use serde_json::Value;

// Server -> client tags.
pub const TAG_OUTPUT: u8 = b'0';
pub const TAG_SET_WINDOW_TITLE: u8 = b'1';
pub const TAG_SET_PREFERENCES: u8 = b'2';
pub const TAG_SET_RECONNECT: u8 = b'3';
/// Shares a wire byte with `SET_WINDOW_TITLE`; sent only in reply to `PING`.
pub const TAG_PONG: u8 = b'1';

// Client -> server tags.
pub const TAG_INPUT: u8 = b'0';
pub const TAG_PING: u8 = b'1';
pub const TAG_RESIZE_TERMINAL: u8 = b'2';
pub const TAG_JSON_DATA: u8 = b'{';

/// A terminal window size update, parsed leniently from a `RESIZE_TERMINAL`
/// payload. Missing or non-integer fields yield `None` rather than an
/// error - a malformed resize is logged and non-fatal, never a protocol
/// violation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowSize {
    pub columns: u16,
    pub rows: u16,
}

pub fn parse_window_size(payload: &[u8]) -> Option<WindowSize> {
    let value: Value = serde_json::from_slice(payload).ok()?;
    let columns = value.get("columns")?.as_u64()?;
    let rows = value.get("rows")?.as_u64()?;
    Some(WindowSize {
        columns: u16::try_from(columns).ok()?,
        rows: u16::try_from(rows).ok()?,
    })
}

/// Messages the server writes onto the WebSocket.
#[derive(Debug, Clone, PartialEq)]
pub enum ServerMessage {
    Output(Vec<u8>),
    Pong,
    SetWindowTitle(String),
    SetReconnect(u32),
    SetPreferences(String),
}

impl ServerMessage {
    pub fn encode(&self) -> Vec<u8> {
        match self {
            ServerMessage::Output(bytes) => tagged(TAG_OUTPUT, bytes),
            ServerMessage::Pong => vec![TAG_PONG],
            ServerMessage::SetWindowTitle(title) => tagged(TAG_SET_WINDOW_TITLE, title.as_bytes()),
            ServerMessage::SetReconnect(secs) => {
                tagged(TAG_SET_RECONNECT, secs.to_string().as_bytes())
            }
            ServerMessage::SetPreferences(json) => tagged(TAG_SET_PREFERENCES, json.as_bytes()),
        }
    }
}

fn tagged(tag: u8, payload: &[u8]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(1 + payload.len());
    buf.push(tag);
    buf.extend_from_slice(payload);
    buf
}

/// Messages the server accepts, reassembled from WebSocket fragments by
/// the caller before decoding.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientMessage {
    Input(Vec<u8>),
    Ping,
    ResizeTerminal(Option<WindowSize>),
    /// The tag byte `{` is itself the first byte of the JSON object, so the
    /// whole buffer (not `buffer[1..]`) is the JSON payload. A body that
    /// fails to parse is treated as an empty object, same as a payload with
    /// no `AuthToken` field.
    JsonData(Value),
}

impl ClientMessage {
    pub fn decode(buf: &[u8]) -> Result<Self, ProtocolError> {
        let tag = *buf.first().ok_or(ProtocolError::Empty)?;
        match tag {
            TAG_INPUT => Ok(ClientMessage::Input(buf[1..].to_vec())),
            TAG_PING => Ok(ClientMessage::Ping),
            TAG_RESIZE_TERMINAL => Ok(ClientMessage::ResizeTerminal(parse_window_size(&buf[1..]))),
            TAG_JSON_DATA => {
                let value = serde_json::from_slice(buf).unwrap_or(Value::Null);
                Ok(ClientMessage::JsonData(value))
            }
            other => Err(ProtocolError::UnknownTag(other)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encodes_output_with_leading_tag() {
        let msg = ServerMessage::Output(b"hello\n".to_vec());
        assert_eq!(msg.encode(), b"0hello\n".to_vec());
    }

    #[test]
    fn encodes_window_title() {
        let msg = ServerMessage::SetWindowTitle("cat (box)".to_string());
        assert_eq!(msg.encode(), b"1cat (box)".to_vec());
    }

    #[test]
    fn encodes_reconnect_seconds() {
        let msg = ServerMessage::SetReconnect(10);
        assert_eq!(msg.encode(), b"310".to_vec());
    }

    #[test]
    fn decodes_input() {
        let decoded = ClientMessage::decode(b"0hello\n").unwrap();
        assert_eq!(decoded, ClientMessage::Input(b"hello\n".to_vec()));
    }

    #[test]
    fn decodes_ping() {
        assert_eq!(ClientMessage::decode(b"1").unwrap(), ClientMessage::Ping);
    }

    #[test]
    fn decodes_resize_terminal() {
        let decoded = ClientMessage::decode(br#"2{"columns":120,"rows":40}"#).unwrap();
        assert_eq!(
            decoded,
            ClientMessage::ResizeTerminal(Some(WindowSize {
                columns: 120,
                rows: 40
            }))
        );
    }

    #[test]
    fn malformed_resize_is_lenient() {
        let decoded = ClientMessage::decode(br#"2{"columns":120}"#).unwrap();
        assert_eq!(decoded, ClientMessage::ResizeTerminal(None));
    }

    #[test]
    fn decodes_json_data_including_auth_token() {
        let decoded = ClientMessage::decode(br#"{"AuthToken":"s3cret"}"#).unwrap();
        match decoded {
            ClientMessage::JsonData(v) => {
                assert_eq!(v.get("AuthToken").and_then(Value::as_str), Some("s3cret"));
            }
            other => panic!("expected JsonData, got {other:?}"),
        }
    }

    #[test]
    fn malformed_json_data_is_tolerant() {
        let decoded = ClientMessage::decode(b"{not json").unwrap();
        assert_eq!(decoded, ClientMessage::JsonData(Value::Null));
    }

    #[test]
    fn unknown_tag_is_rejected() {
        let err = ClientMessage::decode(b"9garbage").unwrap_err();
        assert_eq!(err, ProtocolError::UnknownTag(b'9'));
    }

    #[test]
    fn empty_payload_is_rejected() {
        assert_eq!(ClientMessage::decode(b"").unwrap_err(), ProtocolError::Empty);
    }
}
