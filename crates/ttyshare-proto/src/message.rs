//! JSON control messages carried in WebSocket text frames

use crate::error::{ProtocolError, Result};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Longest accepted display name
pub const SESSION_NAME_MAX_LEN: usize = 64;

/// Viewer -> server messages
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    /// Keepalive; every other field is echoed back in the pong
    Ping {
        #[serde(flatten)]
        extra: Map<String, Value>,
    },
    /// Chat line to relay to every viewer of the session
    #[serde(rename_all = "camelCase")]
    Chat { user_name: String, text: String },
    /// Set the session's display name
    RenameSession { name: String },
}

impl ClientMessage {
    pub fn parse(text: &str) -> Result<Self> {
        Ok(serde_json::from_str(text)?)
    }
}

/// Server -> viewer messages
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    Pong {
        #[serde(flatten)]
        extra: Map<String, Value>,
    },
    #[serde(rename_all = "camelCase")]
    Chat {
        user_name: String,
        text: String,
        /// Server time, milliseconds since the Unix epoch
        timestamp: i64,
    },
    /// Sent whenever the viewer count or negotiated size changes
    #[serde(rename_all = "camelCase")]
    Status {
        viewers: usize,
        cols: u16,
        rows: u16,
        assistant: String,
        session_name: Option<String>,
    },
    /// Terminal state reached, no restart will follow
    #[serde(rename_all = "camelCase")]
    Exit { exit_code: i32 },
    /// Result of a file upload, sent to the uploader only
    Upload {
        success: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        path: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
    Error { message: String },
}

impl ServerMessage {
    pub fn chat(user_name: String, text: String) -> Self {
        ServerMessage::Chat {
            user_name,
            text,
            timestamp: chrono::Utc::now().timestamp_millis(),
        }
    }

    pub fn to_text(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }
}

/// Validate a display name: 1-64 chars of alphanumerics, space, `-`, `_`, `.`
pub fn validate_session_name(name: &str) -> Result<()> {
    if name.trim().is_empty() {
        return Err(ProtocolError::InvalidSessionName(
            "name must not be empty".into(),
        ));
    }
    let len = name.chars().count();
    if len > SESSION_NAME_MAX_LEN {
        return Err(ProtocolError::InvalidSessionName(format!(
            "name too long ({} chars, max {})",
            len, SESSION_NAME_MAX_LEN
        )));
    }
    if !name
        .chars()
        .all(|c| c.is_alphanumeric() || matches!(c, ' ' | '-' | '_' | '.'))
    {
        return Err(ProtocolError::InvalidSessionName(format!(
            "name contains invalid characters: {}",
            name
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_ping_extra_fields_are_kept() {
        let msg = ClientMessage::parse(r#"{"type":"ping","t":1234,"seq":"a"}"#).unwrap();
        let ClientMessage::Ping { extra } = msg else {
            panic!("expected ping");
        };
        assert_eq!(extra.get("t"), Some(&json!(1234)));
        assert!(extra.get("type").is_none());

        let pong = ServerMessage::Pong { extra };
        let value: Value = serde_json::from_str(&pong.to_text().unwrap()).unwrap();
        assert_eq!(value, json!({"type": "pong", "t": 1234, "seq": "a"}));
    }

    #[test]
    fn test_chat_uses_camel_case() {
        let msg = ClientMessage::parse(r#"{"type":"chat","userName":"ada","text":"hi"}"#).unwrap();
        assert_eq!(
            msg,
            ClientMessage::Chat {
                user_name: "ada".into(),
                text: "hi".into()
            }
        );

        let out = ServerMessage::chat("ada".into(), "hi".into());
        let value: Value = serde_json::from_str(&out.to_text().unwrap()).unwrap();
        assert_eq!(value["type"], "chat");
        assert_eq!(value["userName"], "ada");
        assert!(value["timestamp"].as_i64().unwrap() > 0);
    }

    #[test]
    fn test_rename_session_parses() {
        let msg = ClientMessage::parse(r#"{"type":"rename_session","name":"pairing"}"#).unwrap();
        assert_eq!(
            msg,
            ClientMessage::RenameSession {
                name: "pairing".into()
            }
        );
    }

    #[test]
    fn test_unknown_type_is_error() {
        assert!(ClientMessage::parse(r#"{"type":"nope"}"#).is_err());
        assert!(ClientMessage::parse("not json").is_err());
    }

    #[test]
    fn test_status_wire_shape() {
        let msg = ServerMessage::Status {
            viewers: 2,
            cols: 80,
            rows: 24,
            assistant: "Claude".into(),
            session_name: Some("main".into()),
        };
        let value: Value = serde_json::from_str(&msg.to_text().unwrap()).unwrap();
        assert_eq!(
            value,
            json!({
                "type": "status",
                "viewers": 2,
                "cols": 80,
                "rows": 24,
                "assistant": "Claude",
                "sessionName": "main"
            })
        );
    }

    #[test]
    fn test_exit_wire_shape() {
        let value: Value =
            serde_json::from_str(&ServerMessage::Exit { exit_code: 0 }.to_text().unwrap()).unwrap();
        assert_eq!(value, json!({"type": "exit", "exitCode": 0}));
    }

    #[test]
    fn test_session_name_validation() {
        assert!(validate_session_name("my session-1.2_x").is_ok());
        assert!(validate_session_name("").is_err());
        assert!(validate_session_name("   ").is_err());
        assert!(validate_session_name("a/b").is_err());
        assert!(validate_session_name("<script>").is_err());
        assert!(validate_session_name(&"x".repeat(65)).is_err());
        assert!(validate_session_name(&"x".repeat(64)).is_ok());
    }
}
