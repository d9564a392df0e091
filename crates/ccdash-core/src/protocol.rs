//! Dashboard wire protocol.
//!
//! JSON messages over a WebSocket text channel, discriminated by `type`.
//! Unknown inbound fields are ignored; missing fields default so the
//! dispatcher can report "session_id required" instead of failing the parse.

use serde::{Deserialize, Serialize};

use crate::poller::SessionInfo;

/// Client → agent messages.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    ListSessions,
    CreateSession {
        #[serde(default)]
        workdir: String,
        #[serde(default)]
        name: String,
    },
    KillSession {
        #[serde(default)]
        session_id: String,
    },
    ClearDeadSessions,
    Attach {
        #[serde(default)]
        session_id: String,
        #[serde(default)]
        cols: u16,
        #[serde(default)]
        rows: u16,
    },
    Detach,
    Input {
        /// base64-encoded keystrokes
        #[serde(default)]
        data: String,
    },
    Resize {
        #[serde(default)]
        cols: u16,
        #[serde(default)]
        rows: u16,
    },
    GetScrollback {
        #[serde(default)]
        session_id: String,
    },
    MachineInfo,
}

const KNOWN_TYPES: &[&str] = &[
    "list_sessions",
    "create_session",
    "kill_session",
    "clear_dead_sessions",
    "attach",
    "detach",
    "input",
    "resize",
    "get_scrollback",
    "machine_info",
];

/// Agent → client messages.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    Sessions {
        sessions: Vec<SessionInfo>,
    },
    SessionCreated {
        session_id: String,
        name: String,
    },
    Scrollback {
        /// base64-encoded scrollback text
        data: String,
    },
    Output {
        /// base64-encoded PTY bytes
        data: String,
    },
    MachineInfo {
        hostname: String,
        os: String,
        dirs: Vec<String>,
    },
    Error {
        message: String,
    },
}

/// Decode an inbound frame. The error string is what goes back to the
/// subscriber verbatim.
pub fn parse_client_message(text: &str) -> Result<ClientMessage, String> {
    let value: serde_json::Value = match serde_json::from_str(text) {
        Ok(value) => value,
        Err(_) => return Err("invalid message".to_string()),
    };

    let msg_type = value
        .get("type")
        .and_then(|t| t.as_str())
        .unwrap_or_default()
        .to_string();

    match serde_json::from_value(value) {
        Ok(msg) => Ok(msg),
        Err(_) if msg_type.is_empty() || KNOWN_TYPES.contains(&msg_type.as_str()) => {
            Err("invalid message".to_string())
        }
        Err(_) => Err(format!("unknown message type: {msg_type}")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tmux::state::SessionState;

    #[test]
    fn test_parse_simple_commands() {
        assert!(matches!(
            parse_client_message(r#"{"type":"list_sessions"}"#),
            Ok(ClientMessage::ListSessions)
        ));
        assert!(matches!(
            parse_client_message(r#"{"type":"detach"}"#),
            Ok(ClientMessage::Detach)
        ));
        assert!(matches!(
            parse_client_message(r#"{"type":"machine_info"}"#),
            Ok(ClientMessage::MachineInfo)
        ));
    }

    #[test]
    fn test_parse_create_session_defaults() {
        let msg = parse_client_message(r#"{"type":"create_session"}"#).unwrap();
        match msg {
            ClientMessage::CreateSession { workdir, name } => {
                assert_eq!(workdir, "");
                assert_eq!(name, "");
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn test_parse_attach_with_geometry() {
        let msg =
            parse_client_message(r#"{"type":"attach","session_id":"cc-1-a","cols":80,"rows":24}"#)
                .unwrap();
        match msg {
            ClientMessage::Attach {
                session_id,
                cols,
                rows,
            } => {
                assert_eq!(session_id, "cc-1-a");
                assert_eq!(cols, 80);
                assert_eq!(rows, 24);
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn test_parse_missing_session_id_defaults_empty() {
        let msg = parse_client_message(r#"{"type":"kill_session"}"#).unwrap();
        match msg {
            ClientMessage::KillSession { session_id } => assert_eq!(session_id, ""),
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn test_unknown_fields_ignored() {
        assert!(parse_client_message(r#"{"type":"detach","extra":42}"#).is_ok());
    }

    #[test]
    fn test_unknown_type_error_wording() {
        let err = parse_client_message(r#"{"type":"foo"}"#).unwrap_err();
        assert_eq!(err, "unknown message type: foo");
    }

    #[test]
    fn test_invalid_frames() {
        assert_eq!(parse_client_message("not json").unwrap_err(), "invalid message");
        assert_eq!(parse_client_message(r#"{"no_type":1}"#).unwrap_err(), "invalid message");
        // Known type with a malformed field is invalid, not unknown.
        assert_eq!(
            parse_client_message(r#"{"type":"attach","cols":"wide"}"#).unwrap_err(),
            "invalid message"
        );
    }

    #[test]
    fn test_server_message_tags() {
        let json = serde_json::to_string(&ServerMessage::Error {
            message: "boom".to_string(),
        })
        .unwrap();
        assert_eq!(json, r#"{"type":"error","message":"boom"}"#);

        let json = serde_json::to_string(&ServerMessage::SessionCreated {
            session_id: "cc-1-a".to_string(),
            name: "cc-1-a".to_string(),
        })
        .unwrap();
        assert_eq!(json, r#"{"type":"session_created","session_id":"cc-1-a","name":"cc-1-a"}"#);
    }

    #[test]
    fn test_sessions_snapshot_round_trip() {
        let msg = ServerMessage::Sessions {
            sessions: vec![SessionInfo {
                id: "cc-1-a".to_string(),
                name: "cc-1-a".to_string(),
                state: SessionState::Working,
                workdir: "/tmp".to_string(),
                created: 1,
                state_changed_at: 2,
                last_line: "compiling".to_string(),
            }],
        };
        let json = serde_json::to_string(&msg).unwrap();
        assert!(json.starts_with(r#"{"type":"sessions","sessions":[{"#));
        assert!(json.contains(r#""state":"working""#));
        assert!(json.contains(r#""state_changed_at":2"#));
    }
}
