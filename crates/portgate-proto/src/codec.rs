//! JSON codec for control-channel frames.
//!
//! One message per WebSocket text frame. Decoding is strict about the
//! message shape (unknown `type`, missing fields, wrong field types are
//! errors) but tolerant of unknown fields.

use thiserror::Error;

use crate::messages::ControlMessage;

/// How much of a bad frame is kept in the error for logging.
const SNIPPET_LEN: usize = 120;

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("failed to encode {kind} message: {source}")]
    Encode {
        kind: &'static str,
        source: serde_json::Error,
    },

    #[error("malformed frame '{snippet}': {source}")]
    Malformed {
        snippet: String,
        source: serde_json::Error,
    },
}

/// Serialize a message into the payload of one text frame.
pub fn encode(msg: &ControlMessage) -> Result<String, ProtocolError> {
    serde_json::to_string(msg).map_err(|source| ProtocolError::Encode {
        kind: msg.kind(),
        source,
    })
}

/// Parse one text-frame payload into a message.
pub fn decode(text: &str) -> Result<ControlMessage, ProtocolError> {
    serde_json::from_str(text).map_err(|source| ProtocolError::Malformed {
        snippet: snippet(text),
        source,
    })
}

fn snippet(text: &str) -> String {
    if text.len() <= SNIPPET_LEN {
        return text.to_string();
    }
    let mut end = SNIPPET_LEN;
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}...", &text[..end])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messages::TunnelSpec;

    #[test]
    fn round_trips_every_message_kind() {
        let messages = vec![
            ControlMessage::Auth {
                token: "secret".into(),
            },
            ControlMessage::AuthSuccess {
                client_id: "c-1".into(),
            },
            ControlMessage::AuthFailed {
                reason: "bad token".into(),
            },
            ControlMessage::RegisterTunnels {
                tunnels: vec![TunnelSpec::new(3000, 9000, "web")],
            },
            ControlMessage::TunnelRegistered {
                remote_port: 3000,
                local_port: 9000,
                name: "web".into(),
            },
            ControlMessage::TunnelFailed {
                remote_port: 3000,
                error: "address in use".into(),
            },
            ControlMessage::NewConnection {
                connection_id: "conn-1".into(),
                remote_port: 3000,
                client_address: "203.0.113.9:51234".into(),
            },
            ControlMessage::ConnectionReady {
                connection_id: "conn-1".into(),
                data_port: 41234,
            },
            ControlMessage::ConnectionClosed {
                connection_id: "conn-1".into(),
                reason: "peer closed".into(),
            },
            ControlMessage::StatusRequest,
            ControlMessage::Ping,
            ControlMessage::Pong,
        ];

        for msg in messages {
            let text = encode(&msg).unwrap();
            let back = decode(&text).unwrap();
            assert_eq!(back, msg, "round trip failed for {}", msg.kind());
        }
    }

    #[test]
    fn wire_fields_are_camel_case() {
        let text = encode(&ControlMessage::ConnectionReady {
            connection_id: "c".into(),
            data_port: 1,
        })
        .unwrap();
        assert!(text.contains("\"connectionId\""));
        assert!(text.contains("\"dataPort\""));
        assert!(text.contains("\"type\":\"connection_ready\""));
    }

    #[test]
    fn rejects_unknown_type() {
        let err = decode(r#"{"type":"subscribe","topic":"x"}"#).unwrap_err();
        assert!(matches!(err, ProtocolError::Malformed { .. }));
    }

    #[test]
    fn rejects_missing_fields_and_wrong_types() {
        assert!(decode(r#"{"type":"auth"}"#).is_err());
        assert!(decode(r#"{"type":"connection_ready","connectionId":"c","dataPort":"no"}"#).is_err());
        assert!(decode(r#"{"type":"new_connection","connectionId":7,"remotePort":3000,"clientAddress":"a"}"#).is_err());
        assert!(decode("not json at all").is_err());
    }

    #[test]
    fn ignores_unknown_fields() {
        let msg = decode(r#"{"type":"ping","sentAt":123,"extra":{"a":1}}"#).unwrap();
        assert_eq!(msg, ControlMessage::Ping);

        let msg =
            decode(r#"{"type":"auth","token":"secret","clientVersion":"2.1.0"}"#).unwrap();
        assert_eq!(
            msg,
            ControlMessage::Auth {
                token: "secret".into()
            }
        );
    }

    #[test]
    fn bad_frame_error_keeps_a_bounded_snippet() {
        let long = format!("{{\"type\":\"nope\",\"pad\":\"{}\"}}", "x".repeat(500));
        match decode(&long).unwrap_err() {
            ProtocolError::Malformed { snippet, .. } => {
                assert!(snippet.len() <= SNIPPET_LEN + 3);
            }
            other => panic!("unexpected error: {other}"),
        }
    }
}
