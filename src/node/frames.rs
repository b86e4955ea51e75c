use serde::Deserialize;
use serde_json::Value;

use crate::events::SessionEventKind;
use crate::{OrchestratorError, Result};

/// Frame recibido por el socket persistente del nodo.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum NodeFrame {
    /// Handshake completo; trae el token de acceso para las llamadas REST.
    Ready { token: String },
    /// Error del nodo que no pertenece a ninguna guild.
    Error { message: String },
    Stats,
    Session {
        kind: SessionEventKind,
        guild_id: String,
        payload: Value,
    },
}

#[derive(Debug, Deserialize)]
struct FrameHeader {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default, rename = "guildId")]
    guild_id: Option<Value>,
}

/// Decodifica un frame de texto.
///
/// Cualquier fallo es [`OrchestratorError::Protocol`]; quien llama lo registra y lo descarta.
/// Los campos distintos de `type` y `guildId` solo los lee el tipo de frame
/// al que pertenecen.
pub(crate) fn decode(text: &str) -> Result<NodeFrame> {
    let payload: Value = serde_json::from_str(text)
        .map_err(|e| OrchestratorError::Protocol(format!("invalid JSON: {}", e)))?;

    let header = FrameHeader::deserialize(&payload)
        .map_err(|e| OrchestratorError::Protocol(format!("missing frame header: {}", e)))?;

    match header.kind.as_str() {
        "READY" => {
            let token = payload
                .get("token")
                .and_then(Value::as_str)
                .filter(|t| !t.is_empty())
                .ok_or_else(|| OrchestratorError::Protocol("READY frame without token".into()))?;
            Ok(NodeFrame::Ready {
                token: token.to_string(),
            })
        }
        "ERROR" => {
            let message = match payload.get("message") {
                Some(Value::String(message)) => message.clone(),
                Some(Value::Null) | None => "unspecified node error".to_string(),
                Some(other) => other.to_string(),
            };
            Ok(NodeFrame::Error { message })
        }
        "STATS" => Ok(NodeFrame::Stats),
        other => {
            let kind = SessionEventKind::from_tag(other).ok_or_else(|| {
                OrchestratorError::Protocol(format!("unknown frame type {:?}", other))
            })?;
            let guild_id = header
                .guild_id
                .as_ref()
                .and_then(guild_id_string)
                .ok_or_else(|| {
                    OrchestratorError::Protocol(format!("{} frame without guildId", other))
                })?;

            Ok(NodeFrame::Session {
                kind,
                guild_id,
                payload,
            })
        }
    }
}

// Discord snowflakes may arrive as strings or numbers.
fn guild_id_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_ready_frame() {
        let frame = decode(r#"{"type":"READY","token":"abc"}"#).unwrap();
        assert_eq!(frame, NodeFrame::Ready { token: "abc".into() });

        assert!(decode(r#"{"type":"READY"}"#).is_err());
    }

    #[test]
    fn test_session_frame_keeps_payload() {
        let raw = json!({"type": "TRACK_START", "guildId": "123", "track": {"title": "t1"}});
        let frame = decode(&raw.to_string()).unwrap();

        assert_eq!(
            frame,
            NodeFrame::Session {
                kind: SessionEventKind::TrackStart,
                guild_id: "123".into(),
                payload: raw,
            }
        );
    }

    #[test]
    fn test_numeric_guild_id() {
        let frame = decode(r#"{"type":"QUEUE_END","guildId":987654321}"#).unwrap();
        match frame {
            NodeFrame::Session { guild_id, kind, .. } => {
                assert_eq!(guild_id, "987654321");
                assert_eq!(kind, SessionEventKind::QueueEnd);
            }
            other => panic!("unexpected frame {:?}", other),
        }
    }

    #[test]
    fn test_malformed_frames_are_protocol_errors() {
        for text in [
            "not json",
            "[]",
            r#"{"guildId":"1"}"#,
            r#"{"type":"WHATEVER"}"#,
            r#"{"type":"TRACK_END"}"#,
        ] {
            assert!(
                matches!(decode(text), Err(OrchestratorError::Protocol(_))),
                "{} should be rejected",
                text
            );
        }
    }

    #[test]
    fn test_session_frame_with_structured_message() {
        let raw = json!({
            "type": "TRACK_ERROR",
            "guildId": "5",
            "message": {"severity": "fault", "cause": "decoder"},
            "token": 42
        });

        match decode(&raw.to_string()).unwrap() {
            NodeFrame::Session { kind, guild_id, payload } => {
                assert_eq!(kind, SessionEventKind::TrackError);
                assert_eq!(guild_id, "5");
                assert_eq!(payload, raw);
            }
            other => panic!("unexpected frame {:?}", other),
        }
    }

    #[test]
    fn test_error_frame_structured_message() {
        let frame = decode(r#"{"type":"ERROR","message":{"code":7}}"#).unwrap();
        assert_eq!(frame, NodeFrame::Error { message: r#"{"code":7}"#.into() });

        assert!(decode(r#"{"type":"READY","token":5}"#).is_err());
    }

    #[test]
    fn test_error_frame_default_message() {
        assert_eq!(
            decode(r#"{"type":"ERROR"}"#).unwrap(),
            NodeFrame::Error { message: "unspecified node error".into() }
        );
    }
}
