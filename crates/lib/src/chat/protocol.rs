//! Chat socket frames. Inbound frames are classified by their `type` field; a frame without a
//! recognised `type` but carrying its own `id` is a fully-formed message.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::message::{Message, ResponseKind};

#[derive(Debug, Clone, PartialEq)]
pub enum InboundFrame {
    ConnectionEstablished { chat_state: Option<Value> },
    MessageChunk { message_id: i64, content: String },
    MessageEnd { message_id: Option<i64> },
    Message(Message),
    Unrecognized(Option<String>),
}

#[derive(Deserialize)]
struct ChunkBody {
    message_id: i64,
    #[serde(default)]
    content: String,
}

#[derive(Deserialize)]
struct EndBody {
    #[serde(default)]
    message_id: Option<i64>,
}

/// Parse one text frame. Malformed JSON is an error; well-formed JSON of an unknown shape is
/// `Unrecognized` so the session survives it.
pub fn parse_inbound(raw: &str) -> Result<InboundFrame, serde_json::Error> {
    let value: Value = serde_json::from_str(raw)?;
    let kind = value.get("type").and_then(Value::as_str).map(str::to_string);
    let frame = match kind.as_deref() {
        Some("connection_established") => InboundFrame::ConnectionEstablished {
            chat_state: value.get("chat_state").cloned(),
        },
        Some("message_chunk") => {
            let body: ChunkBody = serde_json::from_value(value)?;
            InboundFrame::MessageChunk {
                message_id: body.message_id,
                content: body.content,
            }
        }
        Some("message_end") => {
            let body: EndBody = serde_json::from_value(value)?;
            InboundFrame::MessageEnd {
                message_id: body.message_id,
            }
        }
        _ if value.get("id").map_or(false, |id| !id.is_null()) => {
            InboundFrame::Message(serde_json::from_value(value)?)
        }
        _ => InboundFrame::Unrecognized(kind),
    };
    Ok(frame)
}

/// Frames sent by the client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OutboundFrame {
    UserMessage {
        message_type: ResponseKind,
        content: String,
    },
}

impl OutboundFrame {
    pub fn user_message(kind: ResponseKind, content: impl Into<String>) -> Self {
        Self::UserMessage {
            message_type: kind,
            content: content.into(),
        }
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chat::message::{MessageId, Sender};

    #[test]
    fn classifies_chunk_end_and_message() {
        let chunk = parse_inbound(r#"{"type":"message_chunk","message_id":42,"content":"Sorry to "}"#)
            .unwrap();
        assert_eq!(
            chunk,
            InboundFrame::MessageChunk {
                message_id: 42,
                content: "Sorry to ".into()
            }
        );
        assert_eq!(
            parse_inbound(r#"{"type":"message_end"}"#).unwrap(),
            InboundFrame::MessageEnd { message_id: None }
        );
        match parse_inbound(
            r#"{"id":9,"sender":"assistant","message_type":"single_select","content":"Pick","created_at":"2025-01-01T00:00:00Z"}"#,
        )
        .unwrap()
        {
            InboundFrame::Message(msg) => {
                assert_eq!(msg.id, MessageId::Confirmed(9));
                assert_eq!(msg.sender, Sender::Assistant);
            }
            other => panic!("unexpected frame {:?}", other),
        }
    }

    #[test]
    fn connection_established_keeps_state_payload() {
        let frame =
            parse_inbound(r#"{"type":"connection_established","chat_state":{"step":1}}"#).unwrap();
        assert!(matches!(
            frame,
            InboundFrame::ConnectionEstablished { chat_state: Some(_) }
        ));
    }

    #[test]
    fn unknown_shape_is_not_an_error_but_bad_json_is() {
        assert_eq!(
            parse_inbound(r#"{"type":"typing"}"#).unwrap(),
            InboundFrame::Unrecognized(Some("typing".into()))
        );
        assert_eq!(
            parse_inbound(r#"{"id":null}"#).unwrap(),
            InboundFrame::Unrecognized(None)
        );
        assert!(parse_inbound("{not json").is_err());
    }

    #[test]
    fn outbound_user_message_shape() {
        let json = OutboundFrame::user_message(ResponseKind::Text, "I feel nauseous")
            .to_json()
            .unwrap();
        let value: Value = serde_json::from_str(&json).unwrap();
        assert_eq!(
            value,
            serde_json::json!({"type":"user_message","message_type":"text","content":"I feel nauseous"})
        );
    }
}
