//! Wire protocol between the bridge and the remote proxy.
//!
//! Frames are JSON text messages. Inbound frames are decoded into
//! [`InboundMessage`]; replies are built as [`OutboundFrame`]s.

use crate::error::ProtocolError;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Inbound `type` that carries a request for the model.
pub const BUYER_MESSAGE: &str = "buyer_message";
/// Inbound `type` for proxy notices.
pub const SYSTEM_MESSAGE: &str = "system";

/// Correlation id echoed back on every frame produced for a request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MessageId {
    Int(i64),
    Text(String),
}

impl Default for MessageId {
    /// The proxy uses `-1` when a request carries no id.
    fn default() -> Self {
        MessageId::Int(-1)
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MessageId::Int(id) => write!(f, "{}", id),
            MessageId::Text(id) => f.write_str(id),
        }
    }
}

impl From<&str> for MessageId {
    fn from(id: &str) -> Self {
        MessageId::Text(id.to_string())
    }
}

impl From<i64> for MessageId {
    fn from(id: i64) -> Self {
        MessageId::Int(id)
    }
}

/// A decoded inbound message.
#[derive(Debug, Clone, PartialEq)]
pub enum InboundMessage {
    /// A prompt to run through the model.
    UserRequest {
        prompt: String,
        message_id: MessageId,
        stream: bool,
    },
    /// A notice from the proxy. Never answered.
    SystemNotice { content: Option<String> },
    /// Any other `type`.
    Unknown { kind: String },
}

impl InboundMessage {
    /// Decode one text frame.
    pub fn parse(text: &str) -> Result<Self, ProtocolError> {
        let envelope: Envelope = serde_json::from_str(text)?;
        envelope.into_message()
    }

    /// The `type` tag this message arrived with.
    pub fn kind(&self) -> &str {
        match self {
            InboundMessage::UserRequest { .. } => BUYER_MESSAGE,
            InboundMessage::SystemNotice { .. } => SYSTEM_MESSAGE,
            InboundMessage::Unknown { kind } => kind,
        }
    }
}

/// Raw inbound envelope as it appears on the wire.
#[derive(Debug, Deserialize)]
struct Envelope {
    #[serde(rename = "type")]
    kind: Option<String>,
    #[serde(default)]
    content: Option<String>,
    #[serde(default, rename = "messageId")]
    message_id: Option<MessageId>,
    #[serde(default)]
    stream: Option<bool>,
}

impl Envelope {
    fn into_message(self) -> Result<InboundMessage, ProtocolError> {
        let kind = self.kind.ok_or(ProtocolError::MissingField("type"))?;
        match kind.as_str() {
            BUYER_MESSAGE => Ok(InboundMessage::UserRequest {
                prompt: self.content.ok_or(ProtocolError::MissingField("content"))?,
                message_id: self.message_id.unwrap_or_default(),
                stream: self.stream.unwrap_or(false),
            }),
            SYSTEM_MESSAGE => Ok(InboundMessage::SystemNotice {
                content: self.content,
            }),
            _ => Ok(InboundMessage::Unknown { kind }),
        }
    }
}

/// Outbound frame kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FrameKind {
    /// Text produced by the model (`from_owner`).
    FromOwner,
    /// Marks the end of a streamed answer.
    FinishedMessageStream,
}

/// A frame sent back to the proxy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutboundFrame {
    #[serde(rename = "type")]
    pub kind: FrameKind,
    pub content: String,
    #[serde(rename = "messageId")]
    pub message_id: MessageId,
    /// Epoch milliseconds at construction.
    pub timestamp: i64,
}

impl OutboundFrame {
    /// A text reply for the given request.
    pub fn reply(content: impl Into<String>, message_id: MessageId) -> Self {
        Self {
            kind: FrameKind::FromOwner,
            content: content.into(),
            message_id,
            timestamp: chrono::Utc::now().timestamp_millis(),
        }
    }

    /// The control frame that closes a stream on the proxy side.
    pub fn stream_finished(message_id: MessageId) -> Self {
        Self {
            kind: FrameKind::FinishedMessageStream,
            content: String::new(),
            message_id,
            timestamp: chrono::Utc::now().timestamp_millis(),
        }
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_buyer_message() {
        let msg = InboundMessage::parse(
            r#"{"type":"buyer_message","content":"hello","messageId":"m1","stream":false}"#,
        )
        .unwrap();
        assert_eq!(
            msg,
            InboundMessage::UserRequest {
                prompt: "hello".to_string(),
                message_id: MessageId::from("m1"),
                stream: false,
            }
        );
    }

    #[test]
    fn test_parse_buyer_message_defaults() {
        let msg = InboundMessage::parse(r#"{"type":"buyer_message","content":"hi"}"#).unwrap();
        match msg {
            InboundMessage::UserRequest {
                message_id, stream, ..
            } => {
                assert_eq!(message_id, MessageId::Int(-1));
                assert!(!stream);
            }
            other => panic!("unexpected message: {:?}", other),
        }
    }

    #[test]
    fn test_parse_integer_message_id() {
        let msg = InboundMessage::parse(
            r#"{"type":"buyer_message","content":"hi","messageId":42,"stream":true}"#,
        )
        .unwrap();
        assert!(matches!(
            msg,
            InboundMessage::UserRequest { message_id: MessageId::Int(42), stream: true, .. }
        ));
    }

    #[test]
    fn test_parse_system_and_unknown() {
        let system = InboundMessage::parse(r#"{"type":"system","content":"welcome"}"#).unwrap();
        assert_eq!(system.kind(), "system");
        assert!(matches!(system, InboundMessage::SystemNotice { .. }));

        let other = InboundMessage::parse(r#"{"type":"typing"}"#).unwrap();
        assert_eq!(other, InboundMessage::Unknown { kind: "typing".to_string() });
    }

    #[test]
    fn test_parse_errors() {
        assert!(matches!(
            InboundMessage::parse("not json"),
            Err(ProtocolError::Malformed(_))
        ));
        assert!(matches!(
            InboundMessage::parse(r#"{"type":"buyer_message"}"#),
            Err(ProtocolError::MissingField("content"))
        ));
        assert!(matches!(
            InboundMessage::parse(r#"{"content":"x"}"#),
            Err(ProtocolError::MissingField("type"))
        ));
    }

    #[test]
    fn test_reply_frame_wire_format() {
        let frame = OutboundFrame::reply("hi there", MessageId::from("m1"));
        let value: serde_json::Value = serde_json::from_str(&frame.to_json().unwrap()).unwrap();
        assert_eq!(value["type"], "from_owner");
        assert_eq!(value["content"], "hi there");
        assert_eq!(value["messageId"], "m1");
        assert!(value["timestamp"].as_i64().unwrap() > 0);
    }

    #[test]
    fn test_stream_finished_frame_wire_format() {
        let frame = OutboundFrame::stream_finished(MessageId::Int(7));
        let value: serde_json::Value = serde_json::from_str(&frame.to_json().unwrap()).unwrap();
        assert_eq!(value["type"], "finished_message_stream");
        assert_eq!(value["content"], "");
        assert_eq!(value["messageId"], 7);
    }
}
