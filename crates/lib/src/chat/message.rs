//! Chat data model: sessions, messages, and message identity.
//!
//! A `Message` coming from the server carries a confirmed integer id. Messages the user just
//! sent are rendered before the server acknowledges them; those carry a pending id until the
//! authoritative copy replaces them.

use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// Wire value used for a message the server has not acknowledged yet.
pub const PENDING_WIRE_ID: i64 = -1;

/// Session-level lifecycle flag. The upstream reports several in-progress states
/// (e.g. `CHEMO_CHECK_SENT`); all of them read as `Active` here.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ConversationState {
    Completed,
    Emergency,
    #[default]
    #[serde(other)]
    Active,
}

impl ConversationState {
    /// No further input is accepted once a conversation reaches a terminal state.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Emergency)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Sender {
    User,
    Assistant,
}

/// Kind of a message. Prompt kinds accept the hyphenated spelling the web client used.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageType {
    #[default]
    Text,
    ButtonResponse,
    MultiSelectResponse,
    FeelingResponse,
    #[serde(alias = "single-select", alias = "button_prompt")]
    SingleSelect,
    #[serde(alias = "multi-select")]
    MultiSelect,
    #[serde(alias = "feeling-select")]
    FeelingSelect,
    #[serde(other)]
    Unknown,
}

/// The message types a user may send back over the socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResponseKind {
    Text,
    ButtonResponse,
    MultiSelectResponse,
    FeelingResponse,
}

impl From<ResponseKind> for MessageType {
    fn from(kind: ResponseKind) -> Self {
        match kind {
            ResponseKind::Text => MessageType::Text,
            ResponseKind::ButtonResponse => MessageType::ButtonResponse,
            ResponseKind::MultiSelectResponse => MessageType::MultiSelectResponse,
            ResponseKind::FeelingResponse => MessageType::FeelingResponse,
        }
    }
}

/// Options attached to a prompt, and the user's recorded answer to it.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StructuredData {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub options: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_selections: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub selected_options: Option<Vec<String>>,
}

impl StructuredData {
    pub fn options(&self) -> &[String] {
        self.options.as_deref().unwrap_or(&[])
    }
}

/// Identity of a message: either a local optimistic echo or a server-assigned id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageId {
    Pending { local_id: u64 },
    Confirmed(i64),
}

impl MessageId {
    pub fn is_pending(&self) -> bool {
        matches!(self, Self::Pending { .. })
    }

    pub fn confirmed(&self) -> Option<i64> {
        match self {
            Self::Confirmed(id) => Some(*id),
            Self::Pending { .. } => None,
        }
    }

    pub fn from_wire(id: i64) -> Self {
        if id == PENDING_WIRE_ID {
            Self::Pending { local_id: 0 }
        } else {
            Self::Confirmed(id)
        }
    }

    pub fn to_wire(&self) -> i64 {
        self.confirmed().unwrap_or(PENDING_WIRE_ID)
    }
}

impl Serialize for MessageId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_i64(self.to_wire())
    }
}

impl<'de> Deserialize<'de> for MessageId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        i64::deserialize(deserializer).map(MessageId::from_wire)
    }
}

/// One chat message. `content` is the only field that grows while a reply streams in.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub id: MessageId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chat_uuid: Option<String>,
    pub sender: Sender,
    #[serde(default)]
    pub message_type: MessageType,
    #[serde(default)]
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub structured_data: Option<StructuredData>,
    #[serde(default = "Utc::now", deserialize_with = "lenient_timestamp")]
    pub created_at: DateTime<Utc>,
}

impl Message {
    /// Optimistic local copy of something the user just sent.
    pub fn user_echo(
        local_id: u64,
        chat_uuid: Option<String>,
        kind: ResponseKind,
        content: impl Into<String>,
    ) -> Self {
        Self {
            id: MessageId::Pending { local_id },
            chat_uuid,
            sender: Sender::User,
            message_type: kind.into(),
            content: content.into(),
            structured_data: None,
            created_at: Utc::now(),
        }
    }

    /// Assistant text message synthesized from the first chunk of a stream.
    pub fn assistant_chunk(id: i64, chat_uuid: Option<String>, content: impl Into<String>) -> Self {
        Self {
            id: MessageId::Confirmed(id),
            chat_uuid,
            sender: Sender::Assistant,
            message_type: MessageType::Text,
            content: content.into(),
            structured_data: None,
            created_at: Utc::now(),
        }
    }

    pub fn options(&self) -> &[String] {
        self.structured_data
            .as_ref()
            .map(StructuredData::options)
            .unwrap_or(&[])
    }
}

/// A chat session as returned by the REST API (`today` lookup or `new`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatSession {
    pub chat_uuid: String,
    #[serde(default)]
    pub conversation_state: ConversationState,
    #[serde(default)]
    pub messages: Vec<Message>,
}

/// Parse an RFC 3339 timestamp, or a naive ISO timestamp taken as UTC.
pub fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    let raw = raw.trim();
    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return Some(dt.with_timezone(&Utc));
    }
    NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S%.f")
        .or_else(|_| NaiveDateTime::parse_from_str(raw, "%Y-%m-%d %H:%M:%S%.f"))
        .ok()
        .map(|naive| naive.and_utc())
}

fn lenient_timestamp<'de, D: Deserializer<'de>>(deserializer: D) -> Result<DateTime<Utc>, D::Error> {
    let raw = String::deserialize(deserializer)?;
    parse_timestamp(&raw)
        .ok_or_else(|| serde::de::Error::custom(format!("invalid timestamp: {}", raw)))
}
