//! Folds inbound frames into the message list owned by the chat controller.
//!
//! The reconstructor holds no message data. Callers pass the list plus the set of message ids
//! that are already sealed (ended or delivered authoritatively); chunks for a sealed id are
//! discarded so a finished message never changes content again.

use std::collections::HashSet;

use super::message::{ConversationState, Message, MessageId, Sender};
use super::protocol::InboundFrame;

pub const COMPLETION_MARKER: &str = "Thank you for completing this chat!";

/// What a frame did to the message list.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reconstruction {
    /// A chunk created a new assistant message at `index`.
    Started { index: usize },
    /// A chunk extended the message at `index`.
    Appended { index: usize },
    /// A chunk arrived for a message that is already sealed.
    Discarded { message_id: i64 },
    Ended { message_id: Option<i64> },
    /// An authoritative message now sits at `index`.
    Finalized {
        index: usize,
        conversation_state: Option<ConversationState>,
    },
    Ignored,
}

impl Reconstruction {
    /// Every chunk, end and message frame clears the thinking indicator.
    pub fn clears_thinking(&self) -> bool {
        !matches!(self, Self::Ignored)
    }
}

#[derive(Debug, Clone)]
pub struct MessageStreamReconstructor {
    completion_marker: String,
}

impl Default for MessageStreamReconstructor {
    fn default() -> Self {
        Self::new(COMPLETION_MARKER)
    }
}

impl MessageStreamReconstructor {
    pub fn new(completion_marker: impl Into<String>) -> Self {
        Self {
            completion_marker: completion_marker.into(),
        }
    }

    pub fn apply(
        &self,
        messages: &mut Vec<Message>,
        sealed: &mut HashSet<i64>,
        chat_uuid: Option<&str>,
        frame: InboundFrame,
    ) -> Reconstruction {
        match frame {
            InboundFrame::MessageChunk {
                message_id,
                content,
            } => {
                if sealed.contains(&message_id) {
                    log::warn!("chunk for sealed message {} discarded", message_id);
                    return Reconstruction::Discarded { message_id };
                }
                let target = MessageId::Confirmed(message_id);
                match messages.iter().position(|m| m.id == target) {
                    Some(index) => {
                        messages[index].content.push_str(&content);
                        Reconstruction::Appended { index }
                    }
                    None => {
                        messages.push(Message::assistant_chunk(
                            message_id,
                            chat_uuid.map(str::to_string),
                            content,
                        ));
                        Reconstruction::Started {
                            index: messages.len() - 1,
                        }
                    }
                }
            }
            InboundFrame::MessageEnd { message_id } => {
                let ended = message_id.or_else(|| {
                    messages
                        .iter()
                        .rev()
                        .find(|m| m.sender == Sender::Assistant)
                        .and_then(|m| m.id.confirmed())
                });
                if let Some(id) = ended {
                    sealed.insert(id);
                }
                Reconstruction::Ended { message_id: ended }
            }
            InboundFrame::Message(message) => {
                let incoming = message.id;
                messages.retain(|m| !m.id.is_pending() && m.id != incoming);
                if let Some(id) = incoming.confirmed() {
                    sealed.insert(id);
                }
                let conversation_state = message
                    .content
                    .contains(&self.completion_marker)
                    .then_some(ConversationState::Completed);
                messages.push(message);
                Reconstruction::Finalized {
                    index: messages.len() - 1,
                    conversation_state,
                }
            }
            InboundFrame::ConnectionEstablished { .. } | InboundFrame::Unrecognized(_) => {
                Reconstruction::Ignored
            }
        }
    }
}
