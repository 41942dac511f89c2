//! Chat controller: the single owner of the session's message list.
//!
//! Nothing here performs I/O. Methods return the frame to send (if any) and the caller decides
//! how to deliver it, so the same controller drives the terminal chat and the tests.

use std::collections::HashSet;

use chrono::NaiveDate;

use super::interaction::{
    calendar_reply, input_affordance, interactive_index, ButtonIntent, InputAffordance,
};
use super::message::{ChatSession, ConversationState, Message, ResponseKind, StructuredData};
use super::protocol::{InboundFrame, OutboundFrame};
use super::reconstruct::{MessageStreamReconstructor, Reconstruction};

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum SelectionError {
    #[error("select at least one option")]
    Empty,
    #[error("select at most {max} options ({given} selected)")]
    TooMany { max: usize, given: usize },
    #[error("this prompt has already been answered")]
    NotInteractive,
}

/// Result of pressing a button on a single-select prompt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ButtonOutcome {
    /// Nothing was sent; the caller should ask for a date and call `submit_calendar_date`.
    OpenCalendar,
    Sent {
        frame: Option<OutboundFrame>,
        /// Today's chemotherapy date should be logged (best effort).
        log_chemo_today: bool,
    },
    /// The prompt was superseded (or a reply is pending); nothing was sent.
    NotInteractive,
}

#[derive(Debug)]
pub struct ChatController {
    session: ChatSession,
    sealed: HashSet<i64>,
    thinking: bool,
    next_local_id: u64,
    reconstructor: MessageStreamReconstructor,
}

impl ChatController {
    pub fn new(session: ChatSession) -> Self {
        Self::with_reconstructor(session, MessageStreamReconstructor::default())
    }

    pub fn with_reconstructor(session: ChatSession, reconstructor: MessageStreamReconstructor) -> Self {
        let sealed = sealed_ids(&session.messages);
        Self {
            session,
            sealed,
            thinking: false,
            next_local_id: 1,
            reconstructor,
        }
    }

    pub fn session(&self) -> &ChatSession {
        &self.session
    }

    pub fn chat_uuid(&self) -> &str {
        &self.session.chat_uuid
    }

    pub fn messages(&self) -> &[Message] {
        &self.session.messages
    }

    pub fn conversation_state(&self) -> ConversationState {
        self.session.conversation_state
    }

    pub fn is_thinking(&self) -> bool {
        self.thinking
    }

    /// Supersede the current session; a new conversation starts from its own history.
    pub fn replace_session(&mut self, session: ChatSession) {
        self.sealed = sealed_ids(&session.messages);
        self.session = session;
        self.thinking = false;
    }

    pub fn affordance(&self) -> InputAffordance {
        input_affordance(
            &self.session.messages,
            self.session.conversation_state,
            self.thinking,
        )
    }

    pub fn apply_frame(&mut self, frame: InboundFrame) -> Reconstruction {
        let outcome = self.reconstructor.apply(
            &mut self.session.messages,
            &mut self.sealed,
            Some(self.session.chat_uuid.as_str()),
            frame,
        );
        if outcome.clears_thinking() {
            self.thinking = false;
        }
        if let Reconstruction::Finalized {
            conversation_state: Some(state),
            ..
        } = outcome
        {
            log::info!("conversation {} is now {:?}", self.session.chat_uuid, state);
            self.session.conversation_state = state;
        }
        outcome
    }

    /// Echo a user message locally. Returns the frame to send when connected.
    pub fn compose(
        &mut self,
        content: impl Into<String>,
        kind: ResponseKind,
        connected: bool,
    ) -> Option<OutboundFrame> {
        if self.session.conversation_state.is_terminal() {
            log::warn!("conversation is over; message not sent");
            return None;
        }
        let content = content.into();
        let local_id = self.next_local_id;
        self.next_local_id += 1;
        self.session.messages.push(Message::user_echo(
            local_id,
            Some(self.session.chat_uuid.clone()),
            kind,
            content.clone(),
        ));
        if !connected {
            log::warn!("not connected; message {} kept locally only", local_id);
            return None;
        }
        self.thinking = true;
        Some(OutboundFrame::user_message(kind, content))
    }

    pub fn choose_button(&mut self, option: &str, connected: bool) -> ButtonOutcome {
        if !self.prompt_is_live(InputAffordance::ShowButtons) {
            return ButtonOutcome::NotInteractive;
        }
        match ButtonIntent::classify(option, self.session.messages.last()) {
            ButtonIntent::OpenCalendar => ButtonOutcome::OpenCalendar,
            intent => ButtonOutcome::Sent {
                frame: self.compose(option, ResponseKind::ButtonResponse, connected),
                log_chemo_today: intent == ButtonIntent::LogTodayThenSend,
            },
        }
    }

    /// Answer the button prompt with a picked date. `None` once the prompt is no longer live.
    pub fn submit_calendar_date(&mut self, date: NaiveDate, connected: bool) -> Option<OutboundFrame> {
        if !self.prompt_is_live(InputAffordance::ShowButtons) {
            return None;
        }
        self.compose(calendar_reply(date), ResponseKind::ButtonResponse, connected)
    }

    /// Record the selections on the prompt they answer and send them as one comma-joined reply.
    pub fn submit_multi_select(
        &mut self,
        selections: &[String],
        connected: bool,
    ) -> Result<Option<OutboundFrame>, SelectionError> {
        if !self.prompt_is_live(InputAffordance::ShowMultiSelect) {
            return Err(SelectionError::NotInteractive);
        }
        if selections.is_empty() {
            return Err(SelectionError::Empty);
        }
        let Some(prompt) = interactive_index(&self.session.messages)
            .and_then(|index| self.session.messages.get_mut(index))
        else {
            return Err(SelectionError::NotInteractive);
        };
        let data = prompt.structured_data.get_or_insert_with(StructuredData::default);
        if let Some(max) = data.max_selections {
            if selections.len() > max {
                return Err(SelectionError::TooMany {
                    max,
                    given: selections.len(),
                });
            }
        }
        data.selected_options = Some(selections.to_vec());
        Ok(self.compose(
            selections.join(", "),
            ResponseKind::MultiSelectResponse,
            connected,
        ))
    }

    pub fn select_feeling(&mut self, feeling: &str, connected: bool) -> Option<OutboundFrame> {
        if !self.prompt_is_live(InputAffordance::ShowFeelingSelector) {
            return None;
        }
        self.compose(feeling, ResponseKind::FeelingResponse, connected)
    }

    fn prompt_is_live(&self, expected: InputAffordance) -> bool {
        let live = self.affordance() == expected;
        if !live {
            log::warn!("prompt is no longer interactive; answer ignored");
        }
        live
    }
}

fn sealed_ids(messages: &[Message]) -> HashSet<i64> {
    messages.iter().filter_map(|m| m.id.confirmed()).collect()
}
