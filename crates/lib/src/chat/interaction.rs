//! Which input the user may give next, and how button answers are routed.

use chrono::NaiveDate;

use super::message::{ConversationState, Message, MessageType, Sender};

pub const CHEMO_CONFIRMATION_PHRASE: &str = "did you get chemotherapy";
pub const RECENT_UNRECORDED_OPTION: &str = "I had it recently, but didn't record it";
pub const FEELINGS: [&str; 5] = ["Very Happy", "Happy", "Neutral", "Sad", "Very Sad"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InputAffordance {
    ShowTextInput,
    ShowButtons,
    ShowMultiSelect,
    ShowFeelingSelector,
    ShowNothing,
}

impl InputAffordance {
    pub fn accepts_input(self) -> bool {
        self != Self::ShowNothing
    }
}

pub fn input_affordance(
    messages: &[Message],
    state: ConversationState,
    is_thinking: bool,
) -> InputAffordance {
    if state.is_terminal() {
        return InputAffordance::ShowNothing;
    }
    let Some(last) = messages.last() else {
        return InputAffordance::ShowTextInput;
    };
    if is_thinking || last.sender == Sender::User {
        return InputAffordance::ShowNothing;
    }
    match last.message_type {
        MessageType::SingleSelect => InputAffordance::ShowButtons,
        MessageType::MultiSelect => InputAffordance::ShowMultiSelect,
        MessageType::FeelingSelect => InputAffordance::ShowFeelingSelector,
        MessageType::Text => InputAffordance::ShowTextInput,
        _ => InputAffordance::ShowNothing,
    }
}

/// Index of the only message whose options are still live: the last one, if the assistant sent it.
pub fn interactive_index(messages: &[Message]) -> Option<usize> {
    let index = messages.len().checked_sub(1)?;
    (messages[index].sender == Sender::Assistant).then_some(index)
}

/// Feeling choices for a prompt; the fixed scale when the prompt carries none.
pub fn feeling_options(message: &Message) -> Vec<String> {
    if message.options().is_empty() {
        FEELINGS.iter().map(|f| f.to_string()).collect()
    } else {
        message.options().to_vec()
    }
}

/// How a button press is handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ButtonIntent {
    /// Ask for a date instead of sending.
    OpenCalendar,
    /// Log today's chemotherapy date, then send the answer.
    LogTodayThenSend,
    Send,
}

impl ButtonIntent {
    pub fn classify(option: &str, last_message: Option<&Message>) -> Self {
        if option == RECENT_UNRECORDED_OPTION {
            return Self::OpenCalendar;
        }
        let asked_about_chemo = last_message.map_or(false, |m| {
            m.content
                .to_lowercase()
                .contains(CHEMO_CONFIRMATION_PHRASE)
        });
        if option == "Yes" && asked_about_chemo {
            Self::LogTodayThenSend
        } else {
            Self::Send
        }
    }
}

/// Answer sent after a date was picked in the calendar flow.
pub fn calendar_reply(date: NaiveDate) -> String {
    format!("Yes, I got chemotherapy on {}", date.format("%B %-d, %Y"))
}
