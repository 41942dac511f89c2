//! Chat model and the pure logic around it: frames, stream reconstruction, input rules,
//! the controller owning the message list, and the login session timer.

pub mod controller;
pub mod interaction;
pub mod message;
pub mod protocol;
pub mod reconstruct;
pub mod timeout;

pub use controller::{ButtonOutcome, ChatController, SelectionError};
pub use interaction::{input_affordance, ButtonIntent, InputAffordance};
pub use message::{ChatSession, ConversationState, Message, MessageId, MessageType, ResponseKind, Sender};
pub use protocol::{parse_inbound, InboundFrame, OutboundFrame};
pub use reconstruct::{MessageStreamReconstructor, Reconstruction};
pub use timeout::{SessionTimer, SystemClock};
