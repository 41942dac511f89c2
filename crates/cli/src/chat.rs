//! Terminal chat: one socket session, replies printed as their chunks arrive, input shaped by
//! whatever the latest assistant prompt asks for.

use std::io::Write;

use chrono::NaiveDate;
use oncochat::chat::interaction::feeling_options;
use oncochat::chat::{
    ButtonOutcome, ChatController, InboundFrame, InputAffordance, Message, OutboundFrame,
    Reconstruction, ResponseKind, Sender, SessionTimer,
};
use oncochat::client::ws::CONNECTION_ERROR;
use oncochat::client::{
    ChatRestClient, CloseReason, ConnectionState, RetryPolicy, SessionEvent,
    WebSocketSessionManager,
};

use crate::{ClientContext, StdinLines};

pub(crate) async fn run(ctx: ClientContext, new: bool, mut lines: StdinLines) -> anyhow::Result<()> {
    let timezone = ctx.config.client.timezone.clone();
    let session = if new {
        ctx.rest.start_new_session(&timezone).await?
    } else {
        ctx.rest.today_session(&timezone).await?
    };
    println!(
        "chat {} ({:?}); type /quit to leave",
        session.chat_uuid, session.conversation_state
    );

    let mut timer = SessionTimer::from_minutes(ctx.config.session.timeout_minutes);
    timer.start();
    let mut chat = TerminalChat {
        controller: ChatController::new(session),
        rest: ctx.rest.clone(),
        timezone,
        calendar_pending: false,
    };
    for message in chat.controller.messages() {
        print_message(message);
    }

    let (mut manager, mut events) = WebSocketSessionManager::new(
        ctx.config.client.api_base.clone(),
        ctx.config.client.origin.clone(),
        ctx.auth.clone(),
        RetryPolicy::default(),
    );
    let mut state = manager.subscribe_state();
    manager
        .set_session(Some(chat.controller.chat_uuid()))
        .await;
    chat.show_prompt();

    loop {
        if chat.controller.conversation_state().is_terminal() {
            println!(
                "\nThis conversation is {:?}. Run `oncochat chat --new` to start another.",
                chat.controller.conversation_state()
            );
            break;
        }
        tokio::select! {
            event = events.recv() => match event {
                Some(SessionEvent::Frame(frame)) => chat.on_frame(frame),
                Some(SessionEvent::Error(message)) => print_error(&message),
                None => break,
            },
            changed = state.changed() => {
                if changed.is_err() {
                    break;
                }
                let current = state.borrow_and_update().clone();
                if let ConnectionState::Closed(reason) = current {
                    if reason.is_terminal() {
                        while let Ok(SessionEvent::Error(message)) = events.try_recv() {
                            print_error(&message);
                        }
                        if reason == CloseReason::Normal {
                            println!("\nThe chat connection was closed.");
                        } else {
                            println!("\nDisconnected ({:?}). Run `oncochat chat` to reconnect.", reason);
                        }
                        break;
                    }
                }
            },
            line = lines.next_line() => {
                let Some(line) = line? else {
                    break;
                };
                let line = line.trim();
                if line.eq_ignore_ascii_case("/quit") || line.eq_ignore_ascii_case("/exit") {
                    break;
                }
                if timer.is_expired() {
                    timer.clear();
                    println!("Your session timed out. Run `oncochat login` to log in again.");
                    break;
                }
                if let Some(frame) = chat.on_input(line, manager.is_open()).await {
                    if !manager.send_frame(frame) {
                        print_error("Not connected; the message was not sent.");
                    }
                }
            }
        }
    }

    manager.teardown().await;
    Ok(())
}

struct TerminalChat {
    controller: ChatController,
    rest: ChatRestClient,
    timezone: String,
    calendar_pending: bool,
}

impl TerminalChat {
    fn on_frame(&mut self, frame: InboundFrame) {
        let chunk = match &frame {
            InboundFrame::MessageChunk { content, .. } => Some(content.clone()),
            _ => None,
        };
        match self.controller.apply_frame(frame) {
            Reconstruction::Started { .. } => {
                print!("\n< {}", chunk.unwrap_or_default());
                flush();
            }
            Reconstruction::Appended { .. } => {
                print!("{}", chunk.unwrap_or_default());
                flush();
            }
            Reconstruction::Ended { .. } => {
                println!();
                self.show_prompt();
            }
            Reconstruction::Finalized { index, .. } => {
                if let Some(message) = self.controller.messages().get(index) {
                    if message.sender == Sender::Assistant {
                        print_message(message);
                    }
                }
                self.show_prompt();
            }
            Reconstruction::Discarded { message_id } => {
                log::debug!("late chunk for message {} ignored", message_id);
            }
            Reconstruction::Ignored => {}
        }
    }

    /// Turn one line of input into the frame to send, if any.
    async fn on_input(&mut self, line: &str, connected: bool) -> Option<OutboundFrame> {
        if self.calendar_pending {
            let Ok(date) = NaiveDate::parse_from_str(line, "%Y-%m-%d") else {
                println!("Enter the date as YYYY-MM-DD.");
                return None;
            };
            self.calendar_pending = false;
            self.log_chemo(date).await;
            let frame = self.controller.submit_calendar_date(date, connected);
            return self.sent_or_kept(frame, connected);
        }

        let options = self.prompt_options();
        match self.controller.affordance() {
            InputAffordance::ShowButtons => {
                let Some(option) = resolve_choice(line, &options) else {
                    println!("Choose one of the numbered options.");
                    return None;
                };
                match self.controller.choose_button(&option, connected) {
                    ButtonOutcome::OpenCalendar => {
                        self.calendar_pending = true;
                        self.show_prompt();
                        None
                    }
                    ButtonOutcome::Sent {
                        frame,
                        log_chemo_today,
                    } => {
                        if log_chemo_today {
                            self.log_chemo(today_in(&self.timezone)).await;
                        }
                        self.sent_or_kept(frame, connected)
                    }
                    ButtonOutcome::NotInteractive => {
                        println!("That prompt has already been answered.");
                        None
                    }
                }
            }
            InputAffordance::ShowMultiSelect => {
                let picked: Option<Vec<String>> = line
                    .split(',')
                    .map(str::trim)
                    .filter(|s| !s.is_empty())
                    .map(|s| resolve_choice(s, &options))
                    .collect();
                let Some(picked) = picked else {
                    println!("Use the option numbers, separated by commas.");
                    return None;
                };
                match self.controller.submit_multi_select(&picked, connected) {
                    Ok(frame) => self.sent_or_kept(frame, connected),
                    Err(e) => {
                        println!("{}", e);
                        None
                    }
                }
            }
            InputAffordance::ShowFeelingSelector => {
                let Some(feeling) = resolve_choice(line, &options) else {
                    println!("Choose one of the numbered feelings.");
                    return None;
                };
                let frame = self.controller.select_feeling(&feeling, connected);
                self.sent_or_kept(frame, connected)
            }
            InputAffordance::ShowTextInput => {
                if line.is_empty() {
                    return None;
                }
                let frame = self.controller.compose(line, ResponseKind::Text, connected);
                self.sent_or_kept(frame, connected)
            }
            InputAffordance::ShowNothing => {
                println!("Waiting for a reply.");
                None
            }
        }
    }

    fn sent_or_kept(&self, frame: Option<OutboundFrame>, connected: bool) -> Option<OutboundFrame> {
        if frame.is_none() && !connected {
            print_error("Not connected; the message was kept locally.");
        }
        frame
    }

    /// Chemotherapy logging is best effort: a failure never blocks the reply.
    async fn log_chemo(&self, date: NaiveDate) {
        match self.rest.log_chemo_date(date, &self.timezone).await {
            Ok(_) => log::info!("logged chemotherapy date {}", date),
            Err(e) => log::warn!("could not log chemotherapy date {}: {}", date, e),
        }
    }

    fn prompt_options(&self) -> Vec<String> {
        let Some(last) = self.controller.messages().last() else {
            return Vec::new();
        };
        match self.controller.affordance() {
            InputAffordance::ShowFeelingSelector => feeling_options(last),
            _ => last.options().to_vec(),
        }
    }

    fn show_prompt(&self) {
        if self.calendar_pending {
            print!("Chemotherapy date (YYYY-MM-DD): ");
            flush();
            return;
        }
        let affordance = self.controller.affordance();
        let options = self.prompt_options();
        match affordance {
            InputAffordance::ShowButtons | InputAffordance::ShowFeelingSelector => {
                print_options(&options);
                print!("Choose 1-{}: ", options.len());
            }
            InputAffordance::ShowMultiSelect => {
                print_options(&options);
                let max = self
                    .controller
                    .messages()
                    .last()
                    .and_then(|m| m.structured_data.as_ref())
                    .and_then(|d| d.max_selections);
                match max {
                    Some(max) => print!("Choose up to {} (comma-separated): ", max),
                    None => print!("Choose any (comma-separated): "),
                }
            }
            InputAffordance::ShowTextInput => print!("> "),
            InputAffordance::ShowNothing => return,
        }
        flush();
    }
}

/// A 1-based option number, or the option text itself (case-insensitive).
fn resolve_choice(input: &str, options: &[String]) -> Option<String> {
    let input = input.trim();
    if let Ok(n) = input.parse::<usize>() {
        return n.checked_sub(1).and_then(|i| options.get(i)).cloned();
    }
    options
        .iter()
        .find(|o| o.eq_ignore_ascii_case(input))
        .cloned()
}

/// Today's date for a chemotherapy log in `timezone`. Only UTC names are resolved; other
/// zones use this machine's local date.
fn today_in(timezone: &str) -> NaiveDate {
    let timezone = timezone.trim();
    if ["UTC", "Etc/UTC", "GMT", "Etc/GMT", "Z"]
        .iter()
        .any(|z| z.eq_ignore_ascii_case(timezone))
    {
        chrono::Utc::now().date_naive()
    } else {
        chrono::Local::now().date_naive()
    }
}

fn print_options(options: &[String]) {
    for (i, option) in options.iter().enumerate() {
        println!("  [{}] {}", i + 1, option);
    }
}

fn print_message(message: &Message) {
    match message.sender {
        Sender::User => println!("you: {}", message.content),
        Sender::Assistant => println!("< {}", message.content),
    }
}

fn print_error(message: &str) {
    if message == CONNECTION_ERROR {
        log::warn!("{}", message);
        return;
    }
    eprintln!("\n!! {}", message);
}

fn flush() {
    let _ = std::io::stdout().flush();
}
