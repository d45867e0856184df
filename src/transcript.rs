use crate::decoder::{Delta, StreamResult};
use crate::models::ChatMessage;
use crate::request::ApiMessage;
use uuid::Uuid;

pub const GREETING: &str = "Hello, I'm your Office AI assistant. How can I help you?";

/// Where the current send is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SendPhase {
    #[default]
    Idle,
    Sending,
    Streaming,
    Retrying,
    Completed,
    Failed,
}

/// Identifies the placeholder a send is allowed to write to.
/// Writes carrying a ticket from an older generation are ignored.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamTicket {
    pub index: usize,
    pub generation: u64,
    pub message_id: Uuid,
}

/// The chat transcript plus the bookkeeping for the one message that may be streaming.
#[derive(Debug, Clone, Default)]
pub struct Transcript {
    messages: Vec<ChatMessage>,
    streaming_index: Option<usize>,
    generation: u64,
    phase: SendPhase,
    show_thinking: bool,
    is_loading: bool,
    error: Option<String>,
}

impl Transcript {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_greeting() -> Self {
        let mut transcript = Self::new();
        transcript.reset();
        transcript
    }

    /// Back to a fresh chat. Any in-flight send loses its placeholder.
    pub fn reset(&mut self) {
        self.replace_messages(vec![ChatMessage::assistant(GREETING)]);
    }

    pub fn replace_messages(&mut self, messages: Vec<ChatMessage>) {
        self.messages = messages;
        self.streaming_index = None;
        self.generation += 1;
        self.phase = SendPhase::Idle;
        self.show_thinking = false;
        self.is_loading = false;
        self.error = None;
    }

    pub fn messages(&self) -> &[ChatMessage] {
        &self.messages
    }

    pub fn last_message(&self) -> Option<&ChatMessage> {
        self.messages.last()
    }

    pub fn streaming_index(&self) -> Option<usize> {
        self.streaming_index
    }

    pub fn streaming_message(&self) -> Option<&ChatMessage> {
        self.streaming_index.and_then(|i| self.messages.get(i))
    }

    pub fn phase(&self) -> SendPhase {
        self.phase
    }

    pub fn show_thinking(&self) -> bool {
        self.show_thinking
    }

    pub fn is_loading(&self) -> bool {
        self.is_loading
    }

    pub fn error(&self) -> Option<&str> {
        self.error.as_deref()
    }

    pub fn toggle_thinking(&mut self, value: Option<bool>) {
        self.show_thinking = value.unwrap_or(!self.show_thinking);
    }

    pub fn is_current(&self, ticket: &StreamTicket) -> bool {
        self.generation == ticket.generation && self.streaming_index == Some(ticket.index)
    }

    /// Appends the user message and a fresh placeholder, dropping an empty
    /// placeholder left behind by an aborted send.
    pub fn begin(&mut self, user_text: &str, enable_thinking: bool) -> StreamTicket {
        if let Some(index) = self.streaming_index.take() {
            if self.messages.get(index).is_some_and(|m| m.content.trim().is_empty()) {
                log::debug!("Discarding empty placeholder at {}", index);
                self.messages.remove(index);
            }
        }

        self.messages.push(ChatMessage::user(user_text));

        let mut placeholder = ChatMessage::assistant("");
        placeholder.thinking = enable_thinking.then(String::new);
        let message_id = placeholder.id;
        self.messages.push(placeholder);

        let index = self.messages.len() - 1;
        self.generation += 1;
        self.streaming_index = Some(index);
        self.phase = SendPhase::Sending;
        self.show_thinking = enable_thinking;
        self.is_loading = true;
        self.error = None;

        StreamTicket {
            index,
            generation: self.generation,
            message_id,
        }
    }

    /// The conversation as sent to the provider: everything but the placeholder.
    pub fn outgoing(&self, ticket: &StreamTicket) -> Vec<ApiMessage> {
        self.messages
            .iter()
            .enumerate()
            .filter(|(i, _)| *i != ticket.index)
            .map(|(_, m)| ApiMessage::new(m.role, m.content.clone()))
            .collect()
    }

    fn placeholder_mut(&mut self, ticket: &StreamTicket) -> Option<&mut ChatMessage> {
        if self.is_current(ticket) {
            self.messages.get_mut(ticket.index)
        } else {
            None
        }
    }

    pub fn set_phase(&mut self, ticket: &StreamTicket, phase: SendPhase) -> bool {
        if !self.is_current(ticket) {
            return false;
        }
        self.phase = phase;
        true
    }

    /// Clears what a failed attempt wrote before retrying.
    pub fn reset_placeholder(&mut self, ticket: &StreamTicket) -> bool {
        let Some(message) = self.placeholder_mut(ticket) else {
            return false;
        };
        message.content.clear();
        if let Some(thinking) = message.thinking.as_mut() {
            thinking.clear();
        }
        true
    }

    pub fn apply_delta(&mut self, ticket: &StreamTicket, delta: &Delta) -> bool {
        match delta {
            Delta::Answer { full, .. } => self.apply_answer(ticket, full),
            Delta::Thinking { full } => self.apply_thinking(ticket, full),
        }
    }

    pub fn apply_answer(&mut self, ticket: &StreamTicket, full: &str) -> bool {
        let Some(message) = self.placeholder_mut(ticket) else {
            return false;
        };
        message.content = full.to_string();
        true
    }

    pub fn apply_thinking(&mut self, ticket: &StreamTicket, full: &str) -> bool {
        let Some(message) = self.placeholder_mut(ticket) else {
            return false;
        };
        message.thinking = Some(full.to_string());
        if !full.trim().is_empty() {
            self.show_thinking = true;
        }
        true
    }

    pub fn complete(&mut self, ticket: &StreamTicket, result: &StreamResult) -> bool {
        let Some(message) = self.placeholder_mut(ticket) else {
            return false;
        };
        if !result.answer.is_empty() {
            message.content = result.answer.clone();
        }
        if result.thinking.is_some() {
            message.thinking = result.thinking.clone();
        }
        message.timestamp = chrono::Utc::now();
        self.phase = SendPhase::Completed;
        self.is_loading = false;
        true
    }

    /// Replaces the placeholder with a user-visible error.
    pub fn fail(&mut self, ticket: &StreamTicket, message: String) -> bool {
        let Some(placeholder) = self.placeholder_mut(ticket) else {
            return false;
        };
        placeholder.content = message.clone();
        self.error = Some(message);
        self.phase = SendPhase::Failed;
        self.is_loading = false;
        true
    }

    pub fn end_streaming(&mut self, ticket: &StreamTicket) -> bool {
        if !self.is_current(ticket) {
            return false;
        }
        self.streaming_index = None;
        self.is_loading = false;
        true
    }

    #[cfg(test)]
    fn count_role(&self, role: crate::models::Role) -> usize {
        self.messages.iter().filter(|m| m.role == role).count()
    }
}
