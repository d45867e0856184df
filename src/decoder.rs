//! Incremental decoder for `data: <json>` event streams.
//!
//! Bytes are decoded as UTF-8 across chunk boundaries, split into lines, parsed
//! as OpenAI-style chunks, and the resulting tokens are routed to an answer or a
//! thinking channel depending on `<thinking>...</thinking>` tags in the text.

use crate::error::ChatResult;
use serde::Deserialize;

pub const THINKING_OPEN: &str = "<thinking>";
pub const THINKING_CLOSE: &str = "</thinking>";

/// One update produced by the decoder.
#[derive(Debug, Clone, PartialEq)]
pub enum Delta {
    /// `chunk` is the newly decoded answer text, `full` everything so far.
    Answer { chunk: String, full: String },
    /// Cumulative thinking text, emitted when a block closes or the stream ends inside one.
    Thinking { full: String },
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct StreamResult {
    pub answer: String,
    /// `None` when no thinking tag ever appeared; `Some("")` for an empty block.
    pub thinking: Option<String>,
    /// Whether a `[DONE]` (or empty data) line was seen.
    pub ended: bool,
    /// Events dropped because their payload was not valid JSON.
    pub skipped_events: usize,
}

// Response structure for streaming chunks. Everything is optional: providers
// send pings, usage frames and role-only deltas on the same stream.
#[derive(Deserialize, Debug)]
struct StreamChunk {
    #[serde(default)]
    choices: Vec<StreamChoice>,
}

#[derive(Deserialize, Debug)]
struct StreamChoice {
    #[serde(default)]
    delta: Option<StreamDelta>,
}

#[derive(Deserialize, Debug)]
struct StreamDelta {
    #[serde(default)]
    content: Option<String>,
}

fn parse_token(data: &str) -> ChatResult<Option<String>> {
    let chunk: StreamChunk = serde_json::from_str(data)?;
    Ok(chunk
        .choices
        .into_iter()
        .next()
        .and_then(|choice| choice.delta)
        .and_then(|delta| delta.content)
        .filter(|content| !content.is_empty()))
}

/// Length of the longest proper prefix of `tag` that `text` ends with.
fn partial_tag_suffix(text: &str, tag: &str) -> usize {
    let max = text.len().min(tag.len() - 1);
    (1..=max)
        .rev()
        .find(|&k| text.as_bytes().ends_with(&tag.as_bytes()[..k]))
        .unwrap_or(0)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TagState {
    Outside,
    Inside,
}

/// Splits a token stream into answer and thinking text.
///
/// Text that could be the beginning of the tag being looked for is held back in
/// `pending` until later tokens decide it, so a tag split across tokens never
/// leaks into the wrong channel.
#[derive(Debug)]
struct ThinkingSplitter {
    state: TagState,
    pending: String,
    answer: String,
    thinking: Option<String>,
}

impl ThinkingSplitter {
    fn new() -> Self {
        Self {
            state: TagState::Outside,
            pending: String::new(),
            answer: String::new(),
            thinking: None,
        }
    }

    fn push(&mut self, token: &str, out: &mut Vec<Delta>) {
        self.pending.push_str(token);
        loop {
            match self.state {
                TagState::Outside => {
                    if let Some(pos) = self.pending.find(THINKING_OPEN) {
                        let rest = self.pending.split_off(pos);
                        let before = std::mem::replace(&mut self.pending, rest[THINKING_OPEN.len()..].to_string());
                        self.emit_answer(&before, out);
                        self.state = TagState::Inside;
                        self.thinking.get_or_insert_with(String::new);
                        log::debug!("Thinking block opened");
                        continue;
                    }
                    let ready = self.pending.len() - partial_tag_suffix(&self.pending, THINKING_OPEN);
                    let text: String = self.pending.drain(..ready).collect();
                    self.emit_answer(&text, out);
                }
                TagState::Inside => {
                    if let Some(pos) = self.pending.find(THINKING_CLOSE) {
                        let rest = self.pending.split_off(pos);
                        let inner = std::mem::replace(&mut self.pending, rest[THINKING_CLOSE.len()..].to_string());
                        let thinking = self.thinking.get_or_insert_with(String::new);
                        thinking.push_str(&inner);
                        out.push(Delta::Thinking { full: thinking.clone() });
                        self.state = TagState::Outside;
                        log::debug!("Thinking block closed ({} chars)", thinking.len());
                        continue;
                    }
                    let ready = self.pending.len() - partial_tag_suffix(&self.pending, THINKING_CLOSE);
                    self.thinking
                        .get_or_insert_with(String::new)
                        .extend(self.pending.drain(..ready));
                }
            }
            break;
        }
    }

    fn emit_answer(&mut self, text: &str, out: &mut Vec<Delta>) {
        if text.is_empty() {
            return;
        }
        self.answer.push_str(text);
        out.push(Delta::Answer {
            chunk: text.to_string(),
            full: self.answer.clone(),
        });
    }

    // Held-back text turned out not to be a tag.
    fn finish(&mut self, out: &mut Vec<Delta>) {
        let pending = std::mem::take(&mut self.pending);
        match self.state {
            TagState::Outside => self.emit_answer(&pending, out),
            TagState::Inside => {
                let thinking = self.thinking.get_or_insert_with(String::new);
                thinking.push_str(&pending);
                out.push(Delta::Thinking { full: thinking.clone() });
            }
        }
    }
}

/// Per-request stream state. Feed it byte chunks as they arrive, then call
/// [`StreamDecoder::finish`] once the transport is done.
#[derive(Debug)]
pub struct StreamDecoder {
    utf8_carry: Vec<u8>,
    line_buffer: String,
    splitter: ThinkingSplitter,
    ended: bool,
    skipped_events: usize,
}

impl Default for StreamDecoder {
    fn default() -> Self {
        Self::new()
    }
}

impl StreamDecoder {
    pub fn new() -> Self {
        Self {
            utf8_carry: Vec::new(),
            line_buffer: String::new(),
            splitter: ThinkingSplitter::new(),
            ended: false,
            skipped_events: 0,
        }
    }

    pub fn feed(&mut self, bytes: &[u8]) -> Vec<Delta> {
        let text = self.decode_utf8(bytes, false);
        self.line_buffer.push_str(&text);

        let mut out = Vec::new();
        self.drain_complete_lines(&mut out);
        out
    }

    /// Flushes everything still buffered and returns the final deltas and result.
    pub fn finish(mut self) -> (Vec<Delta>, StreamResult) {
        let text = self.decode_utf8(&[], true);
        self.line_buffer.push_str(&text);

        let mut out = Vec::new();
        self.drain_complete_lines(&mut out);
        let last = std::mem::take(&mut self.line_buffer);
        self.handle_line(&last, &mut out);
        self.splitter.finish(&mut out);

        let result = StreamResult {
            answer: self.splitter.answer,
            thinking: self.splitter.thinking,
            ended: self.ended,
            skipped_events: self.skipped_events,
        };
        log::debug!(
            "Stream decoded: {} answer chars, thinking {}, {} skipped events",
            result.answer.len(),
            result.thinking.as_ref().map_or("absent".to_string(), |t| format!("{} chars", t.len())),
            result.skipped_events
        );
        (out, result)
    }

    #[cfg(test)]
    fn answer(&self) -> &str {
        &self.splitter.answer
    }

    #[cfg(test)]
    fn is_ended(&self) -> bool {
        self.ended
    }

    fn drain_complete_lines(&mut self, out: &mut Vec<Delta>) {
        while let Some(pos) = self.line_buffer.find('\n') {
            let line: String = self.line_buffer.drain(..=pos).collect();
            self.handle_line(&line, out);
        }
    }

    fn handle_line(&mut self, line: &str, out: &mut Vec<Delta>) {
        let Some(data) = line.trim().strip_prefix("data:") else {
            return;
        };
        let data = data.trim();

        if data.is_empty() || data == "[DONE]" {
            self.ended = true;
            return;
        }

        match parse_token(data) {
            Ok(Some(token)) => self.splitter.push(&token, out),
            Ok(None) => {}
            Err(e) => {
                self.skipped_events += 1;
                log::warn!("Failed to parse stream chunk: {} - Data: {}", e, data);
            }
        }
    }

    /// Decodes as much of the carried bytes as forms complete characters.
    /// Invalid sequences become U+FFFD; an incomplete tail waits for the next
    /// chunk unless this is the final flush.
    fn decode_utf8(&mut self, bytes: &[u8], last: bool) -> String {
        self.utf8_carry.extend_from_slice(bytes);

        let mut text = String::new();
        let mut rest: &[u8] = &self.utf8_carry;
        loop {
            match std::str::from_utf8(rest) {
                Ok(valid) => {
                    text.push_str(valid);
                    rest = &[];
                    break;
                }
                Err(e) => {
                    let (valid, after) = rest.split_at(e.valid_up_to());
                    text.push_str(&String::from_utf8_lossy(valid));
                    match e.error_len() {
                        Some(len) => {
                            text.push(char::REPLACEMENT_CHARACTER);
                            rest = &after[len..];
                        }
                        None if last => {
                            text.push(char::REPLACEMENT_CHARACTER);
                            rest = &[];
                            break;
                        }
                        None => {
                            rest = after;
                            break;
                        }
                    }
                }
            }
        }
        let consumed = self.utf8_carry.len() - rest.len();
        self.utf8_carry.drain(..consumed);
        text
    }
}
