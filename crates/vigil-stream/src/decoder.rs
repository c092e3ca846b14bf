use tracing::{debug, warn};

use crate::message::AgentMessage;

/// Hard ceiling on buffered bytes between record delimiters.
pub const MAX_BUFFER_BYTES: usize = 10 * 1024 * 1024;

/// One decoded unit from the stream.
#[derive(Debug, Clone, PartialEq)]
pub enum DecoderItem {
    /// A structured record.
    Message(AgentMessage),
    /// A complete line (or salvaged fragment) that is not a structured
    /// record; passed through so log-derived errors stay classifiable.
    Raw(String),
    /// The buffer exceeded [`MAX_BUFFER_BYTES`] and was discarded.
    /// Recoverable; decoding resumes with the next input.
    Overflow { discarded_bytes: usize },
}

/// Incremental decoder over the agent subprocess's combined output.
///
/// `feed` accepts arbitrarily split input and never fails: at each
/// newline the accumulated segment is offered to the record parser, and
/// on failure the newline is put back so a record whose string content
/// spans lines keeps accumulating. No brace or quote counting is done;
/// earlier attempts at that desynchronized on large nested payloads and
/// dropped records, which the completion protocol cannot tolerate.
#[derive(Debug, Default)]
pub struct StreamDecoder {
    buffer: Vec<u8>,
}

impl StreamDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Consumes a chunk of raw bytes, emitting any records completed by it.
    pub fn feed(&mut self, chunk: &[u8]) -> Vec<DecoderItem> {
        let mut items = Vec::new();
        for &byte in chunk {
            match byte {
                // Terminal line-wrap artifact, never structurally significant.
                b'\r' => {}
                b'\n' => self.on_newline(&mut items),
                _ => {
                    self.buffer.push(byte);
                    if self.buffer.len() > MAX_BUFFER_BYTES {
                        let discarded_bytes = self.buffer.len();
                        warn!(discarded_bytes, "decoder buffer ceiling exceeded, discarding");
                        self.buffer.clear();
                        items.push(DecoderItem::Overflow { discarded_bytes });
                    }
                }
            }
        }
        items
    }

    /// Drops any partially accumulated input, e.g. across a subprocess restart.
    pub fn reset(&mut self) {
        self.buffer.clear();
    }

    /// Salvages trailing content that never received a final delimiter.
    ///
    /// Scans for `{` and tries every subsequent `}` left-to-right until a
    /// record decodes, repeating until the buffer is exhausted. Brute
    /// force, but it runs at most once per task attempt, at subprocess
    /// exit.
    pub fn flush(&mut self) -> Vec<DecoderItem> {
        let mut items = Vec::new();
        let mut rest = std::mem::take(&mut self.buffer);
        loop {
            let Some(open) = rest.iter().position(|&b| b == b'{') else {
                push_raw(&mut items, &rest);
                break;
            };
            push_raw(&mut items, &rest[..open]);

            let mut decoded_end = None;
            for close in open..rest.len() {
                if rest[close] != b'}' {
                    continue;
                }
                if let Some(message) = decode_segment(&rest[open..=close]) {
                    items.push(DecoderItem::Message(message));
                    decoded_end = Some(close + 1);
                    break;
                }
            }
            match decoded_end {
                Some(end) => rest = rest.split_off(end),
                None => {
                    push_raw(&mut items, &rest[open..]);
                    break;
                }
            }
        }
        items
    }

    fn on_newline(&mut self, items: &mut Vec<DecoderItem>) {
        if self.buffer.iter().all(|b| b.is_ascii_whitespace()) {
            self.buffer.clear();
            return;
        }
        if let Some(message) = decode_segment(&self.buffer) {
            debug!(kind = message.kind(), "decoded record");
            self.buffer.clear();
            items.push(DecoderItem::Message(message));
            return;
        }
        if serde_json::from_slice::<serde_json::Value>(&self.buffer).is_ok() {
            // Complete JSON of an unknown or foreign shape: noise, not a
            // still-growing record.
            push_raw(items, &self.buffer);
            self.buffer.clear();
            return;
        }
        let starts_record = self
            .buffer
            .iter()
            .find(|b| !b.is_ascii_whitespace())
            .is_some_and(|&b| b == b'{');
        if starts_record {
            // Incomplete record; the newline sits inside it, so put it back.
            self.buffer.push(b'\n');
        } else {
            push_raw(items, &self.buffer);
            self.buffer.clear();
        }
    }
}

fn decode_segment(segment: &[u8]) -> Option<AgentMessage> {
    if let Ok(message) = serde_json::from_slice::<AgentMessage>(segment) {
        return Some(message);
    }
    // A wrap artifact can leave a bare LF inside a record; retry without
    // them before giving up on the segment.
    if segment.contains(&b'\n') {
        let unwrapped: Vec<u8> = segment
            .iter()
            .copied()
            .filter(|&b| b != b'\n')
            .collect();
        if let Ok(message) = serde_json::from_slice::<AgentMessage>(&unwrapped) {
            return Some(message);
        }
    }
    None
}

fn push_raw(items: &mut Vec<DecoderItem>, bytes: &[u8]) {
    let text = String::from_utf8_lossy(bytes);
    let trimmed = text.trim();
    if !trimmed.is_empty() {
        items.push(DecoderItem::Raw(trimmed.to_string()));
    }
}
