//! Turning engine log chunks into clean, bounded text.

use crate::constants::TRUNCATION_MARKER;
use crate::engine::{LogChunk, LogSource};

const FRAME_HEADER_LEN: usize = 8;

/// Removes engine log-multiplexing headers from a raw byte stream.
///
/// A frame is `[stream, 0, 0, 0, len_be32..]` followed by `len` payload bytes with
/// `stream` in `0..=2`. Bytes that do not parse as a frame are kept as-is.
pub fn strip_framing(raw: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(raw.len());
    let mut rest = raw;

    while rest.len() >= FRAME_HEADER_LEN && is_frame_header(rest) {
        let len = u32::from_be_bytes([rest[4], rest[5], rest[6], rest[7]]) as usize;
        let body = &rest[FRAME_HEADER_LEN..];
        if len > body.len() {
            break;
        }
        out.extend_from_slice(&body[..len]);
        rest = &body[len..];
    }

    out.extend_from_slice(rest);
    out
}

fn is_frame_header(bytes: &[u8]) -> bool {
    bytes[0] <= 2 && bytes[1] == 0 && bytes[2] == 0 && bytes[3] == 0
}

/// Drops ANSI escape sequences and control characters other than `\n` and `\t`.
/// `\r\n` becomes `\n`.
pub fn sanitize(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut chars = text.chars().peekable();

    while let Some(c) = chars.next() {
        match c {
            '\n' | '\t' => out.push(c),
            '\r' => {
                if chars.peek() != Some(&'\n') {
                    out.push('\n');
                }
            }
            '\u{1b}' => {
                // CSI: ESC [ params... final byte in @..~
                if chars.peek() == Some(&'[') {
                    chars.next();
                    for n in chars.by_ref() {
                        if ('@'..='~').contains(&n) {
                            break;
                        }
                    }
                }
            }
            c if c.is_control() => {}
            c => out.push(c),
        }
    }

    out
}

/// Cuts `text` to at most `max_bytes` on a char boundary, marking the cut with `...`
/// when the budget leaves room for it.
pub fn truncate_text(text: &str, max_bytes: usize) -> String {
    const ELLIPSIS: &str = "...";
    if text.len() <= max_bytes {
        return text.to_string();
    }
    match max_bytes.checked_sub(ELLIPSIS.len()) {
        Some(budget) => format!("{}{ELLIPSIS}", &text[..char_floor(text, budget)]),
        None => text[..char_floor(text, max_bytes)].to_string(),
    }
}

fn char_floor(text: &str, mut index: usize) -> usize {
    while !text.is_char_boundary(index) {
        index -= 1;
    }
    index
}

/// Accumulates combined stdout/stderr in arrival order, up to a byte cap.
#[derive(Debug)]
pub struct OutputBuffer {
    text: String,
    cap: usize,
    truncated: bool,
    pending: Vec<u8>,
    pending_source: Option<LogSource>,
}

impl OutputBuffer {
    pub fn new(cap: usize) -> Self {
        Self {
            text: String::new(),
            cap,
            truncated: false,
            pending: Vec::new(),
            pending_source: None,
        }
    }

    pub fn push(&mut self, chunk: &LogChunk) {
        if self.truncated {
            return;
        }

        if self.pending_source.is_some() && self.pending_source != Some(chunk.source) {
            self.flush_pending();
        }

        let bytes = match chunk.source {
            LogSource::Console => strip_framing(&chunk.bytes),
            LogSource::Stdout | LogSource::Stderr => chunk.bytes.to_vec(),
        };
        self.pending.extend_from_slice(&bytes);
        self.pending_source = Some(chunk.source);

        // Keep an incomplete UTF-8 sequence at the end for the next chunk.
        let valid = match std::str::from_utf8(&self.pending) {
            Ok(_) => self.pending.len(),
            Err(e) if e.error_len().is_none() => e.valid_up_to(),
            Err(_) => self.pending.len(),
        };
        let tail = self.pending.split_off(valid);
        let head = std::mem::replace(&mut self.pending, tail);
        self.append(&String::from_utf8_lossy(&head));
    }

    pub fn len(&self) -> usize {
        self.text.len()
    }

    pub fn is_empty(&self) -> bool {
        self.text.is_empty() && self.pending.is_empty()
    }

    pub fn is_truncated(&self) -> bool {
        self.truncated
    }

    pub fn into_string(mut self) -> String {
        self.flush_pending();
        if self.truncated {
            self.text.push_str(TRUNCATION_MARKER);
        }
        self.text
    }

    fn flush_pending(&mut self) {
        if !self.pending.is_empty() {
            let bytes = std::mem::take(&mut self.pending);
            self.append(&String::from_utf8_lossy(&bytes));
        }
        self.pending_source = None;
    }

    fn append(&mut self, raw: &str) {
        if self.truncated {
            return;
        }
        let clean = sanitize(raw);
        let room = self.cap.saturating_sub(self.text.len());
        if clean.len() <= room {
            self.text.push_str(&clean);
            return;
        }

        let mut end = room;
        while !clean.is_char_boundary(end) {
            end -= 1;
        }
        self.text.push_str(&clean[..end]);
        self.truncated = true;
        self.pending.clear();
    }
}
