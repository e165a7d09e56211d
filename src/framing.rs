//! Line framing for text streams.
//!
//! Serial reads deliver arbitrary slices of the instrument's output: half a
//! line, three lines and a bit, or only the `\r` of a CRLF. [`ChunkDecoder`]
//! turns those byte chunks into text without splitting multi-byte characters,
//! and [`LineFramer`] reassembles the text into complete lines, carrying any
//! unterminated tail over to the next read.

use serde::{Deserialize, Serialize};
use tracing::warn;

/// Framing parameters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FramingConfig {
    /// Character that ends a line
    pub terminator: char,
    /// Optional character directly before the terminator that belongs to it
    /// (`'\r'` makes CRLF and LF equivalent)
    pub strip: Option<char>,
    /// Field separator inside a line
    pub separator: char,
    /// Longest unterminated line kept before it is dropped
    pub max_line_len: usize,
}

impl Default for FramingConfig {
    fn default() -> Self {
        Self {
            terminator: '\n',
            strip: Some('\r'),
            separator: ',',
            max_line_len: 65_536,
        }
    }
}

// =============================================================================
// Chunk decoding
// =============================================================================

/// Incremental UTF-8 decoder.
///
/// An incomplete multi-byte sequence at the end of a chunk is held back until
/// the next chunk completes it. Invalid bytes decode to U+FFFD.
#[derive(Debug, Default)]
pub struct ChunkDecoder {
    pending: Vec<u8>,
}

impl ChunkDecoder {
    /// Create an empty decoder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Decode one chunk.
    pub fn decode(&mut self, chunk: &[u8]) -> String {
        self.pending.extend_from_slice(chunk);

        let mut text = String::with_capacity(self.pending.len());
        let mut rest: &[u8] = &self.pending;

        loop {
            match std::str::from_utf8(rest) {
                Ok(valid) => {
                    text.push_str(valid);
                    rest = &[];
                    break;
                }
                Err(err) => {
                    let (valid, after) = rest.split_at(err.valid_up_to());
                    // valid_up_to guarantees this prefix is UTF-8
                    text.push_str(&String::from_utf8_lossy(valid));
                    match err.error_len() {
                        Some(bad) => {
                            text.push(char::REPLACEMENT_CHARACTER);
                            rest = &after[bad..];
                        }
                        None => {
                            // Truncated sequence; wait for more bytes
                            rest = after;
                            break;
                        }
                    }
                }
            }
        }

        self.pending = rest.to_vec();
        text
    }

    /// Bytes waiting for the rest of a character.
    pub fn pending(&self) -> usize {
        self.pending.len()
    }

    /// Remove and return the bytes of an incomplete trailing character.
    pub fn take_pending(&mut self) -> Vec<u8> {
        std::mem::take(&mut self.pending)
    }
}

// =============================================================================
// Line framer
// =============================================================================

/// Reassembles text fragments into complete lines.
#[derive(Debug)]
pub struct LineFramer {
    buffer: String,
    terminator: char,
    strip: Option<char>,
    max_line_len: usize,
    // Set after an overflow until the dropped line's terminator arrives
    discarding: bool,
}

impl Default for LineFramer {
    fn default() -> Self {
        Self::new(&FramingConfig::default())
    }
}

impl LineFramer {
    /// Create a framer with an empty buffer.
    pub fn new(config: &FramingConfig) -> Self {
        Self {
            buffer: String::new(),
            terminator: config.terminator,
            strip: config.strip,
            max_line_len: config.max_line_len.max(1),
            discarding: false,
        }
    }

    /// Append a fragment and return every line it completed, in order.
    ///
    /// Returned lines exclude the terminator. Text after the last terminator
    /// stays buffered for the next call.
    ///
    /// A line that outgrows `max_line_len` is dropped as a whole: everything
    /// up to and including its eventual terminator is skipped.
    pub fn feed(&mut self, fragment: &str) -> Vec<String> {
        let mut fragment = fragment;
        if self.discarding {
            match fragment.find(self.terminator) {
                Some(pos) => {
                    fragment = &fragment[pos + self.terminator.len_utf8()..];
                    self.discarding = false;
                }
                None => return Vec::new(),
            }
        }

        self.buffer.push_str(fragment);

        let mut lines = Vec::new();
        while let Some(pos) = self.buffer.find(self.terminator) {
            let mut line: String = self.buffer.drain(..pos + self.terminator.len_utf8()).collect();
            line.pop();
            if let Some(strip) = self.strip {
                if line.ends_with(strip) {
                    line.pop();
                }
            }
            lines.push(line);
        }

        if self.buffer.len() > self.max_line_len {
            warn!(
                dropped = self.buffer.len(),
                limit = self.max_line_len,
                "Unterminated line exceeded limit, dropping"
            );
            self.buffer.clear();
            self.discarding = true;
        }

        lines
    }

    /// Drop the buffered partial line, returning its length in bytes.
    pub fn discard(&mut self) -> usize {
        let dropped = self.buffer.len();
        self.buffer.clear();
        self.discarding = false;
        dropped
    }

    /// Remove and return the buffered partial line.
    pub fn take_buffered(&mut self) -> String {
        std::mem::take(&mut self.buffer)
    }

    /// Length of the buffered partial line in bytes.
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }
}
