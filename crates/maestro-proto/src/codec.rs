//! Line-delimited JSON codec for the stdio transport.
//!
//! The codec turns an arbitrary byte stream into discrete JSON records.
//! Malformed lines never disappear and never crash the reader: they are
//! delivered as `__PARSE_ERROR__` sentinel objects so the server can report
//! them through the normal protocol channel. A buffered line that exceeds
//! the configured cap is consumed and surfaced as `__LINE_TOO_LONG__`
//! instead of growing the buffer without bound.

use crate::message::{LINE_TOO_LONG_TYPE, PARSE_ERROR_TYPE};
use serde_json::{json, Value};

/// Default cap on a single buffered line (1 MiB).
pub const DEFAULT_MAX_LINE_BYTES: usize = 1024 * 1024;

/// Incremental decoder for newline-delimited JSON.
#[derive(Debug)]
pub struct LineCodec {
    buf: Vec<u8>,
    max_line_bytes: usize,
    /// Bytes already discarded from the oversized line in progress.
    overflow: usize,
}

impl Default for LineCodec {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_LINE_BYTES)
    }
}

impl LineCodec {
    /// Creates a codec with the given line cap in bytes.
    pub fn new(max_line_bytes: usize) -> Self {
        Self {
            buf: Vec::new(),
            max_line_bytes,
            overflow: 0,
        }
    }

    /// Feeds a chunk of raw bytes, invoking `on_line` for each complete line.
    ///
    /// Each non-empty complete line is parsed as JSON and delivered as-is,
    /// or as `{"type":"__PARSE_ERROR__","raw":<line>}` on parse failure.
    /// Partial trailing data without a newline is retained for the next call.
    pub fn feed(&mut self, chunk: &[u8], mut on_line: impl FnMut(Value)) {
        self.buf.extend_from_slice(chunk);

        while let Some(pos) = self.buf.iter().position(|&b| b == b'\n') {
            let line: Vec<u8> = self.buf.drain(..=pos).collect();
            let line = &line[..line.len() - 1];

            if self.overflow > 0 {
                // Terminator of a line that already blew the cap.
                let total = self.overflow + line.len();
                self.overflow = 0;
                on_line(json!({ "type": LINE_TOO_LONG_TYPE, "length": total }));
                continue;
            }

            let text = String::from_utf8_lossy(line);
            let trimmed = text.trim();
            if trimmed.is_empty() {
                continue;
            }

            match serde_json::from_str::<Value>(trimmed) {
                Ok(value) => on_line(value),
                Err(_) => on_line(json!({ "type": PARSE_ERROR_TYPE, "raw": trimmed })),
            }
        }

        if self.buf.len() > self.max_line_bytes {
            self.overflow += self.buf.len();
            self.buf.clear();
        }
    }

    /// Serializes a value as one JSON line terminated by `\n`.
    pub fn encode(value: &Value) -> String {
        format!("{value}\n")
    }

    /// Bytes currently buffered awaiting a newline.
    pub fn buffered(&self) -> usize {
        self.buf.len()
    }
}
