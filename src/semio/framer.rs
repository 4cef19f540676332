//! Incremental CR/LF line framer for the SEM monitor UART stream.
//!
//! The monitor terminates its output with `\r`, `\n` or `\r\n` depending on the
//! firmware build. This framer can be fed arbitrary chunks and yields whole
//! lines when available. A paired CRLF (or LFCR) counts as one terminator and
//! blank lines are skipped.
use bytes::{Buf, BytesMut};

/// Upper bound on an unterminated line before the buffer is discarded.
const MAX_LINE_LEN: usize = 4 * 1024;

/// One framed line. `dropped` counts non-ASCII bytes removed while decoding.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FramedLine {
    pub text: String,
    pub dropped: usize,
}

pub struct LineFramer {
    buf: BytesMut,
}

impl Default for LineFramer {
    fn default() -> Self {
        Self::new()
    }
}

impl LineFramer {
    pub fn new() -> Self {
        Self {
            buf: BytesMut::with_capacity(1024),
        }
    }

    pub fn push(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
        if self.buf.len() > MAX_LINE_LEN && !self.buf.iter().any(|b| is_term(*b)) {
            // Runaway garbage without a terminator; start over.
            log::info!(
                "line framer overflow: discarding {} bytes starting '{}'",
                self.buf.len(),
                crate::logutil::escape_bytes(&self.buf[..self.buf.len().min(32)])
            );
            self.buf.clear();
        }
    }

    /// Number of buffered bytes not yet framed.
    pub fn pending(&self) -> usize {
        self.buf.len()
    }

    /// Extract the next complete, non-blank line if one is buffered.
    pub fn next_line(&mut self) -> Option<FramedLine> {
        loop {
            let cut = self.buf.iter().position(|b| is_term(*b))?;
            let raw = self.buf.split_to(cut);
            // Drop the terminator and its pair, if the pair is already here.
            let first = self.buf[0];
            self.buf.advance(1);
            if let Some(&second) = self.buf.first() {
                if is_term(second) && second != first {
                    self.buf.advance(1);
                }
            }
            let line = decode_ascii(&raw);
            if line.text.trim().is_empty() {
                continue;
            }
            return Some(line);
        }
    }
}

fn is_term(b: u8) -> bool {
    b == b'\r' || b == b'\n'
}

fn decode_ascii(raw: &[u8]) -> FramedLine {
    let mut text = String::with_capacity(raw.len());
    let mut dropped = 0;
    for &b in raw {
        if b.is_ascii() && (b == b'\t' || !b.is_ascii_control()) {
            text.push(b as char);
        } else {
            dropped += 1;
        }
    }
    FramedLine { text, dropped }
}
