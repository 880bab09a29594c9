//! Line echo wire protocol.
//!
//! ```text
//! Request:  <bytes without \n>[\r]\n
//! Response: # echo> <bytes without \n>\n
//!
//! Example:
//! Request:  hello\r\n
//! Response: # echo> hello\n
//! ```
//!
//! There is no length prefix. Input that accumulates more than the
//! configured maximum without a newline is rejected.

use bytes::BytesMut;

/// Byte that terminates every message.
pub const DELIMITER: u8 = b'\n';

/// Prefix prepended to every reply.
pub const REPLY_TAG: &[u8] = b"# echo> ";

/// One framed line found at the front of a buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Line {
    /// Length of the line content, delimiter and trailing `\r` excluded.
    pub len: usize,
    /// Bytes to drain from the buffer, delimiter included.
    pub consumed: usize,
}

/// Parse result.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParseResult {
    /// A complete line is available.
    Complete(Line),
    /// No delimiter yet; keep reading.
    Incomplete,
    /// More than `max_line` bytes buffered without a delimiter.
    TooLong,
}

/// Find the first line in `input`.
///
/// Only the first `max_line + 1` bytes are searched, so a line whose content
/// (including an optional `\r`) exceeds `max_line` is never returned.
pub fn parse(input: &[u8], max_line: usize) -> ParseResult {
    let window = &input[..input.len().min(max_line.saturating_add(1))];

    match window.iter().position(|&b| b == DELIMITER) {
        Some(pos) => {
            let len = if pos > 0 && input[pos - 1] == b'\r' {
                pos - 1
            } else {
                pos
            };
            ParseResult::Complete(Line {
                len,
                consumed: pos + 1,
            })
        }
        None if input.len() > max_line => ParseResult::TooLong,
        None => ParseResult::Incomplete,
    }
}

/// Append the reply for `line` to `output`.
pub fn encode_reply(line: &[u8], output: &mut BytesMut) {
    output.reserve(REPLY_TAG.len() + line.len() + 1);
    output.extend_from_slice(REPLY_TAG);
    output.extend_from_slice(line);
    output.extend_from_slice(&[DELIMITER]);
}

/// Strip a trailing `\n` and then a trailing `\r`.
pub fn trim_line_ending(mut line: &[u8]) -> &[u8] {
    if let [rest @ .., b'\n'] = line {
        line = rest;
    }
    if let [rest @ .., b'\r'] = line {
        line = rest;
    }
    line
}
