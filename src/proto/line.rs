//! Line framing and verb matching.
//!
//! Lines are CR, LF, or CRLF terminated; payload is capped at
//! [`crate::proto::schema::PROTO_MAX_LINE_PAYLOAD`] bytes. Bytes received
//! past the limit within the same logical line are dropped; a single
//! `line_too_long` error is reported once the terminator finally arrives.

use crate::proto::schema::PROTO_MAX_LINE_PAYLOAD;
use heapless::Vec;

/// Outcome of feeding bytes to a [`LineAssembler`].
pub enum Feed {
    /// No complete line yet.
    Pending,
    /// A complete line is ready, payload excludes the terminator.
    Line,
    /// A line terminated but exceeded the payload limit; its (truncated)
    /// content was discarded.
    TooLong,
}

/// Accumulates bytes into CRLF/CR/LF-terminated lines.
pub struct LineAssembler {
    buf: Vec<u8, PROTO_MAX_LINE_PAYLOAD>,
    overflowed: bool,
}

impl Default for LineAssembler {
    fn default() -> Self {
        Self::new()
    }
}

impl LineAssembler {
    pub const fn new() -> Self {
        Self {
            buf: Vec::new(),
            overflowed: false,
        }
    }

    /// Feed one byte. Returns the line's status once a terminator is seen;
    /// otherwise `Feed::Pending`. Call [`Self::line`] to retrieve the
    /// payload after a `Feed::Line` result.
    pub fn push(&mut self, byte: u8) -> Feed {
        if byte == b'\r' || byte == b'\n' {
            if self.buf.is_empty() && !self.overflowed {
                // Bare terminator with nothing buffered: CRLF's second
                // byte, or a stray LF/CR. Not a line boundary event.
                return Feed::Pending;
            }
            let result = if self.overflowed {
                Feed::TooLong
            } else {
                Feed::Line
            };
            self.overflowed = false;
            result
        } else {
            if self.buf.push(byte).is_err() {
                self.overflowed = true;
            }
            Feed::Pending
        }
    }

    /// The assembled line payload (valid immediately after a `Feed::Line`).
    /// Clears the buffer for the next line.
    pub fn take_line(&mut self) -> heapless::Vec<u8, PROTO_MAX_LINE_PAYLOAD> {
        core::mem::take(&mut self.buf)
    }
}

/// `cmd_exact`: verb identity is an exact byte match followed by
/// end-of-line, `,`, or space (never an arbitrary separator). Returns the
/// remainder of the line after the verb (and, if present, the separator)
/// on match.
pub fn cmd_exact<'a>(line: &'a [u8], verb: &str) -> Option<&'a [u8]> {
    let verb = verb.as_bytes();
    if line.len() < verb.len() || &line[..verb.len()] != verb {
        return None;
    }
    match line.get(verb.len()) {
        None => Some(&line[verb.len()..]),
        Some(b',') | Some(b' ') => Some(&line[verb.len() + 1..]),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn feed_all(bytes: &[u8]) -> heapless::Vec<heapless::Vec<u8, PROTO_MAX_LINE_PAYLOAD>, 8> {
        let mut a = LineAssembler::new();
        let mut out = heapless::Vec::new();
        for &b in bytes {
            match a.push(b) {
                Feed::Line => out.push(a.take_line()).ok().unwrap(),
                Feed::TooLong => {
                    out.push(heapless::Vec::new()).ok().unwrap();
                }
                Feed::Pending => {}
            }
        }
        out
    }

    #[test]
    fn crlf_delimits() {
        let lines = feed_all(b"HELLO\r\n");
        assert_eq!(lines.len(), 1);
        assert_eq!(lines[0].as_slice(), b"HELLO");
    }

    #[test]
    fn bare_cr_delimits() {
        let lines = feed_all(b"HELLO\r");
        assert_eq!(lines.len(), 1);
        assert_eq!(lines[0].as_slice(), b"HELLO");
    }

    #[test]
    fn bare_lf_delimits() {
        let lines = feed_all(b"HELLO\n");
        assert_eq!(lines.len(), 1);
        assert_eq!(lines[0].as_slice(), b"HELLO");
    }

    #[test]
    fn too_long_line_reported_once() {
        let mut data: heapless::Vec<u8, 512> = heapless::Vec::new();
        for _ in 0..300 {
            data.push(b'A').ok().unwrap();
        }
        data.extend_from_slice(b"\r\n").ok().unwrap();
        let mut a = LineAssembler::new();
        let mut too_long_count = 0;
        for &b in data.iter() {
            if let Feed::TooLong = a.push(b) {
                too_long_count += 1;
            }
        }
        assert_eq!(too_long_count, 1);
    }

    #[test]
    fn cmd_exact_requires_boundary() {
        assert!(cmd_exact(b"HELLO", "HELLO").is_some());
        assert!(cmd_exact(b"HELLO,fw=1", "HELLO").is_some());
        assert!(cmd_exact(b"HELLOX", "HELLO").is_none());
        assert_eq!(cmd_exact(b"HELLO,fw=1", "HELLO").unwrap(), b"fw=1");
    }
}
