//! Codec helpers for the line-oriented ingest protocol.
//!
//! Clients send one token per line. A token is either a 9-digit record,
//! the shutdown keyword, or a protocol violation. Bytes are accumulated by
//! [`LineDecoder`] until the line terminator is seen; a backspace byte
//! removes the previously buffered byte so that simple interactive clients
//! (telnet, nc) can edit a line before sending it.

use bytes::BytesMut;

use crate::error::{Result, TallyError};

/// Number of digits in a record token.
pub const RECORD_DIGITS: usize = 9;

/// Token that requests a process-wide shutdown.
pub const TERMINATE_KEYWORD: &str = "terminate";

/// Platform line terminator used for framing and for the output artifact.
#[cfg(windows)]
pub const LINE_TERMINATOR: &str = "\r\n";
/// Platform line terminator used for framing and for the output artifact.
#[cfg(not(windows))]
pub const LINE_TERMINATOR: &str = "\n";

/// Backspace control byte.
pub const BACKSPACE: u8 = 0x08;

/// Longest line accepted before the terminator is seen.
pub const MAX_LINE_BYTES: usize = 1024;

/// Strip the leading zeros of an all-digit token.
///
/// `"002"` becomes `"2"` and `"000000000"` becomes `"0"`.
///
/// # Errors
/// Returns [`TallyError::InvalidFormat`] if the token is empty or contains
/// anything other than ASCII digits.
pub fn strip_leading_zeros(token: &str) -> Result<String> {
    if token.is_empty() || !token.bytes().all(|b| b.is_ascii_digit()) {
        return Err(TallyError::InvalidFormat(format!(
            "cannot strip leading zeros from non-numeric input {token:?}"
        )));
    }

    let stripped = token.trim_start_matches('0');
    if stripped.is_empty() {
        Ok("0".to_string())
    } else {
        Ok(stripped.to_string())
    }
}

/// Remove control characters and escaped quote/backslash sequences.
///
/// Strips tab, backspace, newline, carriage return and form-feed, then the
/// two-character sequences `\'`, `\"` and `\\`. Digits are never altered.
#[must_use]
pub fn sanitize(input: &str) -> String {
    input
        .replace(['\t', '\u{8}', '\n', '\r', '\u{c}'], "")
        .replace("\\'", "")
        .replace("\\\"", "")
        .replace("\\\\", "")
}

/// Whether a sanitized token is a well-formed record.
///
/// A record is exactly [`RECORD_DIGITS`] ASCII digits. Every such token has
/// a value in `[0, 10^9)`, so no further range check is needed.
#[must_use]
pub fn is_valid_record(token: &str) -> bool {
    token.len() == RECORD_DIGITS && token.bytes().all(|b| b.is_ascii_digit())
}

/// Incremental line accumulator for a single connection.
///
/// Feed bytes one at a time with [`LineDecoder::decode`]; a sanitized token
/// is returned whenever the buffer ends with [`LINE_TERMINATOR`].
#[derive(Debug)]
pub struct LineDecoder {
    buf: BytesMut,
    max_line: usize,
}

impl Default for LineDecoder {
    fn default() -> Self {
        Self::new()
    }
}

impl LineDecoder {
    /// Create a decoder with the default line ceiling.
    #[must_use]
    pub fn new() -> Self {
        Self::with_max_line(MAX_LINE_BYTES)
    }

    /// Create a decoder that rejects lines longer than `max_line` bytes.
    #[must_use]
    pub fn with_max_line(max_line: usize) -> Self {
        Self {
            buf: BytesMut::with_capacity(RECORD_DIGITS + LINE_TERMINATOR.len()),
            max_line,
        }
    }

    /// Feed one byte.
    ///
    /// Returns `Ok(Some(token))` when a line is complete, `Ok(None)` while the
    /// line is still being accumulated.
    ///
    /// # Errors
    /// Returns [`TallyError::InvalidFormat`] if the pending line grows past
    /// the configured ceiling without a terminator.
    pub fn decode(&mut self, byte: u8) -> Result<Option<String>> {
        if byte == BACKSPACE {
            let len = self.buf.len();
            if len > 0 {
                self.buf.truncate(len - 1);
            }
            return Ok(None);
        }

        self.buf.extend_from_slice(&[byte]);

        if self.buf.ends_with(LINE_TERMINATOR.as_bytes()) {
            let line = self.buf.split().freeze();
            return Ok(Some(sanitize(&String::from_utf8_lossy(&line))));
        }

        if self.buf.len() > self.max_line {
            let pending = self.buf.len();
            self.buf.clear();
            return Err(TallyError::InvalidFormat(format!(
                "line exceeds {} bytes without a terminator ({pending} buffered)",
                self.max_line
            )));
        }

        Ok(None)
    }

    /// Number of bytes buffered for the current line.
    #[must_use]
    pub fn pending(&self) -> usize {
        self.buf.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decode_all(decoder: &mut LineDecoder, input: &[u8]) -> Vec<String> {
        input
            .iter()
            .filter_map(|&b| decoder.decode(b).unwrap())
            .collect()
    }

    #[test]
    fn test_strip_leading_zeros_any_number() {
        assert_eq!(strip_leading_zeros("002").unwrap(), "2");
        assert_eq!(strip_leading_zeros("120").unwrap(), "120");
    }

    #[test]
    fn test_strip_leading_zeros_zero() {
        assert_eq!(strip_leading_zeros("000000000").unwrap(), "0");
        assert_eq!(strip_leading_zeros("0000000").unwrap(), "0");
    }

    #[test]
    fn test_strip_leading_zeros_rejects_non_digits() {
        let err = strip_leading_zeros("abc").unwrap_err();
        assert!(err.is_invalid_format());
        assert!(strip_leading_zeros("").is_err());
        assert!(strip_leading_zeros("12a").is_err());
    }

    #[test]
    fn test_sanitize_control_characters() {
        assert_eq!(sanitize("\t012\r345\u{c}678\n"), "012345678");
        assert_eq!(sanitize("\\'12\\\"34\\\\5"), "12345");
    }

    #[test]
    fn test_sanitize_keeps_digits() {
        assert_eq!(sanitize("000000001"), "000000001");
    }

    #[test]
    fn test_is_valid_record() {
        assert!(is_valid_record("000000000"));
        assert!(is_valid_record("999999999"));
        assert!(!is_valid_record("12345678"));
        assert!(!is_valid_record("1234567890"));
        assert!(!is_valid_record("12345678a"));
        assert!(!is_valid_record("test"));
        assert!(!is_valid_record("-12345678"));
    }

    #[test]
    fn test_decoder_splits_lines() {
        let mut decoder = LineDecoder::new();
        let input = format!("000000001{LINE_TERMINATOR}terminate{LINE_TERMINATOR}");
        let lines = decode_all(&mut decoder, input.as_bytes());
        assert_eq!(lines, vec!["000000001", "terminate"]);
        assert_eq!(decoder.pending(), 0);
    }

    #[test]
    fn test_decoder_holds_partial_line() {
        let mut decoder = LineDecoder::new();
        assert!(decode_all(&mut decoder, b"0000").is_empty());
        assert_eq!(decoder.pending(), 4);

        let rest = format!("00042{LINE_TERMINATOR}");
        let lines = decode_all(&mut decoder, rest.as_bytes());
        assert_eq!(lines, vec!["000000042"]);
    }

    #[test]
    fn test_decoder_backspace_removes_previous_byte() {
        let mut decoder = LineDecoder::new();
        let input = format!("0000000019\u{8}{LINE_TERMINATOR}");
        let lines = decode_all(&mut decoder, input.as_bytes());
        assert_eq!(lines, vec!["000000001"]);
    }

    #[test]
    fn test_decoder_backspace_on_empty_buffer() {
        let mut decoder = LineDecoder::new();
        assert!(decoder.decode(BACKSPACE).unwrap().is_none());
        assert_eq!(decoder.pending(), 0);
    }

    #[test]
    fn test_decoder_strips_carriage_return() {
        let mut decoder = LineDecoder::new();
        let lines = decode_all(&mut decoder, b"123456789\r\n");
        assert_eq!(lines, vec!["123456789"]);
    }

    #[test]
    fn test_decoder_line_ceiling() {
        let mut decoder = LineDecoder::with_max_line(16);
        let mut result = Ok(None);
        for &b in [b'1'; 17].iter() {
            result = decoder.decode(b);
            if result.is_err() {
                break;
            }
        }
        assert!(matches!(result, Err(TallyError::InvalidFormat(_))));
        assert_eq!(decoder.pending(), 0);
    }
}
