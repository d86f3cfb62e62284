//! Chunked transfer coding.
//!
//! ```text
//! 5\r\n
//! hello\r\n
//! 0\r\n
//! \r\n
//! ```

/// Terminating zero-length chunk with an empty trailer section.
pub const LAST_CHUNK: &[u8] = b"0\r\n\r\n";

/// Wrap `data` as one chunk: `hex-length CRLF data CRLF`.
///
/// Empty input yields an empty vector; a zero-length chunk would end the body.
pub fn encode_chunk(data: &[u8]) -> Vec<u8> {
    if data.is_empty() {
        return Vec::new();
    }
    let mut out = format!("{:X}\r\n", data.len()).into_bytes();
    out.extend_from_slice(data);
    out.extend_from_slice(b"\r\n");
    out
}

/// Parse a chunk-size line without its line break. Extensions after `;` are
/// ignored. Returns `None` for empty, non-hex or overflowing sizes.
pub fn parse_chunk_size(line: &[u8]) -> Option<usize> {
    let text = std::str::from_utf8(line).ok()?;
    let digits = text.split(';').next()?.trim();
    if digits.is_empty() {
        return None;
    }
    usize::from_str_radix(digits, 16).ok()
}
