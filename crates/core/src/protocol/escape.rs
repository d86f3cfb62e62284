//! Percent-encoding for request targets.
//!
//! Alphanumerics and the characters in [`SAFE`] pass through unchanged so
//! that path and query structure survive; everything else, including `%`
//! itself, spaces, control bytes and non-ASCII, becomes `%XX`.

use crate::error::{ParseErrorKind, Result, UpnpError};

/// Punctuation left unescaped in request targets.
pub const SAFE: &[u8] = b"-_.!~*'()/:;@&=+$,?";

pub fn escape(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    for &b in input.as_bytes() {
        if b.is_ascii_alphanumeric() || SAFE.contains(&b) {
            out.push(b as char);
        } else {
            out.push_str(&format!("%{b:02X}"));
        }
    }
    out
}

/// Decode `%XX` sequences. Truncated or non-hex escapes, and decoded bytes
/// that are not UTF-8, are [`ParseErrorKind::InvalidEscape`].
pub fn unescape(input: &str) -> Result<String> {
    let bytes = input.as_bytes();
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' {
            let valid = bytes
                .get(i + 1..i + 3)
                .is_some_and(|pair| pair.iter().all(u8::is_ascii_hexdigit));
            if !valid {
                return Err(UpnpError::parse(ParseErrorKind::InvalidEscape));
            }
            i += 3;
        } else {
            i += 1;
        }
    }
    urlencoding::decode(input)
        .map(|s| s.into_owned())
        .map_err(|_| UpnpError::parse(ParseErrorKind::InvalidEscape))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keeps_path_structure() {
        assert_eq!(escape("/media/list?id=3&x=y"), "/media/list?id=3&x=y");
    }

    #[test]
    fn escapes_unsafe_bytes() {
        assert_eq!(escape("/my song#1.mp3"), "/my%20song%231.mp3");
        assert_eq!(escape("100%"), "100%25");
        assert_eq!(escape("é"), "%C3%A9");
    }

    #[test]
    fn unescape_reverses_escape() {
        let original = "/Music/Café del Mar/01 <intro>.flac";
        assert_eq!(unescape(&escape(original)).unwrap(), original);
    }

    #[test]
    fn unescape_rejects_bad_sequences() {
        assert!(unescape("%4").is_err());
        assert!(unescape("%zz").is_err());
        assert!(unescape("%FF").is_err());
        assert_eq!(unescape("plain").unwrap(), "plain");
    }
}
