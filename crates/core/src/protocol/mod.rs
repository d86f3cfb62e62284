//! HTTP/1.x message codec.
//!
//! The engine speaks classic HTTP/1.0 and HTTP/1.1 framing over TCP and the
//! same header syntax over UDP for SSDP (HTTPU/HTTPMU):
//!
//! ```text
//! NOTIFY * HTTP/1.1\r\n
//! HOST: 239.255.255.250:1900\r\n
//! NT: upnp:rootdevice\r\n
//! NTS: ssdp:alive\r\n
//! \r\n
//! ```
//!
//! - [`message`]: [`WireMessage`] parse/serialize and body-framing resolution.
//! - [`headers`]: ordered, case-insensitive, multi-valued header collection.
//! - [`chunked`]: chunk-size line parsing and chunk encoding.
//! - [`escape`]: percent-encoding for request targets.

pub mod chunked;
pub mod escape;
pub mod headers;
pub mod message;

pub use headers::Headers;
pub use message::{Body, BodyFraming, BodyStream, StartLine, Version, WireMessage};

/// Header block terminator.
pub(crate) const HEADER_TERMINATOR: &[u8] = b"\r\n\r\n";

/// Returns the index just past the first `\r\n\r\n` in `bytes`, if any.
pub(crate) fn find_header_end(bytes: &[u8]) -> Option<usize> {
    bytes
        .windows(HEADER_TERMINATOR.len())
        .position(|w| w == HEADER_TERMINATOR)
        .map(|pos| pos + HEADER_TERMINATOR.len())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_end_found_after_terminator() {
        assert_eq!(find_header_end(b"GET / HTTP/1.1\r\n\r\nbody"), Some(18));
        assert_eq!(find_header_end(b"GET / HTTP/1.1\r\n\r"), None);
    }
}
