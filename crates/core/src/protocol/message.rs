use std::fmt;
use std::io::Read;

use super::headers::Headers;
use super::find_header_end;
use crate::error::{ParseErrorKind, Result, UpnpError};

/// HTTP protocol version.
///
/// Ordered so that `version >= Version::HTTP_11` reads naturally.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Version {
    pub major: u8,
    pub minor: u8,
}

impl Version {
    pub const HTTP_09: Version = Version { major: 0, minor: 9 };
    pub const HTTP_10: Version = Version { major: 1, minor: 0 };
    pub const HTTP_11: Version = Version { major: 1, minor: 1 };

    /// Parse an `HTTP/<major>.<minor>` token.
    pub fn parse(token: &str) -> Option<Self> {
        let rest = token.strip_prefix("HTTP/")?;
        let (major, minor) = rest.split_once('.')?;
        Some(Version {
            major: major.parse().ok()?,
            minor: minor.parse().ok()?,
        })
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "HTTP/{}.{}", self.major, self.minor)
    }
}

/// First line of a message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StartLine {
    /// `Method SP Target SP Version`
    Request {
        method: String,
        target: String,
        version: Version,
    },
    /// `Version SP Status SP Reason`
    Response {
        version: Version,
        status: u16,
        reason: String,
    },
}

/// How the length of a message body is determined.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BodyFraming {
    /// `Transfer-Encoding: chunked`.
    Chunked,
    /// `Content-Length: N`.
    Length(usize),
    /// Neither header is usable; connection semantics decide.
    Undetermined,
}

/// An externally supplied body source, written out in chunked framing.
pub struct BodyStream(pub Box<dyn Read + Send>);

impl fmt::Debug for BodyStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("BodyStream(..)")
    }
}

/// Message payload.
#[derive(Debug)]
pub enum Body {
    Bytes(Vec<u8>),
    Stream(BodyStream),
}

impl Default for Body {
    fn default() -> Self {
        Body::Bytes(Vec::new())
    }
}

/// One HTTP header block plus body.
///
/// Build with [`request`](Self::request) or [`response`](Self::response),
/// chain [`with_header`](Self::with_header) and [`with_body`](Self::with_body),
/// then call [`to_bytes`](Self::to_bytes). `Content-Length` is added during
/// serialization unless the message already carries framing headers or
/// [`without_content_length`](Self::without_content_length) was requested.
#[derive(Debug)]
#[must_use]
pub struct WireMessage {
    pub start: StartLine,
    pub headers: Headers,
    pub body: Body,
    auto_content_length: bool,
}

impl WireMessage {
    pub fn request(method: &str, target: &str) -> Self {
        Self::from_start(StartLine::Request {
            method: method.to_string(),
            target: target.to_string(),
            version: Version::HTTP_11,
        })
    }

    pub fn response(status: u16, reason: &str) -> Self {
        Self::from_start(StartLine::Response {
            version: Version::HTTP_11,
            status,
            reason: reason.to_string(),
        })
    }

    fn from_start(start: StartLine) -> Self {
        WireMessage {
            start,
            headers: Headers::new(),
            body: Body::default(),
            auto_content_length: true,
        }
    }

    pub fn with_version(mut self, version: Version) -> Self {
        self.set_version(version);
        self
    }

    pub fn with_header(mut self, name: &str, value: &str) -> Self {
        self.headers.add(name, value);
        self
    }

    pub fn with_body(mut self, body: impl Into<Vec<u8>>) -> Self {
        self.body = Body::Bytes(body.into());
        self
    }

    pub fn with_stream(mut self, reader: impl Read + Send + 'static) -> Self {
        self.body = Body::Stream(BodyStream(Box::new(reader)));
        self
    }

    /// Leave `Content-Length` out of the serialized head; the caller frames
    /// the body itself (chunked or close-delimited).
    pub fn without_content_length(mut self) -> Self {
        self.auto_content_length = false;
        self
    }

    pub fn version(&self) -> Version {
        match &self.start {
            StartLine::Request { version, .. } | StartLine::Response { version, .. } => *version,
        }
    }

    pub fn set_version(&mut self, v: Version) {
        match &mut self.start {
            StartLine::Request { version, .. } | StartLine::Response { version, .. } => {
                *version = v
            }
        }
    }

    pub fn is_request(&self) -> bool {
        matches!(self.start, StartLine::Request { .. })
    }

    pub fn method(&self) -> Option<&str> {
        match &self.start {
            StartLine::Request { method, .. } => Some(method),
            StartLine::Response { .. } => None,
        }
    }

    pub fn target(&self) -> Option<&str> {
        match &self.start {
            StartLine::Request { target, .. } => Some(target),
            StartLine::Response { .. } => None,
        }
    }

    pub fn status(&self) -> Option<u16> {
        match &self.start {
            StartLine::Response { status, .. } => Some(*status),
            StartLine::Request { .. } => None,
        }
    }

    /// 1xx responses, which never reach the consumer.
    pub fn is_informational(&self) -> bool {
        matches!(self.status(), Some(100..=199))
    }

    /// 1xx, 204 and 304 responses, which never carry a body or its length.
    pub fn is_bodiless_status(&self) -> bool {
        matches!(self.status(), Some(100..=199 | 204 | 304))
    }

    /// Body bytes, or an empty slice for streamed bodies.
    pub fn body_bytes(&self) -> &[u8] {
        match &self.body {
            Body::Bytes(b) => b,
            Body::Stream(_) => &[],
        }
    }

    /// Whether the peer asked for the connection to end after this exchange.
    pub fn wants_close(&self) -> bool {
        let version = self.version();
        if self.headers.has_token("Connection", "close") {
            return true;
        }
        if version < Version::HTTP_11 {
            return !self.headers.has_token("Connection", "keep-alive");
        }
        false
    }

    /// Resolve body framing: chunked wins over an explicit length; an
    /// unparsable `Content-Length` leaves framing undetermined.
    pub fn body_framing(&self) -> BodyFraming {
        let chunked = self
            .headers
            .get_all("Transfer-Encoding")
            .iter()
            .flat_map(|v| v.split(','))
            .last()
            .is_some_and(|coding| coding.trim().eq_ignore_ascii_case("chunked"));
        if chunked {
            return BodyFraming::Chunked;
        }
        match self
            .headers
            .get("Content-Length")
            .map(|v| v.trim().parse::<usize>())
        {
            Some(Ok(n)) => BodyFraming::Length(n),
            _ => BodyFraming::Undetermined,
        }
    }

    /// Parse a header block and whatever body bytes follow it.
    ///
    /// A missing terminator is tolerated (datagrams sometimes omit the final
    /// blank line); the whole input is then treated as the header block.
    pub fn parse(bytes: &[u8]) -> Result<Self> {
        let (head, rest) = match find_header_end(bytes) {
            Some(end) => (&bytes[..end], &bytes[end..]),
            None => (bytes, &[][..]),
        };
        let mut message = Self::parse_head(head)?;
        let body = match message.body_framing() {
            BodyFraming::Length(n) => &rest[..n.min(rest.len())],
            _ => rest,
        };
        message.body = Body::Bytes(body.to_vec());
        Ok(message)
    }

    /// Parse start line and headers only; the body is left empty.
    pub fn parse_head(head: &[u8]) -> Result<Self> {
        let text = String::from_utf8_lossy(head);
        let mut lines = text
            .split('\n')
            .map(|l| l.strip_suffix('\r').unwrap_or(l))
            .skip_while(|l| l.is_empty());

        let first = lines
            .next()
            .ok_or(UpnpError::parse(ParseErrorKind::EmptyMessage))?;
        let mut message = Self::from_start(parse_start_line(first)?);

        for line in lines {
            if line.is_empty() {
                break;
            }
            if line.starts_with([' ', '\t']) {
                if !message.headers.continue_last(line.trim()) {
                    return Err(UpnpError::parse(ParseErrorKind::InvalidHeader));
                }
                continue;
            }
            let (name, value) = line
                .split_once(':')
                .ok_or(UpnpError::parse(ParseErrorKind::InvalidHeader))?;
            let name = name.trim();
            if name.is_empty() {
                return Err(UpnpError::parse(ParseErrorKind::InvalidHeader));
            }
            message.headers.add(name, value.trim());
        }
        Ok(message)
    }

    /// Serialize start line, headers and blank line.
    pub fn head_bytes(&self) -> Vec<u8> {
        let mut out = String::with_capacity(128);
        match &self.start {
            StartLine::Request {
                method,
                target,
                version,
            } => {
                if *version == Version::HTTP_09 {
                    out.push_str(&format!("{method} {target}\r\n"));
                } else {
                    out.push_str(&format!("{method} {target} {version}\r\n"));
                }
            }
            StartLine::Response {
                version,
                status,
                reason,
            } => out.push_str(&format!("{version} {status} {reason}\r\n")),
        }
        for (name, value) in self.headers.iter() {
            out.push_str(&format!("{name}: {value}\r\n"));
        }
        let framed = self.headers.contains("Content-Length")
            || self.headers.contains("Transfer-Encoding");
        if self.auto_content_length && !framed && !self.is_bodiless_status() {
            match &self.body {
                Body::Bytes(b) if !b.is_empty() || !self.is_request() => {
                    out.push_str(&format!("Content-Length: {}\r\n", b.len()));
                }
                Body::Stream(_) => out.push_str("Transfer-Encoding: chunked\r\n"),
                Body::Bytes(_) => {}
            }
        }
        out.push_str("\r\n");
        out.into_bytes()
    }

    /// Serialize the full message. Streamed bodies contribute only the head;
    /// the session writes their chunks afterwards.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = self.head_bytes();
        out.extend_from_slice(self.body_bytes());
        out
    }

    /// A body-less copy of the start line and headers.
    pub fn clone_head(&self) -> Self {
        WireMessage {
            start: self.start.clone(),
            headers: self.headers.clone(),
            body: Body::default(),
            auto_content_length: self.auto_content_length,
        }
    }

    /// A copy carrying the same byte body. Streamed bodies are not copied.
    pub fn duplicate(&self) -> Self {
        let mut copy = self.clone_head();
        copy.body = Body::Bytes(self.body_bytes().to_vec());
        copy
    }
}

fn parse_start_line(line: &str) -> Result<StartLine> {
    let line = line.trim();
    if line.starts_with("HTTP/") {
        let mut parts = line.splitn(3, ' ');
        let version = parts
            .next()
            .and_then(Version::parse)
            .ok_or(UpnpError::parse(ParseErrorKind::InvalidStartLine))?;
        let status = parts
            .next()
            .ok_or(UpnpError::parse(ParseErrorKind::InvalidStartLine))?
            .parse::<u16>()
            .map_err(|_| UpnpError::parse(ParseErrorKind::InvalidStatusCode))?;
        let reason = parts.next().unwrap_or("").trim().to_string();
        return Ok(StartLine::Response {
            version,
            status,
            reason,
        });
    }

    let parts: Vec<&str> = line.split_whitespace().collect();
    let version = match parts.len() {
        2 => Version::HTTP_09,
        3 => Version::parse(parts[2])
            .ok_or(UpnpError::parse(ParseErrorKind::InvalidStartLine))?,
        _ => return Err(UpnpError::parse(ParseErrorKind::InvalidStartLine)),
    };
    Ok(StartLine::Request {
        method: parts[0].to_string(),
        target: parts[1].to_string(),
        version,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_request_line() {
        let m = WireMessage::parse(b"GET /desc.xml HTTP/1.1\r\nHost: 10.0.0.2\r\n\r\n").unwrap();
        assert_eq!(m.method(), Some("GET"));
        assert_eq!(m.target(), Some("/desc.xml"));
        assert_eq!(m.version(), Version::HTTP_11);
        assert_eq!(m.headers.get("host"), Some("10.0.0.2"));
    }

    #[test]
    fn parse_status_line_with_spaced_reason() {
        let m = WireMessage::parse(b"HTTP/1.0 404 Not Found\r\n\r\n").unwrap();
        assert_eq!(m.status(), Some(404));
        assert_eq!(m.version(), Version::HTTP_10);
        match &m.start {
            StartLine::Response { reason, .. } => assert_eq!(reason, "Not Found"),
            _ => panic!("expected response"),
        }
    }

    #[test]
    fn non_numeric_status_is_error() {
        let err = WireMessage::parse(b"HTTP/1.1 OK 200\r\n\r\n").unwrap_err();
        assert!(matches!(
            err,
            UpnpError::Parse {
                kind: ParseErrorKind::InvalidStatusCode
            }
        ));
    }

    #[test]
    fn malformed_start_line_is_error() {
        assert!(WireMessage::parse(b"JUST_A_METHOD\r\n\r\n").is_err());
        assert!(WireMessage::parse(b"GET / FOO/1.1\r\n\r\n").is_err());
        assert!(WireMessage::parse(b"").is_err());
    }

    #[test]
    fn two_token_request_line_is_http_09() {
        let m = WireMessage::parse(b"GET /\r\n\r\n").unwrap();
        assert_eq!(m.version(), Version::HTTP_09);
    }

    #[test]
    fn header_without_colon_is_error() {
        assert!(WireMessage::parse(b"GET / HTTP/1.1\r\nBroken\r\n\r\n").is_err());
    }

    #[test]
    fn folded_header_joins_previous_value() {
        let m = WireMessage::parse(b"GET / HTTP/1.1\r\nX-Long: one\r\n  two\r\n\r\n").unwrap();
        assert_eq!(m.headers.get("X-Long"), Some("one two"));
    }

    #[test]
    fn body_cut_at_content_length() {
        let m = WireMessage::parse(b"HTTP/1.1 200 OK\r\nContent-Length: 3\r\n\r\nabcdef").unwrap();
        assert_eq!(m.body_bytes(), b"abc");
    }

    #[test]
    fn framing_precedence() {
        let chunked = WireMessage::response(200, "OK")
            .with_header("Content-Length", "10")
            .with_header("Transfer-Encoding", "gzip, chunked");
        assert_eq!(chunked.body_framing(), BodyFraming::Chunked);

        let fixed = WireMessage::response(200, "OK").with_header("Content-Length", " 42 ");
        assert_eq!(fixed.body_framing(), BodyFraming::Length(42));

        let bad = WireMessage::response(200, "OK").with_header("Content-Length", "lots");
        assert_eq!(bad.body_framing(), BodyFraming::Undetermined);
    }

    #[test]
    fn serialize_adds_content_length() {
        let bytes = WireMessage::response(200, "OK")
            .with_header("Server", "test/1.0")
            .with_body("hello")
            .to_bytes();
        let text = String::from_utf8(bytes).unwrap();
        assert_eq!(
            text,
            "HTTP/1.1 200 OK\r\nServer: test/1.0\r\nContent-Length: 5\r\n\r\nhello"
        );
    }

    #[test]
    fn serialize_suppressed_content_length() {
        let bytes = WireMessage::response(200, "OK")
            .without_content_length()
            .with_body("x")
            .to_bytes();
        assert!(!String::from_utf8(bytes).unwrap().contains("Content-Length"));
    }

    #[test]
    fn bodiless_request_has_no_content_length() {
        let text = String::from_utf8(WireMessage::request("M-SEARCH", "*").to_bytes()).unwrap();
        assert_eq!(text, "M-SEARCH * HTTP/1.1\r\n\r\n");
    }

    #[test]
    fn bodiless_statuses_have_no_content_length() {
        for (status, reason) in [(100, "Continue"), (204, "No Content"), (304, "Not Modified")] {
            let text = String::from_utf8(WireMessage::response(status, reason).to_bytes()).unwrap();
            assert_eq!(text, format!("HTTP/1.1 {status} {reason}\r\n\r\n"));
        }
        let ok = String::from_utf8(WireMessage::response(200, "OK").to_bytes()).unwrap();
        assert!(ok.contains("Content-Length: 0\r\n"));
    }

    #[test]
    fn stream_body_announces_chunked() {
        let m = WireMessage::response(200, "OK").with_stream(std::io::empty());
        let text = String::from_utf8(m.head_bytes()).unwrap();
        assert!(text.contains("Transfer-Encoding: chunked\r\n"));
        assert!(!text.contains("Content-Length"));
    }

    #[test]
    fn round_trip_preserves_order_and_repeats() {
        let original = WireMessage::request("POST", "/control")
            .with_header("Host", "192.168.1.4:5000")
            .with_header("SOAPACTION", "\"urn:x#Play\"")
            .with_header("X-Trace", "a")
            .with_header("X-Trace", "b")
            .with_body(&b"<body/>"[..]);
        let mut parsed = WireMessage::parse(&original.to_bytes()).unwrap();

        assert_eq!(parsed.start, original.start);
        assert_eq!(parsed.headers.get("Content-Length"), Some("7"));
        parsed.headers.remove("Content-Length");
        assert_eq!(parsed.headers, original.headers);
        assert_eq!(parsed.body_bytes(), original.body_bytes());
    }

    #[test]
    fn close_semantics_by_version() {
        let m10 = WireMessage::response(200, "OK").with_version(Version::HTTP_10);
        assert!(m10.wants_close());
        let m10ka = WireMessage::response(200, "OK")
            .with_version(Version::HTTP_10)
            .with_header("Connection", "Keep-Alive");
        assert!(!m10ka.wants_close());
        let m11 = WireMessage::response(200, "OK");
        assert!(!m11.wants_close());
        assert!(m11.with_header("Connection", "close").wants_close());
    }
}
