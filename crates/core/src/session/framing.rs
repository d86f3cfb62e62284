//! Incremental HTTP/1.x body framing.
//!
//! [`Framer`] turns arbitrarily fragmented input into complete
//! [`WireMessage`]s. It owns no socket: the caller hands it whatever bytes
//! are unread, learns how many were consumed, and asks [`Framer::wanted`]
//! how large the next read should be.
//!
//! ```text
//! AwaitHeaders ──► FixedBody ─────────────────────────────┐
//!      │       ├─► ChunkedSize ◄─► ChunkedData            │
//!      │       │        │          └► ChunkedTrailerCrlf ─┤ (loops to ChunkedSize)
//!      │       │        └► ChunkedFooters ────────────────┤
//!      │       └─► ReadUntilClose ── (finish on close) ───┤
//!      └──────────────────── complete ◄───────────────────┘
//! ```
//!
//! Framing is chosen once per header block: chunked, then `Content-Length`,
//! then an implicit empty body for HTTP/1.1 peers that did not ask to close,
//! and finally read-until-close. Requests without framing headers have an
//! empty body. Chunk framing errors resynchronize instead of failing.

use std::fmt;
use std::io::Write;

use crate::error::{ParseErrorKind, UpnpError};
use crate::protocol::chunked::parse_chunk_size;
use crate::protocol::{Body, BodyFraming, Version, WireMessage, find_header_end};

const MAX_LINE: usize = 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameState {
    AwaitHeaders,
    FixedBody,
    ChunkedSize,
    ChunkedData,
    ChunkedTrailerCrlf,
    ChunkedFooters,
    ReadUntilClose,
    Idle,
}

/// Limits and compatibility switches for a [`Framer`].
#[derive(Debug, Clone)]
pub struct FramingRules {
    /// Largest header block accepted before it is dropped.
    pub max_header_bytes: usize,
    /// Normal read size when no tighter bound applies.
    pub read_chunk: usize,
    /// Treat an unframed HTTP/1.1 response without `Connection: close` as
    /// having an empty body instead of reading until close.
    pub implicit_empty_body: bool,
}

impl Default for FramingRules {
    fn default() -> Self {
        Self {
            max_header_bytes: 64 * 1024,
            read_chunk: 8 * 1024,
            implicit_empty_body: true,
        }
    }
}

/// Result of one [`Framer::advance`] call.
#[derive(Debug)]
pub enum Step {
    /// Everything offered was consumed; feed more input.
    NeedMore,
    /// A header block was parsed and body framing chosen. The head is
    /// available from [`Framer::current`] and a body sink may be attached.
    Head,
    /// A 1xx response was read and dropped.
    Informational(u16),
    /// A message finished.
    Complete(WireMessage),
    /// A header block could not be parsed and was dropped.
    Rejected(UpnpError),
}

enum Progress {
    Event(Step),
    Continue,
    Starved,
}

pub struct Framer {
    rules: FramingRules,
    state: FrameState,
    head: Vec<u8>,
    line: Vec<u8>,
    current: Option<WireMessage>,
    body: Vec<u8>,
    sink: Option<Box<dyn Write + Send>>,
    remaining: usize,
    chunked: bool,
    connection_close: bool,
    legacy_version: bool,
    resync: bool,
}

impl fmt::Debug for Framer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Framer")
            .field("state", &self.state)
            .field("remaining", &self.remaining)
            .field("chunked", &self.chunked)
            .field("connection_close", &self.connection_close)
            .field("legacy_version", &self.legacy_version)
            .finish_non_exhaustive()
    }
}

impl Framer {
    pub fn new(rules: FramingRules) -> Self {
        Self {
            rules,
            state: FrameState::AwaitHeaders,
            head: Vec::new(),
            line: Vec::new(),
            current: None,
            body: Vec::new(),
            sink: None,
            remaining: 0,
            chunked: false,
            connection_close: false,
            legacy_version: false,
            resync: false,
        }
    }

    pub fn state(&self) -> FrameState {
        self.state
    }

    /// Head of the message currently being read.
    pub fn current(&self) -> Option<&WireMessage> {
        self.current.as_ref()
    }

    pub fn is_chunked(&self) -> bool {
        self.chunked
    }

    /// The current message asked for the connection to close.
    pub fn connection_close(&self) -> bool {
        self.connection_close
    }

    /// The current message is older than HTTP/1.1.
    pub fn legacy_version(&self) -> bool {
        self.legacy_version
    }

    /// Whether a message is partially read.
    pub fn in_message(&self) -> bool {
        match self.state {
            FrameState::AwaitHeaders => !self.head.is_empty(),
            FrameState::Idle => false,
            _ => true,
        }
    }

    /// Route the current body to `sink` instead of buffering it.
    pub fn attach_sink(&mut self, sink: Box<dyn Write + Send>) {
        if self.current.is_some() {
            self.sink = Some(sink);
        }
    }

    /// Stop framing; further input is discarded.
    pub fn set_idle(&mut self) {
        self.state = FrameState::Idle;
    }

    /// Suggested size of the next read.
    pub fn wanted(&self) -> usize {
        if self.resync {
            return 1;
        }
        let chunk = self.rules.read_chunk.max(1);
        match self.state {
            FrameState::AwaitHeaders => match partial_terminator(&self.head) {
                0 => chunk,
                matched => 4 - matched,
            },
            FrameState::FixedBody | FrameState::ChunkedData => self.remaining.clamp(1, chunk),
            FrameState::ChunkedTrailerCrlf => {
                if self.line.is_empty() {
                    2
                } else {
                    1
                }
            }
            _ => chunk,
        }
    }

    /// Consume as much of `input` as the current state allows. Returns the
    /// number of bytes consumed and what happened. Call again with the
    /// unconsumed remainder (possibly empty) until [`Step::NeedMore`].
    pub fn advance(&mut self, input: &[u8]) -> (usize, Step) {
        if !input.is_empty() {
            self.resync = false;
        }
        let mut offset = 0;
        loop {
            let rest = &input[offset..];
            let (n, progress) = match self.state {
                FrameState::AwaitHeaders => self.await_headers(rest),
                FrameState::FixedBody => self.fixed_body(rest),
                FrameState::ChunkedSize => self.chunk_size(rest),
                FrameState::ChunkedData => self.chunk_data(rest),
                FrameState::ChunkedTrailerCrlf => self.chunk_trailer(rest),
                FrameState::ChunkedFooters => self.footers(rest),
                FrameState::ReadUntilClose => {
                    self.deliver(rest);
                    (rest.len(), Progress::Starved)
                }
                FrameState::Idle => (rest.len(), Progress::Starved),
            };
            offset += n;
            match progress {
                Progress::Event(step) => return (offset, step),
                Progress::Starved => return (offset, Step::NeedMore),
                Progress::Continue => {}
            }
        }
    }

    /// The connection closed. A close-delimited body completes here; any
    /// other partial message is discarded.
    pub fn finish(&mut self) -> Option<WireMessage> {
        let closing = self.state == FrameState::ReadUntilClose;
        let message = if closing {
            self.complete()
        } else {
            if self.current.is_some() {
                tracing::debug!("connection closed mid-body; partial message dropped");
            }
            self.current = None;
            self.sink = None;
            None
        };
        self.state = FrameState::Idle;
        message
    }

    fn await_headers(&mut self, input: &[u8]) -> (usize, Progress) {
        let mut skipped = 0;
        if self.head.is_empty() {
            skipped = input
                .iter()
                .take_while(|&&b| b == b'\r' || b == b'\n')
                .count();
        }
        let input = &input[skipped..];
        if input.is_empty() {
            return (skipped, Progress::Starved);
        }

        let before = self.head.len();
        let scan_from = before.saturating_sub(3);
        self.head.extend_from_slice(input);

        let Some(end) = find_header_end(&self.head[scan_from..]).map(|e| e + scan_from) else {
            if self.head.len() > self.rules.max_header_bytes {
                self.head.clear();
                self.resync = true;
                let err = UpnpError::parse(ParseErrorKind::HeaderTooLarge);
                return (skipped + input.len(), Progress::Event(Step::Rejected(err)));
            }
            return (skipped + input.len(), Progress::Starved);
        };

        let consumed = skipped + (end - before);
        self.head.truncate(end);
        let block = std::mem::take(&mut self.head);

        match WireMessage::parse_head(&block) {
            Err(e) => {
                tracing::warn!(error = %e, "dropping malformed header block");
                self.resync = true;
                (consumed, Progress::Event(Step::Rejected(e)))
            }
            Ok(message) if message.is_informational() => {
                let status = message.status().unwrap_or(100);
                tracing::trace!(status, "informational response skipped");
                (consumed, Progress::Event(Step::Informational(status)))
            }
            Ok(message) => {
                self.begin_body(message);
                (consumed, Progress::Event(Step::Head))
            }
        }
    }

    fn begin_body(&mut self, message: WireMessage) {
        self.chunked = false;
        self.remaining = 0;
        self.body.clear();
        self.sink = None;
        self.connection_close = message.headers.has_token("Connection", "close");
        self.legacy_version = message.version() < Version::HTTP_11;

        self.state = match message.body_framing() {
            BodyFraming::Chunked => {
                self.chunked = true;
                FrameState::ChunkedSize
            }
            BodyFraming::Length(n) => {
                self.remaining = n;
                FrameState::FixedBody
            }
            BodyFraming::Undetermined if message.is_request() => FrameState::FixedBody,
            BodyFraming::Undetermined
                if self.rules.implicit_empty_body
                    && !self.legacy_version
                    && !self.connection_close =>
            {
                FrameState::FixedBody
            }
            BodyFraming::Undetermined => FrameState::ReadUntilClose,
        };
        tracing::trace!(state = ?self.state, remaining = self.remaining, "body framing selected");
        self.current = Some(message);
    }

    fn fixed_body(&mut self, input: &[u8]) -> (usize, Progress) {
        let n = self.remaining.min(input.len());
        self.deliver(&input[..n]);
        self.remaining -= n;
        if self.remaining == 0 {
            (n, self.completed())
        } else {
            (n, Progress::Starved)
        }
    }

    fn chunk_size(&mut self, input: &[u8]) -> (usize, Progress) {
        let Some((n, line)) = self.take_line(input) else {
            return (input.len(), Progress::Starved);
        };
        match parse_chunk_size(&line) {
            Some(0) => self.state = FrameState::ChunkedFooters,
            Some(size) => {
                self.remaining = size;
                self.state = FrameState::ChunkedData;
            }
            None => {
                tracing::warn!(
                    line = %String::from_utf8_lossy(&line),
                    "bad chunk size line; resynchronizing"
                );
                self.resync = true;
            }
        }
        (n, Progress::Continue)
    }

    fn chunk_data(&mut self, input: &[u8]) -> (usize, Progress) {
        if input.is_empty() {
            return (0, Progress::Starved);
        }
        let n = self.remaining.min(input.len());
        self.deliver(&input[..n]);
        self.remaining -= n;
        if self.remaining == 0 {
            self.state = FrameState::ChunkedTrailerCrlf;
            self.line.clear();
        }
        (n, Progress::Continue)
    }

    fn chunk_trailer(&mut self, input: &[u8]) -> (usize, Progress) {
        match input.first() {
            None => (0, Progress::Starved),
            Some(b'\r') if self.line.is_empty() => {
                self.line.push(b'\r');
                (1, Progress::Continue)
            }
            Some(b'\n') => {
                self.line.clear();
                self.state = FrameState::ChunkedSize;
                (1, Progress::Continue)
            }
            Some(_) => {
                tracing::warn!("missing CRLF after chunk data; resynchronizing");
                self.line.clear();
                self.resync = true;
                self.state = FrameState::ChunkedSize;
                (0, Progress::Continue)
            }
        }
    }

    fn footers(&mut self, input: &[u8]) -> (usize, Progress) {
        let Some((n, line)) = self.take_line(input) else {
            return (input.len(), Progress::Starved);
        };
        if line.is_empty() {
            return (n, self.completed());
        }
        let text = String::from_utf8_lossy(&line);
        match (text.split_once(':'), self.current.as_mut()) {
            (Some((name, value)), Some(message)) if !name.trim().is_empty() => {
                message.headers.add(name.trim(), value.trim());
            }
            _ => tracing::warn!(line = %text, "ignoring malformed chunked footer"),
        }
        (n, Progress::Continue)
    }

    /// Accumulate up to a line feed. Returns bytes consumed and the line
    /// without its terminator once complete.
    fn take_line(&mut self, input: &[u8]) -> Option<(usize, Vec<u8>)> {
        match input.iter().position(|&b| b == b'\n') {
            Some(pos) => {
                self.line.extend_from_slice(&input[..pos]);
                let mut line = std::mem::take(&mut self.line);
                if line.last() == Some(&b'\r') {
                    line.pop();
                }
                Some((pos + 1, line))
            }
            None => {
                self.line.extend_from_slice(input);
                if self.line.len() > MAX_LINE {
                    tracing::warn!(len = self.line.len(), "over-long framing line discarded");
                    self.line.clear();
                    self.resync = true;
                }
                None
            }
        }
    }

    fn deliver(&mut self, bytes: &[u8]) {
        if bytes.is_empty() {
            return;
        }
        if let Some(sink) = self.sink.as_mut() {
            if let Err(e) = sink.write_all(bytes) {
                tracing::warn!(error = %e, "body sink failed; buffering remainder");
                self.sink = None;
                self.body.extend_from_slice(bytes);
            }
            return;
        }
        self.body.extend_from_slice(bytes);
    }

    fn completed(&mut self) -> Progress {
        match self.complete() {
            Some(message) => Progress::Event(Step::Complete(message)),
            None => Progress::Continue,
        }
    }

    /// Close out the current message. Body states are only entered through
    /// `begin_body`, so a missing head means there is nothing to deliver.
    fn complete(&mut self) -> Option<WireMessage> {
        if let Some(mut sink) = self.sink.take() {
            let _ = sink.flush();
        }
        let body = std::mem::take(&mut self.body);
        self.state = FrameState::AwaitHeaders;
        self.line.clear();
        self.remaining = 0;
        let Some(mut message) = self.current.take() else {
            tracing::warn!(dropped = body.len(), "body completed without a head");
            return None;
        };
        message.body = Body::Bytes(body);
        Some(message)
    }
}

/// Length of a trailing prefix of `\r\n\r\n` at the end of `bytes`.
fn partial_terminator(bytes: &[u8]) -> usize {
    const T: &[u8] = b"\r\n\r\n";
    (1..T.len())
        .rev()
        .find(|&k| bytes.ends_with(&T[..k]))
        .unwrap_or(0)
}
