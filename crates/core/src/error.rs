//! Error types for the protocol engine.

use std::fmt;

/// Errors that can occur in the protocol engine.
///
/// Variants map to specific failure modes across the stack:
///
/// - **Codec**: [`Parse`](Self::Parse) for malformed HTTP/SSDP messages.
/// - **Transport**: [`Io`](Self::Io), [`Closed`](Self::Closed) for socket failures
///   and operations on a connection that already disconnected.
/// - **Server/Discovery**: [`NotStarted`](Self::NotStarted),
///   [`AlreadyRunning`](Self::AlreadyRunning).
///
/// A request that never receives an answer is not an error; it surfaces as
/// [`PipelineOutcome::NoResponse`](crate::pipeline::PipelineOutcome::NoResponse).
#[derive(Debug, thiserror::Error)]
pub enum UpnpError {
    /// Underlying I/O or socket error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Failed to parse a wire message.
    #[error("parse error: {kind}")]
    Parse { kind: ParseErrorKind },

    /// The transport or session was already disconnected.
    #[error("connection closed")]
    Closed,

    /// The outbound side is in the middle of a chunked body.
    #[error("a chunked body is already being sent")]
    Busy,

    /// A service method was called before `start`.
    #[error("service not started")]
    NotStarted,

    /// `start` was called while already running.
    #[error("service already running")]
    AlreadyRunning,

    /// A URL or endpoint string could not be interpreted.
    #[error("invalid url: {0}")]
    InvalidUrl(String),
}

impl UpnpError {
    pub(crate) fn parse(kind: ParseErrorKind) -> Self {
        Self::Parse { kind }
    }
}

/// Specific kind of message parse failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParseErrorKind {
    /// Input was empty or held only line breaks.
    EmptyMessage,
    /// No blank line terminating the header block was found.
    Incomplete,
    /// The first line was neither `Method Target Version` nor `Version Code Reason`.
    InvalidStartLine,
    /// The status code of a status line was not numeric.
    InvalidStatusCode,
    /// A header line did not contain a colon separator.
    InvalidHeader,
    /// A percent escape was truncated or not hexadecimal.
    InvalidEscape,
    /// The header block exceeded the configured limit.
    HeaderTooLarge,
}

impl fmt::Display for ParseErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::EmptyMessage => write!(f, "empty message"),
            Self::Incomplete => write!(f, "incomplete header block"),
            Self::InvalidStartLine => write!(f, "invalid start line"),
            Self::InvalidStatusCode => write!(f, "invalid status code"),
            Self::InvalidHeader => write!(f, "invalid header"),
            Self::InvalidEscape => write!(f, "invalid percent escape"),
            Self::HeaderTooLarge => write!(f, "header block too large"),
        }
    }
}

/// Convenience alias for `Result<T, UpnpError>`.
pub type Result<T> = std::result::Result<T, UpnpError>;
