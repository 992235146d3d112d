//! Error types for the media server library.

use std::fmt;
use std::net::SocketAddr;

/// Errors that can occur in the media server library.
///
/// Variants map to the failure classes the server distinguishes:
///
/// - **Protocol**: [`Parse`](Self::Parse),
///   [`UnsupportedTransport`](Self::UnsupportedTransport): answered with an
///   RTSP status, the connection stays usable.
/// - **Resolution**: [`Lookup`](Self::Lookup): unknown stream or unreadable file.
/// - **Resource**: [`PortRangeExhausted`](Self::PortRangeExhausted).
/// - **Session**: [`SessionNotFound`](Self::SessionNotFound).
/// - **Startup**: [`Bind`](Self::Bind), the only fatal class.
#[derive(Debug, thiserror::Error)]
pub enum RtspError {
    /// Underlying I/O or socket error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Failed to parse an RTSP request message (RFC 2326 §6).
    #[error("RTSP parse error: {kind}")]
    Parse { kind: ParseErrorKind },

    /// The stream name could not be resolved to a playable media session.
    #[error(transparent)]
    Lookup(#[from] LookupError),

    /// No session with the given ID exists in the session table.
    #[error("session not found: {0}")]
    SessionNotFound(String),

    /// The client's `Transport` header offered nothing the server can serve.
    #[error("unsupported transport: {0}")]
    UnsupportedTransport(String),

    /// Every server-side RTP/RTCP port pair in the configured range is taken.
    #[error("RTP port range exhausted")]
    PortRangeExhausted,

    /// A listening socket could not be bound.
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },

    /// A media file turned out to be unreadable while streaming.
    #[error("media error: {0}")]
    Media(String),
}

impl RtspError {
    /// RTSP status code reported to a client when a request fails with this error.
    pub fn status_code(&self) -> u16 {
        match self {
            Self::Parse { .. } => 400,
            Self::Lookup(e) => e.status_code(),
            Self::SessionNotFound(_) => 454,
            Self::UnsupportedTransport(_) => 461,
            Self::PortRangeExhausted => 503,
            Self::Io(_) | Self::Bind { .. } | Self::Media(_) => 500,
        }
    }
}

/// Specific kind of RTSP parse failure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParseErrorKind {
    /// Input was empty (no request line).
    EmptyRequest,
    /// Request line did not have the expected `Method URI Version` format.
    InvalidRequestLine,
    /// A header line did not contain a colon separator.
    InvalidHeader,
    /// Header block was not valid UTF-8.
    InvalidEncoding,
    /// `Content-Length` was not a number.
    InvalidContentLength,
    /// Header block exceeded the size limit without terminating.
    TooLarge,
}

impl fmt::Display for ParseErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::EmptyRequest => write!(f, "empty request"),
            Self::InvalidRequestLine => write!(f, "invalid request line"),
            Self::InvalidHeader => write!(f, "invalid header"),
            Self::InvalidEncoding => write!(f, "header block is not UTF-8"),
            Self::InvalidContentLength => write!(f, "invalid Content-Length"),
            Self::TooLarge => write!(f, "request header too large"),
        }
    }
}

/// Failure to turn a stream name into a [`ServerMediaSession`](crate::media_session::ServerMediaSession).
///
/// Cloneable so that every waiter on a single-flight creation gets its own copy.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LookupError {
    /// Unknown suffix, or no such file under the media root.
    #[error("stream not found: {0}")]
    NotFound(String),

    /// The file exists but its header could not be understood.
    #[error("malformed media file {name}: {reason}")]
    Malformed { name: String, reason: String },

    /// The file exists but could not be read.
    #[error("cannot read {name}: {reason}")]
    Io { name: String, reason: String },
}

impl LookupError {
    pub fn malformed(name: &str, reason: impl Into<String>) -> Self {
        Self::Malformed {
            name: name.to_string(),
            reason: reason.into(),
        }
    }

    pub fn io(name: &str, error: &std::io::Error) -> Self {
        if error.kind() == std::io::ErrorKind::NotFound {
            return Self::NotFound(name.to_string());
        }
        Self::Io {
            name: name.to_string(),
            reason: error.to_string(),
        }
    }

    /// 404 for unknown streams, 500 for everything that exists but is broken.
    pub fn status_code(&self) -> u16 {
        match self {
            Self::NotFound(_) => 404,
            Self::Malformed { .. } | Self::Io { .. } => 500,
        }
    }
}

/// Convenience alias for `Result<T, RtspError>`.
pub type Result<T> = std::result::Result<T, RtspError>;
