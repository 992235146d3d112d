use crate::error::{ParseErrorKind, RtspError};

/// Largest request head (request line plus headers) accepted.
pub const MAX_HEADER_BYTES: usize = 64 * 1024;
/// Largest request body accepted.
pub const MAX_BODY_BYTES: usize = 64 * 1024;

/// A parsed RTSP request (RFC 2326 §6).
///
/// RTSP requests follow HTTP/1.1 syntax:
///
/// ```text
/// Method SP Request-URI SP RTSP-Version CRLF
/// *(Header: Value CRLF)
/// CRLF
/// [body]
/// ```
///
/// Header lookup is case-insensitive per RFC 2326 §4.2.
#[derive(Debug, Clone, PartialEq)]
pub struct RtspRequest {
    /// RTSP method (OPTIONS, DESCRIBE, SETUP, PLAY, etc.).
    pub method: String,
    /// Request-URI (e.g. `rtsp://host:port/stream/track1`).
    pub uri: String,
    /// Protocol version (expected: `RTSP/1.0`).
    pub version: String,
    /// Headers as ordered (name, value) pairs. Names are stored as-received;
    /// lookups via [`get_header`](Self::get_header) are case-insensitive.
    pub headers: Vec<(String, String)>,
    /// `Content-Length` bytes following the blank line.
    pub body: Vec<u8>,
}

impl RtspRequest {
    /// Parse a request head: request line, headers, and optional trailing
    /// blank line. The body, if any, is attached by [`RequestParser`].
    pub fn parse(raw: &str) -> crate::error::Result<Self> {
        let mut lines = raw.lines();

        let request_line = lines
            .next()
            .filter(|line| !line.trim().is_empty())
            .ok_or(RtspError::Parse {
                kind: ParseErrorKind::EmptyRequest,
            })?;

        let parts: Vec<&str> = request_line.split_whitespace().collect();

        if parts.len() != 3 {
            return Err(RtspError::Parse {
                kind: ParseErrorKind::InvalidRequestLine,
            });
        }

        let method = parts[0].to_string();
        let uri = parts[1].to_string();
        let version = parts[2].to_string();

        let mut headers = Vec::new();

        for line in lines {
            if line.is_empty() {
                break;
            }

            let colon_pos = line.find(':').ok_or(RtspError::Parse {
                kind: ParseErrorKind::InvalidHeader,
            })?;

            let name = line[..colon_pos].trim().to_string();
            let value = line[colon_pos + 1..].trim().to_string();

            headers.push((name, value));
        }

        Ok(RtspRequest {
            method,
            uri,
            version,
            headers,
            body: Vec::new(),
        })
    }

    /// Look up a header value by name (case-insensitive, per RFC 2326 §4.2).
    pub fn get_header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }

    /// Returns the CSeq header value, which numbers and orders RTSP
    /// request/response pairs (RFC 2326 §12.17).
    ///
    /// Every RTSP request must include a CSeq, and the response must echo it.
    pub fn cseq(&self) -> Option<&str> {
        self.get_header("CSeq")
    }

    /// Session ID from the `Session` header, without parameters such as
    /// `;timeout=` (RFC 2326 §12.37).
    pub fn session_id(&self) -> Option<&str> {
        self.get_header("Session")
            .map(|value| value.split(';').next().unwrap_or(value).trim())
            .filter(|id| !id.is_empty())
    }

    fn content_length(&self) -> Result<usize, ParseErrorKind> {
        match self.get_header("Content-Length") {
            None => Ok(0),
            Some(value) => value
                .trim()
                .parse()
                .map_err(|_| ParseErrorKind::InvalidContentLength),
        }
    }
}

/// One unit decoded from a connection's byte stream.
#[derive(Debug, Clone, PartialEq)]
pub enum ParsedItem {
    Request(RtspRequest),
    /// `$`-framed data sent by the client on an interleaved channel
    /// (RFC 2326 §10.12), usually RTCP receiver reports.
    Interleaved { channel: u8, data: Vec<u8> },
    /// A request that could not be parsed; answer 400 and carry on.
    Malformed(ParseErrorKind),
}

#[derive(Debug)]
enum ParserState {
    AwaitingRequestLine,
    ParsingHeaders,
    ReadingBody { request: RtspRequest, remaining: usize },
}

/// Incremental request parser: bytes go in with [`feed`](Self::feed) as
/// they arrive, complete items come out of [`next_item`](Self::next_item).
///
/// Several pipelined requests in one read, or one request split over many
/// reads, are handled alike.
#[derive(Debug)]
pub struct RequestParser {
    buf: Vec<u8>,
    state: ParserState,
}

impl Default for RequestParser {
    fn default() -> Self {
        Self::new()
    }
}

impl RequestParser {
    pub fn new() -> Self {
        Self {
            buf: Vec::new(),
            state: ParserState::AwaitingRequestLine,
        }
    }

    pub fn feed(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
    }

    /// Bytes received but not yet consumed.
    pub fn buffered(&self) -> usize {
        self.buf.len()
    }

    pub fn next_item(&mut self) -> Option<ParsedItem> {
        loop {
            match std::mem::replace(&mut self.state, ParserState::AwaitingRequestLine) {
                ParserState::AwaitingRequestLine => {
                    let skip = self
                        .buf
                        .iter()
                        .take_while(|&&b| b == b'\r' || b == b'\n')
                        .count();
                    self.buf.drain(..skip);
                    match self.buf.first() {
                        None => return None,
                        Some(b'$') => return self.take_interleaved(),
                        Some(_) => self.state = ParserState::ParsingHeaders,
                    }
                }
                ParserState::ParsingHeaders => {
                    let Some((head_len, terminator)) = find_head_end(&self.buf) else {
                        if self.buf.len() > MAX_HEADER_BYTES {
                            self.buf.clear();
                            return Some(ParsedItem::Malformed(ParseErrorKind::TooLarge));
                        }
                        self.state = ParserState::ParsingHeaders;
                        return None;
                    };
                    let head: Vec<u8> = self.buf.drain(..head_len + terminator).collect();
                    let request = match parse_head(&head[..head_len]) {
                        Ok(request) => request,
                        Err(kind) => return Some(ParsedItem::Malformed(kind)),
                    };
                    match request.content_length() {
                        Err(kind) => return Some(ParsedItem::Malformed(kind)),
                        Ok(0) => return Some(ParsedItem::Request(request)),
                        Ok(len) if len > MAX_BODY_BYTES => {
                            return Some(ParsedItem::Malformed(ParseErrorKind::TooLarge));
                        }
                        Ok(len) => {
                            self.state = ParserState::ReadingBody {
                                request,
                                remaining: len,
                            }
                        }
                    }
                }
                ParserState::ReadingBody {
                    mut request,
                    remaining,
                } => {
                    if self.buf.len() < remaining {
                        self.state = ParserState::ReadingBody { request, remaining };
                        return None;
                    }
                    request.body = self.buf.drain(..remaining).collect();
                    return Some(ParsedItem::Request(request));
                }
            }
        }
    }

    fn take_interleaved(&mut self) -> Option<ParsedItem> {
        if self.buf.len() < 4 {
            return None;
        }
        let len = usize::from(u16::from_be_bytes([self.buf[2], self.buf[3]]));
        if self.buf.len() < 4 + len {
            return None;
        }
        let channel = self.buf[1];
        let frame: Vec<u8> = self.buf.drain(..4 + len).collect();
        Some(ParsedItem::Interleaved {
            channel,
            data: frame[4..].to_vec(),
        })
    }
}

/// Position of the blank line ending a head, and the terminator length.
fn find_head_end(buf: &[u8]) -> Option<(usize, usize)> {
    let crlf = buf.windows(4).position(|w| w == b"\r\n\r\n");
    let lf = buf.windows(2).position(|w| w == b"\n\n");
    match (crlf, lf) {
        (Some(c), Some(l)) if l < c => Some((l, 2)),
        (Some(c), _) => Some((c, 4)),
        (None, Some(l)) => Some((l, 2)),
        (None, None) => None,
    }
}

fn parse_head(head: &[u8]) -> Result<RtspRequest, ParseErrorKind> {
    let text = std::str::from_utf8(head).map_err(|_| ParseErrorKind::InvalidEncoding)?;
    RtspRequest::parse(text).map_err(|e| match e {
        RtspError::Parse { kind } => kind,
        _ => ParseErrorKind::InvalidRequestLine,
    })
}
