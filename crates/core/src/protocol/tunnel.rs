//! RTSP-over-HTTP tunneling (Apple QuickTime style).
//!
//! A client that cannot reach the RTSP port opens two HTTP connections
//! sharing an `x-sessioncookie`:
//!
//! ```text
//! GET /movie.264 HTTP/1.0          ← downstream: server → client
//! x-sessioncookie: 4a8d1f...
//! Accept: application/x-rtsp-tunnelled
//!
//! POST /movie.264 HTTP/1.0         ← upstream: client → server
//! x-sessioncookie: 4a8d1f...
//! Content-Type: application/x-rtsp-tunnelled
//! Content-Length: 32767
//!
//! T1BUSU9OUyAqIFJUU1AvMS4w...     ← base64-encoded RTSP requests
//! ```
//!
//! RTSP responses and interleaved media flow back, unencoded, on the GET
//! connection after its `200 OK`.

use base64::prelude::{BASE64_STANDARD, Engine as _};

use super::request::{MAX_HEADER_BYTES, RtspRequest};
use super::response::SERVER_AGENT;
use crate::error::ParseErrorKind;

pub const SESSION_COOKIE_HEADER: &str = "x-sessioncookie";
pub const TUNNEL_CONTENT_TYPE: &str = "application/x-rtsp-tunnelled";

/// What the first bytes of a new connection look like.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Sniff {
    Rtsp,
    Http,
    NeedMore,
}

pub fn sniff(buf: &[u8]) -> Sniff {
    const HTTP_PREFIXES: [&[u8]; 2] = [b"GET ", b"POST "];
    for prefix in HTTP_PREFIXES {
        if buf.starts_with(prefix) {
            return Sniff::Http;
        }
        if buf.len() < prefix.len() && prefix.starts_with(buf) {
            return Sniff::NeedMore;
        }
    }
    Sniff::Rtsp
}

/// Role an HTTP request asks for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TunnelRequest {
    Get { cookie: String },
    Post { cookie: String },
    Other,
}

/// Parse an HTTP request head at the start of `buf`.
///
/// Returns `None` until the blank line has arrived; otherwise the request
/// and the number of head bytes consumed. Any body bytes stay in `buf`.
pub fn parse_http_head(buf: &[u8]) -> Option<Result<(RtspRequest, usize), ParseErrorKind>> {
    let Some(end) = buf.windows(4).position(|w| w == b"\r\n\r\n") else {
        if buf.len() > MAX_HEADER_BYTES {
            return Some(Err(ParseErrorKind::TooLarge));
        }
        return None;
    };
    let head = match std::str::from_utf8(&buf[..end]) {
        Ok(head) => head,
        Err(_) => return Some(Err(ParseErrorKind::InvalidEncoding)),
    };
    Some(
        RtspRequest::parse(head)
            .map(|request| (request, end + 4))
            .map_err(|_| ParseErrorKind::InvalidRequestLine),
    )
}

pub fn classify(request: &RtspRequest) -> TunnelRequest {
    let Some(cookie) = request
        .get_header(SESSION_COOKIE_HEADER)
        .map(str::trim)
        .filter(|c| !c.is_empty())
    else {
        return TunnelRequest::Other;
    };
    match request.method.as_str() {
        "GET" => TunnelRequest::Get {
            cookie: cookie.to_string(),
        },
        "POST" => TunnelRequest::Post {
            cookie: cookie.to_string(),
        },
        _ => TunnelRequest::Other,
    }
}

/// Reply opening the downstream half.
pub fn get_response() -> String {
    format!(
        "HTTP/1.0 200 OK\r\nServer: {}\r\nConnection: close\r\nCache-Control: no-store\r\nPragma: no-cache\r\nContent-Type: {}\r\n\r\n",
        SERVER_AGENT, TUNNEL_CONTENT_TYPE
    )
}

/// Reply to HTTP requests that are not part of a tunnel.
pub fn bad_request_response() -> String {
    format!(
        "HTTP/1.0 400 Bad Request\r\nServer: {}\r\nConnection: close\r\n\r\n",
        SERVER_AGENT
    )
}

/// Decodes the base64 stream of a POST body as it arrives.
///
/// Whitespace is skipped and an incomplete 4-character quantum is kept
/// for the next call. Clients encode each request separately, so padded
/// quanta may appear mid-stream; each is decoded on its own boundary.
#[derive(Debug, Default)]
pub struct Base64Decoder {
    pending: Vec<u8>,
}

impl Base64Decoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn decode(&mut self, data: &[u8]) -> Result<Vec<u8>, base64::DecodeError> {
        self.pending.extend(
            data.iter()
                .copied()
                .filter(|b| b.is_ascii_alphanumeric() || matches!(b, b'+' | b'/' | b'=')),
        );
        let complete = self.pending.len() - self.pending.len() % 4;
        let quanta: Vec<u8> = self.pending.drain(..complete).collect();

        let mut out = Vec::with_capacity(quanta.len() / 4 * 3);
        let mut segment_start = 0;
        for (i, quantum) in quanta.chunks_exact(4).enumerate() {
            if quantum.contains(&b'=') {
                let end = (i + 1) * 4;
                BASE64_STANDARD.decode_vec(&quanta[segment_start..end], &mut out)?;
                segment_start = end;
            }
        }
        BASE64_STANDARD.decode_vec(&quanta[segment_start..], &mut out)?;
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sniffs_http_methods() {
        assert_eq!(sniff(b"GET /a.264 HTTP/1.0\r\n"), Sniff::Http);
        assert_eq!(sniff(b"POST /a.264 HTTP/1.0\r\n"), Sniff::Http);
        assert_eq!(sniff(b"GET_PARAMETER rtsp://h/a RTSP/1.0"), Sniff::Rtsp);
        assert_eq!(sniff(b"OPTIONS * RTSP/1.0"), Sniff::Rtsp);
        assert_eq!(sniff(b"$\x00\x00\x04"), Sniff::Rtsp);
        assert_eq!(sniff(b"PO"), Sniff::NeedMore);
        assert_eq!(sniff(b"GE"), Sniff::NeedMore);
        assert_eq!(sniff(b""), Sniff::NeedMore);
    }

    #[test]
    fn classifies_tunnel_halves() {
        let raw = b"GET /a.264 HTTP/1.0\r\nx-sessioncookie: abc123\r\nAccept: application/x-rtsp-tunnelled\r\n\r\n";
        let (request, consumed) = parse_http_head(raw).unwrap().unwrap();
        assert_eq!(consumed, raw.len());
        assert_eq!(classify(&request), TunnelRequest::Get { cookie: "abc123".into() });

        let raw = b"POST /a.264 HTTP/1.0\r\nX-SessionCookie: abc123\r\nContent-Length: 32767\r\n\r\nT1BU";
        let (request, consumed) = parse_http_head(raw).unwrap().unwrap();
        assert_eq!(&raw[consumed..], b"T1BU");
        assert_eq!(classify(&request), TunnelRequest::Post { cookie: "abc123".into() });

        let raw = b"GET /index.html HTTP/1.1\r\nHost: x\r\n\r\n";
        let (request, _) = parse_http_head(raw).unwrap().unwrap();
        assert_eq!(classify(&request), TunnelRequest::Other);
    }

    #[test]
    fn head_incomplete_until_blank_line() {
        assert!(parse_http_head(b"GET / HTTP/1.0\r\nx-sessioncookie: a\r\n").is_none());
    }

    #[test]
    fn get_reply_advertises_tunnel_content_type() {
        let reply = get_response();
        assert!(reply.starts_with("HTTP/1.0 200 OK\r\n"));
        assert!(reply.contains("Content-Type: application/x-rtsp-tunnelled\r\n"));
        assert!(reply.ends_with("\r\n\r\n"));
    }

    #[test]
    fn decoder_keeps_partial_quanta() {
        let encoded = BASE64_STANDARD.encode("OPTIONS * RTSP/1.0\r\nCSeq: 1\r\n\r\n");
        let (a, b) = encoded.as_bytes().split_at(10);
        let mut decoder = Base64Decoder::new();
        let mut out = decoder.decode(a).unwrap();
        out.extend(decoder.decode(b).unwrap());
        assert_eq!(out, b"OPTIONS * RTSP/1.0\r\nCSeq: 1\r\n\r\n");
    }

    #[test]
    fn decoder_handles_back_to_back_padded_messages() {
        let mut stream = BASE64_STANDARD.encode("ab").into_bytes();
        stream.extend(b"\r\n");
        stream.extend(BASE64_STANDARD.encode("cde").into_bytes());
        stream.extend(BASE64_STANDARD.encode("f").into_bytes());
        let mut decoder = Base64Decoder::new();
        assert_eq!(decoder.decode(&stream).unwrap(), b"abcdef");
    }

    #[test]
    fn decoder_rejects_garbage() {
        let mut decoder = Base64Decoder::new();
        assert!(decoder.decode(b"=AAA").is_err());
    }
}
