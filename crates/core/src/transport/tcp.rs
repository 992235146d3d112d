use std::io::{self, Read, Write};
use std::net::SocketAddr;

use mio::Token;
use mio::net::TcpStream;

use crate::protocol::request::RequestParser;
use crate::protocol::tunnel::Base64Decoder;

/// Bytes pulled from a socket per `read` call.
const READ_CHUNK: usize = 16 * 1024;

/// Interleaved media is dropped while this much output is still queued,
/// so a stalled reader cannot grow the queue without bound. RTSP
/// responses are always queued.
pub const MAX_PENDING_OUTPUT: usize = 4 * 1024 * 1024;

/// What a connection turned out to be after its first bytes.
#[derive(Debug)]
pub enum Role {
    /// Nothing conclusive received yet.
    Sniffing,
    /// Plain RTSP.
    Rtsp,
    /// Downstream half of an HTTP tunnel: carries responses and media.
    TunnelGet { cookie: String },
    /// Upstream half of an HTTP tunnel: base64 requests for the GET half.
    TunnelPost {
        cookie: String,
        decoder: Base64Decoder,
    },
}

/// Per-connection state the method handler reads and updates.
#[derive(Debug, Clone)]
pub struct ClientContext {
    /// Key of the connection in the server's table.
    pub key: usize,
    pub peer: SocketAddr,
    pub local: SocketAddr,
    /// Digest nonce most recently issued on this connection.
    pub nonce: Option<String>,
}

/// One accepted TCP connection, RTSP or HTTP-tunnel.
///
/// Reads are drained until `WouldBlock` (the poller is edge-triggered);
/// writes go through an output queue flushed whenever the socket becomes
/// writable.
#[derive(Debug)]
pub struct Connection {
    pub stream: TcpStream,
    pub token: Token,
    pub role: Role,
    pub client: ClientContext,
    pub parser: RequestParser,
    /// Bytes held while sniffing or while an HTTP head is incomplete.
    pub head: Vec<u8>,
    output: Vec<u8>,
    close_after_flush: bool,
}

/// Outcome of draining a socket.
#[derive(Debug, Default)]
pub struct ReadResult {
    pub data: Vec<u8>,
    pub eof: bool,
}

impl Connection {
    pub fn new(stream: TcpStream, token: Token, client: ClientContext) -> Self {
        Self {
            stream,
            token,
            role: Role::Sniffing,
            client,
            parser: RequestParser::new(),
            head: Vec::new(),
            output: Vec::new(),
            close_after_flush: false,
        }
    }

    pub fn peer(&self) -> SocketAddr {
        self.client.peer
    }

    pub fn read_available(&mut self) -> io::Result<ReadResult> {
        let mut result = ReadResult::default();
        let mut buf = [0u8; READ_CHUNK];
        loop {
            match self.stream.read(&mut buf) {
                Ok(0) => {
                    result.eof = true;
                    return Ok(result);
                }
                Ok(n) => result.data.extend_from_slice(&buf[..n]),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(result),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
    }

    /// Queue `data` and try to send it right away.
    pub fn send(&mut self, data: &[u8]) -> io::Result<()> {
        self.output.extend_from_slice(data);
        self.flush()
    }

    /// Queue one `$`-framed packet (RFC 2326 §10.12). Returns `false` when
    /// the packet was dropped because the peer is not keeping up.
    pub fn send_interleaved(&mut self, channel: u8, packet: &[u8]) -> io::Result<bool> {
        if self.output.len() > MAX_PENDING_OUTPUT {
            tracing::trace!(peer = %self.client.peer, channel, "output queue full; packet dropped");
            return Ok(false);
        }
        let len = u16::try_from(packet.len())
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "interleaved packet too large"))?;
        self.output.push(b'$');
        self.output.push(channel);
        self.output.extend_from_slice(&len.to_be_bytes());
        self.output.extend_from_slice(packet);
        self.flush()?;
        Ok(true)
    }

    pub fn flush(&mut self) -> io::Result<()> {
        let mut written = 0;
        let result = loop {
            if written == self.output.len() {
                break Ok(());
            }
            match self.stream.write(&self.output[written..]) {
                Ok(0) => break Err(io::Error::from(io::ErrorKind::WriteZero)),
                Ok(n) => written += n,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break Ok(()),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => break Err(e),
            }
        };
        self.output.drain(..written);
        result
    }

    pub fn pending_output(&self) -> usize {
        self.output.len()
    }

    /// Close once everything queued so far has been written.
    pub fn close_after_flush(&mut self) {
        self.close_after_flush = true;
    }

    pub fn should_close(&self) -> bool {
        self.close_after_flush && self.output.is_empty()
    }
}
