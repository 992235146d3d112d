use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::ops::RangeInclusive;
use std::path::PathBuf;
use std::time::Duration;

/// Default RTSP listening port (RFC 2326 §3.2).
pub const DEFAULT_RTSP_PORT: u16 = 554;

/// Candidate ports for RTSP-over-HTTP tunneling, tried in order.
pub const DEFAULT_TUNNEL_PORTS: [u16; 3] = [80, 8000, 8080];

/// Default session timeout advertised in the `Session` header.
pub const DEFAULT_SESSION_TIMEOUT_SECS: u64 = 65;

/// Server-level configuration consumed by the listener, the protocol
/// handler, and the media pipelines.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Interface to bind. When `None`, all interfaces are used.
    pub listen_addr: Option<IpAddr>,
    /// RTSP listening TCP port.
    pub rtsp_port: u16,
    /// Directory that stream names are resolved against.
    pub media_root: PathBuf,
    /// RTSP-over-HTTP tunneling candidates; the first that binds is used.
    pub tunnel_ports: Vec<u16>,
    /// Shortest HTTP Live Streaming segment; segments are cut at the first
    /// key frame at least this far from the previous cut.
    pub hls_segment_duration: Duration,
    /// Liveness window: a session with no request or RTCP traffic for this
    /// long is torn down.
    pub session_timeout: Duration,
    /// How long an unreferenced media session stays cached before eviction.
    pub idle_grace: Duration,
    /// Server-side UDP ports handed out for RTP (even) / RTCP (odd).
    pub rtp_port_range: RangeInclusive<u16>,
    /// Maximum RTP payload size before codec fragmentation kicks in.
    pub max_packet_size: usize,
    /// Public host advertised in SDP `o=` and `c=` lines.
    /// When `None`, host is inferred from the request URI or local address.
    pub public_host: Option<String>,
    /// SDP origin username field (`o=<username> ...`).
    pub sdp_username: String,
    /// `(username, password)` pairs. Empty disables authentication.
    pub credentials: Vec<(String, String)>,
    /// Digest authentication realm.
    pub auth_realm: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: None,
            rtsp_port: DEFAULT_RTSP_PORT,
            media_root: PathBuf::from("."),
            tunnel_ports: DEFAULT_TUNNEL_PORTS.to_vec(),
            hls_segment_duration: Duration::from_secs(10),
            session_timeout: Duration::from_secs(DEFAULT_SESSION_TIMEOUT_SECS),
            idle_grace: Duration::from_secs(10),
            rtp_port_range: 6970..=32767,
            max_packet_size: 1400,
            public_host: None,
            sdp_username: "-".to_string(),
            credentials: Vec::new(),
            auth_realm: "rtsp-media-server".to_string(),
        }
    }
}

impl ServerConfig {
    /// Address the RTSP listener binds.
    pub fn rtsp_bind_addr(&self) -> SocketAddr {
        SocketAddr::new(self.bind_ip(), self.rtsp_port)
    }

    /// IP used for every listener and RTP socket.
    pub fn bind_ip(&self) -> IpAddr {
        self.listen_addr.unwrap_or(IpAddr::V4(Ipv4Addr::UNSPECIFIED))
    }

    pub fn requires_auth(&self) -> bool {
        !self.credentials.is_empty()
    }
}
