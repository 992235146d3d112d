use crate::error::{Result, RtspError};

/// Delivery method chosen from a client's `Transport` header (RFC 2326 §12.39).
///
/// ## Wire format examples
///
/// ```text
/// Client → Server:
///   Transport: RTP/AVP;unicast;client_port=8000-8001
///   Transport: RTP/AVP/TCP;unicast;interleaved=0-1
///   Transport: RTP/AVP;multicast,RTP/AVP;unicast;client_port=8000-8001
///
/// Server → Client:
///   Transport: RTP/AVP;unicast;client_port=8000-8001;server_port=6970-6971
///   Transport: RTP/AVP/TCP;unicast;interleaved=0-1
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportSpec {
    /// RTP and RTCP over UDP to the client's port pair.
    Udp {
        client_rtp_port: u16,
        client_rtcp_port: u16,
    },
    /// RTP and RTCP framed with `$` on the RTSP connection. `None` lets the
    /// server pick the next free channel pair.
    Interleaved { channels: Option<(u8, u8)> },
}

impl TransportSpec {
    /// Parse a `Transport` header value. Alternatives are separated by
    /// commas; the first one the server can serve wins.
    ///
    /// ```
    /// use media_server::session::transport::TransportSpec;
    ///
    /// let spec = TransportSpec::parse("RTP/AVP;unicast;client_port=8000-8001").unwrap();
    /// assert_eq!(spec, TransportSpec::Udp { client_rtp_port: 8000, client_rtcp_port: 8001 });
    ///
    /// assert!(TransportSpec::parse("RTP/AVP;multicast").is_err());
    /// ```
    pub fn parse(header: &str) -> Result<Self> {
        let mut last_error = None;
        for alternative in header.split(',') {
            match Self::parse_one(alternative) {
                Ok(spec) => return Ok(spec),
                Err(reason) => last_error = Some(reason),
            }
        }
        Err(RtspError::UnsupportedTransport(
            last_error.unwrap_or_else(|| "empty Transport header".to_string()),
        ))
    }

    fn parse_one(alternative: &str) -> std::result::Result<Self, String> {
        let mut params = alternative.split(';').map(str::trim);
        let protocol = params.next().unwrap_or("").to_ascii_uppercase();
        let tcp = match protocol.as_str() {
            "RTP/AVP" | "RTP/AVP/UDP" => false,
            "RTP/AVP/TCP" => true,
            "" => return Err("empty transport".to_string()),
            other => return Err(format!("unknown protocol {other}")),
        };

        let mut client_ports = None;
        let mut channels = None;
        for param in params {
            let (key, value) = match param.split_once('=') {
                Some((key, value)) => (key.trim(), Some(value.trim())),
                None => (param, None),
            };
            match (key.to_ascii_lowercase().as_str(), value) {
                ("multicast", _) => return Err("multicast delivery".to_string()),
                ("client_port", Some(value)) => {
                    client_ports = Some(parse_pair::<u16>(value).ok_or("bad client_port")?);
                }
                ("interleaved", Some(value)) => {
                    channels = Some(parse_pair::<u8>(value).ok_or("bad interleaved")?);
                }
                ("mode", Some(value)) if value.to_ascii_uppercase().contains("RECORD") => {
                    return Err("record mode".to_string());
                }
                _ => {}
            }
        }

        if tcp {
            return Ok(Self::Interleaved { channels });
        }
        match client_ports {
            Some((client_rtp_port, client_rtcp_port)) => Ok(Self::Udp {
                client_rtp_port,
                client_rtcp_port,
            }),
            None => Err("UDP transport without client_port".to_string()),
        }
    }
}

/// `a-b`, or a lone `a` meaning `a-(a+1)`.
fn parse_pair<T>(value: &str) -> Option<(T, T)>
where
    T: std::str::FromStr + Copy + TryFrom<u32>,
    u32: From<T>,
{
    match value.split_once('-') {
        Some((a, b)) => Some((a.trim().parse().ok()?, b.trim().parse().ok()?)),
        None => {
            let a: T = value.parse().ok()?;
            let b = T::try_from(u32::from(a) + 1).ok()?;
            Some((a, b))
        }
    }
}
