//! SDP (Session Description Protocol) generation (RFC 4566 / RFC 8866).
//!
//! Produces the SDP body returned by DESCRIBE responses. The format:
//!
//! ```text
//! v=0                                          ← protocol version
//! o=<user> <sess-id> <sess-ver> IN IP4 <addr>  ← origin
//! s=<session-name>                              ← session name
//! i=<stream-name>                               ← session information
//! c=IN IP4 <addr>                               ← connection address
//! t=0 0                                         ← timing
//! a=tool:rtsp-media-server                      ← server software (§6)
//! a=type:broadcast                              ← conference type (§6)
//! a=control:*                                   ← aggregate control
//! a=range:npt=0-12.480                          ← duration, when known
//! m=video 0 RTP/AVP 96                          ← one media block per track
//! a=rtpmap:96 H264/90000                        ← codec/clock rate
//! a=fmtp:96 packetization-mode=1                ← codec parameters
//! a=control:track1                              ← track control URL
//! ```

use crate::media_session::ServerMediaSession;

/// Origin and connection fields taken from the server configuration.
#[derive(Debug, Clone)]
pub struct SdpOrigin<'a> {
    pub username: &'a str,
    pub address: &'a str,
}

/// `npt` range value: `0-<duration>` or open-ended `0-`.
pub fn npt_range(duration: Option<f64>) -> String {
    match duration {
        Some(d) => format!("npt=0-{:.3}", d),
        None => "npt=0-".to_string(),
    }
}

/// Generate the session description for `session`.
pub fn generate_sdp(session: &ServerMediaSession, origin: &SdpOrigin<'_>) -> String {
    let mut sdp: Vec<String> = Vec::new();

    sdp.push("v=0".to_string());
    sdp.push(format!(
        "o={} {} 1 IN IP4 {}",
        origin.username,
        session.origin_id(),
        origin.address
    ));
    sdp.push(format!("s={}", session.description()));
    sdp.push(format!("i={}", session.name()));
    sdp.push(format!("c=IN IP4 {}", origin.address));
    sdp.push("t=0 0".to_string());
    sdp.push("a=tool:rtsp-media-server".to_string());
    sdp.push("a=type:broadcast".to_string());
    sdp.push("a=control:*".to_string());
    sdp.push(format!("a=range:{}", npt_range(session.duration())));

    for (index, track) in session.tracks().iter().enumerate() {
        sdp.push(format!(
            "m={} 0 RTP/AVP {}",
            track.kind.as_str(),
            track.payload_type
        ));
        sdp.push(format!("a=rtpmap:{}", track.rtpmap()));
        if let Some(fmtp) = &track.fmtp {
            sdp.push(format!("a=fmtp:{} {}", track.payload_type, fmtp));
        }
        sdp.push(format!("a=control:track{}", index + 1));
    }

    tracing::debug!(stream = session.name(), "SDP: {}", sdp.join("\r\n"));

    format!("{}\r\n", sdp.join("\r\n"))
}
