//! Network transport layer for RTSP signaling and RTP media delivery.
//!
//! - **TCP** ([`tcp`]): accepted connections carrying RTSP requests and
//!   responses, interleaved RTP/RTCP (RFC 2326 §10.12), or one half of an
//!   RTSP-over-HTTP tunnel. Every socket is non-blocking and driven by the
//!   server's scheduler.
//!
//! - **UDP** ([`udp`]): per-stream server RTP/RTCP socket pairs.

pub mod tcp;
pub mod udp;

pub use tcp::{ClientContext, Connection, Role};
pub use udp::RtpSocketPair;
