//! Media framing and RTP packetization.
//!
//! A playable file is described by a [`MediaFormat`]: it probes the file
//! into one [`TrackInfo`] per elementary stream and opens an independent
//! [`MediaPipeline`] (frame source + packetizer) for every client that sets
//! a track up.
//!
//! ## Supported formats
//!
//! | Suffix | Module | RTP payload format |
//! |--------|--------|--------------------|
//! | `.264` | [`h264`] | [RFC 6184](https://tools.ietf.org/html/rfc6184) |
//! | `.265` | [`h265`] | [RFC 7798](https://tools.ietf.org/html/rfc7798) |
//! | `.aac` | [`aac`] | [RFC 3640](https://tools.ietf.org/html/rfc3640) AAC-hbr |
//! | `.mp3` | [`mpa`] | [RFC 2250](https://tools.ietf.org/html/rfc2250) §3 |
//! | `.wav` | [`wav`] | [RFC 3551](https://tools.ietf.org/html/rfc3551) L16 |
//! | `.ts`  | [`ts`]  | [RFC 2250](https://tools.ietf.org/html/rfc2250) §2 |
//!
//! Container formats that need a real demuxer (Matroska, Ogg, Program
//! Stream) are not bundled; implement [`MediaFormat`] and register it with
//! [`MediaSourceRegistry::register`](crate::registry::MediaSourceRegistry::register).

pub mod aac;
pub mod annexb;
pub mod h264;
pub mod h265;
pub mod index;
pub mod mpa;
pub mod rtcp;
pub mod rtp;
pub mod ts;
pub mod wav;

use std::io;
use std::path::Path;

use crate::error::LookupError;
use rtp::RtpHeader;

/// One timestamped unit pulled from a file: an access unit, an audio frame,
/// or a run of transport stream packets.
#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
    pub data: Vec<u8>,
    /// Presentation time in seconds from the start of the file.
    pub pts: f64,
    /// Seconds until the next frame at normal speed.
    pub duration: f64,
    pub keyframe: bool,
}

/// Pull-based producer of frames for one track.
///
/// Reads are bounded (a few tens of KiB per call) because they run on the
/// scheduler thread.
pub trait FrameSource: Send {
    /// Next frame in delivery order, or `None` at end of stream.
    fn next_frame(&mut self) -> io::Result<Option<Frame>>;

    /// Go back to the beginning of the stream.
    fn rewind(&mut self) -> io::Result<()>;

    /// Reposition to `npt` seconds.
    ///
    /// Returns the position actually reached, or `None` when this source
    /// cannot seek there and kept its current position. Without an index
    /// only a rewind to the start is possible.
    fn seek(&mut self, npt: f64) -> io::Result<Option<f64>> {
        if npt <= 0.0 {
            self.rewind()?;
            Ok(Some(0.0))
        } else {
            Ok(None)
        }
    }

    /// Request a trick-play rate. Returns the rate that will be used.
    fn set_scale(&mut self, _scale: f32) -> f32 {
        1.0
    }
}

/// Codec-specific RTP packetizer.
///
/// Each supported codec implements this trait. The generic RTP header is
/// handled by [`rtp::RtpHeader`]; packetizers compose it rather than
/// reimplementing header serialization.
pub trait Packetizer: Send {
    /// Packetize one frame into complete RTP packets (12-byte header plus
    /// codec payload), fragmenting per the codec's rules. Every packet of
    /// the frame carries `rtp_timestamp`.
    fn packetize(&mut self, frame: &[u8], rtp_timestamp: u32) -> Vec<Vec<u8>>;

    /// RTP header state: sequence number, SSRC, and sender statistics.
    fn header(&self) -> &RtpHeader;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MediaKind {
    Video,
    Audio,
}

impl MediaKind {
    /// Media type token for the SDP `m=` line.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Video => "video",
            Self::Audio => "audio",
        }
    }
}

/// Static description of one track, derived when the file is probed.
#[derive(Debug, Clone, PartialEq)]
pub struct TrackInfo {
    pub kind: MediaKind,
    /// Encoding name for `a=rtpmap` (e.g. `H264`, `MPEG4-GENERIC`).
    pub encoding: String,
    pub clock_rate: u32,
    pub channels: Option<u16>,
    pub payload_type: u8,
    /// Parameters for `a=fmtp`, without the payload type prefix.
    pub fmtp: Option<String>,
    /// Length in seconds, when known.
    pub duration: Option<f64>,
    /// Seeking to arbitrary positions and non-1.0 scale are available.
    pub trick_play: bool,
}

impl TrackInfo {
    pub fn new(kind: MediaKind, encoding: &str, clock_rate: u32, payload_type: u8) -> Self {
        Self {
            kind,
            encoding: encoding.to_string(),
            clock_rate,
            channels: None,
            payload_type,
            fmtp: None,
            duration: None,
            trick_play: false,
        }
    }

    /// `a=rtpmap` value: `<pt> <encoding>/<clock>[/<channels>]`.
    pub fn rtpmap(&self) -> String {
        match self.channels {
            Some(channels) => format!(
                "{} {}/{}/{}",
                self.payload_type, self.encoding, self.clock_rate, channels
            ),
            None => format!("{} {}/{}", self.payload_type, self.encoding, self.clock_rate),
        }
    }
}

/// A freshly opened, independent delivery pipeline for one track.
pub struct MediaPipeline {
    pub source: Box<dyn FrameSource>,
    pub packetizer: Box<dyn Packetizer>,
}

/// Knows how to turn a file of one format into tracks and pipelines.
pub trait MediaFormat: Send + Sync {
    /// Short human-readable format name, used in logs.
    fn name(&self) -> &'static str;

    /// Read enough of `path` to describe its tracks (codec parameters,
    /// duration, seekability).
    fn probe(&self, path: &Path) -> Result<Vec<TrackInfo>, LookupError>;

    /// Open a new pipeline for `track`, reading `path` from the start.
    fn open(
        &self,
        path: &Path,
        track: &TrackInfo,
        max_packet_size: usize,
    ) -> Result<MediaPipeline, LookupError>;
}

/// File name used in lookup errors and logs.
pub(crate) fn display_name(path: &Path) -> String {
    path.file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string())
}
