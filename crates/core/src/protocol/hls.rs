//! HTTP Live Streaming of indexed transport streams.
//!
//! Served on the RTSP-over-HTTP port next to tunneling, for `.ts` files
//! that have a `.tsx` index:
//!
//! ```text
//! GET /movie.ts.m3u8 HTTP/1.1                  ← VOD playlist
//! GET /movie.ts?segment=20.000,10.000 HTTP/1.1  ← segment: start, duration (s)
//! ```
//!
//! Segments begin on key frames. Every segment after the first is
//! prefixed with the file's PAT and PMT so it can be decoded on its own.

use std::fmt::Write as _;
use std::fs::File;
use std::io::{self, BufReader, Read, Seek, SeekFrom};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use percent_encoding::{AsciiSet, CONTROLS, utf8_percent_encode};

use super::response::SERVER_AGENT;
use crate::error::LookupError;
use crate::media::index::TsIndex;
use crate::media::ts::{self, TS_PACKET_LEN};
use crate::media_session::{ServerMediaSession, parse_stream_url};

pub const PLAYLIST_SUFFIX: &str = ".m3u8";
pub const PLAYLIST_CONTENT_TYPE: &str = "application/vnd.apple.mpegurl";
pub const SEGMENT_CONTENT_TYPE: &str = "video/mp2t";

/// Packets searched for the PAT and PMT.
const PROGRAM_TABLE_PACKETS: usize = 4096;
/// Slack when matching a requested segment start printed with 3 decimals.
const START_TOLERANCE: f64 = 0.001;

/// Characters escaped in segment URLs. `/` is kept so that names in
/// subdirectories stay readable.
const SEGMENT_PATH: &AsciiSet = &CONTROLS
    .add(b' ')
    .add(b'"')
    .add(b'#')
    .add(b'%')
    .add(b'<')
    .add(b'>')
    .add(b'?')
    .add(b'`')
    .add(b'{')
    .add(b'}');

#[derive(Debug, Clone, PartialEq)]
pub enum HlsRequest {
    Playlist { name: String },
    Segment { name: String, start: f64 },
}

impl HlsRequest {
    /// `None` for URLs that are neither a playlist nor a segment.
    pub fn parse(uri: &str) -> Option<Self> {
        let (path, query) = match uri.split_once('?') {
            Some((path, query)) => (path, Some(query)),
            None => (uri, None),
        };
        let path = match path.strip_prefix("http://") {
            Some(after) => &after[after.find('/')?..],
            None => path,
        };
        let stream = parse_stream_url(path)?;
        if stream.track.is_some() {
            return None;
        }
        if let Some(name) = stream.name.strip_suffix(PLAYLIST_SUFFIX) {
            return (!name.is_empty()).then(|| Self::Playlist {
                name: name.to_string(),
            });
        }
        let segment = query?
            .split('&')
            .find_map(|pair| pair.strip_prefix("segment="))?;
        let start = segment
            .split(',')
            .next()?
            .trim()
            .parse::<f64>()
            .ok()
            .filter(|start| start.is_finite() && *start >= 0.0)?;
        Some(Self::Segment {
            name: stream.name,
            start,
        })
    }

    pub fn name(&self) -> &str {
        match self {
            Self::Playlist { name } | Self::Segment { name, .. } => name,
        }
    }
}

/// A run of whole transport packets starting on a key frame.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Segment {
    pub start: f64,
    pub duration: f64,
    pub first_packet: u64,
    /// First packet of the next segment; `None` runs to end of file.
    pub end_packet: Option<u64>,
}

/// Cut the indexed stream at key frames, each cut at least `target` after
/// the previous one. The first segment always starts at packet 0.
pub fn segments(index: &TsIndex, target: Duration) -> Vec<Segment> {
    let target = target.as_secs_f64();
    let mut cuts: Vec<(f64, u64)> = Vec::new();
    for span in index.keyframe_spans() {
        match cuts.last() {
            Some(&(start, _)) if span.pcr - start < target => {}
            Some(_) => cuts.push((span.pcr, span.packet)),
            None => cuts.push((0.0, 0)),
        }
    }
    let total = index.duration().unwrap_or(0.0);
    cuts.iter()
        .enumerate()
        .map(|(i, &(start, first_packet))| {
            let next = cuts.get(i + 1);
            let end = next.map_or(total, |&(pcr, _)| pcr);
            Segment {
                start,
                duration: (end - start).max(0.0),
                first_packet,
                end_packet: next.map(|&(_, packet)| packet),
            }
        })
        .collect()
}

/// The segment a `?segment=<start>` request names.
pub fn find_segment(segments: &[Segment], start: f64) -> Option<&Segment> {
    segments
        .iter()
        .rev()
        .find(|segment| segment.start <= start + START_TOLERANCE)
}

pub fn playlist(name: &str, segments: &[Segment]) -> String {
    let target = segments
        .iter()
        .map(|s| s.duration.ceil() as u64)
        .max()
        .unwrap_or(1)
        .max(1);
    let path = utf8_percent_encode(name, SEGMENT_PATH).to_string();
    let mut out = String::new();
    let _ = write!(
        out,
        "#EXTM3U\n#EXT-X-VERSION:3\n#EXT-X-PLAYLIST-TYPE:VOD\n#EXT-X-INDEPENDENT-SEGMENTS\n#EXT-X-TARGETDURATION:{target}\n#EXT-X-MEDIA-SEQUENCE:0\n"
    );
    for segment in segments {
        let _ = write!(
            out,
            "#EXTINF:{:.3},\n/{}?segment={:.3},{:.3}\n",
            segment.duration, path, segment.start, segment.duration
        );
    }
    out.push_str("#EXT-X-ENDLIST\n");
    out
}

/// Bytes of `segment`, with `tables` in front unless it starts the file.
pub fn read_segment(path: &Path, segment: &Segment, tables: &[u8]) -> io::Result<Vec<u8>> {
    let mut file = File::open(path)?;
    file.seek(SeekFrom::Start(segment.first_packet * TS_PACKET_LEN as u64))?;
    let mut out = Vec::new();
    if segment.first_packet > 0 {
        out.extend_from_slice(tables);
    }
    match segment.end_packet {
        Some(end) => {
            let len = end.saturating_sub(segment.first_packet) * TS_PACKET_LEN as u64;
            file.take(len).read_to_end(&mut out)?;
        }
        None => {
            file.read_to_end(&mut out)?;
        }
    }
    Ok(out)
}

/// Answer an HLS request. `resolve` turns a stream name into its media
/// session; only transport streams with an index are served.
pub fn respond<F>(request: &HlsRequest, target: Duration, resolve: F) -> Vec<u8>
where
    F: FnOnce(&str) -> Result<Arc<ServerMediaSession>, LookupError>,
{
    let name = request.name();
    let media = match resolve(name) {
        Ok(media) => media,
        Err(e) => {
            tracing::debug!(stream = name, error = %e, "HLS lookup failed");
            return http_response(e.status_code(), None, &[]);
        }
    };
    if media.tracks().first().is_none_or(|t| t.encoding != "MP2T") {
        tracing::debug!(stream = name, "HLS requested for a stream that is not a transport stream");
        return http_response(404, None, &[]);
    }
    let index = match TsIndex::load(&TsIndex::sidecar_path(media.path())) {
        Ok(index) => index,
        Err(e) => {
            tracing::debug!(stream = name, error = %e, "HLS requires an index");
            return http_response(404, None, &[]);
        }
    };
    let plan = segments(&index, target);

    match request {
        HlsRequest::Playlist { name } => {
            tracing::debug!(stream = %name, segments = plan.len(), "HLS playlist");
            http_response(200, Some(PLAYLIST_CONTENT_TYPE), playlist(name, &plan).as_bytes())
        }
        HlsRequest::Segment { name, start } => {
            let Some(segment) = find_segment(&plan, *start) else {
                return http_response(404, None, &[]);
            };
            let served = File::open(media.path())
                .and_then(|file| ts::program_tables(BufReader::new(file), PROGRAM_TABLE_PACKETS))
                .and_then(|tables| read_segment(media.path(), segment, &tables));
            match served {
                Ok(body) => {
                    tracing::debug!(stream = %name, start = segment.start, bytes = body.len(), "HLS segment");
                    http_response(200, Some(SEGMENT_CONTENT_TYPE), &body)
                }
                Err(e) => {
                    tracing::warn!(stream = %name, error = %e, "HLS segment read failed");
                    http_response(500, None, &[])
                }
            }
        }
    }
}

/// An HTTP/1.1 reply that closes the connection after `body`.
pub fn http_response(status: u16, content_type: Option<&str>, body: &[u8]) -> Vec<u8> {
    let reason = match status {
        200 => "OK",
        400 => "Bad Request",
        404 => "Not Found",
        _ => "Internal Server Error",
    };
    let mut head = format!("HTTP/1.1 {status} {reason}\r\nServer: {SERVER_AGENT}\r\nConnection: close\r\n");
    if let Some(content_type) = content_type {
        let _ = write!(head, "Content-Type: {content_type}\r\n");
    }
    let _ = write!(head, "Content-Length: {}\r\n\r\n", body.len());
    let mut out = head.into_bytes();
    out.extend_from_slice(body);
    out
}
