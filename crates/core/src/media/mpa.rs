//! MPEG-1/2 audio (layers I–III) sent per RFC 2250 §3, static payload type
//! 14 with a 90 kHz clock.

use std::fs::File;
use std::io::{self, BufReader, Read, Seek, SeekFrom};
use std::path::Path;

use super::rtp::{RtpHeader, chunks_with_last};
use super::{
    Frame, FrameSource, MediaFormat, MediaKind, MediaPipeline, Packetizer, TrackInfo,
    display_name,
};
use crate::error::LookupError;

pub const PAYLOAD_TYPE: u8 = 14;
const CLOCK_RATE: u32 = 90000;
/// Bytes scanned for the next sync word before giving up.
const RESYNC_LIMIT: usize = 64 * 1024;

const BITRATES_V1: [[u32; 15]; 3] = [
    [0, 32, 64, 96, 128, 160, 192, 224, 256, 288, 320, 352, 384, 416, 448],
    [0, 32, 48, 56, 64, 80, 96, 112, 128, 160, 192, 224, 256, 320, 384],
    [0, 32, 40, 48, 56, 64, 80, 96, 112, 128, 160, 192, 224, 256, 320],
];
const BITRATES_V2: [[u32; 15]; 2] = [
    [0, 32, 48, 56, 64, 80, 96, 112, 128, 144, 160, 176, 192, 224, 256],
    [0, 8, 16, 24, 32, 40, 48, 56, 64, 80, 96, 112, 128, 144, 160],
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Version {
    Mpeg1,
    Mpeg2,
    Mpeg25,
}

/// A decoded 4-byte MPEG audio frame header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MpaHeader {
    version: Version,
    /// 1, 2 or 3.
    pub layer: u8,
    pub bitrate_kbps: u32,
    pub sample_rate: u32,
    pub channels: u16,
    padding: bool,
}

impl MpaHeader {
    pub fn parse(bytes: &[u8]) -> Option<Self> {
        if bytes.len() < 4 || bytes[0] != 0xFF || bytes[1] & 0xE0 != 0xE0 {
            return None;
        }
        let version = match (bytes[1] >> 3) & 0x03 {
            3 => Version::Mpeg1,
            2 => Version::Mpeg2,
            0 => Version::Mpeg25,
            _ => return None,
        };
        let layer = match (bytes[1] >> 1) & 0x03 {
            3 => 1,
            2 => 2,
            1 => 3,
            _ => return None,
        };
        let bitrate_index = usize::from(bytes[2] >> 4);
        let rate_index = usize::from((bytes[2] >> 2) & 0x03);
        if bitrate_index == 0 || bitrate_index == 15 || rate_index == 3 {
            return None;
        }
        let bitrate_kbps = match version {
            Version::Mpeg1 => BITRATES_V1[usize::from(layer - 1)][bitrate_index],
            _ => BITRATES_V2[usize::from(layer != 1)][bitrate_index],
        };
        let base_rate = [44100, 48000, 32000][rate_index];
        let sample_rate = match version {
            Version::Mpeg1 => base_rate,
            Version::Mpeg2 => base_rate / 2,
            Version::Mpeg25 => base_rate / 4,
        };
        Some(Self {
            version,
            layer,
            bitrate_kbps,
            sample_rate,
            channels: if bytes[3] >> 6 == 3 { 1 } else { 2 },
            padding: (bytes[2] >> 1) & 0x01 == 1,
        })
    }

    pub fn samples_per_frame(&self) -> u32 {
        match (self.layer, self.version) {
            (1, _) => 384,
            (3, Version::Mpeg2 | Version::Mpeg25) => 576,
            _ => 1152,
        }
    }

    /// Whole frame length in bytes, header included.
    pub fn frame_len(&self) -> usize {
        let bitrate = self.bitrate_kbps * 1000;
        let padding = u32::from(self.padding);
        let len = if self.layer == 1 {
            (12 * bitrate / self.sample_rate + padding) * 4
        } else {
            self.samples_per_frame() / 8 * bitrate / self.sample_rate + padding
        };
        len as usize
    }

    pub fn frame_duration(&self) -> f64 {
        f64::from(self.samples_per_frame()) / f64::from(self.sample_rate)
    }
}

/// Length of a leading ID3v2 tag, or 0.
pub fn id3v2_len(bytes: &[u8]) -> usize {
    if bytes.len() < 10 || &bytes[..3] != b"ID3" {
        return 0;
    }
    let size = bytes[6..10]
        .iter()
        .fold(0usize, |acc, b| (acc << 7) | usize::from(b & 0x7F));
    let footer = if bytes[5] & 0x10 != 0 { 10 } else { 0 };
    10 + size + footer
}

pub struct MpaSource<R> {
    reader: R,
    start: u64,
    pts: f64,
}

impl<R: Read + Seek> MpaSource<R> {
    /// `start` is the offset of the first frame (past any ID3v2 tag).
    pub fn new(reader: R, start: u64) -> Self {
        Self {
            reader,
            start,
            pts: 0.0,
        }
    }

    /// Find the next frame header, sliding one byte at a time over garbage.
    fn sync(&mut self) -> io::Result<Option<(MpaHeader, [u8; 4])>> {
        let mut window = [0u8; 4];
        if !read_fully(&mut self.reader, &mut window)? {
            return Ok(None);
        }
        for _ in 0..RESYNC_LIMIT {
            if let Some(header) = MpaHeader::parse(&window) {
                return Ok(Some((header, window)));
            }
            let mut next = [0u8; 1];
            if !read_fully(&mut self.reader, &mut next)? {
                return Ok(None);
            }
            window.rotate_left(1);
            window[3] = next[0];
        }
        tracing::debug!("no MPEG audio sync word found; treating as end of stream");
        Ok(None)
    }
}

fn read_fully(reader: &mut impl Read, buf: &mut [u8]) -> io::Result<bool> {
    match reader.read_exact(buf) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => Ok(false),
        Err(e) => Err(e),
    }
}

impl<R: Read + Seek + Send> FrameSource for MpaSource<R> {
    fn next_frame(&mut self) -> io::Result<Option<Frame>> {
        let Some((header, head)) = self.sync()? else {
            return Ok(None);
        };
        let len = header.frame_len().max(4);
        let mut data = vec![0u8; len];
        data[..4].copy_from_slice(&head);
        if !read_fully(&mut self.reader, &mut data[4..])? {
            return Ok(None);
        }
        let duration = header.frame_duration();
        let pts = self.pts;
        self.pts += duration;
        Ok(Some(Frame {
            data,
            pts,
            duration,
            keyframe: true,
        }))
    }

    fn rewind(&mut self) -> io::Result<()> {
        self.reader.seek(SeekFrom::Start(self.start))?;
        self.pts = 0.0;
        Ok(())
    }
}

/// RFC 2250 §3.5: a 4-byte header (16 bits MBZ, 16-bit fragment offset)
/// precedes each frame or frame fragment.
#[derive(Debug)]
pub struct MpaPacketizer {
    header: RtpHeader,
    max_payload: usize,
}

impl MpaPacketizer {
    pub fn new(header: RtpHeader, max_payload: usize) -> Self {
        Self {
            header,
            max_payload,
        }
    }
}

impl Packetizer for MpaPacketizer {
    fn packetize(&mut self, frame: &[u8], rtp_timestamp: u32) -> Vec<Vec<u8>> {
        self.header.set_timestamp(rtp_timestamp);
        let max = self.max_payload.saturating_sub(4);
        chunks_with_last(frame, max)
            .map(|(offset, chunk, _)| {
                let offset = (offset as u16).to_be_bytes();
                self.header
                    .packet(false, &[&[0, 0, offset[0], offset[1]], chunk])
            })
            .collect()
    }

    fn header(&self) -> &RtpHeader {
        &self.header
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct MpaFormat;

struct Probe {
    start: u64,
    header: MpaHeader,
    file_len: u64,
}

fn probe_file(path: &Path) -> Result<Probe, LookupError> {
    let name = display_name(path);
    let mut file = File::open(path).map_err(|e| LookupError::io(&name, &e))?;
    let file_len = file
        .metadata()
        .map_err(|e| LookupError::io(&name, &e))?
        .len();

    let mut tag = [0u8; 10];
    let start = match file.read_exact(&mut tag) {
        Ok(()) => id3v2_len(&tag) as u64,
        Err(_) => 0,
    };
    file.seek(SeekFrom::Start(start))
        .map_err(|e| LookupError::io(&name, &e))?;

    let mut source = MpaSource::new(BufReader::new(file), start);
    match source.sync() {
        Ok(Some((header, _))) => Ok(Probe {
            start,
            header,
            file_len,
        }),
        Ok(None) => Err(LookupError::malformed(&name, "no MPEG audio frame found")),
        Err(e) => Err(LookupError::io(&name, &e)),
    }
}

impl MediaFormat for MpaFormat {
    fn name(&self) -> &'static str {
        "MPEG audio"
    }

    fn probe(&self, path: &Path) -> Result<Vec<TrackInfo>, LookupError> {
        let probe = probe_file(path)?;
        let mut track = TrackInfo::new(MediaKind::Audio, "MPA", CLOCK_RATE, PAYLOAD_TYPE);
        // Constant bitrate estimate.
        let bytes = probe.file_len.saturating_sub(probe.start) as f64;
        track.duration = Some(bytes * 8.0 / (f64::from(probe.header.bitrate_kbps) * 1000.0));
        Ok(vec![track])
    }

    fn open(
        &self,
        path: &Path,
        track: &TrackInfo,
        max_packet_size: usize,
    ) -> Result<MediaPipeline, LookupError> {
        let probe = probe_file(path)?;
        let mut file = File::open(path).map_err(|e| LookupError::io(&display_name(path), &e))?;
        file.seek(SeekFrom::Start(probe.start))
            .map_err(|e| LookupError::io(&display_name(path), &e))?;
        Ok(MediaPipeline {
            source: Box::new(MpaSource::new(BufReader::new(file), probe.start)),
            packetizer: Box::new(MpaPacketizer::new(
                RtpHeader::with_random_ssrc(track.payload_type),
                max_packet_size,
            )),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    /// MPEG-1 layer III, 128 kbps, 44.1 kHz, stereo, no padding: 417 bytes.
    fn mp3_frame() -> Vec<u8> {
        let mut frame = vec![0xFF, 0xFB, 0x90, 0x00];
        frame.resize(417, 0x55);
        frame
    }

    #[test]
    fn parses_layer3_header() {
        let h = MpaHeader::parse(&mp3_frame()).unwrap();
        assert_eq!(h.layer, 3);
        assert_eq!(h.bitrate_kbps, 128);
        assert_eq!(h.sample_rate, 44100);
        assert_eq!(h.channels, 2);
        assert_eq!(h.frame_len(), 417);
        assert_eq!(h.samples_per_frame(), 1152);
    }

    #[test]
    fn id3v2_tag_length() {
        let tag = [b'I', b'D', b'3', 4, 0, 0, 0, 0, 0x01, 0x7F];
        assert_eq!(id3v2_len(&tag), 10 + 255);
        assert_eq!(id3v2_len(&mp3_frame()), 0);
    }

    #[test]
    fn source_resyncs_over_garbage() {
        let mut data = vec![0x00, 0x12, 0x34];
        data.extend(mp3_frame());
        data.extend(mp3_frame());
        let mut source = MpaSource::new(Cursor::new(data), 0);

        let first = source.next_frame().unwrap().unwrap();
        assert_eq!(first.data.len(), 417);
        assert_eq!(&first.data[..2], &[0xFF, 0xFB]);
        let second = source.next_frame().unwrap().unwrap();
        assert!((second.pts - 1152.0 / 44100.0).abs() < 1e-9);
        assert!(source.next_frame().unwrap().is_none());
    }

    #[test]
    fn fragments_carry_offsets() {
        let mut p = MpaPacketizer::new(RtpHeader::new(PAYLOAD_TYPE, 1), 204);
        let packets = p.packetize(&mp3_frame(), 0);
        assert_eq!(packets.len(), 3);
        let offsets: Vec<u16> = packets
            .iter()
            .map(|p| u16::from_be_bytes([p[14], p[15]]))
            .collect();
        assert_eq!(offsets, vec![0, 200, 400]);
        assert_eq!(packets[0][1] & 0x7F, PAYLOAD_TYPE);
    }
}
