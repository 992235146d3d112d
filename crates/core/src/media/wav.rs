//! 16-bit PCM WAV files sent as `L16` (RFC 3551 §4.5.11).
//!
//! Samples are byte-swapped to network order. 44.1 kHz stereo and mono use
//! the static payload types 10 and 11; everything else is dynamic.

use std::fs::File;
use std::io::{self, BufReader, Read, Seek, SeekFrom};
use std::path::Path;

use super::rtp::RtpHeader;
use super::{
    Frame, FrameSource, MediaFormat, MediaKind, MediaPipeline, Packetizer, TrackInfo,
    display_name,
};
use crate::error::LookupError;

const DYNAMIC_PAYLOAD_TYPE: u8 = 96;
/// Target packet duration.
const FRAME_SECONDS: f64 = 0.02;

/// Layout of the PCM data chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WavInfo {
    pub sample_rate: u32,
    pub channels: u16,
    pub block_align: u16,
    pub data_offset: u64,
    pub data_len: u64,
}

impl WavInfo {
    pub fn duration(&self) -> f64 {
        self.data_len as f64 / (f64::from(self.sample_rate) * f64::from(self.block_align))
    }

    pub fn payload_type(&self) -> u8 {
        match (self.sample_rate, self.channels) {
            (44100, 2) => 10,
            (44100, 1) => 11,
            _ => DYNAMIC_PAYLOAD_TYPE,
        }
    }
}

fn malformed(reason: &str) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, reason.to_string())
}

/// Walk the RIFF chunks up to `data`.
pub fn parse_header<R: Read + Seek>(reader: &mut R) -> io::Result<WavInfo> {
    let mut riff = [0u8; 12];
    reader.read_exact(&mut riff)?;
    if &riff[..4] != b"RIFF" || &riff[8..] != b"WAVE" {
        return Err(malformed("not a RIFF/WAVE file"));
    }

    let mut format: Option<(u16, u32, u16, u16)> = None;
    loop {
        let mut chunk = [0u8; 8];
        reader.read_exact(&mut chunk)?;
        let len = u32::from_le_bytes([chunk[4], chunk[5], chunk[6], chunk[7]]);
        match &chunk[..4] {
            b"fmt " => {
                if len < 16 {
                    return Err(malformed("short fmt chunk"));
                }
                let mut fmt = vec![0u8; len as usize];
                reader.read_exact(&mut fmt)?;
                let audio_format = u16::from_le_bytes([fmt[0], fmt[1]]);
                let channels = u16::from_le_bytes([fmt[2], fmt[3]]);
                let sample_rate = u32::from_le_bytes([fmt[4], fmt[5], fmt[6], fmt[7]]);
                let block_align = u16::from_le_bytes([fmt[12], fmt[13]]);
                let bits = u16::from_le_bytes([fmt[14], fmt[15]]);
                if audio_format != 1 || bits != 16 {
                    return Err(malformed("only 16-bit PCM is supported"));
                }
                if channels == 0 || sample_rate == 0 || block_align != channels * 2 {
                    return Err(malformed("inconsistent fmt chunk"));
                }
                format = Some((channels, sample_rate, block_align, bits));
                if len % 2 == 1 {
                    reader.seek(SeekFrom::Current(1))?;
                }
            }
            b"data" => {
                let (channels, sample_rate, block_align, _) =
                    format.ok_or_else(|| malformed("data chunk before fmt chunk"))?;
                let data_offset = reader.stream_position()?;
                let end = reader.seek(SeekFrom::End(0))?;
                let data_len = u64::from(len).min(end.saturating_sub(data_offset));
                reader.seek(SeekFrom::Start(data_offset))?;
                return Ok(WavInfo {
                    sample_rate,
                    channels,
                    block_align,
                    data_offset,
                    data_len: data_len - data_len % u64::from(block_align),
                });
            }
            _ => {
                let skip = i64::from(len) + i64::from(len % 2);
                reader.seek(SeekFrom::Current(skip))?;
            }
        }
    }
}

pub struct PcmSource<R> {
    reader: R,
    info: WavInfo,
    frame_bytes: usize,
    position: u64,
}

impl<R: Read + Seek> PcmSource<R> {
    /// `reader` must be positioned at the start of the data chunk.
    pub fn new(reader: R, info: WavInfo, max_payload: usize) -> Self {
        let block = usize::from(info.block_align);
        let target = (f64::from(info.sample_rate) * FRAME_SECONDS) as usize * block;
        let limit = (max_payload / block).max(1) * block;
        Self {
            reader,
            info,
            frame_bytes: target.clamp(block, limit),
            position: 0,
        }
    }

    fn seconds(&self, bytes: u64) -> f64 {
        bytes as f64 / (f64::from(self.info.sample_rate) * f64::from(self.info.block_align))
    }
}

impl<R: Read + Seek + Send> FrameSource for PcmSource<R> {
    fn next_frame(&mut self) -> io::Result<Option<Frame>> {
        let remaining = self.info.data_len.saturating_sub(self.position);
        if remaining == 0 {
            return Ok(None);
        }
        let len = remaining.min(self.frame_bytes as u64) as usize;
        let mut data = vec![0u8; len];
        let mut filled = 0;
        while filled < len {
            match self.reader.read(&mut data[filled..])? {
                0 => break,
                n => filled += n,
            }
        }
        data.truncate(filled - filled % usize::from(self.info.block_align));
        if data.is_empty() {
            return Ok(None);
        }
        for sample in data.chunks_exact_mut(2) {
            sample.swap(0, 1);
        }

        let pts = self.seconds(self.position);
        self.position += data.len() as u64;
        Ok(Some(Frame {
            duration: self.seconds(data.len() as u64),
            data,
            pts,
            keyframe: true,
        }))
    }

    fn rewind(&mut self) -> io::Result<()> {
        self.reader.seek(SeekFrom::Start(self.info.data_offset))?;
        self.position = 0;
        Ok(())
    }

    /// PCM is seekable by byte arithmetic.
    fn seek(&mut self, npt: f64) -> io::Result<Option<f64>> {
        let block = u64::from(self.info.block_align);
        let bytes_per_second = f64::from(self.info.sample_rate) * block as f64;
        let target = (npt.max(0.0) * bytes_per_second) as u64;
        let target = (target - target % block).min(self.info.data_len);
        self.reader
            .seek(SeekFrom::Start(self.info.data_offset + target))?;
        self.position = target;
        Ok(Some(self.seconds(target)))
    }
}

/// One PCM frame per packet; the source already sizes frames to fit.
#[derive(Debug)]
pub struct L16Packetizer {
    header: RtpHeader,
}

impl L16Packetizer {
    pub fn new(header: RtpHeader) -> Self {
        Self { header }
    }
}

impl Packetizer for L16Packetizer {
    fn packetize(&mut self, frame: &[u8], rtp_timestamp: u32) -> Vec<Vec<u8>> {
        self.header.set_timestamp(rtp_timestamp);
        if frame.is_empty() {
            return Vec::new();
        }
        vec![self.header.packet(false, &[frame])]
    }

    fn header(&self) -> &RtpHeader {
        &self.header
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct WavFormat;

fn open_info(path: &Path) -> Result<(BufReader<File>, WavInfo), LookupError> {
    let name = display_name(path);
    let file = File::open(path).map_err(|e| LookupError::io(&name, &e))?;
    let mut reader = BufReader::new(file);
    let info = parse_header(&mut reader).map_err(|e| match e.kind() {
        io::ErrorKind::InvalidData | io::ErrorKind::UnexpectedEof => {
            LookupError::malformed(&name, &e.to_string())
        }
        _ => LookupError::io(&name, &e),
    })?;
    Ok((reader, info))
}

impl MediaFormat for WavFormat {
    fn name(&self) -> &'static str {
        "WAV audio (16-bit PCM)"
    }

    fn probe(&self, path: &Path) -> Result<Vec<TrackInfo>, LookupError> {
        let (_, info) = open_info(path)?;
        let mut track = TrackInfo::new(
            MediaKind::Audio,
            "L16",
            info.sample_rate,
            info.payload_type(),
        );
        track.channels = Some(info.channels);
        track.duration = Some(info.duration());
        Ok(vec![track])
    }

    fn open(
        &self,
        path: &Path,
        track: &TrackInfo,
        max_packet_size: usize,
    ) -> Result<MediaPipeline, LookupError> {
        let (reader, info) = open_info(path)?;
        Ok(MediaPipeline {
            source: Box::new(PcmSource::new(reader, info, max_packet_size)),
            packetizer: Box::new(L16Packetizer::new(RtpHeader::with_random_ssrc(
                track.payload_type,
            ))),
        })
    }
}
