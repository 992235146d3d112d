//! AAC in ADTS framing, sent as RFC 3640 `MPEG4-GENERIC` (AAC-hbr).
//!
//! Each ADTS frame holds one access unit of 1024 samples. The ADTS header
//! is stripped and replaced by a 4-byte AU header section:
//!
//! ```text
//! AU-headers-length (16 bits, = 16)
//! AU-size (13 bits) | AU-Index (3 bits)
//! ```

use std::fs::File;
use std::io::{self, BufReader, Read, Seek, SeekFrom};
use std::path::Path;

use super::rtp::{RtpHeader, chunks_with_last};
use super::{
    Frame, FrameSource, MediaFormat, MediaKind, MediaPipeline, Packetizer, TrackInfo,
    display_name,
};
use crate::error::LookupError;

const PAYLOAD_TYPE: u8 = 96;
const SAMPLES_PER_FRAME: f64 = 1024.0;
const AU_HEADER_SECTION_LEN: usize = 4;

const SAMPLING_FREQUENCIES: [u32; 13] = [
    96000, 88200, 64000, 48000, 44100, 32000, 24000, 22050, 16000, 12000, 11025, 8000, 7350,
];

/// Fields of a 7-byte ADTS fixed + variable header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AdtsHeader {
    /// MPEG-4 audio object type (ADTS profile + 1).
    pub object_type: u8,
    pub frequency_index: u8,
    pub channel_config: u8,
    /// Header length: 7, or 9 with CRC.
    pub header_len: usize,
    /// Whole frame length including the header.
    pub frame_len: usize,
}

impl AdtsHeader {
    pub fn parse(bytes: &[u8]) -> Option<Self> {
        if bytes.len() < 7 || bytes[0] != 0xFF || bytes[1] & 0xF0 != 0xF0 {
            return None;
        }
        let protection_absent = bytes[1] & 0x01 == 1;
        let header_len = if protection_absent { 7 } else { 9 };
        let frequency_index = (bytes[2] >> 2) & 0x0F;
        if usize::from(frequency_index) >= SAMPLING_FREQUENCIES.len() {
            return None;
        }
        let frame_len = (usize::from(bytes[3] & 0x03) << 11)
            | (usize::from(bytes[4]) << 3)
            | (usize::from(bytes[5]) >> 5);
        if frame_len <= header_len {
            return None;
        }
        Some(Self {
            object_type: ((bytes[2] >> 6) & 0x03) + 1,
            frequency_index,
            channel_config: ((bytes[2] & 0x01) << 2) | (bytes[3] >> 6),
            header_len,
            frame_len,
        })
    }

    pub fn sampling_frequency(&self) -> u32 {
        SAMPLING_FREQUENCIES[usize::from(self.frequency_index)]
    }

    /// AudioSpecificConfig as hex, for the `config=` fmtp parameter.
    pub fn audio_specific_config(&self) -> String {
        let config: u16 = (u16::from(self.object_type) << 11)
            | (u16::from(self.frequency_index) << 7)
            | (u16::from(self.channel_config) << 3);
        format!("{:04X}", config)
    }

    pub fn fmtp(&self) -> String {
        format!(
            "streamtype=5;profile-level-id=1;mode=AAC-hbr;sizelength=13;indexlength=3;indexdeltalength=3;config={}",
            self.audio_specific_config()
        )
    }
}

/// Reads ADTS frames, emitting raw AAC access units.
pub struct AdtsSource<R> {
    reader: R,
    sample_rate: f64,
    frame_index: u64,
}

impl<R: Read + Seek> AdtsSource<R> {
    pub fn new(reader: R, sample_rate: u32) -> Self {
        Self {
            reader,
            sample_rate: f64::from(sample_rate),
            frame_index: 0,
        }
    }
}

impl<R: Read + Seek + Send> FrameSource for AdtsSource<R> {
    fn next_frame(&mut self) -> io::Result<Option<Frame>> {
        let mut fixed = [0u8; 7];
        match self.reader.read_exact(&mut fixed) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
            Err(e) => return Err(e),
        }
        let Some(header) = AdtsHeader::parse(&fixed) else {
            tracing::debug!("lost ADTS sync; treating as end of stream");
            return Ok(None);
        };

        if header.header_len > fixed.len() {
            let mut crc = [0u8; 2];
            self.reader.read_exact(&mut crc)?;
        }
        let mut data = vec![0u8; header.frame_len - header.header_len];
        match self.reader.read_exact(&mut data) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
            Err(e) => return Err(e),
        }

        let duration = SAMPLES_PER_FRAME / self.sample_rate;
        let pts = self.frame_index as f64 * duration;
        self.frame_index += 1;
        Ok(Some(Frame {
            data,
            pts,
            duration,
            keyframe: true,
        }))
    }

    fn rewind(&mut self) -> io::Result<()> {
        self.reader.seek(SeekFrom::Start(0))?;
        self.frame_index = 0;
        Ok(())
    }
}

#[derive(Debug)]
pub struct AacPacketizer {
    header: RtpHeader,
    max_payload: usize,
}

impl AacPacketizer {
    pub fn new(header: RtpHeader, max_payload: usize) -> Self {
        Self {
            header,
            max_payload,
        }
    }
}

impl Packetizer for AacPacketizer {
    /// One AU per packet; an AU larger than the payload limit is split into
    /// fragments that all carry the full AU-size.
    fn packetize(&mut self, frame: &[u8], rtp_timestamp: u32) -> Vec<Vec<u8>> {
        self.header.set_timestamp(rtp_timestamp);
        if frame.is_empty() {
            return Vec::new();
        }
        let au_size = (frame.len() as u16) & 0x1FFF;
        let au_header = (au_size << 3).to_be_bytes();
        let section = [0x00, 0x10, au_header[0], au_header[1]];

        let max = self.max_payload.saturating_sub(AU_HEADER_SECTION_LEN);
        chunks_with_last(frame, max)
            .map(|(_, chunk, last)| self.header.packet(last, &[&section, chunk]))
            .collect()
    }

    fn header(&self) -> &RtpHeader {
        &self.header
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct AacFormat;

fn read_first_header(path: &Path) -> Result<AdtsHeader, LookupError> {
    let name = display_name(path);
    let mut file = File::open(path).map_err(|e| LookupError::io(&name, &e))?;
    let mut bytes = [0u8; 7];
    file.read_exact(&mut bytes)
        .map_err(|_| LookupError::malformed(&name, "file too short for an ADTS header"))?;
    AdtsHeader::parse(&bytes).ok_or_else(|| LookupError::malformed(&name, "bad ADTS header"))
}

impl MediaFormat for AacFormat {
    fn name(&self) -> &'static str {
        "AAC audio (ADTS)"
    }

    fn probe(&self, path: &Path) -> Result<Vec<TrackInfo>, LookupError> {
        let adts = read_first_header(path)?;
        let mut track = TrackInfo::new(
            MediaKind::Audio,
            "MPEG4-GENERIC",
            adts.sampling_frequency(),
            PAYLOAD_TYPE,
        );
        track.channels = Some(u16::from(adts.channel_config.max(1)));
        track.fmtp = Some(adts.fmtp());
        Ok(vec![track])
    }

    fn open(
        &self,
        path: &Path,
        track: &TrackInfo,
        max_packet_size: usize,
    ) -> Result<MediaPipeline, LookupError> {
        let file = File::open(path).map_err(|e| LookupError::io(&display_name(path), &e))?;
        Ok(MediaPipeline {
            source: Box::new(AdtsSource::new(BufReader::new(file), track.clock_rate)),
            packetizer: Box::new(AacPacketizer::new(
                RtpHeader::with_random_ssrc(track.payload_type),
                max_packet_size,
            )),
        })
    }
}
