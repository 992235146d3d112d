//! `.tsx` sidecar index for transport streams.
//!
//! The index is a flat array of 11-byte little-endian records, one per
//! picture start found in the video elementary stream:
//!
//! ```text
//! offset  size  field
//! 0       1     record type (high bit: starts a PES packet)
//! 1       1     offset of the picture data within its TS packet
//! 2       1     size of that data within the TS packet
//! 3       3     PCR, whole seconds
//! 6       1     PCR, fractional part in 1/256 s
//! 7       4     transport packet number
//! ```
//!
//! PCRs are seconds from the first PCR in the stream.

use std::fs::{self, File};
use std::io::{self, BufReader, Read};
use std::path::{Path, PathBuf};

use super::ts::{PcrClock, ProgramScanner, TS_PACKET_LEN, parse_packet};

pub const RECORD_LEN: usize = 11;
/// Upper bound on the packets sent for one key frame in trick mode.
pub const MAX_SPAN_PACKETS: usize = 4096;

pub const RECORD_UNPARSED: u8 = 0;
pub const RECORD_PIC_IFRAME: u8 = 4;
pub const RECORD_NAL_H264_IFRAME: u8 = 9;
pub const RECORD_NAL_H265_IFRAME: u8 = 15;
const PES_START_FLAG: u8 = 0x80;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct IndexRecord {
    pub kind: u8,
    pub start_offset: u8,
    pub size: u8,
    pub pcr: f64,
    pub packet: u32,
}

impl IndexRecord {
    pub fn new(kind: u8, packet: u32, pcr: f64) -> Self {
        Self {
            kind,
            start_offset: 0,
            size: 0,
            pcr,
            packet,
        }
    }

    pub fn is_keyframe(&self) -> bool {
        matches!(
            self.kind,
            RECORD_PIC_IFRAME | RECORD_NAL_H264_IFRAME | RECORD_NAL_H265_IFRAME
        )
    }

    fn encode(&self) -> [u8; RECORD_LEN] {
        let pcr = self.pcr.max(0.0);
        let seconds = (pcr.floor() as u32).min(0x00FF_FFFF);
        let fraction = ((pcr - pcr.floor()) * 256.0) as u8;
        let mut out = [0u8; RECORD_LEN];
        out[0] = self.kind | PES_START_FLAG;
        out[1] = self.start_offset;
        out[2] = self.size;
        out[3..6].copy_from_slice(&seconds.to_le_bytes()[..3]);
        out[6] = fraction;
        out[7..11].copy_from_slice(&self.packet.to_le_bytes());
        out
    }

    fn decode(bytes: &[u8]) -> Self {
        let seconds = u32::from_le_bytes([bytes[3], bytes[4], bytes[5], 0]);
        Self {
            kind: bytes[0] & 0x7F,
            start_offset: bytes[1],
            size: bytes[2],
            pcr: f64::from(seconds) + f64::from(bytes[6]) / 256.0,
            packet: u32::from_le_bytes([bytes[7], bytes[8], bytes[9], bytes[10]]),
        }
    }
}

/// A key frame and the run of packets that carries it.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct KeyframeSpan {
    pub packet: u64,
    pub packets: usize,
    pub pcr: f64,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct TsIndex {
    records: Vec<IndexRecord>,
}

impl TsIndex {
    pub fn new(records: Vec<IndexRecord>) -> Self {
        Self { records }
    }

    pub fn records(&self) -> &[IndexRecord] {
        &self.records
    }

    /// `movie.ts` → `movie.tsx`.
    pub fn sidecar_path(ts_path: &Path) -> PathBuf {
        ts_path.with_extension("tsx")
    }

    pub fn parse(bytes: &[u8]) -> io::Result<Self> {
        if bytes.len() % RECORD_LEN != 0 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("index length {} is not a multiple of {}", bytes.len(), RECORD_LEN),
            ));
        }
        Ok(Self::new(
            bytes.chunks_exact(RECORD_LEN).map(IndexRecord::decode).collect(),
        ))
    }

    pub fn load(path: &Path) -> io::Result<Self> {
        Self::parse(&fs::read(path)?)
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        self.records.iter().flat_map(|r| r.encode()).collect()
    }

    pub fn save(&self, path: &Path) -> io::Result<()> {
        fs::write(path, self.to_bytes())
    }

    /// Largest PCR in the index.
    pub fn duration(&self) -> Option<f64> {
        self.records.iter().map(|r| r.pcr).reduce(f64::max)
    }

    /// Key frames in file order. Each span runs to the next record at a
    /// later packet, capped at [`MAX_SPAN_PACKETS`].
    pub fn keyframe_spans(&self) -> Vec<KeyframeSpan> {
        self.records
            .iter()
            .enumerate()
            .filter(|(_, r)| r.is_keyframe())
            .map(|(i, r)| {
                let end = self.records[i + 1..]
                    .iter()
                    .map(|next| next.packet)
                    .find(|&packet| packet > r.packet);
                let packets = end
                    .map(|end| (end - r.packet) as usize)
                    .unwrap_or(MAX_SPAN_PACKETS)
                    .clamp(1, MAX_SPAN_PACKETS);
                KeyframeSpan {
                    packet: u64::from(r.packet),
                    packets,
                    pcr: r.pcr,
                }
            })
            .collect()
    }

    /// Scan a transport stream and record every picture start on its first
    /// video stream.
    pub fn build<R: Read>(reader: R) -> io::Result<Self> {
        let mut reader = reader;
        let mut programs = ProgramScanner::default();
        let mut clock = PcrClock::default();
        let mut records: Vec<IndexRecord> = Vec::new();
        let mut packet = [0u8; TS_PACKET_LEN];
        let mut skipped = 0u64;

        for number in 0u32.. {
            match reader.read_exact(&mut packet) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => break,
                Err(e) => return Err(e),
            }
            let Some(info) = parse_packet(&packet) else {
                skipped += 1;
                continue;
            };
            programs.observe(&packet, &info);

            if let Some(pcr) = info.pcr
                && programs.pcr_pid.is_none_or(|pid| pid == info.pid)
            {
                clock.observe(pcr, u64::from(number));
            }

            let Some((video_pid, codec)) = programs.video else {
                continue;
            };
            if info.pid != video_pid || !info.unit_start || info.payload_offset >= TS_PACKET_LEN {
                continue;
            }
            let keyframe =
                info.random_access || codec.starts_with_keyframe(&packet[info.payload_offset..]);
            let floor = records.last().map_or(0.0, |r| r.pcr);
            records.push(IndexRecord {
                kind: codec.record_type(keyframe),
                start_offset: info.payload_offset as u8,
                size: (TS_PACKET_LEN - info.payload_offset) as u8,
                pcr: clock.at(u64::from(number)).max(floor),
                packet: number,
            });
        }

        // Trailing record so the index spans the whole stream.
        if let Some((pcr, packet)) = clock.last()
            && records.last().is_none_or(|r| u64::from(r.packet) < packet)
        {
            records.push(IndexRecord::new(RECORD_UNPARSED, packet as u32, pcr));
        }
        if skipped > 0 {
            tracing::warn!(skipped, "packets without sync byte skipped while indexing");
        }
        tracing::debug!(
            records = records.len(),
            keyframes = records.iter().filter(|r| r.is_keyframe()).count(),
            "transport stream indexed"
        );
        Ok(Self::new(records))
    }

    /// Index `ts_path` and write the result next to it.
    pub fn build_sidecar(ts_path: &Path) -> io::Result<(PathBuf, Self)> {
        let index = Self::build(BufReader::new(File::open(ts_path)?))?;
        let sidecar = Self::sidecar_path(ts_path);
        index.save(&sidecar)?;
        Ok((sidecar, index))
    }
}
