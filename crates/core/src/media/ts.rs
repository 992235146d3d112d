//! MPEG-2 transport streams sent as `MP2T` (RFC 2250 §2, payload type 33).
//!
//! At normal speed the file is read in runs of seven 188-byte packets and
//! paced by its PCRs: a run's presentation time is interpolated from the
//! most recent PCR and the packet rate measured between PCRs. With a `.tsx`
//! sidecar index the stream can also seek to keyframes and play key frames
//! only, forwards or backwards, for scales other than 1.

use std::fs::File;
use std::io::{self, BufReader, Read, Seek, SeekFrom};
use std::path::Path;

use super::index::{KeyframeSpan, TsIndex};
use super::rtp::{RtpHeader, chunks_with_last};
use super::{
    Frame, FrameSource, MediaFormat, MediaKind, MediaPipeline, Packetizer, TrackInfo,
    display_name,
};
use crate::error::LookupError;

pub const TS_PACKET_LEN: usize = 188;
pub const SYNC_BYTE: u8 = 0x47;
pub const PAYLOAD_TYPE: u8 = 33;
/// Packets per RTP packet at normal speed (7 × 188 = 1316 bytes).
pub const PACKETS_PER_FRAME: usize = 7;
const CLOCK_RATE: u32 = 90000;

/// PCR base is 33 bits of a 90 kHz clock.
const PCR_WRAP_SECONDS: f64 = (1u64 << 33) as f64 / 90000.0;
/// A PCR further than this from the previous one is a discontinuity.
const MAX_PCR_GAP: f64 = 10.0;
/// Packet rate assumed until two PCRs have been seen (~1.5 Mbit/s).
const FALLBACK_PACKET_RATE: f64 = 1000.0;
/// Packets examined when probing a file for its PCR timing.
const PROBE_PACKETS: usize = 4096;

/// Header fields of one transport packet.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PacketInfo {
    pub pid: u16,
    pub unit_start: bool,
    pub random_access: bool,
    /// Absolute PCR in seconds.
    pub pcr: Option<f64>,
    /// Start of the payload; `TS_PACKET_LEN` when there is none.
    pub payload_offset: usize,
}

pub fn parse_packet(packet: &[u8]) -> Option<PacketInfo> {
    if packet.len() < TS_PACKET_LEN || packet[0] != SYNC_BYTE {
        return None;
    }
    let pid = (u16::from(packet[1] & 0x1F) << 8) | u16::from(packet[2]);
    let unit_start = packet[1] & 0x40 != 0;
    let control = (packet[3] >> 4) & 0x03;

    let mut info = PacketInfo {
        pid,
        unit_start,
        random_access: false,
        pcr: None,
        payload_offset: TS_PACKET_LEN,
    };
    let mut offset = 4;
    if control & 0x02 != 0 {
        let len = usize::from(packet[4]);
        if len > 0 && 5 + len <= TS_PACKET_LEN {
            let flags = packet[5];
            info.random_access = flags & 0x40 != 0;
            if flags & 0x10 != 0 && len >= 7 {
                let b = &packet[6..12];
                let base = (u64::from(b[0]) << 25)
                    | (u64::from(b[1]) << 17)
                    | (u64::from(b[2]) << 9)
                    | (u64::from(b[3]) << 1)
                    | (u64::from(b[4]) >> 7);
                let ext = (u64::from(b[4] & 0x01) << 8) | u64::from(b[5]);
                info.pcr = Some((base * 300 + ext) as f64 / 27_000_000.0);
            }
        }
        offset += 1 + len;
    }
    if control & 0x01 != 0 && offset < TS_PACKET_LEN {
        info.payload_offset = offset;
    }
    Some(info)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VideoCodec {
    Mpeg2,
    H264,
    H265,
}

impl VideoCodec {
    fn from_stream_type(stream_type: u8) -> Option<Self> {
        match stream_type {
            0x01 | 0x02 => Some(Self::Mpeg2),
            0x1B => Some(Self::H264),
            0x24 => Some(Self::H265),
            _ => None,
        }
    }

    /// Index record type for a picture of this codec.
    pub fn record_type(self, keyframe: bool) -> u8 {
        match (self, keyframe) {
            (Self::Mpeg2, true) => 4,
            (Self::Mpeg2, false) => 3,
            (Self::H264, true) => 9,
            (Self::H264, false) => 8,
            (Self::H265, true) => 15,
            (Self::H265, false) => 14,
        }
    }

    /// Look for the first picture in a PES packet's leading bytes and report
    /// whether it is intra coded.
    pub fn starts_with_keyframe(self, pes: &[u8]) -> bool {
        if pes.len() < 9 || pes[..3] != [0, 0, 1] {
            return false;
        }
        let es_start = 9 + usize::from(pes[8]);
        let Some(es) = pes.get(es_start..) else {
            return false;
        };
        let mut i = 0;
        while i + 3 < es.len() {
            if es[i..i + 3] != [0, 0, 1] {
                i += 1;
                continue;
            }
            let code = es[i + 3];
            match self {
                Self::Mpeg2 if code == 0x00 => {
                    return es.get(i + 5).is_some_and(|b| (b >> 3) & 0x07 == 1);
                }
                Self::H264 => match code & 0x1F {
                    5 => return true,
                    1 => return false,
                    _ => {}
                },
                Self::H265 => match (code >> 1) & 0x3F {
                    16..=21 => return true,
                    0..=15 => return false,
                    _ => {}
                },
                _ => {}
            }
            i += 3;
        }
        false
    }
}

/// Learns the program layout (PMT, PCR PID, first video stream) from
/// PAT/PMT sections that fit in a single packet.
#[derive(Debug, Clone, Default)]
pub struct ProgramScanner {
    pmt_pid: Option<u16>,
    pub pcr_pid: Option<u16>,
    pub video: Option<(u16, VideoCodec)>,
}

impl ProgramScanner {
    pub fn pmt_pid(&self) -> Option<u16> {
        self.pmt_pid
    }

    pub fn observe(&mut self, packet: &[u8], info: &PacketInfo) {
        if !info.unit_start || info.payload_offset >= TS_PACKET_LEN {
            return;
        }
        if info.pid == 0 {
            if let Some(section) = psi_section(&packet[info.payload_offset..], 0x00) {
                self.pmt_pid = section
                    .get(5..)
                    .unwrap_or_default()
                    .chunks_exact(4)
                    .find(|entry| entry[0] != 0 || entry[1] != 0)
                    .map(|entry| (u16::from(entry[2] & 0x1F) << 8) | u16::from(entry[3]));
            }
        } else if Some(info.pid) == self.pmt_pid
            && let Some(section) = psi_section(&packet[info.payload_offset..], 0x02)
        {
            self.parse_pmt(section);
        }
    }

    fn parse_pmt(&mut self, section: &[u8]) {
        if section.len() < 9 {
            return;
        }
        self.pcr_pid = Some((u16::from(section[5] & 0x1F) << 8) | u16::from(section[6]));
        let program_info_len = (usize::from(section[7] & 0x0F) << 8) | usize::from(section[8]);
        let mut i = 9 + program_info_len;
        while i + 5 <= section.len() {
            let stream_type = section[i];
            let pid = (u16::from(section[i + 1] & 0x1F) << 8) | u16::from(section[i + 2]);
            let es_info_len =
                (usize::from(section[i + 3] & 0x0F) << 8) | usize::from(section[i + 4]);
            if self.video.is_none()
                && let Some(codec) = VideoCodec::from_stream_type(stream_type)
            {
                self.video = Some((pid, codec));
            }
            i += 5 + es_info_len;
        }
    }
}

/// Section body after the 3-byte table header and the 5 bytes of extended
/// syntax, without the CRC.
fn psi_section(payload: &[u8], table_id: u8) -> Option<&[u8]> {
    let pointer = usize::from(*payload.first()?);
    let section = payload.get(1 + pointer..)?;
    if section.len() < 8 || section[0] != table_id {
        return None;
    }
    let section_len = (usize::from(section[1] & 0x0F) << 8) | usize::from(section[2]);
    let end = (3 + section_len).saturating_sub(4).min(section.len());
    section.get(3..end)
}

/// Maps PCRs to seconds from the first PCR in the file, smoothing over
/// wraps and discontinuities, and tracks the packet rate between them.
#[derive(Debug, Clone, Default)]
pub struct PcrClock {
    base: Option<f64>,
    last: Option<(f64, u64)>,
    rate: Option<f64>,
}

impl PcrClock {
    pub fn with_base(base: Option<f64>, rate: Option<f64>) -> Self {
        Self {
            base,
            last: None,
            rate,
        }
    }

    pub fn base(&self) -> Option<f64> {
        self.base
    }

    pub fn rate(&self) -> Option<f64> {
        self.rate
    }

    pub fn last(&self) -> Option<(f64, u64)> {
        self.last
    }

    /// Record the PCR carried by packet number `packet`.
    pub fn observe(&mut self, pcr: f64, packet: u64) {
        let base = *self.base.get_or_insert(pcr);
        let mut relative = pcr - base;
        if relative < 0.0 {
            relative += PCR_WRAP_SECONDS;
        }
        if let Some((previous, previous_packet)) = self.last {
            let gap = relative - previous;
            let packets = packet.saturating_sub(previous_packet);
            if (0.0..MAX_PCR_GAP).contains(&gap) {
                if packets > 0 && gap > 0.0 {
                    self.rate = Some(packets as f64 / gap);
                }
            } else {
                let continued = previous + packets as f64 / self.rate.unwrap_or(FALLBACK_PACKET_RATE);
                tracing::debug!(pcr, expected = continued, "PCR discontinuity");
                self.base = Some(pcr - continued);
                relative = continued;
            }
        }
        self.last = Some((relative, packet));
    }

    /// Seconds from the first PCR at packet number `packet`.
    pub fn at(&self, packet: u64) -> f64 {
        let rate = self.rate.unwrap_or(FALLBACK_PACKET_RATE);
        match self.last {
            Some((pcr, at)) => (pcr + (packet as f64 - at as f64) / rate).max(0.0),
            None => packet as f64 / rate,
        }
    }

    /// Anchor the timeline after a reposition.
    pub fn reset_to(&mut self, pts: f64, packet: u64) {
        self.last = Some((pts, packet));
    }

    pub fn clear(&mut self) {
        self.last = None;
    }
}

/// PCR layout learned from the start of a file.
#[derive(Debug, Clone, Default)]
pub struct TimingProbe {
    pub pcr_pid: Option<u16>,
    pub first_pcr: Option<f64>,
    pub rate: Option<f64>,
}

pub fn probe_timing<R: Read>(reader: R, max_packets: usize) -> io::Result<TimingProbe> {
    let mut reader = reader;
    let mut programs = ProgramScanner::default();
    let mut clock = PcrClock::default();
    let mut packet = [0u8; TS_PACKET_LEN];
    for n in 0..max_packets as u64 {
        match reader.read_exact(&mut packet) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => break,
            Err(e) => return Err(e),
        }
        let Some(info) = parse_packet(&packet) else {
            continue;
        };
        programs.observe(&packet, &info);
        if let Some(pcr) = info.pcr
            && programs.pcr_pid.is_none_or(|pid| pid == info.pid)
        {
            clock.observe(pcr, n);
            if clock.rate().is_some() {
                break;
            }
        }
    }
    Ok(TimingProbe {
        pcr_pid: programs.pcr_pid,
        first_pcr: clock.base(),
        rate: clock.rate(),
    })
}

/// The first PAT packet and the first packet of the PMT it points to,
/// concatenated. Empty when neither shows up within `max_packets`.
pub fn program_tables<R: Read>(reader: R, max_packets: usize) -> io::Result<Vec<u8>> {
    let mut reader = reader;
    let mut programs = ProgramScanner::default();
    let mut pat: Option<Vec<u8>> = None;
    let mut pmt: Option<Vec<u8>> = None;
    let mut packet = [0u8; TS_PACKET_LEN];
    for _ in 0..max_packets {
        match reader.read_exact(&mut packet) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => break,
            Err(e) => return Err(e),
        }
        let Some(info) = parse_packet(&packet) else {
            continue;
        };
        programs.observe(&packet, &info);
        if !info.unit_start {
            continue;
        }
        if info.pid == 0 && pat.is_none() {
            pat = Some(packet.to_vec());
        } else if pat.is_some() && pmt.is_none() && programs.pmt_pid() == Some(info.pid) {
            pmt = Some(packet.to_vec());
            break;
        }
    }
    Ok(pat.into_iter().chain(pmt).flatten().collect())
}

#[derive(Debug, Clone, Copy)]
struct Trick {
    forward: bool,
    next: Option<usize>,
}

/// Frame source over a transport stream file.
pub struct TsSource<R> {
    reader: R,
    pcr_pid: Option<u16>,
    clock: PcrClock,
    packet_no: u64,
    last_pts: f64,
    spans: Vec<KeyframeSpan>,
    trick: Option<Trick>,
}

impl<R: Read + Seek> TsSource<R> {
    pub fn new(reader: R, timing: &TimingProbe, index: Option<&TsIndex>) -> Self {
        Self {
            reader,
            pcr_pid: timing.pcr_pid,
            clock: PcrClock::with_base(timing.first_pcr, timing.rate),
            packet_no: 0,
            last_pts: 0.0,
            spans: index.map(TsIndex::keyframe_spans).unwrap_or_default(),
            trick: None,
        }
    }

    fn read_packets(&mut self, count: usize) -> io::Result<Vec<u8>> {
        let mut data = vec![0u8; count * TS_PACKET_LEN];
        let mut filled = 0;
        while filled < data.len() {
            match self.reader.read(&mut data[filled..]) {
                Ok(0) => break,
                Ok(n) => filled += n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Err(e),
            }
        }
        data.truncate(filled - filled % TS_PACKET_LEN);
        Ok(data)
    }

    fn position_at(&mut self, packet: u64, pts: f64) -> io::Result<()> {
        self.reader
            .seek(SeekFrom::Start(packet * TS_PACKET_LEN as u64))?;
        self.packet_no = packet;
        self.clock.reset_to(pts, packet);
        self.last_pts = pts;
        Ok(())
    }

    /// Greatest keyframe at or before `npt`.
    fn keyframe_before(&self, npt: f64) -> Option<usize> {
        if self.spans.is_empty() {
            return None;
        }
        let after = self.spans.partition_point(|span| span.pcr <= npt);
        Some(after.saturating_sub(1))
    }

    fn next_normal(&mut self) -> io::Result<Option<Frame>> {
        let first = self.packet_no;
        let data = self.read_packets(PACKETS_PER_FRAME)?;
        if data.is_empty() {
            return Ok(None);
        }
        let count = data.len() / TS_PACKET_LEN;
        for (i, packet) in data.chunks_exact(TS_PACKET_LEN).enumerate() {
            if let Some(info) = parse_packet(packet)
                && let Some(pcr) = info.pcr
                && self.pcr_pid.is_none_or(|pid| pid == info.pid)
            {
                self.clock.observe(pcr, first + i as u64);
            }
        }
        self.packet_no += count as u64;

        let pts = self.clock.at(first).max(self.last_pts);
        self.last_pts = pts;
        let rate = self.clock.rate().unwrap_or(FALLBACK_PACKET_RATE);
        Ok(Some(Frame {
            data,
            pts,
            duration: count as f64 / rate,
            keyframe: false,
        }))
    }

    fn next_trick(&mut self, trick: Trick) -> io::Result<Option<Frame>> {
        let Some(idx) = trick.next else {
            return Ok(None);
        };
        let span = self.spans[idx];
        let following = if trick.forward {
            Some(idx + 1).filter(|&next| next < self.spans.len())
        } else {
            idx.checked_sub(1)
        };
        self.trick = Some(Trick {
            next: following,
            ..trick
        });

        self.reader
            .seek(SeekFrom::Start(span.packet * TS_PACKET_LEN as u64))?;
        let data = self.read_packets(span.packets)?;
        if data.is_empty() {
            return Ok(None);
        }
        self.last_pts = span.pcr;
        let duration = following
            .map(|next| (self.spans[next].pcr - span.pcr).abs())
            .unwrap_or(0.0);
        Ok(Some(Frame {
            data,
            pts: span.pcr,
            duration,
            keyframe: true,
        }))
    }
}

impl<R: Read + Seek + Send> FrameSource for TsSource<R> {
    fn next_frame(&mut self) -> io::Result<Option<Frame>> {
        match self.trick {
            Some(trick) => self.next_trick(trick),
            None => self.next_normal(),
        }
    }

    fn rewind(&mut self) -> io::Result<()> {
        self.reader.seek(SeekFrom::Start(0))?;
        self.packet_no = 0;
        self.clock.clear();
        self.last_pts = 0.0;
        if let Some(trick) = &mut self.trick {
            trick.next = Some(0);
        }
        Ok(())
    }

    fn seek(&mut self, npt: f64) -> io::Result<Option<f64>> {
        let Some(idx) = self.keyframe_before(npt) else {
            if npt <= 0.0 {
                self.rewind()?;
                return Ok(Some(0.0));
            }
            return Ok(None);
        };
        let span = self.spans[idx];
        if span.pcr > npt {
            // Target precedes the first keyframe.
            self.rewind()?;
            return Ok(Some(0.0));
        }
        match &mut self.trick {
            Some(trick) => {
                trick.next = Some(idx);
                self.last_pts = span.pcr;
            }
            None => self.position_at(span.packet, span.pcr)?,
        }
        tracing::debug!(npt, reached = span.pcr, packet = span.packet, "transport stream seek");
        Ok(Some(span.pcr))
    }

    fn set_scale(&mut self, scale: f32) -> f32 {
        if scale == 1.0 || scale == 0.0 || self.spans.is_empty() {
            if self.trick.take().is_some() {
                let idx = self.keyframe_before(self.last_pts).unwrap_or(0);
                let span = self.spans[idx];
                if let Err(e) = self.position_at(span.packet, span.pcr) {
                    tracing::warn!(error = %e, "failed to leave trick mode");
                }
            }
            return 1.0;
        }
        let idx = self.keyframe_before(self.last_pts).unwrap_or(0);
        self.trick = Some(Trick {
            forward: scale > 0.0,
            next: Some(idx),
        });
        scale
    }
}

/// Packs whole transport packets into each RTP payload.
#[derive(Debug)]
pub struct TsPacketizer {
    header: RtpHeader,
    max_payload: usize,
}

impl TsPacketizer {
    pub fn new(header: RtpHeader, max_payload: usize) -> Self {
        let packets = (max_payload / TS_PACKET_LEN).max(1);
        Self {
            header,
            max_payload: packets * TS_PACKET_LEN,
        }
    }
}

impl Packetizer for TsPacketizer {
    fn packetize(&mut self, frame: &[u8], rtp_timestamp: u32) -> Vec<Vec<u8>> {
        self.header.set_timestamp(rtp_timestamp);
        chunks_with_last(frame, self.max_payload)
            .map(|(_, chunk, _)| self.header.packet(false, &[chunk]))
            .collect()
    }

    fn header(&self) -> &RtpHeader {
        &self.header
    }
}

/// `.ts` files, with an optional `.tsx` index alongside.
#[derive(Debug, Clone, Copy, Default)]
pub struct TsFormat;

impl TsFormat {
    fn timing(path: &Path) -> Result<TimingProbe, LookupError> {
        let name = display_name(path);
        let mut file = File::open(path).map_err(|e| LookupError::io(&name, &e))?;
        let mut first = [0u8; 1];
        if file.read_exact(&mut first).is_err() || first[0] != SYNC_BYTE {
            return Err(LookupError::malformed(&name, "missing transport stream sync byte"));
        }
        file.seek(SeekFrom::Start(0))
            .map_err(|e| LookupError::io(&name, &e))?;
        probe_timing(BufReader::new(file), PROBE_PACKETS).map_err(|e| LookupError::io(&name, &e))
    }

    fn index(path: &Path) -> Option<TsIndex> {
        let sidecar = TsIndex::sidecar_path(path);
        if !sidecar.exists() {
            return None;
        }
        match TsIndex::load(&sidecar) {
            Ok(index) => Some(index),
            Err(e) => {
                tracing::warn!(index = %sidecar.display(), error = %e, "ignoring unreadable index");
                None
            }
        }
    }
}

impl MediaFormat for TsFormat {
    fn name(&self) -> &'static str {
        "MPEG transport stream"
    }

    fn probe(&self, path: &Path) -> Result<Vec<TrackInfo>, LookupError> {
        Self::timing(path)?;
        let mut track = TrackInfo::new(MediaKind::Video, "MP2T", CLOCK_RATE, PAYLOAD_TYPE);
        if let Some(index) = Self::index(path) {
            track.duration = index.duration();
            track.trick_play = !index.keyframe_spans().is_empty();
        }
        Ok(vec![track])
    }

    fn open(
        &self,
        path: &Path,
        track: &TrackInfo,
        max_packet_size: usize,
    ) -> Result<MediaPipeline, LookupError> {
        let timing = Self::timing(path)?;
        let index = Self::index(path);
        let file = File::open(path).map_err(|e| LookupError::io(&display_name(path), &e))?;
        Ok(MediaPipeline {
            source: Box::new(TsSource::new(BufReader::new(file), &timing, index.as_ref())),
            packetizer: Box::new(TsPacketizer::new(
                RtpHeader::with_random_ssrc(track.payload_type),
                max_packet_size,
            )),
        })
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::media::index::IndexRecord;
    use crate::media::index::tests::program_table_packets;
    use std::io::Cursor;

    /// A packet on `pid`, optionally carrying a PCR (seconds) and the
    /// random access flag.
    pub(crate) fn ts_packet(pid: u16, pcr: Option<f64>, random_access: bool) -> Vec<u8> {
        let mut packet = vec![0xFFu8; TS_PACKET_LEN];
        packet[0] = SYNC_BYTE;
        packet[1] = ((pid >> 8) as u8 & 0x1F) | if random_access { 0x40 } else { 0 };
        packet[2] = pid as u8;
        if pcr.is_none() && !random_access {
            packet[3] = 0x10;
            return packet;
        }
        packet[3] = 0x30;
        packet[4] = 7;
        packet[5] = if random_access { 0x40 } else { 0 };
        if let Some(pcr) = pcr {
            packet[5] |= 0x10;
            let ticks = (pcr * 27_000_000.0).round() as u64;
            let base = ticks / 300;
            let ext = ticks % 300;
            packet[6] = (base >> 25) as u8;
            packet[7] = (base >> 17) as u8;
            packet[8] = (base >> 9) as u8;
            packet[9] = (base >> 1) as u8;
            packet[10] = (((base & 1) as u8) << 7) | 0x7E | ((ext >> 8) as u8);
            packet[11] = ext as u8;
        }
        packet
    }

    /// `seconds` of stream at 100 packets/s with a PCR every 10 packets.
    pub(crate) fn ts_stream(seconds: usize) -> Vec<u8> {
        (0..seconds * 100)
            .flat_map(|n| {
                let pcr = (n % 10 == 0).then(|| 5.0 + n as f64 / 100.0);
                ts_packet(0x100, pcr, n % 100 == 0)
            })
            .collect()
    }

    #[test]
    fn program_tables_are_the_first_pat_and_pmt() {
        let mut data = program_table_packets();
        data.extend(ts_stream(1));
        data.extend(program_table_packets());
        let tables = program_tables(Cursor::new(&data), 500).unwrap();
        assert_eq!(tables.as_slice(), &data[..2 * TS_PACKET_LEN]);
        assert!(program_tables(Cursor::new(ts_stream(1)), 500).unwrap().is_empty());
    }

    #[test]
    fn parses_pcr_and_flags() {
        let packet = ts_packet(0x100, Some(12.5), true);
        let info = parse_packet(&packet).unwrap();
        assert_eq!(info.pid, 0x100);
        assert!(info.unit_start);
        assert!(info.random_access);
        assert!((info.pcr.unwrap() - 12.5).abs() < 1e-6);
        assert_eq!(info.payload_offset, 12);
    }

    #[test]
    fn clock_measures_rate_and_survives_discontinuity() {
        let mut clock = PcrClock::default();
        clock.observe(100.0, 0);
        clock.observe(100.5, 50);
        assert_eq!(clock.rate(), Some(100.0));
        assert!((clock.at(75) - 0.75).abs() < 1e-9);

        clock.observe(3.0, 100);
        let (pts, _) = clock.last().unwrap();
        assert!((pts - 1.0).abs() < 1e-9);
        clock.observe(3.5, 150);
        assert!((clock.last().unwrap().0 - 1.5).abs() < 1e-9);
    }

    #[test]
    fn normal_play_is_pcr_paced() {
        let data = ts_stream(2);
        let timing = probe_timing(Cursor::new(&data), 100).unwrap();
        assert!((timing.first_pcr.unwrap() - 5.0).abs() < 1e-6);
        assert!((timing.rate.unwrap() - 100.0).abs() < 1e-3);

        let mut source = TsSource::new(Cursor::new(data), &timing, None);
        let first = source.next_frame().unwrap().unwrap();
        assert_eq!(first.data.len(), PACKETS_PER_FRAME * TS_PACKET_LEN);
        assert!(first.pts.abs() < 1e-6);
        let second = source.next_frame().unwrap().unwrap();
        assert!((second.pts - 0.07).abs() < 1e-3);

        let mut frames = 2;
        let mut last = second.pts;
        while let Some(frame) = source.next_frame().unwrap() {
            assert!(frame.pts >= last);
            last = frame.pts;
            frames += 1;
        }
        assert_eq!(frames, 200usize.div_ceil(PACKETS_PER_FRAME));
    }

    fn index_for(seconds: usize) -> TsIndex {
        let records = (0..seconds)
            .flat_map(|s| {
                [
                    IndexRecord::new(9, (s * 100) as u32, s as f64),
                    IndexRecord::new(8, (s * 100 + 50) as u32, s as f64 + 0.5),
                ]
            })
            .collect();
        TsIndex::new(records)
    }

    #[test]
    fn indexed_seek_goes_to_keyframe_at_or_before() {
        let data = ts_stream(4);
        let timing = probe_timing(Cursor::new(&data), 100).unwrap();
        let index = index_for(4);
        let mut source = TsSource::new(Cursor::new(data), &timing, Some(&index));

        assert_eq!(source.seek(2.7).unwrap(), Some(2.0));
        let frame = source.next_frame().unwrap().unwrap();
        assert!((frame.pts - 2.0).abs() < 1e-6);
        // Packet 200 carries the keyframe's random access flag.
        assert!(parse_packet(&frame.data).unwrap().random_access);
    }

    #[test]
    fn unindexed_seek_only_rewinds() {
        let data = ts_stream(1);
        let timing = probe_timing(Cursor::new(&data), 100).unwrap();
        let mut source = TsSource::new(Cursor::new(data), &timing, None);
        source.next_frame().unwrap();
        assert_eq!(source.seek(0.5).unwrap(), None);
        assert_eq!(source.seek(0.0).unwrap(), Some(0.0));
        assert_eq!(source.set_scale(2.0), 1.0);
    }

    #[test]
    fn trick_play_steps_through_keyframes() {
        let data = ts_stream(4);
        let timing = probe_timing(Cursor::new(&data), 100).unwrap();
        let index = index_for(4);
        let mut source = TsSource::new(Cursor::new(data), &timing, Some(&index));

        assert_eq!(source.seek(3.2).unwrap(), Some(3.0));
        assert_eq!(source.set_scale(-2.0), -2.0);
        let pts: Vec<f64> = std::iter::from_fn(|| source.next_frame().unwrap())
            .map(|frame| {
                assert!(frame.keyframe);
                assert_eq!(frame.data.len(), 50 * TS_PACKET_LEN);
                frame.pts
            })
            .collect();
        assert_eq!(pts, vec![3.0, 2.0, 1.0, 0.0]);
    }

    #[test]
    fn packetizer_packs_whole_ts_packets() {
        let mut p = TsPacketizer::new(RtpHeader::new(PAYLOAD_TYPE, 1), 1400);
        let packets = p.packetize(&vec![SYNC_BYTE; 10 * TS_PACKET_LEN], 0);
        assert_eq!(packets.len(), 2);
        assert_eq!(packets[0].len(), 12 + 7 * TS_PACKET_LEN);
        assert_eq!(packets[1].len(), 12 + 3 * TS_PACKET_LEN);
    }
}
