//! H.265 (HEVC) RTP packetizer (RFC 7798).
//!
//! Key differences from H.264 (RFC 6184):
//!
//! - **2-byte NAL unit header** (vs 1-byte in H.264).
//!   The NAL type is in bits 1..6 of the first byte.
//!
//! - **FU header format**: 2-byte payload header (type 49) + 1-byte FU
//!   header with a 6-bit NAL type field.
//!
//! - **SDP attributes** (RFC 7798 §7.1):
//!   ```text
//!   a=rtpmap:96 H265/90000
//!   a=fmtp:96 sprop-vps=...;sprop-sps=...;sprop-pps=...
//!   ```

use std::fs::File;
use std::io::BufReader;
use std::path::Path;

use base64::prelude::{BASE64_STANDARD, Engine as _};

use super::annexb::{self, AccessUnitSource, NalCodec};
use super::h264::H264Packetizer;
use super::rtp::RtpHeader;
use super::{MediaFormat, MediaKind, MediaPipeline, Packetizer, TrackInfo, display_name};
use crate::error::LookupError;

pub const DEFAULT_FRAME_RATE: f64 = 25.0;
const PAYLOAD_TYPE: u8 = 96;
const CLOCK_RATE: u32 = 90000;
const FU_TYPE: u8 = 49;

#[derive(Debug)]
pub struct H265Packetizer {
    header: RtpHeader,
    max_payload: usize,
    vps: Option<Vec<u8>>,
    sps: Option<Vec<u8>>,
    pps: Option<Vec<u8>>,
}

impl H265Packetizer {
    pub fn new(pt: u8, ssrc: u32, max_payload: usize) -> Self {
        Self {
            header: RtpHeader::new(pt, ssrc),
            max_payload,
            vps: None,
            sps: None,
            pps: None,
        }
    }

    pub fn with_random_ssrc(pt: u8, max_payload: usize) -> Self {
        Self {
            header: RtpHeader::with_random_ssrc(pt),
            max_payload,
            vps: None,
            sps: None,
            pps: None,
        }
    }

    pub fn with_parameter_sets(
        mut self,
        vps: Option<Vec<u8>>,
        sps: Option<Vec<u8>>,
        pps: Option<Vec<u8>>,
    ) -> Self {
        self.vps = vps;
        self.sps = sps;
        self.pps = pps;
        self
    }

    /// `a=fmtp` parameters; empty when no parameter set was found.
    pub fn fmtp(&self) -> Option<String> {
        let parts: Vec<String> = [("vps", &self.vps), ("sps", &self.sps), ("pps", &self.pps)]
            .into_iter()
            .filter_map(|(name, set)| {
                set.as_deref()
                    .map(|set| format!("sprop-{}={}", name, BASE64_STANDARD.encode(set)))
            })
            .collect();
        if parts.is_empty() {
            None
        } else {
            Some(parts.join(";"))
        }
    }

    fn packetize_nal(&mut self, nal_unit: &[u8], is_last_nal: bool) -> Vec<Vec<u8>> {
        let mut packets = Vec::new();

        if nal_unit.len() < 2 {
            return packets;
        }

        if nal_unit.len() <= self.max_payload {
            packets.push(self.header.packet(is_last_nal, &[nal_unit]));
            return packets;
        }

        // Fragmentation unit (RFC 7798 §4.4.3): payload header keeps F and
        // LayerId, type becomes 49; TID byte is copied.
        let nal_type = (nal_unit[0] >> 1) & 0x3f;
        let payload_header = [(nal_unit[0] & 0x81) | (FU_TYPE << 1), nal_unit[1]];
        let payload = &nal_unit[2..];

        let max_fragment = self.max_payload.saturating_sub(3).max(1);
        let mut offset = 0usize;
        while offset < payload.len() {
            let remaining = payload.len() - offset;
            let last_fragment = remaining <= max_fragment;
            let chunk_size = remaining.min(max_fragment);
            let chunk = &payload[offset..offset + chunk_size];

            let start_bit = if offset == 0 { 0x80 } else { 0x00 };
            let end_bit = if last_fragment { 0x40 } else { 0x00 };
            let fu_header = start_bit | end_bit | nal_type;

            packets.push(self.header.packet(
                is_last_nal && last_fragment,
                &[&payload_header, &[fu_header], chunk],
            ));
            offset += chunk_size;
        }

        tracing::trace!(
            nal_type,
            nal_size = nal_unit.len(),
            fragments = packets.len(),
            "FU fragmented NAL unit"
        );
        packets
    }
}

impl Packetizer for H265Packetizer {
    fn packetize(&mut self, frame: &[u8], rtp_timestamp: u32) -> Vec<Vec<u8>> {
        self.header.set_timestamp(rtp_timestamp);

        // Start code layout is identical to H.264 Annex B.
        let nal_units = H264Packetizer::extract_nal_units(frame);
        let mut packets = Vec::new();
        for (i, nal) in nal_units.iter().enumerate() {
            let is_last = i + 1 == nal_units.len();
            packets.append(&mut self.packetize_nal(nal, is_last));
        }
        packets
    }

    fn header(&self) -> &RtpHeader {
        &self.header
    }
}

/// `.265` files: raw H.265 Annex B elementary streams.
#[derive(Debug, Clone)]
pub struct H265Format {
    pub frame_rate: f64,
}

impl Default for H265Format {
    fn default() -> Self {
        Self {
            frame_rate: DEFAULT_FRAME_RATE,
        }
    }
}

impl MediaFormat for H265Format {
    fn name(&self) -> &'static str {
        "H.265 video elementary stream"
    }

    fn probe(&self, path: &Path) -> Result<Vec<TrackInfo>, LookupError> {
        let name = display_name(path);
        let sets = annexb::scan_parameter_sets(path, NalCodec::H265)
            .map_err(|e| LookupError::io(&name, &e))?;
        if sets.nal_count == 0 {
            return Err(LookupError::malformed(&name, "no H.265 NAL units found"));
        }

        let packetizer = H265Packetizer::new(PAYLOAD_TYPE, 0, usize::MAX)
            .with_parameter_sets(sets.vps, sets.sps, sets.pps);
        let mut track = TrackInfo::new(MediaKind::Video, "H265", CLOCK_RATE, PAYLOAD_TYPE);
        track.fmtp = packetizer.fmtp();
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
            source: Box::new(AccessUnitSource::new(
                BufReader::new(file),
                NalCodec::H265,
                self.frame_rate,
            )),
            packetizer: Box::new(H265Packetizer::with_random_ssrc(
                track.payload_type,
                max_packet_size,
            )),
        })
    }
}
