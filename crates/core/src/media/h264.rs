use std::fs::File;
use std::io::BufReader;
use std::path::Path;

use base64::prelude::{BASE64_STANDARD, Engine as _};

use super::annexb::{self, AccessUnitSource, NalCodec};
use super::rtp::RtpHeader;
use super::{MediaFormat, MediaKind, MediaPipeline, Packetizer, TrackInfo, display_name};
use crate::error::LookupError;

pub const DEFAULT_FRAME_RATE: f64 = 25.0;
const PAYLOAD_TYPE: u8 = 96;
const CLOCK_RATE: u32 = 90000;

/// H.264 RTP packetizer (RFC 6184).
///
/// Converts H.264 Annex B access units into RTP packets. Supports two
/// packetization modes from RFC 6184:
///
/// - **Single NAL Unit** (§5.6): NALs that fit within the payload limit are
///   sent as-is in a single RTP packet (12-byte header + NAL bytes).
///
/// - **FU-A Fragmentation** (§5.8): NALs exceeding the limit are split
///   across multiple RTP packets. Each fragment carries a 2-byte FU
///   header (FU indicator + FU header) before the NAL payload:
///
///   ```text
///   FU indicator:  [F|NRI|Type=28]     (1 byte)
///   FU header:     [S|E|R|NAL_Type]    (1 byte)
///   Fragment data: [...]               (up to limit - 2 bytes)
///   ```
///
/// ## SDP attributes (RFC 6184 §8.1)
///
/// [`fmtp`](Self::fmtp) yields `packetization-mode=1` plus, once parameter
/// sets are known, `profile-level-id` and `sprop-parameter-sets`.
///
/// ## Marker bit
///
/// Per RFC 6184 §5.1, the RTP marker bit is set on the last RTP packet
/// of an H.264 access unit (frame boundary).
#[derive(Debug)]
pub struct H264Packetizer {
    header: RtpHeader,
    max_payload: usize,
    sps: Option<Vec<u8>>,
    pps: Option<Vec<u8>>,
}

impl H264Packetizer {
    /// Create with explicit payload type and SSRC.
    pub fn new(pt: u8, ssrc: u32, max_payload: usize) -> Self {
        Self {
            header: RtpHeader::new(pt, ssrc),
            max_payload,
            sps: None,
            pps: None,
        }
    }

    /// Create with a random SSRC (RFC 3550 §8.1).
    pub fn with_random_ssrc(pt: u8, max_payload: usize) -> Self {
        Self {
            header: RtpHeader::with_random_ssrc(pt),
            max_payload,
            sps: None,
            pps: None,
        }
    }

    pub fn with_parameter_sets(mut self, sps: Option<Vec<u8>>, pps: Option<Vec<u8>>) -> Self {
        self.sps = sps;
        self.pps = pps;
        self
    }

    /// Derive profile-level-id from SPS NAL (RFC 6184 §8.1): bytes 1–3 are profile_idc, constraint_set, level_idc.
    fn profile_level_id(&self) -> Option<String> {
        let sps = self.sps.as_deref()?;
        if sps.len() < 4 {
            return None;
        }
        Some(format!("{:02x}{:02x}{:02x}", sps[1], sps[2], sps[3]))
    }

    fn sprop_parameter_sets(&self) -> Option<String> {
        let sps = self.sps.as_deref()?;
        let pps = self.pps.as_deref()?;
        Some(format!(
            "{},{}",
            BASE64_STANDARD.encode(sps),
            BASE64_STANDARD.encode(pps)
        ))
    }

    /// `a=fmtp` parameters per RFC 6184 §8.2.1 (without the payload type).
    pub fn fmtp(&self) -> String {
        let mut fmtp = "packetization-mode=1".to_string();
        if let Some(pl) = self.profile_level_id() {
            fmtp.push_str(&format!(";profile-level-id={}", pl));
        }
        if let Some(sprop) = self.sprop_parameter_sets() {
            fmtp.push_str(&format!(";sprop-parameter-sets={}", sprop));
        }
        fmtp
    }

    /// Packetize a single NAL unit into one or more RTP packets.
    fn packetize_nal(&mut self, nal_unit: &[u8], is_last_nal: bool) -> Vec<Vec<u8>> {
        let mut packets = Vec::new();

        if nal_unit.is_empty() {
            return packets;
        }

        if nal_unit.len() <= self.max_payload {
            // Single NAL Unit mode (RFC 6184 §5.6)
            packets.push(self.header.packet(is_last_nal, &[nal_unit]));
        } else {
            // FU-A fragmentation (RFC 6184 §5.8)
            let nal_header = nal_unit[0];
            let nal_type = nal_header & 0x1f;
            let nri = nal_header & 0x60;

            // FU indicator: NRI from original NAL, type = 28 (FU-A)
            let fu_indicator = nri | 28;
            let payload = &nal_unit[1..];

            let max_fragment = self.max_payload.saturating_sub(2).max(1);
            let mut offset = 0usize;
            let mut first = true;

            while offset < payload.len() {
                let remaining = payload.len() - offset;
                let last_fragment = remaining <= max_fragment;
                let chunk_size = std::cmp::min(max_fragment, remaining);
                let chunk = &payload[offset..offset + chunk_size];

                // FU header: S=start, E=end, R=0, Type=original NAL type
                let start_bit = if first { 0x80 } else { 0x00 };
                let end_bit = if last_fragment { 0x40 } else { 0x00 };
                let fu_header = start_bit | end_bit | nal_type;

                let marker = is_last_nal && last_fragment;
                packets.push(self.header.packet(marker, &[&[fu_indicator, fu_header], chunk]));

                offset += chunk_size;
                first = false;
            }

            tracing::trace!(
                nal_type,
                nal_size = nal_unit.len(),
                fragments = packets.len(),
                "FU-A fragmented NAL unit"
            );
        }

        packets
    }

    /// Extract NAL units from an H.264 Annex B bitstream.
    ///
    /// Scans for start codes (both 4-byte `00 00 00 01` and 3-byte
    /// `00 00 01`) and returns the NAL data between them, excluding
    /// the start codes themselves.
    pub fn extract_nal_units(data: &[u8]) -> Vec<&[u8]> {
        let mut nal_units = Vec::new();
        let mut i = 0usize;

        // (nal_data_start_index, start_code_length)
        let mut start_entries: Vec<(usize, usize)> = Vec::new();

        while i < data.len() {
            if i + 3 < data.len() && data[i..i + 4] == [0, 0, 0, 1] {
                start_entries.push((i + 4, 4));
                i += 4;
            } else if i + 2 < data.len() && data[i..i + 3] == [0, 0, 1] {
                start_entries.push((i + 3, 3));
                i += 3;
            } else {
                i += 1;
            }
        }

        for (idx, &(start, _)) in start_entries.iter().enumerate() {
            let end = if idx + 1 < start_entries.len() {
                let (next_start, next_sc_len) = start_entries[idx + 1];
                next_start - next_sc_len
            } else {
                data.len()
            };

            if start < end {
                nal_units.push(&data[start..end]);
            }
        }

        nal_units
    }
}

impl Packetizer for H264Packetizer {
    fn packetize(&mut self, frame: &[u8], rtp_timestamp: u32) -> Vec<Vec<u8>> {
        self.header.set_timestamp(rtp_timestamp);

        let nal_units = Self::extract_nal_units(frame);
        let mut packets = Vec::new();
        for (i, nal) in nal_units.iter().enumerate() {
            let is_last = i == nal_units.len() - 1;
            packets.append(&mut self.packetize_nal(nal, is_last));
        }

        tracing::trace!(
            nal_count = nal_units.len(),
            rtp_packets = packets.len(),
            frame_bytes = frame.len(),
            seq = self.header.sequence(),
            ts = rtp_timestamp,
            "frame packetized"
        );

        packets
    }

    fn header(&self) -> &RtpHeader {
        &self.header
    }
}

/// `.264` files: raw H.264 Annex B elementary streams.
#[derive(Debug, Clone)]
pub struct H264Format {
    pub frame_rate: f64,
}

impl Default for H264Format {
    fn default() -> Self {
        Self {
            frame_rate: DEFAULT_FRAME_RATE,
        }
    }
}

impl MediaFormat for H264Format {
    fn name(&self) -> &'static str {
        "H.264 video elementary stream"
    }

    fn probe(&self, path: &Path) -> Result<Vec<TrackInfo>, LookupError> {
        let name = display_name(path);
        let sets = annexb::scan_parameter_sets(path, NalCodec::H264)
            .map_err(|e| LookupError::io(&name, &e))?;
        if sets.nal_count == 0 {
            return Err(LookupError::malformed(&name, "no H.264 NAL units found"));
        }
        if sets.sps.is_none() {
            tracing::warn!(file = %name, "no SPS near start of stream; SDP will lack sprop-parameter-sets");
        }

        let packetizer = H264Packetizer::new(PAYLOAD_TYPE, 0, usize::MAX)
            .with_parameter_sets(sets.sps, sets.pps);
        let mut track = TrackInfo::new(MediaKind::Video, "H264", CLOCK_RATE, PAYLOAD_TYPE);
        track.fmtp = Some(packetizer.fmtp());
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
                NalCodec::H264,
                self.frame_rate,
            )),
            packetizer: Box::new(H264Packetizer::with_random_ssrc(
                track.payload_type,
                max_packet_size,
            )),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MAX_PAYLOAD: usize = 1400;

    fn make_packetizer() -> H264Packetizer {
        H264Packetizer::new(96, 0xAABBCCDD, MAX_PAYLOAD)
    }

    // --- NAL extraction ---

    #[test]
    fn extract_single_nal_4byte_sc() {
        let data = [0, 0, 0, 1, 0x65, 0xAA, 0xBB];
        let nals = H264Packetizer::extract_nal_units(&data);
        assert_eq!(nals, vec![&[0x65, 0xAA, 0xBB][..]]);
    }

    #[test]
    fn extract_mixed_start_codes() {
        let mut data = vec![0, 0, 0, 1, 0x67, 0x42];
        data.extend_from_slice(&[0, 0, 1, 0x68, 0xCE]);
        let nals = H264Packetizer::extract_nal_units(&data);
        assert_eq!(nals.len(), 2);
        assert_eq!(nals[0], &[0x67, 0x42]);
        assert_eq!(nals[1], &[0x68, 0xCE]);
    }

    #[test]
    fn extract_no_start_code() {
        assert!(H264Packetizer::extract_nal_units(&[0xFF, 0xFE]).is_empty());
    }

    // --- Packetization ---

    #[test]
    fn small_nal_single_packet() {
        let mut p = make_packetizer();
        let nal = vec![0x65, 0xAA, 0xBB, 0xCC];
        let packets = p.packetize_nal(&nal, true);
        assert_eq!(packets.len(), 1);
        assert_eq!(packets[0].len(), 12 + 4);
        assert_eq!(packets[0][1] & 0x80, 0x80); // marker bit
    }

    #[test]
    fn large_nal_fragmented() {
        let mut p = H264Packetizer::new(96, 0x11223344, MAX_PAYLOAD);
        let mut nal = vec![0x65]; // NAL header
        nal.extend(vec![0xAA; MAX_PAYLOAD + 500]);
        let packets = p.packetize_nal(&nal, true);
        assert_eq!(packets.len(), 2);

        assert_eq!(packets[0][12] & 0x1f, 28); // FU-A type
        assert_eq!(packets[0][13] & 0x80, 0x80); // Start bit
        assert_eq!(packets[0][1] & 0x80, 0); // no marker mid-NAL

        let last = packets.last().unwrap();
        assert_eq!(last[13] & 0x40, 0x40); // End bit
        assert_eq!(last[1] & 0x80, 0x80); // Marker bit

        let carried: usize = packets.iter().map(|p| p.len() - 14).sum();
        assert_eq!(carried, nal.len() - 1);
    }

    #[test]
    fn marker_only_on_last_nal_of_frame() {
        let mut p = make_packetizer();
        let frame = [0, 0, 0, 1, 0x67, 0x42, 0, 0, 0, 1, 0x65, 0x88];
        let packets = p.packetize(&frame, 3000);
        assert_eq!(packets.len(), 2);
        assert_eq!(packets[0][1] & 0x80, 0);
        assert_eq!(packets[1][1] & 0x80, 0x80);
        for packet in &packets {
            assert_eq!(u32::from_be_bytes([packet[4], packet[5], packet[6], packet[7]]), 3000);
        }
    }

    #[test]
    fn fmtp_includes_parameter_sets_when_known() {
        let bare = make_packetizer();
        assert_eq!(bare.fmtp(), "packetization-mode=1");

        let p = make_packetizer().with_parameter_sets(
            Some(vec![0x67, 0x42, 0x00, 0x1e]),
            Some(vec![0x68, 0xce, 0x38, 0x80]),
        );
        let fmtp = p.fmtp();
        assert!(fmtp.contains("profile-level-id=42001e"));
        assert!(fmtp.contains("sprop-parameter-sets=Z0IAHg==,aM44gA=="));
    }
}
