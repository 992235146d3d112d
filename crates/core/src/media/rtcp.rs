//! RTCP (RFC 3550 §6): sender reports and BYE for outgoing streams, and
//! validation of compound packets received from clients.

use std::time::{SystemTime, UNIX_EPOCH};

use super::rtp::RtpHeader;

pub const PT_SR: u8 = 200;
pub const PT_RR: u8 = 201;
pub const PT_SDES: u8 = 202;
pub const PT_BYE: u8 = 203;

/// Seconds between the NTP epoch (1900) and the Unix epoch.
const NTP_UNIX_OFFSET: u64 = 2_208_988_800;
const SDES_CNAME: u8 = 1;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RtcpError {
    #[error("RTCP packet too short ({0} bytes)")]
    Truncated(usize),
    #[error("unsupported RTCP version {0}")]
    Version(u8),
    #[error("compound packet must start with SR or RR, got {0}")]
    FirstPacket(u8),
    #[error("RTCP length fields do not add up to {0} bytes")]
    Length(usize),
}

/// What a received compound packet contained.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RtcpSummary {
    pub packets: usize,
    pub receiver_reports: usize,
    pub bye: bool,
}

fn header(count: u8, packet_type: u8, words: usize) -> [u8; 4] {
    let length = (words as u16).to_be_bytes();
    [0x80 | (count & 0x1F), packet_type, length[0], length[1]]
}

/// 64-bit NTP timestamp for `now`.
pub fn ntp_timestamp(now: SystemTime) -> u64 {
    let since_unix = now.duration_since(UNIX_EPOCH).unwrap_or_default();
    let seconds = since_unix.as_secs() + NTP_UNIX_OFFSET;
    let fraction = (u64::from(since_unix.subsec_nanos()) << 32) / 1_000_000_000;
    (seconds << 32) | fraction
}

/// Sender report followed by an SDES CNAME chunk.
pub fn sender_report(rtp: &RtpHeader, rtp_timestamp: u32, now: SystemTime, cname: &str) -> Vec<u8> {
    let mut packet = Vec::with_capacity(64);
    packet.extend_from_slice(&header(0, PT_SR, 6));
    packet.extend_from_slice(&rtp.ssrc.to_be_bytes());
    packet.extend_from_slice(&ntp_timestamp(now).to_be_bytes());
    packet.extend_from_slice(&rtp_timestamp.to_be_bytes());
    packet.extend_from_slice(&rtp.packet_count().to_be_bytes());
    packet.extend_from_slice(&rtp.octet_count().to_be_bytes());
    packet.extend_from_slice(&sdes(rtp.ssrc, cname));
    packet
}

fn sdes(ssrc: u32, cname: &str) -> Vec<u8> {
    let name = &cname.as_bytes()[..cname.len().min(255)];
    // SSRC + type + length + text, then at least one null octet, padded to
    // a word boundary.
    let chunk_len = (4 + 2 + name.len() + 1).div_ceil(4) * 4;
    let mut packet = Vec::with_capacity(4 + chunk_len);
    packet.extend_from_slice(&header(1, PT_SDES, chunk_len / 4));
    packet.extend_from_slice(&ssrc.to_be_bytes());
    packet.push(SDES_CNAME);
    packet.push(name.len() as u8);
    packet.extend_from_slice(name);
    packet.resize(4 + chunk_len, 0);
    packet
}

pub fn bye(ssrc: u32) -> Vec<u8> {
    let mut packet = header(1, PT_BYE, 1).to_vec();
    packet.extend_from_slice(&ssrc.to_be_bytes());
    packet
}

/// Final compound packet for a stream: SR, SDES and BYE.
pub fn goodbye(rtp: &RtpHeader, rtp_timestamp: u32, now: SystemTime, cname: &str) -> Vec<u8> {
    let mut packet = sender_report(rtp, rtp_timestamp, now, cname);
    packet.extend_from_slice(&bye(rtp.ssrc));
    packet
}

/// Validate a compound packet (RFC 3550 A.2) and summarize it.
pub fn inspect(data: &[u8]) -> Result<RtcpSummary, RtcpError> {
    if data.len() < 4 {
        return Err(RtcpError::Truncated(data.len()));
    }
    if !matches!(data[1], PT_SR | PT_RR) {
        return Err(RtcpError::FirstPacket(data[1]));
    }

    let mut summary = RtcpSummary::default();
    let mut offset = 0;
    while offset < data.len() {
        let rest = &data[offset..];
        if rest.len() < 4 {
            return Err(RtcpError::Length(data.len()));
        }
        let version = rest[0] >> 6;
        if version != 2 {
            return Err(RtcpError::Version(version));
        }
        match rest[1] {
            PT_RR => summary.receiver_reports += usize::from(rest[0] & 0x1F),
            PT_BYE => summary.bye = true,
            _ => {}
        }
        let len = (usize::from(u16::from_be_bytes([rest[2], rest[3]])) + 1) * 4;
        if len > rest.len() {
            return Err(RtcpError::Length(data.len()));
        }
        offset += len;
        summary.packets += 1;
    }
    Ok(summary)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn sender_report_layout() {
        let mut rtp = RtpHeader::new(96, 0x01020304);
        rtp.packet(false, &[&[0u8; 100]]);
        let now = UNIX_EPOCH + Duration::from_millis(1500);
        let sr = sender_report(&rtp, 9000, now, "host");

        assert_eq!(&sr[..4], &[0x80, PT_SR, 0, 6]);
        assert_eq!(&sr[4..8], &[1, 2, 3, 4]);
        let ntp = u64::from_be_bytes(sr[8..16].try_into().unwrap());
        assert_eq!(ntp >> 32, NTP_UNIX_OFFSET + 1);
        assert_eq!(ntp & 0xFFFF_FFFF, 1 << 31);
        assert_eq!(u32::from_be_bytes(sr[16..20].try_into().unwrap()), 9000);
        assert_eq!(u32::from_be_bytes(sr[20..24].try_into().unwrap()), 1);
        assert_eq!(u32::from_be_bytes(sr[24..28].try_into().unwrap()), 100);
        assert_eq!(sr[29], PT_SDES);
        assert_eq!(sr.len() % 4, 0);

        let summary = inspect(&sr).unwrap();
        assert_eq!(summary.packets, 2);
        assert!(!summary.bye);
    }

    #[test]
    fn goodbye_ends_with_bye() {
        let rtp = RtpHeader::new(96, 7);
        let packet = goodbye(&rtp, 0, SystemTime::now(), "h");
        let summary = inspect(&packet).unwrap();
        assert_eq!(summary.packets, 3);
        assert!(summary.bye);
        assert_eq!(&packet[packet.len() - 8..], &[0x81, PT_BYE, 0, 1, 0, 0, 0, 7]);
    }

    #[test]
    fn receiver_report_accepted() {
        let mut rr = vec![0x81, PT_RR, 0, 7];
        rr.extend_from_slice(&[0u8; 28]);
        let summary = inspect(&rr).unwrap();
        assert_eq!(summary.receiver_reports, 1);
    }

    #[test]
    fn malformed_packets_rejected() {
        assert_eq!(inspect(&[0x80]), Err(RtcpError::Truncated(1)));
        assert_eq!(inspect(&[0x80, PT_BYE, 0, 1, 0, 0, 0, 1]), Err(RtcpError::FirstPacket(PT_BYE)));
        assert_eq!(inspect(&[0x40, PT_RR, 0, 0]), Err(RtcpError::Version(1)));
        assert_eq!(inspect(&[0x80, PT_RR, 0, 5, 0, 0, 0, 0]), Err(RtcpError::Length(8)));
    }
}
