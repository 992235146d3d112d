/// Generic RTP fixed header builder (RFC 3550 §5.1).
///
/// ```text
///  0                   1                   2                   3
///  0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// |V=2|P|X|  CC   |M|     PT      |       Sequence Number         |
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// |                           Timestamp                           |
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// |                             SSRC                              |
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// ```
///
/// Shared by all codec packetizers. It manages:
/// - **Sequence number**: 16-bit, wrapping, random initial value.
/// - **Timestamp**: set per frame by the caller, which owns the media clock.
/// - **SSRC**: randomly generated per RFC 3550 §8.1 to avoid collisions.
/// - **Sender statistics**: packet and payload octet counts for RTCP SR.
///
/// Version is always 2. Padding, extension, and CSRC count are always 0.
#[derive(Debug)]
pub struct RtpHeader {
    /// RTP payload type (7-bit, RFC 3551).
    pub pt: u8,
    /// Synchronization source identifier (RFC 3550 §8.1).
    pub ssrc: u32,
    sequence: u16,
    timestamp: u32,
    packet_count: u32,
    octet_count: u32,
}

pub const RTP_HEADER_LEN: usize = 12;

impl RtpHeader {
    /// Create a new RTP header state with explicit SSRC and sequence start.
    pub fn new(pt: u8, ssrc: u32) -> Self {
        tracing::trace!(
            pt,
            ssrc = format_args!("{:#010X}", ssrc),
            "RTP header state created"
        );
        Self {
            pt,
            ssrc,
            sequence: 0,
            timestamp: 0,
            packet_count: 0,
            octet_count: 0,
        }
    }

    /// Create with a random SSRC and random initial sequence number.
    pub fn with_random_ssrc(pt: u8) -> Self {
        let mut header = Self::new(pt, rand::random::<u32>());
        header.sequence = rand::random::<u16>();
        header
    }

    /// Sequence number the next packet will carry.
    pub fn sequence(&self) -> u16 {
        self.sequence
    }

    pub fn timestamp(&self) -> u32 {
        self.timestamp
    }

    /// Timestamp carried by subsequent packets.
    pub fn set_timestamp(&mut self, timestamp: u32) {
        self.timestamp = timestamp;
    }

    pub fn packet_count(&self) -> u32 {
        self.packet_count
    }

    pub fn octet_count(&self) -> u32 {
        self.octet_count
    }

    /// Serialize a 12-byte RTP fixed header and advance the sequence number.
    ///
    /// The `marker` bit (RFC 3550 §5.1) signals the last packet of a frame.
    pub fn write(&mut self, marker: bool) -> [u8; RTP_HEADER_LEN] {
        let first_byte: u8 = 2 << 6;
        let second_byte: u8 = ((marker as u8) << 7) | self.pt;

        let mut header = [0u8; RTP_HEADER_LEN];
        header[0] = first_byte;
        header[1] = second_byte;
        header[2..4].copy_from_slice(&self.sequence.to_be_bytes());
        header[4..8].copy_from_slice(&self.timestamp.to_be_bytes());
        header[8..12].copy_from_slice(&self.ssrc.to_be_bytes());

        self.sequence = self.sequence.wrapping_add(1);
        header
    }

    /// Build a complete packet from payload pieces and count it in the
    /// sender statistics.
    pub fn packet(&mut self, marker: bool, payload: &[&[u8]]) -> Vec<u8> {
        let len: usize = payload.iter().map(|p| p.len()).sum();
        let mut packet = Vec::with_capacity(RTP_HEADER_LEN + len);
        packet.extend_from_slice(&self.write(marker));
        for piece in payload {
            packet.extend_from_slice(piece);
        }
        self.packet_count = self.packet_count.wrapping_add(1);
        self.octet_count = self.octet_count.wrapping_add(len as u32);
        packet
    }
}

/// Split `payload` into chunks of at most `max` bytes, returning
/// `(chunk, is_last)` pairs. Used by packetizers whose fragmentation is a
/// plain byte split.
pub(crate) fn chunks_with_last(payload: &[u8], max: usize) -> impl Iterator<Item = (usize, &[u8], bool)> {
    let max = max.max(1);
    let count = payload.len().div_ceil(max);
    payload
        .chunks(max)
        .enumerate()
        .map(move |(i, chunk)| (i * max, chunk, i + 1 == count))
}
