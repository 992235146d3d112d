//! Annex B byte-stream framing shared by the H.264 and H.265 sources.
//!
//! NAL units are delimited by `00 00 01` start codes (a 4-byte `00 00 00
//! 01` code leaves a trailing zero on the previous NAL, which is trimmed).
//! Access units are rebuilt from NALs: a new picture starts at a
//! parameter set / delimiter / SEI after a coded slice, or at a slice whose
//! first-slice flag is set.

use std::fs::File;
use std::io::{self, BufReader, Read, Seek, SeekFrom};
use std::path::Path;

use super::{Frame, FrameSource};

const READ_CHUNK: usize = 64 * 1024;

/// Parameter sets are expected within this many NALs of the start.
const PROBE_NAL_LIMIT: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NalCodec {
    H264,
    H265,
}

impl NalCodec {
    pub fn nal_type(self, nal: &[u8]) -> u8 {
        match (self, nal.first()) {
            (_, None) => 0,
            (Self::H264, Some(b)) => b & 0x1f,
            (Self::H265, Some(b)) => (b >> 1) & 0x3f,
        }
    }

    pub fn is_vcl(self, nal: &[u8]) -> bool {
        let t = self.nal_type(nal);
        match self {
            Self::H264 => (1..=5).contains(&t),
            Self::H265 => t < 32,
        }
    }

    /// `first_mb_in_slice == 0` (H.264) / `first_slice_segment_in_pic_flag`
    /// (H.265). Both are the first bit after the NAL header.
    pub fn is_first_slice(self, nal: &[u8]) -> bool {
        let header_len = match self {
            Self::H264 => 1,
            Self::H265 => 2,
        };
        nal.get(header_len).is_some_and(|b| b & 0x80 != 0)
    }

    /// Non-VCL NALs that may only appear before the first slice of a picture.
    pub fn starts_access_unit(self, nal: &[u8]) -> bool {
        let t = self.nal_type(nal);
        match self {
            Self::H264 => matches!(t, 6..=9 | 14..=18),
            Self::H265 => matches!(t, 32..=35 | 39 | 41..=44),
        }
    }

    pub fn is_keyframe(self, nal: &[u8]) -> bool {
        let t = self.nal_type(nal);
        match self {
            Self::H264 => t == 5,
            Self::H265 => (16..=21).contains(&t),
        }
    }
}

/// Incremental NAL unit reader over a seekable byte stream.
pub struct NalReader<R> {
    reader: R,
    buf: Vec<u8>,
    pos: usize,
    eof: bool,
}

impl<R: Read + Seek> NalReader<R> {
    pub fn new(reader: R) -> Self {
        Self {
            reader,
            buf: Vec::new(),
            pos: 0,
            eof: false,
        }
    }

    pub fn rewind(&mut self) -> io::Result<()> {
        self.reader.seek(SeekFrom::Start(0))?;
        self.buf.clear();
        self.pos = 0;
        self.eof = false;
        Ok(())
    }

    fn fill(&mut self) -> io::Result<()> {
        let mut chunk = vec![0u8; READ_CHUNK];
        let n = self.reader.read(&mut chunk)?;
        if n == 0 {
            self.eof = true;
        } else {
            self.buf.extend_from_slice(&chunk[..n]);
        }
        Ok(())
    }

    /// Next NAL unit without its start code, or `None` at end of stream.
    pub fn next_nal(&mut self) -> io::Result<Option<Vec<u8>>> {
        if self.pos > 0 {
            self.buf.drain(..self.pos);
            self.pos = 0;
        }

        loop {
            // Skip to just past the next start code.
            loop {
                if let Some(offset) = find_start_code(&self.buf[self.pos..]) {
                    self.pos += offset + 3;
                    break;
                }
                if self.eof {
                    self.pos = self.buf.len();
                    return Ok(None);
                }
                // A start code may straddle the refill boundary.
                self.pos = self.buf.len().saturating_sub(2).max(self.pos);
                self.fill()?;
            }

            // Find where this NAL ends.
            let mut searched = 0usize;
            let end = loop {
                let from = self.pos + searched;
                if let Some(offset) = find_start_code(&self.buf[from..]) {
                    break from + offset;
                }
                if self.eof {
                    break self.buf.len();
                }
                searched = (self.buf.len() - self.pos).saturating_sub(2);
                self.fill()?;
            };

            let nal = trim_trailing_zeros(&self.buf[self.pos..end]).to_vec();
            self.pos = end;
            if !nal.is_empty() {
                return Ok(Some(nal));
            }
            if self.pos >= self.buf.len() && self.eof {
                return Ok(None);
            }
        }
    }
}

fn find_start_code(data: &[u8]) -> Option<usize> {
    data.windows(3).position(|w| w == [0, 0, 1])
}

fn trim_trailing_zeros(nal: &[u8]) -> &[u8] {
    let end = nal.iter().rposition(|&b| b != 0).map_or(0, |i| i + 1);
    &nal[..end]
}

/// Parameter sets found near the start of a stream.
#[derive(Debug, Default, Clone)]
pub struct ParameterSets {
    pub vps: Option<Vec<u8>>,
    pub sps: Option<Vec<u8>>,
    pub pps: Option<Vec<u8>>,
    /// NAL units seen while scanning.
    pub nal_count: usize,
}

/// Scan the beginning of `path` for the codec's parameter sets.
pub fn scan_parameter_sets(path: &Path, codec: NalCodec) -> io::Result<ParameterSets> {
    let mut reader = NalReader::new(BufReader::new(File::open(path)?));
    let mut sets = ParameterSets::default();

    while sets.nal_count < PROBE_NAL_LIMIT {
        let Some(nal) = reader.next_nal()? else {
            break;
        };
        sets.nal_count += 1;
        let t = codec.nal_type(&nal);
        let slot = match (codec, t) {
            (NalCodec::H264, 7) | (NalCodec::H265, 33) => &mut sets.sps,
            (NalCodec::H264, 8) | (NalCodec::H265, 34) => &mut sets.pps,
            (NalCodec::H265, 32) => &mut sets.vps,
            _ => continue,
        };
        if slot.is_none() {
            *slot = Some(nal);
        }
        let complete = sets.sps.is_some()
            && sets.pps.is_some()
            && (codec == NalCodec::H264 || sets.vps.is_some());
        if complete {
            break;
        }
    }

    Ok(sets)
}

/// Frame source yielding one access unit (with 4-byte start codes) per frame
/// at a fixed frame rate.
pub struct AccessUnitSource<R> {
    nals: NalReader<R>,
    codec: NalCodec,
    frame_duration: f64,
    lookahead: Option<Vec<u8>>,
    frame_index: u64,
}

impl<R: Read + Seek> AccessUnitSource<R> {
    pub fn new(reader: R, codec: NalCodec, frame_rate: f64) -> Self {
        Self {
            nals: NalReader::new(reader),
            codec,
            frame_duration: 1.0 / frame_rate,
            lookahead: None,
            frame_index: 0,
        }
    }
}

impl<R: Read + Seek + Send> FrameSource for AccessUnitSource<R> {
    fn next_frame(&mut self) -> io::Result<Option<Frame>> {
        let mut data = Vec::new();
        let mut saw_vcl = false;
        let mut keyframe = false;

        loop {
            let nal = match self.lookahead.take() {
                Some(nal) => nal,
                None => match self.nals.next_nal()? {
                    Some(nal) => nal,
                    None => break,
                },
            };

            let starts_new = self.codec.starts_access_unit(&nal)
                || (self.codec.is_vcl(&nal) && self.codec.is_first_slice(&nal));
            if saw_vcl && starts_new {
                self.lookahead = Some(nal);
                break;
            }

            if self.codec.is_vcl(&nal) {
                saw_vcl = true;
                keyframe |= self.codec.is_keyframe(&nal);
            }
            data.extend_from_slice(&[0, 0, 0, 1]);
            data.extend_from_slice(&nal);
        }

        if data.is_empty() {
            return Ok(None);
        }

        let pts = self.frame_index as f64 * self.frame_duration;
        self.frame_index += 1;
        Ok(Some(Frame {
            data,
            pts,
            duration: self.frame_duration,
            keyframe,
        }))
    }

    fn rewind(&mut self) -> io::Result<()> {
        self.nals.rewind()?;
        self.lookahead = None;
        self.frame_index = 0;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn stream(nals: &[&[u8]]) -> Vec<u8> {
        let mut out = Vec::new();
        for nal in nals {
            out.extend_from_slice(&[0, 0, 0, 1]);
            out.extend_from_slice(nal);
        }
        out
    }

    const SPS: &[u8] = &[0x67, 0x42, 0x00, 0x1e, 0xab];
    const PPS: &[u8] = &[0x68, 0xce, 0x38, 0x80];
    const IDR: &[u8] = &[0x65, 0x88, 0x84, 0x21];
    const P_SLICE: &[u8] = &[0x41, 0x9a, 0x02, 0x03];
    const P_SLICE_CONT: &[u8] = &[0x41, 0x1a, 0x02, 0x03];

    #[test]
    fn reads_nals_with_mixed_start_codes() {
        let mut data = vec![0, 0, 0, 1, 0x67, 0x42];
        data.extend_from_slice(&[0, 0, 1, 0x68, 0xCE]);
        let mut reader = NalReader::new(Cursor::new(data));
        assert_eq!(reader.next_nal().unwrap(), Some(vec![0x67, 0x42]));
        assert_eq!(reader.next_nal().unwrap(), Some(vec![0x68, 0xCE]));
        assert_eq!(reader.next_nal().unwrap(), None);
    }

    #[test]
    fn no_start_code_yields_nothing() {
        let mut reader = NalReader::new(Cursor::new(vec![0xFF, 0xFE, 0x00]));
        assert_eq!(reader.next_nal().unwrap(), None);
    }

    #[test]
    fn nal_larger_than_read_chunk() {
        let mut big = vec![0x65];
        big.extend(std::iter::repeat_n(0xAB, READ_CHUNK * 2 + 17));
        let data = stream(&[&big, PPS]);
        let mut reader = NalReader::new(Cursor::new(data));
        assert_eq!(reader.next_nal().unwrap().unwrap().len(), big.len());
        assert_eq!(reader.next_nal().unwrap(), Some(PPS.to_vec()));
    }

    #[test]
    fn groups_access_units() {
        let data = stream(&[SPS, PPS, IDR, P_SLICE, P_SLICE_CONT, P_SLICE]);
        let mut source = AccessUnitSource::new(Cursor::new(data), NalCodec::H264, 25.0);

        let first = source.next_frame().unwrap().unwrap();
        assert!(first.keyframe);
        assert_eq!(first.pts, 0.0);
        assert_eq!(first.data, stream(&[SPS, PPS, IDR]));

        let second = source.next_frame().unwrap().unwrap();
        assert!(!second.keyframe);
        assert!((second.pts - 0.04).abs() < 1e-9);
        assert_eq!(second.data, stream(&[P_SLICE, P_SLICE_CONT]));

        let third = source.next_frame().unwrap().unwrap();
        assert_eq!(third.data, stream(&[P_SLICE]));
        assert!(source.next_frame().unwrap().is_none());
    }

    #[test]
    fn rewind_restarts_timeline() {
        let data = stream(&[SPS, PPS, IDR, P_SLICE]);
        let mut source = AccessUnitSource::new(Cursor::new(data), NalCodec::H264, 25.0);
        source.next_frame().unwrap();
        source.next_frame().unwrap();
        assert_eq!(source.seek(0.0).unwrap(), Some(0.0));
        let again = source.next_frame().unwrap().unwrap();
        assert_eq!(again.pts, 0.0);
        assert!(again.keyframe);
    }

    #[test]
    fn seek_without_index_keeps_position() {
        let data = stream(&[SPS, PPS, IDR, P_SLICE]);
        let mut source = AccessUnitSource::new(Cursor::new(data), NalCodec::H264, 25.0);
        source.next_frame().unwrap();
        assert_eq!(source.seek(3.0).unwrap(), None);
        assert!((source.next_frame().unwrap().unwrap().pts - 0.04).abs() < 1e-9);
    }

    #[test]
    fn h265_nal_classification() {
        let vps = [0x40, 0x01];
        let idr = [0x26, 0x01, 0x80];
        let trail = [0x02, 0x01, 0x00];
        assert!(NalCodec::H265.starts_access_unit(&vps));
        assert!(NalCodec::H265.is_vcl(&idr));
        assert!(NalCodec::H265.is_keyframe(&idr));
        assert!(NalCodec::H265.is_first_slice(&idr));
        assert!(!NalCodec::H265.is_first_slice(&trail));
    }
}
