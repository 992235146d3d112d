use std::collections::HashSet;
use std::net::IpAddr;
use std::ops::RangeInclusive;

use crate::error::{Result, RtspError};
use crate::transport::udp::RtpSocketPair;

/// Hands out server-side RTP/RTCP port pairs (even RTP, odd RTCP) from a
/// configured range.
///
/// Allocation walks the range round-robin from where the last one ended,
/// skipping pairs already handed out and pairs some other process holds.
#[derive(Debug)]
pub struct PortAllocator {
    first: u16,
    pairs: u32,
    cursor: u32,
    in_use: HashSet<u16>,
}

impl PortAllocator {
    pub fn new(range: RangeInclusive<u16>) -> Self {
        let start = u32::from(*range.start());
        let end = u32::from(*range.end());
        let first = start + start % 2;
        let pairs = if end > first { (end - first + 1) / 2 } else { 0 };
        Self {
            first: first.min(u32::from(u16::MAX)) as u16,
            pairs,
            cursor: 0,
            in_use: HashSet::new(),
        }
    }

    /// Bind the next free pair on `ip`.
    pub fn allocate(&mut self, ip: IpAddr) -> Result<RtpSocketPair> {
        for step in 0..self.pairs {
            let index = (self.cursor + step) % self.pairs;
            let port = (u32::from(self.first) + index * 2) as u16;
            if self.in_use.contains(&port) {
                continue;
            }
            match RtpSocketPair::bind(ip, port) {
                Ok(pair) => {
                    self.in_use.insert(port);
                    self.cursor = (index + 1) % self.pairs;
                    tracing::trace!(rtp_port = port, rtcp_port = port + 1, "allocated server ports");
                    return Ok(pair);
                }
                Err(e) => tracing::trace!(port, error = %e, "port pair unavailable"),
            }
        }
        tracing::warn!(in_use = self.in_use.len(), "RTP port range exhausted");
        Err(RtspError::PortRangeExhausted)
    }

    pub fn release(&mut self, rtp_port: u16) {
        if self.in_use.remove(&rtp_port) {
            tracing::trace!(rtp_port, "released server ports");
        }
    }

    pub fn in_use(&self) -> usize {
        self.in_use.len()
    }

    pub fn capacity(&self) -> usize {
        self.pairs as usize
    }
}
