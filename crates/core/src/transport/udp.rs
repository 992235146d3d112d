use std::io;
use std::net::{IpAddr, SocketAddr};

use mio::net::UdpSocket;

/// Server-side RTP/RTCP socket pair for one UDP stream.
///
/// RTP goes out of the even port, RTCP out of (and into) the odd one.
/// Nothing is read from the RTP socket; the RTCP socket is watched by the
/// scheduler for receiver reports and BYE.
#[derive(Debug)]
pub struct RtpSocketPair {
    pub rtp: UdpSocket,
    pub rtcp: UdpSocket,
    pub rtp_port: u16,
}

impl RtpSocketPair {
    pub fn bind(ip: IpAddr, rtp_port: u16) -> io::Result<Self> {
        let rtcp_port = rtp_port
            .checked_add(1)
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "no room for RTCP port"))?;
        let rtp = UdpSocket::bind(SocketAddr::new(ip, rtp_port))?;
        let rtcp = UdpSocket::bind(SocketAddr::new(ip, rtcp_port))?;
        Ok(Self { rtp, rtcp, rtp_port })
    }

    pub fn rtcp_port(&self) -> u16 {
        self.rtp_port + 1
    }
}

/// Send one datagram. A full socket buffer drops the packet rather than
/// stalling the scheduler.
pub fn send_datagram(socket: &UdpSocket, payload: &[u8], addr: SocketAddr) -> io::Result<()> {
    match socket.send_to(payload, addr) {
        Ok(_) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
            tracing::trace!(%addr, len = payload.len(), "UDP send buffer full; packet dropped");
            Ok(())
        }
        Err(e) => Err(e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;
    use std::time::Duration;

    #[test]
    fn pair_sends_from_adjacent_ports() {
        let probe = std::net::UdpSocket::bind("127.0.0.1:0").unwrap();
        probe.set_read_timeout(Some(Duration::from_secs(2))).unwrap();
        let target = probe.local_addr().unwrap();

        let ip = IpAddr::V4(Ipv4Addr::LOCALHOST);
        let pair = (41000u16..41200)
            .step_by(2)
            .find_map(|port| RtpSocketPair::bind(ip, port).ok())
            .expect("no free port pair");

        send_datagram(&pair.rtp, b"rtp", target).unwrap();
        let mut buf = [0u8; 16];
        let (len, from) = probe.recv_from(&mut buf).unwrap();
        assert_eq!(&buf[..len], b"rtp");
        assert_eq!(from.port(), pair.rtp_port);
        assert_eq!(pair.rtcp_port(), pair.rtp_port + 1);
    }

    #[test]
    fn odd_top_port_has_no_rtcp_partner() {
        assert!(RtpSocketPair::bind(IpAddr::V4(Ipv4Addr::LOCALHOST), u16::MAX).is_err());
    }
}
