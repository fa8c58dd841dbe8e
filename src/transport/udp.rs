//! UDP transport helpers: RTP/RTCP socket pairs on adjacent even/odd
//! ports, a multicast address allocator, and the sequence-number reorder
//! buffer used on receive paths.

use std::io;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};

use tokio::net::UdpSocket;

/// Multicast TTL for published streams.
pub const MULTICAST_TTL: u32 = 16;

/// Binds an RTP/RTCP socket pair: an even port and the odd port right
/// above it. The OS picks the even port; a few attempts are made since
/// the neighbor may be taken.
pub(crate) async fn bind_pair(ip: IpAddr) -> io::Result<(UdpSocket, UdpSocket)> {
    for _ in 0..16 {
        let rtp = UdpSocket::bind((ip, 0)).await?;
        let port = rtp.local_addr()?.port();
        let rtp_port = if port % 2 == 0 { port } else { port + 1 };
        let rtp = if port % 2 == 0 {
            rtp
        } else {
            match UdpSocket::bind((ip, rtp_port)).await {
                Ok(s) => s,
                Err(_) => continue,
            }
        };
        match UdpSocket::bind((ip, rtp_port + 1)).await {
            Ok(rtcp) => return Ok((rtp, rtcp)),
            Err(_) => continue,
        }
    }
    Err(io::Error::new(
        io::ErrorKind::AddrInUse,
        "couldn't find an adjacent UDP port pair",
    ))
}

/// Binds a socket pair on the two given ports and joins the group on
/// both, for reading a multicast stream.
pub(crate) async fn bind_multicast_pair(
    group: Ipv4Addr,
    rtp_port: u16,
    rtcp_port: u16,
) -> io::Result<(UdpSocket, UdpSocket)> {
    let rtp = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, rtp_port)).await?;
    let rtcp = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, rtcp_port)).await?;
    rtp.join_multicast_v4(group, Ipv4Addr::UNSPECIFIED)?;
    rtcp.join_multicast_v4(group, Ipv4Addr::UNSPECIFIED)?;
    Ok((rtp, rtcp))
}

/// Whether a datagram source is acceptable for a negotiated peer.
/// RFC 3550 peers keep their address but may use different source ports
/// for RTP and RTCP; `any_port` relaxes the port check entirely for
/// NATed cameras.
pub(crate) fn source_ok(expected: &SocketAddr, actual: &SocketAddr, any_port: bool) -> bool {
    expected.ip() == actual.ip() && (any_port || expected.port() == actual.port())
}

/// Allocates per-media multicast IPs from a CIDR pool, first-fit starting
/// after the last handed-out address.
#[derive(Debug)]
pub struct MulticastAllocator {
    base: u32,
    size: u32,
    next: u32,
}

impl MulticastAllocator {
    /// `range` is in `a.b.c.d/len` form.
    pub fn new(range: &str) -> Result<Self, crate::Error> {
        let (addr, len) = range
            .split_once('/')
            .ok_or_else(|| crate::Error::Parse(format!("bad CIDR {:?}", range)))?;
        let addr: Ipv4Addr = addr
            .parse()
            .map_err(|_| crate::Error::Parse(format!("bad CIDR address in {:?}", range)))?;
        let len: u32 = len
            .parse()
            .map_err(|_| crate::Error::Parse(format!("bad CIDR length in {:?}", range)))?;
        if len > 31 {
            return Err(crate::Error::Parse(
                "multicast pool must hold at least two addresses".to_owned(),
            ));
        }
        let size = 1u32 << (32 - len);
        let base = u32::from(addr) & !(size - 1);
        Ok(MulticastAllocator {
            base,
            size,
            next: 0,
        })
    }

    pub fn allocate(&mut self) -> Ipv4Addr {
        let addr = Ipv4Addr::from(self.base + self.next);
        self.next = (self.next + 1) % self.size;
        addr
    }
}

/// Reorders datagrams by sequence number within a bounded window. Players
/// typically run without one (depth 0 = passthrough); record receivers
/// use a small window.
#[derive(Debug)]
pub struct ReorderBuffer {
    depth: usize,
    slots: Vec<Option<crate::rtp::Packet>>,
    next_seq: Option<u16>,
}

impl ReorderBuffer {
    pub fn new(depth: usize) -> Self {
        ReorderBuffer {
            depth,
            slots: (0..depth).map(|_| None).collect(),
            next_seq: None,
        }
    }

    /// Feeds one packet; returns the packets now deliverable in order.
    pub fn push(&mut self, pkt: crate::rtp::Packet) -> Vec<crate::rtp::Packet> {
        if self.depth == 0 {
            return vec![pkt];
        }
        let seq = pkt.sequence_number;
        let next = match self.next_seq {
            None => {
                self.next_seq = Some(seq.wrapping_add(1));
                return vec![pkt];
            }
            Some(n) => n,
        };
        let gap = seq.wrapping_sub(next);
        if gap > 0x8000 {
            // Stale duplicate from behind the window.
            return Vec::new();
        }
        if gap == 0 {
            let mut out = vec![pkt];
            let mut n = next.wrapping_add(1);
            loop {
                let slot = usize::from(n) % self.depth;
                match self.slots[slot].take() {
                    Some(p) if p.sequence_number == n => {
                        out.push(p);
                        n = n.wrapping_add(1);
                    }
                    other => {
                        self.slots[slot] = other;
                        break;
                    }
                }
            }
            self.next_seq = Some(n);
            return out;
        }
        if usize::from(gap) < self.depth {
            let slot = usize::from(seq) % self.depth;
            self.slots[slot] = Some(pkt);
            return Vec::new();
        }
        // Too far ahead: stop waiting for the hole. Flush whatever is
        // buffered in order, then the new packet.
        let mut out = Vec::new();
        for k in 0..self.depth as u16 {
            let n = next.wrapping_add(k);
            let slot = usize::from(n) % self.depth;
            if let Some(p) = self.slots[slot].take() {
                if p.sequence_number == n {
                    out.push(p);
                } else {
                    self.slots[slot] = Some(p);
                }
            }
        }
        self.next_seq = Some(seq.wrapping_add(1));
        out.push(pkt);
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    fn pkt(seq: u16) -> crate::rtp::Packet {
        crate::rtp::Packet {
            payload_type: 96,
            sequence_number: seq,
            timestamp: 0,
            ssrc: 0,
            mark: false,
            payload: Bytes::from_static(&[0]),
        }
    }

    fn seqs(pkts: &[crate::rtp::Packet]) -> Vec<u16> {
        pkts.iter().map(|p| p.sequence_number).collect()
    }

    #[test]
    fn passthrough_without_depth() {
        let mut b = ReorderBuffer::new(0);
        assert_eq!(seqs(&b.push(pkt(5))), [5]);
        assert_eq!(seqs(&b.push(pkt(4))), [4]);
    }

    #[test]
    fn reorders_within_window() {
        let mut b = ReorderBuffer::new(8);
        assert_eq!(seqs(&b.push(pkt(10))), [10]);
        assert_eq!(seqs(&b.push(pkt(12))), [] as [u16; 0]);
        assert_eq!(seqs(&b.push(pkt(13))), [] as [u16; 0]);
        assert_eq!(seqs(&b.push(pkt(11))), [11, 12, 13]);
        assert_eq!(seqs(&b.push(pkt(14))), [14]);
    }

    #[test]
    fn flushes_when_hole_never_fills() {
        let mut b = ReorderBuffer::new(4);
        assert_eq!(seqs(&b.push(pkt(0))), [0]);
        assert_eq!(seqs(&b.push(pkt(2))), [] as [u16; 0]);
        // Far ahead of the window: give up on seq 1.
        assert_eq!(seqs(&b.push(pkt(9))), [2, 9]);
        assert_eq!(seqs(&b.push(pkt(10))), [10]);
    }

    #[test]
    fn multicast_allocator_wraps() {
        let mut a = MulticastAllocator::new("239.64.0.0/30").unwrap();
        assert_eq!(a.allocate(), Ipv4Addr::new(239, 64, 0, 0));
        assert_eq!(a.allocate(), Ipv4Addr::new(239, 64, 0, 1));
        assert_eq!(a.allocate(), Ipv4Addr::new(239, 64, 0, 2));
        assert_eq!(a.allocate(), Ipv4Addr::new(239, 64, 0, 3));
        assert_eq!(a.allocate(), Ipv4Addr::new(239, 64, 0, 0));
    }

    #[test]
    fn source_filtering() {
        let expected: SocketAddr = "10.0.0.1:5000".parse().unwrap();
        assert!(source_ok(&expected, &"10.0.0.1:5000".parse().unwrap(), false));
        assert!(!source_ok(&expected, &"10.0.0.1:5002".parse().unwrap(), false));
        assert!(source_ok(&expected, &"10.0.0.1:5002".parse().unwrap(), true));
        assert!(!source_ok(&expected, &"10.0.0.2:5000".parse().unwrap(), true));
    }
}
