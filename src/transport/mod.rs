//! The RTP/RTCP data plane: UDP socket pairs (unicast and multicast) and
//! the serialized writer for TCP-interleaved channels.

pub mod tcp;
pub mod udp;

use std::net::SocketAddr;

use crate::headers::Direction;

/// Where one media's RTP/RTCP flows for one session, as negotiated by
/// SETUP.
#[derive(Clone, Debug)]
pub enum Binding {
    /// Interleaved in the RTSP connection on the given channel pair
    /// (even = RTP, odd = RTCP).
    Tcp { channels: (u8, u8) },
    /// Datagram pair to the peer's negotiated addresses. The RTP and
    /// RTCP source ports of the peer may differ from each other.
    Udp {
        peer_rtp: SocketAddr,
        peer_rtcp: SocketAddr,
    },
    /// Shared multicast group for all readers of a stream.
    Multicast {
        group: std::net::Ipv4Addr,
        rtp_port: u16,
        rtcp_port: u16,
    },
}

/// A media's negotiated transport within a session.
#[derive(Clone, Debug)]
pub struct TransportBinding {
    pub media_idx: usize,
    pub direction: Direction,
    pub binding: Binding,
}
