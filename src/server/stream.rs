//! A published stream: one publisher (an ANNOUNCE/RECORD session or the
//! application itself), any number of readers. Packets written to the
//! stream fan out to every registered reader's negotiated transport;
//! SSRCs are allocated per media and stay stable across readers.

use std::collections::HashMap;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;

use bytes::Bytes;
use log::debug;
use rand::Rng;
use tokio::net::UdpSocket;
use tokio::sync::{Mutex, RwLock};

use crate::presentation::MediaInfo;
use crate::transport::tcp::ConnWriter;
use crate::{rtcp, Error, NtpTimestamp};

/// Where one reader receives one media.
#[derive(Clone)]
pub(crate) enum ReaderBinding {
    Tcp {
        writer: ConnWriter,
        channels: (u8, u8),
    },
    Udp {
        socket: Arc<UdpSocket>,
        peer_rtp: SocketAddr,
        peer_rtcp: SocketAddr,
    },
    /// The reader joined the stream's multicast group; delivery is
    /// shared, nothing is sent per reader.
    Multicast,
}

struct Reader {
    bindings: HashMap<usize, ReaderBinding>,
}

#[derive(Debug, Default)]
struct SenderStats {
    packets: u32,
    octets: u32,
    last_rtp_ts: u32,
    sent_any: bool,
}

pub(crate) struct MulticastOut {
    pub(crate) group: Ipv4Addr,
    pub(crate) rtp_port: u16,
    pub(crate) rtcp_port: u16,
    pub(crate) rtp_socket: Arc<UdpSocket>,
    pub(crate) rtcp_socket: Arc<UdpSocket>,
}

/// A server-side stream: its media descriptions plus the reader fan-out
/// machinery.
pub struct ServerStream {
    name: String,
    medias: Vec<MediaInfo>,
    ssrcs: Vec<u32>,
    readers: RwLock<HashMap<String, Reader>>,
    stats: Mutex<Vec<SenderStats>>,
    multicast: Mutex<HashMap<usize, Arc<MulticastOut>>>,
}

impl ServerStream {
    pub fn new(name: &str, medias: Vec<MediaInfo>) -> Arc<Self> {
        let mut rng = rand::thread_rng();
        let ssrcs = medias.iter().map(|_| rng.gen()).collect();
        let stats = medias.iter().map(|_| SenderStats::default()).collect();
        Arc::new(ServerStream {
            name: name.to_owned(),
            medias,
            ssrcs,
            readers: RwLock::new(HashMap::new()),
            stats: Mutex::new(stats),
            multicast: Mutex::new(HashMap::new()),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn medias(&self) -> &[MediaInfo] {
        &self.medias
    }

    /// The stable SSRC of one media's outgoing RTP flow.
    pub fn ssrc(&self, media_idx: usize) -> Option<u32> {
        self.ssrcs.get(media_idx).copied()
    }

    /// The SDP body served in DESCRIBE responses.
    pub fn sdp(&self) -> String {
        crate::presentation::Presentation::marshal_sdp(&self.name, &self.medias)
    }

    pub(crate) async fn multicast_out(&self, media_idx: usize) -> Option<Arc<MulticastOut>> {
        self.multicast.lock().await.get(&media_idx).cloned()
    }

    pub(crate) async fn set_multicast_out(&self, media_idx: usize, out: Arc<MulticastOut>) {
        self.multicast.lock().await.insert(media_idx, out);
    }

    /// Registers a reader session. It receives every packet published
    /// after this call, none after `remove_reader`.
    pub(crate) async fn add_reader(
        &self,
        session_id: &str,
        bindings: HashMap<usize, ReaderBinding>,
    ) {
        self.readers
            .write()
            .await
            .insert(session_id.to_owned(), Reader { bindings });
    }

    pub(crate) async fn remove_reader(&self, session_id: &str) {
        self.readers.write().await.remove(session_id);
    }

    pub(crate) async fn reader_count(&self) -> usize {
        self.readers.read().await.len()
    }

    /// Publishes one RTP packet on a media: restamps it with the
    /// stream's SSRC and fans it out to all current readers.
    pub async fn write_rtp(&self, media_idx: usize, pkt: &crate::rtp::Packet) -> Result<(), Error> {
        let ssrc = match self.ssrcs.get(media_idx) {
            Some(s) => *s,
            None => return Err(Error::Parse(format!("no media {}", media_idx))),
        };
        let mut pkt = pkt.clone();
        pkt.ssrc = ssrc;
        let wire = pkt.marshal();
        {
            let mut stats = self.stats.lock().await;
            let s = &mut stats[media_idx];
            s.packets = s.packets.wrapping_add(1);
            s.octets = s.octets.wrapping_add(pkt.payload.len() as u32);
            s.last_rtp_ts = pkt.timestamp;
            s.sent_any = true;
        }
        if let Some(out) = self.multicast_out(media_idx).await {
            let dest = SocketAddr::new(out.group.into(), out.rtp_port);
            if let Err(e) = out.rtp_socket.send_to(&wire, dest).await {
                debug!("multicast send failed: {}", e);
            }
        }
        let readers = self.readers.read().await;
        for (session_id, reader) in readers.iter() {
            match reader.bindings.get(&media_idx) {
                Some(ReaderBinding::Tcp { writer, channels }) => {
                    if let Err(e) = writer.send_data(channels.0, wire.clone()).await {
                        debug!("reader {} send failed: {}", session_id, e);
                    }
                }
                Some(ReaderBinding::Udp {
                    socket, peer_rtp, ..
                }) => {
                    if let Err(e) = socket.send_to(&wire, *peer_rtp).await {
                        debug!("reader {} send failed: {}", session_id, e);
                    }
                }
                Some(ReaderBinding::Multicast) | None => {}
            }
        }
        Ok(())
    }

    /// Sends a sender report for every media that has carried data,
    /// paced by the server's report timer.
    pub(crate) async fn send_sender_reports(&self) {
        for media_idx in 0..self.medias.len() {
            let sr = {
                let mut stats = self.stats.lock().await;
                let s = &mut stats[media_idx];
                if !s.sent_any {
                    continue;
                }
                rtcp::SenderReport {
                    ssrc: self.ssrcs[media_idx],
                    ntp_timestamp: NtpTimestamp::from_system_time(std::time::SystemTime::now()),
                    rtp_timestamp: s.last_rtp_ts,
                    packet_count: s.packets,
                    octet_count: s.octets,
                    reports: vec![],
                }
                .marshal()
            };
            self.send_rtcp(media_idx, sr).await;
        }
    }

    pub(crate) async fn send_rtcp(&self, media_idx: usize, payload: Bytes) {
        if let Some(out) = self.multicast_out(media_idx).await {
            let dest = SocketAddr::new(out.group.into(), out.rtcp_port);
            let _ = out.rtcp_socket.send_to(&payload, dest).await;
        }
        let readers = self.readers.read().await;
        for reader in readers.values() {
            match reader.bindings.get(&media_idx) {
                Some(ReaderBinding::Tcp { writer, channels }) => {
                    let _ = writer.send_data(channels.1, payload.clone()).await;
                }
                Some(ReaderBinding::Udp {
                    socket, peer_rtcp, ..
                }) => {
                    let _ = socket.send_to(&payload, *peer_rtcp).await;
                }
                Some(ReaderBinding::Multicast) | None => {}
            }
        }
    }
}
