//! RTSP server: accepts connections, hosts published streams, and routes
//! RTP/RTCP between publishers and readers over TCP-interleaved, UDP, and
//! UDP-multicast transports.
//!
//! The server is a hub: ANNOUNCE/RECORD sessions (or the application, via
//! [`Server::add_stream`] and [`ServerStream::write_rtp`]) publish;
//! DESCRIBE/SETUP/PLAY sessions read. The application observes inbound
//! packets through [`ServerHandler::on_packet_rtp`].

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use log::{debug, info};
use tokio::net::{TcpListener, UdpSocket};
use tokio::sync::Mutex;

use crate::auth::Credentials;
use crate::headers::Direction;
use crate::rtcp;
use crate::server::session::ServerSession;
use crate::transport::udp::MulticastAllocator;
use crate::transport::Binding;
use crate::Error;

mod conn;
pub(crate) mod session;
mod stream;

pub use stream::ServerStream;

/// Context for a packet handed to [`ServerHandler::on_packet_rtp`].
#[derive(Clone, Debug)]
pub struct PacketContext {
    pub session_id: String,
    pub path: String,
    pub media_idx: usize,
}

/// Application hooks. All methods are optional and called from the
/// server's connection tasks; they must not block.
pub trait ServerHandler: Send + Sync + 'static {
    /// Called on DESCRIBE/SETUP when no published stream matches `path`;
    /// return a stream to serve it anyway.
    fn on_describe(&self, _path: &str) -> Option<Arc<ServerStream>> {
        None
    }

    /// Called for every RTP packet received in the record direction: from
    /// publishers, and from back-channel audio of play sessions.
    fn on_packet_rtp(&self, _ctx: &PacketContext, _pkt: &crate::rtp::Packet) {}

    /// Called when a session ends (TEARDOWN, connection close, or
    /// keepalive expiry).
    fn on_session_closed(&self, _session_id: &str) {}
}

/// A handler for servers that only need the built-in routing.
pub struct NullHandler;

impl ServerHandler for NullHandler {}

#[derive(Clone)]
pub struct ServerConfig {
    /// TCP listen address, e.g. `0.0.0.0:8554`.
    pub rtsp_address: String,

    /// UDP binding for the server's RTP socket; `None` disables UDP
    /// transport (clients get 461 when asking for it).
    pub udp_rtp_address: Option<String>,
    /// UDP binding for the RTCP socket; defaults to RTP port + 1.
    pub udp_rtcp_address: Option<String>,

    /// CIDR pool for per-media multicast groups, e.g. `239.64.0.0/16`;
    /// `None` disables multicast.
    pub multicast_ip_range: Option<String>,
    pub multicast_rtp_port: u16,
    pub multicast_rtcp_port: u16,

    pub read_timeout: Duration,
    pub write_timeout: Duration,

    /// Sessions expire when idle for this long (no request and no
    /// record-direction data).
    pub session_timeout: Duration,

    /// Credentials all requests except OPTIONS must present; `None`
    /// disables authentication.
    pub creds: Option<Credentials>,
    pub realm: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        ServerConfig {
            rtsp_address: "0.0.0.0:8554".to_owned(),
            udp_rtp_address: None,
            udp_rtcp_address: None,
            multicast_ip_range: None,
            multicast_rtp_port: 5000,
            multicast_rtcp_port: 5001,
            read_timeout: Duration::from_secs(10),
            write_timeout: Duration::from_secs(10),
            session_timeout: Duration::from_secs(60),
            creds: None,
            realm: "ocular".to_owned(),
        }
    }
}

pub(crate) struct ServerUdp {
    pub(crate) rtp: Arc<UdpSocket>,
    pub(crate) rtcp: Arc<UdpSocket>,
    pub(crate) rtp_port: u16,
    pub(crate) rtcp_port: u16,
}

pub(crate) struct ServerInner {
    pub(crate) config: ServerConfig,
    pub(crate) handler: Arc<dyn ServerHandler>,
    pub(crate) streams: Mutex<HashMap<String, Arc<ServerStream>>>,
    pub(crate) sessions: Mutex<HashMap<String, Arc<ServerSession>>>,
    pub(crate) multicast: Mutex<Option<MulticastAllocator>>,
    pub(crate) udp: Option<ServerUdp>,
    /// Record-direction UDP demux: datagram source -> (session, media).
    pub(crate) udp_routes: Mutex<HashMap<SocketAddr, (String, usize)>>,
}

/// A running RTSP server. Dropping the handle stops accepting; active
/// connections run until they close.
pub struct Server {
    inner: Arc<ServerInner>,
    local_addr: SocketAddr,
    tasks: Vec<tokio::task::JoinHandle<()>>,
}

impl Server {
    /// Binds the listener (and the optional UDP sockets) and starts
    /// serving in background tasks.
    pub async fn bind(config: ServerConfig, handler: Arc<dyn ServerHandler>) -> Result<Server, Error> {
        let listener = TcpListener::bind(&config.rtsp_address).await?;
        let local_addr = listener.local_addr()?;

        let udp = match &config.udp_rtp_address {
            None => None,
            Some(rtp_addr) => {
                let rtp = UdpSocket::bind(rtp_addr.as_str()).await?;
                let rtp_port = rtp.local_addr()?.port();
                let rtcp_addr = config
                    .udp_rtcp_address
                    .clone()
                    .unwrap_or_else(|| {
                        let ip = rtp_addr.rsplit_once(':').map(|(ip, _)| ip).unwrap_or("0.0.0.0");
                        format!("{}:{}", ip, rtp_port + 1)
                    });
                let rtcp = UdpSocket::bind(rtcp_addr.as_str()).await?;
                Some(ServerUdp {
                    rtp_port,
                    rtcp_port: rtcp.local_addr()?.port(),
                    rtp: Arc::new(rtp),
                    rtcp: Arc::new(rtcp),
                })
            }
        };

        let multicast = match &config.multicast_ip_range {
            None => None,
            Some(range) => Some(MulticastAllocator::new(range)?),
        };

        let inner = Arc::new(ServerInner {
            config,
            handler,
            streams: Mutex::new(HashMap::new()),
            sessions: Mutex::new(HashMap::new()),
            multicast: Mutex::new(multicast),
            udp,
            udp_routes: Mutex::new(HashMap::new()),
        });

        let mut tasks = Vec::new();
        {
            let inner = inner.clone();
            tasks.push(tokio::spawn(async move {
                loop {
                    match listener.accept().await {
                        Ok((stream, _)) => {
                            let inner = inner.clone();
                            tokio::spawn(conn::serve(inner, stream));
                        }
                        Err(e) => {
                            info!("accept failed: {}", e);
                            return;
                        }
                    }
                }
            }));
        }
        if let Some(udp) = &inner.udp {
            tasks.push(tokio::spawn(udp_rtp_loop(inner.clone(), udp.rtp.clone())));
            tasks.push(tokio::spawn(udp_rtcp_loop(inner.clone(), udp.rtcp.clone())));
        }
        tasks.push(tokio::spawn(timer_loop(inner.clone())));

        Ok(Server {
            inner,
            local_addr,
            tasks,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Publishes an application-owned stream at `path`; DESCRIBE/SETUP
    /// of that path serve it.
    pub async fn add_stream(&self, path: &str, stream: Arc<ServerStream>) {
        self.inner
            .streams
            .lock()
            .await
            .insert(path.trim_matches('/').to_owned(), stream);
    }

    pub async fn remove_stream(&self, path: &str) {
        self.inner
            .streams
            .lock()
            .await
            .remove(path.trim_matches('/'));
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}

/// Demuxes record-direction RTP datagrams by source address.
async fn udp_rtp_loop(inner: Arc<ServerInner>, socket: Arc<UdpSocket>) {
    let mut buf = vec![0u8; 65_536];
    loop {
        let (n, from) = match socket.recv_from(&mut buf).await {
            Ok(v) => v,
            Err(_) => return,
        };
        let route = inner.udp_routes.lock().await.get(&from).cloned();
        let (session_id, media_idx) = match route {
            Some(r) => r,
            None => {
                debug!("UDP datagram from unknown source {}", from);
                continue;
            }
        };
        let session = inner.sessions.lock().await.get(&session_id).cloned();
        if let Some(session) = session {
            session.touch().await;
            conn::deliver_rtp(
                &inner,
                &session,
                media_idx,
                Bytes::copy_from_slice(&buf[..n]),
            )
            .await;
        }
    }
}

/// Consumes inbound RTCP (receiver reports from UDP readers, sender
/// reports from UDP publishers); any packet refreshes the keepalive.
async fn udp_rtcp_loop(inner: Arc<ServerInner>, socket: Arc<UdpSocket>) {
    let mut buf = vec![0u8; 65_536];
    loop {
        let (_n, from) = match socket.recv_from(&mut buf).await {
            Ok(v) => v,
            Err(_) => return,
        };
        // RTCP arrives on port+1 of the registered RTP source.
        let rtp_source = SocketAddr::new(from.ip(), from.port().saturating_sub(1));
        let route = inner.udp_routes.lock().await.get(&rtp_source).cloned();
        if let Some((session_id, _)) = route {
            if let Some(session) = inner.sessions.lock().await.get(&session_id) {
                session.touch().await;
            }
        }
    }
}

/// The shared timer: sender reports to readers, receiver reports to
/// publishers, and session expiry.
async fn timer_loop(inner: Arc<ServerInner>) {
    let mut interval = tokio::time::interval(rtcp::REPORT_INTERVAL);
    loop {
        interval.tick().await;

        let streams: Vec<Arc<ServerStream>> =
            inner.streams.lock().await.values().cloned().collect();
        for stream in streams {
            stream.send_sender_reports().await;
        }

        // Keepalive RRs toward record-direction UDP peers, and expiry.
        let now = Instant::now();
        let sessions: Vec<Arc<ServerSession>> =
            inner.sessions.lock().await.values().cloned().collect();
        for session in sessions {
            let idle = now.duration_since(*session.last_activity.lock().await);
            if idle > inner.config.session_timeout {
                info!("session {} expired after {:?} idle", session.id, idle);
                close_session(&inner, &session).await;
                continue;
            }
            if let Some(udp) = &inner.udp {
                let rr = rtcp::ReceiverReport {
                    ssrc: 0,
                    reports: vec![],
                }
                .marshal();
                for media in session.medias.lock().await.iter() {
                    if media.direction != Direction::Record {
                        continue;
                    }
                    if let Binding::Udp { peer_rtcp, .. } = &media.binding {
                        let _ = udp.rtcp.send_to(&rr, *peer_rtcp).await;
                    }
                }
            }
        }
    }
}

/// Tears a session down: unregisters it from its stream, removes
/// publisher streams (evicting their readers), and frees UDP routes.
pub(crate) async fn close_session(inner: &Arc<ServerInner>, session: &Arc<ServerSession>) {
    inner.sessions.lock().await.remove(&session.id);
    inner
        .udp_routes
        .lock()
        .await
        .retain(|_, (sid, _)| *sid != session.id);
    let stream = session.stream.lock().await.take();
    if let Some(stream) = stream {
        stream.remove_reader(&session.id).await;
        if *session.is_publisher.lock().await {
            if let Some(path) = session.path.lock().await.as_ref() {
                inner.streams.lock().await.remove(path);
                debug!(
                    "publisher {} closed; stream {:?} removed with {} readers",
                    session.id,
                    path,
                    stream.reader_count().await
                );
            }
        }
    }
    *session.state.lock().await = session::SessionState::Closed;
    inner.handler.on_session_closed(&session.id);
}
