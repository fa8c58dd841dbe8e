//! RTSP client: connection setup, request/response correlation with
//! automatic auth retry, per-media transport negotiation (TCP
//! interleaved, UDP, UDP multicast), keepalive, and the receive loop
//! that demarshals RTP/RTCP into per-media packet items.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use log::{debug, trace, warn};
use rand::Rng;
use rtsp_types::{headers as rtsp_headers, Message, Method, StatusCode, Version};
use tokio::net::{TcpStream, UdpSocket};
use tokio::sync::mpsc;
use tokio_util::codec::Framed;
use url::Url;

use crate::auth::{self, RequestedAuth};
pub use crate::auth::Credentials;
use crate::client::rtp::{Admitted, SequenceChecker};
use crate::client::timeline::Timeline;
use crate::headers::{self, Direction, Protocol, Transport};
use crate::presentation::{MediaInfo, Presentation};
use crate::transport::udp as udp_transport;
use crate::{methods, rtcp, Codec, Context, Error, NtpTimestamp, ReceivedMessage, Timestamp};

pub mod rtp;
pub mod timeline;

/// Which lower transport to negotiate in SETUP.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum TransportChoice {
    /// TCP when the connection is at hand, matching what most NATed
    /// setups need.
    Auto,
    Udp,
    Multicast,
    Tcp,
}

#[derive(Clone)]
pub struct ClientConfig {
    pub creds: Option<Credentials>,
    pub user_agent: String,
    pub transport: TransportChoice,
    pub read_timeout: Duration,
    pub write_timeout: Duration,

    /// How long to wait for the first UDP packet after PLAY before
    /// giving up (the usual symptom of a NAT in the path).
    pub initial_udp_read_timeout: Duration,

    /// Ask the server to describe ONVIF back-channel (two-way audio)
    /// medias by sending `Require: www.onvif.org/ver20/backchannel`.
    pub request_back_channels: bool,

    /// Accept UDP packets from any source port, for cameras that send
    /// RTP from a port other than the negotiated one.
    pub any_port_enable: bool,
}

impl Default for ClientConfig {
    fn default() -> Self {
        ClientConfig {
            creds: None,
            user_agent: "ocular".to_owned(),
            transport: TransportChoice::Auto,
            read_timeout: Duration::from_secs(10),
            write_timeout: Duration::from_secs(10),
            initial_udp_read_timeout: Duration::from_secs(3),
            request_back_channels: false,
            any_port_enable: false,
        }
    }
}

/// Default session expiry assumed until the server names one.
const DEFAULT_SESSION_TIMEOUT: Duration = Duration::from_secs(60);

/// One item from the data plane.
#[derive(Debug)]
pub enum PacketItem {
    Rtp {
        media_idx: usize,
        packet: crate::rtp::Packet,
        timestamp: Timestamp,
        /// Packets lost before this one on the same media.
        loss: u16,
    },
    SenderReport {
        media_idx: usize,
        ssrc: u32,
        ntp_timestamp: NtpTimestamp,
        rtp_timestamp: Timestamp,
    },
}

struct UdpBinding {
    rtp: Arc<UdpSocket>,
    rtcp: Arc<UdpSocket>,
    peer_rtp: Option<SocketAddr>,
    peer_rtcp: Option<SocketAddr>,
}

struct SetupEntry {
    media_idx: usize,
    back_channel: bool,
    channels: Option<(u8, u8)>,
    udp: Option<UdpBinding>,
    timeline: Timeline,
    checker: SequenceChecker,
    stats: rtcp::ReceiverStats,
    epoch: Instant,
    // Sender side (publish / back-channel) counters for SRs.
    sent_packets: u32,
    sent_octets: u32,
    last_sent_rtp_ts: u32,
}

struct UdpDatagram {
    setup_idx: usize,
    is_rtcp: bool,
    data: Bytes,
}

enum Wake {
    Msg(Option<Result<ReceivedMessage, Error>>),
    Udp(Option<UdpDatagram>),
    Keepalive,
    Report,
}

/// An RTSP client session over one TCP connection.
pub struct Session {
    conn: Framed<TcpStream, Codec>,
    config: ClientConfig,
    url: Url,
    requested_auth: Option<RequestedAuth>,
    cseq: u32,
    session: Option<headers::Session>,
    presentation: Option<Presentation>,
    publishing: bool,
    playing: bool,
    get_parameter_supported: bool,
    setups: Vec<SetupEntry>,
    udp_rx: mpsc::Receiver<UdpDatagram>,
    udp_tx: mpsc::Sender<UdpDatagram>,
    udp_tasks: Vec<tokio::task::JoinHandle<()>>,
    keepalive: Option<tokio::time::Interval>,
    report: Option<tokio::time::Interval>,
    /// SSRC used in our own RTCP receiver reports.
    report_ssrc: u32,
    got_first_packet: bool,
}

impl Session {
    /// Connects to the host in `url` (port 554 by default). TLS
    /// (`rtsps`) is not terminated here; hand in a plain `rtsp` URL or
    /// terminate TLS externally.
    pub async fn connect(url: Url, config: ClientConfig) -> Result<Self, Error> {
        if url.scheme() != "rtsp" {
            return Err(Error::Parse(format!(
                "unsupported scheme {:?} (terminate TLS externally and use rtsp)",
                url.scheme()
            )));
        }
        if url.username() != "" || url.password().is_some() {
            // `Url` has no way to clear credentials, so require them via
            // the config instead of silently sending them in requests.
            return Err(Error::Parse(
                "URL must not contain credentials; use ClientConfig::creds".to_owned(),
            ));
        }
        let host = url
            .host_str()
            .ok_or_else(|| Error::Parse(format!("must specify host in rtsp url {}", url)))?;
        let port = url.port().unwrap_or(554);
        let stream = tokio::time::timeout(
            config.read_timeout,
            TcpStream::connect((host, port)),
        )
        .await
        .map_err(|_| Error::Timeout("connect"))??;
        stream.set_nodelay(true)?;
        let ctx = Context {
            established: std::time::SystemTime::now(),
            local_addr: stream.local_addr()?,
            peer_addr: stream.peer_addr()?,
            rtsp_message_offset: 0,
        };
        let conn = Framed::new(stream, Codec { ctx });
        let (udp_tx, udp_rx) = mpsc::channel(256);
        Ok(Session {
            conn,
            config,
            url,
            requested_auth: None,
            cseq: 1,
            session: None,
            presentation: None,
            publishing: false,
            playing: false,
            get_parameter_supported: false,
            setups: Vec::new(),
            udp_rx,
            udp_tx,
            udp_tasks: Vec::new(),
            keepalive: None,
            report: None,
            report_ssrc: rand::thread_rng().gen(),
            got_first_packet: false,
        })
    }

    pub fn presentation(&self) -> Option<&Presentation> {
        self.presentation.as_ref()
    }

    pub fn session_id(&self) -> Option<&str> {
        self.session.as_ref().map(|s| s.id.as_str())
    }

    fn new_request(&self, method: Method, url: &Url) -> rtsp_types::Request<Bytes> {
        rtsp_types::Request::builder(method, Version::V1_0)
            .request_uri(url.clone())
            .build(Bytes::new())
    }

    /// Sends a request without waiting for a response, returning the
    /// `CSeq` as a string. Takes care of authorization, `CSeq`,
    /// `User-Agent`, and `Session`.
    async fn send_nowait(&mut self, req: &mut rtsp_types::Request<Bytes>) -> Result<String, Error> {
        let cseq = self.cseq.to_string();
        self.cseq += 1;
        match (self.requested_auth.as_mut(), self.config.creds.as_ref()) {
            (None, _) => {}
            (Some(challenge), Some(creds)) => {
                let uri = req
                    .request_uri()
                    .map(|u| u.to_string())
                    .unwrap_or_else(|| "*".to_owned());
                let authorization = auth::respond(challenge, creds, req.method(), &uri)?;
                req.insert_header(rtsp_headers::AUTHORIZATION, authorization);
            }
            (Some(_), None) => {
                return Err(Error::Auth(
                    "authentication required; no credentials supplied".to_owned(),
                ))
            }
        }
        req.insert_header(rtsp_headers::CSEQ, cseq.clone());
        req.insert_header(rtsp_headers::USER_AGENT, self.config.user_agent.clone());
        if let Some(session) = &self.session {
            req.insert_header(rtsp_headers::SESSION, session.id.clone());
        }
        tokio::time::timeout(
            self.config.write_timeout,
            self.conn.send(Message::Request(req.clone())),
        )
        .await
        .map_err(|_| Error::Timeout("write"))??;
        Ok(cseq)
    }

    /// Sends a request and waits for its response, retrying exactly once
    /// with credentials after a 401.
    async fn send(
        &mut self,
        req: &mut rtsp_types::Request<Bytes>,
        method_name: &'static str,
    ) -> Result<rtsp_types::Response<Bytes>, Error> {
        loop {
            let cseq = self.send_nowait(req).await?;
            let resp = loop {
                let msg = tokio::time::timeout(self.config.read_timeout, self.conn.next())
                    .await
                    .map_err(|_| Error::Timeout("read"))?
                    .ok_or_else(|| {
                        Error::Transport(std::io::Error::new(
                            std::io::ErrorKind::UnexpectedEof,
                            "EOF while waiting for reply",
                        ))
                    })??;
                match msg.msg {
                    Message::Response(r) => {
                        if matches!(r.header(&rtsp_headers::CSEQ), Some(v) if v.as_str() == cseq) {
                            break r;
                        }
                        // A keepalive's late answer; not ours.
                        trace!("skipping response with foreign CSeq");
                    }
                    // Media keeps flowing while we pause or tear down.
                    Message::Data(_) => {}
                    Message::Request(_) => {}
                }
            };
            if resp.status() == StatusCode::Unauthorized {
                if self.requested_auth.is_some() {
                    return Err(Error::Auth(
                        "received 401 after already answering a challenge".to_owned(),
                    ));
                }
                let www_authenticate = resp
                    .header(&rtsp_headers::WWW_AUTHENTICATE)
                    .ok_or_else(|| Error::Auth("401 without WWW-Authenticate".to_owned()))?;
                self.requested_auth = Some(RequestedAuth::parse(www_authenticate.as_str())?);
                continue;
            }
            if !resp.status().is_success() {
                return Err(Error::BadStatus {
                    method: method_name,
                    status: format!("{:?}", resp.status()),
                });
            }
            if let Some(session) = resp.header(&rtsp_headers::SESSION) {
                self.session = Some(headers::Session::parse(session.as_str())?);
            }
            return Ok(resp);
        }
    }

    /// Sends OPTIONS, noting whether GET_PARAMETER is available for
    /// keepalives.
    pub async fn options(&mut self) -> Result<(), Error> {
        let url = self.url.clone();
        let mut req = self.new_request(Method::Options, &url);
        let resp = self.send(&mut req, "OPTIONS").await?;
        self.get_parameter_supported = resp
            .header(&rtsp_headers::PUBLIC)
            .map(|v| v.as_str().contains("GET_PARAMETER"))
            .unwrap_or(false);
        Ok(())
    }

    /// Sends DESCRIBE and parses the SDP into a presentation.
    pub async fn describe(&mut self) -> Result<&Presentation, Error> {
        let url = self.url.clone();
        let mut req = self.new_request(Method::Describe, &url);
        req.insert_header(rtsp_headers::ACCEPT, "application/sdp");
        if self.config.request_back_channels {
            req.insert_header(rtsp_headers::REQUIRE, crate::BACKCHANNEL_REQUIRE);
        }
        let resp = self.send(&mut req, "DESCRIBE").await?;

        if !matches!(resp.header(&rtsp_headers::CONTENT_TYPE), Some(v) if v.as_str() == "application/sdp")
        {
            return Err(Error::Parse(
                "DESCRIBE response is not application/sdp".to_owned(),
            ));
        }
        // https://tools.ietf.org/html/rfc2326#appendix-C.1.1
        let base_url = resp
            .header(&rtsp_headers::CONTENT_BASE)
            .or_else(|| resp.header(&rtsp_headers::CONTENT_LOCATION))
            .map(|v| Url::parse(v.as_str()))
            .unwrap_or(Ok(url))
            .map_err(|e| Error::Parse(format!("bad content base: {}", e)))?;
        let mut presentation = Presentation::parse(base_url, resp.body())?;
        presentation.accept_dynamic_rate =
            matches!(resp.header(&crate::X_ACCEPT_DYNAMIC_RATE), Some(h) if h.as_str() == "1");
        self.presentation = Some(presentation);
        Ok(self.presentation.as_ref().unwrap())
    }

    /// Announces a presentation for publishing; medias are controlled as
    /// `trackID=<n>` under the request URL. Follow with `setup` on each
    /// media and then `record`.
    pub async fn announce(&mut self, medias: Vec<MediaInfo>) -> Result<(), Error> {
        let url = self.url.clone();
        let body = Presentation::marshal_sdp("", &medias);
        let mut req = rtsp_types::Request::builder(
            Method::Extension(methods::ANNOUNCE.into()),
            Version::V1_0,
        )
        .request_uri(url.clone())
        .header(rtsp_headers::CONTENT_TYPE, "application/sdp")
        .build(Bytes::from(body.into_bytes()));
        self.send(&mut req, "ANNOUNCE").await?;
        let mut base_url = url;
        if !base_url.path().ends_with('/') {
            let path = format!("{}/", base_url.path());
            base_url.set_path(&path);
        }
        let mut medias = medias;
        for (i, m) in medias.iter_mut().enumerate() {
            if m.control.is_empty() {
                m.control = format!("trackID={}", i);
            }
        }
        self.presentation = Some(Presentation {
            control: base_url.clone(),
            base_url,
            medias,
            accept_dynamic_rate: false,
        });
        self.publishing = true;
        Ok(())
    }

    /// Sets up one media of the described/announced presentation.
    pub async fn setup(&mut self, media_idx: usize) -> Result<(), Error> {
        let presentation = self
            .presentation
            .as_ref()
            .ok_or_else(|| Error::State {
                status: 455,
                msg: "SETUP before DESCRIBE/ANNOUNCE".to_owned(),
            })?;
        let media = presentation
            .medias
            .get(media_idx)
            .ok_or_else(|| Error::Parse(format!("no media {}", media_idx)))?;
        let control_url = media.control_url(&presentation.base_url)?;
        let back_channel = media.is_back_channel;
        let clock_rate = media.formats[0].clock_rate();
        let direction = if self.publishing || back_channel {
            Direction::Record
        } else {
            Direction::Play
        };

        let mut transport = Transport {
            direction,
            ..Transport::default()
        };
        let mut udp = None;
        match self.config.transport {
            TransportChoice::Tcp | TransportChoice::Auto => {
                transport.protocol = Protocol::Tcp;
                let ch = (self.setups.len() * 2) as u8;
                transport.interleaved = Some((ch, ch + 1));
            }
            TransportChoice::Udp => {
                transport.protocol = Protocol::Udp;
                let (rtp_socket, rtcp_socket) =
                    udp_transport::bind_pair(IpAddr::V4(Ipv4Addr::UNSPECIFIED)).await?;
                transport.client_port = Some((
                    rtp_socket.local_addr()?.port(),
                    rtcp_socket.local_addr()?.port(),
                ));
                udp = Some(UdpBinding {
                    rtp: Arc::new(rtp_socket),
                    rtcp: Arc::new(rtcp_socket),
                    peer_rtp: None,
                    peer_rtcp: None,
                });
            }
            TransportChoice::Multicast => {
                transport.protocol = Protocol::Multicast;
            }
        }

        let mut req = self.new_request(Method::Setup, &control_url);
        req.insert_header(rtsp_headers::TRANSPORT, transport.to_string());
        if back_channel {
            req.insert_header(rtsp_headers::REQUIRE, crate::BACKCHANNEL_REQUIRE);
        }
        let resp = self.send(&mut req, "SETUP").await?;

        let transport_resp = resp
            .header(&rtsp_headers::TRANSPORT)
            .ok_or_else(|| Error::Parse("SETUP response has no Transport header".to_owned()))?;
        let transport_resp = Transport::parse(transport_resp.as_str())?;
        let peer_ip = self.conn.get_ref().peer_addr()?.ip();

        let channels;
        match transport_resp.protocol {
            Protocol::Tcp => {
                channels = Some(transport_resp.interleaved.ok_or_else(|| {
                    Error::Parse("TCP transport without interleaved channels".to_owned())
                })?);
            }
            Protocol::Udp => {
                channels = None;
                let udp_binding = udp.as_mut().ok_or_else(|| {
                    Error::Parse("server switched to UDP unrequested".to_owned())
                })?;
                let (rtp_port, rtcp_port) = transport_resp.server_port.ok_or_else(|| {
                    Error::Parse("UDP transport without server_port".to_owned())
                })?;
                let ip = transport_resp.destination.unwrap_or(peer_ip);
                udp_binding.peer_rtp = Some(SocketAddr::new(ip, rtp_port));
                udp_binding.peer_rtcp = Some(SocketAddr::new(ip, rtcp_port));
            }
            Protocol::Multicast => {
                channels = None;
                let group = match transport_resp.destination {
                    Some(IpAddr::V4(g)) => g,
                    _ => {
                        return Err(Error::Parse(
                            "multicast transport without an IPv4 destination".to_owned(),
                        ))
                    }
                };
                let (rtp_port, rtcp_port) = transport_resp
                    .port
                    .ok_or_else(|| Error::Parse("multicast transport without ports".to_owned()))?;
                let (rtp_socket, rtcp_socket) =
                    udp_transport::bind_multicast_pair(group, rtp_port, rtcp_port).await?;
                udp = Some(UdpBinding {
                    rtp: Arc::new(rtp_socket),
                    rtcp: Arc::new(rtcp_socket),
                    peer_rtp: Some(SocketAddr::new(peer_ip, rtp_port)),
                    peer_rtcp: Some(SocketAddr::new(peer_ip, rtcp_port)),
                });
            }
        }

        let setup_idx = self.setups.len();
        if let Some(binding) = &udp {
            self.spawn_udp_task(setup_idx, false, binding.rtp.clone(), binding.peer_rtp);
            self.spawn_udp_task(setup_idx, true, binding.rtcp.clone(), binding.peer_rtcp);
        }
        self.setups.push(SetupEntry {
            media_idx,
            back_channel,
            channels,
            udp,
            timeline: Timeline::new(None, clock_rate).map_err(Error::Parse)?,
            checker: SequenceChecker::new(transport_resp.ssrc, None),
            stats: rtcp::ReceiverStats::new(clock_rate),
            epoch: Instant::now(),
            sent_packets: 0,
            sent_octets: 0,
            last_sent_rtp_ts: 0,
        });
        Ok(())
    }

    fn spawn_udp_task(
        &mut self,
        setup_idx: usize,
        is_rtcp: bool,
        socket: Arc<UdpSocket>,
        peer: Option<SocketAddr>,
    ) {
        let tx = self.udp_tx.clone();
        let any_port = self.config.any_port_enable;
        let handle = tokio::spawn(async move {
            let mut buf = vec![0u8; 65_536];
            loop {
                let (n, from) = match socket.recv_from(&mut buf).await {
                    Ok(v) => v,
                    Err(_) => return,
                };
                if let Some(peer) = &peer {
                    if !udp_transport::source_ok(peer, &from, any_port) {
                        trace!("dropping datagram from unexpected source {}", from);
                        continue;
                    }
                }
                let datagram = UdpDatagram {
                    setup_idx,
                    is_rtcp,
                    data: Bytes::copy_from_slice(&buf[..n]),
                };
                if tx.send(datagram).await.is_err() {
                    return;
                }
            }
        });
        self.udp_tasks.push(handle);
    }

    fn start_timers(&mut self) {
        let timeout = self
            .session
            .as_ref()
            .and_then(|s| s.timeout)
            .map(|t| Duration::from_secs(u64::from(t)))
            .unwrap_or(DEFAULT_SESSION_TIMEOUT);
        // Keep alive at roughly 80% of the negotiated timeout.
        self.keepalive = Some(tokio::time::interval(timeout.mul_f32(0.8)));
        self.report = Some(tokio::time::interval(rtcp::REPORT_INTERVAL));
    }

    /// Sends PLAY and applies `RTP-Info` to the per-media clocks.
    pub async fn play(&mut self) -> Result<(), Error> {
        let url = self
            .presentation
            .as_ref()
            .map(|p| p.control.clone())
            .ok_or_else(|| Error::State {
                status: 455,
                msg: "PLAY before DESCRIBE".to_owned(),
            })?;
        let mut req = self.new_request(Method::Play, &url);
        req.insert_header(rtsp_headers::RANGE, "npt=0-");
        let resp = self.send(&mut req, "PLAY").await?;

        if let Some(rtp_info) = resp.header(&rtsp_headers::RTP_INFO) {
            let presentation = self.presentation.as_ref().unwrap();
            for entry in headers::parse_rtp_info(rtp_info.as_str())? {
                let entry_url = crate::presentation::join_control(&presentation.base_url, &entry.url)?;
                let media_idx = match presentation.media_by_control_url(&entry_url) {
                    Some(i) => i,
                    None => {
                        debug!("RTP-Info names unknown stream {}", entry_url);
                        continue;
                    }
                };
                if let Some(setup) = self.setups.iter_mut().find(|s| s.media_idx == media_idx) {
                    if let Some(seq) = entry.seq {
                        setup.checker = SequenceChecker::new(None, Some(seq));
                    }
                    if let Some(rtptime) = entry.rtptime {
                        let clock = presentation.medias[media_idx].formats[0].clock_rate();
                        setup.timeline =
                            Timeline::new(Some(rtptime), clock).map_err(Error::Parse)?;
                    }
                }
            }
        }
        self.playing = true;
        self.got_first_packet = false;
        self.start_timers();
        Ok(())
    }

    /// Sends RECORD, enabling `write_rtp` on the announced medias.
    pub async fn record(&mut self) -> Result<(), Error> {
        let url = self
            .presentation
            .as_ref()
            .map(|p| p.control.clone())
            .ok_or_else(|| Error::State {
                status: 455,
                msg: "RECORD before ANNOUNCE".to_owned(),
            })?;
        let mut req = self.new_request(Method::Extension(methods::RECORD.into()), &url);
        self.send(&mut req, "RECORD").await?;
        self.playing = true;
        self.start_timers();
        Ok(())
    }

    /// Sends PAUSE; the session stays set up and PLAY resumes it.
    pub async fn pause(&mut self) -> Result<(), Error> {
        let url = self
            .presentation
            .as_ref()
            .map(|p| p.control.clone())
            .ok_or_else(|| Error::State {
                status: 455,
                msg: "PAUSE before PLAY".to_owned(),
            })?;
        let mut req = self.new_request(Method::Pause, &url);
        self.send(&mut req, "PAUSE").await?;
        self.playing = false;
        Ok(())
    }

    /// Tears the session down and releases all transports.
    pub async fn teardown(&mut self) -> Result<(), Error> {
        let url = self
            .presentation
            .as_ref()
            .map(|p| p.control.clone())
            .unwrap_or_else(|| self.url.clone());
        let mut req = self.new_request(Method::Teardown, &url);
        let result = self.send(&mut req, "TEARDOWN").await;
        self.playing = false;
        self.session = None;
        for task in self.udp_tasks.drain(..) {
            task.abort();
        }
        result.map(|_| ())
    }

    /// Writes one RTP packet on a back-channel or announced media.
    pub async fn write_rtp(
        &mut self,
        media_idx: usize,
        pkt: &crate::rtp::Packet,
    ) -> Result<(), Error> {
        let setup_idx = self
            .setups
            .iter()
            .position(|s| s.media_idx == media_idx)
            .ok_or_else(|| Error::State {
                status: 455,
                msg: format!("media {} is not set up", media_idx),
            })?;
        let wire = pkt.marshal();
        {
            let setup = &self.setups[setup_idx];
            if let Some((rtp_ch, _)) = setup.channels {
                let msg = Message::Data(rtsp_types::Data::new(rtp_ch, wire.clone()));
                tokio::time::timeout(self.config.write_timeout, self.conn.send(msg))
                    .await
                    .map_err(|_| Error::Timeout("write"))??;
            } else if let Some(udp) = &setup.udp {
                let peer = udp
                    .peer_rtp
                    .ok_or_else(|| Error::Parse("no negotiated peer address".to_owned()))?;
                udp.rtp.send_to(&wire, peer).await?;
            }
        }
        let setup = &mut self.setups[setup_idx];
        setup.sent_packets = setup.sent_packets.wrapping_add(1);
        setup.sent_octets = setup.sent_octets.wrapping_add(pkt.payload.len() as u32);
        setup.last_sent_rtp_ts = pkt.timestamp;
        Ok(())
    }

    async fn send_keepalive(&mut self) -> Result<(), Error> {
        let url = self.url.clone();
        let method = if self.get_parameter_supported {
            Method::GetParameter
        } else {
            Method::Options
        };
        let mut req = self.new_request(method, &url);
        // The response is consumed (and ignored) by the receive loop.
        self.send_nowait(&mut req).await.map(|_| ())
    }

    /// Sends RRs for receiving medias and SRs for sending ones.
    async fn send_reports(&mut self) -> Result<(), Error> {
        let now = Instant::now();
        for i in 0..self.setups.len() {
            let sending = self.publishing || self.setups[i].back_channel;
            let (payload, channels, peer, socket) = {
                let setup = &mut self.setups[i];
                let payload = if sending {
                    if setup.sent_packets == 0 {
                        continue;
                    }
                    rtcp::SenderReport {
                        ssrc: self.report_ssrc,
                        ntp_timestamp: NtpTimestamp::from_system_time(std::time::SystemTime::now()),
                        rtp_timestamp: setup.last_sent_rtp_ts,
                        packet_count: setup.sent_packets,
                        octet_count: setup.sent_octets,
                        reports: vec![],
                    }
                    .marshal()
                } else {
                    let report = setup.stats.report(0, now);
                    rtcp::ReceiverReport {
                        ssrc: self.report_ssrc,
                        reports: vec![report],
                    }
                    .marshal()
                };
                (
                    payload,
                    setup.channels,
                    setup.udp.as_ref().and_then(|u| u.peer_rtcp),
                    setup.udp.as_ref().map(|u| u.rtcp.clone()),
                )
            };
            if let Some((_, rtcp_ch)) = channels {
                let msg = Message::Data(rtsp_types::Data::new(rtcp_ch, payload));
                tokio::time::timeout(self.config.write_timeout, self.conn.send(msg))
                    .await
                    .map_err(|_| Error::Timeout("write"))??;
            } else if let (Some(peer), Some(socket)) = (peer, socket) {
                socket.send_to(&payload, peer).await?;
            }
        }
        Ok(())
    }

    fn handle_rtp(&mut self, setup_idx: usize, data: Bytes) -> Option<PacketItem> {
        let pkt = match crate::rtp::Packet::parse(data) {
            Ok(p) => p,
            Err(e) => {
                debug!("dropping bad RTP packet: {}", e);
                return None;
            }
        };
        let setup = &mut self.setups[setup_idx];
        let loss = match setup.checker.admit(&pkt) {
            Admitted::Ok { loss } => loss,
            Admitted::Spurious => return None,
        };
        setup
            .stats
            .on_packet(pkt.sequence_number, pkt.timestamp, Instant::now(), setup.epoch);
        let timestamp = setup.timeline.advance_to(pkt.timestamp);
        self.got_first_packet = true;
        Some(PacketItem::Rtp {
            media_idx: setup.media_idx,
            packet: pkt,
            timestamp,
            loss,
        })
    }

    fn handle_rtcp(&mut self, setup_idx: usize, data: Bytes) -> Option<PacketItem> {
        let mut rest = &data[..];
        let mut item = None;
        while !rest.is_empty() {
            let (pkt, r) = match rtcp::Packet::parse(rest) {
                Ok(v) => v,
                Err(e) => {
                    debug!("dropping bad RTCP packet: {}", e);
                    return item;
                }
            };
            rest = r;
            if let rtcp::Packet::SenderReport(sr) = pkt {
                let setup = &mut self.setups[setup_idx];
                setup.stats.on_sender_report(sr.ntp_timestamp, Instant::now());
                let timestamp = setup.timeline.advance_to(sr.rtp_timestamp);
                item = Some(PacketItem::SenderReport {
                    media_idx: setup.media_idx,
                    ssrc: sr.ssrc,
                    ntp_timestamp: sr.ntp_timestamp,
                    rtp_timestamp: timestamp,
                });
            }
        }
        item
    }

    fn setup_by_channel(&self, channel_id: u8) -> Option<(usize, bool)> {
        self.setups.iter().enumerate().find_map(|(i, s)| {
            let (rtp_ch, rtcp_ch) = s.channels?;
            if channel_id == rtp_ch {
                Some((i, false))
            } else if channel_id == rtcp_ch {
                Some((i, true))
            } else {
                None
            }
        })
    }

    /// Waits for the next packet item, transparently answering
    /// keepalives and pacing RTCP reports. Returns `None` when the
    /// server closes the connection.
    pub async fn next_item(&mut self) -> Result<Option<PacketItem>, Error> {
        loop {
            // Until the first packet lands on a UDP-only session, a
            // bounded wait catches the NAT-eats-our-datagrams case.
            let first_udp_wait = if self.playing
                && !self.got_first_packet
                && !self.setups.is_empty()
                && self.setups.iter().all(|s| s.udp.is_some())
            {
                Some(self.config.initial_udp_read_timeout)
            } else {
                None
            };
            let wake = {
                let Session {
                    conn,
                    udp_rx,
                    keepalive,
                    report,
                    ..
                } = self;
                let keepalive_tick = async {
                    match keepalive {
                        Some(i) => {
                            i.tick().await;
                        }
                        None => futures::future::pending().await,
                    }
                };
                let report_tick = async {
                    match report {
                        Some(i) => {
                            i.tick().await;
                        }
                        None => futures::future::pending().await,
                    }
                };
                let select = async {
                    tokio::select! {
                        m = conn.next() => Wake::Msg(m),
                        d = udp_rx.recv() => Wake::Udp(d),
                        _ = keepalive_tick => Wake::Keepalive,
                        _ = report_tick => Wake::Report,
                    }
                };
                match first_udp_wait {
                    None => select.await,
                    Some(t) => tokio::time::timeout(t, select)
                        .await
                        .map_err(|_| Error::Timeout("initial UDP read (try TCP transport)"))?,
                }
            };
            match wake {
                Wake::Msg(None) => return Ok(None),
                Wake::Msg(Some(Err(e))) => return Err(e),
                Wake::Msg(Some(Ok(msg))) => match msg.msg {
                    Message::Data(data) => {
                        let channel_id = data.channel_id();
                        let body = data.into_body();
                        if let Some((setup_idx, is_rtcp)) = self.setup_by_channel(channel_id) {
                            let item = if is_rtcp {
                                self.handle_rtcp(setup_idx, body)
                            } else {
                                self.handle_rtp(setup_idx, body)
                            };
                            if let Some(item) = item {
                                return Ok(Some(item));
                            }
                        } else {
                            debug!("data on unknown channel {}", channel_id);
                        }
                    }
                    // Keepalive answers and server-initiated requests.
                    Message::Response(_) => {}
                    Message::Request(req) => {
                        let cseq = req
                            .header(&rtsp_headers::CSEQ)
                            .map(|v| v.as_str().to_owned())
                            .unwrap_or_default();
                        let mut resp = rtsp_types::Response::builder(Version::V1_0, StatusCode::Ok)
                            .build(Bytes::new());
                        resp.insert_header(rtsp_headers::CSEQ, cseq);
                        tokio::time::timeout(
                            self.config.write_timeout,
                            self.conn.send(Message::Response(resp)),
                        )
                        .await
                        .map_err(|_| Error::Timeout("write"))??;
                    }
                },
                Wake::Udp(None) => return Ok(None),
                Wake::Udp(Some(datagram)) => {
                    if datagram.setup_idx >= self.setups.len() {
                        continue;
                    }
                    let item = if datagram.is_rtcp {
                        self.handle_rtcp(datagram.setup_idx, datagram.data)
                    } else {
                        self.handle_rtp(datagram.setup_idx, datagram.data)
                    };
                    if let Some(item) = item {
                        return Ok(Some(item));
                    }
                }
                Wake::Keepalive => {
                    if let Err(e) = self.send_keepalive().await {
                        warn!("keepalive failed: {}", e);
                        return Err(e);
                    }
                }
                Wake::Report => self.send_reports().await?,
            }
        }
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        for task in &self.udp_tasks {
            task.abort();
        }
    }
}
