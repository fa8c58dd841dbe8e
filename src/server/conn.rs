//! Per-connection server logic: one reader task per TCP connection,
//! dispatching requests through the session state machine and routing
//! interleaved data, with all writes going through the connection's
//! serialized writer.

use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use bytes::Bytes;
use futures::StreamExt;
use log::{debug, info};
use rtsp_types::{headers as rtsp_headers, Message, Method, StatusCode, Version};
use tokio::net::TcpStream;
use tokio_util::codec::Framed;
use url::Url;

use crate::auth::Validator;
use crate::client::rtp::{Admitted, SequenceChecker};
use crate::headers::{self, Direction, Protocol, Transport};
use crate::presentation::Presentation;
use crate::server::session::{ServerSession, SessionMedia, SessionState};
use crate::server::stream::{MulticastOut, ReaderBinding, ServerStream};
use crate::server::{close_session, PacketContext, ServerInner};
use crate::transport::tcp::ConnWriter;
use crate::transport::udp::ReorderBuffer;
use crate::transport::Binding;
use crate::{Codec, Context, Error};

pub(crate) fn status_from(code: u16) -> StatusCode {
    match code {
        200 => StatusCode::Ok,
        400 => StatusCode::BadRequest,
        401 => StatusCode::Unauthorized,
        404 => StatusCode::NotFound,
        454 => StatusCode::SessionNotFound,
        455 => StatusCode::MethodNotValidInThisState,
        457 => StatusCode::InvalidRange,
        461 => StatusCode::UnsupportedTransport,
        _ => StatusCode::InternalServerError,
    }
}

fn method_name(method: &Method) -> String {
    match method {
        Method::Options => "OPTIONS".to_owned(),
        Method::Describe => "DESCRIBE".to_owned(),
        Method::Setup => "SETUP".to_owned(),
        Method::Play => "PLAY".to_owned(),
        Method::Pause => "PAUSE".to_owned(),
        Method::Teardown => "TEARDOWN".to_owned(),
        Method::GetParameter => "GET_PARAMETER".to_owned(),
        Method::SetParameter => "SET_PARAMETER".to_owned(),
        Method::Extension(m) => m.to_string().to_ascii_uppercase(),
        o => format!("{:?}", o).to_ascii_uppercase(),
    }
}

struct ConnState {
    inner: Arc<ServerInner>,
    writer: ConnWriter,
    peer: SocketAddr,
    validator: Option<Validator>,
    /// Sessions attached to this connection, by id.
    sessions: HashMap<String, Arc<ServerSession>>,
    /// Interleaved channel routing: channel id -> (session id, media, rtcp).
    channels: HashMap<u8, (String, usize, bool)>,
    next_channel: u8,
}

pub(crate) async fn serve(inner: Arc<ServerInner>, stream: TcpStream) {
    let peer = match stream.peer_addr() {
        Ok(p) => p,
        Err(_) => return,
    };
    let local_addr = match stream.local_addr() {
        Ok(a) => a,
        Err(_) => return,
    };
    let _ = stream.set_nodelay(true);
    let ctx = Context {
        established: std::time::SystemTime::now(),
        local_addr,
        peer_addr: peer,
        rtsp_message_offset: 0,
    };
    let framed = Framed::new(stream, Codec { ctx });
    let (sink, mut read) = framed.split();
    let writer = ConnWriter::new(sink, inner.config.write_timeout);
    let validator = inner
        .config
        .creds
        .clone()
        .map(|c| Validator::new(c, &inner.config.realm));
    let mut conn = ConnState {
        inner: inner.clone(),
        writer,
        peer,
        validator,
        sessions: HashMap::new(),
        channels: HashMap::new(),
        next_channel: 0,
    };
    debug!("connection from {}", peer);

    loop {
        let msg = match read.next().await {
            None => break,
            Some(Err(e)) => {
                debug!("connection {}: {}", peer, e);
                break;
            }
            Some(Ok(m)) => m,
        };
        match msg.msg {
            Message::Request(req) => {
                if conn.handle_request(req).await.is_err() {
                    break;
                }
            }
            Message::Data(data) => {
                let channel_id = data.channel_id();
                conn.handle_data(channel_id, data.into_body()).await;
            }
            Message::Response(_) => {} // answers to our keepalives
        }
    }

    // Closing the connection closes all of its sessions.
    for (_, session) in conn.sessions.drain() {
        close_session(&inner, &session).await;
    }
    debug!("connection {} closed", peer);
}

impl ConnState {
    fn response(&self, status: StatusCode, cseq: &str) -> rtsp_types::Response<Bytes> {
        let mut resp = rtsp_types::Response::builder(Version::V1_0, status).build(Bytes::new());
        resp.insert_header(rtsp_headers::CSEQ, cseq.to_owned());
        resp
    }

    /// The stream path for a request URL: the path without its leading
    /// slash, and without the control suffix when `split_control` is set
    /// (SETUP URLs name a media, e.g. `/cam/trackID=0`).
    fn path_of(url: &Url, split_control: bool) -> (String, Option<String>) {
        let path = url.path().trim_matches('/').to_owned();
        if !split_control {
            return (path, None);
        }
        match path.rsplit_once('/') {
            Some((dir, last)) => (dir.to_owned(), Some(last.to_owned())),
            None => (path, None),
        }
    }

    fn resolve_media(medias: &[crate::presentation::MediaInfo], control: Option<&str>) -> usize {
        let control = match control {
            Some(c) => c,
            None => return 0,
        };
        if let Some(i) = medias.iter().position(|m| m.control == control) {
            return i;
        }
        if let Some(n) = control.strip_prefix("trackID=") {
            if let Ok(n) = n.parse::<usize>() {
                if n < medias.len() {
                    return n;
                }
            }
        }
        0
    }

    async fn handle_request(&mut self, req: rtsp_types::Request<Bytes>) -> Result<(), Error> {
        let cseq = match req.header(&rtsp_headers::CSEQ) {
            Some(v) => v.as_str().to_owned(),
            None => {
                let resp = self.response(StatusCode::BadRequest, "0");
                return self.writer.send(Message::Response(resp)).await;
            }
        };
        let name = method_name(req.method());

        // Any request on a session refreshes its keepalive clock.
        let session_header = match req
            .header(&rtsp_headers::SESSION)
            .map(|v| headers::Session::parse(v.as_str()))
            .transpose()
        {
            Ok(sh) => sh,
            Err(_) => {
                let resp = self.response(StatusCode::BadRequest, &cseq);
                return self.writer.send(Message::Response(resp)).await;
            }
        };
        if let Some(sh) = &session_header {
            if let Some(session) = self.sessions.get(&sh.id) {
                session.touch().await;
            }
        }

        // Auth gate; OPTIONS stays open so clients can probe.
        if name != "OPTIONS" {
            if let Some(validator) = &self.validator {
                let authorization = req
                    .header(&rtsp_headers::AUTHORIZATION)
                    .map(|v| v.as_str().to_owned());
                if let Err(e) = validator.check(authorization.as_deref(), req.method()) {
                    debug!("auth failure from {}: {}", self.peer, e);
                    let mut resp = self.response(StatusCode::Unauthorized, &cseq);
                    resp.insert_header(rtsp_headers::WWW_AUTHENTICATE, validator.challenge());
                    return self.writer.send(Message::Response(resp)).await;
                }
            }
        }

        let resp = match self.dispatch(&name, &req, &cseq, session_header).await {
            Ok(resp) => resp,
            Err(e) => {
                info!("{} from {} failed: {}", name, self.peer, e);
                let status = status_from(e.status_code().unwrap_or(500));
                self.response(status, &cseq)
            }
        };
        self.writer.send(Message::Response(resp)).await
    }

    async fn dispatch(
        &mut self,
        name: &str,
        req: &rtsp_types::Request<Bytes>,
        cseq: &str,
        session_header: Option<headers::Session>,
    ) -> Result<rtsp_types::Response<Bytes>, Error> {
        match name {
            "OPTIONS" => {
                let mut resp = self.response(StatusCode::Ok, cseq);
                resp.insert_header(
                    rtsp_headers::PUBLIC,
                    "OPTIONS, DESCRIBE, ANNOUNCE, SETUP, PLAY, PAUSE, RECORD, TEARDOWN, \
                     GET_PARAMETER, SET_PARAMETER",
                );
                Ok(resp)
            }
            "DESCRIBE" => self.handle_describe(req, cseq).await,
            "ANNOUNCE" => self.handle_announce(req, cseq).await,
            "SETUP" => self.handle_setup(req, cseq, session_header).await,
            "PLAY" => self.handle_play(req, cseq, session_header).await,
            "PAUSE" => self.handle_pause(cseq, session_header).await,
            "RECORD" => self.handle_record(cseq, session_header).await,
            "TEARDOWN" => self.handle_teardown(cseq, session_header).await,
            "GET_PARAMETER" | "SET_PARAMETER" => Ok(self.response(StatusCode::Ok, cseq)),
            _ => Err(Error::State {
                status: 455,
                msg: format!("unsupported method {}", name),
            }),
        }
    }

    fn request_url(req: &rtsp_types::Request<Bytes>) -> Result<Url, Error> {
        req.request_uri()
            .cloned()
            .ok_or_else(|| Error::Parse("request has no URL".to_owned()))
    }

    async fn lookup_stream(&self, path: &str) -> Option<Arc<ServerStream>> {
        if let Some(s) = self.inner.streams.lock().await.get(path) {
            return Some(s.clone());
        }
        self.inner.handler.on_describe(path)
    }

    async fn handle_describe(
        &mut self,
        req: &rtsp_types::Request<Bytes>,
        cseq: &str,
    ) -> Result<rtsp_types::Response<Bytes>, Error> {
        let url = Self::request_url(req)?;
        let (path, _) = Self::path_of(&url, false);
        let stream = match self.lookup_stream(&path).await {
            Some(s) => s,
            None => return Ok(self.response(StatusCode::NotFound, cseq)),
        };
        // Back-channel medias are only described to clients that ask.
        let wants_backchannel = matches!(
            req.header(&rtsp_headers::REQUIRE),
            Some(v) if v.as_str() == crate::BACKCHANNEL_REQUIRE
        );
        let body = if wants_backchannel {
            stream.sdp()
        } else {
            let medias: Vec<_> = stream
                .medias()
                .iter()
                .filter(|m| !m.is_back_channel)
                .cloned()
                .collect();
            Presentation::marshal_sdp(stream.name(), &medias)
        };
        let mut base = url.clone();
        if !base.path().ends_with('/') {
            let path = format!("{}/", base.path());
            base.set_path(&path);
        }
        let mut resp = self.response(StatusCode::Ok, cseq);
        resp.insert_header(rtsp_headers::CONTENT_TYPE, "application/sdp");
        resp.insert_header(rtsp_headers::CONTENT_BASE, base.to_string());
        Ok(resp.map_body(|_| Bytes::from(body.into_bytes())))
    }

    async fn handle_announce(
        &mut self,
        req: &rtsp_types::Request<Bytes>,
        cseq: &str,
    ) -> Result<rtsp_types::Response<Bytes>, Error> {
        let url = Self::request_url(req)?;
        let (path, _) = Self::path_of(&url, false);
        if !matches!(req.header(&rtsp_headers::CONTENT_TYPE), Some(v) if v.as_str() == "application/sdp")
        {
            return Err(Error::Parse("ANNOUNCE body must be application/sdp".to_owned()));
        }
        let mut base = url.clone();
        if !base.path().ends_with('/') {
            let path = format!("{}/", base.path());
            base.set_path(&path);
        }
        // A codec-parameter parse failure surfaces here as a 400.
        let presentation = Presentation::parse(base, req.body())?;

        let mut streams = self.inner.streams.lock().await;
        if streams.contains_key(&path) {
            return Err(Error::Parse(format!(
                "a publisher already exists for {:?}",
                path
            )));
        }
        let stream = ServerStream::new(&path, presentation.medias.clone());
        streams.insert(path.clone(), stream.clone());
        drop(streams);

        let session = ServerSession::new(self.peer);
        session
            .transition("ANNOUNCE")
            .await
            .map_err(|(status, msg)| Error::State { status, msg })?;
        *session.path.lock().await = Some(path);
        *session.stream.lock().await = Some(stream);
        *session.announced.lock().await = Some(presentation);
        *session.is_publisher.lock().await = true;
        self.register_session(&session).await;

        let mut resp = self.response(StatusCode::Ok, cseq);
        resp.insert_header(rtsp_headers::SESSION, self.session_header_value(&session));
        Ok(resp)
    }

    fn session_header_value(&self, session: &ServerSession) -> String {
        headers::Session {
            id: session.id.clone(),
            timeout: Some(self.inner.config.session_timeout.as_secs() as u32),
        }
        .to_string()
    }

    async fn register_session(&mut self, session: &Arc<ServerSession>) {
        self.sessions.insert(session.id.clone(), session.clone());
        self.inner
            .sessions
            .lock()
            .await
            .insert(session.id.clone(), session.clone());
    }

    fn session_of(
        &self,
        session_header: &Option<headers::Session>,
    ) -> Result<Arc<ServerSession>, Error> {
        let sh = session_header.as_ref().ok_or_else(|| Error::State {
            status: 454,
            msg: "no Session header".to_owned(),
        })?;
        self.sessions
            .get(&sh.id)
            .cloned()
            .ok_or_else(|| Error::State {
                status: 454,
                msg: format!("unknown session {}", sh.id),
            })
    }

    async fn handle_setup(
        &mut self,
        req: &rtsp_types::Request<Bytes>,
        cseq: &str,
        session_header: Option<headers::Session>,
    ) -> Result<rtsp_types::Response<Bytes>, Error> {
        let url = Self::request_url(req)?;
        let transport_header = req
            .header(&rtsp_headers::TRANSPORT)
            .ok_or_else(|| Error::Parse("SETUP without Transport header".to_owned()))?;
        // The client may offer several transports; pick the first we
        // understand.
        let transport = transport_header
            .as_str()
            .split(',')
            .find_map(|t| Transport::parse(t).ok())
            .ok_or_else(|| Error::State {
                status: 461,
                msg: format!("no supported transport in {:?}", transport_header.as_str()),
            })?;

        let session = match &session_header {
            Some(_) => self.session_of(&session_header)?,
            None => {
                let session = ServerSession::new(self.peer);
                self.register_session(&session).await;
                session
            }
        };
        session
            .transition("SETUP")
            .await
            .map_err(|(status, msg)| Error::State { status, msg })?;

        let is_publisher = *session.is_publisher.lock().await;
        let (path, control) = Self::path_of(&url, true);
        let (stream, media_idx, back_channel) = if is_publisher {
            let announced = session.announced.lock().await;
            let announced = announced.as_ref().expect("publisher has presentation");
            let media_idx = Self::resolve_media(&announced.medias, control.as_deref());
            let stream = session.stream.lock().await.clone().expect("publisher has stream");
            (stream, media_idx, false)
        } else {
            // The URL may or may not have a control suffix; try the full
            // path first for single-media streams with odd controls.
            let (full_path, _) = Self::path_of(&url, false);
            let (stream, media_idx) = match self.lookup_stream(&path).await {
                Some(s) => {
                    let i = Self::resolve_media(s.medias(), control.as_deref());
                    (s, i)
                }
                None => match self.lookup_stream(&full_path).await {
                    Some(s) => (s, 0),
                    None => return Ok(self.response(StatusCode::NotFound, cseq)),
                },
            };
            let back_channel = stream
                .medias()
                .get(media_idx)
                .map(|m| m.is_back_channel)
                .unwrap_or(false);
            {
                let mut session_path = session.path.lock().await;
                if session_path.is_none() {
                    *session_path = Some(path.clone());
                }
            }
            *session.stream.lock().await = Some(stream.clone());
            (stream, media_idx, back_channel)
        };

        let direction = if is_publisher || back_channel || transport.direction == Direction::Record
        {
            Direction::Record
        } else {
            Direction::Play
        };
        let receiving = direction == Direction::Record;

        let mut resp_transport = Transport {
            protocol: transport.protocol,
            direction: transport.direction,
            ..Transport::default()
        };
        resp_transport.ssrc = stream.ssrc(media_idx);

        let binding = match transport.protocol {
            Protocol::Tcp => {
                let channels = transport.interleaved.unwrap_or_else(|| {
                    let ch = self.next_channel;
                    (ch, ch + 1)
                });
                self.next_channel = std::cmp::max(self.next_channel, channels.0.wrapping_add(2));
                resp_transport.interleaved = Some(channels);
                self.channels
                    .insert(channels.0, (session.id.clone(), media_idx, false));
                self.channels
                    .insert(channels.1, (session.id.clone(), media_idx, true));
                Binding::Tcp { channels }
            }
            Protocol::Udp => {
                let udp = self.inner.udp.as_ref().ok_or_else(|| Error::State {
                    status: 461,
                    msg: "UDP transport not configured".to_owned(),
                })?;
                let (client_rtp, client_rtcp) =
                    transport.client_port.ok_or_else(|| Error::State {
                        status: 461,
                        msg: "UDP transport without client_port".to_owned(),
                    })?;
                let peer_rtp = SocketAddr::new(self.peer.ip(), client_rtp);
                let peer_rtcp = SocketAddr::new(self.peer.ip(), client_rtcp);
                resp_transport.server_port = Some((udp.rtp_port, udp.rtcp_port));
                if receiving {
                    self.inner
                        .udp_routes
                        .lock()
                        .await
                        .insert(peer_rtp, (session.id.clone(), media_idx));
                }
                Binding::Udp {
                    peer_rtp,
                    peer_rtcp,
                }
            }
            Protocol::Multicast => {
                if receiving {
                    return Err(Error::State {
                        status: 461,
                        msg: "multicast is read-only".to_owned(),
                    });
                }
                let out = self.multicast_out(&stream, media_idx).await?;
                resp_transport.destination = Some(IpAddr::V4(out.group));
                resp_transport.port = Some((out.rtp_port, out.rtcp_port));
                resp_transport.ttl = Some(crate::transport::udp::MULTICAST_TTL as u8);
                Binding::Multicast {
                    group: out.group,
                    rtp_port: out.rtp_port,
                    rtcp_port: out.rtcp_port,
                }
            }
        };

        session.medias.lock().await.push(SessionMedia {
            media_idx,
            direction,
            binding,
            checker: SequenceChecker::new(None, None),
            reorder: ReorderBuffer::new(if receiving && transport.protocol == Protocol::Udp {
                64
            } else {
                0
            }),
        });

        let mut resp = self.response(StatusCode::Ok, cseq);
        resp.insert_header(rtsp_headers::TRANSPORT, resp_transport.to_string());
        resp.insert_header(rtsp_headers::SESSION, self.session_header_value(&session));
        Ok(resp)
    }

    async fn multicast_out(
        &self,
        stream: &Arc<ServerStream>,
        media_idx: usize,
    ) -> Result<Arc<MulticastOut>, Error> {
        if let Some(out) = stream.multicast_out(media_idx).await {
            return Ok(out);
        }
        let group = {
            let mut allocator = self.inner.multicast.lock().await;
            match allocator.as_mut() {
                Some(a) => a.allocate(),
                None => {
                    return Err(Error::State {
                        status: 461,
                        msg: "multicast not configured".to_owned(),
                    })
                }
            }
        };
        let rtp_socket = tokio::net::UdpSocket::bind(("0.0.0.0", 0)).await?;
        let rtcp_socket = tokio::net::UdpSocket::bind(("0.0.0.0", 0)).await?;
        rtp_socket.set_multicast_ttl_v4(crate::transport::udp::MULTICAST_TTL)?;
        rtcp_socket.set_multicast_ttl_v4(crate::transport::udp::MULTICAST_TTL)?;
        let out = Arc::new(MulticastOut {
            group,
            rtp_port: self.inner.config.multicast_rtp_port,
            rtcp_port: self.inner.config.multicast_rtcp_port,
            rtp_socket: Arc::new(rtp_socket),
            rtcp_socket: Arc::new(rtcp_socket),
        });
        stream.set_multicast_out(media_idx, out.clone()).await;
        Ok(out)
    }

    async fn handle_play(
        &mut self,
        req: &rtsp_types::Request<Bytes>,
        cseq: &str,
        session_header: Option<headers::Session>,
    ) -> Result<rtsp_types::Response<Bytes>, Error> {
        let session = self.session_of(&session_header)?;
        session
            .transition("PLAY")
            .await
            .map_err(|(status, msg)| Error::State { status, msg })?;
        let stream = session
            .stream
            .lock()
            .await
            .clone()
            .ok_or_else(|| Error::State {
                status: 455,
                msg: "PLAY without SETUP".to_owned(),
            })?;

        let mut bindings = HashMap::new();
        let mut rtp_info = Vec::new();
        let url = Self::request_url(req)?;
        for media in session.medias.lock().await.iter() {
            if media.direction == Direction::Record {
                continue;
            }
            let reader_binding = match &media.binding {
                Binding::Tcp { channels } => ReaderBinding::Tcp {
                    writer: self.writer.clone(),
                    channels: *channels,
                },
                Binding::Udp {
                    peer_rtp,
                    peer_rtcp,
                } => {
                    let udp = self.inner.udp.as_ref().expect("udp bound at setup");
                    ReaderBinding::Udp {
                        socket: udp.rtp.clone(),
                        peer_rtp: *peer_rtp,
                        peer_rtcp: *peer_rtcp,
                    }
                }
                Binding::Multicast { .. } => ReaderBinding::Multicast,
            };
            bindings.insert(media.media_idx, reader_binding);
            let control = stream
                .medias()
                .get(media.media_idx)
                .map(|m| m.control.clone())
                .unwrap_or_default();
            let control = if control.is_empty() {
                format!("trackID={}", media.media_idx)
            } else {
                control
            };
            let mut base = url.to_string();
            if !base.ends_with('/') {
                base.push('/');
            }
            rtp_info.push(headers::RtpInfoEntry {
                url: format!("{}{}", base, control),
                seq: None,
                rtptime: None,
            });
        }
        stream.add_reader(&session.id, bindings).await;

        let mut resp = self.response(StatusCode::Ok, cseq);
        if !rtp_info.is_empty() {
            resp.insert_header(rtsp_headers::RTP_INFO, headers::format_rtp_info(&rtp_info));
        }
        resp.insert_header(rtsp_headers::SESSION, self.session_header_value(&session));
        Ok(resp)
    }

    async fn handle_pause(
        &mut self,
        cseq: &str,
        session_header: Option<headers::Session>,
    ) -> Result<rtsp_types::Response<Bytes>, Error> {
        let session = self.session_of(&session_header)?;
        session
            .transition("PAUSE")
            .await
            .map_err(|(status, msg)| Error::State { status, msg })?;
        if let Some(stream) = session.stream.lock().await.clone() {
            stream.remove_reader(&session.id).await;
        }
        let mut resp = self.response(StatusCode::Ok, cseq);
        resp.insert_header(rtsp_headers::SESSION, self.session_header_value(&session));
        Ok(resp)
    }

    async fn handle_record(
        &mut self,
        cseq: &str,
        session_header: Option<headers::Session>,
    ) -> Result<rtsp_types::Response<Bytes>, Error> {
        let session = self.session_of(&session_header)?;
        {
            // All announced medias must be set up before RECORD.
            let announced = session.announced.lock().await;
            let expected = announced.as_ref().map(|p| p.medias.len()).unwrap_or(0);
            let bound = session.medias.lock().await.len();
            if bound < expected {
                return Err(Error::State {
                    status: 455,
                    msg: format!("only {} of {} medias are set up", bound, expected),
                });
            }
        }
        session
            .transition("RECORD")
            .await
            .map_err(|(status, msg)| Error::State { status, msg })?;
        let mut resp = self.response(StatusCode::Ok, cseq);
        resp.insert_header(rtsp_headers::SESSION, self.session_header_value(&session));
        Ok(resp)
    }

    async fn handle_teardown(
        &mut self,
        cseq: &str,
        session_header: Option<headers::Session>,
    ) -> Result<rtsp_types::Response<Bytes>, Error> {
        let session = self.session_of(&session_header)?;
        session
            .transition("TEARDOWN")
            .await
            .map_err(|(status, msg)| Error::State { status, msg })?;
        self.sessions.remove(&session.id);
        let id = session.id.clone();
        self.channels.retain(|_, v| v.0 != id);
        close_session(&self.inner, &session).await;
        Ok(self.response(StatusCode::Ok, cseq))
    }

    /// Routes an interleaved data frame: RTP in the record direction is
    /// delivered to the handler and, for publishers, fanned out to
    /// readers.
    async fn handle_data(&mut self, channel_id: u8, payload: Bytes) {
        let (session_id, media_idx, is_rtcp) = match self.channels.get(&channel_id) {
            Some(v) => v.clone(),
            None => {
                debug!("data on unknown channel {}", channel_id);
                return;
            }
        };
        let session = match self.sessions.get(&session_id) {
            Some(s) => s.clone(),
            None => return,
        };
        session.touch().await;
        if is_rtcp {
            // Receiver reports from readers and sender reports from
            // publishers; nothing to route.
            return;
        }
        deliver_rtp(&self.inner, &session, media_idx, payload).await;
    }
}

/// Delivers one record-direction RTP datagram or frame into a session:
/// reorder (UDP), sequence-check, hand to the application, and fan out
/// to readers when the session publishes a stream.
pub(crate) async fn deliver_rtp(
    inner: &Arc<ServerInner>,
    session: &Arc<ServerSession>,
    media_idx: usize,
    payload: Bytes,
) {
    if session.state().await != SessionState::Record {
        // Back-channel audio arrives on play sessions too; anything else
        // mid-state is dropped.
        let medias = session.medias.lock().await;
        let ok = medias
            .iter()
            .any(|m| m.media_idx == media_idx && m.direction == Direction::Record);
        if !ok {
            return;
        }
    }
    let pkt = match crate::rtp::Packet::parse(payload) {
        Ok(p) => p,
        Err(e) => {
            debug!("dropping bad RTP packet: {}", e);
            return;
        }
    };
    let ordered = {
        let mut medias = session.medias.lock().await;
        let media = match medias.iter_mut().find(|m| m.media_idx == media_idx) {
            Some(m) => m,
            None => return,
        };
        let mut ordered = Vec::new();
        for pkt in media.reorder.push(pkt) {
            match media.checker.admit(&pkt) {
                Admitted::Ok { .. } => ordered.push(pkt),
                Admitted::Spurious => {}
            }
        }
        ordered
    };
    if ordered.is_empty() {
        return;
    }
    let path = session.path.lock().await.clone().unwrap_or_default();
    let is_publisher = *session.is_publisher.lock().await;
    let stream = session.stream.lock().await.clone();
    let ctx = PacketContext {
        session_id: session.id.clone(),
        path,
        media_idx,
    };
    for pkt in ordered {
        inner.handler.on_packet_rtp(&ctx, &pkt);
        if is_publisher {
            if let Some(stream) = &stream {
                let _ = stream.write_rtp(media_idx, &pkt).await;
            }
        }
    }
}
