//! End-to-end client/server scenarios over loopback.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use url::Url;

use ocular::client::{ClientConfig, PacketItem, Session, TransportChoice};
use ocular::Credentials;
use ocular::format::{Format, MediaType};
use ocular::presentation::MediaInfo;
use ocular::server::{
    NullHandler, PacketContext, Server, ServerConfig, ServerHandler, ServerStream,
};

fn video_media() -> MediaInfo {
    MediaInfo::new(
        MediaType::Video,
        vec![Format::H264 {
            payload_type: 96,
            sps: None,
            pps: None,
            packetization_mode: 1,
        }],
    )
}

fn backchannel_media() -> MediaInfo {
    let mut media = MediaInfo::new(
        MediaType::Audio,
        vec![Format::G711 {
            payload_type: 0,
            mu_law: true,
            sample_rate: 8000,
            channels: 1,
        }],
    );
    media.is_back_channel = true;
    media
}

fn test_packet(payload: &'static [u8]) -> ocular::rtp::Packet {
    ocular::rtp::Packet {
        payload_type: 96,
        sequence_number: 7,
        timestamp: 90_000,
        ssrc: 0x1234_5678,
        mark: true,
        payload: Bytes::from_static(payload),
    }
}

async fn bind_server(config: ServerConfig, handler: Arc<dyn ServerHandler>) -> Server {
    let config = ServerConfig {
        rtsp_address: "127.0.0.1:0".to_owned(),
        ..config
    };
    Server::bind(config, handler).await.unwrap()
}

fn server_url(server: &Server, path: &str) -> Url {
    Url::parse(&format!("rtsp://{}/{}", server.local_addr(), path)).unwrap()
}

#[tokio::test]
async fn describe_setup_play_delivers_rtp_over_tcp() {
    let server = bind_server(ServerConfig::default(), Arc::new(NullHandler)).await;
    let stream = ServerStream::new("cam", vec![video_media()]);
    server.add_stream("cam", stream.clone()).await;

    let mut client = Session::connect(
        server_url(&server, "cam"),
        ClientConfig {
            transport: TransportChoice::Tcp,
            ..ClientConfig::default()
        },
    )
    .await
    .unwrap();
    client.options().await.unwrap();
    let presentation = client.describe().await.unwrap();
    assert_eq!(presentation.medias.len(), 1);
    client.setup(0).await.unwrap();
    client.play().await.unwrap();
    assert!(client.session_id().is_some());

    stream.write_rtp(0, &test_packet(&[0x65, 1, 2, 3])).await.unwrap();

    let item = tokio::time::timeout(Duration::from_secs(5), client.next_item())
        .await
        .expect("timed out waiting for RTP")
        .unwrap()
        .expect("connection closed");
    match item {
        PacketItem::Rtp {
            media_idx, packet, ..
        } => {
            assert_eq!(media_idx, 0);
            assert_eq!(&packet.payload[..], &[0x65, 1, 2, 3]);
            // The stream's allocated SSRC, not the publisher's.
            assert_eq!(Some(packet.ssrc), stream.ssrc(0));
        }
        o => panic!("unexpected item {:?}", o),
    }

    client.teardown().await.unwrap();
}

#[tokio::test]
async fn play_delivers_rtp_over_udp() {
    let server = bind_server(
        ServerConfig {
            udp_rtp_address: Some("127.0.0.1:0".to_owned()),
            ..ServerConfig::default()
        },
        Arc::new(NullHandler),
    )
    .await;
    let stream = ServerStream::new("cam", vec![video_media()]);
    server.add_stream("cam", stream.clone()).await;

    let mut client = Session::connect(
        server_url(&server, "cam"),
        ClientConfig {
            transport: TransportChoice::Udp,
            ..ClientConfig::default()
        },
    )
    .await
    .unwrap();
    client.describe().await.unwrap();
    client.setup(0).await.unwrap();
    client.play().await.unwrap();

    // UDP delivery may race the PLAY response; retry a few times.
    for _ in 0..10 {
        stream.write_rtp(0, &test_packet(&[0x41, 9])).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    let item = tokio::time::timeout(Duration::from_secs(5), client.next_item())
        .await
        .expect("timed out waiting for RTP")
        .unwrap()
        .expect("connection closed");
    match item {
        PacketItem::Rtp { packet, .. } => assert_eq!(&packet.payload[..], &[0x41, 9]),
        o => panic!("unexpected item {:?}", o),
    }
}

#[tokio::test]
async fn digest_auth_retry_succeeds() {
    let server = bind_server(
        ServerConfig {
            creds: Some(Credentials {
                username: "user".to_owned(),
                password: "pass".to_owned(),
            }),
            realm: "r".to_owned(),
            ..ServerConfig::default()
        },
        Arc::new(NullHandler),
    )
    .await;
    server
        .add_stream("cam", ServerStream::new("cam", vec![video_media()]))
        .await;

    // Wrong password: the one retry must not succeed.
    let mut bad = Session::connect(
        server_url(&server, "cam"),
        ClientConfig {
            creds: Some(Credentials {
                username: "user".to_owned(),
                password: "wrong".to_owned(),
            }),
            transport: TransportChoice::Tcp,
            ..ClientConfig::default()
        },
    )
    .await
    .unwrap();
    assert!(bad.describe().await.is_err());

    // Right password: 401 then 200.
    let mut client = Session::connect(
        server_url(&server, "cam"),
        ClientConfig {
            creds: Some(Credentials {
                username: "user".to_owned(),
                password: "pass".to_owned(),
            }),
            transport: TransportChoice::Tcp,
            ..ClientConfig::default()
        },
    )
    .await
    .unwrap();
    client.describe().await.unwrap();
    client.setup(0).await.unwrap();
    client.play().await.unwrap();
}

struct Capture {
    tx: Mutex<tokio::sync::mpsc::UnboundedSender<(PacketContext, ocular::rtp::Packet)>>,
}

impl ServerHandler for Capture {
    fn on_packet_rtp(&self, ctx: &PacketContext, pkt: &ocular::rtp::Packet) {
        let _ = self.tx.lock().unwrap().send((ctx.clone(), pkt.clone()));
    }
}

#[tokio::test]
async fn backchannel_audio_reaches_server_handler() {
    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
    let server = bind_server(
        ServerConfig::default(),
        Arc::new(Capture { tx: Mutex::new(tx) }),
    )
    .await;
    let stream = ServerStream::new("cam", vec![video_media(), backchannel_media()]);
    server.add_stream("cam", stream).await;

    let mut client = Session::connect(
        server_url(&server, "cam"),
        ClientConfig {
            transport: TransportChoice::Tcp,
            request_back_channels: true,
            ..ClientConfig::default()
        },
    )
    .await
    .unwrap();
    let presentation = client.describe().await.unwrap();
    assert_eq!(presentation.medias.len(), 2);
    assert!(presentation.medias[1].is_back_channel);
    client.setup(1).await.unwrap();
    client.play().await.unwrap();

    let mut pkt = test_packet(&[0x55; 160]);
    pkt.payload_type = 0;
    client.write_rtp(1, &pkt).await.unwrap();

    let (ctx, received) = tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("timed out waiting for back-channel audio")
        .expect("handler channel closed");
    assert_eq!(ctx.media_idx, 1);
    assert_eq!(ctx.path, "cam");
    assert_eq!(received.payload.len(), 160);
}

#[tokio::test]
async fn backchannel_hidden_without_require() {
    let server = bind_server(ServerConfig::default(), Arc::new(NullHandler)).await;
    let stream = ServerStream::new("cam", vec![video_media(), backchannel_media()]);
    server.add_stream("cam", stream).await;

    let mut client = Session::connect(
        server_url(&server, "cam"),
        ClientConfig {
            transport: TransportChoice::Tcp,
            ..ClientConfig::default()
        },
    )
    .await
    .unwrap();
    let presentation = client.describe().await.unwrap();
    assert_eq!(presentation.medias.len(), 1);
}

#[tokio::test]
async fn announce_record_feeds_play_readers() {
    let server = bind_server(ServerConfig::default(), Arc::new(NullHandler)).await;

    // Publisher announces and records.
    let mut publisher = Session::connect(
        server_url(&server, "pub"),
        ClientConfig {
            transport: TransportChoice::Tcp,
            ..ClientConfig::default()
        },
    )
    .await
    .unwrap();
    publisher.announce(vec![video_media()]).await.unwrap();
    publisher.setup(0).await.unwrap();
    publisher.record().await.unwrap();

    // Reader plays the published stream.
    let mut reader = Session::connect(
        server_url(&server, "pub"),
        ClientConfig {
            transport: TransportChoice::Tcp,
            ..ClientConfig::default()
        },
    )
    .await
    .unwrap();
    reader.describe().await.unwrap();
    reader.setup(0).await.unwrap();
    reader.play().await.unwrap();

    publisher
        .write_rtp(0, &test_packet(&[0x65, 0xaa, 0xbb]))
        .await
        .unwrap();

    let item = tokio::time::timeout(Duration::from_secs(5), reader.next_item())
        .await
        .expect("timed out waiting for routed RTP")
        .unwrap()
        .expect("connection closed");
    match item {
        PacketItem::Rtp { packet, .. } => assert_eq!(&packet.payload[..], &[0x65, 0xaa, 0xbb]),
        o => panic!("unexpected item {:?}", o),
    }
}

#[tokio::test]
async fn methods_rejected_in_wrong_state() {
    let server = bind_server(ServerConfig::default(), Arc::new(NullHandler)).await;
    server
        .add_stream("cam", ServerStream::new("cam", vec![video_media()]))
        .await;

    let mut client = Session::connect(
        server_url(&server, "cam"),
        ClientConfig {
            transport: TransportChoice::Tcp,
            ..ClientConfig::default()
        },
    )
    .await
    .unwrap();
    client.describe().await.unwrap();
    client.setup(0).await.unwrap();
    // PAUSE before PLAY: the state machine answers 455.
    let err = client.pause().await.unwrap_err();
    let msg = err.to_string();
    assert!(
        msg.contains("MethodNotValidInThisState") || msg.contains("455"),
        "unexpected error: {}",
        msg
    );
    // The session is still usable.
    client.play().await.unwrap();
}
