#![allow(dead_code)]

use bytes::Bytes;
use h2mux::h2::consts::CONNECTION_PREFACE;
use h2mux::{Connection, ConnectionConfig, Frame, FrameType, Header, PushObserver};
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};

const PEER_MAX_FRAME_SIZE: u32 = (1 << 24) - 1;

/// Server side of an in-memory connection, driven frame by frame from a test.
pub struct MockPeer {
    io: DuplexStream,
    encoder: hpack::Encoder<'static>,
    decoder: hpack::Decoder<'static>,
}

impl MockPeer {
    pub fn new(io: DuplexStream) -> Self {
        Self {
            io,
            encoder: hpack::Encoder::new(),
            decoder: hpack::Decoder::new(),
        }
    }

    /// Consumes the client preface and the client's SETTINGS frame.
    pub async fn read_preface(&mut self) -> Frame {
        let mut preface = [0u8; 24];
        self.io
            .read_exact(&mut preface)
            .await
            .expect("read connection preface");
        assert_eq!(&preface[..], CONNECTION_PREFACE);

        let settings = self.read_frame().await;
        assert_eq!(settings.frame_type, FrameType::Settings);
        assert!(!settings.is_ack());
        settings
    }

    pub async fn read_frame(&mut self) -> Frame {
        self.try_read_frame().await.expect("peer expected a frame")
    }

    /// `None` once the client has closed its side.
    pub async fn try_read_frame(&mut self) -> Option<Frame> {
        Frame::read_from(&mut self.io, PEER_MAX_FRAME_SIZE)
            .await
            .ok()
            .flatten()
    }

    /// Next frame of `wanted` type, skipping connection housekeeping
    /// (SETTINGS, WINDOW_UPDATE, PING) the client sends along the way.
    pub async fn next_frame(&mut self, wanted: FrameType) -> Frame {
        loop {
            let frame = self.read_frame().await;
            if frame.frame_type == wanted {
                return frame;
            }
            match frame.frame_type {
                FrameType::Settings | FrameType::WindowUpdate | FrameType::Ping => continue,
                other => panic!("expected {:?}, got {:?}: {:?}", wanted, other, frame),
            }
        }
    }

    pub async fn send(&mut self, frame: Frame) {
        let bytes = frame.serialize().expect("serialize frame");
        self.io.write_all(&bytes).await.expect("write frame");
    }

    pub async fn send_raw(&mut self, bytes: &[u8]) {
        self.io.write_all(bytes).await.expect("write bytes");
    }

    pub fn encode(&mut self, headers: &[(&str, &str)]) -> Bytes {
        let block = self
            .encoder
            .encode(headers.iter().map(|(n, v)| (n.as_bytes(), v.as_bytes())));
        Bytes::from(block)
    }

    pub fn decode(&mut self, block: &[u8]) -> Vec<(String, String)> {
        self.decoder
            .decode(block)
            .expect("decode header block")
            .into_iter()
            .map(|(n, v)| {
                (
                    String::from_utf8(n).expect("utf-8 name"),
                    String::from_utf8(v).expect("utf-8 value"),
                )
            })
            .collect()
    }

    /// Completes a handshake from the server side and then swallows every
    /// frame until the client goes away.
    pub async fn serve_silently(mut self, settings: Vec<(u16, u32)>) {
        self.read_preface().await;
        self.send(Frame::settings(&settings)).await;
        while self.try_read_frame().await.is_some() {}
    }
}

pub fn get_request(path: &str) -> Vec<Header> {
    vec![
        Header::new(":method", "GET"),
        Header::new(":scheme", "https"),
        Header::new(":authority", "example.com"),
        Header::new(":path", path),
    ]
}

pub fn post_request(path: &str) -> Vec<Header> {
    vec![
        Header::new(":method", "POST"),
        Header::new(":scheme", "https"),
        Header::new(":authority", "example.com"),
        Header::new(":path", path),
        Header::new("content-type", "application/octet-stream"),
    ]
}

pub async fn connect(config: ConnectionConfig) -> (Connection, MockPeer) {
    connect_with(config, &[], None).await
}

/// Handshakes a client over an in-memory transport. The peer answers with
/// `peer_settings` and has already consumed the client's preface.
pub async fn connect_with(
    config: ConnectionConfig,
    peer_settings: &[(u16, u32)],
    observer: Option<Arc<dyn PushObserver>>,
) -> (Connection, MockPeer) {
    let (client, server) = tokio::io::duplex(1 << 20);
    let mut peer = MockPeer::new(server);

    let handshake = tokio::spawn(async move {
        match observer {
            Some(observer) => Connection::handshake_with_observer(client, config, observer).await,
            None => Connection::handshake(client, config).await,
        }
    });

    peer.read_preface().await;
    peer.send(Frame::settings(peer_settings)).await;

    let connection = handshake
        .await
        .expect("handshake task")
        .expect("handshake");
    let ack = peer.next_frame(FrameType::Settings).await;
    assert!(ack.is_ack());
    (connection, peer)
}
