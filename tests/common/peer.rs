//! Session wiring for tests

use std::time::Duration;

use capwire::session::{FrameSink, FrameStream, Transport, WireMessage};
use capwire::{FrameTap, MemoryTransport, SessionConfig, TargetObject, TransportSession};

/// Two sessions over an in-memory channel; `tap` sees the client's frames
pub struct Pair {
    pub client: TransportSession,
    pub server: TransportSession,
    pub tap: FrameTap,
}

pub fn connected<O: TargetObject + 'static>(target: O) -> Pair {
    connected_with(target, SessionConfig::default())
}

pub fn connected_with<O: TargetObject + 'static>(target: O, config: SessionConfig) -> Pair {
    let tap = FrameTap::new();
    let (client_end, server_end) = MemoryTransport::pair();
    let client = TransportSession::connect(client_end.with_tap(tap.clone()), config.clone());
    let server = TransportSession::serve(server_end, target, config);
    Pair { client, server, tap }
}

/// The other end of a session, driven frame by frame
pub struct RawPeer {
    sink: Box<dyn FrameSink>,
    stream: Box<dyn FrameStream>,
}

impl RawPeer {
    pub fn new(transport: MemoryTransport) -> Self {
        let (sink, stream) = transport.split();
        Self { sink, stream }
    }

    /// Next frame, decoded; panics after two seconds of silence
    pub async fn recv(&mut self) -> WireMessage {
        let frame = tokio::time::timeout(Duration::from_secs(2), self.stream.recv())
            .await
            .expect("timed out waiting for a frame")
            .expect("channel closed")
            .expect("transport error");
        WireMessage::decode(&frame).expect("undecodable frame")
    }

    pub async fn send(&mut self, message: &WireMessage) {
        self.send_raw(&message.encode().unwrap()).await;
    }

    pub async fn send_raw(&mut self, frame: &str) {
        self.sink.send(frame.to_string()).await.unwrap();
    }
}

pub fn client_with_raw_peer(config: SessionConfig) -> (TransportSession, RawPeer) {
    let (client_end, peer_end) = MemoryTransport::pair();
    (
        TransportSession::connect(client_end, config),
        RawPeer::new(peer_end),
    )
}

pub fn server_with_raw_peer<O: TargetObject + 'static>(target: O) -> (TransportSession, RawPeer) {
    let (server_end, peer_end) = MemoryTransport::pair();
    (
        TransportSession::serve(server_end, target, SessionConfig::default()),
        RawPeer::new(peer_end),
    )
}
