//! Shared helpers for integration tests: a framed loopback client and
//! event-stream assertions.

#![allow(dead_code)]

use macropad_server::connection::{Acceptor, ConnectionRegistry, SessionSettings};
use macropad_server::events::{ChannelListener, ServerEvent};
use macropad_server::protocol::{ClientHello, FrameReader, FrameWriter, Message, ServerHello};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::broadcast;
use tokio::time::{sleep, timeout, Instant};

pub const WAIT: Duration = Duration::from_secs(5);

pub fn hello(name: &str) -> ClientHello {
    ClientHello {
        client_name: name.to_string(),
        client_version: "1.0.0".to_string(),
        platform: "test".to_string(),
        profiles: vec![],
        screen: None,
    }
}

/// Start an acceptor on an ephemeral loopback port
pub async fn start_acceptor(
    listener: Arc<ChannelListener>,
    settings: SessionSettings,
) -> (Arc<Acceptor>, SocketAddr) {
    let acceptor = Arc::new(
        Acceptor::new(Arc::new(ConnectionRegistry::new()), listener)
            .with_session_settings(settings)
            .with_shutdown_timeout(Duration::from_secs(2)),
    );
    acceptor.configure("127.0.0.1", 0).unwrap();
    let addr = acceptor.start().await.unwrap();
    (acceptor, addr)
}

pub struct TestClient {
    reader: FrameReader<OwnedReadHalf>,
    writer: FrameWriter<OwnedWriteHalf>,
}

impl TestClient {
    pub async fn connect(addr: SocketAddr) -> Self {
        let stream = timeout(WAIT, TcpStream::connect(addr))
            .await
            .expect("connect timed out")
            .expect("connect failed");
        let (read_half, write_half) = stream.into_split();
        Self {
            reader: FrameReader::new(read_half),
            writer: FrameWriter::new(write_half),
        }
    }

    /// Connect and complete the handshake
    pub async fn handshake(addr: SocketAddr, name: &str) -> (Self, ServerHello) {
        let mut client = Self::connect(addr).await;
        client.send(Message::Handshake(hello(name))).await;
        match client.recv().await {
            Some(Message::HandshakeAccepted(server_hello)) => (client, server_hello),
            other => panic!("expected handshake acceptance, got {:?}", other),
        }
    }

    pub async fn send(&mut self, message: Message) {
        self.writer.write_message(&message).await.unwrap();
    }

    pub async fn send_raw(&mut self, bytes: &[u8]) {
        self.writer.get_mut().write_all(bytes).await.unwrap();
    }

    /// Next message, `None` on a clean close
    pub async fn recv(&mut self) -> Option<Message> {
        timeout(WAIT, self.reader.read_message())
            .await
            .expect("no message from server")
            .unwrap()
    }

    /// Wait until the server closes the socket, skipping queued frames
    pub async fn expect_closed(&mut self) {
        let deadline = Instant::now() + WAIT;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            match timeout(remaining, self.reader.read_message()).await {
                Err(_) => panic!("server did not close the connection"),
                Ok(Ok(Some(_))) => continue,
                Ok(Ok(None)) | Ok(Err(_)) => return,
            }
        }
    }
}

/// Skip events until one matches `pred`
pub async fn expect_event<F>(rx: &mut broadcast::Receiver<ServerEvent>, pred: F) -> ServerEvent
where
    F: Fn(&ServerEvent) -> bool,
{
    let deadline = Instant::now() + WAIT;
    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        let event = timeout(remaining, rx.recv())
            .await
            .expect("expected event not published")
            .expect("event channel closed");
        if pred(&event) {
            return event;
        }
    }
}

/// Poll `cond` until it holds or the wait expires
pub async fn wait_until<F: Fn() -> bool>(cond: F) {
    let deadline = Instant::now() + WAIT;
    while !cond() {
        assert!(Instant::now() < deadline, "condition not reached in time");
        sleep(Duration::from_millis(10)).await;
    }
}
