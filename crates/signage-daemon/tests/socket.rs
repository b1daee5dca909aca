mod common;

use common::harness::Harness;
use signage_daemon::socket;
use signage_proto::protocol::{
    Broadcast, Channel, Command, ContentType, Message, PROTOCOL_VERSION,
};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

struct Client {
    stream: TcpStream,
    buf: Vec<u8>,
}

impl Client {
    async fn connect(addr: std::net::SocketAddr) -> Self {
        Self {
            stream: TcpStream::connect(addr).await.unwrap(),
            buf: Vec::new(),
        }
    }

    async fn send(&mut self, cmd: Command) {
        let frame = Message::Command(cmd).encode().unwrap();
        self.stream.write_all(&frame).await.unwrap();
    }

    async fn next(&mut self) -> Broadcast {
        loop {
            if let Ok((msg, consumed)) = Message::decode(&self.buf) {
                self.buf.drain(..consumed);
                match msg {
                    Message::Broadcast(b) => return b,
                    Message::Command(c) => panic!("daemon sent a command: {:?}", c),
                }
            }
            let mut tmp = [0u8; 4096];
            let n = self.stream.read(&mut tmp).await.unwrap();
            assert!(n > 0, "daemon closed the connection");
            self.buf.extend_from_slice(&tmp[..n]);
        }
    }

    /// Skip broadcasts until one matches.
    async fn expect(&mut self, what: &str, pred: impl Fn(&Broadcast) -> bool) -> Broadcast {
        tokio::time::timeout(Duration::from_secs(3), async {
            loop {
                let b = self.next().await;
                if pred(&b) {
                    return b;
                }
            }
        })
        .await
        .unwrap_or_else(|_| panic!("no {} frame", what))
    }
}

#[tokio::test]
async fn client_controls_channels_over_socket() {
    let lobby = Channel::new(1, "Lobby", ContentType::Video).with_contents(["loop.mp4"]);
    let h = Harness::start(vec![lobby]).await;

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let server = tokio::spawn(socket::serve(listener, h.handle.clone()));

    let mut client = Client::connect(addr).await;
    match client.next().await {
        Broadcast::Hello {
            protocol_version, ..
        } => assert_eq!(protocol_version, PROTOCOL_VERSION),
        other => panic!("expected Hello, got {:?}", other),
    }

    client.send(Command::Start { channel_id: 1 }).await;
    client
        .expect("channel", |b| {
            matches!(b, Broadcast::Channel { status } if status.channel_id == 1)
        })
        .await;

    h.wait_for(1, Duration::from_secs(3), |s| s.is_live()).await;
    client.send(Command::ListLive).await;
    let entries = match client
        .expect("live", |b| {
            matches!(b, Broadcast::Live { entries } if !entries.is_empty())
        })
        .await
    {
        Broadcast::Live { entries } => entries,
        _ => unreachable!(),
    };
    assert_eq!(entries[0].channel_id, 1);

    client.send(Command::Status { channel_id: 42 }).await;
    match client
        .expect("error", |b| matches!(b, Broadcast::Error { .. }))
        .await
    {
        Broadcast::Error { message } => assert!(message.contains("42"), "{}", message),
        _ => unreachable!(),
    }

    server.abort();
    h.shutdown().await;
}

#[tokio::test]
async fn invalid_frame_does_not_wedge_client() {
    let lobby = Channel::new(1, "Lobby", ContentType::Video).with_contents(["loop.mp4"]);
    let h = Harness::start(vec![lobby]).await;

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let server = tokio::spawn(socket::serve(listener, h.handle.clone()));

    let mut client = Client::connect(addr).await;
    client.expect("hello", |b| matches!(b, Broadcast::Hello { .. })).await;

    let mut garbage = 7u32.to_be_bytes().to_vec();
    garbage.extend_from_slice(b"garbage");
    client.stream.write_all(&garbage).await.unwrap();
    client.send(Command::Start { channel_id: 1 }).await;

    client
        .expect("error", |b| matches!(b, Broadcast::Error { .. }))
        .await;
    client
        .expect("channel", |b| {
            matches!(b, Broadcast::Channel { status } if status.channel_id == 1)
        })
        .await;
    assert_eq!(h.launcher.launch_count(1), 1);

    server.abort();
    h.shutdown().await;
}

#[tokio::test]
async fn oversized_frame_closes_connection() {
    let h = Harness::start(vec![]).await;

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let server = tokio::spawn(socket::serve(listener, h.handle.clone()));

    let mut client = Client::connect(addr).await;
    client.expect("hello", |b| matches!(b, Broadcast::Hello { .. })).await;
    client
        .stream
        .write_all(&u32::MAX.to_be_bytes())
        .await
        .unwrap();
    client
        .expect("error", |b| matches!(b, Broadcast::Error { .. }))
        .await;

    let mut rest = Vec::new();
    let closed = tokio::time::timeout(
        Duration::from_secs(3),
        client.stream.read_to_end(&mut rest),
    )
    .await
    .unwrap();
    assert!(closed.is_ok());

    server.abort();
    h.shutdown().await;
}
