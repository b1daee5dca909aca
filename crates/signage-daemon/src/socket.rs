use crate::core::SupervisorHandle;
use crate::BroadcastMessage;
use signage_proto::protocol::{Broadcast, Command, Message, PROTOCOL_VERSION};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;
use tracing::{error, info, warn};

/// Largest frame a client may send.  Commands are a few dozen bytes.
const MAX_FRAME_LEN: usize = 64 * 1024;

#[derive(Debug)]
enum FrameError {
    /// The frame was consumed but did not decode.
    Invalid(String),
    /// The length header is over [`MAX_FRAME_LEN`]; the stream cannot be resynced.
    TooLarge(usize),
}

/// Take the next complete frame off the front of `buf`.  `Ok(None)` means
/// more bytes are needed.
fn take_frame(buf: &mut Vec<u8>) -> Result<Option<Message>, FrameError> {
    if buf.len() < 4 {
        return Ok(None);
    }
    let len = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]) as usize;
    if len > MAX_FRAME_LEN {
        return Err(FrameError::TooLarge(len));
    }
    if buf.len() < 4 + len {
        return Ok(None);
    }
    let decoded = Message::decode(&buf[..4 + len]);
    buf.drain(..4 + len);
    match decoded {
        Ok((msg, _)) => Ok(Some(msg)),
        Err(e) => Err(FrameError::Invalid(e.to_string())),
    }
}

pub fn start_server(
    bind_address: String,
    port: u16,
    supervisor: SupervisorHandle,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let addr = format!("{}:{}", bind_address, port);

        let listener = match TcpListener::bind(&addr).await {
            Ok(l) => l,
            Err(e) => {
                error!("Failed to bind TCP socket {}: {}", addr, e);
                return;
            }
        };

        info!("TCP control socket listening at {}", addr);
        serve(listener, supervisor).await;
    })
}

/// Accept clients on an already bound listener.
pub async fn serve(listener: TcpListener, supervisor: SupervisorHandle) {
    let mut client_id = 0usize;

    loop {
        match listener.accept().await {
            Ok((stream, peer)) => {
                client_id += 1;
                let id = client_id;
                info!("Client {} connected from {}", id, peer);

                let supervisor = supervisor.clone();
                let broadcast_rx = supervisor.subscribe();
                tokio::spawn(async move {
                    handle_client(stream, supervisor, id, broadcast_rx).await;
                    info!("Client {} disconnected", id);
                });
            }
            Err(e) => {
                error!("Failed to accept connection: {}", e);
            }
        }
    }
}

async fn handle_client(
    stream: TcpStream,
    supervisor: SupervisorHandle,
    client_id: usize,
    mut broadcast_rx: broadcast::Receiver<BroadcastMessage>,
) {
    let (mut read_half, mut write_half) = stream.into_split();
    let mut tmp = [0u8; 4096];
    let mut read_buf: Vec<u8> = Vec::new();

    // Send Hello with current state snapshot on connect
    let state = supervisor.state();
    let hello = Broadcast::Hello {
        protocol_version: PROTOCOL_VERSION,
        daemon_rev: state.rev,
        state,
    };
    if send(&mut write_half, hello).await.is_err() {
        return;
    }

    loop {
        tokio::select! {
            result = read_half.read(&mut tmp) => {
                match result {
                    Ok(0) => {
                        info!("Client {} closed connection", client_id);
                        break;
                    }
                    Ok(n) => {
                        read_buf.extend_from_slice(&tmp[..n]);

                        loop {
                            match take_frame(&mut read_buf) {
                                Ok(None) => break,
                                Ok(Some(Message::Command(cmd))) => {
                                    info!("Client {} sent command: {:?}", client_id, cmd);

                                    let reply = execute(&supervisor, cmd).await;
                                    if send(&mut write_half, reply).await.is_err() {
                                        return;
                                    }
                                }
                                Ok(Some(Message::Broadcast(_))) => {}
                                Err(FrameError::Invalid(e)) => {
                                    warn!("Client {} sent an invalid frame: {}", client_id, e);
                                    let reply = Broadcast::Error {
                                        message: format!("invalid frame: {}", e),
                                    };
                                    if send(&mut write_half, reply).await.is_err() {
                                        return;
                                    }
                                }
                                Err(FrameError::TooLarge(len)) => {
                                    warn!(
                                        "Client {} announced a {} byte frame, disconnecting",
                                        client_id, len
                                    );
                                    let reply = Broadcast::Error {
                                        message: format!(
                                            "frame of {} bytes exceeds {} byte limit",
                                            len, MAX_FRAME_LEN
                                        ),
                                    };
                                    let _ = send(&mut write_half, reply).await;
                                    return;
                                }
                            }
                        }
                    }
                    Err(e) => {
                        error!("Read error from client {}: {}", client_id, e);
                        break;
                    }
                }
            }

            msg = broadcast_rx.recv() => {
                let outgoing = match msg {
                    Ok(BroadcastMessage::StateUpdated) => Broadcast::State {
                        data: supervisor.state(),
                    },
                    Ok(BroadcastMessage::ChannelUpdated(status)) => Broadcast::Channel { status },
                    Ok(BroadcastMessage::LiveChanged(entries)) => Broadcast::Live { entries },
                    Ok(BroadcastMessage::Reconciled(report)) => Broadcast::Reconcile { report },
                    Ok(BroadcastMessage::Log(message)) => Broadcast::Log { message },
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        warn!("Client {} missed {} broadcast messages", client_id, n);
                        Broadcast::State { data: supervisor.state() }
                    }
                    Err(_) => break,
                };
                if send(&mut write_half, outgoing).await.is_err() {
                    break;
                }
            }
        }
    }
}

/// Run one client command and build the reply frame.
async fn execute(supervisor: &SupervisorHandle, cmd: Command) -> Broadcast {
    let result = match cmd {
        Command::Start { channel_id } => supervisor
            .request_start(channel_id)
            .await
            .map(|status| Broadcast::Channel { status }),
        Command::Stop { channel_id } => supervisor
            .request_stop(channel_id)
            .await
            .map(|status| Broadcast::Channel { status }),
        Command::Reset { channel_id } => supervisor
            .request_reset(channel_id)
            .await
            .map(|status| Broadcast::Channel { status }),
        Command::Status { channel_id } => supervisor
            .get_status(channel_id)
            .await
            .map(|status| Broadcast::Channel { status }),
        Command::ListLive => supervisor
            .list_live()
            .await
            .map(|entries| Broadcast::Live { entries }),
        Command::GetState => Ok(Broadcast::State {
            data: supervisor.state(),
        }),
        Command::Reconcile => supervisor
            .reconcile()
            .await
            .map(|report| Broadcast::Reconcile { report }),
    };

    result.unwrap_or_else(|e| Broadcast::Error {
        message: e.to_string(),
    })
}

async fn send(write_half: &mut OwnedWriteHalf, broadcast: Broadcast) -> anyhow::Result<()> {
    let encoded = Message::Broadcast(broadcast).encode()?;
    write_half.write_all(&encoded).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn raw_frame(body: &[u8]) -> Vec<u8> {
        let mut frame = (body.len() as u32).to_be_bytes().to_vec();
        frame.extend_from_slice(body);
        frame
    }

    #[test]
    fn test_invalid_frame_is_consumed() {
        let mut buf = raw_frame(b"garbage");
        buf.extend(Message::Command(Command::ListLive).encode().unwrap());

        assert!(matches!(take_frame(&mut buf), Err(FrameError::Invalid(_))));
        assert!(matches!(
            take_frame(&mut buf),
            Ok(Some(Message::Command(Command::ListLive)))
        ));
        assert!(buf.is_empty());
        assert!(matches!(take_frame(&mut buf), Ok(None)));
    }

    #[test]
    fn test_partial_frame_waits_for_more() {
        let frame = Message::Command(Command::Start { channel_id: 3 })
            .encode()
            .unwrap();
        let mut buf = frame[..frame.len() - 2].to_vec();
        assert!(matches!(take_frame(&mut buf), Ok(None)));
        assert_eq!(buf.len(), frame.len() - 2);

        buf.extend_from_slice(&frame[frame.len() - 2..]);
        assert!(matches!(
            take_frame(&mut buf),
            Ok(Some(Message::Command(Command::Start { channel_id: 3 })))
        ));
    }

    #[test]
    fn test_oversized_length_header_is_rejected() {
        let mut buf = ((MAX_FRAME_LEN + 1) as u32).to_be_bytes().to_vec();
        assert!(matches!(
            take_frame(&mut buf),
            Err(FrameError::TooLarge(n)) if n == MAX_FRAME_LEN + 1
        ));
    }
}
