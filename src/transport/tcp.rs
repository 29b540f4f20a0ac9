//! TCP transport.
//!
//! Packets are self-framing (header carries the payload length), so the
//! session just moves bytes; the owner runs a streaming decoder over the
//! `Recv` chunks.

use super::{
    CloseReason, Command, QueueBudget, SendQueue, Session, SessionEvent, TransportError,
    TransportKind, EVENT_CHANNEL_DEPTH,
};
use log::{debug, trace};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;

const READ_BUFFER_SIZE: usize = 64 * 1024;

/// Connect to a server and spawn the session task.
pub async fn connect(
    addr: SocketAddr,
    events: mpsc::Sender<SessionEvent>,
    budget: QueueBudget,
) -> Result<Session, TransportError> {
    let stream = TcpStream::connect(addr).await?;
    stream.set_nodelay(true)?;
    debug!("tcp session connected to {}", addr);
    Ok(spawn(stream, events, budget))
}

/// Wrap an accepted stream (server side) in a session.
pub fn accepted(
    stream: TcpStream,
    events: mpsc::Sender<SessionEvent>,
    budget: QueueBudget,
) -> Session {
    let _ = stream.set_nodelay(true);
    spawn(stream, events, budget)
}

fn spawn(stream: TcpStream, events: mpsc::Sender<SessionEvent>, budget: QueueBudget) -> Session {
    let queue = Arc::new(SendQueue::new(budget.budget, budget.high_water, budget.low_water));
    let (command_tx, command_rx) = mpsc::unbounded_channel();
    let session = Session::new(TransportKind::Tcp, queue.clone(), command_tx);

    tokio::spawn(run(stream, queue, command_rx, events));
    session
}

/// Single event-loop task per session: drains the queue, reads the
/// socket, listens for a close command. All owner callbacks fire from
/// here, in order.
async fn run(
    stream: TcpStream,
    queue: Arc<SendQueue>,
    mut commands: mpsc::UnboundedReceiver<Command>,
    events: mpsc::Sender<SessionEvent>,
) {
    if events.send(SessionEvent::Open).await.is_err() {
        return;
    }

    let (mut reader, mut writer) = stream.into_split();
    let mut buf = vec![0u8; READ_BUFFER_SIZE];

    let reason = loop {
        tokio::select! {
            command = commands.recv() => {
                match command {
                    Some(Command::Close(reason)) => {
                        // Close always shuts the queue first; flush what
                        // was queued ahead of it (e.g. a final reject).
                        while let Some((chunk, _)) = queue.pop().await {
                            if writer.write_all(&chunk).await.is_err() {
                                break;
                            }
                        }
                        break reason;
                    }
                    // Owner dropped every handle; treat as a local close.
                    None => break CloseReason::PeerClosed,
                }
            }
            popped = queue.pop() => {
                let Some((chunk, writable)) = popped else {
                    // A local close shuts the queue; prefer its reason if
                    // one is already waiting in the inbox.
                    break match commands.try_recv() {
                        Ok(Command::Close(reason)) => reason,
                        _ => CloseReason::PeerClosed,
                    };
                };
                if let Err(err) = writer.write_all(&chunk).await {
                    debug!("tcp write failed: {}", err);
                    break CloseReason::IoError;
                }
                trace!("tcp wrote {} bytes", chunk.len());
                if writable && events.send(SessionEvent::Writable).await.is_err() {
                    return;
                }
            }
            read = reader.read(&mut buf) => {
                match read {
                    Ok(0) => break CloseReason::PeerClosed,
                    Ok(n) => {
                        // A full event channel pauses this loop: that is
                        // the receive-side flow control.
                        if events
                            .send(SessionEvent::Recv(bytes::Bytes::copy_from_slice(&buf[..n])))
                            .await
                            .is_err()
                        {
                            return;
                        }
                    }
                    Err(err) => {
                        debug!("tcp read failed: {}", err);
                        break CloseReason::IoError;
                    }
                }
            }
        }
    };

    let _ = writer.shutdown().await;
    let _ = events.send(SessionEvent::Closed(reason)).await;
}

/// Event channel sized for one session.
pub fn event_channel() -> (mpsc::Sender<SessionEvent>, mpsc::Receiver<SessionEvent>) {
    mpsc::channel(EVENT_CHANNEL_DEPTH)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::SendOutcome;
    use bytes::Bytes;
    use tokio::net::TcpListener;

    async fn pair() -> (Session, mpsc::Receiver<SessionEvent>, Session, mpsc::Receiver<SessionEvent>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let budget = QueueBudget { budget: 1 << 20, high_water: 768 << 10, low_water: 512 << 10 };

        let (client_tx, client_rx) = event_channel();
        let connect = tokio::spawn(async move { connect(addr, client_tx, budget).await });

        let (stream, _) = listener.accept().await.unwrap();
        let (server_tx, server_rx) = event_channel();
        let server = accepted(stream, server_tx, budget);
        let client = connect.await.unwrap().unwrap();

        (client, client_rx, server, server_rx)
    }

    async fn expect_open(rx: &mut mpsc::Receiver<SessionEvent>) {
        match rx.recv().await {
            Some(SessionEvent::Open) => {}
            other => panic!("expected Open, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn bytes_flow_both_ways() {
        let (client, mut client_rx, server, mut server_rx) = pair().await;
        expect_open(&mut client_rx).await;
        expect_open(&mut server_rx).await;

        assert_eq!(client.send(Bytes::from_static(b"ping")), SendOutcome::Sent);
        match server_rx.recv().await {
            Some(SessionEvent::Recv(data)) => assert_eq!(&data[..], b"ping"),
            other => panic!("expected Recv, got {:?}", other),
        }

        assert_eq!(server.send(Bytes::from_static(b"pong")), SendOutcome::Sent);
        match client_rx.recv().await {
            Some(SessionEvent::Recv(data)) => assert_eq!(&data[..], b"pong"),
            other => panic!("expected Recv, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn close_reports_reason_locally_and_peer_sees_eof() {
        let (client, mut client_rx, _server, mut server_rx) = pair().await;
        expect_open(&mut client_rx).await;
        expect_open(&mut server_rx).await;

        client.close(CloseReason::ProtocolViolation);
        match client_rx.recv().await {
            Some(SessionEvent::Closed(CloseReason::ProtocolViolation)) => {}
            other => panic!("expected Closed(protocol violation), got {:?}", other),
        }
        match server_rx.recv().await {
            Some(SessionEvent::Closed(CloseReason::PeerClosed)) => {}
            other => panic!("expected Closed(peer closed), got {:?}", other),
        }
    }
}
