//! WebSocket transport.
//!
//! One protocol packet per binary WebSocket message. The owner still
//! feeds `Recv` chunks through the streaming decoder, so a peer that
//! coalesces packets into one message decodes the same way.

use super::{
    CloseReason, Command, QueueBudget, SendQueue, Session, SessionEvent, TransportError,
    TransportKind,
};
use futures::{SinkExt, StreamExt};
use log::debug;
use std::sync::Arc;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::protocol::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

/// Connect to a `ws://` or `wss://` endpoint and spawn the session task.
pub async fn connect(
    url: &str,
    events: mpsc::Sender<SessionEvent>,
    budget: QueueBudget,
) -> Result<Session, TransportError> {
    let (stream, _response) = tokio_tungstenite::connect_async(url)
        .await
        .map_err(|err| TransportError::DataChannelFailed(format!("ws connect: {}", err)))?;
    debug!("ws session connected to {}", url);
    Ok(spawn(stream, events, budget))
}

/// Wrap an accepted (already-upgraded) server-side stream in a session.
pub fn accepted(
    stream: WebSocketStream<TcpStream>,
    events: mpsc::Sender<SessionEvent>,
    budget: QueueBudget,
) -> Session {
    let queue = Arc::new(SendQueue::new(budget.budget, budget.high_water, budget.low_water));
    let (command_tx, command_rx) = mpsc::unbounded_channel();
    let session = Session::new(TransportKind::WebSocket, queue.clone(), command_tx);
    tokio::spawn(run(stream, queue, command_rx, events));
    session
}

fn spawn(
    stream: WebSocketStream<MaybeTlsStream<TcpStream>>,
    events: mpsc::Sender<SessionEvent>,
    budget: QueueBudget,
) -> Session {
    let queue = Arc::new(SendQueue::new(budget.budget, budget.high_water, budget.low_water));
    let (command_tx, command_rx) = mpsc::unbounded_channel();
    let session = Session::new(TransportKind::WebSocket, queue.clone(), command_tx);
    tokio::spawn(run(stream, queue, command_rx, events));
    session
}

async fn run<S>(
    stream: WebSocketStream<S>,
    queue: Arc<SendQueue>,
    mut commands: mpsc::UnboundedReceiver<Command>,
    events: mpsc::Sender<SessionEvent>,
) where
    S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin,
{
    if events.send(SessionEvent::Open).await.is_err() {
        return;
    }

    let (mut sink, mut source) = stream.split();

    let reason = loop {
        tokio::select! {
            command = commands.recv() => {
                match command {
                    Some(Command::Close(reason)) => {
                        // Flush anything queued ahead of the close.
                        while let Some((chunk, _)) = queue.pop().await {
                            if sink.send(Message::Binary(chunk.to_vec())).await.is_err() {
                                break;
                            }
                        }
                        break reason;
                    }
                    None => break CloseReason::PeerClosed,
                }
            }
            popped = queue.pop() => {
                let Some((chunk, writable)) = popped else {
                    break match commands.try_recv() {
                        Ok(Command::Close(reason)) => reason,
                        _ => CloseReason::PeerClosed,
                    };
                };
                if let Err(err) = sink.send(Message::Binary(chunk.to_vec())).await {
                    debug!("ws send failed: {}", err);
                    break CloseReason::IoError;
                }
                if writable && events.send(SessionEvent::Writable).await.is_err() {
                    return;
                }
            }
            message = source.next() => {
                match message {
                    Some(Ok(Message::Binary(data))) => {
                        if events
                            .send(SessionEvent::Recv(bytes::Bytes::from(data)))
                            .await
                            .is_err()
                        {
                            return;
                        }
                    }
                    Some(Ok(Message::Ping(payload))) => {
                        if sink.send(Message::Pong(payload)).await.is_err() {
                            break CloseReason::IoError;
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => break CloseReason::PeerClosed,
                    Some(Ok(_)) => {} // text / pong / raw frames ignored
                    Some(Err(err)) => {
                        debug!("ws read failed: {}", err);
                        break CloseReason::IoError;
                    }
                }
            }
        }
    };

    let _ = sink.send(Message::Close(None)).await;
    let _ = events.send(SessionEvent::Closed(reason)).await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::{tcp::event_channel, SendOutcome};
    use bytes::Bytes;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn binary_messages_round_trip() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let budget = QueueBudget { budget: 1 << 20, high_water: 768 << 10, low_water: 512 << 10 };

        let accept = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            tokio_tungstenite::accept_async(stream).await.unwrap()
        });

        let (client_tx, mut client_rx) = event_channel();
        let url = format!("ws://{}", addr);
        let client = connect(&url, client_tx, budget).await.unwrap();

        let ws_stream = accept.await.unwrap();
        let (server_tx, mut server_rx) = event_channel();
        let server = accepted(ws_stream, server_tx, budget);

        assert!(matches!(client_rx.recv().await, Some(SessionEvent::Open)));
        assert!(matches!(server_rx.recv().await, Some(SessionEvent::Open)));

        assert_eq!(client.send(Bytes::from_static(b"hello ws")), SendOutcome::Sent);
        match server_rx.recv().await {
            Some(SessionEvent::Recv(data)) => assert_eq!(&data[..], b"hello ws"),
            other => panic!("expected Recv, got {:?}", other),
        }

        assert_eq!(server.send(Bytes::from_static(b"hi back")), SendOutcome::Sent);
        match client_rx.recv().await {
            Some(SessionEvent::Recv(data)) => assert_eq!(&data[..], b"hi back"),
            other => panic!("expected Recv, got {:?}", other),
        }
    }
}
