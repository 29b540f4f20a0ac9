//! WebRTC data-channel transport.
//!
//! ICE servers come from the discovery service; SDP and candidates flow
//! through its relay, carried here as an in-memory signaling channel
//! pair. The data channel is ordered and reliable, labelled
//! `ascii-chat`.

use super::{
    CloseReason, Command, QueueBudget, Role, SendQueue, Session, SessionEvent, TransportError,
    TransportKind,
};
use log::{debug, warn};
use std::sync::Arc;
use tokio::sync::mpsc;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::APIBuilder;
use webrtc::data_channel::data_channel_init::RTCDataChannelInit;
use webrtc::data_channel::RTCDataChannel;
use webrtc::ice_transport::ice_candidate::RTCIceCandidateInit;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;

/// Label both sides expect on the session data channel.
pub const DATA_CHANNEL_LABEL: &str = "ascii-chat";

/// STUN/TURN server handed out by the discovery service.
#[derive(Debug, Clone)]
pub struct IceServer {
    pub urls: Vec<String>,
    pub username: Option<String>,
    pub credential: Option<String>,
}

/// SDP / candidate messages relayed through discovery.
#[derive(Debug, Clone)]
pub enum RtcSignal {
    Sdp(String),
    Candidate(String),
}

/// Everything needed to negotiate one peer connection.
pub struct RtcEndpoint {
    pub ice_servers: Vec<IceServer>,
    /// Local SDP / candidates for the relay to carry to the peer.
    pub signal_tx: mpsc::UnboundedSender<RtcSignal>,
    /// Remote SDP / candidates arriving from the relay.
    pub signal_rx: mpsc::UnboundedReceiver<RtcSignal>,
}

/// Negotiate a peer connection and wrap its data channel in a session.
pub async fn open(
    endpoint: RtcEndpoint,
    role: Role,
    events: mpsc::Sender<SessionEvent>,
    budget: QueueBudget,
) -> Result<Session, TransportError> {
    let peer = build_peer_connection(&endpoint.ice_servers).await?;

    let queue = Arc::new(SendQueue::new(budget.budget, budget.high_water, budget.low_water));
    let (command_tx, command_rx) = mpsc::unbounded_channel();
    let session = Session::new(TransportKind::WebRtc, queue.clone(), command_tx);

    // Trickle local candidates out through the relay.
    let signal_tx = endpoint.signal_tx.clone();
    peer.on_ice_candidate(Box::new(move |candidate| {
        let signal_tx = signal_tx.clone();
        Box::pin(async move {
            if let Some(candidate) = candidate {
                match candidate.to_json() {
                    Ok(init) => {
                        let _ = signal_tx.send(RtcSignal::Candidate(init.candidate));
                    }
                    Err(err) => warn!("failed to serialize ICE candidate: {}", err),
                }
            }
        })
    }));

    let events_for_state = events.clone();
    peer.on_peer_connection_state_change(Box::new(move |state| {
        let events = events_for_state.clone();
        Box::pin(async move {
            if state == RTCPeerConnectionState::Failed {
                let _ = events.try_send(SessionEvent::Closed(CloseReason::IoError));
            }
        })
    }));

    // The opened channel is handed to the drain task once it exists.
    let (channel_tx, channel_rx) = mpsc::unbounded_channel::<Arc<RTCDataChannel>>();

    match role {
        Role::Initiator => {
            let init = RTCDataChannelInit { ordered: Some(true), ..Default::default() };
            let channel = peer
                .create_data_channel(DATA_CHANNEL_LABEL, Some(init))
                .await
                .map_err(|e| TransportError::DataChannelFailed(e.to_string()))?;
            wire_channel(channel, &events, &channel_tx);

            let offer = peer
                .create_offer(None)
                .await
                .map_err(|e| TransportError::DataChannelFailed(e.to_string()))?;
            peer.set_local_description(offer.clone())
                .await
                .map_err(|e| TransportError::DataChannelFailed(e.to_string()))?;
            let _ = endpoint.signal_tx.send(RtcSignal::Sdp(offer.sdp));
        }
        Role::Responder => {
            let events = events.clone();
            let channel_tx = channel_tx.clone();
            peer.on_data_channel(Box::new(move |channel| {
                let events = events.clone();
                let channel_tx = channel_tx.clone();
                Box::pin(async move {
                    if channel.label() == DATA_CHANNEL_LABEL {
                        wire_channel(channel, &events, &channel_tx);
                    } else {
                        debug!("ignoring unexpected data channel {}", channel.label());
                    }
                })
            }));
        }
    }

    tokio::spawn(run(
        peer,
        role,
        endpoint.signal_tx,
        endpoint.signal_rx,
        channel_rx,
        queue,
        command_rx,
        events,
    ));
    Ok(session)
}

async fn build_peer_connection(
    servers: &[IceServer],
) -> Result<Arc<RTCPeerConnection>, TransportError> {
    let mut media_engine = MediaEngine::default();
    let registry = webrtc::api::interceptor_registry::register_default_interceptors(
        Registry::new(),
        &mut media_engine,
    )
    .map_err(|e| TransportError::DataChannelFailed(format!("interceptors: {}", e)))?;

    let api = APIBuilder::new()
        .with_media_engine(media_engine)
        .with_interceptor_registry(registry)
        .build();

    let ice_servers = servers
        .iter()
        .map(|server| RTCIceServer {
            urls: server.urls.clone(),
            username: server.username.clone().unwrap_or_default(),
            credential: server.credential.clone().unwrap_or_default(),
            ..Default::default()
        })
        .collect();

    let config = RTCConfiguration { ice_servers, ..Default::default() };
    let peer = api
        .new_peer_connection(config)
        .await
        .map_err(|e| TransportError::IceGatheringFailed(e.to_string()))?;
    Ok(Arc::new(peer))
}

/// Attach open/message/close callbacks and report the channel to the
/// drain task once it opens.
fn wire_channel(
    channel: Arc<RTCDataChannel>,
    events: &mpsc::Sender<SessionEvent>,
    channel_tx: &mpsc::UnboundedSender<Arc<RTCDataChannel>>,
) {
    let on_open_channel = channel.clone();
    let on_open_tx = channel_tx.clone();
    let open_events = events.clone();
    channel.on_open(Box::new(move || {
        let events = open_events.clone();
        let tx = on_open_tx.clone();
        let channel = on_open_channel.clone();
        Box::pin(async move {
            let _ = events.send(SessionEvent::Open).await;
            let _ = tx.send(channel);
        })
    }));

    let recv_events = events.clone();
    channel.on_message(Box::new(move |message| {
        let events = recv_events.clone();
        Box::pin(async move {
            let _ = events.send(SessionEvent::Recv(message.data)).await;
        })
    }));

    let close_events = events.clone();
    channel.on_close(Box::new(move || {
        let events = close_events.clone();
        Box::pin(async move {
            let _ = events.try_send(SessionEvent::Closed(CloseReason::PeerClosed));
        })
    }));
}

#[allow(clippy::too_many_arguments)]
async fn run(
    peer: Arc<RTCPeerConnection>,
    role: Role,
    signal_tx: mpsc::UnboundedSender<RtcSignal>,
    mut signal_rx: mpsc::UnboundedReceiver<RtcSignal>,
    mut channel_rx: mpsc::UnboundedReceiver<Arc<RTCDataChannel>>,
    queue: Arc<SendQueue>,
    mut commands: mpsc::UnboundedReceiver<Command>,
    events: mpsc::Sender<SessionEvent>,
) {
    let mut channel: Option<Arc<RTCDataChannel>> = None;

    let reason = loop {
        tokio::select! {
            command = commands.recv() => {
                match command {
                    Some(Command::Close(reason)) => {
                        if let Some(ref dc) = channel {
                            // Flush anything queued ahead of the close.
                            while let Some((chunk, _)) = queue.pop().await {
                                if dc.send(&chunk).await.is_err() {
                                    break;
                                }
                            }
                        }
                        break reason;
                    }
                    None => break CloseReason::PeerClosed,
                }
            }
            opened = channel_rx.recv(), if channel.is_none() => {
                channel = opened;
            }
            signal = signal_rx.recv() => {
                let Some(signal) = signal else { break CloseReason::PeerClosed };
                if let Err(err) = apply_signal(&peer, role, &signal_tx, signal).await {
                    debug!("webrtc signaling failed: {}", err);
                    break CloseReason::HandshakeFailed;
                }
            }
            popped = queue.pop(), if channel.is_some() => {
                let Some((chunk, writable)) = popped else {
                    break match commands.try_recv() {
                        Ok(Command::Close(reason)) => reason,
                        _ => CloseReason::PeerClosed,
                    };
                };
                let dc = channel.as_ref().unwrap();
                if let Err(err) = dc.send(&chunk).await {
                    debug!("data channel send failed: {}", err);
                    break CloseReason::IoError;
                }
                if writable && events.send(SessionEvent::Writable).await.is_err() {
                    return;
                }
            }
        }
    };

    let _ = peer.close().await;
    let _ = events.send(SessionEvent::Closed(reason)).await;
}

async fn apply_signal(
    peer: &Arc<RTCPeerConnection>,
    role: Role,
    signal_tx: &mpsc::UnboundedSender<RtcSignal>,
    signal: RtcSignal,
) -> Result<(), TransportError> {
    match signal {
        RtcSignal::Sdp(sdp) => match role {
            Role::Initiator => {
                let answer = RTCSessionDescription::answer(sdp)
                    .map_err(|e| TransportError::DataChannelFailed(e.to_string()))?;
                peer.set_remote_description(answer)
                    .await
                    .map_err(|e| TransportError::DataChannelFailed(e.to_string()))?;
            }
            Role::Responder => {
                let offer = RTCSessionDescription::offer(sdp)
                    .map_err(|e| TransportError::DataChannelFailed(e.to_string()))?;
                peer.set_remote_description(offer)
                    .await
                    .map_err(|e| TransportError::DataChannelFailed(e.to_string()))?;
                let answer = peer
                    .create_answer(None)
                    .await
                    .map_err(|e| TransportError::DataChannelFailed(e.to_string()))?;
                peer.set_local_description(answer.clone())
                    .await
                    .map_err(|e| TransportError::DataChannelFailed(e.to_string()))?;
                let _ = signal_tx.send(RtcSignal::Sdp(answer.sdp));
            }
        },
        RtcSignal::Candidate(candidate) => {
            let init = RTCIceCandidateInit {
                candidate,
                sdp_mid: Some("0".to_string()),
                sdp_mline_index: Some(0),
                username_fragment: None,
            };
            peer.add_ice_candidate(init)
                .await
                .map_err(|e| TransportError::IceGatheringFailed(e.to_string()))?;
        }
    }
    Ok(())
}
