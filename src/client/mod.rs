//! Client session
//!
//! Connects to a server by direct address or session string, runs the
//! handshake, then pumps capture frames up and rendered grids down.
//!
//! ```text
//! DISCONNECTED -> RESOLVING -> HANDSHAKING -> AUTHENTICATED -> STREAMING
//!        ^                                                        |
//!        +----------------- backoff <---------- CLOSED <---------+
//! ```
//!
//! Terminal rendering and keyboard input stay outside; the driver emits
//! `ClientEvent`s and accepts `ClientCommand`s over channels.

pub mod source;

use crate::config::Options;
use crate::crypto::cipher::{open_packet, seal_packet, OpeningStream, SealingStream};
use crate::crypto::handshake::Initiator;
use crate::crypto::{Identity, TrustDecision, TrustPolicy, TrustStore};
use crate::discovery::{DiscoveryClient, DiscoveryError, SessionInfo};
use crate::media::{AudioFrame, VideoFrame};
use crate::protocol::control::{RejectReason, SessionReject, StreamCapabilities};
use crate::protocol::fragment::fragment;
use crate::protocol::{Packet, PacketDecoder, PacketKind, Reassembler};
use crate::transport::{
    self, CloseReason, Endpoint, QueueBudget, Role, SendOutcome, Session, SessionEvent,
};
use bytes::Bytes;
use ed25519_dalek::VerifyingKey;
use log::{debug, info, warn};
use source::{CaptureHandle, CaptureItem};
use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{interval, timeout, Instant};

/// Pending outbound frames kept per kind before drop-oldest kicks in.
const PENDING_FRAMES_CAP: usize = 4;

/// Relay poll cadence during WebRTC negotiation.
#[cfg(feature = "webrtc-transport")]
const RELAY_POLL_PERIOD: Duration = Duration::from_millis(500);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientState {
    Disconnected,
    Resolving,
    Handshaking,
    Authenticated,
    Streaming,
    Closed,
}

/// What to connect to.
#[derive(Debug, Clone)]
pub enum Target {
    Tcp(SocketAddr),
    WebSocket(String),
    /// Resolve through the discovery service.
    SessionString { session_string: String, discovery_url: String },
}

pub struct ClientConfig {
    pub identity: Identity,
    pub password: Option<String>,
    pub trust: Arc<TrustStore>,
    pub trust_policy: TrustPolicy,
    pub capabilities: StreamCapabilities,
    pub options: Options,
    /// Pinned discovery service key, when resolving session strings.
    pub discovery_key: Option<VerifyingKey>,
}

/// Events surfaced to the front-end (renderer / UI).
#[derive(Debug)]
pub enum ClientEvent {
    State(ClientState),
    Accepted { client_id: u32 },
    /// Rendered grid to draw.
    Frame(VideoFrame),
    Audio(AudioFrame),
    Rejected(RejectReason),
    /// Unrecoverable; the driver has stopped.
    Fatal(String),
}

#[derive(Debug, Clone)]
pub enum ClientCommand {
    TerminalSize(u16, u16),
    MuteAudio(bool),
    MuteVideo(bool),
    Quit,
}

pub struct ClientHandle {
    pub events: mpsc::Receiver<ClientEvent>,
    commands: mpsc::UnboundedSender<ClientCommand>,
}

impl ClientHandle {
    pub fn command(&self, command: ClientCommand) {
        let _ = self.commands.send(command);
    }

    pub async fn next_event(&mut self) -> Option<ClientEvent> {
        self.events.recv().await
    }
}

/// Spawn the driver task. Capture sources are optional; a client without
/// them is view-only.
pub fn spawn(
    target: Target,
    config: ClientConfig,
    video: Option<Box<dyn source::FrameSource>>,
    audio: Option<Box<dyn source::AudioSource>>,
) -> ClientHandle {
    let (event_tx, event_rx) = mpsc::channel(64);
    let (command_tx, command_rx) = mpsc::unbounded_channel();
    tokio::spawn(drive(target, config, video, audio, command_rx, event_tx));
    ClientHandle { events: event_rx, commands: command_tx }
}

/// Clonable endpoint descriptor; converted to a transport `Endpoint` per
/// attempt.
#[derive(Clone)]
enum EndpointSpec {
    Tcp(SocketAddr),
    Ws(String),
    #[cfg(feature = "webrtc-transport")]
    Rtc {
        session_string: String,
        discovery_url: String,
        session: SessionInfo,
    },
}

impl EndpointSpec {
    /// Endpoint identity used as the trust-store key.
    fn trust_key(&self) -> String {
        match self {
            EndpointSpec::Tcp(addr) => addr.to_string(),
            EndpointSpec::Ws(url) => url.clone(),
            #[cfg(feature = "webrtc-transport")]
            EndpointSpec::Rtc { session_string, .. } => {
                format!("session:{}", session_string)
            }
        }
    }
}

enum RunEnd {
    /// User asked to leave; do not reconnect.
    Quit,
    /// Server said no; reconnecting will not help.
    Rejected(RejectReason),
    /// Trust or auth failure; surfaced prominently, no retry.
    Fatal(String),
    /// Transport lost; retry with backoff.
    Lost,
}

async fn drive(
    target: Target,
    config: ClientConfig,
    video: Option<Box<dyn source::FrameSource>>,
    audio: Option<Box<dyn source::AudioSource>>,
    mut commands: mpsc::UnboundedReceiver<ClientCommand>,
    events: mpsc::Sender<ClientEvent>,
) {
    let mut backoff = Duration::from_millis(250);
    let backoff_cap = config.options.timeouts.reconnect_cap();

    // Capture outlives individual connections; frames produced during a
    // reconnect window sit in the channel and flush on the next session.
    let (capture_tx, mut capture_rx) = mpsc::channel(16);
    let mut capture: Option<CaptureHandle> = if video.is_some() || audio.is_some() {
        Some(source::spawn_capture(
            video,
            audio,
            config.options.rates.target_fps,
            config.options.rates.audio_sample_rate,
            config.options.rates.audio_window,
            capture_tx,
        ))
    } else {
        None
    };
    let has_capture = capture.is_some();

    loop {
        let _ = events.send(ClientEvent::State(ClientState::Resolving)).await;
        let specs = match resolve(&target, &config).await {
            Ok(specs) => specs,
            Err(err) => {
                let _ = events
                    .send(ClientEvent::Fatal(format!("resolution failed: {}", err)))
                    .await;
                let _ = events.send(ClientEvent::State(ClientState::Closed)).await;
                return;
            }
        };

        let mut outcome = RunEnd::Lost;
        for spec in specs {
            match run_once(
                &spec,
                &config,
                has_capture,
                &mut capture_rx,
                &mut commands,
                &events,
            )
            .await
            {
                RunEnd::Lost => {
                    outcome = RunEnd::Lost;
                    continue;
                }
                other => {
                    outcome = other;
                    break;
                }
            }
        }

        let finished = !matches!(outcome, RunEnd::Lost);
        match outcome {
            RunEnd::Quit => {
                let _ = events.send(ClientEvent::State(ClientState::Closed)).await;
            }
            RunEnd::Rejected(reason) => {
                let _ = events.send(ClientEvent::Rejected(reason)).await;
                let _ = events.send(ClientEvent::State(ClientState::Closed)).await;
            }
            RunEnd::Fatal(message) => {
                let _ = events.send(ClientEvent::Fatal(message)).await;
                let _ = events.send(ClientEvent::State(ClientState::Closed)).await;
            }
            RunEnd::Lost => {
                let _ = events.send(ClientEvent::State(ClientState::Disconnected)).await;
                debug!("reconnecting in {:?}", backoff);
                tokio::time::sleep(backoff).await;
                backoff = (backoff * 2).min(backoff_cap);
            }
        }
        if finished {
            if let Some(mut handle) = capture.take() {
                handle.stop();
            }
            return;
        }
    }
}

/// Turn the target into an ordered endpoint list: direct TCP first, then
/// WebSocket, then WebRTC.
async fn resolve(target: &Target, config: &ClientConfig) -> Result<Vec<EndpointSpec>, DiscoveryError> {
    match target {
        Target::Tcp(addr) => Ok(vec![EndpointSpec::Tcp(*addr)]),
        Target::WebSocket(url) => Ok(vec![EndpointSpec::Ws(url.clone())]),
        Target::SessionString { session_string, discovery_url } => {
            let lookup_timeout = config.options.timeouts.discovery_lookup();
            let url = discovery_url.clone();
            let string = session_string.clone();
            let key = config.discovery_key;
            let session = tokio::task::spawn_blocking(move || {
                DiscoveryClient::new(&url, lookup_timeout, key).lookup(&string)
            })
            .await
            .map_err(|_| DiscoveryError::Unreachable("lookup task failed".into()))??;

            let mut specs = Vec::new();
            for endpoint in &session.endpoints {
                match endpoint.kind.as_str() {
                    "tcp" => {
                        if let Ok(addr) = endpoint.addr.parse() {
                            specs.push(EndpointSpec::Tcp(addr));
                        }
                    }
                    "ws" => specs.push(EndpointSpec::Ws(endpoint.addr.clone())),
                    other => debug!("ignoring unknown endpoint kind {}", other),
                }
            }
            #[cfg(feature = "webrtc-transport")]
            specs.push(EndpointSpec::Rtc {
                session_string: session.session_string.clone(),
                discovery_url: discovery_url.clone(),
                session,
            });
            Ok(specs)
        }
    }
}

/// Everything one live connection needs to send sealed packets.
struct Io {
    session: Session,
    seal: SealingStream,
    open: OpeningStream,
    client_id: u32,
    seq: u32,
    message_id: u64,
    mtu: usize,
}

impl Io {
    fn next_seq(&mut self) -> u32 {
        let seq = self.seq;
        self.seq = self.seq.wrapping_add(1);
        seq
    }

    /// Seal and enqueue one message, fragmenting above the MTU. Reports
    /// `WouldBlock` without sending anything further.
    fn send_sealed(&mut self, kind: PacketKind, payload: &[u8]) -> SendOutcome {
        self.message_id += 1;
        let seq = self.next_seq();
        let packets = fragment(self.message_id, kind, self.client_id, seq, payload, self.mtu);
        for packet in &packets {
            let wire = seal_packet(&mut self.seal, packet);
            match self.session.send(Bytes::from(wire.encode())) {
                SendOutcome::Sent => {}
                // A half-sent fragment train is abandoned; the server's
                // reassembly timeout cleans it up.
                other => return other,
            }
        }
        SendOutcome::Sent
    }
}

/// Outbound media staging with drop-oldest-per-kind backpressure.
#[derive(Default)]
struct PendingMedia {
    video: VecDeque<Bytes>,
    audio: VecDeque<Bytes>,
}

impl PendingMedia {
    fn push(&mut self, kind: PacketKind, payload: Bytes) {
        let queue = match kind {
            PacketKind::ImageFrame => &mut self.video,
            PacketKind::AudioFrame => &mut self.audio,
            _ => return,
        };
        if queue.len() == PENDING_FRAMES_CAP {
            queue.pop_front();
        }
        queue.push_back(payload);
    }

    /// Send whatever fits. On `WouldBlock` the oldest pending frame of
    /// that kind is dropped and flushing stops until `Writable`.
    fn flush(&mut self, io: &mut Io) {
        for (kind, queue) in [
            (PacketKind::AudioFrame, &mut self.audio),
            (PacketKind::ImageFrame, &mut self.video),
        ] {
            while let Some(head) = queue.front() {
                match io.send_sealed(kind, head) {
                    SendOutcome::Sent => {
                        queue.pop_front();
                    }
                    SendOutcome::WouldBlock => {
                        queue.pop_front();
                        return;
                    }
                    SendOutcome::Closed => return,
                }
            }
        }
    }
}

async fn run_once(
    spec: &EndpointSpec,
    config: &ClientConfig,
    has_capture: bool,
    capture_rx: &mut mpsc::Receiver<CaptureItem>,
    commands: &mut mpsc::UnboundedReceiver<ClientCommand>,
    events_out: &mpsc::Sender<ClientEvent>,
) -> RunEnd {
    let budget = QueueBudget::from_sizes(&config.options.sizes);
    let (transport_tx, mut transport_rx) = mpsc::channel(transport::EVENT_CHANNEL_DEPTH);

    let endpoint = match build_endpoint(spec, config) {
        Ok(endpoint) => endpoint,
        Err(message) => {
            debug!("endpoint unavailable: {}", message);
            return RunEnd::Lost;
        }
    };

    let session = match transport::open(endpoint, Role::Initiator, transport_tx, budget).await {
        Ok(session) => session,
        Err(err) => {
            info!("connect failed: {}", err);
            return RunEnd::Lost;
        }
    };

    let _ = events_out.send(ClientEvent::State(ClientState::Handshaking)).await;
    let handshake_deadline = config.options.timeouts.handshake();
    let mut decoder = PacketDecoder::new();

    let handshake = timeout(
        handshake_deadline,
        handshake_as_initiator(&session, &mut transport_rx, &mut decoder, spec, config),
    )
    .await;

    let (mut io, client_id) = match handshake {
        Ok(Ok(done)) => done,
        Ok(Err(end)) => {
            session.close(CloseReason::HandshakeFailed);
            return end;
        }
        Err(_elapsed) => {
            info!("handshake timed out");
            session.close(CloseReason::Timeout);
            return RunEnd::Lost;
        }
    };

    let _ = events_out.send(ClientEvent::State(ClientState::Authenticated)).await;
    let _ = events_out.send(ClientEvent::Accepted { client_id }).await;

    // Announce capabilities and enter the streaming loop.
    let caps = serde_json::to_vec(&config.capabilities).expect("capabilities serialize");
    if io.send_sealed(PacketKind::StreamStart, &caps) == SendOutcome::Closed {
        return RunEnd::Lost;
    }
    let _ = events_out.send(ClientEvent::State(ClientState::Streaming)).await;

    let mut pending = PendingMedia::default();
    let mut capture_live = has_capture;
    let mut reassembler = Reassembler::new(
        config.options.timeouts.fragment_reassembly(),
        config.options.sizes.reassembly_cap,
    );
    let mut heartbeat = interval(config.options.timeouts.heartbeat_interval());
    let heartbeat_timeout = config.options.timeouts.heartbeat_timeout();
    let mut last_heard = Instant::now();

    let end = loop {
        tokio::select! {
            event = transport_rx.recv() => {
                match event {
                    Some(SessionEvent::Recv(data)) => {
                        last_heard = Instant::now();
                        decoder.extend(&data);
                        match drain_packets(&mut decoder, &mut io, &mut reassembler, events_out).await {
                            Ok(None) => {}
                            Ok(Some(end)) => break end,
                            Err(()) => {
                                io.session.close(CloseReason::ProtocolViolation);
                                break RunEnd::Lost;
                            }
                        }
                    }
                    Some(SessionEvent::Writable) => pending.flush(&mut io),
                    Some(SessionEvent::Open) => {}
                    Some(SessionEvent::Closed(reason)) => {
                        info!("transport closed: {}", reason);
                        break RunEnd::Lost;
                    }
                    None => break RunEnd::Lost,
                }
            }
            item = capture_rx.recv(), if capture_live => {
                match item {
                    Some(CaptureItem::Video(frame)) => {
                        pending.push(PacketKind::ImageFrame, frame.encode());
                        pending.flush(&mut io);
                    }
                    Some(CaptureItem::Audio(frame)) => {
                        pending.push(PacketKind::AudioFrame, frame.encode());
                        pending.flush(&mut io);
                    }
                    // Sources ended; carry on view-only.
                    None => capture_live = false,
                }
            }
            command = commands.recv() => {
                match command {
                    Some(ClientCommand::TerminalSize(cols, rows)) => {
                        let payload = crate::protocol::control::encode_terminal_size(cols, rows);
                        let _ = io.send_sealed(PacketKind::TerminalSize, &payload);
                    }
                    Some(ClientCommand::MuteAudio(muted)) => {
                        let body = serde_json::to_vec(
                            &crate::protocol::control::ControlMessage::MuteAudio { muted },
                        ).expect("control serializes");
                        let _ = io.send_sealed(PacketKind::Control, &body);
                    }
                    Some(ClientCommand::MuteVideo(muted)) => {
                        let body = serde_json::to_vec(
                            &crate::protocol::control::ControlMessage::MuteVideo { muted },
                        ).expect("control serializes");
                        let _ = io.send_sealed(PacketKind::Control, &body);
                    }
                    Some(ClientCommand::Quit) | None => {
                        let _ = io.send_sealed(PacketKind::Goodbye, &[]);
                        io.session.close(CloseReason::PeerClosed);
                        break RunEnd::Quit;
                    }
                }
            }
            _ = heartbeat.tick() => {
                if last_heard.elapsed() > heartbeat_timeout {
                    warn!("server silent for {:?}; dropping connection", last_heard.elapsed());
                    io.session.close(CloseReason::Timeout);
                    break RunEnd::Lost;
                }
                let _ = io.send_sealed(PacketKind::Heartbeat, &[]);
            }
        }
    };

    end
}

fn build_endpoint(spec: &EndpointSpec, config: &ClientConfig) -> Result<Endpoint, String> {
    let _ = config;
    match spec {
        EndpointSpec::Tcp(addr) => Ok(Endpoint::Tcp(*addr)),
        EndpointSpec::Ws(url) => Ok(Endpoint::WebSocket(url.clone())),
        #[cfg(feature = "webrtc-transport")]
        EndpointSpec::Rtc { session_string, discovery_url, session } => {
            Ok(Endpoint::WebRtc(relay_backed_rtc_endpoint(
                session_string,
                discovery_url,
                session,
                config,
            )))
        }
    }
}

/// Bridge the transport's in-memory signaling channels onto the
/// discovery relay: local signals go up as relay posts addressed to the
/// server, remote ones come down from polling our own mailbox.
#[cfg(feature = "webrtc-transport")]
fn relay_backed_rtc_endpoint(
    session_string: &str,
    discovery_url: &str,
    session: &SessionInfo,
    config: &ClientConfig,
) -> crate::transport::webrtc::RtcEndpoint {
    use crate::discovery::RelayRequest;
    use crate::transport::webrtc::{IceServer, RtcEndpoint, RtcSignal};

    let peer_id = uuid::Uuid::new_v4().to_string();
    let lookup_timeout = config.options.timeouts.discovery_lookup();
    let client = Arc::new(DiscoveryClient::new(discovery_url, lookup_timeout, None));

    let mut ice_servers: Vec<IceServer> = session
        .stun_servers
        .iter()
        .map(|url| IceServer { urls: vec![url.clone()], username: None, credential: None })
        .collect();
    if let Some(ref turn) = session.turn_credential {
        ice_servers.push(IceServer {
            urls: turn.urls.clone(),
            username: Some(turn.username.clone()),
            credential: Some(turn.credential.clone()),
        });
    }

    let (local_tx, mut local_rx) = mpsc::unbounded_channel::<RtcSignal>();
    let (remote_tx, remote_rx) = mpsc::unbounded_channel::<RtcSignal>();

    // Outgoing: local SDP/candidates -> relay, addressed to the server.
    let outgoing_client = client.clone();
    let outgoing_session = session_string.to_string();
    let outgoing_peer = peer_id.clone();
    tokio::spawn(async move {
        while let Some(signal) = local_rx.recv().await {
            let (kind, body) = match signal {
                RtcSignal::Sdp(sdp) => ("sdp", sdp),
                RtcSignal::Candidate(candidate) => ("ice", candidate),
            };
            let request = RelayRequest {
                from: outgoing_peer.clone(),
                to: "server".to_string(),
                kind: kind.to_string(),
                body,
            };
            let client = outgoing_client.clone();
            let session = outgoing_session.clone();
            let result = tokio::task::spawn_blocking(move || {
                client.relay_send(&session, &request)
            })
            .await;
            if !matches!(result, Ok(Ok(()))) {
                warn!("relay send failed; abandoning signaling");
                return;
            }
        }
    });

    // Incoming: poll our mailbox until the channel consumer goes away.
    let polling_session = session_string.to_string();
    tokio::spawn(async move {
        loop {
            tokio::time::sleep(RELAY_POLL_PERIOD).await;
            let client = client.clone();
            let session = polling_session.clone();
            let to = peer_id.clone();
            let items = tokio::task::spawn_blocking(move || client.relay_poll(&session, &to)).await;
            let items = match items {
                Ok(Ok(items)) => items,
                _ => return,
            };
            for item in items {
                let signal = match item.kind.as_str() {
                    "sdp" => RtcSignal::Sdp(item.body),
                    "ice" => RtcSignal::Candidate(item.body),
                    _ => continue,
                };
                if remote_tx.send(signal).is_err() {
                    return;
                }
            }
        }
    });

    RtcEndpoint { ice_servers, signal_tx: local_tx, signal_rx: remote_rx }
}

/// Run the initiator handshake over an open transport. Returns the
/// sealed IO state and our assigned client id.
async fn handshake_as_initiator(
    session: &Session,
    events: &mut mpsc::Receiver<SessionEvent>,
    decoder: &mut PacketDecoder,
    spec: &EndpointSpec,
    config: &ClientConfig,
) -> Result<(Io, u32), RunEnd> {
    let (initiator, hello) = Initiator::start(&config.identity, 0, config.password.as_deref());
    let hello_packet = Packet::new(PacketKind::Hello, 0, 0, hello);
    if session.send(Bytes::from(hello_packet.encode())) != SendOutcome::Sent {
        return Err(RunEnd::Lost);
    }

    let challenge = match next_plain_packet(events, decoder).await? {
        packet if packet.kind == PacketKind::AuthChallenge => packet,
        packet if packet.kind == PacketKind::SessionReject => {
            return Err(reject_end(&packet));
        }
        packet => {
            debug!("unexpected {} during handshake", packet.kind);
            return Err(RunEnd::Lost);
        }
    };

    let outcome = initiator
        .finish(&config.identity, &challenge.payload)
        .map_err(|err| RunEnd::Fatal(format!("handshake failed: {}", err)))?;

    // Trust gate before anything is sent under the new keys.
    let trust_key = spec.trust_key();
    match config.trust.check(&trust_key, outcome.peer_fingerprint) {
        TrustDecision::Trusted => {}
        TrustDecision::Unknown(fingerprint) => match config.trust_policy {
            TrustPolicy::AcceptOnce => {
                info!("pinning new host identity {} for {}", fingerprint, trust_key);
                if let Err(err) = config.trust.pin(&trust_key, fingerprint) {
                    warn!("failed to persist trust pin: {}", err);
                }
            }
            TrustPolicy::Prompt | TrustPolicy::Refuse => {
                return Err(RunEnd::Fatal(format!(
                    "unknown host identity {} for {} (set trust policy to accept-once to pin)",
                    fingerprint, trust_key
                )));
            }
        },
        TrustDecision::Mismatch { pinned, presented } => {
            return Err(RunEnd::Fatal(format!(
                "HOST IDENTITY MISMATCH for {}: pinned {} but server presented {}",
                trust_key, pinned, presented
            )));
        }
    }

    let response = Packet::new(PacketKind::AuthResponse, 0, 1, outcome.response_payload);
    if session.send(Bytes::from(response.encode())) != SendOutcome::Sent {
        return Err(RunEnd::Lost);
    }

    let mut open = outcome.keys.recv;
    let accept = match next_plain_packet(events, decoder).await? {
        packet if packet.kind == PacketKind::SessionAccept => {
            open_packet(&mut open, &packet).map_err(|err| {
                RunEnd::Fatal(format!("session accept failed authentication: {}", err))
            })?
        }
        packet if packet.kind == PacketKind::SessionReject => {
            return Err(reject_end(&packet));
        }
        packet => {
            debug!("unexpected {} after auth response", packet.kind);
            return Err(RunEnd::Lost);
        }
    };

    if accept.payload.len() != 4 {
        return Err(RunEnd::Lost);
    }
    let client_id = u32::from_le_bytes(accept.payload[..].try_into().unwrap());

    Ok((
        Io {
            session: session.clone(),
            seal: outcome.keys.send,
            open,
            client_id,
            seq: 0,
            message_id: 0,
            mtu: config.options.sizes.mtu,
        },
        client_id,
    ))
}

fn reject_end(packet: &Packet) -> RunEnd {
    match serde_json::from_slice::<SessionReject>(&packet.payload) {
        Ok(reject) => RunEnd::Rejected(reject.reason),
        Err(_) => RunEnd::Lost,
    }
}

/// Next wire packet during the handshake (everything still plaintext).
async fn next_plain_packet(
    events: &mut mpsc::Receiver<SessionEvent>,
    decoder: &mut PacketDecoder,
) -> Result<Packet, RunEnd> {
    loop {
        match decoder.next_packet() {
            Ok(Some(packet)) => return Ok(packet),
            Ok(None) => {}
            Err(err) => {
                debug!("wire error during handshake: {}", err);
                return Err(RunEnd::Lost);
            }
        }
        match events.recv().await {
            Some(SessionEvent::Recv(data)) => decoder.extend(&data),
            Some(SessionEvent::Open) | Some(SessionEvent::Writable) => {}
            Some(SessionEvent::Closed(_)) | None => return Err(RunEnd::Lost),
        }
    }
}

/// Decode, decrypt, and dispatch every complete packet in the buffer.
/// `Ok(Some(end))` ends the session gracefully; `Err(())` is a protocol
/// violation.
async fn drain_packets(
    decoder: &mut PacketDecoder,
    io: &mut Io,
    reassembler: &mut Reassembler,
    events_out: &mpsc::Sender<ClientEvent>,
) -> Result<Option<RunEnd>, ()> {
    loop {
        let wire = match decoder.next_packet() {
            Ok(Some(packet)) => packet,
            Ok(None) => return Ok(None),
            Err(err) => {
                warn!("wire error: {}", err);
                return Err(());
            }
        };

        // Rejects are the one post-handshake packet sent in the clear.
        if wire.kind == PacketKind::SessionReject {
            return Ok(Some(reject_end(&wire)));
        }

        let packet = match open_packet(&mut io.open, &wire) {
            Ok(packet) => packet,
            Err(err) => {
                warn!("packet failed authentication: {}", err);
                return Err(());
            }
        };

        let (kind, payload) = if packet.fragmented {
            match reassembler.ingest(&packet) {
                Ok(Some((kind, payload))) => (kind, payload),
                Ok(None) => continue,
                Err(err) => {
                    debug!("reassembly: {}", err);
                    continue;
                }
            }
        } else {
            (packet.kind, packet.payload)
        };

        match kind {
            PacketKind::ImageFrame => match VideoFrame::decode(&payload) {
                Ok(frame) => {
                    let _ = events_out.send(ClientEvent::Frame(frame)).await;
                }
                Err(err) => debug!("bad inbound frame: {}", err),
            },
            PacketKind::AudioFrame => match AudioFrame::decode(&payload) {
                Ok(frame) => {
                    let _ = events_out.send(ClientEvent::Audio(frame)).await;
                }
                Err(err) => debug!("bad inbound audio: {}", err),
            },
            PacketKind::Heartbeat => {}
            PacketKind::Goodbye => return Ok(Some(RunEnd::Lost)),
            other => debug!("ignoring {} from server", other),
        }
    }
}
