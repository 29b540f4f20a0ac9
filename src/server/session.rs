//! Server session engine.
//!
//! Accept loops hand each connection to `serve_connection`: responder
//! handshake, registry insertion, then a per-client task tree (inbound
//! dispatch, heartbeat watchdog, video mixer, audio mixer) rooted at the
//! client record's cancel signal. Eviction cancels the tree, closes the
//! transport, and frees the record; other clients' mixers never notice.

use super::client::{ClientRecord, EvictReason, ViewState};
use super::context::ServerContext;
use crate::crypto::cipher::{open_packet, OpeningStream};
use crate::crypto::handshake::{Responder, SessionKeys};
use crate::crypto::{Fingerprint, HandshakeError};
use crate::media::{now_ns, AudioFrame, VideoFrame, VideoFormat};
use crate::mixer::audio::{mix_windows, resample_linear};
use crate::mixer::video::{compose, TileSource, Viewport};
use crate::mixer::ColorMode;
use crate::protocol::control::{
    decode_terminal_size, ControlMessage, RejectReason, SessionReject, StreamCapabilities,
};
use crate::protocol::{Packet, PacketDecoder, PacketKind, Reassembler, ReassemblyError};
use crate::transport::{
    tcp, websocket, CloseReason, QueueBudget, SendOutcome, Session, SessionEvent,
    EVENT_CHANNEL_DEPTH,
};
use bytes::Bytes;
use log::{debug, info, warn};
use std::collections::HashMap;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::time::{interval, timeout, MissedTickBehavior};

/// How fresh a source's latest frame must be to appear in layouts.
const RECENT_FRAME_WINDOW: Duration = Duration::from_secs(2);

/// Watchdog poll period for heartbeat and slow-consumer checks.
const WATCHDOG_PERIOD: Duration = Duration::from_millis(250);

/// Accept raw TCP connections until shutdown.
pub async fn run_tcp_listener(ctx: Arc<ServerContext>, listener: TcpListener) {
    let mut shutdown = ctx.shutdown_signal();
    info!("listening on tcp://{}", listener.local_addr().map(|a| a.to_string()).unwrap_or_default());
    loop {
        tokio::select! {
            _ = shutdown.changed() => return,
            accepted = listener.accept() => {
                match accepted {
                    Ok((stream, addr)) => {
                        debug!("tcp connection from {}", addr);
                        let ctx = ctx.clone();
                        tokio::spawn(async move {
                            let (tx, rx) = mpsc::channel(EVENT_CHANNEL_DEPTH);
                            let budget = QueueBudget::from_sizes(&ctx.options.sizes);
                            let session = tcp::accepted(stream, tx, budget);
                            serve_connection(ctx, session, rx).await;
                        });
                    }
                    Err(err) => {
                        warn!("accept failed: {}", err);
                        tokio::time::sleep(Duration::from_millis(100)).await;
                    }
                }
            }
        }
    }
}

/// Accept WebSocket connections until shutdown.
pub async fn run_ws_listener(ctx: Arc<ServerContext>, listener: TcpListener) {
    let mut shutdown = ctx.shutdown_signal();
    info!("listening on ws://{}", listener.local_addr().map(|a| a.to_string()).unwrap_or_default());
    loop {
        tokio::select! {
            _ = shutdown.changed() => return,
            accepted = listener.accept() => {
                match accepted {
                    Ok((stream, addr)) => {
                        debug!("ws connection from {}", addr);
                        let ctx = ctx.clone();
                        tokio::spawn(async move {
                            let ws = match tokio_tungstenite::accept_async(stream).await {
                                Ok(ws) => ws,
                                Err(err) => {
                                    debug!("ws upgrade from {} failed: {}", addr, err);
                                    return;
                                }
                            };
                            let (tx, rx) = mpsc::channel(EVENT_CHANNEL_DEPTH);
                            let budget = QueueBudget::from_sizes(&ctx.options.sizes);
                            let session = websocket::accepted(ws, tx, budget);
                            serve_connection(ctx, session, rx).await;
                        });
                    }
                    Err(err) => {
                        warn!("accept failed: {}", err);
                        tokio::time::sleep(Duration::from_millis(100)).await;
                    }
                }
            }
        }
    }
}

/// Handshake and serve one client connection to completion.
pub async fn serve_connection(
    ctx: Arc<ServerContext>,
    session: Session,
    mut events: mpsc::Receiver<SessionEvent>,
) {
    let mut decoder = PacketDecoder::new();
    let handshake = timeout(
        ctx.options.timeouts.handshake(),
        handshake_as_responder(&ctx, &session, &mut events, &mut decoder),
    )
    .await;

    let (keys, fingerprint) = match handshake {
        Ok(Ok(done)) => done,
        Ok(Err(())) => return,
        Err(_elapsed) => {
            debug!("handshake timed out");
            session.close(CloseReason::Timeout);
            return;
        }
    };

    if ctx.registry.len() >= ctx.options.sizes.max_clients {
        send_plain_reject(&session, RejectReason::ServerFull);
        session.close(CloseReason::HandshakeFailed);
        return;
    }

    let SessionKeys { send: seal, recv: open } = keys;
    let client_id = ctx.registry.allocate_id();
    let record = ClientRecord::new(
        client_id,
        fingerprint,
        session.clone(),
        seal,
        "anonymous".to_string(),
        ViewState { cols: 80, rows: 24, color: ColorMode::Mono },
        ctx.options.sizes.audio_ring,
    );
    ctx.registry.insert(record.clone());
    ctx.metrics.clients_connected.inc();
    info!("client {} joined ({}, {})", client_id, fingerprint, session.kind());

    // Encrypted accept doubles as key confirmation.
    let mut accept_payload = Vec::with_capacity(4);
    accept_payload.extend_from_slice(&client_id.to_le_bytes());
    record.send_control(PacketKind::SessionAccept, Bytes::from(accept_payload));

    tokio::spawn(watchdog(ctx.clone(), record.clone()));
    tokio::spawn(video_mixer(ctx.clone(), record.clone()));
    tokio::spawn(audio_mixer(ctx.clone(), record.clone()));

    dispatch_loop(ctx, record, events, decoder, open).await;
}

/// Responder half of §crypto handshake over raw transport events.
/// On failure the reject (when one applies) has been sent and the
/// session closed.
async fn handshake_as_responder(
    ctx: &ServerContext,
    session: &Session,
    events: &mut mpsc::Receiver<SessionEvent>,
    decoder: &mut PacketDecoder,
) -> Result<(SessionKeys, Fingerprint), ()> {
    let hello = next_plain_packet(events, decoder).await?;
    if hello.kind != PacketKind::Hello {
        debug!("expected HELLO, got {}", hello.kind);
        session.close(CloseReason::ProtocolViolation);
        return Err(());
    }

    let (responder, challenge, _capabilities) =
        match Responder::accept(&ctx.identity, ctx.password.as_deref(), &hello.payload) {
            Ok(accepted) => accepted,
            Err(HandshakeError::VersionIncompatible(version)) => {
                info!("rejecting client with protocol version {}", version);
                send_plain_reject(session, RejectReason::Version);
                session.close(CloseReason::HandshakeFailed);
                return Err(());
            }
            Err(err) => {
                debug!("bad HELLO: {}", err);
                session.close(CloseReason::ProtocolViolation);
                return Err(());
            }
        };

    let challenge_packet = Packet::new(PacketKind::AuthChallenge, 0, 0, challenge);
    if session.send(Bytes::from(challenge_packet.encode())) != SendOutcome::Sent {
        session.close(CloseReason::IoError);
        return Err(());
    }

    let response = next_plain_packet(events, decoder).await?;
    if response.kind != PacketKind::AuthResponse {
        debug!("expected AUTH_RESPONSE, got {}", response.kind);
        session.close(CloseReason::ProtocolViolation);
        return Err(());
    }

    let fingerprint = responder.peer_fingerprint();
    match responder.finish(&response.payload) {
        Ok((keys, _identity)) => Ok((keys, fingerprint)),
        Err(HandshakeError::BadPassword) => {
            info!("rejecting client {}: bad password", fingerprint);
            send_plain_reject(session, RejectReason::BadPassword);
            session.close(CloseReason::HandshakeFailed);
            Err(())
        }
        Err(err) => {
            debug!("handshake response invalid: {}", err);
            session.close(CloseReason::ProtocolViolation);
            Err(())
        }
    }
}

fn send_plain_reject(session: &Session, reason: RejectReason) {
    let packet = Packet::new(
        PacketKind::SessionReject,
        0,
        u32::MAX,
        SessionReject::payload(reason),
    );
    let _ = session.send(Bytes::from(packet.encode()));
}

async fn next_plain_packet(
    events: &mut mpsc::Receiver<SessionEvent>,
    decoder: &mut PacketDecoder,
) -> Result<Packet, ()> {
    loop {
        match decoder.next_packet() {
            Ok(Some(packet)) => return Ok(packet),
            Ok(None) => {}
            Err(err) => {
                debug!("wire error during handshake: {}", err);
                return Err(());
            }
        }
        match events.recv().await {
            Some(SessionEvent::Recv(data)) => decoder.extend(&data),
            Some(SessionEvent::Open) | Some(SessionEvent::Writable) => {}
            Some(SessionEvent::Closed(_)) | None => return Err(()),
        }
    }
}

enum Departure {
    Goodbye,
    TransportClosed,
    Evict(EvictReason),
}

async fn dispatch_loop(
    ctx: Arc<ServerContext>,
    record: Arc<ClientRecord>,
    mut events: mpsc::Receiver<SessionEvent>,
    mut decoder: PacketDecoder,
    mut open: OpeningStream,
) {
    let mut reassembler = Reassembler::new(
        ctx.options.timeouts.fragment_reassembly(),
        ctx.options.sizes.reassembly_cap,
    );

    let departure = 'session: loop {
        match events.recv().await {
            Some(SessionEvent::Recv(data)) => {
                decoder.extend(&data);
                loop {
                    let wire = match decoder.next_packet() {
                        Ok(Some(packet)) => packet,
                        Ok(None) => break,
                        Err(err) => {
                            warn!("client {}: wire error: {}", record.id, err);
                            break 'session Departure::Evict(EvictReason::ProtocolViolation);
                        }
                    };
                    ctx.metrics.packets_in.inc();
                    record.stats.packets_in.fetch_add(1, Ordering::Relaxed);
                    record.touch();

                    let packet = match open_packet(&mut open, &wire) {
                        Ok(packet) => packet,
                        Err(err) => {
                            warn!("client {}: {}", record.id, err);
                            break 'session Departure::Evict(EvictReason::ProtocolViolation);
                        }
                    };

                    let (kind, payload) = if packet.fragmented {
                        match reassembler.ingest(&packet) {
                            Ok(Some((kind, payload))) => (kind, payload),
                            Ok(None) => continue,
                            Err(ReassemblyError::Overflow) => {
                                break 'session Departure::Evict(EvictReason::SlowConsumer);
                            }
                            Err(ReassemblyError::Timeout) | Err(ReassemblyError::Stale) => {
                                // Lossy media: drop the late message, keep
                                // the session.
                                ctx.metrics.ticks_skipped.inc();
                                debug!("client {}: dropped stale fragment message", record.id);
                                continue;
                            }
                            Err(ReassemblyError::MismatchedCount) => {
                                break 'session Departure::Evict(EvictReason::ProtocolViolation);
                            }
                        }
                    } else {
                        (packet.kind, packet.payload)
                    };

                    if let Some(departure) = on_packet(&record, kind, &payload) {
                        break 'session departure;
                    }
                }
            }
            Some(SessionEvent::Open) | Some(SessionEvent::Writable) => {}
            Some(SessionEvent::Closed(reason)) => {
                debug!("client {} transport closed: {}", record.id, reason);
                break Departure::TransportClosed;
            }
            None => break Departure::TransportClosed,
        }
    };

    match departure {
        Departure::Goodbye | Departure::TransportClosed => depart(&ctx, &record),
        Departure::Evict(reason) => evict(&ctx, &record, reason),
    }
}

/// Dispatch one decrypted, reassembled packet.
fn on_packet(record: &Arc<ClientRecord>, kind: PacketKind, payload: &Bytes) -> Option<Departure> {
    match kind {
        PacketKind::ImageFrame => match VideoFrame::decode(payload) {
            Ok(frame) if frame.format == VideoFormat::Rgb24 => record.store_video(frame),
            _ => record.note_video_decode_failure(),
        },
        PacketKind::AudioFrame => {
            if let Ok(frame) = AudioFrame::decode(payload) {
                record.push_audio(frame);
            }
        }
        PacketKind::TerminalSize => {
            if let Some((cols, rows)) = decode_terminal_size(payload) {
                debug!("client {} terminal now {}x{}", record.id, cols, rows);
                record.set_terminal_size(cols, rows);
            }
        }
        PacketKind::Control => match serde_json::from_slice::<ControlMessage>(payload) {
            Ok(ControlMessage::MuteAudio { muted }) => {
                record.mute_audio.store(muted, Ordering::Relaxed);
            }
            Ok(ControlMessage::MuteVideo { muted }) => {
                record.mute_video.store(muted, Ordering::Relaxed);
            }
            Ok(ControlMessage::DisplayName { name }) => record.set_display_name(name),
            Err(err) => debug!("client {}: bad control message: {}", record.id, err),
        },
        PacketKind::StreamStart => match serde_json::from_slice::<StreamCapabilities>(payload) {
            Ok(caps) => {
                info!(
                    "client {} ({}) streaming: {}x{} {} audio={}",
                    record.id, caps.name, caps.cols, caps.rows, caps.color, caps.audio
                );
                record.set_display_name(caps.name.clone());
                record.set_view(ViewState {
                    cols: caps.cols,
                    rows: caps.rows,
                    color: caps.color_mode(),
                });
                record.audio_enabled.store(caps.audio, Ordering::Relaxed);
                record.streaming.store(true, Ordering::Relaxed);
            }
            Err(err) => {
                debug!("client {}: bad STREAM_START: {}", record.id, err);
                return Some(Departure::Evict(EvictReason::ProtocolViolation));
            }
        },
        PacketKind::StreamStop => record.streaming.store(false, Ordering::Relaxed),
        PacketKind::Heartbeat => {}
        PacketKind::Goodbye => return Some(Departure::Goodbye),
        PacketKind::Hello
        | PacketKind::AuthChallenge
        | PacketKind::AuthResponse
        | PacketKind::SessionAccept
        | PacketKind::SessionReject => {
            return Some(Departure::Evict(EvictReason::ProtocolViolation));
        }
    }
    None
}

/// Remove a departed (non-evicted) client and cancel its tasks.
fn depart(ctx: &ServerContext, record: &Arc<ClientRecord>) {
    if ctx.registry.remove(record.id).is_some() {
        ctx.metrics.clients_connected.dec();
        info!("client {} ({}) left", record.id, record.display_name());
    }
    record.cancel();
    record.session.close(CloseReason::PeerClosed);
}

/// Evict a client: remove, count, best-effort reject, cancel the task
/// tree, close the transport.
pub fn evict(ctx: &ServerContext, record: &Arc<ClientRecord>, reason: EvictReason) {
    if ctx.registry.remove(record.id).is_none() {
        return; // someone else already took it out
    }
    ctx.metrics.clients_connected.dec();
    ctx.metrics.evictions.with_label_values(&[reason.metric_label()]).inc();
    record.stats.record_eviction(reason);
    warn!("evicting client {} ({}): {}", record.id, record.display_name(), reason);

    send_plain_reject(&record.session, reason.reject_reason());
    record.cancel();
    record.session.close(match reason {
        EvictReason::SlowConsumer | EvictReason::HeartbeatTimeout => CloseReason::Timeout,
        EvictReason::ProtocolViolation => CloseReason::ProtocolViolation,
        EvictReason::BadAuth => CloseReason::HandshakeFailed,
        EvictReason::Shutdown => CloseReason::PeerClosed,
    });
}

/// Cancel every session and give transports a moment to flush.
pub async fn shutdown(ctx: &Arc<ServerContext>) {
    ctx.shutdown();
    for record in ctx.registry.snapshot() {
        evict(ctx, &record, EvictReason::Shutdown);
    }
    tokio::time::sleep(Duration::from_millis(500)).await;
}

/// Heartbeat sender plus liveness and slow-consumer checks.
async fn watchdog(ctx: Arc<ServerContext>, record: Arc<ClientRecord>) {
    let mut cancel = record.cancelled();
    let mut beat = interval(ctx.options.timeouts.heartbeat_interval());
    let mut check = interval(WATCHDOG_PERIOD);
    let heartbeat_timeout = ctx.options.timeouts.heartbeat_timeout();
    let grace = ctx.options.timeouts.slow_consumer_grace();

    loop {
        tokio::select! {
            _ = cancel.changed() => return,
            _ = beat.tick() => {
                record.send_control(PacketKind::Heartbeat, Bytes::new());
                ctx.metrics.packets_out.inc();
            }
            _ = check.tick() => {
                if record.silent_for() > heartbeat_timeout {
                    evict(&ctx, &record, EvictReason::HeartbeatTimeout);
                    return;
                }
                if let Some(slow) = record.slow_for() {
                    if slow > grace {
                        evict(&ctx, &record, EvictReason::SlowConsumer);
                        return;
                    }
                }
            }
        }
    }
}

/// Per-recipient video tick: snapshot, compose, enqueue.
async fn video_mixer(ctx: Arc<ServerContext>, record: Arc<ClientRecord>) {
    let mut cancel = record.cancelled();
    let mut ticker = interval(Duration::from_secs_f64(
        1.0 / ctx.options.rates.target_fps.max(1) as f64,
    ));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let mtu = ctx.options.sizes.mtu;
    let mut seq = 0u32;

    loop {
        tokio::select! {
            _ = cancel.changed() => return,
            _ = ticker.tick() => {
                let view = record.view();
                // A 0x0 terminal pauses mixing until a positive size arrives.
                if view.cols == 0 || view.rows == 0 {
                    continue;
                }

                let snapshot = ctx.registry.snapshot();
                let sources: Vec<TileSource> = snapshot
                    .iter()
                    .filter(|c| c.id != record.id && c.in_video_layout())
                    .filter_map(|c| {
                        if c.mute_video.load(Ordering::Relaxed) {
                            // Muted keeps its tile as a placeholder.
                            Some(TileSource { frame: None })
                        } else {
                            c.video_tile(RECENT_FRAME_WINDOW)
                        }
                    })
                    .collect();

                let buffer = compose(
                    Viewport { cols: view.cols, rows: view.rows, color: view.color },
                    &sources,
                    &ctx.options.mixer,
                );
                let frame = VideoFrame {
                    width: view.cols as u32,
                    height: view.rows as u32,
                    capture_ns: now_ns(),
                    seq,
                    format: VideoFormat::AnsiText,
                    data: Bytes::from(buffer),
                };
                seq = seq.wrapping_add(1);

                if record.send_media(PacketKind::ImageFrame, frame.encode(), mtu) {
                    ctx.metrics.frames_mixed.inc();
                    ctx.metrics.packets_out.inc();
                } else {
                    ctx.metrics.ticks_skipped.inc();
                }
            }
        }
    }
}

/// Per-recipient audio tick: sum everyone else's latest window.
async fn audio_mixer(ctx: Arc<ServerContext>, record: Arc<ClientRecord>) {
    let mut cancel = record.cancelled();
    let rate = ctx.options.rates.audio_sample_rate;
    let window = ctx.options.rates.audio_window;
    let mut ticker = interval(Duration::from_secs_f64(window as f64 / rate.max(1) as f64));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let mtu = ctx.options.sizes.mtu;
    let mut cursors: HashMap<u32, u32> = HashMap::new();
    let mut seq = 0u32;

    loop {
        tokio::select! {
            _ = cancel.changed() => return,
            _ = ticker.tick() => {
                let snapshot = ctx.registry.snapshot();
                let mut windows: Vec<Vec<f32>> = Vec::new();
                for source in snapshot.iter().filter(|c| c.id != record.id && c.audio_audible()) {
                    if let Some(frame) = source.audio_after(cursors.get(&source.id).copied()) {
                        cursors.insert(source.id, frame.seq);
                        let samples = if frame.sample_rate != rate {
                            resample_linear(&frame.samples, frame.sample_rate, rate)
                        } else {
                            frame.samples
                        };
                        windows.push(samples);
                    }
                    // A source with nothing new this window contributes
                    // silence by omission.
                }

                let refs: Vec<&[f32]> = windows.iter().map(|w| w.as_slice()).collect();
                let mixed = mix_windows(&refs, window);
                let frame = AudioFrame {
                    sample_rate: rate,
                    channels: 1,
                    capture_ns: now_ns(),
                    seq,
                    samples: mixed,
                };
                seq = seq.wrapping_add(1);

                if record.send_media(PacketKind::AudioFrame, frame.encode(), mtu) {
                    ctx.metrics.packets_out.inc();
                }
            }
        }
    }
}

/// Debug endpoint exposing the context's prometheus metrics.
pub async fn run_metrics_listener(ctx: Arc<ServerContext>, listener: TcpListener) {
    use axum::extract::State;
    use axum::routing::get;
    use axum::Router;

    async fn metrics(State(ctx): State<Arc<ServerContext>>) -> String {
        ctx.metrics.gather_text()
    }

    info!(
        "metrics on http://{}/metrics",
        listener.local_addr().map(|a| a.to_string()).unwrap_or_default()
    );
    let router = Router::new().route("/metrics", get(metrics)).with_state(ctx);
    if let Err(err) = axum::serve(listener, router).await {
        warn!("metrics listener failed: {}", err);
    }
}

/// Register with the discovery service and keep the registration alive.
/// Returns the assigned session string; a background task refreshes it
/// until shutdown, then unregisters.
pub async fn register_with_discovery(
    ctx: Arc<ServerContext>,
    discovery_url: String,
    endpoints: Vec<crate::discovery::EndpointInfo>,
) -> Option<String> {
    use crate::discovery::{DiscoveryClient, RegisterRequest};
    use base64::Engine;

    let host_pubkey = base64::engine::general_purpose::STANDARD
        .encode(ctx.identity.verifying_key().as_bytes());
    let lookup_timeout = ctx.options.timeouts.discovery_lookup();

    let request = RegisterRequest { host_pubkey: host_pubkey.clone(), endpoints };
    let register_url = discovery_url.clone();
    let registered = tokio::task::spawn_blocking(move || {
        DiscoveryClient::new(&register_url, lookup_timeout, None).register(&request)
    })
    .await
    .ok()?;

    let registered = match registered {
        Ok(response) => response,
        Err(err) => {
            warn!("discovery registration failed: {}", err);
            return None;
        }
    };
    info!("registered with discovery as {}", registered.session_string);

    // Keep-alive at a third of the TTL; re-register is implicit since the
    // service tolerates losing us.
    let session_string = registered.session_string.clone();
    let refresh_period = ctx.options.timeouts.session_ttl() / 3;
    let mut shutdown = ctx.shutdown_signal();
    tokio::spawn(async move {
        let mut ticker = interval(refresh_period.max(Duration::from_secs(1)));
        ticker.tick().await; // the registration itself covers the first period
        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    let url = discovery_url.clone();
                    let session = session_string.clone();
                    let key = host_pubkey.clone();
                    let _ = tokio::task::spawn_blocking(move || {
                        DiscoveryClient::new(&url, lookup_timeout, None).unregister(&session, &key)
                    })
                    .await;
                    return;
                }
                _ = ticker.tick() => {
                    let url = discovery_url.clone();
                    let session = session_string.clone();
                    let key = host_pubkey.clone();
                    let result = tokio::task::spawn_blocking(move || {
                        DiscoveryClient::new(&url, lookup_timeout, None).refresh(&session, &key)
                    })
                    .await;
                    if !matches!(result, Ok(Ok(()))) {
                        warn!("discovery keep-alive failed");
                    }
                }
            }
        }
    });

    Some(registered.session_string)
}

/// Answer WebRTC offers arriving through the discovery relay. Each new
/// peer id becomes a responder data-channel session served like any
/// other transport.
#[cfg(feature = "webrtc-transport")]
pub async fn run_webrtc_responder(
    ctx: Arc<ServerContext>,
    discovery_url: String,
    session_string: String,
    ice_servers: Vec<crate::transport::webrtc::IceServer>,
) {
    use crate::discovery::DiscoveryClient;
    use crate::transport::webrtc::RtcSignal;

    let lookup_timeout = ctx.options.timeouts.discovery_lookup();
    let client = Arc::new(DiscoveryClient::new(&discovery_url, lookup_timeout, None));
    let mut peers: HashMap<String, mpsc::UnboundedSender<RtcSignal>> = HashMap::new();
    let mut shutdown = ctx.shutdown_signal();
    let mut poll = interval(Duration::from_millis(500));

    loop {
        tokio::select! {
            _ = shutdown.changed() => return,
            _ = poll.tick() => {
                let poll_client = client.clone();
                let poll_session = session_string.clone();
                let items = tokio::task::spawn_blocking(move || {
                    poll_client.relay_poll(&poll_session, "server")
                })
                .await;
                let Ok(Ok(items)) = items else { continue };

                for item in items {
                    let signal = match item.kind.as_str() {
                        "sdp" => RtcSignal::Sdp(item.body),
                        "ice" => RtcSignal::Candidate(item.body),
                        _ => continue,
                    };
                    let sender = peers.entry(item.from.clone()).or_insert_with(|| {
                        spawn_rtc_responder(
                            ctx.clone(),
                            client.clone(),
                            session_string.clone(),
                            item.from.clone(),
                            ice_servers.clone(),
                        )
                    });
                    if sender.send(signal).is_err() {
                        peers.remove(&item.from);
                    }
                }
            }
        }
    }
}

#[cfg(feature = "webrtc-transport")]
fn spawn_rtc_responder(
    ctx: Arc<ServerContext>,
    discovery: Arc<crate::discovery::DiscoveryClient>,
    session_string: String,
    peer_id: String,
    ice_servers: Vec<crate::transport::webrtc::IceServer>,
) -> mpsc::UnboundedSender<crate::transport::webrtc::RtcSignal> {
    use crate::discovery::RelayRequest;
    use crate::transport::webrtc::{RtcEndpoint, RtcSignal};
    use crate::transport::{self, Role};

    let (remote_tx, remote_rx) = mpsc::unbounded_channel();
    let (local_tx, mut local_rx) = mpsc::unbounded_channel::<RtcSignal>();

    // Local answers/candidates go back through the relay to this peer.
    let relay_session = session_string.clone();
    tokio::spawn(async move {
        while let Some(signal) = local_rx.recv().await {
            let (kind, body) = match signal {
                RtcSignal::Sdp(sdp) => ("sdp", sdp),
                RtcSignal::Candidate(candidate) => ("ice", candidate),
            };
            let request = RelayRequest {
                from: "server".to_string(),
                to: peer_id.clone(),
                kind: kind.to_string(),
                body,
            };
            let client = discovery.clone();
            let session = relay_session.clone();
            let result =
                tokio::task::spawn_blocking(move || client.relay_send(&session, &request)).await;
            if !matches!(result, Ok(Ok(()))) {
                debug!("relay answer failed; abandoning peer signaling");
                return;
            }
        }
    });

    let endpoint = RtcEndpoint { ice_servers, signal_tx: local_tx, signal_rx: remote_rx };
    tokio::spawn(async move {
        let (tx, rx) = mpsc::channel(EVENT_CHANNEL_DEPTH);
        let budget = QueueBudget::from_sizes(&ctx.options.sizes);
        match transport::webrtc::open(endpoint, Role::Responder, tx, budget).await {
            Ok(session) => serve_connection(ctx, session, rx).await,
            Err(err) => warn!("webrtc responder failed: {}", err),
        }
    });

    remote_tx
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::source::FrameSource;
    use crate::client::{spawn, ClientConfig, ClientEvent, ClientState, Target};
    use crate::config::Options;
    use crate::crypto::handshake::Initiator;
    use crate::crypto::{Identity, TrustPolicy, TrustStore};
    use crate::media::VIDEO_CODEC_NAME;
    use crate::transport::{self, Endpoint, Role};

    struct SolidSource {
        rgb: [u8; 3],
        seq: u32,
    }

    impl FrameSource for SolidSource {
        fn next_frame(&mut self) -> Option<VideoFrame> {
            let pixels: Vec<u8> =
                self.rgb.iter().copied().cycle().take(8 * 8 * 3).collect();
            let frame = VideoFrame::rgb24(8, 8, now_ns(), self.seq, pixels);
            self.seq += 1;
            Some(frame)
        }
    }

    async fn start_server(options: Options) -> (Arc<ServerContext>, std::net::SocketAddr) {
        let ctx = ServerContext::for_tests(options);
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(run_tcp_listener(ctx.clone(), listener));
        (ctx, addr)
    }

    fn client_config(name: &str, cols: u16, rows: u16) -> ClientConfig {
        ClientConfig {
            identity: Identity::generate(),
            password: None,
            trust: Arc::new(TrustStore::ephemeral()),
            trust_policy: TrustPolicy::AcceptOnce,
            capabilities: StreamCapabilities {
                codec: VIDEO_CODEC_NAME.to_string(),
                color: "mono".to_string(),
                audio: false,
                cols,
                rows,
                name: name.to_string(),
            },
            options: Options::default(),
            discovery_key: None,
        }
    }

    async fn wait_for_frame(
        handle: &mut crate::client::ClientHandle,
        predicate: impl Fn(&VideoFrame) -> bool,
    ) -> VideoFrame {
        timeout(Duration::from_secs(5), async {
            loop {
                match handle.next_event().await.expect("client event stream ended") {
                    ClientEvent::Frame(frame) if predicate(&frame) => return frame,
                    ClientEvent::Fatal(message) => panic!("client failed: {}", message),
                    ClientEvent::Rejected(reason) => panic!("client rejected: {:?}", reason),
                    _ => {}
                }
            }
        })
        .await
        .expect("no matching frame within deadline")
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn smoke_single_client_sees_blank_grid() {
        let (_ctx, addr) = start_server(Options::default()).await;
        let mut handle = spawn(
            Target::Tcp(addr),
            client_config("smoke", 8, 2),
            Some(Box::new(SolidSource { rgb: [255, 255, 255], seq: 0 })),
            None,
        );

        // Own feed is excluded, so a lone client gets the stable blank grid.
        let frame = wait_for_frame(&mut handle, |f| f.format == VideoFormat::AnsiText).await;
        assert_eq!(frame.width, 8);
        assert_eq!(frame.height, 2);
        assert_eq!(&frame.data[..], b"        \n        \n");

        handle.command(crate::client::ClientCommand::Quit);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn two_clients_see_each_other_not_themselves() {
        let (ctx, addr) = start_server(Options::default()).await;

        let mut white = spawn(
            Target::Tcp(addr),
            client_config("white", 8, 2),
            Some(Box::new(SolidSource { rgb: [255, 255, 255], seq: 0 })),
            None,
        );
        let mut black = spawn(
            Target::Tcp(addr),
            client_config("black", 8, 2),
            Some(Box::new(SolidSource { rgb: [0, 0, 0], seq: 0 })),
            None,
        );

        // The black client sees white's feed: a bright tile letterboxed
        // into the 8x2 viewport (square source, 2:1 font cells).
        let frame = wait_for_frame(&mut black, |f| f.data.contains(&b'@')).await;
        assert_eq!(&frame.data[..], b"  @@@@  \n  @@@@  \n");

        // The white client sees black's feed only: never a bright glyph.
        let frame = wait_for_frame(&mut white, |f| {
            f.format == VideoFormat::AnsiText && f.seq > 15
        })
        .await;
        assert!(!frame.data.contains(&b'@'));

        assert_eq!(ctx.registry.len(), 2);
        white.command(crate::client::ClientCommand::Quit);
        black.command(crate::client::ClientCommand::Quit);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn wrong_password_is_rejected() {
        let options = Options::default();
        let ctx = ServerContext::new(
            options,
            Identity::generate(),
            TrustStore::ephemeral(),
            Some("hunter2".to_string()),
        );
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(run_tcp_listener(ctx.clone(), listener));

        let mut config = client_config("intruder", 80, 24);
        config.password = Some("swordfish".to_string());
        let mut handle = spawn(Target::Tcp(addr), config, None, None);

        let rejected = timeout(Duration::from_secs(5), async {
            loop {
                match handle.next_event().await.expect("events") {
                    ClientEvent::Rejected(reason) => return reason,
                    ClientEvent::State(ClientState::Closed) => panic!("closed before reject"),
                    _ => {}
                }
            }
        })
        .await
        .expect("reject within deadline");
        assert_eq!(rejected, RejectReason::BadPassword);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn silent_client_is_evicted_for_heartbeat_timeout() {
        let mut options = Options::default();
        options.timeouts.heartbeat_interval_ms = 100;
        options.timeouts.heartbeat_timeout_ms = 400;
        let (ctx, addr) = start_server(options.clone()).await;

        // Hand-rolled client that completes the handshake then goes silent.
        let (tx, mut rx) = mpsc::channel(EVENT_CHANNEL_DEPTH);
        let budget = QueueBudget::from_sizes(&options.sizes);
        let session = transport::open(Endpoint::Tcp(addr), Role::Initiator, tx, budget)
            .await
            .expect("connect");

        let identity = Identity::generate();
        let (initiator, hello) = Initiator::start(&identity, 0, None);
        session.send(Bytes::from(Packet::new(PacketKind::Hello, 0, 0, hello).encode()));

        let mut decoder = PacketDecoder::new();
        let challenge = loop {
            match rx.recv().await.expect("transport event") {
                SessionEvent::Recv(data) => {
                    decoder.extend(&data);
                    if let Some(packet) = decoder.next_packet().expect("wire") {
                        break packet;
                    }
                }
                SessionEvent::Open => {}
                other => panic!("unexpected {:?}", other),
            }
        };
        assert_eq!(challenge.kind, PacketKind::AuthChallenge);
        let outcome = initiator.finish(&identity, &challenge.payload).expect("finish");
        session.send(Bytes::from(
            Packet::new(PacketKind::AuthResponse, 0, 1, outcome.response_payload).encode(),
        ));

        // Stay silent; the server must evict within the timeout plus slack.
        let evicted = timeout(Duration::from_secs(3), async {
            loop {
                match rx.recv().await {
                    Some(SessionEvent::Recv(data)) => {
                        decoder.extend(&data);
                        while let Ok(Some(packet)) = decoder.next_packet() {
                            if packet.kind == PacketKind::SessionReject {
                                let reject: SessionReject =
                                    serde_json::from_slice(&packet.payload).expect("reject json");
                                return reject.reason;
                            }
                        }
                    }
                    Some(SessionEvent::Closed(_)) | None => {
                        panic!("closed without a reject reason")
                    }
                    _ => {}
                }
            }
        })
        .await
        .expect("eviction within deadline");

        assert_eq!(evicted, RejectReason::HeartbeatTimeout);
        assert_eq!(ctx.registry.len(), 0);
    }
}
