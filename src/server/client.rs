//! Per-client server-side state.
//!
//! A `ClientRecord` roots one client's task tree: the inbound dispatch
//! loop, its heartbeat watchdog, and its two mixer tasks all hold the
//! record and watch its cancel signal. Media lands in lossy slots: a
//! single-slot mailbox for video, a short ring for audio windows.
//! Freshness beats completeness here.

use crate::crypto::cipher::{seal_packet, SealingStream};
use crate::crypto::Fingerprint;
use crate::media::{AudioFrame, VideoFrame};
use crate::mixer::video::TileSource;
use crate::mixer::ColorMode;
use crate::protocol::control::RejectReason;
use crate::protocol::{Packet, PacketKind};
use crate::transport::{SendOutcome, Session};
use parking_lot::{Mutex, RwLock};
use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;

pub type ClientId = u32;

/// Why a client was removed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EvictReason {
    SlowConsumer,
    HeartbeatTimeout,
    ProtocolViolation,
    BadAuth,
    Shutdown,
}

impl EvictReason {
    pub fn metric_label(&self) -> &'static str {
        match self {
            EvictReason::SlowConsumer => "slow_consumer",
            EvictReason::HeartbeatTimeout => "heartbeat_timeout",
            EvictReason::ProtocolViolation => "protocol_violation",
            EvictReason::BadAuth => "bad_auth",
            EvictReason::Shutdown => "shutdown",
        }
    }

    pub fn reject_reason(&self) -> RejectReason {
        match self {
            EvictReason::SlowConsumer => RejectReason::SlowConsumer,
            EvictReason::HeartbeatTimeout => RejectReason::HeartbeatTimeout,
            EvictReason::ProtocolViolation => RejectReason::ProtocolViolation,
            EvictReason::BadAuth => RejectReason::BadPassword,
            EvictReason::Shutdown => RejectReason::Shutdown,
        }
    }
}

impl fmt::Display for EvictReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.metric_label())
    }
}

/// Terminal view parameters the mixers render against.
#[derive(Debug, Clone, Copy)]
pub struct ViewState {
    pub cols: u16,
    pub rows: u16,
    pub color: ColorMode,
}

struct VideoSlot {
    frame: Option<Arc<VideoFrame>>,
    decode_failed: bool,
    updated: Option<Instant>,
}

#[derive(Default)]
pub struct ClientStats {
    pub packets_in: AtomicU64,
    pub packets_out: AtomicU64,
    pub frames_dropped: AtomicU64,
    evicted: Mutex<Option<EvictReason>>,
}

impl ClientStats {
    pub fn record_eviction(&self, reason: EvictReason) {
        self.evicted.lock().get_or_insert(reason);
    }

    pub fn eviction(&self) -> Option<EvictReason> {
        *self.evicted.lock()
    }
}

pub struct ClientRecord {
    pub id: ClientId,
    pub fingerprint: Fingerprint,
    pub session: Session,
    pub joined_at: Instant,
    pub stats: ClientStats,

    display_name: RwLock<String>,
    view: RwLock<ViewState>,

    pub streaming: AtomicBool,
    pub video_enabled: AtomicBool,
    pub audio_enabled: AtomicBool,
    pub mute_video: AtomicBool,
    pub mute_audio: AtomicBool,

    video_slot: Mutex<VideoSlot>,
    audio_ring: Mutex<VecDeque<AudioFrame>>,
    audio_ring_cap: usize,

    last_heard: Mutex<Instant>,
    slow_since: Mutex<Option<Instant>>,

    seal: Mutex<SealingStream>,
    send_seq: AtomicU32,
    next_message_id: AtomicU64,

    cancel_tx: watch::Sender<bool>,
}

impl ClientRecord {
    pub fn new(
        id: ClientId,
        fingerprint: Fingerprint,
        session: Session,
        seal: SealingStream,
        name: String,
        view: ViewState,
        audio_ring_cap: usize,
    ) -> Arc<Self> {
        let (cancel_tx, _) = watch::channel(false);
        Arc::new(ClientRecord {
            id,
            fingerprint,
            session,
            joined_at: Instant::now(),
            stats: ClientStats::default(),
            display_name: RwLock::new(name),
            view: RwLock::new(view),
            streaming: AtomicBool::new(false),
            video_enabled: AtomicBool::new(true),
            audio_enabled: AtomicBool::new(true),
            mute_video: AtomicBool::new(false),
            mute_audio: AtomicBool::new(false),
            video_slot: Mutex::new(VideoSlot { frame: None, decode_failed: false, updated: None }),
            audio_ring: Mutex::new(VecDeque::new()),
            audio_ring_cap,
            last_heard: Mutex::new(Instant::now()),
            slow_since: Mutex::new(None),
            seal: Mutex::new(seal),
            send_seq: AtomicU32::new(0),
            next_message_id: AtomicU64::new(1),
            cancel_tx,
        })
    }

    /// Cancel signal observed by every task in this client's tree.
    pub fn cancelled(&self) -> watch::Receiver<bool> {
        self.cancel_tx.subscribe()
    }

    pub fn cancel(&self) {
        let _ = self.cancel_tx.send(true);
    }

    pub fn display_name(&self) -> String {
        self.display_name.read().clone()
    }

    pub fn set_display_name(&self, name: String) {
        *self.display_name.write() = name;
    }

    pub fn view(&self) -> ViewState {
        *self.view.read()
    }

    pub fn set_view(&self, view: ViewState) {
        *self.view.write() = view;
    }

    pub fn set_terminal_size(&self, cols: u16, rows: u16) {
        let mut view = self.view.write();
        view.cols = cols;
        view.rows = rows;
    }

    /// Any packet from the client counts as liveness.
    pub fn touch(&self) {
        *self.last_heard.lock() = Instant::now();
    }

    pub fn silent_for(&self) -> Duration {
        self.last_heard.lock().elapsed()
    }

    // Latest-frame slot: single writer (the client's ingest task),
    // multiple readers (every other recipient's mixer).

    pub fn store_video(&self, frame: VideoFrame) {
        let mut slot = self.video_slot.lock();
        slot.frame = Some(Arc::new(frame));
        slot.decode_failed = false;
        slot.updated = Some(Instant::now());
    }

    pub fn note_video_decode_failure(&self) {
        let mut slot = self.video_slot.lock();
        slot.decode_failed = true;
        slot.updated = Some(Instant::now());
    }

    /// Snapshot this source for a mixer tick. `None` means the source has
    /// no recent frame and drops out of the layout entirely; a tile with
    /// `frame: None` stays in the layout and renders no-signal.
    pub fn video_tile(&self, recent: Duration) -> Option<TileSource> {
        let slot = self.video_slot.lock();
        let updated = slot.updated?;
        if updated.elapsed() > recent {
            return None;
        }
        if slot.decode_failed {
            return Some(TileSource { frame: None });
        }
        slot.frame.clone().map(|frame| TileSource { frame: Some(frame) })
    }

    pub fn push_audio(&self, frame: AudioFrame) {
        let mut ring = self.audio_ring.lock();
        if ring.len() == self.audio_ring_cap {
            ring.pop_front();
        }
        ring.push_back(frame);
    }

    /// Oldest buffered window newer than the recipient's cursor.
    pub fn audio_after(&self, last_seq: Option<u32>) -> Option<AudioFrame> {
        let ring = self.audio_ring.lock();
        match last_seq {
            None => ring.back().cloned(),
            Some(seq) => ring.iter().find(|frame| frame.seq > seq).cloned(),
        }
    }

    /// Track how long the outbound queue has sat above the high
    /// watermark; returns the duration once it has one.
    pub fn slow_for(&self) -> Option<Duration> {
        let mut slow_since = self.slow_since.lock();
        if self.session.above_high_water() {
            let since = slow_since.get_or_insert_with(Instant::now);
            Some(since.elapsed())
        } else {
            *slow_since = None;
            None
        }
    }

    /// Seal and enqueue one control packet. Control traffic must not be
    /// dropped, so a `WouldBlock` here feeds the slow-consumer clock.
    pub fn send_control(&self, kind: PacketKind, payload: bytes::Bytes) -> SendOutcome {
        let packet = Packet::new(kind, 0, self.next_seq(), payload);
        self.send_sealed(&packet)
    }

    /// Seal and enqueue one media frame, fragmenting above the MTU and
    /// dropping the whole frame (not blocking) when the queue is at its
    /// high watermark.
    pub fn send_media(&self, kind: PacketKind, payload: bytes::Bytes, mtu: usize) -> bool {
        if self.session.above_high_water() {
            self.stats.frames_dropped.fetch_add(1, Ordering::Relaxed);
            return false;
        }
        let message_id = self.next_message_id.fetch_add(1, Ordering::Relaxed);
        let packets = crate::protocol::fragment::fragment(
            message_id,
            kind,
            0,
            self.next_seq(),
            &payload,
            mtu,
        );
        for packet in &packets {
            if !matches!(self.send_sealed(packet), SendOutcome::Sent) {
                self.stats.frames_dropped.fetch_add(1, Ordering::Relaxed);
                return false;
            }
        }
        true
    }

    fn send_sealed(&self, packet: &Packet) -> SendOutcome {
        // The seal lock is held across the queue push so nonce order
        // matches wire order; a dropped packet leaves a nonce gap, which
        // the peer accepts.
        let mut seal = self.seal.lock();
        let wire = seal_packet(&mut seal, packet);
        let outcome = self.session.send(bytes::Bytes::from(wire.encode()));
        drop(seal);
        if matches!(outcome, SendOutcome::Sent) {
            self.stats.packets_out.fetch_add(1, Ordering::Relaxed);
        }
        outcome
    }

    fn next_seq(&self) -> u32 {
        self.send_seq.fetch_add(1, Ordering::Relaxed)
    }

    /// In recipients' layouts: streaming with video on. A muted source
    /// stays in the layout (as a placeholder tile) until STREAM_STOP.
    pub fn in_video_layout(&self) -> bool {
        self.streaming.load(Ordering::Relaxed) && self.video_enabled.load(Ordering::Relaxed)
    }

    pub fn audio_audible(&self) -> bool {
        self.streaming.load(Ordering::Relaxed)
            && self.audio_enabled.load(Ordering::Relaxed)
            && !self.mute_audio.load(Ordering::Relaxed)
    }
}
