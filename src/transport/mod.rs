//! Transport layer
//!
//! Presents one duplex byte-oriented session regardless of the pipe
//! underneath: TCP, WebSocket, or a WebRTC data channel. Each session is
//! driven by a single event-loop task that drains the send queue and
//! delivers `SessionEvent`s to the owner over a bounded channel (the
//! bound is the receive-side flow control). Upper layers branch on
//! transport kind only at open time.

pub mod queue;
pub mod tcp;
#[cfg(feature = "webrtc-transport")]
pub mod webrtc;
pub mod websocket;

pub use queue::{SendOutcome, SendQueue};

use bytes::Bytes;
use std::error::Error;
use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::mpsc;

/// Bound of the per-session event channel; reading pauses when the owner
/// falls this many events behind.
pub const EVENT_CHANNEL_DEPTH: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportKind {
    Tcp,
    WebSocket,
    WebRtc,
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportKind::Tcp => write!(f, "tcp"),
            TransportKind::WebSocket => write!(f, "ws"),
            TransportKind::WebRtc => write!(f, "webrtc"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Initiator,
    Responder,
}

/// Why a session went away.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    PeerClosed,
    Timeout,
    IoError,
    HandshakeFailed,
    ProtocolViolation,
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CloseReason::PeerClosed => write!(f, "peer closed"),
            CloseReason::Timeout => write!(f, "timeout"),
            CloseReason::IoError => write!(f, "io error"),
            CloseReason::HandshakeFailed => write!(f, "handshake failed"),
            CloseReason::ProtocolViolation => write!(f, "protocol violation"),
        }
    }
}

/// Connection-level failures.
#[derive(Debug)]
pub enum TransportError {
    PeerClosed,
    Timeout,
    IoError(std::io::Error),
    IceGatheringFailed(String),
    DataChannelFailed(String),
    /// Endpoint kind not compiled in or malformed.
    Unsupported(String),
}

impl fmt::Display for TransportError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportError::PeerClosed => write!(f, "peer closed the connection"),
            TransportError::Timeout => write!(f, "connection timed out"),
            TransportError::IoError(err) => write!(f, "io error: {}", err),
            TransportError::IceGatheringFailed(msg) => write!(f, "ICE gathering failed: {}", msg),
            TransportError::DataChannelFailed(msg) => write!(f, "data channel failed: {}", msg),
            TransportError::Unsupported(msg) => write!(f, "unsupported endpoint: {}", msg),
        }
    }
}

impl Error for TransportError {}

impl From<std::io::Error> for TransportError {
    fn from(err: std::io::Error) -> Self {
        TransportError::IoError(err)
    }
}

/// Events delivered to the session owner, in order.
#[derive(Debug)]
pub enum SessionEvent {
    Open,
    Recv(Bytes),
    /// The send queue drained below the low watermark after a period of
    /// backpressure; retries may resume.
    Writable,
    Closed(CloseReason),
}

/// Where to connect. The WebRTC variant carries its signaling plumbing
/// because candidates flow through the discovery relay, not a socket
/// address.
pub enum Endpoint {
    Tcp(SocketAddr),
    WebSocket(String),
    #[cfg(feature = "webrtc-transport")]
    WebRtc(webrtc::RtcEndpoint),
}

impl fmt::Debug for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Endpoint::Tcp(addr) => write!(f, "tcp://{}", addr),
            Endpoint::WebSocket(url) => write!(f, "{}", url),
            #[cfg(feature = "webrtc-transport")]
            Endpoint::WebRtc(_) => write!(f, "webrtc data channel"),
        }
    }
}

pub(crate) enum Command {
    Close(CloseReason),
}

/// Byte budgets handed to a session at open time.
#[derive(Debug, Clone, Copy)]
pub struct QueueBudget {
    pub budget: usize,
    pub high_water: usize,
    pub low_water: usize,
}

impl QueueBudget {
    pub fn from_sizes(sizes: &crate::config::Sizes) -> Self {
        QueueBudget {
            budget: sizes.send_queue_budget,
            high_water: sizes.high_water(),
            low_water: sizes.low_water(),
        }
    }
}

/// Handle to a live transport session. Cheap to clone; the session task
/// exits when the handle closes the session or the peer goes away.
#[derive(Clone)]
pub struct Session {
    id: uuid::Uuid,
    kind: TransportKind,
    queue: Arc<SendQueue>,
    commands: mpsc::UnboundedSender<Command>,
}

impl Session {
    pub(crate) fn new(
        kind: TransportKind,
        queue: Arc<SendQueue>,
        commands: mpsc::UnboundedSender<Command>,
    ) -> Self {
        Session { id: uuid::Uuid::new_v4(), kind, queue, commands }
    }

    pub fn id(&self) -> uuid::Uuid {
        self.id
    }

    pub fn kind(&self) -> TransportKind {
        self.kind
    }

    /// Queue bytes for transmission. Never blocks.
    pub fn send(&self, bytes: Bytes) -> SendOutcome {
        self.queue.push(bytes)
    }

    /// Ask the session task to shut down and report `Closed(reason)`.
    pub fn close(&self, reason: CloseReason) {
        self.queue.close();
        let _ = self.commands.send(Command::Close(reason));
    }

    pub fn queued_bytes(&self) -> usize {
        self.queue.queued_bytes()
    }

    pub fn above_high_water(&self) -> bool {
        self.queue.above_high_water()
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Session({}, {})", self.kind, self.id)
    }
}

/// Open a session over whichever pipe the endpoint names. This is the
/// only place upper layers see the transport kind.
pub async fn open(
    endpoint: Endpoint,
    role: Role,
    events: mpsc::Sender<SessionEvent>,
    budget: QueueBudget,
) -> Result<Session, TransportError> {
    match (endpoint, role) {
        (Endpoint::Tcp(addr), Role::Initiator) => tcp::connect(addr, events, budget).await,
        (Endpoint::Tcp(_), Role::Responder) => Err(TransportError::Unsupported(
            "responder TCP sessions come from the listener".into(),
        )),
        (Endpoint::WebSocket(url), Role::Initiator) => {
            websocket::connect(&url, events, budget).await
        }
        (Endpoint::WebSocket(_), Role::Responder) => Err(TransportError::Unsupported(
            "responder WebSocket sessions come from the listener".into(),
        )),
        #[cfg(feature = "webrtc-transport")]
        (Endpoint::WebRtc(rtc), role) => webrtc::open(rtc, role, events, budget).await,
    }
}
