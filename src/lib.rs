//! ascii-chat session and media core
//!
//! Real-time terminal video conferencing: clients send webcam frames and
//! audio windows, the server composites a personalized ASCII grid and
//! audio mix per viewer, and everything rides one packet protocol over
//! TCP, WebSocket, or a WebRTC data channel.

pub mod client;
pub mod config;
pub mod crypto;
pub mod discovery;
pub mod media;
pub mod metrics;
pub mod mixer;
pub mod protocol;
pub mod server;
pub mod transport;

// Re-exports
pub use config::Options;
pub use crypto::{Identity, TrustStore};
pub use protocol::{Packet, PacketKind};
pub use server::ServerContext;
