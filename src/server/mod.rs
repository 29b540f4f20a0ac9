//! Server session manager
//!
//! Accepts connections, keeps per-client records in a read-mostly
//! registry, runs the per-recipient mixers, and enforces heartbeat and
//! slow-consumer limits.

pub mod client;
pub mod context;
pub mod registry;
pub mod session;

pub use client::{ClientId, ClientRecord, EvictReason};
pub use context::ServerContext;
pub use registry::Registry;
