//! Discovery service (ACDS)
//!
//! Maps short session strings to server endpoints, relays WebRTC
//! SDP/ICE between peers, and hands out STUN/TURN credentials. Lookup
//! responses are signed with the service's Ed25519 key; clients pin that
//! key from an HTTPS bootstrap fetch.

pub mod client;
pub mod service;
pub mod words;

pub use client::DiscoveryClient;
pub use service::{DiscoveryConfig, DiscoveryState, TurnConfig};

use serde::{Deserialize, Serialize};
use std::error::Error;
use std::fmt;

/// One reachable server endpoint.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct EndpointInfo {
    /// "tcp" or "ws"
    pub kind: String,
    /// `host:port` for tcp, full URL for ws
    pub addr: String,
}

/// Short-lived TURN credential minted from the shared secret.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TurnCredential {
    pub urls: Vec<String>,
    pub username: String,
    pub credential: String,
    pub ttl_secs: u64,
}

/// The signed body of a lookup response.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SessionInfo {
    pub session_string: String,
    pub endpoints: Vec<EndpointInfo>,
    /// Host identity public key, base64
    pub host_pubkey: String,
    pub stun_servers: Vec<String>,
    pub turn_credential: Option<TurnCredential>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LookupResponse {
    pub session: SessionInfo,
    /// Ed25519 over the canonical JSON bytes of `session`, base64
    pub signature: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisterRequest {
    pub host_pubkey: String,
    pub endpoints: Vec<EndpointInfo>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisterResponse {
    pub session_string: String,
    pub expires_in_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RefreshRequest {
    pub host_pubkey: String,
}

/// One relayed signaling item, delivered exactly once.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RelayItem {
    pub from: String,
    /// "sdp" or "ice"
    pub kind: String,
    pub body: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelayRequest {
    pub from: String,
    pub to: String,
    pub kind: String,
    pub body: String,
}

/// Failures surfaced to discovery callers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DiscoveryError {
    SessionNotFound,
    SessionExpired,
    RateLimited,
    Unreachable(String),
    /// Lookup response signature did not verify against the pinned key.
    BadSignature,
    Malformed(String),
}

impl fmt::Display for DiscoveryError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DiscoveryError::SessionNotFound => write!(f, "session not found"),
            DiscoveryError::SessionExpired => write!(f, "session expired"),
            DiscoveryError::RateLimited => write!(f, "rate limited by discovery service"),
            DiscoveryError::Unreachable(msg) => write!(f, "discovery unreachable: {}", msg),
            DiscoveryError::BadSignature => write!(f, "lookup response signature invalid"),
            DiscoveryError::Malformed(msg) => write!(f, "malformed discovery response: {}", msg),
        }
    }
}

impl Error for DiscoveryError {}
