//! Session crypto
//!
//! - Ed25519 host identity and fingerprints
//! - Transcript-signed handshake producing per-direction session keys
//! - ChaCha20-Poly1305 packet streams with strictly-increasing nonces
//! - TOFU trust store pinning peer identities per endpoint

pub mod cipher;
pub mod handshake;
pub mod identity;
pub mod trust;

pub use cipher::{OpeningStream, SealingStream};
pub use handshake::{Initiator, Responder, SessionKeys};
pub use identity::{Fingerprint, Identity};
pub use trust::{TrustDecision, TrustPolicy, TrustStore};

use std::error::Error;
use std::fmt;

/// Handshake and authentication failures.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HandshakeError {
    /// The endpoint is pinned to a different identity key. Always fatal
    /// and surfaced prominently.
    HostIdentityMismatch { pinned: Fingerprint, presented: Fingerprint },
    /// First contact with this endpoint; the user must accept the
    /// fingerprint before the handshake may continue.
    HostIdentityUnknown(Fingerprint),
    /// Password confirmation tags did not match.
    BadPassword,
    /// The peer speaks an incompatible protocol version.
    VersionIncompatible(u16),
    /// Transcript signature did not verify against the peer identity.
    BadSignature,
    /// A handshake payload could not be parsed.
    Malformed,
}

impl fmt::Display for HandshakeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HandshakeError::HostIdentityMismatch { pinned, presented } => write!(
                f,
                "host identity mismatch: endpoint pinned to {} but presented {}",
                pinned, presented
            ),
            HandshakeError::HostIdentityUnknown(fp) => {
                write!(f, "unknown host identity {}", fp)
            }
            HandshakeError::BadPassword => write!(f, "session password mismatch"),
            HandshakeError::VersionIncompatible(v) => {
                write!(f, "peer protocol version {} is incompatible", v)
            }
            HandshakeError::BadSignature => write!(f, "handshake signature invalid"),
            HandshakeError::Malformed => write!(f, "malformed handshake payload"),
        }
    }
}

impl Error for HandshakeError {}
