//! Authenticated packet streams.
//!
//! One `SealingStream` / `OpeningStream` pair per session direction. The
//! 64-bit counter nonce rides in front of the ciphertext and must strictly
//! increase; the packet header (minus its CRC field) is the associated
//! data, so a header swap fails authentication.
//!
//! Wire layout: `nonce u64 | ciphertext | tag (16 bytes)`.

use crate::protocol::ProtocolError;
use chacha20poly1305::aead::{Aead, KeyInit, Payload};
use chacha20poly1305::{ChaCha20Poly1305, Key, Nonce};

/// AEAD tag length appended to the ciphertext.
pub const TAG_SIZE: usize = 16;

/// Bytes of the explicit nonce counter in front of the ciphertext.
pub const NONCE_PREFIX_SIZE: usize = 8;

/// Place the u64 counter in the trailing 8 bytes of the 12-byte IETF nonce.
fn nonce_bytes(counter: u64) -> Nonce {
    let mut bytes = [0u8; 12];
    bytes[4..].copy_from_slice(&counter.to_le_bytes());
    Nonce::from(bytes)
}

/// Encrypting half of one session direction.
pub struct SealingStream {
    cipher: ChaCha20Poly1305,
    next_nonce: u64,
}

impl SealingStream {
    pub fn new(key: &[u8; 32]) -> Self {
        SealingStream {
            cipher: ChaCha20Poly1305::new(Key::from_slice(key)),
            next_nonce: 1,
        }
    }

    /// Encrypt one packet payload. Consumes the next nonce; never reuses
    /// or reorders.
    pub fn seal(&mut self, aad: &[u8], plaintext: &[u8]) -> Vec<u8> {
        let counter = self.next_nonce;
        self.next_nonce += 1;

        let sealed = self
            .cipher
            .encrypt(&nonce_bytes(counter), Payload { msg: plaintext, aad })
            .expect("chacha20poly1305 encryption is infallible for in-memory buffers");

        let mut out = Vec::with_capacity(NONCE_PREFIX_SIZE + sealed.len());
        out.extend_from_slice(&counter.to_le_bytes());
        out.extend_from_slice(&sealed);
        out
    }
}

/// Decrypting half of one session direction. Rejects replayed or
/// reordered nonces before touching the ciphertext.
pub struct OpeningStream {
    cipher: ChaCha20Poly1305,
    last_nonce: u64,
}

impl OpeningStream {
    pub fn new(key: &[u8; 32]) -> Self {
        OpeningStream {
            cipher: ChaCha20Poly1305::new(Key::from_slice(key)),
            last_nonce: 0,
        }
    }

    /// Decrypt one packet payload. Errors are fatal to the session.
    pub fn open(&mut self, aad: &[u8], wire: &[u8]) -> Result<Vec<u8>, ProtocolError> {
        if wire.len() < NONCE_PREFIX_SIZE + TAG_SIZE {
            return Err(ProtocolError::Truncated);
        }
        let counter = u64::from_le_bytes(wire[..NONCE_PREFIX_SIZE].try_into().unwrap());
        if counter <= self.last_nonce {
            return Err(ProtocolError::NonceRegression { last: self.last_nonce, got: counter });
        }

        let plain = self
            .cipher
            .decrypt(
                &nonce_bytes(counter),
                Payload { msg: &wire[NONCE_PREFIX_SIZE..], aad },
            )
            .map_err(|_| ProtocolError::AuthTagInvalid)?;

        self.last_nonce = counter;
        Ok(plain)
    }
}

/// Encrypt a packet's payload in place, producing the wire packet. The
/// transmitted header (with the ciphertext length, minus the CRC field)
/// is the associated data, so header tampering fails authentication.
pub fn seal_packet(stream: &mut SealingStream, packet: &crate::protocol::Packet) -> crate::protocol::Packet {
    let mut wire = packet.clone();
    // Sealed length is deterministic, so the final header is known before
    // encryption.
    let mut header = wire.header();
    header.length = (packet.payload.len() + NONCE_PREFIX_SIZE + TAG_SIZE) as u32;
    let sealed = stream.seal(&header.integrity_bytes(), &packet.payload);
    wire.payload = bytes::Bytes::from(sealed);
    wire
}

/// Decrypt a received wire packet back to its plaintext payload.
pub fn open_packet(
    stream: &mut OpeningStream,
    packet: &crate::protocol::Packet,
) -> Result<crate::protocol::Packet, ProtocolError> {
    let header = packet.header();
    let plain = stream.open(&header.integrity_bytes(), &packet.payload)?;
    let mut opened = packet.clone();
    opened.payload = bytes::Bytes::from(plain);
    Ok(opened)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pair() -> (SealingStream, OpeningStream) {
        let key = [0x42u8; 32];
        (SealingStream::new(&key), OpeningStream::new(&key))
    }

    #[test]
    fn seal_open_round_trip() {
        let (mut seal, mut open) = pair();
        let aad = b"header-bytes";
        let wire = seal.seal(aad, b"secret frame");
        assert_eq!(open.open(aad, &wire).expect("open"), b"secret frame");
    }

    #[test]
    fn nonces_strictly_increase() {
        let (mut seal, mut open) = pair();
        let first = seal.seal(b"", b"one");
        let second = seal.seal(b"", b"two");
        open.open(b"", &second).expect("newer nonce ok");
        // Replaying the earlier packet regresses the counter.
        assert!(matches!(
            open.open(b"", &first),
            Err(ProtocolError::NonceRegression { .. })
        ));
    }

    #[test]
    fn tampered_ciphertext_rejected() {
        let (mut seal, mut open) = pair();
        let mut wire = seal.seal(b"aad", b"payload");
        let mid = NONCE_PREFIX_SIZE + 2;
        wire[mid] ^= 0x01;
        assert_eq!(open.open(b"aad", &wire), Err(ProtocolError::AuthTagInvalid));
    }

    #[test]
    fn wrong_aad_rejected() {
        let (mut seal, mut open) = pair();
        let wire = seal.seal(b"header-a", b"payload");
        assert_eq!(open.open(b"header-b", &wire), Err(ProtocolError::AuthTagInvalid));
    }

    #[test]
    fn short_input_is_truncated() {
        let (_, mut open) = pair();
        assert_eq!(open.open(b"", &[0u8; 10]), Err(ProtocolError::Truncated));
    }

    #[test]
    fn packet_seal_open_round_trip() {
        use crate::protocol::{Packet, PacketKind};
        let (mut seal, mut open) = pair();
        let packet = Packet::new(PacketKind::ImageFrame, 9, 100, &b"frame bytes"[..]);
        let wire = seal_packet(&mut seal, &packet);
        assert_ne!(wire.payload, packet.payload);
        assert_eq!(wire.payload.len(), packet.payload.len() + NONCE_PREFIX_SIZE + TAG_SIZE);
        let opened = open_packet(&mut open, &wire).expect("open");
        assert_eq!(opened, packet);
    }

    #[test]
    fn packet_header_swap_fails_auth() {
        use crate::protocol::{Packet, PacketKind};
        let (mut seal, mut open) = pair();
        let packet = Packet::new(PacketKind::Control, 9, 100, &b"mute"[..]);
        let mut wire = seal_packet(&mut seal, &packet);
        wire.kind = PacketKind::Goodbye;
        assert_eq!(open_packet(&mut open, &wire), Err(ProtocolError::AuthTagInvalid));
    }
}
