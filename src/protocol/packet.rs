//! Packet header encoding and decoding.
//!
//! Layout (28 bytes, little-endian):
//!
//! ```text
//! | magic u32 | version u16 | kind u16 | client_id u32 | seq u32 | length u32 | crc32 u32 |
//! ```
//!
//! The CRC32 covers the header without the crc field itself, followed by
//! the payload bytes.

use super::{PacketKind, ProtocolError, FRAGMENT_FLAG, HEADER_SIZE, MAGIC, MAX_PACKET_SIZE, VERSION};
use bytes::Bytes;

/// Offset of the crc field inside the serialized header.
const CRC_OFFSET: usize = 24;

/// Parsed packet header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PacketHeader {
    pub kind: PacketKind,
    /// Set when the payload starts with a fragment sub-header.
    pub fragmented: bool,
    pub client_id: u32,
    pub seq: u32,
    pub length: u32,
    pub crc32: u32,
}

impl PacketHeader {
    /// Parse and validate the fixed-size header. The payload is read (and
    /// the CRC checked) separately, once `length` bytes are available.
    pub fn parse(bytes: &[u8]) -> Result<Self, ProtocolError> {
        if bytes.len() < HEADER_SIZE {
            return Err(ProtocolError::Truncated);
        }
        let magic = u32::from_le_bytes(bytes[0..4].try_into().unwrap());
        if magic != MAGIC {
            return Err(ProtocolError::BadMagic(magic));
        }
        let version = u16::from_le_bytes(bytes[4..6].try_into().unwrap());
        if version != VERSION {
            return Err(ProtocolError::BadVersion(version));
        }
        let raw_kind = u16::from_le_bytes(bytes[6..8].try_into().unwrap());
        let fragmented = raw_kind & FRAGMENT_FLAG != 0;
        let kind = PacketKind::from_u16(raw_kind & !FRAGMENT_FLAG)
            .ok_or(ProtocolError::MalformedHeader)?;
        let length = u32::from_le_bytes(bytes[16..20].try_into().unwrap());
        if length as usize > MAX_PACKET_SIZE {
            return Err(ProtocolError::MalformedHeader);
        }
        Ok(PacketHeader {
            kind,
            fragmented,
            client_id: u32::from_le_bytes(bytes[8..12].try_into().unwrap()),
            seq: u32::from_le_bytes(bytes[12..16].try_into().unwrap()),
            length,
            crc32: u32::from_le_bytes(bytes[20..24].try_into().unwrap()),
        })
    }

    /// Serialize the header. `crc32` must already hold the final value.
    pub fn to_bytes(&self) -> [u8; HEADER_SIZE] {
        let mut out = [0u8; HEADER_SIZE];
        out[0..4].copy_from_slice(&MAGIC.to_le_bytes());
        out[4..6].copy_from_slice(&VERSION.to_le_bytes());
        let raw_kind = self.kind.to_u16() | if self.fragmented { FRAGMENT_FLAG } else { 0 };
        out[6..8].copy_from_slice(&raw_kind.to_le_bytes());
        out[8..12].copy_from_slice(&self.client_id.to_le_bytes());
        out[12..16].copy_from_slice(&self.seq.to_le_bytes());
        out[16..20].copy_from_slice(&self.length.to_le_bytes());
        out[20..24].copy_from_slice(&self.crc32.to_le_bytes());
        out
    }

    /// Header bytes covered by the CRC and used as AEAD associated data.
    pub fn integrity_bytes(&self) -> [u8; CRC_OFFSET] {
        let full = self.to_bytes();
        let mut out = [0u8; CRC_OFFSET];
        out.copy_from_slice(&full[..CRC_OFFSET]);
        out
    }
}

/// A whole protocol packet: header fields plus owned payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    pub kind: PacketKind,
    pub fragmented: bool,
    pub client_id: u32,
    pub seq: u32,
    pub payload: Bytes,
}

impl Packet {
    pub fn new(kind: PacketKind, client_id: u32, seq: u32, payload: impl Into<Bytes>) -> Self {
        Packet { kind, fragmented: false, client_id, seq, payload: payload.into() }
    }

    /// Zero-payload control packet.
    pub fn control(kind: PacketKind, client_id: u32, seq: u32) -> Self {
        Packet::new(kind, client_id, seq, Bytes::new())
    }

    pub fn header(&self) -> PacketHeader {
        PacketHeader {
            kind: self.kind,
            fragmented: self.fragmented,
            client_id: self.client_id,
            seq: self.seq,
            length: self.payload.len() as u32,
            crc32: 0,
        }
    }

    /// Emit header + payload with the CRC filled in.
    pub fn encode(&self) -> Vec<u8> {
        let mut header = self.header();
        header.crc32 = crc_of(&header, &self.payload);
        let mut out = Vec::with_capacity(HEADER_SIZE + self.payload.len());
        out.extend_from_slice(&header.to_bytes());
        out.extend_from_slice(&self.payload);
        out
    }

    /// Decode one whole packet from a buffer that holds exactly the header
    /// and payload (the WebSocket transport delivers packets this way).
    pub fn decode(bytes: &[u8]) -> Result<Packet, ProtocolError> {
        let header = PacketHeader::parse(bytes)?;
        let total = HEADER_SIZE + header.length as usize;
        if bytes.len() < total {
            return Err(ProtocolError::Truncated);
        }
        let payload = &bytes[HEADER_SIZE..total];
        let actual = crc_of(&header, payload);
        if actual != header.crc32 {
            return Err(ProtocolError::BadCrc { expected: header.crc32, actual });
        }
        Ok(Packet {
            kind: header.kind,
            fragmented: header.fragmented,
            client_id: header.client_id,
            seq: header.seq,
            payload: Bytes::copy_from_slice(payload),
        })
    }
}

/// CRC32 over the header-without-crc bytes and the payload.
pub fn crc_of(header: &PacketHeader, payload: &[u8]) -> u32 {
    let mut hasher = crc32fast::Hasher::new();
    hasher.update(&header.integrity_bytes());
    hasher.update(payload);
    hasher.finalize()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Packet {
        Packet::new(PacketKind::ImageFrame, 7, 42, &b"pixels"[..])
    }

    #[test]
    fn round_trip() {
        let packet = sample();
        let bytes = packet.encode();
        assert_eq!(bytes.len(), HEADER_SIZE + 6);
        let decoded = Packet::decode(&bytes).expect("decode");
        assert_eq!(decoded, packet);
    }

    #[test]
    fn empty_payload_round_trip() {
        let packet = Packet::control(PacketKind::Heartbeat, 3, 0);
        let decoded = Packet::decode(&packet.encode()).expect("decode");
        assert_eq!(decoded, packet);
    }

    #[test]
    fn reject_bad_magic() {
        let mut bytes = sample().encode();
        bytes[0] ^= 0xff;
        assert!(matches!(Packet::decode(&bytes), Err(ProtocolError::BadMagic(_))));
    }

    #[test]
    fn reject_bad_version() {
        let mut bytes = sample().encode();
        bytes[4] = 0x7f;
        assert_eq!(Packet::decode(&bytes), Err(ProtocolError::BadVersion(0x7f)));
    }

    #[test]
    fn reject_unknown_kind() {
        let mut bytes = sample().encode();
        bytes[6] = 0xee;
        bytes[7] = 0x01;
        assert_eq!(Packet::decode(&bytes), Err(ProtocolError::MalformedHeader));
    }

    #[test]
    fn reject_flipped_payload_byte() {
        let mut bytes = sample().encode();
        let last = bytes.len() - 1;
        bytes[last] ^= 0x01;
        assert!(matches!(Packet::decode(&bytes), Err(ProtocolError::BadCrc { .. })));
    }

    #[test]
    fn reject_flipped_header_byte() {
        let mut bytes = sample().encode();
        // client_id field
        bytes[8] ^= 0x01;
        assert!(matches!(Packet::decode(&bytes), Err(ProtocolError::BadCrc { .. })));
    }

    #[test]
    fn max_size_accepted_one_more_rejected() {
        let packet = Packet::new(PacketKind::ImageFrame, 1, 0, vec![0u8; MAX_PACKET_SIZE]);
        let bytes = packet.encode();
        assert!(Packet::decode(&bytes).is_ok());

        let mut oversize = sample().header();
        oversize.length = MAX_PACKET_SIZE as u32 + 1;
        assert_eq!(PacketHeader::parse(&oversize.to_bytes()), Err(ProtocolError::MalformedHeader));
    }

    #[test]
    fn fragment_flag_survives_round_trip() {
        let mut packet = sample();
        packet.fragmented = true;
        let decoded = Packet::decode(&packet.encode()).expect("decode");
        assert!(decoded.fragmented);
        assert_eq!(decoded.kind, PacketKind::ImageFrame);
    }
}
