//! Streaming packet decoder for byte-oriented transports.
//!
//! Handles partial reads across TCP segment boundaries: header first, then
//! exactly `length` payload bytes.

use super::packet::{crc_of, Packet, PacketHeader};
use super::{ProtocolError, HEADER_SIZE};
use bytes::Bytes;

/// Stateful decoder over a reassembled byte stream.
pub struct PacketDecoder {
    buf: Vec<u8>,
}

impl PacketDecoder {
    pub fn new() -> Self {
        PacketDecoder { buf: Vec::with_capacity(4096) }
    }

    /// Append received bytes to the internal buffer.
    pub fn extend(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
    }

    /// Extract the next complete packet, if available.
    ///
    /// Header validation (magic, version, kind, length bound) happens as
    /// soon as the header bytes are buffered; any error here means the
    /// stream is desynced and the session must be torn down.
    pub fn next_packet(&mut self) -> Result<Option<Packet>, ProtocolError> {
        if self.buf.len() < HEADER_SIZE {
            return Ok(None);
        }
        let header = PacketHeader::parse(&self.buf[..HEADER_SIZE])?;
        let total = HEADER_SIZE + header.length as usize;
        if self.buf.len() < total {
            return Ok(None);
        }

        let payload = &self.buf[HEADER_SIZE..total];
        let actual = crc_of(&header, payload);
        if actual != header.crc32 {
            return Err(ProtocolError::BadCrc { expected: header.crc32, actual });
        }

        let packet = Packet {
            kind: header.kind,
            fragmented: header.fragmented,
            client_id: header.client_id,
            seq: header.seq,
            payload: Bytes::copy_from_slice(payload),
        };
        self.buf.drain(..total);
        Ok(Some(packet))
    }

    /// Bytes buffered but not yet consumed (an in-flight partial packet).
    pub fn pending_bytes(&self) -> usize {
        self.buf.len()
    }
}

impl Default for PacketDecoder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::PacketKind;

    #[test]
    fn decode_across_partial_reads() {
        let packet = Packet::new(PacketKind::AudioFrame, 4, 9, &b"samples"[..]);
        let bytes = packet.encode();

        let mut decoder = PacketDecoder::new();
        for byte in &bytes {
            assert!(decoder.next_packet().expect("no error").is_none());
            decoder.extend(&[*byte]);
        }
        let decoded = decoder.next_packet().expect("ok").expect("complete");
        assert_eq!(decoded, packet);
        assert_eq!(decoder.pending_bytes(), 0);
    }

    #[test]
    fn decode_back_to_back_packets() {
        let a = Packet::control(PacketKind::Heartbeat, 1, 1);
        let b = Packet::new(PacketKind::Control, 1, 2, &b"mute"[..]);
        let mut stream = a.encode();
        stream.extend_from_slice(&b.encode());

        let mut decoder = PacketDecoder::new();
        decoder.extend(&stream);
        assert_eq!(decoder.next_packet().unwrap().unwrap(), a);
        assert_eq!(decoder.next_packet().unwrap().unwrap(), b);
        assert!(decoder.next_packet().unwrap().is_none());
    }

    #[test]
    fn desync_surfaces_bad_magic() {
        let mut decoder = PacketDecoder::new();
        decoder.extend(&[0u8; HEADER_SIZE]);
        assert!(matches!(decoder.next_packet(), Err(ProtocolError::BadMagic(0))));
    }
}
