//! Message fragmentation and reassembly.
//!
//! Messages larger than the transport MTU are split into fragment packets.
//! Each fragment payload starts with a 12-byte sub-header; fragments of one
//! message share a `message_id` and must arrive in index order on their
//! transport. Reassembly buffers are evicted on a deadline and the total
//! buffered byte count is capped.

use super::{Packet, PacketKind, ProtocolError, MAX_PACKET_SIZE};
use bytes::Bytes;
use std::collections::HashMap;
use std::error::Error;
use std::fmt;
use std::time::{Duration, Instant};

/// Size of the fragment sub-header prepended to fragment payloads.
pub const FRAGMENT_HEADER_SIZE: usize = 12;

/// Fragment sub-header: `message_id u64 | index u16 | count u16`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FragmentHeader {
    pub message_id: u64,
    pub index: u16,
    pub count: u16,
}

impl FragmentHeader {
    pub fn parse(payload: &[u8]) -> Result<(Self, &[u8]), ProtocolError> {
        if payload.len() < FRAGMENT_HEADER_SIZE {
            return Err(ProtocolError::MalformedHeader);
        }
        let header = FragmentHeader {
            message_id: u64::from_le_bytes(payload[0..8].try_into().unwrap()),
            index: u16::from_le_bytes(payload[8..10].try_into().unwrap()),
            count: u16::from_le_bytes(payload[10..12].try_into().unwrap()),
        };
        if header.count == 0 || header.index >= header.count {
            return Err(ProtocolError::MalformedHeader);
        }
        Ok((header, &payload[FRAGMENT_HEADER_SIZE..]))
    }

    pub fn write_to(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.message_id.to_le_bytes());
        out.extend_from_slice(&self.index.to_le_bytes());
        out.extend_from_slice(&self.count.to_le_bytes());
    }
}

/// Split a message into fragment packets. Messages that fit within `mtu`
/// come back as a single unflagged packet with no sub-header.
///
/// `mtu` is the largest payload a single packet may carry and must exceed
/// the sub-header size.
pub fn fragment(
    message_id: u64,
    kind: PacketKind,
    client_id: u32,
    seq: u32,
    payload: &[u8],
    mtu: usize,
) -> Vec<Packet> {
    let mtu = mtu.min(MAX_PACKET_SIZE);
    assert!(mtu > FRAGMENT_HEADER_SIZE, "mtu must exceed the fragment sub-header");

    if payload.len() <= mtu {
        return vec![Packet::new(kind, client_id, seq, Bytes::copy_from_slice(payload))];
    }

    let chunk = mtu - FRAGMENT_HEADER_SIZE;
    let count = payload.len().div_ceil(chunk);
    debug_assert!(count <= u16::MAX as usize, "message too large to fragment");

    payload
        .chunks(chunk)
        .enumerate()
        .map(|(index, data)| {
            let mut body = Vec::with_capacity(FRAGMENT_HEADER_SIZE + data.len());
            FragmentHeader { message_id, index: index as u16, count: count as u16 }
                .write_to(&mut body);
            body.extend_from_slice(data);
            let mut packet = Packet::new(kind, client_id, seq.wrapping_add(index as u32), body);
            packet.fragmented = true;
            packet
        })
        .collect()
}

/// Reassembly failures. `Stale` and `MismatchedCount` reject one fragment;
/// `Timeout` reports an expired buffer; `Overflow` means the peer exceeded
/// its buffer budget and should be disconnected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReassemblyError {
    /// Fragment count or index disagreed with the buffered message.
    MismatchedCount,
    /// Fragment for a message we are no longer (or not yet) collecting,
    /// including late fragments after a timeout eviction.
    Stale,
    /// A buffered message passed its reassembly deadline.
    Timeout,
    /// Total buffered bytes exceeded the configured cap.
    Overflow,
}

impl fmt::Display for ReassemblyError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReassemblyError::MismatchedCount => write!(f, "fragment count mismatch"),
            ReassemblyError::Stale => write!(f, "stale fragment"),
            ReassemblyError::Timeout => write!(f, "reassembly timeout"),
            ReassemblyError::Overflow => write!(f, "reassembly buffers over capacity"),
        }
    }
}

impl Error for ReassemblyError {}

impl From<ReassemblyError> for ProtocolError {
    fn from(err: ReassemblyError) -> Self {
        match err {
            ReassemblyError::Timeout => ProtocolError::ReassemblyTimeout,
            _ => ProtocolError::FragmentMismatch,
        }
    }
}

struct PartialMessage {
    kind: PacketKind,
    count: u16,
    next_index: u16,
    data: Vec<u8>,
    started: Instant,
}

/// Collects fragments back into whole messages, one buffer per
/// `message_id`. Out-of-order fragments within a message are rejected;
/// interleaved messages are fine.
pub struct Reassembler {
    partials: HashMap<u64, PartialMessage>,
    timeout: Duration,
    max_buffered: usize,
    buffered: usize,
    /// Ids evicted by timeout; late fragments for these are `Stale`.
    dead: HashMap<u64, Instant>,
}

impl Reassembler {
    pub fn new(timeout: Duration, max_buffered: usize) -> Self {
        Reassembler {
            partials: HashMap::new(),
            timeout,
            max_buffered,
            buffered: 0,
            dead: HashMap::new(),
        }
    }

    /// Total bytes currently held across all partial messages.
    pub fn buffered_bytes(&self) -> usize {
        self.buffered
    }

    /// Feed one fragment packet. Returns the completed message once the
    /// final fragment lands.
    pub fn ingest(&mut self, packet: &Packet) -> Result<Option<(PacketKind, Bytes)>, ReassemblyError> {
        self.ingest_at(packet, Instant::now())
    }

    fn ingest_at(
        &mut self,
        packet: &Packet,
        now: Instant,
    ) -> Result<Option<(PacketKind, Bytes)>, ReassemblyError> {
        self.sweep(now)?;

        let (header, data) = FragmentHeader::parse(&packet.payload)
            .map_err(|_| ReassemblyError::MismatchedCount)?;

        if self.dead.contains_key(&header.message_id) {
            return Err(ReassemblyError::Stale);
        }

        if self.buffered + data.len() > self.max_buffered {
            return Err(ReassemblyError::Overflow);
        }

        if !self.partials.contains_key(&header.message_id) {
            // A first fragment we never saw means the message started
            // before we were listening (or was already discarded).
            if header.index != 0 {
                return Err(ReassemblyError::Stale);
            }
            self.partials.insert(
                header.message_id,
                PartialMessage {
                    kind: packet.kind,
                    count: header.count,
                    next_index: 0,
                    data: Vec::new(),
                    started: now,
                },
            );
        }
        let partial = self.partials.get_mut(&header.message_id).expect("just ensured present");

        if header.count != partial.count || packet.kind != partial.kind {
            self.drop_partial(header.message_id);
            return Err(ReassemblyError::MismatchedCount);
        }
        if header.index != partial.next_index {
            self.drop_partial(header.message_id);
            return Err(ReassemblyError::MismatchedCount);
        }

        partial.data.extend_from_slice(data);
        partial.next_index += 1;
        self.buffered += data.len();

        if partial.next_index == partial.count {
            let done = self.partials.remove(&header.message_id).unwrap();
            self.buffered -= done.data.len();
            return Ok(Some((done.kind, Bytes::from(done.data))));
        }
        Ok(None)
    }

    /// Evict expired buffers. Surfaces `Timeout` once per sweep that
    /// dropped anything, so the session can log and count it.
    fn sweep(&mut self, now: Instant) -> Result<(), ReassemblyError> {
        let timeout = self.timeout;
        let expired: Vec<u64> = self
            .partials
            .iter()
            .filter(|(_, p)| now.duration_since(p.started) >= timeout)
            .map(|(id, _)| *id)
            .collect();
        // Forget tombstones after two timeout windows; by then any
        // straggler fragment is long gone.
        self.dead.retain(|_, t| now.duration_since(*t) < timeout * 2);

        if expired.is_empty() {
            return Ok(());
        }
        for id in expired {
            self.drop_partial(id);
            self.dead.insert(id, now);
        }
        Err(ReassemblyError::Timeout)
    }

    fn drop_partial(&mut self, message_id: u64) {
        if let Some(partial) = self.partials.remove(&message_id) {
            self.buffered -= partial.data.len();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reassembler() -> Reassembler {
        Reassembler::new(Duration::from_millis(50), 1024 * 1024)
    }

    #[test]
    fn small_message_is_one_packet() {
        let packets = fragment(1, PacketKind::Control, 1, 0, b"tiny", 64);
        assert_eq!(packets.len(), 1);
        assert!(!packets[0].fragmented);
        assert_eq!(&packets[0].payload[..], b"tiny");
    }

    #[test]
    fn fragment_then_reassemble() {
        let message: Vec<u8> = (0..10_000u32).map(|i| (i % 251) as u8).collect();
        let packets = fragment(9, PacketKind::ImageFrame, 2, 100, &message, 1024);
        assert!(packets.len() > 1);
        assert!(packets.iter().all(|p| p.fragmented));
        assert!(packets.iter().all(|p| p.payload.len() <= 1024));

        let mut reasm = reassembler();
        let mut result = None;
        for packet in &packets {
            if let Some(done) = reasm.ingest(packet).expect("ingest") {
                result = Some(done);
            }
        }
        let (kind, data) = result.expect("message completed");
        assert_eq!(kind, PacketKind::ImageFrame);
        assert_eq!(&data[..], &message[..]);
        assert_eq!(reasm.buffered_bytes(), 0);
    }

    #[test]
    fn out_of_order_fragment_rejected() {
        let message = vec![7u8; 4000];
        let packets = fragment(5, PacketKind::ImageFrame, 1, 0, &message, 1024);
        let mut reasm = reassembler();
        reasm.ingest(&packets[0]).expect("first");
        assert_eq!(reasm.ingest(&packets[2]), Err(ReassemblyError::MismatchedCount));
        // The buffer is gone; replaying from the start treats index 1 as stale.
        assert_eq!(reasm.ingest(&packets[1]), Err(ReassemblyError::Stale));
    }

    #[test]
    fn interleaved_messages_reassemble() {
        let a = vec![1u8; 3000];
        let b = vec![2u8; 3000];
        let pa = fragment(1, PacketKind::ImageFrame, 1, 0, &a, 1024);
        let pb = fragment(2, PacketKind::ImageFrame, 1, 0, &b, 1024);

        let mut reasm = reassembler();
        let mut done = Vec::new();
        for (x, y) in pa.iter().zip(pb.iter()) {
            if let Some(m) = reasm.ingest(x).expect("a") {
                done.push(m);
            }
            if let Some(m) = reasm.ingest(y).expect("b") {
                done.push(m);
            }
        }
        assert_eq!(done.len(), 2);
        assert_eq!(&done[0].1[..], &a[..]);
        assert_eq!(&done[1].1[..], &b[..]);
    }

    #[test]
    fn timeout_discards_and_blocks_resurrection() {
        let message = vec![3u8; 4000];
        let packets = fragment(11, PacketKind::ImageFrame, 1, 0, &message, 1024);
        let mut reasm = reassembler();

        let start = Instant::now();
        reasm.ingest_at(&packets[0], start).expect("first fragment");

        let late = start + Duration::from_millis(60);
        assert_eq!(
            reasm.ingest_at(&packets[1], late),
            Err(ReassemblyError::Timeout),
        );
        // Remaining fragments must not resurrect the message.
        assert_eq!(reasm.ingest_at(&packets[1], late), Err(ReassemblyError::Stale));
        assert_eq!(reasm.ingest_at(&packets[2], late), Err(ReassemblyError::Stale));
        assert_eq!(reasm.buffered_bytes(), 0);
    }

    #[test]
    fn byte_cap_enforced() {
        let message = vec![4u8; 4000];
        let packets = fragment(21, PacketKind::ImageFrame, 1, 0, &message, 1024);
        let mut reasm = Reassembler::new(Duration::from_secs(5), 2000);
        reasm.ingest(&packets[0]).expect("fits");
        assert_eq!(reasm.ingest(&packets[1]), Err(ReassemblyError::Overflow));
    }

    #[test]
    fn count_mismatch_rejected() {
        let message = vec![5u8; 4000];
        let packets = fragment(31, PacketKind::ImageFrame, 1, 0, &message, 1024);
        let mut reasm = reassembler();
        reasm.ingest(&packets[0]).expect("first");

        // Re-encode the second fragment with a different count.
        let (header, data) = FragmentHeader::parse(&packets[1].payload).unwrap();
        let mut body = Vec::new();
        FragmentHeader { count: header.count + 1, ..header }.write_to(&mut body);
        body.extend_from_slice(data);
        let mut forged = packets[1].clone();
        forged.payload = Bytes::from(body);

        assert_eq!(reasm.ingest(&forged), Err(ReassemblyError::MismatchedCount));
    }
}
