//! Wire protocol
//!
//! Binary packet framing shared by every transport:
//! - Fixed 28-byte little-endian header with CRC32 integrity
//! - Closed set of packet kinds
//! - Fragmentation / reassembly for messages larger than one packet

pub mod control;
pub mod fragment;
pub mod packet;
pub mod stream;

pub use fragment::{FragmentHeader, Reassembler, ReassemblyError};
pub use packet::{Packet, PacketHeader};
pub use stream::PacketDecoder;

use std::error::Error;
use std::fmt;

/// Wire tag: "ACAT" as a little-endian u32. A mismatch means out-of-band
/// data or a transport desync and the session must be torn down.
pub const MAGIC: u32 = 0x5441_4341;

/// Current protocol version. Incompatible changes bump this.
pub const VERSION: u16 = 1;

/// Serialized header size in bytes.
pub const HEADER_SIZE: usize = 28;

/// Largest payload carried by a single packet. Larger messages are
/// fragmented before hitting the wire.
pub const MAX_PACKET_SIZE: usize = 1024 * 1024;

/// High bit of the `kind` field marks a fragment carrying a
/// [`FragmentHeader`] sub-header in its payload.
pub const FRAGMENT_FLAG: u16 = 0x8000;

/// Packet kinds carried in the header `kind` field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum PacketKind {
    Hello = 1,
    AuthChallenge = 2,
    AuthResponse = 3,
    SessionAccept = 4,
    SessionReject = 5,
    StreamStart = 6,
    StreamStop = 7,
    ImageFrame = 8,
    AudioFrame = 9,
    TerminalSize = 10,
    Control = 11,
    Heartbeat = 12,
    Goodbye = 13,
}

impl PacketKind {
    pub fn from_u16(value: u16) -> Option<Self> {
        Some(match value {
            1 => PacketKind::Hello,
            2 => PacketKind::AuthChallenge,
            3 => PacketKind::AuthResponse,
            4 => PacketKind::SessionAccept,
            5 => PacketKind::SessionReject,
            6 => PacketKind::StreamStart,
            7 => PacketKind::StreamStop,
            8 => PacketKind::ImageFrame,
            9 => PacketKind::AudioFrame,
            10 => PacketKind::TerminalSize,
            11 => PacketKind::Control,
            12 => PacketKind::Heartbeat,
            13 => PacketKind::Goodbye,
            _ => return None,
        })
    }

    pub fn to_u16(self) -> u16 {
        self as u16
    }
}

impl fmt::Display for PacketKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            PacketKind::Hello => "HELLO",
            PacketKind::AuthChallenge => "AUTH_CHALLENGE",
            PacketKind::AuthResponse => "AUTH_RESPONSE",
            PacketKind::SessionAccept => "SESSION_ACCEPT",
            PacketKind::SessionReject => "SESSION_REJECT",
            PacketKind::StreamStart => "STREAM_START",
            PacketKind::StreamStop => "STREAM_STOP",
            PacketKind::ImageFrame => "IMAGE_FRAME",
            PacketKind::AudioFrame => "AUDIO_FRAME",
            PacketKind::TerminalSize => "TERMINAL_SIZE",
            PacketKind::Control => "CONTROL",
            PacketKind::Heartbeat => "HEARTBEAT",
            PacketKind::Goodbye => "GOODBYE",
        };
        f.write_str(name)
    }
}

/// Errors surfaced by the wire codec and the session cipher. All of them
/// are fatal to the current session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    /// Header fields are internally inconsistent (unknown kind, oversized
    /// length, bad fragment sub-header).
    MalformedHeader,
    /// Wire tag mismatch; the peer is not speaking this protocol.
    BadMagic(u32),
    /// Protocol version we do not support.
    BadVersion(u16),
    /// CRC32 over header and payload did not match.
    BadCrc { expected: u32, actual: u32 },
    /// Stream ended inside a packet.
    Truncated,
    /// Fragment metadata disagreed with the buffered message.
    FragmentMismatch,
    /// A reassembly buffer outlived its deadline.
    ReassemblyTimeout,
    /// Decryption saw a nonce that did not strictly increase.
    NonceRegression { last: u64, got: u64 },
    /// AEAD authentication failed.
    AuthTagInvalid,
}

impl fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProtocolError::MalformedHeader => write!(f, "malformed packet header"),
            ProtocolError::BadMagic(got) => {
                write!(f, "bad magic {:#010x} (expected {:#010x})", got, MAGIC)
            }
            ProtocolError::BadVersion(got) => {
                write!(f, "unsupported protocol version {} (ours is {})", got, VERSION)
            }
            ProtocolError::BadCrc { expected, actual } => {
                write!(f, "crc mismatch: header says {:#010x}, computed {:#010x}", expected, actual)
            }
            ProtocolError::Truncated => write!(f, "truncated packet"),
            ProtocolError::FragmentMismatch => write!(f, "fragment metadata mismatch"),
            ProtocolError::ReassemblyTimeout => write!(f, "fragment reassembly timed out"),
            ProtocolError::NonceRegression { last, got } => {
                write!(f, "nonce regression: last {} then {}", last, got)
            }
            ProtocolError::AuthTagInvalid => write!(f, "AEAD authentication failed"),
        }
    }
}

impl Error for ProtocolError {}
