//! JSON payloads for control-plane packets.
//!
//! STREAM_START capabilities, CONTROL updates, and SESSION_REJECT
//! reasons ride as small tagged JSON bodies inside their packets.

use crate::mixer::ColorMode;
use serde::{Deserialize, Serialize};

/// Capabilities announced in STREAM_START.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct StreamCapabilities {
    /// Video payload codec (currently always "deflate")
    pub codec: String,
    /// Color support: "mono" | "ansi8" | "ansi256" | "truecolor"
    pub color: String,
    /// Whether the client sends and wants audio
    pub audio: bool,
    /// Terminal size at join
    pub cols: u16,
    pub rows: u16,
    /// Display name shown to other participants
    pub name: String,
}

impl StreamCapabilities {
    pub fn color_mode(&self) -> ColorMode {
        match self.color.as_str() {
            "truecolor" => ColorMode::TrueColor,
            "ansi256" => ColorMode::Ansi256,
            "ansi8" => ColorMode::Ansi8,
            _ => ColorMode::Mono,
        }
    }

    pub fn color_name(mode: ColorMode) -> &'static str {
        match mode {
            ColorMode::TrueColor => "truecolor",
            ColorMode::Ansi256 => "ansi256",
            ColorMode::Ansi8 => "ansi8",
            ColorMode::Mono => "mono",
        }
    }
}

/// In-session control updates.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ControlMessage {
    MuteAudio { muted: bool },
    MuteVideo { muted: bool },
    DisplayName { name: String },
}

/// Reasons carried in SESSION_REJECT.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RejectReason {
    Version,
    BadPassword,
    ServerFull,
    SlowConsumer,
    HeartbeatTimeout,
    ProtocolViolation,
    Shutdown,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionReject {
    pub reason: RejectReason,
}

impl SessionReject {
    pub fn payload(reason: RejectReason) -> bytes::Bytes {
        let body = serde_json::to_vec(&SessionReject { reason })
            .expect("reject reason serializes");
        bytes::Bytes::from(body)
    }
}

/// TERMINAL_SIZE payload: `cols u16 | rows u16`, little-endian.
pub fn encode_terminal_size(cols: u16, rows: u16) -> bytes::Bytes {
    let mut out = Vec::with_capacity(4);
    out.extend_from_slice(&cols.to_le_bytes());
    out.extend_from_slice(&rows.to_le_bytes());
    bytes::Bytes::from(out)
}

pub fn decode_terminal_size(payload: &[u8]) -> Option<(u16, u16)> {
    if payload.len() != 4 {
        return None;
    }
    Some((
        u16::from_le_bytes(payload[0..2].try_into().unwrap()),
        u16::from_le_bytes(payload[2..4].try_into().unwrap()),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn capabilities_round_trip() {
        let caps = StreamCapabilities {
            codec: "deflate".into(),
            color: "truecolor".into(),
            audio: true,
            cols: 120,
            rows: 40,
            name: "alice".into(),
        };
        let json = serde_json::to_string(&caps).unwrap();
        let parsed: StreamCapabilities = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, caps);
        assert_eq!(parsed.color_mode(), ColorMode::TrueColor);
    }

    #[test]
    fn control_message_tags() {
        let json = serde_json::to_string(&ControlMessage::MuteAudio { muted: true }).unwrap();
        assert!(json.contains(r#""type":"mute_audio""#));
        let parsed: ControlMessage = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, ControlMessage::MuteAudio { muted: true });
    }

    #[test]
    fn reject_reason_snake_case() {
        let payload = SessionReject::payload(RejectReason::SlowConsumer);
        let parsed: SessionReject = serde_json::from_slice(&payload).unwrap();
        assert_eq!(parsed.reason, RejectReason::SlowConsumer);
        assert!(std::str::from_utf8(&payload).unwrap().contains("slow_consumer"));
    }

    #[test]
    fn terminal_size_round_trip() {
        let payload = encode_terminal_size(204, 51);
        assert_eq!(decode_terminal_size(&payload), Some((204, 51)));
        assert_eq!(decode_terminal_size(&payload[..3]), None);
    }
}
