//! Application-level media frames and their wire payloads.
//!
//! IMAGE_FRAME payloads carry either raw RGB24 from a capture source or a
//! rendered terminal buffer from the mixer; both are zlib-deflated so
//! every frame stands alone on the wire. AUDIO_FRAME payloads are short
//! uncompressed f32 windows.

use crate::protocol::ProtocolError;
use bytes::Bytes;
use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;
use flate2::Compression;
use std::io::{Read, Write};

/// Codec name advertised in STREAM_START capabilities.
pub const VIDEO_CODEC_NAME: &str = "deflate";

/// Wall-clock nanoseconds for capture timestamps.
pub fn now_ns() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_nanos() as u64)
        .unwrap_or(0)
}

const VIDEO_HEADER_SIZE: usize = 4 + 4 + 8 + 4 + 1 + 3;
const AUDIO_HEADER_SIZE: usize = 4 + 2 + 2 + 8 + 4;

/// Payload content marker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum VideoFormat {
    /// Packed RGB24, row-major, from a capture source.
    Rgb24 = 0,
    /// Terminal-ready bytes (glyphs + ANSI escapes + newlines) from the
    /// mixer.
    AnsiText = 1,
}

impl VideoFormat {
    fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(VideoFormat::Rgb24),
            1 => Some(VideoFormat::AnsiText),
            _ => None,
        }
    }
}

/// One video frame. For `Rgb24` the dimensions are pixels; for
/// `AnsiText` they are terminal columns and rows.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VideoFrame {
    pub width: u32,
    pub height: u32,
    pub capture_ns: u64,
    pub seq: u32,
    pub format: VideoFormat,
    pub data: Bytes,
}

impl VideoFrame {
    pub fn rgb24(width: u32, height: u32, capture_ns: u64, seq: u32, pixels: impl Into<Bytes>) -> Self {
        VideoFrame { width, height, capture_ns, seq, format: VideoFormat::Rgb24, data: pixels.into() }
    }

    /// Serialize: fixed header, then the deflated frame body.
    pub fn encode(&self) -> Bytes {
        let mut out = Vec::with_capacity(VIDEO_HEADER_SIZE + self.data.len() / 4);
        out.extend_from_slice(&self.width.to_le_bytes());
        out.extend_from_slice(&self.height.to_le_bytes());
        out.extend_from_slice(&self.capture_ns.to_le_bytes());
        out.extend_from_slice(&self.seq.to_le_bytes());
        out.push(self.format as u8);
        out.extend_from_slice(&[0u8; 3]);

        let mut encoder = ZlibEncoder::new(out, Compression::fast());
        encoder
            .write_all(&self.data)
            .and_then(|_| encoder.finish())
            .map(Bytes::from)
            .expect("in-memory deflate cannot fail")
    }

    pub fn decode(payload: &[u8]) -> Result<VideoFrame, ProtocolError> {
        if payload.len() < VIDEO_HEADER_SIZE {
            return Err(ProtocolError::Truncated);
        }
        let width = u32::from_le_bytes(payload[0..4].try_into().unwrap());
        let height = u32::from_le_bytes(payload[4..8].try_into().unwrap());
        let capture_ns = u64::from_le_bytes(payload[8..16].try_into().unwrap());
        let seq = u32::from_le_bytes(payload[16..20].try_into().unwrap());
        let format = VideoFormat::from_u8(payload[20]).ok_or(ProtocolError::MalformedHeader)?;

        let mut data = Vec::new();
        ZlibDecoder::new(&payload[VIDEO_HEADER_SIZE..])
            .read_to_end(&mut data)
            .map_err(|_| ProtocolError::MalformedHeader)?;

        if format == VideoFormat::Rgb24 && data.len() != (width * height * 3) as usize {
            return Err(ProtocolError::MalformedHeader);
        }
        Ok(VideoFrame { width, height, capture_ns, seq, format, data: Bytes::from(data) })
    }
}

/// One audio window (target 10-20 ms).
#[derive(Debug, Clone, PartialEq)]
pub struct AudioFrame {
    pub sample_rate: u32,
    pub channels: u16,
    pub capture_ns: u64,
    pub seq: u32,
    pub samples: Vec<f32>,
}

impl AudioFrame {
    pub fn encode(&self) -> Bytes {
        let mut out = Vec::with_capacity(AUDIO_HEADER_SIZE + self.samples.len() * 4);
        out.extend_from_slice(&self.sample_rate.to_le_bytes());
        out.extend_from_slice(&self.channels.to_le_bytes());
        out.extend_from_slice(&(self.samples.len() as u16).to_le_bytes());
        out.extend_from_slice(&self.capture_ns.to_le_bytes());
        out.extend_from_slice(&self.seq.to_le_bytes());
        for sample in &self.samples {
            out.extend_from_slice(&sample.to_le_bytes());
        }
        Bytes::from(out)
    }

    pub fn decode(payload: &[u8]) -> Result<AudioFrame, ProtocolError> {
        if payload.len() < AUDIO_HEADER_SIZE {
            return Err(ProtocolError::Truncated);
        }
        let sample_rate = u32::from_le_bytes(payload[0..4].try_into().unwrap());
        let channels = u16::from_le_bytes(payload[4..6].try_into().unwrap());
        let count = u16::from_le_bytes(payload[6..8].try_into().unwrap()) as usize;
        let capture_ns = u64::from_le_bytes(payload[8..16].try_into().unwrap());
        let seq = u32::from_le_bytes(payload[16..20].try_into().unwrap());

        let body = &payload[AUDIO_HEADER_SIZE..];
        if body.len() != count * 4 {
            return Err(ProtocolError::Truncated);
        }
        let samples = body
            .chunks_exact(4)
            .map(|chunk| f32::from_le_bytes(chunk.try_into().unwrap()))
            .collect();
        Ok(AudioFrame { sample_rate, channels, capture_ns, seq, samples })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn video_frame_round_trip() {
        let pixels: Vec<u8> = (0..4 * 3 * 3).map(|i| (i * 7 % 256) as u8).collect();
        let frame = VideoFrame::rgb24(4, 3, 123_456_789, 5, pixels);
        let decoded = VideoFrame::decode(&frame.encode()).expect("decode");
        assert_eq!(decoded, frame);
    }

    #[test]
    fn ansi_frame_round_trip() {
        let frame = VideoFrame {
            width: 80,
            height: 24,
            capture_ns: 1,
            seq: 9,
            format: VideoFormat::AnsiText,
            data: Bytes::from_static(b"@@##..\n..##@@\n"),
        };
        let decoded = VideoFrame::decode(&frame.encode()).expect("decode");
        assert_eq!(decoded, frame);
    }

    #[test]
    fn rgb_size_mismatch_rejected() {
        let frame = VideoFrame::rgb24(4, 3, 0, 0, vec![0u8; 10]);
        assert_eq!(VideoFrame::decode(&frame.encode()), Err(ProtocolError::MalformedHeader));
    }

    #[test]
    fn audio_frame_round_trip() {
        let frame = AudioFrame {
            sample_rate: 48_000,
            channels: 1,
            capture_ns: 42,
            seq: 17,
            samples: (0..960).map(|i| (i as f32 / 960.0).sin()).collect(),
        };
        let decoded = AudioFrame::decode(&frame.encode()).expect("decode");
        assert_eq!(decoded, frame);
    }

    #[test]
    fn truncated_audio_rejected() {
        let frame = AudioFrame {
            sample_rate: 48_000,
            channels: 1,
            capture_ns: 0,
            seq: 0,
            samples: vec![0.5; 64],
        };
        let bytes = frame.encode();
        assert_eq!(
            AudioFrame::decode(&bytes[..bytes.len() - 3]),
            Err(ProtocolError::Truncated)
        );
    }
}
