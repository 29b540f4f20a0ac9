//! Capture sources.
//!
//! Webcam and microphone capture live outside this crate; the session
//! only sees these traits. Sources run on plain threads at their own
//! cadence and feed the async session through a channel. A test-pattern
//! source is built in for smoke runs and `--snapshot` style checks.

use crate::media::{now_ns, AudioFrame, VideoFrame};
use crossbeam::channel::{bounded, Receiver, RecvTimeoutError, Sender as StopSender};
use log::debug;
use std::time::Duration;
use tokio::sync::mpsc;

/// Produces RGB frames at the capture cadence. Returning `None` ends the
/// stream.
pub trait FrameSource: Send + 'static {
    fn next_frame(&mut self) -> Option<VideoFrame>;
}

/// Produces audio windows at the window cadence.
pub trait AudioSource: Send + 'static {
    fn next_window(&mut self) -> Option<AudioFrame>;
}

/// Items flowing from capture threads into the session task.
#[derive(Debug)]
pub enum CaptureItem {
    Video(VideoFrame),
    Audio(AudioFrame),
}

/// Stops the capture threads when dropped (or on `stop`).
pub struct CaptureHandle {
    stop: Option<StopSender<()>>,
}

impl CaptureHandle {
    pub fn stop(&mut self) {
        self.stop.take();
    }
}

/// True when the thread should exit: an explicit stop or the handle
/// going away.
fn should_stop(stop: &Receiver<()>, period: Duration) -> bool {
    !matches!(stop.recv_timeout(period), Err(RecvTimeoutError::Timeout))
}

/// Spawn capture threads pushing into `out`. Video ticks at `fps`;
/// audio at one window per `window / sample_rate` seconds.
pub fn spawn_capture(
    video: Option<Box<dyn FrameSource>>,
    audio: Option<Box<dyn AudioSource>>,
    fps: u32,
    sample_rate: u32,
    window: usize,
    out: mpsc::Sender<CaptureItem>,
) -> CaptureHandle {
    let (stop_tx, stop_rx) = bounded::<()>(1);

    if let Some(mut source) = video {
        let out = out.clone();
        let stop = stop_rx.clone();
        let period = Duration::from_secs_f64(1.0 / fps.max(1) as f64);
        std::thread::spawn(move || loop {
            if should_stop(&stop, period) {
                return;
            }
            match source.next_frame() {
                Some(frame) => {
                    if out.blocking_send(CaptureItem::Video(frame)).is_err() {
                        return;
                    }
                }
                None => {
                    debug!("video source ended");
                    return;
                }
            }
        });
    }

    if let Some(mut source) = audio {
        let stop = stop_rx;
        let period = Duration::from_secs_f64(window as f64 / sample_rate.max(1) as f64);
        std::thread::spawn(move || loop {
            if should_stop(&stop, period) {
                return;
            }
            match source.next_window() {
                Some(frame) => {
                    if out.blocking_send(CaptureItem::Audio(frame)).is_err() {
                        return;
                    }
                }
                None => {
                    debug!("audio source ended");
                    return;
                }
            }
        });
    }

    CaptureHandle { stop: Some(stop_tx) }
}

/// Built-in moving-gradient source: deterministic, no hardware.
pub struct TestPatternSource {
    width: u32,
    height: u32,
    seq: u32,
}

impl TestPatternSource {
    pub fn new(width: u32, height: u32) -> Self {
        TestPatternSource { width, height, seq: 0 }
    }
}

impl FrameSource for TestPatternSource {
    fn next_frame(&mut self) -> Option<VideoFrame> {
        let phase = self.seq;
        let mut pixels = Vec::with_capacity((self.width * self.height * 3) as usize);
        for y in 0..self.height {
            for x in 0..self.width {
                let r = ((x * 255 / self.width.max(1)) as u32 + phase) % 256;
                let g = (y * 255 / self.height.max(1)) % 256;
                let b = (phase * 3) % 256;
                pixels.push(r as u8);
                pixels.push(g as u8);
                pixels.push(b as u8);
            }
        }
        let frame = VideoFrame::rgb24(self.width, self.height, now_ns(), self.seq, pixels);
        self.seq = self.seq.wrapping_add(1);
        Some(frame)
    }
}

/// 440 Hz sine test tone.
pub struct ToneSource {
    sample_rate: u32,
    window: usize,
    seq: u32,
    phase: f32,
}

impl ToneSource {
    pub fn new(sample_rate: u32, window: usize) -> Self {
        ToneSource { sample_rate, window, seq: 0, phase: 0.0 }
    }
}

impl AudioSource for ToneSource {
    fn next_window(&mut self) -> Option<AudioFrame> {
        let step = 2.0 * std::f32::consts::PI * 440.0 / self.sample_rate as f32;
        let samples: Vec<f32> = (0..self.window)
            .map(|i| ((self.phase + i as f32 * step).sin()) * 0.2)
            .collect();
        self.phase = (self.phase + self.window as f32 * step) % (2.0 * std::f32::consts::PI);
        let frame = AudioFrame {
            sample_rate: self.sample_rate,
            channels: 1,
            capture_ns: now_ns(),
            seq: self.seq,
            samples,
        };
        self.seq = self.seq.wrapping_add(1);
        Some(frame)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pattern_frames_advance() {
        let mut source = TestPatternSource::new(8, 8);
        let a = source.next_frame().unwrap();
        let b = source.next_frame().unwrap();
        assert_eq!(a.width, 8);
        assert_eq!(a.data.len(), 8 * 8 * 3);
        assert_eq!(b.seq, a.seq + 1);
        assert_ne!(a.data, b.data);
    }

    #[test]
    fn tone_windows_are_bounded() {
        let mut source = ToneSource::new(48_000, 960);
        let window = source.next_window().unwrap();
        assert_eq!(window.samples.len(), 960);
        assert!(window.samples.iter().all(|s| s.abs() <= 0.2001));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn capture_threads_produce_and_stop() {
        let (tx, mut rx) = mpsc::channel(16);
        let mut handle = spawn_capture(
            Some(Box::new(TestPatternSource::new(4, 4))),
            Some(Box::new(ToneSource::new(48_000, 480))),
            60,
            48_000,
            480,
            tx,
        );
        let first = rx.recv().await.expect("capture item");
        assert!(matches!(first, CaptureItem::Video(_) | CaptureItem::Audio(_)));
        handle.stop();
    }
}
