//! Per-recipient audio mixing.
//!
//! Fixed cadence matching the window size: sum the latest window from
//! every other client, resampling to the recipient rate when needed, and
//! soft-limit the result so simultaneous speakers do not clip. Missing
//! input contributes silence. Runs independently of the video mixer.

/// Soft limiter keeping the sum inside (-1, 1) without hard clipping.
pub fn soft_clip(sample: f32) -> f32 {
    sample.tanh()
}

/// Sum any number of windows into one output window of `window` samples.
/// Shorter inputs are treated as silence-padded; the recipient's own
/// window is simply never passed in.
pub fn mix_windows(inputs: &[&[f32]], window: usize) -> Vec<f32> {
    let mut out = vec![0.0f32; window];
    for input in inputs {
        for (acc, sample) in out.iter_mut().zip(input.iter()) {
            *acc += *sample;
        }
    }
    for sample in out.iter_mut() {
        *sample = soft_clip(*sample);
    }
    out
}

/// Linear interpolation resampler. Good enough for voice windows; the
/// heavier DSP (AEC, ducking) stays behind its own filter boundary.
pub fn resample_linear(samples: &[f32], from_rate: u32, to_rate: u32) -> Vec<f32> {
    if from_rate == to_rate || samples.is_empty() {
        return samples.to_vec();
    }
    let out_len = (samples.len() as u64 * to_rate as u64 / from_rate as u64) as usize;
    let out_len = out_len.max(1);
    let step = samples.len() as f64 / out_len as f64;

    (0..out_len)
        .map(|i| {
            let pos = i as f64 * step;
            let idx = pos as usize;
            let frac = (pos - idx as f64) as f32;
            let a = samples[idx.min(samples.len() - 1)];
            let b = samples[(idx + 1).min(samples.len() - 1)];
            a + (b - a) * frac
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_mix_is_silence() {
        let out = mix_windows(&[], 960);
        assert_eq!(out.len(), 960);
        assert!(out.iter().all(|&s| s == 0.0));
    }

    #[test]
    fn quiet_inputs_sum_almost_linearly() {
        let a = vec![0.1f32; 4];
        let b = vec![0.05f32; 4];
        let out = mix_windows(&[&a, &b], 4);
        for sample in out {
            assert!((sample - 0.15).abs() < 0.01);
        }
    }

    #[test]
    fn loud_inputs_stay_inside_unit_range() {
        let a = vec![0.9f32; 8];
        let b = vec![0.9f32; 8];
        let c = vec![0.9f32; 8];
        let out = mix_windows(&[&a, &b, &c], 8);
        for sample in out {
            assert!(sample < 1.0 && sample > 0.9);
        }
    }

    #[test]
    fn short_input_pads_with_silence() {
        let a = vec![0.5f32; 2];
        let out = mix_windows(&[&a], 4);
        assert!(out[0] > 0.0 && out[1] > 0.0);
        assert_eq!(out[2], 0.0);
        assert_eq!(out[3], 0.0);
    }

    #[test]
    fn resample_halves_and_doubles() {
        let samples: Vec<f32> = (0..960).map(|i| (i as f32 / 60.0).sin()).collect();
        let down = resample_linear(&samples, 48_000, 24_000);
        assert_eq!(down.len(), 480);
        let up = resample_linear(&samples, 24_000, 48_000);
        assert_eq!(up.len(), 1920);
    }

    #[test]
    fn resample_same_rate_is_identity() {
        let samples = vec![0.25f32, -0.5, 0.75];
        assert_eq!(resample_linear(&samples, 48_000, 48_000), samples);
    }
}
