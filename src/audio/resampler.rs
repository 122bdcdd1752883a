//! Whole-buffer sample-rate conversion between the two legs of the bridge.
//!
//! The telephony leg runs at 16 kHz and the AI endpoint at 24 kHz — a 2:3
//! ratio, so neither direction is an integer multiple and naive
//! decimation/duplication would alias audibly. Conversion uses rubato's
//! FFT-based resampler on the full buffer, with the filter delay compensated
//! so the output lines up with the input and has exactly
//! `round(len * to_rate / from_rate)` samples.
//!
//! Failures never propagate: a frame at the wrong rate is better than a
//! dropped frame, so any internal error returns the input unchanged.

use std::sync::atomic::{AtomicBool, Ordering};

use rubato::{FftFixedIn, Resampler};

use super::{pcm_to_samples, samples_to_pcm};

/// Inputs shorter than this fall back to linear interpolation; the FFT
/// resampler needs a reasonable chunk to work with.
const MIN_FFT_INPUT: usize = 64;

/// Frames per process() call for the FFT resampler.
const CHUNK_SIZE: usize = 1024;

/// Flush at most this many zero chunks while draining the filter delay.
const MAX_FLUSH_CHUNKS: usize = 16;

static RESAMPLE_FAILURE_WARNED: AtomicBool = AtomicBool::new(false);

/// Expected output length for a buffer of `len` samples.
fn expected_output_len(len: usize, from_rate: u32, to_rate: u32) -> usize {
    ((len as f64) * (to_rate as f64) / (from_rate as f64)).round() as usize
}

/// Resample a buffer of mono PCM16 samples from `from_rate` to `to_rate`.
///
/// Empty input returns empty output. If conversion fails internally the
/// original buffer is returned unchanged (with a warning logged once).
pub fn resample(samples: &[i16], from_rate: u32, to_rate: u32) -> Vec<i16> {
    if samples.is_empty() || from_rate == to_rate || from_rate == 0 || to_rate == 0 {
        return samples.to_vec();
    }

    let expected = expected_output_len(samples.len(), from_rate, to_rate);

    if samples.len() < MIN_FFT_INPUT {
        return resample_linear(samples, expected);
    }

    match resample_fft(samples, from_rate, to_rate, expected) {
        Ok(out) => out,
        Err(e) => {
            if !RESAMPLE_FAILURE_WARNED.swap(true, Ordering::Relaxed) {
                tracing::warn!(
                    "Resampling {} -> {} Hz failed, passing audio through unchanged \
                     (further warnings suppressed): {}",
                    from_rate,
                    to_rate,
                    e
                );
            }
            samples.to_vec()
        }
    }
}

/// Byte-level convenience wrapper over [`resample`] for PCM16LE buffers.
pub fn resample_pcm(pcm: &[u8], from_rate: u32, to_rate: u32) -> Vec<u8> {
    if pcm.is_empty() || from_rate == to_rate {
        return pcm.to_vec();
    }
    samples_to_pcm(&resample(&pcm_to_samples(pcm), from_rate, to_rate))
}

fn resample_fft(
    samples: &[i16],
    from_rate: u32,
    to_rate: u32,
    expected: usize,
) -> Result<Vec<i16>, String> {
    let chunk = samples.len().min(CHUNK_SIZE);
    let mut resampler =
        FftFixedIn::<f64>::new(from_rate as usize, to_rate as usize, chunk, 2, 1)
            .map_err(|e| e.to_string())?;

    // The resampler rounds the requested chunk size up to its internal FFT
    // geometry; it dictates the exact frame count every process() call takes.
    let frames_per_call = resampler.input_frames_next();

    // Output is shifted by the filter delay; collect enough samples to skip
    // past it and still cover the expected length.
    let delay = resampler.output_delay();
    let mut collected: Vec<f64> = Vec::with_capacity(expected + delay + frames_per_call);

    let mut input = vec![0.0f64; frames_per_call];
    let mut pos = 0;
    while pos < samples.len() {
        let take = (samples.len() - pos).min(frames_per_call);
        for (dst, src) in input.iter_mut().zip(&samples[pos..pos + take]) {
            *dst = *src as f64;
        }
        for slot in input.iter_mut().skip(take) {
            *slot = 0.0;
        }
        let frames = resampler
            .process(&[input.clone()], None)
            .map_err(|e| e.to_string())?;
        collected.extend_from_slice(&frames[0]);
        pos += take;
    }

    // Drain the delayed tail with zero input.
    let zeros = vec![vec![0.0f64; frames_per_call]];
    let mut flushed = 0;
    while collected.len() < delay + expected && flushed < MAX_FLUSH_CHUNKS {
        let frames = resampler.process(&zeros, None).map_err(|e| e.to_string())?;
        collected.extend_from_slice(&frames[0]);
        flushed += 1;
    }

    let mut out = Vec::with_capacity(expected);
    for i in 0..expected {
        let v = collected.get(delay + i).copied().unwrap_or(0.0);
        out.push(v.round().clamp(i16::MIN as f64, i16::MAX as f64) as i16);
    }
    Ok(out)
}

/// Linear interpolation fallback for buffers too short for the FFT path.
fn resample_linear(samples: &[i16], expected: usize) -> Vec<i16> {
    if expected == 0 {
        return Vec::new();
    }
    if samples.len() == 1 {
        return vec![samples[0]; expected];
    }

    let step = (samples.len() - 1) as f64 / (expected.max(2) - 1) as f64;
    (0..expected)
        .map(|i| {
            let src = i as f64 * step;
            let idx = (src.floor() as usize).min(samples.len() - 2);
            let frac = src - idx as f64;
            let a = samples[idx] as f64;
            let b = samples[idx + 1] as f64;
            (a + (b - a) * frac).round() as i16
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::rms_level;

    fn sine(n: usize, rate: u32, freq: f64, amplitude: f64) -> Vec<i16> {
        (0..n)
            .map(|i| {
                let t = i as f64 / rate as f64;
                ((2.0 * std::f64::consts::PI * freq * t).sin() * amplitude) as i16
            })
            .collect()
    }

    #[test]
    fn test_empty_input_returns_empty() {
        assert!(resample(&[], 16_000, 24_000).is_empty());
        assert!(resample_pcm(&[], 24_000, 16_000).is_empty());
    }

    #[test]
    fn test_same_rate_is_identity() {
        let samples = sine(320, 16_000, 440.0, 10_000.0);
        assert_eq!(resample(&samples, 16_000, 16_000), samples);
    }

    #[test]
    fn test_upsample_length_ratio() {
        // 320 samples at 16 kHz (20 ms) must become 480 samples at 24 kHz.
        let samples = sine(320, 16_000, 440.0, 10_000.0);
        let up = resample(&samples, 16_000, 24_000);
        assert_eq!(up.len(), 480);
    }

    #[test]
    fn test_downsample_length_ratio() {
        let samples = sine(480, 24_000, 440.0, 10_000.0);
        let down = resample(&samples, 24_000, 16_000);
        assert_eq!(down.len(), 320);
    }

    #[test]
    fn test_pcm_byte_lengths() {
        // 320 bytes of 16 kHz PCM forward to 480 bytes of 24 kHz PCM.
        let pcm = crate::audio::samples_to_pcm(&sine(160, 16_000, 440.0, 10_000.0));
        assert_eq!(pcm.len(), 320);
        let up = resample_pcm(&pcm, 16_000, 24_000);
        assert_eq!(up.len(), 480);
    }

    #[test]
    fn test_round_trip_length_within_one_sample() {
        for n in [100usize, 101, 320, 333, 1600, 4801] {
            let samples = sine(n, 16_000, 440.0, 10_000.0);
            let up = resample(&samples, 16_000, 24_000);
            let back = resample(&up, 24_000, 16_000);
            let diff = back.len() as i64 - n as i64;
            assert!(diff.abs() <= 1, "n = {n}, got {}", back.len());
        }
    }

    #[test]
    fn test_round_trip_preserves_energy() {
        let samples = sine(1600, 16_000, 440.0, 10_000.0);
        let up = resample(&samples, 16_000, 24_000);
        let back = resample(&up, 24_000, 16_000);

        let original = rms_level(&samples);
        let recovered = rms_level(&back);
        let deviation = (recovered - original).abs() / original;
        assert!(
            deviation < 0.10,
            "RMS deviated by {:.1}% ({} -> {})",
            deviation * 100.0,
            original,
            recovered
        );
    }

    #[test]
    fn test_short_buffer_uses_linear_path() {
        let samples = sine(32, 16_000, 440.0, 10_000.0);
        let up = resample(&samples, 16_000, 24_000);
        assert_eq!(up.len(), 48);
    }

    #[test]
    fn test_silence_stays_silent() {
        let silence = vec![0i16; 320];
        let up = resample(&silence, 16_000, 24_000);
        assert_eq!(up.len(), 480);
        assert!(rms_level(&up) < 1e-4);
    }
}
