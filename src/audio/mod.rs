//! PCM audio utilities shared by both legs of the bridge.
//!
//! All audio in this crate is signed 16-bit little-endian PCM, mono. The
//! telephony leg runs at 16 kHz and the AI endpoint at 24 kHz; the
//! [`resampler`] module converts between the two.

pub mod resampler;

pub use resampler::{resample, resample_pcm};

/// Sample rate of the telephony media stream (Hz).
pub const TELEPHONY_SAMPLE_RATE: u32 = 16_000;

/// Sample rate expected and produced by the AI endpoint (Hz).
pub const AI_SAMPLE_RATE: u32 = 24_000;

/// Default normalized-RMS threshold below which a buffer counts as silence.
pub const DEFAULT_SILENCE_THRESHOLD: f64 = 0.01;

/// Reinterpret little-endian PCM16 bytes as samples. A trailing odd byte is
/// dropped.
pub fn pcm_to_samples(pcm: &[u8]) -> Vec<i16> {
    pcm.chunks_exact(2)
        .map(|b| i16::from_le_bytes([b[0], b[1]]))
        .collect()
}

/// Serialize samples back to little-endian PCM16 bytes.
pub fn samples_to_pcm(samples: &[i16]) -> Vec<u8> {
    let mut out = Vec::with_capacity(samples.len() * 2);
    for s in samples {
        out.extend_from_slice(&s.to_le_bytes());
    }
    out
}

/// RMS level of a buffer, normalized to full scale (0.0 to 1.0).
pub fn rms_level(samples: &[i16]) -> f64 {
    if samples.is_empty() {
        return 0.0;
    }
    let sum_sq: f64 = samples.iter().map(|&s| (s as f64) * (s as f64)).sum();
    (sum_sq / samples.len() as f64).sqrt() / i16::MAX as f64
}

/// Whether a PCM16 buffer is silent with respect to `threshold`.
///
/// Empty buffers are silent. The threshold compares against the normalized
/// RMS of the buffer, so `0.01` means one percent of full scale.
pub fn is_silent(pcm: &[u8], threshold: f64) -> bool {
    if pcm.is_empty() {
        return true;
    }
    rms_level(&pcm_to_samples(pcm)) < threshold
}

#[cfg(test)]
mod tests {
    use super::*;

    fn full_scale_sine(n: usize) -> Vec<i16> {
        (0..n)
            .map(|i| {
                let t = i as f64 / TELEPHONY_SAMPLE_RATE as f64;
                ((2.0 * std::f64::consts::PI * 440.0 * t).sin() * i16::MAX as f64) as i16
            })
            .collect()
    }

    #[test]
    fn test_pcm_round_trip() {
        let samples = vec![0i16, 1, -1, i16::MAX, i16::MIN, 12345];
        let pcm = samples_to_pcm(&samples);
        assert_eq!(pcm_to_samples(&pcm), samples);
    }

    #[test]
    fn test_odd_trailing_byte_dropped() {
        let samples = pcm_to_samples(&[0x01, 0x02, 0x03]);
        assert_eq!(samples, vec![0x0201]);
    }

    #[test]
    fn test_zeros_are_silent() {
        for n in [0usize, 1, 10, 320, 4096] {
            let pcm = samples_to_pcm(&vec![0i16; n]);
            assert!(is_silent(&pcm, DEFAULT_SILENCE_THRESHOLD), "n = {n}");
        }
    }

    #[test]
    fn test_full_scale_sine_is_not_silent() {
        for n in [16usize, 160, 1600] {
            let pcm = samples_to_pcm(&full_scale_sine(n));
            assert!(!is_silent(&pcm, DEFAULT_SILENCE_THRESHOLD), "n = {n}");
        }
    }

    #[test]
    fn test_rms_of_dc_buffer() {
        let samples = vec![i16::MAX; 100];
        let rms = rms_level(&samples);
        assert!((rms - 1.0).abs() < 1e-6);
    }
}
