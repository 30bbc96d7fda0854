//! PCM audio codec and resampler.
//!
//! The wire carries little-endian 16-bit mono PCM; sessions work on
//! `f32` sample buffers in `[-1, 1]`. Conversions clip on every
//! float→int step. The resampler is stateless and deterministic, so any
//! number of sessions can call it concurrently: linear interpolation
//! when upsampling, block averaging when downsampling.

pub mod ingest;

use crate::error::SessionError;

/// Sample width of the wire format (PCM16).
pub const SAMPLE_BYTES: usize = 2;

/// A fixed chunk of mono PCM samples. Immutable once produced;
/// ownership moves between pipeline stages.
#[derive(Debug, Clone, PartialEq)]
pub struct AudioFrame {
    /// Samples in `[-1, 1]`.
    pub samples: Vec<f32>,
    /// Capture rate of `samples`, in Hz.
    pub sample_rate: u32,
    /// Monotonic ingest sequence number, assigned by the transport.
    pub seq: u64,
}

impl AudioFrame {
    /// Duration of this frame in milliseconds.
    pub fn duration_ms(&self) -> f64 {
        self.samples.len() as f64 * 1000.0 / self.sample_rate as f64
    }

    /// Root-mean-square energy, used by the optional ingest VAD.
    pub fn rms(&self) -> f32 {
        if self.samples.is_empty() {
            return 0.0;
        }
        let sum: f32 = self.samples.iter().map(|s| s * s).sum();
        (sum / self.samples.len() as f32).sqrt()
    }
}

/// Decode a PCM16LE byte buffer into an [`AudioFrame`].
///
/// Fails with [`SessionError::MalformedFrame`] when the byte length is
/// not a multiple of the sample width.
pub fn decode(bytes: &[u8], sample_rate: u32, seq: u64) -> Result<AudioFrame, SessionError> {
    if bytes.len() % SAMPLE_BYTES != 0 {
        return Err(SessionError::MalformedFrame(format!(
            "{} bytes is not a multiple of the {SAMPLE_BYTES}-byte sample width",
            bytes.len()
        )));
    }
    let samples = bytes
        .chunks_exact(SAMPLE_BYTES)
        .map(|pair| i16::from_le_bytes([pair[0], pair[1]]) as f32 / 32768.0)
        .collect();
    Ok(AudioFrame {
        samples,
        sample_rate,
        seq,
    })
}

/// Encode samples back to PCM16LE bytes. Exact inverse of [`decode`]
/// for the same rate; out-of-range samples are clipped.
pub fn encode(samples: &[f32]) -> Vec<u8> {
    let mut out = Vec::with_capacity(samples.len() * SAMPLE_BYTES);
    for &s in samples {
        let clipped = s.clamp(-1.0, 1.0);
        // Scale chosen so decode(encode(x)) == x for all i16-exact inputs.
        let v = if clipped >= 0.0 {
            (clipped * 32767.0).round() as i16
        } else {
            (clipped * 32768.0).round() as i16
        };
        out.extend_from_slice(&v.to_le_bytes());
    }
    out
}

/// Resample `input` from `from_rate` to `to_rate`.
///
/// `from_rate == to_rate` is the identity. Upsampling interpolates
/// linearly between neighbors; downsampling averages each source block
/// so high-frequency content is attenuated rather than aliased.
pub fn resample(input: &[f32], from_rate: u32, to_rate: u32) -> Vec<f32> {
    if from_rate == to_rate || input.is_empty() {
        return input.to_vec();
    }
    if to_rate > from_rate {
        resample_linear(input, from_rate, to_rate)
    } else {
        resample_average(input, from_rate, to_rate)
    }
}

fn resample_linear(input: &[f32], from_rate: u32, to_rate: u32) -> Vec<f32> {
    let ratio = from_rate as f64 / to_rate as f64;
    let out_len = ((input.len() as f64) / ratio).floor() as usize;
    let mut output = Vec::with_capacity(out_len);
    for i in 0..out_len {
        let src_idx = i as f64 * ratio;
        let idx0 = src_idx.floor() as usize;
        let frac = (src_idx - idx0 as f64) as f32;
        let s0 = input.get(idx0).copied().unwrap_or(0.0);
        let s1 = input.get(idx0 + 1).copied().unwrap_or(s0);
        output.push(s0 + frac * (s1 - s0));
    }
    output
}

fn resample_average(input: &[f32], from_rate: u32, to_rate: u32) -> Vec<f32> {
    let ratio = from_rate as f64 / to_rate as f64;
    let out_len = ((input.len() as f64) / ratio).floor() as usize;
    let mut output = Vec::with_capacity(out_len);
    for i in 0..out_len {
        let start = (i as f64 * ratio).floor() as usize;
        let end = (((i + 1) as f64 * ratio).floor() as usize)
            .max(start + 1)
            .min(input.len());
        let block = &input[start..end];
        let avg = block.iter().sum::<f32>() / block.len() as f32;
        output.push(avg);
    }
    output
}
