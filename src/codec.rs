//! Conversions between 16-bit PCM bytes, float samples and base64 text.
//!
//! The wire protocol is JSON, so every media payload travels as base64.
//! PCM is always signed 16-bit little-endian, mono.

use crate::error::CodecError;
use base64::engine::general_purpose;
use base64::Engine;

/// Microphone rate expected by the service.
pub const CAPTURE_SAMPLE_RATE: u32 = 16_000;
/// Rate of synthesized speech sent back by the service.
pub const PLAYBACK_SAMPLE_RATE: u32 = 24_000;

pub const AUDIO_MIME_TYPE: &str = "audio/pcm;rate=16000";
pub const JPEG_MIME_TYPE: &str = "image/jpeg";

pub fn bytes_to_base64(bytes: &[u8]) -> String {
    general_purpose::STANDARD.encode(bytes)
}

pub fn base64_to_bytes(text: &str) -> Result<Vec<u8>, CodecError> {
    Ok(general_purpose::STANDARD.decode(text)?)
}

/// Decode little-endian PCM16 into floats in `[-1.0, 1.0)`.
pub fn pcm16_to_f32(bytes: &[u8]) -> Result<Vec<f32>, CodecError> {
    if bytes.len() % 2 != 0 {
        return Err(CodecError::OddLength(bytes.len()));
    }

    Ok(bytes
        .chunks_exact(2)
        .map(|chunk| i16::from_le_bytes([chunk[0], chunk[1]]) as f32 / 32768.0)
        .collect())
}

/// Encode floats as little-endian PCM16, clamping out-of-range input.
pub fn f32_to_pcm16(samples: &[f32]) -> Vec<u8> {
    let mut out = Vec::with_capacity(samples.len() * 2);
    for &sample in samples {
        out.extend_from_slice(&f32_to_i16(sample).to_le_bytes());
    }
    out
}

fn f32_to_i16(sample: f32) -> i16 {
    if sample.is_nan() {
        return 0;
    }
    let clamped = sample.clamp(-1.0, 1.0);
    // Asymmetric scale so -1.0 lands on i16::MIN and 1.0 on i16::MAX
    let scaled = if clamped < 0.0 {
        clamped * 32768.0
    } else {
        clamped * 32767.0
    };
    scaled.round() as i16
}

/// Playback length of a mono float buffer in seconds.
pub fn duration_secs(sample_count: usize, sample_rate: u32) -> f64 {
    sample_count as f64 / sample_rate as f64
}
