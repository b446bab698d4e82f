//! Wire audio codec: f32 samples ⇄ 16-bit little-endian PCM ⇄ base64.

use crate::error::{RealtimeError, RealtimeResult};
use base64::engine::general_purpose::STANDARD as B64;
use base64::Engine as _;
use serde::{Deserialize, Serialize};

/// One outbound block of microphone audio in transport format.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AudioFrame {
    /// e.g. `audio/pcm;rate=16000`
    pub mime_type: String,
    /// base64 of PCM16 LE
    pub data: String,
}

pub fn pcm_mime_type(sample_rate: u32) -> String {
    format!("audio/pcm;rate={}", sample_rate)
}

/// Convert normalized f32 samples to PCM16 LE bytes, clamping out-of-range input.
pub fn f32_to_pcm16(samples: &[f32]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(samples.len() * 2);
    for &s in samples {
        let v = (s.clamp(-1.0, 1.0) * 32767.0).round() as i16;
        bytes.extend_from_slice(&v.to_le_bytes());
    }
    bytes
}

/// Convert PCM16 LE bytes to f32 in -1.0..1.0. A trailing odd byte is an error.
pub fn pcm16_to_f32(bytes: &[u8]) -> RealtimeResult<Vec<f32>> {
    if bytes.len() % 2 != 0 {
        return Err(RealtimeError::Codec(format!(
            "PCM16 payload has odd length {}",
            bytes.len()
        )));
    }
    Ok(bytes
        .chunks_exact(2)
        .map(|c| i16::from_le_bytes([c[0], c[1]]) as f32 / 32768.0)
        .collect())
}

/// Encode one capture block as a wire frame.
pub fn encode_frame(samples: &[f32], sample_rate: u32) -> AudioFrame {
    AudioFrame {
        mime_type: pcm_mime_type(sample_rate),
        data: B64.encode(f32_to_pcm16(samples)),
    }
}

/// Decode one inbound base64 PCM16 chunk to f32 samples.
pub fn decode_chunk(data: &str) -> RealtimeResult<Vec<f32>> {
    let bytes = B64.decode(data.trim())?;
    pcm16_to_f32(&bytes)
}
