//! # PCM Codec
//!
//! Converts between floating-point samples and the wire representation used by the
//! live backend: little-endian signed 16-bit PCM, base64-encoded inside a JSON blob.
//!
//! ## Conversion:
//! - **Encode**: `round(sample * 32768)`, saturated to the i16 range
//! - **Decode**: `int16 / 32768`, de-interleaved when there is more than one channel
//!
//! No dithering and no resampling happen here; callers must already agree on the
//! sample rate (16 kHz going out, 24 kHz coming back).

use crate::error::{AppResult, AssistantError};
use base64::{engine::general_purpose, Engine as _};
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use serde::{Deserialize, Serialize};
use std::io::Cursor;

/// Full-scale value used for both directions of the conversion.
pub const PCM_SCALE: f32 = 32768.0;

/// Base64 PCM payload plus a mime tag carrying the sample rate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WireAudioBlob {
    pub data: String,
    pub mime_type: String,
}

/// A decoded block of audio ready to be scheduled for playback.
#[derive(Debug, Clone, PartialEq)]
pub struct DecodedBuffer {
    pub sample_rate: u32,
    /// One sample vector per channel, all the same length
    pub channels: Vec<Vec<f32>>,
}

impl DecodedBuffer {
    /// Number of sample frames (samples per channel).
    pub fn frames(&self) -> usize {
        self.channels.first().map(|c| c.len()).unwrap_or(0)
    }

    /// Playback length in seconds.
    pub fn duration(&self) -> f64 {
        if self.sample_rate == 0 {
            return 0.0;
        }
        self.frames() as f64 / self.sample_rate as f64
    }
}

/// Mime tag for raw PCM at the given rate, e.g. `audio/pcm;rate=16000`.
pub fn pcm_mime_type(sample_rate: u32) -> String {
    format!("audio/pcm;rate={}", sample_rate)
}

/// Extract the `rate=` parameter from a PCM mime tag. A zero rate counts as absent.
pub fn parse_mime_rate(mime_type: &str) -> Option<u32> {
    mime_type
        .split(';')
        .filter_map(|part| part.trim().strip_prefix("rate="))
        .find_map(|rate| rate.trim().parse::<u32>().ok())
        .filter(|rate| *rate > 0)
}

/// Scale one float sample to 16-bit PCM.
///
/// Out-of-range input saturates instead of wrapping, so `1.0` stays at the positive
/// rail. NaN maps to silence.
pub(crate) fn sample_to_i16(sample: f32) -> i16 {
    (sample * PCM_SCALE).round().clamp(i16::MIN as f32, i16::MAX as f32) as i16
}

/// Encode float samples as base64 little-endian 16-bit PCM.
pub fn encode(samples: &[f32]) -> String {
    let mut bytes = Vec::with_capacity(samples.len() * 2);
    for &sample in samples {
        // Writing into a Vec cannot fail
        let _ = bytes.write_i16::<LittleEndian>(sample_to_i16(sample));
    }
    general_purpose::STANDARD.encode(bytes)
}

/// Encode a captured chunk into the blob sent as realtime input.
pub fn create_blob(samples: &[f32], sample_rate: u32) -> WireAudioBlob {
    WireAudioBlob {
        data: encode(samples),
        mime_type: pcm_mime_type(sample_rate),
    }
}

/// Undo the base64 layer of an inbound payload.
pub fn decode_base64(data: &str) -> AppResult<Vec<u8>> {
    Ok(general_purpose::STANDARD.decode(data.trim())?)
}

/// Decode little-endian 16-bit PCM into one float vector per channel.
///
/// ## Returns:
/// - **Ok(channels)**: `channels[c][i]` is frame `i` of channel `c`
/// - **Err(Decode)**: odd byte count, or a byte count that does not divide into whole frames
pub fn decode(bytes: &[u8], num_channels: usize) -> AppResult<Vec<Vec<f32>>> {
    if num_channels == 0 {
        return Err(AssistantError::Decode("channel count must be at least 1".to_string()));
    }
    if bytes.len() % 2 != 0 {
        return Err(AssistantError::Decode(format!(
            "PCM payload has odd length {}",
            bytes.len()
        )));
    }

    let total_samples = bytes.len() / 2;
    if total_samples % num_channels != 0 {
        return Err(AssistantError::Decode(format!(
            "{} samples do not split into {} channels",
            total_samples, num_channels
        )));
    }

    let frames = total_samples / num_channels;
    let mut channels = vec![Vec::with_capacity(frames); num_channels];
    let mut cursor = Cursor::new(bytes);
    let mut index = 0usize;
    while let Ok(sample) = cursor.read_i16::<LittleEndian>() {
        channels[index % num_channels].push(sample as f32 / PCM_SCALE);
        index += 1;
    }

    Ok(channels)
}

/// Decode raw PCM bytes into a playable buffer at the given rate.
pub fn decode_audio_data(bytes: &[u8], sample_rate: u32, num_channels: usize) -> AppResult<DecodedBuffer> {
    Ok(DecodedBuffer {
        sample_rate,
        channels: decode(bytes, num_channels)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn round_trip(samples: &[f32]) -> Vec<f32> {
        let bytes = decode_base64(&encode(samples)).unwrap();
        decode(&bytes, 1).unwrap().remove(0)
    }

    #[test]
    fn test_silent_buffer_round_trip() {
        let silence = vec![0.0f32; 4096];
        let decoded = round_trip(&silence);
        assert_eq!(decoded.len(), 4096);
        assert!(decoded.iter().all(|&s| s == 0.0));
    }

    #[test]
    fn test_round_trip_within_quantization() {
        let samples: Vec<f32> = (0..2000)
            .map(|i| ((i as f32) * 0.013).sin() * 0.9)
            .chain([1.0, -1.0, 0.5, -0.5, 1e-6])
            .collect();
        let decoded = round_trip(&samples);

        assert_eq!(decoded.len(), samples.len());
        for (original, back) in samples.iter().zip(decoded.iter()) {
            assert!(
                (original - back).abs() <= 1.0 / PCM_SCALE + f32::EPSILON,
                "{} decoded as {}",
                original,
                back
            );
        }
    }

    #[test]
    fn test_encode_saturates_instead_of_wrapping() {
        let bytes = decode_base64(&encode(&[1.0, 2.5, -3.0])).unwrap();
        let mut cursor = Cursor::new(bytes);
        assert_eq!(cursor.read_i16::<LittleEndian>().unwrap(), i16::MAX);
        assert_eq!(cursor.read_i16::<LittleEndian>().unwrap(), i16::MAX);
        assert_eq!(cursor.read_i16::<LittleEndian>().unwrap(), i16::MIN);
    }

    #[test]
    fn test_decode_deinterleaves_channels() {
        let mut bytes = Vec::new();
        for sample in [100i16, -100, 200, -200, 300, -300] {
            bytes.write_i16::<LittleEndian>(sample).unwrap();
        }
        let channels = decode(&bytes, 2).unwrap();
        assert_eq!(channels.len(), 2);
        assert_eq!(channels[0], vec![100.0 / PCM_SCALE, 200.0 / PCM_SCALE, 300.0 / PCM_SCALE]);
        assert_eq!(channels[1], vec![-100.0 / PCM_SCALE, -200.0 / PCM_SCALE, -300.0 / PCM_SCALE]);
    }

    #[test]
    fn test_decode_rejects_malformed_input() {
        assert!(matches!(decode(&[0u8; 3], 1), Err(AssistantError::Decode(_))));
        assert!(matches!(decode(&[0u8; 6], 2), Err(AssistantError::Decode(_))));
        assert!(decode(&[0u8; 4], 0).is_err());
        assert!(decode_base64("***").is_err());
    }

    #[test]
    fn test_buffer_duration_and_mime() {
        let buffer = decode_audio_data(&vec![0u8; 48000], 24000, 1).unwrap();
        assert_eq!(buffer.frames(), 24000);
        assert!((buffer.duration() - 1.0).abs() < 1e-9);

        let blob = create_blob(&[0.0; 4], 16000);
        assert_eq!(blob.mime_type, "audio/pcm;rate=16000");
        assert_eq!(parse_mime_rate("audio/pcm;rate=24000"), Some(24000));
        assert_eq!(parse_mime_rate("audio/pcm"), None);
    }

    #[test]
    fn test_zero_or_garbage_rate_is_absent() {
        assert_eq!(parse_mime_rate("audio/pcm;rate=0"), None);
        assert_eq!(parse_mime_rate("audio/pcm; rate=fast"), None);
        assert_eq!(parse_mime_rate("audio/pcm; rate= 8000 "), Some(8000));
    }
}
