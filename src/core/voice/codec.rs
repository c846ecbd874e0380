//! PCM sample codecs.
//!
//! Wire chunks carry base64 of little-endian signed 16-bit samples; cached
//! artifacts are RIFF/WAVE files with the same sample format.

use std::io::Cursor;

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use thiserror::Error;

use super::types::{CHANNELS, SAMPLE_RATE};

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("Invalid base64 payload: {0}")]
    Base64(#[from] base64::DecodeError),

    #[error("PCM payload has odd length {0}")]
    OddLength(usize),

    #[error("WAV error: {0}")]
    Wav(#[from] hound::Error),

    #[error("Unsupported audio format: {0}")]
    Format(String),
}

pub type CodecResult<T> = Result<T, CodecError>;

/// Serializes samples as little-endian bytes.
pub fn pcm_to_bytes(samples: &[i16]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(samples.len() * 2);
    for sample in samples {
        bytes.extend_from_slice(&sample.to_le_bytes());
    }
    bytes
}

/// Parses little-endian 16-bit samples.
pub fn bytes_to_pcm(bytes: &[u8]) -> CodecResult<Vec<i16>> {
    if bytes.len() % 2 != 0 {
        return Err(CodecError::OddLength(bytes.len()));
    }
    Ok(bytes
        .chunks_exact(2)
        .map(|pair| i16::from_le_bytes([pair[0], pair[1]]))
        .collect())
}

/// Encodes samples as a wire chunk payload.
pub fn encode_chunk(samples: &[i16]) -> String {
    STANDARD.encode(pcm_to_bytes(samples))
}

/// Decodes a wire chunk payload.
pub fn decode_chunk(data: &str) -> CodecResult<Vec<i16>> {
    let bytes = STANDARD.decode(data.trim())?;
    bytes_to_pcm(&bytes)
}

/// Maps signed 16-bit samples onto [-1.0, 1.0].
pub fn normalize_samples(samples: &[i16]) -> Vec<f32> {
    samples
        .iter()
        .map(|&s| (s as f32 / 32768.0).clamp(-1.0, 1.0))
        .collect()
}

/// Duration in seconds of `sample_count` mono samples at the fixed rate.
pub fn duration_secs(sample_count: usize) -> f64 {
    sample_count as f64 / SAMPLE_RATE as f64
}

fn wav_spec() -> hound::WavSpec {
    hound::WavSpec {
        channels: CHANNELS,
        sample_rate: SAMPLE_RATE,
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    }
}

/// Wraps samples in a WAV container.
pub fn wav_bytes(samples: &[i16]) -> CodecResult<Vec<u8>> {
    let mut cursor = Cursor::new(Vec::with_capacity(44 + samples.len() * 2));
    {
        let mut writer = hound::WavWriter::new(&mut cursor, wav_spec())?;
        for &sample in samples {
            writer.write_sample(sample)?;
        }
        writer.finalize()?;
    }
    Ok(cursor.into_inner())
}

/// Reads samples back from a WAV container, rejecting anything that is not
/// mono 16-bit at the service sample rate.
pub fn read_wav(bytes: &[u8]) -> CodecResult<Vec<i16>> {
    let mut reader = hound::WavReader::new(Cursor::new(bytes))?;
    let spec = reader.spec();
    if spec.channels != CHANNELS
        || spec.bits_per_sample != 16
        || spec.sample_format != hound::SampleFormat::Int
        || spec.sample_rate != SAMPLE_RATE
    {
        return Err(CodecError::Format(format!(
            "{} ch / {} bit / {} Hz",
            spec.channels, spec.bits_per_sample, spec.sample_rate
        )));
    }
    let samples = reader.samples::<i16>().collect::<Result<Vec<_>, _>>()?;
    Ok(samples)
}
