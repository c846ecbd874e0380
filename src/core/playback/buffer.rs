//! Accumulates decoded stream chunks into playable sample buffers.

use std::sync::Arc;

use crate::core::voice::codec::{self, CodecError};
use crate::core::voice::types::SAMPLE_RATE;

// ============================================================================
// AudioBuffer
// ============================================================================

/// Immutable mono float samples, cheap to clone.
#[derive(Debug, Clone, PartialEq)]
pub struct AudioBuffer {
    samples: Arc<[f32]>,
    sample_rate: u32,
}

impl AudioBuffer {
    pub fn new(samples: Vec<f32>) -> Self {
        Self {
            samples: samples.into(),
            sample_rate: SAMPLE_RATE,
        }
    }

    pub fn empty() -> Self {
        Self::new(Vec::new())
    }

    pub fn samples(&self) -> &[f32] {
        &self.samples
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Length in seconds
    pub fn duration(&self) -> f64 {
        self.samples.len() as f64 / self.sample_rate as f64
    }
}

/// Sample index for a time offset, clamped to `len`.
fn sample_index(offset_secs: f64, len: usize) -> usize {
    if offset_secs <= 0.0 || !offset_secs.is_finite() {
        return 0;
    }
    ((offset_secs * SAMPLE_RATE as f64).round() as usize).min(len)
}

// ============================================================================
// ClientStreamBuffer
// ============================================================================

/// Ordered list of decoded chunks for one playback session.
#[derive(Debug, Default)]
pub struct ClientStreamBuffer {
    chunks: Vec<AudioBuffer>,
    sample_count: usize,
    /// Concatenation of `chunks`, valid until the next append
    materialized: Option<AudioBuffer>,
}

impl ClientStreamBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Decodes a base64 wire payload and appends it. Returns the decoded
    /// chunk. A payload that fails to decode leaves the buffer untouched.
    pub fn append_chunk(&mut self, payload: &str) -> Result<AudioBuffer, CodecError> {
        let pcm = codec::decode_chunk(payload)?;
        Ok(self.append_pcm(&pcm))
    }

    /// Appends already decoded 16-bit samples.
    pub fn append_pcm(&mut self, pcm: &[i16]) -> AudioBuffer {
        let chunk = AudioBuffer::new(codec::normalize_samples(pcm));
        self.sample_count += chunk.len();
        self.chunks.push(chunk.clone());
        self.materialized = None;
        chunk
    }

    /// Accumulated duration in seconds.
    pub fn get_duration(&self) -> f64 {
        codec::duration_secs(self.sample_count)
    }

    pub fn sample_count(&self) -> usize {
        self.sample_count
    }

    pub fn chunk_count(&self) -> usize {
        self.chunks.len()
    }

    /// One contiguous buffer holding every chunk in append order.
    pub fn materialize(&mut self) -> AudioBuffer {
        if let Some(buffer) = &self.materialized {
            return buffer.clone();
        }

        let buffer = match self.chunks.as_slice() {
            [] => AudioBuffer::empty(),
            [only] => only.clone(),
            chunks => {
                let mut samples = Vec::with_capacity(self.sample_count);
                for chunk in chunks {
                    samples.extend_from_slice(chunk.samples());
                }
                AudioBuffer::new(samples)
            }
        };
        self.materialized = Some(buffer.clone());
        buffer
    }

    /// Contiguous buffer of everything from `offset` seconds onwards.
    pub fn tail_from(&mut self, offset: f64) -> AudioBuffer {
        let start = sample_index(offset, self.sample_count);
        if start == 0 {
            return self.materialize();
        }
        if start >= self.sample_count {
            return AudioBuffer::empty();
        }

        // Reuse the materialized copy when there is one, else walk the chunks
        if let Some(full) = &self.materialized {
            return AudioBuffer::new(full.samples()[start..].to_vec());
        }

        let mut samples = Vec::with_capacity(self.sample_count - start);
        let mut skipped = 0;
        for chunk in &self.chunks {
            let len = chunk.len();
            if skipped + len <= start {
                skipped += len;
                continue;
            }
            let from = start.saturating_sub(skipped);
            samples.extend_from_slice(&chunk.samples()[from..]);
            skipped += len;
        }
        AudioBuffer::new(samples)
    }

    /// Resets for a new session.
    pub fn clear(&mut self) {
        self.chunks.clear();
        self.sample_count = 0;
        self.materialized = None;
    }
}
