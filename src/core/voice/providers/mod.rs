//! Synthesis providers.

pub mod http;

use async_trait::async_trait;

use super::types::ProviderError;

pub use http::{HttpProvider, HttpProviderConfig};

/// One segment of text to synthesize.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SegmentRequest {
    pub text: String,
    pub voice: String,
    pub language: String,
    /// 0-based position of the segment within its task
    pub segment_index: usize,
}

/// A speech backend returning mono 16-bit PCM at the service sample rate.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait SynthesisProvider: Send + Sync {
    fn id(&self) -> &'static str;

    async fn synthesize(&self, request: &SegmentRequest) -> Result<Vec<i16>, ProviderError>;
}
