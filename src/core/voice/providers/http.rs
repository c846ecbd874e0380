use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde_json::json;

use super::{SegmentRequest, SynthesisProvider};
use crate::core::voice::codec;
use crate::core::voice::types::{ProviderError, SAMPLE_RATE};

#[derive(Debug, Clone)]
pub struct HttpProviderConfig {
    pub endpoint: String,
    pub api_key: Option<String>,
    pub model: Option<String>,
}

/// OpenAI-compatible speech endpoint asked for raw PCM.
pub struct HttpProvider {
    client: Client,
    config: HttpProviderConfig,
}

impl HttpProvider {
    pub fn new(config: HttpProviderConfig) -> Self {
        Self {
            client: Client::new(),
            config,
        }
    }

    fn url(&self) -> String {
        format!("{}/v1/audio/speech", self.config.endpoint.trim_end_matches('/'))
    }
}

#[async_trait]
impl SynthesisProvider for HttpProvider {
    fn id(&self) -> &'static str {
        "http"
    }

    async fn synthesize(&self, request: &SegmentRequest) -> Result<Vec<i16>, ProviderError> {
        let mut body = json!({
            "input": request.text,
            "voice": request.voice,
            "language": request.language,
            "response_format": "pcm",
            "sample_rate": SAMPLE_RATE,
        });
        if let Some(model) = &self.config.model {
            body["model"] = json!(model);
        }

        let mut builder = self.client.post(self.url()).json(&body);
        if let Some(key) = &self.config.api_key {
            builder = builder.bearer_auth(key);
        }

        let resp = builder.send().await?;
        let status = resp.status();

        if status == StatusCode::TOO_MANY_REQUESTS {
            return Err(ProviderError::RateLimited);
        }
        if status.is_server_error() {
            let error = resp.text().await.unwrap_or_default();
            return Err(ProviderError::Unavailable(format!("{status}: {error}")));
        }
        if !status.is_success() {
            let error = resp.text().await.unwrap_or_default();
            return Err(ProviderError::Rejected(format!("{status}: {error}")));
        }

        let bytes = resp.bytes().await?;
        if bytes.is_empty() {
            return Err(ProviderError::EmptyOutput);
        }
        codec::bytes_to_pcm(&bytes).map_err(|e| ProviderError::Malformed(e.to_string()))
    }
}
