use std::time::{Duration, Instant};

use async_trait::async_trait;
use reqwest::header::CONTENT_TYPE;
use reqwest::Client;
use tracing::{debug, instrument};

use parley_core::errors::GatewayError;
use parley_core::gateway::InferenceGateway;
use parley_core::inference::{InferenceRequest, InferenceResponse};

/// Calls `POST {base_url}/chat` on the inference backend.
pub struct HttpGateway {
    client: Client,
    endpoint: String,
    timeout: Duration,
}

impl HttpGateway {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self, GatewayError> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| GatewayError::Network(e.to_string()))?;
        Ok(Self {
            client,
            endpoint: chat_endpoint(base_url),
            timeout,
        })
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    fn classify(&self, e: reqwest::Error) -> GatewayError {
        if e.is_timeout() {
            GatewayError::Timeout(self.timeout)
        } else {
            GatewayError::Network(e.to_string())
        }
    }
}

fn chat_endpoint(base_url: &str) -> String {
    format!("{}/chat", base_url.trim_end_matches('/'))
}

#[async_trait]
impl InferenceGateway for HttpGateway {
    fn name(&self) -> &str {
        "http"
    }

    #[instrument(skip_all, fields(session_id = %request.session_id))]
    async fn infer(&self, request: &InferenceRequest) -> Result<InferenceResponse, GatewayError> {
        let body = serde_json::to_vec(request).map_err(|e| GatewayError::Encode(e.to_string()))?;
        let started = Instant::now();

        let response = self
            .client
            .post(&self.endpoint)
            .header(CONTENT_TYPE, "application/json")
            .body(body)
            .send()
            .await
            .map_err(|e| self.classify(e))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(GatewayError::Status {
                status: status.as_u16(),
                body,
            });
        }

        let bytes = response.bytes().await.map_err(|e| self.classify(e))?;
        let reply: InferenceResponse = serde_json::from_slice(&bytes)?;

        debug!(
            elapsed_ms = started.elapsed().as_millis() as u64,
            has_audio = reply.audio().is_some(),
            emotion = reply.emotion.as_deref().unwrap_or("-"),
            "inference completed"
        );
        Ok(reply)
    }
}
