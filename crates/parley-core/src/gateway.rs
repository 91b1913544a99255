use async_trait::async_trait;

use crate::errors::GatewayError;
use crate::inference::{InferenceRequest, InferenceResponse};

/// Boundary to the external inference backend.
///
/// One call per user message, no retries. Implementations hold no per-call state.
#[async_trait]
pub trait InferenceGateway: Send + Sync {
    fn name(&self) -> &str;

    async fn infer(&self, request: &InferenceRequest) -> Result<InferenceResponse, GatewayError>;
}
