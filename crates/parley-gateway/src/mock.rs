use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;

use parley_core::errors::GatewayError;
use parley_core::gateway::InferenceGateway;
use parley_core::inference::{InferenceRequest, InferenceResponse};

/// Pre-programmed replies for deterministic testing without a backend.
#[derive(Clone, Debug)]
pub enum MockReply {
    Reply(InferenceResponse),
    Error(GatewayError),
    /// Wait a duration, then resolve the inner reply.
    Delay(Duration, Box<MockReply>),
}

impl MockReply {
    pub fn text(text: &str) -> Self {
        Self::Reply(InferenceResponse::text(text))
    }

    pub fn text_and_audio(text: &str, audio_data: &str) -> Self {
        Self::Reply(InferenceResponse::text(text).with_audio(audio_data))
    }

    pub fn delayed(delay: Duration, inner: MockReply) -> Self {
        Self::Delay(delay, Box::new(inner))
    }
}

/// Gateway that answers from a script, in order, and records what it was asked.
pub struct MockGateway {
    replies: Vec<MockReply>,
    /// Keep answering with the last scripted reply once the script runs out.
    repeat_last: bool,
    call_count: AtomicUsize,
    requests: Mutex<Vec<InferenceRequest>>,
}

impl MockGateway {
    pub fn new(replies: Vec<MockReply>) -> Self {
        Self {
            replies,
            repeat_last: false,
            call_count: AtomicUsize::new(0),
            requests: Mutex::new(Vec::new()),
        }
    }

    /// Answer every call with the same reply.
    pub fn always(reply: MockReply) -> Self {
        Self {
            repeat_last: true,
            ..Self::new(vec![reply])
        }
    }

    pub fn call_count(&self) -> usize {
        self.call_count.load(Ordering::Relaxed)
    }

    /// Every request received so far, in call order.
    pub fn requests(&self) -> Vec<InferenceRequest> {
        self.requests.lock().clone()
    }

    fn scripted(&self, idx: usize) -> Option<&MockReply> {
        match self.replies.get(idx) {
            Some(reply) => Some(reply),
            None if self.repeat_last => self.replies.last(),
            None => None,
        }
    }
}

#[async_trait]
impl InferenceGateway for MockGateway {
    fn name(&self) -> &str {
        "mock"
    }

    async fn infer(&self, request: &InferenceRequest) -> Result<InferenceResponse, GatewayError> {
        let idx = self.call_count.fetch_add(1, Ordering::Relaxed);
        self.requests.lock().push(request.clone());

        let Some(reply) = self.scripted(idx) else {
            return Err(GatewayError::Network(format!(
                "MockGateway: no reply configured for call {idx}"
            )));
        };

        resolve(reply).await
    }
}

/// Unrolls nested delays iteratively to avoid recursive async.
async fn resolve(reply: &MockReply) -> Result<InferenceResponse, GatewayError> {
    let mut current = reply;
    loop {
        match current {
            MockReply::Reply(response) => return Ok(response.clone()),
            MockReply::Error(e) => return Err(e.clone()),
            MockReply::Delay(duration, inner) => {
                tokio::time::sleep(*duration).await;
                current = inner;
            }
        }
    }
}
