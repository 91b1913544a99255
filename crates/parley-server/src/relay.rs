use parley_core::errors::GatewayError;
use parley_core::inference::InferenceResponse;
use parley_core::message::{Message, Speaker};

/// Messages to broadcast for one inference outcome, in send order.
///
/// A failure becomes the fixed apology. A reply with audio yields the
/// transcript first and the audio second.
pub fn replies(outcome: &Result<InferenceResponse, GatewayError>) -> Vec<Message> {
    match outcome {
        Err(_) => vec![Message::inference_unavailable()],
        Ok(response) => {
            let mut out = vec![Message::text(response.text.clone(), Speaker::Ai)];
            if let Some(audio) = response.audio() {
                out.push(Message::audio(audio, Speaker::Ai));
            }
            out
        }
    }
}
