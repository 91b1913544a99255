use serde::{Deserialize, Serialize};

use crate::ids::SessionId;
use crate::message::{Message, MessageKind};

/// Body of `POST /chat`. Exactly one of `message` / `audio_data` is set.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct InferenceRequest {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    /// Base64 encoded audio.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub audio_data: Option<String>,
    pub session_id: SessionId,
}

impl InferenceRequest {
    pub fn text(text: impl Into<String>, session_id: SessionId) -> Self {
        Self {
            message: Some(text.into()),
            audio_data: None,
            session_id,
        }
    }

    pub fn audio(audio_data: impl Into<String>, session_id: SessionId) -> Self {
        Self {
            message: None,
            audio_data: Some(audio_data.into()),
            session_id,
        }
    }

    /// Audio messages go out as `audio_data`; every other kind as `message`.
    pub fn from_message(message: &Message, session_id: SessionId) -> Self {
        match message.kind {
            MessageKind::Audio => Self::audio(message.content.clone(), session_id),
            MessageKind::Text | MessageKind::System => Self::text(message.content.clone(), session_id),
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct InferenceResponse {
    pub text: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub audio_data: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub emotion: Option<String>,
}

impl InferenceResponse {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            ..Self::default()
        }
    }

    pub fn with_audio(mut self, audio_data: impl Into<String>) -> Self {
        self.audio_data = Some(audio_data.into());
        self
    }

    pub fn with_emotion(mut self, emotion: impl Into<String>) -> Self {
        self.emotion = Some(emotion.into());
        self
    }

    /// The synthesized speech, if the backend produced any.
    ///
    /// Backends report a failed synthesis as an empty string, which counts as absent.
    pub fn audio(&self) -> Option<&str> {
        self.audio_data.as_deref().filter(|a| !a.is_empty())
    }
}
