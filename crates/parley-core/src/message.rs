use serde::{Deserialize, Serialize};

/// Shown to clients whenever the inference backend cannot produce a reply.
pub const INFERENCE_UNAVAILABLE: &str = "AI 服务暂时不可用，请稍后再试。";

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageKind {
    Text,
    /// `content` carries a base64 audio payload.
    Audio,
    System,
}

/// Who produced a message.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Speaker {
    User,
    Ai,
}

/// The frame exchanged with clients: `{"type", "content", "sender"}`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    #[serde(rename = "type")]
    pub kind: MessageKind,
    pub content: String,
    pub sender: Speaker,
}

impl Message {
    pub fn new(kind: MessageKind, content: impl Into<String>, sender: Speaker) -> Self {
        Self {
            kind,
            content: content.into(),
            sender,
        }
    }

    pub fn text(content: impl Into<String>, sender: Speaker) -> Self {
        Self::new(MessageKind::Text, content, sender)
    }

    pub fn audio(content: impl Into<String>, sender: Speaker) -> Self {
        Self::new(MessageKind::Audio, content, sender)
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self::new(MessageKind::System, content, Speaker::Ai)
    }

    /// The apology broadcast in place of a failed inference.
    pub fn inference_unavailable() -> Self {
        Self::system(INFERENCE_UNAVAILABLE)
    }

    pub fn is_from_user(&self) -> bool {
        self.sender == Speaker::User
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}
