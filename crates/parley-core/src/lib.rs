//! # parley-core
//!
//! Shared types for the parley hub.
//!
//! - [`message`]: the `{type, content, sender}` frame exchanged with clients
//! - [`inference`]: request and reply bodies of the backend's `POST /chat`
//! - [`gateway`]: the [`InferenceGateway`] seam and its [`GatewayError`]
//! - [`ids`]: branded connection and session ids

pub mod errors;
pub mod gateway;
pub mod ids;
pub mod inference;
pub mod message;

pub use errors::GatewayError;
pub use gateway::InferenceGateway;
pub use ids::{ConnectionId, SessionId};
pub use inference::{InferenceRequest, InferenceResponse};
pub use message::{Message, MessageKind, Speaker};
