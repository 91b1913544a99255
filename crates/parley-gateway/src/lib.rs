//! # parley-gateway
//!
//! [`InferenceGateway`](parley_core::InferenceGateway) implementations:
//! [`HttpGateway`] for a real backend, [`MockGateway`] for scripted tests.

pub mod http;
pub mod mock;

pub use http::HttpGateway;
pub use mock::{MockGateway, MockReply};
