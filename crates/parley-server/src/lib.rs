//! # parley-server
//!
//! WebSocket hub relaying client messages to an inference backend.
//!
//! - [`hub`]: the single coordination loop owning the set of live connections
//! - [`connection`]: per-client inbound/outbound pumps
//! - [`relay`]: maps an inference outcome to the messages sent back to clients
//! - [`server`]: axum router (`/ws`, `/ping`, `/health`) and listener

pub mod connection;
pub mod health;
pub mod hub;
pub mod relay;
pub mod server;
pub mod shutdown;

pub use connection::{Connection, ConnectionOptions};
pub use hub::{Delivery, Frame, Hub, HubError, HubHandle, HubSnapshot};
pub use server::{ParleyServer, ServerHandle};
pub use shutdown::ShutdownCoordinator;
