//! # hubwire-core
//!
//! Shared vocabulary for the hubwire invocation/broadcast engine.
//!
//! - **Branded IDs**: [`ConnectionId`] newtype for type safety
//! - **Principal**: authenticated identity attached to a connection
//! - **Errors**: [`HubError`] and [`ProtocolError`] via `thiserror`
//! - **Protocol**: [`HubMessage`] model, the [`HubProtocol`] codec trait,
//!   the JSON hub protocol and the handshake exchange
//! - **Logging**: `tracing` subscriber setup and test capture utilities

#![deny(unsafe_code)]

pub mod errors;
pub mod ids;
pub mod logging;
pub mod principal;
pub mod protocol;

pub use errors::{HubError, ProtocolError};
pub use ids::ConnectionId;
pub use principal::Principal;
pub use protocol::{HubMessage, HubProtocol, JsonHubProtocol};
