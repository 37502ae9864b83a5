//! # hubwire-server
//!
//! Hub invocation and broadcast engine with an axum WebSocket host.
//!
//! - **Connections**: outbound queue drained by one writer task, abort
//!   token, keep-alive pings and client timeout, active stream registry
//! - **Lifetime manager**: connection and group registries, fan-out to all,
//!   connections, groups and users with encode-once-per-protocol caching
//! - **Dispatcher**: handshake, case-insensitive method table, per-method
//!   authorization, concurrent invocations, streaming with client cancel
//! - **Clients**: `caller`/`others`/`group` proxies and typed clients via
//!   [`hub_client!`]
//! - **Server**: `/health`, `/metrics` and the hub WebSocket route,
//!   graceful shutdown via `CancellationToken`

#![deny(unsafe_code)]

pub mod auth;
pub mod clients;
pub mod connection;
pub mod dispatcher;
pub mod endpoint;
pub mod health;
pub mod hub;
pub mod keepalive;
pub mod lifetime;
pub mod methods;
pub mod metrics;
pub mod options;
pub mod serialized;
pub mod server;
pub mod shutdown;
pub mod stream;
pub mod transport;
pub mod websocket;

#[cfg(test)]
mod test_support;

pub use auth::{Authorizer, ClaimUserIdProvider, RoleAuthorizer, UserIdProvider};
pub use clients::{ClientProxy, GroupManager, HubCallerClients, HubClients, HubContext};
pub use connection::HubConnection;
pub use endpoint::{ConnectionState, HubConnectionHandler, HubConnectionHandlerBuilder};
pub use hub::{
    FactoryActivator, Hub, HubActivator, HubCallContext, HubCallerContext, InvocationContext,
    SingletonActivator,
};
pub use hubwire_core::errors::{HubError, Result};
pub use lifetime::{DefaultHubLifetimeManager, HubLifetimeManager};
pub use methods::{HubMethodDescriptor, MethodKind, MethodTable};
pub use options::HubOptions;
pub use server::{HubServer, ServerHandle};
pub use stream::{StreamSink, StreamSource};
pub use transport::Transport;

#[doc(hidden)]
pub mod __private {
    pub use hubwire_core::errors::{HubError, Result};
    pub use serde_json;
}
