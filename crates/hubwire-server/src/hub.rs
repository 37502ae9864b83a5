//! Hub lifecycle trait, activation and per-call contexts.

use std::sync::Arc;

use async_trait::async_trait;
use hubwire_core::errors::{HubError, Result};
use hubwire_core::{ConnectionId, Principal};
use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::clients::{GroupManager, HubCallerClients};
use crate::connection::HubConnection;
use crate::lifetime::HubLifetimeManager;

/// Application hub: lifecycle hooks shared by every method of the hub.
///
/// Methods themselves are registered in a [`MethodTable`](crate::methods::MethodTable).
#[async_trait]
pub trait Hub: Send + Sync + 'static {
    /// Runs once after the handshake, before any invocation is dispatched.
    /// An error closes the connection.
    async fn on_connected(&self, _ctx: &HubCallContext) -> Result<()> {
        Ok(())
    }

    /// Runs once when the connection closes, with the terminating error if
    /// there was one.
    async fn on_disconnected(&self, _ctx: &HubCallContext, _error: Option<&HubError>) -> Result<()> {
        Ok(())
    }
}

/// Supplies hub instances to the dispatcher.
///
/// `create` is called per invocation and per lifecycle hook; `release` when
/// the call is done. Whether instances are fresh or shared is up to the
/// activator.
pub trait HubActivator<H: Hub>: Send + Sync {
    /// Obtain a hub instance.
    fn create(&self) -> Result<Arc<H>>;

    /// Return an instance obtained from [`create`](Self::create).
    fn release(&self, _hub: Arc<H>) {}
}

/// Hands out the same instance every time.
pub struct SingletonActivator<H> {
    hub: Arc<H>,
}

impl<H> SingletonActivator<H> {
    /// Share `hub` across every call.
    pub fn new(hub: H) -> Self {
        Self { hub: Arc::new(hub) }
    }

    /// Share an existing `Arc`.
    pub fn from_arc(hub: Arc<H>) -> Self {
        Self { hub }
    }
}

impl<H: Hub> HubActivator<H> for SingletonActivator<H> {
    fn create(&self) -> Result<Arc<H>> {
        Ok(Arc::clone(&self.hub))
    }
}

/// Builds a fresh instance per call.
pub struct FactoryActivator<F> {
    factory: F,
}

impl<F> FactoryActivator<F> {
    /// Use `factory` for every call.
    pub fn new(factory: F) -> Self {
        Self { factory }
    }
}

impl<H, F> HubActivator<H> for FactoryActivator<F>
where
    H: Hub,
    F: Fn() -> Result<H> + Send + Sync,
{
    fn create(&self) -> Result<Arc<H>> {
        (self.factory)().map(Arc::new)
    }
}

// ── Contexts ────────────────────────────────────────────────────────────────

/// Information about the connection making the call.
#[derive(Clone)]
pub struct HubCallerContext {
    connection: Arc<HubConnection>,
}

impl HubCallerContext {
    /// Wrap a connection.
    pub fn new(connection: Arc<HubConnection>) -> Self {
        Self { connection }
    }

    /// Caller's connection id.
    pub fn connection_id(&self) -> &ConnectionId {
        self.connection.id()
    }

    /// Caller's user identifier.
    pub fn user_identifier(&self) -> Option<&str> {
        self.connection.user_identifier()
    }

    /// Caller's principal.
    pub fn principal(&self) -> Option<&Principal> {
        self.connection.principal()
    }

    /// Token cancelled when the connection aborts.
    pub fn connection_aborted(&self) -> CancellationToken {
        self.connection.aborted_token()
    }

    /// Abort the caller's connection.
    pub fn abort(&self) {
        self.connection.abort();
    }
}

/// Everything hub code can reach during a call: caller info, client
/// proxies relative to the caller, and group management.
#[derive(Clone)]
pub struct HubCallContext {
    /// The calling connection.
    pub caller: HubCallerContext,
    /// Client proxies (`caller`, `others`, `group`, ...).
    pub clients: HubCallerClients,
    /// Group membership.
    pub groups: GroupManager,
}

impl HubCallContext {
    /// Build the context for `connection`.
    pub fn new(connection: Arc<HubConnection>, lifetime: Arc<dyn HubLifetimeManager>) -> Self {
        let caller_id = connection.id().to_string();
        Self {
            caller: HubCallerContext::new(connection),
            clients: HubCallerClients::new(Arc::clone(&lifetime), caller_id),
            groups: GroupManager::new(lifetime),
        }
    }
}

/// One invocation as seen by a method handler.
#[derive(Clone)]
pub struct InvocationContext {
    /// Present unless the call is fire-and-forget.
    pub invocation_id: Option<String>,
    /// Method name as sent by the client.
    pub target: String,
    /// Positional arguments.
    pub arguments: Vec<Value>,
    /// Cancelled when the connection aborts, or when the client cancels
    /// the stream for streaming calls.
    pub cancellation: CancellationToken,
    /// Caller scope.
    pub call: HubCallContext,
}

impl InvocationContext {
    /// Deserialize the argument at `index`.
    pub fn arg<T: DeserializeOwned>(&self, index: usize) -> Result<T> {
        let value = self.arguments.get(index).ok_or_else(|| {
            HubError::Binding(format!("'{}' has no argument at position {index}", self.target))
        })?;
        T::deserialize(value).map_err(|e| {
            HubError::Binding(format!(
                "argument {index} of '{}' has the wrong shape: {e}",
                self.target
            ))
        })
    }

    /// Caller info.
    pub fn caller(&self) -> &HubCallerContext {
        &self.call.caller
    }

    /// Client proxies.
    pub fn clients(&self) -> &HubCallerClients {
        &self.call.clients
    }

    /// Group management.
    pub fn groups(&self) -> &GroupManager {
        &self.call.groups
    }
}
