//! Client proxies.
//!
//! A [`ClientProxy`] names a set of connections and forwards
//! `send(method, args)` to the lifetime manager. [`HubClients`] builds
//! proxies for any target; [`HubCallerClients`] adds targets relative to the
//! calling connection. [`hub_client!`](crate::hub_client) generates typed
//! wrappers over a proxy.

use std::ops::Deref;
use std::sync::Arc;

use hubwire_core::errors::Result;
use serde_json::Value;

use crate::lifetime::HubLifetimeManager;

/// Which connections a proxy addresses.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientTarget {
    /// Every connection.
    All,
    /// Every connection except these ids.
    AllExcept(Vec<String>),
    /// One connection.
    Connection(String),
    /// Several connections.
    Connections(Vec<String>),
    /// Members of a group.
    Group(String),
    /// Members of several groups.
    Groups(Vec<String>),
    /// Members of a group except these ids.
    GroupExcept {
        /// Group name.
        group: String,
        /// Connection ids to skip.
        excluded: Vec<String>,
    },
    /// Connections of one user.
    User(String),
    /// Connections of several users.
    Users(Vec<String>),
}

/// Sends invocations to a [`ClientTarget`].
#[derive(Clone)]
pub struct ClientProxy {
    lifetime: Arc<dyn HubLifetimeManager>,
    target: ClientTarget,
}

impl ClientProxy {
    /// Proxy for `target`.
    pub fn new(lifetime: Arc<dyn HubLifetimeManager>, target: ClientTarget) -> Self {
        Self { lifetime, target }
    }

    /// The addressed connections.
    pub fn target(&self) -> &ClientTarget {
        &self.target
    }

    /// Invoke `method` on every addressed connection.
    pub async fn send(&self, method: &str, args: Vec<Value>) -> Result<()> {
        let lifetime = &self.lifetime;
        match &self.target {
            ClientTarget::All => lifetime.send_all(method, args).await,
            ClientTarget::AllExcept(excluded) => lifetime.send_all_except(method, args, excluded).await,
            ClientTarget::Connection(id) => lifetime.send_connection(id, method, args).await,
            ClientTarget::Connections(ids) => lifetime.send_connections(ids, method, args).await,
            ClientTarget::Group(group) => lifetime.send_group(group, method, args).await,
            ClientTarget::Groups(groups) => lifetime.send_groups(groups, method, args).await,
            ClientTarget::GroupExcept { group, excluded } => {
                lifetime.send_group_except(group, method, args, excluded).await
            }
            ClientTarget::User(user) => lifetime.send_user(user, method, args).await,
            ClientTarget::Users(users) => lifetime.send_users(users, method, args).await,
        }
    }
}

/// Factory for client proxies.
#[derive(Clone)]
pub struct HubClients {
    lifetime: Arc<dyn HubLifetimeManager>,
}

impl HubClients {
    /// Proxies backed by `lifetime`.
    pub fn new(lifetime: Arc<dyn HubLifetimeManager>) -> Self {
        Self { lifetime }
    }

    fn proxy(&self, target: ClientTarget) -> ClientProxy {
        ClientProxy::new(Arc::clone(&self.lifetime), target)
    }

    /// Every connection.
    pub fn all(&self) -> ClientProxy {
        self.proxy(ClientTarget::All)
    }

    /// Every connection except `excluded`.
    pub fn all_except(&self, excluded: Vec<String>) -> ClientProxy {
        self.proxy(ClientTarget::AllExcept(excluded))
    }

    /// One connection.
    pub fn client(&self, connection_id: impl Into<String>) -> ClientProxy {
        self.proxy(ClientTarget::Connection(connection_id.into()))
    }

    /// Several connections.
    pub fn clients(&self, connection_ids: Vec<String>) -> ClientProxy {
        self.proxy(ClientTarget::Connections(connection_ids))
    }

    /// A group.
    pub fn group(&self, group: impl Into<String>) -> ClientProxy {
        self.proxy(ClientTarget::Group(group.into()))
    }

    /// Several groups.
    pub fn groups(&self, groups: Vec<String>) -> ClientProxy {
        self.proxy(ClientTarget::Groups(groups))
    }

    /// A group minus some connections.
    pub fn group_except(&self, group: impl Into<String>, excluded: Vec<String>) -> ClientProxy {
        self.proxy(ClientTarget::GroupExcept {
            group: group.into(),
            excluded,
        })
    }

    /// One user's connections.
    pub fn user(&self, user_id: impl Into<String>) -> ClientProxy {
        self.proxy(ClientTarget::User(user_id.into()))
    }

    /// Several users' connections.
    pub fn users(&self, user_ids: Vec<String>) -> ClientProxy {
        self.proxy(ClientTarget::Users(user_ids))
    }
}

/// [`HubClients`] plus targets relative to the calling connection.
#[derive(Clone)]
pub struct HubCallerClients {
    clients: HubClients,
    caller_id: String,
}

impl HubCallerClients {
    /// Proxies relative to `caller_id`.
    pub fn new(lifetime: Arc<dyn HubLifetimeManager>, caller_id: String) -> Self {
        Self {
            clients: HubClients::new(lifetime),
            caller_id,
        }
    }

    /// The calling connection.
    pub fn caller(&self) -> ClientProxy {
        self.clients.client(self.caller_id.clone())
    }

    /// Everyone but the caller.
    pub fn others(&self) -> ClientProxy {
        self.clients.all_except(vec![self.caller_id.clone()])
    }

    /// A group's members other than the caller.
    pub fn others_in_group(&self, group: impl Into<String>) -> ClientProxy {
        self.clients
            .group_except(group, vec![self.caller_id.clone()])
    }
}

impl Deref for HubCallerClients {
    type Target = HubClients;

    fn deref(&self) -> &HubClients {
        &self.clients
    }
}

/// Adds and removes connections from groups.
#[derive(Clone)]
pub struct GroupManager {
    lifetime: Arc<dyn HubLifetimeManager>,
}

impl GroupManager {
    /// Group operations backed by `lifetime`.
    pub fn new(lifetime: Arc<dyn HubLifetimeManager>) -> Self {
        Self { lifetime }
    }

    /// Add a connection to a group.
    pub async fn add_to_group(&self, connection_id: &str, group: &str) -> Result<()> {
        self.lifetime.add_to_group(connection_id, group).await
    }

    /// Remove a connection from a group.
    pub async fn remove_from_group(&self, connection_id: &str, group: &str) -> Result<()> {
        self.lifetime.remove_from_group(connection_id, group).await
    }
}

/// Handle for sending to clients from outside a hub call.
#[derive(Clone)]
pub struct HubContext {
    /// Client proxies.
    pub clients: HubClients,
    /// Group management.
    pub groups: GroupManager,
}

impl HubContext {
    /// Context backed by `lifetime`.
    pub fn new(lifetime: Arc<dyn HubLifetimeManager>) -> Self {
        Self {
            clients: HubClients::new(Arc::clone(&lifetime)),
            groups: GroupManager::new(lifetime),
        }
    }
}

/// Generate a typed client over a [`ClientProxy`].
///
/// ```ignore
/// hub_client! {
///     /// Methods the chat client implements.
///     pub struct ChatClient {
///         /// Deliver a chat line.
///         fn receive_message(user: String, text: String) => "ReceiveMessage";
///     }
/// }
/// ChatClient::new(ctx.clients().all()).receive_message(user, text).await?;
/// ```
#[macro_export]
macro_rules! hub_client {
    (
        $(#[$meta:meta])*
        $vis:vis struct $name:ident {
            $(
                $(#[$method_meta:meta])*
                fn $method:ident ( $( $arg:ident : $ty:ty ),* $(,)? ) => $wire:literal;
            )*
        }
    ) => {
        $(#[$meta])*
        #[derive(Clone)]
        $vis struct $name {
            proxy: $crate::clients::ClientProxy,
        }

        impl $name {
            /// Wrap a proxy.
            pub fn new(proxy: $crate::clients::ClientProxy) -> Self {
                Self { proxy }
            }

            $(
                $(#[$method_meta])*
                pub async fn $method(&self, $( $arg: $ty ),*) -> $crate::__private::Result<()> {
                    let args = ::std::vec![
                        $(
                            $crate::__private::serde_json::to_value($arg)
                                .map_err($crate::__private::HubError::internal)?
                        ),*
                    ];
                    self.proxy.send($wire, args).await
                }
            )*
        }

        impl ::std::convert::From<$crate::clients::ClientProxy> for $name {
            fn from(proxy: $crate::clients::ClientProxy) -> Self {
                Self::new(proxy)
            }
        }
    };
}
