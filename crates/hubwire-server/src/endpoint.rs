//! Per-connection state machine.
//!
//! ```text
//! Negotiating ──handshake ok──▶ Connected ──on_connected ok──▶ Dispatching
//!      │                            │                              │
//!      └──fail/timeout──▶ Closed    └──error──▶ Closing ◀──EOF/Close/error/abort
//!                                                  │
//!                                                  └──on_disconnected──▶ Closed
//! ```

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use bytes::BytesMut;
use hubwire_core::errors::{HubError, Result, build_error_message};
use hubwire_core::protocol::handshake::{self, HandshakeRequest, HandshakeResponse};
use hubwire_core::protocol::{CloseMessage, HubMessage, HubProtocol, JsonHubProtocol};
use hubwire_core::Principal;
use metrics::{counter, gauge};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::task::JoinHandle;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, instrument, warn};

use crate::auth::{Authorizer, ClaimUserIdProvider, RoleAuthorizer, UserIdProvider};
use crate::clients::HubContext;
use crate::connection::HubConnection;
use crate::dispatcher::{DispatchOutcome, HubDispatcher};
use crate::hub::{Hub, HubActivator, HubCallContext};
use crate::lifetime::{DefaultHubLifetimeManager, HubLifetimeManager};
use crate::methods::MethodTable;
use crate::metrics::{CONNECTIONS_ACTIVE, CONNECTIONS_TOTAL, HANDSHAKE_FAILURES_TOTAL};
use crate::options::HubOptions;
use crate::transport::{Transport, TransportReader, TransportWriter};

/// Longest wait for in-flight invocations once a connection is closing.
const INVOCATION_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Longest wait for the outbound queue to flush on close.
const WRITER_DRAIN_TIMEOUT: Duration = Duration::from_secs(10);

/// Generic close text; detail is appended when detailed errors are on.
const CLOSE_ERROR_MESSAGE: &str = "Connection closed with an error.";

/// Lifecycle state of one connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Waiting for the handshake request.
    Negotiating,
    /// Handshake accepted; `on_connected` running.
    Connected,
    /// Reading and dispatching messages.
    Dispatching,
    /// Tearing down.
    Closing,
    /// Done.
    Closed,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Negotiating => "negotiating",
            Self::Connected => "connected",
            Self::Dispatching => "dispatching",
            Self::Closing => "closing",
            Self::Closed => "closed",
        };
        f.write_str(name)
    }
}

/// Drives hub connections from handshake to close.
pub struct HubConnectionHandler<H: Hub> {
    dispatcher: HubDispatcher<H>,
    activator: Arc<dyn HubActivator<H>>,
    lifetime: Arc<dyn HubLifetimeManager>,
    protocols: Vec<Arc<dyn HubProtocol>>,
    user_ids: Arc<dyn UserIdProvider>,
    options: Arc<HubOptions>,
}

impl<H: Hub> HubConnectionHandler<H> {
    /// Start configuring a handler.
    pub fn builder(
        methods: MethodTable<H>,
        activator: impl HubActivator<H> + 'static,
    ) -> HubConnectionHandlerBuilder<H> {
        HubConnectionHandlerBuilder {
            methods,
            activator: Arc::new(activator),
            lifetime: None,
            authorizer: Arc::new(RoleAuthorizer),
            user_ids: Arc::new(ClaimUserIdProvider),
            protocols: Vec::new(),
            options: HubOptions::default(),
        }
    }

    /// The lifetime manager connections register with.
    pub fn lifetime(&self) -> &Arc<dyn HubLifetimeManager> {
        &self.lifetime
    }

    /// Handle for sending to clients from outside hub calls.
    pub fn hub_context(&self) -> HubContext {
        HubContext::new(Arc::clone(&self.lifetime))
    }

    /// Options in effect.
    pub fn options(&self) -> &HubOptions {
        &self.options
    }

    /// Run one connection to completion.
    ///
    /// Returns `Err` when the handshake fails or `on_disconnected` fails;
    /// every other terminating error is reported to the client in the Close
    /// message and logged.
    #[instrument(skip_all, fields(conn_id = tracing::field::Empty, state = tracing::field::Empty))]
    pub async fn run(&self, transport: Transport, principal: Option<Principal>) -> Result<()> {
        let Transport { mut reader, mut writer } = transport;
        let mut buf = BytesMut::with_capacity(4096);

        transition(ConnectionState::Negotiating);
        let protocol = match self.negotiate(&mut reader, &mut writer, &mut buf).await {
            Ok(protocol) => protocol,
            Err(err) => {
                counter!(HANDSHAKE_FAILURES_TOTAL).increment(1);
                debug!(error = %err, "handshake failed");
                let _ = writer.shutdown().await;
                transition(ConnectionState::Closed);
                return Err(err);
            }
        };

        transition(ConnectionState::Connected);
        let user = principal.as_ref().and_then(|p| self.user_ids.user_id(p));
        let connection = Arc::new(
            HubConnection::new(protocol, &self.options)
                .with_principal(principal)
                .with_user_identifier(user),
        );
        let _ = tracing::Span::current().record("conn_id", tracing::field::display(connection.id()));
        let drain = connection.start_drain(writer)?;
        if let Err(err) = self.lifetime.on_connected(Arc::clone(&connection)).await {
            connection.abort();
            transition(ConnectionState::Closed);
            return Err(err);
        }
        counter!(CONNECTIONS_TOTAL).increment(1);
        gauge!(CONNECTIONS_ACTIVE).increment(1.0);
        info!(
            protocol = connection.protocol().name(),
            user = connection.user_identifier().unwrap_or("-"),
            "hub connection established"
        );

        let call = self.dispatcher.call_context(&connection);
        let tasks = TaskTracker::new();
        let terminal = match self.on_connected(&call).await {
            Err(err) => {
                warn!(error = %err, "on_connected failed; closing");
                Some(err)
            }
            Ok(()) => {
                transition(ConnectionState::Dispatching);
                self.dispatch_loop(&connection, &mut reader, &mut buf, &tasks)
                    .await
                    .err()
            }
        };

        transition(ConnectionState::Closing);
        let error = terminal.or_else(|| connection.abort_error());
        let hook = self.close(&connection, drain, &tasks, &call, error).await;
        gauge!(CONNECTIONS_ACTIVE).decrement(1.0);
        transition(ConnectionState::Closed);
        hook
    }

    // ── Negotiating ─────────────────────────────────────────────────

    async fn negotiate(
        &self,
        reader: &mut TransportReader,
        writer: &mut TransportWriter,
        buf: &mut BytesMut,
    ) -> Result<Arc<dyn HubProtocol>> {
        let request = match tokio::time::timeout(self.options.handshake_timeout, read_handshake(reader, buf)).await {
            Ok(Ok(request)) => request,
            Ok(Err(err)) => {
                write_handshake(writer, &HandshakeResponse::failure(err.to_string())).await;
                return Err(err);
            }
            Err(_) => {
                return Err(HubError::Handshake(format!(
                    "no handshake request within {} ms",
                    self.options.handshake_timeout.as_millis()
                )));
            }
        };

        match self.resolve_protocol(&request) {
            Ok(protocol) => {
                let response = handshake::write_response(&HandshakeResponse::success())?;
                writer.write_all(&response).await?;
                writer.flush().await?;
                debug!(protocol = %request.protocol, version = request.version, "handshake accepted");
                Ok(protocol)
            }
            Err(reason) => {
                write_handshake(writer, &HandshakeResponse::failure(reason.clone())).await;
                Err(HubError::Handshake(reason))
            }
        }
    }

    fn resolve_protocol(&self, request: &HandshakeRequest) -> std::result::Result<Arc<dyn HubProtocol>, String> {
        let protocol = self
            .protocols
            .iter()
            .find(|p| p.name().eq_ignore_ascii_case(&request.protocol) && self.options.allows_protocol(p.name()))
            .ok_or_else(|| format!("The protocol '{}' is not supported.", request.protocol))?;
        if !protocol.is_version_supported(request.version) {
            return Err(format!(
                "The server does not support version {} of the '{}' protocol.",
                request.version, request.protocol
            ));
        }
        Ok(Arc::clone(protocol))
    }

    // ── Dispatching ─────────────────────────────────────────────────

    async fn dispatch_loop(
        &self,
        connection: &Arc<HubConnection>,
        reader: &mut TransportReader,
        buf: &mut BytesMut,
        tasks: &TaskTracker,
    ) -> Result<()> {
        let protocol = Arc::clone(connection.protocol());
        loop {
            while let Some(message) = protocol.try_parse_message(buf)? {
                match self.dispatcher.dispatch(connection, message, tasks)? {
                    DispatchOutcome::Continue => {}
                    DispatchOutcome::CloseRequested(reason) => {
                        debug!(reason = reason.as_deref().unwrap_or("-"), "client sent close");
                        return Ok(());
                    }
                }
            }

            let read = tokio::select! {
                biased;
                () = connection.closed() => {
                    return connection.abort_error().map_or(Ok(()), Err);
                }
                read = reader.read_buf(buf) => read,
            };
            match read? {
                0 if buf.is_empty() => return Ok(()),
                0 => {
                    return Err(HubError::Protocol(
                        "Connection terminated while reading a message.".to_owned(),
                    ));
                }
                _ => connection.reset_keep_alive(),
            }
        }
    }

    // ── Hooks ───────────────────────────────────────────────────────

    async fn on_connected(&self, call: &HubCallContext) -> Result<()> {
        let hub = self.activator.create()?;
        let result = hub.on_connected(call).await;
        self.activator.release(hub);
        result
    }

    async fn on_disconnected(&self, call: &HubCallContext, error: Option<&HubError>) -> Result<()> {
        let hub = self.activator.create()?;
        let result = hub.on_disconnected(call, error).await;
        self.activator.release(hub);
        result
    }

    // ── Closing ─────────────────────────────────────────────────────

    async fn close(
        &self,
        connection: &Arc<HubConnection>,
        drain: JoinHandle<()>,
        tasks: &TaskTracker,
        call: &HubCallContext,
        error: Option<HubError>,
    ) -> Result<()> {
        let close = match &error {
            Some(err) => CloseMessage::with_error(build_error_message(
                CLOSE_ERROR_MESSAGE,
                err,
                self.options.enable_detailed_errors,
            )),
            None => CloseMessage::empty(),
        };
        if let Err(err) = connection.write(HubMessage::Close(close)) {
            debug!(error = %err, "close message not queued");
        }

        connection.abort();
        let _ = tasks.close();
        if tokio::time::timeout(INVOCATION_DRAIN_TIMEOUT, tasks.wait()).await.is_err() {
            warn!(pending = tasks.len(), "invocations still running after abort");
        }

        let hook = self.on_disconnected(call, error.as_ref()).await;
        if let Err(err) = &hook {
            warn!(error = %err, "on_disconnected failed");
        }
        if let Err(err) = self.lifetime.on_disconnected(connection).await {
            warn!(error = %err, "lifetime manager failed to release connection");
        }

        let drain_abort = drain.abort_handle();
        match tokio::time::timeout(WRITER_DRAIN_TIMEOUT, drain).await {
            Ok(Ok(())) => {}
            Ok(Err(err)) => warn!(error = %err, "drain task failed"),
            Err(_) => {
                warn!("drain task did not finish; aborting");
                drain_abort.abort();
            }
        }

        info!(
            error = error.as_ref().map(|e| e.code()).unwrap_or("-"),
            messages = connection.messages_written(),
            age_ms = u64::try_from(connection.age().as_millis()).unwrap_or(u64::MAX),
            "hub connection closed"
        );
        hook
    }
}

fn transition(state: ConnectionState) {
    let _ = tracing::Span::current().record("state", tracing::field::display(state));
    debug!(%state, "connection state changed");
}

async fn read_handshake(reader: &mut TransportReader, buf: &mut BytesMut) -> Result<HandshakeRequest> {
    loop {
        if let Some(request) = handshake::try_parse_request(buf)? {
            return Ok(request);
        }
        if reader.read_buf(buf).await? == 0 {
            return Err(HubError::Handshake(
                "connection closed before the handshake completed".to_owned(),
            ));
        }
    }
}

async fn write_handshake(writer: &mut TransportWriter, response: &HandshakeResponse) {
    let written = match handshake::write_response(response) {
        Ok(bytes) => writer.write_all(&bytes).await.and(writer.flush().await),
        Err(err) => {
            warn!(error = %err, "failed to encode handshake response");
            return;
        }
    };
    if let Err(err) = written {
        debug!(error = %err, "handshake response not delivered");
    }
}

/// Configures a [`HubConnectionHandler`].
pub struct HubConnectionHandlerBuilder<H: Hub> {
    methods: MethodTable<H>,
    activator: Arc<dyn HubActivator<H>>,
    lifetime: Option<Arc<dyn HubLifetimeManager>>,
    authorizer: Arc<dyn Authorizer>,
    user_ids: Arc<dyn UserIdProvider>,
    protocols: Vec<Arc<dyn HubProtocol>>,
    options: HubOptions,
}

impl<H: Hub> HubConnectionHandlerBuilder<H> {
    /// Share a lifetime manager; defaults to a fresh
    /// [`DefaultHubLifetimeManager`].
    #[must_use]
    pub fn lifetime(mut self, lifetime: Arc<dyn HubLifetimeManager>) -> Self {
        self.lifetime = Some(lifetime);
        self
    }

    /// Replace the authorizer (default [`RoleAuthorizer`]).
    #[must_use]
    pub fn authorizer(mut self, authorizer: impl Authorizer + 'static) -> Self {
        self.authorizer = Arc::new(authorizer);
        self
    }

    /// Replace the user-id mapping (default [`ClaimUserIdProvider`]).
    #[must_use]
    pub fn user_id_provider(mut self, provider: impl UserIdProvider + 'static) -> Self {
        self.user_ids = Arc::new(provider);
        self
    }

    /// Register a protocol. JSON is registered when none are.
    #[must_use]
    pub fn protocol(mut self, protocol: impl HubProtocol + 'static) -> Self {
        self.protocols.push(Arc::new(protocol));
        self
    }

    /// Set the options.
    #[must_use]
    pub fn options(mut self, options: HubOptions) -> Self {
        self.options = options;
        self
    }

    /// Build the handler.
    ///
    /// Fails when the allowed protocol list names none of the registered
    /// protocols.
    pub fn build(self) -> Result<HubConnectionHandler<H>> {
        let mut protocols = self.protocols;
        if protocols.is_empty() {
            protocols.push(Arc::new(JsonHubProtocol));
        }
        if !protocols.iter().any(|p| self.options.allows_protocol(p.name())) {
            return Err(HubError::InvalidOperation(format!(
                "None of the supported protocols {:?} is registered.",
                self.options.supported_protocols
            )));
        }

        let lifetime: Arc<dyn HubLifetimeManager> = match self.lifetime {
            Some(lifetime) => lifetime,
            None => Arc::new(DefaultHubLifetimeManager::new()),
        };
        let options = Arc::new(self.options);
        let dispatcher = HubDispatcher::new(
            Arc::new(self.methods),
            Arc::clone(&self.activator),
            self.authorizer,
            Arc::clone(&lifetime),
            Arc::clone(&options),
        );
        Ok(HubConnectionHandler {
            dispatcher,
            activator: self.activator,
            lifetime,
            protocols,
            user_ids: self.user_ids,
            options,
        })
    }
}
