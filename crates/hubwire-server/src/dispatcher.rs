//! Routes decoded client messages to hub methods.
//!
//! Lookup, mode checks and stream registration happen inline on the read
//! loop. Everything that may await hub code (authorization, binding, the
//! method itself, stream forwarding) runs on its own task so one slow call
//! never delays the next message.

use std::sync::Arc;
use std::time::Instant;

use futures::StreamExt;
use hubwire_core::errors::{HubError, Result, build_error_message};
use hubwire_core::protocol::{
    CancelInvocationMessage, CompletionMessage, HubMessage, InvocationMessage,
    StreamInvocationMessage, StreamItemMessage,
};
use metrics::{counter, histogram};
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, warn};

use crate::auth::Authorizer;
use crate::connection::HubConnection;
use crate::hub::{Hub, HubActivator, HubCallContext, InvocationContext};
use crate::lifetime::HubLifetimeManager;
use crate::methods::{HubMethodDescriptor, MethodCallable, MethodTable};
use crate::metrics::{
    INVOCATION_DURATION_SECONDS, INVOCATION_ERRORS_TOTAL, INVOCATIONS_TOTAL, STREAM_ITEMS_TOTAL,
};
use crate::options::HubOptions;
use crate::stream::{self, StreamEvent};

/// Text sent when a stream fails mid-way.
pub const STREAM_ERROR_MESSAGE: &str = "An error occurred on the server while streaming results.";

/// What the read loop should do after a message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchOutcome {
    /// Keep reading.
    Continue,
    /// The client sent Close.
    CloseRequested(Option<String>),
}

/// Shared, per-hub dispatch state. Cheap to clone.
pub struct HubDispatcher<H: Hub> {
    methods: Arc<MethodTable<H>>,
    activator: Arc<dyn HubActivator<H>>,
    authorizer: Arc<dyn Authorizer>,
    lifetime: Arc<dyn HubLifetimeManager>,
    options: Arc<HubOptions>,
}

impl<H: Hub> Clone for HubDispatcher<H> {
    fn clone(&self) -> Self {
        Self {
            methods: Arc::clone(&self.methods),
            activator: Arc::clone(&self.activator),
            authorizer: Arc::clone(&self.authorizer),
            lifetime: Arc::clone(&self.lifetime),
            options: Arc::clone(&self.options),
        }
    }
}

impl<H: Hub> HubDispatcher<H> {
    /// Assemble a dispatcher.
    pub fn new(
        methods: Arc<MethodTable<H>>,
        activator: Arc<dyn HubActivator<H>>,
        authorizer: Arc<dyn Authorizer>,
        lifetime: Arc<dyn HubLifetimeManager>,
        options: Arc<HubOptions>,
    ) -> Self {
        Self {
            methods,
            activator,
            authorizer,
            lifetime,
            options,
        }
    }

    /// The method table.
    pub fn methods(&self) -> &MethodTable<H> {
        &self.methods
    }

    /// Caller scope for `connection`.
    pub fn call_context(&self, connection: &Arc<HubConnection>) -> HubCallContext {
        HubCallContext::new(Arc::clone(connection), Arc::clone(&self.lifetime))
    }

    /// Handle one client message. Invocations are spawned on `tasks`.
    ///
    /// An `Err` is a protocol violation and should close the connection.
    pub fn dispatch(
        &self,
        connection: &Arc<HubConnection>,
        message: HubMessage,
        tasks: &TaskTracker,
    ) -> Result<DispatchOutcome> {
        match message {
            HubMessage::Invocation(invocation) => self.on_invocation(connection, invocation, tasks),
            HubMessage::StreamInvocation(invocation) => {
                self.on_stream_invocation(connection, invocation, tasks);
            }
            HubMessage::CancelInvocation(cancel) => on_cancel(connection, &cancel),
            HubMessage::Ping => {}
            HubMessage::Close(close) => return Ok(DispatchOutcome::CloseRequested(close.error)),
            other => {
                return Err(HubError::Protocol(format!(
                    "Unexpected message of kind '{}' from the client.",
                    other.kind()
                )));
            }
        }
        Ok(DispatchOutcome::Continue)
    }

    fn on_invocation(
        &self,
        connection: &Arc<HubConnection>,
        invocation: InvocationMessage,
        tasks: &TaskTracker,
    ) {
        let Some(descriptor) = self.methods.lookup(&invocation.target) else {
            counter!(INVOCATION_ERRORS_TOTAL, "error" => "unknown_method").increment(1);
            if invocation.expects_reply() {
                reply_error(connection, &invocation, HubError::UnknownMethod(invocation.target.clone()));
            } else {
                debug!(conn_id = %connection.id(), target = %invocation.target, "unknown hub method");
            }
            return;
        };

        if descriptor.is_streaming() {
            reply_error(
                connection,
                &invocation,
                HubError::InvalidOperation(format!(
                    "The client attempted to invoke the streaming '{}' method with a non-streaming invocation.",
                    invocation.target
                )),
            );
            return;
        }

        let dispatcher = self.clone();
        let connection = Arc::clone(connection);
        drop(tasks.spawn(async move {
            dispatcher.run_unary(connection, descriptor, invocation).await;
        }));
    }

    fn on_stream_invocation(
        &self,
        connection: &Arc<HubConnection>,
        invocation: StreamInvocationMessage,
        tasks: &TaskTracker,
    ) {
        let id = invocation.invocation_id.clone();
        let Some(descriptor) = self.methods.lookup(&invocation.target) else {
            counter!(INVOCATION_ERRORS_TOTAL, "error" => "unknown_method").increment(1);
            send_completion(
                connection,
                CompletionMessage::with_error(id, HubError::UnknownMethod(invocation.target).to_string()),
            );
            return;
        };

        if !descriptor.is_streaming() {
            send_completion(
                connection,
                CompletionMessage::with_error(
                    id,
                    format!(
                        "The client attempted to invoke the non-streaming '{}' method with a streaming invocation.",
                        invocation.target
                    ),
                ),
            );
            return;
        }

        // Registered before the task starts so an immediate cancel finds it.
        let stream = match connection.register_stream(&id) {
            Ok(stream) => stream,
            Err(err) => {
                send_completion(connection, CompletionMessage::with_error(id, err.to_string()));
                return;
            }
        };

        let dispatcher = self.clone();
        let connection = Arc::clone(connection);
        drop(tasks.spawn(async move {
            dispatcher
                .run_stream(&connection, descriptor, invocation, stream.token)
                .await;
            connection.complete_stream(&id, stream.generation);
        }));
    }

    // ── Invocation tasks ────────────────────────────────────────────

    async fn run_unary(
        &self,
        connection: Arc<HubConnection>,
        descriptor: Arc<HubMethodDescriptor<H>>,
        invocation: InvocationMessage,
    ) {
        let MethodCallable::Unary(handler) = descriptor.callable() else {
            return;
        };
        let method = descriptor.name().to_owned();
        counter!(INVOCATIONS_TOTAL, "method" => method.clone()).increment(1);
        let start = Instant::now();

        if let Err(err) = self.prepare(&connection, &descriptor, &invocation.arguments).await {
            record_error(&method, &err);
            if invocation.expects_reply() {
                reply_error(&connection, &invocation, err);
            }
            return;
        }

        let hub = match self.activator.create() {
            Ok(hub) => hub,
            Err(err) => {
                record_error(&method, &err);
                self.reply_failure(&connection, &invocation, &err);
                return;
            }
        };

        let ctx = InvocationContext {
            invocation_id: invocation.invocation_id.clone(),
            target: invocation.target.clone(),
            arguments: invocation.arguments.clone(),
            cancellation: connection.aborted_token().child_token(),
            call: self.call_context(&connection),
        };

        let outcome = tokio::select! {
            biased;
            () = connection.closed() => None,
            result = handler.call(Arc::clone(&hub), ctx) => Some(result),
        };
        self.activator.release(hub);
        histogram!(INVOCATION_DURATION_SECONDS, "method" => method.clone())
            .record(start.elapsed().as_secs_f64());

        let Some(result) = outcome else {
            debug!(conn_id = %connection.id(), method, "connection aborted during invocation");
            return;
        };

        match result {
            Ok(value) => {
                if let Some(id) = reply_id(&invocation) {
                    send_completion(&connection, CompletionMessage::with_result(id, value));
                }
            }
            Err(err) => {
                record_error(&method, &err);
                if invocation.expects_reply() {
                    self.reply_failure(&connection, &invocation, &err);
                } else {
                    warn!(conn_id = %connection.id(), method, error = %err, "fire-and-forget invocation failed");
                }
            }
        }
    }

    async fn run_stream(
        &self,
        connection: &Arc<HubConnection>,
        descriptor: Arc<HubMethodDescriptor<H>>,
        invocation: StreamInvocationMessage,
        token: CancellationToken,
    ) {
        let MethodCallable::Streaming(handler) = descriptor.callable() else {
            return;
        };
        let method = descriptor.name().to_owned();
        let id = invocation.invocation_id.clone();
        counter!(INVOCATIONS_TOTAL, "method" => method.clone()).increment(1);
        let start = Instant::now();

        if let Err(err) = self.prepare(connection, &descriptor, &invocation.arguments).await {
            record_error(&method, &err);
            let text = match err {
                HubError::Binding(_) => self.invocation_error(&invocation.target, &err),
                other => other.to_string(),
            };
            send_completion(connection, CompletionMessage::with_error(id, text));
            return;
        }

        let hub = match self.activator.create() {
            Ok(hub) => hub,
            Err(err) => {
                record_error(&method, &err);
                let text = self.invocation_error(&invocation.target, &err);
                send_completion(connection, CompletionMessage::with_error(id, text));
                return;
            }
        };

        let ctx = InvocationContext {
            invocation_id: Some(id.clone()),
            target: invocation.target.clone(),
            arguments: invocation.arguments,
            cancellation: token.clone(),
            call: self.call_context(connection),
        };

        let started = tokio::select! {
            biased;
            () = token.cancelled() => None,
            source = handler.call(Arc::clone(&hub), ctx) => Some(source),
        };

        let completion = match started {
            None => Some(CompletionMessage::empty(id.clone())),
            Some(Err(err)) => {
                record_error(&method, &err);
                Some(CompletionMessage::with_error(
                    id.clone(),
                    self.invocation_error(&invocation.target, &err),
                ))
            }
            Some(Ok(source)) => {
                self.forward_stream(connection, &method, &id, source, &token)
                    .await
            }
        };

        self.activator.release(hub);
        histogram!(INVOCATION_DURATION_SECONDS, "method" => method.clone())
            .record(start.elapsed().as_secs_f64());

        match completion {
            // An aborted connection gets no terminal message.
            Some(_) if connection.is_aborted() => {}
            Some(completion) => send_completion(connection, completion),
            None => {}
        }
    }

    /// Write items in order; returns the terminal completion, or `None`
    /// when the connection went away mid-stream.
    async fn forward_stream(
        &self,
        connection: &HubConnection,
        method: &str,
        id: &str,
        source: stream::StreamSource,
        token: &CancellationToken,
    ) -> Option<CompletionMessage> {
        let mut events = stream::adapt(source, token.clone(), self.options.stream_buffer_capacity);
        while let Some(event) = events.next().await {
            match event {
                StreamEvent::Item(item) => {
                    let message = HubMessage::StreamItem(StreamItemMessage::new(id, item));
                    if connection.write(message).is_err() {
                        return None;
                    }
                    counter!(STREAM_ITEMS_TOTAL, "method" => method.to_owned()).increment(1);
                }
                StreamEvent::Completed => return Some(CompletionMessage::empty(id)),
                StreamEvent::Failed(err) => {
                    record_error(method, &err);
                    let text = match &err {
                        HubError::Hub(message) => message.clone(),
                        other => build_error_message(
                            STREAM_ERROR_MESSAGE,
                            other,
                            self.options.enable_detailed_errors,
                        ),
                    };
                    return Some(CompletionMessage::with_error(id, text));
                }
            }
        }
        Some(CompletionMessage::empty(id))
    }

    /// Authorization and arity checks that run before the handler.
    async fn prepare(
        &self,
        connection: &HubConnection,
        descriptor: &HubMethodDescriptor<H>,
        arguments: &[Value],
    ) -> Result<()> {
        if !descriptor.policies().is_empty()
            && !self
                .authorizer
                .authorize(connection.principal(), descriptor.policies())
                .await
        {
            return Err(HubError::Unauthorized(descriptor.name().to_owned()));
        }
        descriptor.check_arity(arguments)
    }

    // ── Error text ──────────────────────────────────────────────────

    /// Text sent to the client for a failed invocation.
    ///
    /// Hub errors carry their own client-facing message. Everything else is
    /// reduced to a generic line, with detail appended when enabled.
    pub fn invocation_error(&self, target: &str, err: &HubError) -> String {
        let detailed = self.options.enable_detailed_errors;
        match err {
            HubError::Hub(message) => message.clone(),
            HubError::UnknownMethod(_) | HubError::Unauthorized(_) => err.to_string(),
            HubError::Binding(_) => build_error_message(
                &format!("Failed to invoke '{target}' due to an error on the server."),
                err,
                detailed,
            ),
            _ => build_error_message(
                &format!("An unexpected error occurred invoking '{target}' on the server."),
                err,
                detailed,
            ),
        }
    }

    fn reply_failure(&self, connection: &HubConnection, invocation: &InvocationMessage, err: &HubError) {
        if let Some(id) = reply_id(invocation) {
            let text = self.invocation_error(&invocation.target, err);
            send_completion(connection, CompletionMessage::with_error(id, text));
        }
    }
}

fn on_cancel(connection: &HubConnection, cancel: &CancelInvocationMessage) {
    if !connection.cancel_stream(&cancel.invocation_id) {
        debug!(
            conn_id = %connection.id(),
            invocation_id = %cancel.invocation_id,
            "cancel for unknown invocation ignored"
        );
    }
}

fn reply_id(invocation: &InvocationMessage) -> Option<&str> {
    if invocation.expects_reply() {
        invocation.invocation_id.as_deref()
    } else {
        None
    }
}

/// Reply with an error whose own text is the client-facing message.
fn reply_error(connection: &HubConnection, invocation: &InvocationMessage, err: HubError) {
    match reply_id(invocation) {
        Some(id) => send_completion(connection, CompletionMessage::with_error(id, err.to_string())),
        None => debug!(conn_id = %connection.id(), error = %err, "dropping error for fire-and-forget call"),
    }
}

fn send_completion(connection: &HubConnection, completion: CompletionMessage) {
    if let Err(err) = connection.write(HubMessage::Completion(completion)) {
        debug!(conn_id = %connection.id(), error = %err, "completion not delivered");
    }
}

fn record_error(method: &str, err: &HubError) {
    counter!(INVOCATION_ERRORS_TOTAL, "method" => method.to_owned(), "error" => err.code()).increment(1);
}
