//! Server-side state for one hub connection.
//!
//! Every outbound message goes through an unbounded queue drained by a
//! single task that owns the transport's write half. Producers (invocation
//! tasks, broadcasts, keep-alive) never touch the transport directly, so
//! frames are never interleaved and a slow client only grows its own queue.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use hubwire_core::errors::{HubError, Result};
use hubwire_core::protocol::{HubMessage, HubProtocol};
use hubwire_core::{ConnectionId, Principal};
use metrics::counter;
use parking_lot::Mutex;
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::keepalive::{self, KeepAliveAction, KeepAliveState};
use crate::metrics::MESSAGES_SENT_TOTAL;
use crate::options::HubOptions;
use crate::serialized::SerializedHubMessage;
use crate::transport::TransportWriter;

/// Longest time the drain task keeps writing once it sees the abort.
const ABORT_FLUSH_TIMEOUT: Duration = Duration::from_secs(5);

/// An item waiting in the outbound queue.
#[derive(Debug)]
pub enum Outbound {
    /// Encoded by the drain task with the connection's protocol.
    Message(HubMessage),
    /// Shared with other recipients; encoded at most once per protocol.
    Serialized(Arc<SerializedHubMessage>),
}

/// A running stream's registration.
#[derive(Debug, Clone)]
pub struct ActiveStream {
    /// Distinguishes this registration from earlier ones with the same id.
    pub generation: u64,
    /// Child of the connection's abort token.
    pub token: CancellationToken,
}

/// A negotiated hub connection.
pub struct HubConnection {
    id: ConnectionId,
    user_identifier: Option<String>,
    principal: Option<Principal>,
    protocol: Arc<dyn HubProtocol>,
    outbound: mpsc::UnboundedSender<Outbound>,
    queue: Mutex<Option<mpsc::UnboundedReceiver<Outbound>>>,
    aborted: CancellationToken,
    abort_error: Mutex<Option<HubError>>,
    active_streams: DashMap<String, ActiveStream>,
    next_stream_generation: AtomicU64,
    ping_queued: AtomicBool,
    last_send: Mutex<Instant>,
    last_receive: Mutex<Instant>,
    connected_at: Instant,
    keep_alive_interval: Duration,
    client_timeout: Duration,
    messages_written: AtomicU64,
}

impl HubConnection {
    /// Create a connection speaking `protocol`. Nothing is written until
    /// [`start_drain`](Self::start_drain) is called.
    pub fn new(protocol: Arc<dyn HubProtocol>, options: &HubOptions) -> Self {
        let (outbound, queue) = mpsc::unbounded_channel();
        let now = Instant::now();
        Self {
            id: ConnectionId::new(),
            user_identifier: None,
            principal: None,
            protocol,
            outbound,
            queue: Mutex::new(Some(queue)),
            aborted: CancellationToken::new(),
            abort_error: Mutex::new(None),
            active_streams: DashMap::new(),
            next_stream_generation: AtomicU64::new(0),
            ping_queued: AtomicBool::new(false),
            last_send: Mutex::new(now),
            last_receive: Mutex::new(now),
            connected_at: now,
            keep_alive_interval: options.keep_alive_interval,
            client_timeout: options.client_timeout,
            messages_written: AtomicU64::new(0),
        }
    }

    /// Use a specific connection id.
    #[must_use]
    pub fn with_id(mut self, id: impl Into<ConnectionId>) -> Self {
        self.id = id.into();
        self
    }

    /// Attach the authenticated principal.
    #[must_use]
    pub fn with_principal(mut self, principal: Option<Principal>) -> Self {
        self.principal = principal;
        self
    }

    /// Attach the resolved user identifier.
    #[must_use]
    pub fn with_user_identifier(mut self, user: Option<String>) -> Self {
        self.user_identifier = user;
        self
    }

    /// Connection id.
    pub fn id(&self) -> &ConnectionId {
        &self.id
    }

    /// User identifier resolved after the handshake.
    pub fn user_identifier(&self) -> Option<&str> {
        self.user_identifier.as_deref()
    }

    /// Principal supplied by the host.
    pub fn principal(&self) -> Option<&Principal> {
        self.principal.as_ref()
    }

    /// Negotiated protocol.
    pub fn protocol(&self) -> &Arc<dyn HubProtocol> {
        &self.protocol
    }

    /// Time since the connection was created.
    pub fn age(&self) -> Duration {
        self.connected_at.elapsed()
    }

    /// Messages successfully written to the transport.
    pub fn messages_written(&self) -> u64 {
        self.messages_written.load(Ordering::Relaxed)
    }

    // ── Outbound ────────────────────────────────────────────────────

    /// Enqueue a message. Returns once queued, not once written.
    pub fn write(&self, message: HubMessage) -> Result<()> {
        self.enqueue(Outbound::Message(message))
    }

    /// Enqueue a shared pre-serializable message.
    pub fn write_serialized(&self, message: Arc<SerializedHubMessage>) -> Result<()> {
        self.enqueue(Outbound::Serialized(message))
    }

    fn enqueue(&self, item: Outbound) -> Result<()> {
        self.outbound
            .send(item)
            .map_err(|_| HubError::ConnectionClosed)
    }

    /// Spawn the drain task that owns `writer` from now on, plus the
    /// keep-alive task that pings idle clients and times out silent ones.
    pub fn start_drain(self: &Arc<Self>, writer: TransportWriter) -> Result<JoinHandle<()>> {
        let queue = self.queue.lock().take().ok_or_else(|| {
            HubError::InvalidOperation("the drain task was already started".into())
        })?;
        drop(tokio::spawn(Arc::clone(self).keep_alive()));
        Ok(tokio::spawn(Arc::clone(self).drain(queue, writer)))
    }

    async fn drain(
        self: Arc<Self>,
        mut queue: mpsc::UnboundedReceiver<Outbound>,
        mut writer: TransportWriter,
    ) {
        // Set once abort is observed mid-write; bounds everything after it.
        let mut flush_deadline = None;
        let mut flush = true;

        loop {
            let item = tokio::select! {
                biased;
                () = self.aborted.cancelled() => break,
                item = queue.recv() => item,
            };
            let Some(item) = item else { break };

            let write = self.write_to_transport(&mut writer, item);
            tokio::pin!(write);
            let written = tokio::select! {
                biased;
                written = &mut write => Some(written),
                () = self.aborted.cancelled() => None,
            };
            let written = match written {
                Some(written) => written,
                None => {
                    // A partial frame may be on the wire; finish it or give up.
                    let deadline = Instant::now() + ABORT_FLUSH_TIMEOUT;
                    flush_deadline = Some(deadline);
                    match tokio::time::timeout_at(deadline, &mut write).await {
                        Ok(written) => written,
                        Err(_) => {
                            debug!(conn_id = %self.id, "write stalled after abort, dropping queue");
                            flush = false;
                            break;
                        }
                    }
                }
            };
            if let Err(err) = written {
                warn!(conn_id = %self.id, error = %err, "failed writing message, aborting connection");
                self.abort_with(err);
                flush = false;
                break;
            }
        }

        let deadline = flush_deadline.unwrap_or_else(|| Instant::now() + ABORT_FLUSH_TIMEOUT);
        if flush {
            self.flush_after_abort(&mut queue, &mut writer, deadline).await;
        }

        match tokio::time::timeout_at(deadline, writer.shutdown()).await {
            Ok(Ok(())) => {}
            Ok(Err(err)) => debug!(conn_id = %self.id, error = %err, "transport shutdown failed"),
            Err(_) => debug!(conn_id = %self.id, "transport shutdown timed out"),
        }
        debug!(conn_id = %self.id, written = self.messages_written(), "drain task finished");
    }

    async fn flush_after_abort(
        &self,
        queue: &mut mpsc::UnboundedReceiver<Outbound>,
        writer: &mut TransportWriter,
        deadline: Instant,
    ) {
        let flush = async {
            while let Ok(item) = queue.try_recv() {
                if let Err(err) = self.write_to_transport(writer, item).await {
                    debug!(conn_id = %self.id, error = %err, "dropping queued messages after abort");
                    break;
                }
            }
        };
        if tokio::time::timeout_at(deadline, flush).await.is_err() {
            debug!(conn_id = %self.id, "flush after abort timed out");
        }
    }

    /// Runs beside the drain task so a blocked write never delays the
    /// client timeout.
    async fn keep_alive(self: Arc<Self>) {
        let mut ticker = tokio::time::interval(keepalive::tick_period(self.keep_alive_interval));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let _ = ticker.tick().await;

        loop {
            tokio::select! {
                biased;
                () = self.aborted.cancelled() => break,
                _ = ticker.tick() => self.on_keep_alive_tick(),
            }
        }
    }

    fn on_keep_alive_tick(&self) {
        let state = KeepAliveState {
            last_send: *self.last_send.lock(),
            last_receive: *self.last_receive.lock(),
            interval: self.keep_alive_interval,
            client_timeout: self.client_timeout,
        };
        match keepalive::evaluate(&state, Instant::now()) {
            KeepAliveAction::Idle => {}
            KeepAliveAction::SendPing => {
                // One ping in the queue at a time; any write clears the flag.
                if !self.ping_queued.swap(true, Ordering::AcqRel)
                    && self.write(HubMessage::Ping).is_err()
                {
                    debug!(conn_id = %self.id, "keep-alive ping not queued, connection closed");
                }
            }
            KeepAliveAction::TimedOut => {
                let ms = u64::try_from(self.client_timeout.as_millis()).unwrap_or(u64::MAX);
                warn!(conn_id = %self.id, timeout_ms = ms, "client timed out, aborting connection");
                self.abort_with(HubError::ClientTimeout(ms));
            }
        }
    }

    async fn write_to_transport(&self, writer: &mut TransportWriter, item: Outbound) -> Result<()> {
        let bytes = match item {
            Outbound::Message(message) => self.protocol.write_message(&message)?,
            Outbound::Serialized(shared) => shared.get_serialized(self.protocol.as_ref())?,
        };
        writer.write_all(&bytes).await?;
        writer.flush().await?;
        *self.last_send.lock() = Instant::now();
        self.ping_queued.store(false, Ordering::Release);
        let _ = self.messages_written.fetch_add(1, Ordering::Relaxed);
        counter!(MESSAGES_SENT_TOTAL).increment(1);
        Ok(())
    }

    // ── Inbound / liveness ──────────────────────────────────────────

    /// Record inbound activity.
    pub fn reset_keep_alive(&self) {
        *self.last_receive.lock() = Instant::now();
    }

    // ── Abort ───────────────────────────────────────────────────────

    /// Fire the abort token. Idempotent.
    pub fn abort(&self) {
        self.aborted.cancel();
    }

    /// Fire the abort token, remembering `error` if it is the first one.
    pub fn abort_with(&self, error: HubError) {
        {
            let mut slot = self.abort_error.lock();
            if slot.is_none() && !self.aborted.is_cancelled() {
                *slot = Some(error);
            }
        }
        self.aborted.cancel();
    }

    /// Whether the connection was aborted.
    pub fn is_aborted(&self) -> bool {
        self.aborted.is_cancelled()
    }

    /// The error the connection was first aborted with, if any.
    pub fn abort_error(&self) -> Option<HubError> {
        self.abort_error.lock().clone()
    }

    /// Clone of the abort token; every invocation token derives from it.
    pub fn aborted_token(&self) -> CancellationToken {
        self.aborted.clone()
    }

    /// Resolves once the connection is aborted.
    pub async fn closed(&self) {
        self.aborted.cancelled().await;
    }

    // ── Active streams ──────────────────────────────────────────────

    /// Register a stream. Its token is a child of the abort token.
    pub fn register_stream(&self, invocation_id: &str) -> Result<ActiveStream> {
        match self.active_streams.entry(invocation_id.to_owned()) {
            Entry::Occupied(_) => Err(HubError::InvalidOperation(format!(
                "Invocation ID '{invocation_id}' is already in use."
            ))),
            Entry::Vacant(slot) => {
                let stream = ActiveStream {
                    generation: self.next_stream_generation.fetch_add(1, Ordering::Relaxed),
                    token: self.aborted.child_token(),
                };
                let _ = slot.insert(stream.clone());
                Ok(stream)
            }
        }
    }

    /// Cancel and forget a stream. Returns `false` for unknown ids.
    pub fn cancel_stream(&self, invocation_id: &str) -> bool {
        match self.active_streams.remove(invocation_id) {
            Some((_, stream)) => {
                stream.token.cancel();
                true
            }
            None => false,
        }
    }

    /// Forget a finished stream, unless its id was already reused by a
    /// later registration.
    pub fn complete_stream(&self, invocation_id: &str, generation: u64) {
        let _ = self
            .active_streams
            .remove_if(invocation_id, |_, stream| stream.generation == generation);
    }

    /// Whether a stream with this id is running.
    pub fn has_active_stream(&self, invocation_id: &str) -> bool {
        self.active_streams.contains_key(invocation_id)
    }

    /// Number of running streams.
    pub fn active_stream_count(&self) -> usize {
        self.active_streams.len()
    }
}

impl std::fmt::Debug for HubConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HubConnection")
            .field("id", &self.id)
            .field("user_identifier", &self.user_identifier)
            .field("protocol", &self.protocol.name())
            .field("aborted", &self.aborted.is_cancelled())
            .finish_non_exhaustive()
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::connection_pair;
    use assert_matches::assert_matches;
    use hubwire_core::protocol::{CompletionMessage, InvocationMessage, JsonHubProtocol};

    fn fast_options() -> HubOptions {
        HubOptions {
            keep_alive_interval: Duration::from_millis(100),
            client_timeout: Duration::from_millis(1000),
            ..HubOptions::default()
        }
    }

    #[test]
    fn builder_sets_identity() {
        let conn = HubConnection::new(Arc::new(JsonHubProtocol), &HubOptions::default())
            .with_id("c1")
            .with_user_identifier(Some("u1".into()))
            .with_principal(Some(Principal::authenticated("ada")));
        assert_eq!(conn.id().as_str(), "c1");
        assert_eq!(conn.user_identifier(), Some("u1"));
        assert_eq!(conn.principal().and_then(|p| p.name.as_deref()), Some("ada"));
        assert_eq!(conn.protocol().name(), "json");
    }

    #[tokio::test]
    async fn messages_are_written_in_enqueue_order() {
        let (conn, _drain, mut client) = connection_pair(HubOptions::default());
        for i in 0..5 {
            conn.write(HubMessage::Completion(CompletionMessage::empty(i.to_string())))
                .unwrap();
        }
        for i in 0..5 {
            assert_eq!(
                client.next_message().await,
                HubMessage::Completion(CompletionMessage::empty(i.to_string()))
            );
        }
        assert_eq!(conn.messages_written(), 5);
    }

    #[tokio::test]
    async fn shared_message_is_written() {
        let (conn, _drain, mut client) = connection_pair(HubOptions::default());
        let msg = HubMessage::Invocation(InvocationMessage::new("Hi", vec![]));
        conn.write_serialized(Arc::new(SerializedHubMessage::new(msg.clone())))
            .unwrap();
        assert_eq!(client.next_message().await, msg);
    }

    #[tokio::test]
    async fn drain_cannot_start_twice() {
        let (conn, _drain, _client) = connection_pair(HubOptions::default());
        let (_, writer) = tokio::io::split(tokio::io::duplex(8).0);
        assert_matches!(
            conn.start_drain(Box::new(writer)),
            Err(HubError::InvalidOperation(_))
        );
    }

    #[tokio::test]
    async fn abort_keeps_first_error_and_is_idempotent() {
        let (conn, drain, _client) = connection_pair(HubOptions::default());
        conn.abort_with(HubError::Transport("first".into()));
        conn.abort_with(HubError::Transport("second".into()));
        conn.abort();
        assert!(conn.is_aborted());
        assert_eq!(conn.abort_error(), Some(HubError::Transport("first".into())));
        drain.await.unwrap();
    }

    #[tokio::test]
    async fn plain_abort_records_no_error() {
        let (conn, _drain, _client) = connection_pair(HubOptions::default());
        conn.abort();
        assert!(conn.abort_error().is_none());
    }

    #[tokio::test]
    async fn abort_flushes_queue_then_closes_transport() {
        let (conn, drain, mut client) = connection_pair(HubOptions::default());
        conn.write(HubMessage::Ping).unwrap();
        conn.abort();
        drain.await.unwrap();

        assert_eq!(client.next_message().await, HubMessage::Ping);
        assert!(client.read_to_end().await);
    }

    #[tokio::test]
    async fn write_after_drain_exit_fails() {
        let (conn, drain, _client) = connection_pair(HubOptions::default());
        conn.abort();
        drain.await.unwrap();
        assert_matches!(conn.write(HubMessage::Ping), Err(HubError::ConnectionClosed));
    }

    #[tokio::test]
    async fn closed_client_aborts_on_next_write() {
        let (conn, drain, client) = connection_pair(HubOptions::default());
        drop(client);
        conn.write(HubMessage::Ping).unwrap();
        drain.await.unwrap();
        assert!(conn.is_aborted());
        assert_matches!(conn.abort_error(), Some(HubError::Transport(_)));
    }

    // ── Keep-alive ──────────────────────────────────────────────────

    #[tokio::test(start_paused = true)]
    async fn idle_connection_receives_ping() {
        let (conn, _drain, mut client) = connection_pair(fast_options());
        conn.reset_keep_alive();
        assert_eq!(client.next_message().await, HubMessage::Ping);
    }

    #[tokio::test(start_paused = true)]
    async fn silent_client_is_aborted() {
        let (conn, drain, mut client) = connection_pair(fast_options());
        // Pings keep flowing until the client timeout fires.
        while client.try_next_message().await.is_some() {}
        drain.await.unwrap();
        assert_matches!(conn.abort_error(), Some(HubError::ClientTimeout(1000)));
    }

    #[tokio::test(start_paused = true)]
    async fn silent_reader_times_out_while_a_write_is_blocked() {
        let conn = Arc::new(HubConnection::new(Arc::new(JsonHubProtocol), &fast_options()));
        // The client end is never read, so a large frame cannot be written.
        let (server, _client) = tokio::io::duplex(64);
        let (_reader, writer) = tokio::io::split(server);
        let drain = conn.start_drain(Box::new(writer)).unwrap();

        let payload = serde_json::json!("x".repeat(10 * 1024));
        conn.write(HubMessage::Invocation(InvocationMessage::new("Big", vec![payload])))
            .unwrap();

        tokio::time::timeout(Duration::from_secs(30), drain)
            .await
            .expect("drain task should finish once the client times out")
            .unwrap();
        assert_matches!(conn.abort_error(), Some(HubError::ClientTimeout(1000)));
        assert_eq!(conn.messages_written(), 0);
    }

    // ── Streams ─────────────────────────────────────────────────────

    #[tokio::test]
    async fn duplicate_stream_id_rejected() {
        let (conn, _drain, _client) = connection_pair(HubOptions::default());
        let _stream = conn.register_stream("s1").unwrap();
        assert_matches!(
            conn.register_stream("s1"),
            Err(HubError::InvalidOperation(m)) if m.contains("already in use")
        );
    }

    #[tokio::test]
    async fn cancel_stream_removes_and_cancels() {
        let (conn, _drain, _client) = connection_pair(HubOptions::default());
        let stream = conn.register_stream("s1").unwrap();
        assert!(conn.has_active_stream("s1"));

        assert!(conn.cancel_stream("s1"));
        assert!(stream.token.is_cancelled());
        assert!(!conn.has_active_stream("s1"));
        assert!(!conn.cancel_stream("s1"));
    }

    #[tokio::test]
    async fn abort_cancels_stream_tokens() {
        let (conn, _drain, _client) = connection_pair(HubOptions::default());
        let stream = conn.register_stream("s1").unwrap();
        conn.abort();
        assert!(stream.token.is_cancelled());
    }

    #[tokio::test]
    async fn complete_stream_forgets_id() {
        let (conn, _drain, _client) = connection_pair(HubOptions::default());
        let stream = conn.register_stream("s1").unwrap();
        conn.complete_stream("s1", stream.generation);
        assert_eq!(conn.active_stream_count(), 0);
    }

    #[tokio::test]
    async fn completing_an_earlier_stream_keeps_the_reused_id() {
        let (conn, _drain, _client) = connection_pair(HubOptions::default());
        let first = conn.register_stream("s").unwrap();
        assert!(conn.cancel_stream("s"));
        let second = conn.register_stream("s").unwrap();
        assert_ne!(first.generation, second.generation);

        conn.complete_stream("s", first.generation);
        assert!(conn.has_active_stream("s"));
        assert!(!second.token.is_cancelled());

        assert!(conn.cancel_stream("s"));
        assert!(second.token.is_cancelled());
    }
}
