//! End-to-end tests driving a connection handler over in-memory transports.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use assert_matches::assert_matches;
use async_trait::async_trait;
use bytes::BytesMut;
use parking_lot::Mutex;
use serde_json::{Value, json};
use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream, ReadHalf, WriteHalf};
use tokio::task::JoinHandle;

use hubwire_core::logging::capture_logs;
use hubwire_core::principal::ROLE_CLAIM;
use hubwire_core::protocol::handshake::{self, HandshakeRequest, HandshakeResponse};
use hubwire_core::protocol::{
    CancelInvocationMessage, CloseMessage, CompletionMessage, HubMessage, HubProtocol,
    InvocationMessage, JsonHubProtocol, StreamInvocationMessage,
};
use hubwire_core::Principal;
use hubwire_server::dispatcher::STREAM_ERROR_MESSAGE;
use hubwire_server::methods::UnaryFn;
use hubwire_server::{
    DefaultHubLifetimeManager, Hub, HubCallContext, HubConnectionHandler, HubError,
    HubMethodDescriptor, HubOptions, InvocationContext, MethodTable, Result, SingletonActivator,
    StreamSource, Transport,
};

const TIMEOUT: Duration = Duration::from_secs(5);
const SILENCE: Duration = Duration::from_millis(200);

// ── Test hub ──

#[derive(Default)]
struct TestHub {
    reject_connect: bool,
    fail_disconnect: bool,
    connected: AtomicUsize,
    disconnected: AtomicUsize,
    disconnect_errors: Mutex<Vec<Option<String>>>,
}

#[async_trait]
impl Hub for TestHub {
    async fn on_connected(&self, _ctx: &HubCallContext) -> Result<()> {
        let _ = self.connected.fetch_add(1, Ordering::SeqCst);
        if self.reject_connect {
            return Err(HubError::Hub("not today".into()));
        }
        Ok(())
    }

    async fn on_disconnected(&self, _ctx: &HubCallContext, error: Option<&HubError>) -> Result<()> {
        let _ = self.disconnected.fetch_add(1, Ordering::SeqCst);
        self.disconnect_errors.lock().push(error.map(ToString::to_string));
        if self.fail_disconnect {
            return Err(HubError::Hub("cleanup failed".into()));
        }
        Ok(())
    }
}

fn methods() -> MethodTable<TestHub> {
    MethodTable::builder()
        .method("Echo", |_, ctx| async move { ctx.arg::<Value>(0) })
        .method("WhoAmI", |_, ctx| async move {
            Ok(json!(ctx.caller().connection_id().as_str()))
        })
        .method("Slow", |_, ctx| async move {
            let ms: u64 = ctx.arg(0)?;
            tokio::time::sleep(Duration::from_millis(ms)).await;
            Ok(json!("slow"))
        })
        .method("Fast", |_, _| async move { Ok(json!("fast")) })
        .method("Fail", |_, _| async move { Err(HubError::Hub("custom failure".into())) })
        .method("Crash", |_, _| async move { Err(HubError::internal("secret detail")) })
        .method("Join", |_, ctx| async move {
            let group: String = ctx.arg(0)?;
            let id = ctx.caller().connection_id().to_string();
            ctx.groups().add_to_group(&id, &group).await?;
            Ok(Value::Null)
        })
        .method("Shout", |_, ctx| async move {
            let text: Value = ctx.arg(0)?;
            ctx.clients().others().send("Heard", vec![text]).await?;
            Ok(Value::Null)
        })
        .add(
            HubMethodDescriptor::unary(
                "Secret",
                UnaryFn(|_: Arc<TestHub>, _: InvocationContext| async {
                    Ok::<_, HubError>(json!("classified"))
                }),
            )
            .authorize("admin"),
        )
        .add(
            HubMethodDescriptor::unary(
                "Typed",
                UnaryFn(|_: Arc<TestHub>, ctx: InvocationContext| async move {
                    let a: i64 = ctx.arg(0)?;
                    let b: i64 = ctx.arg(1)?;
                    Ok::<_, HubError>(json!(a * b))
                }),
            )
            .params(["int", "int"]),
        )
        .stream("Counter", |_, ctx| async move {
            let n: u32 = ctx.arg(0)?;
            Ok(StreamSource::from_values((0..n).map(|i| json!(i.to_string()))))
        })
        .stream("Ticker", |_, _| async move {
            Ok(StreamSource::push(|sink, token| async move {
                loop {
                    tokio::select! {
                        () = token.cancelled() => return Ok(()),
                        sent = sink.send(json!("tick")) => sent?,
                    }
                    tokio::time::sleep(Duration::from_millis(10)).await;
                }
            }))
        })
        .stream("Broken", |_, _| async move {
            let items = futures::stream::iter(vec![Ok(json!(1)), Err(HubError::internal("disk gone"))]);
            Ok(StreamSource::from_stream(items))
        })
        .build()
        .unwrap()
}

// ── Harness ──

struct Harness {
    handler: Arc<HubConnectionHandler<TestHub>>,
    lifetime: Arc<DefaultHubLifetimeManager>,
    hub: Arc<TestHub>,
}

impl Harness {
    fn new(hub: TestHub, options: HubOptions) -> Self {
        let hub = Arc::new(hub);
        let lifetime = Arc::new(DefaultHubLifetimeManager::new());
        let handler = HubConnectionHandler::builder(methods(), SingletonActivator::from_arc(Arc::clone(&hub)))
            .lifetime(lifetime.clone())
            .options(options)
            .build()
            .unwrap();
        Self {
            handler: Arc::new(handler),
            lifetime,
            hub,
        }
    }

    fn plain() -> Self {
        Self::new(TestHub::default(), HubOptions::default())
    }

    /// Start a connection without handshaking.
    fn open(&self, principal: Option<Principal>) -> (TestClient, JoinHandle<Result<()>>) {
        let (client, server) = tokio::io::duplex(64 * 1024);
        let handler = Arc::clone(&self.handler);
        let run = tokio::spawn(async move { handler.run(Transport::from_io(server), principal).await });
        (TestClient::new(client), run)
    }

    /// Start a connection and complete the JSON handshake.
    async fn connect(&self, principal: Option<Principal>) -> (TestClient, JoinHandle<Result<()>>) {
        let (mut client, run) = self.open(principal);
        let response = client.handshake("json", 1).await;
        assert_eq!(response, HandshakeResponse::success());
        (client, run)
    }

    async fn wait_for_connections(&self, count: usize) {
        tokio::time::timeout(TIMEOUT, async {
            while self.lifetime.connection_count() != count {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
    }
}

struct TestClient {
    reader: ReadHalf<DuplexStream>,
    writer: WriteHalf<DuplexStream>,
    buf: BytesMut,
}

impl TestClient {
    fn new(io: DuplexStream) -> Self {
        let (reader, writer) = tokio::io::split(io);
        Self {
            reader,
            writer,
            buf: BytesMut::new(),
        }
    }

    async fn handshake(&mut self, protocol: &str, version: u32) -> HandshakeResponse {
        let request = handshake::write_request(&HandshakeRequest::new(protocol, version)).unwrap();
        self.writer.write_all(&request).await.unwrap();
        tokio::time::timeout(TIMEOUT, async {
            loop {
                if let Some(response) = handshake::try_parse_response(&mut self.buf).unwrap() {
                    return response;
                }
                assert_ne!(self.reader.read_buf(&mut self.buf).await.unwrap(), 0, "EOF during handshake");
            }
        })
        .await
        .unwrap()
    }

    async fn send(&mut self, message: HubMessage) {
        let bytes = JsonHubProtocol.write_message(&message).unwrap();
        self.writer.write_all(&bytes).await.unwrap();
    }

    async fn invoke(&mut self, id: &str, target: &str, args: Vec<Value>) {
        self.send(HubMessage::Invocation(InvocationMessage::with_id(id, target, args)))
            .await;
    }

    async fn next_within(&mut self, wait: Duration) -> Option<HubMessage> {
        let read = async {
            loop {
                if let Some(message) = JsonHubProtocol.try_parse_message(&mut self.buf).unwrap() {
                    return Some(message);
                }
                if self.reader.read_buf(&mut self.buf).await.ok()? == 0 {
                    return None;
                }
            }
        };
        tokio::time::timeout(wait, read).await.ok().flatten()
    }

    async fn next(&mut self) -> HubMessage {
        self.next_within(TIMEOUT).await.expect("expected a message")
    }

    async fn completion(&mut self) -> CompletionMessage {
        match self.next().await {
            HubMessage::Completion(completion) => completion,
            other => panic!("expected completion, got {other:?}"),
        }
    }

    async fn close(&mut self) {
        self.writer.shutdown().await.unwrap();
    }
}

// ── Invocation ──

#[tokio::test]
async fn echo_round_trip_and_case_insensitive_lookup() {
    let harness = Harness::plain();
    let (mut client, _run) = harness.connect(None).await;

    client.invoke("1", "echo", vec![json!({"a": 1})]).await;
    assert_eq!(client.completion().await, CompletionMessage::with_result("1", json!({"a": 1})));
}

#[tokio::test]
async fn unknown_method_reports_name_without_result() {
    let harness = Harness::plain();
    let (mut client, _run) = harness.connect(None).await;

    client.invoke("1", "Foo", vec![]).await;
    let completion = client.completion().await;
    assert_eq!(completion.invocation_id, "1");
    assert!(completion.error.as_deref().unwrap().contains("Foo"));
    assert_eq!(completion.error.as_deref(), Some("Unknown hub method 'Foo'"));
    assert!(completion.result.is_none());
}

#[tokio::test]
async fn unknown_non_blocking_invocation_is_silent() {
    let harness = Harness::plain();
    let (mut client, _run) = harness.connect(None).await;

    let mut quiet = InvocationMessage::with_id("1", "Nope", vec![]);
    quiet.non_blocking = true;
    client.send(HubMessage::Invocation(quiet)).await;
    client.send(HubMessage::Invocation(InvocationMessage::new("Nope", vec![]))).await;
    assert!(client.next_within(SILENCE).await.is_none());

    client.invoke("2", "Nope", vec![]).await;
    let completion = client.completion().await;
    assert_eq!(completion.invocation_id, "2");
    assert!(completion.error.is_some());
    assert!(client.next_within(SILENCE).await.is_none());
}

#[tokio::test]
async fn fast_invocation_is_not_blocked_by_slow_one() {
    let harness = Harness::plain();
    let (mut client, _run) = harness.connect(None).await;

    client.invoke("a", "Slow", vec![json!(400)]).await;
    client.invoke("b", "Fast", vec![]).await;

    assert_eq!(client.completion().await, CompletionMessage::with_result("b", json!("fast")));
    assert_eq!(client.completion().await, CompletionMessage::with_result("a", json!("slow")));
}

#[tokio::test]
async fn hub_error_text_reaches_client() {
    let harness = Harness::plain();
    let (mut client, _run) = harness.connect(None).await;

    client.invoke("1", "Fail", vec![]).await;
    assert_eq!(client.completion().await.error.as_deref(), Some("custom failure"));
}

#[tokio::test]
async fn unexpected_errors_are_generic_unless_detailed() {
    let harness = Harness::plain();
    let (mut client, _run) = harness.connect(None).await;
    client.invoke("1", "Crash", vec![]).await;
    assert_eq!(
        client.completion().await.error.as_deref(),
        Some("An unexpected error occurred invoking 'Crash' on the server.")
    );

    let detailed = Harness::new(
        TestHub::default(),
        HubOptions {
            enable_detailed_errors: true,
            ..HubOptions::default()
        },
    );
    let (mut client, _run) = detailed.connect(None).await;
    client.invoke("1", "Crash", vec![]).await;
    let error = client.completion().await.error.unwrap();
    assert!(error.starts_with("An unexpected error occurred invoking 'Crash' on the server."));
    assert!(error.contains("secret detail"));
}

#[tokio::test]
async fn argument_count_mismatch_is_rejected() {
    let harness = Harness::plain();
    let (mut client, _run) = harness.connect(None).await;

    client.invoke("1", "Typed", vec![json!(3)]).await;
    assert_eq!(
        client.completion().await.error.as_deref(),
        Some("Failed to invoke 'Typed' due to an error on the server.")
    );

    client.invoke("2", "Typed", vec![json!(3), json!(4)]).await;
    assert_eq!(client.completion().await, CompletionMessage::with_result("2", json!(12)));
}

#[tokio::test]
async fn policies_gate_invocation() {
    let harness = Harness::plain();
    let (mut anonymous, _run) = harness.connect(None).await;
    anonymous.invoke("1", "Secret", vec![]).await;
    assert_eq!(
        anonymous.completion().await.error.as_deref(),
        Some("Failed to invoke 'Secret' because user is unauthorized")
    );

    let admin = Principal::authenticated("ada").with_claim(ROLE_CLAIM, "admin");
    let (mut client, _run) = harness.connect(Some(admin)).await;
    client.invoke("1", "Secret", vec![]).await;
    assert_eq!(client.completion().await, CompletionMessage::with_result("1", json!("classified")));
}

#[tokio::test]
async fn invocation_kind_must_match_method_kind() {
    let harness = Harness::plain();
    let (mut client, _run) = harness.connect(None).await;

    client.invoke("1", "Counter", vec![json!(1)]).await;
    let error = client.completion().await.error.unwrap();
    assert!(error.contains("streaming 'Counter' method with a non-streaming invocation"));

    client
        .send(HubMessage::StreamInvocation(StreamInvocationMessage::new("2", "Echo", vec![json!(1)])))
        .await;
    let error = client.completion().await.error.unwrap();
    assert!(error.contains("non-streaming 'Echo' method with a streaming invocation"));
}

// ── Streaming ──

#[tokio::test]
async fn stream_items_then_clean_completion() {
    let harness = Harness::plain();
    let (mut client, _run) = harness.connect(None).await;

    client
        .send(HubMessage::StreamInvocation(StreamInvocationMessage::new("s", "Counter", vec![json!(4)])))
        .await;
    for expected in ["0", "1", "2", "3"] {
        match client.next().await {
            HubMessage::StreamItem(item) => {
                assert_eq!(item.invocation_id, "s");
                assert_eq!(item.item, json!(expected));
            }
            other => panic!("expected stream item, got {other:?}"),
        }
    }
    assert_eq!(client.completion().await, CompletionMessage::empty("s"));
}

#[tokio::test]
async fn cancel_ends_stream_cleanly_and_second_cancel_is_ignored() {
    let harness = Harness::plain();
    let (mut client, _run) = harness.connect(None).await;

    client
        .send(HubMessage::StreamInvocation(StreamInvocationMessage::new("s", "Ticker", vec![])))
        .await;
    assert_matches!(client.next().await, HubMessage::StreamItem(_));

    client
        .send(HubMessage::CancelInvocation(CancelInvocationMessage::new("s")))
        .await;
    let completion = loop {
        match client.next().await {
            HubMessage::StreamItem(_) => {}
            HubMessage::Completion(completion) => break completion,
            other => panic!("unexpected {other:?}"),
        }
    };
    assert_eq!(completion, CompletionMessage::empty("s"));

    let connection = harness.lifetime.connections().all().pop().unwrap();
    tokio::time::timeout(TIMEOUT, async {
        while connection.has_active_stream("s") {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap();

    client
        .send(HubMessage::CancelInvocation(CancelInvocationMessage::new("s")))
        .await;
    client.invoke("after", "Fast", vec![]).await;
    assert_eq!(client.completion().await, CompletionMessage::with_result("after", json!("fast")));
    assert!(client.next_within(SILENCE).await.is_none());
}

#[tokio::test]
async fn stream_failure_uses_generic_text() {
    let harness = Harness::plain();
    let (mut client, _run) = harness.connect(None).await;

    client
        .send(HubMessage::StreamInvocation(StreamInvocationMessage::new("s", "Broken", vec![])))
        .await;
    assert_matches!(client.next().await, HubMessage::StreamItem(_));
    let completion = client.completion().await;
    assert_eq!(completion.error.as_deref(), Some(STREAM_ERROR_MESSAGE));
    assert!(completion.result.is_none());
}

#[tokio::test]
async fn unknown_cancel_is_ignored() {
    let (logs, _guard) = capture_logs();
    let harness = Harness::plain();
    let (mut client, _run) = harness.connect(None).await;

    client
        .send(HubMessage::CancelInvocation(CancelInvocationMessage::new("ghost")))
        .await;
    client.invoke("1", "Fast", vec![]).await;
    assert_eq!(client.completion().await, CompletionMessage::with_result("1", json!("fast")));
    assert!(logs.has_message("cancel for unknown invocation ignored"));
}

// ── Fan-out ──

#[tokio::test]
async fn send_to_all_except_skips_excluded_connection() {
    let harness = Harness::plain();
    let (mut c1, _r1) = harness.connect(None).await;
    let (mut c2, _r2) = harness.connect(None).await;

    c2.invoke("id", "WhoAmI", vec![]).await;
    let c2_id = c2.completion().await.result.unwrap().as_str().unwrap().to_owned();

    harness
        .handler
        .hub_context()
        .clients
        .all_except(vec![c2_id])
        .send("Hi", vec![])
        .await
        .unwrap();

    assert_eq!(c1.next().await, HubMessage::Invocation(InvocationMessage::new("Hi", vec![])));
    assert!(c1.next_within(SILENCE).await.is_none());
    assert!(c2.next_within(SILENCE).await.is_none());
}

#[tokio::test]
async fn others_excludes_caller() {
    let harness = Harness::plain();
    let (mut c1, _r1) = harness.connect(None).await;
    let (mut c2, _r2) = harness.connect(None).await;

    c1.invoke("1", "Shout", vec![json!("hey")]).await;
    assert_eq!(c1.completion().await, CompletionMessage::with_result("1", Value::Null));
    assert_eq!(
        c2.next().await,
        HubMessage::Invocation(InvocationMessage::new("Heard", vec![json!("hey")]))
    );
    assert!(c1.next_within(SILENCE).await.is_none());
}

#[tokio::test]
async fn group_send_after_member_disconnects() {
    let harness = Harness::plain();
    let (mut c1, r1) = harness.connect(None).await;
    let (mut c2, _r2) = harness.connect(None).await;

    c1.invoke("1", "Join", vec![json!("G")]).await;
    let _ = c1.completion().await;
    c2.invoke("1", "Join", vec![json!("G")]).await;
    let _ = c2.completion().await;

    c1.close().await;
    assert_eq!(c1.next().await, HubMessage::Close(CloseMessage::empty()));
    r1.await.unwrap().unwrap();
    harness.wait_for_connections(1).await;
    assert_eq!(harness.lifetime.groups().member_count("G"), 1);

    harness
        .handler
        .hub_context()
        .clients
        .group("G")
        .send("X", vec![])
        .await
        .unwrap();
    assert_eq!(c2.next().await, HubMessage::Invocation(InvocationMessage::new("X", vec![])));
    assert!(c2.next_within(SILENCE).await.is_none());
}

// ── Handshake and lifecycle ──

#[tokio::test]
async fn unsupported_protocol_fails_handshake() {
    let harness = Harness::plain();
    let (mut client, run) = harness.open(None);

    let response = client.handshake("messagepack", 1).await;
    assert_eq!(response.error.as_deref(), Some("The protocol 'messagepack' is not supported."));
    assert_matches!(run.await.unwrap(), Err(HubError::Handshake(_)));
    assert_eq!(harness.hub.connected.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn unsupported_version_fails_handshake() {
    let harness = Harness::plain();
    let (mut client, run) = harness.open(None);

    let response = client.handshake("json", 7).await;
    assert_eq!(
        response.error.as_deref(),
        Some("The server does not support version 7 of the 'json' protocol.")
    );
    assert!(run.await.unwrap().is_err());
}

#[tokio::test]
async fn silent_client_times_out_during_handshake() {
    let harness = Harness::new(
        TestHub::default(),
        HubOptions {
            handshake_timeout: Duration::from_millis(100),
            ..HubOptions::default()
        },
    );
    let (_client, run) = harness.open(None);
    let result = tokio::time::timeout(TIMEOUT, run).await.unwrap().unwrap();
    assert_matches!(result, Err(HubError::Handshake(_)));
    assert_eq!(harness.lifetime.connection_count(), 0);
}

#[tokio::test]
async fn rejected_on_connected_closes_without_dispatch() {
    let harness = Harness::new(
        TestHub {
            reject_connect: true,
            ..TestHub::default()
        },
        HubOptions::default(),
    );
    let (mut client, run) = harness.connect(None).await;
    client.invoke("1", "Fast", vec![]).await;

    match client.next().await {
        HubMessage::Close(close) => {
            assert_eq!(close.error.as_deref(), Some("Connection closed with an error."));
        }
        other => panic!("expected close, got {other:?}"),
    }
    assert!(client.next_within(SILENCE).await.is_none());
    run.await.unwrap().unwrap();
    assert_eq!(harness.hub.disconnected.load(Ordering::SeqCst), 1);
    assert_eq!(harness.lifetime.connection_count(), 0);
}

#[tokio::test]
async fn client_close_runs_on_disconnected_once() {
    let harness = Harness::plain();
    let (mut client, run) = harness.connect(None).await;

    client.send(HubMessage::Close(CloseMessage::empty())).await;
    assert_eq!(client.next().await, HubMessage::Close(CloseMessage::empty()));
    run.await.unwrap().unwrap();

    assert_eq!(harness.hub.connected.load(Ordering::SeqCst), 1);
    assert_eq!(harness.hub.disconnected.load(Ordering::SeqCst), 1);
    assert_eq!(*harness.hub.disconnect_errors.lock(), vec![None]);
}

#[tokio::test]
async fn unexpected_message_kind_aborts_with_error() {
    let harness = Harness::plain();
    let (mut client, run) = harness.connect(None).await;

    client
        .send(HubMessage::Completion(CompletionMessage::empty("1")))
        .await;
    match client.next().await {
        HubMessage::Close(close) => assert!(close.error.is_some()),
        other => panic!("expected close, got {other:?}"),
    }
    run.await.unwrap().unwrap();

    let errors = harness.hub.disconnect_errors.lock().clone();
    assert_eq!(errors.len(), 1);
    assert!(errors[0].as_deref().unwrap().contains("Unexpected message of kind 'completion'"));
}

#[tokio::test]
async fn truncated_frame_at_eof_is_an_error() {
    let harness = Harness::plain();
    let (mut client, run) = harness.connect(None).await;

    client.writer.write_all(br#"{"type":1,"target":"Fa"#).await.unwrap();
    client.close().await;
    assert_matches!(client.next().await, HubMessage::Close(close) if close.error.is_some());
    run.await.unwrap().unwrap();
    let errors = harness.hub.disconnect_errors.lock().clone();
    assert!(errors[0].as_deref().unwrap().contains("Connection terminated while reading a message."));
}

#[tokio::test]
async fn on_disconnected_error_is_surfaced_after_close() {
    let harness = Harness::new(
        TestHub {
            fail_disconnect: true,
            ..TestHub::default()
        },
        HubOptions::default(),
    );
    let (mut client, run) = harness.connect(None).await;
    client.close().await;

    assert_matches!(client.next().await, HubMessage::Close(_));
    assert_eq!(run.await.unwrap(), Err(HubError::Hub("cleanup failed".into())));
    assert_eq!(harness.hub.disconnected.load(Ordering::SeqCst), 1);
    assert_eq!(harness.lifetime.connection_count(), 0);
}
