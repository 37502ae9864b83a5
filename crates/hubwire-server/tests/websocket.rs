//! Hub traffic over a real WebSocket served by `HubServer`.

use std::time::Duration;

use bytes::BytesMut;
use futures::{SinkExt, StreamExt};
use serde_json::{Value, json};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

use hubwire_core::protocol::handshake;
use hubwire_core::protocol::{
    CompletionMessage, HubMessage, HubProtocol, InvocationMessage, JsonHubProtocol,
    StreamInvocationMessage,
};
use hubwire_server::{Hub, HubConnectionHandler, HubServer, MethodTable, SingletonActivator, StreamSource};
use hubwire_settings::HubSettings;

const TIMEOUT: Duration = Duration::from_secs(5);

struct Greeter;
impl Hub for Greeter {}

fn server() -> HubServer<Greeter> {
    let methods = MethodTable::builder()
        .method("Greet", |_, ctx| async move {
            let name: String = ctx.arg(0)?;
            Ok(json!(format!("hello {name}")))
        })
        .stream("Count", |_, ctx| async move {
            let n: u32 = ctx.arg(0)?;
            Ok(StreamSource::from_values((0..n).map(Value::from)))
        })
        .build()
        .unwrap();
    HubServer::new(
        HubSettings::default(),
        HubConnectionHandler::builder(methods, SingletonActivator::new(Greeter)),
    )
    .unwrap()
}

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

struct WsClient {
    socket: Socket,
    buf: BytesMut,
}

impl WsClient {
    async fn connect(url: &str) -> Self {
        let (mut socket, _) = tokio_tungstenite::connect_async(url).await.unwrap();
        socket
            .send(Message::Text("{\"protocol\":\"json\",\"version\":1}\u{1e}".into()))
            .await
            .unwrap();

        let mut buf = BytesMut::new();
        let response = tokio::time::timeout(TIMEOUT, async {
            loop {
                if let Some(response) = handshake::try_parse_response(&mut buf).unwrap() {
                    return response;
                }
                let frame = socket.next().await.unwrap().unwrap();
                buf.extend_from_slice(&frame.into_data());
            }
        })
        .await
        .unwrap();
        assert!(response.error.is_none());
        Self { socket, buf }
    }

    async fn send(&mut self, message: &HubMessage) {
        let bytes = JsonHubProtocol.write_message(message).unwrap();
        let text = String::from_utf8(bytes.to_vec()).unwrap();
        self.socket.send(Message::Text(text.into())).await.unwrap();
    }

    async fn next(&mut self) -> HubMessage {
        tokio::time::timeout(TIMEOUT, async {
            loop {
                if let Some(message) = JsonHubProtocol.try_parse_message(&mut self.buf).unwrap() {
                    if message == HubMessage::Ping {
                        continue;
                    }
                    return message;
                }
                match self.socket.next().await.unwrap().unwrap() {
                    Message::Text(text) => self.buf.extend_from_slice(text.as_bytes()),
                    Message::Binary(data) => self.buf.extend_from_slice(&data),
                    _ => {}
                }
            }
        })
        .await
        .unwrap()
    }
}

#[tokio::test]
async fn invoke_over_websocket() {
    let server = server();
    let handle = server.listen().await.unwrap();
    let url = format!("ws://{}/hub", handle.addr);

    let mut client = WsClient::connect(&url).await;
    client
        .send(&HubMessage::Invocation(InvocationMessage::with_id("1", "greet", vec![json!("ws")])))
        .await;
    assert_eq!(
        client.next().await,
        HubMessage::Completion(CompletionMessage::with_result("1", json!("hello ws")))
    );

    server.shutdown(handle, Some(Duration::from_secs(2))).await;
}

#[tokio::test]
async fn stream_over_websocket() {
    let server = server();
    let handle = server.listen().await.unwrap();
    let mut client = WsClient::connect(&format!("ws://{}/hub", handle.addr)).await;

    client
        .send(&HubMessage::StreamInvocation(StreamInvocationMessage::new("s", "Count", vec![json!(3)])))
        .await;
    let mut items = Vec::new();
    let completion = loop {
        match client.next().await {
            HubMessage::StreamItem(item) => items.push(item.item),
            HubMessage::Completion(completion) => break completion,
            other => panic!("unexpected {other:?}"),
        }
    };
    assert_eq!(items, vec![json!(0), json!(1), json!(2)]);
    assert_eq!(completion, CompletionMessage::empty("s"));

    server.shutdown(handle, Some(Duration::from_secs(2))).await;
}

#[tokio::test]
async fn server_broadcast_reaches_socket_client() {
    let server = server();
    let handle = server.listen().await.unwrap();
    let mut client = WsClient::connect(&format!("ws://{}/hub", handle.addr)).await;

    tokio::time::timeout(TIMEOUT, async {
        while server.lifetime().connection_count() == 0 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap();

    server
        .hub_context()
        .clients
        .all()
        .send("notice", vec![json!("maintenance")])
        .await
        .unwrap();
    assert_eq!(
        client.next().await,
        HubMessage::Invocation(InvocationMessage::new("notice", vec![json!("maintenance")]))
    );

    server.shutdown(handle, Some(Duration::from_secs(2))).await;
    assert_eq!(server.lifetime().connection_count(), 0);
}
