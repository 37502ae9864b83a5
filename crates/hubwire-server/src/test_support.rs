//! Helpers shared by unit tests.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use hubwire_core::errors::ProtocolError;
use hubwire_core::protocol::{HubMessage, HubProtocol, JsonHubProtocol};
use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream, ReadHalf, WriteHalf};
use tokio::task::JoinHandle;

use crate::connection::HubConnection;
use crate::options::HubOptions;

const READ_TIMEOUT: Duration = Duration::from_secs(5);

/// JSON codec under another name that counts encodes.
#[derive(Debug)]
pub struct CountingProtocol {
    name: String,
    calls: AtomicUsize,
}

impl CountingProtocol {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_owned(),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl HubProtocol for CountingProtocol {
    fn name(&self) -> &str {
        &self.name
    }

    fn version(&self) -> u32 {
        1
    }

    fn try_parse_message(&self, buf: &mut BytesMut) -> Result<Option<HubMessage>, ProtocolError> {
        JsonHubProtocol.try_parse_message(buf)
    }

    fn write_message(&self, message: &HubMessage) -> Result<Bytes, ProtocolError> {
        let _ = self.calls.fetch_add(1, Ordering::SeqCst);
        JsonHubProtocol.write_message(message)
    }
}

/// The client side of an in-memory transport, speaking JSON.
pub struct ClientEnd {
    reader: ReadHalf<DuplexStream>,
    writer: WriteHalf<DuplexStream>,
    buf: BytesMut,
}

impl ClientEnd {
    pub fn new(io: DuplexStream) -> Self {
        let (reader, writer) = tokio::io::split(io);
        Self {
            reader,
            writer,
            buf: BytesMut::new(),
        }
    }

    /// Next message; panics on EOF or after five seconds.
    pub async fn next_message(&mut self) -> HubMessage {
        match self.try_next_message().await {
            Some(message) => message,
            None => panic!("expected a message from the server"),
        }
    }

    /// Next message, or `None` on EOF or timeout.
    pub async fn try_next_message(&mut self) -> Option<HubMessage> {
        self.next_within(READ_TIMEOUT).await
    }

    /// Next message within `wait`.
    pub async fn next_within(&mut self, wait: Duration) -> Option<HubMessage> {
        let read = async {
            loop {
                if let Some(message) = JsonHubProtocol.try_parse_message(&mut self.buf).unwrap() {
                    return Some(message);
                }
                let n = self.reader.read_buf(&mut self.buf).await.ok()?;
                if n == 0 {
                    return None;
                }
            }
        };
        tokio::time::timeout(wait, read).await.ok().flatten()
    }

    /// Read until EOF; `true` when nothing else arrived.
    pub async fn read_to_end(&mut self) -> bool {
        let mut rest = Vec::new();
        let read = tokio::time::timeout(READ_TIMEOUT, self.reader.read_to_end(&mut rest)).await;
        matches!(read, Ok(Ok(_))) && rest.is_empty() && self.buf.is_empty()
    }

    /// Send raw bytes to the server.
    pub async fn send_raw(&mut self, bytes: &[u8]) {
        self.writer.write_all(bytes).await.unwrap();
    }

    /// Send a message to the server.
    pub async fn send(&mut self, message: &HubMessage) {
        let bytes = JsonHubProtocol.write_message(message).unwrap();
        self.send_raw(&bytes).await;
    }

    /// Close the client's write direction.
    pub async fn close(&mut self) {
        self.writer.shutdown().await.unwrap();
    }
}

/// A connection with a running drain task and its client end.
pub fn connection_pair(options: HubOptions) -> (Arc<HubConnection>, JoinHandle<()>, ClientEnd) {
    let id = hubwire_core::ConnectionId::new();
    connection_pair_with_id(id.as_str(), &options)
}

/// Like [`connection_pair`] with a fixed id.
pub fn connection_pair_with_id(
    id: &str,
    options: &HubOptions,
) -> (Arc<HubConnection>, JoinHandle<()>, ClientEnd) {
    connection_pair_for(id, None, options)
}

/// A connection with a fixed id and user identifier.
pub fn connection_pair_for(
    id: &str,
    user: Option<&str>,
    options: &HubOptions,
) -> (Arc<HubConnection>, JoinHandle<()>, ClientEnd) {
    let (client, server) = tokio::io::duplex(64 * 1024);
    let (_, writer) = tokio::io::split(server);
    let conn = Arc::new(
        HubConnection::new(Arc::new(JsonHubProtocol), options)
            .with_id(id)
            .with_user_identifier(user.map(str::to_owned)),
    );
    let drain = conn.start_drain(Box::new(writer)).unwrap();
    (conn, drain, ClientEnd::new(client))
}
