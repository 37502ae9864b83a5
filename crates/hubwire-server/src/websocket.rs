//! Bridges an axum WebSocket onto a byte [`Transport`].
//!
//! The hub engine works on byte streams. Inbound frames are written into an
//! in-memory duplex in arrival order; outbound bytes are regrouped into
//! frames at record-separator boundaries, so each text frame carries whole
//! messages.

use axum::extract::ws::{Message, WebSocket};
use bytes::{Bytes, BytesMut};
use futures::{SinkExt, StreamExt};
use hubwire_core::protocol::framing::RECORD_SEPARATOR;
use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream, ReadHalf, WriteHalf};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::transport::Transport;

/// Buffered outbound bytes with no separator are flushed as a binary frame
/// beyond this size.
const MAX_PENDING_FRAME: usize = 1024 * 1024;

/// Split `socket` into a [`Transport`] and the task pumping frames.
///
/// The pump ends once the engine closes its side of the transport, or the
/// client closes the socket.
pub fn bridge(socket: WebSocket, buffer_size: usize) -> (Transport, JoinHandle<()>) {
    let (engine_side, pump_side) = tokio::io::duplex(buffer_size);
    let (to_engine_read, to_engine_write) = tokio::io::split(pump_side);
    let (ws_tx, ws_rx) = socket.split();
    let stop = CancellationToken::new();

    let pump = tokio::spawn(async move {
        let inbound = pump_inbound(ws_rx, to_engine_write, stop.clone());
        let outbound = pump_outbound(to_engine_read, ws_tx, stop);
        let ((), ()) = tokio::join!(inbound, outbound);
    });
    (Transport::from_io(engine_side), pump)
}

async fn pump_inbound(
    mut ws_rx: futures::stream::SplitStream<WebSocket>,
    mut to_engine: WriteHalf<DuplexStream>,
    stop: CancellationToken,
) {
    loop {
        let frame = tokio::select! {
            () = stop.cancelled() => break,
            frame = ws_rx.next() => frame,
        };
        let written = match frame {
            Some(Ok(Message::Text(text))) => to_engine.write_all(text.as_bytes()).await,
            Some(Ok(Message::Binary(data))) => to_engine.write_all(&data).await,
            Some(Ok(Message::Close(_))) | None => break,
            Some(Ok(_)) => Ok(()),
            Some(Err(err)) => {
                debug!(error = %err, "websocket read failed");
                break;
            }
        };
        if written.is_err() {
            break;
        }
    }
    let _ = to_engine.shutdown().await;
}

async fn pump_outbound(
    mut from_engine: ReadHalf<DuplexStream>,
    mut ws_tx: futures::stream::SplitSink<WebSocket, Message>,
    stop: CancellationToken,
) {
    let mut pending = BytesMut::with_capacity(8 * 1024);
    loop {
        match from_engine.read_buf(&mut pending).await {
            Ok(0) | Err(_) => break,
            Ok(_) => {}
        }
        let cut = match pending.iter().rposition(|b| *b == RECORD_SEPARATOR) {
            Some(pos) => pos + 1,
            None if pending.len() > MAX_PENDING_FRAME => pending.len(),
            None => continue,
        };
        let chunk = pending.split_to(cut).freeze();
        if ws_tx.send(frame_for(chunk)).await.is_err() {
            break;
        }
    }
    if !pending.is_empty() {
        let _ = ws_tx.send(frame_for(pending.freeze())).await;
    }
    let _ = ws_tx.send(Message::Close(None)).await;
    trace!("websocket outbound pump finished");
    stop.cancel();
}

fn frame_for(chunk: Bytes) -> Message {
    match std::str::from_utf8(&chunk) {
        Ok(text) => Message::Text(text.into()),
        Err(_) => Message::Binary(chunk),
    }
}
