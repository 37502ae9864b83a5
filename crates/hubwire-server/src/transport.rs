//! Duplex byte stream handed to a connection.

use tokio::io::{AsyncRead, AsyncWrite};

/// Boxed read half.
pub type TransportReader = Box<dyn AsyncRead + Send + Unpin>;

/// Boxed write half.
pub type TransportWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// An already-negotiated duplex byte stream.
///
/// The read half is consumed by the dispatch loop; the write half is moved
/// into the connection's drain task, which becomes its only writer.
pub struct Transport {
    /// Inbound bytes.
    pub reader: TransportReader,
    /// Outbound bytes.
    pub writer: TransportWriter,
}

impl Transport {
    /// Build from separate halves.
    pub fn new(
        reader: impl AsyncRead + Send + Unpin + 'static,
        writer: impl AsyncWrite + Send + Unpin + 'static,
    ) -> Self {
        Self {
            reader: Box::new(reader),
            writer: Box::new(writer),
        }
    }

    /// Split any duplex stream (TCP socket, `tokio::io::duplex`, ...).
    pub fn from_io<T>(io: T) -> Self
    where
        T: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (reader, writer) = tokio::io::split(io);
        Self::new(reader, writer)
    }
}

impl std::fmt::Debug for Transport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transport").finish_non_exhaustive()
    }
}
