//! TCP connection to the feeder endpoint.
//!
//! The device protocol has no framing of its own, so the connection hands
//! up whatever each socket read returns as a [`SocketEvent`]. The
//! [`Transport`] and [`Connector`] traits abstract the socket, allowing
//! channel-based mocks for deterministic testing.

use async_trait::async_trait;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};

use crate::error::{FeederError, FeederResult};
use crate::tracing::prelude::*;

/// Read buffer size; device messages are a few dozen bytes.
const READ_BUF_SIZE: usize = 1024;

/// What happened on the socket.
#[derive(Debug)]
pub enum SocketEvent {
    /// A chunk of bytes arrived
    Data(Vec<u8>),

    /// Peer closed the connection (EOF)
    Closed,

    /// Read failed; the connection is unusable
    Errored(FeederError),
}

/// Byte-level I/O with the device.
#[async_trait]
pub trait Transport: Send {
    /// Wait for the next socket event.
    ///
    /// Must be cancel-safe: the client polls it inside `select!`.
    async fn next_event(&mut self) -> SocketEvent;

    /// Write one complete frame.
    async fn write_frame(&mut self, frame: &[u8]) -> FeederResult<()>;
}

/// Opens transports to the device, once per (re)connect.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self) -> FeederResult<Box<dyn Transport>>;
}

/// TCP connection to the device.
pub struct Connection {
    reader: OwnedReadHalf,
    writer: OwnedWriteHalf,
    read_buf: Vec<u8>,
}

impl Connection {
    /// Create a new connection from a TCP stream.
    pub fn new(stream: TcpStream) -> Self {
        let (reader, writer) = stream.into_split();

        Self {
            reader,
            writer,
            read_buf: vec![0; READ_BUF_SIZE],
        }
    }

    /// Connect to `address` (host:port).
    pub async fn connect(address: &str) -> FeederResult<Self> {
        debug!(address = %address, "Connecting to feeder");

        let stream = TcpStream::connect(address)
            .await
            .map_err(|e| FeederError::ConnectionFailed(e.to_string()))?;

        debug!("Connected to feeder");

        Ok(Self::new(stream))
    }
}

#[async_trait]
impl Transport for Connection {
    async fn next_event(&mut self) -> SocketEvent {
        match self.reader.read(&mut self.read_buf).await {
            Ok(0) => SocketEvent::Closed,
            Ok(n) => SocketEvent::Data(self.read_buf[..n].to_vec()),
            Err(e) => SocketEvent::Errored(FeederError::Io(e)),
        }
    }

    async fn write_frame(&mut self, frame: &[u8]) -> FeederResult<()> {
        trace!(tx = %hex::encode(frame), "Sending frame");

        self.writer.write_all(frame).await?;
        self.writer.flush().await?;

        Ok(())
    }
}

/// Connects over TCP to a fixed address.
#[derive(Debug, Clone)]
pub struct TcpConnector {
    address: String,
}

impl TcpConnector {
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
        }
    }
}

#[async_trait]
impl Connector for TcpConnector {
    async fn connect(&self) -> FeederResult<Box<dyn Transport>> {
        let conn = Connection::connect(&self.address).await?;
        Ok(Box::new(conn))
    }
}

/// Channel-based transport for deterministic testing.
///
/// Backed by tokio mpsc channels rather than TCP, so it works with
/// `tokio::time::pause()` without triggering auto-advance on real I/O.
/// Dropping the handle reads as the peer closing the socket.
#[cfg(test)]
pub(crate) struct MockTransport {
    rx: tokio::sync::mpsc::UnboundedReceiver<SocketEvent>,
    tx: tokio::sync::mpsc::UnboundedSender<Vec<u8>>,
}

/// Test-side handle for a [`MockTransport`].
///
/// Use `send_hex()` to feed device messages to the client and `recv_hex()`
/// to read frames the client wrote.
#[cfg(test)]
pub(crate) struct MockTransportHandle {
    tx: tokio::sync::mpsc::UnboundedSender<SocketEvent>,
    rx: tokio::sync::mpsc::UnboundedReceiver<Vec<u8>>,
}

#[cfg(test)]
impl MockTransport {
    /// Create a linked (transport, handle) pair.
    pub fn pair() -> (Self, MockTransportHandle) {
        let (client_tx, handle_rx) = tokio::sync::mpsc::unbounded_channel();
        let (handle_tx, client_rx) = tokio::sync::mpsc::unbounded_channel();

        let transport = MockTransport {
            rx: client_rx,
            tx: client_tx,
        };
        let handle = MockTransportHandle {
            tx: handle_tx,
            rx: handle_rx,
        };
        (transport, handle)
    }
}

#[cfg(test)]
#[async_trait]
impl Transport for MockTransport {
    async fn next_event(&mut self) -> SocketEvent {
        self.rx.recv().await.unwrap_or(SocketEvent::Closed)
    }

    async fn write_frame(&mut self, frame: &[u8]) -> FeederResult<()> {
        self.tx
            .send(frame.to_vec())
            .map_err(|_| FeederError::Disconnected)
    }
}

#[cfg(test)]
impl MockTransportHandle {
    /// Deliver a hex-encoded chunk to the client.
    pub fn send_hex(&self, hex: &str) {
        let bytes = hex::decode(hex).expect("valid hex");
        self.tx
            .send(SocketEvent::Data(bytes))
            .expect("transport dropped");
    }

    /// Simulate a socket error.
    pub fn fail(&self) {
        self.tx
            .send(SocketEvent::Errored(FeederError::Disconnected))
            .expect("transport dropped");
    }

    /// Receive the next frame the client wrote, hex-encoded.
    pub async fn recv_hex(&mut self) -> String {
        hex::encode(self.rx.recv().await.expect("transport dropped"))
    }

    /// Next written frame, if one is already queued.
    pub fn try_recv_hex(&mut self) -> Option<String> {
        self.rx.try_recv().ok().map(hex::encode)
    }
}

/// Hands out [`MockTransport`]s and passes their handles to the test.
#[cfg(test)]
pub(crate) struct MockConnector {
    handles: tokio::sync::mpsc::UnboundedSender<MockTransportHandle>,
    failures: std::sync::atomic::AtomicUsize,
}

/// Test side of a [`MockConnector`].
#[cfg(test)]
pub(crate) struct MockConnectorHandle {
    handles: tokio::sync::mpsc::UnboundedReceiver<MockTransportHandle>,
}

#[cfg(test)]
impl MockConnector {
    /// Create a connector whose first `failures` connects are refused.
    pub fn new(failures: usize) -> (Self, MockConnectorHandle) {
        let (tx, rx) = tokio::sync::mpsc::unbounded_channel();
        let connector = MockConnector {
            handles: tx,
            failures: std::sync::atomic::AtomicUsize::new(failures),
        };
        (connector, MockConnectorHandle { handles: rx })
    }
}

#[cfg(test)]
#[async_trait]
impl Connector for MockConnector {
    async fn connect(&self) -> FeederResult<Box<dyn Transport>> {
        use std::sync::atomic::Ordering;

        let refused = self
            .failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if refused {
            return Err(FeederError::ConnectionFailed("refused".to_string()));
        }

        let (transport, handle) = MockTransport::pair();
        self.handles
            .send(handle)
            .map_err(|_| FeederError::ConnectionFailed("test ended".to_string()))?;
        Ok(Box::new(transport))
    }
}

#[cfg(test)]
impl MockConnectorHandle {
    /// Wait for the client's next connection.
    pub async fn accept(&mut self) -> MockTransportHandle {
        self.handles.recv().await.expect("connector dropped")
    }

    /// Next connection, if the client already made one.
    pub fn try_accept(&mut self) -> Option<MockTransportHandle> {
        self.handles.try_recv().ok()
    }
}
