//! In-memory instrument port for tests.
//!
//! `MockSerialPort` implements `AsyncRead` and `AsyncWrite` and is handed to an
//! adapter through [`MockOpener`]; the matching `MockDeviceHarness` stays in the
//! test and scripts the instrument side: assert on the bytes the adapter wrote,
//! then send back a response.
//!
//! The pair is joined by two unbounded channels:
//! - `MockSerialPort` (given to the adapter): implements AsyncRead/AsyncWrite
//! - `MockDeviceHarness` (kept in the test): scripts device behaviour
//!
//! # Example
//!
//! ```rust,ignore
//! let (port, mut harness) = mock_serial::new();
//! let opener = MockOpener::with_port(port);
//! let mut adapter = SerialTextAdapter::new(&spec, Arc::new(opener))?;
//! adapter.connect().await?;
//!
//! let poll = tokio::spawn(async move { adapter.poll(Utc::now()).await });
//! harness.expect_write(b"lrec\r").await;
//! harness.send_response(b"lrec 12:01 30.2\r").unwrap();
//! ```

use super::{BoxedTransport, ChannelOpener};
use crate::error::{AppResult, DaqError};
use async_trait::async_trait;
use std::collections::VecDeque;
use std::io;
use std::pin::Pin;
use std::sync::Mutex;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::time::{timeout, Duration};

/// Adapter-facing side of the mock port
#[derive(Debug)]
pub struct MockSerialPort {
    /// Written bytes, forwarded to the harness
    writes_tx: UnboundedSender<Vec<u8>>,
    /// Chunks the harness sends back
    reads_rx: UnboundedReceiver<Vec<u8>>,
    /// Received but not yet read
    read_buffer: VecDeque<u8>,
}

/// Test-facing side of the mock port
#[derive(Debug)]
pub struct MockDeviceHarness {
    writes_rx: UnboundedReceiver<Vec<u8>>,
    reads_tx: UnboundedSender<Vec<u8>>,
    write_buffer: Vec<u8>,
}

/// Creates a connected port/harness pair
pub fn new() -> (MockSerialPort, MockDeviceHarness) {
    let (client_to_harness_tx, client_to_harness_rx) = mpsc::unbounded_channel();
    let (harness_to_client_tx, harness_to_client_rx) = mpsc::unbounded_channel();

    let port = MockSerialPort {
        writes_tx: client_to_harness_tx,
        reads_rx: harness_to_client_rx,
        read_buffer: VecDeque::new(),
    };

    let harness = MockDeviceHarness {
        writes_rx: client_to_harness_rx,
        reads_tx: harness_to_client_tx,
        write_buffer: Vec::new(),
    };

    (port, harness)
}

impl AsyncRead for MockSerialPort {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        if self.read_buffer.is_empty() {
            match self.reads_rx.poll_recv(cx) {
                Poll::Ready(Some(chunk)) => self.read_buffer.extend(chunk),
                // Harness dropped: end of file
                Poll::Ready(None) => return Poll::Ready(Ok(())),
                Poll::Pending => return Poll::Pending,
            }
        }
        let to_read = std::cmp::min(buf.remaining(), self.read_buffer.len());
        let chunk: Vec<u8> = self.read_buffer.drain(..to_read).collect();
        buf.put_slice(&chunk);
        Poll::Ready(Ok(()))
    }
}

impl AsyncWrite for MockSerialPort {
    fn poll_write(
        self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self.writes_tx.send(buf.to_vec()) {
            Ok(_) => Poll::Ready(Ok(buf.len())),
            Err(_) => Poll::Ready(Err(io::Error::new(
                io::ErrorKind::BrokenPipe,
                "mock device harness disconnected",
            ))),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }
}

impl MockDeviceHarness {
    /// Send bytes as if the instrument had written them.
    pub fn send_response(&self, data: &[u8]) -> Result<(), &'static str> {
        self.reads_tx
            .send(data.to_vec())
            .map_err(|_| "Failed to send response: client port disconnected")
    }

    /// Wait for the adapter to write `expected` and assert it matches.
    ///
    /// # Panics
    /// Panics if the bytes do not arrive within 2 seconds or differ.
    pub async fn expect_write(&mut self, expected: &[u8]) {
        let timeout_duration = Duration::from_secs(2);

        while self.write_buffer.len() < expected.len() {
            match timeout(timeout_duration, self.writes_rx.recv()).await {
                Ok(Some(chunk)) => self.write_buffer.extend_from_slice(&chunk),
                Ok(None) => panic!("Client-side port closed while expecting a write."),
                Err(_) => panic!(
                    "Timeout waiting for write. Expected `{:?}`, but only received `{:?}`.",
                    String::from_utf8_lossy(expected),
                    String::from_utf8_lossy(&self.write_buffer),
                ),
            }
        }

        let actual = &self.write_buffer[..expected.len()];
        assert_eq!(
            actual,
            expected,
            "Mismatch in expected write. Expected `{:?}`, got `{:?}`.",
            String::from_utf8_lossy(expected),
            String::from_utf8_lossy(actual)
        );
        self.write_buffer.drain(..expected.len());
    }

    /// Expect a command and answer it.
    pub async fn expect_and_respond(&mut self, expected: &[u8], response: &[u8]) {
        self.expect_write(expected).await;
        if let Err(e) = self.send_response(response) {
            panic!("{e}");
        }
    }

    /// Next complete write, whatever it is.
    pub async fn next_write(&mut self) -> Option<Vec<u8>> {
        if !self.write_buffer.is_empty() {
            return Some(std::mem::take(&mut self.write_buffer));
        }
        timeout(Duration::from_secs(2), self.writes_rx.recv())
            .await
            .ok()
            .flatten()
    }
}

/// [`ChannelOpener`] handing out prepared mock ports, one per `open`.
#[derive(Debug, Default)]
pub struct MockOpener {
    ports: Mutex<VecDeque<MockSerialPort>>,
}

impl MockOpener {
    /// Opener with one port queued.
    pub fn with_port(port: MockSerialPort) -> Self {
        let opener = Self::default();
        opener.push(port);
        opener
    }

    /// Queue another port for the next reconnect.
    pub fn push(&self, port: MockSerialPort) {
        self.ports
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push_back(port);
    }
}

#[async_trait]
impl ChannelOpener for MockOpener {
    async fn open(&self) -> AppResult<BoxedTransport> {
        let port = self
            .ports
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .pop_front();
        match port {
            Some(port) => Ok(Box::new(port)),
            None => Err(DaqError::Io(io::Error::new(
                io::ErrorKind::NotFound,
                "no mock port available",
            ))),
        }
    }

    fn describe(&self) -> String {
        "mock port".to_string()
    }
}
