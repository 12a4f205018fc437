//! Reusable test utilities for exercising the client without a real server.
//!
//! [`MockTransport::channel_pair`] returns the transport handed to the client plus a
//! [`MockServer`] that decides the fate of every connection attempt: accept it (yielding a
//! [`MockConnection`] used to push inbound frames, read outbound frames or drop the socket) or
//! reject it.

use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::task::{Context, Poll};
use std::time::Duration;

use futures_util::{Sink, Stream};
use sonic_rs::Value;
use tokio::sync::{mpsc, oneshot};

use crate::codec::{Decoded, SocketIoCodec, WireCodec};
use crate::core::{Frame, SyncError, SyncResult};
use crate::transport::{Transport, TransportConnectFuture, transport_error};

type ConnectReply = oneshot::Sender<SyncResult<(MockReader, MockWriter)>>;

/// In-memory transport; every `connect` becomes a [`PendingConnect`] on the paired server.
#[derive(Clone)]
pub struct MockTransport {
    attempts_tx: mpsc::UnboundedSender<PendingConnect>,
    connects: Arc<AtomicUsize>,
}

impl MockTransport {
    /// Build a transport + server control pair.
    pub fn channel_pair() -> (Self, MockServer) {
        let (attempts_tx, attempts_rx) = mpsc::unbounded_channel();
        let connects = Arc::new(AtomicUsize::new(0));
        (
            Self {
                attempts_tx,
                connects: Arc::clone(&connects),
            },
            MockServer {
                attempts_rx,
                connects,
            },
        )
    }
}

impl Transport for MockTransport {
    type Reader = MockReader;
    type Writer = MockWriter;

    fn connect(&self, url: String) -> TransportConnectFuture<Self::Reader, Self::Writer> {
        let attempts_tx = self.attempts_tx.clone();
        let connects = Arc::clone(&self.connects);
        Box::pin(async move {
            connects.fetch_add(1, Ordering::SeqCst);
            let (reply, outcome) = oneshot::channel();
            attempts_tx
                .send(PendingConnect { url, reply })
                .map_err(|_| SyncError::ConnectionFailed("mock server is gone".to_string()))?;
            outcome.await.map_err(|_| {
                SyncError::ConnectionFailed("mock server dropped the attempt".to_string())
            })?
        })
    }

    fn name(&self) -> &'static str {
        "mock"
    }
}

/// Error surface for operations on [`MockConnection`].
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum MockServerError {
    /// The inbound socket side was intentionally dropped.
    SocketDropped,
    /// The client side is no longer reading inbound frames.
    ChannelClosed,
    /// The client did not write the expected frame in time.
    Timeout,
}

impl std::fmt::Display for MockServerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MockServerError::SocketDropped => f.write_str("mock socket already dropped"),
            MockServerError::ChannelClosed => f.write_str("mock client channel is closed"),
            MockServerError::Timeout => f.write_str("timed out waiting for client frame"),
        }
    }
}

impl std::error::Error for MockServerError {}

/// Server-side test handle paired with [`MockTransport`].
pub struct MockServer {
    attempts_rx: mpsc::UnboundedReceiver<PendingConnect>,
    connects: Arc<AtomicUsize>,
}

impl MockServer {
    /// Wait for the client's next connection attempt.
    pub async fn next_attempt(&mut self) -> Option<PendingConnect> {
        self.attempts_rx.recv().await
    }

    pub async fn next_attempt_timeout(&mut self, timeout: Duration) -> Option<PendingConnect> {
        tokio::time::timeout(timeout, self.attempts_rx.recv())
            .await
            .unwrap_or_default()
    }

    /// Accept the next attempt.
    pub async fn accept(&mut self) -> Option<MockConnection> {
        self.next_attempt().await.map(PendingConnect::accept)
    }

    /// Reject the next attempt with a connection failure.
    pub async fn reject(&mut self, reason: &str) -> bool {
        match self.next_attempt().await {
            Some(attempt) => {
                attempt.reject(SyncError::ConnectionFailed(reason.to_string()));
                true
            }
            None => false,
        }
    }

    /// How many times the client called `connect` on the transport.
    pub fn connect_count(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }
}

/// One connection attempt waiting for the server's decision.
pub struct PendingConnect {
    url: String,
    reply: ConnectReply,
}

impl PendingConnect {
    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn accept(self) -> MockConnection {
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        let _ = self.reply.send(Ok((
            MockReader { rx: inbound_rx },
            MockWriter {
                sent_tx: outbound_tx,
            },
        )));
        MockConnection {
            outbound_rx,
            inbound_tx: Some(inbound_tx),
        }
    }

    pub fn reject(self, error: SyncError) {
        let _ = self.reply.send(Err(error));
    }
}

/// Server end of one accepted connection.
pub struct MockConnection {
    outbound_rx: mpsc::UnboundedReceiver<Frame>,
    inbound_tx: Option<mpsc::UnboundedSender<SyncResult<Frame>>>,
}

impl MockConnection {
    /// Receive a frame written by the client.
    pub async fn recv_outbound(&mut self) -> Option<Frame> {
        self.outbound_rx.recv().await
    }

    /// Receive a frame with a timeout.
    pub async fn recv_outbound_timeout(&mut self, timeout: Duration) -> Option<Frame> {
        tokio::time::timeout(timeout, self.outbound_rx.recv())
            .await
            .unwrap_or_default()
    }

    /// Next outbound socket.io event as `(name, payload)`, skipping other packets.
    pub async fn recv_event(&mut self, timeout: Duration) -> Option<(String, Value)> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let frame = tokio::time::timeout_at(deadline, self.outbound_rx.recv())
                .await
                .ok()??;
            if let Some(event) = socketio_event(&frame) {
                return Some(event);
            }
        }
    }

    /// Push an inbound frame to the client.
    pub fn send_frame(&self, frame: Frame) -> Result<(), MockServerError> {
        let Some(tx) = self.inbound_tx.as_ref() else {
            return Err(MockServerError::SocketDropped);
        };
        tx.send(Ok(frame))
            .map_err(|_| MockServerError::ChannelClosed)
    }

    pub fn send_text(&self, text: impl Into<String>) -> Result<(), MockServerError> {
        self.send_frame(Frame::text(text))
    }

    /// Emit a socket.io event on the default namespace.
    pub fn emit(&self, name: &str, payload: &Value) -> Result<(), MockServerError> {
        let args = sonic_rs::to_string(&(name, payload))
            .map_err(|_| MockServerError::ChannelClosed)?;
        self.send_text(format!("42{args}"))
    }

    /// Run the engine.io open + socket.io namespace connect exchange on the default namespace.
    pub async fn open_socketio(&mut self, sid: &str) -> Result<(), MockServerError> {
        self.send_text(format!(
            r#"0{{"sid":"{sid}","upgrades":[],"pingInterval":25000,"pingTimeout":20000,"maxPayload":1000000}}"#
        ))?;
        let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
        loop {
            let frame = tokio::time::timeout_at(deadline, self.outbound_rx.recv())
                .await
                .map_err(|_| MockServerError::Timeout)?
                .ok_or(MockServerError::ChannelClosed)?;
            if frame.as_text() == Some("40") {
                break;
            }
        }
        self.send_text(format!(r#"40{{"sid":"{sid}-io"}}"#))
    }

    /// Fail the next read with a transport error.
    pub fn send_error(&self, error: &str) -> Result<(), MockServerError> {
        let Some(tx) = self.inbound_tx.as_ref() else {
            return Err(MockServerError::SocketDropped);
        };
        tx.send(Err(transport_error("read", error)))
            .map_err(|_| MockServerError::ChannelClosed)
    }

    /// Send a close frame carrying `reason`, then drop the socket.
    pub fn close_with_reason(&mut self, reason: &str) -> Result<(), MockServerError> {
        let sent = self.send_frame(Frame::close(1006, reason));
        self.drop_socket();
        sent
    }

    /// Simulate server-side socket drop by closing the inbound channel.
    pub fn drop_socket(&mut self) {
        self.inbound_tx = None;
    }
}

/// Decode an outbound socket.io event frame into `(name, payload)`.
pub fn socketio_event(frame: &Frame) -> Option<(String, Value)> {
    match SocketIoCodec::default().decode(frame) {
        Ok(Decoded::Event { name, payload }) => Some((name, payload)),
        _ => None,
    }
}

/// Reader side for [`MockTransport`].
pub struct MockReader {
    rx: mpsc::UnboundedReceiver<SyncResult<Frame>>,
}

impl Stream for MockReader {
    type Item = SyncResult<Frame>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.rx.poll_recv(cx)
    }
}

/// Writer side for [`MockTransport`].
pub struct MockWriter {
    sent_tx: mpsc::UnboundedSender<Frame>,
}

impl Sink<Frame> for MockWriter {
    type Error = SyncError;

    fn poll_ready(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn start_send(self: Pin<&mut Self>, item: Frame) -> Result<(), Self::Error> {
        self.get_mut()
            .sent_tx
            .send(item)
            .map_err(|_| transport_error("write", "mock outbound channel closed"))
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn poll_close(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }
}
