use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use bytes::Bytes;
use futures_util::{Sink, Stream, StreamExt};
use tokio::net::TcpStream;
use tokio_tungstenite::{
    Connector, MaybeTlsStream, WebSocketStream, connect_async_tls_with_config,
    tungstenite::{
        Error as TungError, Message as TungsteniteMessage, Utf8Bytes,
        protocol::{CloseFrame as TungCloseFrame, WebSocketConfig},
    },
};

use super::{Transport, TransportConnectFuture, install_rustls_crypto_provider, transport_error};
use crate::core::{CloseFrame, Frame, SyncError};

const DEFAULT_MAX_MESSAGE_BYTES: usize = 16 << 20;

/// Readable text for close codes the backend sends without a reason. This text ends up as the
/// `connection_lost` reason.
fn close_code_reason(code: u16) -> String {
    let known = match code {
        1000 => "normal closure",
        1001 => "server going away",
        1002 => "protocol error",
        1003 => "unsupported data",
        1006 => "abnormal closure",
        1007 => "invalid payload",
        1008 => "policy violation",
        1009 => "message too big",
        1011 => "server error",
        1012 => "server restarting",
        1013 => "try again later",
        _ => return format!("closed with code {code}"),
    };
    known.to_string()
}

fn close_to_core(frame: Option<TungCloseFrame>) -> Option<CloseFrame> {
    frame.map(|f| {
        let code = u16::from(f.code);
        let reason = if f.reason.is_empty() {
            Bytes::from(close_code_reason(code))
        } else {
            Bytes::from(f.reason)
        };
        CloseFrame { code, reason }
    })
}

/// An HTTP answer to the upgrade request means the server refused the session (Engine.IO
/// answers unknown `EIO` versions or namespaces with 400/403); anything else is a network failure.
fn connect_error(err: TungError) -> SyncError {
    match err {
        TungError::Http(response) => {
            let status = response.status();
            let body = response
                .body()
                .as_deref()
                .and_then(|b| std::str::from_utf8(b).ok())
                .map(str::trim)
                .filter(|b| !b.is_empty())
                .map(|b| format!(": {b}"))
                .unwrap_or_default();
            SyncError::HandshakeRejected(format!("upgrade refused with HTTP {status}{body}"))
        }
        other => SyncError::ConnectionFailed(other.to_string()),
    }
}

fn core_to_close(frame: CloseFrame) -> TungCloseFrame {
    TungCloseFrame {
        code: frame.code.into(),
        reason: Utf8Bytes::try_from(frame.reason).unwrap_or_else(|_| Utf8Bytes::from_static("")),
    }
}

fn msg_to_frame(msg: TungsteniteMessage) -> Frame {
    match msg {
        TungsteniteMessage::Text(text) => Frame::Text(Bytes::from(text)),
        TungsteniteMessage::Binary(bytes) => Frame::Binary(bytes),
        TungsteniteMessage::Ping(bytes) => Frame::Ping(bytes),
        TungsteniteMessage::Pong(bytes) => Frame::Pong(bytes),
        TungsteniteMessage::Close(frame) => Frame::Close(close_to_core(frame)),
        TungsteniteMessage::Frame(_) => Frame::Binary(Bytes::new()),
    }
}

fn frame_to_msg(frame: Frame) -> TungsteniteMessage {
    match frame {
        Frame::Text(bytes) => match Utf8Bytes::try_from(bytes.clone()) {
            Ok(text) => TungsteniteMessage::Text(text),
            Err(_) => TungsteniteMessage::Binary(bytes),
        },
        Frame::Binary(bytes) => TungsteniteMessage::Binary(bytes),
        Frame::Ping(bytes) => TungsteniteMessage::Ping(bytes),
        Frame::Pong(bytes) => TungsteniteMessage::Pong(bytes),
        Frame::Close(frame) => TungsteniteMessage::Close(frame.map(core_to_close)),
    }
}

/// WebSocket transport over tokio-tungstenite with rustls.
#[derive(Clone)]
pub struct TungsteniteTransport {
    connector: Option<Connector>,
    max_message_bytes: usize,
}

impl Default for TungsteniteTransport {
    fn default() -> Self {
        Self {
            connector: None,
            max_message_bytes: DEFAULT_MAX_MESSAGE_BYTES,
        }
    }
}

impl TungsteniteTransport {
    pub fn with_connector(connector: Connector) -> Self {
        Self {
            connector: Some(connector),
            ..Self::default()
        }
    }

    pub fn rustls(config: Arc<rustls::ClientConfig>) -> Self {
        Self::with_connector(Connector::Rustls(config))
    }

    pub fn with_max_message_bytes(mut self, bytes: usize) -> Self {
        self.max_message_bytes = bytes;
        self
    }
}

pub struct TungsteniteReader {
    inner: futures_util::stream::SplitStream<WebSocketStream<MaybeTlsStream<TcpStream>>>,
}

impl Stream for TungsteniteReader {
    type Item = Result<Frame, SyncError>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        match Pin::new(&mut self.inner).poll_next(cx) {
            Poll::Ready(Some(Ok(msg))) => Poll::Ready(Some(Ok(msg_to_frame(msg)))),
            Poll::Ready(Some(Err(err))) => Poll::Ready(Some(Err(transport_error("read", err)))),
            Poll::Ready(None) => Poll::Ready(None),
            Poll::Pending => Poll::Pending,
        }
    }
}

pub struct TungsteniteWriter {
    inner: futures_util::stream::SplitSink<
        WebSocketStream<MaybeTlsStream<TcpStream>>,
        TungsteniteMessage,
    >,
}

impl Sink<Frame> for TungsteniteWriter {
    type Error = SyncError;

    fn poll_ready(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Pin::new(&mut self.inner)
            .poll_ready(cx)
            .map_err(|e| transport_error("write", e))
    }

    fn start_send(mut self: Pin<&mut Self>, item: Frame) -> Result<(), Self::Error> {
        Pin::new(&mut self.inner)
            .start_send(frame_to_msg(item))
            .map_err(|e| transport_error("write", e))
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Pin::new(&mut self.inner)
            .poll_flush(cx)
            .map_err(|e| transport_error("write", e))
    }

    fn poll_close(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Pin::new(&mut self.inner)
            .poll_close(cx)
            .map_err(|e| transport_error("write", e))
    }
}

impl Transport for TungsteniteTransport {
    type Reader = TungsteniteReader;
    type Writer = TungsteniteWriter;

    fn connect(&self, url: String) -> TransportConnectFuture<Self::Reader, Self::Writer> {
        let connector = self.connector.clone();
        let max_message_bytes = self.max_message_bytes;
        Box::pin(async move {
            install_rustls_crypto_provider();

            let mut config = WebSocketConfig::default();
            config.max_message_size = Some(max_message_bytes);
            config.max_frame_size = Some(max_message_bytes);

            let (stream, _) = connect_async_tls_with_config(url, Some(config), false, connector)
                .await
                .map_err(connect_error)?;

            let (write, read) = stream.split();
            Ok((
                TungsteniteReader { inner: read },
                TungsteniteWriter { inner: write },
            ))
        })
    }

    fn name(&self) -> &'static str {
        "websocket"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn text_frames_map_both_ways() {
        let msg = frame_to_msg(Frame::text("42[\"x\",{}]"));
        assert!(matches!(msg, TungsteniteMessage::Text(_)));
        assert_eq!(msg_to_frame(msg), Frame::text("42[\"x\",{}]"));
    }

    #[test]
    fn invalid_utf8_text_falls_back_to_binary() {
        let msg = frame_to_msg(Frame::Text(Bytes::from_static(&[0xff, 0x00])));
        assert!(matches!(msg, TungsteniteMessage::Binary(_)));
    }

    #[test]
    fn close_frames_keep_code_and_reason() {
        let msg = frame_to_msg(Frame::close(1000, "client disconnect"));
        let Frame::Close(Some(close)) = msg_to_frame(msg) else {
            panic!("expected close frame");
        };
        assert_eq!(close.code, 1000);
        assert_eq!(close.reason_text(), "client disconnect");
    }

    #[test]
    fn empty_close_reason_describes_the_code() {
        let frame = close_to_core(Some(TungCloseFrame {
            code: 1006.into(),
            reason: Utf8Bytes::from_static(""),
        }));
        assert_eq!(frame.as_ref().map(|f| f.reason_text()), Some("abnormal closure"));

        let frame = close_to_core(Some(TungCloseFrame {
            code: 4001.into(),
            reason: Utf8Bytes::from_static(""),
        }));
        assert_eq!(
            frame.as_ref().map(|f| f.reason_text()),
            Some("closed with code 4001")
        );

        let frame = close_to_core(Some(TungCloseFrame {
            code: 1001.into(),
            reason: Utf8Bytes::from_static("shutting down"),
        }));
        assert_eq!(frame.as_ref().map(|f| f.reason_text()), Some("shutting down"));
    }

    #[test]
    fn http_upgrade_refusal_is_a_handshake_rejection() {
        let response = tokio_tungstenite::tungstenite::http::Response::builder()
            .status(400)
            .body(Some(b"{\"code\":5,\"message\":\"Unsupported protocol version\"}".to_vec()))
            .unwrap();
        let err = connect_error(TungError::Http(response.into()));
        let SyncError::HandshakeRejected(reason) = err else {
            panic!("expected handshake rejection, got {err:?}");
        };
        assert!(reason.contains("HTTP 400"), "{reason}");
        assert!(reason.contains("Unsupported protocol version"), "{reason}");
    }

    #[tokio::test]
    async fn refused_connection_is_a_connect_failure() {
        let transport = TungsteniteTransport::default();
        let result = transport.connect("ws://127.0.0.1:1/socket.io/".to_string()).await;
        assert!(matches!(result, Err(SyncError::ConnectionFailed(_))));
    }
}
