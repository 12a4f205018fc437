//! Engine.IO HTTP long-polling.
//!
//! The handshake `GET` returns the open packet carrying the session id; afterwards the reader
//! keeps one `GET` outstanding and the writer `POST`s each outbound packet. A response body may
//! hold several packets separated by the record separator `\x1e`.

use std::collections::VecDeque;
use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll, ready};

use bytes::Bytes;
use futures_util::stream::BoxStream;
use futures_util::{Sink, Stream, StreamExt};
use reqwest::Client;
use reqwest::header::CONTENT_TYPE;
use sonic_rs::{JsonValueTrait, Value};
use tracing::debug;
use url::Url;

use super::{Transport, TransportConnectFuture, transport_error};
use crate::codec::set_query_pairs;
use crate::core::{Frame, SyncError, SyncResult};

const RECORD_SEPARATOR: u8 = 0x1e;
const CLOSE_PACKET: &[u8] = b"1";

/// Long-polling transport for networks that block websocket upgrades.
#[derive(Clone)]
pub struct PollingTransport {
    client: Client,
}

impl PollingTransport {
    pub fn new() -> Self {
        Self {
            client: Client::new(),
        }
    }

    pub fn with_client(client: Client) -> Self {
        Self { client }
    }
}

impl Default for PollingTransport {
    fn default() -> Self {
        Self::new()
    }
}

/// Map a websocket endpoint to its long-polling twin (`ws` to `http`, `transport=polling`).
pub fn polling_url(endpoint: &str) -> SyncResult<Url> {
    let mut url = Url::parse(endpoint)
        .map_err(|e| SyncError::Config(format!("invalid url {endpoint:?}: {e}")))?;
    let scheme = match url.scheme() {
        "ws" | "http" => "http",
        "wss" | "https" => "https",
        other => {
            return Err(SyncError::Config(format!(
                "unsupported url scheme {other:?} in {endpoint:?}"
            )));
        }
    };
    url.set_scheme(scheme)
        .map_err(|_| SyncError::Config(format!("cannot use scheme {scheme} for {endpoint:?}")))?;
    set_query_pairs(&mut url, &[("EIO", "4"), ("transport", "polling")]);
    Ok(url)
}

/// Split one polling payload into packet frames without copying.
pub fn split_payload(body: Bytes) -> Vec<Frame> {
    let mut frames = Vec::new();
    let mut start = 0;
    for (idx, byte) in body.iter().enumerate() {
        if *byte == RECORD_SEPARATOR {
            if idx > start {
                frames.push(Frame::Text(body.slice(start..idx)));
            }
            start = idx + 1;
        }
    }
    if start < body.len() {
        frames.push(Frame::Text(body.slice(start..)));
    }
    frames
}

fn session_id(open: &Frame) -> SyncResult<String> {
    let text = open
        .as_text()
        .and_then(|t| t.strip_prefix('0'))
        .ok_or_else(|| SyncError::HandshakeRejected("missing engine.io open packet".to_string()))?;
    let value: Value = sonic_rs::from_str(text)
        .map_err(|e| SyncError::HandshakeRejected(format!("engine.io open packet: {e}")))?;
    value
        .get("sid")
        .and_then(|v| v.as_str())
        .map(str::to_string)
        .ok_or_else(|| SyncError::HandshakeRejected("open packet without sid".to_string()))
}

async fn fetch(client: &Client, url: &Url) -> SyncResult<Bytes> {
    let response = client
        .get(url.clone())
        .send()
        .await
        .map_err(|e| transport_error("poll", e))?;
    let status = response.status();
    if !status.is_success() {
        return Err(transport_error("poll", format!("http status {status}")));
    }
    response.bytes().await.map_err(|e| transport_error("poll", e))
}

async fn post_packet(client: Client, url: Url, body: Bytes) -> SyncResult<()> {
    let response = client
        .post(url)
        .header(CONTENT_TYPE, "text/plain;charset=UTF-8")
        .body(body)
        .send()
        .await
        .map_err(|e| transport_error("post", e))?;
    let status = response.status();
    if !status.is_success() {
        return Err(transport_error("post", format!("http status {status}")));
    }
    Ok(())
}

struct PollState {
    client: Client,
    url: Url,
    pending: VecDeque<Frame>,
    done: bool,
}

pub struct PollingReader {
    inner: BoxStream<'static, SyncResult<Frame>>,
}

impl PollingReader {
    fn new(client: Client, url: Url, initial: Vec<Frame>) -> Self {
        let state = PollState {
            client,
            url,
            pending: initial.into(),
            done: false,
        };
        let inner = futures_util::stream::unfold(state, |mut state| async move {
            loop {
                if let Some(frame) = state.pending.pop_front() {
                    return Some((Ok(frame), state));
                }
                if state.done {
                    return None;
                }
                match fetch(&state.client, &state.url).await {
                    Ok(body) => {
                        let frames = split_payload(body);
                        debug!(packets = frames.len(), "polling payload received");
                        if frames
                            .iter()
                            .any(|f| f.as_text().is_some_and(|t| t.as_bytes() == CLOSE_PACKET))
                        {
                            state.done = true;
                        }
                        state.pending.extend(frames);
                    }
                    Err(err) => {
                        state.done = true;
                        return Some((Err(err), state));
                    }
                }
            }
        })
        .boxed();
        Self { inner }
    }
}

impl Stream for PollingReader {
    type Item = SyncResult<Frame>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.inner.poll_next_unpin(cx)
    }
}

type PostFuture = Pin<Box<dyn Future<Output = SyncResult<()>> + Send>>;

/// Sink that posts one packet per frame, keeping at most one request in flight.
pub struct PollingWriter {
    client: Client,
    url: Url,
    in_flight: Option<PostFuture>,
    closed: bool,
}

impl PollingWriter {
    fn poll_in_flight(&mut self, cx: &mut Context<'_>) -> Poll<SyncResult<()>> {
        let Some(request) = self.in_flight.as_mut() else {
            return Poll::Ready(Ok(()));
        };
        let result = ready!(request.as_mut().poll(cx));
        self.in_flight = None;
        Poll::Ready(result)
    }

    fn start_post(&mut self, body: Bytes) {
        self.in_flight = Some(Box::pin(post_packet(
            self.client.clone(),
            self.url.clone(),
            body,
        )));
    }
}

impl Sink<Frame> for PollingWriter {
    type Error = SyncError;

    fn poll_ready(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.get_mut().poll_in_flight(cx)
    }

    fn start_send(self: Pin<&mut Self>, item: Frame) -> Result<(), Self::Error> {
        let this = self.get_mut();
        if this.closed {
            return Err(transport_error("post", "session closed"));
        }
        match item {
            Frame::Text(body) | Frame::Binary(body) => this.start_post(body),
            Frame::Close(_) => {
                this.closed = true;
                this.start_post(Bytes::from_static(CLOSE_PACKET));
            }
            // Heartbeats travel as engine.io packets on this transport.
            Frame::Ping(_) | Frame::Pong(_) => {}
        }
        Ok(())
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.get_mut().poll_in_flight(cx)
    }

    fn poll_close(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        let this = self.get_mut();
        ready!(this.poll_in_flight(cx))?;
        if !this.closed {
            this.closed = true;
            this.start_post(Bytes::from_static(CLOSE_PACKET));
            return this.poll_in_flight(cx);
        }
        Poll::Ready(Ok(()))
    }
}

impl Transport for PollingTransport {
    type Reader = PollingReader;
    type Writer = PollingWriter;

    fn connect(&self, url: String) -> TransportConnectFuture<Self::Reader, Self::Writer> {
        let client = self.client.clone();
        Box::pin(async move {
            let mut url = polling_url(&url)?;
            let body = fetch(&client, &url).await.map_err(|err| match err {
                SyncError::TransportError { error, .. } => SyncError::ConnectionFailed(error),
                other => other,
            })?;
            let frames = split_payload(body);
            let sid = frames
                .first()
                .ok_or_else(|| SyncError::HandshakeRejected("empty handshake".to_string()))
                .and_then(session_id)?;
            set_query_pairs(&mut url, &[("sid", sid.as_str())]);
            debug!(sid = %sid, "polling session opened");

            let reader = PollingReader::new(client.clone(), url.clone(), frames);
            let writer = PollingWriter {
                client,
                url,
                in_flight: None,
                closed: false,
            };
            Ok((reader, writer))
        })
    }

    fn name(&self) -> &'static str {
        "polling"
    }
}
