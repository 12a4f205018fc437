//! Socket.IO v5 over Engine.IO v4.
//!
//! Engine.IO packet types (first character): `0` open, `1` close, `2` ping, `3` pong,
//! `4` message, `6` noop. A `4` message carries a Socket.IO packet whose first character is
//! `0` connect, `1` disconnect, `2` event, `3` ack, `4` connect error, `5`/`6` binary variants.
//! Non-default namespaces prefix the packet body with `/nsp,`.

use std::time::Duration;

use serde::Deserialize;
use sonic_rs::{JsonValueTrait, Value};
use tracing::debug;

use super::{Decoded, WireCodec, set_query_pairs, websocket_url};
use crate::core::{Directive, Frame, SyncError, SyncResult};

pub const DEFAULT_NAMESPACE: &str = "/";
const DEFAULT_PATH: &str = "/socket.io/";

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct OpenPacket {
    sid: String,
    #[serde(default)]
    ping_interval: Option<u64>,
    #[serde(default)]
    ping_timeout: Option<u64>,
}

#[derive(Debug, Clone)]
pub struct SocketIoCodec {
    namespace: String,
    path: String,
    session_id: Option<String>,
}

impl SocketIoCodec {
    pub fn new(namespace: impl Into<String>) -> Self {
        let mut namespace = namespace.into();
        if !namespace.starts_with('/') {
            namespace.insert(0, '/');
        }
        Self {
            namespace,
            path: DEFAULT_PATH.to_string(),
            session_id: None,
        }
    }

    /// Override the server mount path (defaults to `/socket.io/`).
    pub fn with_path(mut self, path: impl Into<String>) -> Self {
        self.path = path.into();
        self
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    /// Engine.IO session id of the current connection.
    pub fn session_id(&self) -> Option<&str> {
        self.session_id.as_deref()
    }

    fn is_default_namespace(&self) -> bool {
        self.namespace == DEFAULT_NAMESPACE
    }

    fn connect_packet(&self) -> Frame {
        if self.is_default_namespace() {
            Frame::text_static("40")
        } else {
            Frame::text(format!("40{},", self.namespace))
        }
    }

    fn decode_engine(&mut self, text: &str) -> SyncResult<Decoded> {
        let mut chars = text.chars();
        let Some(kind) = chars.next() else {
            return Err(SyncError::ParseFailed("empty engine.io packet".to_string()));
        };
        let body = chars.as_str();

        match kind {
            '0' => {
                let open: OpenPacket = sonic_rs::from_str(body)
                    .map_err(|e| SyncError::ParseFailed(format!("engine.io open packet: {e}")))?;
                let heartbeat = match (open.ping_interval, open.ping_timeout) {
                    (Some(interval), Some(timeout)) => {
                        Some(Duration::from_millis(interval.saturating_add(timeout)))
                    }
                    _ => None,
                };
                self.session_id = Some(open.sid.clone());
                Ok(Decoded::Opened {
                    channel_id: Some(open.sid),
                    heartbeat,
                    replies: vec![self.connect_packet()],
                })
            }
            '1' => Ok(Decoded::Closed {
                reason: "transport close".to_string(),
            }),
            '2' => Ok(Decoded::Reply(Frame::text(format!("3{body}")))),
            '3' | '6' => Ok(Decoded::Ignore),
            '4' => self.decode_socket(body),
            other => Err(SyncError::ParseFailed(format!(
                "unknown engine.io packet type {other:?}"
            ))),
        }
    }

    fn decode_socket(&mut self, packet: &str) -> SyncResult<Decoded> {
        let mut chars = packet.chars();
        let Some(kind) = chars.next() else {
            return Err(SyncError::ParseFailed("empty socket.io packet".to_string()));
        };
        let (namespace, body) = split_namespace(chars.as_str());
        if namespace.unwrap_or(DEFAULT_NAMESPACE) != self.namespace {
            debug!(namespace = ?namespace, "ignoring packet for another namespace");
            return Ok(Decoded::Ignore);
        }

        match kind {
            '0' => {
                let channel_id = if body.is_empty() {
                    None
                } else {
                    let value: Value = sonic_rs::from_str(body).map_err(|e| {
                        SyncError::ParseFailed(format!("socket.io connect packet: {e}"))
                    })?;
                    value.get("sid").and_then(|v| v.as_str()).map(str::to_string)
                };
                Ok(Decoded::Ready {
                    channel_id: channel_id.or_else(|| self.session_id.clone()),
                })
            }
            '1' => Ok(Decoded::Closed {
                reason: "io server disconnect".to_string(),
            }),
            '2' => decode_event(body),
            '3' => Ok(Decoded::Ignore),
            '4' => {
                let reason = sonic_rs::from_str::<Value>(body)
                    .ok()
                    .and_then(|v| v.get("message").and_then(|m| m.as_str()).map(str::to_string))
                    .unwrap_or_else(|| body.to_string());
                Ok(Decoded::Rejected { reason })
            }
            '5' | '6' => {
                debug!("ignoring binary socket.io packet");
                Ok(Decoded::Ignore)
            }
            other => Err(SyncError::ParseFailed(format!(
                "unknown socket.io packet type {other:?}"
            ))),
        }
    }
}

impl Default for SocketIoCodec {
    fn default() -> Self {
        Self::new(DEFAULT_NAMESPACE)
    }
}

impl WireCodec for SocketIoCodec {
    fn endpoint(&self, base: &str) -> SyncResult<String> {
        let mut url = websocket_url(base)?;
        if url.path().is_empty() || url.path() == "/" {
            url.set_path(&self.path);
        }
        set_query_pairs(&mut url, &[("EIO", "4"), ("transport", "websocket")]);
        Ok(url.into())
    }

    fn awaits_handshake(&self) -> bool {
        true
    }

    fn on_open(&mut self) -> Vec<Frame> {
        self.session_id = None;
        Vec::new()
    }

    fn decode(&mut self, frame: &Frame) -> SyncResult<Decoded> {
        match frame {
            Frame::Text(_) | Frame::Binary(_) => {
                let text = frame.as_text().ok_or_else(|| {
                    SyncError::ParseFailed("engine.io packet is not utf-8".to_string())
                })?;
                self.decode_engine(text)
            }
            Frame::Ping(_) | Frame::Pong(_) => Ok(Decoded::Ignore),
            Frame::Close(close) => Ok(Decoded::Closed {
                reason: close
                    .as_ref()
                    .map(|c| c.reason_text())
                    .filter(|r| !r.is_empty())
                    .unwrap_or("transport close")
                    .to_string(),
            }),
        }
    }

    fn encode(&self, directive: &Directive) -> SyncResult<Frame> {
        let args = sonic_rs::to_string(&(&directive.name, &directive.payload))
            .map_err(|e| SyncError::ParseFailed(format!("encode {}: {e}", directive.name)))?;
        if self.is_default_namespace() {
            Ok(Frame::text(format!("42{args}")))
        } else {
            Ok(Frame::text(format!("42{},{args}", self.namespace)))
        }
    }

    fn close_frames(&self) -> Vec<Frame> {
        if self.is_default_namespace() {
            vec![Frame::text_static("41")]
        } else {
            vec![Frame::text(format!("41{},", self.namespace))]
        }
    }
}

/// Split an optional `/nsp,` prefix off a socket.io packet body.
fn split_namespace(body: &str) -> (Option<&str>, &str) {
    if !body.starts_with('/') {
        return (None, body);
    }
    match body.find(',') {
        Some(idx) => (Some(&body[..idx]), &body[idx + 1..]),
        None => (Some(body), ""),
    }
}

/// `[ack-id]["event", payload, ...]`; ack ids are skipped.
fn decode_event(body: &str) -> SyncResult<Decoded> {
    let array = body.trim_start_matches(|c: char| c.is_ascii_digit());
    let value: Value = sonic_rs::from_str(array)
        .map_err(|e| SyncError::ParseFailed(format!("socket.io event packet: {e}")))?;
    if !value.is_array() {
        return Err(SyncError::ParseFailed(
            "socket.io event is not an array".to_string(),
        ));
    }
    let name = value
        .get(0)
        .and_then(|v| v.as_str())
        .ok_or_else(|| SyncError::ParseFailed("socket.io event without a name".to_string()))?
        .to_string();
    let payload = value.get(1).cloned().unwrap_or_default();
    Ok(Decoded::Event { name, payload })
}
