//! Wire codecs: how directives and events are framed on the channel.

use std::time::Duration;

use sonic_rs::Value;
use url::Url;

use crate::core::{Directive, Frame, SyncError, SyncResult};

pub mod json;
pub mod socketio;

pub use json::JsonEnvelopeCodec;
pub use socketio::SocketIoCodec;

/// Result of decoding one inbound frame.
#[derive(Debug, Clone, PartialEq)]
pub enum Decoded {
    /// Transport session opened. `replies` must be written before anything else.
    Opened {
        channel_id: Option<String>,
        heartbeat: Option<Duration>,
        replies: Vec<Frame>,
    },
    /// Application channel ready; the connection counts as established.
    Ready { channel_id: Option<String> },
    Event { name: String, payload: Value },
    /// Protocol-level answer the codec wants written back (heartbeats).
    Reply(Frame),
    /// Peer ended the session.
    Closed { reason: String },
    /// Peer refused the session.
    Rejected { reason: String },
    Ignore,
}

/// Framing contract between the connection manager and the wire.
pub trait WireCodec: Send + 'static {
    /// Map the configured base URL to the websocket endpoint this codec speaks to.
    fn endpoint(&self, base: &str) -> SyncResult<String>;

    /// Whether the connection is established only after a [`Decoded::Ready`], rather than as
    /// soon as the transport opens.
    fn awaits_handshake(&self) -> bool;

    /// Reset per-connection state. Returns frames to write immediately after the transport opens.
    fn on_open(&mut self) -> Vec<Frame>;

    fn decode(&mut self, frame: &Frame) -> SyncResult<Decoded>;

    fn encode(&self, directive: &Directive) -> SyncResult<Frame>;

    /// Frames announcing a client-initiated disconnect.
    fn close_frames(&self) -> Vec<Frame>;
}

/// Parse `base` and move it onto the websocket scheme family.
pub(crate) fn websocket_url(base: &str) -> SyncResult<Url> {
    let mut url =
        Url::parse(base).map_err(|e| SyncError::Config(format!("invalid url {base:?}: {e}")))?;
    let scheme = match url.scheme() {
        "http" | "ws" => "ws",
        "https" | "wss" => "wss",
        other => {
            return Err(SyncError::Config(format!(
                "unsupported url scheme {other:?} in {base:?}"
            )));
        }
    };
    url.set_scheme(scheme)
        .map_err(|_| SyncError::Config(format!("cannot use scheme {scheme} for {base:?}")))?;
    Ok(url)
}

/// Set `pairs` in the query string of `url`, replacing same-named keys and keeping the rest.
pub(crate) fn set_query_pairs(url: &mut Url, pairs: &[(&str, &str)]) {
    let retained: Vec<(String, String)> = url
        .query_pairs()
        .filter(|(key, _)| !pairs.iter().any(|(k, _)| &**key == *k))
        .map(|(k, v)| (k.into_owned(), v.into_owned()))
        .collect();

    let mut query = url.query_pairs_mut();
    query.clear();
    query.extend_pairs(retained);
    query.extend_pairs(pairs.iter().copied());
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn http_maps_to_websocket_schemes() {
        assert_eq!(
            websocket_url("http://localhost:8000").unwrap().as_str(),
            "ws://localhost:8000/"
        );
        assert_eq!(
            websocket_url("https://fleet.example.com/app").unwrap().scheme(),
            "wss"
        );
        assert!(matches!(
            websocket_url("ftp://fleet.example.com"),
            Err(SyncError::Config(_))
        ));
        assert!(matches!(websocket_url("not a url"), Err(SyncError::Config(_))));
    }

    #[test]
    fn query_pairs_are_replaced_not_duplicated() {
        let mut url = Url::parse("ws://h/socket.io/?token=abc&transport=polling").unwrap();
        set_query_pairs(&mut url, &[("EIO", "4"), ("transport", "websocket")]);
        assert_eq!(url.query(), Some("token=abc&EIO=4&transport=websocket"));
    }
}
