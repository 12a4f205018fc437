use sonic_rs::{JsonValueTrait, Value};

use super::{Decoded, WireCodec, websocket_url};
use crate::core::{Directive, Frame, SyncError, SyncResult};

/// Plain websocket framing: every message is `{"event": <name>, "data": <payload>}`.
///
/// There is no session handshake, so the connection counts as established once the transport
/// opens.
#[derive(Debug, Clone, Default)]
pub struct JsonEnvelopeCodec;

impl WireCodec for JsonEnvelopeCodec {
    fn endpoint(&self, base: &str) -> SyncResult<String> {
        Ok(websocket_url(base)?.into())
    }

    fn awaits_handshake(&self) -> bool {
        false
    }

    fn on_open(&mut self) -> Vec<Frame> {
        Vec::new()
    }

    fn decode(&mut self, frame: &Frame) -> SyncResult<Decoded> {
        let text = match frame {
            Frame::Text(_) | Frame::Binary(_) => frame
                .as_text()
                .ok_or_else(|| SyncError::ParseFailed("envelope is not utf-8".to_string()))?,
            Frame::Ping(_) | Frame::Pong(_) => return Ok(Decoded::Ignore),
            Frame::Close(close) => {
                let reason = close
                    .as_ref()
                    .map(|c| c.reason_text())
                    .filter(|r| !r.is_empty())
                    .unwrap_or("remote closed");
                return Ok(Decoded::Closed {
                    reason: reason.to_string(),
                });
            }
        };

        let value: Value = sonic_rs::from_str(text)
            .map_err(|e| SyncError::ParseFailed(format!("envelope: {e}")))?;
        let name = value
            .get("event")
            .and_then(|v| v.as_str())
            .ok_or_else(|| SyncError::ParseFailed("envelope without event name".to_string()))?
            .to_string();
        let payload = value.get("data").cloned().unwrap_or_default();
        Ok(Decoded::Event { name, payload })
    }

    fn encode(&self, directive: &Directive) -> SyncResult<Frame> {
        let envelope = sonic_rs::json!({
            "event": directive.name.as_str(),
            "data": directive.payload.clone(),
        });
        let text = sonic_rs::to_string(&envelope)
            .map_err(|e| SyncError::ParseFailed(format!("encode {}: {e}", directive.name)))?;
        Ok(Frame::text(text))
    }

    fn close_frames(&self) -> Vec<Frame> {
        vec![Frame::close(1000, "client disconnect")]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn envelope_round_trip_shape() {
        let codec = JsonEnvelopeCodec;
        let frame = codec
            .encode(&Directive::new(
                "subscribe_bin",
                sonic_rs::json!({ "id": "B1" }),
            ))
            .unwrap();
        let value: Value = sonic_rs::from_str(frame.as_text().unwrap()).unwrap();
        assert_eq!(value["event"].as_str(), Some("subscribe_bin"));
        assert_eq!(value["data"], sonic_rs::json!({ "id": "B1" }));
    }

    #[test]
    fn decode_events_and_errors() {
        let mut codec = JsonEnvelopeCodec;
        assert_eq!(
            codec
                .decode(&Frame::text(r#"{"event":"pong","data":{"id":3}}"#))
                .unwrap(),
            Decoded::Event {
                name: "pong".to_string(),
                payload: sonic_rs::json!({ "id": 3 }),
            }
        );
        assert!(codec.decode(&Frame::text(r#"{"data":{}}"#)).is_err());
        assert!(codec.decode(&Frame::text("nope")).is_err());
        assert!(matches!(
            codec.decode(&Frame::close(1001, "going away")).unwrap(),
            Decoded::Closed { reason } if reason == "going away"
        ));
    }

    #[test]
    fn endpoint_keeps_path() {
        assert_eq!(
            JsonEnvelopeCodec.endpoint("https://h/events").unwrap(),
            "wss://h/events"
        );
        assert!(!JsonEnvelopeCodec.awaits_handshake());
    }
}
