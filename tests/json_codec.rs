use std::time::{Duration, Instant};

use fleet_sync::core::{ConnectionState, EventType, Frame};
use fleet_sync::testing::MockTransport;
use fleet_sync::{JsonEnvelopeCodec, SyncClient, SyncConfig};
use sonic_rs::{JsonValueTrait, Value};

fn config() -> SyncConfig {
    SyncConfig::new("http://fleet.test:8000/events")
        .with_reconnect_delay_ms(20)
        .with_ping_interval_ms(0)
}

fn envelope(frame: &Frame) -> Value {
    sonic_rs::from_str(frame.as_text().expect("text frame")).expect("json envelope")
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn plain_json_channel_round_trip() {
    let (transport, mut server) = MockTransport::channel_pair();
    let client = SyncClient::with_transport_and_codec(config(), transport, JsonEnvelopeCodec)
        .expect("client");

    let connecting = {
        let client = client.clone();
        tokio::spawn(async move { client.connect().await })
    };
    let attempt = server.next_attempt().await.expect("attempt");
    assert_eq!(attempt.url(), "ws://fleet.test:8000/events");
    let mut conn = attempt.accept();
    connecting.await.expect("join").expect("connect");

    let snapshot = client.connection_state().await.expect("snapshot");
    assert_eq!(snapshot.state, ConnectionState::Connected);
    assert_eq!(snapshot.channel_id, None);

    assert!(client.subscribe_bin("B-3").await.expect("subscribe"));
    let frame = conn
        .recv_outbound_timeout(Duration::from_secs(1))
        .await
        .expect("subscribe frame");
    let sent = envelope(&frame);
    assert_eq!(sent["event"].as_str(), Some("subscribe_bin"));
    assert_eq!(sent["data"]["id"].as_str(), Some("B-3"));

    conn.send_text(r#"{"event":"bin_updated","data":{"bin_id":"B-3","fill_level":87.0}}"#)
        .expect("inbound");
    conn.send_text(r#"{"event":"simulation_tick","data":{"tick_count":9}}"#)
        .expect("inbound");

    let deadline = Instant::now() + Duration::from_secs(1);
    while client.history(None).await.expect("history").len() < 3 {
        assert!(Instant::now() < deadline, "events never logged");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    let bins = client
        .history(Some(EventType::BinUpdated))
        .await
        .expect("history");
    assert_eq!(bins.len(), 1);
    assert_eq!(bins[0].payload["bin_id"].as_str(), Some("B-3"));

    client.clear_history().await.expect("clear");
    assert!(client.history(None).await.expect("history").is_empty());

    client.disconnect().await.expect("disconnect");
    let mut close_reason = None;
    while let Some(frame) = conn.recv_outbound_timeout(Duration::from_millis(200)).await {
        if let Frame::Close(Some(close)) = &frame {
            close_reason = Some(close.reason_text().to_string());
            break;
        }
    }
    assert_eq!(close_reason.as_deref(), Some("client disconnect"));
}
