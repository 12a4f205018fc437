use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use fleet_sync::core::{
    ConnectionState, DisconnectCause, EventEnvelope, EventType, SyncEvent, Topic,
};
use fleet_sync::testing::{MockConnection, MockServer, MockTransport};
use fleet_sync::{SocketIoCodec, SyncClient, SyncConfig};
use sonic_rs::JsonValueTrait;

type TestClient = SyncClient<MockTransport, SocketIoCodec>;
type Recorded = Arc<Mutex<Vec<EventEnvelope>>>;

fn config() -> SyncConfig {
    SyncConfig::new("http://fleet.test:8000")
        .with_reconnect_delay_ms(20)
        .with_max_reconnect_delay_ms(200)
        .with_ping_interval_ms(0)
}

fn spawn_client(config: SyncConfig) -> (TestClient, MockServer) {
    let (transport, server) = MockTransport::channel_pair();
    let client = SyncClient::with_transport_and_codec(config, transport, SocketIoCodec::default())
        .expect("client");
    (client, server)
}

async fn connect(client: &TestClient, server: &mut MockServer, sid: &str) -> MockConnection {
    let connecting = {
        let client = client.clone();
        tokio::spawn(async move { client.connect().await })
    };
    let mut conn = server.accept().await.expect("connection attempt");
    conn.open_socketio(sid).await.expect("socket.io handshake");
    connecting.await.expect("join").expect("connect");
    conn
}

async fn record(client: &TestClient, event_type: EventType) -> Recorded {
    let seen: Recorded = Arc::default();
    let sink = Arc::clone(&seen);
    client
        .on(event_type, move |envelope| {
            sink.lock().expect("lock").push(envelope.clone());
            Ok(())
        })
        .await
        .expect("register listener");
    seen
}

async fn wait_for_len(seen: &Recorded, len: usize, timeout: Duration) {
    let deadline = Instant::now() + timeout;
    loop {
        let current = seen.lock().expect("lock").len();
        if current >= len {
            return;
        }
        if Instant::now() >= deadline {
            panic!("timed out waiting for {len} events (have {current})");
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

async fn expect_event(conn: &mut MockConnection, name: &str) -> sonic_rs::Value {
    let (event, payload) = conn
        .recv_event(Duration::from_secs(1))
        .await
        .unwrap_or_else(|| panic!("expected outbound {name}"));
    assert_eq!(event, name);
    payload
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn drop_reconnects_and_resubscribes_in_order() {
    let (client, mut server) = spawn_client(config());
    let lost = record(&client, EventType::ConnectionLost).await;
    let restored = record(&client, EventType::ConnectionRestored).await;

    let mut conn = connect(&client, &mut server, "s1").await;
    wait_for_len(&restored, 1, Duration::from_secs(1)).await;

    assert!(client.subscribe_truck("T1").await.expect("subscribe"));
    let payload = expect_event(&mut conn, "subscribe_truck").await;
    assert_eq!(payload["id"].as_str(), Some("T1"));
    assert!(client.subscribe_simulation().await.expect("subscribe"));
    expect_event(&mut conn, "subscribe_simulation").await;

    conn.close_with_reason("transport error").expect("close");
    wait_for_len(&lost, 1, Duration::from_secs(1)).await;
    {
        let lost = lost.lock().expect("lock");
        match &lost[0].event {
            SyncEvent::ConnectionLost(event) => assert_eq!(event.reason, "transport error"),
            other => panic!("unexpected event {other:?}"),
        }
    }
    let state = client.connection_state().await.expect("snapshot").state;
    assert!(state.is_pending(), "expected a pending reconnect, got {state}");

    let mut conn = server.accept().await.expect("reconnect attempt");
    conn.open_socketio("s2").await.expect("handshake");

    let first = expect_event(&mut conn, "subscribe_truck").await;
    assert_eq!(first["id"].as_str(), Some("T1"));
    expect_event(&mut conn, "subscribe_simulation").await;
    assert_eq!(
        conn.recv_event(Duration::from_millis(150)).await,
        None,
        "each topic is resubscribed exactly once"
    );

    wait_for_len(&restored, 2, Duration::from_secs(1)).await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(
        restored.lock().expect("lock").len(),
        2,
        "one connection_restored for the initial connect and exactly one for the reconnect"
    );
    assert_eq!(lost.lock().expect("lock").len(), 1);

    assert!(client.is_connected().await);
    let status = client.status().await.expect("status");
    assert_eq!(status.snapshot.reconnect_attempts, 0);
    assert_eq!(status.snapshot.channel_id.as_deref(), Some("s2"));
    assert_eq!(status.health.reconnects, 1);
    assert!(status.subscriptions_applied);
    assert_eq!(
        status.last_disconnect,
        Some(DisconnectCause::RemoteClosed {
            reason: "transport error".to_string()
        })
    );
    assert_eq!(
        status.subscriptions,
        vec![Topic::truck("T1").expect("topic"), Topic::simulation()]
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn subscriptions_made_offline_are_sent_on_connect() {
    let (client, mut server) = spawn_client(config());
    assert!(client.subscribe_bin("B-12").await.expect("subscribe"));
    assert!(!client.subscribe_bin("B-12").await.expect("duplicate"));
    assert!(client.subscribe_optimization().await.expect("subscribe"));

    let mut conn = connect(&client, &mut server, "s1").await;
    let bin = expect_event(&mut conn, "subscribe_bin").await;
    assert_eq!(bin["id"].as_str(), Some("B-12"));
    expect_event(&mut conn, "subscribe_optimization").await;

    // Duplicates and unknown topics produce no traffic.
    assert!(!client.subscribe_bin("B-12").await.expect("duplicate"));
    assert!(!client.unsubscribe(Topic::truck("T9").expect("topic")).await.expect("absent"));
    assert!(client.unsubscribe(Topic::optimization()).await.expect("unsubscribe"));
    expect_event(&mut conn, "unsubscribe_optimization").await;

    assert_eq!(
        client.subscriptions().await.expect("subscriptions"),
        vec![Topic::bin("B-12").expect("topic")]
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn manual_disconnect_is_silent_and_keeps_intent() {
    let (client, mut server) = spawn_client(config());
    let lost = record(&client, EventType::ConnectionLost).await;

    let mut conn = connect(&client, &mut server, "s1").await;
    client.subscribe_truck("T1").await.expect("subscribe");
    expect_event(&mut conn, "subscribe_truck").await;

    conn.emit(
        "truck_updated",
        &sonic_rs::json!({ "truckId": "T1", "status": "en_route" }),
    )
    .expect("emit");
    let deadline = Instant::now() + Duration::from_secs(1);
    while client
        .history(Some(EventType::TruckUpdated))
        .await
        .expect("history")
        .is_empty()
    {
        assert!(Instant::now() < deadline, "truck update never logged");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    client.disconnect().await.expect("disconnect");

    let mut saw_close = false;
    while let Some(frame) = conn.recv_outbound_timeout(Duration::from_millis(200)).await {
        if frame.as_text() == Some("41") {
            saw_close = true;
            break;
        }
    }
    assert!(saw_close, "socket.io disconnect packet should be sent");

    let status = client.status().await.expect("status");
    assert_eq!(status.snapshot.state, ConnectionState::Disconnected);
    assert_eq!(status.last_disconnect, Some(DisconnectCause::Manual));
    assert!(!status.subscriptions_applied);
    assert!(client.history(None).await.expect("history").is_empty());
    assert_eq!(
        client.subscriptions().await.expect("subscriptions"),
        vec![Topic::truck("T1").expect("topic")]
    );
    assert!(
        server
            .next_attempt_timeout(Duration::from_millis(200))
            .await
            .is_none(),
        "manual disconnect must not trigger a reconnect"
    );
    assert!(lost.lock().expect("lock").is_empty());

    let mut conn = connect(&client, &mut server, "s2").await;
    let payload = expect_event(&mut conn, "subscribe_truck").await;
    assert_eq!(payload["id"].as_str(), Some("T1"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn drop_without_auto_reconnect_settles_disconnected() {
    let (client, mut server) = spawn_client(config().with_auto_reconnect(false));
    let lost = record(&client, EventType::ConnectionLost).await;

    let mut conn = connect(&client, &mut server, "s1").await;
    conn.send_error("connection reset by peer").expect("inject");
    wait_for_len(&lost, 1, Duration::from_secs(1)).await;

    let snapshot = client.connection_state().await.expect("snapshot");
    assert_eq!(snapshot.state, ConnectionState::Disconnected);
    assert!(
        server
            .next_attempt_timeout(Duration::from_millis(200))
            .await
            .is_none()
    );
    let lost = lost.lock().expect("lock");
    assert!(lost[0].payload["reason"]
        .as_str()
        .is_some_and(|r| r.contains("connection reset by peer")));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn server_namespace_disconnect_triggers_reconnect() {
    let (client, mut server) = spawn_client(config());
    let lost = record(&client, EventType::ConnectionLost).await;

    let conn = connect(&client, &mut server, "s1").await;
    conn.send_text("41").expect("server disconnect");
    wait_for_len(&lost, 1, Duration::from_secs(1)).await;
    assert_eq!(lost.lock().expect("lock")[0].payload["reason"].as_str(), Some("io server disconnect"));

    let mut conn = server.accept().await.expect("reconnect attempt");
    conn.open_socketio("s2").await.expect("handshake");
    let deadline = Instant::now() + Duration::from_secs(1);
    while !client.is_connected().await {
        assert!(Instant::now() < deadline, "never reconnected");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn topic_added_while_reconnecting_is_sent_once() {
    let (client, mut server) = spawn_client(
        config()
            .with_reconnect_delay_ms(300)
            .with_max_reconnect_delay_ms(1_000),
    );

    let mut conn = connect(&client, &mut server, "s1").await;
    client.subscribe_truck("T1").await.expect("subscribe");
    expect_event(&mut conn, "subscribe_truck").await;

    conn.drop_socket();
    let deadline = Instant::now() + Duration::from_secs(1);
    while client.connection_state().await.expect("snapshot").state != ConnectionState::Reconnecting {
        assert!(Instant::now() < deadline, "never started reconnecting");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(client.subscribe_bin("B-5").await.expect("subscribe while offline"));
    assert!(!client.status().await.expect("status").subscriptions_applied);

    let mut conn = server.accept().await.expect("reconnect attempt");
    conn.open_socketio("s2").await.expect("handshake");

    let truck = expect_event(&mut conn, "subscribe_truck").await;
    assert_eq!(truck["id"].as_str(), Some("T1"));
    let bin = expect_event(&mut conn, "subscribe_bin").await;
    assert_eq!(bin["id"].as_str(), Some("B-5"));
    assert_eq!(
        conn.recv_event(Duration::from_millis(150)).await,
        None,
        "the deferred topic must not be sent twice"
    );
    assert!(client.status().await.expect("status").subscriptions_applied);
}
