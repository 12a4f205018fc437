use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use fleet_sync::core::{EventEnvelope, EventType, SyncEvent};
use fleet_sync::testing::{MockConnection, MockTransport};
use fleet_sync::{SocketIoCodec, SyncClient, SyncConfig};

type TestClient = SyncClient<MockTransport, SocketIoCodec>;
type Recorded = Arc<Mutex<Vec<EventEnvelope>>>;

async fn connected_client() -> (TestClient, MockConnection) {
    let config = SyncConfig::new("http://fleet.test:8000")
        .with_reconnect_delay_ms(20)
        .with_ping_interval_ms(0);
    let (transport, mut server) = MockTransport::channel_pair();
    let client = SyncClient::with_transport_and_codec(config, transport, SocketIoCodec::default())
        .expect("client");

    let connecting = {
        let client = client.clone();
        tokio::spawn(async move { client.connect().await })
    };
    let mut conn = server.accept().await.expect("connection attempt");
    conn.open_socketio("s1").await.expect("handshake");
    connecting.await.expect("join").expect("connect");
    (client, conn)
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

async fn wait_for_len(seen: &Recorded, len: usize) {
    let deadline = Instant::now() + Duration::from_secs(1);
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

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn failing_listeners_do_not_affect_others() {
    let (client, conn) = connected_client().await;

    client
        .on(EventType::TruckUpdated, |_| Err("listener rejected update".into()))
        .await
        .expect("failing listener");
    client
        .on(EventType::TruckUpdated, |_| panic!("listener blew up"))
        .await
        .expect("panicking listener");
    let trucks = record(&client, EventType::TruckUpdated).await;
    let everything = record(&client, EventType::Message).await;

    conn.emit(
        "truck_updated",
        &sonic_rs::json!({ "truckId": "T1", "status": "collecting", "location": [40.1, -3.7] }),
    )
    .expect("emit");
    wait_for_len(&everything, 1).await;

    {
        let trucks = trucks.lock().expect("lock");
        assert_eq!(trucks.len(), 1);
        let SyncEvent::TruckUpdated(update) = &trucks[0].event else {
            panic!("expected a typed truck update, got {:?}", trucks[0].event);
        };
        assert_eq!(update.truck_id, "T1");
        assert_eq!(update.status.as_deref(), Some("collecting"));
        assert_eq!(update.location, Some([40.1, -3.7]));
    }
    assert_eq!(everything.lock().expect("lock")[0].event_type, EventType::TruckUpdated);

    let status = client.status().await.expect("status");
    assert_eq!(status.health.listener_failures, 2);
    assert!(client.is_connected().await, "listener failures must not touch the connection");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn malformed_and_unknown_events_stay_observable() {
    let (client, conn) = connected_client().await;
    let trucks = record(&client, EventType::TruckUpdated).await;
    let lost = record(&client, EventType::ConnectionLost).await;
    let everything = record(&client, EventType::Message).await;

    // Missing the truck id.
    conn.emit("truck_updated", &sonic_rs::json!({ "status": "idle" }))
        .expect("emit");
    conn.emit("depot_updated", &sonic_rs::json!({ "depotId": "D1" }))
        .expect("emit");
    conn.emit("connection_lost", &sonic_rs::json!({ "reason": "spoofed" }))
        .expect("emit");
    wait_for_len(&everything, 3).await;

    let trucks = trucks.lock().expect("lock");
    assert_eq!(trucks.len(), 1);
    assert!(matches!(
        &trucks[0].event,
        SyncEvent::Unrecognized { event, .. } if event == "truck_updated"
    ));

    let everything = everything.lock().expect("lock");
    let types: Vec<EventType> = everything.iter().map(|e| e.event_type.clone()).collect();
    assert_eq!(
        types,
        vec![
            EventType::TruckUpdated,
            EventType::Custom("depot_updated".to_string()),
            EventType::Custom("connection_lost".to_string()),
        ]
    );
    assert!(lost.lock().expect("lock").is_empty(), "server cannot spoof synthetic events");

    let status = client.status().await.expect("status");
    assert_eq!(status.health.decode_errors, 1);
    let history = client.history(None).await.expect("history");
    // connection_restored from the initial connect, then the three server events.
    assert_eq!(history.len(), 4);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn listener_handles_remove_exactly_their_registration() {
    let (client, conn) = connected_client().await;

    let bins = record(&client, EventType::BinUpdated).await;
    let extra = client
        .on(EventType::BinUpdated, |_| Ok(()))
        .await
        .expect("listener");
    let dropped: Recorded = Arc::default();
    let sink = Arc::clone(&dropped);
    let handle = client
        .on(EventType::BinUpdated, move |envelope| {
            sink.lock().expect("lock").push(envelope.clone());
            Ok(())
        })
        .await
        .expect("listener");
    assert_eq!(handle.event_type(), &EventType::BinUpdated);
    assert_ne!(handle.id(), extra.id());

    assert!(handle.remove().await.expect("remove"));
    assert!(!handle.remove().await.expect("second remove"));

    conn.emit("bin_updated", &sonic_rs::json!({ "binId": "B-7", "fillLevel": 91.5 }))
        .expect("emit");
    wait_for_len(&bins, 1).await;
    assert!(dropped.lock().expect("lock").is_empty());

    assert_eq!(
        client.off(EventType::BinUpdated, None).await.expect("off"),
        2
    );
    assert_eq!(client.off(EventType::BinUpdated, None).await.expect("off"), 0);
}
