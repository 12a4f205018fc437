use std::time::Duration;

use kameo::prelude::{Actor, ActorRef};
use tokio::sync::oneshot;

use super::actor::{
    AddListener, ClearHistory, Connect, ConnectionManager, ConnectionManagerArgs, Disconnect,
    GetHistory, GetSnapshot, GetStatus, GetSubscriptions, Ping, RemoveListeners, Subscribe,
    SyncStatus, Unsubscribe, mailbox_error, reply_error,
};
use crate::codec::{SocketIoCodec, WireCodec};
use crate::config::SyncConfig;
use crate::core::{
    ConnectionSnapshot, ConnectionState, EventEnvelope, EventType, HistoryEntry, ListenerError,
    ListenerId, SyncError, SyncResult, Topic, listener,
};
use crate::transport::{FallbackTransport, Transport, TungsteniteTransport};

/// Cloneable handle to a running connection manager.
///
/// Every method is a message to the manager actor, so calls are serialized with transport events
/// and with each other. Must be created inside a tokio runtime.
pub struct SyncClient<T = TungsteniteTransport, C = SocketIoCodec>
where
    T: Transport,
    C: WireCodec,
{
    actor: ActorRef<ConnectionManager<T, C>>,
}

impl<T, C> Clone for SyncClient<T, C>
where
    T: Transport,
    C: WireCodec,
{
    fn clone(&self) -> Self {
        Self {
            actor: self.actor.clone(),
        }
    }
}

impl SyncClient {
    /// Socket.IO over websocket.
    pub fn new(config: SyncConfig) -> SyncResult<Self> {
        let codec = SocketIoCodec::new(config.namespace.clone());
        Self::with_transport_and_codec(config, TungsteniteTransport::default(), codec)
    }

    /// Configuration from `FLEET_SYNC_*` environment variables.
    pub fn from_env() -> SyncResult<Self> {
        Self::new(SyncConfig::from_env()?)
    }
}

impl SyncClient<FallbackTransport, SocketIoCodec> {
    /// Socket.IO over websocket, falling back to engine.io long-polling.
    pub fn with_polling_fallback(config: SyncConfig) -> SyncResult<Self> {
        let codec = SocketIoCodec::new(config.namespace.clone());
        Self::with_transport_and_codec(config, FallbackTransport::default(), codec)
    }
}

impl<T, C> SyncClient<T, C>
where
    T: Transport,
    C: WireCodec,
{
    pub fn with_transport_and_codec(config: SyncConfig, transport: T, codec: C) -> SyncResult<Self> {
        Ok(Self::spawn(ConnectionManagerArgs::new(
            config, transport, codec,
        )?))
    }

    pub fn spawn(args: ConnectionManagerArgs<T, C>) -> Self {
        Self {
            actor: ConnectionManager::spawn(args),
        }
    }

    /// Resolve once the channel is established. Joins an attempt already in flight.
    pub async fn connect(&self) -> SyncResult<()> {
        let (tx, rx) = oneshot::channel();
        self.actor
            .tell(Connect { waiter: Some(tx) })
            .send()
            .await
            .map_err(mailbox_error)?;
        rx.await
            .map_err(|_| SyncError::ActorError("connection manager stopped".to_string()))?
    }

    pub async fn disconnect(&self) -> SyncResult<()> {
        self.actor.ask(Disconnect).await.map_err(reply_error)
    }

    /// `true` exactly when the manager is `Connected`; a stopped manager reads as disconnected.
    pub async fn is_connected(&self) -> bool {
        matches!(
            self.connection_state().await,
            Ok(ConnectionSnapshot {
                state: ConnectionState::Connected,
                ..
            })
        )
    }

    pub async fn connection_state(&self) -> SyncResult<ConnectionSnapshot> {
        self.actor.ask(GetSnapshot).await.map_err(reply_error)
    }

    pub async fn status(&self) -> SyncResult<SyncStatus> {
        self.actor.ask(GetStatus).await.map_err(reply_error)
    }

    /// Register `callback` for `event_type`. Callbacks run on the manager task and must not
    /// block.
    pub async fn on<F>(&self, event_type: EventType, callback: F) -> SyncResult<ListenerHandle<T, C>>
    where
        F: Fn(&EventEnvelope) -> Result<(), ListenerError> + Send + Sync + 'static,
    {
        let id = self
            .actor
            .ask(AddListener {
                event_type: event_type.clone(),
                listener: listener(callback),
            })
            .await
            .map_err(reply_error)?;
        Ok(ListenerHandle {
            actor: self.actor.clone(),
            event_type,
            id,
        })
    }

    /// Remove one listener, or every listener of `event_type` when `id` is `None`.
    pub async fn off(&self, event_type: EventType, id: Option<ListenerId>) -> SyncResult<usize> {
        self.actor
            .ask(RemoveListeners { event_type, id })
            .await
            .map_err(reply_error)
    }

    /// Track `topic`. Returns whether it was newly added.
    pub async fn subscribe(&self, topic: Topic) -> SyncResult<bool> {
        self.actor.ask(Subscribe(topic)).await.map_err(reply_error)
    }

    /// Stop tracking `topic`. Returns whether it was present.
    pub async fn unsubscribe(&self, topic: Topic) -> SyncResult<bool> {
        self.actor.ask(Unsubscribe(topic)).await.map_err(reply_error)
    }

    pub async fn subscribe_truck(&self, truck_id: impl Into<String>) -> SyncResult<bool> {
        self.subscribe(Topic::truck(truck_id)?).await
    }

    pub async fn subscribe_bin(&self, bin_id: impl Into<String>) -> SyncResult<bool> {
        self.subscribe(Topic::bin(bin_id)?).await
    }

    pub async fn subscribe_simulation(&self) -> SyncResult<bool> {
        self.subscribe(Topic::simulation()).await
    }

    pub async fn subscribe_optimization(&self) -> SyncResult<bool> {
        self.subscribe(Topic::optimization()).await
    }

    /// Tracked topics in insertion order.
    pub async fn subscriptions(&self) -> SyncResult<Vec<Topic>> {
        self.actor.ask(GetSubscriptions).await.map_err(reply_error)
    }

    /// Round-trip latency of one ping.
    pub async fn ping(&self) -> SyncResult<Duration> {
        let (tx, rx) = oneshot::channel();
        self.actor
            .tell(Ping { waiter: tx })
            .send()
            .await
            .map_err(mailbox_error)?;
        rx.await
            .map_err(|_| SyncError::ActorError("connection manager stopped".to_string()))?
    }

    pub async fn history(&self, filter: Option<EventType>) -> SyncResult<Vec<HistoryEntry>> {
        self.actor
            .ask(GetHistory { filter })
            .await
            .map_err(reply_error)
    }

    pub async fn clear_history(&self) -> SyncResult<()> {
        self.actor.ask(ClearHistory).await.map_err(reply_error)
    }

    /// Disconnect and stop the manager actor.
    pub async fn shutdown(&self) -> SyncResult<()> {
        self.disconnect().await?;
        self.actor
            .stop_gracefully()
            .await
            .map_err(mailbox_error)?;
        self.actor.wait_for_shutdown().await;
        Ok(())
    }
}

/// Removes exactly the registration that created it.
pub struct ListenerHandle<T = TungsteniteTransport, C = SocketIoCodec>
where
    T: Transport,
    C: WireCodec,
{
    actor: ActorRef<ConnectionManager<T, C>>,
    event_type: EventType,
    id: ListenerId,
}

impl<T, C> ListenerHandle<T, C>
where
    T: Transport,
    C: WireCodec,
{
    pub fn id(&self) -> ListenerId {
        self.id
    }

    pub fn event_type(&self) -> &EventType {
        &self.event_type
    }

    /// Remove the registration. Returns `false` if it was already gone.
    pub async fn remove(&self) -> SyncResult<bool> {
        let removed = self
            .actor
            .ask(RemoveListeners {
                event_type: self.event_type.clone(),
                id: Some(self.id),
            })
            .await
            .map_err(reply_error)?;
        Ok(removed > 0)
    }
}
