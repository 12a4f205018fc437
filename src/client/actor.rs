//! Connection manager actor.
//!
//! The channel IO runs outside kameo; the actor owns the lifecycle state machine, the
//! subscription registry, listeners, latency pings and history, and receives transport output
//! through messages. Every message coming from IO carries the epoch of the connection attempt that
//! produced it, so output from a torn-down connection is dropped on arrival.

use std::time::{Duration, Instant};

use futures_util::StreamExt;
use kameo::error::SendError;
use kameo::prelude::{Actor, ActorRef, Context, Message as KameoMessage, WeakActorRef};
use sonic_rs::Value;
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use super::writer::{CloseWriter, FrameWriter, WriteBatch, WriteFailureHook, WriteFrame};
use crate::codec::{Decoded, WireCodec};
use crate::config::SyncConfig;
use crate::core::{
    ConnectionSnapshot, ConnectionState, Directive, DisconnectCause, EventDispatcher,
    EventEnvelope, EventType, Frame, HealthMonitor, HistoryBuffer, HistoryEntry, LatencyMonitor,
    Listener, ListenerId, PONG_EVENT, PingWaiter, PongPayload, ReconnectStrategy,
    SubscriptionRegistry, SyncError, SyncEvent, SyncHealthStats, SyncResult, Topic, now_epoch_ms,
};
use crate::core::event::decode_payload;
use crate::transport::Transport;

/// Reason carried by the terminal `connection_lost` event.
pub const MAX_ATTEMPTS_REASON: &str = "max attempts reached";

/// Upper bound on waiting for room in the writer's mailbox. A sink that stalls longer than
/// this is treated as dead so it cannot wedge the manager.
const WRITER_SEND_TIMEOUT: Duration = Duration::from_millis(500);

pub type ConnectWaiter = oneshot::Sender<SyncResult<()>>;

/// Arguments passed when spawning a [`ConnectionManager`].
pub struct ConnectionManagerArgs<T, C> {
    pub config: SyncConfig,
    /// Resolved channel endpoint (see [`WireCodec::endpoint`]).
    pub endpoint: String,
    pub transport: T,
    pub codec: C,
    pub reconnect: Box<dyn ReconnectStrategy>,
}

impl<T, C> ConnectionManagerArgs<T, C>
where
    T: Transport,
    C: WireCodec,
{
    pub fn new(config: SyncConfig, transport: T, codec: C) -> SyncResult<Self> {
        config.validate()?;
        let endpoint = codec.endpoint(&config.url)?;
        let reconnect = Box::new(config.backoff());
        Ok(Self {
            config,
            endpoint,
            transport,
            codec,
            reconnect,
        })
    }

    pub fn with_reconnect_strategy(mut self, strategy: impl ReconnectStrategy) -> Self {
        self.reconnect = Box::new(strategy);
        self
    }
}

/// Point-in-time view of the whole client.
#[derive(Debug, Clone)]
pub struct SyncStatus {
    pub snapshot: ConnectionSnapshot,
    pub last_latency: Option<Duration>,
    pub jitter: Option<Duration>,
    pub subscriptions: Vec<Topic>,
    /// Whether the tracked topics were replayed on the current connection.
    pub subscriptions_applied: bool,
    pub history_len: usize,
    pub health: SyncHealthStats,
    /// Cause of the most recent channel loss, `Manual` after `disconnect()`.
    pub last_disconnect: Option<DisconnectCause>,
}

pub struct ConnectionManager<T, C>
where
    T: Transport,
    C: WireCodec,
{
    actor_ref: ActorRef<Self>,
    config: SyncConfig,
    endpoint: String,
    transport: T,
    codec: C,
    reconnect: Box<dyn ReconnectStrategy>,
    state: ConnectionState,
    /// Consecutive failed attempts; reset on success.
    reconnect_attempts: u32,
    /// Retries already scheduled in the current failure sequence; indexes the backoff.
    retries_scheduled: u32,
    channel_id: Option<String>,
    epoch: u64,
    retry_generation: u64,
    established_once: bool,
    last_disconnect: Option<DisconnectCause>,
    registry: SubscriptionRegistry,
    dispatcher: EventDispatcher,
    latency: LatencyMonitor,
    history: HistoryBuffer,
    health: HealthMonitor,
    connect_waiters: Vec<ConnectWaiter>,
    writer: Option<ActorRef<FrameWriter<T::Writer>>>,
    connect_task: Option<JoinHandle<()>>,
    deadline_task: Option<JoinHandle<()>>,
    reader_task: Option<JoinHandle<()>>,
    ping_task: Option<JoinHandle<()>>,
    heartbeat_task: Option<JoinHandle<()>>,
    retry_task: Option<JoinHandle<()>>,
    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,
    heartbeat: Option<Duration>,
    last_inbound: Instant,
}

impl<T, C> Actor for ConnectionManager<T, C>
where
    T: Transport,
    C: WireCodec,
{
    type Args = ConnectionManagerArgs<T, C>;
    type Error = SyncError;

    fn name() -> &'static str {
        "ConnectionManager"
    }

    async fn on_start(args: Self::Args, ctx: ActorRef<Self>) -> SyncResult<Self> {
        let ConnectionManagerArgs {
            config,
            endpoint,
            transport,
            codec,
            reconnect,
        } = args;

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let latency = LatencyMonitor::new(config.ping_interval(), config.ping_timeout());
        let history = HistoryBuffer::new(config.history_capacity);

        Ok(Self {
            actor_ref: ctx,
            config,
            endpoint,
            transport,
            codec,
            reconnect,
            state: ConnectionState::Disconnected,
            reconnect_attempts: 0,
            retries_scheduled: 0,
            channel_id: None,
            epoch: 0,
            retry_generation: 0,
            established_once: false,
            last_disconnect: None,
            registry: SubscriptionRegistry::new(),
            dispatcher: EventDispatcher::new(),
            latency,
            history,
            health: HealthMonitor::new(),
            connect_waiters: Vec::new(),
            writer: None,
            connect_task: None,
            deadline_task: None,
            reader_task: None,
            ping_task: None,
            heartbeat_task: None,
            retry_task: None,
            shutdown_tx,
            shutdown_rx,
            heartbeat: None,
            last_inbound: Instant::now(),
        })
    }

    async fn on_stop(
        &mut self,
        _ctx: WeakActorRef<Self>,
        _reason: kameo::error::ActorStopReason,
    ) -> SyncResult<()> {
        self.cancel_retry();
        self.teardown_io().await;
        self.state = ConnectionState::Disconnected;
        self.reject_waiters(SyncError::Cancelled("client shut down".to_string()));
        Ok(())
    }

    fn on_panic(
        &mut self,
        _actor_ref: WeakActorRef<Self>,
        err: kameo::prelude::PanicError,
    ) -> impl std::future::Future<
        Output = Result<std::ops::ControlFlow<kameo::prelude::ActorStopReason>, Self::Error>,
    > + Send {
        async move {
            tracing::error!(error = ?err, "ConnectionManager panicked");
            Ok(std::ops::ControlFlow::Break(
                kameo::prelude::ActorStopReason::Panicked(err),
            ))
        }
    }
}

/// Transport output and timers, delivered to the manager.
#[doc(hidden)]
#[derive(Debug)]
pub enum ManagerEvent {
    ConnectFailed { epoch: u64, error: SyncError },
    ConnectDeadline { epoch: u64 },
    Inbound { epoch: u64, frame: Frame },
    TransportClosed { epoch: u64, cause: DisconnectCause },
    RetryConnect { generation: u64 },
    HeartbeatCheck { epoch: u64 },
    SendPing,
    ExpirePing { id: u64 },
}

#[doc(hidden)]
pub struct TransportOpened<TR: Transport> {
    epoch: u64,
    reader: TR::Reader,
    writer: TR::Writer,
}

impl<T, C> ConnectionManager<T, C>
where
    T: Transport,
    C: WireCodec,
{
    fn snapshot(&self) -> ConnectionSnapshot {
        ConnectionSnapshot {
            state: self.state,
            reconnect_attempts: self.reconnect_attempts,
            channel_id: self.channel_id.clone(),
        }
    }

    fn status(&self) -> SyncStatus {
        SyncStatus {
            snapshot: self.snapshot(),
            last_latency: self.latency.last_latency(),
            jitter: self.latency.jitter(),
            subscriptions: self.registry.topics().to_vec(),
            subscriptions_applied: self.registry.is_applied(),
            history_len: self.history.len(),
            health: self.health.stats(),
            last_disconnect: self.last_disconnect.clone(),
        }
    }

    fn handle_connect(&mut self, waiter: Option<ConnectWaiter>) {
        match self.state {
            ConnectionState::Connected => {
                if let Some(waiter) = waiter {
                    let _ = waiter.send(Ok(()));
                }
                return;
            }
            ConnectionState::Connecting => {
                self.connect_waiters.extend(waiter);
                return;
            }
            ConnectionState::Reconnecting => {
                // An explicit connect does not wait for the backoff timer.
                self.cancel_retry();
            }
            ConnectionState::Disconnected | ConnectionState::Failed => {
                self.reconnect_attempts = 0;
            }
        }
        self.retries_scheduled = 0;
        self.connect_waiters.extend(waiter);
        self.start_attempt();
    }

    fn start_attempt(&mut self) {
        Self::abort_task(&mut self.connect_task);
        Self::abort_task(&mut self.deadline_task);
        self.epoch = self.epoch.wrapping_add(1);
        self.state = ConnectionState::Connecting;
        self.channel_id = None;
        self.heartbeat = None;

        let epoch = self.epoch;
        info!(
            url = %self.endpoint,
            transport = self.transport.name(),
            epoch,
            attempt = self.reconnect_attempts.saturating_add(1),
            "connecting"
        );

        let transport = self.transport.clone();
        let url = self.endpoint.clone();
        let actor_ref = self.actor_ref.clone();
        self.connect_task = Some(tokio::spawn(async move {
            match transport.connect(url).await {
                Ok((reader, writer)) => {
                    let _ = actor_ref
                        .tell(TransportOpened::<T> {
                            epoch,
                            reader,
                            writer,
                        })
                        .send()
                        .await;
                }
                Err(error) => {
                    let _ = actor_ref
                        .tell(ManagerEvent::ConnectFailed { epoch, error })
                        .send()
                        .await;
                }
            }
        }));

        let timeout = self.config.connect_timeout();
        let actor_ref = self.actor_ref.clone();
        self.deadline_task = Some(tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            let _ = actor_ref
                .tell(ManagerEvent::ConnectDeadline { epoch })
                .send()
                .await;
        }));
    }

    async fn on_transport_opened(&mut self, reader: T::Reader, writer: T::Writer) {
        let epoch = self.epoch;
        debug!(epoch, transport = self.transport.name(), "transport opened");

        let hook_ref = self.actor_ref.clone();
        let hook: WriteFailureHook = Box::new(move |err: SyncError| {
            tokio::spawn(async move {
                let cause = DisconnectCause::WriteFailure {
                    error: err.to_string(),
                };
                let _ = hook_ref
                    .tell(ManagerEvent::TransportClosed { epoch, cause })
                    .send()
                    .await;
            });
        });
        let writer =
            FrameWriter::new(writer, self.shutdown_rx.clone()).with_failure_hook(hook);
        self.writer = Some(FrameWriter::spawn(writer));
        self.spawn_reader(epoch, reader);
        self.last_inbound = Instant::now();

        let greeting = self.codec.on_open();
        if let Err(err) = self.write_frames(greeting).await {
            warn!(error = %err, "failed to queue opening frames");
        }

        if !self.codec.awaits_handshake() {
            self.on_established(None).await;
        }
    }

    fn spawn_reader(&mut self, epoch: u64, mut reader: T::Reader) {
        let actor_ref = self.actor_ref.clone();
        let mut shutdown_rx = self.shutdown_rx.clone();

        self.reader_task = Some(tokio::spawn(async move {
            loop {
                tokio::select! {
                    res = shutdown_rx.changed() => {
                        if res.is_err() || *shutdown_rx.borrow_and_update() { break; }
                    }
                    next = reader.next() => {
                        let event = match next {
                            Some(Ok(frame)) => {
                                let closing = frame.is_close();
                                let delivered = actor_ref
                                    .tell(ManagerEvent::Inbound { epoch, frame })
                                    .send()
                                    .await
                                    .is_ok();
                                if !delivered || closing {
                                    break;
                                }
                                continue;
                            }
                            Some(Err(err)) => ManagerEvent::TransportClosed {
                                epoch,
                                cause: DisconnectCause::ReadFailure { error: err.to_string() },
                            },
                            None => ManagerEvent::TransportClosed {
                                epoch,
                                cause: DisconnectCause::RemoteClosed {
                                    reason: "stream ended".to_string(),
                                },
                            },
                        };
                        let _ = actor_ref.tell(event).send().await;
                        break;
                    }
                }
            }
        }));
    }

    async fn on_established(&mut self, channel_id: Option<String>) {
        Self::abort_task(&mut self.deadline_task);
        if self.channel_id.is_none() {
            self.channel_id = channel_id;
        }
        if self.established_once {
            self.health.increment_reconnect();
        }
        self.established_once = true;
        self.health.reset();

        self.state = ConnectionState::Connected;
        self.reconnect_attempts = 0;
        self.retries_scheduled = 0;
        info!(
            url = %self.endpoint,
            channel_id = ?self.channel_id,
            subscriptions = self.registry.len(),
            "channel established"
        );

        let replay = self.registry.replay();
        let mut frames = Vec::with_capacity(replay.len());
        for directive in &replay {
            match self.codec.encode(directive) {
                Ok(frame) => frames.push(frame),
                Err(err) => warn!(directive = %directive.name, error = %err, "cannot encode resubscription"),
            }
        }
        let sent = frames.len();
        match self.write_frames(frames).await {
            Ok(()) => {
                for _ in 0..sent {
                    self.health.record_sent();
                }
            }
            Err(err) => warn!(error = %err, "failed to queue resubscriptions"),
        }

        self.latency.start();
        if self.latency.auto_enabled() {
            self.start_ping_loop();
        }

        self.emit(EventEnvelope::connection_restored(now_epoch_ms()));

        for waiter in self.connect_waiters.drain(..) {
            let _ = waiter.send(Ok(()));
        }
    }

    /// Channel lost while `Connected`.
    async fn handle_drop(&mut self, cause: DisconnectCause) {
        let reason = cause.reason().to_string();
        self.last_disconnect = Some(cause.clone());
        self.latency.stop();
        self.teardown_io().await;
        self.registry.mark_unapplied();
        self.channel_id = None;

        if self.reconnect.should_retry() {
            self.retries_scheduled = 0;
            self.schedule_retry("transport_closed", &reason, Some(&cause));
        } else {
            self.log_reconnect_plan("transport_closed", "retry_suppressed", &reason, Some(&cause), None);
            self.state = ConnectionState::Disconnected;
        }

        self.emit(EventEnvelope::connection_lost(reason, now_epoch_ms()));
    }

    /// A `Connecting` attempt did not reach `Connected`.
    async fn handle_attempt_failed(&mut self, error: SyncError) {
        self.teardown_io().await;
        self.channel_id = None;
        self.reconnect_attempts = self.reconnect_attempts.saturating_add(1);
        let attempts = self.reconnect_attempts;
        let reason = error.to_string();

        if !self.reconnect.should_retry() {
            self.log_reconnect_plan("connect_failed", "retry_suppressed", &reason, None, None);
            self.state = ConnectionState::Disconnected;
            self.reject_waiters(error);
            return;
        }

        if attempts >= self.reconnect.max_attempts() {
            self.log_reconnect_plan("connect_failed", "exhausted", &reason, None, None);
            self.state = ConnectionState::Failed;
            self.emit(EventEnvelope::connection_lost(
                MAX_ATTEMPTS_REASON,
                now_epoch_ms(),
            ));
            self.reject_waiters(SyncError::MaxAttemptsReached { attempts });
            return;
        }

        self.schedule_retry("connect_failed", &reason, None);
    }

    async fn handle_transport_closed(&mut self, cause: DisconnectCause) {
        match self.state {
            ConnectionState::Connected => self.handle_drop(cause).await,
            ConnectionState::Connecting => {
                let error = match cause {
                    DisconnectCause::HandshakeFailed { reason } => {
                        SyncError::HandshakeRejected(reason)
                    }
                    other => SyncError::ConnectionFailed(other.reason().to_string()),
                };
                self.handle_attempt_failed(error).await;
            }
            state => debug!(%state, cause = ?cause, "ignoring transport close"),
        }
    }

    fn schedule_retry(&mut self, event: &str, reason: &str, cause: Option<&DisconnectCause>) {
        self.cancel_retry();
        let delay = self.reconnect.delay_for(self.retries_scheduled);
        self.retries_scheduled = self.retries_scheduled.saturating_add(1);
        self.state = ConnectionState::Reconnecting;
        self.log_reconnect_plan(event, "scheduled", reason, cause, Some(delay));

        let generation = self.retry_generation;
        let actor_ref = self.actor_ref.clone();
        self.retry_task = Some(tokio::spawn(async move {
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            let _ = actor_ref
                .tell(ManagerEvent::RetryConnect { generation })
                .send()
                .await;
        }));
    }

    /// Abort the pending retry timer; a timer message already in flight becomes stale.
    fn cancel_retry(&mut self) {
        self.retry_generation = self.retry_generation.wrapping_add(1);
        Self::abort_task(&mut self.retry_task);
    }

    async fn handle_disconnect(&mut self) {
        let previous = self.state;
        self.cancel_retry();

        if let Some(writer) = self.writer.as_ref() {
            let frames = self.codec.close_frames();
            let sent = tokio::time::timeout(
                WRITER_SEND_TIMEOUT,
                writer.tell(CloseWriter { frames }).send(),
            )
            .await;
            if sent.is_err() {
                warn!("writer stalled, closing without goodbye frames");
            }
        }
        self.teardown_io().await;

        self.latency.stop();
        self.registry.mark_unapplied();
        self.history.clear();
        self.channel_id = None;
        self.reconnect_attempts = 0;
        self.retries_scheduled = 0;
        self.state = ConnectionState::Disconnected;
        self.last_disconnect = Some(DisconnectCause::Manual);
        self.reject_waiters(SyncError::Cancelled("disconnect requested".to_string()));

        info!(
            url = %self.endpoint,
            previous = %previous,
            cause = ?self.last_disconnect,
            "disconnected"
        );
    }

    /// Stop every IO task of the current connection and invalidate its epoch.
    async fn teardown_io(&mut self) {
        self.epoch = self.epoch.wrapping_add(1);
        let _ = self.shutdown_tx.send(true);
        Self::abort_task(&mut self.connect_task);
        Self::abort_task(&mut self.deadline_task);
        Self::abort_task(&mut self.reader_task);
        Self::abort_task(&mut self.ping_task);
        Self::abort_task(&mut self.heartbeat_task);
        self.heartbeat = None;

        if let Some(writer) = self.writer.take() {
            let stopped = tokio::time::timeout(WRITER_SEND_TIMEOUT, writer.stop_gracefully()).await;
            if stopped.is_err() {
                debug!("writer mailbox full, killing writer");
                writer.kill();
            }
        }

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        self.shutdown_tx = shutdown_tx;
        self.shutdown_rx = shutdown_rx;
    }

    fn abort_task(handle: &mut Option<JoinHandle<()>>) {
        if let Some(handle) = handle.take() {
            handle.abort();
        }
    }

    fn reject_waiters(&mut self, error: SyncError) {
        for waiter in self.connect_waiters.drain(..) {
            let _ = waiter.send(Err(error.clone()));
        }
    }

    async fn process_inbound(&mut self, frame: Frame) {
        self.last_inbound = Instant::now();
        let decoded = match self.codec.decode(&frame) {
            Ok(decoded) => decoded,
            Err(err) => {
                self.health.record_decode_error();
                warn!(error = %err, "dropping undecodable frame");
                return;
            }
        };

        match decoded {
            Decoded::Opened {
                channel_id,
                heartbeat,
                replies,
            } => {
                self.channel_id = channel_id;
                if let Some(limit) = heartbeat {
                    self.start_heartbeat(limit);
                }
                if let Err(err) = self.write_frames(replies).await {
                    warn!(error = %err, "failed to answer session open");
                }
            }
            Decoded::Ready { channel_id } => {
                if self.state == ConnectionState::Connecting {
                    self.on_established(channel_id).await;
                }
            }
            Decoded::Event { name, payload } => self.process_event(name, payload),
            Decoded::Reply(frame) => {
                if let Err(err) = self.write_frames(vec![frame]).await {
                    debug!(error = %err, "heartbeat reply not written");
                }
            }
            Decoded::Closed { reason } => {
                self.handle_transport_closed(DisconnectCause::RemoteClosed { reason })
                    .await
            }
            Decoded::Rejected { reason } => {
                self.handle_transport_closed(DisconnectCause::HandshakeFailed { reason })
                    .await
            }
            Decoded::Ignore => {}
        }
    }

    fn process_event(&mut self, name: String, payload: Value) {
        self.health.record_message();

        if name == PONG_EVENT {
            match decode_payload::<PongPayload>(&payload) {
                Ok(pong) => {
                    if let Some(rtt) = self.latency.handle_pong(&pong) {
                        self.health.record_rtt(rtt);
                        debug!(rtt_us = rtt.as_micros() as u64, "pong");
                    }
                }
                Err(err) => {
                    self.health.record_decode_error();
                    debug!(error = %err, "ignoring malformed pong");
                }
            }
            return;
        }

        let event = match SyncEvent::decode(&name, &payload) {
            Ok(event) => event,
            Err(err) => {
                self.health.record_decode_error();
                warn!(event = %name, error = %err, "payload does not match schema, dispatching raw");
                SyncEvent::Unrecognized {
                    event: name,
                    data: payload.clone(),
                }
            }
        };
        self.emit(EventEnvelope::new(event, payload, now_epoch_ms()));
    }

    fn emit(&mut self, envelope: EventEnvelope) {
        self.history
            .log_event(envelope.event_type.clone(), &envelope.payload);
        let failures = self.dispatcher.dispatch(&envelope);
        if failures > 0 {
            self.health.record_listener_failures(failures);
        }
    }

    async fn write_frames(&self, mut frames: Vec<Frame>) -> SyncResult<()> {
        if frames.is_empty() {
            return Ok(());
        }
        let writer = self.writer.as_ref().ok_or(SyncError::NotConnected)?;
        let sent = if frames.len() == 1
            && let Some(frame) = frames.pop()
        {
            tokio::time::timeout(WRITER_SEND_TIMEOUT, writer.tell(WriteFrame { frame }).send())
                .await
                .map(|res| res.map_err(mailbox_error))
        } else {
            tokio::time::timeout(WRITER_SEND_TIMEOUT, writer.tell(WriteBatch { frames }).send())
                .await
                .map(|res| res.map_err(mailbox_error))
        };
        sent.unwrap_or_else(|_| {
            Err(SyncError::Timeout {
                context: format!("writer mailbox still full after {WRITER_SEND_TIMEOUT:?}"),
            })
        })
    }

    async fn send_directive(&mut self, directive: &Directive) -> SyncResult<()> {
        let frame = self.codec.encode(directive)?;
        self.write_frames(vec![frame]).await?;
        self.health.record_sent();
        debug!(directive = %directive.name, "directive queued");
        Ok(())
    }

    /// Live directives only go out once the tracked set was replayed on this connection;
    /// before that the replay carries them.
    fn subscriptions_live(&self) -> bool {
        self.state == ConnectionState::Connected && self.registry.is_applied()
    }

    async fn handle_subscribe(&mut self, topic: Topic) -> bool {
        let added = self.registry.insert(topic.clone());
        if added && self.subscriptions_live() {
            if let Err(err) = self.send_directive(&topic.subscribe_directive()).await {
                warn!(topic = %topic, error = %err, "subscribe deferred to next connection");
            }
        }
        added
    }

    async fn handle_unsubscribe(&mut self, topic: Topic) -> bool {
        let removed = self.registry.remove(&topic);
        if removed && self.subscriptions_live() {
            if let Err(err) = self.send_directive(&topic.unsubscribe_directive()).await {
                warn!(topic = %topic, error = %err, "unsubscribe not delivered");
            }
        }
        removed
    }

    async fn handle_ping(&mut self, waiter: Option<PingWaiter>) {
        if self.state != ConnectionState::Connected {
            if let Some(waiter) = waiter {
                let _ = waiter.send(Err(SyncError::NotConnected));
            }
            return;
        }

        let Some((id, directive)) = self.latency.create_ping(waiter) else {
            debug!(pending = self.latency.pending(), "skipping ping, earlier pings unanswered");
            return;
        };
        if let Err(err) = self.send_directive(&directive).await {
            // The ping stays pending and times out below.
            warn!(id, error = %err, "ping not sent");
        }

        let timeout = self.latency.timeout();
        let actor_ref = self.actor_ref.clone();
        tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            let _ = actor_ref.tell(ManagerEvent::ExpirePing { id }).send().await;
        });
    }

    fn start_ping_loop(&mut self) {
        Self::abort_task(&mut self.ping_task);

        let mut shutdown_rx = self.shutdown_rx.clone();
        let interval = self.latency.interval();
        let actor_ref = self.actor_ref.clone();

        self.ping_task = Some(tokio::spawn(async move {
            let start = tokio::time::Instant::now() + interval;
            let mut ticker = tokio::time::interval_at(start, interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = shutdown_rx.changed() => {
                        if *shutdown_rx.borrow() { break; }
                    }
                    _ = ticker.tick() => {
                        if actor_ref.tell(ManagerEvent::SendPing).send().await.is_err() {
                            break;
                        }
                    }
                }
            }
        }));
    }

    /// Watch for the server's engine.io heartbeats; silence beyond `limit` means a dead channel.
    fn start_heartbeat(&mut self, limit: Duration) {
        Self::abort_task(&mut self.heartbeat_task);
        if limit.is_zero() {
            return;
        }
        self.heartbeat = Some(limit);

        let epoch = self.epoch;
        let period = (limit / 2).max(Duration::from_millis(10));
        let mut shutdown_rx = self.shutdown_rx.clone();
        let actor_ref = self.actor_ref.clone();

        self.heartbeat_task = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = shutdown_rx.changed() => {
                        if *shutdown_rx.borrow() { break; }
                    }
                    _ = ticker.tick() => {
                        if actor_ref.tell(ManagerEvent::HeartbeatCheck { epoch }).send().await.is_err() {
                            break;
                        }
                    }
                }
            }
        }));
    }

    async fn check_heartbeat(&mut self) {
        let Some(limit) = self.heartbeat else {
            return;
        };
        let silent_for = self.last_inbound.elapsed();
        if silent_for > limit {
            let cause = DisconnectCause::ReadFailure {
                error: format!("no heartbeat for {silent_for:?} (limit {limit:?})"),
            };
            self.handle_transport_closed(cause).await;
        }
    }

    async fn handle_event(&mut self, event: ManagerEvent) {
        match event {
            ManagerEvent::ConnectFailed { epoch, error } => {
                if epoch == self.epoch && self.state == ConnectionState::Connecting {
                    debug!(epoch, error = %error, "connect attempt failed");
                    self.handle_attempt_failed(error).await;
                }
            }
            ManagerEvent::ConnectDeadline { epoch } => {
                if epoch == self.epoch && self.state == ConnectionState::Connecting {
                    let error = SyncError::Timeout {
                        context: format!(
                            "connect to {} within {:?}",
                            self.endpoint,
                            self.config.connect_timeout()
                        ),
                    };
                    self.handle_attempt_failed(error).await;
                }
            }
            ManagerEvent::Inbound { epoch, frame } => {
                if epoch == self.epoch {
                    self.process_inbound(frame).await;
                }
            }
            ManagerEvent::TransportClosed { epoch, cause } => {
                if epoch == self.epoch {
                    self.handle_transport_closed(cause).await;
                } else {
                    debug!(epoch, current = self.epoch, cause = ?cause, "stale transport close");
                }
            }
            ManagerEvent::RetryConnect { generation } => {
                if generation == self.retry_generation
                    && self.state == ConnectionState::Reconnecting
                {
                    self.retry_task = None;
                    self.start_attempt();
                }
            }
            ManagerEvent::HeartbeatCheck { epoch } => {
                if epoch == self.epoch {
                    self.check_heartbeat().await;
                }
            }
            ManagerEvent::SendPing => {
                if self.state == ConnectionState::Connected && self.latency.is_running() {
                    self.handle_ping(None).await;
                }
            }
            ManagerEvent::ExpirePing { id } => {
                if self.latency.expire(id) {
                    debug!(id, "ping timed out");
                }
            }
        }
    }

    fn log_reconnect_plan(
        &self,
        event: &str,
        note: &str,
        reason: &str,
        cause: Option<&DisconnectCause>,
        delay: Option<Duration>,
    ) {
        let delay_ms = delay.map(|d| d.as_millis().min(u64::MAX as u128) as u64);
        let stats = self.health.stats();
        let last_message_age_ms = stats.last_message_age.as_millis().min(u64::MAX as u128) as u64;
        let last_latency_us = self
            .latency
            .last_latency()
            .map(|d| d.as_micros().min(u64::MAX as u128) as u64);

        // Auto-reconnect disabled by configuration is expected, not worth a warning.
        if note == "retry_suppressed" {
            debug!(
                url = %self.endpoint,
                event = %event,
                note = %note,
                reason = %reason,
                cause = ?cause,
                attempt = self.reconnect_attempts,
                "reconnect plan"
            );
        } else {
            warn!(
                url = %self.endpoint,
                event = %event,
                note = %note,
                reason = %reason,
                cause = ?cause,
                attempt = self.reconnect_attempts,
                max_attempts = self.reconnect.max_attempts(),
                retry = self.retries_scheduled,
                delay_ms,
                last_message_age_ms,
                messages = stats.messages_received,
                last_latency_us,
                "reconnect plan"
            );
        }
    }
}

pub(crate) fn mailbox_error<M, E: std::fmt::Display>(err: SendError<M, E>) -> SyncError {
    SyncError::ActorError(err.to_string())
}

/// Unwrap a handler error, or describe why the message never reached the handler.
pub(crate) fn reply_error<M>(err: SendError<M, SyncError>) -> SyncError {
    match err {
        SendError::HandlerError(err) => err,
        other => SyncError::ActorError(other.to_string()),
    }
}

impl<T, C> KameoMessage<ManagerEvent> for ConnectionManager<T, C>
where
    T: Transport,
    C: WireCodec,
{
    type Reply = ();

    async fn handle(&mut self, event: ManagerEvent, _ctx: &mut Context<Self, Self::Reply>) {
        self.handle_event(event).await;
    }
}

impl<T, C> KameoMessage<TransportOpened<T>> for ConnectionManager<T, C>
where
    T: Transport,
    C: WireCodec,
{
    type Reply = ();

    async fn handle(
        &mut self,
        msg: TransportOpened<T>,
        _ctx: &mut Context<Self, Self::Reply>,
    ) {
        if msg.epoch != self.epoch || self.state != ConnectionState::Connecting {
            debug!(epoch = msg.epoch, current = self.epoch, "dropping stale transport");
            return;
        }
        self.on_transport_opened(msg.reader, msg.writer).await;
    }
}

/// Open the channel. The waiter resolves once connected, or with the terminal error.
pub struct Connect {
    pub waiter: Option<ConnectWaiter>,
}

/// Close the channel on application request.
pub struct Disconnect;

pub struct Subscribe(pub Topic);

pub struct Unsubscribe(pub Topic);

pub struct AddListener {
    pub event_type: EventType,
    pub listener: Listener,
}

pub struct RemoveListeners {
    pub event_type: EventType,
    pub id: Option<ListenerId>,
}

/// Measure a round trip; the waiter receives the latency or the failure.
pub struct Ping {
    pub waiter: PingWaiter,
}

pub struct GetSnapshot;

pub struct GetStatus;

pub struct GetSubscriptions;

pub struct GetHistory {
    pub filter: Option<EventType>,
}

pub struct ClearHistory;

impl<T, C> KameoMessage<Connect> for ConnectionManager<T, C>
where
    T: Transport,
    C: WireCodec,
{
    type Reply = SyncResult<()>;

    async fn handle(&mut self, msg: Connect, _ctx: &mut Context<Self, Self::Reply>) -> Self::Reply {
        self.handle_connect(msg.waiter);
        Ok(())
    }
}

impl<T, C> KameoMessage<Disconnect> for ConnectionManager<T, C>
where
    T: Transport,
    C: WireCodec,
{
    type Reply = SyncResult<()>;

    async fn handle(
        &mut self,
        _msg: Disconnect,
        _ctx: &mut Context<Self, Self::Reply>,
    ) -> Self::Reply {
        self.handle_disconnect().await;
        Ok(())
    }
}

impl<T, C> KameoMessage<Subscribe> for ConnectionManager<T, C>
where
    T: Transport,
    C: WireCodec,
{
    type Reply = SyncResult<bool>;

    async fn handle(&mut self, msg: Subscribe, _ctx: &mut Context<Self, Self::Reply>) -> Self::Reply {
        Ok(self.handle_subscribe(msg.0).await)
    }
}

impl<T, C> KameoMessage<Unsubscribe> for ConnectionManager<T, C>
where
    T: Transport,
    C: WireCodec,
{
    type Reply = SyncResult<bool>;

    async fn handle(
        &mut self,
        msg: Unsubscribe,
        _ctx: &mut Context<Self, Self::Reply>,
    ) -> Self::Reply {
        Ok(self.handle_unsubscribe(msg.0).await)
    }
}

impl<T, C> KameoMessage<AddListener> for ConnectionManager<T, C>
where
    T: Transport,
    C: WireCodec,
{
    type Reply = SyncResult<ListenerId>;

    async fn handle(
        &mut self,
        msg: AddListener,
        _ctx: &mut Context<Self, Self::Reply>,
    ) -> Self::Reply {
        Ok(self.dispatcher.on(msg.event_type, msg.listener))
    }
}

impl<T, C> KameoMessage<RemoveListeners> for ConnectionManager<T, C>
where
    T: Transport,
    C: WireCodec,
{
    type Reply = SyncResult<usize>;

    async fn handle(
        &mut self,
        msg: RemoveListeners,
        _ctx: &mut Context<Self, Self::Reply>,
    ) -> Self::Reply {
        Ok(self.dispatcher.off(&msg.event_type, msg.id))
    }
}

impl<T, C> KameoMessage<Ping> for ConnectionManager<T, C>
where
    T: Transport,
    C: WireCodec,
{
    type Reply = SyncResult<()>;

    async fn handle(&mut self, msg: Ping, _ctx: &mut Context<Self, Self::Reply>) -> Self::Reply {
        self.handle_ping(Some(msg.waiter)).await;
        Ok(())
    }
}

impl<T, C> KameoMessage<GetSnapshot> for ConnectionManager<T, C>
where
    T: Transport,
    C: WireCodec,
{
    type Reply = SyncResult<ConnectionSnapshot>;

    async fn handle(
        &mut self,
        _msg: GetSnapshot,
        _ctx: &mut Context<Self, Self::Reply>,
    ) -> Self::Reply {
        Ok(self.snapshot())
    }
}

impl<T, C> KameoMessage<GetStatus> for ConnectionManager<T, C>
where
    T: Transport,
    C: WireCodec,
{
    type Reply = SyncResult<SyncStatus>;

    async fn handle(
        &mut self,
        _msg: GetStatus,
        _ctx: &mut Context<Self, Self::Reply>,
    ) -> Self::Reply {
        Ok(self.status())
    }
}

impl<T, C> KameoMessage<GetSubscriptions> for ConnectionManager<T, C>
where
    T: Transport,
    C: WireCodec,
{
    type Reply = SyncResult<Vec<Topic>>;

    async fn handle(
        &mut self,
        _msg: GetSubscriptions,
        _ctx: &mut Context<Self, Self::Reply>,
    ) -> Self::Reply {
        Ok(self.registry.topics().to_vec())
    }
}

impl<T, C> KameoMessage<GetHistory> for ConnectionManager<T, C>
where
    T: Transport,
    C: WireCodec,
{
    type Reply = SyncResult<Vec<HistoryEntry>>;

    async fn handle(
        &mut self,
        msg: GetHistory,
        _ctx: &mut Context<Self, Self::Reply>,
    ) -> Self::Reply {
        Ok(self.history.history(msg.filter.as_ref()))
    }
}

impl<T, C> KameoMessage<ClearHistory> for ConnectionManager<T, C>
where
    T: Transport,
    C: WireCodec,
{
    type Reply = SyncResult<()>;

    async fn handle(
        &mut self,
        _msg: ClearHistory,
        _ctx: &mut Context<Self, Self::Reply>,
    ) -> Self::Reply {
        self.history.clear();
        Ok(())
    }
}
