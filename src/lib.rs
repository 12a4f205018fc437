//! Kameo-based real-time synchronization client for the fleet simulation event channel.

pub mod client;
pub mod codec;
pub mod config;
pub mod core;
pub mod testing;
pub mod transport;

pub use client::{ListenerHandle, SyncClient, SyncStatus};
pub use codec::{JsonEnvelopeCodec, SocketIoCodec, WireCodec};
pub use config::SyncConfig;
pub use core::{
    ConnectionSnapshot, ConnectionState, EventEnvelope, EventType, ListenerError, ListenerId,
    SyncError, SyncEvent, SyncResult, Topic, TopicKind,
};
