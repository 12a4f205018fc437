//! Inbound event model.
//!
//! Server events arrive as `(name, payload)` pairs. They are decoded into a closed [`SyncEvent`]
//! enumeration with an [`SyncEvent::Unrecognized`] fallback, so dispatch stays exhaustive while
//! unknown server events remain observable through the catch-all listener.

use std::fmt;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use sonic_rs::Value;

use super::types::{SyncError, SyncResult};

/// Event type key used for listener registration and history filtering.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum EventType {
    SimulationTick,
    SimulationEvent,
    TruckUpdated,
    BinUpdated,
    RouteUpdated,
    OptimizationComplete,
    ServerMessage,
    ConnectionLost,
    ConnectionRestored,
    /// Catch-all: receives every dispatched event after the type-specific listeners.
    Message,
    Custom(String),
}

impl EventType {
    pub fn from_name(name: &str) -> Self {
        match name {
            "simulation_tick" => EventType::SimulationTick,
            "simulation_event" => EventType::SimulationEvent,
            "truck_updated" => EventType::TruckUpdated,
            "bin_updated" => EventType::BinUpdated,
            "route_updated" => EventType::RouteUpdated,
            "optimization_complete" => EventType::OptimizationComplete,
            "server_message" => EventType::ServerMessage,
            "connection_lost" => EventType::ConnectionLost,
            "connection_restored" => EventType::ConnectionRestored,
            "message" => EventType::Message,
            other => EventType::Custom(other.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            EventType::SimulationTick => "simulation_tick",
            EventType::SimulationEvent => "simulation_event",
            EventType::TruckUpdated => "truck_updated",
            EventType::BinUpdated => "bin_updated",
            EventType::RouteUpdated => "route_updated",
            EventType::OptimizationComplete => "optimization_complete",
            EventType::ServerMessage => "server_message",
            EventType::ConnectionLost => "connection_lost",
            EventType::ConnectionRestored => "connection_restored",
            EventType::Message => "message",
            EventType::Custom(name) => name,
        }
    }
}

impl From<&str> for EventType {
    fn from(name: &str) -> Self {
        EventType::from_name(name)
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TickStatistics {
    #[serde(alias = "active_trucks", default)]
    pub active_trucks: Option<u32>,
    #[serde(alias = "bins_needing_collection", default)]
    pub bins_needing_collection: Option<u32>,
    #[serde(alias = "total_collections", default)]
    pub total_collections: Option<u64>,
    #[serde(alias = "total_distance", default)]
    pub total_distance: Option<f64>,
}

/// Periodic simulation snapshot.
///
/// The backend nests the counters under `statistics`; flat camelCase fields are accepted too.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SimulationTick {
    #[serde(alias = "sim_time", default)]
    pub sim_time: Option<String>,
    #[serde(alias = "tick_count", default)]
    pub tick_count: u64,
    #[serde(alias = "active_trucks", default)]
    pub active_trucks: Option<u32>,
    #[serde(alias = "bins_needing_collection", default)]
    pub bins_needing_collection: Option<u32>,
    #[serde(alias = "traffic_multiplier", default)]
    pub traffic_multiplier: Option<f64>,
    #[serde(default)]
    pub statistics: Option<TickStatistics>,
}

impl SimulationTick {
    pub fn active_trucks(&self) -> Option<u32> {
        self.active_trucks
            .or_else(|| self.statistics.as_ref().and_then(|s| s.active_trucks))
    }

    pub fn bins_needing_collection(&self) -> Option<u32> {
        self.bins_needing_collection.or_else(|| {
            self.statistics
                .as_ref()
                .and_then(|s| s.bins_needing_collection)
        })
    }
}

/// Discrete simulation occurrence (bin collected, truck breakdown, overflow, ...).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SimulationEventNotice {
    #[serde(alias = "event_type", alias = "type")]
    pub event_type: String,
    #[serde(default)]
    pub timestamp: Option<String>,
    #[serde(default)]
    pub data: Option<Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TruckUpdated {
    #[serde(alias = "truck_id", alias = "id")]
    pub truck_id: String,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub location: Option<[f64; 2]>,
    #[serde(default)]
    pub load: Option<f64>,
    #[serde(default)]
    pub route: Option<Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BinUpdated {
    #[serde(alias = "bin_id", alias = "id")]
    pub bin_id: String,
    #[serde(alias = "fill_level", default)]
    pub fill_level: Option<f64>,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(alias = "last_collection", default)]
    pub last_collection: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RouteUpdated {
    #[serde(alias = "truck_id")]
    pub truck_id: String,
    #[serde(default)]
    pub route: Option<Value>,
    #[serde(alias = "estimated_completion", default)]
    pub estimated_completion: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OptimizationComplete {
    #[serde(alias = "trucks_optimized", default)]
    pub trucks_optimized: u32,
    #[serde(alias = "bins_assigned", default)]
    pub bins_assigned: u32,
    #[serde(alias = "total_distance", default)]
    pub total_distance: f64,
    #[serde(alias = "optimization_time", default)]
    pub optimization_time: f64,
}

/// Greeting the backend emits right after a client connects.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ServerMessage {
    #[serde(default)]
    pub msg: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionLost {
    pub reason: String,
    pub timestamp: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionRestored {
    pub timestamp: u64,
}

/// Echo of a latency ping.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PongPayload {
    #[serde(alias = "sent_at", default)]
    pub sent_at: Option<u64>,
    #[serde(default)]
    pub id: Option<u64>,
}

pub const PONG_EVENT: &str = "pong";

/// Typed inbound event.
#[derive(Debug, Clone, PartialEq)]
pub enum SyncEvent {
    SimulationTick(SimulationTick),
    SimulationEvent(SimulationEventNotice),
    TruckUpdated(TruckUpdated),
    BinUpdated(BinUpdated),
    RouteUpdated(RouteUpdated),
    OptimizationComplete(OptimizationComplete),
    ServerMessage(ServerMessage),
    ConnectionLost(ConnectionLost),
    ConnectionRestored(ConnectionRestored),
    Unrecognized { event: String, data: Value },
}

impl SyncEvent {
    /// Decode a server event. Unknown names become [`SyncEvent::Unrecognized`]; known names with
    /// payloads that do not fit their schema are an error.
    pub fn decode(name: &str, payload: &Value) -> SyncResult<Self> {
        let event = match EventType::from_name(name) {
            EventType::SimulationTick => SyncEvent::SimulationTick(decode_payload(payload)?),
            EventType::SimulationEvent => SyncEvent::SimulationEvent(decode_payload(payload)?),
            EventType::TruckUpdated => SyncEvent::TruckUpdated(decode_payload(payload)?),
            EventType::BinUpdated => SyncEvent::BinUpdated(decode_payload(payload)?),
            EventType::RouteUpdated => SyncEvent::RouteUpdated(decode_payload(payload)?),
            EventType::OptimizationComplete => {
                SyncEvent::OptimizationComplete(decode_payload(payload)?)
            }
            EventType::ServerMessage => SyncEvent::ServerMessage(decode_payload(payload)?),
            EventType::ConnectionLost
            | EventType::ConnectionRestored
            | EventType::Message
            | EventType::Custom(_) => SyncEvent::Unrecognized {
                event: name.to_string(),
                data: payload.clone(),
            },
        };
        Ok(event)
    }

    pub fn event_type(&self) -> EventType {
        match self {
            SyncEvent::SimulationTick(_) => EventType::SimulationTick,
            SyncEvent::SimulationEvent(_) => EventType::SimulationEvent,
            SyncEvent::TruckUpdated(_) => EventType::TruckUpdated,
            SyncEvent::BinUpdated(_) => EventType::BinUpdated,
            SyncEvent::RouteUpdated(_) => EventType::RouteUpdated,
            SyncEvent::OptimizationComplete(_) => EventType::OptimizationComplete,
            SyncEvent::ServerMessage(_) => EventType::ServerMessage,
            SyncEvent::ConnectionLost(_) => EventType::ConnectionLost,
            SyncEvent::ConnectionRestored(_) => EventType::ConnectionRestored,
            // Malformed known events keep their type; synthetic names are reserved.
            SyncEvent::Unrecognized { event, .. } => match EventType::from_name(event) {
                EventType::ConnectionLost | EventType::ConnectionRestored | EventType::Message => {
                    EventType::Custom(event.clone())
                }
                other => other,
            },
        }
    }
}

/// What listeners receive for every dispatched event.
#[derive(Debug, Clone)]
pub struct EventEnvelope {
    pub event_type: EventType,
    pub event: SyncEvent,
    pub payload: Value,
    pub received_at_ms: u64,
}

impl EventEnvelope {
    pub fn new(event: SyncEvent, payload: Value, received_at_ms: u64) -> Self {
        Self {
            event_type: event.event_type(),
            event,
            payload,
            received_at_ms,
        }
    }

    pub fn connection_lost(reason: impl Into<String>, timestamp: u64) -> Self {
        let reason = reason.into();
        let payload = sonic_rs::json!({ "reason": reason.as_str(), "timestamp": timestamp });
        Self::new(
            SyncEvent::ConnectionLost(ConnectionLost { reason, timestamp }),
            payload,
            timestamp,
        )
    }

    pub fn connection_restored(timestamp: u64) -> Self {
        let payload = sonic_rs::json!({ "timestamp": timestamp });
        Self::new(
            SyncEvent::ConnectionRestored(ConnectionRestored { timestamp }),
            payload,
            timestamp,
        )
    }
}

/// Outbound client message: an event name plus its JSON payload.
#[derive(Debug, Clone, PartialEq)]
pub struct Directive {
    pub name: String,
    pub payload: Value,
}

impl Directive {
    pub fn new(name: impl Into<String>, payload: Value) -> Self {
        Self {
            name: name.into(),
            payload,
        }
    }
}

pub(crate) fn decode_payload<T: DeserializeOwned>(payload: &Value) -> SyncResult<T> {
    let raw = sonic_rs::to_string(payload).map_err(|e| SyncError::ParseFailed(e.to_string()))?;
    sonic_rs::from_str(&raw).map_err(|e| SyncError::ParseFailed(e.to_string()))
}
