use std::fmt;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use thiserror::Error;

/// Convenience result alias for synchronization client operations.
pub type SyncResult<T> = Result<T, SyncError>;

/// Canonical error surface of the synchronization client.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SyncError {
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Connection failed after {attempts} attempts: max attempts reached")]
    MaxAttemptsReached { attempts: u32 },

    #[error("Not connected")]
    NotConnected,

    #[error("Timeout: {context}")]
    Timeout { context: String },

    #[error("Cancelled: {0}")]
    Cancelled(String),

    #[error("Transport error ({context}): {error}")]
    TransportError {
        context: &'static str,
        error: String,
    },

    #[error("Handshake rejected: {0}")]
    HandshakeRejected(String),

    #[error("Parse failed: {0}")]
    ParseFailed(String),

    #[error("Invalid topic: {0}")]
    InvalidTopic(String),

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("Actor error: {0}")]
    ActorError(String),
}

/// Lifecycle state of the single channel owned by the connection manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
    Failed,
}

impl ConnectionState {
    pub fn as_str(self) -> &'static str {
        match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Reconnecting => "reconnecting",
            ConnectionState::Failed => "failed",
        }
    }

    /// `Connecting` or `Reconnecting`: a connection attempt is either running or scheduled.
    pub fn is_pending(self) -> bool {
        matches!(
            self,
            ConnectionState::Connecting | ConnectionState::Reconnecting
        )
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why the channel went away.
///
/// The manager records the cause of the most recent loss in its status. `Manual` only ever comes
/// from an explicit `disconnect()`, never from transport-supplied reason strings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DisconnectCause {
    Manual,
    RemoteClosed { reason: String },
    ReadFailure { error: String },
    WriteFailure { error: String },
    HandshakeFailed { reason: String },
}

impl DisconnectCause {
    /// Reason string reported to `connection_lost` listeners.
    pub fn reason(&self) -> &str {
        match self {
            DisconnectCause::Manual => "manual disconnect",
            DisconnectCause::RemoteClosed { reason }
            | DisconnectCause::HandshakeFailed { reason } => reason,
            DisconnectCause::ReadFailure { error } | DisconnectCause::WriteFailure { error } => {
                error
            }
        }
    }
}

/// Read-only view of the connection manager state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionSnapshot {
    pub state: ConnectionState,
    pub reconnect_attempts: u32,
    pub channel_id: Option<String>,
}

/// Basic connection statistics snapshot.
#[derive(Clone, Debug, Default)]
pub struct SyncHealthStats {
    pub uptime: Duration,
    pub messages_received: u64,
    pub messages_sent: u64,
    pub decode_errors: u64,
    pub listener_failures: u64,
    pub reconnects: u64,
    pub last_message_age: Duration,
    pub p50_latency_us: u64,
    pub p99_latency_us: u64,
    pub latency_samples: u64,
}

/// Best-effort current time as Unix epoch milliseconds.
#[inline]
pub fn now_epoch_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis().min(u64::MAX as u128) as u64)
        .unwrap_or(0)
}
