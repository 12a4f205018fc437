use std::collections::HashMap;
use std::time::{Duration, Instant};

use tokio::sync::oneshot;

use super::event::{Directive, PongPayload};
use super::history::CircularBuffer;
use super::types::{SyncError, SyncResult, now_epoch_ms};

pub const PING_EVENT: &str = "ping";
pub const DEFAULT_PING_INTERVAL: Duration = Duration::from_secs(30);
pub const DEFAULT_PING_TIMEOUT: Duration = Duration::from_secs(5);

const MAX_SAMPLES: usize = 32;
const MAX_AUTO_PENDING: usize = 4;

pub type PingWaiter = oneshot::Sender<SyncResult<Duration>>;

/// One completed round trip.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PingSample {
    pub rtt: Duration,
    pub at_ms: u64,
}

#[derive(Debug)]
struct PendingPing {
    sent_at: Instant,
    sent_at_ms: u64,
    waiter: Option<PingWaiter>,
}

/// Application-level ping/pong tracking.
///
/// Each ping carries a numeric `id` and its send time in epoch milliseconds; the server echoes
/// both back in a `pong` event. Replies are matched by `id`, falling back to `sentAt` for servers
/// that only echo the timestamp.
#[derive(Debug)]
pub struct LatencyMonitor {
    interval: Duration,
    timeout: Duration,
    pending: HashMap<u64, PendingPing>,
    next_id: u64,
    last_latency: Option<Duration>,
    samples: CircularBuffer<PingSample>,
    running: bool,
}

impl LatencyMonitor {
    pub fn new(interval: Duration, timeout: Duration) -> Self {
        Self {
            interval,
            timeout,
            pending: HashMap::new(),
            next_id: 1,
            last_latency: None,
            samples: CircularBuffer::new(MAX_SAMPLES),
            running: false,
        }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Automatic pinging is enabled when the interval is non-zero.
    pub fn auto_enabled(&self) -> bool {
        !self.interval.is_zero()
    }

    pub fn start(&mut self) {
        self.running = true;
    }

    /// Stop automatic pinging. In-flight pings stay pending until they are answered or expire.
    pub fn stop(&mut self) {
        self.running = false;
    }

    pub fn is_running(&self) -> bool {
        self.running
    }

    /// Build the next ping. Automatic pings (no waiter) are skipped while too many earlier
    /// pings are still unanswered.
    pub fn create_ping(&mut self, waiter: Option<PingWaiter>) -> Option<(u64, Directive)> {
        if waiter.is_none() && self.auto_pending() >= MAX_AUTO_PENDING {
            return None;
        }

        let id = self.next_id;
        self.next_id = self.next_id.wrapping_add(1).max(1);
        let sent_at_ms = now_epoch_ms();
        self.pending.insert(
            id,
            PendingPing {
                sent_at: Instant::now(),
                sent_at_ms,
                waiter,
            },
        );

        let payload = sonic_rs::json!({ "sentAt": sent_at_ms, "id": id });
        Some((id, Directive::new(PING_EVENT, payload)))
    }

    /// Resolve the ping a `pong` answers. Unmatched echoes are ignored.
    pub fn handle_pong(&mut self, pong: &PongPayload) -> Option<Duration> {
        let id = pong
            .id
            .filter(|id| self.pending.contains_key(id))
            .or_else(|| {
                let sent_at = pong.sent_at?;
                self.pending
                    .iter()
                    .filter(|(_, ping)| ping.sent_at_ms == sent_at)
                    .map(|(id, _)| *id)
                    .min()
            })?;

        let ping = self.pending.remove(&id)?;
        let rtt = ping.sent_at.elapsed();
        self.last_latency = Some(rtt);
        self.samples.push(PingSample {
            rtt,
            at_ms: now_epoch_ms(),
        });
        if let Some(waiter) = ping.waiter {
            let _ = waiter.send(Ok(rtt));
        }
        Some(rtt)
    }

    /// Time out ping `id` if it is still pending. Returns whether anything expired.
    pub fn expire(&mut self, id: u64) -> bool {
        let Some(ping) = self.pending.remove(&id) else {
            return false;
        };
        if let Some(waiter) = ping.waiter {
            let _ = waiter.send(Err(SyncError::Timeout {
                context: format!("ping {id} unanswered after {:?}", self.timeout),
            }));
        }
        true
    }

    pub fn last_latency(&self) -> Option<Duration> {
        self.last_latency
    }

    pub fn samples(&self) -> Vec<PingSample> {
        self.samples.iter().copied().collect()
    }

    /// Mean absolute difference between consecutive round trips.
    pub fn jitter(&self) -> Option<Duration> {
        if self.samples.len() < 2 {
            return None;
        }
        let rtts: Vec<Duration> = self.samples.iter().map(|s| s.rtt).collect();
        let total: Duration = rtts.windows(2).map(|w| w[0].abs_diff(w[1])).sum();
        Some(total / (rtts.len() as u32 - 1))
    }

    pub fn pending(&self) -> usize {
        self.pending.len()
    }

    fn auto_pending(&self) -> usize {
        self.pending.values().filter(|p| p.waiter.is_none()).count()
    }
}

impl Default for LatencyMonitor {
    fn default() -> Self {
        Self::new(DEFAULT_PING_INTERVAL, DEFAULT_PING_TIMEOUT)
    }
}
