use hdrhistogram::Histogram;
use std::time::{Duration, Instant};

use super::types::SyncHealthStats;

/// Counters and RTT percentiles for the connection manager.
///
/// Owned by the manager actor, so plain fields are enough.
#[derive(Debug)]
pub struct HealthMonitor {
    started: Instant,
    last_message_received: Instant,
    messages_received: u64,
    messages_sent: u64,
    decode_errors: u64,
    listener_failures: u64,
    reconnects: u64,
    latency_histogram: Option<Histogram<u64>>,
}

impl HealthMonitor {
    pub fn new() -> Self {
        let now = Instant::now();
        Self {
            started: now,
            last_message_received: now,
            messages_received: 0,
            messages_sent: 0,
            decode_errors: 0,
            listener_failures: 0,
            reconnects: 0,
            latency_histogram: Histogram::new_with_bounds(1, 60_000_000, 3).ok(),
        }
    }

    /// Restart the uptime clock for a fresh connection.
    pub fn reset(&mut self) {
        let now = Instant::now();
        self.started = now;
        self.last_message_received = now;
    }

    pub fn record_message(&mut self) {
        self.last_message_received = Instant::now();
        self.messages_received = self.messages_received.saturating_add(1);
    }

    pub fn record_sent(&mut self) {
        self.messages_sent = self.messages_sent.saturating_add(1);
    }

    pub fn record_decode_error(&mut self) {
        self.decode_errors = self.decode_errors.saturating_add(1);
    }

    pub fn record_listener_failures(&mut self, failures: usize) {
        self.listener_failures = self.listener_failures.saturating_add(failures as u64);
    }

    pub fn record_rtt(&mut self, latency: Duration) {
        let micros = latency.as_micros().clamp(1, u64::MAX as u128) as u64;
        if let Some(histogram) = self.latency_histogram.as_mut() {
            let _ = histogram.record(micros);
        }
    }

    pub fn increment_reconnect(&mut self) {
        self.reconnects = self.reconnects.saturating_add(1);
    }

    pub fn stats(&self) -> SyncHealthStats {
        let (p50, p99, samples) = match &self.latency_histogram {
            Some(histogram) if histogram.len() > 0 => (
                histogram.value_at_percentile(50.0),
                histogram.value_at_percentile(99.0),
                histogram.len(),
            ),
            _ => (0, 0, 0),
        };

        SyncHealthStats {
            uptime: self.started.elapsed(),
            messages_received: self.messages_received,
            messages_sent: self.messages_sent,
            decode_errors: self.decode_errors,
            listener_failures: self.listener_failures,
            reconnects: self.reconnects,
            last_message_age: self.last_message_received.elapsed(),
            p50_latency_us: p50,
            p99_latency_us: p99,
            latency_samples: samples,
        }
    }
}

impl Default for HealthMonitor {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn records_rtt_percentiles() {
        let mut monitor = HealthMonitor::new();
        monitor.record_rtt(Duration::from_micros(100));
        monitor.record_rtt(Duration::from_micros(200));
        monitor.record_rtt(Duration::from_micros(300));

        let stats = monitor.stats();
        assert_eq!(stats.latency_samples, 3);
        assert_eq!(stats.p50_latency_us, 200);
        assert_eq!(stats.p99_latency_us, 300);
    }

    #[test]
    fn counters_accumulate() {
        let mut monitor = HealthMonitor::new();
        monitor.record_message();
        monitor.record_message();
        monitor.record_sent();
        monitor.record_decode_error();
        monitor.record_listener_failures(2);
        monitor.increment_reconnect();

        let stats = monitor.stats();
        assert_eq!(stats.messages_received, 2);
        assert_eq!(stats.messages_sent, 1);
        assert_eq!(stats.decode_errors, 1);
        assert_eq!(stats.listener_failures, 2);
        assert_eq!(stats.reconnects, 1);
        assert_eq!(stats.latency_samples, 0);
    }
}
