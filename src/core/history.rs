use std::collections::VecDeque;

use sonic_rs::Value;

use super::event::EventType;
use super::types::now_epoch_ms;

pub const DEFAULT_HISTORY_CAPACITY: usize = 100;

/// Fixed-capacity ring buffer.
///
/// `push` is O(1) and evicts from the front when full; capacity `0` stores nothing.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CircularBuffer<T> {
    buffer: VecDeque<T>,
    capacity: usize,
}

impl<T> CircularBuffer<T> {
    pub fn new(capacity: usize) -> Self {
        Self {
            buffer: VecDeque::with_capacity(capacity.min(1024)),
            capacity,
        }
    }

    /// Append `item`, returning the evicted oldest element when the buffer was full.
    pub fn push(&mut self, item: T) -> Option<T> {
        if self.capacity == 0 {
            return Some(item);
        }

        let evicted = if self.buffer.len() == self.capacity {
            self.buffer.pop_front()
        } else {
            None
        };
        self.buffer.push_back(item);
        evicted
    }

    pub fn iter(&self) -> impl DoubleEndedIterator<Item = &T> + ExactSizeIterator {
        self.buffer.iter()
    }

    pub fn back(&self) -> Option<&T> {
        self.buffer.back()
    }

    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    pub fn clear(&mut self) {
        self.buffer.clear();
    }
}

/// One dispatched event as recorded for diagnostics.
#[derive(Debug, Clone, PartialEq)]
pub struct HistoryEntry {
    pub event_type: EventType,
    pub timestamp_ms: u64,
    pub payload: Value,
}

/// Bounded FIFO log of recently dispatched events.
#[derive(Debug, Clone)]
pub struct HistoryBuffer {
    entries: CircularBuffer<HistoryEntry>,
}

impl HistoryBuffer {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: CircularBuffer::new(capacity),
        }
    }

    pub fn log_event(&mut self, event_type: EventType, payload: &Value) {
        self.entries.push(HistoryEntry {
            event_type,
            timestamp_ms: now_epoch_ms(),
            payload: payload.clone(),
        });
    }

    /// Chronological snapshot, optionally restricted to one event type.
    pub fn history(&self, filter: Option<&EventType>) -> Vec<HistoryEntry> {
        self.entries
            .iter()
            .filter(|entry| filter.is_none_or(|wanted| &entry.event_type == wanted))
            .cloned()
            .collect()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.entries.capacity()
    }
}

impl Default for HistoryBuffer {
    fn default() -> Self {
        Self::new(DEFAULT_HISTORY_CAPACITY)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tick(n: u64) -> Value {
        sonic_rs::json!({ "tickCount": n })
    }

    #[test]
    fn ring_buffer_evicts_oldest() {
        let mut buffer = CircularBuffer::new(2);
        assert_eq!(buffer.push(1), None);
        assert_eq!(buffer.push(2), None);
        assert_eq!(buffer.push(3), Some(1));
        assert_eq!(buffer.iter().copied().collect::<Vec<_>>(), vec![2, 3]);
        assert_eq!(buffer.back(), Some(&3));
    }

    #[test]
    fn zero_capacity_stores_nothing() {
        let mut history = HistoryBuffer::new(0);
        history.log_event(EventType::SimulationTick, &tick(1));
        assert!(history.is_empty());
        assert!(history.history(None).is_empty());
    }

    #[test]
    fn history_keeps_most_recent_within_capacity() {
        let mut history = HistoryBuffer::new(3);
        for n in 0..5 {
            history.log_event(EventType::SimulationTick, &tick(n));
        }

        let entries = history.history(None);
        assert_eq!(entries.len(), 3);
        let counts: Vec<_> = entries.iter().map(|e| e.payload.clone()).collect();
        assert_eq!(counts, vec![tick(2), tick(3), tick(4)]);
        for pair in entries.windows(2) {
            assert!(pair[0].timestamp_ms <= pair[1].timestamp_ms);
        }
    }

    #[test]
    fn history_filters_by_type() {
        let mut history = HistoryBuffer::default();
        history.log_event(EventType::SimulationTick, &tick(1));
        history.log_event(
            EventType::TruckUpdated,
            &sonic_rs::json!({ "truckId": "T1" }),
        );
        history.log_event(EventType::SimulationTick, &tick(2));

        let ticks = history.history(Some(&EventType::SimulationTick));
        assert_eq!(ticks.len(), 2);
        assert!(ticks.iter().all(|e| e.event_type == EventType::SimulationTick));

        let trucks = history.history(Some(&EventType::TruckUpdated));
        assert_eq!(trucks.len(), 1);

        history.clear();
        assert!(history.history(None).is_empty());
    }

    #[test]
    fn logged_payload_is_a_copy() {
        let mut history = HistoryBuffer::default();
        let mut payload = tick(1);
        history.log_event(EventType::SimulationTick, &payload);
        payload = tick(99);

        assert_eq!(history.history(None)[0].payload, tick(1));
        assert_ne!(history.history(None)[0].payload, payload);
    }
}
