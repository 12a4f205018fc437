//! Listener registry and fan-out.

use std::any::Any;
use std::collections::HashMap;
use std::error::Error;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;

use tracing::warn;

use super::event::{EventEnvelope, EventType};

/// Error type listeners may return; it is logged and never propagated.
pub type ListenerError = Box<dyn Error + Send + Sync>;

pub type Listener = Arc<dyn Fn(&EventEnvelope) -> Result<(), ListenerError> + Send + Sync>;

/// Box a closure as a [`Listener`].
pub fn listener<F>(f: F) -> Listener
where
    F: Fn(&EventEnvelope) -> Result<(), ListenerError> + Send + Sync + 'static,
{
    Arc::new(f)
}

/// Identifies one registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ListenerId(u64);

impl ListenerId {
    pub fn get(self) -> u64 {
        self.0
    }
}

/// Routes dispatched envelopes to listeners in registration order.
#[derive(Default)]
pub struct EventDispatcher {
    listeners: HashMap<EventType, Vec<(ListenerId, Listener)>>,
    next_id: u64,
}

impl EventDispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on(&mut self, event_type: EventType, listener: Listener) -> ListenerId {
        self.next_id += 1;
        let id = ListenerId(self.next_id);
        self.listeners
            .entry(event_type)
            .or_default()
            .push((id, listener));
        id
    }

    /// Remove one registration (`Some(id)`) or all registrations for `event_type` (`None`).
    /// Returns how many were removed.
    pub fn off(&mut self, event_type: &EventType, id: Option<ListenerId>) -> usize {
        let Some(registered) = self.listeners.get_mut(event_type) else {
            return 0;
        };
        let removed = match id {
            Some(id) => {
                let before = registered.len();
                registered.retain(|(existing, _)| *existing != id);
                before - registered.len()
            }
            None => {
                let removed = registered.len();
                registered.clear();
                removed
            }
        };
        if registered.is_empty() {
            self.listeners.remove(event_type);
        }
        removed
    }

    pub fn listener_count(&self, event_type: &EventType) -> usize {
        self.listeners.get(event_type).map_or(0, Vec::len)
    }

    /// Invoke the listeners for `envelope.event_type`, then the catch-all listeners.
    /// Returns the number of listeners that failed or panicked.
    pub fn dispatch(&self, envelope: &EventEnvelope) -> usize {
        let mut failures = 0;
        if envelope.event_type != EventType::Message {
            failures += self.notify(&envelope.event_type, envelope);
        }
        failures + self.notify(&EventType::Message, envelope)
    }

    fn notify(&self, key: &EventType, envelope: &EventEnvelope) -> usize {
        let Some(registered) = self.listeners.get(key) else {
            return 0;
        };

        let mut failures = 0;
        for (id, listener) in registered {
            match catch_unwind(AssertUnwindSafe(|| listener(envelope))) {
                Ok(Ok(())) => {}
                Ok(Err(err)) => {
                    failures += 1;
                    warn!(
                        event = %envelope.event_type,
                        listener = id.get(),
                        error = %err,
                        "event listener failed"
                    );
                }
                Err(panic) => {
                    failures += 1;
                    warn!(
                        event = %envelope.event_type,
                        listener = id.get(),
                        panic = panic_message(panic.as_ref()),
                        "event listener panicked"
                    );
                }
            }
        }
        failures
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> &str {
    if let Some(message) = panic.downcast_ref::<&'static str>() {
        message
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.as_str()
    } else {
        "non-string panic payload"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::event::{SyncEvent, TruckUpdated};
    use std::sync::Mutex;

    fn truck_envelope() -> EventEnvelope {
        let payload = sonic_rs::json!({ "truckId": "T1" });
        EventEnvelope::new(
            SyncEvent::TruckUpdated(TruckUpdated {
                truck_id: "T1".into(),
                status: None,
                location: None,
                load: None,
                route: None,
            }),
            payload,
            0,
        )
    }

    fn recorder(log: &Arc<Mutex<Vec<&'static str>>>, tag: &'static str) -> Listener {
        let log = log.clone();
        listener(move |_| {
            log.lock().unwrap().push(tag);
            Ok(())
        })
    }

    #[test]
    fn listeners_run_in_order_then_catch_all() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut dispatcher = EventDispatcher::new();
        dispatcher.on(EventType::Message, recorder(&log, "any"));
        dispatcher.on(EventType::TruckUpdated, recorder(&log, "first"));
        dispatcher.on(EventType::TruckUpdated, recorder(&log, "second"));
        dispatcher.on(EventType::BinUpdated, recorder(&log, "bin"));

        assert_eq!(dispatcher.dispatch(&truck_envelope()), 0);
        assert_eq!(*log.lock().unwrap(), vec!["first", "second", "any"]);
    }

    #[test]
    fn failing_listeners_do_not_stop_siblings() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut dispatcher = EventDispatcher::new();
        dispatcher.on(
            EventType::TruckUpdated,
            listener(|_| Err("listener rejected payload".into())),
        );
        dispatcher.on(
            EventType::TruckUpdated,
            listener(|_| panic!("listener blew up")),
        );
        dispatcher.on(EventType::TruckUpdated, recorder(&log, "survivor"));

        assert_eq!(dispatcher.dispatch(&truck_envelope()), 2);
        assert_eq!(*log.lock().unwrap(), vec!["survivor"]);
    }

    #[test]
    fn off_removes_one_or_all_and_is_idempotent() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut dispatcher = EventDispatcher::new();
        let first = dispatcher.on(EventType::TruckUpdated, recorder(&log, "first"));
        dispatcher.on(EventType::TruckUpdated, recorder(&log, "second"));
        dispatcher.on(EventType::TruckUpdated, recorder(&log, "third"));

        assert_eq!(dispatcher.off(&EventType::TruckUpdated, Some(first)), 1);
        assert_eq!(dispatcher.off(&EventType::TruckUpdated, Some(first)), 0);
        assert_eq!(dispatcher.listener_count(&EventType::TruckUpdated), 2);

        dispatcher.dispatch(&truck_envelope());
        assert_eq!(*log.lock().unwrap(), vec!["second", "third"]);

        assert_eq!(dispatcher.off(&EventType::TruckUpdated, None), 2);
        assert_eq!(dispatcher.off(&EventType::TruckUpdated, None), 0);
        assert_eq!(dispatcher.off(&EventType::BinUpdated, None), 0);
    }
}
