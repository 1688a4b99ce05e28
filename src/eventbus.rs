use crate::constants::EventTypeId;
use crate::error::ListenerError;
use crate::event::EventRecord;
use std::collections::HashMap;
use std::sync::Arc;

/// Receives canonical events from a device.
///
/// Listeners are shared between devices (the global buffer and the
/// persistence listener are registered on every device), so `handle` takes
/// `&self` and implementations use interior mutability.
pub trait EventListener: Send + Sync {
    /// Short label used in log messages.
    fn name(&self) -> &str;

    fn handle(&self, event: &EventRecord) -> Result<(), ListenerError>;
}

/// Handle returned by [`ListenerTable::add`].
pub type ListenerId = u64;

struct ListenerEntry {
    id: ListenerId,
    listener: Arc<dyn EventListener>,
}

/// Per-device table of listeners keyed by event type.
///
/// Listeners for one type are notified in registration order.
#[derive(Default)]
pub struct ListenerTable {
    next_id: ListenerId,
    by_type: HashMap<EventTypeId, Vec<ListenerEntry>>,
}

impl ListenerTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a listener for one event type.
    pub fn add(&mut self, event_type: EventTypeId, listener: Arc<dyn EventListener>) -> ListenerId {
        let id = self.next_id;
        self.next_id += 1;
        self.by_type
            .entry(event_type)
            .or_default()
            .push(ListenerEntry { id, listener });
        id
    }

    /// Unregisters a listener entirely. Returns `true` if it was present.
    pub fn remove(&mut self, id: ListenerId) -> bool {
        let mut found = false;
        for entries in self.by_type.values_mut() {
            let before = entries.len();
            entries.retain(|e| e.id != id);
            found |= entries.len() != before;
        }
        found
    }

    /// Listeners for `event_type`, in registration order.
    pub fn listeners_for(&self, event_type: EventTypeId) -> Vec<Arc<dyn EventListener>> {
        self.by_type
            .get(&event_type)
            .map(|entries| entries.iter().map(|e| e.listener.clone()).collect())
            .unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.by_type.values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Hands `event` to every listener in `listeners`.
///
/// A failing listener is logged and skipped; the rest still run. Returns the
/// number of failures.
pub fn notify_all(listeners: &[Arc<dyn EventListener>], event: &EventRecord) -> usize {
    let mut failures = 0;
    for listener in listeners {
        if let Err(e) = listener.handle(event) {
            log::warn!("event {} dropped by listener: {}", event.event_id, e);
            failures += 1;
        }
    }
    failures
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::constants::event_type;
    use crate::event::{EventSchema, FieldValue};
    use std::sync::Mutex;

    struct Recorder(Mutex<Vec<u64>>);

    impl EventListener for Recorder {
        fn name(&self) -> &str {
            "recorder"
        }

        fn handle(&self, event: &EventRecord) -> Result<(), ListenerError> {
            self.0.lock().unwrap().push(event.event_id);
            Ok(())
        }
    }

    fn log_event(id: u64) -> EventRecord {
        let schema = Arc::new(EventSchema::compose(event_type::LOG, "LogEvent", vec![]));
        let mut ev = EventRecord::new(schema, Vec::<FieldValue>::new()).unwrap();
        ev.event_id = id;
        ev
    }

    #[test]
    fn notified_in_registration_order_until_removed() {
        let first = Arc::new(Recorder(Mutex::new(vec![])));
        let second = Arc::new(Recorder(Mutex::new(vec![])));
        let mut table = ListenerTable::new();
        let id = table.add(event_type::LOG, first.clone());
        table.add(event_type::LOG, second.clone());

        notify_all(&table.listeners_for(event_type::LOG), &log_event(7));
        assert!(table.remove(id));
        notify_all(&table.listeners_for(event_type::LOG), &log_event(8));

        assert_eq!(*first.0.lock().unwrap(), vec![7]);
        assert_eq!(*second.0.lock().unwrap(), vec![7, 8]);
        assert_eq!(table.len(), 1);
        assert!(!table.remove(id));
    }

    #[test]
    fn other_types_do_not_receive() {
        let rec = Arc::new(Recorder(Mutex::new(vec![])));
        let mut table = ListenerTable::new();
        table.add(event_type::MESSAGE, rec.clone());
        assert!(table.listeners_for(event_type::LOG).is_empty());
    }
}
