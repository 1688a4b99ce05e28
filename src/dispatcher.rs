//! Event dispatch.
//!
//! One dispatcher tick walks the devices in registration order and for each:
//!
//! 1. takes a snapshot of its native queue (clearing it);
//! 2. converts every native event, silently dropping suppressed ones;
//! 3. stamps the prefix (event id, experiment and session ids);
//! 4. hands the event to the device's listeners for that type.
//!
//! Event ids are assigned here, after conversion, so suppressed native events
//! do not leave gaps. Per-device native order is preserved; cross-device order
//! is only established when the global buffer is read ([`GlobalEventBuffer::take_sorted`]).

use crate::device::DeviceList;
use crate::error::{DeviceBackendError, ListenerError};
use crate::event::EventRecord;
use crate::eventbus::EventListener;
use crate::scheduler::ScheduledUnit;
use crate::session::SessionState;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

/// Bounded hub-wide buffer served by `GET_EVENTS`. Oldest events drop on overflow.
pub struct GlobalEventBuffer {
    events: Mutex<VecDeque<EventRecord>>,
    capacity: usize,
}

impl GlobalEventBuffer {
    pub fn new(capacity: usize) -> Self {
        Self {
            events: Mutex::new(VecDeque::with_capacity(capacity.min(4096))),
            capacity: capacity.max(1),
        }
    }

    fn lock(&self) -> MutexGuard<'_, VecDeque<EventRecord>> {
        self.events.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Snapshot-then-clear, sorted by `(hub_time, event_id)`.
    pub fn take_sorted(&self) -> Vec<EventRecord> {
        let mut events: Vec<EventRecord> = self.lock().drain(..).collect();
        events.sort_by(|a, b| {
            a.hub_time
                .total_cmp(&b.hub_time)
                .then(a.event_id.cmp(&b.event_id))
        });
        events
    }

    pub fn clear(&self) {
        self.lock().clear();
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

impl EventListener for GlobalEventBuffer {
    fn name(&self) -> &str {
        "global-buffer"
    }

    fn handle(&self, event: &EventRecord) -> Result<(), ListenerError> {
        let mut events = self.lock();
        if events.len() == self.capacity {
            events.pop_front();
        }
        events.push_back(event.clone());
        Ok(())
    }
}

/// Converts and fans out native events.
#[derive(Clone)]
pub struct Dispatcher {
    devices: DeviceList,
    session: Arc<SessionState>,
    interval: Duration,
}

impl Dispatcher {
    pub fn new(devices: DeviceList, session: Arc<SessionState>, interval: Duration) -> Self {
        Self {
            devices,
            session,
            interval,
        }
    }

    /// Run one dispatch pass. Returns the number of events delivered.
    pub fn tick(&self) -> usize {
        let devices: Vec<_> = self
            .devices
            .read()
            .map(|d| d.clone())
            .unwrap_or_else(|e| e.into_inner().clone());

        let mut delivered = 0;
        for device in devices {
            for raw in device.drain_native() {
                match device.to_canonical(&raw) {
                    Ok(Some(mut event)) => {
                        event.event_id = self.session.next_event_id();
                        event.experiment_id = self.session.experiment_id();
                        event.session_id = self.session.session_id();
                        device.notify(&event);
                        delivered += 1;
                    }
                    Ok(None) => {}
                    Err(e) => log::warn!("{}", e),
                }
            }
        }
        delivered
    }
}

impl ScheduledUnit for Dispatcher {
    fn name(&self) -> &str {
        "dispatcher"
    }

    fn interval(&self) -> Duration {
        self.interval
    }

    fn tick(&mut self) -> Result<(), DeviceBackendError> {
        Dispatcher::tick(self);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::constants::event_type;
    use crate::event::EventSchema;

    fn at(hub_time: f64, id: u64) -> EventRecord {
        let schema = Arc::new(EventSchema::compose(event_type::LOG, "LogEvent", vec![]));
        let mut ev = EventRecord::new(schema, vec![]).unwrap();
        ev.hub_time = hub_time;
        ev.event_id = id;
        ev
    }

    #[test]
    fn global_buffer_sorts_by_hub_time() {
        let buf = GlobalEventBuffer::new(8);
        for (t, id) in [(5.0, 1), (1.0, 2), (3.0, 3)] {
            buf.handle(&at(t, id)).unwrap();
        }
        let times: Vec<f64> = buf.take_sorted().iter().map(|e| e.hub_time).collect();
        assert_eq!(times, vec![1.0, 3.0, 5.0]);
        assert!(buf.is_empty());
    }

    #[test]
    fn equal_times_fall_back_to_event_id() {
        let buf = GlobalEventBuffer::new(8);
        buf.handle(&at(2.0, 9)).unwrap();
        buf.handle(&at(2.0, 4)).unwrap();
        let ids: Vec<u64> = buf.take_sorted().iter().map(|e| e.event_id).collect();
        assert_eq!(ids, vec![4, 9]);
    }

    #[test]
    fn global_buffer_drops_oldest() {
        let buf = GlobalEventBuffer::new(2);
        for id in 1..=3 {
            buf.handle(&at(id as f64, id)).unwrap();
        }
        let ids: Vec<u64> = buf.take_sorted().iter().map(|e| e.event_id).collect();
        assert_eq!(ids, vec![2, 3]);
    }
}
