//! Built-in device classes.
//!
//! Every backend here is software-fed: its native source is an inbox that an
//! OS hook, an SDK thread, a test, or the `pushNativeEvent` device RPC fills
//! through a [`Feed`]. Polled classes drain their inbox in `poll`; callback
//! classes run a message pump that moves inbox entries into the device's sink.
//!
//! The inbox holds at most `event_buffer_length` records and drops the oldest
//! on overflow. A record is stamped when it is fed, and refused while the
//! device is not reporting or after it is closed.
//!
//! | class         | kind     | events |
//! |---------------|----------|--------|
//! | `Experiment`  | callback | MESSAGE, LOG |
//! | `Keyboard`    | callback | KEYBOARD_PRESS, KEYBOARD_RELEASE |
//! | `Mouse`       | callback | MOUSE_MOVE, MOUSE_DRAG, MOUSE_BUTTON_PRESS, MOUSE_BUTTON_RELEASE, MOUSE_SCROLL |
//! | `EyeTracker`  | polled   | eye samples, fixations, saccades, blinks |
//! | `GamePad`     | polled   | GAMEPAD_STATE_CHANGE, GAMEPAD_DISCONNECT |
//! | `AnalogInput` | polled   | MULTI_CHANNEL_ANALOG_INPUT |

use crate::clock;
use crate::device::{NativeEvent, NativeEventQueue, NativeEventSink};
use crate::error::RegistrationError;
use crate::registry::Registry;
use once_cell::sync::OnceCell;
use serde_json::Value;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

pub mod analog_input;
pub mod experiment;
pub mod eyetracker;
pub mod gamepad;
pub mod keyboard;
pub mod mouse;

/// Register every built-in event and device class.
pub fn register_builtins(reg: &mut Registry) -> Result<(), RegistrationError> {
    for ev in experiment::event_classes()?
        .into_iter()
        .chain(keyboard::event_classes()?)
        .chain(mouse::event_classes()?)
        .chain(eyetracker::event_classes()?)
        .chain(gamepad::event_classes()?)
        .chain(analog_input::event_classes()?)
    {
        reg.register_event(ev)?;
    }
    reg.register_device(experiment::device_class())?;
    reg.register_device(keyboard::device_class())?;
    reg.register_device(mouse::device_class())?;
    reg.register_device(eyetracker::device_class())?;
    reg.register_device(gamepad::device_class())?;
    reg.register_device(analog_input::device_class())?;
    Ok(())
}

struct InboxShared {
    queue: NativeEventQueue,
    /// The owning device's sink, once attached; its reporting switch gates intake.
    gate: OnceCell<NativeEventSink>,
    closed: AtomicBool,
}

impl InboxShared {
    fn offer(&self, logged_time: f64, data: Value) -> bool {
        if self.closed.load(Ordering::Acquire) {
            return false;
        }
        if !self.gate.get().map_or(true, NativeEventSink::is_reporting) {
            return false;
        }
        self.queue.push(NativeEvent { logged_time, data });
        true
    }
}

/// Sending half of a backend inbox. Cheap to clone and safe on any thread.
#[derive(Clone)]
pub struct Feed {
    shared: Arc<InboxShared>,
}

impl Feed {
    /// Stamp and queue one native record. Returns `false` while the device is
    /// not reporting and once it is closed.
    pub fn send(&self, data: Value) -> bool {
        self.shared.offer(clock::now(), data)
    }
}

/// Bounded native inbox owned by a backend.
#[derive(Clone)]
pub(crate) struct Inbox {
    shared: Arc<InboxShared>,
}

impl Inbox {
    pub(crate) fn new(capacity: usize) -> Self {
        Self {
            shared: Arc::new(InboxShared {
                queue: NativeEventQueue::new(capacity),
                gate: OnceCell::new(),
                closed: AtomicBool::new(false),
            }),
        }
    }

    pub(crate) fn feed(&self) -> Feed {
        Feed {
            shared: self.shared.clone(),
        }
    }

    /// Gate intake on the device's reporting switch.
    pub(crate) fn attach(&self, sink: &NativeEventSink) {
        if self.shared.gate.set(sink.clone()).is_err() {
            log::debug!("inbox already attached");
        }
    }

    /// Everything queued so far, oldest first.
    pub(crate) fn drain(&self) -> Vec<NativeEvent> {
        self.shared.queue.drain()
    }

    /// Refuse further records and discard queued ones.
    pub(crate) fn close(&self) {
        self.shared.closed.store(true, Ordering::Release);
        self.shared.queue.clear();
        let dropped = self.shared.queue.dropped();
        if dropped > 0 {
            log::debug!("inbox dropped {} records on overflow", dropped);
        }
    }
}

/// First RPC argument, or a call error naming `method`.
pub(crate) fn first_arg<'a>(
    device: &str,
    method: &str,
    args: &'a [Value],
) -> Result<&'a Value, crate::error::DeviceBackendError> {
    args.first().ok_or_else(|| crate::error::DeviceBackendError::Call {
        device: device.to_string(),
        method: method.to_string(),
        message: "missing argument".to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn inbox_keeps_the_newest_records() {
        let inbox = Inbox::new(3);
        let feed = inbox.feed();
        for i in 0..5 {
            assert!(feed.send(json!(i)));
        }
        let kept: Vec<Value> = inbox.drain().into_iter().map(|e| e.data).collect();
        assert_eq!(kept, vec![json!(2), json!(3), json!(4)]);
    }

    #[test]
    fn records_are_stamped_when_fed() {
        let inbox = Inbox::new(4);
        let before = clock::now();
        inbox.feed().send(json!("a"));
        let after = clock::now();
        let t = inbox.drain()[0].logged_time;
        assert!(before <= t && t <= after);
    }

    #[test]
    fn closed_inbox_refuses_and_forgets() {
        let inbox = Inbox::new(4);
        let feed = inbox.feed();
        feed.send(json!(1));
        inbox.close();
        assert!(!feed.send(json!(2)));
        assert!(inbox.drain().is_empty());
    }
}
