//! Mouse device (callback-driven).
//!
//! Native records from the pointer hook:
//!
//! ```json
//! { "event": "move",   "x": 10.0, "y": -4.0 }
//! { "event": "press",  "button": 1, "x": 10.0, "y": -4.0 }
//! { "event": "scroll", "wheel": -1 }
//! ```
//!
//! The backend tracks which buttons are held and stamps the bitmask into
//! each record as `button_state` before it reaches the sink, so a move with
//! any button held converts to MOUSE_DRAG.

use crate::backends::{first_arg, Feed, Inbox};
use crate::config::DeviceConfig;
use crate::constants::{device_type, event_type, DeviceCategory, EventTypeId};
use crate::device::{ConvertCtx, DeviceBackend, NativeEvent, NativeEventSink};
use crate::error::{ConfigurationError, DeviceBackendError, RegistrationError};
use crate::event::{fields, EventRecord, FieldDef, FieldType};
use crate::registry::{DeviceClass, EventClass};
use crate::scheduler::{MessagePump, ScheduledUnit};
use serde_json::{Map, Value};
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

pub const CLASS_NAME: &str = "Mouse";

pub const DEFAULTS: &str = r#"
name = "mouse"
enable = true
save_events = true
stream_events = true
auto_report_events = true
event_buffer_length = 512
device_number = 0
monitor_event_types = []
manufacturer_name = ""
model_name = ""

[extra]
"#;

pub const PUMP_INTERVAL: Duration = Duration::from_millis(1);

pub const LEFT_BUTTON: u8 = 1;
pub const RIGHT_BUTTON: u8 = 2;
pub const MIDDLE_BUTTON: u8 = 4;

fn mouse_fields() -> Vec<FieldDef> {
    fields(&[
        ("button_state", FieldType::U8),
        ("button_id", FieldType::U8),
        ("x_position", FieldType::F64),
        ("y_position", FieldType::F64),
        ("wheel", FieldType::I32),
        ("window_id", FieldType::U64),
    ])
}

const MOUSE_EVENTS: [(EventTypeId, &str); 5] = [
    (event_type::MOUSE_MOVE, "MouseMoveEvent"),
    (event_type::MOUSE_DRAG, "MouseDragEvent"),
    (event_type::MOUSE_BUTTON_PRESS, "MouseButtonPressEvent"),
    (event_type::MOUSE_BUTTON_RELEASE, "MouseButtonReleaseEvent"),
    (event_type::MOUSE_SCROLL, "MouseScrollEvent"),
];

pub fn event_classes() -> Result<Vec<EventClass>, RegistrationError> {
    MOUSE_EVENTS
        .iter()
        .map(|(t, name)| EventClass::new(*t, name, mouse_fields()))
        .collect()
}

pub fn device_class() -> DeviceClass {
    DeviceClass {
        class_name: CLASS_NAME,
        type_id: device_type::MOUSE,
        category: DeviceCategory::Input,
        defaults: DEFAULTS,
        event_types: MOUSE_EVENTS.iter().map(|(t, _)| *t).collect(),
        factory: |cfg| Ok(Box::new(MouseBackend::new(cfg)?)),
    }
}

/// Stamp the held-button mask into `data`, updating it for press/release.
fn track_buttons(held: &AtomicU8, mut data: Value) -> Value {
    if let Some(obj) = data.as_object_mut() {
        let button = obj.get("button").and_then(Value::as_u64).unwrap_or(0) as u8;
        let state = match obj.get("event").and_then(Value::as_str) {
            Some("press") => held.fetch_or(button, Ordering::AcqRel) | button,
            Some("release") => held.fetch_and(!button, Ordering::AcqRel) & !button,
            _ => held.load(Ordering::Acquire),
        };
        obj.insert("button_state".into(), Value::from(state));
    }
    data
}

pub struct MouseBackend {
    name: String,
    inbox: Inbox,
    held: Arc<AtomicU8>,
    sink: Option<NativeEventSink>,
}

impl MouseBackend {
    pub fn new(cfg: &DeviceConfig) -> Result<Self, ConfigurationError> {
        Ok(Self {
            name: cfg.name.clone(),
            inbox: Inbox::new(cfg.event_buffer_length),
            held: Arc::new(AtomicU8::new(0)),
            sink: None,
        })
    }

    pub fn feed(&self) -> Feed {
        self.inbox.feed()
    }
}

fn canonical_fields(obj: &Map<String, Value>) -> Map<String, Value> {
    let mut out = obj.clone();
    if let Some(x) = obj.get("x") {
        out.insert("x_position".into(), x.clone());
    }
    if let Some(y) = obj.get("y") {
        out.insert("y_position".into(), y.clone());
    }
    if let Some(b) = obj.get("button") {
        out.insert("button_id".into(), b.clone());
    }
    out
}

impl DeviceBackend for MouseBackend {
    fn attach(&mut self, sink: NativeEventSink) {
        self.inbox.attach(&sink);
        self.sink = Some(sink);
    }

    fn to_canonical(&self, raw: &NativeEvent, ctx: &ConvertCtx<'_>) -> Result<Option<EventRecord>, DeviceBackendError> {
        let obj = raw
            .data
            .as_object()
            .ok_or_else(|| ctx.convert_error("mouse event must be an object"))?;
        let held = obj.get("button_state").and_then(Value::as_u64).unwrap_or(0);
        let kind = match obj.get("event").and_then(Value::as_str) {
            Some("move") if held != 0 => event_type::MOUSE_DRAG,
            Some("move") => event_type::MOUSE_MOVE,
            Some("press") => event_type::MOUSE_BUTTON_PRESS,
            Some("release") => event_type::MOUSE_BUTTON_RELEASE,
            Some("scroll") => event_type::MOUSE_SCROLL,
            _ => return Ok(None),
        };
        ctx.event_from_object(kind, raw, &canonical_fields(obj))
    }

    fn rpc_methods(&self) -> &[&'static str] {
        &["pushNativeEvent", "getHeldButtons"]
    }

    fn call(&mut self, method: &str, args: &[Value], sink: &NativeEventSink) -> Result<Value, DeviceBackendError> {
        match method {
            "getHeldButtons" => Ok(Value::from(self.held.load(Ordering::Acquire))),
            _ => {
                let data = first_arg(&self.name, method, args)?.clone();
                Ok(Value::Bool(sink.push(track_buttons(&self.held, data))))
            }
        }
    }

    fn message_pump(&mut self) -> Option<Box<dyn ScheduledUnit>> {
        let sink = self.sink.clone()?;
        let inbox = self.inbox.clone();
        let held = self.held.clone();
        Some(Box::new(MessagePump::new(
            format!("pump:{}", self.name),
            PUMP_INTERVAL,
            move || {
                for ev in inbox.drain() {
                    sink.push_at(ev.logged_time, track_buttons(&held, ev.data));
                }
                Ok(())
            },
        )))
    }

    fn close(&mut self) -> Result<(), DeviceBackendError> {
        self.inbox.close();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::{DeviceMeta, DeviceRecord};
    use serde_json::json;
    use std::collections::HashMap;

    #[test]
    fn move_with_button_held_is_a_drag() {
        let held = AtomicU8::new(0);
        let press = track_buttons(&held, json!({ "event": "press", "button": LEFT_BUTTON }));
        let drag = track_buttons(&held, json!({ "event": "move", "x": 3.0, "y": 4.0 }));
        let release = track_buttons(&held, json!({ "event": "release", "button": LEFT_BUTTON }));
        let mv = track_buttons(&held, json!({ "event": "move", "x": 5.0, "y": 4.0 }));
        assert_eq!(press["button_state"], 1);
        assert_eq!(release["button_state"], 0);

        let record = DeviceRecord {
            name: "mouse".into(),
            device_id: 2,
            device_number: 0,
            category: DeviceCategory::Input,
            type_id: device_type::MOUSE,
            class_name: CLASS_NAME.into(),
            event_buffer_length: 16,
            meta: DeviceMeta::default(),
        };
        let schemas: HashMap<_, _> = event_classes()
            .unwrap()
            .into_iter()
            .map(|c| (c.type_id, c.schema))
            .collect();
        let ctx = ConvertCtx::new(&record, &schemas);
        let backend = MouseBackend {
            name: "mouse".into(),
            inbox: Inbox::new(16),
            held: Arc::new(AtomicU8::new(0)),
            sink: None,
        };
        let kinds: Vec<EventTypeId> = [press, drag, release, mv]
            .into_iter()
            .map(|data| {
                let raw = NativeEvent { logged_time: 0.0, data };
                backend.to_canonical(&raw, &ctx).unwrap().unwrap().event_type
            })
            .collect();
        assert_eq!(
            kinds,
            vec![
                event_type::MOUSE_BUTTON_PRESS,
                event_type::MOUSE_DRAG,
                event_type::MOUSE_BUTTON_RELEASE,
                event_type::MOUSE_MOVE
            ]
        );
    }
}
