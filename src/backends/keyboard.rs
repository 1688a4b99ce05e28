//! Keyboard device (callback-driven).
//!
//! Native records are JSON objects produced by a keyboard hook:
//!
//! ```json
//! { "event": "press", "scan_code": 30, "key_id": 65, "ascii_code": 97,
//!   "key": "a", "modifiers": "LSHIFT", "window_id": 0 }
//! ```
//!
//! `event` is `"press"` or `"release"`. Hooks send them through the
//! backend's [`Feed`]; the message pump moves them into the device sink.

use crate::backends::{first_arg, Feed, Inbox};
use crate::config::DeviceConfig;
use crate::constants::{device_type, event_type, DeviceCategory};
use crate::device::{ConvertCtx, DeviceBackend, NativeEvent, NativeEventSink};
use crate::error::{ConfigurationError, DeviceBackendError, RegistrationError};
use crate::event::{fields, EventRecord, FieldDef, FieldType};
use crate::registry::{DeviceClass, EventClass};
use crate::scheduler::{MessagePump, ScheduledUnit};
use serde_json::Value;
use std::time::Duration;

pub const CLASS_NAME: &str = "Keyboard";

pub const DEFAULTS: &str = r#"
name = "keyboard"
enable = true
save_events = true
stream_events = true
auto_report_events = true
event_buffer_length = 256
device_number = 0
monitor_event_types = []
manufacturer_name = ""
model_name = ""

[extra]
"#;

/// Period of the hook message pump.
pub const PUMP_INTERVAL: Duration = Duration::from_millis(1);

fn key_fields() -> Vec<FieldDef> {
    fields(&[
        ("scan_code", FieldType::U32),
        ("key_id", FieldType::U32),
        ("ascii_code", FieldType::U32),
        ("key", FieldType::Str(12)),
        ("modifiers", FieldType::Str(80)),
        ("window_id", FieldType::U64),
    ])
}

pub fn event_classes() -> Result<Vec<EventClass>, RegistrationError> {
    Ok(vec![
        EventClass::new(event_type::KEYBOARD_PRESS, "KeyboardPressEvent", key_fields())?,
        EventClass::new(event_type::KEYBOARD_RELEASE, "KeyboardReleaseEvent", key_fields())?,
    ])
}

pub fn device_class() -> DeviceClass {
    DeviceClass {
        class_name: CLASS_NAME,
        type_id: device_type::KEYBOARD,
        category: DeviceCategory::Input,
        defaults: DEFAULTS,
        event_types: vec![event_type::KEYBOARD_PRESS, event_type::KEYBOARD_RELEASE],
        factory: |cfg| Ok(Box::new(KeyboardBackend::new(cfg)?)),
    }
}

pub struct KeyboardBackend {
    name: String,
    inbox: Inbox,
    sink: Option<NativeEventSink>,
}

impl KeyboardBackend {
    pub fn new(cfg: &DeviceConfig) -> Result<Self, ConfigurationError> {
        Ok(Self {
            name: cfg.name.clone(),
            inbox: Inbox::new(cfg.event_buffer_length),
            sink: None,
        })
    }

    /// Handle for the keyboard hook.
    pub fn feed(&self) -> Feed {
        self.inbox.feed()
    }
}

impl DeviceBackend for KeyboardBackend {
    fn attach(&mut self, sink: NativeEventSink) {
        self.inbox.attach(&sink);
        self.sink = Some(sink);
    }

    fn to_canonical(&self, raw: &NativeEvent, ctx: &ConvertCtx<'_>) -> Result<Option<EventRecord>, DeviceBackendError> {
        let obj = raw
            .data
            .as_object()
            .ok_or_else(|| ctx.convert_error("keyboard event must be an object"))?;
        let kind = match obj.get("event").and_then(Value::as_str) {
            Some("press") => event_type::KEYBOARD_PRESS,
            Some("release") => event_type::KEYBOARD_RELEASE,
            other => {
                log::trace!("keyboard '{}' ignored event {:?}", ctx.device.name, other);
                return Ok(None);
            }
        };
        ctx.event_from_object(kind, raw, obj)
    }

    fn rpc_methods(&self) -> &[&'static str] {
        &["pushNativeEvent"]
    }

    fn call(&mut self, method: &str, args: &[Value], sink: &NativeEventSink) -> Result<Value, DeviceBackendError> {
        let data = first_arg(&self.name, method, args)?;
        Ok(Value::Bool(sink.push(data.clone())))
    }

    fn message_pump(&mut self) -> Option<Box<dyn ScheduledUnit>> {
        let sink = self.sink.clone()?;
        let inbox = self.inbox.clone();
        Some(Box::new(MessagePump::new(
            format!("pump:{}", self.name),
            PUMP_INTERVAL,
            move || {
                for ev in inbox.drain() {
                    sink.push_at(ev.logged_time, ev.data);
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
    fn press_and_release_map_to_types() {
        let record = DeviceRecord {
            name: "keyboard".into(),
            device_id: 1,
            device_number: 0,
            category: DeviceCategory::Input,
            type_id: device_type::KEYBOARD,
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
        let cfg = DeviceConfig::resolve(CLASS_NAME, &crate::config::parse_defaults(CLASS_NAME, DEFAULTS).unwrap(), &json!({}))
            .unwrap();
        let kb = KeyboardBackend::new(&cfg).unwrap();

        let raw = NativeEvent {
            logged_time: 1.0,
            data: json!({ "event": "press", "key": "a", "scan_code": 30 }),
        };
        let ev = kb.to_canonical(&raw, &ctx).unwrap().unwrap();
        assert_eq!(ev.event_type, event_type::KEYBOARD_PRESS);
        assert_eq!(ev.get("scan_code").and_then(|v| v.as_u64()), Some(30));

        let raw = NativeEvent {
            logged_time: 1.0,
            data: json!({ "event": "repeat" }),
        };
        assert!(kb.to_canonical(&raw, &ctx).unwrap().is_none());
    }
}
