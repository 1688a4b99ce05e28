//! The Experiment device.
//!
//! Receives events produced by the Experiment Process (`EVENT_TX` requests,
//! already in tuple form) and the hub's own LOG events. It is callback-driven:
//! whoever holds the sink pushes, nothing is polled.

use crate::backends::first_arg;
use crate::clock;
use crate::config::DeviceConfig;
use crate::constants::{device_type, event_type, event_type_by_name, DeviceCategory, EventTypeId};
use crate::device::{ConvertCtx, DeviceBackend, NativeEvent, NativeEventSink};
use crate::error::{ConfigurationError, DeviceBackendError, RegistrationError};
use crate::event::{fields, EventRecord, FieldType, BASE_FIELDS};
use crate::registry::{DeviceClass, EventClass};
use serde_json::{json, Value};

pub const CLASS_NAME: &str = "Experiment";

pub const DEFAULTS: &str = r#"
name = "experiment"
enable = true
save_events = true
stream_events = true
auto_report_events = true
event_buffer_length = 1024
device_number = 0
monitor_event_types = []
manufacturer_name = ""
model_name = ""

[extra]
"#;

pub fn message_event_class() -> Result<EventClass, RegistrationError> {
    EventClass::new(
        event_type::MESSAGE,
        "MessageEvent",
        fields(&[
            ("msg_offset", FieldType::F32),
            ("prefix", FieldType::Str(3)),
            ("text", FieldType::Str(128)),
        ]),
    )
}

pub fn log_event_class() -> Result<EventClass, RegistrationError> {
    EventClass::new(
        event_type::LOG,
        "LogEvent",
        fields(&[("log_level", FieldType::U8), ("text", FieldType::Str(128))]),
    )
}

pub fn event_classes() -> Result<Vec<EventClass>, RegistrationError> {
    Ok(vec![message_event_class()?, log_event_class()?])
}

pub fn device_class() -> DeviceClass {
    DeviceClass {
        class_name: CLASS_NAME,
        type_id: device_type::EXPERIMENT,
        category: DeviceCategory::Virtual,
        defaults: DEFAULTS,
        event_types: vec![event_type::MESSAGE, event_type::LOG],
        factory: |cfg| Ok(Box::new(ExperimentBackend::new(cfg)?)),
    }
}

pub struct ExperimentBackend {
    name: String,
    sink: Option<NativeEventSink>,
}

impl ExperimentBackend {
    pub fn new(cfg: &DeviceConfig) -> Result<Self, ConfigurationError> {
        Ok(Self {
            name: cfg.name.clone(),
            sink: None,
        })
    }

    fn call_error(&self, method: &str, message: impl Into<String>) -> DeviceBackendError {
        DeviceBackendError::Call {
            device: self.name.clone(),
            method: method.to_string(),
            message: message.into(),
        }
    }
}

/// Native object for a hub log line.
pub fn log_native(level: log::Level, text: &str, time: f64) -> Value {
    json!({ "event_type": "LOG", "log_level": level as u8, "text": text, "device_time": time })
}

/// Native object for a message.
pub fn message_native(text: &str, prefix: &str, offset: f64) -> Value {
    json!({ "event_type": "MESSAGE", "text": text, "prefix": prefix, "msg_offset": offset, "device_time": clock::now() })
}

impl DeviceBackend for ExperimentBackend {
    fn attach(&mut self, sink: NativeEventSink) {
        self.sink = Some(sink);
    }

    fn to_canonical(&self, raw: &NativeEvent, ctx: &ConvertCtx<'_>) -> Result<Option<EventRecord>, DeviceBackendError> {
        match &raw.data {
            // Tuple sent by the Experiment Process. Its device_time is on the
            // shared clock, so it becomes the hub time; delay is the transit time.
            Value::Array(tuple) => {
                let type_id = tuple
                    .get(4)
                    .and_then(Value::as_u64)
                    .and_then(|t| u8::try_from(t).ok())
                    .map(EventTypeId)
                    .ok_or_else(|| ctx.convert_error("event tuple has no type id"))?;
                let Some(schema) = ctx.schema(type_id) else {
                    return Ok(None);
                };
                if tuple.len() != schema.fields.len() {
                    return Err(ctx.convert_error(format!(
                        "expected {} fields for {}, got {}",
                        schema.fields.len(),
                        schema.name,
                        tuple.len()
                    )));
                }
                let mut ev = EventRecord::from_tuple(schema.clone(), tuple).map_err(|e| ctx.convert_error(e))?;
                ev.device_id = ctx.device.device_id;
                ev.logged_time = raw.logged_time;
                if ev.device_time <= 0.0 {
                    ev.device_time = raw.logged_time;
                }
                ev.delay = (raw.logged_time - ev.device_time).max(0.0) as f32;
                ev.hub_time = ev.device_time;
                Ok(Some(ev))
            }
            Value::Object(obj) => {
                let type_id = obj
                    .get("event_type")
                    .and_then(Value::as_str)
                    .and_then(event_type_by_name)
                    .ok_or_else(|| ctx.convert_error("native object has no known event_type"))?;
                let Some(mut ev) = ctx.event_from_object(type_id, raw, obj)? else {
                    return Ok(None);
                };
                if let Some(t) = obj.get("device_time").and_then(Value::as_f64) {
                    ev.hub_time = t;
                    ev.delay = (raw.logged_time - t).max(0.0) as f32;
                }
                Ok(Some(ev))
            }
            other => Err(ctx.convert_error(format!("unsupported native event {}", other))),
        }
    }

    fn rpc_methods(&self) -> &[&'static str] {
        &["pushNativeEvent", "sendMessage"]
    }

    fn call(&mut self, method: &str, args: &[Value], sink: &NativeEventSink) -> Result<Value, DeviceBackendError> {
        match method {
            "pushNativeEvent" => {
                let data = first_arg(&self.name, method, args)?;
                Ok(Value::Bool(sink.push(data.clone())))
            }
            "sendMessage" => {
                let text = first_arg(&self.name, method, args)?
                    .as_str()
                    .ok_or_else(|| self.call_error(method, "text must be a string"))?;
                let prefix = args.get(1).and_then(Value::as_str).unwrap_or("");
                let offset = args.get(2).and_then(Value::as_f64).unwrap_or(0.0);
                Ok(Value::Bool(sink.push(message_native(text, prefix, offset))))
            }
            _ => Err(self.call_error(method, "unknown method")),
        }
    }

    fn close(&mut self) -> Result<(), DeviceBackendError> {
        self.sink = None;
        Ok(())
    }
}

/// Build a MESSAGE tuple the way the Experiment Process sends it.
pub fn message_tuple(text: &str, prefix: &str, offset: f32, device_time: f64) -> Vec<Value> {
    let mut tuple: Vec<Value> = vec![json!(0); BASE_FIELDS.len()];
    tuple[4] = json!(event_type::MESSAGE.0);
    tuple[5] = json!(device_time);
    tuple[6] = json!(0.0);
    tuple[7] = json!(0.0);
    tuple[8] = json!(0.0);
    tuple[9] = json!(0.0);
    tuple.extend([json!(offset), json!(prefix), json!(text)]);
    tuple
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::{DeviceMeta, DeviceRecord};
    use std::collections::HashMap;
    use std::sync::Arc;

    fn ctx_parts() -> (DeviceRecord, HashMap<EventTypeId, Arc<crate::event::EventSchema>>) {
        let record = DeviceRecord {
            name: "experiment".into(),
            device_id: 0,
            device_number: 0,
            category: DeviceCategory::Virtual,
            type_id: device_type::EXPERIMENT,
            class_name: CLASS_NAME.into(),
            event_buffer_length: 16,
            meta: DeviceMeta::default(),
        };
        let schemas = event_classes()
            .unwrap()
            .into_iter()
            .map(|c| (c.type_id, c.schema))
            .collect();
        (record, schemas)
    }

    #[test]
    fn tuple_from_experiment_process_keeps_its_time() {
        let (record, schemas) = ctx_parts();
        let ctx = ConvertCtx::new(&record, &schemas);
        let backend = ExperimentBackend {
            name: "experiment".into(),
            sink: None,
        };
        let raw = NativeEvent {
            logged_time: 100.25,
            data: Value::Array(message_tuple("trial 1", "EXP", 0.0, 100.0)),
        };
        let ev = backend.to_canonical(&raw, &ctx).unwrap().unwrap();
        assert_eq!(ev.hub_time, 100.0);
        assert_eq!(ev.logged_time, 100.25);
        assert_eq!(ev.delay, 0.25);
        assert_eq!(ev.get("text").and_then(|v| v.as_str().map(String::from)), Some("trial 1".into()));
    }

    #[test]
    fn log_objects_become_log_events() {
        let (record, schemas) = ctx_parts();
        let ctx = ConvertCtx::new(&record, &schemas);
        let backend = ExperimentBackend {
            name: "experiment".into(),
            sink: None,
        };
        let raw = NativeEvent {
            logged_time: 5.0,
            data: log_native(log::Level::Warn, "careful", 4.0),
        };
        let ev = backend.to_canonical(&raw, &ctx).unwrap().unwrap();
        assert_eq!(ev.event_type, event_type::LOG);
        assert_eq!(ev.get("log_level").and_then(|v| v.as_u64()), Some(2));
        assert_eq!(ev.hub_time, 4.0);
    }
}
