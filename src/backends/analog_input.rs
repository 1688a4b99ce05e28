//! Multi-channel analog input device (polled).
//!
//! The acquisition driver feeds one scan per record, either as a bare array
//! of channel voltages `[0.1, 2.5, ...]` or as an object
//! `{ "channels": [...], "device_time": 12.5 }`. Channels beyond
//! `runtime_settings.channel_count` are reported as zero.

use crate::backends::{first_arg, Feed, Inbox};
use crate::config::DeviceConfig;
use crate::constants::{device_type, event_type, DeviceCategory};
use crate::device::{ConvertCtx, DeviceBackend, NativeEvent, NativeEventSink};
use crate::error::{ConfigurationError, DeviceBackendError, RegistrationError};
use crate::event::{EventRecord, FieldDef, FieldType, FieldValue};
use crate::registry::{DeviceClass, EventClass};
use serde_json::{json, Value};

pub const CLASS_NAME: &str = "AnalogInput";

pub const MAX_CHANNELS: usize = 8;

pub const DEFAULTS: &str = r#"
name = "analog_input"
enable = true
save_events = true
stream_events = true
auto_report_events = true
event_buffer_length = 1024
device_number = 0
monitor_event_types = []
manufacturer_name = ""
model_name = ""

[device_timer]
interval = 0.002

[runtime_settings]
channel_count = 8

[extra]
"#;

pub fn event_classes() -> Result<Vec<EventClass>, RegistrationError> {
    let channels = (0..MAX_CHANNELS)
        .map(|i| FieldDef::new(&format!("AI_{}", i), FieldType::F32))
        .collect();
    Ok(vec![EventClass::new(
        event_type::MULTI_CHANNEL_ANALOG_INPUT,
        "MultiChannelAnalogInputEvent",
        channels,
    )?])
}

pub fn device_class() -> DeviceClass {
    DeviceClass {
        class_name: CLASS_NAME,
        type_id: device_type::ANALOGINPUT,
        category: DeviceCategory::AnalogIo,
        defaults: DEFAULTS,
        event_types: vec![event_type::MULTI_CHANNEL_ANALOG_INPUT],
        factory: |cfg| Ok(Box::new(AnalogInputBackend::new(cfg)?)),
    }
}

pub struct AnalogInputBackend {
    name: String,
    channel_count: usize,
    inbox: Inbox,
}

impl AnalogInputBackend {
    pub fn new(cfg: &DeviceConfig) -> Result<Self, ConfigurationError> {
        let raw = cfg
            .settings
            .get("runtime_settings")
            .and_then(|rs| rs.get("channel_count"))
            .cloned()
            .unwrap_or(json!(MAX_CHANNELS));
        let count = raw.as_u64().ok_or_else(|| ConfigurationError::TypeMismatch {
            device: cfg.name.clone(),
            key: "runtime_settings.channel_count".into(),
            expected: "integer",
            given: raw.to_string(),
        })?;
        if !(1..=MAX_CHANNELS as u64).contains(&count) {
            return Err(ConfigurationError::OutOfRange {
                device: cfg.name.clone(),
                key: "runtime_settings.channel_count".into(),
                min: 1.0,
                max: MAX_CHANNELS as f64,
                given: count as f64,
            });
        }
        Ok(Self {
            name: cfg.name.clone(),
            channel_count: count as usize,
            inbox: Inbox::new(cfg.event_buffer_length),
        })
    }

    pub fn feed(&self) -> Feed {
        self.inbox.feed()
    }

    pub fn channel_count(&self) -> usize {
        self.channel_count
    }
}

impl DeviceBackend for AnalogInputBackend {
    fn attach(&mut self, sink: NativeEventSink) {
        self.inbox.attach(&sink);
    }

    fn poll(&mut self, sink: &NativeEventSink) -> Result<(), DeviceBackendError> {
        for scan in self.inbox.drain() {
            sink.push_at(scan.logged_time, scan.data);
        }
        Ok(())
    }

    fn to_canonical(&self, raw: &NativeEvent, ctx: &ConvertCtx<'_>) -> Result<Option<EventRecord>, DeviceBackendError> {
        let (channels, device_time) = match &raw.data {
            Value::Array(a) => (a, None),
            Value::Object(obj) => (
                obj.get("channels")
                    .and_then(Value::as_array)
                    .ok_or_else(|| ctx.convert_error("analog scan has no 'channels' array"))?,
                obj.get("device_time").and_then(Value::as_f64),
            ),
            other => return Err(ctx.convert_error(format!("unsupported analog scan {}", other))),
        };
        let mut values = Vec::with_capacity(MAX_CHANNELS);
        for i in 0..MAX_CHANNELS {
            let v = match channels.get(i) {
                Some(v) if i < self.channel_count => v
                    .as_f64()
                    .ok_or_else(|| ctx.convert_error(format!("AI_{} is not a number", i)))?,
                _ => 0.0,
            };
            values.push(FieldValue::Float(v as f32 as f64));
        }
        let Some(mut ev) = ctx.event(event_type::MULTI_CHANNEL_ANALOG_INPUT, raw, values)? else {
            return Ok(None);
        };
        if let Some(t) = device_time {
            ev.device_time = t;
        }
        Ok(Some(ev))
    }

    fn rpc_methods(&self) -> &[&'static str] {
        &["pushNativeEvent", "getChannelCount"]
    }

    fn call(&mut self, method: &str, args: &[Value], _sink: &NativeEventSink) -> Result<Value, DeviceBackendError> {
        match method {
            "getChannelCount" => Ok(json!(self.channel_count)),
            _ => {
                let scan = first_arg(&self.name, method, args)?.clone();
                Ok(Value::Bool(self.inbox.feed().send(scan)))
            }
        }
    }

    fn close(&mut self) -> Result<(), DeviceBackendError> {
        self.inbox.close();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::parse_defaults;

    fn config(user: Value) -> Result<DeviceConfig, ConfigurationError> {
        DeviceConfig::resolve(CLASS_NAME, &parse_defaults(CLASS_NAME, DEFAULTS)?, &user)
    }

    #[test]
    fn channel_count_is_validated() {
        let cfg = config(json!({ "runtime_settings": { "channel_count": 9 } })).unwrap();
        assert!(matches!(
            AnalogInputBackend::new(&cfg),
            Err(ConfigurationError::OutOfRange { .. })
        ));
        let cfg = config(json!({ "runtime_settings": { "channel_count": 3 } })).unwrap();
        assert_eq!(AnalogInputBackend::new(&cfg).unwrap().channel_count(), 3);
    }

    #[test]
    fn unused_channels_read_zero() {
        let registry = crate::registry::Registry::builtin().unwrap();
        let class = registry.device_class(CLASS_NAME).unwrap();
        let cfg = config(json!({ "runtime_settings": { "channel_count": 2 } })).unwrap();
        let record = crate::record::DeviceRecord {
            name: cfg.name.clone(),
            device_id: 5,
            device_number: 0,
            category: class.category,
            type_id: class.type_id,
            class_name: CLASS_NAME.into(),
            event_buffer_length: cfg.event_buffer_length,
            meta: cfg.meta.clone(),
        };
        let schemas = registry.schemas_for(class, &[]).unwrap();
        let backend = AnalogInputBackend::new(&cfg).unwrap();
        let ctx = ConvertCtx::new(&record, &schemas);

        let raw = NativeEvent {
            logged_time: 2.0,
            data: json!({ "channels": [1.5, -0.5, 3.0], "device_time": 1.75 }),
        };
        let ev = backend.to_canonical(&raw, &ctx).unwrap().unwrap();
        assert_eq!(ev.get("AI_0").and_then(|v| v.as_f64()), Some(1.5));
        assert_eq!(ev.get("AI_1").and_then(|v| v.as_f64()), Some(-0.5));
        assert_eq!(ev.get("AI_2").and_then(|v| v.as_f64()), Some(0.0));
        assert_eq!(ev.device_time, 1.75);

        let raw = NativeEvent {
            logged_time: 2.0,
            data: json!([0.25]),
        };
        let ev = backend.to_canonical(&raw, &ctx).unwrap().unwrap();
        assert_eq!(ev.get("AI_0").and_then(|v| v.as_f64()), Some(0.25));
        assert_eq!(ev.get("AI_7").and_then(|v| v.as_f64()), Some(0.0));
    }
}
