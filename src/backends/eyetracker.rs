//! Eye tracker device (polled).
//!
//! The tracker SDK (or a test) sends native records into the backend's
//! [`Feed`]; every poll moves them into the device sink while recording is
//! enabled. Record shapes:
//!
//! - samples: `{"event": "sample", "gaze_x": .., "gaze_y": .., ..}` for one eye,
//!   or with `left_*` / `right_*` keys for both;
//! - parsed events: `{"event": "FIXATION_START", "eye": 0, ..}` using the
//!   event type name. Keys are the canonical field names.

use crate::backends::{first_arg, Feed, Inbox};
use crate::config::DeviceConfig;
use crate::constants::{device_type, event_type, event_type_by_name, DeviceCategory, EventTypeId};
use crate::device::{ConvertCtx, DeviceBackend, NativeEvent, NativeEventSink};
use crate::error::{ConfigurationError, DeviceBackendError, RegistrationError};
use crate::event::{fields, EventRecord, FieldType};
use crate::registry::{DeviceClass, EventClass};
use serde_json::{json, Value};

pub const CLASS_NAME: &str = "EyeTracker";

pub const DEFAULTS: &str = r#"
name = "tracker"
enable = true
save_events = true
stream_events = true
auto_report_events = true
event_buffer_length = 1024
device_number = 0
monitor_event_types = []
manufacturer_name = ""
model_name = ""
serial_number = ""

[device_timer]
interval = 0.001

[runtime_settings]
sampling_rate = 250
track_eyes = "BINOCULAR"

[extra]
"#;

pub const LEFT_EYE: u64 = 0;
pub const RIGHT_EYE: u64 = 1;

const F: FieldType = FieldType::F32;

pub fn event_classes() -> Result<Vec<EventClass>, RegistrationError> {
    let eye_side = |p: &str| -> Vec<(String, FieldType)> {
        [
            "gaze_x",
            "gaze_y",
            "gaze_z",
            "raw_x",
            "raw_y",
            "pupil_measure1",
            "ppd_x",
            "ppd_y",
            "velocity_x",
            "velocity_y",
            "velocity_xy",
        ]
        .iter()
        .map(|f| (format!("{}{}", p, f), F))
        .collect()
    };
    let owned = |list: Vec<(String, FieldType)>| {
        list.into_iter()
            .map(|(n, t)| crate::event::FieldDef::new(&n, t))
            .collect::<Vec<_>>()
    };

    let mut mono = vec![("eye".to_string(), FieldType::U8)];
    mono.extend(eye_side(""));
    mono.extend([("angle_x".to_string(), F), ("angle_y".to_string(), F), ("pupil_measure2".to_string(), F)]);
    mono.push(("status".to_string(), FieldType::U8));

    let mut bino = eye_side("left_");
    bino.extend(eye_side("right_"));
    bino.push(("status".to_string(), FieldType::U8));

    Ok(vec![
        EventClass::new(event_type::MONOCULAR_EYE_SAMPLE, "MonocularEyeSampleEvent", owned(mono))?,
        EventClass::new(event_type::BINOCULAR_EYE_SAMPLE, "BinocularEyeSampleEvent", owned(bino))?,
        EventClass::new(
            event_type::FIXATION_START,
            "FixationStartEvent",
            fields(&[("eye", FieldType::U8), ("gaze_x", F), ("gaze_y", F), ("pupil_measure1", F)]),
        )?,
        EventClass::new(
            event_type::FIXATION_END,
            "FixationEndEvent",
            fields(&[
                ("eye", FieldType::U8),
                ("duration", F),
                ("start_gaze_x", F),
                ("start_gaze_y", F),
                ("end_gaze_x", F),
                ("end_gaze_y", F),
                ("average_gaze_x", F),
                ("average_gaze_y", F),
                ("average_pupil_measure1", F),
            ]),
        )?,
        EventClass::new(
            event_type::SACCADE_START,
            "SaccadeStartEvent",
            fields(&[("eye", FieldType::U8), ("gaze_x", F), ("gaze_y", F)]),
        )?,
        EventClass::new(
            event_type::SACCADE_END,
            "SaccadeEndEvent",
            fields(&[
                ("eye", FieldType::U8),
                ("duration", F),
                ("start_gaze_x", F),
                ("start_gaze_y", F),
                ("end_gaze_x", F),
                ("end_gaze_y", F),
                ("amplitude_x", F),
                ("amplitude_y", F),
                ("peak_velocity", F),
            ]),
        )?,
        EventClass::new(event_type::BLINK_START, "BlinkStartEvent", fields(&[("eye", FieldType::U8)]))?,
        EventClass::new(
            event_type::BLINK_END,
            "BlinkEndEvent",
            fields(&[("eye", FieldType::U8), ("duration", F)]),
        )?,
    ])
}

pub fn device_class() -> DeviceClass {
    DeviceClass {
        class_name: CLASS_NAME,
        type_id: device_type::EYETRACKER,
        category: DeviceCategory::EyeTracking,
        defaults: DEFAULTS,
        event_types: vec![
            event_type::MONOCULAR_EYE_SAMPLE,
            event_type::BINOCULAR_EYE_SAMPLE,
            event_type::FIXATION_START,
            event_type::FIXATION_END,
            event_type::SACCADE_START,
            event_type::SACCADE_END,
            event_type::BLINK_START,
            event_type::BLINK_END,
        ],
        factory: |cfg| Ok(Box::new(EyeTrackerBackend::new(cfg)?)),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackEyes {
    Left,
    Right,
    Binocular,
}

pub struct EyeTrackerBackend {
    name: String,
    inbox: Inbox,
    track_eyes: TrackEyes,
    sampling_rate: f64,
    recording: bool,
    last_sample: Option<Value>,
}

impl EyeTrackerBackend {
    pub fn new(cfg: &DeviceConfig) -> Result<Self, ConfigurationError> {
        let rs = cfg.settings.get("runtime_settings");
        let track_eyes = match rs.and_then(|r| r.get("track_eyes")).and_then(Value::as_str) {
            Some("LEFT_EYE") => TrackEyes::Left,
            Some("RIGHT_EYE") => TrackEyes::Right,
            Some("BINOCULAR") | None => TrackEyes::Binocular,
            Some(other) => {
                return Err(ConfigurationError::TypeMismatch {
                    device: cfg.name.clone(),
                    key: "runtime_settings.track_eyes".into(),
                    expected: "LEFT_EYE, RIGHT_EYE or BINOCULAR",
                    given: other.to_string(),
                })
            }
        };
        let sampling_rate = rs
            .and_then(|r| r.get("sampling_rate"))
            .and_then(Value::as_f64)
            .unwrap_or(250.0);
        if !(1.0..=10_000.0).contains(&sampling_rate) {
            return Err(ConfigurationError::OutOfRange {
                device: cfg.name.clone(),
                key: "runtime_settings.sampling_rate".into(),
                min: 1.0,
                max: 10_000.0,
                given: sampling_rate,
            });
        }
        Ok(Self {
            name: cfg.name.clone(),
            inbox: Inbox::new(cfg.event_buffer_length),
            track_eyes,
            sampling_rate,
            recording: true,
            last_sample: None,
        })
    }

    /// Handle for the tracker SDK thread.
    pub fn feed(&self) -> Feed {
        self.inbox.feed()
    }

    pub fn track_eyes(&self) -> TrackEyes {
        self.track_eyes
    }

    /// Gaze position of the latest sample; the mean of both eyes when binocular.
    fn last_gaze(&self) -> Value {
        let Some(sample) = &self.last_sample else {
            return Value::Null;
        };
        let get = |k: &str| sample.get(k).and_then(Value::as_f64);
        match (get("gaze_x"), get("gaze_y")) {
            (Some(x), Some(y)) => json!([x, y]),
            _ => match (get("left_gaze_x"), get("left_gaze_y"), get("right_gaze_x"), get("right_gaze_y")) {
                (Some(lx), Some(ly), Some(rx), Some(ry)) => json!([(lx + rx) / 2.0, (ly + ry) / 2.0]),
                (Some(lx), Some(ly), _, _) => json!([lx, ly]),
                (_, _, Some(rx), Some(ry)) => json!([rx, ry]),
                _ => Value::Null,
            },
        }
    }

    fn sample_type(&self, obj: &serde_json::Map<String, Value>) -> EventTypeId {
        let binocular_keys = obj.keys().any(|k| k.starts_with("left_") || k.starts_with("right_"));
        if self.track_eyes == TrackEyes::Binocular && binocular_keys {
            event_type::BINOCULAR_EYE_SAMPLE
        } else {
            event_type::MONOCULAR_EYE_SAMPLE
        }
    }
}

fn is_sample(data: &Value) -> bool {
    data.get("event").and_then(Value::as_str) == Some("sample")
}

impl DeviceBackend for EyeTrackerBackend {
    fn attach(&mut self, sink: NativeEventSink) {
        self.inbox.attach(&sink);
    }

    fn poll(&mut self, sink: &NativeEventSink) -> Result<(), DeviceBackendError> {
        for ev in self.inbox.drain() {
            if !self.recording {
                continue;
            }
            if is_sample(&ev.data) {
                self.last_sample = Some(ev.data.clone());
            }
            sink.push_at(ev.logged_time, ev.data);
        }
        Ok(())
    }

    fn to_canonical(&self, raw: &NativeEvent, ctx: &ConvertCtx<'_>) -> Result<Option<EventRecord>, DeviceBackendError> {
        let obj = raw
            .data
            .as_object()
            .ok_or_else(|| ctx.convert_error("eye tracker event must be an object"))?;
        let kind = match obj.get("event").and_then(Value::as_str) {
            Some("sample") => self.sample_type(obj),
            Some(name) => match event_type_by_name(name) {
                Some(t) => t,
                None => return Ok(None),
            },
            None => return Ok(None),
        };
        let mut fields = obj.clone();
        if kind == event_type::MONOCULAR_EYE_SAMPLE && !fields.contains_key("eye") {
            let eye = if self.track_eyes == TrackEyes::Right { RIGHT_EYE } else { LEFT_EYE };
            fields.insert("eye".into(), Value::from(eye));
        }
        ctx.event_from_object(kind, raw, &fields)
    }

    fn rpc_methods(&self) -> &[&'static str] {
        &[
            "pushNativeEvent",
            "setRecordingState",
            "isRecordingEnabled",
            "getLastSample",
            "getLastGazePosition",
            "getSamplingRate",
        ]
    }

    fn call(&mut self, method: &str, args: &[Value], _sink: &NativeEventSink) -> Result<Value, DeviceBackendError> {
        match method {
            "pushNativeEvent" => {
                let data = first_arg(&self.name, method, args)?.clone();
                Ok(Value::Bool(self.inbox.feed().send(data)))
            }
            "setRecordingState" => {
                let on = first_arg(&self.name, method, args)?.as_bool().unwrap_or(false);
                self.recording = on;
                log::info!("eye tracker '{}' recording {}", self.name, if on { "started" } else { "stopped" });
                Ok(Value::Bool(self.recording))
            }
            "isRecordingEnabled" => Ok(Value::Bool(self.recording)),
            "getLastSample" => Ok(self.last_sample.clone().unwrap_or(Value::Null)),
            "getLastGazePosition" => Ok(self.last_gaze()),
            "getSamplingRate" => Ok(Value::from(self.sampling_rate)),
            _ => Err(DeviceBackendError::Call {
                device: self.name.clone(),
                method: method.to_string(),
                message: "unknown method".into(),
            }),
        }
    }

    fn close(&mut self) -> Result<(), DeviceBackendError> {
        self.recording = false;
        self.inbox.close();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::parse_defaults;

    fn backend(user: Value) -> Result<EyeTrackerBackend, ConfigurationError> {
        let cfg = DeviceConfig::resolve(CLASS_NAME, &parse_defaults(CLASS_NAME, DEFAULTS).unwrap(), &user)?;
        EyeTrackerBackend::new(&cfg)
    }

    #[test]
    fn track_eyes_is_validated() {
        assert!(backend(json!({ "runtime_settings": { "track_eyes": "LEFT_EYE" } })).is_ok());
        assert!(matches!(
            backend(json!({ "runtime_settings": { "track_eyes": "THIRD_EYE" } })),
            Err(ConfigurationError::TypeMismatch { .. })
        ));
    }

    #[test]
    fn gaze_position_averages_both_eyes() {
        let mut et = backend(json!({})).unwrap();
        et.last_sample = Some(json!({
            "event": "sample", "left_gaze_x": 10.0, "left_gaze_y": 0.0,
            "right_gaze_x": 20.0, "right_gaze_y": 4.0
        }));
        assert_eq!(et.last_gaze(), json!([15.0, 2.0]));
    }

    #[test]
    fn samples_are_dropped_while_not_recording() {
        let registry = crate::registry::Registry::builtin().unwrap();
        let class = registry.device_class(CLASS_NAME).unwrap();
        let cfg = DeviceConfig::resolve(CLASS_NAME, &parse_defaults(CLASS_NAME, DEFAULTS).unwrap(), &json!({})).unwrap();
        let schemas = registry.schemas_for(class, &[]).unwrap();
        let record = crate::record::DeviceRecord {
            name: cfg.name.clone(),
            device_id: 0,
            device_number: 0,
            category: class.category,
            type_id: class.type_id,
            class_name: CLASS_NAME.into(),
            event_buffer_length: cfg.event_buffer_length,
            meta: cfg.meta.clone(),
        };
        let et = EyeTrackerBackend::new(&cfg).unwrap();
        let feed = et.feed();
        let device = crate::device::Device::new(record, cfg, Box::new(et), schemas);

        device.rpc("setRecordingState", &[json!(false)]).unwrap();
        feed.send(json!({ "event": "sample", "gaze_x": 1.0, "gaze_y": 2.0 }));
        device.poll().unwrap();
        assert_eq!(device.native_len(), 0);

        device.rpc("setRecordingState", &[json!(true)]).unwrap();
        feed.send(json!({ "event": "sample", "gaze_x": 1.0, "gaze_y": 2.0 }));
        device.poll().unwrap();
        assert_eq!(device.native_len(), 1);
        assert_eq!(device.rpc("getLastGazePosition", &[]).unwrap(), json!([1.0, 2.0]));

        let raw = device.drain_native();
        let ev = device.to_canonical(&raw[0]).unwrap().unwrap();
        assert_eq!(ev.event_type, event_type::MONOCULAR_EYE_SAMPLE);
    }
}
