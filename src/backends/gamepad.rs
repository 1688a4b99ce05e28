//! Game controller device (polled).
//!
//! The controller driver sends full state snapshots to the backend's
//! [`Feed`]:
//!
//! ```json
//! { "connected": true, "buttons": 4096,
//!   "left_thumbstick": [0.0, 0.5], "right_thumbstick": [0.0, 0.0],
//!   "left_trigger": 0.0, "right_trigger": 1.0 }
//! ```
//!
//! Each poll compares snapshots with the last reported state and only
//! forwards changes, so a steady controller produces no events. A snapshot
//! with `"connected": false` produces a single GAMEPAD_DISCONNECT.

use crate::backends::{first_arg, Feed, Inbox};
use crate::config::DeviceConfig;
use crate::constants::{device_type, event_type, DeviceCategory};
use crate::device::{ConvertCtx, DeviceBackend, NativeEvent, NativeEventSink};
use crate::error::{ConfigurationError, DeviceBackendError, RegistrationError};
use crate::event::{fields, EventRecord, FieldType};
use crate::registry::{DeviceClass, EventClass};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

pub const CLASS_NAME: &str = "GamePad";

pub const DEFAULTS: &str = r#"
name = "gamepad"
enable = true
save_events = true
stream_events = true
auto_report_events = true
event_buffer_length = 256
device_number = 0
monitor_event_types = []
manufacturer_name = ""
model_name = ""

[device_timer]
interval = 0.005

[extra]
"#;

const F: FieldType = FieldType::F32;

pub fn event_classes() -> Result<Vec<EventClass>, RegistrationError> {
    Ok(vec![
        EventClass::new(
            event_type::GAMEPAD_STATE_CHANGE,
            "GamepadStateChangeEvent",
            fields(&[
                ("controller_id", FieldType::U8),
                ("buttons", FieldType::U32),
                ("left_thumbstick_x", F),
                ("left_thumbstick_y", F),
                ("left_thumbstick_magnitude", F),
                ("right_thumbstick_x", F),
                ("right_thumbstick_y", F),
                ("right_thumbstick_magnitude", F),
                ("left_trigger", F),
                ("right_trigger", F),
            ]),
        )?,
        EventClass::new(
            event_type::GAMEPAD_DISCONNECT,
            "GamepadDisconnectEvent",
            fields(&[("controller_id", FieldType::U8)]),
        )?,
    ])
}

pub fn device_class() -> DeviceClass {
    DeviceClass {
        class_name: CLASS_NAME,
        type_id: device_type::GAMEPAD,
        category: DeviceCategory::GameController,
        defaults: DEFAULTS,
        event_types: vec![event_type::GAMEPAD_STATE_CHANGE, event_type::GAMEPAD_DISCONNECT],
        factory: |cfg| Ok(Box::new(GamePadBackend::new(cfg)?)),
    }
}

/// One controller snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PadState {
    pub connected: bool,
    pub buttons: u32,
    pub left_thumbstick: [f32; 2],
    pub right_thumbstick: [f32; 2],
    pub left_trigger: f32,
    pub right_trigger: f32,
}

fn magnitude([x, y]: [f32; 2]) -> f32 {
    (x * x + y * y).sqrt().min(1.0)
}

pub struct GamePadBackend {
    name: String,
    controller_id: u8,
    inbox: Inbox,
    last: Option<PadState>,
}

impl GamePadBackend {
    pub fn new(cfg: &DeviceConfig) -> Result<Self, ConfigurationError> {
        let controller_id = u8::try_from(cfg.device_number).map_err(|_| ConfigurationError::OutOfRange {
            device: cfg.name.clone(),
            key: "device_number".into(),
            min: 0.0,
            max: 3.0,
            given: cfg.device_number as f64,
        })?;
        if controller_id > 3 {
            return Err(ConfigurationError::OutOfRange {
                device: cfg.name.clone(),
                key: "device_number".into(),
                min: 0.0,
                max: 3.0,
                given: controller_id as f64,
            });
        }
        Ok(Self {
            name: cfg.name.clone(),
            controller_id,
            inbox: Inbox::new(cfg.event_buffer_length),
            last: None,
        })
    }

    /// Handle for the controller driver.
    pub fn feed(&self) -> Feed {
        self.inbox.feed()
    }
}

impl DeviceBackend for GamePadBackend {
    fn attach(&mut self, sink: NativeEventSink) {
        self.inbox.attach(&sink);
    }

    fn poll(&mut self, sink: &NativeEventSink) -> Result<(), DeviceBackendError> {
        for ev in self.inbox.drain() {
            let state: PadState = serde_json::from_value(ev.data).map_err(|e| DeviceBackendError::Poll {
                device: self.name.clone(),
                message: e.to_string(),
            })?;
            let was_connected = self.last.map(|s| s.connected).unwrap_or(false);
            if !state.connected {
                if was_connected {
                    sink.push_at(
                        ev.logged_time,
                        json!({ "event": "disconnect", "controller_id": self.controller_id }),
                    );
                }
                self.last = Some(state);
                continue;
            }
            if self.last != Some(state) {
                let mut data = serde_json::to_value(state).map_err(|e| DeviceBackendError::Poll {
                    device: self.name.clone(),
                    message: e.to_string(),
                })?;
                if let Some(obj) = data.as_object_mut() {
                    obj.insert("event".into(), json!("state"));
                    obj.insert("controller_id".into(), json!(self.controller_id));
                }
                sink.push_at(ev.logged_time, data);
                self.last = Some(state);
            }
        }
        Ok(())
    }

    fn to_canonical(&self, raw: &NativeEvent, ctx: &ConvertCtx<'_>) -> Result<Option<EventRecord>, DeviceBackendError> {
        let obj = raw
            .data
            .as_object()
            .ok_or_else(|| ctx.convert_error("gamepad event must be an object"))?;
        match obj.get("event").and_then(Value::as_str) {
            Some("disconnect") => ctx.event_from_object(event_type::GAMEPAD_DISCONNECT, raw, obj),
            Some("state") => {
                let state: PadState =
                    serde_json::from_value(raw.data.clone()).map_err(|e| ctx.convert_error(e))?;
                let mut fields = obj.clone();
                for (side, stick) in [("left", state.left_thumbstick), ("right", state.right_thumbstick)] {
                    fields.insert(format!("{}_thumbstick_x", side), json!(stick[0]));
                    fields.insert(format!("{}_thumbstick_y", side), json!(stick[1]));
                    fields.insert(format!("{}_thumbstick_magnitude", side), json!(magnitude(stick)));
                }
                ctx.event_from_object(event_type::GAMEPAD_STATE_CHANGE, raw, &fields)
            }
            _ => Ok(None),
        }
    }

    fn rpc_methods(&self) -> &[&'static str] {
        &["pushNativeEvent", "getLastState", "isConnected"]
    }

    fn call(&mut self, method: &str, args: &[Value], _sink: &NativeEventSink) -> Result<Value, DeviceBackendError> {
        let err = |message: String| DeviceBackendError::Call {
            device: self.name.clone(),
            method: method.to_string(),
            message,
        };
        match method {
            "pushNativeEvent" => {
                let data = first_arg(&self.name, method, args)?.clone();
                Ok(Value::Bool(self.inbox.feed().send(data)))
            }
            "getLastState" => serde_json::to_value(self.last).map_err(|e| err(e.to_string())),
            "isConnected" => Ok(Value::Bool(self.last.map(|s| s.connected).unwrap_or(false))),
            _ => Err(err("unknown method".into())),
        }
    }

    fn close(&mut self) -> Result<(), DeviceBackendError> {
        self.inbox.close();
        Ok(())
    }
}
