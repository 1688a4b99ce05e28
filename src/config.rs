//! Hub and device configuration.
//!
//! The hub reads one TOML file ([`HubConfig`]). Each `[[monitor_devices]]`
//! entry names a device class and carries a user table which is deep-merged
//! over that class's embedded defaults ([`merge_defaults`]) and then validated
//! into a typed [`DeviceConfig`].
//!
//! ## Merge rule
//! - a default key absent from the user table is copied from the defaults;
//! - when both sides hold tables they are merged recursively;
//! - when both sides hold non-table values the user value wins, provided it
//!   has the default's type (an integer is accepted where a float is expected);
//! - a table over a scalar, or a scalar over a table, is a type mismatch;
//! - arrays are replaced wholesale;
//! - a user `null` keeps the default;
//! - a user key with no default is rejected, except under the open `extra`
//!   table, which is passed through to the backend untouched.

use crate::error::ConfigurationError;
use crate::record::DeviceMeta;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::path::{Path, PathBuf};

pub const EVENT_BUFFER_LENGTH_RANGE: (f64, f64) = (1.0, 65535.0);
pub const POLL_INTERVAL_RANGE: (f64, f64) = (0.0, 1.0);
pub const MAX_PACKET_SIZE_RANGE: (f64, f64) = (1024.0, 65536.0);

/// Top-level hub configuration file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct HubConfig {
    pub hub: HubSettings,
    pub data_store: DataStoreConfig,
    pub monitor_devices: Vec<DeviceEntry>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct HubSettings {
    pub address: String,
    pub udp_port: u16,
    /// Capacity of the global event buffer served by `GET_EVENTS`.
    pub global_event_buffer: usize,
    /// Seconds between dispatcher ticks.
    pub dispatch_interval: f64,
    /// Largest datagram the server sends or accepts.
    pub max_packet_size: usize,
    /// Register an [`EventLogger`](crate::logger::EventLogger) on every device.
    pub log_events: bool,
}

impl Default for HubSettings {
    fn default() -> Self {
        Self {
            address: "127.0.0.1".to_string(),
            udp_port: 9000,
            global_event_buffer: 2048,
            dispatch_interval: 0.001,
            max_packet_size: 64 * 1024,
            log_events: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DataStoreConfig {
    pub enable: bool,
    pub directory: PathBuf,
}

impl Default for DataStoreConfig {
    fn default() -> Self {
        Self {
            enable: false,
            directory: PathBuf::from("hub_data"),
        }
    }
}

/// One `[[monitor_devices]]` entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DeviceEntry {
    pub class: String,
    #[serde(default)]
    pub config: Map<String, Value>,
}

impl HubConfig {
    pub fn load(path: &Path) -> Result<Self, ConfigurationError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigurationError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&text, path)
    }

    pub fn from_toml_str(text: &str, origin: &Path) -> Result<Self, ConfigurationError> {
        let cfg: HubConfig = toml::from_str(text).map_err(|source| ConfigurationError::Parse {
            path: origin.to_path_buf(),
            source,
        })?;
        cfg.hub.validate()?;
        Ok(cfg)
    }
}

impl HubSettings {
    pub fn validate(&self) -> Result<(), ConfigurationError> {
        check_range("hub", "global_event_buffer", self.global_event_buffer as f64, (1.0, 1_000_000.0))?;
        check_range("hub", "dispatch_interval", self.dispatch_interval, POLL_INTERVAL_RANGE)?;
        check_range("hub", "max_packet_size", self.max_packet_size as f64, MAX_PACKET_SIZE_RANGE)?;
        Ok(())
    }
}

fn check_range(device: &str, key: &str, given: f64, (min, max): (f64, f64)) -> Result<(), ConfigurationError> {
    if given < min || given > max || given.is_nan() {
        return Err(ConfigurationError::OutOfRange {
            device: device.to_string(),
            key: key.to_string(),
            min,
            max,
            given,
        });
    }
    Ok(())
}

/// Parse a class's embedded TOML defaults into a JSON-compatible table.
pub fn parse_defaults(class: &str, toml_text: &str) -> Result<Value, ConfigurationError> {
    toml::from_str::<Value>(toml_text).map_err(|source| ConfigurationError::Defaults {
        class: class.to_string(),
        source,
    })
}

fn type_name(v: &Value) -> &'static str {
    match v {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(n) if n.is_f64() => "float",
        Value::Number(_) => "integer",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "table",
    }
}

/// Deep-merge `user` over `defaults`; see the module docs for the rule.
pub fn merge_defaults(device: &str, defaults: &Value, user: &Value) -> Result<Value, ConfigurationError> {
    merge_at(device, "", defaults, user)
}

fn merge_at(device: &str, path: &str, defaults: &Value, user: &Value) -> Result<Value, ConfigurationError> {
    let key_path = |k: &str| {
        if path.is_empty() {
            k.to_string()
        } else {
            format!("{}.{}", path, k)
        }
    };
    match (defaults, user) {
        (_, Value::Null) => Ok(defaults.clone()),
        (Value::Object(d), Value::Object(u)) => {
            let mut out = d.clone();
            for (k, uv) in u {
                let kp = key_path(k);
                match d.get(k) {
                    Some(dv) if kp == "extra" => {
                        let mut open = dv.as_object().cloned().unwrap_or_default();
                        match uv {
                            Value::Object(extra) => open.extend(extra.clone()),
                            other => {
                                return Err(mismatch(device, &kp, "table", other));
                            }
                        }
                        out.insert(k.clone(), Value::Object(open));
                    }
                    Some(dv) => {
                        out.insert(k.clone(), merge_at(device, &kp, dv, uv)?);
                    }
                    None => {
                        return Err(ConfigurationError::UnknownKey {
                            device: device.to_string(),
                            key: kp,
                        })
                    }
                }
            }
            Ok(Value::Object(out))
        }
        (Value::Object(_), other) => Err(mismatch(device, path, "table", other)),
        (d, u @ Value::Object(_)) => Err(mismatch(device, path, type_name(d), u)),
        (Value::Number(dn), Value::Number(un)) => {
            if dn.is_f64() {
                Ok(un.as_f64().map(Value::from).unwrap_or_else(|| user.clone()))
            } else if un.is_f64() {
                Err(mismatch(device, path, "integer", user))
            } else {
                Ok(user.clone())
            }
        }
        (d, u) if type_name(d) == type_name(u) => Ok(u.clone()),
        (d, u) => Err(mismatch(device, path, type_name(d), u)),
    }
}

fn mismatch(device: &str, key: &str, expected: &'static str, given: &Value) -> ConfigurationError {
    ConfigurationError::TypeMismatch {
        device: device.to_string(),
        key: key.to_string(),
        expected,
        given: given.to_string(),
    }
}

/// Validated settings of one device.
#[derive(Debug, Clone, PartialEq)]
pub struct DeviceConfig {
    pub name: String,
    pub enable: bool,
    /// Persist this device's events when a data store is enabled.
    pub save_events: bool,
    /// Feed this device's events to the global buffer.
    pub stream_events: bool,
    /// Start with event reporting switched on.
    pub auto_report_events: bool,
    pub event_buffer_length: usize,
    pub device_number: u32,
    /// `device_timer.interval`, present only for polled classes.
    pub poll_interval: Option<f64>,
    /// Event type names this device emits. Empty means every type of its class.
    pub monitor_event_types: Vec<String>,
    pub meta: DeviceMeta,
    /// The complete merged table, as reported by `getConfiguration`.
    pub settings: Map<String, Value>,
}

impl DeviceConfig {
    /// Merge `user` over `defaults` and validate the result.
    pub fn resolve(class: &str, defaults: &Value, user: &Value) -> Result<Self, ConfigurationError> {
        let label = user
            .get("name")
            .and_then(Value::as_str)
            .unwrap_or(class)
            .to_string();
        let merged = merge_defaults(&label, defaults, user)?;
        Self::from_merged(&label, merged)
    }

    fn from_merged(label: &str, merged: Value) -> Result<Self, ConfigurationError> {
        let settings = match merged {
            Value::Object(map) => map,
            other => return Err(mismatch(label, "", "table", &other)),
        };
        let req = |key: &str| {
            settings.get(key).ok_or_else(|| ConfigurationError::MissingKey {
                device: label.to_string(),
                key: key.to_string(),
            })
        };

        let name = req("name")?.as_str().unwrap_or_default().to_string();
        if name.is_empty() {
            return Err(ConfigurationError::MissingKey {
                device: label.to_string(),
                key: "name".to_string(),
            });
        }
        let flag = |key: &str| -> Result<bool, ConfigurationError> {
            req(key)?
                .as_bool()
                .ok_or_else(|| mismatch(label, key, "bool", &settings[key]))
        };
        let enable = flag("enable")?;
        let save_events = flag("save_events")?;
        let stream_events = flag("stream_events")?;
        let auto_report_events = flag("auto_report_events")?;

        let ebl = req("event_buffer_length")?;
        let event_buffer_length = ebl
            .as_u64()
            .map(|v| v as f64)
            .or_else(|| ebl.as_i64().map(|v| v as f64))
            .ok_or_else(|| mismatch(label, "event_buffer_length", "integer", ebl))?;
        check_range(label, "event_buffer_length", event_buffer_length, EVENT_BUFFER_LENGTH_RANGE)?;

        let device_number = match settings.get("device_number") {
            Some(v) => v
                .as_u64()
                .and_then(|n| u32::try_from(n).ok())
                .ok_or_else(|| mismatch(label, "device_number", "integer", v))?,
            None => 0,
        };

        let poll_interval = match settings.get("device_timer") {
            Some(timer) => {
                let iv = timer.get("interval").ok_or_else(|| ConfigurationError::MissingKey {
                    device: label.to_string(),
                    key: "device_timer.interval".to_string(),
                })?;
                let secs = iv
                    .as_f64()
                    .ok_or_else(|| mismatch(label, "device_timer.interval", "float", iv))?;
                check_range(label, "device_timer.interval", secs, POLL_INTERVAL_RANGE)?;
                Some(secs)
            }
            None => None,
        };

        let monitor_event_types = match settings.get("monitor_event_types") {
            Some(Value::Array(items)) => items
                .iter()
                .map(|v| {
                    v.as_str()
                        .map(str::to_string)
                        .ok_or_else(|| mismatch(label, "monitor_event_types", "string", v))
                })
                .collect::<Result<Vec<_>, _>>()?,
            Some(other) => return Err(mismatch(label, "monitor_event_types", "array", other)),
            None => Vec::new(),
        };

        let text = |key: &str| {
            settings
                .get(key)
                .and_then(Value::as_str)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
        };
        let meta = DeviceMeta {
            manufacturer_name: text("manufacturer_name"),
            model_name: text("model_name"),
            model_number: text("model_number"),
            serial_number: text("serial_number"),
            software_version: text("software_version"),
            hardware_version: text("hardware_version"),
            firmware_version: text("firmware_version"),
        };

        Ok(Self {
            name,
            enable,
            save_events,
            stream_events,
            auto_report_events,
            event_buffer_length: event_buffer_length as usize,
            device_number,
            poll_interval,
            monitor_event_types,
            meta,
            settings,
        })
    }

    /// Backend-specific value from the open `extra` table.
    pub fn extra(&self, key: &str) -> Option<&Value> {
        self.settings.get("extra").and_then(|e| e.get(key))
    }

    pub fn as_json(&self) -> Value {
        Value::Object(self.settings.clone())
    }
}
