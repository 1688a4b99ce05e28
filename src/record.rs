//! Device records.
//!
//! A [`DeviceRecord`] is the hub's description of one configured device. It is
//! created once from the validated configuration at startup (or by an
//! `ADD_DEVICE` request) and owned by the hub for the rest of the session.
//!
//! # Conventions
//! - `name` is unique among all devices on the hub.
//! - `device_id` is the hub-assigned index stamped into each event's prefix.
//! - [`DeviceMeta`] strings are free-form; backends fill what they know and
//!   leave the rest `None`.

use crate::constants::{DeviceCategory, DeviceTypeId};
use serde::{Deserialize, Serialize};

/// Free-form vendor description of a device.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct DeviceMeta {
    /// Manufacturer name, e.g. `"SR Research"`.
    pub manufacturer_name: Option<String>,

    pub model_name: Option<String>,

    /// Model number or revision code.
    pub model_number: Option<String>,

    /// Serial number reported by the hardware, if any.
    pub serial_number: Option<String>,

    pub software_version: Option<String>,

    pub hardware_version: Option<String>,

    pub firmware_version: Option<String>,
}

/// Identity and static settings of one monitored device.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DeviceRecord {
    pub name: String,
    pub device_id: u16,
    /// Index among devices of the same class (e.g. the second gamepad is `1`).
    pub device_number: u32,
    pub category: DeviceCategory,
    pub type_id: DeviceTypeId,
    pub class_name: String,
    /// Capacity of the native buffer and of each canonical per-type buffer.
    pub event_buffer_length: usize,
    #[serde(default)]
    pub meta: DeviceMeta,
}

impl DeviceRecord {
    /// `(name, class)` pair as listed by `GET_DEVICE_LIST`.
    pub fn summary(&self) -> (String, String) {
        (self.name.clone(), self.class_name.clone())
    }
}

impl std::fmt::Display for DeviceRecord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} ({} #{})", self.name, self.class_name, self.device_number)
    }
}
