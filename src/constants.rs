//! Numeric identifiers shared by the hub and its clients.
//!
//! Event type ids and device type ids travel on the wire and are stored in
//! every event's prefix, so their values are fixed. Names are the
//! `SCREAMING_SNAKE_CASE` strings used in configuration files and error
//! messages.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Identifier of an event kind (the `eventTypeId` field of every event).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EventTypeId(pub u8);

/// Identifier of a device type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DeviceTypeId(pub u8);

impl fmt::Display for EventTypeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match event_type_name(*self) {
            Some(name) => write!(f, "{}({})", name, self.0),
            None => write!(f, "UNDEFINED({})", self.0),
        }
    }
}

impl fmt::Display for DeviceTypeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match device_type_name(*self) {
            Some(name) => write!(f, "{}({})", name, self.0),
            None => write!(f, "UNDEFINED({})", self.0),
        }
    }
}

pub mod event_type {
    use super::EventTypeId;

    pub const UNDEFINED: EventTypeId = EventTypeId(0);

    pub const KEYBOARD_PRESS: EventTypeId = EventTypeId(22);
    pub const KEYBOARD_RELEASE: EventTypeId = EventTypeId(23);

    pub const MOUSE_BUTTON_PRESS: EventTypeId = EventTypeId(32);
    pub const MOUSE_BUTTON_RELEASE: EventTypeId = EventTypeId(33);
    pub const MOUSE_DOUBLE_CLICK: EventTypeId = EventTypeId(34);
    pub const MOUSE_SCROLL: EventTypeId = EventTypeId(35);
    pub const MOUSE_MOVE: EventTypeId = EventTypeId(36);
    pub const MOUSE_DRAG: EventTypeId = EventTypeId(37);

    pub const MONOCULAR_EYE_SAMPLE: EventTypeId = EventTypeId(51);
    pub const BINOCULAR_EYE_SAMPLE: EventTypeId = EventTypeId(52);
    pub const FIXATION_START: EventTypeId = EventTypeId(53);
    pub const FIXATION_END: EventTypeId = EventTypeId(54);
    pub const SACCADE_START: EventTypeId = EventTypeId(55);
    pub const SACCADE_END: EventTypeId = EventTypeId(56);
    pub const BLINK_START: EventTypeId = EventTypeId(57);
    pub const BLINK_END: EventTypeId = EventTypeId(58);

    pub const GAMEPAD_STATE_CHANGE: EventTypeId = EventTypeId(81);
    pub const GAMEPAD_DISCONNECT: EventTypeId = EventTypeId(82);

    pub const MULTI_CHANNEL_ANALOG_INPUT: EventTypeId = EventTypeId(122);

    pub const MESSAGE: EventTypeId = EventTypeId(151);
    pub const LOG: EventTypeId = EventTypeId(152);
}

pub mod device_type {
    use super::DeviceTypeId;

    pub const OTHER: DeviceTypeId = DeviceTypeId(1);
    pub const KEYBOARD: DeviceTypeId = DeviceTypeId(20);
    pub const MOUSE: DeviceTypeId = DeviceTypeId(30);
    pub const EYETRACKER: DeviceTypeId = DeviceTypeId(50);
    pub const XINPUT: DeviceTypeId = DeviceTypeId(70);
    pub const GAMEPAD: DeviceTypeId = DeviceTypeId(80);
    pub const ANALOGINPUT: DeviceTypeId = DeviceTypeId(120);
    pub const EXPERIMENT: DeviceTypeId = DeviceTypeId(150);
    pub const DISPLAY: DeviceTypeId = DeviceTypeId(190);
    pub const COMPUTER: DeviceTypeId = DeviceTypeId(200);
}

const EVENT_TYPE_NAMES: &[(EventTypeId, &str)] = &[
    (event_type::KEYBOARD_PRESS, "KEYBOARD_PRESS"),
    (event_type::KEYBOARD_RELEASE, "KEYBOARD_RELEASE"),
    (event_type::MOUSE_BUTTON_PRESS, "MOUSE_BUTTON_PRESS"),
    (event_type::MOUSE_BUTTON_RELEASE, "MOUSE_BUTTON_RELEASE"),
    (event_type::MOUSE_DOUBLE_CLICK, "MOUSE_DOUBLE_CLICK"),
    (event_type::MOUSE_SCROLL, "MOUSE_SCROLL"),
    (event_type::MOUSE_MOVE, "MOUSE_MOVE"),
    (event_type::MOUSE_DRAG, "MOUSE_DRAG"),
    (event_type::MONOCULAR_EYE_SAMPLE, "MONOCULAR_EYE_SAMPLE"),
    (event_type::BINOCULAR_EYE_SAMPLE, "BINOCULAR_EYE_SAMPLE"),
    (event_type::FIXATION_START, "FIXATION_START"),
    (event_type::FIXATION_END, "FIXATION_END"),
    (event_type::SACCADE_START, "SACCADE_START"),
    (event_type::SACCADE_END, "SACCADE_END"),
    (event_type::BLINK_START, "BLINK_START"),
    (event_type::BLINK_END, "BLINK_END"),
    (event_type::GAMEPAD_STATE_CHANGE, "GAMEPAD_STATE_CHANGE"),
    (event_type::GAMEPAD_DISCONNECT, "GAMEPAD_DISCONNECT"),
    (event_type::MULTI_CHANNEL_ANALOG_INPUT, "MULTI_CHANNEL_ANALOG_INPUT"),
    (event_type::MESSAGE, "MESSAGE"),
    (event_type::LOG, "LOG"),
];

const DEVICE_TYPE_NAMES: &[(DeviceTypeId, &str)] = &[
    (device_type::OTHER, "OTHER"),
    (device_type::KEYBOARD, "KEYBOARD"),
    (device_type::MOUSE, "MOUSE"),
    (device_type::EYETRACKER, "EYETRACKER"),
    (device_type::XINPUT, "XINPUT"),
    (device_type::GAMEPAD, "GAMEPAD"),
    (device_type::ANALOGINPUT, "ANALOGINPUT"),
    (device_type::EXPERIMENT, "EXPERIMENT"),
    (device_type::DISPLAY, "DISPLAY"),
    (device_type::COMPUTER, "COMPUTER"),
];

pub fn event_type_name(id: EventTypeId) -> Option<&'static str> {
    EVENT_TYPE_NAMES
        .iter()
        .find(|(i, _)| *i == id)
        .map(|(_, n)| *n)
}

pub fn event_type_by_name(name: &str) -> Option<EventTypeId> {
    EVENT_TYPE_NAMES
        .iter()
        .find(|(_, n)| *n == name)
        .map(|(i, _)| *i)
}

pub fn device_type_name(id: DeviceTypeId) -> Option<&'static str> {
    DEVICE_TYPE_NAMES
        .iter()
        .find(|(i, _)| *i == id)
        .map(|(_, n)| *n)
}

pub fn device_type_by_name(name: &str) -> Option<DeviceTypeId> {
    DEVICE_TYPE_NAMES
        .iter()
        .find(|(_, n)| *n == name)
        .map(|(i, _)| *i)
}

/// Broad grouping of device types, stored as `category_id` on each device record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum DeviceCategory {
    /// Software-only devices (the Experiment device).
    Virtual = 1,
    /// Keyboards and pointers.
    Input = 2,
    EyeTracking = 3,
    AnalogIo = 4,
    GameController = 5,
}

impl DeviceCategory {
    pub fn id(self) -> u8 {
        self as u8
    }
}
