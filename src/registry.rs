//! Device-class and event-class registry.
//!
//! Built once at hub startup from the built-in backends and never mutated
//! while a session runs. Every lookup that can miss returns a
//! [`RegistrationError`] so a bad configuration fails before any device starts.

use crate::config::DeviceConfig;
use crate::constants::{device_type_name, event_type_by_name, event_type_name, DeviceCategory, DeviceTypeId, EventTypeId};
use crate::device::DeviceBackend;
use crate::error::{ConfigurationError, RegistrationError};
use crate::event::{EventSchema, FieldDef};
use once_cell::sync::Lazy;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, RwLock};

/// Builds a backend from a validated device configuration.
pub type BackendFactory = fn(&DeviceConfig) -> Result<Box<dyn DeviceBackend>, ConfigurationError>;

/// One event kind: its id, names and composed schema.
#[derive(Debug, Clone)]
pub struct EventClass {
    pub type_id: EventTypeId,
    /// Constant name, e.g. `KEYBOARD_PRESS`.
    pub name: String,
    /// Class name, e.g. `KeyboardPressEvent`.
    pub class_name: String,
    pub schema: Arc<EventSchema>,
}

impl EventClass {
    pub fn new(type_id: EventTypeId, class_name: &str, kind_fields: Vec<FieldDef>) -> Result<Self, RegistrationError> {
        let name = event_type_name(type_id).ok_or(RegistrationError::UnknownEventTypeId(type_id.0))?;
        Ok(Self {
            type_id,
            name: name.to_string(),
            class_name: class_name.to_string(),
            schema: Arc::new(EventSchema::compose(type_id, class_name, kind_fields)),
        })
    }
}

/// One device class.
#[derive(Debug, Clone)]
pub struct DeviceClass {
    pub class_name: &'static str,
    pub type_id: DeviceTypeId,
    pub category: DeviceCategory,
    /// Embedded TOML defaults.
    pub defaults: &'static str,
    /// Every event type the class can emit.
    pub event_types: Vec<EventTypeId>,
    pub factory: BackendFactory,
}

#[derive(Debug, Default)]
pub struct Registry {
    events: BTreeMap<EventTypeId, EventClass>,
    devices: Vec<DeviceClass>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry holding every built-in device class.
    pub fn builtin() -> Result<Self, RegistrationError> {
        let mut reg = Self::new();
        crate::backends::register_builtins(&mut reg)?;
        Ok(reg)
    }

    pub fn register_event(&mut self, class: EventClass) -> Result<(), RegistrationError> {
        if self.events.contains_key(&class.type_id) {
            return Err(RegistrationError::DuplicateEventType(class.type_id.0));
        }
        self.events.insert(class.type_id, class);
        Ok(())
    }

    /// Register a device class. Its event types must already be registered.
    pub fn register_device(&mut self, class: DeviceClass) -> Result<(), RegistrationError> {
        if self.devices.iter().any(|d| d.class_name == class.class_name) {
            return Err(RegistrationError::DuplicateDeviceClass(class.class_name.to_string()));
        }
        if device_type_name(class.type_id).is_none() {
            return Err(RegistrationError::UnknownDeviceClass(class.class_name.to_string()));
        }
        for t in &class.event_types {
            if !self.events.contains_key(t) {
                return Err(RegistrationError::UnknownEventType {
                    class: class.class_name.to_string(),
                    event: t.to_string(),
                });
            }
        }
        self.devices.push(class);
        Ok(())
    }

    pub fn event_class(&self, id: EventTypeId) -> Result<&EventClass, RegistrationError> {
        self.events.get(&id).ok_or(RegistrationError::UnknownEventTypeId(id.0))
    }

    pub fn event_classes(&self) -> impl Iterator<Item = &EventClass> {
        self.events.values()
    }

    pub fn device_class(&self, name: &str) -> Result<&DeviceClass, RegistrationError> {
        self.devices
            .iter()
            .find(|d| d.class_name == name)
            .ok_or_else(|| RegistrationError::UnknownDeviceClass(name.to_string()))
    }

    pub fn device_classes(&self) -> &[DeviceClass] {
        &self.devices
    }

    /// Schemas for the event types a device of `class` will emit.
    ///
    /// An empty `monitor` list selects every type of the class; otherwise each
    /// name must be a registered type that the class declares.
    pub fn schemas_for(
        &self,
        class: &DeviceClass,
        monitor: &[String],
    ) -> Result<HashMap<EventTypeId, Arc<EventSchema>>, RegistrationError> {
        let selected: Vec<EventTypeId> = if monitor.is_empty() {
            class.event_types.clone()
        } else {
            monitor
                .iter()
                .map(|name| {
                    event_type_by_name(name)
                        .filter(|t| class.event_types.contains(t))
                        .ok_or_else(|| RegistrationError::UnknownEventType {
                            class: class.class_name.to_string(),
                            event: name.clone(),
                        })
                })
                .collect::<Result<_, _>>()?
        };
        selected
            .into_iter()
            .map(|t| self.event_class(t).map(|c| (t, c.schema.clone())))
            .collect()
    }
}

static REGISTRY: Lazy<RwLock<Option<Arc<Registry>>>> = Lazy::new(|| RwLock::new(None));

/// Publish `registry` as the process-wide registry.
pub fn init(registry: Arc<Registry>) {
    let mut slot = REGISTRY.write().unwrap_or_else(|e| e.into_inner());
    *slot = Some(registry);
}

pub fn global() -> Result<Arc<Registry>, RegistrationError> {
    REGISTRY
        .read()
        .unwrap_or_else(|e| e.into_inner())
        .clone()
        .ok_or(RegistrationError::NotInitialized)
}

pub fn shutdown() {
    let mut slot = REGISTRY.write().unwrap_or_else(|e| e.into_inner());
    *slot = None;
}
