//! Device core.
//!
//! A [`Device`] pairs a [`DeviceBackend`] (the hardware- or SDK-facing part)
//! with the state the hub keeps for every device:
//!
//! - a bounded native queue ([`NativeEventQueue`]) that callback threads and
//!   `poll` append to, dropping the oldest entry on overflow;
//! - the reporting switch, which gates every append;
//! - a [`ListenerTable`] consulted by the dispatcher;
//! - a per-type canonical buffer ([`DeviceEventBuffer`]) always registered as
//!   the device's own listener, served by `getEvents`.
//!
//! Backends never see the queue directly. They receive a [`NativeEventSink`],
//! a cloneable handle that timestamps and appends, and is safe to move onto
//! an OS callback thread.

use crate::clock;
use crate::constants::EventTypeId;
use crate::config::DeviceConfig;
use crate::error::{DeviceBackendError, ListenerError, RpcError};
use crate::event::{EventRecord, EventSchema, FieldValue};
use crate::eventbus::{notify_all, EventListener, ListenerId, ListenerTable};
use crate::record::DeviceRecord;
use crate::scheduler::ScheduledUnit;
use crossbeam::queue::ArrayQueue;
use serde_json::{Map, Value};
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock};
use std::time::Duration;

/// Devices in registration order, shared by the hub, dispatcher and server.
pub type DeviceList = Arc<RwLock<Vec<Arc<Device>>>>;

/// One event in a backend's own format, stamped with the time the hub received it.
#[derive(Debug, Clone, PartialEq)]
pub struct NativeEvent {
    pub logged_time: f64,
    pub data: Value,
}

/// Bounded lock-free FIFO of native events. Overflow drops the oldest entry.
pub struct NativeEventQueue {
    queue: ArrayQueue<NativeEvent>,
    dropped: AtomicU64,
}

impl NativeEventQueue {
    /// `capacity` must be at least 1.
    pub fn new(capacity: usize) -> Self {
        Self {
            queue: ArrayQueue::new(capacity.max(1)),
            dropped: AtomicU64::new(0),
        }
    }

    pub fn push(&self, event: NativeEvent) {
        if self.queue.force_push(event).is_some() {
            self.dropped.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Take what is queued right now, oldest first.
    ///
    /// Only the entries present at the call are taken, so a producer pushing
    /// concurrently cannot keep the drain running.
    pub fn drain(&self) -> Vec<NativeEvent> {
        let n = self.queue.len();
        let mut out = Vec::with_capacity(n);
        for _ in 0..n {
            match self.queue.pop() {
                Some(ev) => out.push(ev),
                None => break,
            }
        }
        out
    }

    pub fn clear(&self) {
        while self.queue.pop().is_some() {}
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.queue.capacity()
    }

    /// Entries discarded by overflow since creation.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

/// Cloneable append handle for one device's native queue.
#[derive(Clone)]
pub struct NativeEventSink {
    queue: Arc<NativeEventQueue>,
    reporting: Arc<AtomicBool>,
}

impl NativeEventSink {
    /// Append `data` stamped with the current hub time.
    ///
    /// Returns `false` without queueing when reporting is off. Never blocks.
    pub fn push(&self, data: Value) -> bool {
        self.push_at(clock::now(), data)
    }

    pub fn push_at(&self, logged_time: f64, data: Value) -> bool {
        if !self.reporting.load(Ordering::Acquire) {
            return false;
        }
        self.queue.push(NativeEvent { logged_time, data });
        true
    }

    pub fn is_reporting(&self) -> bool {
        self.reporting.load(Ordering::Acquire)
    }
}

/// What a backend needs to build canonical events.
pub struct ConvertCtx<'a> {
    pub device: &'a DeviceRecord,
    schemas: &'a HashMap<EventTypeId, Arc<EventSchema>>,
}

impl<'a> ConvertCtx<'a> {
    pub fn new(device: &'a DeviceRecord, schemas: &'a HashMap<EventTypeId, Arc<EventSchema>>) -> Self {
        Self { device, schemas }
    }

    /// Schema of `event_type` if this device monitors it.
    pub fn schema(&self, event_type: EventTypeId) -> Option<&Arc<EventSchema>> {
        self.schemas.get(&event_type)
    }

    /// Build an event of `event_type` from explicit kind values.
    ///
    /// `Ok(None)` when the device does not monitor `event_type`. Times default
    /// to the native event's `logged_time`.
    pub fn event(
        &self,
        event_type: EventTypeId,
        raw: &NativeEvent,
        values: Vec<FieldValue>,
    ) -> Result<Option<EventRecord>, DeviceBackendError> {
        let Some(schema) = self.schema(event_type) else {
            return Ok(None);
        };
        let mut ev = EventRecord::new(schema.clone(), values).map_err(|e| self.convert_error(e))?;
        ev.device_id = self.device.device_id;
        ev.logged_time = raw.logged_time;
        ev.device_time = raw.logged_time;
        ev.hub_time = raw.logged_time;
        Ok(Some(ev))
    }

    /// Build an event of `event_type` from a native JSON object.
    ///
    /// Kind fields are read by name. The optional prefix keys `device_time`,
    /// `delay` and `confidence_interval` are honoured; `hub_time` is
    /// `logged_time - delay`.
    pub fn event_from_object(
        &self,
        event_type: EventTypeId,
        raw: &NativeEvent,
        obj: &Map<String, Value>,
    ) -> Result<Option<EventRecord>, DeviceBackendError> {
        let Some(schema) = self.schema(event_type) else {
            return Ok(None);
        };
        let values = schema.kind_values_from(obj).map_err(|e| self.convert_error(e))?;
        let Some(mut ev) = self.event(event_type, raw, values)? else {
            return Ok(None);
        };
        let num = |k: &str| obj.get(k).and_then(Value::as_f64);
        let delay = num("delay").unwrap_or(0.0).max(0.0);
        ev.delay = delay as f32;
        ev.device_time = num("device_time").unwrap_or(raw.logged_time - delay);
        ev.hub_time = raw.logged_time - delay;
        ev.confidence_interval = num("confidence_interval").unwrap_or(0.0).max(0.0) as f32;
        Ok(Some(ev))
    }

    pub fn convert_error(&self, e: impl std::fmt::Display) -> DeviceBackendError {
        DeviceBackendError::Convert {
            device: self.device.name.clone(),
            message: e.to_string(),
        }
    }
}

/// The external contract every device class implements.
///
/// Polled backends implement [`poll`](DeviceBackend::poll); callback backends
/// keep the sink handed to [`attach`](DeviceBackend::attach) and push from
/// their callback. Either kind may expose extra RPC methods.
pub trait DeviceBackend: Send {
    /// Receive the sink before the device starts. Callback backends keep it.
    fn attach(&mut self, _sink: NativeEventSink) {}

    /// Pull new native events into `sink`.
    fn poll(&mut self, _sink: &NativeEventSink) -> Result<(), DeviceBackendError> {
        Ok(())
    }

    /// Turn one native event into a canonical event. `Ok(None)` suppresses it.
    fn to_canonical(
        &self,
        raw: &NativeEvent,
        ctx: &ConvertCtx<'_>,
    ) -> Result<Option<EventRecord>, DeviceBackendError>;

    /// Backend methods reachable through device RPC.
    fn rpc_methods(&self) -> &[&'static str] {
        &[]
    }

    fn call(
        &mut self,
        method: &str,
        _args: &[Value],
        _sink: &NativeEventSink,
    ) -> Result<Value, DeviceBackendError> {
        Err(DeviceBackendError::Call {
            device: String::new(),
            method: method.to_string(),
            message: "not implemented".to_string(),
        })
    }

    /// OS message pump for callback backends, scheduled like a polled device.
    fn message_pump(&mut self) -> Option<Box<dyn ScheduledUnit>> {
        None
    }

    fn close(&mut self) -> Result<(), DeviceBackendError> {
        Ok(())
    }
}

/// Per-type canonical buffer of one device, bounded by `event_buffer_length`.
pub struct DeviceEventBuffer {
    name: String,
    capacity: usize,
    by_type: Mutex<HashMap<EventTypeId, VecDeque<EventRecord>>>,
}

impl DeviceEventBuffer {
    pub fn new(device: &str, capacity: usize) -> Self {
        Self {
            name: format!("{}-buffer", device),
            capacity: capacity.max(1),
            by_type: Mutex::new(HashMap::new()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<EventTypeId, VecDeque<EventRecord>>> {
        self.by_type.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Events of one type, or of every type ordered by event id.
    pub fn get(&self, event_type: Option<EventTypeId>, clear: bool) -> Vec<EventRecord> {
        let mut map = self.lock();
        let mut out: Vec<EventRecord> = match event_type {
            Some(t) => match map.get_mut(&t) {
                Some(q) if clear => q.drain(..).collect(),
                Some(q) => q.iter().cloned().collect(),
                None => Vec::new(),
            },
            None => {
                let mut all = Vec::new();
                for q in map.values_mut() {
                    if clear {
                        all.extend(q.drain(..));
                    } else {
                        all.extend(q.iter().cloned());
                    }
                }
                all
            }
        };
        out.sort_by_key(|e| e.event_id);
        out
    }

    pub fn clear(&self) {
        self.lock().clear();
    }

    pub fn len(&self) -> usize {
        self.lock().values().map(VecDeque::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl EventListener for DeviceEventBuffer {
    fn name(&self) -> &str {
        &self.name
    }

    fn handle(&self, event: &EventRecord) -> Result<(), ListenerError> {
        let mut map = self.lock();
        let q = map.entry(event.event_type).or_default();
        if q.len() == self.capacity {
            q.pop_front();
        }
        q.push_back(event.clone());
        Ok(())
    }
}

const CORE_RPC: [&str; 6] = [
    "getEvents",
    "clearEvents",
    "enableEventReporting",
    "isReportingEvents",
    "getConfiguration",
    "getName",
];

/// A configured, monitored device.
pub struct Device {
    record: DeviceRecord,
    config: DeviceConfig,
    backend: Mutex<Box<dyn DeviceBackend>>,
    native: Arc<NativeEventQueue>,
    reporting: Arc<AtomicBool>,
    schemas: HashMap<EventTypeId, Arc<EventSchema>>,
    listeners: Mutex<ListenerTable>,
    buffer: Arc<DeviceEventBuffer>,
}

impl fmt::Debug for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Device")
            .field("name", &self.record.name)
            .field("class", &self.record.class_name)
            .field("reporting", &self.is_reporting())
            .finish()
    }
}

impl Device {
    /// Wire up a backend. `schemas` are the event types this device emits.
    pub fn new(
        record: DeviceRecord,
        config: DeviceConfig,
        mut backend: Box<dyn DeviceBackend>,
        schemas: HashMap<EventTypeId, Arc<EventSchema>>,
    ) -> Arc<Self> {
        let native = Arc::new(NativeEventQueue::new(record.event_buffer_length));
        let reporting = Arc::new(AtomicBool::new(config.auto_report_events));
        backend.attach(NativeEventSink {
            queue: native.clone(),
            reporting: reporting.clone(),
        });

        let buffer = Arc::new(DeviceEventBuffer::new(&record.name, record.event_buffer_length));
        let mut listeners = ListenerTable::new();
        let mut types: Vec<EventTypeId> = schemas.keys().copied().collect();
        types.sort();
        for t in types {
            listeners.add(t, buffer.clone());
        }

        Arc::new(Self {
            record,
            config,
            backend: Mutex::new(backend),
            native,
            reporting,
            schemas,
            listeners: Mutex::new(listeners),
            buffer,
        })
    }

    pub fn name(&self) -> &str {
        &self.record.name
    }

    pub fn record(&self) -> &DeviceRecord {
        &self.record
    }

    pub fn config(&self) -> &DeviceConfig {
        &self.config
    }

    pub fn sink(&self) -> NativeEventSink {
        NativeEventSink {
            queue: self.native.clone(),
            reporting: self.reporting.clone(),
        }
    }

    /// Event types this device emits, ascending.
    pub fn event_types(&self) -> Vec<EventTypeId> {
        let mut types: Vec<EventTypeId> = self.schemas.keys().copied().collect();
        types.sort();
        types
    }

    pub fn schema(&self, event_type: EventTypeId) -> Option<&Arc<EventSchema>> {
        self.schemas.get(&event_type)
    }

    pub fn poll_interval(&self) -> Option<Duration> {
        self.config.poll_interval.map(Duration::from_secs_f64)
    }

    pub fn is_reporting(&self) -> bool {
        self.reporting.load(Ordering::Acquire)
    }

    /// Switch reporting; returns the previous state.
    pub fn enable_reporting(&self, enabled: bool) -> bool {
        let previous = self.reporting.swap(enabled, Ordering::AcqRel);
        if previous != enabled {
            log::info!("device '{}' reporting {}", self.name(), if enabled { "on" } else { "off" });
        }
        previous
    }

    pub fn push_native(&self, data: Value) -> bool {
        self.sink().push(data)
    }

    pub fn native_len(&self) -> usize {
        self.native.len()
    }

    pub fn native_dropped(&self) -> u64 {
        self.native.dropped()
    }

    /// Snapshot-then-clear of the native queue.
    pub fn drain_native(&self) -> Vec<NativeEvent> {
        self.native.drain()
    }

    fn backend(&self) -> MutexGuard<'_, Box<dyn DeviceBackend>> {
        self.backend.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn poll(&self) -> Result<(), DeviceBackendError> {
        let sink = self.sink();
        self.backend().poll(&sink)
    }

    pub fn to_canonical(&self, raw: &NativeEvent) -> Result<Option<EventRecord>, DeviceBackendError> {
        let ctx = ConvertCtx::new(&self.record, &self.schemas);
        self.backend().to_canonical(raw, &ctx)
    }

    pub fn message_pump(&self) -> Option<Box<dyn ScheduledUnit>> {
        self.backend().message_pump()
    }

    pub fn close(&self) -> Result<(), DeviceBackendError> {
        self.enable_reporting(false);
        self.native.clear();
        let dropped = self.native_dropped();
        if dropped > 0 {
            log::warn!("device '{}' dropped {} native events on overflow", self.name(), dropped);
        }
        self.backend().close()
    }

    /// Register `listener` for one event type. Ignored for types the device does not emit.
    pub fn add_listener(&self, event_type: EventTypeId, listener: Arc<dyn EventListener>) -> Option<ListenerId> {
        if !self.schemas.contains_key(&event_type) {
            return None;
        }
        Some(self.listeners().add(event_type, listener))
    }

    /// Register `listener` for every type the device emits.
    pub fn add_listener_all(&self, listener: Arc<dyn EventListener>) -> Vec<ListenerId> {
        let mut table = self.listeners();
        self.event_types()
            .into_iter()
            .map(|t| table.add(t, listener.clone()))
            .collect()
    }

    pub fn remove_listener(&self, id: ListenerId) -> bool {
        self.listeners().remove(id)
    }

    fn listeners(&self) -> MutexGuard<'_, ListenerTable> {
        self.listeners.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Hand `event` to every listener for its type. Returns the failure count.
    pub fn notify(&self, event: &EventRecord) -> usize {
        let targets = self.listeners().listeners_for(event.event_type);
        notify_all(&targets, event)
    }

    pub fn get_events(&self, event_type: Option<EventTypeId>, clear: bool) -> Vec<EventRecord> {
        self.buffer.get(event_type, clear)
    }

    /// Empty both the canonical buffer and any native events not yet dispatched.
    pub fn clear_events(&self) {
        self.native.clear();
        self.buffer.clear();
    }

    /// Every method name [`rpc`](Self::rpc) accepts, core methods first.
    pub fn rpc_methods(&self) -> Vec<String> {
        let mut methods: Vec<String> = CORE_RPC.iter().map(|m| m.to_string()).collect();
        methods.extend(self.backend().rpc_methods().iter().map(|m| m.to_string()));
        methods
    }

    /// Device-level RPC.
    ///
    /// The core answers `getEvents`, `clearEvents`, `enableEventReporting`,
    /// `isReportingEvents`, `getConfiguration` and `getName`; other names go
    /// to the backend's method table.
    pub fn rpc(&self, method: &str, args: &[Value]) -> Result<Value, RpcError> {
        let runtime = |exception: String| RpcError::DeviceRuntime {
            device: self.name().to_string(),
            method: method.to_string(),
            args: Value::Array(args.to_vec()),
            exception,
        };
        match method {
            "getEvents" => {
                let event_type = match args.first() {
                    None | Some(Value::Null) => None,
                    Some(v) => Some(self.resolve_event_type(v).ok_or_else(|| {
                        runtime(format!("device does not emit event type {}", v))
                    })?),
                };
                let clear = args.get(1).and_then(Value::as_bool).unwrap_or(true);
                let events = self.get_events(event_type, clear);
                Ok(Value::Array(
                    events.iter().map(|e| Value::Array(e.as_tuple())).collect(),
                ))
            }
            "clearEvents" => {
                self.clear_events();
                Ok(Value::Null)
            }
            "enableEventReporting" => {
                let enabled = args
                    .first()
                    .and_then(Value::as_bool)
                    .ok_or_else(|| runtime("expected one bool argument".to_string()))?;
                Ok(Value::Bool(self.enable_reporting(enabled)))
            }
            "isReportingEvents" => Ok(Value::Bool(self.is_reporting())),
            "getConfiguration" => Ok(self.config.as_json()),
            "getName" => Ok(Value::String(self.name().to_string())),
            _ => {
                let sink = self.sink();
                let mut backend = self.backend();
                if !backend.rpc_methods().iter().any(|m| *m == method) {
                    return Err(RpcError::DeviceMethod {
                        device: self.name().to_string(),
                        method: method.to_string(),
                    });
                }
                backend.call(method, args, &sink).map_err(|e| runtime(e.to_string()))
            }
        }
    }

    fn resolve_event_type(&self, v: &Value) -> Option<EventTypeId> {
        let id = match v {
            Value::Number(n) => EventTypeId(u8::try_from(n.as_u64()?).ok()?),
            Value::String(s) => crate::constants::event_type_by_name(s)?,
            _ => return None,
        };
        self.schemas.contains_key(&id).then_some(id)
    }
}
