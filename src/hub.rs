//! The hub process core.
//!
//! A [`Hub`] owns the monitored devices, the global event buffer, the optional
//! data store and the session ids. [`Hub::run`] binds the request socket,
//! schedules every device together with the dispatcher, and serves requests
//! until a `STOP_IOHUB_SERVER` request or the `shutDown` RPC arrives.
//!
//! Startup order:
//!
//! 1. publish the registry and session state;
//! 2. open the data store, if enabled (failure is fatal);
//! 3. create the Experiment device (always present, always first);
//! 4. create every configured device (a bad entry only loses that device).

use crate::backends::experiment::{self, log_native};
use crate::clock;
use crate::config::{parse_defaults, DeviceConfig, HubConfig, HubSettings};
use crate::datastore::{ConditionTable, ExperimentInfo, PersistenceListener, PersistenceSink, SessionInfo, TableStore};
use crate::device::{Device, DeviceBackend, DeviceList, NativeEventSink};
use crate::dispatcher::{Dispatcher, GlobalEventBuffer};
use crate::error::{ConfigurationError, HubError, RpcError, StoreError};
use crate::logger::{EventLogger, BACKLOG};
use crate::record::DeviceRecord;
use crate::registry::{self, DeviceClass, Registry};
use crate::scheduler::{MessagePump, Scheduler};
use crate::session::{self, SessionState};
use crate::transport::protocol::{Request, Response};
use crate::transport::server::{RequestHandler, TransportServer};
use serde::de::DeserializeOwned;
use serde_json::{json, Map, Value};
use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::sync::watch;

/// Period of the task that moves backlog log lines into the Experiment device.
pub const LOG_FORWARD_INTERVAL: Duration = Duration::from_millis(50);

/// Hub attributes that exist but cannot be called over RPC.
const NOT_CALLABLE: [(&str, &str); 3] = [
    ("eventBuffer", "GlobalEventBuffer"),
    ("config", "HubConfig"),
    ("devices", "DeviceList"),
];

pub struct Hub {
    settings: HubSettings,
    registry: Arc<Registry>,
    session: Arc<SessionState>,
    devices: DeviceList,
    global: Arc<GlobalEventBuffer>,
    store: Option<Arc<dyn PersistenceSink>>,
    dispatcher: Dispatcher,
    scheduler: Mutex<Scheduler>,
    runtime: Mutex<Option<Handle>>,
    stop: watch::Sender<bool>,
    next_device_id: AtomicU16,
    experiment_info: Mutex<Option<ExperimentInfo>>,
    session_info: Mutex<Option<SessionInfo>>,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

impl Hub {
    /// Build a hub from its configuration, opening the configured data store.
    pub fn start(config: HubConfig) -> Result<Arc<Hub>, HubError> {
        let store: Option<Arc<dyn PersistenceSink>> = if config.data_store.enable {
            let store = TableStore::open(&config.data_store.directory)?;
            log::info!("data store open at {}", store.dir().display());
            Some(Arc::new(store))
        } else {
            None
        };
        Self::with_store(config, store)
    }

    /// Build a hub persisting to `store` instead of the configured data store.
    pub fn with_store(config: HubConfig, store: Option<Arc<dyn PersistenceSink>>) -> Result<Arc<Hub>, HubError> {
        config.hub.validate()?;
        let registry = Arc::new(Registry::builtin()?);
        registry::init(registry.clone());
        let session = Arc::new(SessionState::new());
        session::init(session.clone());

        let devices = DeviceList::default();
        let dispatcher = Dispatcher::new(
            devices.clone(),
            session.clone(),
            Duration::from_secs_f64(config.hub.dispatch_interval),
        );
        let (stop, _) = watch::channel(false);
        let hub = Arc::new(Hub {
            global: Arc::new(GlobalEventBuffer::new(config.hub.global_event_buffer)),
            settings: config.hub.clone(),
            registry,
            session,
            devices,
            store,
            dispatcher,
            scheduler: Mutex::new(Scheduler::new()),
            runtime: Mutex::new(None),
            stop,
            next_device_id: AtomicU16::new(0),
            experiment_info: Mutex::new(None),
            session_info: Mutex::new(None),
        });

        let experiment_config = config
            .monitor_devices
            .iter()
            .find(|d| d.class == experiment::CLASS_NAME)
            .map(|d| Value::Object(d.config.clone()));
        hub.create_experiment_device(experiment_config)?;

        for entry in config.monitor_devices.iter().filter(|d| d.class != experiment::CLASS_NAME) {
            match hub.create_monitored_device(&entry.class, &Value::Object(entry.config.clone())) {
                Ok(_) => {}
                Err(e) => log::error!("{} device not started: {}", entry.class, e),
            }
        }
        Ok(hub)
    }

    fn create_experiment_device(&self, user: Option<Value>) -> Result<Arc<Device>, HubError> {
        let user = user.unwrap_or_else(|| json!({}));
        let (class, cfg) = match self.resolve(experiment::CLASS_NAME, &user) {
            Ok(resolved) => resolved,
            Err(e) => {
                log::error!("experiment device config rejected, using defaults: {}", e);
                self.resolve(experiment::CLASS_NAME, &json!({}))?
            }
        };
        let backend = (class.factory)(&cfg)?;
        self.install(&class, cfg, backend)
    }

    fn resolve(&self, class_name: &str, user: &Value) -> Result<(DeviceClass, DeviceConfig), HubError> {
        let class = self.registry.device_class(class_name)?.clone();
        let defaults = parse_defaults(class.class_name, class.defaults)?;
        let cfg = DeviceConfig::resolve(class.class_name, &defaults, user)?;
        Ok((class, cfg))
    }

    /// Configure and start monitoring a device of `class_name`.
    ///
    /// `Ok(None)` when the merged configuration has `enable = false`.
    pub fn create_monitored_device(&self, class_name: &str, user: &Value) -> Result<Option<Arc<Device>>, HubError> {
        let (class, cfg) = self.resolve(class_name, user)?;
        if !cfg.enable {
            log::info!("device '{}' ({}) is disabled", cfg.name, class_name);
            return Ok(None);
        }
        let backend = (class.factory)(&cfg)?;
        self.install(&class, cfg, backend).map(Some)
    }

    /// Like [`create_monitored_device`](Self::create_monitored_device), with a
    /// backend the caller already built (and may hold a feed for).
    pub fn attach_device(
        &self,
        class_name: &str,
        user: &Value,
        backend: Box<dyn DeviceBackend>,
    ) -> Result<Arc<Device>, HubError> {
        let (class, cfg) = self.resolve(class_name, user)?;
        self.install(&class, cfg, backend)
    }

    fn install(
        &self,
        class: &DeviceClass,
        cfg: DeviceConfig,
        backend: Box<dyn DeviceBackend>,
    ) -> Result<Arc<Device>, HubError> {
        let schemas = self.registry.schemas_for(class, &cfg.monitor_event_types)?;
        let device = {
            let mut devices = self.devices_mut();
            if devices.iter().any(|d| d.name() == cfg.name) {
                return Err(ConfigurationError::DuplicateName(cfg.name).into());
            }
            let record = DeviceRecord {
                name: cfg.name.clone(),
                device_id: self.next_device_id.fetch_add(1, Ordering::Relaxed),
                device_number: cfg.device_number,
                category: class.category,
                type_id: class.type_id,
                class_name: class.class_name.to_string(),
                event_buffer_length: cfg.event_buffer_length,
                meta: cfg.meta.clone(),
            };
            let (stream, save) = (cfg.stream_events, cfg.save_events);
            let device = Device::new(record, cfg, backend, schemas);

            if stream {
                device.add_listener_all(self.global.clone());
            }
            if let (true, Some(store)) = (save, &self.store) {
                for t in device.event_types() {
                    if let Some(schema) = device.schema(t) {
                        store.register_schema(schema)?;
                    }
                }
                device.add_listener_all(Arc::new(PersistenceListener::new(store.clone())));
            }
            if self.settings.log_events {
                device.add_listener_all(Arc::new(EventLogger::new()));
            }
            devices.push(device.clone());
            device
        };
        log::info!("monitoring {}", device.record());
        self.schedule(&device);
        Ok(device)
    }

    /// Start the device's monitors if the hub is already running.
    fn schedule(&self, device: &Arc<Device>) {
        let runtime = lock(&self.runtime).clone();
        if let Some(handle) = runtime {
            let _guard = handle.enter();
            lock(&self.scheduler).add_device(device);
        }
    }

    fn devices_mut(&self) -> RwLockWriteGuard<'_, Vec<Arc<Device>>> {
        self.devices.write().unwrap_or_else(|e| e.into_inner())
    }

    fn devices_ref(&self) -> RwLockReadGuard<'_, Vec<Arc<Device>>> {
        self.devices.read().unwrap_or_else(|e| e.into_inner())
    }

    /// Every monitored device, in registration order.
    pub fn devices(&self) -> Vec<Arc<Device>> {
        self.devices_ref().clone()
    }

    /// Device by name, or else the first device of that class.
    pub fn device(&self, name: &str) -> Option<Arc<Device>> {
        let devices = self.devices_ref();
        devices
            .iter()
            .find(|d| d.name() == name)
            .or_else(|| devices.iter().find(|d| d.record().class_name == name))
            .cloned()
    }

    pub fn experiment_device(&self) -> Option<Arc<Device>> {
        self.devices_ref()
            .iter()
            .find(|d| d.record().class_name == experiment::CLASS_NAME)
            .cloned()
    }

    pub fn device_names(&self) -> Vec<String> {
        self.devices_ref().iter().map(|d| d.name().to_string()).collect()
    }

    pub fn settings(&self) -> &HubSettings {
        &self.settings
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    pub fn session(&self) -> &Arc<SessionState> {
        &self.session
    }

    pub fn global_buffer(&self) -> &Arc<GlobalEventBuffer> {
        &self.global
    }

    /// Run one dispatcher pass outside the scheduler.
    pub fn dispatch_once(&self) -> usize {
        self.dispatcher.tick()
    }

    pub fn clear_event_buffer(&self) {
        self.global.clear();
    }

    /// Record the experiment and, with a data store, assign its id.
    pub fn set_experiment_info(&self, info: ExperimentInfo) -> Result<Option<u32>, StoreError> {
        let id = match &self.store {
            Some(store) => {
                let id = store.create_experiment(&info)?;
                self.session.set_experiment_id(id);
                log::info!("current experiment id: {}", id);
                Some(id)
            }
            None => None,
        };
        *lock(&self.experiment_info) = Some(info);
        Ok(id)
    }

    /// Record the session and, with a data store, assign its id.
    pub fn create_session_entry(&self, info: SessionInfo) -> Result<Option<u32>, StoreError> {
        let id = match &self.store {
            Some(store) => {
                let id = store.create_session(self.session.experiment_id(), &info)?;
                self.session.set_session_id(id);
                log::info!("current session id: {}", id);
                Some(id)
            }
            None => None,
        };
        *lock(&self.session_info) = Some(info);
        Ok(id)
    }

    pub fn experiment_info(&self) -> Option<ExperimentInfo> {
        lock(&self.experiment_info).clone()
    }

    pub fn session_info(&self) -> Option<SessionInfo> {
        lock(&self.session_info).clone()
    }

    pub fn session_code_exists(&self, code: &str) -> Result<bool, StoreError> {
        match &self.store {
            Some(store) => store.session_code_exists(code),
            None => Ok(false),
        }
    }

    /// `false` when no data store is open.
    pub fn flush_data_store(&self) -> Result<bool, StoreError> {
        match &self.store {
            Some(store) => store.flush().map(|_| true),
            None => Ok(false),
        }
    }

    /// Start the condition-variable table of `experiment_id`. `false` when no
    /// data store is open.
    pub fn init_condition_table(&self, experiment_id: u32, columns: Vec<String>) -> Result<bool, StoreError> {
        match &self.store {
            Some(store) => store
                .init_condition_table(ConditionTable::new(experiment_id, columns)?)
                .map(|_| true),
            None => Ok(false),
        }
    }

    /// Append one condition row: `index_id` then one value per column.
    /// `false` when no data store is open.
    pub fn add_condition_row(&self, session_id: u32, values: &[Value]) -> Result<bool, StoreError> {
        match &self.store {
            Some(store) => store.add_condition_row(session_id, values).map(|_| true),
            None => Ok(false),
        }
    }

    /// Move held log lines into the Experiment device as LOG events.
    ///
    /// Does nothing until a session id has been assigned.
    pub fn forward_log_backlog(&self) -> usize {
        match self.experiment_device() {
            Some(exp) => forward_backlog(&exp.sink(), &self.session),
            None => 0,
        }
    }

    /// Hub-level RPC, restricted to the allow-listed methods.
    pub fn call_rpc(&self, method: &str, args: &[Value]) -> Result<Value, RpcError> {
        let runtime = |exception: String| RpcError::Runtime {
            method: method.to_string(),
            args: Value::Array(args.to_vec()),
            exception,
        };
        let optional_id = |id: Option<u32>| id.map_or(Value::Bool(false), Value::from);
        match method {
            "getTime" => Ok(json!(clock::now())),
            "clearEventBuffer" => {
                self.clear_event_buffer();
                Ok(Value::Bool(true))
            }
            "setExperimentInfo" => {
                let info = arg_as::<ExperimentInfo>(args, 0).map_err(runtime)?;
                self.set_experiment_info(info)
                    .map(optional_id)
                    .map_err(|e| runtime(e.to_string()))
            }
            "createExperimentSessionEntry" => {
                let info = arg_as::<SessionInfo>(args, 0).map_err(runtime)?;
                self.create_session_entry(info)
                    .map(optional_id)
                    .map_err(|e| runtime(e.to_string()))
            }
            "checkIfSessionCodeExists" => {
                let code = arg_as::<String>(args, 0).map_err(runtime)?;
                self.session_code_exists(&code)
                    .map(Value::Bool)
                    .map_err(|e| runtime(e.to_string()))
            }
            "flushIODataStoreFile" => self
                .flush_data_store()
                .map(Value::Bool)
                .map_err(|e| runtime(e.to_string())),
            "initializeConditionVariableTable" => {
                let experiment_id = arg_as::<u32>(args, 0).map_err(runtime)?;
                let columns = args
                    .get(2)
                    .ok_or_else(|| "missing column list".to_string())
                    .and_then(condition_columns)
                    .map_err(runtime)?;
                self.init_condition_table(experiment_id, columns)
                    .map(Value::Bool)
                    .map_err(|e| runtime(e.to_string()))
            }
            "addRowToConditionVariableTable" => {
                let session_id = arg_as::<u32>(args, 0).map_err(runtime)?;
                let values = arg_as::<Vec<Value>>(args, 1).map_err(runtime)?;
                self.add_condition_row(session_id, &values)
                    .map(Value::Bool)
                    .map_err(|e| runtime(e.to_string()))
            }
            "getDeviceNames" => Ok(json!(self.device_names())),
            "shutDown" => {
                self.request_stop();
                Ok(Value::Bool(true))
            }
            _ => match NOT_CALLABLE.iter().find(|(name, _)| *name == method) {
                Some((_, resolved)) => Err(RpcError::NotCallable {
                    method: method.to_string(),
                    resolved: resolved.to_string(),
                }),
                None => Err(RpcError::Attribute {
                    method: method.to_string(),
                }),
            },
        }
    }

    fn target(&self, device: &str) -> Result<Arc<Device>, RpcError> {
        self.device(device).ok_or_else(|| RpcError::DeviceNotFound {
            device: device.to_string(),
        })
    }

    /// Route a device-scoped RPC to the named device.
    pub fn device_rpc(&self, device: &str, method: &str, args: &[Value]) -> Result<Value, RpcError> {
        self.target(device)?.rpc(method, args)
    }

    /// RPC method names of the named device.
    pub fn device_interface(&self, device: &str) -> Result<Vec<String>, RpcError> {
        Ok(self.target(device)?.rpc_methods())
    }

    /// Queue event tuples sent by the Experiment Process.
    pub fn receive_experiment_events(&self, events: Vec<Value>) -> Result<usize, RpcError> {
        let exp = self.experiment_device().ok_or_else(|| RpcError::DeviceNotFound {
            device: experiment::CLASS_NAME.to_string(),
        })?;
        let count = events.len();
        let sink = exp.sink();
        for event in events {
            sink.push(event);
        }
        Ok(count)
    }

    fn add_device_request(&self, class: &str, config: &Value) -> Result<Value, RpcError> {
        let failed = |reason: String| RpcError::AddDevice {
            class: class.to_string(),
            reason,
        };
        match self.create_monitored_device(class, config) {
            Ok(Some(device)) => serde_json::to_value(device.record()).map_err(|e| failed(e.to_string())),
            Ok(None) => Err(failed("device is disabled in its configuration".into())),
            Err(e) => Err(failed(e.to_string())),
        }
    }

    fn events_response(&self) -> Response {
        let events = self.global.take_sorted();
        if events.is_empty() {
            Response::Events(None)
        } else {
            Response::Events(Some(events.iter().map(|e| Value::Array(e.as_tuple())).collect()))
        }
    }

    /// Ask [`run`](Self::run) to stop after the current request.
    pub fn request_stop(&self) {
        self.stop.send_replace(true);
    }

    pub fn is_stopping(&self) -> bool {
        *self.stop.borrow()
    }

    fn start_monitors(&self) {
        *lock(&self.runtime) = Some(Handle::current());
        let mut scheduler = lock(&self.scheduler);
        for device in self.devices() {
            scheduler.add_device(&device);
        }
        scheduler.add(Box::new(self.dispatcher.clone()));
        if let Some(exp) = self.experiment_device() {
            let sink = exp.sink();
            let session = self.session.clone();
            scheduler.add(Box::new(MessagePump::new("log-forwarder", LOG_FORWARD_INTERVAL, move || {
                forward_backlog(&sink, &session);
                Ok(())
            })));
        }
        log::debug!("scheduled: {:?}", scheduler.names());
    }

    /// Bind the configured address and serve until stopped.
    pub async fn run(self: Arc<Self>) -> Result<(), HubError> {
        let addr = format!("{}:{}", self.settings.address, self.settings.udp_port);
        let server = TransportServer::bind(&addr, self.clone(), self.settings.max_packet_size).await?;
        self.serve(server).await
    }

    /// Start every monitor and serve requests on `server` until stopped,
    /// then shut down.
    pub async fn serve(self: Arc<Self>, server: TransportServer) -> Result<(), HubError> {
        self.start_monitors();
        let result = server.run(self.stop.subscribe()).await;
        self.shutdown().await;
        result.map_err(HubError::from)
    }

    /// Stop every monitor, close devices, discard undelivered events and
    /// close the data store.
    pub async fn shutdown(&self) {
        self.request_stop();
        let mut scheduler = {
            let mut guard = lock(&self.scheduler);
            std::mem::take(&mut *guard)
        };
        scheduler.stop_all().await;
        *lock(&self.runtime) = None;

        for device in self.devices() {
            if let Err(e) = device.close() {
                log::warn!("{}", e);
            }
        }
        let discarded = self.global.len();
        self.global.clear();
        if discarded > 0 {
            log::debug!("discarded {} undelivered events", discarded);
        }
        if let Some(store) = &self.store {
            if let Err(e) = store.flush().and_then(|_| store.close()) {
                log::error!("data store close failed: {}", e);
            }
        }
        registry::shutdown();
        session::shutdown();
        log::info!("hub stopped");
    }
}

impl RequestHandler for Hub {
    fn handle(&self, request: Request) -> Option<Response> {
        let result = match request {
            Request::GetEvents => Ok(self.events_response()),
            Request::Rpc { method, args, kwargs } => self
                .call_rpc(&method, &with_kwargs(args, kwargs))
                .map(|value| Response::RpcResult { method, value }),
            Request::EventTx(events) => self.receive_experiment_events(events).map(Response::EventTxResult),
            Request::DevRpc {
                device,
                method,
                args,
                kwargs,
            } => self
                .device_rpc(&device, &method, &with_kwargs(args, kwargs))
                .map(Response::DevRpcResult),
            Request::GetDeviceList => Ok(Response::DeviceList(
                self.devices_ref().iter().map(|d| d.record().summary()).collect(),
            )),
            Request::AddDevice { class, config } => self.add_device_request(&class, &config).map(Response::DeviceAdded),
            Request::DevInterface { device } => self.device_interface(&device).map(Response::DevInterface),
            Request::Stop => {
                log::info!("stop requested");
                self.request_stop();
                return None;
            }
        };
        Some(result.unwrap_or_else(|e| {
            log::warn!("{}", e);
            Response::error(&e)
        }))
    }
}

/// Keyword arguments travel as one trailing object argument.
fn with_kwargs(mut args: Vec<Value>, kwargs: Map<String, Value>) -> Vec<Value> {
    if !kwargs.is_empty() {
        args.push(Value::Object(kwargs));
    }
    args
}

fn arg_as<T: DeserializeOwned>(args: &[Value], index: usize) -> Result<T, String> {
    let arg = args.get(index).ok_or_else(|| format!("missing argument {}", index))?;
    serde_json::from_value(arg.clone()).map_err(|e| format!("argument {}: {}", index, e))
}

/// Column names from a list of names or `[name, type, ..]` entries.
fn condition_columns(spec: &Value) -> Result<Vec<String>, String> {
    let entries = spec.as_array().ok_or_else(|| "column list must be a list".to_string())?;
    entries
        .iter()
        .map(|entry| {
            let name = match entry {
                Value::String(name) => Some(name.clone()),
                Value::Array(parts) => parts.first().and_then(Value::as_str).map(String::from),
                _ => None,
            };
            name.ok_or_else(|| format!("bad column entry {}", entry))
        })
        .collect()
}

fn forward_backlog(sink: &NativeEventSink, session: &SessionState) -> usize {
    if !session.has_session() {
        return 0;
    }
    let lines = BACKLOG.drain();
    let count = lines.len();
    for line in lines {
        sink.push_at(line.time, log_native(line.level, &line.text, line.time));
    }
    count
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::datastore::MemoryStore;
    use crate::error::ErrorKind;

    fn hub_with(config: &str) -> Arc<Hub> {
        let cfg = HubConfig::from_toml_str(config, std::path::Path::new("test.toml")).unwrap();
        Hub::with_store(cfg, Some(Arc::new(MemoryStore::new()))).unwrap()
    }

    #[test]
    fn experiment_device_is_always_first() {
        let hub = hub_with(
            r#"
[[monitor_devices]]
class = "Keyboard"
"#,
        );
        assert_eq!(hub.device_names(), vec!["experiment", "keyboard"]);
        assert_eq!(hub.experiment_device().unwrap().record().device_id, 0);
        // Startup publishes the process-wide registry and session state.
        assert!(registry::global().unwrap().device_class("Keyboard").is_ok());
        assert!(session::global().is_some());
    }

    #[test]
    fn bad_device_entries_are_skipped() {
        let hub = hub_with(
            r#"
[[monitor_devices]]
class = "Keyboard"
[monitor_devices.config]
event_buffer_length = 0

[[monitor_devices]]
class = "NoSuchDevice"

[[monitor_devices]]
class = "Mouse"
[monitor_devices.config]
enable = false
"#,
        );
        assert_eq!(hub.device_names(), vec!["experiment"]);
    }

    #[test]
    fn duplicate_names_are_rejected() {
        let hub = hub_with("");
        let err = hub.create_monitored_device("Keyboard", &json!({ "name": "experiment" })).unwrap_err();
        assert!(matches!(err, HubError::Configuration(ConfigurationError::DuplicateName(_))));
    }

    #[test]
    fn rpc_allow_list() {
        let hub = hub_with("");
        assert!(hub.call_rpc("getTime", &[]).unwrap().is_f64());
        assert_eq!(hub.call_rpc("getDeviceNames", &[]).unwrap(), json!(["experiment"]));
        assert_eq!(hub.call_rpc("devices", &[]).unwrap_err().kind(), ErrorKind::RpcNotCallable);
        assert_eq!(hub.call_rpc("__del__", &[]).unwrap_err().kind(), ErrorKind::RpcAttribute);
        assert_eq!(
            hub.call_rpc("checkIfSessionCodeExists", &[]).unwrap_err().kind(),
            ErrorKind::RpcRuntime
        );
    }

    #[test]
    fn session_entry_assigns_ids() {
        let hub = hub_with("");
        let exp = hub
            .call_rpc("setExperimentInfo", &[json!({ "code": "E1", "title": "demo" })])
            .unwrap();
        assert_eq!(exp, json!(1));
        let sess = hub
            .call_rpc("createExperimentSessionEntry", &[json!({ "code": "S1" })])
            .unwrap();
        assert_eq!(sess, json!(1));
        assert!(hub.session().has_session());
        assert_eq!(hub.call_rpc("checkIfSessionCodeExists", &[json!("S1")]).unwrap(), json!(true));
        assert_eq!(hub.call_rpc("checkIfSessionCodeExists", &[json!("S2")]).unwrap(), json!(false));
    }

    #[test]
    fn experiment_events_reach_the_global_buffer() {
        let hub = hub_with("");
        let tuple = Value::Array(experiment::message_tuple("hello", "", 0.0, clock::now()));
        let reply = hub.handle(Request::EventTx(vec![tuple])).unwrap();
        assert_eq!(reply, Response::EventTxResult(1));
        assert_eq!(hub.dispatch_once(), 1);

        match hub.handle(Request::GetEvents).unwrap() {
            Response::Events(Some(events)) => {
                assert_eq!(events.len(), 1);
                assert_eq!(events[0][4], json!(crate::constants::event_type::MESSAGE.0));
            }
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(hub.handle(Request::GetEvents).unwrap(), Response::Events(None));
    }

    #[test]
    fn unknown_device_is_a_device_error() {
        let hub = hub_with("");
        let reply = hub
            .handle(Request::DevRpc {
                device: "tracker".into(),
                method: "getEvents".into(),
                args: vec![],
                kwargs: Map::new(),
            })
            .unwrap();
        match reply {
            Response::Error { kind, .. } => assert_eq!(kind, ErrorKind::DeviceNotFound),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn device_interface_lists_core_and_backend_methods() {
        let hub = hub_with(
            r#"
[[monitor_devices]]
class = "Mouse"
"#,
        );
        match hub.handle(Request::DevInterface { device: "mouse".into() }).unwrap() {
            Response::DevInterface(methods) => {
                assert_eq!(methods[0], "getEvents");
                assert!(methods.iter().any(|m| m == "getName"));
                assert!(methods.len() > 6);
            }
            other => panic!("unexpected {:?}", other),
        }
        // Class names resolve like device names.
        assert!(hub.device_interface("Mouse").is_ok());
        match hub.handle(Request::DevInterface { device: "tracker".into() }).unwrap() {
            Response::Error { kind, .. } => assert_eq!(kind, ErrorKind::DeviceNotFound),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn condition_variable_rpcs() {
        let store = Arc::new(MemoryStore::new());
        let hub = Hub::with_store(HubConfig::default(), Some(store.clone())).unwrap();
        let add = |args: &[Value]| hub.call_rpc("addRowToConditionVariableTable", args);
        assert_eq!(add(&[json!(1), json!([0, "RED"])]).unwrap_err().kind(), ErrorKind::RpcRuntime);

        let columns = json!([["word", "|S16"], ["rt", "f4"]]);
        assert_eq!(
            hub.call_rpc("initializeConditionVariableTable", &[json!(1), json!(1), columns])
                .unwrap(),
            json!(true)
        );
        assert_eq!(add(&[json!(1), json!([0, "RED", 0.45])]).unwrap(), json!(true));
        assert_eq!(add(&[json!(1), json!([1, "RED"])]).unwrap_err().kind(), ErrorKind::RpcRuntime);
        assert_eq!(
            store.condition_rows(),
            vec![json!({ "session_id": 1, "index_id": 0, "word": "RED", "rt": 0.45 })]
        );

        let bare = Hub::with_store(HubConfig::default(), None).unwrap();
        assert_eq!(
            bare.call_rpc("initializeConditionVariableTable", &[json!(1), json!(1), json!(["a"])])
                .unwrap(),
            json!(false)
        );
        assert_eq!(
            bare.call_rpc("addRowToConditionVariableTable", &[json!(1), json!([0, 1])])
                .unwrap(),
            json!(false)
        );
    }

    #[test]
    fn stop_request_has_no_reply() {
        let hub = hub_with("");
        assert!(hub.handle(Request::Stop).is_none());
        assert!(hub.is_stopping());
    }
}
