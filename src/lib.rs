//! Cross-process input event hub.
//!
//! Devices push or are polled for native events, which the dispatcher turns
//! into canonical, schema-described [`EventRecord`]s stamped on one shared
//! [`clock`]. Listeners fan the events out to a global buffer served over UDP,
//! per-device buffers and an optional data store.

pub mod backends;
pub mod clock;
pub mod config;
pub mod constants;
pub mod datastore;
pub mod device;
pub mod dispatcher;
pub mod error;
pub mod event;
pub mod eventbus;
pub mod filtered_listener;
pub mod hub;
pub mod logger;
pub mod record;
pub mod registry;
pub mod scheduler;
pub mod session;
pub mod transport;

pub use device::{Device, DeviceBackend, NativeEvent, NativeEventSink};
pub use error::{ErrorKind, HubError};
pub use event::{EventRecord, EventSchema, FieldType, FieldValue};
pub use eventbus::EventListener;
pub use hub::Hub;
