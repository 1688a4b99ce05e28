//! Error types.
//!
//! Each concern of the hub has its own error enum. Only two failures are fatal
//! to the whole process (socket bind and persistence store open); everything
//! else is isolated to one device, one listener or one request.
//!
//! Errors that travel to the Experiment Process are rendered as tagged tuples
//! `[ERROR_KIND, message, {context}]`; [`ErrorKind`] holds the wire tags.

use serde_json::{json, Value};
use std::path::PathBuf;
use thiserror::Error;

/// Wire tag carried in the first slot of an error response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    Configuration,
    Registration,
    RpcAttribute,
    RpcNotCallable,
    RpcRuntime,
    DeviceNotFound,
    DeviceMethod,
    DeviceRuntime,
    RequestTypeNotSupported,
    DeviceRequestTypeNotSupported,
    AddDevice,
    GetEvents,
    RequestDecode,
    TransportResponse,
}

impl ErrorKind {
    pub const ALL: [ErrorKind; 14] = [
        ErrorKind::Configuration,
        ErrorKind::Registration,
        ErrorKind::RpcAttribute,
        ErrorKind::RpcNotCallable,
        ErrorKind::RpcRuntime,
        ErrorKind::DeviceNotFound,
        ErrorKind::DeviceMethod,
        ErrorKind::DeviceRuntime,
        ErrorKind::RequestTypeNotSupported,
        ErrorKind::DeviceRequestTypeNotSupported,
        ErrorKind::AddDevice,
        ErrorKind::GetEvents,
        ErrorKind::RequestDecode,
        ErrorKind::TransportResponse,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Configuration => "CONFIGURATION_ERROR",
            ErrorKind::Registration => "REGISTRATION_ERROR",
            ErrorKind::RpcAttribute => "RPC_ATTRIBUTE_ERROR",
            ErrorKind::RpcNotCallable => "RPC_NOT_CALLABLE_ERROR",
            ErrorKind::RpcRuntime => "RPC_RUNTIME_ERROR",
            ErrorKind::DeviceNotFound => "IOHUB_DEVICE_ERROR",
            ErrorKind::DeviceMethod => "IOHUB_DEVICE_METHOD_ERROR",
            ErrorKind::DeviceRuntime => "RPC_DEVICE_RUNTIME_ERROR",
            ErrorKind::RequestTypeNotSupported => "RPC_TYPE_NOT_SUPPORTED_ERROR",
            ErrorKind::DeviceRequestTypeNotSupported => "DEVICE_RPC_TYPE_NOT_SUPPORTED_ERROR",
            ErrorKind::AddDevice => "ADD_DEVICE_ERROR",
            ErrorKind::GetEvents => "IOHUB_GET_EVENTS_ERROR",
            ErrorKind::RequestDecode => "IOHUB_REQUEST_DECODE_ERROR",
            ErrorKind::TransportResponse => "IOHUB_SERVER_RESPONSE_ERROR",
        }
    }

    pub fn from_tag(tag: &str) -> Option<ErrorKind> {
        ErrorKind::ALL.iter().copied().find(|k| k.as_str() == tag)
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Bad or missing device/hub configuration. Fatal to that device only.
#[derive(Debug, Error)]
pub enum ConfigurationError {
    #[error("device '{device}': missing required setting '{key}'")]
    MissingKey { device: String, key: String },

    #[error("device '{device}': unknown setting '{key}'")]
    UnknownKey { device: String, key: String },

    #[error("device '{device}': setting '{key}' expects {expected}, got {given}")]
    TypeMismatch {
        device: String,
        key: String,
        expected: &'static str,
        given: String,
    },

    #[error("device '{device}': setting '{key}' = {given} is outside [{min}, {max}]")]
    OutOfRange {
        device: String,
        key: String,
        min: f64,
        max: f64,
        given: f64,
    },

    #[error("device name '{0}' is already in use")]
    DuplicateName(String),

    #[error("device class '{class}' has invalid defaults: {source}")]
    Defaults {
        class: String,
        source: toml::de::Error,
    },

    #[error("failed to read config {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to parse config {path}: {source}")]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
}

/// A device or event type was not found in the registry.
#[derive(Debug, Error)]
pub enum RegistrationError {
    #[error("device class '{0}' is not registered")]
    UnknownDeviceClass(String),

    #[error("device class '{class}' declares event type '{event}' which is not registered")]
    UnknownEventType { class: String, event: String },

    #[error("event type id {0} is not registered")]
    UnknownEventTypeId(u8),

    #[error("event type id {0} is registered twice")]
    DuplicateEventType(u8),

    #[error("device class '{0}' is registered twice")]
    DuplicateDeviceClass(String),

    #[error("registry has not been initialised")]
    NotInitialized,
}

/// An event tuple or fixed-layout record does not match its schema.
#[derive(Debug, Error)]
#[error("event type {type_id}: {reason}")]
pub struct RecordError {
    pub type_id: u8,
    pub reason: String,
}

impl RecordError {
    pub fn new(type_id: u8, reason: impl Into<String>) -> Self {
        Self {
            type_id,
            reason: reason.into(),
        }
    }
}

/// A device's `poll`, conversion or close call failed.
#[derive(Debug, Error)]
pub enum DeviceBackendError {
    #[error("device '{device}' poll failed: {message}")]
    Poll { device: String, message: String },

    #[error("device '{device}' could not convert native event: {message}")]
    Convert { device: String, message: String },

    #[error("device '{device}' failed to close: {message}")]
    Close { device: String, message: String },

    #[error("device '{device}' method '{method}' failed: {message}")]
    Call {
        device: String,
        method: String,
        message: String,
    },
}

/// A listener failed to handle one event.
#[derive(Debug, Error)]
#[error("listener '{listener}' failed: {message}")]
pub struct ListenerError {
    pub listener: String,
    pub message: String,
}

impl ListenerError {
    pub fn new(listener: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            listener: listener.into(),
            message: message.into(),
        }
    }
}

/// Failure of one RPC call. Always reported to the caller; the hub keeps running.
#[derive(Debug, Error)]
pub enum RpcError {
    #[error("The method name referenced could not be found by the RPC server.")]
    Attribute { method: String },

    #[error("The method name given is not callable (it is not a method).")]
    NotCallable { method: String, resolved: String },

    #[error("An error occurred on the ioHub Server while evaluating an RPC request")]
    Runtime {
        method: String,
        args: Value,
        exception: String,
    },

    #[error("An instance of the ioHub Device class provided is not enabled on the ioHub Server")]
    DeviceNotFound { device: String },

    #[error("Device {device} does not have a method called {method}")]
    DeviceMethod { device: String, method: String },

    #[error("An error occurred on the ioHub Server while evaluating a Device RPC request")]
    DeviceRuntime {
        device: String,
        method: String,
        args: Value,
        exception: String,
    },

    #[error("The request type provided is not recognized by the ioHub Server.")]
    UnsupportedRequest { request_type: String },

    #[error("The device RPC request type provided is not recognized by the ioHub Server.")]
    UnsupportedDeviceRequest { request_type: String },

    #[error("An error occurred on the ioHub Server while adding a device to be monitored.")]
    AddDevice { class: String, reason: String },

    #[error("The request could not be decoded by the ioHub Server.")]
    Decode { reason: String },
}

impl RpcError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            RpcError::Attribute { .. } => ErrorKind::RpcAttribute,
            RpcError::NotCallable { .. } => ErrorKind::RpcNotCallable,
            RpcError::Runtime { .. } => ErrorKind::RpcRuntime,
            RpcError::DeviceNotFound { .. } => ErrorKind::DeviceNotFound,
            RpcError::DeviceMethod { .. } => ErrorKind::DeviceMethod,
            RpcError::DeviceRuntime { .. } => ErrorKind::DeviceRuntime,
            RpcError::UnsupportedRequest { .. } => ErrorKind::RequestTypeNotSupported,
            RpcError::UnsupportedDeviceRequest { .. } => ErrorKind::DeviceRequestTypeNotSupported,
            RpcError::AddDevice { .. } => ErrorKind::AddDevice,
            RpcError::Decode { .. } => ErrorKind::RequestDecode,
        }
    }

    /// Context fields sent along with the message in the error tuple.
    pub fn context(&self) -> Value {
        match self {
            RpcError::Attribute { method } => json!({ "method_name": method }),
            RpcError::NotCallable { method, resolved } => {
                json!({ "method_name": method, "resolved_result": resolved })
            }
            RpcError::Runtime {
                method,
                args,
                exception,
            } => json!({ "method_name": method, "args": args, "exception": exception }),
            RpcError::DeviceNotFound { device } => json!({ "device": device }),
            RpcError::DeviceMethod { device, method } => {
                json!({ "device": device, "dmethod": method })
            }
            RpcError::DeviceRuntime {
                device,
                method,
                args,
                exception,
            } => json!({ "device": device, "dmethod": method, "args": args, "exception": exception }),
            RpcError::UnsupportedRequest { request_type }
            | RpcError::UnsupportedDeviceRequest { request_type } => {
                json!({ "request_type": request_type })
            }
            RpcError::AddDevice { class, reason } => json!({ "device": class, "reason": reason }),
            RpcError::Decode { reason } => json!({ "reason": reason }),
        }
    }
}

/// Socket or wire-format failure.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("failed to bind UDP socket on {addr}: {source}")]
    Bind {
        addr: String,
        source: std::io::Error,
    },

    #[error("socket I/O failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to encode message: {0}")]
    Encode(#[from] rmp_serde::encode::Error),

    #[error("failed to decode message: {0}")]
    Decode(#[from] rmp_serde::decode::Error),

    #[error("malformed message: {0}")]
    Malformed(String),

    #[error("multipacket response incomplete: expected {expected} fragments, received {received}")]
    IncompleteMultipacket { expected: usize, received: usize },

    #[error("request of {size} bytes exceeds the {max} byte packet limit")]
    RequestTooLarge { size: usize, max: usize },

    #[error("hub answered {kind}: {message}")]
    Remote {
        kind: ErrorKind,
        message: String,
        context: Value,
    },
}

/// Persistence store failure.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("failed to open data store at {path}: {source}")]
    Open {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("data store I/O failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to serialize data store metadata: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("no schema registered for event type id {0}")]
    UnknownSchema(u8),

    #[error("event does not match its table layout: {0}")]
    Layout(#[from] RecordError),

    #[error("condition variable table: {0}")]
    ConditionTable(String),

    #[error("data store is closed")]
    Closed,
}

/// Top-level hub error.
#[derive(Debug, Error)]
pub enum HubError {
    #[error(transparent)]
    Configuration(#[from] ConfigurationError),

    #[error(transparent)]
    Registration(#[from] RegistrationError),

    #[error(transparent)]
    Backend(#[from] DeviceBackendError),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl HubError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            HubError::Configuration(_) => ErrorKind::Configuration,
            HubError::Registration(_) => ErrorKind::Registration,
            HubError::Backend(_) => ErrorKind::DeviceRuntime,
            HubError::Transport(_) => ErrorKind::TransportResponse,
            HubError::Store(_) => ErrorKind::RpcRuntime,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_kind_tags_round_trip() {
        for kind in ErrorKind::ALL {
            assert_eq!(ErrorKind::from_tag(kind.as_str()), Some(kind));
        }
        assert_eq!(ErrorKind::from_tag("NOT_A_KIND"), None);
    }

    #[test]
    fn rpc_error_context_names_the_method() {
        let err = RpcError::Attribute {
            method: "nope".into(),
        };
        assert_eq!(err.kind(), ErrorKind::RpcAttribute);
        assert_eq!(err.context()["method_name"], "nope");
    }
}
