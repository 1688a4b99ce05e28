//! Wire messages and their tagged-tuple form.
//!
//! | request                                                   | response |
//! |-----------------------------------------------------------|----------|
//! | `["GET_EVENTS"]`                                          | `["GET_EVENTS_RESULT", [..] \| null]` |
//! | `["RPC", method, args?, kwargs?]`                         | `["RPC_RESULT", method, value]` |
//! | `["EXP_DEVICE", "EVENT_TX", [event, ..]]`                 | `["EVENT_TX_RESULT", count]` |
//! | `["EXP_DEVICE", "DEV_RPC", device, method, args?, kwargs?]` | `["DEV_RPC_RESULT", value]` |
//! | `["EXP_DEVICE", "GET_DEVICE_LIST"]`                       | `["GET_DEV_LIST_RESULT", n, [[name, class], ..]]` |
//! | `["EXP_DEVICE", "ADD_DEVICE", class, config]`             | `["ADD_DEVICE", device]` |
//! | `["EXP_DEVICE", "GET_DEV_INTERFACE", device]`             | `["GET_DEV_INTERFACE", [method, ..]]` |
//! | `["STOP_IOHUB_SERVER"]`                                   | none |
//!
//! Failures answer `[ERROR_KIND, message, {context}]`.

use crate::error::{ErrorKind, RpcError};
use serde_json::{json, Map, Value};

pub const GET_EVENTS: &str = "GET_EVENTS";
pub const RPC: &str = "RPC";
pub const EXP_DEVICE: &str = "EXP_DEVICE";
pub const EVENT_TX: &str = "EVENT_TX";
pub const DEV_RPC: &str = "DEV_RPC";
pub const GET_DEVICE_LIST: &str = "GET_DEVICE_LIST";
pub const ADD_DEVICE: &str = "ADD_DEVICE";
pub const GET_DEV_INTERFACE: &str = "GET_DEV_INTERFACE";
pub const STOP_IOHUB_SERVER: &str = "STOP_IOHUB_SERVER";

pub const GET_EVENTS_RESULT: &str = "GET_EVENTS_RESULT";
pub const RPC_RESULT: &str = "RPC_RESULT";
pub const EVENT_TX_RESULT: &str = "EVENT_TX_RESULT";
pub const DEV_RPC_RESULT: &str = "DEV_RPC_RESULT";
pub const GET_DEV_LIST_RESULT: &str = "GET_DEV_LIST_RESULT";

#[derive(Debug, Clone, PartialEq)]
pub enum Request {
    GetEvents,
    Rpc {
        method: String,
        args: Vec<Value>,
        kwargs: Map<String, Value>,
    },
    /// Event tuples produced by the Experiment Process.
    EventTx(Vec<Value>),
    DevRpc {
        device: String,
        method: String,
        args: Vec<Value>,
        kwargs: Map<String, Value>,
    },
    GetDeviceList,
    AddDevice {
        class: String,
        config: Value,
    },
    /// RPC method names of one device, looked up like `DevRpc`.
    DevInterface {
        device: String,
    },
    Stop,
}

/// Optional positional and keyword slots at `items[at..]`.
fn call_args(items: &[Value], at: usize) -> Result<(Vec<Value>, Map<String, Value>), RpcError> {
    let args = match items.get(at) {
        None | Some(Value::Null) => Vec::new(),
        Some(Value::Array(a)) => a.clone(),
        Some(other) => {
            return Err(RpcError::Decode {
                reason: format!("call arguments must be a list, got {}", other),
            })
        }
    };
    let kwargs = match items.get(at + 1) {
        None | Some(Value::Null) => Map::new(),
        Some(Value::Object(m)) => m.clone(),
        Some(other) => {
            return Err(RpcError::Decode {
                reason: format!("keyword arguments must be a mapping, got {}", other),
            })
        }
    };
    Ok((args, kwargs))
}

fn text_at<'a>(items: &'a [Value], at: usize, what: &str) -> Result<&'a str, RpcError> {
    items.get(at).and_then(Value::as_str).ok_or_else(|| RpcError::Decode {
        reason: format!("missing {}", what),
    })
}

fn with_call_args(mut tuple: Vec<Value>, args: &[Value], kwargs: &Map<String, Value>) -> Value {
    if !args.is_empty() || !kwargs.is_empty() {
        tuple.push(Value::Array(args.to_vec()));
    }
    if !kwargs.is_empty() {
        tuple.push(Value::Object(kwargs.clone()));
    }
    Value::Array(tuple)
}

impl Request {
    /// Parse a decoded request tuple.
    pub fn from_value(value: &Value) -> Result<Self, RpcError> {
        let items = value.as_array().ok_or_else(|| RpcError::Decode {
            reason: "request must be a list".into(),
        })?;
        let request_type = text_at(items, 0, "request type")?;
        match request_type {
            GET_EVENTS => Ok(Request::GetEvents),
            STOP_IOHUB_SERVER => Ok(Request::Stop),
            RPC => {
                let method = text_at(items, 1, "method name")?.to_string();
                let (args, kwargs) = call_args(items, 2)?;
                Ok(Request::Rpc { method, args, kwargs })
            }
            EXP_DEVICE => {
                let sub = text_at(items, 1, "device request type")?;
                match sub {
                    EVENT_TX => match items.get(2) {
                        Some(Value::Array(events)) => Ok(Request::EventTx(events.clone())),
                        _ => Err(RpcError::Decode {
                            reason: "EVENT_TX expects a list of events".into(),
                        }),
                    },
                    DEV_RPC => {
                        let device = text_at(items, 2, "device name")?.to_string();
                        let method = text_at(items, 3, "device method name")?.to_string();
                        let (args, kwargs) = call_args(items, 4)?;
                        Ok(Request::DevRpc {
                            device,
                            method,
                            args,
                            kwargs,
                        })
                    }
                    GET_DEVICE_LIST => Ok(Request::GetDeviceList),
                    ADD_DEVICE => Ok(Request::AddDevice {
                        class: text_at(items, 2, "device class")?.to_string(),
                        config: items.get(3).cloned().unwrap_or_else(|| json!({})),
                    }),
                    GET_DEV_INTERFACE => Ok(Request::DevInterface {
                        device: text_at(items, 2, "device name")?.to_string(),
                    }),
                    other => Err(RpcError::UnsupportedDeviceRequest {
                        request_type: other.to_string(),
                    }),
                }
            }
            other => Err(RpcError::UnsupportedRequest {
                request_type: other.to_string(),
            }),
        }
    }

    pub fn to_value(&self) -> Value {
        match self {
            Request::GetEvents => json!([GET_EVENTS]),
            Request::Stop => json!([STOP_IOHUB_SERVER]),
            Request::Rpc { method, args, kwargs } => with_call_args(vec![json!(RPC), json!(method)], args, kwargs),
            Request::EventTx(events) => json!([EXP_DEVICE, EVENT_TX, events]),
            Request::DevRpc {
                device,
                method,
                args,
                kwargs,
            } => with_call_args(
                vec![json!(EXP_DEVICE), json!(DEV_RPC), json!(device), json!(method)],
                args,
                kwargs,
            ),
            Request::GetDeviceList => json!([EXP_DEVICE, GET_DEVICE_LIST]),
            Request::AddDevice { class, config } => json!([EXP_DEVICE, ADD_DEVICE, class, config]),
            Request::DevInterface { device } => json!([EXP_DEVICE, GET_DEV_INTERFACE, device]),
        }
    }

    /// Whether the hub answers this request.
    pub fn expects_reply(&self) -> bool {
        !matches!(self, Request::Stop)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Response {
    /// `None` when the global buffer was empty.
    Events(Option<Vec<Value>>),
    RpcResult {
        method: String,
        value: Value,
    },
    EventTxResult(usize),
    DevRpcResult(Value),
    DeviceList(Vec<(String, String)>),
    DeviceAdded(Value),
    DevInterface(Vec<String>),
    Error {
        kind: ErrorKind,
        message: String,
        context: Value,
    },
}

impl Response {
    pub fn error(err: &RpcError) -> Self {
        Response::Error {
            kind: err.kind(),
            message: err.to_string(),
            context: err.context(),
        }
    }

    pub fn to_value(&self) -> Value {
        match self {
            Response::Events(events) => json!([GET_EVENTS_RESULT, events]),
            Response::RpcResult { method, value } => json!([RPC_RESULT, method, value]),
            Response::EventTxResult(n) => json!([EVENT_TX_RESULT, n]),
            Response::DevRpcResult(value) => json!([DEV_RPC_RESULT, value]),
            Response::DeviceList(list) => {
                let pairs: Vec<Value> = list.iter().map(|(n, c)| json!([n, c])).collect();
                json!([GET_DEV_LIST_RESULT, list.len(), pairs])
            }
            Response::DeviceAdded(device) => json!([ADD_DEVICE, device]),
            Response::DevInterface(methods) => json!([GET_DEV_INTERFACE, methods]),
            Response::Error { kind, message, context } => json!([kind.as_str(), message, context]),
        }
    }

    /// Parse a decoded response tuple. `None` when the shape is not recognised.
    pub fn from_value(value: &Value) -> Option<Self> {
        let items = value.as_array()?;
        let tag = items.first()?.as_str()?;
        let at = |i: usize| items.get(i).cloned().unwrap_or(Value::Null);
        let response = match tag {
            GET_EVENTS_RESULT => Response::Events(match at(1) {
                Value::Array(events) => Some(events),
                _ => None,
            }),
            RPC_RESULT => Response::RpcResult {
                method: items.get(1)?.as_str()?.to_string(),
                value: at(2),
            },
            EVENT_TX_RESULT => Response::EventTxResult(items.get(1)?.as_u64()? as usize),
            DEV_RPC_RESULT => Response::DevRpcResult(at(1)),
            GET_DEV_LIST_RESULT => {
                let pairs = items.get(2)?.as_array()?;
                let list = pairs
                    .iter()
                    .map(|p| {
                        let name = p.get(0)?.as_str()?.to_string();
                        let class = p.get(1)?.as_str()?.to_string();
                        Some((name, class))
                    })
                    .collect::<Option<Vec<_>>>()?;
                Response::DeviceList(list)
            }
            ADD_DEVICE => Response::DeviceAdded(at(1)),
            GET_DEV_INTERFACE => Response::DevInterface(
                items
                    .get(1)?
                    .as_array()?
                    .iter()
                    .map(|m| m.as_str().map(String::from))
                    .collect::<Option<Vec<_>>>()?,
            ),
            other => {
                let kind = ErrorKind::from_tag(other)?;
                Response::Error {
                    kind,
                    message: items.get(1).and_then(Value::as_str).unwrap_or_default().to_string(),
                    context: at(2),
                }
            }
        };
        Some(response)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rpc_request_with_optional_slots() {
        let bare = Request::from_value(&json!(["RPC", "getTime"])).unwrap();
        assert_eq!(
            bare,
            Request::Rpc {
                method: "getTime".into(),
                args: vec![],
                kwargs: Map::new()
            }
        );
        assert_eq!(bare.to_value(), json!(["RPC", "getTime"]));

        let full = Request::from_value(&json!(["RPC", "checkIfSessionCodeExists", ["S1"], {}])).unwrap();
        assert_eq!(full.to_value(), json!(["RPC", "checkIfSessionCodeExists", ["S1"]]));
    }

    #[test]
    fn device_requests_parse() {
        let req = Request::from_value(&json!(["EXP_DEVICE", "DEV_RPC", "keyboard", "getEvents", [null, false]])).unwrap();
        match req {
            Request::DevRpc { device, method, args, .. } => {
                assert_eq!(device, "keyboard");
                assert_eq!(method, "getEvents");
                assert_eq!(args, vec![Value::Null, json!(false)]);
            }
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(
            Request::from_value(&json!(["EXP_DEVICE", "GET_DEVICE_LIST"])).unwrap(),
            Request::GetDeviceList
        );
        let req = Request::from_value(&json!(["EXP_DEVICE", "GET_DEV_INTERFACE", "mouse"])).unwrap();
        assert_eq!(req, Request::DevInterface { device: "mouse".into() });
        assert_eq!(req.to_value(), json!(["EXP_DEVICE", "GET_DEV_INTERFACE", "mouse"]));
        let err = Request::from_value(&json!(["EXP_DEVICE", "GET_DEV_INTERFACE"])).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::RequestDecode);
    }

    #[test]
    fn unknown_request_types_map_to_their_error_kinds() {
        let err = Request::from_value(&json!(["FLY_TO_MOON"])).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::RequestTypeNotSupported);
        let err = Request::from_value(&json!(["EXP_DEVICE", "GET_DEV_STATE", "x"])).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::DeviceRequestTypeNotSupported);
        let err = Request::from_value(&json!({"type": "RPC"})).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::RequestDecode);
    }

    #[test]
    fn error_response_is_a_tagged_tuple() {
        let resp = Response::error(&RpcError::Attribute { method: "nope".into() });
        let wire = resp.to_value();
        assert_eq!(wire[0], "RPC_ATTRIBUTE_ERROR");
        assert_eq!(wire[2]["method_name"], "nope");
        assert_eq!(Response::from_value(&wire), Some(resp));
    }

    #[test]
    fn device_interface_shape() {
        let resp = Response::DevInterface(vec!["getEvents".into(), "getPosition".into()]);
        let wire = resp.to_value();
        assert_eq!(wire, json!(["GET_DEV_INTERFACE", ["getEvents", "getPosition"]]));
        assert_eq!(Response::from_value(&wire), Some(resp));
    }

    #[test]
    fn device_list_shape() {
        let resp = Response::DeviceList(vec![("experiment".into(), "Experiment".into())]);
        let wire = resp.to_value();
        assert_eq!(wire, json!(["GET_DEV_LIST_RESULT", 1, [["experiment", "Experiment"]]]));
        assert_eq!(Response::from_value(&wire), Some(resp));
    }
}
