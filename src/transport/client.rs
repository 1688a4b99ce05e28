//! Blocking client used by the Experiment Process.

use crate::backends::experiment::message_tuple;
use crate::clock;
use crate::error::TransportError;
use crate::transport::codec::{self, Reassembler, MAX_PACKET_SIZE};
use crate::transport::protocol::{Request, Response};
use serde_json::{Map, Value};
use std::net::{SocketAddr, ToSocketAddrs, UdpSocket};
use std::time::Duration;

pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);

pub struct HubClient {
    socket: UdpSocket,
    server: SocketAddr,
}

impl HubClient {
    /// Bind an ephemeral local socket for talking to the hub at `server`.
    pub fn connect(server: impl ToSocketAddrs, timeout: Option<Duration>) -> Result<Self, TransportError> {
        let server = server
            .to_socket_addrs()?
            .next()
            .ok_or_else(|| TransportError::Malformed("hub address resolved to nothing".into()))?;
        let local = if server.is_ipv4() { "0.0.0.0:0" } else { "[::]:0" };
        let socket = UdpSocket::bind(local)?;
        socket.set_read_timeout(timeout)?;
        Ok(Self { socket, server })
    }

    pub fn server_addr(&self) -> SocketAddr {
        self.server
    }

    fn send(&self, request: &Request) -> Result<(), TransportError> {
        let packet = codec::encode(&request.to_value())?;
        if packet.len() > MAX_PACKET_SIZE {
            return Err(TransportError::RequestTooLarge {
                size: packet.len(),
                max: MAX_PACKET_SIZE,
            });
        }
        self.socket.send_to(&packet, self.server)?;
        Ok(())
    }

    fn receive(&self) -> Result<Value, TransportError> {
        let mut buf = vec![0u8; MAX_PACKET_SIZE];
        let mut reassembler = Reassembler::new();
        loop {
            let n = match self.socket.recv_from(&mut buf) {
                Ok((n, _)) => n,
                Err(e) if reassembler.is_pending() => {
                    log::warn!("multipacket response abandoned: {}", e);
                    return Err(reassembler.incomplete());
                }
                Err(e) => return Err(e.into()),
            };
            if let Some(value) = reassembler.push(&buf[..n])? {
                return Ok(value);
            }
        }
    }

    /// Send `request` and wait for the reply. Error tuples become
    /// [`TransportError::Remote`].
    pub fn request(&self, request: &Request) -> Result<Response, TransportError> {
        self.send(request)?;
        let value = self.receive()?;
        match Response::from_value(&value) {
            Some(Response::Error { kind, message, context }) => Err(TransportError::Remote {
                kind,
                message,
                context,
            }),
            Some(response) => Ok(response),
            None => Err(TransportError::Malformed(format!("unrecognised response {}", value))),
        }
    }

    /// Every event in the hub's global buffer, as tuples sorted by hub time.
    pub fn get_events(&self) -> Result<Vec<Value>, TransportError> {
        match self.request(&Request::GetEvents)? {
            Response::Events(events) => Ok(events.unwrap_or_default()),
            other => Err(unexpected(other)),
        }
    }

    pub fn send_events(&self, events: Vec<Value>) -> Result<usize, TransportError> {
        match self.request(&Request::EventTx(events))? {
            Response::EventTxResult(n) => Ok(n),
            other => Err(unexpected(other)),
        }
    }

    /// Send one MESSAGE event stamped with the current time.
    pub fn send_message(&self, text: &str, prefix: &str, offset: f32) -> Result<usize, TransportError> {
        let tuple = message_tuple(text, prefix, offset, clock::now());
        self.send_events(vec![Value::Array(tuple)])
    }

    pub fn device_rpc(&self, device: &str, method: &str, args: Vec<Value>) -> Result<Value, TransportError> {
        let request = Request::DevRpc {
            device: device.to_string(),
            method: method.to_string(),
            args,
            kwargs: Map::new(),
        };
        match self.request(&request)? {
            Response::DevRpcResult(value) => Ok(value),
            other => Err(unexpected(other)),
        }
    }

    /// `(name, class)` of every monitored device.
    pub fn get_device_list(&self) -> Result<Vec<(String, String)>, TransportError> {
        match self.request(&Request::GetDeviceList)? {
            Response::DeviceList(list) => Ok(list),
            other => Err(unexpected(other)),
        }
    }

    /// RPC method names the named device accepts.
    pub fn device_interface(&self, device: &str) -> Result<Vec<String>, TransportError> {
        let request = Request::DevInterface {
            device: device.to_string(),
        };
        match self.request(&request)? {
            Response::DevInterface(methods) => Ok(methods),
            other => Err(unexpected(other)),
        }
    }

    pub fn add_device(&self, class: &str, config: Value) -> Result<Value, TransportError> {
        let request = Request::AddDevice {
            class: class.to_string(),
            config,
        };
        match self.request(&request)? {
            Response::DeviceAdded(device) => Ok(device),
            other => Err(unexpected(other)),
        }
    }

    pub fn rpc(&self, method: &str, args: Vec<Value>) -> Result<Value, TransportError> {
        let request = Request::Rpc {
            method: method.to_string(),
            args,
            kwargs: Map::new(),
        };
        match self.request(&request)? {
            Response::RpcResult { value, .. } => Ok(value),
            other => Err(unexpected(other)),
        }
    }

    /// Ask the hub to stop. The hub does not reply.
    pub fn shutdown_server(&self) -> Result<(), TransportError> {
        self.send(&Request::Stop)
    }
}

fn unexpected(response: Response) -> TransportError {
    TransportError::Malformed(format!("unexpected response {}", response.to_value()))
}
