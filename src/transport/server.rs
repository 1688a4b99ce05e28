//! UDP request server.

use crate::error::{ErrorKind, RpcError, TransportError};
use crate::transport::codec::{self, fragment_size};
use crate::transport::protocol::{Request, Response};
use serde_json::json;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::UdpSocket;
use tokio::sync::watch;

/// Answers decoded requests. `None` sends no reply.
pub trait RequestHandler: Send + Sync {
    fn handle(&self, request: Request) -> Option<Response>;
}

/// A reply that failed after `sent` of its `total` packets went out.
struct SendFailure {
    sent: usize,
    total: usize,
    error: TransportError,
}

pub struct TransportServer {
    socket: UdpSocket,
    handler: Arc<dyn RequestHandler>,
    max_packet_size: usize,
}

impl TransportServer {
    /// Bind the request socket. A failure here is fatal to the hub.
    pub async fn bind(
        addr: &str,
        handler: Arc<dyn RequestHandler>,
        max_packet_size: usize,
    ) -> Result<Self, TransportError> {
        let socket = UdpSocket::bind(addr).await.map_err(|source| TransportError::Bind {
            addr: addr.to_string(),
            source,
        })?;
        log::info!("hub listening on udp://{}", addr);
        Ok(Self {
            socket,
            handler,
            max_packet_size,
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr, TransportError> {
        Ok(self.socket.local_addr()?)
    }

    /// Serve requests until `stop` becomes `true`.
    pub async fn run(self, mut stop: watch::Receiver<bool>) -> Result<(), TransportError> {
        let mut buf = vec![0u8; codec::MAX_PACKET_SIZE];
        loop {
            if *stop.borrow() {
                break;
            }
            tokio::select! {
                changed = stop.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
                received = self.socket.recv_from(&mut buf) => match received {
                    Ok((n, peer)) => self.serve(&buf[..n], peer).await,
                    Err(e) => log::warn!("request receive failed: {}", e),
                },
            }
        }
        log::info!("hub transport stopped");
        Ok(())
    }

    async fn serve(&self, packet: &[u8], peer: SocketAddr) {
        let request = codec::decode(packet)
            .map_err(|e| RpcError::Decode { reason: e.to_string() })
            .and_then(|v| Request::from_value(&v));
        let response = match request {
            Ok(request) => {
                log::trace!("{} -> {:?}", peer, request);
                let wants_reply = request.expects_reply();
                match self.handler.handle(request) {
                    Some(r) if wants_reply => r,
                    _ => return,
                }
            }
            Err(e) => {
                log::warn!("bad request from {}: {}", peer, e);
                Response::error(&e)
            }
        };
        let failure = match self.send(&response, peer).await {
            Ok(()) => return,
            Err(failure) => failure,
        };
        if failure.sent > 0 {
            // The peer is part way through a multipacket reply; another
            // packet would be taken as a fragment.
            log::error!(
                "response to {} cut off after {} of {} packets: {}",
                peer,
                failure.sent,
                failure.total,
                failure.error
            );
            return;
        }
        log::error!("failed to send response to {}: {}", peer, failure.error);
        let fallback = Response::Error {
            kind: ErrorKind::TransportResponse,
            message: "The ioHub Server Failed to send the intended response.".into(),
            context: json!({
                "reason": failure.error.to_string(),
                "max_packet_size": fragment_size(self.max_packet_size),
            }),
        };
        if let Err(f) = self.send(&fallback, peer).await {
            log::error!("failed to report send failure to {}: {}", peer, f.error);
        }
    }

    async fn send(&self, response: &Response, peer: SocketAddr) -> Result<(), SendFailure> {
        let packets = codec::encode(&response.to_value())
            .and_then(|encoded| codec::fragment(encoded, fragment_size(self.max_packet_size)))
            .map_err(|error| SendFailure { sent: 0, total: 0, error })?;
        let total = packets.len();
        for (sent, packet) in packets.iter().enumerate() {
            if let Err(e) = self.socket.send_to(packet, peer).await {
                return Err(SendFailure {
                    sent,
                    total,
                    error: e.into(),
                });
            }
        }
        Ok(())
    }
}
