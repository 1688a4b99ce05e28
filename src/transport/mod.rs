//! Request/response transport between the Experiment Process and the hub.
//!
//! Every message is a JSON-encoded tagged tuple sent as one UDP datagram.
//! Responses that do not fit in one datagram are announced with
//! `["IOHUB_MULTIPACKET_RESPONSE", n]` and followed by `n` raw fragments.

pub mod client;
pub mod codec;
pub mod protocol;
pub mod server;

pub use client::HubClient;
pub use codec::{Reassembler, MAX_PACKET_SIZE};
pub use protocol::{Request, Response};
pub use server::{RequestHandler, TransportServer};
