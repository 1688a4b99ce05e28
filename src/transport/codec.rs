//! Datagram framing.
//!
//! A packet is the MessagePack encoding of one tuple followed by `\r\n`.
//! An encoded response longer than the fragment payload limit is sent as a
//! header packet `["IOHUB_MULTIPACKET_RESPONSE", n]` followed by `n` raw
//! slices of the terminated encoding, each at most the limit long. The
//! receiver concatenates the slices in order and decodes the result.

use crate::error::TransportError;
use serde::Serialize;
use serde_json::{json, Value};
use std::io::Cursor;

/// Largest datagram either side sends, and the client's receive buffer size.
pub const MAX_PACKET_SIZE: usize = 64 * 1024;

pub const MULTIPACKET_HEADER: &str = "IOHUB_MULTIPACKET_RESPONSE";

const TERMINATOR: &[u8] = b"\r\n";

/// Fragment payload limit for a given packet size.
pub fn fragment_size(max_packet_size: usize) -> usize {
    (max_packet_size / 2).saturating_sub(20).max(1)
}

pub fn encode<T: Serialize + ?Sized>(message: &T) -> Result<Vec<u8>, TransportError> {
    let mut bytes = rmp_serde::to_vec_named(message)?;
    bytes.extend_from_slice(TERMINATOR);
    Ok(bytes)
}

/// Decode one message. Anything after it other than the terminator is an error.
pub fn decode(packet: &[u8]) -> Result<Value, TransportError> {
    let mut cursor = Cursor::new(packet);
    let value: Value = rmp_serde::from_read(&mut cursor)?;
    let rest = &packet[cursor.position() as usize..];
    if rest.is_empty() || rest == TERMINATOR {
        Ok(value)
    } else {
        Err(TransportError::Malformed(format!("{} trailing bytes after message", rest.len())))
    }
}

/// Split an encoded message into the datagrams that carry it.
///
/// A message of at most `limit` bytes is sent as is. Longer ones get a
/// header packet and `ceil(len / limit)` fragments.
pub fn fragment(encoded: Vec<u8>, limit: usize) -> Result<Vec<Vec<u8>>, TransportError> {
    let limit = limit.max(1);
    if encoded.len() <= limit {
        return Ok(vec![encoded]);
    }
    let chunks: Vec<Vec<u8>> = encoded.chunks(limit).map(<[u8]>::to_vec).collect();
    let mut packets = Vec::with_capacity(chunks.len() + 1);
    packets.push(encode(&json!([MULTIPACKET_HEADER, chunks.len()]))?);
    packets.extend(chunks);
    Ok(packets)
}

/// Number of fragments announced by `value`, if it is a multipacket header.
pub fn multipacket_count(value: &Value) -> Option<usize> {
    let items = value.as_array()?;
    if items.len() == 2 && items[0].as_str() == Some(MULTIPACKET_HEADER) {
        items[1].as_u64().map(|n| n as usize)
    } else {
        None
    }
}

/// Receiver-side state for rebuilding fragmented messages.
#[derive(Debug, Default)]
pub struct Reassembler {
    expected: usize,
    received: usize,
    buf: Vec<u8>,
}

impl Reassembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one datagram. Returns the decoded message once it is complete.
    pub fn push(&mut self, packet: &[u8]) -> Result<Option<Value>, TransportError> {
        if self.expected > 0 {
            self.buf.extend_from_slice(packet);
            self.received += 1;
            if self.received < self.expected {
                return Ok(None);
            }
            let whole = std::mem::take(&mut self.buf);
            self.reset();
            return decode(&whole).map(Some);
        }
        let value = decode(packet)?;
        match multipacket_count(&value) {
            Some(0) => Err(TransportError::Malformed("multipacket header announces no fragments".into())),
            Some(n) => {
                self.expected = n;
                self.received = 0;
                Ok(None)
            }
            None => Ok(Some(value)),
        }
    }

    pub fn is_pending(&self) -> bool {
        self.expected > 0
    }

    /// Error describing a message abandoned part way through.
    pub fn incomplete(&self) -> TransportError {
        TransportError::IncompleteMultipacket {
            expected: self.expected,
            received: self.received,
        }
    }

    pub fn reset(&mut self) {
        self.expected = 0;
        self.received = 0;
        self.buf.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_fragment_size() {
        assert_eq!(fragment_size(MAX_PACKET_SIZE), 32748);
    }

    #[test]
    fn packets_are_msgpack_with_a_terminator() {
        let packet = encode(&json!(["RPC", "getTime"])).unwrap();
        // fixarray(2), fixstr(3) "RPC", fixstr(7) "getTime", "\r\n"
        assert_eq!(&packet[..5], &[0x92, 0xa3, b'R', b'P', b'C']);
        assert_eq!(packet.len(), 1 + 4 + 8 + 2);
        assert!(packet.ends_with(b"\r\n"));
        assert_eq!(decode(&packet).unwrap(), json!(["RPC", "getTime"]));
    }

    #[test]
    fn terminator_is_optional_on_decode() {
        // [1, 2] and [13, 10]: the second ends in the terminator's own bytes.
        assert_eq!(decode(&[0x92, 0x01, 0x02, b'\r', b'\n']).unwrap(), json!([1, 2]));
        assert_eq!(decode(&[0x92, 0x01, 0x02]).unwrap(), json!([1, 2]));
        assert_eq!(decode(&[0x92, 0x0d, 0x0a]).unwrap(), json!([13, 10]));
        assert!(decode(&[0x92, 0x01]).is_err());
        assert!(decode(&[0x92, 0x01, 0x02, 0xc0]).is_err());
    }

    #[test]
    fn floats_and_maps_survive() {
        let value = json!({ "t": 12.5, "ok": true, "n": -3, "none": null });
        assert_eq!(decode(&encode(&value).unwrap()).unwrap(), value);
    }

    #[test]
    fn short_message_is_one_packet() {
        let packets = fragment(encode(&json!(["GET_EVENTS_RESULT", null])).unwrap(), 64).unwrap();
        assert_eq!(packets.len(), 1);
        let mut r = Reassembler::new();
        assert_eq!(r.push(&packets[0]).unwrap(), Some(json!(["GET_EVENTS_RESULT", null])));
    }

    #[test]
    fn zero_fragment_header_is_rejected() {
        let mut r = Reassembler::new();
        let header = encode(&json!([MULTIPACKET_HEADER, 0])).unwrap();
        assert!(r.push(&header).is_err());
        assert!(!r.is_pending());
    }
}
