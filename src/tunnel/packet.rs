//! Packet buffers and typed control messages.

use serde_json::{json, Value};

/// Control message payload capacity.
pub const MESSAGE_SIZE: usize = 2048;
/// One IP packet as read from the tunnel device.
pub const TUNNEL_PACKET_SIZE: usize = 2048;
/// One UDP datagram: an encrypted, possibly padded tunnel packet.
pub const DATA_PACKET_SIZE: usize = 4096;

/// A heap-backed byte buffer with a fixed capacity and an occupied length.
///
/// The buffer always exposes its full capacity through
/// [`buffer_mut`](Packet::buffer_mut) so in-place encryptors may grow the
/// payload; `len` tracks the meaningful prefix.
pub struct Packet {
    data: Box<[u8]>,
    len: usize,
}

impl Packet {
    pub fn with_capacity(capacity: usize) -> Packet {
        Packet { data: vec![0u8; capacity].into_boxed_slice(), len: 0 }
    }

    pub fn tunnel() -> Packet {
        Packet::with_capacity(TUNNEL_PACKET_SIZE)
    }

    pub fn data() -> Packet {
        Packet::with_capacity(DATA_PACKET_SIZE)
    }

    pub fn capacity(&self) -> usize {
        self.data.len()
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn set_len(&mut self, len: usize) {
        assert!(len <= self.data.len(), "packet length exceeds capacity");
        self.len = len;
    }

    /// Copy `bytes` in, replacing the payload.
    pub fn fill(&mut self, bytes: &[u8]) {
        assert!(bytes.len() <= self.data.len(), "packet content exceeds capacity");
        self.data[..bytes.len()].copy_from_slice(bytes);
        self.len = bytes.len();
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.data[..self.len]
    }

    /// The whole backing buffer, beyond `len`.
    pub fn buffer_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }

    pub fn pack_u64(&mut self, value: u64) {
        self.fill(&value.to_le_bytes());
    }

    pub fn unpack_u64(&self) -> Option<u64> {
        let bytes: [u8; 8] = self.data.get(..8)?.try_into().ok()?;
        (self.len >= 8).then(|| u64::from_le_bytes(bytes))
    }
}

impl Clone for Packet {
    fn clone(&self) -> Packet {
        let mut copy = Packet::with_capacity(self.data.len());
        copy.fill(self.as_slice());
        copy
    }
}

/// A control message: a JSON document `{"type": ..., "body": ...}` carried
/// in a [`Packet`] of capacity [`MESSAGE_SIZE`].
pub struct Message {
    packet: Packet,
}

impl Message {
    pub fn new(kind: &str, body: Value) -> Message {
        let payload = json!({ "type": kind, "body": body });
        let encoded = payload.to_string();
        let mut packet = Packet::with_capacity(MESSAGE_SIZE);
        packet.fill(encoded.as_bytes());
        Message { packet }
    }

    /// An empty message buffer for the receiver to fill.
    pub fn empty() -> Message {
        Message { packet: Packet::with_capacity(MESSAGE_SIZE) }
    }

    pub fn len(&self) -> usize {
        self.packet.len()
    }

    pub fn is_empty(&self) -> bool {
        self.packet.is_empty()
    }

    pub fn set_len(&mut self, len: usize) {
        self.packet.set_len(len);
    }

    pub fn as_slice(&self) -> &[u8] {
        self.packet.as_slice()
    }

    pub fn buffer_mut(&mut self) -> &mut [u8] {
        self.packet.buffer_mut()
    }

    /// Type and body, if the payload parses as a valid message document.
    pub fn parse(&self) -> Option<(String, Value)> {
        let value: Value = serde_json::from_slice(self.packet.as_slice()).ok()?;
        let kind = value.get("type")?.as_str()?.to_string();
        let body = value.get("body")?.clone();
        Some((kind, body))
    }

    pub fn kind(&self) -> Option<String> {
        self.parse().map(|(kind, _)| kind)
    }

    pub fn body(&self) -> Option<Value> {
        self.parse().map(|(_, body)| body)
    }

    pub fn is_valid(&self) -> bool {
        self.parse().is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fill_and_read_back() {
        let mut packet = Packet::with_capacity(64);
        packet.fill(b"payload");
        assert_eq!(packet.as_slice(), b"payload");
        assert_eq!(packet.capacity(), 64);
    }

    #[test]
    fn u64_round_trip() {
        let mut packet = Packet::with_capacity(16);
        packet.pack_u64(0x1122_3344_5566_7788);
        assert_eq!(packet.len(), 8);
        assert_eq!(packet.unpack_u64(), Some(0x1122_3344_5566_7788));
    }

    #[test]
    fn short_packet_does_not_unpack() {
        let mut packet = Packet::with_capacity(16);
        packet.fill(b"abc");
        assert_eq!(packet.unpack_u64(), None);
    }

    #[test]
    fn message_round_trip() {
        let msg = Message::new("hello", json!({ "version": 1 }));
        let (kind, body) = msg.parse().unwrap();
        assert_eq!(kind, "hello");
        assert_eq!(body["version"], 1);
        assert!(msg.is_valid());
    }

    #[test]
    fn garbage_is_invalid() {
        let mut msg = Message::empty();
        msg.buffer_mut()[..4].copy_from_slice(b"\xff\xfe{!");
        msg.set_len(4);
        assert!(!msg.is_valid());
    }

    #[test]
    fn json_without_both_fields_is_invalid() {
        let mut msg = Message::empty();
        let doc = br#"{"type":"x"}"#;
        msg.buffer_mut()[..doc.len()].copy_from_slice(doc);
        msg.set_len(doc.len());
        assert!(!msg.is_valid());
    }
}
