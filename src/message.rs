//! Messages and the per-connection message manager

use std::collections::VecDeque;

use bytes::{Bytes, BytesMut};
use parking_lot::Mutex;

use crate::error::CloseReason;
use crate::frame::OpCode;

/// A complete WebSocket message
///
/// Text payloads are stored as `Bytes` and are UTF-8 validated before they
/// are surfaced, so `as_text` never fails for messages the core delivers.
#[derive(Debug, Clone)]
pub enum Message {
    /// Text message (UTF-8 validated on receipt)
    Text(Bytes),
    /// Binary message
    Binary(Bytes),
    /// Ping control message
    Ping(Bytes),
    /// Pong control message
    Pong(Bytes),
    /// Close control message
    Close(Option<CloseReason>),
}

impl Message {
    /// Create a text message
    #[inline]
    pub fn text(s: impl Into<String>) -> Self {
        Message::Text(Bytes::from(s.into()))
    }

    /// Create a binary message
    #[inline]
    pub fn binary(data: impl Into<Bytes>) -> Self {
        Message::Binary(data.into())
    }

    /// Message opcode
    #[inline]
    pub fn opcode(&self) -> OpCode {
        match self {
            Message::Text(_) => OpCode::Text,
            Message::Binary(_) => OpCode::Binary,
            Message::Ping(_) => OpCode::Ping,
            Message::Pong(_) => OpCode::Pong,
            Message::Close(_) => OpCode::Close,
        }
    }

    /// Check if this is a control message
    #[inline]
    pub fn is_control(&self) -> bool {
        self.opcode().is_control()
    }

    /// Payload bytes (close frames report their encoded payload length via
    /// [`Message::payload_len`])
    #[inline]
    pub fn payload(&self) -> &[u8] {
        match self {
            Message::Text(b) | Message::Binary(b) | Message::Ping(b) | Message::Pong(b) => b,
            Message::Close(_) => &[],
        }
    }

    /// Payload size in bytes as it will appear on the wire
    #[inline]
    pub fn payload_len(&self) -> usize {
        match self {
            Message::Text(b) | Message::Binary(b) | Message::Ping(b) | Message::Pong(b) => b.len(),
            Message::Close(Some(r)) => 2 + r.reason.len(),
            Message::Close(None) => 0,
        }
    }

    /// View a text payload as `&str`
    #[inline]
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Message::Text(b) => std::str::from_utf8(b).ok(),
            _ => None,
        }
    }
}

impl From<String> for Message {
    fn from(s: String) -> Self {
        Message::Text(Bytes::from(s))
    }
}

impl From<&str> for Message {
    fn from(s: &str) -> Self {
        Message::Text(Bytes::copy_from_slice(s.as_bytes()))
    }
}

impl From<Vec<u8>> for Message {
    fn from(v: Vec<u8>) -> Self {
        Message::Binary(Bytes::from(v))
    }
}

impl From<Bytes> for Message {
    fn from(b: Bytes) -> Self {
        Message::Binary(b)
    }
}

/// A queued outbound message
///
/// `prepared` holds the framed wire bytes once the processor has run;
/// control frames are prepared at enqueue time, data frames lazily when the
/// write pump pops them. `terminal` marks the final close frame: the
/// connection terminates once its write completes.
#[derive(Debug)]
pub(crate) struct Outgoing {
    pub message: Message,
    pub prepared: Option<Bytes>,
    pub payload_len: usize,
    pub terminal: bool,
}

impl Outgoing {
    pub(crate) fn new(message: Message) -> Self {
        let payload_len = message.payload_len();
        Self {
            message,
            prepared: None,
            payload_len,
            terminal: false,
        }
    }

    pub(crate) fn prepared(message: Message, wire: Bytes) -> Self {
        let payload_len = message.payload_len();
        Self {
            message,
            prepared: Some(wire),
            payload_len,
            terminal: false,
        }
    }

    pub(crate) fn terminal(mut self) -> Self {
        self.terminal = true;
        self
    }
}

/// Default number of buffers the manager retains
const POOL_LIMIT: usize = 8;

/// Per-connection buffer manager
///
/// Hands out `BytesMut` buffers for frame preparation and recycles them
/// when the written `Bytes` turns out to be uniquely owned after the write
/// completes. Keeps the steady-state write path free of allocator traffic.
pub(crate) struct MessageManager {
    pool: Mutex<VecDeque<BytesMut>>,
    buffer_capacity: usize,
}

impl MessageManager {
    pub(crate) fn new(buffer_capacity: usize) -> Self {
        Self {
            pool: Mutex::new(VecDeque::new()),
            buffer_capacity,
        }
    }

    /// Take a cleared buffer from the pool, or allocate one
    pub(crate) fn take(&self) -> BytesMut {
        self.pool
            .lock()
            .pop_front()
            .unwrap_or_else(|| BytesMut::with_capacity(self.buffer_capacity))
    }

    /// Return a written-out buffer to the pool if it is uniquely owned
    pub(crate) fn reclaim(&self, wire: Bytes) {
        if let Ok(mut buf) = wire.try_into_mut() {
            let mut pool = self.pool.lock();
            if pool.len() < POOL_LIMIT {
                buf.clear();
                pool.push_back(buf);
            }
        }
    }

    #[cfg(test)]
    fn pooled(&self) -> usize {
        self.pool.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn payload_len_counts_close_encoding() {
        assert_eq!(Message::text("hello").payload_len(), 5);
        assert_eq!(Message::Close(None).payload_len(), 0);
        let close = Message::Close(Some(CloseReason::new(1000, "bye")));
        assert_eq!(close.payload_len(), 5);
    }

    #[test]
    fn opcode_mapping() {
        assert_eq!(Message::text("x").opcode(), OpCode::Text);
        assert_eq!(Message::binary(vec![1u8]).opcode(), OpCode::Binary);
        assert_eq!(Message::Close(None).opcode(), OpCode::Close);
        assert!(Message::Ping(Bytes::new()).is_control());
        assert!(!Message::text("x").is_control());
    }

    #[test]
    fn manager_recycles_unique_buffers() {
        let mgr = MessageManager::new(64);
        let mut buf = mgr.take();
        buf.extend_from_slice(b"frame bytes");
        let wire = buf.freeze();

        mgr.reclaim(wire);
        assert_eq!(mgr.pooled(), 1);

        let reused = mgr.take();
        assert_eq!(mgr.pooled(), 0);
        assert!(reused.is_empty());
    }

    #[test]
    fn manager_skips_shared_buffers() {
        let mgr = MessageManager::new(64);
        let mut buf = mgr.take();
        buf.extend_from_slice(b"shared");
        let wire = buf.freeze();
        let _second = wire.clone();

        mgr.reclaim(wire);
        assert_eq!(mgr.pooled(), 0);
    }
}
