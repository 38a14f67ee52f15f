//! Core types for the relay pipeline

use bytes::Bytes;
use std::fmt;

use crate::config::TIMESTAMP_BYTES;
use crate::timestamp::{decode_header, encode_header, ByteOrder};

/// In-band control message asking a producer to start streaming
pub const READY_SENTINEL: &str = "ready";

/// Generated payload with its header slot reserved but not yet stamped
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingMessage {
    buf: Vec<u8>,
}

impl PendingMessage {
    /// `buf` must already contain the zeroed header slot
    pub(crate) fn from_buf(buf: Vec<u8>) -> Self {
        debug_assert!(buf.len() >= TIMESTAMP_BYTES);
        Self { buf }
    }

    pub fn payload(&self) -> &[u8] {
        &self.buf[TIMESTAMP_BYTES..]
    }

    /// Write the send time and freeze; the message is immutable afterwards
    pub fn stamp(mut self, timestamp_ns: u64, order: ByteOrder) -> Message {
        self.buf[..TIMESTAMP_BYTES].copy_from_slice(&encode_header(timestamp_ns, order));
        Message {
            bytes: Bytes::from(self.buf),
        }
    }
}

/// Wire message: `[8 byte send timestamp][payload]`
///
/// Cloning is cheap; fan-out hands the same buffer to every session.
#[derive(Clone, PartialEq, Eq)]
pub struct Message {
    bytes: Bytes,
}

impl Message {
    /// Wrap bytes received from the network; relays never look inside
    pub fn from_wire(bytes: impl Into<Bytes>) -> Self {
        Self {
            bytes: bytes.into(),
        }
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn into_bytes(self) -> Bytes {
        self.bytes
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    pub fn send_timestamp(&self, order: ByteOrder) -> Option<u64> {
        decode_header(&self.bytes, order)
    }

    pub fn payload(&self) -> &[u8] {
        self.bytes.get(TIMESTAMP_BYTES..).unwrap_or_default()
    }
}

impl fmt::Debug for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Message")
            .field("len", &self.bytes.len())
            .finish()
    }
}

/// Message as seen by the terminal hop, with its receipt time
#[derive(Debug, Clone)]
pub struct ReceivedMessage {
    pub message: Message,
    pub recv_ns: u64,
}

/// Registry-assigned session identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionId(pub u64);

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "session-{}", self.0)
    }
}
