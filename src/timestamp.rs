//! Send-timestamp header codec and clocks
//!
//! Every message starts with an 8-byte nanosecond timestamp. Sender and
//! receiver must agree on one byte order; a mismatched pair decodes to an
//! implausible value that the sampler's overflow guard rejects.

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use crate::config::TIMESTAMP_BYTES;

/// Byte order of the timestamp header
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ByteOrder {
    #[default]
    LittleEndian,
    BigEndian,
}

#[inline(always)]
pub fn encode_header(timestamp_ns: u64, order: ByteOrder) -> [u8; TIMESTAMP_BYTES] {
    match order {
        ByteOrder::LittleEndian => timestamp_ns.to_le_bytes(),
        ByteOrder::BigEndian => timestamp_ns.to_be_bytes(),
    }
}

/// Decode the header at the start of `data`; `None` if it is too short
#[inline(always)]
pub fn decode_header(data: &[u8], order: ByteOrder) -> Option<u64> {
    let header: [u8; TIMESTAMP_BYTES] = data.get(..TIMESTAMP_BYTES)?.try_into().ok()?;
    Some(match order {
        ByteOrder::LittleEndian => u64::from_le_bytes(header),
        ByteOrder::BigEndian => u64::from_be_bytes(header),
    })
}

/// Nanosecond clock shared by the stamping and sampling ends
pub trait Clock: Send + Sync {
    fn now_nanos(&self) -> u64;
}

/// Wall clock in nanoseconds since the Unix epoch, never stepping backwards
///
/// Sender and receiver run as separate processes, so the epoch has to be
/// one both can read; readings are clamped to be non-decreasing per clock.
#[derive(Debug, Default)]
pub struct SystemClock {
    last: AtomicU64,
}

impl SystemClock {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Clock for SystemClock {
    #[inline(always)]
    fn now_nanos(&self) -> u64 {
        let wall = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos() as u64)
            .unwrap_or_default();
        let prev = self.last.fetch_max(wall, Ordering::AcqRel);
        prev.max(wall)
    }
}

/// Manually driven clock for tests and micro-benchmarks
#[derive(Debug, Default)]
pub struct ManualClock {
    now: AtomicU64,
}

impl ManualClock {
    pub fn new(start_ns: u64) -> Self {
        Self {
            now: AtomicU64::new(start_ns),
        }
    }

    pub fn set(&self, ns: u64) {
        self.now.store(ns, Ordering::SeqCst);
    }

    pub fn advance(&self, ns: u64) {
        self.now.fetch_add(ns, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now_nanos(&self) -> u64 {
        self.now.load(Ordering::SeqCst)
    }
}
