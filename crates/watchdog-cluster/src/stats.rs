//! Per-type bus message counters.

use std::sync::atomic::{AtomicU64, Ordering};

use crate::message::MessageType;

const TYPES: usize = MessageType::ALL.len();

/// Lock-free counters updated from send completions and inbound handling.
#[derive(Debug, Default)]
pub struct BusStats {
    sent: [AtomicU64; TYPES],
    received: [AtomicU64; TYPES],
    send_errors: AtomicU64,
}

/// Point-in-time copy of [`BusStats`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct BusStatsSnapshot {
    pub sent: [u64; TYPES],
    pub received: [u64; TYPES],
    pub send_errors: u64,
}

impl BusStatsSnapshot {
    pub fn sent(&self, kind: MessageType) -> u64 {
        self.sent[kind.as_u16() as usize]
    }

    pub fn received(&self, kind: MessageType) -> u64 {
        self.received[kind.as_u16() as usize]
    }

    pub fn total_sent(&self) -> u64 {
        self.sent.iter().sum()
    }

    pub fn total_received(&self) -> u64 {
        self.received.iter().sum()
    }
}

impl BusStats {
    pub fn record_sent(&self, kind: MessageType) {
        self.sent[kind.as_u16() as usize].fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_received(&self, kind: MessageType) {
        self.received[kind.as_u16() as usize].fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_send_error(&self) {
        self.send_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> BusStatsSnapshot {
        BusStatsSnapshot {
            sent: std::array::from_fn(|i| self.sent[i].load(Ordering::Relaxed)),
            received: std::array::from_fn(|i| self.received[i].load(Ordering::Relaxed)),
            send_errors: self.send_errors.load(Ordering::Relaxed),
        }
    }
}
