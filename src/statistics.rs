//! Counters for control traffic.

use std::sync::atomic::{AtomicU64, Ordering::Relaxed};

use serde::Serialize;

#[derive(Debug, Default)]
pub struct Statistics {
    setups: AtomicU64,
    stalls: AtomicU64,
    aborted: AtomicU64,
    bytes_sent: AtomicU64,
    registry_swaps: AtomicU64,
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct StatisticsSnapshot {
    pub setups: u64,
    pub stalls: u64,
    pub aborted: u64,
    pub bytes_sent: u64,
    pub registry_swaps: u64,
}

impl Statistics {
    pub(crate) fn setup(&self) {
        self.setups.fetch_add(1, Relaxed);
    }

    pub(crate) fn stall(&self) {
        self.stalls.fetch_add(1, Relaxed);
    }

    pub(crate) fn abort(&self) {
        self.aborted.fetch_add(1, Relaxed);
    }

    pub(crate) fn sent(&self, bytes: usize) {
        self.bytes_sent.fetch_add(bytes as u64, Relaxed);
    }

    pub(crate) fn swap(&self) {
        self.registry_swaps.fetch_add(1, Relaxed);
    }

    pub fn snapshot(&self) -> StatisticsSnapshot {
        StatisticsSnapshot {
            setups: self.setups.load(Relaxed),
            stalls: self.stalls.load(Relaxed),
            aborted: self.aborted.load(Relaxed),
            bytes_sent: self.bytes_sent.load(Relaxed),
            registry_swaps: self.registry_swaps.load(Relaxed),
        }
    }
}
