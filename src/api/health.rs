//! Shared health state for the /health and /stats endpoints.
//! Updated by the feed collector, read by the API.

use std::sync::atomic::{AtomicI64, AtomicU64, AtomicU8, Ordering};

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;

use crate::types::CollectorState;

/// Feed collector metrics.
#[derive(Default)]
pub struct HealthState {
    /// `CollectorState` as a byte.
    collector_state: AtomicU8,
    pub messages_received: AtomicU64,
    pub orders_upserted: AtomicU64,
    pub decode_failures: AtomicU64,
    pub storage_failures: AtomicU64,
    pub reconnects: AtomicU64,
    /// Unix seconds of the last inbound feed message (0 = none).
    last_message_at: AtomicI64,
    /// Dropped deltas per unknown location code.
    unknown_locations: DashMap<u32, u64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct CollectorReport {
    pub state: CollectorState,
    pub messages_received: u64,
    pub orders_upserted: u64,
    pub decode_failures: u64,
    pub storage_failures: u64,
    pub reconnects: u64,
    pub last_message_at: Option<DateTime<Utc>>,
    /// (location code, dropped deltas), sorted by code.
    pub unknown_locations: Vec<(u32, u64)>,
}

impl HealthState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_state(&self, s: CollectorState) {
        self.collector_state.store(s.as_u8(), Ordering::Relaxed);
    }

    pub fn state(&self) -> CollectorState {
        CollectorState::from_u8(self.collector_state.load(Ordering::Relaxed))
    }

    pub fn mark_message(&self, at: DateTime<Utc>) {
        self.messages_received.fetch_add(1, Ordering::Relaxed);
        self.last_message_at.store(at.timestamp(), Ordering::Relaxed);
    }

    pub fn add_upserted(&self, n: u64) {
        self.orders_upserted.fetch_add(n, Ordering::Relaxed);
    }

    pub fn inc_decode_failures(&self) -> u64 {
        self.decode_failures.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub fn inc_storage_failures(&self) {
        self.storage_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_reconnects(&self) {
        self.reconnects.fetch_add(1, Ordering::Relaxed);
    }

    /// Count one dropped delta for `code`. Returns the running count for that code.
    pub fn inc_unknown_location(&self, code: u32) -> u64 {
        let mut entry = self.unknown_locations.entry(code).or_insert(0);
        *entry += 1;
        *entry
    }

    pub fn last_message_at(&self) -> Option<DateTime<Utc>> {
        match self.last_message_at.load(Ordering::Relaxed) {
            0 => None,
            secs => DateTime::from_timestamp(secs, 0),
        }
    }

    pub fn report(&self) -> CollectorReport {
        let mut unknown: Vec<(u32, u64)> = self
            .unknown_locations
            .iter()
            .map(|e| (*e.key(), *e.value()))
            .collect();
        unknown.sort_unstable();
        CollectorReport {
            state: self.state(),
            messages_received: self.messages_received.load(Ordering::Relaxed),
            orders_upserted: self.orders_upserted.load(Ordering::Relaxed),
            decode_failures: self.decode_failures.load(Ordering::Relaxed),
            storage_failures: self.storage_failures.load(Ordering::Relaxed),
            reconnects: self.reconnects.load(Ordering::Relaxed),
            last_message_at: self.last_message_at(),
            unknown_locations: unknown,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn report_reflects_counters() {
        let h = HealthState::new();
        assert_eq!(h.state(), CollectorState::Disconnected);
        assert!(h.last_message_at().is_none());

        h.set_state(CollectorState::Subscribed);
        h.mark_message(DateTime::from_timestamp(1_700_000_000, 0).unwrap());
        h.add_upserted(3);
        assert_eq!(h.inc_unknown_location(9999), 1);
        assert_eq!(h.inc_unknown_location(9999), 2);
        h.inc_unknown_location(42);

        let r = h.report();
        assert_eq!(r.state, CollectorState::Subscribed);
        assert_eq!(r.messages_received, 1);
        assert_eq!(r.orders_upserted, 3);
        assert_eq!(r.unknown_locations, vec![(42, 1), (9999, 2)]);
        assert_eq!(r.last_message_at.unwrap().timestamp(), 1_700_000_000);
    }
}
