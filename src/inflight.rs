//! Live index of a queue's unacknowledged deliveries.
//!
//! The tracker is a cache: it holds no durable state of its own and is
//! rebuilt from the latest snapshot plus operation log replay. It is the
//! single source of truth for whether a fired timer still means anything.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use serde::{Deserialize, Serialize};

use crate::timer::TimerId;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum InflightState {
    /// Handed to a consumer, waiting for its ack.
    Delivered,
    /// Expired once and waiting to be popped again.
    Ready,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct InflightEntry {
    pub receipt_id: u64,
    pub offset: u64,
    pub pop_ms: u64,
    pub invisible_until_ms: u64,
    /// Expiries this message has been through.
    pub attempts: u32,
    pub state: InflightState,
}

#[derive(Debug, Default)]
pub struct InflightTracker {
    entries: HashMap<u64, InflightEntry>,
    by_offset: BTreeMap<u64, u64>,
    ready: BTreeSet<u64>,
    timers: HashMap<u64, TimerId>,
}

impl InflightTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_entries(entries: impl IntoIterator<Item = InflightEntry>) -> Self {
        let mut tracker = Self::new();
        for entry in entries {
            tracker.insert(entry);
        }
        tracker
    }

    /// Inserts `entry`. A message is inflight at most once, so any entry for
    /// the same offset is displaced and returned together with its timer.
    pub fn insert(&mut self, entry: InflightEntry) -> Option<(InflightEntry, Option<TimerId>)> {
        let displaced = match self.by_offset.get(&entry.offset).copied() {
            Some(receipt_id) => self.remove(receipt_id),
            None => None,
        };
        let displaced = match displaced {
            Some(found) => Some(found),
            None => self.remove(entry.receipt_id),
        };
        self.by_offset.insert(entry.offset, entry.receipt_id);
        if entry.state == InflightState::Ready {
            self.ready.insert(entry.offset);
        }
        self.entries.insert(entry.receipt_id, entry);
        displaced
    }

    /// Removes a delivery and returns it with the timer that guarded it.
    pub fn remove(&mut self, receipt_id: u64) -> Option<(InflightEntry, Option<TimerId>)> {
        let entry = self.entries.remove(&receipt_id)?;
        self.by_offset.remove(&entry.offset);
        self.ready.remove(&entry.offset);
        let timer = self.timers.remove(&receipt_id);
        Some((entry, timer))
    }

    pub fn get(&self, receipt_id: u64) -> Option<&InflightEntry> {
        self.entries.get(&receipt_id)
    }

    pub fn receipt_for_offset(&self, offset: u64) -> Option<u64> {
        self.by_offset.get(&offset).copied()
    }

    pub fn set_invisible_until(&mut self, receipt_id: u64, invisible_until_ms: u64) -> bool {
        match self.entries.get_mut(&receipt_id) {
            Some(entry) => {
                entry.invisible_until_ms = invisible_until_ms;
                true
            }
            None => false,
        }
    }

    /// Binds the pending timer of a live delivery, returning the timer it
    /// replaces. Ignored for unknown receipts.
    pub fn attach_timer(&mut self, receipt_id: u64, timer: TimerId) -> Option<TimerId> {
        if !self.entries.contains_key(&receipt_id) {
            return None;
        }
        self.timers.insert(receipt_id, timer)
    }

    pub fn timer(&self, receipt_id: u64) -> Option<TimerId> {
        self.timers.get(&receipt_id).copied()
    }

    pub fn min_offset(&self) -> Option<u64> {
        self.by_offset.keys().next().copied()
    }

    /// Lowest-offset entry waiting for redelivery.
    pub fn next_ready(&self) -> Option<&InflightEntry> {
        let offset = self.ready.iter().next()?;
        let receipt_id = self.by_offset.get(offset)?;
        self.entries.get(receipt_id)
    }

    pub fn ready_len(&self) -> usize {
        self.ready.len()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &InflightEntry> {
        self.by_offset
            .values()
            .filter_map(|receipt_id| self.entries.get(receipt_id))
    }

    /// Point-in-time copy in offset order.
    pub fn entries(&self) -> Vec<InflightEntry> {
        self.iter().cloned().collect()
    }

    /// Receipts whose timer is missing, in offset order.
    pub fn unarmed(&self) -> Vec<u64> {
        self.iter()
            .map(|entry| entry.receipt_id)
            .filter(|receipt_id| !self.timers.contains_key(receipt_id))
            .collect()
    }
}
