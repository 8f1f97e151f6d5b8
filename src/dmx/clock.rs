//! Lamport logical clock and the request priority order.

use std::cmp::Ordering;

use serde::{Deserialize, Serialize};

/// Lamport logical clock.
///
/// The value never decreases. Local events advance it by one; every
/// received timestamp pulls it to `max(local, remote) + 1`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LamportClock(u64);

impl LamportClock {
    /// Create a clock starting at zero.
    pub fn new() -> Self {
        LamportClock(0)
    }

    /// Current value.
    #[inline]
    pub fn now(&self) -> u64 {
        self.0
    }

    /// Advance for a local event and return the new value.
    #[inline]
    pub fn tick(&mut self) -> u64 {
        self.0 += 1;
        self.0
    }

    /// Synchronize with a timestamp carried by an inbound message.
    ///
    /// Must run exactly once per received message, before any decision that
    /// reads the clock.
    #[inline]
    pub fn observe(&mut self, remote_ts: u64) -> u64 {
        self.0 = self.0.max(remote_ts) + 1;
        self.0
    }
}

/// A process's current or most recent access request.
///
/// Ordered by timestamp, ties broken by the lower requester id. This is the
/// priority rule of the whole algorithm.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestRecord {
    pub requester: u32,
    pub timestamp: u64,
}

impl RequestRecord {
    pub fn new(requester: u32, timestamp: u64) -> Self {
        RequestRecord { requester, timestamp }
    }

    /// True if `self` has priority over `other`.
    #[inline]
    pub fn precedes(&self, other: &RequestRecord) -> bool {
        self < other
    }
}

impl Ord for RequestRecord {
    fn cmp(&self, other: &Self) -> Ordering {
        self.timestamp
            .cmp(&other.timestamp)
            .then(self.requester.cmp(&other.requester))
    }
}

impl PartialOrd for RequestRecord {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}
