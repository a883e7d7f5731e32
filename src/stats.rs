//! Channel counters
//!
//! `StatsMap` is a shared, string-keyed counter map. Channels record
//! their delivery outcomes under `<channel>_<metric>` keys; the bus
//! facade adds `<channel>_published`. Handles are cheap to clone and
//! all point at the same counters.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

/// Counters emitted by the bus
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Metric {
    /// Every subscriber acked the message
    Delivered,
    /// A delivery was routed to the dead letter queue
    DeadLettered,
    /// A delivery was explicitly nacked
    Nacked,
    /// A delivery was nacked by its timeout
    TimedOut,
    /// A publish hit the throttle threshold
    Throttled,
    /// A message was published through the bus facade
    Published,
}

impl Metric {
    /// Key suffix for this metric
    pub fn as_str(&self) -> &'static str {
        match self {
            Metric::Delivered => "delivered",
            Metric::DeadLettered => "dead_lettered",
            Metric::Nacked => "nacked",
            Metric::TimedOut => "timed_out",
            Metric::Throttled => "throttled",
            Metric::Published => "published",
        }
    }

    /// Full counter key for a channel
    pub fn key(&self, channel: &str) -> String {
        format!("{}_{}", channel, self.as_str())
    }
}

/// Shared counter map
#[derive(Clone, Default)]
pub struct StatsMap {
    counters: Arc<Mutex<HashMap<String, u64>>>,
}

impl StatsMap {
    /// Create an empty counter map
    pub fn new() -> Self {
        Self::default()
    }

    /// Increment a counter by one, returning the new value
    pub fn incr(&self, key: &str) -> u64 {
        self.add(key, 1)
    }

    /// Increment a counter by `n`, returning the new value
    pub fn add(&self, key: &str, n: u64) -> u64 {
        let mut counters = self.lock();
        let value = counters.entry(key.to_string()).or_insert(0);
        *value += n;
        *value
    }

    /// Read a counter (0 if never incremented)
    pub fn get(&self, key: &str) -> u64 {
        self.lock().get(key).copied().unwrap_or(0)
    }

    /// Increment a channel metric
    pub fn record(&self, channel: &str, metric: Metric) -> u64 {
        self.incr(&metric.key(channel))
    }

    /// Read a channel metric
    pub fn metric(&self, channel: &str, metric: Metric) -> u64 {
        self.get(&metric.key(channel))
    }

    /// Reset a single counter
    pub fn reset(&self, key: &str) {
        self.lock().remove(key);
    }

    /// Reset every counter
    pub fn reset_all(&self) {
        self.lock().clear();
    }

    /// Snapshot of every counter
    pub fn snapshot(&self) -> HashMap<String, u64> {
        self.lock().clone()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, u64>> {
        self.counters.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl std::fmt::Debug for StatsMap {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_map().entries(self.snapshot()).finish()
    }
}
