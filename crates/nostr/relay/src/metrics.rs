//! Relay counters
//!
//! Lock-free counters updated from connection tasks, plus a serialisable
//! point-in-time [`MetricsSnapshot`].

use serde::Serialize;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::Instant;

/// How an EVENT frame was refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rejection {
    /// Failed validation (`invalid:`)
    Invalid,
    /// Refused by policy: auth, spam (`restricted:`)
    Restricted,
    /// Storage failed (`error:`)
    Storage,
}

/// Relay metrics collector
#[derive(Debug)]
pub struct RelayMetrics {
    start_time: Instant,

    pub active_connections: AtomicUsize,
    pub total_connections: AtomicU64,

    pub events_received: AtomicU64,
    /// Newly stored, replaced, or relayed ephemeral events
    pub events_accepted: AtomicU64,
    /// Duplicates and stale replacements
    pub events_ignored: AtomicU64,
    pub events_rejected_invalid: AtomicU64,
    pub events_rejected_restricted: AtomicU64,
    pub events_rejected_storage: AtomicU64,

    pub active_subscriptions: AtomicUsize,
    pub subscription_requests: AtomicU64,

    /// Historical queries run
    pub queries: AtomicU64,
    pub storage_errors: AtomicU64,

    /// Live EVENT frames queued to subscribers
    pub deliveries: AtomicU64,
    /// Live EVENT frames dropped because an outbox was full or closed
    pub deliveries_dropped: AtomicU64,

    pub bytes_received: AtomicU64,
    pub bytes_sent: AtomicU64,
}

impl RelayMetrics {
    pub fn new() -> Self {
        Self {
            start_time: Instant::now(),
            active_connections: AtomicUsize::new(0),
            total_connections: AtomicU64::new(0),
            events_received: AtomicU64::new(0),
            events_accepted: AtomicU64::new(0),
            events_ignored: AtomicU64::new(0),
            events_rejected_invalid: AtomicU64::new(0),
            events_rejected_restricted: AtomicU64::new(0),
            events_rejected_storage: AtomicU64::new(0),
            active_subscriptions: AtomicUsize::new(0),
            subscription_requests: AtomicU64::new(0),
            queries: AtomicU64::new(0),
            storage_errors: AtomicU64::new(0),
            deliveries: AtomicU64::new(0),
            deliveries_dropped: AtomicU64::new(0),
            bytes_received: AtomicU64::new(0),
            bytes_sent: AtomicU64::new(0),
        }
    }

    pub fn uptime_secs(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }

    pub fn connection_opened(&self) {
        self.active_connections.fetch_add(1, Ordering::Relaxed);
        self.total_connections.fetch_add(1, Ordering::Relaxed);
    }

    pub fn connection_closed(&self) {
        self.active_connections.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn event_received(&self) {
        self.events_received.fetch_add(1, Ordering::Relaxed);
    }

    pub fn event_accepted(&self) {
        self.events_accepted.fetch_add(1, Ordering::Relaxed);
    }

    pub fn event_ignored(&self) {
        self.events_ignored.fetch_add(1, Ordering::Relaxed);
    }

    pub fn event_rejected(&self, rejection: Rejection) {
        let counter = match rejection {
            Rejection::Invalid => &self.events_rejected_invalid,
            Rejection::Restricted => &self.events_rejected_restricted,
            Rejection::Storage => &self.events_rejected_storage,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn subscription_opened(&self) {
        self.active_subscriptions.fetch_add(1, Ordering::Relaxed);
        self.subscription_requests.fetch_add(1, Ordering::Relaxed);
    }

    /// A REQ that replaced a live subscription with the same id
    pub fn subscription_replaced(&self) {
        self.subscription_requests.fetch_add(1, Ordering::Relaxed);
    }

    pub fn subscriptions_closed(&self, count: usize) {
        self.active_subscriptions.fetch_sub(count, Ordering::Relaxed);
    }

    pub fn query(&self) {
        self.queries.fetch_add(1, Ordering::Relaxed);
    }

    pub fn storage_error(&self) {
        self.storage_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn delivered(&self) {
        self.deliveries.fetch_add(1, Ordering::Relaxed);
    }

    pub fn delivery_dropped(&self) {
        self.deliveries_dropped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn bytes_in(&self, count: usize) {
        self.bytes_received.fetch_add(count as u64, Ordering::Relaxed);
    }

    pub fn bytes_out(&self, count: usize) {
        self.bytes_sent.fetch_add(count as u64, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let load = |c: &AtomicU64| c.load(Ordering::Relaxed);
        MetricsSnapshot {
            uptime_secs: self.uptime_secs(),
            active_connections: self.active_connections.load(Ordering::Relaxed),
            total_connections: load(&self.total_connections),
            events_received: load(&self.events_received),
            events_accepted: load(&self.events_accepted),
            events_ignored: load(&self.events_ignored),
            events_rejected_invalid: load(&self.events_rejected_invalid),
            events_rejected_restricted: load(&self.events_rejected_restricted),
            events_rejected_storage: load(&self.events_rejected_storage),
            active_subscriptions: self.active_subscriptions.load(Ordering::Relaxed),
            subscription_requests: load(&self.subscription_requests),
            queries: load(&self.queries),
            storage_errors: load(&self.storage_errors),
            deliveries: load(&self.deliveries),
            deliveries_dropped: load(&self.deliveries_dropped),
            bytes_received: load(&self.bytes_received),
            bytes_sent: load(&self.bytes_sent),
        }
    }
}

impl Default for RelayMetrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Point-in-time copy of the counters
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MetricsSnapshot {
    pub uptime_secs: u64,
    pub active_connections: usize,
    pub total_connections: u64,
    pub events_received: u64,
    pub events_accepted: u64,
    pub events_ignored: u64,
    pub events_rejected_invalid: u64,
    pub events_rejected_restricted: u64,
    pub events_rejected_storage: u64,
    pub active_subscriptions: usize,
    pub subscription_requests: u64,
    pub queries: u64,
    pub storage_errors: u64,
    pub deliveries: u64,
    pub deliveries_dropped: u64,
    pub bytes_received: u64,
    pub bytes_sent: u64,
}

impl MetricsSnapshot {
    pub fn events_rejected(&self) -> u64 {
        self.events_rejected_invalid + self.events_rejected_restricted + self.events_rejected_storage
    }

    /// Share of received events that were accepted, as a percentage
    pub fn acceptance_rate(&self) -> f64 {
        if self.events_received == 0 {
            return 0.0;
        }
        (self.events_accepted as f64 / self.events_received as f64) * 100.0
    }
}
