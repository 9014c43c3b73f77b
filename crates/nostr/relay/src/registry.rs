//! Live subscription registry
//!
//! Shared by every connection task. Each open connection has a slot holding
//! its subscriptions and the sending half of its outbox. Fan-out never
//! waits: a full or closed outbox drops the frame for that connection only.

use crate::message::RelayMessage;
use crate::subscription::{Subscription, SubscriptionManager};
use crate::validation::EventRecord;
use dashmap::DashMap;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::mpsc;
use tracing::{debug, trace};

pub type ConnectionId = u64;

#[derive(Debug)]
struct ConnectionSlot {
    outbox: mpsc::Sender<String>,
    subscriptions: SubscriptionManager,
    /// Subscriptions still running their historical query, with the ids
    /// delivered live to them in the meantime
    backfilling: HashMap<String, HashSet<String>>,
}

/// Result of delivering one event to every matching subscription
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FanOut {
    pub delivered: usize,
    pub dropped: usize,
}

#[derive(Debug, Default)]
pub struct SubscriptionRegistry {
    connections: DashMap<ConnectionId, ConnectionSlot>,
    next_id: AtomicU64,
}

impl SubscriptionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a connection and return its id
    pub fn register(&self, outbox: mpsc::Sender<String>) -> ConnectionId {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.connections.insert(
            id,
            ConnectionSlot {
                outbox,
                subscriptions: SubscriptionManager::new(),
                backfilling: HashMap::new(),
            },
        );
        id
    }

    /// Remove a connection with all its subscriptions. Returns how many
    /// subscriptions went with it.
    pub fn unregister(&self, id: ConnectionId) -> usize {
        self.connections
            .remove(&id)
            .map_or(0, |(_, slot)| slot.subscriptions.len())
    }

    /// Add or replace a subscription. `None` if the connection is gone,
    /// otherwise whether an existing subscription was replaced.
    ///
    /// The subscription starts in backfill: live deliveries are recorded
    /// until [`finish_backfill`](Self::finish_backfill).
    pub fn subscribe(&self, id: ConnectionId, subscription: Subscription) -> Option<bool> {
        self.connections.get_mut(&id).map(|mut slot| {
            slot.backfilling.insert(subscription.id.clone(), HashSet::new());
            slot.subscriptions.add(subscription)
        })
    }

    /// End the backfill window and return the ids already delivered live,
    /// which the historical batch must skip.
    pub fn finish_backfill(&self, id: ConnectionId, subscription_id: &str) -> HashSet<String> {
        self.connections
            .get_mut(&id)
            .and_then(|mut slot| slot.backfilling.remove(subscription_id))
            .unwrap_or_default()
    }

    pub fn unsubscribe(&self, id: ConnectionId, subscription_id: &str) -> bool {
        self.connections.get_mut(&id).is_some_and(|mut slot| {
            slot.backfilling.remove(subscription_id);
            slot.subscriptions.remove(subscription_id)
        })
    }

    pub fn has_subscription(&self, id: ConnectionId, subscription_id: &str) -> bool {
        self.connections
            .get(&id)
            .is_some_and(|slot| slot.subscriptions.contains(subscription_id))
    }

    pub fn subscription_count(&self, id: ConnectionId) -> usize {
        self.connections
            .get(&id)
            .map_or(0, |slot| slot.subscriptions.len())
    }

    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    /// Queue one EVENT frame per matching subscription on every connection.
    pub fn fan_out(&self, record: &EventRecord, now: u64) -> FanOut {
        let mut result = FanOut::default();
        for mut entry in self.connections.iter_mut() {
            let connection = *entry.key();
            let ConnectionSlot {
                outbox,
                subscriptions,
                backfilling,
            } = entry.value_mut();
            for subscription_id in subscriptions.matching(record, now) {
                let frame = RelayMessage::Event {
                    subscription_id,
                    event: &record.event,
                }
                .to_json();
                match outbox.try_send(frame) {
                    Ok(()) => {
                        result.delivered += 1;
                        if let Some(seen) = backfilling.get_mut(subscription_id) {
                            seen.insert(record.event.id.clone());
                        }
                    }
                    Err(e) => {
                        result.dropped += 1;
                        debug!(connection, subscription_id, "dropping live event: {}", e);
                    }
                }
            }
        }
        trace!(event_id = %record.event.id, ?result, "fan-out");
        result
    }
}
