//! Cross-instance event bus
//!
//! Accepted events are fanned out to local subscribers directly by the
//! connection that stored them, then published here for sibling relay
//! instances. Each instance listens on the bus, skips its own envelopes and
//! any event id it already delivered, and hands the rest to its local
//! registry. The bus never writes to storage.

use crate::validation::EventRecord;
use rand::RngCore;
use std::collections::{HashSet, VecDeque};
use std::sync::{Mutex, PoisonError};
use tokio::sync::broadcast;

/// Channel capacity for the in-process bus
pub const BROADCAST_CAPACITY: usize = 4096;

/// Event ids remembered for duplicate suppression
pub const SEEN_CAPACITY: usize = 16_384;

/// An accepted event as it travels between instances
#[derive(Debug, Clone)]
pub struct BroadcastEvent {
    /// Instance that accepted the event
    pub origin: String,
    pub record: EventRecord,
}

/// Publish/subscribe seam between relay instances.
///
/// [`LocalBus`] covers a single process; a deployment with several
/// processes plugs an external pub/sub system in behind this trait.
pub trait EventBus: Send + Sync {
    /// Id stamped on envelopes published by this instance.
    fn instance_id(&self) -> &str;

    /// Publish an accepted event. Returns how many listeners received it.
    fn publish(&self, record: &EventRecord) -> usize;

    /// Listen for envelopes from every instance, this one included.
    fn subscribe(&self) -> broadcast::Receiver<BroadcastEvent>;
}

/// In-process bus over a tokio broadcast channel.
#[derive(Debug, Clone)]
pub struct LocalBus {
    instance_id: String,
    tx: broadcast::Sender<BroadcastEvent>,
}

impl LocalBus {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(BROADCAST_CAPACITY);
        Self {
            instance_id: generate_instance_id(),
            tx,
        }
    }

    /// Another instance on the same channel.
    pub fn sibling(&self) -> Self {
        Self {
            instance_id: generate_instance_id(),
            tx: self.tx.clone(),
        }
    }
}

impl Default for LocalBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus for LocalBus {
    fn instance_id(&self) -> &str {
        &self.instance_id
    }

    fn publish(&self, record: &EventRecord) -> usize {
        let envelope = BroadcastEvent {
            origin: self.instance_id.clone(),
            record: record.clone(),
        };
        // no receivers is not an error
        self.tx.send(envelope).unwrap_or(0)
    }

    fn subscribe(&self) -> broadcast::Receiver<BroadcastEvent> {
        self.tx.subscribe()
    }
}

fn generate_instance_id() -> String {
    let mut bytes = [0u8; 8];
    rand::rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}

/// Bounded set of recently delivered event ids. Oldest ids are forgotten first.
#[derive(Debug)]
pub struct SeenEvents {
    capacity: usize,
    inner: Mutex<SeenInner>,
}

#[derive(Debug, Default)]
struct SeenInner {
    ids: HashSet<String>,
    order: VecDeque<String>,
}

impl SeenEvents {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            inner: Mutex::new(SeenInner::default()),
        }
    }

    /// Record `id`. Returns false if it was already known.
    pub fn insert(&self, id: &str) -> bool {
        let mut inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        if inner.ids.contains(id) {
            return false;
        }
        if inner.order.len() >= self.capacity
            && let Some(oldest) = inner.order.pop_front()
        {
            inner.ids.remove(&oldest);
        }
        inner.ids.insert(id.to_string());
        inner.order.push_back(id.to_string());
        true
    }

    pub fn contains(&self, id: &str) -> bool {
        self.inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .ids
            .contains(id)
    }

    pub fn len(&self) -> usize {
        self.inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .order
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for SeenEvents {
    fn default() -> Self {
        Self::new(SEEN_CAPACITY)
    }
}
