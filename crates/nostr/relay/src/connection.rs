//! Per-connection protocol handling
//!
//! A [`Connection`] owns the protocol state of one client: its lifecycle
//! state, outstanding AUTH challenge and authenticated pubkey. Frames are
//! handled in arrival order; each call returns the frames to write back, in
//! order, before anything queued in the outbox by live fan-out.
//!
//! Shared state lives in [`RelayContext`]: storage, the subscription
//! registry, the bus, retention, hooks and metrics.

use crate::broadcast::{BroadcastEvent, EventBus, LocalBus, SeenEvents};
use crate::config::{Limits, RelayConfig, ServerConfig};
use crate::hooks::Hooks;
use crate::message::{ClientMessage, RelayMessage};
use crate::metrics::{Rejection, RelayMetrics};
use crate::query::QueryCompiler;
use crate::registry::{ConnectionId, SubscriptionRegistry};
use crate::retention::{ExemptionList, RetentionPolicy};
use crate::storage::{EventStore, StorageError, StorageResult, WriteOutcome};
use crate::subscription::{Filter, Subscription};
use crate::validation::{self, EventRecord, ValidationPolicy};
use nostr::{Event, KIND_ENCRYPTED_DIRECT_MESSAGE, validate_auth_event};
use rand::Rng;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Generate a random challenge string for NIP-42 AUTH
pub fn generate_auth_challenge() -> String {
    let mut rng = rand::rng();
    let bytes: [u8; 16] = rng.random();
    hex::encode(bytes)
}

/// State shared by every connection of one relay instance
pub struct RelayContext {
    store: Arc<dyn EventStore>,
    registry: SubscriptionRegistry,
    bus: Arc<dyn EventBus>,
    seen: SeenEvents,
    retention: Arc<RetentionPolicy>,
    hooks: Hooks,
    metrics: Arc<RelayMetrics>,
    validation: ValidationPolicy,
    compiler: QueryCompiler,
    limits: Limits,
    server: ServerConfig,
}

impl RelayContext {
    pub fn new(config: &RelayConfig, store: Arc<dyn EventStore>) -> Self {
        let retention = RetentionPolicy::new(
            config.retention.clone(),
            ExemptionList::from(&config.exemptions),
        );
        Self {
            store,
            registry: SubscriptionRegistry::new(),
            bus: Arc::new(LocalBus::new()),
            seen: SeenEvents::default(),
            retention: Arc::new(retention),
            hooks: Hooks::new(),
            metrics: Arc::new(RelayMetrics::new()),
            validation: ValidationPolicy::from(&config.limits),
            compiler: QueryCompiler::new((&config.limits).into()),
            limits: config.limits.clone(),
            server: config.server.clone(),
        }
    }

    pub fn with_bus(mut self, bus: Arc<dyn EventBus>) -> Self {
        self.bus = bus;
        self
    }

    pub fn with_hooks(mut self, hooks: Hooks) -> Self {
        self.hooks = hooks;
        self
    }

    pub fn store(&self) -> &Arc<dyn EventStore> {
        &self.store
    }

    pub fn registry(&self) -> &SubscriptionRegistry {
        &self.registry
    }

    pub fn bus(&self) -> &Arc<dyn EventBus> {
        &self.bus
    }

    pub fn retention(&self) -> &RetentionPolicy {
        &self.retention
    }

    pub fn metrics(&self) -> &Arc<RelayMetrics> {
        &self.metrics
    }

    pub fn limits(&self) -> &Limits {
        &self.limits
    }

    pub fn server_config(&self) -> &ServerConfig {
        &self.server
    }

    /// Fan an event accepted by this instance out locally, then publish it
    /// to sibling instances.
    pub fn publish(&self, record: &EventRecord, now: u64) {
        self.seen.insert(&record.event.id);
        self.deliver(record, now);
        self.bus.publish(record);
    }

    /// Handle an envelope from the bus. Our own envelopes and already
    /// delivered events are ignored.
    pub fn receive(&self, envelope: &BroadcastEvent, now: u64) -> bool {
        if envelope.origin == self.bus.instance_id() {
            return false;
        }
        if !self.seen.insert(&envelope.record.event.id) {
            debug!(event_id = %envelope.record.event.id, "ignoring re-delivered event");
            return false;
        }
        self.deliver(&envelope.record, now);
        true
    }

    fn deliver(&self, record: &EventRecord, now: u64) {
        let result = self.registry.fan_out(record, now);
        for _ in 0..result.delivered {
            self.metrics.delivered();
        }
        for _ in 0..result.dropped {
            self.metrics.delivery_dropped();
        }
    }

    /// Run a storage call off the async runtime.
    async fn blocking<T, F>(&self, f: F) -> StorageResult<T>
    where
        T: Send + 'static,
        F: FnOnce(&dyn EventStore) -> StorageResult<T> + Send + 'static,
    {
        let store = Arc::clone(&self.store);
        tokio::task::spawn_blocking(move || f(store.as_ref()))
            .await
            .map_err(|e| StorageError::Internal(e.to_string()))?
    }
}

/// Lifecycle of a connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connecting,
    Open,
    Closed,
}

/// Protocol state of one client connection
pub struct Connection {
    ctx: Arc<RelayContext>,
    peer: String,
    id: Option<ConnectionId>,
    state: ConnectionState,
    challenge: Option<String>,
    authenticated: Option<String>,
}

impl Connection {
    pub fn new(ctx: Arc<RelayContext>, peer: impl Into<String>) -> Self {
        Self {
            ctx,
            peer: peer.into(),
            id: None,
            state: ConnectionState::Connecting,
            challenge: None,
            authenticated: None,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn id(&self) -> Option<ConnectionId> {
        self.id
    }

    pub fn authenticated_pubkey(&self) -> Option<&str> {
        self.authenticated.as_deref()
    }

    /// Register with the relay. Returns the greeting frames: an AUTH
    /// challenge when authentication is required.
    pub fn open(&mut self, outbox: mpsc::Sender<String>) -> Vec<String> {
        if self.state != ConnectionState::Connecting {
            return Vec::new();
        }
        self.id = Some(self.ctx.registry.register(outbox));
        self.state = ConnectionState::Open;
        self.ctx.metrics.connection_opened();
        info!(peer = %self.peer, connection = ?self.id, "connection open");

        let mut out = Vec::new();
        if self.ctx.limits.auth_required {
            self.push_challenge(&mut out);
        }
        out
    }

    /// Remove subscriptions and stop accepting frames. Safe to call twice.
    pub fn close(&mut self) {
        if self.state == ConnectionState::Closed {
            return;
        }
        if let Some(id) = self.id.take() {
            let removed = self.ctx.registry.unregister(id);
            self.ctx.metrics.subscriptions_closed(removed);
            self.ctx.metrics.connection_closed();
        }
        self.state = ConnectionState::Closed;
        self.challenge = None;
        debug!(peer = %self.peer, "connection closed");
    }

    /// Handle one text frame and return the frames to send back.
    pub async fn handle_text(&mut self, text: &str) -> Vec<String> {
        let mut out = Vec::new();
        if self.state != ConnectionState::Open {
            return out;
        }
        self.ctx.metrics.bytes_in(text.len());

        let max = self.ctx.server.max_message_size;
        if text.len() > max {
            warn!(peer = %self.peer, size = text.len(), max, "message exceeds size limit");
            let notice = format!("invalid: message too large: {} bytes (max {})", text.len(), max);
            out.push(RelayMessage::Notice(&notice).to_json());
            return out;
        }

        match ClientMessage::parse(text) {
            Ok(ClientMessage::Event(event)) => self.handle_event(*event, &mut out).await,
            Ok(ClientMessage::Req {
                subscription_id,
                filters,
            }) => self.handle_req(subscription_id, filters, &mut out).await,
            Ok(ClientMessage::Close(subscription_id)) => self.handle_close(&subscription_id, &mut out),
            Ok(ClientMessage::Auth(event)) => self.handle_auth(&event, &mut out),
            Err(e) => {
                debug!(peer = %self.peer, "malformed frame: {}", e);
                let reason = e.reason();
                match e.event_id() {
                    Some(event_id) => {
                        self.ctx.metrics.event_received();
                        self.ctx.metrics.event_rejected(Rejection::Invalid);
                        push_ok(&mut out, event_id, false, &reason);
                    }
                    None => out.push(RelayMessage::Notice(&reason).to_json()),
                }
            }
        }

        for frame in &out {
            self.ctx.metrics.bytes_out(frame.len());
        }
        out
    }

    async fn handle_event(&mut self, event: Event, out: &mut Vec<String>) {
        let ctx = Arc::clone(&self.ctx);
        ctx.metrics.event_received();
        let event_id = event.id.clone();

        if ctx.limits.auth_required && self.authenticated.is_none() {
            ctx.metrics.event_rejected(Rejection::Restricted);
            push_ok(out, &event_id, false, "restricted: authentication required");
            if self.challenge.is_none() {
                self.push_challenge(out);
            }
            return;
        }

        let now = crate::unix_now();
        let record = match validation::validate(event, &ctx.validation, now) {
            Ok(record) => record,
            Err(e) => {
                debug!(event_id = %event_id, "rejected event: {}", e);
                ctx.metrics.event_rejected(Rejection::Invalid);
                push_ok(out, &event_id, false, &e.reason());
                return;
            }
        };

        if ctx.hooks.is_spam(&record.event) {
            debug!(event_id = %event_id, "rejected spam");
            ctx.metrics.event_rejected(Rejection::Restricted);
            push_ok(out, &event_id, false, "restricted: content looks like spam");
            return;
        }

        let stored = record.clone();
        let outcome = ctx.blocking(move |store| store.save(&stored, now)).await;
        let outcome = match outcome {
            Ok(outcome) => outcome,
            Err(e) => {
                warn!(event_id = %event_id, "failed to store event: {}", e);
                ctx.metrics.storage_error();
                ctx.metrics.event_rejected(Rejection::Storage);
                push_ok(out, &event_id, false, "error: could not store event");
                return;
            }
        };

        debug!(event_id = %event_id, ?outcome, "event processed");
        push_ok(out, &event_id, true, "");

        if !outcome.is_new() {
            ctx.metrics.event_ignored();
            return;
        }
        ctx.metrics.event_accepted();
        ctx.publish(&record, now);

        if matches!(outcome, WriteOutcome::Inserted | WriteOutcome::Replaced) {
            ctx.hooks.after_store(&record.event);
            self.spawn_cleanup(record.event.pubkey, now);
        }
    }

    /// Purge and retention run after the OK; failures are only logged.
    fn spawn_cleanup(&self, pubkey: String, now: u64) {
        let store = Arc::clone(&self.ctx.store);
        let policy = Arc::clone(&self.ctx.retention);
        tokio::task::spawn_blocking(move || {
            if let Err(e) = store.cleanup(&pubkey, &policy, now) {
                warn!(pubkey = %pubkey, "cleanup failed: {}", e);
            }
        });
    }

    async fn handle_req(
        &mut self,
        subscription_id: String,
        filters: Vec<Filter>,
        out: &mut Vec<String>,
    ) {
        let ctx = Arc::clone(&self.ctx);
        let Some(conn) = self.id else {
            return;
        };

        if let Err(reason) = check_subscription_id(&subscription_id, ctx.limits.max_subid_length) {
            out.push(RelayMessage::Notice(&reason).to_json());
            return;
        }
        if filters.len() > ctx.limits.max_filters {
            let notice = format!(
                "invalid: too many filters: {} (max {})",
                filters.len(),
                ctx.limits.max_filters
            );
            out.push(RelayMessage::Notice(&notice).to_json());
            return;
        }
        let replacing = ctx.registry.has_subscription(conn, &subscription_id);
        if !replacing && ctx.registry.subscription_count(conn) >= ctx.limits.max_subscriptions {
            let notice = format!(
                "restricted: too many subscriptions (max {})",
                ctx.limits.max_subscriptions
            );
            out.push(RelayMessage::Notice(&notice).to_json());
            return;
        }

        let now = crate::unix_now();
        let query = match ctx.compiler.compile(&filters, now) {
            Ok(query) => query,
            Err(e) => {
                out.push(RelayMessage::Notice(&e.reason()).to_json());
                return;
            }
        };

        if ctx.limits.auth_required && self.authenticated.is_none() && wants_direct_messages(&filters)
        {
            out.push(
                RelayMessage::Notice("restricted: authentication required to read direct messages")
                    .to_json(),
            );
            self.push_challenge(out);
            return;
        }

        let subscription = Subscription::new(subscription_id.clone(), filters);
        match ctx.registry.subscribe(conn, subscription) {
            Some(true) => ctx.metrics.subscription_replaced(),
            Some(false) => ctx.metrics.subscription_opened(),
            None => return,
        }
        debug!(peer = %self.peer, subscription_id = %subscription_id, "subscription registered");

        ctx.metrics.query();
        let result = ctx.blocking(move |store| store.query(&query)).await;
        // events fanned out while the query ran are already in the outbox
        let live = ctx.registry.finish_backfill(conn, &subscription_id);
        match result {
            Ok(events) => {
                for event in events.iter().filter(|e| !live.contains(&e.id)) {
                    out.push(
                        RelayMessage::Event {
                            subscription_id: &subscription_id,
                            event,
                        }
                        .to_json(),
                    );
                }
            }
            Err(e) => {
                warn!(subscription_id = %subscription_id, "historical query failed: {}", e);
                ctx.metrics.storage_error();
                out.push(RelayMessage::Notice("error: could not query stored events").to_json());
            }
        }
        out.push(RelayMessage::Eose(&subscription_id).to_json());
    }

    fn handle_close(&mut self, subscription_id: &str, out: &mut Vec<String>) {
        if let Err(reason) = check_subscription_id(subscription_id, self.ctx.limits.max_subid_length)
        {
            out.push(RelayMessage::Notice(&reason).to_json());
            return;
        }
        if let Some(conn) = self.id
            && self.ctx.registry.unsubscribe(conn, subscription_id)
        {
            self.ctx.metrics.subscriptions_closed(1);
            debug!(peer = %self.peer, subscription_id, "subscription closed");
        }
    }

    fn handle_auth(&mut self, event: &Event, out: &mut Vec<String>) {
        // single use, whatever the outcome
        let Some(challenge) = self.challenge.take() else {
            push_ok(out, &event.id, false, "restricted: no authentication challenge outstanding");
            return;
        };

        let now = crate::unix_now();
        if let Err(e) = validation::check_time_window(event, now, self.ctx.validation.window) {
            push_ok(out, &event.id, false, &e.reason());
            return;
        }

        match validate_auth_event(event, &challenge, self.ctx.server.relay_url.as_deref()) {
            Ok(()) => {
                info!(peer = %self.peer, pubkey = %event.pubkey, "client authenticated");
                self.authenticated = Some(event.pubkey.clone());
                push_ok(out, &event.id, true, "");
            }
            Err(e) => {
                debug!(peer = %self.peer, "auth failed: {}", e);
                push_ok(out, &event.id, false, &format!("invalid: {}", e));
            }
        }
    }

    fn push_challenge(&mut self, out: &mut Vec<String>) {
        let challenge = generate_auth_challenge();
        out.push(RelayMessage::Auth(&challenge).to_json());
        self.challenge = Some(challenge);
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.close();
    }
}

fn push_ok(out: &mut Vec<String>, event_id: &str, accepted: bool, reason: &str) {
    out.push(
        RelayMessage::Ok {
            event_id,
            accepted,
            reason,
        }
        .to_json(),
    );
}

fn check_subscription_id(id: &str, max_len: usize) -> Result<(), String> {
    if id.is_empty() {
        return Err("invalid: subscription ID must not be empty".to_string());
    }
    if id.len() > max_len {
        return Err(format!(
            "invalid: subscription ID too long: {} (max {})",
            id.len(),
            max_len
        ));
    }
    Ok(())
}

fn wants_direct_messages(filters: &[Filter]) -> bool {
    filters.iter().any(|f| {
        f.kinds
            .as_ref()
            .is_some_and(|kinds| kinds.contains(&KIND_ENCRYPTED_DIRECT_MESSAGE))
    })
}
