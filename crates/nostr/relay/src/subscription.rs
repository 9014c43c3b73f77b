//! Subscription management and event filtering
//!
//! Manages client subscriptions and matches events against Nostr filters.
//! Filters support: ids, authors (prefixes), kinds, `#x` tag queries, since,
//! until, search and limit. Filters of one subscription are OR-ed.

use crate::validation::EventRecord;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Nostr subscription filter
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct Filter {
    /// Event id prefixes
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ids: Option<Vec<String>>,

    /// Author pubkey prefixes
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub authors: Option<Vec<String>>,

    /// List of event kinds
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kinds: Option<Vec<u16>>,

    /// Events must be newer than or equal to this (Unix timestamp)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub since: Option<u64>,

    /// Events must be older than or equal to this (Unix timestamp)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub until: Option<u64>,

    /// Maximum number of stored events to return
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limit: Option<usize>,

    /// Free-text search over content
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub search: Option<String>,

    /// Generic tag filters keyed `#<name>` (e.g. `#e`, `#p`)
    #[serde(flatten, skip_serializing_if = "HashMap::is_empty")]
    pub tags: HashMap<String, Vec<String>>,
}

impl Filter {
    /// Create a new empty filter
    pub fn new() -> Self {
        Self::default()
    }

    /// Tag filters as (tag name, accepted values). Keys without the `#`
    /// prefix are not tag filters and are ignored.
    pub fn tag_filters(&self) -> impl Iterator<Item = (&str, &[String])> {
        self.tags.iter().filter_map(|(key, values)| {
            key.strip_prefix('#')
                .filter(|name| !name.is_empty())
                .map(|name| (name, values.as_slice()))
        })
    }

    /// Whether any predicate other than `limit` is present.
    pub fn has_predicates(&self) -> bool {
        self.ids.is_some()
            || self.authors.is_some()
            || self.kinds.is_some()
            || self.since.is_some()
            || self.until.is_some()
            || self.search.is_some()
            || self.tag_filters().next().is_some()
    }

    /// Check if an event matches this filter
    pub fn matches(&self, record: &EventRecord) -> bool {
        let event = &record.event;

        if let Some(ref ids) = self.ids
            && !ids.iter().any(|id| event.id.starts_with(id.as_str()))
        {
            return false;
        }

        // Authors match the signer or the delegator
        if let Some(ref authors) = self.authors
            && !authors.iter().any(|author| {
                event.pubkey.starts_with(author.as_str())
                    || record
                        .delegator
                        .as_deref()
                        .is_some_and(|d| d.starts_with(author.as_str()))
            })
        {
            return false;
        }

        if let Some(ref kinds) = self.kinds
            && !kinds.contains(&event.kind)
        {
            return false;
        }

        if let Some(since) = self.since
            && event.created_at < since
        {
            return false;
        }

        if let Some(until) = self.until
            && event.created_at > until
        {
            return false;
        }

        if let Some(ref search) = self.search
            && !event
                .content
                .to_lowercase()
                .contains(&search.to_lowercase())
        {
            return false;
        }

        // Every tag key needs at least one [name, value] with an accepted value
        for (name, values) in self.tag_filters() {
            let has_matching_tag = event.tags.iter().any(|tag| {
                tag.len() >= 2 && tag[0] == name && values.iter().any(|v| *v == tag[1])
            });
            if !has_matching_tag {
                return false;
            }
        }

        true
    }
}

/// True when any filter matches. Stops at the first match.
pub fn matches_any(filters: &[Filter], record: &EventRecord) -> bool {
    filters.iter().any(|filter| filter.matches(record))
}

/// A client subscription
#[derive(Debug, Clone)]
pub struct Subscription {
    /// Subscription ID
    pub id: String,

    /// Filters for this subscription
    pub filters: Vec<Filter>,
}

impl Subscription {
    /// Create a new subscription
    pub fn new(id: String, filters: Vec<Filter>) -> Self {
        Self { id, filters }
    }

    /// Whether a live event should be delivered to this subscription.
    /// Expired events are never delivered.
    pub fn matches(&self, record: &EventRecord, now: u64) -> bool {
        !record.is_expired(now) && matches_any(&self.filters, record)
    }
}

/// Manages all subscriptions for a connection
#[derive(Debug, Default, Clone)]
pub struct SubscriptionManager {
    subscriptions: HashMap<String, Subscription>,
}

impl SubscriptionManager {
    /// Create a new subscription manager
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a subscription, replacing any with the same id.
    /// Returns true if one was replaced.
    pub fn add(&mut self, subscription: Subscription) -> bool {
        self.subscriptions
            .insert(subscription.id.clone(), subscription)
            .is_some()
    }

    /// Remove a subscription
    pub fn remove(&mut self, subscription_id: &str) -> bool {
        self.subscriptions.remove(subscription_id).is_some()
    }

    /// Get a subscription by ID
    pub fn get(&self, subscription_id: &str) -> Option<&Subscription> {
        self.subscriptions.get(subscription_id)
    }

    pub fn contains(&self, subscription_id: &str) -> bool {
        self.subscriptions.contains_key(subscription_id)
    }

    /// Ids of the subscriptions a live event should be delivered to
    pub fn matching(&self, record: &EventRecord, now: u64) -> Vec<&str> {
        self.subscriptions
            .values()
            .filter(|sub| sub.matches(record, now))
            .map(|sub| sub.id.as_str())
            .collect()
    }

    /// Get number of subscriptions
    pub fn len(&self) -> usize {
        self.subscriptions.len()
    }

    /// Check if there are no subscriptions
    pub fn is_empty(&self) -> bool {
        self.subscriptions.is_empty()
    }
}
