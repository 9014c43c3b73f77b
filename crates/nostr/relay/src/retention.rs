//! Per-pubkey retention
//!
//! After a write, every configured rule is applied to the author's rows on
//! its own: a `time` bound drops rows older than the window, a `count` bound
//! keeps only the newest N. Rules may overlap and compound. Operator, admin
//! and whitelisted pubkeys are never pruned.

use crate::config::ExemptionsConfig;
use crate::storage::{EventStore, StorageResult};
use dashmap::DashSet;
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Kind number or range [start, end]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum KindOrRange {
    Single(u16),
    Range(u16, u16),
}

impl KindOrRange {
    /// Inclusive `(low, high)`. A range may be written in either order.
    pub fn bounds(&self) -> (u16, u16) {
        match *self {
            Self::Single(k) => (k, k),
            Self::Range(a, b) => (a.min(b), a.max(b)),
        }
    }

    pub fn contains(&self, kind: u16) -> bool {
        let (low, high) = self.bounds();
        (low..=high).contains(&kind)
    }
}

/// One retention rule
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetentionRule {
    /// Event kinds (or ranges) this rule applies to; all kinds when absent or empty
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kinds: Option<Vec<KindOrRange>>,

    /// Maximum age in seconds
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub time: Option<u64>,

    /// Maximum number of events kept
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub count: Option<usize>,
}

impl RetentionRule {
    /// A rule with neither bound does nothing.
    pub fn is_inert(&self) -> bool {
        self.time.is_none() && self.count.is_none()
    }

    fn kind_set(&self) -> Option<&[KindOrRange]> {
        self.kinds.as_deref().filter(|kinds| !kinds.is_empty())
    }
}

/// Pubkeys exempt from retention. Safe to update while connections run.
#[derive(Debug, Default)]
pub struct ExemptionList {
    pubkeys: DashSet<String>,
}

impl ExemptionList {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, pubkey: impl Into<String>) -> bool {
        self.pubkeys.insert(pubkey.into())
    }

    pub fn remove(&self, pubkey: &str) -> bool {
        self.pubkeys.remove(pubkey).is_some()
    }

    pub fn contains(&self, pubkey: &str) -> bool {
        self.pubkeys.contains(pubkey)
    }

    pub fn len(&self) -> usize {
        self.pubkeys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pubkeys.is_empty()
    }
}

impl From<&ExemptionsConfig> for ExemptionList {
    fn from(config: &ExemptionsConfig) -> Self {
        let list = Self::new();
        for pubkey in config
            .operator_pubkey
            .iter()
            .chain(&config.admin_pubkeys)
            .chain(&config.whitelist)
        {
            list.add(pubkey.clone());
        }
        list
    }
}

/// Rules plus exemptions.
#[derive(Debug, Default)]
pub struct RetentionPolicy {
    rules: Vec<RetentionRule>,
    exemptions: ExemptionList,
}

impl RetentionPolicy {
    pub fn new(rules: Vec<RetentionRule>, exemptions: ExemptionList) -> Self {
        Self { rules, exemptions }
    }

    pub fn rules(&self) -> &[RetentionRule] {
        &self.rules
    }

    pub fn exemptions(&self) -> &ExemptionList {
        &self.exemptions
    }

    pub fn is_exempt(&self, pubkey: &str) -> bool {
        self.exemptions.contains(pubkey)
    }

    /// Apply every rule to `pubkey`'s rows. Returns the number of rows removed.
    pub fn apply<S: EventStore + ?Sized>(
        &self,
        store: &S,
        pubkey: &str,
        now: u64,
    ) -> StorageResult<usize> {
        if self.rules.is_empty() || self.is_exempt(pubkey) {
            return Ok(0);
        }

        let mut removed = 0;
        for rule in self.rules.iter().filter(|rule| !rule.is_inert()) {
            if let Some(max_age) = rule.time {
                let cutoff = now.saturating_sub(max_age);
                removed += store.prune_older_than(pubkey, rule.kind_set(), cutoff)?;
            }
            if let Some(keep) = rule.count {
                removed += store.prune_beyond_count(pubkey, rule.kind_set(), keep)?;
            }
        }

        if removed > 0 {
            debug!(pubkey = %pubkey, removed, "retention pruned events");
        }
        Ok(removed)
    }
}
