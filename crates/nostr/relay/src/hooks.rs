//! Collaborator hooks
//!
//! The relay consults a spam predicate before storing text events and
//! notifies payment and identity collaborators after certain kinds are
//! stored. None of them are implemented here beyond [`WordListSpamFilter`].

use nostr::{Event, KIND_METADATA, KIND_SHORT_TEXT_NOTE, KIND_ZAP_RECEIPT};
use std::fmt;
use std::sync::Arc;
use tracing::debug;

/// Kind 42: public chat message
const KIND_CHANNEL_MESSAGE: u16 = 42;

/// Kinds checked for spam
pub const SPAM_CHECKED_KINDS: &[u16] = &[KIND_SHORT_TEXT_NOTE, KIND_CHANNEL_MESSAGE];

pub trait SpamFilter: Send + Sync {
    fn is_spam(&self, content: &str) -> bool;
}

/// Called after a zap receipt is stored.
pub trait PaymentHook: Send + Sync {
    fn on_receipt(&self, event: &Event);
}

/// Called after profile metadata is stored.
pub trait IdentityHook: Send + Sync {
    fn on_metadata(&self, event: &Event);
}

/// The configured collaborators. All optional.
#[derive(Clone, Default)]
pub struct Hooks {
    spam: Option<Arc<dyn SpamFilter>>,
    payment: Option<Arc<dyn PaymentHook>>,
    identity: Option<Arc<dyn IdentityHook>>,
}

impl fmt::Debug for Hooks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Hooks")
            .field("spam", &self.spam.is_some())
            .field("payment", &self.payment.is_some())
            .field("identity", &self.identity.is_some())
            .finish()
    }
}

impl Hooks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_spam_filter(mut self, filter: Arc<dyn SpamFilter>) -> Self {
        self.spam = Some(filter);
        self
    }

    pub fn with_payment_hook(mut self, hook: Arc<dyn PaymentHook>) -> Self {
        self.payment = Some(hook);
        self
    }

    pub fn with_identity_hook(mut self, hook: Arc<dyn IdentityHook>) -> Self {
        self.identity = Some(hook);
        self
    }

    /// Whether `event` should be refused as spam. Only text kinds are checked.
    pub fn is_spam(&self, event: &Event) -> bool {
        match self.spam {
            Some(ref filter) if SPAM_CHECKED_KINDS.contains(&event.kind) => {
                filter.is_spam(&event.content)
            }
            _ => false,
        }
    }

    /// Notify collaborators about a newly stored event.
    pub fn after_store(&self, event: &Event) {
        match event.kind {
            KIND_ZAP_RECEIPT => {
                if let Some(ref hook) = self.payment {
                    debug!(event_id = %event.id, "payment hook");
                    hook.on_receipt(event);
                }
            }
            KIND_METADATA => {
                if let Some(ref hook) = self.identity {
                    debug!(event_id = %event.id, "identity hook");
                    hook.on_metadata(event);
                }
            }
            _ => {}
        }
    }
}

/// Spam predicate over word clusters.
///
/// Content is spam when it contains at least half of some cluster's words,
/// rounding the half down, with at least one hit. A one-word cluster
/// therefore matches on that word alone. Matching is case sensitive.
#[derive(Debug, Clone, Default)]
pub struct WordListSpamFilter {
    clusters: Vec<Vec<String>>,
}

impl WordListSpamFilter {
    pub fn new(clusters: Vec<Vec<String>>) -> Self {
        let clusters = clusters.into_iter().filter(|c| !c.is_empty()).collect();
        Self { clusters }
    }

    /// One cluster per line, words separated by whitespace. Blank lines are
    /// skipped.
    pub fn from_lines(text: &str) -> Self {
        let clusters = text
            .lines()
            .map(|line| line.split_whitespace().map(str::to_string).collect::<Vec<_>>())
            .collect();
        Self::new(clusters)
    }

    pub fn len(&self) -> usize {
        self.clusters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.clusters.is_empty()
    }
}

impl SpamFilter for WordListSpamFilter {
    fn is_spam(&self, content: &str) -> bool {
        self.clusters.iter().any(|words| {
            let needed = (words.len() / 2).max(1);
            words
                .iter()
                .filter(|w| content.contains(w.as_str()))
                .take(needed)
                .count()
                == needed
        })
    }
}
