//! Storage adapter contract
//!
//! The relay talks to persistence only through [`EventStore`]. A backend
//! must provide:
//! - idempotent inserts (a known id is a no-op)
//! - atomic replacement per `(pubkey, kind)` or `(pubkey, kind, d-tag)`,
//!   where only a strictly newer event wins
//! - author-only soft deletion that is never reversed
//! - queries that never return deleted or expired rows

use crate::query::CompiledQuery;
use crate::retention::{KindOrRange, RetentionPolicy};
use crate::validation::EventRecord;
use nostr::{Event, KindClassification, get_deleted_event_ids, is_deletion_request};
use serde::Serialize;
use thiserror::Error;
use tracing::debug;

/// Storage errors
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("connection pool error: {0}")]
    Pool(#[from] r2d2::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("storage error: {0}")]
    Internal(String),
}

/// Result type for storage operations.
pub type StorageResult<T> = std::result::Result<T, StorageError>;

/// What a write did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOutcome {
    /// New row written.
    Inserted,
    /// Id already stored; nothing written.
    Duplicate,
    /// Older row for the same replaceable identity removed, new row written.
    Replaced,
    /// A row at least as new exists for the identity; nothing written.
    Stale,
    /// Number of rows newly hidden by a deletion.
    Deleted(usize),
    /// Ephemeral kind; never persisted.
    Ephemeral,
}

impl WriteOutcome {
    /// Whether the event is newly visible and should be fanned out.
    pub fn is_new(&self) -> bool {
        matches!(self, Self::Inserted | Self::Replaced | Self::Ephemeral)
    }
}

/// Row counts for operators.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct StoreStatistics {
    pub total: u64,
    pub notes: u64,
    pub profiles: u64,
    pub direct_messages: u64,
    pub reactions: u64,
    pub reposts: u64,
    pub zaps: u64,
    pub channels: u64,
    pub reports: u64,
    pub long_form: u64,
    pub deleted: u64,
}

/// Abstract event store.
pub trait EventStore: Send + Sync {
    /// Append a regular event. Duplicate ids are not an error.
    fn insert(&self, record: &EventRecord) -> StorageResult<WriteOutcome>;

    /// Keep only the newest event per replaceable identity, atomically.
    fn replace(&self, record: &EventRecord) -> StorageResult<WriteOutcome>;

    /// Hide the listed events, but only those stored with pubkey `author`.
    fn delete(&self, ids: &[String], author: &str, now: u64) -> StorageResult<WriteOutcome>;

    /// Run a compiled query. Rows come back newest first.
    fn query(&self, query: &CompiledQuery) -> StorageResult<Vec<Event>>;

    /// Physically remove rows expired at `now`. Returns the count removed.
    fn purge_expired(&self, now: u64) -> StorageResult<usize>;

    /// Remove `pubkey`'s rows created before `cutoff`, optionally only for `kinds`.
    fn prune_older_than(
        &self,
        pubkey: &str,
        kinds: Option<&[KindOrRange]>,
        cutoff: u64,
    ) -> StorageResult<usize>;

    /// Remove `pubkey`'s rows beyond the `keep` newest, optionally only for `kinds`.
    fn prune_beyond_count(
        &self,
        pubkey: &str,
        kinds: Option<&[KindOrRange]>,
        keep: usize,
    ) -> StorageResult<usize>;

    fn statistics(&self) -> StorageResult<StoreStatistics>;

    /// Dispatch a validated event by kind.
    ///
    /// Ephemeral kinds are not stored. Replaceable and addressable kinds go
    /// through [`replace`](Self::replace). A deletion request is stored and
    /// then hides its targets.
    fn save(&self, record: &EventRecord, now: u64) -> StorageResult<WriteOutcome> {
        match record.classification() {
            KindClassification::Ephemeral => Ok(WriteOutcome::Ephemeral),
            KindClassification::Replaceable | KindClassification::Addressable => {
                self.replace(record)
            }
            KindClassification::Regular if is_deletion_request(&record.event) => {
                self.insert_deletion(record, now)
            }
            KindClassification::Regular => self.insert(record),
        }
    }

    /// Store a deletion request and hide its targets.
    ///
    /// The targets are hidden again when the request is already stored, so a
    /// retry after a failed delete still takes effect. Backends that can
    /// should do both in one transaction.
    fn insert_deletion(&self, record: &EventRecord, now: u64) -> StorageResult<WriteOutcome> {
        let outcome = self.insert(record)?;
        let targets = get_deleted_event_ids(&record.event);
        let deleted = self.delete(&targets, &record.event.pubkey, now)?;
        debug!(event_id = %record.event.id, ?outcome, ?deleted, "applied deletion request");
        Ok(outcome)
    }

    /// Purge expired rows, then apply retention for `pubkey`.
    fn cleanup(&self, pubkey: &str, policy: &RetentionPolicy, now: u64) -> StorageResult<usize> {
        let expired = self.purge_expired(now)?;
        let pruned = policy.apply(self, pubkey, now)?;
        Ok(expired + pruned)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nostr::{EventTemplate, finalize_event, generate_secret_key};
    use std::collections::HashSet;
    use std::sync::Mutex;

    /// In-memory store whose first `delete` call fails.
    #[derive(Default)]
    struct FlakyStore {
        ids: Mutex<HashSet<String>>,
        delete_calls: Mutex<usize>,
    }

    impl EventStore for FlakyStore {
        fn insert(&self, record: &EventRecord) -> StorageResult<WriteOutcome> {
            if self.ids.lock().unwrap().insert(record.event.id.clone()) {
                Ok(WriteOutcome::Inserted)
            } else {
                Ok(WriteOutcome::Duplicate)
            }
        }
        fn replace(&self, record: &EventRecord) -> StorageResult<WriteOutcome> {
            self.insert(record)
        }
        fn delete(&self, ids: &[String], _: &str, _: u64) -> StorageResult<WriteOutcome> {
            let mut calls = self.delete_calls.lock().unwrap();
            *calls += 1;
            if *calls == 1 {
                return Err(StorageError::Internal("disk full".to_string()));
            }
            Ok(WriteOutcome::Deleted(ids.len()))
        }
        fn query(&self, _: &CompiledQuery) -> StorageResult<Vec<Event>> {
            Ok(Vec::new())
        }
        fn purge_expired(&self, _: u64) -> StorageResult<usize> {
            Ok(0)
        }
        fn prune_older_than(&self, _: &str, _: Option<&[KindOrRange]>, _: u64) -> StorageResult<usize> {
            Ok(0)
        }
        fn prune_beyond_count(&self, _: &str, _: Option<&[KindOrRange]>, _: usize) -> StorageResult<usize> {
            Ok(0)
        }
        fn statistics(&self) -> StorageResult<StoreStatistics> {
            Ok(StoreStatistics::default())
        }
    }

    fn deletion_request(target: &str) -> EventRecord {
        let template = EventTemplate {
            created_at: 1_700_000_000,
            kind: 5,
            tags: vec![vec!["e".to_string(), target.to_string()]],
            content: String::new(),
        };
        EventRecord::new(finalize_event(&template, &generate_secret_key()).unwrap(), None)
    }

    #[test]
    fn test_deletion_retried_after_failed_delete() {
        let store = FlakyStore::default();
        let request = deletion_request(&"ab".repeat(32));

        assert!(store.save(&request, 1_700_000_000).is_err());
        assert_eq!(
            store.save(&request, 1_700_000_000).unwrap(),
            WriteOutcome::Duplicate
        );
        assert_eq!(*store.delete_calls.lock().unwrap(), 2);
    }

    #[test]
    fn test_ephemeral_never_reaches_store() {
        let store = FlakyStore::default();
        let template = EventTemplate {
            created_at: 1_700_000_000,
            kind: 20001,
            tags: vec![],
            content: "typing".to_string(),
        };
        let record = EventRecord::new(finalize_event(&template, &generate_secret_key()).unwrap(), None);

        assert_eq!(store.save(&record, 0).unwrap(), WriteOutcome::Ephemeral);
        assert!(store.ids.lock().unwrap().is_empty());
    }
}
