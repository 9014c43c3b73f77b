//! Property-based tests for Nostr filter compilation and matching
//!
//! These tests use proptest to check that the live matcher and the compiled
//! SQL query agree, and that edge cases behave: empty lists, boundary values
//! for since/until, prefix lengths and multi-key tag filters.

use crate::db::{Database, DatabaseConfig};
use crate::query::{FilterError, QueryCompiler};
use crate::storage::EventStore;
use crate::subscription::Filter;
use crate::validation::EventRecord;
use nostr::{EventTemplate, finalize_event, generate_secret_key};
use proptest::prelude::*;

// =============================================================================
// Helper Functions
// =============================================================================

fn create_event_with_fields(
    kind: u16,
    content: &str,
    tags: Vec<Vec<String>>,
    created_at: u64,
) -> EventRecord {
    let secret_key = generate_secret_key();
    let template = EventTemplate {
        kind,
        tags,
        content: content.to_string(),
        created_at,
    };
    EventRecord::new(finalize_event(&template, &secret_key).unwrap(), None)
}

fn tag(name: &str, value: &str) -> Vec<String> {
    vec![name.to_string(), value.to_string()]
}

fn tag_filter(pairs: &[(&str, &[&str])]) -> Filter {
    let mut filter = Filter::new();
    for (name, values) in pairs {
        filter.tags.insert(
            format!("#{}", name),
            values.iter().map(|v| v.to_string()).collect(),
        );
    }
    filter
}

fn create_test_db() -> (Database, tempfile::TempDir) {
    let temp_dir = tempfile::tempdir().unwrap();
    let config = DatabaseConfig {
        path: temp_dir.path().join("props.db"),
        ..Default::default()
    };
    (Database::new(config).unwrap(), temp_dir)
}

/// Whether the stored query for `filter` returns `record`.
fn sql_matches(db: &Database, filter: &Filter, record: &EventRecord) -> bool {
    let query = QueryCompiler::default()
        .compile(std::slice::from_ref(filter), record.event.created_at)
        .unwrap();
    db.query(&query)
        .unwrap()
        .iter()
        .any(|event| event.id == record.event.id)
}

// =============================================================================
// Tests without parameters (outside proptest! macro)
// =============================================================================

#[test]
fn prop_filter_without_predicates_rejected() {
    let mut filter = Filter::new();
    filter.limit = Some(10);
    let result = QueryCompiler::default().compile(&[filter], 0);
    assert!(matches!(result, Err(FilterError::Empty)));
}

#[test]
fn prop_limit_above_max_is_clamped() {
    let mut filter = Filter::new();
    filter.kinds = Some(vec![1]);
    filter.limit = Some(5001);
    let query = QueryCompiler::default().compile(&[filter], 0).unwrap();
    assert_eq!(query.limit, 5000);
}

#[test]
fn prop_zero_limit_clamped_to_one() {
    let mut filter = Filter::new();
    filter.kinds = Some(vec![1]);
    filter.limit = Some(0);
    let query = QueryCompiler::default().compile(&[filter], 0).unwrap();
    assert_eq!(query.limit, 1);
}

#[test]
fn prop_empty_ids_matches_nothing() {
    let event = create_event_with_fields(1, "test", vec![], 1234567890);
    let mut filter = Filter::new();
    filter.ids = Some(vec![]);
    assert!(!filter.matches(&event));

    let query = QueryCompiler::default().compile(&[filter], 0).unwrap();
    assert!(query.is_unsatisfiable());
}

#[test]
fn prop_empty_authors_matches_nothing() {
    let event = create_event_with_fields(1, "test", vec![], 1234567890);
    let mut filter = Filter::new();
    filter.authors = Some(vec![]);
    assert!(!filter.matches(&event));
}

#[test]
fn prop_empty_tag_filter_no_match() {
    let event = create_event_with_fields(1, "test", vec![tag("e", "event123")], 1234567890);
    let filter = tag_filter(&[("e", &[])]);
    assert!(!filter.matches(&event));
}

#[test]
fn prop_missing_tag_no_match() {
    let event = create_event_with_fields(1, "test", vec![tag("e", "event123")], 1234567890);
    let filter = tag_filter(&[("p", &["pubkey456"])]);
    assert!(!filter.matches(&event));
}

#[test]
fn prop_tag_without_value_no_match() {
    let event = create_event_with_fields(1, "test", vec![vec!["e".to_string()]], 1234567890);
    let filter = tag_filter(&[("e", &["event123"])]);
    assert!(!filter.matches(&event));
}

#[test]
fn prop_multiple_tag_filters_and_condition() {
    let event = create_event_with_fields(
        1,
        "test",
        vec![tag("e", "event123"), tag("p", "pubkey456")],
        1234567890,
    );

    let both = tag_filter(&[("e", &["event123"]), ("p", &["pubkey456"])]);
    assert!(both.matches(&event));

    let one_missing = tag_filter(&[("e", &["event123"]), ("t", &["nostr"])]);
    assert!(!one_missing.matches(&event));
}

#[test]
fn prop_multiple_ids_or_condition() {
    let event1 = create_event_with_fields(1, "test1", vec![], 1234567890);
    let event2 = create_event_with_fields(1, "test2", vec![], 1234567891);

    let mut filter = Filter::new();
    filter.ids = Some(vec![
        event1.event.id[..8].to_string(),
        event2.event.id[..8].to_string(),
    ]);

    assert!(filter.matches(&event1));
    assert!(filter.matches(&event2));
}

#[test]
fn prop_non_hex_prefix_rejected() {
    let mut filter = Filter::new();
    filter.authors = Some(vec!["NOTHEX".to_string()]);
    let result = QueryCompiler::default().compile(&[filter], 0);
    assert!(matches!(result, Err(FilterError::InvalidPrefix(_))));
}

#[test]
fn prop_zero_timestamp_works() {
    let event = create_event_with_fields(1, "test", vec![], 0);
    let mut filter = Filter::new();
    filter.since = Some(0);
    filter.until = Some(100);
    assert!(filter.matches(&event));
}

#[test]
fn prop_search_is_case_insensitive() {
    let event = create_event_with_fields(1, "Hello Nostr World", vec![], 1234567890);
    let mut filter = Filter::new();
    filter.search = Some("nostr".to_string());
    assert!(filter.matches(&event));

    filter.search = Some("bitcoin".to_string());
    assert!(!filter.matches(&event));
}

#[test]
fn prop_unknown_keys_without_hash_ignored() {
    let event = create_event_with_fields(1, "test", vec![], 1234567890);
    let mut filter = Filter::new();
    filter.kinds = Some(vec![1]);
    filter.tags.insert("e".to_string(), vec!["nothing".to_string()]);
    assert!(filter.matches(&event));
}

// =============================================================================
// Filter Matching Property Tests - Kinds
// =============================================================================

proptest! {
    /// Property: Filter with empty kinds array matches no events
    #[test]
    fn prop_empty_kinds_matches_nothing(kind in any::<u16>()) {
        let event = create_event_with_fields(kind, "test", vec![], 1234567890);
        let mut filter = Filter::new();
        filter.kinds = Some(vec![]);

        prop_assert!(!filter.matches(&event));
    }

    /// Property: Filter matches event with exact kind
    #[test]
    fn prop_exact_kind_match(kind in any::<u16>()) {
        let event = create_event_with_fields(kind, "test", vec![], 1234567890);
        let mut filter = Filter::new();
        filter.kinds = Some(vec![kind]);

        prop_assert!(filter.matches(&event));
    }

    /// Property: Filter doesn't match event with different kind
    #[test]
    fn prop_different_kind_no_match(kind1 in any::<u16>(), kind2 in any::<u16>()) {
        prop_assume!(kind1 != kind2);

        let event = create_event_with_fields(kind1, "test", vec![], 1234567890);
        let mut filter = Filter::new();
        filter.kinds = Some(vec![kind2]);

        prop_assert!(!filter.matches(&event));
    }
}

// =============================================================================
// Filter Matching Property Tests - Timestamps
// =============================================================================

proptest! {
    /// Property: since and until are inclusive
    #[test]
    fn prop_since_until_inclusive(timestamp in any::<u64>()) {
        let event = create_event_with_fields(1, "test", vec![], timestamp);
        let mut filter = Filter::new();
        filter.since = Some(timestamp);
        filter.until = Some(timestamp);

        prop_assert!(filter.matches(&event));
    }

    /// Property: Filter with both since and until creates range
    #[test]
    fn prop_since_until_range(
        since in 1000u64..2000u64,
        until in 2000u64..3000u64,
    ) {
        let event_before = create_event_with_fields(1, "test", vec![], since - 1);
        let event_in_range = create_event_with_fields(1, "test", vec![], (since + until) / 2);
        let event_after = create_event_with_fields(1, "test", vec![], until + 1);

        let mut filter = Filter::new();
        filter.since = Some(since);
        filter.until = Some(until);

        prop_assert!(!filter.matches(&event_before));
        prop_assert!(filter.matches(&event_in_range));
        prop_assert!(!filter.matches(&event_after));
    }

    /// Property: since after until compiles to a branch that never matches
    #[test]
    fn prop_inverted_range_unsatisfiable(since in 1001u64..5000u64, until in 0u64..1000u64) {
        let mut filter = Filter::new();
        filter.since = Some(since);
        filter.until = Some(until);

        let query = QueryCompiler::default().compile(&[filter], 0).unwrap();
        prop_assert!(query.is_unsatisfiable());
    }
}

// =============================================================================
// Filter Matching Property Tests - IDs and Authors
// =============================================================================

proptest! {
    /// Property: Any id prefix matches, live and compiled
    #[test]
    fn prop_partial_id_match(prefix_len in 1usize..=64usize) {
        let event = create_event_with_fields(1, "test", vec![], 1234567890);
        let prefix = &event.event.id[..prefix_len];

        let mut filter = Filter::new();
        filter.ids = Some(vec![prefix.to_string()]);
        prop_assert!(filter.matches(&event));

        let compiled = QueryCompiler::default().compile_filter(&filter).unwrap().unwrap();
        let ids = compiled.ids.unwrap();
        prop_assert!(ids[0].contains(&event.event.id));
    }

    /// Property: Any author prefix matches
    #[test]
    fn prop_partial_author_match(prefix_len in 1usize..=64usize) {
        let event = create_event_with_fields(1, "test", vec![], 1234567890);
        let prefix = &event.event.pubkey[..prefix_len];

        let mut filter = Filter::new();
        filter.authors = Some(vec![prefix.to_string()]);

        prop_assert!(filter.matches(&event));
    }

    /// Property: Prefixes shorter than the configured minimum are rejected
    #[test]
    fn prop_short_prefix_rejected(prefix_len in 1usize..8usize) {
        let compiler = QueryCompiler::new(crate::query::QueryLimits {
            min_prefix_length: 8,
            ..Default::default()
        });
        let mut filter = Filter::new();
        filter.ids = Some(vec!["a".repeat(prefix_len)]);

        let rejected = matches!(
            compiler.compile(&[filter], 0),
            Err(FilterError::PrefixTooShort { .. })
        );
        prop_assert!(rejected);
    }
}

// =============================================================================
// Live matcher and stored query agree
// =============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(24))]

    /// Property: For any filter built from these fields, the live matcher and
    /// the SQL query give the same answer for the same event.
    #[test]
    fn prop_live_and_stored_agree(
        kind in 0u16..5u16,
        created_at in 1000u64..2000u64,
        content in "[a-zA-Z ]{0,24}",
        tag_value in "[a-c]{1,3}",
        filter_kind in proptest::option::of(0u16..5u16),
        since in proptest::option::of(1000u64..2000u64),
        until in proptest::option::of(1000u64..2000u64),
        search in proptest::option::of("[a-zA-Z]{1,3}"),
        filter_tag in proptest::option::of("[a-c]{1,3}"),
        id_prefix_len in proptest::option::of(1usize..=64usize),
    ) {
        let (db, _temp) = create_test_db();
        let record = create_event_with_fields(kind, &content, vec![tag("t", &tag_value)], created_at);
        db.insert(&record).unwrap();

        let mut filter = Filter::new();
        filter.kinds = filter_kind.map(|k| vec![k]);
        filter.since = since;
        filter.until = until;
        filter.search = search;
        filter.ids = id_prefix_len.map(|len| vec![record.event.id[..len].to_string()]);
        if let Some(value) = filter_tag {
            filter.tags.insert("#t".to_string(), vec![value]);
        }
        prop_assume!(filter.has_predicates());

        prop_assert_eq!(filter.matches(&record), sql_matches(&db, &filter, &record));
    }
}
