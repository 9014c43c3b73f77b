//! SQLite storage layer with connection pooling
//!
//! The database layer uses three separate connection pools:
//! - Writer pool: Single connection for writes (SQLite write lock)
//! - Reader pool: Multiple connections for queries
//! - Metadata pool: Separate connections for statistics
//!
//! Every connection runs in WAL mode with foreign keys on, so tag rows go
//! away with their event and readers never see a half-written row.

use crate::query::{CompiledFilter, CompiledQuery, HexMatch};
use crate::retention::KindOrRange;
use crate::storage::{EventStore, StorageResult, StoreStatistics, WriteOutcome};
use crate::validation::EventRecord;
use nostr::{
    Event, KIND_CHANNEL_CREATION, KIND_ENCRYPTED_DIRECT_MESSAGE, KIND_LONG_FORM, KIND_METADATA,
    KIND_REACTION, KIND_REPORT, KIND_REPOST, KIND_SHORT_TEXT_NOTE, KIND_ZAP_RECEIPT,
    KindClassification, get_d_tag, get_deleted_event_ids,
};
use r2d2::{Pool, PooledConnection};
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::types::Value;
use rusqlite::{Connection, OpenFlags, OptionalExtension, Transaction, TransactionBehavior, params};
use serde::Deserialize;
use std::path::PathBuf;
use tracing::{debug, info};

/// Database configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    /// Path to the SQLite database file
    pub path: PathBuf,
    /// Maximum number of reader connections
    pub max_reader_connections: u32,
    /// Maximum number of metadata connections
    pub max_metadata_connections: u32,
    /// How long a connection waits on a locked database, in milliseconds
    pub busy_timeout_ms: u64,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("relay.db"),
            max_reader_connections: 10,
            max_metadata_connections: 2,
            busy_timeout_ms: 5_000,
        }
    }
}

type Pooled = PooledConnection<SqliteConnectionManager>;

/// Connection pool wrapper managing writer, reader, and metadata pools
pub struct ConnectionPool {
    writer: Pool<SqliteConnectionManager>,
    reader: Pool<SqliteConnectionManager>,
    metadata: Pool<SqliteConnectionManager>,
}

impl ConnectionPool {
    /// Create a new connection pool
    pub fn new(config: &DatabaseConfig) -> StorageResult<Self> {
        Ok(Self {
            writer: Self::build(config, 1)?,
            reader: Self::build(config, config.max_reader_connections)?,
            metadata: Self::build(config, config.max_metadata_connections)?,
        })
    }

    fn build(config: &DatabaseConfig, max_size: u32) -> StorageResult<Pool<SqliteConnectionManager>> {
        let busy_timeout_ms = config.busy_timeout_ms;
        let flags = OpenFlags::SQLITE_OPEN_READ_WRITE
            | OpenFlags::SQLITE_OPEN_CREATE
            | OpenFlags::SQLITE_OPEN_FULL_MUTEX;

        let manager = SqliteConnectionManager::file(&config.path)
            .with_flags(flags)
            .with_init(move |conn| {
                let _mode: String =
                    conn.query_row("PRAGMA journal_mode = WAL;", [], |row| row.get(0))?;
                conn.execute_batch(&format!(
                    "PRAGMA foreign_keys = ON;
                     PRAGMA busy_timeout = {};",
                    busy_timeout_ms
                ))
            });

        Ok(Pool::builder().max_size(max_size.max(1)).build(manager)?)
    }

    /// Get a writer connection
    pub fn writer(&self) -> StorageResult<Pooled> {
        Ok(self.writer.get()?)
    }

    /// Get a reader connection
    pub fn reader(&self) -> StorageResult<Pooled> {
        Ok(self.reader.get()?)
    }

    /// Get a metadata connection
    pub fn metadata(&self) -> StorageResult<Pooled> {
        Ok(self.metadata.get()?)
    }
}

/// SQLite-backed [`EventStore`]
pub struct Database {
    pool: ConnectionPool,
}

impl Database {
    /// Open (creating if needed) the database and its schema
    pub fn new(config: DatabaseConfig) -> StorageResult<Self> {
        let pool = ConnectionPool::new(&config)?;

        let conn = pool.writer()?;
        Self::init_schema(&conn)?;
        drop(conn);

        info!(path = %config.path.display(), "database initialized");

        Ok(Self { pool })
    }

    /// Initialize the database schema
    fn init_schema(conn: &Connection) -> StorageResult<()> {
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS events (
                id TEXT PRIMARY KEY,
                pubkey TEXT NOT NULL,
                created_at INTEGER NOT NULL,
                kind INTEGER NOT NULL,
                content TEXT NOT NULL,
                sig TEXT NOT NULL,
                tags TEXT NOT NULL,
                raw_event TEXT NOT NULL,
                delegator TEXT,
                d_tag TEXT,
                expires_at INTEGER,
                deleted_at INTEGER,
                first_seen INTEGER NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_events_pubkey_created
                ON events(pubkey, created_at);
            CREATE INDEX IF NOT EXISTS idx_events_kind_created
                ON events(kind, created_at);
            CREATE INDEX IF NOT EXISTS idx_events_created_at ON events(created_at);
            CREATE INDEX IF NOT EXISTS idx_events_delegator ON events(delegator);
            CREATE INDEX IF NOT EXISTS idx_events_identity ON events(pubkey, kind, d_tag);
            CREATE INDEX IF NOT EXISTS idx_events_expires_at
                ON events(expires_at) WHERE expires_at IS NOT NULL;

            CREATE TABLE IF NOT EXISTS event_tags (
                event_id TEXT NOT NULL,
                tag_name TEXT NOT NULL,
                tag_value TEXT,
                FOREIGN KEY (event_id) REFERENCES events(id) ON DELETE CASCADE
            );

            CREATE INDEX IF NOT EXISTS idx_event_tags_event_id ON event_tags(event_id);
            CREATE INDEX IF NOT EXISTS idx_event_tags_name_value
                ON event_tags(tag_name, tag_value);",
        )?;

        debug!("database schema initialized");
        Ok(())
    }

    /// Fetch a stored event by id, whether or not it is still visible
    pub fn get_event(&self, event_id: &str) -> StorageResult<Option<Event>> {
        let conn = self.pool.reader()?;
        let raw: Option<String> = conn
            .query_row(
                "SELECT raw_event FROM events WHERE id = ?1",
                params![event_id],
                |row| row.get(0),
            )
            .optional()?;

        Ok(match raw {
            Some(raw) => Some(serde_json::from_str(&raw)?),
            None => None,
        })
    }

    /// Count rows physically present, deleted ones included
    pub fn count_events(&self) -> StorageResult<u64> {
        let conn = self.pool.metadata()?;
        let count: i64 = conn.query_row("SELECT COUNT(*) FROM events", [], |row| row.get(0))?;
        Ok(count.max(0) as u64)
    }

    fn insert_row(tx: &Transaction<'_>, record: &EventRecord) -> StorageResult<bool> {
        let event = &record.event;
        let raw_event = serde_json::to_string(event)?;
        let tags_json = serde_json::to_string(&event.tags)?;
        let d_tag = match record.classification() {
            KindClassification::Addressable => Some(get_d_tag(event)),
            _ => None,
        };

        let inserted = tx.execute(
            "INSERT OR IGNORE INTO events
                (id, pubkey, created_at, kind, content, sig, tags, raw_event,
                 delegator, d_tag, expires_at, deleted_at, first_seen)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, NULL, ?12)",
            params![
                &event.id,
                &event.pubkey,
                sql_int(event.created_at),
                event.kind,
                &event.content,
                &event.sig,
                tags_json,
                raw_event,
                record.delegator.as_deref(),
                d_tag,
                record.expires_at.map(sql_int),
                sql_int(crate::unix_now()),
            ],
        )?;
        if inserted == 0 {
            return Ok(false);
        }

        let mut stmt = tx.prepare_cached(
            "INSERT INTO event_tags (event_id, tag_name, tag_value) VALUES (?1, ?2, ?3)",
        )?;
        for tag in &event.tags {
            if let Some(name) = tag.first() {
                stmt.execute(params![&event.id, name, tag.get(1)])?;
            }
        }

        Ok(true)
    }

    fn hide_rows(tx: &Transaction<'_>, ids: &[String], author: &str, now: u64) -> StorageResult<usize> {
        let mut stmt = tx.prepare_cached(
            "UPDATE events SET deleted_at = ?1
             WHERE id = ?2 AND pubkey = ?3 AND deleted_at IS NULL",
        )?;
        let mut hidden = 0;
        for id in ids {
            hidden += stmt.execute(params![sql_int(now), id, author])?;
        }
        Ok(hidden)
    }
}

impl EventStore for Database {
    fn insert(&self, record: &EventRecord) -> StorageResult<WriteOutcome> {
        let mut conn = self.pool.writer()?;
        let tx = conn.transaction()?;
        let inserted = Self::insert_row(&tx, record)?;
        tx.commit()?;

        if inserted {
            debug!(event_id = %record.event.id, "stored event");
            Ok(WriteOutcome::Inserted)
        } else {
            Ok(WriteOutcome::Duplicate)
        }
    }

    fn replace(&self, record: &EventRecord) -> StorageResult<WriteOutcome> {
        let event = &record.event;
        let d_tag = match record.classification() {
            KindClassification::Addressable => Some(get_d_tag(event)),
            _ => None,
        };

        let mut identity = String::from("pubkey = ?1 AND kind = ?2");
        let mut key: Vec<Value> = vec![
            Value::Text(event.pubkey.clone()),
            Value::Integer(i64::from(event.kind)),
        ];
        if let Some(ref d) = d_tag {
            identity.push_str(" AND d_tag = ?3");
            key.push(Value::Text(d.clone()));
        }

        let mut conn = self.pool.writer()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let known: bool = tx.query_row(
            "SELECT EXISTS(SELECT 1 FROM events WHERE id = ?1)",
            params![&event.id],
            |row| row.get(0),
        )?;
        if known {
            return Ok(WriteOutcome::Duplicate);
        }

        let newest: Option<i64> = tx.query_row(
            &format!("SELECT MAX(created_at) FROM events WHERE {}", identity),
            rusqlite::params_from_iter(key.iter()),
            |row| row.get(0),
        )?;

        let outcome = match newest {
            Some(stored) if stored >= sql_int(event.created_at) => {
                debug!(event_id = %event.id, stored, "discarding stale replacement");
                return Ok(WriteOutcome::Stale);
            }
            Some(_) => {
                tx.execute(
                    &format!("DELETE FROM events WHERE {}", identity),
                    rusqlite::params_from_iter(key.iter()),
                )?;
                WriteOutcome::Replaced
            }
            None => WriteOutcome::Inserted,
        };

        Self::insert_row(&tx, record)?;
        tx.commit()?;

        debug!(event_id = %event.id, ?outcome, "stored replaceable event");
        Ok(outcome)
    }

    fn delete(&self, ids: &[String], author: &str, now: u64) -> StorageResult<WriteOutcome> {
        let mut conn = self.pool.writer()?;
        let tx = conn.transaction()?;
        let hidden = Self::hide_rows(&tx, ids, author, now)?;
        tx.commit()?;

        Ok(WriteOutcome::Deleted(hidden))
    }

    fn insert_deletion(&self, record: &EventRecord, now: u64) -> StorageResult<WriteOutcome> {
        let event = &record.event;
        let targets = get_deleted_event_ids(event);

        let mut conn = self.pool.writer()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let inserted = Self::insert_row(&tx, record)?;
        let hidden = Self::hide_rows(&tx, &targets, &event.pubkey, now)?;
        tx.commit()?;

        debug!(event_id = %event.id, inserted, hidden, "applied deletion request");
        Ok(if inserted {
            WriteOutcome::Inserted
        } else {
            WriteOutcome::Duplicate
        })
    }

    fn query(&self, query: &CompiledQuery) -> StorageResult<Vec<Event>> {
        if query.is_unsatisfiable() {
            return Ok(Vec::new());
        }

        let (sql, values) = SqlQueryBuilder::select(query);
        let conn = self.pool.reader()?;
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(rusqlite::params_from_iter(values.iter()), |row| {
            row.get::<_, String>(0)
        })?;

        let mut events = Vec::new();
        for row in rows {
            events.push(serde_json::from_str(&row?)?);
        }
        Ok(events)
    }

    fn purge_expired(&self, now: u64) -> StorageResult<usize> {
        let conn = self.pool.writer()?;
        let removed = conn.execute(
            "DELETE FROM events WHERE expires_at IS NOT NULL AND expires_at <= ?1",
            params![sql_int(now)],
        )?;
        if removed > 0 {
            debug!(removed, "purged expired events");
        }
        Ok(removed)
    }

    fn prune_older_than(
        &self,
        pubkey: &str,
        kinds: Option<&[KindOrRange]>,
        cutoff: u64,
    ) -> StorageResult<usize> {
        let mut builder = SqlQueryBuilder::default();
        builder.sql.push_str("DELETE FROM events WHERE pubkey = ? AND created_at < ?");
        builder.bind_text(pubkey);
        builder.bind_int(sql_int(cutoff));
        builder.push_kind_set(kinds);

        let conn = self.pool.writer()?;
        Ok(conn.execute(&builder.sql, rusqlite::params_from_iter(builder.values.iter()))?)
    }

    fn prune_beyond_count(
        &self,
        pubkey: &str,
        kinds: Option<&[KindOrRange]>,
        keep: usize,
    ) -> StorageResult<usize> {
        let mut builder = SqlQueryBuilder::default();
        builder.sql.push_str(
            "DELETE FROM events WHERE id IN (
                SELECT id FROM events WHERE pubkey = ? AND deleted_at IS NULL",
        );
        builder.bind_text(pubkey);
        builder.push_kind_set(kinds);
        builder
            .sql
            .push_str(" ORDER BY created_at DESC, id ASC LIMIT -1 OFFSET ?)");
        builder.bind_int(i64::try_from(keep).unwrap_or(i64::MAX));

        let conn = self.pool.writer()?;
        Ok(conn.execute(&builder.sql, rusqlite::params_from_iter(builder.values.iter()))?)
    }

    fn statistics(&self) -> StorageResult<StoreStatistics> {
        let conn = self.pool.metadata()?;
        let mut stats = conn.query_row(
            "SELECT COUNT(*),
                    COALESCE(SUM(kind = ?1), 0),
                    COALESCE(SUM(kind = ?2), 0),
                    COALESCE(SUM(kind = ?3), 0),
                    COALESCE(SUM(kind = ?4), 0),
                    COALESCE(SUM(kind = ?5), 0),
                    COALESCE(SUM(kind = ?6), 0),
                    COALESCE(SUM(kind BETWEEN ?7 AND ?8), 0),
                    COALESCE(SUM(kind = ?9), 0),
                    COALESCE(SUM(kind = ?10), 0)
             FROM events WHERE deleted_at IS NULL",
            params![
                KIND_SHORT_TEXT_NOTE,
                KIND_METADATA,
                KIND_ENCRYPTED_DIRECT_MESSAGE,
                KIND_REACTION,
                KIND_REPOST,
                KIND_ZAP_RECEIPT,
                KIND_CHANNEL_CREATION,
                KIND_CHANNEL_CREATION + 4,
                KIND_REPORT,
                KIND_LONG_FORM,
            ],
            |row| {
                let count = |i: usize| row.get::<_, i64>(i).map(|n| n.max(0) as u64);
                Ok(StoreStatistics {
                    total: count(0)?,
                    notes: count(1)?,
                    profiles: count(2)?,
                    direct_messages: count(3)?,
                    reactions: count(4)?,
                    reposts: count(5)?,
                    zaps: count(6)?,
                    channels: count(7)?,
                    reports: count(8)?,
                    long_form: count(9)?,
                    deleted: 0,
                })
            },
        )?;

        let deleted: i64 = conn.query_row(
            "SELECT COUNT(*) FROM events WHERE deleted_at IS NOT NULL",
            [],
            |row| row.get(0),
        )?;
        stats.deleted = deleted.max(0) as u64;

        Ok(stats)
    }
}

/// Renders a [`CompiledQuery`] into SQL text plus bound values.
///
/// Values never appear in the SQL text; every one is a `?` placeholder.
#[derive(Debug, Default)]
pub struct SqlQueryBuilder {
    sql: String,
    values: Vec<Value>,
}

impl SqlQueryBuilder {
    /// `SELECT raw_event` for the union of the query's filters.
    pub fn select(query: &CompiledQuery) -> (String, Vec<Value>) {
        let mut b = Self::default();
        b.sql.push_str(
            "SELECT raw_event FROM events \
             WHERE deleted_at IS NULL AND (expires_at IS NULL OR expires_at > ?) AND (",
        );
        b.bind_int(sql_int(query.now));

        for (i, filter) in query.filters.iter().enumerate() {
            if i > 0 {
                b.sql.push_str(" OR ");
            }
            b.push_filter(filter);
        }

        b.sql.push_str(") ORDER BY created_at DESC, id ASC LIMIT ?");
        b.bind_int(i64::try_from(query.limit).unwrap_or(i64::MAX));

        (b.sql, b.values)
    }

    fn bind_text(&mut self, value: &str) {
        self.values.push(Value::Text(value.to_string()));
    }

    fn bind_int(&mut self, value: i64) {
        self.values.push(Value::Integer(value));
    }

    fn push_filter(&mut self, filter: &CompiledFilter) {
        let mut clauses = 0;
        let mut and = |b: &mut Self| {
            b.sql.push_str(if clauses == 0 { "(" } else { " AND " });
            clauses += 1;
        };

        if let Some(ref ids) = filter.ids {
            and(self);
            self.push_hex_matches(ids, &["id"]);
        }
        if let Some(ref authors) = filter.authors {
            and(self);
            self.push_hex_matches(authors, &["pubkey", "delegator"]);
        }
        if let Some(ref kinds) = filter.kinds {
            and(self);
            self.sql.push_str("kind IN (");
            for (i, kind) in kinds.iter().enumerate() {
                self.sql.push_str(if i == 0 { "?" } else { ", ?" });
                self.bind_int(i64::from(*kind));
            }
            self.sql.push(')');
        }
        if let Some(since) = filter.since {
            and(self);
            self.sql.push_str("created_at >= ?");
            self.bind_int(sql_int(since));
        }
        if let Some(until) = filter.until {
            and(self);
            self.sql.push_str("created_at <= ?");
            self.bind_int(sql_int(until));
        }
        for (name, values) in &filter.tags {
            and(self);
            self.sql.push_str(
                "EXISTS (SELECT 1 FROM event_tags t \
                 WHERE t.event_id = events.id AND t.tag_name = ? AND t.tag_value IN (",
            );
            self.bind_text(name);
            for (i, value) in values.iter().enumerate() {
                self.sql.push_str(if i == 0 { "?" } else { ", ?" });
                self.bind_text(value);
            }
            self.sql.push_str("))");
        }
        if let Some(ref search) = filter.search {
            and(self);
            self.sql.push_str("content LIKE ? ESCAPE '\\'");
            self.values.push(Value::Text(format!("%{}%", escape_like(search))));
        }

        if clauses == 0 {
            self.sql.push_str("(1");
        }
        self.sql.push(')');
    }

    fn push_hex_matches(&mut self, matches: &[HexMatch], columns: &[&str]) {
        self.sql.push('(');
        let mut first = true;
        for m in matches {
            for column in columns {
                if !first {
                    self.sql.push_str(" OR ");
                }
                first = false;
                match m {
                    HexMatch::Exact(value) => {
                        self.sql.push_str(column);
                        self.sql.push_str(" = ?");
                        self.bind_text(value);
                    }
                    HexMatch::Range { lower, upper } => {
                        self.sql.push_str(column);
                        self.sql.push_str(" BETWEEN ? AND ?");
                        self.bind_text(lower);
                        self.bind_text(upper);
                    }
                }
            }
        }
        self.sql.push(')');
    }

    /// Append ` AND (kind = ? OR kind BETWEEN ? AND ? ...)`; nothing for an
    /// absent or empty set.
    fn push_kind_set(&mut self, kinds: Option<&[KindOrRange]>) {
        let Some(kinds) = kinds.filter(|k| !k.is_empty()) else {
            return;
        };
        self.sql.push_str(" AND (");
        for (i, kind) in kinds.iter().enumerate() {
            if i > 0 {
                self.sql.push_str(" OR ");
            }
            match *kind {
                KindOrRange::Single(k) => {
                    self.sql.push_str("kind = ?");
                    self.bind_int(i64::from(k));
                }
                KindOrRange::Range(..) => {
                    let (low, high) = kind.bounds();
                    self.sql.push_str("kind BETWEEN ? AND ?");
                    self.bind_int(i64::from(low));
                    self.bind_int(i64::from(high));
                }
            }
        }
        self.sql.push(')');
    }
}

fn escape_like(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        if matches!(c, '%' | '_' | '\\') {
            out.push('\\');
        }
        out.push(c);
    }
    out
}

fn sql_int(value: u64) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::query::QueryCompiler;
    use crate::retention::{ExemptionList, RetentionPolicy, RetentionRule};
    use crate::subscription::Filter;
    use nostr::{EventTemplate, finalize_event, generate_secret_key, get_public_key_hex};

    const NOW: u64 = 1_700_000_000;

    fn record(
        secret_key: &[u8; 32],
        kind: u16,
        created_at: u64,
        tags: Vec<Vec<String>>,
        content: &str,
    ) -> EventRecord {
        let template = EventTemplate {
            kind,
            tags,
            content: content.to_string(),
            created_at,
        };
        EventRecord::new(finalize_event(&template, secret_key).unwrap(), None)
    }

    fn note(secret_key: &[u8; 32], created_at: u64, content: &str) -> EventRecord {
        record(secret_key, 1, created_at, vec![], content)
    }

    fn tag(name: &str, value: &str) -> Vec<String> {
        vec![name.to_string(), value.to_string()]
    }

    fn create_test_db() -> (Database, tempfile::TempDir) {
        let temp_dir = tempfile::tempdir().unwrap();
        let db_path = temp_dir.path().join("test.db");
        let config = DatabaseConfig {
            path: db_path,
            ..Default::default()
        };
        let db = Database::new(config).unwrap();
        (db, temp_dir)
    }

    fn query(db: &Database, json: &str, now: u64) -> Vec<Event> {
        let filters: Vec<Filter> = serde_json::from_str(json).unwrap();
        let compiled = QueryCompiler::default().compile(&filters, now).unwrap();
        db.query(&compiled).unwrap()
    }

    #[test]
    fn test_database_creation() {
        let (db, _temp) = create_test_db();
        assert_eq!(db.count_events().unwrap(), 0);
        assert_eq!(db.statistics().unwrap(), StoreStatistics::default());
    }

    #[test]
    fn test_insert_is_idempotent() {
        let (db, _temp) = create_test_db();
        let sk = generate_secret_key();
        let rec = note(&sk, NOW, "Hello, Nostr!");

        assert_eq!(db.save(&rec, NOW).unwrap(), WriteOutcome::Inserted);
        assert_eq!(db.save(&rec, NOW).unwrap(), WriteOutcome::Duplicate);
        assert_eq!(db.count_events().unwrap(), 1);

        let stored = db.get_event(&rec.event.id).unwrap().unwrap();
        assert_eq!(stored, rec.event);
    }

    #[test]
    fn test_replaceable_newest_wins_in_either_order() {
        let sk = generate_secret_key();
        let old = record(&sk, 0, 100, vec![], r#"{"name":"old"}"#);
        let new = record(&sk, 0, 200, vec![], r#"{"name":"new"}"#);

        for order in [[&old, &new], [&new, &old]] {
            let (db, _temp) = create_test_db();
            for rec in order {
                db.save(rec, NOW).unwrap();
            }
            assert_eq!(db.count_events().unwrap(), 1);
            let rows = query(&db, r#"[{"kinds":[0]}]"#, NOW);
            assert_eq!(rows, vec![new.event.clone()]);
        }
    }

    #[test]
    fn test_replace_outcomes() {
        let (db, _temp) = create_test_db();
        let sk = generate_secret_key();
        let first = record(&sk, 3, 100, vec![], "a");
        let tie = record(&sk, 3, 100, vec![], "b");
        let newer = record(&sk, 3, 101, vec![], "c");

        assert_eq!(db.save(&first, NOW).unwrap(), WriteOutcome::Inserted);
        assert_eq!(db.save(&first, NOW).unwrap(), WriteOutcome::Duplicate);
        assert_eq!(db.save(&tie, NOW).unwrap(), WriteOutcome::Stale);
        assert_eq!(db.save(&newer, NOW).unwrap(), WriteOutcome::Replaced);
        assert_eq!(db.count_events().unwrap(), 1);
    }

    #[test]
    fn test_addressable_keyed_by_d_tag() {
        let (db, _temp) = create_test_db();
        let sk = generate_secret_key();

        db.save(&record(&sk, 30023, 100, vec![tag("d", "post")], "v1"), NOW).unwrap();
        db.save(&record(&sk, 30023, 200, vec![tag("d", "post")], "v2"), NOW).unwrap();
        db.save(&record(&sk, 30023, 150, vec![tag("d", "other")], "x"), NOW).unwrap();
        // no d tag means the empty identifier
        db.save(&record(&sk, 30023, 120, vec![], "bare"), NOW).unwrap();

        let rows = query(&db, r#"[{"kinds":[30023]}]"#, NOW);
        let contents: Vec<&str> = rows.iter().map(|e| e.content.as_str()).collect();
        assert_eq!(contents, vec!["v2", "x", "bare"]);
    }

    #[test]
    fn test_ephemeral_not_persisted() {
        let (db, _temp) = create_test_db();
        let sk = generate_secret_key();
        let rec = record(&sk, 20001, NOW, vec![], "typing");
        assert_eq!(db.save(&rec, NOW).unwrap(), WriteOutcome::Ephemeral);
        assert_eq!(db.count_events().unwrap(), 0);
    }

    #[test]
    fn test_deletion_only_hides_own_events() {
        let (db, _temp) = create_test_db();
        let alice = generate_secret_key();
        let mallory = generate_secret_key();
        let a = note(&alice, NOW - 30, "a");
        let b = note(&alice, NOW - 20, "b");
        let keep = note(&alice, NOW - 10, "keep");
        for rec in [&a, &b, &keep] {
            db.save(rec, NOW).unwrap();
        }

        let forged = record(&mallory, 5, NOW, vec![tag("e", &a.event.id)], "");
        assert_eq!(db.save(&forged, NOW).unwrap(), WriteOutcome::Inserted);
        assert_eq!(query(&db, r#"[{"kinds":[1]}]"#, NOW).len(), 3);

        let deletion = record(
            &alice,
            5,
            NOW,
            vec![tag("e", &a.event.id), tag("e", &b.event.id)],
            "",
        );
        db.save(&deletion, NOW).unwrap();

        let rows = query(&db, r#"[{"kinds":[1]}]"#, NOW);
        assert_eq!(rows, vec![keep.event.clone()]);
        // the deletion request itself stays queryable
        assert_eq!(query(&db, r#"[{"kinds":[5]}]"#, NOW).len(), 2);
        assert_eq!(db.statistics().unwrap().deleted, 2);

        // re-inserting a deleted event does not revive it
        assert_eq!(db.save(&a, NOW).unwrap(), WriteOutcome::Duplicate);
        assert_eq!(query(&db, r#"[{"kinds":[1]}]"#, NOW).len(), 1);
    }

    #[test]
    fn test_deletion_reapplied_when_request_already_stored() {
        let (db, _temp) = create_test_db();
        let alice = generate_secret_key();
        let target = note(&alice, NOW - 10, "target");
        db.save(&target, NOW).unwrap();

        // request row present but its targets never hidden
        let deletion = record(&alice, 5, NOW, vec![tag("e", &target.event.id)], "");
        assert_eq!(db.insert(&deletion).unwrap(), WriteOutcome::Inserted);
        assert_eq!(query(&db, r#"[{"kinds":[1]}]"#, NOW).len(), 1);

        assert_eq!(db.save(&deletion, NOW).unwrap(), WriteOutcome::Duplicate);
        assert!(query(&db, r#"[{"kinds":[1]}]"#, NOW).is_empty());
        assert_eq!(db.statistics().unwrap().deleted, 1);
    }

    #[test]
    fn test_concurrent_replacements_leave_newest() {
        const WRITERS: u64 = 8;
        let (db, _temp) = create_test_db();
        let sk = generate_secret_key();

        let profiles: Vec<EventRecord> = (0..WRITERS)
            .map(|i| record(&sk, 0, NOW - 100 + i, vec![], &format!("p{}", i)))
            .collect();
        let articles: Vec<EventRecord> = (0..WRITERS)
            .map(|i| record(&sk, 30023, NOW - 100 + i, vec![tag("d", "post")], &format!("a{}", i)))
            .collect();

        std::thread::scope(|scope| {
            for rec in profiles.iter().chain(articles.iter()) {
                let db = &db;
                scope.spawn(move || {
                    let outcome = db.save(rec, NOW).unwrap();
                    assert!(matches!(
                        outcome,
                        WriteOutcome::Inserted | WriteOutcome::Replaced | WriteOutcome::Stale
                    ));
                });
            }
        });

        assert_eq!(db.count_events().unwrap(), 2);
        let newest = NOW - 100 + WRITERS - 1;

        let profile = query(&db, r#"[{"kinds":[0]}]"#, NOW);
        assert_eq!(profile.len(), 1);
        assert_eq!(profile[0].created_at, newest);
        assert_eq!(profile[0].content, format!("p{}", WRITERS - 1));

        let article = query(&db, r##"[{"kinds":[30023],"#d":["post"]}]"##, NOW);
        assert_eq!(article.len(), 1);
        assert_eq!(article[0].created_at, newest);
    }

    #[test]
    fn test_prefix_and_delegator_author_match() {
        let (db, _temp) = create_test_db();
        let sk = generate_secret_key();
        let delegator = "d".repeat(64);
        let mut rec = note(&sk, NOW, "delegated");
        rec.delegator = Some(delegator.clone());
        db.save(&rec, NOW).unwrap();
        db.save(&note(&generate_secret_key(), NOW, "other"), NOW).unwrap();

        let by_delegator = query(&db, &format!(r#"[{{"authors":["{}"]}}]"#, delegator), NOW);
        assert_eq!(by_delegator, vec![rec.event.clone()]);

        let id_prefix = &rec.event.id[..8];
        let by_id = query(&db, &format!(r#"[{{"ids":["{}"]}}]"#, id_prefix), NOW);
        assert_eq!(by_id, vec![rec.event.clone()]);

        let pubkey = get_public_key_hex(&sk).unwrap();
        let by_author = query(&db, &format!(r#"[{{"authors":["{}"]}}]"#, pubkey), NOW);
        assert_eq!(by_author, vec![rec.event]);
    }

    #[test]
    fn test_tag_containment_and_search() {
        let (db, _temp) = create_test_db();
        let sk = generate_secret_key();
        let both = record(&sk, 1, NOW - 2, vec![tag("t", "rust"), tag("p", "x")], "Hello World");
        let only_t = record(&sk, 1, NOW - 1, vec![tag("t", "rust")], "100% sure");
        db.save(&both, NOW).unwrap();
        db.save(&only_t, NOW).unwrap();

        assert_eq!(query(&db, r##"[{"#t":["rust","go"]}]"##, NOW).len(), 2);
        assert_eq!(
            query(&db, r##"[{"#t":["rust"],"#p":["x"]}]"##, NOW),
            vec![both.event.clone()]
        );
        assert_eq!(query(&db, r#"[{"search":"hello"}]"#, NOW), vec![both.event]);
        assert_eq!(query(&db, r#"[{"search":"0%"}]"#, NOW), vec![only_t.event]);
        assert!(query(&db, r#"[{"search":"%"}]"#, NOW).len() == 1);
    }

    #[test]
    fn test_union_order_and_limit() {
        let (db, _temp) = create_test_db();
        let sk = generate_secret_key();
        for i in 0..5 {
            db.save(&record(&sk, 1, NOW - 10 + i, vec![], &format!("n{}", i)), NOW)
                .unwrap();
        }
        db.save(&record(&sk, 7, NOW - 3, vec![], "+"), NOW).unwrap();

        let rows = query(&db, r#"[{"kinds":[1],"limit":2},{"kinds":[7]}]"#, NOW);
        let contents: Vec<&str> = rows.iter().map(|e| e.content.as_str()).collect();
        assert_eq!(contents, vec!["+", "n4"]);

        // an event matching both filters appears once
        let rows = query(&db, r#"[{"kinds":[1]},{"since":0}]"#, NOW);
        assert_eq!(rows.len(), 6);

        let rows = query(&db, r#"[{"kinds":[1],"since":1699999993,"until":1699999994}]"#, NOW);
        assert_eq!(rows.len(), 2);
    }

    #[test]
    fn test_expired_rows_hidden_then_purged() {
        let (db, _temp) = create_test_db();
        let sk = generate_secret_key();
        let expiring = record(&sk, 1, NOW, vec![tag("expiration", &(NOW + 60).to_string())], "");
        db.save(&expiring, NOW).unwrap();

        assert_eq!(query(&db, r#"[{"kinds":[1]}]"#, NOW).len(), 1);
        assert!(query(&db, r#"[{"kinds":[1]}]"#, NOW + 60).is_empty());

        assert_eq!(db.purge_expired(NOW + 59).unwrap(), 0);
        assert_eq!(db.purge_expired(NOW + 60).unwrap(), 1);
        assert_eq!(db.count_events().unwrap(), 0);
    }

    #[test]
    fn test_retention_count_keeps_newest() {
        let (db, _temp) = create_test_db();
        let sk = generate_secret_key();
        let pubkey = get_public_key_hex(&sk).unwrap();
        for i in 0..5 {
            db.save(&note(&sk, NOW - 100 + i, &format!("n{}", i)), NOW).unwrap();
        }
        db.save(&record(&sk, 7, NOW, vec![], "+"), NOW).unwrap();

        let policy = RetentionPolicy::new(
            vec![RetentionRule {
                kinds: Some(vec![KindOrRange::Single(1)]),
                time: None,
                count: Some(2),
            }],
            ExemptionList::new(),
        );
        assert_eq!(db.cleanup(&pubkey, &policy, NOW).unwrap(), 3);

        let rows = query(&db, r#"[{"kinds":[1]}]"#, NOW);
        let contents: Vec<&str> = rows.iter().map(|e| e.content.as_str()).collect();
        assert_eq!(contents, vec!["n4", "n3"]);
        assert_eq!(query(&db, r#"[{"kinds":[7]}]"#, NOW).len(), 1);
    }

    #[test]
    fn test_retention_reversed_kind_range() {
        let (db, _temp) = create_test_db();
        let sk = generate_secret_key();
        let pubkey = get_public_key_hex(&sk).unwrap();
        for i in 0..5 {
            db.save(&note(&sk, NOW - 100 + i, &format!("n{}", i)), NOW).unwrap();
        }

        let kinds: Vec<KindOrRange> = serde_json::from_str("[[5, 0]]").unwrap();
        let policy = RetentionPolicy::new(
            vec![RetentionRule {
                kinds: Some(kinds),
                time: None,
                count: Some(2),
            }],
            ExemptionList::new(),
        );
        assert_eq!(db.cleanup(&pubkey, &policy, NOW).unwrap(), 3);
        assert_eq!(db.count_events().unwrap(), 2);
    }

    #[test]
    fn test_retention_age_and_exemption() {
        let (db, _temp) = create_test_db();
        let sk = generate_secret_key();
        let pubkey = get_public_key_hex(&sk).unwrap();
        db.save(&note(&sk, NOW - 7200, "old"), NOW).unwrap();
        db.save(&note(&sk, NOW - 60, "fresh"), NOW).unwrap();

        let rules = vec![RetentionRule {
            kinds: None,
            time: Some(3600),
            count: None,
        }];

        let exempt = ExemptionList::new();
        exempt.add(pubkey.clone());
        let policy = RetentionPolicy::new(rules.clone(), exempt);
        assert_eq!(db.cleanup(&pubkey, &policy, NOW).unwrap(), 0);

        let policy = RetentionPolicy::new(rules, ExemptionList::new());
        assert_eq!(db.cleanup(&pubkey, &policy, NOW).unwrap(), 1);
        let rows = query(&db, r#"[{"kinds":[1]}]"#, NOW);
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].content, "fresh");
    }

    #[test]
    fn test_statistics_by_category() {
        let (db, _temp) = create_test_db();
        let sk = generate_secret_key();
        db.save(&note(&sk, NOW, "n"), NOW).unwrap();
        db.save(&record(&sk, 0, NOW, vec![], "{}"), NOW).unwrap();
        db.save(&record(&sk, 7, NOW, vec![], "+"), NOW).unwrap();
        db.save(&record(&sk, 42, NOW, vec![], "chat"), NOW).unwrap();
        db.save(&record(&sk, 30023, NOW, vec![tag("d", "a")], "long"), NOW).unwrap();

        let stats = db.statistics().unwrap();
        assert_eq!(stats.total, 5);
        assert_eq!(stats.notes, 1);
        assert_eq!(stats.profiles, 1);
        assert_eq!(stats.reactions, 1);
        assert_eq!(stats.channels, 1);
        assert_eq!(stats.long_form, 1);
        assert_eq!(stats.zaps, 0);
    }

    #[test]
    fn test_rendered_sql_binds_every_value() {
        let filters: Vec<Filter> =
            serde_json::from_str(r##"[{"authors":["ab"],"#e":["x'; DROP TABLE events; --"]}]"##)
                .unwrap();
        let compiled = QueryCompiler::default().compile(&filters, NOW).unwrap();
        let (sql, values) = SqlQueryBuilder::select(&compiled);
        assert!(!sql.contains("DROP"));
        assert_eq!(sql.matches('?').count(), values.len());
    }
}
