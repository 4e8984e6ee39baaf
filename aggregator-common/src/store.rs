//! # Store
//!
//! The deduplicating system of record. `insert_if_absent` is the only write path, and its
//! atomicity is delegated to the backend: a UNIQUE constraint for Postgres, a per-key map entry
//! for the in-memory store.
//!
//! The store also holds the per-topic outcome counters every process reports into. An insert
//! bumps `accepted` or `duplicates` as part of the same write.
use std::collections::BTreeMap;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::{mapref::entry::Entry, DashMap};
use serde::Serialize;
use serde_json::Value;
use sqlx::postgres::{PgConnectOptions, PgPool, PgPoolOptions};
use sqlx::QueryBuilder;
use thiserror::Error;

use crate::event::EventRecord;

/// Read results are capped at this many rows.
pub const MAX_QUERY_LIMIT: i64 = 1000;
pub const DEFAULT_QUERY_LIMIT: i64 = 100;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("pool creation failed with: {error}")]
    PoolCreationError { error: sqlx::Error },
    #[error("{command} query failed with: {error}")]
    QueryError { command: String, error: sqlx::Error },
    #[error("store is unavailable")]
    Unavailable,
}

pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// Result of an idempotent write. Exactly one caller observes `Inserted` per key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertOutcome {
    Inserted {
        seq: i64,
        admitted_at: DateTime<Utc>,
    },
    AlreadyExists,
}

/// An event as persisted, with the store-assigned sequence number and admission time.
#[derive(Debug, Clone, PartialEq, Serialize, sqlx::FromRow)]
pub struct StoredEvent {
    pub seq: i64,
    pub topic: String,
    pub event_id: String,
    pub source: Option<String>,
    pub payload: Value,
    #[serde(rename = "timestamp")]
    pub source_timestamp: DateTime<Utc>,
    pub received_at: DateTime<Utc>,
    pub admitted_at: DateTime<Utc>,
}

/// Parameters of a read. Use `EventQuery::new` to get a clamped limit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventQuery {
    pub topic: Option<String>,
    pub limit: i64,
}

impl EventQuery {
    /// A blank topic means no filter. The limit is clamped to `1..=MAX_QUERY_LIMIT`.
    pub fn new(topic: Option<String>, limit: Option<i64>) -> Self {
        Self {
            topic: topic.filter(|t| !t.trim().is_empty()),
            limit: limit
                .unwrap_or(DEFAULT_QUERY_LIMIT)
                .clamp(1, MAX_QUERY_LIMIT),
        }
    }
}

/// Increments to apply to one topic's counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CounterDelta {
    pub received: i64,
    pub accepted: i64,
    pub duplicates: i64,
    pub failed: i64,
    pub dead_lettered: i64,
}

impl CounterDelta {
    pub fn received(n: i64) -> Self {
        Self {
            received: n,
            ..Self::default()
        }
    }

    pub fn merge(&mut self, other: &CounterDelta) {
        self.received += other.received;
        self.accepted += other.accepted;
        self.duplicates += other.duplicates;
        self.failed += other.failed;
        self.dead_lettered += other.dead_lettered;
    }

    pub fn is_zero(&self) -> bool {
        *self == Self::default()
    }
}

/// Running totals for one topic.
#[derive(Debug, Clone, Default, PartialEq, Eq, sqlx::FromRow)]
pub struct TopicCounters {
    pub topic: String,
    pub received: i64,
    pub accepted: i64,
    pub duplicates: i64,
    pub failed: i64,
    pub dead_lettered: i64,
}

impl TopicCounters {
    fn apply(&mut self, delta: &CounterDelta) {
        self.received += delta.received;
        self.accepted += delta.accepted;
        self.duplicates += delta.duplicates;
        self.failed += delta.failed;
        self.dead_lettered += delta.dead_lettered;
    }
}

/// Fold deltas for the same topic together, dropping the ones that add nothing.
fn merge_deltas(deltas: &[(String, CounterDelta)]) -> BTreeMap<&str, CounterDelta> {
    let mut merged = BTreeMap::<&str, CounterDelta>::new();
    for (topic, delta) in deltas {
        merged.entry(topic.as_str()).or_default().merge(delta);
    }
    merged.retain(|_, delta| !delta.is_zero());
    merged
}

#[async_trait]
pub trait EventStore: Send + Sync {
    /// Persist `event` unless an event with the same `(topic, event_id)` already exists, and
    /// count the outcome against the topic.
    async fn insert_if_absent(&self, event: &EventRecord) -> StoreResult<InsertOutcome>;

    /// Events ordered by `source_timestamp` descending, ties by ascending `seq`.
    async fn query(&self, query: &EventQuery) -> StoreResult<Vec<StoredEvent>>;

    /// Add to the shared per-topic counters.
    async fn add_counts(&self, deltas: &[(String, CounterDelta)]) -> StoreResult<()>;

    /// Counters of every topic seen so far, sorted by topic.
    async fn counters(&self) -> StoreResult<Vec<TopicCounters>>;
}

#[derive(Clone)]
pub struct PgEventStore {
    pool: PgPool,
}

impl PgEventStore {
    /// Build a store with a lazily connecting pool.
    pub fn new(url: &str, max_connections: u32, app_name: &'static str) -> StoreResult<Self> {
        let options = PgConnectOptions::from_str(url)
            .map_err(|error| StoreError::PoolCreationError { error })?
            .application_name(app_name);
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect_lazy_with(options);

        Ok(Self { pool })
    }

    pub fn new_from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait]
impl EventStore for PgEventStore {
    async fn insert_if_absent(&self, event: &EventRecord) -> StoreResult<InsertOutcome> {
        let base_query = r#"
WITH inserted AS (
    INSERT INTO events
        (topic, event_id, source, payload, source_timestamp, received_at)
    VALUES
        ($1, $2, $3, $4, $5, $6)
    ON CONFLICT (topic, event_id) DO NOTHING
    RETURNING
        seq, admitted_at
),
counted AS (
    INSERT INTO topic_counters AS c
        (topic, accepted, duplicates)
    SELECT
        $1, COUNT(*), 1 - COUNT(*)
    FROM
        inserted
    ON CONFLICT (topic) DO UPDATE SET
        accepted = c.accepted + EXCLUDED.accepted,
        duplicates = c.duplicates + EXCLUDED.duplicates
)
SELECT
    seq, admitted_at
FROM
    inserted
        "#;

        let inserted: Option<(i64, DateTime<Utc>)> = sqlx::query_as(base_query)
            .bind(&event.topic)
            .bind(&event.event_id)
            .bind(&event.source)
            .bind(sqlx::types::Json(&event.payload))
            .bind(event.source_timestamp)
            .bind(event.received_at)
            .fetch_optional(&self.pool)
            .await
            .map_err(|error| StoreError::QueryError {
                command: "INSERT".to_owned(),
                error,
            })?;

        Ok(match inserted {
            Some((seq, admitted_at)) => InsertOutcome::Inserted { seq, admitted_at },
            None => InsertOutcome::AlreadyExists,
        })
    }

    async fn query(&self, query: &EventQuery) -> StoreResult<Vec<StoredEvent>> {
        let base_query = r#"
SELECT
    seq, topic, event_id, source, payload, source_timestamp, received_at, admitted_at
FROM
    events
WHERE
    $1::text IS NULL
    OR topic = $1
ORDER BY
    source_timestamp DESC,
    seq ASC
LIMIT $2
        "#;

        sqlx::query_as(base_query)
            .bind(&query.topic)
            .bind(query.limit)
            .fetch_all(&self.pool)
            .await
            .map_err(|error| StoreError::QueryError {
                command: "SELECT".to_owned(),
                error,
            })
    }

    async fn add_counts(&self, deltas: &[(String, CounterDelta)]) -> StoreResult<()> {
        let merged = merge_deltas(deltas);
        if merged.is_empty() {
            return Ok(());
        }

        let mut query_builder = QueryBuilder::new(
            r#"
INSERT INTO topic_counters AS c
    (topic, received, accepted, duplicates, failed, dead_lettered)
            "#,
        );
        query_builder.push_values(merged, |mut b, (topic, delta)| {
            b.push_bind(topic)
                .push_bind(delta.received)
                .push_bind(delta.accepted)
                .push_bind(delta.duplicates)
                .push_bind(delta.failed)
                .push_bind(delta.dead_lettered);
        });
        query_builder.push(
            r#"
ON CONFLICT (topic) DO UPDATE SET
    received = c.received + EXCLUDED.received,
    accepted = c.accepted + EXCLUDED.accepted,
    duplicates = c.duplicates + EXCLUDED.duplicates,
    failed = c.failed + EXCLUDED.failed,
    dead_lettered = c.dead_lettered + EXCLUDED.dead_lettered
            "#,
        );

        query_builder
            .build()
            .execute(&self.pool)
            .await
            .map_err(|error| StoreError::QueryError {
                command: "INSERT".to_owned(),
                error,
            })?;
        Ok(())
    }

    async fn counters(&self) -> StoreResult<Vec<TopicCounters>> {
        let base_query = r#"
SELECT
    topic, received, accepted, duplicates, failed, dead_lettered
FROM
    topic_counters
ORDER BY
    topic
        "#;

        sqlx::query_as(base_query)
            .fetch_all(&self.pool)
            .await
            .map_err(|error| StoreError::QueryError {
                command: "SELECT".to_owned(),
                error,
            })
    }
}

/// In-process store. Each key's entry is claimed under its shard lock, which gives the same
/// first-writer-wins guarantee as the UNIQUE constraint.
#[derive(Default)]
pub struct MemoryEventStore {
    events: DashMap<(String, String), StoredEvent>,
    counters: DashMap<String, TopicCounters>,
    last_seq: AtomicI64,
    unavailable: AtomicBool,
}

impl MemoryEventStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every call fail with `StoreError::Unavailable` until switched back.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    fn count(&self, topic: &str, delta: &CounterDelta) {
        self.counters
            .entry(topic.to_owned())
            .or_insert_with(|| TopicCounters {
                topic: topic.to_owned(),
                ..TopicCounters::default()
            })
            .apply(delta);
    }

    fn check_available(&self) -> StoreResult<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable);
        }
        Ok(())
    }
}

#[async_trait]
impl EventStore for MemoryEventStore {
    async fn insert_if_absent(&self, event: &EventRecord) -> StoreResult<InsertOutcome> {
        self.check_available()?;

        let key = (event.topic.clone(), event.event_id.clone());
        let outcome = match self.events.entry(key) {
            Entry::Occupied(_) => InsertOutcome::AlreadyExists,
            Entry::Vacant(slot) => {
                let seq = self.last_seq.fetch_add(1, Ordering::SeqCst) + 1;
                let admitted_at = Utc::now();
                slot.insert(StoredEvent {
                    seq,
                    topic: event.topic.clone(),
                    event_id: event.event_id.clone(),
                    source: event.source.clone(),
                    payload: Value::Object(event.payload.clone()),
                    source_timestamp: event.source_timestamp,
                    received_at: event.received_at,
                    admitted_at,
                });
                InsertOutcome::Inserted { seq, admitted_at }
            }
        };

        let delta = match outcome {
            InsertOutcome::Inserted { .. } => CounterDelta {
                accepted: 1,
                ..CounterDelta::default()
            },
            InsertOutcome::AlreadyExists => CounterDelta {
                duplicates: 1,
                ..CounterDelta::default()
            },
        };
        self.count(&event.topic, &delta);

        Ok(outcome)
    }

    async fn query(&self, query: &EventQuery) -> StoreResult<Vec<StoredEvent>> {
        self.check_available()?;

        let mut events: Vec<StoredEvent> = self
            .events
            .iter()
            .filter(|entry| match &query.topic {
                Some(topic) => &entry.value().topic == topic,
                None => true,
            })
            .map(|entry| entry.value().clone())
            .collect();

        events.sort_by(|a, b| {
            b.source_timestamp
                .cmp(&a.source_timestamp)
                .then(a.seq.cmp(&b.seq))
        });
        events.truncate(usize::try_from(query.limit).unwrap_or(0));

        Ok(events)
    }

    async fn add_counts(&self, deltas: &[(String, CounterDelta)]) -> StoreResult<()> {
        self.check_available()?;

        for (topic, delta) in merge_deltas(deltas) {
            self.count(topic, &delta);
        }
        Ok(())
    }

    async fn counters(&self) -> StoreResult<Vec<TopicCounters>> {
        self.check_available()?;

        let mut counters: Vec<TopicCounters> = self
            .counters
            .iter()
            .map(|entry| entry.value().clone())
            .collect();
        counters.sort_by(|a, b| a.topic.cmp(&b.topic));
        Ok(counters)
    }
}
