//! # Stats
//!
//! Statistics over processing outcomes. The counters live in the store, shared by every
//! gateway and worker process, so any process's `/stats` sees the whole pipeline. Reading
//! them is one row per topic; the events table is never scanned on the request path.
use std::collections::{BTreeMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::time::Instant;

use crate::store::{CounterDelta, EventStore, StoreResult, TopicCounters};

/// What happened to one dequeued task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessOutcome {
    Inserted { seq: i64 },
    DuplicateRejected,
    Failed { reason: String, dead_lettered: bool },
}

impl ProcessOutcome {
    /// Label used for metrics and logs.
    pub fn as_str(&self) -> &'static str {
        match self {
            ProcessOutcome::Inserted { .. } => "inserted",
            ProcessOutcome::DuplicateRejected => "duplicate",
            ProcessOutcome::Failed {
                dead_lettered: true,
                ..
            } => "dead_lettered",
            ProcessOutcome::Failed { .. } => "failed",
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct TopicSnapshot {
    pub accepted: u64,
    pub duplicates: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StatsSnapshot {
    pub received: u64,
    pub accepted: u64,
    pub duplicates: u64,
    pub failed: u64,
    pub dead_lettered: u64,
    /// duplicates / (accepted + duplicates), 0 before any outcome.
    pub duplicate_rate: f64,
    /// Topics with at least one stored event, sorted.
    pub topics: Vec<String>,
    pub per_topic: BTreeMap<String, TopicSnapshot>,
    pub uptime: String,
    pub uptime_seconds: u64,
    pub throughput_per_second: f64,
    pub throughput_window_seconds: u64,
    pub started_at: DateTime<Utc>,
}

/// Accepted events per second over a trailing window, derived from samples of the shared
/// accepted total. One sample at or before the window start is kept as the baseline.
#[derive(Debug)]
pub struct ThroughputWindow {
    window_secs: u64,
    samples: VecDeque<(u64, u64)>,
}

impl ThroughputWindow {
    pub fn new(window: Duration) -> Self {
        Self {
            window_secs: window.as_secs().max(1),
            samples: VecDeque::new(),
        }
    }

    pub fn window_secs(&self) -> u64 {
        self.window_secs
    }

    /// Record the accepted total seen at second `at` (seconds since start).
    pub fn observe(&mut self, at: u64, total: u64) {
        match self.samples.back_mut() {
            Some((second, latest)) if *second >= at => *latest = (*latest).max(total),
            _ => self.samples.push_back((at, total)),
        }
        self.evict(at);
    }

    /// Rate between the oldest and newest samples, 0 until two distinct seconds were sampled.
    pub fn rate(&self) -> f64 {
        match (self.samples.front(), self.samples.back()) {
            (Some((first_at, first)), Some((last_at, last))) if last_at > first_at => {
                last.saturating_sub(*first) as f64 / (last_at - first_at) as f64
            }
            _ => 0.0,
        }
    }

    fn evict(&mut self, now: u64) {
        while self.samples.len() > 1 && self.samples[1].0 + self.window_secs <= now {
            self.samples.pop_front();
        }
    }
}

/// Reports outcomes into the store's shared counters and builds snapshots from them. Each
/// process owns one; uptime and throughput samples are local to it.
///
/// Counts that fail to reach the store are held and sent with the next write.
pub struct StatsAggregator {
    store: Arc<dyn EventStore>,
    started: Instant,
    started_at: DateTime<Utc>,
    throughput: Mutex<ThroughputWindow>,
    pending: Mutex<BTreeMap<String, CounterDelta>>,
}

impl StatsAggregator {
    pub fn new(store: Arc<dyn EventStore>, throughput_window: Duration) -> Self {
        Self {
            store,
            started: Instant::now(),
            started_at: Utc::now(),
            throughput: Mutex::new(ThroughputWindow::new(throughput_window)),
            pending: Mutex::new(BTreeMap::new()),
        }
    }

    /// Count events handed to the queue by the gateway, one entry per event.
    pub async fn record_received<'a>(
        &self,
        topics: impl IntoIterator<Item = &'a str>,
    ) -> StoreResult<()> {
        let deltas = topics
            .into_iter()
            .map(|topic| (topic.to_owned(), CounterDelta::received(1)));
        self.add(deltas).await
    }

    /// `Inserted` and `DuplicateRejected` were already counted by the insert that produced
    /// them, so only failures add to the counters here.
    pub async fn record_outcome(&self, topic: &str, outcome: &ProcessOutcome) -> StoreResult<()> {
        let delta = match outcome {
            ProcessOutcome::Inserted { .. } | ProcessOutcome::DuplicateRejected => None,
            ProcessOutcome::Failed { dead_lettered, .. } => Some(CounterDelta {
                failed: 1,
                dead_lettered: i64::from(*dead_lettered),
                ..CounterDelta::default()
            }),
        };
        self.add(delta.map(|delta| (topic.to_owned(), delta))).await
    }

    /// Send any held counts.
    pub async fn flush(&self) -> StoreResult<()> {
        self.add(None).await
    }

    /// Read the shared counters and feed the throughput window, without building a snapshot.
    pub async fn sample(&self) -> StoreResult<()> {
        self.flush().await?;
        let counters = self.store.counters().await?;
        self.observe(&counters);
        Ok(())
    }

    pub async fn snapshot(&self) -> StoreResult<StatsSnapshot> {
        self.flush().await?;
        let counters = self.store.counters().await?;
        let (throughput_per_second, throughput_window_seconds) = self.observe(&counters);
        let uptime = self.started.elapsed();

        let mut totals = TopicCounters::default();
        let mut per_topic = BTreeMap::new();
        let mut topics = Vec::new();
        for counter in counters {
            totals.received += counter.received;
            totals.accepted += counter.accepted;
            totals.duplicates += counter.duplicates;
            totals.failed += counter.failed;
            totals.dead_lettered += counter.dead_lettered;

            if counter.accepted > 0 {
                topics.push(counter.topic.clone());
            }
            per_topic.insert(
                counter.topic,
                TopicSnapshot {
                    accepted: count(counter.accepted),
                    duplicates: count(counter.duplicates),
                },
            );
        }

        let accepted = count(totals.accepted);
        let duplicates = count(totals.duplicates);

        Ok(StatsSnapshot {
            received: count(totals.received),
            accepted,
            duplicates,
            failed: count(totals.failed),
            dead_lettered: count(totals.dead_lettered),
            duplicate_rate: duplicate_rate(accepted, duplicates),
            topics,
            per_topic,
            uptime: format_uptime(uptime),
            uptime_seconds: uptime.as_secs(),
            throughput_per_second,
            throughput_window_seconds,
            started_at: self.started_at,
        })
    }

    async fn add(
        &self,
        deltas: impl IntoIterator<Item = (String, CounterDelta)>,
    ) -> StoreResult<()> {
        let mut merged = match self.pending.lock() {
            Ok(mut pending) => std::mem::take(&mut *pending),
            Err(_) => BTreeMap::new(),
        };
        for (topic, delta) in deltas {
            merged.entry(topic).or_default().merge(&delta);
        }
        if merged.is_empty() {
            return Ok(());
        }

        let deltas: Vec<(String, CounterDelta)> = merged.into_iter().collect();
        let result = self.store.add_counts(&deltas).await;
        if result.is_err() {
            if let Ok(mut pending) = self.pending.lock() {
                for (topic, delta) in deltas {
                    pending.entry(topic).or_default().merge(&delta);
                }
            }
        }
        result
    }

    fn observe(&self, counters: &[TopicCounters]) -> (f64, u64) {
        let accepted: i64 = counters.iter().map(|c| c.accepted).sum();
        let at = self.started.elapsed().as_secs();
        match self.throughput.lock() {
            Ok(mut throughput) => {
                throughput.observe(at, count(accepted));
                (throughput.rate(), throughput.window_secs())
            }
            Err(_) => (0.0, 0),
        }
    }
}

fn count(value: i64) -> u64 {
    u64::try_from(value).unwrap_or(0)
}

fn duplicate_rate(accepted: u64, duplicates: u64) -> f64 {
    match accepted + duplicates {
        0 => 0.0,
        total => duplicates as f64 / total as f64,
    }
}

/// `H:MM:SS`, prefixed with `N day(s), ` once past a day.
pub fn format_uptime(uptime: Duration) -> String {
    let secs = uptime.as_secs();
    let (days, rem) = (secs / 86_400, secs % 86_400);
    let clock = format!("{}:{:02}:{:02}", rem / 3600, (rem % 3600) / 60, rem % 60);

    match days {
        0 => clock,
        1 => format!("1 day, {clock}"),
        n => format!("{n} days, {clock}"),
    }
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;
    use serde_json::Map;

    use super::*;
    use crate::event::EventRecord;
    use crate::store::MemoryEventStore;

    fn event(topic: &str, event_id: &str) -> EventRecord {
        EventRecord {
            topic: topic.to_owned(),
            event_id: event_id.to_owned(),
            source: None,
            payload: Map::new(),
            source_timestamp: Utc.with_ymd_and_hms(2024, 6, 1, 12, 0, 0).unwrap(),
            received_at: Utc::now(),
        }
    }

    fn failed(dead_lettered: bool) -> ProcessOutcome {
        ProcessOutcome::Failed {
            reason: "timeout".to_owned(),
            dead_lettered,
        }
    }

    #[test]
    fn test_format_uptime() {
        assert_eq!(format_uptime(Duration::ZERO), "0:00:00");
        assert_eq!(format_uptime(Duration::from_secs(3_723)), "1:02:03");
        assert_eq!(format_uptime(Duration::from_secs(86_399)), "23:59:59");
        assert_eq!(format_uptime(Duration::from_secs(86_400)), "1 day, 0:00:00");
        assert_eq!(
            format_uptime(Duration::from_secs(2 * 86_400 + 61)),
            "2 days, 0:01:01"
        );
    }

    #[test]
    fn test_throughput_window() {
        let mut window = ThroughputWindow::new(Duration::from_secs(10));

        window.observe(0, 0);
        // A single second sampled so far.
        assert_eq!(window.rate(), 0.0);

        window.observe(4, 40);
        // Totals never go backwards within a second.
        window.observe(4, 35);
        assert_eq!(window.rate(), 10.0);

        window.observe(12, 60);
        // Second 0 is still the baseline: second 4 is inside the window.
        assert_eq!(window.rate(), 5.0);

        // Nothing accepted between second 12 and second 30.
        window.observe(30, 60);
        assert_eq!(window.rate(), 0.0);
    }

    #[tokio::test]
    async fn test_hundred_unique_then_hundred_duplicates() {
        let store = Arc::new(MemoryEventStore::new());
        let stats = StatsAggregator::new(store.clone(), Duration::from_secs(60));

        for round in 0..2 {
            for i in 0..100 {
                let outcome = store
                    .insert_if_absent(&event("t1", &format!("e{i}")))
                    .await
                    .unwrap();
                assert_eq!(
                    matches!(outcome, crate::store::InsertOutcome::Inserted { .. }),
                    round == 0
                );
            }
        }

        let snapshot = stats.snapshot().await.unwrap();
        assert_eq!(snapshot.accepted, 100);
        assert_eq!(snapshot.duplicates, 100);
        assert_eq!(snapshot.duplicate_rate, 0.5);
        assert_eq!(snapshot.topics, vec!["t1"]);
        assert_eq!(
            snapshot.per_topic.get("t1"),
            Some(&TopicSnapshot {
                accepted: 100,
                duplicates: 100
            })
        );
    }

    #[tokio::test]
    async fn test_failures_and_received() {
        let store = Arc::new(MemoryEventStore::new());
        let stats = StatsAggregator::new(store.clone(), Duration::from_secs(60));

        stats.record_received(["a", "a", "b", "c"]).await.unwrap();
        store.insert_if_absent(&event("a", "e1")).await.unwrap();
        stats
            .record_outcome("a", &ProcessOutcome::Inserted { seq: 1 })
            .await
            .unwrap();
        stats.record_outcome("c", &failed(false)).await.unwrap();
        stats.record_outcome("c", &failed(true)).await.unwrap();

        let snapshot = stats.snapshot().await.unwrap();
        assert_eq!(snapshot.received, 4);
        // The insert counted itself; recording the outcome does not count it again.
        assert_eq!(snapshot.accepted, 1);
        assert_eq!(snapshot.failed, 2);
        assert_eq!(snapshot.dead_lettered, 1);
        // "b" and "c" have nothing stored.
        assert_eq!(snapshot.topics, vec!["a"]);
        assert_eq!(snapshot.per_topic.len(), 3);
    }

    #[tokio::test]
    async fn test_empty_snapshot() {
        let store = Arc::new(MemoryEventStore::new());
        let stats = StatsAggregator::new(store, Duration::from_secs(60));
        let snapshot = stats.snapshot().await.unwrap();

        assert_eq!(snapshot.duplicate_rate, 0.0);
        assert_eq!(snapshot.throughput_per_second, 0.0);
        assert_eq!(snapshot.throughput_window_seconds, 60);
        assert!(snapshot.topics.is_empty());
    }

    #[tokio::test]
    async fn test_unavailable_store_has_no_snapshot() {
        let store = Arc::new(MemoryEventStore::new());
        let stats = StatsAggregator::new(store.clone(), Duration::from_secs(60));
        store.set_unavailable(true);

        assert!(stats.snapshot().await.is_err());
        assert!(stats.record_outcome("t1", &failed(false)).await.is_err());
    }

    #[tokio::test]
    async fn test_counts_held_while_store_is_down() {
        let store = Arc::new(MemoryEventStore::new());
        let stats = StatsAggregator::new(store.clone(), Duration::from_secs(60));

        store.set_unavailable(true);
        assert!(stats.record_received(["t1"]).await.is_err());
        assert!(stats.record_outcome("t1", &failed(true)).await.is_err());

        store.set_unavailable(false);
        let snapshot = stats.snapshot().await.unwrap();
        assert_eq!(snapshot.received, 1);
        assert_eq!(snapshot.failed, 1);
        assert_eq!(snapshot.dead_lettered, 1);

        // Sent once only.
        assert_eq!(stats.snapshot().await.unwrap().received, 1);
    }

    #[tokio::test]
    async fn test_aggregators_share_counters_through_the_store() {
        let store = Arc::new(MemoryEventStore::new());
        let gateway = StatsAggregator::new(store.clone(), Duration::from_secs(60));
        let worker = StatsAggregator::new(store.clone(), Duration::from_secs(60));

        gateway.record_received(["t1", "t1"]).await.unwrap();
        store.insert_if_absent(&event("t1", "e1")).await.unwrap();
        store.insert_if_absent(&event("t1", "e1")).await.unwrap();
        worker.record_outcome("t1", &failed(true)).await.unwrap();

        let seen_by_gateway = gateway.snapshot().await.unwrap();
        let seen_by_worker = worker.snapshot().await.unwrap();
        for snapshot in [&seen_by_gateway, &seen_by_worker] {
            assert_eq!(snapshot.received, 2);
            assert_eq!(snapshot.accepted, 1);
            assert_eq!(snapshot.duplicates, 1);
            assert_eq!(snapshot.dead_lettered, 1);
            assert_eq!(snapshot.topics, vec!["t1"]);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_throughput_follows_the_shared_total() {
        let store = Arc::new(MemoryEventStore::new());
        let stats = StatsAggregator::new(store.clone(), Duration::from_secs(60));
        stats.sample().await.unwrap();

        for i in 0..30 {
            store
                .insert_if_absent(&event("t1", &format!("e{i}")))
                .await
                .unwrap();
        }
        tokio::time::advance(Duration::from_secs(3)).await;

        let snapshot = stats.snapshot().await.unwrap();
        assert_eq!(snapshot.throughput_per_second, 10.0);
        assert_eq!(snapshot.uptime_seconds, 3);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_updates() {
        let store = Arc::new(MemoryEventStore::new());
        let stats = Arc::new(StatsAggregator::new(store, Duration::from_secs(60)));

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let stats = stats.clone();
                tokio::spawn(async move {
                    for i in 0..250 {
                        let topic = format!("t{}", i % 4);
                        stats.record_received([topic.as_str()]).await.unwrap();
                        stats.record_outcome(&topic, &failed(false)).await.unwrap();
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.await.unwrap();
        }

        let snapshot = stats.snapshot().await.unwrap();
        assert_eq!(snapshot.received, 2000);
        assert_eq!(snapshot.failed, 2000);
        assert_eq!(snapshot.per_topic.len(), 4);
    }
}
