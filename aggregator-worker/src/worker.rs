use std::sync::Arc;
use std::time;

use futures::future::join_all;
use health::HealthHandle;
use tokio::sync;
use tracing::{debug, error, warn};

use aggregator_common::{
    event::EventRecord,
    pgqueue::{QueuedTask, RetryError, RetryInvalidError, WorkQueue},
    retry::RetryPolicy,
    stats::{ProcessOutcome, StatsAggregator},
    store::{EventStore, InsertOutcome},
};

use crate::error::WorkerError;

#[derive(Clone, Debug)]
pub struct WorkerSettings {
    /// The maximum number of tasks to dequeue in one query.
    pub dequeue_batch_size: u32,
    /// The interval for polling the queue.
    pub poll_interval: time::Duration,
    /// Upper bound for a single store call. A timeout counts as a transient failure.
    pub store_timeout: time::Duration,
    /// Maximum number of tasks being processed at once.
    pub max_concurrent_jobs: usize,
    /// Backoff before a failed task is redelivered.
    pub retry_policy: RetryPolicy,
}

impl Default for WorkerSettings {
    fn default() -> Self {
        Self {
            dequeue_batch_size: 100,
            poll_interval: time::Duration::from_millis(100),
            store_timeout: time::Duration::from_secs(5),
            max_concurrent_jobs: 256,
            retry_policy: RetryPolicy::default(),
        }
    }
}

/// Applies one task to the store and settles it with the queue. Cheap to clone: every field is
/// shared.
#[derive(Clone)]
pub struct Processor {
    queue: Arc<dyn WorkQueue>,
    store: Arc<dyn EventStore>,
    stats: Arc<StatsAggregator>,
    retry_policy: RetryPolicy,
    store_timeout: time::Duration,
}

impl Processor {
    pub fn new(
        queue: Arc<dyn WorkQueue>,
        store: Arc<dyn EventStore>,
        stats: Arc<StatsAggregator>,
        retry_policy: RetryPolicy,
        store_timeout: time::Duration,
    ) -> Self {
        Self {
            queue,
            store,
            stats,
            retry_policy,
            store_timeout,
        }
    }

    /// Insert the task's event if absent, then ack, nack or dead-letter the task.
    ///
    /// Both `Inserted` and `DuplicateRejected` ack: a duplicate is a handled outcome. A store
    /// failure nacks with backoff until the attempts run out, then dead-letters. Failures to
    /// settle the task are logged; the queue will redeliver it and the store absorbs the replay.
    pub async fn process_one(&self, task: QueuedTask) -> ProcessOutcome {
        let start = time::Instant::now();
        let topic = task.event.topic.clone();

        let outcome = if task.attempt > task.max_attempts {
            // Claimed again after its holder vanished mid-attempt, past the budget.
            let reason = format!(
                "redelivered {} times, above the limit of {}",
                task.attempt, task.max_attempts
            );
            self.dead_letter(task, reason).await
        } else {
            match self.insert(&task.event).await {
                Ok(InsertOutcome::Inserted { seq, .. }) => {
                    self.ack(task).await;
                    ProcessOutcome::Inserted { seq }
                }
                Ok(InsertOutcome::AlreadyExists) => {
                    let (topic, event_id) = task.event.dedup_key();
                    debug!(topic, event_id, "dropping duplicate event");
                    self.ack(task).await;
                    ProcessOutcome::DuplicateRejected
                }
                Err(error) => self.fail(task, error).await,
            }
        };

        self.record(&topic, &outcome).await;
        metrics::counter!("aggregator_worker_outcomes_total", "outcome" => outcome.as_str())
            .increment(1);
        metrics::histogram!("aggregator_worker_process_duration_seconds")
            .record(start.elapsed().as_secs_f64());

        outcome
    }

    async fn insert(&self, event: &EventRecord) -> Result<InsertOutcome, WorkerError> {
        let outcome = tokio::time::timeout(self.store_timeout, self.store.insert_if_absent(event))
            .await
            .map_err(|_| WorkerError::StoreTimeout(self.store_timeout))??;
        Ok(outcome)
    }

    async fn record(&self, topic: &str, outcome: &ProcessOutcome) {
        let recorded =
            tokio::time::timeout(self.store_timeout, self.stats.record_outcome(topic, outcome))
                .await;
        let error = match recorded {
            Ok(Ok(())) => return,
            Ok(Err(error)) => WorkerError::from(error),
            Err(_) => WorkerError::StoreTimeout(self.store_timeout),
        };
        warn!(topic, "failed to count outcome, holding it for the next write: {}", error);
        metrics::counter!("aggregator_worker_stats_errors_total").increment(1);
    }

    async fn ack(&self, task: QueuedTask) {
        let id = task.id;
        if let Err(error) = self.queue.ack(task).await {
            let error = WorkerError::from(error);
            warn!(task_id = id, "failed to ack task: {}", error);
            metrics::counter!("aggregator_worker_settle_errors_total", "op" => "ack").increment(1);
        }
    }

    async fn fail(&self, task: QueuedTask, error: WorkerError) -> ProcessOutcome {
        let reason = error.to_string();
        let attempt = u32::try_from(task.attempt).unwrap_or(1);
        let retry_after = self.retry_policy.retry_interval(attempt);
        let id = task.id;

        match self.queue.nack(task, &reason, retry_after).await {
            Ok(()) => {
                warn!(
                    task_id = id,
                    attempt,
                    retry_after_ms = retry_after.as_millis() as u64,
                    "failed to store event, will retry: {}",
                    reason
                );
                ProcessOutcome::Failed {
                    reason,
                    dead_lettered: false,
                }
            }
            Err(RetryError::RetryInvalidError(RetryInvalidError { task, .. })) => {
                self.dead_letter(*task, reason).await
            }
            Err(RetryError::QueueError(queue_error)) => {
                warn!(task_id = id, "failed to release task for retry: {}", queue_error);
                metrics::counter!("aggregator_worker_settle_errors_total", "op" => "nack")
                    .increment(1);
                ProcessOutcome::Failed {
                    reason,
                    dead_lettered: false,
                }
            }
        }
    }

    async fn dead_letter(&self, task: QueuedTask, reason: String) -> ProcessOutcome {
        let id = task.id;
        let attempt = task.attempt;
        let (topic, event_id) = (task.event.topic.clone(), task.event.event_id.clone());

        let dead_lettered = match self.queue.dead_letter(task, &reason).await {
            Ok(()) => {
                error!(
                    task_id = id,
                    attempt,
                    topic = %topic,
                    event_id = %event_id,
                    "event dead-lettered: {}",
                    reason
                );
                true
            }
            Err(error) => {
                error!(task_id = id, "failed to dead-letter task: {}", error);
                metrics::counter!("aggregator_worker_settle_errors_total", "op" => "dead_letter")
                    .increment(1);
                false
            }
        };

        ProcessOutcome::Failed {
            reason,
            dead_lettered,
        }
    }
}

/// A worker polling a `WorkQueue` and spawning tasks to process events as they become available.
pub struct EventWorker {
    /// An identifier for this worker. Used to mark tasks we have claimed.
    name: String,
    queue: Arc<dyn WorkQueue>,
    processor: Processor,
    settings: WorkerSettings,
    /// The liveness check handle, to call on a schedule to report healthy
    liveness: HealthHandle,
}

impl EventWorker {
    pub fn new(
        name: &str,
        queue: Arc<dyn WorkQueue>,
        store: Arc<dyn EventStore>,
        stats: Arc<StatsAggregator>,
        settings: WorkerSettings,
        liveness: HealthHandle,
    ) -> Self {
        let processor = Processor::new(
            queue.clone(),
            store,
            stats,
            settings.retry_policy.clone(),
            settings.store_timeout,
        );

        Self {
            name: name.to_owned(),
            queue,
            processor,
            settings,
            liveness,
        }
    }

    /// Never claim more tasks than we have permits for.
    fn batch_size(&self) -> u32 {
        let max_concurrent = u32::try_from(self.settings.max_concurrent_jobs).unwrap_or(u32::MAX);
        self.settings.dequeue_batch_size.min(max_concurrent).max(1)
    }

    /// Wait until at least one task becomes available in our queue.
    async fn wait_for_tasks(&self) -> Vec<QueuedTask> {
        let mut interval = tokio::time::interval(self.settings.poll_interval);

        loop {
            interval.tick().await;
            self.liveness.report_healthy().await;

            match self.queue.dequeue(&self.name, self.batch_size()).await {
                Ok(tasks) if tasks.is_empty() => continue,
                Ok(tasks) => return tasks,
                Err(error) => {
                    error!("error while trying to dequeue tasks: {}", error);
                    metrics::counter!("aggregator_worker_dequeue_errors_total").increment(1);
                    continue;
                }
            }
        }
    }

    /// Run this worker to continuously process any tasks that become available.
    pub async fn run(&self) {
        let max_concurrent_jobs = self.settings.max_concurrent_jobs.max(1);
        let semaphore = Arc::new(sync::Semaphore::new(max_concurrent_jobs));
        let report_semaphore_utilization = || {
            metrics::gauge!("aggregator_worker_saturation_percent", "worker" => self.name.clone())
                .set(1f64 - semaphore.available_permits() as f64 / max_concurrent_jobs as f64);
        };

        let dequeue_batch_size_histogram = metrics::histogram!("aggregator_dequeue_batch_size");

        loop {
            report_semaphore_utilization();
            let tasks = self.wait_for_tasks().await;
            dequeue_batch_size_histogram.record(tasks.len() as f64);

            // Get enough permits for the tasks before spawning.
            let permits = match semaphore
                .clone()
                .acquire_many_owned(tasks.len() as u32)
                .await
            {
                Ok(permits) => permits,
                Err(_) => {
                    error!("worker semaphore has been closed");
                    return;
                }
            };

            let processor = self.processor.clone();
            tokio::spawn(async move {
                // Move `permits` into the task so they are released when it ends.
                let _permits = permits;
                join_all(tasks.into_iter().map(|task| processor.process_one(task))).await;
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;
    use chrono::{TimeZone, Utc};
    use health::HealthRegistry;

    use aggregator_common::pgqueue::{MemoryQueue, NewTask, TaskStatus};
    use aggregator_common::store::{
        CounterDelta, EventQuery, MemoryEventStore, StoreError, StoreResult, StoredEvent,
        TopicCounters,
    };

    use super::*;

    const VISIBILITY: time::Duration = time::Duration::from_secs(30);

    fn event(event_id: &str) -> EventRecord {
        EventRecord {
            topic: "t1".to_owned(),
            event_id: event_id.to_owned(),
            source: Some("test".to_owned()),
            payload: serde_json::Map::new(),
            source_timestamp: Utc.with_ymd_and_hms(2024, 6, 1, 12, 0, 0).unwrap(),
            received_at: Utc::now(),
        }
    }

    fn retry_policy() -> RetryPolicy {
        RetryPolicy::build(2, time::Duration::from_millis(10)).provide()
    }

    struct Fixture {
        queue: Arc<MemoryQueue>,
        store: Arc<MemoryEventStore>,
        stats: Arc<StatsAggregator>,
        processor: Processor,
    }

    fn fixture() -> Fixture {
        let queue = Arc::new(MemoryQueue::new("test", VISIBILITY));
        let store = Arc::new(MemoryEventStore::new());
        let stats = Arc::new(StatsAggregator::new(
            store.clone(),
            time::Duration::from_secs(60),
        ));
        let processor = Processor::new(
            queue.clone(),
            store.clone(),
            stats.clone(),
            retry_policy(),
            time::Duration::from_secs(1),
        );
        Fixture {
            queue,
            store,
            stats,
            processor,
        }
    }

    async fn claim(queue: &MemoryQueue) -> QueuedTask {
        queue
            .dequeue("test-worker", 1)
            .await
            .expect("failed to dequeue")
            .pop()
            .expect("no task to dequeue")
    }

    /// A store that never answers.
    struct HangingStore;

    #[async_trait]
    impl EventStore for HangingStore {
        async fn insert_if_absent(&self, _event: &EventRecord) -> StoreResult<InsertOutcome> {
            std::future::pending().await
        }

        async fn query(&self, _query: &EventQuery) -> StoreResult<Vec<StoredEvent>> {
            std::future::pending().await
        }

        async fn add_counts(&self, _deltas: &[(String, CounterDelta)]) -> StoreResult<()> {
            std::future::pending().await
        }

        async fn counters(&self) -> StoreResult<Vec<TopicCounters>> {
            Err(StoreError::Unavailable)
        }
    }

    #[tokio::test]
    async fn test_inserted_then_duplicate() {
        let fixture = fixture();
        fixture
            .queue
            .enqueue(vec![NewTask::new(3, event("e1")), NewTask::new(3, event("e1"))])
            .await
            .unwrap();

        let first = fixture
            .processor
            .process_one(claim(&fixture.queue).await)
            .await;
        assert!(matches!(first, ProcessOutcome::Inserted { .. }));

        let second = fixture
            .processor
            .process_one(claim(&fixture.queue).await)
            .await;
        assert_eq!(second, ProcessOutcome::DuplicateRejected);

        assert_eq!(fixture.store.len(), 1);
        assert_eq!(fixture.queue.status(1), Some(TaskStatus::Completed));
        assert_eq!(fixture.queue.status(2), Some(TaskStatus::Completed));

        let snapshot = fixture.stats.snapshot().await.unwrap();
        assert_eq!(snapshot.accepted, 1);
        assert_eq!(snapshot.duplicates, 1);
    }

    #[tokio::test]
    async fn test_store_failure_retries_then_dead_letters() {
        let fixture = fixture();
        fixture
            .queue
            .enqueue(vec![NewTask::new(2, event("e1"))])
            .await
            .unwrap();
        fixture.store.set_unavailable(true);

        let outcome = fixture
            .processor
            .process_one(claim(&fixture.queue).await)
            .await;
        assert_eq!(
            outcome,
            ProcessOutcome::Failed {
                reason: "store is unavailable".to_owned(),
                dead_lettered: false
            }
        );
        assert_eq!(fixture.queue.status(1), Some(TaskStatus::Available));

        // Wait out the 10ms backoff.
        tokio::time::sleep(time::Duration::from_millis(20)).await;

        let outcome = fixture
            .processor
            .process_one(claim(&fixture.queue).await)
            .await;
        assert!(matches!(
            outcome,
            ProcessOutcome::Failed {
                dead_lettered: true,
                ..
            }
        ));
        assert_eq!(fixture.queue.status(1), Some(TaskStatus::DeadLettered));
        assert_eq!(fixture.queue.errors(1).len(), 2);

        // Counted once the store is back.
        fixture.store.set_unavailable(false);
        let snapshot = fixture.stats.snapshot().await.unwrap();
        assert_eq!(snapshot.failed, 2);
        assert_eq!(snapshot.dead_lettered, 1);
        assert_eq!(snapshot.accepted, 0);
    }

    #[tokio::test]
    async fn test_recovers_after_transient_failure() {
        let fixture = fixture();
        fixture
            .queue
            .enqueue(vec![NewTask::new(5, event("e1"))])
            .await
            .unwrap();

        fixture.store.set_unavailable(true);
        let outcome = fixture
            .processor
            .process_one(claim(&fixture.queue).await)
            .await;
        assert!(matches!(outcome, ProcessOutcome::Failed { .. }));

        fixture.store.set_unavailable(false);
        tokio::time::sleep(time::Duration::from_millis(20)).await;

        let outcome = fixture
            .processor
            .process_one(claim(&fixture.queue).await)
            .await;
        assert!(matches!(outcome, ProcessOutcome::Inserted { .. }));
        assert_eq!(fixture.store.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_store_timeout_is_a_transient_failure() {
        let queue = Arc::new(MemoryQueue::new("test", VISIBILITY));
        let store: Arc<dyn EventStore> = Arc::new(HangingStore);
        let stats = Arc::new(StatsAggregator::new(
            store.clone(),
            time::Duration::from_secs(60),
        ));
        let processor = Processor::new(
            queue.clone(),
            store,
            stats,
            retry_policy(),
            time::Duration::from_millis(500),
        );
        queue.enqueue(vec![NewTask::new(3, event("e1"))]).await.unwrap();

        let outcome = processor.process_one(claim(&queue).await).await;

        match outcome {
            ProcessOutcome::Failed {
                reason,
                dead_lettered: false,
            } => assert!(reason.contains("timed out"), "unexpected reason: {reason}"),
            other => panic!("expected a retryable failure, got {other:?}"),
        }
        assert_eq!(queue.status(1), Some(TaskStatus::Available));
    }

    #[tokio::test(start_paused = true)]
    async fn test_redelivery_past_budget_is_dead_lettered() {
        let fixture = fixture();
        fixture
            .queue
            .enqueue(vec![NewTask::new(1, event("e1"))])
            .await
            .unwrap();

        // Two claims whose holders never settled.
        drop(claim(&fixture.queue).await);
        tokio::time::advance(VISIBILITY).await;
        let task = claim(&fixture.queue).await;
        assert_eq!(task.attempt, 2);

        let outcome = fixture.processor.process_one(task).await;

        assert!(matches!(
            outcome,
            ProcessOutcome::Failed {
                dead_lettered: true,
                ..
            }
        ));
        assert!(fixture.store.is_empty());
    }

    #[tokio::test]
    async fn test_run_drains_the_queue() {
        let fixture = fixture();
        let liveness = HealthRegistry::new("liveness");
        let handle = liveness
            .register("worker".to_string(), time::Duration::from_secs(30))
            .await;

        let worker = EventWorker::new(
            "test-worker",
            fixture.queue.clone(),
            fixture.store.clone(),
            fixture.stats.clone(),
            WorkerSettings {
                dequeue_batch_size: 4,
                poll_interval: time::Duration::from_millis(5),
                max_concurrent_jobs: 2,
                ..WorkerSettings::default()
            },
            handle,
        );

        let mut tasks: Vec<NewTask> = (0..10)
            .map(|i| NewTask::new(3, event(&format!("e{i}"))))
            .collect();
        tasks.extend((0..5).map(|i| NewTask::new(3, event(&format!("e{i}")))));
        fixture.queue.enqueue(tasks).await.unwrap();

        let running = tokio::spawn(async move { worker.run().await });

        tokio::time::timeout(time::Duration::from_secs(5), async {
            loop {
                let snapshot = fixture.stats.snapshot().await.unwrap();
                if snapshot.accepted + snapshot.duplicates == 15 {
                    break;
                }
                tokio::time::sleep(time::Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("worker did not drain the queue");
        running.abort();

        let snapshot = fixture.stats.snapshot().await.unwrap();
        assert_eq!(snapshot.accepted, 10);
        assert_eq!(snapshot.duplicates, 5);
        assert_eq!(fixture.store.len(), 10);
        assert!(liveness.get_status().healthy);
    }
}
