//! # PgQueue
//!
//! The work queue between the gateway and the workers, backed by a PostgreSQL table.
//!
//! Delivery is at-least-once. A claimed task is `running` under a fresh `lock_id`; if its holder
//! does not ack, nack, or dead-letter it within the visibility timeout, the next `dequeue` claims
//! it again. Every state transition is fenced on the `lock_id`, so a holder whose claim expired
//! gets `QueueError::LockLost` instead of clobbering the new holder's state.
use std::collections::BTreeMap;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::json;
use sqlx::postgres::{PgConnectOptions, PgPool, PgPoolOptions};
use thiserror::Error;
use uuid::Uuid;

use crate::event::EventRecord;

#[derive(Error, Debug)]
pub enum QueueError {
    #[error("pool creation failed with: {error}")]
    PoolCreationError { error: sqlx::Error },
    #[error("{command} query failed with: {error}")]
    QueryError { command: String, error: sqlx::Error },
    #[error("task {id} is no longer held by this worker")]
    LockLost { id: i64 },
    #[error("queue is unavailable")]
    Unavailable,
}

/// A task cannot be nacked once its attempts are exhausted. The task is handed back so the
/// caller can dead-letter it.
#[derive(Error, Debug)]
#[error("retry is an invalid state for this task: {error}")]
pub struct RetryInvalidError {
    pub task: Box<QueuedTask>,
    pub error: String,
}

#[derive(Error, Debug)]
pub enum RetryError {
    #[error(transparent)]
    QueueError(#[from] QueueError),
    #[error(transparent)]
    RetryInvalidError(#[from] RetryInvalidError),
}

pub type QueueResult<T> = std::result::Result<T, QueueError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, sqlx::Type)]
#[sqlx(type_name = "task_status")]
#[sqlx(rename_all = "snake_case")]
pub enum TaskStatus {
    /// Waiting to be claimed, possibly not before `scheduled_at`.
    Available,
    /// Claimed by a worker.
    Running,
    /// Acknowledged.
    Completed,
    /// Exhausted its attempts.
    DeadLettered,
}

/// An event waiting to be handed to the queue.
#[derive(Debug, Clone)]
pub struct NewTask {
    pub max_attempts: i32,
    pub event: EventRecord,
}

impl NewTask {
    pub fn new(max_attempts: i32, event: EventRecord) -> Self {
        Self {
            max_attempts,
            event,
        }
    }
}

/// A claimed task. Consumed by `ack`, `nack` or `dead_letter`.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct QueuedTask {
    pub id: i64,
    /// Attempt number of this claim, starting at 1.
    pub attempt: i32,
    pub max_attempts: i32,
    pub created_at: DateTime<Utc>,
    pub attempted_by: Vec<String>,
    pub lock_id: Uuid,
    pub queue: String,
    #[sqlx(json)]
    pub event: EventRecord,
}

impl QueuedTask {
    /// Return true if this attempt is greater or equal to the maximum number of possible attempts.
    pub fn is_gte_max_attempts(&self) -> bool {
        self.attempt >= self.max_attempts
    }
}

/// Task counts by status, for the janitor's gauges.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, sqlx::FromRow)]
pub struct QueueDepth {
    pub available: i64,
    pub running: i64,
    pub dead_lettered: i64,
}

#[async_trait]
pub trait WorkQueue: Send + Sync {
    /// Hand off a batch of tasks. Either every task is queued or none is.
    async fn enqueue(&self, tasks: Vec<NewTask>) -> QueueResult<Vec<i64>>;

    /// Claim up to `limit` due tasks, including running ones whose claim has expired.
    async fn dequeue(&self, attempted_by: &str, limit: u32) -> QueueResult<Vec<QueuedTask>>;

    /// Mark the task as done. It will not be delivered again.
    async fn ack(&self, task: QueuedTask) -> QueueResult<()>;

    /// Release the task for redelivery after `retry_after`.
    async fn nack(
        &self,
        task: QueuedTask,
        error: &str,
        retry_after: time::Duration,
    ) -> Result<(), RetryError>;

    /// Park the task for operator attention. It will not be delivered again.
    async fn dead_letter(&self, task: QueuedTask, error: &str) -> QueueResult<()>;
}

fn error_entry(task: &QueuedTask, error: &str) -> serde_json::Value {
    json!({
        "attempt": task.attempt,
        "attempted_by": task.attempted_by.last(),
        "error": error,
        "at": Utc::now(),
    })
}

/// A queue implemented on top of a PostgreSQL table.
#[derive(Clone)]
pub struct PgQueue {
    /// A name to identify this PgQueue as multiple may share a table.
    name: String,
    pool: PgPool,
    visibility_timeout: time::Duration,
}

impl PgQueue {
    /// Initialize a PgQueue with a lazily connecting pool to the database at `url`.
    pub fn new(
        queue_name: &str,
        url: &str,
        max_connections: u32,
        app_name: &'static str,
        visibility_timeout: time::Duration,
    ) -> QueueResult<Self> {
        let options = PgConnectOptions::from_str(url)
            .map_err(|error| QueueError::PoolCreationError { error })?
            .application_name(app_name);
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect_lazy_with(options);

        Ok(Self::new_from_pool(queue_name, pool, visibility_timeout))
    }

    pub fn new_from_pool(
        queue_name: &str,
        pool: PgPool,
        visibility_timeout: time::Duration,
    ) -> Self {
        Self {
            name: queue_name.to_owned(),
            pool,
            visibility_timeout,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Delete acknowledged tasks that finished more than `older_than` ago.
    pub async fn purge_completed(&self, older_than: time::Duration) -> QueueResult<u64> {
        let base_query = r#"
DELETE FROM
    event_queue
WHERE
    queue = $1
    AND status = $2
    AND last_attempt_finished_at <= NOW() - $3::interval
        "#;

        let result = sqlx::query(base_query)
            .bind(&self.name)
            .bind(TaskStatus::Completed)
            .bind(older_than)
            .execute(&self.pool)
            .await
            .map_err(|error| QueueError::QueryError {
                command: "DELETE".to_owned(),
                error,
            })?;

        Ok(result.rows_affected())
    }

    pub async fn depth(&self) -> QueueResult<QueueDepth> {
        let base_query = r#"
SELECT
    COUNT(*) FILTER (WHERE status = 'available') AS available,
    COUNT(*) FILTER (WHERE status = 'running') AS running,
    COUNT(*) FILTER (WHERE status = 'dead_lettered') AS dead_lettered
FROM
    event_queue
WHERE
    queue = $1
        "#;

        sqlx::query_as(base_query)
            .bind(&self.name)
            .fetch_one(&self.pool)
            .await
            .map_err(|error| QueueError::QueryError {
                command: "SELECT".to_owned(),
                error,
            })
    }

    async fn finish(
        &self,
        task: &QueuedTask,
        status: TaskStatus,
        error: Option<serde_json::Value>,
        retry_after: time::Duration,
    ) -> QueueResult<()> {
        let base_query = r#"
UPDATE
    event_queue
SET
    status = $3,
    last_attempt_finished_at = NOW(),
    scheduled_at = NOW() + $4::interval,
    errors = CASE WHEN $5::jsonb IS NULL THEN errors ELSE array_append(errors, $5::jsonb) END,
    lock_id = NULL
WHERE
    id = $1
    AND lock_id = $2
        "#;

        let result = sqlx::query(base_query)
            .bind(task.id)
            .bind(task.lock_id)
            .bind(status)
            .bind(retry_after)
            .bind(error.map(sqlx::types::Json))
            .execute(&self.pool)
            .await
            .map_err(|error| QueueError::QueryError {
                command: "UPDATE".to_owned(),
                error,
            })?;

        if result.rows_affected() == 0 {
            return Err(QueueError::LockLost { id: task.id });
        }
        Ok(())
    }
}

#[async_trait]
impl WorkQueue for PgQueue {
    async fn enqueue(&self, tasks: Vec<NewTask>) -> QueueResult<Vec<i64>> {
        if tasks.is_empty() {
            return Ok(Vec::new());
        }

        let mut builder =
            sqlx::QueryBuilder::new("INSERT INTO event_queue (queue, max_attempts, event) ");
        builder.push_values(tasks.iter(), |mut row, task| {
            row.push_bind(&self.name)
                .push_bind(task.max_attempts)
                .push_bind(sqlx::types::Json(&task.event));
        });
        builder.push(" RETURNING id");

        builder
            .build_query_scalar()
            .fetch_all(&self.pool)
            .await
            .map_err(|error| QueueError::QueryError {
                command: "INSERT".to_owned(),
                error,
            })
    }

    async fn dequeue(&self, attempted_by: &str, limit: u32) -> QueueResult<Vec<QueuedTask>> {
        // FOR UPDATE SKIP LOCKED lets concurrent workers claim disjoint sets of rows.
        let base_query = r#"
WITH due AS (
    SELECT
        id
    FROM
        event_queue
    WHERE
        queue = $1
        AND (
            (status = 'available' AND scheduled_at <= NOW())
            OR (status = 'running' AND attempted_at <= NOW() - $3::interval)
        )
    ORDER BY
        attempt,
        scheduled_at
    LIMIT $2
    FOR UPDATE SKIP LOCKED
)
UPDATE
    event_queue
SET
    status = 'running',
    attempted_at = NOW(),
    attempt = event_queue.attempt + 1,
    attempted_by = array_append(event_queue.attempted_by, $4::text),
    lock_id = $5
FROM
    due
WHERE
    event_queue.id = due.id
RETURNING
    event_queue.id,
    event_queue.attempt,
    event_queue.max_attempts,
    event_queue.created_at,
    event_queue.attempted_by,
    event_queue.lock_id,
    event_queue.queue,
    event_queue.event
        "#;

        sqlx::query_as(base_query)
            .bind(&self.name)
            .bind(i64::from(limit))
            .bind(self.visibility_timeout)
            .bind(attempted_by)
            .bind(Uuid::now_v7())
            .fetch_all(&self.pool)
            .await
            .map_err(|error| QueueError::QueryError {
                command: "UPDATE".to_owned(),
                error,
            })
    }

    async fn ack(&self, task: QueuedTask) -> QueueResult<()> {
        self.finish(&task, TaskStatus::Completed, None, time::Duration::ZERO)
            .await
    }

    async fn nack(
        &self,
        task: QueuedTask,
        error: &str,
        retry_after: time::Duration,
    ) -> Result<(), RetryError> {
        if task.is_gte_max_attempts() {
            return Err(RetryError::from(RetryInvalidError {
                task: Box::new(task),
                error: "Maximum attempts reached".to_owned(),
            }));
        }

        let entry = error_entry(&task, error);
        self.finish(&task, TaskStatus::Available, Some(entry), retry_after)
            .await?;
        Ok(())
    }

    async fn dead_letter(&self, task: QueuedTask, error: &str) -> QueueResult<()> {
        let entry = error_entry(&task, error);
        self.finish(&task, TaskStatus::DeadLettered, Some(entry), time::Duration::ZERO)
            .await
    }
}

#[derive(Debug)]
struct MemoryTask {
    status: TaskStatus,
    attempt: i32,
    max_attempts: i32,
    created_at: DateTime<Utc>,
    scheduled_at: tokio::time::Instant,
    attempted_at: Option<tokio::time::Instant>,
    attempted_by: Vec<String>,
    lock_id: Option<Uuid>,
    errors: Vec<serde_json::Value>,
    event: EventRecord,
}

#[derive(Default)]
struct MemoryQueueState {
    last_id: i64,
    tasks: BTreeMap<i64, MemoryTask>,
}

/// In-process queue with the same claim and fencing rules as `PgQueue`. Time is read from
/// `tokio::time`, so paused-clock tests can drive redelivery.
pub struct MemoryQueue {
    name: String,
    visibility_timeout: time::Duration,
    state: Mutex<MemoryQueueState>,
    unavailable: AtomicBool,
}

impl MemoryQueue {
    pub fn new(queue_name: &str, visibility_timeout: time::Duration) -> Self {
        Self {
            name: queue_name.to_owned(),
            visibility_timeout,
            state: Mutex::new(MemoryQueueState::default()),
            unavailable: AtomicBool::new(false),
        }
    }

    /// Make every call fail with `QueueError::Unavailable` until switched back.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    pub fn status(&self, id: i64) -> Option<TaskStatus> {
        self.lock().ok()?.tasks.get(&id).map(|task| task.status)
    }

    pub fn errors(&self, id: i64) -> Vec<serde_json::Value> {
        self.lock()
            .ok()
            .and_then(|state| state.tasks.get(&id).map(|task| task.errors.clone()))
            .unwrap_or_default()
    }

    pub fn depth(&self) -> QueueResult<QueueDepth> {
        let state = self.lock()?;
        let mut depth = QueueDepth::default();
        for task in state.tasks.values() {
            match task.status {
                TaskStatus::Available => depth.available += 1,
                TaskStatus::Running => depth.running += 1,
                TaskStatus::DeadLettered => depth.dead_lettered += 1,
                TaskStatus::Completed => {}
            }
        }
        Ok(depth)
    }

    fn lock(&self) -> QueueResult<std::sync::MutexGuard<'_, MemoryQueueState>> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(QueueError::Unavailable);
        }
        self.state.lock().map_err(|_| QueueError::Unavailable)
    }

    fn finish(
        &self,
        task: &QueuedTask,
        status: TaskStatus,
        error: Option<serde_json::Value>,
        retry_after: time::Duration,
    ) -> QueueResult<()> {
        let mut state = self.lock()?;
        let stored = state
            .tasks
            .get_mut(&task.id)
            .filter(|stored| stored.lock_id == Some(task.lock_id))
            .ok_or(QueueError::LockLost { id: task.id })?;

        stored.status = status;
        stored.lock_id = None;
        stored.scheduled_at = tokio::time::Instant::now() + retry_after;
        stored.errors.extend(error);
        Ok(())
    }
}

#[async_trait]
impl WorkQueue for MemoryQueue {
    async fn enqueue(&self, tasks: Vec<NewTask>) -> QueueResult<Vec<i64>> {
        let mut state = self.lock()?;
        let now = tokio::time::Instant::now();

        let mut ids = Vec::with_capacity(tasks.len());
        for task in tasks {
            state.last_id += 1;
            let id = state.last_id;
            state.tasks.insert(
                id,
                MemoryTask {
                    status: TaskStatus::Available,
                    attempt: 0,
                    max_attempts: task.max_attempts,
                    created_at: Utc::now(),
                    scheduled_at: now,
                    attempted_at: None,
                    attempted_by: Vec::new(),
                    lock_id: None,
                    errors: Vec::new(),
                    event: task.event,
                },
            );
            ids.push(id);
        }
        Ok(ids)
    }

    async fn dequeue(&self, attempted_by: &str, limit: u32) -> QueueResult<Vec<QueuedTask>> {
        let mut state = self.lock()?;
        let now = tokio::time::Instant::now();
        let visibility_timeout = self.visibility_timeout;

        let mut due: Vec<(i32, tokio::time::Instant, i64)> = state
            .tasks
            .iter()
            .filter(|(_, task)| match task.status {
                TaskStatus::Available => task.scheduled_at <= now,
                TaskStatus::Running => task
                    .attempted_at
                    .is_some_and(|at| at + visibility_timeout <= now),
                TaskStatus::Completed | TaskStatus::DeadLettered => false,
            })
            .map(|(id, task)| (task.attempt, task.scheduled_at, *id))
            .collect();
        due.sort();
        due.truncate(usize::try_from(limit).unwrap_or(usize::MAX));

        let lock_id = Uuid::now_v7();
        let mut claimed = Vec::with_capacity(due.len());
        for (_, _, id) in due {
            let Some(task) = state.tasks.get_mut(&id) else {
                continue;
            };
            task.status = TaskStatus::Running;
            task.attempt += 1;
            task.attempted_at = Some(now);
            task.attempted_by.push(attempted_by.to_owned());
            task.lock_id = Some(lock_id);

            claimed.push(QueuedTask {
                id,
                attempt: task.attempt,
                max_attempts: task.max_attempts,
                created_at: task.created_at,
                attempted_by: task.attempted_by.clone(),
                lock_id,
                queue: self.name.clone(),
                event: task.event.clone(),
            });
        }
        Ok(claimed)
    }

    async fn ack(&self, task: QueuedTask) -> QueueResult<()> {
        self.finish(&task, TaskStatus::Completed, None, time::Duration::ZERO)
    }

    async fn nack(
        &self,
        task: QueuedTask,
        error: &str,
        retry_after: time::Duration,
    ) -> Result<(), RetryError> {
        if task.is_gte_max_attempts() {
            return Err(RetryError::from(RetryInvalidError {
                task: Box::new(task),
                error: "Maximum attempts reached".to_owned(),
            }));
        }

        let entry = error_entry(&task, error);
        self.finish(&task, TaskStatus::Available, Some(entry), retry_after)?;
        Ok(())
    }

    async fn dead_letter(&self, task: QueuedTask, error: &str) -> QueueResult<()> {
        let entry = error_entry(&task, error);
        self.finish(&task, TaskStatus::DeadLettered, Some(entry), time::Duration::ZERO)
    }
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::*;

    const VISIBILITY: time::Duration = time::Duration::from_secs(30);

    fn event(event_id: &str) -> EventRecord {
        EventRecord {
            topic: "t1".to_owned(),
            event_id: event_id.to_owned(),
            source: None,
            payload: serde_json::Map::new(),
            source_timestamp: Utc.with_ymd_and_hms(2024, 6, 1, 12, 0, 0).unwrap(),
            received_at: Utc::now(),
        }
    }

    /// Use process id as a worker id for tests.
    fn worker_id() -> String {
        std::process::id().to_string()
    }

    async fn assert_dequeue_and_ack(queue: &dyn WorkQueue) {
        let ids = queue
            .enqueue(vec![NewTask::new(3, event("e1")), NewTask::new(3, event("e2"))])
            .await
            .expect("failed to enqueue tasks");
        assert_eq!(ids.len(), 2);

        let mut tasks = queue
            .dequeue(&worker_id(), 1)
            .await
            .expect("failed to dequeue task");
        assert_eq!(tasks.len(), 1);
        let task = tasks.pop().unwrap();
        assert_eq!(task.attempt, 1);
        assert_eq!(task.max_attempts, 3);
        assert_eq!(task.attempted_by, vec![worker_id()]);
        assert_eq!(task.event.event_id, "e1");

        queue.ack(task).await.expect("failed to ack task");

        let tasks = queue
            .dequeue(&worker_id(), 10)
            .await
            .expect("failed to dequeue task");
        assert_eq!(tasks.len(), 1);
        assert_eq!(tasks[0].event.event_id, "e2");

        // Nothing left that is due.
        let tasks = queue
            .dequeue(&worker_id(), 10)
            .await
            .expect("failed to dequeue task");
        assert!(tasks.is_empty());
    }

    async fn assert_nack_redelivers(queue: &dyn WorkQueue) {
        queue
            .enqueue(vec![NewTask::new(2, event("e1"))])
            .await
            .expect("failed to enqueue task");

        let task = queue.dequeue(&worker_id(), 1).await.unwrap().pop().unwrap();
        queue
            .nack(task, "store unreachable", time::Duration::ZERO)
            .await
            .expect("failed to nack task");

        let task = queue.dequeue(&worker_id(), 1).await.unwrap().pop().unwrap();
        assert_eq!(task.attempt, 2);
        assert!(task.is_gte_max_attempts());

        // Attempts are exhausted: the task comes back so it can be dead-lettered.
        let task = match queue.nack(task, "still down", time::Duration::ZERO).await {
            Err(RetryError::RetryInvalidError(RetryInvalidError { task, .. })) => *task,
            other => panic!("expected RetryInvalidError, got {other:?}"),
        };
        queue
            .dead_letter(task, "still down")
            .await
            .expect("failed to dead-letter task");

        assert!(queue.dequeue(&worker_id(), 1).await.unwrap().is_empty());
    }

    async fn assert_stale_holder_loses_lock(queue: &dyn WorkQueue) {
        queue
            .enqueue(vec![NewTask::new(5, event("e1"))])
            .await
            .expect("failed to enqueue task");

        let stale = queue.dequeue("worker-a", 1).await.unwrap().pop().unwrap();
        let stolen = QueuedTask {
            lock_id: Uuid::now_v7(),
            ..stale.clone()
        };

        assert!(matches!(
            queue.ack(stolen).await,
            Err(QueueError::LockLost { .. })
        ));
        queue.ack(stale).await.expect("holder should still ack");
    }

    #[tokio::test]
    async fn test_memory_dequeue_and_ack() {
        assert_dequeue_and_ack(&MemoryQueue::new("test", VISIBILITY)).await;
    }

    #[tokio::test]
    async fn test_memory_nack_redelivers_until_exhausted() {
        let queue = MemoryQueue::new("test", VISIBILITY);
        assert_nack_redelivers(&queue).await;

        assert_eq!(queue.status(1), Some(TaskStatus::DeadLettered));
        assert_eq!(queue.errors(1).len(), 2);
        assert_eq!(queue.depth().unwrap().dead_lettered, 1);
    }

    #[tokio::test]
    async fn test_memory_stale_holder_loses_lock() {
        assert_stale_holder_loses_lock(&MemoryQueue::new("test", VISIBILITY)).await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_memory_nack_respects_retry_after() {
        let queue = MemoryQueue::new("test", VISIBILITY);
        queue.enqueue(vec![NewTask::new(3, event("e1"))]).await.unwrap();

        let task = queue.dequeue("w", 1).await.unwrap().pop().unwrap();
        queue
            .nack(task, "timeout", time::Duration::from_secs(5))
            .await
            .unwrap();

        assert!(queue.dequeue("w", 1).await.unwrap().is_empty());
        tokio::time::advance(time::Duration::from_secs(5)).await;
        assert_eq!(queue.dequeue("w", 1).await.unwrap().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_memory_expired_claim_is_redelivered() {
        let queue = MemoryQueue::new("test", VISIBILITY);
        queue.enqueue(vec![NewTask::new(3, event("e1"))]).await.unwrap();

        let first = queue.dequeue("worker-a", 1).await.unwrap().pop().unwrap();
        assert!(queue.dequeue("worker-b", 1).await.unwrap().is_empty());

        tokio::time::advance(VISIBILITY).await;

        let second = queue.dequeue("worker-b", 1).await.unwrap().pop().unwrap();
        assert_eq!(second.id, first.id);
        assert_eq!(second.attempt, 2);
        assert_eq!(second.attempted_by, vec!["worker-a", "worker-b"]);

        // The first holder's claim expired.
        assert!(matches!(
            queue.ack(first).await,
            Err(QueueError::LockLost { .. })
        ));
        queue.ack(second).await.unwrap();
        assert_eq!(queue.depth().unwrap(), QueueDepth::default());
    }

    #[tokio::test]
    async fn test_memory_unavailable() {
        let queue = MemoryQueue::new("test", VISIBILITY);
        queue.set_unavailable(true);

        assert!(matches!(
            queue.enqueue(vec![NewTask::new(1, event("e1"))]).await,
            Err(QueueError::Unavailable)
        ));

        queue.set_unavailable(false);
        assert!(queue.enqueue(Vec::new()).await.unwrap().is_empty());
    }

    #[sqlx::test(migrations = "../migrations")]
    #[ignore = "requires postgres"]
    async fn test_pg_dequeue_and_ack(db: PgPool) {
        assert_dequeue_and_ack(&PgQueue::new_from_pool("test_pg_dequeue_and_ack", db, VISIBILITY))
            .await;
    }

    #[sqlx::test(migrations = "../migrations")]
    #[ignore = "requires postgres"]
    async fn test_pg_nack_redelivers_until_exhausted(db: PgPool) {
        let queue = PgQueue::new_from_pool("test_pg_nack_redelivers", db, VISIBILITY);
        assert_nack_redelivers(&queue).await;

        let depth = queue.depth().await.unwrap();
        assert_eq!(depth.dead_lettered, 1);
        assert_eq!(depth.available, 0);
    }

    #[sqlx::test(migrations = "../migrations")]
    #[ignore = "requires postgres"]
    async fn test_pg_stale_holder_loses_lock(db: PgPool) {
        assert_stale_holder_loses_lock(&PgQueue::new_from_pool("test_pg_lock", db, VISIBILITY))
            .await;
    }

    #[sqlx::test(migrations = "../migrations")]
    #[ignore = "requires postgres"]
    async fn test_pg_expired_claim_is_redelivered(db: PgPool) {
        let queue = PgQueue::new_from_pool("test_pg_expired", db, time::Duration::ZERO);
        queue.enqueue(vec![NewTask::new(3, event("e1"))]).await.unwrap();

        let first = queue.dequeue("worker-a", 1).await.unwrap().pop().unwrap();
        let second = queue.dequeue("worker-b", 1).await.unwrap().pop().unwrap();
        assert_eq!(second.id, first.id);
        assert_eq!(second.attempt, 2);

        assert!(matches!(
            queue.ack(first).await,
            Err(QueueError::LockLost { .. })
        ));
        queue.ack(second).await.unwrap();
    }

    #[sqlx::test(migrations = "../migrations")]
    #[ignore = "requires postgres"]
    async fn test_pg_purge_completed(db: PgPool) {
        let queue = PgQueue::new_from_pool("test_pg_purge", db, VISIBILITY);
        queue
            .enqueue(vec![NewTask::new(3, event("e1")), NewTask::new(3, event("e2"))])
            .await
            .unwrap();

        let task = queue.dequeue("w", 1).await.unwrap().pop().unwrap();
        queue.ack(task).await.unwrap();

        assert_eq!(queue.purge_completed(time::Duration::ZERO).await.unwrap(), 1);
        assert_eq!(
            queue.depth().await.unwrap(),
            QueueDepth {
                available: 1,
                running: 0,
                dead_lettered: 0
            }
        );
    }
}
