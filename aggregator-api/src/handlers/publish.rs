use std::time::Instant;

use axum::{body::Bytes, extract::State, http::StatusCode, Json};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, error, warn};

use aggregator_common::{
    event::validate,
    pgqueue::{NewTask, QueueError},
};

use super::AppState;
use crate::error::ApiError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ItemErrorKind {
    /// Malformed item. Resubmitting it unchanged will fail again.
    Validation,
    /// The queue could not take the item. Safe to resubmit.
    Unavailable,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ItemError {
    /// Position of the item in the submitted batch; 0 for a single object.
    pub index: usize,
    pub kind: ItemErrorKind,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublishResponse {
    /// `queued` if anything was queued, else `rejected` or `unavailable`.
    pub status: String,
    pub count: usize,
    pub accepted_count: usize,
    pub rejected_count: usize,
    pub unavailable_count: usize,
    pub errors: Vec<ItemError>,
}

/// Accept one event or a batch. Every item is validated on its own; the valid ones are handed to
/// the queue in a single batch. Nothing here touches the store.
pub async fn publish(
    State(state): State<AppState>,
    body: Bytes,
) -> Result<(StatusCode, Json<PublishResponse>), ApiError> {
    let items = match serde_json::from_slice::<Value>(&body)? {
        Value::Array(items) => items,
        item @ Value::Object(_) => vec![item],
        _ => return Err(ApiError::InvalidBody),
    };
    if items.is_empty() {
        return Err(ApiError::EmptyBatch);
    }
    if items.len() > state.settings.max_batch_size {
        return Err(ApiError::BatchTooLarge {
            size: items.len(),
            max: state.settings.max_batch_size,
        });
    }
    debug!("received {} events", items.len());

    let received_at = Utc::now();
    let mut errors = Vec::new();
    let mut tasks = Vec::with_capacity(items.len());
    let mut task_indices = Vec::with_capacity(items.len());

    for (index, item) in items.into_iter().enumerate() {
        match validate(item, received_at) {
            Ok(event) => {
                tasks.push(NewTask::new(state.settings.max_attempts, event));
                task_indices.push(index);
            }
            Err(error) => errors.push(ItemError {
                index,
                kind: ItemErrorKind::Validation,
                message: error.to_string(),
            }),
        }
    }
    let rejected_count = errors.len();

    let mut accepted_count = 0;
    let mut unavailable_count = 0;
    if !tasks.is_empty() {
        let topics: Vec<String> = tasks.iter().map(|task| task.event.topic.clone()).collect();
        let start_time = Instant::now();
        match enqueue_with_retry(&state, tasks).await {
            Ok(ids) => {
                accepted_count = ids.len();
                record_received(&state, topics);
            }
            Err(error) => {
                error!("failed to enqueue {} events: {}", task_indices.len(), error);
                unavailable_count = task_indices.len();
                errors.extend(task_indices.into_iter().map(|index| ItemError {
                    index,
                    kind: ItemErrorKind::Unavailable,
                    message: error.to_string(),
                }));
                errors.sort_by_key(|error| error.index);
            }
        }
        metrics::histogram!("aggregator_api_enqueue_duration_seconds")
            .record(start_time.elapsed().as_secs_f64());
    }

    metrics::counter!("aggregator_api_items_total", "outcome" => "queued")
        .increment(accepted_count as u64);
    metrics::counter!("aggregator_api_items_total", "outcome" => "rejected")
        .increment(rejected_count as u64);
    metrics::counter!("aggregator_api_items_total", "outcome" => "unavailable")
        .increment(unavailable_count as u64);

    let (status_code, status) = if accepted_count > 0 {
        (StatusCode::OK, "queued")
    } else if unavailable_count > 0 {
        (StatusCode::SERVICE_UNAVAILABLE, "unavailable")
    } else {
        (StatusCode::UNPROCESSABLE_ENTITY, "rejected")
    };

    Ok((
        status_code,
        Json(PublishResponse {
            status: status.to_owned(),
            count: accepted_count,
            accepted_count,
            rejected_count,
            unavailable_count,
            errors,
        }),
    ))
}

/// Count queued events in the background, so the response never waits on the store.
fn record_received(state: &AppState, topics: Vec<String>) {
    let stats = state.stats.clone();
    let store_timeout = state.settings.store_timeout;

    tokio::spawn(async move {
        let received = stats.record_received(topics.iter().map(String::as_str));
        match tokio::time::timeout(store_timeout, received).await {
            Ok(Ok(())) => {}
            Ok(Err(error)) => warn!("failed to count {} received events: {}", topics.len(), error),
            Err(_) => warn!("timed out counting {} received events", topics.len()),
        }
    });
}

async fn enqueue_with_retry(
    state: &AppState,
    tasks: Vec<NewTask>,
) -> Result<Vec<i64>, QueueError> {
    let settings = &state.settings;
    let mut attempt = 1;

    loop {
        match state.queue.enqueue(tasks.clone()).await {
            Ok(ids) => return Ok(ids),
            Err(error) if attempt < settings.enqueue_attempts => {
                let wait = settings.enqueue_retry_policy.retry_interval(attempt);
                warn!(attempt, "enqueue failed, retrying in {:?}: {}", wait, error);
                tokio::time::sleep(wait).await;
                attempt += 1;
            }
            Err(error) => return Err(error),
        }
    }
}
