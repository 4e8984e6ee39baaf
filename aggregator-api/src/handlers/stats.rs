use axum::{extract::State, Json};

use aggregator_common::stats::StatsSnapshot;

use super::AppState;
use crate::error::ApiError;

/// Counters are read from the store, so the snapshot covers every gateway and worker process.
/// An unreachable store is a 503 rather than a stale answer.
pub async fn get_stats(State(state): State<AppState>) -> Result<Json<StatsSnapshot>, ApiError> {
    match tokio::time::timeout(state.settings.store_timeout, state.stats.snapshot()).await {
        Ok(Ok(snapshot)) => Ok(Json(snapshot)),
        Ok(Err(error)) => Err(ApiError::StoreUnavailable(error.to_string())),
        Err(_) => Err(ApiError::StoreUnavailable(format!(
            "stats query timed out after {:?}",
            state.settings.store_timeout
        ))),
    }
}
