use axum::{
    extract::{Query, State},
    Json,
};
use serde::Deserialize;

use aggregator_common::store::{EventQuery, StoredEvent};

use super::AppState;
use crate::error::ApiError;

#[derive(Debug, Default, Deserialize)]
pub struct EventsParams {
    pub topic: Option<String>,
    pub limit: Option<i64>,
}

/// Stored events, newest source timestamp first. Fails as a whole when the store does not
/// answer in time; partial results are never returned.
pub async fn list_events(
    State(state): State<AppState>,
    Query(params): Query<EventsParams>,
) -> Result<Json<Vec<StoredEvent>>, ApiError> {
    let query = EventQuery::new(params.topic, params.limit);

    match tokio::time::timeout(state.settings.store_timeout, state.store.query(&query)).await {
        Ok(Ok(events)) => Ok(Json(events)),
        Ok(Err(error)) => Err(ApiError::StoreUnavailable(error.to_string())),
        Err(_) => Err(ApiError::StoreUnavailable(format!(
            "store query timed out after {:?}",
            state.settings.store_timeout
        ))),
    }
}
