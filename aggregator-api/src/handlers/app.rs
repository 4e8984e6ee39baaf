use std::convert::Infallible;
use std::future::ready;
use std::sync::Arc;
use std::time;

use axum::{extract::DefaultBodyLimit, routing, Router};
use health::HealthRegistry;
use tower::limit::ConcurrencyLimitLayer;
use tower_http::trace::TraceLayer;

use aggregator_common::{
    pgqueue::WorkQueue, retry::RetryPolicy, stats::StatsAggregator, store::EventStore,
};

use super::{events, publish, stats};

#[derive(Clone, Debug)]
pub struct PublishSettings {
    /// Deliveries allowed per event before it is dead-lettered.
    pub max_attempts: i32,
    pub max_batch_size: usize,
    /// Tries at handing a batch to the queue before reporting its items unavailable.
    pub enqueue_attempts: u32,
    pub enqueue_retry_policy: RetryPolicy,
    /// Bound on store reads behind `/events` and `/stats`.
    pub store_timeout: time::Duration,
}

impl Default for PublishSettings {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            max_batch_size: 1000,
            enqueue_attempts: 3,
            enqueue_retry_policy: RetryPolicy::build(2, time::Duration::from_millis(50))
                .maximum_interval(time::Duration::from_secs(1))
                .provide(),
            store_timeout: time::Duration::from_secs(5),
        }
    }
}

#[derive(Clone)]
pub struct AppState {
    pub queue: Arc<dyn WorkQueue>,
    pub store: Arc<dyn EventStore>,
    pub stats: Arc<StatsAggregator>,
    pub settings: PublishSettings,
}

/// Mount the gateway routes. `liveness` is the registry of the embedded workers, if any; without
/// it the liveness check only confirms that axum answers.
pub fn add_routes(
    router: Router,
    state: AppState,
    liveness: Option<HealthRegistry>,
    max_body_size: usize,
    concurrency_limit: usize,
) -> Router {
    let router = router
        .route("/", routing::get(index))
        .route("/_readiness", routing::get(index));

    let router = match liveness {
        Some(liveness) => router.route(
            "/_liveness",
            routing::get(move || ready(liveness.get_status())),
        ),
        None => router.route("/_liveness", routing::get(index)),
    };

    router
        .route(
            "/publish",
            routing::post(publish::publish)
                .with_state(state.clone())
                .layer::<_, Infallible>(ConcurrencyLimitLayer::new(concurrency_limit))
                .layer(DefaultBodyLimit::max(max_body_size)),
        )
        .route(
            "/events",
            routing::get(events::list_events).with_state(state.clone()),
        )
        .route("/stats", routing::get(stats::get_stats).with_state(state))
        .layer(TraceLayer::new_for_http())
}

pub async fn index() -> &'static str {
    "log aggregator"
}
