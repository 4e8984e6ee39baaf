//! Consume the event queue and persist events into the deduplicating store.
use std::future::ready;
use std::sync::Arc;
use std::time::Duration;

use axum::{routing::get, Router};
use envconfig::Envconfig;
use eyre::Result;
use health::HealthRegistry;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use aggregator_common::{
    pgqueue::PgQueue,
    stats::StatsAggregator,
    store::{EventStore, PgEventStore},
};
use aggregator_worker::config::Config;
use aggregator_worker::worker::EventWorker;
use metrics_common::{serve, setup_metrics_routes};

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

pub async fn index() -> &'static str {
    "aggregator worker"
}

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::init_from_env().expect("Invalid configuration:");
    init_tracing(config.log_json);

    let store = PgEventStore::new(
        &config.database_url,
        config.max_pg_connections,
        "aggregator-worker",
    )?;
    if config.run_migrations {
        sqlx::migrate!("../migrations").run(store.pool()).await?;
    }
    let queue = PgQueue::new_from_pool(
        config.queue_name.as_str(),
        store.pool().clone(),
        config.visibility_timeout.0,
    );

    let store: Arc<dyn EventStore> = Arc::new(store);
    // Failure counts go to the shared counters; /stats is served by the gateway.
    let stats = Arc::new(StatsAggregator::new(
        store.clone(),
        Duration::from_secs(config.throughput_window_secs),
    ));

    let liveness = HealthRegistry::new("liveness");
    let worker_liveness = liveness
        .register(
            "worker".to_string(),
            (config.poll_interval.0 * 4).max(Duration::from_secs(10)) + config.store_timeout.0,
        )
        .await;

    let worker = EventWorker::new(
        &config.worker_name,
        Arc::new(queue),
        store,
        stats,
        config.worker_settings(),
        worker_liveness,
    );

    let router = Router::new()
        .route("/", get(index))
        .route("/_readiness", get(index))
        .route("/_liveness", get(move || ready(liveness.get_status())));
    let router = setup_metrics_routes(router)?;
    let bind = config.bind();
    let http_server = tokio::spawn(async move { serve(router, &bind).await });

    info!(worker = %config.worker_name, "starting worker");

    tokio::select! {
        _ = worker.run() => {
            error!("worker loop exited");
        }
        res = http_server => {
            error!("http server exited");
            match res {
                Ok(Err(e)) => error!("server failed with: {}", e),
                Err(e) => error!("server task failed with: {}", e),
                Ok(Ok(())) => {}
            }
        }
    }

    info!("exiting");
    Ok(())
}
