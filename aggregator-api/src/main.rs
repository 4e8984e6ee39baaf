use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use envconfig::Envconfig;
use eyre::Result;
use health::HealthRegistry;
use tokio::task::JoinSet;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use aggregator_api::config::Config;
use aggregator_api::handlers::{self, AppState};
use aggregator_common::{
    pgqueue::{PgQueue, WorkQueue},
    stats::StatsAggregator,
    store::{EventStore, PgEventStore},
};
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

/// Feed the throughput window once a second, whether or not /stats is being polled.
async fn sample_stats(stats: Arc<StatsAggregator>, store_timeout: Duration) {
    let mut interval = tokio::time::interval(Duration::from_secs(1));
    loop {
        interval.tick().await;
        match tokio::time::timeout(store_timeout, stats.sample()).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!("failed to sample stats: {}", e),
            Err(_) => warn!("timed out sampling stats"),
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::init_from_env().expect("failed to load configuration from env");
    init_tracing(config.log_json);

    let store = PgEventStore::new(
        &config.database_url,
        config.max_pg_connections,
        "aggregator-api",
    )?;
    if config.run_migrations {
        sqlx::migrate!("../migrations").run(store.pool()).await?;
    }
    let queue: Arc<dyn WorkQueue> = Arc::new(PgQueue::new_from_pool(
        config.queue_name.as_str(),
        store.pool().clone(),
        config.visibility_timeout.0,
    ));
    let store: Arc<dyn EventStore> = Arc::new(store);

    let stats = Arc::new(StatsAggregator::new(
        store.clone(),
        Duration::from_secs(config.throughput_window_secs),
    ));
    tokio::spawn(sample_stats(stats.clone(), config.store_timeout.0));

    let mut workers = JoinSet::new();
    let liveness = if config.embedded_workers > 0 {
        let liveness = HealthRegistry::new("liveness");
        let deadline = (config.poll_interval.0 * 4).max(Duration::from_secs(10))
            + config.store_timeout.0;

        for i in 0..config.embedded_workers {
            let name = format!("worker-{}", i);
            let handle = liveness.register(name.clone(), deadline).await;
            let worker = EventWorker::new(
                &name,
                queue.clone(),
                store.clone(),
                stats.clone(),
                config.worker_settings(),
                handle,
            );
            workers.spawn(async move { worker.run().await });
        }
        info!("started {} embedded workers", config.embedded_workers);
        Some(liveness)
    } else {
        None
    };

    let state = AppState {
        queue,
        store,
        stats,
        settings: config.publish_settings(),
    };
    let app = handlers::add_routes(
        Router::new(),
        state,
        liveness,
        config.max_body_size,
        config.concurrency_limit,
    );
    let app = if config.export_prometheus {
        setup_metrics_routes(app)?
    } else {
        app
    };

    let bind = config.bind();
    info!("listening on {}", bind);

    tokio::select! {
        res = serve(app, &bind) => {
            if let Err(e) = res {
                error!("failed to start aggregator-api http server, {}", e);
            }
        }
        Some(res) = workers.join_next(), if !workers.is_empty() => {
            error!("embedded worker exited");
            if let Err(e) = res {
                error!("worker task failed with: {}", e);
            }
        }
    }

    info!("exiting");
    Ok(())
}
