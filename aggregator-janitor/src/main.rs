use std::time::Duration;

use envconfig::Envconfig;
use eyre::Result;
use health::{HealthHandle, HealthRegistry};
use tracing::{debug, error, info};
use tracing_subscriber::EnvFilter;

use aggregator_common::pgqueue::PgQueue;
use aggregator_janitor::{config::Config, handlers::app, janitor::Janitor};
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

async fn cleanup_loop(janitor: Janitor, liveness: HealthHandle, period: Duration) {
    let mut interval = tokio::time::interval(period);

    loop {
        interval.tick().await;
        if let Ok(result) = janitor.run_and_report(&liveness).await {
            debug!(?result, "reported healthy");
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::init_from_env().expect("failed to load configuration from env");
    init_tracing(config.log_json);

    // The janitor never claims tasks, so the visibility timeout does not matter here.
    let queue = PgQueue::new(
        config.queue_name.as_str(),
        &config.database_url,
        config.max_pg_connections,
        "aggregator-janitor",
        Duration::from_secs(30),
    )?;
    let janitor = Janitor::new(queue, config.janitor_settings());

    let liveness = HealthRegistry::new("liveness");
    let janitor_liveness = liveness
        .register("janitor".to_string(), config.cleanup_interval() * 4)
        .await;

    let janitor_loop = tokio::spawn(cleanup_loop(
        janitor,
        janitor_liveness,
        config.cleanup_interval(),
    ));

    let app = setup_metrics_routes(app(liveness))?;
    let bind = config.bind();
    let http_server = tokio::spawn(async move { serve(app, &bind).await });

    info!(queue = config.queue_name.as_str(), "starting janitor");

    tokio::select! {
        res = janitor_loop => {
            error!("janitor loop exited");
            if let Err(e) = res {
                error!("janitor failed with: {}", e)
            }
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
