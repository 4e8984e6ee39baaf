use std::time::Instant;

use health::HealthHandle;
use tracing::{error, info, warn};

use aggregator_common::pgqueue::{PgQueue, QueueResult};

use crate::config::JanitorSettings;
use crate::metrics_constants::*;

// The janitor reports its own metrics, this is mostly for testing purposes
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct CleanupResult {
    pub purged: u64,
    pub available: i64,
    pub running: i64,
    pub dead_lettered: i64,
}

pub struct Janitor {
    queue: PgQueue,
    settings: JanitorSettings,
}

impl Janitor {
    pub fn new(queue: PgQueue, settings: JanitorSettings) -> Self {
        Self { queue, settings }
    }

    /// Purge acknowledged tasks past retention, then report queue depth. Dead-lettered tasks are
    /// left for an operator to inspect and are only counted.
    pub async fn run_once(&self) -> QueueResult<CleanupResult> {
        info!(queue = self.queue.name(), "running janitor loop");
        let start = Instant::now();
        let labels = &self.settings.metrics_labels;
        metrics_common::inc(RUN_STARTS, labels, 1);

        let purged = self
            .queue
            .purge_completed(self.settings.completed_retention)
            .await?;
        metrics_common::inc(PURGED_COUNT, labels, purged);

        let depth = self.queue.depth().await?;
        metrics_common::gauge(AVAILABLE_DEPTH, labels, depth.available as f64);
        metrics_common::gauge(RUNNING_DEPTH, labels, depth.running as f64);
        metrics_common::gauge(DEAD_LETTER_DEPTH, labels, depth.dead_lettered as f64);

        if depth.dead_lettered > 0 {
            warn!(
                queue = self.queue.name(),
                "{} tasks are dead-lettered", depth.dead_lettered
            );
        }

        metrics_common::histogram(RUN_TIME, labels, start.elapsed().as_millis() as f64);
        metrics_common::inc(RUN_ENDS, labels, 1);
        info!(purged, "janitor loop complete");

        Ok(CleanupResult {
            purged,
            available: depth.available,
            running: depth.running,
            dead_lettered: depth.dead_lettered,
        })
    }

    /// One cleanup pass. Liveness is only reported when the pass succeeded, so a janitor that
    /// keeps failing ages out of the health registry.
    pub async fn run_and_report(&self, liveness: &HealthHandle) -> QueueResult<CleanupResult> {
        let result = self.run_once().await;
        match &result {
            Ok(_) => liveness.report_healthy().await,
            Err(e) => error!("janitor failed cleanup with: {}", e),
        }
        result
    }
}
