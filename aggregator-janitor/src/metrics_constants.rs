pub const RUN_STARTS: &str = "aggregator_janitor_run_starts";
pub const RUN_TIME: &str = "aggregator_janitor_total_run_ms";
pub const RUN_ENDS: &str = "aggregator_janitor_run_ends";

pub const PURGED_COUNT: &str = "aggregator_janitor_completed_tasks_purged";

// Queue-level depth, reported on every run.
pub const AVAILABLE_DEPTH: &str = "aggregator_queue_available_tasks";
pub const RUNNING_DEPTH: &str = "aggregator_queue_running_tasks";
pub const DEAD_LETTER_DEPTH: &str = "aggregator_queue_dead_lettered_tasks";
