use std::time;

use aggregator_common::{pgqueue::QueueError, store::StoreError};
use thiserror::Error;

/// Enumeration of errors a worker can hit while handling a task.
#[derive(Error, Debug)]
pub enum WorkerError {
    #[error("store call timed out after {0:?}")]
    StoreTimeout(time::Duration),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Queue(#[from] QueueError),
}
