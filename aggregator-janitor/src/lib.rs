pub mod config;
pub mod handlers;
pub mod janitor;
mod metrics_constants;
