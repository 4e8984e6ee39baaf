pub mod config;
pub mod event;
pub mod pgqueue;
pub mod retry;
pub mod stats;
pub mod store;
