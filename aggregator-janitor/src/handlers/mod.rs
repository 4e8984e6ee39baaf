mod app;

pub use app::{app, index};
