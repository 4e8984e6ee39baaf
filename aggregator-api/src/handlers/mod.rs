mod app;
mod events;
mod publish;
mod stats;

pub use app::{add_routes, index, AppState, PublishSettings};
pub use publish::{ItemError, ItemErrorKind, PublishResponse};
