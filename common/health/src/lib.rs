use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use tokio::time::Instant;
use tracing::{debug, warn};

/// Liveness reporting for the long-running loops of a process.
///
/// Every worker loop and maintenance loop registers itself as a component
/// and is handed a `HealthHandle`. The process is live only if:
///   - at least one component is registered,
///   - every component has reported healthy, and
///   - no component has let its deadline pass without reporting again.
///
/// A stuck worker (for example one hanging on a store call) stops reporting,
/// goes `Stalled`, and fails the check so the orchestrator restarts it.
#[derive(Default, Debug)]
pub struct HealthStatus {
    /// True if every registered component is healthy.
    pub healthy: bool,
    /// Per-component status, for display.
    pub components: HashMap<String, ComponentStatus>,
}

impl IntoResponse for HealthStatus {
    fn into_response(self) -> Response {
        let body = format!("{self:?}");
        match self.healthy {
            true => (StatusCode::OK, body),
            false => (StatusCode::INTERNAL_SERVER_ERROR, body),
        }
        .into_response()
    }
}

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum ComponentStatus {
    /// Registered, has not reported yet.
    Starting,
    /// Reported healthy; must report again before the instant.
    HealthyUntil(Instant),
    /// Reported unhealthy.
    Unhealthy,
    /// Missed its deadline.
    Stalled,
}

impl ComponentStatus {
    fn resolve(self, now: Instant) -> ComponentStatus {
        match self {
            ComponentStatus::HealthyUntil(until) if until <= now => ComponentStatus::Stalled,
            other => other,
        }
    }

    fn is_healthy(self) -> bool {
        matches!(self, ComponentStatus::HealthyUntil(_))
    }
}

type ComponentMap = Arc<RwLock<HashMap<String, ComponentStatus>>>;

#[derive(Clone)]
pub struct HealthHandle {
    component: String,
    deadline: Duration,
    components: ComponentMap,
}

impl HealthHandle {
    /// Report healthy until `now + deadline`. Must be called more often than the deadline.
    pub async fn report_healthy(&self) {
        self.report_status(ComponentStatus::HealthyUntil(Instant::now() + self.deadline))
            .await
    }

    pub async fn report_status(&self, status: ComponentStatus) {
        match self.components.write() {
            Ok(mut map) => {
                map.insert(self.component.clone(), status);
            }
            // Health checks will fail and the process gets restarted.
            Err(_) => warn!("poisoned HealthRegistry lock"),
        }
    }
}

#[derive(Clone)]
pub struct HealthRegistry {
    name: String,
    components: ComponentMap,
}

impl HealthRegistry {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_owned(),
            components: Default::default(),
        }
    }

    /// Register a component, starting in `Starting`. The returned handle is moved into the
    /// component's loop.
    pub async fn register(&self, component: String, deadline: Duration) -> HealthHandle {
        let handle = HealthHandle {
            component,
            deadline,
            components: self.components.clone(),
        };
        handle.report_status(ComponentStatus::Starting).await;
        handle
    }

    /// Overall status computed from every registered component. Usable as an axum handler.
    pub fn get_status(&self) -> HealthStatus {
        let Ok(components) = self.components.read() else {
            warn!("poisoned HealthRegistry lock");
            return HealthStatus::default();
        };

        let now = Instant::now();
        let components: HashMap<String, ComponentStatus> = components
            .iter()
            .map(|(name, status)| (name.clone(), status.resolve(now)))
            .collect();
        let healthy = !components.is_empty() && components.values().all(|s| s.is_healthy());

        if healthy {
            debug!("{} health check ok", self.name);
        } else {
            warn!("{} health check failed: {:?}", self.name, components);
        }

        HealthStatus {
            healthy,
            components,
        }
    }
}
