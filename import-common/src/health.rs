use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use chrono::{DateTime, Duration, Utc};
use tracing::warn;

/// Health reporting for the long-running loops of the service.
///
/// Each consumer loop registers a component and must report healthy more
/// frequently than its deadline; a component that stops reporting is
/// considered stalled and fails the overall check.

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ComponentStatus {
    /// Automatically set when a component is newly registered
    Starting,
    /// Recently reported healthy, will need to report again before the date
    HealthyUntil(DateTime<Utc>),
    /// Reported unhealthy
    Unhealthy,
    /// Automatically set when the HealthyUntil deadline is reached
    Stalled,
}

#[derive(Default, Debug)]
pub struct HealthStatus {
    /// The overall status: true if all components are healthy
    pub healthy: bool,
    /// Current status of each registered component, for display
    pub components: HashMap<String, ComponentStatus>,
}

impl IntoResponse for HealthStatus {
    fn into_response(self) -> Response {
        let body = format!("{:?}", self);
        match self.healthy {
            true => (StatusCode::OK, body),
            false => (StatusCode::INTERNAL_SERVER_ERROR, body),
        }
        .into_response()
    }
}

pub struct HealthHandle {
    component: String,
    deadline: Duration,
    components: Arc<RwLock<HashMap<String, ComponentStatus>>>,
}

impl HealthHandle {
    /// Must be called more frequently than the configured deadline.
    pub fn report_healthy(&self) {
        self.report_status(ComponentStatus::HealthyUntil(Utc::now() + self.deadline));
    }

    pub fn report_status(&self, status: ComponentStatus) {
        match self.components.write() {
            Ok(mut components) => {
                _ = components.insert(self.component.clone(), status);
            }
            // Poisoned lock: just warn, the probes will fail and the process restart
            Err(_) => warn!("poisoned HealthRegistry lock"),
        }
    }
}

#[derive(Clone)]
pub struct HealthRegistry {
    name: String,
    components: Arc<RwLock<HashMap<String, ComponentStatus>>>,
}

impl HealthRegistry {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_owned(),
            components: Default::default(),
        }
    }

    /// Registers a new component. The returned handle should be passed to the
    /// component, to allow it to frequently report its health status.
    pub fn register(&self, component: &str, deadline: Duration) -> HealthHandle {
        let handle = HealthHandle {
            component: component.to_owned(),
            deadline,
            components: self.components.clone(),
        };
        handle.report_status(ComponentStatus::Starting);
        handle
    }

    /// Overall process status, computed from all registered components.
    /// Can be used as an axum handler.
    pub fn get_status(&self) -> HealthStatus {
        let components = self
            .components
            .read()
            .expect("poisoned HealthRegistry lock");

        let now = Utc::now();
        // Unhealthy until at least one component has registered.
        let mut result = HealthStatus {
            healthy: !components.is_empty(),
            components: Default::default(),
        };

        for (name, status) in components.iter() {
            match status {
                ComponentStatus::HealthyUntil(until) if *until > now => {
                    _ = result.components.insert(name.clone(), status.clone());
                }
                ComponentStatus::HealthyUntil(_) => {
                    result.healthy = false;
                    _ = result
                        .components
                        .insert(name.clone(), ComponentStatus::Stalled);
                }
                _ => {
                    result.healthy = false;
                    _ = result.components.insert(name.clone(), status.clone());
                }
            }
        }

        match result.healthy {
            true => tracing::debug!("{} health check ok", self.name),
            false => warn!("{} health check failed: {:?}", self.name, result.components),
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_to_unhealthy() {
        let registry = HealthRegistry::new("liveness");
        assert!(!registry.get_status().healthy);
    }

    #[test]
    fn component_lifecycle() {
        let registry = HealthRegistry::new("liveness");
        let handle = registry.register("consumer", Duration::seconds(30));

        // New components are registered in Starting
        let status = registry.get_status();
        assert!(!status.healthy);
        assert_eq!(
            status.components.get("consumer"),
            Some(&ComponentStatus::Starting)
        );

        handle.report_healthy();
        assert!(registry.get_status().healthy);

        handle.report_status(ComponentStatus::Unhealthy);
        assert!(!registry.get_status().healthy);
    }

    #[test]
    fn stalled_component_fails_the_check() {
        let registry = HealthRegistry::new("liveness");
        let handle = registry.register("consumer", Duration::seconds(30));

        handle.report_status(ComponentStatus::HealthyUntil(
            Utc::now() - Duration::seconds(1),
        ));
        let status = registry.get_status();
        assert!(!status.healthy);
        assert_eq!(
            status.components.get("consumer"),
            Some(&ComponentStatus::Stalled)
        );
    }

    #[test]
    fn all_components_must_be_healthy() {
        let registry = HealthRegistry::new("liveness");
        let first = registry.register("chunks", Duration::seconds(30));
        let second = registry.register("journal", Duration::seconds(30));

        first.report_healthy();
        assert!(!registry.get_status().healthy);

        second.report_healthy();
        assert!(registry.get_status().healthy);

        first.report_status(ComponentStatus::Unhealthy);
        assert!(!registry.get_status().healthy);
    }
}
