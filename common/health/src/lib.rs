use std::collections::HashMap;
use std::ops::Add;
use std::sync::{Arc, RwLock};

use time::{Duration, OffsetDateTime};
use tracing::{info, warn};

/// Health reporting for the long-running loops of a consumer.
///
/// A consumer runs one asynchronous loop per partition, and the process can
/// only be trusted to make progress if all of them are running and reporting.
///
/// HealthRegistry allows an arbitrary number of components to be registered
/// and report their health. The overall status combines them:
///   - if any component is unhealthy, the process is unhealthy
///   - if all live components recently reported healthy, the process is healthy
///   - if a component failed to report healthy before its deadline, it is
///     considered stalled, and the check fails
///   - components that finished their work on purpose are ignored
#[derive(Default, Debug)]
pub struct HealthStatus {
    /// The overall status: true if all live components are healthy
    pub healthy: bool,
    /// Current status of each registered component, for display
    pub components: HashMap<String, ComponentStatus>,
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub enum ComponentStatus {
    /// Automatically set when a component is newly registered
    Starting,
    /// Recently reported healthy, will need to report again before the date
    HealthyUntil(OffsetDateTime),
    /// Reported unhealthy, with the reason given by the component
    Unhealthy(String),
    /// Automatically set when the HealthyUntil deadline is reached
    Stalled,
    /// The component completed its work and stopped reporting
    Finished,
}

type Components = Arc<RwLock<HashMap<String, ComponentStatus>>>;

pub struct HealthHandle {
    component: String,
    deadline: Duration,
    components: Components,
}

impl HealthHandle {
    pub fn component(&self) -> &str {
        &self.component
    }

    /// Report healthy. Must be called more frequently than the configured deadline.
    pub fn report_healthy(&self) {
        self.report_status(ComponentStatus::HealthyUntil(
            OffsetDateTime::now_utc().add(self.deadline),
        ))
    }

    pub fn report_unhealthy(&self, reason: impl Into<String>) {
        self.report_status(ComponentStatus::Unhealthy(reason.into()))
    }

    pub fn report_finished(&self) {
        self.report_status(ComponentStatus::Finished)
    }

    pub fn report_status(&self, status: ComponentStatus) {
        match self.components.write() {
            Ok(mut map) => {
                map.insert(self.component.clone(), status);
            }
            // Poisoned lock: just warn, the probes will fail and the process restart
            Err(_) => warn!(component = %self.component, "poisoned HealthRegistry lock"),
        }
    }
}

#[derive(Clone)]
pub struct HealthRegistry {
    name: String,
    components: Components,
}

impl HealthRegistry {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_owned(),
            components: Default::default(),
        }
    }

    /// Registers a new component in the registry. The returned handle should be passed
    /// to the component, to allow it to frequently report its health status.
    /// Registering an existing name again resets it to Starting.
    pub fn register(&self, component: String, deadline: Duration) -> HealthHandle {
        let handle = HealthHandle {
            component,
            deadline,
            components: self.components.clone(),
        };
        handle.report_status(ComponentStatus::Starting);
        handle
    }

    /// Returns the overall status, computed from the status of all the components
    /// currently registered.
    pub fn get_status(&self) -> HealthStatus {
        let components = match self.components.read() {
            Ok(components) => components,
            Err(_) => {
                warn!("{} health check failed: poisoned HealthRegistry lock", self.name);
                return HealthStatus::default();
            }
        };

        let result = HealthStatus {
            healthy: !components.is_empty(), // unhealthy if no component has registered yet
            components: Default::default(),
        };
        let now = OffsetDateTime::now_utc();

        let result = components
            .iter()
            .fold(result, |mut result, (name, status)| {
                match status {
                    ComponentStatus::HealthyUntil(until) if until.gt(&now) => {
                        result.components.insert(name.clone(), status.clone());
                    }
                    ComponentStatus::HealthyUntil(_) => {
                        result.healthy = false;
                        result
                            .components
                            .insert(name.clone(), ComponentStatus::Stalled);
                    }
                    ComponentStatus::Finished => {
                        result.components.insert(name.clone(), status.clone());
                    }
                    _ => {
                        result.healthy = false;
                        result.components.insert(name.clone(), status.clone());
                    }
                }
                result
            });
        match result.healthy {
            true => info!("{} health check ok", self.name),
            false => warn!("{} health check failed: {:?}", self.name, result.components),
        }
        result
    }
}
