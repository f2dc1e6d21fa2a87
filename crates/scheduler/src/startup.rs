//! Named scheduler registry and startup sequencing.

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};

use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::config::ConfigError;
use crate::engine::SchedulerEngine;
use crate::facade::SchedulerFacade;

/// Scheduler facades by instance name.
#[derive(Debug, Default)]
pub struct SchedulerRegistry {
    schedulers: RwLock<HashMap<String, Arc<SchedulerFacade>>>,
}

impl SchedulerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a facade under its scheduler name.
    pub fn register(&self, facade: Arc<SchedulerFacade>) -> Result<(), ConfigError> {
        let name = facade.scheduler_name().to_string();
        let mut schedulers = self.schedulers.write().unwrap_or_else(PoisonError::into_inner);
        if schedulers.contains_key(&name) {
            return Err(ConfigError::DuplicateInstanceName(name));
        }
        schedulers.insert(name, facade);
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<Arc<SchedulerFacade>> {
        self.schedulers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
            .cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.schedulers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(name)
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .schedulers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect();
        names.sort();
        names
    }
}

/// What happened to each requested scheduler.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct StartupReport {
    pub started: Vec<String>,
    /// Requested but not registered.
    pub skipped: Vec<String>,
    pub failed: Vec<String>,
}

impl StartupReport {
    pub fn all_started(&self) -> bool {
        self.skipped.is_empty() && self.failed.is_empty()
    }
}

/// Starts an ordered list of schedulers.
///
/// A missing or failing scheduler does not stop the others from starting.
#[derive(Debug, Clone)]
pub struct SchedulerStartupCoordinator {
    registry: Arc<SchedulerRegistry>,
    names: Vec<String>,
}

impl SchedulerStartupCoordinator {
    pub fn new(registry: Arc<SchedulerRegistry>, names: Vec<String>) -> Self {
        Self { registry, names }
    }

    pub fn names(&self) -> &[String] {
        &self.names
    }

    pub async fn start_schedulers(&self, token: &CancellationToken) -> StartupReport {
        let mut report = StartupReport::default();

        for name in &self.names {
            if token.is_cancelled() {
                warn!(scheduler = %name, "scheduler startup cancelled");
                break;
            }

            let Some(facade) = self.registry.get(name) else {
                warn!(
                    scheduler = %name,
                    "Requested to start scheduler '{name}' but it was not registered"
                );
                report.skipped.push(name.clone());
                continue;
            };

            match facade.start_async(token).await {
                Ok(()) => {
                    info!(scheduler = %name, "scheduler started by startup coordinator");
                    report.started.push(name.clone());
                }
                Err(e) => {
                    error!(scheduler = %name, error = %e, "scheduler failed to start");
                    report.failed.push(name.clone());
                }
            }
        }

        report
    }
}
