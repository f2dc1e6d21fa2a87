//! Job identity and static job metadata.

use serde::{Deserialize, Serialize};

use crate::data_map::JobDataMap;
use crate::error::{CoreError, CoreResult};

/// Group used when a job key is created without an explicit group.
pub const DEFAULT_GROUP: &str = "DEFAULT";

/// Name + group identifying a job within a scheduler.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct JobKey {
    name: String,
    group: String,
}

impl JobKey {
    pub fn new(name: impl Into<String>) -> CoreResult<Self> {
        Self::with_group(name, DEFAULT_GROUP)
    }

    pub fn with_group(name: impl Into<String>, group: impl Into<String>) -> CoreResult<Self> {
        let name = name.into();
        let group = group.into();
        if name.trim().is_empty() {
            return Err(CoreError::validation("job key name must not be empty"));
        }
        if group.trim().is_empty() {
            return Err(CoreError::validation("job key group must not be empty"));
        }
        Ok(Self { name, group })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn group(&self) -> &str {
        &self.group
    }
}

impl core::fmt::Display for JobKey {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{}.{}", self.group, self.name)
    }
}

/// Identifies which job implementation to instantiate for a firing.
///
/// Immutable; supplied by the engine at fire time. `requires_scope` decides
/// whether the instantiator opens a resource scope for the instance.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct JobTypeDescriptor {
    type_name: String,
    requires_scope: bool,
}

impl JobTypeDescriptor {
    /// A job type resolved without a scope.
    pub fn unscoped(type_name: impl Into<String>) -> Self {
        Self {
            type_name: type_name.into(),
            requires_scope: false,
        }
    }

    /// A job type whose instances live inside a per-firing resource scope.
    pub fn scoped(type_name: impl Into<String>) -> Self {
        Self {
            type_name: type_name.into(),
            requires_scope: true,
        }
    }

    pub fn type_name(&self) -> &str {
        &self.type_name
    }

    pub fn requires_scope(&self) -> bool {
        self.requires_scope
    }
}

impl core::fmt::Display for JobTypeDescriptor {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(&self.type_name)
    }
}

/// Static description of a job as registered with an engine.
#[derive(Debug, Clone)]
pub struct JobDetail {
    pub key: JobKey,
    pub job_type: JobTypeDescriptor,
    pub description: Option<String>,
    /// Keep the job stored even when no trigger references it.
    pub durable: bool,
    /// Re-run the job if the process died while it was executing.
    pub requests_recovery: bool,
    /// Engine-enforced: at most one concurrent firing of this key.
    pub concurrent_execution_disallowed: bool,
    pub persist_job_data_after_execution: bool,
    pub job_data: JobDataMap,
}

impl JobDetail {
    pub fn new(key: JobKey, job_type: JobTypeDescriptor) -> Self {
        Self {
            key,
            job_type,
            description: None,
            durable: false,
            requests_recovery: false,
            concurrent_execution_disallowed: false,
            persist_job_data_after_execution: false,
            job_data: JobDataMap::new(),
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn durable(mut self, durable: bool) -> Self {
        self.durable = durable;
        self
    }

    pub fn requests_recovery(mut self, requests_recovery: bool) -> Self {
        self.requests_recovery = requests_recovery;
        self
    }

    pub fn disallow_concurrent_execution(mut self, disallowed: bool) -> Self {
        self.concurrent_execution_disallowed = disallowed;
        self
    }

    pub fn persist_job_data_after_execution(mut self, persist: bool) -> Self {
        self.persist_job_data_after_execution = persist;
        self
    }

    pub fn with_job_data(mut self, job_data: JobDataMap) -> Self {
        self.job_data = job_data;
        self
    }
}
