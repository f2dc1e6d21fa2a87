//! Scheduling engine boundary.
//!
//! [`SchedulerEngine`] is the control surface of one scheduler instance:
//! lifecycle, job store administration and firing control. The facade and the
//! startup coordinator only ever talk to an engine through this trait.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio_util::sync::CancellationToken;

use jobscope_core::{FireInstanceId, JobDataMap, JobDetail, JobKey};
use jobscope_runtime::JobFactory;

use crate::config::{ConfigError, SchedulerProperties};

/// Engine error.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("scheduler '{0}' has been shut down")]
    Shutdown(String),
    #[error("scheduler '{0}' is not started")]
    NotStarted(String),
    #[error("job already exists: {0}")]
    JobAlreadyExists(JobKey),
    #[error("job not found: {0}")]
    JobNotFound(JobKey),
    #[error("job is paused: {0}")]
    JobPaused(JobKey),
    #[error("operation cancelled")]
    Cancelled,
    #[error("runtime error: {0}")]
    Runtime(String),
    #[error(transparent)]
    Config(#[from] ConfigError),
}

/// A firing currently in flight.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ExecutingJob {
    pub key: JobKey,
    pub fire_instance_id: FireInstanceId,
    pub fired_at: DateTime<Utc>,
    pub refire_count: u32,
}

/// Control surface of one scheduler instance.
#[async_trait]
pub trait SchedulerEngine: Send + Sync {
    fn scheduler_name(&self) -> &str;

    fn instance_id(&self) -> &str;

    async fn start(&self, token: &CancellationToken) -> Result<(), EngineError>;

    async fn start_delayed(
        &self,
        delay: Duration,
        token: &CancellationToken,
    ) -> Result<(), EngineError>;

    /// Stop firing new triggers; in-flight firings continue.
    async fn standby(&self, token: &CancellationToken) -> Result<(), EngineError>;

    /// Shut down for good. With `wait_for_jobs`, returns only once every
    /// in-flight firing has finished.
    async fn shutdown(&self, wait_for_jobs: bool, token: &CancellationToken)
    -> Result<(), EngineError>;

    fn is_started(&self) -> bool;

    fn is_shutdown(&self) -> bool;

    fn in_standby_mode(&self) -> bool;

    async fn add_job(&self, detail: JobDetail, replace: bool) -> Result<(), EngineError>;

    async fn delete_job(&self, key: &JobKey) -> Result<bool, EngineError>;

    async fn check_exists(&self, key: &JobKey) -> Result<bool, EngineError>;

    async fn job_keys(&self) -> Result<Vec<JobKey>, EngineError>;

    async fn job_detail(&self, key: &JobKey) -> Result<Option<JobDetail>, EngineError>;

    /// Fire a stored job now, with `data` merged over the job's own data.
    async fn trigger_job(&self, key: &JobKey, data: JobDataMap)
    -> Result<FireInstanceId, EngineError>;

    async fn pause_job(&self, key: &JobKey) -> Result<(), EngineError>;

    async fn resume_job(&self, key: &JobKey) -> Result<(), EngineError>;

    async fn pause_all(&self) -> Result<(), EngineError>;

    async fn resume_all(&self) -> Result<(), EngineError>;

    async fn is_job_paused(&self, key: &JobKey) -> Result<bool, EngineError>;

    /// Signal cancellation to every in-flight firing of `key`.
    async fn interrupt(&self, key: &JobKey) -> Result<bool, EngineError>;

    async fn currently_executing(&self) -> Result<Vec<ExecutingJob>, EngineError>;

    /// Remove every stored job.
    async fn clear(&self) -> Result<(), EngineError>;
}

#[async_trait]
impl<T: SchedulerEngine + ?Sized> SchedulerEngine for Arc<T> {
    fn scheduler_name(&self) -> &str {
        (**self).scheduler_name()
    }

    fn instance_id(&self) -> &str {
        (**self).instance_id()
    }

    async fn start(&self, token: &CancellationToken) -> Result<(), EngineError> {
        (**self).start(token).await
    }

    async fn start_delayed(
        &self,
        delay: Duration,
        token: &CancellationToken,
    ) -> Result<(), EngineError> {
        (**self).start_delayed(delay, token).await
    }

    async fn standby(&self, token: &CancellationToken) -> Result<(), EngineError> {
        (**self).standby(token).await
    }

    async fn shutdown(
        &self,
        wait_for_jobs: bool,
        token: &CancellationToken,
    ) -> Result<(), EngineError> {
        (**self).shutdown(wait_for_jobs, token).await
    }

    fn is_started(&self) -> bool {
        (**self).is_started()
    }

    fn is_shutdown(&self) -> bool {
        (**self).is_shutdown()
    }

    fn in_standby_mode(&self) -> bool {
        (**self).in_standby_mode()
    }

    async fn add_job(&self, detail: JobDetail, replace: bool) -> Result<(), EngineError> {
        (**self).add_job(detail, replace).await
    }

    async fn delete_job(&self, key: &JobKey) -> Result<bool, EngineError> {
        (**self).delete_job(key).await
    }

    async fn check_exists(&self, key: &JobKey) -> Result<bool, EngineError> {
        (**self).check_exists(key).await
    }

    async fn job_keys(&self) -> Result<Vec<JobKey>, EngineError> {
        (**self).job_keys().await
    }

    async fn job_detail(&self, key: &JobKey) -> Result<Option<JobDetail>, EngineError> {
        (**self).job_detail(key).await
    }

    async fn trigger_job(
        &self,
        key: &JobKey,
        data: JobDataMap,
    ) -> Result<FireInstanceId, EngineError> {
        (**self).trigger_job(key, data).await
    }

    async fn pause_job(&self, key: &JobKey) -> Result<(), EngineError> {
        (**self).pause_job(key).await
    }

    async fn resume_job(&self, key: &JobKey) -> Result<(), EngineError> {
        (**self).resume_job(key).await
    }

    async fn pause_all(&self) -> Result<(), EngineError> {
        (**self).pause_all().await
    }

    async fn resume_all(&self) -> Result<(), EngineError> {
        (**self).resume_all().await
    }

    async fn is_job_paused(&self, key: &JobKey) -> Result<bool, EngineError> {
        (**self).is_job_paused(key).await
    }

    async fn interrupt(&self, key: &JobKey) -> Result<bool, EngineError> {
        (**self).interrupt(key).await
    }

    async fn currently_executing(&self) -> Result<Vec<ExecutingJob>, EngineError> {
        (**self).currently_executing().await
    }

    async fn clear(&self) -> Result<(), EngineError> {
        (**self).clear().await
    }
}

/// Creates engines from validated properties.
pub trait EngineFactory: Send + Sync {
    fn create(
        &self,
        properties: &SchedulerProperties,
        job_factory: Arc<dyn JobFactory>,
    ) -> Result<Arc<dyn SchedulerEngine>, EngineError>;
}
