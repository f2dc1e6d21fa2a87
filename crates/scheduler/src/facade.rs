//! Scheduler facade.
//!
//! Forwards the whole engine control surface unchanged. The one policy it adds
//! is whether stopping waits for in-flight firings.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::runtime::{Handle, Runtime};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use jobscope_core::{FireInstanceId, JobDataMap, JobDetail, JobKey};

use crate::engine::{EngineError, ExecutingJob, SchedulerEngine};

/// Engine wrapper with a configured shutdown policy.
#[derive(Clone)]
pub struct SchedulerFacade {
    engine: Arc<dyn SchedulerEngine>,
    wait_for_jobs_to_complete_at_shutdown: bool,
}

impl SchedulerFacade {
    pub fn new(engine: Arc<dyn SchedulerEngine>, wait_for_jobs_to_complete_at_shutdown: bool) -> Self {
        Self {
            engine,
            wait_for_jobs_to_complete_at_shutdown,
        }
    }

    pub fn engine(&self) -> &Arc<dyn SchedulerEngine> {
        &self.engine
    }

    pub fn waits_for_jobs_at_shutdown(&self) -> bool {
        self.wait_for_jobs_to_complete_at_shutdown
    }

    pub async fn start_async(&self, token: &CancellationToken) -> Result<(), EngineError> {
        self.engine.start(token).await
    }

    /// Shut the engine down, waiting for in-flight firings only when the
    /// facade was configured to.
    pub async fn stop_async(&self, token: &CancellationToken) -> Result<(), EngineError> {
        info!(
            scheduler = %self.engine.scheduler_name(),
            wait_for_jobs = self.wait_for_jobs_to_complete_at_shutdown,
            "stopping scheduler"
        );
        self.engine
            .shutdown(self.wait_for_jobs_to_complete_at_shutdown, token)
            .await
    }

    /// Blocking form of [`start_async`](Self::start_async).
    ///
    /// Must not be called from inside a tokio runtime.
    pub fn start(&self) -> Result<(), EngineError> {
        let token = CancellationToken::new();
        block_on_engine(self.start_async(&token))
    }

    /// Blocking form of [`stop_async`](Self::stop_async).
    ///
    /// Must not be called from inside a tokio runtime.
    pub fn stop(&self) -> Result<(), EngineError> {
        let token = CancellationToken::new();
        block_on_engine(self.stop_async(&token))
    }

    /// Stop the engine if it is still running. Safe to call more than once.
    pub async fn dispose_async(&self) -> Result<(), EngineError> {
        if self.engine.is_shutdown() {
            debug!(scheduler = %self.engine.scheduler_name(), "scheduler already disposed");
            return Ok(());
        }
        self.stop_async(&CancellationToken::new()).await
    }
}

/// Drive an engine future to completion on a dedicated runtime.
fn block_on_engine<F>(future: F) -> Result<(), EngineError>
where
    F: Future<Output = Result<(), EngineError>>,
{
    if Handle::try_current().is_ok() {
        return Err(EngineError::Runtime(
            "blocking scheduler call made from inside an async runtime".to_string(),
        ));
    }
    let rt = Runtime::new().map_err(|e| EngineError::Runtime(e.to_string()))?;
    rt.block_on(future)
}

impl core::fmt::Debug for SchedulerFacade {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("SchedulerFacade")
            .field("scheduler", &self.engine.scheduler_name())
            .field(
                "wait_for_jobs_to_complete_at_shutdown",
                &self.wait_for_jobs_to_complete_at_shutdown,
            )
            .finish()
    }
}

#[async_trait]
impl SchedulerEngine for SchedulerFacade {
    fn scheduler_name(&self) -> &str {
        self.engine.scheduler_name()
    }

    fn instance_id(&self) -> &str {
        self.engine.instance_id()
    }

    async fn start(&self, token: &CancellationToken) -> Result<(), EngineError> {
        self.engine.start(token).await
    }

    async fn start_delayed(
        &self,
        delay: Duration,
        token: &CancellationToken,
    ) -> Result<(), EngineError> {
        self.engine.start_delayed(delay, token).await
    }

    async fn standby(&self, token: &CancellationToken) -> Result<(), EngineError> {
        self.engine.standby(token).await
    }

    async fn shutdown(
        &self,
        wait_for_jobs: bool,
        token: &CancellationToken,
    ) -> Result<(), EngineError> {
        self.engine.shutdown(wait_for_jobs, token).await
    }

    fn is_started(&self) -> bool {
        self.engine.is_started()
    }

    fn is_shutdown(&self) -> bool {
        self.engine.is_shutdown()
    }

    fn in_standby_mode(&self) -> bool {
        self.engine.in_standby_mode()
    }

    async fn add_job(&self, detail: JobDetail, replace: bool) -> Result<(), EngineError> {
        self.engine.add_job(detail, replace).await
    }

    async fn delete_job(&self, key: &JobKey) -> Result<bool, EngineError> {
        self.engine.delete_job(key).await
    }

    async fn check_exists(&self, key: &JobKey) -> Result<bool, EngineError> {
        self.engine.check_exists(key).await
    }

    async fn job_keys(&self) -> Result<Vec<JobKey>, EngineError> {
        self.engine.job_keys().await
    }

    async fn job_detail(&self, key: &JobKey) -> Result<Option<JobDetail>, EngineError> {
        self.engine.job_detail(key).await
    }

    async fn trigger_job(
        &self,
        key: &JobKey,
        data: JobDataMap,
    ) -> Result<FireInstanceId, EngineError> {
        self.engine.trigger_job(key, data).await
    }

    async fn pause_job(&self, key: &JobKey) -> Result<(), EngineError> {
        self.engine.pause_job(key).await
    }

    async fn resume_job(&self, key: &JobKey) -> Result<(), EngineError> {
        self.engine.resume_job(key).await
    }

    async fn pause_all(&self) -> Result<(), EngineError> {
        self.engine.pause_all().await
    }

    async fn resume_all(&self) -> Result<(), EngineError> {
        self.engine.resume_all().await
    }

    async fn is_job_paused(&self, key: &JobKey) -> Result<bool, EngineError> {
        self.engine.is_job_paused(key).await
    }

    async fn interrupt(&self, key: &JobKey) -> Result<bool, EngineError> {
        self.engine.interrupt(key).await
    }

    async fn currently_executing(&self) -> Result<Vec<ExecutingJob>, EngineError> {
        self.engine.currently_executing().await
    }

    async fn clear(&self) -> Result<(), EngineError> {
        self.engine.clear().await
    }
}
