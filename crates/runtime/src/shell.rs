//! Per-firing run shell: instantiate, run, release.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, info_span};

use jobscope_core::{FireInstanceId, JobDataMap, JobDetail};

use crate::instantiator::{InstantiationError, JobFactory, JobInstance};
use crate::job::JobRunContext;
use crate::pipeline::{ExecutionPipeline, ExecutionReport};

/// Everything the engine knows about one trigger firing.
#[derive(Debug, Clone)]
pub struct TriggerFiredBundle {
    pub detail: JobDetail,
    pub scheduler_name: String,
    /// Trigger-level parameters; merged over the job's own data.
    pub trigger_data: JobDataMap,
    pub fire_instance_id: FireInstanceId,
    pub cancellation: CancellationToken,
    pub refire_count: u32,
}

impl TriggerFiredBundle {
    pub fn new(detail: JobDetail, scheduler_name: impl Into<String>) -> Self {
        Self {
            detail,
            scheduler_name: scheduler_name.into(),
            trigger_data: JobDataMap::new(),
            fire_instance_id: FireInstanceId::new(),
            cancellation: CancellationToken::new(),
            refire_count: 0,
        }
    }

    pub fn with_trigger_data(mut self, trigger_data: JobDataMap) -> Self {
        self.trigger_data = trigger_data;
        self
    }

    /// Refires of one firing share its fire instance id.
    pub fn with_fire_instance_id(mut self, fire_instance_id: FireInstanceId) -> Self {
        self.fire_instance_id = fire_instance_id;
        self
    }

    pub fn with_cancellation(mut self, cancellation: CancellationToken) -> Self {
        self.cancellation = cancellation;
        self
    }

    pub fn with_refire_count(mut self, refire_count: u32) -> Self {
        self.refire_count = refire_count;
        self
    }
}

/// Gives the instance back to the factory exactly once, on every exit path:
/// normal return, panic unwinding, or the firing future being dropped.
struct ReleaseGuard {
    factory: Arc<dyn JobFactory>,
    instance: Option<JobInstance>,
}

impl ReleaseGuard {
    fn release(mut self) {
        if let Some(instance) = self.instance.take() {
            self.factory.return_job(instance);
        }
    }
}

impl Drop for ReleaseGuard {
    fn drop(&mut self) {
        if let Some(instance) = self.instance.take() {
            debug!(job_instance = %instance.id(), "releasing job instance on abnormal exit");
            self.factory.return_job(instance);
        }
    }
}

/// Runs single firings against a job factory.
#[derive(Clone)]
pub struct JobRunShell {
    factory: Arc<dyn JobFactory>,
    pipeline: ExecutionPipeline,
}

impl JobRunShell {
    pub fn new(factory: Arc<dyn JobFactory>) -> Self {
        Self {
            factory,
            pipeline: ExecutionPipeline::new(),
        }
    }

    /// Run one firing end to end.
    ///
    /// Instantiation errors are returned without running any job code. Once
    /// an instance exists it is always released, whatever the outcome.
    pub async fn fire(
        &self,
        bundle: TriggerFiredBundle,
    ) -> Result<ExecutionReport, InstantiationError> {
        let span = info_span!(
            "job_firing",
            job = %bundle.detail.key,
            fire_instance = %bundle.fire_instance_id,
            scheduler = %bundle.scheduler_name,
        );
        self.fire_inner(bundle).instrument(span).await
    }

    async fn fire_inner(
        &self,
        bundle: TriggerFiredBundle,
    ) -> Result<ExecutionReport, InstantiationError> {
        let TriggerFiredBundle {
            detail,
            scheduler_name,
            trigger_data,
            fire_instance_id,
            cancellation,
            refire_count,
        } = bundle;

        let instance = self.factory.new_job(&detail, &scheduler_name)?;
        let job = instance.job().clone();
        let ctx = JobRunContext::new(
            detail.clone(),
            scheduler_name,
            detail.job_data.merged_with(&trigger_data),
            cancellation,
        )
        .with_fire_instance_id(fire_instance_id)
        .with_job_instance_id(instance.id())
        .with_scope(instance.scope().cloned())
        .with_refire_count(refire_count);

        let guard = ReleaseGuard {
            factory: self.factory.clone(),
            instance: Some(instance),
        };

        let report = self.pipeline.run(job.as_ref(), &ctx).await;

        drop(ctx);
        drop(job);
        guard.release();
        Ok(report)
    }
}

impl core::fmt::Debug for JobRunShell {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("JobRunShell").finish_non_exhaustive()
    }
}
