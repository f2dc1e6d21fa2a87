//! The job contract and the per-firing run context.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use jobscope_core::{FireInstanceId, JobDataMap, JobDetail, JobInstanceId, JobKey};

use crate::classifier::{FailureDirectives, FailureDisposition, classify_failure};
use crate::scope::{Disposable, ScopeHandle};

/// A unit of work run by the execution pipeline.
///
/// Only [`execute`](Job::execute) is required. The two hooks around it do
/// nothing by default. Phases run sequentially on one task; cancellation is
/// observed between phases only, so a long phase that wants to stop early
/// must watch [`JobRunContext::cancellation_token`] itself.
#[async_trait]
pub trait Job: Send + Sync {
    async fn pre_execute(&self, _ctx: &JobRunContext) -> anyhow::Result<()> {
        Ok(())
    }

    async fn execute(&self, ctx: &JobRunContext) -> anyhow::Result<()>;

    async fn post_execute(&self, _ctx: &JobRunContext) -> anyhow::Result<()> {
        Ok(())
    }

    /// Directives applied when a phase error has to be wrapped.
    fn failure_directives(&self) -> FailureDirectives {
        FailureDirectives::NONE
    }

    /// Decide what to do with a phase error.
    ///
    /// Override to suppress selected errors; the default wraps and propagates.
    fn on_failure(&self, ctx: &JobRunContext, error: anyhow::Error) -> FailureDisposition {
        FailureDisposition::Propagate(classify_failure(
            error,
            self.failure_directives(),
            ctx.job_key(),
        ))
    }
}

#[async_trait]
impl<T: Job + ?Sized> Job for Arc<T> {
    async fn pre_execute(&self, ctx: &JobRunContext) -> anyhow::Result<()> {
        (**self).pre_execute(ctx).await
    }

    async fn execute(&self, ctx: &JobRunContext) -> anyhow::Result<()> {
        (**self).execute(ctx).await
    }

    async fn post_execute(&self, ctx: &JobRunContext) -> anyhow::Result<()> {
        (**self).post_execute(ctx).await
    }

    fn failure_directives(&self) -> FailureDirectives {
        (**self).failure_directives()
    }

    fn on_failure(&self, ctx: &JobRunContext, error: anyhow::Error) -> FailureDisposition {
        (**self).on_failure(ctx, error)
    }
}

/// Everything a job sees about the firing it runs in.
///
/// Immutable except for the cancellation signal. The scope, when present, is
/// the one the instance was resolved in; jobs register further per-firing
/// resources into it through [`register`](JobRunContext::register).
#[derive(Debug, Clone)]
pub struct JobRunContext {
    fire_instance_id: FireInstanceId,
    job_instance_id: Option<JobInstanceId>,
    detail: JobDetail,
    scheduler_name: String,
    job_data: JobDataMap,
    cancellation: CancellationToken,
    started: Instant,
    refire_count: u32,
    scope: Option<ScopeHandle>,
}

impl JobRunContext {
    pub fn new(
        detail: JobDetail,
        scheduler_name: impl Into<String>,
        job_data: JobDataMap,
        cancellation: CancellationToken,
    ) -> Self {
        Self {
            fire_instance_id: FireInstanceId::new(),
            job_instance_id: None,
            detail,
            scheduler_name: scheduler_name.into(),
            job_data,
            cancellation,
            started: Instant::now(),
            refire_count: 0,
            scope: None,
        }
    }

    pub fn with_fire_instance_id(mut self, id: FireInstanceId) -> Self {
        self.fire_instance_id = id;
        self
    }

    pub fn with_job_instance_id(mut self, id: JobInstanceId) -> Self {
        self.job_instance_id = Some(id);
        self
    }

    pub fn with_scope(mut self, scope: Option<ScopeHandle>) -> Self {
        self.scope = scope;
        self
    }

    pub fn with_refire_count(mut self, refire_count: u32) -> Self {
        self.refire_count = refire_count;
        self
    }

    pub fn fire_instance_id(&self) -> FireInstanceId {
        self.fire_instance_id
    }

    pub fn job_instance_id(&self) -> Option<JobInstanceId> {
        self.job_instance_id
    }

    pub fn job_key(&self) -> &JobKey {
        &self.detail.key
    }

    pub fn detail(&self) -> &JobDetail {
        &self.detail
    }

    pub fn scheduler_name(&self) -> &str {
        &self.scheduler_name
    }

    /// Job data merged with trigger data (trigger wins).
    pub fn job_data(&self) -> &JobDataMap {
        &self.job_data
    }

    pub fn cancellation_token(&self) -> &CancellationToken {
        &self.cancellation
    }

    pub fn is_cancellation_requested(&self) -> bool {
        self.cancellation.is_cancelled()
    }

    pub fn started_at(&self) -> Instant {
        self.started
    }

    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    /// Number of immediate refires that preceded this firing.
    pub fn refire_count(&self) -> u32 {
        self.refire_count
    }

    pub fn scope(&self) -> Option<&ScopeHandle> {
        self.scope.as_ref()
    }

    /// Register a per-firing resource into the firing's scope.
    ///
    /// Fails for unscoped jobs and for scopes already closed.
    pub fn register<R>(&self, resource: Arc<R>) -> anyhow::Result<Arc<R>>
    where
        R: Disposable + 'static,
    {
        let Some(scope) = &self.scope else {
            anyhow::bail!("job {} runs without a resource scope", self.detail.key);
        };
        Ok(scope.register_for_firing(resource)?)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;
    use crate::scope::ResourceScope;
    use crate::scope::test_support::RecordingResource;
    use jobscope_core::JobTypeDescriptor;

    fn context() -> JobRunContext {
        let detail = JobDetail::new(
            JobKey::new("send-report").unwrap(),
            JobTypeDescriptor::scoped("SendReport"),
        );
        JobRunContext::new(detail, "main", JobDataMap::new(), CancellationToken::new())
    }

    #[test]
    fn register_requires_a_scope() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let ctx = context();

        assert!(ctx.register(RecordingResource::new("db-handle", &log)).is_err());
    }

    #[test]
    fn register_goes_into_the_firing_scope() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let scope = ResourceScope::new();
        let ctx = context().with_scope(Some(scope.clone()));

        ctx.register(RecordingResource::new("db-handle", &log)).unwrap();

        assert_eq!(scope.len(), 1);
        scope.close();
        assert_eq!(*log.lock().unwrap(), vec!["db-handle"]);
    }

    #[test]
    fn register_after_the_firing_released_its_scope_is_a_defect() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let scope = ResourceScope::new();
        let ctx = context().with_scope(Some(scope.clone()));
        scope.close();

        let outcome = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            ctx.register(RecordingResource::new("late", &log))
        }));

        if cfg!(debug_assertions) {
            assert!(outcome.is_err());
        } else {
            assert!(outcome.unwrap().is_err());
        }
        assert!(scope.is_empty());
        assert!(log.lock().unwrap().is_empty());
    }

    #[test]
    fn cancellation_is_shared_with_the_token() {
        let token = CancellationToken::new();
        let ctx = JobRunContext::new(
            context().detail().clone(),
            "main",
            JobDataMap::new(),
            token.clone(),
        );

        assert!(!ctx.is_cancellation_requested());
        token.cancel();
        assert!(ctx.is_cancellation_requested());
    }
}
