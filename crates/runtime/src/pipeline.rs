//! Execution pipeline: pre-execute, execute, post-execute.
//!
//! ```text
//! Created -> PreExecuting -> Executing -> PostExecuting -> Completed
//!                 \               \              \
//!                  +---------------+--------------+--> Failed | Cancelled
//! ```
//!
//! Cancellation is checked before each phase. Any phase error goes through
//! the job's `on_failure` hook, which by default classifies it into a
//! [`JobExecutionFailure`]. Every run is timed and logged together with a
//! dump of the job's identity and parameters.

use std::time::{Duration, Instant};

use tracing::{info, trace, warn};

use crate::classifier::{FailureDirectives, FailureDisposition, JobExecutionFailure};
use crate::job::{Job, JobRunContext};

/// Pipeline state of one firing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PipelineState {
    Created,
    PreExecuting,
    Executing,
    PostExecuting,
    Completed,
    Failed,
    Cancelled,
}

impl PipelineState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::PreExecuting => "pre_executing",
            Self::Executing => "executing",
            Self::PostExecuting => "post_executing",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }
}

impl core::fmt::Display for PipelineState {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Result of one run.
#[derive(Debug)]
pub enum ExecutionOutcome {
    Succeeded,
    /// Cancellation was observed at a phase boundary.
    Cancelled,
    Failed(JobExecutionFailure),
}

impl ExecutionOutcome {
    pub fn is_succeeded(&self) -> bool {
        matches!(self, Self::Succeeded)
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }

    pub fn failure(&self) -> Option<&JobExecutionFailure> {
        match self {
            Self::Failed(failure) => Some(failure),
            _ => None,
        }
    }

    /// Directives for the engine; `None` unless the run failed.
    pub fn directives(&self) -> Option<FailureDirectives> {
        self.failure().map(JobExecutionFailure::directives)
    }
}

/// Outcome plus the terminal state, the last phase entered and the duration.
#[derive(Debug)]
pub struct ExecutionReport {
    pub outcome: ExecutionOutcome,
    pub state: PipelineState,
    /// Last phase that was entered, `Created` if none was.
    pub last_phase: PipelineState,
    pub elapsed: Duration,
}

/// Runs jobs through the three phases.
#[derive(Debug, Clone, Copy, Default)]
pub struct ExecutionPipeline;

enum PhaseFlow {
    Completed,
    Cancelled,
}

const PHASES: [PipelineState; 3] = [
    PipelineState::PreExecuting,
    PipelineState::Executing,
    PipelineState::PostExecuting,
];

impl ExecutionPipeline {
    pub fn new() -> Self {
        Self
    }

    pub async fn run(&self, job: &dyn Job, ctx: &JobRunContext) -> ExecutionReport {
        let started = Instant::now();
        let mut last_phase = PipelineState::Created;

        let flow = Self::run_phases(job, ctx, &mut last_phase).await;
        let (outcome, state) = match flow {
            Ok(PhaseFlow::Completed) => (ExecutionOutcome::Succeeded, PipelineState::Completed),
            Ok(PhaseFlow::Cancelled) => (ExecutionOutcome::Cancelled, PipelineState::Cancelled),
            Err(error) => match job.on_failure(ctx, error) {
                FailureDisposition::Propagate(failure) => {
                    (ExecutionOutcome::Failed(failure), PipelineState::Failed)
                }
                FailureDisposition::Suppress => {
                    warn!(
                        job = %ctx.job_key(),
                        phase = %last_phase,
                        "job suppressed its failure; firing counts as succeeded"
                    );
                    (ExecutionOutcome::Succeeded, PipelineState::Completed)
                }
            },
        };

        let elapsed = started.elapsed();
        log_completion(ctx, &outcome, elapsed);

        ExecutionReport {
            outcome,
            state,
            last_phase,
            elapsed,
        }
    }

    async fn run_phases(
        job: &dyn Job,
        ctx: &JobRunContext,
        last_phase: &mut PipelineState,
    ) -> anyhow::Result<PhaseFlow> {
        for phase in PHASES {
            if ctx.is_cancellation_requested() {
                trace!(job = %ctx.job_key(), before = %phase, "cancellation observed");
                return Ok(PhaseFlow::Cancelled);
            }

            trace!(job = %ctx.job_key(), from = %last_phase, to = %phase, "pipeline transition");
            *last_phase = phase;
            match phase {
                PipelineState::PreExecuting => job.pre_execute(ctx).await?,
                PipelineState::Executing => job.execute(ctx).await?,
                _ => job.post_execute(ctx).await?,
            }
        }
        Ok(PhaseFlow::Completed)
    }
}

fn log_completion(ctx: &JobRunContext, outcome: &ExecutionOutcome, elapsed: Duration) {
    let elapsed_ms = elapsed.as_millis() as u64;
    let information = JobInformation::gather(ctx);
    let key = ctx.job_key();
    let details = information.to_string();

    match outcome {
        ExecutionOutcome::Succeeded => info!(
            job = %key,
            scheduler = ctx.scheduler_name(),
            elapsed_ms,
            details = %details,
            "job {key} was executed in {elapsed_ms} milliseconds"
        ),
        ExecutionOutcome::Cancelled => info!(
            job = %key,
            scheduler = ctx.scheduler_name(),
            elapsed_ms,
            details = %details,
            "job {key} was cancelled after {elapsed_ms} milliseconds"
        ),
        ExecutionOutcome::Failed(failure) => info!(
            job = %key,
            scheduler = ctx.scheduler_name(),
            elapsed_ms,
            error = %failure,
            details = %details,
            "job {key} failed after {elapsed_ms} milliseconds"
        ),
    }
}

/// Structured description of a firing, for the completion log line.
///
/// Parameters are rendered best-effort; values that cannot be stringified
/// show as `<object>`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobInformation {
    pub job_type: String,
    pub scheduler: String,
    pub key: String,
    pub description: String,
    pub durable: bool,
    pub requests_recovery: bool,
    pub concurrent_execution_disallowed: bool,
    pub persist_job_data_after_execution: bool,
    pub parameters: Vec<(String, String)>,
}

impl JobInformation {
    pub fn gather(ctx: &JobRunContext) -> Self {
        let detail = ctx.detail();
        Self {
            job_type: detail.job_type.type_name().to_string(),
            scheduler: ctx.scheduler_name().to_string(),
            key: detail.key.to_string(),
            description: detail.description.clone().unwrap_or_default(),
            durable: detail.durable,
            requests_recovery: detail.requests_recovery,
            concurrent_execution_disallowed: detail.concurrent_execution_disallowed,
            persist_job_data_after_execution: detail.persist_job_data_after_execution,
            parameters: ctx.job_data().rendered(),
        }
    }
}

impl core::fmt::Display for JobInformation {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        writeln!(f, "Job information:")?;
        writeln!(f, "  Type: {}", self.job_type)?;
        writeln!(f, "  Scheduler: {}", self.scheduler)?;
        writeln!(f, "  Key: {}", self.key)?;
        writeln!(f, "  Description: {}", self.description)?;
        writeln!(f, "  Durable: {}", self.durable)?;
        writeln!(f, "  RequestsRecovery: {}", self.requests_recovery)?;
        writeln!(
            f,
            "  ConcurrentExecutionDisallowed: {}",
            self.concurrent_execution_disallowed
        )?;
        writeln!(
            f,
            "  PersistJobDataAfterExecution: {}",
            self.persist_job_data_after_execution
        )?;
        write!(f, "  Parameters:")?;
        for (name, value) in &self.parameters {
            write!(f, "\n    {name}: {value}")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use async_trait::async_trait;
    use serde_json::json;
    use tokio_util::sync::CancellationToken;

    use super::*;
    use jobscope_core::{JobDataMap, JobDetail, JobKey, JobTypeDescriptor};

    /// Records which phases ran; optionally fails or cancels in one of them.
    #[derive(Default)]
    struct Recorder {
        phases: Mutex<Vec<&'static str>>,
        fail_in: Option<&'static str>,
        cancel_in: Option<(&'static str, CancellationToken)>,
        suppress: bool,
        directives: FailureDirectives,
    }

    impl Recorder {
        fn enter(&self, phase: &'static str) -> anyhow::Result<()> {
            self.phases.lock().unwrap().push(phase);
            if let Some((at, token)) = &self.cancel_in {
                if *at == phase {
                    token.cancel();
                }
            }
            if self.fail_in == Some(phase) {
                anyhow::bail!("{phase} blew up");
            }
            Ok(())
        }

        fn phases(&self) -> Vec<&'static str> {
            self.phases.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl Job for Recorder {
        async fn pre_execute(&self, _ctx: &JobRunContext) -> anyhow::Result<()> {
            self.enter("pre")
        }

        async fn execute(&self, _ctx: &JobRunContext) -> anyhow::Result<()> {
            self.enter("execute")
        }

        async fn post_execute(&self, _ctx: &JobRunContext) -> anyhow::Result<()> {
            self.enter("post")
        }

        fn failure_directives(&self) -> FailureDirectives {
            self.directives
        }

        fn on_failure(&self, ctx: &JobRunContext, error: anyhow::Error) -> FailureDisposition {
            if self.suppress {
                return FailureDisposition::Suppress;
            }
            FailureDisposition::Propagate(crate::classifier::classify_failure(
                error,
                self.failure_directives(),
                ctx.job_key(),
            ))
        }
    }

    fn context(token: CancellationToken) -> JobRunContext {
        let detail = JobDetail::new(
            JobKey::new("send-report").unwrap(),
            JobTypeDescriptor::scoped("SendReport"),
        )
        .with_description("monthly report");
        JobRunContext::new(detail, "main", JobDataMap::new(), token)
    }

    #[tokio::test]
    async fn all_phases_run_in_order() {
        let job = Recorder::default();
        let report = ExecutionPipeline::new()
            .run(&job, &context(CancellationToken::new()))
            .await;

        assert!(report.outcome.is_succeeded());
        assert_eq!(report.state, PipelineState::Completed);
        assert_eq!(report.last_phase, PipelineState::PostExecuting);
        assert_eq!(job.phases(), vec!["pre", "execute", "post"]);
    }

    #[tokio::test]
    async fn cancellation_before_start_runs_nothing() {
        let token = CancellationToken::new();
        token.cancel();
        let job = Recorder::default();

        let report = ExecutionPipeline::new().run(&job, &context(token)).await;

        assert!(report.outcome.is_cancelled());
        assert_eq!(report.state, PipelineState::Cancelled);
        assert_eq!(report.last_phase, PipelineState::Created);
        assert!(job.phases().is_empty());
    }

    #[tokio::test]
    async fn cancellation_during_a_phase_is_seen_at_the_next_boundary() {
        let token = CancellationToken::new();
        let job = Recorder {
            cancel_in: Some(("pre", token.clone())),
            ..Recorder::default()
        };

        let report = ExecutionPipeline::new().run(&job, &context(token)).await;

        assert!(report.outcome.is_cancelled());
        assert_eq!(report.last_phase, PipelineState::PreExecuting);
        assert_eq!(job.phases(), vec!["pre"]);
    }

    #[tokio::test]
    async fn cancellation_during_post_still_succeeds() {
        let token = CancellationToken::new();
        let job = Recorder {
            cancel_in: Some(("post", token.clone())),
            ..Recorder::default()
        };

        let report = ExecutionPipeline::new().run(&job, &context(token)).await;

        assert!(report.outcome.is_succeeded());
    }

    #[tokio::test]
    async fn execute_failure_is_wrapped_with_default_directives() {
        let job = Recorder {
            fail_in: Some("execute"),
            ..Recorder::default()
        };

        let report = ExecutionPipeline::new()
            .run(&job, &context(CancellationToken::new()))
            .await;

        assert_eq!(report.state, PipelineState::Failed);
        assert_eq!(job.phases(), vec!["pre", "execute"]);
        let failure = report.outcome.failure().unwrap();
        assert_eq!(failure.directives(), FailureDirectives::NONE);
        assert_eq!(
            failure.cause().unwrap().to_string(),
            "execute blew up"
        );
    }

    #[tokio::test]
    async fn job_level_directives_are_applied() {
        let job = Recorder {
            fail_in: Some("pre"),
            directives: FailureDirectives::default().refire_immediately(),
            ..Recorder::default()
        };

        let report = ExecutionPipeline::new()
            .run(&job, &context(CancellationToken::new()))
            .await;

        assert_eq!(job.phases(), vec!["pre"]);
        assert_eq!(
            report.outcome.directives(),
            Some(FailureDirectives::default().refire_immediately())
        );
    }

    #[tokio::test]
    async fn suppressed_failure_counts_as_success() {
        let job = Recorder {
            fail_in: Some("post"),
            suppress: true,
            ..Recorder::default()
        };

        let report = ExecutionPipeline::new()
            .run(&job, &context(CancellationToken::new()))
            .await;

        assert!(report.outcome.is_succeeded());
        assert_eq!(report.state, PipelineState::Completed);
    }

    #[tokio::test]
    async fn structured_failure_keeps_its_own_directives() {
        struct Refiring;

        #[async_trait]
        impl Job for Refiring {
            async fn execute(&self, _ctx: &JobRunContext) -> anyhow::Result<()> {
                Err(JobExecutionFailure::new("not yet")
                    .with_directives(FailureDirectives::default().unschedule_firing_trigger())
                    .into())
            }
        }

        let report = ExecutionPipeline::new()
            .run(&Refiring, &context(CancellationToken::new()))
            .await;

        let failure = report.outcome.failure().unwrap();
        assert!(failure.unschedule_firing_trigger());
        assert_eq!(failure.message(), "not yet");
    }

    #[test]
    fn information_renders_parameters_best_effort() {
        struct Connection;

        let mut data = JobDataMap::new().with("recipient", json!("finance@example.com"));
        data.put_opaque("connection", Arc::new(Connection));
        let ctx = JobRunContext::new(
            context(CancellationToken::new()).detail().clone(),
            "main",
            data,
            CancellationToken::new(),
        );

        let info = JobInformation::gather(&ctx);
        let rendered = info.to_string();

        assert_eq!(info.job_type, "SendReport");
        assert_eq!(info.key, "DEFAULT.send-report");
        assert_eq!(info.description, "monthly report");
        assert!(rendered.contains("connection: <object>"));
        assert!(rendered.contains("recipient: finance@example.com"));
        assert!(rendered.contains("Scheduler: main"));
    }
}
