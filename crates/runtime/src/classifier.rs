//! Failure classification.
//!
//! Every error raised by a job phase ends up as a [`JobExecutionFailure`]: the
//! structured failure the engine inspects to decide whether to refire the job
//! or unschedule its triggers. Errors that already are a `JobExecutionFailure`
//! pass through unchanged; anything else is wrapped, keeping the original error
//! reachable as the cause.

use std::error::Error as StdError;

use tracing::error;

use jobscope_core::JobKey;

/// Directives an execution failure carries to the engine.
///
/// They are instructions for the engine only; the runtime never retries.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize)]
pub struct FailureDirectives {
    pub refire_immediately: bool,
    pub unschedule_firing_trigger: bool,
    pub unschedule_all_triggers: bool,
}

impl FailureDirectives {
    /// No refire, no unscheduling.
    pub const NONE: FailureDirectives = FailureDirectives {
        refire_immediately: false,
        unschedule_firing_trigger: false,
        unschedule_all_triggers: false,
    };

    pub fn refire_immediately(mut self) -> Self {
        self.refire_immediately = true;
        self
    }

    pub fn unschedule_firing_trigger(mut self) -> Self {
        self.unschedule_firing_trigger = true;
        self
    }

    pub fn unschedule_all_triggers(mut self) -> Self {
        self.unschedule_all_triggers = true;
        self
    }

    /// True when the engine should stop firing this job.
    pub fn unschedules(&self) -> bool {
        self.unschedule_firing_trigger || self.unschedule_all_triggers
    }
}

/// Structured execution failure handed to the engine.
#[derive(Debug)]
pub struct JobExecutionFailure {
    message: String,
    cause: Option<anyhow::Error>,
    directives: FailureDirectives,
}

impl JobExecutionFailure {
    /// A failure raised deliberately by a job, with default directives.
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            cause: None,
            directives: FailureDirectives::NONE,
        }
    }

    /// Wrap an arbitrary error; the error stays reachable through [`cause`](Self::cause).
    pub fn wrap(cause: anyhow::Error, directives: FailureDirectives) -> Self {
        Self {
            message: cause.to_string(),
            cause: Some(cause),
            directives,
        }
    }

    pub fn with_cause(mut self, cause: anyhow::Error) -> Self {
        self.cause = Some(cause);
        self
    }

    pub fn with_directives(mut self, directives: FailureDirectives) -> Self {
        self.directives = directives;
        self
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn cause(&self) -> Option<&anyhow::Error> {
        self.cause.as_ref()
    }

    pub fn directives(&self) -> FailureDirectives {
        self.directives
    }

    pub fn refire_immediately(&self) -> bool {
        self.directives.refire_immediately
    }

    pub fn unschedule_firing_trigger(&self) -> bool {
        self.directives.unschedule_firing_trigger
    }

    pub fn unschedule_all_triggers(&self) -> bool {
        self.directives.unschedule_all_triggers
    }
}

impl core::fmt::Display for JobExecutionFailure {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(&self.message)
    }
}

impl StdError for JobExecutionFailure {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        self.cause
            .as_ref()
            .map(|cause| &**cause as &(dyn StdError + 'static))
    }
}

/// What a job decided to do with a failure.
#[derive(Debug)]
pub enum FailureDisposition {
    /// Report the failure to the engine.
    Propagate(JobExecutionFailure),
    /// Swallow the failure; the firing ends as succeeded.
    Suppress,
}

/// Turn any phase error into a structured failure.
///
/// An error that already is a `JobExecutionFailure` is returned as is, with its
/// own directives. Anything else is wrapped with `directives` and logged.
pub fn classify_failure(
    error: anyhow::Error,
    directives: FailureDirectives,
    job: &JobKey,
) -> JobExecutionFailure {
    match error.downcast::<JobExecutionFailure>() {
        Ok(failure) => failure,
        Err(error) => {
            error!(
                job = %job,
                error = %format!("{error:#}"),
                refire_immediately = directives.refire_immediately,
                unschedule_firing_trigger = directives.unschedule_firing_trigger,
                unschedule_all_triggers = directives.unschedule_all_triggers,
                "re-wrapping job error into a job execution failure"
            );
            JobExecutionFailure::wrap(error, directives)
        }
    }
}
