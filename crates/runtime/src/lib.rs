//! `jobscope-runtime`: scoped job execution.
//!
//! ## Flow of one firing
//!
//! 1. [`ScopedJobFactory::new_job`] resolves the job instance. Scope-requiring
//!    job types get a fresh [`ResourceScope`]; the instance is bound to it in
//!    the [`ScopedJobRegistry`].
//! 2. [`ExecutionPipeline`] runs pre-execute, execute and post-execute,
//!    checking cancellation between phases and classifying failures.
//! 3. [`ScopedJobFactory::return_job`] unbinds and closes the scope.
//!
//! [`JobRunShell`] ties the three together and guarantees step 3 runs once.

pub mod classifier;
pub mod instantiator;
pub mod job;
pub mod pipeline;
pub mod registry;
pub mod resolver;
pub mod scope;
pub mod shell;

pub use classifier::{FailureDirectives, FailureDisposition, JobExecutionFailure, classify_failure};
pub use instantiator::{
    InstantiationError, JobFactory, JobFactoryListener, JobInstance, ScopedJobFactory,
};
pub use job::{Job, JobRunContext};
pub use pipeline::{
    ExecutionOutcome, ExecutionPipeline, ExecutionReport, JobInformation, PipelineState,
};
pub use registry::{ANOMALY_TARGET, RegistryError, RegistryStats, ScopedJobRegistry};
pub use resolver::{
    JobConstructor, JobContainer, JobResolver, Lifestyle, ResolveContext, ResolveError,
};
pub use scope::{CloseReport, Disposable, ResourceScope, ScopeClosedError, ScopeHandle};
pub use shell::{JobRunShell, TriggerFiredBundle};
