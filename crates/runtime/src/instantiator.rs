//! Job instantiation and release.
//!
//! [`ScopedJobFactory`] is the engine-facing factory. For scope-requiring job
//! types it opens a [`ResourceScope`](crate::scope::ResourceScope), resolves
//! the instance inside it and binds instance to scope in the shared registry;
//! on release it unbinds and closes the scope.
//!
//! Failure handling is asymmetric:
//! - instantiation errors are returned to the engine and abort the firing,
//!   after closing any scope that was already opened;
//! - release problems are logged and never returned, so they cannot mask the
//!   outcome of a job that already ran.

use std::sync::Arc;

use tracing::{debug, error, trace};

use jobscope_core::{JobDetail, JobInstanceId, JobTypeDescriptor};

use crate::job::Job;
use crate::registry::{RegistryError, ScopedJobRegistry};
use crate::resolver::{JobResolver, ResolveContext, ResolveError};
use crate::scope::ScopeHandle;

/// A job could not be instantiated; the firing does not run.
#[derive(Debug, thiserror::Error)]
pub enum InstantiationError {
    #[error("problem instantiating job type '{type_name}': {source}")]
    Resolve {
        type_name: String,
        #[source]
        source: ResolveError,
    },
    /// The instance id was already bound. Indicates a defect in the caller.
    #[error("problem binding job type '{type_name}' to its scope: {source}")]
    Binding {
        type_name: String,
        #[source]
        source: RegistryError,
    },
}

impl InstantiationError {
    pub fn type_name(&self) -> &str {
        match self {
            Self::Resolve { type_name, .. } | Self::Binding { type_name, .. } => type_name,
        }
    }

    /// Internal-consistency violation rather than a resolution problem.
    pub fn is_defect(&self) -> bool {
        matches!(self, Self::Binding { .. })
    }
}

/// A live job instance, handed out by `new_job` and given back to `return_job`.
pub struct JobInstance {
    id: JobInstanceId,
    descriptor: JobTypeDescriptor,
    job: Arc<dyn Job>,
    scope: Option<ScopeHandle>,
}

impl JobInstance {
    pub fn id(&self) -> JobInstanceId {
        self.id
    }

    pub fn descriptor(&self) -> &JobTypeDescriptor {
        &self.descriptor
    }

    pub fn job(&self) -> &Arc<dyn Job> {
        &self.job
    }

    pub fn scope(&self) -> Option<&ScopeHandle> {
        self.scope.as_ref()
    }
}

impl core::fmt::Debug for JobInstance {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("JobInstance")
            .field("id", &self.id)
            .field("descriptor", &self.descriptor)
            .field("scope", &self.scope.as_ref().map(|s| s.id()))
            .finish()
    }
}

/// Extension points around instantiation.
pub trait JobFactoryListener: Send + Sync {
    fn on_before_new_job(&self, _detail: &JobDetail, _scheduler_name: &str) {}

    fn on_after_new_job(&self, _detail: &JobDetail, _instance: &JobInstance) {}
}

/// Engine-facing factory interface.
pub trait JobFactory: Send + Sync {
    fn new_job(
        &self,
        detail: &JobDetail,
        scheduler_name: &str,
    ) -> Result<JobInstance, InstantiationError>;

    /// Release an instance. Never fails; problems are logged.
    fn return_job(&self, instance: JobInstance);
}

impl<T: JobFactory + ?Sized> JobFactory for Arc<T> {
    fn new_job(
        &self,
        detail: &JobDetail,
        scheduler_name: &str,
    ) -> Result<JobInstance, InstantiationError> {
        (**self).new_job(detail, scheduler_name)
    }

    fn return_job(&self, instance: JobInstance) {
        (**self).return_job(instance)
    }
}

/// Factory that opens a resource scope per firing for scope-requiring jobs.
pub struct ScopedJobFactory {
    resolver: Arc<dyn JobResolver>,
    registry: Arc<ScopedJobRegistry>,
    listener: Option<Arc<dyn JobFactoryListener>>,
}

impl ScopedJobFactory {
    pub fn new(resolver: Arc<dyn JobResolver>, registry: Arc<ScopedJobRegistry>) -> Self {
        Self {
            resolver,
            registry,
            listener: None,
        }
    }

    pub fn with_listener(mut self, listener: Arc<dyn JobFactoryListener>) -> Self {
        self.listener = Some(listener);
        self
    }

    pub fn registry(&self) -> &Arc<ScopedJobRegistry> {
        &self.registry
    }

    fn instantiate(
        &self,
        id: JobInstanceId,
        detail: &JobDetail,
        scheduler_name: &str,
    ) -> Result<JobInstance, InstantiationError> {
        let descriptor = &detail.job_type;
        let resolve = ResolveContext::new(detail, scheduler_name);

        if !descriptor.requires_scope() {
            let job = self
                .resolver
                .resolve(&resolve)
                .map_err(|source| self.resolve_failed(detail, source))?;
            return Ok(JobInstance {
                id,
                descriptor: descriptor.clone(),
                job,
                scope: None,
            });
        }

        let scope = self.resolver.open_scope();
        let job = match self.resolver.resolve(&resolve.with_scope(&scope)) {
            Ok(job) => job,
            Err(source) => {
                scope.close();
                return Err(self.resolve_failed(detail, source));
            }
        };

        if let Err(source) = self.registry.bind(id, scope.clone()) {
            drop(job);
            scope.close();
            error!(
                job = %detail.key,
                job_type = %descriptor,
                job_instance = %id,
                "job instance bound twice; firing aborted"
            );
            if cfg!(debug_assertions) {
                panic!("job instance {id} bound twice: {source}");
            }
            return Err(InstantiationError::Binding {
                type_name: descriptor.type_name().to_string(),
                source,
            });
        }

        Ok(JobInstance {
            id,
            descriptor: descriptor.clone(),
            job,
            scope: Some(scope),
        })
    }

    fn resolve_failed(&self, detail: &JobDetail, source: ResolveError) -> InstantiationError {
        error!(
            job = %detail.key,
            job_type = %detail.job_type,
            error = %source,
            "problem instantiating job"
        );
        InstantiationError::Resolve {
            type_name: detail.job_type.type_name().to_string(),
            source,
        }
    }
}

impl core::fmt::Debug for ScopedJobFactory {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("ScopedJobFactory")
            .field("registry", &self.registry.stats())
            .field("listener", &self.listener.is_some())
            .finish()
    }
}

impl JobFactory for ScopedJobFactory {
    fn new_job(
        &self,
        detail: &JobDetail,
        scheduler_name: &str,
    ) -> Result<JobInstance, InstantiationError> {
        if let Some(listener) = &self.listener {
            listener.on_before_new_job(detail, scheduler_name);
        }

        let instance = self.instantiate(JobInstanceId::new(), detail, scheduler_name)?;
        debug!(
            job = %detail.key,
            job_type = %instance.descriptor,
            job_instance = %instance.id,
            scope_id = ?instance.scope.as_ref().map(|s| s.id()),
            "job instance created"
        );

        if let Some(listener) = &self.listener {
            listener.on_after_new_job(detail, &instance);
        }
        Ok(instance)
    }

    fn return_job(&self, instance: JobInstance) {
        let JobInstance {
            id,
            descriptor,
            job,
            scope,
        } = instance;

        if !descriptor.requires_scope() {
            self.resolver.release(&descriptor, job);
            trace!(job_type = %descriptor, job_instance = %id, "unscoped job released");
            return;
        }

        drop(job);
        // The instance's own handle is not used for closing: the registry is
        // the authority on which scope belongs to the instance.
        drop(scope);
        match self.registry.unbind(id) {
            Ok(scope) => {
                scope.close();
                trace!(job_type = %descriptor, job_instance = %id, "scoped job released");
            }
            Err(_) => {
                // Already reported on the anomaly channel by the registry.
                error!(
                    job_type = %descriptor,
                    job_instance = %id,
                    "failed to find associated scope for job; nothing to close"
                );
            }
        }
    }
}
