//! Job resolution boundary.
//!
//! [`JobResolver`] is the seam between the instantiator and whatever builds
//! job instances. [`JobContainer`] is the in-process implementation: a table
//! of constructors keyed by job type name, each with a lifestyle.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError, RwLock};

use tracing::{debug, trace, warn};

use jobscope_core::{JobDetail, JobTypeDescriptor};

use crate::job::Job;
use crate::scope::{Disposable, ResourceScope, ScopeClosedError, ScopeHandle};

/// How long a resolved job instance lives.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum Lifestyle {
    /// New instance per resolve; dropped on release.
    #[default]
    Transient,
    /// One instance shared by every firing; release is a no-op.
    Singleton,
    /// New instance per resolve, only inside a resource scope.
    Scoped,
}

/// Inputs for one resolve call.
#[derive(Debug, Clone, Copy)]
pub struct ResolveContext<'a> {
    pub descriptor: &'a JobTypeDescriptor,
    pub detail: &'a JobDetail,
    pub scheduler_name: &'a str,
    /// The scope opened for this firing, if the job type requires one.
    pub scope: Option<&'a ScopeHandle>,
}

impl<'a> ResolveContext<'a> {
    pub fn new(detail: &'a JobDetail, scheduler_name: &'a str) -> Self {
        Self {
            descriptor: &detail.job_type,
            detail,
            scheduler_name,
            scope: None,
        }
    }

    pub fn with_scope(mut self, scope: &'a ScopeHandle) -> Self {
        self.scope = Some(scope);
        self
    }

    /// Register a dependency into the resolve scope and hand it back.
    ///
    /// Constructors use this for scope-bound dependencies, so they are
    /// released together with the scope.
    pub fn register<R>(&self, resource: Arc<R>) -> anyhow::Result<Arc<R>>
    where
        R: Disposable + 'static,
    {
        let Some(scope) = self.scope else {
            anyhow::bail!(
                "job type {} is resolved without a resource scope",
                self.descriptor
            );
        };
        Ok(scope.register_for_firing(resource)?)
    }
}

/// Resolve error.
#[derive(Debug, thiserror::Error)]
pub enum ResolveError {
    #[error("no job registered for type {0}")]
    NotRegistered(String),
    #[error("job type {0} is scoped but no scope was supplied")]
    ScopeRequired(String),
    #[error(transparent)]
    ScopeClosed(#[from] ScopeClosedError),
    #[error("failed to construct job type {type_name}: {source}")]
    Construction {
        type_name: String,
        #[source]
        source: anyhow::Error,
    },
}

impl ResolveError {
    pub fn construction(type_name: impl Into<String>, source: anyhow::Error) -> Self {
        Self::Construction {
            type_name: type_name.into(),
            source,
        }
    }
}

/// Builds job instances.
pub trait JobResolver: Send + Sync {
    /// Open a scope for a firing of a scope-requiring job type.
    fn open_scope(&self) -> ScopeHandle {
        ResourceScope::new()
    }

    fn resolve(&self, ctx: &ResolveContext<'_>) -> Result<Arc<dyn Job>, ResolveError>;

    /// Give back an unscoped instance once its firing is over.
    fn release(&self, descriptor: &JobTypeDescriptor, job: Arc<dyn Job>);
}

impl<T: JobResolver + ?Sized> JobResolver for Arc<T> {
    fn open_scope(&self) -> ScopeHandle {
        (**self).open_scope()
    }

    fn resolve(&self, ctx: &ResolveContext<'_>) -> Result<Arc<dyn Job>, ResolveError> {
        (**self).resolve(ctx)
    }

    fn release(&self, descriptor: &JobTypeDescriptor, job: Arc<dyn Job>) {
        (**self).release(descriptor, job)
    }
}

/// Constructor stored per job type.
pub type JobConstructor =
    Arc<dyn Fn(&ResolveContext<'_>) -> anyhow::Result<Arc<dyn Job>> + Send + Sync>;

struct Registration {
    constructor: JobConstructor,
    lifestyle: Lifestyle,
    singleton: Mutex<Option<Arc<dyn Job>>>,
}

/// In-process job registration table.
#[derive(Default)]
pub struct JobContainer {
    registrations: RwLock<HashMap<String, Arc<Registration>>>,
}

impl JobContainer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }

    /// Register a constructor for `type_name`.
    ///
    /// Returns `false` and keeps the existing registration when the type is
    /// already registered.
    pub fn register<F>(
        &self,
        type_name: impl Into<String>,
        lifestyle: Lifestyle,
        constructor: F,
    ) -> bool
    where
        F: Fn(&ResolveContext<'_>) -> anyhow::Result<Arc<dyn Job>> + Send + Sync + 'static,
    {
        let type_name = type_name.into();
        let mut registrations = self
            .registrations
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        if registrations.contains_key(&type_name) {
            debug!(job_type = %type_name, "job type already registered, skipping");
            return false;
        }

        debug!(job_type = %type_name, lifestyle = ?lifestyle, "job type registered");
        registrations.insert(
            type_name,
            Arc::new(Registration {
                constructor: Arc::new(constructor),
                lifestyle,
                singleton: Mutex::new(None),
            }),
        );
        true
    }

    pub fn contains(&self, type_name: &str) -> bool {
        self.read().contains_key(type_name)
    }

    pub fn lifestyle_of(&self, type_name: &str) -> Option<Lifestyle> {
        self.read().get(type_name).map(|r| r.lifestyle)
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, HashMap<String, Arc<Registration>>> {
        self.registrations
            .read()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn lookup(&self, type_name: &str) -> Option<Arc<Registration>> {
        self.read().get(type_name).cloned()
    }
}

impl core::fmt::Debug for JobContainer {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let registrations = self.read();
        let mut types: Vec<_> = registrations
            .iter()
            .map(|(name, r)| (name.clone(), r.lifestyle))
            .collect();
        types.sort_by(|a, b| a.0.cmp(&b.0));
        f.debug_struct("JobContainer").field("types", &types).finish()
    }
}

impl JobResolver for JobContainer {
    fn resolve(&self, ctx: &ResolveContext<'_>) -> Result<Arc<dyn Job>, ResolveError> {
        let type_name = ctx.descriptor.type_name();
        // Constructors run without the table lock held.
        let registration = self
            .lookup(type_name)
            .ok_or_else(|| ResolveError::NotRegistered(type_name.to_string()))?;

        let construct = || {
            (registration.constructor)(ctx).map_err(|e| match e.downcast::<ScopeClosedError>() {
                Ok(closed) => ResolveError::ScopeClosed(closed),
                Err(e) => ResolveError::construction(type_name, e),
            })
        };

        match registration.lifestyle {
            Lifestyle::Transient => construct(),
            Lifestyle::Scoped => {
                if ctx.scope.is_none() {
                    return Err(ResolveError::ScopeRequired(type_name.to_string()));
                }
                construct()
            }
            Lifestyle::Singleton => {
                let mut slot = registration
                    .singleton
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner);
                if let Some(job) = slot.as_ref() {
                    return Ok(job.clone());
                }
                let job = construct()?;
                *slot = Some(job.clone());
                Ok(job)
            }
        }
    }

    fn release(&self, descriptor: &JobTypeDescriptor, job: Arc<dyn Job>) {
        match self.lookup(descriptor.type_name()).map(|r| r.lifestyle) {
            Some(Lifestyle::Singleton) => {
                trace!(job_type = %descriptor, "singleton job kept alive");
            }
            Some(_) => {
                trace!(job_type = %descriptor, "job instance released");
                drop(job);
            }
            None => {
                warn!(job_type = %descriptor, "released a job whose type is not registered");
            }
        }
    }
}
