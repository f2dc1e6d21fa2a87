//! Resource scopes: containers of disposable resources bound to one firing.
//!
//! A scope owns an ordered set of resources and releases them exactly once,
//! most-recently-registered first. Release is best-effort: a resource that
//! fails to dispose is logged and the remaining resources are still released.
//!
//! ## Ownership
//!
//! Scopes are shared through [`ScopeHandle`] (`Arc<ResourceScope>`): the job
//! instance holds one to register its dependencies, the registry holds one to
//! find the scope on release. Closing is explicit and idempotent; dropping the
//! last handle of an unclosed scope closes it as a safety net.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use thiserror::Error;
use tracing::{debug, error, trace, warn};

use jobscope_core::ScopeId;

/// A resource whose lifetime is bound to a [`ResourceScope`].
pub trait Disposable: Send + Sync {
    /// Name used in logs.
    fn name(&self) -> &str {
        std::any::type_name::<Self>()
    }

    /// Release the resource. Called at most once, by the owning scope.
    fn dispose(&self) -> anyhow::Result<()>;
}

/// Registering into a scope that was already closed.
///
/// This is a programming defect in the caller, not a runtime condition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("resource scope {scope_id} is already closed")]
pub struct ScopeClosedError {
    pub scope_id: ScopeId,
}

/// Shared handle to a scope.
pub type ScopeHandle = Arc<ResourceScope>;

/// Summary of a `close()` call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CloseReport {
    /// Resources disposed successfully by this call.
    pub released: usize,
    /// Resources whose disposal failed (logged, not retried).
    pub failed: usize,
    /// The scope had been closed before this call; nothing was done.
    pub already_closed: bool,
}

#[derive(Default)]
struct ScopeState {
    resources: Vec<Arc<dyn Disposable>>,
    closed: bool,
}

/// Disposable container of per-firing resources.
pub struct ResourceScope {
    id: ScopeId,
    state: Mutex<ScopeState>,
}

impl ResourceScope {
    /// Open a new, empty scope.
    pub fn new() -> ScopeHandle {
        let scope = Arc::new(Self {
            id: ScopeId::new(),
            state: Mutex::new(ScopeState::default()),
        });
        debug!(scope_id = %scope.id, "resource scope opened");
        scope
    }

    pub fn id(&self) -> ScopeId {
        self.id
    }

    /// Register a resource and hand it back for use by the caller.
    ///
    /// Registering the same `Arc` twice keeps a single entry.
    pub fn register<R>(&self, resource: Arc<R>) -> Result<Arc<R>, ScopeClosedError>
    where
        R: Disposable + 'static,
    {
        let dynamic: Arc<dyn Disposable> = resource.clone();
        self.register_dyn(dynamic)?;
        Ok(resource)
    }

    /// Register on behalf of job code running inside this scope's firing.
    ///
    /// A closed scope here means the caller outlived its firing. Debug builds
    /// panic; release builds log and return the error.
    pub fn register_for_firing<R>(&self, resource: Arc<R>) -> Result<Arc<R>, ScopeClosedError>
    where
        R: Disposable + 'static,
    {
        let registered = self.register(resource);
        debug_assert!(
            registered.is_ok(),
            "resource scope {} is already closed: resource registered after its firing was released",
            self.id
        );
        registered
    }

    /// Register an already type-erased resource.
    ///
    /// Racing a concurrent `close()` is allowed: the resource is either
    /// released by that close or rejected, never leaked.
    pub fn register_dyn(&self, resource: Arc<dyn Disposable>) -> Result<(), ScopeClosedError> {
        let mut state = self.lock();
        if state.closed {
            error!(
                scope_id = %self.id,
                resource = resource.name(),
                "attempt to register a resource into a closed scope"
            );
            return Err(ScopeClosedError { scope_id: self.id });
        }

        if state.resources.iter().any(|r| Arc::ptr_eq(r, &resource)) {
            trace!(scope_id = %self.id, resource = resource.name(), "resource already registered");
            return Ok(());
        }

        trace!(scope_id = %self.id, resource = resource.name(), "resource registered");
        state.resources.push(resource);
        Ok(())
    }

    /// Release every owned resource, most recent first. Idempotent.
    ///
    /// Safe to call from any task or thread, including one other than the
    /// task that opened the scope.
    pub fn close(&self) -> CloseReport {
        let drained = {
            let mut state = self.lock();
            if state.closed {
                trace!(scope_id = %self.id, "resource scope already closed");
                return CloseReport {
                    already_closed: true,
                    ..CloseReport::default()
                };
            }
            state.closed = true;
            std::mem::take(&mut state.resources)
        };

        let mut report = CloseReport::default();
        for resource in drained.into_iter().rev() {
            match resource.dispose() {
                Ok(()) => report.released += 1,
                Err(e) => {
                    report.failed += 1;
                    error!(
                        scope_id = %self.id,
                        resource = resource.name(),
                        error = %format!("{e:#}"),
                        "failed to dispose scoped resource"
                    );
                }
            }
        }

        debug!(
            scope_id = %self.id,
            released = report.released,
            failed = report.failed,
            "resource scope closed"
        );
        report
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    /// Number of resources currently owned.
    pub fn len(&self) -> usize {
        self.lock().resources.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> MutexGuard<'_, ScopeState> {
        // Disposal runs outside the lock, so a poisoned guard still holds
        // consistent state.
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl core::fmt::Debug for ResourceScope {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let state = self.lock();
        f.debug_struct("ResourceScope")
            .field("id", &self.id)
            .field("resources", &state.resources.len())
            .field("closed", &state.closed)
            .finish()
    }
}

impl Drop for ResourceScope {
    fn drop(&mut self) {
        let pending = {
            let state = self.lock();
            (!state.closed).then_some(state.resources.len())
        };
        if let Some(count) = pending {
            if count > 0 {
                warn!(
                    scope_id = %self.id,
                    resources = count,
                    "resource scope dropped without close; releasing now"
                );
            }
            self.close();
        }
    }
}
