//! Scoped job registry.
//!
//! Maps each live scoped job instance to the scope it was resolved in, so the
//! scope can be found and closed when the engine hands the instance back.
//! Shared by every concurrent firing; DashMap shards the map so bind/unbind of
//! unrelated instances never contend on one lock.

use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use tracing::{debug, error};

use jobscope_core::JobInstanceId;

use crate::scope::ScopeHandle;

/// Log target for release anomalies (unknown instance on unbind and the like).
pub const ANOMALY_TARGET: &str = "jobscope::anomaly";

/// Registry error.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RegistryError {
    #[error("job instance {0} is already bound to a scope")]
    DuplicateBinding(JobInstanceId),
    #[error("job instance {0} has no associated scope")]
    UnknownBinding(JobInstanceId),
}

/// Registry counters (lifetime totals plus current size).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize)]
pub struct RegistryStats {
    pub active: usize,
    pub bound: u64,
    pub unbound: u64,
    pub duplicate_bindings: u64,
    pub unknown_unbinds: u64,
}

/// Concurrent map from live job instance to its scope.
#[derive(Debug, Default)]
pub struct ScopedJobRegistry {
    bindings: DashMap<JobInstanceId, ScopeHandle>,
    bound: AtomicU64,
    unbound: AtomicU64,
    duplicate_bindings: AtomicU64,
    unknown_unbinds: AtomicU64,
}

impl ScopedJobRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record that `instance` lives in `scope`.
    ///
    /// Atomic with respect to other binds of the same id: exactly one wins,
    /// the others get `DuplicateBinding` and the existing binding is untouched.
    pub fn bind(&self, instance: JobInstanceId, scope: ScopeHandle) -> Result<(), RegistryError> {
        match self.bindings.entry(instance) {
            Entry::Occupied(_) => {
                self.duplicate_bindings.fetch_add(1, Ordering::Relaxed);
                error!(
                    target: ANOMALY_TARGET,
                    job_instance = %instance,
                    scope_id = %scope.id(),
                    "job instance is already bound to a scope"
                );
                Err(RegistryError::DuplicateBinding(instance))
            }
            Entry::Vacant(slot) => {
                debug!(job_instance = %instance, scope_id = %scope.id(), "scope bound");
                slot.insert(scope);
                self.bound.fetch_add(1, Ordering::Relaxed);
                Ok(())
            }
        }
    }

    /// Remove and return the scope bound to `instance`.
    ///
    /// An unknown id is an anomaly: it is counted and logged, and the caller
    /// decides whether to continue.
    pub fn unbind(&self, instance: JobInstanceId) -> Result<ScopeHandle, RegistryError> {
        match self.bindings.remove(&instance) {
            Some((_, scope)) => {
                self.unbound.fetch_add(1, Ordering::Relaxed);
                debug!(job_instance = %instance, scope_id = %scope.id(), "scope unbound");
                Ok(scope)
            }
            None => {
                self.unknown_unbinds.fetch_add(1, Ordering::Relaxed);
                error!(
                    target: ANOMALY_TARGET,
                    job_instance = %instance,
                    "failed to find associated scope for job instance"
                );
                Err(RegistryError::UnknownBinding(instance))
            }
        }
    }

    pub fn contains(&self, instance: JobInstanceId) -> bool {
        self.bindings.contains_key(&instance)
    }

    /// Number of instances currently bound.
    pub fn active_count(&self) -> usize {
        self.bindings.len()
    }

    pub fn stats(&self) -> RegistryStats {
        RegistryStats {
            active: self.bindings.len(),
            bound: self.bound.load(Ordering::Relaxed),
            unbound: self.unbound.load(Ordering::Relaxed),
            duplicate_bindings: self.duplicate_bindings.load(Ordering::Relaxed),
            unknown_unbinds: self.unknown_unbinds.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::scope::ResourceScope;

    #[test]
    fn bind_then_unbind_returns_same_scope() {
        let registry = ScopedJobRegistry::new();
        let instance = JobInstanceId::new();
        let scope = ResourceScope::new();

        registry.bind(instance, scope.clone()).unwrap();
        assert!(registry.contains(instance));
        assert_eq!(registry.active_count(), 1);

        let unbound = registry.unbind(instance).unwrap();
        assert!(Arc::ptr_eq(&unbound, &scope));
        assert!(!registry.contains(instance));
        assert_eq!(registry.active_count(), 0);
    }

    #[test]
    fn duplicate_bind_keeps_first_binding() {
        let registry = ScopedJobRegistry::new();
        let instance = JobInstanceId::new();
        let first = ResourceScope::new();
        let second = ResourceScope::new();

        registry.bind(instance, first.clone()).unwrap();
        assert_eq!(
            registry.bind(instance, second),
            Err(RegistryError::DuplicateBinding(instance))
        );

        let kept = registry.unbind(instance).unwrap();
        assert!(Arc::ptr_eq(&kept, &first));
        assert_eq!(registry.stats().duplicate_bindings, 1);
    }

    #[test]
    fn unbind_unknown_is_counted() {
        let registry = ScopedJobRegistry::new();
        let instance = JobInstanceId::new();

        assert!(matches!(
            registry.unbind(instance),
            Err(RegistryError::UnknownBinding(id)) if id == instance
        ));

        let stats = registry.stats();
        assert_eq!(stats.unknown_unbinds, 1);
        assert_eq!(stats.active, 0);
    }

    #[test]
    fn second_unbind_is_unknown() {
        let registry = ScopedJobRegistry::new();
        let instance = JobInstanceId::new();
        registry.bind(instance, ResourceScope::new()).unwrap();

        assert!(registry.unbind(instance).is_ok());
        assert!(registry.unbind(instance).is_err());
    }

    #[test]
    fn concurrent_bind_of_same_id_has_one_winner() {
        let registry = Arc::new(ScopedJobRegistry::new());
        let instance = JobInstanceId::new();

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let registry = registry.clone();
                std::thread::spawn(move || registry.bind(instance, ResourceScope::new()).is_ok())
            })
            .collect();
        let winners = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|won| *won)
            .count();

        assert_eq!(winners, 1);
        assert_eq!(registry.stats().duplicate_bindings, 7);
    }

    #[test]
    fn concurrent_distinct_bindings() {
        let registry = Arc::new(ScopedJobRegistry::new());

        let handles: Vec<_> = (0..16)
            .map(|_| {
                let registry = registry.clone();
                std::thread::spawn(move || {
                    let id = JobInstanceId::new();
                    registry.bind(id, ResourceScope::new()).unwrap();
                    id
                })
            })
            .collect();
        let ids: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();

        assert_eq!(registry.active_count(), 16);
        for id in ids {
            registry.unbind(id).unwrap();
        }
        let stats = registry.stats();
        assert_eq!(stats.bound, 16);
        assert_eq!(stats.unbound, 16);
        assert_eq!(stats.active, 0);
    }
}
