//! In-memory scheduling engine for tests and development.
//!
//! ## Behaviour
//!
//! - Jobs are stored in memory; there are no triggers and no fire-time
//!   computation. A job fires only through `trigger_job`.
//! - Every firing runs on its own tokio task through a [`JobRunShell`].
//! - Returned directives are applied: an immediate refire re-runs the firing
//!   (bounded by `max_immediate_refires`), unscheduling removes the job.
//! - Jobs whose detail disallows concurrent execution run one firing at a time.
//! - `shutdown(true)` waits until every in-flight firing has finished.
//! - A firing whose job panics is recorded as failed.
//! - Only the newest `history_limit` firing records are kept.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use serde::Serialize;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use jobscope_core::{FireInstanceId, JobDataMap, JobDetail, JobKey};
use jobscope_runtime::{
    ExecutionOutcome, FailureDirectives, JobFactory, JobRunShell, TriggerFiredBundle,
};

use crate::config::{
    ConfigError, HISTORY_LIMIT_KEY, INSTANCE_ID_KEY, MAX_IMMEDIATE_REFIRES_KEY,
    SchedulerProperties,
};
use crate::engine::{EngineError, EngineFactory, ExecutingJob, SchedulerEngine};

/// Instance id used when none is configured.
pub const DEFAULT_INSTANCE_ID: &str = "NON_CLUSTERED";
/// Immediate refires allowed per firing when none is configured.
pub const DEFAULT_MAX_IMMEDIATE_REFIRES: u32 = 3;
/// Firing records kept when no limit is configured.
pub const DEFAULT_HISTORY_LIMIT: usize = 1024;

/// Local engine configuration.
#[derive(Debug, Clone)]
pub struct LocalEngineConfig {
    pub scheduler_name: String,
    pub instance_id: String,
    pub max_immediate_refires: u32,
    /// Oldest records are dropped once the history holds this many.
    pub history_limit: usize,
}

impl LocalEngineConfig {
    pub fn new(scheduler_name: impl Into<String>) -> Self {
        Self {
            scheduler_name: scheduler_name.into(),
            instance_id: DEFAULT_INSTANCE_ID.to_string(),
            max_immediate_refires: DEFAULT_MAX_IMMEDIATE_REFIRES,
            history_limit: DEFAULT_HISTORY_LIMIT,
        }
    }

    pub fn with_instance_id(mut self, instance_id: impl Into<String>) -> Self {
        self.instance_id = instance_id.into();
        self
    }

    pub fn with_max_immediate_refires(mut self, max: u32) -> Self {
        self.max_immediate_refires = max;
        self
    }

    pub fn with_history_limit(mut self, limit: usize) -> Self {
        self.history_limit = limit;
        self
    }

    /// Build from scheduler properties. The instance name must be present.
    pub fn from_properties(properties: &SchedulerProperties) -> Result<Self, ConfigError> {
        let name = properties
            .instance_name()
            .ok_or_else(|| ConfigError::MissingInstanceName("local engine".to_string()))?;
        let mut config = Self::new(name.trim());
        if let Some(id) = properties.get(INSTANCE_ID_KEY) {
            config.instance_id = id.to_string();
        }
        if let Some(max) = properties.parse::<u32>(MAX_IMMEDIATE_REFIRES_KEY)? {
            config.max_immediate_refires = max;
        }
        if let Some(limit) = properties.parse::<usize>(HISTORY_LIMIT_KEY)? {
            config.history_limit = limit;
        }
        Ok(config)
    }
}

/// How a firing ended, as recorded in the engine history.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum FiringResult {
    Succeeded,
    Cancelled,
    Failed(FailureDirectives),
    /// The job could not be instantiated; no job code ran.
    NotInstantiated,
}

/// One completed firing (including all of its immediate refires).
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FiringRecord {
    pub key: JobKey,
    pub fire_instance_id: FireInstanceId,
    pub result: FiringResult,
    pub refire_count: u32,
}

/// Engine counters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct LocalEngineStats {
    pub fired: u64,
    pub succeeded: u64,
    pub failed: u64,
    pub cancelled: u64,
    pub refired: u64,
    pub not_instantiated: u64,
    pub in_flight: usize,
}

#[derive(Debug, Default)]
struct Lifecycle {
    started: bool,
    standby: bool,
    shutdown: bool,
}

#[derive(Debug, Clone)]
struct StoredJob {
    detail: JobDetail,
    paused: bool,
    /// Serialises firings of jobs that disallow concurrent execution.
    gate: Arc<tokio::sync::Mutex<()>>,
}

struct InFlight {
    job_key: JobKey,
    fired_at: chrono::DateTime<Utc>,
    refire_count: AtomicU64,
    cancellation: CancellationToken,
}

struct Inner {
    config: LocalEngineConfig,
    shell: JobRunShell,
    lifecycle: Mutex<Lifecycle>,
    jobs: RwLock<HashMap<JobKey, StoredJob>>,
    paused_all: AtomicBool,
    executing: DashMap<FireInstanceId, InFlight>,
    in_flight: AtomicUsize,
    idle: Notify,
    history: Mutex<VecDeque<FiringRecord>>,
    fired: AtomicU64,
    succeeded: AtomicU64,
    failed: AtomicU64,
    cancelled: AtomicU64,
    refired: AtomicU64,
    not_instantiated: AtomicU64,
}

/// In-memory engine; see the module docs.
#[derive(Clone)]
pub struct LocalEngine {
    inner: Arc<Inner>,
}

impl LocalEngine {
    pub fn new(config: LocalEngineConfig, job_factory: Arc<dyn JobFactory>) -> Self {
        Self {
            inner: Arc::new(Inner {
                config,
                shell: JobRunShell::new(job_factory),
                lifecycle: Mutex::new(Lifecycle::default()),
                jobs: RwLock::new(HashMap::new()),
                paused_all: AtomicBool::new(false),
                executing: DashMap::new(),
                in_flight: AtomicUsize::new(0),
                idle: Notify::new(),
                history: Mutex::new(VecDeque::new()),
                fired: AtomicU64::new(0),
                succeeded: AtomicU64::new(0),
                failed: AtomicU64::new(0),
                cancelled: AtomicU64::new(0),
                refired: AtomicU64::new(0),
                not_instantiated: AtomicU64::new(0),
            }),
        }
    }

    pub fn config(&self) -> &LocalEngineConfig {
        &self.inner.config
    }

    pub fn stats(&self) -> LocalEngineStats {
        let inner = &self.inner;
        LocalEngineStats {
            fired: inner.fired.load(Ordering::Relaxed),
            succeeded: inner.succeeded.load(Ordering::Relaxed),
            failed: inner.failed.load(Ordering::Relaxed),
            cancelled: inner.cancelled.load(Ordering::Relaxed),
            refired: inner.refired.load(Ordering::Relaxed),
            not_instantiated: inner.not_instantiated.load(Ordering::Relaxed),
            in_flight: inner.in_flight.load(Ordering::SeqCst),
        }
    }

    /// Completed firings still held, oldest first.
    pub fn history(&self) -> Vec<FiringRecord> {
        self.inner
            .history
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .cloned()
            .collect()
    }

    /// Wait until no firing is in flight.
    pub async fn wait_for_idle(&self) {
        self.inner.wait_for_idle().await
    }
}

impl core::fmt::Debug for LocalEngine {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("LocalEngine")
            .field("config", &self.inner.config)
            .field("stats", &self.stats())
            .finish()
    }
}

impl Inner {
    fn lifecycle(&self) -> std::sync::MutexGuard<'_, Lifecycle> {
        self.lifecycle.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn jobs_read(&self) -> std::sync::RwLockReadGuard<'_, HashMap<JobKey, StoredJob>> {
        self.jobs.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn jobs_write(&self) -> std::sync::RwLockWriteGuard<'_, HashMap<JobKey, StoredJob>> {
        self.jobs.write().unwrap_or_else(PoisonError::into_inner)
    }

    fn ensure_not_shutdown(&self) -> Result<(), EngineError> {
        if self.lifecycle().shutdown {
            return Err(EngineError::Shutdown(self.config.scheduler_name.clone()));
        }
        Ok(())
    }

    fn check_running(&self, lifecycle: &Lifecycle) -> Result<(), EngineError> {
        if lifecycle.shutdown {
            return Err(EngineError::Shutdown(self.config.scheduler_name.clone()));
        }
        if !lifecycle.started || lifecycle.standby {
            return Err(EngineError::NotStarted(self.config.scheduler_name.clone()));
        }
        Ok(())
    }

    async fn wait_for_idle(&self) {
        loop {
            let notified = self.idle.notified();
            if self.in_flight.load(Ordering::SeqCst) == 0 {
                return;
            }
            notified.await;
        }
    }

    fn record(&self, record: FiringRecord) {
        let counter = match record.result {
            FiringResult::Succeeded => &self.succeeded,
            FiringResult::Cancelled => &self.cancelled,
            FiringResult::Failed(_) => &self.failed,
            FiringResult::NotInstantiated => &self.not_instantiated,
        };
        counter.fetch_add(1, Ordering::Relaxed);
        let mut history = self.history.lock().unwrap_or_else(PoisonError::into_inner);
        history.push_back(record);
        while history.len() > self.config.history_limit {
            history.pop_front();
        }
    }

    /// Apply unschedule directives: the job is removed from the store.
    fn unschedule(&self, key: &JobKey, directives: FailureDirectives) {
        if self.jobs_write().remove(key).is_some() {
            info!(
                scheduler = %self.config.scheduler_name,
                job = %key,
                unschedule_all_triggers = directives.unschedule_all_triggers,
                "job unscheduled after failure"
            );
        }
    }

    async fn run_firing(
        self: Arc<Self>,
        detail: JobDetail,
        data: JobDataMap,
        fire_instance_id: FireInstanceId,
        cancellation: CancellationToken,
        gate: Arc<tokio::sync::Mutex<()>>,
    ) {
        let _permit = if detail.concurrent_execution_disallowed {
            Some(gate.lock_owned().await)
        } else {
            None
        };

        let key = detail.key.clone();
        let mut refire_count = 0u32;
        let result = loop {
            let bundle = TriggerFiredBundle::new(detail.clone(), self.config.scheduler_name.clone())
                .with_trigger_data(data.clone())
                .with_cancellation(cancellation.clone())
                .with_fire_instance_id(fire_instance_id)
                .with_refire_count(refire_count);

            // Run on its own task so a panicking job surfaces as a JoinError.
            let shell = self.shell.clone();
            let report = match tokio::spawn(async move { shell.fire(bundle).await }).await {
                Ok(Ok(report)) => report,
                Err(e) => {
                    error!(
                        scheduler = %self.config.scheduler_name,
                        job = %key,
                        refire_count,
                        panicked = e.is_panic(),
                        "job firing aborted"
                    );
                    break FiringResult::Failed(FailureDirectives::NONE);
                }
                Ok(Err(e)) => {
                    error!(
                        scheduler = %self.config.scheduler_name,
                        job = %key,
                        error = %e,
                        "job could not be instantiated; firing skipped"
                    );
                    break FiringResult::NotInstantiated;
                }
            };

            match report.outcome {
                ExecutionOutcome::Succeeded => break FiringResult::Succeeded,
                ExecutionOutcome::Cancelled => break FiringResult::Cancelled,
                ExecutionOutcome::Failed(failure) => {
                    let directives = failure.directives();
                    if directives.refire_immediately
                        && refire_count < self.config.max_immediate_refires
                        && !cancellation.is_cancelled()
                    {
                        refire_count += 1;
                        self.refired.fetch_add(1, Ordering::Relaxed);
                        if let Some(entry) = self.executing.get(&fire_instance_id) {
                            entry.refire_count.store(refire_count as u64, Ordering::Relaxed);
                        }
                        warn!(
                            scheduler = %self.config.scheduler_name,
                            job = %key,
                            refire_count,
                            error = %failure,
                            "job asked to be refired immediately"
                        );
                        continue;
                    }
                    if directives.unschedules() {
                        self.unschedule(&key, directives);
                    }
                    break FiringResult::Failed(directives);
                }
            }
        };

        self.record(FiringRecord {
            key,
            fire_instance_id,
            result,
            refire_count,
        });
    }
}

/// Removes the in-flight entry and wakes idle waiters, also when the firing
/// task panics.
struct InFlightGuard {
    inner: Arc<Inner>,
    fire_instance_id: FireInstanceId,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.inner.executing.remove(&self.fire_instance_id);
        if self.inner.in_flight.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.inner.idle.notify_waiters();
        }
    }
}

#[async_trait]
impl SchedulerEngine for LocalEngine {
    fn scheduler_name(&self) -> &str {
        &self.inner.config.scheduler_name
    }

    fn instance_id(&self) -> &str {
        &self.inner.config.instance_id
    }

    async fn start(&self, token: &CancellationToken) -> Result<(), EngineError> {
        if token.is_cancelled() {
            return Err(EngineError::Cancelled);
        }
        let mut lifecycle = self.inner.lifecycle();
        if lifecycle.shutdown {
            return Err(EngineError::Shutdown(self.inner.config.scheduler_name.clone()));
        }
        lifecycle.started = true;
        lifecycle.standby = false;
        info!(
            scheduler = %self.inner.config.scheduler_name,
            instance_id = %self.inner.config.instance_id,
            "scheduler started"
        );
        Ok(())
    }

    async fn start_delayed(
        &self,
        delay: Duration,
        token: &CancellationToken,
    ) -> Result<(), EngineError> {
        self.inner.ensure_not_shutdown()?;
        tokio::select! {
            _ = token.cancelled() => Err(EngineError::Cancelled),
            _ = tokio::time::sleep(delay) => self.start(token).await,
        }
    }

    async fn standby(&self, _token: &CancellationToken) -> Result<(), EngineError> {
        let mut lifecycle = self.inner.lifecycle();
        if lifecycle.shutdown {
            return Err(EngineError::Shutdown(self.inner.config.scheduler_name.clone()));
        }
        lifecycle.standby = true;
        debug!(scheduler = %self.inner.config.scheduler_name, "scheduler in standby");
        Ok(())
    }

    async fn shutdown(
        &self,
        wait_for_jobs: bool,
        token: &CancellationToken,
    ) -> Result<(), EngineError> {
        {
            let mut lifecycle = self.inner.lifecycle();
            if lifecycle.shutdown {
                debug!(scheduler = %self.inner.config.scheduler_name, "scheduler already shut down");
                return Ok(());
            }
            lifecycle.shutdown = true;
            lifecycle.started = false;
            lifecycle.standby = false;
        }

        let in_flight = self.inner.in_flight.load(Ordering::SeqCst);
        info!(
            scheduler = %self.inner.config.scheduler_name,
            wait_for_jobs,
            in_flight,
            "scheduler shutting down"
        );

        if wait_for_jobs {
            tokio::select! {
                _ = token.cancelled() => {
                    warn!(
                        scheduler = %self.inner.config.scheduler_name,
                        "stopped waiting for in-flight jobs; shutdown cancelled"
                    );
                    return Err(EngineError::Cancelled);
                }
                _ = self.inner.wait_for_idle() => {}
            }
        }

        info!(scheduler = %self.inner.config.scheduler_name, "scheduler shut down");
        Ok(())
    }

    fn is_started(&self) -> bool {
        self.inner.lifecycle().started
    }

    fn is_shutdown(&self) -> bool {
        self.inner.lifecycle().shutdown
    }

    fn in_standby_mode(&self) -> bool {
        self.inner.lifecycle().standby
    }

    async fn add_job(&self, detail: JobDetail, replace: bool) -> Result<(), EngineError> {
        self.inner.ensure_not_shutdown()?;
        let mut jobs = self.inner.jobs_write();
        if jobs.contains_key(&detail.key) && !replace {
            return Err(EngineError::JobAlreadyExists(detail.key));
        }
        debug!(
            scheduler = %self.inner.config.scheduler_name,
            job = %detail.key,
            job_type = %detail.job_type,
            "job stored"
        );
        let key = detail.key.clone();
        let paused = jobs.get(&key).map(|j| j.paused).unwrap_or(false);
        jobs.insert(
            key,
            StoredJob {
                detail,
                paused,
                gate: Arc::new(tokio::sync::Mutex::new(())),
            },
        );
        Ok(())
    }

    async fn delete_job(&self, key: &JobKey) -> Result<bool, EngineError> {
        Ok(self.inner.jobs_write().remove(key).is_some())
    }

    async fn check_exists(&self, key: &JobKey) -> Result<bool, EngineError> {
        Ok(self.inner.jobs_read().contains_key(key))
    }

    async fn job_keys(&self) -> Result<Vec<JobKey>, EngineError> {
        let mut keys: Vec<JobKey> = self.inner.jobs_read().keys().cloned().collect();
        keys.sort();
        Ok(keys)
    }

    async fn job_detail(&self, key: &JobKey) -> Result<Option<JobDetail>, EngineError> {
        Ok(self.inner.jobs_read().get(key).map(|j| j.detail.clone()))
    }

    async fn trigger_job(
        &self,
        key: &JobKey,
        data: JobDataMap,
    ) -> Result<FireInstanceId, EngineError> {
        let fire_instance_id = FireInstanceId::new();
        let cancellation = CancellationToken::new();

        // The firing is counted while the lifecycle lock is held, so a
        // concurrent shutdown either rejects it or waits for it.
        let (detail, gate) = {
            let lifecycle = self.inner.lifecycle();
            self.inner.check_running(&lifecycle)?;

            let (detail, gate) = {
                let jobs = self.inner.jobs_read();
                let stored = jobs
                    .get(key)
                    .ok_or_else(|| EngineError::JobNotFound(key.clone()))?;
                if stored.paused || self.inner.paused_all.load(Ordering::SeqCst) {
                    return Err(EngineError::JobPaused(key.clone()));
                }
                (stored.detail.clone(), stored.gate.clone())
            };

            self.inner.executing.insert(
                fire_instance_id,
                InFlight {
                    job_key: key.clone(),
                    fired_at: Utc::now(),
                    refire_count: AtomicU64::new(0),
                    cancellation: cancellation.clone(),
                },
            );
            self.inner.in_flight.fetch_add(1, Ordering::SeqCst);
            drop(lifecycle);
            (detail, gate)
        };
        self.inner.fired.fetch_add(1, Ordering::Relaxed);

        let guard = InFlightGuard {
            inner: self.inner.clone(),
            fire_instance_id,
        };
        let inner = self.inner.clone();
        debug!(
            scheduler = %self.inner.config.scheduler_name,
            job = %key,
            fire_instance = %fire_instance_id,
            "job triggered"
        );
        tokio::spawn(async move {
            let _guard = guard;
            inner
                .run_firing(detail, data, fire_instance_id, cancellation, gate)
                .await;
        });

        Ok(fire_instance_id)
    }

    async fn pause_job(&self, key: &JobKey) -> Result<(), EngineError> {
        let mut jobs = self.inner.jobs_write();
        let stored = jobs
            .get_mut(key)
            .ok_or_else(|| EngineError::JobNotFound(key.clone()))?;
        stored.paused = true;
        Ok(())
    }

    async fn resume_job(&self, key: &JobKey) -> Result<(), EngineError> {
        let mut jobs = self.inner.jobs_write();
        let stored = jobs
            .get_mut(key)
            .ok_or_else(|| EngineError::JobNotFound(key.clone()))?;
        stored.paused = false;
        Ok(())
    }

    async fn pause_all(&self) -> Result<(), EngineError> {
        self.inner.paused_all.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn resume_all(&self) -> Result<(), EngineError> {
        self.inner.paused_all.store(false, Ordering::SeqCst);
        for stored in self.inner.jobs_write().values_mut() {
            stored.paused = false;
        }
        Ok(())
    }

    async fn is_job_paused(&self, key: &JobKey) -> Result<bool, EngineError> {
        let jobs = self.inner.jobs_read();
        let stored = jobs
            .get(key)
            .ok_or_else(|| EngineError::JobNotFound(key.clone()))?;
        Ok(stored.paused || self.inner.paused_all.load(Ordering::SeqCst))
    }

    async fn interrupt(&self, key: &JobKey) -> Result<bool, EngineError> {
        let mut interrupted = false;
        for entry in self.inner.executing.iter() {
            if &entry.job_key == key {
                entry.cancellation.cancel();
                interrupted = true;
            }
        }
        if interrupted {
            info!(scheduler = %self.inner.config.scheduler_name, job = %key, "job interrupted");
        }
        Ok(interrupted)
    }

    async fn currently_executing(&self) -> Result<Vec<ExecutingJob>, EngineError> {
        let mut executing: Vec<ExecutingJob> = self
            .inner
            .executing
            .iter()
            .map(|entry| ExecutingJob {
                key: entry.job_key.clone(),
                fire_instance_id: *entry.key(),
                fired_at: entry.fired_at,
                refire_count: entry.refire_count.load(Ordering::Relaxed) as u32,
            })
            .collect();
        executing.sort_by_key(|e| e.fired_at);
        Ok(executing)
    }

    async fn clear(&self) -> Result<(), EngineError> {
        self.inner.jobs_write().clear();
        Ok(())
    }
}

/// Builds [`LocalEngine`]s from scheduler properties.
#[derive(Debug, Clone, Copy, Default)]
pub struct LocalEngineFactory;

impl EngineFactory for LocalEngineFactory {
    fn create(
        &self,
        properties: &SchedulerProperties,
        job_factory: Arc<dyn JobFactory>,
    ) -> Result<Arc<dyn SchedulerEngine>, EngineError> {
        let config = LocalEngineConfig::from_properties(properties)?;
        Ok(Arc::new(LocalEngine::new(config, job_factory)))
    }
}
