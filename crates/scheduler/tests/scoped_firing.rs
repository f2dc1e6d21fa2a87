use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;
use tokio::sync::{Barrier, Notify};
use tokio_util::sync::CancellationToken;

use jobscope_core::{JobDataMap, JobDetail, JobKey, ScopeId};
use jobscope_runtime::{Disposable, InstantiationError, Job, JobFactory, JobRunContext};
use jobscope_scheduler::{
    INSTANCE_NAME_KEY, SchedulerEngine, SchedulerFacade, SchedulerFacility, SchedulerProperties,
};

type Log = Arc<Mutex<Vec<String>>>;

struct Resource {
    name: &'static str,
    log: Log,
}

impl Resource {
    fn new(name: &'static str, log: &Log) -> Arc<Self> {
        Arc::new(Self {
            name,
            log: log.clone(),
        })
    }
}

impl Disposable for Resource {
    fn name(&self) -> &str {
        self.name
    }

    fn dispose(&self) -> anyhow::Result<()> {
        self.log.lock().unwrap().push(self.name.to_string());
        Ok(())
    }
}

struct SendReport {
    sent_to: Log,
    fail: bool,
}

#[async_trait]
impl Job for SendReport {
    async fn execute(&self, ctx: &JobRunContext) -> anyhow::Result<()> {
        if self.fail {
            anyhow::bail!("smtp relay unavailable");
        }
        let recipient = ctx.job_data().get_str("recipient").unwrap_or("nobody");
        self.sent_to.lock().unwrap().push(recipient.to_string());
        Ok(())
    }
}

fn properties(name: &str) -> SchedulerProperties {
    SchedulerProperties::new().with(INSTANCE_NAME_KEY, name)
}

fn send_report_facility(log: &Log, sent_to: &Log, fail: bool) -> SchedulerFacility {
    let (log, sent_to) = (log.clone(), sent_to.clone());
    SchedulerFacility::builder()
        .use_properties(properties("main"))
        .add_scoped_job("SendReport", move |ctx| {
            ctx.register(Resource::new("db-handle", &log))?;
            ctx.register(Resource::new("report-writer", &log))?;
            Ok(Arc::new(SendReport {
                sent_to: sent_to.clone(),
                fail,
            }) as Arc<dyn Job>)
        })
        .build()
        .unwrap()
}

async fn add_job(facility: &SchedulerFacility, name: &str, type_name: &str) -> JobKey {
    let key = JobKey::new(name).unwrap();
    let detail = JobDetail::new(key.clone(), facility.descriptor_for(type_name).unwrap());
    facility
        .default_scheduler()
        .add_job(detail, false)
        .await
        .unwrap();
    key
}

#[tokio::test]
async fn send_report_releases_resources_in_reverse_order() {
    jobscope_observability::init();
    let (log, sent_to) = (Log::default(), Log::default());
    let facility = send_report_facility(&log, &sent_to, false);
    let token = CancellationToken::new();
    assert!(facility.start(&token).await.all_started());

    let key = add_job(&facility, "send-report", "SendReport").await;
    facility
        .default_scheduler()
        .trigger_job(&key, JobDataMap::new().with("recipient", json!("ops@example.com")))
        .await
        .unwrap();
    facility.shutdown(&token).await.unwrap();

    assert_eq!(*sent_to.lock().unwrap(), vec!["ops@example.com"]);
    assert_eq!(*log.lock().unwrap(), vec!["report-writer", "db-handle"]);
    let stats = facility.scoped_registry().stats();
    assert_eq!((stats.bound, stats.unbound, stats.active), (1, 1, 0));
}

#[tokio::test]
async fn failed_firing_still_releases_scope() {
    jobscope_observability::init();
    let (log, sent_to) = (Log::default(), Log::default());
    let facility = send_report_facility(&log, &sent_to, true);
    let token = CancellationToken::new();
    facility.start(&token).await;

    let key = add_job(&facility, "send-report", "SendReport").await;
    facility
        .default_scheduler()
        .trigger_job(&key, JobDataMap::new())
        .await
        .unwrap();
    facility.shutdown(&token).await.unwrap();

    assert!(sent_to.lock().unwrap().is_empty());
    assert_eq!(*log.lock().unwrap(), vec!["report-writer", "db-handle"]);
    assert_eq!(facility.scoped_registry().active_count(), 0);
}

#[tokio::test]
async fn unscoped_job_never_touches_the_registry() {
    jobscope_observability::init();
    let ran = Arc::new(AtomicBool::new(false));

    struct Cleanup(Arc<AtomicBool>);

    #[async_trait]
    impl Job for Cleanup {
        async fn execute(&self, ctx: &JobRunContext) -> anyhow::Result<()> {
            assert!(ctx.scope().is_none());
            self.0.store(true, Ordering::SeqCst);
            Ok(())
        }
    }

    let flag = ran.clone();
    let facility = SchedulerFacility::builder()
        .use_properties(properties("main"))
        .add_job("Cleanup", move |_| Ok(Arc::new(Cleanup(flag.clone())) as Arc<dyn Job>))
        .build()
        .unwrap();
    let token = CancellationToken::new();
    facility.start(&token).await;

    let key = add_job(&facility, "cleanup", "Cleanup").await;
    facility
        .default_scheduler()
        .trigger_job(&key, JobDataMap::new())
        .await
        .unwrap();
    facility.shutdown(&token).await.unwrap();

    assert!(ran.load(Ordering::SeqCst));
    let stats = facility.scoped_registry().stats();
    assert_eq!((stats.bound, stats.unbound, stats.unknown_unbinds), (0, 0, 0));
}

#[tokio::test]
async fn failing_dependency_closes_scope_before_the_error_surfaces() {
    jobscope_observability::init();
    let log = Log::default();
    let ctor_log = log.clone();
    let facility = SchedulerFacility::builder()
        .use_properties(properties("main"))
        .add_scoped_job("SendReport", move |ctx| {
            ctx.register(Resource::new("db-handle", &ctor_log))?;
            anyhow::bail!("report template store unreachable")
        })
        .build()
        .unwrap();

    let detail = JobDetail::new(
        JobKey::new("send-report").unwrap(),
        facility.descriptor_for("SendReport").unwrap(),
    );
    let err = facility.job_factory().new_job(&detail, "main").unwrap_err();

    assert!(matches!(err, InstantiationError::Resolve { .. }));
    assert_eq!(*log.lock().unwrap(), vec!["db-handle"]);
    assert_eq!(facility.scoped_registry().stats().bound, 0);
}

#[tokio::test]
async fn concurrent_firings_get_independent_scopes() {
    jobscope_observability::init();

    struct Rendezvous {
        barrier: Arc<Barrier>,
        scopes: Arc<Mutex<Vec<ScopeId>>>,
    }

    #[async_trait]
    impl Job for Rendezvous {
        async fn execute(&self, ctx: &JobRunContext) -> anyhow::Result<()> {
            let scope = ctx
                .scope()
                .ok_or_else(|| anyhow::anyhow!("scoped job ran without a scope"))?;
            self.scopes.lock().unwrap().push(scope.id());
            self.barrier.wait().await;
            Ok(())
        }
    }

    let barrier = Arc::new(Barrier::new(2));
    let scopes = Arc::new(Mutex::new(Vec::new()));
    let (ctor_barrier, ctor_scopes) = (barrier.clone(), scopes.clone());
    let facility = SchedulerFacility::builder()
        .use_properties(properties("main"))
        .add_scoped_job("Rendezvous", move |_| {
            Ok(Arc::new(Rendezvous {
                barrier: ctor_barrier.clone(),
                scopes: ctor_scopes.clone(),
            }) as Arc<dyn Job>)
        })
        .build()
        .unwrap();
    let token = CancellationToken::new();
    facility.start(&token).await;

    let key = add_job(&facility, "rendezvous", "Rendezvous").await;
    let scheduler = facility.default_scheduler();
    let first = scheduler.trigger_job(&key, JobDataMap::new()).await.unwrap();
    let second = scheduler.trigger_job(&key, JobDataMap::new()).await.unwrap();
    assert_ne!(first, second);

    tokio::time::timeout(Duration::from_secs(5), facility.shutdown(&token))
        .await
        .unwrap()
        .unwrap();

    let scopes = scopes.lock().unwrap();
    assert_eq!(scopes.len(), 2);
    assert_ne!(scopes[0], scopes[1]);
    let stats = facility.scoped_registry().stats();
    assert_eq!((stats.bound, stats.unbound, stats.active), (2, 2, 0));
}

struct Gated {
    gate: Arc<Notify>,
    finished: Arc<AtomicBool>,
}

#[async_trait]
impl Job for Gated {
    async fn execute(&self, _ctx: &JobRunContext) -> anyhow::Result<()> {
        self.gate.notified().await;
        self.finished.store(true, Ordering::SeqCst);
        Ok(())
    }
}

fn gated_facility(gate: &Arc<Notify>, finished: &Arc<AtomicBool>, wait: bool) -> SchedulerFacility {
    let (gate, finished) = (gate.clone(), finished.clone());
    SchedulerFacility::builder()
        .use_properties(properties("main"))
        .use_wait_for_jobs_to_complete_at_shutdown(wait)
        .add_job("Gated", move |_| {
            Ok(Arc::new(Gated {
                gate: gate.clone(),
                finished: finished.clone(),
            }) as Arc<dyn Job>)
        })
        .build()
        .unwrap()
}

#[tokio::test]
async fn shutdown_waits_for_in_flight_jobs_when_configured() {
    jobscope_observability::init();
    let (gate, finished) = (Arc::new(Notify::new()), Arc::new(AtomicBool::new(false)));
    let facility = gated_facility(&gate, &finished, true);
    let token = CancellationToken::new();
    facility.start(&token).await;

    let key = add_job(&facility, "gated", "Gated").await;
    facility
        .default_scheduler()
        .trigger_job(&key, JobDataMap::new())
        .await
        .unwrap();

    let opener = {
        let gate = gate.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            gate.notify_one();
        })
    };
    facility.shutdown(&token).await.unwrap();

    assert!(finished.load(Ordering::SeqCst));
    opener.await.unwrap();
}

#[tokio::test]
async fn shutdown_without_waiting_returns_while_jobs_run() {
    jobscope_observability::init();
    let (gate, finished) = (Arc::new(Notify::new()), Arc::new(AtomicBool::new(false)));
    let facility = gated_facility(&gate, &finished, false);
    let token = CancellationToken::new();
    facility.start(&token).await;

    let key = add_job(&facility, "gated", "Gated").await;
    let scheduler = facility.default_scheduler().clone();
    scheduler.trigger_job(&key, JobDataMap::new()).await.unwrap();

    facility.shutdown(&token).await.unwrap();
    assert!(!finished.load(Ordering::SeqCst));
    assert_eq!(scheduler.currently_executing().await.unwrap().len(), 1);

    gate.notify_one();
    for _ in 0..100 {
        if scheduler.currently_executing().await.unwrap().is_empty() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(finished.load(Ordering::SeqCst));
}

#[tokio::test]
async fn interrupted_job_is_cancelled_and_released() {
    jobscope_observability::init();
    let log = Log::default();

    struct Patient;

    #[async_trait]
    impl Job for Patient {
        async fn pre_execute(&self, ctx: &JobRunContext) -> anyhow::Result<()> {
            ctx.cancellation_token().cancelled().await;
            Ok(())
        }

        async fn execute(&self, _ctx: &JobRunContext) -> anyhow::Result<()> {
            anyhow::bail!("must not run after cancellation")
        }
    }

    let ctor_log = log.clone();
    let facility = SchedulerFacility::builder()
        .use_properties(properties("main"))
        .add_scoped_job("Patient", move |ctx| {
            ctx.register(Resource::new("lease", &ctor_log))?;
            Ok(Arc::new(Patient) as Arc<dyn Job>)
        })
        .build()
        .unwrap();
    let token = CancellationToken::new();
    facility.start(&token).await;

    let key = add_job(&facility, "patient", "Patient").await;
    let scheduler = facility.default_scheduler();
    scheduler.trigger_job(&key, JobDataMap::new()).await.unwrap();
    tokio::task::yield_now().await;

    assert!(scheduler.interrupt(&key).await.unwrap());
    facility.shutdown(&token).await.unwrap();

    assert_eq!(*log.lock().unwrap(), vec!["lease"]);
    assert_eq!(facility.scoped_registry().active_count(), 0);
    // Still stored: a cancelled firing carries no unschedule directive.
    assert!(scheduler.check_exists(&key).await.unwrap());
}

#[test]
fn blocking_start_and_stop_outside_a_runtime() {
    jobscope_observability::init();
    let (log, sent_to) = (Log::default(), Log::default());
    let facility = send_report_facility(&log, &sent_to, false);
    let scheduler: &SchedulerFacade = facility.default_scheduler();

    scheduler.start().unwrap();
    assert!(scheduler.is_started());

    scheduler.stop().unwrap();
    assert!(scheduler.is_shutdown());
}
