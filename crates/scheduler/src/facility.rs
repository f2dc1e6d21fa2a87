//! Scheduler facility: wires job registrations, the scoped registry, the job
//! factory and one or more scheduler engines together.
//!
//! ```ignore
//! let facility = SchedulerFacility::builder()
//!     .use_properties(SchedulerProperties::new().with(INSTANCE_NAME_KEY, "main"))
//!     .add_scoped_job("SendReport", |ctx| { /* register resources, build job */ })
//!     .build()?;
//! facility.start(&token).await;
//! ```

use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use jobscope_core::JobTypeDescriptor;
use jobscope_runtime::{
    Job, JobConstructor, JobContainer, JobFactory, JobFactoryListener, Lifestyle, ResolveContext,
    ScopedJobFactory, ScopedJobRegistry,
};

use crate::config::{ConfigError, ConfigSource, SchedulerProperties, check_properties};
use crate::engine::{EngineError, EngineFactory, SchedulerEngine};
use crate::facade::SchedulerFacade;
use crate::local::LocalEngineFactory;
use crate::startup::{SchedulerRegistry, SchedulerStartupCoordinator, StartupReport};

/// A scheduler configured next to the default one.
#[derive(Debug, Clone)]
pub struct AdditionalScheduler {
    section: Option<String>,
    properties: SchedulerProperties,
    wait_for_jobs_to_complete_at_shutdown: bool,
    start_scheduler: bool,
}

impl AdditionalScheduler {
    /// Scheduler configured from explicit properties only.
    pub fn new(properties: SchedulerProperties) -> Self {
        Self {
            section: None,
            properties,
            wait_for_jobs_to_complete_at_shutdown: true,
            start_scheduler: false,
        }
    }

    /// Scheduler configured from a section of the facility's config source.
    pub fn from_section(section: impl Into<String>) -> Self {
        Self {
            section: Some(section.into()),
            ..Self::new(SchedulerProperties::new())
        }
    }

    /// Explicit properties; they win over section values.
    pub fn with_properties(mut self, properties: SchedulerProperties) -> Self {
        self.properties = properties;
        self
    }

    pub fn wait_for_jobs_to_complete_at_shutdown(mut self, wait: bool) -> Self {
        self.wait_for_jobs_to_complete_at_shutdown = wait;
        self
    }

    /// Include this scheduler in the startup sequence.
    pub fn start_scheduler(mut self, start: bool) -> Self {
        self.start_scheduler = start;
        self
    }
}

struct JobRegistration {
    type_name: String,
    lifestyle: Option<Lifestyle>,
    constructor: JobConstructor,
}

/// Builder for [`SchedulerFacility`].
pub struct SchedulerFacilityBuilder {
    jobs: Vec<JobRegistration>,
    config: Option<(ConfigSource, String)>,
    properties: SchedulerProperties,
    wait_for_jobs_to_complete_at_shutdown: bool,
    default_lifestyle: Lifestyle,
    additional: Vec<AdditionalScheduler>,
    engine_factory: Arc<dyn EngineFactory>,
    listener: Option<Arc<dyn JobFactoryListener>>,
}

impl Default for SchedulerFacilityBuilder {
    fn default() -> Self {
        Self {
            jobs: Vec::new(),
            config: None,
            properties: SchedulerProperties::new(),
            wait_for_jobs_to_complete_at_shutdown: true,
            default_lifestyle: Lifestyle::Transient,
            additional: Vec::new(),
            engine_factory: Arc::new(LocalEngineFactory),
            listener: None,
        }
    }
}

impl SchedulerFacilityBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a job type that runs without a scope. Its lifestyle is the
    /// facility default unless set with [`use_lifestyle_for_jobs`].
    ///
    /// [`use_lifestyle_for_jobs`]: Self::use_lifestyle_for_jobs
    pub fn add_job<F>(self, type_name: impl Into<String>, constructor: F) -> Self
    where
        F: Fn(&ResolveContext<'_>) -> anyhow::Result<Arc<dyn Job>> + Send + Sync + 'static,
    {
        self.push_job(type_name.into(), None, Arc::new(constructor))
    }

    pub fn add_job_with_lifestyle<F>(
        self,
        type_name: impl Into<String>,
        lifestyle: Lifestyle,
        constructor: F,
    ) -> Self
    where
        F: Fn(&ResolveContext<'_>) -> anyhow::Result<Arc<dyn Job>> + Send + Sync + 'static,
    {
        self.push_job(type_name.into(), Some(lifestyle), Arc::new(constructor))
    }

    /// Register a job type that gets a fresh resource scope per firing.
    pub fn add_scoped_job<F>(self, type_name: impl Into<String>, constructor: F) -> Self
    where
        F: Fn(&ResolveContext<'_>) -> anyhow::Result<Arc<dyn Job>> + Send + Sync + 'static,
    {
        self.push_job(type_name.into(), Some(Lifestyle::Scoped), Arc::new(constructor))
    }

    fn push_job(
        mut self,
        type_name: String,
        lifestyle: Option<Lifestyle>,
        constructor: JobConstructor,
    ) -> Self {
        self.jobs.push(JobRegistration {
            type_name,
            lifestyle,
            constructor,
        });
        self
    }

    /// Explicit properties of the default scheduler.
    pub fn use_properties(mut self, properties: SchedulerProperties) -> Self {
        self.properties = properties;
        self
    }

    /// Read the default scheduler's properties from `section` of `source`.
    /// Additional schedulers configured by section read from the same source.
    pub fn use_config_section(mut self, source: ConfigSource, section: impl Into<String>) -> Self {
        self.config = Some((source, section.into()));
        self
    }

    pub fn use_wait_for_jobs_to_complete_at_shutdown(mut self, wait: bool) -> Self {
        self.wait_for_jobs_to_complete_at_shutdown = wait;
        self
    }

    /// Lifestyle for unscoped jobs registered without one.
    pub fn use_lifestyle_for_jobs(mut self, lifestyle: Lifestyle) -> Self {
        self.default_lifestyle = lifestyle;
        self
    }

    pub fn use_additional_scheduler(mut self, scheduler: AdditionalScheduler) -> Self {
        self.additional.push(scheduler);
        self
    }

    pub fn use_engine_factory(mut self, factory: Arc<dyn EngineFactory>) -> Self {
        self.engine_factory = factory;
        self
    }

    pub fn use_job_factory_listener(mut self, listener: Arc<dyn JobFactoryListener>) -> Self {
        self.listener = Some(listener);
        self
    }

    fn section_properties(&self, section: &str) -> SchedulerProperties {
        self.config
            .as_ref()
            .map(|(source, _)| source.section(section))
            .unwrap_or_default()
    }

    pub fn build(self) -> Result<SchedulerFacility, ConfigError> {
        let container = JobContainer::arc();
        for job in &self.jobs {
            let lifestyle = job.lifestyle.unwrap_or(self.default_lifestyle);
            let constructor = job.constructor.clone();
            container.register(job.type_name.clone(), lifestyle, move |ctx: &ResolveContext<'_>| {
                constructor(ctx)
            });
        }

        let scoped_registry = Arc::new(ScopedJobRegistry::new());
        let mut factory = ScopedJobFactory::new(container.clone(), scoped_registry.clone());
        if let Some(listener) = &self.listener {
            factory = factory.with_listener(listener.clone());
        }
        let job_factory: Arc<dyn JobFactory> = Arc::new(factory);

        let schedulers = Arc::new(SchedulerRegistry::new());
        let mut order = Vec::new();
        let mut startup = Vec::new();

        let default_properties = match &self.config {
            Some((_, section)) => self.section_properties(section).merged_with(&self.properties),
            None => self.properties.clone(),
        };
        let default = self.create_scheduler(
            &default_properties,
            "default scheduler",
            self.wait_for_jobs_to_complete_at_shutdown,
            &job_factory,
            &schedulers,
        )?;
        let default_name = default.scheduler_name().to_string();
        order.push(default_name.clone());
        startup.push(default_name.clone());

        for (index, additional) in self.additional.iter().enumerate() {
            let label = additional
                .section
                .clone()
                .unwrap_or_else(|| format!("additional scheduler #{}", index + 1));
            let properties = match &additional.section {
                Some(section) => self.section_properties(section).merged_with(&additional.properties),
                None => additional.properties.clone(),
            };
            let facade = self.create_scheduler(
                &properties,
                &label,
                additional.wait_for_jobs_to_complete_at_shutdown,
                &job_factory,
                &schedulers,
            )?;
            let name = facade.scheduler_name().to_string();
            if additional.start_scheduler {
                startup.push(name.clone());
            }
            order.push(name);
        }

        info!(
            default_scheduler = %default_name,
            schedulers = order.len(),
            job_types = container.len(),
            "scheduler facility built"
        );

        Ok(SchedulerFacility {
            container,
            scoped_registry,
            job_factory,
            coordinator: SchedulerStartupCoordinator::new(schedulers.clone(), startup),
            schedulers,
            default,
            order,
        })
    }

    fn create_scheduler(
        &self,
        properties: &SchedulerProperties,
        label: &str,
        wait_for_jobs_to_complete_at_shutdown: bool,
        job_factory: &Arc<dyn JobFactory>,
        schedulers: &SchedulerRegistry,
    ) -> Result<Arc<SchedulerFacade>, ConfigError> {
        let name = check_properties(properties, label, |name| schedulers.contains(name))?;
        let engine = self
            .engine_factory
            .create(properties, job_factory.clone())
            .map_err(|e| ConfigError::EngineCreation {
                name: name.clone(),
                reason: e.to_string(),
            })?;
        let facade = Arc::new(SchedulerFacade::new(
            engine,
            wait_for_jobs_to_complete_at_shutdown,
        ));
        schedulers.register(facade.clone())?;
        debug!(scheduler = %name, label, "scheduler created");
        Ok(facade)
    }
}

/// Built facility. Owns the scoped registry for its whole lifetime.
pub struct SchedulerFacility {
    container: Arc<JobContainer>,
    scoped_registry: Arc<ScopedJobRegistry>,
    job_factory: Arc<dyn JobFactory>,
    schedulers: Arc<SchedulerRegistry>,
    coordinator: SchedulerStartupCoordinator,
    default: Arc<SchedulerFacade>,
    /// Registration order; shutdown runs in reverse.
    order: Vec<String>,
}

impl SchedulerFacility {
    pub fn builder() -> SchedulerFacilityBuilder {
        SchedulerFacilityBuilder::new()
    }

    pub fn default_scheduler(&self) -> &Arc<SchedulerFacade> {
        &self.default
    }

    pub fn scheduler(&self, name: &str) -> Option<Arc<SchedulerFacade>> {
        self.schedulers.get(name)
    }

    pub fn schedulers(&self) -> &Arc<SchedulerRegistry> {
        &self.schedulers
    }

    pub fn scoped_registry(&self) -> &Arc<ScopedJobRegistry> {
        &self.scoped_registry
    }

    pub fn container(&self) -> &Arc<JobContainer> {
        &self.container
    }

    pub fn job_factory(&self) -> &Arc<dyn JobFactory> {
        &self.job_factory
    }

    pub fn startup_names(&self) -> &[String] {
        self.coordinator.names()
    }

    /// Descriptor for a registered job type; scoped iff its lifestyle is.
    pub fn descriptor_for(&self, type_name: &str) -> Option<JobTypeDescriptor> {
        self.container
            .lifestyle_of(type_name)
            .map(|lifestyle| match lifestyle {
                Lifestyle::Scoped => JobTypeDescriptor::scoped(type_name),
                Lifestyle::Transient | Lifestyle::Singleton => JobTypeDescriptor::unscoped(type_name),
            })
    }

    /// Start the default scheduler and every opted-in additional scheduler.
    pub async fn start(&self, token: &CancellationToken) -> StartupReport {
        self.coordinator.start_schedulers(token).await
    }

    /// Stop every scheduler, last registered first. All schedulers are asked
    /// to stop; the first error is returned.
    pub async fn shutdown(&self, token: &CancellationToken) -> Result<(), EngineError> {
        let mut first_error = None;
        for name in self.order.iter().rev() {
            let Some(facade) = self.schedulers.get(name) else {
                continue;
            };
            if facade.is_shutdown() {
                continue;
            }
            if let Err(e) = facade.stop_async(token).await {
                error!(scheduler = %name, error = %e, "scheduler failed to stop");
                first_error.get_or_insert(e);
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

impl core::fmt::Debug for SchedulerFacility {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("SchedulerFacility")
            .field("default", &self.default.scheduler_name())
            .field("schedulers", &self.order)
            .field("container", &self.container)
            .field("scoped_registry", &self.scoped_registry.stats())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;

    use super::*;
    use crate::config::INSTANCE_NAME_KEY;
    use jobscope_runtime::JobRunContext;

    struct Noop;

    #[async_trait]
    impl Job for Noop {
        async fn execute(&self, _ctx: &JobRunContext) -> anyhow::Result<()> {
            Ok(())
        }
    }

    fn noop(_: &ResolveContext<'_>) -> anyhow::Result<Arc<dyn Job>> {
        Ok(Arc::new(Noop))
    }

    fn named(name: &str) -> SchedulerProperties {
        SchedulerProperties::new().with(INSTANCE_NAME_KEY, name)
    }

    #[test]
    fn missing_properties_are_reported() {
        let err = SchedulerFacility::builder().build().unwrap_err();
        assert!(matches!(err, ConfigError::NoProperties(_)));

        let err = SchedulerFacility::builder()
            .use_properties(SchedulerProperties::new().with("scheduler.threadCount", "4"))
            .build()
            .unwrap_err();
        assert!(matches!(err, ConfigError::MissingInstanceName(_)));
    }

    #[test]
    fn duplicate_additional_scheduler_name_is_rejected() {
        let err = SchedulerFacility::builder()
            .use_properties(named("main"))
            .use_additional_scheduler(AdditionalScheduler::new(named("main")))
            .build()
            .unwrap_err();

        assert!(matches!(err, ConfigError::DuplicateInstanceName(n) if n == "main"));
    }

    #[test]
    fn lifestyles_and_descriptors() {
        let facility = SchedulerFacility::builder()
            .use_properties(named("main"))
            .use_lifestyle_for_jobs(Lifestyle::Singleton)
            .add_job("Cleanup", noop)
            .add_job_with_lifestyle("Audit", Lifestyle::Transient, noop)
            .add_scoped_job("SendReport", noop)
            .build()
            .unwrap();

        let container = facility.container();
        assert_eq!(container.lifestyle_of("Cleanup"), Some(Lifestyle::Singleton));
        assert_eq!(container.lifestyle_of("Audit"), Some(Lifestyle::Transient));
        assert_eq!(container.lifestyle_of("SendReport"), Some(Lifestyle::Scoped));

        assert!(facility.descriptor_for("SendReport").unwrap().requires_scope());
        assert!(!facility.descriptor_for("Cleanup").unwrap().requires_scope());
        assert!(facility.descriptor_for("Unknown").is_none());
    }

    #[test]
    fn config_section_is_overridden_by_explicit_properties() {
        let source = ConfigSource::from_json_str(
            r#"{
                "Scheduler": { "scheduler.instanceName": "from-config", "scheduler.instanceId": "node-7" },
                "Reports": { "scheduler.instanceName": "reports" },
                "Archive": { "scheduler.instanceName": "archive" }
            }"#,
        )
        .unwrap();

        let facility = SchedulerFacility::builder()
            .use_config_section(source, "scheduler")
            .use_properties(named("main"))
            .use_additional_scheduler(AdditionalScheduler::from_section("reports").start_scheduler(true))
            .use_additional_scheduler(AdditionalScheduler::from_section("archive"))
            .build()
            .unwrap();

        let default = facility.default_scheduler();
        assert_eq!(default.scheduler_name(), "main");
        assert_eq!(default.instance_id(), "node-7");
        assert!(facility.scheduler("archive").is_some());
        assert_eq!(facility.startup_names(), ["main".to_string(), "reports".to_string()]);
    }

    #[test]
    fn engine_creation_failure_is_a_config_error() {
        struct Refuse;

        impl EngineFactory for Refuse {
            fn create(
                &self,
                _properties: &SchedulerProperties,
                _job_factory: Arc<dyn JobFactory>,
            ) -> Result<Arc<dyn SchedulerEngine>, EngineError> {
                Err(EngineError::Runtime("no thread pool".into()))
            }
        }

        let err = SchedulerFacility::builder()
            .use_properties(named("main"))
            .use_engine_factory(Arc::new(Refuse))
            .build()
            .unwrap_err();

        assert!(matches!(err, ConfigError::EngineCreation { name, .. } if name == "main"));
    }

    #[tokio::test]
    async fn start_and_shutdown_every_scheduler() {
        let facility = SchedulerFacility::builder()
            .use_properties(named("main"))
            .use_additional_scheduler(AdditionalScheduler::new(named("idle")))
            .build()
            .unwrap();
        let token = CancellationToken::new();

        let report = facility.start(&token).await;
        assert_eq!(report.started, vec!["main".to_string()]);
        assert!(!facility.scheduler("idle").unwrap().is_started());

        facility.shutdown(&token).await.unwrap();
        assert!(facility.default_scheduler().is_shutdown());
        assert!(facility.scheduler("idle").unwrap().is_shutdown());
    }
}
