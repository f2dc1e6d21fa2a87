//! `jobscope-scheduler`: scheduler engines, facade, startup and facility wiring.
//!
//! The engine itself sits behind [`SchedulerEngine`]. [`LocalEngine`] is an
//! in-memory implementation that fires jobs on demand, used in tests and
//! during development.

pub mod config;
pub mod engine;
pub mod facade;
pub mod facility;
pub mod local;
pub mod startup;

pub use config::{
    ConfigError, ConfigSource, ENV_PREFIX, HISTORY_LIMIT_KEY, INSTANCE_ID_KEY, INSTANCE_NAME_KEY,
    MAX_IMMEDIATE_REFIRES_KEY, SchedulerProperties, check_properties,
};
pub use engine::{EngineError, EngineFactory, ExecutingJob, SchedulerEngine};
pub use facade::SchedulerFacade;
pub use facility::{AdditionalScheduler, SchedulerFacility, SchedulerFacilityBuilder};
pub use local::{
    DEFAULT_HISTORY_LIMIT, DEFAULT_INSTANCE_ID, DEFAULT_MAX_IMMEDIATE_REFIRES, FiringRecord, FiringResult, LocalEngine,
    LocalEngineConfig, LocalEngineFactory, LocalEngineStats,
};
pub use startup::{SchedulerRegistry, SchedulerStartupCoordinator, StartupReport};
