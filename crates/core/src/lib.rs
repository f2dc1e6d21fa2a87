//! `jobscope-core`: building blocks shared by the runtime and scheduler crates.
//!
//! This crate contains plain value types only (no async, no infrastructure).

pub mod data_map;
pub mod error;
pub mod id;
pub mod job;

pub use data_map::{JobDataMap, JobDataValue, UNRENDERABLE};
pub use error::{CoreError, CoreResult};
pub use id::{FireInstanceId, JobInstanceId, ScopeId};
pub use job::{DEFAULT_GROUP, JobDetail, JobKey, JobTypeDescriptor};
