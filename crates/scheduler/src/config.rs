//! Scheduler configuration.
//!
//! ## Sources
//!
//! - explicit properties passed to the facility builder
//! - a named section of a [`ConfigSource`], loaded from JSON, a file or the
//!   environment (`JOBSCOPE_<SECTION>__<KEY>`)
//!
//! Section values and explicit values are merged; explicit values win.

use std::collections::BTreeMap;
use std::path::Path;

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

/// Property naming the scheduler instance. Required.
pub const INSTANCE_NAME_KEY: &str = "scheduler.instanceName";
/// Property naming the instance id. Optional.
pub const INSTANCE_ID_KEY: &str = "scheduler.instanceId";
/// Upper bound on immediate refires of one firing. Optional.
pub const MAX_IMMEDIATE_REFIRES_KEY: &str = "scheduler.maxImmediateRefires";
/// Number of firing records the local engine keeps. Optional.
pub const HISTORY_LIMIT_KEY: &str = "scheduler.historyLimit";

/// Prefix of environment variables read by [`ConfigSource::from_env`].
pub const ENV_PREFIX: &str = "JOBSCOPE_";

/// Configuration error.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("no properties found to configure scheduler '{0}'")]
    NoProperties(String),
    #[error("property scheduler.instanceName not found to configure scheduler '{0}'")]
    MissingInstanceName(String),
    #[error("a scheduler named '{0}' is already registered")]
    DuplicateInstanceName(String),
    #[error("invalid value for {key}: {reason}")]
    InvalidValue { key: String, reason: String },
    #[error("invalid configuration document: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("failed to read configuration file {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to create scheduler '{name}': {reason}")]
    EngineCreation { name: String, reason: String },
}

/// Ordered string properties of one scheduler.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SchedulerProperties(BTreeMap<String, String>);

impl SchedulerProperties {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style insert.
    pub fn with(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.set(key, value);
        self
    }

    pub fn set(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.0.insert(key.into(), value.into());
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(String::as_str)
    }

    pub fn instance_name(&self) -> Option<&str> {
        self.get(INSTANCE_NAME_KEY)
    }

    /// Parse a property, `Ok(None)` when absent.
    pub fn parse<T>(&self, key: &str) -> Result<Option<T>, ConfigError>
    where
        T: std::str::FromStr,
        T::Err: std::fmt::Display,
    {
        self.get(key)
            .map(|raw| {
                raw.trim().parse::<T>().map_err(|e| ConfigError::InvalidValue {
                    key: key.to_string(),
                    reason: e.to_string(),
                })
            })
            .transpose()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// Overlay `explicit` on `self`; keys present in both take the explicit value.
    pub fn merged_with(&self, explicit: &SchedulerProperties) -> SchedulerProperties {
        let mut merged = self.clone();
        for (k, v) in &explicit.0 {
            merged.0.insert(k.clone(), v.clone());
        }
        merged
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for SchedulerProperties {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self(
            iter.into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        )
    }
}

/// Check properties before a scheduler is created from them.
///
/// `label` identifies the scheduler being configured in error messages;
/// `is_registered` reports whether an instance name is already taken.
/// Returns the instance name.
pub fn check_properties(
    properties: &SchedulerProperties,
    label: &str,
    is_registered: impl Fn(&str) -> bool,
) -> Result<String, ConfigError> {
    if properties.is_empty() {
        return Err(ConfigError::NoProperties(label.to_string()));
    }
    let name = properties
        .instance_name()
        .map(str::trim)
        .filter(|name| !name.is_empty())
        .ok_or_else(|| ConfigError::MissingInstanceName(label.to_string()))?;
    if is_registered(name) {
        return Err(ConfigError::DuplicateInstanceName(name.to_string()));
    }
    Ok(name.to_string())
}

/// Named property sections.
///
/// Section names are case-insensitive; keys are kept as written.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConfigSource {
    sections: BTreeMap<String, SchedulerProperties>,
}

impl ConfigSource {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse a JSON object of sections, each an object of scalar values.
    ///
    /// Numbers and booleans are stored in their JSON text form.
    pub fn from_json_str(document: &str) -> Result<Self, ConfigError> {
        let raw: BTreeMap<String, BTreeMap<String, JsonValue>> = serde_json::from_str(document)?;
        let mut source = Self::new();
        for (section, values) in raw {
            let mut properties = SchedulerProperties::new();
            for (key, value) in values {
                let text = match value {
                    JsonValue::String(s) => s,
                    JsonValue::Number(_) | JsonValue::Bool(_) => value.to_string(),
                    other => {
                        return Err(ConfigError::InvalidValue {
                            key: format!("{section}.{key}"),
                            reason: format!("expected a scalar, found {other}"),
                        });
                    }
                };
                properties.set(key, text);
            }
            source.insert_section(section, properties);
        }
        Ok(source)
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let document = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_json_str(&document)
    }

    /// Read `JOBSCOPE_<SECTION>__<KEY>` variables from the process environment.
    pub fn from_env() -> Self {
        Self::from_vars(std::env::vars())
    }

    /// Same mapping as [`from_env`](Self::from_env) over any variable list.
    ///
    /// `_` inside the key becomes `.`, so
    /// `JOBSCOPE_REPORTS__scheduler_instanceName=reports` sets
    /// `scheduler.instanceName` in section `reports`.
    pub fn from_vars<I, K, V>(vars: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: Into<String>,
    {
        let mut source = Self::new();
        for (name, value) in vars {
            let Some(rest) = name.as_ref().strip_prefix(ENV_PREFIX) else {
                continue;
            };
            let Some((section, key)) = rest.split_once("__") else {
                continue;
            };
            if section.is_empty() || key.is_empty() {
                continue;
            }
            source
                .sections
                .entry(section.to_ascii_lowercase())
                .or_default()
                .set(key.replace('_', "."), value);
        }
        source
    }

    pub fn insert_section(&mut self, name: impl AsRef<str>, properties: SchedulerProperties) {
        self.sections
            .insert(name.as_ref().to_ascii_lowercase(), properties);
    }

    /// Properties of `name`; empty when the section does not exist.
    pub fn section(&self, name: &str) -> SchedulerProperties {
        self.sections
            .get(&name.to_ascii_lowercase())
            .cloned()
            .unwrap_or_default()
    }

    pub fn has_section(&self, name: &str) -> bool {
        self.sections.contains_key(&name.to_ascii_lowercase())
    }

    /// Layer `other` over `self`, section by section (other wins per key).
    pub fn layered_with(&self, other: &ConfigSource) -> ConfigSource {
        let mut layered = self.clone();
        for (name, properties) in &other.sections {
            let merged = layered.section(name).merged_with(properties);
            layered.sections.insert(name.clone(), merged);
        }
        layered
    }
}
