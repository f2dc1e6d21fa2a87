//! Job parameter map.
//!
//! Parameters are either JSON values (stringifiable, deserialisable into typed
//! values) or opaque shared objects that only the job itself knows how to use.
//! Opaque values are never stringified; logging renders them as a placeholder.

use std::any::Any;
use std::collections::BTreeMap;
use std::sync::Arc;

use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value as JsonValue;

use crate::error::{CoreError, CoreResult};

/// Rendering used whenever a value cannot be stringified.
pub const UNRENDERABLE: &str = "<object>";

/// A single job parameter.
#[derive(Clone)]
pub enum JobDataValue {
    Json(JsonValue),
    Opaque(Arc<dyn Any + Send + Sync>),
}

impl JobDataValue {
    /// Best-effort string form. Strings render without quotes.
    pub fn render(&self) -> String {
        match self {
            JobDataValue::Json(JsonValue::String(s)) => s.clone(),
            JobDataValue::Json(value) => {
                serde_json::to_string(value).unwrap_or_else(|_| UNRENDERABLE.to_string())
            }
            JobDataValue::Opaque(_) => UNRENDERABLE.to_string(),
        }
    }

    pub fn as_json(&self) -> Option<&JsonValue> {
        match self {
            JobDataValue::Json(v) => Some(v),
            JobDataValue::Opaque(_) => None,
        }
    }
}

impl core::fmt::Debug for JobDataValue {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            JobDataValue::Json(v) => f.debug_tuple("Json").field(v).finish(),
            JobDataValue::Opaque(_) => f.write_str("Opaque(..)"),
        }
    }
}

impl From<JsonValue> for JobDataValue {
    fn from(value: JsonValue) -> Self {
        JobDataValue::Json(value)
    }
}

/// Ordered parameter map attached to job details and triggers.
#[derive(Debug, Clone, Default)]
pub struct JobDataMap {
    entries: BTreeMap<String, JobDataValue>,
}

impl JobDataMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert any serialisable value as JSON.
    pub fn put<T: Serialize>(&mut self, key: impl Into<String>, value: T) -> CoreResult<()> {
        let key = key.into();
        let json = serde_json::to_value(value)
            .map_err(|e| CoreError::data_conversion(key.clone(), e.to_string()))?;
        self.entries.insert(key, JobDataValue::Json(json));
        Ok(())
    }

    pub fn put_json(&mut self, key: impl Into<String>, value: JsonValue) {
        self.entries.insert(key.into(), JobDataValue::Json(value));
    }

    pub fn put_opaque<T: Any + Send + Sync>(&mut self, key: impl Into<String>, value: T) {
        self.entries
            .insert(key.into(), JobDataValue::Opaque(Arc::new(value)));
    }

    /// Builder-style JSON insert.
    pub fn with(mut self, key: impl Into<String>, value: JsonValue) -> Self {
        self.put_json(key, value);
        self
    }

    pub fn get(&self, key: &str) -> Option<&JobDataValue> {
        self.entries.get(key)
    }

    /// Deserialise a JSON entry into `T`. Missing keys yield `Ok(None)`.
    pub fn get_as<T: DeserializeOwned>(&self, key: &str) -> CoreResult<Option<T>> {
        match self.entries.get(key) {
            None => Ok(None),
            Some(JobDataValue::Json(v)) => serde_json::from_value(v.clone())
                .map(Some)
                .map_err(|e| CoreError::data_conversion(key, e.to_string())),
            Some(JobDataValue::Opaque(_)) => Err(CoreError::data_conversion(
                key,
                "value is opaque, use get_opaque",
            )),
        }
    }

    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.entries
            .get(key)
            .and_then(JobDataValue::as_json)
            .and_then(JsonValue::as_str)
    }

    pub fn get_opaque<T: Any + Send + Sync>(&self, key: &str) -> Option<Arc<T>> {
        match self.entries.get(key) {
            Some(JobDataValue::Opaque(v)) => v.clone().downcast::<T>().ok(),
            _ => None,
        }
    }

    pub fn remove(&mut self, key: &str) -> Option<JobDataValue> {
        self.entries.remove(key)
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &JobDataValue)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn render(&self, key: &str) -> Option<String> {
        self.entries.get(key).map(JobDataValue::render)
    }

    /// Best-effort rendering of every entry, in key order.
    pub fn rendered(&self) -> Vec<(String, String)> {
        self.entries
            .iter()
            .map(|(k, v)| (k.clone(), v.render()))
            .collect()
    }

    /// Overlay `other` on top of `self`; keys present in both take `other`'s value.
    pub fn merged_with(&self, other: &JobDataMap) -> JobDataMap {
        let mut merged = self.clone();
        for (k, v) in &other.entries {
            merged.entries.insert(k.clone(), v.clone());
        }
        merged
    }
}
