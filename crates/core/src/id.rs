//! Strongly-typed identifiers used across the runtime.

use core::str::FromStr;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::CoreError;

/// Identity of one live job instance (the key of a scoped binding).
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobInstanceId(Uuid);

/// Identity of a resource scope.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ScopeId(Uuid);

/// Identity of a single trigger firing.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FireInstanceId(Uuid);

macro_rules! impl_uuid_newtype {
    ($t:ty, $name:literal) => {
        impl $t {
            /// Create a new identifier.
            ///
            /// Uses UUIDv7 (time-ordered), so ids sort by creation time in logs.
            pub fn new() -> Self {
                Self(Uuid::now_v7())
            }

            pub fn from_uuid(uuid: Uuid) -> Self {
                Self(uuid)
            }

            pub fn as_uuid(&self) -> &Uuid {
                &self.0
            }
        }

        impl Default for $t {
            fn default() -> Self {
                Self::new()
            }
        }

        impl core::fmt::Display for $t {
            fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
                core::fmt::Display::fmt(&self.0, f)
            }
        }

        impl From<Uuid> for $t {
            fn from(value: Uuid) -> Self {
                Self(value)
            }
        }

        impl From<$t> for Uuid {
            fn from(value: $t) -> Self {
                value.0
            }
        }

        impl FromStr for $t {
            type Err = CoreError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                let uuid = Uuid::from_str(s)
                    .map_err(|e| CoreError::invalid_id(format!("{}: {}", $name, e)))?;
                Ok(Self(uuid))
            }
        }
    };
}

impl_uuid_newtype!(JobInstanceId, "JobInstanceId");
impl_uuid_newtype!(ScopeId, "ScopeId");
impl_uuid_newtype!(FireInstanceId, "FireInstanceId");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_are_unique() {
        assert_ne!(JobInstanceId::new(), JobInstanceId::new());
        assert_ne!(ScopeId::new(), ScopeId::new());
    }

    #[test]
    fn parse_rejects_garbage() {
        let err = "not-a-uuid".parse::<ScopeId>().unwrap_err();
        assert!(matches!(err, CoreError::InvalidId(msg) if msg.starts_with("ScopeId")));
    }

    #[test]
    fn display_parses_back() {
        let id = FireInstanceId::new();
        let parsed: FireInstanceId = id.to_string().parse().unwrap();
        assert_eq!(id, parsed);
    }
}
