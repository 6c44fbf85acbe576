//! Identifier types used throughout the Skiff runtime.
//!
//! A `ServiceId` names one installed component for the lifetime of a host
//! session and is the primary key for sandbox lookup and capability-store
//! namespacing. A `PluginId` qualifies it with the pluggable unit hosted
//! under that service.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Stable identity of one pluggable component ("service").
///
/// Lowercase alphanumeric plus hyphen, non-empty. The same character set is
/// enforced for key-value bucket identifiers so that `{service}:{bucket}`
/// namespaces cannot collide through crafted names.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ServiceId(String);

impl ServiceId {
    /// Parses and validates a service identifier.
    pub fn new(s: impl Into<String>) -> Result<Self, crate::Error> {
        let s = s.into();
        let valid = !s.is_empty()
            && s.chars()
                .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-');
        if valid {
            Ok(Self(s))
        } else {
            Err(crate::Error::InvalidServiceId(s))
        }
    }

    /// Returns the identifier as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ServiceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for ServiceId {
    type Err = crate::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

/// Qualified plugin id: a service may host more than one pluggable unit.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PluginId {
    pub service: ServiceId,
    pub plugin: String,
}

impl PluginId {
    pub fn new(service: ServiceId, plugin: impl Into<String>) -> Self {
        Self {
            service,
            plugin: plugin.into(),
        }
    }
}

impl fmt::Display for PluginId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.service, self.plugin)
    }
}

/// Origination data for a call: which service issued it (if any) and the
/// address its messages are expected to arrive from.
///
/// The host application's own origin has `service: None` — it is not a
/// sandbox. Origins are assigned by the runtime, never self-reported by a
/// component.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Origin {
    pub service: Option<ServiceId>,
    pub address: String,
}

impl Origin {
    /// The expected address for a sandbox bound to `service`.
    #[must_use]
    pub fn sandbox_address(service: &ServiceId) -> String {
        format!("sandbox://{service}")
    }

    /// Origin of the sandbox bound to `service`.
    #[must_use]
    pub fn for_sandbox(service: ServiceId) -> Self {
        let address = Self::sandbox_address(&service);
        Self {
            service: Some(service),
            address,
        }
    }

    /// Origin of a host application (no backing sandbox).
    #[must_use]
    pub fn host(address: impl Into<String>) -> Self {
        Self {
            service: None,
            address: address.into(),
        }
    }
}

impl fmt::Display for Origin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.address)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn valid_service_ids() {
        for id in ["accounts", "auth-sig", "kv2", "a"] {
            assert!(ServiceId::new(id).is_ok(), "{id} should be valid");
        }
    }

    #[test]
    fn invalid_service_ids_rejected() {
        for id in ["", "Accounts", "acc ounts", "a:b", "über", "a/b"] {
            assert!(ServiceId::new(id).is_err(), "{id:?} should be invalid");
        }
    }

    #[test]
    fn sandbox_origin_address_is_stable() {
        let svc = ServiceId::new("accounts").unwrap();
        let origin = Origin::for_sandbox(svc.clone());
        assert_eq!(origin.address, Origin::sandbox_address(&svc));
        assert_eq!(origin.service, Some(svc));
    }

    #[test]
    fn host_origin_has_no_service() {
        let origin = Origin::host("https://app.example");
        assert_eq!(origin.service, None);
        assert_eq!(origin.address, "https://app.example");
    }
}
