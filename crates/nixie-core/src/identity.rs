//! Service identities and channel naming
//!
//! Every process instance of a named service is addressed by
//! `(name, worker)`. Its inbound channel is derived deterministically from
//! that pair; a well-known shared channel carries liveness traffic for all
//! instances.

use crate::constants::SERVICE_NAME_LENGTH_BYTES_MAX;
use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fmt;

/// The shared channel carrying ping / pong / ping-result traffic
pub const HEALTHCHECK_CHANNEL: &str = "service:healthcheck";

/// Index of one process instance within a named service
pub type WorkerId = u32;

/// Validated name of a backend service
///
/// Names should be stable across restarts; they are part of every channel
/// name and liveness key.
#[derive(Debug, Clone, Hash, Eq, PartialEq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ServiceName(String);

impl ServiceName {
    /// Create a new ServiceName with validation
    ///
    /// # Errors
    /// Returns an error if the name is empty, too long, or contains
    /// characters outside `[A-Za-z0-9._-]`.
    pub fn new(name: impl Into<String>) -> Result<Self> {
        let name = name.into();

        if name.is_empty() {
            return Err(Error::InvalidServiceName {
                name,
                reason: "service name cannot be empty".into(),
            });
        }

        if name.len() > SERVICE_NAME_LENGTH_BYTES_MAX {
            return Err(Error::InvalidServiceName {
                reason: format!(
                    "service name length {} exceeds limit {}",
                    name.len(),
                    SERVICE_NAME_LENGTH_BYTES_MAX
                ),
                name,
            });
        }

        // '@' in particular must be rejected: it delimits worker keys.
        let valid = name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.');

        if !valid {
            return Err(Error::InvalidServiceName {
                name,
                reason: "service name contains invalid characters".into(),
            });
        }

        Ok(Self(name))
    }

    /// Create a ServiceName without validation (for internal use)
    #[doc(hidden)]
    pub fn new_unchecked(name: String) -> Self {
        debug_assert!(!name.is_empty());
        debug_assert!(name.len() <= SERVICE_NAME_LENGTH_BYTES_MAX);
        Self(name)
    }

    /// Get the name as a string
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ServiceName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl AsRef<str> for ServiceName {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Address of one process instance of a named service
#[derive(Debug, Clone, Hash, Eq, PartialEq, Serialize, Deserialize)]
pub struct ServiceIdentity {
    /// The service's name
    pub name: ServiceName,
    /// The worker index within the service
    pub worker: WorkerId,
}

impl ServiceIdentity {
    /// Create a new identity
    pub fn new(name: ServiceName, worker: WorkerId) -> Self {
        Self { name, worker }
    }

    /// The instance's inbound pub/sub channel
    pub fn channel(&self) -> String {
        channel_for(&self.name, self.worker)
    }

    /// The `name@worker` key used by liveness maps
    pub fn key(&self) -> String {
        format!("{}@{}", self.name, self.worker)
    }

    /// Parse a `name@worker` key back into an identity
    ///
    /// # Errors
    /// Returns an error if the key has no `@` separator or the worker part
    /// is not an integer.
    pub fn parse_key(key: &str) -> Result<Self> {
        let (name, worker) = key.split_once('@').ok_or_else(|| Error::InvalidWorkerKey {
            key: key.into(),
            reason: "missing '@' separator".into(),
        })?;

        let worker: WorkerId = worker.parse().map_err(|_| Error::InvalidWorkerKey {
            key: key.into(),
            reason: "worker index is not an integer".into(),
        })?;

        Ok(Self {
            name: ServiceName::new(name)?,
            worker,
        })
    }
}

impl fmt::Display for ServiceIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.name, self.worker)
    }
}

/// Derive the inbound channel for a `(name, worker)` pair
pub fn channel_for(name: &ServiceName, worker: WorkerId) -> String {
    format!("service:{}@{}", name, worker)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_service_name_valid() {
        let name = ServiceName::new("dressroom").unwrap();
        assert_eq!(name.as_str(), "dressroom");
        assert_eq!(format!("{}", name), "dressroom");
    }

    #[test]
    fn test_service_name_invalid_empty() {
        let result = ServiceName::new("");
        assert!(matches!(result, Err(Error::InvalidServiceName { .. })));
    }

    #[test]
    fn test_service_name_rejects_at_sign() {
        let result = ServiceName::new("auth@1");
        assert!(matches!(result, Err(Error::InvalidServiceName { .. })));
    }

    #[test]
    fn test_service_name_too_long() {
        let long = "a".repeat(SERVICE_NAME_LENGTH_BYTES_MAX + 1);
        let result = ServiceName::new(long);
        assert!(matches!(result, Err(Error::InvalidServiceName { .. })));
    }

    #[test]
    fn test_identity_channel() {
        let id = ServiceIdentity::new(ServiceName::new("lookup").unwrap(), 3);
        assert_eq!(id.channel(), "service:lookup@3");
        assert_eq!(id.key(), "lookup@3");
    }

    #[test]
    fn test_identity_key_round_trip() {
        let id = ServiceIdentity::new(ServiceName::new("profile").unwrap(), 12);
        let parsed = ServiceIdentity::parse_key(&id.key()).unwrap();
        assert_eq!(parsed, id);
    }

    #[test]
    fn test_identity_parse_key_invalid() {
        assert!(ServiceIdentity::parse_key("no-separator").is_err());
        assert!(ServiceIdentity::parse_key("auth@notanumber").is_err());
    }
}
