//! Configuration for the RPC layer
//!
//! Explicit defaults, validation, reasonable limits.

use crate::constants::*;
use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};

/// Timing configuration shared by the caller and liveness sides
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcConfig {
    /// Interval between liveness rounds (milliseconds)
    #[serde(default = "default_ping_delay_ms")]
    pub ping_delay_ms: u64,

    /// Window an originator waits for pong replies (milliseconds)
    #[serde(default = "default_ping_timeout_ms")]
    pub ping_timeout_ms: u64,

    /// Default timeout for a request's first response frame (milliseconds)
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
}

fn default_ping_delay_ms() -> u64 {
    PING_DELAY_MS_DEFAULT
}

fn default_ping_timeout_ms() -> u64 {
    PING_TIMEOUT_MS_DEFAULT
}

fn default_request_timeout_ms() -> u64 {
    REQUEST_TIMEOUT_MS_DEFAULT
}

impl Default for RpcConfig {
    fn default() -> Self {
        Self {
            ping_delay_ms: default_ping_delay_ms(),
            ping_timeout_ms: default_ping_timeout_ms(),
            request_timeout_ms: default_request_timeout_ms(),
        }
    }
}

impl RpcConfig {
    /// Set the ping delay
    pub fn with_ping_delay_ms(mut self, ms: u64) -> Self {
        self.ping_delay_ms = ms;
        self
    }

    /// Set the ping timeout
    pub fn with_ping_timeout_ms(mut self, ms: u64) -> Self {
        self.ping_timeout_ms = ms;
        self
    }

    /// Set the default request timeout
    pub fn with_request_timeout_ms(mut self, ms: u64) -> Self {
        self.request_timeout_ms = ms;
        self
    }

    /// Create from environment variables
    ///
    /// Reads:
    /// - `INFRA_PING_DELAY`: interval between rounds, in seconds (may be fractional)
    /// - `INFRA_PING_TIMEOUT`: pong collection window, in seconds (may be fractional)
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Some(delay_s) = read_env_f64("INFRA_PING_DELAY") {
            config.ping_delay_ms = (delay_s * 1000.0) as u64;
        }
        if let Some(timeout_s) = read_env_f64("INFRA_PING_TIMEOUT") {
            config.ping_timeout_ms = (timeout_s * 1000.0) as u64;
        }

        config
    }

    /// Aggressive timings for integration tests
    pub fn for_testing() -> Self {
        Self {
            ping_delay_ms: 200,
            ping_timeout_ms: 50,
            request_timeout_ms: 1000,
        }
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.ping_delay_ms < PING_DELAY_MS_MIN || self.ping_delay_ms > PING_DELAY_MS_MAX {
            return Err(Error::InvalidConfiguration {
                field: "ping_delay_ms".into(),
                reason: format!(
                    "{} outside [{}, {}]",
                    self.ping_delay_ms, PING_DELAY_MS_MIN, PING_DELAY_MS_MAX
                ),
            });
        }

        if self.ping_timeout_ms == 0 {
            return Err(Error::InvalidConfiguration {
                field: "ping_timeout_ms".into(),
                reason: "must be nonzero".into(),
            });
        }

        // The responder throttle is delay - timeout; it must stay positive.
        if self.ping_timeout_ms >= self.ping_delay_ms {
            return Err(Error::InvalidConfiguration {
                field: "ping_timeout_ms".into(),
                reason: "must be smaller than ping_delay_ms".into(),
            });
        }

        if self.request_timeout_ms == 0 {
            return Err(Error::InvalidConfiguration {
                field: "request_timeout_ms".into(),
                reason: "must be nonzero".into(),
            });
        }

        Ok(())
    }

    /// How long an adopted liveness snapshot stays valid
    pub fn liveness_validity_ms(&self) -> u64 {
        self.ping_delay_ms * LIVENESS_VALIDITY_ROUNDS
    }

    /// How long a responder suppresses further pongs after answering one
    pub fn pong_throttle_ms(&self) -> u64 {
        self.ping_delay_ms - self.ping_timeout_ms
    }
}

fn read_env_f64(key: &str) -> Option<f64> {
    std::env::var(key).ok()?.parse().ok()
}
