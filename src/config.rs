//! # Ingestion configuration.
//!
//! [`Config`] carries every tunable of the core. Loading it (files, env) is
//! the embedding application's job.
//!
//! ## Sentinel values
//! - `reconnect_ceiling = 0` → retry forever
//! - `connect_timeout = 0s` → no dial timeout
//! - `handler_timeout = 0s` → handlers run without a deadline
//! - `bus_capacity = 0` → clamped to 1

use std::fmt;
use std::time::Duration;

use crate::policies::{BackoffPolicy, JitterPolicy, RedeliveryPolicy};

/// Credentials presented when dialing the bus.
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    /// Client identity.
    pub user: String,
    /// Secret; never printed by `Debug`.
    pub secret: String,
}

impl Credentials {
    /// Creates credentials.
    pub fn new(user: impl Into<String>, secret: impl Into<String>) -> Self {
        Self {
            user: user.into(),
            secret: secret.into(),
        }
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("user", &self.user)
            .field("secret", &"<redacted>")
            .finish()
    }
}

/// Configuration for connection, delivery and shutdown.
///
/// All fields are public; prefer the accessors over checking sentinels inline.
#[derive(Clone, Debug)]
pub struct Config {
    /// Bus endpoint handed to the connector.
    pub endpoint: String,

    /// Optional credentials.
    pub credentials: Option<Credentials>,

    /// Delay schedule between dial attempts.
    pub reconnect: BackoffPolicy,

    /// Consecutive failed dials before the manager gives up (`0` = never).
    pub reconnect_ceiling: u32,

    /// Upper bound for a single dial (`0s` = none).
    pub connect_timeout: Duration,

    /// Deadline for one handler invocation (`0s` = none).
    pub handler_timeout: Duration,

    /// Handler attempts per message before it is dead-lettered (min 1).
    pub max_attempts: u32,

    /// Delay schedule between handler attempts of the same message.
    pub redelivery: BackoffPolicy,

    /// Capacity of the runtime event bus.
    pub bus_capacity: usize,

    /// How long `close` waits for pumps to stop.
    pub grace: Duration,
}

impl Config {
    /// Config for `endpoint` with every other field defaulted.
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            ..Self::default()
        }
    }

    /// Sets credentials.
    pub fn with_credentials(mut self, credentials: Credentials) -> Self {
        self.credentials = Some(credentials);
        self
    }

    /// Reconnect ceiling as an `Option` (`None` = unlimited).
    #[inline]
    pub fn reconnect_limit(&self) -> Option<u32> {
        (self.reconnect_ceiling > 0).then_some(self.reconnect_ceiling)
    }

    /// Dial timeout as an `Option`.
    #[inline]
    pub fn dial_timeout(&self) -> Option<Duration> {
        (!self.connect_timeout.is_zero()).then_some(self.connect_timeout)
    }

    /// Handler deadline as an `Option`.
    #[inline]
    pub fn handler_deadline(&self) -> Option<Duration> {
        (!self.handler_timeout.is_zero()).then_some(self.handler_timeout)
    }

    /// Redelivery policy built from `max_attempts` and `redelivery`.
    #[inline]
    pub fn redelivery_policy(&self) -> RedeliveryPolicy {
        RedeliveryPolicy {
            max_attempts: self.max_attempts.max(1),
            backoff: self.redelivery,
        }
    }

    /// Bus capacity clamped to a minimum of 1.
    #[inline]
    pub fn bus_capacity_clamped(&self) -> usize {
        self.bus_capacity.max(1)
    }
}

impl Default for Config {
    /// Defaults:
    ///
    /// - `endpoint = "nats://127.0.0.1:4222"`, no credentials
    /// - reconnect: 250ms doubling to 30s, equal jitter, ceiling 20
    /// - `connect_timeout = 5s`, `handler_timeout = 30s`
    /// - `max_attempts = 5`, redelivery 200ms doubling to 10s, full jitter
    /// - `bus_capacity = 1024`, `grace = 10s`
    fn default() -> Self {
        Self {
            endpoint: "nats://127.0.0.1:4222".to_string(),
            credentials: None,
            reconnect: BackoffPolicy {
                initial: Duration::from_millis(250),
                cap: Duration::from_secs(30),
                multiplier: 2.0,
                jitter: JitterPolicy::Equal,
            },
            reconnect_ceiling: 20,
            connect_timeout: Duration::from_secs(5),
            handler_timeout: Duration::from_secs(30),
            max_attempts: 5,
            redelivery: BackoffPolicy {
                initial: Duration::from_millis(200),
                cap: Duration::from_secs(10),
                multiplier: 2.0,
                jitter: JitterPolicy::Full,
            },
            bus_capacity: 1024,
            grace: Duration::from_secs(10),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sentinels_map_to_none() {
        let cfg = Config {
            reconnect_ceiling: 0,
            connect_timeout: Duration::ZERO,
            handler_timeout: Duration::ZERO,
            max_attempts: 0,
            bus_capacity: 0,
            ..Config::new("mem://local")
        };
        assert_eq!(cfg.reconnect_limit(), None);
        assert_eq!(cfg.dial_timeout(), None);
        assert_eq!(cfg.handler_deadline(), None);
        assert_eq!(cfg.redelivery_policy().max_attempts, 1);
        assert_eq!(cfg.bus_capacity_clamped(), 1);
    }

    #[test]
    fn debug_redacts_secret() {
        let cfg = Config::default().with_credentials(Credentials::new("svc", "hunter2"));
        let printed = format!("{cfg:?}");
        assert!(printed.contains("svc"));
        assert!(!printed.contains("hunter2"));
    }
}
