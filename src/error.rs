//! Error types used by the ingestion runtime, transports and handlers.
//!
//! This module defines the error taxonomy:
//!
//! - [`TransportError`] — opaque failures reported by a transport implementation.
//! - [`ConnectionError`] — session establishment failures (retried with backoff,
//!   fatal only for bad credentials or after the reconnect ceiling).
//! - [`SubscriptionError`] — subject/durable problems, surfaced immediately.
//! - [`HandlerError`] — application failures for a single delivery attempt.
//! - [`DeadLetterError`] — the dead-letter sink refused a message.
//! - [`RuntimeError`] — what the owning process sees on `close()` / `closed()`.
//!
//! Every type provides `as_label` (stable snake_case for logs/metrics) and
//! `as_message` helpers.

use std::time::Duration;
use thiserror::Error;

/// # Errors reported by a transport implementation.
///
/// The core treats the bus wire protocol as opaque; transports map their own
/// failures onto these variants.
#[non_exhaustive]
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    /// Endpoint could not be reached.
    #[error("endpoint unreachable: {0}")]
    Unreachable(String),

    /// Credentials were rejected.
    #[error("unauthorized: {0}")]
    Unauthorized(String),

    /// The live link dropped.
    #[error("disconnected: {0}")]
    Disconnected(String),

    /// Durable name is bound elsewhere or bound to another subject.
    #[error("conflict: {0}")]
    Conflict(String),

    /// The bus refused the request.
    #[error("rejected: {0}")]
    Rejected(String),

    /// The connection was closed locally.
    #[error("connection closed")]
    Closed,
}

impl TransportError {
    /// Returns a short stable label (snake_case) for use in logs/metrics.
    pub fn as_label(&self) -> &'static str {
        match self {
            TransportError::Unreachable(_) => "transport_unreachable",
            TransportError::Unauthorized(_) => "transport_unauthorized",
            TransportError::Disconnected(_) => "transport_disconnected",
            TransportError::Conflict(_) => "transport_conflict",
            TransportError::Rejected(_) => "transport_rejected",
            TransportError::Closed => "transport_closed",
        }
    }

    /// Indicates a link-level failure that says nothing about the request.
    ///
    /// Subscriptions hit by one stay registered and are declared again later.
    ///
    /// # Example
    /// ```
    /// use busvisor::TransportError;
    ///
    /// assert!(TransportError::Disconnected("reset".into()).is_transient());
    /// assert!(!TransportError::Conflict("bound elsewhere".into()).is_transient());
    /// ```
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            TransportError::Unreachable(_) | TransportError::Disconnected(_) | TransportError::Closed
        )
    }
}

/// # Errors produced while establishing or keeping a session.
///
/// `Unreachable` is retried with backoff by the connection manager.
/// `Unauthorized`, `Exhausted` and `Closed` are terminal and surfaced to the owner.
#[non_exhaustive]
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConnectionError {
    /// Endpoint unreachable or link failure (retryable).
    #[error("cannot reach {endpoint}: {reason}")]
    Unreachable {
        /// Endpoint that was dialed.
        endpoint: String,
        /// Transport-level reason.
        reason: String,
    },

    /// Credentials rejected by the bus (never retried).
    #[error("authentication failed: {reason}")]
    Unauthorized {
        /// Transport-level reason.
        reason: String,
    },

    /// Reconnect ceiling reached.
    #[error("gave up after {attempts} connect attempts; last error: {last}")]
    Exhausted {
        /// Number of attempts made.
        attempts: u32,
        /// Last observed failure.
        last: String,
    },

    /// Manager was closed by its owner.
    #[error("connection manager closed")]
    Closed,
}

impl ConnectionError {
    /// Returns a short stable label (snake_case) for use in logs/metrics.
    ///
    /// # Example
    /// ```
    /// use busvisor::ConnectionError;
    ///
    /// let err = ConnectionError::Unauthorized { reason: "bad token".into() };
    /// assert_eq!(err.as_label(), "connection_unauthorized");
    /// ```
    pub fn as_label(&self) -> &'static str {
        match self {
            ConnectionError::Unreachable { .. } => "connection_unreachable",
            ConnectionError::Unauthorized { .. } => "connection_unauthorized",
            ConnectionError::Exhausted { .. } => "connection_exhausted",
            ConnectionError::Closed => "connection_closed",
        }
    }

    /// Returns a human-readable message with details about the error.
    pub fn as_message(&self) -> String {
        match self {
            ConnectionError::Unreachable { endpoint, reason } => {
                format!("unreachable: endpoint={endpoint} reason={reason}")
            }
            ConnectionError::Unauthorized { reason } => format!("unauthorized: {reason}"),
            ConnectionError::Exhausted { attempts, last } => {
                format!("exhausted: attempts={attempts} last={last}")
            }
            ConnectionError::Closed => "closed".to_string(),
        }
    }

    /// Indicates whether the manager must stop instead of retrying.
    ///
    /// # Example
    /// ```
    /// use busvisor::ConnectionError;
    ///
    /// let transient = ConnectionError::Unreachable { endpoint: "mem://".into(), reason: "down".into() };
    /// assert!(!transient.is_fatal());
    ///
    /// let auth = ConnectionError::Unauthorized { reason: "nope".into() };
    /// assert!(auth.is_fatal());
    /// ```
    pub fn is_fatal(&self) -> bool {
        !matches!(self, ConnectionError::Unreachable { .. })
    }

    pub(crate) fn from_transport(endpoint: &str, err: TransportError) -> Self {
        match err {
            TransportError::Unauthorized(reason) => ConnectionError::Unauthorized { reason },
            other => ConnectionError::Unreachable {
                endpoint: endpoint.to_string(),
                reason: other.to_string(),
            },
        }
    }
}

/// # Errors produced when registering or declaring a subscription.
///
/// These are surfaced to the caller immediately and never retried. Transient
/// transport failures are not among them: the registry keeps the subscription
/// and declares it again.
#[non_exhaustive]
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SubscriptionError {
    /// Subject or durable name is empty or malformed.
    #[error("invalid {field}: {value:?}")]
    Invalid {
        /// Which field was rejected (`subject` or `durable`).
        field: &'static str,
        /// The offending value.
        value: String,
    },

    /// Durable name already registered (locally or on the bus).
    #[error("durable {durable:?} conflicts on subject {subject:?}")]
    DurableConflict {
        /// Durable name.
        durable: String,
        /// Subject of the rejected registration.
        subject: String,
    },

    /// The bus refused the subscription.
    #[error("subscription {durable:?} rejected: {reason}")]
    Rejected {
        /// Durable name.
        durable: String,
        /// Transport-level reason.
        reason: String,
    },

    /// Handle does not belong to a live subscription.
    #[error("subscription {durable:?} not found")]
    NotFound {
        /// Durable name.
        durable: String,
    },

    /// Registry is shutting down.
    #[error("registry closed")]
    Closed,
}

impl SubscriptionError {
    /// Returns a short stable label (snake_case) for use in logs/metrics.
    pub fn as_label(&self) -> &'static str {
        match self {
            SubscriptionError::Invalid { .. } => "subscription_invalid",
            SubscriptionError::DurableConflict { .. } => "subscription_conflict",
            SubscriptionError::Rejected { .. } => "subscription_rejected",
            SubscriptionError::NotFound { .. } => "subscription_not_found",
            SubscriptionError::Closed => "subscription_closed",
        }
    }

    pub(crate) fn from_transport(subject: &str, durable: &str, err: TransportError) -> Self {
        match err {
            TransportError::Conflict(_) => SubscriptionError::DurableConflict {
                durable: durable.to_string(),
                subject: subject.to_string(),
            },
            other => SubscriptionError::Rejected {
                durable: durable.to_string(),
                reason: other.to_string(),
            },
        }
    }
}

/// # Errors produced by a single handler attempt.
///
/// `Fail`, `Timeout` and `Panicked` are retried up to the configured attempt
/// limit; `Fatal` dead-letters the message right away.
#[non_exhaustive]
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum HandlerError {
    /// Handler exceeded its deadline.
    #[error("timed out after {timeout:?}")]
    Timeout {
        /// The timeout duration that was exceeded.
        timeout: Duration,
    },

    /// Message can never be processed (no retry).
    #[error("fatal error (no retry): {error}")]
    Fatal {
        /// The underlying error message.
        error: String,
    },

    /// Attempt failed but may succeed if retried.
    #[error("handler failed: {error}")]
    Fail {
        /// The underlying error message.
        error: String,
    },

    /// Handler panicked.
    #[error("handler panicked: {info}")]
    Panicked {
        /// Panic payload rendered as text.
        info: String,
    },

    /// Delivery was cancelled because the pump is stopping.
    #[error("delivery cancelled")]
    Canceled,
}

impl HandlerError {
    /// Shorthand for a retryable failure.
    pub fn fail(error: impl Into<String>) -> Self {
        HandlerError::Fail {
            error: error.into(),
        }
    }

    /// Shorthand for a non-retryable failure.
    pub fn fatal(error: impl Into<String>) -> Self {
        HandlerError::Fatal {
            error: error.into(),
        }
    }

    /// Returns a short stable label (snake_case) for use in logs/metrics.
    ///
    /// # Example
    /// ```
    /// use busvisor::HandlerError;
    /// use std::time::Duration;
    ///
    /// let err = HandlerError::Timeout { timeout: Duration::from_secs(1) };
    /// assert_eq!(err.as_label(), "handler_timeout");
    /// ```
    pub fn as_label(&self) -> &'static str {
        match self {
            HandlerError::Timeout { .. } => "handler_timeout",
            HandlerError::Fatal { .. } => "handler_fatal",
            HandlerError::Fail { .. } => "handler_failed",
            HandlerError::Panicked { .. } => "handler_panicked",
            HandlerError::Canceled => "handler_canceled",
        }
    }

    /// Returns a human-readable message with details about the error.
    pub fn as_message(&self) -> String {
        match self {
            HandlerError::Timeout { timeout } => format!("timeout: {timeout:?}"),
            HandlerError::Fatal { error } => format!("fatal: {error}"),
            HandlerError::Fail { error } => format!("error: {error}"),
            HandlerError::Panicked { info } => format!("panic: {info}"),
            HandlerError::Canceled => "delivery cancelled".to_string(),
        }
    }

    /// Indicates whether another attempt may be made.
    ///
    /// # Example
    /// ```
    /// use busvisor::HandlerError;
    ///
    /// assert!(HandlerError::fail("boom").is_retryable());
    /// assert!(!HandlerError::fatal("poison").is_retryable());
    /// ```
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            HandlerError::Fail { .. } | HandlerError::Timeout { .. } | HandlerError::Panicked { .. }
        )
    }
}

/// # Dead-letter sink failure.
///
/// The pump keeps the message in flight and retries the sink with backoff.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("dead-letter sink failed: {reason}")]
pub struct DeadLetterError {
    /// Sink-specific reason.
    pub reason: String,
}

impl DeadLetterError {
    /// Creates a sink error.
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
        }
    }
}

/// # Errors surfaced to the owning process.
#[non_exhaustive]
#[derive(Error, Debug)]
pub enum RuntimeError {
    /// The connection manager stopped for good.
    #[error(transparent)]
    Connection(#[from] ConnectionError),

    /// Shutdown grace period was exceeded; some pumps were still running.
    #[error("shutdown timeout {grace:?} exceeded; stuck: {stuck:?}")]
    GraceExceeded {
        /// The configured grace duration.
        grace: Duration,
        /// Durable names of pumps that did not stop in time.
        stuck: Vec<String>,
    },
}

impl RuntimeError {
    /// Returns a short stable label (snake_case) for use in logs/metrics.
    ///
    /// # Example
    /// ```
    /// use busvisor::RuntimeError;
    /// use std::time::Duration;
    ///
    /// let err = RuntimeError::GraceExceeded { grace: Duration::from_secs(5), stuck: vec![] };
    /// assert_eq!(err.as_label(), "runtime_grace_exceeded");
    /// ```
    pub fn as_label(&self) -> &'static str {
        match self {
            RuntimeError::Connection(e) => e.as_label(),
            RuntimeError::GraceExceeded { .. } => "runtime_grace_exceeded",
        }
    }

    /// Returns a human-readable message with details about the error.
    pub fn as_message(&self) -> String {
        match self {
            RuntimeError::Connection(e) => e.as_message(),
            RuntimeError::GraceExceeded { grace, stuck } => {
                format!("grace exceeded after {grace:?}; stuck pumps={stuck:?}")
            }
        }
    }
}
