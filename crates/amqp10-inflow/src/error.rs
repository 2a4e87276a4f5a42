//! Error types for the ingestion bridge.

use thiserror::Error;

use crate::config::DestinationKind;

/// Errors produced by the transport core.
///
/// Only [`TransportError::Configuration`] and the very first connection
/// attempt surface to the host as an error state; every other condition is
/// retried locally by the owning component with capped exponential backoff.
#[derive(Debug, Error)]
pub enum TransportError {
    /// Invalid connection or destination parameters.
    ///
    /// Fatal until the configuration is corrected.
    #[error("invalid configuration: {0}")]
    Configuration(String),

    /// Transport or session establishment against the broker failed.
    #[error("failed to establish AMQP connection to '{host}': {reason}")]
    Connection {
        /// Broker host the attempt was made against.
        host: String,
        /// Underlying cause, rendered as text.
        reason: String,
    },

    /// A connection, session, or consumer was used while not live.
    ///
    /// Recoverable by retrying after the owning component restarts.
    #[error("connection service for '{0}' is not running")]
    NotRunning(String),

    /// Consumer creation or use failed against a live session.
    #[error("consumer failure on {kind} '{name}': {reason}")]
    Consumer {
        /// Destination kind (queue or topic).
        kind: DestinationKind,
        /// Destination name.
        name: String,
        /// Underlying cause, rendered as text.
        reason: String,
    },

    /// An inbound message body could not be decoded into payload bytes.
    ///
    /// Decode problems are data problems, not connectivity problems: the
    /// receive loop logs and drops the message without raising this variant,
    /// which exists for callers decoding bodies directly.
    #[error("undecodable message body: {0}")]
    Decode(String),
}

impl TransportError {
    /// Shorthand for a [`TransportError::Connection`] from any displayable cause.
    pub fn connection(host: impl Into<String>, cause: impl std::fmt::Display) -> Self {
        Self::Connection {
            host: host.into(),
            reason: cause.to_string(),
        }
    }
}
