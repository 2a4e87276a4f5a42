//! Connection and destination configuration records.
//!
//! Both records are plain value types supplied fully populated by the host
//! (CLI, config file, or embedding framework — not this crate's concern) and
//! validated exactly once before any network attempt is made. After
//! validation they are treated as immutable.

use std::fmt;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::TransportError;

/// Default broker port: the IANA-assigned AMQPS port.
const fn default_port() -> u16 {
    5671
}

/// Returns `true` (used for `#[serde(default)]` on the TLS flag).
const fn default_true() -> bool {
    true
}

/// Well-known non-TLS AMQP port; combining it with TLS is flagged as a
/// likely misconfiguration (non-fatal).
const PLAIN_AMQP_PORT: u16 = 5672;

// ---------------------------------------------------------------------------
// ConnectionConfig
// ---------------------------------------------------------------------------

/// Parameters describing how to reach the broker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionConfig {
    /// Broker hostname or IP address.
    pub host: String,

    /// Broker port. Defaults to 5671 (AMQPS).
    #[serde(default = "default_port")]
    pub port: u16,

    /// Whether to wrap the transport socket in TLS. Defaults to `true`.
    #[serde(default = "default_true")]
    pub use_tls: bool,

    /// Whether the broker requires SASL authentication. Defaults to `false`.
    #[serde(default)]
    pub auth_required: bool,

    /// SASL mechanism to use. Required when `auth_required` is set.
    #[serde(default)]
    pub sasl_mode: Option<SaslMode>,

    /// Username for SASL PLAIN.
    #[serde(default)]
    pub username: Option<String>,

    /// Password for SASL PLAIN.
    #[serde(default)]
    pub password: Option<String>,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            host: String::new(),
            port: default_port(),
            use_tls: true,
            auth_required: false,
            sasl_mode: None,
            username: None,
            password: None,
        }
    }
}

impl ConnectionConfig {
    /// Validates the record.
    ///
    /// Emits a non-fatal warning when the well-known non-TLS port is combined
    /// with TLS — a likely misconfiguration that does not block startup.
    ///
    /// # Errors
    ///
    /// Returns `TransportError::Configuration` when the host is empty, the
    /// port is zero, authentication is required without a SASL mode, or SASL
    /// PLAIN is selected without a username or password.
    pub fn validate(&self) -> Result<(), TransportError> {
        if self.host.is_empty() {
            return Err(TransportError::Configuration(
                "broker host must not be empty".into(),
            ));
        }
        if self.port == 0 {
            return Err(TransportError::Configuration(
                "broker port must be positive".into(),
            ));
        }
        if self.port == PLAIN_AMQP_PORT && self.use_tls {
            warn!(
                host = %self.host,
                port = self.port,
                "TLS enabled on the well-known non-TLS AMQP port; check the connection settings"
            );
        }
        if self.auth_required {
            let Some(mode) = self.sasl_mode else {
                return Err(TransportError::Configuration(
                    "authentication required but no SASL mechanism selected \
                     (expected ANONYMOUS or PLAIN)"
                        .into(),
                ));
            };
            if mode == SaslMode::Plain {
                if self.username.as_deref().map_or(true, str::is_empty) {
                    return Err(TransportError::Configuration(
                        "SASL PLAIN requires a username".into(),
                    ));
                }
                if self.password.as_deref().map_or(true, str::is_empty) {
                    return Err(TransportError::Configuration(
                        "SASL PLAIN requires a password".into(),
                    ));
                }
            }
        }
        Ok(())
    }
}

/// SASL mechanism used when the broker requires authentication.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SaslMode {
    /// Anonymous SASL layer (no credentials).
    Anonymous,
    /// SASL PLAIN (username and password).
    Plain,
}

// ---------------------------------------------------------------------------
// DestinationConfig
// ---------------------------------------------------------------------------

/// The broker destination a subscription worker binds to.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DestinationConfig {
    /// Destination kind. Participates in validation and logging only; the
    /// consumer attaches by name regardless of kind.
    pub kind: DestinationKind,

    /// Destination name (queue or topic address on the broker).
    pub name: String,
}

impl DestinationConfig {
    /// Validates the record.
    ///
    /// # Errors
    ///
    /// Returns `TransportError::Configuration` when the name is empty.
    pub fn validate(&self) -> Result<(), TransportError> {
        if self.name.is_empty() {
            return Err(TransportError::Configuration(
                "destination name must not be empty".into(),
            ));
        }
        Ok(())
    }
}

/// Kind of broker destination.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DestinationKind {
    /// A point-to-point queue.
    Queue,
    /// A publish/subscribe topic.
    Topic,
}

impl fmt::Display for DestinationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Queue => f.write_str("Queue"),
            Self::Topic => f.write_str("Topic"),
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
