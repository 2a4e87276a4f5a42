//! Transport seam between the lifecycle core and the wire protocol.
//!
//! The connection manager and subscription worker never touch the AMQP
//! library directly; they drive these boxed-dyn traits. The production
//! binding lives in [`crate::amqp`]; tests script an in-memory broker.
//!
//! `close()` on every handle is best-effort and infallible by contract:
//! implementations log failures and return, so teardown steps can run
//! independently of one another.

use std::time::Duration;

use async_trait::async_trait;

use crate::config::{ConnectionConfig, DestinationConfig};
use crate::error::TransportError;

/// Factory for broker connections.
#[async_trait]
pub trait Broker: Send + Sync {
    /// Opens a transport connection using the given parameters, selecting
    /// the authentication mode and TLS wrapping the configuration calls for.
    ///
    /// # Errors
    ///
    /// Returns `TransportError::Connection` carrying the host and the
    /// underlying cause when the transport cannot be established.
    async fn connect(
        &self,
        config: &ConnectionConfig,
    ) -> Result<Box<dyn BrokerConnection>, TransportError>;
}

/// One live transport connection.
#[async_trait]
pub trait BrokerConnection: Send {
    /// Opens one session on this connection.
    ///
    /// # Errors
    ///
    /// Returns `TransportError::Connection` when the session handshake fails.
    async fn begin_session(&mut self) -> Result<Box<dyn BrokerSession>, TransportError>;

    /// Closes the connection. Best-effort; never fails.
    async fn close(&mut self);
}

/// One logical session multiplexed over a connection.
#[async_trait]
pub trait BrokerSession: Send {
    /// Creates a consumer bound to the destination with at-least-once
    /// delivery and no server-side filtering (brokers that do not support a
    /// no-local filter are tolerated by never requesting one).
    ///
    /// # Errors
    ///
    /// Returns `TransportError::Consumer` when the broker rejects the link.
    async fn attach_consumer(
        &mut self,
        destination: &DestinationConfig,
    ) -> Result<Box<dyn BrokerConsumer>, TransportError>;

    /// Closes the session. Best-effort; never fails.
    async fn close(&mut self);
}

/// A consumer bound to one destination within one session.
#[async_trait]
pub trait BrokerConsumer: Send {
    /// Waits up to `wait` for the next message.
    ///
    /// Returns `Ok(None)` when nothing arrives within the bound — an empty
    /// cycle, not a failure.
    ///
    /// # Errors
    ///
    /// Returns `TransportError::Consumer` on transport-level receive
    /// failures (link detached, connection lost).
    async fn receive(&mut self, wait: Duration) -> Result<Option<MessageBody>, TransportError>;

    /// Closes the consumer link. Best-effort; never fails.
    async fn close(&mut self);
}

/// The concrete shape of a received message body.
///
/// The receive loop inspects the shape, not a self-declared type tag: text
/// and binary bodies become payload bytes, anything else is dropped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MessageBody {
    /// A string-typed body; encoded to UTF-8 bytes on delivery.
    Text(String),
    /// A binary-typed body; passed through unchanged.
    Binary(Vec<u8>),
    /// Any other shape, described for logging. Dropped on delivery.
    Other(String),
}
