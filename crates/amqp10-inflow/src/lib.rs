//! # AMQP 1.0 Inflow
//!
//! Resilient AMQP 1.0 ingestion: a connection service and a subscription
//! worker that establish a broker link, poll a queue or topic for messages,
//! and deliver decoded payload bytes to a host-supplied sink. Both parts
//! self-heal on a shared capped exponential-backoff cadence, so transient
//! broker outages never require host intervention.
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use amqp10_inflow::{
//!     AmqpBroker, ChannelSink, ConnectionConfig, DestinationConfig, DestinationKind,
//!     InboundTransport,
//! };
//!
//! # async fn run() -> Result<(), amqp10_inflow::TransportError> {
//! let connection = ConnectionConfig {
//!     host: "broker.example".into(),
//!     ..ConnectionConfig::default()
//! };
//! let destination = DestinationConfig {
//!     kind: DestinationKind::Topic,
//!     name: "telemetry".into(),
//! };
//! let (sink, mut payloads) = ChannelSink::new(1024);
//!
//! let transport = InboundTransport::new(
//!     Arc::new(AmqpBroker),
//!     connection,
//!     destination,
//!     Arc::new(sink),
//! )?;
//! transport.start().await?;
//!
//! while let Some(msg) = payloads.recv().await {
//!     println!("{} bytes on channel {}", msg.payload.len(), msg.channel_id);
//! }
//! # Ok(())
//! # }
//! ```

#![deny(missing_docs)]
#![warn(clippy::all, clippy::pedantic)]

/// AMQP 1.0 broker binding backed by `fe2o3-amqp`
pub mod amqp;

/// Capped exponential retry backoff shared by all self-healing loops
pub mod backoff;

/// Broker abstraction: connection, session, and consumer seams
pub mod broker;

/// Connection and destination configuration records
pub mod config;

/// Connection lifecycle management and self-healing monitor
pub mod connection;

/// Subscription worker: receive, decode, deliver
pub mod consumer;

/// Error types
pub mod error;

/// Payload delivery sinks
pub mod sink;

/// Top-level inbound transport surface
pub mod transport;

mod task;

#[cfg(test)]
pub(crate) mod testing;

pub use amqp::AmqpBroker;
pub use backoff::{Backoff, DEFAULT_TIMEOUT, MAX_WAIT};
pub use broker::{Broker, BrokerConnection, BrokerConsumer, BrokerSession, MessageBody};
pub use config::{ConnectionConfig, DestinationConfig, DestinationKind, SaslMode};
pub use connection::{ConnectionManager, ServiceState};
pub use consumer::SubscriptionWorker;
pub use error::TransportError;
pub use sink::{ByteSink, ChannelSink, SinkMessage};
pub use transport::InboundTransport;
