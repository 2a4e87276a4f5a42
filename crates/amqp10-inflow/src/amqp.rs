//! AMQP 1.0 broker binding backed by `fe2o3-amqp`.
//!
//! All protocol types stay inside this module; the rest of the crate sees
//! only the broker traits and [`MessageBody`]. Library errors are rendered
//! to text at the boundary so callers never depend on protocol error types.

use std::time::Duration;

use async_trait::async_trait;
use fe2o3_amqp::connection::ConnectionHandle;
use fe2o3_amqp::sasl_profile::SaslProfile;
use fe2o3_amqp::session::SessionHandle;
use fe2o3_amqp::types::messaging::{AmqpValue, Body};
use fe2o3_amqp::types::primitives::Value;
use fe2o3_amqp::{Connection, Receiver, Session};
use tracing::debug;
use uuid::Uuid;

use crate::broker::{Broker, BrokerConnection, BrokerConsumer, BrokerSession, MessageBody};
use crate::config::{ConnectionConfig, DestinationConfig, SaslMode};
use crate::error::TransportError;

/// [`Broker`] implementation speaking AMQP 1.0 over TCP or TLS.
///
/// Stateless; every [`Broker::connect`] opens an independent transport.
#[derive(Debug, Default, Clone, Copy)]
pub struct AmqpBroker;

#[async_trait]
impl Broker for AmqpBroker {
    async fn connect(
        &self,
        config: &ConnectionConfig,
    ) -> Result<Box<dyn BrokerConnection>, TransportError> {
        let scheme = if config.use_tls { "amqps" } else { "amqp" };
        let url = format!("{scheme}://{}:{}", config.host, config.port);
        let container_id = format!("amqp10-inflow-{}", Uuid::new_v4());
        debug!(url = %url, container = %container_id, "opening AMQP connection");

        let builder = Connection::builder().container_id(container_id);
        let handle = match sasl_profile(config) {
            Some(profile) => builder.sasl_profile(profile).open(&url[..]).await,
            None => builder.open(&url[..]).await,
        }
        .map_err(|e| TransportError::connection(&config.host, e))?;

        Ok(Box::new(AmqpConnection {
            host: config.host.clone(),
            handle: Some(handle),
        }))
    }
}

/// SASL layer selected by the configuration; `None` opens without SASL.
fn sasl_profile(config: &ConnectionConfig) -> Option<SaslProfile> {
    if !config.auth_required {
        return None;
    }
    match config.sasl_mode {
        Some(SaslMode::Anonymous) | None => Some(SaslProfile::Anonymous),
        Some(SaslMode::Plain) => Some(SaslProfile::Plain {
            username: config.username.clone().unwrap_or_default(),
            password: config.password.clone().unwrap_or_default(),
        }),
    }
}

struct AmqpConnection {
    host: String,
    // Option so close() can hand the handle to the library by value.
    handle: Option<ConnectionHandle<()>>,
}

#[async_trait]
impl BrokerConnection for AmqpConnection {
    async fn begin_session(&mut self) -> Result<Box<dyn BrokerSession>, TransportError> {
        let handle = self
            .handle
            .as_mut()
            .ok_or_else(|| TransportError::connection(&self.host, "connection already closed"))?;
        let session = Session::begin(handle)
            .await
            .map_err(|e| TransportError::connection(&self.host, e))?;
        Ok(Box::new(AmqpSession {
            handle: Some(session),
        }))
    }

    async fn close(&mut self) {
        if let Some(mut handle) = self.handle.take() {
            if let Err(e) = handle.close().await {
                debug!(host = %self.host, error = %e, "connection close reported an error");
            }
        }
    }
}

struct AmqpSession {
    handle: Option<SessionHandle<()>>,
}

#[async_trait]
impl BrokerSession for AmqpSession {
    async fn attach_consumer(
        &mut self,
        destination: &DestinationConfig,
    ) -> Result<Box<dyn BrokerConsumer>, TransportError> {
        let consumer_error = |e: &dyn std::fmt::Display| TransportError::Consumer {
            kind: destination.kind,
            name: destination.name.clone(),
            reason: e.to_string(),
        };
        let handle = self
            .handle
            .as_mut()
            .ok_or_else(|| consumer_error(&"session already closed"))?;

        let link_name = format!("{}-{}", destination.name, Uuid::new_v4());
        let receiver = Receiver::attach(handle, link_name, &destination.name[..])
            .await
            .map_err(|e| consumer_error(&e))?;
        Ok(Box::new(AmqpConsumer {
            destination: destination.clone(),
            receiver: Some(receiver),
        }))
    }

    async fn close(&mut self) {
        if let Some(mut handle) = self.handle.take() {
            if let Err(e) = handle.end().await {
                debug!(error = %e, "session end reported an error");
            }
        }
    }
}

struct AmqpConsumer {
    destination: DestinationConfig,
    receiver: Option<Receiver>,
}

#[async_trait]
impl BrokerConsumer for AmqpConsumer {
    async fn receive(&mut self, wait: Duration) -> Result<Option<MessageBody>, TransportError> {
        let destination = &self.destination;
        let receiver = self.receiver.as_mut().ok_or_else(|| TransportError::Consumer {
            kind: destination.kind,
            name: destination.name.clone(),
            reason: "consumer already closed".into(),
        })?;

        let delivery = match tokio::time::timeout(wait, receiver.recv::<Body<Value>>()).await {
            // No message within the window; a quiet link is not a failure.
            Err(_elapsed) => return Ok(None),
            Ok(Err(e)) => {
                return Err(TransportError::Consumer {
                    kind: destination.kind,
                    name: destination.name.clone(),
                    reason: e.to_string(),
                })
            }
            Ok(Ok(delivery)) => delivery,
        };

        let body = map_body(delivery.body());
        receiver
            .accept(&delivery)
            .await
            .map_err(|e| TransportError::Consumer {
                kind: destination.kind,
                name: destination.name.clone(),
                reason: e.to_string(),
            })?;
        Ok(Some(body))
    }

    async fn close(&mut self) {
        if let Some(receiver) = self.receiver.take() {
            if let Err(e) = receiver.close().await {
                debug!(destination = %self.destination.name, error = %e, "receiver close reported an error");
            }
        }
    }
}

/// Maps a wire body onto the crate's shape-based model by inspecting the
/// concrete section, not any declared content type.
fn map_body(body: &Body<Value>) -> MessageBody {
    match body {
        Body::Value(AmqpValue(Value::String(text))) => MessageBody::Text(text.clone()),
        Body::Value(AmqpValue(Value::Binary(bytes))) => MessageBody::Binary(bytes.to_vec()),
        Body::Data(batch) => {
            MessageBody::Binary(batch.iter().flat_map(|data| data.0.iter().copied()).collect())
        }
        Body::Value(AmqpValue(other)) => MessageBody::Other(format!("amqp-value {other:?}")),
        Body::Sequence(_) => MessageBody::Other("amqp-sequence".into()),
        _ => MessageBody::Other("empty body".into()),
    }
}
