//! Scriptable in-process broker for lifecycle tests.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use crate::broker::{Broker, BrokerConnection, BrokerConsumer, BrokerSession, MessageBody};
use crate::config::{ConnectionConfig, DestinationConfig};
use crate::error::TransportError;

/// Counters and scripts shared by the broker and every handle it vends.
#[derive(Default)]
struct MockState {
    connect_attempts: AtomicUsize,
    attach_attempts: AtomicUsize,
    fail_connects: AtomicUsize,
    fail_sessions: AtomicUsize,
    fail_attaches: AtomicUsize,
    fail_receives: AtomicUsize,
    closed_connections: AtomicUsize,
    closed_sessions: AtomicUsize,
    closed_consumers: AtomicUsize,
    bodies: Mutex<VecDeque<MessageBody>>,
}

impl MockState {
    /// Decrements `counter` if positive, reporting whether this call should
    /// fail.
    fn take_failure(counter: &AtomicUsize) -> bool {
        counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

/// A broker whose failures and deliveries are scripted ahead of time.
///
/// Counters record every connect, attach, and close so tests can assert on
/// how the lifecycle code drove the broker. Scripted bodies are consumed in
/// order, one per receive; an exhausted script yields quiet polls.
#[derive(Default)]
pub(crate) struct MockBroker {
    state: Arc<MockState>,
}

impl MockBroker {
    pub(crate) fn fail_next_connects(&self, count: usize) {
        self.state.fail_connects.store(count, Ordering::SeqCst);
    }

    pub(crate) fn fail_next_sessions(&self, count: usize) {
        self.state.fail_sessions.store(count, Ordering::SeqCst);
    }

    pub(crate) fn fail_next_attaches(&self, count: usize) {
        self.state.fail_attaches.store(count, Ordering::SeqCst);
    }

    pub(crate) fn fail_next_receives(&self, count: usize) {
        self.state.fail_receives.store(count, Ordering::SeqCst);
    }

    pub(crate) fn script_body(&self, body: MessageBody) {
        self.state.bodies.lock().unwrap().push_back(body);
    }

    pub(crate) fn connect_attempts(&self) -> usize {
        self.state.connect_attempts.load(Ordering::SeqCst)
    }

    pub(crate) fn attach_attempts(&self) -> usize {
        self.state.attach_attempts.load(Ordering::SeqCst)
    }

    pub(crate) fn closed_connections(&self) -> usize {
        self.state.closed_connections.load(Ordering::SeqCst)
    }

    pub(crate) fn closed_sessions(&self) -> usize {
        self.state.closed_sessions.load(Ordering::SeqCst)
    }

    pub(crate) fn closed_consumers(&self) -> usize {
        self.state.closed_consumers.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Broker for MockBroker {
    async fn connect(
        &self,
        config: &ConnectionConfig,
    ) -> Result<Box<dyn BrokerConnection>, TransportError> {
        self.state.connect_attempts.fetch_add(1, Ordering::SeqCst);
        if MockState::take_failure(&self.state.fail_connects) {
            return Err(TransportError::connection(&config.host, "scripted failure"));
        }
        Ok(Box::new(MockConnection {
            state: Arc::clone(&self.state),
            host: config.host.clone(),
        }))
    }
}

struct MockConnection {
    state: Arc<MockState>,
    host: String,
}

#[async_trait]
impl BrokerConnection for MockConnection {
    async fn begin_session(&mut self) -> Result<Box<dyn BrokerSession>, TransportError> {
        if MockState::take_failure(&self.state.fail_sessions) {
            return Err(TransportError::connection(&self.host, "scripted failure"));
        }
        Ok(Box::new(MockSession {
            state: Arc::clone(&self.state),
        }))
    }

    async fn close(&mut self) {
        self.state.closed_connections.fetch_add(1, Ordering::SeqCst);
    }
}

struct MockSession {
    state: Arc<MockState>,
}

#[async_trait]
impl BrokerSession for MockSession {
    async fn attach_consumer(
        &mut self,
        destination: &DestinationConfig,
    ) -> Result<Box<dyn BrokerConsumer>, TransportError> {
        self.state.attach_attempts.fetch_add(1, Ordering::SeqCst);
        if MockState::take_failure(&self.state.fail_attaches) {
            return Err(TransportError::Consumer {
                kind: destination.kind,
                name: destination.name.clone(),
                reason: "scripted failure".into(),
            });
        }
        Ok(Box::new(MockConsumer {
            state: Arc::clone(&self.state),
            destination: destination.clone(),
        }))
    }

    async fn close(&mut self) {
        self.state.closed_sessions.fetch_add(1, Ordering::SeqCst);
    }
}

struct MockConsumer {
    state: Arc<MockState>,
    destination: DestinationConfig,
}

#[async_trait]
impl BrokerConsumer for MockConsumer {
    async fn receive(&mut self, _wait: Duration) -> Result<Option<MessageBody>, TransportError> {
        if MockState::take_failure(&self.state.fail_receives) {
            return Err(TransportError::Consumer {
                kind: self.destination.kind,
                name: self.destination.name.clone(),
                reason: "scripted failure".into(),
            });
        }
        Ok(self.state.bodies.lock().unwrap().pop_front())
    }

    async fn close(&mut self) {
        self.state.closed_consumers.fetch_add(1, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DestinationKind;

    #[tokio::test]
    async fn test_scripted_bodies_are_consumed_in_order() {
        let mock = MockBroker::default();
        mock.script_body(MessageBody::Text("a".into()));
        mock.script_body(MessageBody::Text("b".into()));

        let config = ConnectionConfig {
            host: "broker.example".into(),
            ..ConnectionConfig::default()
        };
        let destination = DestinationConfig {
            kind: DestinationKind::Queue,
            name: "events".into(),
        };

        let mut connection = mock.connect(&config).await.unwrap();
        let mut session = connection.begin_session().await.unwrap();
        let mut consumer = session.attach_consumer(&destination).await.unwrap();

        assert_eq!(
            consumer.receive(Duration::from_secs(1)).await.unwrap(),
            Some(MessageBody::Text("a".into()))
        );
        assert_eq!(
            consumer.receive(Duration::from_secs(1)).await.unwrap(),
            Some(MessageBody::Text("b".into()))
        );
        assert_eq!(consumer.receive(Duration::from_secs(1)).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_fail_next_connects_is_consumed() {
        let mock = MockBroker::default();
        mock.fail_next_connects(1);

        let config = ConnectionConfig {
            host: "broker.example".into(),
            ..ConnectionConfig::default()
        };
        assert!(mock.connect(&config).await.is_err());
        assert!(mock.connect(&config).await.is_ok());
        assert_eq!(mock.connect_attempts(), 2);
    }
}
