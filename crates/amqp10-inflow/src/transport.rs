//! Top-level inbound transport: one connection, one subscription, one sink.

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::backoff::DEFAULT_TIMEOUT;
use crate::broker::Broker;
use crate::config::{ConnectionConfig, DestinationConfig};
use crate::connection::{ConnectionManager, ServiceState};
use crate::consumer::SubscriptionWorker;
use crate::error::TransportError;
use crate::sink::ByteSink;

/// Aggregates a [`ConnectionManager`] and a [`SubscriptionWorker`] into one
/// start/stop surface for the host application.
///
/// Both parts self-heal independently once started; the transport's own
/// error state reflects only the most recent explicit `start` attempt.
pub struct InboundTransport {
    manager: Arc<ConnectionManager>,
    worker: SubscriptionWorker,
    state: Arc<AtomicU8>,
    /// Serializes start/stop transitions and holds the last setup error.
    last_error: Mutex<Option<String>>,
}

impl InboundTransport {
    /// Builds the transport with the default 5-second health interval.
    ///
    /// # Errors
    ///
    /// Returns `TransportError::Configuration` when either the connection or
    /// destination parameters fail validation.
    pub fn new(
        broker: Arc<dyn Broker>,
        connection: ConnectionConfig,
        destination: DestinationConfig,
        sink: Arc<dyn ByteSink>,
    ) -> Result<Self, TransportError> {
        Self::with_timeout(broker, connection, destination, sink, DEFAULT_TIMEOUT)
    }

    /// Builds the transport with an explicit health interval. `timeout`
    /// bounds each receive and health cycle and is the base of the backoff
    /// formula.
    ///
    /// # Errors
    ///
    /// Returns `TransportError::Configuration` when either the connection or
    /// destination parameters fail validation.
    pub fn with_timeout(
        broker: Arc<dyn Broker>,
        connection: ConnectionConfig,
        destination: DestinationConfig,
        sink: Arc<dyn ByteSink>,
        timeout: Duration,
    ) -> Result<Self, TransportError> {
        connection.validate()?;
        destination.validate()?;

        let manager = Arc::new(ConnectionManager::new(broker, connection, timeout));
        let worker =
            SubscriptionWorker::new(Arc::clone(&manager), destination, sink, timeout);
        Ok(Self {
            manager,
            worker,
            state: Arc::new(AtomicU8::new(ServiceState::Stopped as u8)),
            last_error: Mutex::new(None),
        })
    }

    /// Current lifecycle state of the transport as a whole.
    #[must_use]
    pub fn state(&self) -> ServiceState {
        ServiceState::from_u8(self.state.load(Ordering::SeqCst))
    }

    /// `true` while both the connection service and the subscription worker
    /// are live.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.state() == ServiceState::Running
            && self.manager.is_running()
            && self.worker.is_running()
    }

    /// The channel identifier the subscription attaches to every delivery.
    #[must_use]
    pub fn channel_id(&self) -> &str {
        self.worker.channel_id()
    }

    /// Human-readable reason for the most recent failed start, if any.
    pub async fn error_message(&self) -> Option<String> {
        self.last_error.lock().await.clone()
    }

    /// Starts the connection service and then the subscription worker.
    /// Idempotent while running. Partial failures tear both parts back down
    /// so a later retry starts from a clean slate.
    ///
    /// # Errors
    ///
    /// Propagates the first error from either part; the transport is left in
    /// the `Error` state with the rendered message retained.
    pub async fn start(&self) -> Result<(), TransportError> {
        let mut last_error = self.last_error.lock().await;
        if self.is_running() {
            debug!(host = %self.manager.host(), "transport already running");
            return Ok(());
        }
        self.state
            .store(ServiceState::Starting as u8, Ordering::SeqCst);

        // Clear any half-started remains of a previous attempt.
        self.worker.stop().await;
        self.manager.stop().await;

        let result = async {
            self.manager.start().await?;
            self.worker.start().await
        }
        .await;

        match result {
            Ok(()) => {
                *last_error = None;
                self.state
                    .store(ServiceState::Running as u8, Ordering::SeqCst);
                info!(host = %self.manager.host(), "inbound transport started");
                Ok(())
            }
            Err(e) => {
                self.worker.stop().await;
                self.manager.stop().await;
                warn!(host = %self.manager.host(), error = %e, "inbound transport failed to start");
                *last_error = Some(e.to_string());
                self.state.store(ServiceState::Error as u8, Ordering::SeqCst);
                Err(e)
            }
        }
    }

    /// Stops the subscription worker and then the connection service.
    /// Idempotent and best-effort; each step runs regardless of prior steps.
    pub async fn stop(&self) {
        let mut last_error = self.last_error.lock().await;
        self.worker.stop().await;
        self.manager.stop().await;
        *last_error = None;
        self.state
            .store(ServiceState::Stopped as u8, Ordering::SeqCst);
        info!(host = %self.manager.host(), "inbound transport stopped");
    }
}

impl std::fmt::Debug for InboundTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InboundTransport")
            .field("host", &self.manager.host())
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}
