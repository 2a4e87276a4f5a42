//! Subscription worker: receive, decode, deliver.
//!
//! [`SubscriptionWorker`] binds one consumer to one destination on the
//! connection owned by a [`ConnectionManager`] and runs a periodic receive
//! task. The task owns the consumer exclusively — no lock is held across a
//! receive — and re-attaches from the manager's live session whenever the
//! link goes unhealthy, on the same capped backoff cadence the connection
//! monitor uses. Deliveries to the byte-sink are strictly sequential within
//! one worker.

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{watch, Mutex};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::backoff::Backoff;
use crate::broker::{BrokerConsumer, MessageBody};
use crate::config::DestinationConfig;
use crate::connection::{ConnectionManager, ServiceState};
use crate::error::TransportError;
use crate::sink::ByteSink;
use crate::task::TaskHandle;

/// State guarded by the per-instance lock.
struct Inner {
    task: Option<TaskHandle>,
}

/// Owns a single consumer bound to one destination and forwards decoded
/// payloads to the registered byte-sink.
///
/// Created after the owning [`ConnectionManager`] reaches Running; holds a
/// non-owning reference to its connection and session — it closes only its
/// own consumer, never the link.
pub struct SubscriptionWorker {
    manager: Arc<ConnectionManager>,
    destination: DestinationConfig,
    sink: Arc<dyn ByteSink>,
    timeout: Duration,
    /// Unique tag generated once per worker instance, attached to every
    /// delivery so the sink can disambiguate concurrent sources.
    channel_id: String,
    state: Arc<AtomicU8>,
    inner: Arc<Mutex<Inner>>,
}

impl SubscriptionWorker {
    /// Creates a worker for the given (already validated) destination.
    /// `timeout` bounds each receive and is the base of the backoff formula.
    #[must_use]
    pub fn new(
        manager: Arc<ConnectionManager>,
        destination: DestinationConfig,
        sink: Arc<dyn ByteSink>,
        timeout: Duration,
    ) -> Self {
        Self {
            manager,
            destination,
            sink,
            timeout,
            channel_id: Uuid::new_v4().to_string(),
            state: Arc::new(AtomicU8::new(ServiceState::Stopped as u8)),
            inner: Arc::new(Mutex::new(Inner { task: None })),
        }
    }

    /// Current lifecycle state. The worker has no persistent error state:
    /// failed setup leaves it `Stopped` and the caller decides on a retry.
    #[must_use]
    pub fn state(&self) -> ServiceState {
        ServiceState::from_u8(self.state.load(Ordering::SeqCst))
    }

    /// `true` while the receive task is scheduled.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.state() == ServiceState::Running
    }

    /// The channel identifier attached to every delivery from this worker.
    #[must_use]
    pub fn channel_id(&self) -> &str {
        &self.channel_id
    }

    /// Attaches the consumer and schedules the receive task. A no-op while
    /// already running.
    ///
    /// The owning connection's validity is checked once, at call time; later
    /// invalidation is handled by the receive task's restart path.
    ///
    /// # Errors
    ///
    /// Returns `TransportError::NotRunning` when the owning connection and
    /// session are not presently live, or `TransportError::Consumer` when
    /// consumer creation fails — in both cases nothing is scheduled.
    pub async fn start(&self) -> Result<(), TransportError> {
        let mut inner = self.inner.lock().await;
        if self.is_running() && inner.task.is_some() {
            debug!(destination = %self.destination.name, "subscription worker already running");
            return Ok(());
        }
        self.state
            .store(ServiceState::Starting as u8, Ordering::SeqCst);

        let consumer = match attach(&self.manager, &self.destination).await {
            Ok(consumer) => consumer,
            Err(e) => {
                self.state
                    .store(ServiceState::Stopped as u8, Ordering::SeqCst);
                return Err(e);
            }
        };
        info!(
            destination = %self.destination.name,
            kind = %self.destination.kind,
            channel = %self.channel_id,
            "consumer attached"
        );

        self.spawn_receive_locked(&mut inner, consumer);
        self.state
            .store(ServiceState::Running as u8, Ordering::SeqCst);
        Ok(())
    }

    /// Stops the worker: cancels the receive task (bounded grace, then
    /// forced); the task closes its own consumer on the way out. Idempotent
    /// and best-effort. The failure counter starts fresh on the next start.
    pub async fn stop(&self) {
        let mut inner = self.inner.lock().await;
        if let Some(task) = inner.task.take() {
            task.cancel(self.timeout).await;
        }
        self.state
            .store(ServiceState::Stopped as u8, Ordering::SeqCst);
        debug!(destination = %self.destination.name, "subscription worker stopped");
    }

    /// Spawns the receive task. Caller holds the instance lock, guaranteeing
    /// at most one receive task exists.
    fn spawn_receive_locked(&self, inner: &mut Inner, consumer: Box<dyn BrokerConsumer>) {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let manager = Arc::clone(&self.manager);
        let destination = self.destination.clone();
        let sink = Arc::clone(&self.sink);
        let channel_id = self.channel_id.clone();
        let timeout = self.timeout;

        let join = tokio::spawn(receive_loop(
            consumer,
            manager,
            destination,
            sink,
            channel_id,
            timeout,
            shutdown_rx,
        ));
        inner.task = Some(TaskHandle::new(shutdown_tx, join));
    }
}

impl std::fmt::Debug for SubscriptionWorker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubscriptionWorker")
            .field("destination", &self.destination.name)
            .field("kind", &self.destination.kind)
            .field("channel_id", &self.channel_id)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

/// Attaches a consumer through the manager's live session.
async fn attach(
    manager: &Arc<ConnectionManager>,
    destination: &DestinationConfig,
) -> Result<Box<dyn BrokerConsumer>, TransportError> {
    let session = manager.session().await?;
    let consumer = session.lock().await.attach_consumer(destination).await?;
    Ok(consumer)
}

/// The periodic receive-decode-deliver cycle.
///
/// Healthy cycle: one bounded receive, decode, synchronous delivery of any
/// non-empty payload. Unhealthy cycle: count a failure, drop the stale
/// consumer, and try to re-attach from whatever session the manager
/// currently exposes. Errors never terminate the loop; they feed the shared
/// backoff formula and nudge the manager's fast-path reconnect.
async fn receive_loop(
    consumer: Box<dyn BrokerConsumer>,
    manager: Arc<ConnectionManager>,
    destination: DestinationConfig,
    sink: Arc<dyn ByteSink>,
    channel_id: String,
    timeout: Duration,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    let mut consumer = Some(consumer);
    let mut backoff = Backoff::new(timeout);

    loop {
        let delay = backoff.delay();
        tokio::select! {
            biased;
            _ = shutdown_rx.changed() => break,
            () = tokio::time::sleep(delay) => {}
        }
        if *shutdown_rx.borrow() {
            break;
        }

        match consumer.take() {
            Some(mut active) if manager.is_running() => match active.receive(timeout).await {
                Ok(Some(body)) => {
                    if let Some(payload) = decode_body(body) {
                        if !payload.is_empty() {
                            sink.receive(&payload, &channel_id);
                        }
                    }
                    backoff.reset();
                    consumer = Some(active);
                }
                Ok(None) => {
                    backoff.reset();
                    consumer = Some(active);
                }
                Err(e) => {
                    backoff.record_failure();
                    warn!(
                        destination = %destination.name,
                        retries = backoff.retries(),
                        error = %e,
                        "receive failed"
                    );
                    manager.notify_disconnected();
                    // Drop the consumer so the next cycle re-attaches against
                    // whatever session the manager restores.
                    active.close().await;
                }
            },
            stale => {
                // No consumer, or the owning link is down.
                backoff.record_failure();
                if let Some(mut stale) = stale {
                    stale.close().await;
                }
                match attach(&manager, &destination).await {
                    Ok(fresh) => {
                        consumer = Some(fresh);
                        backoff.reset();
                        info!(destination = %destination.name, "consumer re-attached");
                    }
                    Err(e) => {
                        // A session can die while the connection monitor
                        // still sees a healthy link; without the nudge it
                        // would never re-establish and attach could fail
                        // forever.
                        manager.notify_disconnected();
                        debug!(
                            destination = %destination.name,
                            retries = backoff.retries(),
                            error = %e,
                            "re-attach not possible yet"
                        );
                    }
                }
            }
        }
    }

    if let Some(mut active) = consumer.take() {
        active.close().await;
    }
}

/// Decodes a message body into payload bytes by concrete shape.
///
/// Text becomes its UTF-8 encoding, binary passes through unchanged, and any
/// other shape is logged and dropped. Dropped messages do not feed the
/// backoff counter: a malformed payload is a data problem, not a
/// connectivity problem.
fn decode_body(body: MessageBody) -> Option<Vec<u8>> {
    match body {
        MessageBody::Text(text) => Some(text.into_bytes()),
        MessageBody::Binary(bytes) => Some(bytes),
        MessageBody::Other(shape) => {
            warn!(shape = %shape, "dropping message with unexpected body shape");
            None
        }
    }
}
