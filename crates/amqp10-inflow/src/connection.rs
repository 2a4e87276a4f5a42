//! Connection lifecycle management: establish, monitor, self-heal.
//!
//! [`ConnectionManager`] owns the single broker connection and session. A
//! dedicated monitor task re-checks health on a capped exponential-backoff
//! cadence and re-establishes the link after failures; a broker-initiated
//! disconnect can additionally nudge the monitor out of its wait for a
//! fast-path reconnect. All state transitions are serialized by one lock per
//! instance, and at most one monitor task exists at any instant.

use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{watch, Mutex, Notify};
use tracing::{debug, info, warn};

use crate::backoff::Backoff;
use crate::broker::{Broker, BrokerConnection, BrokerSession};
use crate::config::ConnectionConfig;
use crate::error::TransportError;
use crate::task::TaskHandle;

/// Shared handle to the broker connection owned by a [`ConnectionManager`].
///
/// Holders other than the owning manager must never close it.
pub type SharedConnection = Arc<Mutex<Box<dyn BrokerConnection>>>;

/// Shared handle to the session owned by a [`ConnectionManager`].
pub type SharedSession = Arc<Mutex<Box<dyn BrokerSession>>>;

/// Lifecycle state shared by the managed components.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ServiceState {
    /// Not started, or torn down.
    Stopped = 0,
    /// Setup in progress.
    Starting = 1,
    /// Live and monitored.
    Running = 2,
    /// Last setup or health cycle failed; retried on the backoff cadence.
    Error = 3,
}

impl ServiceState {
    pub(crate) fn from_u8(value: u8) -> Self {
        match value {
            1 => Self::Starting,
            2 => Self::Running,
            3 => Self::Error,
            _ => Self::Stopped,
        }
    }
}

/// The live (connection, session) pair.
struct Link {
    connection: SharedConnection,
    session: SharedSession,
}

/// State guarded by the per-instance lock.
struct Inner {
    link: Option<Link>,
    monitor: Option<TaskHandle>,
    backoff: Backoff,
}

/// Owns the broker connection and session and keeps them alive.
///
/// Components that depend on the link query [`ConnectionManager::is_running`]
/// (the single source of truth) and borrow the handles through
/// [`ConnectionManager::connection`] / [`ConnectionManager::session`], which
/// fail fast with [`TransportError::NotRunning`] while the link is down.
pub struct ConnectionManager {
    broker: Arc<dyn Broker>,
    config: ConnectionConfig,
    timeout: Duration,
    state: Arc<AtomicU8>,
    /// Set when a transport-level disconnect was reported; cleared once the
    /// link is re-established.
    suspect: Arc<AtomicBool>,
    /// Nudges the monitor out of its scheduled wait for an immediate retry.
    reconnect: Arc<Notify>,
    inner: Arc<Mutex<Inner>>,
}

impl ConnectionManager {
    /// Creates a manager for the given broker and (already validated)
    /// connection parameters. `timeout` is the per-cycle health interval and
    /// the base of the backoff formula.
    #[must_use]
    pub fn new(broker: Arc<dyn Broker>, config: ConnectionConfig, timeout: Duration) -> Self {
        Self {
            broker,
            config,
            timeout,
            state: Arc::new(AtomicU8::new(ServiceState::Stopped as u8)),
            suspect: Arc::new(AtomicBool::new(false)),
            reconnect: Arc::new(Notify::new()),
            inner: Arc::new(Mutex::new(Inner {
                link: None,
                monitor: None,
                backoff: Backoff::new(timeout),
            })),
        }
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn state(&self) -> ServiceState {
        ServiceState::from_u8(self.state.load(Ordering::SeqCst))
    }

    /// `true` while the connection, session, and monitor task are all live
    /// and no disconnect has been reported.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.state() == ServiceState::Running && !self.suspect.load(Ordering::SeqCst)
    }

    /// Host this manager connects to.
    #[must_use]
    pub fn host(&self) -> &str {
        &self.config.host
    }

    /// Establishes the connection and session and schedules the monitor
    /// task. Idempotent: a no-op while already running.
    ///
    /// # Errors
    ///
    /// Returns `TransportError::Connection` when either the transport open
    /// or the session handshake fails; the failure counter is incremented
    /// and no monitor task is scheduled.
    pub async fn start(&self) -> Result<(), TransportError> {
        let mut inner = self.inner.lock().await;
        if self.is_running() && inner.link.is_some() {
            debug!(host = %self.config.host, "connection service already running");
            return Ok(());
        }
        self.state
            .store(ServiceState::Starting as u8, Ordering::SeqCst);

        // Clear any stale state without resetting the failure counter; only
        // a successful establishment or an explicit stop() does that.
        if let Some(task) = inner.monitor.take() {
            task.cancel(self.timeout).await;
        }
        close_link(inner.link.take()).await;

        if let Err(e) = establish(&self.broker, &self.config, &mut inner).await {
            self.state.store(ServiceState::Error as u8, Ordering::SeqCst);
            return Err(e);
        }
        self.suspect.store(false, Ordering::SeqCst);
        self.spawn_monitor_locked(&mut inner);
        inner.backoff.reset();
        self.state
            .store(ServiceState::Running as u8, Ordering::SeqCst);
        info!(host = %self.config.host, "connection service started");
        Ok(())
    }

    /// Stops the manager: cancels the monitor task (bounded grace, then
    /// forced), closes the session, closes the connection, and resets the
    /// failure counter. Idempotent and best-effort; each step runs
    /// regardless of whether prior steps failed.
    pub async fn stop(&self) {
        let mut inner = self.inner.lock().await;
        if let Some(task) = inner.monitor.take() {
            task.cancel(self.timeout).await;
        }
        close_link(inner.link.take()).await;
        inner.backoff.reset();
        self.suspect.store(false, Ordering::SeqCst);
        self.state
            .store(ServiceState::Stopped as u8, Ordering::SeqCst);
        debug!(host = %self.config.host, "connection service stopped");
    }

    /// Returns the live connection handle.
    ///
    /// # Errors
    ///
    /// Returns `TransportError::NotRunning` unless the manager is running.
    pub async fn connection(&self) -> Result<SharedConnection, TransportError> {
        let inner = self.inner.lock().await;
        if self.is_running() {
            if let Some(link) = inner.link.as_ref() {
                return Ok(Arc::clone(&link.connection));
            }
        }
        Err(TransportError::NotRunning(self.config.host.clone()))
    }

    /// Returns the live session handle.
    ///
    /// # Errors
    ///
    /// Returns `TransportError::NotRunning` unless the manager is running.
    pub async fn session(&self) -> Result<SharedSession, TransportError> {
        let inner = self.inner.lock().await;
        if self.is_running() {
            if let Some(link) = inner.link.as_ref() {
                return Ok(Arc::clone(&link.session));
            }
        }
        Err(TransportError::NotRunning(self.config.host.clone()))
    }

    /// Reports a transport-level disconnect (broker-initiated close, receive
    /// failure). Marks the link suspect and nudges the monitor task for an
    /// immediate reconnect attempt outside the scheduled cadence. The nudge
    /// runs on the monitor's own serialized queue, so it cannot race the
    /// periodic health check.
    pub fn notify_disconnected(&self) {
        self.suspect.store(true, Ordering::SeqCst);
        self.reconnect.notify_one();
    }

    /// Spawns the monitor task. Caller holds the instance lock, guaranteeing
    /// at most one monitor exists.
    fn spawn_monitor_locked(&self, inner: &mut Inner) {
        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
        let broker = Arc::clone(&self.broker);
        let config = self.config.clone();
        let state = Arc::clone(&self.state);
        let suspect = Arc::clone(&self.suspect);
        let reconnect = Arc::clone(&self.reconnect);
        let shared = Arc::clone(&self.inner);

        let join = tokio::spawn(async move {
            loop {
                let delay = { shared.lock().await.backoff.delay() };
                tokio::select! {
                    biased;
                    _ = shutdown_rx.changed() => break,
                    () = tokio::time::sleep(delay) => {}
                    () = reconnect.notified() => {
                        debug!(host = %config.host, "fast-path reconnect requested");
                    }
                }
                if *shutdown_rx.borrow() {
                    break;
                }

                let mut inner = shared.lock().await;
                // Re-validate after acquiring the lock: stop() may have torn
                // everything down while this task waited.
                if *shutdown_rx.borrow() {
                    break;
                }

                if inner.link.is_some() && !suspect.load(Ordering::SeqCst) {
                    inner.backoff.reset();
                    continue;
                }

                close_link(inner.link.take()).await;
                match establish(&broker, &config, &mut inner).await {
                    Ok(()) => {
                        suspect.store(false, Ordering::SeqCst);
                        inner.backoff.reset();
                        state.store(ServiceState::Running as u8, Ordering::SeqCst);
                        info!(host = %config.host, "connection re-established");
                    }
                    Err(e) => {
                        state.store(ServiceState::Error as u8, Ordering::SeqCst);
                        warn!(
                            host = %config.host,
                            retries = inner.backoff.retries(),
                            error = %e,
                            "reconnect attempt failed"
                        );
                    }
                }
            }
        });

        inner.monitor = Some(TaskHandle::new(shutdown_tx, join));
    }
}

impl std::fmt::Debug for ConnectionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionManager")
            .field("host", &self.config.host)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

/// Connects and opens one session, storing the pair in `inner` on success.
/// Increments the failure counter on either failure.
async fn establish(
    broker: &Arc<dyn Broker>,
    config: &ConnectionConfig,
    inner: &mut Inner,
) -> Result<(), TransportError> {
    let mut connection = match broker.connect(config).await {
        Ok(connection) => connection,
        Err(e) => {
            inner.backoff.record_failure();
            warn!(host = %config.host, error = %e, "connection attempt failed");
            return Err(e);
        }
    };
    info!(host = %config.host, "connection established");

    let session = match connection.begin_session().await {
        Ok(session) => session,
        Err(e) => {
            inner.backoff.record_failure();
            warn!(host = %config.host, error = %e, "session handshake failed");
            connection.close().await;
            return Err(e);
        }
    };
    info!(host = %config.host, "session open");

    inner.link = Some(Link {
        connection: Arc::new(Mutex::new(connection)),
        session: Arc::new(Mutex::new(session)),
    });
    Ok(())
}

/// Closes the session and then the connection. Each step is independent and
/// best-effort.
async fn close_link(link: Option<Link>) {
    let Some(link) = link else { return };
    link.session.lock().await.close().await;
    link.connection.lock().await.close().await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MockBroker;

    fn test_config() -> ConnectionConfig {
        ConnectionConfig {
            host: "broker.example".into(),
            ..ConnectionConfig::default()
        }
    }

    const TIMEOUT: Duration = Duration::from_millis(5_000);

    fn manager(mock: &Arc<MockBroker>) -> ConnectionManager {
        ConnectionManager::new(
            Arc::clone(mock) as Arc<dyn Broker>,
            test_config(),
            TIMEOUT,
        )
    }

    #[tokio::test(start_paused = true)]
    async fn test_start_establishes_connection_and_session() {
        let mock = Arc::new(MockBroker::default());
        let mgr = manager(&mock);

        mgr.start().await.expect("start succeeds");
        assert!(mgr.is_running());
        assert_eq!(mgr.state(), ServiceState::Running);
        assert_eq!(mock.connect_attempts(), 1);
        assert!(mgr.connection().await.is_ok());
        assert!(mgr.session().await.is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_start_is_idempotent_while_running() {
        let mock = Arc::new(MockBroker::default());
        let mgr = manager(&mock);

        mgr.start().await.expect("first start");
        mgr.start().await.expect("second start is a no-op");
        assert_eq!(mock.connect_attempts(), 1, "no duplicate connection");
    }

    #[tokio::test(start_paused = true)]
    async fn test_start_failure_surfaces_connection_error() {
        let mock = Arc::new(MockBroker::default());
        mock.fail_next_connects(1);
        let mgr = manager(&mock);

        let err = mgr.start().await.expect_err("start fails");
        assert!(matches!(err, TransportError::Connection { .. }));
        assert!(err.to_string().contains("broker.example"));
        assert_eq!(mgr.state(), ServiceState::Error);
        assert!(!mgr.is_running());
        assert!(matches!(
            mgr.session().await,
            Err(TransportError::NotRunning(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_session_failure_closes_fresh_connection_and_surfaces_error() {
        let mock = Arc::new(MockBroker::default());
        mock.fail_next_sessions(1);
        let mgr = manager(&mock);

        let err = mgr.start().await.expect_err("session handshake fails");
        assert!(matches!(err, TransportError::Connection { .. }));
        assert!(err.to_string().contains("broker.example"));
        assert_eq!(mgr.state(), ServiceState::Error);
        assert_eq!(mock.connect_attempts(), 1);
        assert_eq!(
            mock.closed_connections(),
            1,
            "the half-open connection is not leaked"
        );
        assert!(matches!(
            mgr.session().await,
            Err(TransportError::NotRunning(_))
        ));

        // The failure counted toward backoff; success resets it.
        mgr.start().await.expect("retry succeeds");
        assert!(mgr.is_running());
        assert_eq!(mock.connect_attempts(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_handles_unavailable_before_start() {
        let mock = Arc::new(MockBroker::default());
        let mgr = manager(&mock);

        assert!(matches!(
            mgr.connection().await,
            Err(TransportError::NotRunning(_))
        ));
        assert!(matches!(
            mgr.session().await,
            Err(TransportError::NotRunning(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_is_idempotent_even_when_never_started() {
        let mock = Arc::new(MockBroker::default());
        let mgr = manager(&mock);

        mgr.stop().await;
        mgr.stop().await;
        assert_eq!(mgr.state(), ServiceState::Stopped);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_closes_session_then_connection() {
        let mock = Arc::new(MockBroker::default());
        let mgr = manager(&mock);

        mgr.start().await.expect("start");
        mgr.stop().await;

        assert_eq!(mgr.state(), ServiceState::Stopped);
        assert_eq!(mock.closed_sessions(), 1);
        assert_eq!(mock.closed_connections(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_monitor_reconnects_after_disconnect_report() {
        let mock = Arc::new(MockBroker::default());
        let mgr = manager(&mock);

        mgr.start().await.expect("start");
        mgr.notify_disconnected();
        assert!(!mgr.is_running(), "suspect link is reported as not running");

        // Let the monitor observe the suspect flag and re-establish.
        tokio::time::sleep(TIMEOUT * 3).await;

        assert!(mgr.is_running());
        assert!(mock.connect_attempts() >= 2);
        assert!(mock.closed_sessions() >= 1, "stale link was torn down");
    }

    #[tokio::test(start_paused = true)]
    async fn test_monitor_backs_off_through_repeated_failures() {
        let mock = Arc::new(MockBroker::default());
        let mgr = manager(&mock);

        mgr.start().await.expect("start");
        mock.fail_next_connects(2);
        mgr.notify_disconnected();

        // The nudge retries immediately (fails), then after 10s (fails),
        // then after a further 20s of backoff the connect succeeds.
        tokio::time::sleep(Duration::from_millis(60_000)).await;

        assert!(mgr.is_running(), "recovered after backoff");
        // Initial connect, two failed retries, one successful retry.
        assert_eq!(mock.connect_attempts(), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_restart_after_stop() {
        let mock = Arc::new(MockBroker::default());
        let mgr = manager(&mock);

        mgr.start().await.expect("start");
        mgr.stop().await;
        mgr.start().await.expect("start again");

        assert!(mgr.is_running());
        assert_eq!(mock.connect_attempts(), 2);
    }
}
