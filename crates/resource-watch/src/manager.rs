//! The watch manager and the task that owns every connection.
//!
//! [`WatchManager`] is a cheap, clonable handle. All state lives in a single
//! background task that processes commands one at a time:
//! - Subscribe / unsubscribe with connection de-duplication and a cleanup
//!   grace period
//! - Reconnection after stream closure, expiry and failures
//! - Periodic health checks of connected streams
//! - Pausing and resuming on visibility changes
//!
//! Driver and timer tasks only hold weak senders, so the task exits (and
//! cancels everything) once every manager handle and subscription is dropped.

use std::{sync::Arc, time::Duration};

use tokio::{
    sync::{mpsc, oneshot},
    task::JoinHandle,
    time::{Instant, Interval, MissedTickBehavior, interval_at, sleep},
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::{
    config::WatchConfig,
    driver::{Driver, DriverExit, DriverMessage},
    error::{WatchError, WatchResult},
    options::{WatchKey, WatchOptions},
    reconnect::{CloseKind, StreamSummary, calculate_backoff, classify_close},
    registry::{ConnectionRegistry, ConnectionState, ConnectionStatus, Timer, WatchConnection},
    request::{PathResolver, WatchRequest},
    subscription::Subscription,
    transport::WatchTransport,
    types::{WatchEvent, WatchStatus},
};

// ============================================================================
// Command Types
// ============================================================================

/// Commands processed by the manager task.
pub(crate) enum Command {
    /// Attach a subscriber, creating the connection if needed.
    Subscribe {
        options: WatchOptions,
        reply_tx: oneshot::Sender<WatchResult<Attached>>,
    },
    /// Detach one subscriber from a connection.
    Unsubscribe {
        key: WatchKey,
        connection_id: u64,
        subscriber_id: u64,
    },
    /// Pause or resume all connections.
    SetVisibility { visibility: Visibility },
    /// Close every connection.
    DisconnectAll { reply_tx: oneshot::Sender<()> },
    /// Snapshot every connection.
    Status {
        reply_tx: oneshot::Sender<Vec<ConnectionStatus>>,
    },
    /// Progress from a driver run.
    Driver {
        key: WatchKey,
        generation: u64,
        message: DriverMessage,
    },
    /// A reconnect delay elapsed.
    ReconnectDue { key: WatchKey, generation: u64 },
    /// A cleanup grace period elapsed.
    CleanupDue { key: WatchKey, timer_id: u64 },
}

/// Reply to a successful subscribe.
pub(crate) struct Attached {
    key: WatchKey,
    connection_id: u64,
    subscriber_id: u64,
    rx: mpsc::UnboundedReceiver<WatchEvent>,
}

/// Whether the consuming UI is currently shown.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Visibility {
    /// Connections run normally.
    #[default]
    Visible,
    /// Connections are paused; unused ones are closed.
    Hidden,
}

// ============================================================================
// WatchManager
// ============================================================================

/// Handle to a pool of shared, self-healing watch connections.
///
/// Subscriptions with equal [`WatchOptions::key`]s share one connection.
#[derive(Clone)]
pub struct WatchManager {
    cmd_tx: mpsc::Sender<Command>,
}

impl WatchManager {
    /// Validate `config` and spawn the manager task.
    ///
    /// # Errors
    ///
    /// Returns an error if configuration validation fails.
    ///
    /// # Panics
    ///
    /// Panics if called outside a Tokio runtime.
    pub fn new<T, R>(config: WatchConfig, transport: T, resolver: R) -> WatchResult<Self>
    where
        T: WatchTransport,
        R: PathResolver,
    {
        config.validate().map_err(WatchError::config)?;

        let config = Arc::new(config);
        let (cmd_tx, cmd_rx) = mpsc::channel(config.command_channel_capacity);

        let actor = WatchActor {
            config,
            transport: Arc::new(transport),
            resolver: Arc::new(resolver),
            cmd_rx,
            cmd_tx: cmd_tx.downgrade(),
            registry: ConnectionRegistry::new(),
            shutdown: CancellationToken::new(),
            health: None,
            visibility: Visibility::Visible,
        };
        tokio::spawn(actor.run());

        Ok(Self { cmd_tx })
    }

    /// Create a manager that talks HTTP to `config.base_url`.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration or base URL is invalid.
    #[cfg(feature = "http")]
    pub fn with_http<R: PathResolver>(config: WatchConfig, resolver: R) -> WatchResult<Self> {
        let transport = crate::transport::HttpTransport::new(&config)?;
        Self::new(config, transport, resolver)
    }

    /// Subscribe to a watch.
    ///
    /// Joins the existing connection for the same key, or opens a new one.
    ///
    /// # Errors
    ///
    /// Returns an error if `options` are invalid, the path cannot be resolved,
    /// or the manager has shut down.
    pub async fn subscribe(&self, options: WatchOptions) -> WatchResult<Subscription> {
        options.validate().map_err(WatchError::config)?;

        let (reply_tx, reply_rx) = oneshot::channel();
        self.send(Command::Subscribe { options, reply_tx }).await?;
        let attached = reply_rx.await.map_err(|_| WatchError::ManagerClosed)??;

        Ok(Subscription::new(
            attached.key,
            attached.connection_id,
            attached.subscriber_id,
            attached.rx,
            self.cmd_tx.clone(),
        ))
    }

    /// Pause (hidden) or resume (visible) every connection.
    ///
    /// # Errors
    ///
    /// Returns an error if the manager has shut down.
    pub async fn set_visibility(&self, visibility: Visibility) -> WatchResult<()> {
        self.send(Command::SetVisibility { visibility }).await
    }

    /// Close every connection and forget all subscriptions.
    ///
    /// Existing [`Subscription`]s end; new ones can be created afterwards.
    ///
    /// # Errors
    ///
    /// Returns an error if the manager has shut down.
    pub async fn disconnect_all(&self) -> WatchResult<()> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.send(Command::DisconnectAll { reply_tx }).await?;
        reply_rx.await.map_err(|_| WatchError::ManagerClosed)
    }

    /// Number of registered connections.
    ///
    /// # Errors
    ///
    /// Returns an error if the manager has shut down.
    pub async fn connection_count(&self) -> WatchResult<usize> {
        Ok(self.connection_status().await?.len())
    }

    /// Diagnostic snapshot of every connection, ordered by key.
    ///
    /// # Errors
    ///
    /// Returns an error if the manager has shut down.
    pub async fn connection_status(&self) -> WatchResult<Vec<ConnectionStatus>> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.send(Command::Status { reply_tx }).await?;
        reply_rx.await.map_err(|_| WatchError::ManagerClosed)
    }

    /// Check whether the manager task is still running.
    pub fn is_running(&self) -> bool {
        !self.cmd_tx.is_closed()
    }

    async fn send(&self, command: Command) -> WatchResult<()> {
        self.cmd_tx
            .send(command)
            .await
            .map_err(|_| WatchError::ManagerClosed)
    }
}

impl std::fmt::Debug for WatchManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WatchManager")
            .field("running", &self.is_running())
            .finish()
    }
}

// ============================================================================
// Manager task
// ============================================================================

struct WatchActor {
    config: Arc<WatchConfig>,
    transport: Arc<dyn WatchTransport>,
    resolver: Arc<dyn PathResolver>,
    cmd_rx: mpsc::Receiver<Command>,
    cmd_tx: mpsc::WeakSender<Command>,
    registry: ConnectionRegistry,
    /// Parent of every connection token.
    shutdown: CancellationToken,
    /// Running only while at least one connection exists.
    health: Option<Interval>,
    visibility: Visibility,
}

impl WatchActor {
    async fn run(mut self) {
        info!("Starting watch manager");

        loop {
            tokio::select! {
                cmd = self.cmd_rx.recv() => {
                    match cmd {
                        Some(cmd) => self.handle(cmd),
                        None => {
                            info!("All watch handles dropped; shutting down manager");
                            break;
                        }
                    }
                }
                () = next_tick(&mut self.health) => self.check_health(),
            }
        }

        self.disconnect_all();
        self.shutdown.cancel();
        info!("Watch manager stopped");
    }

    fn handle(&mut self, cmd: Command) {
        match cmd {
            Command::Subscribe { options, reply_tx } => {
                let result = self.subscribe(options);
                // The caller went away before the reply; undo the attach.
                if let Err(Ok(attached)) = reply_tx.send(result) {
                    self.unsubscribe(attached.key, attached.connection_id, attached.subscriber_id);
                }
            }
            Command::Unsubscribe {
                key,
                connection_id,
                subscriber_id,
            } => self.unsubscribe(key, connection_id, subscriber_id),
            Command::SetVisibility { visibility } => self.set_visibility(visibility),
            Command::DisconnectAll { reply_tx } => {
                self.disconnect_all();
                let _ = reply_tx.send(());
            }
            Command::Status { reply_tx } => {
                let _ = reply_tx.send(self.registry.statuses(Instant::now()));
            }
            Command::Driver {
                key,
                generation,
                message,
            } => self.on_driver_message(key, generation, message),
            Command::ReconnectDue { key, generation } => self.on_reconnect_due(key, generation),
            Command::CleanupDue { key, timer_id } => self.on_cleanup_due(key, timer_id),
        }
    }

    // ------------------------------------------------------------------------
    // Subscriptions
    // ------------------------------------------------------------------------

    fn subscribe(&mut self, options: WatchOptions) -> WatchResult<Attached> {
        let key = options.key();
        let subscriber_id = self.registry.next_id();

        if let Some(conn) = self.registry.get_mut(&key) {
            let rx = conn.attach(subscriber_id);
            debug!(
                key = %key,
                subscribers = conn.subscriber_count(),
                "Joined existing watch connection"
            );
            return Ok(Attached {
                key,
                connection_id: conn.id,
                subscriber_id,
                rx,
            });
        }

        let path = self.resolver.resolve(&options)?;
        let connection_id = self.registry.next_id();
        let mut conn = WatchConnection::new(connection_id, options, path);
        let rx = conn.attach(subscriber_id);

        let paused = self.visibility == Visibility::Hidden;
        if paused {
            conn.state = ConnectionState::Paused;
        }
        self.registry.insert(key.clone(), conn);
        info!(key = %key, paused, "Opened watch connection");

        if !paused {
            self.start(&key);
        }
        self.ensure_health_check();

        Ok(Attached {
            key,
            connection_id,
            subscriber_id,
            rx,
        })
    }

    fn unsubscribe(&mut self, key: WatchKey, connection_id: u64, subscriber_id: u64) {
        let timer_id = self.registry.next_id();
        let Some(conn) = self.registry.get_mut(&key) else {
            return;
        };
        if conn.id != connection_id {
            return;
        }
        if !conn.detach(subscriber_id) {
            debug!(
                key = %key,
                subscribers = conn.subscriber_count(),
                "Subscriber left watch connection"
            );
            return;
        }

        let grace = self.config.cleanup_grace;
        debug!(
            key = %key,
            grace_ms = grace.as_millis() as u64,
            "Last subscriber left, scheduling cleanup"
        );
        let handle = schedule(
            &self.cmd_tx,
            grace,
            Command::CleanupDue {
                key: key.clone(),
                timer_id,
            },
        );
        conn.cleanup = Some(Timer::new(timer_id, handle));
    }

    fn on_cleanup_due(&mut self, key: WatchKey, timer_id: u64) {
        let Some(conn) = self.registry.get_mut(&key) else {
            return;
        };
        if conn.cleanup.as_ref().map(Timer::id) != Some(timer_id) {
            return;
        }
        conn.cleanup = None;
        if conn.subscriber_count() > 0 {
            return;
        }

        if let Some(mut conn) = self.registry.remove(&key) {
            conn.cancel();
        }
        info!(key = %key, "Closed unused watch connection");
        self.stop_health_check_if_idle();
    }

    // ------------------------------------------------------------------------
    // Connection lifecycle
    // ------------------------------------------------------------------------

    /// Start a fresh driver run, superseding any previous one.
    fn start(&mut self, key: &WatchKey) {
        let generation = self.registry.next_id();
        let Some(conn) = self.registry.get_mut(key) else {
            return;
        };

        conn.token.cancel();
        conn.token = self.shutdown.child_token();
        conn.generation = generation;
        conn.reconnect = None;
        conn.state = ConnectionState::Connecting;
        conn.last_activity = Instant::now();

        let request = WatchRequest::build(
            &conn.options,
            conn.path.clone(),
            &conn.resource_version,
            &self.config,
        );
        Driver {
            key: key.clone(),
            generation,
            request,
            transport: Arc::clone(&self.transport),
            config: Arc::clone(&self.config),
            token: conn.token.clone(),
            cmd_tx: self.cmd_tx.clone(),
        }
        .spawn();
    }

    /// Restart immediately with the attempt counter reset.
    fn force_reconnect(&mut self, key: &WatchKey, reason: &str) {
        let Some(conn) = self.registry.get_mut(key) else {
            return;
        };
        warn!(key = %key, reason, "Forcing watch reconnect");
        conn.attempts = 0;
        self.start(key);
    }

    fn schedule_reconnect(&mut self, key: &WatchKey, delay: Duration) {
        let timer_id = self.registry.next_id();
        let Some(conn) = self.registry.get_mut(key) else {
            return;
        };

        let handle = schedule(
            &self.cmd_tx,
            delay,
            Command::ReconnectDue {
                key: key.clone(),
                generation: conn.generation,
            },
        );
        conn.state = ConnectionState::Reconnecting {
            attempt: conn.attempts,
        };
        conn.reconnect = Some(Timer::new(timer_id, handle));
        debug!(
            key = %key,
            attempt = conn.attempts,
            delay_ms = delay.as_millis() as u64,
            "Watch reconnect scheduled"
        );
    }

    fn on_reconnect_due(&mut self, key: WatchKey, generation: u64) {
        let Some(conn) = self.registry.get(&key) else {
            return;
        };
        if conn.generation != generation
            || conn.token.is_cancelled()
            || !matches!(conn.state, ConnectionState::Reconnecting { .. })
        {
            return;
        }
        self.start(&key);
    }

    fn on_driver_message(&mut self, key: WatchKey, generation: u64, message: DriverMessage) {
        let Some(conn) = self.registry.get_mut(&key) else {
            return;
        };
        if conn.generation != generation || conn.token.is_cancelled() {
            debug!(key = %key, generation, "Ignoring message from superseded watch driver");
            return;
        }

        match message {
            DriverMessage::Connected => {
                conn.state = ConnectionState::Connected;
                conn.last_activity = Instant::now();
                info!(
                    key = %key,
                    resource_version = %conn.resource_version,
                    "Watch stream established"
                );
            }
            DriverMessage::Chunk { events } => {
                conn.last_activity = Instant::now();
                for event in events {
                    if let Some(version) = event.resource_version() {
                        conn.advance_resource_version(version);
                    }
                    conn.publish(&event);
                }
            }
            DriverMessage::Exited(exit) => self.on_driver_exit(&key, exit),
        }
    }

    fn on_driver_exit(&mut self, key: &WatchKey, exit: DriverExit) {
        let Some(conn) = self.registry.get_mut(key) else {
            return;
        };

        match exit {
            DriverExit::Expired => {
                warn!(
                    key = %key,
                    resource_version = %conn.resource_version,
                    "Watch resource version expired, resyncing from 0"
                );
                conn.reset_resource_version();
                let delay = self.config.expired_reconnect_delay;
                self.schedule_reconnect(key, delay);
            }
            DriverExit::IdleTimeout => self.force_reconnect(key, "idle timeout"),
            DriverExit::Ended {
                received_data,
                open_for,
            } => {
                let summary = StreamSummary {
                    received_data,
                    open_for,
                    single_resource: conn.options.is_single_resource(),
                    resource_version: &conn.resource_version,
                };
                match classify_close(summary, self.config.min_healthy_duration) {
                    CloseKind::Healthy => {
                        conn.attempts = 0;
                        let delay = self.config.healthy_reconnect_delay;
                        self.schedule_reconnect(key, delay);
                    }
                    CloseKind::SingleResourceIdle => {
                        conn.attempts = 0;
                        let delay = self.config.single_resource_reconnect_delay;
                        self.schedule_reconnect(key, delay);
                    }
                    CloseKind::Premature => self.on_failure(
                        key,
                        WatchError::stream(format!(
                            "stream closed after {}ms (received data: {received_data})",
                            open_for.as_millis()
                        )),
                    ),
                }
            }
            DriverExit::Failed(err) => self.on_failure(key, err),
        }
    }

    fn on_failure(&mut self, key: &WatchKey, err: WatchError) {
        let max_attempts = self.config.reconnect_max_attempts;
        let backoff = self.config.backoff();
        let Some(conn) = self.registry.get_mut(key) else {
            return;
        };

        if conn.attempts + 1 >= max_attempts {
            conn.attempts = max_attempts;
            conn.state = ConnectionState::Closed;
            conn.reconnect = None;
            error!(
                key = %key,
                attempts = max_attempts,
                error = %err,
                "Max watch reconnect attempts exceeded"
            );
            conn.publish(&WatchEvent::Error(WatchStatus::reconnect_failed(
                max_attempts,
                &err.to_string(),
            )));
            return;
        }

        let delay = calculate_backoff(backoff, conn.attempts);
        conn.attempts += 1;
        warn!(
            key = %key,
            attempt = conn.attempts,
            delay_ms = delay.as_millis() as u64,
            error = %err,
            "Watch connection failed, reconnecting after backoff"
        );
        self.schedule_reconnect(key, delay);
    }

    // ------------------------------------------------------------------------
    // Health check
    // ------------------------------------------------------------------------

    fn ensure_health_check(&mut self) {
        if self.health.is_some() || self.registry.is_empty() {
            return;
        }
        let period = self.config.health_check_interval;
        let mut interval = interval_at(Instant::now() + period, period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        self.health = Some(interval);
        debug!(period_ms = period.as_millis() as u64, "Health check started");
    }

    fn stop_health_check_if_idle(&mut self) {
        if self.registry.is_empty() && self.health.take().is_some() {
            debug!("Health check stopped");
        }
    }

    fn check_health(&mut self) {
        let now = Instant::now();
        let stale_after = self.config.stale_after;
        let stale: Vec<(WatchKey, Duration)> = self
            .registry
            .iter()
            .filter(|(_, conn)| conn.state.is_connected())
            .map(|(key, conn)| (key.clone(), now.saturating_duration_since(conn.last_activity)))
            .filter(|(_, idle)| *idle > stale_after)
            .collect();

        for (key, idle) in stale {
            warn!(key = %key, idle_ms = idle.as_millis() as u64, "Watch connection stale");
            self.force_reconnect(&key, "stale connection");
        }
    }

    // ------------------------------------------------------------------------
    // Visibility and shutdown
    // ------------------------------------------------------------------------

    fn set_visibility(&mut self, visibility: Visibility) {
        if visibility == self.visibility {
            return;
        }
        self.visibility = visibility;

        match visibility {
            Visibility::Hidden => {
                let mut paused = 0usize;
                for key in self.registry.keys() {
                    let Some(conn) = self.registry.get_mut(&key) else {
                        continue;
                    };
                    conn.cancel();
                    if conn.subscriber_count() == 0 {
                        self.registry.remove(&key);
                    } else {
                        conn.state = ConnectionState::Paused;
                        paused += 1;
                    }
                }
                self.stop_health_check_if_idle();
                info!(paused, "Watch connections paused");
            }
            Visibility::Visible => {
                let keys = self.registry.keys();
                info!(connections = keys.len(), "Resuming watch connections");
                for key in keys {
                    if let Some(conn) = self.registry.get_mut(&key) {
                        conn.attempts = 0;
                    }
                    self.start(&key);
                }
            }
        }
    }

    fn disconnect_all(&mut self) {
        let connections = self.registry.drain();
        let count = connections.len();
        for (_, mut conn) in connections {
            conn.cancel();
        }
        self.health = None;
        if count > 0 {
            info!(connections = count, "Disconnected all watch connections");
        }
    }
}

/// Send `command` to the manager after `delay`.
fn schedule(
    cmd_tx: &mpsc::WeakSender<Command>,
    delay: Duration,
    command: Command,
) -> JoinHandle<()> {
    let cmd_tx = cmd_tx.clone();
    tokio::spawn(async move {
        sleep(delay).await;
        if let Some(cmd_tx) = cmd_tx.upgrade() {
            let _ = cmd_tx.send(command).await;
        }
    })
}

async fn next_tick(health: &mut Option<Interval>) {
    match health {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending().await,
    }
}
