//! # Connection Lifecycle Manager
//!
//! Owns at most one live connection to a configured address and hands it out
//! to concurrent callers. The connection is established lazily on the first
//! [`ConnectionManager::acquire`], shared by every later caller, and closed by
//! a background reclamation task once nobody has borrowed it for the idle
//! timeout. The next `acquire` after that starts a fresh connection epoch.
//!
//! Two synchronization domains are used:
//! - a fine-grained lock over the handle and its recency timestamp, held only
//!   for in-memory reads and writes, so already-connected callers never wait
//!   behind I/O;
//! - a creation section (async mutex) admitting one connect or disconnect at a
//!   time, so a thundering herd of first callers produces exactly one connect.
//!
//! ## Example Usage
//!
//! ```rust,no_run
//! use dbproxy::{ConnectionManager, ManagerSettings, PostgresConnector};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let manager = ConnectionManager::new(
//!     "postgresql://postgres@localhost:5432/postgres",
//!     PostgresConnector::new(),
//!     ManagerSettings::default(),
//! );
//!
//! let connection = manager.acquire().await?;
//! let rows = connection.query("SELECT 1", &[]).await?;
//! drop(connection);
//!
//! manager.shutdown().await?;
//! # Ok(())
//! # }
//! ```

use crate::connection::{redact_address, Connector, PostgresConnector};
use crate::error::{ConnectError, DisconnectError};
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::{oneshot, Mutex as AsyncMutex};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, timeout, timeout_at, Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

/// Idle time after which a connection is reclaimed
pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(5 * 60);

/// How often the reclamation task inspects recency
pub const DEFAULT_CHECK_INTERVAL: Duration = Duration::from_secs(60);

/// Upper bound for one connect attempt
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Upper bound for one disconnect
pub const DEFAULT_DISCONNECT_TIMEOUT: Duration = Duration::from_secs(2);

/// Timing configuration of a [`ConnectionManager`], fixed at construction
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ManagerSettings {
    /// Reclaim the connection once it has not been borrowed for this long
    pub idle_timeout: Duration,

    /// Interval between reclamation checks
    pub check_interval: Duration,

    /// Bound applied to every connect attempt
    pub connect_timeout: Duration,

    /// Bound applied to the disconnect of an idle connection, and the default
    /// bound of [`ConnectionManager::shutdown`]
    pub disconnect_timeout: Duration,
}

impl Default for ManagerSettings {
    fn default() -> Self {
        Self {
            idle_timeout: DEFAULT_IDLE_TIMEOUT,
            check_interval: DEFAULT_CHECK_INTERVAL,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            disconnect_timeout: DEFAULT_DISCONNECT_TIMEOUT,
        }
    }
}

impl ManagerSettings {
    /// Create settings with the default timeouts
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the idle timeout
    #[must_use]
    pub const fn with_idle_timeout(mut self, idle_timeout: Duration) -> Self {
        self.idle_timeout = idle_timeout;
        self
    }

    /// Set the reclamation check interval
    #[must_use]
    pub const fn with_check_interval(mut self, check_interval: Duration) -> Self {
        self.check_interval = check_interval;
        self
    }

    /// Set the connect timeout
    #[must_use]
    pub const fn with_connect_timeout(mut self, connect_timeout: Duration) -> Self {
        self.connect_timeout = connect_timeout;
        self
    }

    /// Set the disconnect timeout
    #[must_use]
    pub const fn with_disconnect_timeout(mut self, disconnect_timeout: Duration) -> Self {
        self.disconnect_timeout = disconnect_timeout;
        self
    }
}

/// Point-in-time view of a manager, for status output and tests
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ManagerStats {
    /// Whether a connection is currently held
    pub connected: bool,

    /// Number of the current (or last) connection epoch; 0 before the first connect
    pub epoch: u64,

    /// Time since the connection was last borrowed
    #[serde(with = "humantime_serde")]
    pub idle_for: Option<Duration>,

    /// Successful connects over the manager's lifetime
    pub connects: u64,

    /// Failed connect attempts
    pub connect_failures: u64,

    /// Connections closed for inactivity
    pub reclaims: u64,

    /// Connections closed by an explicit shutdown
    pub shutdowns: u64,

    /// Connections discarded by [`ConnectionManager::invalidate`]
    pub invalidations: u64,

    /// Disconnects that failed or timed out
    pub disconnect_failures: u64,

    /// Reclamation tasks currently running (never more than one)
    pub reclaimers_running: usize,

    /// Wall-clock time of the last successful connect
    pub last_connected_at: Option<DateTime<Utc>>,
}

struct State<T> {
    handle: Option<Arc<T>>,
    last_used: Instant,
    epoch: u64,
}

/// Watchdog of one connection epoch
struct Reclaimer {
    epoch: u64,
    stop: Option<oneshot::Sender<()>>,
    task: JoinHandle<()>,
}

impl Reclaimer {
    fn signal_stop(&mut self) {
        if let Some(stop) = self.stop.take() {
            // The task may already have exited after reclaiming.
            let _ = stop.send(());
        }
    }
}

#[derive(Default)]
struct Counters {
    connects: AtomicU64,
    connect_failures: AtomicU64,
    reclaims: AtomicU64,
    shutdowns: AtomicU64,
    invalidations: AtomicU64,
    disconnect_failures: AtomicU64,
    reclaimers_running: Arc<AtomicUsize>,
}

/// Decrements the running-reclaimer gauge when a reclamation task exits
struct RunningGuard(Arc<AtomicUsize>);

impl RunningGuard {
    fn enter(gauge: &Arc<AtomicUsize>) -> Self {
        gauge.fetch_add(1, Ordering::SeqCst);
        Self(Arc::clone(gauge))
    }
}

impl Drop for RunningGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

enum Tick {
    Keep,
    Done,
}

struct Shared<C: Connector> {
    address: String,
    redacted: String,
    connector: C,
    settings: ManagerSettings,
    state: RwLock<State<C::Connection>>,
    creation: AsyncMutex<()>,
    /// Completed connect attempts, successful or not
    attempts: AtomicU64,
    /// Outcome of the most recent attempt, `None` if it succeeded
    last_failure: Mutex<Option<ConnectError>>,
    reclaimer: Mutex<Option<Reclaimer>>,
    last_connected_at: Mutex<Option<DateTime<Utc>>>,
    counters: Counters,
}

/// Lazily connecting, idle-reclaiming owner of one shared connection
///
/// Cloning is cheap; clones share the same connection and state. Dropping
/// the last clone stops the reclamation task and drops the connection.
pub struct ConnectionManager<C: Connector> {
    shared: Arc<Shared<C>>,
}

impl<C: Connector> Clone for ConnectionManager<C> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl ConnectionManager<PostgresConnector> {
    /// Create a manager for a `PostgreSQL` connection string
    #[must_use]
    pub fn postgres(address: impl Into<String>, settings: ManagerSettings) -> Self {
        Self::new(address, PostgresConnector::new(), settings)
    }
}

impl<C: Connector> ConnectionManager<C> {
    /// Create a manager with no connection
    ///
    /// Nothing is dialed until the first [`acquire`](Self::acquire).
    #[must_use]
    pub fn new(address: impl Into<String>, connector: C, settings: ManagerSettings) -> Self {
        let address = address.into();
        let redacted = redact_address(&address);
        debug!(
            "Creating connection manager for {} (idle_timeout={:?}, check_interval={:?})",
            redacted, settings.idle_timeout, settings.check_interval
        );

        Self {
            shared: Arc::new(Shared {
                address,
                redacted,
                connector,
                settings,
                state: RwLock::new(State {
                    handle: None,
                    last_used: Instant::now(),
                    epoch: 0,
                }),
                creation: AsyncMutex::new(()),
                attempts: AtomicU64::new(0),
                last_failure: Mutex::new(None),
                reclaimer: Mutex::new(None),
                last_connected_at: Mutex::new(None),
                counters: Counters::default(),
            }),
        }
    }

    /// Borrow the live connection, connecting first if there is none
    ///
    /// The returned handle is valid for the caller's current unit of work
    /// only. The manager may disconnect it once it has gone idle, so callers
    /// must acquire again for every request instead of caching it.
    ///
    /// Concurrent callers that find no connection wait for a single connect
    /// attempt and all receive its outcome.
    pub async fn acquire(&self) -> Result<Arc<C::Connection>, ConnectError> {
        let observed = self.shared.attempts.load(Ordering::Acquire);

        if let Some(connection) = self.shared.borrow_live() {
            return Ok(connection);
        }

        self.shared.connect_exclusive(observed).await
    }

    /// [`acquire`](Self::acquire) bounded by a caller-supplied timeout
    ///
    /// Expiry maps to [`ConnectError::Timeout`]. Abandoning a connect this
    /// way leaves the manager disconnected; the next caller retries.
    pub async fn acquire_within(&self, bound: Duration) -> Result<Arc<C::Connection>, ConnectError> {
        timeout(bound, self.acquire())
            .await
            .map_err(|_| ConnectError::Timeout { after: bound })?
    }

    /// Stop the reclamation task and close the connection, if any
    ///
    /// Bounded by the configured disconnect timeout. Calling this with no
    /// live connection succeeds without doing anything. The manager stays
    /// usable: a later `acquire` reconnects.
    pub async fn shutdown(&self) -> Result<(), DisconnectError> {
        self.shutdown_within(self.shared.settings.disconnect_timeout)
            .await
    }

    /// [`shutdown`](Self::shutdown) with a caller-supplied bound
    ///
    /// One deadline covers both the wait for an in-flight connect or
    /// disconnect and the disconnect itself. If the deadline passes while
    /// waiting, the connect in flight is left alone and
    /// [`DisconnectError::Timeout`] is returned. Once a handle is taken it
    /// is cleared even when the disconnect fails or times out.
    pub async fn shutdown_within(&self, bound: Duration) -> Result<(), DisconnectError> {
        let shared = &self.shared;
        let deadline = Instant::now() + bound;
        shared.signal_reclaimer_stop();

        let Ok(_creation) = timeout_at(deadline, shared.creation.lock()).await else {
            warn!(
                "Shutdown of {} timed out after {:?} behind a connect in progress",
                shared.redacted, bound
            );
            return Err(DisconnectError::Timeout { after: bound });
        };
        // A connect may have completed while we waited; stop its watchdog too.
        shared.signal_reclaimer_stop();

        let taken = shared.state.write().handle.take();
        let Some(connection) = taken else {
            debug!("Shutdown requested with no live connection");
            return Ok(());
        };

        shared.counters.shutdowns.fetch_add(1, Ordering::Relaxed);
        info!("Disconnecting from {}", shared.redacted);

        match shared.disconnect_until(&connection, deadline, bound).await {
            Ok(()) => {
                info!("Disconnected from {}", shared.redacted);
                Ok(())
            }
            Err(e) => {
                error!("Failed to disconnect from {}: {}", shared.redacted, e);
                Err(e)
            }
        }
    }

    /// Close `stale` if it is still the live connection
    ///
    /// For callers whose borrowed connection turned out to be unusable.
    /// Returns `Ok(false)` without touching anything when the manager has
    /// already moved on to another connection, so a newer connection is never
    /// closed on behalf of an old handle. Bounded by the configured disconnect
    /// timeout.
    pub async fn invalidate(&self, stale: &Arc<C::Connection>) -> Result<bool, DisconnectError> {
        let shared = &self.shared;
        let bound = shared.settings.disconnect_timeout;
        let deadline = Instant::now() + bound;

        let Ok(_creation) = timeout_at(deadline, shared.creation.lock()).await else {
            return Err(DisconnectError::Timeout { after: bound });
        };

        let (taken, epoch) = {
            let mut state = shared.state.write();
            let current = state
                .handle
                .as_ref()
                .is_some_and(|handle| Arc::ptr_eq(handle, stale));
            (if current { state.handle.take() } else { None }, state.epoch)
        };
        let Some(connection) = taken else {
            debug!("Connection already replaced, nothing to invalidate");
            return Ok(false);
        };

        shared.signal_reclaimer_stop();
        shared.counters.invalidations.fetch_add(1, Ordering::Relaxed);
        info!(
            "Discarding unusable connection to {} (epoch {})",
            shared.redacted, epoch
        );

        if let Err(e) = shared.disconnect_until(&connection, deadline, bound).await {
            warn!("Disconnect of unusable connection failed, dropping it: {}", e);
            return Err(e);
        }
        Ok(true)
    }

    /// Whether a connection is currently held
    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.shared.state.read().handle.is_some()
    }

    /// When the current connection was last borrowed, `None` if disconnected
    #[must_use]
    pub fn last_used(&self) -> Option<Instant> {
        let state = self.shared.state.read();
        state.handle.as_ref().map(|_| state.last_used)
    }

    /// Number of the current (or last) connection epoch
    #[must_use]
    pub fn epoch(&self) -> u64 {
        self.shared.state.read().epoch
    }

    /// Whether the current epoch's reclamation task is still alive
    #[must_use]
    pub fn has_reclaimer(&self) -> bool {
        let epoch = self.epoch();
        self.shared
            .reclaimer
            .lock()
            .as_ref()
            .is_some_and(|r| r.epoch == epoch && r.stop.is_some() && !r.task.is_finished())
    }

    /// The managed address, with any password redacted
    #[must_use]
    pub fn address(&self) -> &str {
        &self.shared.redacted
    }

    /// The timing configuration
    #[must_use]
    pub fn settings(&self) -> ManagerSettings {
        self.shared.settings
    }

    /// The connector used to open and close connections
    #[must_use]
    pub fn connector(&self) -> &C {
        &self.shared.connector
    }

    /// Snapshot of the manager's state and counters
    #[must_use]
    pub fn stats(&self) -> ManagerStats {
        let shared = &self.shared;
        let (connected, epoch, idle_for) = {
            let state = shared.state.read();
            let connected = state.handle.is_some();
            (
                connected,
                state.epoch,
                connected.then(|| state.last_used.elapsed()),
            )
        };

        ManagerStats {
            connected,
            epoch,
            idle_for,
            connects: shared.counters.connects.load(Ordering::Relaxed),
            connect_failures: shared.counters.connect_failures.load(Ordering::Relaxed),
            reclaims: shared.counters.reclaims.load(Ordering::Relaxed),
            shutdowns: shared.counters.shutdowns.load(Ordering::Relaxed),
            invalidations: shared.counters.invalidations.load(Ordering::Relaxed),
            disconnect_failures: shared.counters.disconnect_failures.load(Ordering::Relaxed),
            reclaimers_running: shared.counters.reclaimers_running.load(Ordering::SeqCst),
            last_connected_at: *shared.last_connected_at.lock(),
        }
    }
}

impl<C: Connector> Shared<C> {
    /// Fast path: hand out the existing connection and refresh recency
    fn borrow_live(&self) -> Option<Arc<C::Connection>> {
        if self.state.read().handle.is_none() {
            return None;
        }

        let mut state = self.state.write();
        let handle = state.handle.clone()?;
        let now = Instant::now();
        if now > state.last_used {
            state.last_used = now;
        }
        Some(handle)
    }

    /// Slow path: the creation section
    async fn connect_exclusive(
        self: &Arc<Self>,
        observed: u64,
    ) -> Result<Arc<C::Connection>, ConnectError> {
        let _creation = self.creation.lock().await;

        if let Some(connection) = self.borrow_live() {
            debug!("Reusing connection created by a concurrent caller");
            return Ok(connection);
        }

        if self.attempts.load(Ordering::Acquire) != observed {
            let shared_failure = self.last_failure.lock().clone();
            if let Some(e) = shared_failure {
                debug!("Sharing outcome of a concurrent connect attempt: {}", e);
                return Err(e);
            }
        }

        info!("Connecting to {}", self.redacted);
        let bound = self.settings.connect_timeout;
        let outcome = match timeout(bound, self.connector.connect(&self.address)).await {
            Ok(result) => result,
            Err(_) => Err(ConnectError::Timeout { after: bound }),
        };

        match outcome {
            Ok(connection) => {
                let connection = Arc::new(connection);
                let epoch = {
                    let mut state = self.state.write();
                    state.handle = Some(Arc::clone(&connection));
                    state.last_used = Instant::now();
                    state.epoch += 1;
                    state.epoch
                };
                *self.last_failure.lock() = None;
                *self.last_connected_at.lock() = Some(Utc::now());
                self.attempts.fetch_add(1, Ordering::AcqRel);
                self.counters.connects.fetch_add(1, Ordering::Relaxed);

                self.start_reclaimer(epoch);
                info!("Connected to {} (epoch {})", self.redacted, epoch);
                Ok(connection)
            }
            Err(e) => {
                *self.last_failure.lock() = Some(e.clone());
                self.attempts.fetch_add(1, Ordering::AcqRel);
                self.counters.connect_failures.fetch_add(1, Ordering::Relaxed);
                error!("Failed to connect to {}: {}", self.redacted, e);
                Err(e)
            }
        }
    }

    /// Spawn the watchdog for `epoch` unless one already exists
    fn start_reclaimer(self: &Arc<Self>, epoch: u64) {
        let mut slot = self.reclaimer.lock();
        if slot.as_ref().is_some_and(|r| r.epoch == epoch) {
            return;
        }

        let previous = slot.take().map(|mut retired| {
            retired.signal_stop();
            retired.task
        });
        let (stop, stop_rx) = oneshot::channel();
        let task = tokio::spawn(reclaim_loop(Arc::downgrade(self), epoch, previous, stop_rx));

        *slot = Some(Reclaimer {
            epoch,
            stop: Some(stop),
            task,
        });
    }

    fn signal_reclaimer_stop(&self) {
        let mut slot = self.reclaimer.lock();
        if let Some(reclaimer) = slot.as_mut() {
            reclaimer.signal_stop();
        }
    }

    /// Disconnect a taken handle, giving up at `deadline`
    async fn disconnect_until(
        &self,
        connection: &C::Connection,
        deadline: Instant,
        bound: Duration,
    ) -> Result<(), DisconnectError> {
        let outcome = match timeout_at(deadline, self.connector.disconnect(connection)).await {
            Ok(result) => result,
            Err(_) => Err(DisconnectError::Timeout { after: bound }),
        };
        if outcome.is_err() {
            self.counters
                .disconnect_failures
                .fetch_add(1, Ordering::Relaxed);
        }
        outcome
    }

    /// One reclamation tick
    async fn reclaim_if_idle(&self, epoch: u64, stop: &mut oneshot::Receiver<()>) -> Tick {
        {
            let state = self.state.read();
            if state.epoch != epoch || state.handle.is_none() {
                return Tick::Done;
            }
            let idle_for = state.last_used.elapsed();
            debug!("Checking for stale connection (epoch {}, idle {:?})", epoch, idle_for);
            if idle_for <= self.settings.idle_timeout {
                return Tick::Keep;
            }
        }

        let _creation = tokio::select! {
            guard = self.creation.lock() => guard,
            _ = stop => return Tick::Done,
        };

        // Re-check under the lock: a borrower may have refreshed recency.
        let taken = {
            let mut state = self.state.write();
            if state.epoch != epoch || state.handle.is_none() {
                return Tick::Done;
            }
            if state.last_used.elapsed() <= self.settings.idle_timeout {
                return Tick::Keep;
            }
            state.handle.take()
        };

        if let Some(connection) = taken {
            let bound = self.settings.disconnect_timeout;
            match self
                .disconnect_until(&connection, Instant::now() + bound, bound)
                .await
            {
                Ok(()) => {}
                Err(DisconnectError::Timeout { .. }) => warn!(
                    "Disconnect of idle connection timed out after {:?}, dropping it",
                    bound
                ),
                Err(e) => warn!("Disconnect of idle connection failed, dropping it: {}", e),
            }
            self.counters.reclaims.fetch_add(1, Ordering::Relaxed);
            info!(
                "Disconnected idle connection to {} (epoch {})",
                self.redacted, epoch
            );
        }

        Tick::Done
    }
}

/// Body of the reclamation task for one epoch
///
/// Waits for the previous epoch's task to exit first, so at most one task
/// is ever past that point.
async fn reclaim_loop<C: Connector>(
    shared: Weak<Shared<C>>,
    epoch: u64,
    previous: Option<JoinHandle<()>>,
    mut stop: oneshot::Receiver<()>,
) {
    if let Some(previous) = previous {
        tokio::select! {
            _ = previous => {}
            _ = &mut stop => return,
        }
    }

    let (check_interval, _running) = {
        let Some(strong) = shared.upgrade() else {
            return;
        };
        (
            strong.settings.check_interval,
            RunningGuard::enter(&strong.counters.reclaimers_running),
        )
    };

    debug!("Reclamation task started (epoch {})", epoch);
    let mut ticker = interval_at(Instant::now() + check_interval, check_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = &mut stop => {
                debug!("Reclamation task stopped (epoch {})", epoch);
                return;
            }
        }

        let Some(strong) = shared.upgrade() else {
            return;
        };
        match strong.reclaim_if_idle(epoch, &mut stop).await {
            Tick::Keep => {}
            Tick::Done => {
                debug!("Reclamation task finished (epoch {})", epoch);
                return;
            }
        }
    }
}
