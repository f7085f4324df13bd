use crate::client::connection::Connection;
use crate::client::metrics::ClientMetrics;
use crate::error::ClientError;
use crate::logger::{Logger, TracingLogger};
use crate::settings::ClientSettings;
use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::UnixStream;
use tokio::sync::{Mutex, Notify};
use tracing::{debug, trace, warn};

/// A negotiated connection over the daemon's Unix socket.
pub type UnixConnection = Connection<OwnedReadHalf, OwnedWriteHalf>;

#[derive(Clone)]
pub struct PoolConfig {
    /// Maximum number of concurrently open connections; clamped to at
    /// least one.
    pub max_connections: usize,
    /// Connections older than this are discarded instead of reused.
    pub max_connection_age: Duration,
    /// Timeout for acquiring a connection from a full pool.
    pub acquire_timeout: Duration,
    /// Timeout for establishing and negotiating a new connection.
    pub connection_timeout: Duration,
    /// Optional metrics for monitoring.
    pub metrics: Option<Arc<ClientMetrics>>,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_connections: 1,
            max_connection_age: Duration::from_secs(u32::MAX as u64),
            acquire_timeout: Duration::from_secs(30),
            connection_timeout: Duration::from_secs(10),
            metrics: None,
        }
    }
}

struct PoolState {
    /// Idle connections that passed the liveness check when released
    idle: VecDeque<UnixConnection>,
    /// Connections currently held by callers
    in_flight: usize,
    /// Base capacity
    capacity: usize,
    /// Tasks waiting for a connection
    waiting: usize,
}

impl PoolState {
    fn invariant(&self, extra_capacity: usize) -> bool {
        self.in_flight + self.idle.len() <= self.capacity + extra_capacity && self.capacity > 0
    }

    fn update_metrics(&self, metrics: &ClientMetrics) {
        metrics.idle_connections.set(self.idle.len() as i64);
        metrics.active_connections.set(self.in_flight as i64);
    }
}

enum AcquireResult {
    Success(UnixConnection),
    WaitRequired,
}

/// Bounded pool of daemon connections.
///
/// Invariant: `in_flight + idle <= capacity + extra_capacity`, where
/// `extra_capacity` is raised while a caller streams data that may
/// itself call back into the store.
pub struct ConnectionPool {
    state: Arc<Mutex<PoolState>>,
    socket_path: PathBuf,
    uri: String,
    config: PoolConfig,
    settings: ClientSettings,
    logger: Arc<dyn Logger>,
    available_notify: Arc<Notify>,
    /// Transient headroom granted by `reserve_capacity` while a caller
    /// streams data that may reentrantly use the store.
    extra_capacity: Arc<AtomicUsize>,
    /// Sticky: set on the first factory failure, fails every later
    /// acquire fast.
    failed: AtomicBool,
}

impl ConnectionPool {
    pub fn new(socket_path: PathBuf, settings: ClientSettings, config: PoolConfig) -> Self {
        Self::with_logger(socket_path, settings, config, Arc::new(TracingLogger))
    }

    pub fn with_logger(
        socket_path: PathBuf,
        settings: ClientSettings,
        config: PoolConfig,
        logger: Arc<dyn Logger>,
    ) -> Self {
        let state = PoolState {
            idle: VecDeque::new(),
            in_flight: 0,
            capacity: config.max_connections.max(1),
            waiting: 0,
        };
        debug_assert!(state.invariant(0));

        let uri = socket_path.display().to_string();
        Self {
            state: Arc::new(Mutex::new(state)),
            socket_path,
            uri,
            config,
            settings,
            logger,
            available_notify: Arc::new(Notify::new()),
            extra_capacity: Arc::new(AtomicUsize::new(0)),
            failed: AtomicBool::new(false),
        }
    }

    pub fn uri(&self) -> &str {
        &self.uri
    }

    /// Acquire a connection, creating one if the pool has room,
    /// otherwise waiting for a release.
    pub async fn acquire(&self) -> Result<PooledConnectionGuard, ClientError> {
        if self.failed.load(Ordering::Acquire) {
            return Err(ClientError::StoreUnavailable {
                uri: self.uri.clone(),
            });
        }

        let start = Instant::now();
        loop {
            match self.try_acquire(start).await? {
                AcquireResult::Success(conn) => {
                    return Ok(PooledConnectionGuard {
                        conn: Some(conn),
                        state: Arc::clone(&self.state),
                        notify: Arc::clone(&self.available_notify),
                        max_age: self.config.max_connection_age,
                        extra_capacity: Arc::clone(&self.extra_capacity),
                        metrics: self.config.metrics.clone(),
                    });
                }
                AcquireResult::WaitRequired => {
                    match tokio::time::timeout(
                        self.config.acquire_timeout,
                        self.available_notify.notified(),
                    )
                    .await
                    {
                        Ok(_) => {
                            let mut state = self.state.lock().await;
                            state.waiting = state.waiting.saturating_sub(1);
                        }
                        Err(_) => {
                            let mut state = self.state.lock().await;
                            state.waiting = state.waiting.saturating_sub(1);

                            if let Some(ref metrics) = self.config.metrics {
                                metrics
                                    .connection_errors
                                    .with_label_values(&["timeout"])
                                    .inc();
                            }
                            return Err(ClientError::PoolTimeout);
                        }
                    }
                }
            }
        }
    }

    async fn try_acquire(&self, start: Instant) -> Result<AcquireResult, ClientError> {
        let extra = self.extra_capacity.load(Ordering::Acquire);
        let mut state = self.state.lock().await;
        debug_assert!(state.invariant(extra));

        // Discard idle connections that aged out or were poisoned.
        let max_age = self.config.max_connection_age;
        let before = state.idle.len();
        state
            .idle
            .retain(|conn| !conn.is_bad() && conn.start_time.elapsed() < max_age);
        if state.idle.len() < before {
            trace!("discarded {} stale connections", before - state.idle.len());
        }

        if let Some(conn) = state.idle.pop_front() {
            state.in_flight += 1;
            debug_assert!(state.invariant(extra));

            if let Some(ref metrics) = self.config.metrics {
                state.update_metrics(metrics);
                metrics
                    .connection_acquire_duration
                    .with_label_values(&["reused"])
                    .observe(start.elapsed().as_secs_f64());
            }
            trace!("reusing idle connection");
            return Ok(AcquireResult::Success(conn));
        }

        if state.in_flight < state.capacity + extra {
            state.in_flight += 1;
            debug_assert!(state.invariant(extra));
            drop(state);

            match self.create_connection().await {
                Ok(conn) => {
                    if let Some(ref metrics) = self.config.metrics {
                        metrics
                            .total_connections_created
                            .with_label_values(&["success"])
                            .inc();
                        metrics
                            .connection_acquire_duration
                            .with_label_values(&["created"])
                            .observe(start.elapsed().as_secs_f64());
                    }
                    debug!("created new connection to {}", self.uri);
                    Ok(AcquireResult::Success(conn))
                }
                Err(e) => {
                    // The factory failed: poison the facade for good.
                    self.failed.store(true, Ordering::Release);

                    let mut state = self.state.lock().await;
                    state.in_flight = state.in_flight.saturating_sub(1);
                    debug_assert!(state.invariant(extra));

                    if let Some(ref metrics) = self.config.metrics {
                        state.update_metrics(metrics);
                        metrics
                            .total_connections_created
                            .with_label_values(&["error"])
                            .inc();
                        metrics
                            .connection_errors
                            .with_label_values(&["creation_failed"])
                            .inc();
                    }
                    drop(state);
                    self.available_notify.notify_one();

                    warn!("failed to open connection to {}: {e}", self.uri);
                    Err(e)
                }
            }
        } else {
            state.waiting += 1;
            trace!(
                "pool at capacity ({}/{}), waiting",
                state.in_flight,
                state.capacity + extra
            );
            Ok(AcquireResult::WaitRequired)
        }
    }

    async fn create_connection(&self) -> Result<UnixConnection, ClientError> {
        let connect = async {
            let stream = UnixStream::connect(&self.socket_path).await.map_err(|e| {
                ClientError::OpenConnection {
                    uri: self.uri.clone(),
                    source: Box::new(ClientError::io("Failed to connect to daemon socket", e)),
                }
            })?;
            let (read, write) = stream.into_split();
            Connection::open(
                read,
                write,
                &self.uri,
                &self.settings,
                Arc::clone(&self.logger),
            )
            .await
        };

        tokio::time::timeout(self.config.connection_timeout, connect)
            .await
            .map_err(|_| ClientError::ConnectionTimeout)?
    }

    /// Allow one nested acquisition while the caller streams data that
    /// may reentrantly use the store.  The headroom lasts until the
    /// returned reservation is dropped.
    pub fn reserve_capacity(&self) -> CapacityReservation<'_> {
        self.extra_capacity.fetch_add(1, Ordering::Release);
        self.available_notify.notify_one();
        CapacityReservation { pool: self }
    }

    /// Current (idle, in_flight, capacity) counts.
    pub async fn stats(&self) -> (usize, usize, usize) {
        let state = self.state.lock().await;
        (state.idle.len(), state.in_flight, state.capacity)
    }
}

/// Transiently raised pool capacity; dropped when the streaming window
/// that needed it closes.
pub struct CapacityReservation<'a> {
    pool: &'a ConnectionPool,
}

impl Drop for CapacityReservation<'_> {
    fn drop(&mut self) {
        self.pool
            .extra_capacity
            .fetch_sub(1, Ordering::Release);
    }
}

/// Guard holding one pooled connection.
///
/// Dropping the guard returns the connection to the pool unless it was
/// marked bad, in which case it is closed instead.
pub struct PooledConnectionGuard {
    conn: Option<UnixConnection>,
    state: Arc<Mutex<PoolState>>,
    notify: Arc<Notify>,
    max_age: Duration,
    extra_capacity: Arc<AtomicUsize>,
    metrics: Option<Arc<ClientMetrics>>,
}

impl std::fmt::Debug for PooledConnectionGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PooledConnectionGuard")
            .field("has_connection", &self.conn.is_some())
            .field("max_age", &self.max_age)
            .finish()
    }
}

impl PooledConnectionGuard {
    pub fn connection(&mut self) -> &mut UnixConnection {
        self.conn.as_mut().expect("connection already released")
    }

    pub fn version(&self) -> crate::protocol::ProtocolVersion {
        self.conn
            .as_ref()
            .expect("connection already released")
            .version
    }
}

impl Drop for PooledConnectionGuard {
    fn drop(&mut self) {
        let conn = self.conn.take();
        let state = Arc::clone(&self.state);
        let notify = Arc::clone(&self.notify);
        let max_age = self.max_age;
        let extra_capacity = Arc::clone(&self.extra_capacity);
        let metrics = self.metrics.clone();

        // The pool mutex is async; finish the bookkeeping on the
        // runtime instead of blocking in drop.
        tokio::spawn(async move {
            let extra = extra_capacity.load(Ordering::Acquire);
            let mut state = state.lock().await;
            state.in_flight = state.in_flight.saturating_sub(1);

            if let Some(conn) = conn {
                if conn.is_bad() {
                    debug!("closing daemon connection because of an error");
                    if let Some(ref metrics) = metrics {
                        metrics
                            .connection_errors
                            .with_label_values(&["broken"])
                            .inc();
                    }
                } else if conn.busy {
                    // The holder was dropped mid-exchange; the stream
                    // position is unknown.
                    debug!("closing daemon connection because of an exception");
                    if let Some(ref metrics) = metrics {
                        metrics
                            .connection_errors
                            .with_label_values(&["broken"])
                            .inc();
                    }
                } else if conn.start_time.elapsed() >= max_age {
                    trace!("closing daemon connection past its maximum age");
                } else if state.in_flight + state.idle.len() >= state.capacity + extra {
                    // A connection acquired under transiently raised
                    // capacity outlived its reservation.
                    trace!("closing daemon connection beyond pool capacity");
                } else {
                    state.idle.push_back(conn);
                }
            }

            debug_assert!(state.invariant(extra));
            if let Some(ref metrics) = metrics {
                state.update_metrics(metrics);
            }
            drop(state);

            notify.notify_one();
        });
    }
}
