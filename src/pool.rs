//! Per-engine connection pool and request-dispatch loop.
//!
//! Each pool owns a bounded FIFO request queue and one background dispatch
//! task. The loop takes the next request, obtains a connection (starting a
//! new one when the available set is empty and capacity remains) and hands
//! the request its connection. Requests that find no connection are
//! re-enqueued after a delay, up to a fixed bound.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::sync::Notify;
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, warn};

use crate::config::EngineConfig;
use crate::connection::EngineConnection;
use crate::error::{EngineError, EngineResult};
use crate::request::EngineRequest;
use crate::starter::ConnectionStarter;

/// Pool tuning knobs.
#[derive(Debug, Clone)]
pub struct PoolSettings {
    /// Maximum queued requests before `enqueue` reports queue-full.
    pub queue_capacity: usize,
    /// Attempts per request before a no-connection failure is surfaced.
    pub retries_per_request: u32,
    /// Delay before a request that found no connection is re-enqueued.
    pub retry_delay: Duration,
    /// Upper bound on open connections, on top of the port-range width.
    pub max_connections: usize,
    /// Per-call response deadline.
    pub response_deadline: Duration,
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self {
            queue_capacity: 200,
            retries_per_request: 5,
            retry_delay: Duration::from_millis(200),
            max_connections: 8,
            response_deadline: Duration::from_secs(20),
        }
    }
}

/// The per-engine set of started/available connections plus its request
/// queue and dispatch loop.
pub struct EnginePool {
    inner: Arc<PoolInner>,
    dispatch: JoinHandle<()>,
}

struct PoolInner {
    config: Arc<EngineConfig>,
    settings: PoolSettings,
    starter: Arc<dyn ConnectionStarter>,
    queue_tx: mpsc::Sender<EngineRequest>,
    available: Mutex<VecDeque<Arc<EngineConnection>>>,
    started: Mutex<Vec<Arc<EngineConnection>>>,
    returned: Notify,
}

impl std::fmt::Debug for EnginePool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EnginePool")
            .field("engine", &self.inner.config.name)
            .finish_non_exhaustive()
    }
}

impl EnginePool {
    /// Validates and locks the config, then starts the dispatch loop.
    ///
    /// Must be called within an async runtime.
    pub fn start(
        config: Arc<EngineConfig>,
        starter: Arc<dyn ConnectionStarter>,
        settings: PoolSettings,
    ) -> EngineResult<Arc<Self>> {
        config.validate()?;
        config.lock();

        let (queue_tx, queue_rx) = mpsc::channel(settings.queue_capacity.max(1));
        let inner = Arc::new(PoolInner {
            config,
            settings,
            starter,
            queue_tx,
            available: Mutex::new(VecDeque::new()),
            started: Mutex::new(Vec::new()),
            returned: Notify::new(),
        });

        let dispatch = tokio::spawn(dispatch_loop(Arc::clone(&inner), queue_rx));
        Ok(Arc::new(Self { inner, dispatch }))
    }

    /// Config of the engine this pool serves.
    #[must_use]
    pub fn config(&self) -> &Arc<EngineConfig> {
        &self.inner.config
    }

    /// The pool's tuning knobs.
    #[must_use]
    pub fn settings(&self) -> &PoolSettings {
        &self.inner.settings
    }

    /// Appends a request to the bounded FIFO queue.
    pub fn enqueue(&self, request: EngineRequest) -> EngineResult<()> {
        self.inner.queue_tx.try_send(request).map_err(|err| match err {
            TrySendError::Full(_) => EngineError::QueueFull {
                engine: self.inner.config.name.clone(),
                capacity: self.inner.settings.queue_capacity,
            },
            TrySendError::Closed(_) => EngineError::ConnectionClosed,
        })
    }

    /// Returns a connection to the available set so it can serve the next
    /// request. Idempotent; closed or foreign connections are ignored.
    pub fn set_connection_available(&self, connection: &Arc<EngineConnection>) {
        self.inner.set_connection_available(connection);
    }

    /// Number of connections this pool has started and not yet removed.
    #[must_use]
    pub fn open_connections(&self) -> usize {
        self.inner.started.lock().expect("started lock poisoned").len()
    }

    /// Closes every started connection concurrently.
    ///
    /// Successfully closed connections leave both sets; failures are
    /// aggregated into one shutdown error so no single connection can
    /// prevent closing the others.
    pub async fn close_connections(&self) -> EngineResult<()> {
        self.inner.close_connections().await
    }
}

impl Drop for EnginePool {
    fn drop(&mut self) {
        self.dispatch.abort();
    }
}

async fn dispatch_loop(inner: Arc<PoolInner>, mut queue_rx: mpsc::Receiver<EngineRequest>) {
    while let Some(mut request) = queue_rx.recv().await {
        request.begin_attempt();
        match inner.acquire_connection().await {
            Ok(connection) => request.execute(connection),
            Err(error) if error.is_retryable() => inner.retry_or_reject(request, error),
            Err(error) => {
                warn!(engine = %inner.config.name, %error, "request failed before dispatch");
                request.reject(error);
            }
        }
    }
}

impl PoolInner {
    /// Connections this engine may have open at once.
    fn connection_cap(&self) -> usize {
        self.settings.max_connections.min(self.config.port_range_width())
    }

    /// Starts and registers a new connection when the available set is
    /// empty and the cap leaves room.
    async fn replenish(&self) -> EngineResult<()> {
        let used_ports: Vec<u16> = {
            let started = self.started.lock().expect("started lock poisoned");
            if started.len() >= self.connection_cap() {
                return Ok(());
            }
            started.iter().map(|connection| connection.port()).collect()
        };
        if !self.available.lock().expect("available lock poisoned").is_empty() {
            return Ok(());
        }

        if let Some(connection) = self
            .starter
            .try_start_new_connection(&self.config, &used_ports)
            .await?
        {
            let connection = Arc::new(connection);
            debug!(engine = %self.config.name, port = connection.port(), "registered engine connection");
            self.started
                .lock()
                .expect("started lock poisoned")
                .push(Arc::clone(&connection));
            self.available
                .lock()
                .expect("available lock poisoned")
                .push_back(connection);
        }
        Ok(())
    }

    /// Obtains a connection for the next request.
    ///
    /// Thread-safe engines share one connection via a non-removing peek;
    /// other engines hand out exclusive connections, waiting until one is
    /// returned when every started connection is in flight.
    async fn acquire_connection(&self) -> EngineResult<Arc<EngineConnection>> {
        self.replenish().await?;

        if self.config.thread_safe {
            return self
                .available
                .lock()
                .expect("available lock poisoned")
                .front()
                .cloned()
                .ok_or_else(|| self.no_connection());
        }

        loop {
            loop {
                let popped = self
                    .available
                    .lock()
                    .expect("available lock poisoned")
                    .pop_front();
                match popped {
                    Some(connection) if connection.is_closed() => continue,
                    Some(connection) => return Ok(connection),
                    None => break,
                }
            }
            if self.started.lock().expect("started lock poisoned").is_empty() {
                return Err(self.no_connection());
            }
            // Every started connection is in flight: wait for a release.
            self.returned.notified().await;
        }
    }

    fn no_connection(&self) -> EngineError {
        EngineError::NoConnection {
            engine: self.config.name.clone(),
        }
    }

    fn retry_or_reject(&self, request: EngineRequest, error: EngineError) {
        if request.tries() < self.settings.retries_per_request {
            debug!(
                engine = %self.config.name,
                tries = request.tries(),
                "no connection available, re-enqueueing request"
            );
            let queue_tx = self.queue_tx.clone();
            let delay = self.settings.retry_delay;
            tokio::spawn(async move {
                tokio::time::sleep(delay).await;
                // Pool already gone: the request is dropped with it.
                let _ = queue_tx.send(request).await;
            });
        } else {
            warn!(engine = %self.config.name, "no available engine connection, dropping request");
            request.reject(error);
        }
    }

    fn set_connection_available(&self, connection: &Arc<EngineConnection>) {
        if connection.is_closed() {
            return;
        }
        {
            let started = self.started.lock().expect("started lock poisoned");
            if !started.iter().any(|open| Arc::ptr_eq(open, connection)) {
                return;
            }
        }
        {
            let mut available = self.available.lock().expect("available lock poisoned");
            if !available.iter().any(|open| Arc::ptr_eq(open, connection)) {
                available.push_back(Arc::clone(connection));
            }
        }
        self.returned.notify_one();
    }

    async fn close_connections(&self) -> EngineResult<()> {
        let targets: Vec<Arc<EngineConnection>> = self
            .started
            .lock()
            .expect("started lock poisoned")
            .clone();

        let mut closers = JoinSet::new();
        for connection in targets {
            closers.spawn(async move {
                let result = connection.close().await;
                (connection, result)
            });
        }

        let mut causes = Vec::new();
        while let Some(joined) = closers.join_next().await {
            match joined {
                Ok((connection, Ok(()))) => self.remove_connection(&connection),
                Ok((_, Err(cause))) => causes.push(cause),
                Err(panic) => causes.push(EngineError::Protocol {
                    message: format!("connection close task failed: {panic}"),
                }),
            }
        }

        if causes.is_empty() {
            Ok(())
        } else {
            Err(EngineError::Shutdown {
                engine: self.config.name.clone(),
                causes,
            })
        }
    }

    fn remove_connection(&self, connection: &Arc<EngineConnection>) {
        self.started
            .lock()
            .expect("started lock poisoned")
            .retain(|open| !Arc::ptr_eq(open, connection));
        self.available
            .lock()
            .expect("available lock poisoned")
            .retain(|open| !Arc::ptr_eq(open, connection));
    }
}
