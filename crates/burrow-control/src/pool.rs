//! Per-tunnel pool of single-use backend connections
//!
//! The pool holds idle connections (popped LIFO so the most recently opened,
//! warmest socket is used first), a FIFO queue of callers waiting for a
//! connection, and the count of connections currently claimed by requests.
//!
//! A claimed connection is handed out as a [`PooledConnection`]. It is never
//! returned to the pool: dropping it closes the socket and releases its slot.
//! All queue manipulation happens under one mutex scoped to this pool and never
//! held across an await point.

use crate::connection::BackendConnection;
use futures::FutureExt;
use serde::Serialize;
use std::collections::VecDeque;
use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::task::{Context, Poll};
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, ReadBuf};
use tokio::sync::oneshot;
use tokio::time::Instant;
use tracing::{debug, trace};

/// Connection pool errors
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PoolError {
    #[error("Connection pool is full ({max_sockets} sockets)")]
    PoolFull { max_sockets: usize },

    #[error("Relay connection capacity reached ({max_total} sockets)")]
    CapacityExceeded { max_total: usize },

    #[error("No backend connection available within {0:?}")]
    NoAvailableConnection(Duration),

    #[error("Connection pool is closed")]
    Closed,
}

/// Point-in-time pool counters
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct PoolStats {
    pub idle: usize,
    pub in_use: usize,
    pub waiting: usize,
    pub max_sockets: usize,
}

impl PoolStats {
    /// Connections currently held by the tunnel (idle + in use)
    pub fn connected(&self) -> usize {
        self.idle + self.in_use
    }
}

struct Waiter {
    id: u64,
    tx: oneshot::Sender<PooledConnection>,
}

struct PoolState {
    idle: VecDeque<BackendConnection>,
    waiters: VecDeque<Waiter>,
    in_use: usize,
    next_waiter_id: u64,
    last_activity: Instant,
    closed: bool,
}

struct PoolInner {
    client_id: String,
    max_sockets: usize,
    /// Connections held across every pool sharing this counter
    total_sockets: Arc<AtomicUsize>,
    max_total: Option<usize>,
    state: Mutex<PoolState>,
}

impl PoolInner {
    fn lock(&self) -> MutexGuard<'_, PoolState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn reserve_global(&self) -> Result<(), PoolError> {
        match self.max_total {
            None => {
                self.total_sockets.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
            Some(max_total) => self
                .total_sockets
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| {
                    (n < max_total).then_some(n + 1)
                })
                .map(|_| ())
                .map_err(|_| PoolError::CapacityExceeded { max_total }),
        }
    }

    fn release_global(&self, count: usize) {
        if count > 0 {
            self.total_sockets.fetch_sub(count, Ordering::SeqCst);
        }
    }

    /// Hand a connection to the oldest live waiter, or park it as idle
    ///
    /// Waiters whose caller has gone away are skipped; the connection is never
    /// lost to a dead receiver.
    fn offer_locked(self: &Arc<Self>, state: &mut PoolState, mut conn: BackendConnection) {
        while let Some(waiter) = state.waiters.pop_front() {
            state.in_use += 1;
            let conn_id = conn.id();
            match waiter.tx.send(PooledConnection::new(conn, self.clone())) {
                Ok(()) => {
                    debug!(
                        client_id = %self.client_id,
                        conn_id,
                        waiter = waiter.id,
                        "Handed backend connection to waiting request"
                    );
                    return;
                }
                Err(returned) => {
                    state.in_use -= 1;
                    trace!(
                        client_id = %self.client_id,
                        waiter = waiter.id,
                        "Skipping waiter that went away"
                    );
                    match returned.detach() {
                        Some(c) => conn = c,
                        None => return,
                    }
                }
            }
        }

        state.idle.push_back(conn);
    }

    /// Remove a waiter from the queue
    ///
    /// Returns the connection if the waiter had already been served.
    fn withdraw(
        &self,
        waiter_id: u64,
        rx: &mut oneshot::Receiver<PooledConnection>,
    ) -> Option<PooledConnection> {
        let mut state = self.lock();
        if let Some(pos) = state.waiters.iter().position(|w| w.id == waiter_id) {
            state.waiters.remove(pos);
            return None;
        }
        rx.try_recv().ok()
    }

    /// Put back a connection that was handed to a caller who is gone
    fn reoffer(self: &Arc<Self>, conn: PooledConnection) {
        let mut state = self.lock();
        state.in_use = state.in_use.saturating_sub(1);
        let Some(conn) = conn.detach() else {
            return;
        };

        if state.closed {
            self.release_global(1);
            return;
        }

        debug!(
            client_id = %self.client_id,
            conn_id = conn.id(),
            "Returning unclaimed backend connection to pool"
        );
        self.offer_locked(&mut state, conn);
    }

    fn release_claimed(&self) {
        let mut state = self.lock();
        state.in_use = state.in_use.saturating_sub(1);
        state.last_activity = Instant::now();
        drop(state);
        self.release_global(1);
    }
}

/// Pool of single-use backend connections for one tunnel
#[derive(Clone)]
pub struct ConnectionPool {
    inner: Arc<PoolInner>,
}

impl ConnectionPool {
    /// Create a standalone pool with its own connection counter
    pub fn new(client_id: impl Into<String>, max_sockets: usize) -> Self {
        Self::with_shared_counter(client_id, max_sockets, Arc::new(AtomicUsize::new(0)), None)
    }

    /// Create a pool that also counts its connections in `total_sockets`
    ///
    /// When `max_total` is set, registrations fail once the shared counter
    /// reaches it.
    pub fn with_shared_counter(
        client_id: impl Into<String>,
        max_sockets: usize,
        total_sockets: Arc<AtomicUsize>,
        max_total: Option<usize>,
    ) -> Self {
        Self {
            inner: Arc::new(PoolInner {
                client_id: client_id.into(),
                max_sockets,
                total_sockets,
                max_total,
                state: Mutex::new(PoolState {
                    idle: VecDeque::new(),
                    waiters: VecDeque::new(),
                    in_use: 0,
                    next_waiter_id: 0,
                    last_activity: Instant::now(),
                    closed: false,
                }),
            }),
        }
    }

    pub fn max_sockets(&self) -> usize {
        self.inner.max_sockets
    }

    /// Add a connection supplied by the private side
    ///
    /// The oldest waiting request receives it directly; otherwise it becomes
    /// idle. On error the connection is dropped (closed).
    pub fn register(&self, conn: BackendConnection) -> Result<(), PoolError> {
        let mut state = self.inner.lock();

        if state.closed {
            return Err(PoolError::Closed);
        }

        if state.idle.len() + state.in_use >= self.inner.max_sockets {
            return Err(PoolError::PoolFull {
                max_sockets: self.inner.max_sockets,
            });
        }

        self.inner.reserve_global()?;
        state.last_activity = Instant::now();

        trace!(
            client_id = %self.inner.client_id,
            conn_id = conn.id(),
            idle = state.idle.len(),
            in_use = state.in_use,
            "Registering backend connection"
        );
        self.inner.offer_locked(&mut state, conn);
        Ok(())
    }

    /// Claim a connection, waiting up to `timeout` for one to be registered
    ///
    /// Dropping the returned future before it completes withdraws the caller
    /// from the wait queue.
    pub async fn acquire(&self, timeout: Duration) -> Result<PooledConnection, PoolError> {
        let pending = {
            let mut state = self.inner.lock();

            if state.closed {
                return Err(PoolError::Closed);
            }

            if let Some(conn) = state.idle.pop_back() {
                state.in_use += 1;
                state.last_activity = Instant::now();
                trace!(
                    client_id = %self.inner.client_id,
                    conn_id = conn.id(),
                    "Claimed idle backend connection"
                );
                return Ok(PooledConnection::new(conn, self.inner.clone()));
            }

            let waiter_id = state.next_waiter_id;
            state.next_waiter_id += 1;
            let (tx, rx) = oneshot::channel();
            state.waiters.push_back(Waiter { id: waiter_id, tx });

            trace!(
                client_id = %self.inner.client_id,
                waiter = waiter_id,
                waiting = state.waiters.len(),
                "No idle backend connection, queueing request"
            );

            PendingAcquire {
                waiter_id,
                rx,
                pool: self.inner.clone(),
                finished: false,
            }
        };

        pending.wait(timeout).await
    }

    /// Drop idle connections the private side has closed
    ///
    /// An idle connection that reports EOF, an error, or unsolicited bytes is
    /// unusable and is removed. Returns the number of connections pruned.
    pub fn prune_closed(&self) -> usize {
        let mut state = self.inner.lock();
        let before = state.idle.len();
        state.idle.retain_mut(|conn| !probe_closed(conn));
        let pruned = before - state.idle.len();
        drop(state);

        if pruned > 0 {
            self.inner.release_global(pruned);
            debug!(
                client_id = %self.inner.client_id,
                pruned,
                "Pruned closed idle backend connections"
            );
        }
        pruned
    }

    /// Close the pool: idle connections are closed and waiters fail with
    /// [`PoolError::Closed`]. Claimed connections finish normally.
    pub fn close(&self) {
        let (idle, waiters) = {
            let mut state = self.inner.lock();
            state.closed = true;
            (
                std::mem::take(&mut state.idle),
                std::mem::take(&mut state.waiters),
            )
        };

        self.inner.release_global(idle.len());
        debug!(
            client_id = %self.inner.client_id,
            idle = idle.len(),
            waiters = waiters.len(),
            "Closed connection pool"
        );
    }

    pub fn is_closed(&self) -> bool {
        self.inner.lock().closed
    }

    pub fn stats(&self) -> PoolStats {
        let state = self.inner.lock();
        PoolStats {
            idle: state.idle.len(),
            in_use: state.in_use,
            waiting: state.waiters.len(),
            max_sockets: self.inner.max_sockets,
        }
    }

    /// Last registration, claim or release
    pub fn last_activity(&self) -> Instant {
        self.inner.lock().last_activity
    }
}

fn probe_closed(conn: &mut BackendConnection) -> bool {
    let mut probe = [0u8; 1];
    conn.stream.read(&mut probe).now_or_never().is_some()
}

/// A queued acquire; withdraws itself from the queue when dropped early
struct PendingAcquire {
    waiter_id: u64,
    rx: oneshot::Receiver<PooledConnection>,
    pool: Arc<PoolInner>,
    finished: bool,
}

impl PendingAcquire {
    async fn wait(mut self, timeout: Duration) -> Result<PooledConnection, PoolError> {
        let outcome = tokio::time::timeout(timeout, &mut self.rx).await;
        self.finished = true;

        match outcome {
            Ok(Ok(conn)) => Ok(conn),
            Ok(Err(_)) => Err(PoolError::Closed),
            Err(_) => match self.pool.withdraw(self.waiter_id, &mut self.rx) {
                // Served right at the deadline
                Some(conn) => Ok(conn),
                None => {
                    debug!(
                        client_id = %self.pool.client_id,
                        waiter = self.waiter_id,
                        "Timed out waiting for backend connection"
                    );
                    Err(PoolError::NoAvailableConnection(timeout))
                }
            },
        }
    }
}

impl Drop for PendingAcquire {
    fn drop(&mut self) {
        if self.finished {
            return;
        }

        trace!(
            client_id = %self.pool.client_id,
            waiter = self.waiter_id,
            "Acquire cancelled"
        );
        if let Some(conn) = self.pool.withdraw(self.waiter_id, &mut self.rx) {
            self.pool.reoffer(conn);
        }
    }
}

/// A backend connection claimed by exactly one request
///
/// Reads and writes go straight to the underlying stream. Dropping it closes
/// the stream and releases the pool slot; it is never re-enqueued.
pub struct PooledConnection {
    conn: Option<BackendConnection>,
    pool: Arc<PoolInner>,
}

impl PooledConnection {
    fn new(conn: BackendConnection, pool: Arc<PoolInner>) -> Self {
        Self {
            conn: Some(conn),
            pool,
        }
    }

    /// Take the connection back out without releasing the slot
    fn detach(mut self) -> Option<BackendConnection> {
        self.conn.take()
    }

    pub fn id(&self) -> u64 {
        self.conn.as_ref().map(|c| c.id()).unwrap_or_default()
    }

    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.conn.as_ref().and_then(|c| c.peer_addr())
    }

    /// Identity of the tunnel this connection belongs to
    pub fn client_id(&self) -> &str {
        &self.pool.client_id
    }

    fn stream_mut(&mut self) -> io::Result<Pin<&mut dyn crate::BackendStream>> {
        match self.conn.as_mut() {
            Some(conn) => Ok(Pin::new(conn.stream.as_mut())),
            None => Err(io::ErrorKind::NotConnected.into()),
        }
    }
}

impl Drop for PooledConnection {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.take() {
            self.pool.release_claimed();
            debug!(
                client_id = %self.pool.client_id,
                conn_id = conn.id(),
                "Discarded backend connection"
            );
        }
    }
}

impl std::fmt::Debug for PooledConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PooledConnection")
            .field("client_id", &self.pool.client_id)
            .field("conn", &self.conn)
            .finish()
    }
}

impl AsyncRead for PooledConnection {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.get_mut().stream_mut() {
            Ok(stream) => stream.poll_read(cx, buf),
            Err(e) => Poll::Ready(Err(e)),
        }
    }
}

impl AsyncWrite for PooledConnection {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self.get_mut().stream_mut() {
            Ok(stream) => stream.poll_write(cx, buf),
            Err(e) => Poll::Ready(Err(e)),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut().stream_mut() {
            Ok(stream) => stream.poll_flush(cx),
            Err(e) => Poll::Ready(Err(e)),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut().stream_mut() {
            Ok(stream) => stream.poll_shutdown(cx),
            Err(e) => Poll::Ready(Err(e)),
        }
    }

    fn poll_write_vectored(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        bufs: &[io::IoSlice<'_>],
    ) -> Poll<io::Result<usize>> {
        match self.get_mut().stream_mut() {
            Ok(stream) => stream.poll_write_vectored(cx, bufs),
            Err(e) => Poll::Ready(Err(e)),
        }
    }

    fn is_write_vectored(&self) -> bool {
        self.conn
            .as_ref()
            .map(|c| c.stream.is_write_vectored())
            .unwrap_or(false)
    }
}
