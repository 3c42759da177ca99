//! Session pool: admission control and coordinated shutdown.
//!
//! # Responsibilities
//! - Bound the number of concurrent sessions with a semaphore
//! - Register each admitted session's deadline handle by session ID
//! - Release slots exactly once, on every exit path, via a drop guard
//! - On shutdown, tighten every deadline and wait for the pool to drain
//!
//! # Design Decisions
//! - Tickets are acquired before `accept`, so a full pool stops accepting
//! - Shutdown never aborts a worker; it only shortens deadlines
//! - Sessions registered after shutdown began are tightened on arrival

use std::net::SocketAddr;
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use dashmap::DashMap;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{watch, OwnedSemaphorePermit, Semaphore};
use uuid::Uuid;

use crate::net::connection::{Connection, DeadlineHandle};
use crate::observability::metrics;
use crate::smtp::session::{Session, SessionContext};

/// Extra time granted past the grace period before giving up on a drain.
const DRAIN_SLACK: Duration = Duration::from_secs(1);

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PoolError {
    #[error("session pool is shut down")]
    Closed,
}

/// How a drain ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DrainOutcome {
    Drained,
    /// `remaining` sessions (and, from the server, detached deliveries)
    /// were still running when the grace period ran out.
    TimedOut { remaining: usize },
}

/// One unit of pool capacity, not yet bound to a session.
///
/// Dropping an unregistered ticket returns the slot.
#[derive(Debug)]
pub struct AdmissionTicket {
    permit: OwnedSemaphorePermit,
}

/// Binds a ticket to a registered session.
///
/// Dropping it deregisters the session and returns the slot.
#[derive(Debug)]
pub struct SessionGuard {
    pool: Arc<SessionPool>,
    id: Uuid,
    _permit: OwnedSemaphorePermit,
}

impl SessionGuard {
    pub fn id(&self) -> Uuid {
        self.id
    }
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        self.pool.registry.remove(&self.id);
        let mut active = 0;
        self.pool.active.send_modify(|count| {
            *count = count.saturating_sub(1);
            active = *count;
        });
        metrics::record_session_closed(active);
        tracing::trace!(session_id = %self.id, active, "Session deregistered");
    }
}

/// Bounded registry of live sessions.
#[derive(Debug)]
pub struct SessionPool {
    permits: Arc<Semaphore>,
    capacity: usize,
    registry: DashMap<Uuid, DeadlineHandle>,
    active: watch::Sender<usize>,
    drain_grace: OnceLock<Duration>,
}

impl SessionPool {
    pub fn new(capacity: usize) -> Arc<Self> {
        let (active, _) = watch::channel(0);
        Arc::new(Self {
            permits: Arc::new(Semaphore::new(capacity)),
            capacity,
            registry: DashMap::new(),
            active,
            drain_grace: OnceLock::new(),
        })
    }

    /// Wait for a free slot.
    ///
    /// Blocks while the pool is full; fails once shutdown has begun.
    pub async fn acquire(&self) -> Result<AdmissionTicket, PoolError> {
        let permit = Arc::clone(&self.permits)
            .acquire_owned()
            .await
            .map_err(|_| PoolError::Closed)?;
        Ok(AdmissionTicket { permit })
    }

    /// Register a connection under a fresh session ID.
    pub fn register<S>(self: &Arc<Self>, ticket: AdmissionTicket, conn: &Connection<S>) -> SessionGuard
    where
        S: AsyncRead + AsyncWrite + Unpin + Send,
    {
        let id = Uuid::new_v4();
        let handle = conn.deadline_handle();
        self.registry.insert(id, handle.clone());
        if let Some(grace) = self.drain_grace.get() {
            handle.tighten(*grace);
        }

        let mut active = 0;
        self.active.send_modify(|count| {
            *count += 1;
            active = *count;
        });
        metrics::record_session_opened(active);

        SessionGuard {
            pool: Arc::clone(self),
            id,
            _permit: ticket.permit,
        }
    }

    /// Register a connection and build its session.
    pub fn admit<S>(
        self: &Arc<Self>,
        ticket: AdmissionTicket,
        conn: Connection<S>,
        peer: SocketAddr,
        ctx: Arc<SessionContext>,
    ) -> Session<S>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let guard = self.register(ticket, &conn);
        Session::new(guard, conn, peer, ctx)
    }

    /// Sessions currently registered.
    pub fn active(&self) -> usize {
        *self.active.borrow()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Slots not held by a ticket or a session.
    pub fn available(&self) -> usize {
        self.permits.available_permits()
    }

    /// Stop admitting, tighten every deadline to `grace`, and wait for the
    /// registered sessions to finish.
    pub async fn shutdown(&self, grace: Duration) -> DrainOutcome {
        let _ = self.drain_grace.set(grace);
        self.permits.close();

        for entry in self.registry.iter() {
            entry.value().tighten(grace);
        }
        tracing::info!(active = self.active(), grace = ?grace, "Draining sessions");

        let mut rx = self.active.subscribe();
        let drained = matches!(
            tokio::time::timeout(grace + DRAIN_SLACK, rx.wait_for(|count| *count == 0)).await,
            Ok(Ok(_))
        );
        if drained {
            tracing::info!("All sessions drained");
            DrainOutcome::Drained
        } else {
            let remaining = self.active();
            tracing::warn!(remaining, "Drain timed out");
            DrainOutcome::TimedOut { remaining }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::net::connection::{ConnectionError, ConnectionSettings};
    use tokio::io::{duplex, DuplexStream};

    fn connection() -> (Connection<DuplexStream>, DuplexStream) {
        let (server, client) = duplex(1024);
        let settings = ConnectionSettings {
            max_line_length: 512,
            idle_timeout: Duration::from_secs(60),
        };
        (Connection::new(server, settings), client)
    }

    #[tokio::test]
    async fn admission_blocks_at_capacity_then_admits_one() {
        let pool = SessionPool::new(1);
        let first = pool.acquire().await.unwrap();
        assert_eq!(pool.available(), 0);

        let waiter = {
            let pool = Arc::clone(&pool);
            tokio::spawn(async move { pool.acquire().await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!waiter.is_finished());

        drop(first);
        let second = waiter.await.unwrap().unwrap();
        assert_eq!(pool.available(), 0);
        drop(second);
        assert_eq!(pool.available(), 1);
    }

    #[tokio::test]
    async fn guard_releases_exactly_once() {
        let pool = SessionPool::new(2);
        let (conn, _client) = connection();

        let guard = pool.register(pool.acquire().await.unwrap(), &conn);
        assert_eq!(pool.active(), 1);
        assert_eq!(pool.available(), 1);

        drop(guard);
        assert_eq!(pool.active(), 0);
        assert_eq!(pool.available(), 2);
    }

    #[tokio::test]
    async fn slot_returns_when_worker_panics() {
        let pool = SessionPool::new(1);
        let (conn, _client) = connection();
        let guard = pool.register(pool.acquire().await.unwrap(), &conn);

        let worker = tokio::spawn(async move {
            let _guard = guard;
            panic!("worker failure");
        });
        assert!(worker.await.is_err());
        assert_eq!(pool.active(), 0);
        assert_eq!(pool.available(), 1);
    }

    #[tokio::test]
    async fn empty_pool_drains_immediately() {
        let pool = SessionPool::new(4);
        assert_eq!(pool.shutdown(Duration::from_secs(5)).await, DrainOutcome::Drained);
        assert_eq!(pool.acquire().await.unwrap_err(), PoolError::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_tightens_deadlines_and_waits() {
        let pool = SessionPool::new(4);
        let (mut conn, _client) = connection();
        let guard = pool.register(pool.acquire().await.unwrap(), &conn);

        let worker = tokio::spawn(async move {
            let _guard = guard;
            conn.read_line().await
        });

        let outcome = pool.shutdown(Duration::from_millis(500)).await;
        assert_eq!(outcome, DrainOutcome::Drained);
        assert!(matches!(worker.await.unwrap(), Err(ConnectionError::Timeout)));
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_reports_stragglers() {
        let pool = SessionPool::new(4);
        let (conn, _client) = connection();
        let _held = pool.register(pool.acquire().await.unwrap(), &conn);

        let outcome = pool.shutdown(Duration::from_millis(100)).await;
        assert_eq!(outcome, DrainOutcome::TimedOut { remaining: 1 });
    }

    #[tokio::test]
    async fn late_registration_is_tightened() {
        let pool = SessionPool::new(2);
        let ticket = pool.acquire().await.unwrap();
        let (conn, _client) = connection();

        let _ = pool.shutdown(Duration::from_millis(10)).await;
        let _guard = pool.register(ticket, &conn);
        assert!(conn.deadline_handle().is_draining());
    }
}
