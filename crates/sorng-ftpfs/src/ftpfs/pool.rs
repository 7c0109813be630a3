//! Connection pool: a bounded set of authenticated sessions to one server.
//!
//! The idle set is a mutex-protected queue and the semaphore's permits
//! mirror its length, so `acquire` can wait (optionally with a timeout)
//! without holding the lock. Closing the semaphore wakes every waiter.
//! Every connection the pool opens is also recorded weakly so shutdown
//! can reach the ones still checked out.

use crate::ftpfs::connection::{disconnect_detached, Connection, Lease, PooledConnection};
use crate::ftpfs::error::{FtpError, FtpResult};
use crate::ftpfs::mapper::ErrorMapper;
use crate::ftpfs::types::{FtpFileSystemConfig, PoolStats};
use crate::ftpfs::wire::WireClientFactory;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use tokio::sync::{Semaphore, TryAcquireError};
use tokio::time::{self, Duration};

struct IdleSet {
    queue: VecDeque<Arc<Connection>>,
    closed: bool,
}

/// State shared by the pool handle, every lease and every stream.
pub(crate) struct PoolShared {
    pub(crate) config: FtpFileSystemConfig,
    pub(crate) factory: Arc<dyn WireClientFactory>,
    pub(crate) mapper: Arc<dyn ErrorMapper>,
    idle: Mutex<IdleSet>,
    available: Semaphore,
    overflow: AtomicUsize,
    members: Mutex<Vec<Weak<Connection>>>,
}

impl PoolShared {
    fn idle(&self) -> MutexGuard<'_, IdleSet> {
        self.idle.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn is_closed(&self) -> bool {
        self.idle().closed
    }

    fn pop_idle(&self) -> Option<Arc<Connection>> {
        self.idle().queue.pop_front()
    }

    /// The last reference on `conn` was released. Pooled connections go
    /// back to the idle set; anything returned must be disconnected.
    pub(crate) fn reclaim(&self, conn: Arc<Connection>) -> Option<Arc<Connection>> {
        if !conn.is_pooled() {
            self.overflow.fetch_sub(1, Ordering::SeqCst);
            return Some(conn);
        }
        {
            let mut idle = self.idle();
            if !idle.closed {
                log::trace!("FTP connection {} returned to pool", conn.id());
                idle.queue.push_back(conn);
                drop(idle);
                self.available.add_permits(1);
                return None;
            }
        }
        Some(conn)
    }

    pub(crate) fn register(&self, conn: &Arc<Connection>) {
        let mut members = self.members.lock().unwrap_or_else(|e| e.into_inner());
        members.retain(|m| m.strong_count() > 0);
        members.push(Arc::downgrade(conn));
    }

    /// Live connections outside the idle set that still need a QUIT.
    fn outstanding(&self, idle: &[Arc<Connection>]) -> Vec<Arc<Connection>> {
        let members = self.members.lock().unwrap_or_else(|e| e.into_inner());
        members
            .iter()
            .filter_map(Weak::upgrade)
            .filter(|c| !c.is_disconnected() && !idle.iter().any(|i| Arc::ptr_eq(i, c)))
            .collect()
    }
}

/// An idle connection taken out under a permit and not yet handed out.
/// Dropping it armed (the acquiring future was cancelled) returns it to
/// the idle set, marked broken since a probe may have been cut short.
struct Checkout<'a> {
    shared: &'a PoolShared,
    conn: Option<Arc<Connection>>,
}

impl<'a> Checkout<'a> {
    fn new(shared: &'a PoolShared, conn: Arc<Connection>) -> Self {
        Self {
            shared,
            conn: Some(conn),
        }
    }

    /// Liveness check before hand-out. A dead connection is replaced; if
    /// the replacement cannot be created the dead one stays in the guard
    /// and goes back to the idle set.
    async fn validate(&mut self) -> FtpResult<()> {
        let current = match &self.conn {
            Some(conn) => conn.clone(),
            None => return Err(FtpError::pool_closed()),
        };
        if !current.is_broken() && current.probe().await.is_ok() {
            return Ok(());
        }
        log::warn!("FTP connection {} failed its liveness check, replacing it", current.id());

        let replacement = Connection::open(self.shared, true).await?;
        self.conn = Some(replacement);
        if let Err(e) = current.disconnect().await {
            log::debug!("Ignoring disconnect failure of dead connection: {}", e);
        }
        Ok(())
    }

    fn connection(&self) -> Option<&Arc<Connection>> {
        self.conn.as_ref()
    }

    /// Disarm and claim the first reference.
    fn hand_out(mut self) -> Option<Arc<Connection>> {
        let conn = self.conn.take()?;
        conn.claim();
        Some(conn)
    }

    async fn put_back(mut self) {
        if let Some(conn) = self.conn.take() {
            if let Some(orphan) = self.shared.reclaim(conn) {
                if let Err(e) = orphan.disconnect().await {
                    log::debug!("Ignoring disconnect failure after pool close: {}", e);
                }
            }
        }
    }
}

impl Drop for Checkout<'_> {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.take() {
            log::debug!("FTP checkout of connection {} abandoned", conn.id());
            conn.mark_broken();
            if let Some(orphan) = self.shared.reclaim(conn) {
                disconnect_detached(orphan);
            }
        }
    }
}

/// Bounded pool of FTP sessions. Cheap to clone.
#[derive(Clone)]
pub struct ConnectionPool {
    shared: Arc<PoolShared>,
}

impl ConnectionPool {
    /// Create `client_connection_count` sessions up front. If any of them
    /// fails, the ones already created are disconnected before the error
    /// is returned.
    pub async fn new(
        config: FtpFileSystemConfig,
        factory: Arc<dyn WireClientFactory>,
        mapper: Arc<dyn ErrorMapper>,
    ) -> FtpResult<Self> {
        config.validate()?;
        let capacity = config.client_connection_count;
        let shared = Arc::new(PoolShared {
            config,
            factory,
            mapper,
            idle: Mutex::new(IdleSet {
                queue: VecDeque::with_capacity(capacity),
                closed: false,
            }),
            available: Semaphore::new(0),
            overflow: AtomicUsize::new(0),
            members: Mutex::new(Vec::with_capacity(capacity)),
        });

        let mut created = Vec::with_capacity(capacity);
        for _ in 0..capacity {
            match Connection::open(&shared, true).await {
                Ok(conn) => created.push(conn),
                Err(mut e) => {
                    for conn in created {
                        if let Err(d) = conn.disconnect().await {
                            e.add_suppressed(d);
                        }
                    }
                    return Err(e);
                }
            }
        }

        shared.idle().queue.extend(created);
        shared.available.add_permits(capacity);
        log::info!(
            "FTP pool for {}:{} ready with {} connections",
            shared.config.host,
            shared.config.port,
            capacity
        );
        Ok(Self { shared })
    }

    pub fn config(&self) -> &FtpFileSystemConfig {
        &self.shared.config
    }

    pub fn mapper(&self) -> &Arc<dyn ErrorMapper> {
        &self.shared.mapper
    }

    pub fn is_closed(&self) -> bool {
        self.shared.is_closed()
    }

    /// Wait for an idle connection using the configured wait timeout.
    pub async fn acquire(&self) -> FtpResult<PooledConnection> {
        let wait = Duration::from_millis(self.shared.config.client_connection_wait_timeout_ms);
        self.acquire_timeout(wait).await
    }

    /// Wait up to `wait` for an idle connection; zero waits indefinitely.
    /// Closing the pool interrupts waiters.
    pub async fn acquire_timeout(&self, wait: Duration) -> FtpResult<PooledConnection> {
        if self.shared.is_closed() {
            return Err(FtpError::pool_closed());
        }
        let permit = if wait.is_zero() {
            self.shared.available.acquire().await
        } else {
            match time::timeout(wait, self.shared.available.acquire()).await {
                Ok(permit) => permit,
                Err(_) => return Err(FtpError::pool_timeout(wait.as_millis() as u64)),
            }
        };
        let permit = permit.map_err(|_| {
            FtpError::interrupted("Connection pool was closed while waiting for a connection")
        })?;
        permit.forget();
        self.checkout().await
    }

    /// Never waits: takes an idle connection if there is one, otherwise
    /// creates a transient one that is disconnected on release.
    pub async fn acquire_or_create(&self) -> FtpResult<PooledConnection> {
        match self.shared.available.try_acquire() {
            Ok(permit) => {
                permit.forget();
                self.checkout().await
            }
            Err(TryAcquireError::Closed) => Err(FtpError::pool_closed()),
            Err(TryAcquireError::NoPermits) => {
                let conn = Connection::open(&self.shared, false).await?;
                self.shared.overflow.fetch_add(1, Ordering::SeqCst);
                log::debug!("FTP pool empty, created transient connection {}", conn.id());
                conn.claim();
                Ok(PooledConnection::new(Lease::new(conn, self.shared.clone())))
            }
        }
    }

    /// A permit is held: pop, validate, hand out. Until the hand-out the
    /// connection sits in a `Checkout`, so a cancelled caller gives it back.
    async fn checkout(&self) -> FtpResult<PooledConnection> {
        let conn = self.shared.pop_idle().ok_or_else(FtpError::pool_closed)?;
        let mut checkout = Checkout::new(&self.shared, conn);
        if let Err(e) = checkout.validate().await {
            checkout.put_back().await;
            return Err(e);
        }
        let conn = checkout.hand_out().ok_or_else(FtpError::pool_closed)?;
        Ok(PooledConnection::new(Lease::new(conn, self.shared.clone())))
    }

    /// Probe every idle connection and put each back regardless of the
    /// outcome. Connections in use are left alone; failed ones are
    /// replaced on their next hand-out.
    pub async fn keep_alive(&self) -> FtpResult<()> {
        let mut drained = Vec::new();
        loop {
            match self.shared.available.try_acquire() {
                Ok(permit) => {
                    permit.forget();
                    match self.shared.pop_idle() {
                        Some(conn) => drained.push(Checkout::new(&self.shared, conn)),
                        None => break,
                    }
                }
                Err(TryAcquireError::NoPermits) => break,
                Err(TryAcquireError::Closed) => return Err(FtpError::pool_closed()),
            }
        }

        let mut failed = 0usize;
        for conn in drained.iter().filter_map(Checkout::connection) {
            if let Err(e) = conn.probe().await {
                failed += 1;
                log::warn!("FTP keep-alive failed on connection {}: {}", conn.id(), e);
            }
        }
        log::debug!(
            "FTP keep-alive probed {} idle connections ({} failed)",
            drained.len(),
            failed
        );

        for checkout in drained {
            checkout.put_back().await;
        }
        Ok(())
    }

    /// Refuse further acquisitions and disconnect every connection, idle
    /// or still checked out. Holders of the latter see their session gone
    /// and their later release succeeds without a second QUIT. Disconnect
    /// failures are collected on the first one.
    pub async fn close(&self) -> FtpResult<()> {
        let drained: Vec<Arc<Connection>> = {
            let mut idle = self.shared.idle();
            if idle.closed {
                return Ok(());
            }
            idle.closed = true;
            idle.queue.drain(..).collect()
        };
        self.shared.available.close();
        let outstanding = self.shared.outstanding(&drained);
        log::info!(
            "FTP pool for {}:{} closing ({} idle, {} in use)",
            self.shared.config.host,
            self.shared.config.port,
            drained.len(),
            outstanding.len()
        );

        let mut errors = Vec::new();
        for conn in drained {
            if let Err(e) = conn.disconnect().await {
                errors.push(e);
            }
        }
        for conn in outstanding {
            conn.mark_broken();
            if let Err(e) = conn.disconnect().await {
                errors.push(e);
            }
        }
        combine(errors)
    }

    pub fn stats(&self) -> PoolStats {
        let idle = self.shared.idle();
        let capacity = self.shared.config.client_connection_count;
        let in_use = if idle.closed {
            0
        } else {
            capacity.saturating_sub(idle.queue.len())
        };
        PoolStats {
            capacity: capacity as u32,
            idle: idle.queue.len() as u32,
            in_use: in_use as u32,
            overflow: self.shared.overflow.load(Ordering::SeqCst) as u32,
            closed: idle.closed,
        }
    }
}

/// First error is primary, the rest are attached as suppressed.
pub(crate) fn combine(errors: Vec<FtpError>) -> FtpResult<()> {
    let mut iter = errors.into_iter();
    match iter.next() {
        None => Ok(()),
        Some(mut primary) => {
            for e in iter {
                primary.add_suppressed(e);
            }
            Err(primary)
        }
    }
}

/// Spawn a background task that runs `keep_alive` every `interval` until
/// the pool closes.
pub fn spawn_keep_alive(pool: ConnectionPool, interval: Duration) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = time::interval(interval);
        ticker.tick().await;
        loop {
            ticker.tick().await;
            if pool.is_closed() {
                break;
            }
            if let Err(e) = pool.keep_alive().await {
                log::debug!("FTP keep-alive task stopping: {}", e);
                break;
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ftpfs::error::FtpErrorKind;
    use crate::ftpfs::mapper::DefaultErrorMapper;
    use crate::ftpfs::simulated::SimulatedServer;

    fn config(capacity: usize, wait_ms: u64) -> FtpFileSystemConfig {
        let mut config = FtpFileSystemConfig::new("sim");
        config.client_connection_count = capacity;
        config.client_connection_wait_timeout_ms = wait_ms;
        config
    }

    async fn pool(server: &SimulatedServer, capacity: usize, wait_ms: u64) -> ConnectionPool {
        ConnectionPool::new(
            config(capacity, wait_ms),
            Arc::new(server.clone()),
            Arc::new(DefaultErrorMapper),
        )
        .await
        .unwrap()
    }

    #[tokio::test]
    async fn creates_capacity_connections() {
        let server = SimulatedServer::new();
        let pool = pool(&server, 3, 0).await;
        assert_eq!(server.connect_count(), 3);
        let stats = pool.stats();
        assert_eq!((stats.capacity, stats.idle, stats.in_use), (3, 3, 0));
    }

    #[tokio::test]
    async fn construction_failure_unwinds() {
        let server = SimulatedServer::new();
        server.set_connect_limit(2);
        server.set_fail_disconnect(true);
        let err = ConnectionPool::new(
            config(4, 0),
            Arc::new(server.clone()),
            Arc::new(DefaultErrorMapper),
        )
        .await
        .err()
        .unwrap();
        assert_eq!(err.kind, FtpErrorKind::ConnectionFailed);
        assert_eq!(err.suppressed.len(), 2);
        assert_eq!(server.live_sessions(), 0);
    }

    #[tokio::test]
    async fn acquire_times_out() {
        let server = SimulatedServer::new();
        let pool = pool(&server, 1, 50).await;
        let held = pool.acquire().await.unwrap();
        let err = pool.acquire().await.err().unwrap();
        assert_eq!(err.kind, FtpErrorKind::PoolTimeout);
        held.release().await.unwrap();
        pool.acquire().await.unwrap().release().await.unwrap();
    }

    #[tokio::test]
    async fn acquire_or_create_overflows_without_pooling() {
        let server = SimulatedServer::new();
        let pool = pool(&server, 1, 0).await;
        let first = pool.acquire().await.unwrap();
        let second = pool.acquire_or_create().await.unwrap();
        assert!(first.is_pooled());
        assert!(!second.is_pooled());
        assert_eq!(pool.stats().overflow, 1);
        assert_eq!(server.connect_count(), 2);

        second.release().await.unwrap();
        assert_eq!(server.disconnect_count(), 1);
        assert_eq!(pool.stats().overflow, 0);
        first.release().await.unwrap();
        let stats = pool.stats();
        assert_eq!((stats.idle, stats.in_use), (1, 0));
    }

    #[tokio::test]
    async fn dead_connection_is_replaced() {
        let server = SimulatedServer::new();
        let pool = pool(&server, 1, 0).await;
        let first_id = {
            let conn = pool.acquire().await.unwrap();
            let id = conn.id().to_string();
            conn.release().await.unwrap();
            id
        };
        server.set_fail_noop(true);
        let conn = pool.acquire().await.unwrap();
        assert_ne!(conn.id(), first_id);
        assert_eq!(server.connect_count(), 2);
        assert_eq!(server.disconnect_count(), 1);
        conn.release().await.unwrap();
    }

    #[tokio::test]
    async fn failed_replacement_returns_dead_connection() {
        let server = SimulatedServer::new();
        let pool = pool(&server, 2, 0).await;
        server.set_fail_noop(true);
        server.set_fail_connect(true);

        let err = pool.acquire().await.err().unwrap();
        assert_eq!(err.kind, FtpErrorKind::ConnectionFailed);
        assert_eq!(pool.stats().idle, 2);

        server.set_fail_noop(false);
        server.set_fail_connect(false);
        let conn = pool.acquire().await.unwrap();
        conn.release().await.unwrap();
        assert_eq!(pool.stats().idle, 2);
    }

    #[tokio::test]
    async fn keep_alive_returns_every_idle_connection() {
        let server = SimulatedServer::new();
        let pool = pool(&server, 3, 0).await;
        let held = pool.acquire().await.unwrap();
        server.clear_commands();
        server.set_fail_noop(true);
        pool.keep_alive().await.unwrap();
        assert_eq!(server.count_commands("NOOP"), 2);
        assert_eq!(pool.stats().idle, 2);
        assert_eq!(server.disconnect_count(), 0);
        held.release().await.unwrap();
    }

    #[tokio::test]
    async fn close_interrupts_waiters_and_is_terminal() {
        let server = SimulatedServer::new();
        let pool = pool(&server, 1, 0).await;
        let held = pool.acquire().await.unwrap();

        let waiter = {
            let pool = pool.clone();
            tokio::spawn(async move { pool.acquire().await.err().map(|e| e.kind) })
        };
        tokio::task::yield_now().await;
        tokio::time::sleep(Duration::from_millis(20)).await;

        pool.close().await.unwrap();
        assert_eq!(waiter.await.unwrap(), Some(FtpErrorKind::Interrupted));
        assert_eq!(pool.acquire().await.err().unwrap().kind, FtpErrorKind::PoolClosed);
        assert_eq!(pool.acquire_or_create().await.err().unwrap().kind, FtpErrorKind::PoolClosed);

        held.release().await.unwrap();
        assert_eq!(server.live_sessions(), 0);
        assert!(pool.stats().closed);
    }

    #[tokio::test]
    async fn close_collects_disconnect_failures() {
        let server = SimulatedServer::new();
        let pool = pool(&server, 3, 0).await;
        server.set_fail_disconnect(true);
        let err = pool.close().await.unwrap_err();
        assert_eq!(err.suppressed.len(), 2);
        pool.close().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn cancelled_acquire_gives_the_connection_back() {
        let server = SimulatedServer::new();
        let pool = pool(&server, 1, 0).await;
        server.set_noop_delay(Duration::from_millis(200));

        let cancelled = time::timeout(Duration::from_millis(50), pool.acquire()).await;
        assert!(cancelled.is_err());
        let stats = pool.stats();
        assert_eq!((stats.idle, stats.in_use), (1, 0));

        server.set_noop_delay(Duration::ZERO);
        let conn = pool.acquire_timeout(Duration::from_secs(2)).await.unwrap();
        assert_eq!(server.connect_count(), 2);
        assert_eq!(server.live_sessions(), 1);
        conn.release().await.unwrap();
        assert_eq!(pool.stats().idle, 1);
    }

    #[tokio::test]
    async fn close_disconnects_checked_out_connections() {
        let server = SimulatedServer::new();
        let pool = pool(&server, 2, 0).await;
        let held = pool.acquire().await.unwrap();
        let extra = pool.acquire_or_create().await.unwrap();
        let extra2 = pool.acquire_or_create().await.unwrap();
        assert!(!extra2.is_pooled());

        pool.close().await.unwrap();
        assert_eq!(server.live_sessions(), 0);
        assert_eq!(server.count_commands("QUIT"), 3);

        held.release().await.unwrap();
        extra.release().await.unwrap();
        extra2.release().await.unwrap();
        assert_eq!(server.count_commands("QUIT"), 3);
        assert_eq!(pool.stats().overflow, 0);
    }

    #[tokio::test]
    async fn close_collects_failures_of_checked_out_connections() {
        let server = SimulatedServer::new();
        let pool = pool(&server, 2, 0).await;
        let held = pool.acquire().await.unwrap();
        server.set_fail_disconnect(true);
        let err = pool.close().await.unwrap_err();
        assert_eq!(err.suppressed.len(), 1);
        held.release().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn background_keep_alive_sweeps() {
        let server = SimulatedServer::new();
        let pool = pool(&server, 2, 0).await;
        server.clear_commands();
        let task = spawn_keep_alive(pool.clone(), Duration::from_secs(30));
        tokio::time::sleep(Duration::from_secs(61)).await;
        assert_eq!(server.count_commands("NOOP"), 4);
        pool.close().await.unwrap();
        task.abort();
    }
}
