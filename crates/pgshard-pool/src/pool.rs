use crate::backend::{Address, Backend, Connector, Detached};
use metrics::{counter, gauge, histogram};
use parking_lot::Mutex;
use pgshard_core::{ProxyError, Query, Role, ShardId};
use pgshard_protocol::TransactionState;
use std::collections::VecDeque;
use std::fmt;
use std::ops::{Deref, DerefMut};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::{timeout, timeout_at, Instant};
use tracing::{debug, info, warn};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolSettings {
    pub min: usize,
    pub max: usize,
    pub checkout_timeout: Duration,
    pub connect_timeout: Duration,
    pub idle_timeout: Duration,
    pub rollback_timeout: Duration,
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self {
            min: 0,
            max: 10,
            checkout_timeout: Duration::from_secs(5),
            connect_timeout: Duration::from_secs(5),
            idle_timeout: Duration::from_secs(60),
            rollback_timeout: Duration::from_secs(5),
        }
    }
}

/// How the holder of a connection left it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// Transaction finished; reuse the connection if the server agrees it is idle.
    Clean,
    /// The session failed or could not be wound down; close it.
    Broken,
}

/// Point-in-time counters of one pool.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolStats {
    pub address: Address,
    pub cl_waiting: usize,
    pub sv_idle: usize,
    pub sv_active: usize,
    pub sv_total: usize,
    pub maxwait: Duration,
    pub errors: usize,
    pub out_of_sync: usize,
    pub online: bool,
}

struct IdleConn {
    conn: Box<dyn Backend>,
    since: Instant,
}

struct Inner {
    idle: VecDeque<IdleConn>,
    checked_out: usize,
    connecting: usize,
    waiting: usize,
    /// Bumped by reconnect; connections from an older generation are closed on check-in.
    generation: u64,
    online: bool,
    errors: usize,
    out_of_sync: usize,
    maxwait: Duration,
}

impl Inner {
    fn total(&self) -> usize {
        self.idle.len() + self.checked_out + self.connecting
    }

    /// Remove connections idle past the timeout, keeping at least `min` open.
    fn expire_idle(&mut self, now: Instant, settings: &PoolSettings) -> Vec<IdleConn> {
        let mut removable = self.total().saturating_sub(settings.min);
        let mut expired = Vec::new();
        let mut kept = VecDeque::with_capacity(self.idle.len());
        for conn in self.idle.drain(..) {
            if removable > 0 && now.duration_since(conn.since) >= settings.idle_timeout {
                removable -= 1;
                expired.push(conn);
            } else {
                kept.push_back(conn);
            }
        }
        self.idle = kept;
        expired
    }
}

struct Shared {
    addr: Address,
    name: String,
    settings: PoolSettings,
    connector: Arc<dyn Connector>,
    inner: Mutex<Inner>,
    notify: Notify,
}

/// Connections to one server for one (cluster, shard, role).
#[derive(Clone)]
pub struct Pool {
    shared: Arc<Shared>,
}

impl fmt::Debug for Pool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pool")
            .field("addr", &self.shared.addr)
            .finish()
    }
}

enum Step {
    Ready(Box<dyn Backend>, u64),
    Connect(u64),
    Wait,
    Offline,
}

impl Pool {
    pub fn new(addr: Address, settings: PoolSettings, connector: Arc<dyn Connector>) -> Self {
        let name = format!("{}:{}/{}/{}", addr.host, addr.port, addr.shard, addr.role);
        Self {
            shared: Arc::new(Shared {
                addr,
                name,
                settings,
                connector,
                inner: Mutex::new(Inner {
                    idle: VecDeque::new(),
                    checked_out: 0,
                    connecting: 0,
                    waiting: 0,
                    generation: 0,
                    online: true,
                    errors: 0,
                    out_of_sync: 0,
                    maxwait: Duration::ZERO,
                }),
                notify: Notify::new(),
            }),
        }
    }

    pub fn addr(&self) -> &Address {
        &self.shared.addr
    }

    pub fn settings(&self) -> &PoolSettings {
        &self.shared.settings
    }

    pub fn is_online(&self) -> bool {
        self.shared.inner.lock().online
    }

    /// Connections in use plus clients queued for one; used by least-connections balancing.
    pub fn load(&self) -> usize {
        let inner = self.shared.inner.lock();
        inner.checked_out + inner.waiting
    }

    /// Wait for a usable connection, up to the checkout timeout.
    pub async fn checkout(&self) -> Result<Guard, ProxyError> {
        let started = Instant::now();
        let deadline = started + self.shared.settings.checkout_timeout;
        let mut waiter: Option<WaitSlot> = None;

        loop {
            let notified = self.shared.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let (step, expired) = {
                let mut inner = self.shared.inner.lock();
                let expired = inner.expire_idle(Instant::now(), &self.shared.settings);
                let step = if !inner.online {
                    Step::Offline
                } else if let Some(idle) = inner.idle.pop_back() {
                    inner.checked_out += 1;
                    Step::Ready(idle.conn, inner.generation)
                } else if inner.total() < self.shared.settings.max {
                    inner.connecting += 1;
                    Step::Connect(inner.generation)
                } else {
                    Step::Wait
                };
                (step, expired)
            };
            if !expired.is_empty() {
                debug!(pool = %self.shared.name, closed = expired.len(), "closed idle connections");
            }
            drop(expired);

            match step {
                Step::Offline => return Err(ProxyError::ShuttingDown),
                Step::Ready(conn, generation) => {
                    if conn.is_broken() {
                        self.checkin(conn, generation, Outcome::Broken);
                        continue;
                    }
                    drop(waiter.take());
                    return Ok(self.guard(conn, generation, started));
                }
                Step::Connect(generation) => {
                    let slot = ConnectSlot::new(self.clone());
                    let connect = self.shared.connector.connect(&self.shared.addr);
                    let result = match timeout(self.shared.settings.connect_timeout, connect).await
                    {
                        Ok(result) => result,
                        Err(_) => Err(ProxyError::BackendUnavailable(format!(
                            "connect to {} timed out",
                            self.shared.addr
                        ))),
                    };
                    match result {
                        Ok(conn) => {
                            {
                                let mut inner = self.shared.inner.lock();
                                inner.connecting -= 1;
                                inner.checked_out += 1;
                            }
                            slot.disarm();
                            drop(waiter.take());
                            debug!(pool = %self.shared.name, "opened server connection");
                            return Ok(self.guard(conn, generation, started));
                        }
                        Err(err) => {
                            drop(slot);
                            self.shared.inner.lock().errors += 1;
                            counter!("pgshard_connect_errors_total").increment(1);
                            warn!(pool = %self.shared.name, error = %err, "server connection failed");
                            return Err(err);
                        }
                    }
                }
                Step::Wait => {
                    if waiter.is_none() {
                        waiter = Some(WaitSlot::new(self.clone()));
                    }
                    if timeout_at(deadline, notified.as_mut()).await.is_err() {
                        counter!("pgshard_checkout_timeouts_total").increment(1);
                        return Err(ProxyError::PoolExhausted {
                            pool: self.shared.name.clone(),
                        });
                    }
                }
            }
        }
    }

    fn guard(&self, conn: Box<dyn Backend>, generation: u64, started: Instant) -> Guard {
        let waited = started.elapsed();
        {
            let mut inner = self.shared.inner.lock();
            if waited > inner.maxwait {
                inner.maxwait = waited;
            }
            self.record(&inner);
        }
        counter!("pgshard_checkouts_total").increment(1);
        histogram!("pgshard_checkout_wait_seconds").record(waited.as_secs_f64());
        Guard {
            conn,
            pool: self.clone(),
            generation,
            released: false,
        }
    }

    /// Return a connection; it goes back to the idle set only if it is clean and current.
    fn checkin(&self, conn: Box<dyn Backend>, generation: u64, outcome: Outcome) {
        let closed = {
            let mut inner = self.shared.inner.lock();
            inner.checked_out = inner.checked_out.saturating_sub(1);
            let reusable = outcome == Outcome::Clean
                && conn.is_clean()
                && inner.online
                && generation == inner.generation;
            let closed = if reusable {
                inner.idle.push_back(IdleConn {
                    conn,
                    since: Instant::now(),
                });
                None
            } else {
                if outcome == Outcome::Broken || conn.is_broken() {
                    inner.errors += 1;
                    counter!("pgshard_broken_connections_total").increment(1);
                    warn!(pool = %self.shared.name, "closing broken server connection");
                } else if !conn.is_clean() {
                    inner.out_of_sync += 1;
                    warn!(
                        pool = %self.shared.name,
                        state = ?conn.transaction_state(),
                        "server connection checked in out of sync"
                    );
                }
                Some(conn)
            };
            self.record(&inner);
            closed
        };
        self.shared.notify.notify_one();
        drop(closed);
    }

    /// Bring a connection back to idle: abort COPY, roll back an open transaction.
    async fn cleanup(&self, conn: &mut Box<dyn Backend>) -> bool {
        let rollback_timeout = self.shared.settings.rollback_timeout;
        let work = async {
            if conn.in_copy() {
                conn.copy_fail("client went away").await?;
            }
            if conn.transaction_state() != TransactionState::Idle {
                conn.execute(&Query::simple("ROLLBACK")).await?;
            }
            Ok::<(), ProxyError>(())
        };
        match timeout(rollback_timeout, work).await {
            Ok(Ok(())) => conn.is_clean(),
            _ => false,
        }
    }

    /// Open connections until the pool holds at least `min`.
    pub async fn prewarm(&self) {
        loop {
            let generation = {
                let mut inner = self.shared.inner.lock();
                if !inner.online || inner.total() >= self.shared.settings.min {
                    return;
                }
                inner.connecting += 1;
                inner.generation
            };
            let slot = ConnectSlot::new(self.clone());
            let connect = self.shared.connector.connect(&self.shared.addr);
            match timeout(self.shared.settings.connect_timeout, connect).await {
                Ok(Ok(conn)) => {
                    let stale = {
                        let mut inner = self.shared.inner.lock();
                        inner.connecting -= 1;
                        if inner.online && inner.generation == generation {
                            inner.idle.push_back(IdleConn {
                                conn,
                                since: Instant::now(),
                            });
                            self.record(&inner);
                            None
                        } else {
                            Some(conn)
                        }
                    };
                    slot.disarm();
                    self.shared.notify.notify_one();
                    drop(stale);
                }
                _ => {
                    drop(slot);
                    self.shared.inner.lock().errors += 1;
                    warn!(pool = %self.shared.name, "could not open minimum connections");
                    return;
                }
            }
        }
    }

    /// Close every idle connection and retire the checked-out ones when they return.
    pub async fn reconnect(&self) {
        let drained: Vec<IdleConn> = {
            let mut inner = self.shared.inner.lock();
            inner.generation += 1;
            inner.errors = 0;
            inner.out_of_sync = 0;
            let drained = inner.idle.drain(..).collect();
            self.record(&inner);
            drained
        };
        info!(pool = %self.shared.name, closed = drained.len(), "reconnecting pool");
        drop(drained);
        self.shared.notify.notify_waiters();
        self.prewarm().await;
    }

    /// Take the pool offline: close idle connections, fail waiters, refuse checkouts.
    pub fn shutdown(&self) {
        let drained: Vec<IdleConn> = {
            let mut inner = self.shared.inner.lock();
            inner.online = false;
            let drained = inner.idle.drain(..).collect();
            self.record(&inner);
            drained
        };
        info!(pool = %self.shared.name, closed = drained.len(), "pool shut down");
        drop(drained);
        self.shared.notify.notify_waiters();
    }

    /// Periodic housekeeping: close expired idle connections and top up to `min`.
    pub async fn maintain(&self) {
        let expired = {
            let mut inner = self.shared.inner.lock();
            let expired = inner.expire_idle(Instant::now(), &self.shared.settings);
            self.record(&inner);
            expired
        };
        drop(expired);
        self.prewarm().await;
    }

    pub fn stats(&self) -> PoolStats {
        let inner = self.shared.inner.lock();
        PoolStats {
            address: self.shared.addr.clone(),
            cl_waiting: inner.waiting,
            sv_idle: inner.idle.len(),
            sv_active: inner.checked_out,
            sv_total: inner.idle.len() + inner.checked_out,
            maxwait: inner.maxwait,
            errors: inner.errors,
            out_of_sync: inner.out_of_sync,
            online: inner.online,
        }
    }

    fn record(&self, inner: &Inner) {
        let pool = self.shared.name.clone();
        gauge!("pgshard_pool_active", "pool" => pool.clone()).set(inner.checked_out as f64);
        gauge!("pgshard_pool_idle", "pool" => pool.clone()).set(inner.idle.len() as f64);
        gauge!("pgshard_pool_waiting", "pool" => pool).set(inner.waiting as f64);
    }
}

/// Counts a queued checkout for as long as it waits, including when it is cancelled.
struct WaitSlot {
    pool: Pool,
}

impl WaitSlot {
    fn new(pool: Pool) -> Self {
        {
            let mut inner = pool.shared.inner.lock();
            inner.waiting += 1;
            pool.record(&inner);
        }
        Self { pool }
    }
}

impl Drop for WaitSlot {
    fn drop(&mut self) {
        let mut inner = self.pool.shared.inner.lock();
        inner.waiting = inner.waiting.saturating_sub(1);
        self.pool.record(&inner);
    }
}

/// Holds a reserved connection slot while a connect is in flight.
struct ConnectSlot {
    pool: Pool,
    armed: bool,
}

impl ConnectSlot {
    fn new(pool: Pool) -> Self {
        Self { pool, armed: true }
    }

    fn disarm(mut self) {
        self.armed = false;
    }
}

impl Drop for ConnectSlot {
    fn drop(&mut self) {
        if self.armed {
            self.pool.shared.inner.lock().connecting -= 1;
            self.pool.shared.notify.notify_one();
        }
    }
}

/// A checked-out server connection.
///
/// Hand it back with [`Guard::release`]. A guard dropped without release
/// (the owning task was cancelled) rolls its connection back in the
/// background before checking it in.
pub struct Guard {
    conn: Box<dyn Backend>,
    pool: Pool,
    generation: u64,
    released: bool,
}

impl fmt::Debug for Guard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Guard")
            .field("addr", self.pool.addr())
            .field("released", &self.released)
            .finish()
    }
}

impl Guard {
    pub fn address(&self) -> &Address {
        self.pool.addr()
    }

    pub fn shard(&self) -> ShardId {
        self.pool.addr().shard
    }

    pub fn role(&self) -> Role {
        self.pool.addr().role
    }

    pub fn release(mut self, outcome: Outcome) {
        self.released = true;
        let conn = std::mem::replace(&mut self.conn, Box::new(Detached));
        self.pool.checkin(conn, self.generation, outcome);
    }
}

impl Deref for Guard {
    type Target = dyn Backend;

    fn deref(&self) -> &Self::Target {
        &*self.conn
    }
}

impl DerefMut for Guard {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut *self.conn
    }
}

impl Drop for Guard {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        let mut conn = std::mem::replace(&mut self.conn, Box::new(Detached));
        let pool = self.pool.clone();
        let generation = self.generation;
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    // A failed cleanup leaves the connection dirty, which check-in counts.
                    pool.cleanup(&mut conn).await;
                    pool.checkin(conn, generation, Outcome::Clean);
                });
            }
            Err(_) => pool.checkin(conn, generation, Outcome::Broken),
        }
    }
}
