//! Bounded connection pool.
//!
//! Owns every physical connection and hands them out as [`ConnectionLease`]s.
//! Capacity is a semaphore with `max_size` permits; a released connection
//! rejoins the idle queue before its permit is freed, so a waiter never sees
//! spare capacity without a connection it can reuse or a slot it can fill by
//! opening one. A connection is IDLE in the queue or LEASED to exactly one
//! lease, never both.
//!
//! Background maintenance retires aged or long-idle connections, keeps
//! `min_idle` warm connections around, and flags leases held past the leak
//! detection threshold.

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;
use tokio::sync::{Mutex, OwnedSemaphorePermit, Semaphore};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::PoolConfig;
use crate::driver::{DriverSession, PoolDriver};
use crate::error::{DriverError, TxError, TxResult};

/// A live session plus the pool's bookkeeping for it.
pub(crate) struct PhysicalConnection {
    pub(crate) id: String,
    pub(crate) session: Box<dyn DriverSession>,
    opened_at: Instant,
    idle_since: Instant,
}

struct LeaseInfo {
    connection_id: String,
    borrowed_at: Instant,
    borrowed_at_utc: DateTime<Utc>,
    leak_warned: bool,
}

struct PoolShared {
    driver: Arc<dyn PoolDriver>,
    config: PoolConfig,
    idle: Mutex<VecDeque<PhysicalConnection>>,
    semaphore: Arc<Semaphore>,
    leases: DashMap<String, LeaseInfo>,
    waiting: AtomicUsize,
    conn_seq: AtomicU64,
}

impl PoolShared {
    fn new_connection(&self, session: Box<dyn DriverSession>) -> PhysicalConnection {
        let id = format!("conn_{}", self.conn_seq.fetch_add(1, Ordering::Relaxed));
        let now = Instant::now();
        PhysicalConnection {
            id,
            session,
            opened_at: now,
            idle_since: now,
        }
    }

    /// Return a connection to the idle set, or discard it if it cannot be
    /// reset and validated. The capacity permit is dropped last.
    async fn reclaim(&self, mut conn: PhysicalConnection, permit: Option<OwnedSemaphorePermit>) {
        let reset_ok = conn.session.set_auto_commit(true).await.is_ok()
            && conn
                .session
                .set_isolation(self.config.default_isolation)
                .await
                .is_ok();
        let healthy = reset_ok
            && (!self.config.test_on_release || self.driver.validate(conn.session.as_mut()).await);

        if healthy {
            conn.idle_since = Instant::now();
            debug!(connection_id = %conn.id, "connection returned to idle set");
            self.idle.lock().await.push_back(conn);
        } else {
            warn!(connection_id = %conn.id, "discarding connection that failed validation on release");
            self.driver.close(conn.session).await;
            self.refill_idle().await;
        }
        drop(permit);
    }

    /// Open connections until the idle set reaches `min_idle`, without ever
    /// letting idle + leased exceed `max_size`.
    async fn refill_idle(&self) {
        loop {
            {
                let idle = self.idle.lock().await;
                let total = idle.len() + self.leases.len();
                if idle.len() >= self.config.min_idle as usize
                    || total >= self.config.max_size as usize
                {
                    return;
                }
            }
            match self.driver.open().await {
                Ok(session) => {
                    let conn = self.new_connection(session);
                    let mut idle = self.idle.lock().await;
                    if idle.len() + self.leases.len() < self.config.max_size as usize {
                        info!(connection_id = %conn.id, "opened replacement connection");
                        idle.push_back(conn);
                    } else {
                        drop(idle);
                        self.driver.close(conn.session).await;
                        return;
                    }
                }
                Err(e) => {
                    warn!(error = %e, "failed to open replacement connection");
                    return;
                }
            }
        }
    }
}

/// Handle over a borrowed [`PhysicalConnection`].
///
/// Must be returned exactly once via [`ConnectionPool::release`] (the
/// commit/rollback path does this for transactional leases). Holders never
/// close the physical connection directly. Dropping a lease without
/// releasing it reclaims the connection through a spawned task and logs a
/// warning.
pub struct ConnectionLease {
    conn: Option<PhysicalConnection>,
    permit: Option<OwnedSemaphorePermit>,
    lease_id: String,
    borrowed_at: Instant,
    shared: Arc<PoolShared>,
}

impl ConnectionLease {
    pub fn id(&self) -> &str {
        &self.lease_id
    }

    pub fn connection_id(&self) -> &str {
        self.conn
            .as_ref()
            .map(|c| c.id.as_str())
            .unwrap_or("<released>")
    }

    /// How long this lease has been held.
    pub fn held(&self) -> Duration {
        self.borrowed_at.elapsed()
    }

    pub(crate) fn session_mut(&mut self) -> &mut dyn DriverSession {
        self.conn
            .as_mut()
            .expect("lease used after release")
            .session
            .as_mut()
    }
}

impl std::fmt::Debug for ConnectionLease {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionLease")
            .field("lease_id", &self.lease_id)
            .field("connection_id", &self.connection_id())
            .finish_non_exhaustive()
    }
}

impl Drop for ConnectionLease {
    fn drop(&mut self) {
        let Some(conn) = self.conn.take() else {
            return;
        };
        let permit = self.permit.take();
        let shared = Arc::clone(&self.shared);
        let lease_id = self.lease_id.clone();

        // Reclaim needs async driver calls, so it runs on a spawned task.
        // Explicit release is the expected path.
        tokio::spawn(async move {
            warn!(
                lease_id = %lease_id,
                connection_id = %conn.id,
                "lease dropped without release; reclaiming connection"
            );
            shared.leases.remove(&lease_id);
            shared.reclaim(conn, permit).await;
        });
    }
}

/// Read-only view of the pool for observability.
#[derive(Debug, Clone, Serialize)]
pub struct PoolSnapshot {
    /// Leases currently held.
    pub active: usize,
    /// Connections sitting in the idle queue.
    pub idle: usize,
    /// Callers blocked in `acquire`.
    pub waiting: usize,
    pub leases: Vec<LeaseSnapshot>,
}

#[derive(Debug, Clone, Serialize)]
pub struct LeaseSnapshot {
    pub lease_id: String,
    pub connection_id: String,
    pub borrowed_at: DateTime<Utc>,
    pub held_ms: u64,
}

/// Bounded pool of physical connections.
#[derive(Clone)]
pub struct ConnectionPool {
    shared: Arc<PoolShared>,
}

impl ConnectionPool {
    /// Create a pool over a driver. The configuration is validated and
    /// immutable afterwards; connections open lazily on first demand (or
    /// through maintenance refill).
    pub fn new(driver: Arc<dyn PoolDriver>, config: PoolConfig) -> Result<Self, String> {
        config.validate()?;
        let semaphore = Arc::new(Semaphore::new(config.max_size as usize));
        Ok(Self {
            shared: Arc::new(PoolShared {
                driver,
                config,
                idle: Mutex::new(VecDeque::new()),
                semaphore,
                leases: DashMap::new(),
                waiting: AtomicUsize::new(0),
                conn_seq: AtomicU64::new(0),
            }),
        })
    }

    pub fn config(&self) -> &PoolConfig {
        &self.shared.config
    }

    /// Lease a connection, waiting up to the configured acquire timeout for
    /// capacity. Reuses an idle connection when one exists, otherwise opens
    /// a new one through the driver.
    pub async fn acquire(&self) -> TxResult<ConnectionLease> {
        let shared = &self.shared;
        let started = Instant::now();

        shared.waiting.fetch_add(1, Ordering::Relaxed);
        let permit = tokio::time::timeout(
            shared.config.acquire_timeout(),
            Arc::clone(&shared.semaphore).acquire_owned(),
        )
        .await;
        shared.waiting.fetch_sub(1, Ordering::Relaxed);

        let waited_ms = started.elapsed().as_millis() as u64;
        let permit = match permit {
            Ok(Ok(permit)) => permit,
            Ok(Err(_closed)) => {
                warn!("acquire against a closed pool");
                return Err(TxError::PoolExhausted { waited_ms });
            }
            Err(_elapsed) => {
                warn!(waited_ms, "connection acquire timed out");
                return Err(TxError::PoolExhausted { waited_ms });
            }
        };

        let conn = {
            let mut idle = shared.idle.lock().await;
            idle.pop_front()
        };
        let conn = match conn {
            Some(conn) => conn,
            None => match shared.driver.open().await {
                Ok(session) => shared.new_connection(session),
                Err(e) => {
                    drop(permit);
                    return Err(TxError::ConnectionInvalid {
                        message: format!("failed to open connection: {e}"),
                        cause: Some(e),
                    });
                }
            },
        };

        let lease_id = format!("lease_{}", Uuid::new_v4().simple());
        let now = Instant::now();
        shared.leases.insert(
            lease_id.clone(),
            LeaseInfo {
                connection_id: conn.id.clone(),
                borrowed_at: now,
                borrowed_at_utc: Utc::now(),
                leak_warned: false,
            },
        );
        debug!(lease_id = %lease_id, connection_id = %conn.id, "connection leased");

        Ok(ConnectionLease {
            conn: Some(conn),
            permit: Some(permit),
            lease_id,
            borrowed_at: now,
            shared: Arc::clone(shared),
        })
    }

    /// Return a lease to the pool. The connection is reset to auto-commit
    /// with the pool's default isolation and validated; connections that
    /// fail either step are discarded and replaced up to `min_idle`.
    pub async fn release(&self, mut lease: ConnectionLease) {
        let Some(conn) = lease.conn.take() else {
            return;
        };
        let permit = lease.permit.take();
        self.shared.leases.remove(&lease.lease_id);
        debug!(lease_id = %lease.lease_id, connection_id = %conn.id, "lease released");
        self.shared.reclaim(conn, permit).await;
    }

    /// One maintenance pass: retire aged/idle-expired connections, refill to
    /// `min_idle`, flag suspected leaks. Normally driven by
    /// [`ConnectionPool::start_maintenance`].
    pub async fn run_maintenance(&self) {
        let shared = &self.shared;
        let config = &shared.config;

        let retired: Vec<PhysicalConnection> = {
            let mut idle = shared.idle.lock().await;
            let mut keep = VecDeque::with_capacity(idle.len());
            let mut retired = Vec::new();
            while let Some(conn) = idle.pop_front() {
                if conn.opened_at.elapsed() >= config.max_lifetime()
                    || conn.idle_since.elapsed() >= config.idle_timeout()
                {
                    retired.push(conn);
                } else {
                    keep.push_back(conn);
                }
            }
            *idle = keep;
            retired
        };
        for conn in retired {
            info!(connection_id = %conn.id, age_secs = conn.opened_at.elapsed().as_secs(), "retiring connection");
            shared.driver.close(conn.session).await;
        }

        shared.refill_idle().await;

        let threshold = config.leak_detection_threshold();
        for mut entry in shared.leases.iter_mut() {
            if !entry.leak_warned && entry.borrowed_at.elapsed() >= threshold {
                entry.leak_warned = true;
                warn!(
                    lease_id = %entry.key(),
                    connection_id = %entry.connection_id,
                    borrowed_at = %entry.borrowed_at_utc,
                    held_secs = entry.borrowed_at.elapsed().as_secs(),
                    "lease held past the leak detection threshold"
                );
            }
        }
    }

    /// Spawn the periodic maintenance task. The handle can be aborted at
    /// shutdown.
    pub fn start_maintenance(&self) -> tokio::task::JoinHandle<()> {
        let pool = self.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(pool.shared.config.maintenance_interval());
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                interval.tick().await;
                pool.run_maintenance().await;
            }
        })
    }

    /// Current counts and per-lease ages.
    pub async fn snapshot(&self) -> PoolSnapshot {
        let idle = self.shared.idle.lock().await.len();
        let leases: Vec<LeaseSnapshot> = self
            .shared
            .leases
            .iter()
            .map(|entry| LeaseSnapshot {
                lease_id: entry.key().clone(),
                connection_id: entry.connection_id.clone(),
                borrowed_at: entry.borrowed_at_utc,
                held_ms: entry.borrowed_at.elapsed().as_millis() as u64,
            })
            .collect();
        PoolSnapshot {
            active: leases.len(),
            idle,
            waiting: self.shared.waiting.load(Ordering::Relaxed),
            leases,
        }
    }

    /// Close the pool: idle connections are closed and subsequent acquires
    /// fail. Outstanding leases drain back through `release` as usual.
    pub async fn close(&self) {
        self.shared.semaphore.close();
        let drained: Vec<PhysicalConnection> = {
            let mut idle = self.shared.idle.lock().await;
            idle.drain(..).collect()
        };
        for conn in drained {
            info!(connection_id = %conn.id, "closing connection");
            self.shared.driver.close(conn.session).await;
        }
        info!("pool closed");
    }
}

impl std::fmt::Debug for ConnectionPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionPool")
            .field("max_size", &self.shared.config.max_size)
            .field("active", &self.shared.leases.len())
            .finish_non_exhaustive()
    }
}
