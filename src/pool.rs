//! Bounded connection pool with explicit slot states.
//!
//! Each slot is `Idle`, `Leased` or `Closed`. A semaphore with one permit per slot
//! queues waiters in FIFO order; the slot table sits behind a mutex that is only held
//! for bookkeeping, never across a connect or a query.

use async_trait::async_trait;
use log::{debug, info, warn};
use serde::Serialize;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

use crate::error::{DriverError, ToolError};
use crate::value::{RowSet, SqlValue};

/// One opened, authenticated link to the database.
#[async_trait]
pub trait DbConnection: Send {
    /// Runs a row-returning statement, keeping at most `max_rows` rows.
    async fn fetch(
        &mut self,
        sql: &str,
        params: &[SqlValue],
        max_rows: usize,
    ) -> Result<RowSet, DriverError>;

    /// Runs a statement that returns no rows and reports the affected row count.
    async fn execute(&mut self, sql: &str, params: &[SqlValue]) -> Result<u64, DriverError>;

    async fn ping(&mut self) -> Result<(), DriverError>;

    async fn close(self: Box<Self>);
}

/// Opens new connections for the pool.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self) -> Result<Box<dyn DbConnection>, DriverError>;
}

struct IdleConnection {
    conn: Box<dyn DbConnection>,
    last_used: Instant,
}

enum Slot {
    Idle(IdleConnection),
    Leased,
    Closed,
}

struct PoolState {
    slots: Vec<Slot>,
    shut_down: bool,
}

struct PoolInner {
    connector: Arc<dyn Connector>,
    state: Mutex<PoolState>,
    permits: Arc<Semaphore>,
    idle_check_after: Duration,
}

impl PoolInner {
    fn lock(&self) -> MutexGuard<'_, PoolState> {
        // Bookkeeping never panics while holding the lock, but a poisoned table is still consistent.
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn put_back(&self, index: usize, conn: Option<Box<dyn DbConnection>>, healthy: bool) {
        let mut state = self.lock();
        state.slots[index] = match conn {
            Some(conn) if healthy && !state.shut_down => Slot::Idle(IdleConnection {
                conn,
                last_used: Instant::now(),
            }),
            // Dropping the handle closes its socket.
            _ => Slot::Closed,
        };
    }
}

/// Snapshot of pool occupancy.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct PoolStats {
    pub max_size: usize,
    pub idle: usize,
    pub leased: usize,
    pub closed: usize,
    pub available: usize,
    pub shut_down: bool,
}

#[derive(Clone)]
pub struct Pool {
    inner: Arc<PoolInner>,
}

impl Pool {
    pub fn new(connector: Arc<dyn Connector>, max_size: usize, idle_check_after: Duration) -> Self {
        let slots = (0..max_size).map(|_| Slot::Closed).collect();
        Pool {
            inner: Arc::new(PoolInner {
                connector,
                state: Mutex::new(PoolState {
                    slots,
                    shut_down: false,
                }),
                permits: Arc::new(Semaphore::new(max_size)),
                idle_check_after,
            }),
        }
    }

    /// Leases a connection, waiting up to `timeout` for a free slot.
    ///
    /// Idle handles are reused first; otherwise a closed slot is filled with a freshly
    /// opened connection. A failed open gives the slot back as `Closed`.
    pub async fn acquire(&self, timeout: Duration) -> Result<Lease, ToolError> {
        let permit = match tokio::time::timeout(timeout, self.inner.permits.clone().acquire_owned()).await {
            Err(_) => return Err(ToolError::PoolExhausted(timeout)),
            Ok(Err(_)) => return Err(ToolError::PoolClosed),
            Ok(Ok(permit)) => permit,
        };

        let (index, idle) = {
            let mut state = self.inner.lock();
            if state.shut_down {
                return Err(ToolError::PoolClosed);
            }
            let found = state
                .slots
                .iter()
                .position(|slot| matches!(slot, Slot::Idle(_)))
                .or_else(|| state.slots.iter().position(|slot| matches!(slot, Slot::Closed)));
            let Some(index) = found else {
                return Err(ToolError::ConnectionError(
                    "no free slot despite an available permit".into(),
                ));
            };
            match std::mem::replace(&mut state.slots[index], Slot::Leased) {
                Slot::Idle(idle) => (index, Some(idle)),
                _ => (index, None),
            }
        };

        // From here on the lease owns the slot, so cancellation gives it back as Closed.
        let mut lease = Lease {
            pool: self.inner.clone(),
            index,
            conn: None,
            permit: Some(permit),
        };

        if let Some(idle) = idle {
            let mut conn = idle.conn;
            if idle.last_used.elapsed() < self.inner.idle_check_after {
                lease.conn = Some(conn);
                return Ok(lease);
            }
            match conn.ping().await {
                Ok(()) => {
                    lease.conn = Some(conn);
                    return Ok(lease);
                }
                Err(e) => warn!("Discarding idle connection in slot {index} after failed ping: {e}"),
            }
        }

        debug!("Opening connection for slot {index}");
        match self.inner.connector.connect().await {
            Ok(conn) => {
                lease.conn = Some(conn);
                Ok(lease)
            }
            Err(e) => {
                warn!("Failed to open connection for slot {index}: {e}");
                lease.release(false);
                Err(ToolError::ConnectionError(e.to_string()))
            }
        }
    }

    /// Returns a lease. Healthy handles go back to the idle set; anything else is closed
    /// and its slot reopened lazily on a later acquire.
    pub fn release(&self, lease: Lease, healthy: bool) {
        lease.release(healthy);
    }

    /// Closes every idle handle and makes later acquires fail with `PoolClosed`.
    /// Leased handles are closed as their leases come back.
    pub async fn shutdown(&self) {
        let idle: Vec<Box<dyn DbConnection>> = {
            let mut state = self.inner.lock();
            state.shut_down = true;
            state
                .slots
                .iter_mut()
                .filter_map(|slot| match std::mem::replace(slot, Slot::Closed) {
                    Slot::Idle(idle) => Some(idle.conn),
                    Slot::Leased => {
                        *slot = Slot::Leased;
                        None
                    }
                    Slot::Closed => None,
                })
                .collect()
        };
        self.inner.permits.close();

        let count = idle.len();
        for conn in idle {
            conn.close().await;
        }
        info!("Connection pool shut down ({count} idle connections closed)");
    }

    pub fn stats(&self) -> PoolStats {
        let state = self.inner.lock();
        let mut stats = PoolStats {
            max_size: state.slots.len(),
            idle: 0,
            leased: 0,
            closed: 0,
            available: self.inner.permits.available_permits(),
            shut_down: state.shut_down,
        };
        for slot in &state.slots {
            match slot {
                Slot::Idle(_) => stats.idle += 1,
                Slot::Leased => stats.leased += 1,
                Slot::Closed => stats.closed += 1,
            }
        }
        stats
    }
}

/// Temporary exclusive use of one pooled connection.
///
/// Dropping a lease without [`Lease::release`] treats the connection as suspect: this is
/// what happens when an in-flight call is cancelled.
pub struct Lease {
    pool: Arc<PoolInner>,
    index: usize,
    conn: Option<Box<dyn DbConnection>>,
    permit: Option<OwnedSemaphorePermit>,
}

impl Lease {
    pub fn slot(&self) -> usize {
        self.index
    }

    pub fn conn(&mut self) -> &mut (dyn DbConnection + 'static) {
        match self.conn.as_deref_mut() {
            Some(conn) => conn,
            None => unreachable!("lease holds a connection until it is returned"),
        }
    }

    pub fn release(mut self, healthy: bool) {
        self.finish(healthy);
    }

    fn finish(&mut self, healthy: bool) {
        let Some(permit) = self.permit.take() else {
            return;
        };
        if !healthy {
            debug!("Discarding connection in slot {}", self.index);
        }
        self.pool.put_back(self.index, self.conn.take(), healthy);
        // The slot must be settled before the next waiter is admitted.
        drop(permit);
    }
}

impl Drop for Lease {
    fn drop(&mut self) {
        if self.permit.is_some() {
            warn!(
                "Lease on slot {} dropped before release; discarding its connection",
                self.index
            );
            self.finish(false);
        }
    }
}
