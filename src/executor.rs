use log::{debug, error, warn};
use std::time::Duration;
use tokio::time::error::Elapsed;

use crate::error::{DriverError, ToolError};
use crate::pool::{Lease, Pool};
use crate::value::{RowSet, SqlValue};

/// Runs statements on leased connections, one lease per statement.
#[derive(Clone)]
pub struct Executor {
    pool: Pool,
    acquire_timeout: Duration,
    query_timeout: Duration,
}

impl Executor {
    pub fn new(pool: Pool, acquire_timeout: Duration, query_timeout: Duration) -> Self {
        Executor {
            pool,
            acquire_timeout,
            query_timeout,
        }
    }

    pub fn pool(&self) -> &Pool {
        &self.pool
    }

    /// Runs a row-returning statement. Every variable part must be in `params`; the
    /// template itself only ever contains validated identifiers.
    pub async fn fetch(
        &self,
        sql: &str,
        params: &[SqlValue],
        row_limit: usize,
    ) -> Result<RowSet, ToolError> {
        let mut lease = self.pool.acquire(self.acquire_timeout).await?;
        debug!("Executing on slot {}: {sql} {params:?}", lease.slot());
        let outcome = tokio::time::timeout(
            self.query_timeout,
            lease.conn().fetch(sql, params, row_limit),
        )
        .await;
        // A capped result leaves unread rows on the connection, which the driver would
        // drain at the start of whatever runs on it next.
        let reusable = !matches!(&outcome, Ok(Ok(set)) if set.truncated);
        if !reusable {
            debug!("Result on slot {} was truncated; discarding connection", lease.slot());
        }
        self.settle(lease, outcome, reusable)
    }

    /// Runs a statement without a result set and returns the affected row count.
    pub async fn execute(&self, sql: &str, params: &[SqlValue]) -> Result<u64, ToolError> {
        let mut lease = self.pool.acquire(self.acquire_timeout).await?;
        debug!("Executing on slot {}: {sql} {params:?}", lease.slot());
        let outcome =
            tokio::time::timeout(self.query_timeout, lease.conn().execute(sql, params)).await;
        self.settle(lease, outcome, true)
    }

    /// Leases a connection, pings it and gives it back.
    pub async fn round_trip(&self) -> Result<(), ToolError> {
        let mut lease = self.pool.acquire(self.acquire_timeout).await?;
        let outcome = tokio::time::timeout(self.query_timeout, lease.conn().ping()).await;
        self.settle(lease, outcome, true)
    }

    /// Returns the lease and maps the outcome. Statement errors leave the connection
    /// usable; broken links and timeouts do not. A success only keeps it if `reusable`.
    fn settle<T>(
        &self,
        lease: Lease,
        outcome: Result<Result<T, DriverError>, Elapsed>,
        reusable: bool,
    ) -> Result<T, ToolError> {
        match outcome {
            Ok(Ok(value)) => {
                lease.release(reusable);
                Ok(value)
            }
            Ok(Err(e)) => {
                let healthy = !e.is_connection();
                if healthy {
                    warn!("Statement failed: {e}");
                } else {
                    error!("Connection failed during statement: {e}");
                }
                lease.release(healthy);
                Err(e.into())
            }
            Err(_) => {
                warn!(
                    "Statement on slot {} exceeded {:?}; discarding connection",
                    lease.slot(),
                    self.query_timeout
                );
                lease.release(false);
                Err(ToolError::Timeout(self.query_timeout))
            }
        }
    }
}
