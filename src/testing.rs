//! Scripted in-memory stand-in for a MySQL connection, used by unit tests.

use async_trait::async_trait;
use serde_json::Value;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::error::DriverError;
use crate::pool::{Connector, DbConnection};
use crate::value::{ColumnMeta, RowSet, SqlValue};

/// What a fake connection does when it sees a statement.
#[derive(Clone)]
pub enum Reply {
    Rows(RowSet),
    Affected(u64),
    Fail(DriverError),
    /// Behaves as if the socket died mid-statement.
    Drop,
}

/// Ordered list of (SQL prefix, reply) rules. The first matching prefix wins;
/// unmatched statements return an empty row set.
#[derive(Clone, Default)]
pub struct Script {
    rules: Vec<(String, Reply)>,
    delay: Duration,
}

impl Script {
    pub fn on(mut self, prefix: &str, reply: Reply) -> Self {
        self.rules.push((prefix.to_string(), reply));
        self
    }

    /// Every statement takes at least this long.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    fn reply_for(&self, sql: &str) -> Reply {
        self.rules
            .iter()
            .find(|(prefix, _)| sql.starts_with(prefix.as_str()))
            .map(|(_, reply)| reply.clone())
            .unwrap_or_else(|| Reply::Rows(RowSet::default()))
    }
}

pub fn rows(columns: &[&str], data: Vec<Vec<Value>>) -> RowSet {
    RowSet {
        columns: columns
            .iter()
            .map(|name| ColumnMeta {
                name: name.to_string(),
                type_name: "VARCHAR".into(),
            })
            .collect(),
        rows: data,
        truncated: false,
    }
}

/// A statement as the engine received it.
#[derive(Debug, Clone, PartialEq)]
pub struct Executed {
    pub connection: usize,
    pub sql: String,
    pub params: Vec<SqlValue>,
}

#[derive(Default)]
struct Shared {
    opened: AtomicUsize,
    closed: AtomicUsize,
    failing_connects: AtomicUsize,
    log: Mutex<Vec<Executed>>,
    broken: Mutex<Vec<Arc<AtomicBool>>>,
    script: Mutex<Script>,
}

pub struct FakeConnector {
    shared: Arc<Shared>,
}

impl FakeConnector {
    pub fn new(script: Script) -> Self {
        let shared = Shared::default();
        *shared.script.lock().unwrap() = script;
        FakeConnector {
            shared: Arc::new(shared),
        }
    }

    pub fn set_script(&self, script: Script) {
        *self.shared.script.lock().unwrap() = script;
    }

    pub fn opened(&self) -> usize {
        self.shared.opened.load(Ordering::SeqCst)
    }

    pub fn closed(&self) -> usize {
        self.shared.closed.load(Ordering::SeqCst)
    }

    pub fn fail_next_connects(&self, n: usize) {
        self.shared.failing_connects.store(n, Ordering::SeqCst);
    }

    /// Marks every connection opened so far as dead.
    pub fn break_all(&self) {
        for flag in self.shared.broken.lock().unwrap().iter() {
            flag.store(true, Ordering::SeqCst);
        }
    }

    pub fn executed(&self) -> Vec<Executed> {
        self.shared.log.lock().unwrap().clone()
    }
}

#[async_trait]
impl Connector for FakeConnector {
    async fn connect(&self) -> Result<Box<dyn DbConnection>, DriverError> {
        let failing = self.shared.failing_connects.load(Ordering::SeqCst);
        if failing > 0 {
            self.shared.failing_connects.store(failing - 1, Ordering::SeqCst);
            return Err(DriverError::Connection("connection refused".into()));
        }
        let id = self.shared.opened.fetch_add(1, Ordering::SeqCst) + 1;
        let broken = Arc::new(AtomicBool::new(false));
        self.shared.broken.lock().unwrap().push(broken.clone());
        Ok(Box::new(FakeConnection {
            id,
            broken,
            shared: self.shared.clone(),
        }))
    }
}

struct FakeConnection {
    id: usize,
    broken: Arc<AtomicBool>,
    shared: Arc<Shared>,
}

impl FakeConnection {
    async fn run(&mut self, sql: &str, params: &[SqlValue]) -> Result<Reply, DriverError> {
        if self.broken.load(Ordering::SeqCst) {
            return Err(DriverError::Connection("server has gone away".into()));
        }
        self.shared.log.lock().unwrap().push(Executed {
            connection: self.id,
            sql: sql.to_string(),
            params: params.to_vec(),
        });
        let (reply, delay) = {
            let script = self.shared.script.lock().unwrap();
            (script.reply_for(sql), script.delay)
        };
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        match reply {
            Reply::Drop => {
                self.broken.store(true, Ordering::SeqCst);
                Err(DriverError::Connection("lost connection to server during query".into()))
            }
            Reply::Fail(e) => Err(e),
            other => Ok(other),
        }
    }
}

#[async_trait]
impl DbConnection for FakeConnection {
    async fn fetch(
        &mut self,
        sql: &str,
        params: &[SqlValue],
        max_rows: usize,
    ) -> Result<RowSet, DriverError> {
        match self.run(sql, params).await? {
            Reply::Rows(mut set) => {
                if set.rows.len() > max_rows {
                    set.rows.truncate(max_rows);
                    set.truncated = true;
                }
                Ok(set)
            }
            _ => Ok(RowSet::default()),
        }
    }

    async fn execute(&mut self, sql: &str, params: &[SqlValue]) -> Result<u64, DriverError> {
        match self.run(sql, params).await? {
            Reply::Affected(n) => Ok(n),
            _ => Ok(0),
        }
    }

    async fn ping(&mut self) -> Result<(), DriverError> {
        if self.broken.load(Ordering::SeqCst) {
            Err(DriverError::Connection("server has gone away".into()))
        } else {
            Ok(())
        }
    }

    async fn close(self: Box<Self>) {
        self.shared.closed.fetch_add(1, Ordering::SeqCst);
    }
}
