//! Shared in-memory database harness for the integration tests.
//!
//! `MemoryServer` stands in for a database: a map of named integer cells
//! (account balances in most tests). Each session keeps an uncommitted
//! overlay; commit applies it to the shared store, rollback discards it.
//! The executor understands a three-verb statement grammar:
//!
//! - `put <key> [<value>]` writes a cell (value from the statement or the
//!   first parameter),
//! - `get <key>` reads a cell,
//! - `raise <code> <message..>` fails with a vendor-coded driver error.

#![allow(dead_code)]

use std::any::Any;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Once};

use async_trait::async_trait;
use serde_json::{Value, json};

use dbtx::{
    ConnectionPool, ContextBinder, DialectConfig, DriverError, DriverSession, ErrorTranslator,
    ExecutionContext, IsolationLevel, PoolConfig, PoolDriver, ResourceAccessor, Row,
    StatementExecutor, TransactionManager, TxResult,
};

/// Shared state standing in for a database server.
#[derive(Default)]
pub struct MemoryServer {
    committed: Mutex<HashMap<String, i64>>,
    pub opened: AtomicUsize,
    pub closed: AtomicUsize,
    pub fail_validation: AtomicBool,
    pub fail_next_commit: AtomicBool,
    pub fail_next_rollback: AtomicBool,
}

impl MemoryServer {
    pub fn seed(&self, key: &str, value: i64) {
        self.committed
            .lock()
            .unwrap()
            .insert(key.to_string(), value);
    }

    /// Committed value as a fresh session would observe it.
    pub fn committed_value(&self, key: &str) -> Option<i64> {
        self.committed.lock().unwrap().get(key).copied()
    }
}

pub struct MemorySession {
    server: Arc<MemoryServer>,
    overlay: HashMap<String, i64>,
    auto_commit: bool,
    isolation: IsolationLevel,
}

impl MemorySession {
    fn put(&mut self, key: &str, value: i64) {
        if self.auto_commit {
            self.server
                .committed
                .lock()
                .unwrap()
                .insert(key.to_string(), value);
        } else {
            self.overlay.insert(key.to_string(), value);
        }
    }

    fn get(&self, key: &str) -> Option<i64> {
        self.overlay
            .get(key)
            .copied()
            .or_else(|| self.server.committed.lock().unwrap().get(key).copied())
    }
}

#[async_trait]
impl DriverSession for MemorySession {
    async fn set_auto_commit(&mut self, enabled: bool) -> Result<(), DriverError> {
        if enabled {
            self.overlay.clear();
        }
        self.auto_commit = enabled;
        Ok(())
    }

    async fn set_isolation(&mut self, level: IsolationLevel) -> Result<(), DriverError> {
        self.isolation = level;
        Ok(())
    }

    async fn commit(&mut self) -> Result<(), DriverError> {
        if self.server.fail_next_commit.swap(false, Ordering::SeqCst) {
            return Err(DriverError::uncoded("simulated commit failure"));
        }
        let mut committed = self.server.committed.lock().unwrap();
        for (key, value) in self.overlay.drain() {
            committed.insert(key, value);
        }
        Ok(())
    }

    async fn rollback(&mut self) -> Result<(), DriverError> {
        self.overlay.clear();
        if self.server.fail_next_rollback.swap(false, Ordering::SeqCst) {
            return Err(DriverError::uncoded("simulated rollback failure"));
        }
        Ok(())
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

pub struct MemoryDriver {
    pub server: Arc<MemoryServer>,
}

#[async_trait]
impl PoolDriver for MemoryDriver {
    async fn open(&self) -> Result<Box<dyn DriverSession>, DriverError> {
        self.server.opened.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(MemorySession {
            server: Arc::clone(&self.server),
            overlay: HashMap::new(),
            auto_commit: true,
            isolation: IsolationLevel::default(),
        }))
    }

    async fn close(&self, _session: Box<dyn DriverSession>) {
        self.server.closed.fetch_add(1, Ordering::SeqCst);
    }

    async fn validate(&self, _session: &mut dyn DriverSession) -> bool {
        !self.server.fail_validation.load(Ordering::SeqCst)
    }
}

pub struct MemoryExecutor;

#[async_trait]
impl StatementExecutor for MemoryExecutor {
    async fn execute(
        &self,
        session: &mut dyn DriverSession,
        statement: &str,
        params: &[Value],
    ) -> Result<Vec<Row>, DriverError> {
        let session = session
            .as_any_mut()
            .downcast_mut::<MemorySession>()
            .ok_or_else(|| DriverError::uncoded("session is not a memory session"))?;

        let tokens: Vec<&str> = statement.split_whitespace().collect();
        match tokens.as_slice() {
            ["put", key] => {
                let value = params
                    .first()
                    .and_then(Value::as_i64)
                    .ok_or_else(|| DriverError::uncoded("put requires an integer parameter"))?;
                session.put(key, value);
                Ok(vec![])
            }
            ["put", key, value] => {
                let value: i64 = value
                    .parse()
                    .map_err(|_| DriverError::uncoded("put value must be an integer"))?;
                session.put(key, value);
                Ok(vec![])
            }
            ["get", key] => Ok(session
                .get(key)
                .map(|value| {
                    let mut row = Row::new();
                    row.insert("key".to_string(), json!(key));
                    row.insert("value".to_string(), json!(value));
                    vec![row]
                })
                .unwrap_or_default()),
            ["raise", code, rest @ ..] => Err(DriverError::new(*code, rest.join(" "))),
            _ => Err(DriverError::uncoded(format!(
                "unrecognized statement: {statement}"
            ))),
        }
    }
}

/// Fully wired manager stack over the in-memory driver.
pub struct Harness {
    pub server: Arc<MemoryServer>,
    pub pool: ConnectionPool,
    pub binder: Arc<ContextBinder>,
    pub manager: TransactionManager,
    pub accessor: ResourceAccessor,
}

pub fn harness(config: PoolConfig) -> Harness {
    init_tracing();
    let server = Arc::new(MemoryServer::default());
    let driver = Arc::new(MemoryDriver {
        server: Arc::clone(&server),
    });
    let pool = ConnectionPool::new(driver, config).expect("pool configuration");
    let binder = Arc::new(ContextBinder::new());
    let translator = Arc::new(ErrorTranslator::new(DialectConfig::h2()));
    let manager = TransactionManager::new(
        pool.clone(),
        Arc::clone(&binder),
        Arc::clone(&translator),
    );
    let accessor = ResourceAccessor::new(
        pool.clone(),
        Arc::clone(&binder),
        Arc::clone(&translator),
    );
    Harness {
        server,
        pool,
        binder,
        manager,
        accessor,
    }
}

/// Write a cell through the accessor on the context's current connection.
pub async fn put(h: &Harness, ctx: ExecutionContext, key: &str, value: i64) -> TxResult<()> {
    h.accessor
        .execute(
            &MemoryExecutor,
            ctx,
            "update balance",
            &format!("put {key}"),
            &[json!(value)],
        )
        .await
        .map(|_| ())
}

/// Read a cell through the accessor on the context's current connection.
pub async fn get(h: &Harness, ctx: ExecutionContext, key: &str) -> TxResult<Option<i64>> {
    let rows = h
        .accessor
        .execute(
            &MemoryExecutor,
            ctx,
            "read balance",
            &format!("get {key}"),
            &[],
        )
        .await?;
    Ok(rows
        .first()
        .and_then(|row| row.get("value"))
        .and_then(Value::as_i64))
}

fn init_tracing() {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    });
}
