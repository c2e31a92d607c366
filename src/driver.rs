//! The external collaborator boundary.
//!
//! The manager does not speak any wire protocol itself. It consumes a
//! [`PoolDriver`] to open, close and validate physical sessions, and a
//! [`StatementExecutor`] to run statements against a session it hands out.
//! Statement text is never inspected semantically; it is forwarded as-is and
//! only the resulting [`DriverError`] is interpreted (by the translator).

use std::any::Any;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::DriverError;

/// The degree to which concurrent transactions are shielded from each other.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IsolationLevel {
    ReadUncommitted,
    #[default]
    ReadCommitted,
    RepeatableRead,
    Serializable,
}

impl std::fmt::Display for IsolationLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::ReadUncommitted => "read_uncommitted",
            Self::ReadCommitted => "read_committed",
            Self::RepeatableRead => "repeatable_read",
            Self::Serializable => "serializable",
        };
        f.write_str(name)
    }
}

/// One result row, as loosely typed column/value pairs.
pub type Row = serde_json::Map<String, serde_json::Value>;

/// A live, stateful session against the database.
///
/// Implementations wrap whatever the native driver hands out (a socket plus
/// an authenticated session). Only the transaction-control surface lives
/// here; statement execution goes through [`StatementExecutor`], which may
/// downcast via [`DriverSession::as_any_mut`] to reach its native type.
#[async_trait]
pub trait DriverSession: Send {
    /// Toggle the session's auto-commit flag.
    async fn set_auto_commit(&mut self, enabled: bool) -> Result<(), DriverError>;

    /// Change the session's isolation level.
    async fn set_isolation(&mut self, level: IsolationLevel) -> Result<(), DriverError>;

    /// Commit the in-flight unit of work.
    async fn commit(&mut self) -> Result<(), DriverError>;

    /// Roll back the in-flight unit of work.
    async fn rollback(&mut self) -> Result<(), DriverError>;

    /// Downcast hook so a statement executor can reach the concrete session
    /// type behind the trait object.
    fn as_any_mut(&mut self) -> &mut dyn Any;
}

/// Opens, validates and closes physical sessions.
///
/// Opening and closing are the only points where connection-setup network
/// I/O happens; the pool calls them outside its internal locks.
#[async_trait]
pub trait PoolDriver: Send + Sync {
    /// Open a new physical session.
    async fn open(&self) -> Result<Box<dyn DriverSession>, DriverError>;

    /// Close a physical session. Called by the pool only; lease holders
    /// never close connections directly.
    async fn close(&self, session: Box<dyn DriverSession>);

    /// Lightweight liveness check.
    async fn validate(&self, session: &mut dyn DriverSession) -> bool;
}

/// Runs a statement against a bound session.
///
/// The returned error is the raw driver error; translation into the semantic
/// taxonomy is the caller's job (the accessor does it for every statement it
/// forwards).
#[async_trait]
pub trait StatementExecutor: Send + Sync {
    async fn execute(
        &self,
        session: &mut dyn DriverSession,
        statement: &str,
        params: &[serde_json::Value],
    ) -> Result<Vec<Row>, DriverError>;
}
