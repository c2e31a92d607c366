//! "Current connection" façade for data-access code.
//!
//! Repository-style code asks the accessor for a connection instead of the
//! pool. Inside a unit of work it always gets the transaction's bound
//! connection; outside one it gets a scratch lease that is returned as soon
//! as the operation finishes. The same data-access code therefore runs
//! correctly both inside and outside an explicit transaction.

use std::sync::Arc;

use tracing::debug;

use crate::binder::ContextBinder;
use crate::context::ExecutionContext;
use crate::driver::{Row, StatementExecutor};
use crate::error::{TxError, TxResult};
use crate::manager::{TxDescriptor, TxStatus};
use crate::pool::{ConnectionLease, ConnectionPool};
use crate::translator::ErrorTranslator;

/// A usable connection: either the one bound to the caller's transaction or
/// a scratch lease for a single autonomous operation.
pub enum ConnectionHandle {
    /// Bound to an active transaction. The holder must not commit, roll
    /// back or release it; the transaction manager owns that lifecycle.
    Transactional(Arc<TxDescriptor>),
    /// Independent lease for one operation, returned via
    /// [`ResourceAccessor::release`].
    Scratch(ConnectionLease),
}

impl ConnectionHandle {
    pub fn is_transactional(&self) -> bool {
        matches!(self, Self::Transactional(_))
    }
}

/// Hands out the right connection for an execution context.
#[derive(Clone)]
pub struct ResourceAccessor {
    pool: ConnectionPool,
    binder: Arc<ContextBinder>,
    translator: Arc<ErrorTranslator>,
}

impl ResourceAccessor {
    pub fn new(
        pool: ConnectionPool,
        binder: Arc<ContextBinder>,
        translator: Arc<ErrorTranslator>,
    ) -> Self {
        Self {
            pool,
            binder,
            translator,
        }
    }

    /// The connection the context should use right now: the transaction's
    /// bound connection when one is active, a fresh scratch lease otherwise.
    pub async fn acquire(&self, ctx: ExecutionContext) -> TxResult<ConnectionHandle> {
        if let Some(descriptor) = self.binder.lookup(ctx) {
            return Ok(ConnectionHandle::Transactional(descriptor));
        }
        let lease = self.pool.acquire().await?;
        debug!(context = %ctx, lease_id = %lease.id(), "scratch connection leased");
        Ok(ConnectionHandle::Scratch(lease))
    }

    /// Give a handle back. Transactional handles are a no-op (commit or
    /// rollback returns their connection); scratch leases go back to the
    /// pool immediately.
    pub async fn release(&self, ctx: ExecutionContext, handle: ConnectionHandle) {
        match handle {
            ConnectionHandle::Transactional(_) => {}
            ConnectionHandle::Scratch(lease) => {
                debug!(context = %ctx, lease_id = %lease.id(), "scratch connection returned");
                self.pool.release(lease).await;
            }
        }
    }

    /// Run one statement on the context's current connection.
    ///
    /// This is the write-once data-access path: it joins the active
    /// transaction when there is one, leases and releases a scratch
    /// connection when there is not (on every path, success or failure),
    /// and passes every raw driver error through the translator before it
    /// leaves. `operation` is a short label for error messages.
    pub async fn execute(
        &self,
        executor: &dyn StatementExecutor,
        ctx: ExecutionContext,
        operation: &str,
        statement: &str,
        params: &[serde_json::Value],
    ) -> TxResult<Vec<Row>> {
        match self.acquire(ctx).await? {
            ConnectionHandle::Transactional(descriptor) => {
                let status = descriptor.status();
                if status != TxStatus::Active {
                    return Err(TxError::TransactionClosed {
                        transaction_id: descriptor.id().to_string(),
                        status: status.to_string(),
                    });
                }
                let mut slot = descriptor.lease_slot().lock().await;
                let Some(lease) = slot.as_mut() else {
                    // The lease is gone but the status is not terminal: a
                    // commit attempt failed and cleanup ran.
                    return Err(TxError::TransactionClosed {
                        transaction_id: descriptor.id().to_string(),
                        status: "awaiting rollback".to_string(),
                    });
                };
                debug!(
                    context = %ctx,
                    transaction_id = %descriptor.id(),
                    statement,
                    "executing on transactional connection"
                );
                executor
                    .execute(lease.session_mut(), statement, params)
                    .await
                    .map_err(|raw| self.translator.translate(operation, statement, raw))
            }
            ConnectionHandle::Scratch(mut lease) => {
                debug!(context = %ctx, lease_id = %lease.id(), statement, "executing on scratch connection");
                let result = executor
                    .execute(lease.session_mut(), statement, params)
                    .await;
                self.pool.release(lease).await;
                result.map_err(|raw| self.translator.translate(operation, statement, raw))
            }
        }
    }
}
