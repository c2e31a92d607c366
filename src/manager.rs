//! Transaction lifecycle management.
//!
//! `begin` leases a connection, switches it to manual commit, and binds the
//! resulting descriptor to the caller's execution context; `commit` and
//! `rollback` end the unit of work, give the connection back to the pool on
//! every path, and restore any suspended outer transaction. The
//! [`TransactionManager::with_transaction`] wrapper packages the whole
//! discipline around a closure so callers cannot forget the cleanup half.

use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::binder::ContextBinder;
use crate::context::ExecutionContext;
use crate::driver::IsolationLevel;
use crate::error::{DriverError, TxError, TxResult};
use crate::pool::{ConnectionLease, ConnectionPool};
use crate::translator::ErrorTranslator;

/// Whether a nested `begin` joins the caller's transaction or starts an
/// independent one by suspending it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Propagation {
    #[default]
    Required,
    RequiresNew,
}

/// Lifecycle state of a unit of work. `Active` is the only non-terminal
/// state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TxStatus {
    Active,
    Committed,
    RolledBack,
}

impl std::fmt::Display for TxStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Active => "active",
            Self::Committed => "committed",
            Self::RolledBack => "rolled_back",
        };
        f.write_str(name)
    }
}

const STATUS_ACTIVE: u8 = 0;
const STATUS_COMMITTED: u8 = 1;
const STATUS_ROLLED_BACK: u8 = 2;

fn status_from_word(word: u8) -> TxStatus {
    match word {
        STATUS_COMMITTED => TxStatus::Committed,
        STATUS_ROLLED_BACK => TxStatus::RolledBack,
        _ => TxStatus::Active,
    }
}

/// How a transaction should be begun.
#[derive(Debug, Clone, Copy, Default)]
pub struct TransactionDefinition {
    pub propagation: Propagation,
    pub isolation: IsolationLevel,
}

impl TransactionDefinition {
    pub fn required() -> Self {
        Self::default()
    }

    pub fn requires_new() -> Self {
        Self {
            propagation: Propagation::RequiresNew,
            ..Self::default()
        }
    }

    pub fn with_isolation(mut self, isolation: IsolationLevel) -> Self {
        self.isolation = isolation;
        self
    }
}

/// One unit of work: status, the bound lease, and the suspended outer
/// transaction when this one was started with `RequiresNew`.
///
/// Mutated only by the [`TransactionManager`]; everyone else reads.
pub struct TxDescriptor {
    id: String,
    context: ExecutionContext,
    isolation: IsolationLevel,
    propagation: Propagation,
    depth: u32,
    started_at: DateTime<Utc>,
    status: AtomicU8,
    lease: Mutex<Option<ConnectionLease>>,
    parked: Mutex<Option<Arc<TxDescriptor>>>,
}

impl TxDescriptor {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn context(&self) -> ExecutionContext {
        self.context
    }

    pub fn isolation(&self) -> IsolationLevel {
        self.isolation
    }

    pub fn propagation(&self) -> Propagation {
        self.propagation
    }

    /// Suspension nesting depth: 0 for an outermost transaction, parked
    /// depth + 1 for each `RequiresNew` level.
    pub fn depth(&self) -> u32 {
        self.depth
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    pub fn status(&self) -> TxStatus {
        status_from_word(self.status.load(Ordering::Acquire))
    }

    fn set_status(&self, status: TxStatus) {
        let word = match status {
            TxStatus::Active => STATUS_ACTIVE,
            TxStatus::Committed => STATUS_COMMITTED,
            TxStatus::RolledBack => STATUS_ROLLED_BACK,
        };
        self.status.store(word, Ordering::Release);
    }

    pub(crate) fn lease_slot(&self) -> &Mutex<Option<ConnectionLease>> {
        &self.lease
    }

    pub(crate) async fn take_lease(&self) -> Option<ConnectionLease> {
        self.lease.lock().await.take()
    }

    async fn take_parked(&self) -> Option<Arc<TxDescriptor>> {
        self.parked.lock().await.take()
    }

    /// Bare descriptor for registry tests; carries no lease.
    #[cfg(test)]
    pub(crate) fn detached(context: ExecutionContext) -> Arc<Self> {
        Arc::new(Self {
            id: format!("tx_{}", Uuid::new_v4().simple()),
            context,
            isolation: IsolationLevel::default(),
            propagation: Propagation::Required,
            depth: 0,
            started_at: Utc::now(),
            status: AtomicU8::new(STATUS_ACTIVE),
            lease: Mutex::new(None),
            parked: Mutex::new(None),
        })
    }
}

impl std::fmt::Debug for TxDescriptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TxDescriptor")
            .field("id", &self.id)
            .field("context", &self.context)
            .field("status", &self.status())
            .field("depth", &self.depth)
            .finish_non_exhaustive()
    }
}

/// Begins, commits and rolls back units of work.
#[derive(Clone)]
pub struct TransactionManager {
    pool: ConnectionPool,
    binder: Arc<ContextBinder>,
    translator: Arc<ErrorTranslator>,
}

impl TransactionManager {
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

    /// Begin (or join) a unit of work for `ctx`.
    ///
    /// `Required` joins an existing active transaction; `RequiresNew` parks
    /// it and starts an independent one, resumed when the new transaction
    /// ends. On `PoolExhausted` no descriptor is created and nothing is
    /// bound.
    pub async fn begin(
        &self,
        ctx: ExecutionContext,
        definition: TransactionDefinition,
    ) -> TxResult<Arc<TxDescriptor>> {
        match definition.propagation {
            Propagation::Required => {
                if let Some(existing) = self.binder.lookup(ctx) {
                    return if existing.status() == TxStatus::Active {
                        debug!(
                            context = %ctx,
                            transaction_id = %existing.id(),
                            "joining active transaction"
                        );
                        Ok(existing)
                    } else {
                        // A bound but finished descriptor means cleanup never
                        // ran; refuse rather than silently replace it.
                        Err(TxError::AlreadyBound {
                            context: ctx.to_string(),
                        })
                    };
                }
                self.begin_fresh(ctx, definition, None).await
            }
            Propagation::RequiresNew => {
                let parked = self.binder.suspend(ctx);
                match self.begin_fresh(ctx, definition, parked.clone()).await {
                    Ok(descriptor) => Ok(descriptor),
                    Err(e) => {
                        if let Some(parked) = parked {
                            // The slot is free: begin_fresh never bound.
                            let _ = self.binder.resume(ctx, parked);
                        }
                        Err(e)
                    }
                }
            }
        }
    }

    async fn begin_fresh(
        &self,
        ctx: ExecutionContext,
        definition: TransactionDefinition,
        parked: Option<Arc<TxDescriptor>>,
    ) -> TxResult<Arc<TxDescriptor>> {
        let mut lease = self.pool.acquire().await?;

        if let Err(e) = Self::configure_session(&mut lease, definition.isolation).await {
            self.pool.release(lease).await;
            return Err(TxError::ConnectionInvalid {
                message: format!("failed to prepare connection for transaction: {e}"),
                cause: Some(e),
            });
        }

        let depth = parked.as_ref().map(|p| p.depth() + 1).unwrap_or(0);
        let descriptor = Arc::new(TxDescriptor {
            id: format!("tx_{}", Uuid::new_v4().simple()),
            context: ctx,
            isolation: definition.isolation,
            propagation: definition.propagation,
            depth,
            started_at: Utc::now(),
            status: AtomicU8::new(STATUS_ACTIVE),
            lease: Mutex::new(Some(lease)),
            parked: Mutex::new(parked),
        });

        if let Err(e) = self.binder.bind(ctx, Arc::clone(&descriptor)) {
            if let Some(lease) = descriptor.take_lease().await {
                self.pool.release(lease).await;
            }
            return Err(e);
        }

        info!(
            transaction_id = %descriptor.id,
            context = %ctx,
            isolation = %definition.isolation,
            depth,
            "transaction started"
        );
        Ok(descriptor)
    }

    async fn configure_session(
        lease: &mut ConnectionLease,
        isolation: IsolationLevel,
    ) -> Result<(), DriverError> {
        lease.session_mut().set_auto_commit(false).await?;
        lease.session_mut().set_isolation(isolation).await?;
        Ok(())
    }

    /// Commit the unit of work.
    ///
    /// The lease goes back to the pool whether the driver commit succeeds or
    /// not. A failed commit leaves the status `Active` so the recommended
    /// explicit `rollback` can perform the terminal transition; rollback is
    /// never attempted automatically here.
    pub async fn commit(&self, descriptor: &Arc<TxDescriptor>) -> TxResult<()> {
        let status = descriptor.status();
        if status != TxStatus::Active {
            return Err(TxError::TransactionClosed {
                transaction_id: descriptor.id().to_string(),
                status: status.to_string(),
            });
        }

        let Some(mut lease) = descriptor.take_lease().await else {
            // A previous commit attempt failed and already cleaned up; only
            // an explicit rollback can finish this descriptor.
            return Err(TxError::TransactionClosed {
                transaction_id: descriptor.id().to_string(),
                status: "awaiting rollback".to_string(),
            });
        };

        match lease.session_mut().commit().await {
            Ok(()) => {
                descriptor.set_status(TxStatus::Committed);
                self.pool.release(lease).await;
                self.finish(descriptor).await;
                info!(
                    transaction_id = %descriptor.id(),
                    context = %descriptor.context(),
                    "transaction committed"
                );
                Ok(())
            }
            Err(raw) => {
                warn!(
                    transaction_id = %descriptor.id(),
                    error = %raw,
                    "commit failed; connection released"
                );
                self.pool.release(lease).await;
                self.finish(descriptor).await;
                Err(self.translator.translate("commit transaction", "commit", raw))
            }
        }
    }

    /// Roll back the unit of work.
    ///
    /// Safe to call twice (the second call is a no-op) and safe to call
    /// after a failed commit (the status transition is all that remains). A
    /// driver failure during rollback itself is logged, surfaced as
    /// `Unknown`, and still releases the lease.
    pub async fn rollback(&self, descriptor: &Arc<TxDescriptor>) -> TxResult<()> {
        match descriptor.status() {
            TxStatus::RolledBack => {
                debug!(
                    transaction_id = %descriptor.id(),
                    "rollback of an already rolled-back transaction; no-op"
                );
                return Ok(());
            }
            TxStatus::Committed => {
                return Err(TxError::TransactionClosed {
                    transaction_id: descriptor.id().to_string(),
                    status: TxStatus::Committed.to_string(),
                });
            }
            TxStatus::Active => {}
        }

        descriptor.set_status(TxStatus::RolledBack);

        let Some(mut lease) = descriptor.take_lease().await else {
            // Cleanup after a failed commit already returned the connection.
            self.finish(descriptor).await;
            return Ok(());
        };

        let result = lease.session_mut().rollback().await;
        self.pool.release(lease).await;
        self.finish(descriptor).await;

        match result {
            Ok(()) => {
                info!(
                    transaction_id = %descriptor.id(),
                    context = %descriptor.context(),
                    "transaction rolled back"
                );
                Ok(())
            }
            Err(raw) => {
                warn!(
                    transaction_id = %descriptor.id(),
                    error = %raw,
                    "rollback failed; connection released"
                );
                Err(TxError::Unknown {
                    message: format!("rollback of transaction {} failed: {raw}", descriptor.id()),
                    cause: Some(raw),
                })
            }
        }
    }

    /// Unbind the context and restore any suspended outer transaction.
    async fn finish(&self, descriptor: &Arc<TxDescriptor>) {
        let ctx = descriptor.context();
        if let Some(bound) = self.binder.lookup(ctx) {
            if Arc::ptr_eq(&bound, descriptor) {
                self.binder.unbind(ctx);
            }
        }
        if let Some(parked) = descriptor.take_parked().await {
            if let Err(e) = self.binder.resume(ctx, parked) {
                warn!(context = %ctx, error = %e, "failed to resume suspended transaction");
            }
        }
    }

    /// Run a closure as one unit of work: begin, invoke, commit on `Ok`,
    /// roll back on `Err`.
    ///
    /// Generic over the caller's error type so any reported failure triggers
    /// rollback. If the returned future is cancelled while the closure runs,
    /// a guard rolls the transaction back from a spawned task, so the lease
    /// is never left dangling.
    pub async fn with_transaction<T, E, F, Fut>(
        &self,
        ctx: ExecutionContext,
        definition: TransactionDefinition,
        work: F,
    ) -> Result<T, E>
    where
        E: From<TxError>,
        F: FnOnce(ExecutionContext) -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let descriptor = self.begin(ctx, definition).await.map_err(E::from)?;
        let guard = RollbackGuard {
            manager: self.clone(),
            descriptor: Some(Arc::clone(&descriptor)),
        };

        let outcome = work(ctx).await;
        guard.disarm();

        match outcome {
            Ok(value) => {
                self.commit(&descriptor).await.map_err(E::from)?;
                Ok(value)
            }
            Err(err) => {
                if let Err(rollback_err) = self.rollback(&descriptor).await {
                    warn!(
                        transaction_id = %descriptor.id(),
                        error = %rollback_err,
                        "rollback after failed unit of work also failed"
                    );
                }
                Err(err)
            }
        }
    }
}

/// Rolls back an abandoned transaction when the owning future is dropped
/// mid-flight.
struct RollbackGuard {
    manager: TransactionManager,
    descriptor: Option<Arc<TxDescriptor>>,
}

impl RollbackGuard {
    fn disarm(mut self) {
        self.descriptor.take();
    }
}

impl Drop for RollbackGuard {
    fn drop(&mut self) {
        let Some(descriptor) = self.descriptor.take() else {
            return;
        };
        if descriptor.status() != TxStatus::Active {
            return;
        }
        let manager = self.manager.clone();
        tokio::spawn(async move {
            warn!(
                transaction_id = %descriptor.id(),
                "unit of work cancelled while active; rolling back"
            );
            if let Err(e) = manager.rollback(&descriptor).await {
                warn!(
                    transaction_id = %descriptor.id(),
                    error = %e,
                    "rollback during cancellation cleanup failed"
                );
            }
        });
    }
}
