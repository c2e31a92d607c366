//! Context-to-transaction binding registry.
//!
//! Associates an [`ExecutionContext`] with at most one active transaction
//! descriptor. This is the explicit, injectable replacement for thread-local
//! transaction synchronization: the key is passed through call signatures,
//! so the same registry works under preemptive threads and cooperative
//! tasks alike. Storage is sharded per key; independent contexts never
//! contend on a global lock and never observe each other's bindings.

use std::sync::Arc;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use tracing::debug;

use crate::context::ExecutionContext;
use crate::error::{TxError, TxResult};
use crate::manager::TxDescriptor;

/// Registry of active bindings, keyed per execution context.
#[derive(Default)]
pub struct ContextBinder {
    bindings: DashMap<ExecutionContext, Arc<TxDescriptor>>,
}

impl ContextBinder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record that `ctx` owns `descriptor`. Fails with `AlreadyBound` if the
    /// context already has an active, non-suspended binding.
    pub fn bind(&self, ctx: ExecutionContext, descriptor: Arc<TxDescriptor>) -> TxResult<()> {
        match self.bindings.entry(ctx) {
            Entry::Occupied(_) => Err(TxError::AlreadyBound {
                context: ctx.to_string(),
            }),
            Entry::Vacant(slot) => {
                debug!(context = %ctx, transaction_id = %descriptor.id(), "context bound");
                slot.insert(descriptor);
                Ok(())
            }
        }
    }

    /// The descriptor currently bound to `ctx`, if any. Pure read.
    pub fn lookup(&self, ctx: ExecutionContext) -> Option<Arc<TxDescriptor>> {
        self.bindings.get(&ctx).map(|entry| Arc::clone(&entry))
    }

    /// Remove the binding for `ctx`. A no-op when already unbound; cleanup
    /// paths may legitimately run twice under error handling.
    pub fn unbind(&self, ctx: ExecutionContext) {
        if self.bindings.remove(&ctx).is_some() {
            debug!(context = %ctx, "context unbound");
        }
    }

    /// Park the current binding and return it, leaving the context free for
    /// an independent transaction. The caller is responsible for resuming.
    pub fn suspend(&self, ctx: ExecutionContext) -> Option<Arc<TxDescriptor>> {
        let parked = self.bindings.remove(&ctx).map(|(_, descriptor)| descriptor);
        if let Some(descriptor) = &parked {
            debug!(context = %ctx, transaction_id = %descriptor.id(), "binding suspended");
        }
        parked
    }

    /// Restore a previously suspended binding.
    pub fn resume(&self, ctx: ExecutionContext, descriptor: Arc<TxDescriptor>) -> TxResult<()> {
        match self.bindings.entry(ctx) {
            Entry::Occupied(_) => Err(TxError::AlreadyBound {
                context: ctx.to_string(),
            }),
            Entry::Vacant(slot) => {
                debug!(context = %ctx, transaction_id = %descriptor.id(), "binding resumed");
                slot.insert(descriptor);
                Ok(())
            }
        }
    }

    /// Number of contexts with an active binding.
    pub fn bound_count(&self) -> usize {
        self.bindings.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    #[test]
    fn bind_then_lookup_returns_same_descriptor() {
        let binder = ContextBinder::new();
        let ctx = ExecutionContext::next();
        let descriptor = TxDescriptor::detached(ctx);

        binder.bind(ctx, Arc::clone(&descriptor)).unwrap();
        let found = binder.lookup(ctx).expect("binding missing");
        assert_eq!(found.id(), descriptor.id());
    }

    #[test]
    fn double_bind_fails_already_bound() {
        let binder = ContextBinder::new();
        let ctx = ExecutionContext::next();

        binder.bind(ctx, TxDescriptor::detached(ctx)).unwrap();
        let err = binder.bind(ctx, TxDescriptor::detached(ctx)).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::AlreadyBound);
    }

    #[test]
    fn contexts_do_not_observe_each_other() {
        let binder = ContextBinder::new();
        let a = ExecutionContext::next();
        let b = ExecutionContext::next();

        binder.bind(a, TxDescriptor::detached(a)).unwrap();
        assert!(binder.lookup(b).is_none());
    }

    #[test]
    fn unbind_is_idempotent() {
        let binder = ContextBinder::new();
        let ctx = ExecutionContext::next();

        binder.bind(ctx, TxDescriptor::detached(ctx)).unwrap();
        binder.unbind(ctx);
        binder.unbind(ctx);
        assert!(binder.lookup(ctx).is_none());
    }

    #[test]
    fn suspend_hides_binding_until_resume() {
        let binder = ContextBinder::new();
        let ctx = ExecutionContext::next();
        let outer = TxDescriptor::detached(ctx);

        binder.bind(ctx, Arc::clone(&outer)).unwrap();
        let parked = binder.suspend(ctx).expect("nothing suspended");
        assert!(binder.lookup(ctx).is_none());

        // An independent transaction can bind while the outer one is parked.
        binder.bind(ctx, TxDescriptor::detached(ctx)).unwrap();
        binder.unbind(ctx);

        binder.resume(ctx, parked).unwrap();
        assert_eq!(binder.lookup(ctx).unwrap().id(), outer.id());
    }

    #[test]
    fn resume_into_occupied_slot_fails() {
        let binder = ContextBinder::new();
        let ctx = ExecutionContext::next();

        binder.bind(ctx, TxDescriptor::detached(ctx)).unwrap();
        let err = binder.resume(ctx, TxDescriptor::detached(ctx)).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::AlreadyBound);
    }
}
