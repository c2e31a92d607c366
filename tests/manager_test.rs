//! Commit/rollback failure handling and descriptor lifecycle edges.

mod common;

use std::sync::atomic::Ordering;

use common::{get, harness, put};
use dbtx::{ErrorKind, ExecutionContext, PoolConfig, TransactionDefinition, TxStatus};

#[tokio::test]
async fn failed_commit_releases_the_lease_and_leaves_status_active() {
    let h = harness(PoolConfig::default());
    h.server.seed("acc_a", 10_000);
    let ctx = ExecutionContext::next();

    let descriptor = h
        .manager
        .begin(ctx, TransactionDefinition::required())
        .await
        .unwrap();
    put(&h, ctx, "acc_a", 7_000).await.unwrap();

    h.server.fail_next_commit.store(true, Ordering::SeqCst);
    let err = h.manager.commit(&descriptor).await.unwrap_err();
    assert!(err.cause().is_some());

    // The connection went back to the pool and the context is free, but no
    // automatic rollback happened: the terminal transition belongs to the
    // caller.
    assert_eq!(h.pool.snapshot().await.active, 0);
    assert!(h.binder.lookup(ctx).is_none());
    assert_eq!(descriptor.status(), TxStatus::Active);

    // The recommended explicit rollback finishes the descriptor.
    h.manager.rollback(&descriptor).await.unwrap();
    assert_eq!(descriptor.status(), TxStatus::RolledBack);

    // Nothing was committed.
    let reader = ExecutionContext::next();
    assert_eq!(get(&h, reader, "acc_a").await.unwrap(), Some(10_000));
}

#[tokio::test]
async fn double_rollback_is_a_no_op() {
    let h = harness(PoolConfig::default());
    let ctx = ExecutionContext::next();

    let descriptor = h
        .manager
        .begin(ctx, TransactionDefinition::required())
        .await
        .unwrap();
    h.manager.rollback(&descriptor).await.unwrap();
    // Cleanup paths may run twice under error handling.
    h.manager.rollback(&descriptor).await.unwrap();
    assert_eq!(descriptor.status(), TxStatus::RolledBack);
}

#[tokio::test]
async fn commit_after_commit_fails_closed() {
    let h = harness(PoolConfig::default());
    let ctx = ExecutionContext::next();

    let descriptor = h
        .manager
        .begin(ctx, TransactionDefinition::required())
        .await
        .unwrap();
    h.manager.commit(&descriptor).await.unwrap();

    let err = h.manager.commit(&descriptor).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::TransactionClosed);
}

#[tokio::test]
async fn rollback_after_commit_fails_closed() {
    let h = harness(PoolConfig::default());
    let ctx = ExecutionContext::next();

    let descriptor = h
        .manager
        .begin(ctx, TransactionDefinition::required())
        .await
        .unwrap();
    h.manager.commit(&descriptor).await.unwrap();

    let err = h.manager.rollback(&descriptor).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::TransactionClosed);
}

#[tokio::test]
async fn statements_against_a_closed_transaction_fail() {
    let h = harness(PoolConfig::default());
    let ctx = ExecutionContext::next();

    let descriptor = h
        .manager
        .begin(ctx, TransactionDefinition::required())
        .await
        .unwrap();

    h.server.fail_next_commit.store(true, Ordering::SeqCst);
    let _ = h.manager.commit(&descriptor).await.unwrap_err();

    // The descriptor has no connection left; driving it again must fail
    // rather than silently doing nothing.
    let err = h.manager.commit(&descriptor).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::TransactionClosed);
}

#[tokio::test]
async fn rollback_failure_surfaces_unknown_but_still_releases() {
    let h = harness(PoolConfig::default());
    let ctx = ExecutionContext::next();

    let descriptor = h
        .manager
        .begin(ctx, TransactionDefinition::required())
        .await
        .unwrap();
    put(&h, ctx, "acc_a", 1).await.unwrap();

    h.server.fail_next_rollback.store(true, Ordering::SeqCst);
    let err = h.manager.rollback(&descriptor).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Unknown);
    assert!(err.cause().is_some());

    // Lease released, context unbound, status terminal.
    assert_eq!(h.pool.snapshot().await.active, 0);
    assert!(h.binder.lookup(ctx).is_none());
    assert_eq!(descriptor.status(), TxStatus::RolledBack);
}
