//! Execution context identifiers.
//!
//! The manager never relies on ambient state (thread locals) to find "the
//! current transaction". Callers mint an [`ExecutionContext`] per unit of
//! control (thread, task, request flow) and pass it explicitly; the subsystem
//! only ever uses it as a lookup key.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

static NEXT_CONTEXT: AtomicU64 = AtomicU64::new(1);

/// Opaque identifier for one unit of control.
///
/// Must stay stable for the duration of a unit of work and must not be used
/// concurrently by two units of work. Cheap to copy and hash; carries no
/// resources.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ExecutionContext(u64);

impl ExecutionContext {
    /// Mint a fresh, process-unique context.
    pub fn next() -> Self {
        Self(NEXT_CONTEXT.fetch_add(1, Ordering::Relaxed))
    }

    /// Wrap an identifier owned by the caller's runtime (a task id, a
    /// request id hash). The caller is responsible for uniqueness.
    pub fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    pub fn as_raw(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for ExecutionContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ctx-{}", self.0)
    }
}
