//! Fail-open utilities for graceful degradation
//!
//! Hook handlers, handoff collectors and best-effort cleanup are contributors
//! to a build, not the build itself. These helpers run such a contributor,
//! log its failure and turn it into "produced nothing".
//!
//! DO NOT use fail-open for:
//! - Gate evaluation (correctness)
//! - Approval decisions (a cancelled wait must reach the caller)

use futures::FutureExt;
use std::future::Future;
use std::panic::{catch_unwind, AssertUnwindSafe};
use tracing::warn;

use crate::Result;

/// Execute an async operation that should fail open
///
/// Logs the error (or panic) via `tracing::warn!` and returns `None`.
///
/// ```no_run
/// use nova_core::fail_open::fail_open;
/// use nova_core::Result;
///
/// async fn record_outcome() -> Result<()> {
///     Ok(())
/// }
///
/// async fn example() {
///     let result = fail_open("memory", || record_outcome()).await;
///     // result is None if record_outcome() failed, otherwise Some(())
/// }
/// ```
pub async fn fail_open<F, Fut, T>(operation_name: &str, f: F) -> Option<T>
where
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    match AssertUnwindSafe(f()).catch_unwind().await {
        Ok(Ok(val)) => Some(val),
        Ok(Err(e)) => {
            warn!("{} failed (fail-open): {}", operation_name, e);
            None
        }
        Err(panic) => {
            warn!(
                "{} panicked (fail-open): {}",
                operation_name,
                panic_message(panic.as_ref())
            );
            None
        }
    }
}

/// Synchronous counterpart of [`fail_open`]
pub fn fail_open_sync<F, T>(operation_name: &str, f: F) -> Option<T>
where
    F: FnOnce() -> Result<T>,
{
    match catch_unwind(AssertUnwindSafe(f)) {
        Ok(Ok(val)) => Some(val),
        Ok(Err(e)) => {
            warn!("{} failed (fail-open): {}", operation_name, e);
            None
        }
        Err(panic) => {
            warn!(
                "{} panicked (fail-open): {}",
                operation_name,
                panic_message(panic.as_ref())
            );
            None
        }
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
