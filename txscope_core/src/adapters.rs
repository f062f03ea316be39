//! Call adapters for the dependency-injection convention.
//!
//! Instead of reading the ambient scope from inside the business function
//! (the executor entry points) or threading an `Option<&Handle>` parameter
//! (the optional-parameter convention), these adapters resolve a handle
//! *before* the body runs and pass it in as an ordinary parameter. The body
//! then executes directly on the handle. All three conventions are thin
//! views over the same scope manager and are interchangeable.

use std::future::Future;

use crate::engine::Handle;
use crate::scope::{current_scope, ScopedEngine};
use crate::{DbError, DbResult};

/// Run `f` with a transaction-bound handle.
///
/// Reuses the ambient transaction when one is active; otherwise opens a new
/// atomic scope around the body (committed on `Ok`, rolled back on `Err`).
/// An ambient plain connection is not good enough: it carries no rollback
/// capability, so a fresh transaction is begun instead.
pub async fn with_transaction<R, F, Fut>(db: &ScopedEngine, f: F) -> DbResult<R>
where
    F: FnOnce(Handle) -> Fut + Send,
    Fut: Future<Output = DbResult<R>> + Send,
    R: Send,
{
    match current_scope() {
        Some((handle, _)) if handle.is_transaction() => f(handle).await,
        _ => {
            db.atomic(|| async {
                let (handle, _) = current_scope().ok_or(DbError::NoAtomicScope)?;
                f(handle).await
            })
            .await
        }
    }
}

/// Run `f` with a handle of either kind.
///
/// Reuses the ambient scope's handle when any scope is active (including an
/// atomic one, whose transaction the body then shares); otherwise opens a
/// non-atomic scope whose connection is closed when the body returns.
pub async fn with_connection<R, F, Fut>(db: &ScopedEngine, f: F) -> DbResult<R>
where
    F: FnOnce(Handle) -> Fut + Send,
    Fut: Future<Output = DbResult<R>> + Send,
    R: Send,
{
    match current_scope() {
        Some((handle, _)) => f(handle).await,
        None => {
            db.non_atomic(|| async {
                let (handle, _) = current_scope().ok_or(DbError::NoAtomicScope)?;
                f(handle).await
            })
            .await
        }
    }
}
