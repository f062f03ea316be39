//! Ambient scope management.
//!
//! A logical operation (one request, one background task) enters scopes via
//! [`ScopedEngine::atomic`] / [`ScopedEngine::non_atomic`]. The current scope
//! is carried in task-local storage so that deeply nested calls can reach it
//! without threading a handle parameter through every signature. Task-local
//! storage is per tokio task: two concurrently running operations never
//! observe each other's scope, even when multiplexed on the same worker
//! thread, and the state survives suspension points within one task.
//!
//! Scope entries are refcounted: re-entering `atomic` inside an `atomic`
//! scope does not begin a second transaction, and only the entry that
//! actually began the transaction performs the terminal commit/rollback.
//!
//! Note that a `non_atomic` scope entered while an `atomic` scope is active
//! reuses the enclosing transaction's handle instead of opening a second
//! connection (a second connection could not see the transaction's
//! uncommitted writes). "Non-atomic" therefore does not guarantee
//! non-transactional execution when nested.

use std::cell::RefCell;
use std::future::Future;
use std::sync::Arc;

use crate::engine::{Engine, Handle};
use crate::{DbError, DbResult};

/// What kind of scope a frame represents.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScopeKind {
    NonAtomic,
    Atomic,
}

struct Frame {
    handle: Handle,
    kind: ScopeKind,
    refcount: usize,
}

#[derive(Default)]
struct ScopeStack {
    frames: Vec<Frame>,
}

tokio::task_local! {
    static SCOPE: RefCell<ScopeStack>;
}

/// The handle and kind of the innermost active scope of the current logical
/// operation, or `None` when no scope is active. Querying outside any scope
/// is not an error; callers must treat `None` as "no ambient scope".
pub fn current_scope() -> Option<(Handle, ScopeKind)> {
    SCOPE
        .try_with(|cell| {
            cell.borrow()
                .frames
                .last()
                .map(|f| (f.handle.clone(), f.kind))
        })
        .ok()
        .flatten()
}

/// Increment the top frame's refcount if `reuse` accepts it; returns the
/// reused handle.
fn try_reuse(reuse: impl Fn(&Frame) -> bool) -> Option<Handle> {
    SCOPE.with(|cell| {
        let mut stack = cell.borrow_mut();
        match stack.frames.last_mut() {
            Some(frame) if reuse(frame) => {
                frame.refcount += 1;
                Some(frame.handle.clone())
            }
            _ => None,
        }
    })
}

fn push_frame(handle: Handle, kind: ScopeKind) {
    SCOPE.with(|cell| {
        cell.borrow_mut().frames.push(Frame {
            handle,
            kind,
            refcount: 1,
        })
    });
}

/// Decrement the top frame; pop it when this exit is the last one out.
/// Returns true when the frame was popped (terminal action is due).
fn pop_frame() -> bool {
    SCOPE.with(|cell| {
        let mut stack = cell.borrow_mut();
        match stack.frames.last_mut() {
            Some(frame) => {
                frame.refcount -= 1;
                if frame.refcount == 0 {
                    stack.frames.pop();
                    true
                } else {
                    false
                }
            }
            None => false,
        }
    })
}

/// Releases the scope's handle if the protected future is dropped before the
/// terminal action ran (task cancellation, caller disconnect). The release is
/// best-effort: it is spawned onto the runtime because `Drop` cannot await.
struct ReleaseGuard {
    handle: Option<Handle>,
    kind: ScopeKind,
}

impl ReleaseGuard {
    fn arm(handle: Handle, kind: ScopeKind) -> Self {
        Self {
            handle: Some(handle),
            kind,
        }
    }

    fn disarm(&mut self) {
        self.handle = None;
    }
}

impl Drop for ReleaseGuard {
    fn drop(&mut self) {
        let Some(handle) = self.handle.take() else {
            return;
        };
        let kind = self.kind;
        tracing::debug!(handle = handle.id(), ?kind, "scope dropped before exit; releasing");
        if let Ok(rt) = tokio::runtime::Handle::try_current() {
            rt.spawn(async move {
                let res = match kind {
                    ScopeKind::Atomic => handle.rollback().await,
                    ScopeKind::NonAtomic => handle.close().await,
                };
                if let Err(e) = res {
                    tracing::error!(handle = handle.id(), error = %e, "release after cancellation failed");
                }
            });
        }
    }
}

/// The scoping engine: wraps an [`Engine`] and adds ambient scope management
/// plus the query-execution entry points (see the `exec` module).
#[derive(Clone)]
pub struct ScopedEngine {
    engine: Arc<dyn Engine>,
}

impl ScopedEngine {
    pub fn new(engine: Arc<dyn Engine>) -> Self {
        Self { engine }
    }

    pub fn engine(&self) -> &Arc<dyn Engine> {
        &self.engine
    }

    /// Run `f` inside an atomic scope.
    ///
    /// If an atomic scope is already active, `f` joins it: no second
    /// transaction is begun and the terminal commit/rollback is left to the
    /// outermost entry. Otherwise a new transaction is begun (also when a
    /// non-atomic scope is active: the plain connection carries no rollback
    /// capability, so the inner scope gets a genuine transaction on a new
    /// handle). On normal return the owning entry commits; on error it rolls
    /// back and re-raises the error unchanged. A rollback failure is fatal
    /// and surfaces as [`DbError::RollbackFailed`] since the transaction's
    /// final state is unknown.
    pub async fn atomic<R, F, Fut>(&self, f: F) -> DbResult<R>
    where
        F: FnOnce() -> Fut + Send,
        Fut: Future<Output = DbResult<R>> + Send,
        R: Send,
    {
        self.in_root_scope(self.atomic_inner(f)).await
    }

    /// Run `f` inside a non-atomic scope.
    ///
    /// Reuses any active scope's handle (including an enclosing atomic
    /// transaction, see the module notes); otherwise opens a plain connection
    /// that is closed when the owning entry exits. No commit or rollback is
    /// ever attempted for a connection this scope opened itself.
    pub async fn non_atomic<R, F, Fut>(&self, f: F) -> DbResult<R>
    where
        F: FnOnce() -> Fut + Send,
        Fut: Future<Output = DbResult<R>> + Send,
        R: Send,
    {
        self.in_root_scope(self.non_atomic_inner(f)).await
    }

    /// Install the task-local scope stack if this task has none yet, then run.
    async fn in_root_scope<R>(&self, fut: impl Future<Output = DbResult<R>> + Send) -> DbResult<R>
    where
        R: Send,
    {
        if SCOPE.try_with(|_| ()).is_err() {
            SCOPE.scope(RefCell::new(ScopeStack::default()), fut).await
        } else {
            fut.await
        }
    }

    async fn atomic_inner<R, F, Fut>(&self, f: F) -> DbResult<R>
    where
        F: FnOnce() -> Fut + Send,
        Fut: Future<Output = DbResult<R>> + Send,
        R: Send,
    {
        if let Some(handle) = try_reuse(|frame| frame.kind == ScopeKind::Atomic) {
            tracing::trace!(handle = handle.id(), "joining active atomic scope");
            let result = f().await;
            pop_frame();
            return result;
        }

        let handle = self.engine.begin_transaction().await?;
        tracing::debug!(handle = handle.id(), "atomic scope began transaction");
        push_frame(handle.clone(), ScopeKind::Atomic);
        let mut guard = ReleaseGuard::arm(handle.clone(), ScopeKind::Atomic);

        let result = f().await;
        pop_frame();

        let result = match result {
            Ok(value) => match handle.commit().await {
                Ok(()) => {
                    tracing::debug!(handle = handle.id(), "atomic scope committed");
                    Ok(value)
                }
                Err(e) => Err(e),
            },
            Err(body_err) => match handle.rollback().await {
                Ok(()) => {
                    tracing::debug!(handle = handle.id(), error = %body_err, "atomic scope rolled back");
                    Err(body_err)
                }
                Err(rollback_err) => {
                    tracing::error!(
                        handle = handle.id(),
                        body_error = %body_err,
                        rollback_error = %rollback_err,
                        "rollback failed; transaction state unknown"
                    );
                    Err(DbError::RollbackFailed {
                        source: Box::new(rollback_err),
                    })
                }
            },
        };
        guard.disarm();
        result
    }

    async fn non_atomic_inner<R, F, Fut>(&self, f: F) -> DbResult<R>
    where
        F: FnOnce() -> Fut + Send,
        Fut: Future<Output = DbResult<R>> + Send,
        R: Send,
    {
        if let Some(handle) = try_reuse(|_| true) {
            tracing::trace!(handle = handle.id(), "non-atomic scope reusing active handle");
            let result = f().await;
            pop_frame();
            return result;
        }

        let handle = self.engine.open_connection().await?;
        tracing::debug!(handle = handle.id(), "non-atomic scope opened connection");
        push_frame(handle.clone(), ScopeKind::NonAtomic);
        let mut guard = ReleaseGuard::arm(handle.clone(), ScopeKind::NonAtomic);

        let result = f().await;
        pop_frame();

        let result = match (result, handle.close().await) {
            (Ok(value), Ok(())) => Ok(value),
            (Ok(_), Err(close_err)) => Err(close_err),
            // The body's error wins over any close failure.
            (Err(body_err), close_res) => {
                if let Err(close_err) = close_res {
                    tracing::warn!(handle = handle.id(), error = %close_err, "connection close failed");
                }
                Err(body_err)
            }
        };
        guard.disarm();
        result
    }
}

impl std::fmt::Debug for ScopedEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScopedEngine").finish_non_exhaustive()
    }
}
