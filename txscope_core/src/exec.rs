//! Query-execution entry points.
//!
//! Five resolution policies for running a single query, differing only in
//! whether an explicit handle is accepted and in what happens when no
//! compatible handle is available. An explicitly supplied handle always wins
//! over the ambient scope, which lets a caller-managed transaction be honored
//! even while an unrelated ambient scope is active.

use crate::engine::{Handle, Query, Rows};
use crate::scope::{current_scope, ScopedEngine};
use crate::{DbError, DbResult};

impl ScopedEngine {
    /// Execute against the ambient atomic scope's transaction. Fails with
    /// [`DbError::NoAtomicScope`] (and performs no database work) when no
    /// atomic scope is active; use this to enforce that a multi-step
    /// operation runs on the one transaction its caller opened.
    pub async fn require_atomic(&self, query: Query) -> DbResult<Rows> {
        match current_scope() {
            Some((handle, _)) if handle.is_transaction() => handle.execute(&query).await,
            _ => Err(DbError::NoAtomicScope),
        }
    }

    /// Execute against the ambient transaction when one is active, otherwise
    /// inside a one-shot transaction wrapped around this single query.
    ///
    /// When the ambient scope is non-atomic the one-shot transaction is begun
    /// on a new handle; the plain connection is left alone.
    pub async fn auto_atomic(&self, query: Query) -> DbResult<Rows> {
        match current_scope() {
            Some((handle, _)) if handle.is_transaction() => handle.execute(&query).await,
            _ => self.one_shot_atomic(query).await,
        }
    }

    /// Execute against the ambient scope's handle when any scope is active
    /// (including an atomic one, whose transaction is then reused), otherwise
    /// on a one-shot plain connection opened and closed around this query.
    pub async fn auto_connection(&self, query: Query) -> DbResult<Rows> {
        match current_scope() {
            Some((handle, _)) => handle.execute(&query).await,
            None => self.one_shot_connection(query).await,
        }
    }

    /// Optional-parameter entry point, non-transactional flavor: an explicit
    /// handle (of either kind) wins, then the ambient scope, then a one-shot
    /// plain connection. Never fails solely for a missing handle.
    pub async fn execute(&self, handle: Option<&Handle>, query: Query) -> DbResult<Rows> {
        if let Some(h) = handle {
            return h.execute(&query).await;
        }
        self.auto_connection(query).await
    }

    /// Optional-parameter entry point, transactional flavor: an explicit
    /// handle wins but must be transaction-bound, then an ambient
    /// transaction, then a one-shot transaction.
    pub async fn execute_tx(&self, handle: Option<&Handle>, query: Query) -> DbResult<Rows> {
        if let Some(h) = handle {
            if !h.is_transaction() {
                return Err(DbError::NonTransactionalHandle);
            }
            return h.execute(&query).await;
        }
        self.auto_atomic(query).await
    }

    async fn one_shot_atomic(&self, query: Query) -> DbResult<Rows> {
        let handle = self.engine().begin_transaction().await?;
        tracing::debug!(handle = handle.id(), "one-shot transaction");
        match handle.execute(&query).await {
            Ok(rows) => {
                handle.commit().await?;
                Ok(rows)
            }
            Err(exec_err) => match handle.rollback().await {
                Ok(()) => Err(exec_err),
                Err(rollback_err) => {
                    tracing::error!(
                        handle = handle.id(),
                        exec_error = %exec_err,
                        rollback_error = %rollback_err,
                        "one-shot rollback failed; transaction state unknown"
                    );
                    Err(DbError::RollbackFailed {
                        source: Box::new(rollback_err),
                    })
                }
            },
        }
    }

    async fn one_shot_connection(&self, query: Query) -> DbResult<Rows> {
        let handle = self.engine().open_connection().await?;
        tracing::debug!(handle = handle.id(), "one-shot connection");
        let result = handle.execute(&query).await;
        match (result, handle.close().await) {
            (Ok(rows), Ok(())) => Ok(rows),
            (Ok(_), Err(close_err)) => Err(close_err),
            (Err(exec_err), close_res) => {
                if let Err(close_err) = close_res {
                    tracing::warn!(handle = handle.id(), error = %close_err, "connection close failed");
                }
                Err(exec_err)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::{Engine, RawHandle, Value};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};

    /// Records every statement together with the id of the handle it ran on,
    /// so tests can assert which handle a query was resolved to.
    #[derive(Default)]
    struct Log {
        statements: Mutex<Vec<(u64, String)>>,
        begins: AtomicUsize,
        commits: AtomicUsize,
        rollbacks: AtomicUsize,
        opens: AtomicUsize,
        closes: AtomicUsize,
    }

    struct LogHandle {
        log: Arc<Log>,
        id_slot: Arc<std::sync::OnceLock<u64>>,
        fail_execute: bool,
    }

    #[async_trait::async_trait]
    impl RawHandle for LogHandle {
        async fn execute(&self, query: &Query) -> DbResult<Rows> {
            if self.fail_execute {
                return Err(DbError::engine(std::io::Error::new(
                    std::io::ErrorKind::Other,
                    "execute failed",
                )));
            }
            let id = self.id_slot.get().copied().unwrap_or(0);
            self.log
                .statements
                .lock()
                .unwrap()
                .push((id, query.sql().to_string()));
            Ok(Rows::new(
                vec!["v".to_string()],
                vec![vec![Value::Integer(1)]],
            ))
        }
        async fn commit(&self) -> DbResult<()> {
            self.log.commits.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
        async fn rollback(&self) -> DbResult<()> {
            self.log.rollbacks.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
        async fn close(&self) -> DbResult<()> {
            self.log.closes.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    struct LogEngine {
        log: Arc<Log>,
        fail_execute: bool,
    }

    impl LogEngine {
        fn handle(&self, transactional: bool) -> Handle {
            let id_slot = Arc::new(std::sync::OnceLock::new());
            let raw = Arc::new(LogHandle {
                log: self.log.clone(),
                id_slot: id_slot.clone(),
                fail_execute: self.fail_execute,
            });
            let handle = if transactional {
                Handle::transaction(raw)
            } else {
                Handle::connection(raw)
            };
            let _ = id_slot.set(handle.id());
            handle
        }
    }

    #[async_trait::async_trait]
    impl Engine for LogEngine {
        async fn begin_transaction(&self) -> DbResult<Handle> {
            self.log.begins.fetch_add(1, Ordering::SeqCst);
            Ok(self.handle(true))
        }
        async fn open_connection(&self) -> DbResult<Handle> {
            self.log.opens.fetch_add(1, Ordering::SeqCst);
            Ok(self.handle(false))
        }
    }

    fn log_db() -> (ScopedEngine, Arc<Log>) {
        let log = Arc::new(Log::default());
        let db = ScopedEngine::new(Arc::new(LogEngine {
            log: log.clone(),
            fail_execute: false,
        }));
        (db, log)
    }

    fn q(sql: &str) -> Query {
        Query::new(sql)
    }

    #[tokio::test]
    async fn require_atomic_fails_fast_outside_atomic_scope() {
        let (db, log) = log_db();
        let err = db.require_atomic(q("INSERT 1")).await.unwrap_err();
        assert!(matches!(err, DbError::NoAtomicScope));
        // No handle was acquired and nothing executed.
        assert!(log.statements.lock().unwrap().is_empty());
        assert_eq!(log.begins.load(Ordering::SeqCst), 0);
        assert_eq!(log.opens.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn require_atomic_fails_inside_plain_non_atomic_scope() {
        let (db, _log) = log_db();
        let err = db
            .non_atomic(|| async { db.require_atomic(q("INSERT 1")).await.map(|_| ()) })
            .await
            .unwrap_err();
        assert!(matches!(err, DbError::NoAtomicScope));
    }

    #[tokio::test]
    async fn auto_atomic_reuses_ambient_transaction() {
        let (db, log) = log_db();
        db.atomic(|| async {
            db.auto_atomic(q("INSERT a")).await?;
            db.auto_atomic(q("INSERT b")).await?;
            Ok(())
        })
        .await
        .unwrap();

        assert_eq!(log.begins.load(Ordering::SeqCst), 1);
        assert_eq!(log.commits.load(Ordering::SeqCst), 1);
        let stmts = log.statements.lock().unwrap();
        assert_eq!(stmts.len(), 2);
        assert_eq!(stmts[0].0, stmts[1].0, "both queries ran on one handle");
    }

    #[tokio::test]
    async fn auto_atomic_without_scope_is_a_one_shot_transaction() {
        let (db, log) = log_db();
        db.auto_atomic(q("INSERT a")).await.unwrap();
        assert_eq!(log.begins.load(Ordering::SeqCst), 1);
        assert_eq!(log.commits.load(Ordering::SeqCst), 1);
        assert_eq!(log.rollbacks.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn failed_one_shot_transaction_rolls_back() {
        let log = Arc::new(Log::default());
        let db = ScopedEngine::new(Arc::new(LogEngine {
            log: log.clone(),
            fail_execute: true,
        }));
        let err = db.auto_atomic(q("INSERT a")).await.unwrap_err();
        assert!(matches!(err, DbError::Engine { .. }));
        assert_eq!(log.rollbacks.load(Ordering::SeqCst), 1);
        assert_eq!(log.commits.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn auto_atomic_inside_non_atomic_scope_upgrades() {
        let (db, log) = log_db();
        db.non_atomic(|| async {
            db.auto_atomic(q("INSERT a")).await?;
            Ok(())
        })
        .await
        .unwrap();
        // The write went through its own transaction, not the plain connection.
        assert_eq!(log.opens.load(Ordering::SeqCst), 1);
        assert_eq!(log.begins.load(Ordering::SeqCst), 1);
        assert_eq!(log.commits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn auto_connection_reuses_any_ambient_scope() {
        let (db, log) = log_db();
        db.atomic(|| async {
            db.auto_atomic(q("INSERT a")).await?;
            db.auto_connection(q("SELECT a")).await?;
            Ok(())
        })
        .await
        .unwrap();
        let stmts = log.statements.lock().unwrap();
        assert_eq!(stmts.len(), 2);
        assert_eq!(
            stmts[0].0, stmts[1].0,
            "the read reused the transaction and sees its uncommitted write"
        );
        assert_eq!(log.opens.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn auto_connection_without_scope_opens_and_closes_one_shot() {
        let (db, log) = log_db();
        db.auto_connection(q("SELECT 1")).await.unwrap();
        assert_eq!(log.opens.load(Ordering::SeqCst), 1);
        assert_eq!(log.closes.load(Ordering::SeqCst), 1);
        assert_eq!(log.begins.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn explicit_handle_wins_over_ambient_scope() {
        let (db, log) = log_db();
        let explicit = db.engine().begin_transaction().await.unwrap();
        db.atomic(|| async {
            db.execute(Some(&explicit), q("SELECT 1")).await?;
            db.execute_tx(Some(&explicit), q("INSERT 1")).await?;
            Ok(())
        })
        .await
        .unwrap();
        explicit.commit().await.unwrap();

        let stmts = log.statements.lock().unwrap();
        assert_eq!(stmts.len(), 2);
        assert_eq!(stmts[0].0, explicit.id());
        assert_eq!(stmts[1].0, explicit.id());
    }

    #[tokio::test]
    async fn execute_falls_back_to_ambient_then_one_shot() {
        let (db, log) = log_db();
        // Ambient fallback.
        db.atomic(|| async {
            db.execute(None, q("SELECT ambient")).await?;
            Ok(())
        })
        .await
        .unwrap();
        // One-shot fallback.
        db.execute(None, q("SELECT one_shot")).await.unwrap();
        assert_eq!(log.opens.load(Ordering::SeqCst), 1);
        assert_eq!(log.closes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn execute_tx_rejects_plain_connection_handle() {
        let (db, log) = log_db();
        let conn = db.engine().open_connection().await.unwrap();
        let err = db
            .execute_tx(Some(&conn), q("INSERT 1"))
            .await
            .unwrap_err();
        assert!(matches!(err, DbError::NonTransactionalHandle));
        assert!(log.statements.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn execute_tx_without_handle_or_scope_is_one_shot_transactional() {
        let (db, log) = log_db();
        db.execute_tx(None, q("INSERT 1")).await.unwrap();
        assert_eq!(log.begins.load(Ordering::SeqCst), 1);
        assert_eq!(log.commits.load(Ordering::SeqCst), 1);
    }
}
