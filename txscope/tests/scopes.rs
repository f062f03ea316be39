//! Scope behavior end to end against [`MemoryEngine`]: ambient reuse at
//! depth, explicit-handle precedence, fail-fast executors, uncommitted-read
//! visibility and cancellation cleanup, all asserted through committed state
//! and the engine's call counters.

use std::sync::Arc;
use tests_common::bookstore::{self, ambient, injected, CreateBook};
use tests_common::MemoryEngine;
use txscope::{current_scope, DbError, Query, ScopedEngine};

fn fresh_db() -> (ScopedEngine, MemoryEngine) {
    let engine = MemoryEngine::new();
    (ScopedEngine::new(Arc::new(engine.clone())), engine)
}

#[tokio::test]
async fn deeply_nested_handlers_share_one_transaction() {
    let (db, engine) = fresh_db();

    // Three conventions stacked inside one atomic scope: everything must run
    // on the single ambient transaction.
    db.atomic(|| async {
        let tx_id = current_scope().map(|(h, _)| h.id()).expect("scope active");

        ambient::create_book(&db, &CreateBook::with_new_author("Dune", "Herbert")).await?;
        injected::create_book(&db, &CreateBook::with_new_author("Emma", "Austen")).await?;
        db.non_atomic(|| async {
            assert_eq!(current_scope().map(|(h, _)| h.id()), Some(tx_id));
            Ok(())
        })
        .await?;

        assert_eq!(current_scope().map(|(h, _)| h.id()), Some(tx_id));
        Ok(())
    })
    .await
    .unwrap();

    assert_eq!(engine.counters().begins(), 1);
    assert_eq!(engine.counters().commits(), 1);
    assert_eq!(engine.counters().opens(), 0);
    assert_eq!(engine.committed_books().len(), 2);
}

#[tokio::test]
async fn require_atomic_fails_fast_without_touching_the_store() {
    let (db, engine) = fresh_db();

    let err = db
        .require_atomic(Query::new(bookstore::sql::INSERT_AUTHOR).bind("Herbert"))
        .await
        .unwrap_err();
    assert!(matches!(err, DbError::NoAtomicScope));

    // The statement never reached the engine.
    assert!(engine.committed_authors().is_empty());
    assert_eq!(engine.counters().begins(), 0);
    assert_eq!(engine.counters().opens(), 0);
}

#[tokio::test]
async fn explicit_handle_takes_precedence_over_the_ambient_scope() {
    let (db, engine) = fresh_db();

    // An explicit transaction passed in while a different ambient scope is
    // active: the write must land on the explicit one.
    let explicit = db.engine().begin_transaction().await.unwrap();
    db.atomic(|| async {
        db.execute_tx(
            Some(&explicit),
            Query::new(bookstore::sql::INSERT_AUTHOR).bind("Herbert"),
        )
        .await?;
        Ok(())
    })
    .await
    .unwrap();

    // The ambient transaction committed empty; the write is still staged in
    // the explicit transaction.
    assert!(engine.committed_authors().is_empty());
    explicit.commit().await.unwrap();
    assert_eq!(engine.committed_authors().len(), 1);
    assert_eq!(engine.committed_authors()[0].name, "Herbert");
}

#[tokio::test]
async fn execute_tx_rejects_a_plain_connection_handle() {
    let (db, engine) = fresh_db();
    let conn = db.engine().open_connection().await.unwrap();
    let err = db
        .execute_tx(
            Some(&conn),
            Query::new(bookstore::sql::INSERT_AUTHOR).bind("Herbert"),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, DbError::NonTransactionalHandle));
    assert!(engine.committed_authors().is_empty());
}

#[tokio::test]
async fn reads_inside_the_transaction_see_uncommitted_writes() {
    let (db, engine) = fresh_db();

    db.atomic(|| async {
        db.auto_atomic(Query::new(bookstore::sql::INSERT_AUTHOR).bind("Herbert"))
            .await?;

        // The nested non-atomic scope reuses the transaction and observes the
        // staged row; a fresh connection would count zero.
        let count = db
            .non_atomic(|| async {
                db.auto_connection(Query::new(bookstore::sql::COUNT_AUTHORS))
                    .await?
                    .scalar_i64()
            })
            .await?;
        assert_eq!(count, 1);
        Ok(())
    })
    .await
    .unwrap();

    // Nothing was committed before the scope exit.
    assert_eq!(engine.counters().commits(), 1);
    assert_eq!(engine.committed_authors().len(), 1);
}

#[tokio::test]
async fn error_after_partial_work_commits_nothing() {
    let (db, engine) = fresh_db();

    let err = injected::create_book(&db, &CreateBook::faulty("Dune", "Herbert"))
        .await
        .unwrap_err();
    assert!(matches!(err, DbError::Business { .. }));

    assert!(engine.committed_authors().is_empty());
    assert!(engine.committed_books().is_empty());
    assert_eq!(engine.counters().rollbacks(), 1);
    assert_eq!(engine.counters().commits(), 0);
}

#[tokio::test(flavor = "multi_thread")]
async fn cancelled_operation_rolls_its_transaction_back() {
    let (db, engine) = fresh_db();

    let (_hold, held) = tokio::sync::oneshot::channel::<()>();
    let task = tokio::spawn({
        let db = db.clone();
        async move {
            let inner = db.clone();
            db.atomic(|| async move {
                inner
                    .auto_atomic(Query::new(bookstore::sql::INSERT_AUTHOR).bind("Herbert"))
                    .await?;
                held.await.ok();
                Ok(())
            })
            .await
        }
    });

    tokio::time::sleep(std::time::Duration::from_millis(20)).await;
    task.abort();
    let _ = task.await;

    // The release guard spawns the rollback; poll until it lands.
    for _ in 0..50 {
        if engine.counters().rollbacks() == 1 {
            break;
        }
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
    }
    assert_eq!(engine.counters().rollbacks(), 1);
    assert_eq!(engine.counters().commits(), 0);
    assert!(engine.committed_authors().is_empty());
}
