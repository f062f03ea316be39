//! Common integration testing utilities shared across the workspace.
//!
//! Provides [`MemoryEngine`], a deterministic in-memory implementation of the
//! [`txscope_core::Engine`] boundary with real transaction semantics (writes
//! are staged per transaction and only become visible to other handles on
//! commit), plus instrumentation counters so tests can assert how many
//! transactions were begun, committed or rolled back. The bookstore fixture
//! in [`bookstore`] builds on it.

pub mod bookstore;

use std::sync::atomic::{AtomicI64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use txscope_core::{DbError, DbResult, Engine, Handle, Query, RawHandle, Rows, Value};

use bookstore::sql;

#[derive(Debug, Clone, PartialEq)]
pub struct AuthorRow {
    pub id: i64,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct BookRow {
    pub id: i64,
    pub title: String,
    pub author_id: Option<i64>,
}

#[derive(Default)]
struct Store {
    authors: Vec<AuthorRow>,
    books: Vec<BookRow>,
}

/// Writes buffered by an open transaction, invisible to other handles until
/// commit.
#[derive(Default)]
struct Staged {
    authors: Vec<AuthorRow>,
    books: Vec<BookRow>,
}

impl Staged {
    fn is_empty(&self) -> bool {
        self.authors.is_empty() && self.books.is_empty()
    }
}

/// Engine-call counters for asserting scope behavior in tests.
#[derive(Default)]
pub struct EngineCounters {
    begins: AtomicUsize,
    opens: AtomicUsize,
    commits: AtomicUsize,
    rollbacks: AtomicUsize,
    closes: AtomicUsize,
}

impl EngineCounters {
    pub fn begins(&self) -> usize {
        self.begins.load(Ordering::SeqCst)
    }
    pub fn opens(&self) -> usize {
        self.opens.load(Ordering::SeqCst)
    }
    pub fn commits(&self) -> usize {
        self.commits.load(Ordering::SeqCst)
    }
    pub fn rollbacks(&self) -> usize {
        self.rollbacks.load(Ordering::SeqCst)
    }
    pub fn closes(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }
}

struct Shared {
    store: Mutex<Store>,
    // Ids are allocated from shared sequences at execute time so that
    // concurrent transactions never hand out the same id; ids burned by a
    // rolled-back transaction are simply skipped, like database sequences.
    next_author_id: AtomicI64,
    next_book_id: AtomicI64,
    counters: EngineCounters,
}

/// Deterministic in-memory [`Engine`] understanding the bookstore SQL of
/// [`bookstore::sql`].
#[derive(Clone)]
pub struct MemoryEngine {
    shared: Arc<Shared>,
}

impl Default for MemoryEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryEngine {
    pub fn new() -> Self {
        Self {
            shared: Arc::new(Shared {
                store: Mutex::new(Store::default()),
                next_author_id: AtomicI64::new(1),
                next_book_id: AtomicI64::new(1),
                counters: EngineCounters::default(),
            }),
        }
    }

    pub fn counters(&self) -> &EngineCounters {
        &self.shared.counters
    }

    /// Committed authors, for direct assertions bypassing the query layer.
    pub fn committed_authors(&self) -> Vec<AuthorRow> {
        self.shared.store.lock().unwrap().authors.clone()
    }

    pub fn committed_books(&self) -> Vec<BookRow> {
        self.shared.store.lock().unwrap().books.clone()
    }
}

#[async_trait::async_trait]
impl Engine for MemoryEngine {
    async fn begin_transaction(&self) -> DbResult<Handle> {
        self.shared.counters.begins.fetch_add(1, Ordering::SeqCst);
        Ok(Handle::transaction(Arc::new(MemTransaction {
            shared: self.shared.clone(),
            staged: Mutex::new(Some(Staged::default())),
        })))
    }

    async fn open_connection(&self) -> DbResult<Handle> {
        self.shared.counters.opens.fetch_add(1, Ordering::SeqCst);
        Ok(Handle::connection(Arc::new(MemConnection {
            shared: self.shared.clone(),
        })))
    }
}

fn backend_err(msg: impl Into<String>) -> DbError {
    DbError::engine(std::io::Error::new(std::io::ErrorKind::Other, msg.into()))
}

fn param_text(query: &Query, idx: usize) -> DbResult<String> {
    match query.params().get(idx) {
        Some(Value::Text(s)) => Ok(s.clone()),
        other => Err(backend_err(format!(
            "parameter {idx} of `{}` must be text, got {other:?}",
            query.sql()
        ))),
    }
}

fn param_opt_i64(query: &Query, idx: usize) -> DbResult<Option<i64>> {
    match query.params().get(idx) {
        Some(Value::Integer(i)) => Ok(Some(*i)),
        Some(Value::Null) => Ok(None),
        other => Err(backend_err(format!(
            "parameter {idx} of `{}` must be an integer or NULL, got {other:?}",
            query.sql()
        ))),
    }
}

fn id_rows(id: i64) -> Rows {
    Rows::new(vec!["id".to_string()], vec![vec![Value::Integer(id)]])
}

fn scalar_rows(name: &str, value: Value) -> Rows {
    Rows::new(vec![name.to_string()], vec![vec![value]])
}

/// Execute the bookstore SQL against the committed store plus an optional
/// per-transaction staging overlay. Writes go to the overlay when present,
/// directly to the store otherwise (autocommit connection semantics).
fn run_query(shared: &Shared, staged: Option<&mut Staged>, query: &Query) -> DbResult<Rows> {
    let sql_text = query.sql();
    let mut store = shared.store.lock().unwrap();
    // Split borrows: overlay reads look at both the store and the staging.
    match sql_text {
        s if s == sql::CREATE_AUTHOR_TABLE || s == sql::CREATE_BOOK_TABLE => Ok(Rows::empty()),
        s if s == sql::DROP_AUTHOR_TABLE => {
            store.authors.clear();
            Ok(Rows::empty())
        }
        s if s == sql::DROP_BOOK_TABLE => {
            store.books.clear();
            Ok(Rows::empty())
        }
        s if s == sql::INSERT_AUTHOR => {
            let name = param_text(query, 0)?;
            let id = shared.next_author_id.fetch_add(1, Ordering::SeqCst);
            let row = AuthorRow { id, name };
            match staged {
                Some(staged) => staged.authors.push(row),
                None => store.authors.push(row),
            }
            Ok(id_rows(id))
        }
        s if s == sql::INSERT_BOOK => {
            let title = param_text(query, 0)?;
            let author_id = param_opt_i64(query, 1)?;
            let id = shared.next_book_id.fetch_add(1, Ordering::SeqCst);
            let row = BookRow {
                id,
                title,
                author_id,
            };
            match staged {
                Some(staged) => staged.books.push(row),
                None => store.books.push(row),
            }
            Ok(id_rows(id))
        }
        s if s == sql::COUNT_AUTHORS => {
            let staged_len = staged.map(|s| s.authors.len()).unwrap_or(0);
            let n = (store.authors.len() + staged_len) as i64;
            Ok(scalar_rows("count", Value::Integer(n)))
        }
        s if s == sql::COUNT_BOOKS => {
            let staged_len = staged.map(|s| s.books.len()).unwrap_or(0);
            let n = (store.books.len() + staged_len) as i64;
            Ok(scalar_rows("count", Value::Integer(n)))
        }
        s if s == sql::MAX_AUTHOR_ID => {
            let staged_max = staged.and_then(|s| s.authors.iter().map(|a| a.id).max());
            let max = store
                .authors
                .iter()
                .map(|a| a.id)
                .max()
                .into_iter()
                .chain(staged_max)
                .max();
            Ok(scalar_rows("max", max.into()))
        }
        s if s == sql::MAX_BOOK_ID => {
            let staged_max = staged.and_then(|s| s.books.iter().map(|b| b.id).max());
            let max = store
                .books
                .iter()
                .map(|b| b.id)
                .max()
                .into_iter()
                .chain(staged_max)
                .max();
            Ok(scalar_rows("max", max.into()))
        }
        s if s == sql::SELECT_AUTHORS => {
            let mut rows: Vec<Vec<Value>> = Vec::new();
            let staged_authors = staged.map(|s| s.authors.as_slice()).unwrap_or(&[]);
            for a in store.authors.iter().chain(staged_authors.iter()) {
                rows.push(vec![
                    Value::Integer(a.id),
                    Value::Text(a.name.clone()),
                ]);
            }
            Ok(Rows::new(vec!["id".to_string(), "name".to_string()], rows))
        }
        s if s == sql::SELECT_BOOKS => {
            let (staged_books, staged_authors) = match staged {
                Some(s) => (s.books.as_slice(), s.authors.as_slice()),
                None => (&[][..], &[][..]),
            };
            let mut rows: Vec<Vec<Value>> = Vec::new();
            for b in store.books.iter().chain(staged_books.iter()) {
                let author = b.author_id.and_then(|id| {
                    store
                        .authors
                        .iter()
                        .chain(staged_authors.iter())
                        .find(|a| a.id == id)
                });
                if let Some(author) = author {
                    rows.push(vec![
                        Value::Text(b.title.clone()),
                        Value::Text(author.name.clone()),
                    ]);
                }
            }
            Ok(Rows::new(
                vec!["title".to_string(), "author_name".to_string()],
                rows,
            ))
        }
        other => Err(backend_err(format!("unsupported statement: {other}"))),
    }
}

struct MemConnection {
    shared: Arc<Shared>,
}

#[async_trait::async_trait]
impl RawHandle for MemConnection {
    async fn execute(&self, query: &Query) -> DbResult<Rows> {
        run_query(&self.shared, None, query)
    }
    async fn commit(&self) -> DbResult<()> {
        Err(backend_err("plain connection has no transaction to commit"))
    }
    async fn rollback(&self) -> DbResult<()> {
        Err(backend_err(
            "plain connection has no transaction to roll back",
        ))
    }
    async fn close(&self) -> DbResult<()> {
        self.shared.counters.closes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

struct MemTransaction {
    shared: Arc<Shared>,
    // None once the transaction is finished.
    staged: Mutex<Option<Staged>>,
}

impl MemTransaction {
    fn finish(&self) -> DbResult<Staged> {
        self.staged
            .lock()
            .unwrap()
            .take()
            .ok_or_else(|| backend_err("transaction already finished"))
    }
}

#[async_trait::async_trait]
impl RawHandle for MemTransaction {
    async fn execute(&self, query: &Query) -> DbResult<Rows> {
        let mut guard = self.staged.lock().unwrap();
        let staged = guard
            .as_mut()
            .ok_or_else(|| backend_err("transaction already finished"))?;
        run_query(&self.shared, Some(staged), query)
    }

    async fn commit(&self) -> DbResult<()> {
        let staged = self.finish()?;
        if !staged.is_empty() {
            let mut store = self.shared.store.lock().unwrap();
            store.authors.extend(staged.authors);
            store.books.extend(staged.books);
        }
        self.shared.counters.commits.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn rollback(&self) -> DbResult<()> {
        let _discarded = self.finish()?;
        self.shared
            .counters
            .rollbacks
            .fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn close(&self) -> DbResult<()> {
        self.shared.counters.closes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}
