//! The engine boundary: connection/transaction primitives consumed by the
//! scoping layer. Backends implement [`Engine`] and [`RawHandle`]; everything
//! above this module is backend-agnostic.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::{DbError, DbResult};

/// A backend-agnostic database value, used both for query parameters and for
/// result cells.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Integer(i64),
    Real(f64),
    Text(String),
    Blob(Vec<u8>),
}

impl Value {
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Integer(i) => Some(*i),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Text(s) => Some(s.as_str()),
            _ => None,
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Integer(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::Text(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::Text(v)
    }
}

impl From<Option<i64>> for Value {
    fn from(v: Option<i64>) -> Self {
        v.map(Value::Integer).unwrap_or(Value::Null)
    }
}

/// An executable unit produced by the query-building layer. The scoping
/// engine never inspects it; it is only dispatched to a handle for execution.
#[derive(Debug, Clone)]
pub struct Query {
    sql: String,
    params: Vec<Value>,
}

impl Query {
    pub fn new(sql: impl Into<String>) -> Self {
        Self {
            sql: sql.into(),
            params: Vec::new(),
        }
    }

    /// Append a positional parameter.
    pub fn bind(mut self, value: impl Into<Value>) -> Self {
        self.params.push(value.into());
        self
    }

    pub fn sql(&self) -> &str {
        &self.sql
    }

    pub fn params(&self) -> &[Value] {
        &self.params
    }
}

/// A single result row. Column names are shared with the owning [`Rows`].
#[derive(Debug, Clone)]
pub struct Row {
    columns: Arc<Vec<String>>,
    values: Vec<Value>,
}

impl Row {
    pub fn new(columns: Arc<Vec<String>>, values: Vec<Value>) -> Self {
        Self { columns, values }
    }

    pub fn get(&self, idx: usize) -> Option<&Value> {
        self.values.get(idx)
    }

    pub fn get_named(&self, name: &str) -> Option<&Value> {
        let idx = self.columns.iter().position(|c| c == name)?;
        self.values.get(idx)
    }

    pub fn values(&self) -> &[Value] {
        &self.values
    }
}

/// An ordered result set, or an affected-row count for statements that
/// return no rows.
#[derive(Debug, Clone, Default)]
pub struct Rows {
    columns: Arc<Vec<String>>,
    rows: Vec<Row>,
    affected: u64,
}

impl Rows {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn from_affected(affected: u64) -> Self {
        Self {
            affected,
            ..Self::default()
        }
    }

    pub fn new(columns: Vec<String>, value_rows: Vec<Vec<Value>>) -> Self {
        let columns = Arc::new(columns);
        let rows = value_rows
            .into_iter()
            .map(|values| Row::new(columns.clone(), values))
            .collect();
        Self {
            columns,
            rows,
            affected: 0,
        }
    }

    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    pub fn iter(&self) -> impl Iterator<Item = &Row> {
        self.rows.iter()
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn affected(&self) -> u64 {
        self.affected
    }

    /// First column of the first row. Errors when the result set is empty.
    pub fn scalar(&self) -> DbResult<Value> {
        self.rows
            .first()
            .and_then(|r| r.get(0))
            .cloned()
            .ok_or_else(|| {
                DbError::mapping(std::io::Error::new(
                    std::io::ErrorKind::Other,
                    "expected a scalar result but the result set was empty",
                ))
            })
    }

    /// Like [`Rows::scalar`] but maps SQL NULL to `None`.
    pub fn scalar_opt_i64(&self) -> DbResult<Option<i64>> {
        match self.scalar()? {
            Value::Null => Ok(None),
            Value::Integer(i) => Ok(Some(i)),
            other => Err(DbError::mapping(std::io::Error::new(
                std::io::ErrorKind::Other,
                format!("expected an integer scalar, got {other:?}"),
            ))),
        }
    }

    pub fn scalar_i64(&self) -> DbResult<i64> {
        self.scalar_opt_i64()?.ok_or_else(|| {
            DbError::mapping(std::io::Error::new(
                std::io::ErrorKind::Other,
                "expected a non-NULL integer scalar",
            ))
        })
    }
}

/// Whether a handle is a plain connection or a transaction-bound connection.
/// Only transaction handles carry commit/rollback authority.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandleKind {
    Connection,
    Transaction,
}

/// Backend-implemented operations of a single live connection or transaction.
#[async_trait::async_trait]
pub trait RawHandle: Send + Sync {
    async fn execute(&self, query: &Query) -> DbResult<Rows>;
    async fn commit(&self) -> DbResult<()>;
    async fn rollback(&self) -> DbResult<()>;
    async fn close(&self) -> DbResult<()>;
}

static NEXT_HANDLE_ID: AtomicU64 = AtomicU64::new(1);

/// A cheaply-clonable reference to a live connection or transaction.
///
/// A handle is owned by the scope (or caller) that created it and must not be
/// shared across concurrently running logical operations. Handles vended by
/// `atomic`/`non_atomic` scopes are finalized by the owning scope; calling
/// `commit`/`rollback` on them directly breaks the exactly-once guarantee.
#[derive(Clone)]
pub struct Handle {
    raw: Arc<dyn RawHandle>,
    kind: HandleKind,
    id: u64,
}

impl Handle {
    pub fn connection(raw: Arc<dyn RawHandle>) -> Self {
        Self::with_kind(raw, HandleKind::Connection)
    }

    pub fn transaction(raw: Arc<dyn RawHandle>) -> Self {
        Self::with_kind(raw, HandleKind::Transaction)
    }

    fn with_kind(raw: Arc<dyn RawHandle>, kind: HandleKind) -> Self {
        Self {
            raw,
            kind,
            id: NEXT_HANDLE_ID.fetch_add(1, Ordering::Relaxed),
        }
    }

    pub fn kind(&self) -> HandleKind {
        self.kind
    }

    pub fn is_transaction(&self) -> bool {
        self.kind == HandleKind::Transaction
    }

    /// Process-unique identity, stable across clones of the same handle.
    pub fn id(&self) -> u64 {
        self.id
    }

    pub async fn execute(&self, query: &Query) -> DbResult<Rows> {
        self.raw.execute(query).await
    }

    pub async fn commit(&self) -> DbResult<()> {
        self.raw.commit().await
    }

    pub async fn rollback(&self) -> DbResult<()> {
        self.raw.rollback().await
    }

    pub async fn close(&self) -> DbResult<()> {
        self.raw.close().await
    }
}

impl std::fmt::Debug for Handle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Handle")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .finish()
    }
}

/// The database engine boundary: vends plain connections and transactions.
/// Everything else the scoping layer needs happens through [`Handle`].
#[async_trait::async_trait]
pub trait Engine: Send + Sync {
    /// Begin a transaction on a fresh connection and return its handle.
    async fn begin_transaction(&self) -> DbResult<Handle>;

    /// Open a plain, autocommit connection and return its handle.
    async fn open_connection(&self) -> DbResult<Handle>;
}
