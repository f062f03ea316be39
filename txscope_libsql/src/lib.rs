#![forbid(unsafe_code)]
#![cfg_attr(
    not(feature = "libsql-backend"),
    doc = "Enable feature `libsql-backend` to use this adapter."
)]

#[cfg(feature = "libsql-backend")]
mod backend {
    use std::sync::Arc;
    use std::time::Instant;

    use async_trait::async_trait;
    use libsql::Database;
    use txscope_core::{DbError, DbResult, Engine, Handle, Query, RawHandle, Rows, Value};

    #[cfg(feature = "tracing")]
    use tracing::info;

    #[inline]
    #[allow(unused_variables)]
    fn obs_record(op: &str, start: Instant, success: bool) {
        let elapsed = start.elapsed().as_millis() as u64;
        #[cfg(feature = "tracing")]
        {
            info!(op = op, elapsed_ms = elapsed, success = success, "engine op");
        }
        #[cfg(feature = "metrics")]
        {
            metrics::counter!("engine_ops_total", 1, "op" => op.to_string(), "success" => success.to_string());
            metrics::histogram!("engine_op_duration_ms", elapsed as f64, "op" => op.to_string());
            if !success {
                metrics::counter!("engine_op_errors_total", 1, "op" => op.to_string());
            }
        }
    }

    /// How transactions are begun. Deferred matches SQLite's default; the
    /// stricter modes take the write lock earlier.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub enum Begin {
        #[default]
        Deferred,
        Immediate,
        Exclusive,
    }

    impl Begin {
        fn sql(self) -> &'static str {
            match self {
                Begin::Deferred => "BEGIN DEFERRED",
                Begin::Immediate => "BEGIN IMMEDIATE",
                Begin::Exclusive => "BEGIN EXCLUSIVE",
            }
        }
    }

    /// A libsql/SQLite implementation of the engine boundary. Each handle is
    /// a dedicated `libsql::Connection`; transactions are driven with
    /// explicit BEGIN/COMMIT/ROLLBACK statements on that connection.
    #[derive(Clone)]
    pub struct LibsqlEngine {
        db: Arc<Database>,
        begin: Begin,
        busy_timeout_ms: i64,
    }

    impl LibsqlEngine {
        pub fn new(db: Arc<Database>) -> Self {
            Self {
                db,
                begin: Begin::default(),
                busy_timeout_ms: 5000,
            }
        }

        pub fn from_url(url: &str) -> DbResult<Self> {
            // Database::open is deprecated upstream; keep a narrow allow here
            // until Builder migration
            #[allow(deprecated)]
            let db = Database::open(url).map_err(DbError::engine)?;
            Ok(Self::new(Arc::new(db)))
        }

        pub fn with_begin(mut self, begin: Begin) -> Self {
            self.begin = begin;
            self
        }

        pub fn with_busy_timeout_ms(mut self, ms: i64) -> Self {
            self.busy_timeout_ms = ms;
            self
        }

        async fn connect(&self) -> DbResult<libsql::Connection> {
            let conn = self.db.connect().map_err(DbError::engine)?;
            // Reduce spurious SQLITE_BUSY when concurrent operations contend
            // for the write lock.
            conn.execute(&format!("PRAGMA busy_timeout = {}", self.busy_timeout_ms), ())
                .await
                .ok();
            Ok(conn)
        }
    }

    #[async_trait]
    impl Engine for LibsqlEngine {
        async fn begin_transaction(&self) -> DbResult<Handle> {
            let start = Instant::now();
            let conn = self.connect().await?;
            match conn.execute(self.begin.sql(), ()).await {
                Ok(_) => {
                    obs_record("begin", start, true);
                    Ok(Handle::transaction(Arc::new(LibsqlHandle { conn })))
                }
                Err(e) => {
                    obs_record("begin", start, false);
                    Err(DbError::engine(e))
                }
            }
        }

        async fn open_connection(&self) -> DbResult<Handle> {
            let start = Instant::now();
            let conn = self.connect().await?;
            obs_record("connect", start, true);
            Ok(Handle::connection(Arc::new(LibsqlHandle { conn })))
        }
    }

    struct LibsqlHandle {
        conn: libsql::Connection,
    }

    fn to_libsql_value(v: &Value) -> libsql::Value {
        match v {
            Value::Null => libsql::Value::Null,
            Value::Integer(i) => libsql::Value::Integer(*i),
            Value::Real(f) => libsql::Value::Real(*f),
            Value::Text(s) => libsql::Value::Text(s.clone()),
            Value::Blob(b) => libsql::Value::Blob(b.clone()),
        }
    }

    fn from_libsql_value(v: libsql::Value) -> Value {
        match v {
            libsql::Value::Null => Value::Null,
            libsql::Value::Integer(i) => Value::Integer(i),
            libsql::Value::Real(f) => Value::Real(f),
            libsql::Value::Text(s) => Value::Text(s),
            libsql::Value::Blob(b) => Value::Blob(b),
        }
    }

    #[async_trait]
    impl RawHandle for LibsqlHandle {
        async fn execute(&self, query: &Query) -> DbResult<Rows> {
            let start = Instant::now();
            let params: Vec<libsql::Value> = query.params().iter().map(to_libsql_value).collect();
            let mut rows = match self.conn.query(query.sql(), params).await {
                Ok(rows) => rows,
                Err(e) => {
                    obs_record("execute", start, false);
                    return Err(DbError::engine(e));
                }
            };

            let col_count = rows.column_count();
            let mut columns = Vec::with_capacity(col_count as usize);
            for i in 0..col_count {
                columns.push(rows.column_name(i).unwrap_or_default().to_string());
            }

            let mut out: Vec<Vec<Value>> = Vec::new();
            loop {
                match rows.next().await {
                    Ok(Some(row)) => {
                        let mut values = Vec::with_capacity(col_count as usize);
                        for i in 0..col_count {
                            let v = row.get_value(i).map_err(DbError::engine)?;
                            values.push(from_libsql_value(v));
                        }
                        out.push(values);
                    }
                    Ok(None) => break,
                    Err(e) => {
                        obs_record("execute", start, false);
                        return Err(DbError::engine(e));
                    }
                }
            }
            obs_record("execute", start, true);
            Ok(Rows::new(columns, out))
        }

        async fn commit(&self) -> DbResult<()> {
            let start = Instant::now();
            let res = self.conn.execute("COMMIT", ()).await;
            obs_record("commit", start, res.is_ok());
            res.map(|_| ()).map_err(DbError::engine)
        }

        async fn rollback(&self) -> DbResult<()> {
            let start = Instant::now();
            let res = self.conn.execute("ROLLBACK", ()).await;
            obs_record("rollback", start, res.is_ok());
            res.map(|_| ()).map_err(DbError::engine)
        }

        async fn close(&self) -> DbResult<()> {
            // Dropping the last clone of the connection releases it; there is
            // no explicit close in libsql.
            Ok(())
        }
    }
}

#[cfg(feature = "libsql-backend")]
pub use backend::{Begin, LibsqlEngine};
