//! The bookstore fixture: a small books/authors schema and the same business
//! handlers written in each of the three call conventions (ambient lookup,
//! dependency injection, optional parameter). The conventions are
//! interchangeable views over one engine, which the integration tests verify
//! by running identical call sequences through each of them.

use txscope_core::{adapters, DbError, DbResult, Handle, Query, ScopedEngine};

/// SQL statements shared by the real backend and [`crate::MemoryEngine`].
pub mod sql {
    pub const CREATE_AUTHOR_TABLE: &str =
        "CREATE TABLE IF NOT EXISTS author (id INTEGER PRIMARY KEY AUTOINCREMENT, name TEXT NOT NULL)";
    pub const CREATE_BOOK_TABLE: &str =
        "CREATE TABLE IF NOT EXISTS book (id INTEGER PRIMARY KEY AUTOINCREMENT, title TEXT NOT NULL, author_id INTEGER REFERENCES author(id))";
    pub const DROP_AUTHOR_TABLE: &str = "DROP TABLE IF EXISTS author";
    pub const DROP_BOOK_TABLE: &str = "DROP TABLE IF EXISTS book";

    pub const INSERT_AUTHOR: &str = "INSERT INTO author (name) VALUES (?1) RETURNING id";
    pub const INSERT_BOOK: &str =
        "INSERT INTO book (title, author_id) VALUES (?1, ?2) RETURNING id";

    pub const COUNT_AUTHORS: &str = "SELECT COUNT(*) FROM author";
    pub const COUNT_BOOKS: &str = "SELECT COUNT(*) FROM book";
    pub const MAX_AUTHOR_ID: &str = "SELECT MAX(id) FROM author";
    pub const MAX_BOOK_ID: &str = "SELECT MAX(id) FROM book";

    pub const SELECT_AUTHORS: &str = "SELECT id, name FROM author";
    pub const SELECT_BOOKS: &str =
        "SELECT book.title, author.name AS author_name FROM book JOIN author ON author.id = book.author_id";
}

/// Raised between the author insert and the book insert when fault injection
/// is requested, to exercise rollback of a half-done two-step write.
#[derive(Debug, thiserror::Error)]
#[error("simulated failure after author insert")]
pub struct SimulatedFault;

#[derive(Debug, Clone, Default)]
pub struct CreateBook {
    pub title: String,
    pub author_id: Option<i64>,
    pub author_name: Option<String>,
    /// Fail after the author insert but before the book insert.
    pub inject_fault: bool,
}

impl CreateBook {
    pub fn with_new_author(title: &str, author_name: &str) -> Self {
        Self {
            title: title.to_string(),
            author_name: Some(author_name.to_string()),
            ..Self::default()
        }
    }

    pub fn faulty(title: &str, author_name: &str) -> Self {
        Self {
            inject_fault: true,
            ..Self::with_new_author(title, author_name)
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Stats {
    pub book_count: i64,
    pub author_count: i64,
    pub max_book_id: Option<i64>,
    pub max_author_id: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BookListing {
    pub title: String,
    pub author_name: String,
}

fn insert_author_query(name: &str) -> Query {
    Query::new(sql::INSERT_AUTHOR).bind(name)
}

fn insert_book_query(title: &str, author_id: Option<i64>) -> Query {
    Query::new(sql::INSERT_BOOK).bind(title).bind(author_id)
}

/// Schema lifecycle hooks, invoked once at process start/stop by the
/// surrounding application, not per request.
pub async fn create_all_tables(db: &ScopedEngine) -> DbResult<()> {
    db.auto_connection(Query::new(sql::CREATE_AUTHOR_TABLE))
        .await?;
    db.auto_connection(Query::new(sql::CREATE_BOOK_TABLE)).await?;
    Ok(())
}

pub async fn drop_all_tables(db: &ScopedEngine) -> DbResult<()> {
    db.auto_connection(Query::new(sql::DROP_BOOK_TABLE)).await?;
    db.auto_connection(Query::new(sql::DROP_AUTHOR_TABLE)).await?;
    Ok(())
}

/// Ambient-lookup convention: no handle parameter anywhere; the executor
/// entry points read the ambient scope. Atomicity of the two-step write
/// comes from the caller wrapping the call in `db.atomic(..)`, the way a
/// route layer wraps each mutating request.
pub mod ambient {
    use super::*;

    pub async fn create_book(db: &ScopedEngine, req: &CreateBook) -> DbResult<i64> {
        let mut author_id = req.author_id;
        if author_id.is_none() {
            if let Some(name) = &req.author_name {
                let rows = db.auto_atomic(insert_author_query(name)).await?;
                author_id = Some(rows.scalar_i64()?);
                if req.inject_fault {
                    return Err(DbError::business(SimulatedFault));
                }
            }
        }
        let rows = db
            .auto_atomic(insert_book_query(&req.title, author_id))
            .await?;
        rows.scalar_i64()
    }

    pub async fn get_books(db: &ScopedEngine) -> DbResult<Vec<BookListing>> {
        let rows = db.auto_connection(Query::new(sql::SELECT_BOOKS)).await?;
        collect_book_listings(&rows)
    }

    pub async fn get_stats(db: &ScopedEngine) -> DbResult<Stats> {
        let author_count = db
            .auto_connection(Query::new(sql::COUNT_AUTHORS))
            .await?
            .scalar_i64()?;
        let max_author_id = db
            .auto_connection(Query::new(sql::MAX_AUTHOR_ID))
            .await?
            .scalar_opt_i64()?;
        let book_count = db
            .auto_connection(Query::new(sql::COUNT_BOOKS))
            .await?
            .scalar_i64()?;
        let max_book_id = db
            .auto_connection(Query::new(sql::MAX_BOOK_ID))
            .await?
            .scalar_opt_i64()?;
        Ok(Stats {
            book_count,
            author_count,
            max_book_id,
            max_author_id,
        })
    }
}

/// Dependency-injection convention: an adapter resolves the handle before
/// the body runs and passes it as an ordinary parameter; the body executes
/// on the handle directly.
pub mod injected {
    use super::*;

    pub async fn create_book(db: &ScopedEngine, req: &CreateBook) -> DbResult<i64> {
        adapters::with_transaction(db, |tr| async move {
            let mut author_id = req.author_id;
            if author_id.is_none() {
                if let Some(name) = &req.author_name {
                    let rows = tr.execute(&insert_author_query(name)).await?;
                    author_id = Some(rows.scalar_i64()?);
                    if req.inject_fault {
                        return Err(DbError::business(SimulatedFault));
                    }
                }
            }
            let rows = tr
                .execute(&insert_book_query(&req.title, author_id))
                .await?;
            rows.scalar_i64()
        })
        .await
    }

    pub async fn get_books(db: &ScopedEngine) -> DbResult<Vec<BookListing>> {
        adapters::with_connection(db, |conn| async move {
            let rows = conn.execute(&Query::new(sql::SELECT_BOOKS)).await?;
            collect_book_listings(&rows)
        })
        .await
    }

    pub async fn get_stats(db: &ScopedEngine) -> DbResult<Stats> {
        adapters::with_connection(db, |conn| async move {
            let author_count = conn
                .execute(&Query::new(sql::COUNT_AUTHORS))
                .await?
                .scalar_i64()?;
            let max_author_id = conn
                .execute(&Query::new(sql::MAX_AUTHOR_ID))
                .await?
                .scalar_opt_i64()?;
            let book_count = conn
                .execute(&Query::new(sql::COUNT_BOOKS))
                .await?
                .scalar_i64()?;
            let max_book_id = conn
                .execute(&Query::new(sql::MAX_BOOK_ID))
                .await?
                .scalar_opt_i64()?;
            Ok(Stats {
                book_count,
                author_count,
                max_book_id,
                max_author_id,
            })
        })
        .await
    }
}

/// Optional-parameter convention: the handle parameter defaults to absent and
/// is forwarded to the explicit-accepting executor entry points. Equivalent
/// to ambient lookup when the parameter is omitted, and to explicit
/// pass-through when supplied.
pub mod optional {
    use super::*;

    pub async fn create_book(
        db: &ScopedEngine,
        req: &CreateBook,
        tr: Option<&Handle>,
    ) -> DbResult<i64> {
        let mut author_id = req.author_id;
        if author_id.is_none() {
            if let Some(name) = &req.author_name {
                let rows = db.execute_tx(tr, insert_author_query(name)).await?;
                author_id = Some(rows.scalar_i64()?);
                if req.inject_fault {
                    return Err(DbError::business(SimulatedFault));
                }
            }
        }
        let rows = db
            .execute_tx(tr, insert_book_query(&req.title, author_id))
            .await?;
        rows.scalar_i64()
    }

    pub async fn get_books(
        db: &ScopedEngine,
        conn: Option<&Handle>,
    ) -> DbResult<Vec<BookListing>> {
        let rows = db.execute(conn, Query::new(sql::SELECT_BOOKS)).await?;
        collect_book_listings(&rows)
    }

    pub async fn get_stats(db: &ScopedEngine, conn: Option<&Handle>) -> DbResult<Stats> {
        let author_count = db
            .execute(conn, Query::new(sql::COUNT_AUTHORS))
            .await?
            .scalar_i64()?;
        let max_author_id = db
            .execute(conn, Query::new(sql::MAX_AUTHOR_ID))
            .await?
            .scalar_opt_i64()?;
        let book_count = db
            .execute(conn, Query::new(sql::COUNT_BOOKS))
            .await?
            .scalar_i64()?;
        let max_book_id = db
            .execute(conn, Query::new(sql::MAX_BOOK_ID))
            .await?
            .scalar_opt_i64()?;
        Ok(Stats {
            book_count,
            author_count,
            max_book_id,
            max_author_id,
        })
    }
}

fn collect_book_listings(rows: &txscope_core::Rows) -> DbResult<Vec<BookListing>> {
    rows.iter()
        .map(|row| {
            let title = row
                .get_named("title")
                .and_then(|v| v.as_str())
                .ok_or_else(|| {
                    DbError::mapping(std::io::Error::new(
                        std::io::ErrorKind::Other,
                        "missing title column",
                    ))
                })?;
            let author_name = row
                .get_named("author_name")
                .and_then(|v| v.as_str())
                .ok_or_else(|| {
                    DbError::mapping(std::io::Error::new(
                        std::io::ErrorKind::Other,
                        "missing author_name column",
                    ))
                })?;
            Ok(BookListing {
                title: title.to_string(),
                author_name: author_name.to_string(),
            })
        })
        .collect()
}
