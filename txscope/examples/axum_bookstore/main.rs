// Run with:
//   cargo run -p txscope --features "libsql-backend never-web-example" --example axum_bookstore
// Starts an Axum server exposing the bookstore under all three call
// conventions, backed by a shared in-memory libsql database.

use axum::{
    extract::State,
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::sync::Arc;

use tests_common::bookstore::{self, ambient, injected, optional, CreateBook};
use txscope::backends::LibsqlEngine;
use txscope::{DbError, ScopedEngine};

#[derive(Clone)]
struct AppState {
    db: ScopedEngine,
}

#[derive(Deserialize)]
struct CreateBookPayload {
    title: String,
    author_id: Option<i64>,
    author_name: Option<String>,
    /// Fail after the author insert, to demonstrate rollback.
    #[serde(default)]
    inject_fault: bool,
}

impl CreateBookPayload {
    fn into_request(self) -> CreateBook {
        CreateBook {
            title: self.title,
            author_id: self.author_id,
            author_name: self.author_name,
            inject_fault: self.inject_fault,
        }
    }
}

#[derive(Serialize)]
struct CreatedBook {
    book_id: i64,
}

#[derive(Serialize)]
struct BookOut {
    title: String,
    author_name: String,
}

#[derive(Serialize)]
struct StatsOut {
    book_count: i64,
    author_count: i64,
    max_book_id: Option<i64>,
    max_author_id: Option<i64>,
}

fn http_error(e: DbError) -> (StatusCode, String) {
    let status = match &e {
        DbError::Business { .. } => StatusCode::UNPROCESSABLE_ENTITY,
        DbError::NoAtomicScope | DbError::NonTransactionalHandle => StatusCode::BAD_REQUEST,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    (status, format!("{e:#}"))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Shared in-memory database
    let engine = LibsqlEngine::from_url("file::memory:?cache=shared")?;
    let db = ScopedEngine::new(Arc::new(engine));
    bookstore::create_all_tables(&db).await?;

    let state = AppState { db };

    let app = Router::new()
        .route("/health", get(|| async { "ok" }))
        // Ambient-lookup convention: the route layer opens the scope.
        .route("/ambient/books", post(ambient_create).get(ambient_list))
        .route("/ambient/stats", get(ambient_stats))
        // Dependency-injection convention: adapters open the scope.
        .route("/injected/books", post(injected_create).get(injected_list))
        .route("/injected/stats", get(injected_stats))
        // Optional-parameter convention with the parameter omitted.
        .route("/optional/books", post(optional_create).get(optional_list))
        .route("/optional/stats", get(optional_stats))
        .with_state(state);

    let addr: SocketAddr = "127.0.0.1:3000".parse()?;
    println!("Axum listening on http://{addr}");
    axum::serve(tokio::net::TcpListener::bind(addr).await?, app).await?;
    Ok(())
}

// --- ambient convention -------------------------------------------------

async fn ambient_create(
    State(state): State<AppState>,
    Json(payload): Json<CreateBookPayload>,
) -> Result<Json<CreatedBook>, (StatusCode, String)> {
    let req = payload.into_request();
    let db = &state.db;
    // One transaction per mutating request; a fault inside rolls both the
    // author and the book insert back.
    let book_id = db
        .atomic(|| async { ambient::create_book(db, &req).await })
        .await
        .map_err(http_error)?;
    Ok(Json(CreatedBook { book_id }))
}

async fn ambient_list(
    State(state): State<AppState>,
) -> Result<Json<Vec<BookOut>>, (StatusCode, String)> {
    let books = ambient::get_books(&state.db).await.map_err(http_error)?;
    Ok(Json(to_book_out(books)))
}

async fn ambient_stats(
    State(state): State<AppState>,
) -> Result<Json<StatsOut>, (StatusCode, String)> {
    let stats = ambient::get_stats(&state.db).await.map_err(http_error)?;
    Ok(Json(to_stats_out(stats)))
}

// --- injected convention ------------------------------------------------

async fn injected_create(
    State(state): State<AppState>,
    Json(payload): Json<CreateBookPayload>,
) -> Result<Json<CreatedBook>, (StatusCode, String)> {
    let req = payload.into_request();
    let book_id = injected::create_book(&state.db, &req)
        .await
        .map_err(http_error)?;
    Ok(Json(CreatedBook { book_id }))
}

async fn injected_list(
    State(state): State<AppState>,
) -> Result<Json<Vec<BookOut>>, (StatusCode, String)> {
    let books = injected::get_books(&state.db).await.map_err(http_error)?;
    Ok(Json(to_book_out(books)))
}

async fn injected_stats(
    State(state): State<AppState>,
) -> Result<Json<StatsOut>, (StatusCode, String)> {
    let stats = injected::get_stats(&state.db).await.map_err(http_error)?;
    Ok(Json(to_stats_out(stats)))
}

// --- optional-parameter convention --------------------------------------

async fn optional_create(
    State(state): State<AppState>,
    Json(payload): Json<CreateBookPayload>,
) -> Result<Json<CreatedBook>, (StatusCode, String)> {
    let req = payload.into_request();
    let db = &state.db;
    let book_id = db
        .atomic(|| async { optional::create_book(db, &req, None).await })
        .await
        .map_err(http_error)?;
    Ok(Json(CreatedBook { book_id }))
}

async fn optional_list(
    State(state): State<AppState>,
) -> Result<Json<Vec<BookOut>>, (StatusCode, String)> {
    let books = optional::get_books(&state.db, None)
        .await
        .map_err(http_error)?;
    Ok(Json(to_book_out(books)))
}

async fn optional_stats(
    State(state): State<AppState>,
) -> Result<Json<StatsOut>, (StatusCode, String)> {
    let stats = optional::get_stats(&state.db, None)
        .await
        .map_err(http_error)?;
    Ok(Json(to_stats_out(stats)))
}

fn to_book_out(books: Vec<bookstore::BookListing>) -> Vec<BookOut> {
    books
        .into_iter()
        .map(|b| BookOut {
            title: b.title,
            author_name: b.author_name,
        })
        .collect()
}

fn to_stats_out(stats: bookstore::Stats) -> StatsOut {
    StatsOut {
        book_count: stats.book_count,
        author_count: stats.author_count,
        max_book_id: stats.max_book_id,
        max_author_id: stats.max_author_id,
    }
}
