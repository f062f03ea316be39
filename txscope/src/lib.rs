#![forbid(unsafe_code)]
//! Facade crate for the `txscope` library.
//!
//! Re-exports the core engine so applications only need this single crate:
//! the ambient scope manager ([`ScopedEngine::atomic`] /
//! [`ScopedEngine::non_atomic`]), the query-execution entry points, and the
//! call adapters for the dependency-injection convention. Backend adapters
//! are re-exported under [`backends`] behind their feature flags.
//!
//! # Example
//!
//! ```ignore
//! // Requires a backend feature; see the runnable examples under
//! // `txscope/examples/`.
//! use txscope::{Query, ScopedEngine};
//!
//! async fn transfer(db: &ScopedEngine) -> txscope::DbResult<()> {
//!     // One transaction around both writes; nested entries would join it.
//!     db.atomic(|| async {
//!         db.auto_atomic(Query::new("UPDATE account SET n = n - 1 WHERE id = 1")).await?;
//!         db.auto_atomic(Query::new("UPDATE account SET n = n + 1 WHERE id = 2")).await?;
//!         Ok(())
//!     })
//!     .await
//! }
//! ```

// Re-export the core API.
pub use txscope_core::{
    current_scope, DbError, DbResult, Engine, Handle, HandleKind, Query, RawHandle, Row, Rows,
    ScopeKind, ScopedEngine, Value,
};

// Call adapters for the dependency-injection convention.
pub use txscope_core::adapters;

// Backend engines re-exported under a neutral namespace, so end-users don't
// have to depend on backend crates directly. These are feature-gated.
pub mod backends {
    #[cfg(feature = "libsql-backend")]
    pub use txscope_libsql::{Begin, LibsqlEngine};
}
