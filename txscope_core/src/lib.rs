#![forbid(unsafe_code)]
//! Core of the txscope library: ambient transactional execution scopes.
//!
//! Business-logic functions issue database operations without threading a
//! connection or transaction through every call. A per-logical-operation
//! scope carries the current handle implicitly (task-local, never shared
//! across concurrent operations), nested scope entries reuse the open
//! transaction instead of beginning a second one, and the commit/rollback
//! decision is made exactly once per scope, keyed off normal-vs-error exit.
//!
//! This crate is database-agnostic: backends implement the [`engine::Engine`]
//! boundary. Three call conventions are offered over the one engine:
//!
//! - ambient lookup: the function takes no handle and calls the executor
//!   entry points ([`ScopedEngine::require_atomic`],
//!   [`ScopedEngine::auto_atomic`], [`ScopedEngine::auto_connection`]);
//! - dependency injection: [`adapters::with_transaction`] /
//!   [`adapters::with_connection`] resolve a handle before the body runs;
//! - optional parameter: the function takes `Option<&Handle>` and forwards
//!   it to [`ScopedEngine::execute`] / [`ScopedEngine::execute_tx`].

pub mod adapters;
pub mod engine;
pub mod exec;
pub mod scope;

pub use engine::{Engine, Handle, HandleKind, Query, RawHandle, Row, Rows, Value};
pub use scope::{current_scope, ScopeKind, ScopedEngine};

/// Error type shared across the engine boundary and the scoping layer.
#[derive(Debug, thiserror::Error)]
pub enum DbError {
    /// An operation required an atomic scope but none was active.
    #[error("no atomic scope is active")]
    NoAtomicScope,
    /// An explicit handle was supplied where a transaction-bound handle is
    /// required, but it was a plain connection.
    #[error("handle is not transaction-bound")]
    NonTransactionalHandle,
    /// Opaque failure from the underlying database engine, surfaced unchanged.
    #[error("engine error")]
    Engine {
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },
    /// A rollback itself failed; the transaction's final state is unknown.
    #[error("rollback failed; transaction state unknown")]
    RollbackFailed {
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },
    /// Error while mapping a result row or scalar.
    #[error("mapping error")]
    Mapping {
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },
    /// Error raised by business logic running inside a scope.
    #[error("business error")]
    Business {
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },
}

impl DbError {
    /// Wrap an engine/driver error.
    pub fn engine<E>(e: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        DbError::Engine {
            source: Box::new(e),
        }
    }

    /// Wrap a row-mapping error.
    pub fn mapping<E>(e: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        DbError::Mapping {
            source: Box::new(e),
        }
    }

    /// Wrap an error raised by business logic.
    pub fn business<E>(e: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        DbError::Business {
            source: Box::new(e),
        }
    }
}

/// Convenience alias for results returned by scoped operations.
pub type DbResult<T> = Result<T, DbError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display_messages() {
        assert_eq!(format!("{}", DbError::NoAtomicScope), "no atomic scope is active");
        assert_eq!(
            format!("{}", DbError::NonTransactionalHandle),
            "handle is not transaction-bound"
        );
        let e = DbError::engine(std::io::Error::new(std::io::ErrorKind::Other, "down"));
        assert_eq!(format!("{}", e), "engine error");
        let b = DbError::business(std::io::Error::new(std::io::ErrorKind::Other, "bad"));
        assert_eq!(format!("{}", b), "business error");
    }

    #[test]
    fn error_sources_are_preserved() {
        use std::error::Error as _;
        let e = DbError::engine(std::io::Error::new(std::io::ErrorKind::Other, "down"));
        assert_eq!(e.source().unwrap().to_string(), "down");
    }
}
