use std::fmt::Debug;

use sea_orm::{DbErr, RuntimeErr, SqlErr};
use thiserror::Error;

/// Errors returned by the closure-table APIs.
#[derive(Debug, Error)]
pub enum ClosureTableError {
    #[error("closure-table supports PostgreSQL and SQLite connections only")]
    UnsupportedBackend,

    /// The node has no self-row in the closure table.
    #[error("node {0} is not attached to the closure table")]
    NotANode(String),

    #[error("node {0} not found")]
    NotFound(String),

    #[error("moving node {node} under {target} would make it its own ancestor")]
    CycleDetected { node: String, target: String },

    /// The store rejected an engine transaction; it has been rolled back.
    #[error("transaction failed: {0}")]
    TransactionFailure(#[source] DbErr),

    #[error("invalid closure-table configuration: {0}")]
    InvalidConfiguration(String),

    #[error("database error: {0}")]
    Database(#[from] DbErr),

    #[error("closure-table invariant violation: {0}")]
    Invariant(String),
}

impl ClosureTableError {
    pub fn not_a_node(key: &impl Debug) -> Self {
        Self::NotANode(format!("{key:?}"))
    }

    pub fn not_found(key: &impl Debug) -> Self {
        Self::NotFound(format!("{key:?}"))
    }

    pub fn cycle(node: &impl Debug, target: &impl Debug) -> Self {
        Self::CycleDetected {
            node: format!("{node:?}"),
            target: format!("{target:?}"),
        }
    }

    pub fn invalid_configuration(detail: impl Into<String>) -> Self {
        Self::InvalidConfiguration(detail.into())
    }

    pub fn invariant(detail: impl Into<String>) -> Self {
        Self::Invariant(detail.into())
    }

    /// Re-tag a storage error raised inside an engine transaction.
    pub(crate) fn into_transaction_failure(self) -> Self {
        match self {
            Self::Database(err) => Self::TransactionFailure(err),
            other => other,
        }
    }

    /// Whether a caller may retry the operation that produced this error.
    ///
    /// True for losing concurrent writers: unique-constraint violations on
    /// `(ancestor, descendant)`, PostgreSQL serialization failures and
    /// deadlocks, and SQLite busy/locked errors.
    pub fn is_retryable(&self) -> bool {
        let err = match self {
            Self::TransactionFailure(err) | Self::Database(err) => err,
            _ => return false,
        };

        if matches!(err.sql_err(), Some(SqlErr::UniqueConstraintViolation(_))) {
            return true;
        }

        let runtime = match err {
            DbErr::Exec(runtime) | DbErr::Query(runtime) | DbErr::Conn(runtime) => runtime,
            _ => return false,
        };
        match runtime {
            RuntimeErr::SqlxError(sqlx::Error::Database(db_err)) => matches!(
                db_err.code().as_deref(),
                Some("40001" | "40P01" | "5" | "6" | "517")
            ),
            _ => false,
        }
    }
}
