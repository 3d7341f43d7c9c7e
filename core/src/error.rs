//! Public error types.
//!
//! Every fallible operation in the core surfaces one of these two enums (or,
//! at the facade boundary, a `hierarchidb_proto::ErrorCode` — see `code()`
//! below for the mapping). Storage-backend-specific failures are wrapped in
//! `StorageError::Other` rather than growing this enum per backend.

use hierarchidb_proto::ErrorCode;
use thiserror::Error;

/// Failure modes raised by a `KeyValueStore` implementation (§4.1).
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("database error: {0}")]
    Database(String),

    #[error("optimistic concurrency conflict")]
    StaleVersion,

    #[error("unique index violation on {store}.{index}")]
    NameNotUnique { store: String, index: String },

    #[error("object store {0} is not declared")]
    UnknownStore(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Core-wide error type returned by the mutation, query, working-copy and
/// subscription services. Carries the same taxonomy the facade exposes to
/// callers (§7), so the conversion to `ErrorCode` is total and lossless for
/// the cases callers are meant to branch on.
#[derive(Debug, Error)]
pub enum CoreError {
    #[error("name not unique")]
    NameNotUnique,

    #[error("stale version")]
    StaleVersion,

    #[error("node has inbound references")]
    HasInboundRefs,

    #[error("illegal relation: {0}")]
    IllegalRelation(String),

    #[error("node not found")]
    NodeNotFound,

    #[error("invalid operation: {0}")]
    InvalidOperation(String),

    #[error("working copy not found")]
    WorkingCopyNotFound,

    #[error("commit conflict")]
    CommitConflict,

    #[error("validation error: {0}")]
    Validation(String),

    #[error("database error: {0}")]
    Database(String),
}

impl CoreError {
    pub fn code(&self) -> ErrorCode {
        match self {
            CoreError::NameNotUnique => ErrorCode::NameNotUnique,
            CoreError::StaleVersion => ErrorCode::StaleVersion,
            CoreError::HasInboundRefs => ErrorCode::HasInboundRefs,
            CoreError::IllegalRelation(_) => ErrorCode::IllegalRelation,
            CoreError::NodeNotFound => ErrorCode::NodeNotFound,
            CoreError::InvalidOperation(_) => ErrorCode::InvalidOperation,
            CoreError::WorkingCopyNotFound => ErrorCode::WorkingCopyNotFound,
            CoreError::CommitConflict => ErrorCode::CommitConflict,
            CoreError::Validation(_) => ErrorCode::ValidationError,
            CoreError::Database(_) => ErrorCode::DatabaseError,
        }
    }
}

impl From<StorageError> for CoreError {
    fn from(err: StorageError) -> Self {
        match err {
            StorageError::StaleVersion => CoreError::StaleVersion,
            StorageError::NameNotUnique { .. } => CoreError::NameNotUnique,
            other => CoreError::Database(other.to_string()),
        }
    }
}

pub type CoreResult<T> = Result<T, CoreError>;
