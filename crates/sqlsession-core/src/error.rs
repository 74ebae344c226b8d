//! Error types for sqlsession.
//!
//! A single [`Error`] enum covers the whole layer. Concurrency-control
//! failures get structured payloads so callers can implement retry
//! policy themselves; nothing in this crate retries internally.

use std::fmt;

use crate::value::Value;

/// Result alias used throughout sqlsession.
pub type Result<T> = std::result::Result<T, Error>;

/// Classification of a query failure, as reported by the driver.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryErrorKind {
    /// SQL syntax error.
    Syntax,
    /// A uniqueness or other storage-level constraint was violated.
    Constraint,
    /// The engine reported a deadlock and chose this session as victim.
    Deadlock,
    /// A row lock could not be acquired within the requested timeout
    /// (e.g. `NOWAIT` on an already-locked row).
    LockTimeout,
    /// Statement execution timed out.
    Timeout,
    /// Anything else.
    Other,
}

impl QueryErrorKind {
    pub const fn as_str(&self) -> &'static str {
        match self {
            QueryErrorKind::Syntax => "syntax",
            QueryErrorKind::Constraint => "constraint",
            QueryErrorKind::Deadlock => "deadlock",
            QueryErrorKind::LockTimeout => "lock timeout",
            QueryErrorKind::Timeout => "timeout",
            QueryErrorKind::Other => "other",
        }
    }
}

/// A failed statement, with the driver's classification.
#[derive(Debug)]
pub struct QueryError {
    pub kind: QueryErrorKind,
    pub message: String,
    /// The statement that failed, when available.
    pub sql: Option<String>,
}

/// Version mismatch detected by a version-checked write or a deferred
/// re-validation. Carries the entity's identity so the caller can
/// reload and retry.
#[derive(Debug, Clone, PartialEq)]
pub struct OptimisticLockError {
    /// Table of the entity the conflict was detected on.
    pub entity: &'static str,
    /// Primary key of the conflicting row.
    pub key: Value,
    /// The version this session expected to find in storage.
    pub expected_version: i64,
}

/// A row lock could not be acquired within the requested timeout.
#[derive(Debug, Clone, PartialEq)]
pub struct PessimisticLockError {
    pub entity: &'static str,
    pub key: Value,
}

/// Operation requested against an entity in a state that forbids it,
/// e.g. saving an entity already removed in the current unit of work.
/// Always a programming error; never retried.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InvalidStateError {
    pub message: String,
}

/// The layer's error type.
#[derive(Debug)]
pub enum Error {
    /// Connection-level failure (connect, tls, protocol).
    Connection(String),
    /// A statement failed at the engine.
    Query(QueryError),
    /// Transaction control statement failed.
    Transaction(String),
    /// A value could not be converted to the requested Rust type.
    Type { expected: &'static str, actual: &'static str, column: String },
    /// An operation required an existing row and none was found.
    NotFound { entity: &'static str, key: Value },
    /// Optimistic concurrency conflict.
    OptimisticLock(OptimisticLockError),
    /// Pessimistic lock acquisition failed within the timeout.
    PessimisticLock(PessimisticLockError),
    /// Invalid entity state for the requested operation.
    InvalidState(InvalidStateError),
    /// Storage-level constraint violation, surfaced as-is.
    Constraint { message: String, constraint: Option<String> },
    /// Serialization failure (snapshots, json columns).
    Serde(String),
    /// Underlying I/O failure.
    Io(String),
    /// Operation was cancelled.
    Cancelled(String),
    /// Escape hatch for callers layering on top.
    Custom(String),
}

impl Error {
    /// Build a query error with the given kind.
    pub fn query(kind: QueryErrorKind, message: impl Into<String>) -> Self {
        Error::Query(QueryError { kind, message: message.into(), sql: None })
    }

    /// Build a query error that records the failing statement.
    pub fn query_with_sql(
        kind: QueryErrorKind,
        message: impl Into<String>,
        sql: impl Into<String>,
    ) -> Self {
        Error::Query(QueryError { kind, message: message.into(), sql: Some(sql.into()) })
    }

    pub fn not_found(entity: &'static str, key: Value) -> Self {
        Error::NotFound { entity, key }
    }

    pub fn optimistic_lock(entity: &'static str, key: Value, expected_version: i64) -> Self {
        Error::OptimisticLock(OptimisticLockError { entity, key, expected_version })
    }

    pub fn pessimistic_lock(entity: &'static str, key: Value) -> Self {
        Error::PessimisticLock(PessimisticLockError { entity, key })
    }

    pub fn invalid_state(message: impl Into<String>) -> Self {
        Error::InvalidState(InvalidStateError { message: message.into() })
    }

    pub fn constraint(message: impl Into<String>, constraint: Option<String>) -> Self {
        Error::Constraint { message: message.into(), constraint }
    }

    /// Whether a caller could reasonably retry the failed operation
    /// after reloading state. Conflicts and lock timeouts are
    /// retryable; programming errors and constraint violations are not.
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::OptimisticLock(_) | Error::PessimisticLock(_) | Error::Connection(_) => true,
            Error::Query(q) => matches!(
                q.kind,
                QueryErrorKind::Deadlock | QueryErrorKind::LockTimeout | QueryErrorKind::Timeout
            ),
            _ => false,
        }
    }

    /// Whether this error is a concurrency-control conflict
    /// (optimistic or pessimistic).
    pub fn is_lock_conflict(&self) -> bool {
        matches!(self, Error::OptimisticLock(_) | Error::PessimisticLock(_))
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Connection(msg) => write!(f, "connection error: {msg}"),
            Error::Query(q) => {
                write!(f, "query error ({}): {}", q.kind.as_str(), q.message)?;
                if let Some(sql) = &q.sql {
                    write!(f, " in statement: {sql}")?;
                }
                Ok(())
            }
            Error::Transaction(msg) => write!(f, "transaction error: {msg}"),
            Error::Type { expected, actual, column } => {
                write!(f, "type error: column '{column}' is {actual}, expected {expected}")
            }
            Error::NotFound { entity, key } => {
                write!(f, "no row found for {entity}#{}", key.display())
            }
            Error::OptimisticLock(e) => write!(
                f,
                "optimistic lock failure on {}#{}: expected version {}",
                e.entity,
                e.key.display(),
                e.expected_version
            ),
            Error::PessimisticLock(e) => write!(
                f,
                "could not acquire lock on {}#{} within the requested timeout",
                e.entity,
                e.key.display()
            ),
            Error::InvalidState(e) => write!(f, "invalid state: {}", e.message),
            Error::Constraint { message, constraint } => {
                write!(f, "constraint violation: {message}")?;
                if let Some(name) = constraint {
                    write!(f, " (constraint: {name})")?;
                }
                Ok(())
            }
            Error::Serde(msg) => write!(f, "serialization error: {msg}"),
            Error::Io(msg) => write!(f, "io error: {msg}"),
            Error::Cancelled(msg) => write!(f, "cancelled: {msg}"),
            Error::Custom(msg) => write!(f, "{msg}"),
        }
    }
}

impl std::error::Error for Error {}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::Io(err.to_string())
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Serde(err.to_string())
    }
}
