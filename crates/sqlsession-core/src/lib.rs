//! Core types and traits for sqlsession.
//!
//! This crate provides the foundational abstractions for the session
//! layer:
//!
//! - `Entity` trait for explicit struct-to-table mapping with an
//!   optimistic-lock version column
//! - `Value` / `Row` dynamic SQL values and result rows
//! - `Connection` trait and the narrow `Dialect` locking interface
//! - the error taxonomy (`NotFound`, `OptimisticLock`,
//!   `PessimisticLock`, `InvalidState`, `Constraint`, ...)
//! - `Outcome` re-export from asupersync for cancel-correct operations

// Re-export asupersync primitives for structured concurrency
pub use asupersync::{Budget, Cx, Outcome, RegionId, TaskId};

pub mod connection;
pub mod entity;
pub mod error;
pub mod field;
pub mod row;
pub mod value;

pub use connection::{Connection, Dialect};
pub use entity::{Entity, KeyGenerator, SequentialKeys, validate_mapping};
pub use error::{
    Error, InvalidStateError, OptimisticLockError, PessimisticLockError, QueryError,
    QueryErrorKind, Result,
};
pub use field::{FieldInfo, SqlType};
pub use row::{ColumnInfo, FromValue, Row};
pub use value::Value;
