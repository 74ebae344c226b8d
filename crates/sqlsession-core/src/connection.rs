//! Database connection abstraction.
//!
//! All operations are async, take a `Cx` context for cancellation
//! support, and return `Outcome` so cancellation is distinguishable
//! from failure. Implementations must be `Send + Sync`.

use asupersync::{Cx, Outcome};

use crate::error::Result;
use crate::row::Row;
use crate::value::Value;

/// SQL dialect, as far as the session layer needs it: placeholder
/// style and row-locking clauses. Exact locking SQL is
/// engine-specific, so the mapping lives behind this narrow surface.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Dialect {
    /// PostgreSQL: `FOR UPDATE` / `FOR SHARE`, both with `NOWAIT`.
    #[default]
    Postgres,
    /// MySQL/InnoDB: `FOR UPDATE` / `LOCK IN SHARE MODE`.
    MySql,
    /// SQLite: no row-level locks; locking clauses render empty and
    /// the engine's database-level locking applies instead.
    Sqlite,
}

impl Dialect {
    /// Whether the engine has a shared (read) row lock. Engines
    /// without one get the exclusive clause instead when a shared
    /// lock is requested.
    pub const fn supports_shared_locks(&self) -> bool {
        matches!(self, Dialect::Postgres | Dialect::MySql)
    }

    /// Whether the engine can fail lock acquisition immediately
    /// instead of blocking.
    pub const fn supports_nowait(&self) -> bool {
        matches!(self, Dialect::Postgres | Dialect::MySql)
    }

    /// Clause appended to a SELECT to take an exclusive row lock.
    pub const fn exclusive_lock_clause(&self, nowait: bool) -> &'static str {
        match self {
            Dialect::Postgres | Dialect::MySql => {
                if nowait {
                    " FOR UPDATE NOWAIT"
                } else {
                    " FOR UPDATE"
                }
            }
            Dialect::Sqlite => "",
        }
    }

    /// Generate a parameter placeholder for the given 1-based index.
    pub fn placeholder(&self, index: usize) -> String {
        match self {
            Dialect::Postgres => format!("${index}"),
            Dialect::MySql => "?".to_string(),
            Dialect::Sqlite => format!("?{index}"),
        }
    }

    /// Clause appended to a SELECT to take a shared row lock.
    pub const fn shared_lock_clause(&self, nowait: bool) -> &'static str {
        match self {
            Dialect::Postgres => {
                if nowait {
                    " FOR SHARE NOWAIT"
                } else {
                    " FOR SHARE"
                }
            }
            Dialect::MySql => " LOCK IN SHARE MODE",
            Dialect::Sqlite => "",
        }
    }
}

/// A database connection.
///
/// The session issues transaction control (`BEGIN`/`COMMIT`/
/// `ROLLBACK`) through [`Connection::execute`]; a connection is
/// exclusively owned by one transaction at a time.
pub trait Connection: Send + Sync {
    /// The dialect this connection speaks.
    fn dialect(&self) -> Dialect;

    /// Execute a query returning rows.
    fn query(
        &self,
        cx: &Cx,
        sql: &str,
        params: &[Value],
    ) -> impl Future<Output = Outcome<Vec<Row>, crate::Error>> + Send;

    /// Execute a query returning at most one row.
    fn query_one(
        &self,
        cx: &Cx,
        sql: &str,
        params: &[Value],
    ) -> impl Future<Output = Outcome<Option<Row>, crate::Error>> + Send;

    /// Execute a statement returning the affected row count.
    fn execute(
        &self,
        cx: &Cx,
        sql: &str,
        params: &[Value],
    ) -> impl Future<Output = Outcome<u64, crate::Error>> + Send;

    /// Check the connection is alive.
    fn ping(&self, cx: &Cx) -> impl Future<Output = Outcome<(), crate::Error>> + Send;

    /// Close the connection, releasing resources.
    fn close(self, cx: &Cx) -> impl Future<Output = Result<()>> + Send;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn postgres_lock_clauses() {
        let d = Dialect::Postgres;
        assert_eq!(d.exclusive_lock_clause(false), " FOR UPDATE");
        assert_eq!(d.exclusive_lock_clause(true), " FOR UPDATE NOWAIT");
        assert_eq!(d.shared_lock_clause(false), " FOR SHARE");
        assert!(d.supports_shared_locks());
    }

    #[test]
    fn mysql_shared_lock_is_legacy_syntax() {
        assert_eq!(Dialect::MySql.shared_lock_clause(false), " LOCK IN SHARE MODE");
    }

    #[test]
    fn placeholders_per_dialect() {
        assert_eq!(Dialect::Postgres.placeholder(2), "$2");
        assert_eq!(Dialect::MySql.placeholder(2), "?");
        assert_eq!(Dialect::Sqlite.placeholder(2), "?2");
    }

    #[test]
    fn sqlite_has_no_row_locks() {
        let d = Dialect::Sqlite;
        assert!(!d.supports_shared_locks());
        assert!(!d.supports_nowait());
        assert_eq!(d.exclusive_lock_clause(true), "");
    }
}
