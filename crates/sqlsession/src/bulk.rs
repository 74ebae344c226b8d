//! Set-based UPDATE/DELETE gateway.
//!
//! Bulk statements bypass the identity map and change tracker
//! entirely: they run one statement against storage and return the
//! affected-row count. Bulk updates always bump the version column in
//! the same statement, keeping the optimistic-lock invariant for rows
//! this session never loaded. Already-loaded instances keep their
//! stale in-memory state unless the caller uses the session's
//! cache-invalidating variants.
//!
//! Filters are written with `?` markers and rewritten to the
//! connection's placeholder style at render time.

use std::marker::PhantomData;

use sqlsession_core::{Dialect, Entity, Error, Result, Value};

/// Builder for a set-based UPDATE.
pub struct BulkUpdate<E: Entity> {
    sets: Vec<(&'static str, Value)>,
    filter: Option<String>,
    filter_params: Vec<Value>,
    _entity: PhantomData<E>,
}

impl<E: Entity> Default for BulkUpdate<E> {
    fn default() -> Self {
        Self::new()
    }
}

impl<E: Entity> BulkUpdate<E> {
    pub fn new() -> Self {
        Self {
            sets: Vec::new(),
            filter: None,
            filter_params: Vec::new(),
            _entity: PhantomData,
        }
    }

    /// Set a column to a value on every matched row.
    pub fn set(mut self, column: &'static str, value: impl Into<Value>) -> Self {
        self.sets.push((column, value.into()));
        self
    }

    /// Restrict the update with a raw predicate using `?` markers.
    pub fn filter(mut self, predicate: impl Into<String>, params: Vec<Value>) -> Self {
        self.filter = Some(predicate.into());
        self.filter_params = params;
        self
    }

    /// Render the statement and parameter list.
    pub(crate) fn render(&self, dialect: Dialect) -> Result<(String, Vec<Value>)> {
        if self.sets.is_empty() {
            return Err(Error::invalid_state(format!(
                "bulk update on {} has no SET clauses",
                E::TABLE
            )));
        }
        if self.sets.iter().any(|(c, _)| *c == E::VERSION_COLUMN) {
            return Err(Error::invalid_state(format!(
                "bulk update on {} must not set the version column explicitly",
                E::TABLE
            )));
        }
        let mut params: Vec<Value> = Vec::with_capacity(self.sets.len() + self.filter_params.len());
        let mut sets: Vec<String> = Vec::with_capacity(self.sets.len() + 1);
        for (i, (column, value)) in self.sets.iter().enumerate() {
            sets.push(format!("\"{}\" = {}", column, dialect.placeholder(i + 1)));
            params.push(value.clone());
        }
        // The version bump rides along in the same statement.
        sets.push(format!(
            "\"{v}\" = \"{v}\" + 1",
            v = E::VERSION_COLUMN
        ));
        let mut sql = format!("UPDATE \"{}\" SET {}", E::TABLE, sets.join(", "));
        if let Some(filter) = &self.filter {
            let rewritten = rewrite_markers(filter, dialect, self.sets.len());
            sql.push_str(" WHERE ");
            sql.push_str(&rewritten);
            params.extend(self.filter_params.iter().cloned());
        }
        Ok((sql, params))
    }
}

/// Builder for a set-based DELETE.
pub struct BulkDelete<E: Entity> {
    filter: Option<String>,
    filter_params: Vec<Value>,
    _entity: PhantomData<E>,
}

impl<E: Entity> Default for BulkDelete<E> {
    fn default() -> Self {
        Self::new()
    }
}

impl<E: Entity> BulkDelete<E> {
    pub fn new() -> Self {
        Self {
            filter: None,
            filter_params: Vec::new(),
            _entity: PhantomData,
        }
    }

    /// Restrict the delete with a raw predicate using `?` markers.
    pub fn filter(mut self, predicate: impl Into<String>, params: Vec<Value>) -> Self {
        self.filter = Some(predicate.into());
        self.filter_params = params;
        self
    }

    pub(crate) fn render(&self, dialect: Dialect) -> Result<(String, Vec<Value>)> {
        let mut sql = format!("DELETE FROM \"{}\"", E::TABLE);
        let mut params = Vec::new();
        if let Some(filter) = &self.filter {
            sql.push_str(" WHERE ");
            sql.push_str(&rewrite_markers(filter, dialect, 0));
            params.extend(self.filter_params.iter().cloned());
        }
        Ok((sql, params))
    }
}

/// Rewrite `?` markers in a raw predicate to the dialect's placeholder
/// style, continuing the numbering after `offset` already-used
/// placeholders. Quoted string literals in the predicate are left
/// untouched.
fn rewrite_markers(predicate: &str, dialect: Dialect, offset: usize) -> String {
    let mut out = String::with_capacity(predicate.len());
    let mut index = offset;
    let mut in_literal = false;
    for ch in predicate.chars() {
        match ch {
            '\'' => {
                in_literal = !in_literal;
                out.push(ch);
            }
            '?' if !in_literal => {
                index += 1;
                out.push_str(&dialect.placeholder(index));
            }
            _ => out.push(ch),
        }
    }
    out
}
