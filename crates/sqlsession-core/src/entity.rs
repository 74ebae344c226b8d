//! The `Entity` trait: explicit struct-to-table mapping with a
//! version column for optimistic concurrency control.

use crate::error::{Error, Result};
use crate::field::FieldInfo;
use crate::row::Row;
use crate::value::Value;

/// A struct mapped to a single table row.
///
/// Every entity carries an opaque primary key, assigned once at first
/// persist and immutable thereafter, and a non-negative `version`
/// counter starting at 0. Version-checked writes bump the version by
/// exactly 1; force-increment lock modes bump it independently.
///
/// Mapping is hand-written: `to_row` and `from_row` must agree with
/// `fields()`, which [`validate_mapping`] checks once at startup.
pub trait Entity: Clone + Send + Sync + 'static {
    /// Table this entity maps to.
    const TABLE: &'static str;

    /// Primary key column name.
    const PRIMARY_KEY: &'static str;

    /// Optimistic-lock version column name.
    const VERSION_COLUMN: &'static str = "version";

    /// Static column metadata, in statement order.
    fn fields() -> &'static [FieldInfo];

    /// Current column/value pairs, in `fields()` order, including the
    /// primary key and version columns.
    fn to_row(&self) -> Vec<(&'static str, Value)>;

    /// Rebuild an entity from a result row.
    fn from_row(row: &Row) -> Result<Self>;

    /// Current primary key value; `Value::Null` while unassigned.
    fn primary_key(&self) -> Value;

    /// Assign the primary key. Called exactly once, at first persist.
    fn set_primary_key(&mut self, key: Value);

    /// Current version counter.
    fn version(&self) -> i64;

    /// Overwrite the version counter after a successful version bump.
    fn set_version(&mut self, version: i64);

    /// Whether this entity has never been persisted.
    fn is_new(&self) -> bool {
        self.primary_key().is_null()
    }
}

/// Check that an entity's static metadata is internally consistent:
/// exactly one primary key column matching `PRIMARY_KEY`, exactly one
/// version column matching `VERSION_COLUMN`, no duplicate columns.
///
/// The session layer runs this once per entity type, on first touch,
/// for cheap early failure instead of malformed SQL later.
pub fn validate_mapping<E: Entity>() -> Result<()> {
    let fields = E::fields();
    let mut pk = None;
    let mut version = None;
    for (i, field) in fields.iter().enumerate() {
        if fields[..i].iter().any(|f| f.column == field.column) {
            return Err(Error::invalid_state(format!(
                "entity {}: duplicate column '{}'",
                E::TABLE,
                field.column
            )));
        }
        if field.primary_key {
            if pk.is_some() {
                return Err(Error::invalid_state(format!(
                    "entity {}: more than one primary key column",
                    E::TABLE
                )));
            }
            pk = Some(field.column);
        }
        if field.version {
            if version.is_some() {
                return Err(Error::invalid_state(format!(
                    "entity {}: more than one version column",
                    E::TABLE
                )));
            }
            version = Some(field.column);
        }
    }
    if pk != Some(E::PRIMARY_KEY) {
        return Err(Error::invalid_state(format!(
            "entity {}: primary key metadata does not match PRIMARY_KEY ('{}')",
            E::TABLE,
            E::PRIMARY_KEY
        )));
    }
    if version != Some(E::VERSION_COLUMN) {
        return Err(Error::invalid_state(format!(
            "entity {}: version metadata does not match VERSION_COLUMN ('{}')",
            E::TABLE,
            E::VERSION_COLUMN
        )));
    }
    Ok(())
}

/// Supplies primary keys for entities persisted without one.
///
/// Key generation is external to the session: sequences, uuids, and
/// application-side counters all fit behind this trait.
pub trait KeyGenerator: Send {
    fn next_key(&mut self) -> Value;
}

/// Monotonic `BigInt` keys. The default generator; suitable for tests
/// and for applications that pre-assign their own keys.
#[derive(Debug)]
pub struct SequentialKeys {
    next: i64,
}

impl SequentialKeys {
    pub fn starting_at(next: i64) -> Self {
        Self { next }
    }
}

impl Default for SequentialKeys {
    fn default() -> Self {
        Self { next: 1 }
    }
}

impl KeyGenerator for SequentialKeys {
    fn next_key(&mut self) -> Value {
        let key = self.next;
        self.next += 1;
        Value::BigInt(key)
    }
}
