//! Column metadata for entity mapping.
//!
//! Mapping is explicit and hand-written per entity type: each entity
//! declares a static field list that is validated once at session
//! construction, never reflected at runtime.

/// SQL column type, as far as this layer needs to know it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SqlType {
    Boolean,
    Integer,
    BigInt,
    Double,
    Text,
    Blob,
    Date,
    Timestamp,
    Uuid,
    Json,
}

impl SqlType {
    pub const fn as_sql(&self) -> &'static str {
        match self {
            SqlType::Boolean => "BOOLEAN",
            SqlType::Integer => "INTEGER",
            SqlType::BigInt => "BIGINT",
            SqlType::Double => "DOUBLE PRECISION",
            SqlType::Text => "TEXT",
            SqlType::Blob => "BLOB",
            SqlType::Date => "DATE",
            SqlType::Timestamp => "TIMESTAMP",
            SqlType::Uuid => "UUID",
            SqlType::Json => "JSON",
        }
    }
}

/// Metadata about one mapped column.
#[derive(Debug, Clone)]
pub struct FieldInfo {
    /// Rust field name.
    pub name: &'static str,
    /// Database column name (may differ from the field name).
    pub column: &'static str,
    /// SQL type of the column.
    pub sql_type: SqlType,
    /// Whether the column accepts NULL.
    pub nullable: bool,
    /// Whether this is the primary key column.
    pub primary_key: bool,
    /// Whether this is the optimistic-lock version column.
    pub version: bool,
    /// Whether the column carries a unique constraint.
    pub unique: bool,
}

impl FieldInfo {
    /// A plain, non-key, non-nullable column.
    pub const fn new(name: &'static str, column: &'static str, sql_type: SqlType) -> Self {
        Self {
            name,
            column,
            sql_type,
            nullable: false,
            primary_key: false,
            version: false,
            unique: false,
        }
    }

    pub const fn nullable(mut self) -> Self {
        self.nullable = true;
        self
    }

    pub const fn primary_key(mut self) -> Self {
        self.primary_key = true;
        self
    }

    pub const fn version(mut self) -> Self {
        self.version = true;
        self
    }

    pub const fn unique(mut self) -> Self {
        self.unique = true;
        self
    }
}
