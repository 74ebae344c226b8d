//! Result rows and typed value extraction.

use std::sync::Arc;

use crate::error::{Error, Result};
use crate::value::Value;

/// Column metadata shared across all rows of one result set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnInfo {
    names: Vec<String>,
}

impl ColumnInfo {
    pub fn new(names: Vec<String>) -> Self {
        Self { names }
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }

    pub fn index_of(&self, name: &str) -> Option<usize> {
        self.names.iter().position(|n| n == name)
    }

    pub fn names(&self) -> &[String] {
        &self.names
    }
}

/// A single result row.
#[derive(Debug, Clone, PartialEq)]
pub struct Row {
    columns: Arc<ColumnInfo>,
    values: Vec<Value>,
}

impl Row {
    /// Build a row from column names and values.
    ///
    /// Prefer [`Row::with_columns`] when producing many rows of the
    /// same shape, so the column metadata is allocated once.
    pub fn new(column_names: Vec<String>, values: Vec<Value>) -> Self {
        Self {
            columns: Arc::new(ColumnInfo::new(column_names)),
            values,
        }
    }

    pub fn with_columns(columns: Arc<ColumnInfo>, values: Vec<Value>) -> Self {
        Self { columns, values }
    }

    pub fn column_info(&self) -> Arc<ColumnInfo> {
        Arc::clone(&self.columns)
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Get a value by position.
    pub fn get(&self, index: usize) -> Option<&Value> {
        self.values.get(index)
    }

    /// Get a value by column name.
    pub fn get_by_name(&self, name: &str) -> Option<&Value> {
        self.columns.index_of(name).and_then(|i| self.values.get(i))
    }

    /// Get a value by position, converted to `T`.
    pub fn get_as<T: FromValue>(&self, index: usize) -> Result<T> {
        let value = self.values.get(index).ok_or_else(|| Error::Type {
            expected: T::type_name(),
            actual: "missing",
            column: format!("#{index}"),
        })?;
        T::from_value(value, &format!("#{index}"))
    }

    /// Get a value by column name, converted to `T`.
    pub fn get_named<T: FromValue>(&self, name: &str) -> Result<T> {
        let value = self.get_by_name(name).ok_or_else(|| Error::Type {
            expected: T::type_name(),
            actual: "missing",
            column: name.to_string(),
        })?;
        T::from_value(value, name)
    }

    pub fn column_names(&self) -> impl Iterator<Item = &str> {
        self.columns.names.iter().map(String::as_str)
    }

    pub fn values(&self) -> impl Iterator<Item = &Value> {
        self.values.iter()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.column_names().zip(self.values.iter())
    }
}

/// Conversion from a dynamic [`Value`] into a concrete Rust type.
pub trait FromValue: Sized {
    fn from_value(value: &Value, column: &str) -> Result<Self>;
    fn type_name() -> &'static str;
}

fn type_error<T: FromValue>(value: &Value, column: &str) -> Error {
    Error::Type {
        expected: T::type_name(),
        actual: value.type_name(),
        column: column.to_string(),
    }
}

impl FromValue for bool {
    fn from_value(value: &Value, column: &str) -> Result<Self> {
        value.as_bool().ok_or_else(|| type_error::<Self>(value, column))
    }
    fn type_name() -> &'static str {
        "bool"
    }
}

impl FromValue for i32 {
    fn from_value(value: &Value, column: &str) -> Result<Self> {
        match value {
            Value::Int(v) => Ok(*v),
            Value::BigInt(v) => i32::try_from(*v).map_err(|_| type_error::<Self>(value, column)),
            _ => Err(type_error::<Self>(value, column)),
        }
    }
    fn type_name() -> &'static str {
        "i32"
    }
}

impl FromValue for i64 {
    fn from_value(value: &Value, column: &str) -> Result<Self> {
        value.as_i64().ok_or_else(|| type_error::<Self>(value, column))
    }
    fn type_name() -> &'static str {
        "i64"
    }
}

impl FromValue for f64 {
    fn from_value(value: &Value, column: &str) -> Result<Self> {
        value.as_f64().ok_or_else(|| type_error::<Self>(value, column))
    }
    fn type_name() -> &'static str {
        "f64"
    }
}

impl FromValue for String {
    fn from_value(value: &Value, column: &str) -> Result<Self> {
        match value {
            Value::Text(s) => Ok(s.clone()),
            _ => Err(type_error::<Self>(value, column)),
        }
    }
    fn type_name() -> &'static str {
        "String"
    }
}

impl FromValue for Value {
    fn from_value(value: &Value, _column: &str) -> Result<Self> {
        Ok(value.clone())
    }
    fn type_name() -> &'static str {
        "Value"
    }
}

impl<T: FromValue> FromValue for Option<T> {
    fn from_value(value: &Value, column: &str) -> Result<Self> {
        if value.is_null() {
            Ok(None)
        } else {
            T::from_value(value, column).map(Some)
        }
    }
    fn type_name() -> &'static str {
        "Option"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Row {
        Row::new(
            vec!["id".into(), "title".into(), "finished".into(), "version".into()],
            vec![
                Value::BigInt(1),
                Value::Text("write tests".into()),
                Value::Bool(false),
                Value::BigInt(0),
            ],
        )
    }

    #[test]
    fn access_by_name_and_index() {
        let row = sample();
        assert_eq!(row.get(0), Some(&Value::BigInt(1)));
        assert_eq!(row.get_by_name("title"), Some(&Value::Text("write tests".into())));
        assert_eq!(row.get_by_name("missing"), None);
    }

    #[test]
    fn typed_extraction() {
        let row = sample();
        assert_eq!(row.get_named::<i64>("id").unwrap(), 1);
        assert_eq!(row.get_named::<String>("title").unwrap(), "write tests");
        assert!(!row.get_named::<bool>("finished").unwrap());
        assert_eq!(row.get_named::<i64>("version").unwrap(), 0);
    }

    #[test]
    fn type_mismatch_reports_column() {
        let row = sample();
        let err = row.get_named::<bool>("title").unwrap_err();
        let Error::Type { column, .. } = err else {
            panic!("wrong variant");
        };
        assert_eq!(column, "title");
    }

    #[test]
    fn option_extraction() {
        let row = Row::new(vec!["deadline".into()], vec![Value::Null]);
        assert_eq!(row.get_named::<Option<i64>>("deadline").unwrap(), None);
    }

    #[test]
    fn shared_column_info() {
        let columns = Arc::new(ColumnInfo::new(vec!["id".into()]));
        let a = Row::with_columns(Arc::clone(&columns), vec![Value::BigInt(1)]);
        let b = Row::with_columns(columns, vec![Value::BigInt(2)]);
        assert!(Arc::ptr_eq(&a.column_info(), &b.column_info()));
    }
}
