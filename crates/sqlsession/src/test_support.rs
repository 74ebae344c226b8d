//! Shared test doubles: entities and a scripted mock connection.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use asupersync::{Cx, Outcome};
use sqlsession_core::{
    Connection, Dialect, Entity, Error, FieldInfo, Result, Row, SqlType, Value,
};

#[derive(Debug, Clone, PartialEq)]
pub struct TestTask {
    pub id: Option<i64>,
    pub title: String,
    pub finished: bool,
    pub version: i64,
}

impl TestTask {
    pub fn new(title: &str) -> Self {
        Self {
            id: None,
            title: title.to_string(),
            finished: false,
            version: 0,
        }
    }

    pub fn with_id(id: i64, title: &str) -> Self {
        Self {
            id: Some(id),
            title: title.to_string(),
            finished: false,
            version: 0,
        }
    }

    /// A result row shaped like `SELECT <all columns> FROM "task"`.
    pub fn row(id: i64, title: &str, finished: bool, version: i64) -> Row {
        Row::new(
            vec!["id".into(), "title".into(), "finished".into(), "version".into()],
            vec![
                Value::BigInt(id),
                Value::Text(title.into()),
                Value::Bool(finished),
                Value::BigInt(version),
            ],
        )
    }

    /// A one-column row answering a `SELECT "version"` validation.
    pub fn version_row(version: i64) -> Row {
        Row::new(vec!["version".into()], vec![Value::BigInt(version)])
    }
}

impl Entity for TestTask {
    const TABLE: &'static str = "task";
    const PRIMARY_KEY: &'static str = "id";

    fn fields() -> &'static [FieldInfo] {
        const FIELDS: &[FieldInfo] = &[
            FieldInfo::new("id", "id", SqlType::BigInt).primary_key(),
            FieldInfo::new("title", "title", SqlType::Text),
            FieldInfo::new("finished", "finished", SqlType::Boolean),
            FieldInfo::new("version", "version", SqlType::BigInt).version(),
        ];
        FIELDS
    }

    fn to_row(&self) -> Vec<(&'static str, Value)> {
        vec![
            ("id", self.id.into()),
            ("title", self.title.clone().into()),
            ("finished", self.finished.into()),
            ("version", self.version.into()),
        ]
    }

    fn from_row(row: &Row) -> Result<Self> {
        Ok(Self {
            id: row.get_named("id")?,
            title: row.get_named("title")?,
            finished: row.get_named("finished")?,
            version: row.get_named("version")?,
        })
    }

    fn primary_key(&self) -> Value {
        self.id.into()
    }

    fn set_primary_key(&mut self, key: Value) {
        self.id = key.as_i64();
    }

    fn version(&self) -> i64 {
        self.version
    }

    fn set_version(&mut self, version: i64) {
        self.version = version;
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct TestMember {
    pub id: Option<i64>,
    pub login_id: String,
    pub version: i64,
}

impl TestMember {
    pub fn with_id(id: i64, login_id: &str) -> Self {
        Self {
            id: Some(id),
            login_id: login_id.to_string(),
            version: 0,
        }
    }
}

impl Entity for TestMember {
    const TABLE: &'static str = "member";
    const PRIMARY_KEY: &'static str = "id";

    fn fields() -> &'static [FieldInfo] {
        const FIELDS: &[FieldInfo] = &[
            FieldInfo::new("id", "id", SqlType::BigInt).primary_key(),
            FieldInfo::new("login_id", "login_id", SqlType::Text).unique(),
            FieldInfo::new("version", "version", SqlType::BigInt).version(),
        ];
        FIELDS
    }

    fn to_row(&self) -> Vec<(&'static str, Value)> {
        vec![
            ("id", self.id.into()),
            ("login_id", self.login_id.clone().into()),
            ("version", self.version.into()),
        ]
    }

    fn from_row(row: &Row) -> Result<Self> {
        Ok(Self {
            id: row.get_named("id")?,
            login_id: row.get_named("login_id")?,
            version: row.get_named("version")?,
        })
    }

    fn primary_key(&self) -> Value {
        self.id.into()
    }

    fn set_primary_key(&mut self, key: Value) {
        self.id = key.as_i64();
    }

    fn version(&self) -> i64 {
        self.version
    }

    fn set_version(&mut self, version: i64) {
        self.version = version;
    }
}

/// Scripted state behind [`MockConnection`].
///
/// Queries and executes are recorded with their parameters. Results
/// are popped from the front of the scripted queues; an empty queue
/// answers `Ok(vec![])` for queries and `Ok(1)` for executes.
#[derive(Default)]
pub struct MockState {
    pub queried: Vec<(String, Vec<Value>)>,
    pub executed: Vec<(String, Vec<Value>)>,
    pub query_results: VecDeque<Result<Vec<Row>>>,
    pub execute_results: VecDeque<Result<u64>>,
    pub dialect: Dialect,
}

impl MockState {
    pub fn push_rows(&mut self, rows: Vec<Row>) {
        self.query_results.push_back(Ok(rows));
    }

    pub fn push_query_error(&mut self, err: Error) {
        self.query_results.push_back(Err(err));
    }

    pub fn push_affected(&mut self, count: u64) {
        self.execute_results.push_back(Ok(count));
    }

    pub fn push_execute_error(&mut self, err: Error) {
        self.execute_results.push_back(Err(err));
    }
}

pub struct MockConnection {
    state: Arc<Mutex<MockState>>,
}

impl MockConnection {
    pub fn new(state: Arc<Mutex<MockState>>) -> Self {
        Self { state }
    }
}

impl Connection for MockConnection {
    fn dialect(&self) -> Dialect {
        self.state.lock().expect("lock poisoned").dialect
    }

    fn query(
        &self,
        _cx: &Cx,
        sql: &str,
        params: &[Value],
    ) -> impl Future<Output = Outcome<Vec<Row>, Error>> + Send {
        let result = {
            let mut state = self.state.lock().expect("lock poisoned");
            state.queried.push((sql.to_string(), params.to_vec()));
            state.query_results.pop_front().unwrap_or(Ok(Vec::new()))
        };
        async move {
            match result {
                Ok(rows) => Outcome::Ok(rows),
                Err(e) => Outcome::Err(e),
            }
        }
    }

    fn query_one(
        &self,
        cx: &Cx,
        sql: &str,
        params: &[Value],
    ) -> impl Future<Output = Outcome<Option<Row>, Error>> + Send {
        let fut = self.query(cx, sql, params);
        async move {
            match fut.await {
                Outcome::Ok(rows) => Outcome::Ok(rows.into_iter().next()),
                Outcome::Err(e) => Outcome::Err(e),
                Outcome::Cancelled(r) => Outcome::Cancelled(r),
                Outcome::Panicked(p) => Outcome::Panicked(p),
            }
        }
    }

    fn execute(
        &self,
        _cx: &Cx,
        sql: &str,
        params: &[Value],
    ) -> impl Future<Output = Outcome<u64, Error>> + Send {
        let result = {
            let mut state = self.state.lock().expect("lock poisoned");
            state.executed.push((sql.to_string(), params.to_vec()));
            state.execute_results.pop_front().unwrap_or(Ok(1))
        };
        async move {
            match result {
                Ok(count) => Outcome::Ok(count),
                Err(e) => Outcome::Err(e),
            }
        }
    }

    fn ping(&self, _cx: &Cx) -> impl Future<Output = Outcome<(), Error>> + Send {
        async { Outcome::Ok(()) }
    }

    fn close(self, _cx: &Cx) -> impl Future<Output = Result<()>> + Send {
        async { Ok(()) }
    }
}

pub fn unwrap_outcome<T: std::fmt::Debug>(outcome: Outcome<T, Error>) -> T {
    match outcome {
        Outcome::Ok(v) => v,
        other => std::panic::panic_any(format!("unexpected outcome: {other:?}")),
    }
}

pub fn unwrap_err<T: std::fmt::Debug>(outcome: Outcome<T, Error>) -> Error {
    match outcome {
        Outcome::Err(e) => e,
        other => std::panic::panic_any(format!("expected error, got: {other:?}")),
    }
}
