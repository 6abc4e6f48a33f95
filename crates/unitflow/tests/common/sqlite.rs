//! Test connection over an in-memory SQLite database compiled from the bundled library.
//!
//! Every clone of a [`SqliteDb`] talks to the same connection, so a test can read what a session
//! wrote while the session still owns its handle. A session that issues `BEGIN` while another
//! handle's transaction is open joins that transaction; the first `COMMIT` or `ROLLBACK` ends it
//! for everyone.

#![allow(unsafe_code)]

use std::collections::BTreeMap;
use std::ffi::{CStr, CString, c_int};
use std::ptr;
use std::sync::{Arc, Mutex, MutexGuard};

use libsqlite3_sys as ffi;
use unitflow::prelude::*;
use unitflow::{Dialect, RowCursor};
use unitflow_core::{QueryError, QueryErrorKind};

// libsqlite3-sys omits `sqlite3_close_v2` from its generated bindings; the bundled library exports it.
unsafe extern "C" {
    fn sqlite3_close_v2(db: *mut ffi::sqlite3) -> c_int;
}

/// One row, by column name.
pub type Record = BTreeMap<String, Value>;

// ============================================================================
// Raw handles
// ============================================================================

#[derive(Debug)]
struct Database(*mut ffi::sqlite3);

// SAFETY: the connection is opened in serialized mode and only reached through the state mutex
unsafe impl Send for Database {}

impl Drop for Database {
    fn drop(&mut self) {
        // SAFETY: the handle came from sqlite3_open_v2 and is closed exactly once
        unsafe {
            sqlite3_close_v2(self.0);
        }
    }
}

struct Statement(*mut ffi::sqlite3_stmt);

impl Drop for Statement {
    fn drop(&mut self) {
        // SAFETY: the statement came from sqlite3_prepare_v2 and is finalized exactly once
        unsafe {
            ffi::sqlite3_finalize(self.0);
        }
    }
}

/// What one statement produced.
#[derive(Debug, Default)]
struct Response {
    columns: Vec<String>,
    rows: Vec<Vec<Value>>,
    affected: u64,
}

impl Database {
    fn open_memory() -> Self {
        let path = CString::new(":memory:").expect("path without NUL");
        let mut raw = ptr::null_mut();
        let flags = ffi::SQLITE_OPEN_READWRITE
            | ffi::SQLITE_OPEN_CREATE
            | ffi::SQLITE_OPEN_MEMORY
            | ffi::SQLITE_OPEN_FULLMUTEX;
        // SAFETY: the path is NUL-terminated and `raw` is a valid out pointer
        let rc = unsafe { ffi::sqlite3_open_v2(path.as_ptr(), &mut raw, flags, ptr::null()) };
        let db = Database(raw);
        assert_eq!(rc, ffi::SQLITE_OK, "open in-memory database: {}", db.message());
        db
    }

    fn message(&self) -> String {
        // SAFETY: sqlite3_errmsg returns a NUL-terminated string owned by the connection
        unsafe { CStr::from_ptr(ffi::sqlite3_errmsg(self.0)) }
            .to_string_lossy()
            .into_owned()
    }

    fn error(&self, sql: &str) -> Error {
        // SAFETY: the handle is open
        let code = unsafe { ffi::sqlite3_extended_errcode(self.0) };
        let kind = match code & 0xff {
            ffi::SQLITE_CONSTRAINT => QueryErrorKind::Constraint,
            ffi::SQLITE_BUSY | ffi::SQLITE_LOCKED => QueryErrorKind::Deadlock,
            ffi::SQLITE_NOTFOUND => QueryErrorKind::NotFound,
            _ => QueryErrorKind::Database,
        };
        Error::Query(QueryError {
            kind,
            sql: Some(sql.to_string()),
            sqlstate: None,
            message: self.message(),
            detail: None,
            source: None,
        })
    }

    fn in_transaction(&self) -> bool {
        // SAFETY: the handle is open
        unsafe { ffi::sqlite3_get_autocommit(self.0) == 0 }
    }

    fn last_insert_rowid(&self) -> i64 {
        // SAFETY: the handle is open
        unsafe { ffi::sqlite3_last_insert_rowid(self.0) }
    }

    fn prepare(&self, sql: &str) -> std::result::Result<Statement, Error> {
        let text = CString::new(sql).map_err(|_| self.error(sql))?;
        let mut raw = ptr::null_mut();
        // SAFETY: the SQL is NUL-terminated and `raw` is a valid out pointer
        let rc = unsafe {
            ffi::sqlite3_prepare_v2(
                self.0,
                text.as_ptr(),
                text.as_bytes().len() as c_int,
                &mut raw,
                ptr::null_mut(),
            )
        };
        if rc != ffi::SQLITE_OK {
            return Err(self.error(sql));
        }
        Ok(Statement(raw))
    }

    /// Prepare, bind `params` to `?1..?n`, and step to completion.
    fn run(&self, sql: &str, params: &[Value]) -> std::result::Result<Response, Error> {
        let statement = self.prepare(sql)?;
        for (index, value) in params.iter().enumerate() {
            if statement.bind(index as c_int + 1, value) != ffi::SQLITE_OK {
                return Err(self.error(sql));
            }
        }
        let columns = statement.column_names();
        let mut rows = Vec::new();
        loop {
            match statement.step() {
                ffi::SQLITE_ROW => rows.push((0..columns.len()).map(|i| statement.read(i as c_int)).collect()),
                ffi::SQLITE_DONE => break,
                _ => return Err(self.error(sql)),
            }
        }
        let affected = if columns.is_empty() {
            // SAFETY: the handle is open
            u64::try_from(unsafe { ffi::sqlite3_changes(self.0) }).unwrap_or(0)
        } else {
            0
        };
        Ok(Response {
            columns,
            rows,
            affected,
        })
    }
}

impl Statement {
    fn bind(&self, index: c_int, value: &Value) -> c_int {
        match value {
            Value::Null => {
                // SAFETY: the statement is prepared and not yet stepped
                unsafe { ffi::sqlite3_bind_null(self.0, index) }
            }
            Value::Bool(b) => self.bind_int(index, i64::from(*b)),
            Value::Int(v) | Value::Date(v) => self.bind_int(index, i64::from(*v)),
            Value::BigInt(v) | Value::Timestamp(v) => self.bind_int(index, *v),
            Value::Double(v) => {
                // SAFETY: the statement is prepared and not yet stepped
                unsafe { ffi::sqlite3_bind_double(self.0, index, *v) }
            }
            Value::Decimal(s) | Value::Text(s) => self.bind_text(index, s),
            Value::Json(json) => self.bind_text(index, &json.to_string()),
            Value::Bytes(bytes) => self.bind_blob(index, bytes),
            Value::Uuid(bytes) => self.bind_blob(index, bytes),
        }
    }

    fn bind_int(&self, index: c_int, value: i64) -> c_int {
        // SAFETY: the statement is prepared and not yet stepped
        unsafe { ffi::sqlite3_bind_int64(self.0, index, value) }
    }

    fn bind_text(&self, index: c_int, text: &str) -> c_int {
        // SAFETY: SQLITE_TRANSIENT makes SQLite copy the bytes before this call returns
        unsafe {
            ffi::sqlite3_bind_text(
                self.0,
                index,
                text.as_ptr().cast(),
                text.len() as c_int,
                ffi::SQLITE_TRANSIENT(),
            )
        }
    }

    fn bind_blob(&self, index: c_int, bytes: &[u8]) -> c_int {
        // SAFETY: SQLITE_TRANSIENT makes SQLite copy the bytes before this call returns
        unsafe {
            ffi::sqlite3_bind_blob(
                self.0,
                index,
                bytes.as_ptr().cast(),
                bytes.len() as c_int,
                ffi::SQLITE_TRANSIENT(),
            )
        }
    }

    fn step(&self) -> c_int {
        // SAFETY: the statement is prepared
        unsafe { ffi::sqlite3_step(self.0) }
    }

    fn column_names(&self) -> Vec<String> {
        // SAFETY: the statement is prepared
        let count = unsafe { ffi::sqlite3_column_count(self.0) };
        (0..count)
            .map(|i| {
                // SAFETY: `i` is below the column count; names are NUL-terminated
                let name = unsafe { ffi::sqlite3_column_name(self.0, i) };
                if name.is_null() {
                    format!("col{i}")
                } else {
                    // SAFETY: checked non-null above
                    unsafe { CStr::from_ptr(name) }.to_string_lossy().into_owned()
                }
            })
            .collect()
    }

    /// Declared type of a result column; `None` for expressions.
    fn declared_type(&self, index: c_int) -> Option<String> {
        // SAFETY: `index` is below the column count
        let declared = unsafe { ffi::sqlite3_column_decltype(self.0, index) };
        if declared.is_null() {
            return None;
        }
        // SAFETY: checked non-null above
        Some(unsafe { CStr::from_ptr(declared) }.to_string_lossy().to_ascii_uppercase())
    }

    /// Column `index` of the current row. `INTEGER` columns read as `Int`, other integers as
    /// `BigInt`.
    fn read(&self, index: c_int) -> Value {
        // SAFETY: the statement just returned SQLITE_ROW and `index` is below the column count
        match unsafe { ffi::sqlite3_column_type(self.0, index) } {
            ffi::SQLITE_INTEGER => {
                // SAFETY: as above
                let v = unsafe { ffi::sqlite3_column_int64(self.0, index) };
                match self.declared_type(index).as_deref() {
                    Some("INTEGER" | "INT") => i32::try_from(v).map_or(Value::BigInt(v), Value::Int),
                    Some("BOOLEAN") => Value::Bool(v != 0),
                    _ => Value::BigInt(v),
                }
            }
            ffi::SQLITE_FLOAT => {
                // SAFETY: as above
                Value::Double(unsafe { ffi::sqlite3_column_double(self.0, index) })
            }
            ffi::SQLITE_TEXT => {
                let bytes = self.column_bytes(index, true);
                Value::Text(String::from_utf8_lossy(&bytes).into_owned())
            }
            ffi::SQLITE_BLOB => Value::Bytes(self.column_bytes(index, false)),
            _ => Value::Null,
        }
    }

    fn column_bytes(&self, index: c_int, text: bool) -> Vec<u8> {
        // SAFETY: the statement is on a row; the pointer is read before the next step and
        // sqlite3_column_bytes is called after the text/blob conversion
        unsafe {
            let data: *const u8 = if text {
                ffi::sqlite3_column_text(self.0, index).cast()
            } else {
                ffi::sqlite3_column_blob(self.0, index).cast()
            };
            let len = usize::try_from(ffi::sqlite3_column_bytes(self.0, index)).unwrap_or(0);
            if data.is_null() || len == 0 {
                Vec::new()
            } else {
                std::slice::from_raw_parts(data, len).to_vec()
            }
        }
    }
}

// ============================================================================
// Shared database
// ============================================================================

#[derive(Debug)]
struct State {
    db: Database,
    log: Vec<String>,
    round_trips: usize,
    selects: usize,
}

impl State {
    /// Log and count one round trip, then run it.
    fn call(&mut self, entry: String, sql: &str, params: &[Value]) -> std::result::Result<Response, Error> {
        self.log.push(entry);
        self.round_trips += 1;
        if self.joins_open_transaction(sql) {
            return Ok(Response::default());
        }
        self.db.run(sql, params)
    }

    /// `BEGIN` inside an open transaction joins it; `COMMIT`/`ROLLBACK` outside one is a no-op.
    fn joins_open_transaction(&self, sql: &str) -> bool {
        match sql {
            "BEGIN" => self.db.in_transaction(),
            "COMMIT" | "ROLLBACK" => !self.db.in_transaction(),
            _ => false,
        }
    }
}

fn into_outcome<T>(result: std::result::Result<T, Error>) -> Outcome<T, Error> {
    match result {
        Ok(v) => Outcome::Ok(v),
        Err(e) => Outcome::Err(e),
    }
}

fn quote(identifier: &str) -> String {
    Dialect::Sqlite.quote_identifier(identifier)
}

/// In-memory SQLite database that logs and counts every statement a session sends.
#[derive(Debug, Clone)]
pub struct SqliteDb {
    state: Arc<Mutex<State>>,
}

impl Default for SqliteDb {
    fn default() -> Self {
        Self::new()
    }
}

impl SqliteDb {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(State {
                db: Database::open_memory(),
                log: Vec::new(),
                round_trips: 0,
                selects: 0,
            })),
        }
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().expect("sqlite state lock")
    }

    /// Run DDL while building the fixture.
    pub fn schema(self, ddl: &str) -> Self {
        self.raw_execute(ddl, &[]);
        self
    }

    /// Insert a row behind the session's back.
    pub fn seed(&self, table: &str, values: &[(&str, Value)]) {
        let columns: Vec<String> = values.iter().map(|(column, _)| quote(column)).collect();
        let sql = format!(
            "INSERT INTO {} ({}) VALUES ({})",
            quote(table),
            columns.join(", "),
            Dialect::Sqlite.placeholders(1, values.len())
        );
        let params: Vec<Value> = values.iter().map(|(_, value)| value.clone()).collect();
        self.raw_execute(&sql, &params);
    }

    /// Run a statement behind the session's back: not logged, not counted.
    pub fn raw_execute(&self, sql: &str, params: &[Value]) -> u64 {
        match self.state().db.run(sql, params) {
            Ok(response) => response.affected,
            Err(e) => panic!("raw statement failed: {e}"),
        }
    }

    fn query(&self, sql: &str, params: &[Value]) -> Vec<Record> {
        let Response { columns, rows, .. } = match self.state().db.run(sql, params) {
            Ok(response) => response,
            Err(e) => panic!("raw query failed: {e}"),
        };
        rows.into_iter()
            .map(|values| columns.iter().cloned().zip(values).collect())
            .collect()
    }

    pub fn rows(&self, table: &str) -> Vec<Record> {
        self.query(&format!("SELECT * FROM {}", quote(table)), &[])
    }

    /// Row of `table` whose first column equals `id`.
    pub fn row(&self, table: &str, id: impl Into<Value>) -> Option<Record> {
        let key = self
            .query(
                r#"SELECT "name" FROM pragma_table_info(?1) ORDER BY "cid" LIMIT 1"#,
                &[Value::from(table)],
            )
            .into_iter()
            .next()
            .and_then(|record| record.get("name").cloned())?;
        let Value::Text(key) = key else {
            return None;
        };
        let sql = format!("SELECT * FROM {} WHERE {} = ?1", quote(table), quote(&key));
        self.query(&sql, &[id.into()]).into_iter().next()
    }

    pub fn count(&self, table: &str) -> usize {
        let sql = format!(r#"SELECT COUNT(*) AS "n" FROM {}"#, quote(table));
        self.query(&sql, &[])
            .first()
            .and_then(|record| record.get("n").and_then(Value::as_i64))
            .and_then(|n| usize::try_from(n).ok())
            .unwrap_or(0)
    }

    /// Every call as `kind sql`: `execute`, `batch[n]`, `select`, `insert` or `unprepared`.
    pub fn log(&self) -> Vec<String> {
        self.state().log.clone()
    }

    /// Logged calls other than selects and transaction control.
    pub fn writes(&self) -> Vec<String> {
        self.log()
            .into_iter()
            .filter(|entry| {
                !entry.starts_with("select ")
                    && !["execute BEGIN", "execute COMMIT", "execute ROLLBACK"].contains(&entry.as_str())
            })
            .collect()
    }

    pub fn clear_log(&self) {
        let mut state = self.state();
        state.log.clear();
        state.round_trips = 0;
        state.selects = 0;
    }

    pub fn round_trips(&self) -> usize {
        self.state().round_trips
    }

    pub fn selects(&self) -> usize {
        self.state().selects
    }
}

impl Connection for SqliteDb {
    fn dialect(&self) -> Dialect {
        Dialect::Sqlite
    }

    fn execute(
        &self,
        _cx: &Cx,
        sql: &str,
        params: &[Value],
    ) -> impl Future<Output = Outcome<u64, Error>> + Send {
        let result = self
            .state()
            .call(format!("execute {sql}"), sql, params)
            .map(|r| r.affected);
        async move { into_outcome(result) }
    }

    fn execute_batch(
        &self,
        _cx: &Cx,
        sql: &str,
        param_sets: &[Vec<Value>],
    ) -> impl Future<Output = Outcome<Vec<u64>, Error>> + Send {
        let result = {
            let mut state = self.state();
            state.log.push(format!("batch[{}] {sql}", param_sets.len()));
            state.round_trips += 1;
            param_sets
                .iter()
                .map(|params| state.db.run(sql, params).map(|r| r.affected))
                .collect::<std::result::Result<Vec<u64>, Error>>()
        };
        async move { into_outcome(result) }
    }

    fn select(
        &self,
        _cx: &Cx,
        sql: &str,
        params: &[Value],
    ) -> impl Future<Output = Outcome<RowCursor, Error>> + Send {
        let result = {
            let mut state = self.state();
            state.selects += 1;
            state
                .call(format!("select {sql}"), sql, params)
                .map(|r| RowCursor::from_values(r.columns, r.rows))
        };
        async move { into_outcome(result) }
    }

    fn insert(
        &self,
        _cx: &Cx,
        sql: &str,
        params: &[Value],
    ) -> impl Future<Output = Outcome<Value, Error>> + Send {
        let result = {
            let mut state = self.state();
            state
                .call(format!("insert {sql}"), sql, params)
                .map(|_| Value::BigInt(state.db.last_insert_rowid()))
        };
        async move { into_outcome(result) }
    }

    fn execute_unprepared(&self, _cx: &Cx, sql: &str) -> impl Future<Output = Outcome<(), Error>> + Send {
        let result = self
            .state()
            .call(format!("unprepared {sql}"), sql, &[])
            .map(|_| ());
        async move { into_outcome(result) }
    }
}
