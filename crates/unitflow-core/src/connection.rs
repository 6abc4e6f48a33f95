//! The non-blocking connection facade consumed by the executors.
//!
//! Every operation returns a future resolving to an [`Outcome`]; the session chains these
//! futures strictly in order, so a connection is never used by two pending operations at once.

use crate::error::Error;
use crate::lock::LockMode;
use crate::row::RowCursor;
use crate::value::Value;
use asupersync::{Cx, Outcome};
use serde::{Deserialize, Serialize};

/// SQL dialect quirks the executors need: placeholders, quoting, locking and sequences.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Dialect {
    /// PostgreSQL dialect (uses $1, $2 placeholders)
    #[default]
    Postgres,
    /// SQLite dialect (uses ?1, ?2 placeholders)
    Sqlite,
    /// MySQL dialect (uses ? placeholders)
    Mysql,
}

impl Dialect {
    /// Placeholder for the given parameter index (1-based).
    pub fn placeholder(self, index: usize) -> String {
        match self {
            Dialect::Postgres => format!("${index}"),
            Dialect::Sqlite => format!("?{index}"),
            Dialect::Mysql => "?".to_string(),
        }
    }

    /// Quote an identifier, escaping embedded quote characters.
    pub fn quote_identifier(self, name: &str) -> String {
        match self {
            Dialect::Postgres | Dialect::Sqlite => {
                let escaped = name.replace('"', "\"\"");
                format!("\"{}\"", escaped)
            }
            Dialect::Mysql => {
                let escaped = name.replace('`', "``");
                format!("`{}`", escaped)
            }
        }
    }

    /// Comma separated placeholders `start..start+count` (1-based).
    pub fn placeholders(self, start: usize, count: usize) -> String {
        (start..start + count)
            .map(|i| self.placeholder(i))
            .collect::<Vec<_>>()
            .join(", ")
    }

    /// Suffix appended to a SELECT to acquire the given lock.
    ///
    /// SQLite has no row locks; the whole database is locked by the write transaction.
    pub const fn lock_suffix(self, mode: LockMode) -> &'static str {
        match (self, mode) {
            (Dialect::Sqlite, _) => "",
            (_, LockMode::PessimisticRead) => " FOR SHARE",
            (_, LockMode::PessimisticWrite | LockMode::PessimisticForceIncrement) => {
                " FOR UPDATE"
            }
            _ => "",
        }
    }

    /// Query fetching the next value of a sequence, if the dialect has sequences.
    pub fn sequence_next_value(self, sequence: &str) -> Option<String> {
        match self {
            Dialect::Postgres => Some(format!(
                "SELECT nextval('{}')",
                sequence.replace('\'', "''")
            )),
            Dialect::Mysql => Some(format!(
                "SELECT NEXTVAL({})",
                self.quote_identifier(sequence)
            )),
            Dialect::Sqlite => None,
        }
    }

    /// DDL creating the session-local id table used by multi-table bulk operations.
    pub fn create_temporary_table(self, table: &str, column: &str) -> String {
        let table = self.quote_identifier(table);
        let column = self.quote_identifier(column);
        match self {
            Dialect::Postgres => format!(
                "CREATE LOCAL TEMPORARY TABLE {} ({} BIGINT NOT NULL)",
                table, column
            ),
            Dialect::Sqlite | Dialect::Mysql => format!(
                "CREATE TEMPORARY TABLE {} ({} BIGINT NOT NULL)",
                table, column
            ),
        }
    }

    /// Statement emptying the session-local id table after use.
    pub fn truncate_temporary_table(self, table: &str) -> String {
        format!("DELETE FROM {}", self.quote_identifier(table))
    }
}

/// A database connection capable of executing statements without blocking.
///
/// All operations take a `Cx` context for cancellation and budgets. Implementations must be
/// `Send + Sync` so a session owning one can move between tasks.
///
/// # Example
///
/// ```rust,ignore
/// let count = conn.execute(&cx, "UPDATE \"pig\" SET \"name\" = $1 WHERE \"id\" = $2", &params).await;
/// let mut cursor = conn.select(&cx, "SELECT \"id\" FROM \"pig\"", &[]).await;
/// ```
pub trait Connection: Send + Sync {
    /// Dialect used to render statements for this connection.
    fn dialect(&self) -> Dialect {
        Dialect::Postgres
    }

    /// Execute a statement (INSERT, UPDATE, DELETE) and return rows affected.
    fn execute(
        &self,
        cx: &Cx,
        sql: &str,
        params: &[Value],
    ) -> impl Future<Output = Outcome<u64, Error>> + Send;

    /// Execute one statement for each parameter set in a single round trip.
    ///
    /// Returns the number of rows affected by each parameter set, in order.
    fn execute_batch(
        &self,
        cx: &Cx,
        sql: &str,
        param_sets: &[Vec<Value>],
    ) -> impl Future<Output = Outcome<Vec<u64>, Error>> + Send;

    /// Execute a query and return a cursor over its rows.
    fn select(
        &self,
        cx: &Cx,
        sql: &str,
        params: &[Value],
    ) -> impl Future<Output = Outcome<RowCursor, Error>> + Send;

    /// Execute an INSERT and return the key generated by the database.
    fn insert(
        &self,
        cx: &Cx,
        sql: &str,
        params: &[Value],
    ) -> impl Future<Output = Outcome<Value, Error>> + Send;

    /// Execute a statement without parameters (transaction control, DDL).
    fn execute_unprepared(
        &self,
        cx: &Cx,
        sql: &str,
    ) -> impl Future<Output = Outcome<(), Error>> + Send;

    /// Check the connection is still usable.
    fn ping(&self, cx: &Cx) -> impl Future<Output = Outcome<(), Error>> + Send {
        self.execute_unprepared(cx, "SELECT 1")
    }
}
