//! Error types for unitflow operations.

use std::fmt;

/// The primary error type for all unitflow operations.
#[derive(Debug)]
pub enum Error {
    /// Connection-related errors (connect, disconnect, timeout)
    Connection(ConnectionError),
    /// Query execution errors reported by the driver
    Query(QueryError),
    /// Type conversion errors
    Type(TypeError),
    /// Transaction errors
    Transaction(TransactionError),
    /// Pool errors
    Pool(PoolError),
    /// Configuration errors
    Config(ConfigError),
    /// A database failure wrapped with the statement and action that caused it
    Execution(ExecutionError),
    /// An update or delete expected to touch one row touched none
    StaleState(StaleStateError),
    /// An operation reached an unsaved transient instance
    TransientObject(String),
    /// Programmer error: an argument violates an operation's precondition
    IllegalArgument(String),
    /// Programmer error: the session or queue is in a state that forbids the operation
    IllegalState(String),
    /// A different instance with the same identifier is already associated with the session
    NonUniqueObject {
        /// Entity name
        entity: String,
        /// Identifier rendered for display
        id: String,
    },
    /// No row exists for a reference that had to be initialized
    ObjectNotFound {
        /// Entity name
        entity: String,
        /// Identifier rendered for display
        id: String,
    },
    /// Internal invariant violation
    Assertion(String),
    /// Operation timed out
    Timeout,
    /// Operation was cancelled via asupersync
    Cancelled,
    /// Serialization/deserialization errors
    Serde(String),
    /// Custom error with message
    Custom(String),
}

#[derive(Debug)]
pub struct ConnectionError {
    pub kind: ConnectionErrorKind,
    pub message: String,
    pub source: Option<Box<dyn std::error::Error + Send + Sync>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionErrorKind {
    /// Failed to establish connection
    Connect,
    /// Authentication failed
    Authentication,
    /// Connection lost during operation
    Disconnected,
    /// Connection refused
    Refused,
    /// Connection pool exhausted
    PoolExhausted,
}

#[derive(Debug)]
pub struct QueryError {
    pub kind: QueryErrorKind,
    pub sql: Option<String>,
    pub sqlstate: Option<String>,
    pub message: String,
    pub detail: Option<String>,
    pub source: Option<Box<dyn std::error::Error + Send + Sync>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryErrorKind {
    /// Syntax error in SQL
    Syntax,
    /// Constraint violation (unique, foreign key, etc.)
    Constraint,
    /// Table or column not found
    NotFound,
    /// Deadlock detected
    Deadlock,
    /// Serialization failure (retry may succeed)
    Serialization,
    /// Statement or lock timeout
    Timeout,
    /// Other database error
    Database,
}

#[derive(Debug)]
pub struct TypeError {
    pub expected: &'static str,
    pub actual: String,
    pub column: Option<String>,
    pub rust_type: Option<&'static str>,
}

#[derive(Debug)]
pub struct TransactionError {
    pub kind: TransactionErrorKind,
    pub message: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionErrorKind {
    /// No transaction is active
    NotActive,
    /// A transaction is already active
    AlreadyActive,
    /// A before-completion check failed and the transaction was rolled back
    RolledBack,
}

#[derive(Debug)]
pub struct PoolError {
    pub kind: PoolErrorKind,
    pub message: String,
    pub source: Option<Box<dyn std::error::Error + Send + Sync>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PoolErrorKind {
    /// Pool exhausted (no available connections)
    Exhausted,
    /// Pool is closed
    Closed,
    /// Configuration error
    Config,
}

#[derive(Debug)]
pub struct ConfigError {
    pub message: String,
    pub source: Option<Box<dyn std::error::Error + Send + Sync>>,
}

/// Optimistic locking failure: the row was updated or deleted by another transaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StaleStateError {
    pub entity: String,
    pub id: String,
}

/// A database failure enriched with the statement text and the action being executed.
#[derive(Debug)]
pub struct ExecutionError {
    pub sql: String,
    pub context: String,
    pub source: Box<Error>,
}

impl Error {
    /// Is this a retryable error (deadlock, serialization, pool exhausted, timeouts)?
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Query(q) => matches!(
                q.kind,
                QueryErrorKind::Deadlock | QueryErrorKind::Serialization | QueryErrorKind::Timeout
            ),
            Error::Pool(p) => matches!(p.kind, PoolErrorKind::Exhausted),
            Error::Connection(c) => matches!(c.kind, ConnectionErrorKind::PoolExhausted),
            Error::Execution(e) => e.source.is_retryable(),
            Error::Timeout => true,
            _ => false,
        }
    }

    /// Is this a connection error that likely requires reconnection?
    pub fn is_connection_error(&self) -> bool {
        match self {
            Error::Connection(c) => !matches!(c.kind, ConnectionErrorKind::PoolExhausted),
            Error::Execution(e) => e.source.is_connection_error(),
            _ => false,
        }
    }

    /// Is this an optimistic locking failure?
    pub fn is_stale_state(&self) -> bool {
        matches!(self, Error::StaleState(_))
    }

    /// Get SQLSTATE if available (e.g., "23505" for unique violation)
    pub fn sqlstate(&self) -> Option<&str> {
        match self {
            Error::Query(q) => q.sqlstate.as_deref(),
            Error::Execution(e) => e.source.sqlstate(),
            _ => None,
        }
    }

    /// Get the SQL that caused this error, if available
    pub fn sql(&self) -> Option<&str> {
        match self {
            Error::Query(q) => q.sql.as_deref(),
            Error::Execution(e) => Some(&e.sql),
            _ => None,
        }
    }

    /// Wrap a driver failure with the statement and action that produced it.
    ///
    /// Optimistic locking and usage errors pass through unchanged; only database and
    /// connectivity failures are wrapped.
    pub fn with_statement(self, sql: &str, context: impl Into<String>) -> Error {
        match self {
            Error::Query(mut q) => {
                if q.sql.is_none() {
                    q.sql = Some(sql.to_string());
                }
                Error::Execution(ExecutionError {
                    sql: sql.to_string(),
                    context: context.into(),
                    source: Box::new(Error::Query(q)),
                })
            }
            err @ (Error::Connection(_) | Error::Timeout | Error::Type(_) | Error::Custom(_)) => {
                Error::Execution(ExecutionError {
                    sql: sql.to_string(),
                    context: context.into(),
                    source: Box::new(err),
                })
            }
            other => other,
        }
    }

    /// Shorthand for a stale-state error.
    pub fn stale_state(entity: impl Into<String>, id: impl fmt::Display) -> Error {
        Error::StaleState(StaleStateError {
            entity: entity.into(),
            id: id.to_string(),
        })
    }
}

impl QueryError {
    /// Is this a unique constraint violation?
    pub fn is_unique_violation(&self) -> bool {
        self.sqlstate.as_deref() == Some("23505")
    }

    /// Is this a foreign key violation?
    pub fn is_foreign_key_violation(&self) -> bool {
        self.sqlstate.as_deref() == Some("23503")
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Connection(e) => write!(f, "Connection error: {}", e.message),
            Error::Query(e) => {
                if let Some(sqlstate) = &e.sqlstate {
                    write!(f, "Query error (SQLSTATE {}): {}", sqlstate, e.message)
                } else {
                    write!(f, "Query error: {}", e.message)
                }
            }
            Error::Type(e) => write!(f, "Type error: {}", e),
            Error::Transaction(e) => write!(f, "Transaction error: {}", e.message),
            Error::Pool(e) => write!(f, "Pool error: {}", e.message),
            Error::Config(e) => write!(f, "Configuration error: {}", e.message),
            Error::Execution(e) => write!(f, "{}", e),
            Error::StaleState(e) => write!(f, "{}", e),
            Error::TransientObject(msg) => write!(f, "Transient object: {}", msg),
            Error::IllegalArgument(msg) => write!(f, "Illegal argument: {}", msg),
            Error::IllegalState(msg) => write!(f, "Illegal state: {}", msg),
            Error::NonUniqueObject { entity, id } => write!(
                f,
                "A different object with the same identifier value was already associated with the session: [{}#{}]",
                entity, id
            ),
            Error::ObjectNotFound { entity, id } => {
                write!(f, "No row with the given identifier exists: [{}#{}]", entity, id)
            }
            Error::Assertion(msg) => write!(f, "Assertion failure: {}", msg),
            Error::Timeout => write!(f, "Operation timed out"),
            Error::Cancelled => write!(f, "Operation cancelled"),
            Error::Serde(msg) => write!(f, "Serialization error: {}", msg),
            Error::Custom(msg) => write!(f, "{}", msg),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Connection(e) => e
                .source
                .as_deref()
                .map(|err| err as &(dyn std::error::Error + 'static)),
            Error::Query(e) => e
                .source
                .as_deref()
                .map(|err| err as &(dyn std::error::Error + 'static)),
            Error::Pool(e) => e
                .source
                .as_deref()
                .map(|err| err as &(dyn std::error::Error + 'static)),
            Error::Config(e) => e
                .source
                .as_deref()
                .map(|err| err as &(dyn std::error::Error + 'static)),
            Error::Execution(e) => Some(e.source.as_ref()),
            _ => None,
        }
    }
}

impl fmt::Display for ConnectionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl fmt::Display for QueryError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(sqlstate) = &self.sqlstate {
            write!(f, "{} (SQLSTATE {})", self.message, sqlstate)
        } else {
            write!(f, "{}", self.message)
        }
    }
}

impl fmt::Display for TypeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(col) = &self.column {
            write!(
                f,
                "expected {} for column '{}', found {}",
                self.expected, col, self.actual
            )
        } else {
            write!(f, "expected {}, found {}", self.expected, self.actual)
        }
    }
}

impl fmt::Display for TransactionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl fmt::Display for PoolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl fmt::Display for StaleStateError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Row was updated or deleted by another transaction (or unsaved-value mapping was incorrect): [{}#{}]",
            self.entity, self.id
        )
    }
}

impl fmt::Display for ExecutionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "could not execute statement [{}] while executing {}: {}",
            self.sql, self.context, self.source
        )
    }
}

impl From<ConnectionError> for Error {
    fn from(err: ConnectionError) -> Self {
        Error::Connection(err)
    }
}

impl From<QueryError> for Error {
    fn from(err: QueryError) -> Self {
        Error::Query(err)
    }
}

impl From<TypeError> for Error {
    fn from(err: TypeError) -> Self {
        Error::Type(err)
    }
}

impl From<TransactionError> for Error {
    fn from(err: TransactionError) -> Self {
        Error::Transaction(err)
    }
}

impl From<PoolError> for Error {
    fn from(err: PoolError) -> Self {
        Error::Pool(err)
    }
}

impl From<ConfigError> for Error {
    fn from(err: ConfigError) -> Self {
        Error::Config(err)
    }
}

impl From<StaleStateError> for Error {
    fn from(err: StaleStateError) -> Self {
        Error::StaleState(err)
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Serde(err.to_string())
    }
}

/// Result type alias for unitflow operations.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    fn constraint_error() -> QueryError {
        QueryError {
            kind: QueryErrorKind::Constraint,
            sql: None,
            sqlstate: Some("23505".to_string()),
            message: "unique violation".to_string(),
            detail: None,
            source: None,
        }
    }

    #[test]
    fn sqlstate_helpers() {
        let query = constraint_error();
        assert!(query.is_unique_violation());
        assert!(!query.is_foreign_key_violation());

        let err = Error::Query(query);
        assert_eq!(err.sqlstate(), Some("23505"));
        assert_eq!(err.sql(), None);
    }

    #[test]
    fn with_statement_wraps_database_failures() {
        let err = Error::Query(constraint_error())
            .with_statement("INSERT INTO \"pig\" (\"id\") VALUES ($1)", "insert GuineaPig#5");
        assert_eq!(err.sql(), Some("INSERT INTO \"pig\" (\"id\") VALUES ($1)"));
        assert_eq!(err.sqlstate(), Some("23505"));
        let rendered = err.to_string();
        assert!(rendered.contains("insert GuineaPig#5"));
        assert!(std::error::Error::source(&err).is_some());
    }

    #[test]
    fn with_statement_leaves_stale_state_alone() {
        let err = Error::stale_state("GuineaPig", 5).with_statement("UPDATE", "update");
        assert!(err.is_stale_state());
        assert!(err.to_string().contains("GuineaPig#5"));
    }

    #[test]
    fn retryable_and_connection_flags() {
        let deadlock = Error::Query(QueryError {
            kind: QueryErrorKind::Deadlock,
            sql: None,
            sqlstate: None,
            message: "deadlock detected".to_string(),
            detail: None,
            source: None,
        });
        assert!(deadlock.is_retryable());

        let lost = Error::Connection(ConnectionError {
            kind: ConnectionErrorKind::Disconnected,
            message: "lost connection".to_string(),
            source: None,
        })
        .with_statement("SELECT 1", "load");
        assert!(lost.is_connection_error());
        assert!(!lost.is_retryable());
    }
}
