//! Core types and traits for unitflow.
//!
//! This crate provides the foundational abstractions shared by the executors and the
//! session state machine:
//!
//! - `Value` / `Row` / `RowCursor` for dynamically typed SQL data
//! - `Connection` facade for the non-blocking driver
//! - `metadata` for the read-only entity/collection descriptors (persisters)
//! - `Entity` and `PersistentCollection` instances with reference identity
//! - `Outcome` re-export from asupersync for cancel-correct operations
//! - `Cx` context for structured concurrency

// Re-export asupersync primitives for structured concurrency
pub use asupersync::{Budget, Cx, Outcome, RegionId, TaskId};

pub mod connection;
pub mod entity;
pub mod error;
pub mod lock;
pub mod metadata;
pub mod row;
pub mod value;

pub use connection::{Connection, Dialect};
pub use entity::{
    CollectionIdentity, Entity, EntityIdentity, EntityState, PersistentCollection, PropertyValue,
};
pub use error::{
    ConfigError, ConnectionError, ConnectionErrorKind, Error, ExecutionError, PoolError,
    PoolErrorKind, QueryError, QueryErrorKind, Result, StaleStateError, TransactionError,
    TransactionErrorKind, TypeError,
};
pub use lock::LockMode;
pub use metadata::{
    CascadeStyle, CollectionMetadata, CollectionPersister, Discriminator, EntityMetadata,
    EntityPersister, IdGeneration, Inheritance, JoinTable, Metamodel, MetamodelBuilder,
    PropertyKind, PropertyMapping, SecondaryTable,
};
pub use row::{ColumnInfo, FromValue, Row, RowCursor};
pub use value::Value;

/// Unwrap an `Outcome`, returning early from the enclosing async block on anything but `Ok`.
///
/// ```ignore
/// let rows = try_outcome!(conn.execute(cx, sql, &params).await);
/// ```
#[macro_export]
macro_rules! try_outcome {
    ($e:expr) => {
        match $e {
            $crate::Outcome::Ok(v) => v,
            $crate::Outcome::Err(e) => return $crate::Outcome::Err(e),
            $crate::Outcome::Cancelled(r) => return $crate::Outcome::Cancelled(r),
            $crate::Outcome::Panicked(p) => return $crate::Outcome::Panicked(p),
        }
    };
}

/// Unwrap a `Result` inside a function returning `Outcome`, converting `Err` into `Outcome::Err`.
#[macro_export]
macro_rules! try_result {
    ($e:expr) => {
        match $e {
            Ok(v) => v,
            Err(e) => return $crate::Outcome::Err(e.into()),
        }
    };
}
