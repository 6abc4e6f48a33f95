//! unitflow - an asynchronous unit of work for Rust.
//!
//! unitflow tracks entity instances in a session, turns lifecycle operations into an ordered
//! queue of SQL actions, and flushes that queue through a non-blocking connection:
//!
//! - Persistence context with identity map, loaded-state snapshots and lock modes
//! - Cascading persist, remove, merge, refresh and lock along mapped associations
//! - Ordered action queue with JDBC-style statement batching
//! - Batched, polymorphic loading with lazy references and collections
//! - Optimistic and pessimistic locking, natural ids, native queries and a query-results cache
//! - Connection pooling with structured concurrency
//!
//! # Quick Start
//!
//! ```ignore
//! use unitflow::prelude::*;
//!
//! let metamodel = Metamodel::builder()
//!     .entity(
//!         EntityMetadata::new("GuineaPig", "pig")
//!             .property(PropertyMapping::basic("name", "name"))
//!             .version("version", "version"),
//!     )
//!     .build()
//!     .expect("valid mappings");
//! let factory = SessionFactory::builder(metamodel).build();
//!
//! async fn adopt(cx: &Cx, factory: &SessionFactory, conn: impl Connection) -> Outcome<(), Error> {
//!     let mut session = factory.open_session(conn);
//!     let pig = Entity::new(try_result!(factory.persister("GuineaPig")));
//!     pig.set_id(5_i64);
//!     try_result!(pig.set("name", "Hamtaro"));
//!     try_outcome!(session.persist(cx, &pig).await);
//!
//!     let found = try_outcome!(session.find(cx, "GuineaPig", 5_i64).await);
//!     assert!(found.is_some_and(|p| p.ptr_eq(&pig)));
//!     try_outcome!(session.remove(cx, &pig).await);
//!     session.commit(cx).await
//! }
//! ```

pub use unitflow_core::{
    // asupersync re-exports
    Budget,
    // Metadata
    CascadeStyle,
    CollectionMetadata,
    // Core types
    Connection,
    Cx,
    Dialect,
    Entity,
    EntityMetadata,
    EntityPersister,
    Error,
    IdGeneration,
    LockMode,
    Metamodel,
    Outcome,
    PersistentCollection,
    PropertyMapping,
    PropertyValue,
    RegionId,
    Result,
    Row,
    RowCursor,
    TaskId,
    Value,
    try_outcome,
    try_result,
};

pub use unitflow_query::{CacheStats, LoadPlan, MutationExecutor, Paging};

pub use unitflow_session::{
    Action, ActionQueue, CascadeContext, CascadePoint, CascadingAction, EntityKey, EntityListener,
    EntityStatus, EventType, FlushMode, Interceptor, ListenerRegistry, NativeQuery,
    PersistenceContext, Session, SessionConfig, SessionFactory, SessionFactoryBuilder,
    SessionFactoryOptions,
};

pub use unitflow_pool::{ConnectionFactory, Pool, PoolConfig, PoolStats, PooledConnection};

/// Crate-level modules, for paths such as `unitflow::metadata::SecondaryTable`.
pub use unitflow_core::{connection, entity, metadata};

pub mod prelude {
    pub use crate::{
        // asupersync
        Budget,
        CascadeStyle,
        CollectionMetadata,
        // Core traits and types
        Connection,
        Cx,
        Entity,
        EntityMetadata,
        Error,
        FlushMode,
        IdGeneration,
        LockMode,
        Metamodel,
        // Queries
        NativeQuery,
        Outcome,
        PersistentCollection,
        // Pool
        Pool,
        PoolConfig,
        PropertyMapping,
        Result,
        Row,
        // Session
        Session,
        SessionConfig,
        SessionFactory,
        SessionFactoryOptions,
        Value,
        try_outcome,
        try_result,
    };
}
