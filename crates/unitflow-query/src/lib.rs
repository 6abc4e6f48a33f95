//! Statement and execution layer for unitflow.
//!
//! `unitflow-query` turns persister metadata into SQL and runs it through the
//! [`Connection`](unitflow_core::Connection) facade:
//!
//! - **Statements**: insert/update/delete templates per table and collection statements.
//! - **Load plans**: SELECTs by id batch, natural id, collection key, and lock checks.
//! - **Mutation executors**: single, batched, post-insert identity and self-executing variants,
//!   with a [`BatchCoordinator`] grouping identical SQL into one round trip.
//! - **Select executor**: row-by-row processing with pagination across split statements.
//! - **Caches**: the load-plan cache and the query-results cache validated by table watermarks.

pub mod batch;
pub mod cache;
pub mod mutation;
pub mod plan;
pub mod result_cache;
pub mod select;
pub mod statement;

pub use batch::BatchSizes;
pub use cache::{PlanCache, PlanKey, cache_key};
pub use mutation::{
    BatchCoordinator, Expectation, MutationExecutor, MutationOutcome, MutationRequest,
    TemporaryTableBulkDelete,
};
pub use plan::{LoadPlan, PlanBranch, PlanKind, SecondarySelect};
pub use result_cache::{CacheStats, CachedResult, QueryKey, QueryResultsCache, ResultShape};
pub use select::{Paging, RowProcessor, SelectBranch, SelectExecutor, TupleProcessor};
pub use statement::{Binding, BindingSource, TableStatement};
