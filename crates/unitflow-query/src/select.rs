//! SELECT execution with row-by-row processing.
//!
//! Rows are handed to a [`RowProcessor`] one at a time. Statements split into several branches
//! (polymorphic table-per-class loads) are paged as if they were one result: the offset skips rows
//! across branch boundaries in branch order and the limit stops further branches from running.

use asupersync::{Cx, Outcome};
use unitflow_core::{Connection, Error, Result, Row, Value, try_result};

/// Turns rows into results.
pub trait RowProcessor {
    type Output;

    /// Process one row of the statement at `branch`. `None` drops the row from the results
    /// (duplicates, filtered rows).
    fn process_row(&mut self, branch: usize, row: &Row) -> Result<Option<Self::Output>>;
}

/// Collects raw value tuples.
#[derive(Debug, Default)]
pub struct TupleProcessor;

impl RowProcessor for TupleProcessor {
    type Output = Vec<Value>;

    fn process_row(&mut self, _branch: usize, row: &Row) -> Result<Option<Vec<Value>>> {
        Ok(Some(row.values().to_vec()))
    }
}

/// First-result offset and maximum number of rows.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Paging {
    pub first: usize,
    pub max: Option<usize>,
}

impl Paging {
    pub fn new(first: usize, max: Option<usize>) -> Self {
        Self { first, max }
    }

    pub fn is_unbounded(&self) -> bool {
        self.first == 0 && self.max.is_none()
    }
}

/// One statement of a split query.
#[derive(Debug, Clone, PartialEq)]
pub struct SelectBranch {
    pub sql: String,
    pub params: Vec<Value>,
}

impl SelectBranch {
    pub fn new(sql: impl Into<String>, params: Vec<Value>) -> Self {
        Self {
            sql: sql.into(),
            params,
        }
    }
}

/// Executes SELECTs and feeds their rows through a processor.
#[derive(Debug, Default, Clone, Copy)]
pub struct SelectExecutor;

impl SelectExecutor {
    /// Execute one SELECT.
    pub async fn list<C, P>(
        cx: &Cx,
        conn: &C,
        sql: &str,
        params: &[Value],
        paging: Paging,
        processor: &mut P,
    ) -> Outcome<Vec<P::Output>, Error>
    where
        C: Connection,
        P: RowProcessor,
    {
        let branch = SelectBranch::new(sql, params.to_vec());
        Self::list_branches(cx, conn, std::slice::from_ref(&branch), paging, processor).await
    }

    /// Execute the branches in order, paging across them.
    #[tracing::instrument(level = "trace", skip_all, fields(branches = branches.len()))]
    pub async fn list_branches<C, P>(
        cx: &Cx,
        conn: &C,
        branches: &[SelectBranch],
        paging: Paging,
        processor: &mut P,
    ) -> Outcome<Vec<P::Output>, Error>
    where
        C: Connection,
        P: RowProcessor,
    {
        let mut results = Vec::new();
        let mut to_skip = paging.first;
        let mut taken = 0usize;

        for (index, branch) in branches.iter().enumerate() {
            if paging.max.is_some_and(|max| taken >= max) {
                tracing::trace!(sql = %branch.sql, "Page complete, branch skipped");
                break;
            }
            let cursor = match conn.select(cx, &branch.sql, &branch.params).await {
                Outcome::Ok(cursor) => cursor,
                Outcome::Err(e) => return Outcome::Err(e.with_statement(&branch.sql, "select")),
                Outcome::Cancelled(r) => return Outcome::Cancelled(r),
                Outcome::Panicked(p) => return Outcome::Panicked(p),
            };
            tracing::trace!(sql = %branch.sql, rows = cursor.remaining(), "Processing rows");
            for row in cursor {
                if to_skip > 0 {
                    to_skip -= 1;
                    continue;
                }
                if paging.max.is_some_and(|max| taken >= max) {
                    break;
                }
                taken += 1;
                let processed = try_result!(processor.process_row(index, &row));
                if let Some(output) = processed {
                    results.push(output);
                }
            }
        }
        Outcome::Ok(results)
    }
}
