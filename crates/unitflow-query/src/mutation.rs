//! Mutation executors.
//!
//! Every INSERT/UPDATE/DELETE issued by a flush goes through a [`MutationExecutor`] chosen by
//! [`MutationExecutor::for_statement`]. Batched statements are parked in a
//! [`BatchCoordinator`] until the batch fills, the SQL text changes, a non-batchable statement
//! runs, or the flush ends; row counts are verified per statement when the batch executes.

use asupersync::{Cx, Outcome};
use unitflow_core::{Connection, Dialect, Error, Value, try_outcome};

/// Row count a statement is expected to produce.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Expectation {
    /// Exactly this many rows.
    RowCount(u64),
    /// Any row count is acceptable.
    None,
}

impl Expectation {
    /// Check an affected-row count.
    ///
    /// Zero rows where one was expected means the row changed underneath us (stale state);
    /// any other mismatch is an internal inconsistency.
    pub fn verify(&self, rows: u64, entity: &str, id: &Value, sql: &str) -> Result<(), Error> {
        match *self {
            Expectation::None => Ok(()),
            Expectation::RowCount(expected) if rows == expected => Ok(()),
            Expectation::RowCount(_) if rows == 0 => Err(Error::stale_state(entity, id)),
            Expectation::RowCount(expected) => Err(Error::Assertion(format!(
                "Unexpected row count: {}; expected: {}; statement executed: {}",
                rows, expected, sql
            ))),
        }
    }
}

/// One statement ready to run: SQL, bound values, and enough context to report failures.
#[derive(Debug, Clone, PartialEq)]
pub struct MutationRequest {
    pub sql: String,
    pub params: Vec<Value>,
    pub expectation: Expectation,
    /// Entity name used in stale-state errors.
    pub entity: String,
    /// Identifier used in stale-state errors.
    pub id: Value,
    /// Description of the action issuing the statement.
    pub context: String,
}

/// What executing a request produced.
#[derive(Debug, Clone, PartialEq)]
pub enum MutationOutcome {
    /// The statement ran; this many rows were affected.
    Executed(u64),
    /// The statement joined a pending batch; its count is verified when the batch runs.
    Deferred,
    /// The insert ran and the database generated this key.
    Generated(Value),
}

/// Routine that runs a whole operation itself instead of binding one statement.
///
/// Deletes every row of a multi-table entity matching a restriction: matching identifiers
/// are collected into a session-local id table, then each table deletes by that set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TemporaryTableBulkDelete {
    pub id_table: String,
    pub id_column: String,
    /// `(table, key column)` pairs, deleted in order.
    pub tables: Vec<(String, String)>,
}

impl TemporaryTableBulkDelete {
    /// `request.sql` is a SELECT producing the identifiers to delete.
    #[tracing::instrument(level = "debug", skip(self, cx, conn, request), fields(id_table = %self.id_table))]
    async fn perform<C: Connection>(
        &self,
        cx: &Cx,
        conn: &C,
        request: &MutationRequest,
    ) -> Outcome<u64, Error> {
        let dialect = conn.dialect();
        let create = dialect.create_temporary_table(&self.id_table, &self.id_column);
        match conn.execute_unprepared(cx, &create).await {
            Outcome::Ok(()) => {}
            Outcome::Err(e) => {
                tracing::warn!(error = %e, table = %self.id_table, "Ignoring id table creation failure");
            }
            Outcome::Cancelled(r) => return Outcome::Cancelled(r),
            Outcome::Panicked(p) => return Outcome::Panicked(p),
        }

        let result = self.delete_through_id_table(cx, conn, dialect, request).await;

        let truncate = dialect.truncate_temporary_table(&self.id_table);
        match conn.execute_unprepared(cx, &truncate).await {
            Outcome::Ok(()) => {}
            Outcome::Err(e) => {
                tracing::warn!(error = %e, table = %self.id_table, "Ignoring id table cleanup failure");
            }
            Outcome::Cancelled(r) => return Outcome::Cancelled(r),
            Outcome::Panicked(p) => return Outcome::Panicked(p),
        }
        result
    }

    async fn delete_through_id_table<C: Connection>(
        &self,
        cx: &Cx,
        conn: &C,
        dialect: Dialect,
        request: &MutationRequest,
    ) -> Outcome<u64, Error> {
        let fill = format!(
            "INSERT INTO {} ({}) {}",
            dialect.quote_identifier(&self.id_table),
            dialect.quote_identifier(&self.id_column),
            request.sql
        );
        let matched = match conn.execute(cx, &fill, &request.params).await {
            Outcome::Ok(n) => n,
            Outcome::Err(e) => return Outcome::Err(e.with_statement(&fill, &request.context)),
            Outcome::Cancelled(r) => return Outcome::Cancelled(r),
            Outcome::Panicked(p) => return Outcome::Panicked(p),
        };
        tracing::debug!(matched, "Collected identifiers for bulk delete");

        let mut deleted = 0;
        for (table, key_column) in &self.tables {
            let sql = format!(
                "DELETE FROM {} WHERE {} IN (SELECT {} FROM {})",
                dialect.quote_identifier(table),
                dialect.quote_identifier(key_column),
                dialect.quote_identifier(&self.id_column),
                dialect.quote_identifier(&self.id_table)
            );
            deleted = match conn.execute(cx, &sql, &[]).await {
                Outcome::Ok(n) => n,
                Outcome::Err(e) => return Outcome::Err(e.with_statement(&sql, &request.context)),
                Outcome::Cancelled(r) => return Outcome::Cancelled(r),
                Outcome::Panicked(p) => return Outcome::Panicked(p),
            };
        }
        // The last table is the primary one.
        Outcome::Ok(deleted)
    }
}

/// Round-trip strategy for a statement.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MutationExecutor {
    /// One `execute` per statement.
    Single,
    /// Grouped with identical SQL through the batch coordinator.
    Batched,
    /// `insert` returning the database-generated key.
    PostInsertIdentity,
    /// Operation-specific routine.
    SelfExecuting(TemporaryTableBulkDelete),
}

impl MutationExecutor {
    /// Choose the executor for a generic statement.
    pub fn for_statement(generated_key: bool, batch_size: usize) -> MutationExecutor {
        if generated_key {
            MutationExecutor::PostInsertIdentity
        } else if batch_size > 1 {
            MutationExecutor::Batched
        } else {
            MutationExecutor::Single
        }
    }

    #[tracing::instrument(level = "trace", skip(self, cx, conn, batch, request), fields(sql = %request.sql))]
    pub async fn execute<C: Connection>(
        &self,
        cx: &Cx,
        conn: &C,
        batch: &mut BatchCoordinator,
        request: MutationRequest,
    ) -> Outcome<MutationOutcome, Error> {
        match self {
            MutationExecutor::Batched => {
                try_outcome!(batch.add(cx, conn, request).await);
                Outcome::Ok(MutationOutcome::Deferred)
            }
            MutationExecutor::Single => {
                try_outcome!(batch.execute_pending(cx, conn).await);
                let rows = match conn.execute(cx, &request.sql, &request.params).await {
                    Outcome::Ok(n) => n,
                    Outcome::Err(e) => {
                        return Outcome::Err(e.with_statement(&request.sql, &request.context));
                    }
                    Outcome::Cancelled(r) => return Outcome::Cancelled(r),
                    Outcome::Panicked(p) => return Outcome::Panicked(p),
                };
                if let Err(e) =
                    request
                        .expectation
                        .verify(rows, &request.entity, &request.id, &request.sql)
                {
                    return Outcome::Err(e);
                }
                Outcome::Ok(MutationOutcome::Executed(rows))
            }
            MutationExecutor::PostInsertIdentity => {
                try_outcome!(batch.execute_pending(cx, conn).await);
                match conn.insert(cx, &request.sql, &request.params).await {
                    Outcome::Ok(key) if key.is_null() => Outcome::Err(Error::Assertion(format!(
                        "The database returned no generated identity value for {}",
                        request.entity
                    ))),
                    Outcome::Ok(key) => Outcome::Ok(MutationOutcome::Generated(key)),
                    Outcome::Err(e) => {
                        Outcome::Err(e.with_statement(&request.sql, &request.context))
                    }
                    Outcome::Cancelled(r) => Outcome::Cancelled(r),
                    Outcome::Panicked(p) => Outcome::Panicked(p),
                }
            }
            MutationExecutor::SelfExecuting(routine) => {
                try_outcome!(batch.execute_pending(cx, conn).await);
                let rows = try_outcome!(routine.perform(cx, conn, &request).await);
                Outcome::Ok(MutationOutcome::Executed(rows))
            }
        }
    }
}

#[derive(Debug)]
struct PendingStatement {
    params: Vec<Value>,
    expectation: Expectation,
    entity: String,
    id: Value,
    context: String,
}

/// Accumulates statements with identical SQL text into one round trip.
#[derive(Debug)]
pub struct BatchCoordinator {
    batch_size: usize,
    sql: Option<String>,
    pending: Vec<PendingStatement>,
    round_trips: u64,
}

impl BatchCoordinator {
    pub fn new(batch_size: usize) -> Self {
        Self {
            batch_size: batch_size.max(1),
            sql: None,
            pending: Vec::new(),
            round_trips: 0,
        }
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    /// Statements waiting in the current batch.
    pub fn pending(&self) -> usize {
        self.pending.len()
    }

    /// Number of batches executed so far.
    pub fn round_trips(&self) -> u64 {
        self.round_trips
    }

    /// Add a statement, executing the current batch first if its SQL differs and afterwards
    /// if the batch is full.
    pub async fn add<C: Connection>(
        &mut self,
        cx: &Cx,
        conn: &C,
        request: MutationRequest,
    ) -> Outcome<(), Error> {
        if self.sql.as_deref().is_some_and(|sql| sql != request.sql) {
            try_outcome!(self.execute_pending(cx, conn).await);
        }
        if self.sql.is_none() {
            self.sql = Some(request.sql);
        }
        self.pending.push(PendingStatement {
            params: request.params,
            expectation: request.expectation,
            entity: request.entity,
            id: request.id,
            context: request.context,
        });
        if self.pending.len() >= self.batch_size {
            try_outcome!(self.execute_pending(cx, conn).await);
        }
        Outcome::Ok(())
    }

    /// Execute the current batch, if any, and verify every statement's row count.
    pub async fn execute_pending<C: Connection>(
        &mut self,
        cx: &Cx,
        conn: &C,
    ) -> Outcome<(), Error> {
        let Some(sql) = self.sql.take() else {
            return Outcome::Ok(());
        };
        let pending = std::mem::take(&mut self.pending);
        if pending.is_empty() {
            return Outcome::Ok(());
        }
        self.round_trips += 1;

        let counts = if pending.len() == 1 {
            tracing::trace!(sql = %sql, "Executing single-statement batch");
            match conn.execute(cx, &sql, &pending[0].params).await {
                Outcome::Ok(n) => vec![n],
                Outcome::Err(e) => {
                    return Outcome::Err(e.with_statement(&sql, &pending[0].context));
                }
                Outcome::Cancelled(r) => return Outcome::Cancelled(r),
                Outcome::Panicked(p) => return Outcome::Panicked(p),
            }
        } else {
            tracing::debug!(sql = %sql, size = pending.len(), "Executing batch");
            let param_sets: Vec<Vec<Value>> = pending.iter().map(|p| p.params.clone()).collect();
            match conn.execute_batch(cx, &sql, &param_sets).await {
                Outcome::Ok(counts) => counts,
                Outcome::Err(e) => {
                    let context = format!("batch of {} ({})", pending.len(), pending[0].context);
                    return Outcome::Err(e.with_statement(&sql, context));
                }
                Outcome::Cancelled(r) => return Outcome::Cancelled(r),
                Outcome::Panicked(p) => return Outcome::Panicked(p),
            }
        };

        if counts.len() != pending.len() {
            return Outcome::Err(Error::Assertion(format!(
                "Batch returned {} row counts for {} statements: {}",
                counts.len(),
                pending.len(),
                sql
            )));
        }
        for (statement, rows) in pending.iter().zip(counts) {
            if let Err(e) = statement
                .expectation
                .verify(rows, &statement.entity, &statement.id, &sql)
            {
                return Outcome::Err(e);
            }
        }
        Outcome::Ok(())
    }

    /// Drop the current batch without executing it.
    pub fn abort(&mut self) {
        if !self.pending.is_empty() {
            tracing::debug!(discarded = self.pending.len(), "Discarding pending batch");
        }
        self.sql = None;
        self.pending.clear();
    }
}
