//! Event listeners: one decision procedure per session operation.
//!
//! Each listener validates and classifies its instance, then hands state transitions to the
//! cascade engine and the action queue. Checks that need no database run before the first
//! await.

mod delete;
mod flush;
mod load;
mod lock;
mod merge;
mod natural_id;
mod persist;
mod refresh;

use crate::Session;
use asupersync::{Cx, Outcome};
use unitflow_core::{Connection, EntityPersister, Error, LockMode, Result, Row, Value};
use unitflow_query::{LoadPlan, PlanKey, PlanKind};

impl<C: Connection> Session<C> {
    /// SQL of a cached single-branch plan for `persister`.
    pub(crate) fn single_plan_sql(
        &self,
        persister: &EntityPersister,
        kind: PlanKind,
        lock: LockMode,
        build: impl FnOnce() -> Result<LoadPlan>,
    ) -> Result<String> {
        let key = PlanKey::new(persister.name(), kind, lock, self.connection.dialect());
        let plan = self.factory.plan(&key, build)?;
        plan.branches
            .first()
            .map(|branch| branch.sql.clone())
            .ok_or_else(|| Error::Assertion(format!("empty {:?} plan for {}", key, persister.name())))
    }

    /// First row of `sql`, if any. Failures carry the statement and `context`.
    pub(crate) async fn select_first(
        &self,
        cx: &Cx,
        sql: &str,
        params: &[Value],
        context: &str,
    ) -> Outcome<Option<Row>, Error> {
        match self.connection.select(cx, sql, params).await {
            Outcome::Ok(mut cursor) => Outcome::Ok(cursor.next()),
            Outcome::Err(e) => Outcome::Err(e.with_statement(sql, context)),
            Outcome::Cancelled(r) => Outcome::Cancelled(r),
            Outcome::Panicked(p) => Outcome::Panicked(p),
        }
    }
}
