//! Native SQL queries and bulk statements.
//!
//! A [`NativeQuery`] carries its SQL, bind values and options. Entity queries must select the
//! mapped columns of the result entity's primary table by name; the initializer graph turns the
//! rows into managed instances exactly like a load by identifier.

use crate::context::EntityKey;
use crate::Session;
use asupersync::{Cx, Outcome};
use std::sync::Arc;
use unitflow_core::{
    Connection, Entity, EntityPersister, Error, LockMode, Result, Value, try_outcome, try_result,
};
use unitflow_query::plan::entity_load_plan;
use unitflow_query::{
    CachedResult, Expectation, MutationExecutor, MutationOutcome, MutationRequest, Paging,
    PlanKey, PlanKind, QueryKey, ResultShape, SecondarySelect, SelectBranch, SelectExecutor,
    TemporaryTableBulkDelete, TupleProcessor,
};

/// A native SQL query.
///
/// Built with [`Session::create_native_query`] and executed with [`Session::list`],
/// [`Session::list_tuples`], [`Session::single_result`] or [`Session::execute_update`].
#[derive(Debug, Clone, Default)]
pub struct NativeQuery {
    sql: String,
    params: Vec<Value>,
    /// Entity the rows map to; `None` for tuple and update queries.
    entity: Option<String>,
    /// Further statements of a split (table-per-class) query: `(entity, sql)`.
    branches: Vec<(String, String)>,
    /// Tables the statement reads or writes beyond those of the result entity.
    synchronized: Vec<String>,
    first: usize,
    max: Option<usize>,
    distinct: bool,
    cacheable: bool,
    read_only: Option<bool>,
    lock: LockMode,
}

impl NativeQuery {
    pub fn new(sql: impl Into<String>) -> Self {
        Self {
            sql: sql.into(),
            ..Self::default()
        }
    }

    /// Map rows to instances of `entity_name`.
    pub fn entity(mut self, entity_name: impl Into<String>) -> Self {
        self.entity = Some(entity_name.into());
        self
    }

    /// Add a statement for another concrete type; results are paged across statements in order.
    pub fn branch(mut self, entity_name: impl Into<String>, sql: impl Into<String>) -> Self {
        self.branches.push((entity_name.into(), sql.into()));
        self
    }

    /// Bind the next positional parameter.
    pub fn bind(mut self, value: impl Into<Value>) -> Self {
        self.params.push(value.into());
        self
    }

    pub fn params(mut self, params: Vec<Value>) -> Self {
        self.params = params;
        self
    }

    /// Declare a table the query touches, for auto-flush and cache invalidation.
    pub fn synchronize(mut self, table: impl Into<String>) -> Self {
        self.synchronized.push(table.into());
        self
    }

    pub fn first_result(mut self, first: usize) -> Self {
        self.first = first;
        self
    }

    pub fn max_results(mut self, max: usize) -> Self {
        self.max = Some(max);
        self
    }

    /// Drop repeated instances from entity results.
    pub fn distinct(mut self) -> Self {
        self.distinct = true;
        self
    }

    pub fn cacheable(mut self) -> Self {
        self.cacheable = true;
        self
    }

    /// Load entity results read-only (overrides the session default).
    pub fn read_only(mut self, read_only: bool) -> Self {
        self.read_only = Some(read_only);
        self
    }

    pub fn lock_mode(mut self, lock: LockMode) -> Self {
        self.lock = lock;
        self
    }

    pub fn sql(&self) -> &str {
        &self.sql
    }

    pub fn bound_params(&self) -> &[Value] {
        &self.params
    }

    fn paging(&self) -> Paging {
        Paging::new(self.first, self.max)
    }

    /// Cache key for this query, when its results may be cached.
    ///
    /// Everything that changes which rows come back, or how the instances are loaded, is part
    /// of the key.
    fn cache_key(&self, shape: ResultShape, filters: Vec<String>, read_only: bool) -> Option<QueryKey> {
        if !self.cacheable || self.lock != LockMode::None {
            return None;
        }
        let sql = std::iter::once(self.sql.as_str())
            .chain(self.branches.iter().map(|(_, sql)| sql.as_str()))
            .collect::<Vec<_>>()
            .join(" ; ");
        Some(
            QueryKey::new(sql, self.params.clone(), shape)
                .with_filters(filters)
                .with_paging(self.first, self.max)
                .with_result_options(self.distinct, read_only),
        )
    }
}

fn dedupe(entities: Vec<Entity>) -> Vec<Entity> {
    let mut unique: Vec<Entity> = Vec::with_capacity(entities.len());
    for entity in entities {
        if !unique.iter().any(|e| e.ptr_eq(&entity)) {
            unique.push(entity);
        }
    }
    unique
}

impl<C: Connection> Session<C> {
    pub fn create_native_query(&self, sql: impl Into<String>) -> NativeQuery {
        NativeQuery::new(sql)
    }

    /// Tables a query reads: the declared ones plus every table of its result types.
    fn query_spaces(&self, query: &NativeQuery, persisters: &[Arc<EntityPersister>]) -> Result<Vec<String>> {
        let mut spaces = query.synchronized.clone();
        for persister in persisters {
            for space in self.factory.metamodel().query_spaces(persister.name())? {
                if !spaces.contains(&space) {
                    spaces.push(space);
                }
            }
        }
        Ok(spaces)
    }

    // ========================================================================
    // Entity results
    // ========================================================================

    /// Execute an entity query.
    ///
    /// Pending changes to the tables read are flushed first (in `Auto` mode). Cacheable queries
    /// store the identifiers of their results and resolve them through the session on a hit.
    #[tracing::instrument(level = "debug", skip(self, cx, query), fields(sql = %query.sql))]
    pub async fn list(&mut self, cx: &Cx, query: &NativeQuery) -> Outcome<Vec<Entity>, Error> {
        try_result!(self.ensure_usable());
        let Some(entity_name) = query.entity.clone() else {
            return Outcome::Err(Error::IllegalArgument(format!(
                "native query has no entity result: {}",
                query.sql
            )));
        };
        let persister = try_result!(self.factory.persister(&entity_name));
        let mut persisters = vec![Arc::clone(&persister)];
        for (name, _) in &query.branches {
            persisters.push(try_result!(self.factory.persister(name)));
        }
        let spaces = try_result!(self.query_spaces(query, &persisters));
        try_outcome!(self.auto_flush(cx, &spaces).await);

        let read_only = query.read_only.unwrap_or(self.config.default_read_only);
        let key = if self.factory.query_cache_enabled() {
            query.cache_key(ResultShape::Entity(entity_name.clone()), self.enabled_filters(), read_only)
        } else {
            None
        };
        if let Some(key) = &key {
            if let Some(cached) = self.factory.cached_result(key) {
                match cached {
                    CachedResult::EntityKeys { entity, ids } => {
                        match try_outcome!(self.entities_from_cache(cx, &entity, ids, read_only).await) {
                            Some(entities) => {
                                tracing::debug!(results = entities.len(), "Query cache hit");
                                return Outcome::Ok(entities);
                            }
                            None => {
                                tracing::warn!(sql = %query.sql, "Cached query result references missing instances, re-running the query");
                                self.factory.evict_cached_result(key);
                            }
                        }
                    }
                    CachedResult::Tuples(_) => {
                        tracing::warn!(sql = %query.sql, "Cached result has the wrong shape, re-running the query");
                        self.factory.evict_cached_result(key);
                    }
                }
            }
        }
        let timestamp = self.factory.pre_query_timestamp();

        if query.lock.is_pessimistic() {
            try_outcome!(self.begin_if_needed(cx).await);
        }
        let suffix = self.connection.dialect().lock_suffix(query.lock);
        let branches: Vec<SelectBranch> = std::iter::once(query.sql.as_str())
            .chain(query.branches.iter().map(|(_, sql)| sql.as_str()))
            .map(|sql| SelectBranch::new(format!("{}{}", sql, suffix), query.params.clone()))
            .collect();
        let secondary = try_result!(self.secondary_selects(&persisters));

        let (rows, pending) = try_outcome!(
            self.run_entity_branches(
                cx,
                persisters,
                &branches,
                persister.id_column(),
                query.paging(),
                false
            )
            .await
        );
        try_outcome!(
            self.finish_load(cx, &secondary, pending, query.lock, read_only)
                .await
        );
        let mut entities: Vec<Entity> = rows.into_iter().map(|(entity, _)| entity).collect();
        if query.distinct {
            entities = dedupe(entities);
        }
        if query.lock.is_optimistic() {
            for entity in &entities {
                try_outcome!(self.acquire_lock(cx, entity, query.lock).await);
            }
        }

        if let Some(key) = key {
            let ids = entities.iter().map(Entity::id).collect();
            self.factory.cache_result(
                key,
                &spaces,
                CachedResult::EntityKeys {
                    entity: entity_name,
                    ids,
                },
                timestamp,
            );
        }
        tracing::debug!(results = entities.len(), "Native query listed");
        Outcome::Ok(entities)
    }

    /// At most one result of an entity query.
    pub async fn single_result(&mut self, cx: &Cx, query: &NativeQuery) -> Outcome<Option<Entity>, Error> {
        let mut results = try_outcome!(self.list(cx, query).await);
        if results.len() > 1 {
            return Outcome::Err(Error::IllegalState(format!(
                "query returned {} results where at most one was expected: {}",
                results.len(),
                query.sql
            )));
        }
        Outcome::Ok(results.pop())
    }

    /// Secondary-table selects of the result types, one per table.
    fn secondary_selects(&self, persisters: &[Arc<EntityPersister>]) -> Result<Vec<SecondarySelect>> {
        let dialect = self.connection.dialect();
        let mut selects: Vec<SecondarySelect> = Vec::new();
        for persister in persisters.iter().filter(|p| p.is_multi_table()) {
            let key = PlanKey::new(persister.name(), PlanKind::ById { keys: 1 }, LockMode::None, dialect);
            let plan = self.factory.plan(&key, || {
                entity_load_plan(self.factory.metamodel(), persister, dialect, 1, LockMode::None)
            })?;
            for select in &plan.secondary {
                if !selects.iter().any(|s| s.table == select.table) {
                    selects.push(select.clone());
                }
            }
        }
        Ok(selects)
    }

    /// Instances for cached identifiers, loading those the session does not hold.
    ///
    /// `None` when an identifier no longer resolves to a live instance.
    async fn entities_from_cache(
        &mut self,
        cx: &Cx,
        entity_name: &str,
        ids: Vec<Value>,
        read_only: bool,
    ) -> Outcome<Option<Vec<Entity>>, Error> {
        let persister = try_result!(self.factory.persister(entity_name));
        let missing: Vec<Value> = ids
            .iter()
            .filter(|id| self.live_instance(&persister, id).is_none())
            .cloned()
            .collect();
        if !missing.is_empty() {
            tracing::trace!(entity = %entity_name, missing = missing.len(), "Loading cached query results");
            try_outcome!(
                self.load_entities(cx, Arc::clone(&persister), missing.clone(), LockMode::None, false)
                    .await
            );
            if read_only {
                for id in &missing {
                    if let Some(entity) = self.live_instance(&persister, id) {
                        try_result!(self.set_read_only(&entity, true));
                    }
                }
            }
        }
        let mut entities = Vec::with_capacity(ids.len());
        for id in &ids {
            match self.live_instance(&persister, id) {
                Some(entity) => entities.push(entity),
                None => return Outcome::Ok(None),
            }
        }
        Outcome::Ok(Some(entities))
    }

    fn live_instance(&self, persister: &EntityPersister, id: &Value) -> Option<Entity> {
        let key = EntityKey::of(persister, id.clone());
        let entity = self.context.entity(&key)?;
        if !entity.is_initialized() {
            return None;
        }
        let entry = self.context.entry(entity)?;
        (!entry.status.is_deleted_or_gone()).then(|| entity.clone())
    }

    // ========================================================================
    // Tuple results
    // ========================================================================

    /// Execute a query returning raw value tuples.
    #[tracing::instrument(level = "debug", skip(self, cx, query), fields(sql = %query.sql))]
    pub async fn list_tuples(&mut self, cx: &Cx, query: &NativeQuery) -> Outcome<Vec<Vec<Value>>, Error> {
        try_result!(self.ensure_usable());
        let spaces = query.synchronized.clone();
        try_outcome!(self.auto_flush(cx, &spaces).await);

        let key = if self.factory.query_cache_enabled() {
            query.cache_key(ResultShape::Tuples(0), self.enabled_filters(), false)
        } else {
            None
        };
        if let Some(key) = &key {
            match self.factory.cached_result(key) {
                Some(CachedResult::Tuples(rows)) => {
                    tracing::debug!(results = rows.len(), "Query cache hit");
                    return Outcome::Ok(rows);
                }
                Some(CachedResult::EntityKeys { .. }) => {
                    tracing::warn!(sql = %query.sql, "Cached result has the wrong shape, re-running the query");
                    self.factory.evict_cached_result(key);
                }
                None => {}
            }
        }
        let timestamp = self.factory.pre_query_timestamp();

        if query.lock.is_pessimistic() {
            try_outcome!(self.begin_if_needed(cx).await);
        }
        let sql = format!("{}{}", query.sql, self.connection.dialect().lock_suffix(query.lock));
        let rows = try_outcome!(
            SelectExecutor::list(
                cx,
                &self.connection,
                &sql,
                &query.params,
                query.paging(),
                &mut TupleProcessor
            )
            .await
        );
        if let Some(key) = key {
            // Queries without declared tables can never be invalidated.
            if !spaces.is_empty() {
                self.factory
                    .cache_result(key, &spaces, CachedResult::Tuples(rows.clone()), timestamp);
            }
        }
        Outcome::Ok(rows)
    }

    // ========================================================================
    // Bulk statements
    // ========================================================================

    /// Execute an INSERT, UPDATE or DELETE statement and return the rows affected.
    ///
    /// Cached results read from the synchronized tables are invalidated; a statement declaring
    /// no tables invalidates every cached result. Managed instances are not refreshed.
    #[tracing::instrument(level = "debug", skip(self, cx, query), fields(sql = %query.sql))]
    pub async fn execute_update(&mut self, cx: &Cx, query: &NativeQuery) -> Outcome<u64, Error> {
        try_result!(self.ensure_usable());
        let mut spaces = query.synchronized.clone();
        if let Some(entity_name) = &query.entity {
            spaces.extend(try_result!(self.factory.metamodel().query_spaces(entity_name)));
        }
        try_outcome!(self.auto_flush(cx, &spaces).await);
        try_outcome!(self.begin_if_needed(cx).await);

        let request = MutationRequest {
            sql: query.sql.clone(),
            params: query.params.clone(),
            expectation: Expectation::None,
            entity: query.entity.clone().unwrap_or_default(),
            id: Value::Null,
            context: "native update".to_string(),
        };
        let outcome = MutationExecutor::Single
            .execute(cx, &self.connection, &mut self.batch, request)
            .await;
        let rows = match try_outcome!(outcome) {
            MutationOutcome::Executed(rows) => rows,
            _ => 0,
        };
        if spaces.is_empty() {
            let all = self.factory.all_spaces();
            self.record_written_spaces(&all);
        } else {
            self.record_written_spaces(&spaces);
        }
        tracing::debug!(rows, "Bulk statement executed");
        Outcome::Ok(rows)
    }

    /// Delete every row of `entity_name` matching `restriction` (a SQL condition over the
    /// primary table; empty for all rows).
    ///
    /// Entities spread over several tables go through a temporary id table so each table can be
    /// cleared by the same identifier set.
    #[tracing::instrument(level = "debug", skip(self, cx, params))]
    pub async fn bulk_delete(
        &mut self,
        cx: &Cx,
        entity_name: &str,
        restriction: &str,
        params: Vec<Value>,
    ) -> Outcome<u64, Error> {
        try_result!(self.ensure_usable());
        let persister = try_result!(self.factory.persister(entity_name));
        let spaces = try_result!(self.factory.metamodel().query_spaces(entity_name));
        try_outcome!(self.auto_flush(cx, &spaces).await);
        try_outcome!(self.begin_if_needed(cx).await);

        let dialect = self.connection.dialect();
        let table = dialect.quote_identifier(persister.table());
        let condition = if restriction.trim().is_empty() {
            String::new()
        } else {
            format!(" WHERE {}", restriction)
        };
        let (executor, sql) = if persister.is_multi_table() {
            let mut tables: Vec<(String, String)> = persister
                .secondary_tables()
                .iter()
                .map(|t| (t.table.clone(), t.key_column.clone()))
                .collect();
            tables.push((persister.table().to_string(), persister.id_column().to_string()));
            let routine = TemporaryTableBulkDelete {
                id_table: format!("ht_{}", persister.table()),
                id_column: persister.id_column().to_string(),
                tables,
            };
            let select = format!(
                "SELECT {} FROM {}{}",
                dialect.quote_identifier(persister.id_column()),
                table,
                condition
            );
            (MutationExecutor::SelfExecuting(routine), select)
        } else {
            (MutationExecutor::Single, format!("DELETE FROM {}{}", table, condition))
        };

        let request = MutationRequest {
            sql,
            params,
            expectation: Expectation::None,
            entity: persister.name().to_string(),
            id: Value::Null,
            context: format!("bulk delete {}", persister.name()),
        };
        let outcome = executor
            .execute(cx, &self.connection, &mut self.batch, request)
            .await;
        let rows = match try_outcome!(outcome) {
            MutationOutcome::Executed(rows) => rows,
            _ => 0,
        };
        self.record_written_spaces(&spaces);
        tracing::debug!(entity = %entity_name, rows, "Bulk delete executed");
        Outcome::Ok(rows)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builder_collects_options() {
        let query = NativeQuery::new("SELECT * FROM \"pig\" WHERE \"name\" = $1")
            .entity("GuineaPig")
            .bind("Hamtaro")
            .synchronize("pig")
            .first_result(2)
            .max_results(5)
            .cacheable();
        assert_eq!(query.bound_params(), &[Value::Text("Hamtaro".into())]);
        assert_eq!(query.paging(), Paging::new(2, Some(5)));
        let key = query
            .cache_key(ResultShape::Entity("GuineaPig".into()), vec!["b".into(), "a".into()], false)
            .unwrap();
        assert_eq!(key.filters, vec!["a".to_string(), "b".to_string()]);
        assert_eq!(key.first, 2);
        assert_eq!(key.max, Some(5));
    }

    #[test]
    fn locked_or_uncacheable_queries_have_no_cache_key() {
        let plain = NativeQuery::new("SELECT 1");
        assert!(plain.cache_key(ResultShape::Tuples(0), Vec::new(), false).is_none());
        let locked = NativeQuery::new("SELECT 1")
            .cacheable()
            .lock_mode(LockMode::PessimisticWrite);
        assert!(locked.cache_key(ResultShape::Tuples(0), Vec::new(), false).is_none());
    }

    #[test]
    fn branches_are_part_of_the_cache_key() {
        let one = NativeQuery::new("SELECT a").cacheable();
        let two = NativeQuery::new("SELECT a").branch("Other", "SELECT b").cacheable();
        let k1 = one.cache_key(ResultShape::Tuples(0), Vec::new(), false).unwrap();
        let k2 = two.cache_key(ResultShape::Tuples(0), Vec::new(), false).unwrap();
        assert_ne!(k1.sql, k2.sql);
    }

    #[test]
    fn distinct_and_read_only_are_part_of_the_cache_key() {
        let plain = NativeQuery::new("SELECT a").entity("GuineaPig").cacheable();
        let shape = || ResultShape::Entity("GuineaPig".into());
        let base = plain.cache_key(shape(), Vec::new(), false).unwrap();
        let distinct = plain.clone().distinct().cache_key(shape(), Vec::new(), false).unwrap();
        let read_only = plain.cache_key(shape(), Vec::new(), true).unwrap();
        assert!(distinct.distinct && !base.distinct);
        assert_ne!(base, distinct);
        assert_ne!(base, read_only);
    }
}
