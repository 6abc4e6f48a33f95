//! Lock: upgrade the lock held on a managed instance, and the optimistic checks run before the
//! transaction completes.

use crate::action::BeforeCompletion;
use crate::cascade::{CascadeContext, CascadePoint, CascadingAction};
use crate::{BoxFuture, Session};
use asupersync::{Cx, Outcome};
use std::sync::Arc;
use unitflow_core::{
    Connection, Entity, EntityPersister, Error, LockMode, Value, try_outcome, try_result,
};
use unitflow_query::plan::{lock_plan, version_plan};
use unitflow_query::statement::version_increment_statement;
use unitflow_query::{BindingSource, MutationExecutor, PlanKind};

impl<C: Connection> Session<C> {
    /// Acquire `mode` on a managed instance, cascading along `LOCK` associations.
    ///
    /// Pessimistic modes issue a locking SELECT now; optimistic modes verify (or increment) the
    /// version when the transaction commits. Requesting a mode no stronger than the one held is
    /// a no-op.
    #[tracing::instrument(level = "debug", skip(self, cx, entity), fields(entity = ?entity))]
    pub async fn lock(&mut self, cx: &Cx, entity: &Entity, mode: LockMode) -> Outcome<(), Error> {
        try_result!(self.ensure_usable());
        let mut context = CascadeContext::new();
        self.lock_inner(cx, entity.clone(), mode, &mut context).await
    }

    pub(crate) fn lock_inner<'a>(
        &'a mut self,
        cx: &'a Cx,
        entity: Entity,
        mode: LockMode,
        context: &'a mut CascadeContext,
    ) -> BoxFuture<'a, ()> {
        Box::pin(async move {
            if !context.visit(&entity) {
                return Outcome::Ok(());
            }
            if !entity.is_initialized() {
                try_outcome!(self.initialize_reference(cx, entity.clone()).await);
            }
            try_outcome!(self.acquire_lock(cx, &entity, mode).await);
            self.cascade(cx, CascadingAction::Lock(mode), CascadePoint::AfterLock, entity, context)
                .await
        })
    }

    /// Upgrade the lock held on `entity` to `mode`.
    pub(crate) async fn acquire_lock(
        &mut self,
        cx: &Cx,
        entity: &Entity,
        mode: LockMode,
    ) -> Outcome<(), Error> {
        let Some(entry) = self.context.entry(entity) else {
            return Outcome::Err(Error::IllegalArgument(format!(
                "locking an unmanaged instance {:?}",
                entity
            )));
        };
        if entry.status.is_deleted_or_gone() {
            return Outcome::Err(Error::IllegalArgument(format!(
                "locking a removed instance {:?}",
                entity
            )));
        }
        if !mode.greater_than(entry.lock_mode) {
            return Outcome::Ok(());
        }
        let persister = Arc::clone(&entry.persister);
        let id = entry.id.clone();
        let version = entry.version.clone().filter(|v| !v.is_null());

        if (mode.is_optimistic() || mode.forces_increment()) && !persister.is_versioned() {
            return Outcome::Err(Error::IllegalArgument(format!(
                "lock mode {} requires a versioned entity; {} is not versioned",
                mode.as_str(),
                persister.name()
            )));
        }

        if mode.is_pessimistic() {
            try_outcome!(self.begin_if_needed(cx).await);
            let dialect = self.connection.dialect();
            let sql = try_result!(self.single_plan_sql(&persister, PlanKind::Lock, mode, || {
                Ok(lock_plan(&persister, dialect, mode))
            }));
            let mut params = vec![id.clone()];
            if persister.is_versioned() {
                params.push(version.clone().unwrap_or(Value::Null));
            }
            let row = try_outcome!(self.select_first(cx, &sql, &params, "pessimistic lock").await);
            if row.is_none() {
                return Outcome::Err(if persister.is_versioned() {
                    Error::stale_state(persister.name(), &id)
                } else {
                    Error::ObjectNotFound {
                        entity: persister.name().to_string(),
                        id: id.to_string(),
                    }
                });
            }
            if mode == LockMode::PessimisticForceIncrement {
                try_outcome!(
                    self.force_increment(cx, entity, &persister, &id, version.unwrap_or(Value::Null))
                        .await
                );
            }
        } else if mode.is_optimistic() {
            let version = version.unwrap_or(Value::Null);
            let process = if mode.forces_increment() {
                BeforeCompletion::ForceIncrement {
                    entity: entity.clone(),
                    persister: Arc::clone(&persister),
                    id: id.clone(),
                    version,
                }
            } else {
                BeforeCompletion::VerifyVersion {
                    entity: entity.clone(),
                    persister: Arc::clone(&persister),
                    id: id.clone(),
                    version,
                }
            };
            self.actions.register_before_completion(process);
        }

        if let Some(entry) = self.context.entry_mut(entity) {
            entry.lock_mode = mode;
        }
        tracing::debug!(entity = ?entity, mode = mode.as_str(), "Lock acquired");
        Outcome::Ok(())
    }

    /// Increment the version of `entity` in the database and in memory.
    async fn force_increment(
        &mut self,
        cx: &Cx,
        entity: &Entity,
        persister: &Arc<EntityPersister>,
        id: &Value,
        version: Value,
    ) -> Outcome<(), Error> {
        let Some(statement) = version_increment_statement(persister, self.connection.dialect()) else {
            return Outcome::Ok(());
        };
        let Some(version_index) = persister.version_index() else {
            return Outcome::Ok(());
        };
        let next = try_result!(version.next_version());
        let mut state = try_result!(entity.snapshot());
        state[version_index] = next.clone();
        let params = statement.bind(&BindingSource {
            id: Some(id),
            state: &state,
            previous_version: Some(&version),
            ..BindingSource::default()
        });
        let context = format!("version increment {:?}", entity);
        try_outcome!(
            self.run_statement(
                cx,
                MutationExecutor::Single,
                &statement,
                params,
                persister.name(),
                id,
                &context
            )
            .await
        );
        try_result!(entity.set_version(next.clone()));
        if let Some(entry) = self.context.entry_mut(entity) {
            if let Some(loaded) = entry.loaded_state.as_mut() {
                loaded[version_index] = next.clone();
            }
            entry.version = Some(next);
        }
        Outcome::Ok(())
    }

    /// Version recorded for `entity`; flushed updates advance it after the lock was taken.
    fn current_version(&self, entity: &Entity) -> Option<Value> {
        self.context.entry(entity).and_then(|entry| entry.version.clone())
    }

    /// Run the optimistic checks registered for this transaction.
    pub(crate) async fn before_completion(&mut self, cx: &Cx) -> Outcome<(), Error> {
        for process in self.actions.take_before_completion() {
            match process {
                BeforeCompletion::VerifyVersion {
                    entity,
                    persister,
                    id,
                    version,
                } => {
                    let version = self.current_version(&entity).unwrap_or(version);
                    let dialect = self.connection.dialect();
                    let sql = try_result!(self.single_plan_sql(
                        &persister,
                        PlanKind::Version,
                        LockMode::None,
                        || version_plan(&persister, dialect)
                    ));
                    let row = try_outcome!(
                        self.select_first(cx, &sql, std::slice::from_ref(&id), "version check")
                            .await
                    );
                    let current = row.and_then(|r| r.get(0).cloned());
                    if !current.is_some_and(|v| v.same_identifier(&version)) {
                        tracing::debug!(entity = %persister.name(), id = %id, "Version check failed");
                        return Outcome::Err(Error::stale_state(persister.name(), &id));
                    }
                }
                BeforeCompletion::ForceIncrement {
                    entity,
                    persister,
                    id,
                    version,
                } => {
                    let version = self.current_version(&entity).unwrap_or(version);
                    try_outcome!(self.force_increment(cx, &entity, &persister, &id, version).await);
                }
            }
        }
        Outcome::Ok(())
    }
}
