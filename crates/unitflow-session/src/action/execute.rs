//! Executing queued actions through the mutation executors.

use super::{
    Action, CollectionRecreateAction, CollectionRemoveAction, CollectionUpdateAction,
    EntityDeleteAction, EntityInsertAction, EntityUpdateAction,
};
use crate::Session;
use crate::context::{EntityKey, EntityStatus};
use crate::listener::EventType;
use asupersync::{Cx, Outcome};
use unitflow_core::{Connection, Entity, Error, Value, try_outcome, try_result};
use unitflow_query::statement::{
    collection_statements, delete_statements, insert_statements, update_statements,
};
use unitflow_query::{
    BindingSource, MutationExecutor, MutationOutcome, MutationRequest, TableStatement,
};

/// Identifier of a collection element, which must have been saved by now.
fn element_key(element: &Entity, role: &str) -> Result<Value, Error> {
    let id = element.id();
    if id.is_null() {
        return Err(Error::TransientObject(format!(
            "collection {} references an unsaved transient instance of {}",
            role,
            element.entity_name()
        )));
    }
    Ok(id)
}

impl<C: Connection> Session<C> {
    /// Execute every queued action in order and drain the pending batch.
    pub(crate) async fn execute_actions(&mut self, cx: &Cx) -> Outcome<(), Error> {
        let actions = self.actions.drain();
        self.run_actions(cx, actions).await
    }

    /// Execute only the queued inserts (identity inserts need their key right away).
    pub(crate) async fn execute_inserts(&mut self, cx: &Cx) -> Outcome<(), Error> {
        let inserts = self.actions.take_inserts();
        self.run_actions(cx, inserts).await
    }

    async fn run_actions(&mut self, cx: &Cx, actions: Vec<Action>) -> Outcome<(), Error> {
        if actions.is_empty() {
            return Outcome::Ok(());
        }
        let mut spaces: Vec<String> = Vec::new();
        for action in actions {
            for space in action.spaces() {
                if !spaces.contains(&space) {
                    spaces.push(space);
                }
            }
            let description = action.describe();
            let outcome = self.execute_action(cx, action).await;
            if !matches!(outcome, Outcome::Ok(())) {
                tracing::warn!(action = %description, "Action failed, halting the queue");
                return self.halt(outcome, &spaces);
            }
        }
        let outcome = self.batch.execute_pending(cx, &self.connection).await;
        if !matches!(outcome, Outcome::Ok(())) {
            return self.halt(outcome, &spaces);
        }
        self.record_written_spaces(&spaces);
        Outcome::Ok(())
    }

    /// Poison the queue after a failure; statements may already have run.
    fn halt(&mut self, outcome: Outcome<(), Error>, spaces: &[String]) -> Outcome<(), Error> {
        self.actions.poison();
        self.batch.abort();
        self.record_written_spaces(spaces);
        outcome
    }

    async fn execute_action(&mut self, cx: &Cx, action: Action) -> Outcome<(), Error> {
        let context = action.describe();
        match action {
            Action::Insert(a) => self.execute_insert(cx, a, false, &context).await,
            Action::IdentityInsert(a) => self.execute_insert(cx, a, true, &context).await,
            Action::Update(a) => self.execute_entity_update(cx, a, &context).await,
            Action::Delete(a) | Action::OrphanRemoval(a) => {
                self.execute_delete(cx, a, &context).await
            }
            Action::CollectionRecreate(a) => self.execute_recreate(cx, a, &context).await,
            Action::CollectionUpdate(a) => self.execute_collection_update(cx, a, &context).await,
            Action::CollectionRemove(a) => self.execute_collection_remove(cx, a, &context).await,
        }
    }

    /// Run one statement through `executor` and return what it produced.
    #[allow(clippy::too_many_arguments)]
    pub(crate) async fn run_statement(
        &mut self,
        cx: &Cx,
        executor: MutationExecutor,
        statement: &TableStatement,
        params: Vec<Value>,
        entity: &str,
        id: &Value,
        context: &str,
    ) -> Outcome<MutationOutcome, Error> {
        let request = MutationRequest {
            sql: statement.sql.clone(),
            params,
            expectation: statement.expectation,
            entity: entity.to_string(),
            id: id.clone(),
            context: context.to_string(),
        };
        executor
            .execute(cx, &self.connection, &mut self.batch, request)
            .await
    }

    fn statement_executor(&self) -> MutationExecutor {
        MutationExecutor::for_statement(false, self.batch.batch_size())
    }

    async fn execute_insert(
        &mut self,
        cx: &Cx,
        action: EntityInsertAction,
        identity: bool,
        context: &str,
    ) -> Outcome<(), Error> {
        let EntityInsertAction {
            entity,
            persister,
            mut id,
        } = action;
        try_result!(self.factory.listeners().fire(EventType::PreInsert, &entity));
        let state = try_result!(entity.snapshot());
        let discriminator = persister.discriminator().map(|d| d.value.clone());
        let statements = insert_statements(&persister, self.connection.dialect(), !identity);

        for statement in &statements {
            let executor = if identity && statement.table == persister.table() {
                MutationExecutor::PostInsertIdentity
            } else {
                self.statement_executor()
            };
            let params = statement.bind(&BindingSource {
                id: Some(&id),
                state: &state,
                discriminator: discriminator.as_ref(),
                ..BindingSource::default()
            });
            let outcome = try_outcome!(
                self.run_statement(cx, executor, statement, params, persister.name(), &id, context)
                    .await
            );
            if let MutationOutcome::Generated(key) = outcome {
                tracing::debug!(entity = %persister.name(), id = %key, "Identity generated");
                id = key;
                entity.set_id(id.clone());
                let entity_key = EntityKey::of(&persister, id.clone());
                if let Some(existing) = self.context.entity(&entity_key) {
                    if !existing.ptr_eq(&entity) {
                        return Outcome::Err(Error::NonUniqueObject {
                            entity: persister.name().to_string(),
                            id: id.to_string(),
                        });
                    }
                }
                if let Some(entry) = self.context.entry_mut(&entity) {
                    entry.id = id.clone();
                }
                self.context.add_entity(entity_key, entity.clone());
            }
        }

        if let Some(entry) = self.context.entry_mut(&entity) {
            entry.status = EntityStatus::Managed;
            entry.exists_in_database = true;
            entry.loaded_state = Some(state);
            entry.version = entity.version();
        }
        if persister.has_natural_id() {
            let natural = try_result!(entity.natural_id());
            self.context.cache_natural_id(&persister, natural, id);
        }
        try_result!(self.factory.listeners().fire(EventType::PostInsert, &entity));
        Outcome::Ok(())
    }

    async fn execute_entity_update(
        &mut self,
        cx: &Cx,
        action: EntityUpdateAction,
        context: &str,
    ) -> Outcome<(), Error> {
        let EntityUpdateAction {
            entity,
            persister,
            id,
            state,
            dirty,
            previous_version,
            next_version,
        } = action;
        try_result!(self.factory.listeners().fire(EventType::PreUpdate, &entity));
        let statements = update_statements(&persister, self.connection.dialect(), &dirty);
        for statement in &statements {
            let params = statement.bind(&BindingSource {
                id: Some(&id),
                state: &state,
                previous_version: previous_version.as_ref(),
                ..BindingSource::default()
            });
            let executor = self.statement_executor();
            try_outcome!(
                self.run_statement(cx, executor, statement, params, persister.name(), &id, context)
                    .await
            );
        }

        let deleted = self
            .context
            .entry(&entity)
            .is_some_and(|e| e.status == EntityStatus::Deleted);
        if let Some(version) = next_version.as_ref().filter(|_| !deleted) {
            try_result!(entity.set_version(version.clone()));
        }
        if let Some(entry) = self.context.entry_mut(&entity) {
            entry.loaded_state = Some(state);
            if next_version.is_some() {
                entry.version = next_version;
            }
        }
        try_result!(self.factory.listeners().fire(EventType::PostUpdate, &entity));
        Outcome::Ok(())
    }

    async fn execute_delete(
        &mut self,
        cx: &Cx,
        action: EntityDeleteAction,
        context: &str,
    ) -> Outcome<(), Error> {
        let EntityDeleteAction {
            entity,
            persister,
            id,
            version,
            unloaded,
        } = action;
        if !unloaded {
            try_result!(self.factory.listeners().fire(EventType::PreDelete, &entity));
        }
        let check_version = !unloaded && version.is_some();
        let statements = delete_statements(&persister, self.connection.dialect(), check_version);
        for statement in &statements {
            let params = statement.bind(&BindingSource {
                id: Some(&id),
                previous_version: version.as_ref(),
                ..BindingSource::default()
            });
            let executor = self.statement_executor();
            try_outcome!(
                self.run_statement(cx, executor, statement, params, persister.name(), &id, context)
                    .await
            );
        }

        let key = EntityKey::of(&persister, id);
        if let Some(entry) = self.context.entry_mut(&entity) {
            entry.status = EntityStatus::Gone;
            entry.exists_in_database = false;
        }
        if self
            .context
            .entity(&key)
            .is_some_and(|registered| registered.ptr_eq(&entity))
        {
            self.context.remove_entity(&key);
        }
        self.context.remove_natural_id(&key);
        if unloaded {
            self.context.forget_deleted_unloaded(&key);
        } else {
            try_result!(self.factory.listeners().fire(EventType::PostDelete, &entity));
        }
        Outcome::Ok(())
    }

    async fn execute_recreate(
        &mut self,
        cx: &Cx,
        action: CollectionRecreateAction,
        context: &str,
    ) -> Outcome<(), Error> {
        let statements = collection_statements(&action.persister, self.connection.dialect());
        for element in &action.elements {
            let element_id = try_result!(element_key(element, action.persister.role()));
            let params = statements.insert_row.bind(&BindingSource {
                owner_key: Some(&action.key),
                element_key: Some(&element_id),
                ..BindingSource::default()
            });
            let executor = self.statement_executor();
            try_outcome!(
                self.run_statement(
                    cx,
                    executor,
                    &statements.insert_row,
                    params,
                    action.persister.role(),
                    &action.key,
                    context
                )
                .await
            );
        }
        Outcome::Ok(())
    }

    async fn execute_collection_update(
        &mut self,
        cx: &Cx,
        action: CollectionUpdateAction,
        context: &str,
    ) -> Outcome<(), Error> {
        let statements = collection_statements(&action.persister, self.connection.dialect());
        let rows = action
            .removed
            .iter()
            .map(|e| (&statements.delete_row, e))
            .chain(action.added.iter().map(|e| (&statements.insert_row, e)));
        for (statement, element) in rows {
            let element_id = element.id();
            if element_id.is_null() && statement == &statements.delete_row {
                continue;
            }
            let element_id = try_result!(element_key(element, action.persister.role()));
            let params = statement.bind(&BindingSource {
                owner_key: Some(&action.key),
                element_key: Some(&element_id),
                ..BindingSource::default()
            });
            let executor = self.statement_executor();
            try_outcome!(
                self.run_statement(
                    cx,
                    executor,
                    statement,
                    params,
                    action.persister.role(),
                    &action.key,
                    context
                )
                .await
            );
        }
        Outcome::Ok(())
    }

    async fn execute_collection_remove(
        &mut self,
        cx: &Cx,
        action: CollectionRemoveAction,
        context: &str,
    ) -> Outcome<(), Error> {
        if action.cascade_delete_enabled {
            tracing::trace!(role = %action.persister.role(), key = %action.key, "Rows removed by the database");
            return Outcome::Ok(());
        }
        let statements = collection_statements(&action.persister, self.connection.dialect());
        let params = statements.remove_all.bind(&BindingSource {
            owner_key: Some(&action.key),
            ..BindingSource::default()
        });
        let executor = self.statement_executor();
        try_outcome!(
            self.run_statement(
                cx,
                executor,
                &statements.remove_all,
                params,
                action.persister.role(),
                &action.key,
                context
            )
            .await
        );
        Outcome::Ok(())
    }
}
