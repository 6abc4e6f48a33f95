//! Remove: schedule the deletion of an instance and cascade it.

use crate::action::{Action, EntityDeleteAction};
use crate::cascade::{CascadeContext, CascadePoint, CascadingAction};
use crate::context::{CollectionEntry, EntityEntry, EntityKey, EntityStatus};
use crate::listener::EventType;
use crate::{BoxFuture, Session};
use asupersync::{Cx, Outcome};
use std::sync::Arc;
use unitflow_core::{
    Connection, Entity, EntityPersister, Error, LockMode, PropertyKind, PropertyValue, Result,
    Value, try_outcome, try_result,
};
use unitflow_query::PlanKind;
use unitflow_query::plan::existence_plan;

impl<C: Connection> Session<C> {
    /// Schedule the deletion of `entity`, cascading along `REMOVE` associations.
    ///
    /// Removing an instance that is already deleted is a no-op.
    #[tracing::instrument(level = "debug", skip(self, cx, entity), fields(entity = ?entity))]
    pub async fn remove(&mut self, cx: &Cx, entity: &Entity) -> Outcome<(), Error> {
        try_result!(self.ensure_usable());
        let mut context = CascadeContext::new();
        self.delete_inner(cx, entity.clone(), &mut context, false).await
    }

    /// Can `persister`'s instances be deleted by identifier without loading them?
    fn can_delete_unloaded(&self, persister: &EntityPersister) -> bool {
        let listeners = self.factory.listeners();
        persister.can_delete_unloaded()
            && self.factory.interceptor().is_none()
            && [EventType::PreRemove, EventType::PreDelete, EventType::PostDelete]
                .into_iter()
                .all(|event| !listeners.has_any(event, persister.name()))
    }

    pub(crate) fn delete_inner<'a>(
        &'a mut self,
        cx: &'a Cx,
        entity: Entity,
        context: &'a mut CascadeContext,
        orphan: bool,
    ) -> BoxFuture<'a, ()> {
        Box::pin(async move {
            let mut entity = entity;
            if !entity.is_initialized() {
                let persister = entity.persister();
                let id = entity.id();
                let key = EntityKey::of(&persister, id.clone());
                match self.context.entity(&key).cloned() {
                    Some(registered) if registered.is_initialized() => entity = registered,
                    _ => {
                        if self.can_delete_unloaded(&persister) {
                            if !self.context.mark_deleted_unloaded(key.clone()) {
                                tracing::trace!(entity = %key, "Already deleted");
                                return Outcome::Ok(());
                            }
                            tracing::debug!(entity = %key, "Deleting without loading");
                            self.actions.add_action(Action::Delete(EntityDeleteAction {
                                entity,
                                persister,
                                id,
                                version: None,
                                unloaded: true,
                            }));
                            return Outcome::Ok(());
                        }
                        try_outcome!(self.initialize_reference(cx, entity.clone()).await);
                    }
                }
            }

            match self.context.entry(&entity).map(|entry| entry.status) {
                Some(status) if status.is_deleted_or_gone() => {
                    tracing::trace!(entity = ?entity, "Already deleted");
                    return Outcome::Ok(());
                }
                Some(_) => {}
                None => {
                    if try_outcome!(self.is_transient(cx, &entity).await) {
                        tracing::debug!(entity = ?entity, "Deleting a transient instance: cascading only");
                        if !context.visit(&entity) {
                            return Outcome::Ok(());
                        }
                        try_outcome!(
                            self.cascade(
                                cx,
                                CascadingAction::Delete,
                                CascadePoint::AfterInsertBeforeDelete,
                                entity.clone(),
                                context
                            )
                            .await
                        );
                        return self
                            .cascade(
                                cx,
                                CascadingAction::Delete,
                                CascadePoint::BeforeInsertAfterDelete,
                                entity,
                                context,
                            )
                            .await;
                    }
                    if self.factory.options().jpa_compliance {
                        return Outcome::Err(Error::IllegalArgument(format!(
                            "removing a detached instance {:?}",
                            entity
                        )));
                    }
                    if entity.id().is_null() {
                        return Outcome::Err(Error::TransientObject(format!(
                            "cannot remove {:?}: its identifier is null",
                            entity
                        )));
                    }
                    tracing::debug!(entity = ?entity, "Reassociating a detached instance for delete");
                    try_result!(self.reassociate(&entity));
                }
            }
            self.delete_managed(cx, entity, context, orphan).await
        })
    }

    /// Is an untracked instance transient (never saved)?
    ///
    /// Decided from the identifier and version when possible, else by an existence SELECT.
    async fn is_transient(&mut self, cx: &Cx, entity: &Entity) -> Outcome<bool, Error> {
        let persister = entity.persister();
        let id = entity.id();
        if persister.id_generation().is_generated() && id.is_null() {
            return Outcome::Ok(true);
        }
        if persister.is_versioned() && entity.version().is_none_or(|v| v.is_null()) {
            return Outcome::Ok(true);
        }
        if id.is_null() {
            return Outcome::Ok(false);
        }
        let dialect = self.connection.dialect();
        let sql = try_result!(self.single_plan_sql(&persister, PlanKind::Existence, LockMode::None, || {
            Ok(existence_plan(&persister, dialect))
        }));
        let row = try_outcome!(self.select_first(cx, &sql, &[id], "existence check").await);
        Outcome::Ok(row.is_none())
    }

    /// Start managing a detached instance with its current state as the loaded state.
    pub(crate) fn reassociate(&mut self, entity: &Entity) -> Result<()> {
        let persister = entity.persister();
        let id = entity.id();
        let key = EntityKey::of(&persister, id.clone());
        if self
            .context
            .entity(&key)
            .is_some_and(|existing| !existing.ptr_eq(entity))
        {
            return Err(Error::NonUniqueObject {
                entity: persister.name().to_string(),
                id: id.to_string(),
            });
        }
        let mut entry = EntityEntry::new(entity.clone(), persister, id, EntityStatus::Managed);
        entry.loaded_state = Some(entity.snapshot()?);
        entry.version = entity.version();
        entry.exists_in_database = true;
        self.context.add_entry(entry)
    }

    async fn delete_managed(
        &mut self,
        cx: &Cx,
        entity: Entity,
        context: &mut CascadeContext,
        orphan: bool,
    ) -> Outcome<(), Error> {
        if !context.visit(&entity) {
            return Outcome::Ok(());
        }
        let persister = entity.persister();
        try_result!(self.factory.listeners().fire(EventType::PreRemove, &entity));

        let state = try_result!(entity.snapshot());
        try_result!(self.register_owned_collections(&entity, &persister));
        if let Some(interceptor) = self.factory.interceptor() {
            try_result!(interceptor.on_remove(&entity));
        }
        let deleted_state = try_result!(self.nullify_transient_references(&entity, &persister, state));

        let Some(entry) = self.context.entry_mut(&entity) else {
            return Outcome::Err(Error::Assertion(format!("no entry for {:?}", entity)));
        };
        entry.status = EntityStatus::Deleted;
        entry.deleted_state = Some(deleted_state);
        let id = entry.id.clone();
        let version = entry.version.clone().filter(|_| persister.is_versioned());
        let key = entry.key();
        self.context.add_nullifiable(key);
        tracing::debug!(entity = ?entity, orphan, "Marked deleted");

        try_outcome!(
            self.cascade(
                cx,
                CascadingAction::Delete,
                CascadePoint::AfterInsertBeforeDelete,
                entity.clone(),
                context
            )
            .await
        );

        let action = EntityDeleteAction {
            entity: entity.clone(),
            persister: Arc::clone(&persister),
            id,
            version,
            unloaded: false,
        };
        self.actions.add_action(if orphan {
            Action::OrphanRemoval(action)
        } else {
            Action::Delete(action)
        });

        try_outcome!(
            self.cascade(
                cx,
                CascadingAction::Delete,
                CascadePoint::BeforeInsertAfterDelete,
                entity.clone(),
                context
            )
            .await
        );

        if self.factory.options().identifier_rollback && persister.id_generation().is_generated() {
            entity.set_id(Value::Null);
        }
        Outcome::Ok(())
    }

    /// Give every collection of a deleted owner an entry so flush schedules its removal,
    /// without loading uninitialized ones.
    fn register_owned_collections(&mut self, owner: &Entity, persister: &EntityPersister) -> Result<()> {
        for (index, property) in persister.properties().iter().enumerate() {
            if !property.is_collection() {
                continue;
            }
            let PropertyValue::Collection(collection) = owner.property(index)? else {
                continue;
            };
            if self.context.collection_entry(&collection).is_some() {
                continue;
            }
            let collection_persister = self.factory.metamodel().collection(&collection.role())?;
            let key = owner.id();
            collection.set_key(key.clone());
            self.context.add_collection(CollectionEntry::loaded(
                collection,
                collection_persister,
                owner.clone(),
                key,
            ));
        }
        Ok(())
    }

    /// Deleted state with nullable references to transient or being-deleted instances nulled.
    fn nullify_transient_references(
        &self,
        entity: &Entity,
        persister: &EntityPersister,
        mut state: Vec<Value>,
    ) -> Result<Vec<Value>> {
        for (index, property) in persister.properties().iter().enumerate() {
            if !property.nullable || !matches!(property.kind, PropertyKind::ToOne { .. }) {
                continue;
            }
            let PropertyValue::ToOne(Some(target)) = entity.property(index)? else {
                continue;
            };
            let nullifiable = match self.context.entry(&target) {
                Some(entry) => {
                    entry.status == EntityStatus::Saving || self.context.is_nullifiable(&entry.key())
                }
                None => target.is_initialized() && target.id().is_null(),
            };
            if nullifiable {
                tracing::trace!(entity = ?entity, property = %property.name, "Reference nulled in deleted state");
                state[index] = Value::Null;
            }
        }
        Ok(state)
    }
}
