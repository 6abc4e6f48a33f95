//! Merge: copy the state of a detached or transient graph onto managed instances.

use crate::cascade::{CascadeContext, CascadePoint, CascadingAction};
use crate::context::{EntityKey, EntityStatus};
use crate::loader::resolve_reference;
use crate::{BoxFuture, Session};
use asupersync::{Cx, Outcome};
use std::sync::Arc;
use unitflow_core::{
    CascadeStyle, Connection, Entity, EntityPersister, Error, IdGeneration, LockMode,
    PropertyValue, Value, try_outcome, try_result,
};

impl<C: Connection> Session<C> {
    /// Copy the state of `entity` onto the managed instance with the same identity and return
    /// that instance.
    ///
    /// Transient instances are copied into new instances that are persisted. The argument
    /// itself never becomes managed unless it already was.
    #[tracing::instrument(level = "debug", skip(self, cx, entity), fields(entity = ?entity))]
    pub async fn merge(&mut self, cx: &Cx, entity: &Entity) -> Outcome<Entity, Error> {
        try_result!(self.ensure_usable());
        let mut context = CascadeContext::new();
        self.merge_inner(cx, entity.clone(), &mut context).await
    }

    pub(crate) fn merge_inner<'a>(
        &'a mut self,
        cx: &'a Cx,
        source: Entity,
        context: &'a mut CascadeContext,
    ) -> BoxFuture<'a, Entity> {
        Box::pin(async move {
            if let Some(copy) = context.copy_of(&source) {
                return Outcome::Ok(copy.clone());
            }
            let persister = source.persister();

            if !source.is_initialized() {
                let key = EntityKey::of(&persister, source.id());
                let managed = match self.context.entity(&key) {
                    Some(managed) => managed.clone(),
                    None => {
                        self.context.add_entity(key, source.clone());
                        source.clone()
                    }
                };
                context.record_copy(&source, managed.clone());
                return Outcome::Ok(managed);
            }

            if let Some(status) = self.context.entry(&source).map(|entry| entry.status) {
                if status.is_deleted_or_gone() {
                    return Outcome::Err(Error::IllegalArgument(format!(
                        "merging a removed instance {:?}",
                        source
                    )));
                }
                context.record_copy(&source, source.clone());
                try_outcome!(
                    self.cascade(
                        cx,
                        CascadingAction::Merge,
                        CascadePoint::BeforeMerge,
                        source.clone(),
                        context
                    )
                    .await
                );
                return Outcome::Ok(source);
            }

            let id = source.id();
            let unsaved_version =
                persister.is_versioned() && source.version().is_none_or(|v| v.is_null());
            let transient = unsaved_version || (persister.id_generation().is_generated() && id.is_null());
            if transient {
                return self.merge_transient(cx, source, persister, context).await;
            }

            let managed = try_outcome!(self.managed_instance(cx, &persister, id.clone()).await);
            let Some(managed) = managed else {
                if persister.is_versioned() {
                    return Outcome::Err(Error::stale_state(persister.name(), &id));
                }
                tracing::debug!(entity = ?source, "No row for detached instance, merging as new");
                return self.merge_transient(cx, source, persister, context).await;
            };
            if self
                .context
                .entry(&managed)
                .is_some_and(|entry| entry.status.is_deleted_or_gone())
            {
                return Outcome::Err(Error::IllegalArgument(format!(
                    "merging into a removed instance {:?}",
                    managed
                )));
            }
            if persister.is_versioned() {
                let detached = source.version().unwrap_or(Value::Null);
                let current = managed.version().unwrap_or(Value::Null);
                if !detached.same_identifier(&current) {
                    return Outcome::Err(Error::stale_state(persister.name(), &id));
                }
            }
            context.record_copy(&source, managed.clone());
            try_outcome!(self.copy_values(cx, &source, &managed, &persister, false, context).await);
            tracing::debug!(entity = ?managed, "Merged detached state");
            Outcome::Ok(managed)
        })
    }

    /// The managed instance for `(persister, id)`, loading it when necessary.
    async fn managed_instance(
        &mut self,
        cx: &Cx,
        persister: &Arc<EntityPersister>,
        id: Value,
    ) -> Outcome<Option<Entity>, Error> {
        let key = EntityKey::of(persister, id.clone());
        if let Some(registered) = self.context.entity(&key).cloned() {
            if registered.is_initialized() {
                return Outcome::Ok(Some(registered));
            }
            let ids = self
                .context
                .entity_batch(&key, self.factory.batch_fetch_size(persister.batch_size()));
            try_outcome!(
                self.load_entities(cx, Arc::clone(persister), ids, LockMode::None, false)
                    .await
            );
            return Outcome::Ok(Some(registered).filter(Entity::is_initialized));
        }
        let loaded = try_outcome!(
            self.load_entities(cx, Arc::clone(persister), vec![id.clone()], LockMode::None, false)
                .await
        );
        Outcome::Ok(loaded.into_iter().find(|e| e.id().same_identifier(&id)))
    }

    async fn merge_transient(
        &mut self,
        cx: &Cx,
        source: Entity,
        persister: Arc<EntityPersister>,
        context: &mut CascadeContext,
    ) -> Outcome<Entity, Error> {
        let copy = Entity::new(Arc::clone(&persister));
        if matches!(persister.id_generation(), IdGeneration::Assigned) {
            copy.set_id(source.id());
        }
        context.record_copy(&source, copy.clone());
        try_outcome!(self.copy_values(cx, &source, &copy, &persister, true, context).await);
        let mut persist_context = CascadeContext::new();
        try_outcome!(self.persist_inner(cx, copy.clone(), &mut persist_context).await);
        tracing::debug!(entity = ?copy, "Merged transient state into a new instance");
        Outcome::Ok(copy)
    }

    /// Copy property values from `source` onto `target`, replacing associated instances with
    /// their managed counterparts.
    async fn copy_values(
        &mut self,
        cx: &Cx,
        source: &Entity,
        target: &Entity,
        persister: &EntityPersister,
        include_version: bool,
        context: &mut CascadeContext,
    ) -> Outcome<(), Error> {
        let version_index = persister.version_index();
        for (index, property) in persister.properties().iter().enumerate() {
            let cascade = property.cascade.contains(CascadeStyle::MERGE);
            let value = match try_result!(source.property(index)) {
                PropertyValue::Basic(_) if !include_version && Some(index) == version_index => {
                    continue;
                }
                PropertyValue::Basic(value) => PropertyValue::Basic(value),
                PropertyValue::ToOne(None) => PropertyValue::ToOne(None),
                PropertyValue::ToOne(Some(associated)) => PropertyValue::ToOne(Some(try_outcome!(
                    self.merge_target(cx, associated, cascade, context).await
                ))),
                PropertyValue::Collection(collection) => {
                    if !collection.is_initialized() {
                        continue;
                    }
                    let mut elements = Vec::new();
                    for element in try_result!(collection.elements()) {
                        let merged = try_outcome!(self.merge_target(cx, element, cascade, context).await);
                        if !elements.iter().any(|e: &Entity| e.ptr_eq(&merged)) {
                            elements.push(merged);
                        }
                    }
                    let PropertyValue::Collection(existing) = try_result!(target.property(index)) else {
                        continue;
                    };
                    if !existing.is_initialized() {
                        try_outcome!(self.initialize_collection(cx, existing.clone()).await);
                    }
                    try_result!(existing.clear());
                    for element in elements {
                        try_result!(existing.push(element));
                    }
                    continue;
                }
            };
            try_result!(target.set_property(index, value));
        }
        Outcome::Ok(())
    }

    /// Managed counterpart of an associated instance.
    async fn merge_target(
        &mut self,
        cx: &Cx,
        associated: Entity,
        cascade: bool,
        context: &mut CascadeContext,
    ) -> Outcome<Entity, Error> {
        if cascade {
            return self.merge_inner(cx, associated, context).await;
        }
        if let Some(copy) = context.copy_of(&associated) {
            return Outcome::Ok(copy.clone());
        }
        if self
            .context
            .entry(&associated)
            .is_some_and(|entry| entry.status != EntityStatus::Gone)
        {
            return Outcome::Ok(associated);
        }
        let id = associated.id();
        if id.is_null() {
            // Reaching a transient instance without cascade fails at flush.
            return Outcome::Ok(associated);
        }
        let (reference, _) = try_result!(resolve_reference(
            &mut self.context,
            &self.factory,
            &associated.entity_name(),
            id,
            true
        ));
        Outcome::Ok(reference)
    }
}
