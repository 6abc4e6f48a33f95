//! Persist: make a transient instance managed and schedule its insert.

use crate::action::{Action, EntityInsertAction};
use crate::cascade::{CascadeContext, CascadePoint, CascadingAction};
use crate::context::{EntityEntry, EntityKey, EntityStatus};
use crate::listener::EventType;
use crate::{BoxFuture, Session};
use asupersync::{Cx, Outcome};
use std::sync::Arc;
use unitflow_core::{
    ConfigError, Connection, Entity, EntityPersister, Error, IdGeneration, Value, try_outcome,
    try_result,
};

/// How persist sees an instance without an entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Unmanaged {
    Transient,
    Detached,
}

/// Classify an untracked instance from its identifier and version alone.
fn classify(entity: &Entity, persister: &EntityPersister) -> Result<Unmanaged, Error> {
    let id = entity.id();
    let unsaved_version = persister.is_versioned() && entity.version().is_none_or(|v| v.is_null());
    match persister.id_generation() {
        IdGeneration::Assigned => {
            if id.is_null() {
                return Err(Error::IllegalArgument(format!(
                    "identifier of {} must be assigned before persist",
                    persister.name()
                )));
            }
            if persister.is_versioned() && !unsaved_version {
                Ok(Unmanaged::Detached)
            } else {
                Ok(Unmanaged::Transient)
            }
        }
        IdGeneration::Identity | IdGeneration::Sequence { .. } => {
            if id.is_null() || unsaved_version {
                Ok(Unmanaged::Transient)
            } else {
                Ok(Unmanaged::Detached)
            }
        }
    }
}

impl<C: Connection> Session<C> {
    /// Make `entity` managed; its insert runs at the next flush.
    ///
    /// Cascades along associations mapped with `PERSIST`. Identity-generated instances are
    /// inserted immediately so their key is known.
    #[tracing::instrument(level = "debug", skip(self, cx, entity), fields(entity = ?entity))]
    pub async fn persist(&mut self, cx: &Cx, entity: &Entity) -> Outcome<(), Error> {
        try_result!(self.ensure_usable());
        let mut context = CascadeContext::new();
        self.persist_inner(cx, entity.clone(), &mut context).await
    }

    pub(crate) fn persist_inner<'a>(
        &'a mut self,
        cx: &'a Cx,
        entity: Entity,
        context: &'a mut CascadeContext,
    ) -> BoxFuture<'a, ()> {
        Box::pin(async move {
            // References are persistent by construction.
            if !entity.is_initialized() {
                return Outcome::Ok(());
            }
            if !context.visit(&entity) {
                return Outcome::Ok(());
            }
            match self.context.entry(&entity).map(|entry| entry.status) {
                Some(EntityStatus::Deleted) => {
                    self.actions.unschedule_deletion(&entity);
                    let persister = entity.persister();
                    if let Some(entry) = self.context.entry_mut(&entity) {
                        entry.status = EntityStatus::Managed;
                        entry.deleted_state = None;
                    }
                    self.context
                        .remove_nullifiable(&EntityKey::of(&persister, entity.id()));
                    tracing::debug!(entity = ?entity, "Deletion un-scheduled");
                    return self
                        .cascade(cx, CascadingAction::Persist, CascadePoint::BeforeFlush, entity, context)
                        .await;
                }
                Some(EntityStatus::Gone) => {
                    return Outcome::Err(Error::IllegalArgument(format!(
                        "cannot persist a deleted instance {:?}",
                        entity
                    )));
                }
                Some(_) => {
                    return self
                        .cascade(cx, CascadingAction::Persist, CascadePoint::BeforeFlush, entity, context)
                        .await;
                }
                None => {}
            }

            let persister = entity.persister();
            if try_result!(classify(&entity, &persister)) == Unmanaged::Detached {
                return Outcome::Err(Error::IllegalArgument(format!(
                    "detached instance passed to persist: {:?}",
                    entity
                )));
            }
            self.save_transient(cx, entity, persister, context).await
        })
    }

    async fn save_transient(
        &mut self,
        cx: &Cx,
        entity: Entity,
        persister: Arc<EntityPersister>,
        context: &mut CascadeContext,
    ) -> Outcome<(), Error> {
        try_result!(self.factory.listeners().fire(EventType::PrePersist, &entity));

        let id = match persister.id_generation() {
            IdGeneration::Assigned => entity.id(),
            IdGeneration::Identity => Value::Null,
            IdGeneration::Sequence {
                name,
                allocation_size,
            } => try_outcome!(self.next_sequence_value(cx, name, *allocation_size).await),
        };
        if !id.is_null() {
            entity.set_id(id.clone());
            let key = EntityKey::of(&persister, id.clone());
            if self
                .context
                .entity(&key)
                .is_some_and(|existing| !existing.ptr_eq(&entity))
            {
                return Outcome::Err(Error::NonUniqueObject {
                    entity: persister.name().to_string(),
                    id: id.to_string(),
                });
            }
        }
        if let Some(interceptor) = self.factory.interceptor() {
            try_result!(interceptor.on_persist(&entity));
        }

        try_outcome!(
            self.cascade(
                cx,
                CascadingAction::Persist,
                CascadePoint::BeforeInsertAfterDelete,
                entity.clone(),
                context
            )
            .await
        );

        if persister.is_versioned() {
            if let Some(version) = entity.version().filter(Value::is_null) {
                try_result!(entity.set_version(version.seed_version()));
            }
        }
        let mut entry = EntityEntry::new(
            entity.clone(),
            Arc::clone(&persister),
            id.clone(),
            EntityStatus::Saving,
        );
        entry.loaded_state = Some(try_result!(entity.snapshot()));
        entry.version = entity.version();
        try_result!(self.context.add_entry(entry));
        tracing::debug!(entity = ?entity, "Scheduled for insert");

        let identity = matches!(persister.id_generation(), IdGeneration::Identity);
        let action = EntityInsertAction {
            entity: entity.clone(),
            persister,
            id,
        };
        if identity {
            self.actions.add_action(Action::IdentityInsert(action));
            try_outcome!(self.begin_if_needed(cx).await);
            try_outcome!(self.execute_inserts(cx).await);
        } else {
            self.actions.add_action(Action::Insert(action));
        }

        self.cascade(
            cx,
            CascadingAction::Persist,
            CascadePoint::AfterInsertBeforeDelete,
            entity,
            context,
        )
        .await
    }

    /// Next value of `sequence`, from the factory's pooled block or a fresh block.
    async fn next_sequence_value(
        &mut self,
        cx: &Cx,
        sequence: &str,
        allocation_size: u32,
    ) -> Outcome<Value, Error> {
        if let Some(id) = self.factory.next_pooled_id(sequence) {
            return Outcome::Ok(id);
        }
        let dialect = self.connection.dialect();
        let Some(sql) = dialect.sequence_next_value(sequence) else {
            return Outcome::Err(Error::Config(ConfigError {
                message: format!("dialect {:?} does not support sequence {}", dialect, sequence),
                source: None,
            }));
        };
        let row = try_outcome!(self.select_first(cx, &sql, &[], "sequence next value").await);
        let Some(first) = row.and_then(|r| r.get(0).and_then(Value::as_i64)) else {
            return Outcome::Err(Error::Assertion(format!(
                "sequence {} returned no value",
                sequence
            )));
        };
        tracing::debug!(sequence, first, allocation_size, "Sequence block reserved");
        Outcome::Ok(self.factory.install_block(sequence, first, allocation_size))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use unitflow_core::{EntityMetadata, Metamodel, PropertyMapping};

    fn persister(generation: IdGeneration, versioned: bool) -> Arc<EntityPersister> {
        let mut metadata = EntityMetadata::new("Pig", "pig")
            .id_generation(generation)
            .property(PropertyMapping::basic("name", "name"));
        if versioned {
            metadata = metadata.version("version", "version");
        }
        Metamodel::builder()
            .entity(metadata)
            .build()
            .unwrap()
            .persister("Pig")
            .unwrap()
    }

    #[test]
    fn generated_ids_classify_by_identifier() {
        let p = persister(IdGeneration::Identity, false);
        let pig = Entity::new(Arc::clone(&p));
        assert_eq!(classify(&pig, &p).unwrap(), Unmanaged::Transient);
        pig.set_id(7_i64);
        assert_eq!(classify(&pig, &p).unwrap(), Unmanaged::Detached);
    }

    #[test]
    fn assigned_ids_classify_by_version() {
        let p = persister(IdGeneration::Assigned, true);
        let pig = Entity::new(Arc::clone(&p));
        assert!(matches!(classify(&pig, &p), Err(Error::IllegalArgument(_))));
        pig.set_id(5_i64);
        assert_eq!(classify(&pig, &p).unwrap(), Unmanaged::Transient);
        pig.set_version(Value::Int(3)).unwrap();
        assert_eq!(classify(&pig, &p).unwrap(), Unmanaged::Detached);
    }
}
