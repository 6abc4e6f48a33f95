//! Load: find by identifier, references and explicit fetches.

use crate::context::EntityKey;
use crate::loader::resolve_reference;
use crate::Session;
use asupersync::{Cx, Outcome};
use unitflow_core::{
    Connection, Entity, EntityPersister, Error, LockMode, PersistentCollection, Result, Value,
    try_outcome, try_result,
};

/// Is an instance of `actual` also an instance of `requested`?
fn is_instance_of(actual: &EntityPersister, requested: &EntityPersister) -> bool {
    actual.name() == requested.name()
        || requested
            .subclasses()
            .iter()
            .any(|subclass| subclass == actual.name())
}

impl<C: Connection> Session<C> {
    /// Instance of `entity_name` with identifier `id`, or `None` when no row exists.
    ///
    /// The persistence context is consulted first; a removed instance is reported as absent.
    pub async fn find(
        &mut self,
        cx: &Cx,
        entity_name: &str,
        id: impl Into<Value>,
    ) -> Outcome<Option<Entity>, Error> {
        self.find_with_lock(cx, entity_name, id.into(), LockMode::None)
            .await
    }

    #[tracing::instrument(level = "debug", skip(self, cx))]
    pub async fn find_with_lock(
        &mut self,
        cx: &Cx,
        entity_name: &str,
        id: Value,
        lock: LockMode,
    ) -> Outcome<Option<Entity>, Error> {
        try_result!(self.ensure_usable());
        let persister = try_result!(self.factory.persister(entity_name));
        if id.is_null() {
            return Outcome::Err(Error::IllegalArgument(format!(
                "null identifier passed to find {}",
                entity_name
            )));
        }
        let key = EntityKey::of(&persister, id.clone());
        if self.context.is_deleted_unloaded(&key) {
            return Outcome::Ok(None);
        }

        if let Some(existing) = self.context.entity(&key).cloned() {
            if !is_instance_of(&existing.persister(), &persister) {
                return Outcome::Ok(None);
            }
            if let Some(status) = self.context.entry(&existing).map(|entry| entry.status) {
                if status.is_deleted_or_gone() {
                    return Outcome::Ok(None);
                }
                if lock != LockMode::None {
                    try_outcome!(self.acquire_lock(cx, &existing, lock).await);
                }
                tracing::trace!(entity = %key, "Found in the persistence context");
                return Outcome::Ok(Some(existing));
            }
        }

        if lock.is_pessimistic() {
            try_outcome!(self.begin_if_needed(cx).await);
        }
        let ids = if lock == LockMode::None {
            let max = self.factory.batch_fetch_size(persister.batch_size());
            self.context.entity_batch(&key, max)
        } else {
            vec![id.clone()]
        };
        let loaded = try_outcome!(
            self.load_entities(cx, persister.clone(), ids, lock, false)
                .await
        );
        let found = loaded
            .into_iter()
            .find(|e| e.id().same_identifier(&id) && is_instance_of(&e.persister(), &persister));
        if let Some(entity) = &found {
            if lock.is_optimistic() {
                try_outcome!(self.acquire_lock(cx, entity, lock).await);
            }
        }
        Outcome::Ok(found)
    }

    /// Reference to the instance with identifier `id`, without hitting the database.
    ///
    /// Returns the managed instance when there is one; otherwise an uninitialized reference is
    /// registered and loaded on first [`Session::fetch`].
    pub fn get_reference(&mut self, entity_name: &str, id: impl Into<Value>) -> Result<Entity> {
        self.ensure_open()?;
        let id = id.into();
        if id.is_null() {
            return Err(Error::IllegalArgument(format!(
                "null identifier passed to get_reference {}",
                entity_name
            )));
        }
        let (reference, _) = resolve_reference(&mut self.context, &self.factory, entity_name, id, true)?;
        Ok(reference)
    }

    /// Initialize a reference (and the queued references of its type).
    pub async fn fetch(&mut self, cx: &Cx, entity: &Entity) -> Outcome<Entity, Error> {
        try_result!(self.ensure_open());
        try_outcome!(self.initialize_reference(cx, entity.clone()).await);
        Outcome::Ok(entity.clone())
    }

    /// Initialize a lazy collection (and the queued collections of its role).
    pub async fn fetch_collection(
        &mut self,
        cx: &Cx,
        collection: &PersistentCollection,
    ) -> Outcome<(), Error> {
        try_result!(self.ensure_open());
        self.initialize_collection(cx, collection.clone()).await
    }
}
