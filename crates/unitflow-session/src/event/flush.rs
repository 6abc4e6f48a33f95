//! Flush and auto-flush.
//!
//! A flush runs in three steps:
//!
//! 1. **Prepare**: cascade persist from managed instances, delete orphans, dirty-check every
//!    managed instance and diff every collection into actions. Preparing never changes loaded
//!    state, so an auto-flush can discard what it prepared.
//! 2. **Execute**: drain the action queue.
//! 3. **Post-flush**: drop gone entries and unreached collections, re-snapshot collections.

use crate::action::{
    Action, CollectionRecreateAction, CollectionRemoveAction, CollectionUpdateAction,
    EntityUpdateAction,
};
use crate::cascade::{CascadeContext, CascadePoint, CascadingAction};
use crate::config::FlushMode;
use crate::context::{CollectionEntry, EntityStatus};
use crate::{Session, SessionEvent};
use asupersync::{Cx, Outcome};
use std::sync::Arc;
use unitflow_core::{
    Connection, Entity, EntityPersister, Error, PersistentCollection, PropertyKind, PropertyValue,
    Result, Value, try_outcome, try_result,
};

/// Elements of `current` absent from `other`, by reference identity.
fn missing_from(current: &[Entity], other: &[Entity]) -> Vec<Entity> {
    current
        .iter()
        .filter(|e| !other.iter().any(|o| o.ptr_eq(e)))
        .cloned()
        .collect()
}

/// Indices of the properties whose snapshot values differ, skipping the version and
/// collection properties.
fn dirty_properties(persister: &EntityPersister, loaded: &[Value], current: &[Value]) -> Vec<usize> {
    let version_index = persister.version_index();
    (0..current.len().min(loaded.len()))
        .filter(|&i| Some(i) != version_index)
        .filter(|&i| !persister.property(i).is_collection())
        .filter(|&i| !current[i].same_identifier(&loaded[i]))
        .collect()
}

impl<C: Connection> Session<C> {
    /// Write every pending change to the database.
    ///
    /// A failure poisons the action queue: the session must then be discarded.
    #[tracing::instrument(level = "debug", skip(self, cx))]
    pub async fn flush(&mut self, cx: &Cx) -> Outcome<(), Error> {
        try_result!(self.ensure_usable());
        if let Err(e) = self.callbacks.fire(SessionEvent::BeforeFlush) {
            return Outcome::Err(e);
        }
        try_outcome!(self.begin_if_needed(cx).await);

        self.flushing = true;
        let outcome = self.flush_everything(cx).await;
        self.flushing = false;
        try_outcome!(outcome);

        if let Err(e) = self.callbacks.fire(SessionEvent::AfterFlush) {
            return Outcome::Err(e);
        }
        Outcome::Ok(())
    }

    async fn flush_everything(&mut self, cx: &Cx) -> Outcome<(), Error> {
        try_outcome!(self.prepare_flush(cx).await);
        let count = self.actions.len();
        try_outcome!(self.execute_actions(cx).await);
        self.post_flush();
        tracing::info!(
            actions = count,
            entities = self.context.entry_count(),
            collections = self.context.collection_count(),
            "Flushed"
        );
        Outcome::Ok(())
    }

    /// Flush before a query reading `spaces` if pending changes touch them.
    ///
    /// Empty `spaces` means the tables are unknown: any pending change triggers the flush.
    /// Returns whether a flush ran.
    pub(crate) async fn auto_flush(&mut self, cx: &Cx, spaces: &[String]) -> Outcome<bool, Error> {
        if self.config.flush_mode != FlushMode::Auto || self.flushing {
            return Outcome::Ok(false);
        }
        try_result!(self.ensure_usable());
        if self.context.entry_count() == 0 && !self.actions.has_pending() {
            return Outcome::Ok(false);
        }

        let checkpoint = self.actions.checkpoint();
        self.flushing = true;
        let prepared = self.prepare_flush(cx).await;
        if !matches!(prepared, Outcome::Ok(())) {
            self.flushing = false;
            try_outcome!(prepared);
        }
        let needed = if spaces.is_empty() {
            self.actions.has_pending()
        } else {
            self.actions.are_tables_to_be_updated(spaces)
        };
        if !needed {
            self.actions.truncate_to(checkpoint);
            self.flushing = false;
            tracing::trace!(?spaces, "Auto-flush not needed");
            return Outcome::Ok(false);
        }

        let outcome = match self.begin_if_needed(cx).await {
            Outcome::Ok(()) => self.execute_actions(cx).await,
            other => other,
        };
        self.flushing = false;
        try_outcome!(outcome);
        self.post_flush();
        tracing::debug!(?spaces, "Auto-flushed");
        Outcome::Ok(true)
    }

    // ========================================================================
    // Prepare
    // ========================================================================

    async fn prepare_flush(&mut self, cx: &Cx) -> Outcome<(), Error> {
        let mut context = CascadeContext::new();
        for entity in self.context.entities_in_order() {
            let cascades = self.context.entry(&entity).is_some_and(|entry| {
                matches!(
                    entry.status,
                    EntityStatus::Managed | EntityStatus::Saving | EntityStatus::ReadOnly
                )
            });
            if cascades && context.visit(&entity) {
                try_outcome!(
                    self.cascade(
                        cx,
                        CascadingAction::PersistOnFlush,
                        CascadePoint::BeforeFlush,
                        entity,
                        &mut context
                    )
                    .await
                );
            }
        }

        try_outcome!(self.remove_orphans(cx).await);

        for entity in self.context.entities_in_order() {
            try_result!(self.check_transient_references(&entity));
            try_result!(self.dirty_check(&entity));
        }
        try_result!(self.process_collections());
        Outcome::Ok(())
    }

    /// Delete elements removed from orphan-removal collections of managed owners.
    async fn remove_orphans(&mut self, cx: &Cx) -> Outcome<(), Error> {
        let mut orphans: Vec<Entity> = Vec::new();
        for entry in self.context.collection_entries() {
            if !entry.persister.cascade().has_orphan_delete() {
                continue;
            }
            let owner_managed = self
                .context
                .entry(&entry.owner)
                .is_some_and(|owner| owner.status == EntityStatus::Managed);
            if !owner_managed {
                continue;
            }
            let (Some(snapshot), Some(current)) =
                (entry.snapshot.as_ref(), entry.collection.loaded_elements())
            else {
                continue;
            };
            for orphan in missing_from(snapshot, &current) {
                if !orphans.iter().any(|o| o.ptr_eq(&orphan)) {
                    orphans.push(orphan);
                }
            }
        }
        for orphan in orphans {
            let managed = self
                .context
                .entry(&orphan)
                .is_some_and(|entry| matches!(entry.status, EntityStatus::Managed | EntityStatus::ReadOnly));
            if !managed {
                continue;
            }
            tracing::debug!(entity = ?orphan, "Deleting orphan");
            let mut context = CascadeContext::new();
            try_outcome!(self.delete_inner(cx, orphan, &mut context, true).await);
        }
        Outcome::Ok(())
    }

    /// A managed or saving instance must not reference an unsaved transient instance.
    fn check_transient_references(&self, entity: &Entity) -> Result<()> {
        let Some(entry) = self.context.entry(entity) else {
            return Ok(());
        };
        if !matches!(entry.status, EntityStatus::Managed | EntityStatus::Saving) {
            return Ok(());
        }
        let is_transient = |target: &Entity| {
            target.is_initialized() && self.context.entry(target).is_none() && target.id().is_null()
        };
        let persister = &entry.persister;
        for (index, property) in persister.properties().iter().enumerate() {
            match (&property.kind, entity.property(index)?) {
                (PropertyKind::ToOne { .. }, PropertyValue::ToOne(Some(target))) => {
                    if is_transient(&target) {
                        return Err(Error::TransientObject(format!(
                            "{:?}.{} references an unsaved transient instance of {}; save it first or cascade persist",
                            entity,
                            property.name,
                            target.entity_name()
                        )));
                    }
                }
                (PropertyKind::Collection(metadata), PropertyValue::Collection(collection))
                    if !metadata.inverse =>
                {
                    let Some(elements) = collection.loaded_elements() else {
                        continue;
                    };
                    if let Some(element) = elements.iter().find(|e| is_transient(e)) {
                        return Err(Error::TransientObject(format!(
                            "{:?}.{} contains an unsaved transient instance of {}; save it first or cascade persist",
                            entity,
                            property.name,
                            element.entity_name()
                        )));
                    }
                }
                _ => {}
            }
        }
        Ok(())
    }

    /// Schedule an update when a managed instance differs from its loaded state, or when a
    /// deleted instance's references were nulled.
    fn dirty_check(&mut self, entity: &Entity) -> Result<()> {
        let Some(entry) = self.context.entry(entity) else {
            return Ok(());
        };
        let persister = Arc::clone(&entry.persister);
        if !persister.is_mutable() {
            return Ok(());
        }
        let id = entry.id.clone();
        let previous_version = entry.version.clone().filter(|_| persister.is_versioned());
        let Some(loaded) = entry.loaded_state.clone() else {
            return Ok(());
        };

        let action = match entry.status {
            EntityStatus::Managed => {
                let current = entity.snapshot()?;
                if persister.has_natural_id() && !persister.is_natural_id_mutable() {
                    for &index in persister.natural_id_indices() {
                        if !current[index].same_identifier(&loaded[index]) {
                            return Err(Error::IllegalState(format!(
                                "immutable natural identifier of {:?} was altered from {} to {}",
                                entity, loaded[index], current[index]
                            )));
                        }
                    }
                }
                let dirty = dirty_properties(&persister, &loaded, &current);
                if dirty.is_empty() {
                    return Ok(());
                }
                if let Some(interceptor) = self.factory.interceptor() {
                    let names: Vec<&str> = dirty
                        .iter()
                        .map(|&i| persister.property(i).name.as_str())
                        .collect();
                    interceptor.on_flush_dirty(entity, &names)?;
                }
                let mut state = current;
                let next_version = match (persister.version_index(), &previous_version) {
                    (Some(index), previous) => {
                        let next = previous.clone().unwrap_or(Value::Null).next_version()?;
                        state[index] = next.clone();
                        Some(next)
                    }
                    (None, _) => None,
                };
                tracing::trace!(entity = ?entity, ?dirty, "Dirty");
                EntityUpdateAction {
                    entity: entity.clone(),
                    persister,
                    id,
                    state,
                    dirty,
                    previous_version,
                    next_version,
                }
            }
            EntityStatus::Deleted => {
                let Some(deleted) = entry.deleted_state.clone() else {
                    return Ok(());
                };
                let dirty = dirty_properties(&persister, &loaded, &deleted);
                if dirty.is_empty() {
                    return Ok(());
                }
                tracing::trace!(entity = ?entity, ?dirty, "Nulling references before delete");
                EntityUpdateAction {
                    entity: entity.clone(),
                    persister,
                    id,
                    state: deleted,
                    dirty,
                    next_version: previous_version.clone(),
                    previous_version,
                }
            }
            _ => return Ok(()),
        };
        self.actions.add_action(Action::Update(action));
        Ok(())
    }

    /// Mark the collections reachable from live owners and diff every collection into actions.
    fn process_collections(&mut self) -> Result<()> {
        for entry in self.context.collection_entries_mut() {
            entry.reached = false;
            entry.current_key = None;
        }

        for owner in self.context.entities_in_order() {
            let Some(entry) = self.context.entry(&owner) else {
                continue;
            };
            if !matches!(
                entry.status,
                EntityStatus::Managed | EntityStatus::Saving | EntityStatus::ReadOnly
            ) {
                continue;
            }
            let persister = Arc::clone(&entry.persister);
            if !persister.has_collections() {
                continue;
            }
            let key = owner.id();
            for (index, property) in persister.properties().iter().enumerate() {
                if !property.is_collection() {
                    continue;
                }
                let PropertyValue::Collection(collection) = owner.property(index)? else {
                    continue;
                };
                self.reach_collection(&owner, collection, key.clone())?;
            }
        }

        for collection in self.context.collections_in_order() {
            let Some(entry) = self.context.collection_entry(&collection) else {
                continue;
            };
            if entry.persister.is_inverse() {
                continue;
            }
            let actions = self.collection_actions(entry);
            for action in actions {
                self.actions.add_action(action);
            }
        }
        Ok(())
    }

    fn reach_collection(&mut self, owner: &Entity, collection: PersistentCollection, key: Value) -> Result<()> {
        if let Some(entry) = self.context.collection_entry_mut(&collection) {
            if entry.reached && !entry.owner.ptr_eq(owner) {
                return Err(Error::IllegalState(format!(
                    "found shared references to collection {}",
                    collection.role()
                )));
            }
            entry.reached = true;
            entry.current_key = Some(key);
            return Ok(());
        }
        let persister = self.factory.metamodel().collection(&collection.role())?;
        if collection.is_initialized() {
            collection.set_key(key.clone());
        }
        let mut entry = CollectionEntry::new_instance(collection, persister, owner.clone());
        entry.reached = true;
        entry.current_key = Some(key);
        self.context.add_collection(entry);
        Ok(())
    }

    /// Actions bringing the rows of one collection in line with its elements.
    fn collection_actions(&self, entry: &CollectionEntry) -> Vec<Action> {
        let persister = Arc::clone(&entry.persister);
        let collection = entry.collection.clone();
        let remove = |key: Value, cascade_delete_enabled: bool| {
            Action::CollectionRemove(CollectionRemoveAction {
                collection: collection.clone(),
                persister: Arc::clone(&persister),
                key,
                cascade_delete_enabled,
            })
        };
        let recreate = |key: Value, elements: Vec<Entity>| {
            Action::CollectionRecreate(CollectionRecreateAction {
                collection: collection.clone(),
                persister: Arc::clone(&persister),
                key,
                elements,
            })
        };

        if !entry.reached {
            let Some(loaded_key) = entry.loaded_key.clone() else {
                return Vec::new();
            };
            let owner_deleted = self
                .context
                .entry(&entry.owner)
                .is_none_or(|owner| owner.status.is_deleted_or_gone());
            let cascade_delete = persister.metadata.on_delete_cascade && owner_deleted;
            return vec![remove(loaded_key, cascade_delete)];
        }

        let Some(current_key) = entry.current_key.clone() else {
            return Vec::new();
        };
        let Some(elements) = collection.loaded_elements() else {
            return Vec::new();
        };
        match (&entry.loaded_key, &entry.snapshot) {
            (None, _) => {
                if elements.is_empty() {
                    Vec::new()
                } else {
                    vec![recreate(current_key, elements)]
                }
            }
            (Some(loaded_key), Some(snapshot)) if loaded_key.same_identifier(&current_key) => {
                let added = missing_from(&elements, snapshot);
                let removed = missing_from(snapshot, &elements);
                if added.is_empty() && removed.is_empty() {
                    return Vec::new();
                }
                vec![Action::CollectionUpdate(CollectionUpdateAction {
                    collection: collection.clone(),
                    persister: Arc::clone(&persister),
                    key: current_key,
                    added,
                    removed,
                })]
            }
            // Owner key changed, or no snapshot to diff against.
            (Some(loaded_key), _) => {
                let mut actions = vec![remove(loaded_key.clone(), false)];
                if !elements.is_empty() {
                    actions.push(recreate(current_key, elements));
                }
                actions
            }
        }
    }

    // ========================================================================
    // Post-flush
    // ========================================================================

    fn post_flush(&mut self) {
        let gone: Vec<Entity> = self
            .context
            .entries()
            .filter(|entry| entry.status == EntityStatus::Gone)
            .map(|entry| entry.entity.clone())
            .collect();
        for entity in &gone {
            self.context.remove_entry(entity);
        }

        for collection in self.context.collections_in_order() {
            let Some(entry) = self.context.collection_entry(&collection) else {
                continue;
            };
            if !entry.reached {
                self.context.remove_collection(&collection);
                continue;
            }
            let key = entry.current_key.clone();
            self.context.rekey_collection(&collection, key);
            if let Some(entry) = self.context.collection_entry_mut(&collection) {
                if let Some(elements) = collection.loaded_elements() {
                    entry.snapshot = Some(elements);
                }
                entry.reached = false;
                entry.current_key = None;
            }
        }
        self.context.clear_nullifiable();
    }
}
